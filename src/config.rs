// ABOUTME: Application configuration - TOML file plus environment-backed tunables
// ABOUTME: Validates sources, destinations and sync pairs before anything starts

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::{Operation, SourceEngine};
use crate::resilience::BreakerConfig;
use crate::sync::{SyncConfig, SyncConfigRegistry, SyncMode};
use crate::utils::{default_state_path, expand_home};

/// Operational knobs, each overridable from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Args)]
pub struct Tunables {
    /// Days an audit record is kept before eviction
    #[arg(long, env = "AUDIT_RETENTION_DAYS", default_value_t = 90)]
    pub audit_retention_days: u32,
    /// Base delay of the sync retry backoff, in milliseconds
    #[arg(long, env = "SYNC_RETRY_DELAY_MS", default_value_t = 1000)]
    pub sync_retry_delay_ms: u64,
    /// Replication lag above which an alarm is raised, in milliseconds
    #[arg(long, env = "SYNC_LAG_THRESHOLD_MS", default_value_t = 5000)]
    pub sync_lag_threshold_ms: u64,
    /// Consecutive destination failures that open the circuit breaker
    #[arg(long, env = "CIRCUIT_BREAKER_THRESHOLD", default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker waits before a trial call, in milliseconds
    #[arg(long, env = "CIRCUIT_BREAKER_TIMEOUT_MS", default_value_t = 30000)]
    pub circuit_breaker_timeout_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            audit_retention_days: 90,
            sync_retry_delay_ms: 1000,
            sync_lag_threshold_ms: 5000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 30000,
        }
    }
}

impl Tunables {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.circuit_breaker_threshold.max(1),
            open_timeout: Duration::from_millis(self.circuit_breaker_timeout_ms),
        }
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.sync_retry_delay_ms)
    }
}

fn default_audit_store() -> PathBuf {
    default_state_path("audit.db")
}

fn default_bus_log() -> PathBuf {
    default_state_path("events.db")
}

fn default_ledger() -> PathBuf {
    default_state_path("sync-ledger.json")
}

fn default_health_file() -> PathBuf {
    default_state_path("health.json")
}

fn default_partitions() -> u32 {
    8
}

fn default_intake_capacity() -> usize {
    10_000
}

fn default_health_interval() -> u64 {
    15
}

fn default_retention_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_store")]
    pub store_path: PathBuf,
    /// Environment variable holding the HMAC signing key; unset disables signing.
    #[serde(default)]
    pub signing_key_env: Option<String>,
    /// Replaces the built-in sensitive field vocabulary when set.
    #[serde(default)]
    pub sensitive_fields: Option<Vec<String>>,
    /// Only audit these tables (`table` or `schema.table`).
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default)]
    pub operations: Option<Vec<Operation>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            store_path: default_audit_store(),
            signing_key_env: None,
            sensitive_fields: None,
            tables: None,
            operations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_log")]
    pub log_path: PathBuf,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
    /// Serve the gateway feed on this address when set.
    #[serde(default)]
    pub feed_listen: Option<String>,
    /// Environment variable holding the feed bearer token.
    #[serde(default)]
    pub feed_token_env: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log_path: default_bus_log(),
            partitions: default_partitions(),
            intake_capacity: default_intake_capacity(),
            feed_listen: None,
            feed_token_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_ledger")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_health_file")]
    pub health_path: PathBuf,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger(),
            health_path: default_health_file(),
            health_interval_secs: default_health_interval(),
            retention_interval_secs: default_retention_interval(),
        }
    }
}

/// A capture source whose notifications this process normalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub engine: SourceEngine,
    /// Primary-key columns per table, used ahead of whatever the payload says.
    #[serde(default)]
    pub primary_keys: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
    #[serde(alias = "mongo")]
    Mongodb,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub engine: DestinationKind,
    #[serde(default)]
    pub url: Option<String>,
    /// Read the URL from this environment variable instead of the file.
    #[serde(default)]
    pub url_env: Option<String>,
    /// PostgreSQL schema for the mirror tables.
    #[serde(default)]
    pub schema: Option<String>,
    /// MongoDB database, when the URL does not name one.
    #[serde(default)]
    pub database: Option<String>,
}

impl DestinationConfig {
    pub fn url(&self) -> Result<String> {
        if let Some(var) = &self.url_env {
            return std::env::var(var).with_context(|| {
                format!(
                    "Destination '{}' reads its URL from {}, which is not set",
                    self.name, var
                )
            });
        }
        self.url
            .clone()
            .with_context(|| format!("Destination '{}' has no url or url_env", self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub sync: Vec<SyncConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.expand_paths();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.audit.store_path = expand_home(&self.audit.store_path);
        self.bus.log_path = expand_home(&self.bus.log_path);
        self.runtime.ledger_path = expand_home(&self.runtime.ledger_path);
        self.runtime.health_path = expand_home(&self.runtime.health_path);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.partitions == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.partitions".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut sources = HashSet::new();
        for source in &self.sources {
            if !sources.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "sources.name".to_string(),
                    reason: format!("duplicate source '{}'", source.name),
                });
            }
        }

        let mut destinations = HashSet::new();
        for destination in &self.destinations {
            if destination.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "destinations.name".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            if !destinations.insert(destination.name.as_str()) {
                return Err(ConfigError::DuplicateDestination(destination.name.clone()));
            }
            if destination.engine != DestinationKind::Memory
                && destination.url.is_none()
                && destination.url_env.is_none()
            {
                return Err(ConfigError::Invalid {
                    field: format!("destinations.{}.url", destination.name),
                    reason: "url or url_env is required".to_string(),
                });
            }
        }

        for sync in &self.sync {
            let pair = sync.pair().to_string();
            if !sources.contains(sync.source_name.as_str()) {
                return Err(ConfigError::Invalid {
                    field: format!("sync.{}.source_name", pair),
                    reason: format!("unknown source '{}'", sync.source_name),
                });
            }
            if !destinations.contains(sync.target_name.as_str()) {
                return Err(ConfigError::UnknownDestination(pair, sync.target_name.clone()));
            }
            if sync.sync_mode == SyncMode::Bidirectional {
                // The reverse direction writes back into the source and reads from the target.
                if !destinations.contains(sync.source_name.as_str()) {
                    return Err(ConfigError::UnknownDestination(
                        sync.reversed().pair().to_string(),
                        sync.source_name.clone(),
                    ));
                }
                if !sources.contains(sync.target_name.as_str()) {
                    return Err(ConfigError::Invalid {
                        field: format!("sync.{}.target_name", pair),
                        reason: format!(
                            "bidirectional pairs need '{}' configured as a source too",
                            sync.target_name
                        ),
                    });
                }
            }
        }

        self.sync_registry().map(|_| ())
    }

    pub fn sync_registry(&self) -> Result<SyncConfigRegistry, ConfigError> {
        let mut registry = SyncConfigRegistry::new();
        for sync in &self.sync {
            registry.register(sync.clone())?;
        }
        Ok(registry)
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }
}
