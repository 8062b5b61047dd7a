// ABOUTME: SyncConfig - one replication pair (source -> target) and its policies
// ABOUTME: SyncConfigRegistry enforces one active config per pair and expands bidirectional pairs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    Unidirectional,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    SourceWins,
    DestinationWins,
    TimestampWins,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "SOURCE_WINS",
            ConflictStrategy::DestinationWins => "DESTINATION_WINS",
            ConflictStrategy::TimestampWins => "TIMESTAMP_WINS",
            ConflictStrategy::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `source->target`, used as ledger key prefix, consumer name and metric label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
    pub fn new(source: &str, target: &str) -> Self {
        Self(format!("{}->{}", source, target))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_mode() -> SyncMode {
    SyncMode::Unidirectional
}

fn default_strategy() -> ConflictStrategy {
    ConflictStrategy::SourceWins
}

fn default_batch_size() -> u32 {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source_name: String,
    pub target_name: String,
    #[serde(default = "default_mode")]
    pub sync_mode: SyncMode,
    #[serde(default = "default_strategy")]
    pub conflict_resolution: ConflictStrategy,
    /// Changes a partition worker reads from the log per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Retries after the first attempt before a record is FAILED.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Optional include list of `table` or `schema.table` names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
}

impl SyncConfig {
    pub fn new(source_name: &str, target_name: &str, strategy: ConflictStrategy) -> Self {
        Self {
            source_name: source_name.to_string(),
            target_name: target_name.to_string(),
            sync_mode: SyncMode::Unidirectional,
            conflict_resolution: strategy,
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            tables: None,
        }
    }

    pub fn pair(&self) -> PairId {
        PairId::new(&self.source_name, &self.target_name)
    }

    /// Whether this pair replicates `table`.
    pub fn accepts(&self, schema: Option<&str>, table: &str) -> bool {
        let Some(tables) = &self.tables else {
            return true;
        };
        tables.iter().any(|entry| match entry.split_once('.') {
            Some((s, t)) => Some(s) == schema && t == table,
            None => entry == table,
        })
    }

    /// The target->source direction of a bidirectional pair.
    pub fn reversed(&self) -> Self {
        Self {
            source_name: self.target_name.clone(),
            target_name: self.source_name.clone(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_name.trim().is_empty() || self.target_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "sync.source_name/target_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.source_name == self.target_name {
            return Err(ConfigError::Invalid {
                field: format!("sync.{}", self.pair()),
                reason: "source and target must differ".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: format!("sync.{}.batch_size", self.pair()),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Read-only set of active pairs. Built once from configuration.
#[derive(Debug, Default)]
pub struct SyncConfigRegistry {
    configs: BTreeMap<PairId, Arc<SyncConfig>>,
}

impl SyncConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pair, plus its reverse for bidirectional configs. Nothing is
    /// registered when either direction already exists.
    pub fn register(&mut self, config: SyncConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut incoming = vec![config.clone()];
        if config.sync_mode == SyncMode::Bidirectional {
            incoming.push(config.reversed());
        }
        for candidate in &incoming {
            if self.configs.contains_key(&candidate.pair()) {
                return Err(ConfigError::DuplicatePair(candidate.pair().to_string()));
            }
        }
        for candidate in incoming {
            self.configs.insert(candidate.pair(), Arc::new(candidate));
        }
        Ok(())
    }

    pub fn get(&self, pair: &PairId) -> Option<Arc<SyncConfig>> {
        self.configs.get(pair).cloned()
    }

    /// Pairs replicating changes captured from `source_name`.
    pub fn for_source(&self, source_name: &str) -> Vec<Arc<SyncConfig>> {
        self.configs
            .values()
            .filter(|c| c.source_name == source_name)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SyncConfig>> {
        self.configs.values()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
