// ABOUTME: Service wiring - builds the long-lived Services handle and runs the ingest loop
// ABOUTME: Each normalized change is audited, published to the bus and dispatched to sync pairs

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use event_log::server::TcpServerHandle;
use uuid::Uuid;

use crate::audit::{
    AppendOutcome, AuditBuilder, AuditPolicy, AuditStore, RecordSigner, SensitiveMatcher,
};
use crate::bus::{ChangeEnvelope, EventBus};
use crate::config::{AppConfig, Tunables};
use crate::context::OperationContext;
use crate::destination::{build_destination, DestinationWriter};
use crate::error::StoreError;
use crate::event::{ChangeEvent, SourceEngine};
use crate::metrics::MetricsReporter;
use crate::normalize::mongodb::MongoSource;
use crate::normalize::mysql::MysqlSource;
use crate::normalize::postgres::PostgresSource;
use crate::normalize::{ChangeSource, IntakeReceiver, KeyHints, NormalizedChange, Normalizer};
use crate::resilience::BreakerRegistry;
use crate::sync::{EngineSettings, SyncEngine, SyncLedger};

/// What happened on the audit side of one ingested change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Recorded(Uuid),
    /// Same id and checksum were already stored.
    Duplicate(Uuid),
    /// Excluded by the audit policy.
    Skipped,
    /// Could not be built or stored; counted and logged.
    Dropped(String),
    /// Stored record disagrees with the incoming one. The change is not replicated.
    IntegrityViolation(String),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event_id: String,
    pub audit: AuditOutcome,
    /// Bus offset of the published change, `None` when it was held back.
    pub offset: Option<i64>,
    /// Sync pairs the change was dispatched to.
    pub routed: usize,
}

/// Everything a running process shares, built once at start.
pub struct Services {
    pub config: AppConfig,
    pub tunables: Tunables,
    pub normalizer: Arc<Normalizer>,
    pub audit: Arc<AuditBuilder>,
    pub store: AuditStore,
    pub bus: Arc<EventBus>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<MetricsReporter>,
    pub engine: SyncEngine,
}

/// Register one `ChangeSource` per `[[sources]]` entry.
pub fn build_normalizer(config: &AppConfig) -> Normalizer {
    let mut normalizer = Normalizer::new();
    for source in &config.sources {
        let hints = KeyHints::new(source.primary_keys.clone());
        let adapter: Arc<dyn ChangeSource> = match source.engine {
            SourceEngine::Postgres => Arc::new(PostgresSource::new(&source.name, hints)),
            SourceEngine::Mysql => Arc::new(MysqlSource::new(&source.name, hints)),
            SourceEngine::Mongodb => Arc::new(MongoSource::new(&source.name, hints)),
        };
        normalizer.register(adapter);
    }
    normalizer
}

pub fn build_audit_builder(config: &AppConfig) -> Result<AuditBuilder> {
    let signer = match &config.audit.signing_key_env {
        Some(var) => {
            let signer = RecordSigner::from_env(var)?;
            if signer.is_none() {
                tracing::warn!(
                    "{} is not set; audit records will carry a checksum but no signature",
                    var
                );
            }
            signer
        }
        None => None,
    };
    let sensitive = match &config.audit.sensitive_fields {
        Some(fields) => SensitiveMatcher::new(fields.iter().cloned()),
        None => SensitiveMatcher::default(),
    };
    let policy = AuditPolicy::new(config.audit.tables.clone(), config.audit.operations.clone());
    Ok(AuditBuilder::new(policy, sensitive, signer))
}

impl Services {
    /// Build services with the destinations `[[destinations]]` describes.
    pub async fn from_config(config: AppConfig, tunables: Tunables) -> Result<Self> {
        let mut destinations = HashMap::new();
        for destination in &config.destinations {
            let writer = build_destination(destination)
                .with_context(|| format!("Failed to set up destination '{}'", destination.name))?;
            destinations.insert(destination.name.clone(), writer);
        }
        Self::start(config, tunables, destinations).await
    }

    /// Build services around already constructed destination writers.
    pub async fn start(
        config: AppConfig,
        tunables: Tunables,
        destinations: HashMap<String, Arc<dyn DestinationWriter>>,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsReporter::new(tunables.sync_lag_threshold_ms));
        let normalizer = Arc::new(build_normalizer(&config));
        let audit = Arc::new(build_audit_builder(&config)?);
        let store = AuditStore::open(&config.audit.store_path).with_context(|| {
            format!(
                "Failed to open audit store at {}",
                config.audit.store_path.display()
            )
        })?;
        let bus = Arc::new(EventBus::open(&config.bus.log_path, config.bus.partitions)?);
        let breakers = Arc::new(BreakerRegistry::new(tunables.breaker()));
        let registry = config.sync_registry()?;
        let ledger = SyncLedger::load_or_new(&config.runtime.ledger_path).await?;

        let settings = EngineSettings {
            retry_base_delay: tunables.retry_base_delay(),
            ..EngineSettings::default()
        };
        let engine = SyncEngine::start(
            &registry,
            &destinations,
            bus.clone(),
            breakers.clone(),
            metrics.clone(),
            ledger,
            settings,
        )
        .await?;

        tracing::info!(
            sources = config.sources.len(),
            destinations = destinations.len(),
            pairs = registry.len(),
            signing = audit.signing_enabled(),
            "services started"
        );

        Ok(Self {
            config,
            tunables,
            normalizer,
            audit,
            store,
            bus,
            breakers,
            metrics,
            engine,
        })
    }

    /// Audit one change, publish it on the bus and wake the sync pairs
    /// replicating its source. Never waits on a destination. Only a bus
    /// failure is returned as an error.
    pub async fn ingest(&self, change: NormalizedChange) -> Result<IngestOutcome> {
        let NormalizedChange { event, context } = change;
        let audit = self.audit_change(&event, &context).await;

        if let AuditOutcome::IntegrityViolation(_) = &audit {
            return Ok(IngestOutcome {
                event_id: event.event_id,
                audit,
                offset: None,
                routed: 0,
            });
        }

        let envelope = ChangeEnvelope { event, context };
        let delivery = self.bus.publish_change(&envelope)?;
        let routed = self.engine.dispatch(&delivery);
        tracing::debug!(
            event_id = %envelope.event.event_id,
            offset = delivery.offset,
            routed,
            "change ingested"
        );
        Ok(IngestOutcome {
            event_id: envelope.event.event_id,
            audit,
            offset: Some(delivery.offset),
            routed,
        })
    }

    async fn audit_change(
        &self,
        event: &ChangeEvent,
        context: &OperationContext,
    ) -> AuditOutcome {
        if !self.audit.policy().allows(event) {
            self.metrics.record_audit_skipped();
            return AuditOutcome::Skipped;
        }

        let record = match self.audit.build(event, context) {
            Ok(record) => record,
            Err(e) => {
                self.metrics.record_build_error();
                tracing::warn!(event_id = %event.event_id, error = %e, "dropping audit record");
                return AuditOutcome::Dropped(e.to_string());
            }
        };

        let store = self.store.clone();
        let to_store = record.clone();
        let appended = tokio::task::spawn_blocking(move || store.append(&to_store)).await;
        match appended {
            Ok(Ok(AppendOutcome::Inserted)) => {
                self.metrics
                    .record_audit(record.db_engine, &record.table_name, record.operation);
                if let Err(e) = self.bus.publish_audit(&record, context) {
                    tracing::warn!(audit_id = %record.id, "failed to publish audit record: {:#}", e);
                }
                AuditOutcome::Recorded(record.id)
            }
            Ok(Ok(AppendOutcome::Duplicate)) => AuditOutcome::Duplicate(record.id),
            Ok(Err(StoreError::Integrity(violation))) => {
                self.metrics.record_integrity_violation();
                tracing::error!(
                    event_id = %event.event_id,
                    audit_id = %record.id,
                    "INTEGRITY VIOLATION: {}",
                    violation
                );
                AuditOutcome::IntegrityViolation(violation.to_string())
            }
            Ok(Err(e)) => {
                self.metrics.record_store_error();
                tracing::error!(audit_id = %record.id, "failed to store audit record: {}", e);
                AuditOutcome::Dropped(e.to_string())
            }
            Err(e) => {
                self.metrics.record_store_error();
                tracing::error!(audit_id = %record.id, "audit append task failed: {}", e);
                AuditOutcome::Dropped(e.to_string())
            }
        }
    }

    /// Delete audit records past the retention window.
    pub async fn evict_expired(&self) -> Result<u64> {
        let store = self.store.clone();
        let days = self.tunables.audit_retention_days;
        let evicted = tokio::task::spawn_blocking(move || store.evict_expired(days, Utc::now()))
            .await
            .context("Eviction task failed")??;
        if evicted > 0 {
            tracing::info!(evicted, retention_days = days, "evicted expired audit records");
        }
        Ok(evicted)
    }

    /// Write the health file and persist the sync ledger.
    pub async fn checkpoint(&self) -> Result<()> {
        let report = self.metrics.health_report(self.breakers.snapshots());
        let path = self.config.runtime.health_path.clone();
        tokio::task::spawn_blocking(move || report.write_to(&path))
            .await
            .context("Health report task failed")??;
        self.engine.save_ledger(&self.config.runtime.ledger_path).await
    }

    fn spawn_feed(&self) -> Result<Option<TcpServerHandle>> {
        let Some(listen) = &self.config.bus.feed_listen else {
            return Ok(None);
        };
        let Some(token_env) = &self.config.bus.feed_token_env else {
            bail!("bus.feed_listen is set but bus.feed_token_env is not");
        };
        let token = std::env::var(token_env)
            .with_context(|| format!("Feed token variable {} is not set", token_env))?;
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("Invalid bus.feed_listen address '{}'", listen))?;
        let handle = TcpServerHandle::spawn(addr, self.config.bus.log_path.clone(), token)?;
        Ok(Some(handle))
    }

    /// Consume the intake until it closes or Ctrl+C arrives, then drain the
    /// sync workers and save state. Returns the final ledger.
    pub async fn run(self, mut intake: IntakeReceiver) -> Result<SyncLedger> {
        let feed = self.spawn_feed()?;
        let mut health = tokio::time::interval(Duration::from_secs(
            self.config.runtime.health_interval_secs.max(1),
        ));
        let mut retention = tokio::time::interval(Duration::from_secs(
            self.config.runtime.retention_interval_secs.max(1),
        ));
        let mut ingested = 0u64;

        loop {
            tokio::select! {
                change = intake.next() => {
                    let Some(change) = change else {
                        tracing::info!("intake closed");
                        break;
                    };
                    let event_id = change.event.event_id.clone();
                    match self.ingest(change).await {
                        Ok(_) => ingested += 1,
                        Err(e) => tracing::error!(event_id = %event_id, "failed to ingest change: {:#}", e),
                    }
                }
                _ = health.tick() => {
                    if let Err(e) = self.checkpoint().await {
                        tracing::warn!("checkpoint failed: {:#}", e);
                    }
                }
                _ = retention.tick() => {
                    if let Err(e) = self.evict_expired().await {
                        tracing::warn!("audit eviction failed: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }

        tracing::info!(ingested, "draining sync workers");
        let Services {
            config,
            engine,
            metrics,
            breakers,
            ..
        } = self;
        let ledger = engine.shutdown().await;
        ledger.save(&config.runtime.ledger_path).await?;
        metrics
            .health_report(breakers.snapshots())
            .write_to(&config.runtime.health_path)?;
        if let Some(feed) = feed {
            tokio::task::spawn_blocking(move || drop(feed))
                .await
                .context("Failed to stop event feed")?;
        }
        tracing::info!("stopped");
        Ok(ledger)
    }

    /// Drain the sync workers without running the intake loop.
    pub async fn shutdown(self) -> Result<SyncLedger> {
        let ledger = self.engine.shutdown().await;
        ledger.save(&self.config.runtime.ledger_path).await?;
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    #[test]
    fn test_normalizer_registers_each_source() {
        let config = AppConfig {
            sources: vec![
                SourceConfig {
                    name: "pg-main".to_string(),
                    engine: SourceEngine::Postgres,
                    primary_keys: HashMap::new(),
                },
                SourceConfig {
                    name: "docs".to_string(),
                    engine: SourceEngine::Mongodb,
                    primary_keys: HashMap::new(),
                },
            ],
            ..AppConfig::default()
        };
        let normalizer = build_normalizer(&config);
        assert_eq!(normalizer.engine_of("pg-main"), Some(SourceEngine::Postgres));
        assert_eq!(normalizer.engine_of("docs"), Some(SourceEngine::Mongodb));
        assert_eq!(normalizer.engine_of("nope"), None);
    }

    #[test]
    fn test_missing_signing_key_disables_signing() {
        let mut config = AppConfig::default();
        config.audit.signing_key_env = Some("AUDIT_SYNC_TEST_NO_SUCH_KEY".to_string());
        let builder = build_audit_builder(&config).unwrap();
        assert!(!builder.signing_enabled());
    }
}
