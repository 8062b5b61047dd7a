// ABOUTME: Sync engine - per-pair partition workers pulling changes from the durable log
// ABOUTME: Drives SyncRecords through conflict checks, retries with backoff and circuit breakers

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::config::{ConflictStrategy, PairId, SyncConfig, SyncConfigRegistry};
use super::record::{SyncLedger, SyncRecord, SyncStatus};
use super::resolver::{manual, resolve, VersionStamp, Winner};
use crate::bus::{ChangeEnvelope, Delivery, EventBus, KeyPartitioner, SyncEvent};
use crate::destination::{DestinationWriter, TargetRow, WriteRequest};
use crate::error::{ConfigError, DestinationError, TransitionError};
use crate::event::ChangeEvent;
use crate::metrics::MetricsReporter;
use crate::resilience::{BreakerRegistry, CircuitBreaker, RetryPolicy};

const LOG_READ_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Base of the exponential retry backoff (`SYNC_RETRY_DELAY_MS`).
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_secs(60),
            retry_jitter: 0.25,
        }
    }
}

/// Work item for a partition worker. `offset` is `None` for operator re-runs,
/// which have no log entry left to acknowledge.
#[derive(Debug, Clone)]
struct Work {
    offset: Option<i64>,
    envelope: ChangeEnvelope,
}

struct PairRuntime {
    pair: PairId,
    consumer: String,
    config: Arc<SyncConfig>,
    destination: Arc<dyn DestinationWriter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

struct PairHandle {
    runtime: Arc<PairRuntime>,
    /// Operator re-runs, one channel per partition worker.
    reruns: Vec<mpsc::UnboundedSender<Work>>,
}

enum ApplyOutcome {
    /// No divergence; the source image was written and verified.
    Applied,
    /// Divergence settled by the pair's strategy.
    Resolved { winner: Winner, applied: bool },
    /// MANUAL divergence, left for an operator.
    Deferred,
}

struct Shared {
    bus: Arc<EventBus>,
    ledger: Mutex<SyncLedger>,
    metrics: Arc<MetricsReporter>,
}

/// Partition workers read their pair's unacknowledged changes straight from the
/// bus, so the log is the only buffer and publishing never waits on a worker.
pub struct SyncEngine {
    shared: Arc<Shared>,
    partitioner: KeyPartitioner,
    pairs: BTreeMap<PairId, PairHandle>,
    /// Latest published offset; workers wake when it moves.
    head: watch::Sender<i64>,
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Consumer name a pair acknowledges bus entries under.
pub fn consumer_name(pair: &PairId) -> String {
    format!("sync:{}", pair)
}

impl SyncEngine {
    /// Spawn the workers for every registered pair. Each starts by draining
    /// whatever the durable log still holds unacknowledged for it.
    pub async fn start(
        registry: &SyncConfigRegistry,
        destinations: &HashMap<String, Arc<dyn DestinationWriter>>,
        bus: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<MetricsReporter>,
        ledger: SyncLedger,
        settings: EngineSettings,
    ) -> Result<Self> {
        let partitioner = bus.partitioner();
        let (shutdown, _) = broadcast::channel(1);
        let (head, _) = watch::channel(0i64);
        let shared = Arc::new(Shared {
            bus,
            ledger: Mutex::new(ledger),
            metrics,
        });

        let mut pairs = BTreeMap::new();
        let mut workers = Vec::new();
        for config in registry.iter() {
            let pair = config.pair();
            let destination = destinations.get(&config.target_name).cloned().ok_or_else(|| {
                ConfigError::UnknownDestination(pair.to_string(), config.target_name.clone())
            })?;
            let runtime = Arc::new(PairRuntime {
                consumer: consumer_name(&pair),
                pair: pair.clone(),
                config: config.clone(),
                breaker: breakers.get(destination.name()),
                destination,
                retry: RetryPolicy {
                    max_attempts: config.retry_attempts,
                    base_delay: settings.retry_base_delay,
                    max_delay: settings.retry_max_delay,
                    jitter: settings.retry_jitter,
                },
            });

            let mut reruns = Vec::with_capacity(partitioner.partitions() as usize);
            for partition in 0..partitioner.partitions() {
                let (tx, rx) = mpsc::unbounded_channel();
                reruns.push(tx);
                workers.push(tokio::spawn(run_partition(
                    shared.clone(),
                    runtime.clone(),
                    partition,
                    rx,
                    head.subscribe(),
                    shutdown.subscribe(),
                )));
            }
            tracing::info!(
                pair = %pair,
                strategy = %config.conflict_resolution,
                partitions = partitioner.partitions(),
                "sync pair started"
            );
            pairs.insert(pair, PairHandle { runtime, reruns });
        }

        let engine = Self {
            shared,
            partitioner,
            pairs,
            head,
            shutdown,
            workers,
        };
        engine.requeue_unlogged()?;
        Ok(engine)
    }

    /// Operator re-runs have no log entry; the ledger is their only trace. Hand
    /// unsettled records the log no longer holds back to their workers.
    fn requeue_unlogged(&self) -> Result<()> {
        for handle in self.pairs.values() {
            let runtime = &handle.runtime;
            let batch = runtime.config.batch_size.max(1) as usize;
            let mut after = 0;
            let mut logged = HashSet::new();
            loop {
                let deliveries = self
                    .shared
                    .bus
                    .pending_changes(&runtime.consumer, after, batch)
                    .with_context(|| format!("Failed to read pending changes for {}", runtime.pair))?;
                let Some(last) = deliveries.last() else { break };
                after = last.offset;
                logged.extend(deliveries.into_iter().map(|d| d.envelope.event.event_id));
            }

            let unsettled: Vec<ChangeEnvelope> = self
                .shared
                .ledger()
                .records()
                .filter(|r| r.pair == runtime.pair)
                .filter(|r| matches!(r.status, SyncStatus::Pending | SyncStatus::InProgress))
                .filter(|r| !logged.contains(r.event_id()))
                .map(|r| ChangeEnvelope {
                    event: r.event.clone(),
                    context: r.context.clone(),
                })
                .collect();
            if !unsettled.is_empty() {
                tracing::info!(pair = %runtime.pair, requeued = unsettled.len(), "requeued unsettled operator re-runs");
            }
            for envelope in unsettled {
                self.rerun(handle, envelope);
            }
            if !logged.is_empty() {
                tracing::info!(pair = %runtime.pair, pending = logged.len(), "replaying unacknowledged changes");
            }
        }
        Ok(())
    }

    fn rerun(&self, handle: &PairHandle, envelope: ChangeEnvelope) {
        let index = self.partitioner.partition(&envelope.event.partition_key()) as usize
            % handle.reruns.len();
        let work = Work {
            offset: None,
            envelope,
        };
        if handle.reruns[index].send(work).is_err() {
            tracing::warn!(pair = %handle.runtime.pair, "partition worker gone, re-run left in the ledger");
        }
    }

    /// Tell the workers a change was published. Never waits: each pair's
    /// workers pull it from the log at their own pace. Returns the number of
    /// pairs replicating the change's source.
    pub fn dispatch(&self, delivery: &Delivery) -> usize {
        let routed = self
            .pairs
            .values()
            .filter(|h| h.runtime.config.source_name == delivery.envelope.event.source_name)
            .count();
        if routed > 0 {
            self.head.send_replace(delivery.offset);
        }
        routed
    }

    pub fn pairs(&self) -> impl Iterator<Item = &PairId> {
        self.pairs.keys()
    }

    pub fn record(&self, pair: &PairId, event_id: &str) -> Option<SyncRecord> {
        self.shared.ledger().get(pair, event_id).cloned()
    }

    pub fn ledger(&self) -> SyncLedger {
        self.shared.ledger().clone()
    }

    pub async fn save_ledger(&self, path: &std::path::Path) -> Result<()> {
        let snapshot = self.ledger();
        snapshot.save(path).await
    }

    /// Operator decision for a CONFLICT(MANUAL) record.
    pub async fn resolve_manual(
        &self,
        pair: &PairId,
        event_id: &str,
        winner: Winner,
    ) -> Result<SyncRecord> {
        let handle = self
            .pairs
            .get(pair)
            .ok_or_else(|| anyhow!("unknown sync pair {}", pair))?;
        let mut record = self
            .record(pair, event_id)
            .ok_or_else(|| anyhow!("no sync record for {} on {}", event_id, pair))?;
        if record.status != SyncStatus::Conflict {
            bail!("sync record {} on {} is {}, not CONFLICT", event_id, pair, record.status);
        }

        let decision = manual(winner);
        if decision.apply {
            self.shared
                .attempt_apply(&handle.runtime, &record.event, true)
                .await
                .with_context(|| format!("Failed to apply source image for {}", event_id))?;
        }
        record.complete(lag_ms(&record.event))?;
        self.shared.metrics.record_resolved(pair.as_str());
        tracing::info!(pair = %pair, event_id, winner = ?winner, "conflict resolved by operator");
        self.shared.commit(&record);
        Ok(record)
    }

    /// Operator path out of FAILED: reset the record and run it again.
    pub async fn retry_failed(&self, pair: &PairId, event_id: &str) -> Result<()> {
        let handle = self
            .pairs
            .get(pair)
            .ok_or_else(|| anyhow!("unknown sync pair {}", pair))?;
        let mut record = self
            .record(pair, event_id)
            .ok_or_else(|| anyhow!("no sync record for {} on {}", event_id, pair))?;
        record.reset_for_retry()?;
        self.shared.commit(&record);
        let envelope = ChangeEnvelope {
            event: record.event.clone(),
            context: record.context.clone(),
        };
        self.rerun(handle, envelope);
        tracing::info!(pair = %pair, event_id, "failed sync re-queued by operator");
        Ok(())
    }

    /// Poll until the record leaves PENDING and IN_PROGRESS, or `timeout` passes.
    pub async fn wait_settled(
        &self,
        pair: &PairId,
        event_id: &str,
        timeout: Duration,
    ) -> Option<SyncRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.record(pair, event_id);
            let settled = record
                .as_ref()
                .map_or(true, |r| !matches!(r.status, SyncStatus::Pending | SyncStatus::InProgress));
            if settled || tokio::time::Instant::now() >= deadline {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop taking new work, let every worker settle the record in hand, and wait for them.
    pub async fn shutdown(self) -> SyncLedger {
        let _ = self.shutdown.send(());
        drop(self.pairs);
        for joined in futures::future::join_all(self.workers).await {
            if let Err(e) = joined {
                tracing::error!("sync worker panicked: {}", e);
            }
        }
        self.shared.ledger().clone()
    }
}

/// Report an illegal state transition. The record is left as it was and the
/// change stays unacknowledged for the next run.
fn transitioned(pair: &PairId, event_id: &str, result: Result<(), TransitionError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(pair = %pair, event_id, "illegal sync transition: {}", e);
            false
        }
    }
}

fn lag_ms(event: &ChangeEvent) -> u64 {
    (Utc::now() - event.source_timestamp)
        .num_milliseconds()
        .max(0) as u64
}

/// Sleep, unless shutdown is signalled first. Returns true on shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// True once shutdown was signalled, without waiting.
fn shutdown_signalled(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

/// Drain this partition's unacknowledged changes in offset order, then wait for
/// a new publish or an operator re-run.
async fn run_partition(
    shared: Arc<Shared>,
    runtime: Arc<PairRuntime>,
    partition: u32,
    mut reruns: mpsc::UnboundedReceiver<Work>,
    mut head: watch::Receiver<i64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(pair = %runtime.pair, partition, "partition worker started");
    let batch = runtime.config.batch_size.max(1) as usize;
    let mut cursor = 0i64;
    'worker: loop {
        while let Ok(work) = reruns.try_recv() {
            if shared.process(&runtime, work, &mut shutdown).await {
                break 'worker;
            }
        }

        // Mark the head seen before reading so a publish racing the read still wakes us.
        let _ = head.borrow_and_update();
        let deliveries = match shared
            .bus
            .pending_changes_in(&runtime.consumer, partition, cursor, batch)
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::error!(pair = %runtime.pair, partition, "failed to read pending changes: {:#}", e);
                if sleep_or_shutdown(LOG_READ_BACKOFF, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if deliveries.is_empty() {
            let rerun = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                work = reruns.recv() => match work {
                    Some(work) => Some(work),
                    None => break,
                },
                changed = head.changed() => match changed {
                    Ok(()) => None,
                    Err(_) => break,
                },
            };
            if let Some(work) = rerun {
                if shared.process(&runtime, work, &mut shutdown).await {
                    break;
                }
            }
            continue;
        }

        for delivery in deliveries {
            cursor = delivery.offset;
            if delivery.envelope.event.source_name != runtime.config.source_name {
                shared.ack(&runtime, Some(delivery.offset));
                continue;
            }
            let work = Work {
                offset: Some(delivery.offset),
                envelope: delivery.envelope,
            };
            if shared.process(&runtime, work, &mut shutdown).await || shutdown_signalled(&mut shutdown) {
                break 'worker;
            }
        }
    }
    tracing::debug!(pair = %runtime.pair, partition, "partition worker stopped");
}

impl Shared {
    fn ledger(&self) -> MutexGuard<'_, SyncLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the record and publish the transition.
    fn commit(&self, record: &SyncRecord) {
        self.ledger().put(record.clone());
        let event = SyncEvent {
            event_id: record.event_id().to_string(),
            pair: record.pair.clone(),
            status: record.status,
            attempt: record.attempt,
            lag_ms: record.detected_lag_ms,
            error: record.last_error.clone(),
            at: record.updated_at,
        };
        if let Err(e) = self
            .bus
            .publish_sync(&event, &record.event.partition_key(), &record.context)
        {
            tracing::error!(pair = %record.pair, event_id = %event.event_id, "failed to publish sync event: {:#}", e);
        }
    }

    fn ack(&self, runtime: &PairRuntime, offset: Option<i64>) {
        let Some(offset) = offset else { return };
        if let Err(e) = self.bus.ack(&runtime.consumer, offset) {
            tracing::error!(pair = %runtime.pair, offset, "failed to acknowledge change: {:#}", e);
        }
    }

    /// Handle one work item to a resting state. Returns true when shutdown was
    /// signalled while waiting; the record is then left PENDING and unacknowledged.
    async fn process(
        &self,
        runtime: &PairRuntime,
        work: Work,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let event = &work.envelope.event;
        let config = &runtime.config;

        if !config.accepts(event.schema.as_deref(), &event.table) {
            tracing::debug!(pair = %runtime.pair, table = %event.qualified_table(), "table not replicated by pair");
            self.ack(runtime, work.offset);
            return false;
        }
        if event.origin.as_deref() == Some(config.target_name.as_str()) {
            tracing::debug!(pair = %runtime.pair, event_id = %event.event_id, "skipping echo of our own write");
            self.ack(runtime, work.offset);
            return false;
        }

        let existing = self.ledger().get(&runtime.pair, &event.event_id).cloned();
        let mut record = match existing {
            Some(record) if record.status.is_terminal() || record.status == SyncStatus::Conflict => {
                tracing::debug!(
                    pair = %runtime.pair,
                    event_id = %event.event_id,
                    status = %record.status,
                    "redelivered change already settled"
                );
                self.ack(runtime, work.offset);
                return false;
            }
            Some(mut record) => {
                // Left IN_PROGRESS by a previous run that stopped mid-flight.
                if record.status == SyncStatus::InProgress {
                    transitioned(&runtime.pair, &event.event_id, record.release());
                }
                record
            }
            None => {
                let record = SyncRecord::new(
                    runtime.pair.clone(),
                    event.clone(),
                    work.envelope.context.clone(),
                );
                self.commit(&record);
                record
            }
        };

        loop {
            if !transitioned(&runtime.pair, &event.event_id, record.claim()) {
                return false;
            }
            self.commit(&record);

            match self.attempt_apply(runtime, event, false).await {
                Ok(ApplyOutcome::Applied) => {
                    self.finish(runtime, &mut record, work.offset);
                    return false;
                }
                Ok(ApplyOutcome::Resolved { winner, applied }) => {
                    if !transitioned(&runtime.pair, &event.event_id, record.conflict(config.conflict_resolution)) {
                        return false;
                    }
                    self.metrics.record_conflict(runtime.pair.as_str());
                    self.commit(&record);
                    tracing::info!(
                        pair = %runtime.pair,
                        event_id = %event.event_id,
                        strategy = %config.conflict_resolution,
                        winner = ?winner,
                        applied,
                        "conflict resolved"
                    );
                    self.finish(runtime, &mut record, work.offset);
                    return false;
                }
                Ok(ApplyOutcome::Deferred) => {
                    if !transitioned(&runtime.pair, &event.event_id, record.conflict(ConflictStrategy::Manual)) {
                        return false;
                    }
                    self.metrics.record_conflict(runtime.pair.as_str());
                    self.commit(&record);
                    tracing::warn!(
                        pair = %runtime.pair,
                        event_id = %event.event_id,
                        "conflict needs manual resolution"
                    );
                    self.ack(runtime, work.offset);
                    return false;
                }
                Err(DestinationError::CircuitOpen { retry_after, .. }) => {
                    if !transitioned(&runtime.pair, &event.event_id, record.release()) {
                        return false;
                    }
                    self.commit(&record);
                    tracing::debug!(pair = %runtime.pair, wait_ms = retry_after.as_millis() as u64, "circuit open, waiting");
                    if sleep_or_shutdown(retry_after, shutdown).await {
                        return true;
                    }
                }
                Err(e) if runtime.retry.should_retry(record.attempt) && e.is_retryable() => {
                    if !transitioned(&runtime.pair, &event.event_id, record.retry_later(&e)) {
                        return false;
                    }
                    self.metrics.record_retry(runtime.pair.as_str());
                    self.commit(&record);
                    let delay = runtime.retry.delay_for_attempt(record.attempt - 1);
                    tracing::warn!(
                        pair = %runtime.pair,
                        event_id = %event.event_id,
                        attempt = record.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "sync attempt failed, retrying: {}",
                        e
                    );
                    if sleep_or_shutdown(delay, shutdown).await {
                        return true;
                    }
                }
                Err(e) => {
                    if !transitioned(&runtime.pair, &event.event_id, record.fail(&e)) {
                        return false;
                    }
                    self.metrics.record_failed(runtime.pair.as_str());
                    self.commit(&record);
                    tracing::error!(
                        pair = %runtime.pair,
                        event_id = %event.event_id,
                        attempt = record.attempt,
                        "sync failed: {}",
                        e
                    );
                    self.ack(runtime, work.offset);
                    return false;
                }
            }
        }
    }

    fn finish(&self, runtime: &PairRuntime, record: &mut SyncRecord, offset: Option<i64>) {
        let lag = lag_ms(&record.event);
        if let Err(e) = record.complete(lag) {
            tracing::error!(pair = %runtime.pair, "{}", e);
            return;
        }
        if self.metrics.record_completed(runtime.pair.as_str(), lag) {
            tracing::warn!(
                pair = %runtime.pair,
                lag_ms = lag,
                threshold_ms = self.metrics.lag_threshold_ms(),
                "replication lag over threshold"
            );
        }
        self.commit(record);
        self.ack(runtime, offset);
    }

    /// One guarded attempt: a single breaker permit covers the conflict check,
    /// the write and the verification read.
    async fn attempt_apply(
        &self,
        runtime: &PairRuntime,
        event: &ChangeEvent,
        force: bool,
    ) -> Result<ApplyOutcome, DestinationError> {
        let permit = runtime.breaker.acquire()?;
        let result = self.apply(runtime, event, force).await;
        match &result {
            Ok(_) => permit.success(),
            Err(e) if e.is_retryable() => permit.failure(),
            Err(_) => drop(permit),
        }
        result
    }

    async fn apply(
        &self,
        runtime: &PairRuntime,
        event: &ChangeEvent,
        force: bool,
    ) -> Result<ApplyOutcome, DestinationError> {
        let destination = runtime.destination.as_ref();
        let row = TargetRow {
            schema: event.schema.clone(),
            table: event.table.clone(),
            key: event.primary_key.clone(),
        };

        if !force {
            if let Some(current) = destination.read_version(&row).await? {
                if current.written_at > event.source_timestamp {
                    let decision = resolve(
                        runtime.config.conflict_resolution,
                        &VersionStamp::at(event.source_timestamp),
                        &VersionStamp::at(current.written_at),
                    );
                    return match decision.winner {
                        None => Ok(ApplyOutcome::Deferred),
                        Some(winner) if !decision.apply => Ok(ApplyOutcome::Resolved {
                            winner,
                            applied: false,
                        }),
                        Some(winner) => {
                            write_and_verify(destination, &row, event).await?;
                            Ok(ApplyOutcome::Resolved {
                                winner,
                                applied: true,
                            })
                        }
                    };
                }
            }
        }
        write_and_verify(destination, &row, event).await?;
        Ok(ApplyOutcome::Applied)
    }
}

async fn write_and_verify(
    destination: &dyn DestinationWriter,
    row: &TargetRow,
    event: &ChangeEvent,
) -> Result<(), DestinationError> {
    match event.target_image() {
        Some(fields) => {
            destination
                .upsert(&WriteRequest {
                    row: row.clone(),
                    fields: fields.clone(),
                    source_engine: event.source_engine,
                    source_timestamp: event.source_timestamp,
                    origin: event.source_name.clone(),
                })
                .await?;
            match destination.read_version(row).await? {
                Some(version) if version.fields == *fields => Ok(()),
                Some(_) => Err(DestinationError::verification(
                    destination.name(),
                    format!("row {} differs from the written image", row.id()),
                )),
                None => Err(DestinationError::verification(
                    destination.name(),
                    format!("row {} missing after write", row.id()),
                )),
            }
        }
        None => {
            destination.delete(row).await?;
            match destination.read_version(row).await? {
                None => Ok(()),
                Some(_) => Err(DestinationError::verification(
                    destination.name(),
                    format!("row {} still present after delete", row.id()),
                )),
            }
        }
    }
}
