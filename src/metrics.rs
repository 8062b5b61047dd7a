// ABOUTME: Health and metrics reporter - counters, lag gauges and health snapshots
// ABOUTME: Emits through the metrics facade and keeps atomics so health works without a backend

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Operation, SourceEngine};
use crate::resilience::{BreakerSnapshot, BreakerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub intake_dropped: u64,
    pub normalization_errors: u64,
    pub audit_records: u64,
    pub audit_skipped: u64,
    pub audit_build_errors: u64,
    pub integrity_violations: u64,
    #[serde(default)]
    pub audit_store_errors: u64,
    pub sync_retries: u64,
    pub sync_conflicts: u64,
    pub sync_completed: u64,
    pub sync_failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairLag {
    pub last_ms: u64,
    pub max_ms: u64,
    pub completed: u64,
    pub alarm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub lag_threshold_ms: u64,
    /// Completed syncs per second since the previous report.
    pub throughput_per_sec: f64,
    pub counters: CounterSnapshot,
    pub lag: BTreeMap<String, PairLag>,
    pub breakers: Vec<BreakerSnapshot>,
}

impl HealthReport {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize health report")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move health report into {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read health report {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Health report {} is not valid JSON", path.display()))
    }
}

#[derive(Default)]
struct Counters {
    intake_dropped: AtomicU64,
    normalization_errors: AtomicU64,
    audit_records: AtomicU64,
    audit_skipped: AtomicU64,
    audit_build_errors: AtomicU64,
    integrity_violations: AtomicU64,
    audit_store_errors: AtomicU64,
    sync_retries: AtomicU64,
    sync_conflicts: AtomicU64,
    sync_completed: AtomicU64,
    sync_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct MetricsReporter {
    lag_threshold_ms: u64,
    counters: Counters,
    lag: Mutex<HashMap<String, PairLag>>,
    window: Mutex<(Instant, u64)>,
}

impl MetricsReporter {
    pub fn new(lag_threshold_ms: u64) -> Self {
        Self {
            lag_threshold_ms,
            counters: Counters::default(),
            lag: Mutex::new(HashMap::new()),
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn lag_threshold_ms(&self) -> u64 {
        self.lag_threshold_ms
    }

    pub fn record_intake_dropped(&self) {
        bump(&self.counters.intake_dropped);
        metrics::counter!("intake_dropped_total").increment(1);
    }

    pub fn record_normalization_error(&self, engine: Option<SourceEngine>) {
        bump(&self.counters.normalization_errors);
        let engine = engine.map(|e| e.as_str()).unwrap_or("unknown");
        metrics::counter!("normalization_errors_total", "engine" => engine).increment(1);
    }

    pub fn record_audit(&self, engine: SourceEngine, table: &str, operation: Operation) {
        bump(&self.counters.audit_records);
        metrics::counter!(
            "audit_operations_total",
            "engine" => engine.as_str(),
            "table" => table.to_string(),
            "operation" => operation.as_str()
        )
        .increment(1);
    }

    pub fn record_audit_skipped(&self) {
        bump(&self.counters.audit_skipped);
        metrics::counter!("audit_skipped_total").increment(1);
    }

    pub fn record_build_error(&self) {
        bump(&self.counters.audit_build_errors);
        metrics::counter!("audit_build_errors_total").increment(1);
    }

    pub fn record_integrity_violation(&self) {
        bump(&self.counters.integrity_violations);
        metrics::counter!("integrity_violations_total").increment(1);
    }

    pub fn record_store_error(&self) {
        bump(&self.counters.audit_store_errors);
        metrics::counter!("audit_store_errors_total").increment(1);
    }

    pub fn record_retry(&self, pair: &str) {
        bump(&self.counters.sync_retries);
        metrics::counter!("sync_retry_total", "pair" => pair.to_string()).increment(1);
    }

    pub fn record_conflict(&self, pair: &str) {
        bump(&self.counters.sync_conflicts);
        metrics::counter!("sync_conflict_total", "pair" => pair.to_string()).increment(1);
    }

    pub fn record_failed(&self, pair: &str) {
        bump(&self.counters.sync_failed);
        metrics::counter!("sync_failed_total", "pair" => pair.to_string()).increment(1);
    }

    /// Count a completion and observe its lag. Returns true when the lag is over threshold.
    pub fn record_completed(&self, pair: &str, lag_ms: u64) -> bool {
        bump(&self.counters.sync_completed);
        metrics::counter!("sync_completed_total", "pair" => pair.to_string()).increment(1);
        metrics::gauge!("sync_lag_ms", "pair" => pair.to_string()).set(lag_ms as f64);

        let alarm = lag_ms > self.lag_threshold_ms;
        let mut lag = self.lag.lock().unwrap_or_else(|p| p.into_inner());
        let entry = lag.entry(pair.to_string()).or_default();
        entry.last_ms = lag_ms;
        entry.max_ms = entry.max_ms.max(lag_ms);
        entry.completed += 1;
        entry.alarm = alarm;
        alarm
    }

    /// Completion by an operator decision; not a lag observation.
    pub fn record_resolved(&self, pair: &str) {
        bump(&self.counters.sync_completed);
        metrics::counter!("sync_completed_total", "pair" => pair.to_string()).increment(1);
    }

    /// True while the last observed lag for `pair` exceeds the threshold.
    pub fn lag_alarm(&self, pair: &str) -> bool {
        self.lag
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(pair)
            .map(|l| l.alarm)
            .unwrap_or(false)
    }

    pub fn snapshot_counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            intake_dropped: load(&c.intake_dropped),
            normalization_errors: load(&c.normalization_errors),
            audit_records: load(&c.audit_records),
            audit_skipped: load(&c.audit_skipped),
            audit_build_errors: load(&c.audit_build_errors),
            integrity_violations: load(&c.integrity_violations),
            audit_store_errors: load(&c.audit_store_errors),
            sync_retries: load(&c.sync_retries),
            sync_conflicts: load(&c.sync_conflicts),
            sync_completed: load(&c.sync_completed),
            sync_failed: load(&c.sync_failed),
        }
    }

    /// Build a report and start a new throughput window.
    pub fn health_report(&self, breakers: Vec<BreakerSnapshot>) -> HealthReport {
        let counters = self.snapshot_counters();
        let throughput_per_sec = {
            let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
            let elapsed = window.0.elapsed().as_secs_f64();
            let done = counters.sync_completed.saturating_sub(window.1);
            *window = (Instant::now(), counters.sync_completed);
            if elapsed > 0.0 {
                done as f64 / elapsed
            } else {
                0.0
            }
        };
        let lag: BTreeMap<String, PairLag> = self
            .lag
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(pair, lag)| (pair.clone(), lag.clone()))
            .collect();

        let status = if breakers.iter().any(|b| b.state == BreakerState::Open) {
            HealthStatus::Unhealthy
        } else if breakers.iter().any(|b| b.state == BreakerState::HalfOpen)
            || lag.values().any(|l| l.alarm)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            generated_at: Utc::now(),
            lag_threshold_ms: self.lag_threshold_ms,
            throughput_per_sec,
            counters,
            lag,
            breakers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(state: BreakerState) -> BreakerSnapshot {
        BreakerSnapshot {
            destination: "pg-replica".to_string(),
            state,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    #[test]
    fn test_lag_alarm_follows_last_observation() {
        let reporter = MetricsReporter::new(5000);
        assert!(!reporter.record_completed("pg->my", 1200));
        assert!(!reporter.lag_alarm("pg->my"));
        assert!(reporter.record_completed("pg->my", 7000));
        assert!(reporter.lag_alarm("pg->my"));
        reporter.record_completed("pg->my", 10);
        assert!(!reporter.lag_alarm("pg->my"));

        let report = reporter.health_report(vec![]);
        let lag = &report.lag["pg->my"];
        assert_eq!(lag.max_ms, 7000);
        assert_eq!(lag.completed, 3);
        assert_eq!(report.counters.sync_completed, 3);
    }

    #[test]
    fn test_status_reflects_breakers_and_lag() {
        let reporter = MetricsReporter::new(100);
        assert_eq!(
            reporter.health_report(vec![breaker(BreakerState::Closed)]).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            reporter.health_report(vec![breaker(BreakerState::HalfOpen)]).status,
            HealthStatus::Degraded
        );
        assert_eq!(
            reporter.health_report(vec![breaker(BreakerState::Open)]).status,
            HealthStatus::Unhealthy
        );
        reporter.record_completed("a->b", 500);
        assert_eq!(reporter.health_report(vec![]).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_counters_track_each_kind() {
        let reporter = MetricsReporter::new(100);
        reporter.record_intake_dropped();
        reporter.record_normalization_error(Some(SourceEngine::Mysql));
        reporter.record_normalization_error(None);
        reporter.record_audit(SourceEngine::Postgres, "orders", Operation::Insert);
        reporter.record_retry("a->b");
        reporter.record_conflict("a->b");
        reporter.record_failed("a->b");
        let counters = reporter.snapshot_counters();
        assert_eq!(counters.intake_dropped, 1);
        assert_eq!(counters.normalization_errors, 2);
        assert_eq!(counters.audit_records, 1);
        assert_eq!(counters.sync_retries, 1);
        assert_eq!(counters.sync_conflicts, 1);
        assert_eq!(counters.sync_failed, 1);
    }

    #[test]
    fn test_report_round_trips_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        let reporter = MetricsReporter::new(100);
        reporter.record_completed("a->b", 5);
        reporter
            .health_report(vec![breaker(BreakerState::Closed)])
            .write_to(&path)
            .unwrap();
        let read = HealthReport::read_from(&path).unwrap();
        assert_eq!(read.status, HealthStatus::Healthy);
        assert_eq!(read.lag["a->b"].last_ms, 5);
        assert_eq!(read.breakers.len(), 1);
    }
}
