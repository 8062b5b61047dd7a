// ABOUTME: SyncRecord state machine (PENDING -> IN_PROGRESS -> COMPLETED/FAILED/CONFLICT)
// ABOUTME: SyncLedger keeps one record per pair and event, persisted as a JSON state file

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::config::{ConflictStrategy, PairId};
use crate::context::OperationContext;
use crate::error::TransitionError;
use crate::event::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Conflict => "CONFLICT",
        }
    }

    /// COMPLETED and FAILED; a redelivered event in one of these is acknowledged untouched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(SyncStatus::Pending),
            "IN_PROGRESS" => Ok(SyncStatus::InProgress),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "FAILED" => Ok(SyncStatus::Failed),
            "CONFLICT" => Ok(SyncStatus::Conflict),
            other => Err(format!("unknown sync status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub id: Uuid,
    pub pair: PairId,
    pub event: ChangeEvent,
    #[serde(default)]
    pub context: OperationContext,
    pub status: SyncStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub detected_lag_ms: Option<u64>,
    pub resolution: Option<ConflictStrategy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(pair: PairId, event: ChangeEvent, context: OperationContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            pair,
            event,
            context,
            status: SyncStatus::Pending,
            attempt: 0,
            last_error: None,
            detected_lag_ms: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    fn transition(&mut self, allowed: &[SyncStatus], to: SyncStatus) -> Result<(), TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Exclusive claim by the worker that owns the record's partition.
    pub fn claim(&mut self) -> Result<(), TransitionError> {
        self.transition(&[SyncStatus::Pending], SyncStatus::InProgress)
    }

    pub fn complete(&mut self, lag_ms: u64) -> Result<(), TransitionError> {
        self.transition(
            &[SyncStatus::InProgress, SyncStatus::Conflict],
            SyncStatus::Completed,
        )?;
        self.detected_lag_ms = Some(lag_ms);
        self.last_error = None;
        Ok(())
    }

    /// Back to PENDING after a failed attempt, with the attempt counted.
    pub fn retry_later(&mut self, error: impl ToString) -> Result<(), TransitionError> {
        self.transition(&[SyncStatus::InProgress], SyncStatus::Pending)?;
        self.attempt += 1;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Back to PENDING without consuming an attempt (breaker fast-fail, shutdown).
    pub fn release(&mut self) -> Result<(), TransitionError> {
        self.transition(&[SyncStatus::InProgress], SyncStatus::Pending)
    }

    pub fn conflict(&mut self, strategy: ConflictStrategy) -> Result<(), TransitionError> {
        self.transition(&[SyncStatus::InProgress], SyncStatus::Conflict)?;
        self.resolution = Some(strategy);
        Ok(())
    }

    pub fn fail(&mut self, error: impl ToString) -> Result<(), TransitionError> {
        self.transition(
            &[SyncStatus::InProgress, SyncStatus::Conflict],
            SyncStatus::Failed,
        )?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Operator path out of FAILED.
    pub fn reset_for_retry(&mut self) -> Result<(), TransitionError> {
        self.transition(&[SyncStatus::Failed], SyncStatus::Pending)?;
        self.attempt = 0;
        self.last_error = None;
        Ok(())
    }
}

/// All sync records, keyed by pair and event id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncLedger {
    pub version: u32,
    records: HashMap<String, SyncRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn ledger_key(pair: &PairId, event_id: &str) -> String {
    format!("{}/{}", pair, event_id)
}

impl SyncLedger {
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Self::default()
        }
    }

    pub fn get(&self, pair: &PairId, event_id: &str) -> Option<&SyncRecord> {
        self.records.get(&ledger_key(pair, event_id))
    }

    pub fn put(&mut self, record: SyncRecord) {
        self.records
            .insert(ledger_key(&record.pair, record.event_id()), record);
        self.updated_at = Some(Utc::now());
    }

    /// Records in `status`, oldest first.
    pub fn by_status(&self, status: SyncStatus) -> Vec<&SyncRecord> {
        let mut out: Vec<_> = self.records.values().filter(|r| r.status == status).collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn records(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of records per status, for status output.
    pub fn status_counts(&self) -> HashMap<SyncStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read sync ledger from {:?}", path))?;
        let ledger: SyncLedger = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync ledger from {:?}", path))?;
        Ok(ledger)
    }

    /// Load the ledger, or start an empty one when the file does not exist yet.
    pub async fn load_or_new(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::new())
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize sync ledger")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write sync ledger to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::update_parts;
    use serde_json::json;

    fn record() -> SyncRecord {
        let event = ChangeEvent::from_parts(update_parts(
            "products",
            42,
            json!({"price": 100}),
            json!({"price": 110}),
        ))
        .unwrap();
        SyncRecord::new(PairId::new("pg-main", "mysql-replica"), event, OperationContext::default())
    }

    #[test]
    fn test_happy_path() {
        let mut r = record();
        r.claim().unwrap();
        r.complete(250).unwrap();
        assert_eq!(r.status, SyncStatus::Completed);
        assert_eq!(r.detected_lag_ms, Some(250));
    }

    #[test]
    fn test_retry_counts_attempts() {
        let mut r = record();
        r.claim().unwrap();
        r.retry_later("connection refused").unwrap();
        assert_eq!(r.status, SyncStatus::Pending);
        assert_eq!(r.attempt, 1);
        assert_eq!(r.last_error.as_deref(), Some("connection refused"));

        r.claim().unwrap();
        r.release().unwrap();
        assert_eq!(r.attempt, 1);
    }

    #[test]
    fn test_illegal_transition_leaves_record_unchanged() {
        let mut r = record();
        let before = r.clone();
        let err = r.complete(10).unwrap_err();
        assert_eq!(err.from, "PENDING");
        assert_eq!(err.to, "COMPLETED");
        assert_eq!(r, before);

        r.claim().unwrap();
        r.complete(1).unwrap();
        assert!(r.claim().is_err());
        assert!(r.fail("late").is_err());
        assert_eq!(r.status, SyncStatus::Completed);
    }

    #[test]
    fn test_conflict_then_operator_resolution() {
        let mut r = record();
        r.claim().unwrap();
        r.conflict(ConflictStrategy::Manual).unwrap();
        assert!(r.claim().is_err());
        r.complete(0).unwrap();
        assert_eq!(r.resolution, Some(ConflictStrategy::Manual));
    }

    #[test]
    fn test_reset_only_from_failed() {
        let mut r = record();
        assert!(r.reset_for_retry().is_err());
        r.claim().unwrap();
        r.retry_later("x").unwrap();
        r.claim().unwrap();
        r.fail("gave up").unwrap();
        r.reset_for_retry().unwrap();
        assert_eq!(r.status, SyncStatus::Pending);
        assert_eq!(r.attempt, 0);
    }

    #[tokio::test]
    async fn test_ledger_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");

        let mut ledger = SyncLedger::new();
        let mut r = record();
        r.claim().unwrap();
        r.fail("rejected").unwrap();
        let pair = r.pair.clone();
        let event_id = r.event_id().to_string();
        ledger.put(r);
        ledger.save(&path).await.unwrap();

        let loaded = SyncLedger::load_or_new(&path).await.unwrap();
        let stored = loaded.get(&pair, &event_id).unwrap();
        assert_eq!(stored.status, SyncStatus::Failed);
        assert_eq!(loaded.by_status(SyncStatus::Failed).len(), 1);
        assert_eq!(loaded.status_counts()[&SyncStatus::Failed], 1);

        let empty = SyncLedger::load_or_new(&dir.path().join("missing.json"))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
