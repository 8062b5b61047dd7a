// ABOUTME: In-memory destination for dry runs and tests
// ABOUTME: Supports injected failures, seeded rows and a write history

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{mirror_table_name, DestinationWriter, RowVersion, TargetRow, WriteRequest};
use crate::error::DestinationError;
use crate::event::{FieldMap, PrimaryKey, SourceEngine};

/// One applied write, in application order. `fields` is `None` for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWrite {
    /// Mirror table name.
    pub table: String,
    pub id: String,
    pub fields: Option<FieldMap>,
}

#[derive(Default)]
struct State {
    rows: HashMap<(String, String), RowVersion>,
    history: Vec<AppliedWrite>,
    failures: VecDeque<DestinationError>,
    fail_always: Option<DestinationError>,
    skip_writes: u32,
}

pub struct MemoryDestination {
    name: String,
    state: Mutex<State>,
    calls: AtomicU64,
    latency: Option<Duration>,
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            calls: AtomicU64::new(0),
            latency: None,
        }
    }

    /// Sleep this long inside every write, to exercise concurrency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` calls fail as unavailable.
    pub fn fail_next(&self, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state
                .failures
                .push_back(DestinationError::unavailable(&self.name, "injected failure"));
        }
    }

    pub fn fail_always(&self, enabled: bool) {
        self.state().fail_always =
            enabled.then(|| DestinationError::unavailable(&self.name, "destination down"));
    }

    /// Acknowledge the next `count` writes without applying them, so verification fails.
    pub fn drop_writes(&self, count: u32) {
        self.state().skip_writes = count;
    }

    /// `table` is `schema.table`, or a bare table for schema-less sources.
    pub fn seed(&self, table: &str, key: &PrimaryKey, fields: FieldMap, written_at: DateTime<Utc>) {
        self.state().rows.insert(
            (mirror_of(table), key.key_string()),
            RowVersion {
                fields,
                written_at,
                origin: None,
            },
        );
    }

    /// Row at `schema.table` (or a bare table) and `key`.
    pub fn row(&self, table: &str, key: &PrimaryKey) -> Option<RowVersion> {
        self.state()
            .rows
            .get(&(mirror_of(table), key.key_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total destination calls, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<AppliedWrite> {
        self.state().history.clone()
    }

    fn check_failure(&self) -> Result<(), DestinationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = &state.fail_always {
            return Err(err.clone());
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn skip_write(&self) -> bool {
        let mut state = self.state();
        if state.skip_writes > 0 {
            state.skip_writes -= 1;
            true
        } else {
            false
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn mirror_of(qualified: &str) -> String {
    match qualified.split_once('.') {
        Some((schema, table)) => mirror_table_name(Some(schema), table),
        None => mirror_table_name(None, qualified),
    }
}

#[async_trait]
impl DestinationWriter for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Option<SourceEngine> {
        None
    }

    async fn read_version(&self, row: &TargetRow) -> Result<Option<RowVersion>, DestinationError> {
        self.check_failure()?;
        Ok(self.state().rows.get(&(row.mirror_table(), row.id())).cloned())
    }

    async fn upsert(&self, request: &WriteRequest) -> Result<(), DestinationError> {
        self.check_failure()?;
        self.simulate_latency().await;
        if self.skip_write() {
            return Ok(());
        }
        let mut state = self.state();
        let id = request.row.id();
        let table = request.row.mirror_table();
        state.rows.insert(
            (table.clone(), id.clone()),
            RowVersion {
                fields: request.fields.clone(),
                written_at: request.source_timestamp,
                origin: Some(request.origin.clone()),
            },
        );
        state.history.push(AppliedWrite {
            table,
            id,
            fields: Some(request.fields.clone()),
        });
        Ok(())
    }

    async fn delete(&self, row: &TargetRow) -> Result<(), DestinationError> {
        self.check_failure()?;
        self.simulate_latency().await;
        if self.skip_write() {
            return Ok(());
        }
        let mut state = self.state();
        let id = row.id();
        let table = row.mirror_table();
        state.rows.remove(&(table.clone(), id.clone()));
        state.history.push(AppliedWrite {
            table,
            id,
            fields: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(id: i64) -> TargetRow {
        TargetRow {
            schema: None,
            table: "orders".to_string(),
            key: PrimaryKey::single("id", json!(id)),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_read_back() {
        let dest = MemoryDestination::new("mem");
        let fields = json!({"id": 1, "total": 10}).as_object().cloned().unwrap();
        dest.upsert(&WriteRequest {
            row: target(1),
            fields: fields.clone(),
            source_engine: SourceEngine::Mysql,
            source_timestamp: Utc::now(),
            origin: "mysql-main".to_string(),
        })
        .await
        .unwrap();
        let version = dest.read_version(&target(1)).await.unwrap().unwrap();
        assert_eq!(version.fields, fields);
        assert_eq!(version.origin.as_deref(), Some("mysql-main"));

        dest.delete(&target(1)).await.unwrap();
        assert!(dest.read_version(&target(1)).await.unwrap().is_none());
        assert_eq!(dest.history().len(), 2);
    }

    #[tokio::test]
    async fn test_same_table_in_two_schemas_stays_apart() {
        let dest = MemoryDestination::new("mem");
        for (schema, total) in [("public", 10), ("sales", 20)] {
            let mut row = target(1);
            row.schema = Some(schema.to_string());
            dest.upsert(&WriteRequest {
                row,
                fields: json!({"id": 1, "total": total}).as_object().cloned().unwrap(),
                source_engine: SourceEngine::Postgres,
                source_timestamp: Utc::now(),
                origin: "pg-main".to_string(),
            })
            .await
            .unwrap();
        }
        let key = PrimaryKey::single("id", json!(1));
        assert_eq!(dest.len(), 2);
        assert_eq!(dest.row("public.orders", &key).unwrap().fields["total"], json!(10));
        assert_eq!(dest.row("sales.orders", &key).unwrap().fields["total"], json!(20));
        assert!(dest.row("orders", &key).is_none());

        let mut sales = target(1);
        sales.schema = Some("sales".to_string());
        dest.delete(&sales).await.unwrap();
        assert!(dest.row("public.orders", &key).is_some());
        assert!(dest.read_version(&sales).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let dest = MemoryDestination::new("mem");
        dest.fail_next(2);
        assert!(dest.read_version(&target(1)).await.is_err());
        assert!(dest.read_version(&target(1)).await.is_err());
        assert!(dest.read_version(&target(1)).await.is_ok());
        assert_eq!(dest.calls(), 3);
    }
}
