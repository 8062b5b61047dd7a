// ABOUTME: SQLite-backed append-only audit store partitioned by table and day
// ABOUTME: Idempotent append on id, retention eviction, filtered paged queries

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::entity::AuditLogEntity;
use crate::error::{IntegrityError, StoreError};
use crate::event::{format_timestamp, Operation, SourceEngine};

pub const MAX_PER_PAGE: u32 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id                  TEXT PRIMARY KEY,
    partition_key       TEXT NOT NULL,
    db_engine           TEXT NOT NULL,
    schema_name         TEXT,
    table_name          TEXT NOT NULL,
    operation           TEXT NOT NULL,
    executed_by         TEXT,
    client_ip           TEXT,
    executed_at         TEXT NOT NULL,
    contains_sensitive  INTEGER NOT NULL DEFAULT 0,
    checksum            TEXT NOT NULL,
    record              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_partition ON audit_log(partition_key);
CREATE INDEX IF NOT EXISTS idx_audit_executed_at ON audit_log(executed_at);
CREATE INDEX IF NOT EXISTS idx_audit_table_time ON audit_log(table_name, executed_at);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Same id and checksum already stored; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub engine: Option<SourceEngine>,
    pub table: Option<String>,
    pub operation: Option<Operation>,
    pub actor: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        (self.page as u64) * (self.per_page as u64) < self.total
    }
}

/// Handle to the audit database. Every call opens its own connection; concurrent
/// appends are serialized by the unique id, not by a process-wide lock.
#[derive(Debug, Clone)]
pub struct AuditStore {
    path: PathBuf,
}

impl AuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = Self { path };
        let conn = store.connect()?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Append a record. Re-appending the same id is a no-op when the checksum
    /// matches and an integrity violation when it does not.
    pub fn append(&self, record: &AuditLogEntity) -> Result<AppendOutcome, StoreError> {
        record.verify()?;
        let body = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            id: record.id.to_string(),
            reason: e.to_string(),
        })?;
        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO audit_log(
                id, partition_key, db_engine, schema_name, table_name, operation,
                executed_by, client_ip, executed_at, contains_sensitive, checksum, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                record.partition_key(),
                record.db_engine.as_str(),
                record.schema_name,
                record.table_name,
                record.operation.as_str(),
                record.executed_by,
                record.client_ip,
                format_timestamp(&record.executed_at),
                record.contains_sensitive_data,
                record.checksum,
                body,
            ],
        )?;
        if inserted == 1 {
            return Ok(AppendOutcome::Inserted);
        }

        let existing: String = conn.query_row(
            "SELECT checksum FROM audit_log WHERE id = ?1",
            [record.id.to_string()],
            |row| row.get(0),
        )?;
        if existing == record.checksum {
            Ok(AppendOutcome::Duplicate)
        } else {
            Err(IntegrityError::DuplicateId {
                id: record.id.to_string(),
                existing,
                incoming: record.checksum.clone(),
            }
            .into())
        }
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<AuditLogEntity>, StoreError> {
        let conn = self.connect()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT record FROM audit_log WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| decode(&id.to_string(), &b)).transpose()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Delete records executed before `cutoff`. The only deletion path.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM audit_log WHERE executed_at < ?1",
            [format_timestamp(&cutoff)],
        )?;
        Ok(deleted as u64)
    }

    pub fn evict_expired(&self, retention_days: u32, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - chrono::Duration::days(retention_days as i64);
        self.evict_older_than(cutoff)
    }

    /// Filtered page, newest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Page<AuditLogEntity>, StoreError> {
        let per_page = filter.per_page.clamp(1, MAX_PER_PAGE);
        let page = filter.page.max(1);

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(engine) = filter.engine {
            clauses.push("db_engine = ?");
            values.push(SqlValue::Text(engine.as_str().to_string()));
        }
        if let Some(table) = &filter.table {
            clauses.push("table_name = ?");
            values.push(SqlValue::Text(table.clone()));
        }
        if let Some(op) = filter.operation {
            clauses.push("operation = ?");
            values.push(SqlValue::Text(op.as_str().to_string()));
        }
        if let Some(actor) = &filter.actor {
            clauses.push("executed_by = ?");
            values.push(SqlValue::Text(actor.clone()));
        }
        if let Some(from) = &filter.from {
            clauses.push("executed_at >= ?");
            values.push(SqlValue::Text(format_timestamp(from)));
        }
        if let Some(to) = &filter.to {
            clauses.push("executed_at < ?");
            values.push(SqlValue::Text(format_timestamp(to)));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.connect()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_log {}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut paged = values.clone();
        paged.push(SqlValue::Integer(per_page as i64));
        paged.push(SqlValue::Integer(((page - 1) as i64) * per_page as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT id, record FROM audit_log {}
             ORDER BY executed_at DESC, id DESC
             LIMIT ? OFFSET ?",
            where_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(paged.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (id, body) = row?;
            items.push(decode(&id, &body)?);
        }

        Ok(Page {
            items,
            total: total as u64,
            page,
            per_page,
        })
    }

    /// Re-verify every stored record; returns the ids that fail.
    pub fn verify_all(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id, checksum, record FROM audit_log ORDER BY executed_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut failed = Vec::new();
        for row in rows {
            let (id, column_checksum, body) = row?;
            let ok = match decode(&id, &body) {
                Ok(record) => record.verify().is_ok() && record.checksum == column_checksum,
                Err(_) => false,
            };
            if !ok {
                tracing::error!(audit_id = %id, "audit record failed integrity verification");
                failed.push(id);
            }
        }
        Ok(failed)
    }
}

fn decode(id: &str, body: &str) -> Result<AuditLogEntity, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::builder::{AuditBuilder, AuditPolicy, SensitiveMatcher};
    use crate::context::OperationContext;
    use crate::event::tests::update_parts;
    use crate::event::ChangeEvent;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(table: &str, id: i64) -> AuditLogEntity {
        let builder = AuditBuilder::new(AuditPolicy::default(), SensitiveMatcher::default(), None);
        let event = ChangeEvent::from_parts(update_parts(
            table,
            id,
            json!({"price": 100}),
            json!({"price": 110}),
        ))
        .unwrap();
        builder
            .build(&event, &OperationContext::default().with_actor(Some("u-1".into()), None))
            .unwrap()
    }

    #[test]
    fn test_append_is_idempotent_on_id() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let rec = record("products", 42);
        assert_eq!(store.append(&rec).unwrap(), AppendOutcome::Inserted);
        assert_eq!(store.append(&rec).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(stored, rec);
        assert_eq!(stored.checksum, stored.compute_checksum());
    }

    #[test]
    fn test_conflicting_duplicate_is_an_integrity_violation() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let rec = record("products", 42);
        store.append(&rec).unwrap();

        let mut forged = rec.clone();
        forged.diff_new = Some(json!({"price": 1}).as_object().cloned().unwrap());
        forged.checksum = forged.compute_checksum();
        let err = store.append(&forged).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Integrity(IntegrityError::DuplicateId { .. })
        ));
        assert_eq!(store.get(&rec.id).unwrap().unwrap().checksum, rec.checksum);
    }

    #[test]
    fn test_tampered_record_is_refused() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut rec = record("products", 1);
        rec.table_name = "other".to_string();
        assert!(matches!(
            store.append(&rec),
            Err(StoreError::Integrity(IntegrityError::ChecksumMismatch { .. }))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_query_filters_and_pages_newest_first() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let rec = record("orders", i);
            ids.push(rec.id);
            store.append(&rec).unwrap();
        }
        store.append(&record("users", 1)).unwrap();

        let page = store
            .query(&AuditFilter {
                table: Some("orders".to_string()),
                page: 1,
                per_page: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more());
        assert!(page.items[0].executed_at >= page.items[1].executed_at);
        assert!(ids.contains(&page.items[0].id));

        let by_actor = store
            .query(&AuditFilter {
                actor: Some("u-1".to_string()),
                engine: Some(SourceEngine::Postgres),
                per_page: 1000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_actor.total, 6);
        assert_eq!(by_actor.per_page, MAX_PER_PAGE);
    }

    #[test]
    fn test_eviction_only_removes_old_records() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut old = record("orders", 1);
        old.executed_at = Utc::now() - chrono::Duration::days(120);
        old.executed_at = crate::event::truncate_micros(old.executed_at);
        old.checksum = old.compute_checksum();
        store.append(&old).unwrap();
        let fresh = record("orders", 2);
        store.append(&fresh).unwrap();

        assert_eq!(store.evict_expired(90, Utc::now()).unwrap(), 1);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn test_verify_all_reports_tampered_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let store = AuditStore::open(&path).unwrap();
        let rec = record("orders", 1);
        store.append(&rec).unwrap();
        store.append(&record("orders", 2)).unwrap();
        assert!(store.verify_all().unwrap().is_empty());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE audit_log SET record = replace(record, '110', '999') WHERE id = ?1",
            [rec.id.to_string()],
        )
        .unwrap();
        assert_eq!(store.verify_all().unwrap(), vec![rec.id.to_string()]);
    }
}
