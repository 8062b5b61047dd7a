use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::entry::{EntryKind, LogEntry, NewEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    topic         TEXT NOT NULL,
    part          INTEGER NOT NULL,
    entry_key     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    payload       BLOB NOT NULL,
    created_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_entries_kind_offset ON entries(kind, seq);
CREATE INDEX IF NOT EXISTS idx_entries_kind_part_offset ON entries(kind, part, seq);

CREATE TABLE IF NOT EXISTS acks (
    consumer      TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    acked_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (consumer, seq)
);

CREATE TABLE IF NOT EXISTS cursors (
    consumer      TEXT PRIMARY KEY,
    last_seq      INTEGER NOT NULL DEFAULT 0,
    updated_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const ENTRY_COLUMNS: &str = "seq, topic, part, entry_key, kind, payload, created_at";

/// Append-only log of bus entries. Offsets are assigned by SQLite and are
/// strictly increasing, so reading a partition in offset order replays it in
/// publish order.
pub struct EventLog {
    path: PathBuf,
    conn: Connection,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create event log directory {}", parent.display())
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for event log")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set event log busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize event log schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn append(&self, entry: &NewEntry) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO entries(topic, part, entry_key, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.topic,
                entry.partition,
                entry.key,
                entry.kind.as_str(),
                entry.payload,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, offset: i64) -> Result<Option<LogEntry>> {
        self.conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE seq = ?1"
            ))?
            .query_row([offset], read_entry)
            .optional()
            .map_err(Into::into)
    }

    /// Entries of `kind` after `after_offset` that `consumer` has not acknowledged,
    /// oldest first.
    pub fn fetch_unacked(
        &self,
        consumer: &str,
        kind: EntryKind,
        after_offset: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM entries e
             WHERE e.kind = ?1
               AND e.seq > ?2
               AND NOT EXISTS (
                   SELECT 1 FROM acks a WHERE a.consumer = ?3 AND a.seq = e.seq
               )
             ORDER BY e.seq ASC
             LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![kind.as_str(), after_offset, consumer, limit as i64],
            read_entry,
        )?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// [`EventLog::fetch_unacked`] restricted to one partition.
    pub fn fetch_unacked_in(
        &self,
        consumer: &str,
        kind: EntryKind,
        partition: u32,
        after_offset: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM entries e
             WHERE e.kind = ?1
               AND e.part = ?2
               AND e.seq > ?3
               AND NOT EXISTS (
                   SELECT 1 FROM acks a WHERE a.consumer = ?4 AND a.seq = e.seq
               )
             ORDER BY e.seq ASC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![kind.as_str(), partition, after_offset, consumer, limit as i64],
            read_entry,
        )?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Record that `consumer` finished with the entry at `offset`. Returns false when
    /// the ack already existed.
    pub fn ack(&self, consumer: &str, offset: i64) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO acks(consumer, seq) VALUES (?1, ?2)",
            params![consumer, offset],
        )?;
        Ok(inserted == 1)
    }

    pub fn is_acked(&self, consumer: &str, offset: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM acks WHERE consumer = ?1 AND seq = ?2",
                params![consumer, offset],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Cursor-style read used by feed consumers.
    pub fn list_after(
        &self,
        kind: Option<EntryKind>,
        after_offset: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let rows = match kind {
            Some(kind) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries
                     WHERE kind = ?1 AND seq > ?2
                     ORDER BY seq ASC LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    params![kind.as_str(), after_offset, limit as i64],
                    read_entry,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries
                     WHERE seq > ?1
                     ORDER BY seq ASC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![after_offset, limit as i64], read_entry)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn cursor(&self, consumer: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT last_seq FROM cursors WHERE consumer = ?1",
                [consumer],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Move a feed consumer's cursor forward. Cursors never move backwards.
    pub fn set_cursor(&self, consumer: &str, offset: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO cursors(consumer, last_seq, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(consumer) DO UPDATE SET
                last_seq = MAX(cursors.last_seq, excluded.last_seq),
                updated_at = CURRENT_TIMESTAMP",
            params![consumer, offset],
        )?;
        Ok(self.cursor(consumer)?.unwrap_or(offset))
    }

    pub fn head_offset(&self) -> Result<i64> {
        let head: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM entries", [], |row| row.get(0))?;
        Ok(head.unwrap_or(0))
    }

    /// Drop entries (and their acks) below `offset`.
    pub fn truncate_before(&self, offset: i64) -> Result<u64> {
        self.conn
            .execute("DELETE FROM acks WHERE seq < ?1", [offset])?;
        let deleted = self
            .conn
            .execute("DELETE FROM entries WHERE seq < ?1", [offset])?;
        Ok(deleted as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let kind: String = row.get(4)?;
    let kind = kind.parse::<EntryKind>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;
    Ok(LogEntry {
        offset: row.get(0)?,
        topic: row.get(1)?,
        partition: row.get(2)?,
        key: row.get(3)?,
        kind,
        payload: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_perms(_path: &Path) -> Result<()> {
    Ok(())
}
