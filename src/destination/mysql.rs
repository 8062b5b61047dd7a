// ABOUTME: MySQL destination writing JSON mirror tables through a mysql_async pool
// ABOUTME: Upserts via ON DUPLICATE KEY UPDATE; timestamps kept at microsecond precision

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::*;
use mysql_async::{Opts, Pool};
use serde_json::Value;

use super::{DestinationWriter, RowVersion, TargetRow, WriteRequest};
use crate::error::DestinationError;
use crate::event::SourceEngine;
use crate::utils::{quote_mysql_ident, sanitize_url, validate_identifier};

// Server error codes worth retrying: too many connections, lock wait timeout, deadlock.
const TRANSIENT_SERVER_CODES: [u16; 3] = [1040, 1205, 1213];

pub struct MysqlDestination {
    name: String,
    pool: Pool,
    created: Mutex<HashSet<String>>,
}

impl MysqlDestination {
    /// Parses the URL up front; connections are only opened on first use.
    pub fn new(name: &str, url: String) -> Result<Self> {
        let opts = Opts::from_url(&url)
            .with_context(|| format!("Invalid MySQL URL {}", sanitize_url(&url)))?;
        if opts.db_name().is_none() {
            anyhow::bail!(
                "MySQL destination '{}' needs a database in its URL ({})",
                name,
                sanitize_url(&url)
            );
        }
        Ok(Self {
            name: name.to_string(),
            pool: Pool::new(opts),
            created: Mutex::new(HashSet::new()),
        })
    }

    async fn conn(&self) -> Result<mysql_async::Conn, DestinationError> {
        self.pool.get_conn().await.map_err(|e| self.map_error(e))
    }

    async fn ensure_table(
        &self,
        conn: &mut mysql_async::Conn,
        table: &str,
    ) -> Result<String, DestinationError> {
        validate_identifier(table).map_err(|e| DestinationError::rejected(&self.name, e))?;
        let quoted = quote_mysql_ident(table);
        if self
            .created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&quoted)
        {
            return Ok(quoted);
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id VARCHAR(512) NOT NULL PRIMARY KEY,
                pk JSON NOT NULL,
                data JSON NOT NULL,
                _source_type VARCHAR(32) NOT NULL,
                _source_ts DATETIME(6) NOT NULL,
                _sync_origin VARCHAR(255) NULL,
                _synced_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
            )",
            quoted
        );
        conn.query_drop(ddl).await.map_err(|e| self.map_error(e))?;
        tracing::info!(destination = %self.name, "created mirror table {}", quoted);
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(quoted.clone());
        Ok(quoted)
    }

    fn map_error(&self, err: mysql_async::Error) -> DestinationError {
        match &err {
            mysql_async::Error::Server(server) if !TRANSIENT_SERVER_CODES.contains(&server.code) => {
                DestinationError::rejected(&self.name, err)
            }
            mysql_async::Error::Url(_) => DestinationError::rejected(&self.name, err),
            _ => DestinationError::unavailable(&self.name, err),
        }
    }
}

fn to_mysql_datetime(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[async_trait]
impl DestinationWriter for MysqlDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Option<SourceEngine> {
        Some(SourceEngine::Mysql)
    }

    async fn read_version(&self, row: &TargetRow) -> Result<Option<RowVersion>, DestinationError> {
        let mut conn = self.conn().await?;
        let table = self.ensure_table(&mut conn, &row.mirror_table()).await?;
        let sql = format!(
            "SELECT CAST(data AS CHAR), DATE_FORMAT(_source_ts, '%Y-%m-%dT%H:%i:%s.%fZ'), _sync_origin
             FROM {} WHERE id = ?",
            table
        );
        let found: Option<(String, String, Option<String>)> = conn
            .exec_first(sql, (row.id(),))
            .await
            .map_err(|e| self.map_error(e))?;
        let Some((data, written_at, origin)) = found else {
            return Ok(None);
        };
        let fields = match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(DestinationError::verification(
                    &self.name,
                    format!("row {} holds non-object data {}", row.id(), other),
                ))
            }
            Err(e) => return Err(DestinationError::verification(&self.name, e)),
        };
        let written_at = DateTime::parse_from_rfc3339(&written_at)
            .map_err(|e| DestinationError::verification(&self.name, e))?
            .with_timezone(&Utc);
        Ok(Some(RowVersion {
            fields,
            written_at,
            origin,
        }))
    }

    async fn upsert(&self, request: &WriteRequest) -> Result<(), DestinationError> {
        let mut conn = self.conn().await?;
        let table = self.ensure_table(&mut conn, &request.row.mirror_table()).await?;
        let sql = format!(
            "INSERT INTO {} (id, pk, data, _source_type, _source_ts, _sync_origin)
             VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 pk = VALUES(pk),
                 data = VALUES(data),
                 _source_type = VALUES(_source_type),
                 _source_ts = VALUES(_source_ts),
                 _sync_origin = VALUES(_sync_origin),
                 _synced_at = CURRENT_TIMESTAMP(6)",
            table
        );
        let pk = serde_json::to_string(&request.row.key)
            .map_err(|e| DestinationError::rejected(&self.name, e))?;
        let data = Value::Object(request.fields.clone()).to_string();
        conn.exec_drop(
            sql,
            (
                request.row.id(),
                pk,
                data,
                request.source_engine.as_str(),
                to_mysql_datetime(&request.source_timestamp),
                request.origin.clone(),
            ),
        )
        .await
        .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn delete(&self, row: &TargetRow) -> Result<(), DestinationError> {
        let mut conn = self.conn().await?;
        let table = self.ensure_table(&mut conn, &row.mirror_table()).await?;
        conn.exec_drop(format!("DELETE FROM {} WHERE id = ?", table), (row.id(),))
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }
}
