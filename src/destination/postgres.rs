// ABOUTME: PostgreSQL destination writing JSONB mirror tables
// ABOUTME: Lazy TLS connection with retry; upserts via ON CONFLICT, verification by re-read

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value;
use tokio_postgres::Client;

use super::{DestinationWriter, RowVersion, TargetRow, WriteRequest};
use crate::error::DestinationError;
use crate::event::SourceEngine;
use crate::utils::{quote_ident, retry_with_backoff, sanitize_url, validate_identifier};

const CONNECT_RETRIES: u32 = 2;

pub struct PostgresDestination {
    name: String,
    url: String,
    schema: String,
    client: tokio::sync::Mutex<Option<Arc<Client>>>,
    created: Mutex<HashSet<String>>,
}

impl PostgresDestination {
    pub fn new(name: &str, url: String, schema: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            url,
            schema: schema.unwrap_or_else(|| "public".to_string()),
            client: tokio::sync::Mutex::new(None),
            created: Mutex::new(HashSet::new()),
        }
    }

    async fn client(&self) -> Result<Arc<Client>, DestinationError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::warn!(destination = %self.name, "postgres connection closed, reconnecting");
        }
        let url = self.url.clone();
        let client = retry_with_backoff(
            || connect(&url),
            CONNECT_RETRIES,
            Duration::from_millis(500),
        )
        .await
        .map_err(|e| DestinationError::unavailable(&self.name, format!("{:#}", e)))?;
        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }

    fn qualified(&self, table: &str) -> Result<String, DestinationError> {
        validate_identifier(table).map_err(|e| DestinationError::rejected(&self.name, e))?;
        Ok(format!("{}.{}", quote_ident(&self.schema), quote_ident(table)))
    }

    async fn ensure_table(&self, client: &Client, table: &str) -> Result<String, DestinationError> {
        let qualified = self.qualified(table)?;
        if self.is_created(&qualified) {
            return Ok(qualified);
        }
        let ddl = format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {schema};
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                pk JSONB NOT NULL,
                data JSONB NOT NULL,
                _source_type TEXT NOT NULL,
                _source_ts TIMESTAMPTZ NOT NULL,
                _sync_origin TEXT,
                _synced_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
            schema = quote_ident(&self.schema),
            table = qualified,
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| self.map_error(e))?;
        tracing::info!(destination = %self.name, "created mirror table {}", qualified);
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(qualified.clone());
        Ok(qualified)
    }

    fn is_created(&self, qualified: &str) -> bool {
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(qualified)
    }

    fn map_error(&self, err: tokio_postgres::Error) -> DestinationError {
        let transient = err.is_closed()
            || match err.code() {
                None => true,
                Some(code) => {
                    let code = code.code();
                    code.starts_with("08") || code.starts_with("53") || code.starts_with("57")
                }
            };
        if transient {
            DestinationError::unavailable(&self.name, err)
        } else {
            DestinationError::rejected(&self.name, err)
        }
    }
}

async fn connect(url: &str) -> Result<Client> {
    let tls = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let connector = MakeTlsConnector::new(tls);
    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });
    Ok(client)
}

#[async_trait]
impl DestinationWriter for PostgresDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Option<SourceEngine> {
        Some(SourceEngine::Postgres)
    }

    async fn read_version(&self, row: &TargetRow) -> Result<Option<RowVersion>, DestinationError> {
        let client = self.client().await?;
        let table = self.ensure_table(&client, &row.mirror_table()).await?;
        let sql = format!(
            "SELECT data, _source_ts, _sync_origin FROM {} WHERE id = $1",
            table
        );
        let found = client
            .query_opt(&sql, &[&row.id()])
            .await
            .map_err(|e| self.map_error(e))?;
        let Some(found) = found else {
            return Ok(None);
        };
        let data: Value = found.get(0);
        let written_at: DateTime<Utc> = found.get(1);
        let origin: Option<String> = found.get(2);
        match data {
            Value::Object(fields) => Ok(Some(RowVersion {
                fields,
                written_at,
                origin,
            })),
            other => Err(DestinationError::verification(
                &self.name,
                format!("row {} holds non-object data {}", row.id(), other),
            )),
        }
    }

    async fn upsert(&self, request: &WriteRequest) -> Result<(), DestinationError> {
        let client = self.client().await?;
        let table = self.ensure_table(&client, &request.row.mirror_table()).await?;
        let sql = format!(
            r#"INSERT INTO {} (id, pk, data, _source_type, _source_ts, _sync_origin, _synced_at)
               VALUES ($1, $2, $3, $4, $5, $6, NOW())
               ON CONFLICT (id) DO UPDATE SET
                   "pk" = EXCLUDED."pk",
                   "data" = EXCLUDED."data",
                   "_source_type" = EXCLUDED."_source_type",
                   "_source_ts" = EXCLUDED."_source_ts",
                   "_sync_origin" = EXCLUDED."_sync_origin",
                   "_synced_at" = NOW()"#,
            table
        );
        let pk = serde_json::to_value(&request.row.key)
            .map_err(|e| DestinationError::rejected(&self.name, e))?;
        let data = Value::Object(request.fields.clone());
        client
            .execute(
                &sql,
                &[
                    &request.row.id(),
                    &pk,
                    &data,
                    &request.source_engine.as_str(),
                    &request.source_timestamp,
                    &request.origin,
                ],
            )
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn delete(&self, row: &TargetRow) -> Result<(), DestinationError> {
        let client = self.client().await?;
        let table = self.ensure_table(&client, &row.mirror_table()).await?;
        let sql = format!("DELETE FROM {} WHERE id = $1", table);
        client
            .execute(&sql, &[&row.id()])
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }
}
