// ABOUTME: DestinationWriter capability - where the sync engine applies changes
// ABOUTME: One variant per engine plus an in-memory store, chosen from configuration

pub mod memory;
pub mod mongodb;
pub mod mysql;
pub mod postgres;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{DestinationConfig, DestinationKind};
use crate::error::DestinationError;
use crate::event::{FieldMap, PrimaryKey, SourceEngine};

pub use memory::MemoryDestination;
pub use mongodb::MongoDestination;
pub use mysql::MysqlDestination;
pub use postgres::PostgresDestination;

/// Addresses one row (or document) at a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub schema: Option<String>,
    pub table: String,
    pub key: PrimaryKey,
}

impl TargetRow {
    /// Row id used by the mirror tables: the canonical key string.
    pub fn id(&self) -> String {
        self.key.key_string()
    }

    /// Mirror table (or collection) the row lives in.
    pub fn mirror_table(&self) -> String {
        mirror_table_name(self.schema.as_deref(), &self.table)
    }
}

/// `{schema}__{table}`, or the bare table for schema-less sources. Keeps
/// `public.orders` and `sales.orders` in separate mirror tables.
pub fn mirror_table_name(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}__{}", schema, table),
        None => table.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub row: TargetRow,
    pub fields: FieldMap,
    pub source_engine: SourceEngine,
    pub source_timestamp: DateTime<Utc>,
    /// Source name the change came from, stored as the row's origin tag.
    pub origin: String,
}

/// What the destination currently holds for a row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowVersion {
    pub fields: FieldMap,
    /// Source timestamp of the write that produced this version.
    pub written_at: DateTime<Utc>,
    pub origin: Option<String>,
}

#[async_trait]
pub trait DestinationWriter: Send + Sync {
    fn name(&self) -> &str;

    fn engine(&self) -> Option<SourceEngine>;

    /// Current version of a row, `None` when it does not exist.
    async fn read_version(&self, row: &TargetRow) -> Result<Option<RowVersion>, DestinationError>;

    /// Insert or replace the row. Idempotent.
    async fn upsert(&self, request: &WriteRequest) -> Result<(), DestinationError>;

    /// Remove the row. Deleting a missing row succeeds.
    async fn delete(&self, row: &TargetRow) -> Result<(), DestinationError>;
}

/// Build the writer a `[[destinations]]` entry describes. Connections are opened lazily.
pub fn build_destination(config: &DestinationConfig) -> Result<Arc<dyn DestinationWriter>> {
    let writer: Arc<dyn DestinationWriter> = match config.engine {
        DestinationKind::Postgres => Arc::new(PostgresDestination::new(
            &config.name,
            config.url()?,
            config.schema.clone(),
        )),
        DestinationKind::Mysql => Arc::new(MysqlDestination::new(&config.name, config.url()?)?),
        DestinationKind::Mongodb => Arc::new(MongoDestination::new(
            &config.name,
            config.url()?,
            config.database.clone(),
        )),
        DestinationKind::Memory => Arc::new(MemoryDestination::new(&config.name)),
    };
    if writer.name().is_empty() {
        bail!("destination name cannot be empty");
    }
    Ok(writer)
}
