// ABOUTME: MongoDB destination storing mirrored rows as documents keyed by row id
// ABOUTME: Row data converts through extended JSON so BSON types survive the round trip

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR};
use mongodb::{Client, Collection};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::{DestinationWriter, RowVersion, TargetRow, WriteRequest};
use crate::error::DestinationError;
use crate::event::{format_timestamp, SourceEngine};
use crate::utils::{sanitize_url, validate_identifier};

pub struct MongoDestination {
    name: String,
    url: String,
    database: Option<String>,
    client: OnceCell<Client>,
}

impl MongoDestination {
    pub fn new(name: &str, url: String, database: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            url,
            database,
            client: OnceCell::new(),
        }
    }

    async fn collection(&self, table: &str) -> Result<Collection<Document>, DestinationError> {
        validate_identifier(table).map_err(|e| DestinationError::rejected(&self.name, e))?;
        let client = self
            .client
            .get_or_try_init(|| async {
                tracing::info!(
                    destination = %self.name,
                    "connecting to {}",
                    sanitize_url(&self.url)
                );
                Client::with_uri_str(&self.url).await
            })
            .await
            .map_err(|e| self.map_error(e))?;
        let db = match &self.database {
            Some(name) => client.database(name),
            None => client.default_database().ok_or_else(|| {
                DestinationError::rejected(
                    &self.name,
                    "no database configured and none in the connection string",
                )
            })?,
        };
        Ok(db.collection::<Document>(table))
    }

    fn map_error(&self, err: mongodb::error::Error) -> DestinationError {
        let transient = matches!(
            *err.kind,
            ErrorKind::Io(_)
                | ErrorKind::ServerSelection { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
        ) || err.contains_label(RETRYABLE_WRITE_ERROR);
        if transient {
            DestinationError::unavailable(&self.name, err)
        } else {
            DestinationError::rejected(&self.name, err)
        }
    }
}

fn to_bson(value: Value) -> Result<Bson, String> {
    Bson::try_from(value).map_err(|e| e.to_string())
}

/// Mirror document: `_id` is the canonical key string.
fn mirror_document(request: &WriteRequest) -> Result<Document, String> {
    let pk = serde_json::to_value(&request.row.key).map_err(|e| e.to_string())?;
    let data = match to_bson(Value::Object(request.fields.clone()))? {
        Bson::Document(data) => data,
        other => return Err(format!("row data converted to {:?}", other.element_type())),
    };
    Ok(doc! {
        "_id": request.row.id(),
        "pk": to_bson(pk)?,
        "data": data,
        "_source_type": request.source_engine.as_str(),
        "_source_ts": format_timestamp(&request.source_timestamp),
        "_sync_origin": request.origin.clone(),
        "_synced_at": bson::DateTime::now(),
    })
}

fn row_version(document: Document) -> Result<RowVersion, String> {
    let data = document
        .get_document("data")
        .map_err(|e| e.to_string())?
        .clone();
    let fields = match Bson::Document(data).into_relaxed_extjson() {
        Value::Object(fields) => fields,
        other => return Err(format!("data is not an object: {}", other)),
    };
    let written_at = document
        .get_str("_source_ts")
        .map_err(|e| e.to_string())
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).map_err(|e| e.to_string()))?
        .with_timezone(&Utc);
    let origin = document.get_str("_sync_origin").ok().map(str::to_string);
    Ok(RowVersion {
        fields,
        written_at,
        origin,
    })
}

#[async_trait]
impl DestinationWriter for MongoDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Option<SourceEngine> {
        Some(SourceEngine::Mongodb)
    }

    async fn read_version(&self, row: &TargetRow) -> Result<Option<RowVersion>, DestinationError> {
        let collection = self.collection(&row.mirror_table()).await?;
        let found = collection
            .find_one(doc! { "_id": row.id() })
            .await
            .map_err(|e| self.map_error(e))?;
        found
            .map(row_version)
            .transpose()
            .map_err(|e| DestinationError::verification(&self.name, e))
    }

    async fn upsert(&self, request: &WriteRequest) -> Result<(), DestinationError> {
        let collection = self.collection(&request.row.mirror_table()).await?;
        let document =
            mirror_document(request).map_err(|e| DestinationError::rejected(&self.name, e))?;
        collection
            .replace_one(doc! { "_id": request.row.id() }, document)
            .upsert(true)
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn delete(&self, row: &TargetRow) -> Result<(), DestinationError> {
        let collection = self.collection(&row.mirror_table()).await?;
        collection
            .delete_one(doc! { "_id": row.id() })
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PrimaryKey;
    use serde_json::json;

    fn request() -> WriteRequest {
        WriteRequest {
            row: TargetRow {
                schema: Some("shop".to_string()),
                table: "carts".to_string(),
                key: PrimaryKey::single("_id", json!("c-1")),
            },
            fields: json!({"_id": "c-1", "items": 3, "tags": ["a", "b"]})
                .as_object()
                .cloned()
                .unwrap(),
            source_engine: SourceEngine::Mongodb,
            source_timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456Z")
                .unwrap()
                .with_timezone(&Utc),
            origin: "mongo-main".to_string(),
        }
    }

    #[test]
    fn test_mirror_document_reads_back_as_same_version() {
        let req = request();
        let document = mirror_document(&req).unwrap();
        assert_eq!(document.get_str("_id").unwrap(), req.row.id());
        let version = row_version(document).unwrap();
        assert_eq!(version.fields, req.fields);
        assert_eq!(version.written_at, req.source_timestamp);
        assert_eq!(version.origin.as_deref(), Some("mongo-main"));
    }

    #[test]
    fn test_extended_json_values_become_bson_types() {
        let mut req = request();
        req.fields
            .insert("ref".to_string(), json!({"$oid": "65f1c0ffee65f1c0ffee65f1"}));
        let document = mirror_document(&req).unwrap();
        let data = document.get_document("data").unwrap();
        assert!(data.get_object_id("ref").is_ok());
    }
}
