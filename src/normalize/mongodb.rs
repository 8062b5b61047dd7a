// ABOUTME: MongoDB change stream documents to ChangeEvents
// ABOUTME: `replace` maps to UPDATE; keys come from documentKey

use serde_json::Value;

use super::{
    optional_object, parse_timestamp, required_str, resolve_key, take_origin, ChangeSource,
    KeyHints,
};
use crate::error::NormalizationError;
use crate::event::{ChangeEvent, ChangeEventParts, FieldMap, Operation, SourceEngine};

/// Change stream source. Without pre-images enabled on the collection the
/// before image falls back to the `documentKey`.
pub struct MongoSource {
    name: String,
    hints: KeyHints,
}

impl MongoSource {
    pub fn new(name: impl Into<String>, hints: KeyHints) -> Self {
        Self {
            name: name.into(),
            hints,
        }
    }
}

impl ChangeSource for MongoSource {
    fn engine(&self) -> SourceEngine {
        SourceEngine::Mongodb
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, raw: &Value) -> Result<ChangeEvent, NormalizationError> {
        let operation: Operation = required_str(raw, "operationType")?.parse()?;
        let ns = raw.get("ns").ok_or(NormalizationError::MissingField("ns"))?;
        let db = required_str(ns, "db")?.to_string();
        let collection = required_str(ns, "coll")?.to_string();
        let document_key = optional_object(raw, "documentKey")?
            .filter(|key| !key.is_empty())
            .ok_or(NormalizationError::MissingField("documentKey"))?;

        let full_document = optional_object(raw, "fullDocument")?;
        let pre_image = optional_object(raw, "fullDocumentBeforeChange")?;

        let (mut before, mut after) = match operation {
            Operation::Insert => (
                None,
                Some(full_document.ok_or(NormalizationError::MissingField("fullDocument"))?),
            ),
            Operation::Update => (
                Some(pre_image.unwrap_or_else(|| document_key.clone())),
                Some(full_document.ok_or(NormalizationError::MissingField("fullDocument"))?),
            ),
            Operation::Delete => (Some(pre_image.unwrap_or_else(|| document_key.clone())), None),
        };
        let origin_after = take_origin(&mut after);
        let origin = origin_after.or(take_origin(&mut before));

        let mut key_image: FieldMap = after.clone().or_else(|| before.clone()).unwrap_or_default();
        for (field, value) in &document_key {
            key_image.insert(field.clone(), value.clone());
        }
        let primary_key = resolve_key(
            &collection,
            &key_image,
            self.hints.for_table(Some(&db), &collection),
            Some(document_key.keys().cloned().collect()),
        )?;

        let ts_value = raw
            .get("wallTime")
            .or_else(|| raw.get("clusterTime"))
            .ok_or(NormalizationError::MissingField("clusterTime"))?;
        let source_timestamp = parse_timestamp(ts_value)?;

        ChangeEvent::from_parts(ChangeEventParts {
            source_engine: SourceEngine::Mongodb,
            source_name: self.name.clone(),
            schema: Some(db),
            table: collection,
            operation,
            primary_key,
            before,
            after,
            transaction_id: transaction_id(raw),
            position: change_position(raw),
            source_timestamp,
            origin,
        })
    }
}

// The resume token orders every change in the stream; `clusterTime` with its
// increment is the fallback when the token is absent.
fn change_position(raw: &Value) -> Option<String> {
    if let Some(token) = raw
        .get("_id")
        .and_then(|id| id.get("_data"))
        .and_then(Value::as_str)
    {
        return Some(token.to_string());
    }
    let ts = raw.get("clusterTime")?.get("$timestamp")?;
    let secs = ts.get("t").and_then(Value::as_i64)?;
    let increment = ts.get("i").and_then(Value::as_i64).unwrap_or(0);
    Some(format!("{}.{}", secs, increment))
}

// Transactions are identified by session id plus txnNumber.
fn transaction_id(raw: &Value) -> Option<String> {
    let txn = match raw.get("txnNumber")? {
        Value::Object(wrapped) => wrapped.get("$numberLong")?.as_str()?.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let session = raw
        .get("lsid")
        .and_then(|lsid| lsid.get("id"))
        .map(|id| match id {
            Value::Object(wrapped) => wrapped
                .get("$binary")
                .and_then(|b| b.get("base64"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| id.to_string()),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    Some(match session {
        Some(session) => format!("{}:{}", session, txn),
        None => txn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MongoSource {
        MongoSource::new("mongo-main", KeyHints::default())
    }

    #[test]
    fn test_replace_maps_to_update() {
        let raw = json!({
            "operationType": "replace",
            "ns": {"db": "shop", "coll": "carts"},
            "documentKey": {"_id": "c-1"},
            "fullDocument": {"_id": "c-1", "items": 3},
            "fullDocumentBeforeChange": {"_id": "c-1", "items": 2},
            "clusterTime": {"$timestamp": {"t": 1714557600, "i": 1}}
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.table, "carts");
        assert_eq!(event.before.as_ref().unwrap()["items"], json!(2));
        assert_eq!(event.primary_key.get("_id"), Some(&json!("c-1")));
    }

    #[test]
    fn test_same_second_updates_stay_distinct() {
        // Two non-transactional updates land in one cluster-time second.
        let update = |increment: i64| {
            json!({
                "operationType": "update",
                "ns": {"db": "shop", "coll": "carts"},
                "documentKey": {"_id": "c-1"},
                "fullDocument": {"_id": "c-1", "items": 3},
                "clusterTime": {"$timestamp": {"t": 1714557600, "i": increment}}
            })
        };
        let first = source().normalize(&update(1)).unwrap();
        let second = source().normalize(&update(2)).unwrap();
        assert_eq!(first.source_timestamp, second.source_timestamp);
        assert_eq!(first.position.as_deref(), Some("1714557600.1"));
        assert_ne!(first.event_id, second.event_id);

        let mut tokened = update(1);
        tokened["_id"] = json!({"_data": "8266321A"});
        let event = source().normalize(&tokened).unwrap();
        assert_eq!(event.position.as_deref(), Some("8266321A"));
    }

    #[test]
    fn test_update_without_full_document_is_rejected() {
        let raw = json!({
            "operationType": "update",
            "ns": {"db": "shop", "coll": "carts"},
            "documentKey": {"_id": "c-1"},
            "updateDescription": {"updatedFields": {"items": 3}},
            "clusterTime": {"$timestamp": {"t": 1714557600, "i": 1}}
        });
        assert_eq!(
            source().normalize(&raw).unwrap_err(),
            NormalizationError::MissingField("fullDocument")
        );
    }

    #[test]
    fn test_delete_without_pre_image_uses_document_key() {
        let raw = json!({
            "operationType": "delete",
            "ns": {"db": "shop", "coll": "carts"},
            "documentKey": {"_id": {"$oid": "65f1c0ffee"}},
            "wallTime": {"$date": {"$numberLong": "1714557600000"}},
            "txnNumber": {"$numberLong": "4"},
            "lsid": {"id": "sess-1"}
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.before.as_ref().unwrap()["_id"], json!({"$oid": "65f1c0ffee"}));
        assert_eq!(event.transaction_id.as_deref(), Some("sess-1:4"));
    }

    #[test]
    fn test_unsupported_operation_type() {
        let raw = json!({
            "operationType": "drop",
            "ns": {"db": "shop", "coll": "carts"},
            "clusterTime": {"$timestamp": {"t": 1, "i": 1}}
        });
        assert!(matches!(
            source().normalize(&raw),
            Err(NormalizationError::UnknownOperation(_))
        ));
    }
}
