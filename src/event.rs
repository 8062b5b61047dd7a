// ABOUTME: Canonical ChangeEvent model shared by the audit and sync paths
// ABOUTME: Validates row-image invariants and derives the stable event id

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::NormalizationError;

/// Column or document field values. Backed by a sorted map, so serialization is canonical.
pub type FieldMap = serde_json::Map<String, Value>;

/// Field written into destination rows to tag which source a replicated write came from.
pub const ORIGIN_FIELD: &str = "_sync_origin";

/// Bookkeeping fields the sync engine adds to destination rows. Stripped from
/// row images when such a row is captured again.
pub const META_FIELDS: &[&str] = &[ORIGIN_FIELD, "_source_ts", "_source_type", "_synced_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceEngine {
    Postgres,
    Mysql,
    Mongodb,
}

impl SourceEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceEngine::Postgres => "postgres",
            SourceEngine::Mysql => "mysql",
            SourceEngine::Mongodb => "mongodb",
        }
    }
}

impl fmt::Display for SourceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(SourceEngine::Postgres),
            "mysql" | "mariadb" => Ok(SourceEngine::Mysql),
            "mongodb" | "mongo" => Ok(SourceEngine::Mongodb),
            other => Err(format!("unknown database engine '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" | "create" => Ok(Operation::Insert),
            "update" | "replace" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(NormalizationError::UnknownOperation(other.to_string())),
        }
    }
}

/// Ordered primary key. Column order is the source's and survives serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimaryKey(Vec<(String, Value)>);

impl PrimaryKey {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self(columns)
    }

    pub fn single(column: impl Into<String>, value: Value) -> Self {
        Self(vec![(column.into(), value)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.0.iter()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }

    /// `[[column, value], ...]` in key order; the form hashed into checksums and ids.
    pub fn to_canonical(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )
    }

    /// Stable string form used as the bus partition key and destination row id.
    pub fn key_string(&self) -> String {
        self.to_canonical().to_string()
    }
}

impl Serialize for PrimaryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PrimaryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = PrimaryKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a primary key object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PrimaryKey, A::Error> {
                let mut columns = Vec::with_capacity(access.size_hint().unwrap_or(1));
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    columns.push((k, v));
                }
                Ok(PrimaryKey(columns))
            }
        }

        deserializer.deserialize_map(KeyVisitor)
    }
}

/// Truncate to microseconds so timestamps survive storage round trips exactly.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// RFC 3339 with microseconds and a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Everything a source adapter knows about a mutation, before validation.
#[derive(Debug, Clone)]
pub struct ChangeEventParts {
    pub source_engine: SourceEngine,
    pub source_name: String,
    pub schema: Option<String>,
    pub table: String,
    pub operation: Operation,
    pub primary_key: PrimaryKey,
    pub before: Option<FieldMap>,
    pub after: Option<FieldMap>,
    pub transaction_id: Option<String>,
    /// Source log position of this change (LSN, binlog coordinates, resume token).
    pub position: Option<String>,
    pub source_timestamp: DateTime<Utc>,
    pub origin: Option<String>,
}

/// A normalized mutation. Built only through [`ChangeEvent::from_parts`], which
/// enforces the before/after invariants and a non-empty primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_id: String,
    pub source_engine: SourceEngine,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub operation: Operation,
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub before: Option<FieldMap>,
    #[serde(default)]
    pub after: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    pub source_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ChangeEvent {
    pub fn from_parts(parts: ChangeEventParts) -> Result<Self, NormalizationError> {
        if parts.primary_key.is_empty() {
            return Err(NormalizationError::MissingPrimaryKey {
                table: parts.table.clone(),
            });
        }
        match parts.operation {
            Operation::Insert if parts.after.is_none() => {
                return Err(NormalizationError::MissingImage {
                    operation: "INSERT",
                    image: "an after",
                })
            }
            Operation::Update if parts.before.is_none() || parts.after.is_none() => {
                return Err(NormalizationError::MissingImage {
                    operation: "UPDATE",
                    image: "both before and after",
                })
            }
            Operation::Delete if parts.before.is_none() => {
                return Err(NormalizationError::MissingImage {
                    operation: "DELETE",
                    image: "a before",
                })
            }
            _ => {}
        }

        let (before, after) = match parts.operation {
            Operation::Insert => (None, parts.after),
            Operation::Update => (parts.before, parts.after),
            Operation::Delete => (parts.before, None),
        };
        let source_timestamp = truncate_micros(parts.source_timestamp);

        let mut event = ChangeEvent {
            event_id: String::new(),
            source_engine: parts.source_engine,
            source_name: parts.source_name,
            schema: parts.schema,
            table: parts.table,
            operation: parts.operation,
            primary_key: parts.primary_key,
            before,
            after,
            transaction_id: parts.transaction_id,
            position: parts.position,
            source_timestamp,
            origin: parts.origin,
        };
        event.event_id = event.compute_event_id();
        Ok(event)
    }

    /// Identical for a redelivered change, distinct for two changes to one row
    /// inside a transaction: the log position and both row images are hashed
    /// alongside the row address.
    fn compute_event_id(&self) -> String {
        let identity = serde_json::json!([
            self.source_engine.as_str(),
            self.schema,
            self.table,
            self.transaction_id,
            self.position,
            self.primary_key.to_canonical(),
            self.operation.as_str(),
            format_timestamp(&self.source_timestamp),
            self.before,
            self.after,
        ]);
        hex::encode(Sha256::digest(identity.to_string().as_bytes()))
    }

    /// Bus topic: `{sourceEngine}.{table}`.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.source_engine, self.table)
    }

    /// Partition key: the serialized primary key, scoped by schema.
    pub fn partition_key(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}:{}", schema, self.table, self.primary_key.key_string()),
            None => format!("{}:{}", self.table, self.primary_key.key_string()),
        }
    }

    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }

    /// Row image a destination should end up holding: `after`, or nothing for DELETE.
    pub fn target_image(&self) -> Option<&FieldMap> {
        self.after.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    pub(crate) fn update_parts(table: &str, id: i64, before: Value, after: Value) -> ChangeEventParts {
        ChangeEventParts {
            source_engine: SourceEngine::Postgres,
            source_name: "pg-main".to_string(),
            schema: Some("public".to_string()),
            table: table.to_string(),
            operation: Operation::Update,
            primary_key: PrimaryKey::single("id", json!(id)),
            before: Some(fields(before)),
            after: Some(fields(after)),
            transaction_id: Some("tx-1".to_string()),
            position: None,
            source_timestamp: "2024-05-01T10:00:00.123456789Z".parse().unwrap(),
            origin: None,
        }
    }

    #[test]
    fn test_update_requires_both_images() {
        let mut parts = update_parts("products", 42, json!({"price": 100}), json!({"price": 110}));
        parts.before = None;
        let err = ChangeEvent::from_parts(parts).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingImage { .. }));
    }

    #[test]
    fn test_insert_drops_stray_before_image() {
        let mut parts = update_parts("products", 1, json!({"a": 1}), json!({"a": 2}));
        parts.operation = Operation::Insert;
        let event = ChangeEvent::from_parts(parts).unwrap();
        assert!(event.before.is_none());
        assert!(event.after.is_some());
    }

    #[test]
    fn test_empty_primary_key_is_rejected() {
        let mut parts = update_parts("products", 1, json!({}), json!({}));
        parts.primary_key = PrimaryKey::default();
        assert!(matches!(
            ChangeEvent::from_parts(parts),
            Err(NormalizationError::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_event_id_is_stable_for_redelivery() {
        let a = ChangeEvent::from_parts(update_parts("t", 1, json!({"x": 1}), json!({"x": 2}))).unwrap();
        let b = ChangeEvent::from_parts(update_parts("t", 1, json!({"x": 1}), json!({"x": 2}))).unwrap();
        let c = ChangeEvent::from_parts(update_parts("t", 2, json!({"x": 1}), json!({"x": 2}))).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert_ne!(a.event_id, c.event_id);
        assert_eq!(a.event_id.len(), 64);
        assert!(a.event_id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[test]
    fn test_two_updates_in_one_transaction_get_distinct_ids() {
        // Same row, same transaction, same commit timestamp.
        let first =
            ChangeEvent::from_parts(update_parts("products", 42, json!({"price": 100}), json!({"price": 110})))
                .unwrap();
        let second =
            ChangeEvent::from_parts(update_parts("products", 42, json!({"price": 110}), json!({"price": 120})))
                .unwrap();
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(first.source_timestamp, second.source_timestamp);
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn test_log_position_separates_identical_images() {
        // A value toggled away and back within one transaction repeats its images.
        let mut a = update_parts("products", 42, json!({"price": 100}), json!({"price": 110}));
        let mut b = a.clone();
        a.position = Some("0/16B3748".to_string());
        b.position = Some("0/16B37C0".to_string());
        let a = ChangeEvent::from_parts(a).unwrap();
        let b = ChangeEvent::from_parts(b).unwrap();
        assert_ne!(a.event_id, b.event_id);

        let mut again = update_parts("products", 42, json!({"price": 100}), json!({"price": 110}));
        again.position = Some("0/16B3748".to_string());
        assert_eq!(ChangeEvent::from_parts(again).unwrap().event_id, a.event_id);
    }

    #[test]
    fn test_timestamp_truncated_to_micros() {
        let event = ChangeEvent::from_parts(update_parts("t", 1, json!({}), json!({}))).unwrap();
        assert_eq!(
            format_timestamp(&event.source_timestamp),
            "2024-05-01T10:00:00.123456Z"
        );
    }

    #[test]
    fn test_primary_key_preserves_source_order() {
        let pk = PrimaryKey::new(vec![
            ("tenant".to_string(), json!("acme")),
            ("id".to_string(), json!(7)),
        ]);
        let encoded = serde_json::to_string(&pk).unwrap();
        assert_eq!(encoded, r#"{"tenant":"acme","id":7}"#);
        let decoded: PrimaryKey = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.columns().collect::<Vec<_>>(), vec!["tenant", "id"]);
        assert_eq!(pk.key_string(), r#"[["tenant","acme"],["id",7]]"#);
    }

    #[test]
    fn test_topic_and_partition_key() {
        let event = ChangeEvent::from_parts(update_parts("orders", 9, json!({}), json!({}))).unwrap();
        assert_eq!(event.topic(), "postgres.orders");
        assert_eq!(event.partition_key(), r#"public.orders:[["id",9]]"#);
    }

    #[test]
    fn test_engine_aliases() {
        assert_eq!("postgresql".parse::<SourceEngine>().unwrap(), SourceEngine::Postgres);
        assert_eq!("Mongo".parse::<SourceEngine>().unwrap(), SourceEngine::Mongodb);
        assert!("oracle".parse::<SourceEngine>().is_err());
        assert_eq!("replace".parse::<Operation>().unwrap(), Operation::Update);
    }
}
