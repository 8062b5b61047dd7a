// ABOUTME: Change event normalization - engine notifications to canonical ChangeEvents
// ABOUTME: Holds the ChangeSource capability, shared key/timestamp helpers and the Normalizer

pub mod intake;
pub mod mongodb;
pub mod mysql;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::NormalizationError;
use crate::event::{ChangeEvent, FieldMap, PrimaryKey, SourceEngine, META_FIELDS, ORIGIN_FIELD};

pub use intake::{intake_queue, IntakeError, IntakeQueue, IntakeReceiver};

/// Engine-specific translator from a raw capture notification to a `ChangeEvent`.
pub trait ChangeSource: Send + Sync {
    fn engine(&self) -> SourceEngine;

    /// Configured source name; used to build sync pairs.
    fn name(&self) -> &str;

    fn normalize(&self, raw: &Value) -> Result<ChangeEvent, NormalizationError>;
}

/// A notification as handed over by a capture adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNotification {
    /// Name of the configured source that produced the payload.
    pub source: String,
    #[serde(default)]
    pub context: OperationContext,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct NormalizedChange {
    pub event: ChangeEvent,
    pub context: OperationContext,
}

/// Configured primary-key columns per table, used before any key the payload carries.
#[derive(Debug, Clone, Default)]
pub struct KeyHints {
    tables: HashMap<String, Vec<String>>,
}

impl KeyHints {
    pub fn new(tables: HashMap<String, Vec<String>>) -> Self {
        Self { tables }
    }

    pub fn for_table(&self, schema: Option<&str>, table: &str) -> Option<&[String]> {
        if let Some(schema) = schema {
            if let Some(cols) = self.tables.get(&format!("{}.{}", schema, table)) {
                return Some(cols);
            }
        }
        self.tables.get(table).map(|cols| cols.as_slice())
    }
}

/// Routes raw notifications to the source that produced them.
#[derive(Default, Clone)]
pub struct Normalizer {
    sources: HashMap<String, Arc<dyn ChangeSource>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn ChangeSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn source(&self, name: &str) -> Option<&Arc<dyn ChangeSource>> {
        self.sources.get(name)
    }

    pub fn engine_of(&self, name: &str) -> Option<SourceEngine> {
        self.sources.get(name).map(|s| s.engine())
    }

    pub fn normalize(&self, raw: &RawNotification) -> Result<NormalizedChange, NormalizationError> {
        let source = self
            .sources
            .get(&raw.source)
            .ok_or_else(|| NormalizationError::UnknownSource(raw.source.clone()))?;
        let event = source.normalize(&raw.payload)?;
        Ok(NormalizedChange {
            event,
            context: raw.context.clone(),
        })
    }
}

pub(crate) fn required_str<'a>(
    obj: &'a Value,
    field: &'static str,
) -> Result<&'a str, NormalizationError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(NormalizationError::MissingField(field))
        }
        Some(other) => Err(NormalizationError::Malformed {
            field,
            reason: format!("expected string, got {}", other),
        }),
    }
}

pub(crate) fn optional_object(
    obj: &Value,
    field: &'static str,
) -> Result<Option<FieldMap>, NormalizationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(NormalizationError::Malformed {
            field,
            reason: format!("expected object, got {}", other),
        }),
    }
}

pub(crate) fn string_list(obj: &Value, field: &'static str) -> Result<Option<Vec<String>>, NormalizationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or(NormalizationError::Malformed {
                    field,
                    reason: "expected a list of column names".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(NormalizationError::Malformed {
            field,
            reason: "expected a list of column names".to_string(),
        }),
    }
}

/// Transaction ids come as numbers or strings depending on the engine.
pub(crate) fn transaction_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// First of `fields` present in `raw`, as a string. Used for log positions.
pub(crate) fn first_present(raw: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| transaction_id(raw.get(*field)))
}

/// Build the primary key from `columns` looked up in `image`, preserving column order.
pub(crate) fn key_from_columns(
    table: &str,
    columns: &[String],
    image: &FieldMap,
) -> Result<PrimaryKey, NormalizationError> {
    if columns.is_empty() {
        return Err(NormalizationError::MissingPrimaryKey {
            table: table.to_string(),
        });
    }
    let mut key = Vec::with_capacity(columns.len());
    for column in columns {
        match image.get(column) {
            Some(value) if !value.is_null() => key.push((column.clone(), value.clone())),
            _ => {
                return Err(NormalizationError::MissingKeyValue {
                    table: table.to_string(),
                    column: column.clone(),
                })
            }
        }
    }
    Ok(PrimaryKey::new(key))
}

/// Resolution order: configured hint, then the key the payload names, then an `id` column.
pub(crate) fn resolve_key(
    table: &str,
    image: &FieldMap,
    hint: Option<&[String]>,
    payload_key: Option<Vec<String>>,
) -> Result<PrimaryKey, NormalizationError> {
    if let Some(cols) = hint {
        return key_from_columns(table, cols, image);
    }
    if let Some(cols) = payload_key.filter(|cols| !cols.is_empty()) {
        return key_from_columns(table, &cols, image);
    }
    if image.get("id").is_some_and(|v| !v.is_null()) {
        return key_from_columns(table, &["id".to_string()], image);
    }
    Err(NormalizationError::MissingPrimaryKey {
        table: table.to_string(),
    })
}

/// Remove sync bookkeeping from a row image, returning the origin marker if present.
pub(crate) fn take_origin(image: &mut Option<FieldMap>) -> Option<String> {
    let map = image.as_mut()?;
    let origin = map.remove(ORIGIN_FIELD);
    for field in META_FIELDS {
        map.remove(*field);
    }
    match origin? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][+zz]`, epoch seconds or milliseconds,
/// and the extended-JSON `$date` / `$timestamp` wrappers.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, NormalizationError> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                from_epoch(i as f64)
            } else if let Some(f) = n.as_f64() {
                from_epoch(f)
            } else {
                Err(NormalizationError::Timestamp(n.to_string()))
            }
        }
        Value::Object(map) => {
            if let Some(inner) = map.get("$date") {
                return match inner {
                    Value::Object(wrapped) => match wrapped.get("$numberLong") {
                        Some(Value::String(s)) => s
                            .parse::<i64>()
                            .ok()
                            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                            .ok_or_else(|| NormalizationError::Timestamp(s.clone())),
                        _ => Err(NormalizationError::Timestamp(inner.to_string())),
                    },
                    Value::Number(n) => n
                        .as_i64()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .ok_or_else(|| NormalizationError::Timestamp(n.to_string())),
                    other => parse_timestamp(other),
                };
            }
            if let Some(Value::Object(ts)) = map.get("$timestamp") {
                if let Some(secs) = ts.get("t").and_then(Value::as_i64) {
                    return Utc
                        .timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| NormalizationError::Timestamp(secs.to_string()));
                }
            }
            Err(NormalizationError::Timestamp(value.to_string()))
        }
        other => Err(NormalizationError::Timestamp(other.to_string())),
    }
}

fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, NormalizationError> {
    let trimmed = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return from_epoch(n);
    }
    Err(NormalizationError::Timestamp(s.to_string()))
}

// Values above 1e11 cannot be seconds before the year 5138, so they are millis.
fn from_epoch(n: f64) -> Result<DateTime<Utc>, NormalizationError> {
    let millis = if n.abs() > 1e11 { n } else { n * 1000.0 };
    if !millis.is_finite() {
        return Err(NormalizationError::Timestamp(n.to_string()));
    }
    let whole = millis.trunc() as i64;
    let micros = ((millis - millis.trunc()) * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(whole)
        .single()
        .map(|ts| ts + chrono::Duration::microseconds(micros))
        .ok_or_else(|| NormalizationError::Timestamp(n.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        assert_eq!(parse_timestamp(&json!("2024-05-01T10:00:00Z")).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!("2024-05-01 12:00:00+02")).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!("2024-05-01 10:00:00")).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!(1714557600)).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!(1714557600000i64)).unwrap(), expected);
        assert_eq!(
            parse_timestamp(&json!({"$date": {"$numberLong": "1714557600000"}})).unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp(&json!({"$timestamp": {"t": 1714557600, "i": 3}})).unwrap(),
            expected
        );
        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert!(parse_timestamp(&json!(null)).is_err());
    }

    #[test]
    fn test_resolve_key_prefers_hint() {
        let row = image(json!({"id": 1, "sku": "A-1", "region": "eu"}));
        let hint = vec!["region".to_string(), "sku".to_string()];
        let key = resolve_key("items", &row, Some(&hint), Some(vec!["id".to_string()])).unwrap();
        assert_eq!(key.columns().collect::<Vec<_>>(), vec!["region", "sku"]);

        let key = resolve_key("items", &row, None, Some(vec!["sku".to_string()])).unwrap();
        assert_eq!(key.get("sku"), Some(&json!("A-1")));

        let key = resolve_key("items", &row, None, None).unwrap();
        assert_eq!(key.get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_resolve_key_fails_without_candidates() {
        let row = image(json!({"name": "x"}));
        assert!(matches!(
            resolve_key("items", &row, None, None),
            Err(NormalizationError::MissingPrimaryKey { .. })
        ));
        let cols = vec!["sku".to_string()];
        assert!(matches!(
            resolve_key("items", &row, Some(&cols), None),
            Err(NormalizationError::MissingKeyValue { .. })
        ));
    }

    #[test]
    fn test_origin_marker_is_stripped() {
        let mut after = Some(image(json!({"id": 1, "_sync_origin": "mysql-main"})));
        assert_eq!(take_origin(&mut after).as_deref(), Some("mysql-main"));
        assert!(after.unwrap().get(ORIGIN_FIELD).is_none());
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let normalizer = Normalizer::new();
        let raw = RawNotification {
            source: "nope".to_string(),
            context: OperationContext::default(),
            payload: json!({}),
        };
        assert!(matches!(
            normalizer.normalize(&raw),
            Err(NormalizationError::UnknownSource(_))
        ));
    }
}
