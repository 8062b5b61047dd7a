// ABOUTME: PostgreSQL logical decoding (wal2json) notifications to ChangeEvents
// ABOUTME: Row images come from columnnames/columnvalues and oldkeys

use serde_json::Value;

use super::{
    first_present, optional_object, parse_timestamp, required_str, resolve_key, string_list,
    take_origin, transaction_id, ChangeSource, KeyHints,
};
use crate::error::NormalizationError;
use crate::event::{ChangeEvent, ChangeEventParts, FieldMap, Operation, SourceEngine};

/// wal2json-style change. With `REPLICA IDENTITY FULL` the `oldkeys` image
/// carries the whole previous row; otherwise only the key columns.
pub struct PostgresSource {
    name: String,
    hints: KeyHints,
}

impl PostgresSource {
    pub fn new(name: impl Into<String>, hints: KeyHints) -> Self {
        Self {
            name: name.into(),
            hints,
        }
    }
}

impl ChangeSource for PostgresSource {
    fn engine(&self) -> SourceEngine {
        SourceEngine::Postgres
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, raw: &Value) -> Result<ChangeEvent, NormalizationError> {
        let operation: Operation = required_str(raw, "kind")?.parse()?;
        let schema = raw
            .get("schema")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let table = required_str(raw, "table")?.to_string();

        let new_row = zip_columns(raw, "columnnames", "columnvalues")?;
        let old_row = match optional_object(raw, "oldkeys")? {
            Some(oldkeys) => zip_columns(&Value::Object(oldkeys), "keynames", "keyvalues")?,
            None => None,
        };

        let (mut before, mut after) = match operation {
            Operation::Insert => (None, new_row),
            Operation::Update => (old_row, new_row),
            Operation::Delete => (old_row, None),
        };
        let origin_after = take_origin(&mut after);
        let origin = origin_after.or(take_origin(&mut before));

        let key_image = match operation {
            Operation::Delete => before.as_ref(),
            _ => after.as_ref(),
        }
        .ok_or(NormalizationError::MissingImage {
            operation: operation.as_str(),
            image: "a row",
        })?;

        let payload_key = match string_list(raw, "pk_columns")? {
            Some(cols) => Some(cols),
            None => raw
                .get("oldkeys")
                .map(|ok| string_list(ok, "keynames"))
                .transpose()?
                .flatten(),
        };
        let primary_key = resolve_key(
            &table,
            key_image,
            self.hints.for_table(schema.as_deref(), &table),
            payload_key,
        )?;

        let source_timestamp = parse_timestamp(
            raw.get("timestamp")
                .ok_or(NormalizationError::MissingField("timestamp"))?,
        )?;

        ChangeEvent::from_parts(ChangeEventParts {
            source_engine: SourceEngine::Postgres,
            source_name: self.name.clone(),
            schema,
            table,
            operation,
            primary_key,
            before,
            after,
            transaction_id: transaction_id(raw.get("xid")),
            position: first_present(raw, &["lsn", "nextlsn"]),
            source_timestamp,
            origin,
        })
    }
}

fn zip_columns(
    obj: &Value,
    names_field: &'static str,
    values_field: &'static str,
) -> Result<Option<FieldMap>, NormalizationError> {
    let names = match string_list(obj, names_field)? {
        Some(names) => names,
        None => return Ok(None),
    };
    let values = match obj.get(values_field) {
        Some(Value::Array(values)) => values,
        _ => return Err(NormalizationError::MissingField(values_field)),
    };
    if names.len() != values.len() {
        return Err(NormalizationError::Malformed {
            field: values_field,
            reason: format!("{} names but {} values", names.len(), values.len()),
        });
    }
    Ok(Some(names.into_iter().zip(values.iter().cloned()).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn source() -> PostgresSource {
        PostgresSource::new("pg-main", KeyHints::default())
    }

    #[test]
    fn test_update_uses_oldkeys_as_before_image() {
        let raw = json!({
            "kind": "update",
            "schema": "public",
            "table": "products",
            "columnnames": ["id", "price"],
            "columnvalues": [42, 110],
            "oldkeys": {"keynames": ["id", "price"], "keyvalues": [42, 100]},
            "xid": 5012,
            "timestamp": "2024-05-01 10:00:00.5+00"
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.schema.as_deref(), Some("public"));
        assert_eq!(event.before.as_ref().unwrap()["price"], json!(100));
        assert_eq!(event.after.as_ref().unwrap()["price"], json!(110));
        assert_eq!(event.transaction_id.as_deref(), Some("5012"));
        assert_eq!(event.primary_key.columns().collect::<Vec<_>>(), vec!["id", "price"]);
    }

    #[test]
    fn test_pk_columns_hint_wins_over_oldkeys() {
        let raw = json!({
            "kind": "insert",
            "schema": "public",
            "table": "products",
            "columnnames": ["id", "price"],
            "columnvalues": [42, 110],
            "pk_columns": ["id"],
            "timestamp": 1714557600
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.primary_key.len(), 1);
        assert!(event.before.is_none());
    }

    #[test]
    fn test_configured_hint_applies_to_delete() {
        let mut tables = HashMap::new();
        tables.insert("public.line_items".to_string(), vec!["order_id".to_string(), "line".to_string()]);
        let src = PostgresSource::new("pg-main", KeyHints::new(tables));
        let raw = json!({
            "kind": "delete",
            "schema": "public",
            "table": "line_items",
            "oldkeys": {"keynames": ["order_id", "line"], "keyvalues": [7, 2]},
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let event = src.normalize(&raw).unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert!(event.after.is_none());
        assert_eq!(event.primary_key.key_string(), r#"[["order_id",7],["line",2]]"#);
    }

    #[test]
    fn test_lsn_becomes_position() {
        let raw = json!({
            "kind": "insert",
            "schema": "public",
            "table": "products",
            "columnnames": ["id", "price"],
            "columnvalues": [42, 110],
            "xid": 5012,
            "lsn": "0/16B3748",
            "timestamp": "2024-05-01 10:00:00.5+00"
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.position.as_deref(), Some("0/16B3748"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = json!({"kind": "truncate", "table": "t", "timestamp": 0});
        assert!(matches!(
            source().normalize(&raw),
            Err(NormalizationError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_mismatched_columns_are_malformed() {
        let raw = json!({
            "kind": "insert",
            "table": "t",
            "columnnames": ["id", "a"],
            "columnvalues": [1],
            "timestamp": 0
        });
        assert!(matches!(
            source().normalize(&raw),
            Err(NormalizationError::Malformed { .. })
        ));
    }
}
