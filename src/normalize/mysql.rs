// ABOUTME: MySQL row-based binlog (Maxwell-style) notifications to ChangeEvents
// ABOUTME: Rebuilds the UPDATE before image from `data` overlaid with `old`

use serde_json::Value;

use super::{
    first_present, optional_object, parse_timestamp, required_str, resolve_key, string_list,
    take_origin, transaction_id, ChangeSource, KeyHints,
};
use crate::error::NormalizationError;
use crate::event::{ChangeEvent, ChangeEventParts, Operation, SourceEngine};

pub struct MysqlSource {
    name: String,
    hints: KeyHints,
}

impl MysqlSource {
    pub fn new(name: impl Into<String>, hints: KeyHints) -> Self {
        Self {
            name: name.into(),
            hints,
        }
    }
}

impl ChangeSource for MysqlSource {
    fn engine(&self) -> SourceEngine {
        SourceEngine::Mysql
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, raw: &Value) -> Result<ChangeEvent, NormalizationError> {
        let operation: Operation = required_str(raw, "type")?.parse()?;
        let database = required_str(raw, "database")?.to_string();
        let table = required_str(raw, "table")?.to_string();
        let data = optional_object(raw, "data")?.ok_or(NormalizationError::MissingField("data"))?;

        let (mut before, mut after) = match operation {
            Operation::Insert => (None, Some(data)),
            Operation::Update => {
                // `old` holds only the columns that changed.
                let mut previous = data.clone();
                if let Some(old) = optional_object(raw, "old")? {
                    for (column, value) in old {
                        previous.insert(column, value);
                    }
                }
                (Some(previous), Some(data))
            }
            Operation::Delete => (Some(data), None),
        };
        let origin_after = take_origin(&mut after);
        let origin = origin_after.or(take_origin(&mut before));

        let key_image = after
            .as_ref()
            .or(before.as_ref())
            .ok_or(NormalizationError::MissingField("data"))?;
        let primary_key = resolve_key(
            &table,
            key_image,
            self.hints.for_table(Some(&database), &table),
            string_list(raw, "primary_key_columns")?,
        )?;

        let source_timestamp =
            parse_timestamp(raw.get("ts").ok_or(NormalizationError::MissingField("ts"))?)?;

        ChangeEvent::from_parts(ChangeEventParts {
            source_engine: SourceEngine::Mysql,
            source_name: self.name.clone(),
            schema: Some(database),
            table,
            operation,
            primary_key,
            before,
            after,
            transaction_id: transaction_id(raw.get("xid")),
            position: binlog_position(raw),
            source_timestamp,
            origin,
        })
    }
}

// Binlog coordinates plus the row's offset inside its transaction.
fn binlog_position(raw: &Value) -> Option<String> {
    let position = first_present(raw, &["position"]);
    let offset = first_present(raw, &["xoffset"]);
    match (position, offset) {
        (Some(position), Some(offset)) => Some(format!("{}#{}", position, offset)),
        (Some(position), None) => Some(position),
        (None, Some(offset)) => Some(format!("#{}", offset)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MysqlSource {
        MysqlSource::new("mysql-main", KeyHints::default())
    }

    #[test]
    fn test_update_overlays_old_columns() {
        let raw = json!({
            "database": "shop",
            "table": "products",
            "type": "update",
            "ts": 1714557600,
            "xid": 940752,
            "data": {"id": 42, "price": 110, "name": "lamp"},
            "old": {"price": 100},
            "primary_key_columns": ["id"]
        });
        let event = source().normalize(&raw).unwrap();
        let before = event.before.as_ref().unwrap();
        assert_eq!(before["price"], json!(100));
        assert_eq!(before["name"], json!("lamp"));
        assert_eq!(event.after.as_ref().unwrap()["price"], json!(110));
        assert_eq!(event.schema.as_deref(), Some("shop"));
        assert_eq!(event.transaction_id.as_deref(), Some("940752"));
    }

    #[test]
    fn test_rows_of_one_transaction_get_distinct_positions() {
        let row = |xoffset: u32, old: i64, new: i64| {
            json!({
                "database": "shop",
                "table": "products",
                "type": "update",
                "ts": 1714557600,
                "xid": 940752,
                "xoffset": xoffset,
                "position": "mysql-bin.000003:1204",
                "data": {"id": 42, "price": new},
                "old": {"price": old}
            })
        };
        let first = source().normalize(&row(0, 100, 110)).unwrap();
        let second = source().normalize(&row(1, 110, 120)).unwrap();
        assert_eq!(first.position.as_deref(), Some("mysql-bin.000003:1204#0"));
        assert_eq!(second.position.as_deref(), Some("mysql-bin.000003:1204#1"));
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn test_delete_keeps_before_only() {
        let raw = json!({
            "database": "shop",
            "table": "products",
            "type": "delete",
            "ts": 1714557600,
            "data": {"id": 42, "price": 110}
        });
        let event = source().normalize(&raw).unwrap();
        assert!(event.after.is_none());
        assert_eq!(event.primary_key.get("id"), Some(&json!(42)));
    }

    #[test]
    fn test_echoed_write_carries_origin() {
        let raw = json!({
            "database": "shop",
            "table": "products",
            "type": "insert",
            "ts": 1714557600,
            "data": {"id": 1, "_sync_origin": "pg-main"}
        });
        let event = source().normalize(&raw).unwrap();
        assert_eq!(event.origin.as_deref(), Some("pg-main"));
        assert!(event.after.as_ref().unwrap().get("_sync_origin").is_none());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let raw = json!({
            "database": "shop",
            "table": "events",
            "type": "insert",
            "ts": 1714557600,
            "data": {"payload": "x"}
        });
        assert!(matches!(
            source().normalize(&raw),
            Err(NormalizationError::MissingPrimaryKey { .. })
        ));
    }
}
