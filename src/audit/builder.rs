// ABOUTME: Builds AuditLogEntity records from ChangeEvents
// ABOUTME: Computes diffs, sensitivity, checksum and the optional signature

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::entity::{AuditLogEntity, AUDIT_RECORD_VERSION};
use super::signing::RecordSigner;
use crate::context::OperationContext;
use crate::error::BuildError;
use crate::event::{truncate_micros, ChangeEvent, FieldMap, Operation};

pub const DEFAULT_SENSITIVE_VOCABULARY: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "creditcard",
    "cardnumber",
    "cvv",
    "ssn",
    "iban",
];

/// Which events get audited. `None` means everything.
#[derive(Debug, Clone, Default)]
pub struct AuditPolicy {
    tables: Option<HashSet<String>>,
    operations: Option<HashSet<Operation>>,
}

impl AuditPolicy {
    pub fn new(tables: Option<Vec<String>>, operations: Option<Vec<Operation>>) -> Self {
        Self {
            tables: tables.map(|t| t.into_iter().collect()),
            operations: operations.map(|o| o.into_iter().collect()),
        }
    }

    /// Tables match on bare name or `schema.table`.
    pub fn allows(&self, event: &ChangeEvent) -> bool {
        let table_ok = match &self.tables {
            None => true,
            Some(tables) => {
                tables.contains(&event.table) || tables.contains(&event.qualified_table())
            }
        };
        let op_ok = match &self.operations {
            None => true,
            Some(ops) => ops.contains(&event.operation),
        };
        table_ok && op_ok
    }
}

/// Field-name matcher: names are lowercased and stripped to alphanumerics
/// before a substring test, so `credit_card_no` and `CreditCard` both hit `creditcard`.
#[derive(Debug, Clone)]
pub struct SensitiveMatcher {
    vocabulary: Vec<String>,
}

impl Default for SensitiveMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_VOCABULARY.iter().map(|s| s.to_string()))
    }
}

impl SensitiveMatcher {
    pub fn new(vocabulary: impl IntoIterator<Item = String>) -> Self {
        Self {
            vocabulary: vocabulary
                .into_iter()
                .map(|w| squash(&w))
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        let name = squash(field);
        self.vocabulary.iter().any(|word| name.contains(word.as_str()))
    }
}

fn squash(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Changed fields only. Removed fields appear in the old diff, added ones in the new.
pub fn diff(before: &FieldMap, after: &FieldMap) -> (FieldMap, FieldMap) {
    let mut old = FieldMap::new();
    let mut new = FieldMap::new();
    for (field, value) in before {
        match after.get(field) {
            Some(next) if next == value => {}
            Some(next) => {
                old.insert(field.clone(), value.clone());
                new.insert(field.clone(), next.clone());
            }
            None => {
                old.insert(field.clone(), value.clone());
            }
        }
    }
    for (field, value) in after {
        if !before.contains_key(field) {
            new.insert(field.clone(), value.clone());
        }
    }
    (old, new)
}

pub struct AuditBuilder {
    policy: AuditPolicy,
    sensitive: SensitiveMatcher,
    signer: Option<RecordSigner>,
}

impl AuditBuilder {
    pub fn new(policy: AuditPolicy, sensitive: SensitiveMatcher, signer: Option<RecordSigner>) -> Self {
        Self {
            policy,
            sensitive,
            signer,
        }
    }

    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    pub fn signing_enabled(&self) -> bool {
        self.signer.is_some()
    }

    pub fn build(
        &self,
        event: &ChangeEvent,
        ctx: &OperationContext,
    ) -> Result<AuditLogEntity, BuildError> {
        if event.table.trim().is_empty() {
            return Err(BuildError::MissingTable);
        }
        if event.primary_key.is_empty() {
            return Err(BuildError::MissingPrimaryKey(event.qualified_table()));
        }

        let (diff_old, diff_new) = match event.operation {
            Operation::Insert => (None, event.after.clone()),
            Operation::Delete => (event.before.clone(), None),
            Operation::Update => {
                let empty = FieldMap::new();
                let (old, new) = diff(
                    event.before.as_ref().unwrap_or(&empty),
                    event.after.as_ref().unwrap_or(&empty),
                );
                (Some(old), Some(new))
            }
        };

        let mut record = AuditLogEntity {
            id: Uuid::now_v7(),
            db_engine: event.source_engine,
            schema_name: event.schema.clone(),
            table_name: event.table.clone(),
            operation: event.operation,
            primary_key: event.primary_key.clone(),
            diff_old,
            diff_new,
            executed_by: ctx.actor.user_id.clone(),
            client_ip: ctx.actor.ip.clone(),
            executed_at: truncate_micros(Utc::now()),
            signature: None,
            metadata: Some(metadata(event, ctx)),
            contains_sensitive_data: false,
            version: AUDIT_RECORD_VERSION,
            checksum: String::new(),
        };
        record.contains_sensitive_data = record
            .affected_fields()
            .iter()
            .any(|field| self.sensitive.is_sensitive(field));
        record.checksum = record.compute_checksum();

        if let Some(signer) = &self.signer {
            match signer.sign(&record) {
                Ok(signature) => record.signature = Some(signature),
                Err(e) => tracing::warn!(
                    audit_id = %record.id,
                    "signing failed, storing checksum-only record: {:#}",
                    e
                ),
            }
        }
        Ok(record)
    }
}

fn metadata(event: &ChangeEvent, ctx: &OperationContext) -> FieldMap {
    let mut meta = FieldMap::new();
    meta.insert("eventId".to_string(), Value::String(event.event_id.clone()));
    meta.insert("sourceName".to_string(), Value::String(event.source_name.clone()));
    if let Some(tx) = &event.transaction_id {
        meta.insert("transactionId".to_string(), Value::String(tx.clone()));
    }
    if let Some(tenant) = &ctx.tenant_id {
        meta.insert("tenantId".to_string(), Value::String(tenant.clone()));
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::signing::verify_signature;
    use crate::event::tests::{fields, update_parts};
    use crate::event::ChangeEventParts;
    use serde_json::json;

    fn builder() -> AuditBuilder {
        AuditBuilder::new(AuditPolicy::default(), SensitiveMatcher::default(), None)
    }

    fn event(parts: ChangeEventParts) -> ChangeEvent {
        ChangeEvent::from_parts(parts).unwrap()
    }

    #[test]
    fn test_update_diff_keeps_only_changed_fields() {
        let ev = event(update_parts(
            "products",
            42,
            json!({"id": 42, "price": 100, "name": "lamp"}),
            json!({"id": 42, "price": 110, "name": "lamp"}),
        ));
        let record = builder().build(&ev, &OperationContext::default()).unwrap();
        assert_eq!(record.diff_old, Some(fields(json!({"price": 100}))));
        assert_eq!(record.diff_new, Some(fields(json!({"price": 110}))));
        assert_eq!(record.compute_checksum(), record.compute_checksum());
        assert_eq!(record.checksum, record.compute_checksum());
        assert_eq!(hex::decode(&record.checksum).unwrap().len(), 32);
        assert!(record.verify().is_ok());
    }

    #[test]
    fn test_diff_tracks_added_and_removed_fields() {
        let (old, new) = diff(
            &fields(json!({"a": 1, "gone": true})),
            &fields(json!({"a": 1, "added": "x"})),
        );
        assert_eq!(old, fields(json!({"gone": true})));
        assert_eq!(new, fields(json!({"added": "x"})));
    }

    #[test]
    fn test_insert_and_delete_diffs() {
        let mut parts = update_parts("users", 1, json!({"id": 1}), json!({"id": 1, "email": "a@b"}));
        parts.operation = Operation::Insert;
        let record = builder().build(&event(parts), &OperationContext::default()).unwrap();
        assert!(record.diff_old.is_none());
        assert_eq!(record.diff_new.unwrap()["email"], json!("a@b"));

        let mut parts = update_parts("users", 1, json!({"id": 1, "email": "a@b"}), json!({}));
        parts.operation = Operation::Delete;
        let record = builder().build(&event(parts), &OperationContext::default()).unwrap();
        assert!(record.diff_new.is_none());
        assert_eq!(record.diff_old.unwrap()["email"], json!("a@b"));
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let ev = event(update_parts("products", 42, json!({"price": 100}), json!({"price": 110})));
        let mut record = builder().build(&ev, &OperationContext::default()).unwrap();
        record.diff_new = Some(fields(json!({"price": 1})));
        assert!(record.verify().is_err());
    }

    #[test]
    fn test_sensitive_fields_are_flagged() {
        let matcher = SensitiveMatcher::default();
        assert!(matcher.is_sensitive("credit_card_number"));
        assert!(matcher.is_sensitive("CreditCard"));
        assert!(matcher.is_sensitive("user-password-hash"));
        assert!(!matcher.is_sensitive("price"));

        let ev = event(update_parts(
            "users",
            1,
            json!({"password": "a"}),
            json!({"password": "b"}),
        ));
        let record = builder().build(&ev, &OperationContext::default()).unwrap();
        assert!(record.contains_sensitive_data);
    }

    #[test]
    fn test_actor_and_tenant_are_recorded() {
        let ev = event(update_parts("t", 1, json!({"a": 1}), json!({"a": 2})));
        let ctx = OperationContext::new("acme")
            .with_actor(Some("u-7".to_string()), Some("10.1.1.1".to_string()));
        let record = builder().build(&ev, &ctx).unwrap();
        assert_eq!(record.executed_by.as_deref(), Some("u-7"));
        assert_eq!(record.client_ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(record.tenant_id(), Some("acme"));
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_signed_records_verify_with_the_key() {
        let signer = RecordSigner::new(b"audit-key".to_vec()).unwrap();
        let builder = AuditBuilder::new(AuditPolicy::default(), SensitiveMatcher::default(), Some(signer));
        let ev = event(update_parts("t", 1, json!({"a": 1}), json!({"a": 2})));
        let record = builder.build(&ev, &OperationContext::default()).unwrap();
        assert!(record.signature.is_some());
        assert!(verify_signature(&record, b"audit-key").is_ok());
        assert!(verify_signature(&record, b"other-key").is_err());
    }

    #[test]
    fn test_policy_filters_tables_and_operations() {
        let policy = AuditPolicy::new(
            Some(vec!["public.orders".to_string()]),
            Some(vec![Operation::Update]),
        );
        let ev = event(update_parts("orders", 1, json!({}), json!({})));
        assert!(policy.allows(&ev));
        let other = event(update_parts("users", 1, json!({}), json!({})));
        assert!(!policy.allows(&other));
    }

    #[test]
    fn test_compliance_format() {
        let ev = event(update_parts("products", 42, json!({"price": 100}), json!({"price": 110})));
        let record = builder().build(&ev, &OperationContext::default()).unwrap();
        let export = record.to_compliance_format();
        assert_eq!(export.operation_type, "UPDATE");
        assert_eq!(export.database_engine, "postgres");
        assert_eq!(export.affected_fields, vec!["price".to_string()]);
        assert_eq!(export.primary_key, json!({"id": 42}));
        let row = serde_json::to_value(&export).unwrap();
        assert!(row.get("audit_id").is_some());
        assert!(row.get("contains_sensitive_data").is_some());
    }
}
