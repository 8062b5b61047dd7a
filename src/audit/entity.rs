// ABOUTME: AuditLogEntity - tamper-evident record of one mutation
// ABOUTME: Canonical checksum, verification and the compliance export format

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IntegrityError;
use crate::event::{format_timestamp, FieldMap, Operation, PrimaryKey, SourceEngine};

/// Current record format version.
pub const AUDIT_RECORD_VERSION: u32 = 1;

/// One audited mutation. The checksum covers engine, table, operation, primary key,
/// both diffs and the execution time; everything else is descriptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntity {
    pub id: Uuid,
    pub db_engine: SourceEngine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub operation: Operation,
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub diff_old: Option<FieldMap>,
    #[serde(default)]
    pub diff_new: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub executed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FieldMap>,
    #[serde(default)]
    pub contains_sensitive_data: bool,
    pub version: u32,
    pub checksum: String,
}

impl AuditLogEntity {
    /// Canonical JSON over the checksummed fields, in their fixed order.
    pub fn canonical_payload(&self) -> String {
        let opt = |m: &Option<FieldMap>| m.clone().map(Value::Object).unwrap_or(Value::Null);
        Value::Array(vec![
            Value::String(self.db_engine.as_str().to_string()),
            Value::String(self.table_name.clone()),
            Value::String(self.operation.as_str().to_string()),
            self.primary_key.to_canonical(),
            opt(&self.diff_old),
            opt(&self.diff_new),
            Value::String(format_timestamp(&self.executed_at)),
        ])
        .to_string()
    }

    pub fn compute_checksum(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_payload().as_bytes()))
    }

    /// Recompute the checksum and compare. Any mutation of a covered field fails.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let computed = self.compute_checksum();
        if computed == self.checksum {
            Ok(())
        } else {
            Err(IntegrityError::ChecksumMismatch {
                id: self.id.to_string(),
                stored: self.checksum.clone(),
                computed,
            })
        }
    }

    /// Field names present in either diff, sorted.
    pub fn affected_fields(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        for diff in [&self.diff_old, &self.diff_new].into_iter().flatten() {
            fields.extend(diff.keys().cloned());
        }
        fields.into_iter().collect()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("tenantId")?.as_str()
    }

    pub fn partition_key(&self) -> String {
        format!("{}/{}", self.table_name, self.executed_at.format("%Y-%m-%d"))
    }

    pub fn to_compliance_format(&self) -> ComplianceRecord {
        ComplianceRecord {
            audit_id: self.id.to_string(),
            database_engine: self.db_engine.as_str().to_string(),
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            operation_type: self.operation.as_str().to_string(),
            primary_key: serde_json::to_value(&self.primary_key).unwrap_or(Value::Null),
            executed_by: self.executed_by.clone(),
            executed_at: format_timestamp(&self.executed_at),
            client_ip: self.client_ip.clone(),
            affected_fields: self.affected_fields(),
            contains_sensitive_data: self.contains_sensitive_data,
            version: self.version,
            checksum: self.checksum.clone(),
        }
    }
}

/// Flat export row for compliance tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub audit_id: String,
    pub database_engine: String,
    pub schema_name: Option<String>,
    pub table_name: String,
    pub operation_type: String,
    pub primary_key: Value,
    pub executed_by: Option<String>,
    pub executed_at: String,
    pub client_ip: Option<String>,
    pub affected_fields: Vec<String>,
    pub contains_sensitive_data: bool,
    pub version: u32,
    pub checksum: String,
}
