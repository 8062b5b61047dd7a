// ABOUTME: Audit trail - record construction, integrity and storage
// ABOUTME: Re-exports the builder, entity, signer and SQLite store

pub mod builder;
pub mod entity;
pub mod signing;
pub mod store;

pub use builder::{diff, AuditBuilder, AuditPolicy, SensitiveMatcher};
pub use entity::{AuditLogEntity, ComplianceRecord, AUDIT_RECORD_VERSION};
pub use signing::{verify_signature, RecordSigner};
pub use store::{AppendOutcome, AuditFilter, AuditStore, Page};
