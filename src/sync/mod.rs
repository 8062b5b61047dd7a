// ABOUTME: Sync - replication pairs, record state machine, conflict resolution and workers
// ABOUTME: Re-exports the public surface used by the pipeline and the CLI

pub mod config;
pub mod engine;
pub mod record;
pub mod resolver;

pub use config::{ConflictStrategy, PairId, SyncConfig, SyncConfigRegistry, SyncMode};
pub use engine::{consumer_name, EngineSettings, SyncEngine};
pub use record::{SyncLedger, SyncRecord, SyncStatus};
pub use resolver::{resolve, Resolution, VersionStamp, Winner};
