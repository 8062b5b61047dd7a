// ABOUTME: Library root for audit-sync
// ABOUTME: Exposes normalization, audit, bus, sync and resilience modules to the CLI and tests

pub mod audit;
pub mod bus;
pub mod commands;
pub mod config;
pub mod context;
pub mod destination;
pub mod error;
pub mod event;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod resilience;
pub mod sync;
pub mod utils;

pub use context::OperationContext;
pub use event::{ChangeEvent, Operation, PrimaryKey, SourceEngine};
pub use pipeline::Services;
