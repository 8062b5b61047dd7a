// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Exports run, audit maintenance, and sync/health status commands

pub mod audit;
pub mod run;
pub mod status;

pub use audit::{evict, export_compliance, query_audit, verify_audit};
pub use run::run;
pub use status::{health, retry_failed, resolve_conflict, sync_status};

use anyhow::{bail, Result};

use crate::sync::PairId;

/// Parse a `source->target` pair name.
pub fn parse_pair(raw: &str) -> Result<PairId> {
    match raw.split_once("->") {
        Some((source, target)) if !source.trim().is_empty() && !target.trim().is_empty() => {
            Ok(PairId::new(source.trim(), target.trim()))
        }
        _ => bail!("Invalid sync pair '{}', expected SOURCE->TARGET", raw),
    }
}
