// ABOUTME: Status and operator commands - sync ledger summary, health file, conflict resolution
// ABOUTME: Resolution and retry start the services so the write goes through the breaker

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::{AppConfig, Tunables};
use crate::metrics::{HealthReport, HealthStatus};
use crate::pipeline::Services;
use crate::sync::{PairId, SyncLedger, SyncRecord, SyncStatus, Winner};

/// How long `retry` waits for the re-run before shutting down. A record still
/// PENDING afterwards is picked up again on the next start.
const RETRY_WAIT: Duration = Duration::from_secs(120);

/// Summarize the persisted sync ledger, listing records that need an operator.
pub async fn sync_status(
    ledger_path: &Path,
    pair: Option<&PairId>,
    status: Option<SyncStatus>,
) -> Result<()> {
    if !ledger_path.exists() {
        println!("No sync ledger at {}", ledger_path.display());
        return Ok(());
    }
    let ledger = SyncLedger::load(ledger_path).await?;
    let selected = select(&ledger, pair, status);

    let mut per_pair: BTreeMap<String, BTreeMap<&'static str, usize>> = BTreeMap::new();
    for record in &selected {
        *per_pair
            .entry(record.pair.to_string())
            .or_default()
            .entry(record.status.as_str())
            .or_default() += 1;
    }

    let updated = ledger
        .updated_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!("Sync ledger: {} (updated {})", ledger_path.display(), updated);
    if per_pair.is_empty() {
        println!("  no matching records");
    }
    for (pair, counts) in &per_pair {
        let summary: Vec<String> = counts
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect();
        println!("  {}: {}", pair, summary.join(" "));
    }

    let attention: Vec<&&SyncRecord> = selected
        .iter()
        .filter(|r| matches!(r.status, SyncStatus::Failed | SyncStatus::Conflict))
        .collect();
    if !attention.is_empty() {
        println!();
        println!("Needs attention:");
        for record in attention {
            println!(
                "  {} {} {}.{} {} attempt={} {}",
                record.status,
                record.pair,
                record.event.schema.as_deref().unwrap_or("-"),
                record.event.table,
                record.event.event_id,
                record.attempt,
                record.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn select<'a>(
    ledger: &'a SyncLedger,
    pair: Option<&PairId>,
    status: Option<SyncStatus>,
) -> Vec<&'a SyncRecord> {
    ledger
        .records()
        .filter(|r| pair.map_or(true, |p| &r.pair == p))
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect()
}

/// Print the last health report. Fails when the process reported itself unhealthy.
pub fn health(health_path: &Path) -> Result<HealthReport> {
    let report = HealthReport::read_from(health_path)?;
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize health report")?;
    println!("{}", json);
    if report.status == HealthStatus::Unhealthy {
        bail!("audit-sync is unhealthy as of {}", report.generated_at);
    }
    Ok(report)
}

/// Settle a CONFLICT(MANUAL) record with the operator's choice of winner.
pub async fn resolve_conflict(
    config: AppConfig,
    tunables: Tunables,
    pair: &PairId,
    event_id: &str,
    winner: Winner,
) -> Result<SyncRecord> {
    let services = Services::from_config(config, tunables).await?;
    let outcome = services.engine.resolve_manual(pair, event_id, winner).await;
    services.shutdown().await?;
    let record = outcome?;
    println!("✓ {} on {} resolved, status {}", event_id, pair, record.status);
    Ok(record)
}

/// Move a FAILED record back to PENDING and run it again.
pub async fn retry_failed(
    config: AppConfig,
    tunables: Tunables,
    pair: &PairId,
    event_id: &str,
) -> Result<SyncStatus> {
    let services = Services::from_config(config, tunables).await?;
    let queued = services.engine.retry_failed(pair, event_id).await;
    let settled = match queued {
        Ok(()) => Ok(services
            .engine
            .wait_settled(pair, event_id, RETRY_WAIT)
            .await),
        Err(e) => Err(e),
    };
    services.shutdown().await?;
    let status = settled?
        .map(|r| r.status)
        .with_context(|| format!("No sync record for {} on {}", event_id, pair))?;
    println!("{} on {} is now {}", event_id, pair, status);
    Ok(status)
}
