// ABOUTME: run command - starts the services and feeds capture notifications into the intake
// ABOUTME: Notifications arrive as JSON lines on a file or stdin

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::{AppConfig, Tunables};
use crate::metrics::MetricsReporter;
use crate::normalize::{intake_queue, IntakeQueue, RawNotification};
use crate::pipeline::Services;

pub struct RunOptions {
    pub config: AppConfig,
    pub tunables: Tunables,
    /// JSON-lines notification feed; `-` reads stdin. Without one the process
    /// idles until Ctrl+C.
    pub input: Option<PathBuf>,
}

pub async fn run(opts: RunOptions) -> Result<()> {
    let services = Services::from_config(opts.config, opts.tunables).await?;
    let (queue, intake) = intake_queue(
        services.config.bus.intake_capacity,
        services.normalizer.clone(),
        services.metrics.clone(),
    );

    let idle_queue = match opts.input {
        Some(path) => {
            let metrics = services.metrics.clone();
            tokio::spawn(async move {
                match feed_from_path(&path, queue, metrics).await {
                    Ok(fed) => tracing::info!(fed, "notification feed finished"),
                    Err(e) => tracing::error!("notification feed failed: {:#}", e),
                }
            });
            None
        }
        None => Some(queue),
    };

    let ledger = services.run(intake).await?;
    drop(idle_queue);

    let counts = ledger.status_counts();
    tracing::info!(records = ledger.len(), ?counts, "sync ledger saved");
    Ok(())
}

async fn feed_from_path(
    path: &Path,
    queue: IntakeQueue,
    metrics: Arc<MetricsReporter>,
) -> Result<u64> {
    if path == Path::new("-") {
        let reader = BufReader::new(tokio::io::stdin());
        return feed_lines(reader, &queue, &metrics).await;
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open notification feed {}", path.display()))?;
    feed_lines(BufReader::new(file), &queue, &metrics).await
}

/// Submit each JSON line as a `RawNotification`. Unparseable lines are counted
/// as normalization errors and skipped.
pub async fn feed_lines<R>(reader: R, queue: &IntakeQueue, metrics: &MetricsReporter) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut fed = 0;
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await.context("Failed to read notification feed")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawNotification = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                metrics.record_normalization_error(None);
                tracing::warn!(line = line_no, "skipping malformed notification: {}", e);
                continue;
            }
        };
        if queue.submit(raw).await.is_err() {
            tracing::warn!("intake closed, stopping notification feed");
            break;
        }
        fed += 1;
    }
    Ok(fed)
}
