// ABOUTME: Bounded intake queue between capture adapters and the normalizer
// ABOUTME: Capture side never blocks; full queues and bad notifications are counted and logged

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use super::{NormalizedChange, Normalizer, RawNotification};
use crate::metrics::MetricsReporter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("intake queue is full")]
    QueueFull,
    #[error("intake queue is closed")]
    Closed,
}

/// Sending half, cloned into each capture adapter.
#[derive(Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<RawNotification>,
    metrics: Arc<MetricsReporter>,
}

pub struct IntakeReceiver {
    rx: mpsc::Receiver<RawNotification>,
    normalizer: Arc<Normalizer>,
    metrics: Arc<MetricsReporter>,
}

pub fn intake_queue(
    capacity: usize,
    normalizer: Arc<Normalizer>,
    metrics: Arc<MetricsReporter>,
) -> (IntakeQueue, IntakeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        IntakeQueue {
            tx,
            metrics: metrics.clone(),
        },
        IntakeReceiver {
            rx,
            normalizer,
            metrics,
        },
    )
}

impl IntakeQueue {
    /// Hand a notification over without waiting. A full queue drops it.
    pub fn try_submit(&self, raw: RawNotification) -> Result<(), IntakeError> {
        match self.tx.try_send(raw) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(raw)) => {
                self.metrics.record_intake_dropped();
                tracing::warn!(source = %raw.source, "intake queue full, dropping notification");
                Err(IntakeError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IntakeError::Closed),
        }
    }

    /// Wait for room in the queue. For replay-style feeders that can afford backpressure.
    pub async fn submit(&self, raw: RawNotification) -> Result<(), IntakeError> {
        self.tx.send(raw).await.map_err(|_| IntakeError::Closed)
    }
}

impl IntakeReceiver {
    /// Next successfully normalized change; `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<NormalizedChange> {
        while let Some(raw) = self.rx.recv().await {
            match self.normalizer.normalize(&raw) {
                Ok(change) => return Some(change),
                Err(e) => {
                    let engine = self.normalizer.engine_of(&raw.source);
                    self.metrics.record_normalization_error(engine);
                    tracing::warn!(source = %raw.source, error = %e, "dropping notification");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OperationContext;
    use crate::normalize::mysql::MysqlSource;
    use crate::normalize::KeyHints;
    use serde_json::json;

    fn normalizer() -> Arc<Normalizer> {
        let mut normalizer = Normalizer::new();
        normalizer.register(Arc::new(MysqlSource::new("mysql-main", KeyHints::default())));
        Arc::new(normalizer)
    }

    fn raw(id: i64) -> RawNotification {
        RawNotification {
            source: "mysql-main".to_string(),
            context: OperationContext::new("acme"),
            payload: json!({
                "database": "shop",
                "table": "products",
                "type": "insert",
                "ts": 1714557600,
                "data": {"id": id}
            }),
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let metrics = Arc::new(MetricsReporter::new(5000));
        let (queue, _rx) = intake_queue(1, normalizer(), metrics.clone());
        queue.try_submit(raw(1)).unwrap();
        assert_eq!(queue.try_submit(raw(2)), Err(IntakeError::QueueFull));
        assert_eq!(metrics.snapshot_counters().intake_dropped, 1);
    }

    #[tokio::test]
    async fn test_bad_notifications_are_skipped_and_counted() {
        let metrics = Arc::new(MetricsReporter::new(5000));
        let (queue, mut rx) = intake_queue(8, normalizer(), metrics.clone());
        let mut bad = raw(1);
        bad.payload = json!({"type": "insert"});
        queue.try_submit(bad).unwrap();
        queue.try_submit(raw(7)).unwrap();
        drop(queue);

        let change = rx.next().await.unwrap();
        assert_eq!(change.event.primary_key.get("id"), Some(&json!(7)));
        assert_eq!(change.context.tenant_id.as_deref(), Some("acme"));
        assert!(rx.next().await.is_none());
        assert_eq!(metrics.snapshot_counters().normalization_errors, 1);
    }
}
