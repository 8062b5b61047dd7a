// ABOUTME: Event bus - durable, key-partitioned transport on top of the event-log crate
// ABOUTME: Changes feed the sync engine; audit and sync events feed the push gateway

pub mod messages;
pub mod partitioner;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use event_log::{EntryKind, EventLog, LogEntry, NewEntry};

use crate::audit::AuditLogEntity;
use crate::context::OperationContext;

pub use messages::{ChangeEnvelope, Delivery, GatewayMessage, GatewayType, SyncEvent};
pub use partitioner::KeyPartitioner;

pub struct EventBus {
    log: Mutex<EventLog>,
    partitioner: KeyPartitioner,
}

impl EventBus {
    pub fn open(path: impl AsRef<Path>, partitions: u32) -> Result<Self> {
        let path = path.as_ref();
        let log = EventLog::open(path)
            .with_context(|| format!("Failed to open event bus at {}", path.display()))?;
        tracing::info!(partitions, "event bus opened at {}", path.display());
        Ok(Self {
            log: Mutex::new(log),
            partitioner: KeyPartitioner::new(partitions),
        })
    }

    pub fn partitioner(&self) -> KeyPartitioner {
        self.partitioner
    }

    fn log(&self) -> MutexGuard<'_, EventLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a change on `{sourceEngine}.{table}`, partitioned by primary key.
    pub fn publish_change(&self, envelope: &ChangeEnvelope) -> Result<Delivery> {
        let key = envelope.event.partition_key();
        let partition = self.partitioner.partition(&key);
        let entry = NewEntry::json(
            envelope.event.topic(),
            partition,
            key,
            EntryKind::Change,
            envelope,
        )?;
        let offset = self.log().append(&entry).with_context(|| {
            format!("Failed to publish change {}", envelope.event.event_id)
        })?;
        Ok(Delivery {
            offset,
            partition,
            envelope: envelope.clone(),
        })
    }

    pub fn publish_audit(&self, record: &AuditLogEntity, ctx: &OperationContext) -> Result<i64> {
        let key = format!("{}:{}", record.table_name, record.primary_key.key_string());
        let data = serde_json::to_value(record).context("Failed to serialize audit record")?;
        self.publish_gateway(
            format!("{}.{}", record.db_engine, record.table_name),
            key,
            EntryKind::Audit,
            GatewayMessage::new(GatewayType::AuditCreated, ctx, data),
        )
    }

    /// Sync transitions share the partition of the row they belong to.
    pub fn publish_sync(
        &self,
        event: &SyncEvent,
        row_key: &str,
        ctx: &OperationContext,
    ) -> Result<i64> {
        let data = serde_json::to_value(event).context("Failed to serialize sync event")?;
        self.publish_gateway(
            format!("sync.{}", event.pair),
            row_key.to_string(),
            EntryKind::Sync,
            GatewayMessage::new(GatewayType::for_status(event.status), ctx, data),
        )
    }

    fn publish_gateway(
        &self,
        topic: String,
        key: String,
        kind: EntryKind,
        message: GatewayMessage,
    ) -> Result<i64> {
        let partition = self.partitioner.partition(&key);
        let entry = NewEntry::json(topic, partition, key, kind, &message)?;
        self.log().append(&entry)
    }

    pub fn ack(&self, consumer: &str, offset: i64) -> Result<bool> {
        self.log().ack(consumer, offset)
    }

    pub fn is_acked(&self, consumer: &str, offset: i64) -> Result<bool> {
        self.log().is_acked(consumer, offset)
    }

    /// Changes `consumer` has not acknowledged, oldest first. Entries that no
    /// longer decode are acknowledged and logged so replay cannot stall on them.
    pub fn pending_changes(
        &self,
        consumer: &str,
        after_offset: i64,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let log = self.log();
        let entries = log.fetch_unacked(consumer, EntryKind::Change, after_offset, limit)?;
        decode_changes(&log, consumer, entries)
    }

    /// [`EventBus::pending_changes`] for a single partition.
    pub fn pending_changes_in(
        &self,
        consumer: &str,
        partition: u32,
        after_offset: i64,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let log = self.log();
        let entries =
            log.fetch_unacked_in(consumer, EntryKind::Change, partition, after_offset, limit)?;
        decode_changes(&log, consumer, entries)
    }

    /// Raw entries, for status output and tests.
    pub fn entries(&self, kind: Option<EntryKind>, after_offset: i64, limit: usize) -> Result<Vec<LogEntry>> {
        self.log().list_after(kind, after_offset, limit)
    }

    /// Gateway messages of one kind, decoded.
    pub fn gateway_messages(&self, kind: EntryKind, after_offset: i64, limit: usize) -> Result<Vec<GatewayMessage>> {
        self.entries(Some(kind), after_offset, limit)?
            .iter()
            .map(|entry| entry.decode::<GatewayMessage>())
            .collect()
    }

    pub fn head_offset(&self) -> Result<i64> {
        self.log().head_offset()
    }
}

fn decode_changes(log: &EventLog, consumer: &str, entries: Vec<LogEntry>) -> Result<Vec<Delivery>> {
    let mut deliveries = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.decode::<ChangeEnvelope>() {
            Ok(envelope) => deliveries.push(Delivery {
                offset: entry.offset,
                partition: entry.partition,
                envelope,
            }),
            Err(e) => {
                tracing::error!(offset = entry.offset, consumer, "skipping undecodable change: {:#}", e);
                log.ack(consumer, entry.offset)?;
            }
        }
    }
    Ok(deliveries)
}

/// Pull the payload of a gateway message back into a typed value.
pub fn gateway_data<T: for<'de> serde::Deserialize<'de>>(message: &GatewayMessage) -> Result<T> {
    serde_json::from_value::<T>(message.data.clone())
        .with_context(|| format!("Failed to decode {:?} payload", message.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::update_parts;
    use crate::event::ChangeEvent;
    use crate::sync::{PairId, SyncStatus};
    use chrono::Utc;
    use serde_json::json;

    fn bus() -> (tempfile::TempDir, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::open(dir.path().join("bus.db"), 8).unwrap();
        (dir, bus)
    }

    fn envelope(id: i64, price: i64) -> ChangeEnvelope {
        let mut parts = update_parts("products", id, json!({"price": price - 10}), json!({"price": price}));
        parts.transaction_id = Some(format!("tx-{}", price));
        ChangeEnvelope {
            event: ChangeEvent::from_parts(parts).unwrap(),
            context: OperationContext::new("acme"),
        }
    }

    #[test]
    fn test_same_key_same_partition_in_order() {
        let (_dir, bus) = bus();
        let first = bus.publish_change(&envelope(42, 110)).unwrap();
        let second = bus.publish_change(&envelope(42, 120)).unwrap();
        assert_eq!(first.partition, second.partition);
        assert!(second.offset > first.offset);

        let pending = bus.pending_changes("sync:a->b", 0, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].envelope, first.envelope);
        assert_eq!(pending[1].envelope.event.after.as_ref().unwrap()["price"], json!(120));
    }

    #[test]
    fn test_partition_read_returns_only_that_partition() {
        let (_dir, bus) = bus();
        let deliveries: Vec<Delivery> = (1..=16)
            .map(|id| bus.publish_change(&envelope(id, 100 + id)).unwrap())
            .collect();
        let target = deliveries[0].partition;
        let expected: Vec<i64> = deliveries
            .iter()
            .filter(|d| d.partition == target)
            .map(|d| d.offset)
            .collect();
        let pending = bus.pending_changes_in("sync:a->b", target, 0, 100).unwrap();
        assert_eq!(pending.iter().map(|d| d.offset).collect::<Vec<_>>(), expected);
        assert!(pending.iter().all(|d| d.partition == target));
    }

    #[test]
    fn test_ack_hides_change_from_that_consumer_only() {
        let (_dir, bus) = bus();
        let delivery = bus.publish_change(&envelope(1, 10)).unwrap();
        assert!(bus.ack("sync:a->b", delivery.offset).unwrap());
        assert!(!bus.ack("sync:a->b", delivery.offset).unwrap());
        assert!(bus.pending_changes("sync:a->b", 0, 10).unwrap().is_empty());
        assert_eq!(bus.pending_changes("sync:a->c", 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_sync_event_reaches_gateway_feed() {
        let (_dir, bus) = bus();
        let event = SyncEvent {
            event_id: "e1".to_string(),
            pair: PairId::new("a", "b"),
            status: SyncStatus::Completed,
            attempt: 0,
            lag_ms: Some(12),
            error: None,
            at: Utc::now(),
        };
        bus.publish_sync(&event, "products:[[\"id\",1]]", &OperationContext::new("acme"))
            .unwrap();
        let messages = bus.gateway_messages(EntryKind::Sync, 0, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, GatewayType::SyncCompleted);
        assert_eq!(messages[0].tenant_id.as_deref(), Some("acme"));
        let decoded: SyncEvent = gateway_data(&messages[0]).unwrap();
        assert_eq!(decoded, event);
    }
}
