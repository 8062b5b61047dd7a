// ABOUTME: Payloads carried on the event bus: change envelopes, sync events, gateway messages
// ABOUTME: Gateway messages are what the push gateway reads off the feed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::OperationContext;
use crate::event::ChangeEvent;
use crate::sync::{PairId, SyncStatus};

/// A change plus the context it was captured under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    pub event: ChangeEvent,
    #[serde(default)]
    pub context: OperationContext,
}

/// A change as read back from the log, with the offset to acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: i64,
    pub partition: u32,
    pub envelope: ChangeEnvelope,
}

/// One state transition of a sync record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub event_id: String,
    pub pair: PairId,
    pub status: SyncStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayType {
    #[serde(rename = "audit.created")]
    AuditCreated,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
    #[serde(rename = "sync.failed")]
    SyncFailed,
    #[serde(rename = "sync.conflict")]
    SyncConflict,
    /// PENDING and IN_PROGRESS transitions.
    #[serde(rename = "sync.progress")]
    SyncProgress,
}

impl GatewayType {
    pub fn for_status(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Completed => GatewayType::SyncCompleted,
            SyncStatus::Failed => GatewayType::SyncFailed,
            SyncStatus::Conflict => GatewayType::SyncConflict,
            SyncStatus::Pending | SyncStatus::InProgress => GatewayType::SyncProgress,
        }
    }
}

/// `{type, tenantId, data, timestamp}` on a tenant-scoped channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayMessage {
    #[serde(rename = "type")]
    pub kind: GatewayType,
    pub tenant_id: Option<String>,
    pub channel: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl GatewayMessage {
    pub fn new(kind: GatewayType, context: &OperationContext, data: Value) -> Self {
        Self {
            kind,
            tenant_id: context.tenant_id.clone(),
            channel: context.tenant_channel().to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}
