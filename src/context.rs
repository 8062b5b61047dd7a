// ABOUTME: Explicit per-call operation context (tenant and actor)
// ABOUTME: Threaded through ingest, audit and gateway publication instead of ambient state

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Who caused a mutation and which tenant it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub actor: Actor,
}

impl OperationContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            actor: Actor::default(),
        }
    }

    pub fn with_actor(mut self, user_id: Option<String>, ip: Option<String>) -> Self {
        self.actor = Actor { user_id, ip };
        self
    }

    /// Tenant channel used by the push gateway; unscoped events go to "global".
    pub fn tenant_channel(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("global")
    }
}
