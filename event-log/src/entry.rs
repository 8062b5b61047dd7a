use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// What a log entry carries. The payload is canonical JSON for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Change,
    Audit,
    Sync,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Change => "change",
            EntryKind::Audit => "audit",
            EntryKind::Sync => "sync",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "change" => Ok(EntryKind::Change),
            "audit" => Ok(EntryKind::Audit),
            "sync" => Ok(EntryKind::Sync),
            other => Err(anyhow!("unknown entry kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub topic: String,
    pub partition: u32,
    pub key: String,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl NewEntry {
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        partition: u32,
        key: impl Into<String>,
        kind: EntryKind,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            partition,
            key: key.into(),
            kind,
            payload: serde_json::to_vec(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: i64,
    pub topic: String,
    pub partition: u32,
    pub key: String,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
    pub created_at: String,
}

impl LogEntry {
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| anyhow!("failed to decode {} entry {}: {err}", self.kind, self.offset))
    }
}
