//! Shared relay types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier a producer registers under and consumers subscribe to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProducerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProducerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-socket identifier, minted on accept
pub type ConnectionId = String;

pub fn new_connection_id() -> ConnectionId {
    uuid::Uuid::new_v4().to_string()
}

/// One buffered message awaiting hand-off to the outbound process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub producer_id: ProducerId,
    pub payload: String,
}

impl BufferEntry {
    pub fn new(producer_id: ProducerId, payload: impl Into<String>) -> Self {
        Self {
            producer_id,
            payload: payload.into(),
        }
    }
}

/// Point-in-time copy of buffered entries and live producer ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<BufferEntry>,
    pub active_ids: BTreeSet<ProducerId>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.active_ids.is_empty()
    }
}
