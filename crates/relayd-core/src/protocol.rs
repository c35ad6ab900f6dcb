//! Wire protocol
//!
//! Every event is one JSON text frame, internally tagged by `event`:
//!
//! - producer channel: `{ event: "join", id }`, `{ event: "incoming_data", id, data }`,
//!   `{ event: "leave" }` / replies `joined`, `duplicate_connection`
//! - peer channel: `{ event: "listen", seq }` / reply `{ event: "snapshot", seq, data, active }`
//! - consumer channel: `{ event: "join", id }`, `{ event: "leave" }` / replies `joined`,
//!   `abort_connection`, `broadcast_message`

use serde::{Deserialize, Serialize};

use crate::types::{BufferEntry, ProducerId, Snapshot};

/// Messages from a producer to the inbound process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProducerMessage {
    Join { id: ProducerId },
    IncomingData { id: ProducerId, data: String },
    Leave,
}

/// Messages from the inbound process to a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProducerReply {
    Joined { id: ProducerId },
    DuplicateConnection,
}

/// Poll request from the outbound process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PeerRequest {
    Listen { seq: u64 },
}

/// Poll reply from the inbound process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PeerReply {
    Snapshot {
        seq: u64,
        #[serde(default)]
        data: Vec<BufferEntry>,
        #[serde(default)]
        active: Vec<ProducerId>,
    },
}

impl PeerReply {
    pub fn from_snapshot(seq: u64, snapshot: Snapshot) -> Self {
        PeerReply::Snapshot {
            seq,
            data: snapshot.entries,
            active: snapshot.active_ids.into_iter().collect(),
        }
    }

    /// Split into the request sequence number and the snapshot it carries
    pub fn into_snapshot(self) -> (u64, Snapshot) {
        match self {
            PeerReply::Snapshot { seq, data, active } => (
                seq,
                Snapshot {
                    entries: data,
                    active_ids: active.into_iter().collect(),
                },
            ),
        }
    }
}

/// Messages from a consumer to the outbound process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerMessage {
    Join { id: ProducerId },
    Leave,
}

/// Messages from the outbound process to a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerReply {
    Joined { id: ProducerId },
    AbortConnection { message: String },
    BroadcastMessage { data: Vec<String> },
}

impl ConsumerReply {
    pub fn abort_for(id: &ProducerId) -> Self {
        ConsumerReply::AbortConnection {
            message: format!("Producer '{}' is unavailable.", id),
        }
    }
}
