//! Inbound hub
//!
//! Owns the producer registry and the outgoing buffer behind a single lock, so joins,
//! leaves, appends and drains all serialize against each other and a snapshot never
//! observes a half-applied join.

use std::collections::BTreeSet;

use tokio::sync::Mutex;
use tracing::debug;

use super::buffer::OutgoingBuffer;
use super::registry::ProducerRegistry;
use crate::error::{RelayError, Result};
use crate::types::{ProducerId, Snapshot};

#[derive(Debug, Default)]
struct InboundState {
    registry: ProducerRegistry,
    buffer: OutgoingBuffer,
}

#[derive(Debug, Default)]
pub struct InboundHub {
    state: Mutex<InboundState>,
}

impl InboundHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, connection_id: &str, producer_id: ProducerId) -> Result<()> {
        self.state.lock().await.registry.join(connection_id, producer_id)
    }

    /// Release whatever `connection_id` holds; no-op for unknown connections
    pub async fn leave(&self, connection_id: &str) -> Option<ProducerId> {
        self.state.lock().await.registry.leave(connection_id)
    }

    /// Buffer a payload from `connection_id`, which must hold `producer_id`
    pub async fn append(
        &self,
        connection_id: &str,
        producer_id: ProducerId,
        payload: String,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.registry.producer_of(connection_id) != Some(&producer_id) {
            return Err(RelayError::UnknownProducer(producer_id));
        }
        state.buffer.append(producer_id, payload);
        Ok(())
    }

    /// Drain the buffer and copy the live id set in one step
    pub async fn snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().await;
        Snapshot {
            entries: state.buffer.drain(),
            active_ids: state.registry.snapshot_ids(),
        }
    }

    /// Throw away entries buffered while no peer was attached
    pub async fn discard_backlog(&self) -> usize {
        let discarded = self.state.lock().await.buffer.drain().len();
        if discarded > 0 {
            debug!(discarded, "Discarded buffered entries");
        }
        discarded
    }

    pub async fn active_ids(&self) -> BTreeSet<ProducerId> {
        self.state.lock().await.registry.snapshot_ids()
    }

    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }
}
