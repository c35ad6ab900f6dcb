//! Producer registry
//!
//! Tracks which producer ids are live on the inbound process. An id can be held by at
//! most one connection at a time.

use std::collections::{BTreeSet, HashMap};

use crate::error::{RelayError, Result};
use crate::types::{ConnectionId, ProducerId};

#[derive(Debug, Default)]
pub struct ProducerRegistry {
    /// connection_id -> producer id it registered
    connections: HashMap<ConnectionId, ProducerId>,
    live: BTreeSet<ProducerId>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection_id` as `producer_id`.
    ///
    /// Fails with [`RelayError::DuplicateId`] when the id is already live, leaving the
    /// current holder untouched. A registered connection joining with a different free id
    /// moves its registration.
    pub fn join(&mut self, connection_id: &str, producer_id: ProducerId) -> Result<()> {
        if self.live.contains(&producer_id) {
            return Err(RelayError::DuplicateId(producer_id));
        }
        if let Some(previous) = self.connections.remove(connection_id) {
            self.live.remove(&previous);
        }
        self.live.insert(producer_id.clone());
        self.connections.insert(connection_id.to_string(), producer_id);
        Ok(())
    }

    /// Drop the registration held by `connection_id`, if any
    pub fn leave(&mut self, connection_id: &str) -> Option<ProducerId> {
        let producer_id = self.connections.remove(connection_id)?;
        self.live.remove(&producer_id);
        Some(producer_id)
    }

    pub fn producer_of(&self, connection_id: &str) -> Option<&ProducerId> {
        self.connections.get(connection_id)
    }

    pub fn is_live(&self, producer_id: &ProducerId) -> bool {
        self.live.contains(producer_id)
    }

    /// Copy of the live id set
    pub fn snapshot_ids(&self) -> BTreeSet<ProducerId> {
        self.live.clone()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
