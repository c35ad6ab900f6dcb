//! Outbound mirror of the inbound relay's state
//!
//! `active_ids` is replaced wholesale by every merged snapshot. `pending` only grows
//! through merges and shrinks one key at a time when a group's fan-out loop takes it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::types::{ProducerId, Snapshot};

pub type SharedMirror = Arc<Mutex<MirroredState>>;

#[derive(Debug, Default)]
pub struct MirroredState {
    active_ids: BTreeSet<ProducerId>,
    pending: HashMap<ProducerId, Vec<String>>,
}

impl MirroredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMirror {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Fold a snapshot in: replace the active set, queue payloads per producer in order
    pub fn merge(&mut self, snapshot: Snapshot) {
        self.active_ids = snapshot.active_ids;
        for entry in snapshot.entries {
            self.pending
                .entry(entry.producer_id)
                .or_default()
                .push(entry.payload);
        }
    }

    pub fn is_active(&self, producer_id: &ProducerId) -> bool {
        self.active_ids.contains(producer_id)
    }

    pub fn active_ids(&self) -> &BTreeSet<ProducerId> {
        &self.active_ids
    }

    /// Take and clear the queue for one producer; other producers are untouched
    pub fn take_pending(&mut self, producer_id: &ProducerId) -> Vec<String> {
        self.pending.remove(producer_id).unwrap_or_default()
    }

    pub fn pending_len(&self, producer_id: &ProducerId) -> usize {
        self.pending.get(producer_id).map_or(0, Vec::len)
    }
}
