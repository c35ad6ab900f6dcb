//! Outgoing buffer of producer messages awaiting the next poll

use crate::types::{BufferEntry, ProducerId};

#[derive(Debug, Default)]
pub struct OutgoingBuffer {
    entries: Vec<BufferEntry>,
}

impl OutgoingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, producer_id: ProducerId, payload: impl Into<String>) {
        self.entries.push(BufferEntry::new(producer_id, payload));
    }

    /// Take everything appended since the previous drain
    pub fn drain(&mut self) -> Vec<BufferEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
