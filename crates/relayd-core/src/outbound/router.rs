//! Consumer group router
//!
//! Consumers join a group keyed by producer id. The first member of a group starts its
//! fan-out loop; the loop periodically takes the mirrored payloads for that producer and
//! publishes them, as one ordered batch, to every member. The loop ends on its own once
//! the group is empty. Payloads mirrored after its last pass are not flushed.
//!
//! Every join replaces the connection's previous subscription, aborted joins included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::mirror::SharedMirror;
use crate::error::{RelayError, Result};
use crate::protocol::ConsumerReply;
use crate::types::{ConnectionId, ProducerId};

/// Message sender for a consumer connection
pub type ConsumerSender = mpsc::UnboundedSender<ConsumerReply>;

struct Group {
    /// Distinguishes a re-created group from the one an older loop was serving
    epoch: u64,
    members: HashMap<ConnectionId, ConsumerSender>,
}

#[derive(Default)]
struct GroupTable {
    groups: HashMap<ProducerId, Group>,
    /// connection_id -> producer id, for cleanup
    memberships: HashMap<ConnectionId, ProducerId>,
}

impl GroupTable {
    /// Remove a connection; returns its producer id and whether the group emptied
    fn remove(&mut self, connection_id: &str) -> Option<(ProducerId, bool)> {
        let producer_id = self.memberships.remove(connection_id)?;
        let mut emptied = false;
        if let Some(group) = self.groups.get_mut(&producer_id) {
            group.members.remove(connection_id);
            if group.members.is_empty() {
                self.groups.remove(&producer_id);
                emptied = true;
            }
        }
        Some((producer_id, emptied))
    }
}

struct RouterInner {
    mirror: SharedMirror,
    table: Mutex<GroupTable>,
    fanout_interval: Duration,
    next_epoch: AtomicU64,
    running_loops: AtomicUsize,
}

#[derive(Clone)]
pub struct ConsumerGroupRouter {
    inner: Arc<RouterInner>,
}

impl ConsumerGroupRouter {
    pub fn new(mirror: SharedMirror, fanout_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                mirror,
                table: Mutex::new(GroupTable::default()),
                fanout_interval,
                next_epoch: AtomicU64::new(1),
                running_loops: AtomicUsize::new(0),
            }),
        }
    }

    /// Admit `connection_id` into the group for `producer_id`.
    ///
    /// Fails with [`RelayError::ProducerUnavailable`] when the producer is not in the
    /// mirrored active set; the connection then ends up in no group, even if it was a
    /// member of one before. Otherwise a connection already in another group is moved.
    pub async fn join(
        &self,
        connection_id: &str,
        producer_id: ProducerId,
        sender: ConsumerSender,
    ) -> Result<()> {
        // Admission check and registration happen under the mirror lock so a merge
        // cannot slip in between.
        let mirror = self.inner.mirror.lock().await;
        let mut table = self.inner.table.lock().await;
        let previous = table.remove(connection_id);

        if !mirror.is_active(&producer_id) {
            if let Some((previous, _)) = previous {
                debug!(connection_id, producer_id = %previous, "Aborted consumer dropped from its group");
            }
            return Err(RelayError::ProducerUnavailable(producer_id));
        }
        if let Some((previous, _)) = previous {
            debug!(connection_id, producer_id = %previous, "Consumer switching groups");
        }

        let mut new_epoch = None;
        let group = table.groups.entry(producer_id.clone()).or_insert_with(|| {
            let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
            new_epoch = Some(epoch);
            Group {
                epoch,
                members: HashMap::new(),
            }
        });
        group.members.insert(connection_id.to_string(), sender);
        let members = group.members.len();
        table
            .memberships
            .insert(connection_id.to_string(), producer_id.clone());
        drop(table);
        drop(mirror);

        info!(connection_id, producer_id = %producer_id, members, "Consumer joined group");

        if let Some(epoch) = new_epoch {
            let inner = self.inner.clone();
            inner.running_loops.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                run_fanout(&inner, &producer_id, epoch).await;
                inner.running_loops.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    /// Remove `connection_id` from its group; no-op if it is not a member of any
    pub async fn leave(&self, connection_id: &str) -> Option<ProducerId> {
        let removed = self.inner.table.lock().await.remove(connection_id);
        let (producer_id, emptied) = removed?;
        info!(connection_id, producer_id = %producer_id, "Consumer left group");
        if emptied {
            debug!(producer_id = %producer_id, "Group is empty, fan-out loop will stop");
        }
        Some(producer_id)
    }

    pub async fn group_size(&self, producer_id: &ProducerId) -> usize {
        self.inner
            .table
            .lock()
            .await
            .groups
            .get(producer_id)
            .map_or(0, |g| g.members.len())
    }

    pub async fn group_of(&self, connection_id: &str) -> Option<ProducerId> {
        self.inner
            .table
            .lock()
            .await
            .memberships
            .get(connection_id)
            .cloned()
    }

    pub async fn group_count(&self) -> usize {
        self.inner.table.lock().await.groups.len()
    }

    /// Fan-out loops currently alive
    pub fn running_loops(&self) -> usize {
        self.inner.running_loops.load(Ordering::SeqCst)
    }
}

async fn run_fanout(inner: &RouterInner, producer_id: &ProducerId, epoch: u64) {
    debug!(producer_id = %producer_id, epoch, "Fan-out loop started");
    loop {
        tokio::time::sleep(inner.fanout_interval).await;

        let members: Vec<(ConnectionId, ConsumerSender)> = {
            let table = inner.table.lock().await;
            match table.groups.get(producer_id) {
                Some(group) if group.epoch == epoch => group
                    .members
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
                _ => break,
            }
        };

        let batch = inner.mirror.lock().await.take_pending(producer_id);
        if batch.is_empty() {
            continue;
        }

        let mut sent = 0;
        for (connection_id, tx) in &members {
            let reply = ConsumerReply::BroadcastMessage {
                data: batch.clone(),
            };
            if tx.send(reply).is_ok() {
                sent += 1;
            } else {
                warn!(producer_id = %producer_id, %connection_id, "Consumer gone, batch not delivered");
            }
        }
        debug!(producer_id = %producer_id, messages = batch.len(), sent, "Batch published");
    }
    debug!(producer_id = %producer_id, epoch, "Fan-out loop stopped");
}
