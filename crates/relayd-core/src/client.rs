//! Relay clients
//!
//! Thin producer and consumer endpoints speaking the wire protocol. They carry no
//! console handling; callers decide what to do with input and received batches.

use std::collections::VecDeque;

use crate::error::{RelayError, Result};
use crate::protocol::{ConsumerMessage, ConsumerReply, ProducerMessage, ProducerReply};
use crate::transport::{connect_channel, recv_json, send_json, ClientStream};
use crate::types::ProducerId;

/// Producer endpoint connected to the inbound relay's producer channel
pub struct ProducerClient {
    ws: ClientStream,
    id: Option<ProducerId>,
}

impl ProducerClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let ws = connect_channel(url).await?;
        Ok(Self { ws, id: None })
    }

    /// Register under `id`; fails with [`RelayError::DuplicateId`] if it is taken
    pub async fn join(&mut self, id: impl Into<ProducerId>) -> Result<()> {
        let id = id.into();
        send_json(&mut self.ws, &ProducerMessage::Join { id: id.clone() }).await?;
        match recv_json::<_, ProducerReply>(&mut self.ws).await? {
            Some(ProducerReply::Joined { .. }) => {
                self.id = Some(id);
                Ok(())
            }
            Some(ProducerReply::DuplicateConnection) => Err(RelayError::DuplicateId(id)),
            None => Err(RelayError::Protocol(
                "connection closed while joining".to_string(),
            )),
        }
    }

    pub async fn send(&mut self, data: impl Into<String>) -> Result<()> {
        let id = self.id.clone().ok_or(RelayError::NotJoined)?;
        let message = ProducerMessage::IncomingData {
            id,
            data: data.into(),
        };
        send_json(&mut self.ws, &message).await
    }

    pub async fn leave(&mut self) -> Result<()> {
        self.id = None;
        send_json(&mut self.ws, &ProducerMessage::Leave).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    pub fn id(&self) -> Option<&ProducerId> {
        self.id.as_ref()
    }
}

/// Consumer endpoint connected to the outbound relay's consumer channel
pub struct ConsumerClient {
    ws: ClientStream,
    id: Option<ProducerId>,
    /// Batches that arrived while waiting for a join reply
    backlog: VecDeque<Vec<String>>,
    last_abort: Option<String>,
}

impl ConsumerClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let ws = connect_channel(url).await?;
        Ok(Self {
            ws,
            id: None,
            backlog: VecDeque::new(),
            last_abort: None,
        })
    }

    /// Subscribe to `id`; fails with [`RelayError::ProducerUnavailable`] when the
    /// relay aborts the join, leaving the consumer unsubscribed. The abort message is
    /// kept in [`Self::last_abort`].
    pub async fn join(&mut self, id: impl Into<ProducerId>) -> Result<()> {
        let id = id.into();
        send_json(&mut self.ws, &ConsumerMessage::Join { id: id.clone() }).await?;
        loop {
            match recv_json::<_, ConsumerReply>(&mut self.ws).await? {
                Some(ConsumerReply::Joined { .. }) => {
                    self.id = Some(id);
                    return Ok(());
                }
                Some(ConsumerReply::AbortConnection { message }) => {
                    // The relay drops any previous subscription on abort
                    self.id = None;
                    self.last_abort = Some(message);
                    return Err(RelayError::ProducerUnavailable(id));
                }
                Some(ConsumerReply::BroadcastMessage { data }) => self.backlog.push_back(data),
                None => {
                    return Err(RelayError::Protocol(
                        "connection closed while joining".to_string(),
                    ))
                }
            }
        }
    }

    /// Next delivered batch, or `None` once the relay closes the connection
    pub async fn next_batch(&mut self) -> Result<Option<Vec<String>>> {
        if let Some(batch) = self.backlog.pop_front() {
            return Ok(Some(batch));
        }
        loop {
            match recv_json::<_, ConsumerReply>(&mut self.ws).await? {
                Some(ConsumerReply::BroadcastMessage { data }) => return Ok(Some(data)),
                Some(ConsumerReply::AbortConnection { message }) => self.last_abort = Some(message),
                Some(ConsumerReply::Joined { .. }) => {}
                None => return Ok(None),
            }
        }
    }

    pub async fn leave(&mut self) -> Result<()> {
        self.id = None;
        send_json(&mut self.ws, &ConsumerMessage::Leave).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    pub fn id(&self) -> Option<&ProducerId> {
        self.id.as_ref()
    }

    pub fn last_abort(&self) -> Option<&str> {
        self.last_abort.as_deref()
    }
}
