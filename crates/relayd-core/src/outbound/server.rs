//! Outbound relay server
//!
//! Consumer channel (`/red` by default):
//! - `{ event: "join", id }` → `joined` or `abort_connection`
//! - `{ event: "leave" }`
//! - server pushes `{ event: "broadcast_message", data: [...] }` per fan-out batch

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::mirror::SharedMirror;
use super::router::ConsumerGroupRouter;
use crate::error::{RelayError, Result};
use crate::protocol::{ConsumerMessage, ConsumerReply};
use crate::transport::{accept_channel, close_frame, normalize_channel, send_json, ServerStream};
use crate::types::{new_connection_id, ConnectionId};

type WsSink = SplitSink<ServerStream, Message>;

/// Outbound server options
#[derive(Debug, Clone)]
pub struct OutboundServerOptions {
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    pub consumer_channel: String,
    /// Sleep between fan-out passes of each group
    pub fanout_interval: Duration,
}

impl Default for OutboundServerOptions {
    fn default() -> Self {
        crate::config::OutboundConfig::default().server_options()
    }
}

/// Outbound (consumer-facing) relay server
pub struct OutboundServer {
    options: OutboundServerOptions,
    router: ConsumerGroupRouter,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl OutboundServer {
    /// Create a server routing consumers against `mirror` (fed by a `RelayBridge`)
    pub fn new(options: OutboundServerOptions, mirror: SharedMirror) -> Self {
        let router = ConsumerGroupRouter::new(mirror, options.fanout_interval);
        Self {
            options,
            router,
            shutdown_tx: None,
        }
    }

    pub fn router(&self) -> ConsumerGroupRouter {
        self.router.clone()
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.options.host, self.options.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let channel = normalize_channel(&self.options.consumer_channel);
        info!(%local_addr, consumer_channel = %channel, "Outbound relay server started");

        let router = self.router.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let router = router.clone();
                                let channel = channel.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, channel, router, shutdown_rx).await {
                                        error!(error = %e, ?addr, "Outbound connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(?e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Outbound relay server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every consumer connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("Outbound relay server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        channel: String,
        router: ConsumerGroupRouter,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (ws_stream, _) = match accept_channel(stream, &[channel]).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(?addr, error = %e, "Handshake rejected");
                return Ok(());
            }
        };

        let connection_id = new_connection_id();
        debug!(?addr, %connection_id, "Consumer connected");

        let result =
            Self::consumer_session(addr, &connection_id, ws_stream, &router, shutdown_rx).await;

        // Cleanup on disconnect
        router.leave(&connection_id).await;
        debug!(?addr, %connection_id, "Consumer disconnected");
        result
    }

    async fn consumer_session(
        addr: SocketAddr,
        connection_id: &ConnectionId,
        ws_stream: ServerStream,
        router: &ConsumerGroupRouter,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ConsumerReply>();

        loop {
            tokio::select! {
                // Router -> consumer
                reply = reply_rx.recv() => {
                    // reply_tx is held here, so the channel never closes first
                    let Some(reply) = reply else { break };
                    if send_json(&mut ws_tx, &reply).await.is_err() {
                        break;
                    }
                }

                // Consumer -> router
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ConsumerMessage>(&text) {
                                Ok(message) => {
                                    Self::on_consumer_message(addr, connection_id, message, &reply_tx, &mut ws_tx, router).await?;
                                }
                                Err(e) => warn!(?addr, error = %e, "Malformed consumer message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(?addr, error = %e, "Consumer WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }

                _ = shutdown_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(Some(close_frame(1001, "Relay shutting down")))).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn on_consumer_message(
        addr: SocketAddr,
        connection_id: &ConnectionId,
        message: ConsumerMessage,
        reply_tx: &mpsc::UnboundedSender<ConsumerReply>,
        ws_tx: &mut WsSink,
        router: &ConsumerGroupRouter,
    ) -> Result<()> {
        match message {
            ConsumerMessage::Join { id } => {
                match router.join(connection_id, id.clone(), reply_tx.clone()).await {
                    Ok(()) => send_json(ws_tx, &ConsumerReply::Joined { id }).await?,
                    Err(RelayError::ProducerUnavailable(id)) => {
                        warn!(?addr, producer_id = %id, "Consumer asked for unavailable producer");
                        send_json(ws_tx, &ConsumerReply::abort_for(&id)).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            ConsumerMessage::Leave => {
                router.leave(connection_id).await;
            }
        }
        Ok(())
    }
}
