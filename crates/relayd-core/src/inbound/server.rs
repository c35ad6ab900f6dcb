//! Inbound relay server
//!
//! Serves two channels:
//! - producer channel (`/green` by default): `join`, `incoming_data`, `leave`
//! - peer channel (`/red` by default): `listen` polls from the outbound relay

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::hub::InboundHub;
use crate::error::{RelayError, Result};
use crate::protocol::{PeerReply, PeerRequest, ProducerMessage, ProducerReply};
use crate::transport::{
    accept_channel, close_frame, normalize_channel, send_json, ServerStream, CLOSE_PEER_BUSY,
};
use crate::types::{new_connection_id, ConnectionId};

type WsSink = SplitSink<ServerStream, Message>;

/// Inbound server options
#[derive(Debug, Clone)]
pub struct InboundServerOptions {
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    pub producer_channel: String,
    pub peer_channel: String,
    /// Drop entries buffered while no outbound relay was attached
    pub reset_buffer_on_peer_connect: bool,
}

impl Default for InboundServerOptions {
    fn default() -> Self {
        crate::config::InboundConfig::default().server_options()
    }
}

struct ConnectionContext {
    hub: Arc<InboundHub>,
    producer_channel: String,
    peer_channel: String,
    reset_buffer_on_peer_connect: bool,
    peer_attached: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// Inbound (producer-facing) relay server
pub struct InboundServer {
    options: InboundServerOptions,
    hub: Arc<InboundHub>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl InboundServer {
    pub fn new(options: InboundServerOptions) -> Self {
        Self {
            options,
            hub: Arc::new(InboundHub::new()),
            shutdown_tx: None,
        }
    }

    pub fn hub(&self) -> Arc<InboundHub> {
        self.hub.clone()
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.options.host, self.options.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let ctx = Arc::new(ConnectionContext {
            hub: self.hub.clone(),
            producer_channel: normalize_channel(&self.options.producer_channel),
            peer_channel: normalize_channel(&self.options.peer_channel),
            reset_buffer_on_peer_connect: self.options.reset_buffer_on_peer_connect,
            peer_attached: AtomicBool::new(false),
            shutdown_tx: shutdown_tx.clone(),
        });

        info!(
            %local_addr,
            producer_channel = %ctx.producer_channel,
            peer_channel = %ctx.peer_channel,
            "Inbound relay server started"
        );

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let ctx = ctx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                                        error!(error = %e, ?addr, "Inbound connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(?e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Inbound relay server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("Inbound relay server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<ConnectionContext>,
    ) -> Result<()> {
        let channels = [ctx.producer_channel.clone(), ctx.peer_channel.clone()];
        let (ws_stream, path) = match accept_channel(stream, &channels).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(?addr, error = %e, "Handshake rejected");
                return Ok(());
            }
        };

        if path == ctx.producer_channel {
            Self::handle_producer(addr, ws_stream, ctx).await
        } else {
            Self::handle_peer(addr, ws_stream, ctx).await
        }
    }

    async fn handle_producer(
        addr: SocketAddr,
        ws_stream: ServerStream,
        ctx: Arc<ConnectionContext>,
    ) -> Result<()> {
        let connection_id = new_connection_id();
        debug!(?addr, %connection_id, "Producer connected");

        let result = Self::producer_session(addr, &connection_id, ws_stream, &ctx).await;

        // Cleanup on disconnect
        if let Some(id) = ctx.hub.leave(&connection_id).await {
            info!(?addr, producer_id = %id, "Producer disconnected");
        }
        result
    }

    async fn producer_session(
        addr: SocketAddr,
        connection_id: &ConnectionId,
        ws_stream: ServerStream,
        ctx: &ConnectionContext,
    ) -> Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut shutdown_rx = ctx.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ProducerMessage>(&text) {
                                Ok(message) => {
                                    Self::on_producer_message(addr, connection_id, message, &mut ws_tx, ctx).await?;
                                }
                                Err(e) => warn!(?addr, error = %e, "Malformed producer message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(?addr, error = %e, "Producer WebSocket error");
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

    async fn on_producer_message(
        addr: SocketAddr,
        connection_id: &ConnectionId,
        message: ProducerMessage,
        ws_tx: &mut WsSink,
        ctx: &ConnectionContext,
    ) -> Result<()> {
        match message {
            ProducerMessage::Join { id } => match ctx.hub.join(connection_id, id.clone()).await {
                Ok(()) => {
                    info!(?addr, producer_id = %id, "Producer joined");
                    send_json(ws_tx, &ProducerReply::Joined { id }).await?;
                }
                Err(RelayError::DuplicateId(id)) => {
                    warn!(?addr, producer_id = %id, "Duplicate producer id rejected");
                    send_json(ws_tx, &ProducerReply::DuplicateConnection).await?;
                }
                Err(e) => return Err(e),
            },
            ProducerMessage::IncomingData { id, data } => {
                if let Err(e) = ctx.hub.append(connection_id, id, data).await {
                    warn!(?addr, error = %e, "Dropping data from unregistered connection");
                }
            }
            ProducerMessage::Leave => {
                if let Some(id) = ctx.hub.leave(connection_id).await {
                    info!(?addr, producer_id = %id, "Producer left");
                }
            }
        }
        Ok(())
    }

    async fn handle_peer(
        addr: SocketAddr,
        ws_stream: ServerStream,
        ctx: Arc<ConnectionContext>,
    ) -> Result<()> {
        if ctx.peer_attached.swap(true, Ordering::SeqCst) {
            let (mut ws_tx, _ws_rx) = ws_stream.split();
            let _ = ws_tx
                .send(Message::Close(Some(close_frame(
                    CLOSE_PEER_BUSY,
                    "Another outbound relay is already attached",
                ))))
                .await;
            warn!(?addr, "Rejected second outbound relay");
            return Ok(());
        }

        info!(?addr, "Outbound relay attached");
        if ctx.reset_buffer_on_peer_connect {
            ctx.hub.discard_backlog().await;
        }

        let result = Self::peer_session(addr, ws_stream, &ctx).await;

        ctx.peer_attached.store(false, Ordering::SeqCst);
        info!(?addr, "Outbound relay detached");
        result
    }

    async fn peer_session(
        addr: SocketAddr,
        ws_stream: ServerStream,
        ctx: &ConnectionContext,
    ) -> Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut shutdown_rx = ctx.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<PeerRequest>(&text) {
                                Ok(PeerRequest::Listen { seq }) => {
                                    let snapshot = ctx.hub.snapshot().await;
                                    debug!(
                                        seq,
                                        entries = snapshot.entries.len(),
                                        active = snapshot.active_ids.len(),
                                        "Serving snapshot"
                                    );
                                    send_json(&mut ws_tx, &PeerReply::from_snapshot(seq, snapshot)).await?;
                                }
                                Err(e) => warn!(?addr, error = %e, "Malformed peer request"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(?addr, error = %e, "Peer WebSocket error");
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
}
