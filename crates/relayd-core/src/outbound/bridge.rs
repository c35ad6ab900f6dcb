//! Relay bridge
//!
//! Polls the inbound relay for snapshots and merges them into the local mirror.
//!
//! `Connecting → Connected → Disconnected`. Disconnected is terminal: there is no
//! reconnect, a new bridge has to be created (and the full join handshake repeated by
//! every producer and consumer).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::mirror::SharedMirror;
use crate::error::{RelayError, Result};
use crate::protocol::{PeerReply, PeerRequest};
use crate::transport::{close_frame, connect_channel, send_json, ClientStream};

/// Relay bridge options
#[derive(Debug, Clone)]
pub struct RelayBridgeOptions {
    /// Peer channel URL on the inbound relay (e.g. ws://127.0.0.1:7000/red)
    pub peer_url: String,
    /// Delay between polls while the peer answers in time
    pub poll_interval: Duration,
    /// How long a poll may stay unanswered before backing off
    pub peer_timeout: Duration,
    /// Upper bound for the backed-off poll delay
    pub max_backoff: Duration,
    /// Consecutive timed-out polls before the peer is given up on
    pub max_missed_polls: u32,
}

impl Default for RelayBridgeOptions {
    fn default() -> Self {
        crate::config::OutboundConfig::default().bridge_options()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Connected,
    Disconnected,
}

pub struct RelayBridge {
    options: RelayBridgeOptions,
    mirror: SharedMirror,
    state_tx: watch::Sender<BridgeState>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    started: bool,
}

impl RelayBridge {
    pub fn new(options: RelayBridgeOptions, mirror: SharedMirror) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Connecting);
        Self {
            options,
            mirror,
            state_tx,
            shutdown_tx: None,
            started: false,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Connect to the inbound relay and start polling.
    ///
    /// Connection failures (`PeerUnreachable`, `ChannelMismatch`) are returned to the
    /// caller and leave the bridge `Disconnected`.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(RelayError::BridgeAlreadyStarted);
        }
        self.started = true;

        let url = self.options.peer_url.clone();
        let ws_stream = match connect_channel(&url).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                self.state_tx.send_replace(BridgeState::Disconnected);
                return Err(e);
            }
        };

        info!(%url, "Connected to inbound relay");
        self.state_tx.send_replace(BridgeState::Connected);

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let options = self.options.clone();
        let mirror = self.mirror.clone();
        let state_tx = self.state_tx.clone();

        tokio::spawn(async move {
            match Self::poll_loop(ws_stream, &mirror, &options, shutdown_rx).await {
                Ok(()) => info!(url = %options.peer_url, "Disconnected from inbound relay"),
                Err(e) if e.is_fatal() => {
                    error!(url = %options.peer_url, error = %e, "Giving up on inbound relay")
                }
                Err(e) => warn!(url = %options.peer_url, error = %e, "Relay bridge stopped"),
            }
            state_tx.send_replace(BridgeState::Disconnected);
        });

        Ok(())
    }

    /// Stop polling and close the peer connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("Relay bridge stopped");
    }

    async fn poll_loop(
        ws_stream: ClientStream,
        mirror: &SharedMirror,
        options: &RelayBridgeOptions,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let mut seq: u64 = 0;
        // (seq, sent_at) of the poll awaiting its reply
        let mut in_flight: Option<(u64, Instant)> = None;
        let mut delay = options.poll_interval;
        let mut missed: u32 = 0;

        let next_poll = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(next_poll);

        loop {
            tokio::select! {
                _ = &mut next_poll => {
                    match in_flight {
                        Some((pending_seq, sent_at)) if sent_at.elapsed() >= options.peer_timeout => {
                            missed += 1;
                            if missed >= options.max_missed_polls {
                                let _ = ws_tx
                                    .send(Message::Close(Some(close_frame(1001, "Peer unresponsive"))))
                                    .await;
                                return Err(RelayError::PeerUnresponsive { missed });
                            }
                            delay = (delay * 2).min(options.max_backoff);
                            warn!(seq = pending_seq, missed, next_poll_in = ?delay, "Peer round trip timed out, backing off");
                        }
                        // Still within the timeout: don't stack requests
                        Some(_) => {}
                        None => {
                            seq += 1;
                            send_json(&mut ws_tx, &PeerRequest::Listen { seq }).await?;
                            in_flight = Some((seq, Instant::now()));
                        }
                    }
                    next_poll.as_mut().reset(Instant::now() + delay);
                }

                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<PeerReply>(&text) {
                                Ok(reply) => {
                                    let (reply_seq, snapshot) = reply.into_snapshot();
                                    let entries = snapshot.entries.len();
                                    // Late replies are merged too: the peer already drained them
                                    mirror.lock().await.merge(snapshot);
                                    if in_flight.is_some_and(|(s, _)| s == reply_seq) {
                                        in_flight = None;
                                    }
                                    if missed > 0 {
                                        info!(missed, "Inbound relay answering again");
                                        missed = 0;
                                        delay = options.poll_interval;
                                        next_poll.as_mut().reset(Instant::now() + delay);
                                    }
                                    debug!(seq = reply_seq, entries, "Merged snapshot");
                                }
                                Err(e) => warn!(error = %e, "Malformed snapshot reply"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => {
                            warn!(error = %e, "Relay bridge WebSocket error");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = shutdown_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Resolve once the bridge reaches `Disconnected`
pub async fn wait_disconnected(state_rx: &mut watch::Receiver<BridgeState>) {
    let _ = state_rx
        .wait_for(|state| *state == BridgeState::Disconnected)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::{InboundServer, InboundServerOptions};
    use crate::outbound::MirroredState;
    use crate::transport::{accept_channel, channel_url, recv_json};
    use crate::types::{BufferEntry, ProducerId, Snapshot};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn fast_options(peer_url: String) -> RelayBridgeOptions {
        RelayBridgeOptions {
            peer_url,
            poll_interval: Duration::from_millis(20),
            peer_timeout: Duration::from_millis(60),
            max_backoff: Duration::from_millis(120),
            max_missed_polls: 3,
        }
    }

    async fn start_inbound() -> (InboundServer, SocketAddr) {
        let mut server = InboundServer::new(InboundServerOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        });
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    /// A peer that accepts the handshake and then never answers
    async fn start_silent_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (ws_stream, _) = accept_channel(stream, &["/red".to_string()]).await.unwrap();
            let (_ws_tx, mut ws_rx) = ws_stream.split();
            while let Ok(Some(_)) = recv_json::<_, PeerRequest>(&mut ws_rx).await {}
        });
        addr
    }

    /// A peer that holds back its first reply by `delay`, then answers promptly.
    /// Reports how long after the late reply the next poll arrived.
    async fn start_slow_first_peer(delay: Duration) -> (SocketAddr, oneshot::Receiver<Duration>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (gap_tx, gap_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (ws_stream, _) = accept_channel(stream, &["/red".to_string()]).await.unwrap();
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            let Some(PeerRequest::Listen { seq }) =
                recv_json::<_, PeerRequest>(&mut ws_rx).await.unwrap()
            else {
                return;
            };
            tokio::time::sleep(delay).await;
            let snapshot = Snapshot {
                entries: vec![BufferEntry::new(ProducerId::from("A"), "late")],
                active_ids: [ProducerId::from("A")].into_iter().collect(),
            };
            send_json(&mut ws_tx, &PeerReply::from_snapshot(seq, snapshot))
                .await
                .unwrap();
            let answered_at = Instant::now();

            if let Ok(Some(PeerRequest::Listen { seq })) =
                recv_json::<_, PeerRequest>(&mut ws_rx).await
            {
                let _ = gap_tx.send(answered_at.elapsed());
                let _ = send_json(&mut ws_tx, &PeerReply::from_snapshot(seq, Snapshot::default())).await;
            }
            while let Ok(Some(PeerRequest::Listen { seq })) =
                recv_json::<_, PeerRequest>(&mut ws_rx).await
            {
                let _ = send_json(&mut ws_tx, &PeerReply::from_snapshot(seq, Snapshot::default())).await;
            }
        });
        (addr, gap_rx)
    }

    #[tokio::test]
    async fn test_bridge_mirrors_inbound_state() {
        let (mut server, addr) = start_inbound().await;
        let hub = server.hub();
        let mirror = MirroredState::shared();

        let mut bridge = RelayBridge::new(
            fast_options(channel_url("127.0.0.1", addr.port(), "/red")),
            mirror.clone(),
        );
        bridge.start().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Connected);

        // Joined after the peer attached, so the backlog reset does not drop it
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.join("conn-a", ProducerId::from("A")).await.unwrap();
        hub.append("conn-a", ProducerId::from("A"), "hello".into()).await.unwrap();

        let pid = ProducerId::from("A");
        let mirrored = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let state = mirror.lock().await;
                    if state.is_active(&pid) && state.pending_len(&pid) == 1 {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(mirrored.is_ok());
        assert_eq!(mirror.lock().await.take_pending(&pid), vec!["hello"]);

        bridge.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (mut server, addr) = start_inbound().await;
        let mut bridge = RelayBridge::new(
            fast_options(channel_url("127.0.0.1", addr.port(), "/red")),
            MirroredState::shared(),
        );
        bridge.start().await.unwrap();
        assert!(matches!(bridge.start().await, Err(RelayError::BridgeAlreadyStarted)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_channel_is_channel_mismatch() {
        let (mut server, addr) = start_inbound().await;
        let mut bridge = RelayBridge::new(
            fast_options(channel_url("127.0.0.1", addr.port(), "/blue")),
            MirroredState::shared(),
        );
        let err = bridge.start().await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelMismatch { .. }));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_shutdown_disconnects_bridge() {
        let (mut server, addr) = start_inbound().await;
        let mut bridge = RelayBridge::new(
            fast_options(channel_url("127.0.0.1", addr.port(), "/red")),
            MirroredState::shared(),
        );
        bridge.start().await.unwrap();
        let mut state_rx = bridge.subscribe();

        server.stop().await;
        let done = tokio::time::timeout(Duration::from_secs(2), wait_disconnected(&mut state_rx)).await;
        assert!(done.is_ok());
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_given_up() {
        let addr = start_silent_peer().await;
        let mut bridge = RelayBridge::new(
            fast_options(channel_url("127.0.0.1", addr.port(), "/red")),
            MirroredState::shared(),
        );
        bridge.start().await.unwrap();
        let mut state_rx = bridge.subscribe();

        let done = tokio::time::timeout(Duration::from_secs(3), wait_disconnected(&mut state_rx)).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn test_late_reply_is_merged_and_polling_recovers() {
        let (addr, gap_rx) = start_slow_first_peer(Duration::from_millis(400)).await;
        let mirror = MirroredState::shared();
        let mut bridge = RelayBridge::new(
            RelayBridgeOptions {
                peer_url: channel_url("127.0.0.1", addr.port(), "/red"),
                poll_interval: Duration::from_millis(20),
                peer_timeout: Duration::from_millis(40),
                max_backoff: Duration::from_millis(640),
                max_missed_polls: 10,
            },
            mirror.clone(),
        );
        bridge.start().await.unwrap();

        let gap = tokio::time::timeout(Duration::from_secs(3), gap_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(gap < Duration::from_millis(100), "next poll came {:?} after the late reply", gap);
        assert_eq!(mirror.lock().await.take_pending(&ProducerId::from("A")), vec!["late"]);
        assert_eq!(bridge.state(), BridgeState::Connected);

        bridge.stop().await;
    }
}
