//! WebSocket plumbing shared by servers, the bridge and the clients
//!
//! A channel is a URL path. Servers refuse handshakes on paths they do not serve with
//! HTTP 404, which connectors surface as [`RelayError::ChannelMismatch`].

use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{RelayError, Result};

/// Close code sent to a second peer while one is already attached
pub const CLOSE_PEER_BUSY: u16 = 4009;

pub type ServerStream = WebSocketStream<TcpStream>;
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Normalize a channel name to a URL path (`red` -> `/red`)
pub fn normalize_channel(channel: &str) -> String {
    if channel.starts_with('/') {
        channel.to_string()
    } else {
        format!("/{}", channel)
    }
}

pub fn channel_url(host: &str, port: u16, channel: &str) -> String {
    format!("ws://{}:{}{}", host, port, normalize_channel(channel))
}

fn unknown_channel(path: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(format!("Unknown channel: {}", path)));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Accept a WebSocket handshake on one of `channels`, returning the matched channel
pub async fn accept_channel(
    stream: TcpStream,
    channels: &[String],
) -> std::result::Result<(ServerStream, String), WsError> {
    let channels = channels.to_vec();
    let path_cell = Arc::new(StdMutex::new(String::new()));
    let path_cell2 = Arc::clone(&path_cell);

    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let path = req.uri().path().to_string();
        if !channels.contains(&path) {
            return Err(unknown_channel(&path));
        }
        if let Ok(mut cell) = path_cell2.lock() {
            *cell = path;
        }
        Ok(resp)
    })
    .await?;

    let path = path_cell
        .lock()
        .map(|p| p.clone())
        .unwrap_or_else(|_| "/".to_string());

    Ok((ws_stream, path))
}

/// Open a client connection to `url`, classifying handshake failures
pub async fn connect_channel(url: &str) -> Result<ClientStream> {
    match connect_async(url).await {
        Ok((ws_stream, _)) => Ok(ws_stream),
        Err(WsError::Http(resp)) if resp.status() == StatusCode::NOT_FOUND => {
            Err(RelayError::ChannelMismatch {
                url: url.to_string(),
            })
        }
        Err(e) => Err(RelayError::PeerUnreachable {
            url: url.to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }
}

pub async fn send_json<S, T>(ws_tx: &mut S, msg: &T) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

/// Read frames until the next text frame and decode it.
///
/// Returns `Ok(None)` once the peer closes the connection.
pub async fn recv_json<S, T>(ws_rx: &mut S) -> Result<Option<T>>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    T: DeserializeOwned,
{
    while let Some(msg) = ws_rx.next().await {
        match msg? {
            Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}
