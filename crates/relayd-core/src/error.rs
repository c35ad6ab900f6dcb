//! Relay error taxonomy

use crate::types::ProducerId;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Another live connection already holds this producer id
    #[error("Producer '{0}' is already connected")]
    DuplicateId(ProducerId),

    /// Consumer asked for a producer id that is not active
    #[error("Producer '{0}' is unavailable")]
    ProducerUnavailable(ProducerId),

    /// Data arrived from a connection that does not hold the id it claims
    #[error("Connection is not registered as producer '{0}'")]
    UnknownProducer(ProducerId),

    #[error("Peer unreachable at {url}: {reason}")]
    PeerUnreachable { url: String, reason: String },

    #[error("No channel served at {url} (possibly wrong channel, check again)")]
    ChannelMismatch { url: String },

    #[error("Peer stopped answering after {missed} missed polls")]
    PeerUnresponsive { missed: u32 },

    #[error("Relay bridge was already started; create a new bridge to reconnect")]
    BridgeAlreadyStarted,

    #[error("Not joined to any producer")]
    NotJoined,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl RelayError {
    /// Errors that must terminate the process rather than a single connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::PeerUnreachable { .. }
                | RelayError::ChannelMismatch { .. }
                | RelayError::PeerUnresponsive { .. }
        )
    }
}
