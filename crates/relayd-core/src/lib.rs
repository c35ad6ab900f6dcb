//! relayd core
//!
//! Relays text messages from producers, each registered under a unique id, to every
//! consumer subscribed to that id. Two processes sit in between:
//!
//! - the inbound relay ([`inbound`]) registers producers and buffers their messages;
//! - the outbound relay ([`outbound`]) polls the inbound relay through a
//!   [`outbound::RelayBridge`] and fans batches out to consumer groups.
//!
//! ```text
//! producer ─► InboundServer ◄─poll─ RelayBridge ─► MirroredState ─► ConsumerGroupRouter ─► consumers
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{ConsumerClient, ProducerClient};
pub use config::{default_relay_home, InboundConfig, OutboundConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use inbound::{InboundHub, InboundServer, InboundServerOptions, OutgoingBuffer, ProducerRegistry};
pub use outbound::{
    BridgeState, ConsumerGroupRouter, MirroredState, OutboundServer, OutboundServerOptions,
    RelayBridge, RelayBridgeOptions, SharedMirror,
};
pub use types::{BufferEntry, ConnectionId, ProducerId, Snapshot};
