//! Outbound (consumer-facing) relay
//!
//! # Architecture
//!
//! ```text
//! inbound relay ◄──listen── RelayBridge ──merge──► MirroredState
//!                                                       │ take_pending(pid)
//! consumer ──join──► OutboundServer ──► ConsumerGroupRouter ── fan-out loop per group
//!     ▲                                                 │
//!     └───────────────── broadcast_message ─────────────┘
//! ```

mod bridge;
mod mirror;
mod router;
mod server;

pub use bridge::{wait_disconnected, BridgeState, RelayBridge, RelayBridgeOptions};
pub use mirror::{MirroredState, SharedMirror};
pub use router::{ConsumerGroupRouter, ConsumerSender};
pub use server::{OutboundServer, OutboundServerOptions};
