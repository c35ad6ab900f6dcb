//! Inbound (producer-facing) relay
//!
//! Producers register an id and push data; the outbound relay polls the buffered data
//! together with the set of live ids.
//!
//! ```text
//! producer ──join/incoming_data──► InboundServer ──► InboundHub (registry + buffer)
//!                                         ▲
//!        outbound relay ──listen──────────┘ ◄── snapshot
//! ```

mod buffer;
mod hub;
mod registry;
mod server;

pub use buffer::OutgoingBuffer;
pub use hub::InboundHub;
pub use registry::ProducerRegistry;
pub use server::{InboundServer, InboundServerOptions};
