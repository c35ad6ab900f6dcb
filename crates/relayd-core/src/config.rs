//! Relay configuration
//!
//! Loaded from `$RELAYD_HOME/config.yaml` (default `~/.relayd/config.yaml`):
//! ```yaml
//! inbound:
//!   port: 7000
//!   producer_channel: /green
//!   peer_channel: /red
//! outbound:
//!   port: 6000
//!   consumer_channel: /red
//!   peer_host: 127.0.0.1
//!   peer_port: 7000
//!   poll_interval_ms: 500
//! ```
//! Missing keys fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inbound::InboundServerOptions;
use crate::outbound::{OutboundServerOptions, RelayBridgeOptions};
use crate::transport::channel_url;

pub fn default_relay_home() -> PathBuf {
    if let Ok(home) = std::env::var("RELAYD_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".relayd"))
        .unwrap_or_else(|| PathBuf::from(".relayd"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
}

impl RelayConfig {
    pub fn default_path() -> PathBuf {
        default_relay_home().join("config.yaml")
    }

    /// Load from a YAML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Producer-facing process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    pub host: String,
    pub port: u16,
    pub producer_channel: String,
    pub peer_channel: String,
    pub reset_buffer_on_peer_connect: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7000,
            producer_channel: "/green".to_string(),
            peer_channel: "/red".to_string(),
            reset_buffer_on_peer_connect: true,
        }
    }
}

impl InboundConfig {
    pub fn server_options(&self) -> InboundServerOptions {
        InboundServerOptions {
            host: self.host.clone(),
            port: self.port,
            producer_channel: self.producer_channel.clone(),
            peer_channel: self.peer_channel.clone(),
            reset_buffer_on_peer_connect: self.reset_buffer_on_peer_connect,
        }
    }
}

/// Consumer-facing process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub host: String,
    pub port: u16,
    pub consumer_channel: String,
    pub peer_host: String,
    pub peer_port: u16,
    pub peer_channel: String,
    pub poll_interval_ms: u64,
    pub peer_timeout_ms: u64,
    pub max_backoff_ms: u64,
    pub max_missed_polls: u32,
    pub fanout_interval_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6000,
            consumer_channel: "/red".to_string(),
            peer_host: "127.0.0.1".to_string(),
            peer_port: 7000,
            peer_channel: "/red".to_string(),
            poll_interval_ms: 500,
            peer_timeout_ms: 2000,
            max_backoff_ms: 8000,
            max_missed_polls: 10,
            fanout_interval_ms: 200,
        }
    }
}

impl OutboundConfig {
    pub fn peer_url(&self) -> String {
        channel_url(&self.peer_host, self.peer_port, &self.peer_channel)
    }

    pub fn bridge_options(&self) -> RelayBridgeOptions {
        RelayBridgeOptions {
            peer_url: self.peer_url(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_missed_polls: self.max_missed_polls,
        }
    }

    pub fn server_options(&self) -> OutboundServerOptions {
        OutboundServerOptions {
            host: self.host.clone(),
            port: self.port,
            consumer_channel: self.consumer_channel.clone(),
            fanout_interval: Duration::from_millis(self.fanout_interval_ms),
        }
    }
}
