//! Relay configuration (ambient stack)
//!
//! Configuration loading is not part of the broker's correctness properties,
//! but every embedding binary needs somewhere to put environment inputs.
//! Follows the same plain-struct-plus-`Default` convention the builder uses
//! for its own defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:5555".parse().unwrap()
}

fn default_beat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_ack_retry_attempts() -> u32 {
    3
}

fn default_ack_retry_base_delay() -> Duration {
    Duration::from_millis(100)
}

/// Runtime configuration for a [`crate::RelayServer`].
///
/// Can be constructed directly, via [`Default`] for local development, or
/// via [`RelayConfig::from_env`] for the bundled binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// Path to the shared store's on-disk directory. `None` opens a
    /// temporary store, suitable only for local development and tests.
    pub store_path: Option<String>,
    /// Interval between liveness beats.
    pub beat_interval: Duration,
    /// Frames larger than this are rejected and the socket closed with 1009.
    pub max_frame_bytes: usize,
    /// Capacity of each socket's bounded outbound queue before 1013 closes it.
    pub outbound_queue_capacity: usize,
    /// Maximum attempts before a transient store error is treated as
    /// fatal for a single operation (the broker itself still degrades
    /// gracefully rather than failing the publish).
    pub ack_retry_attempts: u32,
    /// Base delay for capped exponential backoff between store retries.
    pub ack_retry_base_delay: Duration,
    /// Origins allowed to open a WebSocket connection. Empty means no
    /// restriction, matching the teacher's permissive local-development
    /// default.
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store_path: None,
            beat_interval: default_beat_interval(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            ack_retry_attempts: default_ack_retry_attempts(),
            ack_retry_base_delay: default_ack_retry_base_delay(),
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Build configuration from environment variables, falling back to
    /// [`Default`] for anything unset or unparsable.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `RELAY_BIND_ADDR` | `host:port` to listen on |
    /// | `RELAY_STORE_PATH` | on-disk path for the shared store |
    /// | `RELAY_BEAT_INTERVAL_SECS` | liveness beat period |
    /// | `RELAY_MAX_FRAME_BYTES` | inbound frame size ceiling |
    /// | `RELAY_OUTBOUND_QUEUE_CAPACITY` | per-socket outbound queue depth |
    /// | `RELAY_ALLOWED_ORIGINS` | comma-separated origin allowlist |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "RELAY_BIND_ADDR unparsable, using default");
            }
        }
        if let Ok(path) = std::env::var("RELAY_STORE_PATH") {
            config.store_path = Some(path);
        }
        if let Ok(secs) = std::env::var("RELAY_BEAT_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.beat_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(bytes) = std::env::var("RELAY_MAX_FRAME_BYTES") {
            if let Ok(bytes) = bytes.parse() {
                config.max_frame_bytes = bytes;
            }
        }
        if let Ok(capacity) = std::env::var("RELAY_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(capacity) = capacity.parse() {
                config.outbound_queue_capacity = capacity;
            }
        }
        if let Ok(origins) = std::env::var("RELAY_ALLOWED_ORIGINS") {
            config.allowed_origins = origins.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        config
    }
}
