//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// STUN/TURN URLs handed to every media session
    pub ice_servers: Vec<String>,
    /// Capacity of each session's engine event queue
    pub event_queue_capacity: usize,
    /// Read buffer for inbound RTP packets (bytes)
    pub relay_buffer_size: usize,
    /// Upper bound on waiting for local candidate gathering (ms)
    pub gather_timeout_ms: u64,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum subscribers per room (0 = unlimited)
    pub max_subscribers_per_room: usize,
}

impl SfuConfig {
    #[must_use]
    pub const fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            event_queue_capacity: 32,
            relay_buffer_size: 1500,
            gather_timeout_ms: 2000,
            max_rooms: 0,
            max_subscribers_per_room: 0,
        }
    }
}
