//! Signaling transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Bounded outbound queue per client (messages)
    pub outbound_queue_capacity: usize,
    /// Capacity of each hub request channel
    pub hub_queue_capacity: usize,
    /// Largest accepted inbound frame (bytes)
    pub max_message_size: usize,
    /// Read deadline, refreshed by every inbound frame
    pub pong_wait_secs: u64,
    /// Ping interval; defaults to 9/10 of the pong wait
    pub ping_period_secs: Option<u64>,
    /// Deadline for a single outbound write
    pub write_wait_secs: u64,
}

impl SignalingConfig {
    #[must_use]
    pub const fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    #[must_use]
    pub fn ping_period(&self) -> Duration {
        match self.ping_period_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.pong_wait() * 9 / 10,
        }
    }

    #[must_use]
    pub const fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            hub_queue_capacity: 256,
            max_message_size: 512 * 1024,
            pong_wait_secs: 60,
            ping_period_secs: None,
            write_wait_secs: 10,
        }
    }
}
