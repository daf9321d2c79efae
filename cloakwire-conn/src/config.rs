//! Connection configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable knobs of a connection.
///
/// The defaults are the values both endpoints were designed around; nothing
/// here is read from the environment or persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Capacity of the queue between upper-layer writers and the device
    pub queue_capacity: usize,
    /// How long the client waits for a SYN+ACK before giving up, in seconds
    pub syn_timeout_secs: u64,
    /// Heartbeat emission interval, in milliseconds
    pub keeper_interval_millis: u64,
    /// Peer silence tolerated before it is declared dead, in milliseconds
    pub dead_threshold_millis: u64,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            syn_timeout_secs: 6,
            keeper_interval_millis: 1_000,
            dead_threshold_millis: 15_000,
        }
    }
}

impl ConnConfig {
    /// SYN handshake timeout
    pub fn syn_timeout(&self) -> Duration {
        Duration::from_secs(self.syn_timeout_secs)
    }

    /// Heartbeat emission interval
    pub fn keeper_interval(&self) -> Duration {
        Duration::from_millis(self.keeper_interval_millis)
    }

    /// Dead-peer threshold
    pub fn dead_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_threshold_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnConfig::default();
        assert_eq!(config.queue_capacity, 500);
        assert_eq!(config.syn_timeout(), Duration::from_secs(6));
        assert_eq!(config.keeper_interval(), Duration::from_secs(1));
        assert_eq!(config.dead_threshold(), Duration::from_secs(15));
        // The keeper must get several chances before a peer is declared dead.
        assert!(config.dead_threshold() >= config.keeper_interval() * 10);
    }
}
