//! Server configuration

use convoy_shared::DEFAULT_TICK_RATE;
use std::time::Duration;

/// Tunables for the presence server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Presence broadcast rate in Hz
    pub tick_rate: u32,
    /// Frames buffered per connection before deltas start dropping
    pub outbound_capacity: usize,
    /// Members silent for longer than this are removed
    pub heartbeat_timeout: Duration,
    /// Frames a lagging relay subscriber may fall behind
    pub relay_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_rate: DEFAULT_TICK_RATE,
            outbound_capacity: 64,
            heartbeat_timeout: Duration::from_secs(15),
            relay_capacity: 32,
        }
    }
}

impl ServerConfig {
    /// Duration of one broadcast tick. A zero rate is treated as 1 Hz.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert!(config.outbound_capacity > 0);
    }

    #[test]
    fn test_tick_interval() {
        let config = ServerConfig {
            tick_rate: 20,
            ..ServerConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(50));

        let zero = ServerConfig {
            tick_rate: 0,
            ..ServerConfig::default()
        };
        assert_eq!(zero.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_tick_is_thirty_hertz() {
        let seconds = ServerConfig::default().tick_interval().as_secs_f64();
        assert_approx_eq!(seconds, 1.0 / 30.0, 1e-6);
    }
}
