//! Configuration knobs for link behavior.

use std::time::Duration;

/// Configuration for heartbeats, timeouts and reconnection pacing.
///
/// The defaults match the protocol's nominal timings; [`LinkConfig::fast_local`]
/// shrinks everything for loopback tests.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Interval between outgoing heartbeat packets.
    pub heartbeat_period: Duration,

    /// Interval at which the watchdog inspects the last-heartbeat timestamp.
    pub heartbeat_check_period: Duration,

    /// Number of consecutive missed heartbeats before the watchdog closes
    /// the connection.
    pub missed_heartbeat_limit: u32,

    /// Timeout for a single stream connect attempt; also paces retries.
    pub connect_attempt_timeout: Duration,

    /// Timeout for a synchronous (acknowledged) stream send.
    pub send_timeout: Duration,

    /// How long a freshly-connected stream may take to produce the peer's
    /// initialization packet before the socket is abandoned.
    pub handshake_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(1),
            heartbeat_check_period: Duration::from_millis(100),
            missed_heartbeat_limit: 8,
            connect_attempt_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

impl LinkConfig {
    /// The silence gap after which the watchdog declares the peer dead.
    pub fn disconnect_threshold(&self) -> Duration {
        self.heartbeat_period * self.missed_heartbeat_limit
    }

    /// Override the connect-attempt timeout (and reconnect pacing).
    pub fn with_connect_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.connect_attempt_timeout = timeout;
        self
    }

    /// Override the heartbeat period and missed-heartbeat limit together.
    pub fn with_heartbeat(mut self, period: Duration, missed_limit: u32) -> Self {
        self.heartbeat_period = period;
        self.missed_heartbeat_limit = missed_limit;
        self
    }

    /// Aggressive timings for loopback testing.
    pub fn fast_local() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(50),
            heartbeat_check_period: Duration::from_millis(10),
            missed_heartbeat_limit: 8,
            connect_attempt_timeout: Duration::from_millis(250),
            send_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_disconnect_threshold() {
        let config = LinkConfig::default();
        assert_eq!(config.disconnect_threshold(), Duration::from_secs(8));
    }

    #[test]
    fn test_builder_overrides() {
        let config = LinkConfig::default()
            .with_connect_attempt_timeout(Duration::from_secs(5))
            .with_heartbeat(Duration::from_millis(200), 4);
        assert_eq!(config.connect_attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.disconnect_threshold(), Duration::from_millis(800));
    }
}
