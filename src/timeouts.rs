//! Timeout and interval configuration for pulse-link client operations.
//!
//! Centralizes the durations used when establishing connections, waiting
//! for subscriptions, and keeping idle connections alive.

use std::time::Duration;

/// Timeout configuration for pulse-link client operations.
///
/// # Examples
///
/// ```rust
/// use pulse_link::PulseLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = PulseLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = PulseLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .ping_interval(Duration::from_secs(15))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct PulseLinkTimeouts {
    /// Timeout for establishing a WebSocket connection (TCP + TLS +
    /// handshake).  Default: 10 seconds.
    pub connection_timeout: Duration,

    /// Timeout for the whole subscribe operation (obtaining a connection
    /// and handing the subscribe message to the transport).  Set to 0 to
    /// wait indefinitely.  Default: 30 seconds.
    pub subscribe_timeout: Duration,

    /// Interval after which an idle connection receives a keepalive
    /// message.  Any send or receive on the connection resets the timer.
    /// Set to 0 to disable keepalives.  Default: 5 seconds.
    pub ping_interval: Duration,
}

impl Default for PulseLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
        }
    }
}

impl PulseLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> PulseLinkTimeoutsBuilder {
        PulseLinkTimeoutsBuilder::new()
    }

    /// Timeouts optimized for fast local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
        }
    }

    /// Timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(15),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for creating custom [`PulseLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct PulseLinkTimeoutsBuilder {
    timeouts: PulseLinkTimeouts,
}

impl PulseLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: PulseLinkTimeouts::default(),
        }
    }

    /// Set the connection timeout (TCP + TLS + WebSocket handshake).
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the subscribe timeout.  Set to 0 to wait indefinitely.
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    /// Set the keepalive interval.  Set to 0 to disable keepalives.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.timeouts.ping_interval = interval;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> PulseLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = PulseLinkTimeouts::default();
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.subscribe_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_builder() {
        let timeouts = PulseLinkTimeouts::builder()
            .connection_timeout(Duration::from_secs(60))
            .ping_interval(Duration::from_secs(1))
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.ping_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_is_no_timeout() {
        assert!(PulseLinkTimeouts::is_no_timeout(Duration::ZERO));
        assert!(!PulseLinkTimeouts::is_no_timeout(Duration::from_secs(1)));
    }
}
