//! Per-channel configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options controlling the behavior of a single WebSocket channel.
///
/// # Example
///
/// ```rust
/// use pulse_link::ChannelOptions;
///
/// let options = ChannelOptions::default()
///     .with_send_high_watermark_bytes(64 * 1024)
///     .with_drain_poll_interval_ms(10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Outbound sends are deferred while the transport's outstanding
    /// buffered bytes exceed this threshold.
    /// Default: 131072 (128 KiB).
    #[serde(default = "default_send_high_watermark_bytes")]
    pub send_high_watermark_bytes: usize,

    /// How often a deferred send re-checks the buffered amount.
    /// Default: 20 ms.
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,

    /// Inbound messages larger than this are dropped with a warning.
    /// Default: 64 MiB.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Capacity of the per-channel inbound fan-out buffer.  Subscribers
    /// that fall further behind than this lose the oldest messages.
    /// Default: 1024.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_send_high_watermark_bytes() -> usize {
    131_072
}

fn default_drain_poll_interval_ms() -> u64 {
    20
}

fn default_max_message_bytes() -> usize {
    64 << 20
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            send_high_watermark_bytes: default_send_high_watermark_bytes(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            max_message_bytes: default_max_message_bytes(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ChannelOptions {
    /// Create new channel options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send buffer high watermark in bytes.
    pub fn with_send_high_watermark_bytes(mut self, bytes: usize) -> Self {
        self.send_high_watermark_bytes = bytes;
        self
    }

    /// Set the drain poll interval in milliseconds.
    pub fn with_drain_poll_interval_ms(mut self, ms: u64) -> Self {
        self.drain_poll_interval_ms = ms;
        self
    }

    /// Set the maximum inbound message size in bytes.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Set the inbound fan-out buffer capacity.
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// The drain poll interval as a [`Duration`].
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ChannelOptions::default();
        assert_eq!(options.send_high_watermark_bytes, 131_072);
        assert_eq!(options.drain_poll_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_with_methods() {
        let options = ChannelOptions::new()
            .with_send_high_watermark_bytes(1)
            .with_drain_poll_interval_ms(5);
        assert_eq!(options.send_high_watermark_bytes, 1);
        assert_eq!(options.drain_poll_interval_ms, 5);
    }
}
