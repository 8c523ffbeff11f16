//! Connection pool configuration.

use serde::{Deserialize, Serialize};

/// Options controlling how logical subscribers are packed onto physical
/// channels.
///
/// # Example
///
/// ```rust
/// use pulse_link::PoolOptions;
///
/// let options = PoolOptions::default()
///     .with_min_channels(2)
///     .with_max_subscriptions_per_channel(50);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// The pool opens new channels until this many exist before it starts
    /// packing additional subscribers onto existing ones.
    /// Default: 1.
    #[serde(default = "default_min_channels")]
    pub min_channels: usize,

    /// Maximum number of subscribers sharing one channel.  Providers
    /// commonly cap concurrent subscriptions per connection; the default
    /// is chosen conservatively.
    /// Default: 100.
    #[serde(default = "default_max_subscriptions_per_channel")]
    pub max_subscriptions_per_channel: usize,
}

fn default_min_channels() -> usize {
    1
}

fn default_max_subscriptions_per_channel() -> usize {
    100
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_channels: default_min_channels(),
            max_subscriptions_per_channel: default_max_subscriptions_per_channel(),
        }
    }
}

impl PoolOptions {
    /// Create new pool options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of channels opened before packing begins.
    pub fn with_min_channels(mut self, count: usize) -> Self {
        self.min_channels = count;
        self
    }

    /// Set the maximum number of subscribers per channel.
    pub fn with_max_subscriptions_per_channel(mut self, count: usize) -> Self {
        self.max_subscriptions_per_channel = count;
        self
    }
}
