//! Client-side transport layer for streaming pub/sub notifications over
//! shared WebSocket connections.
//!
//! Many independent logical subscriptions share a small, bounded set of
//! physical connections:
//!
//! - [`WsChannel`]: one duplex WebSocket connection with
//!   backpressure-aware sends and fan-out delivery of inbound messages
//! - Connection pool (internal): bin-packs subscribers onto channels,
//!   bounded by `max_subscriptions_per_channel` and `min_channels`
//! - Sharding router (internal): routes payloads to independent
//!   connections by an application-supplied shard key
//! - Keepalive pinger (internal): keeps idle connections alive, pausing
//!   while the network is reported offline
//! - [`CoalescingSubscriptions`]: deduplicates identical concurrent
//!   subscription requests into one upstream subscription with
//!   per-caller cancellable iteration
//!
//! Cancellation is cooperative throughout, via
//! [`tokio_util::sync::CancellationToken`]: aborting a caller releases
//! its references and ends its iteration cleanly; shared connections are
//! torn down only when their last subscriber is gone, with a one-turn
//! grace period so rapid unsubscribe/resubscribe does not thrash
//! connections.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulse_link::PulseLinkClient;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PulseLinkClient::builder()
//!     .url("wss://api.example.com/subscriptions")
//!     .build()?;
//!
//! let mut subscription = client
//!     .subscribe("accountNotifications", json!({"account": "9Wz..."}))
//!     .await?;
//!
//! while let Some(event) = subscription.next().await {
//!     match event {
//!         Ok(notification) => println!("{}", notification),
//!         Err(e) => eprintln!("Subscription error: {}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod channel;
mod client;
mod coalesce;
mod codec;
mod error;
mod event_handlers;
mod models;
mod pinger;
mod pool;
mod shard;
mod subscriptions;
mod timeouts;
mod transport;

pub use channel::{ChannelState, ChannelSubscription, WsChannel};
pub use client::{PulseLinkClient, PulseLinkClientBuilder, SubscriptionHandle};
pub use coalesce::{CoalescingSubscriptions, DedupKeyFn, NotificationReader};
pub use codec::{JsonCodec, MessageCodec, SharedCodec};
pub use error::{PulseLinkError, Result};
pub use event_handlers::{
    ConnectionError, DisconnectReason, EventHandlers, OnConnectCallback, OnDisconnectCallback,
    OnErrorCallback, OnReceiveCallback, OnSendCallback,
};
pub use models::{ChannelOptions, Notification, Payload, PoolOptions, SubscribeRequest};
pub use shard::ShardKeyFn;
pub use subscriptions::{NotificationStream, RpcSubscriptions, SubscriptionsClient};
pub use timeouts::{PulseLinkTimeouts, PulseLinkTimeoutsBuilder};
pub use transport::{Connection, Transport};
