//! Data models for the pulse-link client library.
//!
//! Defines the wire payload type, subscription request shape, and the
//! configuration structures for channels and the connection pool.

pub mod channel_options;
pub mod notification;
pub mod payload;
pub mod pool_options;
pub mod subscribe_request;

pub use channel_options::ChannelOptions;
pub use notification::Notification;
pub use payload::Payload;
pub use pool_options::PoolOptions;
pub use subscribe_request::SubscribeRequest;
