//! Notification payloads delivered to subscribers.

/// A single decoded notification.
///
/// The shape of notification payloads belongs to the wire protocol and is
/// decoded by the configured [`MessageCodec`](crate::codec::MessageCodec);
/// this crate treats them as opaque JSON values.
pub type Notification = serde_json::Value;
