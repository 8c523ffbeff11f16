//! Message (de)serialization boundary.
//!
//! The wire encoding of subscription requests and notification payloads is
//! supplied externally: the transport layer only moves opaque
//! [`Payload`]s.  [`MessageCodec`] is that seam, and [`JsonCodec`] is the
//! default implementation using method-framed JSON.

use crate::{
    error::{PulseLinkError, Result},
    models::{Notification, Payload, SubscribeRequest},
};
use serde_json::json;
use std::sync::Arc;

/// Encodes outbound requests and decodes inbound notifications.
pub trait MessageCodec: Send + Sync + 'static {
    /// Encode a subscription request into a wire payload.
    fn encode_request(&self, request: &SubscribeRequest) -> Result<Payload>;

    /// Decode an inbound payload into a notification.
    fn decode_notification(&self, payload: &Payload) -> Result<Notification>;

    /// The lightweight control message sent by the keepalive pinger when
    /// a connection has been idle.
    fn keepalive_payload(&self) -> Payload;
}

/// Type-erased shared codec handle.
pub type SharedCodec = Arc<dyn MessageCodec>;

/// Default codec: method-framed JSON text messages.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode_request(&self, request: &SubscribeRequest) -> Result<Payload> {
        let message = json!({
            "method": request.method,
            "params": request.params,
        });
        let text = serde_json::to_string(&message).map_err(|e| {
            PulseLinkError::SerializationError(format!("Failed to encode request: {}", e))
        })?;
        Ok(Payload::Text(text))
    }

    fn decode_notification(&self, payload: &Payload) -> Result<Notification> {
        match payload {
            Payload::Text(text) => serde_json::from_str(text).map_err(|e| {
                PulseLinkError::SerializationError(format!("Failed to decode notification: {}", e))
            }),
            Payload::Binary(data) => serde_json::from_slice(data).map_err(|e| {
                PulseLinkError::SerializationError(format!("Failed to decode notification: {}", e))
            }),
        }
    }

    fn keepalive_payload(&self) -> Payload {
        Payload::Text(r#"{"method":"ping"}"#.to_owned())
    }
}
