//! Subscription request shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request for a named notification stream with parameters.
///
/// The method name and parameters together identify a logical
/// subscription; identical concurrent requests are coalesced into one
/// upstream subscription by
/// [`CoalescingSubscriptions`](crate::coalesce::CoalescingSubscriptions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Subscription method name (e.g. `"accountNotifications"`).
    pub method: String,
    /// Method parameters as a JSON value.
    pub params: Value,
}

impl SubscribeRequest {
    /// Create a new subscription request.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Default deduplication key: method name plus serialized parameters.
    ///
    /// `serde_json` keeps object keys in sorted order, so two requests
    /// with the same logical parameters produce the same key regardless
    /// of how their maps were built.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.method, self.params)
    }
}
