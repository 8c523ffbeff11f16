//! Connection lifecycle event handlers for the pulse-link client.
//!
//! Provides callback-based hooks for monitoring channel events:
//!
//! - [`on_connect`](EventHandlers::on_connect): Fired when a channel opens
//! - [`on_disconnect`](EventHandlers::on_disconnect): Fired when a channel closes
//! - [`on_error`](EventHandlers::on_error): Fired on connection or protocol errors
//! - [`on_receive`](EventHandlers::on_receive): Optional debug hook for inbound payloads
//! - [`on_send`](EventHandlers::on_send): Optional debug hook for outbound payloads
//!
//! # Example
//!
//! ```rust
//! use pulse_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("Channel open"))
//!     .on_disconnect(|reason| println!("Channel closed: {}", reason))
//!     .on_error(|error| eprintln!("Channel error: {}", error));
//! ```

use crate::models::Payload;
use std::fmt;
use std::sync::Arc;

/// Reason for a disconnect event.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description of why the channel closed.
    pub message: String,
    /// WebSocket close code, if available (e.g. 1000 = normal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// Create a new disconnect reason with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new disconnect reason with a message and close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether a fresh connection attempt may succeed.
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_disconnect callback.
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Type alias for the on_receive callback (debug hook for inbound payloads).
pub type OnReceiveCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Type alias for the on_send callback (debug hook for outbound payloads).
pub type OnSendCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Channel lifecycle event handlers.
///
/// All handlers are optional.  The builder pattern makes it easy to
/// register only the handlers you need.  Handlers are `Send + Sync` so
/// they can be invoked from background tasks.
#[derive(Clone, Default)]
pub struct EventHandlers {
    /// Called when a channel is successfully established.
    pub(crate) on_connect: Option<OnConnectCallback>,

    /// Called when a channel is closed (intentionally or not).
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,

    /// Called when a connection or protocol error occurs.
    pub(crate) on_error: Option<OnErrorCallback>,

    /// Called for every payload received from the server (debug/tracing).
    pub(crate) on_receive: Option<OnReceiveCallback>,

    /// Called for every payload sent to the server (debug/tracing).
    pub(crate) on_send: Option<OnSendCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when a channel is established.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a channel is closed.
    ///
    /// The callback receives a [`DisconnectReason`] with details about why
    /// the channel was closed.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a connection error occurs.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a debug/tracing callback invoked for every inbound payload
    /// before it is decoded.  Not needed for normal operation.
    pub fn on_receive(mut self, f: impl Fn(&Payload) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a debug/tracing callback invoked for every outbound
    /// payload handed to the transport.
    pub fn on_send(mut self, f: impl Fn(&Payload) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_error.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    /// Dispatch the on_connect event.
    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    /// Dispatch the on_disconnect event.
    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    /// Dispatch the on_error event.
    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    /// Dispatch the on_receive event.
    pub(crate) fn emit_receive(&self, payload: &Payload) {
        if let Some(cb) = &self.on_receive {
            cb(payload);
        }
    }

    /// Dispatch the on_send event.
    pub(crate) fn emit_send(&self, payload: &Payload) {
        if let Some(cb) = &self.on_send {
            cb(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_handlers_is_a_noop() {
        let handlers = EventHandlers::new();
        assert!(!handlers.has_any());
        handlers.emit_connect();
        handlers.emit_disconnect(DisconnectReason::new("bye"));
        handlers.emit_error(ConnectionError::new("oops", true));
    }

    #[test]
    fn test_registered_handlers_fire() {
        let connects = Arc::new(AtomicUsize::new(0));
        let connects_clone = connects.clone();
        let handlers = EventHandlers::new().on_connect(move || {
            connects_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handlers.has_any());
        handlers.emit_connect();
        handlers.emit_connect();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::new("bye").to_string(), "bye");
        assert_eq!(
            DisconnectReason::with_code("bye", 1000).to_string(),
            "bye (code: 1000)"
        );
    }
}
