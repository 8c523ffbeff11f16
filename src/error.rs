//! Error types for the pulse-link client library.
//!
//! All fallible operations in this crate return [`Result`].  Variants carry
//! `String` payloads and the enum is `Clone` so a single failure (for
//! example a shared connection that could not be opened) can be delivered
//! to every caller waiting on the same cached resource.

use std::fmt;

/// Result type for pulse-link operations.
pub type Result<T> = std::result::Result<T, PulseLinkError>;

/// Errors that can occur in the pulse-link client.
#[derive(Debug, Clone)]
pub enum PulseLinkError {
    /// The underlying connection could not be opened.
    ConnectionFailed(String),

    /// The connection closed.  `clean` distinguishes a graceful closure
    /// (client shutdown or a normal server close frame) from an unclean
    /// one (socket error, abnormal close code, stream ended mid-flight).
    ConnectionClosed {
        clean: bool,
        reason: String,
    },

    /// A send was queued behind the flow-control gate and the channel died
    /// before the message reached the transport.  Distinct from
    /// [`ConnectionClosed`](Self::ConnectionClosed), which is returned for
    /// a send attempted against a channel that was already closed.
    ClosedBeforeBuffered(String),

    /// The upstream subscription failed or ended in an unexpected state.
    SubscriptionError(String),

    /// Encoding a request or decoding a notification failed.
    SerializationError(String),

    /// Invalid configuration (bad URL, missing builder input, ...).
    ConfigurationError(String),

    /// An operation did not complete within its configured timeout.
    TimeoutError(String),

    /// The operation was interrupted by its own cancellation token.
    ///
    /// Caller-initiated aborts are not surfaced through notification
    /// iteration (iteration simply ends); this variant only appears when
    /// an in-flight operation such as a connection attempt is cut short.
    Cancelled,
}

impl PulseLinkError {
    /// Whether this error means the channel is gone (closed or died while
    /// a send was in flight).  The keepalive pinger uses this to decide
    /// between stopping silently and ignoring a transient failure.
    pub fn is_closed_class(&self) -> bool {
        matches!(
            self,
            PulseLinkError::ConnectionClosed { .. } | PulseLinkError::ClosedBeforeBuffered(_)
        )
    }

    /// Shorthand for a [`ConnectionClosed`](Self::ConnectionClosed) error.
    pub(crate) fn closed(reason: impl Into<String>, clean: bool) -> Self {
        PulseLinkError::ConnectionClosed {
            clean,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PulseLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PulseLinkError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            PulseLinkError::ConnectionClosed { clean, reason } => {
                if *clean {
                    write!(f, "Connection closed: {}", reason)
                } else {
                    write!(f, "Connection closed unexpectedly: {}", reason)
                }
            },
            PulseLinkError::ClosedBeforeBuffered(msg) => {
                write!(f, "Channel closed before message was buffered: {}", msg)
            },
            PulseLinkError::SubscriptionError(msg) => write!(f, "Subscription error: {}", msg),
            PulseLinkError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            PulseLinkError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            PulseLinkError::TimeoutError(msg) => write!(f, "Timeout: {}", msg),
            PulseLinkError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for PulseLinkError {}
