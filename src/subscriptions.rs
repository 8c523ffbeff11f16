//! The subscriptions client boundary.
//!
//! [`SubscriptionsClient`] is the interface the coalescer wraps: a
//! subscribe call yields a [`NotificationStream`] of decoded
//! notifications.  [`RpcSubscriptions`] is the real implementation,
//! encoding requests with the configured codec and connecting through
//! the transport stack.

use crate::{
    codec::SharedCodec,
    error::Result,
    models::{Notification, SubscribeRequest},
    transport::{Connection, Transport},
};
use crate::channel::ChannelSubscription;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A client whose subscribe operation opens a live notification stream.
#[async_trait]
pub trait SubscriptionsClient: Send + Sync + 'static {
    /// Open the upstream subscription described by `request`.
    ///
    /// The stream stops producing (without an error) once `abort` fires.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        abort: CancellationToken,
    ) -> Result<NotificationStream>;
}

enum StreamSource {
    /// Decoded live connection traffic.
    Connection {
        messages: ChannelSubscription,
        codec: SharedCodec,
    },
    /// Pre-decoded notifications (used by in-process fan-out).
    Receiver(mpsc::Receiver<Result<Notification>>),
}

/// A live stream of decoded notifications for one upstream subscription.
pub struct NotificationStream {
    source: StreamSource,
    abort: CancellationToken,
    done: bool,
}

impl NotificationStream {
    pub(crate) fn from_connection(
        connection: &Connection,
        codec: SharedCodec,
        abort: CancellationToken,
    ) -> Self {
        Self {
            source: StreamSource::Connection {
                messages: connection.messages(),
                codec,
            },
            abort,
            done: false,
        }
    }

    pub(crate) fn from_receiver(
        receiver: mpsc::Receiver<Result<Notification>>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            source: StreamSource::Receiver(receiver),
            abort,
            done: false,
        }
    }

    /// Receive the next notification.
    ///
    /// Payloads that do not decode are skipped with a warning.  Returns
    /// `None` once the subscription ends — because its token fired or the
    /// underlying connection closed cleanly; a terminal connection error
    /// is yielded once before the end of the stream.
    pub async fn next(&mut self) -> Option<Result<Notification>> {
        if self.done {
            return None;
        }
        let Self { source, abort, done } = self;
        loop {
            match source {
                StreamSource::Connection { messages, codec } => {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => {
                            *done = true;
                            return None;
                        },
                        item = messages.next() => match item {
                            Some(Ok(payload)) => match codec.decode_notification(&payload) {
                                Ok(notification) => return Some(Ok(notification)),
                                Err(error) => {
                                    log::warn!(
                                        "[pulse-link] Skipping undecodable message: {}",
                                        error
                                    );
                                },
                            },
                            Some(Err(error)) => {
                                *done = true;
                                return Some(Err(error));
                            },
                            None => {
                                *done = true;
                                return None;
                            },
                        },
                    }
                },
                StreamSource::Receiver(receiver) => {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => {
                            *done = true;
                            return None;
                        },
                        item = receiver.recv() => match item {
                            Some(Ok(notification)) => return Some(Ok(notification)),
                            Some(Err(error)) => {
                                *done = true;
                                return Some(Err(error));
                            },
                            None => {
                                *done = true;
                                return None;
                            },
                        },
                    }
                },
            }
        }
    }
}

/// The real subscriptions client: encode, connect, decode.
pub struct RpcSubscriptions<T: Transport> {
    transport: Arc<T>,
    codec: SharedCodec,
}

impl<T: Transport> RpcSubscriptions<T> {
    pub fn new(transport: Arc<T>, codec: SharedCodec) -> Self {
        Self { transport, codec }
    }
}

#[async_trait]
impl<T: Transport> SubscriptionsClient for RpcSubscriptions<T> {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        abort: CancellationToken,
    ) -> Result<NotificationStream> {
        let payload = self.codec.encode_request(&request)?;
        log::debug!("[pulse-link] Subscribing to {}", request.method);
        let connection = self.transport.connect(payload, abort.clone()).await?;
        Ok(NotificationStream::from_connection(
            &connection,
            self.codec.clone(),
            abort,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WsChannel;
    use crate::codec::JsonCodec;
    use crate::error::PulseLinkError;
    use crate::models::{ChannelOptions, Payload};
    use crate::transport::Connection;
    use serde_json::json;

    fn codec() -> SharedCodec {
        Arc::new(JsonCodec)
    }

    #[tokio::test]
    async fn test_stream_decodes_inbound_payloads() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let connection = Connection::new(channel);
        let mut stream =
            NotificationStream::from_connection(&connection, codec(), CancellationToken::new());

        stub.events
            .send(Ok(Payload::Text(r#"{"seq":1}"#.into())))
            .unwrap();
        let notification = stream.next().await.unwrap().unwrap();
        assert_eq!(notification, json!({"seq": 1}));
    }

    #[tokio::test]
    async fn test_stream_skips_undecodable_payloads() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let connection = Connection::new(channel);
        let mut stream =
            NotificationStream::from_connection(&connection, codec(), CancellationToken::new());

        stub.events.send(Ok(Payload::Text("not json".into()))).unwrap();
        stub.events
            .send(Ok(Payload::Text(r#"{"seq":2}"#.into())))
            .unwrap();
        let notification = stream.next().await.unwrap().unwrap();
        assert_eq!(notification, json!({"seq": 2}));
    }

    #[tokio::test]
    async fn test_stream_ends_cleanly_on_abort() {
        let (channel, _stub) = WsChannel::stub(&ChannelOptions::default());
        let connection = Connection::new(channel);
        let abort = CancellationToken::new();
        let mut stream = NotificationStream::from_connection(&connection, codec(), abort.clone());

        abort.cancel();
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none(), "stream stays ended");
    }

    #[tokio::test]
    async fn test_stream_surfaces_terminal_connection_error_once() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let connection = Connection::new(channel);
        let mut stream =
            NotificationStream::from_connection(&connection, codec(), CancellationToken::new());

        stub.events
            .send(Err(PulseLinkError::closed("socket reset", false)))
            .unwrap();
        let err = stream.next().await.unwrap().expect_err("terminal error expected");
        assert!(matches!(err, PulseLinkError::ConnectionClosed { clean: false, .. }));
        assert!(stream.next().await.is_none());
    }
}
