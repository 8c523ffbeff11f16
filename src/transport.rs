//! The transport seam: opening a connection for an initial payload.
//!
//! A [`Transport`] turns an opening payload plus a cancellation token
//! into a live [`Connection`].  The base implementation vends pooled
//! channels; decorators such as the sharding router wrap it with the
//! same signature.

use crate::{
    cache::CachedResource,
    channel::{ChannelSubscription, WsChannel},
    error::Result,
    models::Payload,
    pool::ChannelPool,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Opens a connection, delivering `payload` as its opening message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, payload: Payload, abort: CancellationToken) -> Result<Connection>;
}

/// A live connection handle: a send primitive plus a per-consumer view
/// of inbound messages.
///
/// Cloning is cheap; all clones share the same underlying channel.
#[derive(Clone)]
pub struct Connection {
    channel: Arc<WsChannel>,
    staged: Arc<Mutex<VecDeque<ChannelSubscription>>>,
}

impl Connection {
    pub(crate) fn new(channel: Arc<WsChannel>) -> Self {
        Self {
            channel,
            staged: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Send a payload over the connection.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.channel.send(payload).await
    }

    /// Register interest in inbound messages ahead of an outbound send.
    ///
    /// The reply to a send can arrive before the consumer gets around to
    /// calling [`messages`](Self::messages); a subscription staged before
    /// the send is queued cannot miss it.
    pub(crate) fn stage_subscription(&self) {
        self.staged
            .lock()
            .expect("connection staged-subscription mutex poisoned")
            .push_back(self.channel.subscribe());
    }

    /// Subscribe to this connection's inbound messages.
    ///
    /// Consumes a staged subscription when one exists, so no frame
    /// received since the matching send is lost.
    pub fn messages(&self) -> ChannelSubscription {
        self.staged
            .lock()
            .expect("connection staged-subscription mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| self.channel.subscribe())
    }

    /// Token that fires once the underlying channel has been torn down.
    pub fn terminated(&self) -> CancellationToken {
        self.channel.terminated()
    }
}

impl CachedResource for Connection {
    fn terminated(&self) -> CancellationToken {
        Connection::terminated(self)
    }
}

/// Base transport: vends a channel from the pool and sends the opening
/// payload on it.
pub(crate) struct PooledTransport {
    pool: ChannelPool,
}

impl PooledTransport {
    pub(crate) fn new(pool: ChannelPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn connect(&self, payload: Payload, abort: CancellationToken) -> Result<Connection> {
        let channel = self.pool.vend(&abort).await?;
        let connection = Connection::new(channel);
        connection.stage_subscription();
        connection.send(payload).await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelOptions, PoolOptions};
    use crate::pool::ChannelOpener;
    use futures_util::FutureExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_pooled_transport_sends_the_opening_payload() {
        let stubs = Arc::new(Mutex::new(Vec::new()));
        let stubs_clone = stubs.clone();
        let opener: ChannelOpener = Arc::new(move |_token| {
            let stubs = stubs_clone.clone();
            async move {
                let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
                stubs.lock().unwrap().push(stub);
                Ok(channel)
            }
            .boxed()
        });
        let transport = PooledTransport::new(ChannelPool::new(opener, PoolOptions::default()));

        let token = CancellationToken::new();
        let connection = transport
            .connect(Payload::from("open-me"), token.clone())
            .await
            .unwrap();

        let opening = stubs.lock().unwrap()[0].wire_rx.try_recv().unwrap();
        assert_eq!(opening, Payload::from("open-me"));

        connection.send("follow-up").await.unwrap();
        let next = stubs.lock().unwrap()[0].wire_rx.try_recv().unwrap();
        assert_eq!(next, Payload::from("follow-up"));
    }

    #[tokio::test]
    async fn test_reply_arriving_before_messages_is_not_lost() {
        let stubs = Arc::new(Mutex::new(Vec::new()));
        let stubs_clone = stubs.clone();
        let opener: ChannelOpener = Arc::new(move |_token| {
            let stubs = stubs_clone.clone();
            async move {
                let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
                stubs.lock().unwrap().push(stub);
                Ok(channel)
            }
            .boxed()
        });
        let transport = PooledTransport::new(ChannelPool::new(opener, PoolOptions::default()));

        let token = CancellationToken::new();
        let connection = transport
            .connect(Payload::from("open-me"), token.clone())
            .await
            .unwrap();

        // The server answers before the consumer subscribes.
        stubs.lock().unwrap()[0]
            .events
            .send(Ok(Payload::from("early-reply")))
            .unwrap();

        let mut messages = connection.messages();
        assert_eq!(
            messages.next().await.unwrap().unwrap(),
            Payload::from("early-reply")
        );
    }
}
