//! Connection sharding router.
//!
//! Routes each outbound payload to one of several connections chosen by
//! an externally supplied shard key, reusing one connection per shard.
//! With no shard function configured, every payload shares a single
//! connection.  Built directly on the reference-counted resource cache:
//! a cache miss opens a connection through the inner transport with the
//! payload as its opening message, while a cache hit delivers the
//! payload over the already-open connection.

use crate::{
    cache::{CacheOutcome, ResourceCache},
    error::Result,
    models::Payload,
    transport::{Connection, Transport},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Maps an outbound payload to its shard key.
pub type ShardKeyFn = Arc<dyn Fn(&Payload) -> String + Send + Sync>;

/// Cache key used when no shard function is configured: one shared
/// connection for everything.
const SINGLE_SHARD_KEY: &str = "__shared__";

/// Transport decorator that shares one connection per shard key.
pub(crate) struct ShardedTransport<T> {
    inner: Arc<T>,
    cache: ResourceCache<String, Connection>,
    shard_by: Option<ShardKeyFn>,
}

impl<T: Transport> ShardedTransport<T> {
    pub(crate) fn new(inner: Arc<T>, shard_by: Option<ShardKeyFn>) -> Self {
        Self {
            inner,
            cache: ResourceCache::new(),
            shard_by,
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl<T: Transport> Transport for ShardedTransport<T> {
    async fn connect(&self, payload: Payload, abort: CancellationToken) -> Result<Connection> {
        let key = match &self.shard_by {
            Some(shard) => shard(&payload),
            None => SINGLE_SHARD_KEY.to_owned(),
        };
        let inner = self.inner.clone();
        let opening = payload.clone();
        let (connection, outcome) = self
            .cache
            .get_or_create(key, &abort, move |token| async move {
                inner.connect(opening, token).await
            })
            .await?;
        if outcome == CacheOutcome::Hit {
            // The shard's connection is already open; deliver this payload
            // on it instead of opening another one.
            connection.stage_subscription();
            connection.send(payload).await?;
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStub, WsChannel};
    use crate::models::ChannelOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        connects: AtomicUsize,
        stubs: Mutex<Vec<ChannelStub>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, payload: Payload, _abort: CancellationToken) -> Result<Connection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
            channel.send(payload).await?;
            self.stubs.lock().unwrap().push(stub);
            Ok(Connection::new(channel))
        }
    }

    fn by_prefix() -> ShardKeyFn {
        Arc::new(|payload: &Payload| {
            payload
                .as_text()
                .and_then(|text| text.split(':').next())
                .unwrap_or_default()
                .to_owned()
        })
    }

    #[tokio::test]
    async fn test_same_shard_key_reuses_one_connection() {
        let inner = Arc::new(MockTransport::default());
        let sharded = ShardedTransport::new(inner.clone(), Some(by_prefix()));
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();

        sharded
            .connect(Payload::from("alpha:open"), token_a)
            .await
            .unwrap();
        sharded
            .connect(Payload::from("alpha:second"), token_b)
            .await
            .unwrap();

        assert_eq!(inner.connects.load(Ordering::SeqCst), 1, "one open call per shard");
        let mut stubs = inner.stubs.lock().unwrap();
        assert_eq!(
            stubs[0].wire_rx.try_recv().unwrap(),
            Payload::from("alpha:open"),
            "opening payload goes through the inner transport"
        );
        assert_eq!(
            stubs[0].wire_rx.try_recv().unwrap(),
            Payload::from("alpha:second"),
            "later payloads are sent on the shared connection"
        );
    }

    #[tokio::test]
    async fn test_different_shard_keys_open_separate_connections() {
        let inner = Arc::new(MockTransport::default());
        let sharded = ShardedTransport::new(inner.clone(), Some(by_prefix()));
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();

        sharded
            .connect(Payload::from("alpha:open"), token_a)
            .await
            .unwrap();
        sharded
            .connect(Payload::from("beta:open"), token_b)
            .await
            .unwrap();

        assert_eq!(inner.connects.load(Ordering::SeqCst), 2);
        assert_eq!(sharded.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_without_shard_function_everything_shares_one_connection() {
        let inner = Arc::new(MockTransport::default());
        let sharded = ShardedTransport::new(inner.clone(), None);
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();

        sharded
            .connect(Payload::from("one"), token_a)
            .await
            .unwrap();
        sharded
            .connect(Payload::from("two"), token_b)
            .await
            .unwrap();

        assert_eq!(inner.connects.load(Ordering::SeqCst), 1);
        assert_eq!(sharded.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_aborting_all_referents_releases_the_shard_connection() {
        let inner = Arc::new(MockTransport::default());
        let sharded = ShardedTransport::new(inner.clone(), None);
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();

        sharded
            .connect(Payload::from("one"), token_a.clone())
            .await
            .unwrap();
        sharded
            .connect(Payload::from("two"), token_b.clone())
            .await
            .unwrap();

        token_a.cancel();
        token_b.cancel();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sharded.connection_count(), 0);
    }
}
