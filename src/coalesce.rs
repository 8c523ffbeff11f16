//! Subscription request coalescing.
//!
//! [`CoalescingSubscriptions`] wraps a [`SubscriptionsClient`] so that
//! identical concurrent subscription requests collapse into one upstream
//! subscription.  The single upstream stream is fanned out to each
//! caller's own independently cancellable [`NotificationReader`]:
//! aborting one caller ends only that caller's iteration, while aborting
//! the last caller tears the upstream subscription down (after the
//! resource cache's usual one-turn grace period).  An upstream error is
//! delivered once to every current caller and evicts the shared entry,
//! so the next identical request starts a fresh subscription.

use crate::{
    cache::{CacheOutcome, CachedResource, ResourceCache},
    error::{PulseLinkError, Result},
    models::{Notification, SubscribeRequest},
    subscriptions::{NotificationStream, SubscriptionsClient},
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Maps a request to its deduplication key, or `None` to bypass
/// coalescing for that request.
pub type DedupKeyFn = Arc<dyn Fn(&SubscribeRequest) -> Option<String> + Send + Sync>;

/// Capacity of each caller's notification buffer.  A caller that falls
/// this far behind loses further notifications until it drains; the
/// shared fan-out never waits for it.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

// ── Shared upstream hub ─────────────────────────────────────────────────────

/// Terminal state of a shared upstream: ended cleanly or failed.
type Terminal = Option<PulseLinkError>;

/// One attached caller's delivery slot.
struct CallerSlot {
    id: u64,
    sender: mpsc::Sender<Notification>,
}

struct SubscriberSet {
    slots: Vec<CallerSlot>,
    terminal: Option<Terminal>,
    /// Fired when the first caller attaches; the driver holds off
    /// consuming upstream values until then so the creating caller
    /// cannot miss early notifications.
    attached: Option<oneshot::Sender<()>>,
    next_caller_id: u64,
}

/// One upstream subscription fanned out to any number of callers.
#[derive(Clone)]
pub(crate) struct SharedUpstream {
    subscribers: Arc<Mutex<SubscriberSet>>,
    done: CancellationToken,
}

impl SharedUpstream {
    /// Start the driver task over `stream`.  `token` is the cache
    /// entry's own controller: when it fires (last caller released), the
    /// driver stops and the upstream subscription winds down with it.
    pub(crate) fn spawn(stream: NotificationStream, token: CancellationToken) -> Self {
        let (first_tx, first_rx) = oneshot::channel();
        let hub = SharedUpstream {
            subscribers: Arc::new(Mutex::new(SubscriberSet {
                slots: Vec::new(),
                terminal: None,
                attached: Some(first_tx),
                next_caller_id: 1,
            })),
            done: CancellationToken::new(),
        };
        let driver = hub.clone();
        tokio::spawn(async move {
            driver.drive(stream, token, first_rx).await;
        });
        hub
    }

    async fn drive(
        &self,
        mut stream: NotificationStream,
        token: CancellationToken,
        first_attach: oneshot::Receiver<()>,
    ) {
        // Hold off reading until the first caller is attached.
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.finish(None);
                return;
            },
            _ = first_attach => {},
        }
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(notification)) => self.fan_out(notification),
                Some(Err(error)) => {
                    self.finish(Some(error));
                    return;
                },
                None => {
                    self.finish(None);
                    return;
                },
            }
        }
    }

    /// Deliver one notification to every attached caller.
    ///
    /// Never waits: a caller whose buffer is full loses this notification
    /// (as a lagging channel subscriber would), so one slow caller cannot
    /// stall delivery to the others.
    fn fan_out(&self, notification: Notification) {
        let mut set = self
            .subscribers
            .lock()
            .expect("shared upstream mutex poisoned");
        set.slots.retain(|slot| {
            match slot.sender.try_send(notification.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "[pulse-link] Coalesced subscriber lagging, dropping notification"
                    );
                    true
                },
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn finish(&self, error: Terminal) {
        let mut set = self
            .subscribers
            .lock()
            .expect("shared upstream mutex poisoned");
        set.terminal = Some(error);
        // Dropping the senders ends every caller's stream; the terminal
        // error (if any) is picked up by each reader at end of stream.
        set.slots.clear();
        drop(set);
        self.done.cancel();
    }

    /// Attach one more caller to the shared stream.
    fn attach(&self) -> Result<(u64, mpsc::Receiver<Notification>)> {
        let mut set = self
            .subscribers
            .lock()
            .expect("shared upstream mutex poisoned");
        let id = set.next_caller_id;
        set.next_caller_id += 1;
        match &set.terminal {
            Some(Some(error)) => Err(error.clone()),
            Some(None) => {
                // Upstream already ended; the caller sees an empty stream.
                let (_tx, rx) = mpsc::channel(1);
                Ok((id, rx))
            },
            None => {
                let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
                set.slots.push(CallerSlot { id, sender: tx });
                if let Some(first) = set.attached.take() {
                    let _ = first.send(());
                }
                Ok((id, rx))
            },
        }
    }

    /// Remove one caller's delivery slot.  Driven by the caller's abort
    /// token, so an aborted caller releases its slot even while its
    /// reader is still held.
    fn detach(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("shared upstream mutex poisoned")
            .slots
            .retain(|slot| slot.id != id);
    }

    /// The error the upstream ended with, if any.
    fn terminal_error(&self) -> Option<PulseLinkError> {
        self.subscribers
            .lock()
            .expect("shared upstream mutex poisoned")
            .terminal
            .clone()
            .flatten()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("shared upstream mutex poisoned")
            .slots
            .len()
    }
}

impl CachedResource for SharedUpstream {
    fn terminated(&self) -> CancellationToken {
        self.done.clone()
    }
}

// ── Per-caller reader ───────────────────────────────────────────────────────

enum ReaderMode {
    /// Fanned out from a shared upstream.
    Shared {
        receiver: mpsc::Receiver<Notification>,
        hub: SharedUpstream,
        abort: CancellationToken,
    },
    /// Uncoalesced: the caller owns its upstream stream.
    Direct(NotificationStream),
}

/// One caller's independently cancellable view of a subscription.
pub struct NotificationReader {
    mode: ReaderMode,
    done: bool,
}

impl NotificationReader {
    fn shared(
        receiver: mpsc::Receiver<Notification>,
        hub: SharedUpstream,
        abort: CancellationToken,
    ) -> Self {
        Self {
            mode: ReaderMode::Shared {
                receiver,
                hub,
                abort,
            },
            done: false,
        }
    }

    fn direct(stream: NotificationStream) -> Self {
        Self {
            mode: ReaderMode::Direct(stream),
            done: false,
        }
    }

    /// Receive the next notification.
    ///
    /// Returns `None` once this caller's token has fired or the upstream
    /// ended; an upstream error is yielded once before the end of the
    /// stream.  Other callers of the same coalesced subscription are
    /// unaffected by this caller's abort.
    pub async fn next(&mut self) -> Option<Result<Notification>> {
        if self.done {
            return None;
        }
        match &mut self.mode {
            ReaderMode::Shared {
                receiver,
                hub,
                abort,
            } => {
                let item = tokio::select! {
                    biased;
                    _ = abort.cancelled() => None,
                    item = receiver.recv() => item,
                };
                match item {
                    Some(notification) => Some(Ok(notification)),
                    None => {
                        self.done = true;
                        if abort.is_cancelled() {
                            // This caller's own abort: clean end.
                            None
                        } else {
                            hub.terminal_error().map(Err)
                        }
                    },
                }
            },
            ReaderMode::Direct(stream) => match stream.next().await {
                Some(Ok(notification)) => Some(Ok(notification)),
                Some(Err(error)) => {
                    self.done = true;
                    Some(Err(error))
                },
                None => {
                    self.done = true;
                    None
                },
            },
        }
    }

    /// Whether the reader has ended.
    pub fn is_closed(&self) -> bool {
        self.done
    }
}

// ── The coalescing decorator ────────────────────────────────────────────────

/// Wraps a subscriptions client so identical concurrent requests share
/// one upstream subscription.
pub struct CoalescingSubscriptions<C: SubscriptionsClient> {
    inner: Arc<C>,
    cache: ResourceCache<String, SharedUpstream>,
    dedup_key: DedupKeyFn,
}

impl<C: SubscriptionsClient> CoalescingSubscriptions<C> {
    /// Wrap `inner`, deduplicating by
    /// [`SubscribeRequest::dedup_key`](crate::models::SubscribeRequest::dedup_key).
    pub fn new(inner: Arc<C>) -> Self {
        Self {
            inner,
            cache: ResourceCache::new(),
            dedup_key: Arc::new(|request| Some(request.dedup_key())),
        }
    }

    /// Override the deduplication key function.  Returning `None`
    /// bypasses coalescing for that request.
    pub fn with_dedup_key(mut self, dedup_key: DedupKeyFn) -> Self {
        self.dedup_key = dedup_key;
        self
    }

    /// Subscribe, joining an identical in-flight subscription when one
    /// exists.
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
        caller: CancellationToken,
    ) -> Result<NotificationReader> {
        let Some(key) = (self.dedup_key)(&request) else {
            log::debug!("[pulse-link] Bypassing coalescing for {}", request.method);
            let stream = self.inner.subscribe(request, caller).await?;
            return Ok(NotificationReader::direct(stream));
        };

        let inner = self.inner.clone();
        let (upstream, outcome) = self
            .cache
            .get_or_create(key, &caller, move |token| async move {
                // Cache miss is the only path that subscribes upstream.
                let stream = inner.subscribe(request, token.clone()).await?;
                Ok(SharedUpstream::spawn(stream, token))
            })
            .await?;
        if outcome == CacheOutcome::Hit {
            // A fresh subscribe message must not be sent again.
            log::debug!("[pulse-link] Joined an in-flight identical subscription");
        }
        let (caller_id, receiver) = upstream.attach()?;

        // Release this caller's delivery slot the moment it aborts, even
        // if its reader is retained, so it cannot hold fan-out capacity.
        let hub = upstream.clone();
        let watch = caller.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            hub.detach(caller_id);
        });

        Ok(NotificationReader::shared(receiver, upstream, caller))
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.cache.len()
    }
}
