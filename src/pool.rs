//! Bin-packing pool of WebSocket channels.
//!
//! [`ChannelPool`] shares a small, bounded set of channels among many
//! logical subscribers.  New channels are opened until `min_channels`
//! exist; after that, subscribers are packed onto the least-loaded
//! channel still under `max_subscriptions_per_channel`, rotating among
//! equally-free channels.  A channel is torn down as soon as its last
//! subscriber aborts or the channel itself fails, so the next vend
//! rebuilds fresh infrastructure instead of reusing poisoned state.

use crate::{
    channel::WsChannel,
    error::{PulseLinkError, Result},
    models::PoolOptions,
};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Opens one channel.  Receives the pool entry's own cancellation token;
/// the channel must tear itself down when that token fires.
pub(crate) type ChannelOpener =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Arc<WsChannel>>> + Send + Sync>;

enum EntryChannel {
    /// Channel still opening; these vend calls share the result.
    Pending(Vec<oneshot::Sender<Result<Arc<WsChannel>>>>),
    Ready(Arc<WsChannel>),
}

struct PoolEntry {
    id: u64,
    channel: EntryChannel,
    subscribers: usize,
    /// The entry's own cancellation controller, distinct from any
    /// subscriber's token.  Cancelling it tears the channel down.
    token: CancellationToken,
}

struct PoolState {
    entries: Vec<PoolEntry>,
    /// Index of the entry with the most remaining capacity, or `None`
    /// when the next vend must open a new channel.  Doubles as the
    /// rotation pointer for the round-robin tie-break.
    free_index: Option<usize>,
    next_id: u64,
}

impl PoolState {
    /// Recompute the free-channel index.
    ///
    /// Stays `None` during the fill phase (fewer entries than
    /// `min_channels`).  Otherwise scans forward from just past the
    /// previously chosen entry and picks the lowest-subscriber entry
    /// still under the per-channel cap, or `None` when all are full.
    fn recompute_free_index(&mut self, options: &PoolOptions) {
        let n = self.entries.len();
        if n == 0 || n < options.min_channels {
            self.free_index = None;
            return;
        }
        let start = self.free_index.map(|index| (index + 1) % n).unwrap_or(0);
        let mut best: Option<usize> = None;
        for offset in 0..n {
            let index = (start + offset) % n;
            let count = self.entries[index].subscribers;
            if count >= options.max_subscriptions_per_channel {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => count < self.entries[current].subscribers,
            };
            if better {
                best = Some(index);
            }
        }
        self.free_index = best;
    }

    /// Remove the entry at `position` and fix up the rotation pointer so
    /// repeated disposals do not skip entries.
    fn remove_entry(&mut self, position: usize, options: &PoolOptions) -> PoolEntry {
        let entry = self.entries.remove(position);
        if let Some(index) = self.free_index {
            self.free_index = index.checked_sub(1);
        }
        self.recompute_free_index(options);
        entry
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }
}

enum Waiter {
    Value(Arc<WsChannel>),
    Pending(oneshot::Receiver<Result<Arc<WsChannel>>>),
}

/// Pool of channels shared by many logical subscribers.
#[derive(Clone)]
pub(crate) struct ChannelPool {
    state: Arc<Mutex<PoolState>>,
    options: PoolOptions,
    opener: ChannelOpener,
}

impl ChannelPool {
    pub(crate) fn new(opener: ChannelOpener, options: PoolOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                entries: Vec::new(),
                free_index: None,
                next_id: 1,
            })),
            options,
            opener,
        }
    }

    /// Vend a channel for one subscriber.
    ///
    /// The (possibly still-opening) channel of the chosen entry is shared
    /// by every subscriber of that entry.  The subscriber's reference is
    /// held until `caller` is cancelled; when the last subscriber of an
    /// entry aborts, the entry is disposed and its channel torn down.
    pub(crate) async fn vend(&self, caller: &CancellationToken) -> Result<Arc<WsChannel>> {
        let (entry_id, waiter) = {
            let mut state = self.state.lock().expect("channel pool mutex poisoned");
            let index = match state.free_index {
                Some(index) => index,
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let token = CancellationToken::new();
                    log::debug!("[pulse-link] Opening pooled channel {}", id);
                    state.entries.push(PoolEntry {
                        id,
                        channel: EntryChannel::Pending(Vec::new()),
                        subscribers: 0,
                        token: token.clone(),
                    });
                    let future = (self.opener)(token);
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let result = future.await;
                        pool.finish_open(id, result);
                    });
                    state.entries.len() - 1
                },
            };

            let entry = &mut state.entries[index];
            entry.subscribers += 1;
            let entry_id = entry.id;
            let waiter = match &mut entry.channel {
                EntryChannel::Ready(channel) => Waiter::Value(channel.clone()),
                EntryChannel::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Waiter::Pending(rx)
                },
            };
            state.recompute_free_index(&self.options);
            (entry_id, waiter)
        };

        // One-shot release when this subscriber aborts.
        let pool = self.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            caller.cancelled().await;
            pool.release(entry_id);
        });

        match waiter {
            Waiter::Value(channel) => Ok(channel),
            Waiter::Pending(rx) => rx.await.map_err(|_| PulseLinkError::Cancelled)?,
        }
    }

    /// Record the outcome of a channel-open attempt.
    fn finish_open(&self, id: u64, result: Result<Arc<WsChannel>>) {
        let mut state = self.state.lock().expect("channel pool mutex poisoned");
        let Some(position) = state.position(id) else {
            // Disposed while opening; the entry token was already
            // cancelled, so the channel (if it opened) tears itself down.
            return;
        };
        match result {
            Ok(channel) => {
                let entry = &mut state.entries[position];
                let previous =
                    std::mem::replace(&mut entry.channel, EntryChannel::Ready(channel.clone()));
                if let EntryChannel::Pending(waiters) = previous {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(channel.clone()));
                    }
                }
                // Dispose the entry when the channel goes down for any
                // reason, so the next vend starts from fresh state.
                let pool = self.clone();
                let terminated = channel.terminated();
                tokio::spawn(async move {
                    terminated.cancelled().await;
                    pool.dispose(id);
                });
            },
            Err(error) => {
                log::warn!("[pulse-link] Pooled channel {} failed to open: {}", id, error);
                let entry = state.remove_entry(position, &self.options);
                entry.token.cancel();
                if let EntryChannel::Pending(waiters) = entry.channel {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            },
        }
    }

    /// Drop one subscriber's reference to its entry.
    fn release(&self, id: u64) {
        let token = {
            let mut state = self.state.lock().expect("channel pool mutex poisoned");
            let Some(position) = state.position(id) else {
                return;
            };
            let entry = &mut state.entries[position];
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                let entry = state.remove_entry(position, &self.options);
                Some(entry.token)
            } else {
                state.recompute_free_index(&self.options);
                None
            }
        };
        if let Some(token) = token {
            log::debug!("[pulse-link] Disposing idle pooled channel {}", id);
            token.cancel();
        }
    }

    /// Remove an entry unconditionally (channel error or closure).
    fn dispose(&self, id: u64) {
        let token = {
            let mut state = self.state.lock().expect("channel pool mutex poisoned");
            let Some(position) = state.position(id) else {
                return;
            };
            let entry = state.remove_entry(position, &self.options);
            Some(entry.token)
        };
        if let Some(token) = token {
            log::debug!("[pulse-link] Disposing failed pooled channel {}", id);
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.state
            .lock()
            .expect("channel pool mutex poisoned")
            .entries
            .len()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_counts(&self) -> Vec<usize> {
        self.state
            .lock()
            .expect("channel pool mutex poisoned")
            .entries
            .iter()
            .map(|entry| entry.subscribers)
            .collect()
    }
}
