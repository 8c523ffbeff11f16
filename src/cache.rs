//! Reference-counted cache of abortable async resources.
//!
//! [`ResourceCache`] coalesces concurrent requests for the same key into
//! one resource-creation call, shares the live resource among all
//! callers, and tears it down when the last caller aborts.  Teardown is
//! deferred by one scheduler turn so an abort-then-resubscribe sequence
//! for the same key keeps the underlying resource alive instead of
//! rebuilding it.
//!
//! Registration happens synchronously under the map lock before any
//! await, so callers racing within one turn always observe the same
//! in-flight entry and the creation function runs exactly once per key.

use crate::error::{PulseLinkError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A resource that can live in a [`ResourceCache`].
///
/// `terminated()` must fire when the resource finishes on its own
/// (completes, errors, or its connection dies); the cache watches it and
/// purges the entry immediately so the next request builds fresh state.
pub(crate) trait CachedResource: Clone + Send + Sync + 'static {
    fn terminated(&self) -> CancellationToken;
}

/// Whether a call created the resource or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheOutcome {
    Created,
    Hit,
}

enum EntryState<R> {
    /// Creation in flight; these callers are notified on completion.
    Pending(Vec<oneshot::Sender<Result<R>>>),
    Ready(R),
}

struct CacheEntry<R> {
    state: EntryState<R>,
    /// The entry's own cancellation controller, independent of any
    /// caller's token.  Fired exactly once, when the entry is purged.
    token: CancellationToken,
    refcount: usize,
    purge_scheduled: bool,
    /// Guards release/evict calls against an entry that was purged and
    /// re-created under the same key.
    generation: u64,
}

struct CacheMap<K, R> {
    entries: HashMap<K, CacheEntry<R>>,
    next_generation: u64,
}

/// Reference-counted cache of abortable async resources, keyed by `K`.
pub(crate) struct ResourceCache<K, R> {
    inner: Arc<Mutex<CacheMap<K, R>>>,
}

impl<K, R> Clone for ResourceCache<K, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Waiter<R> {
    Value(R),
    Pending(oneshot::Receiver<Result<R>>),
}

impl<K, R> ResourceCache<K, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: CachedResource,
{
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheMap {
                entries: HashMap::new(),
                next_generation: 1,
            })),
        }
    }

    /// Get the shared resource for `key`, creating it if absent.
    ///
    /// `create` receives the entry's own cancellation token, which fires
    /// when the entry is purged.  The caller's reference is held until
    /// `caller` is cancelled; the last release schedules a deferred purge
    /// that a same-turn resubscribe can still rescue.
    pub(crate) async fn get_or_create<F, Fut>(
        &self,
        key: K,
        caller: &CancellationToken,
        create: F,
    ) -> Result<(R, CacheOutcome)>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let (outcome, generation, waiter) = {
            let mut map = self.inner.lock().expect("resource cache mutex poisoned");
            match map.entries.get_mut(&key) {
                Some(entry) => {
                    entry.refcount += 1;
                    let generation = entry.generation;
                    let waiter = match &mut entry.state {
                        EntryState::Ready(resource) => Waiter::Value(resource.clone()),
                        EntryState::Pending(waiters) => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            Waiter::Pending(rx)
                        },
                    };
                    (CacheOutcome::Hit, generation, waiter)
                },
                None => {
                    let generation = map.next_generation;
                    map.next_generation += 1;
                    let token = CancellationToken::new();
                    let (tx, rx) = oneshot::channel();
                    map.entries.insert(
                        key.clone(),
                        CacheEntry {
                            state: EntryState::Pending(vec![tx]),
                            token: token.clone(),
                            refcount: 1,
                            purge_scheduled: false,
                            generation,
                        },
                    );
                    let future = create(token);
                    let cache = self.clone();
                    let entry_key = key.clone();
                    tokio::spawn(async move {
                        let result = future.await;
                        cache.finish_creation(entry_key, generation, result);
                    });
                    (CacheOutcome::Created, generation, Waiter::Pending(rx))
                },
            }
        };

        self.watch_release(key, generation, caller.clone());

        let resource = match waiter {
            Waiter::Value(resource) => resource,
            Waiter::Pending(rx) => rx.await.map_err(|_| PulseLinkError::Cancelled)??,
        };
        Ok((resource, outcome))
    }

    /// Spawn a watcher that releases this caller's reference once its
    /// token fires.
    fn watch_release(&self, key: K, generation: u64, caller: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            caller.cancelled().await;
            cache.release(&key, generation);
        });
    }

    /// Record the result of an in-flight creation.
    fn finish_creation(&self, key: K, generation: u64, result: Result<R>) {
        let mut map = self.inner.lock().expect("resource cache mutex poisoned");
        let current = match map.entries.get(&key) {
            // The entry was purged while creation was in flight.  The
            // creation ran under the entry token, which the purge already
            // cancelled, so a well-behaved resource has torn itself down.
            Some(entry) if entry.generation == generation => entry.generation,
            _ => return,
        };
        debug_assert_eq!(current, generation);

        match result {
            Ok(resource) => {
                let entry = map
                    .entries
                    .get_mut(&key)
                    .expect("entry verified present above");
                let previous =
                    std::mem::replace(&mut entry.state, EntryState::Ready(resource.clone()));
                if let EntryState::Pending(waiters) = previous {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(resource.clone()));
                    }
                }
                // Purge the entry the moment the resource finishes on its
                // own, so the next request starts from fresh state.
                let cache = self.clone();
                let terminated = resource.terminated();
                tokio::spawn(async move {
                    terminated.cancelled().await;
                    cache.evict(&key, generation);
                });
            },
            Err(error) => {
                let entry = map
                    .entries
                    .remove(&key)
                    .expect("entry verified present above");
                entry.token.cancel();
                if let EntryState::Pending(waiters) = entry.state {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            },
        }
    }

    /// Drop one caller's reference.  The last release schedules a
    /// deferred purge; a resubscribe that lands before the purge runs
    /// keeps the resource alive.
    fn release(&self, key: &K, generation: u64) {
        let mut map = self.inner.lock().expect("resource cache mutex poisoned");
        let entry = match map.entries.get_mut(key) {
            // Already evicted (creation failure or resource termination);
            // a late release is a no-op.
            Some(entry) if entry.generation == generation => entry,
            _ => return,
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 && !entry.purge_scheduled {
            entry.purge_scheduled = true;
            let cache = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                // Grace period: give a same-turn resubscribe one scheduler
                // turn to rescue the entry before it is torn down.
                tokio::task::yield_now().await;
                cache.purge_if_unreferenced(&key, generation);
            });
        }
    }

    /// Complete a deferred purge if the entry is still unreferenced.
    fn purge_if_unreferenced(&self, key: &K, generation: u64) {
        let token = {
            let mut map = self.inner.lock().expect("resource cache mutex poisoned");
            match map.entries.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    if entry.refcount == 0 {
                        let entry = map.entries.remove(key).expect("entry present");
                        Some(entry.token)
                    } else {
                        // Rescued by a resubscribe during the grace period.
                        entry.purge_scheduled = false;
                        None
                    }
                },
                _ => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Remove the entry immediately (resource terminated on its own).
    fn evict(&self, key: &K, generation: u64) {
        let token = {
            let mut map = self.inner.lock().expect("resource cache mutex poisoned");
            match map.entries.get(key) {
                Some(entry) if entry.generation == generation => {
                    let entry = map.entries.remove(key).expect("entry present");
                    Some(entry.token)
                },
                _ => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("resource cache mutex poisoned")
            .entries
            .len()
    }
}
