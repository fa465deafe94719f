//! Request coalescing (singleflight) for read-heavy paths.
//!
//! The registry is process-scoped: it deduplicates concurrent callers inside
//! one process only. Replicas do not see each other's in-flight fetches; a
//! shared short-TTL cache is needed if cross-replica deduplication matters.

use crate::error::CoreError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CoreError>>>;
type Registry<K, V> = Arc<Mutex<HashMap<K, InFlight<V>>>>;

struct InFlight<V> {
    generation: u64,
    fetch: SharedFetch<V>,
}

/// Removes a registry entry when its fetch settles, including by panic.
struct SettleGuard<K, V>
where
    K: Eq + Hash,
{
    registry: Registry<K, V>,
    key: Option<K>,
    generation: u64,
}

impl<K, V> Drop for SettleGuard<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut inflight = self.registry.lock();
        if inflight
            .get(&key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            inflight.remove(&key);
        }
    }
}

/// Shares one in-flight fetch per key among all concurrent callers.
///
/// Results are not retained: once a fetch settles its key is removed and the
/// next caller starts a fresh fetch. A started fetch runs to completion even
/// if every waiter goes away, since other waiters may join it meanwhile.
pub struct RequestCoalescer<K, V> {
    inflight: Registry<K, V>,
    next_generation: AtomicU64,
    warn_inflight: usize,
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_warn_threshold(usize::MAX)
    }

    pub fn with_warn_threshold(warn_inflight: usize) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            warn_inflight,
        }
    }

    /// Keys with a fetch currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Returns the outcome of the in-flight fetch for `key`, starting one with
    /// `fetcher` when none exists. Every waiter observes the same value or
    /// the same error.
    pub async fn coalesce<F, Fut>(&self, key: K, fetcher: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        let fetch = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => {
                    debug!(?key, "joined in-flight fetch");
                    existing.fetch.clone()
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let settle = SettleGuard {
                        registry: Arc::clone(&self.inflight),
                        key: Some(key.clone()),
                        generation,
                    };
                    let work = fetcher();
                    let task = tokio::spawn(async move {
                        let _settle = settle;
                        work.await
                    });
                    let fetch = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join_err) => Err(CoreError::Internal(format!(
                                "coalesced fetch did not complete: {join_err}"
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        key.clone(),
                        InFlight {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    if inflight.len() > self.warn_inflight {
                        warn!(
                            in_flight = inflight.len(),
                            threshold = self.warn_inflight,
                            "coalescer registry above warning threshold"
                        );
                    }
                    debug!(?key, generation, "started coalesced fetch");
                    fetch
                }
            }
        };
        fetch.await
    }
}
