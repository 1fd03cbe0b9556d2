//! Single-flight result caching.
//!
//! [`SingleFlightCache`] maps a key to either a finished value or a shared,
//! in-flight computation. All callers asking for the same key while its
//! computation runs await the very same future, so the computation (and the
//! query behind it) executes at most once per key. [`ResultCache`] layers an
//! id-stream interface on top of it.
//!
//! # Cancellation
//!
//! A pending computation is driven by whichever waiter polls it. If every
//! waiter drops it, it pauses; the cache keeps the shared handle, so the next
//! caller for the same key resumes it instead of starting over. Nothing is
//! cancelled on the backing store.
//!
//! # Capacity
//!
//! Finalized values are kept until [`clear`](SingleFlightCache::clear) unless
//! [`CacheConfig::max_entries`] is set, in which case the least recently used
//! finalized values beyond it are evicted and recomputed on demand. Pending
//! computations are never evicted.
//!
//! # Invalidation
//!
//! [`clear`](SingleFlightCache::clear) may be called at any time. Computations
//! already in flight still complete for the callers awaiting them, but their
//! results are not written back into the cleared cache.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt, TryStreamExt};
use lru::LruCache;
use models_tree_query::{IdStream, NodeId, QueryResult};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CacheConfig;

type SharedComputation<V> = Shared<BoxFuture<'static, QueryResult<V>>>;

struct PendingEntry<V> {
    generation: u64,
    computation: SharedComputation<V>,
}

struct CacheState<K, V> {
    finalized: LruCache<K, V>,
    pending: HashMap<K, PendingEntry<V>>,
    generation: u64,
    retain_finalized: bool,
}

/// Outcome of a [`SingleFlightCache`] lookup.
pub enum Lookup<V: Clone> {
    /// The value was already computed.
    Ready(V),
    /// The value is being computed; await the shared handle.
    Pending(Shared<BoxFuture<'static, QueryResult<V>>>),
}

impl<V: Clone + Send + Sync + 'static> Lookup<V> {
    /// Resolves the lookup into a value.
    pub async fn resolve(self) -> QueryResult<V> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(computation) => computation.await,
        }
    }
}

/// Keyed cache guaranteeing at most one concurrent computation per key.
///
/// A successful computation is finalized into the cache and never recomputed
/// until [`clear`](Self::clear). A failed one is discarded, so the next caller
/// starts a fresh computation.
pub struct SingleFlightCache<K, V> {
    name: &'static str,
    state: Arc<Mutex<CacheState<K, V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache; `name` only appears in log output.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        let finalized = match config.max_entries {
            Some(limit) => LruCache::new(NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN)),
            None => LruCache::unbounded(),
        };
        Self::with_state(name, finalized, true)
    }

    /// Creates a cache that only coalesces concurrent computations.
    ///
    /// Finished values are handed to their waiters and then forgotten.
    pub fn in_flight(name: &'static str) -> Self {
        Self::with_state(name, LruCache::unbounded(), false)
    }

    fn with_state(name: &'static str, finalized: LruCache<K, V>, retain_finalized: bool) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(CacheState {
                finalized,
                pending: HashMap::new(),
                generation: 0,
                retain_finalized,
            })),
        }
    }

    /// Gets the value for `key`, joining or starting its computation.
    ///
    /// `start` is only invoked when the key is neither finalized nor pending.
    /// The future it returns is lazy and runs when the lookup is awaited.
    pub fn get_or_start<F>(&self, key: K, start: F) -> Lookup<V>
    where
        F: FnOnce() -> BoxFuture<'static, QueryResult<V>>,
    {
        if let Some(lookup) = self.lookup(&key) {
            return lookup;
        }

        let computation = start();

        let mut state = self.state.lock();
        // Another caller may have registered the key while `start` ran.
        if let Some(lookup) = Self::lookup_locked(self.name, &mut state, &key) {
            return lookup;
        }
        state.generation += 1;
        let generation = state.generation;
        let shared = Self::finalizing(
            self.name,
            Arc::downgrade(&self.state),
            key.clone(),
            generation,
            computation,
        );
        state.pending.insert(
            key,
            PendingEntry {
                generation,
                computation: shared.clone(),
            },
        );
        debug!(cache = self.name, generation, "started computation");
        Lookup::Pending(shared)
    }

    /// Returns true if `key` is finalized or pending.
    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.finalized.contains(key) || state.pending.contains_key(key)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.finalized.clear();
        state.pending.clear();
        debug!(cache = self.name, "cleared");
    }

    /// Returns the number of entries, finalized or pending.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.finalized.len() + state.pending.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            finalized_entries: state.finalized.len(),
            pending_entries: state.pending.len(),
        }
    }

    fn lookup(&self, key: &K) -> Option<Lookup<V>> {
        let mut state = self.state.lock();
        Self::lookup_locked(self.name, &mut state, key)
    }

    fn lookup_locked(name: &str, state: &mut CacheState<K, V>, key: &K) -> Option<Lookup<V>> {
        if let Some(value) = state.finalized.get(key) {
            trace!(cache = name, "hit");
            return Some(Lookup::Ready(value.clone()));
        }
        let pending = state.pending.get(key)?;
        trace!(cache = name, "joined pending computation");
        Some(Lookup::Pending(pending.computation.clone()))
    }

    /// Wraps `computation` so that its completion updates the entry it was
    /// registered under, provided that entry is still the same pending one.
    fn finalizing(
        name: &'static str,
        state: Weak<Mutex<CacheState<K, V>>>,
        key: K,
        generation: u64,
        computation: BoxFuture<'static, QueryResult<V>>,
    ) -> SharedComputation<V> {
        async move {
            let result = computation.await;
            let Some(state) = state.upgrade() else {
                return result;
            };
            let mut state = state.lock();
            let is_current = state
                .pending
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if is_current {
                state.pending.remove(&key);
                match &result {
                    Ok(value) if state.retain_finalized => {
                        state.finalized.put(key, value.clone());
                        debug!(cache = name, generation, "finalized");
                    }
                    Ok(_) => trace!(cache = name, generation, "completed"),
                    Err(err) => {
                        debug!(cache = name, generation, error = %err, "discarded failed computation");
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for SingleFlightCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("finalized", &state.finalized.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Statistics about a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries holding a finished value.
    pub finalized_entries: usize,
    /// Entries whose computation is still running.
    pub pending_entries: usize,
}

/// Single-flight cache of id sets exposed as id streams.
///
/// Ids are deduplicated and kept in arrival order.
pub struct ResultCache<K> {
    inner: SingleFlightCache<K, Arc<Vec<NodeId>>>,
}

impl<K> ResultCache<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Creates a cache; `name` only appears in log output.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self {
            inner: SingleFlightCache::new(name, config),
        }
    }

    /// Returns the ids for `key`, running `factory`'s stream at most once.
    ///
    /// A finalized key is replayed without running anything. A pending key
    /// returns a stream over the same in-flight computation. Otherwise
    /// `factory` is invoked and its stream becomes the pending computation.
    pub fn get_or_compute<F>(&self, key: K, factory: F) -> IdStream
    where
        F: FnOnce() -> IdStream,
    {
        let lookup = self.inner.get_or_start(key, || {
            let source = factory();
            async move {
                let mut seen = HashSet::new();
                let ids: Vec<NodeId> = source
                    .try_filter(|id| futures::future::ready(seen.insert(id.clone())))
                    .try_collect()
                    .await?;
                Ok(Arc::new(ids))
            }
            .boxed()
        });
        match lookup {
            Lookup::Ready(ids) => replay(ids),
            Lookup::Pending(computation) => stream::once(computation)
                .map_ok(replay)
                .try_flatten()
                .boxed(),
        }
    }

    /// Returns true if `key` is finalized or pending.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<K: Hash + Eq> std::fmt::Debug for ResultCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache").field("inner", &self.inner).finish()
    }
}

/// Streams the ids of a finalized set.
pub(crate) fn replay(ids: Arc<Vec<NodeId>>) -> IdStream {
    stream::iter((0..ids.len()).map(move |idx| Ok(ids[idx].clone()))).boxed()
}
