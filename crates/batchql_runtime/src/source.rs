//! Batch sources.
//!
//! A source accumulates requested keys, serves already-fetched keys from its
//! cache, and fetches everything pending in one call when the scheduler
//! flushes it.

use crate::dataloader::Dataloader;
use crate::error::{FetchError, LoadError};
use crate::registry::{BatchFlush, BatchKey, Restore};
use crate::request::{PendingRequest, PendingRequestAll, Slot};
use crate::scheduler::Job;
use async_trait::async_trait;
use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// A keyed batch-fetch unit.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use batchql_runtime::{Dataloader, FetchError, Source};
///
/// struct Doubler;
///
/// #[async_trait]
/// impl Source for Doubler {
///     type Args = ();
///     type Key = i64;
///     type Value = i64;
///
///     fn new(_args: ()) -> Self {
///         Doubler
///     }
///
///     async fn fetch(&self, _loader: &Dataloader, keys: &[i64]) -> Result<Vec<i64>, FetchError> {
///         Ok(keys.iter().map(|k| k * 2).collect())
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + Sync + Sized + 'static {
    /// Constructor arguments.
    type Args: Serialize + fmt::Debug + Send + 'static;

    /// Key requested from the source.
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    /// Value fetched for one key.
    type Value: Clone + Send + Sync + 'static;

    /// Pure construction; no I/O.
    fn new(args: Self::Args) -> Self;

    /// Identity under which instances are shared.
    ///
    /// Defaults to the constructor arguments themselves. Override it to make
    /// structurally different constructor calls share one instance.
    fn batch_key_for(args: &Self::Args) -> BatchKey {
        BatchKey::of(args)
    }

    /// Fetches values for the given keys.
    ///
    /// `keys` is deduplicated and in first-request order. The result must
    /// have the same length and order.
    async fn fetch(
        &self,
        loader: &Dataloader,
        keys: &[Self::Key],
    ) -> Result<Vec<Self::Value>, FetchError>;
}

/// Short type name of a source, for logs and errors.
pub(crate) fn source_name<S: 'static>() -> &'static str {
    let full = std::any::type_name::<S>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

struct SourceState<K, V> {
    pending: IndexSet<K, FxBuildHasher>,
    in_flight: FxHashSet<K>,
    cache: FxHashMap<K, V>,
    waiters: FxHashMap<K, Vec<Arc<Slot<V>>>>,
}

impl<K: Eq + Hash, V> Default for SourceState<K, V> {
    fn default() -> Self {
        Self {
            pending: IndexSet::default(),
            in_flight: FxHashSet::default(),
            cache: FxHashMap::default(),
            waiters: FxHashMap::default(),
        }
    }
}

/// A registered source instance and its pending/cache state.
pub(crate) struct SourceCell<S: Source> {
    source: S,
    name: &'static str,
    state: Mutex<SourceState<S::Key, S::Value>>,
}

impl<S: Source> SourceCell<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            name: source_name::<S>(),
            state: Mutex::new(SourceState::default()),
        }
    }

    /// Registers interest in `key` and returns the slot its value lands in.
    fn request(&self, key: S::Key) -> Arc<Slot<S::Value>> {
        let mut state = self.state.lock();
        if let Some(value) = state.cache.get(&key) {
            return Arc::new(Slot::resolved(Ok(value.clone())));
        }

        if !state.in_flight.contains(&key) {
            state.pending.insert(key.clone());
        }
        let slot = Arc::new(Slot::new());
        state.waiters.entry(key).or_default().push(Arc::clone(&slot));
        slot
    }

    fn prime(&self, key: S::Key, value: S::Value) -> bool {
        let slots = {
            let mut state = self.state.lock();
            if state.cache.contains_key(&key) {
                return false;
            }
            state.pending.shift_remove(&key);
            state.cache.insert(key.clone(), value.clone());
            state.waiters.remove(&key).unwrap_or_default()
        };
        for slot in slots {
            slot.resolve(Ok(value.clone()));
        }
        true
    }

    async fn flush(&self, loader: &Dataloader, keys: Vec<S::Key>) {
        let stats = loader.scheduler_stats();
        stats.fetch_calls.fetch_add(1, Ordering::Relaxed);
        stats.keys_fetched.fetch_add(keys.len(), Ordering::Relaxed);
        debug!(source = self.name, keys = keys.len(), "fetching batch");

        let outcome = match self.source.fetch(loader, &keys).await {
            Ok(values) if values.len() == keys.len() => Ok(values),
            Ok(values) => Err(LoadError::CountMismatch {
                source_name: self.name,
                expected: keys.len(),
                actual: values.len(),
            }),
            Err(error) => Err(LoadError::Fetch {
                source_name: self.name,
                error,
            }),
        };

        let mut resolved = Vec::with_capacity(keys.len());
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            match outcome {
                Ok(values) => {
                    for (key, value) in keys.into_iter().zip(values) {
                        state.in_flight.remove(&key);
                        let value = state.cache.entry(key.clone()).or_insert(value).clone();
                        if let Some(slots) = state.waiters.remove(&key) {
                            resolved.push((slots, Ok(value)));
                        }
                    }
                }
                Err(err) => {
                    warn!(source = self.name, error = %err, "batch fetch failed");
                    for key in keys {
                        state.in_flight.remove(&key);
                        if let Some(slots) = state.waiters.remove(&key) {
                            resolved.push((slots, Err(err.clone())));
                        }
                    }
                }
            }
        }

        for (slots, outcome) in resolved {
            for slot in slots {
                slot.resolve(outcome.clone());
            }
        }
    }

    fn restore_pending(&self, stashed: Vec<S::Key>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let current = std::mem::take(&mut state.pending);
        let mut restored: IndexSet<S::Key, FxBuildHasher> = stashed
            .into_iter()
            .filter(|key| !state.cache.contains_key(key) && !state.in_flight.contains(key))
            .collect();
        restored.extend(current);
        state.pending = restored;
    }
}

impl<S: Source> BatchFlush for SourceCell<S> {
    fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    fn begin_flush(self: Arc<Self>, loader: &Dataloader) -> Option<Job> {
        let keys: Vec<S::Key> = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return None;
            }
            let keys: Vec<S::Key> = state.pending.drain(..).collect();
            state.in_flight.extend(keys.iter().cloned());
            keys
        };

        let loader = loader.clone();
        Some(Box::pin(async move {
            self.flush(&loader, keys).await;
            Ok(())
        }))
    }

    fn stash_pending(self: Arc<Self>) -> Option<Restore> {
        let stashed: Vec<S::Key> = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return None;
            }
            state.pending.drain(..).collect()
        };
        Some(Box::new(move || self.restore_pending(stashed)))
    }
}

/// Handle to one registered source, returned by [`Dataloader::with`].
pub struct SourceHandle<S: Source> {
    cell: Arc<SourceCell<S>>,
}

impl<S: Source> Clone for SourceHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<S: Source> fmt::Debug for SourceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.lock();
        f.debug_struct("SourceHandle")
            .field("source", &self.cell.name)
            .field("pending", &state.pending.len())
            .field("cached", &state.cache.len())
            .finish()
    }
}

impl<S: Source> SourceHandle<S> {
    pub(crate) fn new(cell: Arc<SourceCell<S>>) -> Self {
        Self { cell }
    }

    /// Requests a key without waiting for it.
    pub fn request(&self, key: S::Key) -> PendingRequest<S> {
        let slot = self.cell.request(key.clone());
        PendingRequest::new(self.cell.name, key, slot)
    }

    /// Requests several keys without waiting for them.
    pub fn request_all<I>(&self, keys: I) -> PendingRequestAll<S>
    where
        I: IntoIterator<Item = S::Key>,
    {
        PendingRequestAll::new(keys.into_iter().map(|key| self.request(key)).collect())
    }

    /// Loads one value, suspending the calling job until it is fetched.
    pub async fn load(&self, key: S::Key) -> Result<S::Value, LoadError> {
        self.request(key).load().await
    }

    /// Loads several values in request order, suspending at most once.
    pub async fn load_all<I>(&self, keys: I) -> Result<Vec<S::Value>, LoadError>
    where
        I: IntoIterator<Item = S::Key>,
    {
        self.request_all(keys).load().await
    }

    /// Puts a value in the cache unless the key is already cached.
    ///
    /// Returns true if the value was stored.
    pub fn prime(&self, key: S::Key, value: S::Value) -> bool {
        self.cell.prime(key, value)
    }

    /// Returns true if the key has been fetched or primed.
    pub fn is_cached(&self, key: &S::Key) -> bool {
        self.cell.state.lock().cache.contains_key(key)
    }

    /// Keys waiting for the next flush, in first-request order.
    pub fn pending_keys(&self) -> Vec<S::Key> {
        self.cell.state.lock().pending.iter().cloned().collect()
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.cell.source
    }

    /// Returns true if both handles point at the same source instance.
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}
