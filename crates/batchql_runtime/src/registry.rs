//! Source registry.
//!
//! Maps `(source type, batch key)` to the single live source instance for one
//! dataloader, so unrelated call sites that should share a batch do.

use crate::dataloader::Dataloader;
use crate::scheduler::Job;
use crate::source::{Source, SourceCell};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The identity under which requests are coalesced into one source instance.
///
/// Built from the canonical JSON encoding of a value, so structurally equal
/// constructor arguments produce equal keys. Object keys are sorted, so maps
/// compare equal whatever their iteration order. Sequences keep their order;
/// unordered sets should be passed as sorted collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey(String);

impl BatchKey {
    /// Derives a batch key from any serializable value.
    pub fn of<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self(canonical(value).to_string()),
            Err(_) => Self(format!("{value:?}")),
        }
    }

    /// Returns the canonical encoding.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rebuilds every object with its keys in sorted order.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonical(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restores keys stashed by [`BatchFlush::stash_pending`].
pub(crate) type Restore = Box<dyn FnOnce() + Send>;

/// Type-erased view of a source used by the scheduler.
pub(crate) trait BatchFlush: Send + Sync {
    /// Returns true if keys are waiting to be fetched.
    fn has_pending(&self) -> bool;

    /// Takes the whole pending set and returns the job that fetches it.
    fn begin_flush(self: Arc<Self>, loader: &Dataloader) -> Option<Job>;

    /// Moves the pending set aside, returning a closure that puts it back.
    fn stash_pending(self: Arc<Self>) -> Option<Restore>;
}

struct Entry {
    instance: Arc<dyn Any + Send + Sync>,
    batch: Arc<dyn BatchFlush>,
}

/// All sources created by one dataloader, in registration order.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<IndexMap<(TypeId, BatchKey), Entry, FxBuildHasher>>,
}

impl Registry {
    /// Returns the source for these constructor arguments, creating it on first use.
    pub(crate) fn get_or_insert<S: Source>(&self, args: S::Args) -> Arc<SourceCell<S>> {
        let key = (TypeId::of::<S>(), S::batch_key_for(&args));
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&key) {
            if let Ok(cell) = Arc::clone(&entry.instance).downcast::<SourceCell<S>>() {
                return cell;
            }
        }

        debug!(source = crate::source::source_name::<S>(), batch_key = %key.1, "registering source");
        let cell = Arc::new(SourceCell::new(S::new(args)));
        entries.insert(
            key,
            Entry {
                instance: Arc::clone(&cell) as Arc<dyn Any + Send + Sync>,
                batch: Arc::clone(&cell) as Arc<dyn BatchFlush>,
            },
        );
        cell
    }

    /// Starts a flush for every source with pending keys.
    pub(crate) fn begin_flushes(&self, loader: &Dataloader) -> Vec<Job> {
        self.pending_batches()
            .into_iter()
            .filter_map(|batch| batch.begin_flush(loader))
            .collect()
    }

    /// Moves every source's pending keys aside.
    pub(crate) fn stash_pending(&self) -> Vec<Restore> {
        self.pending_batches()
            .into_iter()
            .filter_map(|batch| batch.stash_pending())
            .collect()
    }

    /// Number of live sources.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn pending_batches(&self) -> Vec<Arc<dyn BatchFlush>> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.batch.has_pending())
            .map(|entry| Arc::clone(&entry.batch))
            .collect()
    }
}
