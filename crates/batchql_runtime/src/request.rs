//! Deferred handles to values that a source has not fetched yet.

use crate::error::LoadError;
use crate::source::Source;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

struct SlotState<V> {
    outcome: Option<Result<V, LoadError>>,
    wakers: Vec<Waker>,
}

/// Where a fetched value (or the batch's failure) lands.
pub(crate) struct Slot<V> {
    state: Mutex<SlotState<V>>,
}

impl<V: Clone> Slot<V> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                wakers: Vec::new(),
            }),
        }
    }

    pub(crate) fn resolved(outcome: Result<V, LoadError>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: Some(outcome),
                wakers: Vec::new(),
            }),
        }
    }

    /// Stores the outcome and wakes whoever is waiting on it.
    pub(crate) fn resolve(&self, outcome: Result<V, LoadError>) {
        let wakers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn is_resolved(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<V, LoadError>> {
        let mut state = self.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        // Clones of a request may be awaited from different jobs.
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// A requested key whose value may not be fetched yet.
///
/// Requesting queues the key without suspending; only [`load`](Self::load)
/// suspends, and only if the value is still missing.
pub struct PendingRequest<S: Source> {
    source_name: &'static str,
    key: S::Key,
    slot: Arc<Slot<S::Value>>,
}

impl<S: Source> PendingRequest<S> {
    pub(crate) fn new(source_name: &'static str, key: S::Key, slot: Arc<Slot<S::Value>>) -> Self {
        Self {
            source_name,
            key,
            slot,
        }
    }

    /// The requested key.
    pub fn key(&self) -> &S::Key {
        &self.key
    }

    /// Returns true once the value (or the batch's failure) is available.
    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Waits for the value.
    pub async fn load(&self) -> Result<S::Value, LoadError> {
        poll_fn(|cx| self.slot.poll_outcome(cx)).await
    }
}

impl<S: Source> Clone for PendingRequest<S> {
    fn clone(&self) -> Self {
        Self {
            source_name: self.source_name,
            key: self.key.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S: Source> fmt::Debug for PendingRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("source", &self.source_name)
            .field("key", &self.key)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Several requests against one source, loaded together.
pub struct PendingRequestAll<S: Source> {
    requests: Vec<PendingRequest<S>>,
}

impl<S: Source> PendingRequestAll<S> {
    pub(crate) fn new(requests: Vec<PendingRequest<S>>) -> Self {
        Self { requests }
    }

    /// The individual requests, in request order.
    pub fn requests(&self) -> &[PendingRequest<S>] {
        &self.requests
    }

    /// Returns true once every value is available.
    pub fn is_resolved(&self) -> bool {
        self.requests.iter().all(PendingRequest::is_resolved)
    }

    /// Waits for all values, preserving request order.
    pub async fn load(&self) -> Result<Vec<S::Value>, LoadError> {
        try_join_all(self.requests.iter().map(PendingRequest::load)).await
    }
}

impl<S: Source> Clone for PendingRequestAll<S> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<S: Source> fmt::Debug for PendingRequestAll<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.requests).finish()
    }
}
