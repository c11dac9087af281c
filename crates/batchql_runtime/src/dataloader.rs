//! Dataloader for batchql.
//!
//! Owns the source registry and the job queue. Jobs request keys from
//! sources; when every job is blocked, each source with pending keys fetches
//! them in one batch, and the blocked jobs resume.

use crate::error::JobError;
use crate::registry::{Registry, Restore};
use crate::scheduler::{Job, JobKind, JobQueue, JobResult, SchedulerStats, StatsSnapshot};
use crate::source::{Source, SourceHandle};
use parking_lot::Mutex;
use std::fmt;
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

struct Inner {
    id: usize,
    registry: Registry,
    queue: Arc<JobQueue>,
    stats: SchedulerStats,
}

/// Batching scheduler shared by every query in a multiplex.
///
/// Cloning is cheap; clones drive the same queue and sources.
#[derive(Clone)]
pub struct Dataloader {
    inner: Arc<Inner>,
}

impl Default for Dataloader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dataloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataloader")
            .field("sources", &self.source_count())
            .field("queued", &self.inner.queue.live())
            .finish()
    }
}

impl Dataloader {
    /// Creates a dataloader with no sources and an empty queue.
    pub fn new() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id,
                registry: Registry::default(),
                queue: JobQueue::new(id),
                stats: SchedulerStats::default(),
            }),
        }
    }

    /// Creates a dataloader, lets `f` enqueue work on it, runs it, and
    /// returns `f`'s value.
    pub async fn with_dataloading<F, Fut, T>(f: F) -> Result<T, JobError>
    where
        F: FnOnce(Dataloader) -> Fut,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
        T: Send + 'static,
    {
        let loader = Self::new();
        let job = f(loader.clone());
        let queue = Arc::clone(&loader.inner.queue);
        loader.run_job(&queue, job).await
    }

    /// Returns the source for `args`, creating it on first use.
    pub fn with<S: Source>(&self, args: S::Args) -> SourceHandle<S> {
        SourceHandle::new(self.inner.registry.get_or_insert::<S>(args))
    }

    /// Enqueues a job. May be called from inside a running job.
    ///
    /// A job appended from inside a job joins the queue of the job that
    /// appended it; otherwise it joins the root queue.
    pub fn append_job<F>(&self, job: F)
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        self.current_queue()
            .push(JobKind::Work, Box::pin(job), &self.inner.stats);
    }

    /// Drains the root queue, flushing sources whenever every job is blocked.
    ///
    /// Job failures do not stop the run; the first one is returned after
    /// the queue settles. A throw is returned immediately and leaves the
    /// remaining jobs queued.
    pub async fn run(&self) -> JobResult {
        self.drain(&self.inner.queue).await
    }

    /// Runs `job` (and everything it enqueues) to completion on a queue of
    /// its own, leaving the outer queues and pending keys untouched.
    ///
    /// Outer jobs that keep running while the isolated job waits on an
    /// outside wakeup still append to their own queues.
    pub async fn run_isolated<F, T>(&self, job: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = Isolation::enter(self);
        let queue = JobQueue::new(self.inner.id);
        self.run_job(&queue, job).await
    }

    /// Point-in-time scheduler counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub(crate) fn scheduler_stats(&self) -> &SchedulerStats {
        &self.inner.stats
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn current_queue(&self) -> Arc<JobQueue> {
        JobQueue::current(self.inner.id).unwrap_or_else(|| Arc::clone(&self.inner.queue))
    }

    async fn drain(&self, queue: &Arc<JobQueue>) -> JobResult {
        poll_fn(|cx| queue.poll_drain(self, cx)).await
    }

    async fn run_job<F, T>(&self, queue: &Arc<JobQueue>, job: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let job: Job = Box::pin(async move {
            let value = job.await?;
            *out.lock() = Some(value);
            Ok(())
        });
        queue.push(JobKind::Work, job, &self.inner.stats);
        self.drain(queue).await?;

        let value = slot.lock().take();
        value.ok_or_else(|| JobError::message("job finished without producing a value"))
    }
}

/// Stashes every source's pending keys; restored on drop.
struct Isolation {
    restores: Vec<Restore>,
}

impl Isolation {
    fn enter(loader: &Dataloader) -> Self {
        let restores = loader.inner.registry.stash_pending();
        debug!(
            stashed_sources = restores.len(),
            outer_jobs = loader.inner.queue.live(),
            "entering isolated run"
        );
        Self { restores }
    }
}

impl Drop for Isolation {
    fn drop(&mut self) {
        for restore in self.restores.drain(..) {
            restore();
        }
    }
}
