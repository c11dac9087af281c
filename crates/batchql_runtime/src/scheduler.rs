//! Cooperative FIFO job queue.
//!
//! Jobs are boxed futures polled one at a time. A job that awaits a value
//! which is not cached yet returns `Pending`, and its waker puts it back at
//! the end of the ready queue once the value arrives. When the ready queue
//! runs dry, every source with pending keys gets a flush job, and draining
//! continues until no job is left alive.
//!
//! While a task is being polled its queue is the thread's current queue, so
//! jobs appended from inside a task land on the queue that task belongs to.

use crate::dataloader::Dataloader;
use crate::error::JobError;
use futures::future::BoxFuture;
use futures::task::{waker, ArcWake, AtomicWaker};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// Result of a job.
pub type JobResult = Result<(), JobError>;

/// A unit of cooperative work.
pub type Job = BoxFuture<'static, JobResult>;

/// What a queued job is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Work appended by a caller.
    Work,
    /// A source fetching its pending keys.
    Flush,
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total jobs appended (including flush jobs).
    pub jobs_appended: AtomicUsize,

    /// Total jobs that ran to completion.
    pub jobs_completed: AtomicUsize,

    /// Total jobs that terminated with an error.
    pub jobs_failed: AtomicUsize,

    /// Number of times the queue ran dry and pending sources were flushed.
    pub flush_rounds: AtomicUsize,

    /// Total calls to `Source::fetch`.
    pub fetch_calls: AtomicUsize,

    /// Total keys passed to `Source::fetch`.
    pub keys_fetched: AtomicUsize,
}

impl SchedulerStats {
    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_appended: self.jobs_appended.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            flush_rounds: self.flush_rounds.load(Ordering::Relaxed),
            fetch_calls: self.fetch_calls.load(Ordering::Relaxed),
            keys_fetched: self.keys_fetched.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`SchedulerStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_appended: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub flush_rounds: usize,
    pub fetch_calls: usize,
    pub keys_fetched: usize,
}

/// A queued job plus the bookkeeping its waker needs.
struct Task {
    id: u64,
    kind: JobKind,
    future: Mutex<Option<Job>>,
    scheduled: AtomicBool,
    queue: Weak<JobQueue>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = arc_self.queue.upgrade() {
            queue.schedule(Arc::clone(arc_self));
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<JobQueue>>> = const { RefCell::new(None) };
}

/// Makes a queue current for the duration of one task poll.
struct Enter {
    previous: Option<Arc<JobQueue>>,
}

impl Enter {
    fn new(queue: &Arc<JobQueue>) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(Arc::clone(queue))));
        Self { previous }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// One job queue. The dataloader owns a root queue; each `run_isolated`
/// drives a queue of its own.
pub(crate) struct JobQueue {
    owner: usize,
    ready: Mutex<VecDeque<Arc<Task>>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    failures: Mutex<Vec<JobError>>,
    waker: AtomicWaker,
}

impl JobQueue {
    /// Creates an empty queue for the dataloader identified by `owner`.
    pub(crate) fn new(owner: usize) -> Arc<Self> {
        Arc::new(Self {
            owner,
            ready: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
            waker: AtomicWaker::new(),
        })
    }

    /// Enqueues a job at the back of the ready queue.
    pub(crate) fn push(self: &Arc<Self>, kind: JobKind, job: Job, stats: &SchedulerStats) {
        let task = Arc::new(Task {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            future: Mutex::new(Some(job)),
            scheduled: AtomicBool::new(true),
            queue: Arc::downgrade(self),
        });
        self.live.fetch_add(1, Ordering::AcqRel);
        stats.jobs_appended.fetch_add(1, Ordering::Relaxed);
        self.schedule(task);
    }

    /// The queue of the task being polled on this thread, if it belongs to
    /// the dataloader identified by `owner`.
    pub(crate) fn current(owner: usize) -> Option<Arc<Self>> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .filter(|queue| queue.owner == owner)
                .map(Arc::clone)
        })
    }

    /// Number of jobs appended to this queue that have not finished.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn schedule(&self, task: Arc<Task>) {
        self.ready.lock().push_back(task);
        self.waker.wake();
    }

    fn pop(&self) -> Option<Arc<Task>> {
        self.ready.lock().pop_front()
    }

    /// Drives the queue until every job has finished.
    ///
    /// Returns `Pending` only when nothing is runnable, no source has pending
    /// keys, and some job is still waiting on an outside wakeup.
    pub(crate) fn poll_drain(
        self: &Arc<Self>,
        loader: &Dataloader,
        cx: &mut Context<'_>,
    ) -> Poll<JobResult> {
        self.waker.register(cx.waker());
        let stats = loader.scheduler_stats();

        loop {
            while let Some(task) = self.pop() {
                if let Err(throw) = self.poll_task(&task, stats) {
                    return Poll::Ready(Err(throw));
                }
            }

            let flushes = loader.registry().begin_flushes(loader);
            if !flushes.is_empty() {
                stats.flush_rounds.fetch_add(1, Ordering::Relaxed);
                debug!(sources = flushes.len(), "flushing pending sources");
                for job in flushes {
                    self.push(JobKind::Flush, job, stats);
                }
                continue;
            }

            if self.live() == 0 {
                return Poll::Ready(self.take_failure());
            }

            trace!(live = self.live(), "waiting on suspended jobs");
            return Poll::Pending;
        }
    }

    /// Polls one task. Only a throw is returned as an error; other failures
    /// are recorded and reported once the queue settles.
    fn poll_task(self: &Arc<Self>, task: &Arc<Task>, stats: &SchedulerStats) -> Result<(), JobError> {
        task.scheduled.store(false, Ordering::Release);

        let mut slot = task.future.lock();
        let Some(future) = slot.as_mut() else {
            return Ok(());
        };

        trace!(job = task.id, kind = ?task.kind, "resuming job");
        let waker = waker(Arc::clone(task));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let _enter = Enter::new(self);
            future.as_mut().poll(&mut cx)
        };
        let Poll::Ready(result) = polled else {
            return Ok(());
        };

        *slot = None;
        drop(slot);
        self.live.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(()) => {
                stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) if err.is_throw() => Err(err),
            Err(err) => {
                stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                debug!(job = task.id, error = %err, "job failed");
                self.failures.lock().push(err);
                Ok(())
            }
        }
    }

    fn take_failure(&self) -> JobResult {
        let mut failures = std::mem::take(&mut *self.failures.lock()).into_iter();
        let Some(first) = failures.next() else {
            return Ok(());
        };
        for other in failures {
            warn!(error = %other, "additional job failure");
        }
        Err(first)
    }
}
