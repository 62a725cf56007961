//! Worker pool that runs check tasks concurrently
//!
//! All tasks are queued up front. A fixed number of workers pop tasks until
//! the queue is empty or the pool is cancelled. Cancellation is two-phase:
//! workers see the flag and stop after their in-flight probe, and whatever
//! is still running when the grace period ends gets aborted.

use crate::error::{Error, Result};
use crate::proxy::checker::Prober;
use crate::proxy::models::{CheckTask, FailureReason, ProbeOutcome, Protocol};
use crate::proxy::status::StatusSnapshot;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Default time live workers get to finish after a cancel
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Configuration for the checker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// How long to wait for workers after a cancel before aborting them
    pub grace_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// One less than the number of CPUs, at least one.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// The queue was drained.
    Completed,
    /// The run was interrupted. Results are partial.
    Cancelled,
    /// A protocol turned out to be unusable in this environment. Tasks for
    /// it were not run, so its proxies are unchecked rather than down.
    Failed,
}

/// Progress pushed after every finished task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
}

/// Final result of a run
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub status: PoolStatus,
    /// Successful outcomes, in completion order
    pub successes: Vec<ProbeOutcome>,
    /// Tasks that were probed to completion
    pub completed: usize,
    pub total: usize,
    /// Tasks dropped because their protocol is unsupported
    pub skipped: usize,
    /// Tasks still queued when the run stopped
    pub remaining: usize,
    /// Protocols found to be unsupported during the run
    pub unsupported: Vec<Protocol>,
}

type ProgressFn = dyn Fn(Progress) + Send + Sync;

/// State shared between the workers, the pool and its handles
struct PoolState {
    queue: Mutex<VecDeque<CheckTask>>,
    total: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    successes: Mutex<Vec<ProbeOutcome>>,
    unsupported: Mutex<BTreeSet<Protocol>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A worker that panicked mid-update can only have left a complete push
    // behind, so the data is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolState {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            successes: Mutex::new(Vec::new()),
            unsupported: Mutex::new(BTreeSet::new()),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    fn load(&self, tasks: Vec<CheckTask>) {
        self.total.store(tasks.len(), Ordering::SeqCst);
        lock(&self.queue).extend(tasks);
    }

    fn pop(&self) -> Option<CheckTask> {
        lock(&self.queue).pop_front()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_unsupported(&self, protocol: Protocol) -> bool {
        lock(&self.unsupported).contains(&protocol)
    }

    /// Record a finished probe. The success list and the completed counter
    /// change under the same lock so snapshots never see one without the
    /// other.
    fn record(&self, outcome: ProbeOutcome) -> Progress {
        if outcome.failure_reason() == Some(FailureReason::ProtocolUnsupported)
            && lock(&self.unsupported).insert(outcome.protocol())
        {
            error!(
                protocol = %outcome.protocol(),
                "protocol unsupported, skipping its remaining tasks"
            );
        }

        let mut successes = lock(&self.successes);
        if outcome.is_success() {
            successes.push(outcome);
        }
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        Progress {
            completed,
            total: self.total.load(Ordering::SeqCst),
            succeeded: successes.len(),
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let successes = lock(&self.successes);
        StatusSnapshot::new(
            self.completed.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
            &successes,
        )
    }
}

/// Cloneable handle to observe or cancel a pool from elsewhere
#[derive(Clone)]
pub struct PoolHandle {
    state: Arc<PoolState>,
}

impl PoolHandle {
    /// Ask the pool to stop.
    ///
    /// Workers finish their in-flight probe and exit. Workers still running
    /// after the grace period are aborted. The run then returns its partial
    /// results with [`PoolStatus::Cancelled`].
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            warn!("cancelling proxy check");
            self.state.cancel_notify.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }

    /// Consistent view of progress and working counts.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.snapshot()
    }
}

/// Runs check tasks on a fixed number of concurrent workers
pub struct CheckerPool {
    prober: Arc<dyn Prober>,
    config: PoolConfig,
    state: Arc<PoolState>,
}

impl CheckerPool {
    pub fn new(prober: Arc<dyn Prober>, config: PoolConfig) -> Self {
        Self {
            prober,
            config,
            state: Arc::new(PoolState::new()),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run every task once and return what worked.
    pub async fn run(self, tasks: Vec<CheckTask>) -> Result<PoolReport> {
        self.run_with_progress(tasks, |_| {}).await
    }

    /// Like [`CheckerPool::run`], calling `on_progress` after each probe.
    ///
    /// `on_progress` is called from the workers and must not block.
    pub async fn run_with_progress<F>(self, tasks: Vec<CheckTask>, on_progress: F) -> Result<PoolReport>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        if self.config.concurrency < 1 {
            return Err(Error::InvalidConcurrency(self.config.concurrency));
        }
        if tasks.is_empty() {
            return Err(Error::NoTasks);
        }

        let workers_count = self.config.concurrency.min(tasks.len());
        let endpoints = tasks
            .iter()
            .map(|t| t.endpoint.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        info!(
            "Checking {} proxies ({} jobs) on {} workers",
            endpoints,
            tasks.len(),
            workers_count
        );
        self.state.load(tasks);

        let on_progress: Arc<ProgressFn> = Arc::new(on_progress);
        let mut workers: Vec<_> = (0..workers_count)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.state),
                    Arc::clone(&self.prober),
                    Arc::clone(&on_progress),
                ))
            })
            .collect();
        let abort_handles: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        let all_done = futures::future::join_all(workers.iter_mut());
        tokio::pin!(all_done);

        tokio::select! {
            _ = &mut all_done => {}
            _ = self.state.cancel_notify.notified() => {
                let grace = self.config.grace_period;
                if tokio::time::timeout(grace, &mut all_done).await.is_err() {
                    let alive = abort_handles.iter().filter(|h| !h.is_finished()).count();
                    warn!(alive, grace_ms = grace.as_millis() as u64, "workers did not stop in time, aborting");
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    all_done.await;
                }
            }
        }
        info!("All workers exited");

        Ok(self.into_report())
    }

    fn into_report(self) -> PoolReport {
        let state = &self.state;
        let unsupported: Vec<Protocol> = lock(&state.unsupported).iter().copied().collect();
        let status = if !unsupported.is_empty() {
            PoolStatus::Failed
        } else if state.is_cancelled() {
            PoolStatus::Cancelled
        } else {
            PoolStatus::Completed
        };

        PoolReport {
            status,
            successes: lock(&state.successes).clone(),
            completed: state.completed.load(Ordering::SeqCst),
            total: state.total.load(Ordering::SeqCst),
            skipped: state.skipped.load(Ordering::SeqCst),
            remaining: lock(&state.queue).len(),
            unsupported,
        }
    }
}

async fn worker(
    id: usize,
    state: Arc<PoolState>,
    prober: Arc<dyn Prober>,
    on_progress: Arc<ProgressFn>,
) {
    loop {
        if state.is_cancelled() {
            debug!(worker = id, "terminating worker although queue is not empty yet");
            break;
        }
        let Some(task) = state.pop() else {
            break;
        };
        if state.is_unsupported(task.protocol) {
            state.skipped.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        debug!(worker = id, proxy = %task, "checking");
        let outcome = prober.probe(&task).await;
        if let ProbeOutcome::Success {
            endpoint,
            protocol,
            latency,
            exit_country,
            ..
        } = &outcome
        {
            info!(
                %endpoint,
                %protocol,
                %exit_country,
                latency_ms = latency.as_millis() as u64,
                "Working proxy"
            );
        }
        let progress = state.record(outcome);
        on_progress(progress);
    }
}
