//! The dispatch loop.
//!
//! One logical dispatcher decides which job runs next; workers execute in
//! parallel. The "single dispatch fiber" is realized as one mutex around all
//! scheduler state: every decision and every bookkeeping mutation happens
//! under it, and it is never held across an await. Provider I/O (worker
//! spawning) and task execution run outside the lock and re-enter through
//! `finish_spawn`/`finish_job`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterStats;
use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::event::{ClusterEvent, ClusterReporter};
use crate::job::{Job, JobPayload};
use crate::pool::WorkerPool;
use crate::provider::{PageOf, ResourceProvider, TaskFn};
use crate::queue::DelayQueue;
use crate::worker::{WorkResult, Worker};

/// Safety-net poll: at least one dispatch attempt this often.
const WORK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Floor between two dispatch passes; bursts of `request_dispatch` calls
/// coalesce onto one pending pass.
const DISPATCH_MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the status line when monitoring is enabled.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) type JobOf<D, P, R> = Job<D, PageOf<D, P>, R>;
pub(crate) type TaskOf<D, P, R> = TaskFn<D, PageOf<D, P>, R>;

/// Everything the dispatcher owns, behind one lock.
pub(crate) struct SchedState<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
{
    pub queue: DelayQueue<JobOf<D, P, R>>,
    pub pool: WorkerPool<D, P::Instance>,
    pub default_task: Option<TaskOf<D, P, R>>,
    pub duplicate_urls: HashSet<String>,
    pub last_domain_access: HashMap<String, Instant>,
    pub all_target_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub idle_waiters: Vec<tokio::sync::oneshot::Sender<()>>,
    pub wait_for_one_waiters: Vec<tokio::sync::oneshot::Sender<D>>,
    pub closed: bool,
}

struct DispatchThrottle {
    scheduled: bool,
    last: Option<Instant>,
}

/// Shared core behind the [`Cluster`](crate::Cluster) facade.
pub(crate) struct Shared<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
{
    pub(crate) config: ClusterConfig,
    pub(crate) provider: Arc<P>,
    pub(crate) reporter: Arc<dyn ClusterReporter<D>>,
    pub(crate) shutdown: CancellationToken,
    state: Mutex<SchedState<D, P, R>>,
    throttle: Mutex<DispatchThrottle>,
}

/// What one dispatch pass decided to do.
enum Dispatch<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
{
    /// Nothing eligible; wait for the next signal.
    Nothing,
    /// A filter consumed the head of the queue; look again.
    Again,
    /// The head job cannot run at all (no task function).
    Fail { job: JobOf<D, P, R> },
    /// Capacity allows a new worker; a slot is already reserved.
    Spawn { worker_id: usize, data: Option<D> },
    /// A job was committed to a worker.
    Run {
        worker: Arc<Worker<D, P::Instance>>,
        job: JobOf<D, P, R>,
        task: TaskOf<D, P, R>,
        more: bool,
    },
}

impl<D, P, R> Shared<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
    R: Send + 'static,
{
    pub(crate) fn new(
        provider: P,
        config: ClusterConfig,
        reporter: Arc<dyn ClusterReporter<D>>,
    ) -> Self {
        let pool = WorkerPool::new(config.max_concurrency, config.worker_creation_delay);
        Self {
            provider: Arc::new(provider),
            reporter,
            shutdown: CancellationToken::new(),
            state: Mutex::new(SchedState {
                queue: DelayQueue::new(),
                pool,
                default_task: None,
                duplicate_urls: HashSet::new(),
                last_domain_access: HashMap::new(),
                all_target_count: 0,
                success_count: 0,
                error_count: 0,
                idle_waiters: Vec::new(),
                wait_for_one_waiters: Vec::new(),
                closed: false,
            }),
            throttle: Mutex::new(DispatchThrottle {
                scheduled: false,
                last: None,
            }),
            config,
        }
    }

    /// Acquires the state lock, recovering from poison if necessary.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedState<D, P, R>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scheduler state");
            poisoned.into_inner()
        })
    }

    fn lock_throttle(&self) -> MutexGuard<'_, DispatchThrottle> {
        self.throttle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned dispatch throttle");
            poisoned.into_inner()
        })
    }

    /// Ask for a dispatch pass. Calls coalesce: while one pass is pending,
    /// further requests are no-ops. The pending flag clears *before* the
    /// pass runs, so a request arriving mid-pass schedules a fresh one and
    /// no signal is ever lost.
    pub(crate) fn request_dispatch(self: Arc<Self>) {
        let next_at = {
            let mut throttle = self.lock_throttle();
            if throttle.scheduled {
                return;
            }
            throttle.scheduled = true;
            throttle.last.map(|last| last + DISPATCH_MIN_INTERVAL)
        };

        tokio::spawn(async move {
            if let Some(at) = next_at {
                tokio::time::sleep_until(at.into()).await;
            }
            {
                let mut throttle = self.lock_throttle();
                throttle.scheduled = false;
                throttle.last = Some(Instant::now());
            }
            self.dispatch().await;
        });
    }

    /// One pass of the decide-and-hand-off procedure.
    pub(crate) async fn dispatch(self: Arc<Self>) {
        match self.plan() {
            Dispatch::Nothing => {}
            Dispatch::Again => self.request_dispatch(),
            Dispatch::Fail { job } => {
                self.finish_job(
                    None,
                    job,
                    WorkResult::Error(ClusterError::NoTaskFunction),
                    false,
                );
                self.request_dispatch();
            }
            Dispatch::Spawn { worker_id, data } => {
                self.spawn_worker(worker_id, data).await;
                self.request_dispatch();
            }
            Dispatch::Run {
                worker,
                job,
                task,
                more,
            } => {
                // Let parallel workers drain the queue while this one runs.
                if more {
                    Arc::clone(&self).request_dispatch();
                }
                tokio::spawn(async move {
                    let data = job.data.clone();
                    let result = worker.handle(task, data, self.config.timeout).await;
                    self.finish_job(Some(&worker), job, result, true);
                    self.request_dispatch();
                });
            }
        }
    }

    /// The decision half of a dispatch pass, entirely under the state lock:
    /// admission filters, capacity checks, and the commit of one job to one
    /// worker.
    fn plan(&self) -> Dispatch<D, P, R> {
        let mut guard = self.lock_state();
        let st = &mut *guard;

        if st.closed {
            return Dispatch::Nothing;
        }

        if st.queue.is_empty() {
            if st.pool.busy_count() == 0 {
                for tx in st.idle_waiters.drain(..) {
                    let _ = tx.send(());
                }
            }
            return Dispatch::Nothing;
        }

        let Some(next) = st.queue.peek() else {
            // Entries exist but all are cooling down; the poll timer retries.
            return Dispatch::Nothing;
        };
        let data = next.data.clone();

        if self.config.skip_duplicate_urls {
            if let Some(url) = data.url() {
                if st.duplicate_urls.contains(&url) {
                    let Some(mut job) = st.queue.pop_ready() else {
                        return Dispatch::Nothing;
                    };
                    tracing::debug!(%url, "Skipping duplicate URL");
                    if let Some(tx) = job.callbacks.take() {
                        // An execute caller must still be settled exactly once.
                        st.error_count += 1;
                        let _ = tx.send(Err(ClusterError::DuplicateUrl(url)));
                    }
                    return Dispatch::Again;
                }
            }
        }

        if !self.config.same_domain_delay.is_zero() {
            if let Some(domain) = data.domain() {
                if let Some(&last) = st.last_domain_access.get(&domain) {
                    let until = last + self.config.same_domain_delay;
                    if until > Instant::now() {
                        let Some(job) = st.queue.pop_ready() else {
                            return Dispatch::Nothing;
                        };
                        tracing::debug!(%domain, "Domain cooling down, delaying job");
                        st.queue.push(job, Some(until));
                        return Dispatch::Again;
                    }
                }
            }
        }

        if !st.pool.any_can_handle(&data) {
            if st.pool.can_launch() {
                let worker_id = st.pool.reserve_slot();
                return Dispatch::Spawn {
                    worker_id,
                    data: Some(data),
                };
            }
            return Dispatch::Nothing;
        }

        let Some(worker) = st.pool.get_worker(&data) else {
            return Dispatch::Nothing;
        };
        let Some(mut job) = st.queue.pop_ready() else {
            return Dispatch::Nothing;
        };

        // The job is committed: record its admission marks now, not after
        // the task ran, so concurrent dispatches see them.
        if self.config.skip_duplicate_urls {
            if let Some(url) = job.data.url() {
                st.duplicate_urls.insert(url);
            }
        }
        if !self.config.same_domain_delay.is_zero() {
            if let Some(domain) = job.data.domain() {
                st.last_domain_access.insert(domain, Instant::now());
            }
        }

        let more = st
            .pool
            .has_free_capacity(st.queue.peek().map(|next| &next.data));

        let Some(task) = job.task.clone().or_else(|| st.default_task.clone()) else {
            tracing::error!(job_id = %job.id, "Job has no task function and no cluster default is set");
            return Dispatch::Fail { job };
        };

        job.tries += 1;
        worker.begin_job();
        tracing::debug!(
            job_id = %job.id,
            worker_id = worker.id(),
            tries = job.tries,
            queued_ms = (Utc::now() - job.created_at).num_milliseconds(),
            "Dispatching job"
        );
        Dispatch::Run {
            worker,
            job,
            task,
            more,
        }
    }

    /// Complete a reserved spawn with a provider call, outside the lock.
    async fn spawn_worker(&self, worker_id: usize, data: Option<D>) {
        let result = self.provider.worker_instance(data.as_ref()).await;
        let mut st = self.lock_state();
        match result {
            Ok(instance) => {
                tracing::debug!(%worker_id, "Worker launched");
                st.pool.finish_spawn(Some(Worker::new(worker_id, instance)));
            }
            Err(e) => {
                tracing::error!(%worker_id, error = %e, "Failed to launch worker");
                st.pool.finish_spawn(None);
            }
        }
    }

    /// Classify an attempt outcome: settle callbacks, notify reporters,
    /// and requeue retryable failures.
    ///
    /// For a failed fire-and-forget job the worker stays marked busy until
    /// the retry is back on the queue, so an interleaved dispatch can never
    /// observe "queue empty, nobody busy" and resolve `idle()` early.
    pub(crate) fn finish_job(
        &self,
        worker: Option<&Arc<Worker<D, P::Instance>>>,
        mut job: JobOf<D, P, R>,
        result: WorkResult<R>,
        allow_retry: bool,
    ) {
        let (err, will_retry) = {
            let mut st = self.lock_state();
            for tx in st.wait_for_one_waiters.drain(..) {
                let _ = tx.send(job.data.clone());
            }
            match result {
                WorkResult::Success(value) => {
                    st.success_count += 1;
                    if let Some(w) = worker {
                        w.end_job();
                    }
                    if let Some(tx) = job.callbacks.take() {
                        let _ = tx.send(Ok(value));
                    }
                    return;
                }
                WorkResult::Error(err) => {
                    if let Some(tx) = job.callbacks.take() {
                        // execute jobs surface every terminal error, once,
                        // and are never retried.
                        st.error_count += 1;
                        if let Some(w) = worker {
                            w.end_job();
                        }
                        let _ = tx.send(Err(err));
                        return;
                    }
                    let will_retry =
                        allow_retry && !st.closed && job.tries <= self.config.retry_limit;
                    if !will_retry {
                        st.error_count += 1;
                        tracing::debug!(
                            job_id = %job.id,
                            tries = job.tries,
                            earlier_errors = job.errors.len(),
                            "Job failed terminally"
                        );
                    }
                    (err, will_retry)
                }
            }
        };

        // Report outside the lock; reporters are arbitrary user code.
        self.reporter.report(ClusterEvent::TaskError {
            error: &err,
            data: &job.data,
            will_retry,
        });

        let mut st = self.lock_state();
        if will_retry && !st.closed {
            job.errors.push(err);
            let delay = (!self.config.retry_delay.is_zero())
                .then(|| Instant::now() + self.config.retry_delay);
            st.queue.push(job, delay);
        } else if will_retry {
            // Closed while reporting; the retry is abandoned as terminal.
            st.error_count += 1;
        }
        if let Some(w) = worker {
            w.end_job();
        }
    }

    /// Retire workers that sat idle past their provider-declared TTL.
    fn evict_idle_workers(&self) {
        let evicted = {
            let mut st = self.lock_state();
            st.pool.evict_idle()
        };
        for worker in evicted {
            tracing::debug!(worker_id = worker.id(), "Retiring idle worker");
            tokio::spawn(async move {
                if let Err(e) = worker.close().await {
                    tracing::warn!(worker_id = worker.id(), error = %e, "Failed to close idle worker");
                }
            });
        }
    }

    /// Run the safety-net poll until shutdown.
    pub(crate) fn spawn_poll_timer(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WORK_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.evict_idle_workers();
                        Arc::clone(&self).request_dispatch();
                    }
                    () = self.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Periodic status line, enabled via `ClusterConfig::monitor`.
    pub(crate) fn spawn_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let stats = self.stats();
                        tracing::info!(
                            queued = stats.queued,
                            busy = stats.busy_workers,
                            idle = stats.idle_workers,
                            starting = stats.starting_workers,
                            targets = stats.all_targets,
                            successes = stats.successes,
                            errors = stats.errors,
                            "Cluster status"
                        );
                    }
                    () = self.shutdown.cancelled() => break,
                }
            }
        });
    }

    pub(crate) fn stats(&self) -> ClusterStats {
        let st = self.lock_state();
        let busy = st.pool.busy_count();
        ClusterStats {
            queued: st.queue.len(),
            busy_workers: busy,
            idle_workers: st.pool.worker_count().saturating_sub(busy),
            starting_workers: st.pool.starting(),
            all_targets: st.all_target_count,
            successes: st.success_count,
            errors: st.error_count,
        }
    }
}
