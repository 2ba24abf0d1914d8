use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ClusterError;
use crate::provider::{JobInstance, TaskContext, TaskFn, WorkerInstance};

/// Attempts to acquire a per-job resource before the attempt is abandoned.
/// Each failed acquire triggers a provider repair.
const JOB_INSTANCE_TRIES: u32 = 10;

/// Outcome of one job attempt. `handle` never propagates an error upward;
/// failures are data, classified by the scheduler.
pub(crate) enum WorkResult<R> {
    Success(R),
    Error(ClusterError),
}

/// A logical executor bound to one long-lived provider resource.
///
/// Active-job accounting is driven by the scheduler under its state lock
/// (`begin_job` at assignment, `end_job` at result processing), so capacity
/// and idleness checks never observe a half-committed job.
pub(crate) struct Worker<D, I: WorkerInstance<D>> {
    id: usize,
    instance: I,
    active: AtomicUsize,
    last_done: Mutex<Instant>,
    _payload: PhantomData<fn(D) -> D>,
}

impl<D, I> Worker<D, I>
where
    D: Clone + Send + Sync + 'static,
    I: WorkerInstance<D>,
{
    pub fn new(id: usize, instance: I) -> Self {
        Self {
            id,
            instance,
            active: AtomicUsize::new(0),
            last_done: Mutex::new(Instant::now()),
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn begin_job(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_job(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut last = self
            .last_done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    /// True once the worker has sat idle past its provider-declared TTL.
    pub fn idle_expired(&self) -> bool {
        let Some(ttl) = self.instance.idle_ttl() else {
            return false;
        };
        if self.active_jobs() > 0 {
            return false;
        }
        let last = self
            .last_done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.elapsed() >= ttl
    }

    /// Routing predicate: delegate to the provider when it has an opinion,
    /// otherwise the worker is exclusive while busy.
    pub fn can_handle(&self, data: &D) -> bool {
        self.instance
            .can_handle(data)
            .unwrap_or_else(|| self.active_jobs() == 0)
    }

    pub async fn close(&self) -> Result<(), ClusterError> {
        self.instance.close().await
    }

    /// Run one job attempt: acquire a job resource (repairing on failure),
    /// run the task under its deadline, release, and report the outcome.
    pub async fn handle<R>(
        &self,
        task: TaskFn<D, <I::Job as JobInstance>::Page, R>,
        data: D,
        timeout: Duration,
    ) -> WorkResult<R>
    where
        R: Send + 'static,
    {
        let job_instance = match self.acquire(&data).await {
            Ok(instance) => instance,
            Err(e) => return WorkResult::Error(e),
        };

        let ctx = TaskContext {
            page: job_instance.page(),
            data,
            worker_id: self.id,
        };

        let result = match tokio::time::timeout(timeout, task(ctx)).await {
            Err(_elapsed) => Err(ClusterError::Timeout(timeout.as_millis() as u64)),
            Ok(Err(e)) => Err(e),
            // The task finished cleanly, but the page may have crashed under
            // it; an asynchronous error trumps the return value.
            Ok(Ok(value)) => match job_instance.take_async_error() {
                Some(e) => Err(e),
                None => Ok(value),
            },
        };

        self.release(job_instance).await;

        match result {
            Ok(value) => WorkResult::Success(value),
            Err(e) => WorkResult::Error(e),
        }
    }

    async fn acquire(&self, data: &D) -> Result<I::Job, ClusterError> {
        for attempt in 1..=JOB_INSTANCE_TRIES {
            match self.instance.job_instance(data).await {
                Ok(instance) => return Ok(instance),
                Err(e) => {
                    tracing::warn!(
                        worker_id = self.id,
                        %attempt,
                        error = %e,
                        "Failed to acquire job resource, repairing"
                    );
                    if let Err(e) = self.instance.repair().await {
                        tracing::warn!(worker_id = self.id, error = %e, "Worker repair failed");
                    }
                }
            }
        }
        Err(ClusterError::Acquire(format!(
            "gave up after {JOB_INSTANCE_TRIES} attempts"
        )))
    }

    /// Release failures are diagnostic, never a job outcome: log, repair,
    /// move on.
    async fn release(&self, job_instance: I::Job) {
        if let Err(e) = job_instance.close().await {
            tracing::warn!(worker_id = self.id, error = %e, "Failed to release job resource");
            if let Err(e) = self.instance.repair().await {
                tracing::warn!(worker_id = self.id, error = %e, "Repair after release failure failed");
            }
        }
    }
}
