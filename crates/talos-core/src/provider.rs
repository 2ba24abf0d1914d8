//! The seam between the cluster core and the browser-like resource it drives.
//!
//! A [`ResourceProvider`] owns the expensive underlying resource (typically a
//! headless browser process, or several). It hands out one [`WorkerInstance`]
//! per spawned worker, and each worker acquires a short-lived [`JobInstance`]
//! per job. The core only ever talks to these traits; the concrete Chromium
//! strategies live in the client crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClusterError;

/// Produces per-worker resources and manages global bring-up/teardown.
///
/// Implementations must be safe under concurrent `worker_instance` calls and
/// under concurrent use of the instances they hand out.
pub trait ResourceProvider<D>: Send + Sync + 'static {
    type Instance: WorkerInstance<D>;

    /// One-time bring-up (launch the underlying process, etc.).
    fn init(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Produce a fresh per-worker resource. Called once per spawned worker.
    ///
    /// `data` is the payload of the job that triggered the spawn, when there
    /// is one; group-affine providers tag the instance with its group key.
    fn worker_instance(
        &self,
        data: Option<&D>,
    ) -> impl Future<Output = Result<Self::Instance, ClusterError>> + Send;

    /// Global shutdown.
    fn close(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

/// The long-lived resource a single worker owns.
pub trait WorkerInstance<D>: Send + Sync + 'static {
    type Job: JobInstance;

    /// Acquire a per-job resource. Called once per job attempt.
    fn job_instance(
        &self,
        data: &D,
    ) -> impl Future<Output = Result<Self::Job, ClusterError>> + Send;

    /// Restore the instance to a usable state after an error. May tear down
    /// and recreate the underlying process.
    fn repair(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Tear down this worker's resource.
    fn close(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Routing predicate. `None` keeps the default: the worker is exclusive
    /// while it holds any active job. `Some(_)` hands routing to the
    /// provider entirely (multiplexing workers, group affinity).
    fn can_handle(&self, data: &D) -> Option<bool> {
        let _ = data;
        None
    }

    /// How long this worker may sit idle before the pool retires it.
    /// `None` means it lives until the cluster closes.
    fn idle_ttl(&self) -> Option<Duration> {
        None
    }
}

/// The short-lived resource backing one job attempt.
pub trait JobInstance: Send + Sync {
    /// Handle passed to the user task. Cheap to clone (page handles are
    /// reference-counted in practice).
    type Page: Clone + Send + Sync + 'static;

    fn page(&self) -> Self::Page;

    /// Asynchronous error observed while the task ran (page crash, target
    /// detach). Checked once after the task completes.
    fn take_async_error(&self) -> Option<ClusterError> {
        None
    }

    /// Release the per-job resource.
    fn close(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

/// Everything a task gets to see: the page handle, its payload, and the id
/// of the worker running it.
pub struct TaskContext<D, Pg> {
    pub page: Pg,
    pub data: D,
    pub worker_id: usize,
}

/// Boxed future returned by task functions.
pub type TaskFuture<R> = Pin<Box<dyn Future<Output = Result<R, ClusterError>> + Send>>;

/// A user task: runs against one [`TaskContext`], yields the job's result.
pub type TaskFn<D, Pg, R> = Arc<dyn Fn(TaskContext<D, Pg>) -> TaskFuture<R> + Send + Sync>;

/// Page handle type produced by a provider, two associated types deep.
pub type PageOf<D, P> =
    <<<P as ResourceProvider<D>>::Instance as WorkerInstance<D>>::Job as JobInstance>::Page;

/// Wrap an async closure into a [`TaskFn`] without spelling out the boxing.
pub fn task_fn<D, Pg, R, F, Fut>(f: F) -> TaskFn<D, Pg, R>
where
    F: Fn(TaskContext<D, Pg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ClusterError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}
