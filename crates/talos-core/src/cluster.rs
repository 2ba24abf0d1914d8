use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::event::{ClusterEvent, ClusterReporter, TracingReporter};
use crate::job::{Job, JobPayload};
use crate::provider::{PageOf, ResourceProvider, TaskFn};
use crate::scheduler::Shared;

/// How often `close` re-checks for still-running jobs.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Point-in-time counters for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterStats {
    pub queued: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub starting_workers: usize,
    pub all_targets: u64,
    pub successes: u64,
    pub errors: u64,
}

/// A job cluster: a bounded pool of workers, each bound to an expensive
/// provider resource, draining an in-memory delay-aware queue.
///
/// `D` is the opaque job payload, `P` the resource provider, `R` the result
/// type produced by task functions. Cheap to clone; all clones share one
/// scheduler.
///
/// ```ignore
/// let config = ClusterConfig::default()
///     .with_max_concurrency(2)
///     .with_timeout(Duration::from_secs(10));
/// let cluster = Cluster::<String, _, usize>::launch(provider, config).await?;
///
/// cluster.task(task_fn(|ctx: TaskContext<String, Page>| async move {
///     ctx.page.goto(&ctx.data).await?;
///     Ok(ctx.page.content().await?.len())
/// }));
///
/// let len = cluster.execute("https://example.com".to_string()).await?;
/// cluster.idle().await;
/// cluster.close().await;
/// ```
pub struct Cluster<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
    R: Send + 'static,
{
    shared: Arc<Shared<D, P, R>>,
}

impl<D, P, R> Clone for Cluster<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D, P, R> Cluster<D, P, R>
where
    D: JobPayload,
    P: ResourceProvider<D>,
    R: Send + 'static,
{
    /// Validate the config, bring up the provider, and start scheduling.
    pub async fn launch(provider: P, config: ClusterConfig) -> Result<Self, ClusterError> {
        Self::launch_with_reporter(provider, config, Arc::new(TracingReporter)).await
    }

    /// Like [`launch`](Cluster::launch), with a custom event reporter.
    pub async fn launch_with_reporter(
        provider: P,
        config: ClusterConfig,
        reporter: Arc<dyn ClusterReporter<D>>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        provider.init().await?;

        let monitor = config.monitor;
        let shared = Arc::new(Shared::new(provider, config, reporter));
        Arc::clone(&shared).spawn_poll_timer();
        if monitor {
            Arc::clone(&shared).spawn_monitor();
        }
        Ok(Self { shared })
    }

    /// Set the cluster-default task. Jobs queued without their own task use
    /// whichever default is set when they are dispatched.
    pub fn task(&self, task: TaskFn<D, PageOf<D, P>, R>) {
        let mut st = self.shared.lock_state();
        st.default_task = Some(task);
    }

    /// Fire-and-forget enqueue. Failures surface through the reporter and
    /// are retried up to the configured limit.
    pub fn queue(&self, data: D) -> Result<(), ClusterError> {
        self.enqueue(data, None, None)
    }

    /// Fire-and-forget enqueue with a per-job task.
    pub fn queue_with_task(
        &self,
        data: D,
        task: TaskFn<D, PageOf<D, P>, R>,
    ) -> Result<(), ClusterError> {
        self.enqueue(data, Some(task), None)
    }

    /// Enqueue and await the job's result. Settled exactly once; never
    /// retried.
    pub async fn execute(&self, data: D) -> Result<R, ClusterError> {
        self.execute_inner(data, None).await
    }

    /// [`execute`](Cluster::execute) with a per-job task.
    pub async fn execute_with_task(
        &self,
        data: D,
        task: TaskFn<D, PageOf<D, P>, R>,
    ) -> Result<R, ClusterError> {
        self.execute_inner(data, Some(task)).await
    }

    async fn execute_inner(
        &self,
        data: D,
        task: Option<TaskFn<D, PageOf<D, P>, R>>,
    ) -> Result<R, ClusterError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(data, task, Some(tx))?;
        match rx.await {
            Ok(result) => result,
            // Sender dropped without settling: the cluster shut down under us.
            Err(_) => Err(ClusterError::Closed),
        }
    }

    fn enqueue(
        &self,
        data: D,
        task: Option<TaskFn<D, PageOf<D, P>, R>>,
        callbacks: Option<oneshot::Sender<Result<R, ClusterError>>>,
    ) -> Result<(), ClusterError> {
        {
            let mut st = self.shared.lock_state();
            if st.closed {
                return Err(ClusterError::Closed);
            }
            st.all_target_count += 1;
            st.queue.push(Job::new(data.clone(), task, callbacks), None);
        }
        self.shared.reporter.report(ClusterEvent::Queued { data: &data });
        Arc::clone(&self.shared).request_dispatch();
        Ok(())
    }

    /// Resolves once the queue is empty and no worker is busy. Resolves
    /// immediately on an already-idle (or closed) cluster.
    pub async fn idle(&self) {
        let rx = {
            let mut st = self.shared.lock_state();
            if st.closed || (st.queue.is_empty() && st.pool.busy_count() == 0) {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.idle_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Resolves with the payload of the next job to complete (success or
    /// error), or `None` if the cluster closes first.
    pub async fn wait_for_one(&self) -> Option<D> {
        let rx = {
            let mut st = self.shared.lock_state();
            if st.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            st.wait_for_one_waiters.push(tx);
            rx
        };
        rx.await.ok()
    }

    pub fn stats(&self) -> ClusterStats {
        self.shared.stats()
    }

    /// Stop scheduling, wait for active jobs, tear down workers and the
    /// provider, and release idle waiters. Jobs still queued are dropped;
    /// queued `execute` callers are rejected with [`ClusterError::Closed`].
    /// Idempotent: a second call returns immediately.
    pub async fn close(&self) {
        {
            let mut st = self.shared.lock_state();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.shared.shutdown.cancel();

        // Nothing queued will be dispatched anymore; settle execute callers
        // now rather than leaving their futures dangling.
        {
            let mut st = self.shared.lock_state();
            for mut job in st.queue.drain() {
                if let Some(tx) = job.callbacks.take() {
                    st.error_count += 1;
                    let _ = tx.send(Err(ClusterError::Closed));
                }
            }
        }

        // close() waits for active jobs; it does not interrupt them.
        loop {
            let (busy, starting) = {
                let st = self.shared.lock_state();
                (st.pool.busy_count(), st.pool.starting())
            };
            if busy == 0 && starting == 0 {
                break;
            }
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }

        let workers = {
            let mut st = self.shared.lock_state();
            st.pool.take_workers()
        };
        for worker in workers {
            if let Err(e) = worker.close().await {
                tracing::warn!(worker_id = worker.id(), error = %e, "Failed to close worker");
            }
        }

        if let Err(e) = self.shared.provider.close().await {
            tracing::warn!(error = %e, "Failed to close resource provider");
        }

        let idle_waiters = {
            let mut st = self.shared.lock_state();
            st.wait_for_one_waiters.clear();
            std::mem::take(&mut st.idle_waiters)
        };
        for tx in idle_waiters {
            let _ = tx.send(());
        }

        tracing::debug!("Cluster closed");
    }
}
