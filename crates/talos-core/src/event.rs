use crate::error::ClusterError;

/// Events emitted by the cluster for monitoring/logging.
#[derive(Debug)]
pub enum ClusterEvent<'a, D> {
    /// A job was accepted onto the queue.
    Queued { data: &'a D },

    /// A job attempt failed. `will_retry` is true when the job goes back on
    /// the queue instead of terminating.
    TaskError {
        error: &'a ClusterError,
        data: &'a D,
        will_retry: bool,
    },
}

/// Trait for receiving cluster events (decoupled logging).
///
/// Implementations must not call back into the cluster that reported the
/// event; report the fact and return.
pub trait ClusterReporter<D>: Send + Sync {
    fn report(&self, event: ClusterEvent<'_, D>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl<D> ClusterReporter<D> for TracingReporter {
    fn report(&self, event: ClusterEvent<'_, D>) {
        match event {
            ClusterEvent::Queued { .. } => {
                tracing::debug!("Job queued");
            }
            ClusterEvent::TaskError {
                error, will_retry, ..
            } => {
                tracing::warn!(%error, %will_retry, "Job attempt failed");
            }
        }
    }
}
