use thiserror::Error;

/// Cluster-wide error types for Talos.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Invalid configuration detected at launch.
    #[error("Config error: {0}")]
    Config(String),

    /// Resource provider failed to start.
    #[error("Launch error: {0}")]
    Launch(String),

    /// Provider could not produce a per-job resource, even after repairs.
    #[error("Unable to acquire job resource: {0}")]
    Acquire(String),

    /// The user task exceeded its deadline.
    #[error("Task timed out after {0} ms")]
    Timeout(u64),

    /// The user task returned an error.
    #[error("Task error: {0}")]
    Task(String),

    /// The underlying page/resource crashed while the task was running.
    #[error("Page crashed: {0}")]
    PageCrashed(String),

    /// Releasing a per-job resource failed. Diagnostic only, never a job outcome.
    #[error("Release error: {0}")]
    Release(String),

    /// The job's URL was already dispatched and duplicate skipping is enabled.
    #[error("Duplicate URL skipped: {0}")]
    DuplicateUrl(String),

    /// A job reached a worker with no task function to run.
    #[error("No task function: set one with Cluster::task or queue the job with its own")]
    NoTaskFunction,

    /// The cluster is closed and no longer accepts or completes jobs.
    #[error("Cluster is closed")]
    Closed,
}

impl ClusterError {
    /// Shorthand for wrapping an arbitrary task failure.
    pub fn task(message: impl Into<String>) -> Self {
        ClusterError::Task(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ClusterError::Timeout(30000).to_string(),
            "Task timed out after 30000 ms"
        );
        assert_eq!(
            ClusterError::task("boom").to_string(),
            "Task error: boom"
        );
        assert_eq!(ClusterError::Closed.to_string(), "Cluster is closed");
    }
}
