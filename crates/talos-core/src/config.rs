use std::time::Duration;

use crate::error::ClusterError;

/// Configuration for a [`Cluster`](crate::Cluster).
///
/// The concrete resource provider (and with it the concurrency strategy) is
/// chosen separately and handed to `Cluster::launch`; everything here concerns
/// scheduling only.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Hard cap on live plus starting workers.
    pub max_concurrency: usize,

    /// Minimum delay between two worker spawns.
    pub worker_creation_delay: Duration,

    /// Deadline for a single task attempt. Provider acquire/release time
    /// does not count against it.
    pub timeout: Duration,

    /// Maximum retries for a fire-and-forget job. Jobs submitted via
    /// `execute` are never retried.
    pub retry_limit: u32,

    /// Delay before a failed job becomes eligible again.
    pub retry_delay: Duration,

    /// Dispatch each URL at most once.
    pub skip_duplicate_urls: bool,

    /// Minimum delay between dispatches sharing a domain.
    pub same_domain_delay: Duration,

    /// Log a periodic status line while the cluster runs.
    pub monitor: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            worker_creation_delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
            retry_limit: 0,
            retry_delay: Duration::ZERO,
            skip_duplicate_urls: false,
            same_domain_delay: Duration::ZERO,
            monitor: false,
        }
    }
}

impl ClusterConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_worker_creation_delay(mut self, delay: Duration) -> Self {
        self.worker_creation_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, limit: u32, delay: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_delay = delay;
        self
    }

    pub fn with_skip_duplicate_urls(mut self, skip: bool) -> Self {
        self.skip_duplicate_urls = skip;
        self
    }

    pub fn with_same_domain_delay(mut self, delay: Duration) -> Self {
        self.same_domain_delay = delay;
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    /// Reject configurations that can never schedule work.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.max_concurrency == 0 {
            return Err(ClusterError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ClusterError::Config("timeout must be non-zero".into()));
        }
        Ok(())
    }
}
