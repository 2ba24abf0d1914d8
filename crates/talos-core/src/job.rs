use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use url::Url;
use uuid::Uuid;

use crate::error::ClusterError;
use crate::provider::TaskFn;

/// Payload carried by a job.
///
/// The cluster never inspects the payload beyond the optional extractors
/// below: `url` feeds duplicate suppression and the per-domain cooldown,
/// `group` feeds browser-per-group routing. Both default to "not present",
/// which opts the payload out of those features.
pub trait JobPayload: Clone + Send + Sync + 'static {
    /// URL associated with this payload, if any.
    fn url(&self) -> Option<String> {
        None
    }

    /// Affinity key for the browser-per-group strategy, if any.
    fn group(&self) -> Option<String> {
        None
    }

    /// Host portion of [`url`](JobPayload::url), if parseable.
    fn domain(&self) -> Option<String> {
        self.url().as_deref().and_then(domain_of)
    }
}

/// Extract the host from a URL string.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}

/// A bare string payload is treated as the target URL itself.
impl JobPayload for String {
    fn url(&self) -> Option<String> {
        Some(self.clone())
    }
}

/// Schemaless payloads: `"url"` and `"group"` string members are duck-typed.
impl JobPayload for serde_json::Value {
    fn url(&self) -> Option<String> {
        self.get("url").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn group(&self) -> Option<String> {
        self.get("group")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

impl JobPayload for () {}

/// Settlement channel for a job submitted via `execute`.
pub(crate) type JobCallbacks<R> = oneshot::Sender<Result<R, ClusterError>>;

/// A unit of work queued on the cluster.
///
/// `callbacks` is present iff the job was submitted via `execute`; such jobs
/// settle their caller exactly once and are never retried. Fire-and-forget
/// jobs accumulate their attempt errors in `errors` instead.
pub(crate) struct Job<D, Pg, R> {
    pub id: Uuid,
    pub data: D,
    pub task: Option<TaskFn<D, Pg, R>>,
    pub callbacks: Option<JobCallbacks<R>>,
    pub tries: u32,
    pub errors: Vec<ClusterError>,
    pub created_at: DateTime<Utc>,
}

impl<D, Pg, R> Job<D, Pg, R> {
    pub fn new(data: D, task: Option<TaskFn<D, Pg, R>>, callbacks: Option<JobCallbacks<R>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            task,
            callbacks,
            tries: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_payload_is_its_own_url() {
        let data = "https://example.com/page".to_string();
        assert_eq!(data.url().as_deref(), Some("https://example.com/page"));
        assert_eq!(data.domain().as_deref(), Some("example.com"));
        assert_eq!(data.group(), None);
    }

    #[test]
    fn test_json_payload_duck_typing() {
        let data = json!({"url": "https://a.com/x", "group": "tenant-1", "depth": 3});
        assert_eq!(data.url().as_deref(), Some("https://a.com/x"));
        assert_eq!(data.domain().as_deref(), Some("a.com"));
        assert_eq!(data.group().as_deref(), Some("tenant-1"));

        let bare = json!({"depth": 3});
        assert_eq!(bare.url(), None);
        assert_eq!(bare.domain(), None);
    }

    #[test]
    fn test_domain_of_invalid_url() {
        assert_eq!(domain_of("not a url"), None);
        assert_eq!(domain_of(""), None);
    }

    #[test]
    fn test_domain_of_ignores_port_and_path() {
        assert_eq!(
            domain_of("http://example.com:8080/deep/path?q=1"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_new_job_starts_untried() {
        let job: Job<(), (), ()> = Job::new((), None, None);
        assert_eq!(job.tries, 0);
        assert!(job.errors.is_empty());
        assert!(job.callbacks.is_none());
    }
}
