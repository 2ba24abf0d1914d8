use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use talos_core::{ClusterError, JobInstance, JobPayload, ResourceProvider, WorkerInstance};

use crate::launcher::{BrowserCell, ChromiumSettings};

/// How jobs share Chromium processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One shared browser; every job opens a tab in it and workers take
    /// jobs concurrently. Cheapest, no isolation between jobs.
    SharedPage,
    /// One shared browser; each job runs in its own incognito context.
    /// Cookies/storage are isolated per job.
    PerContext,
    /// One browser per worker. Full process isolation between workers.
    PerBrowser,
    /// One browser per group key (`payload.group()`, falling back to the
    /// payload's domain). Jobs of a group share cookies/storage; idle group
    /// browsers are retired after `worker_shutdown_timeout`.
    PerGroup,
}

/// Affinity key for [`Concurrency::PerGroup`].
fn group_key<D: JobPayload>(data: &D) -> String {
    data.group()
        .or_else(|| data.domain())
        .unwrap_or_else(|| "default".to_string())
}

/// Chromium-backed [`ResourceProvider`] implementing all four strategies.
pub struct ChromiumProvider {
    mode: Concurrency,
    settings: ChromiumSettings,
    /// Browser backing the shared strategies; untouched by the exclusive ones.
    shared: Arc<BrowserCell>,
}

impl ChromiumProvider {
    pub fn new(mode: Concurrency) -> Self {
        Self::with_settings(mode, ChromiumSettings::default())
    }

    pub fn with_settings(mode: Concurrency, settings: ChromiumSettings) -> Self {
        Self {
            mode,
            settings: settings.clone(),
            shared: Arc::new(BrowserCell::new(settings)),
        }
    }

    pub fn mode(&self) -> Concurrency {
        self.mode
    }
}

impl<D: JobPayload> ResourceProvider<D> for ChromiumProvider {
    type Instance = ChromiumWorker;

    async fn init(&self) -> Result<(), ClusterError> {
        match self.mode {
            // Shared strategies pay the launch cost up front.
            Concurrency::SharedPage | Concurrency::PerContext => self.shared.warm_up().await,
            // Exclusive strategies launch lazily, one browser per worker.
            Concurrency::PerBrowser | Concurrency::PerGroup => Ok(()),
        }
    }

    async fn worker_instance(&self, data: Option<&D>) -> Result<ChromiumWorker, ClusterError> {
        let worker = match self.mode {
            Concurrency::SharedPage => ChromiumWorker {
                cell: Arc::clone(&self.shared),
                owns_browser: false,
                per_context: false,
                multiplex: true,
                group: None,
                idle_ttl: None,
            },
            Concurrency::PerContext => ChromiumWorker {
                cell: Arc::clone(&self.shared),
                owns_browser: false,
                per_context: true,
                multiplex: false,
                group: None,
                idle_ttl: None,
            },
            Concurrency::PerBrowser => {
                let cell = Arc::new(BrowserCell::new(self.settings.clone()));
                cell.warm_up().await?;
                ChromiumWorker {
                    cell,
                    owns_browser: true,
                    per_context: false,
                    multiplex: false,
                    group: None,
                    idle_ttl: None,
                }
            }
            Concurrency::PerGroup => {
                let cell = Arc::new(BrowserCell::new(self.settings.clone()));
                cell.warm_up().await?;
                ChromiumWorker {
                    cell,
                    owns_browser: true,
                    per_context: false,
                    multiplex: true,
                    group: Some(data.map(group_key).unwrap_or_else(|| "default".to_string())),
                    idle_ttl: Some(self.settings.worker_shutdown_timeout),
                }
            }
        };
        Ok(worker)
    }

    async fn close(&self) -> Result<(), ClusterError> {
        // Exclusive browsers are owned by their workers and were closed with
        // them; only the shared process is left.
        self.shared.close().await
    }
}

/// Per-worker Chromium resource: a handle on the worker's browser plus the
/// routing facts the pool needs.
pub struct ChromiumWorker {
    cell: Arc<BrowserCell>,
    owns_browser: bool,
    per_context: bool,
    multiplex: bool,
    group: Option<String>,
    idle_ttl: Option<Duration>,
}

impl ChromiumWorker {
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

impl<D: JobPayload> WorkerInstance<D> for ChromiumWorker {
    type Job = ChromiumTab;

    async fn job_instance(&self, _data: &D) -> Result<ChromiumTab, ClusterError> {
        let context = if self.per_context {
            Some(self.cell.create_context().await?)
        } else {
            None
        };

        let page = match self.cell.new_page(context.as_ref()).await {
            Ok(page) => page,
            Err(e) => {
                if let Some(ctx) = &context {
                    let _ = self.cell.dispose_context(ctx).await;
                }
                return Err(e);
            }
        };

        // Surface renderer crashes as the job's asynchronous error.
        let crashed = Arc::new(Mutex::new(None));
        let listener = match page.event_listener::<EventTargetCrashed>().await {
            Ok(mut events) => {
                let crashed = Arc::clone(&crashed);
                Some(tokio::spawn(async move {
                    if events.next().await.is_some() {
                        let mut slot = crashed.lock().unwrap_or_else(|p| p.into_inner());
                        *slot = Some("target crashed".to_string());
                    }
                }))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not subscribe to crash events");
                None
            }
        };

        Ok(ChromiumTab {
            page,
            context,
            cell: Arc::clone(&self.cell),
            crashed,
            listener,
        })
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        self.cell.repair().await
    }

    async fn close(&self) -> Result<(), ClusterError> {
        if self.owns_browser {
            self.cell.close().await
        } else {
            Ok(())
        }
    }

    fn can_handle(&self, data: &D) -> Option<bool> {
        if let Some(group) = &self.group {
            return Some(*group == group_key(data));
        }
        if self.multiplex {
            return Some(true);
        }
        None
    }

    fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl
    }
}

/// Per-job Chromium resource: one tab, optionally inside its own incognito
/// context.
pub struct ChromiumTab {
    page: Page,
    context: Option<BrowserContextId>,
    cell: Arc<BrowserCell>,
    crashed: Arc<Mutex<Option<String>>>,
    listener: Option<JoinHandle<()>>,
}

impl JobInstance for ChromiumTab {
    type Page = Page;

    fn page(&self) -> Page {
        self.page.clone()
    }

    fn take_async_error(&self) -> Option<ClusterError> {
        self.crashed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .map(ClusterError::PageCrashed)
    }

    async fn close(&self) -> Result<(), ClusterError> {
        if let Some(listener) = &self.listener {
            listener.abort();
        }

        let page_result = self
            .page
            .clone()
            .close()
            .await
            .map_err(|e| ClusterError::Release(format!("Failed to close tab: {e}")));

        // Dispose the context even when the tab refused to close.
        if let Some(ctx) = &self.context {
            self.cell.dispose_context(ctx).await?;
        }
        page_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(
        multiplex: bool,
        group: Option<&str>,
        idle_ttl: Option<Duration>,
    ) -> ChromiumWorker {
        ChromiumWorker {
            cell: Arc::new(BrowserCell::new(ChromiumSettings::default())),
            owns_browser: true,
            per_context: false,
            multiplex,
            group: group.map(str::to_string),
            idle_ttl,
        }
    }

    #[test]
    fn test_group_key_prefers_explicit_group() {
        let data = json!({"url": "https://a.com/x", "group": "tenant-1"});
        assert_eq!(group_key(&data), "tenant-1");
    }

    #[test]
    fn test_group_key_falls_back_to_domain_then_default() {
        let data = json!({"url": "https://a.com/x"});
        assert_eq!(group_key(&data), "a.com");
        assert_eq!(group_key(&json!({"n": 1})), "default");
    }

    #[test]
    fn test_shared_page_worker_multiplexes() {
        let w = worker(true, None, None);
        assert_eq!(
            WorkerInstance::<String>::can_handle(&w, &"https://a.com".to_string()),
            Some(true)
        );
    }

    #[test]
    fn test_exclusive_worker_defers_routing() {
        let w = worker(false, None, None);
        assert_eq!(
            WorkerInstance::<String>::can_handle(&w, &"https://a.com".to_string()),
            None
        );
    }

    #[test]
    fn test_group_worker_matches_only_its_group() {
        let w = worker(true, Some("a.com"), Some(Duration::from_secs(5)));
        assert_eq!(
            WorkerInstance::<String>::can_handle(&w, &"https://a.com/1".to_string()),
            Some(true)
        );
        assert_eq!(
            WorkerInstance::<String>::can_handle(&w, &"https://b.com/1".to_string()),
            Some(false)
        );
        assert_eq!(
            WorkerInstance::<String>::idle_ttl(&w),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_provider_modes() {
        let provider = ChromiumProvider::new(Concurrency::PerContext);
        assert_eq!(provider.mode(), Concurrency::PerContext);
    }
}
