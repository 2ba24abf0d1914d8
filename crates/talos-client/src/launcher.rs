use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use talos_core::ClusterError;

/// Settings shared by all Chromium strategies.
#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    /// Explicit Chrome/Chromium binary. When unset, `CHROME_BIN` and a list
    /// of well-known install locations are tried before chromiumoxide's own
    /// lookup.
    pub chrome_executable: Option<PathBuf>,

    /// Browser-per-group only: how long a group's browser may sit idle
    /// before its worker is retired.
    pub worker_shutdown_timeout: Duration,
}

impl Default for ChromiumSettings {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            worker_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ChromiumSettings {
    pub fn with_chrome_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_executable = Some(path.into());
        self
    }

    pub fn with_worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker_shutdown_timeout = timeout;
        self
    }
}

/// Locate a usable Chrome/Chromium binary.
///
/// Snap-packaged Chromium hides the real binary behind a wrapper that strips
/// standard CLI flags (`--headless`, `--disable-gpu`, …), so the snap's inner
/// binary is preferred over anything on `$PATH`. `CHROME_BIN` always wins.
/// Returning `None` leaves the lookup to chromiumoxide.
pub fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(bin) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&bin);
        if path.exists() {
            return Some(path);
        }
    }

    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];
    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}

/// One live Chromium process plus its CDP handler task.
struct BrowserHandle {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserHandle {
    async fn launch(settings: &ChromiumSettings) -> Result<Self, ClusterError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = settings
            .chrome_executable
            .clone()
            .or_else(find_chrome_binary)
        {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| ClusterError::Launch(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ClusterError::Launch(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to
        // work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser");
        }
        self.handler.abort();
    }
}

/// A lazily-launched, repairable browser slot.
///
/// The shared strategies hang every worker off one `BrowserCell`; the
/// exclusive strategies give each worker its own. `repair` tears the process
/// down and relaunches it, which is the recovery path for a wedged browser.
pub(crate) struct BrowserCell {
    settings: ChromiumSettings,
    slot: Mutex<Option<BrowserHandle>>,
}

impl BrowserCell {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self {
            settings,
            slot: Mutex::new(None),
        }
    }

    async fn ensure_handle<'a>(
        settings: &ChromiumSettings,
        slot: &'a mut Option<BrowserHandle>,
    ) -> Result<&'a mut BrowserHandle, ClusterError> {
        if slot.is_none() {
            *slot = Some(BrowserHandle::launch(settings).await?);
        }
        match slot.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(ClusterError::Launch("browser slot empty after launch".into())),
        }
    }

    /// Launch the browser now instead of on first use.
    pub async fn warm_up(&self) -> Result<(), ClusterError> {
        let mut slot = self.slot.lock().await;
        Self::ensure_handle(&self.settings, &mut slot).await?;
        Ok(())
    }

    pub async fn new_page(
        &self,
        context: Option<&BrowserContextId>,
    ) -> Result<Page, ClusterError> {
        let mut slot = self.slot.lock().await;
        let handle = Self::ensure_handle(&self.settings, &mut slot).await?;

        let params = match context {
            Some(id) => CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(id.clone())
                .build()
                .map_err(|e| ClusterError::Acquire(format!("Invalid target params: {e}")))?,
            None => CreateTargetParams::new("about:blank"),
        };
        handle
            .browser
            .new_page(params)
            .await
            .map_err(|e| ClusterError::Acquire(format!("Failed to open page: {e}")))
    }

    /// Create an incognito browser context for context-isolated jobs.
    pub async fn create_context(&self) -> Result<BrowserContextId, ClusterError> {
        let mut slot = self.slot.lock().await;
        let handle = Self::ensure_handle(&self.settings, &mut slot).await?;
        handle
            .browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .map_err(|e| ClusterError::Acquire(format!("Failed to create context: {e}")))
    }

    pub async fn dispose_context(&self, context: &BrowserContextId) -> Result<(), ClusterError> {
        let mut slot = self.slot.lock().await;
        let handle = Self::ensure_handle(&self.settings, &mut slot).await?;
        handle
            .browser
            .dispose_browser_context(context.clone())
            .await
            .map_err(|e| ClusterError::Release(format!("Failed to dispose context: {e}")))?;
        Ok(())
    }

    /// Tear down the current process (if any) and bring up a fresh one.
    pub async fn repair(&self) -> Result<(), ClusterError> {
        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.take() {
            tracing::warn!("Repairing browser: relaunching Chromium");
            old.shutdown().await;
        }
        *slot = Some(BrowserHandle::launch(&self.settings).await?);
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ClusterError> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.take() {
            handle.shutdown().await;
        }
        Ok(())
    }
}
