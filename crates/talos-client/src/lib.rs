//! Chromium resource providers for the Talos job cluster.
//!
//! [`ChromiumProvider`] drives headless Chromium over the DevTools Protocol
//! and implements all four sharing strategies:
//!
//! | [`Concurrency`] | Browser processes     | Job isolation          |
//! |-----------------|-----------------------|------------------------|
//! | `SharedPage`    | one, shared           | none (tabs only)       |
//! | `PerContext`    | one, shared           | incognito context      |
//! | `PerBrowser`    | one per worker        | full process           |
//! | `PerGroup`      | one per group key     | process per group      |
//!
//! Requires a Chrome/Chromium binary reachable via `$PATH`, `CHROME_BIN`, or
//! one of the well-known install locations.
//!
//! ```no_run
//! use talos_client::{ChromiumProvider, Concurrency};
//! use talos_core::{task_fn, Cluster, ClusterConfig, TaskContext};
//!
//! # async fn run() -> Result<(), talos_core::ClusterError> {
//! let provider = ChromiumProvider::new(Concurrency::PerContext);
//! let config = ClusterConfig::default().with_max_concurrency(2);
//! let cluster = Cluster::<String, _, usize>::launch(provider, config).await?;
//!
//! cluster.task(task_fn(|ctx: TaskContext<String, chromiumoxide::Page>| async move {
//!     let page = ctx
//!         .page
//!         .goto(ctx.data.clone())
//!         .await
//!         .map_err(|e| talos_core::ClusterError::task(e.to_string()))?;
//!     let html = page
//!         .content()
//!         .await
//!         .map_err(|e| talos_core::ClusterError::task(e.to_string()))?;
//!     Ok(html.len())
//! }));
//!
//! let bytes = cluster.execute("https://example.com".to_string()).await?;
//! println!("rendered {bytes} bytes");
//! cluster.close().await;
//! # Ok(())
//! # }
//! ```

pub mod launcher;
pub mod provider;

pub use launcher::{find_chrome_binary, ChromiumSettings};
pub use provider::{ChromiumProvider, ChromiumTab, ChromiumWorker, Concurrency};

// Re-exported so callers can name the page type in task signatures without
// depending on chromiumoxide directly.
pub use chromiumoxide::Page;
