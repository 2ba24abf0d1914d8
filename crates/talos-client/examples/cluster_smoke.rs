/// Smoke-test for the Chromium cluster.
///
/// Launches a headless Chromium, renders a couple of pages through a
/// two-worker cluster, and verifies the fetched HTML.
///
/// Run with:
///   cargo run --example cluster_smoke
use std::time::Duration;

use talos_client::{ChromiumProvider, Concurrency, Page};
use talos_core::{task_fn, Cluster, ClusterConfig, ClusterError, TaskContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser cluster…");
    let provider = ChromiumProvider::new(Concurrency::PerContext);
    let config = ClusterConfig::default()
        .with_max_concurrency(2)
        .with_timeout(Duration::from_secs(30));
    let cluster = Cluster::<String, _, String>::launch(provider, config).await?;

    cluster.task(task_fn(|ctx: TaskContext<String, Page>| async move {
        let page = ctx
            .page
            .goto(ctx.data.clone())
            .await
            .map_err(|e| ClusterError::task(e.to_string()))?;
        page.find_element("body")
            .await
            .map_err(|e| ClusterError::task(format!("Page did not render body: {e}")))?;
        page.content()
            .await
            .map_err(|e| ClusterError::task(e.to_string()))
    }));

    let url = "https://example.com".to_string();
    println!("Fetching {url} …");
    let html = cluster.execute(url).await?;

    // Basic sanity checks
    assert!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );
    assert!(
        html.len() > 500,
        "HTML suspiciously short ({} bytes)",
        html.len()
    );

    println!("OK — got {} bytes of rendered HTML", html.len());

    let stats = cluster.stats();
    println!(
        "Cluster stats: {} targets, {} successes, {} errors",
        stats.all_targets, stats.successes, stats.errors
    );

    cluster.close().await;
    Ok(())
}
