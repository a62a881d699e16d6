use std::sync::Arc;

use anyhow::Context;
use marketplace_api::config::AppConfig;
use marketplace_api::{build_node, router, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::load(Some("config/default")).context("failed to load configuration")?;

    let node = Arc::new(build_node(&cfg));
    if cfg.internal_api_key.is_empty() {
        warn!("internal_api_key is not set; listing sync endpoints are disabled");
    }

    let reconciler = (cfg.reconcile_interval_secs > 0).then(|| node.spawn_reconciler());

    let app = router(AppState { node }, cfg.internal_api_key.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    info!("marketplace api listening on {}", cfg.bind_addr);

    axum::serve(listener, app).await?;

    if let Some(handle) = reconciler {
        handle.abort();
    }
    Ok(())
}
