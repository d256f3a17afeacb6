//! sandboxed-exec - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes sandboxed code execution.

use sandboxed_exec::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandboxed_exec=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: isolation={:?}, workspace={}, sync={}",
        config.isolation,
        config.workspace_path.display(),
        config.workspace_sync
    );
    if let Some(timeout) = config.executor.timeout {
        info!("Execution timeout: {}s", timeout.as_secs());
    }

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
