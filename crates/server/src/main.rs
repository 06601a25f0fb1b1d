//! TensorServe - Main Entry Point
//!
//! Loads settings for a model repository folder, starts every model found
//! there and serves until interrupted.

use std::path::PathBuf;
use tensorserve_common::{Result, ServerSettings, METRICS};
use tensorserve_server::TensorServer;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Repository folder: first argument, then TENSORSERVE_REPOSITORY
    let folder = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("TENSORSERVE_REPOSITORY").map(PathBuf::from));

    let settings = ServerSettings::load(folder.as_deref())?;
    init_logging(settings.use_structured_logging);

    info!(
        "Settings loaded: name={}, repository={}, workers={}",
        settings.server_name,
        settings.model_repository_root.display(),
        settings.parallel_workers
    );

    let metrics_enabled = settings.metrics_enabled;
    let server = TensorServer::new(settings)?;
    server.start().await?;

    info!("TensorServe running");
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    server.stop().await;
    if metrics_enabled {
        debug!("Final metrics:\n{}", METRICS.gather());
    }

    info!("TensorServe shutdown complete");
    Ok(())
}

fn init_logging(structured: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tensorserve_server=info,tensorserve_worker=info".into());

    if structured {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
