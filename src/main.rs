/// relflow: durable coordinator for multi-step release workflows
///
/// Main entry point. Loads configuration, resumes interrupted workflows and
/// persisted schedules, then runs until Ctrl-C.

use relflow::{
    config::Config,
    service::{create_coordinator, run_coordinator},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be set
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting relflow coordinator...");
    let config = Config::default();
    let coordinator = create_coordinator(&config).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
        }
        tracing::info!("⏹️ Shutdown requested");
        trigger.cancel();
    });

    run_coordinator(coordinator, shutdown).await
}
