/// Coordinator setup and initialization
///
/// Wires together all components: store, definition registry, persistence
/// listener, worker, and scheduler. Provides the factory used by the binary
/// and the long-running service loop.

use crate::{
    config::Config,
    runtime::{log_only_mailer, MailHeader, PersistenceListener, Scheduler, Worker},
    store::Store,
    workflow::{definitions, registry::DefinitionHolder},
};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fully wired coordinator components
pub struct Coordinator {
    pub store: Store,
    pub definitions: Arc<DefinitionHolder>,
    pub worker: Arc<Worker>,
    pub scheduler: Arc<Scheduler>,
}

/// Connect to the database and build every component
pub async fn create_coordinator(config: &Config) -> Result<Coordinator> {
    tracing::info!("🗄️ Opening database: {}", config.database.url);
    let store = Store::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", config.database.url, e))?;

    tracing::info!("📊 Registering workflow definitions");
    let holder = Arc::new(DefinitionHolder::new());
    holder.register_definition(
        definitions::APPROVAL,
        definitions::approval(store.clone(), config.approval_poll_interval()),
    );

    let header = MailHeader {
        from: config.notify.mail_from.clone(),
        to: config.notify.mail_to.clone(),
    };
    let listener = PersistenceListener::new(store.clone())
        .with_base_url(config.notify.base_url.clone())
        .with_mail(header, log_only_mailer());

    tracing::info!("👷 Initializing worker");
    let worker = Arc::new(Worker::new(Arc::clone(&holder), store.clone(), Arc::new(listener)));

    tracing::info!("⏰ Initializing scheduler");
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), Arc::clone(&worker))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize scheduler: {}", e))?,
    );

    tracing::info!("✅ Coordinator initialized successfully");
    Ok(Coordinator {
        store,
        definitions: holder,
        worker,
        scheduler,
    })
}

/// Run the coordinator until `shutdown` fires
///
/// Resumes unfinished workflows and persisted schedules, then drives the
/// worker. The cron runtime is stopped before returning.
pub async fn run_coordinator(coordinator: Coordinator, shutdown: CancellationToken) -> Result<()> {
    let worker = Arc::clone(&coordinator.worker);
    let stop = shutdown.clone();
    let run = tokio::spawn(async move { worker.run(stop).await });

    coordinator.worker.resume_all().await?;
    coordinator.scheduler.resume().await?;
    tracing::info!("🚀 Coordinator running");

    let result = match run.await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::anyhow!("worker task failed: {}", e)),
    };
    if let Err(e) = coordinator.scheduler.shutdown().await {
        tracing::warn!("⚠️ Failed to stop scheduler: {}", e);
    }
    result
}
