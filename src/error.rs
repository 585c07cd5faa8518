/// Error types for the coordinator surface
///
/// Worker, Scheduler and the store return `CoordinatorError` so callers can
/// tell validation failures, registry conflicts and store outages apart.
/// Task bodies and listener callbacks keep using `anyhow`.

use crate::runtime::engine::EngineError;
use uuid::Uuid;

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no workflow named {0:?}")]
    UnknownWorkflow(String),

    #[error("workflow {0} already running")]
    AlreadyRunning(Uuid),

    #[error("no running workflow with id {0}")]
    NotRunning(Uuid),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("task {1:?} not found in workflow {0}")]
    TaskNotFound(Uuid, String),

    #[error("worker stopped")]
    WorkerStopped,

    #[error("schedule not found")]
    ScheduleNotFound,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid workflow parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cron runtime: {0}")]
    Cron(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error(transparent)]
    Listener(#[from] anyhow::Error),
}
