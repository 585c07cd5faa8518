/// Operator actions on persisted workflows
///
/// These run outside any live execution: approving a gated task, and
/// re-running a task of a workflow that already finished.

use crate::{
    error::{CoordinatorError, Result},
    runtime::worker::Worker,
    store::{queries, Store},
};
use chrono::Utc;
use uuid::Uuid;

/// Approve a task waiting in `wait_for_approval`
///
/// Sets `approved_at` and appends the approval log entry together.
pub async fn approve_task(store: &Store, workflow_id: Uuid, task_name: &str) -> Result<()> {
    let mut tx = store.begin().await?;
    let updated = queries::set_task_approved(&mut *tx, workflow_id, task_name, Utc::now()).await?;
    if updated == 0 {
        return Err(CoordinatorError::TaskNotFound(workflow_id, task_name.to_string()));
    }
    queries::create_task_log(&mut *tx, workflow_id, task_name, queries::USER_APPROVED).await?;
    tx.commit().await?;
    tracing::info!("👍 Approved task {:?} of workflow {}", task_name, workflow_id);
    Ok(())
}

/// Reset one task of a workflow and resume it
///
/// The task goes back to not-started with its retry count kept, and the
/// workflow is reopened, in one transaction. A live workflow must use
/// `Worker::retry_task` instead.
pub async fn reset_and_resume(store: &Store, worker: &Worker, workflow_id: Uuid, task_name: &str) -> Result<()> {
    if worker.is_running(workflow_id).await {
        return Err(CoordinatorError::AlreadyRunning(workflow_id));
    }

    let mut tx = store.begin().await?;
    if queries::workflow(&mut *tx, workflow_id).await?.is_none() {
        return Err(CoordinatorError::WorkflowNotFound(workflow_id));
    }
    if queries::reset_task(&mut *tx, workflow_id, task_name).await? == 0 {
        return Err(CoordinatorError::TaskNotFound(workflow_id, task_name.to_string()));
    }
    queries::reset_workflow(&mut *tx, workflow_id).await?;
    tx.commit().await?;

    tracing::info!("🔁 Reset task {:?} of workflow {}", task_name, workflow_id);
    worker.resume(workflow_id).await
}
