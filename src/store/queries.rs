/// Statements against the coordinator tables
///
/// Every function takes a generic executor: pass `store.pool()` for a
/// standalone statement or `&mut *tx` to run inside a transaction.
/// Timestamps are always bound from the caller's clock, never defaulted by
/// SQLite, so stored values share one format.

use crate::store::models::{ScheduleLastRun, ScheduleRow, TaskLogRow, TaskRow, WorkflowRow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteExecutor;
use std::collections::HashMap;
use uuid::Uuid;

/// Error recorded on tasks found mid-flight while resuming
pub const INTERRUPTED: &str = "task interrupted before completion";

/// Log body marking an operator approval
pub const USER_APPROVED: &str = "USER-APPROVED";

// Workflows

pub async fn create_workflow<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    name: &str,
    params: &str,
    schedule_id: Option<i64>,
) -> sqlx::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO workflows (id, name, params, output, error, finished, schedule_id, created_at, updated_at)
        VALUES (?, ?, ?, '{}', '', 0, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(params)
    .bind(schedule_id)
    .bind(now)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn workflow<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<Option<WorkflowRow>> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?")
        .bind(id)
        .fetch_optional(exec)
        .await
}

/// All workflows, newest first
pub async fn workflows<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<Vec<WorkflowRow>> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows ORDER BY created_at DESC")
        .fetch_all(exec)
        .await
}

pub async fn unfinished_workflows<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<Vec<WorkflowRow>> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE finished = 0 ORDER BY created_at")
        .fetch_all(exec)
        .await
}

/// Mark a workflow terminal with its outputs and error text
pub async fn workflow_finished<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    output: &str,
    error: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE workflows SET finished = 1, output = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(output)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

/// Reopen a finished workflow for another run
pub async fn reset_workflow<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE workflows SET finished = 0, output = '{}', error = '', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

/// Detach every workflow from a schedule
pub async fn clear_workflow_schedule<'e, E: SqliteExecutor<'e>>(exec: E, schedule_id: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE workflows SET schedule_id = NULL, updated_at = ? WHERE schedule_id = ?")
        .bind(Utc::now())
        .bind(schedule_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

// Tasks

/// Insert or fully overwrite the engine-owned fields of a task
#[allow(clippy::too_many_arguments)]
pub async fn upsert_task<'e, E: SqliteExecutor<'e>>(
    exec: E,
    workflow_id: Uuid,
    name: &str,
    started: bool,
    finished: bool,
    result: Option<&str>,
    error: Option<&str>,
    retry_count: i64,
) -> sqlx::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO tasks (workflow_id, name, started, finished, result, error, retry_count,
                           ready_for_approval, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        ON CONFLICT (workflow_id, name) DO UPDATE SET
            started = excluded.started,
            finished = excluded.finished,
            result = excluded.result,
            error = excluded.error,
            retry_count = excluded.retry_count,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .bind(started)
    .bind(finished)
    .bind(result)
    .bind(error)
    .bind(retry_count)
    .bind(now)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn task<'e, E: SqliteExecutor<'e>>(exec: E, workflow_id: Uuid, name: &str) -> sqlx::Result<Option<TaskRow>> {
    sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE workflow_id = ? AND name = ?")
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(exec)
        .await
}

pub async fn tasks_for_workflow<'e, E: SqliteExecutor<'e>>(exec: E, workflow_id: Uuid) -> sqlx::Result<Vec<TaskRow>> {
    sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE workflow_id = ? ORDER BY created_at, name")
        .bind(workflow_id)
        .fetch_all(exec)
        .await
}

/// Fail every task left started-but-unfinished by a crash
///
/// A previously stored error is kept after the interruption message.
pub async fn fail_unfinished_tasks<'e, E: SqliteExecutor<'e>>(exec: E, workflow_id: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET
            finished = 1,
            error = CASE
                WHEN error IS NULL OR error = '' THEN ?1
                ELSE ?1 || ': ' || error
            END,
            updated_at = ?2
        WHERE workflow_id = ?3 AND started = 1 AND finished = 0
        "#,
    )
    .bind(INTERRUPTED)
    .bind(Utc::now())
    .bind(workflow_id)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

/// Put a task back to not-started, keeping its retry count
pub async fn reset_task<'e, E: SqliteExecutor<'e>>(exec: E, workflow_id: Uuid, name: &str) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET started = 0, finished = 0, result = NULL, error = NULL, updated_at = ?
        WHERE workflow_id = ? AND name = ?
        "#,
    )
    .bind(Utc::now())
    .bind(workflow_id)
    .bind(name)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_task_ready_for_approval<'e, E: SqliteExecutor<'e>>(
    exec: E,
    workflow_id: Uuid,
    name: &str,
    ready: bool,
) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE tasks SET ready_for_approval = ?, updated_at = ? WHERE workflow_id = ? AND name = ?")
        .bind(ready)
        .bind(Utc::now())
        .bind(workflow_id)
        .bind(name)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

pub async fn set_task_approved<'e, E: SqliteExecutor<'e>>(
    exec: E,
    workflow_id: Uuid,
    name: &str,
    at: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE tasks SET approved_at = ?, updated_at = ? WHERE workflow_id = ? AND name = ?")
        .bind(at)
        .bind(at)
        .bind(workflow_id)
        .bind(name)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

// Task logs

pub async fn create_task_log<'e, E: SqliteExecutor<'e>>(
    exec: E,
    workflow_id: Uuid,
    task_name: &str,
    body: &str,
) -> sqlx::Result<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO task_logs (workflow_id, task_name, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(workflow_id)
    .bind(task_name)
    .bind(body)
    .bind(now)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Log entries of one task in insertion order
pub async fn task_logs<'e, E: SqliteExecutor<'e>>(exec: E, workflow_id: Uuid, task_name: &str) -> sqlx::Result<Vec<TaskLogRow>> {
    sqlx::query_as::<_, TaskLogRow>("SELECT * FROM task_logs WHERE workflow_id = ? AND task_name = ? ORDER BY id")
        .bind(workflow_id)
        .bind(task_name)
        .fetch_all(exec)
        .await
}

// Schedules

pub async fn create_schedule<'e, E: SqliteExecutor<'e>>(
    exec: E,
    workflow_name: &str,
    workflow_params: &str,
    once: Option<DateTime<Utc>>,
    spec: Option<&str>,
) -> sqlx::Result<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO schedules (workflow_name, workflow_params, once, spec, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(workflow_name)
    .bind(workflow_params)
    .bind(once)
    .bind(spec)
    .bind(now)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn schedule<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> sqlx::Result<Option<ScheduleRow>> {
    sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(exec)
        .await
}

pub async fn schedules<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<Vec<ScheduleRow>> {
    sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY id")
        .fetch_all(exec)
        .await
}

pub async fn delete_schedule<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

/// Most recent launch of every schedule that has one, keyed by schedule id
pub async fn schedules_last_run<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<HashMap<i64, ScheduleLastRun>> {
    let rows = sqlx::query_as::<_, ScheduleLastRun>(
        r#"
        SELECT w.schedule_id AS schedule_id, w.id AS workflow_id, w.created_at AS created_at,
               w.finished AS finished, w.error AS error
        FROM workflows w
        WHERE w.schedule_id IS NOT NULL
          AND w.created_at = (
              SELECT MAX(w2.created_at) FROM workflows w2 WHERE w2.schedule_id = w.schedule_id
          )
        "#,
    )
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|row| (row.schedule_id, row)).collect())
}
