/// Row types for the coordinator tables

use crate::workflow::types::TaskState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// One workflow instance
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Canonical JSON object
    pub params: String,
    /// Canonical JSON object, `{}` until the workflow succeeds
    pub output: String,
    /// Empty when the workflow has not failed
    pub error: String,
    pub finished: bool,
    pub schedule_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One task of a workflow instance, keyed by (workflow_id, name)
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct TaskRow {
    pub workflow_id: Uuid,
    pub name: String,
    pub started: bool,
    pub finished: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub approved_at: Option<DateTime<Utc>>,
    pub ready_for_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    /// Engine view of this row
    pub fn to_state(&self) -> Result<TaskState, serde_json::Error> {
        let result = match self.result.as_deref() {
            Some(text) if !text.is_empty() => Some(serde_json::from_str::<Value>(text)?),
            _ => None,
        };
        Ok(TaskState {
            name: self.name.clone(),
            started: self.started,
            finished: self.finished,
            result,
            error: self.error.clone().filter(|e| !e.is_empty()),
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct TaskLogRow {
    pub id: i64,
    pub workflow_id: Uuid,
    pub task_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted schedule; `once` and `spec` both empty means Immediate
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct ScheduleRow {
    pub id: i64,
    pub workflow_name: String,
    pub workflow_params: String,
    pub once: Option<DateTime<Utc>>,
    pub spec: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Most recent workflow launched by a schedule
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct ScheduleLastRun {
    pub schedule_id: i64,
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub finished: bool,
    pub error: String,
}
