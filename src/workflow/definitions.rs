/// Built-in workflow definitions and reusable task bodies

use crate::{
    store::{queries, Store},
    workflow::types::{Definition, ParamDef, TaskContext},
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

pub const ECHO: &str = "echo";
pub const APPROVAL: &str = "approval";

/// One `greeting` parameter echoed back as the `greeting` output
pub fn echo() -> Definition {
    let mut def = Definition::new();
    let greeting = def.param(ParamDef::string("greeting").with_doc("Text to echo back"));
    let echo = def.task("echo", vec![greeting], |ctx, args| async move {
        let greeting = args.into_iter().next().unwrap_or(Value::Null);
        ctx.log(format!("echo {}", greeting)).await;
        Ok(greeting)
    });
    def.output("greeting", &echo);
    def
}

/// Release gated on an operator approval
///
/// `approve` blocks until the task is approved through the operator surface,
/// then `release` reports the approved version.
pub fn approval(store: Store, interval: Duration) -> Definition {
    let mut def = Definition::new();
    let version = def.param(ParamDef::string("version").with_doc("Version waiting for approval"));
    let approve = def.task("approve", vec![], move |ctx, _args| {
        let store = store.clone();
        async move {
            let approved_at = wait_for_approval(&ctx, &store, interval).await?;
            Ok(json!(approved_at.to_rfc3339()))
        }
    });
    let release = def.task("release", vec![approve, version], |ctx, args| async move {
        let version = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
        ctx.log(format!("releasing {}", version)).await;
        Ok(json!(format!("released {}", version)))
    });
    def.output("release", &release);
    def
}

/// Block the calling task until an operator approves it
///
/// Flags the task row as ready for approval, then polls `approved_at` every
/// `interval`. Fails promptly if the workflow is cancelled.
pub async fn wait_for_approval(
    ctx: &TaskContext,
    store: &Store,
    interval: Duration,
) -> anyhow::Result<DateTime<Utc>> {
    let id = ctx.workflow_id;
    let name = ctx.task_name.clone();
    queries::update_task_ready_for_approval(store.pool(), id, &name, true).await?;
    ctx.log("waiting for approval").await;
    tracing::info!("✋ Task {:?} of workflow {} waiting for approval", name, id);

    let approved_at = ctx
        .await_condition(interval, || {
            let name = name.clone();
            async move {
                let row = queries::task(store.pool(), id, &name).await?;
                Ok(row.and_then(|r| r.approved_at))
            }
        })
        .await?;

    queries::update_task_ready_for_approval(store.pool(), id, &name, false).await?;
    tracing::info!("👍 Task {:?} of workflow {} approved", name, id);
    Ok(approved_at)
}
