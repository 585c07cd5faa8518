mod common;

use common::{eventually, greeting, params, Harness};
use relflow::{
    runtime::operator,
    store::{queries, Store},
    workflow::{definitions, DefinitionHolder},
    CoordinatorError,
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn echo_workflow_runs_to_completion() {
    let mut h = Harness::new().await;
    let id = h.worker.start_workflow("echo", &greeting("hi"), None).await.unwrap();

    let row = h.wait_finished(id).await;
    assert_eq!(row.name, "echo");
    assert_eq!(row.error, "");
    assert_eq!(serde_json::from_str::<serde_json::Value>(&row.output).unwrap(), json!({"greeting": "hi"}));

    let task = h.task(id, "echo").await;
    assert!(task.started && task.finished);
    assert_eq!(task.result.as_deref(), Some("\"hi\""));
    let logs = queries::task_logs(h.store.pool(), id, "echo").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].body, "echo \"hi\"");

    assert!(eventually(|| async { !h.worker.is_running(id).await }).await);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_starts_persist_nothing() {
    let h = Harness::new().await;

    let unknown = h.worker.start_workflow("nope", &greeting("hi"), None).await;
    assert!(matches!(unknown, Err(CoordinatorError::UnknownWorkflow(_))));
    let missing = h.worker.start_workflow("echo", &params(json!({})), None).await;
    assert!(matches!(missing, Err(CoordinatorError::InvalidParams(_))));
    let mistyped = h.worker.start_workflow("echo", &params(json!({"greeting": 5})), None).await;
    assert!(matches!(mistyped, Err(CoordinatorError::InvalidParams(_))));

    assert!(queries::workflows(h.store.pool()).await.unwrap().is_empty());
}

#[tokio::test]
async fn live_workflow_cannot_be_resumed_twice() {
    let mut h = Harness::new().await;
    let id = h.worker.start_workflow("blocking", &params(json!({})), None).await.unwrap();
    assert!(eventually(|| async {
        matches!(queries::task(h.store.pool(), id, "wait").await, Ok(Some(t)) if t.started)
    })
    .await);

    assert!(matches!(h.worker.resume(id).await, Err(CoordinatorError::AlreadyRunning(got)) if got == id));

    h.stop().await.unwrap();
}

#[tokio::test]
async fn resume_recovers_interrupted_tasks() {
    let mut h = Harness::new().await;
    let id = Uuid::new_v4();
    queries::create_workflow(h.store.pool(), id, "echo", r#"{"greeting":"again"}"#, None).await.unwrap();
    queries::upsert_task(h.store.pool(), id, "echo", true, false, None, Some("boom"), 0).await.unwrap();

    h.worker.resume(id).await.unwrap();
    let row = h.wait_finished(id).await;
    assert_eq!(row.error, "");
    assert_eq!(serde_json::from_str::<serde_json::Value>(&row.output).unwrap(), json!({"greeting": "again"}));

    // Interrupted attempt counted against the task, then retried.
    let task = h.task(id, "echo").await;
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.result.as_deref(), Some("\"again\""));

    h.stop().await.unwrap();
}

#[tokio::test]
async fn resume_abandons_workflow_without_definition() {
    let mut h = Harness::new().await;
    let id = Uuid::new_v4();
    queries::create_workflow(h.store.pool(), id, "retired", "{}", None).await.unwrap();

    let err = h.worker.resume(id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::UnknownWorkflow(_)));

    let row = h.workflow(id).await;
    assert!(row.finished);
    assert!(row.error.contains("retired"));
    assert!(!h.worker.is_running(id).await);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn resume_abandons_workflow_with_stale_params() {
    let mut h = Harness::new().await;
    let id = Uuid::new_v4();
    queries::create_workflow(h.store.pool(), id, "echo", r#"{"salutation":"hi"}"#, None).await.unwrap();

    let err = h.worker.resume(id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidParams(_)));
    assert!(h.workflow(id).await.finished);
    assert!(matches!(h.worker.resume(Uuid::new_v4()).await, Err(CoordinatorError::WorkflowNotFound(_))));

    h.stop().await.unwrap();
}

#[tokio::test]
async fn resume_all_skips_failures_and_resumes_the_rest() {
    let mut h = Harness::new().await;
    let good = Uuid::new_v4();
    let bad = Uuid::new_v4();
    queries::create_workflow(h.store.pool(), bad, "retired", "{}", None).await.unwrap();
    queries::create_workflow(h.store.pool(), good, "echo", r#"{"greeting":"hello"}"#, None).await.unwrap();

    h.worker.resume_all().await.unwrap();

    assert_eq!(h.wait_finished(good).await.error, "");
    assert!(h.workflow(bad).await.finished);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn retry_requires_a_live_workflow() {
    let h = Harness::new().await;
    let err = h.worker.retry_task(Uuid::new_v4(), "echo").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotRunning(_)));
}

#[tokio::test]
async fn stalled_workflow_completes_after_manual_retry() {
    let fixed = Arc::new(AtomicBool::new(false));
    let (def, attempts) = common::flaky(Arc::clone(&fixed));
    let holder = DefinitionHolder::new();
    holder.register_definition("flaky", def);
    let mut h = Harness::with_store(Store::in_memory().await.unwrap(), Arc::new(holder)).await;

    let id = h.worker.start_workflow("flaky", &params(json!({"name": "rc1"})), None).await.unwrap();
    assert!(eventually(|| async { h.listener.stalled() == 1 }).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(!h.workflow(id).await.finished);
    let task = h.task(id, "task").await;
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error.as_deref(), Some("not fixed yet"));

    fixed.store(true, Ordering::SeqCst);
    h.worker.retry_task(id, "task").await.unwrap();
    let row = h.wait_finished(id).await;
    assert_eq!(serde_json::from_str::<serde_json::Value>(&row.output).unwrap(), json!({"task": "rc1"}));
    assert_eq!(h.task(id, "task").await.retry_count, 3);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn cancelling_one_workflow_leaves_others_running() {
    let mut h = Harness::new().await;
    let first = h.worker.start_workflow("blocking", &params(json!({})), None).await.unwrap();
    let second = h.worker.start_workflow("blocking", &params(json!({})), None).await.unwrap();
    assert!(eventually(|| async { h.worker.is_running(first).await && h.worker.is_running(second).await }).await);

    assert!(h.worker.cancel_workflow(first).await);
    let row = h.wait_finished(first).await;
    assert_eq!(row.error, "workflow cancelled by operator");
    assert!(eventually(|| async { !h.worker.is_running(first).await }).await);
    assert!(!h.worker.cancel_workflow(first).await);

    assert!(h.worker.is_running(second).await);
    assert!(!h.workflow(second).await.finished);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_leaves_workflows_resumable() {
    let mut h = Harness::new().await;
    let id = h.worker.start_workflow("blocking", &params(json!({})), None).await.unwrap();
    assert!(eventually(|| async {
        matches!(queries::task(h.store.pool(), id, "wait").await, Ok(Some(t)) if t.started)
    })
    .await);

    h.stop().await.unwrap();

    let row = h.workflow(id).await;
    assert!(!row.finished);
    assert_eq!(h.listener.finished(), 0);
    assert!(!h.worker.is_running(id).await);
    let after = h.worker.start_workflow("echo", &greeting("late"), None).await;
    assert!(matches!(after, Err(CoordinatorError::WorkerStopped)));

    // The next process picks it up and fails the interrupted task.
    let mut next = Harness::with_store(h.store.clone(), common::test_definitions()).await;
    next.worker.resume(id).await.unwrap();
    assert!(eventually(|| async {
        matches!(queries::task(next.store.pool(), id, "wait").await, Ok(Some(t)) if t.retry_count == 1 && t.started)
    })
    .await);
    next.stop().await.unwrap();
}

#[tokio::test]
async fn failing_to_record_completion_stops_the_worker() {
    let mut h = Harness::new().await;
    h.listener.fail_finished.store(true, Ordering::SeqCst);
    let sibling = h.worker.start_workflow("blocking", &params(json!({})), None).await.unwrap();
    h.worker.start_workflow("echo", &greeting("hi"), None).await.unwrap();

    let err = h.join().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Listener(_)));
    // The sibling was cancelled by the worker, not finished.
    assert!(!h.workflow(sibling).await.finished);
}

#[tokio::test]
async fn panicking_execution_releases_its_workflow() {
    let mut h = Harness::new().await;
    h.listener.panic_finished.store(true, Ordering::SeqCst);
    let id = h.worker.start_workflow("echo", &greeting("hi"), None).await.unwrap();

    assert!(eventually(|| async { !h.worker.is_running(id).await }).await);
    assert!(!h.workflow(id).await.finished);

    // The worker keeps running and the instance can be resumed.
    h.worker.resume(id).await.unwrap();
    assert_eq!(h.wait_finished(id).await.error, "");
    h.stop().await.unwrap();
}

#[tokio::test]
async fn approval_gate_waits_for_operator() {
    let store = Store::in_memory().await.unwrap();
    let holder = DefinitionHolder::new();
    holder.register_definition(
        definitions::APPROVAL,
        definitions::approval(store.clone(), Duration::from_millis(20)),
    );
    let mut h = Harness::with_store(store, Arc::new(holder)).await;

    let id = h.worker.start_workflow("approval", &params(json!({"version": "v1.2.3"})), None).await.unwrap();
    assert!(eventually(|| async {
        matches!(queries::task(h.store.pool(), id, "approve").await, Ok(Some(t)) if t.ready_for_approval)
    })
    .await);
    assert!(!h.workflow(id).await.finished);

    operator::approve_task(&h.store, id, "approve").await.unwrap();
    let row = h.wait_finished(id).await;
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&row.output).unwrap(),
        json!({"release": "released v1.2.3"})
    );
    let approve = h.task(id, "approve").await;
    assert!(approve.approved_at.is_some());
    assert!(!approve.ready_for_approval);
    let logs = queries::task_logs(h.store.pool(), id, "approve").await.unwrap();
    assert!(logs.iter().any(|l| l.body == queries::USER_APPROVED));

    let missing = operator::approve_task(&h.store, id, "nope").await;
    assert!(matches!(missing, Err(CoordinatorError::TaskNotFound(..))));
    h.stop().await.unwrap();
}

#[tokio::test]
async fn reset_and_resume_reruns_a_finished_task() {
    let mut h = Harness::new().await;
    let id = h.worker.start_workflow("echo", &greeting("hi"), None).await.unwrap();
    h.wait_finished(id).await;
    assert!(eventually(|| async { !h.worker.is_running(id).await }).await);
    assert_eq!(h.listener.finished(), 1);

    operator::reset_and_resume(&h.store, &h.worker, id, "echo").await.unwrap();
    assert!(eventually(|| async { h.listener.finished() == 2 }).await);

    let row = h.workflow(id).await;
    assert!(row.finished);
    assert_eq!(row.error, "");
    let task = h.task(id, "echo").await;
    assert_eq!(task.retry_count, 0);
    assert_eq!(queries::task_logs(h.store.pool(), id, "echo").await.unwrap().len(), 2);

    assert!(eventually(|| async { !h.worker.is_running(id).await }).await);
    let missing = operator::reset_and_resume(&h.store, &h.worker, id, "nope").await;
    assert!(matches!(missing, Err(CoordinatorError::TaskNotFound(..))));
    h.stop().await.unwrap();
}
