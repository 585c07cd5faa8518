#![allow(dead_code)]

use async_trait::async_trait;
use relflow::{
    runtime::{listener::WorkflowListener, MailContent, MailHeader, PersistenceListener, SendMail, Worker},
    store::{queries, Store, TaskRow, WorkflowRow},
    workflow::{
        types::{Listener, TaskLogger, TaskState},
        Definition, DefinitionHolder, ParamDef, Params,
    },
};
use serde_json::{json, Value};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Wraps a `PersistenceListener`, counting callbacks and optionally failing
/// or panicking in `workflow_finished`
pub struct CountingListener {
    inner: PersistenceListener,
    pub finished: AtomicUsize,
    pub stalled: AtomicUsize,
    pub fail_finished: AtomicBool,
    /// Panics on the next `workflow_finished` only
    pub panic_finished: AtomicBool,
}

impl CountingListener {
    pub fn new(inner: PersistenceListener) -> Self {
        Self {
            inner,
            finished: AtomicUsize::new(0),
            stalled: AtomicUsize::new(0),
            fail_finished: AtomicBool::new(false),
            panic_finished: AtomicBool::new(false),
        }
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stalled(&self) -> usize {
        self.stalled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for CountingListener {
    async fn task_state_changed(&self, workflow_id: Uuid, task_name: &str, state: &TaskState) -> anyhow::Result<()> {
        self.inner.task_state_changed(workflow_id, task_name, state).await
    }

    fn logger(&self, workflow_id: Uuid, task_name: &str) -> Arc<dyn TaskLogger> {
        self.inner.logger(workflow_id, task_name)
    }

    async fn workflow_stalled(&self, workflow_id: Uuid) -> anyhow::Result<()> {
        self.stalled.fetch_add(1, Ordering::SeqCst);
        self.inner.workflow_stalled(workflow_id).await
    }
}

#[async_trait]
impl WorkflowListener for CountingListener {
    async fn workflow_started(
        &self,
        workflow_id: Uuid,
        name: &str,
        params: &Params,
        schedule_id: Option<i64>,
    ) -> anyhow::Result<()> {
        self.inner.workflow_started(workflow_id, name, params, schedule_id).await
    }

    async fn workflow_finished(
        &self,
        workflow_id: Uuid,
        outputs: Option<&Params>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.panic_finished.swap(false, Ordering::SeqCst) {
            panic!("listener exploded");
        }
        if self.fail_finished.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        self.inner.workflow_finished(workflow_id, outputs, error).await?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A worker running on an in-memory store
pub struct Harness {
    pub store: Store,
    pub definitions: Arc<DefinitionHolder>,
    pub listener: Arc<CountingListener>,
    pub worker: Arc<Worker>,
    pub shutdown: CancellationToken,
    run: Option<JoinHandle<relflow::Result<()>>>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Store::in_memory().await.unwrap();
        Self::with_store(store, test_definitions()).await
    }

    pub async fn with_store(store: Store, definitions: Arc<DefinitionHolder>) -> Self {
        let listener = Arc::new(CountingListener::new(PersistenceListener::new(store.clone())));
        Self::with_listener(store, definitions, listener).await
    }

    pub async fn with_listener(store: Store, definitions: Arc<DefinitionHolder>, listener: Arc<CountingListener>) -> Self {
        let worker = Arc::new(Worker::new(Arc::clone(&definitions), store.clone(), listener.clone()));
        let shutdown = CancellationToken::new();
        let run = {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };
        Self {
            store,
            definitions,
            listener,
            worker,
            shutdown,
            run: Some(run),
        }
    }

    /// Shut the worker down and return what `run` returned
    pub async fn stop(&mut self) -> relflow::Result<()> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for `run` to return on its own
    pub async fn join(&mut self) -> relflow::Result<()> {
        let run = self.run.take().expect("worker already joined");
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked")
    }

    pub async fn workflow(&self, id: Uuid) -> WorkflowRow {
        queries::workflow(self.store.pool(), id).await.unwrap().unwrap()
    }

    pub async fn task(&self, id: Uuid, name: &str) -> TaskRow {
        queries::task(self.store.pool(), id, name).await.unwrap().unwrap()
    }

    /// Wait until the workflow row is marked finished
    pub async fn wait_finished(&self, id: Uuid) -> WorkflowRow {
        let store = self.store.clone();
        let finished = eventually(|| {
            let store = store.clone();
            async move {
                matches!(queries::workflow(store.pool(), id).await, Ok(Some(row)) if row.finished)
            }
        })
        .await;
        assert!(finished, "workflow {} did not finish", id);
        self.workflow(id).await
    }
}

/// Id of the first workflow launched by `schedule_id`
pub async fn launched_by(store: &Store, schedule_id: i64) -> Uuid {
    let found = eventually(|| {
        let store = store.clone();
        async move {
            queries::workflows(store.pool())
                .await
                .map(|rows| rows.iter().any(|w| w.schedule_id == Some(schedule_id)))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(found, "schedule {} launched nothing", schedule_id);
    queries::workflows(store.pool())
        .await
        .unwrap()
        .into_iter()
        .find(|w| w.schedule_id == Some(schedule_id))
        .unwrap()
        .id
}

/// Poll `check` until it holds, for up to five seconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        other => panic!("params must be an object, got {}", other),
    }
}

pub fn greeting(text: &str) -> Params {
    params(json!({ "greeting": text }))
}

/// Built-ins plus `blocking` and `flaky`
pub fn test_definitions() -> Arc<DefinitionHolder> {
    let holder = DefinitionHolder::new();
    holder.register_definition("blocking", blocking());
    holder.register_definition("flaky", flaky(Arc::new(AtomicBool::new(false))).0);
    Arc::new(holder)
}

/// One task that only returns once its workflow is cancelled
pub fn blocking() -> Definition {
    let mut def = Definition::new();
    let wait = def.task("wait", vec![], |ctx, _args| async move {
        ctx.cancelled().await;
        anyhow::bail!("cancelled")
    });
    def.output("wait", &wait);
    def
}

/// One task that fails until `fixed` is set; also returns the attempt counter
pub fn flaky(fixed: Arc<AtomicBool>) -> (Definition, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let mut def = Definition::new();
    let name = def.param(ParamDef::string("name"));
    let task = def.task("task", vec![name], move |_ctx, args| {
        let fixed = Arc::clone(&fixed);
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if fixed.load(Ordering::SeqCst) {
                Ok(args[0].clone())
            } else {
                anyhow::bail!("not fixed yet")
            }
        }
    });
    def.output("task", &task);
    (def, attempts)
}

/// Mail sender that records every message
pub fn capturing_mailer() -> (SendMail, Arc<Mutex<Vec<(MailHeader, MailContent)>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sent);
    let send: SendMail = Arc::new(move |header: &MailHeader, content: &MailContent| -> anyhow::Result<()> {
        sink.lock().unwrap().push((header.clone(), content.clone()));
        Ok(())
    });
    (send, sent)
}
