/// Workflow execution coordinator
///
/// The `Worker` owns every live workflow execution in the process. New and
/// resumed instances are queued on a pending channel and picked up by `run`,
/// which executes each on its own tokio task. An instance id is claimed in
/// the running registry before it is queued and released only after its
/// terminal state has been written, so an id never executes twice at once.

use crate::{
    error::{CoordinatorError, Result},
    runtime::{
        engine::{EngineError, Workflow, WorkflowHandle},
        listener::WorkflowListener,
    },
    store::{queries, Store},
    workflow::{
        registry::DefinitionHolder,
        types::{unmarshal_params, Listener, Params, TaskLogger, TaskState, WorkflowState},
    },
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Workflows that may wait in the pending queue before `enqueue` blocks
const PENDING_CAPACITY: usize = 8;

/// Message written for an operator stop
const CANCELLED_BY_OPERATOR: &str = "workflow cancelled by operator";

struct RunningWorkflow {
    stop: CancellationToken,
    /// `None` while a resume is still loading state
    handle: Option<WorkflowHandle>,
}

type Running = Arc<Mutex<HashMap<Uuid, RunningWorkflow>>>;

struct Pending {
    workflow: Workflow,
    stop: CancellationToken,
}

/// Runs workflows and persists their state through a `WorkflowListener`
pub struct Worker {
    definitions: Arc<DefinitionHolder>,
    store: Store,
    listener: Arc<dyn WorkflowListener>,
    pending_tx: mpsc::Sender<Pending>,
    pending_rx: Mutex<Option<mpsc::Receiver<Pending>>>,
    /// Parent of every instance token; cancelled once `run` stops
    root: CancellationToken,
    running: Running,
}

impl Worker {
    pub fn new(definitions: Arc<DefinitionHolder>, store: Store, listener: Arc<dyn WorkflowListener>) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(PENDING_CAPACITY);
        Self {
            definitions,
            store,
            listener,
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
            root: CancellationToken::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionHolder> {
        &self.definitions
    }

    /// Run queued workflows until `shutdown` fires
    ///
    /// Each workflow runs on its own task. On shutdown no more workflows are
    /// accepted, every running instance is cancelled and `run` returns once
    /// all of them have stopped. A failure to persist a terminal state stops
    /// the whole worker the same way and is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut pending = self
            .pending_rx
            .lock()
            .await
            .take()
            .ok_or(CoordinatorError::WorkerStopped)?;
        let mut executions: JoinSet<Result<()>> = JoinSet::new();
        let mut failure = None;

        tracing::info!("👷 Worker started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = self.root.cancelled() => break,
                Some(joined) = executions.join_next(), if !executions.is_empty() => {
                    if let Some(e) = execution_failure(joined) {
                        tracing::error!("❌ Stopping worker: {}", e);
                        failure = Some(e);
                        break;
                    }
                }
                Some(next) = pending.recv() => self.spawn_execution(&mut executions, next),
            }
        }

        tracing::info!("⏹️ Worker stopping, waiting for {} workflow(s)", executions.len());
        self.root.cancel();
        pending.close();
        while let Some(dropped) = pending.recv().await {
            self.release(dropped.workflow.id()).await;
        }
        while let Some(joined) = executions.join_next().await {
            if let Some(e) = execution_failure(joined) {
                failure.get_or_insert(e);
            }
        }
        tracing::info!("✅ Worker stopped");
        failure.map_or(Ok(()), Err)
    }

    fn spawn_execution(&self, executions: &mut JoinSet<Result<()>>, next: Pending) {
        let Pending { workflow, stop } = next;
        let id = workflow.id();
        let listener = Arc::clone(&self.listener);
        let sink: Arc<dyn Listener> = Arc::new(EngineSink(Arc::clone(&self.listener)));
        let running = Arc::clone(&self.running);
        let root = self.root.clone();

        tracing::debug!("📍 Dispatching workflow {}", id);
        executions.spawn(async move {
            let execution = tokio::spawn(async move {
                let result = workflow.run(stop, sink).await;
                match &result {
                    Ok(outputs) => listener.workflow_finished(id, Some(outputs), None).await,
                    // Left unfinished so the next process resumes it.
                    Err(EngineError::Cancelled) if root.is_cancelled() => {
                        tracing::info!("⏸️ Workflow {} interrupted by worker shutdown", id);
                        Ok(())
                    }
                    Err(EngineError::Cancelled) => {
                        listener.workflow_finished(id, None, Some(CANCELLED_BY_OPERATOR)).await
                    }
                    Err(e) => listener.workflow_finished(id, None, Some(&e.to_string())).await,
                }
            });
            // A panicking execution still gives its id back.
            let persisted = match execution.await {
                Ok(persisted) => persisted,
                Err(e) => {
                    tracing::error!("❌ Execution of workflow {} failed: {}", id, e);
                    Ok(())
                }
            };
            running.lock().await.remove(&id);
            persisted.map_err(|e| {
                CoordinatorError::Listener(e.context(format!("workflow_finished({}) failed", id)))
            })
        });
    }

    /// Persist and queue a new instance of the named workflow
    pub async fn start_workflow(&self, name: &str, params: &Params, schedule_id: Option<i64>) -> Result<Uuid> {
        let definition = self
            .definitions
            .definition(name)
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(name.to_string()))?;
        let workflow = Workflow::start(definition, params).map_err(engine_error)?;
        let id = workflow.id();
        if self.root.is_cancelled() {
            return Err(CoordinatorError::WorkerStopped);
        }

        self.listener
            .workflow_started(id, name, workflow.params(), schedule_id)
            .await?;
        let stop = self.claim(id).await?;
        self.enqueue(workflow, stop).await?;
        tracing::info!("🚀 Started workflow {} ({})", name, id);
        Ok(id)
    }

    /// Resume a persisted workflow
    ///
    /// Tasks left started-but-unfinished by a crash are failed first so the
    /// engine retries them. A workflow whose definition or parameters no
    /// longer load is marked finished with the error instead.
    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let stop = self.claim(id).await?;
        let workflow = match self.load_for_resume(id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };
        self.enqueue(workflow, stop).await?;
        tracing::info!("🔄 Resumed workflow {}", id);
        Ok(())
    }

    async fn load_for_resume(&self, id: Uuid) -> Result<Workflow> {
        let mut tx = self.store.begin().await?;
        let row = queries::workflow(&mut *tx, id)
            .await?
            .ok_or(CoordinatorError::WorkflowNotFound(id))?;
        let interrupted = queries::fail_unfinished_tasks(&mut *tx, id).await?;
        let task_rows = queries::tasks_for_workflow(&mut *tx, id).await?;
        tx.commit().await?;
        if interrupted > 0 {
            tracing::warn!("⚠️ Workflow {} had {} interrupted task(s)", id, interrupted);
        }

        let Some(definition) = self.definitions.definition(&row.name) else {
            return Err(self.abandon(id, CoordinatorError::UnknownWorkflow(row.name.clone())).await);
        };
        let params = match unmarshal_params(&row.params, &definition) {
            Ok(params) => params,
            Err(e) => {
                let e = CoordinatorError::InvalidParams(format!("workflow {}: {}", id, e));
                return Err(self.abandon(id, e).await);
            }
        };

        let mut task_states: HashMap<String, TaskState> = HashMap::new();
        for task in &task_rows {
            task_states.insert(task.name.clone(), task.to_state()?);
        }
        let state = WorkflowState { id, params };
        match Workflow::resume(definition, state, task_states) {
            Ok(workflow) => Ok(workflow),
            Err(e) => Err(self.abandon(id, CoordinatorError::Engine(e)).await),
        }
    }

    /// Record `error` as the workflow's terminal state and hand it back
    async fn abandon(&self, id: Uuid, error: CoordinatorError) -> CoordinatorError {
        tracing::error!("❌ Cannot resume workflow {}: {}", id, error);
        if let Err(e) = self.listener.workflow_finished(id, None, Some(&error.to_string())).await {
            tracing::error!("❌ workflow_finished({}) failed: {:#}", id, e);
        }
        error
    }

    /// Resume every unfinished workflow; individual failures are only logged
    pub async fn resume_all(&self) -> Result<()> {
        let workflows = queries::unfinished_workflows(self.store.pool()).await?;
        tracing::info!("🔄 Resuming {} unfinished workflow(s)", workflows.len());
        for workflow in workflows {
            if let Err(e) = self.resume(workflow.id).await {
                tracing::error!("❌ resume({}) failed: {}", workflow.id, e);
            }
        }
        Ok(())
    }

    /// Retry a failed task in a live workflow
    pub async fn retry_task(&self, id: Uuid, task_name: &str) -> Result<()> {
        let handle = {
            let running = self.running.lock().await;
            running.get(&id).and_then(|r| r.handle.clone())
        };
        let handle = handle.ok_or(CoordinatorError::NotRunning(id))?;
        handle.retry_task(task_name).await.map_err(|e| match e {
            EngineError::NotRunning => CoordinatorError::NotRunning(id),
            e => CoordinatorError::Engine(e),
        })
    }

    /// Stop one live workflow; returns whether it was running
    pub async fn cancel_workflow(&self, id: Uuid) -> bool {
        let running = self.running.lock().await;
        match running.get(&id) {
            Some(workflow) => {
                tracing::info!("🛑 Cancelling workflow {}", id);
                workflow.stop.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.lock().await.contains_key(&id)
    }

    async fn claim(&self, id: Uuid) -> Result<CancellationToken> {
        let mut running = self.running.lock().await;
        if running.contains_key(&id) {
            return Err(CoordinatorError::AlreadyRunning(id));
        }
        let stop = self.root.child_token();
        running.insert(id, RunningWorkflow { stop: stop.clone(), handle: None });
        Ok(stop)
    }

    async fn release(&self, id: Uuid) {
        self.running.lock().await.remove(&id);
    }

    async fn enqueue(&self, workflow: Workflow, stop: CancellationToken) -> Result<()> {
        let id = workflow.id();
        if let Some(entry) = self.running.lock().await.get_mut(&id) {
            entry.handle = Some(workflow.handle());
        }
        if self.root.is_cancelled() {
            self.release(id).await;
            return Err(CoordinatorError::WorkerStopped);
        }

        let sent = tokio::select! {
            biased;
            _ = self.root.cancelled() => false,
            sent = self.pending_tx.send(Pending { workflow, stop }) => sent.is_ok(),
        };
        if !sent {
            self.release(id).await;
            return Err(CoordinatorError::WorkerStopped);
        }
        Ok(())
    }
}

fn engine_error(e: EngineError) -> CoordinatorError {
    match e {
        EngineError::Params(msg) => CoordinatorError::InvalidParams(msg),
        e => CoordinatorError::Engine(e),
    }
}

fn execution_failure(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<CoordinatorError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            tracing::error!("❌ Workflow execution task failed: {}", e);
            None
        }
    }
}

/// Presents a `WorkflowListener` to the engine as a plain `Listener`
struct EngineSink(Arc<dyn WorkflowListener>);

#[async_trait]
impl Listener for EngineSink {
    async fn task_state_changed(&self, workflow_id: Uuid, task_name: &str, state: &TaskState) -> anyhow::Result<()> {
        self.0.task_state_changed(workflow_id, task_name, state).await
    }

    fn logger(&self, workflow_id: Uuid, task_name: &str) -> Arc<dyn TaskLogger> {
        self.0.logger(workflow_id, task_name)
    }

    async fn workflow_stalled(&self, workflow_id: Uuid) -> anyhow::Result<()> {
        self.0.workflow_stalled(workflow_id).await
    }
}
