/// DAG execution engine for workflow instances
///
/// A `Workflow` is one instantiated run of a `Definition`. Tasks start in
/// topological order as soon as their inputs are available and run
/// concurrently on tokio. Every state transition is reported to a
/// `Listener`, which is how the instance becomes durable. The engine keeps
/// no state of its own beyond what the listener has already seen.

use crate::workflow::types::{
    check_params, Definition, Input, Listener, Params, TaskContext, TaskState, WorkflowState,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Attempts a task gets before the engine stops retrying it on its own
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Definition(String),

    #[error("{0}")]
    Params(String),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("task {0:?} not found in workflow")]
    UnknownTask(String),

    #[error("task {0:?} has not failed and cannot be retried")]
    NotRetryable(String),

    #[error("workflow is not running")]
    NotRunning,
}

enum Command {
    Retry {
        task: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Cloneable handle for steering a workflow while it runs
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    pub id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkflowHandle {
    /// Ask the running workflow to retry a failed task
    pub async fn retry_task(&self, task: &str) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Retry {
                task: task.to_string(),
                reply,
            })
            .map_err(|_| EngineError::NotRunning)?;
        response.await.map_err(|_| EngineError::NotRunning)?
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Retry { task, .. } => f.debug_struct("Retry").field("task", task).finish(),
        }
    }
}

/// Mutable execution state of one workflow instance
struct Instance {
    id: Uuid,
    definition: Arc<Definition>,
    params: Params,
    /// Task indices in topological order
    order: Vec<usize>,
    /// Indexed like `definition.tasks()`
    tasks: Vec<TaskState>,
}

/// An instantiated workflow, ready to run
pub struct Workflow {
    instance: Instance,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl Workflow {
    /// Instantiate a definition with fresh state and a new id
    pub fn start(definition: Arc<Definition>, params: &Params) -> Result<Self, EngineError> {
        let order = definition.execution_order()?;
        let params = check_params(params, &definition)?;
        let tasks = definition
            .tasks()
            .iter()
            .map(|t| TaskState {
                name: t.name.clone(),
                ..TaskState::default()
            })
            .collect();
        Ok(Self::new(Instance {
            id: Uuid::new_v4(),
            definition,
            params,
            order,
            tasks,
        }))
    }

    /// Restore a workflow from persisted state
    ///
    /// Finished tasks keep their result or error. Anything else starts over,
    /// keeping its retry count.
    pub fn resume(
        definition: Arc<Definition>,
        state: WorkflowState,
        mut task_states: HashMap<String, TaskState>,
    ) -> Result<Self, EngineError> {
        let order = definition.execution_order()?;
        let tasks = definition
            .tasks()
            .iter()
            .map(|t| match task_states.remove(&t.name) {
                Some(saved) if saved.finished => TaskState {
                    name: t.name.clone(),
                    started: true,
                    ..saved
                },
                Some(saved) => TaskState {
                    name: t.name.clone(),
                    retry_count: saved.retry_count,
                    ..TaskState::default()
                },
                None => TaskState {
                    name: t.name.clone(),
                    ..TaskState::default()
                },
            })
            .collect();
        Ok(Self::new(Instance {
            id: state.id,
            definition,
            params: state.params,
            order,
            tasks,
        }))
    }

    fn new(instance: Instance) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            instance,
            commands_tx,
            commands_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.instance.id
    }

    pub fn params(&self) -> &Params {
        &self.instance.params
    }

    pub fn handle(&self) -> WorkflowHandle {
        WorkflowHandle {
            id: self.instance.id,
            commands: self.commands_tx.clone(),
        }
    }

    /// Run the workflow until every output is available
    ///
    /// Returns `EngineError::Cancelled` once `cancel` fires and every task
    /// body has returned. Results of tasks that finish during cancellation
    /// are not reported.
    pub async fn run(
        self,
        cancel: CancellationToken,
        listener: Arc<dyn Listener>,
    ) -> Result<Params, EngineError> {
        let Workflow {
            mut instance,
            commands_rx: mut commands,
            commands_tx,
        } = self;
        // Only outside handles keep the command channel open.
        drop(commands_tx);

        let mut running: JoinSet<(usize, anyhow::Result<Value>)> = JoinSet::new();
        let mut stalled = false;

        tracing::info!("🚀 Running workflow {}", instance.id);
        loop {
            if let Some(outputs) = instance.outputs() {
                tracing::info!("🎉 Workflow {} produced all outputs", instance.id);
                return Ok(outputs);
            }

            if !cancel.is_cancelled() {
                instance.schedule_retries(&listener).await;
                instance.start_ready(&mut running, &cancel, &listener).await;
            }

            if running.is_empty() && !stalled && !cancel.is_cancelled() {
                stalled = true;
                tracing::warn!("⏸️ Workflow {} stalled: no task can make progress", instance.id);
                if let Err(e) = listener.workflow_stalled(instance.id).await {
                    tracing::error!("❌ workflow_stalled({}) failed: {:#}", instance.id, e);
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("⏹️ Workflow {} cancelled, waiting for {} task(s)", instance.id, running.len());
                    while running.join_next().await.is_some() {}
                    return Err(EngineError::Cancelled);
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((index, result)) => instance.finish_task(index, result, &listener).await,
                        Err(e) => tracing::error!("❌ Task runner for workflow {} failed: {}", instance.id, e),
                    }
                }
                Some(command) = commands.recv() => {
                    // Only an accepted retry can make progress again.
                    if instance.handle_command(command, &listener).await {
                        stalled = false;
                    }
                }
            }
        }
    }
}

impl Instance {
    /// Outputs keyed by name, once every output task succeeded
    fn outputs(&self) -> Option<Params> {
        let mut outputs = Params::new();
        for (output, task) in self.definition.outputs() {
            let state = self.tasks.iter().find(|t| &t.name == task)?;
            if !state.finished || state.error.is_some() {
                return None;
            }
            outputs.insert(output.clone(), state.result.clone().unwrap_or(Value::Null));
        }
        Some(outputs)
    }

    fn task_index(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    async fn report(&self, index: usize, listener: &Arc<dyn Listener>) {
        let state = &self.tasks[index];
        if let Err(e) = listener.task_state_changed(self.id, &state.name, state).await {
            tracing::error!("❌ task_state_changed({}, {:?}) failed: {:#}", self.id, state.name, e);
        }
    }

    fn reset_for_retry(&mut self, index: usize) {
        let state = &mut self.tasks[index];
        state.started = false;
        state.finished = false;
        state.result = None;
        state.error = None;
        state.retry_count += 1;
    }

    /// Re-queue failed tasks that still have attempts left
    async fn schedule_retries(&mut self, listener: &Arc<dyn Listener>) {
        for index in 0..self.tasks.len() {
            let state = &self.tasks[index];
            if state.finished && state.error.is_some() && state.retry_count + 1 < MAX_ATTEMPTS {
                tracing::info!("🔁 Retrying task {:?} of workflow {} (attempt {})",
                    state.name, self.id, state.retry_count + 2);
                self.reset_for_retry(index);
                self.report(index, listener).await;
            }
        }
    }

    /// Resolve a task's arguments, or `None` while a dependency is outstanding
    fn arguments(&self, index: usize) -> Option<Vec<Value>> {
        let mut args = Vec::new();
        for input in &self.definition.tasks()[index].inputs {
            match input {
                Input::Param(name) => args.push(self.params.get(name).cloned().unwrap_or(Value::Null)),
                Input::Task(name) => {
                    let dep = &self.tasks[self.task_index(name)?];
                    if !dep.finished || dep.error.is_some() {
                        return None;
                    }
                    args.push(dep.result.clone().unwrap_or(Value::Null));
                }
            }
        }
        Some(args)
    }

    async fn start_ready(
        &mut self,
        running: &mut JoinSet<(usize, anyhow::Result<Value>)>,
        cancel: &CancellationToken,
        listener: &Arc<dyn Listener>,
    ) {
        for position in 0..self.order.len() {
            let index = self.order[position];
            if self.tasks[index].started {
                continue;
            }
            let Some(args) = self.arguments(index) else {
                continue;
            };
            self.tasks[index].started = true;
            self.report(index, listener).await;

            let task = &self.definition.tasks()[index];
            tracing::debug!("📍 Starting task {:?} of workflow {}", task.name, self.id);
            let ctx = TaskContext::new(
                self.id,
                task.name.clone(),
                listener.logger(self.id, &task.name),
                cancel.clone(),
            );
            let body = (task.body)(ctx, args);
            running.spawn(async move {
                // A panicking body fails its task instead of the whole run.
                let result = match tokio::spawn(body).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("task panicked: {}", e)),
                };
                (index, result)
            });
        }
    }

    async fn finish_task(&mut self, index: usize, result: anyhow::Result<Value>, listener: &Arc<dyn Listener>) {
        let state = &mut self.tasks[index];
        state.finished = true;
        match result {
            Ok(value) => {
                tracing::info!("✅ Task {:?} of workflow {} completed", state.name, self.id);
                state.result = Some(value);
                state.error = None;
            }
            Err(e) => {
                tracing::warn!("❌ Task {:?} of workflow {} failed: {:#}", state.name, self.id, e);
                state.result = None;
                state.error = Some(format!("{:#}", e));
            }
        }
        self.report(index, listener).await;
    }

    /// Apply an operator command; true when it changed the instance
    async fn handle_command(&mut self, command: Command, listener: &Arc<dyn Listener>) -> bool {
        match command {
            Command::Retry { task, reply } => {
                let outcome = match self.task_index(&task) {
                    None => Err(EngineError::UnknownTask(task)),
                    Some(index) if self.tasks[index].finished && self.tasks[index].error.is_some() => {
                        tracing::info!("🔁 Manual retry of task {:?} in workflow {}", task, self.id);
                        self.reset_for_retry(index);
                        self.report(index, listener).await;
                        Ok(())
                    }
                    Some(_) => Err(EngineError::NotRetryable(task)),
                };
                let accepted = outcome.is_ok();
                let _ = reply.send(outcome);
                accepted
            }
        }
    }
}
