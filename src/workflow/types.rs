/// Core workflow type definitions
///
/// Defines the structures a workflow definition is built from (parameters,
/// tasks, outputs) together with the callback contract the execution engine
/// reports through. Definitions are compiled in code and registered by name;
/// only parameters, task states and outputs are ever serialized.

use crate::runtime::engine::EngineError;
use async_trait::async_trait;
use petgraph::{algo::toposort, graph::DiGraph};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Workflow parameters as a JSON object with sorted keys
pub type Params = Map<String, Value>;

/// Boxed future returned by a task body
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Type-erased task body: receives its context and resolved input values
pub type TaskFn = Arc<dyn Fn(TaskContext, Vec<Value>) -> TaskFuture + Send + Sync>;

/// Declared JSON shape of a workflow parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    /// A single string, e.g. a greeting or a version number
    String,
    /// A list of strings, e.g. reviewer names
    StringList,
    Bool,
    Integer,
    /// Any JSON value; never fails validation
    Json,
}

impl ParamType {
    /// Check that a JSON value has this shape
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let ok = match self {
            ParamType::String => value.is_string(),
            ParamType::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            ParamType::Bool => value.is_boolean(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Json => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {:?}, got {}", self, value))
        }
    }
}

/// A named workflow parameter with its declared shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub param_type: ParamType,
    /// Human-readable description shown next to the parameter
    pub doc: String,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            doc: String::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }
}

/// Reference to a value a task consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A workflow parameter, filled in at start time
    Param(String),
    /// The result of another task in the same definition
    Task(String),
}

/// A single task in a workflow definition
#[derive(Clone)]
pub struct TaskDef {
    pub name: String,
    pub inputs: Vec<Input>,
    pub(crate) body: TaskFn,
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// A compiled workflow definition
///
/// Built once at startup with the `param`/`task`/`output` builder methods,
/// then registered in the `DefinitionHolder`. Builder misuse (duplicate
/// names, an output that is not a task) is a programming error and panics.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    parameters: Vec<ParamDef>,
    tasks: Vec<TaskDef>,
    /// Output name -> producing task name
    outputs: BTreeMap<String, String>,
}

impl Definition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter and return a reference to it
    pub fn param(&mut self, def: ParamDef) -> Input {
        if self.parameters.iter().any(|p| p.name == def.name) {
            panic!("parameter {:?} declared twice", def.name);
        }
        let input = Input::Param(def.name.clone());
        self.parameters.push(def);
        input
    }

    /// Add a task and return a reference to its result
    pub fn task<F, Fut>(&mut self, name: &str, inputs: Vec<Input>, body: F) -> Input
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.tasks.iter().any(|t| t.name == name) {
            panic!("task {:?} already exists in the workflow", name);
        }
        let body: TaskFn = Arc::new(move |ctx, args| Box::pin(body(ctx, args)));
        self.tasks.push(TaskDef {
            name: name.to_string(),
            inputs,
            body,
        });
        Input::Task(name.to_string())
    }

    /// Register a task result as a workflow output
    pub fn output(&mut self, name: &str, value: &Input) {
        match value {
            Input::Task(task) => {
                self.outputs.insert(name.to_string(), task.clone());
            }
            Input::Param(_) => panic!("output {:?} must be a task result", name),
        }
    }

    pub fn parameters(&self) -> &[ParamDef] {
        &self.parameters
    }

    pub fn tasks(&self) -> &[TaskDef] {
        &self.tasks
    }

    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    /// Validate the task graph and return task indices in execution order
    ///
    /// Every input must resolve, the graph must be acyclic, and every task
    /// must feed an output or another task.
    pub fn execution_order(&self) -> Result<Vec<usize>, EngineError> {
        let mut graph = DiGraph::<usize, ()>::new();
        let mut index_by_name = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            index_by_name.insert(task.name.as_str(), graph.add_node(i));
        }

        let params: HashSet<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        let mut used = HashSet::new();
        for task in &self.tasks {
            let to = index_by_name[task.name.as_str()];
            for input in &task.inputs {
                match input {
                    Input::Param(name) if !params.contains(name.as_str()) => {
                        return Err(EngineError::Definition(format!(
                            "task {:?} uses undeclared parameter {:?}",
                            task.name, name
                        )));
                    }
                    Input::Param(_) => {}
                    Input::Task(dep) => {
                        let from = index_by_name.get(dep.as_str()).ok_or_else(|| {
                            EngineError::Definition(format!(
                                "task {:?} depends on unknown task {:?}",
                                task.name, dep
                            ))
                        })?;
                        graph.add_edge(*from, to, ());
                        used.insert(dep.as_str());
                    }
                }
            }
        }
        for (output, task) in &self.outputs {
            if !index_by_name.contains_key(task.as_str()) {
                return Err(EngineError::Definition(format!(
                    "output {:?} refers to unknown task {:?}",
                    output, task
                )));
            }
            used.insert(task.as_str());
        }
        if let Some(unused) = self.tasks.iter().find(|t| !used.contains(t.name.as_str())) {
            return Err(EngineError::Definition(format!(
                "task {:?} is not referenced and should be deleted",
                unused.name
            )));
        }

        let order = toposort(&graph, None).map_err(|_| {
            EngineError::Definition("workflow contains cycles - must be a DAG".to_string())
        })?;
        Ok(order.into_iter().map(|idx| graph[idx]).collect())
    }
}

/// Deserialize persisted parameters against a definition's declared shapes
///
/// Every declared parameter must be present and well-typed; undeclared keys
/// are dropped. A missing or empty blob is treated as `{}`.
pub fn unmarshal_params(marshalled: &str, def: &Definition) -> Result<Params, EngineError> {
    let raw: Params = if marshalled.trim().is_empty() {
        Params::new()
    } else {
        serde_json::from_str(marshalled)
            .map_err(|e| EngineError::Params(format!("parameters are not a JSON object: {}", e)))?
    };
    check_params(&raw, def)
}

/// Validate in-memory parameters against a definition's declared shapes
pub fn check_params(raw: &Params, def: &Definition) -> Result<Params, EngineError> {
    let mut params = Params::new();
    for param in def.parameters() {
        let value = raw
            .get(&param.name)
            .ok_or_else(|| EngineError::Params(format!("missing parameter {:?}", param.name)))?;
        param
            .param_type
            .check(value)
            .map_err(|e| EngineError::Params(format!("parameter {:?}: {}", param.name, e)))?;
        params.insert(param.name.clone(), value.clone());
    }
    Ok(params)
}

/// State of one task in a running workflow
///
/// Once `finished` is true either `result` or `error` is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    pub started: bool,
    pub finished: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Shallow state of a workflow, rebuilt from storage on resume
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub id: Uuid,
    pub params: Params,
}

/// Per-task log sink handed to task bodies
#[async_trait]
pub trait TaskLogger: Send + Sync {
    /// Append one log entry; never fails the task
    async fn log(&self, body: String);
}

/// Lifecycle callbacks the engine reports through while a workflow runs
#[async_trait]
pub trait Listener: Send + Sync {
    /// Called whenever a task starts, finishes, or is reset for a retry
    async fn task_state_changed(
        &self,
        workflow_id: Uuid,
        task_name: &str,
        state: &TaskState,
    ) -> anyhow::Result<()>;

    /// Log sink for one task
    fn logger(&self, workflow_id: Uuid, task_name: &str) -> Arc<dyn TaskLogger>;

    /// Called when no task can make progress
    async fn workflow_stalled(&self, workflow_id: Uuid) -> anyhow::Result<()>;
}

/// Context passed to every task body
#[derive(Clone)]
pub struct TaskContext {
    pub workflow_id: Uuid,
    pub task_name: String,
    logger: Arc<dyn TaskLogger>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        workflow_id: Uuid,
        task_name: impl Into<String>,
        logger: Arc<dyn TaskLogger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            task_name: task_name.into(),
            logger,
            cancel,
        }
    }

    /// Write a line to this task's log
    pub async fn log(&self, body: impl Into<String>) {
        self.logger.log(body.into()).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the surrounding workflow is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Poll `check` every `interval` until it yields a value
    ///
    /// Returns an error as soon as the workflow is cancelled or `check` fails.
    pub async fn await_condition<T, F, Fut>(&self, interval: Duration, mut check: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    anyhow::bail!("task {:?} cancelled while waiting", self.task_name);
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("workflow_id", &self.workflow_id)
            .field("task_name", &self.task_name)
            .finish_non_exhaustive()
    }
}
