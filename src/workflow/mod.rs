/// Workflow Definition Layer
///
/// This module handles what a workflow is, independent of any running instance:
/// - Type definitions (Definition, ParamDef, TaskState) and the engine callback contract
/// - Lock-free definition registry using ArcSwap
/// - Built-in definitions and reusable task bodies

// Core workflow type definitions
pub mod types;

// Name -> definition registry shared by the worker and the scheduler
pub mod registry;

// Built-in definitions (echo, approval gate)
pub mod definitions;

// Re-export commonly used types
pub use registry::DefinitionHolder;
pub use types::{Definition, Input, ParamDef, ParamType, Params, TaskContext, TaskState};
