/// relflow: durable execution coordinator for release workflows
///
/// This library starts named workflow instances, persists every task's
/// progress so execution survives a restart, keeps each instance to a single
/// live execution, and launches new instances on a schedule.

// Core configuration and setup
pub mod config;

// Coordinator error type
pub mod error;

// SQLite persistence - workflows, tasks, task logs, schedules
pub mod store;

// Workflow definitions and the definition registry
pub mod workflow;

// Execution engine, worker, listener and scheduler
pub mod runtime;

// Component wiring for the binary
pub mod service;

// Re-export commonly used types for external consumers
pub use error::{CoordinatorError, Result};
pub use runtime::{PersistenceListener, Schedule, Scheduler, Worker};
pub use store::Store;
pub use workflow::{Definition, DefinitionHolder, Params};
