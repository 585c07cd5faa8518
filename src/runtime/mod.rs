/// Runtime Execution Layer
///
/// Everything that runs workflows and keeps them durable:
/// - petgraph-based DAG engine with retry and stall detection
/// - Worker coordinating live executions and crash recovery
/// - PersistenceListener writing engine state to the store
/// - Scheduler launching workflows on a calendar
/// - Operator actions and the notification mail contract

// DAG execution engine for one workflow instance
pub mod engine;

// Engine callbacks -> durable rows
pub mod listener;

// Notification mail contract
pub mod mail;

// Approvals and finished-workflow retries
pub mod operator;

// Once/cron schedules on tokio-cron-scheduler
pub mod scheduler;

// Execution coordinator
pub mod worker;

// Re-export main types
pub use engine::{EngineError, Workflow, WorkflowHandle};
pub use listener::{PersistenceListener, WorkflowListener};
pub use mail::{log_only_mailer, MailContent, MailHeader, SendMail};
pub use scheduler::{FailedToScheduleEntry, Schedule, ScheduleEntry, Scheduler, WorkflowSchedule};
pub use worker::Worker;
