/// SQLite persistence layer for workflow execution state
///
/// Holds the durable record of every workflow instance, task, task log and
/// schedule. Query functions live in `queries` and take any sqlx executor, so
/// the same statement runs on the pool or inside a transaction.

pub mod models;
pub mod queries;

pub use models::{ScheduleLastRun, ScheduleRow, TaskLogRow, TaskRow, WorkflowRow};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Sqlite, Transaction,
};
use std::str::FromStr;

/// Handle to the coordinator database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::info!("🗄️ Connected to database: {}", url);
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    ///
    /// Pinned to a single connection that never expires, since every new
    /// in-memory connection would see an empty database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction; it rolls back when dropped without `commit`
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Create tables and indexes
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_name TEXT NOT NULL,
                workflow_params TEXT NOT NULL DEFAULT '{}',
                once DATETIME,
                spec TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                output TEXT NOT NULL DEFAULT '{}',
                error TEXT NOT NULL DEFAULT '',
                finished BOOLEAN NOT NULL DEFAULT 0,
                schedule_id INTEGER REFERENCES schedules(id),
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                workflow_id BLOB NOT NULL REFERENCES workflows(id),
                name TEXT NOT NULL,
                started BOOLEAN NOT NULL DEFAULT 0,
                finished BOOLEAN NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                approved_at DATETIME,
                ready_for_approval BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (workflow_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id BLOB NOT NULL REFERENCES workflows(id),
                task_name TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_finished ON workflows(finished)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_schedule ON workflows(schedule_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(workflow_id, task_name)")
            .execute(&self.pool)
            .await?;

        tracing::debug!("📋 Database schema ready");
        Ok(())
    }
}
