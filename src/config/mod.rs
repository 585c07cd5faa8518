/// Configuration management for the relflow coordinator
///
/// Handles database connections, notification settings, and runtime parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Stall notification configuration
    pub notify: NotifyConfig,
    /// Seconds between approval checks in gated tasks
    pub approval_poll_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (default: "sqlite://relflow.db")
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

/// Where stall notifications go and what they link to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Base URL of the operator UI, used for links in mail bodies
    pub base_url: String,
    pub mail_from: String,
    /// Comma-separated in the environment
    pub mail_to: Vec<String>,
}

impl Config {
    pub fn approval_poll_interval(&self) -> Duration {
        Duration::from_secs(self.approval_poll_secs.max(1))
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("RELFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://relflow.db".to_string()),
                max_connections: std::env::var("RELFLOW_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            notify: NotifyConfig {
                base_url: std::env::var("RELFLOW_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
                mail_from: std::env::var("RELFLOW_MAIL_FROM")
                    .unwrap_or_else(|_| "relflow@localhost".to_string()),
                mail_to: std::env::var("RELFLOW_MAIL_TO")
                    .map(|to| {
                        to.split(',')
                            .map(str::trim)
                            .filter(|addr| !addr.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            approval_poll_secs: std::env::var("RELFLOW_APPROVAL_POLL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
        }
    }
}
