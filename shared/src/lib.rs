//! Shared domain types, wire contracts, and configuration for the task
//! scheduler coordination core.
//!
//! This crate contains the pure data model (`Client`, `TaskGroup`, `Task`),
//! the request/response DTOs exchanged between worker clients and the
//! server, and the configuration structures both binaries load at startup.

pub mod api;
pub mod config;
pub mod defaults;
pub mod domain;
pub mod utils;

pub use config::{AgentConfig, ServerConfig};
pub use domain::{Client, ClientRef, ClientStatus, JobRef, Task, TaskGroup, TaskStatus};

/// Result type alias used throughout this crate and its dependents.
pub type Result<T> = anyhow::Result<T>;

/// Error taxonomy for the coordination core (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient dispatch loss: {0}")]
    TransientDispatchLoss(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("client disappeared mid-task: {0}")]
    ClientDisappearance(String),

    #[error("stale task group version: {0}")]
    StaleVersion(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test: every module above must compile and be importable.
    }
}
