//! Configuration types and validation for the scheduler server and agent
//!
//! These structures are loaded from TOML files by each binary's own config
//! manager (`server::config::ConfigManager`, `agent::config::AgentConfig`
//! loader) and carry the observable configuration: the listen address and
//! the five monitor intervals.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Configuration for the central scheduling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address and port the ingress API binds to (`WebApi.Url`, spec.md §6).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Pre-shared key clients must present on every ingress call.
    #[serde(default)]
    pub api_key: String,
    /// How often `ClientMonitor` liveness-checks a client (spec.md §4.1).
    #[serde(default = "default_liveness_check_interval_seconds")]
    pub liveness_check_interval_seconds: u64,
    /// How often `waitWorking` polls a stalled client (spec.md §4.3).
    #[serde(default = "default_working_poll_interval_seconds")]
    pub working_poll_interval_seconds: u64,
    /// Early-arm window before a task's `start_at` (spec.md §4.3).
    #[serde(default = "default_early_arm_ms")]
    pub early_arm_ms: u64,
    /// Back-off sleep after losing the distributed lock race (spec.md §4.3).
    #[serde(default = "default_lock_miss_backoff_ms")]
    pub lock_miss_backoff_ms: u64,
    /// Retention window for finished task history (spec.md §6).
    #[serde(default = "default_task_history_retention_days")]
    pub task_history_retention_days: u32,
    /// How often the history retention sweep runs.
    #[serde(default = "default_history_cleanup_interval_seconds")]
    pub history_cleanup_interval_seconds: u64,
    /// Capacity of each group monitor's `updated` coalescing channel.
    #[serde(default = "default_updated_channel_capacity")]
    pub updated_channel_capacity: usize,
    /// Lease duration for the distributed lock.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// Maximum time to wait for background tasks during shutdown.
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Path to the SQLite database file backing the group/client repositories
    /// and the distributed lock.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "./data/scheduler.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            api_key: String::new(),
            liveness_check_interval_seconds: default_liveness_check_interval_seconds(),
            working_poll_interval_seconds: default_working_poll_interval_seconds(),
            early_arm_ms: default_early_arm_ms(),
            lock_miss_backoff_ms: default_lock_miss_backoff_ms(),
            task_history_retention_days: default_task_history_retention_days(),
            history_cleanup_interval_seconds: default_history_cleanup_interval_seconds(),
            updated_channel_capacity: default_updated_channel_capacity(),
            lock_lease_ms: default_lock_lease_ms(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout_seconds(),
            database_path: default_database_path(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(
                crate::CoreError::Config("listen_address cannot be empty".to_string()).into(),
            );
        }
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(crate::CoreError::Config(format!(
                "invalid listen_address: {}",
                self.listen_address
            ))
            .into());
        }
        if self.liveness_check_interval_seconds == 0 {
            return Err(crate::CoreError::Config(
                "liveness_check_interval_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if self.working_poll_interval_seconds == 0 {
            return Err(crate::CoreError::Config(
                "working_poll_interval_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if self.updated_channel_capacity == 0 {
            return Err(crate::CoreError::Config(
                "updated_channel_capacity must be greater than 0".to_string(),
            )
            .into());
        }
        if self.lock_lease_ms == 0 {
            return Err(
                crate::CoreError::Config("lock_lease_ms must be greater than 0".to_string())
                    .into(),
            );
        }
        Ok(())
    }
}

/// Configuration for a reference worker client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Unique, stable identifier for this client.
    pub agent_id: i64,
    /// Human-readable name reported alongside registration.
    pub name: String,
    /// Base URL of the central server's ingress API.
    pub server_url: String,
    /// Address this agent's own dispatch-receiving endpoint binds to.
    #[serde(default = "default_agent_listen_address")]
    pub listen_address: String,
    /// Job kinds (and version) this agent advertises as able to run.
    pub jobs: Vec<crate::domain::JobRef>,
    /// Heartbeat interval against the server.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Graceful shutdown timeout.
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
}

fn default_agent_listen_address() -> String {
    "127.0.0.1:9001".to_string()
}

impl AgentConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::CoreError::Config("name cannot be empty".to_string()).into());
        }
        if self.server_url.trim().is_empty() {
            return Err(
                crate::CoreError::Config("server_url cannot be empty".to_string()).into(),
            );
        }
        if self.jobs.is_empty() {
            return Err(crate::CoreError::Config(
                "jobs must declare at least one job this agent can run".to_string(),
            )
            .into());
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(crate::CoreError::Config(
                "heartbeat_interval_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobRef;

    fn valid_server_config() -> ServerConfig {
        ServerConfig {
            listen_address: "0.0.0.0:8888".into(),
            api_key: "secret".into(),
            liveness_check_interval_seconds: 30,
            working_poll_interval_seconds: 60,
            early_arm_ms: 200,
            lock_miss_backoff_ms: 100,
            task_history_retention_days: 1,
            history_cleanup_interval_seconds: 3600,
            updated_channel_capacity: 1024,
            lock_lease_ms: 5000,
            graceful_shutdown_timeout_seconds: 30,
            database_path: "./data/scheduler.db".into(),
        }
    }

    #[test]
    fn server_config_rejects_empty_listen_address() {
        let mut cfg = valid_server_config();
        cfg.listen_address = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_config_accepts_defaults() {
        assert!(valid_server_config().validate().is_ok());
    }

    #[test]
    fn agent_config_requires_at_least_one_job() {
        let cfg = AgentConfig {
            agent_id: 1,
            name: "worker-a".into(),
            server_url: "http://127.0.0.1:8888".into(),
            listen_address: "127.0.0.1:9001".into(),
            jobs: vec![],
            heartbeat_interval_seconds: 10,
            graceful_shutdown_timeout_seconds: 30,
        };
        assert!(cfg.validate().is_err());

        let cfg_with_job = AgentConfig {
            jobs: vec![JobRef {
                name: "demo".into(),
                ver: 1,
            }],
            ..cfg
        };
        assert!(cfg_with_job.validate().is_ok());
    }
}
