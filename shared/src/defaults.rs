//! Default values for configuration parameters
//!
//! Centralizes the default-value functions used by `serde` when
//! deserializing configuration files that omit optional fields, and the
//! "observable configuration" constants named in spec.md §6.

/// Default listen address for the server's ingress API.
pub fn default_listen_address() -> String {
    "0.0.0.0:8888".to_string()
}

/// Liveness check interval for `ClientMonitor` (30 seconds, spec.md §4.1/§6).
pub fn default_liveness_check_interval_seconds() -> u64 {
    30
}

/// Working-poll interval for `TaskGroupMonitor::wait_working` (60 seconds, §4.3/§6).
pub fn default_working_poll_interval_seconds() -> u64 {
    60
}

/// Early-arm window before a task's `start_at`, to absorb lock acquisition
/// latency (200ms, §4.3/§6).
pub fn default_early_arm_ms() -> u64 {
    200
}

/// Back-off sleep after losing the distributed lock race (100ms, §4.3/§6).
pub fn default_lock_miss_backoff_ms() -> u64 {
    100
}

/// Retention window for finished task history (1 day, §6).
pub fn default_task_history_retention_days() -> u32 {
    1
}

/// Capacity of the per-group `updated` coalescing channel (§5).
pub fn default_updated_channel_capacity() -> usize {
    1024
}

/// Default lease duration for the distributed lock (must exceed the
/// slowest event handler, §5).
pub fn default_lock_lease_ms() -> u64 {
    5_000
}

/// Default interval between task-history retention sweeps.
pub fn default_history_cleanup_interval_seconds() -> u64 {
    3_600
}

/// Default heartbeat interval for the reference worker client.
pub fn default_heartbeat_interval_seconds() -> u64 {
    10
}

/// Default graceful shutdown timeout.
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}
