//! Wire types for communication between worker clients and the server
//!
//! This module defines the request/response DTOs exchanged over the server's
//! ingress API (`pushClient`/`pushTaskGroup`, spec.md §6) and the dispatch
//! callback the server makes into a worker client.

use crate::domain::{ClientRef, ClientStatus, JobRef, TaskStatus};
use serde::{Deserialize, Serialize};

/// Generic API response wrapper, mirrored from the teacher's `ApiResponse<T>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Body of the client registration/heartbeat ingress call. Maps directly
/// onto `pushClient(c)` from spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPushRequest {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub status: ClientStatus,
    pub jobs: Vec<JobRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPushResponse {
    pub accepted: bool,
}

/// Body of the task-group registration/update ingress call. Maps directly
/// onto `pushTaskGroup(g)` from spec.md §6.
///
/// A group is scheduled one of two ways (spec.md §3): a non-empty `cron`
/// expression drives `CalculateNextAtByCron` after every finish, or an
/// explicit `next_at` timestamp is supplied directly and applied via
/// `CalculateNextAtByUnix` -- the caller (an external orchestrator) is then
/// responsible for pushing the next one after each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroupPushRequest {
    pub name: String,
    pub ver: i32,
    pub caption: String,
    pub cron: String,
    pub start_at: i64,
    #[serde(default)]
    pub next_at: Option<i64>,
    pub is_enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroupPushResponse {
    pub accepted: bool,
}

/// Body the server POSTs to a client's dispatch endpoint when it has been
/// selected by `PollingClient` to run a task (the `TaskScheduler` event's
/// external handler, spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: i64,
    pub group_name: String,
    pub ver: i32,
    pub caption: String,
    pub data: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub accepted: bool,
}

/// Body a client POSTs back to the server to report task progress or
/// completion. Terminal statuses (`Fail`/`Success`) drive `taskFinish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReportRequest {
    pub task_id: i64,
    pub group_name: String,
    pub client: ClientRef,
    pub status: TaskStatus,
    pub progress: u8,
    pub run_speed_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReportResponse {
    pub accepted: bool,
}

/// HTTP endpoint paths, mirrored from the teacher's `endpoints` constant module.
pub mod endpoints {
    pub const CLIENTS: &str = "/api/v1/clients";
    pub const GROUPS: &str = "/api/v1/groups";
    pub const TASK_REPORT: &str = "/api/v1/tasks/report";
    pub const DISPATCH: &str = "/api/v1/dispatch";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_response_helpers_set_status() {
        let ok: ApiResponse<u8> = ApiResponse::success(1);
        assert_eq!(ok.status, "success");
        assert_eq!(ok.data, Some(1));

        let err: ApiResponse<u8> = ApiResponse::error("bad request");
        assert_eq!(err.status, "error");
        assert_eq!(err.error.as_deref(), Some("bad request"));
    }

    #[test]
    fn client_push_request_round_trips_through_json() {
        let req = ClientPushRequest {
            id: 1,
            name: "worker-a".into(),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: ClientStatus::OnlineSchedulable,
            jobs: vec![JobRef {
                name: "demo".into(),
                ver: 1,
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ClientPushRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 1);
        assert_eq!(back.jobs.len(), 1);
    }
}
