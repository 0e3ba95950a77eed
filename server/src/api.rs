//! REST API implementation for the coordination server
//!
//! This module provides the ingress HTTP endpoints worker clients use to
//! register (`pushClient`), declare/update a task group (`pushTaskGroup`),
//! and report task progress, plus a small `/health` introspection surface
//! exposing client and task group counts. Each public function corresponds
//! to one endpoint and is responsible for validating the request, calling
//! into the `Coordinator`, and returning a consistently-shaped JSON
//! response.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    endpoints, ApiResponse, ClientPushRequest, ClientPushResponse, TaskGroupPushRequest,
    TaskGroupPushResponse, TaskReportRequest, TaskReportResponse,
};
use shared::domain::{Client, TaskStatus};
use shared::utils::validate_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::Coordinator;

/// Simple rate limiter per client id, so a mis-behaving worker can't flood
/// the ingress API with registration or report spam.
pub struct ClientRateLimiter {
    limits: Arc<RwLock<HashMap<i64, Vec<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl ClientRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    pub async fn check(&self, client_id: i64) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut limits = self.limits.write().await;
        let requests = limits.entry(client_id).or_insert_with(Vec::new);
        requests.retain(|&t| now.duration_since(t) < self.window);

        if requests.len() >= self.max_requests {
            warn!(client_id, count = requests.len(), "rate limit exceeded");
            return Err(ApiError::TooManyRequests);
        }
        requests.push(now);
        Ok(())
    }

    pub async fn cleanup_stale_entries(&self) {
        let mut limits = self.limits.write().await;
        let now = Instant::now();
        let before = limits.len();
        limits.retain(|_, timestamps| {
            timestamps.retain(|&t| now.duration_since(t) < self.window);
            !timestamps.is_empty()
        });
        let removed = before.saturating_sub(limits.len());
        if removed > 0 {
            debug!(removed, "cleaned up stale rate limiter entries");
        }
    }
}

impl Clone for ClientRateLimiter {
    fn clone(&self) -> Self {
        Self {
            limits: Arc::clone(&self.limits),
            window: self.window,
            max_requests: self.max_requests,
        }
    }
}

/// Application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub api_key: String,
    pub rate_limiter: ClientRateLimiter,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, api_key: String) -> Self {
        Self {
            coordinator,
            api_key,
            rate_limiter: ClientRateLimiter::new(Duration::from_secs(60), 120),
        }
    }

    fn check_api_key(&self, provided: Option<&str>) -> Result<(), ApiError> {
        if self.api_key.is_empty() {
            return Ok(());
        }
        match provided {
            Some(key) if key == self.api_key => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::CLIENTS, post(push_client))
        .route(endpoints::GROUPS, post(push_task_group))
        .route(endpoints::TASK_REPORT, post(report_task))
        .route("/health", get(health))
        .with_state(state)
}

async fn push_client(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<ClientPushRequest>,
) -> Result<Json<ApiResponse<ClientPushResponse>>, ApiError> {
    state.check_api_key(headers.get("x-api-key").and_then(|v| v.to_str().ok()))?;
    state.rate_limiter.check(req.id).await?;

    let client = Client {
        id: req.id,
        name: req.name,
        ip: req.ip,
        port: req.port,
        status: req.status,
        jobs: req.jobs,
        schedule_at: 0,
    };
    info!(client_id = client.id, name = %client.name, "client push received");
    state.coordinator.push_client(client).await;

    Ok(Json(ApiResponse::success(ClientPushResponse {
        accepted: true,
    })))
}

async fn push_task_group(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<TaskGroupPushRequest>,
) -> Result<Json<ApiResponse<TaskGroupPushResponse>>, ApiError> {
    state.check_api_key(headers.get("x-api-key").and_then(|v| v.to_str().ok()))?;
    validate_name(&req.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    info!(group = %req.name, ver = req.ver, "task group push received");
    state
        .coordinator
        .push_task_group(
            req.name,
            req.caption,
            req.ver,
            req.cron,
            req.start_at,
            req.next_at,
            req.is_enable,
        )
        .await;

    Ok(Json(ApiResponse::success(TaskGroupPushResponse {
        accepted: true,
    })))
}

/// A client reports task progress or a terminal result. Terminal statuses
/// drive the group's monitor into `taskFinish` on its next observation; the
/// monitor itself decides what "next" means, this handler only mutates the
/// shared `Task`.
async fn report_task(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<TaskReportRequest>,
) -> Result<Json<ApiResponse<TaskReportResponse>>, ApiError> {
    state.check_api_key(headers.get("x-api-key").and_then(|v| v.to_str().ok()))?;

    let Some(handle) = state.coordinator.task_group_registry.get(&req.group_name) else {
        return Err(ApiError::BadRequest(format!(
            "unknown task group '{}'",
            req.group_name
        )));
    };

    let mut group = handle.group.lock().await;
    if group.task.id != req.task_id {
        debug!(
            group = %req.group_name,
            reported = req.task_id,
            current = group.task.id,
            "stale task report ignored"
        );
        return Ok(Json(ApiResponse::success(TaskReportResponse {
            accepted: false,
        })));
    }

    group.task.progress = req.progress;
    group.task.run_speed = req.run_speed_ms;
    match req.status {
        TaskStatus::Success => group.task.set_success(),
        TaskStatus::Fail => group.task.set_fail(),
        _ => {}
    }
    drop(group);
    let _ = handle.updated_tx.try_send(());

    Ok(Json(ApiResponse::success(TaskReportResponse {
        accepted: true,
    })))
}

#[derive(serde::Serialize)]
struct HealthResponse {
    client_count: usize,
    task_group_count: usize,
    task_group_enable_count: usize,
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        client_count: state.coordinator.client_count(),
        task_group_count: state.coordinator.task_group_count(),
        task_group_enable_count: state.coordinator.task_group_enable_count(),
    }))
}

/// Custom error types for the API, converted into a consistently-shaped JSON
/// response by `IntoResponse`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("too many requests")]
    TooManyRequests,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        };
        let body = Json(ApiResponse::<()>::error(self.to_string()));
        (status, body).into_response()
    }
}
