//! Reference worker client for the distributed task scheduler
//!
//! The agent registers itself with the coordination server, advertises the
//! job kinds (and versions) it declares it can run, heartbeats on an
//! interval so the server's `ClientMonitor` considers it alive, and exposes
//! a small dispatch endpoint the server calls into when it has been
//! selected to run a task. This agent does not implement a real execution
//! runtime -- dispatched tasks complete immediately with a synthetic
//! result -- but the registration/heartbeat/dispatch/report round trip is
//! real.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;

use anyhow::{Context, Result};
use axum::{extract::State, routing::post, Json, Router};
use clap::Parser;
use config::ConfigManager;
use shared::api::{
    endpoints, ApiResponse, ClientPushRequest, ClientPushResponse, DispatchRequest,
    DispatchResponse, TaskReportRequest, TaskReportResponse,
};
use shared::config::AgentConfig;
use shared::domain::{ClientRef, ClientStatus, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Command-line arguments for the agent.
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Reference worker client for the task scheduler coordination server", long_about = None)]
struct CliArgs {
    /// Path to the agent configuration file (agent.toml), or a directory
    /// containing one.
    #[arg(value_name = "CONFIG_PATH")]
    config_path: PathBuf,

    /// Override the central server's base URL.
    #[arg(long = "server-url", value_name = "URL")]
    server_url: Option<String>,

    /// Override this agent's own listen address.
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,
}

#[derive(Clone)]
struct AgentState {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
}

/// POST target the server dispatches tasks to. Since this reference agent
/// has no real execution runtime, it immediately reports the task as
/// successful with a synthetic run speed, then returns 200 to the server's
/// dispatch call.
async fn dispatch(
    State(state): State<AgentState>,
    Json(req): Json<DispatchRequest>,
) -> Json<ApiResponse<DispatchResponse>> {
    info!(task_id = req.task_id, group = %req.group_name, "received dispatch");

    let state_for_report = state.clone();
    tokio::spawn(async move {
        // A real worker would execute the job here; this reference
        // implementation completes synthetically and reports back.
        let report = TaskReportRequest {
            task_id: req.task_id,
            group_name: req.group_name.clone(),
            client: ClientRef {
                id: state_for_report.config.agent_id,
                ip: local_ip(&state_for_report.config.listen_address),
                name: state_for_report.config.name.clone(),
            },
            status: TaskStatus::Success,
            progress: 100,
            run_speed_ms: 50,
        };
        if let Err(err) = report_task(&state_for_report, &report).await {
            warn!(task_id = req.task_id, error = %err, "failed to report task completion");
        }
    });

    Json(ApiResponse::success(DispatchResponse { accepted: true }))
}

fn local_ip(listen_address: &str) -> String {
    listen_address
        .rsplit_once(':')
        .map(|(ip, _)| ip.to_string())
        .unwrap_or_else(|| listen_address.to_string())
}

async fn report_task(state: &AgentState, report: &TaskReportRequest) -> Result<()> {
    let url = format!("{}{}", state.config.server_url, endpoints::TASK_REPORT);
    let resp = state.http.post(&url).json(report).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("server rejected task report with status {}", resp.status());
    }
    Ok(())
}

async fn push_client(config: &AgentConfig, http: &reqwest::Client, status: ClientStatus) -> Result<()> {
    let (ip, port) = split_listen_address(&config.listen_address)?;
    let req = ClientPushRequest {
        id: config.agent_id,
        name: config.name.clone(),
        ip,
        port,
        status,
        jobs: config.jobs.clone(),
    };
    let url = format!("{}{}", config.server_url, endpoints::CLIENTS);
    let resp = http
        .post(&url)
        .json(&req)
        .send()
        .await
        .context("failed to reach coordination server")?;
    if !resp.status().is_success() {
        anyhow::bail!("server rejected client push with status {}", resp.status());
    }
    let _body: ApiResponse<ClientPushResponse> = resp.json().await?;
    Ok(())
}

fn split_listen_address(addr: &str) -> Result<(String, u16)> {
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("listen address '{addr}' is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in listen address '{addr}'"))?;
    Ok((ip.to_string(), port))
}

async fn heartbeat_loop(config: Arc<AgentConfig>, http: reqwest::Client, shutdown: tokio::sync::watch::Receiver<bool>) {
    let interval = Duration::from_secs(config.heartbeat_interval_seconds);
    let mut ticker = tokio::time::interval(interval);
    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = push_client(&config, &http, ClientStatus::OnlineSchedulable).await {
                    warn!(error = %err, "heartbeat push failed");
                }
            }
            _ = shutdown.changed() => {
                info!("heartbeat loop received shutdown signal");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "agent.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli = CliArgs::parse();
    info!(config_path = %cli.config_path.display(), "worker client starting up");

    let mut config_manager = match ConfigManager::new(cli.config_path) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to load agent configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Ok(true) = config_manager.apply_overrides(cli.server_url, cli.listen_address) {
        info!("configuration overrides applied and persisted to disk");
    }

    let config = Arc::new(config_manager.agent_config);
    let http = reqwest::Client::new();

    info!(
        agent_id = config.agent_id,
        name = %config.name,
        server_url = %config.server_url,
        "registering with coordination server"
    );
    if let Err(err) = push_client(&config, &http, ClientStatus::OnlineSchedulable).await {
        warn!(error = %err, "initial registration failed, will retry on next heartbeat");
    }

    let state = AgentState {
        config: Arc::clone(&config),
        http: http.clone(),
    };
    let app = Router::new()
        .route(endpoints::DISPATCH, post(dispatch))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind dispatch listener to {}", config.listen_address))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&config), http.clone(), shutdown_rx));

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    info!(listen_address = %config.listen_address, "dispatch endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| anyhow::anyhow!("agent server error: {e}"))?;

    let _ = shutdown_tx.send(true);
    let timeout = Duration::from_secs(config.graceful_shutdown_timeout_seconds);
    if tokio::time::timeout(timeout, heartbeat).await.is_err() {
        warn!("heartbeat loop did not shut down within the timeout");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_listen_address_parses_host_and_port() {
        let (ip, port) = split_listen_address("127.0.0.1:9001").unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, 9001);
    }

    #[test]
    fn split_listen_address_rejects_missing_port() {
        assert!(split_listen_address("127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn dispatch_endpoint_accepts_and_completes_synthetically() {
        let config = Arc::new(AgentConfig {
            agent_id: 1,
            name: "worker-a".into(),
            server_url: "http://127.0.0.1:0".into(),
            listen_address: "127.0.0.1:9001".into(),
            jobs: vec![shared::domain::JobRef {
                name: "demo".into(),
                ver: 1,
            }],
            heartbeat_interval_seconds: 10,
            graceful_shutdown_timeout_seconds: 5,
        });
        let state = AgentState {
            config,
            http: reqwest::Client::new(),
        };
        let req = DispatchRequest {
            task_id: 1,
            group_name: "demo".into(),
            ver: 1,
            caption: "Demo".into(),
            data: Default::default(),
        };
        let response = dispatch(State(state), Json(req)).await;
        assert!(response.0.data.unwrap().accepted);
    }
}
