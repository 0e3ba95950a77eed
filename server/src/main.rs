//! Distributed task scheduler coordination server
//!
//! The central server tracks a fleet of worker clients and the task groups
//! they execute, deciding when each group's next task fires and which
//! online client should run it. This binary wires the `Coordinator` (the
//! registries, monitor loops, distributed lock, and event bus) to an axum
//! ingress API and a couple of periodic maintenance tasks, then runs until
//! a shutdown signal arrives.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod api;
mod client_monitor;
mod config;
mod core;
mod events;
mod id_gen;
mod lock;
mod registry;
mod repository;
mod task_group_monitor;

use config::ConfigManager;
use core::Coordinator;
use events::HttpEventBus;
use lock::SqliteDistributedLock;
use repository::{ClientRepository, GroupRepository, SqliteRepository};
use task_group_monitor::MonitorIntervals;

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Coordination server for a fleet of task-scheduler worker clients", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml), or a directory
    /// containing one.
    #[arg(value_name = "CONFIG_PATH")]
    config_path: PathBuf,

    /// Override the listen address from the config file.
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the SQLite database path from the config file.
    #[arg(long = "database-path", value_name = "PATH")]
    database_path: Option<String>,
}

struct Server {
    config_manager: ConfigManager,
    listen_address: SocketAddr,
    coordinator: Arc<Coordinator>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Server {
    async fn new(cli: CliArgs) -> Result<Self> {
        let mut config_manager = ConfigManager::new(cli.config_path)?;
        if config_manager
            .apply_overrides(cli.listen_address, cli.database_path)
            .context("failed to apply configuration overrides")?
        {
            info!("configuration overrides applied and persisted to disk");
        }

        let server_config = config_manager.server_config.clone();
        let listen_address: SocketAddr = server_config
            .listen_address
            .parse()
            .with_context(|| format!("invalid listen address '{}'", server_config.listen_address))?;

        let db_path = PathBuf::from(&server_config.database_path);
        let repo = Arc::new(
            SqliteRepository::open(&db_path).context("failed to open coordination database")?,
        );
        let client_repo: Arc<dyn ClientRepository> = repo.clone();
        let group_repo: Arc<dyn GroupRepository> = repo;

        let lock_conn = repository::shared_connection_for_lock(&db_path)
            .context("failed to open distributed lock database connection")?;
        let lock = Arc::new(
            SqliteDistributedLock::new(
                lock_conn,
                std::time::Duration::from_millis(server_config.lock_lease_ms),
            )
            .context("failed to initialize distributed lock")?,
        );

        let event_bus = Arc::new(HttpEventBus::new(group_repo.clone(), client_repo.clone()));

        let coordinator = Arc::new(Coordinator::new(
            client_repo,
            group_repo,
            lock,
            event_bus,
            &server_config,
        ));

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Ok(Self {
            config_manager,
            listen_address,
            coordinator,
            shutdown_tx,
            background_tasks: Vec::new(),
        })
    }

    async fn run(&mut self) -> Result<()> {
        let server_config = self.config_manager.server_config.clone();

        info!(listen_address = %self.listen_address, database_path = %server_config.database_path, "starting coordination server");

        self.coordinator
            .restore()
            .await
            .context("failed to restore clients and task groups from the repository")?;
        info!(
            clients = self.coordinator.client_count(),
            task_groups = self.coordinator.task_group_count(),
            "restored prior state"
        );

        let retention_interval =
            std::time::Duration::from_secs(server_config.history_cleanup_interval_seconds);
        let retention_days = server_config.task_history_retention_days;
        let coordinator_for_sweep = Arc::clone(&self.coordinator);
        let mut sweep_shutdown_rx = self.shutdown_tx.subscribe();
        self.background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(retention_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        coordinator_for_sweep.run_history_retention_sweep(retention_days).await;
                    }
                    _ = sweep_shutdown_rx.recv() => {
                        info!("history retention sweep task received shutdown signal");
                        break;
                    }
                }
            }
        }));

        let app_state = api::AppState::new(Arc::clone(&self.coordinator), server_config.api_key.clone());
        let app = api::create_router(app_state.clone());

        let rate_limiter_for_sweep = app_state.rate_limiter.clone();
        let mut rate_limiter_shutdown_rx = self.shutdown_tx.subscribe();
        self.background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        rate_limiter_for_sweep.cleanup_stale_entries().await;
                    }
                    _ = rate_limiter_shutdown_rx.recv() => {
                        info!("rate limiter cleanup task received shutdown signal");
                        break;
                    }
                }
            }
        }));

        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("failed to bind TCP listener to {}", self.listen_address))?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_signal = async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP server received shutdown signal");
        };

        info!(listen_address = %self.listen_address, "ingress API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("shutting down coordination server gracefully");
        let timeout = std::time::Duration::from_secs(
            self.config_manager.server_config.graceful_shutdown_timeout_seconds,
        );

        let _ = self.shutdown_tx.send(());
        for handle in self.background_tasks.drain(..) {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("background task did not shut down within the timeout, abandoning it");
            }
        }
        info!("coordination server shutdown complete");
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to register signal handlers: {e}, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli = CliArgs::parse();
    info!(config_path = %cli.config_path.display(), "coordination server starting up");

    let mut server = match Server::new(cli).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {e}");
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    Ok(())
}
