//! Per-client liveness loop.
//!
//! One of these is spawned for every client registered through `push_client`
//! and torn down the moment that client is observed offline or its
//! cancellation token fires. It owns no mutable state beyond what is already
//! in the registry; each tick reads the current snapshot, calls
//! `check_online`, and persists it.

use crate::registry::ClientRegistry;
use crate::repository::SharedClientRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn run(
    client_id: i64,
    registry: Arc<ClientRegistry>,
    repo: SharedClientRepository,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(client_id, "client monitor cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(handle) = registry.get(client_id) else {
            return;
        };

        let snapshot = handle.client.read().await.clone();
        if snapshot.is_offline() {
            debug!(client_id, "client observed offline, retiring monitor");
            registry.remove(client_id);
            return;
        }

        snapshot.check_online();
        if let Err(err) = repo.save(&snapshot).await {
            warn!(client_id, error = %err, "failed to persist client liveness");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientHandle;
    use crate::repository::SqliteRepository;
    use shared::domain::{Client, ClientStatus};
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn retires_once_client_goes_offline() {
        let dir = tempdir().unwrap();
        let repo: SharedClientRepository =
            Arc::new(SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap());
        let registry = Arc::new(ClientRegistry::new());
        let client = Client {
            id: 1,
            name: "worker-a".into(),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: ClientStatus::Offline,
            jobs: vec![],
            schedule_at: 0,
        };
        registry.push(
            1,
            Arc::new(ClientHandle {
                client: Arc::new(RwLock::new(client)),
                cancel: CancellationToken::new(),
            }),
        );

        run(1, Arc::clone(&registry), repo, Duration::from_millis(1), CancellationToken::new()).await;
        assert!(registry.get(1).is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_immediately() {
        let dir = tempdir().unwrap();
        let repo: SharedClientRepository =
            Arc::new(SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap());
        let registry = Arc::new(ClientRegistry::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = std::time::Instant::now();
        run(1, registry, repo, Duration::from_secs(60), cancel).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
