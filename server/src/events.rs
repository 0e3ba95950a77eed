//! Event handlers for the four points in a task group's lifecycle where the
//! monitor hands off to the outside world while holding the distributed
//! lock: `TaskScheduler` (dispatch), `CheckWorking` (liveness poll),
//! `TaskFinish` (advance to the next fire) and `ClientJoin` (registration).
//!
//! They are behind a trait so the dispatch transport (HTTP to a worker
//! client here) can be swapped without touching the monitor's state machine.

use crate::id_gen::IdGenerator;
use crate::repository::{SharedClientRepository, SharedGroupRepository};
use async_trait::async_trait;
use dashmap::DashMap;
use shared::api::{endpoints, DispatchRequest};
use shared::domain::{Client, ClientStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Shared handles a monitor passes to its event bus at each of the four
/// call sites, bundled so the trait methods stay single-argument.
#[derive(Clone)]
pub struct MonitorContext {
    pub name: String,
    pub group: Arc<Mutex<shared::domain::TaskGroup>>,
    pub local_clients: Arc<DashMap<i64, Client>>,
    pub client_registry: Arc<crate::registry::ClientRegistry>,
    pub cur_client: Arc<RwLock<Option<i64>>>,
    pub updated_tx: mpsc::Sender<()>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn task_scheduler(&self, ctx: MonitorContext);
    async fn check_working(&self, ctx: MonitorContext);
    async fn task_finish(&self, ctx: MonitorContext);
    async fn client_join(&self, client: Client);
}

/// Picks the best client for a task group at version `ver`, falling back to
/// older versions it is still able to run.
pub fn polling_client(group_name: &str, ver: i32, local_clients: &DashMap<i64, Client>) -> Option<Client> {
    for v in (1..=ver.max(0)).rev() {
        let mut best: Option<Client> = None;
        for entry in local_clients.iter() {
            let c = entry.value();
            if c.status != ClientStatus::OnlineSchedulable {
                continue;
            }
            if !c.jobs.iter().any(|j| j.name == group_name && j.ver == v) {
                continue;
            }
            if best.as_ref().map(|b| c.schedule_at < b.schedule_at).unwrap_or(true) {
                best = Some(c.clone());
            }
        }
        if best.is_some() {
            return best;
        }
    }
    None
}

pub struct HttpEventBus {
    http: reqwest::Client,
    group_repo: SharedGroupRepository,
    client_repo: SharedClientRepository,
    id_gen: IdGenerator,
}

impl HttpEventBus {
    pub fn new(group_repo: SharedGroupRepository, client_repo: SharedClientRepository) -> Self {
        Self {
            http: reqwest::Client::new(),
            group_repo,
            client_repo,
            id_gen: IdGenerator::new(),
        }
    }

    /// Stamps `schedule_at` to now on the dispatched client, everywhere a
    /// copy of it is kept, so the least-recently-used tiebreak in
    /// `polling_client` actually rotates across successive dispatches
    /// (spec.md §4.4's "Fair Selection" property) instead of always
    /// re-picking the same client.
    async fn mark_scheduled(&self, ctx: &MonitorContext, client_id: i64) {
        let now = shared::domain::now_millis();

        if let Some(handle) = ctx.client_registry.get(client_id) {
            let mut c = handle.client.write().await;
            c.schedule_at = now;
            let snapshot = c.clone();
            drop(c);
            if let Err(err) = self.client_repo.save(&snapshot).await {
                warn!(client_id, error = %err, "failed to persist client schedule_at after dispatch");
            }
        }

        if let Some(mut entry) = ctx.local_clients.get_mut(&client_id) {
            entry.schedule_at = now;
        }
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn task_scheduler(&self, ctx: MonitorContext) {
        let (group_name, ver, task_id, caption, data) = {
            let g = ctx.group.lock().await;
            (g.name.clone(), g.ver, g.task.id, g.caption.clone(), g.data.clone())
        };

        let Some(client) = polling_client(&group_name, ver, &ctx.local_clients) else {
            debug!(group = %group_name, "no schedulable client available");
            let mut g = ctx.group.lock().await;
            g.schedule_fail();
            drop(g);
            let _ = ctx.updated_tx.try_send(());
            return;
        };

        *ctx.cur_client.write().await = Some(client.id);

        let request = DispatchRequest {
            task_id,
            group_name: group_name.clone(),
            ver,
            caption,
            data,
        };
        let url = format!("http://{}:{}{}", client.ip, client.port, endpoints::DISPATCH);

        let dispatched = match self.http.post(&url).json(&request).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(group = %group_name, client = client.id, status = %resp.status(), "dispatch rejected");
                false
            }
            Err(err) => {
                warn!(group = %group_name, client = client.id, error = %err, "dispatch request failed");
                false
            }
        };

        let mut g = ctx.group.lock().await;
        if dispatched {
            g.set_client(shared::domain::ClientRef {
                id: client.id,
                ip: client.ip.clone(),
                name: client.name.clone(),
            });
        } else {
            g.schedule_fail();
        }
        if let Err(err) = self.group_repo.save(&g).await {
            warn!(group = %group_name, error = %err, "failed to persist group after scheduling attempt");
        }
        drop(g);

        if dispatched {
            self.mark_scheduled(&ctx, client.id).await;
        }
        let _ = ctx.updated_tx.try_send(());
    }

    async fn check_working(&self, ctx: MonitorContext) {
        let cur = *ctx.cur_client.read().await;
        let disappeared = match cur {
            Some(id) => match ctx.client_registry.get(id) {
                Some(handle) => handle.client.read().await.is_not_schedule(),
                None => true,
            },
            None => true,
        };

        if disappeared {
            let mut g = ctx.group.lock().await;
            info!(group = %g.name, "client disappeared mid-task, marking task failed");
            g.client_offline();
            if let Err(err) = self.group_repo.save(&g).await {
                warn!(group = %g.name, error = %err, "failed to persist group after client disappearance");
            }
        }
        let _ = ctx.updated_tx.try_send(());
    }

    async fn task_finish(&self, ctx: MonitorContext) {
        let mut g = ctx.group.lock().await;
        let finished_task = g.task.clone();

        g.run_count += 1;
        let window = g.run_count.min(100).max(1);
        g.run_speed_avg += (finished_task.run_speed - g.run_speed_avg) / window;
        g.last_run_at = shared::domain::now_millis();

        if !g.cron.is_empty() {
            let now = shared::domain::now_millis();
            if let Err(err) = g.calculate_next_at_by_cron(now) {
                warn!(group = %g.name, error = %err, "invalid cron expression, next_at unchanged");
            }
        }

        let next_id = self.id_gen.next_id();
        g.create_task(next_id);
        g.need_save = true;

        if let Err(err) = self.group_repo.save(&g).await {
            warn!(group = %g.name, error = %err, "failed to persist group after task finish");
        } else {
            g.need_save = false;
        }
        let group_name = g.name.clone();
        drop(g);

        if let Err(err) = self.group_repo.record_finished_task(&group_name, &finished_task).await {
            warn!(group = %group_name, error = %err, "failed to record finished task history");
        }
        let _ = ctx.updated_tx.try_send(());
    }

    async fn client_join(&self, client: Client) {
        info!(client_id = client.id, name = %client.name, "client joined");
        if let Err(err) = self.client_repo.save(&client).await {
            warn!(client_id = client.id, error = %err, "failed to persist client on join");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::JobRef;

    fn client(id: i64, schedule_at: i64, ver: i32) -> Client {
        Client {
            id,
            name: format!("worker-{id}"),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: ClientStatus::OnlineSchedulable,
            jobs: vec![JobRef {
                name: "demo".into(),
                ver,
            }],
            schedule_at,
        }
    }

    #[test]
    fn polling_client_prefers_least_recently_scheduled() {
        let clients = DashMap::new();
        clients.insert(1, client(1, 200, 1));
        clients.insert(2, client(2, 100, 1));
        let picked = polling_client("demo", 1, &clients).unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn polling_client_falls_back_to_older_version() {
        let clients = DashMap::new();
        clients.insert(1, client(1, 0, 1));
        let picked = polling_client("demo", 3, &clients).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn polling_client_skips_not_schedulable() {
        let clients = DashMap::new();
        let mut c = client(1, 0, 1);
        c.status = ClientStatus::OnlineNotSchedulable;
        clients.insert(1, c);
        assert!(polling_client("demo", 1, &clients).is_none());
    }

    #[tokio::test]
    async fn mark_scheduled_rotates_the_least_recently_used_pick() {
        use crate::registry::{ClientHandle, ClientRegistry};
        use tempfile::tempdir;
        use tokio_util::sync::CancellationToken;

        let dir = tempdir().unwrap();
        let repo = Arc::new(crate::repository::SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap());
        let bus = HttpEventBus::new(repo.clone(), repo.clone());

        let client_registry = Arc::new(ClientRegistry::new());
        let local_clients = Arc::new(DashMap::new());
        for id in [1, 2] {
            let c = client(id, 0, 1);
            local_clients.insert(id, c.clone());
            client_registry.push(
                id,
                Arc::new(ClientHandle {
                    client: Arc::new(RwLock::new(c)),
                    cancel: CancellationToken::new(),
                }),
            );
        }

        let (tx, _rx) = mpsc::channel(8);
        let ctx = MonitorContext {
            name: "demo".into(),
            group: Arc::new(Mutex::new(shared::domain::TaskGroup::new("demo".into(), 1))),
            local_clients: Arc::clone(&local_clients),
            client_registry: Arc::clone(&client_registry),
            cur_client: Arc::new(RwLock::new(None)),
            updated_tx: tx,
        };

        // Both clients start at schedule_at=0; either could be picked first,
        // but whichever is picked must not be picked again until the other
        // has also had a turn.
        let first = polling_client("demo", 1, &local_clients).unwrap();
        bus.mark_scheduled(&ctx, first.id).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let second = polling_client("demo", 1, &local_clients).unwrap();
        assert_ne!(second.id, first.id, "same client picked twice in a row after being marked scheduled");

        bus.mark_scheduled(&ctx, second.id).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let third = polling_client("demo", 1, &local_clients).unwrap();
        assert_eq!(third.id, first.id, "round robin should cycle back to the first client");

        // The authoritative registry record must reflect the stamped time too.
        let handle = client_registry.get(first.id).unwrap();
        assert!(handle.client.read().await.schedule_at > 0);
    }
}
