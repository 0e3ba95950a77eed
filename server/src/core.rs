//! Wires the registries, the distributed lock, the event bus and the
//! repositories together and exposes the two ingress operations the API
//! layer calls: `push_client` and `push_task_group`.
//!
//! One place owns every collaborator and hands out `Arc` clones to
//! whoever needs them, rather than each module reaching for global state.

use crate::client_monitor;
use crate::events::EventBus;
use crate::id_gen::IdGenerator;
use crate::lock::DistributedLock;
use crate::registry::{ClientHandle, ClientRegistry, TaskGroupHandle, TaskGroupRegistry};
use crate::repository::{ClientRepository, GroupRepository};
use crate::task_group_monitor::{MonitorIntervals, TaskGroupMonitor};
use dashmap::DashMap;
use shared::config::ServerConfig;
use shared::domain::{Client, TaskGroup};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Coordinator {
    pub client_registry: Arc<ClientRegistry>,
    pub task_group_registry: Arc<TaskGroupRegistry>,
    pub client_repo: Arc<dyn ClientRepository>,
    pub group_repo: Arc<dyn GroupRepository>,
    pub lock: Arc<dyn DistributedLock>,
    pub event_bus: Arc<dyn EventBus>,
    pub id_gen: IdGenerator,
    pub client_liveness_interval: Duration,
    pub monitor_intervals: MonitorIntervals,
    pub updated_channel_capacity: usize,
}

impl Coordinator {
    pub fn new(
        client_repo: Arc<dyn ClientRepository>,
        group_repo: Arc<dyn GroupRepository>,
        lock: Arc<dyn DistributedLock>,
        event_bus: Arc<dyn EventBus>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            client_registry: Arc::new(ClientRegistry::new()),
            task_group_registry: Arc::new(TaskGroupRegistry::new()),
            client_repo,
            group_repo,
            lock,
            event_bus,
            id_gen: IdGenerator::new(),
            client_liveness_interval: Duration::from_secs(config.liveness_check_interval_seconds),
            monitor_intervals: MonitorIntervals {
                early_arm: Duration::from_millis(config.early_arm_ms),
                working_poll: Duration::from_secs(config.working_poll_interval_seconds),
                lock_miss_backoff: Duration::from_millis(config.lock_miss_backoff_ms),
            },
            updated_channel_capacity: config.updated_channel_capacity,
        }
    }

    /// Loads every previously persisted group and client back into the
    /// registries and spawns their monitors, so a restart resumes exactly
    /// where the process left off.
    pub async fn restore(self: &Arc<Self>) -> shared::Result<()> {
        for client in self.client_repo.to_list().await? {
            self.push_client(client).await;
        }
        for group in self.group_repo.to_list().await? {
            self.push_task_group_entity(group).await;
        }
        Ok(())
    }

    /// Registers or refreshes a worker client, spawning its liveness
    /// monitor on first sight, tearing it down
    /// the moment it is observed offline, and fanning the update out to
    /// every task group it declares a job for.
    pub async fn push_client(self: &Arc<Self>, c: Client) {
        let id = c.id;
        let existing = self.client_registry.get(id);

        // Step 1: an offline client we have never seen is a no-op.
        if existing.is_none() && c.is_offline() {
            return;
        }

        let status_changed = match &existing {
            Some(handle) => handle.client.read().await.status != c.status,
            None => true,
        };

        match &existing {
            Some(handle) => {
                *handle.client.write().await = c.clone();
            }
            None => {
                let cancel = CancellationToken::new();
                let handle = Arc::new(ClientHandle {
                    client: Arc::new(RwLock::new(c.clone())),
                    cancel: cancel.clone(),
                });
                self.client_registry.push(id, Arc::clone(&handle));
                self.event_bus.client_join(c.clone()).await;

                let registry = Arc::clone(&self.client_registry);
                let repo = Arc::clone(&self.client_repo);
                let interval = self.client_liveness_interval;
                tokio::spawn(async move {
                    client_monitor::run(id, registry, repo, interval, cancel).await;
                });
            }
        }

        if let Err(err) = self.client_repo.save(&c).await {
            tracing::warn!(client_id = id, error = %err, "failed to persist client on push");
        }

        if status_changed {
            self.fan_out_client_update(&c);
        }

        // Step 5: tearing down on an offline transition cancels the
        // liveness loop immediately rather than waiting for its next tick
        // to observe `is_offline()` on its own.
        if c.is_offline() {
            if let Some(handle) = self.client_registry.remove(id) {
                handle.cancel.cancel();
            }
        }
    }

    /// Every registered group either upserts or drops this client from
    /// its denormalized local set,
    /// depending on whether the client still declares a matching job, and
    /// nudges the group's monitor via the `updated` channel either way.
    fn fan_out_client_update(&self, c: &Client) {
        for (name, handle) in self.task_group_registry.all() {
            let relevant = !c.is_not_schedule() && c.jobs.iter().any(|j| j.name == name);
            if relevant {
                handle.local_clients.insert(c.id, c.clone());
            } else {
                handle.local_clients.remove(&c.id);
            }
            let _ = handle.updated_tx.try_send(());
        }
    }

    /// Creates the group and its monitor on first sight, or applies a
    /// monotonic version bump to an existing one. `next_at` carries the
    /// explicit-schedule alternative to a cron expression (spec.md §3): when
    /// present, it is applied via `calculate_next_at_by_unix` regardless of
    /// whether this is a create or an update.
    pub async fn push_task_group(
        self: &Arc<Self>,
        name: String,
        caption: String,
        ver: i32,
        cron: String,
        start_at: i64,
        next_at: Option<i64>,
        enable: bool,
    ) {
        match self.task_group_registry.get(&name) {
            Some(handle) => {
                let mut g = handle.group.lock().await;
                g.update_ver(name.clone(), caption, ver, cron, start_at, enable);
                if let Some(next_at) = next_at {
                    g.calculate_next_at_by_unix(next_at);
                    g.need_save = true;
                }
                let needs_save = g.need_save;
                if needs_save {
                    g.need_save = false;
                }
                drop(g);
                if needs_save {
                    let snapshot = handle.group.lock().await.clone();
                    if let Err(err) = self.group_repo.save(&snapshot).await {
                        tracing::warn!(group = %name, error = %err, "failed to persist group version update");
                    }
                }
                let _ = handle.updated_tx.try_send(());
            }
            None => {
                let mut group = TaskGroup::new(name.clone(), ver);
                group.caption = caption;
                group.cron = cron;
                group.start_at = start_at;
                group.is_enable = enable;
                if let Some(next_at) = next_at {
                    group.calculate_next_at_by_unix(next_at);
                }
                group.create_task(self.id_gen.next_id());
                self.spawn_group(group).await;
            }
        }
    }

    async fn push_task_group_entity(self: &Arc<Self>, group: TaskGroup) {
        if self.task_group_registry.get(&group.name).is_none() {
            self.spawn_group(group).await;
        }
    }

    async fn spawn_group(self: &Arc<Self>, group: TaskGroup) {
        let name = group.name.clone();
        if let Err(err) = self.group_repo.save(&group).await {
            tracing::warn!(group = %name, error = %err, "failed to persist newly created group");
        }

        let (tx, rx) = mpsc::channel(self.updated_channel_capacity);
        let cancel = CancellationToken::new();
        let handle = Arc::new(TaskGroupHandle {
            group: Arc::new(Mutex::new(group)),
            local_clients: Arc::new(DashMap::new()),
            cur_client: Arc::new(RwLock::new(None)),
            updated_tx: tx,
            cancel: cancel.clone(),
        });
        self.task_group_registry.push(name.clone(), Arc::clone(&handle));

        // Pull in every client that already declares a job for this group
        // (push_task_group can race ahead of push_client).
        for client in self.client_registry.snapshot() {
            if !client.is_not_schedule() && client.jobs.iter().any(|j| j.name == name) {
                handle.local_clients.insert(client.id, client);
            }
        }

        let monitor = TaskGroupMonitor::new(
            name,
            &handle,
            rx,
            Arc::clone(&self.client_registry),
            Arc::clone(&self.lock),
            Arc::clone(&self.event_bus),
            MonitorIntervals {
                early_arm: self.monitor_intervals.early_arm,
                working_poll: self.monitor_intervals.working_poll,
                lock_miss_backoff: self.monitor_intervals.lock_miss_backoff,
            },
        );
        tokio::spawn(monitor.run());
    }

    pub fn client_count(&self) -> usize {
        self.client_registry.count()
    }

    pub fn task_group_count(&self) -> usize {
        self.task_group_registry.count()
    }

    pub fn task_group_enable_count(&self) -> usize {
        self.task_group_registry.enabled_count()
    }

    /// Sweeps finished task history older than the configured retention
    /// window (supplemented feature, SPEC_FULL.md §3).
    pub async fn run_history_retention_sweep(&self, retention_days: u32) {
        match self.group_repo.clear_finished_history(retention_days).await {
            Ok(removed) if removed > 0 => {
                info!(removed, "history retention sweep removed old task history rows")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "history retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HttpEventBus;
    use crate::lock::InMemoryDistributedLock;
    use crate::repository::SqliteRepository;
    use shared::domain::{ClientStatus, JobRef};
    use tempfile::tempdir;

    async fn build_coordinator() -> (Arc<Coordinator>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap());
        let client_repo: Arc<dyn ClientRepository> = repo.clone();
        let group_repo: Arc<dyn GroupRepository> = repo;
        let event_bus = Arc::new(HttpEventBus::new(group_repo.clone(), client_repo.clone()));
        let lock = Arc::new(InMemoryDistributedLock::new());
        let config = ServerConfig::default();
        let coordinator = Arc::new(Coordinator::new(client_repo, group_repo, lock, event_bus, &config));
        (coordinator, dir)
    }

    #[tokio::test]
    async fn push_client_registers_and_counts() {
        let (coordinator, _dir) = build_coordinator().await;
        let client = Client {
            id: 1,
            name: "worker-a".into(),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: ClientStatus::OnlineSchedulable,
            jobs: vec![JobRef {
                name: "demo".into(),
                ver: 1,
            }],
            schedule_at: 0,
        };
        coordinator.push_client(client).await;
        assert_eq!(coordinator.client_count(), 1);
    }

    #[tokio::test]
    async fn push_task_group_creates_and_updates() {
        let (coordinator, _dir) = build_coordinator().await;
        coordinator
            .push_task_group("demo".into(), "Demo".into(), 1, "* * * * *".into(), 0, None, true)
            .await;
        assert_eq!(coordinator.task_group_count(), 1);
        assert_eq!(coordinator.task_group_enable_count(), 1);

        coordinator
            .push_task_group("demo".into(), "Demo v2".into(), 2, "*/5 * * * *".into(), 0, None, true)
            .await;
        assert_eq!(coordinator.task_group_count(), 1);
    }

    #[tokio::test]
    async fn client_update_fans_out_to_matching_group() {
        let (coordinator, _dir) = build_coordinator().await;
        coordinator
            .push_task_group("demo".into(), "Demo".into(), 1, "* * * * *".into(), 0, None, true)
            .await;
        let client = Client {
            id: 7,
            name: "worker-a".into(),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: ClientStatus::OnlineSchedulable,
            jobs: vec![JobRef {
                name: "demo".into(),
                ver: 1,
            }],
            schedule_at: 0,
        };
        coordinator.push_client(client).await;

        let handle = coordinator.task_group_registry.get("demo").unwrap();
        assert!(handle.local_clients.contains_key(&7));
    }

    #[tokio::test]
    async fn push_task_group_applies_explicit_next_at_without_cron() {
        let (coordinator, _dir) = build_coordinator().await;
        let next_at = shared::domain::now_millis() + 60_000;
        coordinator
            .push_task_group("demo".into(), "Demo".into(), 1, String::new(), 0, Some(next_at), true)
            .await;

        let handle = coordinator.task_group_registry.get("demo").unwrap();
        assert_eq!(handle.group.lock().await.next_at, next_at);

        let bumped_next_at = next_at + 120_000;
        coordinator
            .push_task_group(
                "demo".into(),
                "Demo".into(),
                2,
                String::new(),
                0,
                Some(bumped_next_at),
                true,
            )
            .await;
        assert_eq!(handle.group.lock().await.next_at, bumped_next_at);
    }
}
