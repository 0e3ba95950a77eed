//! Process-wide registries for clients and task groups.
//!
//! These are the only two process-wide mutable collections in the server:
//! a `ClientRegistry` keyed by client id and a `TaskGroupRegistry` keyed
//! by group name. Both are
//! backed by `dashmap` for fine-grained concurrent read/write access, and
//! both expose only `push` / `get` / `remove` / `count` so the locking
//! discipline stays localized here.

use dashmap::DashMap;
use shared::domain::Client;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Everything a client's liveness loop and any interested group monitor need
/// to observe about a registered client.
pub struct ClientHandle {
    pub client: Arc<RwLock<Client>>,
    pub cancel: CancellationToken,
}

/// Process-wide client dictionary. Mutated only through `pushClient`.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<i64, Arc<ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn push(&self, id: i64, handle: Arc<ClientHandle>) {
        self.clients.insert(id, handle);
    }

    pub fn get(&self, id: i64) -> Option<Arc<ClientHandle>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: i64) -> Option<Arc<ClientHandle>> {
        self.clients.remove(&id).map(|(_, handle)| handle)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.clients.contains_key(&id)
    }

    /// A point-in-time copy of every registered client, used by the
    /// `ClientUpdate` fan-out to find groups interested in a given job name.
    pub fn snapshot(&self) -> Vec<Client> {
        let mut out = Vec::with_capacity(self.clients.len());
        for entry in self.clients.iter() {
            if let Ok(c) = entry.value().client.try_read() {
                out.push(c.clone());
            }
        }
        out
    }
}

/// The per-group state a `TaskGroupMonitor` shares with the ingress API
/// (for version pushes) and the `ClientUpdate` fan-out (for the
/// denormalized local client set).
pub struct TaskGroupHandle {
    pub group: Arc<Mutex<shared::domain::TaskGroup>>,
    pub local_clients: Arc<DashMap<i64, Client>>,
    pub cur_client: Arc<RwLock<Option<i64>>>,
    pub updated_tx: tokio::sync::mpsc::Sender<()>,
    pub cancel: CancellationToken,
}

/// Process-wide task group dictionary. Mutated only through `pushTaskGroup`.
#[derive(Default)]
pub struct TaskGroupRegistry {
    groups: DashMap<String, Arc<TaskGroupHandle>>,
}

impl TaskGroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    pub fn push(&self, name: String, handle: Arc<TaskGroupHandle>) {
        self.groups.insert(name, handle);
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskGroupHandle>> {
        self.groups.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Cancels the group's monitor and drops it from the registry. Not wired
    /// to any ingress endpoint today (no deletion API is specified), but the
    /// primitive exists so a group monitor is not immortal by construction.
    pub fn remove(&self, name: &str) -> Option<Arc<TaskGroupHandle>> {
        let removed = self.groups.remove(name).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.cancel.cancel();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }

    pub fn enabled_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|e| e.value().group.try_lock().map(|g| g.is_enable).unwrap_or(false))
            .count()
    }

    /// Every registered group handle, used by the `ClientUpdate` fan-out to
    /// also drop a client from groups it no longer declares a job for.
    pub fn all(&self) -> Vec<(String, Arc<TaskGroupHandle>)> {
        self.groups
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client() -> Client {
        Client {
            id: 1,
            name: "worker-a".into(),
            ip: "127.0.0.1".into(),
            port: 9000,
            status: shared::domain::ClientStatus::OnlineSchedulable,
            jobs: vec![],
            schedule_at: 0,
        }
    }

    #[test]
    fn client_registry_push_get_remove_round_trips() {
        let registry = ClientRegistry::new();
        let handle = Arc::new(ClientHandle {
            client: Arc::new(RwLock::new(sample_client())),
            cancel: CancellationToken::new(),
        });
        registry.push(1, handle);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(1).is_some());
        assert!(registry.remove(1).is_some());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn task_group_registry_count_and_remove() {
        let registry = TaskGroupRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let handle = Arc::new(TaskGroupHandle {
            group: Arc::new(Mutex::new(shared::domain::TaskGroup::new("demo".into(), 1))),
            local_clients: Arc::new(DashMap::new()),
            cur_client: Arc::new(RwLock::new(None)),
            updated_tx: tx,
            cancel: CancellationToken::new(),
        });
        registry.push("demo".into(), handle);
        assert_eq!(registry.count(), 1);
        assert!(registry.remove("demo").is_some());
        assert_eq!(registry.count(), 0);
    }
}
