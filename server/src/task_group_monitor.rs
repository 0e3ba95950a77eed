//! The four-state loop that drives a single task group from idle through
//! dispatch to completion:
//!
//! ```text
//! None/ScheduleFail --> waitStart --> waitScheduler --> (Scheduling) --+
//!       ^                                                              |
//!       |                                                              v
//!     taskFinish <---------------------------------------- waitWorking
//! ```
//!
//! Every external effect (dispatch, liveness poll, advancing to the next
//! fire) happens behind `DistributedLock::try_lock_run` so only one monitor
//! instance ever mutates a given group's persisted state at a time, even if
//! this process is one of several sharing a database.

use crate::events::{EventBus, MonitorContext};
use crate::lock::{DistributedLock, LockAction};
use crate::registry::TaskGroupHandle;
use shared::domain::{now_millis, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tunable timing knobs, sourced from `ServerConfig`'s observable
/// configuration.
pub struct MonitorIntervals {
    /// How long before `start_at` the scheduler timer is armed.
    pub early_arm: Duration,
    /// Poll period while a task is `Working`.
    pub working_poll: Duration,
    /// Backoff applied after a failed lock acquisition.
    pub lock_miss_backoff: Duration,
}

impl Default for MonitorIntervals {
    fn default() -> Self {
        Self {
            early_arm: Duration::from_secs(2),
            working_poll: Duration::from_secs(5),
            lock_miss_backoff: Duration::from_millis(100),
        }
    }
}

pub struct TaskGroupMonitor {
    name: String,
    ctx: MonitorContext,
    updated_rx: mpsc::Receiver<()>,
    lock: Arc<dyn DistributedLock>,
    event_bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
    intervals: MonitorIntervals,
}

impl TaskGroupMonitor {
    pub fn new(
        name: String,
        handle: &TaskGroupHandle,
        updated_rx: mpsc::Receiver<()>,
        client_registry: Arc<crate::registry::ClientRegistry>,
        lock: Arc<dyn DistributedLock>,
        event_bus: Arc<dyn EventBus>,
        intervals: MonitorIntervals,
    ) -> Self {
        let ctx = MonitorContext {
            name: name.clone(),
            group: Arc::clone(&handle.group),
            local_clients: Arc::clone(&handle.local_clients),
            client_registry,
            cur_client: Arc::clone(&handle.cur_client),
            updated_tx: handle.updated_tx.clone(),
        };
        Self {
            name,
            ctx,
            updated_rx,
            lock,
            event_bus,
            cancel: handle.cancel.clone(),
            intervals,
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            drain_updated(&mut self.updated_rx);

            let status = self.ctx.group.lock().await.task.status;
            match status {
                TaskStatus::None | TaskStatus::ScheduleFail => self.wait_start().await,
                TaskStatus::Scheduling => self.wait_for_updated_or_cancel().await,
                TaskStatus::Working => self.wait_working().await,
                s if s.is_terminal() => self.task_finish().await,
                _ => unreachable!("TaskStatus::is_terminal covers Fail and Success"),
            }
        }
    }

    fn can_schedule_client_count(&self) -> usize {
        self.ctx
            .local_clients
            .iter()
            .filter(|e| e.value().status == shared::domain::ClientStatus::OnlineSchedulable)
            .count()
    }

    async fn wait_for_updated_or_cancel(&mut self) {
        tokio::select! {
            _ = self.updated_rx.recv() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn wait_start(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let (status, is_enable, start_at) = {
                let g = self.ctx.group.lock().await;
                (g.task.status, g.is_enable, g.start_at)
            };
            if !matches!(status, TaskStatus::None | TaskStatus::ScheduleFail) {
                return;
            }
            if !is_enable || self.can_schedule_client_count() == 0 {
                self.wait_for_updated_or_cancel().await;
                continue;
            }

            let delay = (start_at - now_millis()).max(0) as u64;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    self.wait_scheduler().await;
                    return;
                }
                _ = self.updated_rx.recv() => { continue; }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn wait_scheduler(&mut self) {
        let start_at = self.ctx.group.lock().await.task.start_at;
        let fire_at = start_at - self.intervals.early_arm.as_millis() as i64;
        let delay = (fire_at - now_millis()).max(0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                self.try_schedule().await;
            }
            _ = self.updated_rx.recv() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn try_schedule(&mut self) {
        let group = Arc::clone(&self.ctx.group);
        let ctx = self.ctx.clone();
        let event_bus = Arc::clone(&self.event_bus);
        let action: LockAction = Box::pin(async move {
            {
                let mut g = group.lock().await;
                g.task.scheduling();
            }
            event_bus.task_scheduler(ctx).await;
        });

        if !self.lock.try_lock_run(&self.name, action).await {
            tokio::time::sleep(self.intervals.lock_miss_backoff).await;
        }
    }

    async fn wait_working(&mut self) {
        let cur = *self.ctx.cur_client.read().await;
        let cur_ok = match cur {
            Some(id) => match self.ctx.client_registry.get(id) {
                Some(handle) => !handle.client.read().await.is_not_schedule(),
                None => false,
            },
            None => false,
        };

        if !cur_ok {
            self.run_check_working().await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.intervals.working_poll) => {
                self.run_check_working().await;
            }
            _ = self.updated_rx.recv() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn run_check_working(&mut self) {
        let ctx = self.ctx.clone();
        let event_bus = Arc::clone(&self.event_bus);
        let action: LockAction = Box::pin(async move { event_bus.check_working(ctx).await });
        self.lock.try_lock_run(&self.name, action).await;
    }

    async fn task_finish(&mut self) {
        let ctx = self.ctx.clone();
        let event_bus = Arc::clone(&self.event_bus);
        let action: LockAction = Box::pin(async move { event_bus.task_finish(ctx).await });

        if !self.lock.try_lock_run(&self.name, action).await {
            self.wait_for_updated_or_cancel().await;
        }
    }
}

fn drain_updated(rx: &mut mpsc::Receiver<()>) {
    while rx.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MonitorContext;
    use crate::lock::InMemoryDistributedLock;
    use crate::registry::ClientRegistry;
    use dashmap::DashMap;
    use shared::domain::TaskGroup;
    use tokio::sync::{Mutex, RwLock};

    struct CountingBus {
        scheduled: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventBus for CountingBus {
        async fn task_scheduler(&self, ctx: MonitorContext) {
            self.scheduled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut g = ctx.group.lock().await;
            g.schedule_fail();
            let _ = ctx.updated_tx.try_send(());
        }
        async fn check_working(&self, _ctx: MonitorContext) {}
        async fn task_finish(&self, _ctx: MonitorContext) {}
        async fn client_join(&self, _client: shared::domain::Client) {}
    }

    #[tokio::test]
    async fn try_schedule_invokes_event_bus_under_lock() {
        let mut group = TaskGroup::new("demo".into(), 1);
        group.is_enable = true;
        group.start_at = now_millis() - 1000;
        let group = Arc::new(Mutex::new(group));
        let (tx, rx) = mpsc::channel(8);

        let ctx = MonitorContext {
            name: "demo".into(),
            group: Arc::clone(&group),
            local_clients: Arc::new(DashMap::new()),
            client_registry: Arc::new(ClientRegistry::new()),
            cur_client: Arc::new(RwLock::new(None)),
            updated_tx: tx,
        };

        let bus = Arc::new(CountingBus {
            scheduled: std::sync::atomic::AtomicUsize::new(0),
        });
        let lock = Arc::new(InMemoryDistributedLock::new());
        let mut monitor = TaskGroupMonitor {
            name: "demo".into(),
            ctx,
            updated_rx: rx,
            lock,
            event_bus: bus.clone(),
            cancel: CancellationToken::new(),
            intervals: MonitorIntervals::default(),
        };

        monitor.try_schedule().await;
        assert_eq!(bus.scheduled.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(group.lock().await.task.status, TaskStatus::ScheduleFail);
    }
}
