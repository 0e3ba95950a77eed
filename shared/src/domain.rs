//! Domain entities for the task scheduler coordination core
//!
//! `Client`, `TaskGroup` and `Task` are pure data with small state-transition
//! methods — no I/O, no locking, no network calls. The monitors in the
//! `server` crate are the only code that drives these transitions; this
//! module only describes what a valid transition looks like.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Online/offline and schedulability of a registered worker client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Online and eligible to receive dispatched tasks.
    OnlineSchedulable,
    /// Online but temporarily excluded from dispatch (e.g. draining).
    OnlineNotSchedulable,
    /// Not reachable; its monitor is torn down and it is removed from the registry.
    Offline,
}

/// A job kind a client declares it can execute, and at which version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRef {
    pub name: String,
    pub ver: i32,
}

/// A registered worker client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub status: ClientStatus,
    pub jobs: Vec<JobRef>,
    /// Wall-clock time (ms since epoch) of the last task dispatched to this client.
    /// Used as the least-recently-used tiebreak in `PollingClient`.
    pub schedule_at: i64,
}

impl Client {
    pub fn is_offline(&self) -> bool {
        self.status == ClientStatus::Offline
    }

    /// Offline or explicitly marked not-schedulable.
    pub fn is_not_schedule(&self) -> bool {
        matches!(
            self.status,
            ClientStatus::Offline | ClientStatus::OnlineNotSchedulable
        )
    }

    /// Refreshes the liveness timestamp implicitly carried by `schedule_at`
    /// not changing; callers record the actual "last seen" time in the
    /// client repository. This only exists so the liveness loop has
    /// something concrete to call, mirroring the original `CheckOnline`.
    pub fn check_online(&self) {}
}

/// A reference to the client a task was dispatched to, captured at dispatch
/// time so the task record survives the client later going offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRef {
    pub id: i64,
    pub ip: String,
    pub name: String,
}

/// Lifecycle status of a single task firing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    None,
    Scheduling,
    ScheduleFail,
    Working,
    Fail,
    Success,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Fail | TaskStatus::Success)
    }
}

/// A single fire of a task group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub ver: i32,
    pub name: String,
    pub caption: String,
    pub start_at: i64,
    pub run_at: i64,
    pub scheduler_at: i64,
    pub create_at: i64,
    pub status: TaskStatus,
    pub client: ClientRef,
    pub progress: u8,
    pub run_speed: i64,
    pub data: HashMap<String, String>,
}

impl Task {
    /// A placeholder task with no identity, used before the first
    /// `TaskGroup::create_task` call populates the slot.
    fn empty() -> Self {
        Task {
            id: 0,
            ver: 0,
            name: String::new(),
            caption: String::new(),
            start_at: 0,
            run_at: 0,
            scheduler_at: 0,
            create_at: 0,
            status: TaskStatus::None,
            client: ClientRef::default(),
            progress: 0,
            run_speed: 0,
            data: HashMap::new(),
        }
    }

    pub fn scheduling(&mut self) {
        self.status = TaskStatus::Scheduling;
    }

    pub fn schedule_fail(&mut self) {
        self.status = TaskStatus::ScheduleFail;
    }

    pub fn set_fail(&mut self) {
        self.status = TaskStatus::Fail;
    }

    pub fn set_success(&mut self) {
        self.status = TaskStatus::Success;
    }
}

/// A named, versioned, recurring job definition and its one live task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub name: String,
    pub ver: i32,
    pub task: Task,
    pub caption: String,
    pub data: HashMap<String, String>,
    pub start_at: i64,
    pub next_at: i64,
    pub cron: String,
    pub activate_at: i64,
    pub last_run_at: i64,
    pub is_enable: bool,
    pub run_speed_avg: i64,
    pub run_count: i64,
    #[serde(default)]
    pub need_save: bool,
}

impl TaskGroup {
    /// Creates a brand new, disabled task group with an empty task slot.
    pub fn new(name: String, ver: i32) -> Self {
        TaskGroup {
            name,
            ver,
            task: Task::empty(),
            caption: String::new(),
            data: HashMap::new(),
            start_at: 0,
            next_at: 0,
            cron: String::new(),
            activate_at: now_millis(),
            last_run_at: 0,
            is_enable: false,
            run_speed_avg: 0,
            run_count: 0,
            need_save: false,
        }
    }

    /// Accepts an incoming version update only if it is exactly one greater
    /// than the current version; older or skipped versions are no-ops.
    pub fn update_ver(
        &mut self,
        name: String,
        caption: String,
        ver: i32,
        cron: String,
        start_at: i64,
        enable: bool,
    ) {
        if self.ver + 1 == ver {
            self.name = name;
            self.caption = caption;
            self.ver = ver;
            self.cron = cron;
            self.start_at = start_at;
            self.is_enable = enable;
            self.need_save = true;
        }
    }

    /// Replaces the live task with a fresh one, inheriting the group's
    /// version and `Data`, scheduled to fire at `next_at`.
    pub fn create_task(&mut self, id: i64) {
        self.task = Task {
            id,
            ver: self.ver,
            name: self.name.clone(),
            caption: self.caption.clone(),
            start_at: self.next_at,
            run_at: 0,
            scheduler_at: 0,
            create_at: now_millis(),
            status: TaskStatus::None,
            client: ClientRef::default(),
            progress: 0,
            run_speed: 0,
            data: self.data.clone(),
        };
    }

    /// Assigns a dispatched client to the live task and transitions it to
    /// `Working`.
    pub fn set_client(&mut self, client: ClientRef) {
        self.task.client = client;
        self.task.status = TaskStatus::Working;
        let now = now_millis();
        self.task.scheduler_at = now;
        self.task.run_at = now;
    }

    pub fn schedule_fail(&mut self) {
        self.task.schedule_fail();
    }

    /// A client running this group's current task has gone offline.
    pub fn client_offline(&mut self) {
        self.task.set_fail();
    }

    /// `CanScheduler()` per spec.md §3: the task is in a schedulable state,
    /// the group is enabled, and both `start_at` and `next_at` have passed.
    pub fn can_scheduler(&self, now: i64) -> bool {
        matches!(self.task.status, TaskStatus::None | TaskStatus::ScheduleFail)
            && self.is_enable
            && now >= self.start_at
            && now >= self.next_at
    }

    /// Sets `next_at` to an explicit absolute timestamp, ignoring
    /// non-positive values (the "unset" sentinel).
    pub fn calculate_next_at_by_unix(&mut self, timestamp_ms: i64) {
        if timestamp_ms > 0 {
            self.next_at = timestamp_ms;
        }
    }

    /// Advances `next_at` using the group's cron expression, only when the
    /// current time has already passed the previous `next_at`. Parse
    /// failures are the caller's responsibility to log; `next_at` is left
    /// unchanged on error (spec.md §7, `InvalidCron`).
    pub fn calculate_next_at_by_cron(&mut self, now: i64) -> Result<(), cron::error::Error> {
        if now <= self.next_at {
            return Ok(());
        }
        use std::str::FromStr;
        // `cron::Schedule` parses 6/7-field expressions (seconds required); spec.md §3
        // calls for standard 5-field semantics (minute hour day-of-month month
        // day-of-week), the same as the original's `cron.ParseStandard`. Prepending a
        // fixed seconds field of 0 reproduces that semantics on top of this crate's
        // 6/7-field parser.
        let standard = format!("0 {}", self.cron);
        let schedule = cron::Schedule::from_str(&standard)?;
        let now_dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now)
            .unwrap_or_else(chrono::Utc::now);
        if let Some(next) = schedule.after(&now_dt).next() {
            self.next_at = next.timestamp_millis();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group() -> TaskGroup {
        let mut g = TaskGroup::new("demo".to_string(), 1);
        g.is_enable = true;
        g
    }

    #[test]
    fn update_ver_accepts_only_next_version() {
        let mut g = sample_group();
        g.update_ver("demo".into(), "Demo".into(), 3, "* * * * *".into(), 0, true);
        assert_eq!(g.ver, 1, "skipped version must be a no-op");

        g.update_ver("demo".into(), "Demo".into(), 2, "* * * * *".into(), 0, true);
        assert_eq!(g.ver, 2);
        assert_eq!(g.caption, "Demo");
    }

    #[test]
    fn create_task_inherits_group_version_and_next_at() {
        let mut g = sample_group();
        g.ver = 4;
        g.next_at = 12345;
        g.create_task(99);
        assert_eq!(g.task.id, 99);
        assert_eq!(g.task.ver, 4);
        assert_eq!(g.task.start_at, 12345);
        assert_eq!(g.task.status, TaskStatus::None);
    }

    #[test]
    fn can_scheduler_requires_enable_and_elapsed_times() {
        let mut g = sample_group();
        g.start_at = 100;
        g.next_at = 100;
        assert!(g.can_scheduler(200));
        assert!(!g.can_scheduler(50));

        g.is_enable = false;
        assert!(!g.can_scheduler(200));
    }

    #[test]
    fn set_client_transitions_to_working() {
        let mut g = sample_group();
        g.create_task(1);
        g.set_client(ClientRef {
            id: 7,
            ip: "10.0.0.1".into(),
            name: "worker-a".into(),
        });
        assert_eq!(g.task.status, TaskStatus::Working);
        assert_eq!(g.task.client.id, 7);
    }

    #[test]
    fn client_is_not_schedule_covers_offline_and_not_schedulable() {
        let mut c = Client {
            id: 1,
            name: "a".into(),
            ip: "127.0.0.1".into(),
            port: 1,
            status: ClientStatus::OnlineSchedulable,
            jobs: vec![],
            schedule_at: 0,
        };
        assert!(!c.is_not_schedule());
        c.status = ClientStatus::OnlineNotSchedulable;
        assert!(c.is_not_schedule());
        c.status = ClientStatus::Offline;
        assert!(c.is_not_schedule());
        assert!(c.is_offline());
    }

    #[test]
    fn calculate_next_at_by_cron_advances_monotonically() {
        let mut g = sample_group();
        g.cron = "*/5 * * * *".to_string();
        g.next_at = 0;
        let t0 = 1_000_000_000_000; // arbitrary reference instant
        g.calculate_next_at_by_cron(t0).unwrap();
        let first = g.next_at;
        assert!(first > t0);

        g.calculate_next_at_by_cron(first + 1).unwrap();
        let second = g.next_at;
        assert!(second > first, "next_at must strictly increase");
    }

    #[test]
    fn calculate_next_at_by_cron_is_noop_before_next_at() {
        let mut g = sample_group();
        g.next_at = 1_000_000;
        g.cron = "*/5 * * * *".to_string();
        g.calculate_next_at_by_cron(500_000).unwrap();
        assert_eq!(g.next_at, 1_000_000);
    }
}
