//! SQLite-backed persistence for clients and task groups.
//!
//! Uses the same lazy `Connection::open`, WAL mode, busy timeout pattern
//! as the rest of this core's persistence layer, against a small schema:
//! one row per client, one row per task group, and a history table for
//! finished task runs that the retention sweep (`clear_finished_history`)
//! prunes.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use shared::domain::{Client, ClientStatus, JobRef, Task, TaskGroup, TaskStatus};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn save(&self, client: &Client) -> shared::Result<()>;
    async fn to_list(&self) -> shared::Result<Vec<Client>>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn to_list(&self) -> shared::Result<Vec<TaskGroup>>;
    async fn to_entity(&self, name: &str) -> shared::Result<Option<TaskGroup>>;
    async fn save(&self, group: &TaskGroup) -> shared::Result<()>;
    async fn record_finished_task(&self, group_name: &str, task: &Task) -> shared::Result<()>;
    async fn clear_finished_history(&self, retention_days: u32) -> shared::Result<u64>;
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(db_path: &Path) -> shared::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize(conn: &Connection) -> shared::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                jobs_json TEXT NOT NULL,
                schedule_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_groups (
                name TEXT PRIMARY KEY,
                ver INTEGER NOT NULL,
                caption TEXT NOT NULL,
                cron TEXT NOT NULL,
                start_at INTEGER NOT NULL,
                next_at INTEGER NOT NULL,
                activate_at INTEGER NOT NULL,
                last_run_at INTEGER NOT NULL,
                is_enable INTEGER NOT NULL,
                run_speed_avg INTEGER NOT NULL,
                run_count INTEGER NOT NULL,
                data_json TEXT NOT NULL,
                task_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                finished_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_history_finished_at ON task_history(finished_at);",
        )?;
        Ok(())
    }

    fn status_tag(status: ClientStatus) -> &'static str {
        match status {
            ClientStatus::OnlineSchedulable => "online_schedulable",
            ClientStatus::OnlineNotSchedulable => "online_not_schedulable",
            ClientStatus::Offline => "offline",
        }
    }

    fn status_from_tag(tag: &str) -> ClientStatus {
        match tag {
            "online_schedulable" => ClientStatus::OnlineSchedulable,
            "online_not_schedulable" => ClientStatus::OnlineNotSchedulable,
            _ => ClientStatus::Offline,
        }
    }

    fn task_status_tag(status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::None => "none",
            TaskStatus::Scheduling => "scheduling",
            TaskStatus::ScheduleFail => "schedule_fail",
            TaskStatus::Working => "working",
            TaskStatus::Fail => "fail",
            TaskStatus::Success => "success",
        }
    }
}

#[async_trait]
impl ClientRepository for SqliteRepository {
    async fn save(&self, client: &Client) -> shared::Result<()> {
        let jobs_json = serde_json::to_string(&client.jobs)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO clients (id, name, ip, port, status, jobs_json, schedule_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, ip = excluded.ip, port = excluded.port,
                status = excluded.status, jobs_json = excluded.jobs_json,
                schedule_at = excluded.schedule_at",
            params![
                client.id,
                client.name,
                client.ip,
                client.port,
                Self::status_tag(client.status),
                jobs_json,
                client.schedule_at,
            ],
        )?;
        Ok(())
    }

    async fn to_list(&self) -> shared::Result<Vec<Client>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, name, ip, port, status, jobs_json, schedule_at FROM clients")?;
        let rows = stmt.query_map([], |row| {
            let jobs_json: String = row.get(5)?;
            let status_tag: String = row.get(4)?;
            Ok(Client {
                id: row.get(0)?,
                name: row.get(1)?,
                ip: row.get(2)?,
                port: row.get(3)?,
                status: Self::status_from_tag(&status_tag),
                jobs: serde_json::from_str::<Vec<JobRef>>(&jobs_json).unwrap_or_default(),
                schedule_at: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

#[async_trait]
impl GroupRepository for SqliteRepository {
    async fn to_list(&self) -> shared::Result<Vec<TaskGroup>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT data_json, task_json FROM task_groups")?;
        let rows = stmt.query_map([], |row| {
            let data_json: String = row.get(0)?;
            let task_json: String = row.get(1)?;
            Ok((data_json, task_json))
        })?;
        let mut groups = Vec::new();
        for row in rows.filter_map(Result::ok) {
            // The full TaskGroup snapshot lives in task_json; the scalar
            // columns exist for indexed queries (e.g. the retention sweep)
            // rather than reconstruction, so decode from task_json directly.
            if let Ok(group) = serde_json::from_str::<TaskGroup>(&row.1) {
                groups.push(group);
            } else {
                debug!(data_json = %row.0, "skipping unreadable task group row");
            }
        }
        Ok(groups)
    }

    async fn to_entity(&self, name: &str) -> shared::Result<Option<TaskGroup>> {
        let conn = self.conn.lock().await;
        let task_json: Option<String> = conn
            .query_row(
                "SELECT task_json FROM task_groups WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(task_json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    async fn save(&self, group: &TaskGroup) -> shared::Result<()> {
        let data_json = serde_json::to_string(&group.data)?;
        let task_json = serde_json::to_string(group)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_groups (
                name, ver, caption, cron, start_at, next_at, activate_at,
                last_run_at, is_enable, run_speed_avg, run_count, data_json, task_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(name) DO UPDATE SET
                ver = excluded.ver, caption = excluded.caption, cron = excluded.cron,
                start_at = excluded.start_at, next_at = excluded.next_at,
                activate_at = excluded.activate_at, last_run_at = excluded.last_run_at,
                is_enable = excluded.is_enable, run_speed_avg = excluded.run_speed_avg,
                run_count = excluded.run_count, data_json = excluded.data_json,
                task_json = excluded.task_json",
            params![
                group.name,
                group.ver,
                group.caption,
                group.cron,
                group.start_at,
                group.next_at,
                group.activate_at,
                group.last_run_at,
                group.is_enable,
                group.run_speed_avg,
                group.run_count,
                data_json,
                task_json,
            ],
        )?;
        Ok(())
    }

    async fn record_finished_task(&self, group_name: &str, task: &Task) -> shared::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_history (group_name, task_id, status, finished_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                group_name,
                task.id,
                Self::task_status_tag(task.status),
                shared::domain::now_millis(),
            ],
        )?;
        Ok(())
    }

    async fn clear_finished_history(&self, retention_days: u32) -> shared::Result<u64> {
        let cutoff = shared::domain::now_millis() - (retention_days as i64 * 86_400_000);
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM task_history WHERE finished_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, retention_days, "pruned finished task history");
        }
        Ok(removed as u64)
    }
}

pub fn shared_connection_for_lock(db_path: &Path) -> shared::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(30))?;
    Ok(conn)
}

pub type SharedGroupRepository = Arc<dyn GroupRepository>;
pub type SharedClientRepository = Arc<dyn ClientRepository>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn client_round_trips_through_sqlite() {
        let dir = tempdir().unwrap();
        let repo = SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap();
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
        repo.save(&client).await.unwrap();
        let list = ClientRepository::to_list(&repo).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].jobs.len(), 1);
    }

    #[tokio::test]
    async fn group_round_trips_and_history_prunes() {
        let dir = tempdir().unwrap();
        let repo = SqliteRepository::open(&dir.path().join("db.sqlite")).unwrap();
        let group = TaskGroup::new("demo".into(), 1);
        GroupRepository::save(&repo, &group).await.unwrap();
        let fetched = repo.to_entity("demo").await.unwrap();
        assert!(fetched.is_some());

        repo.record_finished_task("demo", &group.task).await.unwrap();
        let removed = repo.clear_finished_history(0).await.unwrap();
        assert_eq!(removed, 1);
    }
}
