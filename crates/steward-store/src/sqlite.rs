use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use steward_core::{
    ApprovalRequest, ApprovalStatus, AuditEvent, DeferredCall, EntityType, Lease, PlanState,
    Result, StewardError, Task, TaskId, TaskStatus,
};

use crate::{
    ApprovalMutation, ApprovalStore, AuditStore, DeferredStore, PlanStore, TaskMutation,
    TaskStore,
};

fn db_err(e: rusqlite::Error) -> StewardError {
    StewardError::Store(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// SQLite-backed store. Records are JSON documents next to the indexed
/// columns that selection and sweeps filter on.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening task store");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                lease_worker TEXT,
                lease_expires INTEGER,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plans (
                task_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                task_id TEXT,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deferred_calls (
                id TEXT PRIMARY KEY,
                backend_id TEXT NOT NULL,
                queued_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_selection ON tasks(status, priority_rank, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status);
            CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log(task_id);
            CREATE INDEX IF NOT EXISTS idx_deferred_backend ON deferred_calls(backend_id, queued_at);
            ",
        )
        .map_err(db_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn write_task(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, status, priority_rank, created_at, lease_worker, lease_expires, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                priority_rank = excluded.priority_rank,
                created_at = excluded.created_at,
                lease_worker = excluded.lease_worker,
                lease_expires = excluded.lease_expires,
                data = excluded.data",
            params![
                task.id.to_string(),
                task.status.as_str(),
                task.priority.rank(),
                task.created_at.timestamp_micros(),
                task.lease.as_ref().map(|l| l.worker_id.clone()),
                task.lease.as_ref().map(|l| l.expires_at.timestamp_micros()),
                to_json(task)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn read_task(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

impl TaskStore for SqliteStore {
    fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.db.lock();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                params![task.id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists {
            return Err(StewardError::Store(format!("task {} already exists", task.id)));
        }
        Self::write_task(&conn, task)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Self::read_task(&self.db.lock(), id)
    }

    fn update_task(&self, id: TaskId, mutation: TaskMutation<'_>) -> Result<Task> {
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut task = Self::read_task(&tx, id)?.ok_or(StewardError::TaskNotFound(id))?;
        mutation(&mut task)?;
        Self::write_task(&tx, &task)?;
        tx.commit().map_err(db_err)?;
        Ok(task)
    }

    fn select_next(
        &self,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let now_us = now.timestamp_micros();
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT data FROM tasks
                 WHERE status = 'needs_action'
                   AND (lease_expires IS NULL OR lease_expires <= ?1)
                 ORDER BY priority_rank ASC, created_at ASC, id ASC
                 LIMIT 1",
                params![now_us],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(raw) = candidate else {
            return Ok(None);
        };
        let mut task: Task = from_json(&raw)?;
        let lease = Lease {
            worker_id: worker_id.to_string(),
            expires_at: now + ttl,
        };
        task.lease = Some(lease.clone());

        // Conditional claim: only succeeds if the row is still free.
        let claimed = tx
            .execute(
                "UPDATE tasks SET lease_worker = ?1, lease_expires = ?2, data = ?3
                 WHERE id = ?4 AND status = 'needs_action'
                   AND (lease_expires IS NULL OR lease_expires <= ?5)",
                params![
                    lease.worker_id,
                    lease.expires_at.timestamp_micros(),
                    to_json(&task)?,
                    task.id.to_string(),
                    now_us,
                ],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        if claimed == 1 {
            debug!(task_id = %task.id, worker = worker_id, "claimed task");
            Ok(Some(task))
        } else {
            Ok(None)
        }
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT data FROM tasks
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY priority_rank ASC, created_at ASC, id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.map(|r| r.map_err(db_err).and_then(|raw| from_json(&raw)))
            .collect()
    }
}

impl PlanStore for SqliteStore {
    fn save_plan(&self, state: &PlanState) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO plans (task_id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![
                state.task_id().to_string(),
                to_json(state)?,
                state.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_plan(&self, task_id: TaskId) -> Result<Option<PlanState>> {
        let conn = self.db.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM plans WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

impl SqliteStore {
    fn write_approval(conn: &Connection, request: &ApprovalRequest) -> Result<()> {
        conn.execute(
            "INSERT INTO approvals (id, task_id, status, created_at, data) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
            params![
                request.id.to_string(),
                request.task_id.to_string(),
                request.status.to_string(),
                request.created_at.timestamp_micros(),
                to_json(request)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn read_approval(conn: &Connection, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM approvals WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

impl ApprovalStore for SqliteStore {
    fn insert_approval(&self, request: &ApprovalRequest) -> Result<()> {
        Self::write_approval(&self.db.lock(), request)
    }

    fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        Self::read_approval(&self.db.lock(), id)
    }

    fn update_approval(&self, id: Uuid, mutation: ApprovalMutation<'_>) -> Result<ApprovalRequest> {
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut request = Self::read_approval(&tx, id)?.ok_or(StewardError::ApprovalNotFound(id))?;
        mutation(&mut request)?;
        Self::write_approval(&tx, &request)?;
        tx.commit().map_err(db_err)?;
        Ok(request)
    }

    fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT data FROM approvals WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.to_string())], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;
        rows.map(|r| r.map_err(db_err).and_then(|raw| from_json(&raw)))
            .collect()
    }
}

impl SqliteStore {
    fn query_events(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AuditEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.map(|r| r.map_err(db_err).and_then(|raw| from_json(&raw)))
            .collect()
    }
}

impl AuditStore for SqliteStore {
    fn append_event(&self, event: &AuditEvent) -> Result<()> {
        let task_id = match event.entity_type {
            EntityType::Task | EntityType::Step | EntityType::Routing => {
                event.task_id().map(|id| id.to_string())
            }
            EntityType::Approval | EntityType::Backend => None,
        };
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO audit_log (timestamp, entity_type, entity_id, task_id, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.timestamp.to_rfc3339(),
                event.entity_type.as_str(),
                event.entity_id,
                task_id,
                to_json(event)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut events = self.query_events(
            "SELECT data FROM audit_log ORDER BY id DESC LIMIT ?1",
            &[&(limit as i64)],
        )?;
        events.reverse();
        Ok(events)
    }

    fn task_events(&self, task_id: TaskId) -> Result<Vec<AuditEvent>> {
        self.query_events(
            "SELECT data FROM audit_log WHERE task_id = ?1 ORDER BY id ASC",
            &[&task_id.to_string()],
        )
    }

    fn all_events(&self) -> Result<Vec<AuditEvent>> {
        self.query_events("SELECT data FROM audit_log ORDER BY id ASC", &[])
    }
}

impl DeferredStore for SqliteStore {
    fn push_deferred(&self, call: &DeferredCall) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO deferred_calls (id, backend_id, queued_at, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                call.id.to_string(),
                call.backend_id,
                call.queued_at.timestamp_micros(),
                to_json(call)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn deferred_for(&self, backend_id: &str) -> Result<Vec<DeferredCall>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare("SELECT data FROM deferred_calls WHERE backend_id = ?1 ORDER BY queued_at ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![backend_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.map(|r| r.map_err(db_err).and_then(|raw| from_json(&raw)))
            .collect()
    }

    fn remove_deferred(&self, id: Uuid) -> Result<()> {
        self.db
            .lock()
            .execute("DELETE FROM deferred_calls WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(())
    }

    fn bump_deferred(&self, id: Uuid) -> Result<u32> {
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT data FROM deferred_calls WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let mut call: DeferredCall = match raw {
            Some(r) => from_json(&r)?,
            None => return Err(StewardError::Store(format!("deferred call {id} not found"))),
        };
        call.replay_attempts += 1;
        tx.execute(
            "UPDATE deferred_calls SET data = ?1 WHERE id = ?2",
            params![to_json(&call)?, id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(call.replay_attempts)
    }

    fn deferred_count(&self) -> Result<usize> {
        let n: i64 = self
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM deferred_calls", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }
}
