//! # steward-store
//!
//! Durable records for the engine behind one interface. Every record is
//! mutated through a per-record transactional read-modify-write, and task
//! selection is an atomic claim so concurrent workers never share a task.
//!
//! Two implementations ship: [`InMemoryStore`] (sharded maps) and
//! [`SqliteStore`] (WAL-mode SQLite). Neither is privileged.

pub mod audit;
pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use steward_core::{
    ApprovalRequest, ApprovalStatus, AuditEvent, DeferredCall, PlanState, Result, Task, TaskId,
    TaskStatus,
};

pub use audit::{Auditor, TaskBoard};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Mutation applied inside a per-record transaction. An `Err` leaves the record untouched.
pub type TaskMutation<'a> = &'a mut dyn FnMut(&mut Task) -> Result<()>;
pub type ApprovalMutation<'a> = &'a mut dyn FnMut(&mut ApprovalRequest) -> Result<()>;

pub trait TaskStore: Send + Sync {
    fn insert_task(&self, task: &Task) -> Result<()>;

    fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Read-modify-write one task atomically and return the new value.
    fn update_task(&self, id: TaskId, mutation: TaskMutation<'_>) -> Result<Task>;

    /// Claim the highest-priority, oldest claimable task for `worker_id`.
    /// Returns `None` when nothing is eligible; never waits for a held lease.
    fn select_next(&self, worker_id: &str, ttl: Duration, now: DateTime<Utc>)
    -> Result<Option<Task>>;

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    /// Extend a lease held by `worker_id`. Fails with `LeaseExpired` if it no longer holds it.
    fn renew_lease(
        &self,
        id: TaskId,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.update_task(id, &mut |task| {
            if !task.is_leased_by(worker_id, now) {
                return Err(steward_core::StewardError::LeaseExpired { task_id: task.id });
            }
            task.lease = Some(steward_core::Lease {
                worker_id: worker_id.to_string(),
                expires_at: now + ttl,
            });
            Ok(())
        })
    }

    /// Drop a lease if `worker_id` still holds it.
    fn release_lease(&self, id: TaskId, worker_id: &str) -> Result<()> {
        self.update_task(id, &mut |task| {
            if task.lease.as_ref().is_some_and(|l| l.worker_id == worker_id) {
                task.lease = None;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Requeue executing tasks whose lease lapsed before `now`. Returns the requeued ids.
    fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut reaped = Vec::new();
        for task in self.list_tasks(Some(TaskStatus::Executing))? {
            if task.lease.as_ref().is_some_and(|l| l.is_live(now)) {
                continue;
            }
            let mut requeued = false;
            self.update_task(task.id, &mut |t| {
                // Re-check under the record lock; the worker may have renewed.
                requeued = false;
                if t.status != TaskStatus::Executing
                    || t.lease.as_ref().is_some_and(|l| l.is_live(now))
                {
                    return Ok(());
                }
                t.transition(TaskStatus::NeedsAction, None)?;
                t.lease = None;
                requeued = true;
                Ok(())
            })?;
            if requeued {
                reaped.push(task.id);
            }
        }
        Ok(reaped)
    }
}

pub trait PlanStore: Send + Sync {
    fn save_plan(&self, state: &PlanState) -> Result<()>;
    fn load_plan(&self, task_id: TaskId) -> Result<Option<PlanState>>;
}

pub trait ApprovalStore: Send + Sync {
    fn insert_approval(&self, request: &ApprovalRequest) -> Result<()>;
    fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>>;
    fn update_approval(&self, id: Uuid, mutation: ApprovalMutation<'_>) -> Result<ApprovalRequest>;
    fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>>;
}

pub trait AuditStore: Send + Sync {
    fn append_event(&self, event: &AuditEvent) -> Result<()>;
    /// Most recent events, newest last.
    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>>;
    /// Task and step events for one task, in append order.
    fn task_events(&self, task_id: TaskId) -> Result<Vec<AuditEvent>>;
    /// Every event, in append order.
    fn all_events(&self) -> Result<Vec<AuditEvent>>;
}

pub trait DeferredStore: Send + Sync {
    fn push_deferred(&self, call: &DeferredCall) -> Result<()>;
    /// Calls parked for a backend, oldest first.
    fn deferred_for(&self, backend_id: &str) -> Result<Vec<DeferredCall>>;
    fn remove_deferred(&self, id: Uuid) -> Result<()>;
    /// Record a failed replay; returns the new attempt count.
    fn bump_deferred(&self, id: Uuid) -> Result<u32>;
    fn deferred_count(&self) -> Result<usize>;
}

/// Everything the engine persists.
pub trait Store: TaskStore + PlanStore + ApprovalStore + AuditStore + DeferredStore {}

impl<T> Store for T where T: TaskStore + PlanStore + ApprovalStore + AuditStore + DeferredStore {}

/// Selection order: priority rank, then created_at, then id.
pub(crate) fn selection_key(task: &Task) -> (u8, DateTime<Utc>, Uuid) {
    (task.priority.rank(), task.created_at, task.id)
}
