use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use steward_core::{
    ApprovalRequest, ApprovalStatus, AuditEvent, DeferredCall, Lease, PlanState, Result,
    StewardError, Task, TaskId, TaskStatus,
};

use crate::{
    ApprovalMutation, ApprovalStore, AuditStore, DeferredStore, PlanStore, TaskMutation,
    TaskStore, selection_key,
};

/// Sharded in-memory store. Records lock individually; no global lock spans tasks.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: DashMap<TaskId, Task>,
    plans: DashMap<TaskId, PlanState>,
    approvals: DashMap<Uuid, ApprovalRequest>,
    deferred: DashMap<Uuid, DeferredCall>,
    audit: Mutex<Vec<AuditEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryStore {
    fn insert_task(&self, task: &Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(StewardError::Store(format!("task {} already exists", task.id)));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    fn update_task(&self, id: TaskId, mutation: TaskMutation<'_>) -> Result<Task> {
        let mut entry = self
            .tasks
            .get_mut(&id)
            .ok_or(StewardError::TaskNotFound(id))?;
        let mut draft = entry.clone();
        mutation(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }

    fn select_next(
        &self,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut candidates: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.is_claimable(now))
            .map(|t| selection_key(&t))
            .collect();
        candidates.sort();

        for (_, _, id) in candidates {
            let Some(mut entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            // Another worker may have claimed it since the scan.
            if !entry.is_claimable(now) {
                continue;
            }
            entry.lease = Some(Lease {
                worker_id: worker_id.to_string(),
                expires_at: now + ttl,
            });
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(selection_key);
        Ok(tasks)
    }
}

impl PlanStore for InMemoryStore {
    fn save_plan(&self, state: &PlanState) -> Result<()> {
        self.plans.insert(state.task_id(), state.clone());
        Ok(())
    }

    fn load_plan(&self, task_id: TaskId) -> Result<Option<PlanState>> {
        Ok(self.plans.get(&task_id).map(|p| p.clone()))
    }
}

impl ApprovalStore for InMemoryStore {
    fn insert_approval(&self, request: &ApprovalRequest) -> Result<()> {
        self.approvals.insert(request.id, request.clone());
        Ok(())
    }

    fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        Ok(self.approvals.get(&id).map(|a| a.clone()))
    }

    fn update_approval(&self, id: Uuid, mutation: ApprovalMutation<'_>) -> Result<ApprovalRequest> {
        let mut entry = self
            .approvals
            .get_mut(&id)
            .ok_or(StewardError::ApprovalNotFound(id))?;
        let mut draft = entry.clone();
        mutation(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }

    fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let mut list: Vec<ApprovalRequest> = self
            .approvals
            .iter()
            .filter(|a| status.is_none_or(|s| a.status == s))
            .map(|a| a.clone())
            .collect();
        list.sort_by_key(|a| a.created_at);
        Ok(list)
    }
}

impl AuditStore for InMemoryStore {
    fn append_event(&self, event: &AuditEvent) -> Result<()> {
        self.audit.lock().push(event.clone());
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let log = self.audit.lock();
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    fn task_events(&self, task_id: TaskId) -> Result<Vec<AuditEvent>> {
        Ok(self
            .audit
            .lock()
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .cloned()
            .collect())
    }

    fn all_events(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.audit.lock().clone())
    }
}

impl DeferredStore for InMemoryStore {
    fn push_deferred(&self, call: &DeferredCall) -> Result<()> {
        self.deferred.insert(call.id, call.clone());
        Ok(())
    }

    fn deferred_for(&self, backend_id: &str) -> Result<Vec<DeferredCall>> {
        let mut calls: Vec<DeferredCall> = self
            .deferred
            .iter()
            .filter(|c| c.backend_id == backend_id)
            .map(|c| c.clone())
            .collect();
        calls.sort_by_key(|c| c.queued_at);
        Ok(calls)
    }

    fn remove_deferred(&self, id: Uuid) -> Result<()> {
        self.deferred.remove(&id);
        Ok(())
    }

    fn bump_deferred(&self, id: Uuid) -> Result<u32> {
        let mut entry = self
            .deferred
            .get_mut(&id)
            .ok_or_else(|| StewardError::Store(format!("deferred call {id} not found")))?;
        entry.replay_attempts += 1;
        Ok(entry.replay_attempts)
    }

    fn deferred_count(&self) -> Result<usize> {
        Ok(self.deferred.len())
    }
}
