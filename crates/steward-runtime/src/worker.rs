use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use steward_autonomy::{ApprovalGate, GateOutcome};
use steward_core::{Result, TaskId};
use steward_store::Store;

use crate::executor::{ExecutionOutcome, PlanExecutor};

/// What a worker did with one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The task needs a human decision; it was parked.
    Parked { approval_id: Uuid },
    Executed(ExecutionOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub task_id: TaskId,
    pub outcome: ProcessOutcome,
}

/// One pull loop: claim, gate, execute, repeat.
pub struct Worker {
    id: String,
    store: Arc<dyn Store>,
    gate: Arc<ApprovalGate>,
    executor: Arc<PlanExecutor>,
    lease_ttl: Duration,
    poll_interval: std::time::Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn Store>,
        gate: Arc<ApprovalGate>,
        executor: Arc<PlanExecutor>,
        lease_ttl: Duration,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            gate,
            executor,
            lease_ttl,
            poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process the next eligible task, if any.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<Option<Processed>> {
        let Some(task) = self
            .store
            .select_next(&self.id, self.lease_ttl, Utc::now())?
        else {
            return Ok(None);
        };
        debug!(worker = %self.id, task_id = %task.id, priority = %task.priority, "claimed task");

        let result = match self.gate.gate(&task) {
            Ok(GateOutcome::Parked(request)) => {
                return Ok(Some(Processed {
                    task_id: task.id,
                    outcome: ProcessOutcome::Parked {
                        approval_id: request.id,
                    },
                }));
            }
            Ok(GateOutcome::Clear) => self.executor.execute(&task, &self.id, shutdown).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => Ok(Some(Processed {
                task_id: task.id,
                outcome: ProcessOutcome::Executed(outcome),
            })),
            Err(e) => {
                // Without a lease an executing task is requeued on the next reaper sweep.
                if let Err(release) = self.store.release_lease(task.id, &self.id) {
                    warn!(task_id = %task.id, error = %release, "failed to release lease");
                }
                Err(e)
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.id, "worker started");
        while !shutdown.is_cancelled() {
            match self.process_next(&shutdown).await {
                Ok(Some(processed)) => {
                    debug!(worker = %self.id, task_id = %processed.task_id, outcome = ?processed.outcome, "task processed");
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker = %self.id, error = %e, "task processing failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}
