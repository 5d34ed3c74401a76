use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use steward_config::ApprovalConfig;
use steward_core::{
    ApprovalRequest, ApprovalStatus, AuditEvent, Decision, DecisionKind, EntityType, Result,
    StewardError, Task, TaskStatus,
};
use steward_store::{Auditor, Store};

use crate::risk::RiskAssessor;

/// Ten years. Keeps the deadline representable.
const MAX_TIMEOUT_SECS: u64 = 10 * 365 * 86_400;

/// What the gate decided for a claimed task.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// No approval needed; the caller may execute.
    Clear,
    /// The task is parked in `in_approval` and its lease released.
    Parked(ApprovalRequest),
}

/// Holds sensitive tasks until a human decides.
///
/// Decisions arrive on an mpsc channel (see [`ApprovalGate::decision_sender`])
/// or through [`ApprovalGate::apply_decision`] directly. Nothing here blocks
/// a worker: a parked task simply stops being claimable.
pub struct ApprovalGate {
    store: Arc<dyn Store>,
    auditor: Auditor,
    assessor: RiskAssessor,
    timeout: Duration,
    decision_tx: mpsc::Sender<Decision>,
    decision_rx: Mutex<Option<mpsc::Receiver<Decision>>>,
}

impl ApprovalGate {
    pub fn new(config: &ApprovalConfig, store: Arc<dyn Store>, auditor: Auditor) -> Self {
        Self::with_assessor(config, RiskAssessor::from_config(config), store, auditor)
    }

    pub fn with_assessor(
        config: &ApprovalConfig,
        assessor: RiskAssessor,
        store: Arc<dyn Store>,
        auditor: Auditor,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            store,
            auditor,
            assessor,
            timeout: Duration::seconds(config.timeout_secs.min(MAX_TIMEOUT_SECS) as i64),
            decision_tx: tx,
            decision_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn assessor(&self) -> &RiskAssessor {
        &self.assessor
    }

    /// Sender side of the decision channel, for reviewers and the CLI.
    pub fn decision_sender(&self) -> mpsc::Sender<Decision> {
        self.decision_tx.clone()
    }

    /// Take the receiver. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Decision>> {
        self.decision_rx.lock().take()
    }

    /// Assess a claimed `needs_action` task and park it if it is sensitive.
    pub fn gate(&self, task: &Task) -> Result<GateOutcome> {
        if task.approved {
            return Ok(GateOutcome::Clear);
        }
        let Some(finding) = self.assessor.assess(task) else {
            return Ok(GateOutcome::Clear);
        };

        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            task_id: task.id,
            risk_level: finding.risk_level,
            family: finding.family.clone(),
            matched_keyword: finding.keyword.clone(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + self.timeout,
            decided_by: None,
            decided_at: None,
            reason: None,
        };
        self.store.insert_approval(&request)?;

        let reason = format!("{} risk: {}", finding.risk_level, finding.family);
        self.store.update_task(task.id, &mut |t| {
            t.transition(TaskStatus::InApproval, None)?;
            t.risk_level = Some(finding.risk_level);
            t.risk_flags = finding.flags.clone();
            t.approval_id = Some(request.id);
            t.lease = None;
            Ok(())
        })?;

        info!(
            request_id = %request.id,
            task_id = %task.id,
            family = %request.family,
            risk = %request.risk_level,
            "requesting human approval"
        );
        self.auditor.record(
            AuditEvent::new(
                EntityType::Approval,
                request.id.to_string(),
                None,
                ApprovalStatus::Pending.to_string(),
            )
            .with_reason(reason.clone())
            .with_details(serde_json::json!({
                "task_id": task.id,
                "family": request.family,
                "keyword": request.matched_keyword,
                "risk_level": request.risk_level,
                "expires_at": request.expires_at,
            })),
        );
        self.auditor.record(
            AuditEvent::task(task.id, TaskStatus::NeedsAction, TaskStatus::InApproval)
                .with_reason(reason),
        );
        Ok(GateOutcome::Parked(request))
    }

    /// Record a decision and move the task accordingly.
    ///
    /// Fails with `ApprovalAlreadyDecided` if the request was already settled,
    /// so a late decision never overrides an earlier one.
    pub fn apply_decision(&self, decision: &Decision) -> Result<ApprovalRequest> {
        self.decide(decision, None)
    }

    /// `cause` is attached to the audit record when the decision was not a reviewer's.
    fn decide(&self, decision: &Decision, cause: Option<&StewardError>) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let status = match decision.decision {
            DecisionKind::Approved => ApprovalStatus::Approved,
            DecisionKind::Rejected => ApprovalStatus::Rejected,
        };
        let request = self.store.update_approval(decision.approval_id, &mut |req| {
            if !req.is_pending() {
                return Err(StewardError::ApprovalAlreadyDecided(req.id));
            }
            req.status = status;
            req.decided_by = Some(decision.reviewer.clone());
            req.decided_at = Some(now);
            req.reason = decision.note.clone();
            Ok(())
        })?;

        info!(
            request_id = %request.id,
            task_id = %request.task_id,
            decision = %status,
            reviewer = %decision.reviewer,
            "approval decided"
        );
        let mut event = AuditEvent::new(
            EntityType::Approval,
            request.id.to_string(),
            Some(ApprovalStatus::Pending.to_string()),
            status.to_string(),
        )
        .with_details(serde_json::json!({
            "task_id": request.task_id,
            "reviewer": decision.reviewer,
            "cause": cause.map(|e| e.to_string()),
        }));
        if let Some(note) = &decision.note {
            event = event.with_reason(note.clone());
        }
        self.auditor.record(event);

        self.settle_task(&request)?;
        Ok(request)
    }

    fn settle_task(&self, request: &ApprovalRequest) -> Result<()> {
        let Some(task) = self.store.get_task(request.task_id)? else {
            return Err(StewardError::TaskNotFound(request.task_id));
        };
        if task.status != TaskStatus::InApproval || task.approval_id != Some(request.id) {
            debug!(
                task_id = %task.id,
                status = %task.status,
                "task no longer awaiting this approval; decision recorded only"
            );
            return Ok(());
        }

        match request.status {
            ApprovalStatus::Approved => {
                self.store.update_task(task.id, &mut |t| {
                    t.transition(TaskStatus::Approved, None)?;
                    t.transition(TaskStatus::NeedsAction, None)?;
                    t.approved = true;
                    Ok(())
                })?;
                self.auditor
                    .record(AuditEvent::task(task.id, TaskStatus::InApproval, TaskStatus::Approved));
                self.auditor.record(
                    AuditEvent::task(task.id, TaskStatus::Approved, TaskStatus::NeedsAction)
                        .with_reason("approved"),
                );
            }
            ApprovalStatus::Rejected => {
                let reason = match request.reason.as_deref() {
                    Some(note) => format!("approval rejected: {note}"),
                    None => "approval rejected".to_string(),
                };
                self.store.update_task(task.id, &mut |t| {
                    t.transition(TaskStatus::Rejected, None)?;
                    t.transition(TaskStatus::Failed, Some(reason.clone()))?;
                    Ok(())
                })?;
                self.auditor
                    .record(AuditEvent::task(task.id, TaskStatus::InApproval, TaskStatus::Rejected));
                self.auditor.record(
                    AuditEvent::task(task.id, TaskStatus::Rejected, TaskStatus::Failed)
                        .with_reason(reason),
                );
            }
            ApprovalStatus::Pending => {}
        }
        Ok(())
    }

    /// Reject every pending request whose deadline has passed. Returns how many expired.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for request in self.store.list_approvals(Some(ApprovalStatus::Pending))? {
            if !request.is_expired(now) {
                continue;
            }
            let decision = Decision::reject(request.id, "system", "timeout");
            let cause = StewardError::ApprovalTimeout(request.id);
            match self.decide(&decision, Some(&cause)) {
                Ok(_) => {
                    warn!(request_id = %request.id, task_id = %request.task_id, error = %cause, "auto-rejected");
                    expired += 1;
                }
                // A reviewer got there first.
                Err(StewardError::ApprovalAlreadyDecided(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Consume decisions until the channel closes or `cancel` fires.
    pub async fn run_decisions(&self, mut rx: mpsc::Receiver<Decision>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => {
                    let Some(decision) = next else { break };
                    if let Err(e) = self.apply_decision(&decision) {
                        warn!(approval_id = %decision.approval_id, error = %e, "decision rejected");
                    }
                }
            }
        }
        debug!("decision consumer stopped");
    }
}
