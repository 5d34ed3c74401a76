use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_autonomy::ApprovalGate;
use steward_core::{AuditEvent, Result, TaskStatus};
use steward_store::{Auditor, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub expired_approvals: usize,
}

/// Periodic housekeeping: requeues tasks whose worker lease lapsed and
/// auto-rejects approvals past their deadline.
pub struct Reaper {
    store: Arc<dyn Store>,
    auditor: Auditor,
    gate: Arc<ApprovalGate>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn Store>,
        auditor: Auditor,
        gate: Arc<ApprovalGate>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            auditor,
            gate,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for task_id in self.store.reap_expired(now)? {
            warn!(%task_id, "lease expired, task requeued");
            self.auditor.record(
                AuditEvent::task(task_id, TaskStatus::Executing, TaskStatus::NeedsAction)
                    .with_reason("lease expired"),
            );
            report.requeued += 1;
        }

        report.expired_approvals = self.gate.expire_stale(now)?;
        if report != SweepReport::default() {
            info!(
                requeued = report.requeued,
                expired_approvals = report.expired_approvals,
                "reaper sweep"
            );
        }
        Ok(report)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()) {
                        warn!(error = %e, "reaper sweep failed");
                    }
                }
            }
        }
        debug!("reaper stopped");
    }
}
