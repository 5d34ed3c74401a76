//! The autonomy loop: runs a task's plan step by step.
//!
//! Every step transition is committed to the plan store before the next one
//! happens, so a restarted worker picks up at the last committed step. Steps
//! run one at a time unless they share a `parallel_group`, in which case the
//! ready members of the group run together, bounded by `max_parallel`.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_autonomy::{
    FailureKind, PlanSource, Planner, PredicateRegistry, StepFailure, delay_for, dependents,
    partial_met, ready_steps, select_strategy,
};
use steward_broker::{BrokerError, CapabilityBroker};
use steward_config::StewardConfig;
use steward_core::{
    ActionCall, AuditEvent, FailureClass, GroupPolicy, PlanState, RecoveryRecord,
    RecoveryStrategy, Result, RetryPolicy, RouteOutcome, StepRecord, StepState, StewardError,
    Task, TaskId, TaskStatus,
};
use steward_store::{Auditor, Store};

/// Longest idle wait between boundary checks while a retry is pending.
const MAX_IDLE: std::time::Duration = std::time::Duration::from_secs(1);

/// How one execution pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Done,
    Blocked { reason: String },
    Failed { reason: String },
    Cancelled,
    /// The worker's lease lapsed; the reaper will requeue the task.
    LeaseLost,
    /// The engine is shutting down; the task went back to the queue.
    Interrupted,
}

pub struct PlanExecutor {
    store: Arc<dyn Store>,
    auditor: Auditor,
    broker: Arc<CapabilityBroker>,
    planner: Planner,
    predicates: PredicateRegistry,
    default_retry: RetryPolicy,
    max_parallel: usize,
    lease_ttl: Duration,
}

impl PlanExecutor {
    pub fn new(
        config: &StewardConfig,
        store: Arc<dyn Store>,
        auditor: Auditor,
        broker: Arc<CapabilityBroker>,
        predicates: PredicateRegistry,
    ) -> Self {
        Self {
            store,
            auditor,
            broker,
            planner: Planner::from_config(&config.executor, &config.classifier),
            predicates,
            default_retry: config.executor.default_retry.clone(),
            max_parallel: config.executor.max_parallel.max(1),
            lease_ttl: Duration::seconds(config.engine.lease_ttl_secs.max(1) as i64),
        }
    }

    /// Run a claimed `needs_action` task until it settles or the worker must stop.
    pub async fn execute(
        &self,
        task: &Task,
        worker_id: &str,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let task = self.begin(task, worker_id)?;
        let mut state = match self.store.load_plan(task.id)? {
            Some(mut state) => {
                self.resume_interrupted(&mut state)?;
                state
            }
            None => match self.planner.plan(&task) {
                Ok((plan, source)) => {
                    let mut state = PlanState::new(plan);
                    state.variables.insert(
                        "task".into(),
                        json!({ "id": task.id, "title": task.title, "body": task.body }),
                    );
                    self.store.save_plan(&state)?;
                    info!(
                        task_id = %task.id,
                        steps = state.steps.len(),
                        source = source_name(source),
                        "plan created"
                    );
                    state
                }
                Err(e) => {
                    let reason = format!("planning failed: {e}");
                    warn!(task_id = %task.id, error = %e, "planning failed");
                    self.finish(task.id, TaskStatus::Failed, &reason)?;
                    return Ok(ExecutionOutcome::Failed { reason });
                }
            },
        };

        loop {
            if let Some(outcome) = self.checkpoint(task.id, worker_id, shutdown)? {
                return Ok(outcome);
            }

            match state.derived_status() {
                TaskStatus::Done => {
                    self.finish(task.id, TaskStatus::Done, "all steps complete")?;
                    info!(task_id = %task.id, metrics = ?state.metrics, "task done");
                    return Ok(ExecutionOutcome::Done);
                }
                TaskStatus::Blocked => {
                    let reason = blocked_reason(&state);
                    self.finish(task.id, TaskStatus::Blocked, &reason)?;
                    warn!(task_id = %task.id, reason = %reason, "task blocked");
                    return Ok(ExecutionOutcome::Blocked { reason });
                }
                _ => {}
            }

            let now = Utc::now();
            let ready = ready_steps(&state, now);
            if ready.is_empty() {
                if let Some(wait) = next_wakeup(&state, now) {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(wait.min(MAX_IDLE)) => {}
                    }
                } else {
                    self.block_unreachable(&mut state)?;
                }
                continue;
            }

            let batch = self.next_batch(&state, &ready);
            if let Some(outcome) = self.run_batch(&mut state, batch, worker_id).await? {
                return Ok(outcome);
            }
        }
    }

    // ── Task boundaries ────────────────────────────────────────

    fn begin(&self, task: &Task, worker_id: &str) -> Result<Task> {
        let now = Utc::now();
        let task = self.store.update_task(task.id, &mut |t| {
            if !t.is_leased_by(worker_id, now) {
                return Err(StewardError::LeaseExpired { task_id: t.id });
            }
            t.transition(TaskStatus::Executing, None)?;
            Ok(())
        })?;
        self.auditor.record(
            AuditEvent::task(task.id, TaskStatus::NeedsAction, TaskStatus::Executing)
                .with_reason(format!("claimed by {worker_id}")),
        );
        Ok(task)
    }

    /// Ownership and cancellation, checked before a step starts and before
    /// its result is applied.
    fn guard(&self, task_id: TaskId, worker_id: &str) -> Result<Option<ExecutionOutcome>> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or(StewardError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Executing || !task.is_leased_by(worker_id, Utc::now()) {
            warn!(task_id = %task_id, worker = worker_id, "lease lost, abandoning execution");
            return Ok(Some(ExecutionOutcome::LeaseLost));
        }
        if task.cancel_requested {
            self.finish(task_id, TaskStatus::Failed, "cancelled")?;
            info!(task_id = %task_id, "task cancelled");
            return Ok(Some(ExecutionOutcome::Cancelled));
        }
        Ok(None)
    }

    fn checkpoint(
        &self,
        task_id: TaskId,
        worker_id: &str,
        shutdown: &CancellationToken,
    ) -> Result<Option<ExecutionOutcome>> {
        if let Some(outcome) = self.guard(task_id, worker_id)? {
            return Ok(Some(outcome));
        }
        if shutdown.is_cancelled() {
            self.store.update_task(task_id, &mut |t| {
                t.transition(TaskStatus::NeedsAction, None)?;
                t.lease = None;
                Ok(())
            })?;
            self.auditor.record(
                AuditEvent::task(task_id, TaskStatus::Executing, TaskStatus::NeedsAction)
                    .with_reason("engine shutdown"),
            );
            return Ok(Some(ExecutionOutcome::Interrupted));
        }
        match self
            .store
            .renew_lease(task_id, worker_id, self.lease_ttl, Utc::now())
        {
            Ok(_) => Ok(None),
            Err(StewardError::LeaseExpired { .. }) => Ok(Some(ExecutionOutcome::LeaseLost)),
            Err(e) => Err(e),
        }
    }

    fn finish(&self, task_id: TaskId, to: TaskStatus, reason: &str) -> Result<()> {
        let mut from = TaskStatus::Executing;
        self.store.update_task(task_id, &mut |t| {
            from = t.transition(to, Some(reason.to_string()))?;
            t.lease = None;
            Ok(())
        })?;
        self.auditor
            .record(AuditEvent::task(task_id, from, to).with_reason(reason));
        Ok(())
    }

    // ── Steps ──────────────────────────────────────────────────

    /// Steps left mid-flight by a crashed worker run again with the same
    /// attempt number, hence the same idempotency key.
    fn resume_interrupted(&self, state: &mut PlanState) -> Result<()> {
        let interrupted: Vec<String> = state
            .steps
            .iter()
            .filter(|r| {
                matches!(
                    r.state,
                    StepState::Executing
                        | StepState::Validating
                        | StepState::Failed
                        | StepState::Recovering
                )
            })
            .map(|r| r.id.clone())
            .collect();
        for id in interrupted {
            info!(task_id = %state.task_id(), step = %id, "resuming interrupted step");
            self.move_step(state, &id, StepState::Pending, Some("resumed after interruption"), |r| {
                r.attempt_count = r.attempt_count.saturating_sub(1);
            })?;
        }
        Ok(())
    }

    /// The first ready step, plus the other ready members of its parallel group.
    fn next_batch(&self, state: &PlanState, ready: &[String]) -> Vec<String> {
        let Some(first) = ready.first() else {
            return Vec::new();
        };
        let group = state.spec(first).and_then(|s| s.parallel_group.clone());
        match group {
            None => vec![first.clone()],
            Some(group) => ready
                .iter()
                .filter(|id| {
                    state
                        .spec(id)
                        .is_some_and(|s| s.parallel_group.as_deref() == Some(group.as_str()))
                })
                .take(self.max_parallel)
                .cloned()
                .collect(),
        }
    }

    async fn run_batch(
        &self,
        state: &mut PlanState,
        batch: Vec<String>,
        worker_id: &str,
    ) -> Result<Option<ExecutionOutcome>> {
        let task_id = state.task_id();
        let mut calls = Vec::with_capacity(batch.len());
        for id in &batch {
            calls.push((id.clone(), self.start_step(state, id)?));
        }

        let broker = &self.broker;
        let results = join_all(calls.into_iter().map(|(id, call)| async move {
            let result = broker.route(call).await;
            (id, result)
        }))
        .await;

        // Results that arrive after cancellation or a lost lease are dropped.
        if let Some(outcome) = self.guard(task_id, worker_id)? {
            debug!(task_id = %task_id, steps = ?batch, "discarding in-flight results");
            return Ok(Some(outcome));
        }
        for (id, result) in results {
            self.settle_step(state, &id, result)?;
        }
        Ok(None)
    }

    fn start_step(&self, state: &mut PlanState, id: &str) -> Result<ActionCall> {
        let spec = state
            .spec(id)
            .cloned()
            .ok_or_else(|| StewardError::Validation(format!("unknown step '{id}'")))?;
        let payload = bind_payload(state, &spec.id);
        let using_alternate = state.record(id).is_some_and(|r| r.using_alternate);
        let action = match (&spec.alternate_action, using_alternate) {
            (Some(alternate), true) => alternate.clone(),
            _ => spec.action.clone(),
        };

        let now = Utc::now();
        let mut attempt = 0;
        self.move_step(state, id, StepState::Executing, None, |r| {
            r.attempt_count += 1;
            r.started_at = Some(now);
            r.next_attempt_at = None;
            attempt = r.attempt_count;
        })?;
        info!(task_id = %state.task_id(), step = %id, action = %action, attempt, "step started");
        Ok(ActionCall::new(action, payload).keyed(state.task_id(), id, attempt))
    }

    fn settle_step(
        &self,
        state: &mut PlanState,
        id: &str,
        result: std::result::Result<RouteOutcome, BrokerError>,
    ) -> Result<()> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let kind = match e.failure_class() {
                    FailureClass::Permanent => FailureKind::Permanent,
                    FailureClass::Transient => FailureKind::Transient,
                };
                return self.recover(state, id, StepFailure::new(kind, e.to_string()), None);
            }
        };

        // Deferred calls complete now; their backend replays them later.
        if outcome.deferred {
            return self.complete_step(state, id, outcome.result, "deferred", |r| {
                r.degraded = true;
            });
        }

        self.move_step(state, id, StepState::Validating, None, |_| {})?;
        let rule = state
            .spec(id)
            .map(|s| s.validation.clone())
            .unwrap_or_default();
        match self.predicates.check(&rule, &outcome.result) {
            Ok(()) => {
                let degraded = outcome.degraded;
                let reason = if degraded { "complete (degraded)" } else { "complete" };
                self.complete_step(state, id, outcome.result, reason, |r| {
                    r.degraded = degraded;
                })
            }
            Err(msg) => self.recover(
                state,
                id,
                StepFailure::new(FailureKind::Validation, msg),
                Some(outcome.result),
            ),
        }
    }

    fn complete_step(
        &self,
        state: &mut PlanState,
        id: &str,
        outputs: Map<String, Value>,
        reason: &str,
        extra: impl FnOnce(&mut StepRecord),
    ) -> Result<()> {
        state
            .variables
            .insert(id.to_string(), Value::Object(outputs.clone()));
        state.metrics.steps_completed += 1;
        let now = Utc::now();
        self.move_step(state, id, StepState::Complete, Some(reason), |r| {
            r.outputs = outputs;
            r.finished_at = Some(now);
            r.last_error = None;
            extra(r);
        })
    }

    fn recover(
        &self,
        state: &mut PlanState,
        id: &str,
        failure: StepFailure,
        outputs: Option<Map<String, Value>>,
    ) -> Result<()> {
        let message = failure.to_string();
        state.metrics.steps_failed += 1;
        self.move_step(state, id, StepState::Failed, Some(&message), |r| {
            r.last_error = Some(message.clone());
        })?;
        self.move_step(state, id, StepState::Recovering, None, |_| {})?;

        let (Some(spec), Some(record)) = (state.spec(id).cloned(), state.record(id).cloned())
        else {
            return Err(StewardError::Validation(format!("unknown step '{id}'")));
        };
        let policy = spec.retry.clone().unwrap_or_else(|| self.default_retry.clone());
        let partial_ok = outputs
            .as_ref()
            .is_some_and(|o| partial_met(spec.partial.as_ref(), o));
        let strategy = select_strategy(&spec, &record, &policy, &failure, partial_ok);

        let now = Utc::now();
        state.recovery_history.push(RecoveryRecord {
            step_id: id.to_string(),
            attempt: record.attempt_count,
            error: message.clone(),
            strategy,
            at: now,
        });
        state.metrics.recoveries += 1;
        warn!(
            task_id = %state.task_id(),
            step = %id,
            attempt = record.attempt_count,
            strategy = %strategy,
            error = %message,
            "step failed"
        );

        match strategy {
            RecoveryStrategy::Retry => {
                let delay = delay_for(&policy, record.attempt_count);
                let due = now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                state.metrics.retries += 1;
                self.move_step(
                    state,
                    id,
                    StepState::Retrying,
                    Some(&format!("retry in {}ms", delay.as_millis())),
                    |r| r.next_attempt_at = Some(due),
                )
            }
            RecoveryStrategy::Alternative => {
                let alternate = spec.alternate_action.clone().unwrap_or_default();
                self.move_step(
                    state,
                    id,
                    StepState::Retrying,
                    Some(&format!("switching to alternate action '{alternate}'")),
                    |r| {
                        r.using_alternate = true;
                        r.attempt_count = 0;
                        r.next_attempt_at = None;
                    },
                )
            }
            RecoveryStrategy::Skip => {
                self.complete_step(state, id, Map::new(), "skipped", |r| r.skipped = true)
            }
            RecoveryStrategy::Partial => {
                let outputs = outputs.unwrap_or_default();
                self.complete_step(state, id, outputs, "accepted partial output", |r| {
                    r.partial = true;
                })
            }
            RecoveryStrategy::Escalate => self.escalate(state, id, &message),
        }
    }

    /// Block the step, everything downstream of it, and under fail-fast the
    /// members of its parallel group that are not running.
    fn escalate(&self, state: &mut PlanState, id: &str, message: &str) -> Result<()> {
        self.move_step(state, id, StepState::Blocked, Some(&format!("escalated: {message}")), |_| {})?;

        let mut to_block: Vec<(String, String)> = dependents(&state.plan.steps, id)
            .into_iter()
            .map(|d| (d, format!("upstream step '{id}' escalated")))
            .collect();

        if let Some(group) = state.spec(id).and_then(|s| s.parallel_group.clone())
            && state.plan.group_policy(&group) == GroupPolicy::FailFast
        {
            let members: Vec<String> = state
                .plan
                .steps
                .iter()
                .filter(|s| s.id != id && s.parallel_group.as_deref() == Some(group.as_str()))
                .map(|s| s.id.clone())
                .collect();
            for member in members {
                let reason = format!("group '{group}' failed fast on '{id}'");
                for downstream in dependents(&state.plan.steps, &member) {
                    to_block.push((downstream, reason.clone()));
                }
                to_block.push((member, reason));
            }
        }

        for (step, reason) in to_block {
            let waiting = matches!(
                state.state_of(&step),
                Some(StepState::Pending | StepState::Retrying)
            );
            if waiting {
                self.move_step(state, &step, StepState::Blocked, Some(&reason), |_| {})?;
            }
        }
        Ok(())
    }

    fn block_unreachable(&self, state: &mut PlanState) -> Result<()> {
        let stuck: Vec<String> = state
            .steps
            .iter()
            .filter(|r| !r.state.is_settled())
            .map(|r| r.id.clone())
            .collect();
        for id in stuck {
            warn!(task_id = %state.task_id(), step = %id, "step can never become ready");
            self.move_step(state, &id, StepState::Blocked, Some("unreachable"), |_| {})?;
        }
        Ok(())
    }

    /// Apply one step transition, commit the plan, then audit it.
    fn move_step(
        &self,
        state: &mut PlanState,
        id: &str,
        to: StepState,
        reason: Option<&str>,
        mutate: impl FnOnce(&mut StepRecord),
    ) -> Result<()> {
        let task_id = state.task_id();
        let record = state
            .record_mut(id)
            .ok_or_else(|| StewardError::Validation(format!("unknown step '{id}'")))?;
        let from = record.state;
        record.state = to;
        mutate(record);
        let attempt = record.attempt_count;
        state.updated_at = Utc::now();
        self.store.save_plan(state)?;

        let mut event =
            AuditEvent::step(task_id, id, from, to).with_details(json!({ "attempt": attempt }));
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.auditor.record(event);
        Ok(())
    }
}

/// Static params overlaid with inputs bound from upstream outputs.
fn bind_payload(state: &PlanState, step_id: &str) -> Map<String, Value> {
    let Some(spec) = state.spec(step_id) else {
        return Map::new();
    };
    let mut payload = spec.params.clone();
    for input in &spec.inputs {
        let value = state
            .record(&input.from)
            .and_then(|r| r.outputs.get(&input.output))
            .cloned()
            .unwrap_or(Value::Null);
        payload.insert(input.key().to_string(), value);
    }
    payload
}

fn next_wakeup(state: &PlanState, now: DateTime<Utc>) -> Option<std::time::Duration> {
    state
        .steps
        .iter()
        .filter(|r| r.state == StepState::Retrying)
        .filter_map(|r| r.next_attempt_at)
        .min()
        .map(|due| (due - now).to_std().unwrap_or_default())
}

fn blocked_reason(state: &PlanState) -> String {
    state
        .recovery_history
        .iter()
        .rev()
        .find(|r| r.strategy == RecoveryStrategy::Escalate)
        .map(|r| format!("step '{}' escalated: {}", r.step_id, r.error))
        .unwrap_or_else(|| "blocked".to_string())
}

fn source_name(source: PlanSource) -> &'static str {
    match source {
        PlanSource::Requested => "requested",
        PlanSource::Template => "template",
        PlanSource::SingleStep => "single_step",
    }
}
