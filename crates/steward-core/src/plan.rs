//! Plan and step data model shared by the planner, the executor, and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{Result, StewardError};
use crate::types::{TaskId, TaskStatus};

// ── Step declaration ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// How a failing step is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Add up to 50% random jitter to exponential delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }
}

/// Rule evaluated against a step's outputs once its action returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Any successful action result passes.
    #[default]
    Always,
    /// The named output key must be present and non-null.
    OutputExists { key: String },
    /// The named output must be a number at least `min`.
    Threshold { key: String, min: f64 },
    /// A predicate registered with the executor under `name`.
    Predicate { name: String },
}

/// Binds an upstream step's output into this step's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub from: String,
    pub output: String,
    /// Payload key to bind under; defaults to `output`.
    #[serde(default, rename = "as")]
    pub bind_as: Option<String>,
}

impl InputBinding {
    pub fn key(&self) -> &str {
        self.bind_as.as_deref().unwrap_or(&self.output)
    }
}

/// Minimum acceptable output for the `partial` recovery strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialAcceptance {
    pub key: String,
    pub min: f64,
}

/// A single node of a plan graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub alternate_action: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Static payload merged under the bound inputs.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Falls back to the executor's default policy when unset.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub validation: ValidationRule,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub partial: Option<PartialAcceptance>,
    #[serde(default)]
    pub parallel_group: Option<String>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            action: action.into(),
            alternate_action: None,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Map::new(),
            retry: None,
            validation: ValidationRule::Always,
            optional: false,
            partial: None,
            parallel_group: None,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validation = rule;
        self
    }

    pub fn with_alternate(mut self, action: impl Into<String>) -> Self {
        self.alternate_action = Some(action.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_input(mut self, from: impl Into<String>, output: impl Into<String>) -> Self {
        self.inputs.push(InputBinding {
            from: from.into(),
            output: output.into(),
            bind_as: None,
        });
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Structural checks on a step list: ids unique, actions present,
/// dependencies and input sources resolvable. Cycles are checked at planning.
pub fn validate_steps(steps: &[StepSpec]) -> Result<()> {
    if steps.is_empty() {
        return Err(StewardError::Validation("plan has no steps".into()));
    }
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(StewardError::Validation("step id is empty".into()));
        }
        if step.action.trim().is_empty() {
            return Err(StewardError::Validation(format!(
                "step '{}' has no action",
                step.id
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(StewardError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if let Some(retry) = &step.retry
            && retry.max_attempts == 0
        {
            return Err(StewardError::Validation(format!(
                "step '{}' has max_attempts = 0",
                step.id
            )));
        }
    }
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(StewardError::UnknownStep {
                    step: dep.clone(),
                    referenced_by: step.id.clone(),
                });
            }
        }
        for input in &step.inputs {
            if !step.depends_on.contains(&input.from) {
                return Err(StewardError::Validation(format!(
                    "step '{}' reads from '{}' without depending on it",
                    step.id, input.from
                )));
            }
        }
    }
    Ok(())
}

// ── Plan ───────────────────────────────────────────────────────

/// Failure handling for a parallel group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// An escalated member blocks the group's members that have not started.
    #[default]
    FailFast,
    /// Other members keep running.
    ContinueOthers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: TaskId,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupPolicy>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn group_policy(&self, group: &str) -> GroupPolicy {
        self.groups.get(group).copied().unwrap_or_default()
    }
}

// ── Execution state ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Executing,
    Validating,
    Failed,
    Recovering,
    Retrying,
    Complete,
    Blocked,
}

impl StepState {
    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Executing => "executing",
            StepState::Validating => "validating",
            StepState::Failed => "failed",
            StepState::Recovering => "recovering",
            StepState::Retrying => "retrying",
            StepState::Complete => "complete",
            StepState::Blocked => "blocked",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, StepState::Complete | StepState::Blocked)
    }

    /// Started and not yet through recovery.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            StepState::Executing | StepState::Validating | StepState::Failed | StepState::Recovering
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Alternative,
    Skip,
    Partial,
    Escalate,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Alternative => "alternative",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Partial => "partial",
            RecoveryStrategy::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// Persisted progress of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub state: StepState,
    pub attempt_count: u32,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub using_alternate: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: StepState::Pending,
            attempt_count: 0,
            outputs: Map::new(),
            last_error: None,
            using_alternate: false,
            skipped: false,
            partial: false,
            degraded: false,
            next_attempt_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub step_id: String,
    pub attempt: u32,
    pub error: String,
    pub strategy: RecoveryStrategy,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub retries: u32,
    pub recoveries: u32,
}

/// A plan plus everything needed to resume it after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub plan: Plan,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub recovery_history: Vec<RecoveryRecord>,
    #[serde(default)]
    pub metrics: PlanMetrics,
    pub updated_at: DateTime<Utc>,
}

impl PlanState {
    pub fn new(plan: Plan) -> Self {
        let steps = plan.steps.iter().map(|s| StepRecord::pending(&s.id)).collect();
        Self {
            plan,
            steps,
            variables: Map::new(),
            recovery_history: Vec::new(),
            metrics: PlanMetrics::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.plan.task_id
    }

    pub fn spec(&self, step_id: &str) -> Option<&StepSpec> {
        self.plan.steps.iter().find(|s| s.id == step_id)
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.id == step_id)
    }

    pub fn record_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|r| r.id == step_id)
    }

    pub fn state_of(&self, step_id: &str) -> Option<StepState> {
        self.record(step_id).map(|r| r.state)
    }

    /// True once any step is blocked. A halted plan starts no new work
    /// except the remaining members of a `continue_others` group.
    pub fn is_halted(&self) -> bool {
        self.steps.iter().any(|r| r.state == StepState::Blocked)
    }

    /// Whether `step_id` may be started given the blocked steps so far.
    pub fn may_start(&self, step_id: &str) -> bool {
        if !self.is_halted() {
            return true;
        }
        let Some(group) = self.spec(step_id).and_then(|s| s.parallel_group.as_deref()) else {
            return false;
        };
        self.plan.group_policy(group) == GroupPolicy::ContinueOthers
            && self.steps.iter().any(|r| {
                r.state == StepState::Blocked
                    && self
                        .spec(&r.id)
                        .is_some_and(|s| s.parallel_group.as_deref() == Some(group))
            })
    }

    /// Task status implied by the step states alone.
    pub fn derived_status(&self) -> TaskStatus {
        if self.steps.iter().all(|r| r.state == StepState::Complete) {
            return TaskStatus::Done;
        }
        if !self.is_halted() {
            return TaskStatus::Executing;
        }
        let draining = self.steps.iter().any(|r| {
            r.state.is_in_flight()
                || (matches!(r.state, StepState::Pending | StepState::Retrying)
                    && self.may_start(&r.id))
        });
        if draining {
            TaskStatus::Executing
        } else {
            TaskStatus::Blocked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(steps: Vec<StepSpec>) -> PlanState {
        PlanState::new(Plan {
            task_id: Uuid::new_v4(),
            steps,
            groups: BTreeMap::new(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_derived_status() {
        let mut ps = state(vec![StepSpec::new("a", "noop"), StepSpec::new("b", "noop")]);
        assert_eq!(ps.derived_status(), TaskStatus::Executing);

        ps.steps[0].state = StepState::Complete;
        ps.steps[1].state = StepState::Blocked;
        assert_eq!(ps.derived_status(), TaskStatus::Blocked);

        ps.steps[1].state = StepState::Complete;
        assert_eq!(ps.derived_status(), TaskStatus::Done);
    }

    #[test]
    fn test_blocked_step_halts_independent_work() {
        let mut ps = state(vec![StepSpec::new("a", "noop"), StepSpec::new("b", "noop")]);
        ps.steps[0].state = StepState::Blocked;
        assert!(!ps.may_start("b"));
        assert_eq!(ps.derived_status(), TaskStatus::Blocked);
    }

    #[test]
    fn test_blocked_plan_waits_for_steps_in_flight() {
        let mut ps = state(vec![StepSpec::new("a", "noop"), StepSpec::new("b", "noop")]);
        ps.steps[0].state = StepState::Blocked;
        ps.steps[1].state = StepState::Recovering;
        assert_eq!(ps.derived_status(), TaskStatus::Executing);
    }

    #[test]
    fn test_continue_others_group_drains_after_block() {
        let mut ps = state(vec![
            StepSpec::new("a", "noop").in_group("fetch"),
            StepSpec::new("b", "noop").in_group("fetch"),
            StepSpec::new("c", "noop"),
        ]);
        ps.plan.groups.insert("fetch".into(), GroupPolicy::ContinueOthers);
        ps.steps[0].state = StepState::Blocked;
        assert!(ps.may_start("b"));
        assert!(!ps.may_start("c"));
        assert_eq!(ps.derived_status(), TaskStatus::Executing);

        ps.steps[1].state = StepState::Complete;
        assert_eq!(ps.derived_status(), TaskStatus::Blocked);
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let steps = vec![StepSpec::new("a", "noop").after(&["ghost"])];
        assert!(matches!(
            validate_steps(&steps),
            Err(StewardError::UnknownStep { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let steps = vec![StepSpec::new("a", "noop"), StepSpec::new("a", "echo")];
        assert!(matches!(validate_steps(&steps), Err(StewardError::Validation(_))));
    }

    #[test]
    fn test_input_requires_dependency() {
        let steps = vec![
            StepSpec::new("a", "noop"),
            StepSpec::new("b", "noop").with_input("a", "out"),
        ];
        assert!(validate_steps(&steps).is_err());
    }
}
