use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StewardError};
use crate::plan::{GroupPolicy, StepSpec};

pub type TaskId = Uuid;

/// Task priority. Declaration order is selection order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Standard,
    Low,
}

impl Priority {
    /// Rank used for ordering: lower ranks are selected first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Standard => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Standard => "standard",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "standard" | "normal" | "medium" => Ok(Priority::Standard),
            "low" => Ok(Priority::Low),
            other => Err(StewardError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    NeedsAction,
    InApproval,
    Approved,
    Rejected,
    Executing,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::New,
        TaskStatus::NeedsAction,
        TaskStatus::InApproval,
        TaskStatus::Approved,
        TaskStatus::Rejected,
        TaskStatus::Executing,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::NeedsAction => "needs_action",
            TaskStatus::InApproval => "in_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Executing => "executing",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| StewardError::Validation(format!("unknown task status '{s}'")))
    }
}

/// Check that a task may move from `from` to `to`.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    use TaskStatus::*;
    let ok = matches!(
        (from, to),
        (New, NeedsAction)
            | (New, Failed)
            | (NeedsAction, InApproval)
            | (NeedsAction, Executing)
            | (NeedsAction, Failed)
            | (InApproval, Approved)
            | (InApproval, Rejected)
            | (InApproval, Failed)
            | (Approved, NeedsAction)
            | (Rejected, Failed)
            | (Executing, Done)
            | (Executing, Failed)
            | (Executing, Blocked)
            | (Executing, NeedsAction)
            | (Blocked, NeedsAction)
            | (Blocked, Failed)
    );
    if ok {
        Ok(())
    } else {
        Err(StewardError::InvalidTransition { from, to })
    }
}

/// Risk level attached to sensitive actions. Declaration order is severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Bucketed routing confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        f.write_str(s)
    }
}

/// An exclusive, time-bounded claim on a task by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form skill suggestion supplied by the producer.
    #[serde(default)]
    pub skill_hint: Option<String>,
    /// Skill assigned by the classifier.
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    pub source: String,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub approval_id: Option<Uuid>,
    /// Set once a human approved the task; it is not re-assessed afterwards.
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub requested_plan: Option<Vec<StepSpec>>,
    /// Failure policies for the requested plan's parallel groups.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requested_groups: BTreeMap<String, GroupPolicy>,
    #[serde(default)]
    pub terminal_reason: Option<String>,
}

impl Task {
    /// Move to `to`, enforcing the transition table. Returns the previous status.
    pub fn transition(&mut self, to: TaskStatus, reason: Option<String>) -> Result<TaskStatus> {
        validate_transition(self.status, to)?;
        let from = self.status;
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.lease = None;
            self.terminal_reason = Some(reason.unwrap_or_else(|| to.as_str().to_string()));
        }
        Ok(from)
    }

    /// Eligible for selection: waiting for action and not under a live lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::NeedsAction
            && self.lease.as_ref().is_none_or(|l| !l.is_live(now))
    }

    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.worker_id == worker_id && l.is_live(now))
    }

    /// Title and body joined, for keyword matching.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/// The ingestion shape accepted from task producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skill_hint: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    /// Explicit step list; overrides skill templates.
    #[serde(default)]
    pub plan: Option<Vec<StepSpec>>,
    /// Failure policy per parallel group of `plan`; unnamed groups use the configured policy.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupPolicy>,
}

fn default_source() -> String {
    "manual".into()
}

impl NewTask {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: Priority::Standard,
            created_at: None,
            skill_hint: None,
            source: default_source(),
            plan: None,
            groups: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.skill_hint = Some(hint.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_plan(mut self, steps: Vec<StepSpec>) -> Self {
        self.plan = Some(steps);
        self
    }

    pub fn with_group_policy(mut self, group: impl Into<String>, policy: GroupPolicy) -> Self {
        self.groups.insert(group.into(), policy);
        self
    }

    /// Validate and build a `Task` in status `new`.
    pub fn into_task(self) -> Result<Task> {
        if self.title.trim().is_empty() {
            return Err(StewardError::Validation("task title is empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(StewardError::Validation("task source is empty".into()));
        }
        if let Some(steps) = &self.plan {
            crate::plan::validate_steps(steps)?;
        }
        for group in self.groups.keys() {
            let used = self.plan.iter().flatten().any(|s| s.parallel_group.as_ref() == Some(group));
            if !used {
                return Err(StewardError::Validation(format!(
                    "policy for group '{group}' but no step of the plan is in it"
                )));
            }
        }
        let now = Utc::now();
        Ok(Task {
            id: Uuid::new_v4(),
            title: self.title,
            body: self.body,
            priority: self.priority,
            status: TaskStatus::New,
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
            skill_hint: self.skill_hint.filter(|h| !h.trim().is_empty()),
            skill: None,
            confidence: None,
            risk_flags: Vec::new(),
            risk_level: None,
            source: self.source,
            lease: None,
            approval_id: None,
            approved: false,
            cancel_requested: false,
            requested_plan: self.plan,
            requested_groups: self.groups,
            terminal_reason: None,
        })
    }
}
