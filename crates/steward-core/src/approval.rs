use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{RiskLevel, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A human sign-off request raised for a sensitive task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub task_id: TaskId,
    pub risk_level: RiskLevel,
    /// Action family that triggered the request, e.g. "payment".
    pub family: String,
    pub matched_keyword: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    Rejected,
}

/// A decision event arriving on the human decision channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub approval_id: Uuid,
    pub decision: DecisionKind,
    pub reviewer: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl Decision {
    pub fn approve(approval_id: Uuid, reviewer: impl Into<String>) -> Self {
        Self {
            approval_id,
            decision: DecisionKind::Approved,
            reviewer: reviewer.into(),
            note: None,
        }
    }

    pub fn reject(approval_id: Uuid, reviewer: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            approval_id,
            decision: DecisionKind::Rejected,
            reviewer: reviewer.into(),
            note: Some(note.into()),
        }
    }
}
