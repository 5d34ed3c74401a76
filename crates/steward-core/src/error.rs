use thiserror::Error;
use uuid::Uuid;

use crate::types::TaskStatus;

/// Unified error type for the entire Steward engine.
#[derive(Error, Debug)]
pub enum StewardError {
    // ── Ingestion errors ───────────────────────────────────────
    #[error("validation error: {0}")]
    Validation(String),

    // ── Planning errors ────────────────────────────────────────
    #[error("cyclic dependency in plan: step '{step}' is part of a dependency cycle")]
    CyclicDependency { step: String },

    #[error("unknown step '{step}' referenced by '{referenced_by}'")]
    UnknownStep { step: String, referenced_by: String },

    // ── Backend errors ─────────────────────────────────────────
    #[error("transient backend error: {action}: {reason}")]
    TransientBackend { action: String, reason: String },

    #[error("permanent backend error: {action}: {reason}")]
    PermanentBackend { action: String, reason: String },

    // ── Approval errors ────────────────────────────────────────
    #[error("approval {0} timed out without a decision")]
    ApprovalTimeout(Uuid),

    #[error("approval request not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("approval {0} was already decided")]
    ApprovalAlreadyDecided(Uuid),

    // ── Store errors ───────────────────────────────────────────
    #[error("lease on task {task_id} expired or is held by another worker")]
    LeaseExpired { task_id: Uuid },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("store error: {0}")]
    Store(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StewardError>;
