//! # steward-core
//!
//! Core types, errors, and audit events for the Steward orchestration engine.
//! Every other crate in the workspace speaks this vocabulary.

pub mod action;
pub mod approval;
pub mod error;
pub mod event;
pub mod plan;
pub mod types;

pub use action::{
    ActionCall, BackendResponse, DeferredCall, FailureClass, HealthStatus, RouteOutcome,
};
pub use approval::{ApprovalRequest, ApprovalStatus, Decision, DecisionKind};
pub use error::{Result, StewardError};
pub use event::{AuditEvent, EntityType, EventBus};
pub use plan::{
    BackoffKind, GroupPolicy, InputBinding, PartialAcceptance, Plan, PlanMetrics, PlanState,
    RecoveryRecord, RecoveryStrategy, RetryPolicy, StepRecord, StepSpec, StepState,
    ValidationRule, validate_steps,
};
pub use types::*;
