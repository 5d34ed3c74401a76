//! # steward-autonomy
//!
//! Decides what a routed task may do and how its plan recovers. Risk
//! assessment and the human approval gate, plan decomposition with cycle
//! checks, retry backoff, step validation, and recovery strategy selection.

pub mod approval;
pub mod backoff;
pub mod dag;
pub mod planner;
pub mod recovery;
pub mod risk;
pub mod validation;

pub use approval::{ApprovalGate, GateOutcome};
pub use backoff::delay_for;
pub use dag::{dependencies_satisfied, dependents, detect_cycle, ready_steps};
pub use planner::{PlanSource, Planner};
pub use recovery::{FailureKind, StepFailure, select_strategy};
pub use risk::{KeywordFamily, RiskAssessor, RiskFinding, RiskMatch, RiskRule, contains_term};
pub use validation::{Predicate, PredicateRegistry, partial_met};
