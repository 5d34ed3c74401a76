//! Recovery strategy selection for failed steps.

use std::fmt;

use steward_core::{RecoveryStrategy, RetryPolicy, StepRecord, StepSpec};

/// Why a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend call failed but may succeed later.
    Transient,
    /// The backend rejected the call; retrying cannot help.
    Permanent,
    /// The call succeeded but its outputs did not pass validation.
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Validation => "validation",
        })
    }
}

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Pick the recovery strategy for a failed attempt. First match wins:
///
/// 1. permanent failure: escalate
/// 2. validation failure whose outputs meet the step's partial minimum: partial
/// 3. attempts remaining: retry
/// 4. an alternate action not yet tried: alternative
/// 5. optional step: skip
/// 6. otherwise: escalate
///
/// `partial_met` is whether the step's partial acceptance rule holds on the
/// outputs of the failed attempt.
pub fn select_strategy(
    spec: &StepSpec,
    record: &StepRecord,
    policy: &RetryPolicy,
    failure: &StepFailure,
    partial_met: bool,
) -> RecoveryStrategy {
    if failure.kind == FailureKind::Permanent {
        return RecoveryStrategy::Escalate;
    }
    if failure.kind == FailureKind::Validation && spec.partial.is_some() && partial_met {
        return RecoveryStrategy::Partial;
    }
    if record.attempt_count < policy.max_attempts {
        return RecoveryStrategy::Retry;
    }
    if spec.alternate_action.is_some() && !record.using_alternate {
        return RecoveryStrategy::Alternative;
    }
    if spec.optional {
        return RecoveryStrategy::Skip;
    }
    RecoveryStrategy::Escalate
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::PartialAcceptance;

    fn record(attempts: u32) -> StepRecord {
        let mut r = StepRecord::pending("s");
        r.attempt_count = attempts;
        r
    }

    fn transient() -> StepFailure {
        StepFailure::new(FailureKind::Transient, "timeout")
    }

    #[test]
    fn test_permanent_always_escalates() {
        let spec = StepSpec::new("s", "x").with_alternate("y").optional();
        let f = StepFailure::new(FailureKind::Permanent, "rejected");
        let p = RetryPolicy::immediate(3);
        assert_eq!(select_strategy(&spec, &record(1), &p, &f, true), RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_retry_until_budget_spent() {
        let spec = StepSpec::new("s", "x");
        let p = RetryPolicy::immediate(3);
        assert_eq!(select_strategy(&spec, &record(1), &p, &transient(), false), RecoveryStrategy::Retry);
        assert_eq!(select_strategy(&spec, &record(2), &p, &transient(), false), RecoveryStrategy::Retry);
        assert_eq!(select_strategy(&spec, &record(3), &p, &transient(), false), RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_alternative_then_skip() {
        let p = RetryPolicy::immediate(1);
        let spec = StepSpec::new("s", "x").with_alternate("y").optional();
        assert_eq!(
            select_strategy(&spec, &record(1), &p, &transient(), false),
            RecoveryStrategy::Alternative
        );

        let mut used = record(1);
        used.using_alternate = true;
        assert_eq!(select_strategy(&spec, &used, &p, &transient(), false), RecoveryStrategy::Skip);
    }

    #[test]
    fn test_partial_needs_rule_and_minimum() {
        let p = RetryPolicy::immediate(3);
        let mut spec = StepSpec::new("s", "x");
        let f = StepFailure::new(FailureKind::Validation, "below threshold");
        assert_eq!(select_strategy(&spec, &record(1), &p, &f, true), RecoveryStrategy::Retry);

        spec.partial = Some(PartialAcceptance {
            key: "rows".into(),
            min: 10.0,
        });
        assert_eq!(select_strategy(&spec, &record(1), &p, &f, true), RecoveryStrategy::Partial);
        assert_eq!(select_strategy(&spec, &record(1), &p, &f, false), RecoveryStrategy::Retry);
    }
}
