use std::time::Duration;

use steward_core::{BackoffKind, RetryPolicy};

/// Delay before retry number `attempt` (1-based: the delay after the first failure is `attempt = 1`).
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_ms;
    let max = policy.max_delay_ms.max(base);
    let attempt = attempt.max(1);

    let ms = match policy.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Linear => base.saturating_mul(u64::from(attempt)).min(max),
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            let delay = base.saturating_mul(factor).min(max);
            if policy.jitter {
                let jitter = (delay as f64 * 0.5 * rand::random::<f64>()) as u64;
                delay.saturating_add(jitter).min(max)
            } else {
                delay
            }
        }
    };
    Duration::from_millis(ms)
}
