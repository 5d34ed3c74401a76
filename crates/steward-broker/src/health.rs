use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use steward_core::HealthStatus;

use crate::broker::CapabilityBroker;

#[derive(Debug, Clone)]
struct BackendHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_probe: Option<DateTime<Utc>>,
}

impl BackendHealth {
    fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe: None,
        }
    }
}

/// A health change produced by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthFlip {
    pub from: HealthStatus,
    pub to: HealthStatus,
    /// Consecutive probes that triggered the flip.
    pub streak: u32,
}

/// Probe-driven health per backend with hysteresis.
///
/// A healthy backend turns unhealthy only after `unhealthy_threshold`
/// consecutive failed probes, and an unhealthy one recovers after
/// `healthy_threshold` consecutive good ones. Unknown backends are healthy.
pub struct HealthTable {
    entries: Mutex<HashMap<String, BackendHealth>>,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTable {
    pub fn new(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    pub fn track(&self, backend_id: &str) {
        self.entries
            .lock()
            .entry(backend_id.to_string())
            .or_insert_with(BackendHealth::new);
    }

    pub fn status(&self, backend_id: &str) -> HealthStatus {
        self.entries
            .lock()
            .get(backend_id)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn consecutive_failures(&self, backend_id: &str) -> u32 {
        self.entries
            .lock()
            .get(backend_id)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    /// Fold one probe result in. Returns the flip, if this probe caused one.
    pub fn record_probe(&self, backend_id: &str, ok: bool) -> Option<HealthFlip> {
        let mut entries = self.entries.lock();
        let h = entries
            .entry(backend_id.to_string())
            .or_insert_with(BackendHealth::new);
        h.last_probe = Some(Utc::now());

        if ok {
            h.consecutive_failures = 0;
            h.consecutive_successes += 1;
            if h.status == HealthStatus::Unhealthy
                && h.consecutive_successes >= self.healthy_threshold
            {
                h.status = HealthStatus::Healthy;
                return Some(HealthFlip {
                    from: HealthStatus::Unhealthy,
                    to: HealthStatus::Healthy,
                    streak: h.consecutive_successes,
                });
            }
        } else {
            h.consecutive_successes = 0;
            h.consecutive_failures += 1;
            if h.status == HealthStatus::Healthy
                && h.consecutive_failures >= self.unhealthy_threshold
            {
                h.status = HealthStatus::Unhealthy;
                return Some(HealthFlip {
                    from: HealthStatus::Healthy,
                    to: HealthStatus::Unhealthy,
                    streak: h.consecutive_failures,
                });
            }
        }
        None
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.entries
            .lock()
            .iter()
            .map(|(id, h)| (id.clone(), h.status))
            .collect()
    }
}

/// Background loop that probes every backend on an interval.
pub struct HealthMonitor {
    broker: Arc<CapabilityBroker>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(broker: Arc<CapabilityBroker>, interval: Duration) -> Self {
        Self {
            broker,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "health monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.broker.probe_all().await,
            }
        }
        debug!("health monitor stopped");
    }
}
