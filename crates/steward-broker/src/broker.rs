use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use steward_config::{ActionConfig, BrokerConfig, FallbackConfig};
use steward_core::{
    ActionCall, AuditEvent, DeferredCall, EntityType, FailureClass, HealthStatus, RouteOutcome,
    StewardError,
};
use steward_store::{Auditor, Store};

use crate::backend::{BackendError, CapabilityBackend};
use crate::health::HealthTable;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    // ── Routing ────────────────────────────────────────────────
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("backend '{backend}' timed out after {timeout_ms}ms")]
    BackendTimeout { backend: String, timeout_ms: u64 },

    // ── Action outcome ─────────────────────────────────────────
    #[error("backend '{backend}' rejected payload: {reason}")]
    BackendRejected { backend: String, reason: String },

    #[error("action '{action}' failed: {reason}")]
    ActionFailed {
        action: String,
        class: FailureClass,
        reason: String,
    },

    #[error("fallback for '{action}' exhausted: {reason}")]
    FallbackExhausted { action: String, reason: String },
}

impl BrokerError {
    /// How recovery should treat this error.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            BrokerError::UnknownAction(_) | BrokerError::BackendRejected { .. } => {
                FailureClass::Permanent
            }
            BrokerError::ActionFailed { class, .. } => *class,
            BrokerError::BackendUnavailable { .. }
            | BrokerError::BackendTimeout { .. }
            | BrokerError::FallbackExhausted { .. } => FailureClass::Transient,
        }
    }
}

impl From<BrokerError> for StewardError {
    fn from(e: BrokerError) -> Self {
        let action = match &e {
            BrokerError::UnknownAction(a)
            | BrokerError::ActionFailed { action: a, .. }
            | BrokerError::FallbackExhausted { action: a, .. } => a.clone(),
            BrokerError::BackendUnavailable { backend, .. }
            | BrokerError::BackendTimeout { backend, .. }
            | BrokerError::BackendRejected { backend, .. } => backend.clone(),
        };
        match e.failure_class() {
            FailureClass::Transient => StewardError::TransientBackend {
                action,
                reason: e.to_string(),
            },
            FailureClass::Permanent => StewardError::PermanentBackend {
                action,
                reason: e.to_string(),
            },
        }
    }
}

/// A registered action and where it runs.
#[derive(Debug, Clone)]
pub struct ActionEntry {
    pub name: String,
    pub backend: String,
    pub failure_class: FailureClass,
    pub fallback: Option<FallbackConfig>,
}

impl From<&ActionConfig> for ActionEntry {
    fn from(c: &ActionConfig) -> Self {
        Self {
            name: c.name.clone(),
            backend: c.backend.clone(),
            failure_class: c.failure_class,
            fallback: c.fallback.clone(),
        }
    }
}

/// Counts from one deferred-queue replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Routes actions to backends by their last known health.
///
/// Health comes from the probe-driven [`HealthTable`], never from a live
/// probe per call. An unhealthy backend's actions go to their declared
/// fallback (tagged `degraded`) or into the deferred queue (tagged
/// `deferred`) for replay once the backend recovers.
pub struct CapabilityBroker {
    backends: HashMap<String, Arc<dyn CapabilityBackend>>,
    actions: HashMap<String, ActionEntry>,
    health: HealthTable,
    store: Arc<dyn Store>,
    auditor: Auditor,
    call_timeout: Duration,
    max_replay_attempts: u32,
}

impl CapabilityBroker {
    pub fn new(config: &BrokerConfig, store: Arc<dyn Store>, auditor: Auditor) -> Self {
        let mut broker = Self {
            backends: HashMap::new(),
            actions: HashMap::new(),
            health: HealthTable::new(config.unhealthy_threshold, config.healthy_threshold),
            store,
            auditor,
            call_timeout: Duration::from_millis(config.call_timeout_ms.max(1)),
            max_replay_attempts: config.max_replay_attempts.max(1),
        };
        for action in &config.actions {
            broker.declare_action(ActionEntry::from(action));
        }
        broker
    }

    /// Register a backend and any actions it serves that are not declared yet.
    pub fn add_backend(&mut self, backend: Arc<dyn CapabilityBackend>) {
        let id = backend.id().to_string();
        for action in backend.actions() {
            self.actions.entry(action.clone()).or_insert(ActionEntry {
                name: action,
                backend: id.clone(),
                failure_class: FailureClass::Transient,
                fallback: None,
            });
        }
        self.health.track(&id);
        info!(backend = %id, "registered capability backend");
        self.backends.insert(id, backend);
    }

    /// Declare (or redeclare) an action with its failure class and fallback.
    pub fn declare_action(&mut self, entry: ActionEntry) {
        debug!(action = %entry.name, backend = %entry.backend, "declared action");
        self.actions.insert(entry.name.clone(), entry);
    }

    pub fn action(&self, name: &str) -> Option<&ActionEntry> {
        self.actions.get(name)
    }

    pub fn health(&self) -> &HealthTable {
        &self.health
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.health.snapshot()
    }

    pub async fn route(&self, call: ActionCall) -> Result<RouteOutcome, BrokerError> {
        let entry = self
            .actions
            .get(&call.action)
            .ok_or_else(|| BrokerError::UnknownAction(call.action.clone()))?;

        if self.health.status(&entry.backend) == HealthStatus::Healthy {
            let result = self.invoke(entry, &call).await?;
            return Ok(RouteOutcome::direct(result));
        }

        match &entry.fallback {
            Some(FallbackConfig::Static { response }) => {
                info!(action = %entry.name, backend = %entry.backend, "backend unhealthy, serving static fallback");
                Ok(RouteOutcome {
                    result: response.clone(),
                    degraded: true,
                    deferred: false,
                })
            }
            Some(FallbackConfig::Action { action }) => {
                let fallback = self.actions.get(action).ok_or_else(|| {
                    BrokerError::FallbackExhausted {
                        action: entry.name.clone(),
                        reason: format!("fallback action '{action}' is not registered"),
                    }
                })?;
                if self.health.status(&fallback.backend) != HealthStatus::Healthy {
                    return Err(BrokerError::FallbackExhausted {
                        action: entry.name.clone(),
                        reason: format!("fallback backend '{}' is unhealthy", fallback.backend),
                    });
                }
                info!(
                    action = %entry.name,
                    fallback = %fallback.name,
                    backend = %entry.backend,
                    "backend unhealthy, routing to fallback action"
                );
                let mut fallback_call = call.clone();
                fallback_call.action = fallback.name.clone();
                let result = self.invoke(fallback, &fallback_call).await.map_err(|e| {
                    BrokerError::FallbackExhausted {
                        action: entry.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(RouteOutcome {
                    result,
                    degraded: true,
                    deferred: false,
                })
            }
            None => self.defer(entry, call),
        }
    }

    fn defer(&self, entry: &ActionEntry, call: ActionCall) -> Result<RouteOutcome, BrokerError> {
        let deferred = DeferredCall {
            id: Uuid::new_v4(),
            backend_id: entry.backend.clone(),
            call,
            queued_at: Utc::now(),
            replay_attempts: 0,
        };
        self.store
            .push_deferred(&deferred)
            .map_err(|e| BrokerError::BackendUnavailable {
                backend: entry.backend.clone(),
                reason: format!("backend unhealthy and deferral failed: {e}"),
            })?;
        warn!(
            action = %entry.name,
            backend = %entry.backend,
            deferred_id = %deferred.id,
            "backend unhealthy, call deferred"
        );
        self.auditor.record(
            AuditEvent::new(
                EntityType::Backend,
                format!("{}/{}", entry.backend, deferred.id),
                None,
                "deferred",
            )
            .with_details(json!({
                "action": entry.name,
                "idempotency_key": deferred.call.idempotency_key,
            })),
        );

        let mut result = Map::new();
        result.insert("deferred_id".into(), Value::String(deferred.id.to_string()));
        Ok(RouteOutcome {
            result,
            degraded: false,
            deferred: true,
        })
    }

    async fn invoke(
        &self,
        entry: &ActionEntry,
        call: &ActionCall,
    ) -> Result<Map<String, Value>, BrokerError> {
        let backend = self
            .backends
            .get(&entry.backend)
            .ok_or_else(|| BrokerError::BackendUnavailable {
                backend: entry.backend.clone(),
                reason: "backend is not registered".into(),
            })?;

        debug!(action = %entry.name, backend = %entry.backend, key = %call.idempotency_key, "invoking action");
        let response = match tokio::time::timeout(self.call_timeout, backend.invoke(call)).await {
            Err(_) => {
                return Err(BrokerError::BackendTimeout {
                    backend: entry.backend.clone(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                });
            }
            Ok(Err(BackendError::Unavailable(reason))) => {
                return Err(BrokerError::BackendUnavailable {
                    backend: entry.backend.clone(),
                    reason,
                });
            }
            Ok(Err(BackendError::Rejected(reason))) => {
                return Err(BrokerError::BackendRejected {
                    backend: entry.backend.clone(),
                    reason,
                });
            }
            Ok(Ok(response)) => response,
        };

        if response.success {
            Ok(response.result)
        } else {
            Err(BrokerError::ActionFailed {
                action: entry.name.clone(),
                class: entry.failure_class,
                reason: response
                    .error
                    .unwrap_or_else(|| "backend reported failure".into()),
            })
        }
    }

    /// Probe every backend once, audit health flips, and replay deferred
    /// calls for every backend that is healthy after its probe. Calls whose
    /// replay failed stay queued and are tried again on the next round.
    pub async fn probe_all(&self) {
        for (id, backend) in &self.backends {
            let ok = tokio::time::timeout(self.call_timeout, backend.probe())
                .await
                .unwrap_or(false);
            if let Some(flip) = self.health.record_probe(id, ok) {
                let reason = match flip.to {
                    HealthStatus::Unhealthy => format!("{} consecutive failed probes", flip.streak),
                    HealthStatus::Healthy => format!("{} consecutive good probes", flip.streak),
                };
                warn!(backend = %id, from = %flip.from, to = %flip.to, "backend health changed");
                self.auditor.record(
                    AuditEvent::new(
                        EntityType::Backend,
                        id.clone(),
                        Some(flip.from.to_string()),
                        flip.to.to_string(),
                    )
                    .with_reason(reason),
                );
            }

            if !ok || self.health.status(id) != HealthStatus::Healthy {
                continue;
            }
            match self.replay_deferred(id).await {
                Ok(report) if report != ReplayReport::default() => {
                    info!(
                        backend = %id,
                        replayed = report.replayed,
                        failed = report.failed,
                        dropped = report.dropped,
                        "deferred calls replayed"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(backend = %id, error = %e, "deferred replay failed"),
            }
        }
    }

    /// Re-send queued calls for `backend_id` in the order they were deferred.
    pub async fn replay_deferred(&self, backend_id: &str) -> steward_core::Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let Some(backend) = self.backends.get(backend_id) else {
            return Ok(report);
        };

        for deferred in self.store.deferred_for(backend_id)? {
            let outcome = tokio::time::timeout(self.call_timeout, backend.invoke(&deferred.call)).await;
            let error = match outcome {
                Ok(Ok(resp)) if resp.success => None,
                Ok(Ok(resp)) => Some(resp.error.unwrap_or_else(|| "backend reported failure".into())),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("timed out".to_string()),
            };
            let entity_id = format!("{backend_id}/{}", deferred.id);

            let Some(error) = error else {
                self.store.remove_deferred(deferred.id)?;
                self.auditor.record(AuditEvent::new(
                    EntityType::Backend,
                    entity_id,
                    Some("deferred".into()),
                    "replayed",
                ));
                report.replayed += 1;
                continue;
            };

            let attempts = self.store.bump_deferred(deferred.id)?;
            if attempts >= self.max_replay_attempts {
                self.store.remove_deferred(deferred.id)?;
                warn!(
                    backend = %backend_id,
                    deferred_id = %deferred.id,
                    attempts,
                    error = %error,
                    "dropping deferred call"
                );
                self.auditor.record(
                    AuditEvent::new(
                        EntityType::Backend,
                        entity_id,
                        Some("deferred".into()),
                        "dropped",
                    )
                    .with_reason(format!("{attempts} failed replays: {error}")),
                );
                report.dropped += 1;
            } else {
                debug!(deferred_id = %deferred.id, attempts, error = %error, "replay failed, keeping call");
                report.failed += 1;
            }
        }
        Ok(report)
    }
}
