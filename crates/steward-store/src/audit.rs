//! Append-only audit sink and the read model rebuilt from it.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use steward_core::{AuditEvent, EntityType, EventBus, Result};

use crate::Store;

/// Persists every event and fans it out on the event bus.
///
/// Audit writes never fail the operation being audited: a failed append is
/// logged and the event is still published.
#[derive(Clone)]
pub struct Auditor {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl Auditor {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn record(&self, event: AuditEvent) {
        debug!(
            entity = %event.entity_type,
            id = %event.entity_id,
            from = event.from_state.as_deref().unwrap_or("-"),
            to = %event.to_state,
            "audit"
        );
        if let Err(e) = self.store.append_event(&event) {
            warn!(error = %e, entity_id = %event.entity_id, "failed to persist audit event");
        }
        self.bus.publish(event);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Rebuild the task board from the full event history.
    pub fn board(&self) -> Result<TaskBoard> {
        Ok(TaskBoard::rebuild(&self.store.all_events()?))
    }
}

/// Latest known state of each task, derived purely from audit events.
#[derive(Debug, Default, Clone)]
pub struct TaskBoard {
    states: BTreeMap<Uuid, String>,
    skills: BTreeMap<Uuid, String>,
    backends: BTreeMap<String, String>,
}

impl TaskBoard {
    pub fn rebuild(events: &[AuditEvent]) -> Self {
        let mut board = Self::default();
        for event in events {
            board.apply(event);
        }
        board
    }

    pub fn apply(&mut self, event: &AuditEvent) {
        match event.entity_type {
            EntityType::Task => {
                if let Some(id) = event.task_id() {
                    self.states.insert(id, event.to_state.clone());
                }
            }
            EntityType::Routing => {
                if let Some(id) = event.task_id() {
                    self.skills.insert(id, event.to_state.clone());
                }
            }
            // Deferred-call bookkeeping shares the entity type; only health flips count.
            EntityType::Backend => {
                if matches!(event.to_state.as_str(), "healthy" | "unhealthy") {
                    self.backends
                        .insert(event.entity_id.clone(), event.to_state.clone());
                }
            }
            EntityType::Step | EntityType::Approval => {}
        }
    }

    pub fn status_of(&self, task_id: Uuid) -> Option<&str> {
        self.states.get(&task_id).map(String::as_str)
    }

    pub fn skill_of(&self, task_id: Uuid) -> Option<&str> {
        self.skills.get(&task_id).map(String::as_str)
    }

    /// Number of tasks currently in each state.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            *counts.entry(state.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Last reported health per backend.
    pub fn backends(&self) -> &BTreeMap<String, String> {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
