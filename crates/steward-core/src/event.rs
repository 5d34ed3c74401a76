use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Step,
    Approval,
    Backend,
    Routing,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Step => "step",
            EntityType::Approval => "approval",
            EntityType::Backend => "backend",
            EntityType::Routing => "routing",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record. Every state change in the engine emits one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub from_state: Option<String>,
    pub to_state: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEvent {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        from_state: Option<String>,
        to_state: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            entity_type,
            entity_id: entity_id.into(),
            from_state,
            to_state: to_state.into(),
            reason: None,
            details: Value::Null,
        }
    }

    pub fn task(task_id: Uuid, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            EntityType::Task,
            task_id.to_string(),
            Some(from.to_string()),
            to.to_string(),
        )
    }

    pub fn step(task_id: Uuid, step_id: &str, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            EntityType::Step,
            format!("{task_id}/{step_id}"),
            Some(from.to_string()),
            to.to_string(),
        )
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Task id this event concerns, for task and step events.
    pub fn task_id(&self) -> Option<Uuid> {
        match self.entity_type {
            EntityType::Task | EntityType::Routing => self.entity_id.parse().ok(),
            EntityType::Step => self
                .entity_id
                .split_once('/')
                .and_then(|(t, _)| t.parse().ok()),
            _ => None,
        }
    }
}

/// A broadcast-based bus carrying audit events to live subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<AuditEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: AuditEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
