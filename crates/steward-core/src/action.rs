//! Capability backend contract types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// How failures of an action are treated by recovery. Declared at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    #[default]
    Transient,
    Permanent,
}

/// One invocation of a named action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCall {
    pub action: String,
    pub payload: Map<String, Value>,
    /// `task:step:attempt`. Backends must treat repeats of a key as the same call.
    pub idempotency_key: String,
}

impl ActionCall {
    pub fn new(action: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            action: action.into(),
            payload,
            idempotency_key: Uuid::new_v4().to_string(),
        }
    }

    pub fn keyed(mut self, task_id: Uuid, step_id: &str, attempt: u32) -> Self {
        self.idempotency_key = format!("{task_id}:{step_id}:{attempt}");
        self
    }
}

/// What a backend returns from `invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn ok(result: Map<String, Value>) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Map::new(),
            error: Some(error.into()),
        }
    }
}

/// The broker's answer for a routed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    pub result: Map<String, Value>,
    /// Served by a fallback because the backend was unhealthy.
    pub degraded: bool,
    /// Queued for replay because the backend was unhealthy and had no fallback.
    pub deferred: bool,
}

impl RouteOutcome {
    pub fn direct(result: Map<String, Value>) -> Self {
        Self {
            result,
            degraded: false,
            deferred: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// A call parked until its backend recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredCall {
    pub id: Uuid,
    pub backend_id: String,
    pub call: ActionCall,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub replay_attempts: u32,
}
