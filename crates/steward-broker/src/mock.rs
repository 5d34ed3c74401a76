//! Scripted backend for deterministic tests.
//!
//! Returns queued outcomes in order, then falls back to a default outcome.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use steward_core::{ActionCall, BackendResponse};

use crate::backend::{BackendError, CapabilityBackend};

/// What the mock does when its queue is empty.
#[derive(Debug, Clone)]
pub enum MockDefault {
    /// Succeed, echoing the payload.
    Echo,
    /// Fail every call with this outcome.
    Fail(Result<BackendResponse, BackendError>),
}

/// A backend that replays queued responses and records every call.
///
/// # Example
/// ```
/// use steward_broker::mock::MockBackend;
/// use steward_core::BackendResponse;
/// let backend = MockBackend::new("crm", &["crm.update"])
///     .with_response(Ok(BackendResponse::failed("locked")));
/// ```
#[derive(Clone)]
pub struct MockBackend {
    id: String,
    actions: Vec<String>,
    responses: Arc<Mutex<VecDeque<Result<BackendResponse, BackendError>>>>,
    default: Arc<Mutex<MockDefault>>,
    healthy: Arc<Mutex<bool>>,
    delay: Arc<Mutex<Duration>>,
    /// Every call received, in order.
    pub calls: Arc<Mutex<Vec<ActionCall>>>,
}

impl MockBackend {
    pub fn new(id: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            id: id.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(MockDefault::Echo)),
            healthy: Arc::new(Mutex::new(true)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, response: Result<BackendResponse, BackendError>) -> Self {
        self.queue_response(response);
        self
    }

    /// Queue an outcome for the next unanswered call.
    pub fn queue_response(&self, response: Result<BackendResponse, BackendError>) {
        self.responses.lock().push_back(response);
    }

    /// Queue a success carrying `result`.
    pub fn queue_ok(&self, result: Value) {
        let map = result.as_object().cloned().unwrap_or_else(Map::new);
        self.queue_response(Ok(BackendResponse::ok(map)));
    }

    /// Make every unscripted call fail with `response`.
    pub fn fail_always(&self, response: Result<BackendResponse, BackendError>) {
        *self.default.lock() = MockDefault::Fail(response);
    }

    pub fn succeed_always(&self) {
        *self.default.lock() = MockDefault::Echo;
    }

    /// Control what `probe` reports.
    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    /// Delay every invocation, for cancellation and timeout tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, action: &str) -> Vec<ActionCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CapabilityBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn actions(&self) -> Vec<String> {
        self.actions.clone()
    }

    async fn invoke(&self, call: &ActionCall) -> Result<BackendResponse, BackendError> {
        self.calls.lock().push(call.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.responses.lock().pop_front() {
            return next;
        }
        match &*self.default.lock() {
            MockDefault::Echo => Ok(BackendResponse::ok(call.payload.clone())),
            MockDefault::Fail(outcome) => outcome.clone(),
        }
    }

    async fn probe(&self) -> bool {
        *self.healthy.lock()
    }
}
