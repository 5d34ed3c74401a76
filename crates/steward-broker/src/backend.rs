use async_trait::async_trait;
use steward_core::{ActionCall, BackendResponse};

/// Transport-level failure reported by a backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or is not serving.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the payload.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// An external system that performs side-effecting actions.
///
/// `invoke` must treat repeated calls with the same idempotency key as one
/// call: the executor may re-send a step after a restart.
#[async_trait]
pub trait CapabilityBackend: Send + Sync {
    /// Identifier used in action registrations.
    fn id(&self) -> &str;

    /// Actions this backend serves without explicit configuration.
    fn actions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, call: &ActionCall) -> Result<BackendResponse, BackendError>;

    /// Cheap liveness check used by the health monitor.
    async fn probe(&self) -> bool;
}
