//! # steward-broker
//!
//! Routes step actions to capability backends. Tracks backend health from
//! periodic probes with hysteresis, serves declared fallbacks while a backend
//! is down, and parks calls that have no fallback for replay on recovery.

pub mod backend;
pub mod broker;
pub mod builtin;
pub mod health;
pub mod mock;

pub use backend::{BackendError, CapabilityBackend};
pub use broker::{ActionEntry, BrokerError, CapabilityBroker, ReplayReport};
pub use builtin::{LOCAL_BACKEND, LocalBackend};
pub use health::{HealthFlip, HealthMonitor, HealthTable};
pub use mock::{MockBackend, MockDefault};
