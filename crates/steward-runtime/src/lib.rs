//! # steward-runtime
//!
//! The running engine. Tasks are ingested and routed, then a pool of
//! workers claims them in priority order, passes each through the approval
//! gate, and drives its plan step by step through the capability broker.
//!
//! ```text
//! ingest ─▶ classify ─▶ needs_action ─▶ claim ─▶ gate ─┬─▶ execute ─▶ done | blocked | failed
//!                                                     └─▶ in_approval ─▶ decide ─▶ needs_action | failed
//! ```
//!
//! Background loops run alongside the workers: a reaper that requeues
//! tasks whose lease lapsed and expires stale approvals, a health monitor
//! that probes backends, and a consumer for decisions sent over the
//! approval channel.

pub mod engine;
pub mod executor;
pub mod reaper;
pub mod worker;

pub use engine::{Engine, EngineBuilder, StatusSnapshot, open_store};
pub use executor::{ExecutionOutcome, PlanExecutor};
pub use reaper::{Reaper, SweepReport};
pub use worker::{ProcessOutcome, Processed, Worker};
