//! # steward-config
//!
//! Configuration system for the Steward engine. Reads from `steward.toml` and
//! environment variables, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ActionConfig, ApprovalConfig, BrokerConfig, ClassifierConfig, ConfigWarning, EngineConfig,
    ExecutorConfig, FallbackConfig, KeywordRule, LoggingConfig, RiskFamily, SkillSignature,
    StewardConfig, StoreConfig, WarningSeverity,
};
