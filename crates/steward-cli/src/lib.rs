//! # steward-cli
//!
//! Command-line interface for the Steward orchestration engine.
//!
//! ## Commands
//!
//! - `steward run`: Start workers, the reaper, and the health monitor
//! - `steward submit`: Ingest tasks from a JSON file
//! - `steward tasks` / `steward show`: Inspect tasks and their plans
//! - `steward approvals` / `approve` / `reject`: Answer approval requests
//! - `steward cancel` / `resume`: Operator controls
//! - `steward audit`: Show the audit log
//! - `steward config` / `init` / `doctor`: Configuration

pub mod commands;

pub use commands::Cli;
