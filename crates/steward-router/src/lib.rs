//! # steward-router
//!
//! Assigns an owning skill to each task by scoring it against a declarative
//! rule table of skill signatures.

pub mod classifier;
pub mod registry;

pub use classifier::{Classification, Classifier, SkillScore, has_checklist, has_code_block};
pub use registry::SkillRegistry;
