use std::collections::HashMap;
use tracing::debug;

use steward_config::{ClassifierConfig, SkillSignature};

/// The declared skills and their fixed tie-break order.
pub struct SkillRegistry {
    skills: Vec<SkillSignature>,
    /// Position in the configured priority list; unlisted skills are absent.
    tie_rank: HashMap<String, usize>,
    default_skill: String,
}

impl SkillRegistry {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let tie_rank = config
            .skill_priority
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        for skill in &config.skills {
            debug!(skill = %skill.name, keywords = skill.keywords.len(), "registered skill signature");
        }
        Self {
            skills: config.skills.clone(),
            tie_rank,
            default_skill: config.default_skill.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SkillSignature> {
        self.skills.iter().find(|s| s.name == name)
    }

    pub fn all(&self) -> &[SkillSignature] {
        &self.skills
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn default_skill(&self) -> &str {
        &self.default_skill
    }

    /// Sort key for ties: listed skills by position, then unlisted ones by name.
    pub fn tie_key<'a>(&self, name: &'a str) -> (usize, &'a str) {
        (self.tie_rank.get(name).copied().unwrap_or(usize::MAX), name)
    }

    /// Action bound by the single-step default plan for `skill`.
    pub fn default_action(&self, skill: &str) -> &str {
        self.get(skill).map(|s| s.default_action.as_str()).unwrap_or("noop")
    }
}
