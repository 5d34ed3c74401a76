use std::collections::BTreeSet;
use tracing::{debug, info};

use steward_config::{ApprovalConfig, RiskFamily};
use steward_core::{RiskLevel, Task};

/// One matched risk family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskMatch {
    pub family: String,
    pub risk_level: RiskLevel,
    pub keyword: String,
}

/// Outcome of assessing a task: the governing match plus every family that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskFinding {
    pub family: String,
    pub risk_level: RiskLevel,
    pub keyword: String,
    pub flags: Vec<String>,
}

/// A rule that may flag a task as sensitive.
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, text: &str) -> Option<RiskMatch>;
}

/// Runs every rule against a task. The highest risk level wins; ties go to
/// the rule registered first.
pub struct RiskAssessor {
    rules: Vec<Box<dyn RiskRule>>,
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::from_config(&ApprovalConfig::default())
    }
}

impl RiskAssessor {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn from_config(config: &ApprovalConfig) -> Self {
        let mut assessor = Self::empty();
        for family in &config.families {
            assessor.add_rule(Box::new(KeywordFamily::from(family)));
        }
        assessor
    }

    pub fn add_rule(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.push(rule);
    }

    pub fn assess(&self, task: &Task) -> Option<RiskFinding> {
        let text = task.text().to_lowercase();
        let mut best: Option<RiskMatch> = None;
        let mut flags = BTreeSet::new();

        for rule in &self.rules {
            let Some(hit) = rule.evaluate(&text) else {
                continue;
            };
            debug!(rule = rule.name(), keyword = %hit.keyword, "risk rule matched");
            flags.insert(hit.family.clone());
            if best.as_ref().is_none_or(|b| hit.risk_level > b.risk_level) {
                best = Some(hit);
            }
        }

        let best = best?;
        info!(
            task_id = %task.id,
            family = %best.family,
            risk = %best.risk_level,
            keyword = %best.keyword,
            "sensitive action detected"
        );
        Some(RiskFinding {
            family: best.family,
            risk_level: best.risk_level,
            keyword: best.keyword,
            flags: flags.into_iter().collect(),
        })
    }
}

// ── Built-in rules ─────────────────────────────────────────────

/// A named family of trigger keywords at a fixed risk level.
pub struct KeywordFamily {
    name: String,
    risk: RiskLevel,
    keywords: Vec<String>,
}

impl From<&RiskFamily> for KeywordFamily {
    fn from(family: &RiskFamily) -> Self {
        Self {
            name: family.name.clone(),
            risk: family.risk,
            keywords: family.keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

impl RiskRule for KeywordFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, text: &str) -> Option<RiskMatch> {
        self.keywords
            .iter()
            .find(|kw| contains_term(text, kw))
            .map(|kw| RiskMatch {
                family: self.name.clone(),
                risk_level: self.risk,
                keyword: kw.clone(),
            })
    }
}

/// Whether `term` occurs in `text` without being glued to surrounding letters
/// or digits. Edges of `term` that are not alphanumeric match anywhere, so
/// "$" still hits "$5000".
pub fn contains_term(text: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    let needs_left = term.chars().next().is_some_and(char::is_alphanumeric);
    let needs_right = term.chars().next_back().is_some_and(char::is_alphanumeric);

    text.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let left_ok = !needs_left
            || text[..start]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_alphanumeric());
        let right_ok = !needs_right || text[end..].chars().next().is_none_or(|c| !c.is_alphanumeric());
        left_ok && right_ok
    })
}
