use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use steward_config::ClassifierConfig;
use steward_core::{AuditEvent, Confidence, EntityType, Task};
use steward_store::Auditor;

use crate::registry::SkillRegistry;

/// Score of one skill for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillScore {
    pub skill: String,
    pub score: u32,
}

/// Outcome of routing a task.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub skill: String,
    pub score: u32,
    pub confidence: Confidence,
    pub runner_up: Option<SkillScore>,
    /// True when nothing scored and the default skill was used.
    pub defaulted: bool,
    /// Every skill's score, best first.
    pub scores: Vec<SkillScore>,
}

pub fn has_code_block(text: &str) -> bool {
    text.contains("```")
}

pub fn has_checklist(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("- [ ]") || lower.contains("- [x]")
}

/// Scores tasks against the declared skill signatures.
///
/// Each keyword present in the title or body adds its weight once. A skill
/// named in the task's hint gets the hint bonus; skills with code-block or
/// checklist affinity get those bonuses when the body has one. Ties at the
/// top are broken by the configured skill priority, never by map order.
pub struct Classifier {
    registry: Arc<SkillRegistry>,
    hint_bonus: u32,
    code_block_bonus: u32,
    checklist_bonus: u32,
    high_threshold: u32,
    medium_threshold: u32,
    auditor: Auditor,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig, auditor: Auditor) -> Self {
        Self {
            registry: Arc::new(SkillRegistry::from_config(config)),
            hint_bonus: config.hint_bonus,
            code_block_bonus: config.code_block_bonus,
            checklist_bonus: config.checklist_bonus,
            high_threshold: config.high_threshold,
            medium_threshold: config.medium_threshold,
            auditor,
        }
    }

    pub fn registry(&self) -> Arc<SkillRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn confidence_for(&self, score: u32) -> Confidence {
        if score >= self.high_threshold {
            Confidence::High
        } else if score >= self.medium_threshold {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Score every skill, best first, ties in configured priority order.
    pub fn score(&self, task: &Task) -> Vec<SkillScore> {
        let text = task.text();
        let lower = text.to_lowercase();
        let hint = task.skill_hint.as_deref().map(str::to_lowercase);
        let code_block = has_code_block(&text);
        let checklist = has_checklist(&text);

        let mut scores: Vec<SkillScore> = self
            .registry
            .all()
            .iter()
            .map(|sig| {
                let mut score: u32 = sig
                    .keywords
                    .iter()
                    .filter(|k| lower.contains(&k.pattern.to_lowercase()))
                    .map(|k| k.weight)
                    .sum();
                if hint
                    .as_deref()
                    .is_some_and(|h| h.contains(&sig.name.to_lowercase()))
                {
                    score += self.hint_bonus;
                }
                if code_block && sig.code_block_affinity {
                    score += self.code_block_bonus;
                }
                if checklist && sig.checklist_affinity {
                    score += self.checklist_bonus;
                }
                SkillScore {
                    skill: sig.name.clone(),
                    score,
                }
            })
            .collect();

        scores.sort_by(|a, b| {
            b.score.cmp(&a.score).then_with(|| {
                self.registry
                    .tie_key(&a.skill)
                    .cmp(&self.registry.tie_key(&b.skill))
            })
        });
        scores
    }

    /// Pure routing decision, no side effects.
    pub fn evaluate(&self, task: &Task) -> Classification {
        let scores = self.score(task);
        let top = scores.first().filter(|s| s.score > 0).cloned();

        match top {
            Some(best) => Classification {
                confidence: self.confidence_for(best.score),
                runner_up: scores.get(1).filter(|s| s.score > 0).cloned(),
                skill: best.skill,
                score: best.score,
                defaulted: false,
                scores,
            },
            None => Classification {
                skill: self.registry.default_skill().to_string(),
                score: 0,
                confidence: self.confidence_for(0),
                runner_up: None,
                defaulted: true,
                scores,
            },
        }
    }

    /// Route a task and record the decision to the audit log.
    pub fn classify(&self, task: &Task) -> Classification {
        let result = self.evaluate(task);
        info!(
            task_id = %task.id,
            skill = %result.skill,
            score = result.score,
            confidence = %result.confidence,
            "task routed"
        );
        self.auditor.record(
            AuditEvent::new(
                EntityType::Routing,
                task.id.to_string(),
                task.skill.clone(),
                result.skill.clone(),
            )
            .with_reason(if result.defaulted {
                "no skill scored, using default"
            } else {
                "highest keyword score"
            })
            .with_details(json!({
                "score": result.score,
                "confidence": result.confidence,
                "runner_up": result.runner_up,
            })),
        );
        result
    }
}
