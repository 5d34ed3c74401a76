use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use steward_config::{ClassifierConfig, ExecutorConfig};
use steward_core::{GroupPolicy, Plan, Result, StepSpec, Task, validate_steps};

use crate::dag::detect_cycle;

/// Where a plan's steps came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Requested,
    Template,
    SingleStep,
}

/// Decomposes a routed task into a validated step graph.
///
/// Steps come from, in order: the plan supplied at ingestion, the template
/// configured for the task's skill, or a single `execute` step bound to the
/// skill's default action.
pub struct Planner {
    templates: HashMap<String, Vec<StepSpec>>,
    default_actions: HashMap<String, String>,
    group_policies: BTreeMap<String, GroupPolicy>,
}

impl Planner {
    pub fn from_config(executor: &ExecutorConfig, classifier: &ClassifierConfig) -> Self {
        Self {
            templates: executor.templates.clone(),
            default_actions: classifier
                .skills
                .iter()
                .map(|s| (s.name.clone(), s.default_action.clone()))
                .collect(),
            group_policies: executor.group_policies.clone(),
        }
    }

    pub fn plan(&self, task: &Task) -> Result<(Plan, PlanSource)> {
        let skill = task.skill.as_deref().unwrap_or_default();
        let (steps, source) = if let Some(requested) = &task.requested_plan {
            (requested.clone(), PlanSource::Requested)
        } else if let Some(template) = self.templates.get(skill) {
            (template.clone(), PlanSource::Template)
        } else {
            let action = self
                .default_actions
                .get(skill)
                .map(String::as_str)
                .unwrap_or("noop");
            let step = StepSpec::new("execute", action)
                .with_param("title", Value::String(task.title.clone()))
                .with_param("body", Value::String(task.body.clone()));
            (vec![step], PlanSource::SingleStep)
        };

        validate_steps(&steps)?;
        detect_cycle(&steps)?;

        let groups = steps
            .iter()
            .filter_map(|s| s.parallel_group.as_ref())
            .map(|g| {
                let policy = task
                    .requested_groups
                    .get(g)
                    .or_else(|| self.group_policies.get(g))
                    .copied()
                    .unwrap_or_default();
                (g.clone(), policy)
            })
            .collect();

        debug!(task_id = %task.id, skill, steps = steps.len(), ?source, "plan built");
        Ok((
            Plan {
                task_id: task.id,
                steps,
                groups,
                created_at: Utc::now(),
            },
            source,
        ))
    }
}
