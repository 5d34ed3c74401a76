//! Graph checks over a plan's steps.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use steward_core::{PlanState, Result, StepSpec, StepState, StewardError};

/// Fail with `CyclicDependency` if the dependency graph has a cycle.
pub fn detect_cycle(steps: &[StepSpec]) -> Result<()> {
    let adj: HashMap<&str, Vec<&str>> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        visited.insert(node);
        rec_stack.insert(node);

        if let Some(neighbors) = adj.get(node) {
            for &neighbor in neighbors {
                if !visited.contains(neighbor) {
                    if let Some(cycle_node) = dfs(neighbor, adj, visited, rec_stack) {
                        return Some(cycle_node);
                    }
                } else if rec_stack.contains(neighbor) {
                    return Some(neighbor);
                }
            }
        }

        rec_stack.remove(node);
        None
    }

    // Declaration order keeps the reported step stable between runs.
    for step in steps {
        if !visited.contains(step.id.as_str())
            && let Some(cycle_node) = dfs(step.id.as_str(), &adj, &mut visited, &mut rec_stack)
        {
            return Err(StewardError::CyclicDependency {
                step: cycle_node.to_string(),
            });
        }
    }
    Ok(())
}

/// Steps that may start at `now`: pending or due for retry, with every dependency
/// complete. Nothing new starts on a halted plan outside a draining group.
pub fn ready_steps(state: &PlanState, now: DateTime<Utc>) -> Vec<String> {
    state
        .plan
        .steps
        .iter()
        .filter(|spec| match state.record(&spec.id) {
            Some(r) if r.state == StepState::Pending => true,
            Some(r) if r.state == StepState::Retrying => r.next_attempt_at.is_none_or(|t| t <= now),
            _ => false,
        })
        .filter(|spec| dependencies_satisfied(state, spec))
        .filter(|spec| state.may_start(&spec.id))
        .map(|spec| spec.id.clone())
        .collect()
}

pub fn dependencies_satisfied(state: &PlanState, spec: &StepSpec) -> bool {
    spec.depends_on
        .iter()
        .all(|dep| state.state_of(dep) == Some(StepState::Complete))
}

/// Every step that transitively depends on `step_id`.
pub fn dependents(steps: &[StepSpec], step_id: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut frontier = vec![step_id.to_string()];
    let mut seen = HashSet::new();
    while let Some(current) = frontier.pop() {
        for spec in steps {
            if spec.depends_on.contains(&current) && seen.insert(spec.id.clone()) {
                out.push(spec.id.clone());
                frontier.push(spec.id.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use steward_core::Plan;

    fn diamond() -> Vec<StepSpec> {
        vec![
            StepSpec::new("a", "noop"),
            StepSpec::new("b", "noop").after(&["a"]),
            StepSpec::new("c", "noop").after(&["a"]),
            StepSpec::new("d", "noop").after(&["b", "c"]),
        ]
    }

    #[test]
    fn test_two_node_cycle() {
        let steps = vec![
            StepSpec::new("a", "noop").after(&["b"]),
            StepSpec::new("b", "noop").after(&["a"]),
        ];
        let err = detect_cycle(&steps).unwrap_err();
        assert!(matches!(err, StewardError::CyclicDependency { ref step } if step == "a"));
    }

    #[test]
    fn test_self_loop() {
        let steps = vec![StepSpec::new("a", "noop").after(&["a"])];
        assert!(detect_cycle(&steps).is_err());
    }

    #[test]
    fn test_diamond_is_acyclic() {
        assert!(detect_cycle(&diamond()).is_ok());
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let mut state = PlanState::new(Plan {
            task_id: uuid::Uuid::new_v4(),
            steps: diamond(),
            groups: BTreeMap::new(),
            created_at: Utc::now(),
        });
        assert_eq!(ready_steps(&state, Utc::now()), vec!["a"]);

        state.record_mut("a").unwrap().state = StepState::Complete;
        assert_eq!(ready_steps(&state, Utc::now()), vec!["b", "c"]);

        state.record_mut("b").unwrap().state = StepState::Complete;
        assert_eq!(ready_steps(&state, Utc::now()), vec!["c"]);

        state.record_mut("c").unwrap().state = StepState::Complete;
        assert_eq!(ready_steps(&state, Utc::now()), vec!["d"]);
    }

    #[test]
    fn test_retrying_step_waits_for_backoff() {
        let mut state = PlanState::new(Plan {
            task_id: uuid::Uuid::new_v4(),
            steps: vec![StepSpec::new("a", "noop")],
            groups: BTreeMap::new(),
            created_at: Utc::now(),
        });
        let now = Utc::now();
        let rec = state.record_mut("a").unwrap();
        rec.state = StepState::Retrying;
        rec.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(ready_steps(&state, now).is_empty());
        assert_eq!(ready_steps(&state, now + chrono::Duration::seconds(5)), vec!["a"]);
    }

    #[test]
    fn test_blocked_step_stops_new_work() {
        let mut state = PlanState::new(Plan {
            task_id: uuid::Uuid::new_v4(),
            steps: diamond(),
            groups: BTreeMap::new(),
            created_at: Utc::now(),
        });
        state.record_mut("a").unwrap().state = StepState::Complete;
        state.record_mut("b").unwrap().state = StepState::Blocked;
        assert!(ready_steps(&state, Utc::now()).is_empty());
    }

    #[test]
    fn test_dependents_are_transitive() {
        let mut deps = dependents(&diamond(), "a");
        deps.sort();
        assert_eq!(deps, vec!["b", "c", "d"]);
        assert_eq!(dependents(&diamond(), "b"), vec!["d"]);
        assert!(dependents(&diamond(), "d").is_empty());
    }
}
