use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use steward_core::{PartialAcceptance, ValidationRule};

/// A named check over a step's outputs.
pub type Predicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Named predicates that `ValidationRule::Predicate` can refer to.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Predicate>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// Check `outputs` against `rule`. The error names what was missing.
    pub fn check(&self, rule: &ValidationRule, outputs: &Map<String, Value>) -> Result<(), String> {
        match rule {
            ValidationRule::Always => Ok(()),
            ValidationRule::OutputExists { key } => match outputs.get(key) {
                Some(v) if !v.is_null() => Ok(()),
                _ => Err(format!("output '{key}' missing")),
            },
            ValidationRule::Threshold { key, min } => match number(outputs, key) {
                Some(n) if n >= *min => Ok(()),
                Some(n) => Err(format!("output '{key}' = {n} is below {min}")),
                None => Err(format!("output '{key}' is not a number")),
            },
            ValidationRule::Predicate { name } => match self.predicates.get(name) {
                Some(pred) if pred(outputs) => Ok(()),
                Some(_) => Err(format!("predicate '{name}' failed")),
                None => Err(format!("predicate '{name}' is not registered")),
            },
        }
    }
}

/// Whether the outputs of a failed validation still clear the partial minimum.
pub fn partial_met(partial: Option<&PartialAcceptance>, outputs: &Map<String, Value>) -> bool {
    partial.is_some_and(|p| number(outputs, &p.key).is_some_and(|n| n >= p.min))
}

fn number(outputs: &Map<String, Value>, key: &str) -> Option<f64> {
    outputs.get(key).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_output_exists() {
        let reg = PredicateRegistry::new();
        let rule = ValidationRule::OutputExists { key: "id".into() };
        assert!(reg.check(&rule, &outputs(json!({"id": 7}))).is_ok());
        assert!(reg.check(&rule, &outputs(json!({"id": null}))).is_err());
        assert!(reg.check(&rule, &outputs(json!({}))).is_err());
    }

    #[test]
    fn test_threshold_and_partial() {
        let reg = PredicateRegistry::new();
        let rule = ValidationRule::Threshold {
            key: "rows".into(),
            min: 100.0,
        };
        let out = outputs(json!({"rows": 60}));
        assert!(reg.check(&rule, &out).is_err());

        let partial = PartialAcceptance {
            key: "rows".into(),
            min: 50.0,
        };
        assert!(partial_met(Some(&partial), &out));
        assert!(!partial_met(None, &out));
    }

    #[test]
    fn test_predicates() {
        let mut reg = PredicateRegistry::new();
        reg.register("non_empty", |o| !o.is_empty());
        let rule = ValidationRule::Predicate {
            name: "non_empty".into(),
        };
        assert!(reg.check(&rule, &outputs(json!({"a": 1}))).is_ok());
        assert!(reg.check(&rule, &Map::new()).is_err());
        let unknown = ValidationRule::Predicate { name: "nope".into() };
        assert!(reg.check(&unknown, &Map::new()).is_err());
    }
}
