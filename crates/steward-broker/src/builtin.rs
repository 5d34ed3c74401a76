//! Actions served in-process, usable without any external backend.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Duration;

use steward_core::{ActionCall, BackendResponse};

use crate::backend::{BackendError, CapabilityBackend};

pub const LOCAL_BACKEND: &str = "local";

/// Upper bound for the `wait` action.
const MAX_WAIT_MS: u64 = 60_000;

/// `noop`, `echo`, `set_variable`, and `wait`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

#[async_trait]
impl CapabilityBackend for LocalBackend {
    fn id(&self) -> &str {
        LOCAL_BACKEND
    }

    fn actions(&self) -> Vec<String> {
        ["noop", "echo", "set_variable", "wait"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn invoke(&self, call: &ActionCall) -> Result<BackendResponse, BackendError> {
        match call.action.as_str() {
            "noop" => Ok(BackendResponse::ok(Map::new())),
            "echo" => Ok(BackendResponse::ok(call.payload.clone())),
            "set_variable" => {
                let name = call
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| BackendError::Rejected("set_variable needs a 'name'".into()))?;
                let value = call.payload.get("value").cloned().unwrap_or(Value::Null);
                let mut result = Map::new();
                result.insert(name.to_string(), value);
                Ok(BackendResponse::ok(result))
            }
            "wait" => {
                let ms = call
                    .payload
                    .get("ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    .min(MAX_WAIT_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let mut result = Map::new();
                result.insert("waited_ms".into(), json!(ms));
                Ok(BackendResponse::ok(result))
            }
            other => Err(BackendError::Rejected(format!(
                "local backend has no action '{other}'"
            ))),
        }
    }

    async fn probe(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(action: &str, payload: Value) -> ActionCall {
        ActionCall::new(action, payload.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let r = LocalBackend.invoke(&call("echo", json!({"a": 1}))).await.unwrap();
        assert!(r.success);
        assert_eq!(r.result["a"], 1);
    }

    #[tokio::test]
    async fn test_set_variable() {
        let r = LocalBackend
            .invoke(&call("set_variable", json!({"name": "region", "value": "eu"})))
            .await
            .unwrap();
        assert_eq!(r.result["region"], "eu");

        let err = LocalBackend
            .invoke(&call("set_variable", json!({"value": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        assert!(LocalBackend.invoke(&call("launch", json!({}))).await.is_err());
    }
}
