#[cfg(test)]
mod tests {
    use serde_json::{Map, json};
    use std::sync::Arc;
    use steward_broker::*;
    use steward_config::{ActionConfig, BrokerConfig, FallbackConfig};
    use steward_core::{
        ActionCall, BackendResponse, EventBus, FailureClass, HealthStatus, StewardError,
    };
    use steward_store::{Auditor, InMemoryStore, Store};

    fn store() -> Arc<dyn Store> {
        Arc::new(InMemoryStore::new())
    }

    fn broker_with(config: BrokerConfig, backends: &[MockBackend]) -> (CapabilityBroker, Arc<dyn Store>) {
        let store = store();
        let auditor = Auditor::new(Arc::clone(&store), EventBus::default());
        let mut broker = CapabilityBroker::new(&config, Arc::clone(&store), auditor);
        broker.add_backend(Arc::new(LocalBackend));
        for b in backends {
            broker.add_backend(Arc::new(b.clone()));
        }
        (broker, store)
    }

    fn call(action: &str) -> ActionCall {
        let mut payload = Map::new();
        payload.insert("to".into(), json!("ops@example.com"));
        ActionCall::new(action, payload)
    }

    async fn knock_down(broker: &CapabilityBroker, backend: &MockBackend) {
        backend.set_healthy(false);
        for _ in 0..3 {
            broker.probe_all().await;
        }
    }

    // ── Routing ────────────────────────────────────────────────

    mod routing {
        use super::*;

        #[tokio::test]
        async fn test_healthy_backend_is_called_directly() {
            let mail = MockBackend::new("mail", &["mail.send"]);
            mail.queue_ok(json!({"message_id": "m-1"}));
            let (broker, _) = broker_with(BrokerConfig::default(), &[mail.clone()]);

            let out = broker.route(call("mail.send").keyed(uuid::Uuid::nil(), "s", 1)).await.unwrap();
            assert!(!out.degraded && !out.deferred);
            assert_eq!(out.result["message_id"], "m-1");
            assert_eq!(mail.calls.lock()[0].idempotency_key, format!("{}:s:1", uuid::Uuid::nil()));
        }

        #[tokio::test]
        async fn test_builtin_actions_are_registered() {
            let (broker, _) = broker_with(BrokerConfig::default(), &[]);
            let out = broker.route(call("echo")).await.unwrap();
            assert_eq!(out.result["to"], "ops@example.com");
            assert!(broker.action("noop").is_some());
        }

        #[tokio::test]
        async fn test_unknown_action() {
            let (broker, _) = broker_with(BrokerConfig::default(), &[]);
            let err = broker.route(call("launch")).await.unwrap_err();
            assert!(matches!(err, BrokerError::UnknownAction(_)));
            assert_eq!(err.failure_class(), FailureClass::Permanent);
        }

        #[tokio::test]
        async fn test_failure_takes_declared_class() {
            let crm = MockBackend::new("crm", &[]);
            crm.fail_always(Ok(BackendResponse::failed("record locked")));
            let config = BrokerConfig {
                actions: vec![ActionConfig {
                    name: "crm.update".into(),
                    backend: "crm".into(),
                    failure_class: FailureClass::Permanent,
                    fallback: None,
                }],
                ..Default::default()
            };
            let (broker, _) = broker_with(config, &[crm]);

            let err = broker.route(call("crm.update")).await.unwrap_err();
            assert_eq!(err.failure_class(), FailureClass::Permanent);
            assert!(matches!(
                StewardError::from(err),
                StewardError::PermanentBackend { .. }
            ));
        }

        #[tokio::test]
        async fn test_unavailable_is_transient() {
            let crm = MockBackend::new("crm", &["crm.update"]);
            crm.fail_always(Err(BackendError::Unavailable("connection refused".into())));
            let (broker, _) = broker_with(BrokerConfig::default(), &[crm]);

            let err = broker.route(call("crm.update")).await.unwrap_err();
            assert!(matches!(err, BrokerError::BackendUnavailable { .. }));
            assert!(matches!(
                StewardError::from(err),
                StewardError::TransientBackend { .. }
            ));
        }

        #[tokio::test]
        async fn test_rejected_payload_is_permanent() {
            let crm = MockBackend::new("crm", &["crm.update"]);
            crm.queue_response(Err(BackendError::Rejected("missing field".into())));
            let (broker, _) = broker_with(BrokerConfig::default(), &[crm]);
            let err = broker.route(call("crm.update")).await.unwrap_err();
            assert!(matches!(err, BrokerError::BackendRejected { .. }));
            assert_eq!(err.failure_class(), FailureClass::Permanent);
        }

        #[tokio::test]
        async fn test_slow_backend_times_out() {
            let slow = MockBackend::new("slow", &["slow.op"]);
            slow.set_delay(std::time::Duration::from_millis(200));
            let config = BrokerConfig {
                call_timeout_ms: 20,
                ..Default::default()
            };
            let (broker, _) = broker_with(config, &[slow]);
            let err = broker.route(call("slow.op")).await.unwrap_err();
            assert!(matches!(err, BrokerError::BackendTimeout { .. }));
        }
    }

    // ── Health & fallback ──────────────────────────────────────

    mod health {
        use super::*;
        use steward_core::EntityType;
        use steward_store::{AuditStore, TaskBoard};

        fn with_fallback(fallback: Option<FallbackConfig>) -> BrokerConfig {
            BrokerConfig {
                actions: vec![ActionConfig {
                    name: "mail.send".into(),
                    backend: "mail".into(),
                    failure_class: FailureClass::Transient,
                    fallback,
                }],
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_three_failed_probes_flip_to_unhealthy() {
            let mail = MockBackend::new("mail", &[]);
            let (broker, store) = broker_with(with_fallback(None), &[mail.clone()]);

            mail.set_healthy(false);
            broker.probe_all().await;
            broker.probe_all().await;
            assert_eq!(broker.health().status("mail"), HealthStatus::Healthy);
            broker.probe_all().await;
            assert_eq!(broker.health().status("mail"), HealthStatus::Unhealthy);

            mail.set_healthy(true);
            broker.probe_all().await;
            assert_eq!(broker.health().status("mail"), HealthStatus::Healthy);

            let flips: Vec<_> = store
                .all_events()
                .unwrap()
                .into_iter()
                .filter(|e| e.entity_type == EntityType::Backend && e.entity_id == "mail")
                .collect();
            assert_eq!(flips.len(), 2);
            assert_eq!(flips[0].to_state, "unhealthy");
            assert_eq!(flips[1].to_state, "healthy");

            let board = TaskBoard::rebuild(&store.all_events().unwrap());
            assert_eq!(board.backends().get("mail").map(String::as_str), Some("healthy"));
        }

        #[tokio::test]
        async fn test_static_fallback_is_degraded() {
            let mail = MockBackend::new("mail", &[]);
            let mut response = Map::new();
            response.insert("queued".into(), json!(false));
            let (broker, _) = broker_with(
                with_fallback(Some(FallbackConfig::Static { response })),
                &[mail.clone()],
            );
            knock_down(&broker, &mail).await;

            let out = broker.route(call("mail.send")).await.unwrap();
            assert!(out.degraded);
            assert_eq!(out.result["queued"], false);
            assert_eq!(mail.call_count(), 0);
        }

        #[tokio::test]
        async fn test_action_fallback_routes_elsewhere() {
            let mail = MockBackend::new("mail", &[]);
            let sms = MockBackend::new("sms", &["sms.send"]);
            sms.queue_ok(json!({"sent": true}));
            let (broker, _) = broker_with(
                with_fallback(Some(FallbackConfig::Action {
                    action: "sms.send".into(),
                })),
                &[mail.clone(), sms.clone()],
            );
            knock_down(&broker, &mail).await;

            let out = broker.route(call("mail.send")).await.unwrap();
            assert!(out.degraded);
            assert_eq!(out.result["sent"], true);
            assert_eq!(sms.calls_for("sms.send").len(), 1);
        }

        #[tokio::test]
        async fn test_fallback_to_unhealthy_backend_is_exhausted() {
            let mail = MockBackend::new("mail", &[]);
            let sms = MockBackend::new("sms", &["sms.send"]);
            let (broker, _) = broker_with(
                with_fallback(Some(FallbackConfig::Action {
                    action: "sms.send".into(),
                })),
                &[mail.clone(), sms.clone()],
            );
            mail.set_healthy(false);
            sms.set_healthy(false);
            for _ in 0..3 {
                broker.probe_all().await;
            }
            let err = broker.route(call("mail.send")).await.unwrap_err();
            assert!(matches!(err, BrokerError::FallbackExhausted { .. }));
        }

        #[tokio::test]
        async fn test_deferred_calls_replay_on_recovery() {
            let mail = MockBackend::new("mail", &[]);
            let (broker, store) = broker_with(with_fallback(None), &[mail.clone()]);
            knock_down(&broker, &mail).await;

            let out = broker.route(call("mail.send")).await.unwrap();
            assert!(out.deferred);
            assert!(out.result.contains_key("deferred_id"));
            assert_eq!(store.deferred_count().unwrap(), 1);
            assert_eq!(mail.call_count(), 0);

            mail.set_healthy(true);
            broker.probe_all().await;

            assert_eq!(mail.calls_for("mail.send").len(), 1);
            assert_eq!(store.deferred_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_failed_replay_is_retried_while_healthy() {
            let mail = MockBackend::new("mail", &[]);
            let (broker, store) = broker_with(with_fallback(None), &[mail.clone()]);
            knock_down(&broker, &mail).await;
            broker.route(call("mail.send")).await.unwrap();

            mail.queue_response(Err(BackendError::Unavailable("still warming up".into())));
            mail.set_healthy(true);
            broker.probe_all().await;
            assert_eq!(broker.health().status("mail"), HealthStatus::Healthy);
            assert_eq!(store.deferred_count().unwrap(), 1);

            broker.probe_all().await;
            assert_eq!(mail.calls_for("mail.send").len(), 2);
            assert_eq!(store.deferred_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_deferred_call_dropped_after_failed_replays() {
            let mail = MockBackend::new("mail", &[]);
            let config = BrokerConfig {
                max_replay_attempts: 2,
                ..with_fallback(None)
            };
            let (broker, store) = broker_with(config, &[mail.clone()]);
            knock_down(&broker, &mail).await;
            broker.route(call("mail.send")).await.unwrap();

            mail.fail_always(Err(BackendError::Unavailable("still warming up".into())));
            let first = broker.replay_deferred("mail").await.unwrap();
            assert_eq!(first.failed, 1);
            assert_eq!(store.deferred_count().unwrap(), 1);

            let second = broker.replay_deferred("mail").await.unwrap();
            assert_eq!(second.dropped, 1);
            assert_eq!(store.deferred_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_monitor_stops_on_cancel() {
            let mail = MockBackend::new("mail", &[]);
            let (broker, _) = broker_with(with_fallback(None), &[mail.clone()]);
            let broker = Arc::new(broker);
            mail.set_healthy(false);

            let cancel = tokio_util::sync::CancellationToken::new();
            let monitor = HealthMonitor::new(Arc::clone(&broker), std::time::Duration::from_millis(10));
            let handle = tokio::spawn(monitor.run(cancel.clone()));

            for _ in 0..100 {
                if broker.health().status("mail") == HealthStatus::Unhealthy {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert_eq!(broker.health().status("mail"), HealthStatus::Unhealthy);
            cancel.cancel();
            handle.await.unwrap();
        }
    }
}
