#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use steward_config::{ApprovalConfig, ClassifierConfig, ExecutorConfig};
    use steward_core::{EventBus, NewTask, RiskLevel, Task, TaskStatus};
    use steward_store::{Auditor, InMemoryStore, Store};

    fn task(title: &str, body: &str) -> Task {
        NewTask::new(title, body).into_task().unwrap()
    }

    /// Insert a task and move it to `needs_action`, as ingestion does.
    fn ready(store: &Arc<dyn Store>, title: &str) -> Task {
        let t = task(title, "");
        store.insert_task(&t).unwrap();
        store
            .update_task(t.id, &mut |t| {
                t.transition(TaskStatus::NeedsAction, None)?;
                Ok(())
            })
            .unwrap()
    }

    // ── Risk assessment ────────────────────────────────────────

    mod risk {
        use super::*;
        use steward_autonomy::RiskAssessor;

        #[test]
        fn test_wire_transfer_is_high_payment() {
            let a = RiskAssessor::default();
            let f = a.assess(&task("wire transfer $5000", "")).unwrap();
            assert_eq!(f.family, "payment");
            assert_eq!(f.risk_level, RiskLevel::High);
            assert_eq!(f.flags, vec!["payment"]);
        }

        #[test]
        fn test_highest_level_wins_and_all_flags_kept() {
            let a = RiskAssessor::default();
            let f = a
                .assess(&task("Deploy billing fix", "then pay the invoice"))
                .unwrap();
            assert_eq!(f.family, "deploy");
            assert_eq!(f.risk_level, RiskLevel::Critical);
            assert_eq!(f.flags, vec!["deploy", "payment"]);
        }

        #[test]
        fn test_tie_goes_to_first_family() {
            // payment and database_change are both HIGH; payment is listed first.
            let a = RiskAssessor::default();
            let f = a.assess(&task("Refund via SQL", "")).unwrap();
            assert_eq!(f.family, "payment");
            assert_eq!(f.flags, vec!["database_change", "payment"]);
        }

        #[test]
        fn test_harmless_text_has_no_finding() {
            let a = RiskAssessor::default();
            assert!(a.assess(&task("Summarize the weekly notes", "")).is_none());
            assert!(a.assess(&task("New product launch ideas", "")).is_none());
        }

        #[test]
        fn test_matching_is_case_insensitive() {
            let a = RiskAssessor::default();
            let f = a.assess(&task("Rotate the API KEY", "")).unwrap();
            assert_eq!(f.family, "credential_access");
        }
    }

    // ── Approval gate ──────────────────────────────────────────

    mod gate {
        use super::*;
        use chrono::Utc;
        use steward_autonomy::{ApprovalGate, GateOutcome};
        use steward_core::{ApprovalStatus, Decision, EntityType, StewardError};
        use steward_store::AuditStore;
        use tokio_util::sync::CancellationToken;

        fn setup(timeout_secs: u64) -> (ApprovalGate, Arc<dyn Store>) {
            let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
            let auditor = Auditor::new(Arc::clone(&store), EventBus::default());
            let config = ApprovalConfig {
                timeout_secs,
                ..Default::default()
            };
            (ApprovalGate::new(&config, Arc::clone(&store), auditor), store)
        }

        fn park(gate: &ApprovalGate, store: &Arc<dyn Store>, title: &str) -> (Task, uuid::Uuid) {
            let t = ready(store, title);
            match gate.gate(&t).unwrap() {
                GateOutcome::Parked(req) => (t, req.id),
                GateOutcome::Clear => panic!("expected task to be parked"),
            }
        }

        #[test]
        fn test_harmless_task_is_clear() {
            let (gate, store) = setup(60);
            let t = ready(&store, "Summarize the weekly notes");
            assert!(matches!(gate.gate(&t).unwrap(), GateOutcome::Clear));
            assert_eq!(store.get_task(t.id).unwrap().unwrap().status, TaskStatus::NeedsAction);
        }

        #[test]
        fn test_sensitive_task_is_parked() {
            let (gate, store) = setup(60);
            let (t, approval_id) = park(&gate, &store, "wire transfer $5000");

            let stored = store.get_task(t.id).unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::InApproval);
            assert_eq!(stored.risk_level, Some(RiskLevel::High));
            assert_eq!(stored.approval_id, Some(approval_id));
            assert!(stored.lease.is_none());

            let req = store.get_approval(approval_id).unwrap().unwrap();
            assert_eq!(req.status, ApprovalStatus::Pending);
            assert_eq!(req.family, "payment");

            let events = store.all_events().unwrap();
            assert!(events.iter().any(|e| e.entity_type == EntityType::Approval));
        }

        #[test]
        fn test_approval_returns_task_to_queue() {
            let (gate, store) = setup(60);
            let (t, id) = park(&gate, &store, "wire transfer $5000");

            gate.apply_decision(&Decision::approve(id, "alice")).unwrap();

            let stored = store.get_task(t.id).unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::NeedsAction);
            assert!(stored.approved);
            // An approved task passes the gate without a second request.
            assert!(matches!(gate.gate(&stored).unwrap(), GateOutcome::Clear));
        }

        #[test]
        fn test_rejection_fails_task() {
            let (gate, store) = setup(60);
            let (t, id) = park(&gate, &store, "wire transfer $5000");

            gate.apply_decision(&Decision::reject(id, "bob", "not budgeted"))
                .unwrap();

            let stored = store.get_task(t.id).unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Failed);
            assert!(stored.terminal_reason.unwrap().contains("not budgeted"));
        }

        #[test]
        fn test_second_decision_is_refused() {
            let (gate, store) = setup(60);
            let (_, id) = park(&gate, &store, "wire transfer $5000");

            gate.apply_decision(&Decision::approve(id, "alice")).unwrap();
            let err = gate
                .apply_decision(&Decision::reject(id, "bob", "too late"))
                .unwrap_err();
            assert!(matches!(err, StewardError::ApprovalAlreadyDecided(_)));
            let req = store.get_approval(id).unwrap().unwrap();
            assert_eq!(req.status, ApprovalStatus::Approved);
        }

        #[test]
        fn test_unknown_approval() {
            let (gate, _) = setup(60);
            let err = gate
                .apply_decision(&Decision::approve(uuid::Uuid::new_v4(), "alice"))
                .unwrap_err();
            assert!(matches!(err, StewardError::ApprovalNotFound(_)));
        }

        #[test]
        fn test_expired_requests_are_rejected() {
            let (gate, store) = setup(0);
            let (t, id) = park(&gate, &store, "Deploy to production");

            assert_eq!(gate.expire_stale(Utc::now()).unwrap(), 1);

            let req = store.get_approval(id).unwrap().unwrap();
            assert_eq!(req.status, ApprovalStatus::Rejected);
            assert_eq!(req.reason.as_deref(), Some("timeout"));
            assert_eq!(req.decided_by.as_deref(), Some("system"));
            assert_eq!(store.get_task(t.id).unwrap().unwrap().status, TaskStatus::Failed);
            assert_eq!(gate.expire_stale(Utc::now()).unwrap(), 0);

            let expiry = store
                .all_events()
                .unwrap()
                .into_iter()
                .find(|e| e.entity_id == id.to_string() && e.to_state == "rejected")
                .unwrap();
            let cause = expiry.details["cause"].as_str().unwrap();
            assert!(cause.contains("timed out without a decision"), "{cause}");
        }

        #[test]
        fn test_pending_requests_within_deadline_are_kept() {
            let (gate, store) = setup(3600);
            park(&gate, &store, "Deploy to production");
            assert_eq!(gate.expire_stale(Utc::now()).unwrap(), 0);
        }

        #[tokio::test]
        async fn test_decisions_arrive_over_channel() {
            let (gate, store) = setup(60);
            let gate = Arc::new(gate);
            let (t, id) = park(&gate, &store, "wire transfer $5000");

            let rx = gate.take_receiver().unwrap();
            assert!(gate.take_receiver().is_none());
            let cancel = CancellationToken::new();
            let consumer = {
                let gate = Arc::clone(&gate);
                let cancel = cancel.clone();
                tokio::spawn(async move { gate.run_decisions(rx, cancel).await })
            };

            gate.decision_sender()
                .send(Decision::approve(id, "alice"))
                .await
                .unwrap();

            for _ in 0..100 {
                if store.get_task(t.id).unwrap().unwrap().status == TaskStatus::NeedsAction {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert_eq!(store.get_task(t.id).unwrap().unwrap().status, TaskStatus::NeedsAction);

            cancel.cancel();
            consumer.await.unwrap();
        }
    }

    // ── Planning ───────────────────────────────────────────────

    mod planning {
        use super::*;
        use steward_autonomy::{PlanSource, Planner};
        use steward_core::{GroupPolicy, StepSpec, StewardError};

        fn planner(executor: ExecutorConfig) -> Planner {
            Planner::from_config(&executor, &ClassifierConfig::default())
        }

        #[test]
        fn test_single_step_default() {
            let mut t = task("Fix the parser", "body text");
            t.skill = Some("coding".into());
            let (plan, source) = planner(ExecutorConfig::default()).plan(&t).unwrap();
            assert_eq!(source, PlanSource::SingleStep);
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].id, "execute");
            assert_eq!(plan.steps[0].params["title"], "Fix the parser");
        }

        #[test]
        fn test_template_for_skill() {
            let mut executor = ExecutorConfig::default();
            executor.templates.insert(
                "research".into(),
                vec![
                    StepSpec::new("gather", "echo").in_group("fetch"),
                    StepSpec::new("summarize", "echo").after(&["gather"]),
                ],
            );
            executor
                .group_policies
                .insert("fetch".into(), GroupPolicy::ContinueOthers);

            let mut t = task("Look into caching", "");
            t.skill = Some("research".into());
            let (plan, source) = planner(executor).plan(&t).unwrap();
            assert_eq!(source, PlanSource::Template);
            assert_eq!(plan.steps.len(), 2);
            assert_eq!(plan.group_policy("fetch"), GroupPolicy::ContinueOthers);
        }

        #[test]
        fn test_requested_plan_wins() {
            let mut executor = ExecutorConfig::default();
            executor
                .templates
                .insert("research".into(), vec![StepSpec::new("t", "echo")]);
            let mut t = NewTask::new("x", "")
                .with_plan(vec![StepSpec::new("mine", "noop")])
                .into_task()
                .unwrap();
            t.skill = Some("research".into());
            let (plan, source) = planner(executor).plan(&t).unwrap();
            assert_eq!(source, PlanSource::Requested);
            assert_eq!(plan.steps[0].id, "mine");
        }

        #[test]
        fn test_task_group_policy_overrides_config() {
            let mut executor = ExecutorConfig::default();
            executor
                .group_policies
                .insert("notify".into(), GroupPolicy::FailFast);
            let t = NewTask::new("Announce release", "")
                .with_plan(vec![
                    StepSpec::new("mail", "echo").in_group("notify"),
                    StepSpec::new("chat", "echo").in_group("notify"),
                ])
                .with_group_policy("notify", GroupPolicy::ContinueOthers)
                .into_task()
                .unwrap();
            let (plan, _) = planner(executor).plan(&t).unwrap();
            assert_eq!(plan.group_policy("notify"), GroupPolicy::ContinueOthers);
        }

        #[test]
        fn test_cycle_is_rejected_at_planning() {
            let t = NewTask::new("x", "")
                .with_plan(vec![
                    StepSpec::new("a", "noop").after(&["b"]),
                    StepSpec::new("b", "noop").after(&["a"]),
                ])
                .into_task()
                .unwrap();
            let err = planner(ExecutorConfig::default()).plan(&t).unwrap_err();
            assert!(matches!(err, StewardError::CyclicDependency { .. }));
            assert!(err.to_string().contains("is part of a dependency cycle"));
        }
    }
}
