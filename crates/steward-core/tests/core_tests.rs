#[cfg(test)]
mod tests {
    use steward_core::*;

    // ── Task transitions ───────────────────────────────────────

    mod transitions {
        use super::*;
        use TaskStatus::*;

        #[test]
        fn test_valid_transitions() {
            let valid = [
                (New, NeedsAction),
                (New, Failed),
                (NeedsAction, InApproval),
                (NeedsAction, Executing),
                (InApproval, Approved),
                (InApproval, Rejected),
                (Approved, NeedsAction),
                (Rejected, Failed),
                (Executing, Done),
                (Executing, Failed),
                (Executing, Blocked),
                (Executing, NeedsAction),
                (Blocked, NeedsAction),
                (Blocked, Failed),
            ];
            for (from, to) in valid {
                assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
            }
        }

        #[test]
        fn test_invalid_transitions() {
            let invalid = [
                (New, Executing),
                (NeedsAction, Done),
                (InApproval, Executing),
                (Approved, Executing),
                (Rejected, NeedsAction),
                (Blocked, Executing),
                (Done, NeedsAction),
                (Failed, NeedsAction),
                (Done, Failed),
            ];
            for (from, to) in invalid {
                assert!(
                    matches!(
                        validate_transition(from, to),
                        Err(StewardError::InvalidTransition { .. })
                    ),
                    "{from} -> {to} should be rejected"
                );
            }
        }

        #[test]
        fn test_terminal_states_have_no_exits() {
            for from in [Done, Failed] {
                for to in TaskStatus::ALL {
                    assert!(validate_transition(from, to).is_err());
                }
            }
        }

        #[test]
        fn test_status_parse_roundtrip() {
            for st in TaskStatus::ALL {
                assert_eq!(st.as_str().parse::<TaskStatus>().unwrap(), st);
            }
            assert!("sleeping".parse::<TaskStatus>().is_err());
        }
    }

    // ── Ingestion ──────────────────────────────────────────────

    mod ingestion {
        use super::*;

        #[test]
        fn test_new_task_defaults() {
            let task = NewTask::new("Write report", "quarterly numbers")
                .into_task()
                .unwrap();
            assert_eq!(task.status, TaskStatus::New);
            assert_eq!(task.priority, Priority::Standard);
            assert_eq!(task.source, "manual");
            assert!(task.lease.is_none());
            assert!(!task.approved);
        }

        #[test]
        fn test_empty_title_rejected() {
            let err = NewTask::new("   ", "body").into_task().unwrap_err();
            assert!(matches!(err, StewardError::Validation(_)));
        }

        #[test]
        fn test_malformed_plan_rejected_at_ingestion() {
            let err = NewTask::new("t", "")
                .with_plan(vec![StepSpec::new("a", "")])
                .into_task()
                .unwrap_err();
            assert!(matches!(err, StewardError::Validation(_)));
        }

        #[test]
        fn test_cyclic_plan_passes_ingestion() {
            // Cycles are a planning failure, not an ingestion failure.
            let task = NewTask::new("t", "")
                .with_plan(vec![
                    StepSpec::new("a", "noop").after(&["b"]),
                    StepSpec::new("b", "noop").after(&["a"]),
                ])
                .into_task();
            assert!(task.is_ok());
        }

        #[test]
        fn test_ingestion_json_shape() {
            let raw = r#"{
                "title": "Pay the invoice",
                "body": "wire transfer $5000",
                "priority": "urgent",
                "skill_hint": "communication",
                "source": "inbox"
            }"#;
            let new: NewTask = serde_json::from_str(raw).unwrap();
            let task = new.into_task().unwrap();
            assert_eq!(task.priority, Priority::Urgent);
            assert_eq!(task.skill_hint.as_deref(), Some("communication"));
            assert_eq!(task.source, "inbox");
        }

        #[test]
        fn test_group_policies_from_json() {
            let raw = r#"{
                "title": "Announce release",
                "plan": [
                    {"id": "mail", "action": "mail.send", "parallel_group": "notify"},
                    {"id": "chat", "action": "chat.post", "parallel_group": "notify"}
                ],
                "groups": {"notify": "continue_others"}
            }"#;
            let task = serde_json::from_str::<NewTask>(raw).unwrap().into_task().unwrap();
            assert_eq!(
                task.requested_groups.get("notify"),
                Some(&GroupPolicy::ContinueOthers)
            );
        }

        #[test]
        fn test_policy_for_unused_group_rejected() {
            let err = NewTask::new("t", "")
                .with_plan(vec![StepSpec::new("a", "noop")])
                .with_group_policy("ghost", GroupPolicy::FailFast)
                .into_task()
                .unwrap_err();
            assert!(matches!(err, StewardError::Validation(_)));
        }

        #[test]
        fn test_blank_hint_dropped() {
            let task = NewTask::new("t", "").with_hint("  ").into_task().unwrap();
            assert!(task.skill_hint.is_none());
        }
    }

    // ── Leases ─────────────────────────────────────────────────

    mod leases {
        use super::*;
        use chrono::{Duration, Utc};

        #[test]
        fn test_claimable_only_when_needs_action_and_lease_free() {
            let now = Utc::now();
            let mut task = NewTask::new("t", "").into_task().unwrap();
            assert!(!task.is_claimable(now));

            task.transition(TaskStatus::NeedsAction, None).unwrap();
            assert!(task.is_claimable(now));

            task.lease = Some(Lease {
                worker_id: "w1".into(),
                expires_at: now + Duration::seconds(30),
            });
            assert!(!task.is_claimable(now));
            assert!(task.is_leased_by("w1", now));
            assert!(!task.is_leased_by("w2", now));

            // Expired lease frees the task again.
            assert!(task.is_claimable(now + Duration::seconds(31)));
        }
    }

    // ── Audit events ───────────────────────────────────────────

    mod events {
        use super::*;
        use uuid::Uuid;

        #[test]
        fn test_step_event_task_id() {
            let id = Uuid::new_v4();
            let ev = AuditEvent::step(id, "fetch", StepState::Pending, StepState::Executing);
            assert_eq!(ev.entity_id, format!("{id}/fetch"));
            assert_eq!(ev.task_id(), Some(id));
            assert_eq!(ev.from_state.as_deref(), Some("pending"));
        }

        #[tokio::test]
        async fn test_event_bus_delivers() {
            let bus = EventBus::new(16);
            let mut rx = bus.subscribe();
            let id = Uuid::new_v4();
            bus.publish(
                AuditEvent::task(id, TaskStatus::New, TaskStatus::NeedsAction).with_reason("classified"),
            );
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.to_state, "needs_action");
            assert_eq!(ev.reason.as_deref(), Some("classified"));
        }

        #[test]
        fn test_publish_without_subscribers_is_fine() {
            let bus = EventBus::default();
            bus.publish(AuditEvent::new(EntityType::Backend, "mail", None, "healthy"));
        }
    }
}
