#[cfg(test)]
mod tests {
    use steward_config::ConfigLoader;
    use steward_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.lease_ttl_secs, 60);
        assert_eq!(config.reaper_interval_secs, 10);
    }

    #[test]
    fn test_classifier_defaults() {
        let config = ClassifierConfig::default();
        assert_eq!(config.default_skill, "planning");
        assert_eq!(config.hint_bonus, 10);
        assert_eq!(config.code_block_bonus, 5);
        assert_eq!(config.checklist_bonus, 3);
        assert_eq!(config.skills.len(), 6);
        let coding = config.skills.iter().find(|s| s.name == "coding").unwrap();
        assert!(coding.code_block_affinity);
        assert!(coding.keywords.iter().any(|k| k.pattern == ".py"));
    }

    #[test]
    fn test_approval_defaults() {
        let config = ApprovalConfig::default();
        assert_eq!(config.timeout_secs, 86_400);
        let deploy = config.families.iter().find(|f| f.name == "deploy").unwrap();
        assert_eq!(deploy.risk, steward_core::RiskLevel::Critical);
        let social = config.families.iter().find(|f| f.name == "social_post").unwrap();
        assert_eq!(social.risk, steward_core::RiskLevel::Low);
    }

    #[test]
    fn test_broker_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.healthy_threshold, 1);
        assert!(config.actions.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        let warnings = StewardConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    // ── Parsing ────────────────────────────────────────────────

    #[test]
    fn test_parse_partial_toml_fills_defaults() {
        let raw = r#"
            [engine]
            workers = 8

            [store]
            backend = "memory"
        "#;
        let config: StewardConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.lease_ttl_secs, 60);
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_keyword_forms() {
        let raw = r#"
            [classifier]
            default_skill = "ops"
            skill_priority = ["ops"]

            [[classifier.skills]]
            name = "ops"
            keywords = ["restart", { pattern = "outage", weight = 4 }]
        "#;
        let config: StewardConfig = toml::from_str(raw).unwrap();
        let ops = &config.classifier.skills[0];
        assert_eq!(ops.keywords[0].weight, 1);
        assert_eq!(ops.keywords[1].pattern, "outage");
        assert_eq!(ops.keywords[1].weight, 4);
        assert_eq!(ops.default_action, "noop");
    }

    #[test]
    fn test_parse_actions_and_fallbacks() {
        let raw = r#"
            [[broker.actions]]
            name = "email/send"
            backend = "email"
            failure_class = "transient"
            fallback = { response = { queued = true } }

            [[broker.actions]]
            name = "social/post"
            backend = "social"
            failure_class = "permanent"
            fallback = { action = "email/send" }
        "#;
        let config: StewardConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.broker.actions.len(), 2);
        assert!(matches!(
            config.broker.actions[0].fallback,
            Some(FallbackConfig::Static { .. })
        ));
        assert_eq!(
            config.broker.actions[1].fallback,
            Some(FallbackConfig::Action {
                action: "email/send".into()
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_templates() {
        let raw = r#"
            [[executor.templates.research]]
            id = "gather"
            action = "echo"
            parallel_group = "fanout"

            [[executor.templates.research]]
            id = "summarize"
            action = "echo"
            depends_on = ["gather"]
            validation = { type = "output_exists", key = "summary" }

            [executor.group_policies]
            fanout = "continue_others"
        "#;
        let config: StewardConfig = toml::from_str(raw).unwrap();
        let steps = &config.executor.templates["research"];
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].depends_on, vec!["gather".to_string()]);
        assert_eq!(
            config.executor.group_policies["fanout"],
            steward_core::GroupPolicy::ContinueOthers
        );
    }

    // ── Validation ─────────────────────────────────────────────

    #[test]
    fn test_zero_workers_is_error() {
        let mut config = StewardConfig::default();
        config.engine.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("engine.workers"));
    }

    #[test]
    fn test_unknown_default_skill_is_error() {
        let mut config = StewardConfig::default();
        config.classifier.default_skill = "juggling".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_priority_entry_is_warning() {
        let mut config = StewardConfig::default();
        config.classifier.skill_priority.push("juggling".into());
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "classifier.skill_priority"
            && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_fallback_to_unknown_action_is_error() {
        let mut config = StewardConfig::default();
        config.broker.actions.push(ActionConfig {
            name: "a".into(),
            backend: "b".into(),
            failure_class: steward_core::FailureClass::Transient,
            fallback: Some(FallbackConfig::Action {
                action: "missing".into(),
            }),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_template_is_error() {
        let mut config = StewardConfig::default();
        config.executor.templates.insert(
            "coding".into(),
            vec![steward_core::StepSpec::new("a", "noop").after(&["nope"])],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_thresholds_is_error() {
        let mut config = StewardConfig::default();
        config.classifier.medium_threshold = 20;
        assert!(config.validate().is_err());
    }

    // ── Loader ─────────────────────────────────────────────────

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[engine]\nreaper_interval_secs = 3\n\n[logging]\nformat = \"json\"").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        let config = loader.get();
        assert_eq!(config.engine.reaper_interval_secs, 3);
        assert_eq!(config.logging.format, "json");
        assert_eq!(loader.path(), path.as_path());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loader.get().classifier.default_skill, "planning");
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        std::fs::write(&path, "[engine\nworkers = ").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_invalid_values_names_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        std::fs::write(&path, "[executor]\nmax_parallel = 0\n").unwrap();
        match ConfigLoader::load(Some(&path)) {
            Err(steward_core::StewardError::ConfigValidation { field, .. }) => {
                assert_eq!(field, "executor.max_parallel");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("invalid config loaded"),
        }
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        std::fs::write(&path, "[approval]\ntimeout_secs = 60\n").unwrap();
        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().approval.timeout_secs, 60);

        std::fs::write(&path, "[approval]\ntimeout_secs = 120\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().approval.timeout_secs, 120);
    }

    #[test]
    fn test_reload_rejects_invalid_and_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        std::fs::write(&path, "[engine]\nworkers = 2\n").unwrap();
        let loader = ConfigLoader::load(Some(&path)).unwrap();

        std::fs::write(&path, "[engine]\nworkers = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().engine.workers, 2);
    }

    #[test]
    fn test_resolve_explicit_path_wins() {
        let p = std::path::Path::new("/tmp/custom.toml");
        assert_eq!(ConfigLoader::resolve_path(Some(p)), p.to_path_buf());
    }
}
