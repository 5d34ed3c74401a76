use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use steward_core::{FailureClass, GroupPolicy, RetryPolicy, RiskLevel, StepSpec};

/// Root configuration, mapped from `steward.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub classifier: ClassifierConfig,
    pub approval: ApprovalConfig,
    pub executor: ExecutorConfig,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent task workers.
    pub workers: usize,
    /// Lease length granted on claim and on every renewal.
    pub lease_ttl_secs: u64,
    /// Idle wait between empty selections.
    pub poll_interval_ms: u64,
    /// How often expired leases are requeued and stale approvals swept.
    pub reaper_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_ttl_secs: 60,
            poll_interval_ms: 500,
            reaper_interval_secs: 10,
        }
    }
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "sqlite" or "memory".
    pub backend: String,
    /// Database path. None = ~/.steward/steward.db
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".into(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".steward")
                .join("steward.db")
        })
    }
}

// ── Classifier ─────────────────────────────────────────────────

/// A keyword and the score it adds when present. Accepts a bare string (weight 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "KeywordEntry")]
pub struct KeywordRule {
    pub pattern: String,
    pub weight: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeywordEntry {
    Plain(String),
    Weighted {
        pattern: String,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

fn default_weight() -> u32 {
    1
}

impl From<KeywordEntry> for KeywordRule {
    fn from(entry: KeywordEntry) -> Self {
        match entry {
            KeywordEntry::Plain(pattern) => KeywordRule { pattern, weight: 1 },
            KeywordEntry::Weighted { pattern, weight } => KeywordRule { pattern, weight },
        }
    }
}

/// Declared signature of one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSignature {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
    /// Receives the code-block bonus.
    #[serde(default)]
    pub code_block_affinity: bool,
    /// Receives the checklist bonus.
    #[serde(default)]
    pub checklist_affinity: bool,
    /// Action bound by the single-step default plan.
    #[serde(default = "default_action")]
    pub default_action: String,
}

fn default_action() -> String {
    "noop".into()
}

impl SkillSignature {
    fn from_words(name: &str, words: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: words
                .iter()
                .map(|w| KeywordRule {
                    pattern: (*w).into(),
                    weight: 1,
                })
                .collect(),
            code_block_affinity: false,
            checklist_affinity: false,
            default_action: default_action(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Skill used when nothing scores.
    pub default_skill: String,
    /// Tie-break order at the top score. Unlisted skills rank after listed ones, by name.
    pub skill_priority: Vec<String>,
    pub hint_bonus: u32,
    pub code_block_bonus: u32,
    pub checklist_bonus: u32,
    /// Score at or above which confidence is "high".
    pub high_threshold: u32,
    /// Score at or above which confidence is "medium".
    pub medium_threshold: u32,
    pub skills: Vec<SkillSignature>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let mut coding = SkillSignature::from_words(
            "coding",
            &[
                "code", "function", "api", "script", "implement", "build", "develop", "refactor",
                "debug", "test", "endpoint", "module", "program", "software", "application",
                ".py", ".js", ".ts",
            ],
        );
        coding.code_block_affinity = true;
        let mut planning = SkillSignature::from_words(
            "planning",
            &[
                "plan", "strategy", "roadmap", "design", "architecture", "outline", "structure",
                "organize", "project", "timeline",
            ],
        );
        planning.checklist_affinity = true;

        Self {
            default_skill: "planning".into(),
            skill_priority: [
                "communication",
                "coding",
                "research",
                "documentation",
                "review",
                "planning",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            hint_bonus: 10,
            code_block_bonus: 5,
            checklist_bonus: 3,
            high_threshold: 10,
            medium_threshold: 5,
            skills: vec![
                coding,
                SkillSignature::from_words(
                    "research",
                    &[
                        "research", "analyze", "investigate", "explore", "compare", "evaluate",
                        "study", "find", "search", "review", "survey",
                    ],
                ),
                SkillSignature::from_words(
                    "documentation",
                    &[
                        "document", "write", "readme", "guide", "tutorial", "explain", "describe",
                        "manual", "documentation",
                    ],
                ),
                planning,
                SkillSignature::from_words(
                    "communication",
                    &[
                        "email", "message", "respond", "reply", "contact", "notify", "inform",
                        "meeting", "call",
                    ],
                ),
                SkillSignature::from_words(
                    "review",
                    &["review", "check", "verify", "audit", "inspect", "examine"],
                ),
            ],
        }
    }
}

// ── Approval ───────────────────────────────────────────────────

/// A family of sensitive actions and the risk it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFamily {
    pub name: String,
    pub risk: RiskLevel,
    pub keywords: Vec<String>,
}

impl RiskFamily {
    fn new(name: &str, risk: RiskLevel, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            risk,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Undecided requests are auto-rejected after this long.
    pub timeout_secs: u64,
    /// Table order breaks ties between families of equal risk.
    pub families: Vec<RiskFamily>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 86_400,
            families: vec![
                RiskFamily::new(
                    "email",
                    RiskLevel::Medium,
                    &["send email", "email blast", "mass email", "newsletter", "smtp", "mailchimp"],
                ),
                RiskFamily::new(
                    "social_post",
                    RiskLevel::Low,
                    &["linkedin", "twitter", "facebook", "social media", "publish post", "post to"],
                ),
                RiskFamily::new(
                    "payment",
                    RiskLevel::High,
                    &[
                        "payment", "pay", "invoice", "transfer", "wire", "purchase", "buy",
                        "charge", "refund", "billing", "credit card", "bank", "financial", "$",
                        "usd", "eur",
                    ],
                ),
                RiskFamily::new(
                    "database_change",
                    RiskLevel::High,
                    &[
                        "database", "sql", "migrate", "schema", "drop table", "alter table",
                        "delete from", "truncate", "db change",
                    ],
                ),
                RiskFamily::new(
                    "deploy",
                    RiskLevel::Critical,
                    &["deploy", "production", "prod", "live site", "release", "push to prod", "go live"],
                ),
                RiskFamily::new(
                    "credential_access",
                    RiskLevel::High,
                    &[
                        "api key", "secret", "credential", "password", "token", "authentication",
                        "private key",
                    ],
                ),
                RiskFamily::new(
                    "data_export",
                    RiskLevel::Medium,
                    &["export data", "download data", "data dump", "backup", "extract data", "data export"],
                ),
            ],
        }
    }
}

// ── Executor ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Width of the pool running one parallel group.
    pub max_parallel: usize,
    /// Policy for steps that declare none.
    pub default_retry: RetryPolicy,
    /// Step lists keyed by skill name.
    pub templates: HashMap<String, Vec<StepSpec>>,
    /// Failure policy per parallel group name.
    pub group_policies: BTreeMap<String, GroupPolicy>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            default_retry: RetryPolicy::default(),
            templates: HashMap::new(),
            group_policies: BTreeMap::new(),
        }
    }
}

// ── Broker ─────────────────────────────────────────────────────

/// What to run when an action's backend is unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FallbackConfig {
    /// Route to another registered action.
    Action { action: String },
    /// Return this result without calling anything.
    Static { response: Map<String, Value> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub backend: String,
    #[serde(default)]
    pub failure_class: FailureClass,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub call_timeout_ms: u64,
    pub probe_interval_secs: u64,
    /// Consecutive failed probes before a backend is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive good probes before it is marked healthy again.
    pub healthy_threshold: u32,
    /// Deferred calls are dropped after this many failed replays.
    pub max_replay_attempts: u32,
    pub actions: Vec<ActionConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            probe_interval_secs: 30,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            max_replay_attempts: 3,
            actions: Vec::new(),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl ConfigWarning {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Error,
            hint: None,
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Warning,
            hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl StewardConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let warnings = self.findings();
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| w.to_string())
            .collect();
        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(errors.join("\n"))
        }
    }

    /// Every warning and error, in section order.
    pub fn findings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // ── Engine ───
        if self.engine.workers == 0 {
            warnings.push(
                ConfigWarning::error("engine.workers", "workers is 0, nothing would run")
                    .hint("Set to e.g. 4"),
            );
        }
        if self.engine.lease_ttl_secs == 0 {
            warnings.push(ConfigWarning::error(
                "engine.lease_ttl_secs",
                "lease TTL of 0 expires every claim immediately",
            ));
        }

        // ── Store ───
        let valid_backends = ["sqlite", "memory"];
        if !valid_backends.contains(&self.store.backend.as_str()) {
            warnings.push(
                ConfigWarning::error(
                    "store.backend",
                    format!("unknown store backend '{}'", self.store.backend),
                )
                .hint(format!("Valid values: {}", valid_backends.join(", "))),
            );
        }

        // ── Classifier ───
        let skill_names: HashSet<&str> = self
            .classifier
            .skills
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        if skill_names.len() != self.classifier.skills.len() {
            warnings.push(ConfigWarning::error(
                "classifier.skills",
                "skill names must be unique",
            ));
        }
        if !skill_names.contains(self.classifier.default_skill.as_str()) {
            warnings.push(ConfigWarning::error(
                "classifier.default_skill",
                format!("default skill '{}' is not declared", self.classifier.default_skill),
            ));
        }
        for name in &self.classifier.skill_priority {
            if !skill_names.contains(name.as_str()) {
                warnings.push(ConfigWarning::warning(
                    "classifier.skill_priority",
                    format!("'{name}' is not a declared skill"),
                ));
            }
        }
        for skill in &self.classifier.skills {
            if !self.classifier.skill_priority.contains(&skill.name) {
                warnings.push(
                    ConfigWarning::warning(
                        "classifier.skill_priority",
                        format!("skill '{}' has no tie-break position", skill.name),
                    )
                    .hint("Unlisted skills lose ties to listed ones"),
                );
            }
        }
        if self.classifier.medium_threshold > self.classifier.high_threshold {
            warnings.push(ConfigWarning::error(
                "classifier.medium_threshold",
                "medium threshold is above the high threshold",
            ));
        }

        // ── Approval ───
        if self.approval.timeout_secs == 0 {
            warnings.push(ConfigWarning::error(
                "approval.timeout_secs",
                "timeout of 0 would auto-reject every approval",
            ));
        }
        for family in &self.approval.families {
            if family.keywords.is_empty() {
                warnings.push(ConfigWarning::warning(
                    format!("approval.families.{}", family.name),
                    "family has no keywords and never matches",
                ));
            }
        }

        // ── Executor ───
        if self.executor.max_parallel == 0 {
            warnings.push(ConfigWarning::error(
                "executor.max_parallel",
                "max_parallel is 0, parallel groups could never run",
            ));
        }
        if self.executor.default_retry.max_attempts == 0 {
            warnings.push(ConfigWarning::error(
                "executor.default_retry.max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        for (skill, steps) in &self.executor.templates {
            if let Err(e) = steward_core::plan::validate_steps(steps) {
                warnings.push(ConfigWarning::error(
                    format!("executor.templates.{skill}"),
                    e.to_string(),
                ));
            }
            if !skill_names.contains(skill.as_str()) {
                warnings.push(ConfigWarning::warning(
                    format!("executor.templates.{skill}"),
                    "template for an undeclared skill is never used",
                ));
            }
        }

        // ── Broker ───
        if self.broker.unhealthy_threshold == 0 {
            warnings.push(ConfigWarning::error(
                "broker.unhealthy_threshold",
                "threshold must be at least 1",
            ));
        }
        if self.broker.healthy_threshold == 0 {
            warnings.push(ConfigWarning::error(
                "broker.healthy_threshold",
                "threshold must be at least 1",
            ));
        }
        let mut action_names = HashSet::new();
        for action in &self.broker.actions {
            if !action_names.insert(action.name.as_str()) {
                warnings.push(ConfigWarning::error(
                    "broker.actions",
                    format!("action '{}' registered twice", action.name),
                ));
            }
        }
        for action in &self.broker.actions {
            if let Some(FallbackConfig::Action { action: target }) = &action.fallback {
                if target == &action.name {
                    warnings.push(ConfigWarning::error(
                        format!("broker.actions.{}", action.name),
                        "action falls back to itself",
                    ));
                } else if !action_names.contains(target.as_str()) {
                    warnings.push(ConfigWarning::error(
                        format!("broker.actions.{}", action.name),
                        format!("fallback action '{target}' is not registered"),
                    ));
                }
            }
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(
                ConfigWarning::warning(
                    "logging.format",
                    format!("unknown log format '{}'", self.logging.format),
                )
                .hint(format!("Valid values: {}", valid_formats.join(", "))),
            );
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(
                ConfigWarning::warning(
                    "logging.level",
                    format!("unknown log level '{}'", self.logging.level),
                )
                .hint(format!("Valid values: {}", valid_levels.join(", "))),
            );
        }

        warnings
    }
}
