use std::path::PathBuf;

use steward_core::{Result, StewardError};

pub(crate) const STARTER_CONFIG: &str = r#"# Steward configuration
# Every section is optional; missing keys take their defaults.

[engine]
workers = 4
lease_ttl_secs = 60
# poll_interval_ms = 500
# reaper_interval_secs = 10

[store]
backend = "sqlite"  # or "memory"
# path = "/var/lib/steward/steward.db"

[classifier]
default_skill = "planning"
# skill_priority = ["communication", "coding", "research", "documentation", "review", "planning"]

[approval]
timeout_secs = 86400

[executor]
max_parallel = 4

[executor.default_retry]
max_attempts = 3
backoff = "exponential"
base_delay_ms = 5000
max_delay_ms = 300000
jitter = true

# [executor.group_policies]
# notify = "continue_others"

# Per-skill step templates
# [[executor.templates.communication]]
# id = "draft"
# action = "echo"
#
# [[executor.templates.communication]]
# id = "send"
# action = "mail.send"
# depends_on = ["draft"]

[broker]
call_timeout_ms = 30000
probe_interval_secs = 30
unhealthy_threshold = 3
healthy_threshold = 1
max_replay_attempts = 3

# [[broker.actions]]
# name = "mail.send"
# backend = "mail"
# failure_class = "transient"
# fallback = { action = "sms.send" }

[logging]
level = "info"
format = "pretty"  # or "json", "compact"
"#;

pub(super) fn cmd_init(local: bool) -> Result<()> {
    let dir = if local {
        std::env::current_dir()?
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".steward")
    };

    std::fs::create_dir_all(&dir)?;
    let config_path = dir.join("steward.toml");

    if config_path.exists() {
        println!("⚠️  {} already exists", config_path.display());
        println!("   Run 'steward doctor' to check it.");
        return Ok(());
    }

    // Never write a starter file the loader would refuse.
    let parsed: steward_config::StewardConfig = toml::from_str(STARTER_CONFIG)
        .map_err(|e| StewardError::Config(format!("starter config does not parse: {e}")))?;
    parsed.validate().map_err(StewardError::Config)?;

    std::fs::write(&config_path, STARTER_CONFIG)?;
    println!("✅ Created {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  steward doctor             # check the configuration");
    println!("  steward submit task.json   # queue a task");
    println!("  steward run                # start the engine");
    Ok(())
}
