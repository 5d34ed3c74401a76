use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use uuid::Uuid;

use steward_config::{ConfigLoader, StewardConfig, WarningSeverity};
use steward_core::{AuditEvent, EntityType, StewardError, TaskStatus};
use steward_runtime::Engine;

mod approvals;
mod run;
mod setup;
mod tasks;

/// Steward: task orchestration with approval gating and plan recovery
#[derive(Parser)]
#[command(name = "steward", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to steward.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine (workers, reaper, health monitor, decision consumer)
    Run {
        /// Process the queue once and exit instead of running until Ctrl-C
        #[arg(long)]
        drain: bool,
    },
    /// Ingest tasks from a JSON file (one task object or an array)
    Submit {
        /// Path to the JSON file, or "-" for stdin
        file: PathBuf,
    },
    /// List tasks
    Tasks {
        /// Only tasks in this status (e.g. needs_action, in_approval, blocked)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one task with its plan and history
    Show {
        id: Uuid,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List approval requests
    Approvals {
        /// Include decided requests
        #[arg(short, long)]
        all: bool,
    },
    /// Approve a pending request
    Approve {
        approval_id: Uuid,

        /// Reviewer name recorded on the decision
        #[arg(long, env = "USER", default_value = "operator")]
        by: String,
    },
    /// Reject a pending request; the task fails without retry
    Reject {
        approval_id: Uuid,

        #[arg(short, long)]
        reason: String,

        #[arg(long, env = "USER", default_value = "operator")]
        by: String,
    },
    /// Cancel a task; an executing task stops at its next step boundary
    Cancel {
        id: Uuid,

        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Send a blocked task back to the queue
    Resume { id: Uuid },
    /// Show task counts, backend health, and pending approvals
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent audit log entries
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Only events for this task
        #[arg(short, long)]
        task: Option<Uuid>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the configuration for problems
    Doctor,
    /// Initialize a new steward.toml in the current or home directory
    Init {
        /// Create in current directory instead of ~/.steward/
        #[arg(long)]
        local: bool,
    },
}

impl Cli {
    pub async fn run(self) -> steward_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.logging.level.clone())
        };
        init_logging(&config, &log_level);

        match self.command {
            Commands::Run { drain } => run::cmd_run(config_loader, drain).await,
            Commands::Submit { file } => tasks::cmd_submit(&open(config)?, &file),
            Commands::Tasks { status, json } => tasks::cmd_tasks(&open(config)?, status, json),
            Commands::Show { id, json } => tasks::cmd_show(&open(config)?, id, json),
            Commands::Approvals { all } => approvals::cmd_approvals(&open(config)?, all),
            Commands::Approve { approval_id, by } => {
                approvals::cmd_approve(&open(config)?, approval_id, &by)
            }
            Commands::Reject {
                approval_id,
                reason,
                by,
            } => approvals::cmd_reject(&open(config)?, approval_id, &by, &reason),
            Commands::Cancel { id, reason } => {
                tasks::cmd_cancel(&open(config)?, id, reason.as_deref())
            }
            Commands::Resume { id } => tasks::cmd_resume(&open(config)?, id),
            Commands::Status { json } => tasks::cmd_status(&open(config)?, json),
            Commands::Audit { limit, task, json } => {
                Self::cmd_audit(&open(config)?, limit, task, json)
            }
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config),
            Commands::Init { local } => setup::cmd_init(local),
        }
    }

    fn cmd_config(config: &StewardConfig, json: bool) -> steward_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| StewardError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_audit(
        engine: &Engine,
        limit: usize,
        task: Option<Uuid>,
        json: bool,
    ) -> steward_core::Result<()> {
        let mut events = match task {
            Some(id) => engine.task_events(id)?,
            None => engine.recent_events(limit)?,
        };
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&events)?);
            return Ok(());
        }
        if events.is_empty() {
            println!("No audit log entries.");
            return Ok(());
        }

        println!("{} ({} entries)", style("Audit Log").bold(), events.len());
        println!("{}", "-".repeat(80));
        for event in &events {
            print_event(event);
        }
        Ok(())
    }

    fn cmd_doctor(config: &StewardConfig) -> steward_core::Result<()> {
        println!("🩺 Steward Doctor: configuration audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };
        let warn_count = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Warning)
            .count();
        for w in &warnings {
            println!("  {w}");
        }

        if config.broker.actions.is_empty() {
            println!("  💡 broker.actions: no external actions declared, only local built-ins will run");
        }
        if config.executor.templates.is_empty() {
            println!("  💡 executor.templates: no skill templates, tasks without a plan run one step");
        }

        println!();
        if warn_count == 0 {
            println!("  ✅ configuration is valid");
        } else {
            println!("  ⚠️  {warn_count} warnings");
        }
        Ok(())
    }
}

fn init_logging(config: &StewardConfig, level: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}

fn open(config: StewardConfig) -> steward_core::Result<Engine> {
    Engine::open(config)
}

pub(crate) fn print_event(event: &AuditEvent) {
    let ts = event.timestamp.format("%Y-%m-%d %H:%M:%S");
    let kind = match event.entity_type {
        EntityType::Approval => style(event.entity_type.as_str()).yellow(),
        EntityType::Backend => style(event.entity_type.as_str()).magenta(),
        EntityType::Routing => style(event.entity_type.as_str()).cyan(),
        _ => style(event.entity_type.as_str()).white(),
    };
    let to = match event.to_state.as_str() {
        "failed" | "blocked" | "rejected" | "unhealthy" | "dropped" => style(&event.to_state).red(),
        "done" | "complete" | "approved" | "healthy" => style(&event.to_state).green(),
        _ => style(&event.to_state).bold(),
    };
    let from = event.from_state.as_deref().unwrap_or("∅");
    println!(
        "{}  {:<8} {}  {} → {}",
        style(ts).dim(),
        kind,
        event.entity_id,
        from,
        to
    );
    if let Some(reason) = &event.reason {
        println!("   {}", style(truncate(reason, 120)).dim());
    }
}

/// Truncate to `max` characters, appending "..." if truncated.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}
