use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steward_config::{ConfigLoader, StewardConfig};
use steward_core::{Result, StewardError};
use steward_runtime::{Engine, ExecutionOutcome, ProcessOutcome};

/// How often the running engine compares its config against the watched file.
const RELOAD_CHECK: Duration = Duration::from_secs(2);

pub(super) async fn cmd_run(config_loader: ConfigLoader, drain: bool) -> Result<()> {
    let mut current = config_loader.get();
    banner(&current);

    if drain {
        let engine = Engine::open(current)?;
        let processed = engine.drain("cli").await?;
        for p in &processed {
            println!("  {}  {}", p.task_id, describe(&p.outcome));
        }
        println!("{} task(s) processed", processed.len());
        return Ok(());
    }

    // Kept alive for the duration of the run
    let _watcher = match config_loader.watch() {
        Ok(w) => {
            println!("   Config hot-reload: enabled");
            Some(w)
        }
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    };
    println!();
    let shared = config_loader.shared();

    loop {
        let engine = Arc::new(Engine::open(current.clone())?);
        let shutdown = CancellationToken::new();
        let runner = Arc::clone(&engine);
        let token = shutdown.clone();
        let mut handle = tokio::spawn(async move { runner.run(token).await });
        let mut ticker = tokio::time::interval(RELOAD_CHECK);

        let restart = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break false,
                joined = &mut handle => {
                    warn!("engine exited on its own");
                    return joined.map_err(|e| StewardError::Io(std::io::Error::other(e)))?;
                }
                _ = ticker.tick() => {
                    let latest = shared.read().clone();
                    if config_changed(&current, &latest) {
                        current = latest;
                        break true;
                    }
                }
            }
        };

        println!("{}", style("Stopping workers...").dim());
        shutdown.cancel();
        handle
            .await
            .map_err(|e| StewardError::Io(std::io::Error::other(e)))??;

        if !restart {
            println!("👋 Steward stopped");
            return Ok(());
        }
        info!("configuration changed, restarting engine");
    }
}

fn banner(config: &StewardConfig) {
    println!("🧭 Steward v{}", env!("CARGO_PKG_VERSION"));
    println!("   Workers: {}", config.engine.workers);
    match config.store.backend.as_str() {
        "sqlite" => println!("   Store: sqlite ({})", config.store.resolved_path().display()),
        other => println!("   Store: {other}"),
    }
    println!("   Declared actions: {}", config.broker.actions.len());
}

fn config_changed(a: &StewardConfig, b: &StewardConfig) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}

pub(super) fn describe(outcome: &ProcessOutcome) -> String {
    match outcome {
        ProcessOutcome::Parked { approval_id } => {
            format!("{} (approval {approval_id})", style("awaiting approval").yellow())
        }
        ProcessOutcome::Executed(ExecutionOutcome::Done) => style("done").green().to_string(),
        ProcessOutcome::Executed(ExecutionOutcome::Blocked { reason }) => {
            format!("{}: {reason}", style("blocked").red())
        }
        ProcessOutcome::Executed(ExecutionOutcome::Failed { reason }) => {
            format!("{}: {reason}", style("failed").red())
        }
        ProcessOutcome::Executed(ExecutionOutcome::Cancelled) => style("cancelled").red().to_string(),
        ProcessOutcome::Executed(ExecutionOutcome::LeaseLost) => {
            style("lease lost, will be requeued").yellow().to_string()
        }
        ProcessOutcome::Executed(ExecutionOutcome::Interrupted) => {
            style("interrupted, requeued").yellow().to_string()
        }
    }
}
