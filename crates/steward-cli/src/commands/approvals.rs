use chrono::Utc;
use console::style;
use uuid::Uuid;

use steward_core::{ApprovalStatus, Decision, Result};
use steward_runtime::Engine;

pub(super) fn cmd_approvals(engine: &Engine, all: bool) -> Result<()> {
    let filter = if all { None } else { Some(ApprovalStatus::Pending) };
    let mut requests = engine.approvals(filter)?;
    requests.sort_by_key(|r| r.created_at);

    if requests.is_empty() {
        println!("No approval requests{}.", if all { "" } else { " pending" });
        return Ok(());
    }

    let now = Utc::now();
    for r in &requests {
        let status = match r.status {
            ApprovalStatus::Pending => style(r.status.to_string()).yellow(),
            ApprovalStatus::Approved => style(r.status.to_string()).green(),
            _ => style(r.status.to_string()).red(),
        };
        println!("{} {}  [{}]", style("●").yellow(), r.id, status);
        println!("   Task:     {}", r.task_id);
        println!(
            "   Risk:     {} ({}, matched \"{}\")",
            r.risk_level, r.family, r.matched_keyword
        );
        if r.is_pending() {
            let left = r.expires_at - now;
            println!("   Expires:  in {}h {}m", left.num_hours(), left.num_minutes() % 60);
        } else if let Some(by) = &r.decided_by {
            println!(
                "   Decided:  by {by}{}",
                r.reason
                    .as_ref()
                    .map(|n| format!(": {n}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub(super) fn cmd_approve(engine: &Engine, approval_id: Uuid, by: &str) -> Result<()> {
    let request = engine.decide(&Decision::approve(approval_id, by))?;
    println!(
        "✅ Approved {} for task {}; it is back in the queue",
        request.id, request.task_id
    );
    Ok(())
}

pub(super) fn cmd_reject(engine: &Engine, approval_id: Uuid, by: &str, reason: &str) -> Result<()> {
    let request = engine.decide(&Decision::reject(approval_id, by, reason))?;
    println!("🛑 Rejected {}; task {} failed", request.id, request.task_id);
    Ok(())
}
