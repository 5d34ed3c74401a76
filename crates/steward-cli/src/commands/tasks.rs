use console::style;
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

use steward_core::{NewTask, Result, StepState, StewardError, Task, TaskStatus};
use steward_runtime::Engine;

use super::{print_event, truncate};

/// Parse a submission: one task object or an array of them.
pub(crate) fn parse_submission(raw: &str) -> Result<Vec<NewTask>> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StewardError::from))
            .collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

pub(super) fn cmd_submit(engine: &Engine, file: &Path) -> Result<()> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)?
    };

    let mut failed = 0;
    for new_task in parse_submission(&raw)? {
        let title = new_task.title.clone();
        match engine.ingest(new_task) {
            Ok(task) => println!(
                "✅ {}  {}  → {} ({})",
                task.id,
                truncate(&task.title, 50),
                task.skill.as_deref().unwrap_or("-"),
                task.confidence.map(|c| c.to_string()).unwrap_or_default()
            ),
            Err(e) => {
                failed += 1;
                eprintln!("❌ {}: {e}", truncate(&title, 50));
            }
        }
    }
    if failed > 0 {
        return Err(StewardError::Validation(format!("{failed} task(s) rejected")));
    }
    Ok(())
}

pub(super) fn cmd_tasks(engine: &Engine, status: Option<TaskStatus>, json: bool) -> Result<()> {
    let mut tasks = engine.tasks(status)?;
    tasks.sort_by_key(|t| (t.priority.rank(), t.created_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{}",
        style(format!(
            "{:<36}  {:<8}  {:<12}  {:<13}  TITLE",
            "ID", "PRIORITY", "STATUS", "SKILL"
        ))
        .bold()
    );
    for task in &tasks {
        println!(
            "{:<36}  {:<8}  {:<12}  {:<13}  {}",
            task.id,
            task.priority,
            status_label(task.status),
            task.skill.as_deref().unwrap_or("-"),
            truncate(&task.title, 48)
        );
    }
    Ok(())
}

pub(super) fn cmd_show(engine: &Engine, id: Uuid, json: bool) -> Result<()> {
    let task = engine.task(id)?;
    let plan = engine.plan(id)?;

    if json {
        let out = serde_json::json!({ "task": task, "plan": plan });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_task(&task);
    if let Some(plan) = plan {
        println!();
        println!("{}", style("Plan").bold());
        for spec in &plan.plan.steps {
            let Some(record) = plan.record(&spec.id) else {
                continue;
            };
            let state = match record.state {
                StepState::Complete => style(record.state.as_str()).green(),
                StepState::Blocked | StepState::Failed => style(record.state.as_str()).red(),
                _ => style(record.state.as_str()).yellow(),
            };
            let mut marks = Vec::new();
            if record.skipped {
                marks.push("skipped");
            }
            if record.partial {
                marks.push("partial");
            }
            if record.degraded {
                marks.push("degraded");
            }
            if record.using_alternate {
                marks.push("alternate");
            }
            println!(
                "  {:<16} {:<10} {:<20} attempts={} {}",
                spec.id,
                state,
                spec.action,
                record.attempt_count,
                marks.join(",")
            );
            if let Some(err) = &record.last_error {
                println!("    {}", style(truncate(err, 100)).dim());
            }
        }
        let m = &plan.metrics;
        println!(
            "  completed={} failed={} retries={} recoveries={}",
            m.steps_completed, m.steps_failed, m.retries, m.recoveries
        );
    }

    let events = engine.task_events(id)?;
    if !events.is_empty() {
        println!();
        println!("{}", style("History").bold());
        for event in &events {
            print_event(event);
        }
    }
    Ok(())
}

pub(super) fn cmd_cancel(engine: &Engine, id: Uuid, reason: Option<&str>) -> Result<()> {
    let task = engine.cancel(id, reason)?;
    if task.status == TaskStatus::Executing {
        println!("⏳ Cancellation requested; {id} stops at its next step boundary");
    } else {
        println!("🛑 Task {id} cancelled");
    }
    Ok(())
}

pub(super) fn cmd_resume(engine: &Engine, id: Uuid) -> Result<()> {
    engine.resume(id)?;
    println!("▶️  Task {id} requeued");
    Ok(())
}

pub(super) fn cmd_status(engine: &Engine, json: bool) -> Result<()> {
    let status = engine.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", style("Tasks").bold());
    if status.tasks.is_empty() {
        println!("  none");
    }
    for (state, count) in &status.tasks {
        println!("  {state:<14} {count}");
    }
    println!("{}", style("Backends").bold());
    for (backend, health) in &status.backends {
        println!("  {backend:<14} {health}");
    }
    println!("Pending approvals: {}", status.pending_approvals);
    println!("Deferred calls:    {}", status.deferred_calls);
    Ok(())
}

fn print_task(task: &Task) {
    println!("{} {}", style("Task").bold(), task.id);
    println!("  Title:     {}", task.title);
    println!("  Status:    {}", status_label(task.status));
    println!("  Priority:  {}", task.priority);
    println!("  Source:    {}", task.source);
    if let Some(skill) = &task.skill {
        let confidence = task.confidence.map(|c| c.to_string()).unwrap_or_default();
        println!("  Skill:     {skill} ({confidence})");
    }
    if let Some(level) = task.risk_level {
        println!("  Risk:      {level} [{}]", task.risk_flags.join(", "));
    }
    if let Some(approval) = task.approval_id {
        println!("  Approval:  {approval}");
    }
    if let Some(reason) = &task.terminal_reason {
        println!("  Outcome:   {reason}");
    }
    if !task.body.is_empty() {
        println!();
        for line in task.body.lines().take(20) {
            println!("  │ {line}");
        }
    }
}

fn status_label(status: TaskStatus) -> String {
    let s = status.as_str();
    match status {
        TaskStatus::Done => style(s).green().to_string(),
        TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Rejected => style(s).red().to_string(),
        TaskStatus::InApproval => style(s).yellow().to_string(),
        _ => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_task() {
        let tasks = parse_submission(r#"{"title": "Outline roadmap", "priority": "high"}"#).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Outline roadmap");
    }

    #[test]
    fn test_parse_task_array_with_plan() {
        let raw = r#"[
            {"title": "a"},
            {"title": "b", "plan": [{"id": "s1", "action": "noop"}]}
        ]"#;
        let tasks = parse_submission(raw).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].plan.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        assert!(parse_submission("{not json").is_err());
        assert!(parse_submission(r#"{"body": "no title"}"#).is_err());
    }
}
