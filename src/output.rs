use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::model::{Agent, Claim, Event, Message, Severity, Task, TaskState, Waiter};
use crate::store::db::fmt_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// Compact single-line JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

fn short_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn colored_state(state: TaskState) -> String {
    let s = state.to_string();
    match state {
        TaskState::Merged => s.green().bold().to_string(),
        TaskState::Aborted => s.red().bold().to_string(),
        TaskState::Created => s.dimmed().to_string(),
        _ => s.yellow().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

pub fn print_claim(claim: &Claim, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(claim)?,
        Format::Pretty => {
            println!(
                "{} {} {}",
                claim.resource_id.cyan().bold(),
                format!("({})", claim.intent).dimmed(),
                claim.state
            );
            println!("  {} {}", "agent:".dimmed(), claim.agent_id);
            println!("  {} {}", "expires:".dimmed(), short_ts(claim.expires_at));
            if claim.effective_priority > claim.priority {
                println!(
                    "  {} {} {}",
                    "priority:".dimmed(),
                    claim.priority,
                    format!("(boosted to {})", claim.effective_priority).yellow()
                );
            } else {
                println!("  {} {}", "priority:".dimmed(), claim.priority);
            }
            if !claim.reason.is_empty() {
                println!("  {} {}", "reason:".dimmed(), claim.reason);
            }
            if let Some(ep) = &claim.episode_id {
                println!("  {} {}", "episode:".dimmed(), ep);
            }
        }
        Format::Minimal => println!("{}", claim.claim_id),
    }
    Ok(())
}

pub fn print_claims(claims: &[Claim], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(claims)?,
        Format::Pretty => {
            if claims.is_empty() {
                println!("{}", "No active claims.".dimmed());
            }
            for c in claims {
                println!(
                    "{} {} {} {}",
                    c.resource_id.cyan(),
                    format!("[{}]", c.agent_id).bold(),
                    c.intent.to_string().dimmed(),
                    format!("until {}", short_ts(c.expires_at)).dimmed(),
                );
            }
        }
        Format::Minimal => {
            for c in claims {
                println!("{} {}", c.resource_id, c.agent_id);
            }
        }
    }
    Ok(())
}

pub fn print_waiters(waiters: &[Waiter], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(waiters)?,
        Format::Pretty => {
            if waiters.is_empty() {
                println!("{}", "Nobody is waiting.".dimmed());
            }
            for w in waiters {
                println!(
                    "{} {} {} {}",
                    w.resource_id.cyan(),
                    format!("[{}]", w.agent_id).bold(),
                    format!("p{}", w.priority).yellow(),
                    format!("since {}", short_ts(w.created_at)).dimmed(),
                );
                if !w.reason.is_empty() {
                    println!("  {} {}", "reason:".dimmed(), w.reason);
                }
            }
        }
        Format::Minimal => {
            for w in waiters {
                println!("{} {} {}", w.resource_id, w.agent_id, w.priority);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub fn print_agents(agents: &[Agent], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(agents)?,
        Format::Pretty => {
            if agents.is_empty() {
                println!("{}", "No agents registered.".dimmed());
            }
            for a in agents {
                println!(
                    "{} {} {}",
                    format!("[{}]", a.agent_id).cyan().bold(),
                    a.status,
                    format!("seen {}", short_ts(a.last_heartbeat)).dimmed(),
                );
                println!("  {} {}", "cwd:".dimmed(), a.cwd);
            }
        }
        Format::Minimal => {
            for a in agents {
                println!("{} {}", a.agent_id, a.status);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub fn print_task(task: &Task, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(task)?,
        Format::Pretty => {
            println!(
                "[{}] {} ({})",
                task.task_id.bold(),
                task.title,
                colored_state(task.state)
            );
            if !task.description.is_empty() {
                println!("  {}", task.description);
            }
            if let Some(agent) = &task.assigned_agent {
                println!("  {} {}", "agent:".dimmed(), agent);
            }
            if let Some(branch) = &task.branch {
                println!("  {} {}", "branch:".dimmed(), branch);
            }
            match task.max_cost_usd {
                Some(max) => println!(
                    "  {} ${:.2} / ${:.2}",
                    "cost:".dimmed(),
                    task.cumulative_cost_usd,
                    max
                ),
                None => println!("  {} ${:.2}", "cost:".dimmed(), task.cumulative_cost_usd),
            }
            if !task.depends_on.is_empty() {
                println!("  {} {}", "depends on:".dimmed(), task.depends_on.join(", "));
            }
            if let Some(ep) = &task.episode_id {
                println!("  {} {}", "episode:".dimmed(), ep);
            }
        }
        Format::Minimal => {
            let agent = task.assigned_agent.as_deref().unwrap_or("-");
            println!(
                "{} {:12} {:11} {}",
                task.task_id,
                truncate(&task.title, 12),
                task.state,
                agent
            );
        }
    }
    Ok(())
}

pub fn print_tasks(tasks: &[Task], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(tasks)?,
        Format::Pretty => {
            for task in tasks {
                print_task(task, Format::Pretty)?;
                println!();
            }
        }
        Format::Minimal => {
            println!("{:17} {:12} {:11} AGENT", "ID", "TITLE", "STATE");
            println!("{}", "-".repeat(50));
            for task in tasks {
                print_task(task, Format::Minimal)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn print_events(events: &[Event], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(events)?,
        Format::Pretty => {
            if events.is_empty() {
                println!("{}", "No events.".dimmed());
            }
            for e in events {
                let agent = if e.agent_id.is_empty() { "-" } else { &e.agent_id };
                println!(
                    "{} {} {} {}",
                    format!("#{}", e.seq).dimmed(),
                    e.kind.to_string().cyan().bold(),
                    agent,
                    e.ts.dimmed(),
                );
                println!("  {}", truncate(&e.payload.to_string(), 100).dimmed());
            }
        }
        Format::Minimal => {
            for e in events {
                println!("{} {} {}", e.seq, e.kind, e.agent_id);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn colored_severity(severity: Severity) -> String {
    let s = severity.to_string();
    match severity {
        Severity::Blocker => s.red().bold().to_string(),
        Severity::Attn => s.yellow().to_string(),
        Severity::Handoff => s.magenta().to_string(),
        Severity::Fyi => s.dimmed().to_string(),
    }
}

pub fn print_messages(messages: &[Message], format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(messages)?,
        Format::Pretty => {
            if messages.is_empty() {
                println!("{}", "No messages.".dimmed());
            }
            for m in messages {
                println!(
                    "{} {} {} {}",
                    format!("[{}]", fmt_ts(m.created_at)).dimmed(),
                    colored_severity(m.severity),
                    format!("{}:", m.from_agent).cyan(),
                    m.body,
                );
            }
        }
        Format::Minimal => {
            for m in messages {
                println!("{}: {}", m.from_agent, m.body);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("short", 12), "short");
        assert_eq!(truncate("a much longer title", 12), "a much lo...");
        assert_eq!(truncate("héllo wörld!!", 8), "héllo...");
    }
}
