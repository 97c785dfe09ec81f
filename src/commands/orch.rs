use std::path::Path;

use colored::Colorize;

use crate::agent;
use crate::error::Result;
use crate::model::{ControlState, TaskState};
use crate::orchestrator::{NewTask, Orchestrator, Transition};
use crate::output::{self, Format};
use crate::store::db::{MeshDb, fmt_ts};
use crate::store::repo::MeshRepo;

/// Run `f` as an orchestration lease owner.
///
/// An explicit owner (already resolved from `--owner` or
/// `AGENTMESH_ORCH_OWNER`) must hold the lease. Without one, a fresh owner
/// token takes a transient lease for the duration of the call and gives it
/// back afterwards.
fn with_owner<T>(
    db: &MeshDb,
    owner: Option<String>,
    ttl_secs: i64,
    f: impl FnOnce(&str) -> Result<T>,
) -> Result<T> {
    if let Some(owner) = owner {
        return f(&owner);
    }
    let owner = agent::make_owner("cli");
    db.lease_acquire(&owner, ttl_secs)?;
    let result = f(&owner);
    // abort-all clears the lease itself, so a failed release is expected there
    if let Err(e) = db.lease_release(&owner) {
        tracing::debug!(owner = %owner, error = %e, "transient lease already gone");
    }
    result
}

fn print_transition(t: &Transition, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(t)?,
        Format::Pretty => {
            println!(
                "{} {} {} {}",
                t.task.task_id.bold(),
                t.from_state.to_string().dimmed(),
                "->".dimmed(),
                t.to_state.to_string().green().bold()
            );
            if let Some(attempt) = &t.attempt_id {
                println!("  {} {}", "attempt:".dimmed(), attempt);
            }
            println!("  {} #{}", "event:".dimmed(), t.event_seq);
        }
        Format::Minimal => println!("{} {}", t.task.task_id, t.to_state),
    }
    Ok(())
}

fn print_control(control: &ControlState, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(control)?,
        Format::Pretty => {
            match (&control.lease_owner, control.lease_expires_at) {
                (Some(owner), Some(expires)) => println!(
                    "{} {} {}",
                    "lease:".dimmed(),
                    owner.cyan().bold(),
                    format!("until {}", fmt_ts(expires)).dimmed()
                ),
                _ => println!("{} {}", "lease:".dimmed(), "free".green()),
            }
            let flag = |on: bool, reason: &str| {
                if on {
                    format!("{} {}", "on".red().bold(), reason.dimmed())
                } else {
                    "off".green().to_string()
                }
            };
            println!("{} {}", "freeze:".dimmed(), flag(control.frozen, &control.freeze_reason));
            println!(
                "{} {}",
                "lock-merges:".dimmed(),
                flag(control.merges_locked, &control.merges_reason)
            );
        }
        Format::Minimal => println!(
            "{} frozen={} merges_locked={}",
            control.lease_owner.as_deref().unwrap_or("-"),
            control.frozen,
            control.merges_locked
        ),
    }
    Ok(())
}

pub fn create(
    repo_root: &Path,
    owner: Option<String>,
    new: NewTask,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let mut new = new;
    if new.episode_id.is_none() {
        new.episode_id = repo.episode_or_current(None)?;
    }
    let orch = Orchestrator::new(&repo.db);
    let task = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.create(o, &new)
    })?;
    output::print_task(&task, format)
}

pub fn assign(
    repo_root: &Path,
    owner: Option<String>,
    task_id: &str,
    agent_id: &str,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let t = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.assign(o, task_id, agent_id)
    })?;
    print_transition(&t, format)
}

/// Move a task along its single forward edge, or to `to` when given.
pub fn advance(
    repo_root: &Path,
    owner: Option<String>,
    task_id: &str,
    to: Option<TaskState>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let t = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.advance(o, task_id, to)
    })?;
    print_transition(&t, format)
}

pub fn abort(
    repo_root: &Path,
    owner: Option<String>,
    task_id: &str,
    reason: &str,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let t = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.abort(o, task_id, reason)
    })?;
    print_transition(&t, format)
}

pub fn deps(
    repo_root: &Path,
    owner: Option<String>,
    task_id: &str,
    depends_on: &[String],
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let task = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.set_dependencies(o, task_id, depends_on)
    })?;
    output::print_task(&task, format)
}

pub fn freeze(
    repo_root: &Path,
    owner: Option<String>,
    on: bool,
    reason: &str,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let control = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.freeze(o, on, reason)
    })?;
    print_control(&control, format)
}

pub fn lock_merges(
    repo_root: &Path,
    owner: Option<String>,
    on: bool,
    reason: &str,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let control = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.lock_merges(o, on, reason)
    })?;
    print_control(&control, format)
}

pub fn abort_all(repo_root: &Path, actor: &str, reason: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let report = Orchestrator::new(&repo.db).abort_all(actor, reason)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!(
                "{} {} task(s), {} spawn(s) ended",
                "Aborted".red().bold(),
                report.aborted_tasks.len(),
                report.ended_spawns.len()
            );
            if let Some(owner) = &report.cleared_owner {
                println!("  {} {}", "lease cleared from:".dimmed(), owner);
            }
        }
        Format::Minimal => {
            for id in &report.aborted_tasks {
                println!("{id}");
            }
        }
    }
    Ok(())
}

pub struct SpawnArgs {
    pub task_id: String,
    pub agent_id: String,
    pub pid: u32,
    pub timeout_secs: Option<i64>,
}

pub fn spawn(
    repo_root: &Path,
    owner: Option<String>,
    args: SpawnArgs,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let timeout = args.timeout_secs.unwrap_or(repo.config.spawn_timeout_secs);
    let spawn = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.spawn(o, &args.task_id, &args.agent_id, args.pid, timeout)
    })?;
    match format {
        Format::Json => output::print_json(&spawn)?,
        Format::Pretty => println!(
            "Spawned {} for {} {}",
            spawn.spawn_id.cyan().bold(),
            spawn.task_id.bold(),
            format!("(pid {}, timeout {}s)", spawn.pid, spawn.timeout_secs).dimmed()
        ),
        Format::Minimal => println!("{}", spawn.spawn_id),
    }
    Ok(())
}

pub fn worker_done(
    repo_root: &Path,
    owner: Option<String>,
    spawn_id: &str,
    outcome: &str,
    cost_usd: f64,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let orch = Orchestrator::new(&repo.db);
    let done = with_owner(&repo.db, owner, repo.config.lease_ttl_secs, |o| {
        orch.worker_done(o, spawn_id, outcome, cost_usd)
    })?;
    match format {
        Format::Json => output::print_json(&done)?,
        Format::Pretty => {
            println!(
                "{} finished: {} {}",
                done.spawn.spawn_id.cyan(),
                outcome.bold(),
                format!("(${cost_usd:.2})").dimmed()
            );
            println!(
                "  {} ${:.2}{}",
                "task total:".dimmed(),
                done.cumulative_cost_usd,
                if done.over_budget {
                    format!(" {}", "OVER BUDGET".red().bold())
                } else {
                    String::new()
                }
            );
        }
        Format::Minimal => println!("{} {:.4}", done.spawn.spawn_id, done.cumulative_cost_usd),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Acquire the lease. Without an explicit owner a new token is minted and
/// printed so the caller can export it as `AGENTMESH_ORCH_OWNER`.
pub fn lease_acquire(
    repo_root: &Path,
    owner: Option<String>,
    ttl_secs: Option<i64>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let owner = owner.unwrap_or_else(|| agent::make_owner("controller"));
    let ttl = ttl_secs.unwrap_or(repo.config.lease_ttl_secs);
    let control = repo.db.lease_acquire(&owner, ttl)?;
    match format {
        Format::Minimal => println!("{owner}"),
        _ => print_control(&control, format)?,
    }
    Ok(())
}

pub fn lease_renew(
    repo_root: &Path,
    owner: &str,
    ttl_secs: Option<i64>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let ttl = ttl_secs.unwrap_or(repo.config.lease_ttl_secs);
    let control = repo.db.lease_renew(owner, ttl)?;
    print_control(&control, format)
}

pub fn lease_release(repo_root: &Path, owner: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let control = repo.db.lease_release(owner)?;
    print_control(&control, format)
}

// ---------------------------------------------------------------------------
// Read-only queries
// ---------------------------------------------------------------------------

pub fn status(repo_root: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let status = Orchestrator::new(&repo.db).status()?;
    match format {
        Format::Json => output::print_json(&status)?,
        Format::Pretty => {
            print_control(&status.control, Format::Pretty)?;
            if !status.lease_live && status.control.lease_owner.is_some() {
                println!("  {}", "(lease expired)".yellow());
            }
            let mut states: Vec<_> = status.tasks_by_state.iter().collect();
            states.sort();
            for (state, count) in states {
                println!("{} {}", format!("{state}:").dimmed(), count);
            }
            println!("{} {}", "active spawns:".dimmed(), status.active_spawns);
        }
        Format::Minimal => println!(
            "lease_live={} active_spawns={}",
            status.lease_live, status.active_spawns
        ),
    }
    Ok(())
}

pub fn list(repo_root: &Path, state: Option<TaskState>, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let tasks = repo.db.list_tasks(state)?;
    output::print_tasks(&tasks, format)
}

pub fn show(repo_root: &Path, task_id: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let task = repo.db.get_task(task_id)?;
    output::print_task(&task, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;

    #[test]
    fn transient_lease_is_returned_after_the_call() {
        let db = MeshDb::open_memory().unwrap();
        let seen = with_owner(&db, None, 60, |owner| {
            assert_eq!(db.control()?.lease_owner.as_deref(), Some(owner));
            Ok(owner.to_string())
        })
        .unwrap();
        assert!(seen.starts_with("orchctl_cli_"));
        assert_eq!(db.control().unwrap().lease_owner, None);
    }

    #[test]
    fn transient_lease_refused_while_another_owner_holds_it() {
        let db = MeshDb::open_memory().unwrap();
        db.lease_acquire("orchctl_x_1_aaaaaaaa", 300).unwrap();
        let err = with_owner(&db, None, 60, |_| Ok(())).unwrap_err();
        assert!(matches!(err, MeshError::LeaseConflict { .. }));
    }

    #[test]
    fn explicit_owner_must_already_hold_the_lease() {
        let db = MeshDb::open_memory().unwrap();
        let orch = Orchestrator::new(&db);
        let new = NewTask {
            title: "t".into(),
            ..Default::default()
        };
        let err = with_owner(&db, Some("orchctl_y_1_bbbbbbbb".into()), 60, |o| {
            orch.create(o, &new)
        })
        .unwrap_err();
        assert!(matches!(err, MeshError::LeaseConflict { .. }));
        assert_eq!(db.control().unwrap().lease_owner, None);
    }
}
