use std::path::Path;
use std::time::Duration;

use colored::Colorize;

use serde::Serialize;

use crate::conflicts::{self, SoftConflict};
use crate::error::{MeshError, Result};
use crate::model::{Claim, ClaimIntent, Resource, ResourceKind};
use crate::output::{self, Format};
use crate::store::claims::ClaimRequest;
use crate::store::db::fmt_ts;
use crate::store::repo::MeshRepo;
use crate::store::waiters::NewWaiter;

/// Options shared by `claim` and `steal`.
pub struct ClaimArgs {
    pub resource: String,
    pub agent_id: String,
    pub ttl_secs: Option<i64>,
    pub reason: String,
    pub intent: ClaimIntent,
    pub episode_id: Option<String>,
    pub priority: u8,
}

fn request(repo: &MeshRepo, repo_root: &Path, args: ClaimArgs) -> Result<ClaimRequest> {
    let resource = Resource::parse(&args.resource, repo_root)?;
    let ttl = args.ttl_secs.unwrap_or(repo.config.claim_ttl_secs);
    let episode = repo.episode_or_current(args.episode_id)?;
    Ok(ClaimRequest::new(resource.id(), args.agent_id, ttl)
        .reason(args.reason)
        .intent(args.intent)
        .episode(episode)
        .priority(args.priority))
}

/// Acquire a claim. `force` expires any foreign holder first.
pub fn acquire(repo_root: &Path, args: ClaimArgs, force: bool, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let req = request(&repo, repo_root, args)?;
    let claim = if force {
        repo.db.steal(&req)?
    } else {
        repo.db.acquire(&req)?
    };
    output::print_claim(&claim, format)
}

pub fn steal(repo_root: &Path, args: ClaimArgs, format: Format) -> Result<()> {
    acquire(repo_root, args, true, format)
}

pub fn release(
    repo_root: &Path,
    resource: Option<String>,
    agent_id: &str,
    all: bool,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let released = match (resource, all) {
        (_, true) => repo.db.release_all(agent_id)?,
        (Some(raw), false) => {
            let resource = Resource::parse(&raw, repo_root)?;
            vec![repo.db.release(&resource.id(), agent_id)?]
        }
        (None, false) => {
            return Err(MeshError::InvalidInput(
                "specify a resource or --all".into(),
            ));
        }
    };
    match format {
        Format::Json => output::print_json(&released)?,
        Format::Pretty => {
            println!("Released {} claim(s)", released.len().to_string().bold());
            for c in &released {
                println!("  {}", c.resource_id.cyan());
            }
        }
        Format::Minimal => {
            for c in &released {
                println!("{}", c.resource_id);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    conflicts: &'a [Claim],
    soft_conflicts: &'a [SoftConflict],
}

/// Report live claims on a resource held by anyone but `agent_id`.
/// Conflicts are printed, then surfaced as a `ClaimConflict` error. With
/// `soft`, a file resource is also compared against HEAD and any other
/// holder importing a symbol it no longer exports is reported; those are
/// advisory and never fail the check.
pub fn check(
    repo_root: &Path,
    resource: &str,
    agent_id: Option<&str>,
    soft: bool,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let resource = Resource::parse(resource, repo_root)?;
    let resource_id = resource.id();
    let conflicts = repo.db.check(&resource_id, agent_id)?;
    let soft_conflicts = if soft && resource.kind == ResourceKind::File {
        conflicts::working_tree_conflicts(&repo.db, repo_root, &resource_id, agent_id)?
    } else {
        Vec::new()
    };

    match format {
        Format::Json if soft => output::print_json(&CheckReport {
            conflicts: &conflicts,
            soft_conflicts: &soft_conflicts,
        })?,
        Format::Json => output::print_json(&conflicts)?,
        Format::Pretty => {
            if conflicts.is_empty() {
                println!("No conflicts on {}", resource_id.green().bold());
            } else {
                println!("{} {}", "CONFLICT on".red().bold(), resource_id.bold());
                output::print_claims(&conflicts, Format::Pretty)?;
            }
            for sc in &soft_conflicts {
                println!(
                    "{} {} imports {} {}",
                    "soft:".yellow().bold(),
                    format!("[{}]", sc.affected_agent).bold(),
                    sc.symbols.join(", ").yellow(),
                    format!("({})", sc.affected_file).dimmed()
                );
            }
        }
        Format::Minimal => {
            output::print_claims(&conflicts, Format::Minimal)?;
            for sc in &soft_conflicts {
                println!("soft {} {}", sc.affected_agent, sc.affected_file);
            }
        }
    }

    match conflicts.first() {
        Some(holder) => Err(MeshError::ClaimConflict {
            resource: resource_id,
            holder: holder.agent_id.clone(),
            expires_at: fmt_ts(holder.expires_at),
        }),
        None => Ok(()),
    }
}

pub fn list(repo_root: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let claims = repo.db.list_active()?;
    output::print_claims(&claims, format)
}

/// Options for `wait`.
pub struct WaitArgs {
    pub resource: String,
    pub agent_id: String,
    pub priority: u8,
    pub reason: String,
    pub timeout_secs: u64,
}

/// Block until no foreign claim holds the resource, or time out. While
/// blocked the caller is queued as a waiter on the holder.
pub fn wait(repo_root: &Path, args: WaitArgs, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let resource_id = Resource::parse(&args.resource, repo_root)?.id();
    let episode = repo.episode_or_current(None)?;
    let poll = Duration::from_millis(repo.config.wait_poll_millis.max(10));
    let outcome = repo.db.wait_free(
        &NewWaiter {
            resource_id: &resource_id,
            agent_id: &args.agent_id,
            priority: args.priority,
            reason: &args.reason,
            episode_id: episode.as_deref(),
        },
        Duration::from_secs(args.timeout_secs),
        poll,
    )?;
    match format {
        Format::Json => output::print_json(&outcome)?,
        Format::Pretty => println!(
            "{} is free {}",
            outcome.resource_id.green().bold(),
            format!("(waited {}ms)", outcome.waited_ms).dimmed()
        ),
        Format::Minimal => println!("{}", outcome.waited_ms),
    }
    Ok(())
}

/// Who is queued behind held resources.
pub fn waiters(repo_root: &Path, resource: Option<&str>, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let resource_id = resource
        .map(|raw| Resource::parse(raw, repo_root).map(|r| r.id()))
        .transpose()?;
    let waiters = repo.db.list_waiters(resource_id.as_deref())?;
    output::print_waiters(&waiters, format)
}
