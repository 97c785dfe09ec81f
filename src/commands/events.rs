use std::path::Path;

use colored::Colorize;

use crate::error::{MeshError, Result};
use crate::model::{Event, EventKind, Resource};
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;
use crate::weave::Weave;

pub fn tail(repo_root: &Path, limit: i64, kind: Option<EventKind>, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let events = repo.db.tail_events(limit.max(1), kind)?;
    output::print_events(&events, format)
}

/// Recompute the hash chain. A broken chain is printed and then reported
/// as `ChainBroken`.
pub fn verify(repo_root: &Path, from: Option<i64>, to: Option<i64>, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let report = Weave::new(&repo.db).verify(from, to)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty if report.ok => println!(
            "{} {}",
            "chain ok".green().bold(),
            format!("({} events checked)", report.checked).dimmed()
        ),
        Format::Pretty => println!(
            "{} at seq {} {}",
            "chain BROKEN".red().bold(),
            report.first_broken.unwrap_or_default(),
            report.detail.as_deref().unwrap_or_default().dimmed()
        ),
        Format::Minimal => println!("{}", if report.ok { "ok" } else { "broken" }),
    }
    if report.ok {
        return Ok(());
    }
    Err(MeshError::ChainBroken {
        seq: report.first_broken.unwrap_or_default(),
        detail: report.detail.unwrap_or_default(),
    })
}

/// Events referencing a task, episode, spawn, commit or resource. When the
/// raw target matches nothing it is retried as a normalised resource id.
pub fn trace(repo_root: &Path, target: &str, limit: usize, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let weave = Weave::new(&repo.db);
    let collect = |t: &str| -> Result<Vec<Event>> { weave.trace(t).take(limit).collect() };

    let mut events = collect(target)?;
    if events.is_empty()
        && let Ok(resource) = Resource::parse(target, repo_root)
        && resource.id() != target
    {
        events = collect(&resource.id())?;
    }
    output::print_events(&events, format)
}
