use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;
use crate::watchdog::Watchdog;

/// Run one reconciliation pass. Thresholds default to the config values.
pub fn scan(
    repo_root: &Path,
    stale_secs: Option<i64>,
    spawn_timeout_secs: Option<i64>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let report = Watchdog::new(
        &repo.db,
        stale_secs.unwrap_or(repo.config.stale_agent_secs),
        spawn_timeout_secs.unwrap_or(repo.config.spawn_timeout_secs),
    )
    .scan()?;

    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty if report.is_clean() => println!("{}", "Nothing to reconcile.".dimmed()),
        Format::Pretty => {
            let line = |label: &str, items: &[String]| {
                if !items.is_empty() {
                    println!("{} {}", format!("{label}:").yellow().bold(), items.join(", "));
                }
            };
            line("expired claims", &report.expired_claims);
            if let Some(owner) = &report.expired_lease_owner {
                println!("{} {}", "expired lease:".yellow().bold(), owner);
            }
            line("reaped agents", &report.reaped_agents);
            line("aborted tasks", &report.aborted_tasks);
            line("orphaned spawns", &report.orphaned_spawns);
            line("timed-out spawns", &report.timed_out_spawns);
            line("over budget", &report.cost_exceeded_tasks);
            if let Some(seq) = report.gc_event_seq {
                println!("  {} #{}", "event:".dimmed(), seq);
            }
        }
        Format::Minimal => println!("{}", if report.is_clean() { "clean" } else { "changed" }),
    }
    Ok(())
}
