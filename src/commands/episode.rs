use std::path::{Path, PathBuf};

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::meshpack;
use crate::model::Episode;
use crate::output::{self, Format};
use crate::store::db::fmt_ts;
use crate::store::episodes::{clear_current_episode, current_episode, set_current_episode};
use crate::store::repo::MeshRepo;

fn print_episode(episode: &Episode, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(episode)?,
        Format::Pretty => {
            let state = if episode.ended_at.is_some() {
                "closed".dimmed()
            } else {
                "open".green()
            };
            println!("Episode {} ({})", episode.episode_id.bold(), state);
            if !episode.title.is_empty() {
                println!("  {} {}", "title:".dimmed(), episode.title);
            }
            if let Some(parent) = &episode.parent_episode_id {
                println!("  {} {}", "parent:".dimmed(), parent);
            }
            println!("  {} {}", "started:".dimmed(), fmt_ts(episode.started_at));
            if let Some(ended) = episode.ended_at {
                println!("  {} {}", "ended:".dimmed(), fmt_ts(ended));
            }
        }
        Format::Minimal => println!("{}", episode.episode_id),
    }
    Ok(())
}

/// Start an episode and make it the current one.
pub fn start(
    repo_root: &Path,
    agent_id: &str,
    title: &str,
    parent: Option<&str>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode = repo.db.start_episode(agent_id, title, parent)?;
    set_current_episode(&repo.paths, &episode.episode_id)?;
    print_episode(&episode, format)
}

/// End the named episode, or the current one. The current pointer is
/// cleared when it names the ended episode.
pub fn end(
    repo_root: &Path,
    agent_id: &str,
    episode_id: Option<String>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode_id = repo.require_episode(episode_id)?;
    let episode = repo.db.end_episode(agent_id, &episode_id)?;
    if current_episode(&repo.paths)?.as_deref() == Some(episode_id.as_str()) {
        clear_current_episode(&repo.paths)?;
    }
    print_episode(&episode, format)
}

pub fn current(repo_root: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    match current_episode(&repo.paths)? {
        Some(id) => print_episode(&repo.db.get_episode(&id)?, format),
        None => {
            match format {
                Format::Json => println!("{}", json!(null)),
                Format::Pretty => println!("{}", "No active episode".dimmed()),
                Format::Minimal => {}
            }
            Ok(())
        }
    }
}

pub fn list(repo_root: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episodes = repo.db.list_episodes()?;
    match format {
        Format::Json => output::print_json(&episodes)?,
        Format::Pretty => {
            if episodes.is_empty() {
                println!("{}", "No episodes.".dimmed());
            }
            for ep in &episodes {
                let state = if ep.ended_at.is_some() {
                    "closed".dimmed()
                } else {
                    "open".green()
                };
                println!("{} {} {}", ep.episode_id.bold(), state, ep.title);
            }
        }
        Format::Minimal => {
            for ep in &episodes {
                println!("{}", ep.episode_id);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Meshpacks
// ---------------------------------------------------------------------------

pub fn export(
    repo_root: &Path,
    episode_id: Option<String>,
    out: Option<PathBuf>,
    key_id: Option<&str>,
    inline_key: bool,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode_id = repo.require_episode(episode_id)?;
    let out = out.unwrap_or_else(|| PathBuf::from(format!("{episode_id}.meshpack")));
    let report = meshpack::export(&repo.db, &repo.keystore, &episode_id, key_id, inline_key, &out)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!("Exported to {}", report.path.display().to_string().bold());
            println!("  {} {}", "signed by:".dimmed(), report.signer_key_id);
            for (name, count) in &report.counts {
                println!("  {} {}", format!("{name}:").dimmed(), count);
            }
        }
        Format::Minimal => println!("{}", report.path.display()),
    }
    Ok(())
}

/// Verify a pack. Rejections surface as errors with their own exit codes.
pub fn verify(repo_root: &Path, path: &Path, accept_legacy: bool, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let accept_legacy = accept_legacy || repo.config.accept_legacy_packs;
    let report = meshpack::verify(path, &repo.keystore, accept_legacy)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!("{} {}", "Signature valid".green().bold(), format!("({})", report.kind).dimmed());
            println!("  {} {}", "episode:".dimmed(), report.episode_id);
            if let Some(key) = &report.signer_key_id {
                println!("  {} {}", "signer:".dimmed(), key);
            }
            println!("  {} {}", "counts:".dimmed(), report.counts);
        }
        Format::Minimal => println!("valid"),
    }
    Ok(())
}

pub fn import(
    repo_root: &Path,
    path: &Path,
    namespace: Option<&str>,
    agent_id: &str,
    accept_legacy: bool,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let accept_legacy = accept_legacy || repo.config.accept_legacy_packs;
    let report = meshpack::import(&repo.db, &repo.keystore, path, namespace, agent_id, accept_legacy)?;
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!(
                "Imported {} {}",
                report.episode_id.bold(),
                format!("({})", report.kind).dimmed()
            );
            let c = &report.counts;
            println!(
                "  {} episodes={} capsules={} messages={} weave_events={}",
                "inserted:".dimmed(),
                c.episodes,
                c.capsules,
                c.messages,
                c.weave_events
            );
        }
        Format::Minimal => println!("{}", report.episode_id),
    }
    Ok(())
}
