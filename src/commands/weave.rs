use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::git;
use crate::model::Sbar;
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;
use crate::weave::{NewCapsule, Weave};

/// Export the weave (or one episode's slice). `markdown` renders a table,
/// otherwise the events are emitted as JSON. `out` writes to a file.
pub fn export(
    repo_root: &Path,
    episode_id: Option<String>,
    markdown: bool,
    out: Option<PathBuf>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let weave = Weave::new(&repo.db);

    let rendered = if markdown {
        weave.export_markdown(episode_id.as_deref())?
    } else {
        let events = match &episode_id {
            Some(id) => weave.export_slice(id)?,
            None => repo.db.read_events(0, i64::MAX)?,
        };
        serde_json::to_string_pretty(&events)?
    };

    match out {
        Some(path) => {
            fs::write(&path, &rendered)?;
            match format {
                Format::Json => println!(
                    "{}",
                    json!({"path": path.display().to_string(), "bytes": rendered.len()})
                ),
                Format::Pretty => println!("Wrote weave to {}", path.display().to_string().bold()),
                Format::Minimal => println!("{}", path.display()),
            }
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

pub struct CapsuleArgs {
    pub episode_id: Option<String>,
    pub agent_id: String,
    pub task_desc: String,
    pub files_changed: Vec<String>,
    pub what_changed: String,
    pub sbar: Sbar,
}

/// Bind a handoff capsule to an episode, filling branch and sha from HEAD.
pub fn bind(repo_root: &Path, args: CapsuleArgs, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode_id = repo.require_episode(args.episode_id)?;
    let head = git::current_head_info(repo_root);
    let capsule = Weave::new(&repo.db).bind_capsule(
        &episode_id,
        NewCapsule {
            agent_id: args.agent_id,
            task_desc: args.task_desc,
            git_branch: head
                .as_ref()
                .and_then(|h| h.branch.clone())
                .unwrap_or_default(),
            git_sha: head.map(|h| h.sha).unwrap_or_default(),
            files_changed: args.files_changed,
            what_changed: args.what_changed,
            sbar: args.sbar,
        },
    )?;

    match format {
        Format::Json => output::print_json(&capsule)?,
        Format::Pretty => {
            println!(
                "Bound capsule {} to {}",
                capsule.capsule_id.cyan().bold(),
                episode_id.bold()
            );
            if !capsule.task_desc.is_empty() {
                println!("  {} {}", "task:".dimmed(), capsule.task_desc);
            }
            if !capsule.files_changed.is_empty() {
                println!("  {} {}", "files:".dimmed(), capsule.files_changed.join(", "));
            }
        }
        Format::Minimal => println!("{}", capsule.capsule_id),
    }
    Ok(())
}
