use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::model::Severity;
use crate::output::{self, Format};
use crate::store::messages::NewMessage;
use crate::store::repo::MeshRepo;

pub struct PostArgs {
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub channel: String,
    pub severity: Severity,
    pub body: String,
}

/// Post a message, tagged with the current episode when one is open.
pub fn post(repo_root: &Path, args: PostArgs, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode = repo.episode_or_current(None)?;
    let msg = repo.db.post_message(&NewMessage {
        from_agent: &args.from_agent,
        to_agent: args.to_agent.as_deref(),
        channel: &args.channel,
        severity: args.severity,
        body: &args.body,
        episode_id: episode.as_deref(),
    })?;
    match format {
        Format::Json => output::print_json(&msg)?,
        Format::Pretty => println!(
            "Posted {} to {} {}",
            msg.severity.to_string().bold(),
            msg.to_agent.as_deref().unwrap_or(&msg.channel).cyan(),
            format!("[{}]", msg.msg_id).dimmed()
        ),
        Format::Minimal => println!("{}", msg.msg_id),
    }
    Ok(())
}

pub fn inbox(repo_root: &Path, agent_id: &str, mark_read: bool, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let messages = repo.db.inbox(agent_id, mark_read)?;
    output::print_messages(&messages, format)
}
