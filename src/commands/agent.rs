use std::path::Path;

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::model::{Agent, AgentStatus};
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;

fn print_agent(agent: &Agent, verb: &str, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(agent)?,
        Format::Pretty => {
            println!("{} '{}'", verb, agent.agent_id.cyan().bold());
            println!("  {} {}", "status:".dimmed(), agent.status);
            println!("  {} {}", "cwd:".dimmed(), agent.cwd);
        }
        Format::Minimal => println!("{}", agent.agent_id),
    }
    Ok(())
}

pub fn register(repo_root: &Path, agent_id: &str, cwd: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let agent = repo.db.register_agent(agent_id, cwd)?;
    print_agent(&agent, "Registered", format)
}

pub fn heartbeat(
    repo_root: &Path,
    agent_id: &str,
    status: AgentStatus,
    cwd: &str,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let agent = repo.db.heartbeat(agent_id, status, cwd)?;
    print_agent(&agent, "Heartbeat from", format)
}

pub fn deregister(repo_root: &Path, agent_id: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let released = repo.db.deregister_agent(agent_id)?;
    match format {
        Format::Json => println!(
            "{}",
            json!({"agent_id": agent_id, "status": "gone", "released_claims": released})
        ),
        Format::Pretty => println!(
            "Deregistered '{}' ({} claims released)",
            agent_id.cyan(),
            released
        ),
        Format::Minimal => println!("{agent_id}"),
    }
    Ok(())
}

pub fn list(repo_root: &Path, all: bool, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let agents = repo.db.list_agents(all)?;
    output::print_agents(&agents, format)
}
