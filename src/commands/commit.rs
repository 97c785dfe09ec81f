use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::conflicts::{self, SoftConflict};
use crate::error::Result;
use crate::git;
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;
use crate::weave::{CommitRecord, Weave};
use crate::witness;

#[derive(Debug, Serialize)]
struct CommitReport {
    commit_sha: String,
    episode_id: String,
    key_id: String,
    witness_hash: String,
    patch_id_stable: String,
    files: Vec<String>,
    event_seq: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    soft_conflicts: Vec<SoftConflict>,
}

/// Witness the staged diff, commit it with trailers, and weave the commit
/// into the event log. Holders of files that import a symbol the commit
/// removed are alerted afterwards.
pub fn run(
    repo_root: &Path,
    message: &str,
    agent_id: &str,
    key_id: Option<&str>,
    episode_id: Option<String>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let episode_id = repo.require_episode(episode_id)?;

    let staged = witness::witness_staged(
        repo_root,
        &episode_id,
        agent_id,
        &repo.keystore,
        key_id,
        &repo.witnesses,
        repo.config.witness_chunk_size,
    )?;
    // HEAD moves on commit, so export changes are taken first.
    let export_changes = conflicts::staged_changes(repo_root, &staged.files)?;
    let full_message = witness::message_with_trailers(message, &staged.trailers);
    let commit_sha = git::commit_index(repo_root, &full_message)?;

    let envelope = &staged.signed.envelope;
    let record = CommitRecord {
        episode_id: episode_id.clone(),
        commit_sha: commit_sha.clone(),
        witness_hash: staged.signed.witness_hash.clone(),
        patch_id_stable: envelope.patch_id_stable.clone(),
        patch_hash_verbatim: envelope.patch_hash_verbatim.clone(),
        key_id: staged.signed.key_id.clone(),
        files: staged.files.clone(),
    };
    let event = Weave::new(&repo.db).record_commit(agent_id, &record)?;
    tracing::info!(commit = %commit_sha, episode = %episode_id, "witnessed commit");

    let mut soft_conflicts = Vec::new();
    for (file, changes) in &export_changes {
        match conflicts::post_alerts(&repo.db, file, changes, agent_id, Some(&episode_id)) {
            Ok(found) => soft_conflicts.extend(found),
            Err(e) => tracing::warn!(file = %file, error = %e, "soft conflict alerts failed"),
        }
    }

    let report = CommitReport {
        commit_sha,
        episode_id,
        key_id: record.key_id,
        witness_hash: record.witness_hash,
        patch_id_stable: record.patch_id_stable,
        files: record.files,
        event_seq: event.seq,
        soft_conflicts,
    };
    match format {
        Format::Json => output::print_json(&report)?,
        Format::Pretty => {
            println!(
                "Committed {} {}",
                report.commit_sha.get(..12).unwrap_or(&report.commit_sha).bold(),
                format!("({} file(s))", report.files.len()).dimmed()
            );
            println!("  {} {}", "episode:".dimmed(), report.episode_id);
            println!("  {} {}", "witness:".dimmed(), report.witness_hash);
            println!("  {} {}", "key:".dimmed(), report.key_id);
            for sc in &report.soft_conflicts {
                println!(
                    "  {} {} may import {}",
                    "alerted".yellow(),
                    sc.affected_agent.bold(),
                    sc.symbols.join(", ")
                );
            }
        }
        Format::Minimal => println!("{}", report.commit_sha),
    }
    Ok(())
}
