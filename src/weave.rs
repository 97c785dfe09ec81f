//! Provenance view over the event log: episodes, capsules and commits woven
//! together by `episode_id`.

use std::fmt::Write as _;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{Capsule, Event, EventKind, Sbar, short_id};
use crate::store::capsules::insert_capsule_in;
use crate::store::db::MeshDb;
use crate::store::episodes::episode_in;
use crate::store::events::{ChainReport, EventTrace, append_in};

/// Handoff context for [`Weave::bind_capsule`].
#[derive(Debug, Clone, Default)]
pub struct NewCapsule {
    pub agent_id: String,
    pub task_desc: String,
    pub git_branch: String,
    pub git_sha: String,
    pub files_changed: Vec<String>,
    pub what_changed: String,
    pub sbar: Sbar,
}

/// What a signed commit contributes to the weave.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRecord {
    pub episode_id: String,
    pub commit_sha: String,
    pub witness_hash: String,
    pub patch_id_stable: String,
    pub patch_hash_verbatim: String,
    pub key_id: String,
    pub files: Vec<String>,
}

pub struct Weave<'a> {
    db: &'a MeshDb,
}

impl<'a> Weave<'a> {
    pub fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    /// Store a capsule under an open or closed episode and append `BUNDLE`.
    pub fn bind_capsule(&self, episode_id: &str, new: NewCapsule) -> Result<Capsule> {
        if new.agent_id.trim().is_empty() {
            return Err(MeshError::InvalidInput("capsule agent must not be empty".into()));
        }
        let capsule = Capsule {
            capsule_id: short_id("cap"),
            agent_id: new.agent_id,
            task_desc: new.task_desc,
            git_branch: new.git_branch,
            git_sha: new.git_sha,
            files_changed: new.files_changed,
            what_changed: new.what_changed,
            sbar: new.sbar,
            episode_id: Some(episode_id.to_string()),
            created_at: Utc::now(),
        };

        let tx = self.db.write_tx()?;
        if episode_in(&tx, episode_id)?.is_none() {
            return Err(MeshError::EpisodeNotFound(episode_id.to_string()));
        }
        insert_capsule_in(&tx, &capsule)?;
        append_in(
            &tx,
            EventKind::Bundle,
            &capsule.agent_id,
            json!({
                "capsule_id": capsule.capsule_id,
                "episode_id": episode_id,
                "git_sha": capsule.git_sha,
                "files_changed": capsule.files_changed,
            }),
        )?;
        tx.commit()?;

        tracing::info!(capsule = %capsule.capsule_id, episode = %episode_id, "capsule bound");
        Ok(capsule)
    }

    /// Append the `COMMIT` event for a witnessed commit.
    pub fn record_commit(&self, agent_id: &str, record: &CommitRecord) -> Result<Event> {
        let mut payload = serde_json::to_value(record)?;
        payload["agent_id"] = json!(agent_id);
        self.db.append_event(EventKind::Commit, agent_id, payload)
    }

    /// Events belonging to one episode, in sequence order.
    pub fn export_slice(&self, episode_id: &str) -> Result<Vec<Event>> {
        self.db.events_for_episode(episode_id)
    }

    pub fn trace(&self, target: &str) -> EventTrace<'a> {
        self.db.trace(target)
    }

    pub fn verify(&self, from: Option<i64>, to: Option<i64>) -> Result<ChainReport> {
        self.db.verify_chain(from, to)
    }

    /// Render the weave (or one episode's slice) as a Markdown table.
    pub fn export_markdown(&self, episode_id: Option<&str>) -> Result<String> {
        let (title, events) = match episode_id {
            Some(id) => (format!("Weave: {id}"), self.export_slice(id)?),
            None => ("Weave".to_string(), self.db.read_events(0, i64::MAX)?),
        };

        let mut out = String::new();
        let _ = writeln!(out, "# {title}\n");
        let _ = writeln!(out, "| seq | kind | agent | ts | summary | hash |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for event in &events {
            let short = crate::canonical::digest_hex(&event.hash);
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | `{}` |",
                event.seq,
                event.kind,
                if event.agent_id.is_empty() { "-" } else { &event.agent_id },
                event.ts,
                summarize(event).replace('|', "\\|"),
                &short[..short.len().min(12)],
            );
        }
        Ok(out)
    }
}

fn summarize(event: &Event) -> String {
    let p = &event.payload;
    let s = |key: &str| p.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
    match event.kind {
        EventKind::TaskTransition => format!(
            "{} {} -> {}",
            s("task_id"),
            p.get("from_state").and_then(|v| v.as_str()).unwrap_or("(new)"),
            s("to_state")
        ),
        EventKind::Claim
        | EventKind::Release
        | EventKind::Steal
        | EventKind::Expire
        | EventKind::Wait => s("resource_id"),
        EventKind::SoftConflict => format!("{} -> {}", s("changed_file"), s("affected_agent")),
        EventKind::Commit => format!("{} {}", s("commit_sha"), s("witness_hash")),
        EventKind::Bundle => s("capsule_id"),
        EventKind::WorkerDone => format!("{} {} ${}", s("spawn_id"), s("outcome"), p["cost_usd"]),
        EventKind::CostExceeded => format!("{} actual ${}", s("task_id"), p["actual_usd"]),
        _ => s("episode_id"),
    }
}
