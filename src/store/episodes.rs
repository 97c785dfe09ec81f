use std::fs;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{Episode, EventKind};
use crate::store::db::{MeshDb, fmt_ts, ts_col, ts_col_opt};
use crate::store::events::append_in;
use crate::store::lock::with_lock;
use crate::store::paths::MeshPaths;

/// Fresh episode id: `ep_` + 48-bit millisecond timestamp + 48 random bits,
/// hex encoded, so ids sort by creation time.
pub fn generate_episode_id(now: DateTime<Utc>) -> Result<String> {
    generate_episode_id_with(now, |bytes| {
        getrandom::fill(bytes).map_err(|e| MeshError::Io(std::io::Error::other(e.to_string())))
    })
}

pub(crate) fn generate_episode_id_with<F>(now: DateTime<Utc>, mut fill_random: F) -> Result<String>
where
    F: FnMut(&mut [u8]) -> Result<()>,
{
    let ms = now.timestamp_millis().max(0) as u64;
    let mut raw = [0_u8; 12];
    raw[..6].copy_from_slice(&ms.to_be_bytes()[2..]);
    fill_random(&mut raw[6..])?;
    Ok(format!("ep_{}", hex::encode(raw)))
}

const EPISODE_COLUMNS: &str = "episode_id, title, parent_episode_id, started_at, ended_at";

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        episode_id: row.get(0)?,
        title: row.get(1)?,
        parent_episode_id: row.get(2)?,
        started_at: ts_col(row, 3)?,
        ended_at: ts_col_opt(row, 4)?,
    })
}

pub(crate) fn episode_in(conn: &Connection, episode_id: &str) -> Result<Option<Episode>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE episode_id = ?1"),
            params![episode_id],
            row_to_episode,
        )
        .optional()?)
}

/// Insert an episode row if absent (meshpack import).
pub(crate) fn insert_episode_in(conn: &Connection, episode: &Episode) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO episodes (episode_id, title, parent_episode_id, started_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            &episode.episode_id,
            &episode.title,
            &episode.parent_episode_id,
            fmt_ts(episode.started_at),
            episode.ended_at.map(fmt_ts),
        ],
    )?;
    Ok(inserted > 0)
}

// ---------------------------------------------------------------------------
// Episode rows
// ---------------------------------------------------------------------------

impl MeshDb {
    /// Create a new open episode. Emits `EPISODE_START`.
    pub fn start_episode(
        &self,
        agent_id: &str,
        title: &str,
        parent_episode_id: Option<&str>,
    ) -> Result<Episode> {
        let now = Utc::now();
        let episode = Episode {
            episode_id: generate_episode_id(now)?,
            title: title.to_string(),
            parent_episode_id: parent_episode_id
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string),
            started_at: now,
            ended_at: None,
        };

        let tx = self.write_tx()?;
        if let Some(parent) = &episode.parent_episode_id
            && episode_in(&tx, parent)?.is_none()
        {
            return Err(MeshError::EpisodeNotFound(parent.clone()));
        }
        insert_episode_in(&tx, &episode)?;
        append_in(
            &tx,
            EventKind::EpisodeStart,
            agent_id,
            json!({
                "episode_id": episode.episode_id,
                "title": episode.title,
                "parent_episode_id": episode.parent_episode_id,
            }),
        )?;
        tx.commit()?;

        tracing::info!(episode = %episode.episode_id, "episode started");
        Ok(episode)
    }

    /// Close an episode. Emits `EPISODE_END`. Ending twice is an error.
    pub fn end_episode(&self, agent_id: &str, episode_id: &str) -> Result<Episode> {
        let now = Utc::now();
        let tx = self.write_tx()?;
        let Some(mut episode) = episode_in(&tx, episode_id)? else {
            return Err(MeshError::EpisodeNotFound(episode_id.to_string()));
        };
        if episode.ended_at.is_some() {
            return Err(MeshError::InvalidInput(format!(
                "episode {episode_id} already ended"
            )));
        }
        tx.execute(
            "UPDATE episodes SET ended_at = ?1 WHERE episode_id = ?2",
            params![fmt_ts(now), episode_id],
        )?;
        append_in(
            &tx,
            EventKind::EpisodeEnd,
            agent_id,
            json!({"episode_id": episode_id}),
        )?;
        tx.commit()?;

        episode.ended_at = Some(now);
        tracing::info!(episode = %episode_id, "episode ended");
        Ok(episode)
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<Episode> {
        episode_in(self.conn(), episode_id)?
            .ok_or_else(|| MeshError::EpisodeNotFound(episode_id.to_string()))
    }

    pub fn list_episodes(&self) -> Result<Vec<Episode>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes ORDER BY started_at, episode_id"
        ))?;
        let rows = stmt.query_map([], row_to_episode)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Current episode pointer (file under the state dir)
// ---------------------------------------------------------------------------

/// The open episode id, if any.
pub fn current_episode(paths: &MeshPaths) -> Result<Option<String>> {
    let path = paths.current_episode_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let id = raw.trim();
    Ok((!id.is_empty()).then(|| id.to_string()))
}

pub fn require_current_episode(paths: &MeshPaths) -> Result<String> {
    current_episode(paths)?.ok_or(MeshError::NoCurrentEpisode)
}

pub fn set_current_episode(paths: &MeshPaths, episode_id: &str) -> Result<()> {
    with_lock(&paths.lock_path(), || {
        fs::write(paths.current_episode_path(), episode_id)?;
        Ok(())
    })
}

pub fn clear_current_episode(paths: &MeshPaths) -> Result<()> {
    with_lock(&paths.lock_path(), || {
        let path = paths.current_episode_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn episode_ids_sort_by_time() {
        let t0 = Utc::now();
        let a = generate_episode_id_with(t0, |b| {
            b.fill(0xff);
            Ok(())
        })
        .unwrap();
        let b = generate_episode_id_with(t0 + chrono::Duration::milliseconds(1), |b| {
            b.fill(0x00);
            Ok(())
        })
        .unwrap();
        assert_eq!(a.len(), 27);
        assert!(a.starts_with("ep_"));
        assert!(a < b);
    }

    #[test]
    fn random_source_failure_propagates() {
        let err = generate_episode_id_with(Utc::now(), |_| Err(MeshError::InvalidInput("no entropy".into())));
        assert!(err.is_err());
    }

    #[test]
    fn start_and_end_emit_events() {
        let db = MeshDb::open_memory().unwrap();
        let ep = db.start_episode("a", "refactor", None).unwrap();
        assert!(ep.ended_at.is_none());
        let ended = db.end_episode("a", &ep.episode_id).unwrap();
        assert!(ended.ended_at.is_some());
        assert!(db.end_episode("a", &ep.episode_id).is_err());

        let kinds: Vec<EventKind> = db.read_events(0, 10).unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::EpisodeStart, EventKind::EpisodeEnd]);
        assert_eq!(db.events_for_episode(&ep.episode_id).unwrap().len(), 2);
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let db = MeshDb::open_memory().unwrap();
        assert!(matches!(
            db.start_episode("a", "", Some("ep_missing")),
            Err(MeshError::EpisodeNotFound(_))
        ));
        let parent = db.start_episode("a", "", None).unwrap();
        let child = db.start_episode("a", "", Some(&parent.episode_id)).unwrap();
        assert_eq!(child.parent_episode_id.as_deref(), Some(parent.episode_id.as_str()));
        assert_eq!(db.list_episodes().unwrap().len(), 2);
    }

    #[test]
    fn current_episode_pointer_lifecycle() {
        let dir = tempdir().unwrap();
        let paths = MeshPaths {
            repo_root: dir.path().to_path_buf(),
            state_dir: dir.path().join(".agentmesh"),
        };
        paths.init().unwrap();
        assert_eq!(current_episode(&paths).unwrap(), None);
        assert!(matches!(
            require_current_episode(&paths),
            Err(MeshError::NoCurrentEpisode)
        ));
        set_current_episode(&paths, "ep_1").unwrap();
        assert_eq!(current_episode(&paths).unwrap().as_deref(), Some("ep_1"));
        clear_current_episode(&paths).unwrap();
        assert_eq!(current_episode(&paths).unwrap(), None);
    }
}
