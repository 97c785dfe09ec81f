use rusqlite::{Connection, params};

use crate::error::Result;
use crate::model::Capsule;
use crate::store::db::{MeshDb, fmt_ts, json_col, ts_col};

const CAPSULE_COLUMNS: &str = "capsule_id, agent_id, task_desc, git_branch, git_sha, \
                               files_changed, what_changed, sbar, episode_id, created_at";

fn row_to_capsule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Capsule> {
    Ok(Capsule {
        capsule_id: row.get(0)?,
        agent_id: row.get(1)?,
        task_desc: row.get(2)?,
        git_branch: row.get(3)?,
        git_sha: row.get(4)?,
        files_changed: json_col(row, 5)?,
        what_changed: row.get(6)?,
        sbar: json_col(row, 7)?,
        episode_id: row.get(8)?,
        created_at: ts_col(row, 9)?,
    })
}

/// Insert a capsule row. Returns false when the id already exists.
pub(crate) fn insert_capsule_in(conn: &Connection, capsule: &Capsule) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO capsules (capsule_id, agent_id, task_desc, git_branch, git_sha,
                                         files_changed, what_changed, sbar, episode_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &capsule.capsule_id,
            &capsule.agent_id,
            &capsule.task_desc,
            &capsule.git_branch,
            &capsule.git_sha,
            serde_json::to_string(&capsule.files_changed)?,
            &capsule.what_changed,
            serde_json::to_string(&capsule.sbar)?,
            &capsule.episode_id,
            fmt_ts(capsule.created_at),
        ],
    )?;
    Ok(inserted > 0)
}

impl MeshDb {
    pub fn capsules_for_episode(&self, episode_id: &str) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules WHERE episode_id = ?1
             ORDER BY created_at, capsule_id"
        ))?;
        let rows = stmt.query_map(params![episode_id], row_to_capsule)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_capsules(&self, limit: i64) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules ORDER BY created_at DESC, capsule_id LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], row_to_capsule)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sbar;
    use chrono::Utc;

    #[test]
    fn capsule_json_columns_round_trip() {
        let db = MeshDb::open_memory().unwrap();
        let capsule = Capsule {
            capsule_id: "cap_1".into(),
            agent_id: "a".into(),
            task_desc: "split parser".into(),
            git_branch: "main".into(),
            git_sha: "abc".into(),
            files_changed: vec!["src/a.rs".into(), "src/b.rs".into()],
            what_changed: "moved lexer".into(),
            sbar: Sbar {
                situation: "s".into(),
                recommendation: "r".into(),
                ..Sbar::default()
            },
            episode_id: Some("ep_1".into()),
            created_at: Utc::now(),
        };
        assert!(insert_capsule_in(db.conn(), &capsule).unwrap());
        assert!(!insert_capsule_in(db.conn(), &capsule).unwrap());

        let loaded = db.capsules_for_episode("ep_1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].files_changed, capsule.files_changed);
        assert_eq!(loaded[0].sbar, capsule.sbar);
        assert_eq!(db.list_capsules(10).unwrap().len(), 1);
    }
}
