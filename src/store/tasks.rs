use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{MeshError, Result};
use crate::model::{Attempt, Spawn, Task, TaskState, short_id};
use crate::store::db::{MeshDb, enum_col, fmt_ts, ts_col, ts_col_opt};

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "task_id, title, description, state, branch, max_cost_usd, \
                            cumulative_cost_usd, episode_id, assigned_agent, created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        state: enum_col(row, 3)?,
        branch: row.get(4)?,
        max_cost_usd: row.get(5)?,
        cumulative_cost_usd: row.get(6)?,
        episode_id: row.get(7)?,
        assigned_agent: row.get(8)?,
        depends_on: Vec::new(),
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

const SPAWN_COLUMNS: &str =
    "spawn_id, task_id, agent_id, pid, timeout_secs, started_at, ended_at, outcome, cost_usd";

fn row_to_spawn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Spawn> {
    Ok(Spawn {
        spawn_id: row.get(0)?,
        task_id: row.get(1)?,
        agent_id: row.get(2)?,
        pid: row.get(3)?,
        timeout_secs: row.get(4)?,
        started_at: ts_col(row, 5)?,
        ended_at: ts_col_opt(row, 6)?,
        outcome: row.get(7)?,
        cost_usd: row.get(8)?,
    })
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        attempt_id: row.get(0)?,
        task_id: row.get(1)?,
        agent_id: row.get(2)?,
        attempt_number: row.get(3)?,
        started_at: ts_col(row, 4)?,
        ended_at: ts_col_opt(row, 5)?,
        outcome: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn deps_in(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT depends_on FROM task_deps WHERE task_id = ?1 ORDER BY position")?;
    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub(crate) fn task_in(conn: &Connection, task_id: &str) -> Result<Task> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id],
            row_to_task,
        )
        .optional()?;
    let Some(mut task) = task else {
        return Err(MeshError::TaskNotFound(task_id.to_string()));
    };
    task.depends_on = deps_in(conn, task_id)?;
    Ok(task)
}

pub(crate) fn insert_task_in(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (task_id, title, description, state, branch, max_cost_usd,
                            cumulative_cost_usd, episode_id, assigned_agent, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            &task.task_id,
            &task.title,
            &task.description,
            task.state.to_string(),
            &task.branch,
            task.max_cost_usd,
            task.cumulative_cost_usd,
            &task.episode_id,
            &task.assigned_agent,
            fmt_ts(task.created_at),
            fmt_ts(task.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_state_in(
    conn: &Connection,
    task_id: &str,
    state: TaskState,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET state = ?1, updated_at = ?2 WHERE task_id = ?3",
        params![state.to_string(), fmt_ts(now), task_id],
    )?;
    Ok(())
}

pub(crate) fn set_assigned_agent_in(conn: &Connection, task_id: &str, agent: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET assigned_agent = ?1 WHERE task_id = ?2",
        params![agent, task_id],
    )?;
    Ok(())
}

pub(crate) fn set_cost_in(conn: &Connection, task_id: &str, cost_usd: f64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET cumulative_cost_usd = ?1 WHERE task_id = ?2",
        params![cost_usd, task_id],
    )?;
    Ok(())
}

pub(crate) fn replace_deps_in(conn: &Connection, task_id: &str, deps: &[String]) -> Result<()> {
    conn.execute("DELETE FROM task_deps WHERE task_id = ?1", params![task_id])?;
    for (position, dep) in deps.iter().enumerate() {
        conn.execute(
            "INSERT INTO task_deps (task_id, depends_on, position) VALUES (?1, ?2, ?3)",
            params![task_id, dep, position as i64],
        )?;
    }
    Ok(())
}

/// The whole dependency graph as an adjacency map.
pub(crate) fn dep_graph_in(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt =
        conn.prepare("SELECT task_id, depends_on FROM task_deps ORDER BY task_id, position")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let (task, dep) = row?;
        graph.entry(task).or_default().push(dep);
    }
    Ok(graph)
}

pub(crate) fn non_terminal_task_ids_in(
    conn: &Connection,
    assigned_to: Option<&str>,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT task_id FROM tasks
         WHERE state NOT IN ('MERGED', 'ABORTED')
           AND (?1 IS NULL OR assigned_agent = ?1)
         ORDER BY created_at, task_id",
    )?;
    let rows = stmt.query_map(params![assigned_to], |row| row.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Sum of `cost_usd` over every `WORKER_DONE` event for a task.
pub(crate) fn cost_from_events_in(conn: &Connection, task_id: &str) -> Result<f64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(json_extract(payload, '$.cost_usd')), 0.0)
         FROM events
         WHERE kind = 'WORKER_DONE' AND json_extract(payload, '$.task_id') = ?1",
        params![task_id],
        |row| row.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

pub(crate) fn open_attempt_in(
    conn: &Connection,
    task_id: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Attempt> {
    let number: i64 = conn.query_row(
        "SELECT COUNT(*) + 1 FROM attempts WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )?;
    let attempt = Attempt {
        attempt_id: short_id("att"),
        task_id: task_id.to_string(),
        agent_id: agent_id.to_string(),
        attempt_number: number,
        started_at: now,
        ended_at: None,
        outcome: None,
    };
    conn.execute(
        "INSERT INTO attempts (attempt_id, task_id, agent_id, attempt_number, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            &attempt.attempt_id,
            task_id,
            agent_id,
            number,
            fmt_ts(now)
        ],
    )?;
    Ok(attempt)
}

/// Close the task's open attempt, if any. Returns its id.
pub(crate) fn close_attempt_in(
    conn: &Connection,
    task_id: &str,
    outcome: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let open: Option<String> = conn
        .query_row(
            "SELECT attempt_id FROM attempts
             WHERE task_id = ?1 AND ended_at IS NULL
             ORDER BY attempt_number DESC LIMIT 1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = &open {
        conn.execute(
            "UPDATE attempts SET ended_at = ?1, outcome = ?2 WHERE attempt_id = ?3",
            params![fmt_ts(now), outcome, id],
        )?;
    }
    Ok(open)
}

// ---------------------------------------------------------------------------
// Spawns
// ---------------------------------------------------------------------------

pub(crate) fn insert_spawn_in(conn: &Connection, spawn: &Spawn) -> Result<()> {
    conn.execute(
        "INSERT INTO spawns (spawn_id, task_id, agent_id, pid, timeout_secs, started_at, cost_usd)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            &spawn.spawn_id,
            &spawn.task_id,
            &spawn.agent_id,
            spawn.pid,
            spawn.timeout_secs,
            fmt_ts(spawn.started_at),
        ],
    )?;
    Ok(())
}

/// An active (not yet ended) spawn.
pub(crate) fn active_spawn_in(conn: &Connection, spawn_id: &str) -> Result<Spawn> {
    conn.query_row(
        &format!("SELECT {SPAWN_COLUMNS} FROM spawns WHERE spawn_id = ?1 AND ended_at IS NULL"),
        params![spawn_id],
        row_to_spawn,
    )
    .optional()?
    .ok_or_else(|| MeshError::SpawnNotFound(spawn_id.to_string()))
}

pub(crate) fn active_spawns_in(conn: &Connection, task_id: Option<&str>) -> Result<Vec<Spawn>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SPAWN_COLUMNS} FROM spawns
         WHERE ended_at IS NULL AND (?1 IS NULL OR task_id = ?1)
         ORDER BY started_at, spawn_id"
    ))?;
    let rows = stmt.query_map(params![task_id], row_to_spawn)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub(crate) fn end_spawn_in(
    conn: &Connection,
    spawn_id: &str,
    outcome: &str,
    cost_usd: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE spawns SET ended_at = ?1, outcome = ?2, cost_usd = ?3 WHERE spawn_id = ?4",
        params![fmt_ts(now), outcome, cost_usd, spawn_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

impl MeshDb {
    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        task_in(self.conn(), task_id)
    }

    pub fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT task_id FROM tasks WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY created_at, task_id",
            )?;
            stmt.query_map(params![state.map(|s| s.to_string())], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        ids.iter().map(|id| task_in(self.conn(), id)).collect()
    }

    pub fn attempts_for_task(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let mut stmt = self.conn().prepare(
            "SELECT attempt_id, task_id, agent_id, attempt_number, started_at, ended_at, outcome
             FROM attempts WHERE task_id = ?1 ORDER BY attempt_number",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_attempt)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_spawns(&self, active_only: bool) -> Result<Vec<Spawn>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SPAWN_COLUMNS} FROM spawns
             WHERE (?1 = 0 OR ended_at IS NULL)
             ORDER BY started_at, spawn_id"
        ))?;
        let rows = stmt.query_map(params![active_only], row_to_spawn)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Cumulative cost recorded by `WORKER_DONE` events.
    pub fn task_cost_from_events(&self, task_id: &str) -> Result<f64> {
        cost_from_events_in(self.conn(), task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;
    use serde_json::json;

    fn sample(id: &str) -> Task {
        let now = Utc::now();
        Task {
            task_id: id.to_string(),
            title: format!("task {id}"),
            description: String::new(),
            state: TaskState::Created,
            branch: None,
            max_cost_usd: Some(1.0),
            cumulative_cost_usd: 0.0,
            episode_id: None,
            assigned_agent: None,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn task_rows_round_trip_with_deps() {
        let db = MeshDb::open_memory().unwrap();
        insert_task_in(db.conn(), &sample("t1")).unwrap();
        insert_task_in(db.conn(), &sample("t2")).unwrap();
        replace_deps_in(db.conn(), "t2", &["t1".to_string()]).unwrap();

        let t2 = db.get_task("t2").unwrap();
        assert_eq!(t2.depends_on, vec!["t1".to_string()]);
        assert_eq!(t2.max_cost_usd, Some(1.0));
        assert_eq!(dep_graph_in(db.conn()).unwrap()["t2"], vec!["t1".to_string()]);
        assert!(matches!(db.get_task("nope"), Err(MeshError::TaskNotFound(_))));
    }

    #[test]
    fn attempts_are_numbered_and_closed() {
        let db = MeshDb::open_memory().unwrap();
        insert_task_in(db.conn(), &sample("t1")).unwrap();
        let now = Utc::now();
        let first = open_attempt_in(db.conn(), "t1", "a", now).unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(
            close_attempt_in(db.conn(), "t1", "aborted", now).unwrap(),
            Some(first.attempt_id)
        );
        let second = open_attempt_in(db.conn(), "t1", "b", now).unwrap();
        assert_eq!(second.attempt_number, 2);
        assert_eq!(db.attempts_for_task("t1").unwrap().len(), 2);
    }

    #[test]
    fn cost_sums_worker_done_events_for_the_task() {
        let db = MeshDb::open_memory().unwrap();
        db.append_event(EventKind::WorkerDone, "w", json!({"task_id": "t1", "cost_usd": 1.25}))
            .unwrap();
        db.append_event(EventKind::WorkerDone, "w", json!({"task_id": "t1", "cost_usd": 0.5}))
            .unwrap();
        db.append_event(EventKind::WorkerDone, "w", json!({"task_id": "t2", "cost_usd": 9.0}))
            .unwrap();
        db.append_event(EventKind::Msg, "w", json!({"task_id": "t1", "cost_usd": 100.0}))
            .unwrap();
        let cost = db.task_cost_from_events("t1").unwrap();
        assert!((cost - 1.75).abs() < 1e-9);
        assert_eq!(db.task_cost_from_events("none").unwrap(), 0.0);
    }
}
