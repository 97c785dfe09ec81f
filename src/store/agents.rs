use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{Agent, AgentStatus, EventKind};
use crate::store::claims::release_all_in;
use crate::store::db::{MeshDb, enum_col, fmt_ts, ts_col};
use crate::store::events::append_in;

const AGENT_COLUMNS: &str = "agent_id, cwd, status, registered_at, last_heartbeat";

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        agent_id: row.get(0)?,
        cwd: row.get(1)?,
        status: enum_col(row, 2)?,
        registered_at: ts_col(row, 3)?,
        last_heartbeat: ts_col(row, 4)?,
    })
}

fn agent_in(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    Ok(conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
            params![agent_id],
            row_to_agent,
        )
        .optional()?)
}

/// Mark an agent gone and release its claims. Emits `DEREGISTER` after the
/// per-claim `RELEASE` events.
pub(crate) fn deregister_in(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
    why: &str,
) -> Result<usize> {
    let released = release_all_in(conn, agent_id, now, why)?;
    conn.execute(
        "UPDATE agents SET status = 'gone' WHERE agent_id = ?1",
        params![agent_id],
    )?;
    append_in(
        conn,
        EventKind::Deregister,
        agent_id,
        json!({"agent_id": agent_id, "why": why, "released_claims": released.len()}),
    )?;
    Ok(released.len())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

impl MeshDb {
    /// Register (or re-register) an agent. Emits `REGISTER`.
    pub fn register_agent(&self, agent_id: &str, cwd: &str) -> Result<Agent> {
        if agent_id.trim().is_empty() {
            return Err(MeshError::InvalidInput("agent id must not be empty".into()));
        }
        let now = fmt_ts(Utc::now());
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO agents (agent_id, cwd, status, registered_at, last_heartbeat)
             VALUES (?1, ?2, 'idle', ?3, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET
                cwd = excluded.cwd,
                status = 'idle',
                last_heartbeat = excluded.last_heartbeat",
            params![agent_id, cwd, &now],
        )?;
        append_in(
            &tx,
            EventKind::Register,
            agent_id,
            json!({"agent_id": agent_id, "cwd": cwd}),
        )?;
        let agent = agent_in(&tx, agent_id)?.ok_or_else(|| MeshError::AgentNotFound(agent_id.into()))?;
        tx.commit()?;

        tracing::info!(agent = agent_id, "agent registered");
        Ok(agent)
    }

    /// Refresh an agent's heartbeat and status, registering it on first
    /// sight. Emits `HEARTBEAT`.
    pub fn heartbeat(&self, agent_id: &str, status: AgentStatus, cwd: &str) -> Result<Agent> {
        self.heartbeat_at(agent_id, status, cwd, Utc::now())
    }

    pub fn heartbeat_at(
        &self,
        agent_id: &str,
        status: AgentStatus,
        cwd: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        if agent_id.trim().is_empty() {
            return Err(MeshError::InvalidInput("agent id must not be empty".into()));
        }
        if status == AgentStatus::Gone {
            return Err(MeshError::InvalidInput(
                "heartbeat status must be idle or busy".into(),
            ));
        }
        let now = fmt_ts(now);
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO agents (agent_id, cwd, status, registered_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat",
            params![agent_id, cwd, status.to_string(), &now],
        )?;
        append_in(
            &tx,
            EventKind::Heartbeat,
            agent_id,
            json!({"agent_id": agent_id, "status": status.to_string()}),
        )?;
        let agent = agent_in(&tx, agent_id)?.ok_or_else(|| MeshError::AgentNotFound(agent_id.into()))?;
        tx.commit()?;
        Ok(agent)
    }

    /// Soft-delete an agent: status `gone`, claims released.
    pub fn deregister_agent(&self, agent_id: &str) -> Result<usize> {
        let tx = self.write_tx()?;
        if agent_in(&tx, agent_id)?.is_none() {
            return Err(MeshError::AgentNotFound(agent_id.to_string()));
        }
        let released = deregister_in(&tx, agent_id, Utc::now(), "deregistered")?;
        tx.commit()?;

        tracing::info!(agent = agent_id, released, "agent deregistered");
        Ok(released)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        agent_in(self.conn(), agent_id)?.ok_or_else(|| MeshError::AgentNotFound(agent_id.to_string()))
    }

    pub fn list_agents(&self, include_gone: bool) -> Result<Vec<Agent>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE (?1 OR status != 'gone')
             ORDER BY agent_id"
        ))?;
        let rows = stmt.query_map(params![include_gone], row_to_agent)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Agents not yet gone whose last heartbeat is older than `cutoff`.
    pub fn stale_agents(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE status != 'gone' AND last_heartbeat < ?1
             ORDER BY agent_id"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(cutoff)], row_to_agent)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
