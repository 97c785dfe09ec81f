use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::model::{Claim, EventKind, Waiter, short_id, validate_priority};
use crate::store::claims::{expire_stale_in, refresh_effective_priority_in};
use crate::store::db::{MeshDb, fmt_ts, ts_col};
use crate::store::events::append_in;

const WAITER_COLUMNS: &str = "waiter_id, resource_id, agent_id, priority, reason, episode_id, created_at";

fn row_to_waiter(row: &rusqlite::Row<'_>) -> rusqlite::Result<Waiter> {
    Ok(Waiter {
        waiter_id: row.get(0)?,
        resource_id: row.get(1)?,
        agent_id: row.get(2)?,
        priority: row.get(3)?,
        reason: row.get(4)?,
        episode_id: row.get(5)?,
        created_at: ts_col(row, 6)?,
    })
}

/// A wait to register on a held resource.
#[derive(Debug, Clone, Copy)]
pub struct NewWaiter<'a> {
    pub resource_id: &'a str,
    pub agent_id: &'a str,
    pub priority: u8,
    pub reason: &'a str,
    pub episode_id: Option<&'a str>,
}

/// A registered wait and the holder it boosted, if any.
#[derive(Debug, Clone, Serialize)]
pub struct WaitRegistration {
    pub waiter: Waiter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<Claim>,
}

/// Highest priority queued on `resource_id`, ignoring `exclude_agent`.
pub(crate) fn max_waiter_priority_in(
    conn: &Connection,
    resource_id: &str,
    exclude_agent: Option<&str>,
) -> Result<Option<u8>> {
    Ok(conn.query_row(
        "SELECT MAX(priority) FROM waiters
         WHERE resource_id = ?1 AND (?2 IS NULL OR agent_id != ?2)",
        params![resource_id, exclude_agent],
        |row| row.get(0),
    )?)
}

/// Drop every waiter queued on a resource that just became free.
pub(crate) fn clear_waiters_in(conn: &Connection, resource_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM waiters WHERE resource_id = ?1",
        params![resource_id],
    )?)
}

pub(crate) fn remove_waiter_in(conn: &Connection, resource_id: &str, agent_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM waiters WHERE resource_id = ?1 AND agent_id = ?2",
        params![resource_id, agent_id],
    )?;
    Ok(removed > 0)
}

impl MeshDb {
    pub fn register_wait(&self, new: &NewWaiter<'_>) -> Result<WaitRegistration> {
        self.register_wait_at(new, Utc::now())
    }

    /// Queue `agent_id` behind the resource's holder and raise the holder's
    /// effective priority to the highest queued priority. Registering again
    /// updates the existing entry. Appends `WAIT`.
    pub fn register_wait_at(&self, new: &NewWaiter<'_>, now: DateTime<Utc>) -> Result<WaitRegistration> {
        validate_priority(new.priority)?;
        let tx = self.write_tx()?;

        expire_stale_in(&tx, new.agent_id, Some(new.resource_id), now)?;

        tx.execute(
            "INSERT INTO waiters (waiter_id, resource_id, agent_id, priority, reason, episode_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(resource_id, agent_id) DO UPDATE SET
                 priority = excluded.priority,
                 reason = excluded.reason,
                 episode_id = excluded.episode_id",
            params![
                short_id("wait"),
                new.resource_id,
                new.agent_id,
                new.priority,
                new.reason,
                new.episode_id,
                fmt_ts(now),
            ],
        )?;
        let waiter = tx.query_row(
            &format!("SELECT {WAITER_COLUMNS} FROM waiters WHERE resource_id = ?1 AND agent_id = ?2"),
            params![new.resource_id, new.agent_id],
            row_to_waiter,
        )?;
        let holder = refresh_effective_priority_in(&tx, new.resource_id)?;

        append_in(
            &tx,
            EventKind::Wait,
            new.agent_id,
            json!({
                "state": "queued",
                "waiter_id": waiter.waiter_id,
                "resource_id": waiter.resource_id,
                "agent_id": waiter.agent_id,
                "priority": waiter.priority,
                "reason": waiter.reason,
                "episode_id": waiter.episode_id,
                "holder": holder.as_ref().map(|c| c.agent_id.clone()),
                "holder_effective_priority": holder.as_ref().map(|c| c.effective_priority),
            }),
        )?;
        tx.commit()?;

        tracing::info!(
            resource = %waiter.resource_id,
            agent = %waiter.agent_id,
            priority = waiter.priority,
            "wait registered"
        );
        Ok(WaitRegistration { waiter, holder })
    }

    /// Withdraw a wait; the holder's effective priority drops back to what
    /// the remaining waiters justify.
    pub fn cancel_wait(&self, resource_id: &str, agent_id: &str) -> Result<bool> {
        let tx = self.write_tx()?;
        let removed = remove_waiter_in(&tx, resource_id, agent_id)?;
        if removed {
            refresh_effective_priority_in(&tx, resource_id)?;
        }
        tx.commit()?;
        if removed {
            tracing::debug!(resource = %resource_id, agent = %agent_id, "wait withdrawn");
        }
        Ok(removed)
    }

    /// Waiters on one resource (or all), highest priority first, then oldest.
    pub fn list_waiters(&self, resource_id: Option<&str>) -> Result<Vec<Waiter>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {WAITER_COLUMNS} FROM waiters
             WHERE (?1 IS NULL OR resource_id = ?1)
             ORDER BY resource_id, priority DESC, created_at, waiter_id"
        ))?;
        let rows = stmt.query_map(params![resource_id], row_to_waiter)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_waiter(&self, resource_id: &str, agent_id: &str) -> Result<Option<Waiter>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {WAITER_COLUMNS} FROM waiters WHERE resource_id = ?1 AND agent_id = ?2"),
                params![resource_id, agent_id],
                row_to_waiter,
            )
            .optional()?)
    }
}
