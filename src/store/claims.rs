use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{
    Claim, ClaimIntent, ClaimState, DEFAULT_PRIORITY, EventKind, short_id, validate_priority,
};
use crate::store::db::{MeshDb, enum_col, fmt_ts, ts_col, ts_col_opt};
use crate::store::events::append_in;
use crate::store::waiters::{NewWaiter, clear_waiters_in, max_waiter_priority_in, remove_waiter_in};

/// Parameters of an acquire or steal.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub resource_id: String,
    pub agent_id: String,
    pub ttl_secs: i64,
    pub reason: String,
    pub intent: ClaimIntent,
    pub episode_id: Option<String>,
    pub priority: u8,
}

impl ClaimRequest {
    pub fn new(resource_id: impl Into<String>, agent_id: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            resource_id: resource_id.into(),
            agent_id: agent_id.into(),
            ttl_secs,
            reason: String::new(),
            intent: ClaimIntent::Edit,
            episode_id: None,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn intent(mut self, intent: ClaimIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn episode(mut self, episode_id: Option<String>) -> Self {
        self.episode_id = episode_id;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of a successful wait on a resource.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WaitOutcome {
    pub resource_id: String,
    pub waited_ms: u64,
    /// Whether the caller had to queue behind a holder.
    pub queued: bool,
}

const CLAIM_COLUMNS: &str = "claim_id, resource_id, agent_id, intent, state, ttl_secs, \
                             acquired_at, expires_at, released_at, reason, episode_id, \
                             priority, effective_priority";

fn row_to_claim(row: &rusqlite::Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        claim_id: row.get(0)?,
        resource_id: row.get(1)?,
        agent_id: row.get(2)?,
        intent: enum_col(row, 3)?,
        state: enum_col(row, 4)?,
        ttl_secs: row.get(5)?,
        acquired_at: ts_col(row, 6)?,
        expires_at: ts_col(row, 7)?,
        released_at: ts_col_opt(row, 8)?,
        reason: row.get(9)?,
        episode_id: row.get(10)?,
        priority: row.get(11)?,
        effective_priority: row.get(12)?,
    })
}

fn claim_payload(claim: &Claim) -> serde_json::Value {
    json!({
        "claim_id": claim.claim_id,
        "resource_id": claim.resource_id,
        "agent_id": claim.agent_id,
        "intent": claim.intent.to_string(),
        "ttl_secs": claim.ttl_secs,
        "expires_at": fmt_ts(claim.expires_at),
        "reason": claim.reason,
        "episode_id": claim.episode_id,
        "priority": claim.priority,
        "effective_priority": claim.effective_priority,
    })
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers (shared with agents and the watchdog)
// ---------------------------------------------------------------------------

/// The row currently holding `resource_id`, live or not.
fn active_row_in(conn: &Connection, resource_id: &str) -> Result<Option<Claim>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE resource_id = ?1 AND state = 'active'"),
            params![resource_id],
            row_to_claim,
        )
        .optional()?)
}

fn close_claim_in(
    conn: &Connection,
    claim_id: &str,
    state: ClaimState,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE claims SET state = ?1, released_at = ?2 WHERE claim_id = ?3",
        params![state.to_string(), fmt_ts(now), claim_id],
    )?;
    Ok(())
}

fn insert_claim_in(conn: &Connection, req: &ClaimRequest, now: DateTime<Utc>) -> Result<Claim> {
    // The new holder no longer waits, but inherits whoever still does.
    remove_waiter_in(conn, &req.resource_id, &req.agent_id)?;
    let queued = max_waiter_priority_in(conn, &req.resource_id, None)?;
    let claim = Claim {
        claim_id: short_id("clm"),
        resource_id: req.resource_id.clone(),
        agent_id: req.agent_id.clone(),
        intent: req.intent,
        state: ClaimState::Active,
        ttl_secs: req.ttl_secs,
        acquired_at: now,
        expires_at: now + chrono::Duration::seconds(req.ttl_secs),
        released_at: None,
        reason: req.reason.clone(),
        episode_id: req.episode_id.clone(),
        priority: req.priority,
        effective_priority: queued.map_or(req.priority, |q| q.max(req.priority)),
    };
    conn.execute(
        "INSERT INTO claims (claim_id, resource_id, agent_id, intent, state, ttl_secs,
                             acquired_at, expires_at, reason, episode_id,
                             priority, effective_priority)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            &claim.claim_id,
            &claim.resource_id,
            &claim.agent_id,
            claim.intent.to_string(),
            claim.ttl_secs,
            fmt_ts(claim.acquired_at),
            fmt_ts(claim.expires_at),
            &claim.reason,
            &claim.episode_id,
            claim.priority,
            claim.effective_priority,
        ],
    )?;
    Ok(claim)
}

/// Recompute the holder's `effective_priority` as the maximum of its own
/// priority and every queued waiter's. Returns the holder, if any.
pub(crate) fn refresh_effective_priority_in(
    conn: &Connection,
    resource_id: &str,
) -> Result<Option<Claim>> {
    let Some(mut holder) = active_row_in(conn, resource_id)? else {
        return Ok(None);
    };
    let queued = max_waiter_priority_in(conn, resource_id, Some(&holder.agent_id))?;
    let effective = queued.map_or(holder.priority, |q| q.max(holder.priority));
    if effective != holder.effective_priority {
        conn.execute(
            "UPDATE claims SET effective_priority = ?1 WHERE claim_id = ?2",
            params![effective, &holder.claim_id],
        )?;
        tracing::debug!(
            resource = %resource_id,
            holder = %holder.agent_id,
            from = holder.effective_priority,
            to = effective,
            "holder priority adjusted"
        );
        holder.effective_priority = effective;
    }
    Ok(Some(holder))
}

/// Mark active claims whose TTL elapsed before `now` as expired, emitting one
/// `EXPIRE` per claim. Restricted to one resource when given.
pub(crate) fn expire_stale_in(
    conn: &Connection,
    actor: &str,
    resource_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<Claim>> {
    let stale: Vec<Claim> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE state = 'active' AND expires_at < ?1 AND (?2 IS NULL OR resource_id = ?2)
             ORDER BY acquired_at"
        ))?;
        stmt.query_map(params![fmt_ts(now), resource_id], row_to_claim)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    for claim in &stale {
        close_claim_in(conn, &claim.claim_id, ClaimState::Expired, now)?;
        clear_waiters_in(conn, &claim.resource_id)?;
        append_in(
            conn,
            EventKind::Expire,
            actor,
            json!({
                "claim_id": claim.claim_id,
                "resource_id": claim.resource_id,
                "agent_id": claim.agent_id,
                "expired_at": fmt_ts(claim.expires_at),
                "episode_id": claim.episode_id,
            }),
        )?;
    }
    Ok(stale)
}

/// Release every active claim held by `agent_id`, one `RELEASE` each.
pub(crate) fn release_all_in(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
    why: &str,
) -> Result<Vec<Claim>> {
    let held: Vec<Claim> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims WHERE agent_id = ?1 AND state = 'active'
             ORDER BY acquired_at"
        ))?;
        stmt.query_map(params![agent_id], row_to_claim)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut released = Vec::with_capacity(held.len());
    for mut claim in held {
        close_claim_in(conn, &claim.claim_id, ClaimState::Released, now)?;
        clear_waiters_in(conn, &claim.resource_id)?;
        append_in(
            conn,
            EventKind::Release,
            agent_id,
            json!({
                "claim_id": claim.claim_id,
                "resource_id": claim.resource_id,
                "agent_id": agent_id,
                "why": why,
                "episode_id": claim.episode_id,
            }),
        )?;
        claim.state = ClaimState::Released;
        claim.released_at = Some(now);
        released.push(claim);
    }
    Ok(released)
}

// ---------------------------------------------------------------------------
// ClaimRegistry
// ---------------------------------------------------------------------------

impl MeshDb {
    pub fn acquire(&self, req: &ClaimRequest) -> Result<Claim> {
        self.acquire_at(req, Utc::now())
    }

    /// Acquire a claim as of `now`.
    ///
    /// Performs in order, inside one immediate transaction:
    /// 1. Expire the resource's claim if its TTL has elapsed
    /// 2. Conflict check against a live foreign holder
    /// 3. Release the caller's own previous claim (refresh)
    /// 4. Insert the new claim and append `CLAIM`
    pub fn acquire_at(&self, req: &ClaimRequest, now: DateTime<Utc>) -> Result<Claim> {
        validate_ttl(req.ttl_secs)?;
        validate_priority(req.priority)?;
        let tx = self.write_tx()?;

        expire_stale_in(&tx, &req.agent_id, Some(&req.resource_id), now)?;

        let mut refreshed = false;
        if let Some(holder) = active_row_in(&tx, &req.resource_id)? {
            if holder.agent_id != req.agent_id {
                return Err(MeshError::ClaimConflict {
                    resource: req.resource_id.clone(),
                    holder: holder.agent_id,
                    expires_at: fmt_ts(holder.expires_at),
                });
            }
            close_claim_in(&tx, &holder.claim_id, ClaimState::Released, now)?;
            refreshed = true;
        }

        let claim = insert_claim_in(&tx, req, now)?;
        let mut payload = claim_payload(&claim);
        payload["refreshed"] = json!(refreshed);
        append_in(&tx, EventKind::Claim, &req.agent_id, payload)?;
        tx.commit()?;

        tracing::info!(resource = %claim.resource_id, agent = %claim.agent_id, refreshed, "claim acquired");
        Ok(claim)
    }

    pub fn steal(&self, req: &ClaimRequest) -> Result<Claim> {
        self.steal_at(req, Utc::now())
    }

    /// Force-replace whatever holds the resource. Always succeeds and always
    /// appends exactly one `STEAL`, whether or not there was a holder.
    pub fn steal_at(&self, req: &ClaimRequest, now: DateTime<Utc>) -> Result<Claim> {
        validate_ttl(req.ttl_secs)?;
        validate_priority(req.priority)?;
        let tx = self.write_tx()?;

        let previous = active_row_in(&tx, &req.resource_id)?;
        if let Some(prev) = &previous {
            close_claim_in(&tx, &prev.claim_id, ClaimState::Expired, now)?;
        }

        let claim = insert_claim_in(&tx, req, now)?;
        let mut payload = claim_payload(&claim);
        payload["previous_holder"] = json!(previous.as_ref().map(|c| c.agent_id.clone()));
        payload["previous_claim_id"] = json!(previous.as_ref().map(|c| c.claim_id.clone()));
        append_in(&tx, EventKind::Steal, &req.agent_id, payload)?;
        tx.commit()?;

        tracing::warn!(
            resource = %claim.resource_id,
            agent = %claim.agent_id,
            previous = previous.as_ref().map(|c| c.agent_id.as_str()).unwrap_or("-"),
            "claim stolen"
        );
        Ok(claim)
    }

    pub fn release(&self, resource_id: &str, agent_id: &str) -> Result<Claim> {
        self.release_at(resource_id, agent_id, Utc::now())
    }

    /// Release the caller's live claim on a resource.
    pub fn release_at(&self, resource_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Claim> {
        let tx = self.write_tx()?;
        let held = active_row_in(&tx, resource_id)?
            .filter(|c| c.agent_id == agent_id && c.is_live_at(now));
        let Some(mut claim) = held else {
            return Err(MeshError::NotClaimHolder {
                resource: resource_id.to_string(),
                agent: agent_id.to_string(),
            });
        };

        close_claim_in(&tx, &claim.claim_id, ClaimState::Released, now)?;
        let dropped_waiters = clear_waiters_in(&tx, resource_id)?;
        append_in(
            &tx,
            EventKind::Release,
            agent_id,
            json!({
                "claim_id": claim.claim_id,
                "resource_id": resource_id,
                "agent_id": agent_id,
                "why": "released",
                "episode_id": claim.episode_id,
                "waiters_cleared": dropped_waiters,
            }),
        )?;
        tx.commit()?;

        claim.state = ClaimState::Released;
        claim.released_at = Some(now);
        tracing::info!(resource = %resource_id, agent = %agent_id, "claim released");
        Ok(claim)
    }

    /// Release every claim the agent holds.
    pub fn release_all(&self, agent_id: &str) -> Result<Vec<Claim>> {
        let tx = self.write_tx()?;
        let released = release_all_in(&tx, agent_id, Utc::now(), "released")?;
        tx.commit()?;
        Ok(released)
    }

    pub fn check(&self, resource_id: &str, exclude_agent: Option<&str>) -> Result<Vec<Claim>> {
        self.check_at(resource_id, exclude_agent, Utc::now())
    }

    /// Live claims on a resource, excluding the caller's own.
    pub fn check_at(
        &self,
        resource_id: &str,
        exclude_agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE resource_id = ?1 AND state = 'active' AND expires_at >= ?2
               AND (?3 IS NULL OR agent_id != ?3)"
        ))?;
        let rows = stmt.query_map(params![resource_id, fmt_ts(now), exclude_agent], row_to_claim)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_active(&self) -> Result<Vec<Claim>> {
        self.list_active_at(Utc::now())
    }

    pub fn list_active_at(&self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE state = 'active' AND expires_at >= ?1
             ORDER BY resource_id"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(now)], row_to_claim)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every claim row (any state) bound to an episode, oldest first.
    pub fn claims_for_episode(&self, episode_id: &str) -> Result<Vec<Claim>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims WHERE episode_id = ?1
             ORDER BY acquired_at, claim_id"
        ))?;
        let rows = stmt.query_map(params![episode_id], row_to_claim)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Physically expire every lapsed claim. Used by the watchdog.
    pub fn reap_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let tx = self.write_tx()?;
        let reaped = expire_stale_in(&tx, "", None, now)?;
        tx.commit()?;
        Ok(reaped)
    }

    /// Poll until no foreign live claim holds the resource, then append
    /// `WAIT`. While held, the caller is queued as a waiter (boosting the
    /// holder) and dequeued again on return. Returns `WaitTimeout` if the
    /// resource is still held after `timeout`.
    pub fn wait_free(
        &self,
        wait: &NewWaiter<'_>,
        timeout: Duration,
        poll: Duration,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let mut queued = false;
        loop {
            let holders = self.check(wait.resource_id, Some(wait.agent_id))?;
            if holders.is_empty() {
                if queued {
                    self.cancel_wait(wait.resource_id, wait.agent_id)?;
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                self.append_event(
                    EventKind::Wait,
                    wait.agent_id,
                    json!({
                        "state": "free",
                        "resource_id": wait.resource_id,
                        "agent_id": wait.agent_id,
                        "waited_ms": waited_ms,
                        "episode_id": wait.episode_id,
                    }),
                )?;
                return Ok(WaitOutcome {
                    resource_id: wait.resource_id.to_string(),
                    waited_ms,
                    queued,
                });
            }

            if !queued {
                self.register_wait(wait)?;
                queued = true;
            }

            if started.elapsed() >= timeout {
                self.cancel_wait(wait.resource_id, wait.agent_id)?;
                let names: Vec<String> = holders
                    .iter()
                    .map(|c| format!("{} until {}", c.agent_id, fmt_ts(c.expires_at)))
                    .collect();
                return Err(MeshError::WaitTimeout(format!(
                    "{} still held by {}",
                    wait.resource_id,
                    names.join(", ")
                )));
            }

            thread::sleep(poll);
        }
    }
}

fn validate_ttl(ttl_secs: i64) -> Result<()> {
    if ttl_secs <= 0 {
        return Err(MeshError::InvalidInput(format!(
            "ttl must be positive, got {ttl_secs}"
        )));
    }
    Ok(())
}
