use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{ControlState, EventKind};
use crate::store::db::{MeshDb, fmt_ts, ts_col_opt};
use crate::store::events::append_in;

/// Resource name under which the orchestration lease is reported.
pub const LEASE_RESOURCE: &str = "LOCK:orchestration";

pub(crate) fn control_in(conn: &Connection) -> Result<ControlState> {
    Ok(conn.query_row(
        "SELECT lease_owner, lease_acquired_at, lease_expires_at,
                frozen, freeze_reason, merges_locked, merges_reason
         FROM control WHERE id = 1",
        [],
        |row| {
            Ok(ControlState {
                resource: LEASE_RESOURCE.to_string(),
                lease_owner: row.get(0)?,
                lease_acquired_at: ts_col_opt(row, 1)?,
                lease_expires_at: ts_col_opt(row, 2)?,
                frozen: row.get::<_, i64>(3)? != 0,
                freeze_reason: row.get(4)?,
                merges_locked: row.get::<_, i64>(5)? != 0,
                merges_reason: row.get(6)?,
            })
        },
    )?)
}

fn lease_conflict(owner: &str, control: &ControlState) -> MeshError {
    MeshError::LeaseConflict {
        owner: owner.to_string(),
        holder: control.lease_owner.clone(),
        expires_at: control.lease_expires_at.map(fmt_ts),
    }
}

/// Fail with `LeaseConflict` unless `owner` holds a valid lease at `now`.
pub(crate) fn require_lease_in(
    conn: &Connection,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<ControlState> {
    let control = control_in(conn)?;
    if control.live_owner(now) != Some(owner) {
        return Err(lease_conflict(owner, &control));
    }
    Ok(control)
}

/// Drop the lease unconditionally. Used by abort-all and the watchdog.
pub(crate) fn clear_lease_in(conn: &Connection) -> Result<Option<String>> {
    let control = control_in(conn)?;
    conn.execute(
        "UPDATE control SET lease_owner = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
         WHERE id = 1",
        [],
    )?;
    Ok(control.lease_owner)
}

/// Set the freeze or lock-merges flag. Callers hold the lease.
pub(crate) fn set_flag_in(conn: &Connection, flag: ControlFlag, on: bool, reason: &str) -> Result<()> {
    let sql = match flag {
        ControlFlag::Freeze => "UPDATE control SET frozen = ?1, freeze_reason = ?2 WHERE id = 1",
        ControlFlag::LockMerges => {
            "UPDATE control SET merges_locked = ?1, merges_reason = ?2 WHERE id = 1"
        }
    };
    let reason = if on { reason } else { "" };
    conn.execute(sql, params![on as i64, reason])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Freeze,
    LockMerges,
}

// ---------------------------------------------------------------------------
// LeaseManager
// ---------------------------------------------------------------------------

impl MeshDb {
    /// Read the control record (lease and global flags).
    pub fn control(&self) -> Result<ControlState> {
        control_in(self.conn())
    }

    pub fn lease_acquire(&self, owner: &str, ttl_secs: i64) -> Result<ControlState> {
        self.lease_acquire_at(owner, ttl_secs, Utc::now())
    }

    /// Take the lease if it is free, expired, or already ours.
    pub fn lease_acquire_at(
        &self,
        owner: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<ControlState> {
        validate(owner, ttl_secs)?;
        let tx = self.write_tx()?;
        let control = control_in(&tx)?;
        if let Some(holder) = control.live_owner(now)
            && holder != owner
        {
            return Err(lease_conflict(owner, &control));
        }

        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        tx.execute(
            "UPDATE control SET lease_owner = ?1, lease_acquired_at = ?2, lease_expires_at = ?3
             WHERE id = 1",
            params![owner, fmt_ts(now), fmt_ts(expires_at)],
        )?;
        append_in(
            &tx,
            EventKind::Claim,
            owner,
            json!({
                "resource_id": LEASE_RESOURCE,
                "owner": owner,
                "ttl_secs": ttl_secs,
                "expires_at": fmt_ts(expires_at),
                "previous_owner": control.lease_owner,
            }),
        )?;
        let updated = control_in(&tx)?;
        tx.commit()?;

        tracing::info!(owner, ttl_secs, "orchestration lease acquired");
        Ok(updated)
    }

    pub fn lease_renew(&self, owner: &str, ttl_secs: i64) -> Result<ControlState> {
        self.lease_renew_at(owner, ttl_secs, Utc::now())
    }

    /// Extend the lease. Fails if the token does not match the recorded
    /// owner, i.e. the lease was cleared or reassigned after expiring.
    pub fn lease_renew_at(
        &self,
        owner: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<ControlState> {
        validate(owner, ttl_secs)?;
        let tx = self.write_tx()?;
        let control = control_in(&tx)?;
        if control.lease_owner.as_deref() != Some(owner) {
            return Err(lease_conflict(owner, &control));
        }

        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        tx.execute(
            "UPDATE control SET lease_expires_at = ?1 WHERE id = 1",
            params![fmt_ts(expires_at)],
        )?;
        append_in(
            &tx,
            EventKind::OrchLeaseRenew,
            owner,
            json!({
                "resource_id": LEASE_RESOURCE,
                "owner": owner,
                "ttl_secs": ttl_secs,
                "expires_at": fmt_ts(expires_at),
                "was_expired": control.live_owner(now).is_none(),
            }),
        )?;
        let updated = control_in(&tx)?;
        tx.commit()?;

        tracing::debug!(owner, ttl_secs, "orchestration lease renewed");
        Ok(updated)
    }

    /// Give the lease up. Only the recorded owner may release it.
    pub fn lease_release(&self, owner: &str) -> Result<ControlState> {
        let tx = self.write_tx()?;
        let control = control_in(&tx)?;
        if control.lease_owner.as_deref() != Some(owner) {
            return Err(lease_conflict(owner, &control));
        }
        clear_lease_in(&tx)?;
        append_in(
            &tx,
            EventKind::Release,
            owner,
            json!({"resource_id": LEASE_RESOURCE, "owner": owner, "why": "released"}),
        )?;
        let updated = control_in(&tx)?;
        tx.commit()?;

        tracing::info!(owner, "orchestration lease released");
        Ok(updated)
    }

    /// Clear an expired lease, emitting `EXPIRE`. Returns the former owner.
    pub fn lease_reap_at(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let tx = self.write_tx()?;
        let expired = reap_lease_in(&tx, now)?;
        tx.commit()?;
        Ok(expired)
    }
}

/// Clear the lease if it has expired, appending `EXPIRE`. Returns the
/// owner whose lease was cleared.
pub(crate) fn reap_lease_in(conn: &Connection, now: DateTime<Utc>) -> Result<Option<String>> {
    let control = control_in(conn)?;
    let expired = match (&control.lease_owner, control.lease_expires_at) {
        (Some(owner), Some(expires)) if now > expires => Some(owner.clone()),
        _ => None,
    };
    if let Some(owner) = &expired {
        clear_lease_in(conn)?;
        append_in(
            conn,
            EventKind::Expire,
            "",
            json!({
                "resource_id": LEASE_RESOURCE,
                "owner": owner,
                "expired_at": control.lease_expires_at.map(fmt_ts),
            }),
        )?;
        tracing::warn!(owner = %owner, "expired orchestration lease cleared");
    }
    Ok(expired)
}

fn validate(owner: &str, ttl_secs: i64) -> Result<()> {
    if owner.trim().is_empty() {
        return Err(MeshError::InvalidInput("lease owner must not be empty".into()));
    }
    if ttl_secs <= 0 {
        return Err(MeshError::InvalidInput(format!(
            "ttl must be positive, got {ttl_secs}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn second_owner_conflicts_until_expiry() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        db.lease_acquire_at("X", 300, t0).unwrap();

        let err = db.lease_acquire_at("Y", 300, t0 + Duration::seconds(100));
        assert!(matches!(err, Err(MeshError::LeaseConflict { ref holder, .. }) if holder.as_deref() == Some("X")));

        let control = db
            .lease_acquire_at("Y", 300, t0 + Duration::seconds(301))
            .unwrap();
        assert_eq!(control.lease_owner.as_deref(), Some("Y"));
        assert_eq!(control.resource, LEASE_RESOURCE);
    }

    #[test]
    fn owner_can_reacquire_its_own_lease() {
        let db = MeshDb::open_memory().unwrap();
        db.lease_acquire("X", 60).unwrap();
        db.lease_acquire("X", 60).unwrap();
        assert_eq!(db.control().unwrap().lease_owner.as_deref(), Some("X"));
    }

    #[test]
    fn renew_fails_after_reassignment() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        db.lease_acquire_at("X", 10, t0).unwrap();

        // Expired but untouched: the owner may still renew.
        db.lease_renew_at("X", 10, t0 + Duration::seconds(20)).unwrap();

        let t1 = t0 + Duration::seconds(60);
        db.lease_acquire_at("Y", 10, t1).unwrap();
        assert!(matches!(
            db.lease_renew_at("X", 10, t1),
            Err(MeshError::LeaseConflict { .. })
        ));
        assert_eq!(
            db.tail_events(10, Some(EventKind::OrchLeaseRenew)).unwrap().len(),
            1
        );
    }

    #[test]
    fn release_requires_owner() {
        let db = MeshDb::open_memory().unwrap();
        db.lease_acquire("X", 60).unwrap();
        assert!(db.lease_release("Y").is_err());
        let control = db.lease_release("X").unwrap();
        assert!(control.lease_owner.is_none());
        db.lease_acquire("Y", 60).unwrap();
    }

    #[test]
    fn require_lease_checks_owner_and_expiry() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        assert!(require_lease_in(db.conn(), "X", t0).is_err());
        db.lease_acquire_at("X", 30, t0).unwrap();
        assert!(require_lease_in(db.conn(), "X", t0).is_ok());
        assert!(require_lease_in(db.conn(), "Y", t0).is_err());
        assert!(require_lease_in(db.conn(), "X", t0 + Duration::seconds(31)).is_err());
    }

    #[test]
    fn reap_clears_only_expired_leases() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        db.lease_acquire_at("X", 30, t0).unwrap();
        assert_eq!(db.lease_reap_at(t0).unwrap(), None);
        assert_eq!(
            db.lease_reap_at(t0 + Duration::seconds(31)).unwrap().as_deref(),
            Some("X")
        );
        assert!(db.control().unwrap().lease_owner.is_none());
        assert_eq!(db.tail_events(5, Some(EventKind::Expire)).unwrap().len(), 1);
    }
}
