use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::{Value, json};

use crate::canonical::{GENESIS_HASH, sha256_tagged, to_canonical_bytes};
use crate::error::Result;
use crate::model::{Event, EventKind};
use crate::store::db::{MeshDb, enum_col, fmt_ts};

const TRACE_PAGE: i64 = 256;

/// Outcome of recomputing the hash chain over a range of sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub ok: bool,
    pub checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Hash of one event: SHA-256 over `prev_hash` followed by the canonical
/// envelope `{agent_id, kind, payload, seq, ts}`.
pub fn event_hash(
    prev_hash: &str,
    seq: i64,
    kind: EventKind,
    agent_id: &str,
    ts: &str,
    payload: &Value,
) -> Result<String> {
    let envelope = json!({
        "seq": seq,
        "kind": kind.as_str(),
        "agent_id": agent_id,
        "ts": ts,
        "payload": payload,
    });
    let mut preimage = prev_hash.as_bytes().to_vec();
    preimage.extend_from_slice(&to_canonical_bytes(&envelope)?);
    Ok(sha256_tagged(&preimage))
}

/// Append one event inside the caller's transaction.
///
/// This is the only code path that inserts into `events`. Callers hold a
/// `BEGIN IMMEDIATE` transaction, so reading the chain head and inserting
/// the successor cannot interleave with another writer.
pub(crate) fn append_in(
    conn: &Connection,
    kind: EventKind,
    agent_id: &str,
    payload: Value,
) -> Result<Event> {
    let head: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, hash FROM events ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (seq, prev_hash) = match head {
        Some((seq, hash)) => (seq + 1, hash),
        None => (1, GENESIS_HASH.to_string()),
    };
    let ts = fmt_ts(Utc::now());
    let hash = event_hash(&prev_hash, seq, kind, agent_id, &ts, &payload)?;
    let event_id = format!("evt_{seq:06}");
    let payload_text = String::from_utf8_lossy(&to_canonical_bytes(&payload)?).into_owned();

    conn.execute(
        "INSERT INTO events (seq, event_id, kind, agent_id, ts, payload, prev_hash, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![seq, &event_id, kind.as_str(), agent_id, &ts, &payload_text, &prev_hash, &hash],
    )?;
    tracing::debug!(seq, kind = kind.as_str(), "appended event");

    Ok(Event {
        seq,
        event_id,
        kind,
        agent_id: agent_id.to_string(),
        ts,
        payload,
        prev_hash,
        hash,
    })
}

const EVENT_COLUMNS: &str = "seq, event_id, kind, agent_id, ts, payload, prev_hash, hash";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_text: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        kind: enum_col(row, 2)?,
        agent_id: row.get(3)?,
        ts: row.get(4)?,
        payload,
        prev_hash: row.get(6)?,
        hash: row.get(7)?,
    })
}

/// Does any string in `payload` name `target`? Paths also match by suffix
/// so `src/lib.rs` finds `/repo/src/lib.rs`.
pub fn payload_references(payload: &Value, target: &str) -> bool {
    match payload {
        Value::String(s) => {
            s == target
                || (target.contains('/') && s.ends_with(&format!("/{}", target.trim_start_matches('/'))))
        }
        Value::Array(items) => items.iter().any(|v| payload_references(v, target)),
        Value::Object(map) => map.values().any(|v| payload_references(v, target)),
        _ => false,
    }
}

/// Lazy, restartable view over events that reference one target. Pages are
/// read from the store as the iterator advances; a new trace starts over.
pub struct EventTrace<'a> {
    db: &'a MeshDb,
    target: String,
    after_seq: i64,
    buffer: std::vec::IntoIter<Event>,
    exhausted: bool,
}

impl Iterator for EventTrace<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.next() {
                if payload_references(&event.payload, &self.target) {
                    return Some(Ok(event));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            match self.db.read_events(self.after_seq, TRACE_PAGE) {
                Ok(page) => {
                    if (page.len() as i64) < TRACE_PAGE {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after_seq = last.seq;
                    }
                    self.buffer = page.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl MeshDb {
    /// Append a standalone event in its own transaction.
    pub fn append_event(&self, kind: EventKind, agent_id: &str, payload: Value) -> Result<Event> {
        let tx = self.write_tx()?;
        let event = append_in(&tx, kind, agent_id, payload)?;
        tx.commit()?;
        Ok(event)
    }

    /// Events with `seq > after_seq`, ascending, at most `limit`.
    pub fn read_events(&self, after_seq: i64, limit: i64) -> Result<Vec<Event>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE seq > ?1 ORDER BY seq LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![after_seq, limit], row_to_event)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// The most recent events (ascending), optionally filtered by kind.
    pub fn tail_events(&self, limit: i64, kind: Option<EventKind>) -> Result<Vec<Event>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR kind = ?1)
             ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![kind.map(EventKind::as_str), limit], row_to_event)?;
        let mut events = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }

    pub fn event_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    pub fn last_event(&self) -> Result<Option<Event>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY seq DESC LIMIT 1"),
                [],
                row_to_event,
            )
            .optional()?)
    }

    /// Events whose payload carries `"episode_id": episode_id`, by sequence.
    pub fn events_for_episode(&self, episode_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE json_extract(payload, '$.episode_id') = ?1
             ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![episode_id], row_to_event)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Lazily iterate events that reference `target`.
    pub fn trace(&self, target: &str) -> EventTrace<'_> {
        EventTrace {
            db: self,
            target: target.to_string(),
            after_seq: 0,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// Recompute every hash in `[from, to]` and compare with the stored
    /// chain. Reports the first broken sequence number.
    pub fn verify_chain(&self, from: Option<i64>, to: Option<i64>) -> Result<ChainReport> {
        let from = from.unwrap_or(1).max(1);
        let to = to.unwrap_or(i64::MAX);

        let mut expected_prev = if from == 1 {
            GENESIS_HASH.to_string()
        } else {
            let prior: Option<String> = self
                .conn()
                .query_row(
                    "SELECT hash FROM events WHERE seq = ?1",
                    params![from - 1],
                    |row| row.get(0),
                )
                .optional()?;
            match prior {
                Some(hash) => hash,
                None => {
                    return Ok(broken(0, from, format!("event {} is missing", from - 1)));
                }
            }
        };

        let mut stmt = self.conn().prepare(
            "SELECT seq, event_id, kind, agent_id, ts, payload, prev_hash, hash
             FROM events WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq",
        )?;
        let mut rows = stmt.query(params![from, to])?;
        let mut checked = 0u64;
        let mut expected_seq = from;

        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let event_id: String = row.get(1)?;
            let kind_text: String = row.get(2)?;
            let agent_id: String = row.get(3)?;
            let ts: String = row.get(4)?;
            let payload_text: String = row.get(5)?;
            let prev_hash: String = row.get(6)?;
            let hash: String = row.get(7)?;

            if seq != expected_seq {
                return Ok(broken(checked, expected_seq, format!("sequence gap before {seq}")));
            }
            if event_id != format!("evt_{seq:06}") {
                return Ok(broken(checked, seq, format!("event id {event_id} does not match seq")));
            }
            if prev_hash != expected_prev {
                return Ok(broken(
                    checked,
                    seq,
                    format!("expected prev_hash {expected_prev}, got {prev_hash}"),
                ));
            }
            let Ok(kind) = kind_text.parse::<EventKind>() else {
                return Ok(broken(checked, seq, format!("unknown kind {kind_text}")));
            };
            let Ok(payload) = serde_json::from_str::<Value>(&payload_text) else {
                return Ok(broken(checked, seq, "payload is not valid JSON".to_string()));
            };
            if to_canonical_bytes(&payload)? != payload_text.as_bytes() {
                return Ok(broken(checked, seq, "payload is not in canonical form".to_string()));
            }
            let computed = event_hash(&prev_hash, seq, kind, &agent_id, &ts, &payload)?;
            if computed != hash {
                return Ok(broken(
                    checked,
                    seq,
                    format!("hash mismatch: stored={hash} computed={computed}"),
                ));
            }

            checked += 1;
            expected_seq = seq + 1;
            expected_prev = hash;
        }

        Ok(ChainReport {
            ok: true,
            checked,
            first_broken: None,
            detail: None,
        })
    }
}

fn broken(checked: u64, seq: i64, detail: String) -> ChainReport {
    tracing::warn!(seq, %detail, "event chain broken");
    ChainReport {
        ok: false,
        checked,
        first_broken: Some(seq),
        detail: Some(detail),
    }
}

// ---------------------------------------------------------------------------
// Imported weave slices
// ---------------------------------------------------------------------------

/// Keep a foreign event under a local episode id. Foreign events never join
/// the local chain; they are stored verbatim beside it.
pub(crate) fn insert_imported_in(conn: &Connection, episode_id: &str, event: &Event) -> Result<bool> {
    let record = String::from_utf8_lossy(&to_canonical_bytes(event)?).into_owned();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO imported_events (episode_id, event_id, seq, kind, record, imported_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            episode_id,
            &event.event_id,
            event.seq,
            event.kind.as_str(),
            &record,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(inserted > 0)
}

impl MeshDb {
    /// Foreign events imported under `episode_id`, in their original order.
    pub fn imported_events(&self, episode_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn().prepare(
            "SELECT record FROM imported_events WHERE episode_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![episode_id], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for record in rows {
            events.push(serde_json::from_str(&record?)?);
        }
        Ok(events)
    }
}
