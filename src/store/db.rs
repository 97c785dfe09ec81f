use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};

use crate::error::{MeshError, Result};
use crate::store::paths::MeshPaths;

// ---------------------------------------------------------------------------
// Helper: RFC 3339 timestamps in SQLite TEXT columns
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp so lexical order in SQL equals time order.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&row.get::<_, String>(idx)?)
}

pub(crate) fn ts_col_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s))
        .transpose()
}

/// Parse a TEXT column through `FromStr` (enum columns).
pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = MeshError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// MeshDb
// ---------------------------------------------------------------------------

/// The shared durable store. Every process coordinating on a repository
/// opens the same SQLite file; write paths run inside `BEGIN IMMEDIATE`
/// transactions so check-and-set sequences are serialized across processes.
pub struct MeshDb {
    conn: Connection,
}

impl MeshDb {
    /// Open (or create) the database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA busy_timeout=5000;\
             PRAGMA journal_mode=WAL;\
             PRAGMA foreign_keys=ON;",
        )?;
        let db = Self { conn };
        db.create_tables()?;
        tracing::debug!(path = %path.display(), "opened mesh store");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Open the store of an initialized state directory.
    pub fn from_paths(paths: &MeshPaths) -> Result<Self> {
        if !paths.state_dir.exists() {
            return Err(MeshError::NotInitialized);
        }
        fs::create_dir_all(&paths.state_dir)?;
        Self::open(&paths.db_path())
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                cwd TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                registered_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS claims (
                claim_id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                intent TEXT NOT NULL DEFAULT 'edit',
                state TEXT NOT NULL DEFAULT 'active',
                ttl_secs INTEGER NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                released_at TEXT,
                reason TEXT NOT NULL DEFAULT '',
                episode_id TEXT,
                priority INTEGER NOT NULL DEFAULT 5,
                effective_priority INTEGER NOT NULL DEFAULT 5
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active
                ON claims(resource_id) WHERE state = 'active';
            CREATE INDEX IF NOT EXISTS idx_claims_agent
                ON claims(agent_id, state);
            CREATE INDEX IF NOT EXISTS idx_claims_episode
                ON claims(episode_id);

            CREATE TABLE IF NOT EXISTS waiters (
                waiter_id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                reason TEXT NOT NULL DEFAULT '',
                episode_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (resource_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS control (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                lease_owner TEXT,
                lease_acquired_at TEXT,
                lease_expires_at TEXT,
                frozen INTEGER NOT NULL DEFAULT 0,
                freeze_reason TEXT NOT NULL DEFAULT '',
                merges_locked INTEGER NOT NULL DEFAULT 0,
                merges_reason TEXT NOT NULL DEFAULT ''
            );
            INSERT OR IGNORE INTO control (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                branch TEXT,
                max_cost_usd REAL,
                cumulative_cost_usd REAL NOT NULL DEFAULT 0,
                episode_id TEXT,
                assigned_agent TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

            CREATE TABLE IF NOT EXISTS task_deps (
                task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                depends_on TEXT NOT NULL REFERENCES tasks(task_id),
                position INTEGER NOT NULL,
                PRIMARY KEY (task_id, depends_on)
            );

            CREATE TABLE IF NOT EXISTS attempts (
                attempt_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                agent_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                outcome TEXT
            );

            CREATE TABLE IF NOT EXISTS spawns (
                spawn_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                agent_id TEXT NOT NULL,
                pid INTEGER NOT NULL,
                timeout_secs INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                outcome TEXT,
                cost_usd REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                agent_id TEXT NOT NULL DEFAULT '',
                ts TEXT NOT NULL,
                payload TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

            CREATE TABLE IF NOT EXISTS episodes (
                episode_id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                parent_episode_id TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE TABLE IF NOT EXISTS capsules (
                capsule_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                task_desc TEXT NOT NULL DEFAULT '',
                git_branch TEXT NOT NULL DEFAULT '',
                git_sha TEXT NOT NULL DEFAULT '',
                files_changed TEXT NOT NULL DEFAULT '[]',
                what_changed TEXT NOT NULL DEFAULT '',
                sbar TEXT NOT NULL DEFAULT '{}',
                episode_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_capsules_episode ON capsules(episode_id);

            CREATE TABLE IF NOT EXISTS messages (
                msg_id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                to_agent TEXT,
                channel TEXT NOT NULL DEFAULT 'general',
                severity TEXT NOT NULL DEFAULT 'FYI',
                body TEXT NOT NULL,
                episode_id TEXT,
                created_at TEXT NOT NULL,
                read_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_to_agent ON messages(to_agent, read_at);

            CREATE TABLE IF NOT EXISTS imported_events (
                episode_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                record TEXT NOT NULL,
                imported_at TEXT NOT NULL,
                PRIMARY KEY (episode_id, event_id)
            );",
        )?;
        Ok(())
    }

    /// Expose the raw connection (for tests or advanced usage).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a write transaction that takes the database write lock up front.
    pub(crate) fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tables_exist() {
        let db = MeshDb::open_memory().unwrap();
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "agents",
            "attempts",
            "capsules",
            "claims",
            "control",
            "episodes",
            "events",
            "imported_events",
            "messages",
            "spawns",
            "task_deps",
            "tasks",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn control_record_is_a_singleton() {
        let db = MeshDb::open_memory().unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM control", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(db.conn.execute("INSERT INTO control (id) VALUES (2)", []).is_err());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }

    #[test]
    fn reopening_a_file_store_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.db");
        MeshDb::open(&path).unwrap();
        let db = MeshDb::open(&path).unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM control", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
