use chrono::Utc;
use rusqlite::{Connection, params};
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{EventKind, Message, Severity, short_id};
use crate::store::db::{MeshDb, enum_col, fmt_ts, ts_col};
use crate::store::events::append_in;

const MESSAGE_COLUMNS: &str =
    "msg_id, from_agent, to_agent, channel, severity, body, episode_id, created_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        msg_id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        channel: row.get(3)?,
        severity: enum_col(row, 4)?,
        body: row.get(5)?,
        episode_id: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

pub(crate) fn insert_message_in(conn: &Connection, msg: &Message) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO messages (msg_id, from_agent, to_agent, channel, severity, body,
                                         episode_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &msg.msg_id,
            &msg.from_agent,
            &msg.to_agent,
            &msg.channel,
            msg.severity.to_string(),
            &msg.body,
            &msg.episode_id,
            fmt_ts(msg.created_at),
        ],
    )?;
    Ok(inserted > 0)
}

/// A message to post; `to_agent = None` broadcasts on the channel.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub from_agent: &'a str,
    pub to_agent: Option<&'a str>,
    pub channel: &'a str,
    pub severity: Severity,
    pub body: &'a str,
    pub episode_id: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

impl MeshDb {
    /// Store a message and append `MSG`.
    pub fn post_message(&self, new: &NewMessage<'_>) -> Result<Message> {
        if new.body.trim().is_empty() {
            return Err(MeshError::InvalidInput("message body must not be empty".into()));
        }
        let msg = Message {
            msg_id: short_id("msg"),
            from_agent: new.from_agent.to_string(),
            to_agent: new.to_agent.map(str::to_string),
            channel: if new.channel.trim().is_empty() {
                "general".to_string()
            } else {
                new.channel.to_string()
            },
            severity: new.severity,
            body: new.body.to_string(),
            episode_id: new.episode_id.map(str::to_string),
            created_at: Utc::now(),
        };

        let tx = self.write_tx()?;
        insert_message_in(&tx, &msg)?;
        append_in(
            &tx,
            EventKind::Msg,
            &msg.from_agent,
            json!({
                "msg_id": msg.msg_id,
                "from_agent": msg.from_agent,
                "to_agent": msg.to_agent,
                "channel": msg.channel,
                "severity": msg.severity.to_string(),
                "episode_id": msg.episode_id,
            }),
        )?;
        tx.commit()?;
        Ok(msg)
    }

    /// Unread messages addressed to `agent_id` or broadcast (no recipient),
    /// excluding the agent's own. Direct messages are marked read when
    /// `mark_read`; broadcasts stay visible to every agent.
    pub fn inbox(&self, agent_id: &str, mark_read: bool) -> Result<Vec<Message>> {
        let tx = self.write_tx()?;
        let messages: Vec<Message> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE read_at IS NULL
                   AND from_agent != ?1
                   AND (to_agent IS NULL OR to_agent = ?1)
                 ORDER BY created_at, msg_id"
            ))?;
            stmt.query_map(params![agent_id], row_to_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        if mark_read {
            let now = fmt_ts(Utc::now());
            for msg in messages.iter().filter(|m| m.to_agent.is_some()) {
                tx.execute(
                    "UPDATE messages SET read_at = ?1 WHERE msg_id = ?2",
                    params![&now, &msg.msg_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(messages)
    }

    pub fn messages_for_episode(&self, episode_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE episode_id = ?1
             ORDER BY created_at, msg_id"
        ))?;
        let rows = stmt.query_map(params![episode_id], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note<'a>(from: &'a str, to: Option<&'a str>, body: &'a str) -> NewMessage<'a> {
        NewMessage {
            from_agent: from,
            to_agent: to,
            channel: "",
            severity: Severity::Fyi,
            body,
            episode_id: Some("ep_1"),
        }
    }

    #[test]
    fn direct_messages_are_read_once() {
        let db = MeshDb::open_memory().unwrap();
        db.post_message(&note("a", Some("b"), "hello")).unwrap();
        let inbox = db.inbox("b", true).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].channel, "general");
        assert!(db.inbox("b", true).unwrap().is_empty());
        assert!(db.inbox("c", false).unwrap().is_empty());
    }

    #[test]
    fn broadcasts_reach_everyone_but_the_sender() {
        let db = MeshDb::open_memory().unwrap();
        db.post_message(&note("a", None, "freeze incoming")).unwrap();
        assert_eq!(db.inbox("b", true).unwrap().len(), 1);
        assert_eq!(db.inbox("c", true).unwrap().len(), 1);
        assert!(db.inbox("a", true).unwrap().is_empty());
    }

    #[test]
    fn posting_appends_msg_event_and_binds_episode() {
        let db = MeshDb::open_memory().unwrap();
        db.post_message(&note("a", Some("b"), "x")).unwrap();
        assert_eq!(db.tail_events(5, Some(EventKind::Msg)).unwrap().len(), 1);
        assert_eq!(db.messages_for_episode("ep_1").unwrap().len(), 1);
        assert!(db.post_message(&note("a", None, "  ")).is_err());
    }
}
