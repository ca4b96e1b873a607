//! Thread-safe manager for persisted sessions and their messages.
//!
//! Wraps a single SQLite connection in a `Mutex`. Callers coordinate
//! per-session write ordering themselves (the channel handler serialises
//! turns per session); the mutex only guards connection-level access.

use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::types::{Message, Session, VALID_ROLES};

pub struct SessionManager {
    db: Mutex<Connection>,
}

impl SessionManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[instrument(skip(self))]
    pub fn create_session(&self, name: &str) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (id, name, summary, last_summarized_msg_id, created_at, updated_at)
             VALUES (?1, ?2, NULL, 0, ?3, ?3)",
            rusqlite::params![id, name, now],
        )?;
        info!(session_id = %id, name, "session created");
        Ok(Session {
            id,
            name: name.to_string(),
            summary: None,
            last_summarized_msg_id: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Create a session with a caller-chosen id (WebSocket clients mint
    /// their own). No-op when the id already exists.
    pub fn ensure_session(&self, id: &str, name: &str) -> Result<Session> {
        if let Some(existing) = self.get_session(id)? {
            return Ok(existing);
        }
        let now = chrono::Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR IGNORE INTO sessions
                 (id, name, summary, last_summarized_msg_id, created_at, updated_at)
                 VALUES (?1, ?2, NULL, 0, ?3, ?3)",
                rusqlite::params![id, name, now],
            )?;
        }
        self.get_session(id)?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, summary, last_summarized_msg_id, created_at, updated_at
             FROM sessions WHERE id = ?1",
            rusqlite::params![id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// Most recently created session with the exact name, if any. Channel
    /// sessions are looked up this way (`{channel}:{chat_id}`).
    pub fn find_by_name(&self, name: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, summary, last_summarized_msg_id, created_at, updated_at
             FROM sessions WHERE name = ?1
             ORDER BY created_at DESC LIMIT 1",
            rusqlite::params![name],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// Sessions ordered by `updated_at` descending.
    pub fn list_sessions(&self, limit: Option<usize>, offset: usize) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, summary, last_summarized_msg_id, created_at, updated_at
             FROM sessions ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(rusqlite::params![limit, offset as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Sessions whose name starts with `prefix`, newest created first.
    /// Used by the `/list` slash command to scope results to one chat.
    pub fn list_by_name_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, summary, last_summarized_msg_id, created_at, updated_at
             FROM sessions WHERE name LIKE ?1 || '%'
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![prefix, limit as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Update the session name and/or summary. The summary is clamped to
    /// 200 characters.
    pub fn update_session(
        &self,
        id: &str,
        name: Option<&str>,
        summary: Option<&str>,
    ) -> Result<Session> {
        let now = chrono::Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            if let Some(name) = name {
                db.execute(
                    "UPDATE sessions SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![name, now, id],
                )?;
            }
            if let Some(summary) = summary {
                let clamped: String = summary.chars().take(200).collect();
                db.execute(
                    "UPDATE sessions SET summary = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![clamped, now, id],
                )?;
            }
        }
        self.get_session(id)?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    /// Delete a session; its messages cascade.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
        if n == 0 {
            return Err(SessionError::NotFound { id: id.to_string() });
        }
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message and bump the session's `updated_at`.
    #[instrument(skip(self, content))]
    pub fn add_message(&self, session_id: &str, role: &str, content: &str) -> Result<Message> {
        if !VALID_ROLES.contains(&role) {
            return Err(SessionError::InvalidRole(role.to_string()));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let exists: bool = db
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if !exists {
            return Err(SessionError::NotFound {
                id: session_id.to_string(),
            });
        }

        db.execute(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id, role, content, now],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, session_id],
        )?;

        debug!(session = session_id, message_id = id, role, "message added");
        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Messages in chronological order. With a limit, the most recent
    /// `limit` messages are returned (still oldest-first).
    pub fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        match limit {
            Some(limit) => {
                let mut stmt = db.prepare(
                    "SELECT id, session_id, role, content, created_at
                     FROM messages WHERE session_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                )?;
                let mut msgs: Vec<Message> = stmt
                    .query_map(
                        rusqlite::params![session_id, limit as i64, offset as i64],
                        row_to_message,
                    )?
                    .filter_map(|r| r.ok())
                    .collect();
                msgs.reverse();
                Ok(msgs)
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT id, session_id, role, content, created_at
                     FROM messages WHERE session_id = ?1
                     ORDER BY created_at ASC, id ASC LIMIT -1 OFFSET ?2",
                )?;
                let rows =
                    stmt.query_map(rusqlite::params![session_id, offset as i64], row_to_message)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            }
        }
    }

    /// Wipe messages only; the session row survives.
    pub fn clear_messages(&self, session_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, session_id],
        )?;
        info!(session = session_id, "messages cleared");
        Ok(())
    }

    pub fn message_count(&self, session_id: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let count = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Timestamp of the newest user-role message across all sessions.
    /// Drives the heartbeat idle check.
    pub fn last_user_message_at(&self) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let result: Option<String> = db.query_row(
            "SELECT MAX(created_at) FROM messages WHERE role = 'user'",
            [],
            |row| row.get(0),
        )?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Overflow summarization plumbing (the algorithm lives in summarize.rs)
    // -----------------------------------------------------------------------

    /// Messages with `id > after_id`, oldest first, at most `limit`.
    pub(crate) fn messages_after(
        &self,
        session_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, role, content, created_at
             FROM messages WHERE session_id = ?1 AND id > ?2
             ORDER BY created_at ASC, id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_id, after_id, limit as i64],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub(crate) fn set_last_summarized(&self, session_id: &str, msg_id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET last_summarized_msg_id = ?1 WHERE id = ?2",
            rusqlite::params![msg_id, session_id],
        )?;
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        summary: row.get(2)?,
        last_summarized_msg_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        SessionManager::new(conn)
    }

    #[test]
    fn create_then_get_round_trip() {
        let m = manager();
        let created = m.create_session("telegram:7").unwrap();
        let fetched = m.get_session(&created.id).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.name, "telegram:7");
        assert_eq!(fetched.last_summarized_msg_id, 0);
    }

    #[test]
    fn add_message_bumps_count_and_updated_at() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        let before = m.get_session(&s.id).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let msg = m.add_message(&s.id, "user", "hello").unwrap();
        assert_eq!(m.message_count(&s.id).unwrap(), 1);
        let after = m.get_session(&s.id).unwrap().unwrap();
        assert!(after.updated_at >= before.updated_at);
        assert!(after.updated_at >= msg.created_at || after.updated_at == msg.created_at);
    }

    #[test]
    fn invalid_role_is_rejected() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        let err = m.add_message(&s.id, "robot", "beep").unwrap_err();
        assert!(matches!(err, SessionError::InvalidRole(_)));
        assert!(m.add_message(&s.id, "tool", "result").is_ok());
    }

    #[test]
    fn add_message_to_missing_session_fails() {
        let m = manager();
        let err = m.add_message("ghost", "user", "hi").unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[test]
    fn get_messages_limit_returns_recent_in_chronological_order() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        for i in 0..5 {
            m.add_message(&s.id, "user", &format!("m{i}")).unwrap();
        }
        let msgs = m.get_messages(&s.id, Some(2), 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "m3");
        assert_eq!(msgs[1].content, "m4");
    }

    #[test]
    fn get_messages_without_limit_returns_all_in_order() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        for i in 0..3 {
            m.add_message(&s.id, "user", &format!("m{i}")).unwrap();
        }
        let msgs = m.get_messages(&s.id, None, 0).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "m0");
        assert_eq!(msgs[2].content, "m2");
    }

    #[test]
    fn last_message_content_matches_added() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        m.add_message(&s.id, "user", "first").unwrap();
        let added = m.add_message(&s.id, "assistant", "second").unwrap();
        let msgs = m.get_messages(&s.id, Some(1), 0).unwrap();
        assert_eq!(msgs.last().unwrap().content, added.content);
    }

    #[test]
    fn clear_messages_keeps_the_session() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        m.add_message(&s.id, "user", "hi").unwrap();
        m.clear_messages(&s.id).unwrap();
        assert_eq!(m.message_count(&s.id).unwrap(), 0);
        assert!(m.get_session(&s.id).unwrap().is_some());
    }

    #[test]
    fn delete_session_cascades_to_messages() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        m.add_message(&s.id, "user", "hi").unwrap();
        m.delete_session(&s.id).unwrap();
        assert!(m.get_session(&s.id).unwrap().is_none());
        assert_eq!(m.message_count(&s.id).unwrap(), 0);
    }

    #[test]
    fn find_by_name_returns_latest_created() {
        let m = manager();
        m.create_session("telegram:7").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = m.create_session("telegram:7").unwrap();
        let found = m.find_by_name("telegram:7").unwrap().unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[test]
    fn list_by_prefix_scopes_to_chat() {
        let m = manager();
        m.create_session("telegram:7").unwrap();
        m.create_session("telegram:7:20260101").unwrap();
        m.create_session("discord:9").unwrap();
        let sessions = m.list_by_name_prefix("telegram:7", 10).unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn summary_is_clamped_to_200_chars() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        let long = "总".repeat(300);
        let updated = m.update_session(&s.id, None, Some(&long)).unwrap();
        assert_eq!(updated.summary.unwrap().chars().count(), 200);
    }

    #[test]
    fn last_user_message_at_ignores_assistant_rows() {
        let m = manager();
        let s = m.create_session("s").unwrap();
        assert!(m.last_user_message_at().unwrap().is_none());
        m.add_message(&s.id, "assistant", "greeting").unwrap();
        assert!(m.last_user_message_at().unwrap().is_none());
        m.add_message(&s.id, "user", "hi").unwrap();
        assert!(m.last_user_message_at().unwrap().is_some());
    }
}
