use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sessions and messages tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// Foreign keys are enabled so deleting a session cascades to its messages.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS sessions (
            id                      TEXT PRIMARY KEY,
            name                    TEXT NOT NULL,
            summary                 TEXT,
            last_summarized_msg_id  INTEGER NOT NULL DEFAULT 0,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_name
            ON sessions(name, created_at DESC);
        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, created_at);",
    )?;
    Ok(())
}
