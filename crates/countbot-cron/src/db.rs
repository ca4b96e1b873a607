use rusqlite::Connection;

use crate::error::Result;

/// Initialise the cron jobs table.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cron_jobs (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            schedule         TEXT NOT NULL,
            message          TEXT NOT NULL,
            enabled          INTEGER NOT NULL DEFAULT 1,
            channel          TEXT,
            chat_id          TEXT,
            deliver_response INTEGER NOT NULL DEFAULT 0,
            last_run         TEXT,
            next_run         TEXT,
            last_status      TEXT,
            last_error       TEXT,
            last_response    TEXT,
            run_count        INTEGER NOT NULL DEFAULT 0,
            error_count      INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cron_jobs_due
            ON cron_jobs(enabled, next_run);",
    )?;
    Ok(())
}
