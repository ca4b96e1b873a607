//! Namespaced key → JSON value settings rows.

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

pub struct SettingsStore {
    db: Mutex<Connection>,
}

impl SettingsStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Fetch one setting, deserialized from its JSON value.
    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        ) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert one setting; the value is stored JSON-encoded.
    pub fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, raw, now],
        )?;
        debug!(key, "setting stored");
        Ok(())
    }

    /// All settings as a key → value map.
    pub fn all(&self) -> Result<HashMap<String, serde_json::Value>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows.filter_map(|r| r.ok()) {
            if let Ok(value) = serde_json::from_str(&row.1) {
                map.insert(row.0, value);
            }
        }
        Ok(map)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM settings WHERE key = ?1", rusqlite::params![key])?;
        Ok(n > 0)
    }
}
