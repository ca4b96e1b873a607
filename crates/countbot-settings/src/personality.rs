//! Personality records: built-in presets plus user-defined ones.
//!
//! Builtins are seeded on startup and may be edited but never deleted.
//! Exactly one personality is active at a time.

use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SettingsError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub id: String,
    pub name: String,
    pub description: String,
    pub traits: Vec<String>,
    pub speaking_style: String,
    pub icon: String,
    pub is_builtin: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct PersonalityStore {
    db: Mutex<Connection>,
}

impl PersonalityStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Seed the built-in personalities, keeping any user edits. The first
    /// builtin becomes active when nothing is active yet.
    pub fn seed_builtins(&self) -> Result<()> {
        let builtins = [
            ("builtin:professional", "专业助理", "严谨高效，结论先行", "💼"),
            ("builtin:friendly", "贴心朋友", "亲切自然，像老朋友一样", "😊"),
            ("builtin:grumpy", "毒舌管家", "嘴上抱怨，活儿不落", "😤"),
            ("builtin:cute", "软萌小助", "活泼可爱，偶尔卖萌", "🐱"),
        ];

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        for (id, name, description, icon) in builtins {
            db.execute(
                "INSERT OR IGNORE INTO personalities
                 (id, name, description, traits, speaking_style, icon,
                  is_builtin, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '[]', '', ?4, 1, 0, ?5, ?5)",
                rusqlite::params![id, name, description, icon, now],
            )?;
        }

        let active_count: i64 =
            db.query_row("SELECT COUNT(*) FROM personalities WHERE is_active = 1", [], |r| {
                r.get(0)
            })?;
        if active_count == 0 {
            db.execute(
                "UPDATE personalities SET is_active = 1 WHERE id = 'builtin:professional'",
                [],
            )?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Personality>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, description, traits, speaking_style, icon,
                    is_builtin, is_active, created_at, updated_at
             FROM personalities ORDER BY is_builtin DESC, created_at",
        )?;
        let rows = stmt.query_map([], row_to_personality)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get(&self, id: &str) -> Result<Option<Personality>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, description, traits, speaking_style, icon,
                    is_builtin, is_active, created_at, updated_at
             FROM personalities WHERE id = ?1",
            rusqlite::params![id],
            row_to_personality,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create(
        &self,
        name: &str,
        description: &str,
        traits: &[String],
        speaking_style: &str,
        icon: &str,
    ) -> Result<Personality> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let traits_json = serde_json::to_string(traits)?;
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO personalities
                 (id, name, description, traits, speaking_style, icon,
                  is_builtin, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?7)",
                rusqlite::params![id, name, description, traits_json, speaking_style, icon, now],
            )?;
        }
        info!(personality = name, "personality created");
        self.get(&id)?
            .ok_or_else(|| SettingsError::NotFound(id.clone()))
    }

    /// Update mutable fields. Builtins accept edits too.
    pub fn update(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
        traits: Option<&[String]>,
        speaking_style: Option<&str>,
        icon: Option<&str>,
    ) -> Result<Personality> {
        let now = chrono::Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            if let Some(name) = name {
                db.execute(
                    "UPDATE personalities SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![name, now, id],
                )?;
            }
            if let Some(description) = description {
                db.execute(
                    "UPDATE personalities SET description = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![description, now, id],
                )?;
            }
            if let Some(traits) = traits {
                let traits_json = serde_json::to_string(traits)?;
                db.execute(
                    "UPDATE personalities SET traits = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![traits_json, now, id],
                )?;
            }
            if let Some(style) = speaking_style {
                db.execute(
                    "UPDATE personalities SET speaking_style = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![style, now, id],
                )?;
            }
            if let Some(icon) = icon {
                db.execute(
                    "UPDATE personalities SET icon = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![icon, now, id],
                )?;
            }
        }
        self.get(id)?
            .ok_or_else(|| SettingsError::NotFound(id.to_string()))
    }

    /// Delete a personality. Builtins are protected.
    pub fn delete(&self, id: &str) -> Result<()> {
        let Some(personality) = self.get(id)? else {
            return Err(SettingsError::NotFound(id.to_string()));
        };
        if personality.is_builtin {
            return Err(SettingsError::BuiltinProtected(id.to_string()));
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM personalities WHERE id = ?1",
            rusqlite::params![id],
        )?;
        info!(personality = %id, "personality deleted");
        Ok(())
    }

    /// Make `id` the single active personality.
    pub fn set_active(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let found: i64 = db.query_row(
            "SELECT COUNT(*) FROM personalities WHERE id = ?1",
            rusqlite::params![id],
            |r| r.get(0),
        )?;
        if found == 0 {
            return Err(SettingsError::NotFound(id.to_string()));
        }
        db.execute(
            "UPDATE personalities SET is_active = (id = ?1)",
            rusqlite::params![id],
        )?;
        Ok(())
    }

    pub fn active(&self) -> Result<Option<Personality>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, description, traits, speaking_style, icon,
                    is_builtin, is_active, created_at, updated_at
             FROM personalities WHERE is_active = 1 LIMIT 1",
            [],
            row_to_personality,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn row_to_personality(row: &rusqlite::Row<'_>) -> rusqlite::Result<Personality> {
    let traits_json: String = row.get(3)?;
    Ok(Personality {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        traits: serde_json::from_str(&traits_json).unwrap_or_default(),
        speaking_style: row.get(4)?,
        icon: row.get(5)?,
        is_builtin: row.get::<_, i64>(6)? != 0,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PersonalityStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        let store = PersonalityStore::new(conn);
        store.seed_builtins().unwrap();
        store
    }

    #[test]
    fn seeding_creates_builtins_with_one_active() {
        let s = store();
        let all = s.list().unwrap();
        assert!(all.len() >= 4);
        assert!(all.iter().all(|p| p.is_builtin));
        assert_eq!(all.iter().filter(|p| p.is_active).count(), 1);
    }

    #[test]
    fn seeding_twice_is_idempotent() {
        let s = store();
        s.seed_builtins().unwrap();
        let before = s.list().unwrap().len();
        s.seed_builtins().unwrap();
        assert_eq!(s.list().unwrap().len(), before);
    }

    #[test]
    fn builtin_can_be_edited_but_not_deleted() {
        let s = store();
        let updated = s
            .update("builtin:grumpy", Some("超级毒舌"), None, None, None, None)
            .unwrap();
        assert_eq!(updated.name, "超级毒舌");

        let err = s.delete("builtin:grumpy").unwrap_err();
        assert!(matches!(err, SettingsError::BuiltinProtected(_)));
    }

    #[test]
    fn custom_personality_lifecycle() {
        let s = store();
        let created = s
            .create(
                "海盗",
                "说话像海盗",
                &["豪爽".to_string()],
                "带着咸湿海风的口吻",
                "🏴‍☠️",
            )
            .unwrap();
        assert!(!created.is_builtin);
        assert_eq!(created.traits, vec!["豪爽"]);

        s.set_active(&created.id).unwrap();
        let active = s.active().unwrap().unwrap();
        assert_eq!(active.id, created.id);
        // Only one active at a time.
        let actives = s.list().unwrap().iter().filter(|p| p.is_active).count();
        assert_eq!(actives, 1);

        s.delete(&created.id).unwrap();
        assert!(s.get(&created.id).unwrap().is_none());
    }

    #[test]
    fn activating_unknown_personality_fails() {
        let s = store();
        assert!(matches!(
            s.set_active("ghost"),
            Err(SettingsError::NotFound(_))
        ));
    }
}
