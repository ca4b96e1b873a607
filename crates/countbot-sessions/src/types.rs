use serde::{Deserialize, Serialize};

/// Valid message roles, in storage form.
pub const VALID_ROLES: [&str; 4] = ["user", "assistant", "system", "tool"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUID v4 string.
    pub id: String,
    /// Display name, `{channel}:{chat_id}` for channel sessions.
    pub name: String,
    /// Optional rolling summary, at most 200 characters.
    pub summary: Option<String>,
    /// Highest message id already folded into the memory file. Messages with
    /// id at or below this have been summarized; newer ones have not.
    pub last_summarized_msg_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically increasing row id.
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

impl Message {
    /// Plain role/content JSON object for the LLM context.
    pub fn to_context_value(&self) -> serde_json::Value {
        serde_json::json!({ "role": self.role, "content": self.content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_value_is_plain_role_content() {
        let msg = Message {
            id: 1,
            session_id: "s".into(),
            role: "user".into(),
            content: "hi".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let v = msg.to_context_value();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hi");
        assert!(v.get("id").is_none());
    }
}
