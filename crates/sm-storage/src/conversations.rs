//! Recorded AI conversations and their messages.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use sm_common::{Error, Result};

use crate::pool::db_err;
use crate::store::Store;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(Error::InputInvalid(format!("unknown message role '{other}'"))),
        }
    }
}

/// A recorded conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub ai_assistant: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Conversation {
    /// Start a new conversation with a fresh UUIDv4 id.
    pub fn new(project_id: impl Into<String>, ai_assistant: impl Into<String>) -> Self {
        Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            ai_assistant: ai_assistant.into(),
            timestamp: Utc::now(),
            context: None,
            summary: None,
        }
    }
}

/// One message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Store {
    /// Insert or refresh a conversation row.
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.pool().acquire()?;
        let context = conversation
            .context
            .as_ref()
            .map(|v| v.to_string());
        conn.execute(
            "INSERT INTO conversations (id, project_id, ai_assistant, timestamp, context, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 context = excluded.context, summary = excluded.summary",
            params![
                conversation.id,
                conversation.project_id,
                conversation.ai_assistant,
                conversation.timestamp.to_rfc3339(),
                context,
                conversation.summary
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Append a message; returns its id.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.pool().acquire()?;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id,
                role.as_str(),
                content,
                Utc::now().to_rfc3339(),
                metadata.map(|v| v.to_string())
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.pool().acquire()?;
        conn.query_row(
            "SELECT id, project_id, ai_assistant, timestamp, context, summary
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()
        .map_err(db_err)
    }

    /// Messages of a conversation in insertion order.
    pub fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.pool().acquire()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, timestamp, metadata
                 FROM messages WHERE conversation_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                let role_str: String = row.get(2)?;
                let ts: String = row.get(4)?;
                let metadata: Option<String> = row.get(5)?;
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: Role::parse(&role_str).unwrap_or(Role::System),
                    content: row.get(3)?,
                    timestamp: parse_ts(&ts),
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Conversations, most recent first.
    pub fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.pool().acquire()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, ai_assistant, timestamp, context, summary
                 FROM conversations ORDER BY timestamp DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_conversation)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Delete a conversation; its messages cascade.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.pool().acquire()?;
        let n = conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let ts: String = row.get(3)?;
    let context: Option<String> = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        ai_assistant: row.get(2)?,
        timestamp: parse_ts(&ts),
        context: context.and_then(|c| serde_json::from_str(&c).ok()),
        summary: row.get(5)?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_conversation_roundtrip_with_cascade() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("memory.db")).unwrap();

        let mut convo = Conversation::new("proj-1", "claude");
        convo.summary = Some("schema discussion".into());
        store.save_conversation(&convo).unwrap();

        store
            .add_message(&convo.id, Role::User, "how do triggers work?", None)
            .unwrap();
        store
            .add_message(&convo.id, Role::Assistant, "they fire on writes", None)
            .unwrap();

        let loaded = store.get_conversation(&convo.id).unwrap().unwrap();
        assert_eq!(loaded.summary.as_deref(), Some("schema discussion"));

        let messages = store.conversation_messages(&convo.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);

        assert!(store.delete_conversation(&convo.id).unwrap());
        assert!(store.conversation_messages(&convo.id).unwrap().is_empty());
    }

    #[test]
    fn test_role_parse_rejects_unknown() {
        assert!(Role::parse("user").is_ok());
        assert!(Role::parse("robot").is_err());
    }
}
