//! Domain entities for the durable-message core.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "archived" => ConversationStatus::Archived,
            "deleted" => ConversationStatus::Deleted,
            _ => ConversationStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationSource {
    Gui,
    Imported,
}

impl ConversationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationSource::Gui => "gui",
            ConversationSource::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "imported" => ConversationSource::Imported,
            _ => ConversationSource::Gui,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub source: ConversationSource,
    pub external_id: Option<String>,
    pub project_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for Conversation {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Conversation {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            title: row.try_get("title")?,
            status: ConversationStatus::parse(row.try_get::<String, _>("status")?.as_str()),
            source: ConversationSource::parse(row.try_get::<String, _>("source")?.as_str()),
            external_id: row.try_get("external_id")?,
            project_path: row.try_get("project_path")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

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

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for Message {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Message {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: Role::parse(row.try_get::<String, _>("role")?.as_str()),
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Timeout,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => SessionStatus::Processing,
            "completed" => SessionStatus::Completed,
            "error" => SessionStatus::Error,
            "timeout" => SessionStatus::Timeout,
            "cancelled" => SessionStatus::Cancelled,
            _ => SessionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Error
                | SessionStatus::Timeout
                | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub text: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub user_message_id: String,
    pub status: SessionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub response: Option<SessionResponse>,
    pub error: Option<String>,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for Session {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let response_text: Option<String> = row.try_get("response_text")?;
        let response_assistant_message_id: Option<String> =
            row.try_get("response_assistant_message_id")?;
        let response = match (response_text, response_assistant_message_id) {
            (Some(text), Some(assistant_message_id)) => Some(SessionResponse {
                text,
                assistant_message_id,
            }),
            _ => None,
        };
        Ok(Session {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            user_message_id: row.try_get("user_message_id")?,
            status: SessionStatus::parse(row.try_get::<String, _>("status")?.as_str()),
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            response,
            error: row.try_get("error")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub completed_at: Option<i64>,
    pub response: Option<SessionResponse>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub r#type: String,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub data: serde_json::Value,
    pub created_at: i64,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for Event {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let data_raw: String = row.try_get("data")?;
        let data = serde_json::from_str(&data_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "data".to_string(),
            source: Box::new(e),
        })?;
        Ok(Event {
            id: row.try_get("id")?,
            r#type: row.try_get("type")?,
            conversation_id: row.try_get("conversation_id")?,
            session_id: row.try_get("session_id")?,
            message_id: row.try_get("message_id")?,
            data,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A heterogeneous block emitted by an `Agent` while it runs. The core only
/// needs the tag for ordering/accumulation; the payload is opaque and
/// forwarded verbatim to `SyncHub` subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentBlock {
    Text { text: String },
    Code { language: Option<String>, text: String },
    Thinking { text: String },
    ToolUse { name: String, input: serde_json::Value },
    ToolResult { name: String, output: serde_json::Value },
    Image { mime_type: String, data: String },
    Bash { command: String, output: String },
    System { text: String },
}

impl AgentBlock {
    /// Text contribution to the accumulating `fullText` bag entry, if any.
    pub fn text_delta(&self) -> Option<&str> {
        match self {
            AgentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}
