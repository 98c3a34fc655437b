use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Who authored a message. Persisted as "you" / "ai".
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "you")]
    User,
    #[serde(rename = "ai")]
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "you",
            Role::Ai => "ai",
        }
    }
}

// A single message; its identity is its position in the chat content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub txt: String,
}

impl Message {
    pub fn new(role: Role, txt: impl Into<String>) -> Self {
        Self { role, txt: txt.into() }
    }

    pub fn user(txt: impl Into<String>) -> Self {
        Self::new(Role::User, txt)
    }

    pub fn ai(txt: impl Into<String>) -> Self {
        Self::new(Role::Ai, txt)
    }
}

// A persisted conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<Uuid>,
    #[serde(default)]
    pub content: Vec<Message>,
}

impl Chat {
    pub fn new(title: impl Into<String>, character_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            timestamp: Utc::now(),
            character_id,
            content: Vec::new(),
        }
    }
}

// A persona used to seed new chats
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Character {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
}

/// Fields accepted when creating or updating a character.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct CharacterDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
}

// User-configured message placed at the start of every new chat.
// Entries with an empty `message` are kept in settings but never persisted into a chat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SeedMessage {
    pub role: Role,
    #[serde(default)]
    pub message: String,
}

/// Role tags understood by the generation API.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    User,
    Model,
}

impl From<Role> for ApiRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ApiRole::User,
            Role::Ai => ApiRole::Model,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: ApiRole,
    pub text: String,
}

/// What the presentation layer needs to render one chat.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub chat_id: Uuid,
    pub title: String,
    pub window_start: usize,
    pub messages: Vec<Message>,
    pub generating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
