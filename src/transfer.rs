//! Chat import/export as standalone JSON documents.

use crate::error::{ChatError, ChatResult};
use crate::models::{Chat, Message};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Exported shape of a chat. The id is deliberately left out: imports always get a fresh one.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChatExport<'a> {
    title: &'a str,
    content: &'a [Message],
    character_id: Option<Uuid>,
    timestamp: i64,
}

pub fn export_chat(chat: &Chat) -> anyhow::Result<String> {
    let export = ChatExport {
        title: &chat.title,
        content: &chat.content,
        character_id: chat.character_id,
        timestamp: chat.timestamp.timestamp_millis(),
    };
    serde_json::to_string_pretty(&export).context("Failed to serialize chat for export")
}

/// Parses an exported chat into a new, not yet persisted, record.
pub fn parse_import(raw: &str) -> ChatResult<Chat> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ChatError::InvalidImportFormat(format!("not valid JSON: {}", e)))?;

    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ChatError::InvalidImportFormat("missing title".to_string()))?;

    let content = value
        .get("content")
        .filter(|c| c.is_array())
        .ok_or_else(|| ChatError::InvalidImportFormat("content must be an array".to_string()))?;
    let content: Vec<Message> = serde_json::from_value(content.clone())
        .map_err(|e| ChatError::InvalidImportFormat(format!("bad message entry: {}", e)))?;

    // Ids from other installs may not be UUIDs; such links are dropped.
    let character_id = match value.get("characterId") {
        Some(Value::String(raw)) => match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                log::warn!("Dropping unrecognized characterId '{}' on import", raw);
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(other) => {
            log::warn!("Dropping unrecognized characterId {} on import", other);
            None
        }
    };

    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Chat {
        id: Uuid::new_v4(),
        title: title.to_string(),
        timestamp,
        character_id,
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_chat_imports_as_new_record() {
        let mut chat = Chat::new("Aria", Some(Uuid::new_v4()));
        chat.content = vec![Message::user("Hello"), Message::ai("Ahoy")];

        let json = export_chat(&chat).unwrap();
        assert!(!json.contains(&chat.id.to_string()));

        let imported = parse_import(&json).unwrap();
        assert_ne!(imported.id, chat.id);
        assert_eq!(imported.title, "Aria");
        assert_eq!(imported.content, chat.content);
        assert_eq!(imported.character_id, chat.character_id);
        assert_eq!(imported.timestamp.timestamp_millis(), chat.timestamp.timestamp_millis());
    }

    #[test]
    fn rejects_missing_title_or_non_array_content() {
        for raw in [
            r#"{"content": []}"#,
            r#"{"title": "", "content": []}"#,
            r#"{"title": "x", "content": "nope"}"#,
            r#"{"title": "x"}"#,
            r#"{"title": "x", "content": [{"role": "narrator", "txt": "hi"}]}"#,
            "[1, 2",
        ] {
            assert!(
                matches!(parse_import(raw), Err(ChatError::InvalidImportFormat(_))),
                "accepted {}",
                raw
            );
        }
    }

    #[test]
    fn foreign_character_id_and_missing_timestamp_are_tolerated() {
        let chat = parse_import(r#"{"title": "Old", "content": [], "characterId": 7}"#).unwrap();
        assert_eq!(chat.character_id, None);
        assert!(chat.content.is_empty());
    }
}
