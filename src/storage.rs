use crate::models::{Character, Chat, Message};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::path::Path;
use uuid::Uuid;

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Chats Table (content is the JSON-encoded message sequence)
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    character_id TEXT, -- UUID of the character, if any
    content TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chats_character_id ON chats(character_id);
CREATE INDEX IF NOT EXISTS idx_chats_timestamp ON chats(timestamp);

-- Characters Table
CREATE TABLE IF NOT EXISTS characters (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    prompt TEXT NOT NULL
);

-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Record-level primitives the conversation workflows rely on.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_chat(&self, id: Uuid) -> anyhow::Result<Option<Chat>>;
    /// Inserts or fully replaces a chat record in one atomic write.
    async fn put_chat(&self, chat: &Chat) -> anyhow::Result<()>;
    /// Rewrites an existing chat record. Returns `false` when the chat no longer exists.
    async fn update_chat(&self, chat: &Chat) -> anyhow::Result<bool>;
    async fn add_chat(&self, chat: &Chat) -> anyhow::Result<Uuid>;
    async fn delete_chat(&self, id: Uuid) -> anyhow::Result<()>;
    async fn list_chats(&self) -> anyhow::Result<Vec<Chat>>;
    async fn chats_by_character(&self, character_id: Uuid) -> anyhow::Result<Vec<Chat>>;

    async fn get_character(&self, id: Uuid) -> anyhow::Result<Option<Character>>;
    async fn put_character(&self, character: &Character) -> anyhow::Result<()>;
    async fn add_character(&self, character: &Character) -> anyhow::Result<Uuid>;
    async fn delete_character(&self, id: Uuid) -> anyhow::Result<()>;
    async fn list_characters(&self) -> anyhow::Result<Vec<Character>>;

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        // Create the database file if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(raw: &str, what: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Failed to parse {} '{}'", what, raw))
}

fn chat_from_row(row: &SqliteRow) -> anyhow::Result<Chat> {
    let id: String = row.try_get("id")?;
    let character_id: Option<String> = row.try_get("character_id")?;
    let timestamp: i64 = row.try_get("timestamp")?;
    let content: String = row.try_get("content")?;

    // Role tags are validated here: anything other than "you"/"ai" fails to decode.
    let content: Vec<Message> = serde_json::from_str(&content)
        .with_context(|| format!("Corrupted message content for chat {}", id))?;

    Ok(Chat {
        id: parse_uuid(&id, "chat ID")?,
        title: row.try_get("title")?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp)
            .context("Invalid chat timestamp")?,
        character_id: character_id
            .as_deref()
            .map(|raw| parse_uuid(raw, "character ID"))
            .transpose()?,
        content,
    })
}

fn character_from_row(row: &SqliteRow) -> anyhow::Result<Character> {
    let id: String = row.try_get("id")?;
    Ok(Character {
        id: parse_uuid(&id, "character ID")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        prompt: row.try_get("prompt")?,
    })
}

fn validate_character(character: &Character) -> anyhow::Result<()> {
    if character.name.trim().is_empty() || character.prompt.trim().is_empty() {
        anyhow::bail!("Character name and prompt are required.");
    }
    Ok(())
}

#[async_trait]
impl ChatStore for StorageManager {
    async fn get_chat(&self, id: Uuid) -> anyhow::Result<Option<Chat>> {
        log::debug!("Fetching chat with ID: {}", id);
        let row = sqlx::query(
            "SELECT id, title, timestamp, character_id, content FROM chats WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat from database")?;

        row.as_ref().map(chat_from_row).transpose()
    }

    async fn put_chat(&self, chat: &Chat) -> anyhow::Result<()> {
        log::debug!("Writing chat {} ({} messages)", chat.id, chat.content.len());
        let content =
            serde_json::to_string(&chat.content).context("Failed to encode chat content")?;

        sqlx::query(
            r#"
            INSERT INTO chats (id, title, timestamp, character_id, content)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                timestamp = excluded.timestamp,
                character_id = excluded.character_id,
                content = excluded.content
            "#,
        )
        .bind(chat.id.to_string())
        .bind(&chat.title)
        .bind(chat.timestamp.timestamp_millis())
        .bind(chat.character_id.map(|c| c.to_string()))
        .bind(content)
        .execute(&self.pool)
        .await
        .context("Failed to write chat to database")?;

        Ok(())
    }

    async fn update_chat(&self, chat: &Chat) -> anyhow::Result<bool> {
        log::debug!("Updating chat {} ({} messages)", chat.id, chat.content.len());
        let content =
            serde_json::to_string(&chat.content).context("Failed to encode chat content")?;

        let result = sqlx::query(
            "UPDATE chats SET title = ?, timestamp = ?, character_id = ?, content = ? WHERE id = ?",
        )
        .bind(&chat.title)
        .bind(chat.timestamp.timestamp_millis())
        .bind(chat.character_id.map(|c| c.to_string()))
        .bind(content)
        .bind(chat.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update chat in database")?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_chat(&self, chat: &Chat) -> anyhow::Result<Uuid> {
        log::info!("Creating chat '{}'", chat.title);
        let content =
            serde_json::to_string(&chat.content).context("Failed to encode chat content")?;

        sqlx::query(
            "INSERT INTO chats (id, title, timestamp, character_id, content) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chat.id.to_string())
        .bind(&chat.title)
        .bind(chat.timestamp.timestamp_millis())
        .bind(chat.character_id.map(|c| c.to_string()))
        .bind(content)
        .execute(&self.pool)
        .await
        .context("Failed to insert new chat into database")?;

        log::info!("Successfully created chat with ID: {}", chat.id);
        Ok(chat.id)
    }

    async fn delete_chat(&self, id: Uuid) -> anyhow::Result<()> {
        log::warn!("Deleting chat with ID: {}", id);
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete chat from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent chat: {}", id);
        }
        Ok(())
    }

    async fn list_chats(&self) -> anyhow::Result<Vec<Chat>> {
        log::debug!("Fetching all chats from database");
        let rows = sqlx::query(
            "SELECT id, title, timestamp, character_id, content FROM chats ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chats from database")?;

        let chats = rows
            .iter()
            .map(chat_from_row)
            .collect::<anyhow::Result<Vec<Chat>>>()?;
        log::info!("Fetched {} chats", chats.len());
        Ok(chats)
    }

    async fn chats_by_character(&self, character_id: Uuid) -> anyhow::Result<Vec<Chat>> {
        log::debug!("Fetching chats for character {}", character_id);
        let rows = sqlx::query(
            r#"
            SELECT id, title, timestamp, character_id, content
            FROM chats
            WHERE character_id = ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(character_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chats by character")?;

        rows.iter().map(chat_from_row).collect()
    }

    async fn get_character(&self, id: Uuid) -> anyhow::Result<Option<Character>> {
        log::debug!("Fetching character with ID: {}", id);
        let row = sqlx::query("SELECT id, name, description, prompt FROM characters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch character from database")?;

        row.as_ref().map(character_from_row).transpose()
    }

    async fn put_character(&self, character: &Character) -> anyhow::Result<()> {
        validate_character(character)?;
        log::info!("Updating character: {} ({})", character.name, character.id);

        sqlx::query(
            r#"
            INSERT INTO characters (id, name, description, prompt)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                prompt = excluded.prompt
            "#,
        )
        .bind(character.id.to_string())
        .bind(&character.name)
        .bind(&character.description)
        .bind(&character.prompt)
        .execute(&self.pool)
        .await
        .context("Failed to write character to database")?;

        Ok(())
    }

    async fn add_character(&self, character: &Character) -> anyhow::Result<Uuid> {
        validate_character(character)?;
        log::info!("Adding new character: {}", character.name);

        sqlx::query("INSERT INTO characters (id, name, description, prompt) VALUES (?, ?, ?, ?)")
            .bind(character.id.to_string())
            .bind(&character.name)
            .bind(&character.description)
            .bind(&character.prompt)
            .execute(&self.pool)
            .await
            .context("Failed to insert new character into database")?;

        log::info!("Successfully added character with ID: {}", character.id);
        Ok(character.id)
    }

    async fn delete_character(&self, id: Uuid) -> anyhow::Result<()> {
        log::warn!("Deleting character with ID: {}", id);
        sqlx::query("DELETE FROM characters WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete character from database")?;
        Ok(())
    }

    async fn list_characters(&self) -> anyhow::Result<Vec<Character>> {
        log::debug!("Fetching all characters from database");
        let rows =
            sqlx::query("SELECT id, name, description, prompt FROM characters ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch characters from database")?;

        rows.iter().map(character_from_row).collect()
    }

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read setting '{}'", key))?;

        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        log::debug!("Saving setting '{}'", key);
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save setting '{}'", key))?;
        Ok(())
    }
}
