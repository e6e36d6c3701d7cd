// Handles SQLite persistence of conversations, messages and app config

use crate::error::StoreError;
use crate::models::{Conversation, ConversationId, GenerationOptions, Message, MessageId};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durability boundary for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages of a conversation, oldest first.
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError>;
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<(), StoreError>;

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation, StoreError>;
    /// All conversations, most recently modified first.
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<(), StoreError>;
}

/// [`ConversationStore`] backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn get_config_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(get_config_value(&conn, key)?)
    }

    pub async fn update_config_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        Ok(update_config_value(&conn, key, value)?)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            model TEXT NOT NULL,
            host TEXT,
            system_prompt TEXT,
            options TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS messages_by_conversation
            ON messages (conversation_id, created_at);",
    )
}

/// Inserts or updates a configuration key-value pair.
pub fn update_config_value(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Retrieves a configuration value by key. Returns `None` if the key doesn't exist.
pub fn get_config_value(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

// Fixed-width nanosecond timestamps keep text ordering identical to time ordering.
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(column: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode {
            column,
            message: e.to_string(),
        })
}

struct RawMessage {
    id: String,
    conversation_id: String,
    prompt: String,
    response: Option<String>,
    created_at: String,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            prompt: row.get(2)?,
            response: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Message, StoreError> {
        Ok(Message {
            id: MessageId(self.id),
            conversation_id: ConversationId(self.conversation_id),
            prompt: self.prompt,
            response: self.response,
            created_at: decode_time("messages.created_at", &self.created_at)?,
        })
    }
}

struct RawConversation {
    id: String,
    name: String,
    model: String,
    host: Option<String>,
    system_prompt: Option<String>,
    options: String,
    created_at: String,
    modified_at: String,
}

impl RawConversation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            model: row.get(2)?,
            host: row.get(3)?,
            system_prompt: row.get(4)?,
            options: row.get(5)?,
            created_at: row.get(6)?,
            modified_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Conversation, StoreError> {
        let options: GenerationOptions =
            serde_json::from_str(&self.options).map_err(|e| StoreError::Decode {
                column: "conversations.options",
                message: e.to_string(),
            })?;

        Ok(Conversation {
            id: ConversationId(self.id),
            name: self.name,
            model: self.model,
            host: self.host,
            system_prompt: self.system_prompt,
            options,
            created_at: decode_time("conversations.created_at", &self.created_at)?,
            modified_at: decode_time("conversations.modified_at", &self.modified_at)?,
        })
    }
}

fn encode_options(options: &GenerationOptions) -> Result<String, StoreError> {
    serde_json::to_string(options).map_err(|e| StoreError::Decode {
        column: "conversations.options",
        message: e.to_string(),
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, name, model, host, system_prompt, options, created_at, modified_at";

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, prompt, response, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY created_at ASC, seq ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.0], RawMessage::from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.decode()?);
        }

        Ok(messages)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, prompt, response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.0,
                message.conversation_id.0,
                message.prompt,
                message.response,
                encode_time(&message.created_at),
            ],
        )?;
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE messages SET prompt = ?1, response = ?2 WHERE id = ?3",
            params![message.prompt, message.response, message.id.0],
        )?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id.0])?;
        Ok(())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let options = encode_options(&conversation.options)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, name, model, host, system_prompt, options, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conversation.id.0,
                conversation.name,
                conversation.model,
                conversation.host,
                conversation.system_prompt,
                options,
                encode_time(&conversation.created_at),
                encode_time(&conversation.modified_at),
            ],
        )?;
        Ok(())
    }

    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![conversation_id.0],
                RawConversation::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => raw.decode(),
            None => Err(StoreError::ConversationNotFound(conversation_id.0.clone())),
        }
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY modified_at DESC"
        ))?;
        let rows = stmt.query_map([], RawConversation::from_row)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?.decode()?);
        }

        Ok(conversations)
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let options = encode_options(&conversation.options)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE conversations
             SET name = ?1, model = ?2, host = ?3, system_prompt = ?4, options = ?5, modified_at = ?6
             WHERE id = ?7",
            params![
                conversation.name,
                conversation.model,
                conversation.host,
                conversation.system_prompt,
                options,
                encode_time(&conversation.modified_at),
                conversation.id.0,
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::ConversationNotFound(conversation.id.0.clone()));
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id.0],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store_with_conversation() -> (SqliteStore, Conversation) {
        let store = SqliteStore::open_in_memory().unwrap();
        let conversation = Conversation::new("llama3");
        store.create_conversation(&conversation).await.unwrap();
        (store, conversation)
    }

    mod config {
        use super::*;

        #[tokio::test]
        async fn missing_key_is_none() {
            let store = SqliteStore::open_in_memory().unwrap();
            assert_eq!(store.get_config_value("selected_model_name").await.unwrap(), None);
        }

        #[tokio::test]
        async fn update_replaces_existing_value() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.update_config_value("selected_model_name", "a").await.unwrap();
            store.update_config_value("selected_model_name", "b").await.unwrap();
            assert_eq!(
                store.get_config_value("selected_model_name").await.unwrap(),
                Some("b".to_string())
            );
        }
    }

    mod messages {
        use super::*;

        #[tokio::test]
        async fn fetch_orders_by_creation_time() {
            let (store, conversation) = store_with_conversation().await;

            let mut late = Message::new(conversation.id.clone(), "late");
            late.created_at = late.created_at + Duration::seconds(5);
            let early = Message::new(conversation.id.clone(), "early");

            store.insert_message(&late).await.unwrap();
            store.insert_message(&early).await.unwrap();

            let prompts: Vec<_> = store
                .fetch_messages(&conversation.id)
                .await
                .unwrap()
                .into_iter()
                .map(|m| m.prompt)
                .collect();
            assert_eq!(prompts, vec!["early", "late"]);
        }

        #[tokio::test]
        async fn update_and_clear_response() {
            let (store, conversation) = store_with_conversation().await;
            let mut message = Message::new(conversation.id.clone(), "hi");
            store.insert_message(&message).await.unwrap();

            message.response = Some("hello".into());
            store.update_message(&message).await.unwrap();
            let fetched = store.fetch_messages(&conversation.id).await.unwrap();
            assert_eq!(fetched[0].response.as_deref(), Some("hello"));

            message.response = None;
            store.update_message(&message).await.unwrap();
            let fetched = store.fetch_messages(&conversation.id).await.unwrap();
            assert!(fetched[0].response.is_none());
        }

        #[tokio::test]
        async fn delete_removes_only_that_message() {
            let (store, conversation) = store_with_conversation().await;
            let keep = Message::new(conversation.id.clone(), "keep");
            let drop = Message::new_after(conversation.id.clone(), "drop", Some(&keep));
            store.insert_message(&keep).await.unwrap();
            store.insert_message(&drop).await.unwrap();

            store.delete_message(&drop.id).await.unwrap();

            let fetched = store.fetch_messages(&conversation.id).await.unwrap();
            assert_eq!(fetched, vec![keep]);
        }

        #[tokio::test]
        async fn timestamps_survive_round_trip_exactly() {
            let (store, conversation) = store_with_conversation().await;
            let message = Message::new(conversation.id.clone(), "t");
            store.insert_message(&message).await.unwrap();

            let fetched = store.fetch_messages(&conversation.id).await.unwrap();
            assert_eq!(fetched[0].created_at, message.created_at);
        }
    }

    mod conversations {
        use super::*;

        #[tokio::test]
        async fn fetch_unknown_conversation_fails() {
            let store = SqliteStore::open_in_memory().unwrap();
            let err = store.fetch_conversation(&ConversationId::new()).await.unwrap_err();
            assert!(matches!(err, StoreError::ConversationNotFound(_)));
        }

        #[tokio::test]
        async fn update_persists_name_and_options() {
            let (store, mut conversation) = store_with_conversation().await;
            conversation.name = "Rust lifetimes".into();
            conversation.options.temperature = Some(0.2);
            store.update_conversation(&conversation).await.unwrap();

            let fetched = store.fetch_conversation(&conversation.id).await.unwrap();
            assert_eq!(fetched, conversation);
        }

        #[tokio::test]
        async fn list_is_most_recent_first() {
            let store = SqliteStore::open_in_memory().unwrap();
            let older = Conversation::new("m");
            let mut newer = Conversation::new("m");
            newer.modified_at = older.modified_at + Duration::seconds(1);
            store.create_conversation(&older).await.unwrap();
            store.create_conversation(&newer).await.unwrap();

            let ids: Vec<_> = store
                .fetch_conversations()
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.id)
                .collect();
            assert_eq!(ids, vec![newer.id, older.id]);
        }

        #[tokio::test]
        async fn delete_cascades_to_messages() {
            let (store, conversation) = store_with_conversation().await;
            store
                .insert_message(&Message::new(conversation.id.clone(), "x"))
                .await
                .unwrap();

            store.delete_conversation(&conversation.id).await.unwrap();

            assert!(store.fetch_messages(&conversation.id).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn open_creates_missing_directories() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("chat.db");
            let store = SqliteStore::open(&path).unwrap();
            store.create_conversation(&Conversation::new("m")).await.unwrap();
            assert!(path.exists());
        }
    }
}
