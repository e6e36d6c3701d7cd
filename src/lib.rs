//! Streaming chat session manager for a local Ollama server.
//!
//! [`manager::SessionManager`] turns prompts into incrementally streamed
//! responses, supports cancelling with graceful truncation markers, editing
//! or regenerating at any point of a linear history, and derives a
//! conversation title from the first exchange.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod models;
pub mod ollama_api;
pub mod repair;
pub mod session;
pub mod title;

pub use db::{ConversationStore, SqliteStore};
pub use error::{ClientError, SessionError, StoreError};
pub use manager::SessionManager;
pub use models::{ChatChunk, ChatTurn, Conversation, ConversationId, Message, MessageId};
pub use ollama_api::{ChatRequest, ChunkStream, InferenceClient, OllamaClient};
pub use session::{SessionState, SessionUpdate, Status};
