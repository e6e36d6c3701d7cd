// Conversation and message types, plus the chat turns sent to the server

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_NAME: &str = "New Chat";

/// Opaque identifier of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

/// Opaque identifier of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sampling options forwarded to the server with every chat request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.top_p.is_none() && self.top_k.is_none()
    }
}

/// A conversation; the session manager only ever touches `name` and `modified_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub model: String,
    /// Server URL for this conversation; the client default is used when absent.
    pub host: Option<String>,
    pub system_prompt: Option<String>,
    pub options: GenerationOptions,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            name: DEFAULT_CONVERSATION_NAME.to_string(),
            model: model.into(),
            host: None,
            system_prompt: None,
            options: GenerationOptions::default(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// One prompt/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub prompt: String,
    /// `None` while awaiting a response or after being reopened for regeneration.
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: ConversationId, prompt: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            prompt: prompt.into(),
            response: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a message whose timestamp sorts strictly after `previous`.
    pub fn new_after(
        conversation_id: ConversationId,
        prompt: impl Into<String>,
        previous: Option<&Message>,
    ) -> Self {
        let mut message = Self::new(conversation_id, prompt);
        if let Some(previous) = previous {
            if message.created_at <= previous.created_at {
                message.created_at = previous.created_at + Duration::nanoseconds(1);
            }
        }
        message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn of a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One increment of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatChunk {
    pub delta: Option<String>,
    pub done: bool,
}

impl ChatChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self { delta: Some(delta.into()), done: false }
    }

    pub fn terminal(delta: impl Into<String>) -> Self {
        Self { delta: Some(delta.into()), done: true }
    }
}

/// Builds the turns for generating `history[target]`.
///
/// Every earlier message contributes its prompt and, when committed, its
/// response. The target's own stale response is never replayed.
pub fn build_chat_turns(
    system_prompt: Option<&str>,
    history: &[Message],
    target: usize,
) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(target * 2 + 2);

    if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
        turns.push(ChatTurn::system(system));
    }

    for message in &history[..target] {
        turns.push(ChatTurn::user(message.prompt.clone()));
        if let Some(response) = &message.response {
            turns.push(ChatTurn::assistant(response.clone()));
        }
    }

    if let Some(message) = history.get(target) {
        turns.push(ChatTurn::user(message.prompt.clone()));
    }

    turns
}
