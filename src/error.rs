// Error types shared by the store, the inference client and the session manager

use thiserror::Error;

/// Failures raised by a [`crate::db::ConversationStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored value in column {column}: {message}")]
    Decode { column: &'static str, message: String },

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
}

/// Failures raised by an [`crate::ollama_api::InferenceClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("server error: {0}")]
    Server(String),

    #[error("malformed stream line: {0}")]
    Decode(String),
}

/// Errors surfaced to the presentation layer through `SessionState::last_error`.
///
/// Every variant carries a plain message so the value can be cloned into the
/// observable state and compared in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to load history: {0}")]
    HistoryLoad(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("title derivation failed: {0}")]
    TitleDerivation(String),

    #[error("storage failure: {0}")]
    Store(String),

    #[error("no conversation is loaded")]
    NoActiveConversation,

    #[error("conversation has no model selected")]
    ModelNotSelected,

    #[error("message index {index} is out of range for {len} messages")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("there is no message to regenerate")]
    EmptyHistory,

    #[error("unknown message id: {0}")]
    UnknownMessage(String),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Store(err.to_string())
    }
}
