// Command-line and persisted configuration

use crate::db::SqliteStore;
use crate::error::StoreError;
use crate::ollama_api::DEFAULT_HOST;

use clap::Parser;
use std::path::PathBuf;

pub const SELECTED_MODEL_KEY: &str = "selected_model_name";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Terminal chat against a local Ollama server", long_about = None)]
pub struct Args {
    /// Ollama server URL
    #[arg(long, env = "OLLAMA_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Model to chat with; defaults to the last model used
    #[arg(short, long, env = "OLLAMA_MODEL")]
    pub model: Option<String>,

    /// SQLite database holding conversations
    #[arg(long, env = "OLLAMA_SESSION_DB")]
    pub db: Option<PathBuf>,

    /// Resume the conversation with this id
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// System prompt for new conversations
    #[arg(long)]
    pub system: Option<String>,

    /// Print the models installed on the server and exit
    #[arg(long)]
    pub list_models: bool,
}

impl Args {
    /// Database path, falling back to the platform data directory.
    pub fn db_path(&self) -> PathBuf {
        if let Some(path) = &self.db {
            return path.clone();
        }
        default_db_path()
    }
}

/// `<data dir>/ollama-session/ollama-session.db`, or the working directory
/// when the platform reports no data directory.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ollama-session")
        .join("ollama-session.db")
}

/// Picks the explicit model, else the persisted one, and remembers the choice.
pub async fn resolve_model(args: &Args, store: &SqliteStore) -> Result<Option<String>, StoreError> {
    match &args.model {
        Some(model) => {
            store.update_config_value(SELECTED_MODEL_KEY, model).await?;
            Ok(Some(model.clone()))
        }
        None => Ok(store
            .get_config_value(SELECTED_MODEL_KEY)
            .await?
            .filter(|m| !m.is_empty())),
    }
}
