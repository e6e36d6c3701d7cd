#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use ollama_session::models::ChatChunk;
use ollama_session::{
    ChatRequest, ChunkStream, ClientError, Conversation, ConversationStore, InferenceClient,
    SessionManager, SqliteStore,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use tokio::sync::mpsc;

pub type Feed = mpsc::UnboundedSender<Result<ChatChunk, ClientError>>;

/// How one `stream_chat` call answers.
pub enum Script {
    /// Yields the chunks, then ends.
    Chunks(Vec<ChatChunk>),
    /// Yields the chunks, then fails with a server error.
    FailAfter(Vec<ChatChunk>, String),
    /// Refuses to open the stream.
    Refuse(String),
    /// Chunks are pushed by the test through the returned sender; dropping it ends the stream.
    Live(mpsc::UnboundedReceiver<Result<ChatChunk, ClientError>>),
    /// The stream panics on first poll, killing the task that reads it.
    Crash(String),
}

/// In-process inference client replaying queued scripts and recording requests.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn push_chunks(&self, chunks: &[&str]) {
        let mut items: Vec<ChatChunk> = chunks.iter().map(|c| ChatChunk::text(*c)).collect();
        if let Some(last) = items.last_mut() {
            last.done = true;
        }
        self.push(Script::Chunks(items));
    }

    pub fn push_live(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Live(rx));
        tx
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ClientError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Chunks(vec![ChatChunk::terminal("")]));

        match script {
            Script::Chunks(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Script::FailAfter(chunks, reason) => Ok(stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::once(async move { Err(ClientError::Server(reason)) }))
                .boxed()),
            Script::Refuse(reason) => Err(ClientError::Server(reason)),
            Script::Live(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Script::Crash(reason) => Ok(stream::poll_fn(
                move |_| -> Poll<Option<Result<ChatChunk, ClientError>>> { panic!("{}", reason) },
            )
            .boxed()),
        }
    }
}

pub type TestManager = SessionManager<SqliteStore, ScriptedClient>;

/// Manager with a fresh in-memory store and a loaded, empty conversation.
pub async fn manager() -> (TestManager, Arc<ScriptedClient>) {
    let store = SqliteStore::open_in_memory().unwrap();
    let conversation = Conversation::new("llama3");
    store.create_conversation(&conversation).await.unwrap();

    let client = Arc::new(ScriptedClient::default());
    let mut manager = SessionManager::new(store, Arc::clone(&client));
    manager.load(conversation).await.unwrap();
    (manager, client)
}

/// Completes `prompts.len()` exchanges whose answers are "answer N".
pub async fn with_exchanges(manager: &mut TestManager, client: &ScriptedClient, prompts: &[&str]) {
    for (i, prompt) in prompts.iter().enumerate() {
        client.push_chunks(&[&format!("answer {}", i)]);
        if i == 0 {
            client.push_chunks(&["Title"]);
        }
        manager.generate(*prompt).await.unwrap();
        manager.run_until_idle().await;
    }
}

/// Applies events until the buffer holds `expected`.
pub async fn wait_for_buffer(manager: &mut TestManager, expected: &str) {
    while manager.buffer() != expected {
        manager.next_event().await.expect("event channel open");
    }
}
