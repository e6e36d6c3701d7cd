//! Session manager: turns prompts into streamed responses for one conversation.
//!
//! The manager exclusively owns [`SessionState`]. Streaming tasks run on the
//! runtime and only send [`StreamEvent`]s back; the owner applies them through
//! [`SessionManager::next_event`], [`SessionManager::pump`] or
//! [`SessionManager::run_until_idle`]. At most one streaming task (generation
//! or title) occupies the session at a time; starting another retires it.

use crate::db::ConversationStore;
use crate::error::SessionError;
use crate::models::{build_chat_turns, Conversation, Message, MessageId, DEFAULT_CONVERSATION_NAME};
use crate::ollama_api::{ChatRequest, InferenceClient};
use crate::repair::repair_truncated;
use crate::session::{
    run_generation_stream, ActiveTask, EventKind, SessionState, SessionUpdate, Status, StreamEvent,
    TaskId, TaskKind,
};
use crate::title::{run_title_stream, title_turns};

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

enum Wake {
    Event(Option<StreamEvent>),
    Exited(Result<(), JoinError>),
    Lost,
}

pub struct SessionManager<S, C> {
    store: S,
    client: Arc<C>,
    conversation: Option<Conversation>,
    state: SessionState,
    active: Option<ActiveTask>,
    next_task: TaskId,
    events_tx: UnboundedSender<StreamEvent>,
    events_rx: UnboundedReceiver<StreamEvent>,
}

impl<S: ConversationStore, C: InferenceClient> SessionManager<S, C> {
    pub fn new(store: S, client: Arc<C>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            client,
            conversation: None,
            state: SessionState::default(),
            active: None,
            next_task: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.state.messages
    }

    pub fn buffer(&self) -> &str {
        &self.state.buffer
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.state.last_error.as_ref()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// True while a generation or title stream occupies the session.
    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn index_of(&self, id: &MessageId) -> Option<usize> {
        self.state.messages.iter().position(|m| &m.id == id)
    }

    /// Makes `conversation` active and loads its messages.
    pub async fn load(&mut self, conversation: Conversation) -> Result<(), SessionError> {
        self.retire_active().await;

        info!("loading conversation {}", conversation.id);
        self.state.messages.clear();
        self.state.buffer.clear();
        self.state.status = Status::LoadingHistory;

        let result = self.store.fetch_messages(&conversation.id).await;
        self.conversation = Some(conversation);
        self.state.status = Status::Idle;

        match result {
            Ok(messages) => {
                self.state.messages = messages;
                self.state.last_error = None;
                Ok(())
            }
            Err(e) => {
                let err = SessionError::HistoryLoad(e.to_string());
                error!("{}", err);
                self.state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Appends a message for `prompt` and starts streaming its response.
    pub async fn generate(&mut self, prompt: impl Into<String>) -> Result<(), SessionError> {
        let conversation_id = self.require_model()?.id.clone();
        self.retire_active().await;

        let message = Message::new_after(conversation_id, prompt, self.state.messages.last());
        self.store.insert_message(&message).await?;
        self.state.messages.push(message);

        self.start_generation(self.state.messages.len() - 1)
    }

    /// Clears the last response and streams a new one for the same prompt.
    pub async fn regenerate(&mut self) -> Result<(), SessionError> {
        self.require_model()?;
        self.retire_active().await;

        let last = self
            .state
            .messages
            .last_mut()
            .ok_or(SessionError::EmptyHistory)?;
        last.response = None;
        self.store.update_message(last).await?;

        self.start_generation(self.state.messages.len() - 1)
    }

    /// Removes `index..` from history and returns the prompt at `index` for re-editing.
    pub async fn generate_at(&mut self, index: usize) -> Result<String, SessionError> {
        self.require_conversation()?;
        self.check_index(index)?;
        self.retire_active().await;

        let prompt = self.state.messages[index].prompt.clone();
        self.truncate_from(index).await;
        Ok(prompt)
    }

    /// Removes everything after `index` and regenerates the response at `index`.
    pub async fn regenerate_at(&mut self, index: usize) -> Result<(), SessionError> {
        self.require_model()?;
        self.check_index(index)?;
        self.retire_active().await;

        self.truncate_from(index + 1).await;
        self.regenerate().await
    }

    pub async fn generate_at_id(&mut self, id: &MessageId) -> Result<String, SessionError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| SessionError::UnknownMessage(id.to_string()))?;
        self.generate_at(index).await
    }

    pub async fn regenerate_at_id(&mut self, id: &MessageId) -> Result<(), SessionError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| SessionError::UnknownMessage(id.to_string()))?;
        self.regenerate_at(index).await
    }

    /// Requests cancellation of the active stream without waiting for it.
    pub fn cancel(&mut self) {
        if let Some(active) = &self.active {
            debug!("cancel requested for task {}", active.id);
            active.token.cancel();
        }
    }

    /// Waits for the next stream event and applies it.
    ///
    /// A task that exits without reporting how its stream ended is treated
    /// as failed, so the session never stays occupied by a dead task.
    pub async fn next_event(&mut self) -> Option<SessionUpdate> {
        loop {
            let wake = match self.active.as_mut() {
                Some(ActiveTask { handle: Some(handle), .. }) => tokio::select! {
                    biased;
                    event = self.events_rx.recv() => Wake::Event(event),
                    joined = handle => Wake::Exited(joined),
                },
                Some(_) => match self.events_rx.try_recv() {
                    Ok(event) => Wake::Event(Some(event)),
                    Err(_) => Wake::Lost,
                },
                None => Wake::Event(self.events_rx.recv().await),
            };

            match wake {
                Wake::Event(event) => return Some(self.apply(event?).await),
                Wake::Exited(joined) => {
                    if let Some(active) = self.active.as_mut() {
                        if let Err(e) = joined {
                            error!("stream task {} ended abnormally: {}", active.id, e);
                        }
                        active.handle = None;
                    }
                }
                Wake::Lost => return Some(self.abandon_active().await),
            }
        }
    }

    /// Applies every event already queued, without waiting.
    pub async fn pump(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            updates.push(self.apply(event).await);
        }
        updates
    }

    /// Applies events until no stream occupies the session.
    pub async fn run_until_idle(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while self.active.is_some() {
            match self.next_event().await {
                Some(update) => updates.push(update),
                None => break,
            }
        }
        updates
    }

    fn require_conversation(&self) -> Result<&Conversation, SessionError> {
        self.conversation
            .as_ref()
            .ok_or(SessionError::NoActiveConversation)
    }

    fn require_model(&self) -> Result<&Conversation, SessionError> {
        let conversation = self.require_conversation()?;
        if conversation.model.trim().is_empty() {
            return Err(SessionError::ModelNotSelected);
        }
        Ok(conversation)
    }

    fn check_index(&self, index: usize) -> Result<(), SessionError> {
        let len = self.state.messages.len();
        if index >= len {
            return Err(SessionError::IndexOutOfRange { index, len });
        }
        Ok(())
    }

    fn allocate_task(&mut self, kind: TaskKind) -> (TaskId, CancellationToken) {
        self.next_task += 1;
        let token = CancellationToken::new();
        self.active = Some(ActiveTask {
            id: self.next_task,
            kind,
            token: token.clone(),
            handle: None,
        });
        (self.next_task, token)
    }

    fn start_generation(&mut self, target: usize) -> Result<(), SessionError> {
        let conversation = self.require_model()?;
        let request = ChatRequest {
            model: conversation.model.clone(),
            turns: build_chat_turns(conversation.system_prompt.as_deref(), &self.state.messages, target),
            options: conversation.options.clone(),
            host: conversation.host.clone(),
        };
        let message = self.state.messages[target].id.clone();

        let (task, token) = self.allocate_task(TaskKind::Generation { message });
        info!("starting generation task {} for message {}", task, target);

        self.state.buffer.clear();
        self.state.status = Status::Generating;
        self.state.last_error = None;

        let handle = tokio::spawn(run_generation_stream(
            Arc::clone(&self.client),
            request,
            token,
            task,
            self.events_tx.clone(),
        ));
        self.attach(handle);
        Ok(())
    }

    async fn start_title(&mut self) {
        let Some(conversation) = self.conversation.as_mut() else {
            return;
        };
        conversation.name = DEFAULT_CONVERSATION_NAME.to_string();
        let request = ChatRequest {
            model: conversation.model.clone(),
            turns: title_turns(&self.state.messages),
            options: conversation.options.clone(),
            host: conversation.host.clone(),
        };
        self.persist_conversation().await;

        let (task, token) = self.allocate_task(TaskKind::Title);
        debug!("starting title task {}", task);

        let handle = tokio::spawn(run_title_stream(
            Arc::clone(&self.client),
            request,
            token,
            task,
            self.events_tx.clone(),
        ));
        self.attach(handle);
    }

    fn attach(&mut self, handle: JoinHandle<()>) {
        if let Some(active) = self.active.as_mut() {
            active.handle = Some(handle);
        }
    }

    /// Closes out a task that exited without a final event.
    async fn abandon_active(&mut self) -> SessionUpdate {
        let Some(active) = self.active.as_ref() else {
            return SessionUpdate::Discarded;
        };
        let reason = "stream task exited without finishing".to_string();
        let kind = match active.kind {
            TaskKind::Generation { .. } => EventKind::Failed(reason),
            TaskKind::Title => EventKind::TitleFailed(reason),
        };
        let event = StreamEvent { task: active.id, kind };
        self.apply(event).await
    }

    /// Cancels the active task; a generation's unflushed text is repaired into its message now.
    async fn retire_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        debug!("retiring task {}", active.id);
        active.token.cancel();

        if let TaskKind::Generation { message } = active.kind {
            if !self.state.buffer.is_empty() {
                let partial = std::mem::take(&mut self.state.buffer);
                self.commit_response(&message, repair_truncated(&partial)).await;
            }
            self.state.status = Status::Idle;
        }
    }

    async fn truncate_from(&mut self, start: usize) {
        let removed = self.state.messages.split_off(start);
        for message in &removed {
            if let Err(e) = self.store.delete_message(&message.id).await {
                warn!("failed to delete message {}: {}", message.id, e);
            }
        }
        debug!("truncated {} messages from index {}", removed.len(), start);
    }

    /// Writes `response` into the message and stamps the conversation.
    async fn commit_response(&mut self, id: &MessageId, response: String) -> Option<usize> {
        let index = self.index_of(id)?;
        let message = &mut self.state.messages[index];
        message.response = Some(response);

        if let Err(e) = self.store.update_message(message).await {
            error!("failed to persist response for {}: {}", message.id, e);
            self.state.last_error = Some(e.into());
        }

        if let Some(conversation) = self.conversation.as_mut() {
            conversation.modified_at = Utc::now();
        }
        self.persist_conversation().await;
        Some(index)
    }

    async fn persist_conversation(&mut self) {
        let Some(conversation) = self.conversation.as_ref() else {
            return;
        };
        if let Err(e) = self.store.update_conversation(conversation).await {
            error!("failed to persist conversation {}: {}", conversation.id, e);
            self.state.last_error = Some(e.into());
        }
    }

    /// Ends a generation that stopped early: repairs buffered text, or leaves the response absent.
    async fn interrupt(&mut self, message: MessageId) -> SessionUpdate {
        self.active = None;
        self.state.status = Status::Idle;

        let Some(index) = self.index_of(&message) else {
            self.state.buffer.clear();
            return SessionUpdate::Discarded;
        };
        if self.state.buffer.is_empty() {
            return SessionUpdate::ResponseInterrupted { index, repaired: false };
        }
        let partial = std::mem::take(&mut self.state.buffer);
        match self.commit_response(&message, repair_truncated(&partial)).await {
            Some(index) => SessionUpdate::ResponseInterrupted { index, repaired: true },
            None => SessionUpdate::Discarded,
        }
    }

    async fn apply(&mut self, event: StreamEvent) -> SessionUpdate {
        let (kind, cancelled) = match &self.active {
            Some(active) if active.id == event.task => (active.kind.clone(), active.token.is_cancelled()),
            _ => return SessionUpdate::Discarded,
        };

        match (kind, event.kind) {
            (TaskKind::Generation { .. }, EventKind::Delta(_)) if cancelled => SessionUpdate::Discarded,
            (TaskKind::Generation { .. }, EventKind::Delta(text)) => {
                self.state.buffer.push_str(&text);
                SessionUpdate::Delta(text)
            }
            (TaskKind::Generation { message }, EventKind::Committed) if cancelled => {
                self.interrupt(message).await
            }
            (TaskKind::Generation { message }, EventKind::Committed) => {
                self.active = None;
                self.state.status = Status::Idle;
                let response = std::mem::take(&mut self.state.buffer);

                let Some(index) = self.commit_response(&message, response).await else {
                    return SessionUpdate::Discarded;
                };
                if self.state.messages.len() == 1 {
                    self.start_title().await;
                }
                SessionUpdate::ResponseCommitted { index }
            }
            (TaskKind::Generation { message }, EventKind::Interrupted) => {
                self.interrupt(message).await
            }
            (TaskKind::Generation { .. }, EventKind::Failed(reason)) => {
                self.active = None;
                self.state.status = Status::Idle;
                self.state.buffer.clear();

                let err = SessionError::Generation(reason);
                error!("{}", err);
                self.state.last_error = Some(err.clone());
                SessionUpdate::GenerationFailed(err)
            }
            (TaskKind::Title, EventKind::TitleProgress(title)) => {
                if let Some(conversation) = self.conversation.as_mut() {
                    conversation.name = title.clone();
                }
                self.persist_conversation().await;
                SessionUpdate::TitleChanged(title)
            }
            (TaskKind::Title, EventKind::TitleFinished { completed }) => {
                self.active = None;
                if completed {
                    if let Some(conversation) = self.conversation.as_mut() {
                        conversation.modified_at = Utc::now();
                    }
                    self.persist_conversation().await;
                }
                SessionUpdate::TitleFinished
            }
            (TaskKind::Title, EventKind::TitleFailed(reason)) => {
                self.active = None;
                let err = SessionError::TitleDerivation(reason);
                warn!("{}", err);
                self.state.last_error = Some(err.clone());
                SessionUpdate::TitleFailed(err)
            }
            (kind, other) => {
                warn!("unexpected event {:?} for task kind {:?}", other, kind);
                SessionUpdate::Discarded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::error::ClientError;
    use crate::ollama_api::ChunkStream;
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};

    /// Opens streams that never yield.
    struct Silent;

    #[async_trait]
    impl InferenceClient for Silent {
        async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream, ClientError> {
            Ok(stream::pending().boxed())
        }
    }

    async fn manager() -> SessionManager<SqliteStore, Silent> {
        let store = SqliteStore::open_in_memory().unwrap();
        let conversation = Conversation::new("llama3");
        store.create_conversation(&conversation).await.unwrap();
        let mut manager = SessionManager::new(store, Arc::new(Silent));
        manager.load(conversation).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn interruption_of_vanished_message_is_discarded() {
        let mut manager = manager().await;
        manager.generate("hi").await.unwrap();
        manager.state.messages.clear();

        manager.cancel();
        let updates = manager.run_until_idle().await;

        assert_eq!(updates, vec![SessionUpdate::Discarded]);
        assert!(!manager.is_streaming());
        assert_eq!(manager.status(), Status::Idle);
    }

    #[tokio::test]
    async fn exited_task_without_event_is_failed() {
        let mut manager = manager().await;
        manager.generate("hi").await.unwrap();
        if let Some(active) = manager.active.as_mut() {
            if let Some(handle) = active.handle.take() {
                handle.abort();
                let _ = handle.await;
            }
        }

        let update = manager.next_event().await;

        assert!(matches!(update, Some(SessionUpdate::GenerationFailed(SessionError::Generation(_)))));
        assert!(!manager.is_streaming());
    }
}
