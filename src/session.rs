// Manages generation state and the streaming tasks feeding it

use crate::error::SessionError;
use crate::models::{Message, MessageId};
use crate::ollama_api::{ChatRequest, InferenceClient};

use futures_util::StreamExt;
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    LoadingHistory,
    Generating,
}

/// Fields observed by the presentation layer.
#[derive(Debug, Default)]
pub struct SessionState {
    pub messages: Vec<Message>,
    /// Text received for the in-flight response but not yet committed.
    pub buffer: String,
    pub status: Status,
    pub last_error: Option<SessionError>,
}

pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Generation { message: MessageId },
    Title,
}

/// The single streaming operation a session may run at a time.
#[derive(Debug)]
pub(crate) struct ActiveTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub token: CancellationToken,
    /// Cleared once the task has exited.
    pub handle: Option<JoinHandle<()>>,
}

/// Sent by streaming tasks to the session's owning context.
#[derive(Debug)]
pub(crate) struct StreamEvent {
    pub task: TaskId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EventKind {
    Delta(String),
    /// Terminal chunk received; the buffer is the complete response.
    Committed,
    /// Stream stopped early, either cancelled or closed without a terminal chunk.
    Interrupted,
    Failed(String),
    TitleProgress(String),
    TitleFinished { completed: bool },
    TitleFailed(String),
}

/// What changed after the owner applied one event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Delta(String),
    ResponseCommitted { index: usize },
    /// The stream stopped early; `repaired` is false when nothing had arrived.
    ResponseInterrupted { index: usize, repaired: bool },
    GenerationFailed(SessionError),
    TitleChanged(String),
    TitleFinished,
    TitleFailed(SessionError),
    /// Event from a superseded or cancelled task.
    Discarded,
}

/// Consumes one chat stream, forwarding deltas until it ends or is cancelled.
pub(crate) async fn run_generation_stream<C: InferenceClient>(
    client: Arc<C>,
    request: ChatRequest,
    token: CancellationToken,
    task: TaskId,
    events: UnboundedSender<StreamEvent>,
) {
    let send = |kind: EventKind| {
        let _ = events.send(StreamEvent { task, kind });
    };

    let mut stream = tokio::select! {
        biased;
        _ = token.cancelled() => {
            send(EventKind::Interrupted);
            return;
        }
        opened = client.stream_chat(request) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                send(EventKind::Failed(e.to_string()));
                return;
            }
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("generation task {} cancelled", task);
                send(EventKind::Interrupted);
                return;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    if token.is_cancelled() {
                        send(EventKind::Interrupted);
                        return;
                    }
                    if let Some(delta) = chunk.delta {
                        send(EventKind::Delta(delta));
                    }
                    if chunk.done {
                        send(EventKind::Committed);
                        return;
                    }
                }
                Some(Err(e)) => {
                    send(EventKind::Failed(e.to_string()));
                    return;
                }
                None => {
                    debug!("generation task {} stream closed without terminal chunk", task);
                    send(EventKind::Interrupted);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::models::{ChatChunk, GenerationOptions};
    use crate::ollama_api::ChunkStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use tokio::sync::mpsc;

    struct FixedClient(Vec<Result<ChatChunk, String>>);

    #[async_trait]
    impl InferenceClient for FixedClient {
        async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream, ClientError> {
            let items: Vec<_> = self
                .0
                .iter()
                .cloned()
                .map(|r| r.map_err(ClientError::Server))
                .collect();
            Ok(stream::iter(items).boxed())
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            turns: Vec::new(),
            options: GenerationOptions::default(),
            host: None,
        }
    }

    async fn run(client: FixedClient, token: CancellationToken) -> Vec<EventKind> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_generation_stream(Arc::new(client), request(), token, 7, tx).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.task, 7);
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn forwards_deltas_then_commits() {
        let client = FixedClient(vec![
            Ok(ChatChunk::text("a")),
            Ok(ChatChunk::terminal("b")),
            Ok(ChatChunk::text("ignored")),
        ]);

        let kinds = run(client, CancellationToken::new()).await;
        assert_eq!(
            kinds,
            vec![
                EventKind::Delta("a".into()),
                EventKind::Delta("b".into()),
                EventKind::Committed
            ]
        );
    }

    #[tokio::test]
    async fn closed_stream_is_interrupted() {
        let client = FixedClient(vec![Ok(ChatChunk::text("a"))]);
        let kinds = run(client, CancellationToken::new()).await;
        assert_eq!(kinds, vec![EventKind::Delta("a".into()), EventKind::Interrupted]);
    }

    #[tokio::test]
    async fn transport_error_fails() {
        let client = FixedClient(vec![Ok(ChatChunk::text("a")), Err("boom".into())]);
        let kinds = run(client, CancellationToken::new()).await;
        assert_eq!(
            kinds,
            vec![
                EventKind::Delta("a".into()),
                EventKind::Failed("server error: boom".into())
            ]
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_consumes_nothing() {
        let client = FixedClient(vec![Ok(ChatChunk::terminal("a"))]);
        let token = CancellationToken::new();
        token.cancel();

        let kinds = run(client, token).await;
        assert_eq!(kinds, vec![EventKind::Interrupted]);
    }

    #[test]
    fn default_state_is_idle_and_empty() {
        let state = SessionState::default();
        assert_eq!(state.status, Status::Idle);
        assert!(state.messages.is_empty());
        assert!(state.buffer.is_empty());
        assert!(state.last_error.is_none());
    }
}
