// Derives a conversation title from the first exchange

use crate::models::{ChatTurn, Message};
use crate::ollama_api::{ChatRequest, InferenceClient};
use crate::repair::{THINK_CLOSE, THINK_OPEN};
use crate::session::{EventKind, StreamEvent, TaskId};

use futures_util::StreamExt;
use log::debug;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub const TITLE_INSTRUCTION: &str =
    "Just reply with a short title about this conversation. One line maximum. No markdown.";

/// Replays every exchange, then asks for a title.
pub fn title_turns(history: &[Message]) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history.len() * 2 + 1);
    for message in history {
        turns.push(ChatTurn::user(message.prompt.clone()));
        turns.push(ChatTurn::assistant(message.response.clone().unwrap_or_default()));
    }
    turns.push(ChatTurn::user(TITLE_INSTRUCTION));
    turns
}

/// Accumulates title text while dropping reasoning blocks.
///
/// A chunk carrying `<think>` opens a block and one carrying `</think>`
/// closes it; both marker chunks are dropped along with everything between.
#[derive(Debug, Default)]
pub struct ReasoningFilter {
    in_reasoning: bool,
    text: String,
}

impl ReasoningFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `chunk` contributed to the title.
    pub fn push(&mut self, chunk: &str) -> bool {
        if chunk.contains(THINK_OPEN) {
            self.in_reasoning = true;
            return false;
        }
        if chunk.contains(THINK_CLOSE) {
            self.in_reasoning = false;
            return false;
        }
        if self.in_reasoning {
            return false;
        }

        self.text.push_str(chunk);
        true
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    pub fn title(&self) -> String {
        clean_title(&self.text)
    }
}

fn whitespace_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static pattern"))
}

fn is_title_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '“' | '”' | '‘' | '’' | '«' | '»' | '…' | '–' | '—' | '。' | '！' | '？' | '：' | '、'
        )
}

/// Collapses whitespace to single spaces and trims surrounding whitespace and punctuation.
pub fn clean_title(raw: &str) -> String {
    let collapsed = whitespace_run().replace_all(raw, " ");
    collapsed
        .trim_matches(|c: char| c.is_whitespace() || is_title_punctuation(c))
        .to_string()
}

/// Streams a title, reporting the running cleaned text after each contributing chunk.
pub(crate) async fn run_title_stream<C: InferenceClient>(
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
            send(EventKind::TitleFinished { completed: false });
            return;
        }
        opened = client.stream_chat(request) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                send(EventKind::TitleFailed(e.to_string()));
                return;
            }
        }
    };

    let mut filter = ReasoningFilter::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("title task {} cancelled", task);
                send(EventKind::TitleFinished { completed: false });
                return;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    if let Some(delta) = chunk.delta.as_deref() {
                        if filter.push(delta) {
                            let title = filter.title();
                            if !title.is_empty() {
                                send(EventKind::TitleProgress(title));
                            }
                        }
                    }
                    if chunk.done {
                        send(EventKind::TitleFinished { completed: true });
                        return;
                    }
                }
                Some(Err(e)) => {
                    send(EventKind::TitleFailed(e.to_string()));
                    return;
                }
                None => {
                    send(EventKind::TitleFinished { completed: false });
                    return;
                }
            }
        }
    }
}
