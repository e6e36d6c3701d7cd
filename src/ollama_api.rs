// Handles communication with the inference server (Ollama)

use crate::error::ClientError;
use crate::models::{ChatChunk, ChatTurn, GenerationOptions};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_HOST: &str = "http://localhost:11434";

/// Lazy sequence of chunks; ends after the terminal chunk or the first error.
pub type ChunkStream = BoxStream<'static, Result<ChatChunk, ClientError>>;

/// Parameters of one streaming chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub options: GenerationOptions,
    /// Overrides the client's default server URL.
    pub host: Option<String>,
}

#[async_trait]
pub trait InferenceClient: Send + Sync + 'static {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ClientError>;
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a GenerationOptions>,
}

#[derive(Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// Splits a byte stream into newline-delimited JSON chat lines.
///
/// Network chunks do not respect line boundaries, so partial lines are
/// buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every chunk completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<ChatChunk, ClientError>> {
        self.pending.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(item) = decode_line(&line) {
                out.push(item);
            }
        }
        out
    }

    /// Decodes whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Option<Result<ChatChunk, ClientError>> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<ChatChunk, ClientError>> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return None;
    }

    let parsed = match serde_json::from_str::<ChatResponseLine>(line) {
        Ok(parsed) => parsed,
        Err(e) => return Some(Err(ClientError::Decode(format!("{e}: {line}")))),
    };

    if let Some(error) = parsed.error {
        return Some(Err(ClientError::Server(error)));
    }

    Some(Ok(ChatChunk {
        delta: parsed.message.map(|m| m.content).filter(|c| !c.is_empty()),
        done: parsed.done,
    }))
}

/// [`InferenceClient`] for an Ollama server's `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        let url = base_url.unwrap_or_else(|| DEFAULT_HOST.to_string());
        Self {
            http: Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, host: Option<&str>, path: &str) -> String {
        let base = host.map(|h| h.trim_end_matches('/')).unwrap_or(&self.base_url);
        format!("{base}{path}")
    }

    /// Names of the models installed on the server.
    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let response = self.http.get(self.endpoint(None, "/api/tags")).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status()));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ClientError> {
        let url = self.endpoint(request.host.as_deref(), "/api/chat");
        let body = ChatRequestBody {
            model: &request.model,
            messages: &request.turns,
            stream: true,
            options: Some(&request.options).filter(|o| !o.is_empty()),
        };

        debug!("POST {} ({} turns, model {})", url, request.turns.len(), request.model);
        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(ClientError::Status(response.status()));
        }

        let state = DecodeState {
            body: response
                .bytes_stream()
                .map(|bytes| bytes.map(|b| b.to_vec()))
                .boxed(),
            decoder: NdjsonDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        };

        Ok(stream::unfold(state, next_chunk).boxed())
    }
}

struct DecodeState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: NdjsonDecoder,
    ready: VecDeque<Result<ChatChunk, ClientError>>,
    finished: bool,
}

async fn next_chunk(
    mut state: DecodeState,
) -> Option<(Result<ChatChunk, ClientError>, DecodeState)> {
    loop {
        if let Some(item) = state.ready.pop_front() {
            // Nothing after a terminal chunk or an error is yielded.
            let stop = matches!(&item, Ok(chunk) if chunk.done) || item.is_err();
            if stop {
                state.ready.clear();
                state.finished = true;
            }
            return Some((item, state));
        }

        if state.finished {
            return None;
        }

        match state.body.next().await {
            Some(Ok(bytes)) => state.ready.extend(state.decoder.push(&bytes)),
            Some(Err(e)) => {
                warn!("chat stream read failed: {}", e);
                state.ready.push_back(Err(ClientError::Http(e)));
            }
            None => {
                state.finished = true;
                if let Some(item) = state.decoder.finish() {
                    state.ready.push_back(item);
                }
            }
        }
    }
}
