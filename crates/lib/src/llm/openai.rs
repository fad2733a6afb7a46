//! OpenAI-compatible chat completions client (https://api.openai.com/v1 by default).
//!
//! Streaming uses server-sent events: each `data:` line carries a JSON chunk with a
//! `delta.content` piece and, on the last chunk, a `finish_reason`. `[DONE]` closes the stream.

use crate::conversation::Turn;
use crate::llm::{CompletionBackend, CompletionRequest, Fragment, FragmentStream, LlmError};
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// GET /models: ids of the models the endpoint offers.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/models", self.base_url);
        let res = self.authorized(self.client.get(&url)).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        let data: ModelsResponse = res.json().await?;
        Ok(data
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.id)
            .collect())
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    /// POST /chat/completions with stream: true.
    async fn stream_chat(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };
        log::debug!(
            "openai: streaming {} messages to {} (model {})",
            request.messages.len(),
            url,
            request.model
        );
        let res = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        Ok(sse_fragments(res.bytes_stream()))
    }
}

/// Decode an SSE response body into fragments. Ends after `[DONE]`, the first error, or EOF.
fn sse_fragments<S, B>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let decoder = SseDecoder {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.pending.pop_front() {
                return Some((item, decoder));
            }
            if decoder.done {
                return None;
            }
            match decoder.body.next().await {
                Some(Ok(chunk)) => decoder.push_bytes(chunk.as_ref()),
                Some(Err(e)) => {
                    decoder.done = true;
                    return Some((Err(LlmError::Request(e)), decoder));
                }
                None => decoder.finish(),
            }
        }
    }))
}

struct SseDecoder<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<Fragment, LlmError>>,
    done: bool,
}

impl<S> SseDecoder<S> {
    fn push_bytes(&mut self, bytes: &[u8]) {
        // Bytes before this point were already searched; one byte back catches a split separator.
        let mut scan_from = self.buffer.len().saturating_sub(1);
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        while let Some(offset) = self.buffer[scan_from..]
            .windows(2)
            .position(|w| w == b"\n\n")
        {
            let pos = scan_from + offset;
            let event_bytes: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..2);
            scan_from = 0;
            self.handle_event(&String::from_utf8_lossy(&event_bytes));
            if self.done {
                self.buffer.clear();
                return;
            }
        }
    }

    /// Body ended: decode whatever is left without a trailing blank line.
    fn finish(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        if !rest.trim().is_empty() {
            self.handle_event(&rest);
        }
        self.done = true;
    }

    fn handle_event(&mut self, event: &str) {
        for line in event.lines() {
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                self.done = true;
                return;
            }
            match decode_chunk(data) {
                Ok(Some(fragment)) => self.pending.push_back(Ok(fragment)),
                Ok(None) => {}
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

/// Parse one `data:` payload. `Ok(None)` for chunks that carry neither text nor a finish reason.
fn decode_chunk(data: &str) -> Result<Option<Fragment>, LlmError> {
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LlmError::Decode(format!("{}: {}", e, data)))?;
    if let Some(err) = chunk.error {
        return Err(LlmError::Api(err.message.unwrap_or_else(|| data.to_string())));
    }
    let Some(choice) = chunk.choices.and_then(|c| c.into_iter().next()) else {
        return Ok(None);
    };
    let text = choice
        .delta
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty());
    let finished = choice.finish_reason.is_some();
    if text.is_none() && !finished {
        return Ok(None);
    }
    Ok(Some(Fragment { text, finished }))
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Option<Vec<ModelObject>>,
}

#[derive(Debug, Deserialize)]
struct ModelObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: Option<String>,
}
