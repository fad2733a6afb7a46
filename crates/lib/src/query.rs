//! Streaming query handler: one user question in, a live-growing answer out.
//!
//! `query` records the user turn, trims the window, starts the completion and returns an
//! [`AnswerStream`]. Each item of that stream is the whole answer so far, so a consumer can
//! overwrite its display with every value. The terminal item repeats the full answer and
//! commits it to the conversation as the assistant turn.

use crate::conversation::{ConversationState, SharedConversation, Turn, DEFAULT_MAX_HISTORY};
use crate::llm::{CompletionBackend, CompletionRequest, FragmentStream, LlmError};
use futures_util::stream::{self, Fuse};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::OwnedMutexGuard;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("completion stream ended before the answer was finished")]
    Incomplete,
}

/// Fixed generation parameters and the history window size.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// User/assistant pairs kept in the conversation.
    pub max_history: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// Drives query/answer cycles against a completion backend and the shared conversation.
pub struct StreamingQueryHandler<B> {
    backend: B,
    conversation: SharedConversation,
    settings: QuerySettings,
}

impl<B: CompletionBackend> StreamingQueryHandler<B> {
    pub fn new(backend: B, conversation: SharedConversation, settings: QuerySettings) -> Self {
        Self {
            backend,
            conversation,
            settings,
        }
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Start one cycle. The conversation stays locked until the returned stream ends or is
    /// dropped, so cycles never interleave.
    ///
    /// The user turn is recorded before the request is sent and is kept even when the
    /// request or the stream fails; in that case no assistant turn is added.
    pub async fn query(&self, question: impl Into<String>) -> Result<AnswerStream, QueryError> {
        let mut conversation = self.conversation.clone().lock_owned().await;
        conversation.append(Turn::user(question));
        conversation.truncate_to_window(self.settings.max_history);

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: conversation.as_ordered_sequence().to_vec(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        log::info!(
            "query: sending {} turns to model {}",
            request.messages.len(),
            request.model
        );
        let fragments = self.backend.stream_chat(&request).await?;
        Ok(AnswerStream::new(
            fragments,
            conversation,
            self.settings.max_history,
        ))
    }
}

/// Single-pass stream of display strings for one answer. Fused: after the terminal value
/// (or an error) it only yields `None`.
pub struct AnswerStream {
    inner: Fuse<Pin<Box<dyn Stream<Item = Result<String, QueryError>> + Send>>>,
}

impl AnswerStream {
    fn new(
        fragments: FragmentStream,
        conversation: OwnedMutexGuard<ConversationState>,
        max_history: usize,
    ) -> Self {
        let assembly = Assembly {
            fragments,
            conversation: Some(conversation),
            max_history,
            text: String::new(),
            finishing: false,
        };
        let values: Pin<Box<dyn Stream<Item = Result<String, QueryError>> + Send>> =
            Box::pin(stream::unfold(assembly, |mut assembly| async move {
                let item = assembly.next_value().await?;
                Some((item, assembly))
            }));
        Self {
            inner: values.fuse(),
        }
    }
}

impl Stream for AnswerStream {
    type Item = Result<String, QueryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Accumulator state behind `AnswerStream`. Holding `conversation` means the cycle is open.
struct Assembly {
    fragments: FragmentStream,
    conversation: Option<OwnedMutexGuard<ConversationState>>,
    max_history: usize,
    text: String,
    finishing: bool,
}

impl Assembly {
    async fn next_value(&mut self) -> Option<Result<String, QueryError>> {
        self.conversation.as_ref()?;
        if self.finishing {
            self.commit();
            return Some(Ok(self.text.clone()));
        }
        loop {
            match self.fragments.next().await {
                Some(Ok(fragment)) => {
                    if fragment.finished {
                        self.finishing = true;
                    }
                    if let Some(delta) = fragment.text.filter(|t| !t.is_empty()) {
                        self.text.push_str(&delta);
                        return Some(Ok(self.text.clone()));
                    }
                    if self.finishing {
                        self.commit();
                        return Some(Ok(self.text.clone()));
                    }
                }
                Some(Err(e)) => {
                    self.abandon();
                    return Some(Err(e.into()));
                }
                None => {
                    self.abandon();
                    return Some(Err(QueryError::Incomplete));
                }
            }
        }
    }

    /// Append the assistant turn and release the conversation.
    fn commit(&mut self) {
        if let Some(mut conversation) = self.conversation.take() {
            conversation.append(Turn::assistant(self.text.clone()));
            conversation.truncate_to_window(self.max_history);
            log::debug!(
                "query: answer committed ({} chars, {} turns in window)",
                self.text.len(),
                conversation.len()
            );
        }
    }

    fn abandon(&mut self) {
        if self.conversation.take().is_some() {
            log::warn!("query: answer stream failed; user turn kept without a reply");
        }
    }
}
