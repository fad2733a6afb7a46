//! Completion backend abstraction and the OpenAI-compatible streaming client.
//!
//! A backend turns an ordered window of turns into a stream of [`Fragment`]s: incremental
//! text pieces, the last of which carries the completion marker.

mod openai;

use crate::conversation::Turn;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;

pub use openai::OpenAiClient;

/// Stream of fragments produced by one completion request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, LlmError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion api error: {0}")]
    Api(String),
    #[error("malformed stream fragment: {0}")]
    Decode(String),
}

/// One incremental unit of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    /// New text since the previous fragment, if any.
    pub text: Option<String>,
    /// Set on the terminal fragment; nothing follows it.
    pub finished: bool,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            finished: false,
        }
    }

    pub fn finished() -> Self {
        Self {
            text: None,
            finished: true,
        }
    }
}

/// Request for one streamed completion: the window plus fixed generation parameters.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Turn>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Start a streamed completion. Errors returned here happen before any fragment arrives.
    async fn stream_chat(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError>;
}

#[async_trait]
impl<T: CompletionBackend + ?Sized> CompletionBackend for Arc<T> {
    async fn stream_chat(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        (**self).stream_chat(request).await
    }
}
