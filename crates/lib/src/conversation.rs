//! Conversation history: an ordered, bounded log of user/assistant turns.
//!
//! One `ConversationState` is created at startup and shared (behind a mutex) with the
//! query handler, which is its only writer. The window sent to the completion service is
//! the whole state, so the state itself is kept at most `2 * max_history` turns long.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default number of user/assistant pairs kept in the window.
pub const DEFAULT_MAX_HISTORY: usize = 2;

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in the conversation. Serializes as `{ "role", "content" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Chronological list of turns.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

/// Conversation shared between the gateway and the query handler.
pub type SharedConversation = Arc<Mutex<ConversationState>>;

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh, empty conversation for sharing.
    pub fn shared() -> SharedConversation {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Keep only the most recent `2 * max_pairs` turns; older turns are dropped from the front.
    pub fn truncate_to_window(&mut self, max_pairs: usize) {
        let limit = max_pairs.saturating_mul(2);
        if self.turns.len() > limit {
            let excess = self.turns.len() - limit;
            self.turns.drain(..excess);
        }
    }

    pub fn as_ordered_sequence(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
