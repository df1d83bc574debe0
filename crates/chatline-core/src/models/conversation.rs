use std::fmt;

use serde::{Deserialize, Serialize};

use super::message::{Message, Role};
use crate::api::types::deserialize_id;

/// Backend route segment used for a conversation that has no id yet.
pub const NEW_CHAT_SENTINEL: &str = "new";

/// Conversation identifier. Once `Assigned` it never changes for the
/// lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConversationId {
    #[default]
    Unassigned,
    Assigned(String),
}

impl ConversationId {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConversationId::Unassigned => None,
            ConversationId::Assigned(id) => Some(id),
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, ConversationId::Assigned(_))
    }

    /// Value sent as `chat_id` on the wire.
    pub fn wire_value(&self) -> &str {
        self.as_str().unwrap_or(NEW_CHAT_SENTINEL)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_value())
    }
}

/// Entry in the backend's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Message log, active system prompt and identifier of the one conversation
/// a session manages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    pub system_prompt: String,
}

impl ConversationState {
    pub fn new_chat() -> Self {
        Self::default()
    }

    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            id: ConversationId::Assigned(id.into()),
            ..Self::default()
        }
    }

    /// Bind the id if still unassigned. Returns true only on the transition.
    pub fn adopt_id(&mut self, id: &str) -> bool {
        if self.id.is_assigned() {
            return false;
        }
        self.id = ConversationId::Assigned(id.to_string());
        true
    }

    pub fn push_user(&mut self, text: &str) {
        self.messages.push(Message::user(text));
    }

    /// Append a fresh empty assistant message and return its index.
    pub fn start_assistant(&mut self) -> usize {
        self.messages.push(Message::assistant(""));
        self.messages.len() - 1
    }

    /// Append `delta` to the assistant message at `index`.
    pub fn extend_assistant(&mut self, index: usize, delta: &str) {
        if let Some(msg) = self.messages.get_mut(index)
            && msg.role == Role::Assistant
        {
            msg.content.push_str(delta);
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
