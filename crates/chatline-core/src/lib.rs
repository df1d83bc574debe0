//! Client-side engine for one conversation with a streaming chat backend.
//!
//! [`SessionController`] owns the message log and drives sends;
//! [`AttachmentStore`] and [`SavedPromptStore`] cache the per-chat files and
//! the global system prompt library.

pub mod api;
pub mod config;
pub mod controllers;
pub mod error;
pub mod models;
pub mod services;

pub use api::ApiClient;
pub use config::EngineConfig;
pub use controllers::{
    Navigator, NoopNavigator, SendOutcome, SessionController, SessionPhase, SessionUpdate,
    StreamStatus,
};
pub use error::{EngineError, EngineResult};
pub use models::{
    Attachment, AttachmentStore, ConversationId, ConversationState, ConversationSummary, Message,
    Role, SavedPromptStore, SavedSystemPrompt, UploadFile,
};
pub use services::StreamEvent;
