pub mod attachment_store;
pub mod conversation;
pub mod message;
pub mod saved_prompt_store;

pub use attachment_store::{Attachment, AttachmentStore, UploadFile};
pub use conversation::{ConversationId, ConversationState, ConversationSummary};
pub use message::{Message, MessageKind, Role};
pub use saved_prompt_store::{SavedPromptStore, SavedSystemPrompt};
