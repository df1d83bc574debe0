pub mod client;
pub mod types;

pub use client::{ApiClient, ByteStream, Endpoints};
pub use types::{ConversationSnapshot, SendRequest};
