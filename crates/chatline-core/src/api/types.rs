//! Wire shapes for the chat backend.
//!
//! Response types are validated here, at the boundary, so the rest of the
//! engine only sees typed records.

use serde::de;
use serde::{Deserialize, Serialize};

use crate::models::message::Message;

/// Deserialize an identifier that the backend may send as a JSON string or number.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct IdVisitor;

    impl<'de> de::Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a string or integer identifier")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

fn deserialize_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: de::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of `POST /claude/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRequest {
    pub chat_id: String,
    pub message: String,
    pub attachment_ids: Vec<String>,
}

/// Response of `GET /chats/{id}/messages/`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, deserialize_with = "deserialize_nullable_string")]
    pub system_prompt: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SystemPromptBody<'a> {
    pub system_prompt: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct SavedPromptBody<'a> {
    pub title: &'a str,
    pub prompt: &'a str,
}
