use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::api::types::deserialize_id;
use crate::error::{EngineError, EngineResult};

/// File attached to a conversation on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// File contents ready to upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> EngineResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::Validation(format!("Not a file path: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngineError::Validation(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::new(name, bytes))
    }
}

#[derive(Debug, Default)]
struct AttachmentCache {
    conversation_id: Option<String>,
    items: Vec<Attachment>,
    /// Bumped by every list request and every completed mutation. A list
    /// response is applied only if no bump happened since it was issued.
    generation: u64,
    lists_in_flight: usize,
}

/// Decrements the in-flight counter however the list future exits.
struct InFlightGuard<'a>(&'a Mutex<AttachmentCache>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut cache = self.0.lock();
        cache.lists_in_flight = cache.lists_in_flight.saturating_sub(1);
    }
}

/// Cached attachment list of one conversation.
///
/// The cache is only ever replaced by the response of the most recently
/// issued list, so a list that raced with an upload or delete cannot
/// resurrect stale entries.
pub struct AttachmentStore {
    api: ApiClient,
    cache: Mutex<AttachmentCache>,
}

impl AttachmentStore {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            cache: Mutex::new(AttachmentCache::default()),
        }
    }

    /// Last known-good attachment list.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.cache.lock().items.clone()
    }

    pub fn get(&self, attachment_id: &str) -> Option<Attachment> {
        self.cache
            .lock()
            .items
            .iter()
            .find(|a| a.id == attachment_id)
            .cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.cache.lock().lists_in_flight > 0
    }

    /// Fetch the attachment list and return the resulting cache contents.
    ///
    /// If another list or a mutation was issued while this request was in
    /// flight, the response is discarded and the current cache is returned.
    pub async fn list(&self, chat_id: &str) -> EngineResult<Vec<Attachment>> {
        let generation = {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            cache.lists_in_flight += 1;
            cache.generation
        };
        let _in_flight = InFlightGuard(&self.cache);

        let result = self.api.list_attachments(chat_id).await;

        let mut cache = self.cache.lock();
        match result {
            Ok(items) => {
                if generation < cache.generation {
                    debug!(
                        chat_id = %chat_id,
                        generation,
                        current = cache.generation,
                        "Discarding stale attachment list"
                    );
                    return Ok(cache.items.clone());
                }
                cache.conversation_id = Some(chat_id.to_string());
                cache.items = items;
                Ok(cache.items.clone())
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Failed to fetch attachments");
                Err(e)
            }
        }
    }

    /// Upload a file, then resynchronize the list.
    ///
    /// `progress` receives a nondecreasing sequence of percentages ending in
    /// 100 when the upload succeeds.
    pub async fn upload(
        &self,
        chat_id: &str,
        file: UploadFile,
        progress: Option<UnboundedSender<u8>>,
    ) -> EngineResult<Attachment> {
        if !self.api.config().is_upload_allowed(&file.name) {
            return Err(EngineError::Validation(format!(
                "File type not allowed: {} (allowed: {})",
                file.name,
                self.api.config().allowed_upload_extensions.join(", ")
            )));
        }

        let attachment = match self.api.upload_attachment(chat_id, file, progress).await {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Failed to upload file");
                return Err(e);
            }
        };
        info!(chat_id = %chat_id, attachment_id = %attachment.id, "File uploaded");

        {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            if cache.conversation_id.as_deref() == Some(chat_id)
                && !cache.items.iter().any(|a| a.id == attachment.id)
            {
                cache.items.push(attachment.clone());
            }
        }

        self.resync(chat_id).await;
        Ok(attachment)
    }

    /// Delete an attachment, then resynchronize the list.
    pub async fn remove(&self, attachment_id: &str) -> EngineResult<()> {
        if let Err(e) = self.api.delete_attachment(attachment_id).await {
            warn!(attachment_id = %attachment_id, error = %e, "Failed to remove attachment");
            return Err(e);
        }
        info!(attachment_id = %attachment_id, "Attachment removed");

        let chat_id = {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            cache.items.retain(|a| a.id != attachment_id);
            cache.conversation_id.clone()
        };

        if let Some(chat_id) = chat_id {
            self.resync(&chat_id).await;
        }
        Ok(())
    }

    /// Re-list after a mutation. The mutation itself already succeeded, so a
    /// failure here only leaves the locally patched cache in place.
    async fn resync(&self, chat_id: &str) {
        if let Err(e) = self.list(chat_id).await {
            warn!(chat_id = %chat_id, error = %e, "Attachment resync failed, keeping local cache");
        }
    }
}
