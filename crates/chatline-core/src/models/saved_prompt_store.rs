use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::EngineResult;

/// Reusable system prompt from the global library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSystemPrompt {
    pub id: i64,
    pub title: String,
    pub prompt: String,
}

#[derive(Debug, Default)]
struct PromptCache {
    prompts: Vec<SavedSystemPrompt>,
    generation: u64,
}

/// Cached saved-prompt library.
///
/// Selecting a prompt for a conversation is a session concern; this store
/// only manages the library entries themselves.
pub struct SavedPromptStore {
    api: ApiClient,
    cache: Mutex<PromptCache>,
}

impl SavedPromptStore {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            cache: Mutex::new(PromptCache::default()),
        }
    }

    pub fn prompts(&self) -> Vec<SavedSystemPrompt> {
        self.cache.lock().prompts.clone()
    }

    pub fn get(&self, id: i64) -> Option<SavedSystemPrompt> {
        self.cache.lock().prompts.iter().find(|p| p.id == id).cloned()
    }

    pub async fn list(&self) -> EngineResult<Vec<SavedSystemPrompt>> {
        let generation = {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            cache.generation
        };

        let prompts = self.api.list_saved_prompts().await.inspect_err(|e| {
            warn!(error = %e, "Failed to fetch saved system prompts");
        })?;

        let mut cache = self.cache.lock();
        if generation < cache.generation {
            debug!(generation, current = cache.generation, "Discarding stale prompt list");
            return Ok(cache.prompts.clone());
        }
        cache.prompts = prompts;
        Ok(cache.prompts.clone())
    }

    pub async fn create(&self, title: &str, prompt: &str) -> EngineResult<SavedSystemPrompt> {
        let created = self
            .api
            .create_saved_prompt(title, prompt)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to save system prompt"))?;
        info!(prompt_id = created.id, title = %created.title, "System prompt saved");

        {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            if !cache.prompts.iter().any(|p| p.id == created.id) {
                cache.prompts.push(created.clone());
            }
        }

        self.resync().await;
        Ok(created)
    }

    /// Update a library entry. Unknown ids fail with `NotFound`.
    pub async fn update(&self, id: i64, title: &str, prompt: &str) -> EngineResult<()> {
        self.api
            .update_saved_prompt(id, title, prompt)
            .await
            .inspect_err(|e| warn!(prompt_id = id, error = %e, "Failed to update saved prompt"))?;
        info!(prompt_id = id, "Saved prompt updated");

        {
            let mut cache = self.cache.lock();
            cache.generation += 1;
            if let Some(entry) = cache.prompts.iter_mut().find(|p| p.id == id) {
                entry.title = title.to_string();
                entry.prompt = prompt.to_string();
            }
        }

        self.resync().await;
        Ok(())
    }

    async fn resync(&self) {
        if let Err(e) = self.list().await {
            warn!(error = %e, "Saved prompt resync failed, keeping local cache");
        }
    }
}
