use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Response, StatusCode};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::types::{ConversationSnapshot, SavedPromptBody, SendRequest, SystemPromptBody};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::attachment_store::{Attachment, UploadFile};
use crate::models::conversation::ConversationSummary;
use crate::models::saved_prompt_store::SavedSystemPrompt;

/// Raw response body of a streaming send.
pub type ByteStream = BoxStream<'static, EngineResult<Bytes>>;

/// Upload bodies are fed to the transport in pieces of this size so progress
/// can be observed.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Characters escaped when an id is placed in a single path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn segment(id: &str) -> String {
    utf8_percent_encode(id, PATH_SEGMENT).to_string()
}

/// URL builder for every backend resource, rooted at the configured base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }

    pub fn chat_list(&self) -> String {
        format!("{}chat-list/", self.base)
    }

    pub fn chat_messages(&self, chat_id: &str) -> String {
        format!("{}chats/{}/messages/", self.base, segment(chat_id))
    }

    pub fn send(&self) -> String {
        format!("{}claude/", self.base)
    }

    pub fn saved_prompts(&self) -> String {
        format!("{}saved-system-prompts/", self.base)
    }

    pub fn saved_prompt(&self, prompt_id: i64) -> String {
        format!("{}saved-system-prompts/{}/", self.base, prompt_id)
    }

    pub fn system_prompt(&self, chat_id: &str) -> String {
        format!("{}chats/{}/system-prompt/", self.base, segment(chat_id))
    }

    pub fn upload(&self, chat_id: &str) -> String {
        format!("{}chats/{}/upload/", self.base, segment(chat_id))
    }

    pub fn attachments(&self, chat_id: &str) -> String {
        format!("{}chats/{}/attachments/", self.base, segment(chat_id))
    }

    pub fn attachment(&self, attachment_id: &str) -> String {
        format!("{}attachments/{}/", self.base, segment(attachment_id))
    }

    pub fn attachment_content(&self, attachment_id: &str) -> String {
        format!("{}attachments/{}/content/", self.base, segment(attachment_id))
    }
}

/// Authenticated HTTP client for the chat backend.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoints: Endpoints,
    config: Arc<EngineConfig>,
}

impl ApiClient {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let mut auth = HeaderValue::from_str(&format!("token {}", config.token))
            .map_err(|e| EngineError::Config(format!("Invalid API token: {}", e)))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("chatline/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);
        if let Some(timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: Endpoints::new(&config.base_url),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.config.stream_idle_timeout()
    }

    /// Direct link to an attachment's content, for renderers.
    pub fn attachment_content_url(&self, attachment_id: &str) -> String {
        self.endpoints.attachment_content(attachment_id)
    }

    pub async fn list_conversations(&self) -> EngineResult<Vec<ConversationSummary>> {
        let response = self.client.get(self.endpoints.chat_list()).send().await?;
        let response = ensure_success(response, "List conversations").await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_conversation(&self, chat_id: &str) -> EngineResult<ConversationSnapshot> {
        let response = self
            .client
            .get(self.endpoints.chat_messages(chat_id))
            .send()
            .await?;
        let response = ensure_success(response, "Fetch conversation").await?;
        Ok(response.json().await?)
    }

    /// Post a message and return the raw streamed body.
    ///
    /// A non-success status fails here, before any bytes are read.
    pub async fn open_stream(&self, request: &SendRequest) -> EngineResult<ByteStream> {
        debug!(chat_id = %request.chat_id, attachments = request.attachment_ids.len(), "Opening response stream");

        let response = self
            .client
            .post(self.endpoints.send())
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response, "Send message").await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EngineError::from))
            .boxed())
    }

    pub async fn update_conversation_prompt(&self, chat_id: &str, prompt: &str) -> EngineResult<()> {
        let response = self
            .client
            .post(self.endpoints.system_prompt(chat_id))
            .json(&SystemPromptBody {
                system_prompt: prompt,
            })
            .send()
            .await?;
        ensure_success(response, "Update system prompt").await?;
        Ok(())
    }

    pub async fn list_saved_prompts(&self) -> EngineResult<Vec<SavedSystemPrompt>> {
        let response = self.client.get(self.endpoints.saved_prompts()).send().await?;
        let response = ensure_success(response, "List saved prompts").await?;
        Ok(response.json().await?)
    }

    pub async fn create_saved_prompt(
        &self,
        title: &str,
        prompt: &str,
    ) -> EngineResult<SavedSystemPrompt> {
        let response = self
            .client
            .post(self.endpoints.saved_prompts())
            .json(&SavedPromptBody { title, prompt })
            .send()
            .await?;
        let response = ensure_success(response, "Create saved prompt").await?;
        Ok(response.json().await?)
    }

    pub async fn update_saved_prompt(&self, id: i64, title: &str, prompt: &str) -> EngineResult<()> {
        let response = self
            .client
            .put(self.endpoints.saved_prompt(id))
            .json(&SavedPromptBody { title, prompt })
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(format!("Saved prompt {} does not exist", id)));
        }
        ensure_success(response, "Update saved prompt").await?;
        Ok(())
    }

    pub async fn list_attachments(&self, chat_id: &str) -> EngineResult<Vec<Attachment>> {
        let response = self
            .client
            .get(self.endpoints.attachments(chat_id))
            .send()
            .await?;
        let response = ensure_success(response, "List attachments").await?;
        Ok(response.json().await?)
    }

    /// Upload a file as multipart field `file`.
    ///
    /// Percentages below 100 are reported as the body is handed to the
    /// transport; 100 is reported once the server has accepted the upload.
    pub async fn upload_attachment(
        &self,
        chat_id: &str,
        file: UploadFile,
        progress: Option<UnboundedSender<u8>>,
    ) -> EngineResult<Attachment> {
        let total = file.bytes.len() as u64;
        let chunks = split_chunks(&file.bytes, UPLOAD_CHUNK_SIZE);

        let mut reporter = ProgressReporter::new(total, progress.clone());
        reporter.report(0);
        let body_stream = futures::stream::iter(chunks).map(move |chunk| {
            reporter.advance(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let part = Part::stream_with_length(Body::wrap_stream(body_stream), total)
            .file_name(file.name.clone());
        let form = Form::new().part("file", part);

        debug!(chat_id = %chat_id, file = %file.name, bytes = total, "Uploading attachment");

        let response = self
            .client
            .post(self.endpoints.upload(chat_id))
            .multipart(form)
            .send()
            .await?;
        let response = ensure_success(response, "Upload attachment").await?;
        let attachment: Attachment = response.json().await?;

        if let Some(tx) = progress {
            let _ = tx.send(100);
        }
        Ok(attachment)
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> EngineResult<()> {
        let response = self
            .client
            .delete(self.endpoints.attachment(attachment_id))
            .send()
            .await?;
        ensure_success(response, "Delete attachment").await?;
        Ok(())
    }
}

async fn ensure_success(response: Response, context: &str) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!(status = %status, body = %body, "{} failed", context);
    Err(EngineError::from_status(status, context))
}

fn split_chunks(bytes: &Bytes, size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(size));
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + size).min(bytes.len());
        chunks.push(bytes.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Turns byte counts into a deduplicated, nondecreasing percentage sequence
/// capped at 99.
struct ProgressReporter {
    total: u64,
    sent: u64,
    last: Option<u8>,
    tx: Option<UnboundedSender<u8>>,
}

impl ProgressReporter {
    fn new(total: u64, tx: Option<UnboundedSender<u8>>) -> Self {
        Self {
            total,
            sent: 0,
            last: None,
            tx,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.sent += bytes;
        if self.total > 0 {
            let percent = (self.sent * 100 / self.total).min(99) as u8;
            self.report(percent);
        }
    }

    fn report(&mut self, percent: u8) {
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        if let Some(tx) = &self.tx {
            let _ = tx.send(percent);
        }
    }
}
