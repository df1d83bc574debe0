use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session_machine::{Action, Effect, SessionPhase, SessionState, StreamStatus, transition};
use crate::api::ApiClient;
use crate::api::types::SendRequest;
use crate::error::{EngineError, EngineResult};
use crate::models::conversation::{ConversationId, ConversationState};
use crate::models::message::Message;
use crate::models::saved_prompt_store::SavedSystemPrompt;
use crate::services::stream_decoder::decode_stream;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Routing collaborator told when a new conversation receives its id.
pub trait Navigator: Send + Sync {
    fn navigate_to_chat(&self, chat_id: &str);
}

/// Navigator for hosts without routing.
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn navigate_to_chat(&self, _chat_id: &str) {}
}

/// Observer events for UI updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    UserMessageAppended { text: String },
    AssistantDelta { text: String },
    ChatAssigned { chat_id: String },
    StreamEnded { status: StreamStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    /// Superseded by a newer send or cancelled explicitly.
    Cancelled,
}

struct ActiveStream {
    generation: u64,
    task: JoinHandle<()>,
}

/// Session state and the task feeding it. Both live under one lock so that
/// retiring a stream and registering its successor is a single step.
#[derive(Default)]
struct Session {
    state: SessionState,
    active: Option<ActiveStream>,
}

/// Leftovers of an applied action, handled after the session lock is released.
#[derive(Default)]
struct Step {
    open: Option<(u64, SendRequest)>,
    navigate: Vec<String>,
    ended: Option<StreamStatus>,
}

struct Inner {
    api: ApiClient,
    navigator: Arc<dyn Navigator>,
    session: Mutex<Session>,
    updates: broadcast::Sender<SessionUpdate>,
}

/// Drives sends for one conversation.
///
/// At most one response stream is in flight; starting a send while another
/// is streaming aborts the older one first. The conversation log is only
/// mutated here, callers get snapshots.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

/// Cancels the stream of `generation` if the owning `send` future is dropped
/// before it finishes.
struct SendGuard {
    controller: SessionController,
    generation: u64,
    armed: bool,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(generation = self.generation, "Send dropped, cancelling its stream");
            self.controller.cancel_generation(self.generation);
        }
    }
}

impl SessionController {
    /// Start a "new chat" session. The id is adopted from the first stream
    /// that announces one.
    pub fn new(api: ApiClient, navigator: Arc<dyn Navigator>) -> Self {
        Self::with_conversation(api, navigator, ConversationState::new_chat())
    }

    /// Bind an existing conversation and load its messages and system prompt.
    pub async fn open(
        api: ApiClient,
        navigator: Arc<dyn Navigator>,
        chat_id: &str,
    ) -> EngineResult<Self> {
        let controller =
            Self::with_conversation(api, navigator, ConversationState::existing(chat_id));
        controller.load().await?;
        Ok(controller)
    }

    fn with_conversation(
        api: ApiClient,
        navigator: Arc<dyn Navigator>,
        conversation: ConversationState,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                navigator,
                session: Mutex::new(Session {
                    state: SessionState::new(conversation),
                    active: None,
                }),
                updates,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.inner.session.lock().state.conversation.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.session.lock().state.conversation.messages.clone()
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.inner.session.lock().state.conversation.id.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.inner.session.lock().state.conversation.system_prompt.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.session.lock().state.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase().is_active()
    }

    pub fn last_error(&self) -> Option<EngineError> {
        self.inner.session.lock().state.last_error.clone()
    }

    pub fn draft(&self) -> String {
        self.inner.session.lock().state.draft.clone()
    }

    pub fn set_draft(&self, text: &str) {
        self.apply(Action::EditDraft(text.to_string()));
    }

    /// Change the active system prompt locally. Nothing is persisted.
    pub fn set_system_prompt(&self, prompt: &str) {
        self.apply(Action::SetSystemPrompt(prompt.to_string()));
    }

    /// Use a library prompt for this conversation. Nothing is persisted.
    pub fn select_saved_prompt(&self, saved: &SavedSystemPrompt) {
        debug!(prompt_id = saved.id, "Selecting saved system prompt");
        self.set_system_prompt(&saved.prompt);
    }

    /// Store the active system prompt on the conversation itself.
    pub async fn persist_system_prompt(&self) -> EngineResult<()> {
        let (id, prompt) = {
            let session = self.inner.session.lock();
            (
                session.state.conversation.id.clone(),
                session.state.conversation.system_prompt.clone(),
            )
        };
        let Some(chat_id) = id.as_str() else {
            return Err(EngineError::Validation(
                "Conversation has no id yet; send a message first".into(),
            ));
        };

        self.inner
            .api
            .update_conversation_prompt(chat_id, &prompt)
            .await
            .inspect_err(|e| warn!(chat_id = %chat_id, error = %e, "Failed to update system prompt"))?;
        info!(chat_id = %chat_id, "System prompt updated");
        Ok(())
    }

    /// Reload messages and system prompt from the backend.
    pub async fn load(&self) -> EngineResult<()> {
        let id = self.conversation_id();
        let Some(chat_id) = id.as_str() else {
            return Err(EngineError::Validation("A new chat has nothing to load".into()));
        };
        if self.is_streaming() {
            return Err(EngineError::Validation(
                "Cannot reload while a response is streaming".into(),
            ));
        }

        let snapshot = self
            .inner
            .api
            .fetch_conversation(chat_id)
            .await
            .inspect_err(|e| warn!(chat_id = %chat_id, error = %e, "Failed to fetch messages"))?;
        debug!(chat_id = %chat_id, messages = snapshot.messages.len(), "Conversation loaded");
        self.apply(Action::Loaded(snapshot));
        Ok(())
    }

    /// Send the current draft.
    pub async fn send_draft(&self, attachment_ids: &[String]) -> EngineResult<SendOutcome> {
        let text = self.draft();
        self.send(&text, attachment_ids).await
    }

    /// Send a message and stream the reply into the conversation.
    ///
    /// Resolves when the stream ends. Errors are also recorded as
    /// `last_error`; any assistant text received before a failure is kept.
    pub async fn send(&self, text: &str, attachment_ids: &[String]) -> EngineResult<SendOutcome> {
        if text.trim().is_empty() && attachment_ids.is_empty() {
            return Err(EngineError::Validation(
                "Message is empty and has no attachments".into(),
            ));
        }

        // Submitting, aborting the previous task and registering the new one
        // happen under one lock, so no other send can slip in between.
        let (generation, done_rx, navigate) = {
            let mut session = self.inner.session.lock();
            let step = self.advance(
                &mut session,
                Action::Submit {
                    text: text.to_string(),
                    attachment_ids: attachment_ids.to_vec(),
                },
            );
            let Some((generation, request)) = step.open else {
                return Ok(SendOutcome::Completed);
            };

            let (done_tx, done_rx) = oneshot::channel();
            let driver = self.clone();
            let task = tokio::spawn(async move {
                let _ = done_tx.send(driver.drive(generation, request).await);
            });
            session.active = Some(ActiveStream { generation, task });
            (generation, done_rx, step.navigate)
        };
        self.navigate(&navigate);

        let mut guard = SendGuard {
            controller: self.clone(),
            generation,
            armed: true,
        };
        let result = done_rx.await;
        guard.armed = false;

        // An aborted task drops `done_tx` without sending.
        result.unwrap_or(Ok(SendOutcome::Cancelled))
    }

    /// Cancel the active send, if any. The conversation keeps everything
    /// applied up to this point.
    pub fn cancel(&self) {
        self.apply(Action::Cancel);
    }

    fn cancel_generation(&self, generation: u64) {
        let mut session = self.inner.session.lock();
        if session.state.generation() == generation {
            self.advance(&mut session, Action::Cancel);
        }
    }

    /// Body of the spawned stream task. The response body lives inside this
    /// future, so it is released on return and on abort alike.
    async fn drive(&self, generation: u64, request: SendRequest) -> EngineResult<SendOutcome> {
        let bytes = match self.inner.api.open_stream(&request).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(generation, e),
        };
        self.apply(Action::StreamOpened { generation });
        debug!(generation, "Response stream opened");

        let mut events = decode_stream(bytes, self.inner.api.stream_idle_timeout());
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    self.apply(Action::Stream { generation, event });
                }
                Err(e) => return self.fail(generation, e),
            }
        }

        let step = self.apply(Action::StreamEnded { generation });
        debug!(generation, "Response stream finished");
        Ok(match step.ended {
            Some(StreamStatus::Completed) => SendOutcome::Completed,
            _ => SendOutcome::Cancelled,
        })
    }

    fn fail(&self, generation: u64, error: EngineError) -> EngineResult<SendOutcome> {
        let step = {
            let mut session = self.inner.session.lock();
            let step = self.advance(
                &mut session,
                Action::StreamFailed {
                    generation,
                    error: error.clone(),
                },
            );
            if step.ended.is_some() {
                self.advance(&mut session, Action::ErrorSurfaced);
            }
            step
        };

        if step.ended.is_none() {
            debug!(generation, error = %error, "Ignoring failure of a retired stream");
            return Ok(SendOutcome::Cancelled);
        }
        warn!(generation, error = %error, "Failed to send message");
        Err(error)
    }

    fn apply(&self, action: Action) -> Step {
        let step = {
            let mut session = self.inner.session.lock();
            self.advance(&mut session, action)
        };
        self.navigate(&step.navigate);
        step
    }

    /// Run one transition and carry out every effect that must happen under
    /// the session lock. Navigation is left to the caller.
    fn advance(&self, session: &mut Session, action: Action) -> Step {
        let (next, effects) = transition(std::mem::take(&mut session.state), action);
        session.state = next;

        let mut step = Step::default();
        for effect in effects {
            match effect {
                Effect::OpenStream {
                    generation,
                    request,
                } => step.open = Some((generation, request)),
                Effect::CancelStream { generation } => {
                    if session.active.as_ref().is_some_and(|a| a.generation == generation)
                        && let Some(stream) = session.active.take()
                    {
                        stream.task.abort();
                        debug!(generation, "Cancelled previous stream");
                    }
                }
                Effect::UserMessageAppended { text } => {
                    self.publish(SessionUpdate::UserMessageAppended { text });
                }
                Effect::AssistantDelta { text } => {
                    self.publish(SessionUpdate::AssistantDelta { text });
                }
                Effect::Navigate { chat_id } => {
                    self.publish(SessionUpdate::ChatAssigned {
                        chat_id: chat_id.clone(),
                    });
                    step.navigate.push(chat_id);
                }
                Effect::StreamEnded { generation, status } => {
                    debug!(generation, status = ?status, "Stream ended");
                    if session.active.as_ref().is_some_and(|a| a.generation == generation) {
                        session.active = None;
                    }
                    self.publish(SessionUpdate::StreamEnded {
                        status: status.clone(),
                    });
                    step.ended = Some(status);
                }
            }
        }
        step
    }

    fn navigate(&self, chat_ids: &[String]) {
        for chat_id in chat_ids {
            info!(chat_id = %chat_id, "Conversation id assigned");
            self.inner.navigator.navigate_to_chat(chat_id);
        }
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.inner.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::message::Role;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingNavigator {
        visited: Mutex<Vec<String>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate_to_chat(&self, chat_id: &str) {
            self.visited.lock().push(chat_id.to_string());
        }
    }

    fn api_for(server: &MockServer) -> ApiClient {
        ApiClient::new(EngineConfig::new(&server.uri(), "secret")).unwrap()
    }

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines.iter().map(|l| format!("{}\n", l)).collect()
    }

    #[tokio::test]
    async fn test_send_new_chat_streams_and_adopts_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/claude/"))
            .and(body_json(serde_json::json!({
                "chat_id": "new", "message": "Hi", "attachment_ids": ["a1"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                serde_json::json!({"type": "chat_id", "content": "42"}),
                serde_json::json!({"type": "text", "content": "Hel"}),
                serde_json::json!({"type": "text", "content": "lo"}),
                serde_json::json!({"type": "chat_id", "content": "43"}),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let navigator = Arc::new(RecordingNavigator::default());
        let controller = SessionController::new(api_for(&server), navigator.clone());
        let mut updates = controller.subscribe();
        controller.set_draft("Hi");

        let outcome = controller.send_draft(&["a1".to_string()]).await.unwrap();

        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(controller.draft().is_empty());
        assert_eq!(controller.conversation_id(), ConversationId::Assigned("42".into()));
        assert_eq!(*navigator.visited.lock(), vec!["42".to_string()]);

        let messages = controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("Hi"));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");

        let mut seen = Vec::new();
        while let Ok(update) = updates.try_recv() {
            seen.push(update);
        }
        assert_eq!(seen.first(), Some(&SessionUpdate::UserMessageAppended { text: "Hi".into() }));
        assert_eq!(
            seen.last(),
            Some(&SessionUpdate::StreamEnded {
                status: StreamStatus::Completed
            })
        );
    }

    #[tokio::test]
    async fn test_empty_send_never_reaches_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let controller = SessionController::new(api_for(&server), Arc::new(NoopNavigator));
        let err = controller.send("  ", &[]).await.unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert!(controller.messages().is_empty());
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced_and_session_stays_usable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/claude/"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/claude/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                serde_json::json!({"type": "text", "content": "ok"}),
            ])))
            .mount(&server)
            .await;

        let controller = SessionController::new(api_for(&server), Arc::new(NoopNavigator));

        let err = controller.send("first", &[]).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(controller.last_error(), Some(err));
        assert_eq!(controller.messages(), vec![Message::user("first")]);

        let outcome = controller.send("second", &[]).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);
        assert!(controller.last_error().is_none());
        assert_eq!(controller.messages().last().unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_open_loads_existing_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/7/messages/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [
                    {"role": "user", "content": "q"},
                    {"role": "function", "content": "{}"},
                    {"role": "assistant", "content": "a"}
                ],
                "system_prompt": "Be kind."
            })))
            .mount(&server)
            .await;

        let controller = SessionController::open(api_for(&server), Arc::new(NoopNavigator), "7")
            .await
            .unwrap();

        assert_eq!(controller.conversation_id().as_str(), Some("7"));
        let messages = controller.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::Unknown);
        assert_eq!(controller.system_prompt(), "Be kind.");
    }

    #[tokio::test]
    async fn test_selected_prompt_is_local_until_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats/7/system-prompt/"))
            .and(body_json(serde_json::json!({"system_prompt": "Talk like a pirate."})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/chats/7/messages/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [], "system_prompt": ""
            })))
            .mount(&server)
            .await;

        let controller = SessionController::open(api_for(&server), Arc::new(NoopNavigator), "7")
            .await
            .unwrap();
        controller.select_saved_prompt(&SavedSystemPrompt {
            id: 1,
            title: "Pirate".into(),
            prompt: "Talk like a pirate.".into(),
        });
        assert_eq!(controller.system_prompt(), "Talk like a pirate.");

        controller.persist_system_prompt().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_prompt_requires_id() {
        let server = MockServer::start().await;
        let controller = SessionController::new(api_for(&server), Arc::new(NoopNavigator));
        controller.set_system_prompt("x");

        assert!(matches!(
            controller.persist_system_prompt().await,
            Err(EngineError::Validation(_))
        ));
    }
}
