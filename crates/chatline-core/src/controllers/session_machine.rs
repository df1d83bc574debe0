//! Pure state machine for one chat session.
//!
//! `transition` takes the current state and an action and returns the next
//! state plus the effects the controller must carry out. No I/O happens here,
//! so every rule of the send lifecycle can be tested directly.

use crate::api::types::{ConversationSnapshot, SendRequest};
use crate::error::EngineError;
use crate::models::conversation::ConversationState;
use crate::services::stream_decoder::StreamEvent;

/// Send lifecycle: `Idle -> Sending -> Streaming -> Idle`, with failures
/// passing through `Error` before returning to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Error,
}

impl SessionPhase {
    pub fn is_active(self) -> bool {
        matches!(self, SessionPhase::Sending | SessionPhase::Streaming)
    }
}

/// How a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub conversation: ConversationState,
    /// Composed text not yet sent.
    pub draft: String,
    pub last_error: Option<EngineError>,
    /// Identifies the current stream. Anything tagged with an older value is stale.
    generation: u64,
    /// Index of the assistant message the current stream writes to.
    assistant_index: Option<usize>,
}

impl SessionState {
    pub fn new(conversation: ConversationState) -> Self {
        Self {
            conversation,
            ..Self::default()
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.phase.is_active()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Submit {
        text: String,
        attachment_ids: Vec<String>,
    },
    StreamOpened {
        generation: u64,
    },
    Stream {
        generation: u64,
        event: StreamEvent,
    },
    StreamEnded {
        generation: u64,
    },
    StreamFailed {
        generation: u64,
        error: EngineError,
    },
    /// The failure was reported to the caller.
    ErrorSurfaced,
    Cancel,
    EditDraft(String),
    SetSystemPrompt(String),
    Loaded(ConversationSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenStream {
        generation: u64,
        request: SendRequest,
    },
    /// Release the reader of the stream with this generation.
    CancelStream {
        generation: u64,
    },
    UserMessageAppended {
        text: String,
    },
    AssistantDelta {
        text: String,
    },
    /// The conversation just received its id; route to it.
    Navigate {
        chat_id: String,
    },
    StreamEnded {
        generation: u64,
        status: StreamStatus,
    },
}

pub fn transition(mut state: SessionState, action: Action) -> (SessionState, Vec<Effect>) {
    let mut effects = Vec::new();

    match action {
        Action::Submit {
            text,
            attachment_ids,
        } => {
            if text.trim().is_empty() && attachment_ids.is_empty() {
                return (state, effects);
            }

            if state.phase.is_active() {
                effects.extend(cancel_current(&mut state));
            }

            state.generation += 1;
            state.assistant_index = None;
            state.last_error = None;
            state.draft.clear();
            state.conversation.push_user(&text);
            state.phase = SessionPhase::Sending;

            let request = SendRequest {
                chat_id: state.conversation.id.wire_value().to_string(),
                message: text.clone(),
                attachment_ids,
            };
            effects.push(Effect::UserMessageAppended { text });
            effects.push(Effect::OpenStream {
                generation: state.generation,
                request,
            });
        }
        Action::StreamOpened { generation } => {
            if generation == state.generation && state.phase == SessionPhase::Sending {
                state.phase = SessionPhase::Streaming;
            }
        }
        Action::Stream { generation, event } => {
            if !state.is_current(generation) {
                return (state, effects);
            }
            match event {
                StreamEvent::TextDelta { text } => {
                    let index = match state.assistant_index {
                        Some(index) => index,
                        None => {
                            let index = state.conversation.start_assistant();
                            state.assistant_index = Some(index);
                            index
                        }
                    };
                    state.conversation.extend_assistant(index, &text);
                    effects.push(Effect::AssistantDelta { text });
                }
                StreamEvent::ChatAssigned { id } => {
                    if state.conversation.adopt_id(&id) {
                        effects.push(Effect::Navigate { chat_id: id });
                    }
                }
                StreamEvent::Unknown { .. } => {}
            }
        }
        Action::StreamEnded { generation } => {
            if state.is_current(generation) {
                state.phase = SessionPhase::Idle;
                state.assistant_index = None;
                effects.push(Effect::StreamEnded {
                    generation,
                    status: StreamStatus::Completed,
                });
            }
        }
        Action::StreamFailed { generation, error } => {
            if state.is_current(generation) {
                // Partial assistant content stays in the log.
                state.phase = SessionPhase::Error;
                state.assistant_index = None;
                effects.push(Effect::StreamEnded {
                    generation,
                    status: StreamStatus::Failed(error.to_string()),
                });
                state.last_error = Some(error);
            }
        }
        Action::ErrorSurfaced => {
            if state.phase == SessionPhase::Error {
                state.phase = SessionPhase::Idle;
            }
        }
        Action::Cancel => {
            if state.phase.is_active() {
                effects.extend(cancel_current(&mut state));
                state.phase = SessionPhase::Idle;
            }
        }
        Action::EditDraft(text) => state.draft = text,
        Action::SetSystemPrompt(prompt) => state.conversation.system_prompt = prompt,
        Action::Loaded(snapshot) => {
            if !state.phase.is_active() {
                state.conversation.messages = snapshot.messages;
                state.conversation.system_prompt = snapshot.system_prompt;
            }
        }
    }

    (state, effects)
}

/// Retire the current stream: bump the generation so its late events are
/// ignored and ask the controller to release its reader.
fn cancel_current(state: &mut SessionState) -> Vec<Effect> {
    let generation = state.generation;
    state.generation += 1;
    state.assistant_index = None;
    vec![
        Effect::CancelStream { generation },
        Effect::StreamEnded {
            generation,
            status: StreamStatus::Cancelled,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::ConversationId;
    use crate::models::message::{Message, Role};

    fn submit(text: &str) -> Action {
        Action::Submit {
            text: text.to_string(),
            attachment_ids: vec![],
        }
    }

    fn delta(generation: u64, text: &str) -> Action {
        Action::Stream {
            generation,
            event: StreamEvent::TextDelta {
                text: text.to_string(),
            },
        }
    }

    fn assigned(generation: u64, id: &str) -> Action {
        Action::Stream {
            generation,
            event: StreamEvent::ChatAssigned { id: id.to_string() },
        }
    }

    fn run(state: SessionState, actions: Vec<Action>) -> (SessionState, Vec<Effect>) {
        let mut all = Vec::new();
        let mut state = state;
        for action in actions {
            let (next, effects) = transition(state, action);
            state = next;
            all.extend(effects);
        }
        (state, all)
    }

    #[test]
    fn test_empty_submit_is_noop() {
        let before = SessionState::default();
        let (after, effects) = transition(before.clone(), submit("   "));
        assert_eq!(after, before);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_attachment_only_submit_sends() {
        let (state, effects) = transition(
            SessionState::default(),
            Action::Submit {
                text: String::new(),
                attachment_ids: vec!["a1".into()],
            },
        );
        assert_eq!(state.phase, SessionPhase::Sending);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::OpenStream { request, .. } if request.attachment_ids == vec!["a1".to_string()]
        )));
    }

    #[test]
    fn test_submit_appends_user_message_and_clears_draft() {
        let (state, _) = run(
            SessionState::default(),
            vec![Action::EditDraft("hello".into()), submit("hello")],
        );
        assert_eq!(state.conversation.messages, vec![Message::user("hello")]);
        assert!(state.draft.is_empty());
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_new_chat_request_uses_sentinel() {
        let (_, effects) = transition(SessionState::default(), submit("hi"));
        let Some(Effect::OpenStream { request, .. }) = effects.last() else {
            panic!("expected OpenStream, got {:?}", effects);
        };
        assert_eq!(request.chat_id, "new");
        assert_eq!(request.message, "hi");
    }

    #[test]
    fn test_deltas_concatenate_in_order() {
        let (state, _) = run(
            SessionState::default(),
            vec![
                submit("q"),
                Action::StreamOpened { generation: 1 },
                delta(1, "Hel"),
                delta(1, "lo"),
                delta(1, ", world"),
                Action::StreamEnded { generation: 1 },
            ],
        );

        assert_eq!(state.phase, SessionPhase::Idle);
        assert_eq!(state.conversation.messages.len(), 2);
        let last = state.conversation.last_message().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Hello, world");
    }

    #[test]
    fn test_second_chat_id_is_ignored() {
        let (state, effects) = run(
            SessionState::default(),
            vec![
                submit("q"),
                Action::StreamOpened { generation: 1 },
                assigned(1, "42"),
                assigned(1, "43"),
            ],
        );

        assert_eq!(state.conversation.id, ConversationId::Assigned("42".into()));
        let navigations: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Navigate { .. }))
            .collect();
        assert_eq!(
            navigations,
            vec![&Effect::Navigate {
                chat_id: "42".into()
            }]
        );
    }

    #[test]
    fn test_failure_keeps_partial_content() {
        let (state, effects) = run(
            SessionState::default(),
            vec![
                submit("q"),
                Action::StreamOpened { generation: 1 },
                delta(1, "partial"),
                Action::StreamFailed {
                    generation: 1,
                    error: EngineError::network("reset"),
                },
            ],
        );

        assert_eq!(state.phase, SessionPhase::Error);
        assert_eq!(state.last_error, Some(EngineError::network("reset")));
        assert_eq!(state.conversation.last_message().unwrap().content, "partial");
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StreamEnded {
                status: StreamStatus::Failed(_),
                ..
            }
        )));

        let (state, _) = transition(state, Action::ErrorSurfaced);
        assert_eq!(state.phase, SessionPhase::Idle);
        assert_eq!(state.conversation.messages.len(), 2);
    }

    #[test]
    fn test_resubmit_cancels_previous_stream() {
        let (state, effects) = run(
            SessionState::default(),
            vec![
                submit("first"),
                Action::StreamOpened { generation: 1 },
                delta(1, "one"),
                submit("second"),
            ],
        );

        assert!(effects.contains(&Effect::CancelStream { generation: 1 }));
        // The cancel bump plus the new send.
        assert_eq!(state.generation(), 3);

        // Late events from the first stream must not land anywhere.
        let (state, effects) = run(
            state,
            vec![
                delta(1, " leaked"),
                assigned(1, "99"),
                Action::StreamEnded { generation: 1 },
                Action::StreamOpened { generation: 3 },
                delta(3, "two"),
            ],
        );

        assert_eq!(state.conversation.id, ConversationId::Unassigned);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Navigate { .. })));
        let contents: Vec<&str> = state
            .conversation
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "one", "second", "two"]);
    }

    #[test]
    fn test_cancel_freezes_state() {
        let (state, _) = run(
            SessionState::default(),
            vec![
                submit("q"),
                Action::StreamOpened { generation: 1 },
                delta(1, "so far"),
                Action::Cancel,
            ],
        );
        let frozen = state.conversation.clone();

        let (state, effects) = run(state, vec![delta(1, " more"), Action::StreamEnded { generation: 1 }]);
        assert!(effects.is_empty());
        assert_eq!(state.phase, SessionPhase::Idle);
        assert_eq!(state.conversation, frozen);
    }

    #[test]
    fn test_cancel_when_idle_does_nothing() {
        let (state, effects) = transition(SessionState::default(), Action::Cancel);
        assert!(effects.is_empty());
        assert_eq!(state.generation(), 0);
    }

    #[test]
    fn test_loaded_snapshot_replaces_log_when_idle() {
        let snapshot = ConversationSnapshot {
            messages: vec![Message::user("a"), Message::assistant("b")],
            system_prompt: "Be kind.".into(),
        };
        let (state, _) = transition(
            SessionState::new(ConversationState::existing("7")),
            Action::Loaded(snapshot),
        );
        assert_eq!(state.conversation.messages.len(), 2);
        assert_eq!(state.conversation.system_prompt, "Be kind.");
    }
}
