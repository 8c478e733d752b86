//! Deterministic in-memory implementation of the `chat_protocol` transport.
//!
//! This crate performs no I/O. It keeps a scripted backend state, records
//! every call and queues the events a real backend would stream back so tests
//! can feed them to the store in a controlled order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chat_protocol::{
    CancelSignal, ChatEvent, ChatTransport, CommandOutcome, CommandRequest, IncomingPart,
    MessageInfo, PromptPart, PromptRequest, Role, Session, SessionTime, ShareInfo, TokenUsage,
    TransportError, WireMessage,
};
use serde_json::Value;

/// Stable provider identifier reported on mock assistant replies.
pub const MOCK_PROVIDER_ID: &str = "mock";
/// Model identifier reported on mock assistant replies.
pub const MOCK_MODEL_ID: &str = "mock-model";

const BASE_TIME_MS: i64 = 1_700_000_000_000;

/// Transport operation selector used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListSessions,
    CreateSession,
    DeleteSession,
    UpdateSession,
    ShareSession,
    UnshareSession,
    GetMessages,
    SendMessage,
    RunCommand,
    InitSession,
    SummarizeSession,
    AbortSession,
}

/// One recorded transport invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    ListSessions,
    CreateSession { title: Option<String> },
    DeleteSession { session_id: String },
    UpdateSession { session_id: String, title: String },
    ShareSession { session_id: String },
    UnshareSession { session_id: String },
    GetMessages { session_id: String, limit: Option<usize> },
    SendMessage { request: PromptRequest },
    RunCommand { request: CommandRequest },
    InitSession { session_id: String, message_id: String },
    SummarizeSession { session_id: String },
    AbortSession { session_id: String },
}

#[derive(Debug, Default)]
struct MockState {
    sessions: Vec<Session>,
    messages: HashMap<String, Vec<WireMessage>>,
    calls: Vec<TransportCall>,
    failures: HashMap<MockOp, VecDeque<TransportError>>,
    command_templates: HashMap<String, String>,
    outbox: VecDeque<ChatEvent>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self, op: MockOp) -> Option<TransportError> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session, TransportError> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .ok_or_else(|| TransportError::NotFound(format!("session {session_id}")))
    }
}

/// Scriptable in-memory backend.
#[derive(Debug)]
pub struct MockTransport {
    reply_chunks: Vec<String>,
    reply_tokens: Option<TokenUsage>,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(vec!["Mocked ".to_string(), "reply.".to_string()])
    }
}

impl MockTransport {
    /// Creates a mock whose assistant replies stream the given text chunks.
    #[must_use]
    pub fn new(reply_chunks: Vec<String>) -> Self {
        Self {
            reply_chunks,
            reply_tokens: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Attaches token usage to the `step-finish` part closing each reply.
    #[must_use]
    pub fn with_reply_tokens(mut self, tokens: TokenUsage) -> Self {
        self.reply_tokens = Some(tokens);
        self
    }

    /// Registers a command whose outcome expands `$ARGUMENTS` into the template.
    #[must_use]
    pub fn with_command_template(self, name: &str, template: &str) -> Self {
        self.lock_state()
            .command_templates
            .insert(name.to_string(), template.to_string());
        self
    }

    pub fn seed_session(&self, session: Session) {
        let mut state = self.lock_state();
        state.messages.entry(session.id.clone()).or_default();
        state.sessions.push(session);
    }

    pub fn seed_messages(&self, session_id: &str, messages: Vec<WireMessage>) {
        self.lock_state()
            .messages
            .insert(session_id.to_string(), messages);
    }

    /// Makes the next call of `op` fail with `error`. Multiple failures queue up.
    pub fn fail_next(&self, op: MockOp, error: TransportError) {
        self.lock_state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock_state().calls.clone()
    }

    #[must_use]
    pub fn sent_prompts(&self) -> Vec<PromptRequest> {
        self.lock_state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::SendMessage { request } => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drains events the mock backend has produced since the last call.
    #[must_use]
    pub fn take_events(&self) -> Vec<ChatEvent> {
        self.lock_state().outbox.drain(..).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        lock_unpoisoned(&self.state)
    }

    fn record(
        &self,
        op: MockOp,
        call: TransportCall,
    ) -> Result<MutexGuard<'_, MockState>, TransportError> {
        let mut state = self.lock_state();
        state.calls.push(call);
        match state.take_failure(op) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    fn queue_reply(&self, state: &mut MockState, session_id: &str) {
        let reply_number = state.next_id();
        let message_id = format!("msg_mock_reply_{reply_number}");
        let text_part_id = format!("prt_mock_{}", state.next_id());
        let finish_part_id = format!("prt_mock_{}", state.next_id());
        let created = BASE_TIME_MS + reply_number as i64 * 1_000;

        let mut info = MessageInfo::new(&message_id, session_id, Role::Assistant, created)
            .with_model(MOCK_PROVIDER_ID, MOCK_MODEL_ID);

        for chunk in &self.reply_chunks {
            state.outbox.push_back(ChatEvent::PartUpdated {
                session_id: session_id.to_string(),
                message_id: message_id.clone(),
                part: IncomingPart::text_delta(&text_part_id, chunk.as_str()),
                role: Some(Role::Assistant),
            });
        }

        let mut finish = IncomingPart::new(&finish_part_id, "step-finish")
            .with_field("reason", "stop");
        if let Some(tokens) = self.reply_tokens {
            let encoded = serde_json::to_value(tokens).unwrap_or(Value::Null);
            finish = finish.with_field("tokens", encoded);
            info = info.with_tokens(tokens);
        }
        state.outbox.push_back(ChatEvent::PartUpdated {
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            part: finish.clone(),
            role: Some(Role::Assistant),
        });
        state.outbox.push_back(ChatEvent::MessageCompleted {
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
        });

        info.time.completed = Some(created + 500);
        let reply = WireMessage {
            info,
            parts: vec![
                IncomingPart::text(&text_part_id, self.reply_chunks.concat()),
                finish,
            ],
        };
        state
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(reply);
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn list_sessions(&self) -> Result<Vec<Session>, TransportError> {
        let state = self.record(MockOp::ListSessions, TransportCall::ListSessions)?;
        Ok(state.sessions.clone())
    }

    async fn create_session(&self, title: Option<String>) -> Result<Session, TransportError> {
        let mut state = self.record(
            MockOp::CreateSession,
            TransportCall::CreateSession {
                title: title.clone(),
            },
        )?;
        let number = state.next_id();
        let created = BASE_TIME_MS + number as i64;
        let session = Session {
            id: format!("ses_mock_{number}"),
            title: title.unwrap_or_else(|| "New session".to_string()),
            directory: None,
            parent_id: None,
            share: None,
            time: SessionTime {
                created,
                updated: created,
            },
        };
        state.messages.insert(session.id.clone(), Vec::new());
        state.sessions.insert(0, session.clone());
        Ok(session)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), TransportError> {
        let mut state = self.record(
            MockOp::DeleteSession,
            TransportCall::DeleteSession {
                session_id: session_id.to_string(),
            },
        )?;
        state.sessions.retain(|session| session.id != session_id);
        state.messages.remove(session_id);
        Ok(())
    }

    async fn update_session(&self, session_id: &str, title: &str) -> Result<Session, TransportError> {
        let mut state = self.record(
            MockOp::UpdateSession,
            TransportCall::UpdateSession {
                session_id: session_id.to_string(),
                title: title.to_string(),
            },
        )?;
        let session = state.session_mut(session_id)?;
        session.title = title.to_string();
        Ok(session.clone())
    }

    async fn share_session(&self, session_id: &str) -> Result<Session, TransportError> {
        let mut state = self.record(
            MockOp::ShareSession,
            TransportCall::ShareSession {
                session_id: session_id.to_string(),
            },
        )?;
        let session = state.session_mut(session_id)?;
        session.share = Some(ShareInfo {
            url: format!("https://share.invalid/{session_id}"),
        });
        Ok(session.clone())
    }

    async fn unshare_session(&self, session_id: &str) -> Result<Session, TransportError> {
        let mut state = self.record(
            MockOp::UnshareSession,
            TransportCall::UnshareSession {
                session_id: session_id.to_string(),
            },
        )?;
        let session = state.session_mut(session_id)?;
        session.share = None;
        Ok(session.clone())
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WireMessage>, TransportError> {
        let state = self.record(
            MockOp::GetMessages,
            TransportCall::GetMessages {
                session_id: session_id.to_string(),
                limit,
            },
        )?;
        let messages = state.messages.get(session_id).cloned().unwrap_or_default();
        let skip = limit.map_or(0, |limit| messages.len().saturating_sub(limit));
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn send_message(
        &self,
        request: PromptRequest,
        cancel: CancelSignal,
    ) -> Result<(), TransportError> {
        let mut state = self.record(
            MockOp::SendMessage,
            TransportCall::SendMessage {
                request: request.clone(),
            },
        )?;
        if cancel.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }

        let number = state.next_id();
        let user = WireMessage {
            info: MessageInfo::new(
                &request.message_id,
                &request.session_id,
                Role::User,
                BASE_TIME_MS + number as i64 * 1_000,
            ),
            parts: request
                .parts
                .iter()
                .map(|part| match part {
                    PromptPart::Text { id, text } => IncomingPart::text(id, text.as_str()),
                    PromptPart::File { id, mime, url, .. } => IncomingPart::new(id, "file")
                        .with_field("mime", mime.as_str())
                        .with_field("url", url.as_str()),
                })
                .collect(),
        };
        state
            .messages
            .entry(request.session_id.clone())
            .or_default()
            .push(user);
        self.queue_reply(&mut state, &request.session_id);
        Ok(())
    }

    async fn run_command(&self, request: CommandRequest) -> Result<CommandOutcome, TransportError> {
        let mut state = self.record(
            MockOp::RunCommand,
            TransportCall::RunCommand {
                request: request.clone(),
            },
        )?;
        let expanded_template = state
            .command_templates
            .get(&request.command)
            .map(|template| template.replace("$ARGUMENTS", &request.arguments));
        self.queue_reply(&mut state, &request.session_id);
        Ok(CommandOutcome { expanded_template })
    }

    async fn init_session(
        &self,
        session_id: &str,
        message_id: &str,
        _provider_id: &str,
        _model_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.record(
            MockOp::InitSession,
            TransportCall::InitSession {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            },
        )?;
        self.queue_reply(&mut state, session_id);
        Ok(())
    }

    async fn summarize_session(
        &self,
        session_id: &str,
        _provider_id: &str,
        _model_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.record(
            MockOp::SummarizeSession,
            TransportCall::SummarizeSession {
                session_id: session_id.to_string(),
            },
        )?;
        self.queue_reply(&mut state, session_id);
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> Result<bool, TransportError> {
        let mut state = self.record(
            MockOp::AbortSession,
            TransportCall::AbortSession {
                session_id: session_id.to_string(),
            },
        )?;
        state.outbox.clear();
        Ok(true)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;

    fn prompt(session_id: &str, message_id: &str, text: &str) -> PromptRequest {
        PromptRequest {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: MOCK_MODEL_ID.to_string(),
            agent: None,
            parts: vec![PromptPart::Text {
                id: "prt_user".to_string(),
                text: text.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn send_queues_streamed_reply_ending_in_completion() {
        let transport = MockTransport::new(vec!["Hel".to_string(), "lo".to_string()]);
        let session = transport
            .create_session(Some("demo".to_string()))
            .await
            .expect("create should succeed");

        transport
            .send_message(
                prompt(&session.id, "msg_user", "hi"),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .expect("send should succeed");

        let events = transport.take_events();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            ChatEvent::PartUpdated { part, role: Some(Role::Assistant), .. }
                if part.delta == Some(Value::from("Hel"))
        ));
        assert!(matches!(events.last(), Some(ChatEvent::MessageCompleted { .. })));
        assert!(transport.take_events().is_empty());

        let history = transport
            .get_session_messages(&session.id, None)
            .await
            .expect("history should load");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].info.id, "msg_user");
        assert_eq!(history[1].parts[0].text.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn scripted_failures_apply_once_and_calls_are_recorded() {
        let transport = MockTransport::default();
        transport.fail_next(MockOp::ListSessions, TransportError::Timeout);

        let first = transport.list_sessions().await;
        let second = transport.list_sessions().await;

        assert_eq!(first, Err(TransportError::Timeout));
        assert_eq!(second, Ok(Vec::new()));
        assert_eq!(
            transport.calls(),
            vec![TransportCall::ListSessions, TransportCall::ListSessions]
        );
    }

    #[tokio::test]
    async fn message_limit_returns_newest_messages() {
        let transport = MockTransport::default();
        let messages = (0..5)
            .map(|index| WireMessage {
                info: MessageInfo::new(format!("msg_{index}"), "ses_1", Role::User, index),
                parts: Vec::new(),
            })
            .collect();
        transport.seed_messages("ses_1", messages);

        let page = transport
            .get_session_messages("ses_1", Some(2))
            .await
            .expect("page should load");

        let ids: Vec<&str> = page.iter().map(|message| message.info.id.as_str()).collect();
        assert_eq!(ids, vec!["msg_3", "msg_4"]);
    }

    #[tokio::test]
    async fn command_templates_expand_arguments() {
        let transport =
            MockTransport::default().with_command_template("review", "Review $ARGUMENTS carefully");

        let outcome = transport
            .run_command(CommandRequest {
                session_id: "ses_1".to_string(),
                command: "review".to_string(),
                arguments: "src/lib.rs".to_string(),
                provider_id: MOCK_PROVIDER_ID.to_string(),
                model_id: MOCK_MODEL_ID.to_string(),
                agent: None,
            })
            .await
            .expect("command should run");

        assert_eq!(
            outcome.expanded_template.as_deref(),
            Some("Review src/lib.rs carefully")
        );
    }

    #[tokio::test]
    async fn cancelled_send_reports_cancellation() {
        let transport = MockTransport::default();
        let result = transport
            .send_message(
                prompt("ses_1", "msg_user", "hi"),
                Arc::new(AtomicBool::new(true)),
            )
            .await;

        assert_eq!(result, Err(TransportError::Cancelled));
        assert!(transport.take_events().is_empty());
    }
}
