//! Canonical session and message state.
//!
//! [`ChatStore`] is a synchronous state machine. Every inbound event, network
//! result and timer expiry is applied through one `&mut self` call, so no
//! partial update is ever observable. Network I/O lives in
//! [`SessionController`](crate::controller::SessionController), which plans
//! a request here, awaits it without holding the store, then applies the
//! result here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chat_protocol::{
    CancelSignal, ChatEvent, CommandRequest, IncomingPart, MessageInfo, PromptPart, PromptRequest,
    Role, Session, TransportError, WireMessage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{duration_ms, Clock, SystemClock};
use crate::config::StoreConfig;
use crate::context_usage::{
    latest_assistant, ContextLimitSource, ContextUsage, ContextUsageCache, UsageComputation,
};
use crate::error::StoreError;
use crate::lifecycle::{LifecycleEntry, StreamLifecycle, StreamPhase};
use crate::memory::{LoadDirection, MemoryLimits, MemoryManager, SessionMemoryState};
use crate::model::{insert_chronological, Message, ModelSelection, Part, PartBody};
use crate::normalize::{delta_text, normalize_part};
use crate::persistence::PersistedState;
use crate::timers::TimerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    ZombieCheck(String),
    TokenPoll(String),
}

impl TimerKey {
    fn session_id(&self) -> &str {
        match self {
            Self::ZombieCheck(session_id) | Self::TokenPoll(session_id) => session_id,
        }
    }
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime: String,
    pub filename: Option<String>,
    pub url: String,
}

impl Attachment {
    pub fn new(mime: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            filename: None,
            url: url.into(),
        }
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// A prompt ready to hand to the transport.
#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub session_id: String,
    pub message_id: String,
    pub request: PromptRequest,
    pub cancel: CancelSignal,
}

/// A command invocation ready to hand to the transport.
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub session_id: String,
    /// Id reserved for the command's prompt, and for any synthesized user message.
    pub message_id: String,
    pub started_at: i64,
    pub selection: ModelSelection,
    pub cancel: CancelSignal,
}

impl PreparedCommand {
    pub fn command_request(&self, command: &str, arguments: &str) -> CommandRequest {
        CommandRequest {
            session_id: self.session_id.clone(),
            command: command.to_string(),
            arguments: arguments.to_string(),
            provider_id: self.selection.provider_id.clone(),
            model_id: self.selection.model_id.clone(),
            agent: self.selection.agent.clone(),
        }
    }
}

/// What one [`ChatStore::fire_due_timers`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FiredTimers {
    /// Messages whose lifecycle settled and was dropped.
    pub settled: Vec<String>,
    /// Sessions flagged as zombie streams.
    pub zombies: Vec<String>,
    /// Sessions whose token counts were polled.
    pub polled: Vec<String>,
}

impl FiredTimers {
    pub fn is_empty(&self) -> bool {
        self.settled.is_empty() && self.zombies.is_empty() && self.polled.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ActiveSend {
    session_id: String,
    cancel: CancelSignal,
}

pub struct ChatStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    context_limits: Option<Arc<dyn ContextLimitSource>>,
    sessions: Vec<Session>,
    current_session_id: Option<String>,
    messages: HashMap<String, Vec<Message>>,
    pending_user_messages: HashSet<String>,
    /// Messages that were in flight when their session was flagged zombie.
    stalled_messages: HashSet<String>,
    model_selections: HashMap<String, ModelSelection>,
    lifecycle: StreamLifecycle,
    memory: MemoryManager,
    usage: ContextUsageCache,
    timers: TimerRegistry<TimerKey, ()>,
    token_poll_attempts: HashMap<String, u32>,
    /// Latest assistant message per session whose token poll ran out of attempts.
    token_poll_exhausted: HashMap<String, Option<String>>,
    loading_session: Option<String>,
    active_send: Option<ActiveSend>,
    streaming_message_id: Option<String>,
    error: Option<String>,
    revision: u64,
}

impl std::fmt::Debug for ChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStore")
            .field("sessions", &self.sessions.len())
            .field("current_session_id", &self.current_session_id)
            .field("resident_sessions", &self.messages.len())
            .field("loading_session", &self.loading_session)
            .field("streaming_message_id", &self.streaming_message_id)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl ChatStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let memory = MemoryManager::new(MemoryLimits::from(&config));
        Self {
            config,
            clock,
            context_limits: None,
            sessions: Vec::new(),
            current_session_id: None,
            messages: HashMap::new(),
            pending_user_messages: HashSet::new(),
            stalled_messages: HashSet::new(),
            model_selections: HashMap::new(),
            lifecycle: StreamLifecycle::new(),
            memory,
            usage: ContextUsageCache::new(),
            timers: TimerRegistry::new(),
            token_poll_attempts: HashMap::new(),
            token_poll_exhausted: HashMap::new(),
            loading_session: None,
            active_send: None,
            streaming_message_id: None,
            error: None,
            revision: 0,
        }
    }

    #[must_use]
    pub fn with_context_limits(mut self, source: Arc<dyn ContextLimitSource>) -> Self {
        self.context_limits = Some(source);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Increments on every observable change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session_id
            .as_deref()
            .and_then(|session_id| self.session(session_id))
    }

    /// Resident messages of a session, oldest first.
    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(session_id)
            .iter()
            .find(|message| message.id() == message_id)
    }

    pub fn is_resident(&self, session_id: &str) -> bool {
        self.messages.contains_key(session_id)
    }

    pub fn resident_session_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.messages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_loading(&self) -> bool {
        self.loading_session.is_some()
    }

    pub fn streaming_message_id(&self) -> Option<&str> {
        self.streaming_message_id.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.bump();
    }

    pub fn clear_error(&mut self) {
        if self.error.take().is_some() {
            self.bump();
        }
    }

    pub fn is_pending_user_message(&self, message_id: &str) -> bool {
        self.pending_user_messages.contains(message_id)
    }

    pub fn pending_user_message_ids(&self) -> &HashSet<String> {
        &self.pending_user_messages
    }

    pub fn model_selection(&self, session_id: &str) -> Option<&ModelSelection> {
        self.model_selections.get(session_id)
    }

    pub fn set_model_selection(&mut self, session_id: &str, selection: ModelSelection) {
        self.model_selections
            .insert(session_id.to_string(), selection);
        self.bump();
    }

    /// Phase of a message's stream; `None` once settled or never streamed.
    pub fn stream_phase(&self, message_id: &str) -> Option<StreamPhase> {
        self.lifecycle.phase(message_id)
    }

    pub fn lifecycle_entry(&self, message_id: &str) -> Option<&LifecycleEntry> {
        self.lifecycle.entry(message_id)
    }

    pub fn memory_state(&self, session_id: &str) -> Option<&SessionMemoryState> {
        self.memory.state(session_id)
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.memory.is_streaming(session_id)
    }

    pub fn is_zombie(&self, session_id: &str) -> bool {
        self.memory.is_zombie(session_id)
    }

    /// Earliest pending timer deadline across settlement, zombie and poll timers.
    pub fn next_deadline(&self) -> Option<i64> {
        match (self.lifecycle.next_deadline(), self.timers.next_deadline()) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (left, right) => left.or(right),
        }
    }

    // ---- sessions -------------------------------------------------------

    /// Replaces the session list with what the backend reported.
    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
        self.bump();
    }

    /// Inserts a new session at the top of the list or replaces an existing one.
    pub fn upsert_session(&mut self, session: Session) {
        match self
            .sessions
            .iter_mut()
            .find(|existing| existing.id == session.id)
        {
            Some(existing) => *existing = session,
            None => self.sessions.insert(0, session),
        }
        self.bump();
    }

    /// Drops a session and everything tracked for it.
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.id != session_id);
        let removed = self.sessions.len() != before;

        self.evict_session(session_id);
        self.usage.remove(session_id);
        self.model_selections.remove(session_id);
        if self.current_session_id.as_deref() == Some(session_id) {
            self.current_session_id = None;
        }
        if self.loading_session.as_deref() == Some(session_id) {
            self.loading_session = None;
        }
        if self
            .active_send
            .as_ref()
            .is_some_and(|active| active.session_id == session_id)
        {
            self.active_send = None;
        }
        self.bump();
        removed
    }

    /// Makes `session_id` current. Returns `true` when its messages still need loading.
    ///
    /// The outgoing session is windowed (unless it streams) and the memory
    /// cap is enforced.
    pub fn select_session(&mut self, session_id: &str) -> bool {
        let now = self.now_ms();
        if let Some(previous) = self.current_session_id.clone() {
            if previous != session_id {
                self.apply_window(&previous);
            }
        }

        self.current_session_id = Some(session_id.to_string());
        self.memory.touch_access(session_id, now);
        let needs_load = !self.messages.contains_key(session_id);
        self.enforce_memory_limits();
        self.bump();
        needs_load
    }

    /// Installs freshly fetched history for a session.
    ///
    /// Local messages missing from the fetch (optimistic or still streaming)
    /// are kept in chronological position.
    pub fn load_messages(&mut self, session_id: &str, wire: Vec<WireMessage>, limit: Option<usize>) {
        let now = self.now_ms();
        let fetched_count = wire.len();
        let fetched: Vec<Message> = wire.into_iter().map(message_from_wire).collect();
        let fetched_ids: HashSet<String> = fetched.iter().map(|message| message.id().to_string()).collect();

        let local = self.messages.remove(session_id).unwrap_or_default();
        let mut merged = fetched;
        for message in local {
            if !fetched_ids.contains(message.id()) {
                insert_chronological(&mut merged, message);
            }
        }

        let state = self.memory.state_mut(session_id, now);
        state.viewport_anchor = merged.len().saturating_sub(1);
        state.has_more_above = limit.is_some_and(|limit| fetched_count >= limit);
        state.total_available = Some(state.total_available.unwrap_or(0).max(fetched_count));
        self.messages.insert(session_id.to_string(), merged);

        if self.current_session_id.as_deref() == Some(session_id) {
            self.apply_window(session_id);
        }
        self.enforce_memory_limits();
        self.bump();
    }

    /// Replaces a session's messages wholesale after an external change.
    pub fn sync_session(&mut self, session_id: &str, wire: Vec<WireMessage>) {
        let synced: Vec<Message> = wire.into_iter().map(message_from_wire).collect();
        let kept: HashSet<&str> = synced.iter().map(Message::id).collect();

        if let Some(previous) = self.messages.get(session_id) {
            let dropped: Vec<String> = previous
                .iter()
                .filter(|message| !kept.contains(message.id()))
                .map(|message| message.id().to_string())
                .collect();
            for message_id in &dropped {
                self.lifecycle.remove(message_id);
                self.pending_user_messages.remove(message_id);
                self.stalled_messages.remove(message_id);
                if self.streaming_message_id.as_deref() == Some(message_id.as_str()) {
                    self.streaming_message_id = None;
                }
            }
            if !dropped.is_empty() {
                debug!(session_id, dropped = dropped.len(), "sync removed messages");
            }
        }

        let now = self.now_ms();
        let len = synced.len();
        let state = self.memory.state_mut(session_id, now);
        state.viewport_anchor = state.viewport_anchor.min(len.saturating_sub(1));
        self.messages.insert(session_id.to_string(), synced);
        self.bump();
    }

    /// Records where the user is looking in the active session.
    pub fn update_viewport_anchor(&mut self, session_id: &str, index: usize) {
        let now = self.now_ms();
        let last = self.messages(session_id).len().saturating_sub(1);
        let state = self.memory.state_mut(session_id, now);
        state.viewport_anchor = index.min(last);
        state.last_accessed_at = state.last_accessed_at.max(now);
        self.bump();
    }

    // ---- memory ---------------------------------------------------------

    /// Trims a session to its viewport window unless it is streaming.
    pub fn apply_window(&mut self, session_id: &str) -> usize {
        let Some(messages) = self.messages.get_mut(session_id) else {
            return 0;
        };
        let removed = self.memory.apply_window(session_id, messages);
        self.forget_messages(&removed);
        removed.len()
    }

    /// Evicts least recently used sessions beyond the resident cap.
    pub fn enforce_memory_limits(&mut self) -> Vec<String> {
        let victims = self.memory.eviction_victims(
            self.messages.keys().map(String::as_str),
            self.current_session_id.as_deref(),
        );
        for session_id in &victims {
            info!(session_id = %session_id, "evicting least recently used session");
            self.evict_session(session_id);
        }
        victims
    }

    /// Size of the history request for a backfill in `direction`.
    pub fn backfill_limit(&self, session_id: &str, direction: LoadDirection) -> usize {
        let page = self.config.history_page_size.max(1);
        match direction {
            LoadDirection::Up => self.messages(session_id).len() + page,
            LoadDirection::Down => page,
        }
    }

    /// Splices a backfill response into the session. Returns how many messages were added.
    pub fn apply_backfill(
        &mut self,
        session_id: &str,
        direction: LoadDirection,
        wire: Vec<WireMessage>,
        limit: usize,
    ) -> usize {
        let now = self.now_ms();
        let has_more_above = wire.len() >= limit;
        let fetched: Vec<Message> = wire.into_iter().map(message_from_wire).collect();
        let messages = self.messages.entry(session_id.to_string()).or_default();
        let added = self.memory.merge_backfill(
            session_id,
            messages,
            fetched,
            direction,
            has_more_above,
            now,
        );
        self.bump();
        added
    }

    fn evict_session(&mut self, session_id: &str) {
        if let Some(messages) = self.messages.remove(session_id) {
            self.forget_messages(&messages);
        }
        self.memory.remove(session_id);
        self.timers.cancel_where(|key| key.session_id() == session_id);
        self.token_poll_attempts.remove(session_id);
        self.token_poll_exhausted.remove(session_id);
    }

    fn forget_messages(&mut self, messages: &[Message]) {
        for message in messages {
            self.lifecycle.remove(message.id());
            self.pending_user_messages.remove(message.id());
            self.stalled_messages.remove(message.id());
            if self.streaming_message_id.as_deref() == Some(message.id()) {
                self.streaming_message_id = None;
            }
        }
    }

    // ---- sending --------------------------------------------------------

    /// Inserts the optimistic user message and marks the session busy.
    pub fn begin_send(
        &mut self,
        session_id: &str,
        text: &str,
        attachments: &[Attachment],
        selection: ModelSelection,
    ) -> Result<PreparedSend, StoreError> {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let now = self.now_ms();
        let message_id = new_message_id();
        let mut parts = Vec::new();
        let mut prompt_parts = Vec::new();

        if !text.is_empty() {
            let part_id = new_part_id();
            parts.push(Part::text(&part_id, &message_id, session_id, text));
            prompt_parts.push(PromptPart::Text {
                id: part_id,
                text: text.to_string(),
            });
        }
        for attachment in attachments {
            let part_id = new_part_id();
            parts.push(Part {
                id: part_id.clone(),
                message_id: message_id.clone(),
                session_id: session_id.to_string(),
                body: PartBody::File {
                    mime: attachment.mime.clone(),
                    filename: attachment.filename.clone(),
                    url: attachment.url.clone(),
                },
            });
            prompt_parts.push(PromptPart::File {
                id: part_id,
                mime: attachment.mime.clone(),
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
            });
        }

        let mut info = MessageInfo::new(&message_id, session_id, Role::User, now)
            .with_model(&selection.provider_id, &selection.model_id);
        info.mode = selection.agent.clone();
        self.pending_user_messages.insert(message_id.clone());
        self.insert_message(session_id, Message::new(info).with_parts(parts));

        let request = PromptRequest {
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            provider_id: selection.provider_id.clone(),
            model_id: selection.model_id.clone(),
            agent: selection.agent.clone(),
            parts: prompt_parts,
        };
        let cancel = self.begin_activity(session_id, selection, now);

        Ok(PreparedSend {
            session_id: session_id.to_string(),
            message_id,
            request,
            cancel,
        })
    }

    /// Marks the session busy for a backend command.
    pub fn begin_command(&mut self, session_id: &str, selection: ModelSelection) -> PreparedCommand {
        let now = self.now_ms();
        let cancel = self.begin_activity(session_id, selection.clone(), now);
        PreparedCommand {
            session_id: session_id.to_string(),
            message_id: new_message_id(),
            started_at: now,
            selection,
            cancel,
        }
    }

    /// Inserts a locally rendered user message, e.g. a command's expanded template.
    ///
    /// It is dated `created_at` so it sorts before the reply it triggered.
    pub fn insert_synthetic_user_message(
        &mut self,
        session_id: &str,
        message_id: &str,
        text: &str,
        created_at: i64,
    ) {
        let mut part = Part::text(new_part_id(), message_id, session_id, text);
        part.body = PartBody::Text {
            text: text.to_string(),
            synthetic: true,
        };
        let message = Message::new(MessageInfo::new(message_id, session_id, Role::User, created_at))
            .with_parts(vec![part]);
        self.pending_user_messages.insert(message_id.to_string());
        self.insert_message(session_id, message);
        self.bump();
    }

    /// Applies the outcome of a send or command request.
    ///
    /// Gateway timeouts keep the session streaming since the reply may still
    /// arrive on the event stream. Cancellation clears busy state quietly.
    /// Any other failure is recorded in [`error`](Self::error) and returned.
    /// A result for a request that is no longer the active one only releases
    /// its pending message; it never touches the newer request's state.
    pub fn finish_send(
        &mut self,
        session_id: &str,
        pending_message_id: Option<&str>,
        cancel: &CancelSignal,
        operation: &'static str,
        result: Result<(), TransportError>,
    ) -> Result<(), StoreError> {
        if let Some(message_id) = pending_message_id {
            self.pending_user_messages.remove(message_id);
        }
        let is_active = self
            .active_send
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.cancel, cancel));
        if is_active {
            self.active_send = None;
        }

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(error) if !is_active => {
                debug!(session_id, operation, %error, "ignoring result of a superseded request");
                if error.is_cancelled() || error.is_gateway_timeout() {
                    Ok(())
                } else {
                    Err(StoreError::transport(operation, error))
                }
            }
            Err(error) if error.is_gateway_timeout() => {
                info!(session_id, operation, "gateway timed out; relying on the event stream");
                Ok(())
            }
            Err(error) if error.is_cancelled() => {
                debug!(session_id, operation, "request cancelled");
                self.stop_activity(session_id);
                Ok(())
            }
            Err(error) => {
                warn!(session_id, operation, %error, "request failed");
                self.error = Some(if error.is_timeout() {
                    format!("{operation} timed out; please try again")
                } else {
                    format!("{operation} failed: {error}")
                });
                self.stop_activity(session_id);
                Err(StoreError::transport(operation, error))
            }
        };
        self.bump();
        outcome
    }

    /// Cancels the in-flight request and clears busy state.
    ///
    /// Returns the session the backend should be asked to abort.
    pub fn begin_abort(&mut self) -> Option<String> {
        let session_id = self
            .active_send
            .as_ref()
            .map(|active| active.session_id.clone())
            .or_else(|| self.loading_session.clone())
            .or_else(|| {
                self.current_session_id
                    .clone()
                    .filter(|session_id| self.memory.is_streaming(session_id))
            })?;

        if let Some(active) = self.active_send.take() {
            active.cancel.store(true, Ordering::SeqCst);
        }

        let now = self.now_ms();
        let settlement = duration_ms(self.config.settlement_delay);
        for message_id in self.tracked_message_ids(&session_id) {
            self.lifecycle.mark_cooldown(&message_id, now);
            self.lifecycle
                .schedule_settlement(&message_id, settlement, now);
        }
        self.stop_activity(&session_id);
        info!(session_id = %session_id, "aborted current operation");
        Some(session_id)
    }

    fn begin_activity(&mut self, session_id: &str, selection: ModelSelection, now: i64) -> CancelSignal {
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        self.active_send = Some(ActiveSend {
            session_id: session_id.to_string(),
            cancel: Arc::clone(&cancel),
        });
        self.loading_session = Some(session_id.to_string());
        self.streaming_message_id = None;
        self.error = None;
        self.model_selections
            .insert(session_id.to_string(), selection);
        self.memory.touch_access(session_id, now);
        self.memory.begin_stream(session_id, now);
        self.arm_zombie_check(session_id, now);
        self.bump();
        cancel
    }

    fn stop_activity(&mut self, session_id: &str) {
        if self.loading_session.as_deref() == Some(session_id) {
            self.loading_session = None;
        }
        if let Some(message_id) = self.streaming_message_id.clone() {
            if self.messages(session_id).iter().any(|message| message.id() == message_id) {
                self.streaming_message_id = None;
            }
        }
        self.memory.end_stream(session_id);
        self.timers
            .cancel(&TimerKey::ZombieCheck(session_id.to_string()));
        self.bump();
    }

    // ---- inbound stream -------------------------------------------------

    /// Applies any inbound event.
    pub fn apply_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::PartUpdated {
                session_id,
                message_id,
                part,
                role,
            } => {
                self.add_streaming_part(&session_id, &message_id, part, role);
            }
            ChatEvent::MessageUpdated { info } => self.update_message_info(info),
            ChatEvent::MessageCompleted {
                session_id,
                message_id,
            } => self.complete_streaming_message(&session_id, &message_id),
            ChatEvent::MessageRemoved {
                session_id,
                message_id,
            } => {
                self.remove_message(&session_id, &message_id);
            }
            ChatEvent::PartRemoved {
                session_id,
                message_id,
                part_id,
            } => {
                self.remove_part(&session_id, &message_id, &part_id);
            }
            ChatEvent::SessionSynced {
                session_id,
                messages,
            } => self.sync_session(&session_id, messages),
            ChatEvent::SessionUpdated { session } => self.upsert_session(session),
            ChatEvent::SessionDeleted { session_id } => {
                self.remove_session(&session_id);
            }
            ChatEvent::SessionIdle { session_id } => self.session_idle(&session_id),
        }
    }

    /// Hot path for streamed parts. Returns whether the part was applied.
    ///
    /// Parts aimed at pending optimistic messages, parts for zombie streams,
    /// assistant updates to user messages and echoed user text are dropped.
    pub fn add_streaming_part(
        &mut self,
        session_id: &str,
        message_id: &str,
        incoming: IncomingPart,
        role: Option<Role>,
    ) -> bool {
        if self.pending_user_messages.contains(message_id) {
            debug!(session_id, message_id, "ignoring part for pending user message");
            return false;
        }

        let now = self.now_ms();
        if self.memory.zombie_due(session_id, now) {
            self.flag_zombie(session_id);
        }
        if self.stalled_messages.contains(message_id) {
            debug!(session_id, message_id, "dropping part for stalled message");
            return false;
        }
        if self.memory.is_zombie(session_id) {
            if self.message_index(session_id, message_id).is_some() {
                debug!(session_id, message_id, "dropping part for zombie stream");
                if self.lifecycle.phase(message_id) == Some(StreamPhase::Streaming) {
                    self.complete_streaming_message(session_id, message_id);
                }
                return false;
            }
            // A message the stalled stream never produced starts a new turn.
            info!(session_id, message_id, "new message after zombie stream; resuming");
            self.memory.clear_zombie(session_id);
        }

        let index = match self.message_index(session_id, message_id) {
            Some(index) => {
                let existing = &self.messages(session_id)[index];
                if existing.is_user() && role == Some(Role::Assistant) {
                    debug!(session_id, message_id, "refusing assistant update to a user message");
                    return false;
                }
                if existing.is_user() && existing.parts.is_empty() && self.is_user_echo(session_id, &incoming) {
                    debug!(session_id, message_id, "dropping echoed user message");
                    self.remove_message(session_id, message_id);
                    return false;
                }
                index
            }
            None => {
                let role = role.unwrap_or(Role::Assistant);
                if role == Role::User && self.is_user_echo(session_id, &incoming) {
                    debug!(session_id, message_id, "dropping echoed user message");
                    return false;
                }
                let message = Message::new(MessageInfo::new(message_id, session_id, role, now));
                self.insert_message(session_id, message)
            }
        };

        let Some(message) = self
            .messages
            .get_mut(session_id)
            .and_then(|messages| messages.get_mut(index))
        else {
            return false;
        };
        let normalized = normalize_part(&incoming, message.part(&incoming.id), message_id, session_id);
        let is_step_finish = normalized.is_step_finish();
        message.upsert_part(normalized);

        if message.is_assistant() {
            self.track_assistant_activity(session_id, message_id, is_step_finish, now);
        }
        self.trim_background_stream(session_id);
        self.bump();
        true
    }

    /// Merges message metadata, creating the message when it is new.
    pub fn update_message_info(&mut self, info: MessageInfo) {
        let session_id = info.session_id.clone();
        match self.message_index(&session_id, &info.id) {
            Some(index) => {
                if let Some(message) = self
                    .messages
                    .get_mut(&session_id)
                    .and_then(|messages| messages.get_mut(index))
                {
                    message.merge_info(info);
                }
            }
            None => {
                if !self.is_resident(&session_id)
                    && self.current_session_id.as_deref() != Some(session_id.as_str())
                {
                    return;
                }
                self.insert_message(&session_id, Message::new(info));
            }
        }
        self.bump();
    }

    /// Terminal signal for an assistant message: cooldown, settlement and usage refresh.
    pub fn complete_streaming_message(&mut self, session_id: &str, message_id: &str) {
        let now = self.now_ms();
        self.lifecycle.mark_cooldown(message_id, now);
        self.lifecycle.schedule_settlement(
            message_id,
            duration_ms(self.config.settlement_delay),
            now,
        );

        if self.streaming_message_id.as_deref() == Some(message_id) {
            self.streaming_message_id = None;
        }
        if self.loading_session.as_deref() == Some(session_id) {
            self.loading_session = None;
        }
        self.memory.end_stream(session_id);
        self.timers
            .cancel(&TimerKey::ZombieCheck(session_id.to_string()));

        self.refresh_context_usage(session_id);
        if self.current_session_id.as_deref() == Some(session_id) {
            self.apply_window(session_id);
        }
        self.bump();
    }

    pub fn remove_message(&mut self, session_id: &str, message_id: &str) -> bool {
        let Some(messages) = self.messages.get_mut(session_id) else {
            return false;
        };
        let Some(index) = messages.iter().position(|message| message.id() == message_id) else {
            return false;
        };
        let removed = messages.remove(index);
        self.forget_messages(std::slice::from_ref(&removed));
        let now = self.now_ms();
        let state = self.memory.state_mut(session_id, now);
        if state.viewport_anchor > index {
            state.viewport_anchor -= 1;
        }
        self.bump();
        true
    }

    pub fn remove_part(&mut self, session_id: &str, message_id: &str, part_id: &str) -> bool {
        let removed = self
            .messages
            .get_mut(session_id)
            .and_then(|messages| messages.iter_mut().find(|message| message.id() == message_id))
            .is_some_and(|message| message.remove_part(part_id));
        if removed {
            self.bump();
        }
        removed
    }

    /// The backend reports the session idle: finish whatever still streams.
    pub fn session_idle(&mut self, session_id: &str) {
        let streaming: Vec<String> = self
            .tracked_message_ids(session_id)
            .into_iter()
            .filter(|message_id| self.lifecycle.phase(message_id) == Some(StreamPhase::Streaming))
            .collect();
        for message_id in &streaming {
            self.complete_streaming_message(session_id, message_id);
        }
        if streaming.is_empty() {
            self.stop_activity(session_id);
        }

        let settled: Vec<String> = self
            .messages(session_id)
            .iter()
            .filter(|message| self.pending_user_messages.contains(message.id()))
            .map(|message| message.id().to_string())
            .collect();
        for message_id in settled {
            self.pending_user_messages.remove(&message_id);
        }
        if self.memory.clear_zombie(session_id) {
            debug!(session_id, "session idle; zombie flag cleared");
        }
        self.bump();
    }

    fn track_assistant_activity(&mut self, session_id: &str, message_id: &str, is_step_finish: bool, now: i64) {
        if self.lifecycle.touch(message_id, now) && self.loading_session.as_deref() == Some(session_id) {
            self.loading_session = None;
            self.streaming_message_id = Some(message_id.to_string());
        }
        if !self.memory.is_streaming(session_id) {
            self.memory.begin_stream(session_id, now);
            self.arm_zombie_check(session_id, now);
        }
        if is_step_finish {
            self.lifecycle.mark_cooldown(message_id, now);
            self.lifecycle.schedule_settlement(
                message_id,
                duration_ms(self.config.settlement_delay),
                now,
            );
        }
    }

    fn trim_background_stream(&mut self, session_id: &str) {
        if self.current_session_id.as_deref() == Some(session_id) || !self.memory.is_streaming(session_id) {
            return;
        }
        let Some(messages) = self.messages.get_mut(session_id) else {
            return;
        };
        let removed = self.memory.trim_background(session_id, messages);
        self.forget_messages(&removed);
    }

    fn insert_message(&mut self, session_id: &str, message: Message) -> usize {
        let now = self.now_ms();
        let background = self.current_session_id.as_deref() != Some(session_id)
            && self.memory.is_streaming(session_id);
        let messages = self.messages.entry(session_id.to_string()).or_default();
        let previous_len = messages.len();
        let index = insert_chronological(messages, message);

        let state = self.memory.state_mut(session_id, now);
        if background {
            state.background_message_count += 1;
        }
        let at_tail = state.viewport_anchor + 1 >= previous_len;
        if at_tail && index == previous_len {
            state.viewport_anchor = index;
        } else if previous_len > 0 && index <= state.viewport_anchor {
            state.viewport_anchor += 1;
        }
        index
    }

    fn is_user_echo(&self, session_id: &str, incoming: &IncomingPart) -> bool {
        let text = match (&incoming.text, incoming.delta.as_ref().and_then(delta_text)) {
            (Some(text), _) => text.clone(),
            (None, Some(delta)) => delta,
            (None, None) => return false,
        };
        let text = text.trim();
        !text.is_empty()
            && self.messages(session_id).iter().any(|message| {
                self.pending_user_messages.contains(message.id()) && message.text().trim() == text
            })
    }

    fn message_index(&self, session_id: &str, message_id: &str) -> Option<usize> {
        self.messages(session_id)
            .iter()
            .position(|message| message.id() == message_id)
    }

    fn tracked_message_ids(&self, session_id: &str) -> Vec<String> {
        self.messages(session_id)
            .iter()
            .filter(|message| self.lifecycle.is_tracked(message.id()))
            .map(|message| message.id().to_string())
            .collect()
    }

    // ---- timers ---------------------------------------------------------

    /// Fires every timer due now: settlements, zombie checks and token polls.
    pub fn fire_due_timers(&mut self) -> FiredTimers {
        let now = self.now_ms();
        let mut fired = FiredTimers {
            settled: self.lifecycle.settle_due(now),
            ..FiredTimers::default()
        };

        for (key, ()) in self.timers.drain_due(now) {
            match key {
                TimerKey::ZombieCheck(session_id) => {
                    if self.memory.zombie_due(&session_id, now) {
                        self.flag_zombie(&session_id);
                        fired.zombies.push(session_id);
                    } else if let Some(deadline) = self.memory.zombie_deadline(&session_id) {
                        self.timers
                            .arm(TimerKey::ZombieCheck(session_id), deadline, ());
                    }
                }
                TimerKey::TokenPoll(session_id) => {
                    self.poll_tokens(&session_id);
                    fired.polled.push(session_id);
                }
            }
        }

        if !fired.is_empty() {
            self.bump();
        }
        fired
    }

    fn arm_zombie_check(&mut self, session_id: &str, now: i64) {
        let deadline = now.saturating_add(duration_ms(self.config.zombie_timeout));
        self.timers
            .arm(TimerKey::ZombieCheck(session_id.to_string()), deadline, ());
    }

    fn flag_zombie(&mut self, session_id: &str) {
        warn!(session_id, "stream exceeded zombie timeout; forcing completion");
        let in_flight: Vec<String> = self
            .tracked_message_ids(session_id)
            .into_iter()
            .filter(|message_id| self.lifecycle.phase(message_id) == Some(StreamPhase::Streaming))
            .collect();

        self.memory.flag_zombie(session_id);
        self.stalled_messages.extend(in_flight.iter().cloned());
        for message_id in &in_flight {
            self.complete_streaming_message(session_id, message_id);
        }
        if in_flight.is_empty() {
            self.stop_activity(session_id);
        }
    }

    // ---- context usage --------------------------------------------------

    /// Cached context usage of a session; `None` when no limit is known.
    pub fn context_usage(&mut self, session_id: &str) -> Option<ContextUsage> {
        let limit = self.context_limit_for(session_id)?;
        let messages = self
            .messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let computation = self.usage.compute(session_id, messages, limit);
        if computation.needs_poll
            && !self
                .timers
                .is_armed(&TimerKey::TokenPoll(session_id.to_string()))
        {
            self.start_token_poll(session_id);
        }
        computation.usage
    }

    /// Recomputes usage from the latest assistant message, bypassing the cache.
    pub fn refresh_context_usage(&mut self, session_id: &str) -> Option<ContextUsage> {
        let computation = self.recompute_usage(session_id)?;
        if computation.needs_poll {
            self.start_token_poll(session_id);
        } else {
            self.stop_token_poll(session_id);
        }
        computation.usage
    }

    fn recompute_usage(&mut self, session_id: &str) -> Option<UsageComputation> {
        let limit = self.context_limit_for(session_id)?;
        let messages = self
            .messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Some(self.usage.recompute(session_id, messages, limit))
    }

    fn context_limit_for(&self, session_id: &str) -> Option<u64> {
        let source = self.context_limits.as_ref()?;
        let (provider_id, model_id) = match self.model_selections.get(session_id) {
            Some(selection) => (selection.provider_id.as_str(), selection.model_id.as_str()),
            None => {
                let latest = latest_assistant(self.messages(session_id))?;
                (
                    latest.info.provider_id.as_deref()?,
                    latest.info.model_id.as_deref()?,
                )
            }
        };
        source
            .context_limit(provider_id, model_id)
            .filter(|limit| *limit > 0)
    }

    fn start_token_poll(&mut self, session_id: &str) {
        if self.config.token_poll_max_attempts == 0 {
            return;
        }
        if let Some(exhausted) = self.token_poll_exhausted.get(session_id) {
            if *exhausted == self.latest_assistant_id(session_id) {
                return;
            }
            self.token_poll_exhausted.remove(session_id);
        }
        self.token_poll_attempts.insert(session_id.to_string(), 0);
        self.arm_token_poll(session_id);
    }

    fn latest_assistant_id(&self, session_id: &str) -> Option<String> {
        latest_assistant(self.messages(session_id)).map(|message| message.id().to_string())
    }

    fn stop_token_poll(&mut self, session_id: &str) {
        self.token_poll_attempts.remove(session_id);
        self.timers
            .cancel(&TimerKey::TokenPoll(session_id.to_string()));
    }

    fn arm_token_poll(&mut self, session_id: &str) {
        let deadline = self
            .now_ms()
            .saturating_add(duration_ms(self.config.token_poll_interval));
        self.timers
            .arm(TimerKey::TokenPoll(session_id.to_string()), deadline, ());
    }

    fn poll_tokens(&mut self, session_id: &str) {
        let attempt = {
            let attempts = self
                .token_poll_attempts
                .entry(session_id.to_string())
                .or_insert(0);
            *attempts += 1;
            *attempts
        };

        let needs_poll = self
            .recompute_usage(session_id)
            .is_some_and(|computation| computation.needs_poll);
        if needs_poll && attempt < self.config.token_poll_max_attempts {
            self.arm_token_poll(session_id);
        } else {
            if needs_poll {
                debug!(session_id, attempt, "token counts still empty; giving up polling");
                let tail = self.latest_assistant_id(session_id);
                self.token_poll_exhausted.insert(session_id.to_string(), tail);
            }
            self.token_poll_attempts.remove(session_id);
        }
    }

    // ---- persistence ----------------------------------------------------

    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            sessions: self.sessions.clone(),
            current_session_id: self.current_session_id.clone(),
            model_selections: self.model_selections.clone(),
            context_usage: self.usage.snapshots().clone(),
        }
    }

    /// Restores persisted fields. Messages are not persisted and load on selection.
    pub fn restore(&mut self, state: PersistedState) {
        if !state.sessions.is_empty() || self.sessions.is_empty() {
            self.sessions = state.sessions;
        }
        self.current_session_id = state.current_session_id;
        self.model_selections = state.model_selections;
        self.usage.restore(state.context_usage);
        self.bump();
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

/// Builds a stored message from a full backend record.
pub fn message_from_wire(wire: WireMessage) -> Message {
    let session_id = wire.info.session_id.clone();
    let message_id = wire.info.id.clone();
    let mut message = Message::new(wire.info);
    for incoming in &wire.parts {
        let part = normalize_part(incoming, message.part(&incoming.id), &message_id, &session_id);
        message.upsert_part(part);
    }
    message
}

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

pub fn new_part_id() -> String {
    format!("prt_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_protocol::{IncomingPart, MessageInfo, Role, Session, WireMessage};

    use super::{message_from_wire, new_message_id, ChatStore};
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;

    fn store() -> ChatStore {
        ChatStore::with_clock(StoreConfig::default(), Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let first = new_message_id();
        assert!(first.starts_with("msg_"));
        assert_ne!(first, new_message_id());
    }

    #[test]
    fn wire_messages_materialise_text() {
        let message = message_from_wire(WireMessage {
            info: MessageInfo::new("msg_1", "ses_1", Role::Assistant, 5),
            parts: vec![
                IncomingPart::text_delta("prt_1", "Hel"),
                IncomingPart::text_delta("prt_1", "lo"),
            ],
        });
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.text(), "Hello");
    }

    #[test]
    fn upsert_session_replaces_in_place_and_prepends_new() {
        let mut store = store();
        store.set_sessions(vec![Session::new("ses_1", "one"), Session::new("ses_2", "two")]);

        store.upsert_session(Session::new("ses_2", "renamed"));
        store.upsert_session(Session::new("ses_3", "three"));

        let titles: Vec<&str> = store.sessions().iter().map(|session| session.title.as_str()).collect();
        assert_eq!(titles, vec!["three", "one", "renamed"]);
    }

    #[test]
    fn revision_advances_on_mutation() {
        let mut store = store();
        let before = store.revision();
        store.record_error("boom");
        assert!(store.revision() > before);
        assert_eq!(store.error(), Some("boom"));
        store.clear_error();
        assert_eq!(store.error(), None);
    }
}
