//! Async operations over a shared [`ChatStore`].
//!
//! Each operation locks the store to plan, releases it for the network call,
//! then locks again to apply the result. The lock is never held across an
//! await point.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chat_protocol::{CancelSignal, ChatEvent, ChatTransport, Session, TransportError};
use tracing::{debug, info, warn};

use crate::commands::{parse_slash_command, SlashCommand};
use crate::config::MIN_TIMER_TICK;
use crate::error::{PersistenceError, StoreError};
use crate::memory::LoadDirection;
use crate::model::ModelSelection;
use crate::persistence::{self, StateStorage};
use crate::store::{Attachment, ChatStore, FiredTimers};

#[derive(Clone)]
pub struct SessionController {
    store: Arc<Mutex<ChatStore>>,
    transport: Arc<dyn ChatTransport>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl SessionController {
    pub fn new(store: ChatStore, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            transport,
            storage: None,
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Shared handle to the store, for readers such as a UI.
    pub fn store(&self) -> Arc<Mutex<ChatStore>> {
        Arc::clone(&self.store)
    }

    /// Runs `read` against the current store state.
    pub fn read<R>(&self, read: impl FnOnce(&ChatStore) -> R) -> R {
        read(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, ChatStore> {
        lock_unpoisoned(&self.store)
    }

    // ---- sessions -------------------------------------------------------

    pub async fn load_sessions(&self) -> Result<(), StoreError> {
        let sessions = self
            .transport
            .list_sessions()
            .await
            .map_err(|error| self.fail("loading sessions", error))?;
        debug!(count = sessions.len(), "loaded sessions");
        self.lock().set_sessions(sessions);
        self.persist_quietly();
        Ok(())
    }

    /// Creates a session on the backend and makes it current.
    pub async fn create_session(&self, title: Option<String>) -> Result<Session, StoreError> {
        let session = self
            .transport
            .create_session(title)
            .await
            .map_err(|error| self.fail("creating session", error))?;

        {
            let mut store = self.lock();
            store.upsert_session(session.clone());
            store.select_session(&session.id);
            store.load_messages(&session.id, Vec::new(), None);
        }
        info!(session_id = %session.id, "created session");
        self.persist_quietly();
        Ok(session)
    }

    /// Deletes a session. A session the backend no longer knows is removed locally too.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        match self.transport.delete_session(session_id).await {
            Ok(()) => {}
            Err(TransportError::NotFound(_)) => {
                debug!(session_id, "session already gone on the backend");
            }
            Err(error) => return Err(self.fail("deleting session", error)),
        }
        self.lock().remove_session(session_id);
        self.persist_quietly();
        Ok(())
    }

    pub async fn update_title(&self, session_id: &str, title: &str) -> Result<Session, StoreError> {
        let session = self
            .transport
            .update_session(session_id, title)
            .await
            .map_err(|error| self.fail("renaming session", error))?;
        self.apply_session(session.clone());
        Ok(session)
    }

    pub async fn share_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let session = self
            .transport
            .share_session(session_id)
            .await
            .map_err(|error| self.fail("sharing session", error))?;
        self.apply_session(session.clone());
        Ok(session)
    }

    pub async fn unshare_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let session = self
            .transport
            .unshare_session(session_id)
            .await
            .map_err(|error| self.fail("unsharing session", error))?;
        self.apply_session(session.clone());
        Ok(session)
    }

    /// Switches sessions, fetching history when the session is not resident.
    ///
    /// A session the backend reports missing is removed locally and
    /// [`StoreError::SessionNotFound`] is returned.
    pub async fn set_current_session(&self, session_id: &str) -> Result<(), StoreError> {
        let (needs_load, page_size) = {
            let mut store = self.lock();
            (store.select_session(session_id), store.config().history_page_size)
        };

        if needs_load {
            let messages = match self
                .transport
                .get_session_messages(session_id, Some(page_size))
                .await
            {
                Ok(messages) => messages,
                Err(TransportError::NotFound(_)) => {
                    warn!(session_id, "backend does not know the session; dropping it");
                    self.lock().remove_session(session_id);
                    self.persist_quietly();
                    return Err(StoreError::SessionNotFound(session_id.to_string()));
                }
                Err(error) => return Err(self.fail("loading messages", error)),
            };
            self.lock()
                .load_messages(session_id, messages, Some(page_size));
        }
        self.persist_quietly();
        Ok(())
    }

    /// Fetches older (`Up`) or newer (`Down`) history for the current session.
    pub async fn load_more(&self, direction: LoadDirection) -> Result<usize, StoreError> {
        let (session_id, limit) = {
            let store = self.lock();
            let session_id = store
                .current_session_id()
                .map(str::to_string)
                .ok_or(StoreError::NoCurrentSession)?;
            let limit = store.backfill_limit(&session_id, direction);
            (session_id, limit)
        };

        let messages = self
            .transport
            .get_session_messages(&session_id, Some(limit))
            .await
            .map_err(|error| self.fail("loading history", error))?;
        let added = self
            .lock()
            .apply_backfill(&session_id, direction, messages, limit);
        debug!(session_id = %session_id, ?direction, added, "applied history backfill");
        Ok(added)
    }

    // ---- sending --------------------------------------------------------

    /// Sends user input to the current session, creating one if none is selected.
    ///
    /// Input starting with `/` is dispatched as a command.
    pub async fn send_message(
        &self,
        text: &str,
        attachments: &[Attachment],
        selection: ModelSelection,
    ) -> Result<(), StoreError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        let session_id = self.current_or_new_session().await?;
        if attachments.is_empty() {
            if let Some(command) = parse_slash_command(text) {
                return self.run_command(&session_id, command, selection).await;
            }
        }

        let prepared = self
            .lock()
            .begin_send(&session_id, text, attachments, selection)?;
        let result = self
            .transport
            .send_message(prepared.request.clone(), Arc::clone(&prepared.cancel))
            .await;
        self.lock().finish_send(
            &session_id,
            Some(&prepared.message_id),
            &prepared.cancel,
            "sending message",
            result,
        )?;
        self.persist_quietly();
        Ok(())
    }

    async fn run_command(
        &self,
        session_id: &str,
        command: SlashCommand,
        selection: ModelSelection,
    ) -> Result<(), StoreError> {
        debug!(session_id, command = command.name(), "running command");
        match command {
            SlashCommand::Share => return self.share_session(session_id).await.map(drop),
            SlashCommand::Unshare => return self.unshare_session(session_id).await.map(drop),
            _ => {}
        }

        let prepared = self.lock().begin_command(session_id, selection);
        let (operation, result) = match &command {
            SlashCommand::Init => (
                "initializing session",
                self.transport
                    .init_session(
                        session_id,
                        &prepared.message_id,
                        &prepared.selection.provider_id,
                        &prepared.selection.model_id,
                    )
                    .await,
            ),
            SlashCommand::Summarize => (
                "summarizing session",
                self.transport
                    .summarize_session(
                        session_id,
                        &prepared.selection.provider_id,
                        &prepared.selection.model_id,
                    )
                    .await,
            ),
            SlashCommand::Custom { name, arguments } => {
                let outcome = self
                    .transport
                    .run_command(prepared.command_request(name, arguments))
                    .await;
                let result = outcome.map(|outcome| {
                    if let Some(template) = outcome.expanded_template {
                        self.lock().insert_synthetic_user_message(
                            session_id,
                            &prepared.message_id,
                            &template,
                            prepared.started_at,
                        );
                    }
                });
                ("running command", result)
            }
            SlashCommand::Share | SlashCommand::Unshare => ("sharing session", Ok(())),
        };

        self.lock()
            .finish_send(session_id, None, &prepared.cancel, operation, result)?;
        self.persist_quietly();
        Ok(())
    }

    /// Cancels the in-flight request and asks the backend to stop generating.
    ///
    /// Local busy state is cleared whether or not the backend acknowledges.
    /// Returns the backend's acknowledgement.
    pub async fn abort_current_operation(&self) -> Result<bool, StoreError> {
        let Some(session_id) = self.lock().begin_abort() else {
            return Ok(false);
        };

        match self.transport.abort_session(&session_id).await {
            Ok(acknowledged) => Ok(acknowledged),
            Err(error) => {
                warn!(session_id = %session_id, %error, "backend abort failed");
                Ok(false)
            }
        }
    }

    // ---- events and timers ----------------------------------------------

    pub fn handle_event(&self, event: ChatEvent) {
        self.lock().apply_event(event);
    }

    pub fn handle_events(&self, events: impl IntoIterator<Item = ChatEvent>) {
        let mut store = self.lock();
        for event in events {
            store.apply_event(event);
        }
    }

    pub fn fire_timers(&self) -> FiredTimers {
        self.lock().fire_due_timers()
    }

    /// Fires due timers until `shutdown` is set.
    ///
    /// Sleeps until the next deadline, but never longer than the configured tick.
    pub async fn drive_timers(&self, shutdown: CancelSignal) {
        while !shutdown.load(Ordering::SeqCst) {
            let wait = {
                let store = self.lock();
                let tick = store.config().timer_tick.max(MIN_TIMER_TICK);
                match store.next_deadline() {
                    Some(deadline) => {
                        let remaining = deadline.saturating_sub(store.now_ms()).max(0);
                        Duration::from_millis(u64::try_from(remaining).unwrap_or(0)).min(tick)
                    }
                    None => tick,
                }
            };
            tokio::time::sleep(wait).await;

            let fired = self.fire_timers();
            if !fired.zombies.is_empty() {
                info!(sessions = ?fired.zombies, "forced completion of stalled streams");
            }
        }
    }

    // ---- persistence ----------------------------------------------------

    pub fn persist(&self) -> Result<(), PersistenceError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let (key, encoded) = {
            let store = self.lock();
            (
                store.config().store_key.clone(),
                persistence::encode(&store.persisted_state())?,
            )
        };
        storage.save(&key, &encoded)
    }

    /// Loads persisted state into the store. Returns `false` when nothing was stored.
    pub fn restore(&self) -> Result<bool, PersistenceError> {
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        let key = self.lock().config().store_key.clone();
        let Some(raw) = storage.load(&key)? else {
            return Ok(false);
        };
        let state = persistence::decode(&raw)?;
        self.lock().restore(state);
        Ok(true)
    }

    fn persist_quietly(&self) {
        if let Err(error) = self.persist() {
            warn!(%error, "failed to persist chat state");
        }
    }

    // ---- helpers --------------------------------------------------------

    async fn current_or_new_session(&self) -> Result<String, StoreError> {
        let current = self.lock().current_session_id().map(str::to_string);
        match current {
            Some(session_id) => Ok(session_id),
            None => Ok(self.create_session(None).await?.id),
        }
    }

    fn apply_session(&self, session: Session) {
        self.lock().upsert_session(session);
        self.persist_quietly();
    }

    fn fail(&self, operation: &'static str, error: TransportError) -> StoreError {
        warn!(operation, %error, "backend request failed");
        self.lock().record_error(format!("{operation} failed: {error}"));
        StoreError::transport(operation, error)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
