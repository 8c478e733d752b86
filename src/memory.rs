//! Bounds on resident message history.
//!
//! Four policies live here: an LRU cap on resident sessions, a viewport window
//! for the active session, a drop-oldest buffer for sessions streaming in the
//! background, and a watchdog for streams that never finish. The store owns
//! the message lists and applies whatever these functions decide.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::clock::duration_ms;
use crate::config::StoreConfig;
use crate::model::{insert_chronological, Message};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMemoryState {
    /// Index of the message the user is looking at, relative to the resident list.
    pub viewport_anchor: usize,
    pub is_streaming: bool,
    pub stream_started_at: Option<i64>,
    pub last_accessed_at: i64,
    /// Messages created while the session streamed in the background.
    pub background_message_count: usize,
    /// Messages known to exist on the server, when reported.
    pub total_available: Option<usize>,
    pub has_more_above: bool,
    pub is_zombie: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDirection {
    /// Older history, before the first resident message.
    Up,
    /// Newer history, after the last resident message.
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_sessions: usize,
    pub viewport_messages: usize,
    pub background_streaming_buffer: usize,
    pub zombie_timeout_ms: i64,
}

impl From<&StoreConfig> for MemoryLimits {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_sessions: config.max_sessions.max(1),
            viewport_messages: config.viewport_messages.max(1),
            background_streaming_buffer: config.background_streaming_buffer.max(1),
            zombie_timeout_ms: duration_ms(config.zombie_timeout),
        }
    }
}

#[derive(Debug)]
pub struct MemoryManager {
    limits: MemoryLimits,
    states: HashMap<String, SessionMemoryState>,
}

impl MemoryManager {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            states: HashMap::new(),
        }
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    pub fn state(&self, session_id: &str) -> Option<&SessionMemoryState> {
        self.states.get(session_id)
    }

    /// State for `session_id`, created on first access.
    pub fn state_mut(&mut self, session_id: &str, now_ms: i64) -> &mut SessionMemoryState {
        self.states
            .entry(session_id.to_string())
            .or_insert_with(|| SessionMemoryState {
                last_accessed_at: now_ms,
                ..SessionMemoryState::default()
            })
    }

    pub fn touch_access(&mut self, session_id: &str, now_ms: i64) {
        let state = self.state_mut(session_id, now_ms);
        state.last_accessed_at = state.last_accessed_at.max(now_ms);
    }

    pub fn begin_stream(&mut self, session_id: &str, now_ms: i64) {
        let state = self.state_mut(session_id, now_ms);
        state.is_streaming = true;
        state.stream_started_at = Some(now_ms);
        state.is_zombie = false;
    }

    pub fn end_stream(&mut self, session_id: &str) {
        if let Some(state) = self.states.get_mut(session_id) {
            state.is_streaming = false;
            state.stream_started_at = None;
            state.background_message_count = 0;
        }
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.states
            .get(session_id)
            .is_some_and(|state| state.is_streaming)
    }

    pub fn is_zombie(&self, session_id: &str) -> bool {
        self.states
            .get(session_id)
            .is_some_and(|state| state.is_zombie)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SessionMemoryState> {
        self.states.remove(session_id)
    }

    /// Whether the session has streamed past the zombie timeout without being flagged yet.
    pub fn zombie_due(&self, session_id: &str, now_ms: i64) -> bool {
        self.states.get(session_id).is_some_and(|state| {
            state.is_streaming
                && !state.is_zombie
                && state
                    .stream_started_at
                    .is_some_and(|started| now_ms.saturating_sub(started) >= self.limits.zombie_timeout_ms)
        })
    }

    /// Flags the session zombie and ends its stream.
    pub fn flag_zombie(&mut self, session_id: &str) {
        if let Some(state) = self.states.get_mut(session_id) {
            state.is_zombie = true;
            state.is_streaming = false;
            state.stream_started_at = None;
        }
    }

    /// Lifts the zombie flag once the backend shows the session is alive again.
    pub fn clear_zombie(&mut self, session_id: &str) -> bool {
        self.states
            .get_mut(session_id)
            .is_some_and(|state| std::mem::take(&mut state.is_zombie))
    }

    pub fn zombie_deadline(&self, session_id: &str) -> Option<i64> {
        self.states
            .get(session_id)
            .and_then(|state| state.stream_started_at)
            .map(|started| started.saturating_add(self.limits.zombie_timeout_ms))
    }

    /// Sessions to evict so that at most `max_sessions` stay resident.
    ///
    /// Least recently accessed first, ties broken by id. The current session
    /// and streaming sessions are never chosen, so the result may be short.
    pub fn eviction_victims<'a>(
        &self,
        resident: impl IntoIterator<Item = &'a str>,
        current: Option<&str>,
    ) -> Vec<String> {
        let resident: Vec<&str> = resident.into_iter().collect();
        let excess = resident.len().saturating_sub(self.limits.max_sessions);
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(i64, &str)> = resident
            .into_iter()
            .filter(|session_id| Some(*session_id) != current)
            .filter(|session_id| !self.is_streaming(session_id))
            .map(|session_id| {
                let accessed = self
                    .states
                    .get(session_id)
                    .map_or(0, |state| state.last_accessed_at);
                (accessed, session_id)
            })
            .collect();
        candidates.sort();

        candidates
            .into_iter()
            .take(excess)
            .map(|(_, session_id)| session_id.to_string())
            .collect()
    }

    /// Trims `messages` to the viewport window around the session's anchor.
    ///
    /// Does nothing while the session streams. Returns the removed messages.
    pub fn apply_window(&mut self, session_id: &str, messages: &mut Vec<Message>) -> Vec<Message> {
        let viewport = self.limits.viewport_messages;
        let Some(state) = self.states.get_mut(session_id) else {
            return Vec::new();
        };
        if state.is_streaming {
            return Vec::new();
        }
        let Some((start, end)) = window_bounds(messages.len(), state.viewport_anchor, viewport)
        else {
            return Vec::new();
        };

        let mut removed: Vec<Message> = messages.drain(end..).collect();
        removed.extend(messages.drain(..start));

        state.viewport_anchor = state.viewport_anchor.saturating_sub(start).min(viewport - 1);
        if start > 0 {
            state.has_more_above = true;
        }
        debug!(
            session_id,
            start,
            kept = messages.len(),
            removed = removed.len(),
            "trimmed session to viewport window"
        );
        removed
    }

    /// Drops the oldest messages of a background stream beyond the buffer cap.
    pub fn trim_background(&mut self, session_id: &str, messages: &mut Vec<Message>) -> Vec<Message> {
        let cap = self.limits.background_streaming_buffer;
        if messages.len() <= cap {
            return Vec::new();
        }

        let overflow = messages.len() - cap;
        let removed: Vec<Message> = messages.drain(..overflow).collect();
        if let Some(state) = self.states.get_mut(session_id) {
            state.viewport_anchor = state.viewport_anchor.saturating_sub(overflow);
            state.has_more_above = true;
        }
        debug!(session_id, dropped = overflow, "trimmed background stream buffer");
        removed
    }

    /// Splices fetched history into `messages`, skipping ids already present.
    ///
    /// Returns how many messages were added.
    pub fn merge_backfill(
        &mut self,
        session_id: &str,
        messages: &mut Vec<Message>,
        fetched: Vec<Message>,
        direction: LoadDirection,
        has_more_above: bool,
        now_ms: i64,
    ) -> usize {
        let known: HashSet<String> = messages.iter().map(|message| message.id().to_string()).collect();
        let boundary = match direction {
            LoadDirection::Up => messages.first().map(Message::created_at),
            LoadDirection::Down => messages.last().map(Message::created_at),
        };

        let mut added = 0;
        let mut added_above = 0;
        for message in fetched {
            if known.contains(message.id()) {
                continue;
            }
            let in_range = match (direction, boundary) {
                (_, None) => true,
                (LoadDirection::Up, Some(first)) => message.created_at() <= first,
                (LoadDirection::Down, Some(last)) => message.created_at() >= last,
            };
            if !in_range {
                continue;
            }
            if direction == LoadDirection::Up {
                added_above += 1;
            }
            insert_chronological(messages, message);
            added += 1;
        }

        let state = self.state_mut(session_id, now_ms);
        state.viewport_anchor += added_above;
        if direction == LoadDirection::Up {
            state.has_more_above = has_more_above;
        }
        added
    }
}

/// `[start, end)` of the window to keep, or `None` when everything fits.
pub fn window_bounds(len: usize, anchor: usize, viewport: usize) -> Option<(usize, usize)> {
    if viewport == 0 || len <= viewport {
        return None;
    }
    let max_start = len - viewport;
    let start = anchor.saturating_sub(viewport / 2).min(max_start);
    Some((start, start + viewport))
}
