//! Session and message state core for streamed assistant chats.
//!
//! [`ChatStore`] owns the canonical sessions and messages and applies every
//! mutation synchronously: streamed parts, message metadata, removals, timer
//! expiry. [`SessionController`] drives it from async code, talking to the
//! backend through [`chat_protocol::ChatTransport`].
//!
//! # Public API Overview
//! - Assemble streamed parts into messages with [`ChatStore::add_streaming_part`]
//!   or the [`ChatStore::apply_event`] dispatcher.
//! - Track per-message stream phases via [`StreamLifecycle`].
//! - Keep resident memory bounded via [`MemoryManager`] windowing and eviction.
//! - Read context-window usage via [`ChatStore::context_usage`].
//! - Persist the durable subset of state through [`StateStorage`].

pub mod clock;
pub mod commands;
pub mod config;
pub mod context_usage;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod persistence;
pub mod store;
pub mod timers;
pub mod tokens;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::commands::{parse_slash_command, SlashCommand};
pub use crate::config::StoreConfig;
pub use crate::context_usage::{
    ContextLimitSource, ContextUsage, ContextUsageCache, ContextUsageSnapshot, StaticContextLimits,
};
pub use crate::controller::SessionController;
pub use crate::error::{PersistenceError, StoreError};
pub use crate::lifecycle::{LifecycleEntry, StreamLifecycle, StreamPhase};
pub use crate::logging::init_tracing;
pub use crate::memory::{LoadDirection, MemoryLimits, MemoryManager, SessionMemoryState};
pub use crate::model::{Message, ModelSelection, Part, PartBody, ToolState, ToolStatus};
pub use crate::normalize::normalize_part;
pub use crate::persistence::{FileStorage, MemoryStorage, PersistedState, StateStorage};
pub use crate::store::{Attachment, ChatStore, FiredTimers, PreparedCommand, PreparedSend};
pub use crate::timers::TimerRegistry;
pub use crate::tokens::{extract_tokens, usage_total};
