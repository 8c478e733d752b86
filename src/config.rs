//! Store thresholds and their environment overrides.

use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_SESSIONS: usize = 5;
pub const DEFAULT_VIEWPORT_MESSAGES: usize = 120;
pub const DEFAULT_BACKGROUND_STREAMING_BUFFER: usize = 60;
pub const DEFAULT_ZOMBIE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SETTLEMENT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(1_500);
pub const DEFAULT_TOKEN_POLL_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;
pub const DEFAULT_TIMER_TICK: Duration = Duration::from_millis(25);
pub const MIN_TIMER_TICK: Duration = Duration::from_millis(1);
pub const DEFAULT_STORE_KEY: &str = "chat-store";

/// Every policy threshold used by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Sessions allowed to keep their message lists resident.
    pub max_sessions: usize,
    /// Window size kept for the active session.
    pub viewport_messages: usize,
    /// Cap for sessions that stream while not active.
    pub background_streaming_buffer: usize,
    pub zombie_timeout: Duration,
    /// Quiet period between cooldown and completion.
    pub settlement_delay: Duration,
    pub token_poll_interval: Duration,
    pub token_poll_max_attempts: u32,
    /// Messages requested per backfill page.
    pub history_page_size: usize,
    /// Upper bound on how long the timer driver sleeps between checks.
    pub timer_tick: Duration,
    /// Key under which persisted state is stored.
    pub store_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            viewport_messages: DEFAULT_VIEWPORT_MESSAGES,
            background_streaming_buffer: DEFAULT_BACKGROUND_STREAMING_BUFFER,
            zombie_timeout: DEFAULT_ZOMBIE_TIMEOUT,
            settlement_delay: DEFAULT_SETTLEMENT_DELAY,
            token_poll_interval: DEFAULT_TOKEN_POLL_INTERVAL,
            token_poll_max_attempts: DEFAULT_TOKEN_POLL_MAX_ATTEMPTS,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            timer_tick: DEFAULT_TIMER_TICK,
            store_key: DEFAULT_STORE_KEY.to_string(),
        }
    }
}

impl StoreConfig {
    /// Defaults overlaid with `CHAT_STORE_*` environment variables.
    ///
    /// Unparsable or zero values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_sessions: env_positive("CHAT_STORE_MAX_SESSIONS").unwrap_or(defaults.max_sessions),
            viewport_messages: env_positive("CHAT_STORE_VIEWPORT_MESSAGES")
                .unwrap_or(defaults.viewport_messages),
            background_streaming_buffer: env_positive("CHAT_STORE_BACKGROUND_BUFFER")
                .unwrap_or(defaults.background_streaming_buffer),
            zombie_timeout: env_millis("CHAT_STORE_ZOMBIE_TIMEOUT_MS")
                .unwrap_or(defaults.zombie_timeout),
            settlement_delay: env_millis("CHAT_STORE_SETTLEMENT_DELAY_MS")
                .unwrap_or(defaults.settlement_delay),
            token_poll_interval: env_millis("CHAT_STORE_TOKEN_POLL_INTERVAL_MS")
                .unwrap_or(defaults.token_poll_interval),
            token_poll_max_attempts: env_positive("CHAT_STORE_TOKEN_POLL_ATTEMPTS")
                .and_then(|attempts| u32::try_from(attempts).ok())
                .unwrap_or(defaults.token_poll_max_attempts),
            ..defaults
        }
    }

    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    #[must_use]
    pub fn with_viewport_messages(mut self, viewport_messages: usize) -> Self {
        self.viewport_messages = viewport_messages.max(1);
        self
    }

    #[must_use]
    pub fn with_background_streaming_buffer(mut self, buffer: usize) -> Self {
        self.background_streaming_buffer = buffer.max(1);
        self
    }

    #[must_use]
    pub fn with_zombie_timeout(mut self, timeout: Duration) -> Self {
        self.zombie_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_settlement_delay(mut self, delay: Duration) -> Self {
        self.settlement_delay = delay;
        self
    }

    #[must_use]
    pub fn with_token_poll(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.token_poll_interval = interval;
        self.token_poll_max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_history_page_size(mut self, page_size: usize) -> Self {
        self.history_page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick.max(MIN_TIMER_TICK);
        self
    }

    #[must_use]
    pub fn with_store_key(mut self, store_key: impl Into<String>) -> Self {
        self.store_key = store_key.into();
        self
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_positive(key: &str) -> Option<usize> {
    env_string_opt(key)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_string_opt(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}
