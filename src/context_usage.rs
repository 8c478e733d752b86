use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::Message;
use crate::tokens::extract_tokens;

/// Supplies the context window size of a model, when known.
///
/// Usually backed by the application's provider configuration. Returning
/// `None` skips context-usage computation for that model.
pub trait ContextLimitSource: Send + Sync {
    fn context_limit(&self, provider_id: &str, model_id: &str) -> Option<u64>;
}

/// Fixed lookup table, handy for tests and static configurations.
#[derive(Debug, Clone, Default)]
pub struct StaticContextLimits {
    limits: HashMap<(String, String), u64>,
}

impl StaticContextLimits {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(
        mut self,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        limit: u64,
    ) -> Self {
        self.limits
            .insert((provider_id.into(), model_id.into()), limit);
        self
    }
}

impl ContextLimitSource for StaticContextLimits {
    fn context_limit(&self, provider_id: &str, model_id: &str) -> Option<u64> {
        self.limits
            .get(&(provider_id.to_string(), model_id.to_string()))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub total_tokens: u64,
    pub percentage: f64,
    pub context_limit: u64,
}

/// Cached usage of a session, valid while `last_message_id` is still the
/// session's latest assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsageSnapshot {
    pub total_tokens: u64,
    pub percentage: f64,
    pub context_limit: u64,
    pub last_message_id: String,
}

impl ContextUsageSnapshot {
    pub fn usage(&self) -> ContextUsage {
        ContextUsage {
            total_tokens: self.total_tokens,
            percentage: self.percentage,
            context_limit: self.context_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageComputation {
    pub usage: Option<ContextUsage>,
    /// Tokens were still zero; a later poll may find them populated.
    pub needs_poll: bool,
}

impl UsageComputation {
    fn ready(usage: Option<ContextUsage>) -> Self {
        Self {
            usage,
            needs_poll: false,
        }
    }
}

/// Percentage of `limit` used by `total_tokens`, clamped to `[0, 100]`.
pub fn percentage(total_tokens: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    ((total_tokens as f64 / limit as f64) * 100.0).clamp(0.0, 100.0)
}

pub fn latest_assistant(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|message| message.is_assistant())
}

#[derive(Debug, Default)]
pub struct ContextUsageCache {
    snapshots: HashMap<String, ContextUsageSnapshot>,
}

impl ContextUsageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<&ContextUsageSnapshot> {
        self.snapshots.get(session_id)
    }

    pub fn snapshots(&self) -> &HashMap<String, ContextUsageSnapshot> {
        &self.snapshots
    }

    pub fn restore(&mut self, snapshots: HashMap<String, ContextUsageSnapshot>) {
        self.snapshots = snapshots;
    }

    pub fn remove(&mut self, session_id: &str) {
        self.snapshots.remove(session_id);
    }

    /// Cache-first lookup.
    ///
    /// A snapshot for the same tail message is returned as is, or with its
    /// percentage rescaled when only the limit changed. Anything else walks
    /// the messages again.
    pub fn compute(
        &mut self,
        session_id: &str,
        messages: &[Message],
        context_limit: u64,
    ) -> UsageComputation {
        let Some(latest) = latest_assistant(messages) else {
            return UsageComputation::ready(self.snapshot(session_id).map(ContextUsageSnapshot::usage));
        };

        if let Some(snapshot) = self.snapshots.get_mut(session_id) {
            if snapshot.last_message_id == latest.id() {
                if snapshot.context_limit != context_limit {
                    snapshot.context_limit = context_limit;
                    snapshot.percentage = percentage(snapshot.total_tokens, context_limit);
                }
                return UsageComputation::ready(Some(snapshot.usage()));
            }
        }

        self.recompute(session_id, messages, context_limit)
    }

    /// Re-walks the latest assistant message regardless of the cache.
    ///
    /// A zero count never overwrites a cached value: the previous snapshot is
    /// returned and a poll is requested.
    pub fn recompute(
        &mut self,
        session_id: &str,
        messages: &[Message],
        context_limit: u64,
    ) -> UsageComputation {
        let previous = self.snapshot(session_id).map(ContextUsageSnapshot::usage);
        let Some(latest) = latest_assistant(messages) else {
            return UsageComputation::ready(previous);
        };

        let total_tokens = extract_tokens(latest);
        if total_tokens == 0 {
            return UsageComputation {
                usage: previous,
                needs_poll: true,
            };
        }

        let snapshot = ContextUsageSnapshot {
            total_tokens,
            percentage: percentage(total_tokens, context_limit),
            context_limit,
            last_message_id: latest.id().to_string(),
        };
        let usage = snapshot.usage();
        self.snapshots.insert(session_id.to_string(), snapshot);
        UsageComputation::ready(Some(usage))
    }
}
