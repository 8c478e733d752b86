use std::collections::HashMap;

use crate::timers::TimerRegistry;

/// Phase of an assistant message's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    Cooldown,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEntry {
    pub phase: StreamPhase,
    pub started_at: i64,
    pub last_update_at: i64,
    pub completed_at: Option<i64>,
}

/// Per-message `streaming -> cooldown -> completed` tracker.
///
/// Settlement is debounced: a pending settlement is dropped by any later
/// [`touch`](Self::touch), and a settled entry is removed outright, so an
/// absent entry reads as completed.
#[derive(Debug, Default)]
pub struct StreamLifecycle {
    entries: HashMap<String, LifecycleEntry>,
    settlements: TimerRegistry<String, ()>,
}

impl StreamLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity. Returns `true` when this created the entry.
    pub fn touch(&mut self, message_id: &str, now_ms: i64) -> bool {
        self.settlements.cancel(&message_id.to_string());

        match self.entries.get_mut(message_id) {
            Some(entry) => {
                entry.last_update_at = entry.last_update_at.max(now_ms);
                if entry.phase != StreamPhase::Streaming {
                    entry.phase = StreamPhase::Streaming;
                    entry.completed_at = None;
                }
                false
            }
            None => {
                self.entries.insert(
                    message_id.to_string(),
                    LifecycleEntry {
                        phase: StreamPhase::Streaming,
                        started_at: now_ms,
                        last_update_at: now_ms,
                        completed_at: None,
                    },
                );
                true
            }
        }
    }

    /// Moves a streaming entry to cooldown. Returns whether the phase changed.
    pub fn mark_cooldown(&mut self, message_id: &str, now_ms: i64) -> bool {
        let Some(entry) = self.entries.get_mut(message_id) else {
            return false;
        };
        if entry.phase != StreamPhase::Streaming {
            return false;
        }

        entry.phase = StreamPhase::Cooldown;
        entry.completed_at.get_or_insert(now_ms);
        true
    }

    /// Arms (or re-arms) the settlement timer for a tracked message.
    pub fn schedule_settlement(&mut self, message_id: &str, delay_ms: i64, now_ms: i64) -> bool {
        if !self.entries.contains_key(message_id) {
            return false;
        }
        self.settlements.arm(
            message_id.to_string(),
            now_ms.saturating_add(delay_ms),
            (),
        );
        true
    }

    /// Completes and drops every entry whose settlement delay has elapsed.
    pub fn settle_due(&mut self, now_ms: i64) -> Vec<String> {
        self.settlements
            .drain_due(now_ms)
            .into_iter()
            .filter_map(|(message_id, ())| {
                let entry = self.entries.get_mut(&message_id)?;
                if entry.phase != StreamPhase::Cooldown {
                    return None;
                }
                entry.phase = StreamPhase::Completed;
                self.entries.remove(&message_id);
                Some(message_id)
            })
            .collect()
    }

    pub fn phase(&self, message_id: &str) -> Option<StreamPhase> {
        self.entries.get(message_id).map(|entry| entry.phase)
    }

    pub fn entry(&self, message_id: &str) -> Option<&LifecycleEntry> {
        self.entries.get(message_id)
    }

    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Drops the entry and any pending settlement for it.
    pub fn remove(&mut self, message_id: &str) -> bool {
        self.settlements.cancel(&message_id.to_string());
        self.entries.remove(message_id).is_some()
    }

    pub fn remove_all<'a>(&mut self, message_ids: impl IntoIterator<Item = &'a str>) {
        for message_id in message_ids {
            self.remove(message_id);
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.settlements.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{StreamLifecycle, StreamPhase};

    #[test]
    fn full_cycle_removes_entry_after_quiet_period() {
        let mut lifecycle = StreamLifecycle::new();

        assert!(lifecycle.touch("msg_1", 100));
        assert!(!lifecycle.touch("msg_1", 150));
        assert_eq!(lifecycle.phase("msg_1"), Some(StreamPhase::Streaming));

        assert!(lifecycle.mark_cooldown("msg_1", 200));
        assert!(!lifecycle.mark_cooldown("msg_1", 210));
        assert!(lifecycle.schedule_settlement("msg_1", 2_000, 200));

        assert!(lifecycle.settle_due(2_199).is_empty());
        assert_eq!(lifecycle.settle_due(2_200), vec!["msg_1".to_string()]);
        assert_eq!(lifecycle.phase("msg_1"), None);
    }

    #[test]
    fn activity_during_cooldown_cancels_settlement() {
        let mut lifecycle = StreamLifecycle::new();
        lifecycle.touch("msg_1", 0);
        lifecycle.mark_cooldown("msg_1", 10);
        lifecycle.schedule_settlement("msg_1", 100, 10);

        lifecycle.touch("msg_1", 50);

        assert!(lifecycle.settle_due(1_000).is_empty());
        let entry = lifecycle.entry("msg_1").expect("entry kept");
        assert_eq!(entry.phase, StreamPhase::Streaming);
        assert_eq!(entry.completed_at, None);
        assert_eq!(entry.started_at, 0);
        assert_eq!(entry.last_update_at, 50);
    }

    #[test]
    fn untracked_messages_are_ignored() {
        let mut lifecycle = StreamLifecycle::new();
        assert!(!lifecycle.mark_cooldown("msg_x", 0));
        assert!(!lifecycle.schedule_settlement("msg_x", 10, 0));
        assert_eq!(lifecycle.next_deadline(), None);
    }

    #[test]
    fn removal_cancels_pending_timers() {
        let mut lifecycle = StreamLifecycle::new();
        lifecycle.touch("msg_1", 0);
        lifecycle.touch("msg_2", 0);
        lifecycle.mark_cooldown("msg_1", 0);
        lifecycle.schedule_settlement("msg_1", 10, 0);

        lifecycle.remove_all(["msg_1", "msg_2"]);

        assert!(lifecycle.is_empty());
        assert_eq!(lifecycle.next_deadline(), None);
        assert!(lifecycle.settle_due(100).is_empty());
    }

    #[test]
    fn out_of_order_touch_keeps_latest_timestamp() {
        let mut lifecycle = StreamLifecycle::new();
        lifecycle.touch("msg_1", 500);
        lifecycle.touch("msg_1", 300);
        assert_eq!(lifecycle.entry("msg_1").map(|entry| entry.last_update_at), Some(500));
    }
}
