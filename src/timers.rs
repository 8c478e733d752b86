use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Armed<A> {
    deadline_ms: i64,
    seq: u64,
    action: A,
}

/// Owned one-shot timers keyed by `K`.
///
/// Arming a key that is already pending replaces the earlier timer, so each
/// key has at most one deadline. Nothing fires on its own: the owner polls
/// [`TimerRegistry::drain_due`] with the current time.
#[derive(Debug, Clone)]
pub struct TimerRegistry<K, A> {
    armed: HashMap<K, Armed<A>>,
    next_seq: u64,
}

impl<K, A> Default for TimerRegistry<K, A> {
    fn default() -> Self {
        Self {
            armed: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K, A> TimerRegistry<K, A>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, key: K, deadline_ms: i64, action: A) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.armed.insert(
            key,
            Armed {
                deadline_ms,
                seq,
                action,
            },
        );
    }

    /// Returns whether a pending timer was removed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.armed.remove(key).is_some()
    }

    /// Cancels every pending timer whose key matches `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.armed.len();
        self.armed.retain(|key, _| !predicate(key));
        before - self.armed.len()
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<i64> {
        self.armed.get(key).map(|armed| armed.deadline_ms)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.armed.values().map(|armed| armed.deadline_ms).min()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Removes and returns every timer due at `now_ms`, earliest first.
    ///
    /// Timers sharing a deadline come out in the order they were armed.
    pub fn drain_due(&mut self, now_ms: i64) -> Vec<(K, A)> {
        let due_keys: Vec<K> = self
            .armed
            .iter()
            .filter(|(_, armed)| armed.deadline_ms <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();

        let mut due: Vec<(K, Armed<A>)> = due_keys
            .into_iter()
            .filter_map(|key| self.armed.remove(&key).map(|armed| (key, armed)))
            .collect();
        due.sort_by_key(|(_, armed)| (armed.deadline_ms, armed.seq));

        due.into_iter()
            .map(|(key, armed)| (key, armed.action))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::TimerRegistry;

    #[test]
    fn due_timers_drain_in_deadline_order() {
        let mut timers = TimerRegistry::new();
        timers.arm("late", 300, 3);
        timers.arm("early", 100, 1);
        timers.arm("middle", 200, 2);

        assert_eq!(timers.next_deadline(), Some(100));
        assert_eq!(timers.drain_due(250), vec![("early", 1), ("middle", 2)]);
        assert_eq!(timers.len(), 1);
        assert!(timers.drain_due(299).is_empty());
        assert_eq!(timers.drain_due(300), vec![("late", 3)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn rearming_replaces_the_pending_deadline() {
        let mut timers = TimerRegistry::new();
        timers.arm("settle", 100, "first");
        timers.arm("settle", 500, "second");

        assert!(timers.drain_due(100).is_empty());
        assert_eq!(timers.deadline(&"settle"), Some(500));
        assert_eq!(timers.drain_due(500), vec![("settle", "second")]);
    }

    #[test]
    fn cancel_where_removes_matching_keys_only() {
        let mut timers = TimerRegistry::new();
        timers.arm(("ses_a", 1), 10, ());
        timers.arm(("ses_a", 2), 10, ());
        timers.arm(("ses_b", 1), 10, ());

        assert_eq!(timers.cancel_where(|(session, _)| *session == "ses_a"), 2);
        assert!(timers.is_armed(&("ses_b", 1)));
        assert!(!timers.cancel(&("ses_a", 1)));
        assert!(timers.cancel(&("ses_b", 1)));
    }

    #[test]
    fn ties_fire_in_arming_order() {
        let mut timers = TimerRegistry::new();
        timers.arm("b", 50, "b");
        timers.arm("a", 50, "a");
        timers.arm("c", 50, "c");

        let fired: Vec<_> = timers.drain_due(50).into_iter().map(|(_, action)| action).collect();
        assert_eq!(fired, vec!["b", "a", "c"]);
    }
}
