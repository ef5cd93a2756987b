//! Replay suppression for inbound requests.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

/// Default number of correlation tokens remembered.
pub const DEFAULT_CAPACITY: usize = 100;

struct Window {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Bounded memory of recently processed correlation tokens.
///
/// When full, the oldest token is forgotten first; a request repeated after
/// its token was evicted is processed again.
pub struct Deduplicator {
    capacity: usize,
    window: Mutex<Window>,
}

impl Deduplicator {
    /// Creates a window remembering up to `capacity` tokens.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            window: Mutex::new(Window {
                order: VecDeque::with_capacity(capacity),
                members: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Maximum number of tokens remembered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.lock().order.len()
    }

    /// Whether no token is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.lock().order.is_empty()
    }

    /// Whether `token` is remembered.
    #[must_use]
    pub fn seen(&self, token: &str) -> bool {
        self.window.lock().members.contains(token)
    }

    /// Remembers `token`, evicting the oldest token if the window is full.
    pub fn record(&self, token: &str) {
        let mut window = self.window.lock();
        self.insert(&mut window, token);
    }

    /// Remembers `token` and reports whether this is its first sighting.
    ///
    /// The check and the insertion happen under one lock, so concurrent
    /// deliveries of the same request see exactly one `true`.
    pub fn check_and_record(&self, token: &str) -> bool {
        let mut window = self.window.lock();
        if window.members.contains(token) {
            return false;
        }
        self.insert(&mut window, token);
        true
    }

    fn insert(&self, window: &mut Window, token: &str) {
        if self.capacity == 0 || window.members.contains(token) {
            return;
        }
        while window.order.len() >= self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.members.remove(&oldest);
            }
        }
        window.order.push_back(token.to_string());
        window.members.insert(token.to_string());
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_only() {
        let dedup = Deduplicator::default();

        assert!(dedup.check_and_record("a"));
        assert!(!dedup.check_and_record("a"));
        assert!(dedup.check_and_record("b"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_oldest_token_evicted() {
        let dedup = Deduplicator::new(3);
        for token in ["a", "b", "c", "d"] {
            dedup.record(token);
        }

        assert!(!dedup.seen("a"));
        assert!(dedup.seen("b"));
        assert!(dedup.seen("d"));
        assert_eq!(dedup.len(), 3);

        // An evicted token counts as new again.
        assert!(dedup.check_and_record("a"));
        assert!(!dedup.seen("b"));
    }

    #[test]
    fn test_record_is_idempotent() {
        let dedup = Deduplicator::new(2);
        dedup.record("a");
        dedup.record("a");
        dedup.record("b");

        assert!(dedup.seen("a"));
        assert!(dedup.seen("b"));
    }

    #[test]
    fn test_zero_capacity_remembers_nothing() {
        let dedup = Deduplicator::new(0);

        assert!(dedup.check_and_record("a"));
        assert!(dedup.check_and_record("a"));
        assert!(dedup.is_empty());
    }
}
