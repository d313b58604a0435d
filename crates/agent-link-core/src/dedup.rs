//! Bounded window of recently accepted message ids.

use std::collections::{HashSet, VecDeque};

use crate::MessageId;

/// Default window size.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// FIFO-bounded set of accepted message ids.
///
/// Membership is O(1). When full, inserting evicts the oldest id, regardless
/// of how recently it was looked up.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    capacity: usize,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DedupWindow {
    /// Create a window holding at most `capacity` ids (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(64)),
            members: HashSet::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Insert an id.
    ///
    /// Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            } else {
                break;
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget all ids. Only done when a brand-new session begins.
    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut window = DedupWindow::new(4);
        assert!(window.insert("m1".into()));
        assert!(!window.insert("m1".into()));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut window = DedupWindow::new(3);
        for id in ["m1", "m2", "m3"] {
            window.insert(id.into());
        }
        // Looking up m1 does not protect it: eviction is FIFO, not LRU.
        assert!(window.contains(&"m1".into()));
        window.insert("m4".into());
        assert!(!window.contains(&"m1".into()));
        assert!(window.contains(&"m2".into()));
        assert!(window.contains(&"m4".into()));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_clear() {
        let mut window = DedupWindow::default();
        window.insert("m1".into());
        window.clear();
        assert!(window.is_empty());
        assert!(window.insert("m1".into()));
        assert_eq!(window.capacity(), DEFAULT_DEDUP_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut window = DedupWindow::new(0);
        window.insert("a".into());
        window.insert("b".into());
        assert_eq!(window.len(), 1);
        assert!(window.contains(&"b".into()));
    }

    proptest! {
        #[test]
        fn prop_each_id_accepted_once(ids in proptest::collection::vec(0u32..50, 0..300)) {
            let mut window = DedupWindow::new(1000);
            let mut accepted = Vec::new();
            for n in &ids {
                if window.insert(MessageId::new(format!("m{n}"))) {
                    accepted.push(*n);
                }
            }
            let unique: HashSet<u32> = ids.iter().copied().collect();
            prop_assert_eq!(accepted.len(), unique.len());
        }
    }
}
