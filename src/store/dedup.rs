//! Bounded memory of recently handled message ids.

use std::collections::{HashSet, VecDeque};

/// Remembers the `cap` most recent message refs for one channel. Insertion
/// order is tracked so the oldest ref is evicted first; membership checks
/// stay O(1) through the side set.
///
/// A ref older than the window is forgotten, so an extremely late platform
/// redelivery can slip through. That is the accepted trade for a structure
/// that cannot grow without bound on a busy channel.
#[derive(Debug)]
pub struct ProcessedRing {
    cap: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ProcessedRing {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            order: VecDeque::with_capacity(cap.min(1024)),
            seen: HashSet::with_capacity(cap.min(1024)),
        }
    }

    pub fn contains(&self, message_ref: &str) -> bool {
        self.seen.contains(message_ref)
    }

    /// Remember a ref. Returns false when it was already present.
    pub fn insert(&mut self, message_ref: String) -> bool {
        if self.seen.contains(&message_ref) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(message_ref.clone());
        self.order.push_back(message_ref);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_inserted_refs() {
        let mut ring = ProcessedRing::new(8);
        assert!(ring.insert("msg-1".into()));
        assert!(ring.contains("msg-1"));
        assert!(!ring.contains("msg-2"));
    }

    #[test]
    fn duplicate_insert_reports_false() {
        let mut ring = ProcessedRing::new(8);
        assert!(ring.insert("msg-1".into()));
        assert!(!ring.insert("msg-1".into()));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut ring = ProcessedRing::new(3);
        for i in 0..3 {
            ring.insert(format!("msg-{i}"));
        }
        assert_eq!(ring.len(), 3);

        ring.insert("msg-3".into());
        assert_eq!(ring.len(), 3);
        assert!(!ring.contains("msg-0"), "oldest ref must age out");
        assert!(ring.contains("msg-1"));
        assert!(ring.contains("msg-3"));
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut ring = ProcessedRing::new(0);
        ring.insert("a".into());
        assert!(ring.contains("a"));
        ring.insert("b".into());
        assert!(!ring.contains("a"));
        assert!(ring.contains("b"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn eviction_keeps_set_and_order_in_sync() {
        let mut ring = ProcessedRing::new(2);
        for i in 0..100 {
            ring.insert(format!("msg-{i}"));
        }
        assert_eq!(ring.len(), 2);
        assert!(ring.contains("msg-98"));
        assert!(ring.contains("msg-99"));
        assert!(!ring.contains("msg-97"));
    }
}
