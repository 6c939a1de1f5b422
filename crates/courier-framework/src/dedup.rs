//! Bounded window of recently seen event ids.

use std::collections::{HashSet, VecDeque};

use courier_core::EventId;

/// Remembers the last `capacity` event ids, evicting the oldest first.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl DedupWindow {
    /// Creates a window holding at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `id`. Returns `false` if it is already in the window.
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Removes `id` so a redelivery is processed again.
    pub fn forget(&mut self, id: EventId) {
        if self.seen.remove(&id) {
            self.order.retain(|&seen| seen != id);
        }
    }

    /// Whether `id` is in the window.
    pub fn contains(&self, id: EventId) -> bool {
        self.seen.contains(&id)
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected() {
        let mut window = DedupWindow::new(4);
        assert!(window.insert(1));
        assert!(!window.insert(1));
    }

    #[test]
    fn test_oldest_evicted() {
        let mut window = DedupWindow::new(2);
        window.insert(1);
        window.insert(2);
        window.insert(3);
        assert!(!window.contains(1));
        assert!(window.contains(2));
        assert!(window.contains(3));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_forget_allows_reprocessing() {
        let mut window = DedupWindow::new(2);
        window.insert(1);
        window.insert(2);
        window.forget(1);
        assert!(window.insert(1));
        // 2 is now the oldest.
        window.insert(3);
        assert!(!window.contains(2));
        assert!(window.contains(1));
    }
}
