// Bounded replay buffer for database change events.

use std::collections::VecDeque;

use crate::types::DatabaseChange;

/// Default retention for change replay, matching the runtime's per-instance
/// buffer.
pub const CHANGE_BUFFER_CAPACITY: usize = 100;

/// Fixed-capacity queue of recent changes: the newest-connecting subscriber
/// replays these before switching to live events. When full, pushing evicts
/// the oldest entry; order of the survivors is preserved.
#[derive(Debug, Clone)]
pub struct ChangeBuffer {
    entries: VecDeque<DatabaseChange>,
    capacity: usize,
}

impl ChangeBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "change buffer capacity must be non-zero");
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, change: DatabaseChange) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(change);
    }

    /// Snapshot of retained changes, oldest first.
    pub fn snapshot(&self) -> Vec<DatabaseChange> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ChangeBuffer {
    fn default() -> Self {
        Self::new(CHANGE_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::ChangeOp;

    fn change(n: usize) -> DatabaseChange {
        DatabaseChange {
            table: "items".into(),
            op: ChangeOp::Insert,
            row_id: Some(n.to_string()),
            ts: Utc::now(),
        }
    }

    #[test]
    fn retains_insertion_order_below_capacity() {
        let mut buffer = ChangeBuffer::new(10);
        for n in 1..=5 {
            buffer.push(change(n));
        }
        let ids: Vec<_> =
            buffer.snapshot().into_iter().map(|c| c.row_id.unwrap()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn evicts_exactly_the_oldest_at_capacity() {
        let mut buffer = ChangeBuffer::new(100);
        for n in 1..=101 {
            buffer.push(change(n));
        }

        assert_eq!(buffer.len(), 100);
        let ids: Vec<_> =
            buffer.snapshot().into_iter().map(|c| c.row_id.unwrap()).collect();
        assert_eq!(ids.first().map(String::as_str), Some("2"));
        assert_eq!(ids.last().map(String::as_str), Some("101"));
        assert!(!ids.contains(&"1".to_string()));
        // Survivors keep their original order.
        let expected: Vec<String> = (2..=101).map(|n| n.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn default_capacity_is_one_hundred() {
        assert_eq!(ChangeBuffer::default().capacity(), CHANGE_BUFFER_CAPACITY);
        assert_eq!(CHANGE_BUFFER_CAPACITY, 100);
    }
}
