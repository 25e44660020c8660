//! Ordered, deduplicated pending lookups with staleness eviction.

use std::collections::{HashSet, VecDeque};

use crate::protocol::{Handle, QueueEntry};

/// FIFO of handles waiting for a lookup. At most one entry per handle.
#[derive(Debug)]
pub struct EnrichmentQueue {
    entries: VecDeque<QueueEntry>,
    members: HashSet<Handle>,
    staleness_ms: i64,
    max_pending: usize,
}

impl EnrichmentQueue {
    pub fn new(staleness_ms: i64, max_pending: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            members: HashSet::new(),
            staleness_ms,
            max_pending: max_pending.max(1),
        }
    }

    fn is_stale(&self, entry: &QueueEntry, now: i64) -> bool {
        now.saturating_sub(entry.enqueued_at) > self.staleness_ms
    }

    /// Appends `handle` unless it is already queued or the queue is full.
    /// Returns `true` when a new entry was inserted.
    pub fn enqueue(&mut self, handle: &str, now: i64) -> bool {
        if self.members.contains(handle) || self.entries.len() >= self.max_pending {
            return false;
        }
        self.members.insert(handle.to_string());
        self.entries.push_back(QueueEntry {
            handle: handle.to_string(),
            enqueued_at: now,
        });
        true
    }

    /// Puts `handle` first with a fresh timestamp, replacing any queued entry.
    /// Never refused: a requeued lookup must not be lost to the size cap.
    pub fn enqueue_front(&mut self, handle: &str, now: i64) {
        if self.members.contains(handle) {
            self.entries.retain(|entry| entry.handle != handle);
        }
        self.members.insert(handle.to_string());
        self.entries.push_front(QueueEntry {
            handle: handle.to_string(),
            enqueued_at: now,
        });
    }

    /// Puts an already dequeued entry back at the tail, keeping its timestamp.
    pub fn requeue_back(&mut self, entry: QueueEntry) {
        if self.members.insert(entry.handle.clone()) {
            self.entries.push_back(entry);
        }
    }

    /// Evicts leading stale entries, then pops the next one.
    pub fn dequeue_next(&mut self, now: i64) -> Option<QueueEntry> {
        while let Some(entry) = self.entries.pop_front() {
            self.members.remove(&entry.handle);
            if self.is_stale(&entry, now) {
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Drops every stale entry anywhere in the queue and returns how many went.
    pub fn evict_stale(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let staleness_ms = self.staleness_ms;
        let members = &mut self.members;
        self.entries.retain(|entry| {
            let keep = now.saturating_sub(entry.enqueued_at) <= staleness_ms;
            if !keep {
                members.remove(&entry.handle);
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.members.contains(handle)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry except `keep`, returning how many were dropped.
    pub fn retain_only(&mut self, keep: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle == keep);
        self.members.retain(|handle| handle == keep);
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.members.clear();
        dropped
    }

    #[cfg(test)]
    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.handle.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::EnrichmentQueue;

    #[test]
    fn test_enqueue_deduplicates_handles() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        assert!(queue.enqueue("alice", 0));
        assert!(!queue.enqueue("alice", 5));

        assert_eq!(queue.size(), 1);
        let entry = queue.dequeue_next(10).expect("alice should be queued");
        assert_eq!(entry.handle, "alice");
        assert_eq!(entry.enqueued_at, 0);
        assert!(queue.dequeue_next(10).is_none());
    }

    #[test]
    fn test_dequeue_preserves_fifo_order() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("alice", 0);
        queue.enqueue("bob", 1);
        queue.enqueue("carol", 2);

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue_next(3))
            .map(|entry| entry.handle)
            .collect();
        assert_eq!(order, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_stale_entry_is_evicted_instead_of_dispatched() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("dave", 0);

        assert!(queue.dequeue_next(31_000).is_none());
        assert!(!queue.contains("dave"));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_dequeue_skips_leading_stale_entries() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("old", 0);
        queue.enqueue("new", 20_000);

        let entry = queue.dequeue_next(31_000).expect("fresh entry should remain");
        assert_eq!(entry.handle, "new");
        assert!(!queue.contains("old"));
    }

    #[test]
    fn test_evict_stale_sweeps_whole_queue() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("fresh", 40_000);
        queue.enqueue_front("stale", 0);
        queue.enqueue("fresh2", 41_000);

        assert_eq!(queue.evict_stale(45_000), 1);
        assert_eq!(queue.handles().collect::<Vec<_>>(), vec!["fresh", "fresh2"]);
        assert!(queue.enqueue("stale", 45_000));
    }

    #[test]
    fn test_enqueue_front_moves_existing_entry_and_refreshes_timestamp() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("alice", 0);
        queue.enqueue("bob", 0);
        queue.enqueue_front("bob", 7);

        assert_eq!(queue.size(), 2);
        let first = queue.dequeue_next(8).expect("bob should be first");
        assert_eq!(first.handle, "bob");
        assert_eq!(first.enqueued_at, 7);
    }

    #[test]
    fn test_enqueue_respects_capacity_but_front_insert_does_not() {
        let mut queue = EnrichmentQueue::new(30_000, 2);
        assert!(queue.enqueue("a", 0));
        assert!(queue.enqueue("b", 0));
        assert!(!queue.enqueue("c", 0));

        queue.enqueue_front("d", 0);
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn test_retain_only_clears_other_handles() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("alice", 0);
        queue.enqueue_front("bob", 0);
        queue.enqueue("carol", 0);

        assert_eq!(queue.retain_only("bob"), 2);
        assert!(queue.contains("bob"));
        assert!(!queue.contains("alice"));
        assert!(queue.enqueue("alice", 1));
    }

    #[test]
    fn test_requeue_back_keeps_original_timestamp() {
        let mut queue = EnrichmentQueue::new(30_000, 16);
        queue.enqueue("alice", 0);
        queue.enqueue("bob", 1);
        let alice = queue.dequeue_next(2).expect("alice queued");
        queue.requeue_back(alice);

        assert_eq!(queue.handles().collect::<Vec<_>>(), vec!["bob", "alice"]);
        assert!(queue.dequeue_next(30_001).is_some());
        // bob (t=1) is still fresh at 30_001; alice (t=0) is not.
        assert!(queue.dequeue_next(30_001).is_none());
    }
}
