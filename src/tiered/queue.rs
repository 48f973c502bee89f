//! Generation-gated work queue.
//!
//! One FIFO per work type. An item is ready once its table's last completed
//! checkpoint generation has reached the item's generation; unready items are
//! skipped, not blocked on, so other items keep flowing.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use super::work::{WorkItem, WorkType};

#[derive(Default)]
struct Inner {
    queues: [VecDeque<WorkItem>; 4],
    completed: HashMap<String, u64>,
}

impl Inner {
    fn is_ready(&self, item: &WorkItem) -> bool {
        self.completed.get(&item.table).copied().unwrap_or(0) >= item.generation
    }
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item. A queued item of the same type for the same object is
    /// folded into the new one: it keeps its place and takes the newer generation.
    pub fn enqueue(&self, item: WorkItem) {
        let mut inner = self.inner.lock();
        let queue = &mut inner.queues[item.kind.index()];
        if let Some(existing) = queue
            .iter_mut()
            .find(|q| q.table == item.table && q.object_id == item.object_id)
        {
            existing.generation = existing.generation.max(item.generation);
            debug!(item = %existing, "Folded duplicate work item");
            return;
        }
        debug!(item = %item, "Enqueued work item");
        queue.push_back(item);
    }

    /// Pops the oldest ready item of one type.
    pub fn next_ready(&self, kind: WorkType) -> Option<WorkItem> {
        let mut inner = self.inner.lock();
        let position = inner.queues[kind.index()]
            .iter()
            .position(|item| inner.is_ready(item))?;
        inner.queues[kind.index()].remove(position)
    }

    /// Pops the oldest ready item, trying types in declaration order.
    pub fn next_any(&self) -> Option<WorkItem> {
        WorkType::ALL.iter().find_map(|&kind| self.next_ready(kind))
    }

    /// Records that `table`'s checkpoint `generation` has fully completed.
    pub fn mark_checkpoint_complete(&self, table: &str, generation: u64) {
        let mut inner = self.inner.lock();
        let completed = inner.completed.entry(table.to_string()).or_insert(0);
        *completed = (*completed).max(generation);
    }

    pub fn completed_generation(&self, table: &str) -> u64 {
        self.inner.lock().completed.get(table).copied().unwrap_or(0)
    }

    /// Drops queued items of a table, except remote deletions.
    pub fn purge_table(&self, table: &str) -> usize {
        let mut inner = self.inner.lock();
        let mut purged = 0;
        for kind in [WorkType::Flush, WorkType::FlushFinish, WorkType::RemoveLocal] {
            let queue = &mut inner.queues[kind.index()];
            let before = queue.len();
            queue.retain(|item| item.table != table);
            purged += before - queue.len();
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queues.iter().map(VecDeque::len).sum()
    }

    pub fn len_of(&self, kind: WorkType) -> usize {
        self.inner.lock().queues[kind.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.inner
            .lock()
            .queues
            .iter()
            .flat_map(|q| q.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_gates_dequeue() {
        let queue = WorkQueue::new();
        queue.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 5));

        assert!(queue.next_ready(WorkType::Flush).is_none());
        queue.mark_checkpoint_complete("t", 4);
        assert!(queue.next_ready(WorkType::Flush).is_none());
        // Another table's progress does not help.
        queue.mark_checkpoint_complete("u", 9);
        assert!(queue.next_any().is_none());

        queue.mark_checkpoint_complete("t", 5);
        let item = queue.next_ready(WorkType::Flush);
        assert_eq!(item.map(|i| i.object_id), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unready_items_are_skipped_not_blocking() {
        let queue = WorkQueue::new();
        queue.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 7));
        queue.enqueue(WorkItem::new(WorkType::Flush, "u", 3, 2));
        queue.enqueue(WorkItem::new(WorkType::RemoveShared, "v", 9, 0));
        queue.mark_checkpoint_complete("u", 2);

        assert_eq!(queue.next_any().map(|i| i.table), Some("u".to_string()));
        assert_eq!(queue.next_any().map(|i| i.kind), Some(WorkType::RemoveShared));
        assert!(queue.next_any().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_within_type() {
        let queue = WorkQueue::new();
        for id in 1..=3 {
            queue.enqueue(WorkItem::new(WorkType::RemoveLocal, "t", id, 0));
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.next_ready(WorkType::RemoveLocal))
            .map(|i| i.object_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_takes_newer_generation() {
        let queue = WorkQueue::new();
        queue.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 3));
        queue.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 4));
        assert_eq!(queue.len(), 1);

        queue.mark_checkpoint_complete("t", 3);
        assert!(queue.next_any().is_none());
        queue.mark_checkpoint_complete("t", 4);
        assert!(queue.next_any().is_some());
    }

    #[test]
    fn test_purge_keeps_remote_deletes() {
        let queue = WorkQueue::new();
        queue.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 1));
        queue.enqueue(WorkItem::new(WorkType::RemoveLocal, "t", 1, 1));
        queue.enqueue(WorkItem::new(WorkType::RemoveShared, "t", 1, 0));
        assert_eq!(queue.purge_table("t"), 2);
        assert_eq!(queue.len_of(WorkType::RemoveShared), 1);
    }
}
