//! Commit-callback chain
//!
//! One upstream poll batch fans out into N sibling callbacks, one per
//! destination table it touched. The upstream offset for the batch may
//! only be committed once every sibling has fired, and batches must be
//! acknowledged in arrival order: a later batch completing first stays
//! parked behind the earlier one.
//!
//! The consumer worker drains [`CommitQueue::advance`] between polls and
//! commits the newest released position to the source.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Acknowledgement state for one upstream batch.
#[derive(Debug)]
struct BatchAck {
    /// Upstream position that becomes durable once the batch completes
    position: u64,
    /// Sibling callbacks that have not fired yet
    pending: AtomicUsize,
}

impl BatchAck {
    fn is_complete(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}

/// Token representing "upstream position P is durable after the target
/// commits".
///
/// Loaders fire callbacks in the order they were appended to a task,
/// immediately after the containing transaction commits.
#[derive(Debug, Clone)]
pub struct CommitCallback {
    ack: Arc<BatchAck>,
}

impl CommitCallback {
    /// Mark this sibling as durable on the target.
    pub fn done(&self) {
        let prev = self.ack.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "commit callback fired more than once");
    }

    /// Upstream position acknowledged by this callback's batch.
    pub fn position(&self) -> u64 {
        self.ack.position
    }
}

/// Per-pipeline FIFO of in-flight batch acknowledgements.
#[derive(Debug, Default)]
pub struct CommitQueue {
    pending: Mutex<VecDeque<Arc<BatchAck>>>,
}

impl CommitQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upstream batch and hand out one callback per touched
    /// table.
    ///
    /// A batch that touched no table (every record skipped) is complete on
    /// arrival, so its offset still advances.
    pub fn register(&self, position: u64, siblings: usize) -> Vec<CommitCallback> {
        let ack = Arc::new(BatchAck {
            position,
            pending: AtomicUsize::new(siblings),
        });
        self.pending.lock().push_back(ack.clone());
        (0..siblings)
            .map(|_| CommitCallback { ack: ack.clone() })
            .collect()
    }

    /// Release the completed prefix and return the newest position that is
    /// now safe to commit upstream.
    ///
    /// Returns `None` while the head batch is still in flight, which keeps
    /// acknowledgement strictly in arrival order.
    pub fn advance(&self) -> Option<u64> {
        let mut queue = self.pending.lock();
        let mut released = None;
        while let Some(head) = queue.front() {
            if !head.is_complete() {
                break;
            }
            released = Some(head.position);
            queue.pop_front();
        }
        released
    }

    /// Number of batches awaiting acknowledgement.
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sibling() {
        let queue = CommitQueue::new();
        let cbs = queue.register(7, 1);
        assert_eq!(cbs.len(), 1);
        assert_eq!(queue.advance(), None);

        cbs[0].done();
        assert_eq!(queue.advance(), Some(7));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_all_siblings_must_fire() {
        let queue = CommitQueue::new();
        let cbs = queue.register(3, 2);

        cbs[0].done();
        assert_eq!(queue.advance(), None);

        cbs[1].done();
        assert_eq!(queue.advance(), Some(3));
    }

    #[test]
    fn test_arrival_order_is_preserved() {
        let queue = CommitQueue::new();
        let first = queue.register(1, 1);
        let second = queue.register(2, 1);

        // Later batch completes first: nothing is released yet.
        second[0].done();
        assert_eq!(queue.advance(), None);

        // Head completes: both release, newest position wins.
        first[0].done();
        assert_eq!(queue.advance(), Some(2));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_empty_batch_advances_immediately() {
        let queue = CommitQueue::new();
        let cbs = queue.register(11, 0);
        assert!(cbs.is_empty());
        assert_eq!(queue.advance(), Some(11));
    }

    #[test]
    fn test_partial_prefix_release() {
        let queue = CommitQueue::new();
        let a = queue.register(1, 1);
        let _b = queue.register(2, 1);
        let c = queue.register(3, 1);

        a[0].done();
        c[0].done();
        assert_eq!(queue.advance(), Some(1));
        assert_eq!(queue.depth(), 2);
    }
}
