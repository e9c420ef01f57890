//! Deduplicating recheck queue.
//!
//! Every job status change enqueues a "recheck this run" item. Multiple
//! enqueues for the same run collapse into one pending recheck; the handler
//! re-reads all rows fresh, so delivery is at-least-once and recomputation is
//! idempotent.

use ferrite_core::ids::RunId;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

/// FIFO queue of runs awaiting dependency re-resolution, deduplicated while
/// pending.
pub struct RecheckQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    order: VecDeque<RunId>,
    pending: HashSet<RunId>,
}

impl RecheckQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                pending: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a recheck for a run. A run already pending is not enqueued
    /// again; once popped it may be re-enqueued freely.
    pub fn push(&self, run_id: RunId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.insert(run_id) {
            inner.order.push_back(run_id);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wait for the next run to recheck.
    pub async fn pop(&self) -> RunId {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(run_id) = inner.order.pop_front() {
                    inner.pending.remove(&run_id);
                    return run_id;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Pop without waiting; used by tests and drain loops.
    pub fn try_pop(&self) -> Option<RunId> {
        let mut inner = self.inner.lock().unwrap();
        let run_id = inner.order.pop_front()?;
        inner.pending.remove(&run_id);
        Some(run_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecheckQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_while_pending() {
        let queue = RecheckQueue::new();
        let run = RunId::new();

        queue.push(run);
        queue.push(run);
        queue.push(run);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.try_pop(), Some(run));
        assert_eq!(queue.try_pop(), None);

        // After popping, the run may be queued again.
        queue.push(run);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_order() {
        let queue = RecheckQueue::new();
        let first = RunId::new();
        let second = RunId::new();

        queue.push(first);
        queue.push(second);
        assert_eq!(queue.try_pop(), Some(first));
        assert_eq!(queue.try_pop(), Some(second));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(RecheckQueue::new());
        let run = RunId::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(run);

        assert_eq!(waiter.await.unwrap(), run);
    }
}
