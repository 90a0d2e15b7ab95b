//! In-memory priority queue feeding the dispatcher.
//!
//! Ordering is priority class first (`critical > high > normal > low`),
//! FIFO within a class via a monotonic enqueue sequence. A job returned
//! to the queue because it could not acquire a concurrency bound keeps
//! its original sequence, so it does not lose its place.

use foreman_protocol::{JobId, RequestPriority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub priority: RequestPriority,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older).
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    seq: AtomicU64,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job_id: JobId, priority: RequestPriority) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .push(QueuedJob {
                job_id,
                priority,
                seq,
            });
        self.notify.notify_one();
    }

    /// Return a popped entry without consuming its queue position.
    pub fn push_back(&self, entry: QueuedJob) {
        self.heap.lock().expect("queue lock poisoned").push(entry);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedJob> {
        self.heap.lock().expect("queue lock poisoned").pop()
    }

    /// Wait until an entry is available.
    pub async fn pop(&self) -> QueuedJob {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let queue = JobQueue::new();
        let low = JobId::new();
        let critical = JobId::new();
        let normal = JobId::new();
        queue.push(low.clone(), RequestPriority::Low);
        queue.push(normal.clone(), RequestPriority::Normal);
        queue.push(critical.clone(), RequestPriority::Critical);

        assert_eq!(queue.try_pop().unwrap().job_id, critical);
        assert_eq!(queue.try_pop().unwrap().job_id, normal);
        assert_eq!(queue.try_pop().unwrap().job_id, low);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_fifo_within_class() {
        let queue = JobQueue::new();
        let first = JobId::new();
        let second = JobId::new();
        queue.push(first.clone(), RequestPriority::Normal);
        queue.push(second.clone(), RequestPriority::Normal);

        assert_eq!(queue.try_pop().unwrap().job_id, first);
        assert_eq!(queue.try_pop().unwrap().job_id, second);
    }

    #[test]
    fn test_push_back_keeps_position() {
        let queue = JobQueue::new();
        let first = JobId::new();
        let second = JobId::new();
        queue.push(first.clone(), RequestPriority::Normal);
        queue.push(second.clone(), RequestPriority::Normal);

        // Pop the head, fail to acquire a bound, return it: it must come
        // out first again.
        let entry = queue.try_pop().unwrap();
        assert_eq!(entry.job_id, first);
        queue.push_back(entry);
        assert_eq!(queue.try_pop().unwrap().job_id, first);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        let id = JobId::new();
        queue.push(id.clone(), RequestPriority::High);
        let entry = waiter.await.unwrap();
        assert_eq!(entry.job_id, id);
    }
}
