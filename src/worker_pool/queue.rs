//! The priority queue backing the worker pool: a `BinaryHeap` ordered by
//! `queued_at` (oldest first), guarded by a `Mutex` and paired with a
//! `Notify` so idle workers don't have to busy-poll.

use std::{cmp::Ordering, collections::BinaryHeap};

use tokio::sync::{Mutex, Notify};

use crate::model::Request;

/// One heap entry. Ordering is reversed so the `BinaryHeap` (a max-heap)
/// pops the request with the *oldest* `queued_at` first.
struct HeapEntry(Request);

impl HeapEntry {
    fn queued_at(&self) -> std::time::Instant {
        self.0.queued_at.expect("requests must be stamped before entering the queue")
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.queued_at() == other.queued_at()
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.queued_at().cmp(&self.queued_at())
    }
}

/// How long a worker waits on an empty queue before re-checking the
/// watchdog.
pub const POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

/// A shared, priority-ordered work queue.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
}

impl PriorityQueue {
    /// Build an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a request (which must already have `queued_at` set).
    pub async fn push(&self, request: Request) {
        let mut heap = self.heap.lock().await;
        heap.push(HeapEntry(request));
        drop(heap);
        self.notify.notify_one();
    }

    /// Pop the oldest request, waiting up to [`POLL_TIMEOUT`] if the queue
    /// is currently empty. Returns `None` on timeout (not "queue closed" —
    /// callers should re-check their own termination condition and loop).
    pub async fn pop_wait(&self) -> Option<Request> {
        {
            let mut heap = self.heap.lock().await;
            if let Some(entry) = heap.pop() {
                return Some(entry.0);
            }
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(POLL_TIMEOUT, notified).await;
        let mut heap = self.heap.lock().await;
        heap.pop().map(|entry| entry.0)
    }

    /// Current queue length, for diagnostics.
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn stamped(id: &str, queued_at: Instant) -> Request {
        let mut request = Request::new(id, "m", vec![]);
        request.queued_at = Some(queued_at);
        request
    }

    #[tokio::test]
    async fn pops_oldest_first() {
        let queue = PriorityQueue::new();
        let now = Instant::now();
        queue.push(stamped("newer", now + Duration::from_secs(1))).await;
        queue.push(stamped("older", now)).await;

        let first = queue.pop_wait().await.unwrap();
        assert_eq!(first.id, "older");
        let second = queue.pop_wait().await.unwrap();
        assert_eq!(second.id, "newer");
    }

    #[tokio::test]
    async fn pop_wait_times_out_on_empty_queue() {
        let queue = PriorityQueue::new();
        let start = Instant::now();
        let result = queue.pop_wait().await;
        assert!(result.is_none());
        assert!(start.elapsed() >= POLL_TIMEOUT.mul_f64(0.9));
    }
}
