use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::runtime::Handler;

/// Why a pop returned no handler.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No handler was available. Transient; callers retry or wait.
    #[error("work queue is empty")]
    Empty,

    /// The queue was stopped. Terminal for this queue until `restart`.
    #[error("work queue is stopped")]
    Stopped,
}

/// Multi-producer/multi-consumer FIFO of single-shot handlers.
///
/// A single mutex plus a condvar is deliberate: the queue is not a throughput
/// bottleneck at the designed load, and blocking takes need a cross-thread
/// wake-up that pairs naturally with a condvar. Strict FIFO holds across all
/// enqueue/dequeue paths as observed under the lock.
///
/// Dropping the queue drops any remaining handlers without invoking them.
#[derive(Default)]
pub struct WorkQueue {
    stopped: AtomicBool,
    cv: Condvar,
    queue: Mutex<VecDeque<Handler>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler and wakes one waiter. Returns false when the queue
    /// is stopped; the handler is dropped unexecuted in that case.
    #[must_use = "a false return means the handler was dropped unexecuted"]
    pub fn push(&self, item: Handler) -> bool {
        let mut queue = self.queue.lock();

        if self.stopped.load(Ordering::Acquire) {
            return false;
        }

        queue.push_back(item);
        self.cv.notify_one();

        true
    }

    /// Blocks until a handler is available or the queue is stopped.
    pub fn pop(&self) -> Result<Handler, QueueError> {
        let mut queue = self.queue.lock();

        self.cv
            .wait_while(&mut queue, |q| q.is_empty() && !self.stopped.load(Ordering::Acquire));

        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        // Non-empty by the wait condition.
        Ok(queue.pop_front().expect("queue cannot be empty here"))
    }

    /// Blocks until a handler is available, the queue is stopped, or the
    /// release predicate returns true.
    ///
    /// The predicate lets the event loop be woken on a work-guard release
    /// without posting a spurious handler. When released by the predicate and
    /// no handler is available, returns `Empty`.
    pub fn pop_while<P>(&self, mut release: P) -> Result<Handler, QueueError>
    where
        P: FnMut() -> bool,
    {
        let mut queue = self.queue.lock();

        self.cv.wait_while(&mut queue, |q| {
            q.is_empty() && !self.stopped.load(Ordering::Acquire) && !release()
        });

        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        queue.pop_front().ok_or(QueueError::Empty)
    }

    /// Non-blocking take of the oldest handler.
    pub fn try_pop(&self) -> Result<Handler, QueueError> {
        let mut queue = self.queue.lock();

        match queue.pop_front() {
            Some(item) => Ok(item),
            None if self.stopped.load(Ordering::Acquire) => Err(QueueError::Stopped),
            None => Err(QueueError::Empty),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Signals stop and releases every blocked consumer. Idempotent.
    pub fn stop(&self) {
        // Take the lock so a concurrent pop cannot observe the flag between
        // its wait-condition check and going to sleep, missing the broadcast.
        let _queue = self.queue.lock();
        self.stopped.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Re-arms a stopped queue so pushes succeed again.
    pub fn restart(&self) {
        let _queue = self.queue.lock();
        self.stopped.store(false, Ordering::Release);
    }

    /// Drops all queued handlers without invoking them.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Wakes every blocked consumer so it can re-check its release condition.
    pub fn notify_all(&self) {
        let _queue = self.queue.lock();
        self.cv.notify_all();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    assert_impl_all!(WorkQueue: Send, Sync);

    fn noop() -> Handler {
        Box::new(|| {})
    }

    #[test]
    fn push_pop_preserves_fifo_order() {
        let queue = WorkQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            assert!(queue.push(Box::new(move || seen.lock().push(i))));
        }

        while let Ok(handler) = queue.try_pop() {
            handler();
        }

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn try_pop_tags_empty_and_stopped() {
        let queue = WorkQueue::new();
        assert!(matches!(queue.try_pop(), Err(QueueError::Empty)));

        queue.stop();
        assert!(matches!(queue.try_pop(), Err(QueueError::Stopped)));
    }

    #[test]
    fn push_fails_after_stop() {
        let queue = WorkQueue::new();
        queue.stop();
        assert!(!queue.push(noop()));
        assert!(queue.is_empty());
    }

    #[test]
    fn stop_releases_blocked_consumers() {
        let queue = Arc::new(WorkQueue::new());

        let consumers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.pop())
            })
            .collect::<Vec<_>>();

        // Give the consumers a moment to block.
        std::thread::sleep(Duration::from_millis(20));
        queue.stop();

        let start = Instant::now();
        for consumer in consumers {
            assert!(matches!(consumer.join().unwrap(), Err(QueueError::Stopped)));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pop_while_released_by_predicate_returns_empty() {
        let queue = Arc::new(WorkQueue::new());
        let released = Arc::new(AtomicBool::new(false));

        let handle = {
            let queue = queue.clone();
            let released = released.clone();
            std::thread::spawn(move || queue.pop_while(|| released.load(Ordering::Acquire)))
        };

        std::thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::Release);
        queue.notify_all();

        assert!(matches!(handle.join().unwrap(), Err(QueueError::Empty)));
    }

    #[test]
    fn pop_while_prefers_handler_over_release() {
        let queue = WorkQueue::new();
        assert!(queue.push(noop()));
        assert!(queue.pop_while(|| true).is_ok());
    }

    #[test]
    fn clear_drops_handlers_without_invoking() {
        let queue = WorkQueue::new();
        let invoked = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let invoked = invoked.clone();
            assert!(queue.push(Box::new(move || {
                invoked.fetch_add(1, Ordering::Relaxed);
            })));
        }

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(invoked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn restart_rearms_a_stopped_queue() {
        let queue = WorkQueue::new();
        queue.stop();
        assert!(!queue.push(noop()));

        queue.restart();
        assert!(!queue.is_stopped());
        assert!(queue.push(noop()));
        assert_eq!(queue.len(), 1);
    }

    // Single producer, multiple consumers: every pushed handler is executed
    // exactly once, and dequeue order under the lock is FIFO.
    #[test]
    fn concurrent_consumers_drain_everything_exactly_once() {
        let queue = Arc::new(WorkQueue::new());

        let consumers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut executed = 0usize;
                    loop {
                        match queue.pop() {
                            Ok(handler) => handler(),
                            Err(QueueError::Stopped) => break,
                            Err(QueueError::Empty) => unreachable!("plain pop never returns Empty"),
                        }
                        executed += 1;
                    }
                    executed
                })
            })
            .collect::<Vec<_>>();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..1000usize {
            let order = order.clone();
            assert!(queue.push(Box::new(move || order.lock().push(i))));
        }

        while order.lock().len() < 1000 {
            std::thread::yield_now();
        }
        queue.stop();

        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 1000);

        // Handlers run outside the queue lock, so cross-consumer completion
        // order may interleave, but every index must appear exactly once.
        let mut observed = order.lock().clone();
        observed.sort_unstable();
        assert_eq!(observed, (0..1000).collect::<Vec<_>>());
    }
}
