use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::time::{TimerHandler, TimerStatus};

/// Identifier handed out by [`TimerQueue::add_at`]. Strictly monotonic per
/// queue; [`INVALID_TIMER_ID`] is never returned.
pub type TimerId = u64;

/// Reserved "no timer" id.
pub const INVALID_TIMER_ID: TimerId = 0;

struct TimerSlot(TimerHandler);

// Safety: a handler is only ever inspected or moved out under the map's
// write lock; readers see keys, never the slot's interior. The FnOnce inside
// is Send, which is all the move-out needs.
unsafe impl Sync for TimerSlot {}

#[derive(Default)]
struct TimerMap {
    // Keyed by (deadline, id): ascending iteration yields expiry order with
    // ties broken by insertion id.
    timers: BTreeMap<(Instant, TimerId), TimerSlot>,
    // id -> deadline, so cancel can find the full key in O(1) + O(log n).
    index: HashMap<TimerId, Instant>,
}

/// Ordered set of deadline -> handler entries.
///
/// The event loop takes shared access for queries (`next_expiry`,
/// `has_expired`) and exclusive access for mutation; timers may be added or
/// cancelled from any thread at any time.
#[derive(Default)]
pub struct TimerQueue {
    next_id: AtomicU64,
    inner: RwLock<TimerMap>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(INVALID_TIMER_ID + 1),
            inner: RwLock::default(),
        }
    }

    fn generate_id(&self) -> TimerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedules `handler` to run once `deadline` has passed.
    pub fn add_at(&self, deadline: Instant, handler: TimerHandler) -> TimerId {
        let id = self.generate_id();

        let mut inner = self.inner.write();
        inner.timers.insert((deadline, id), TimerSlot(handler));
        inner.index.insert(id, deadline);

        id
    }

    /// Schedules `handler` to run once `duration` has elapsed from now.
    pub fn add_after(&self, duration: Duration, handler: TimerHandler) -> TimerId {
        self.add_at(Instant::now() + duration, handler)
    }

    /// Removes a pending timer. The handler is dropped, not invoked; callers
    /// wanting cancellation delivery go through [`TimerQueue::clear`].
    /// Returns whether an entry was removed.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.write();

        let Some(deadline) = inner.index.remove(&id) else {
            return false;
        };
        inner.timers.remove(&(deadline, id));

        true
    }

    /// Deadline of the earliest pending timer.
    pub fn next_expiry(&self) -> Option<Instant> {
        let inner = self.inner.read();
        inner.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Time until the earliest pending timer; zero if already overdue.
    pub fn time_until_next(&self) -> Option<Duration> {
        self.next_expiry()
            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
    }

    /// Removes and returns the earliest entry whose deadline has passed.
    pub fn pop_expired(&self) -> Option<TimerHandler> {
        let mut inner = self.inner.write();

        let (deadline, id) = *inner.timers.keys().next()?;
        if deadline > Instant::now() {
            return None;
        }

        let slot = inner.timers.remove(&(deadline, id));
        inner.index.remove(&id);
        slot.map(|TimerSlot(handler)| handler)
    }

    /// Whether any timer is overdue at `now`.
    pub fn has_expired(&self, now: Instant) -> bool {
        let inner = self.inner.read();
        match inner.timers.keys().next() {
            Some((deadline, _)) => *deadline <= now,
            None => false,
        }
    }

    /// Pops and invokes expired handlers (with [`TimerStatus::Expired`]) until
    /// none remain overdue or the clock passes `now`. The time bound keeps a
    /// burst of already-overdue timers from starving the loop; the bound is
    /// checked before each invocation, so an entry popped after the budget is
    /// exhausted is dropped without delivery. Returns the number of handlers
    /// invoked.
    pub fn process_expired(&self, now: Instant) -> usize {
        let mut count = 0;
        while let Some(handler) = self.pop_expired() {
            if Instant::now() > now {
                break;
            }
            handler(TimerStatus::Expired);
            count += 1;
        }
        count
    }

    /// Invokes every pending handler with [`TimerStatus::Cancelled`], then
    /// removes all entries.
    pub fn clear(&self) {
        // Entries are taken out before any handler runs, so a handler that
        // re-enters the queue observes it already empty.
        let drained = {
            let mut inner = self.inner.write();
            inner.index.clear();
            std::mem::take(&mut inner.timers)
        };

        for (_, TimerSlot(handler)) in drained {
            handler(TimerStatus::Cancelled);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().timers.len()
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue").field("len", &self.len()).finish()
    }
}
