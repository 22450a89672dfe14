use std::time::{Duration, Instant};

use crate::runtime::{IoContext, IoExecutor};
use crate::time::{INVALID_TIMER_ID, TimerId, TimerStatus};

/// One-deadline-at-a-time timer over a loop's timer queue.
///
/// Setting a new deadline or dropping the timer cancels the pending wait
/// (without delivery; the queued handler is simply dropped). The loop
/// invokes the wait handler with [`TimerStatus::Expired`] once the deadline
/// passes, in non-decreasing deadline order relative to other timers.
// Stand-in deadline for a timer with no expiry set: far enough out that it
// never fires in practice, close enough that Instant arithmetic cannot
// overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug)]
pub struct SteadyTimer {
    executor: IoExecutor,
    expiry: Option<Instant>,
    timer_id: TimerId,
}

impl SteadyTimer {
    /// A timer with no deadline set yet.
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            executor: ctx.executor(),
            expiry: None,
            timer_id: INVALID_TIMER_ID,
        }
    }

    /// A timer expiring `after` from now.
    pub fn after(ctx: &IoContext, after: Duration) -> Self {
        let mut timer = Self::new(ctx);
        timer.expiry = Some(Instant::now() + after);
        timer
    }

    /// A timer expiring at `deadline`.
    pub fn at(ctx: &IoContext, deadline: Instant) -> Self {
        let mut timer = Self::new(ctx);
        timer.expiry = Some(deadline);
        timer
    }

    /// Cancels any pending wait and moves the deadline to now + `after`.
    pub fn expires_after(&mut self, after: Duration) {
        self.cancel();
        self.expiry = Some(Instant::now() + after);
    }

    /// Cancels any pending wait and moves the deadline to `deadline`.
    pub fn expires_at(&mut self, deadline: Instant) {
        self.cancel();
        self.expiry = Some(deadline);
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Whether the deadline has passed. A timer with no deadline set is
    /// never expired.
    pub fn expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| Instant::now() >= expiry)
    }

    /// Schedules `handler` to run when the deadline passes. A previously
    /// scheduled wait on this timer is cancelled first.
    ///
    /// A wait on a timer with no deadline set is legal: it stays pending
    /// (keeping the loop alive) and never fires until cancelled, dropped, or
    /// given a real deadline.
    pub fn async_wait<F>(&mut self, handler: F)
    where
        F: FnOnce(TimerStatus) + Send + 'static,
    {
        let expiry = self
            .expiry
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        self.cancel();
        self.timer_id = self.executor.timers().add_at(expiry, Box::new(handler));
    }

    /// Cancels the pending wait, if any. Returns the number of waits
    /// cancelled (0 or 1). The cancelled handler is not invoked.
    pub fn cancel(&mut self) -> usize {
        if self.timer_id == INVALID_TIMER_ID {
            return 0;
        }

        let cancelled = self.executor.timers().cancel(self.timer_id);
        self.timer_id = INVALID_TIMER_ID;

        usize::from(cancelled)
    }
}

impl Drop for SteadyTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
