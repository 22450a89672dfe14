//! Timers keyed on the monotonic clock.
//!
//! Deadlines are `std::time::Instant`s, so wall-clock adjustments never move
//! a timer. The queue orders entries by (deadline, id) and delivers each
//! handler exactly once, with a status saying why.

pub mod queue;
pub use queue::{INVALID_TIMER_ID, TimerId, TimerQueue};

pub mod timer;
pub use timer::SteadyTimer;

/// Why a timer handler is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// The deadline passed.
    Expired,
    /// The queue was cleared while the timer was still pending.
    Cancelled,
}

/// Single-shot callback invoked on expiry or cancellation delivery.
pub type TimerHandler = Box<dyn FnOnce(TimerStatus) + Send>;
