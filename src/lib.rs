//! Readiness-based asynchronous execution runtime.
//!
//! The core is an event loop ([`IoContext`]) that interleaves three sources
//! of work: a FIFO of posted handlers, a monotonic timer queue, and one-shot
//! readiness registrations against the platform's notification facility
//! (epoll on Linux, kqueue on macOS/BSD, poll elsewhere on Unix). On top of
//! it sit [`Strand`] for single-threaded semantics over a shared worker pool,
//! [`WorkGuard`] for keeping an idle loop alive, [`ThreadPool`] for driving
//! one loop from many threads, and a small future adaptation layer
//! ([`Schedule`], [`spawn_detached`]).
//!
//! ```no_run
//! use epollo::{IoContext, Strand};
//!
//! let ctx = IoContext::new();
//! let strand = Strand::new(ctx.executor());
//!
//! strand.post(|| println!("runs serialized"));
//! ctx.post(|| println!("runs wherever"));
//!
//! ctx.run().unwrap();
//! ```

pub mod runtime;
pub use runtime::{
    Builder, Executor, Handler, IoContext, IoExecutor, LoopConfig, QueueError, Schedule, Strand,
    ThreadPool, WorkGuard, WorkQueue, current_executor, spawn_detached,
};

pub mod reactor;
pub use reactor::{CompletionHandler, Interest, PlatformReactor};

pub mod time;
pub use time::{SteadyTimer, TimerHandler, TimerId, TimerQueue, TimerStatus};

pub mod net;

pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
