use std::sync::atomic::{AtomicU64, Ordering};

/// Token reserved for "no thread". Strand state stores the token of the
/// thread currently draining it in an AtomicU64, and 0 means nobody is.
pub(crate) const NO_THREAD: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// A cheap, process-unique identifier for the current thread.
///
/// `std::thread::ThreadId` cannot be stored in an atomic on stable, so each
/// thread draws a u64 from a global counter on first use. Tokens are never
/// reused within a process; 0 is never handed out.
pub(crate) fn current_thread_token() -> u64 {
    TOKEN.with(|t| *t)
}
