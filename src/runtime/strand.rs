use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::runtime::{Executor, IoExecutor, WorkQueue};
use crate::utils::ScopeGuard;
use crate::utils::thread::{NO_THREAD, current_thread_token};

/// Synchronous dispatches may nest this deep before falling back to a post,
/// bounding stack growth under handler recursion.
const MAX_DISPATCH_DEPTH: usize = 100;

thread_local! {
    static DISPATCH_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

// Shared with every pending drain trampoline, so the queue and flags outlive
// the strand surface if it is dropped mid-drain.
struct StrandState {
    queue: WorkQueue,

    // True while some worker is draining this strand's queue.
    draining: AtomicBool,

    // Thread token of the current drainer, NO_THREAD otherwise.
    running_thread: AtomicU64,
}

impl StrandState {
    /// Drains the strand's queue on the calling worker.
    ///
    /// At most one trampoline runs at a time per strand: entry requires
    /// having won the `draining` CAS, and release uses the double-check
    /// pattern so a handler posted between the last pop and the release is
    /// never stranded.
    fn drain(&self) {
        self.running_thread
            .store(current_thread_token(), Ordering::Relaxed);

        loop {
            if let Ok(handler) = self.queue.try_pop() {
                // A panicking handler must not terminate the strand; the next
                // handler runs exactly as a single-threaded loop would go on
                // after catching at its boundary.
                if catch_unwind(AssertUnwindSafe(handler)).is_err() {
                    tracing::error!("strand handler panicked; strand continues");
                }
                continue;
            }

            // Queue looks empty: step down before re-checking.
            self.running_thread.store(NO_THREAD, Ordering::Relaxed);
            self.draining.store(false, Ordering::Release);

            if self.queue.is_empty() {
                return;
            }

            // Work slipped in between the pop and the release; try to pick
            // the drain back up.
            if self
                .draining
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Another thread took over.
                return;
            }

            self.running_thread
                .store(current_thread_token(), Ordering::Relaxed);
        }
    }

    fn running_in_this_thread(&self) -> bool {
        self.running_thread.load(Ordering::Relaxed) == current_thread_token()
    }
}

/// Serializing executor: handlers submitted through the same strand never run
/// concurrently and run in submission order, while the strand shares its
/// workers with everything else on the underlying executor.
///
/// Consecutive handlers of one strand are separated by a happens-before edge
/// (the inner queue's lock), so user state touched only from the strand needs
/// no synchronization.
///
/// Note on ownership: handlers pending in a strand must not be the only thing
/// keeping that strand's owner alive: a handler that owns the object which
/// owns the strand forms a cycle the runtime cannot detect. Hold an
/// independent reference, or capture weak handles.
pub struct Strand<E: Executor = IoExecutor> {
    executor: E,
    state: Arc<StrandState>,
}

impl<E: Executor> Strand<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            state: Arc::new(StrandState {
                queue: WorkQueue::new(),
                draining: AtomicBool::new(false),
                running_thread: AtomicU64::new(NO_THREAD),
            }),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Appends a handler to the strand's queue, starting a drain on the
    /// underlying executor when none is running.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The strand queue is never stopped; push only fails on a stopped
        // queue, so the result carries no information here.
        let _ = self.state.queue.push(Box::new(f));

        if self
            .state
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // First in: schedule the drain. The trampoline holds its own
            // reference to the state and may outlive this strand object.
            let state = self.state.clone();
            self.executor.execute(Box::new(move || state.drain()));
        }
        // Otherwise the running drainer picks the handler up.
    }

    /// Runs `f` immediately when the caller is the strand's current drainer
    /// and the recursion cap allows it; otherwise posts.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state.running_in_this_thread() {
            return self.post(f);
        }

        let depth = DISPATCH_DEPTH.with(|d| d.get());
        if depth >= MAX_DISPATCH_DEPTH {
            // Too deep: break the recursion by deferring.
            return self.post(f);
        }

        DISPATCH_DEPTH.with(|d| d.set(depth + 1));
        // Restore the depth even when `f` panics out of this frame.
        let _restore = ScopeGuard::new(|| DISPATCH_DEPTH.with(|d| d.set(depth)));
        f();
    }

    /// Whether the calling thread is currently executing this strand's
    /// handlers.
    pub fn running_in_this_thread(&self) -> bool {
        self.state.running_in_this_thread()
    }
}

impl<E: Executor> std::fmt::Debug for Strand<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("queued", &self.state.queue.len())
            .field("draining", &self.state.draining.load(Ordering::Relaxed))
            .finish()
    }
}
