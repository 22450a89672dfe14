use anyhow::{Result, anyhow};
use std::cell::RefCell;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::reactor::PlatformReactor;
use crate::runtime::{Executor, Handler, Schedule, WorkQueue};
use crate::time::{TimerQueue, TimerStatus};
use crate::utils::ScopeGuard;

/// Handlers drained per loop iteration before the reactor gets a turn, so a
/// steady stream of posts cannot starve I/O completions.
const HANDLER_BATCH_LIMIT: usize = 64;

/// Upper bound on a single reactor wait. Keeps worst-case latency bounded
/// even if a wake-up is lost; the wake channel makes the common case prompt.
#[cfg(not(test))]
const REACTOR_WAIT_CAP: Duration = Duration::from_millis(100);

#[cfg(test)]
const REACTOR_WAIT_CAP: Duration = Duration::from_millis(10); // make tests tick faster

/// Event loop policies. The defaults fit most workloads; the thread-pool
/// [`Builder`](crate::runtime::Builder) exposes them for tuning.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Handlers drained per iteration before polling the reactor.
    pub handler_batch_limit: usize,

    /// Longest a single reactor wait may block.
    pub reactor_wait_cap: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            handler_batch_limit: HANDLER_BATCH_LIMIT,
            reactor_wait_cap: REACTOR_WAIT_CAP,
        }
    }
}

impl LoopConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.handler_batch_limit == 0 {
            return Err(anyhow!("handler_batch_limit must be greater than 0"));
        }

        if self.reactor_wait_cap.is_zero() {
            return Err(anyhow!("reactor_wait_cap must be greater than 0"));
        }

        Ok(())
    }
}

// Stack of loops the current thread is inside, innermost last. A stack and
// not a single pointer because a handler may drive a second loop's `run`;
// entering pushes, leaving pops, so the outer loop's entry is restored.
thread_local! {
    static CURRENT_CONTEXT: RefCell<Vec<Arc<ContextInner>>> = const { RefCell::new(Vec::new()) };
}

/// Executor handle of the loop the calling thread is currently running, if
/// any. Set for the duration of every `run`/`run_one`/`poll` entry, so
/// handlers and resumed futures can re-submit work to their own loop.
pub fn current_executor() -> Option<IoExecutor> {
    CURRENT_CONTEXT.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|inner| IoExecutor::from_inner(inner.clone()))
    })
}

#[derive(Debug)]
pub(crate) struct ContextInner {
    stopped: AtomicBool,
    work_count: AtomicUsize,
    handlers: WorkQueue,
    reactor: PlatformReactor,
    timers: TimerQueue,
    cfg: LoopConfig,
}

impl ContextInner {
    fn has_pending_work(&self) -> bool {
        !self.handlers.is_empty()
            || self.work_count.load(Ordering::Acquire) > 0
            || !self.timers.is_empty()
            || !self.reactor.is_empty()
    }

    /// How long the reactor may block this iteration.
    fn wait_budget(&self) -> Duration {
        // Ready handlers: don't wait at all.
        if !self.handlers.is_empty() {
            return Duration::ZERO;
        }

        if let Some(until_next) = self.timers.time_until_next() {
            return until_next.min(self.cfg.reactor_wait_cap);
        }

        // Work guards or registered I/O justify sleeping; otherwise the loop
        // is about to exit and must not block.
        if self.work_count.load(Ordering::Acquire) > 0 || !self.reactor.is_empty() {
            return self.cfg.reactor_wait_cap;
        }

        Duration::ZERO
    }

    /// Moves every overdue timer onto the work queue, binding the ordinary
    /// expiry indication. Queue FIFO preserves the (deadline, id) order.
    fn enqueue_expired_timers(&self) {
        while let Some(handler) = self.timers.pop_expired() {
            if !self.handlers.push(Box::new(move || handler(TimerStatus::Expired))) {
                // Stopped mid-expiry; the handler is dropped like any other
                // post that loses the race with stop.
                break;
            }
        }
    }

    /// Runs one handler inside a failure-isolation scope. A panicking handler
    /// never takes its worker down.
    fn invoke(handler: Handler) {
        if catch_unwind(AssertUnwindSafe(handler)).is_err() {
            tracing::error!("handler panicked; worker continues");
        }
    }

    /// Executes up to `limit` ready handlers, returning how many ran.
    fn drain(&self, limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            match self.handlers.try_pop() {
                Ok(handler) => {
                    Self::invoke(handler);
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }

    pub(crate) fn post(&self, handler: Handler) {
        if self.handlers.push(handler) {
            // A worker may be asleep in the reactor; get it to re-evaluate.
            self.reactor.wake();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn increment_work(&self) {
        self.work_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_work(&self) {
        let previous = self.work_count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "work count underflow");

        if previous == 1 {
            // Last guard gone: wake anything blocked so `run` can re-evaluate
            // its exit condition. Required for correctness, not latency.
            self.handlers.notify_all();
            self.reactor.wake();
        }
    }
}

// Installs `inner` as the thread's current loop for the returned guard's
// lifetime, restoring the previous entry (if any) on exit, including exits
// by unwinding.
fn enter(inner: &Arc<ContextInner>) -> impl Drop + use<> {
    CURRENT_CONTEXT.with(|stack| stack.borrow_mut().push(inner.clone()));
    ScopeGuard::new(|| {
        CURRENT_CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    })
}

// Whether `inner` is the loop the calling thread is innermost-running.
fn running_in_this_thread(inner: &Arc<ContextInner>) -> bool {
    CURRENT_CONTEXT.with(|stack| {
        stack
            .borrow()
            .last()
            .is_some_and(|top| Arc::ptr_eq(top, inner))
    })
}

/// The event loop: alternates between executing queued handlers, expiring
/// timers and waiting for I/O readiness.
///
/// Multiple threads may call [`IoContext::run`] concurrently on the same
/// loop; handlers execute on whichever worker dequeues them. The loop exits
/// once stopped or once no work remains, where "work" is queued handlers,
/// outstanding [work guards](crate::runtime::WorkGuard), pending timers or
/// registered descriptors.
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl IoContext {
    /// Creates a loop with default policies.
    ///
    /// # Panics
    ///
    /// Panics when the platform notification facility cannot be created
    /// (descriptor exhaustion). Use [`IoContext::try_new`] to handle that.
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(ctx) => ctx,
            Err(e) => panic!("failed to create io context: {e:?}"),
        }
    }

    pub fn try_new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(cfg: LoopConfig) -> Result<Self> {
        cfg.validate()?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                stopped: AtomicBool::new(false),
                work_count: AtomicUsize::new(0),
                handlers: WorkQueue::new(),
                reactor: PlatformReactor::new()?,
                timers: TimerQueue::new(),
                cfg,
            }),
        })
    }

    /// Drives the loop until it is stopped or out of work.
    pub fn run(&self) -> io::Result<()> {
        let _entered = enter(&self.inner);

        while !self.stopped() {
            if !self.inner.has_pending_work() {
                break;
            }

            self.inner.drain(self.inner.cfg.handler_batch_limit);

            let budget = self.inner.wait_budget();
            self.inner.enqueue_expired_timers();
            self.inner.reactor.run_one(budget)?;

            self.inner.drain(self.inner.cfg.handler_batch_limit);
        }

        Ok(())
    }

    /// Executes at most one ready unit (a queued handler or an I/O
    /// completion) without unbounded blocking. Returns how many ran (0 or 1).
    pub fn run_one(&self) -> io::Result<usize> {
        let _entered = enter(&self.inner);

        self.inner.enqueue_expired_timers();
        if let Ok(handler) = self.inner.handlers.try_pop() {
            ContextInner::invoke(handler);
            return Ok(1);
        }

        let budget = self.inner.wait_budget();
        let completed = self.inner.reactor.run_one(budget)?;

        self.inner.enqueue_expired_timers();
        if let Ok(handler) = self.inner.handlers.try_pop() {
            ContextInner::invoke(handler);
            return Ok(1);
        }

        Ok(usize::from(completed > 0))
    }

    /// Runs all currently-ready work without blocking. Returns the number of
    /// handlers and completions executed.
    pub fn poll(&self) -> io::Result<usize> {
        let _entered = enter(&self.inner);

        self.inner.enqueue_expired_timers();
        let mut count = self.inner.reactor.poll_one()?;
        count += self.inner.drain(usize::MAX);

        Ok(count)
    }

    /// Runs at most one ready unit without blocking.
    pub fn poll_one(&self) -> io::Result<usize> {
        let _entered = enter(&self.inner);

        self.inner.enqueue_expired_timers();
        let completed = self.inner.reactor.poll_one()?;

        if let Ok(handler) = self.inner.handlers.try_pop() {
            ContextInner::invoke(handler);
            return Ok(1);
        }

        Ok(usize::from(completed > 0))
    }

    /// Enqueues a handler for deferred execution. Always deferred, even when
    /// called from a worker thread.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.post(Box::new(f));
    }

    /// Runs `f` synchronously when the caller is inside a `run` entry of this
    /// loop, otherwise behaves as [`IoContext::post`].
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running_in_this_thread() {
            debug_assert!(!self.stopped(), "dispatch on a stopped context");
            f();
        } else {
            self.post(f);
        }
    }

    /// Signals stop: blocked takes are released, a sleeping reactor wait is
    /// woken and every `run` entry returns promptly. Pending handlers are
    /// kept and survive into the next [`IoContext::restart`].
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.handlers.stop();
        self.inner.reactor.wake();
    }

    pub fn stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Prepares a stopped loop for a new set of `run` calls: drops pending
    /// handlers and re-arms the queue. Timers and reactor registrations are
    /// preserved.
    ///
    /// # Panics
    ///
    /// Panics when the loop is not stopped.
    pub fn restart(&self) {
        assert!(self.stopped(), "restart requires a stopped context");

        self.inner.handlers.clear();
        self.inner.handlers.restart();
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Lightweight handle equating exactly this loop.
    pub fn executor(&self) -> IoExecutor {
        IoExecutor {
            inner: self.inner.clone(),
        }
    }

    /// Whether the calling thread is currently inside a `run`-family entry of
    /// this loop.
    pub fn running_in_this_thread(&self) -> bool {
        running_in_this_thread(&self.inner)
    }

    /// An awaitable that re-enters the loop: suspension posts the resumption
    /// as a handler.
    pub fn schedule(&self) -> Schedule<IoExecutor> {
        Schedule::new(self.executor())
    }

    /// The readiness backend, for the socket layer.
    pub fn reactor(&self) -> &PlatformReactor {
        &self.inner.reactor
    }

    /// The timer queue. Timers may be added or cancelled from any thread.
    pub fn timers(&self) -> &TimerQueue {
        &self.inner.timers
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    // A second surface over the same shared loop state, for pool workers.
    pub(crate) fn from_executor(executor: &IoExecutor) -> IoContext {
        IoContext {
            inner: executor.inner().clone(),
        }
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("stopped", &self.stopped())
            .field("queued", &self.inner.handlers.len())
            .field("work_count", &self.inner.work_count.load(Ordering::Relaxed))
            .field("timers", &self.inner.timers.len())
            .field("registered", &self.inner.reactor.len())
            .finish()
    }
}

/// Cheap, clonable handle to an [`IoContext`]. Two handles compare equal
/// exactly when they refer to the same loop.
#[derive(Clone)]
pub struct IoExecutor {
    inner: Arc<ContextInner>,
}

impl IoExecutor {
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.post(Box::new(f));
    }

    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running_in_this_thread() {
            debug_assert!(!self.inner.is_stopped(), "dispatch on a stopped context");
            f();
        } else {
            self.post(f);
        }
    }

    pub fn running_in_this_thread(&self) -> bool {
        running_in_this_thread(&self.inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn schedule(&self) -> Schedule<IoExecutor> {
        Schedule::new(self.clone())
    }

    /// The readiness backend, for the socket layer.
    pub fn reactor(&self) -> &PlatformReactor {
        &self.inner.reactor
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.inner.timers
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl Executor for IoExecutor {
    fn execute(&self, handler: Handler) {
        self.inner.post(handler);
    }
}

impl PartialEq for IoExecutor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IoExecutor {}

impl std::fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoExecutor")
            .field("context", &Arc::as_ptr(&self.inner))
            .finish()
    }
}
