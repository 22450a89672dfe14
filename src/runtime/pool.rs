use anyhow::{Context as _, Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::runtime::{IoContext, IoExecutor, LoopConfig, WorkGuard};

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let next = AtomicUsize::new(0);
    ThreadNameFn(Arc::new(move || {
        format!("epollo-worker-{}", next.fetch_add(1, Ordering::Relaxed))
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`ThreadPool`].
#[derive(Debug)]
pub struct Builder {
    /// Number of worker threads. Defaults to one per CPU core.
    worker_threads: Option<usize>,

    /// Name fn for threads spawned by the pool.
    thread_name: ThreadNameFn,

    /// Stack size for threads spawned by the pool.
    thread_stack_size: Option<usize>,

    /// Event loop policies for the pool's context.
    loop_cfg: LoopConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            loop_cfg: LoopConfig::default(),
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets a fixed name for threads spawned by the pool.
    ///
    /// The default name fn yields "epollo-worker-{n}" with monotonically
    /// increasing n.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function generating the name of each spawned thread.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads. The platform may
    /// round it up to its minimum.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Handlers drained per loop iteration before the reactor gets polled.
    pub fn handler_batch_limit(mut self, val: usize) -> Self {
        self.loop_cfg.handler_batch_limit = val;
        self
    }

    /// Longest a single reactor wait may block.
    pub fn reactor_wait_cap(mut self, val: Duration) -> Self {
        self.loop_cfg.reactor_wait_cap = val;
        self
    }

    /// Creates the configured pool and starts its workers.
    pub fn try_build(self) -> Result<ThreadPool> {
        let worker_threads = match self.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()
                .context("cannot determine available parallelism")?
                .get(),
        };

        let context = IoContext::with_config(self.loop_cfg)?;

        // The pool's own guard: empty-queue transients must not make workers
        // quiesce before shutdown asks them to.
        let guard = context.make_work_guard();

        let mut handles = Vec::with_capacity(worker_threads);
        for _ in 0..worker_threads {
            let mut builder = thread::Builder::new().name(self.thread_name.0());
            if let Some(stack_size) = self.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let executor = context.executor();
            let handle = builder
                .spawn(move || worker_loop(&executor))
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }

        Ok(ThreadPool {
            context,
            guard: Mutex::new(Some(guard)),
            handles: Mutex::new(handles),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(executor: &IoExecutor) {
    let ctx = IoContext::from_executor(executor);
    loop {
        match catch_unwind(AssertUnwindSafe(|| ctx.run())) {
            Ok(Ok(())) => break, // stopped, or quiesced after the guard reset
            Ok(Err(e)) => {
                tracing::error!(error = %e, "worker run failed");
            }
            Err(_) => {
                tracing::error!("worker recovered from panic");
            }
        }

        if ctx.stopped() {
            break;
        }
        // Transient failure with the loop still live: go again.
    }
}

/// Fixed set of worker threads all driving one [`IoContext`].
///
/// The pool holds an internal work guard so workers stay parked through
/// empty-queue transients. Graceful shutdown resets the guard, signals stop
/// and joins; dropping the pool does the same.
pub struct ThreadPool {
    context: IoContext,
    guard: Mutex<Option<WorkGuard>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Pool with `workers` threads and default policies.
    pub fn try_new(workers: usize) -> Result<Self> {
        Builder::new().worker_threads(workers).try_build()
    }

    /// Pool sized to the platform's parallelism hint.
    pub fn try_default() -> Result<Self> {
        Builder::new().try_build()
    }

    pub fn context(&self) -> &IoContext {
        &self.context
    }

    pub fn executor(&self) -> IoExecutor {
        self.context.executor()
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.context.post(f);
    }

    pub fn thread_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn stopped(&self) -> bool {
        self.context.stopped()
    }

    /// Releases the internal guard and stops the context. Workers return
    /// promptly; queued handlers that have not started are kept by the
    /// context (per stop semantics) and dropped with it.
    pub fn stop(&self) {
        if let Some(mut guard) = self.guard.lock().take() {
            guard.reset();
        }

        if !self.context.stopped() {
            self.context.stop();
        }
    }

    /// Joins all worker threads. Call after [`ThreadPool::stop`], or alone to
    /// wait for the pool to quiesce naturally once the guard is released.
    pub fn wait(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let mut panicked = 0;
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.wait() {
            tracing::error!(error = %e, "thread pool shut down uncleanly");
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.thread_count())
            .field("context", &self.context)
            .finish()
    }
}
