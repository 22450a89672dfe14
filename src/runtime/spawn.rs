use parking_lot::Mutex;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::runtime::Executor;

/// Awaitable trip through the event loop.
///
/// The first poll posts the resumption (the waker) as a handler on the loop
/// and returns `Pending`; resuming is a no-op that completes the future. A
/// suspended computation awaiting this is therefore re-entered on whichever
/// worker dequeues the handler, with that loop installed as the thread's
/// current context for the duration.
#[derive(Debug)]
pub struct Schedule<E: Executor> {
    executor: E,
    posted: bool,
}

impl<E: Executor> Schedule<E> {
    pub(crate) fn new(executor: E) -> Self {
        Self {
            executor,
            posted: false,
        }
    }
}

impl<E: Executor> Future for Schedule<E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.posted {
            return Poll::Ready(());
        }

        // Safety: Schedule has no `!Unpin` fields and is never moved out of
        // through this reference.
        let this = unsafe { self.get_unchecked_mut() };
        this.posted = true;
        let waker = cx.waker().clone();
        this.executor.execute(Box::new(move || waker.wake()));

        Poll::Pending
    }
}

// A detached computation being driven on an executor. Waking re-posts the
// poll step; the future itself lives behind a mutex held across the poll so
// two workers can never poll it concurrently.
struct DetachedTask<E: Executor> {
    executor: E,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
}

impl<E: Executor> DetachedTask<E> {
    fn step(task: &Arc<Self>) {
        let mut slot = task.future.lock();
        let Some(mut future) = slot.take() else {
            // Already completed (or poisoned by a panic); spurious wake.
            return;
        };

        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        // Detached mode has no channel to report on: a panicking computation
        // is dropped and the failure absorbed.
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                *slot = Some(future);
            }
            Ok(Poll::Ready(())) => {}
            Err(_) => {
                tracing::error!("detached task panicked; dropping it");
            }
        }
    }
}

impl<E: Executor> Wake for DetachedTask<E> {
    fn wake(self: Arc<Self>) {
        let task = self.clone();
        self.executor.execute(Box::new(move || DetachedTask::step(&task)));
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let task = self.clone();
        self.executor.execute(Box::new(move || DetachedTask::step(&task)));
    }
}

/// Drives `future` to completion on `executor`, detached: the output is
/// discarded and failures are swallowed.
///
/// The computation starts suspended; its first poll happens on a worker of
/// the target loop. Resumptions posted after the loop stops never execute
/// and are dropped with the queue.
pub fn spawn_detached<E, F>(executor: &E, future: F)
where
    E: Executor,
    F: Future<Output = ()> + Send + 'static,
{
    let task = Arc::new(DetachedTask {
        executor: executor.clone(),
        future: Mutex::new(Some(Box::pin(future))),
    });

    let first = task.clone();
    executor.execute(Box::new(move || DetachedTask::step(&first)));
}
