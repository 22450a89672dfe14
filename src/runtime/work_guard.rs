use std::sync::Arc;

use crate::runtime::context::ContextInner;
use crate::runtime::{IoContext, IoExecutor};

/// Keeps an [`IoContext`] alive while asynchronous work is in flight but not
/// yet represented by a queue entry.
///
/// Construction contributes exactly one unit to the loop's outstanding-work
/// count; [`WorkGuard::reset`] (or drop) takes it back. When the count falls
/// to zero the guard wakes any blocked `run` so it can re-evaluate its exit
/// condition. Movable; copies are prohibited; reset is idempotent.
#[derive(Debug)]
pub struct WorkGuard {
    inner: Option<Arc<ContextInner>>,
}

impl WorkGuard {
    pub fn new(ctx: &IoContext) -> Self {
        Self::from_inner(ctx.inner().clone())
    }

    pub fn from_executor(executor: &IoExecutor) -> Self {
        Self::from_inner(executor.inner().clone())
    }

    fn from_inner(inner: Arc<ContextInner>) -> Self {
        inner.increment_work();
        Self { inner: Some(inner) }
    }

    /// Releases the owned work unit. Further calls do nothing.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.decrement_work();
        }
    }

    /// Whether this guard still owns a work unit.
    pub fn owns_work(&self) -> bool {
        self.inner.is_some()
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.reset();
    }
}

impl IoContext {
    /// Convenience for [`WorkGuard::new`].
    pub fn make_work_guard(&self) -> WorkGuard {
        WorkGuard::new(self)
    }
}

impl IoExecutor {
    /// Convenience for [`WorkGuard::from_executor`].
    pub fn make_work_guard(&self) -> WorkGuard {
        WorkGuard::from_executor(self)
    }
}
