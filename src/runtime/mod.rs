//! Execution primitives: the event loop, the work queue behind it, strands,
//! the work guard and the worker pool.

/// Owning, movable, single-shot unit of work. The runtime takes sole
/// ownership on submission and either invokes it exactly once or drops it
/// unexecuted on forced shutdown.
pub type Handler = Box<dyn FnOnce() + Send>;

/// Capability to run handlers somewhere.
///
/// One indirect call per submission, amortized across a whole strand drain.
/// The production implementation is [`IoExecutor`]; strands and the spawn
/// machinery are generic over this trait so other executors can slot in.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Submits a handler for deferred execution. Submission after the
    /// executor stopped drops the handler.
    fn execute(&self, handler: Handler);
}

pub mod work_queue;
pub use work_queue::{QueueError, WorkQueue};

pub mod context;
pub use context::{IoContext, IoExecutor, LoopConfig, current_executor};

pub mod work_guard;
pub use work_guard::WorkGuard;

pub mod strand;
pub use strand::Strand;

pub mod pool;
pub use pool::{Builder, ThreadPool};

pub mod spawn;
pub use spawn::{Schedule, spawn_detached};

#[cfg(test)]
mod tests;
