//! End-to-end scenarios driving the loop, strands, guards and timers
//! together, the way applications combine them.

use super::*;
use crate::test_utils::Tracker;
use crate::time::{SteadyTimer, TimerStatus};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(IoContext: Send, Sync);
assert_impl_all!(IoExecutor: Send, Sync, Clone);

#[test]
fn single_handler_runs_once() {
    let ctx = IoContext::new();
    let cell = Arc::new(AtomicUsize::new(0));

    let slot = cell.clone();
    ctx.post(move || slot.store(42, Ordering::Relaxed));

    assert_eq!(ctx.run_one().unwrap(), 1);
    assert_eq!(cell.load(Ordering::Relaxed), 42);

    // Nothing left.
    assert_eq!(ctx.run_one().unwrap(), 0);
}

#[test]
fn run_executes_in_fifo_order_and_exits() {
    let ctx = IoContext::new();
    let sequence = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let sequence = sequence.clone();
        ctx.post(move || sequence.lock().push(i));
    }

    ctx.run().unwrap();
    assert_eq!(*sequence.lock(), (0..10).collect::<Vec<_>>());
    assert!(!ctx.stopped(), "natural exit is not a stop");
}

#[test]
fn multi_threaded_drain_with_guard() {
    let ctx = Arc::new(IoContext::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut guard = ctx.make_work_guard();

    let workers = (0..4)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.run().unwrap())
        })
        .collect::<Vec<_>>();

    for _ in 0..1000 {
        let counter = counter.clone();
        ctx.post(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::Relaxed) < 1000 {
        assert!(Instant::now() < deadline, "handlers did not drain");
        thread::sleep(Duration::from_millis(1));
    }

    guard.reset();
    let start = Instant::now();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
}

#[rstest]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn strand_serializes_under_load(#[case] workers: usize) {
    let pool = ThreadPool::try_new(workers).unwrap();
    let strand = Strand::new(pool.executor());

    // A non-atomic cell is safe here exactly because of the strand's
    // serialization and happens-before guarantees.
    struct State {
        plain_counter: u64,
    }
    let state = Arc::new(Mutex::new(State { plain_counter: 0 }));

    let current = Arc::new(AtomicI64::new(0));
    let max_concurrent = Arc::new(AtomicI64::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    const TASKS: usize = 1000;
    for _ in 0..TASKS {
        let state = state.clone();
        let current = current.clone();
        let max_concurrent = max_concurrent.clone();
        let completed = completed.clone();

        strand.post(move || {
            let inside = current.fetch_add(1, Ordering::SeqCst) + 1;
            max_concurrent.fetch_max(inside, Ordering::SeqCst);

            state.lock().plain_counter += 1;

            current.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while completed.load(Ordering::SeqCst) < TASKS {
        assert!(Instant::now() < deadline, "strand did not drain");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(state.lock().plain_counter, TASKS as u64);
    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
}

#[test]
fn strand_posts_preserve_submission_order_across_workers() {
    let pool = ThreadPool::try_new(4).unwrap();
    let strand = Strand::new(pool.executor());
    let observed = Arc::new(Mutex::new(Vec::new()));

    const TASKS: u64 = 500;
    for i in 0..TASKS {
        let observed = observed.clone();
        strand.post(move || observed.lock().push(i));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while (observed.lock().len() as u64) < TASKS {
        assert!(Instant::now() < deadline, "strand did not drain");
        thread::sleep(Duration::from_millis(1));
    }

    let observed = observed.lock();
    assert!(
        observed.windows(2).all(|w| w[0] < w[1]),
        "submission order violated: {observed:?}"
    );
}

#[test]
fn dispatch_inside_a_worker_is_synchronous() {
    let ctx = IoContext::new();
    let tracker = Tracker::new();

    let executor = ctx.executor();
    let events = tracker.clone();
    ctx.post(move || {
        events.record("log", 1); // outer-start

        let inner_events = events.clone();
        executor.dispatch(move || inner_events.record("log", 2)); // inner

        // dispatch returned only after the inner handler ran.
        assert_eq!(events.get("log"), vec![1, 2]);
        events.record("log", 3); // outer-end
    });

    ctx.run().unwrap();
    assert_eq!(tracker.get("log"), vec![1, 2, 3]);
}

#[test]
fn dispatch_from_outside_any_worker_defers() {
    let ctx = IoContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    ctx.dispatch(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(ran.load(Ordering::Relaxed), 0, "not a worker: must defer");
    ctx.run().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

#[test]
fn dispatch_runs_on_the_calling_stack() {
    let pool = ThreadPool::try_new(2).unwrap();
    let executor = pool.executor();

    let (tx, rx) = std::sync::mpsc::channel();
    let dispatcher = executor.clone();
    executor.post(move || {
        let caller = thread::current().id();
        let tx2 = tx.clone();
        dispatcher.dispatch(move || {
            let _ = tx2.send((caller, thread::current().id()));
        });
    });

    let (caller, callee) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(caller, callee);
}

#[test]
fn timers_fire_in_deadline_order() {
    let ctx = IoContext::new();
    let tracker = Tracker::new();
    let now = Instant::now();

    // Scheduled as T3, T1, T2 on purpose.
    let mut t3 = SteadyTimer::at(&ctx, now + Duration::from_millis(30));
    let mut t1 = SteadyTimer::at(&ctx, now + Duration::from_millis(10));
    let mut t2 = SteadyTimer::at(&ctx, now + Duration::from_millis(20));

    for (tag, timer) in [(3u64, &mut t3), (1, &mut t1), (2, &mut t2)] {
        let deadline = timer.expiry().unwrap();
        let events = tracker.clone();
        timer.async_wait(move |status| {
            assert_eq!(status, TimerStatus::Expired);
            assert!(Instant::now() >= deadline);
            events.record("fired", tag);
        });
    }

    ctx.run().unwrap();
    assert_eq!(tracker.get("fired"), vec![1, 2, 3]);
}

#[test]
fn cancelled_timer_never_fires() {
    let ctx = IoContext::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = SteadyTimer::after(&ctx, Duration::from_millis(50));
    let counter = fired.clone();
    timer.async_wait(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    thread::sleep(Duration::from_millis(10));
    assert_eq!(timer.cancel(), 1);

    // Drive the loop past the original deadline.
    let mut fence = SteadyTimer::after(&ctx, Duration::from_millis(100));
    fence.async_wait(|_| {});
    ctx.run().unwrap();

    assert_eq!(fired.load(Ordering::Relaxed), 0);
}

#[test]
fn work_guard_keeps_an_idle_worker_alive() {
    let ctx = Arc::new(IoContext::new());
    let tracker = Tracker::new();

    let guard = Arc::new(Mutex::new(Some(ctx.make_work_guard())));

    let worker = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.run().unwrap())
    };

    // No handlers posted for a while; the guard is all that holds the loop.
    thread::sleep(Duration::from_millis(100));
    assert!(!worker.is_finished(), "worker exited despite the guard");

    let events = tracker.clone();
    ctx.post(move || events.record("late", 1));
    guard.lock().take();

    let start = Instant::now();
    worker.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1), "worker exit was not prompt");
    assert_eq!(tracker.count("late"), 1, "late handler must run before exit");
}

#[test]
fn stop_preserves_pending_handlers_until_restart() {
    let ctx = IoContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    ctx.post(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    ctx.stop();
    assert!(ctx.stopped());

    // Stopped: nothing runs.
    ctx.run().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    // Restart drops the survivors and re-arms the loop.
    ctx.restart();
    assert!(!ctx.stopped());
    ctx.run().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    let counter = ran.clone();
    ctx.post(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    ctx.run().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

#[test]
#[should_panic(expected = "restart requires a stopped context")]
fn restart_while_running_is_a_contract_violation() {
    let ctx = IoContext::new();
    ctx.restart();
}

#[test]
fn executors_compare_by_loop_identity() {
    let ctx_a = IoContext::new();
    let ctx_b = IoContext::new();

    assert_eq!(ctx_a.executor(), ctx_a.executor());
    assert_ne!(ctx_a.executor(), ctx_b.executor());
}

#[test]
fn stop_releases_concurrent_runners_promptly() {
    let ctx = Arc::new(IoContext::new());
    let _guard = ctx.make_work_guard();

    let workers = (0..4)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.run().unwrap())
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_millis(20));
    ctx.stop();

    let start = Instant::now();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn poll_runs_ready_work_without_blocking() {
    let ctx = IoContext::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let counter = counter.clone();
        ctx.post(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let start = Instant::now();
    assert_eq!(ctx.poll().unwrap(), 5);
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(ctx.poll().unwrap(), 0);
}

#[test]
fn poll_one_runs_at_most_one_unit() {
    let ctx = IoContext::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = counter.clone();
        ctx.post(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert_eq!(ctx.poll_one().unwrap(), 1);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn nested_run_restores_the_outer_current_context() {
    let outer = IoContext::new();
    let inner = Arc::new(IoContext::new());

    let outer_executor = outer.executor();
    let checks = Arc::new(AtomicUsize::new(0));

    {
        let inner = inner.clone();
        let outer_executor = outer_executor.clone();
        let checks = checks.clone();
        outer.post(move || {
            assert!(outer_executor.running_in_this_thread());

            // Drive a second loop from inside a handler of the first.
            let inner_ctx = inner.clone();
            let outer_exec = outer_executor.clone();
            let inner_checks = checks.clone();
            inner.post(move || {
                assert!(inner_ctx.running_in_this_thread());
                assert!(!outer_exec.running_in_this_thread());
                inner_checks.fetch_add(1, Ordering::Relaxed);
            });
            inner.run().unwrap();

            // Back in the outer loop's frame.
            assert!(outer_executor.running_in_this_thread());
            checks.fetch_add(1, Ordering::Relaxed);
        });
    }

    outer.run().unwrap();
    assert_eq!(checks.load(Ordering::Relaxed), 2);
}

#[test]
fn timer_queue_integrates_with_guarded_workers() {
    let pool = ThreadPool::try_new(2).unwrap();
    let tracker = Tracker::new();

    let ctx = pool.context();
    let mut timer = SteadyTimer::after(ctx, Duration::from_millis(20));
    let events = tracker.clone();
    timer.async_wait(move |status| {
        assert_eq!(status, TimerStatus::Expired);
        events.record("pool-timer", 1);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while tracker.count("pool-timer") == 0 {
        assert!(Instant::now() < deadline, "timer never fired on the pool");
        thread::sleep(Duration::from_millis(1));
    }
}
