//! Posts racing increments through a strand and shows that at most one
//! handler of the strand runs at a time across a 4-worker pool.

use epollo::{Strand, ThreadPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

const TASKS: usize = 100;

fn main() -> anyhow::Result<()> {
    let pool = ThreadPool::try_new(4)?;
    let strand = Strand::new(pool.executor());

    let counter = Arc::new(AtomicUsize::new(0));
    let current = Arc::new(AtomicI64::new(0));
    let max_concurrent = Arc::new(AtomicI64::new(0));

    println!("posting {TASKS} tasks to the strand...");

    for _ in 0..TASKS {
        let counter = counter.clone();
        let current = current.clone();
        let max_concurrent = max_concurrent.clone();

        strand.post(move || {
            let inside = current.fetch_add(1, Ordering::SeqCst) + 1;
            max_concurrent.fetch_max(inside, Ordering::SeqCst);

            // Work that would race without serialization.
            let old = counter.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_micros(10));
            counter.store(old + 1, Ordering::Relaxed);

            current.fetch_sub(1, Ordering::SeqCst);
        });
    }

    while counter.load(Ordering::Relaxed) < TASKS {
        std::thread::sleep(Duration::from_millis(1));
    }
    pool.stop();
    pool.wait()?;

    println!("counter:        {} (expected {TASKS})", counter.load(Ordering::Relaxed));
    println!("max concurrent: {} (expected 1)", max_concurrent.load(Ordering::SeqCst));

    Ok(())
}
