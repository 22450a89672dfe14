//! Shows how a work guard keeps a loop alive while work is still on its way.

use epollo::IoContext;
use std::sync::Arc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    println!("--- without a guard: run() exits once the queue drains ---");
    {
        let ctx = IoContext::try_new()?;
        ctx.post(|| println!("task 1 executed"));
        ctx.run()?;
        println!("run() exited");
    }

    println!("--- with a guard: an idle worker waits for late work ---");
    {
        let ctx = Arc::new(IoContext::try_new()?);
        let mut guard = ctx.make_work_guard();

        let worker = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                println!("worker: entering run()");
                ctx.run().expect("run failed");
                println!("worker: run() exited");
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        ctx.post(|| println!("task posted after a 100ms lull"));
        std::thread::sleep(Duration::from_millis(50));

        println!("main: releasing the guard");
        guard.reset();

        worker.join().expect("worker panicked");
    }

    Ok(())
}
