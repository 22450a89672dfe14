//! Drives a suspended computation on the loop with spawn_detached; each
//! schedule().await hops through the work queue.

use epollo::{IoContext, spawn_detached};

fn main() -> anyhow::Result<()> {
    let ctx = IoContext::try_new()?;

    let executor = ctx.executor();
    spawn_detached(&ctx.executor(), async move {
        println!("step 1 on the loop");
        executor.schedule().await;
        println!("step 2 after a trip through the queue");
        executor.schedule().await;
        println!("step 3, done");
    });

    ctx.run()?;
    Ok(())
}
