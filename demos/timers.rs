//! Three timers scheduled out of order fire in deadline order; a fourth is
//! cancelled and never fires.

use epollo::{IoContext, SteadyTimer, TimerStatus};
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    let ctx = IoContext::try_new()?;
    let start = Instant::now();

    let mut slow = SteadyTimer::after(&ctx, Duration::from_millis(300));
    let mut fast = SteadyTimer::after(&ctx, Duration::from_millis(100));
    let mut medium = SteadyTimer::after(&ctx, Duration::from_millis(200));
    let mut never = SteadyTimer::after(&ctx, Duration::from_millis(250));

    for (name, timer) in [("slow", &mut slow), ("fast", &mut fast), ("medium", &mut medium)] {
        timer.async_wait(move |status| {
            println!("{name} fired after {:?} ({status:?})", start.elapsed());
        });
    }

    never.async_wait(|status| println!("cancelled timer fired?! ({status:?})"));
    assert_eq!(never.cancel(), 1);
    println!("cancelled the 250ms timer");

    ctx.run()?;
    println!("loop drained after {:?}", start.elapsed());
    Ok(())
}
