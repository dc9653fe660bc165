//! Hooked sleep on a single worker
//!
//! A fiber sleeps for one second through the hook layer while others on
//! the same worker thread keep running.

use myrpc::{hook, FiberPool, PoolConfig, PoolResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

fn main() -> PoolResult<()> {
    myrpc::init_logging();

    let pool = FiberPool::new(PoolConfig::from_env().num_workers(1))?;
    pool.start()?;

    let woke = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicUsize::new(0));

    let w = Arc::clone(&woke);
    pool.run(move || {
        let start = Instant::now();
        hook::sleep(1);
        info!(elapsed = ?start.elapsed(), "sleeper woke");
        w.store(true, Ordering::SeqCst);
    })?;

    for i in 0..3 {
        let (w, t) = (Arc::clone(&woke), Arc::clone(&ticks));
        pool.run(move || {
            while !w.load(Ordering::SeqCst) {
                t.fetch_add(1, Ordering::Relaxed);
                myrpc::sleep(Duration::from_millis(50 * (i + 1)));
            }
        })?;
    }

    pool.wait();
    pool.stop();

    println!("other fibers ticked {} times during the sleep", ticks.load(Ordering::Relaxed));
    Ok(())
}
