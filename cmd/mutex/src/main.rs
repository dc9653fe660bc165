//! Shared counter under a fiber mutex
//!
//! Spawns many fibers across the workers, each bumping one counter
//! while holding a `myrpc::Mutex`. The lock is held across a yield, so
//! fibers really queue on it and are handed the lock in order.

use myrpc::{FiberPool, Mutex, PoolConfig, PoolResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const FIBERS: u64 = 1000;

fn main() -> PoolResult<()> {
    myrpc::init_logging();

    let pool = FiberPool::new(PoolConfig::from_env().num_workers(8))?;
    pool.start()?;

    let counter = Arc::new(Mutex::new(0u64));
    let start = Instant::now();

    for _ in 0..FIBERS {
        let counter = Arc::clone(&counter);
        pool.run(move || {
            let mut guard = counter.lock();
            myrpc::suspend();
            *guard += 1;
        })?;
    }

    pool.wait();
    let total = *counter.lock();
    info!(elapsed = ?start.elapsed(), "all fibers finished");
    pool.stop();

    println!("counter = {} (expected {})", total, FIBERS);
    if total != FIBERS {
        std::process::exit(1);
    }
    Ok(())
}
