//! Basic fiber example
//!
//! Spawns a handful of fibers that yield back and forth, one of which
//! spawns a child from inside the pool.
//!
//! # Environment Variables
//!
//! - `MYRPC_LOG=debug` - log filter (error, warn, info, debug, trace)
//! - `MYRPC_NUM_WORKERS=2` - worker threads

use myrpc::{FiberPool, PoolConfig, PoolResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// MYRPC_LOG=debug cargo run -p myrpc-basic
fn main() -> PoolResult<()> {
    println!("=== MyRPC Basic Example ===\n");
    myrpc::init_logging();

    let config = PoolConfig::from_env();
    config.print();
    let pool = FiberPool::new(config)?;
    pool.start()?;

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = Arc::clone(&completed);
        let handle = pool.run(move || {
            debug!("[fiber {}] started on worker {:?}", i, myrpc::current_worker_id());
            for j in 0..3 {
                debug!("[fiber {}] iteration {}", i, j);
                myrpc::suspend();
            }
            debug!("[fiber {}] finished", i);
            c.fetch_add(1, Ordering::SeqCst);
        })?;
        println!("Spawned fiber {} (ID={})", i, handle.id());
    }

    let c = Arc::clone(&completed);
    pool.run(move || {
        let c2 = Arc::clone(&c);
        match myrpc::spawn(move || {
            debug!("[child] running as {}", myrpc::current_id());
            c2.fetch_add(1, Ordering::SeqCst);
        }) {
            Ok(child) => child.join(),
            Err(e) => tracing::error!("spawn from fiber failed: {}", e),
        }
        c.fetch_add(1, Ordering::SeqCst);
    })?;

    println!("\nWaiting for fibers to complete...\n");
    pool.wait();

    info!("{} fiber(s) completed", completed.load(Ordering::SeqCst));
    pool.stop();

    println!("\n=== Example Complete ===");
    Ok(())
}
