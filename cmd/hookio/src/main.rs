//! Hooked read on an idle socket
//!
//! One fiber reads from an empty socket while a neighbour on the same
//! worker keeps ticking; a fiber on another worker writes after a short
//! pause. The reader parks in the reactor, not in the kernel.

use myrpc::{hook, FiberPool, PoolConfig, PoolResult};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn main() -> PoolResult<()> {
    myrpc::init_logging();

    let pool = FiberPool::new(PoolConfig::from_env().num_workers(2))?;
    pool.start()?;

    let (reader, writer) = UnixStream::pair()?;
    let (rfd, wfd) = (reader.as_raw_fd(), writer.into_raw_fd());

    let done = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicUsize::new(0));

    let d = Arc::clone(&done);
    pool.run_on(
        move || {
            let mut buf = [0u8; 64];
            let n = hook::read(rfd, &mut buf);
            if n > 0 {
                info!("read {} bytes: {:?}", n, String::from_utf8_lossy(&buf[..n as usize]));
            }
            d.store(true, Ordering::SeqCst);
        },
        0,
    )?;

    let (d, t) = (Arc::clone(&done), Arc::clone(&ticks));
    pool.run_on(
        move || {
            while !d.load(Ordering::SeqCst) {
                t.fetch_add(1, Ordering::Relaxed);
                myrpc::suspend();
            }
        },
        0,
    )?;

    pool.run_on(
        move || {
            myrpc::sleep(Duration::from_millis(100));
            let n = hook::write(wfd, b"hello");
            info!("wrote {} bytes", n);
            hook::close(wfd);
        },
        1,
    )?;

    pool.wait();
    pool.stop();

    println!("neighbour ticked {} times while the read was parked", ticks.load(Ordering::Relaxed));
    drop(reader);
    Ok(())
}
