//! Plain libc calls are hooked when the `interpose` feature exports them

#![cfg(feature = "interpose")]

use myrpc::{FiberPool, PoolConfig};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn started_pool(workers: usize) -> FiberPool {
    myrpc::init_logging();
    let config = PoolConfig::new()
        .num_workers(workers)
        .wait_timeout(Duration::from_millis(50));
    let pool = FiberPool::new(config).unwrap();
    pool.start().unwrap();
    pool
}

#[test]
fn test_libc_read_and_usleep_park_the_fiber() {
    let pool = started_pool(1);
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    let (rfd, wfd) = (fds[0], fds[1]);

    let got = Arc::new(AtomicIsize::new(-100));
    let g = Arc::clone(&got);
    pool.run(move || {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(rfd, buf.as_mut_ptr().cast(), buf.len()) };
        g.store(n, Ordering::SeqCst);
    })
    .unwrap();

    // Same worker as the reader: only runs if the read parked the fiber
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&ticks);
    pool.run(move || {
        for _ in 0..10 {
            t.fetch_add(1, Ordering::SeqCst);
            unsafe { libc::usleep(5_000) };
        }
        assert_eq!(unsafe { libc::write(wfd, b"hello".as_ptr().cast(), 5) }, 5);
    })
    .unwrap();

    let start = Instant::now();
    while got.load(Ordering::SeqCst) == -100 {
        assert!(start.elapsed() < Duration::from_secs(10), "reader never woke");
        thread::sleep(Duration::from_millis(1));
    }

    pool.wait();
    assert_eq!(ticks.load(Ordering::SeqCst), 10);
    assert_eq!(got.load(Ordering::SeqCst), 5);

    pool.stop();
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}
