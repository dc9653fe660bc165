//! Blocking FIFO channel for fibers

use super::condvar::Condvar;
use super::mutex::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded multi-producer multi-consumer queue.
///
/// `pop` parks the calling fiber while the queue is empty. After
/// `close`, pushes are refused and poppers drain what is left, then get
/// `None`.
pub struct SyncQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append `item`, handing it back if the queue is closed
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = self
            .not_empty
            .wait_while(self.state.lock(), |s| s.items.is_empty() && !s.closed);
        state.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// `pop` that gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closed {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            state = self.not_empty.wait_timeout(state, left).0;
        }
        state.items.pop_front()
    }

    /// Refuse further pushes and wake every parked popper
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = SyncQueue::new();
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(SyncQueue::new());
        let q = Arc::clone(&queue);
        let consumer = thread::spawn(move || q.pop());

        thread::sleep(Duration::from_millis(10));
        queue.push("hello").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("hello"));
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = Arc::new(SyncQueue::new());
        let q = Arc::clone(&queue);
        let consumer = thread::spawn(move || {
            let mut got = Vec::new();
            while let Some(v) = q.pop() {
                got.push(v);
            }
            got
        });

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.push(3), Err(3));
        assert!(queue.is_closed());
        assert_eq!(consumer.join().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_pop_timeout() {
        let queue: SyncQueue<u8> = SyncQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));

        queue.push(7).unwrap();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), Some(7));
    }
}
