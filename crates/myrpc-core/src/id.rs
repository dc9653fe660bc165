//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Process-wide id counter. Zero is reserved for [`FiberId::NONE`].
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber
///
/// Ids are handed out by a single atomic counter shared by the whole
/// process, so they are monotonic and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel meaning "not running inside a fiber"
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Convert to Option, mapping NONE to None
    #[inline]
    pub const fn to_option(self) -> Option<FiberId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_ids_are_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(a.is_some());
        assert!(b > a);
    }

    #[test]
    fn test_none() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::NONE.to_option(), None);
        assert_eq!(FiberId::default(), FiberId::NONE);
        assert_eq!(format!("{}", FiberId::NONE), "none");
        assert_eq!(format!("{:?}", FiberId::from_raw(7)), "FiberId(7)");
    }

    #[test]
    fn test_unique_across_threads() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let id = FiberId::next();
                        assert!(seen.lock().unwrap().insert(id));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 4000);
    }
}
