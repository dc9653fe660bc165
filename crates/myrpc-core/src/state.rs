//! Fiber status

use core::fmt;

/// Status of a fiber
///
/// Stored in an `AtomicU8` inside the fiber, hence the explicit repr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberStatus {
    /// Runnable: freshly created or voluntarily suspended
    Ready = 1,

    /// Currently executing on some OS thread
    Exec = 2,

    /// Parked until an external wake (I/O, timer, lock)
    Blocked = 3,

    /// Finished, either normally, by `exit`, or by forced unwind
    Terminal = 4,

    /// Reserved. Never produced under correct usage.
    Error = 5,
}

impl FiberStatus {
    /// Whether `resume` may switch into a fiber in this status
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberStatus::Ready | FiberStatus::Blocked)
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberStatus::Terminal | FiberStatus::Error)
    }
}

impl From<u8> for FiberStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => FiberStatus::Ready,
            2 => FiberStatus::Exec,
            3 => FiberStatus::Blocked,
            4 => FiberStatus::Terminal,
            _ => FiberStatus::Error,
        }
    }
}

impl From<FiberStatus> for u8 {
    fn from(status: FiberStatus) -> u8 {
        status as u8
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberStatus::Ready => "READY",
            FiberStatus::Exec => "EXEC",
            FiberStatus::Blocked => "BLOCKED",
            FiberStatus::Terminal => "TERMINAL",
            FiberStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        assert!(FiberStatus::Ready.is_resumable());
        assert!(FiberStatus::Blocked.is_resumable());
        assert!(!FiberStatus::Exec.is_resumable());
        assert!(!FiberStatus::Terminal.is_resumable());
    }

    #[test]
    fn test_u8_roundtrip_and_unknown() {
        for s in [
            FiberStatus::Ready,
            FiberStatus::Exec,
            FiberStatus::Blocked,
            FiberStatus::Terminal,
        ] {
            assert_eq!(FiberStatus::from(u8::from(s)), s);
        }
        assert_eq!(FiberStatus::from(0), FiberStatus::Error);
        assert!(FiberStatus::Error.is_terminal());
    }
}
