//! Environment variable helpers used by `PoolConfig::from_env`
//!
//! ```ignore
//! use myrpc_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("MYRPC_NUM_WORKERS", 4);
//! let trace = env_get_bool("MYRPC_TRACE_SWITCHES", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or malformed
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` when it is set and well-formed
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes" and "on" (any case) are true,
/// anything else that is set is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
