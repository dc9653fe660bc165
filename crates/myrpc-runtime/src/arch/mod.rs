//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//! - `Registers` - callee-saved state of a suspended context
//! - `init_context` - prepare a fresh stack to start at an entry function
//! - `switch_context` - save the current context, load another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Registers};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Registers};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Entry point of a fresh context. Receives the argument given to
/// `init_context` and must never return.
pub type EntryFn = extern "C" fn(usize) -> !;
