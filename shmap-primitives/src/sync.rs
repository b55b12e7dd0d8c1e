//! Atomic types, switchable to `loom` models for concurrency checking.
//!
//! Everything that lands inside a shared segment goes through these aliases
//! so the spin-lock tests can run under `--cfg loom`.

#[cfg(not(loom))]
pub use core::hint::spin_loop;
#[cfg(loom)]
pub use loom::hint::spin_loop;

#[cfg(not(loom))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(loom)]
pub use loom::thread;
#[cfg(all(not(loom), test))]
pub use std::thread;
