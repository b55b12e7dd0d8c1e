//! OS-level building blocks for `shmap`, the cross-process synchronized map.
//!
//! This crate contains the mechanisms; the policy lives in `shmap`:
//!
//! - [`SharedSegment`]: a named, fixed-size region of OS shared memory
//!   (POSIX `shm_open` on unix, named file mappings on Windows) with
//!   create / attach / unlink semantics.
//! - [`Region`]: an offset-addressed view over a raw byte span.
//! - [`SpinWord`]: a PID-tagged lock word usable across unrelated
//!   processes, built on a 4-byte atomic in shared memory.
//! - [`SharedMutex`]: a recursive, robust, process-shared pthread mutex
//!   embedded in a shared segment (unix only).

pub mod region;
pub mod shm;
pub mod spin;
pub mod sync;

#[cfg(unix)]
pub mod mutex;

pub use region::{HeapRegion, Region};
pub use shm::{SegmentError, SharedSegment};
pub use spin::SpinWord;

#[cfg(unix)]
pub use mutex::{SharedMutex, SHARED_MUTEX_SIZE};

#[cfg(all(test, loom))]
mod loom_tests;
