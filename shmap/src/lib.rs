//! A synchronized, streaming key-value map shared live across processes.
//!
//! Processes attach to the same logical map by shared-memory name; writes
//! performed by any of them are observed by all others, with no broker or
//! daemon in the loop. Reads come from a local replica and are near-native
//! speed; mutations propagate through an append-only update stream in a
//! shared byte buffer, falling back to full snapshots when the buffer
//! overflows.
//!
//! # Architecture
//!
//! A map named `m` is backed by three shared segments:
//!
//! ```text
//!            ┌──────────────────┐ ┌──────────────────┐ ┌───────────────┐
//!            │  "m" (control)   │ │   "m_memory"     │ │  "psm_<hex>"  │
//!            │ lock · counters  │ │  update stream   │ │  full dump    │
//!            └───────┬──────────┘ └────────┬─────────┘ └───────┬───────┘
//!                    │                     │                   │
//!        ┌───────────┼─────────────────────┼───────────────────┤
//!        │           │                     │                   │
//!   ┌────┴────┐ ┌────┴────┐          ┌─────┴───┐               │
//!   │Process A│ │Process B│          │Process C│ ──────────────┘
//!   │ replica │ │ replica │          │ replica │
//!   └─────────┘ └─────────┘          └─────────┘
//! ```
//!
//! Every operation begins with *catch-up*: two unlocked acquire-loads of
//! the control counters prove the replica is current, or the process takes
//! the inter-process lock, loads any newer full dump, and replays pending
//! stream records. Writers append `(key, value)` or tombstone records under
//! the lock; when a record does not fit, the whole replica is snapshotted
//! into a fresh dump segment, the dump generation is bumped, and the stream
//! resets.
//!
//! # Usage
//!
//! ```no_run
//! use shmap::{MapOptions, PostcardMap};
//!
//! // Process A
//! let mut map: PostcardMap<String, u64> = MapOptions::new().name("scores").open()?;
//! map.set("alice".into(), 1)?;
//!
//! // Process B (any other process on the same machine)
//! let mut map: PostcardMap<String, u64> = MapOptions::new().name("scores").open()?;
//! assert_eq!(map.get(&"alice".into())?, Some(1));
//! # Ok::<(), shmap::Error>(())
//! ```
//!
//! Serialization is pluggable through [`Codec`]; the engine never inspects
//! payload bytes. Locking is pluggable too: the default is a process-shared
//! recursive mutex, and `shared_lock(true)` selects a PID-tagged spin lock
//! that works between completely unrelated processes and survives holder
//! death via `steal_after_timeout`.

pub mod codec;
pub mod control;
pub mod dump;
pub mod error;
pub mod lock;
pub mod map;
pub mod name;
pub mod replica;
pub mod stream;

pub use codec::{Codec, CodecError, PostcardCodec};
pub use error::Error;
pub use lock::{LockError, LockKind, LockStatus};
pub use map::{
    unlink_map_by_name, CreateMode, MapOptions, MapStatus, PostcardMap, SharedMap,
    DEFAULT_BUFFER_SIZE,
};
pub use stream::{Marker, ParseError, MAX_RECORD};

pub use shmap_primitives::{SegmentError, SharedSegment};
