//! The control block at offset 0 of every map's control segment.
//!
//! All cross-process coordination state lives here: the lock words, the
//! full-dump generation counter, the stream position, and the name of the
//! currently published full dump. Counters are written only under the
//! inter-process lock; readers may take acquire-loads without it and treat
//! the values as monotonic hints, re-validated under the lock.

use std::cell::UnsafeCell;

use shmap_primitives::sync::{AtomicU32, AtomicU64, Ordering};

/// Identifies a shmap control segment.
pub const MAGIC: [u8; 8] = *b"SHMAP\x01\x00\x00";

/// Control block format version.
pub const CONTROL_VERSION: u32 = 1;

/// Fixed size of the control segment in bytes.
pub const CONTROL_SIZE: usize = 512;

/// Longest full-dump segment name the control block can publish.
pub const DUMP_NAME_MAX: usize = 255;

/// Flag bit: the map uses the shared (spin) lock variant.
pub const FLAG_SHARED_LOCK: u32 = 1 << 0;
/// Flag bit: the map participates in recursive (nested) wrapping.
pub const FLAG_RECURSE: u32 = 1 << 1;

/// Storage for the process-shared mutex, one cache line, 8-aligned.
#[repr(C, align(8))]
pub struct MutexArea(UnsafeCell<[u8; 64]>);

/// Creation-time parameters baked into the control block.
#[derive(Debug, Clone, Copy)]
pub struct ControlInit {
    pub shared_lock: bool,
    pub recurse: bool,
    pub buffer_size: u32,
    pub full_dump_static_size: u64,
}

/// The shared control region. Lives at offset 0 of the control segment.
///
/// Fields after the flags word are either immutable after init or atomics;
/// the dump name is mutated only while holding the inter-process lock.
#[repr(C)]
pub struct ControlBlock {
    /// Magic bytes identifying a shmap control segment.
    magic: [u8; 8],
    /// Control block format version (currently 1).
    version: u32,
    /// Always [`CONTROL_SIZE`]; allows extension without breaking readers.
    header_size: u32,
    /// Spin-lock word: 0 = free, otherwise the holder PID.
    pub lock_word: AtomicU32,
    /// Holder PID mirror, for diagnostics and stale-lock takeover.
    pub lock_pid: AtomicU32,
    /// Lock-variant and recurse flags, written once at init.
    flags: u32,
    /// Stream-buffer size, for the attach-time parameter handshake.
    buffer_size: u32,
    /// Generation number of the newest published full dump.
    pub full_dump_counter: AtomicU64,
    /// Next free byte offset inside the stream buffer.
    pub update_stream_position: AtomicU64,
    /// If nonzero, full dumps reuse a preallocated segment of this size.
    full_dump_static_size: u64,
    /// Byte length of the published dump name; 0 = no dump yet.
    dump_name_len: AtomicU32,
    _pad: u32,
    /// Name of the current full-dump segment, written under the lock.
    dump_name: UnsafeCell<[u8; 256]>,
    /// Process-shared recursive mutex (the fast lock variant).
    mutex_area: MutexArea,
    _reserved: [u8; 128],
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<ControlBlock>() == CONTROL_SIZE);

impl ControlBlock {
    /// Write initial values into a zeroed control block.
    ///
    /// The magic goes in last so attachers polling [`ControlBlock::validate`]
    /// never observe a half-initialized block.
    ///
    /// # Safety
    ///
    /// `self` must point into exclusively-owned, zeroed shared memory.
    pub unsafe fn init(&mut self, init: ControlInit) {
        self.version = CONTROL_VERSION;
        self.header_size = CONTROL_SIZE as u32;
        self.lock_word = AtomicU32::new(0);
        self.lock_pid = AtomicU32::new(0);
        self.flags = (if init.shared_lock { FLAG_SHARED_LOCK } else { 0 })
            | (if init.recurse { FLAG_RECURSE } else { 0 });
        self.buffer_size = init.buffer_size;
        self.full_dump_counter = AtomicU64::new(0);
        self.update_stream_position = AtomicU64::new(0);
        self.full_dump_static_size = init.full_dump_static_size;
        self.dump_name_len = AtomicU32::new(0);
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        self.magic = MAGIC;
    }

    /// Validate that this looks like a shmap control block.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("bad magic: not a shmap control segment");
        }
        if self.version != CONTROL_VERSION {
            return Err("unsupported control block version");
        }
        if self.header_size != CONTROL_SIZE as u32 {
            return Err("unexpected control block size");
        }
        Ok(())
    }

    /// Whether the map was created with the shared (spin) lock variant.
    #[inline]
    pub fn shared_lock(&self) -> bool {
        self.flags & FLAG_SHARED_LOCK != 0
    }

    /// Whether the map participates in recursive wrapping.
    #[inline]
    pub fn recurse(&self) -> bool {
        self.flags & FLAG_RECURSE != 0
    }

    /// Stream-buffer size recorded at creation.
    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Preallocated full-dump size, or 0 for dynamic dumps.
    #[inline]
    pub fn full_dump_static_size(&self) -> u64 {
        self.full_dump_static_size
    }

    /// Current full-dump generation (acquire load).
    #[inline]
    pub fn generation(&self) -> u64 {
        self.full_dump_counter.load(Ordering::Acquire)
    }

    /// Current stream position (acquire load).
    #[inline]
    pub fn position(&self) -> u64 {
        self.update_stream_position.load(Ordering::Acquire)
    }

    /// Base pointer of the embedded mutex storage.
    #[inline]
    pub fn mutex_ptr(&self) -> *mut u8 {
        self.mutex_area.0.get() as *mut u8
    }

    /// Publish the name of the current full-dump segment.
    ///
    /// Callers must hold the inter-process lock.
    pub fn set_dump_name(&self, name: &str) {
        assert!(name.len() <= DUMP_NAME_MAX, "dump name too long");
        let storage = unsafe { &mut *self.dump_name.get() };
        storage[..name.len()].copy_from_slice(name.as_bytes());
        self.dump_name_len.store(name.len() as u32, Ordering::Release);
    }

    /// The published full-dump segment name, or `None` before the first dump.
    ///
    /// Meaningful reads happen under the inter-process lock, after observing
    /// a generation change.
    pub fn dump_name(&self) -> Option<String> {
        let len = self.dump_name_len.load(Ordering::Acquire) as usize;
        if len == 0 {
            return None;
        }
        let storage = unsafe { &*self.dump_name.get() };
        Some(String::from_utf8_lossy(&storage[..len]).into_owned())
    }
}
