//! The map object: one attached process's handle to a shared map.
//!
//! A map named `m` is three segments: the control block (`m`), the stream
//! buffer (`m_memory`), and whichever full-dump segment the control block
//! currently names. Every externally observable operation starts by
//! catching the local replica up with the shared state; writes additionally
//! serialize a record and append it to the stream under the inter-process
//! lock, falling back to the full-dump protocol when the buffer is full.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use shmap_primitives::sync::Ordering;
use shmap_primitives::{Region, SegmentError, SharedSegment};

#[cfg(unix)]
use shmap_primitives::SharedMutex;

use crate::codec::{Codec, PostcardCodec};
use crate::control::{ControlBlock, ControlInit, CONTROL_SIZE};
use crate::error::Error;
use crate::lock::{Ipl, LockKind, LockStatus};
use crate::name::{random_name, register_name, stream_name};
use crate::replica::{DumpLoadError, Replica, ReplayError};
use crate::stream::{
    encode_set_payload, Marker, ParseError, StreamBuffer, MAX_RECORD,
};
use crate::{dump, name};

/// Default stream-buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Whether construction must create, must attach, or may do either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Fail with `AlreadyExists` if the map is already registered.
    Create,
    /// Fail with `NotFound` if it is not.
    Attach,
    /// Attach when possible, create otherwise.
    #[default]
    CreateOrAttach,
}

/// Construction parameters for a [`SharedMap`].
pub struct MapOptions<C> {
    name: Option<String>,
    create: CreateMode,
    buffer_size: Option<usize>,
    codec: C,
    shared_lock: Option<bool>,
    full_dump_size: usize,
    auto_unlink: Option<bool>,
    recurse: bool,
    recurse_register: Option<String>,
    lock_sleep: Duration,
    lock_timeout: Option<Duration>,
    steal_after_timeout: bool,
}

impl<C> MapOptions<C> {
    /// Options with an explicit codec and defaults everywhere else.
    pub fn with_codec(codec: C) -> Self {
        Self {
            name: None,
            create: CreateMode::default(),
            buffer_size: None,
            codec,
            shared_lock: None,
            full_dump_size: 0,
            auto_unlink: None,
            recurse: false,
            recurse_register: None,
            lock_sleep: Duration::from_micros(1),
            lock_timeout: None,
            steal_after_timeout: false,
        }
    }

    /// Explicit shared-memory name; a random `psm_<hex>` name if absent.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn create(mut self, mode: CreateMode) -> Self {
        self.create = mode;
        self
    }

    /// Stream-buffer size in bytes. On attach, an explicit size must match
    /// the existing map.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = Some(bytes);
        self
    }

    /// Use the shared (spin) lock variant; required when the attaching
    /// processes are not fork descendants of the creator. Unset, creation
    /// defaults to the fast variant and attachment adopts whatever the map
    /// was created with; set, attachment to a map with the other variant
    /// fails with `ParameterMismatch`.
    pub fn shared_lock(mut self, shared: bool) -> Self {
        self.shared_lock = Some(shared);
        self
    }

    /// Preallocate a full-dump segment of this size and reuse it for every
    /// dump that fits. Keeps the dump name stable, which Windows needs to
    /// keep the segment alive.
    pub fn full_dump_size(mut self, bytes: usize) -> Self {
        self.full_dump_size = bytes;
        self
    }

    /// Whether this process removes the map's segments from the OS
    /// namespace at teardown. Defaults to "did this process create it".
    pub fn auto_unlink(mut self, unlink: bool) -> Self {
        self.auto_unlink = Some(unlink);
        self
    }

    /// Enable nested child maps reachable through [`SharedMap::child`].
    pub fn recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    /// Name of the register map recording child segment names. Defaults to
    /// `<name>_recurse`.
    pub fn recurse_register(mut self, register: &str) -> Self {
        self.recurse_register = Some(register.to_string());
        self
    }

    /// Sleep between spin-lock attempts; zero busy-waits.
    pub fn lock_sleep(mut self, sleep: Duration) -> Self {
        self.lock_sleep = sleep;
        self
    }

    /// Give up on internal lock acquisition after this long. `None` (the
    /// default) waits forever.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// After an internal lock timeout, take the lock from its (presumed
    /// dead) holder instead of failing.
    pub fn steal_after_timeout(mut self, steal: bool) -> Self {
        self.steal_after_timeout = steal;
        self
    }

    /// Open the map described by these options.
    pub fn open(self) -> Result<SharedMap<C>, Error>
    where
        C: Codec,
        C::Key: Eq + Hash + Clone,
        C::Value: Clone,
    {
        SharedMap::open(self)
    }
}

impl<K, V> MapOptions<PostcardCodec<K, V>> {
    /// Options with the postcard codec.
    pub fn new() -> Self {
        Self::with_codec(PostcardCodec::default())
    }
}

impl<K, V> Default for MapOptions<PostcardCodec<K, V>> {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared map handle using the postcard codec.
pub type PostcardMap<K, V> = SharedMap<PostcardCodec<K, V>>;

/// Diagnostic snapshot of the control block and the local replay state.
#[derive(Debug, Clone, Serialize)]
pub struct MapStatus {
    pub name: String,
    pub stream_name: String,
    pub buffer_size: usize,
    pub shared_lock: bool,
    pub recurse: bool,
    pub auto_unlink: bool,
    pub full_dump_counter: u64,
    pub update_stream_position: u64,
    pub full_dump_name: Option<String>,
    pub full_dump_static_size: u64,
    pub local_generation: u64,
    pub local_cursor: u64,
    pub entries: usize,
    pub stale: bool,
    pub lock: LockStatus,
}

impl fmt::Display for MapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "map {:?} ({} entries)", self.name, self.entries)?;
        writeln!(
            f,
            "  stream: {:?}, {} of {} bytes used",
            self.stream_name, self.update_stream_position, self.buffer_size
        )?;
        writeln!(
            f,
            "  full dump: generation {} in {:?} (static size {})",
            self.full_dump_counter, self.full_dump_name, self.full_dump_static_size
        )?;
        writeln!(
            f,
            "  local: generation {}, cursor {}, stale {}",
            self.local_generation, self.local_cursor, self.stale
        )?;
        write!(
            f,
            "  lock: {:?} held by pid {} (local count {})",
            self.lock.kind, self.lock.holder_pid, self.lock.local_count
        )
    }
}

/// One process's handle to a synchronized shared map.
///
/// Reads come from the local replica after catch-up; writes go through the
/// update stream. The handle is not `Sync`: share it between threads behind
/// your own mutex, or open one handle per thread.
pub struct SharedMap<C: Codec> {
    name: String,
    /// Keeps the control mapping alive; all access goes through `control`.
    #[allow(dead_code)]
    control_seg: SharedSegment,
    control: *mut ControlBlock,
    /// Keeps the stream mapping alive; all access goes through `stream`.
    #[allow(dead_code)]
    stream_seg: SharedSegment,
    stream: StreamBuffer,
    codec: C,
    lock: Ipl,
    replica: Replica<C::Key, C::Value>,
    recurse: bool,
    register: Option<String>,
    auto_unlink: bool,
    lock_timeout: Option<Duration>,
    steal_after_timeout: bool,
    /// Preallocated dump segment (creator keeps it mapped for its lifetime).
    static_dump: Option<SharedSegment>,
    /// Cached attachment to the currently published dump segment.
    dump_cache: Option<SharedSegment>,
    /// The newest dynamic dump segment this process allocated.
    owned_dump: Option<SharedSegment>,
    /// Names of dumps this process allocated and later superseded; unlinked
    /// at teardown, when no reader can reach them anymore.
    retired_dumps: Vec<String>,
    closed: bool,
}

// SAFETY: all shared state behind the raw control pointer is atomics or
// lock-protected; the owning segments keep the mappings alive.
unsafe impl<C: Codec + Send> Send for SharedMap<C>
where
    C::Key: Send,
    C::Value: Send,
{
}

impl<C> SharedMap<C>
where
    C: Codec,
    C::Key: Eq + Hash + Clone,
    C::Value: Clone,
{
    /// Open a map: create it, attach to it, or either, per the options.
    pub fn open(options: MapOptions<C>) -> Result<Self, Error> {
        let map_name = options.name.clone().unwrap_or_else(random_name);

        let (control_seg, created) = match options.create {
            CreateMode::Create => (SharedSegment::create(&map_name, CONTROL_SIZE)?, true),
            CreateMode::Attach => (Self::attach_control(&map_name)?, false),
            CreateMode::CreateOrAttach => match Self::attach_control(&map_name) {
                Ok(seg) => (seg, false),
                Err(Error::Segment(SegmentError::NotFound(_))) => {
                    match SharedSegment::create(&map_name, CONTROL_SIZE) {
                        Ok(seg) => (seg, true),
                        // Lost the creation race; the winner's map is fine.
                        Err(SegmentError::AlreadyExists(_)) => {
                            (Self::attach_control(&map_name)?, false)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e),
            },
        };

        let control: *mut ControlBlock =
            unsafe { control_seg.region().get_mut::<ControlBlock>(0) };
        let cb = unsafe { &*control };

        // The stream segment must exist before the control magic is
        // published: attachers take a valid magic as proof the whole map is
        // there.
        let stream_seg = if created {
            let size = options.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
            match SharedSegment::create(&stream_name(&map_name), size) {
                Ok(seg) => seg,
                Err(e) => {
                    let _ = SharedSegment::unlink_by_name(&map_name, true);
                    return Err(e.into());
                }
            }
        } else {
            SharedSegment::attach(&stream_name(&map_name))?
        };
        let stream = StreamBuffer::new(stream_seg.region());

        if created {
            #[cfg(unix)]
            unsafe {
                SharedMutex::init_at((*control).mutex_ptr())
                    .map_err(|e| Error::Segment(SegmentError::Os(e)))?;
            }
            unsafe {
                (*control).init(ControlInit {
                    shared_lock: options.shared_lock.unwrap_or(false) || cfg!(windows),
                    recurse: options.recurse,
                    buffer_size: stream_seg.len() as u32,
                    full_dump_static_size: options.full_dump_size as u64,
                });
            }
        } else {
            Self::handshake(cb, &options)?;
        }
        let recurse = cb.recurse();

        let kind = if cb.shared_lock() {
            LockKind::Shared
        } else {
            LockKind::Fast
        };
        #[cfg(unix)]
        let mutex = match kind {
            LockKind::Fast => Some(unsafe { SharedMutex::attach_at(cb.mutex_ptr()) }),
            LockKind::Shared => None,
        };
        let lock = Ipl::new(
            kind,
            options.lock_sleep,
            #[cfg(unix)]
            mutex,
        );

        // Preallocate the static dump segment and publish its name up front
        // so every writer can find it.
        let static_dump = if created && options.full_dump_size > 0 {
            let dump_name = random_name();
            let seg = SharedSegment::create(&dump_name, options.full_dump_size)?;
            seg.region().write_bytes(0, &dump::encode_dump(&[]));
            cb.set_dump_name(&dump_name);
            Some(seg)
        } else {
            None
        };

        let mut map = Self {
            name: map_name.clone(),
            control_seg,
            control,
            stream_seg,
            stream,
            codec: options.codec,
            lock,
            replica: Replica::default(),
            recurse,
            register: if recurse {
                Some(
                    options
                        .recurse_register
                        .unwrap_or_else(|| register_name(&map_name)),
                )
            } else {
                None
            },
            auto_unlink: options.auto_unlink.unwrap_or(created),
            lock_timeout: options.lock_timeout,
            steal_after_timeout: options.steal_after_timeout,
            static_dump,
            dump_cache: None,
            owned_dump: None,
            retired_dumps: Vec::new(),
            closed: false,
        };

        tracing::debug!(
            name = %map.name,
            created,
            shared_lock = cb.shared_lock(),
            buffer_size = map.stream.capacity(),
            "opened shared map"
        );

        // Bring the replica up to date with whatever is already published.
        map.apply_update()?;
        Ok(map)
    }

    /// Attach to a control segment, giving a mid-initialization creator a
    /// brief window to finish before declaring the segment invalid.
    fn attach_control(map_name: &str) -> Result<SharedSegment, Error> {
        let mut tries = 0u32;
        loop {
            match SharedSegment::attach(map_name) {
                Ok(seg) if seg.len() >= CONTROL_SIZE => {
                    let region = seg.region();
                    let cb: &ControlBlock = unsafe { region.get::<ControlBlock>(0) };
                    if cb.validate().is_ok() {
                        return Ok(seg);
                    }
                }
                Ok(_) => {}
                Err(SegmentError::Invalid { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            tries += 1;
            if tries > 100 {
                return Err(Error::Segment(SegmentError::Invalid {
                    name: map_name.to_string(),
                    reason: "control segment never became a valid shmap block",
                }));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// The attach-time parameter handshake against the control block.
    fn handshake(cb: &ControlBlock, options: &MapOptions<C>) -> Result<(), Error> {
        if let Some(requested) = options.shared_lock {
            if requested != cb.shared_lock() {
                return Err(Error::ParameterMismatch(format!(
                    "map was created with shared_lock={}, requested {requested}",
                    cb.shared_lock()
                )));
            }
        }
        if options.recurse && !cb.recurse() {
            return Err(Error::ParameterMismatch(
                "map was created without recurse".into(),
            ));
        }
        if let Some(size) = options.buffer_size {
            if size as u32 != cb.buffer_size() {
                return Err(Error::ParameterMismatch(format!(
                    "map was created with buffer_size={}, requested {size}",
                    cb.buffer_size()
                )));
            }
        }
        if options.full_dump_size != 0
            && options.full_dump_size as u64 != cb.full_dump_static_size()
        {
            return Err(Error::ParameterMismatch(format!(
                "map was created with full_dump_size={}, requested {}",
                cb.full_dump_static_size(),
                options.full_dump_size
            )));
        }
        Ok(())
    }

    // ── shared state access ────────────────────────────────────────────────

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if self.replica.fatal {
            return Err(Error::CorruptDump(
                "replica is permanently stale after an unreadable full dump".into(),
            ));
        }
        Ok(())
    }

    /// Two acquire-loads proving nothing changed since the last catch-up.
    #[inline]
    fn fast_path_clean(&self) -> bool {
        let cb = self.control();
        !self.replica.stale
            && cb.generation() == self.replica.seen_full_dump
            && cb.position() == self.replica.cursor
    }

    fn lock_internal(&mut self) -> Result<(), Error> {
        let cb = self.control();
        self.lock
            .acquire(cb, true, self.lock_timeout, self.steal_after_timeout)
            .map_err(Error::from)
    }

    fn unlock_internal(&mut self) {
        let cb = self.control();
        self.lock.release(cb);
    }

    // ── catch-up ───────────────────────────────────────────────────────────

    fn catch_up_locked(&mut self) -> Result<(), Error> {
        let cb = self.control();

        if self.replica.stale {
            tracing::warn!(name = %self.name, "replica is stale; reloading");
            if cb.dump_name().is_some() {
                self.load_dump_locked()?;
            } else {
                self.replica.data.clear();
                self.replica.cursor = 0;
                self.replica.seen_full_dump = cb.generation();
            }
            self.replica.stale = false;
        } else if cb.generation() != self.replica.seen_full_dump {
            self.load_dump_locked()?;
        }

        let target = cb.position();
        if target < self.replica.cursor {
            return Err(Error::Parse(ParseError {
                offset: self.replica.cursor,
                kind: crate::stream::ParseErrorKind::PositionRegressed {
                    cursor: self.replica.cursor,
                    position: target,
                },
            }));
        }
        while self.replica.cursor < target {
            let (marker, payload, total) = self.stream.read_record(self.replica.cursor, target)?;
            self.replica
                .apply(&self.codec, marker, &payload)
                .map_err(|e| match e {
                    ReplayError::Malformed(kind) => Error::Parse(ParseError {
                        offset: self.replica.cursor,
                        kind,
                    }),
                    ReplayError::Codec(e) => Error::Codec(e),
                })?;
            self.replica.cursor += total;
        }
        Ok(())
    }

    /// Catch up; on a replay failure, mark the replica stale and retry once
    /// through the forced-reload path before letting the error escape.
    fn catch_up_with_retry_locked(&mut self) -> Result<(), Error> {
        match self.catch_up_locked() {
            Err(e) if matches!(e, Error::Parse(_) | Error::Codec(_)) => {
                tracing::warn!(name = %self.name, error = %e, "catch-up failed; forcing reload");
                self.replica.stale = true;
                self.catch_up_locked()
            }
            other => other,
        }
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.lock_internal()?;
        let result = self.catch_up_with_retry_locked();
        self.unlock_internal();
        result
    }

    fn load_dump_locked(&mut self) -> Result<(), Error> {
        let cb = self.control();
        let generation = cb.generation();
        let Some(dump_name) = cb.dump_name() else {
            // Nothing was ever dumped; adopt the generation as-is.
            self.replica.seen_full_dump = generation;
            return Ok(());
        };

        let region = self.dump_region(&dump_name)?;
        let blob = region.read_bytes(0, region.len());
        match self.replica.load_dump(&self.codec, &blob, generation) {
            Ok(()) => {
                tracing::debug!(
                    name = %self.name,
                    dump = %dump_name,
                    generation,
                    entries = self.replica.data.len(),
                    "loaded full dump"
                );
                Ok(())
            }
            Err(e @ (DumpLoadError::Format(_) | DumpLoadError::Codec(_))) => {
                self.replica.fatal = true;
                Err(Error::CorruptDump(e.describe()))
            }
        }
    }

    /// Map the named dump segment, reusing a cached attachment if possible.
    fn dump_region(&mut self, dump_name: &str) -> Result<Region, Error> {
        if let Some(seg) = &self.static_dump {
            if seg.name() == dump_name {
                return Ok(seg.region());
            }
        }
        if let Some(seg) = &self.owned_dump {
            if seg.name() == dump_name {
                return Ok(seg.region());
            }
        }
        if let Some(seg) = &self.dump_cache {
            if seg.name() == dump_name {
                return Ok(seg.region());
            }
        }
        let seg = SharedSegment::attach(dump_name)?;
        let region = seg.region();
        self.dump_cache = Some(seg);
        Ok(region)
    }

    // ── the full-dump protocol ─────────────────────────────────────────────

    /// Snapshot the replica into a dump segment and publish it: name first,
    /// then the generation bump, then the stream-position reset. Readers key
    /// off the generation change and then read the name.
    fn full_dump_locked(&mut self) -> Result<(), Error> {
        let mut entries = Vec::with_capacity(self.replica.data.len());
        for (key, value) in &self.replica.data {
            entries.push((self.codec.encode_key(key)?, self.codec.encode_value(value)?));
        }
        let blob = dump::encode_dump(&entries);

        let cb = self.control();
        let static_size = cb.full_dump_static_size();
        let current = cb.dump_name();

        let reuse_static =
            static_size > 0 && blob.len() as u64 <= static_size && current.is_some();
        if reuse_static {
            let dump_name = current.expect("checked above");
            let region = self.dump_region(&dump_name)?;
            region.write_bytes(0, &blob);
            tracing::debug!(
                name = %self.name,
                dump = %dump_name,
                bytes = blob.len(),
                entries = entries.len(),
                "rewrote preallocated full dump"
            );
        } else {
            if static_size > 0 {
                tracing::warn!(
                    name = %self.name,
                    bytes = blob.len(),
                    static_size,
                    "snapshot does not fit the preallocated dump; allocating a dynamic segment"
                );
            }
            let dump_name = random_name();
            let seg = SharedSegment::create(&dump_name, blob.len())?;
            seg.region().write_bytes(0, &blob);
            cb.set_dump_name(&dump_name);
            if let Some(previous) = self.owned_dump.take() {
                self.retired_dumps.push(previous.name().to_string());
            }
            self.owned_dump = Some(seg);
            tracing::debug!(
                name = %self.name,
                dump = %dump_name,
                bytes = blob.len(),
                entries = entries.len(),
                "published full dump"
            );
        }

        let generation = cb.full_dump_counter.fetch_add(1, Ordering::AcqRel) + 1;
        cb.update_stream_position.store(0, Ordering::Release);
        self.replica.seen_full_dump = generation;
        self.replica.cursor = 0;
        Ok(())
    }

    // ── writes ─────────────────────────────────────────────────────────────

    /// Append one record, or run the full-dump protocol when it does not
    /// fit. The replica must already hold the new state: an overflow dump
    /// carries the update instead of the stream.
    fn append_locked(&mut self, marker: Marker, payload: &[u8]) -> Result<(), Error> {
        let cb = self.control();
        let need = StreamBuffer::record_len(payload.len());
        let pos = cb.position() as usize;
        if pos + need > self.stream.capacity() {
            tracing::debug!(
                name = %self.name,
                pos,
                need,
                capacity = self.stream.capacity(),
                "stream buffer full; running full-dump protocol"
            );
            return self.full_dump_locked();
        }
        self.stream.write_record(pos, marker, payload);
        let new_pos = (pos + need) as u64;
        cb.update_stream_position.store(new_pos, Ordering::Release);
        self.replica.cursor = new_pos;
        Ok(())
    }

    /// Insert or replace `key`. Visible to every attached process once this
    /// returns.
    pub fn set(&mut self, key: C::Key, value: C::Value) -> Result<(), Error> {
        self.ensure_usable()?;
        let payload = encode_set_payload(
            &self.codec.encode_key(&key)?,
            &self.codec.encode_value(&value)?,
        );
        let need = StreamBuffer::record_len(payload.len()) as u64;
        if need > MAX_RECORD {
            return Err(Error::ValueTooLarge {
                size: need,
                max: MAX_RECORD,
            });
        }

        self.lock_internal()?;
        let result = (|| {
            self.catch_up_with_retry_locked()?;
            self.replica.data.insert(key, value);
            self.append_locked(Marker::Set, &payload)
        })();
        self.unlock_internal();
        result
    }

    /// Remove `key`, returning the value it had. Appends a tombstone only
    /// when the key actually existed.
    pub fn delete(&mut self, key: &C::Key) -> Result<Option<C::Value>, Error> {
        self.ensure_usable()?;
        let payload = self.codec.encode_key(key)?;

        self.lock_internal()?;
        let result = (|| {
            self.catch_up_with_retry_locked()?;
            let Some(previous) = self.replica.data.remove(key) else {
                return Ok(None);
            };
            self.append_locked(Marker::Delete, &payload)?;
            Ok(Some(previous))
        })();
        self.unlock_internal();
        result
    }

    /// Look up `key` in the caught-up replica.
    pub fn get(&mut self, key: &C::Key) -> Result<Option<C::Value>, Error> {
        self.ensure_usable()?;
        if !self.fast_path_clean() {
            self.sync()?;
        }
        Ok(self.replica.data.get(key).cloned())
    }

    /// Insert `make()` under `key` unless some process already set it;
    /// either way, return the value now in the map. One lock round-trip, so
    /// concurrent callers agree on the winner.
    pub fn get_or_set_with(
        &mut self,
        key: C::Key,
        make: impl FnOnce() -> C::Value,
    ) -> Result<C::Value, Error> {
        self.ensure_usable()?;
        self.lock_internal()?;
        let result = (|| {
            self.catch_up_with_retry_locked()?;
            if let Some(existing) = self.replica.data.get(&key) {
                return Ok(existing.clone());
            }
            let value = make();
            let payload = encode_set_payload(
                &self.codec.encode_key(&key)?,
                &self.codec.encode_value(&value)?,
            );
            self.replica.data.insert(key, value.clone());
            self.append_locked(Marker::Set, &payload)?;
            Ok(value)
        })();
        self.unlock_internal();
        result
    }

    // ── explicit dump / load ───────────────────────────────────────────────

    /// Force the full-dump protocol now.
    pub fn dump(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.lock_internal()?;
        let result = (|| {
            self.catch_up_with_retry_locked()?;
            self.full_dump_locked()
        })();
        self.unlock_internal();
        result
    }

    /// Reload the current full dump. Without `force`, only a newer
    /// generation is loaded.
    pub fn load(&mut self, force: bool) -> Result<(), Error> {
        self.ensure_usable()?;
        self.lock_internal()?;
        let result = if force || self.control().generation() > self.replica.seen_full_dump {
            self.load_dump_locked()
        } else {
            tracing::debug!(name = %self.name, "no newer full dump to load");
            Ok(())
        };
        self.unlock_internal();
        result
    }

    /// Run catch-up without any other operation.
    pub fn apply_update(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        if self.fast_path_clean() {
            return Ok(());
        }
        self.sync()
    }

    // ── container conveniences ─────────────────────────────────────────────

    /// Number of entries after catch-up.
    pub fn len(&mut self) -> Result<usize, Error> {
        self.apply_update()?;
        Ok(self.replica.data.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    pub fn contains_key(&mut self, key: &C::Key) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    /// All keys, cloned from a caught-up replica.
    pub fn keys(&mut self) -> Result<Vec<C::Key>, Error> {
        self.apply_update()?;
        Ok(self.replica.data.keys().cloned().collect())
    }

    /// A caught-up point-in-time copy of the whole map.
    pub fn snapshot(&mut self) -> Result<HashMap<C::Key, C::Value>, Error> {
        self.apply_update()?;
        Ok(self.replica.data.clone())
    }

    /// Bulk insert under a single lock acquisition.
    pub fn extend(
        &mut self,
        entries: impl IntoIterator<Item = (C::Key, C::Value)>,
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        self.lock_internal()?;
        let result = (|| {
            self.catch_up_with_retry_locked()?;
            for (key, value) in entries {
                let payload = encode_set_payload(
                    &self.codec.encode_key(&key)?,
                    &self.codec.encode_value(&value)?,
                );
                self.replica.data.insert(key, value);
                self.append_locked(Marker::Set, &payload)?;
            }
            Ok(())
        })();
        self.unlock_internal();
        result
    }

    // ── lock surface ───────────────────────────────────────────────────────

    /// Take the inter-process lock explicitly, e.g. to make several updates
    /// atomic with respect to other writers. Reentrant; pair with
    /// [`SharedMap::release_lock`].
    pub fn acquire_lock(
        &mut self,
        block: bool,
        timeout: Option<Duration>,
        steal_after_timeout: bool,
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        let cb = self.control();
        self.lock
            .acquire(cb, block, timeout, steal_after_timeout)
            .map_err(Error::from)
    }

    /// Release one level of the explicitly taken lock. Returns `false` when
    /// this process did not hold it.
    pub fn release_lock(&mut self) -> bool {
        let cb = self.control();
        self.lock.release(cb)
    }

    /// PID currently holding the inter-process lock, or 0.
    pub fn locked_by(&self) -> u32 {
        self.lock.locked_by(self.control())
    }

    /// Manual stale-lock recovery; see [`Ipl::reset`].
    pub fn reset_lock(&mut self) {
        let cb = self.control();
        self.lock.reset(cb);
    }

    // ── nested maps ────────────────────────────────────────────────────────

    /// Open the child map stored under `key`, creating and registering it on
    /// first use. Requires `recurse`. Children inherit the lock variant and
    /// are unlinked by the parent's [`SharedMap::unlink`].
    pub fn child<CC>(&mut self, key: &str, codec: CC) -> Result<SharedMap<CC>, Error>
    where
        CC: Codec,
        CC::Key: Eq + Hash + Clone,
        CC::Value: Clone,
    {
        if !self.recurse {
            return Err(Error::ParameterMismatch(
                "recurse is not enabled for this map".into(),
            ));
        }
        let child_name = {
            let mut register = self.open_register()?;
            register.get_or_set_with(key.to_string(), random_name)?
        };
        MapOptions::with_codec(codec)
            .name(&child_name)
            .shared_lock(self.control().shared_lock())
            .recurse(true)
            .auto_unlink(false)
            .open()
    }

    fn open_register(&self) -> Result<PostcardMap<String, String>, Error> {
        let register = self.register.clone().expect("recurse implies a register");
        MapOptions::new()
            .name(&register)
            .shared_lock(self.control().shared_lock())
            .auto_unlink(false)
            .open()
    }

    // ── diagnostics ────────────────────────────────────────────────────────

    /// A diagnostic snapshot; does not catch up first.
    pub fn status(&self) -> Result<MapStatus, Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        let cb = self.control();
        Ok(MapStatus {
            name: self.name.clone(),
            stream_name: stream_name(&self.name),
            buffer_size: self.stream.capacity(),
            shared_lock: cb.shared_lock(),
            recurse: self.recurse,
            auto_unlink: self.auto_unlink,
            full_dump_counter: cb.generation(),
            update_stream_position: cb.position(),
            full_dump_name: cb.dump_name(),
            full_dump_static_size: cb.full_dump_static_size(),
            local_generation: self.replica.seen_full_dump,
            local_cursor: self.replica.cursor,
            entries: self.replica.data.len(),
            stale: self.replica.stale,
            lock: self.lock.status(cb),
        })
    }

    /// The map's shared-memory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // ── teardown ───────────────────────────────────────────────────────────

    /// Detach from shared memory and hand back the replica as a plain map.
    /// Honors `auto_unlink`.
    pub fn close(mut self) -> HashMap<C::Key, C::Value> {
        self.teardown();
        std::mem::take(&mut self.replica.data)
    }

    /// Remove every segment belonging to this map (control, stream, dumps,
    /// and, for recursive maps, every registered child) from the OS
    /// namespace, then detach.
    pub fn unlink(mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.unlink_internal();
        self.closed = true;
        Ok(())
    }
}

impl<C: Codec> SharedMap<C> {
    /// The control block.
    ///
    /// The unbounded lifetime lets callers mutate `self` while holding the
    /// reference; it is sound because `control_seg` keeps the mapping alive
    /// for as long as `self` exists and the reference never escapes.
    #[inline]
    fn control<'a>(&self) -> &'a ControlBlock {
        unsafe { &*self.control }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.auto_unlink {
            self.unlink_internal();
        } else {
            self.drop_owned_dumps();
        }
    }

    fn unlink_internal(&mut self) {
        tracing::debug!(name = %self.name, "unlinking map segments");
        if let Some(register) = self.register.clone() {
            unlink_register_tree(&register);
        }
        let cb = self.control();
        if let Some(dump_name) = cb.dump_name() {
            let _ = SharedSegment::unlink_by_name(&dump_name, true);
        }
        for seg in self.static_dump.iter().chain(self.owned_dump.iter()) {
            let _ = SharedSegment::unlink_by_name(seg.name(), true);
        }
        for retired in self.retired_dumps.drain(..) {
            let _ = SharedSegment::unlink_by_name(&retired, true);
        }
        let _ = SharedSegment::unlink_by_name(&stream_name(&self.name), true);
        let _ = SharedSegment::unlink_by_name(&self.name, true);
    }

    /// Unlink the dumps only this process allocated and no reader can reach
    /// anymore: every retired dump, plus the newest one if it has been
    /// superseded by another writer's dump.
    fn drop_owned_dumps(&mut self) {
        for retired in self.retired_dumps.drain(..) {
            let _ = SharedSegment::unlink_by_name(&retired, true);
        }
        if let Some(seg) = self.owned_dump.take() {
            let published = self.control().dump_name();
            if published.as_deref() != Some(seg.name()) {
                let _ = SharedSegment::unlink_by_name(seg.name(), true);
            }
        }
    }
}

impl<C: Codec> Drop for SharedMap<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Remove a whole map tree (control, stream, dump, children) by name,
/// ignoring anything that is already gone. This is the crash-residue
/// cleanup path; it never touches attached processes' mappings.
pub fn unlink_map_by_name(map_name: &str) {
    if let Ok(seg) = SharedSegment::attach(map_name) {
        if seg.len() >= CONTROL_SIZE {
            let region = seg.region();
            let cb: &ControlBlock = unsafe { region.get::<ControlBlock>(0) };
            if cb.validate().is_ok() {
                if let Some(dump_name) = cb.dump_name() {
                    let _ = SharedSegment::unlink_by_name(&dump_name, true);
                }
                if cb.recurse() {
                    unlink_register_tree(&register_name(map_name));
                }
            }
        }
    }
    let _ = SharedSegment::unlink_by_name(&name::stream_name(map_name), true);
    let _ = SharedSegment::unlink_by_name(map_name, true);
}

/// Unlink a recurse register and every child map it names.
fn unlink_register_tree(register: &str) {
    let children = MapOptions::<PostcardCodec<String, String>>::new()
        .name(register)
        .create(CreateMode::Attach)
        .auto_unlink(false)
        .open()
        .and_then(|mut reg| reg.snapshot());
    if let Ok(children) = children {
        for child in children.values() {
            unlink_map_by_name(child);
        }
    }
    unlink_map_by_name(register);
}
