//! The per-process replica and its replay state.
//!
//! Every attached process keeps a private copy of the map plus two cursors:
//! the full-dump generation it last loaded and the stream byte offset it has
//! replayed up to. The replica is consistent once both match the control
//! block; the catch-up orchestration lives in [`crate::map`].

use std::collections::HashMap;
use std::hash::Hash;

use crate::codec::{Codec, CodecError};
use crate::dump::{decode_dump, DumpFormatError};
use crate::stream::{split_set_payload, Marker, ParseErrorKind};

/// Failure while applying one stream record to the replica.
#[derive(Debug)]
pub enum ReplayError {
    /// The payload framing is wrong (bad key length prefix).
    Malformed(ParseErrorKind),
    /// The caller's codec rejected the payload bytes.
    Codec(CodecError),
}

/// Failure while loading a full dump into the replica.
#[derive(Debug)]
pub enum DumpLoadError {
    Format(DumpFormatError),
    Codec(CodecError),
}

impl DumpLoadError {
    pub fn describe(&self) -> String {
        match self {
            DumpLoadError::Format(e) => e.to_string(),
            DumpLoadError::Codec(e) => format!("codec rejected dump entry: {e}"),
        }
    }
}

/// Local state of one attached process.
pub struct Replica<K, V> {
    /// The local associative map.
    pub data: HashMap<K, V>,
    /// Generation of the last full dump applied.
    pub seen_full_dump: u64,
    /// Stream byte offset up to which updates are applied.
    pub cursor: u64,
    /// Set when replay failed; the next catch-up reloads from the dump.
    pub stale: bool,
    /// Set when the full dump itself is unreadable; permanent.
    pub fatal: bool,
}

impl<K, V> Default for Replica<K, V> {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            seen_full_dump: 0,
            cursor: 0,
            stale: false,
            fatal: false,
        }
    }
}

impl<K, V> Replica<K, V>
where
    K: Eq + Hash,
{
    /// Apply one decoded stream record.
    pub fn apply<C>(&mut self, codec: &C, marker: Marker, payload: &[u8]) -> Result<(), ReplayError>
    where
        C: Codec<Key = K, Value = V>,
    {
        match marker {
            Marker::Set => {
                let (key_bytes, value_bytes) =
                    split_set_payload(payload).map_err(ReplayError::Malformed)?;
                let key = codec.decode_key(key_bytes).map_err(ReplayError::Codec)?;
                let value = codec.decode_value(value_bytes).map_err(ReplayError::Codec)?;
                self.data.insert(key, value);
            }
            Marker::Delete => {
                let key = codec.decode_key(payload).map_err(ReplayError::Codec)?;
                self.data.remove(&key);
            }
        }
        Ok(())
    }

    /// Replace the replica's contents with a decoded full dump.
    ///
    /// On success the cursor resets to 0 and the generation is adopted.
    /// On failure the replica is left untouched.
    pub fn load_dump<C>(&mut self, codec: &C, blob: &[u8], generation: u64) -> Result<(), DumpLoadError>
    where
        C: Codec<Key = K, Value = V>,
    {
        let entries = decode_dump(blob).map_err(DumpLoadError::Format)?;
        let mut data = HashMap::with_capacity(entries.len());
        for (key_bytes, value_bytes) in &entries {
            let key = codec.decode_key(key_bytes).map_err(DumpLoadError::Codec)?;
            let value = codec.decode_value(value_bytes).map_err(DumpLoadError::Codec)?;
            data.insert(key, value);
        }
        self.data = data;
        self.seen_full_dump = generation;
        self.cursor = 0;
        self.stale = false;
        Ok(())
    }

    /// Hand back the local map, consuming the replica.
    pub fn into_data(self) -> HashMap<K, V> {
        self.data
    }
}
