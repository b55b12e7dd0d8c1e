//! Caller-supplied serialization.
//!
//! The engine moves opaque bytes; keys and values only become typed at the
//! map surface. A [`Codec`] turns keys and values into byte payloads and
//! back. [`PostcardCodec`] is the batteries-included implementation for
//! anything that is `serde` serializable.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error raised by a codec, wrapping whatever the underlying format reports.
#[derive(Debug)]
pub struct CodecError(Box<dyn std::error::Error + Send + Sync>);

impl CodecError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Byte-in / byte-out encoder/decoder pair for one key type and one value
/// type. The engine never inspects the produced bytes.
pub trait Codec {
    type Key;
    type Value;

    fn encode_key(&self, key: &Self::Key) -> Result<Vec<u8>, CodecError>;
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key, CodecError>;
    fn encode_value(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value, CodecError>;
}

/// Postcard-over-serde codec.
pub struct PostcardCodec<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for PostcardCodec<K, V> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Clone for PostcardCodec<K, V> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<K, V> fmt::Debug for PostcardCodec<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostcardCodec")
    }
}

impl<K, V> Codec for PostcardCodec<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    type Key = K;
    type Value = V;

    fn encode_key(&self, key: &K) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(key).map_err(CodecError::new)
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<K, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::new)
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(value).map_err(CodecError::new)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<V, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::new)
    }
}
