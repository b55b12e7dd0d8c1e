//! Segment naming conventions.
//!
//! A map named `m` occupies two fixed segments, `m` (control) and
//! `m_memory` (stream buffer). Full dumps and anonymous maps get randomized
//! `psm_<hex>` names so unrelated maps never collide.

/// Prefix for randomized segment names.
pub const RANDOM_PREFIX: &str = "psm_";

/// Suffix of the stream-buffer segment.
pub const STREAM_SUFFIX: &str = "_memory";

/// Suffix of the child-name register used by recursive maps.
pub const REGISTER_SUFFIX: &str = "_recurse";

/// A fresh random segment name, `psm_` followed by 16 hex digits.
pub fn random_name() -> String {
    format!("{RANDOM_PREFIX}{:016x}", rand::random::<u64>())
}

/// Name of the stream-buffer segment belonging to the map `name`.
pub fn stream_name(name: &str) -> String {
    format!("{name}{STREAM_SUFFIX}")
}

/// Default name of the recurse register belonging to the map `name`.
pub fn register_name(name: &str) -> String {
    format!("{name}{REGISTER_SUFFIX}")
}
