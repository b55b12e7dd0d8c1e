//! The error taxonomy of the synchronization engine.

use std::fmt;

use shmap_primitives::SegmentError;

use crate::codec::CodecError;
use crate::lock::LockError;
use crate::stream::ParseError;

/// Top-level error returned by map operations.
#[derive(Debug)]
pub enum Error {
    /// Segment creation, attachment, or unlinking failed.
    Segment(SegmentError),
    /// The inter-process lock could not be taken.
    Lock(LockError),
    /// The caller-supplied codec failed to encode or decode a payload.
    Codec(CodecError),
    /// A malformed update record was found in the stream buffer.
    Parse(ParseError),
    /// A single update record would exceed the hard record ceiling.
    ValueTooLarge { size: u64, max: u64 },
    /// Construction parameters disagree with the attached control block.
    ParameterMismatch(String),
    /// The map was already closed.
    AlreadyClosed,
    /// The published full dump cannot be read back. The local replica is
    /// permanently stale after this.
    CorruptDump(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Segment(e) => write!(f, "{e}"),
            Error::Lock(e) => write!(f, "{e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Parse(e) => write!(f, "{e}"),
            Error::ValueTooLarge { size, max } => {
                write!(f, "update record of {size} bytes exceeds the {max} byte ceiling")
            }
            Error::ParameterMismatch(what) => write!(f, "parameter mismatch: {what}"),
            Error::AlreadyClosed => write!(f, "map is already closed"),
            Error::CorruptDump(why) => write!(f, "corrupted full dump: {why}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Segment(e) => Some(e),
            Error::Lock(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SegmentError> for Error {
    fn from(e: SegmentError) -> Self {
        Error::Segment(e)
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        Error::Lock(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}
