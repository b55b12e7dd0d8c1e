//! Named shared-memory segments.
//!
//! A [`SharedSegment`] is a fixed-size byte region registered under an
//! OS-global name. Any process that knows the name can attach; the name is
//! removed from the OS namespace with [`SharedSegment::unlink_by_name`],
//! which never invalidates existing attachments.

use std::fmt;
use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::SharedSegment;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::SharedSegment;

/// Errors from segment creation, attachment, and unlinking.
#[derive(Debug)]
pub enum SegmentError {
    /// `create` found a segment with this name already registered.
    AlreadyExists(String),
    /// `attach` found no segment with this name.
    NotFound(String),
    /// The segment exists but is unusable (zero-sized, name malformed).
    Invalid { name: String, reason: &'static str },
    /// Any other OS-level failure.
    Os(io::Error),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::AlreadyExists(name) => {
                write!(f, "shared memory segment {name:?} already exists")
            }
            SegmentError::NotFound(name) => {
                write!(f, "shared memory segment {name:?} not found")
            }
            SegmentError::Invalid { name, reason } => {
                write!(f, "shared memory segment {name:?} is invalid: {reason}")
            }
            SegmentError::Os(e) => write!(f, "shared memory OS error: {e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SegmentError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SegmentError {
    fn from(e: io::Error) -> Self {
        SegmentError::Os(e)
    }
}

/// Longest accepted segment name, excluding the platform prefix.
pub const NAME_MAX: usize = 250;

pub(crate) fn check_name(name: &str) -> Result<(), SegmentError> {
    if name.is_empty() {
        return Err(SegmentError::Invalid {
            name: name.to_string(),
            reason: "name must not be empty",
        });
    }
    if name.len() > NAME_MAX {
        return Err(SegmentError::Invalid {
            name: name.to_string(),
            reason: "name too long",
        });
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(SegmentError::Invalid {
            name: name.to_string(),
            reason: "name must not contain '/' or NUL",
        });
    }
    Ok(())
}
