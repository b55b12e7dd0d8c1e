//! The full-dump blob format.
//!
//! A full dump is the whole map snapshotted into one dedicated segment:
//!
//! ```text
//! [ item_count: 6 bytes LE ]
//! [ repeated: key_len (6 LE) || key || value_len (6 LE) || value ]
//! ```
//!
//! Trailing bytes past the last item are ignored, which is what makes the
//! preallocated (static) dump segment reusable across generations.

use std::fmt;

use crate::stream::{u48_from_bytes, u48_to_bytes, LEN_BYTES};

/// A dump blob that cannot be read back. Unrecoverable for the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFormatError {
    pub offset: usize,
    pub reason: &'static str,
}

impl fmt::Display for DumpFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unreadable full dump at byte {}: {}",
            self.offset, self.reason
        )
    }
}

impl std::error::Error for DumpFormatError {}

/// Serialize already-encoded entries into a dump blob.
pub fn encode_dump(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let body: usize = entries
        .iter()
        .map(|(k, v)| 2 * LEN_BYTES + k.len() + v.len())
        .sum();
    let mut out = Vec::with_capacity(LEN_BYTES + body);
    out.extend_from_slice(&u48_to_bytes(entries.len() as u64));
    for (key, value) in entries {
        out.extend_from_slice(&u48_to_bytes(key.len() as u64));
        out.extend_from_slice(key);
        out.extend_from_slice(&u48_to_bytes(value.len() as u64));
        out.extend_from_slice(value);
    }
    out
}

/// Parse a dump blob back into encoded entries.
pub fn decode_dump(blob: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DumpFormatError> {
    let mut pos = 0usize;
    let count = read_len(blob, &mut pos)?;

    let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let key = read_chunk(blob, &mut pos)?;
        let value = read_chunk(blob, &mut pos)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn read_len(blob: &[u8], pos: &mut usize) -> Result<u64, DumpFormatError> {
    if *pos + LEN_BYTES > blob.len() {
        return Err(DumpFormatError {
            offset: *pos,
            reason: "blob too short for a length prefix",
        });
    }
    let v = u48_from_bytes(&blob[*pos..]);
    *pos += LEN_BYTES;
    Ok(v)
}

fn read_chunk(blob: &[u8], pos: &mut usize) -> Result<Vec<u8>, DumpFormatError> {
    let len = read_len(blob, pos)? as usize;
    if *pos + len > blob.len() {
        return Err(DumpFormatError {
            offset: *pos,
            reason: "length prefix runs past the end of the blob",
        });
    }
    let chunk = blob[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dump_roundtrip() {
        let blob = encode_dump(&[]);
        assert_eq!(blob.len(), LEN_BYTES);
        assert_eq!(decode_dump(&blob).unwrap(), vec![]);
    }

    #[test]
    fn entries_roundtrip() {
        let entries = vec![
            (b"alpha".to_vec(), b"1".to_vec()),
            (b"".to_vec(), b"empty key is legal".to_vec()),
            (b"beta".to_vec(), vec![0u8; 300]),
        ];
        let blob = encode_dump(&entries);
        assert_eq!(decode_dump(&blob).unwrap(), entries);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let entries = vec![(b"k".to_vec(), b"v".to_vec())];
        let mut blob = encode_dump(&entries);
        blob.extend_from_slice(&[0u8; 64]); // static segment slack
        assert_eq!(decode_dump(&blob).unwrap(), entries);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = encode_dump(&[(b"key".to_vec(), b"value".to_vec())]);
        assert!(decode_dump(&blob[..blob.len() - 1]).is_err());
        assert!(decode_dump(&blob[..3]).is_err());
    }

    #[test]
    fn lying_item_count_is_rejected() {
        let mut blob = encode_dump(&[(b"k".to_vec(), b"v".to_vec())]);
        blob[0] = 9; // claim 9 items, provide 1
        assert!(decode_dump(&blob).is_err());
    }
}
