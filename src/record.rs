//! On-disk record codec
//!
//! A cache file is a concatenation of records. Each record is framed as
//!
//! ```text
//! [ key_len : u32 LE ]
//! [ val_len : u32 LE ]
//! [ key bytes        ]
//! [ value bytes      ]
//! [ crc32c  : u32 LE ]   // over key_len | val_len | key | value
//! ```
//!
//! Records are written whole into a single write buffer and read back whole
//! into a scratch buffer, so encoding and decoding both work on one
//! contiguous slice.

use tracing::warn;

/// Length of the two length fields preceding the payload.
pub const HEADER_SIZE: usize = 8;

/// Length of the trailing checksum.
pub const TRAILER_SIZE: usize = 4;

/// Total encoded length of a record for the given key and value.
#[inline]
pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
    HEADER_SIZE + key.len() + value.len() + TRAILER_SIZE
}

/// Encode a record into `dst`, which must be exactly `encoded_len` bytes.
pub fn encode_into(dst: &mut [u8], key: &[u8], value: &[u8]) {
    debug_assert_eq!(dst.len(), encoded_len(key, value));

    let klen = key.len();
    let vlen = value.len();
    dst[0..4].copy_from_slice(&(klen as u32).to_le_bytes());
    dst[4..8].copy_from_slice(&(vlen as u32).to_le_bytes());
    dst[HEADER_SIZE..HEADER_SIZE + klen].copy_from_slice(key);
    dst[HEADER_SIZE + klen..HEADER_SIZE + klen + vlen].copy_from_slice(value);

    let crc = crc32c::crc32c(&dst[..HEADER_SIZE + klen + vlen]);
    dst[HEADER_SIZE + klen + vlen..].copy_from_slice(&crc.to_le_bytes());
}

/// Why a slice failed to decode as a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The slice is shorter than the fixed framing.
    Truncated,
    /// The length fields do not add up to the slice length.
    LengthMismatch,
    /// The stored checksum does not match the payload.
    ChecksumMismatch,
}

/// A record parsed in place from a scratch buffer.
#[derive(Debug)]
pub struct ParsedRecord<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> ParsedRecord<'a> {
    /// The key stored in the record.
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    /// The value stored in the record.
    #[inline]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }
}

/// Decode and CRC-verify one record occupying the whole of `buf`.
pub fn decode(buf: &[u8]) -> Result<ParsedRecord<'_>, DecodeError> {
    if buf.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(DecodeError::Truncated);
    }

    let klen = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let vlen = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;

    let payload_end = HEADER_SIZE
        .checked_add(klen)
        .and_then(|n| n.checked_add(vlen))
        .ok_or(DecodeError::LengthMismatch)?;
    if payload_end + TRAILER_SIZE != buf.len() {
        return Err(DecodeError::LengthMismatch);
    }

    let stored = u32::from_le_bytes(buf[payload_end..].try_into().unwrap());
    let computed = crc32c::crc32c(&buf[..payload_end]);
    if stored != computed {
        warn!(stored, computed, "record checksum mismatch");
        return Err(DecodeError::ChecksumMismatch);
    }

    Ok(ParsedRecord {
        key: &buf[HEADER_SIZE..HEADER_SIZE + klen],
        value: &buf[HEADER_SIZE + klen..payload_end],
    })
}
