#![forbid(unsafe_code)]
//! Shared types and binary parsing primitives.
//!
//! Everything that reads on-disk bytes goes through the bounds-checked
//! helpers in this crate. Damaged filesystems routinely contain garbage
//! lengths and offsets, so no read is allowed to trust them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Magic spells `_BHRfS_M` in little-endian.
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Default filesystem block size (four 4 KiB pages).
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;

/// Size of a single x86 page; block-size guesses round up to this.
pub const REGULAR_PAGE_SIZE: u32 = 4096;

/// Offsets of the four superblock copies.
pub const SUPER_INFO_OFFSET: u64 = 0x10000; // 64 KiB
pub const SUPER_INFO_OFFSET_2: u64 = 0x400_0000; // 64 MiB
pub const SUPER_INFO_OFFSET_3: u64 = 0x40_0000_0000; // 256 GiB
pub const SUPER_INFO_OFFSET_4: u64 = 0x4_0000_0000_0000; // 1 PiB

pub const UUID_SIZE: usize = 16;
pub const CSUM_SIZE: usize = 32;

/// Transaction generation counter. Higher means newer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated block size: a power of two in [4096, 65536].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [4096, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(4096..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Positional read helpers ─────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_uuid(data: &[u8], offset: usize) -> Result<Uuid, ParseError> {
    read_fixed::<UUID_SIZE>(data, offset).map(Uuid::from_bytes)
}

/// An all-zero or all-ones UUID is sentinel garbage, not a real filesystem id.
#[must_use]
pub fn is_sentinel_uuid(id: &Uuid) -> bool {
    id.is_nil() || *id.as_bytes() == [0xFF; UUID_SIZE]
}

// ── Packed on-disk time values ──────────────────────────────────────────────

/// A 12-byte on-disk time value: seconds since the Unix epoch plus
/// nanoseconds, both little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub const DISK_LEN: usize = 12;

    pub fn read_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let secs = read_le_u64(data, offset)? as i64;
        let nanos = read_le_u32(data, offset + 8)?;
        Ok(Self { secs, nanos })
    }

    /// Convert to a `SystemTime`, interpreted as UTC. Out-of-range values
    /// collapse to the epoch rather than panicking.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let nanos = u64::from(self.nanos.min(999_999_999));
        if self.secs >= 0 {
            UNIX_EPOCH
                .checked_add(Duration::new(self.secs as u64, nanos as u32))
                .unwrap_or(UNIX_EPOCH)
        } else {
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(self.secs.unsigned_abs()))
                .unwrap_or(UNIX_EPOCH)
        }
    }
}

// ── Sequential cursor ───────────────────────────────────────────────────────

/// A read-only cursor over a byte slice. All reads are bounds-checked; a
/// short buffer produces a `ParseError` instead of a panic.
#[derive(Debug, Clone)]
pub struct ParseCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ParseCursor<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    pub fn next_bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let bytes = ensure_slice(self.data, self.offset, len)?;
        self.offset += len;
        Ok(bytes)
    }

    pub fn next_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.next_bytes(1)?[0])
    }

    pub fn next_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.next_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn next_u32(&mut self) -> Result<u32, ParseError> {
        let b = self.next_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn next_u64(&mut self) -> Result<u64, ParseError> {
        let b = self.next_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn next_uuid(&mut self) -> Result<Uuid, ParseError> {
        let b = self.next_bytes(UUID_SIZE)?;
        let mut out = [0_u8; UUID_SIZE];
        out.copy_from_slice(b);
        Ok(Uuid::from_bytes(out))
    }

    pub fn next_timespec(&mut self) -> Result<Timespec, ParseError> {
        let secs = self.next_u64()? as i64;
        let nanos = self.next_u32()?;
        Ok(Timespec { secs, nanos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn read_helpers_decode_little_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn read_helpers_reject_short_buffers() {
        let bytes = [0_u8; 4];
        assert!(read_le_u64(&bytes, 0).is_err());
        assert!(read_le_u32(&bytes, 1).is_err());
        assert!(read_le_u16(&bytes, 3).is_err());
        assert!(read_u8(&bytes, 4).is_err());
        assert!(ensure_slice(&bytes, usize::MAX, 2).is_err());
    }

    #[test]
    fn cursor_walks_and_seeks() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        data.extend_from_slice(&0xFEED_u16.to_le_bytes());
        data.push(0x7F);
        data.extend_from_slice(&42_u64.to_le_bytes());

        let mut cur = ParseCursor::new(&data);
        assert_eq!(cur.next_u32().expect("u32"), 0xDEAD_BEEF);
        assert_eq!(cur.next_u16().expect("u16"), 0xFEED);
        assert_eq!(cur.next_u8().expect("u8"), 0x7F);
        assert_eq!(cur.next_u64().expect("u64"), 42);
        assert_eq!(cur.remaining(), 0);
        assert!(cur.next_u8().is_err());

        cur.seek(6);
        assert_eq!(cur.next_u8().expect("u8"), 0x7F);
        assert_eq!(cur.offset(), 7);
    }

    #[test]
    fn timespec_round_trips_through_system_time() {
        let ts = Timespec {
            secs: 1_500_000_000,
            nanos: 123,
        };
        let sys = ts.to_system_time();
        let dur = sys.duration_since(UNIX_EPOCH).expect("after epoch");
        assert_eq!(dur.as_secs(), 1_500_000_000);
        assert_eq!(dur.subsec_nanos(), 123);
    }

    #[test]
    fn sentinel_uuids_detected() {
        assert!(is_sentinel_uuid(&Uuid::nil()));
        assert!(is_sentinel_uuid(&Uuid::from_bytes([0xFF; 16])));
        assert!(!is_sentinel_uuid(&Uuid::from_bytes([1; 16])));
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(16384).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(2048).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(5000).is_err());
    }

    proptest! {
        #[test]
        fn cursor_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64), ops in proptest::collection::vec(0_u8..5, 0..16)) {
            let mut cur = ParseCursor::new(&data);
            for op in ops {
                match op {
                    0 => { let _ = cur.next_u8(); }
                    1 => { let _ = cur.next_u16(); }
                    2 => { let _ = cur.next_u32(); }
                    3 => { let _ = cur.next_u64(); }
                    _ => { let _ = cur.next_uuid(); }
                }
            }
        }

        #[test]
        fn positional_reads_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64), offset in 0_usize..128) {
            let _ = read_u8(&data, offset);
            let _ = read_le_u16(&data, offset);
            let _ = read_le_u32(&data, offset);
            let _ = read_le_u64(&data, offset);
            let _ = read_uuid(&data, offset);
        }
    }
}
