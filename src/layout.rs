//! On-disk database layout
//!
//! A tremolo database is a single fixed-size file, memory-mapped whole,
//! partitioned into five regions at offsets derived from compile-time
//! constants and the file size:
//!
//! ```text
//! Offset                  Size                      Region
//! ──────────────────────────────────────────────────────────────────
//! 0                       HEADER_SIZE               header
//! HEADER_SIZE             MAX_FILES · KEY_SLOT      key table
//! after keys              MAX_FILES · 4             segment table
//! after segments          grows forward             vector payload
//! db_size − 2·AUX_BYTES   MAX_FILES · MEAN_VECS · 8 timestamp table
//! db_size −   AUX_BYTES   MAX_FILES · MEAN_VECS · 8 norm table
//! ```
//!
//! The payload grows upward from its base; timestamp and norm tables are
//! indexed in lock-step with it (vector index `i` → entry `i` in both).
//! There is no deletion, so offsets are affine in the vector index.

use thiserror::Error;

/// Magic bytes at offset 0: "TRDB"
pub const MAGIC: u32 = u32::from_le_bytes(*b"TRDB");

/// Header size in bytes. Five LE u32 fields (20 bytes) padded to 32 so the
/// payload base stays 8-aligned for `f64` views.
pub const HEADER_SIZE: usize = 32;

/// Maximum number of keys (inserted files) a database can hold.
pub const MAX_FILES: usize = 10_000;

/// Fixed width of one key slot, including its NUL padding.
pub const KEY_SLOT: usize = 256;

/// Budgeted mean vectors per key; sizes the timestamp and norm tables.
pub const MEAN_VECS: usize = 1_000;

/// Capacity of the timestamp table and the norm table, in entries.
pub const AUX_ENTRIES: usize = MAX_FILES * MEAN_VECS;

const AUX_BYTES: u64 = (AUX_ENTRIES * 8) as u64;

/// Default backing-file size for `create` when no size is given.
pub const DEFAULT_DB_SIZE: u64 = 2_000_000_000;

/// Header flag: every payload vector is unit-L2 and the norm table holds the
/// pre-normalization magnitudes.
pub const FLAG_L2_NORMED: u32 = 1;

/// Header flag: every key carries per-vector timestamps.
pub const FLAG_TIMESTAMPED: u32 = 1 << 1;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    CorruptHeader { expected: u32, got: u32 },

    #[error("unusable database size {size}: {reason}")]
    UnsupportedSize { size: u64, reason: &'static str },

    #[error("header truncated: {0} bytes")]
    TruncatedHeader(usize),
}

/// Byte offsets of the five table regions, derived once at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub db_size: u64,
    pub key_table: usize,
    pub seg_table: usize,
    pub data: usize,
    pub times: usize,
    pub norms: usize,
}

impl Layout {
    /// Derive the region offsets for a backing file of `db_size` bytes.
    pub fn for_size(db_size: u64) -> Result<Self, LayoutError> {
        if db_size % 8 != 0 {
            return Err(LayoutError::UnsupportedSize {
                size: db_size,
                reason: "size must be a multiple of 8",
            });
        }
        if db_size > u32::MAX as u64 {
            return Err(LayoutError::UnsupportedSize {
                size: db_size,
                reason: "payload length must fit a 32-bit header field",
            });
        }
        if db_size < Self::min_size() {
            return Err(LayoutError::UnsupportedSize {
                size: db_size,
                reason: "smaller than the fixed table regions",
            });
        }

        let key_table = HEADER_SIZE;
        let seg_table = key_table + MAX_FILES * KEY_SLOT;
        let data = seg_table + MAX_FILES * 4;
        let norms = (db_size - AUX_BYTES) as usize;
        let times = norms - AUX_BYTES as usize;

        Ok(Self {
            db_size,
            key_table,
            seg_table,
            data,
            times,
            norms,
        })
    }

    /// Smallest size at which the auxiliary tables clear the catalog
    /// regions (the payload region may still be empty).
    pub fn min_size() -> u64 {
        let fixed = (HEADER_SIZE + MAX_FILES * KEY_SLOT + MAX_FILES * 4) as u64 + 2 * AUX_BYTES;
        // round up to the 8-byte grain
        (fixed + 7) & !7
    }

    /// Bytes available to the vector payload before it would meet the
    /// timestamp table.
    pub fn data_capacity(&self) -> u64 {
        (self.times - self.data) as u64
    }
}

/// The typed view of the first bytes of the mapped region.
///
/// `dim` stays 0 until the first insert fixes the database dimension;
/// `length` counts payload bytes and is always a multiple of `8 · dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub magic: u32,
    pub num_files: u32,
    pub dim: u32,
    pub length: u32,
    pub flags: u32,
}

impl DbHeader {
    pub fn empty() -> Self {
        Self {
            magic: MAGIC,
            num_files: 0,
            dim: 0,
            length: 0,
            flags: 0,
        }
    }

    /// Parse and verify a header from the first bytes of the region.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LayoutError> {
        if bytes.len() < HEADER_SIZE {
            return Err(LayoutError::TruncatedHeader(bytes.len()));
        }
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());

        let header = Self {
            magic: word(0),
            num_files: word(1),
            dim: word(2),
            length: word(3),
            flags: word(4),
        };
        if header.magic != MAGIC {
            return Err(LayoutError::CorruptHeader {
                expected: MAGIC,
                got: header.magic,
            });
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_files.to_le_bytes());
        buf[8..12].copy_from_slice(&self.dim.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn is_l2_normed(&self) -> bool {
        self.flags & FLAG_L2_NORMED != 0
    }

    pub fn is_timestamped(&self) -> bool {
        self.flags & FLAG_TIMESTAMPED != 0
    }

    /// Total vectors in the payload, 0 while the dimension is unset.
    pub fn total_vectors(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.length as usize / (8 * self.dim as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = DbHeader {
            magic: MAGIC,
            num_files: 42,
            dim: 12,
            length: 12 * 8 * 100,
            flags: FLAG_L2_NORMED | FLAG_TIMESTAMPED,
        };
        let parsed = DbHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_l2_normed());
        assert!(parsed.is_timestamped());
        assert_eq!(parsed.total_vectors(), 100);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = DbHeader::empty().to_bytes();
        bytes[0] ^= 0xff;
        assert!(matches!(
            DbHeader::from_bytes(&bytes),
            Err(LayoutError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_offsets_are_aligned() {
        let layout = Layout::for_size(Layout::min_size() + 4096).unwrap();
        assert_eq!(layout.key_table, HEADER_SIZE);
        assert_eq!(layout.seg_table % 4, 0);
        assert_eq!(layout.data % 8, 0);
        assert_eq!(layout.times % 8, 0);
        assert_eq!(layout.norms % 8, 0);
        assert!(layout.data < layout.times);
        assert!(layout.times < layout.norms);
        assert_eq!(layout.data_capacity(), 4096);
    }

    #[test]
    fn test_size_limits() {
        assert!(matches!(
            Layout::for_size(1_000_000),
            Err(LayoutError::UnsupportedSize { .. })
        ));
        assert!(matches!(
            Layout::for_size(Layout::min_size() + 4),
            Err(LayoutError::UnsupportedSize { .. })
        ));
        assert!(Layout::for_size(DEFAULT_DB_SIZE).is_ok());
    }
}
