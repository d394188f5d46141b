#![forbid(unsafe_code)]
//! Core types and on-disk constants for raonfs.
//!
//! raonfs is a packed, read-only filesystem image format: a superblock at
//! byte 0, fixed-width inode records at arbitrary byte offsets, per-directory
//! sorted entry tables, and packed name-text blobs referenced by offset.
//! Everything on disk is little-endian.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic number in the first four superblock bytes ("RAON" read little-endian).
pub const RAONFS_MAGIC: u32 = 0x4E4F_4152;

/// On-disk superblock record width in bytes.
pub const RAONFS_SUPERBLOCK_SIZE: usize = 52;
/// On-disk inode record width in bytes.
pub const RAONFS_INODE_SIZE: usize = 50;
/// On-disk directory entry record width in bytes.
pub const RAONFS_DENTRY_SIZE: usize = 12;
/// Fixed width of the filesystem-name field inside the superblock.
pub const RAONFS_FSNAME_LEN: usize = 32;

/// Bytes read at mount time before the true block size is known.
///
/// The superblock lives inside this region, so the bootstrap read is done
/// with a provisional 512-byte geometry and corrected afterwards. Every
/// valid image is at least this large.
pub const RAONFS_BOOTSTRAP_SIZE: u64 = 512;

/// Smallest supported block size (the medium's sector size).
pub const RAONFS_MIN_BLOCK_SIZE: u32 = 512;
/// Largest supported block size.
pub const RAONFS_MAX_BLOCK_SIZE: u32 = 65536;

// ── Inode flags ─────────────────────────────────────────────────────────────

/// File content is stored inside the block containing `doffset` rather than
/// in a block-aligned extent.
pub const RAONFS_INLINE_DATA_FL: u32 = 0x0000_0001;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Byte offset into the filesystem image (pread semantics on the device).
///
/// Unit-carrying wrapper to keep bytes and blocks from mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Convert this block number to its byte offset using the given block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        self.0
            .checked_mul(u64::from(block_size.get()))
            .map(ByteOffset)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// The provisional geometry used for the mount bootstrap read.
    pub const BOOTSTRAP: Self = Self(RAONFS_MIN_BLOCK_SIZE);

    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two()
            || !(RAONFS_MIN_BLOCK_SIZE..=RAONFS_MAX_BLOCK_SIZE).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Mask selecting the intra-block part of a byte offset.
    #[must_use]
    pub fn offset_mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a block number to a byte offset, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
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
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

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

/// Decode a fixed-width, NUL-padded name field into a `String`.
///
/// The field is not guaranteed to contain a terminator; bytes up to the
/// first NUL (or the whole field) are taken, lossily as UTF-8.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers_decode_little_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn read_helpers_reject_short_input() {
        let bytes = [0x00_u8, 0x01];
        assert!(matches!(
            read_le_u32(&bytes, 0),
            Err(ParseError::InsufficientData { needed: 4, .. })
        ));
        assert!(matches!(
            read_le_u16(&bytes, 1),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn magic_is_raon_in_ascii() {
        assert_eq!(&RAONFS_MAGIC.to_le_bytes(), b"RAON");
    }

    #[test]
    fn trim_nul_padded_stops_at_terminator() {
        assert_eq!(trim_nul_padded(b"RAON-FS\0\0\0"), "RAON-FS");
        assert_eq!(trim_nul_padded(b"full-width"), "full-width");
        assert_eq!(trim_nul_padded(b"\0rest"), "");
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);
        assert_eq!(BlockSize::new(4096).unwrap().offset_mask(), 4095);

        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.byte_to_block(0), BlockNumber(0));
        assert_eq!(bs.byte_to_block(4095), BlockNumber(0));
        assert_eq!(bs.byte_to_block(4096), BlockNumber(1));
        assert_eq!(bs.block_to_byte(BlockNumber(3)), Some(12288));
        assert_eq!(
            BlockNumber(3).to_byte_offset(bs),
            Some(ByteOffset(12288))
        );
        assert_eq!(BlockNumber(u64::MAX).to_byte_offset(bs), None);
    }

    #[test]
    fn byte_offset_checked_ops() {
        assert_eq!(ByteOffset(10).checked_add(5), Some(ByteOffset(15)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
        assert_eq!(ByteOffset(10).checked_sub(3), Some(ByteOffset(7)));
        assert_eq!(ByteOffset(0).checked_sub(1), None);
    }

    #[test]
    fn record_widths_match_layout() {
        // superblock: magic(4) + block_size(4) + root_offset(4) + fs_size(8) + name(32)
        assert_eq!(RAONFS_SUPERBLOCK_SIZE, 4 + 4 + 4 + 8 + RAONFS_FSNAME_LEN);
        // inode: size(4) msize(4) rdev(4) mode(2) uid(2) gid(2) ctime(4)
        //        mtime(4) atime(4) flags(4) doffset(8) moffset(8)
        assert_eq!(RAONFS_INODE_SIZE, 4 + 4 + 4 + 2 + 2 + 2 + 4 + 4 + 4 + 4 + 8 + 8);
        // dentry: name_offset(4) name_len(2) type(2) inode_offset(4)
        assert_eq!(RAONFS_DENTRY_SIZE, 4 + 2 + 2 + 4);
    }
}
