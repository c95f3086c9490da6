#![forbid(unsafe_code)]
//! Shared vocabulary for the superblock and journal-consistency layers.
//!
//! Unit-carrying newtypes, on-disk constants, the byte-level `ParseError`,
//! little/big-endian field readers and writers, and allocation-group math.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT4_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;

/// Highest revision level this implementation understands (`EXT4_DYNAMIC_REV`).
pub const EXT4_MAX_SUPP_REV: u32 = 1;
pub const EXT4_GOOD_OLD_REV: u32 = 0;
pub const EXT4_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT4_GOOD_OLD_FIRST_INO: u32 = 11;

/// Descriptor size without the 64-bit feature.
pub const EXT4_MIN_DESC_SIZE: u16 = 32;
/// Smallest descriptor size allowed with the 64-bit feature.
pub const EXT4_MIN_DESC_SIZE_64BIT: u16 = 64;
pub const EXT4_MAX_DESC_SIZE: u16 = 1024;

/// Default `s_max_mnt_count` written when the stored value is zero.
pub const EXT4_DFL_MAX_MNT_COUNT: u16 = 20;

/// JBD2 block magic (big-endian on disk).
pub const JBD2_MAGIC_NUMBER: u32 = 0xC03B_3998;

/// Extent tree header magic.
pub const EXT4_EXT_MAGIC: u16 = 0xF30A;

// ── Superblock state / error-behaviour fields ──────────────────────────────

/// `s_state`: cleanly unmounted.
pub const EXT4_VALID_FS: u16 = 0x0001;
/// `s_state`: errors detected.
pub const EXT4_ERROR_FS: u16 = 0x0002;

/// `s_errors`: continue after an error.
pub const EXT4_ERRORS_CONTINUE: u16 = 1;
/// `s_errors`: remount read-only after an error.
pub const EXT4_ERRORS_RO: u16 = 2;
/// `s_errors`: halt after an error.
pub const EXT4_ERRORS_PANIC: u16 = 3;

// ── Group descriptor flags (bg_flags) ──────────────────────────────────────

pub const EXT4_BG_INODE_UNINIT: u16 = 0x0001;
pub const EXT4_BG_INODE_ZEROED: u16 = 0x0004;

// ── ext4 inode flags (i_flags) ─────────────────────────────────────────────

/// Inode uses extents.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
/// File data lives in the inode itself.
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

/// Direct block pointers in the classic `i_block` map.
pub const EXT4_NDIR_BLOCKS: usize = 12;

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index (ext4: u32 group number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Identifier of an external journal device as stored in `s_journal_dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceNumber(pub u32);

/// 16-byte volume / journal identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub const NIL: Self = Self([0; 16]);

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
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
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Field readers ───────────────────────────────────────────────────────────

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
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_be_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── Field writers ───────────────────────────────────────────────────────────
//
// Writers mirror the readers: bounds-checked, returning `ParseError` rather
// than panicking on a short buffer.

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    let actual = data.len().saturating_sub(offset);
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Write `text` into a fixed-size NUL-padded field, truncating if needed.
pub fn write_nul_padded(
    data: &mut [u8],
    offset: usize,
    width: usize,
    text: &str,
) -> Result<(), ParseError> {
    let field = ensure_slice_mut(data, offset, width)?;
    field.fill(0);
    let raw = text.as_bytes();
    let len = raw.len().min(width);
    field[..len].copy_from_slice(&raw[..len]);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn ext4_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

macro_rules! display_inner {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })+
    };
}

display_inner!(BlockNumber, InodeNumber, GroupNumber);

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 8, self.0 & 0xFF)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if matches!(idx, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Compute the first block of a given block group.
pub fn group_first_block(
    group: GroupNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> Option<BlockNumber> {
    let offset = u64::from(group.0).checked_mul(u64::from(blocks_per_group))?;
    offset
        .checked_add(u64::from(first_data_block))
        .map(BlockNumber)
}

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(((ino.0.saturating_sub(1)) / u64::from(inodes_per_group)) as u32)
}

/// Compute the index of an inode within its block group.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // modulo by u32 always fits in u32
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ((ino.0.saturating_sub(1)) % u64::from(inodes_per_group)) as u32
}

/// Whether `group` carries a superblock backup under `sparse_super`.
///
/// Groups 0, 1, and powers of 3, 5, 7 carry backups.
#[must_use]
pub fn group_has_super_backup(group: GroupNumber, sparse_super: bool) -> bool {
    if !sparse_super || group.0 <= 1 {
        return true;
    }
    if group.0 & 1 == 0 {
        return false;
    }
    [3_u32, 5, 7].iter().any(|&base| is_power_of(group.0, base))
}

fn is_power_of(mut value: u32, base: u32) -> bool {
    while value > 1 {
        if value % base != 0 {
            return false;
        }
        value /= base;
    }
    value == 1
}
