//! Group descriptor codec and the two-stage descriptor checksum.
//!
//! The checksum covers, in order: a per-volume seed, the little-endian group
//! number, the fixed prefix `[0, 0x1E)` (stage one), and, only for descriptors
//! wider than 32 bytes, the tail `[0x20, desc_size)` (stage two). The
//! checksum field itself is never fed to the hash. Bytes past `desc_size`
//! are padding and never covered.

use crate::superblock::Ext4Superblock;
use crc::{CRC_16_MODBUS, Crc};
use ffs_types::{
    EXT4_BG_INODE_ZEROED, EXT4_MIN_DESC_SIZE, GroupNumber, ParseError, Uuid, read_le_u16,
    read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Offset of `bg_checksum` within a group descriptor (2 bytes).
pub const GD_CHECKSUM_OFFSET: usize = 0x1E;
const GD_TAIL_OFFSET: usize = GD_CHECKSUM_OFFSET + 2;

/// `crc16(~0, ...)`: reflected 0x8005, no final xor.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub itable_unused: u32,
    pub flags: u16,
    pub checksum: u16,
}

impl Ext4GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size_usize = check_desc_len(bytes.len(), desc_size)?;

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;
        let itable_unused_lo = u32::from(read_le_u16(bytes, 0x1C)?);
        let checksum = read_le_u16(bytes, GD_CHECKSUM_OFFSET)?;

        if desc_size_usize >= 64 {
            let block_bitmap_hi = u64::from(read_le_u32(bytes, 0x20)?);
            let inode_bitmap_hi = u64::from(read_le_u32(bytes, 0x24)?);
            let inode_table_hi = u64::from(read_le_u32(bytes, 0x28)?);
            let free_blocks_hi = u32::from(read_le_u16(bytes, 0x2C)?);
            let free_inodes_hi = u32::from(read_le_u16(bytes, 0x2E)?);
            let used_dirs_hi = u32::from(read_le_u16(bytes, 0x30)?);
            let itable_unused_hi = u32::from(read_le_u16(bytes, 0x32)?);

            Ok(Self {
                block_bitmap: block_bitmap_lo | (block_bitmap_hi << 32),
                inode_bitmap: inode_bitmap_lo | (inode_bitmap_hi << 32),
                inode_table: inode_table_lo | (inode_table_hi << 32),
                free_blocks_count: free_blocks_lo | (free_blocks_hi << 16),
                free_inodes_count: free_inodes_lo | (free_inodes_hi << 16),
                used_dirs_count: used_dirs_lo | (used_dirs_hi << 16),
                itable_unused: itable_unused_lo | (itable_unused_hi << 16),
                flags,
                checksum,
            })
        } else {
            Ok(Self {
                block_bitmap: block_bitmap_lo,
                inode_bitmap: inode_bitmap_lo,
                inode_table: inode_table_lo,
                free_blocks_count: free_blocks_lo,
                free_inodes_count: free_inodes_lo,
                used_dirs_count: used_dirs_lo,
                itable_unused: itable_unused_lo,
                flags,
                checksum,
            })
        }
    }

    /// Write the modelled fields into `bytes[..desc_size]`, leaving any
    /// unmodelled tail bytes (exclude bitmap checksums, reserved) intact.
    #[allow(clippy::cast_possible_truncation)] // lo/hi halves are split explicitly
    pub fn serialize_into(&self, bytes: &mut [u8], desc_size: u16) -> Result<(), ParseError> {
        let desc_size_usize = check_desc_len(bytes.len(), desc_size)?;

        write_le_u32(bytes, 0x00, self.block_bitmap as u32)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap as u32)?;
        write_le_u32(bytes, 0x08, self.inode_table as u32)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count as u16)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count as u16)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count as u16)?;
        write_le_u16(bytes, 0x12, self.flags)?;
        write_le_u16(bytes, 0x1C, self.itable_unused as u16)?;
        write_le_u16(bytes, GD_CHECKSUM_OFFSET, self.checksum)?;

        if desc_size_usize >= 64 {
            write_le_u32(bytes, 0x20, (self.block_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x24, (self.inode_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x28, (self.inode_table >> 32) as u32)?;
            write_le_u16(bytes, 0x2C, (self.free_blocks_count >> 16) as u16)?;
            write_le_u16(bytes, 0x2E, (self.free_inodes_count >> 16) as u16)?;
            write_le_u16(bytes, 0x30, (self.used_dirs_count >> 16) as u16)?;
            write_le_u16(bytes, 0x32, (self.itable_unused >> 16) as u16)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_inode_table_zeroed(&self) -> bool {
        self.flags & EXT4_BG_INODE_ZEROED != 0
    }
}

fn check_desc_len(len: usize, desc_size: u16) -> Result<usize, ParseError> {
    let desc_size_usize = usize::from(desc_size);
    if desc_size < EXT4_MIN_DESC_SIZE {
        return Err(ParseError::InvalidField {
            field: "s_desc_size",
            reason: "descriptor size must be >= 32",
        });
    }
    if len < desc_size_usize {
        return Err(ParseError::InsufficientData {
            needed: desc_size_usize,
            offset: 0,
            actual: len,
        });
    }
    Ok(desc_size_usize)
}

// ── Two-stage checksum ──────────────────────────────────────────────────────

/// Which algorithm protects group descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorChecksumKind {
    /// Neither `GDT_CSUM` nor `METADATA_CSUM`: descriptors are unprotected.
    None,
    /// `GDT_CSUM`: crc16 seeded with `crc16(~0, uuid)`.
    Crc16,
    /// `METADATA_CSUM`: low 16 bits of crc32c seeded with the volume seed.
    Crc32c,
}

/// The two byte ranges a descriptor checksum covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRegions<'a> {
    /// Stage one: `[0, 0x1E)`.
    pub prefix: &'a [u8],
    /// Stage two: `[0x20, desc_size)`, present only when `desc_size > 32`.
    pub tail: Option<&'a [u8]>,
}

impl<'a> DescriptorRegions<'a> {
    pub fn split(raw: &'a [u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size_usize = check_desc_len(raw.len(), desc_size)?;
        let tail = (desc_size_usize > GD_TAIL_OFFSET).then(|| &raw[GD_TAIL_OFFSET..desc_size_usize]);
        Ok(Self {
            prefix: &raw[..GD_CHECKSUM_OFFSET],
            tail,
        })
    }
}

/// Per-volume descriptor checksum calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorChecksummer {
    kind: DescriptorChecksumKind,
    uuid: Uuid,
    seed: u32,
    desc_size: u16,
}

impl DescriptorChecksummer {
    #[must_use]
    pub fn new(kind: DescriptorChecksumKind, uuid: Uuid, seed: u32, desc_size: u16) -> Self {
        Self {
            kind,
            uuid,
            seed,
            desc_size,
        }
    }

    #[must_use]
    pub fn for_superblock(sb: &Ext4Superblock) -> Self {
        Self::new(
            sb.descriptor_checksum_kind(),
            sb.uuid,
            sb.csum_seed(),
            sb.group_desc_size(),
        )
    }

    #[must_use]
    pub fn kind(&self) -> DescriptorChecksumKind {
        self.kind
    }

    #[must_use]
    pub fn desc_size(&self) -> u16 {
        self.desc_size
    }

    /// Compute the checksum of one raw descriptor. Returns 0 when
    /// checksums are disabled.
    #[allow(clippy::cast_possible_truncation)] // crc32c is truncated to 16 bits on disk
    pub fn compute(&self, group: GroupNumber, raw: &[u8]) -> Result<u16, ParseError> {
        let regions = DescriptorRegions::split(raw, self.desc_size)?;
        let le_group = group.0.to_le_bytes();
        let value = match self.kind {
            DescriptorChecksumKind::None => 0,
            DescriptorChecksumKind::Crc16 => {
                let mut digest = CRC16.digest();
                digest.update(self.uuid.as_bytes());
                digest.update(&le_group);
                digest.update(regions.prefix);
                if let Some(tail) = regions.tail {
                    digest.update(tail);
                }
                digest.finalize()
            }
            DescriptorChecksumKind::Crc32c => {
                let mut csum = crc32c::crc32c_append(self.seed, &le_group);
                csum = crc32c::crc32c_append(csum, regions.prefix);
                // The checksum field participates as zeros.
                csum = crc32c::crc32c_append(csum, &[0, 0]);
                if let Some(tail) = regions.tail {
                    csum = crc32c::crc32c_append(csum, tail);
                }
                (csum & 0xFFFF) as u16
            }
        };
        Ok(value)
    }

    /// `Ok(None)` when the stored checksum matches (or checksums are off),
    /// `Ok(Some((computed, stored)))` on mismatch.
    pub fn verify(&self, group: GroupNumber, raw: &[u8]) -> Result<Option<(u16, u16)>, ParseError> {
        if self.kind == DescriptorChecksumKind::None {
            return Ok(None);
        }
        let computed = self.compute(group, raw)?;
        let stored = read_le_u16(raw, GD_CHECKSUM_OFFSET)?;
        Ok((computed != stored).then_some((computed, stored)))
    }

    /// Recompute and store the checksum into `raw`.
    pub fn stamp(&self, group: GroupNumber, raw: &mut [u8]) -> Result<u16, ParseError> {
        let value = self.compute(group, raw)?;
        if self.kind != DescriptorChecksumKind::None {
            write_le_u16(raw, GD_CHECKSUM_OFFSET, value)?;
        }
        Ok(value)
    }
}
