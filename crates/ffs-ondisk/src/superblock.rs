//! ext4 superblock codec.
//!
//! [`Ext4Superblock::parse_superblock_region`] decodes the 1024-byte region;
//! [`Ext4Superblock::serialize_into`] writes every modelled field back into a
//! region that still carries the bytes this crate does not model, so a
//! parse → serialize cycle never clobbers unknown fields.

use crate::features::{
    DefaultMountOpts, Ext4CompatFeatures, Ext4IncompatFeatures, Ext4RoCompatFeatures,
};
use ffs_types::{
    EXT4_GOOD_OLD_FIRST_INO, EXT4_GOOD_OLD_INODE_SIZE, EXT4_GOOD_OLD_REV, EXT4_MAX_DESC_SIZE,
    EXT4_MIN_DESC_SIZE, EXT4_MIN_DESC_SIZE_64BIT, EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_SIZE,
    GroupNumber, ParseError, Uuid, ensure_slice, ext4_block_size_from_log, group_first_block,
    group_has_super_backup, read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded,
    write_bytes, write_le_u16, write_le_u32, write_le_u64, write_nul_padded,
};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Offset of `s_checksum`.
pub const SB_CHECKSUM_OFFSET: usize = 0x3FC;

/// Byte range of the error diagnostic block (`s_error_count` up to
/// `s_mount_opts`). Preserved verbatim across journal replay.
pub const SB_ERROR_INFO_RANGE: Range<usize> = 0x194..0x200;

const ERROR_FUNC_LEN: usize = 32;
const MOUNT_OPTS_LEN: usize = 64;

/// Largest `s_log_block_size` accepted (64 KiB blocks).
const MAX_LOG_BLOCK_SIZE: u32 = 6;

/// One first/last error diagnostic slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSite {
    pub time: u32,
    pub ino: u32,
    pub block: u64,
    pub func: String,
    pub line: u32,
}

impl ErrorSite {
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.time != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub log_cluster_size: u32,
    pub cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,
    pub first_meta_bg: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: Uuid,
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── Features & mount defaults ────────────────────────────────────────
    pub feature_compat: Ext4CompatFeatures,
    pub feature_incompat: Ext4IncompatFeatures,
    pub feature_ro_compat: Ext4RoCompatFeatures,
    pub default_mount_opts: DefaultMountOpts,
    pub mount_opts: String,

    // ── State & error tracking ───────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub checkinterval: u32,
    pub error_count: u32,
    pub first_error: ErrorSite,
    pub last_error: ErrorSite,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub mkfs_time: u32,

    // ── Journal & orphans ────────────────────────────────────────────────
    pub journal_uuid: Uuid,
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,

    // ── RAID / flex geometry ─────────────────────────────────────────────
    pub raid_stride: u16,
    pub raid_stripe_width: u32,
    pub log_groups_per_flex: u8,

    // ── Checksums ────────────────────────────────────────────────────────
    pub checksum_type: u8,
    pub checksum_seed: u32,
    pub checksum: u32,
}

impl Ext4Superblock {
    /// Parse an ext4 superblock from a 1024-byte superblock region.
    ///
    /// The magic is checked before anything else so a foreign volume is
    /// reported as `InvalidMagic`, never as a field error.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);
        let r_blocks_lo = u64::from(read_le_u32(region, 0x08)?);
        let r_blocks_hi = u64::from(read_le_u32(region, 0x154)?);
        let free_blocks_lo = u64::from(read_le_u32(region, 0x0C)?);
        let free_blocks_hi = u64::from(read_le_u32(region, 0x158)?);

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = match ext4_block_size_from_log(log_block_size) {
            Some(size) if log_block_size <= MAX_LOG_BLOCK_SIZE => size,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "s_log_block_size",
                    reason: "block size outside 1K..64K",
                });
            }
        };

        let log_cluster_size = read_le_u32(region, 0x1C)?;
        let Some(cluster_size) = ext4_block_size_from_log(log_cluster_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_cluster_size",
                reason: "invalid shift",
            });
        };

        let incompat = Ext4IncompatFeatures(read_le_u32(region, 0x60)?);
        let rev_level = read_le_u32(region, 0x4C)?;
        let (inode_size, first_ino) = if rev_level == EXT4_GOOD_OLD_REV {
            (EXT4_GOOD_OLD_INODE_SIZE, EXT4_GOOD_OLD_FIRST_INO)
        } else {
            (read_le_u16(region, 0x58)?, read_le_u32(region, 0x54)?)
        };
        let desc_size = if incompat.contains(Ext4IncompatFeatures::BIT64) {
            read_le_u16(region, 0xFE)?
        } else {
            EXT4_MIN_DESC_SIZE
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            reserved_blocks_count: r_blocks_lo | (r_blocks_hi << 32),
            free_blocks_count: free_blocks_lo | (free_blocks_hi << 32),
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            log_cluster_size,
            cluster_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            clusters_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,
            desc_size,
            first_meta_bg: read_le_u32(region, 0x104)?,

            magic,
            uuid: Uuid(read_fixed::<16>(region, 0x68)?),
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            feature_compat: Ext4CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: incompat,
            feature_ro_compat: Ext4RoCompatFeatures(read_le_u32(region, 0x64)?),
            default_mount_opts: DefaultMountOpts(read_le_u32(region, 0x100)?),
            mount_opts: trim_nul_padded(ensure_slice(region, 0x200, MOUNT_OPTS_LEN)?),

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            checkinterval: read_le_u32(region, 0x44)?,
            error_count: read_le_u32(region, 0x194)?,
            first_error: ErrorSite {
                time: read_le_u32(region, 0x198)?,
                ino: read_le_u32(region, 0x19C)?,
                block: read_le_u64(region, 0x1A0)?,
                func: trim_nul_padded(ensure_slice(region, 0x1A8, ERROR_FUNC_LEN)?),
                line: read_le_u32(region, 0x1C8)?,
            },
            last_error: ErrorSite {
                time: read_le_u32(region, 0x1CC)?,
                ino: read_le_u32(region, 0x1D0)?,
                line: read_le_u32(region, 0x1D4)?,
                block: read_le_u64(region, 0x1D8)?,
                func: trim_nul_padded(ensure_slice(region, 0x1E0, ERROR_FUNC_LEN)?),
            },

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            mkfs_time: read_le_u32(region, 0x108)?,

            journal_uuid: Uuid(read_fixed::<16>(region, 0xD0)?),
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,
            last_orphan: read_le_u32(region, 0xE8)?,

            raid_stride: read_le_u16(region, 0x164)?,
            raid_stripe_width: read_le_u32(region, 0x170)?,
            log_groups_per_flex: ensure_slice(region, 0x174, 1)?[0],

            checksum_type: ensure_slice(region, 0x175, 1)?[0],
            checksum_seed: read_le_u32(region, 0x270)?,
            checksum: read_le_u32(region, SB_CHECKSUM_OFFSET)?,
        })
    }

    /// Write every modelled field into `region`, then refresh `s_checksum`
    /// when metadata checksums are enabled.
    ///
    /// Returns the checksum value now stored in the region.
    #[allow(clippy::cast_possible_truncation)] // lo/hi halves are masked explicitly
    pub fn serialize_into(&self, region: &mut [u8]) -> Result<u32, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count as u32)?;
        write_le_u32(region, 0x150, (self.blocks_count >> 32) as u32)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count as u32)?;
        write_le_u32(region, 0x154, (self.reserved_blocks_count >> 32) as u32)?;
        write_le_u32(region, 0x0C, self.free_blocks_count as u32)?;
        write_le_u32(region, 0x158, (self.free_blocks_count >> 32) as u32)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x1C, self.log_cluster_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.clusters_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x44, self.checkinterval)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        if self.rev_level != EXT4_GOOD_OLD_REV {
            write_le_u32(region, 0x54, self.first_ino)?;
            write_le_u16(region, 0x58, self.inode_size)?;
        }
        write_le_u32(region, 0x5C, self.feature_compat.0)?;
        write_le_u32(region, 0x60, self.feature_incompat.0)?;
        write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
        write_bytes(region, 0x68, self.uuid.as_bytes())?;
        write_bytes(region, 0xD0, self.journal_uuid.as_bytes())?;
        write_le_u32(region, 0xE0, self.journal_inum)?;
        write_le_u32(region, 0xE4, self.journal_dev)?;
        write_le_u32(region, 0xE8, self.last_orphan)?;
        if self.is_64bit() {
            write_le_u16(region, 0xFE, self.desc_size)?;
        }
        write_le_u32(region, 0x100, self.default_mount_opts.0)?;
        write_le_u32(region, 0x104, self.first_meta_bg)?;
        write_le_u32(region, 0x108, self.mkfs_time)?;
        write_le_u16(region, 0x164, self.raid_stride)?;
        write_le_u32(region, 0x170, self.raid_stripe_width)?;
        region[0x174] = self.log_groups_per_flex;
        region[0x175] = self.checksum_type;

        write_le_u32(region, 0x194, self.error_count)?;
        write_le_u32(region, 0x198, self.first_error.time)?;
        write_le_u32(region, 0x19C, self.first_error.ino)?;
        write_le_u64(region, 0x1A0, self.first_error.block)?;
        write_nul_padded(region, 0x1A8, ERROR_FUNC_LEN, &self.first_error.func)?;
        write_le_u32(region, 0x1C8, self.first_error.line)?;
        write_le_u32(region, 0x1CC, self.last_error.time)?;
        write_le_u32(region, 0x1D0, self.last_error.ino)?;
        write_le_u32(region, 0x1D4, self.last_error.line)?;
        write_le_u64(region, 0x1D8, self.last_error.block)?;
        write_nul_padded(region, 0x1E0, ERROR_FUNC_LEN, &self.last_error.func)?;
        write_le_u32(region, 0x270, self.checksum_seed)?;

        let checksum = if self.has_metadata_csum() {
            superblock_checksum(region)
        } else {
            self.checksum
        };
        write_le_u32(region, SB_CHECKSUM_OFFSET, checksum)?;
        Ok(checksum)
    }

    #[must_use]
    pub fn has_compat(&self, mask: Ext4CompatFeatures) -> bool {
        self.feature_compat.contains(mask)
    }

    #[must_use]
    pub fn has_incompat(&self, mask: Ext4IncompatFeatures) -> bool {
        self.feature_incompat.contains(mask)
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: Ext4RoCompatFeatures) -> bool {
        self.feature_ro_compat.contains(mask)
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(Ext4IncompatFeatures::BIT64)
    }

    #[must_use]
    pub fn has_journal(&self) -> bool {
        self.has_compat(Ext4CompatFeatures::HAS_JOURNAL)
    }

    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.has_incompat(Ext4IncompatFeatures::RECOVER)
    }

    /// Whether this superblock uses metadata checksums (crc32c).
    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.has_ro_compat(Ext4RoCompatFeatures::METADATA_CSUM)
    }

    /// Whether group descriptors carry a checksum at all.
    #[must_use]
    pub fn is_checksum_enabled(&self) -> bool {
        self.has_metadata_csum() || self.has_ro_compat(Ext4RoCompatFeatures::GDT_CSUM)
    }

    /// Which algorithm protects the group descriptors.
    #[must_use]
    pub fn descriptor_checksum_kind(&self) -> crate::DescriptorChecksumKind {
        if self.has_metadata_csum() {
            crate::DescriptorChecksumKind::Crc32c
        } else if self.has_ro_compat(Ext4RoCompatFeatures::GDT_CSUM) {
            crate::DescriptorChecksumKind::Crc16
        } else {
            crate::DescriptorChecksumKind::None
        }
    }

    /// Effective descriptor size: 32, or `s_desc_size` with the 64-bit feature.
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size
        } else {
            EXT4_MIN_DESC_SIZE
        }
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    #[must_use]
    pub fn descriptors_per_block(&self) -> u32 {
        self.block_size / u32::from(self.group_desc_size().max(1))
    }

    /// Blocks occupied by the descriptor table.
    #[must_use]
    pub fn descriptor_blocks(&self) -> u32 {
        let per_block = self.descriptors_per_block().max(1);
        self.groups_count().div_ceil(per_block)
    }

    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / u32::from(self.inode_size.max(1))
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks_per_group(&self) -> u32 {
        self.inodes_per_group.div_ceil(self.inodes_per_block().max(1))
    }

    /// Superblock location in filesystem blocks (the primary copy lives at
    /// byte 1024).
    #[must_use]
    pub fn superblock_block(&self, sb_byte_offset: u64) -> u64 {
        sb_byte_offset / u64::from(self.block_size)
    }

    /// Physical block holding descriptor block `index`.
    ///
    /// Without `META_BG` the table is contiguous right after the superblock
    /// block. With `META_BG`, blocks past `s_first_meta_bg` live in the first,
    /// second and last group of each meta group.
    #[must_use]
    pub fn descriptor_block(&self, logical_sb_block: u64, index: u32) -> Option<u64> {
        if !self.has_incompat(Ext4IncompatFeatures::META_BG) || index < self.first_meta_bg {
            return logical_sb_block.checked_add(u64::from(index))?.checked_add(1);
        }
        let per_block = self.descriptors_per_block();
        let group = index.checked_mul(per_block)?;
        let group = GroupNumber(group);
        let first = group_first_block(group, self.blocks_per_group, self.first_data_block)?;
        let sparse = self.has_ro_compat(Ext4RoCompatFeatures::SPARSE_SUPER);
        let has_super = u64::from(group_has_super_backup(group, sparse));
        first.0.checked_add(has_super)
    }

    /// Compute the crc32c checksum seed used for metadata checksums.
    ///
    /// If `INCOMPAT_CSUM_SEED` is set, uses the precomputed `checksum_seed`
    /// field. Otherwise `crc32c_append(!0, uuid)`.
    #[must_use]
    pub fn csum_seed(&self) -> u32 {
        if self.has_incompat(Ext4IncompatFeatures::CSUM_SEED) {
            self.checksum_seed
        } else {
            crc32c::crc32c_append(!0u32, self.uuid.as_bytes())
        }
    }

    /// Validate the superblock's own CRC32C checksum against `raw_region`.
    pub fn validate_checksum(&self, raw_region: &[u8]) -> Result<(), ParseError> {
        if !self.has_metadata_csum() {
            return Ok(());
        }
        if raw_region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: raw_region.len(),
            });
        }
        if superblock_checksum(raw_region) != self.checksum {
            return Err(ParseError::InvalidField {
                field: "s_checksum",
                reason: "superblock CRC32C mismatch",
            });
        }
        Ok(())
    }

    /// Validate per-field geometry and cross-field layout.
    ///
    /// `device_blocks` is the size of the backing device in filesystem
    /// blocks, when known.
    pub fn validate_geometry(&self, device_blocks: Option<u64>) -> Result<(), ParseError> {
        self.validate_geometry_fields()?;
        self.validate_geometry_layout(device_blocks)
    }

    fn validate_geometry_fields(&self) -> Result<(), ParseError> {
        let bitmap_bits = self.block_size.saturating_mul(8);

        if self.blocks_per_group == 0 || self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }

        if self.rev_level != EXT4_GOOD_OLD_REV {
            if self.inode_size < EXT4_GOOD_OLD_INODE_SIZE
                || !self.inode_size.is_power_of_two()
                || u32::from(self.inode_size) > self.block_size
            {
                return Err(ParseError::InvalidField {
                    field: "s_inode_size",
                    reason: "must be a power of two in [128, block_size]",
                });
            }
            if self.first_ino < EXT4_GOOD_OLD_FIRST_INO {
                return Err(ParseError::InvalidField {
                    field: "s_first_ino",
                    reason: "must be >= 11",
                });
            }
        }

        if self.is_64bit()
            && (self.desc_size < EXT4_MIN_DESC_SIZE_64BIT
                || self.desc_size > EXT4_MAX_DESC_SIZE
                || !self.desc_size.is_power_of_two())
        {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "64BIT requires a power of two in [64, 1024]",
            });
        }

        if self.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC) {
            if self.cluster_size < self.block_size {
                return Err(ParseError::InvalidField {
                    field: "s_log_cluster_size",
                    reason: "cluster size smaller than block size",
                });
            }
            let ratio = self.cluster_size / self.block_size;
            if self.clusters_per_group.checked_mul(ratio) != Some(self.blocks_per_group) {
                return Err(ParseError::InvalidField {
                    field: "s_clusters_per_group",
                    reason: "blocks_per_group != clusters_per_group * cluster ratio",
                });
            }
        } else if self.log_cluster_size != self.log_block_size {
            return Err(ParseError::InvalidField {
                field: "s_log_cluster_size",
                reason: "cluster size differs from block size without bigalloc",
            });
        }

        Ok(())
    }

    fn validate_geometry_layout(&self, device_blocks: Option<u64>) -> Result<(), ParseError> {
        if u64::from(self.first_data_block) >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        if let Some(device_blocks) = device_blocks {
            if self.blocks_count > device_blocks {
                return Err(ParseError::InvalidField {
                    field: "s_blocks_count",
                    reason: "blocks_count exceeds device size",
                });
            }
        }

        let groups = u64::from(self.groups_count());
        if groups == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "zero block groups",
            });
        }
        let limit = (1_u64 << 32).saturating_sub(u64::from(self.descriptors_per_block()));
        if groups >= limit {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "too many block groups",
            });
        }
        let max_inodes = groups.saturating_mul(u64::from(self.inodes_per_group));
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }
        Ok(())
    }
}

/// crc32c over the superblock bytes preceding `s_checksum`.
#[must_use]
pub fn superblock_checksum(region: &[u8]) -> u32 {
    let end = SB_CHECKSUM_OFFSET.min(region.len());
    crc32c::crc32c_append(!0u32, &region[..end])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ffs_types::write_le_u32;

    /// Minimal valid 1 KiB-block superblock region: 4 groups of 256 blocks.
    pub(crate) fn make_valid_sb() -> [u8; EXT4_SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; EXT4_SUPERBLOCK_SIZE];
        sb[0x38..0x3A].copy_from_slice(&EXT4_SUPER_MAGIC.to_le_bytes());
        sb[0x00..0x04].copy_from_slice(&128_u32.to_le_bytes()); // inodes_count
        sb[0x04..0x08].copy_from_slice(&1024_u32.to_le_bytes()); // blocks_count
        sb[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes()); // first_data_block
        sb[0x20..0x24].copy_from_slice(&256_u32.to_le_bytes()); // blocks_per_group
        sb[0x24..0x28].copy_from_slice(&256_u32.to_le_bytes()); // clusters_per_group
        sb[0x28..0x2C].copy_from_slice(&32_u32.to_le_bytes()); // inodes_per_group
        sb[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes()); // rev_level
        sb[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes()); // first_ino
        sb[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes()); // inode_size
        sb[0x68..0x78].copy_from_slice(&[0x11; 16]); // uuid
        sb
    }

    #[test]
    fn parse_rejects_bad_magic_before_fields() {
        let mut sb = make_valid_sb();
        sb[0x38] = 0;
        sb[0x18..0x1C].copy_from_slice(&99_u32.to_le_bytes());
        assert!(matches!(
            Ext4Superblock::parse_superblock_region(&sb),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn parse_accepts_64k_rejects_128k() {
        let mut sb = make_valid_sb();
        sb[0x18..0x1C].copy_from_slice(&6_u32.to_le_bytes());
        let parsed = Ext4Superblock::parse_superblock_region(&sb).expect("64K parse");
        assert_eq!(parsed.block_size, 65536);

        sb[0x18..0x1C].copy_from_slice(&7_u32.to_le_bytes());
        assert!(matches!(
            Ext4Superblock::parse_superblock_region(&sb),
            Err(ParseError::InvalidField {
                field: "s_log_block_size",
                ..
            })
        ));
    }

    #[test]
    fn rev0_forces_legacy_inode_geometry() {
        let mut sb = make_valid_sb();
        sb[0x4C..0x50].copy_from_slice(&0_u32.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&512_u16.to_le_bytes());
        let parsed = Ext4Superblock::parse_superblock_region(&sb).expect("parse");
        assert_eq!(parsed.inode_size, 128);
        assert_eq!(parsed.first_ino, 11);
    }

    #[test]
    fn serialize_preserves_unmodelled_bytes() {
        let mut raw = make_valid_sb();
        raw[0x300] = 0xAB; // unmodelled area
        let mut parsed = Ext4Superblock::parse_superblock_region(&raw).expect("parse");
        parsed.last_orphan = 17;
        parsed.error_count = 3;
        parsed.last_error = ErrorSite {
            time: 99,
            ino: 12,
            block: 0x1_0000_0002,
            func: "ext4_lookup".into(),
            line: 404,
        };
        parsed.serialize_into(&mut raw).expect("serialize");
        assert_eq!(raw[0x300], 0xAB);

        let reparsed = Ext4Superblock::parse_superblock_region(&raw).expect("reparse");
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn serialize_refreshes_metadata_checksum() {
        let mut raw = make_valid_sb();
        write_le_u32(&mut raw, 0x64, Ext4RoCompatFeatures::METADATA_CSUM.0).expect("ro_compat");
        let mut parsed = Ext4Superblock::parse_superblock_region(&raw).expect("parse");
        parsed.mnt_count = 7;
        let csum = parsed.serialize_into(&mut raw).expect("serialize");
        parsed.checksum = csum;
        parsed.validate_checksum(&raw).expect("fresh checksum verifies");

        raw[0x40] ^= 0xFF;
        assert!(parsed.validate_checksum(&raw).is_err());
    }

    #[test]
    fn geometry_helpers() {
        let parsed = Ext4Superblock::parse_superblock_region(&make_valid_sb()).expect("parse");
        assert_eq!(parsed.groups_count(), 4);
        assert_eq!(parsed.group_desc_size(), 32);
        assert_eq!(parsed.descriptors_per_block(), 32);
        assert_eq!(parsed.descriptor_blocks(), 1);
        assert_eq!(parsed.inodes_per_block(), 8);
        assert_eq!(parsed.inode_table_blocks_per_group(), 4);
        assert_eq!(parsed.descriptor_block(1, 0), Some(2));
        parsed.validate_geometry(Some(1024)).expect("valid geometry");
        assert!(parsed.validate_geometry(Some(512)).is_err());
    }

    #[test]
    fn bigalloc_cluster_ratio_checked() {
        let mut raw = make_valid_sb();
        write_le_u32(&mut raw, 0x64, Ext4RoCompatFeatures::BIGALLOC.0).expect("ro_compat");
        write_le_u32(&mut raw, 0x1C, 2).expect("log cluster 4K");
        write_le_u32(&mut raw, 0x24, 64).expect("cpg");
        let parsed = Ext4Superblock::parse_superblock_region(&raw).expect("parse");
        parsed.validate_geometry(None).expect("256 = 64 * 4");

        write_le_u32(&mut raw, 0x24, 63).expect("cpg");
        let parsed = Ext4Superblock::parse_superblock_region(&raw).expect("parse");
        assert!(parsed.validate_geometry(None).is_err());
    }

    #[test]
    fn inode_size_must_fit_block() {
        let mut raw = make_valid_sb();
        raw[0x58..0x5A].copy_from_slice(&2048_u16.to_le_bytes());
        let parsed = Ext4Superblock::parse_superblock_region(&raw).expect("parse");
        assert!(matches!(
            parsed.validate_geometry(None),
            Err(ParseError::InvalidField {
                field: "s_inode_size",
                ..
            })
        ));
    }
}
