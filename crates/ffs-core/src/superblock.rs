//! The in-memory Superblock Record: load, validate, persist.
//!
//! Exactly one record exists per mounted volume. It keeps the parsed
//! [`Ext4Superblock`] next to the raw 1024-byte region it came from, so
//! fields this crate does not model are written back untouched.

use crate::gdt::FreeCounters;
use ffs_block::{BlockDevice, ByteBlockDevice, ByteDevice};
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    ErrorSite, Ext4IncompatFeatures, Ext4RoCompatFeatures, Ext4Superblock, SB_ERROR_INFO_RANGE,
};
use ffs_types::{
    BlockNumber, EXT4_DFL_MAX_MNT_COUNT, EXT4_ERROR_FS, EXT4_MAX_SUPP_REV, EXT4_NDIR_BLOCKS,
    EXT4_SUPERBLOCK_SIZE, EXT4_VALID_FS, ParseError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Device block size used for the first read, before the stored size is known.
const PROBE_BLOCK_SIZE: u32 = 1024;

/// Where the record lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockLocation {
    pub byte_offset: u64,
    pub block: u64,
    pub offset_in_block: usize,
}

impl SuperblockLocation {
    fn at(byte_offset: u64, block_size: u32) -> Result<Self> {
        let bs = u64::from(block_size);
        let offset_in_block = usize::try_from(byte_offset % bs)
            .map_err(|_| FfsError::InvalidGeometry("superblock offset overflow".to_owned()))?;
        Ok(Self {
            byte_offset,
            block: byte_offset / bs,
            offset_in_block,
        })
    }
}

/// Derived per-volume sizing, computed once after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inodes_count: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub inodes_per_block: u32,
    pub inode_table_blocks_per_group: u32,
    pub desc_size: u16,
    pub descriptors_per_block: u32,
    pub groups_count: u32,
    pub descriptor_blocks: u32,
    /// Largest file an extent-mapped inode can hold.
    pub max_file_size: u64,
    /// Largest file the direct/indirect block map can hold.
    pub max_bitmap_file_size: u64,
    /// Effective RAID stripe in blocks, 0 when none.
    pub stripe: u64,
}

/// How a persist should derive the free-space fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistContext {
    pub counters: Option<FreeCounters>,
    pub read_only: bool,
}

/// Snapshot of the error diagnostic bytes, kept across journal replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfoSnapshot(Vec<u8>);

/// The superblock contents of a record, kept so a failed state change can
/// be undone in memory.
#[derive(Debug, Clone)]
pub(crate) struct RecordCheckpoint {
    sb: Ext4Superblock,
    region: Vec<u8>,
    mount_state: u16,
}

/// A freshly loaded record and the device switched to its block size.
pub struct LoadedSuperblock {
    pub record: SuperblockRecord,
    pub device: Arc<dyn BlockDevice>,
}

impl std::fmt::Debug for LoadedSuperblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedSuperblock")
            .field("record", &self.record)
            .field("device_block_size", &self.device.block_size())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SuperblockRecord {
    sb: Ext4Superblock,
    region: Vec<u8>,
    location: SuperblockLocation,
    /// `s_state` as found at mount time; written back at unmount.
    mount_state: u16,
    /// Set by a failed write, cleared by the next persist attempt.
    write_error: bool,
    persist_count: u64,
    skipped_ejected: u64,
    last_persisted_wtime: Option<u32>,
}

impl SuperblockRecord {
    /// Two-pass load from `raw` at byte `sb_byte`.
    ///
    /// The first pass reads with 1 KiB device blocks. When the stored block
    /// size differs, the device is reopened at that size and the record is
    /// read again from the corrected block and intra-block offset.
    pub fn load(raw: Arc<dyn ByteDevice>, sb_byte: u64) -> Result<LoadedSuperblock> {
        let probe: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(Arc::clone(&raw), PROBE_BLOCK_SIZE)?);
        let location = SuperblockLocation::at(sb_byte, PROBE_BLOCK_SIZE)?;
        let region = read_region(probe.as_ref(), location)?;
        let sb = Ext4Superblock::parse_superblock_region(&region).map_err(|e| match e {
            ParseError::InvalidMagic { actual, .. } => FfsError::NotThisFilesystem(format!(
                "can't find ext4 filesystem: magic {actual:#06x} at byte {sb_byte}"
            )),
            other => parse_error_to_ffs(&other, location.block),
        })?;

        if sb.block_size == PROBE_BLOCK_SIZE {
            tracing::debug!(target: "ffs::superblock", sb_byte, "superblock_loaded");
            return Ok(LoadedSuperblock {
                record: Self::from_parts(sb, region, location),
                device: probe,
            });
        }

        let block_size = sb.block_size;
        let device: Arc<dyn BlockDevice> = Arc::new(
            ByteBlockDevice::new(Arc::clone(&raw), block_size).map_err(|e| {
                FfsError::InvalidGeometry(format!("bad block size {block_size}: {e}"))
            })?,
        );
        let location = SuperblockLocation::at(sb_byte, block_size)?;
        let region = read_region(device.as_ref(), location)?;
        let sb = Ext4Superblock::parse_superblock_region(&region).map_err(|e| match e {
            ParseError::InvalidMagic { .. } => FfsError::CorruptMetadata {
                block: location.block,
                detail: "magic mismatch after block-size switch".to_owned(),
            },
            other => parse_error_to_ffs(&other, location.block),
        })?;
        if sb.block_size != block_size {
            return Err(FfsError::CorruptMetadata {
                block: location.block,
                detail: format!(
                    "block size changed from {block_size} to {} on reread",
                    sb.block_size
                ),
            });
        }
        tracing::debug!(
            target: "ffs::superblock",
            sb_byte,
            block_size,
            "superblock_loaded_after_block_size_switch"
        );
        Ok(LoadedSuperblock {
            record: Self::from_parts(sb, region, location),
            device,
        })
    }

    fn from_parts(sb: Ext4Superblock, region: Vec<u8>, location: SuperblockLocation) -> Self {
        Self {
            mount_state: sb.state,
            sb,
            region,
            location,
            write_error: false,
            persist_count: 0,
            skipped_ejected: 0,
            last_persisted_wtime: None,
        }
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext4Superblock {
        &self.sb
    }

    pub fn superblock_mut(&mut self) -> &mut Ext4Superblock {
        &mut self.sb
    }

    /// The raw region as last loaded or persisted.
    #[must_use]
    pub fn raw_region(&self) -> &[u8] {
        &self.region
    }

    #[must_use]
    pub fn location(&self) -> SuperblockLocation {
        self.location
    }

    #[must_use]
    pub fn mount_state(&self) -> u16 {
        self.mount_state
    }

    pub fn set_mount_state(&mut self, state: u16) {
        self.mount_state = state;
    }

    #[must_use]
    pub fn persist_count(&self) -> u64 {
        self.persist_count
    }

    #[must_use]
    pub fn skipped_ejected(&self) -> u64 {
        self.skipped_ejected
    }

    #[must_use]
    pub fn has_write_error(&self) -> bool {
        self.write_error
    }

    #[must_use]
    pub fn last_persisted_wtime(&self) -> Option<u32> {
        self.last_persisted_wtime
    }

    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.sb.needs_recovery()
    }

    pub fn set_needs_recovery(&mut self, on: bool) {
        let incompat = self.sb.feature_incompat;
        self.sb.feature_incompat = if on {
            incompat.with(Ext4IncompatFeatures::RECOVER)
        } else {
            incompat.without(Ext4IncompatFeatures::RECOVER)
        };
    }

    /// Verify `s_checksum` against the raw region. A mismatch fails a
    /// writable mount and is only a warning for a read-only one.
    pub fn verify_checksum(&self, read_only: bool) -> Result<()> {
        match self.sb.validate_checksum(&self.region) {
            Ok(()) => Ok(()),
            Err(err) if read_only => {
                tracing::warn!(
                    target: "ffs::superblock",
                    error = %err,
                    "superblock_checksum_mismatch_read_only"
                );
                Ok(())
            }
            Err(err) => Err(FfsError::CorruptMetadata {
                block: self.location.block,
                detail: format!("superblock checksum: {err}"),
            }),
        }
    }

    /// Feature gate. Unknown incompatible bits always fail; unknown
    /// read-only-compatible bits and bigalloc without extents fail only
    /// when `writable`.
    pub fn check_feature_compatibility(&self, writable: bool) -> Result<()> {
        let unknown = self.sb.feature_incompat.unsupported_bits();
        if unknown != 0 {
            return Err(FfsError::UnsupportedFeature(format!(
                "couldn't mount because of unsupported optional features ({unknown:#x})"
            )));
        }
        if !writable {
            return Ok(());
        }
        let unknown_ro = self.sb.feature_ro_compat.unsupported_bits();
        if unknown_ro != 0 {
            return Err(FfsError::UnsupportedFeature(format!(
                "couldn't mount RDWR because of unsupported optional features ({unknown_ro:#x})"
            )));
        }
        if self.sb.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC)
            && !self.sb.has_incompat(Ext4IncompatFeatures::EXTENTS)
        {
            return Err(FfsError::UnsupportedFeature(
                "can't mount with bigalloc without extents".to_owned(),
            ));
        }
        Ok(())
    }

    /// Revision newer than supported: mountable, but only read-only.
    #[must_use]
    pub fn revision_forces_read_only(&self) -> bool {
        if self.sb.rev_level > EXT4_MAX_SUPP_REV {
            tracing::error!(
                target: "ffs::superblock",
                rev_level = self.sb.rev_level,
                max = EXT4_MAX_SUPP_REV,
                "revision_too_high_forcing_read_only"
            );
            return true;
        }
        false
    }

    /// Geometry and layout checks against a device of `device_blocks` blocks.
    pub fn validate(&self, device_blocks: u64) -> Result<()> {
        self.sb
            .validate_geometry(Some(device_blocks))
            .map_err(|e| parse_error_to_ffs(&e, self.location.block))
    }

    #[must_use]
    pub fn compute_derived_geometry(&self, stripe_option: u64) -> Geometry {
        let sb = &self.sb;
        let blkbits = sb.block_size.trailing_zeros();
        let huge = sb.has_ro_compat(Ext4RoCompatFeatures::HUGE_FILE);
        Geometry {
            block_size: sb.block_size,
            blocks_count: sb.blocks_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            clusters_per_group: sb.clusters_per_group,
            inodes_per_group: sb.inodes_per_group,
            inodes_count: sb.inodes_count,
            inode_size: sb.inode_size,
            first_ino: sb.first_ino,
            inodes_per_block: sb.inodes_per_block(),
            inode_table_blocks_per_group: sb.inode_table_blocks_per_group(),
            desc_size: sb.group_desc_size(),
            descriptors_per_block: sb.descriptors_per_block(),
            groups_count: sb.groups_count(),
            descriptor_blocks: sb.descriptor_blocks(),
            max_file_size: max_extent_file_size(blkbits, huge),
            max_bitmap_file_size: max_bitmap_file_size(blkbits, huge),
            stripe: stripe_size(
                stripe_option,
                sb.raid_stripe_width,
                sb.raid_stride,
                sb.blocks_per_group,
            ),
        }
    }

    /// Write the record back.
    ///
    /// Skipped with `DeviceEjected` when the device is gone. A sticky write
    /// error from an earlier attempt is logged and retried.
    pub fn persist(&mut self, dev: &dyn BlockDevice, ctx: PersistContext, sync: bool) -> Result<()> {
        if !dev.device_present() {
            self.skipped_ejected += 1;
            tracing::warn!(
                target: "ffs::superblock",
                skipped = self.skipped_ejected,
                "superblock_persist_skipped_device_ejected"
            );
            return Err(FfsError::DeviceEjected);
        }
        if self.write_error {
            tracing::error!(
                target: "ffs::superblock",
                block = self.location.block,
                "previous_superblock_write_failed_retrying"
            );
            self.write_error = false;
        }
        if !ctx.read_only {
            self.sb.wtime = unix_now();
        }
        if let Some(counters) = ctx.counters {
            self.sb.free_blocks_count = counters.free_blocks;
            self.sb.free_inodes_count = counters.free_inodes;
        }
        self.sync_region()?;

        let result = self.write_region(dev).and_then(|()| {
            if sync {
                dev.sync()
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            self.write_error = true;
            tracing::error!(
                target: "ffs::superblock",
                block = self.location.block,
                error = %err,
                "superblock_write_failed"
            );
            return Err(match err {
                FfsError::IoFailure { .. } | FfsError::DeviceEjected => err,
                other => FfsError::IoFailure {
                    block: self.location.block,
                    detail: other.to_string(),
                },
            });
        }
        self.persist_count += 1;
        self.last_persisted_wtime = Some(self.sb.wtime);
        tracing::trace!(target: "ffs::superblock", sync, "superblock_persisted");
        Ok(())
    }

    /// Re-serialize the parsed record into the raw region.
    fn sync_region(&mut self) -> Result<()> {
        let checksum = self
            .sb
            .serialize_into(&mut self.region)
            .map_err(|e| parse_error_to_ffs(&e, self.location.block))?;
        self.sb.checksum = checksum;
        Ok(())
    }

    fn write_region(&self, dev: &dyn BlockDevice) -> Result<()> {
        let block = BlockNumber(self.location.block);
        let start = self.location.offset_in_block;
        if dev.block_size() as usize == EXT4_SUPERBLOCK_SIZE && start == 0 {
            return dev.write_block(block, &self.region);
        }
        let mut buf = dev.read_block(block)?;
        buf.as_mut_slice()[start..start + EXT4_SUPERBLOCK_SIZE].copy_from_slice(&self.region);
        dev.write_block(block, buf.as_slice())
    }

    /// Writable-mount bookkeeping: sanity warnings, mount count, `mtime`,
    /// and `RECOVER` when a journal is present. Persists synchronously.
    pub fn setup_super(
        &mut self,
        dev: &dyn BlockDevice,
        has_journal: bool,
        counters: Option<FreeCounters>,
    ) -> Result<()> {
        let now = unix_now();
        let sb = &self.sb;
        if self.mount_state & EXT4_VALID_FS == 0 {
            tracing::warn!(
                target: "ffs::superblock",
                "mounting_unchecked_fs_running_fsck_recommended"
            );
        } else if self.mount_state & EXT4_ERROR_FS != 0 {
            tracing::warn!(
                target: "ffs::superblock",
                "mounting_fs_with_errors_running_fsck_recommended"
            );
        } else if sb.max_mnt_count > 0 && sb.mnt_count >= sb.max_mnt_count {
            tracing::warn!(
                target: "ffs::superblock",
                mnt_count = sb.mnt_count,
                max_mnt_count = sb.max_mnt_count,
                "maximal_mount_count_reached_running_fsck_recommended"
            );
        } else if sb.checkinterval > 0 && sb.lastcheck.saturating_add(sb.checkinterval) <= now {
            tracing::warn!(
                target: "ffs::superblock",
                lastcheck = sb.lastcheck,
                checkinterval = sb.checkinterval,
                "checktime_reached_running_fsck_recommended"
            );
        }

        let sb = &mut self.sb;
        if !has_journal {
            sb.state &= !EXT4_VALID_FS;
        }
        if sb.max_mnt_count == 0 {
            sb.max_mnt_count = EXT4_DFL_MAX_MNT_COUNT;
        }
        sb.mnt_count = sb.mnt_count.wrapping_add(1);
        sb.mtime = now;
        if has_journal {
            self.set_needs_recovery(true);
        }
        tracing::info!(
            target: "ffs::superblock",
            mnt_count = self.sb.mnt_count,
            has_journal,
            "setup_super"
        );
        self.persist(
            dev,
            PersistContext {
                counters,
                read_only: false,
            },
            true,
        )
    }

    /// Record a fault in the diagnostic fields. The first-error slot is
    /// filled once; the last-error slot every time.
    pub fn record_error(&mut self, site: ErrorSite) {
        self.sb.state |= EXT4_ERROR_FS;
        self.mount_state |= EXT4_ERROR_FS;
        if self.sb.first_error.time == 0 {
            self.sb.first_error = site.clone();
        }
        self.sb.last_error = site;
        self.sb.error_count = self.sb.error_count.saturating_add(1);
    }

    pub fn snapshot_error_info(&mut self) -> Result<ErrorInfoSnapshot> {
        self.sync_region()?;
        Ok(ErrorInfoSnapshot(self.region[SB_ERROR_INFO_RANGE].to_vec()))
    }

    /// Re-read the record from `dev` (journal replay may have rewritten
    /// it) and put the saved error diagnostics back.
    pub fn reload_preserving_errors(
        &mut self,
        dev: &dyn BlockDevice,
        saved: &ErrorInfoSnapshot,
    ) -> Result<()> {
        let mut region = read_region(dev, self.location)?;
        region[SB_ERROR_INFO_RANGE].copy_from_slice(&saved.0);
        let sb = Ext4Superblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_to_ffs(&e, self.location.block))?;
        self.sb = sb;
        self.region = region;
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> RecordCheckpoint {
        RecordCheckpoint {
            sb: self.sb.clone(),
            region: self.region.clone(),
            mount_state: self.mount_state,
        }
    }

    /// Put the superblock back as checkpointed. Write-error tracking and
    /// persist counters are left as they are.
    pub(crate) fn rollback(&mut self, checkpoint: RecordCheckpoint) {
        self.sb = checkpoint.sb;
        self.region = checkpoint.region;
        self.mount_state = checkpoint.mount_state;
    }

    /// `s_state` as currently stored on the device.
    pub fn read_stored_state(&self, dev: &dyn BlockDevice) -> Result<u16> {
        let region = read_region(dev, self.location)?;
        let sb = Ext4Superblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_to_ffs(&e, self.location.block))?;
        Ok(sb.state)
    }
}

fn read_region(dev: &dyn BlockDevice, location: SuperblockLocation) -> Result<Vec<u8>> {
    let buf = dev.read_block(BlockNumber(location.block))?;
    let start = location.offset_in_block;
    buf.as_slice()
        .get(start..start + EXT4_SUPERBLOCK_SIZE)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| FfsError::CorruptMetadata {
            block: location.block,
            detail: "superblock region crosses the block end".to_owned(),
        })
}

/// Convert a mount-time `ParseError` into the matching `FfsError`.
///
/// `InvalidField` is split by field name into unsupported features,
/// geometry errors, checksum failures, and plain format errors.
pub(crate) fn parse_error_to_ffs(e: &ParseError, block: u64) -> FfsError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") || reason.contains("unsupported") {
                FfsError::UnsupportedFeature(format!("{field}: {reason}"))
            } else if field.contains("checksum") {
                FfsError::CorruptMetadata {
                    block,
                    detail: format!("{field}: {reason}"),
                }
            } else if field.contains("block_size")
                || field.contains("cluster")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_ino")
                || field.contains("desc_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                FfsError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                FfsError::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => FfsError::NotThisFilesystem(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            FfsError::CorruptMetadata {
                block,
                detail: e.to_string(),
            }
        }
    }
}

pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ── Size limits ─────────────────────────────────────────────────────────────

/// Largest file an extent-mapped inode can address.
///
/// Extents carry 32-bit logical block numbers; without `HUGE_FILE`,
/// `i_blocks` counts 512-byte sectors in 32 bits and caps the size first.
#[must_use]
pub fn max_extent_file_size(blkbits: u32, huge_file: bool) -> u64 {
    let lfs_max = i64::MAX as u64;
    let upper = if huge_file {
        lfs_max
    } else {
        (u64::from(u32::MAX) >> (blkbits - 9)) << blkbits
    };
    let extent_limit = u64::from(u32::MAX) << blkbits;
    extent_limit.min(upper)
}

/// Largest file the direct/indirect block map can address, counting the
/// indirect blocks against the `i_blocks` limit.
#[must_use]
pub fn max_bitmap_file_size(blkbits: u32, huge_file: bool) -> u64 {
    let lfs_max = u128::from(i64::MAX as u64);
    let ppb = 1_u128 << (blkbits - 2);
    let mut upper_limit: u128 = if huge_file {
        (1_u128 << 48) - 1
    } else {
        u128::from(u32::MAX) >> (blkbits - 9)
    };

    let mut res = EXT4_NDIR_BLOCKS as u128 + ppb + ppb * ppb + ppb * ppb * ppb;
    let mut meta_blocks = 1 + (1 + ppb) + (1 + ppb + ppb * ppb);

    if res + meta_blocks > upper_limit {
        res = upper_limit;
        upper_limit -= EXT4_NDIR_BLOCKS as u128;
        meta_blocks = 1;
        upper_limit -= ppb;
        if upper_limit < ppb * ppb {
            meta_blocks += 1 + upper_limit.div_ceil(ppb);
        } else {
            meta_blocks += 1 + ppb;
            upper_limit -= ppb * ppb;
            meta_blocks += 1 + upper_limit.div_ceil(ppb) + upper_limit.div_ceil(ppb * ppb);
        }
        res -= meta_blocks;
    }

    let bytes = (res << blkbits).min(lfs_max);
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// Stripe used for allocation: the `stripe=` option if it fits in a group,
/// else the stored stripe width, else the stride; 0 when the result is 1 or
/// less.
#[must_use]
pub fn stripe_size(option: u64, stripe_width: u32, stride: u16, blocks_per_group: u32) -> u64 {
    let bpg = u64::from(blocks_per_group);
    let width = u64::from(stripe_width);
    let stride = u64::from(stride);
    let stripe = if option != 0 && option <= bpg {
        option
    } else if width != 0 && width <= bpg {
        width
    } else if stride != 0 && stride <= bpg {
        stride
    } else {
        0
    };
    if stripe <= 1 { 0 } else { stripe }
}
