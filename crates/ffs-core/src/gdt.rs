//! Group Descriptor Table: load, verify, recompute, write back.
//!
//! The table keeps the raw descriptor blocks as read from disk. Parsed
//! [`Ext4GroupDesc`] values are the working copy; every update serializes
//! into the raw bytes, restamps the checksum, and writes the one containing
//! block back.

use crate::superblock::parse_error_to_ffs;
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{DescriptorChecksummer, Ext4GroupDesc, Ext4IncompatFeatures, Ext4Superblock};
use ffs_types::{BlockNumber, GroupNumber, group_first_block, write_le_u16};
use serde::{Deserialize, Serialize};

/// Byte offsets of the bitmap checksum halves inside a descriptor.
const BLOCK_BITMAP_CSUM_LO: usize = 0x18;
const INODE_BITMAP_CSUM_LO: usize = 0x1A;
const BLOCK_BITMAP_CSUM_HI: usize = 0x38;
const INODE_BITMAP_CSUM_HI: usize = 0x3A;
const BITMAP_CSUM_HI_END: usize = 0x3C;

/// Free space totals summed over every group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeCounters {
    pub free_blocks: u64,
    pub free_inodes: u32,
}

/// Outcome of [`GroupDescTable::verify_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// First group whose inode table is not yet zeroed.
    pub first_uninitialized_group: Option<u32>,
    /// Groups whose stored checksum did not match (read-only mounts only).
    pub checksum_failures: Vec<u32>,
    pub counters: FreeCounters,
}

/// Which bitmap a checksum belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    Block,
    Inode,
}

#[derive(Debug, Clone)]
pub struct GroupDescTable {
    descs: Vec<Ext4GroupDesc>,
    raw: Vec<u8>,
    /// Physical block of each descriptor block, in table order.
    block_locations: Vec<u64>,
    block_size: usize,
    desc_size: u16,
    per_block: u32,
    checksummer: DescriptorChecksummer,
    counters: FreeCounters,
}

impl GroupDescTable {
    /// Read every descriptor block. `sb_block` is the filesystem block that
    /// holds the superblock in use.
    ///
    /// Returns the table and the number of descriptor blocks read.
    pub fn load(dev: &dyn BlockDevice, sb: &Ext4Superblock, sb_block: u64) -> Result<(Self, u32)> {
        let total = sb.descriptor_blocks();
        let groups = sb.groups_count();
        let desc_size = sb.group_desc_size();
        let per_block = sb.descriptors_per_block();
        let block_size = dev.block_size() as usize;

        let mut raw = Vec::with_capacity(total as usize * block_size);
        let mut block_locations = Vec::with_capacity(total as usize);
        for index in 0..total {
            let location = sb.descriptor_block(sb_block, index).ok_or_else(|| {
                FfsError::InvalidGeometry(format!("descriptor block {index} has no location"))
            })?;
            let buf = dev
                .read_block(BlockNumber(location))
                .map_err(|err| FfsError::IoFailure {
                    block: location,
                    detail: format!(
                        "can't read group descriptors: read {index} of {total} blocks: {err}"
                    ),
                })?;
            raw.extend_from_slice(buf.as_slice());
            block_locations.push(location);
        }

        let mut descs = Vec::with_capacity(groups as usize);
        for group in 0..groups {
            let (start, end) = descriptor_span(group, desc_size);
            let desc = Ext4GroupDesc::parse_from_bytes(&raw[start..end], desc_size).map_err(|e| {
                let block = block_locations[(group / per_block) as usize];
                parse_error_to_ffs(&e, block)
            })?;
            descs.push(desc);
        }

        let mut table = Self {
            descs,
            raw,
            block_locations,
            block_size,
            desc_size,
            per_block,
            checksummer: DescriptorChecksummer::for_superblock(sb),
            counters: FreeCounters::default(),
        };
        table.recount();
        tracing::debug!(
            target: "ffs::gdt",
            groups,
            descriptor_blocks = total,
            "group_descriptors_loaded"
        );
        Ok((table, total))
    }

    #[must_use]
    pub fn groups_count(&self) -> u32 {
        u32::try_from(self.descs.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn descriptor(&self, group: GroupNumber) -> Option<&Ext4GroupDesc> {
        self.descs.get(group.0 as usize)
    }

    #[must_use]
    pub fn raw_descriptor(&self, group: GroupNumber) -> Option<&[u8]> {
        if group.0 >= self.groups_count() {
            return None;
        }
        let (start, end) = descriptor_span(group.0, self.desc_size);
        self.raw.get(start..end)
    }

    #[must_use]
    pub fn free_counters(&self) -> FreeCounters {
        self.counters
    }

    fn recount(&mut self) {
        self.counters = self.descs.iter().fold(FreeCounters::default(), |acc, d| {
            FreeCounters {
                free_blocks: acc.free_blocks + u64::from(d.free_blocks_count),
                free_inodes: acc.free_inodes.saturating_add(d.free_inodes_count),
            }
        });
    }

    #[must_use]
    pub fn first_uninitialized_group(&self) -> Option<GroupNumber> {
        self.descs
            .iter()
            .position(|d| !d.is_inode_table_zeroed())
            .and_then(|idx| u32::try_from(idx).ok())
            .map(GroupNumber)
    }

    /// Range-check every descriptor and verify its checksum.
    ///
    /// A range violation always fails. A checksum mismatch fails a writable
    /// mount and is recorded as a warning on a read-only one.
    pub fn verify_all(&mut self, sb: &Ext4Superblock, read_only: bool) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let flex = sb.has_incompat(Ext4IncompatFeatures::FLEX_BG);
        let last_block = sb.blocks_count.saturating_sub(1);
        let itb = u64::from(sb.inode_table_blocks_per_group());
        let groups = self.groups_count();

        for group in 0..groups {
            let desc = &self.descs[group as usize];
            let desc_block = self.block_locations[(group / self.per_block) as usize];
            let first = group_first_block(
                GroupNumber(group),
                sb.blocks_per_group,
                sb.first_data_block,
            )
            .map_or(u64::MAX, |b| b.0);
            let last = if group == groups - 1 || flex {
                last_block
            } else {
                first
                    .saturating_add(u64::from(sb.blocks_per_group))
                    .saturating_sub(1)
            };
            let (lo, hi) = if flex {
                (u64::from(sb.first_data_block), last)
            } else {
                (first, last)
            };
            let out_of_range = |what: &str, block: u64| FfsError::CorruptMetadata {
                block: desc_block,
                detail: format!(
                    "group {group}: {what} {block} not in group (blocks {lo}..={hi})"
                ),
            };
            if desc.block_bitmap < lo || desc.block_bitmap > hi {
                return Err(out_of_range("block bitmap", desc.block_bitmap));
            }
            if desc.inode_bitmap < lo || desc.inode_bitmap > hi {
                return Err(out_of_range("inode bitmap", desc.inode_bitmap));
            }
            let table_end = desc.inode_table.saturating_add(itb).saturating_sub(1);
            if desc.inode_table < lo || table_end > hi {
                return Err(out_of_range("inode table", desc.inode_table));
            }

            let (start, end) = descriptor_span(group, self.desc_size);
            let mismatch = self
                .checksummer
                .verify(GroupNumber(group), &self.raw[start..end])
                .map_err(|e| parse_error_to_ffs(&e, desc_block))?;
            if let Some((computed, stored)) = mismatch {
                if !read_only {
                    return Err(FfsError::CorruptMetadata {
                        block: desc_block,
                        detail: format!(
                            "group {group}: descriptor checksum {stored:#06x}, computed {computed:#06x}"
                        ),
                    });
                }
                tracing::warn!(
                    target: "ffs::gdt",
                    group,
                    stored,
                    computed,
                    "descriptor_checksum_mismatch_read_only"
                );
                report.checksum_failures.push(group);
            }
            if report.first_uninitialized_group.is_none() && !desc.is_inode_table_zeroed() {
                report.first_uninitialized_group = Some(group);
            }
        }

        self.recount();
        report.counters = self.counters;
        Ok(report)
    }

    /// Block holding `group`'s descriptor.
    #[must_use]
    pub fn descriptor_block(&self, group: GroupNumber) -> Option<u64> {
        if group.0 >= self.groups_count() {
            return None;
        }
        self.block_locations
            .get((group.0 / self.per_block) as usize)
            .copied()
    }

    /// Groups whose stored checksum does not match today's contents.
    #[must_use]
    pub fn checksum_failures(&self) -> Vec<u32> {
        (0..self.groups_count())
            .filter(|&group| {
                let (start, end) = descriptor_span(group, self.desc_size);
                matches!(
                    self.checksummer.verify(GroupNumber(group), &self.raw[start..end]),
                    Ok(Some(_)) | Err(_)
                )
            })
            .collect()
    }

    /// Checksum of `group` as it would be stamped now.
    pub fn recompute_checksum(&self, group: GroupNumber) -> Result<u16> {
        let raw = self
            .raw_descriptor(group)
            .ok_or_else(|| FfsError::InvalidGeometry(format!("no descriptor for group {}", group.0)))?;
        self.checksummer
            .compute(group, raw)
            .map_err(|e| parse_error_to_ffs(&e, self.descriptor_block_of(group)))
    }

    fn descriptor_block_of(&self, group: GroupNumber) -> u64 {
        self.block_locations
            .get((group.0 / self.per_block) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Store a bitmap checksum in the raw descriptor. Takes effect on disk
    /// with the next [`Self::update`] of that group.
    pub fn set_bitmap_checksum(&mut self, group: GroupNumber, kind: BitmapKind, csum: u32) -> Result<()> {
        if group.0 >= self.groups_count() {
            return Err(FfsError::InvalidGeometry(format!(
                "no descriptor for group {}",
                group.0
            )));
        }
        let (start, end) = descriptor_span(group.0, self.desc_size);
        let block = self.descriptor_block_of(group);
        let raw = &mut self.raw[start..end];
        let (lo, hi) = match kind {
            BitmapKind::Block => (BLOCK_BITMAP_CSUM_LO, BLOCK_BITMAP_CSUM_HI),
            BitmapKind::Inode => (INODE_BITMAP_CSUM_LO, INODE_BITMAP_CSUM_HI),
        };
        #[allow(clippy::cast_possible_truncation)] // split into 16-bit halves
        let (lo_val, hi_val) = (csum as u16, (csum >> 16) as u16);
        write_le_u16(raw, lo, lo_val).map_err(|e| parse_error_to_ffs(&e, block))?;
        if raw.len() >= BITMAP_CSUM_HI_END {
            write_le_u16(raw, hi, hi_val).map_err(|e| parse_error_to_ffs(&e, block))?;
        }
        Ok(())
    }

    /// Apply `mutate` to one descriptor, restamp its checksum, and write the
    /// containing block.
    pub fn update<F>(&mut self, dev: &dyn BlockDevice, group: GroupNumber, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Ext4GroupDesc),
    {
        let block = self.descriptor_block_of(group);
        let (start, end) = descriptor_span(group.0, self.desc_size);
        let Some(desc) = self.descs.get_mut(group.0 as usize) else {
            return Err(FfsError::InvalidGeometry(format!(
                "no descriptor for group {}",
                group.0
            )));
        };
        mutate(desc);
        let raw = &mut self.raw[start..end];
        desc.serialize_into(raw, self.desc_size)
            .map_err(|e| parse_error_to_ffs(&e, block))?;
        desc.checksum = self
            .checksummer
            .stamp(group, raw)
            .map_err(|e| parse_error_to_ffs(&e, block))?;
        self.recount();

        let table_block = (group.0 / self.per_block) as usize;
        let span = table_block * self.block_size..(table_block + 1) * self.block_size;
        dev.write_block(BlockNumber(block), &self.raw[span])?;
        tracing::trace!(target: "ffs::gdt", group = group.0, block, "group_descriptor_written");
        Ok(())
    }
}

fn descriptor_span(group: u32, desc_size: u16) -> (usize, usize) {
    let start = group as usize * usize::from(desc_size);
    (start, start + usize::from(desc_size))
}

/// Checksum of a bitmap under `METADATA_CSUM`: crc32c over its first
/// `bits / 8` bytes, seeded with the volume seed.
#[must_use]
pub fn bitmap_checksum(seed: u32, bitmap: &[u8], bits: u32) -> u32 {
    let len = (bits as usize / 8).min(bitmap.len());
    crc32c::crc32c_append(seed, &bitmap[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChecksumStyle, ImageSpec};
    use ffs_block::{ByteBlockDevice, ByteDevice, MemoryByteDevice};
    use ffs_ondisk::GD_CHECKSUM_OFFSET;
    use std::sync::Arc;

    fn open(spec: &ImageSpec) -> (Arc<MemoryByteDevice>, Arc<dyn BlockDevice>, Ext4Superblock) {
        let image = spec.build().expect("build");
        let sb = image.superblock().clone();
        let mem = Arc::new(image.into_memory_device());
        let dev: Arc<dyn BlockDevice> = Arc::new(
            ByteBlockDevice::new(Arc::clone(&mem) as Arc<dyn ByteDevice>, sb.block_size)
                .expect("dev"),
        );
        (mem, dev, sb)
    }

    #[test]
    fn load_reads_every_descriptor_block() {
        let spec = ImageSpec {
            groups: 40,
            ..ImageSpec::default()
        };
        let (_mem, dev, sb) = open(&spec);
        let (table, read) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("load");
        assert_eq!(read, sb.descriptor_blocks());
        assert!(read > 1);
        assert_eq!(table.groups_count(), 40);
    }

    #[test]
    fn short_device_reports_blocks_read() {
        let spec = ImageSpec {
            groups: 40,
            ..ImageSpec::default()
        };
        let (mem, dev, sb) = open(&spec);
        // Second descriptor block sits at fs block 3.
        mem.fail_reads_in(3 * 1024..4 * 1024);
        let err = GroupDescTable::load(dev.as_ref(), &sb, 1).expect_err("read fails");
        assert!(err.to_string().contains("read 1 of"), "{err}");
    }

    #[test]
    fn verify_counts_and_finds_first_uninitialized() {
        let spec = ImageSpec {
            groups: 4,
            uninitialized_groups: vec![2, 3],
            ..ImageSpec::default()
        };
        let (_mem, dev, sb) = open(&spec);
        let (mut table, _) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("load");
        let report = table.verify_all(&sb, false).expect("verify");
        assert_eq!(report.first_uninitialized_group, Some(2));
        assert!(report.checksum_failures.is_empty());
        assert_eq!(report.counters.free_blocks, sb.free_blocks_count);
        assert_eq!(report.counters.free_inodes, sb.free_inodes_count);
    }

    #[test]
    fn checksum_mismatch_depends_on_writability() {
        let spec = ImageSpec {
            checksum: ChecksumStyle::MetadataCsum,
            ..ImageSpec::default()
        };
        let (mem, dev, sb) = open(&spec);
        // Flip one byte of group 0's stored checksum (descriptors at block 2).
        let offset = 2 * 1024 + GD_CHECKSUM_OFFSET;
        let mut byte = [0_u8; 1];
        mem.read_exact_at(offset as u64, &mut byte).expect("read");
        byte[0] ^= 0xFF;
        mem.write_all_at(offset as u64, &byte).expect("write");

        let (mut table, _) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("load");
        let err = table.verify_all(&sb, false).expect_err("writable fails");
        assert!(matches!(err, FfsError::CorruptMetadata { block: 2, .. }));
        let report = table.verify_all(&sb, true).expect("read-only passes");
        assert_eq!(report.checksum_failures, vec![0]);
        assert_eq!(table.checksum_failures(), vec![0]);
    }

    #[test]
    fn out_of_range_bitmap_always_fails() {
        let (_mem, dev, sb) = open(&ImageSpec {
            groups: 2,
            ..ImageSpec::default()
        });
        let (mut table, _) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("load");
        let far = sb.blocks_count + 10;
        table.descs[0].inode_bitmap = far;
        let err = table.verify_all(&sb, true).expect_err("range");
        assert!(err.to_string().contains("inode bitmap"), "{err}");
    }

    #[test]
    fn update_restamps_and_persists() {
        let spec = ImageSpec {
            checksum: ChecksumStyle::GdtCsum,
            ..ImageSpec::default()
        };
        let (_mem, dev, sb) = open(&spec);
        let (mut table, _) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("load");
        let before = table.free_counters();
        table
            .update(dev.as_ref(), GroupNumber(0), |d| d.free_inodes_count += 1)
            .expect("update");
        assert_eq!(table.free_counters().free_inodes, before.free_inodes + 1);

        let (mut reread, _) = GroupDescTable::load(dev.as_ref(), &sb, 1).expect("reload");
        reread.verify_all(&sb, false).expect("checksum still valid");
        assert_eq!(
            reread.descriptor(GroupNumber(0)).map(|d| d.free_inodes_count),
            table.descriptor(GroupNumber(0)).map(|d| d.free_inodes_count)
        );
        assert_eq!(
            reread.recompute_checksum(GroupNumber(0)).expect("csum"),
            table.descriptor(GroupNumber(0)).map_or(0, |d| d.checksum)
        );
    }
}
