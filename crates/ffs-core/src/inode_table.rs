//! Inode table and bitmap access for the mount-time paths.
//!
//! Covers what orphan cleanup and the lazy initializer need: locating and
//! checksumming on-disk inodes, clearing bitmap bits, releasing blocks, and
//! zeroing the unused tail of a group's inode table.

use crate::gdt::{BitmapKind, GroupDescTable, bitmap_checksum};
use crate::orphan::{OrphanInode, OrphanStore};
use crate::superblock::{parse_error_to_ffs, unix_now};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    Ext4Extent, Ext4ExtentIndex, Ext4Inode, Ext4Superblock, ExtentTree, clear_extent_node,
    parse_extent_tree, write_extent_index, write_extent_leaf,
};
use ffs_types::{
    BlockNumber, EXT4_BG_INODE_UNINIT, EXT4_BG_INODE_ZEROED, EXT4_GOOD_OLD_INODE_SIZE,
    EXT4_NDIR_BLOCKS, GroupNumber, InodeNumber, S_IFDIR, S_IFMT, inode_index_in_group,
    inode_to_group, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use std::collections::BTreeMap;

const INODE_GENERATION: usize = 0x64;
const INODE_CSUM_LO: usize = 0x7C;
const INODE_EXTRA_ISIZE: usize = 0x80;
const INODE_CSUM_HI: usize = 0x82;
/// `i_extra_isize` must reach this far for `i_checksum_hi` to exist.
const CSUM_HI_EXTRA_END: u16 = 4;

// ── Inode checksums ─────────────────────────────────────────────────────────

fn has_csum_hi(sb: &Ext4Superblock, raw: &[u8]) -> bool {
    sb.inode_size > EXT4_GOOD_OLD_INODE_SIZE
        && read_le_u16(raw, INODE_EXTRA_ISIZE).is_ok_and(|extra| extra >= CSUM_HI_EXTRA_END)
}

/// Volume seed extended with the inode number and generation. Seeds the
/// inode checksum and the tails of its extent blocks.
pub(crate) fn inode_csum_seed(sb: &Ext4Superblock, ino: u32, generation: u32) -> u32 {
    let seed = crc32c::crc32c_append(sb.csum_seed(), &ino.to_le_bytes());
    crc32c::crc32c_append(seed, &generation.to_le_bytes())
}

fn inode_generation(raw: &[u8]) -> Result<u32> {
    read_le_u32(raw, INODE_GENERATION).map_err(|e| parse_error_to_ffs(&e, 0))
}

/// Store the `ext4_extent_tail` checksum that follows a node block's last
/// possible entry, when metadata checksums are on.
pub(crate) fn stamp_extent_tail(
    sb: &Ext4Superblock,
    seed: u32,
    node: &mut [u8],
    block: u64,
) -> Result<()> {
    if !sb.has_metadata_csum() {
        return Ok(());
    }
    let max = read_le_u16(node, 0x04).map_err(|e| parse_error_to_ffs(&e, block))?;
    let tail = 12 + 12 * usize::from(max);
    if tail + 4 > node.len() {
        return Err(FfsError::CorruptMetadata {
            block,
            detail: format!("extent node capacity {max} leaves no room for its tail"),
        });
    }
    let csum = crc32c::crc32c_append(seed, &node[..tail]);
    write_le_u32(node, tail, csum).map_err(|e| parse_error_to_ffs(&e, block))
}

/// crc32c of one on-disk inode, seeded with the volume seed, the inode
/// number and the generation, with both checksum fields read as zero.
pub fn inode_checksum(sb: &Ext4Superblock, ino: u32, raw: &[u8]) -> Result<u32> {
    let size = usize::from(sb.inode_size).min(raw.len());
    let csum = inode_csum_seed(sb, ino, inode_generation(raw)?);

    let mut copy = raw[..size].to_vec();
    copy[INODE_CSUM_LO..INODE_CSUM_LO + 2].fill(0);
    if has_csum_hi(sb, raw) {
        copy[INODE_CSUM_HI..INODE_CSUM_HI + 2].fill(0);
    }
    Ok(crc32c::crc32c_append(csum, &copy))
}

/// Store the inode checksum into `raw` when metadata checksums are on.
pub fn stamp_inode_checksum(sb: &Ext4Superblock, ino: u32, raw: &mut [u8]) -> Result<()> {
    if !sb.has_metadata_csum() {
        return Ok(());
    }
    let csum = inode_checksum(sb, ino, raw)?;
    #[allow(clippy::cast_possible_truncation)] // split into 16-bit halves
    let (lo, hi) = (csum as u16, (csum >> 16) as u16);
    write_le_u16(raw, INODE_CSUM_LO, lo).map_err(|e| parse_error_to_ffs(&e, 0))?;
    if has_csum_hi(sb, raw) {
        write_le_u16(raw, INODE_CSUM_HI, hi).map_err(|e| parse_error_to_ffs(&e, 0))?;
    }
    Ok(())
}

fn verify_inode_checksum(sb: &Ext4Superblock, ino: u32, raw: &[u8], block: u64) -> Result<()> {
    if !sb.has_metadata_csum() {
        return Ok(());
    }
    let csum = inode_checksum(sb, ino, raw)?;
    let stored_lo = read_le_u16(raw, INODE_CSUM_LO).map_err(|e| parse_error_to_ffs(&e, block))?;
    let (stored, expected) = if has_csum_hi(sb, raw) {
        let stored_hi =
            read_le_u16(raw, INODE_CSUM_HI).map_err(|e| parse_error_to_ffs(&e, block))?;
        (u32::from(stored_lo) | (u32::from(stored_hi) << 16), csum)
    } else {
        (u32::from(stored_lo), csum & 0xFFFF)
    };
    if stored != expected {
        return Err(FfsError::CorruptMetadata {
            block,
            detail: format!("inode {ino} checksum {stored:#x}, computed {expected:#x}"),
        });
    }
    Ok(())
}

// ── Inode access ────────────────────────────────────────────────────────────

/// Block and byte offset of `ino` in its group's inode table.
pub fn inode_location(
    sb: &Ext4Superblock,
    gdt: &GroupDescTable,
    ino: u32,
) -> Result<(BlockNumber, usize)> {
    if ino == 0 || ino > sb.inodes_count {
        return Err(FfsError::Format(format!(
            "inode {ino} outside 1..={}",
            sb.inodes_count
        )));
    }
    let group = inode_to_group(InodeNumber(u64::from(ino)), sb.inodes_per_group);
    let index = u64::from(inode_index_in_group(
        InodeNumber(u64::from(ino)),
        sb.inodes_per_group,
    ));
    let desc = gdt
        .descriptor(group)
        .ok_or_else(|| FfsError::Format(format!("inode {ino} maps to missing group {}", group.0)))?;
    let byte = index * u64::from(sb.inode_size);
    let bs = u64::from(sb.block_size);
    let offset = usize::try_from(byte % bs)
        .map_err(|_| FfsError::Format("inode offset overflow".to_owned()))?;
    Ok((BlockNumber(desc.inode_table + byte / bs), offset))
}

fn read_inode_raw(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &GroupDescTable,
    ino: u32,
) -> Result<(Vec<u8>, BlockNumber)> {
    let (block, offset) = inode_location(sb, gdt, ino)?;
    let buf = dev.read_block(block)?;
    let raw = buf.as_slice()[offset..offset + usize::from(sb.inode_size)].to_vec();
    Ok((raw, block))
}

/// Read and checksum-verify one inode.
pub fn read_inode(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &GroupDescTable,
    ino: u32,
) -> Result<Ext4Inode> {
    let (raw, block) = read_inode_raw(dev, sb, gdt, ino)?;
    verify_inode_checksum(sb, ino, &raw, block.0)?;
    Ext4Inode::parse_from_bytes(&raw).map_err(|e| parse_error_to_ffs(&e, block.0))
}

/// Write the modelled fields of `inode` back, restamping its checksum.
pub fn write_inode(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &GroupDescTable,
    ino: u32,
    inode: &Ext4Inode,
) -> Result<()> {
    let (block, offset) = inode_location(sb, gdt, ino)?;
    let mut buf = dev.read_block(block)?;
    let raw = &mut buf.as_mut_slice()[offset..offset + usize::from(sb.inode_size)];
    inode
        .serialize_into(raw)
        .map_err(|e| parse_error_to_ffs(&e, block.0))?;
    stamp_inode_checksum(sb, ino, raw)?;
    dev.write_block(block, buf.as_slice())
}

// ── Bitmaps ─────────────────────────────────────────────────────────────────

fn bit_is_set(bitmap: &[u8], bit: u32) -> bool {
    bitmap
        .get((bit / 8) as usize)
        .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
}

fn clear_bit(bitmap: &mut [u8], bit: u32) -> bool {
    match bitmap.get_mut((bit / 8) as usize) {
        Some(byte) if *byte & (1 << (bit % 8)) != 0 => {
            *byte &= !(1 << (bit % 8));
            true
        }
        _ => false,
    }
}

/// Whether `ino` is marked in use in its group's inode bitmap.
pub fn inode_in_use(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &GroupDescTable,
    ino: u32,
) -> Result<bool> {
    let group = inode_to_group(InodeNumber(u64::from(ino)), sb.inodes_per_group);
    let bit = inode_index_in_group(InodeNumber(u64::from(ino)), sb.inodes_per_group);
    let desc = gdt
        .descriptor(group)
        .ok_or_else(|| FfsError::Format(format!("inode {ino} maps to missing group {}", group.0)))?;
    if desc.flags & EXT4_BG_INODE_UNINIT != 0 {
        return Ok(false);
    }
    let bitmap = dev.read_block(BlockNumber(desc.inode_bitmap))?;
    Ok(bit_is_set(bitmap.as_slice(), bit))
}

/// Clear `ino` in the inode bitmap and credit its group.
pub fn free_inode(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &mut GroupDescTable,
    ino: u32,
    is_dir: bool,
) -> Result<()> {
    let group = inode_to_group(InodeNumber(u64::from(ino)), sb.inodes_per_group);
    let bit = inode_index_in_group(InodeNumber(u64::from(ino)), sb.inodes_per_group);
    let desc = gdt
        .descriptor(group)
        .ok_or_else(|| FfsError::Format(format!("inode {ino} maps to missing group {}", group.0)))?;
    let bitmap_block = BlockNumber(desc.inode_bitmap);
    let mut bitmap = dev.read_block(bitmap_block)?;
    if !clear_bit(bitmap.as_mut_slice(), bit) {
        tracing::warn!(target: "ffs::inode", ino, "inode_bit_already_cleared");
        return Ok(());
    }
    dev.write_block(bitmap_block, bitmap.as_slice())?;
    if sb.has_metadata_csum() {
        let csum = bitmap_checksum(sb.csum_seed(), bitmap.as_slice(), sb.inodes_per_group);
        gdt.set_bitmap_checksum(group, BitmapKind::Inode, csum)?;
    }
    gdt.update(dev, group, |d| {
        d.free_inodes_count = d.free_inodes_count.saturating_add(1);
        if is_dir {
            d.used_dirs_count = d.used_dirs_count.saturating_sub(1);
        }
    })
}

/// Release `(start, len)` block runs, grouping bitmap updates per group.
/// Returns the number of blocks released.
pub fn free_block_runs(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &mut GroupDescTable,
    runs: &[(u64, u64)],
) -> Result<u64> {
    let fdb = u64::from(sb.first_data_block);
    let bpg = u64::from(sb.blocks_per_group);
    let cluster_bits = sb.log_cluster_size.saturating_sub(sb.log_block_size);

    let mut per_group: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut released = 0_u64;
    for &(start, len) in runs {
        for block in start..start.saturating_add(len) {
            if block < fdb || block >= sb.blocks_count {
                return Err(FfsError::CorruptMetadata {
                    block,
                    detail: "freeing block outside the filesystem".to_owned(),
                });
            }
            let rel = block - fdb;
            let group = u32::try_from(rel / bpg)
                .map_err(|_| FfsError::Format("group index overflow".to_owned()))?;
            let bit = u32::try_from((rel % bpg) >> cluster_bits)
                .map_err(|_| FfsError::Format("bitmap index overflow".to_owned()))?;
            let bits = per_group.entry(group).or_default();
            if bits.last() != Some(&bit) {
                bits.push(bit);
            }
            released += 1;
        }
    }

    for (group, bits) in per_group {
        let group = GroupNumber(group);
        let desc = gdt.descriptor(group).ok_or_else(|| {
            FfsError::Format(format!("block maps to missing group {}", group.0))
        })?;
        let bitmap_block = BlockNumber(desc.block_bitmap);
        let mut bitmap = dev.read_block(bitmap_block)?;
        let mut cleared = 0_u32;
        for bit in bits {
            if clear_bit(bitmap.as_mut_slice(), bit) {
                cleared += 1;
            } else {
                tracing::warn!(target: "ffs::inode", group = group.0, bit, "block_bit_already_cleared");
            }
        }
        if cleared == 0 {
            continue;
        }
        dev.write_block(bitmap_block, bitmap.as_slice())?;
        if sb.has_metadata_csum() {
            let csum = bitmap_checksum(sb.csum_seed(), bitmap.as_slice(), sb.clusters_per_group);
            gdt.set_bitmap_checksum(group, BitmapKind::Block, csum)?;
        }
        gdt.update(dev, group, |d| {
            d.free_blocks_count = d.free_blocks_count.saturating_add(cleared);
        })?;
    }
    Ok(released)
}

// ── Truncation ──────────────────────────────────────────────────────────────

const MAX_EXTENT_DEPTH: u16 = 5;
const INDIRECT_LEVELS: u32 = 3;

/// Drops every block at or past logical block `keep` from one inode's block
/// map. Index nodes and indirect blocks left mapping nothing are released
/// along with the data; partially trimmed ones are written back.
struct BlockMapTrim<'a> {
    dev: &'a dyn BlockDevice,
    sb: &'a Ext4Superblock,
    /// Per-inode seed for extent block tails.
    csum_seed: u32,
    keep: u64,
    freed: Vec<(u64, u64)>,
}

impl BlockMapTrim<'_> {
    fn run(mut self, inode: &mut Ext4Inode) -> Result<Vec<(u64, u64)>> {
        if inode.uses_extents() {
            let emptied = self.extent_node(&mut inode.block_area, 0, None)?;
            if emptied {
                clear_extent_node(&mut inode.block_area)
                    .map_err(|e| FfsError::Format(format!("extent root: {e}")))?;
            }
        } else {
            self.indirect_map(inode)?;
        }
        Ok(self.freed)
    }

    fn check_block(&self, block: u64, detail: &str) -> Result<()> {
        if block < u64::from(self.sb.first_data_block) || block >= self.sb.blocks_count {
            return Err(FfsError::CorruptMetadata {
                block,
                detail: detail.to_owned(),
            });
        }
        Ok(())
    }

    fn trim_extents(&mut self, extents: Vec<Ext4Extent>) -> Result<Vec<Ext4Extent>> {
        let mut kept = Vec::with_capacity(extents.len());
        for extent in extents {
            let start = u64::from(extent.logical_block);
            let len = u64::from(extent.actual_len());
            if start >= self.keep {
                self.freed.push((extent.physical_start, len));
            } else if start + len > self.keep {
                let keep_len = self.keep - start;
                self.freed.push((extent.physical_start + keep_len, len - keep_len));
                let keep_len = u16::try_from(keep_len)
                    .map_err(|_| FfsError::Format("extent length overflow".to_owned()))?;
                kept.push(extent.with_len(keep_len));
            } else {
                kept.push(extent);
            }
        }
        Ok(kept)
    }

    /// Trim one extent node in place; true once it maps nothing.
    fn extent_node(&mut self, node: &mut [u8], level: u16, block: Option<u64>) -> Result<bool> {
        let at = block.unwrap_or(0);
        if level > MAX_EXTENT_DEPTH {
            return Err(FfsError::CorruptMetadata {
                block: at,
                detail: "extent tree too deep".to_owned(),
            });
        }
        let (_, tree) = parse_extent_tree(node).map_err(|e| parse_error_to_ffs(&e, at))?;
        match tree {
            ExtentTree::Leaf(extents) => {
                let kept = self.trim_extents(extents)?;
                write_extent_leaf(node, &kept).map_err(|e| parse_error_to_ffs(&e, at))?;
                Ok(kept.is_empty())
            }
            ExtentTree::Index(indexes) => {
                let mut kept: Vec<Ext4ExtentIndex> = Vec::with_capacity(indexes.len());
                for (pos, index) in indexes.iter().enumerate() {
                    // The next index bounds this subtree; skip it if wholly kept.
                    let end = indexes.get(pos + 1).map(|next| u64::from(next.logical_block));
                    if end.is_some_and(|end| end <= self.keep) {
                        kept.push(*index);
                        continue;
                    }
                    let child = index.leaf_block;
                    self.check_block(child, "extent index points outside the filesystem")?;
                    let mut buf = self.dev.read_block(BlockNumber(child))?;
                    let original = buf.as_slice().to_vec();
                    if self.extent_node(buf.as_mut_slice(), level + 1, Some(child))? {
                        self.freed.push((child, 1));
                        continue;
                    }
                    if buf.as_slice() != original.as_slice() {
                        stamp_extent_tail(self.sb, self.csum_seed, buf.as_mut_slice(), child)?;
                        self.dev.write_block(BlockNumber(child), buf.as_slice())?;
                    }
                    kept.push(*index);
                }
                write_extent_index(node, &kept).map_err(|e| parse_error_to_ffs(&e, at))?;
                Ok(kept.is_empty())
            }
        }
    }

    fn indirect_map(&mut self, inode: &mut Ext4Inode) -> Result<()> {
        let to_format = |e| FfsError::Format(format!("block map: {e}"));
        let pointers = inode.block_pointers().map_err(to_format)?;
        for (idx, &ptr) in pointers.iter().take(EXT4_NDIR_BLOCKS).enumerate() {
            if ptr != 0 && idx as u64 >= self.keep {
                self.freed.push((u64::from(ptr), 1));
                inode.set_block_pointer(idx, 0).map_err(to_format)?;
            }
        }
        let per_block = u64::from(self.sb.block_size / 4);
        let mut logical = EXT4_NDIR_BLOCKS as u64;
        for level in 0..INDIRECT_LEVELS {
            let idx = EXT4_NDIR_BLOCKS + level as usize;
            let span = per_block.saturating_pow(level + 1);
            let root = u64::from(pointers[idx]);
            if root != 0
                && logical.saturating_add(span) > self.keep
                && self.indirect_block(root, level, logical, per_block)?
            {
                self.freed.push((root, 1));
                inode.set_block_pointer(idx, 0).map_err(to_format)?;
            }
            logical = logical.saturating_add(span);
        }
        Ok(())
    }

    /// Trim one indirect block; true once it maps nothing. `level` 0 points
    /// at data blocks.
    fn indirect_block(&mut self, block: u64, level: u32, base: u64, per_block: u64) -> Result<bool> {
        self.check_block(block, "indirect pointer outside the filesystem")?;
        let mut buf = self.dev.read_block(BlockNumber(block))?;
        let child_span = per_block.saturating_pow(level);
        let mut changed = false;
        let mut live = false;
        for slot in 0..per_block {
            let offset = usize::try_from(slot * 4)
                .map_err(|_| FfsError::Format("indirect slot overflow".to_owned()))?;
            let ptr = read_le_u32(buf.as_slice(), offset).map_err(|e| parse_error_to_ffs(&e, block))?;
            if ptr == 0 {
                continue;
            }
            let logical = base.saturating_add(slot.saturating_mul(child_span));
            let release = if logical.saturating_add(child_span) <= self.keep {
                false
            } else if level == 0 {
                true
            } else {
                self.indirect_block(u64::from(ptr), level - 1, logical, per_block)?
            };
            if release {
                self.freed.push((u64::from(ptr), 1));
                write_le_u32(buf.as_mut_slice(), offset, 0)
                    .map_err(|e| parse_error_to_ffs(&e, block))?;
                changed = true;
            } else {
                live = true;
            }
        }
        if live && changed {
            self.dev.write_block(BlockNumber(block), buf.as_slice())?;
        }
        Ok(!live)
    }
}

/// Sectors charged to `i_blocks` per filesystem block.
fn sectors_per_block(sb: &Ext4Superblock) -> u64 {
    u64::from(sb.block_size / 512)
}

/// [`OrphanStore`] over the real inode table and bitmaps.
pub struct InodeTableStore<'a> {
    dev: &'a dyn BlockDevice,
    sb: &'a Ext4Superblock,
    gdt: &'a mut GroupDescTable,
}

impl std::fmt::Debug for InodeTableStore<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTableStore")
            .field("groups", &self.gdt.groups_count())
            .finish_non_exhaustive()
    }
}

impl<'a> InodeTableStore<'a> {
    pub fn new(dev: &'a dyn BlockDevice, sb: &'a Ext4Superblock, gdt: &'a mut GroupDescTable) -> Self {
        Self { dev, sb, gdt }
    }

    fn release_to(&mut self, ino: u32, new_size: u64) -> Result<Ext4Inode> {
        let (raw, block) = read_inode_raw(self.dev, self.sb, self.gdt, ino)?;
        verify_inode_checksum(self.sb, ino, &raw, block.0)?;
        let mut inode =
            Ext4Inode::parse_from_bytes(&raw).map_err(|e| parse_error_to_ffs(&e, block.0))?;
        let trim = BlockMapTrim {
            dev: self.dev,
            sb: self.sb,
            csum_seed: inode_csum_seed(self.sb, ino, inode_generation(&raw)?),
            keep: new_size.div_ceil(u64::from(self.sb.block_size)),
            freed: Vec::new(),
        };
        let freed = if inode.maps_blocks() {
            trim.run(&mut inode)?
        } else {
            Vec::new()
        };
        let released = free_block_runs(self.dev, self.sb, self.gdt, &freed)?;
        inode.blocks = inode
            .blocks
            .saturating_sub(released * sectors_per_block(self.sb));
        inode.size = new_size;
        Ok(inode)
    }
}

impl OrphanStore for InodeTableStore<'_> {
    fn resolve(&mut self, ino: u32) -> Result<OrphanInode> {
        if ino < self.sb.first_ino {
            return Err(FfsError::Format(format!("reserved inode {ino} on orphan chain")));
        }
        if !inode_in_use(self.dev, self.sb, self.gdt, ino)? {
            return Err(FfsError::Format(format!("orphan inode {ino} is not in use")));
        }
        let inode = read_inode(self.dev, self.sb, self.gdt, ino)?;
        Ok(OrphanInode {
            ino,
            links_count: inode.links_count,
            size: inode.size,
            next: inode.dtime,
        })
    }

    fn truncate(&mut self, orphan: &OrphanInode) -> Result<()> {
        let mut inode = self.release_to(orphan.ino, orphan.size)?;
        inode.dtime = 0;
        write_inode(self.dev, self.sb, self.gdt, orphan.ino, &inode)
    }

    fn delete(&mut self, orphan: &OrphanInode) -> Result<()> {
        let mut inode = self.release_to(orphan.ino, 0)?;
        inode.dtime = unix_now();
        inode.links_count = 0;
        write_inode(self.dev, self.sb, self.gdt, orphan.ino, &inode)?;
        let is_dir = inode.mode & S_IFMT == S_IFDIR;
        free_inode(self.dev, self.sb, self.gdt, orphan.ino, is_dir)
    }
}

// ── Inode table zeroing ─────────────────────────────────────────────────────

/// Zero the never-used tail of `group`'s inode table and mark it zeroed.
///
/// Blocks that may hold live inodes (below `inodes_per_group -
/// itable_unused`) are left alone. `barrier` issues a device flush before
/// the descriptor is updated.
pub fn zero_inode_table_tail(
    dev: &dyn BlockDevice,
    sb: &Ext4Superblock,
    gdt: &mut GroupDescTable,
    group: GroupNumber,
    barrier: bool,
) -> Result<()> {
    let desc = gdt
        .descriptor(group)
        .ok_or_else(|| FfsError::Format(format!("no descriptor for group {}", group.0)))?
        .clone();
    if desc.flags & EXT4_BG_INODE_ZEROED != 0 {
        return Ok(());
    }
    let itb = sb.inode_table_blocks_per_group();
    let used_inodes = sb.inodes_per_group.saturating_sub(desc.itable_unused);
    let used_blks = if desc.flags & EXT4_BG_INODE_UNINIT == 0 {
        used_inodes.div_ceil(sb.inodes_per_block().max(1))
    } else {
        0
    };
    if used_blks > itb || (group.0 == 0 && used_inodes < sb.first_ino) {
        return Err(FfsError::CorruptMetadata {
            block: desc.inode_table,
            detail: format!(
                "something is wrong with group {}: used itable blocks {used_blks}, itable unused count {}",
                group.0, desc.itable_unused
            ),
        });
    }

    let mut zeros = Vec::new();
    zeros
        .try_reserve_exact(dev.block_size() as usize)
        .map_err(|_| FfsError::OutOfMemory)?;
    zeros.resize(dev.block_size() as usize, 0_u8);
    let first = desc.inode_table + u64::from(used_blks);
    let count = u64::from(itb - used_blks);
    for block in first..first + count {
        dev.write_block(BlockNumber(block), &zeros)?;
    }
    if barrier {
        dev.sync()?;
    }
    gdt.update(dev, group, |d| d.flags |= EXT4_BG_INODE_ZEROED)?;
    tracing::debug!(
        target: "ffs::lazy_init",
        group = group.0,
        first_block = first,
        blocks = count,
        "inode_table_zeroed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BlockMapping, ChecksumStyle, ImageSpec, OrphanSpec};
    use ffs_block::{ByteBlockDevice, ByteDevice};
    use std::sync::Arc;

    struct Fixture {
        dev: Arc<dyn BlockDevice>,
        sb: Ext4Superblock,
        gdt: GroupDescTable,
    }

    fn fixture(spec: &ImageSpec) -> Fixture {
        let image = spec.build().expect("build");
        let sb = image.superblock().clone();
        let mem: Arc<dyn ByteDevice> = Arc::new(image.into_memory_device());
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(mem, sb.block_size).expect("dev"));
        let sb_block = 1024 / u64::from(sb.block_size);
        let (gdt, _) = GroupDescTable::load(dev.as_ref(), &sb, sb_block).expect("gdt");
        Fixture { dev, sb, gdt }
    }

    #[test]
    fn metadata_csum_inodes_verify_and_restamp() {
        let spec = ImageSpec {
            checksum: ChecksumStyle::MetadataCsum,
            inode_size: 256,
            orphans: vec![OrphanSpec::linked(12, 1024, 3)],
            ..ImageSpec::default()
        };
        let fx = fixture(&spec);
        let mut inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        inode.links_count = 5;
        write_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12, &inode).expect("write");
        let again = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("reread");
        assert_eq!(again.links_count, 5);
    }

    #[test]
    fn corrupted_inode_checksum_is_detected() {
        let spec = ImageSpec {
            checksum: ChecksumStyle::MetadataCsum,
            orphans: vec![OrphanSpec::unlinked(12, 1)],
            ..ImageSpec::default()
        };
        let fx = fixture(&spec);
        let (block, offset) = inode_location(&fx.sb, &fx.gdt, 12).expect("loc");
        let mut buf = fx.dev.read_block(block).expect("read");
        buf.as_mut_slice()[offset + 0x1A] ^= 0x01;
        fx.dev.write_block(block, buf.as_slice()).expect("write");
        assert!(matches!(
            read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12),
            Err(FfsError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn truncate_trims_extent_and_credits_group() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::linked(12, 1024, 4)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let before = fx.gdt.free_counters().free_blocks;
        let mut store = InodeTableStore::new(fx.dev.as_ref(), &fx.sb, &mut fx.gdt);
        let orphan = store.resolve(12).expect("resolve");
        store.truncate(&orphan).expect("truncate");
        drop(store);
        assert_eq!(fx.gdt.free_counters().free_blocks, before + 3);
        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        assert_eq!(inode.dtime, 0);
        assert_eq!(inode.blocks, 2);
    }

    #[test]
    fn delete_releases_inode_and_blocks() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(13, 2)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let before = fx.gdt.free_counters();
        let mut store = InodeTableStore::new(fx.dev.as_ref(), &fx.sb, &mut fx.gdt);
        let orphan = store.resolve(13).expect("resolve");
        store.delete(&orphan).expect("delete");
        drop(store);
        let after = fx.gdt.free_counters();
        assert_eq!(after.free_blocks, before.free_blocks + 2);
        assert_eq!(after.free_inodes, before.free_inodes + 1);
        assert!(!inode_in_use(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13).expect("bitmap"));
    }

    #[test]
    fn unused_inode_does_not_resolve() {
        let mut fx = fixture(&ImageSpec::default());
        let mut store = InodeTableStore::new(fx.dev.as_ref(), &fx.sb, &mut fx.gdt);
        assert!(store.resolve(20).is_err());
        assert!(store.resolve(3).is_err());
    }

    fn truncate_orphan(fx: &mut Fixture, ino: u32) {
        let mut store = InodeTableStore::new(fx.dev.as_ref(), &fx.sb, &mut fx.gdt);
        let orphan = store.resolve(ino).expect("resolve");
        if orphan.links_count == 0 {
            store.delete(&orphan).expect("delete");
        } else {
            store.truncate(&orphan).expect("truncate");
        }
    }

    #[test]
    fn direct_map_truncate_clears_tail_pointers() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::linked(12, 2048, 4).mapped(BlockMapping::Indirect)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let before = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        let first = before.block_pointers().expect("pointers")[0];
        truncate_orphan(&mut fx, 12);
        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        let pointers = inode.block_pointers().expect("pointers");
        assert_eq!(&pointers[..4], &[first, first + 1, 0, 0]);
        assert_eq!(inode.blocks, 4);
    }

    #[test]
    fn indirect_truncate_rewrites_partially_kept_block() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::linked(12, 13 * 1024, 20).mapped(BlockMapping::Indirect)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let free_before = fx.gdt.free_counters().free_blocks;
        truncate_orphan(&mut fx, 12);
        assert_eq!(fx.gdt.free_counters().free_blocks, free_before + 7);

        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        assert_eq!(inode.blocks, 14 * 2);
        let pointers = inode.block_pointers().expect("pointers");
        assert!(pointers[..EXT4_NDIR_BLOCKS].iter().all(|&p| p != 0));
        let ind = fx
            .dev
            .read_block(BlockNumber(u64::from(pointers[EXT4_NDIR_BLOCKS])))
            .expect("indirect block");
        assert_ne!(read_le_u32(ind.as_slice(), 0).expect("slot 0"), 0);
        assert!(ind.as_slice()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn indirect_delete_releases_the_indirect_block() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(13, 20).mapped(BlockMapping::Indirect)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let free_before = fx.gdt.free_counters().free_blocks;
        truncate_orphan(&mut fx, 13);
        assert_eq!(fx.gdt.free_counters().free_blocks, free_before + 21);
        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13).expect("read");
        assert!(inode.block_pointers().expect("pointers").iter().all(|&p| p == 0));
        assert_eq!(inode.blocks, 0);
    }

    #[test]
    fn indexed_extent_truncate_rewrites_leaf_and_its_tail() {
        let spec = ImageSpec {
            checksum: ChecksumStyle::MetadataCsum,
            orphans: vec![OrphanSpec::linked(12, 2048, 5).mapped(BlockMapping::ExtentIndexed)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let free_before = fx.gdt.free_counters().free_blocks;
        truncate_orphan(&mut fx, 12);
        assert_eq!(fx.gdt.free_counters().free_blocks, free_before + 3);

        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 12).expect("read");
        assert_eq!(inode.blocks, 3 * 2);
        let (header, ExtentTree::Index(indexes)) =
            parse_extent_tree(&inode.block_area).expect("root")
        else {
            panic!("root should still index the leaf");
        };
        assert_eq!((header.depth, indexes.len()), (1, 1));

        let leaf = fx
            .dev
            .read_block(BlockNumber(indexes[0].leaf_block))
            .expect("leaf");
        let (leaf_header, tree) = parse_extent_tree(leaf.as_slice()).expect("leaf");
        let ExtentTree::Leaf(extents) = tree else {
            panic!("depth-1 child should be a leaf");
        };
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].actual_len(), 2);

        let tail = 12 + 12 * usize::from(leaf_header.max_entries);
        let expected = crc32c::crc32c_append(
            inode_csum_seed(&fx.sb, 12, 0),
            &leaf.as_slice()[..tail],
        );
        assert_eq!(read_le_u32(leaf.as_slice(), tail).expect("tail"), expected);
    }

    #[test]
    fn indexed_extent_delete_collapses_root_to_empty_leaf() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(13, 5).mapped(BlockMapping::ExtentIndexed)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let free_before = fx.gdt.free_counters().free_blocks;
        truncate_orphan(&mut fx, 13);
        assert_eq!(fx.gdt.free_counters().free_blocks, free_before + 6);
        let inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13).expect("read");
        let (header, tree) = parse_extent_tree(&inode.block_area).expect("root");
        assert_eq!(header.depth, 0);
        assert_eq!(tree, ExtentTree::Leaf(Vec::new()));
    }

    #[test]
    fn fast_symlink_delete_leaves_block_bitmap_alone() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(13, 0)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let mut inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13).expect("read");
        inode.mode = ffs_types::S_IFLNK | 0o777;
        inode.flags = 0;
        inode.blocks = 0;
        inode.block_area = [0xEE; 60];
        write_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13, &inode).expect("write");

        let before = fx.gdt.free_counters();
        truncate_orphan(&mut fx, 13);
        let after = fx.gdt.free_counters();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_inodes, before.free_inodes + 1);
    }

    #[test]
    fn index_pointing_outside_the_volume_is_corrupt() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(13, 2).mapped(BlockMapping::ExtentIndexed)],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let mut inode = read_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13).expect("read");
        let bogus = Ext4ExtentIndex {
            logical_block: 0,
            leaf_block: fx.sb.blocks_count + 10,
        };
        write_extent_index(&mut inode.block_area, &[bogus]).expect("index");
        write_inode(fx.dev.as_ref(), &fx.sb, &fx.gdt, 13, &inode).expect("write");

        let mut store = InodeTableStore::new(fx.dev.as_ref(), &fx.sb, &mut fx.gdt);
        let orphan = store.resolve(13).expect("resolve");
        assert!(matches!(
            store.delete(&orphan),
            Err(FfsError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn zeroing_skips_used_blocks_and_sets_flag() {
        let spec = ImageSpec {
            groups: 2,
            uninitialized_groups: vec![1],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let desc = fx.gdt.descriptor(GroupNumber(1)).expect("desc").clone();
        // Scribble on the last inode table block; it must come back zeroed.
        let itb = u64::from(fx.sb.inode_table_blocks_per_group());
        let last = BlockNumber(desc.inode_table + itb - 1);
        fx.dev
            .write_block(last, &vec![0xAB; fx.sb.block_size as usize])
            .expect("scribble");
        zero_inode_table_tail(fx.dev.as_ref(), &fx.sb, &mut fx.gdt, GroupNumber(1), true)
            .expect("zero");
        assert!(fx.dev.read_block(last).expect("read").as_slice().iter().all(|&b| b == 0));
        assert!(fx
            .gdt
            .descriptor(GroupNumber(1))
            .is_some_and(|d| d.is_inode_table_zeroed()));
        assert_eq!(fx.gdt.first_uninitialized_group(), None);
    }

    #[test]
    fn zeroing_rejects_impossible_unused_count() {
        let spec = ImageSpec {
            uninitialized_groups: vec![0],
            ..ImageSpec::default()
        };
        let mut fx = fixture(&spec);
        let ipg = fx.sb.inodes_per_group;
        fx.gdt
            .update(fx.dev.as_ref(), GroupNumber(0), |d| d.itable_unused = ipg)
            .expect("update");
        let err = zero_inode_table_tail(fx.dev.as_ref(), &fx.sb, &mut fx.gdt, GroupNumber(0), false)
            .expect_err("group 0 must keep reserved inodes");
        assert!(err.to_string().contains("something is wrong with group 0"));
    }
}
