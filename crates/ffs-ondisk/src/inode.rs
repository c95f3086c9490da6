//! The slice of the ext4 inode this subsystem needs: link count, size, the
//! `i_dtime` field (which doubles as the orphan-chain link), flags, and the
//! 60-byte `i_block` area holding either an extent tree root or the classic
//! direct/indirect block map.

use ffs_types::{
    EXT4_EXT_MAGIC, EXT4_EXTENTS_FL, EXT4_INLINE_DATA_FL, EXT4_NDIR_BLOCKS, ParseError, S_IFDIR,
    S_IFLNK, S_IFMT, S_IFREG, read_fixed, read_le_u16, read_le_u32, write_bytes, write_le_u16,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

const EXT_INIT_MAX_LEN: u16 = 1_u16 << 15;
const I_BLOCK_OFFSET: usize = 0x28;
const I_BLOCK_LEN: usize = 60;
const GOOD_OLD_INODE_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4Inode {
    pub mode: u16,
    pub size: u64,
    pub links_count: u16,
    /// Deletion time, or the next inode number while on the orphan chain.
    pub dtime: u32,
    pub flags: u32,
    /// `i_blocks` in 512-byte units (lo 32 bits + 16-bit hi).
    pub blocks: u64,
    pub block_area: [u8; I_BLOCK_LEN],
}

impl Ext4Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < GOOD_OLD_INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GOOD_OLD_INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = u64::from(read_le_u32(bytes, 0x6C)?);
        let blocks_lo = u64::from(read_le_u32(bytes, 0x1C)?);
        let blocks_hi = u64::from(read_le_u16(bytes, 0x74)?);
        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            size: size_lo | (size_hi << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            dtime: read_le_u32(bytes, 0x14)?,
            flags: read_le_u32(bytes, 0x20)?,
            blocks: blocks_lo | (blocks_hi << 32),
            block_area: read_fixed::<I_BLOCK_LEN>(bytes, I_BLOCK_OFFSET)?,
        })
    }

    /// Write the modelled fields back, leaving timestamps, ownership, and
    /// extended fields untouched.
    #[allow(clippy::cast_possible_truncation)] // lo/hi halves are split explicitly
    pub fn serialize_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < GOOD_OLD_INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GOOD_OLD_INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u32(bytes, 0x04, self.size as u32)?;
        write_le_u32(bytes, 0x6C, (self.size >> 32) as u32)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks as u32)?;
        write_le_u16(bytes, 0x74, (self.blocks >> 32) as u16)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        write_bytes(bytes, I_BLOCK_OFFSET, &self.block_area)
    }

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        self.flags & EXT4_EXTENTS_FL != 0
    }

    #[must_use]
    pub fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    /// Whether `i_block` holds a block map at all. Fast symlinks, inline
    /// data and device nodes keep other bytes there.
    #[must_use]
    pub fn maps_blocks(&self) -> bool {
        if self.flags & EXT4_INLINE_DATA_FL != 0 {
            return false;
        }
        match self.file_type() {
            S_IFREG | S_IFDIR => true,
            S_IFLNK => self.blocks != 0,
            _ => false,
        }
    }

    /// The twelve direct pointers plus the three indirect roots.
    pub fn block_pointers(&self) -> Result<[u32; 15], ParseError> {
        let mut out = [0_u32; 15];
        for (idx, slot) in out.iter_mut().enumerate() {
            *slot = read_le_u32(&self.block_area, idx * 4)?;
        }
        Ok(out)
    }

    pub fn set_block_pointer(&mut self, idx: usize, value: u32) -> Result<(), ParseError> {
        write_le_u32(&mut self.block_area, idx * 4, value)
    }
}

// ── Extent tree ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Ext4Extent {
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    /// Replace the length, preserving the unwritten marker.
    #[must_use]
    pub fn with_len(self, len: u16) -> Self {
        let raw_len = if self.is_unwritten() {
            len + EXT_INIT_MAX_LEN
        } else {
            len
        };
        Self { raw_len, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentIndex {
    pub logical_block: u32,
    pub leaf_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentTree {
    Leaf(Vec<Ext4Extent>),
    Index(Vec<Ext4ExtentIndex>),
}

pub fn parse_extent_tree(bytes: &[u8]) -> Result<(Ext4ExtentHeader, ExtentTree), ParseError> {
    let header = Ext4ExtentHeader {
        magic: read_le_u16(bytes, 0x00)?,
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
        generation: read_le_u32(bytes, 0x08)?,
    };

    if header.magic != EXT4_EXT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT4_EXT_MAGIC),
            actual: u64::from(header.magic),
        });
    }
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }

    let entries_len = usize::from(header.entries);
    if header.depth == 0 {
        let mut extents = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = 12 + idx * 12;
            let start_hi = u64::from(read_le_u16(bytes, base + 6)?);
            let start_lo = u64::from(read_le_u32(bytes, base + 8)?);
            extents.push(Ext4Extent {
                logical_block: read_le_u32(bytes, base)?,
                raw_len: read_le_u16(bytes, base + 4)?,
                physical_start: start_lo | (start_hi << 32),
            });
        }
        Ok((header, ExtentTree::Leaf(extents)))
    } else {
        let mut indexes = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = 12 + idx * 12;
            let leaf_lo = u64::from(read_le_u32(bytes, base + 4)?);
            let leaf_hi = u64::from(read_le_u16(bytes, base + 8)?);
            indexes.push(Ext4ExtentIndex {
                logical_block: read_le_u32(bytes, base)?,
                leaf_block: leaf_lo | (leaf_hi << 32),
            });
        }
        Ok((header, ExtentTree::Index(indexes)))
    }
}

/// Rewrite a leaf node in place with `extents`, updating `eh_entries`.
#[allow(clippy::cast_possible_truncation)] // physical starts are 48-bit on disk
pub fn write_extent_leaf(bytes: &mut [u8], extents: &[Ext4Extent]) -> Result<(), ParseError> {
    let (header, _) = parse_extent_tree(bytes)?;
    if header.depth != 0 {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "not a leaf node",
        });
    }
    let count = u16::try_from(extents.len()).map_err(|_| ParseError::IntegerConversion {
        field: "eh_entries",
    })?;
    if count > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    write_le_u16(bytes, 0x02, count)?;
    for (idx, extent) in extents.iter().enumerate() {
        let base = 12 + idx * 12;
        write_le_u32(bytes, base, extent.logical_block)?;
        write_le_u16(bytes, base + 4, extent.raw_len)?;
        write_le_u16(bytes, base + 6, (extent.physical_start >> 32) as u16)?;
        write_le_u32(bytes, base + 8, extent.physical_start as u32)?;
    }
    Ok(())
}

/// Rewrite an index node in place with `indexes`, updating `eh_entries`.
#[allow(clippy::cast_possible_truncation)] // leaf pointers are 48-bit on disk
pub fn write_extent_index(
    bytes: &mut [u8],
    indexes: &[Ext4ExtentIndex],
) -> Result<(), ParseError> {
    let (header, _) = parse_extent_tree(bytes)?;
    if header.depth == 0 {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "not an index node",
        });
    }
    let count = u16::try_from(indexes.len()).map_err(|_| ParseError::IntegerConversion {
        field: "eh_entries",
    })?;
    if count > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    write_le_u16(bytes, 0x02, count)?;
    for (idx, index) in indexes.iter().enumerate() {
        let base = 12 + idx * 12;
        write_le_u32(bytes, base, index.logical_block)?;
        write_le_u32(bytes, base + 4, index.leaf_block as u32)?;
        write_le_u16(bytes, base + 8, (index.leaf_block >> 32) as u16)?;
        write_le_u16(bytes, base + 10, 0)?;
    }
    Ok(())
}

/// Turn any node into an empty leaf, keeping its magic and capacity.
pub fn clear_extent_node(bytes: &mut [u8]) -> Result<(), ParseError> {
    parse_extent_tree(bytes)?;
    write_le_u16(bytes, 0x02, 0)?;
    write_le_u16(bytes, 0x06, 0)
}

/// Resolve every physical run an inode maps, walking index nodes and
/// indirect blocks through `read_block`.
///
/// Returns `(logical_start, physical_start, len)` triples ordered by logical
/// block. `max_logical` bounds the indirect walk to the file's block count.
pub fn collect_block_runs<F>(
    inode: &Ext4Inode,
    block_size: u32,
    max_logical: u64,
    mut read_block: F,
) -> Result<Vec<(u64, u64, u64)>, ParseError>
where
    F: FnMut(u64) -> Result<Vec<u8>, ParseError>,
{
    let mut runs = Vec::new();
    if inode.uses_extents() {
        collect_extent_runs(&inode.block_area, &mut read_block, &mut runs, 0)?;
    } else {
        collect_indirect_runs(inode, block_size, max_logical, &mut read_block, &mut runs)?;
    }
    runs.sort_unstable_by_key(|run| run.0);
    Ok(runs)
}

const MAX_EXTENT_DEPTH: u16 = 5;

fn collect_extent_runs<F>(
    node: &[u8],
    read_block: &mut F,
    runs: &mut Vec<(u64, u64, u64)>,
    level: u16,
) -> Result<(), ParseError>
where
    F: FnMut(u64) -> Result<Vec<u8>, ParseError>,
{
    if level > MAX_EXTENT_DEPTH {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "extent tree too deep",
        });
    }
    match parse_extent_tree(node)?.1 {
        ExtentTree::Leaf(extents) => {
            runs.extend(extents.iter().map(|e| {
                (
                    u64::from(e.logical_block),
                    e.physical_start,
                    u64::from(e.actual_len()),
                )
            }));
        }
        ExtentTree::Index(indexes) => {
            for index in indexes {
                let child = read_block(index.leaf_block)?;
                collect_extent_runs(&child, read_block, runs, level + 1)?;
            }
        }
    }
    Ok(())
}

fn collect_indirect_runs<F>(
    inode: &Ext4Inode,
    block_size: u32,
    max_logical: u64,
    read_block: &mut F,
    runs: &mut Vec<(u64, u64, u64)>,
) -> Result<(), ParseError>
where
    F: FnMut(u64) -> Result<Vec<u8>, ParseError>,
{
    let pointers = inode.block_pointers()?;
    let per_block = u64::from(block_size / 4);
    for (idx, &ptr) in pointers.iter().take(EXT4_NDIR_BLOCKS).enumerate() {
        if ptr != 0 && (idx as u64) < max_logical {
            runs.push((idx as u64, u64::from(ptr), 1));
        }
    }
    let mut logical = EXT4_NDIR_BLOCKS as u64;
    for (depth, &root) in pointers[EXT4_NDIR_BLOCKS..].iter().enumerate() {
        let span = per_block.saturating_pow(u32::try_from(depth + 1).unwrap_or(u32::MAX));
        if root != 0 && logical < max_logical {
            walk_indirect(u64::from(root), depth, logical, per_block, max_logical, read_block, runs)?;
        }
        logical = logical.saturating_add(span);
    }
    Ok(())
}

fn walk_indirect<F>(
    block: u64,
    depth: usize,
    logical_base: u64,
    per_block: u64,
    max_logical: u64,
    read_block: &mut F,
    runs: &mut Vec<(u64, u64, u64)>,
) -> Result<(), ParseError>
where
    F: FnMut(u64) -> Result<Vec<u8>, ParseError>,
{
    let data = read_block(block)?;
    let child_span = per_block.saturating_pow(u32::try_from(depth).unwrap_or(u32::MAX));
    for slot in 0..per_block {
        let logical = logical_base.saturating_add(slot.saturating_mul(child_span));
        if logical >= max_logical {
            break;
        }
        let offset = usize::try_from(slot * 4).map_err(|_| ParseError::IntegerConversion {
            field: "indirect_slot",
        })?;
        let ptr = u64::from(read_le_u32(&data, offset)?);
        if ptr == 0 {
            continue;
        }
        if depth == 0 {
            runs.push((logical, ptr, 1));
        } else {
            walk_indirect(ptr, depth - 1, logical, per_block, max_logical, read_block, runs)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn extent_root(extents: &[(u32, u16, u64)], max: u16) -> [u8; 60] {
        let mut area = [0_u8; 60];
        area[0..2].copy_from_slice(&EXT4_EXT_MAGIC.to_le_bytes());
        area[4..6].copy_from_slice(&max.to_le_bytes());
        let list: Vec<Ext4Extent> = extents
            .iter()
            .map(|&(logical_block, raw_len, physical_start)| Ext4Extent {
                logical_block,
                raw_len,
                physical_start,
            })
            .collect();
        write_extent_leaf(&mut area, &list).expect("leaf");
        area
    }

    #[test]
    fn inode_field_round_trip_preserves_other_bytes() {
        let mut raw = vec![0_u8; 256];
        raw[0x08] = 0x77; // atime, unmodelled
        let mut inode = Ext4Inode::parse_from_bytes(&raw).expect("parse");
        inode.links_count = 0;
        inode.dtime = 15;
        inode.size = 0x1_0000_0400;
        inode.serialize_into(&mut raw).expect("serialize");
        assert_eq!(raw[0x08], 0x77);
        assert_eq!(Ext4Inode::parse_from_bytes(&raw).expect("reparse"), inode);
    }

    #[test]
    fn extent_leaf_rewrite_updates_entries() {
        let mut area = extent_root(&[(0, 4, 100), (4, 2, 200)], 4);
        let (header, tree) = parse_extent_tree(&area).expect("parse");
        assert_eq!(header.entries, 2);
        assert!(matches!(tree, ExtentTree::Leaf(ref v) if v.len() == 2));

        write_extent_leaf(&mut area, &[Ext4Extent { logical_block: 0, raw_len: 1, physical_start: 100 }])
            .expect("rewrite");
        let (header, _) = parse_extent_tree(&area).expect("parse");
        assert_eq!(header.entries, 1);
    }

    #[test]
    fn index_rewrite_then_clear_to_empty_leaf() {
        let mut area = [0_u8; 60];
        area[0..2].copy_from_slice(&EXT4_EXT_MAGIC.to_le_bytes());
        area[4..6].copy_from_slice(&4_u16.to_le_bytes());
        area[6..8].copy_from_slice(&1_u16.to_le_bytes());
        let indexes = [
            Ext4ExtentIndex { logical_block: 0, leaf_block: 0x1_0000_0010 },
            Ext4ExtentIndex { logical_block: 40, leaf_block: 77 },
        ];
        write_extent_index(&mut area, &indexes).expect("index");
        let (header, tree) = parse_extent_tree(&area).expect("parse");
        assert_eq!(header.depth, 1);
        assert_eq!(tree, ExtentTree::Index(indexes.to_vec()));
        assert!(write_extent_leaf(&mut area, &[]).is_err());

        clear_extent_node(&mut area).expect("clear");
        let (header, tree) = parse_extent_tree(&area).expect("parse");
        assert_eq!((header.depth, header.entries, header.max_entries), (0, 0, 4));
        assert_eq!(tree, ExtentTree::Leaf(Vec::new()));
    }

    #[test]
    fn unwritten_extent_length() {
        let extent = Ext4Extent {
            logical_block: 0,
            raw_len: EXT_INIT_MAX_LEN + 5,
            physical_start: 1,
        };
        assert!(extent.is_unwritten());
        assert_eq!(extent.actual_len(), 5);
        assert_eq!(extent.with_len(2).raw_len, EXT_INIT_MAX_LEN + 2);
    }

    #[test]
    fn collect_runs_from_extents() {
        let mut raw = vec![0_u8; 128];
        raw[0x20..0x24].copy_from_slice(&EXT4_EXTENTS_FL.to_le_bytes());
        raw[0x28..0x28 + 60].copy_from_slice(&extent_root(&[(3, 2, 50), (0, 1, 40)], 4));
        let inode = Ext4Inode::parse_from_bytes(&raw).expect("parse");
        let runs = collect_block_runs(&inode, 1024, 10, |_| unreachable!("no index nodes"))
            .expect("runs");
        assert_eq!(runs, vec![(0, 40, 1), (3, 50, 2)]);
    }

    #[test]
    fn collect_runs_through_single_indirect() {
        let mut raw = vec![0_u8; 128];
        raw[0x28..0x2C].copy_from_slice(&10_u32.to_le_bytes()); // block 0 → 10
        raw[0x28 + 12 * 4..0x28 + 12 * 4 + 4].copy_from_slice(&20_u32.to_le_bytes()); // IND → 20
        let inode = Ext4Inode::parse_from_bytes(&raw).expect("parse");

        let mut blocks = HashMap::new();
        let mut ind = vec![0_u8; 1024];
        ind[0..4].copy_from_slice(&30_u32.to_le_bytes());
        ind[4..8].copy_from_slice(&31_u32.to_le_bytes());
        blocks.insert(20_u64, ind);

        let runs = collect_block_runs(&inode, 1024, 14, |b| {
            blocks.get(&b).cloned().ok_or(ParseError::InvalidField {
                field: "block",
                reason: "missing",
            })
        })
        .expect("runs");
        assert_eq!(runs, vec![(0, 10, 1), (12, 30, 1), (13, 31, 1)]);
    }
}
