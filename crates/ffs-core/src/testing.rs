//! Small synthetic ext4 images for tests and tooling.
//!
//! [`ImageSpec`] describes a volume; [`ImageSpec::build`] lays it out in
//! memory with valid descriptors, bitmaps, checksums, an optional JBD2
//! journal on inode 8, and an optional orphan chain.
//!
//! Every group has the same shape:
//!
//! ```text
//! [sb][descriptor blocks][block bitmap][inode bitmap][inode table][data...]
//! ```
//!
//! Only group 0 carries a real superblock and descriptor table; the same
//! blocks are reserved in the other groups. Data for the journal and orphan
//! inodes is allocated from group 0.

use crate::inode_table::{inode_csum_seed, stamp_extent_tail, stamp_inode_checksum};
use crate::superblock::parse_error_to_ffs;
use ffs_block::MemoryByteDevice;
use ffs_error::{FfsError, Result};
use ffs_ondisk::jbd2::{
    JBD2_COMMIT_BLOCK, JBD2_FEATURE_INCOMPAT_REVOKE, JBD2_SUPERBLOCK_V2, write_descriptor_block,
};
use ffs_ondisk::{
    DescriptorChecksummer, Ext4CompatFeatures, Ext4Extent, Ext4ExtentIndex, Ext4GroupDesc,
    Ext4IncompatFeatures, Ext4Inode, Ext4RoCompatFeatures, Ext4Superblock, Jbd2Header,
    Jbd2Superblock, Jbd2Tag, write_extent_index, write_extent_leaf,
};
use ffs_types::{
    EXT4_BG_INODE_ZEROED, EXT4_EXT_MAGIC, EXT4_EXTENTS_FL, EXT4_GOOD_OLD_FIRST_INO,
    EXT4_GOOD_OLD_INODE_SIZE, EXT4_NDIR_BLOCKS, EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE,
    EXT4_VALID_FS, GroupNumber, S_IFDIR, S_IFREG, Uuid, write_le_u16, write_le_u32,
    write_nul_padded,
};

const JOURNAL_INO: u32 = 8;
const ROOT_INO: u32 = 2;
/// Inodes 1..=10 are reserved and always marked in use.
const RESERVED_INODES: u32 = EXT4_GOOD_OLD_FIRST_INO - 1;
const MKFS_TIME: u32 = 1_700_000_000;
const EXTRA_ISIZE: u16 = 32;
const EXTENT_ROOT_MAX_ENTRIES: u16 = 4;

const BLOCK_BITMAP_CSUM_LO: usize = 0x18;
const INODE_BITMAP_CSUM_LO: usize = 0x1A;
const BLOCK_BITMAP_CSUM_HI: usize = 0x38;
const INODE_BITMAP_CSUM_HI: usize = 0x3A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStyle {
    None,
    /// Legacy crc16 descriptor checksums.
    GdtCsum,
    /// crc32c over the superblock, descriptors, bitmaps and inodes.
    MetadataCsum,
}

/// How an orphan's data blocks are mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMapping {
    /// One extent in the inode's root.
    #[default]
    Extent,
    /// A depth-1 tree: the root indexes one leaf block holding the extent.
    ExtentIndexed,
    /// Classic map: twelve direct pointers, then one single-indirect block.
    Indirect,
}

/// An inode on the orphan chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSpec {
    pub ino: u32,
    pub links_count: u16,
    pub size: u64,
    /// Data blocks from logical block 0, laid out contiguously.
    pub blocks: u32,
    pub mapping: BlockMapping,
}

impl OrphanSpec {
    /// Still linked: cleanup truncates it to `size`.
    #[must_use]
    pub fn linked(ino: u32, size: u64, blocks: u32) -> Self {
        Self {
            ino,
            links_count: 1,
            size,
            blocks,
            mapping: BlockMapping::Extent,
        }
    }

    /// Unlinked: cleanup deletes it.
    #[must_use]
    pub fn unlinked(ino: u32, blocks: u32) -> Self {
        Self {
            ino,
            links_count: 0,
            size: 0,
            blocks,
            mapping: BlockMapping::Extent,
        }
    }

    #[must_use]
    pub fn mapped(mut self, mapping: BlockMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Index or indirect blocks the mapping needs on top of the data.
    fn metadata_blocks(&self) -> u32 {
        match self.mapping {
            BlockMapping::Extent => 0,
            BlockMapping::ExtentIndexed => 1,
            BlockMapping::Indirect => u32::from(self.blocks as usize > EXT4_NDIR_BLOCKS),
        }
    }
}

/// An internal journal on inode 8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSpec {
    pub blocks: u32,
    /// Committed but unreplayed writes, `(fs block, fill byte)`. A non-empty
    /// list sets `RECOVER` on the volume.
    pub pending: Vec<(u64, u8)>,
    /// Error recorded in the journal by a previous mount.
    pub errno: i32,
}

impl Default for JournalSpec {
    fn default() -> Self {
        Self {
            blocks: 64,
            pending: Vec::new(),
            errno: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub groups: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    /// 64-byte descriptors with the `64BIT` feature.
    pub bit64: bool,
    pub checksum: ChecksumStyle,
    pub uuid: Uuid,
    pub journal: Option<JournalSpec>,
    /// Groups whose inode table is not yet zeroed.
    pub uninitialized_groups: Vec<u32>,
    /// The orphan chain, head first.
    pub orphans: Vec<OrphanSpec>,
    pub state: u16,
    /// Stored `s_errors`; 0 leaves the policy to the mount default.
    pub errors_behavior: u16,
    pub error_count: u32,
    pub rev_level: u32,
    pub mount_opts: String,
    pub extra_incompat: u32,
    pub extra_ro_compat: u32,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_group: 256,
            groups: 2,
            inodes_per_group: 32,
            inode_size: EXT4_GOOD_OLD_INODE_SIZE,
            bit64: false,
            checksum: ChecksumStyle::None,
            uuid: Uuid([
                0x6b, 0x1f, 0x3e, 0x02, 0x9a, 0x44, 0x4c, 0x51, 0x8d, 0x20, 0x11, 0xe7, 0x5a,
                0x0c, 0x93, 0xd4,
            ]),
            journal: None,
            uninitialized_groups: Vec::new(),
            orphans: Vec::new(),
            state: EXT4_VALID_FS,
            errors_behavior: 0,
            error_count: 0,
            rev_level: 1,
            mount_opts: String::new(),
            extra_incompat: 0,
            extra_ro_compat: 0,
        }
    }
}

/// A built image held in memory.
#[derive(Debug, Clone)]
pub struct TestImage {
    bytes: Vec<u8>,
    sb: Ext4Superblock,
}

impl TestImage {
    /// The superblock as written.
    #[must_use]
    pub fn superblock(&self) -> &Ext4Superblock {
        &self.sb
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_memory_device(self) -> MemoryByteDevice {
        MemoryByteDevice::from_bytes(self.bytes)
    }
}

/// Block positions shared by every group.
#[derive(Debug, Clone, Copy)]
struct Layout {
    first_data_block: u64,
    blocks_count: u64,
    desc_size: u16,
    descriptor_blocks: u64,
    itable_blocks: u64,
}

impl Layout {
    fn group_start(&self, spec: &ImageSpec, group: u32) -> u64 {
        self.first_data_block + u64::from(group) * u64::from(spec.blocks_per_group)
    }

    /// Blocks at the start of every group: superblock, descriptors, two
    /// bitmaps, inode table.
    fn metadata_blocks(&self) -> u64 {
        1 + self.descriptor_blocks + 2 + self.itable_blocks
    }

    fn block_bitmap(&self, spec: &ImageSpec, group: u32) -> u64 {
        self.group_start(spec, group) + 1 + self.descriptor_blocks
    }

    fn inode_bitmap(&self, spec: &ImageSpec, group: u32) -> u64 {
        self.block_bitmap(spec, group) + 1
    }

    fn inode_table(&self, spec: &ImageSpec, group: u32) -> u64 {
        self.inode_bitmap(spec, group) + 1
    }
}

/// One inode to place in the table.
struct InodeImage {
    ino: u32,
    inode: Ext4Inode,
}

impl ImageSpec {
    fn layout(&self) -> Result<Layout> {
        let bs = self.block_size;
        if !(1024..=65536).contains(&bs) || !bs.is_power_of_two() {
            return Err(FfsError::InvalidGeometry(format!("block size {bs}")));
        }
        if self.groups == 0 || self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return Err(FfsError::InvalidGeometry("empty image".to_owned()));
        }
        let first_data_block = u64::from(bs == 1024);
        let desc_size: u16 = if self.bit64 { 64 } else { 32 };
        let per_block = u64::from(bs / u32::from(desc_size));
        let descriptor_blocks = u64::from(self.groups).div_ceil(per_block);
        let itable_bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        let layout = Layout {
            first_data_block,
            blocks_count: first_data_block
                + u64::from(self.groups) * u64::from(self.blocks_per_group),
            desc_size,
            descriptor_blocks,
            itable_blocks: itable_bytes.div_ceil(u64::from(bs)),
        };
        if layout.metadata_blocks() >= u64::from(self.blocks_per_group) {
            return Err(FfsError::InvalidGeometry(
                "group metadata does not fit in a group".to_owned(),
            ));
        }
        Ok(layout)
    }

    fn superblock_struct(&self, layout: &Layout) -> Result<Ext4Superblock> {
        let mut region = vec![0_u8; EXT4_SUPERBLOCK_SIZE];
        let log_block_size = self.block_size.trailing_zeros() - 10;
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        write_le_u16(&mut region, 0x38, EXT4_SUPER_MAGIC).map_err(to_ffs)?;
        write_le_u32(&mut region, 0x18, log_block_size).map_err(to_ffs)?;
        write_le_u32(&mut region, 0x1C, log_block_size).map_err(to_ffs)?;
        let mut sb = Ext4Superblock::parse_superblock_region(&region).map_err(to_ffs)?;

        let mut compat = Ext4CompatFeatures(0);
        let mut incompat = Ext4IncompatFeatures::FILETYPE.with(Ext4IncompatFeatures::EXTENTS);
        let mut ro_compat =
            Ext4RoCompatFeatures::SPARSE_SUPER.0 | Ext4RoCompatFeatures::LARGE_FILE.0;
        if let Some(journal) = &self.journal {
            compat.0 |= Ext4CompatFeatures::HAS_JOURNAL.0;
            if !journal.pending.is_empty() {
                incompat = incompat.with(Ext4IncompatFeatures::RECOVER);
            }
        }
        if self.bit64 {
            incompat = incompat.with(Ext4IncompatFeatures::BIT64);
        }
        match self.checksum {
            ChecksumStyle::None => {}
            ChecksumStyle::GdtCsum => ro_compat |= Ext4RoCompatFeatures::GDT_CSUM.0,
            ChecksumStyle::MetadataCsum => ro_compat |= Ext4RoCompatFeatures::METADATA_CSUM.0,
        }
        if self.inode_size > EXT4_GOOD_OLD_INODE_SIZE {
            ro_compat |= Ext4RoCompatFeatures::EXTRA_ISIZE.0;
        }

        sb.inodes_count = self.groups * self.inodes_per_group;
        sb.blocks_count = layout.blocks_count;
        sb.first_data_block = u32::try_from(layout.first_data_block)
            .map_err(|_| FfsError::InvalidGeometry("first data block".to_owned()))?;
        sb.blocks_per_group = self.blocks_per_group;
        sb.clusters_per_group = self.blocks_per_group;
        sb.inodes_per_group = self.inodes_per_group;
        sb.rev_level = self.rev_level;
        sb.inode_size = self.inode_size;
        sb.first_ino = EXT4_GOOD_OLD_FIRST_INO;
        sb.desc_size = layout.desc_size;
        sb.uuid = self.uuid;
        sb.feature_compat = compat;
        sb.feature_incompat = Ext4IncompatFeatures(incompat.0 | self.extra_incompat);
        sb.feature_ro_compat = Ext4RoCompatFeatures(ro_compat | self.extra_ro_compat);
        sb.state = self.state;
        sb.errors = self.errors_behavior;
        sb.max_mnt_count = 20;
        sb.mkfs_time = MKFS_TIME;
        sb.wtime = MKFS_TIME;
        sb.lastcheck = MKFS_TIME;
        sb.error_count = self.error_count;
        if self.error_count > 0 {
            sb.first_error.time = MKFS_TIME;
            sb.first_error.func = "mkfs_seeded".to_owned();
            sb.last_error = sb.first_error.clone();
        }
        if self.journal.is_some() {
            sb.journal_inum = JOURNAL_INO;
        }
        sb.last_orphan = self.orphans.first().map_or(0, |o| o.ino);
        if self.checksum == ChecksumStyle::MetadataCsum {
            sb.checksum_type = 1;
        }
        Ok(sb)
    }

    /// The superblock region this spec produces, with free counts filled in.
    pub fn superblock_region(&self) -> Result<[u8; EXT4_SUPERBLOCK_SIZE]> {
        let image = self.build()?;
        let start = EXT4_SUPERBLOCK_OFFSET;
        let mut region = [0_u8; EXT4_SUPERBLOCK_SIZE];
        region.copy_from_slice(&image.bytes[start..start + EXT4_SUPERBLOCK_SIZE]);
        Ok(region)
    }

    /// Lay the volume out in memory.
    pub fn build(&self) -> Result<TestImage> {
        let layout = self.layout()?;
        let mut sb = self.superblock_struct(&layout)?;
        let bs = self.block_size as usize;
        let total = usize::try_from(layout.blocks_count)
            .ok()
            .and_then(|blocks| blocks.checked_mul(bs))
            .ok_or_else(|| FfsError::InvalidGeometry("image too large".to_owned()))?;
        let mut bytes = vec![0_u8; total];

        // Data allocation in group 0.
        let group0_end = layout.group_start(self, 0) + u64::from(self.blocks_per_group);
        let mut next_data = layout.group_start(self, 0) + layout.metadata_blocks();
        let mut allocate = |count: u32| -> Result<u64> {
            let start = next_data;
            next_data += u64::from(count);
            if next_data > group0_end {
                return Err(FfsError::InvalidGeometry(
                    "image data does not fit in group 0".to_owned(),
                ));
            }
            Ok(start)
        };

        let mut inodes = vec![InodeImage {
            ino: ROOT_INO,
            inode: Ext4Inode {
                mode: S_IFDIR | 0o755,
                size: 0,
                links_count: 2,
                dtime: 0,
                flags: 0,
                blocks: 0,
                block_area: [0; 60],
            },
        }];

        if let Some(journal) = &self.journal {
            let start = allocate(journal.blocks)?;
            self.write_journal(&mut bytes, journal, start)?;
            inodes.push(InodeImage {
                ino: JOURNAL_INO,
                inode: self.extent_inode(
                    S_IFREG | 0o600,
                    1,
                    journal_size(journal, bs),
                    start,
                    journal.blocks,
                )?,
            });
        }

        for (idx, orphan) in self.orphans.iter().enumerate() {
            if orphan.ino < EXT4_GOOD_OLD_FIRST_INO || orphan.ino > sb.inodes_count {
                return Err(FfsError::Format(format!("orphan inode {} out of range", orphan.ino)));
            }
            let start = allocate(orphan.blocks + orphan.metadata_blocks())?;
            let size = if orphan.links_count == 0 {
                u64::from(orphan.blocks) * bs as u64
            } else {
                orphan.size
            };
            let mode = S_IFREG | 0o644;
            let mut inode = match orphan.mapping {
                BlockMapping::Extent => {
                    self.extent_inode(mode, orphan.links_count, size, start, orphan.blocks)?
                }
                BlockMapping::ExtentIndexed => {
                    let leaf = start + u64::from(orphan.blocks);
                    let node = self.extent_leaf_block(&sb, orphan.ino, start, orphan.blocks, leaf)?;
                    put_block(&mut bytes, bs, leaf, &node);
                    self.indexed_inode(mode, orphan.links_count, size, leaf, orphan.blocks)?
                }
                BlockMapping::Indirect => {
                    let (inode, ind) =
                        self.indirect_inode(mode, orphan.links_count, size, start, orphan.blocks)?;
                    if let Some((block, data)) = ind {
                        put_block(&mut bytes, bs, block, &data);
                    }
                    inode
                }
            };
            inode.dtime = self.orphans.get(idx + 1).map_or(0, |next| next.ino);
            inodes.push(InodeImage {
                ino: orphan.ino,
                inode,
            });
        }
        let data_end = next_data;

        // Inodes first so the table holds checksummed copies.
        for image in &inodes {
            self.write_inode(&mut bytes, &layout, &sb, image)?;
        }

        let mut descs = Vec::with_capacity(self.groups as usize);
        let mut free_blocks = 0_u64;
        let mut free_inodes = 0_u32;
        for group in 0..self.groups {
            let used_blocks = if group == 0 {
                data_end - layout.group_start(self, 0)
            } else {
                layout.metadata_blocks()
            };
            let used_inos: Vec<u32> = (1..=self.inodes_per_group)
                .filter(|&index| {
                    let ino = group * self.inodes_per_group + index;
                    ino <= RESERVED_INODES || inodes.iter().any(|i| i.ino == ino)
                })
                .collect();
            let highest = used_inos.last().copied().unwrap_or(0);
            let dirs = u32::from(group == 0);

            let block_bitmap = bitmap(bs, used_blocks, u64::from(self.blocks_per_group));
            let mut inode_bitmap = bitmap(bs, 0, u64::from(self.inodes_per_group));
            for index in &used_inos {
                let bit = (index - 1) as usize;
                inode_bitmap[bit / 8] |= 1 << (bit % 8);
            }
            put_block(&mut bytes, bs, layout.block_bitmap(self, group), &block_bitmap);
            put_block(&mut bytes, bs, layout.inode_bitmap(self, group), &inode_bitmap);

            let free_b = u32::try_from(u64::from(self.blocks_per_group) - used_blocks)
                .map_err(|_| FfsError::InvalidGeometry("free block count".to_owned()))?;
            let used_count = u32::try_from(used_inos.len())
                .map_err(|_| FfsError::InvalidGeometry("inode count".to_owned()))?;
            let free_i = self.inodes_per_group - used_count;
            free_blocks += u64::from(free_b);
            free_inodes += free_i;
            let flags = if self.uninitialized_groups.contains(&group) {
                0
            } else {
                EXT4_BG_INODE_ZEROED
            };
            descs.push((
                Ext4GroupDesc {
                    block_bitmap: layout.block_bitmap(self, group),
                    inode_bitmap: layout.inode_bitmap(self, group),
                    inode_table: layout.inode_table(self, group),
                    free_blocks_count: free_b,
                    free_inodes_count: free_i,
                    used_dirs_count: dirs,
                    itable_unused: self.inodes_per_group - highest,
                    flags,
                    checksum: 0,
                },
                block_bitmap,
                inode_bitmap,
            ));
        }
        sb.free_blocks_count = free_blocks;
        sb.free_inodes_count = free_inodes;

        let checksummer = DescriptorChecksummer::for_superblock(&sb);
        let seed = sb.csum_seed();
        let desc_size = usize::from(layout.desc_size);
        let table_start = usize::try_from(layout.group_start(self, 0) + 1)
            .map_err(|_| FfsError::InvalidGeometry("descriptor table offset".to_owned()))?
            * bs;
        for (group, (desc, block_bitmap, inode_bitmap)) in descs.iter().enumerate() {
            let start = table_start + group * desc_size;
            let raw = &mut bytes[start..start + desc_size];
            let to_ffs = |e| parse_error_to_ffs(&e, 0);
            desc.serialize_into(raw, layout.desc_size).map_err(to_ffs)?;
            if self.checksum == ChecksumStyle::MetadataCsum {
                let bcsum =
                    crate::gdt::bitmap_checksum(seed, block_bitmap, self.blocks_per_group);
                let icsum =
                    crate::gdt::bitmap_checksum(seed, inode_bitmap, self.inodes_per_group);
                let (b_lo, b_hi) = halves(bcsum);
                let (i_lo, i_hi) = halves(icsum);
                write_le_u16(raw, BLOCK_BITMAP_CSUM_LO, b_lo).map_err(to_ffs)?;
                write_le_u16(raw, INODE_BITMAP_CSUM_LO, i_lo).map_err(to_ffs)?;
                if self.bit64 {
                    write_le_u16(raw, BLOCK_BITMAP_CSUM_HI, b_hi).map_err(to_ffs)?;
                    write_le_u16(raw, INODE_BITMAP_CSUM_HI, i_hi).map_err(to_ffs)?;
                }
            }
            let group = u32::try_from(group)
                .map_err(|_| FfsError::InvalidGeometry("group index".to_owned()))?;
            checksummer.stamp(GroupNumber(group), raw).map_err(to_ffs)?;
        }

        let region = &mut bytes[EXT4_SUPERBLOCK_OFFSET..EXT4_SUPERBLOCK_OFFSET + EXT4_SUPERBLOCK_SIZE];
        if !self.mount_opts.is_empty() {
            write_nul_padded(region, 0x200, 64, &self.mount_opts)
                .map_err(|e| parse_error_to_ffs(&e, 0))?;
        }
        sb.checksum = sb
            .serialize_into(region)
            .map_err(|e| parse_error_to_ffs(&e, 0))?;
        sb.mount_opts.clone_from(&self.mount_opts);

        Ok(TestImage { bytes, sb })
    }

    fn extent_inode(
        &self,
        mode: u16,
        links_count: u16,
        size: u64,
        start: u64,
        blocks: u32,
    ) -> Result<Ext4Inode> {
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        let mut area = [0_u8; 60];
        write_le_u16(&mut area, 0x00, EXT4_EXT_MAGIC).map_err(to_ffs)?;
        write_le_u16(&mut area, 0x04, EXTENT_ROOT_MAX_ENTRIES).map_err(to_ffs)?;
        if blocks > 0 {
            let len = u16::try_from(blocks)
                .ok()
                .filter(|&len| len <= 1 << 15)
                .ok_or_else(|| FfsError::Format(format!("extent of {blocks} blocks")))?;
            let start_lo = u32::try_from(start)
                .map_err(|_| FfsError::Format("extent start beyond 32 bits".to_owned()))?;
            write_le_u16(&mut area, 0x02, 1).map_err(to_ffs)?;
            write_le_u32(&mut area, 12, 0).map_err(to_ffs)?;
            write_le_u16(&mut area, 16, len).map_err(to_ffs)?;
            write_le_u16(&mut area, 18, 0).map_err(to_ffs)?;
            write_le_u32(&mut area, 20, start_lo).map_err(to_ffs)?;
        }
        Ok(Ext4Inode {
            mode,
            size,
            links_count,
            dtime: 0,
            flags: EXT4_EXTENTS_FL,
            blocks: u64::from(blocks) * u64::from(self.block_size / 512),
            block_area: area,
        })
    }

    /// Root holding a single index entry pointing at `leaf`.
    fn indexed_inode(
        &self,
        mode: u16,
        links_count: u16,
        size: u64,
        leaf: u64,
        blocks: u32,
    ) -> Result<Ext4Inode> {
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        let mut inode = self.extent_inode(mode, links_count, size, 0, 0)?;
        let area = &mut inode.block_area;
        write_le_u16(area, 0x06, 1).map_err(to_ffs)?;
        write_extent_index(area, &[Ext4ExtentIndex { logical_block: 0, leaf_block: leaf }])
            .map_err(to_ffs)?;
        inode.blocks = u64::from(blocks + 1) * u64::from(self.block_size / 512);
        Ok(inode)
    }

    /// A full-block leaf node mapping `blocks` from `start`, with its tail
    /// checksum when metadata checksums are on.
    fn extent_leaf_block(
        &self,
        sb: &Ext4Superblock,
        ino: u32,
        start: u64,
        blocks: u32,
        at: u64,
    ) -> Result<Vec<u8>> {
        let to_ffs = |e| parse_error_to_ffs(&e, at);
        let bs = self.block_size as usize;
        let max = u16::try_from((bs - 12) / 12)
            .map_err(|_| FfsError::InvalidGeometry("extent node capacity".to_owned()))?;
        let len = u16::try_from(blocks)
            .ok()
            .filter(|&len| len <= 1 << 15)
            .ok_or_else(|| FfsError::Format(format!("extent of {blocks} blocks")))?;
        let mut node = vec![0_u8; bs];
        write_le_u16(&mut node, 0x00, EXT4_EXT_MAGIC).map_err(to_ffs)?;
        write_le_u16(&mut node, 0x04, max).map_err(to_ffs)?;
        write_extent_leaf(
            &mut node,
            &[Ext4Extent { logical_block: 0, raw_len: len, physical_start: start }],
        )
        .map_err(to_ffs)?;
        stamp_extent_tail(sb, inode_csum_seed(sb, ino, 0), &mut node, at)?;
        Ok(node)
    }

    /// Direct pointers for the first twelve blocks and, past that, one
    /// single-indirect block placed right after the data.
    #[allow(clippy::type_complexity)]
    fn indirect_inode(
        &self,
        mode: u16,
        links_count: u16,
        size: u64,
        start: u64,
        blocks: u32,
    ) -> Result<(Ext4Inode, Option<(u64, Vec<u8>)>)> {
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        let pointer = |block: u64| {
            u32::try_from(block)
                .map_err(|_| FfsError::Format("block pointer beyond 32 bits".to_owned()))
        };
        let per_block = self.block_size / 4;
        let direct = blocks.min(EXT4_NDIR_BLOCKS as u32);
        if blocks - direct > per_block {
            return Err(FfsError::Format(format!(
                "{blocks} blocks need more than one indirect block"
            )));
        }
        let mut inode = Ext4Inode {
            mode,
            size,
            links_count,
            dtime: 0,
            flags: 0,
            blocks: 0,
            block_area: [0; 60],
        };
        for idx in 0..direct {
            inode
                .set_block_pointer(idx as usize, pointer(start + u64::from(idx))?)
                .map_err(to_ffs)?;
        }
        let mut ind = None;
        if blocks > direct {
            let at = start + u64::from(blocks);
            let mut data = vec![0_u8; self.block_size as usize];
            for slot in 0..blocks - direct {
                let block = pointer(start + u64::from(direct + slot))?;
                write_le_u32(&mut data, slot as usize * 4, block).map_err(to_ffs)?;
            }
            inode
                .set_block_pointer(EXT4_NDIR_BLOCKS, pointer(at)?)
                .map_err(to_ffs)?;
            ind = Some((at, data));
        }
        let mapped = blocks + u32::from(ind.is_some());
        inode.blocks = u64::from(mapped) * u64::from(self.block_size / 512);
        Ok((inode, ind))
    }

    fn write_inode(
        &self,
        bytes: &mut [u8],
        layout: &Layout,
        sb: &Ext4Superblock,
        image: &InodeImage,
    ) -> Result<()> {
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        let group = (image.ino - 1) / self.inodes_per_group;
        let index = u64::from((image.ino - 1) % self.inodes_per_group);
        let table = layout.inode_table(self, group);
        let offset = usize::try_from(table * u64::from(self.block_size) + index * u64::from(self.inode_size))
            .map_err(|_| FfsError::InvalidGeometry("inode offset".to_owned()))?;
        let raw = &mut bytes[offset..offset + usize::from(self.inode_size)];
        image.inode.serialize_into(raw).map_err(to_ffs)?;
        if self.inode_size > EXT4_GOOD_OLD_INODE_SIZE {
            write_le_u16(raw, 0x80, EXTRA_ISIZE).map_err(to_ffs)?;
        }
        stamp_inode_checksum(sb, image.ino, raw)
    }

    fn write_journal(&self, bytes: &mut [u8], journal: &JournalSpec, start: u64) -> Result<()> {
        let bs = self.block_size as usize;
        let to_ffs = |e| parse_error_to_ffs(&e, 0);
        let needed = journal.pending.len() + 3;
        if (journal.blocks as usize) < needed.max(2) {
            return Err(FfsError::Format(format!(
                "journal of {} blocks cannot hold {} pending writes",
                journal.blocks,
                journal.pending.len()
            )));
        }
        let jsb = Jbd2Superblock {
            header: Jbd2Header::new(JBD2_SUPERBLOCK_V2, 0),
            block_size: self.block_size,
            max_len: journal.blocks,
            first: 1,
            sequence: 1,
            start: u32::from(!journal.pending.is_empty()),
            errno: journal.errno,
            feature_compat: 0,
            feature_incompat: JBD2_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
            uuid: self.uuid,
            nr_users: 1,
            first_user: Uuid::NIL,
        };
        let mut block = vec![0_u8; bs];
        jsb.serialize_into(&mut block).map_err(to_ffs)?;
        put_block(bytes, bs, start, &block);
        if journal.pending.is_empty() {
            return Ok(());
        }

        let tags: Vec<Jbd2Tag> = journal
            .pending
            .iter()
            .map(|&(fs_block, _)| Jbd2Tag { fs_block, flags: 0 })
            .collect();
        let mut block = vec![0_u8; bs];
        write_descriptor_block(&mut block, 1, &tags, self.uuid, false).map_err(to_ffs)?;
        put_block(bytes, bs, start + 1, &block);
        let mut logical = start + 2;
        for &(_, fill) in &journal.pending {
            put_block(bytes, bs, logical, &vec![fill; bs]);
            logical += 1;
        }
        let mut block = vec![0_u8; bs];
        Jbd2Header::new(JBD2_COMMIT_BLOCK, 1)
            .write_into(&mut block)
            .map_err(to_ffs)?;
        put_block(bytes, bs, logical, &block);
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // split into 16-bit halves
fn halves(value: u32) -> (u16, u16) {
    (value as u16, (value >> 16) as u16)
}

fn journal_size(journal: &JournalSpec, bs: usize) -> u64 {
    u64::from(journal.blocks) * bs as u64
}

/// A bitmap block with the first `used` bits set and the padding past
/// `bits` set too.
fn bitmap(bs: usize, used: u64, bits: u64) -> Vec<u8> {
    let mut map = vec![0_u8; bs];
    let total = (bs * 8) as u64;
    for bit in (0..used).chain(bits..total) {
        let bit = bit as usize;
        map[bit / 8] |= 1 << (bit % 8);
    }
    map
}

fn put_block(bytes: &mut [u8], bs: usize, block: u64, data: &[u8]) {
    let start = block as usize * bs;
    bytes[start..start + data.len()].copy_from_slice(data);
}
