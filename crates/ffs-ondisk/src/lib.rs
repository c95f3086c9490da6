#![forbid(unsafe_code)]
//! On-disk format codecs for the ext4 superblock, group descriptors, the
//! inode fields orphan cleanup touches, and the JBD2 journal.
//!
//! Pure byte-level crate: no I/O, no side effects. Every parser takes a byte
//! slice and returns a typed structure or a [`ffs_types::ParseError`]; every
//! serializer writes into a caller-provided buffer so unmodelled bytes
//! survive a parse → serialize cycle.

pub mod features;
pub mod group_desc;
pub mod inode;
pub mod jbd2;
pub mod superblock;

pub use features::{
    DefaultMountOpts, Ext4CompatFeatures, Ext4IncompatFeatures, Ext4RoCompatFeatures,
};
pub use group_desc::{
    DescriptorChecksumKind, DescriptorChecksummer, DescriptorRegions, Ext4GroupDesc,
    GD_CHECKSUM_OFFSET,
};
pub use inode::{
    Ext4Extent, Ext4ExtentHeader, Ext4ExtentIndex, Ext4Inode, ExtentTree, clear_extent_node,
    collect_block_runs, parse_extent_tree, write_extent_index, write_extent_leaf,
};
pub use jbd2::{Jbd2Header, Jbd2Superblock, Jbd2Tag};
pub use superblock::{
    ErrorSite, Ext4Superblock, SB_CHECKSUM_OFFSET, SB_ERROR_INFO_RANGE, superblock_checksum,
};
