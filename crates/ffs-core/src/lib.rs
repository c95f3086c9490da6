#![forbid(unsafe_code)]
//! Superblock lifecycle and journal consistency for ext4 volumes.
//!
//! A mount loads and validates the superblock, checks the group descriptor
//! table, binds and recovers the journal, finishes orphaned inodes, and
//! schedules background inode-table zeroing. Faults found afterwards go
//! through a single controller that records them on disk and applies the
//! volume's error policy.

pub mod fault;
pub mod gdt;
pub mod inode_table;
pub mod journal;
pub mod lazy_init;
pub mod mount;
pub mod options;
pub mod orphan;
pub mod superblock;
pub mod testing;

pub use fault::{
    ErrorHint, FaultAction, FaultContext, FaultController, FaultState, HaltHandler, ProcessExit,
    ReportTimerConfig,
};
pub use gdt::{FreeCounters, GroupDescTable, VerifyReport};
pub use journal::{JournalMount, JournalSetup, setup_journal};
pub use lazy_init::{
    LazyInitConfig, LazyInitRegistry, LazyInitRequest, LazyInitStep, LazyInitTarget, VolumeId,
};
pub use mount::{MountConfig, MountedVolume, VolumeStats};
pub use options::{DataErrPolicy, DataMode, ErrorPolicy, MountOptions, ParseMode};
pub use orphan::{OrphanGate, OrphanInode, OrphanReport, OrphanSkip, OrphanStore};
pub use superblock::{
    Geometry, LoadedSuperblock, PersistContext, SuperblockLocation, SuperblockRecord,
};
