#![forbid(unsafe_code)]
//! Journal collaborator for the mount path.
//!
//! The superblock layer never reaches into transaction machinery. It sees a
//! [`Journal`] (replay, wipe, flush, abort, last error) opened through a
//! [`JournalProvider`] from a [`JournalSource`], wrapped in a
//! [`JournalHandle`] that enforces the lifecycle:
//!
//! ```text
//! NoJournal ──open──▶ Loading ──replay──▶ Replaying ──▶ Active
//!                        │                                 │
//!                        └──────────── any ──────────▶ Aborted (terminal)
//! ```
//!
//! Faults the journal detects on its own are pushed one way, upward, to a
//! bound [`JournalErrorSink`]. Nothing above the journal is called back when
//! the superblock layer itself asks for an abort.
//!
//! Two implementations ship here: [`Jbd2Log`], which reads and replays a
//! JBD2 log on an internal inode or an external journal device, and
//! [`MemoryJournal`], a scripted journal for exercising mount paths.

pub mod handle;
pub mod jbd2_log;
pub mod memory;
pub mod provider;

use ffs_block::BlockDevice;
use ffs_error::Result;
use ffs_types::{DeviceNumber, Uuid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use handle::{JournalErrorSink, JournalFault, JournalHandle, JournalState};
pub use jbd2_log::{Jbd2Log, LogMap};
pub use memory::{MemoryJournal, MemoryJournalProvider, MemoryJournalState};
pub use provider::Jbd2Provider;

/// Counters from one recovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub transactions: u32,
    pub blocks_replayed: u64,
    pub blocks_revoked: u64,
    /// First sequence number after the last complete transaction.
    pub end_sequence: u32,
}

/// Where the journal lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalSource {
    /// A reserved inode inside the filesystem. `runs` maps journal logical
    /// blocks to filesystem blocks as `(logical, physical, len)`.
    Internal { inum: u32, runs: Vec<(u64, u64, u64)> },
    /// A dedicated journal device whose header must carry `expected_uuid`.
    External {
        device: DeviceNumber,
        expected_uuid: Uuid,
    },
}

/// The operations the mount path needs from a write-ahead log.
pub trait Journal: Send + std::fmt::Debug {
    /// Whether the log holds transactions that were never checkpointed.
    fn needs_recovery(&self) -> bool;

    /// Replay every committed transaction into the filesystem device.
    fn replay(&mut self) -> Result<RecoveryStats>;

    /// Discard the log contents without replaying them.
    fn wipe(&mut self) -> Result<()>;

    /// Push every pending journal write to stable storage.
    fn flush(&mut self) -> Result<()>;

    /// Stop accepting writes and record `errno` in the journal header.
    fn abort(&mut self, errno: i32, reason: &str);

    fn is_aborted(&self) -> bool;

    /// The error recorded by a previous abort, if any.
    fn last_error(&self) -> Option<i32>;

    fn clear_error(&mut self) -> Result<()>;

    /// Final flush on unmount.
    fn destroy(&mut self) -> Result<()>;
}

/// Opens journals for a mount.
pub trait JournalProvider: Send + Sync {
    /// `writable` tells the journal whether it may write its own header and
    /// the filesystem device.
    fn open(
        &self,
        source: &JournalSource,
        fs_dev: Arc<dyn BlockDevice>,
        writable: bool,
    ) -> Result<Box<dyn Journal>>;
}
