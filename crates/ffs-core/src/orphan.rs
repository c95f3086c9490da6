//! Orphan cleanup.
//!
//! Inodes that lost their last link (or were mid-truncate) while still in
//! use are chained from `s_last_orphan` through their `i_dtime` field. On
//! mount each entry is finished: a linked inode is truncated to its recorded
//! size, an unlinked one is deleted.

use ffs_error::Result;
use serde::{Deserialize, Serialize};

/// What the chain walk needs to know about one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanInode {
    pub ino: u32,
    pub links_count: u16,
    pub size: u64,
    /// Next entry on the chain, 0 at the end.
    pub next: u32,
}

/// Inode operations orphan cleanup drives.
pub trait OrphanStore {
    /// Load `ino` as a chain entry. An error means the entry cannot be
    /// trusted and ends the walk.
    fn resolve(&mut self, ino: u32) -> Result<OrphanInode>;

    /// Trim the inode's blocks down to its recorded size.
    fn truncate(&mut self, orphan: &OrphanInode) -> Result<()>;

    /// Release the inode and every block it maps.
    fn delete(&mut self, orphan: &OrphanInode) -> Result<()>;
}

/// Why cleanup did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanSkip {
    EmptyChain,
    DeviceReadOnly,
    /// Unknown read-only-compatible features: the volume can't be written.
    FeaturesNotWritable,
    /// The volume carries an error flag. The chain is dropped unprocessed.
    FilesystemHasErrors,
}

/// Conditions evaluated before the walk starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanGate {
    pub device_read_only: bool,
    pub features_writable: bool,
    pub has_errors: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub truncated: u32,
    pub deleted: u32,
    /// Inodes taken off the chain, in chain order.
    pub processed: Vec<u32>,
    pub skipped: Option<OrphanSkip>,
    /// Set when an entry could not be resolved or the chain looped.
    pub stopped_early: Option<String>,
}

impl OrphanReport {
    /// Whether the on-disk chain head must be reset to 0 afterwards.
    #[must_use]
    pub fn clears_head(&self) -> bool {
        matches!(self.skipped, None | Some(OrphanSkip::FilesystemHasErrors))
    }
}

/// Walk the chain starting at `head`.
///
/// At most `inodes_count` entries are visited, so a chain that loops back on
/// itself ends instead of spinning. Truncate and delete failures are
/// returned as errors; resolution failures end the walk early.
pub fn process_orphan_chain(
    head: u32,
    gate: OrphanGate,
    inodes_count: u32,
    store: &mut dyn OrphanStore,
) -> Result<OrphanReport> {
    let mut report = OrphanReport::default();
    if head == 0 {
        report.skipped = Some(OrphanSkip::EmptyChain);
        return Ok(report);
    }
    if gate.device_read_only {
        tracing::info!(target: "ffs::orphan", head, "orphan_cleanup_skipped_device_read_only");
        report.skipped = Some(OrphanSkip::DeviceReadOnly);
        return Ok(report);
    }
    if !gate.features_writable {
        tracing::info!(target: "ffs::orphan", head, "orphan_cleanup_skipped_features_not_writable");
        report.skipped = Some(OrphanSkip::FeaturesNotWritable);
        return Ok(report);
    }
    if gate.has_errors {
        tracing::info!(
            target: "ffs::orphan",
            head,
            "errors_on_filesystem_clearing_orphan_list"
        );
        report.skipped = Some(OrphanSkip::FilesystemHasErrors);
        return Ok(report);
    }

    let mut next = head;
    while next != 0 {
        if report.processed.len() >= inodes_count as usize {
            tracing::error!(
                target: "ffs::orphan",
                visited = report.processed.len(),
                "orphan_chain_loops"
            );
            report.stopped_early = Some(format!(
                "orphan chain longer than {inodes_count} inodes"
            ));
            break;
        }
        let orphan = match store.resolve(next) {
            Ok(orphan) => orphan,
            Err(err) => {
                tracing::error!(
                    target: "ffs::orphan",
                    ino = next,
                    error = %err,
                    "bad_orphan_inode"
                );
                report.stopped_early = Some(format!("inode {next}: {err}"));
                break;
            }
        };
        if orphan.links_count > 0 {
            tracing::debug!(
                target: "ffs::orphan",
                ino = orphan.ino,
                size = orphan.size,
                "truncating_orphan_inode"
            );
            store.truncate(&orphan)?;
            report.truncated += 1;
        } else {
            tracing::debug!(target: "ffs::orphan", ino = orphan.ino, "deleting_orphan_inode");
            store.delete(&orphan)?;
            report.deleted += 1;
        }
        report.processed.push(orphan.ino);
        next = orphan.next;
    }

    if report.truncated > 0 || report.deleted > 0 {
        tracing::info!(
            target: "ffs::orphan",
            truncated = report.truncated,
            deleted = report.deleted,
            "orphan_cleanup_complete"
        );
    }
    Ok(report)
}
