//! Journal Integration & Recovery.
//!
//! Binds a volume's superblock to its write-ahead log: resolves where the
//! log lives, opens it through a [`JournalProvider`], replays or wipes it,
//! carries a fault left by a previous mount into the superblock, and clears
//! `RECOVER` once a read-only mount has finished recovery.

use crate::gdt::GroupDescTable;
use crate::inode_table::read_inode;
use crate::options::{DataMode, MountOptions};
use crate::superblock::{PersistContext, SuperblockRecord, unix_now};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_journal::{JournalErrorSink, JournalHandle, JournalProvider, JournalSource, RecoveryStats};
use ffs_ondisk::{ErrorSite, Ext4CompatFeatures, collect_block_runs};
use ffs_types::{BlockNumber, DeviceNumber, ParseError};
use std::sync::Arc;

/// Per-mount inputs for opening the journal.
pub struct JournalMount<'a> {
    pub record: &'a mut SuperblockRecord,
    pub dev: &'a Arc<dyn BlockDevice>,
    pub gdt: &'a mut GroupDescTable,
    pub options: &'a mut MountOptions,
    pub read_only: bool,
}

impl std::fmt::Debug for JournalMount<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalMount")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// What opening the journal produced.
#[derive(Debug)]
pub struct JournalSetup {
    pub handle: JournalHandle,
    /// Set when a replay ran.
    pub recovery: Option<RecoveryStats>,
}

/// Whether this mount loads a journal at all.
fn journal_wanted(record: &SuperblockRecord, options: &MountOptions, read_only: bool) -> Result<bool> {
    let sb = record.superblock();
    if !sb.has_compat(Ext4CompatFeatures::HAS_JOURNAL) {
        return Ok(false);
    }
    if !options.no_load() {
        return Ok(true);
    }
    if sb.needs_recovery() {
        if !read_only {
            return Err(FfsError::JournalFailure(
                "required journal recovery suppressed and not mounted read-only".to_owned(),
            ));
        }
        tracing::warn!(
            target: "ffs::journal",
            "journal_recovery_suppressed_by_noload"
        );
    }
    Ok(false)
}

/// Work out where the log lives. `journal_dev=` overrides the stored device
/// and is written into the record.
pub fn resolve_source(
    record: &mut SuperblockRecord,
    dev: &dyn BlockDevice,
    gdt: &GroupDescTable,
    options: &MountOptions,
) -> Result<JournalSource> {
    if let Some(override_dev) = options.journal_dev() {
        let stored = record.superblock().journal_dev;
        if stored != override_dev.0 {
            tracing::info!(
                target: "ffs::journal",
                stored,
                requested = override_dev.0,
                "external_journal_device_overridden"
            );
            record.superblock_mut().journal_dev = override_dev.0;
        }
    }
    let sb = record.superblock();
    let (inum, devnum) = (sb.journal_inum, sb.journal_dev);
    match (inum, devnum) {
        (0, 0) => Err(FfsError::JournalFailure(
            "journal feature set but no journal inode or device recorded".to_owned(),
        )),
        (inum, 0) => internal_source(record, dev, gdt, inum),
        (0, devnum) => Ok(JournalSource::External {
            device: DeviceNumber(devnum),
            expected_uuid: sb.journal_uuid,
        }),
        (inum, devnum) => Err(FfsError::JournalFailure(format!(
            "filesystem has both journal inode {inum} and journal device {devnum}"
        ))),
    }
}

fn internal_source(
    record: &SuperblockRecord,
    dev: &dyn BlockDevice,
    gdt: &GroupDescTable,
    inum: u32,
) -> Result<JournalSource> {
    let sb = record.superblock();
    let inode = read_inode(dev, sb, gdt, inum)
        .map_err(|e| FfsError::JournalFailure(format!("no journal found: inode {inum}: {e}")))?;
    if inode.links_count == 0 || inode.size == 0 {
        return Err(FfsError::JournalFailure(format!(
            "journal inode {inum} is deleted or empty"
        )));
    }
    let bs = u64::from(sb.block_size);
    let max_logical = inode.size.div_ceil(bs);
    let mut read_error: Option<FfsError> = None;
    let runs = collect_block_runs(&inode, sb.block_size, max_logical, |block| {
        dev.read_block(BlockNumber(block))
            .map(ffs_block::BlockBuf::into_inner)
            .map_err(|e| {
                read_error = Some(e);
                ParseError::InvalidField {
                    field: "journal block map",
                    reason: "unreadable mapping block",
                }
            })
    });
    let runs = match (runs, read_error) {
        (Ok(runs), _) => runs,
        (Err(_), Some(io)) => return Err(io),
        (Err(e), None) => {
            return Err(FfsError::JournalFailure(format!(
                "journal inode {inum} block map: {e}"
            )));
        }
    };
    Ok(JournalSource::Internal { inum, runs })
}

/// Open the journal, if any, and bind `sink` as its error channel.
///
/// Without a journal the data mode is cleared and a handle in `NoJournal`
/// comes back. With one, the data mode defaults to `ordered`.
pub fn open_journal(
    provider: &dyn JournalProvider,
    mount: &mut JournalMount<'_>,
    sink: Arc<dyn JournalErrorSink>,
) -> Result<JournalHandle> {
    if !journal_wanted(mount.record, mount.options, mount.read_only)? {
        if mount.options.data_mode().is_some() {
            tracing::debug!(target: "ffs::journal", "data_mode_cleared_without_journal");
        }
        mount.options.set_data_mode(None);
        return Ok(JournalHandle::none());
    }
    let source = resolve_source(mount.record, mount.dev.as_ref(), mount.gdt, mount.options)?;
    let writable = !mount.dev.is_read_only();
    let handle = JournalHandle::open(provider, &source, Arc::clone(mount.dev), writable)?;
    handle.bind_error_channel(sink);
    if mount.options.data_mode().is_none() {
        mount.options.set_data_mode(Some(DataMode::Ordered));
    }
    tracing::info!(
        target: "ffs::journal",
        ?source,
        writable,
        data_mode = mount.options.data_mode().map(DataMode::as_str),
        "journal_bound"
    );
    Ok(handle)
}

/// Replay when the volume is marked `RECOVER`, otherwise wipe stale log
/// contents. After a replay the record and descriptor table are reloaded,
/// keeping the in-memory error diagnostics.
pub fn replay_if_needed(
    handle: &JournalHandle,
    mount: &mut JournalMount<'_>,
) -> Result<Option<RecoveryStats>> {
    if !handle.has_journal() {
        return Ok(None);
    }
    if !mount.record.needs_recovery() {
        handle.wipe_and_load()?;
        return Ok(None);
    }
    if mount.dev.is_read_only() {
        tracing::error!(
            target: "ffs::journal",
            "write_access_unavailable_cannot_proceed"
        );
        return Err(FfsError::ReadOnlyRecoveryRefused);
    }
    if mount.read_only {
        tracing::info!(
            target: "ffs::journal",
            "recovery_required_on_read_only_filesystem"
        );
    }
    let saved = mount.record.snapshot_error_info()?;
    let stats = handle.replay()?;
    let dev = mount.dev.as_ref();
    mount.record.reload_preserving_errors(dev, &saved)?;
    let sb_block = mount.record.location().block;
    let (mut gdt, _) = GroupDescTable::load(dev, mount.record.superblock(), sb_block)?;
    gdt.verify_all(mount.record.superblock(), mount.read_only)?;
    *mount.gdt = gdt;
    tracing::info!(
        target: "ffs::journal",
        transactions = stats.transactions,
        replayed = stats.blocks_replayed,
        "recovery_complete"
    );
    Ok(Some(stats))
}

/// Carry an error the journal recorded during an earlier mount into the
/// superblock, then clear it from the journal.
pub fn clear_stale_error(
    handle: &JournalHandle,
    record: &mut SuperblockRecord,
    dev: &dyn BlockDevice,
    gdt: &GroupDescTable,
    read_only: bool,
) -> Result<()> {
    let Some(errno) = handle.last_error() else {
        return Ok(());
    };
    tracing::warn!(
        target: "ffs::journal",
        errno,
        "filesystem_error_recorded_from_previous_mount"
    );
    tracing::warn!(target: "ffs::journal", "marking_fs_in_need_of_filesystem_check");
    record.record_error(ErrorSite {
        time: unix_now(),
        ino: 0,
        block: 0,
        func: "journal".to_owned(),
        line: 0,
    });
    if !dev.is_read_only() {
        record.persist(
            dev,
            PersistContext {
                counters: Some(gdt.free_counters()),
                read_only,
            },
            true,
        )?;
    }
    handle.clear_error()
}

/// Flush the journal; on a read-only volume also drop `RECOVER` from the
/// record and persist it.
pub fn mark_recovery_complete(
    handle: &JournalHandle,
    record: &mut SuperblockRecord,
    dev: &dyn BlockDevice,
    read_only: bool,
) -> Result<()> {
    if !handle.has_journal() {
        return Ok(());
    }
    handle.flush()?;
    if record.needs_recovery() && read_only && !dev.is_read_only() {
        record.set_needs_recovery(false);
        record.persist(
            dev,
            PersistContext {
                counters: None,
                read_only: true,
            },
            true,
        )?;
        tracing::debug!(target: "ffs::journal", "recover_flag_cleared");
    }
    Ok(())
}

/// Open, replay, and clear stale errors in mount order.
pub fn setup_journal(
    provider: &dyn JournalProvider,
    mount: &mut JournalMount<'_>,
    sink: Arc<dyn JournalErrorSink>,
) -> Result<JournalSetup> {
    let override_requested = mount
        .options
        .journal_dev()
        .is_some_and(|d| d.0 != mount.record.superblock().journal_dev);
    let handle = open_journal(provider, mount, sink)?;
    let recovery = replay_if_needed(&handle, mount)?;
    if handle.has_journal() {
        clear_stale_error(
            &handle,
            mount.record,
            mount.dev.as_ref(),
            mount.gdt,
            mount.read_only,
        )?;
        if override_requested && !mount.dev.is_read_only() {
            mount.record.persist(
                mount.dev.as_ref(),
                PersistContext {
                    counters: Some(mount.gdt.free_counters()),
                    read_only: mount.read_only,
                },
                true,
            )?;
        }
    }
    Ok(JournalSetup { handle, recovery })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::JournalFaultQueue;
    use crate::superblock::LoadedSuperblock;
    use crate::testing::{ImageSpec, JournalSpec};
    use ffs_block::{ByteDevice, MemoryByteDevice};
    use ffs_journal::{Jbd2Provider, JournalState, MemoryJournalProvider, MemoryJournalState};
    use ffs_types::EXT4_ERROR_FS;

    struct Fixture {
        mem: Arc<MemoryByteDevice>,
        record: SuperblockRecord,
        dev: Arc<dyn BlockDevice>,
        gdt: GroupDescTable,
        options: MountOptions,
    }

    fn fixture(spec: &ImageSpec, opts: &str) -> Fixture {
        let mem = Arc::new(spec.build().expect("build").into_memory_device());
        let LoadedSuperblock { record, device } =
            SuperblockRecord::load(Arc::clone(&mem) as Arc<dyn ByteDevice>, 1024).expect("load");
        let (gdt, _) =
            GroupDescTable::load(device.as_ref(), record.superblock(), record.location().block)
                .expect("gdt");
        let options = MountOptions::parse(record.superblock(), opts).expect("options");
        Fixture {
            mem,
            record,
            dev: device,
            gdt,
            options,
        }
    }

    fn sink() -> Arc<dyn JournalErrorSink> {
        Arc::new(JournalFaultQueue::default())
    }

    fn with_journal(pending: Vec<(u64, u8)>, errno: i32) -> ImageSpec {
        ImageSpec {
            journal: Some(JournalSpec {
                pending,
                errno,
                ..JournalSpec::default()
            }),
            ..ImageSpec::default()
        }
    }

    fn setup(fx: &mut Fixture, provider: &dyn JournalProvider, read_only: bool) -> Result<JournalSetup> {
        let mut mount = JournalMount {
            record: &mut fx.record,
            dev: &fx.dev,
            gdt: &mut fx.gdt,
            options: &mut fx.options,
            read_only,
        };
        setup_journal(provider, &mut mount, sink())
    }

    #[test]
    fn no_journal_clears_data_mode() {
        let mut fx = fixture(&ImageSpec::default(), "data=writeback");
        let out = setup(&mut fx, &Jbd2Provider::new(), false).expect("setup");
        assert_eq!(out.handle.state(), JournalState::NoJournal);
        assert_eq!(fx.options.data_mode(), None);
    }

    #[test]
    fn internal_journal_resolves_to_inode_runs() {
        let mut fx = fixture(&with_journal(Vec::new(), 0), "");
        let source = resolve_source(&mut fx.record, fx.dev.as_ref(), &fx.gdt, &fx.options)
            .expect("source");
        match source {
            JournalSource::Internal { inum, runs } => {
                assert_eq!(inum, 8);
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].2, 64);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn clean_journal_is_wiped_and_active() {
        let mut fx = fixture(&with_journal(Vec::new(), 0), "");
        let out = setup(&mut fx, &Jbd2Provider::new(), false).expect("setup");
        assert_eq!(out.handle.state(), JournalState::Active);
        assert!(out.recovery.is_none());
        assert_eq!(fx.options.data_mode(), Some(DataMode::Ordered));
    }

    #[test]
    fn pending_transaction_is_replayed() {
        let target = 200_u64;
        let mut fx = fixture(&with_journal(vec![(target, 0x5A)], 0), "");
        assert!(fx.record.needs_recovery());
        let out = setup(&mut fx, &Jbd2Provider::new(), false).expect("setup");
        let stats = out.recovery.expect("replayed");
        assert_eq!(stats.blocks_replayed, 1);
        let block = fx.dev.read_block(BlockNumber(target)).expect("read");
        assert!(block.as_slice().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn read_only_device_refuses_recovery() {
        let mut fx = fixture(&with_journal(vec![(200, 1)], 0), "");
        fx.mem.set_read_only(true);
        let err = setup(&mut fx, &Jbd2Provider::new(), true).expect_err("refused");
        assert!(matches!(err, FfsError::ReadOnlyRecoveryRefused));
    }

    #[test]
    fn noload_with_recover_needs_read_only() {
        let mut fx = fixture(&with_journal(vec![(200, 1)], 0), "noload");
        let err = setup(&mut fx, &Jbd2Provider::new(), false).expect_err("writable");
        assert!(matches!(err, FfsError::JournalFailure(_)));
        let out = setup(&mut fx, &Jbd2Provider::new(), true).expect("read-only");
        assert!(!out.handle.has_journal());
    }

    #[test]
    fn stale_journal_error_marks_superblock() {
        let mut fx = fixture(&with_journal(Vec::new(), -5), "");
        let out = setup(&mut fx, &Jbd2Provider::new(), false).expect("setup");
        assert_eq!(out.handle.last_error(), None);
        assert_ne!(fx.record.superblock().state & EXT4_ERROR_FS, 0);
        assert_eq!(fx.record.superblock().error_count, 1);
    }

    #[test]
    fn inode_and_device_together_fail() {
        let mut fx = fixture(&with_journal(Vec::new(), 0), "journal_dev=7");
        let err = setup(&mut fx, &Jbd2Provider::new(), false).expect_err("both");
        assert!(err.to_string().contains("both journal inode"), "{err}");
    }

    #[test]
    fn read_only_mount_clears_recover_after_replay() {
        let provider = MemoryJournalProvider::new(MemoryJournalState {
            pending: vec![(200, vec![7; 1024])],
            ..MemoryJournalState::default()
        });
        let mut fx = fixture(&with_journal(vec![(200, 7)], 0), "");
        let out = setup(&mut fx, &provider, true).expect("setup");
        assert!(out.recovery.is_some());
        mark_recovery_complete(&out.handle, &mut fx.record, fx.dev.as_ref(), true)
            .expect("complete");
        assert!(!fx.record.needs_recovery());
        assert_eq!(provider.state().lock().flushes, 1);
    }
}
