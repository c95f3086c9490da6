//! Mount/Remount Reconfigurator.
//!
//! [`MountedVolume::mount`] runs the full bring-up: superblock load and
//! validation, descriptor table, journal, fault controller, orphan cleanup,
//! and lazy inode-table initialization. Every stage that acquires something
//! pushes an undo entry; if a later stage fails the entries are released in
//! reverse order.
//!
//! [`MountedVolume::remount`] reapplies options and switches between
//! read-only and writable. A failed remount leaves options and mode as they
//! were.

use crate::fault::{
    ErrorHint, FaultAction, FaultContext, FaultController, FaultState, HaltHandler, ProcessExit,
    ReportTimerConfig,
};
use crate::gdt::GroupDescTable;
use crate::inode_table::{InodeTableStore, zero_inode_table_tail};
use crate::journal::{self, JournalMount};
use crate::lazy_init::{
    LazyInitConfig, LazyInitRegistry, LazyInitRequest, LazyInitStep, LazyInitTarget, VolumeId,
};
use crate::options::{DataMode, MountOptions, ParseMode};
use crate::orphan::{OrphanGate, OrphanReport, process_orphan_chain};
use crate::superblock::{
    Geometry, LoadedSuperblock, PersistContext, RecordCheckpoint, SuperblockLocation,
    SuperblockRecord,
};
use ffs_block::{BlockDevice, ByteDevice};
use ffs_error::{FfsError, Result};
use ffs_journal::{Jbd2Provider, JournalHandle, JournalProvider, JournalState, RecoveryStats};
use ffs_ondisk::Ext4Superblock;
use ffs_types::{BlockNumber, EXT4_ERROR_FS, EXT4_SUPERBLOCK_SIZE, EXT4_VALID_FS, GroupNumber};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a mount needs besides the device.
#[derive(Clone)]
pub struct MountConfig {
    /// Comma-separated mount options.
    pub options: String,
    /// Ask for a read-only mount.
    pub read_only: bool,
    pub journal_provider: Arc<dyn JournalProvider>,
    pub lazy_init: LazyInitRegistry,
    pub lazy_init_config: LazyInitConfig,
    /// Invoked by the `panic` error policy.
    pub halt: Arc<dyn HaltHandler>,
    pub error_report: ReportTimerConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            options: String::new(),
            read_only: false,
            journal_provider: Arc::new(Jbd2Provider::new()),
            lazy_init: LazyInitRegistry::global(),
            lazy_init_config: LazyInitConfig::default(),
            halt: Arc::new(ProcessExit),
            error_report: ReportTimerConfig::default(),
        }
    }
}

impl std::fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountConfig")
            .field("options", &self.options)
            .field("read_only", &self.read_only)
            .field("lazy_init", &self.lazy_init)
            .field("lazy_init_config", &self.lazy_init_config)
            .field("error_report", &self.error_report)
            .finish_non_exhaustive()
    }
}

impl MountConfig {
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Point-in-time view of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub volume: u64,
    pub block_size: u32,
    pub blocks_count: u64,
    pub groups_count: u32,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub read_only: bool,
    pub fault_state: FaultState,
    pub journal_state: JournalState,
    pub data_mode: Option<DataMode>,
    pub options: String,
    pub error_count: u32,
    pub mount_count: u16,
    pub first_uninitialized_group: Option<u32>,
    pub orphans: OrphanReport,
    pub recovery: Option<RecoveryStats>,
}

// ── Unwind stack ────────────────────────────────────────────────────────────

/// One acquired resource and how to give it back.
enum Stage {
    Device(Arc<dyn BlockDevice>),
    Journal(Arc<JournalHandle>),
    /// The superblock region as it stood before this mount rewrote it.
    SuperblockWritten {
        dev: Arc<dyn BlockDevice>,
        location: SuperblockLocation,
        region: Vec<u8>,
    },
    LazyInit {
        registry: LazyInitRegistry,
        id: VolumeId,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::Journal(_) => "journal",
            Self::SuperblockWritten { .. } => "superblock",
            Self::LazyInit { .. } => "lazy_init",
        }
    }

    fn release(self) -> Result<()> {
        match self {
            Self::Device(dev) => dev.sync(),
            Self::Journal(handle) => match handle.destroy() {
                Err(FfsError::AlreadyAborted) => Ok(()),
                other => other,
            },
            Self::SuperblockWritten {
                dev,
                location,
                region,
            } => {
                if dev.is_read_only() || !dev.device_present() {
                    return Ok(());
                }
                let block = BlockNumber(location.block);
                let mut buf = dev.read_block(block)?;
                let start = location.offset_in_block;
                buf.as_mut_slice()[start..start + EXT4_SUPERBLOCK_SIZE].copy_from_slice(&region);
                dev.write_block(block, buf.as_slice())?;
                dev.sync()
            }
            Self::LazyInit { registry, id } => {
                registry.unregister(id);
                Ok(())
            }
        }
    }
}

/// Resources a mount has acquired so far. Dropped uncommitted, it releases
/// them newest first.
#[derive(Default)]
struct MountUnwind {
    stages: Vec<Stage>,
    committed: bool,
}

impl MountUnwind {
    fn push(&mut self, stage: Stage) {
        tracing::trace!(target: "ffs::mount", stage = stage.name(), "mount_stage_acquired");
        self.stages.push(stage);
    }

    fn commit(mut self) {
        self.committed = true;
        self.stages.clear();
    }
}

impl Drop for MountUnwind {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(stage) = self.stages.pop() {
            let name = stage.name();
            match stage.release() {
                Ok(()) => tracing::debug!(target: "ffs::mount", stage = name, "mount_stage_released"),
                Err(e) => tracing::warn!(
                    target: "ffs::mount",
                    stage = name,
                    error = %e,
                    "mount_stage_release_failed"
                ),
            }
        }
    }
}

// ── Volume state ────────────────────────────────────────────────────────────

struct VolumeState {
    dev: Arc<dyn BlockDevice>,
    record: SuperblockRecord,
    gdt: GroupDescTable,
    geometry: Geometry,
    options: MountOptions,
    journal: Arc<JournalHandle>,
    fault: FaultController,
    read_only: bool,
    orphan_report: OrphanReport,
    recovery: Option<RecoveryStats>,
    unmounted: bool,
}

/// What remount decided about background initialization.
enum LazyInitChange {
    Register(u32),
    Unregister,
}

/// Values a failed remount puts back.
struct RemountSnapshot {
    options: MountOptions,
    read_only: bool,
    aborted: bool,
    record: RecordCheckpoint,
}

impl VolumeState {
    fn split(&mut self) -> (&mut FaultController, FaultContext<'_>) {
        let counters = Some(self.gdt.free_counters());
        (
            &mut self.fault,
            FaultContext {
                record: &mut self.record,
                dev: self.dev.as_ref(),
                journal: &self.journal,
                counters,
                read_only: &mut self.read_only,
            },
        )
    }

    fn report(&mut self, err: &FfsError, hint: &ErrorHint) -> FaultAction {
        let (fault, mut ctx) = self.split();
        fault.report(&mut ctx, err, hint)
    }

    fn abort(&mut self, reason: &str) {
        let (fault, mut ctx) = self.split();
        fault.abort(&mut ctx, reason);
    }

    fn drain_journal_faults(&mut self) {
        let (fault, mut ctx) = self.split();
        fault.drain_journal_faults(&mut ctx);
    }

    fn persist_context(&self) -> PersistContext {
        PersistContext {
            counters: Some(self.gdt.free_counters()),
            read_only: self.read_only,
        }
    }

    fn cleanup_orphans(&mut self) -> Result<()> {
        let head = self.record.superblock().last_orphan;
        let gate = OrphanGate {
            device_read_only: self.dev.is_read_only(),
            features_writable: self.record.check_feature_compatibility(true).is_ok(),
            has_errors: self.record.mount_state() & EXT4_ERROR_FS != 0,
        };
        let sb = self.record.superblock().clone();
        let report = {
            let mut store = InodeTableStore::new(self.dev.as_ref(), &sb, &mut self.gdt);
            process_orphan_chain(head, gate, sb.inodes_count, &mut store)?
        };
        if head != 0 && report.clears_head() {
            self.record.superblock_mut().last_orphan = 0;
            let ctx = self.persist_context();
            self.record.persist(self.dev.as_ref(), ctx, true)?;
        }
        self.orphan_report = report;
        Ok(())
    }

    fn lazy_init_wanted(&self) -> Option<u32> {
        (!self.read_only
            && !self.unmounted
            && self.options.init_itable()
            && self.gdt.first_uninitialized_group().is_some())
        .then(|| self.options.init_itable_multiplier())
    }

    fn snapshot(&self) -> RemountSnapshot {
        RemountSnapshot {
            options: self.options.clone(),
            read_only: self.read_only,
            aborted: self.fault.is_aborted(),
            record: self.record.checkpoint(),
        }
    }

    fn restore(&mut self, snapshot: RemountSnapshot) {
        self.fault.set_policy(snapshot.options.error_policy());
        self.options = snapshot.options;
        // An abort during the attempt stays in force, with the error state
        // it recorded.
        if self.fault.is_aborted() && !snapshot.aborted {
            return;
        }
        self.record.rollback(snapshot.record);
        self.read_only = snapshot.read_only;
    }

    fn remount(&mut self, text: &str, want_read_only: bool) -> Result<LazyInitChange> {
        let mut options = self.options.clone();
        options.apply(text, ParseMode::Remount)?;
        options.validate()?;
        if self.journal.has_journal() {
            if options.data_mode() != self.options.data_mode() {
                return Err(FfsError::InvalidOption(
                    "changing journal mode on remount is not supported".to_owned(),
                ));
            }
        } else {
            options.set_data_mode(None);
        }

        let was_read_only = self.read_only;
        self.options = options;
        self.fault.set_policy(self.options.error_policy());
        if self.options.abort_requested() && !self.fault.is_aborted() {
            self.abort("abort forced by remount");
        }

        if want_read_only != self.read_only {
            if self.fault.is_aborted() || self.journal.is_aborted() {
                return Err(FfsError::ReadOnly);
            }
            if want_read_only {
                self.to_read_only()?;
            } else {
                self.to_writable()?;
            }
        }

        if !self.journal.has_journal() && !was_read_only {
            let ctx = self.persist_context();
            self.record.persist(self.dev.as_ref(), ctx, true)?;
        }
        self.drain_journal_faults();
        tracing::info!(
            target: "ffs::mount",
            read_only = self.read_only,
            options = %self.options.render(),
            "remounted_filesystem"
        );
        Ok(match self.lazy_init_wanted() {
            Some(multiplier) => LazyInitChange::Register(multiplier),
            None => LazyInitChange::Unregister,
        })
    }

    fn to_read_only(&mut self) -> Result<()> {
        let mount_state = self.record.mount_state();
        if mount_state & EXT4_VALID_FS != 0 {
            self.record.superblock_mut().state = mount_state;
        }
        self.read_only = true;
        journal::mark_recovery_complete(
            &self.journal,
            &mut self.record,
            self.dev.as_ref(),
            true,
        )
    }

    fn to_writable(&mut self) -> Result<()> {
        if self.dev.is_read_only() {
            return Err(FfsError::ReadOnly);
        }
        self.record.check_feature_compatibility(true)?;
        if let Some(&group) = self.gdt.checksum_failures().first() {
            return Err(FfsError::CorruptMetadata {
                block: self.gdt.descriptor_block(GroupNumber(group)).unwrap_or(0),
                detail: format!(
                    "group {group}: descriptor checksum invalid, cannot remount read-write"
                ),
            });
        }
        let head = self.record.superblock().last_orphan;
        if head != 0 {
            return Err(FfsError::Busy(format!(
                "unprocessed orphan list starting at inode {head}, cannot remount read-write"
            )));
        }
        journal::clear_stale_error(
            &self.journal,
            &mut self.record,
            self.dev.as_ref(),
            &self.gdt,
            false,
        )?;
        let stored = self.record.read_stored_state(self.dev.as_ref())?;
        self.record.set_mount_state(stored);
        self.read_only = false;
        let has_journal = self.journal.has_journal();
        let counters = Some(self.gdt.free_counters());
        self.record.setup_super(self.dev.as_ref(), has_journal, counters)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.unmounted {
            return Ok(());
        }
        self.unmounted = true;
        self.fault.stop_timer();
        let mut first_err = None;
        if let Err(err) = self.journal.destroy() {
            if !matches!(err, FfsError::AlreadyAborted) {
                self.drain_journal_faults();
                if !self.fault.is_aborted() {
                    self.abort("couldn't clean up the journal");
                }
                first_err = Some(err);
            }
        }
        if !self.read_only {
            self.record.set_needs_recovery(false);
            let mount_state = self.record.mount_state();
            self.record.superblock_mut().state = mount_state;
            let ctx = self.persist_context();
            if let Err(err) = self.record.persist(self.dev.as_ref(), ctx, true) {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.dev.sync() {
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Bring a volume up to the point where only lazy-init registration is
/// left. Acquired resources are pushed onto `unwind`.
fn assemble(
    raw: Arc<dyn ByteDevice>,
    config: &MountConfig,
    unwind: &mut MountUnwind,
) -> Result<VolumeState> {
    let mut probe = MountOptions::default();
    probe.apply(&config.options, ParseMode::Mount)?;
    let LoadedSuperblock {
        mut record,
        device: dev,
    } = SuperblockRecord::load(raw, probe.superblock_byte_offset())?;
    unwind.push(Stage::Device(Arc::clone(&dev)));
    let mut options = MountOptions::parse(record.superblock(), &config.options)?;

    let mut read_only = config.read_only;
    if !read_only && dev.is_read_only() {
        tracing::warn!(target: "ffs::mount", "write_access_unavailable_mounting_read_only");
        read_only = true;
    }
    if !read_only && record.revision_forces_read_only() {
        read_only = true;
    }
    record.verify_checksum(read_only)?;
    record.check_feature_compatibility(!read_only)?;
    record.validate(dev.block_count())?;
    let geometry = record.compute_derived_geometry(options.stripe());

    let (mut gdt, desc_blocks) =
        GroupDescTable::load(dev.as_ref(), record.superblock(), record.location().block)?;
    let verify = gdt.verify_all(record.superblock(), read_only)?;
    tracing::debug!(
        target: "ffs::mount",
        groups = gdt.groups_count(),
        desc_blocks,
        checksum_failures = verify.checksum_failures.len(),
        first_uninitialized = verify.first_uninitialized_group,
        "descriptor_table_loaded"
    );

    let fault = FaultController::new(
        options.error_policy(),
        Arc::clone(&config.halt),
        config.error_report,
    );
    let setup = journal::setup_journal(
        config.journal_provider.as_ref(),
        &mut JournalMount {
            record: &mut record,
            dev: &dev,
            gdt: &mut gdt,
            options: &mut options,
            read_only,
        },
        fault.journal_sink(),
    )?;
    let journal = Arc::new(setup.handle);
    if journal.has_journal() {
        unwind.push(Stage::Journal(Arc::clone(&journal)));
    }
    if !dev.is_read_only() {
        unwind.push(Stage::SuperblockWritten {
            dev: Arc::clone(&dev),
            location: record.location(),
            region: record.raw_region().to_vec(),
        });
    }

    let mut state = VolumeState {
        dev,
        record,
        gdt,
        geometry,
        options,
        journal,
        fault,
        read_only,
        orphan_report: OrphanReport::default(),
        recovery: setup.recovery,
        unmounted: false,
    };
    state.fault.consult_persisted(&state.record)?;
    if state.options.abort_requested() {
        state.abort("abort requested by mount option");
    }
    if !state.read_only {
        let has_journal = state.journal.has_journal();
        let counters = Some(state.gdt.free_counters());
        state
            .record
            .setup_super(state.dev.as_ref(), has_journal, counters)?;
    }
    state.cleanup_orphans()?;
    journal::mark_recovery_complete(
        &state.journal,
        &mut state.record,
        state.dev.as_ref(),
        state.read_only,
    )?;
    state.drain_journal_faults();
    Ok(state)
}

// ── Mounted volume ──────────────────────────────────────────────────────────

/// Shared with the lazy-init worker.
struct VolumeCore {
    id: VolumeId,
    state: Mutex<VolumeState>,
}

impl LazyInitTarget for VolumeCore {
    fn init_next_group(&self) -> Result<LazyInitStep> {
        let mut state = self.state.lock();
        if state.read_only || state.unmounted {
            return Ok(LazyInitStep::Done);
        }
        let Some(group) = state.gdt.first_uninitialized_group() else {
            return Ok(LazyInitStep::Done);
        };
        let barrier = state.options.barrier();
        let st = &mut *state;
        let result = zero_inode_table_tail(
            st.dev.as_ref(),
            st.record.superblock(),
            &mut st.gdt,
            group,
            barrier,
        );
        match result {
            Ok(()) => Ok(LazyInitStep::Initialized(group)),
            Err(err) => {
                let hint = ErrorHint::new("zero_inode_table_tail", line!()).block(
                    st.gdt
                        .descriptor(group)
                        .map_or(0, |desc| desc.inode_table),
                );
                st.report(&err, &hint);
                Err(err)
            }
        }
    }
}

pub struct MountedVolume {
    core: Arc<VolumeCore>,
    registry: LazyInitRegistry,
    lazy_config: LazyInitConfig,
    unmounted: bool,
}

impl std::fmt::Debug for MountedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedVolume")
            .field("id", &self.core.id)
            .field("unmounted", &self.unmounted)
            .finish_non_exhaustive()
    }
}

impl MountedVolume {
    /// Mount the filesystem on `raw`.
    pub fn mount(raw: Arc<dyn ByteDevice>, config: &MountConfig) -> Result<Self> {
        let mut unwind = MountUnwind::default();
        let state = assemble(raw, config, &mut unwind)?;
        let lazy = state.lazy_init_wanted();
        let read_only = state.read_only;
        let options = state.options.render();

        let id = VolumeId(NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(VolumeCore {
            id,
            state: Mutex::new(state),
        });
        if let Some(multiplier) = lazy {
            config.lazy_init.register(LazyInitRequest {
                id,
                target: Arc::clone(&core) as Arc<dyn LazyInitTarget>,
                multiplier,
                max_start_delay: config.lazy_init_config.max_start_delay,
            })?;
            unwind.push(Stage::LazyInit {
                registry: config.lazy_init.clone(),
                id,
            });
        }
        unwind.commit();
        tracing::info!(
            target: "ffs::mount",
            volume = id.0,
            read_only,
            options = %options,
            "mounted_filesystem"
        );
        Ok(Self {
            core,
            registry: config.lazy_init.clone(),
            lazy_config: config.lazy_init_config,
            unmounted: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> VolumeId {
        self.core.id
    }

    /// Reapply `options` and move to the requested mode. On failure the
    /// options and mode in force before the call are kept.
    pub fn remount(&mut self, options: &str, read_only: bool) -> Result<()> {
        if self.unmounted {
            return Err(FfsError::Busy("volume is unmounted".to_owned()));
        }
        let change = {
            let mut state = self.core.state.lock();
            let snapshot = state.snapshot();
            match state.remount(options, read_only) {
                Ok(change) => change,
                Err(err) => {
                    state.restore(snapshot);
                    tracing::warn!(
                        target: "ffs::mount",
                        volume = self.core.id.0,
                        error = %err,
                        "remount_failed"
                    );
                    return Err(err);
                }
            }
        };
        // The worker takes the state lock; registry calls happen without it.
        match change {
            LazyInitChange::Register(multiplier) => self.registry.register(LazyInitRequest {
                id: self.core.id,
                target: Arc::clone(&self.core) as Arc<dyn LazyInitTarget>,
                multiplier,
                max_start_delay: self.lazy_config.max_start_delay,
            }),
            LazyInitChange::Unregister => {
                self.registry.unregister(self.core.id);
                Ok(())
            }
        }
    }

    /// Route a fault found while the volume is in use.
    pub fn report_error(&self, err: &FfsError, hint: &ErrorHint) -> FaultAction {
        let mut state = self.core.state.lock();
        let action = state.report(err, hint);
        state.drain_journal_faults();
        action
    }

    pub fn warning(&self, hint: &ErrorHint, message: &str) {
        self.core.state.lock().fault.warning(hint, message);
    }

    /// Write the superblock with current free counts. Failures other than a
    /// missing device go through the error policy.
    pub fn persist(&self, sync: bool) -> Result<()> {
        let mut state = self.core.state.lock();
        let ctx = state.persist_context();
        let st = &mut *state;
        let result = st.record.persist(st.dev.as_ref(), ctx, sync);
        if let Err(err) = &result {
            if !matches!(err, FfsError::DeviceEjected) {
                st.report(err, &ErrorHint::new("persist", line!()));
            }
        }
        result
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.core.state.lock().read_only
    }

    #[must_use]
    pub fn fault_state(&self) -> FaultState {
        let state = self.core.state.lock();
        state.fault.state(&state.record)
    }

    #[must_use]
    pub fn superblock(&self) -> Ext4Superblock {
        self.core.state.lock().record.superblock().clone()
    }

    #[must_use]
    pub fn options(&self) -> MountOptions {
        self.core.state.lock().options.clone()
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.core.state.lock().geometry.clone()
    }

    #[must_use]
    pub fn orphan_report(&self) -> OrphanReport {
        self.core.state.lock().orphan_report.clone()
    }

    #[must_use]
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.core.state.lock().recovery
    }

    #[must_use]
    pub fn first_uninitialized_group(&self) -> Option<GroupNumber> {
        self.core.state.lock().gdt.first_uninitialized_group()
    }

    #[must_use]
    pub fn lazy_init_registered(&self) -> bool {
        self.registry.is_registered(self.core.id)
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let state = self.core.state.lock();
        let sb = state.record.superblock();
        let counters = state.gdt.free_counters();
        VolumeStats {
            volume: self.core.id.0,
            block_size: state.geometry.block_size,
            blocks_count: state.geometry.blocks_count,
            groups_count: state.gdt.groups_count(),
            free_blocks: counters.free_blocks,
            free_inodes: counters.free_inodes,
            read_only: state.read_only,
            fault_state: state.fault.state(&state.record),
            journal_state: state.journal.state(),
            data_mode: state.options.data_mode(),
            options: state.options.render(),
            error_count: sb.error_count,
            mount_count: sb.mnt_count,
            first_uninitialized_group: state.gdt.first_uninitialized_group().map(|g| g.0),
            orphans: state.orphan_report.clone(),
            recovery: state.recovery,
        }
    }

    /// Stop background work, release the journal, and write the final
    /// superblock state.
    pub fn unmount(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.unmounted {
            return Ok(());
        }
        self.unmounted = true;
        self.registry.unregister(self.core.id);
        let result = self.core.state.lock().shutdown();
        match &result {
            Ok(()) => tracing::info!(target: "ffs::mount", volume = self.core.id.0, "unmounted_filesystem"),
            Err(e) => tracing::warn!(
                target: "ffs::mount",
                volume = self.core.id.0,
                error = %e,
                "unmount_incomplete"
            ),
        }
        result
    }
}

impl Drop for MountedVolume {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageSpec, OrphanSpec};
    use ffs_block::MemoryByteDevice;

    fn mount_spec(spec: &ImageSpec, config: &MountConfig) -> (Arc<MemoryByteDevice>, Result<MountedVolume>) {
        let mem = Arc::new(spec.build().expect("build").into_memory_device());
        let raw: Arc<dyn ByteDevice> = Arc::clone(&mem) as Arc<dyn ByteDevice>;
        let result = MountedVolume::mount(raw, config);
        (mem, result)
    }

    fn local_config() -> MountConfig {
        MountConfig {
            lazy_init: LazyInitRegistry::new(),
            ..MountConfig::default()
        }
    }

    #[test]
    fn unwind_restores_superblock_in_reverse() {
        let spec = ImageSpec::default();
        let mem = Arc::new(spec.build().expect("build").into_memory_device());
        let before = mem.snapshot();
        {
            let raw: Arc<dyn ByteDevice> = Arc::clone(&mem) as Arc<dyn ByteDevice>;
            let LoadedSuperblock { mut record, device } =
                SuperblockRecord::load(raw, 1024).expect("load");
            let mut unwind = MountUnwind::default();
            unwind.push(Stage::Device(Arc::clone(&device)));
            unwind.push(Stage::SuperblockWritten {
                dev: Arc::clone(&device),
                location: record.location(),
                region: record.raw_region().to_vec(),
            });
            record
                .setup_super(device.as_ref(), false, None)
                .expect("setup");
            assert_ne!(mem.snapshot(), before);
        }
        assert_eq!(mem.snapshot()[1024..2048], before[1024..2048]);
    }

    #[test]
    fn committed_unwind_keeps_changes() {
        let spec = ImageSpec::default();
        let mem = Arc::new(spec.build().expect("build").into_memory_device());
        let raw: Arc<dyn ByteDevice> = Arc::clone(&mem) as Arc<dyn ByteDevice>;
        let LoadedSuperblock { mut record, device } =
            SuperblockRecord::load(raw, 1024).expect("load");
        let mut unwind = MountUnwind::default();
        unwind.push(Stage::SuperblockWritten {
            dev: Arc::clone(&device),
            location: record.location(),
            region: record.raw_region().to_vec(),
        });
        record
            .setup_super(device.as_ref(), false, None)
            .expect("setup");
        let after = mem.snapshot();
        unwind.commit();
        assert_eq!(mem.snapshot(), after);
    }

    #[test]
    fn writable_mount_without_journal_marks_not_clean_until_unmount() {
        let (mem, volume) = mount_spec(&ImageSpec::default(), &local_config());
        let volume = volume.expect("mount");
        assert!(!volume.is_read_only());
        assert_eq!(volume.superblock().state & EXT4_VALID_FS, 0);
        assert_eq!(volume.superblock().mnt_count, 1);
        volume.unmount().expect("unmount");

        let sb = Ext4Superblock::parse_superblock_region(&mem.snapshot()[1024..2048]).expect("sb");
        assert_ne!(sb.state & EXT4_VALID_FS, 0);
        assert_eq!(sb.mnt_count, 1);
    }

    #[test]
    fn mount_resets_orphan_chain_head() {
        let spec = ImageSpec {
            orphans: vec![OrphanSpec::unlinked(12, 2)],
            ..ImageSpec::default()
        };
        let (mem, volume) = mount_spec(&spec, &local_config());
        let volume = volume.expect("mount");
        assert_eq!(volume.orphan_report().deleted, 1);
        assert_eq!(volume.superblock().last_orphan, 0);
        drop(volume);
        let sb = Ext4Superblock::parse_superblock_region(&mem.snapshot()[1024..2048]).expect("sb");
        assert_eq!(sb.last_orphan, 0);
    }

    #[test]
    fn remount_rejects_data_mode_change_with_journal() {
        let spec = ImageSpec {
            journal: Some(crate::testing::JournalSpec::default()),
            ..ImageSpec::default()
        };
        let (_mem, volume) = mount_spec(&spec, &local_config());
        let mut volume = volume.expect("mount");
        assert_eq!(volume.options().data_mode(), Some(DataMode::Ordered));
        let err = volume
            .remount("data=writeback", false)
            .expect_err("data mode change");
        assert!(matches!(err, FfsError::InvalidOption(_)));
        assert_eq!(volume.options().data_mode(), Some(DataMode::Ordered));
        assert!(!volume.is_read_only());
    }

    #[test]
    fn stats_serialize() {
        let (_mem, volume) = mount_spec(&ImageSpec::default(), &local_config());
        let volume = volume.expect("mount");
        let stats = volume.stats();
        assert_eq!(stats.groups_count, 2);
        assert_eq!(stats.fault_state, FaultState::Clean);
        assert_eq!(stats.journal_state, JournalState::NoJournal);
        let json = serde_json::to_string(&stats).expect("json");
        assert!(json.contains("\"groups_count\":2"));
    }
}
