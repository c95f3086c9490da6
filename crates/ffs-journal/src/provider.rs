//! Opens JBD2 journals from an internal inode or an external device.
//!
//! External journal devices are looked up by device number in a registry the
//! caller fills with [`Jbd2Provider::attach_external`]. A device can be held
//! by one journal at a time; the claim is released when that journal drops.

use crate::jbd2_log::{Jbd2Log, LogMap};
use crate::{Journal, JournalProvider, JournalSource, RecoveryStats};
use ffs_block::{BlockDevice, ByteBlockDevice, ByteDevice};
use ffs_error::{FfsError, Result};
use ffs_ondisk::{Ext4IncompatFeatures, Ext4Superblock};
use ffs_types::{DeviceNumber, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE, Uuid};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct Jbd2Provider {
    externals: Mutex<HashMap<DeviceNumber, Arc<dyn ByteDevice>>>,
    claimed: Arc<Mutex<HashSet<DeviceNumber>>>,
}

impl std::fmt::Debug for Jbd2Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut devices: Vec<DeviceNumber> = self.externals.lock().keys().copied().collect();
        devices.sort_unstable();
        f.debug_struct("Jbd2Provider")
            .field("externals", &devices)
            .field("claimed", &self.claimed.lock().len())
            .finish()
    }
}

impl Jbd2Provider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `dev` resolvable as journal device `number`.
    pub fn attach_external(&self, number: DeviceNumber, dev: Arc<dyn ByteDevice>) {
        self.externals.lock().insert(number, dev);
    }

    #[must_use]
    pub fn is_claimed(&self, number: DeviceNumber) -> bool {
        self.claimed.lock().contains(&number)
    }

    fn open_external(
        &self,
        number: DeviceNumber,
        expected_uuid: Uuid,
        fs_dev: Arc<dyn BlockDevice>,
        writable: bool,
    ) -> Result<Box<dyn Journal>> {
        let raw_dev = self
            .externals
            .lock()
            .get(&number)
            .cloned()
            .ok_or_else(|| {
                FfsError::JournalFailure(format!("journal device {number} not found"))
            })?;
        if !self.claimed.lock().insert(number) {
            return Err(FfsError::Busy(format!("journal device {number} already in use")));
        }
        let claim = DeviceClaim {
            number,
            claimed: Arc::clone(&self.claimed),
        };

        let block_size = fs_dev.block_size();
        let header = read_journal_device_header(raw_dev.as_ref())?;
        if !header.has_incompat(Ext4IncompatFeatures::JOURNAL_DEV) {
            return Err(FfsError::JournalFailure(format!(
                "device {number} is not a journal device"
            )));
        }
        if header.uuid != expected_uuid {
            return Err(FfsError::JournalFailure(format!(
                "journal UUID {} does not match filesystem journal UUID {expected_uuid}",
                header.uuid
            )));
        }
        if header.block_size != block_size {
            return Err(FfsError::JournalFailure(format!(
                "journal device block size {} does not match filesystem block size {block_size}",
                header.block_size
            )));
        }

        let log_dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(Arc::clone(&raw_dev), block_size)?);
        let sb_block = EXT4_SUPERBLOCK_OFFSET as u64 / u64::from(block_size);
        let start = sb_block + 1;
        let len = header.blocks_count.saturating_sub(start);
        let log = Jbd2Log::open(
            log_dev,
            fs_dev,
            LogMap::Offset { start, len },
            writable && !raw_dev.is_read_only(),
        )?;
        if log.superblock().nr_users != 1 {
            return Err(FfsError::JournalFailure(format!(
                "external journal has {} users, expected exactly one",
                log.superblock().nr_users
            )));
        }
        tracing::info!(
            target: "ffs::journal",
            device = %number,
            uuid = %expected_uuid,
            start,
            len,
            "external_journal_opened"
        );
        Ok(Box::new(ClaimedJournal { log, _claim: claim }))
    }
}

fn read_journal_device_header(dev: &dyn ByteDevice) -> Result<Ext4Superblock> {
    let mut region = [0_u8; EXT4_SUPERBLOCK_SIZE];
    dev.read_exact_at(EXT4_SUPERBLOCK_OFFSET as u64, &mut region)
        .map_err(|e| FfsError::JournalFailure(format!("reading journal device header: {e}")))?;
    Ext4Superblock::parse_superblock_region(&region).map_err(|e| {
        FfsError::JournalFailure(format!("external journal has bad superblock: {e}"))
    })
}

impl JournalProvider for Jbd2Provider {
    fn open(
        &self,
        source: &JournalSource,
        fs_dev: Arc<dyn BlockDevice>,
        writable: bool,
    ) -> Result<Box<dyn Journal>> {
        match source {
            JournalSource::Internal { inum, runs } => {
                if runs.is_empty() {
                    return Err(FfsError::JournalFailure(format!(
                        "journal inode {inum} maps no blocks"
                    )));
                }
                let writable = writable && !fs_dev.is_read_only();
                let log = Jbd2Log::open(
                    Arc::clone(&fs_dev),
                    fs_dev,
                    LogMap::Runs(runs.clone()),
                    writable,
                )?;
                Ok(Box::new(log))
            }
            JournalSource::External {
                device,
                expected_uuid,
            } => self.open_external(*device, *expected_uuid, fs_dev, writable),
        }
    }
}

#[derive(Debug)]
struct DeviceClaim {
    number: DeviceNumber,
    claimed: Arc<Mutex<HashSet<DeviceNumber>>>,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.number);
    }
}

/// A log on an external device, holding the device claim while alive.
#[derive(Debug)]
struct ClaimedJournal {
    log: Jbd2Log,
    _claim: DeviceClaim,
}

impl Journal for ClaimedJournal {
    fn needs_recovery(&self) -> bool {
        self.log.needs_recovery()
    }

    fn replay(&mut self) -> Result<RecoveryStats> {
        self.log.replay()
    }

    fn wipe(&mut self) -> Result<()> {
        self.log.wipe()
    }

    fn flush(&mut self) -> Result<()> {
        self.log.flush()
    }

    fn abort(&mut self, errno: i32, reason: &str) {
        self.log.abort(errno, reason);
    }

    fn is_aborted(&self) -> bool {
        self.log.is_aborted()
    }

    fn last_error(&self) -> Option<i32> {
        self.log.last_error()
    }

    fn clear_error(&mut self) -> Result<()> {
        self.log.clear_error()
    }

    fn destroy(&mut self) -> Result<()> {
        self.log.destroy()
    }
}
