//! Scripted in-memory journal.
//!
//! The state lives behind an `Arc<Mutex<_>>` shared by the provider and every
//! journal it opens, so a test can preload pending blocks or inject failures
//! before a mount and inspect the counters afterwards.

use crate::{Journal, JournalProvider, JournalSource, RecoveryStats};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct MemoryJournalState {
    /// Blocks a replay writes into the filesystem device.
    pub pending: Vec<(u64, Vec<u8>)>,
    pub errno: i32,
    pub aborted: bool,
    pub fail_open: Option<String>,
    pub fail_replay: bool,
    pub fail_flush: bool,
    pub opens: u32,
    pub replays: u32,
    pub wipes: u32,
    pub flushes: u32,
    pub destroyed: bool,
    pub last_source: Option<JournalSource>,
}

#[derive(Debug, Clone)]
pub struct MemoryJournalProvider {
    state: Arc<Mutex<MemoryJournalState>>,
}

impl MemoryJournalProvider {
    #[must_use]
    pub fn new(state: MemoryJournalState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<Mutex<MemoryJournalState>> {
        &self.state
    }
}

impl JournalProvider for MemoryJournalProvider {
    fn open(
        &self,
        source: &JournalSource,
        fs_dev: Arc<dyn BlockDevice>,
        writable: bool,
    ) -> Result<Box<dyn Journal>> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fail_open {
            return Err(FfsError::JournalFailure(reason.clone()));
        }
        state.opens += 1;
        state.aborted = false;
        state.destroyed = false;
        state.last_source = Some(source.clone());
        drop(state);
        Ok(Box::new(MemoryJournal {
            state: Arc::clone(&self.state),
            fs_dev,
            writable,
            aborted: false,
        }))
    }
}

pub struct MemoryJournal {
    state: Arc<Mutex<MemoryJournalState>>,
    fs_dev: Arc<dyn BlockDevice>,
    writable: bool,
    aborted: bool,
}

impl std::fmt::Debug for MemoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJournal")
            .field("writable", &self.writable)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

impl Journal for MemoryJournal {
    fn needs_recovery(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    fn replay(&mut self) -> Result<RecoveryStats> {
        if !self.writable {
            return Err(FfsError::ReadOnlyRecoveryRefused);
        }
        let pending = {
            let mut state = self.state.lock();
            state.replays += 1;
            if state.fail_replay {
                return Err(FfsError::JournalFailure("injected replay failure".to_owned()));
            }
            std::mem::take(&mut state.pending)
        };
        let mut stats = RecoveryStats {
            transactions: u32::from(!pending.is_empty()),
            ..RecoveryStats::default()
        };
        for (block, data) in pending {
            self.fs_dev.write_block(BlockNumber(block), &data)?;
            stats.blocks_replayed += 1;
        }
        self.fs_dev.sync()?;
        Ok(stats)
    }

    fn wipe(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.wipes += 1;
        if self.writable {
            state.pending.clear();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.aborted {
            return Err(FfsError::AlreadyAborted);
        }
        let mut state = self.state.lock();
        if state.fail_flush {
            return Err(FfsError::IoFailure {
                block: 0,
                detail: "injected journal flush failure".to_owned(),
            });
        }
        state.flushes += 1;
        Ok(())
    }

    fn abort(&mut self, errno: i32, _reason: &str) {
        self.aborted = true;
        let mut state = self.state.lock();
        state.aborted = true;
        if state.errno == 0 {
            state.errno = errno;
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn last_error(&self) -> Option<i32> {
        let errno = self.state.lock().errno;
        (errno != 0).then_some(errno)
    }

    fn clear_error(&mut self) -> Result<()> {
        self.state.lock().errno = 0;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.aborted {
            return Err(FfsError::AlreadyAborted);
        }
        self.flush()?;
        self.state.lock().destroyed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_block::{ByteBlockDevice, MemoryByteDevice};

    #[test]
    fn replay_writes_pending_blocks() {
        let mem = Arc::new(MemoryByteDevice::new(4096));
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(Arc::clone(&mem), 1024).expect("dev"));
        let provider = MemoryJournalProvider::new(MemoryJournalState {
            pending: vec![(2, vec![0x42; 1024])],
            ..MemoryJournalState::default()
        });
        let mut journal = provider
            .open(&JournalSource::Internal { inum: 8, runs: Vec::new() }, dev, true)
            .expect("open");
        assert!(journal.needs_recovery());
        let stats = journal.replay().expect("replay");
        assert_eq!(stats.blocks_replayed, 1);
        assert!(!journal.needs_recovery());
        assert_eq!(mem.snapshot()[2048], 0x42);
    }

    #[test]
    fn errno_survives_until_cleared() {
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(MemoryByteDevice::new(4096), 1024).expect("dev"));
        let provider = MemoryJournalProvider::new(MemoryJournalState {
            errno: -30,
            ..MemoryJournalState::default()
        });
        let mut journal = provider
            .open(&JournalSource::Internal { inum: 8, runs: Vec::new() }, dev, true)
            .expect("open");
        assert_eq!(journal.last_error(), Some(-30));
        journal.clear_error().expect("clear");
        assert_eq!(provider.state().lock().errno, 0);
    }
}
