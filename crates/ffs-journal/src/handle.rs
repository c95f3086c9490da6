//! Journal lifecycle state machine and the upward error channel.

use crate::{Journal, JournalProvider, JournalSource, RecoveryStats};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalState {
    NoJournal,
    Loading,
    Replaying,
    Active,
    /// Terminal for the lifetime of the handle.
    Aborted,
}

/// A fault the journal detected on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalFault {
    pub errno: i32,
    pub detail: String,
}

/// Receives journal faults. Bound once per mount by the superblock layer.
pub trait JournalErrorSink: Send + Sync {
    fn journal_fault(&self, fault: JournalFault);
}

struct HandleInner {
    state: JournalState,
    journal: Option<Box<dyn Journal>>,
}

/// Owns one opened journal and serializes access to it.
pub struct JournalHandle {
    inner: Mutex<HandleInner>,
    sink: Mutex<Option<Arc<dyn JournalErrorSink>>>,
}

impl std::fmt::Debug for JournalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalHandle")
            .field("state", &self.state())
            .field("sink_bound", &self.sink.lock().is_some())
            .finish()
    }
}

impl JournalHandle {
    /// A handle for a volume without a journal.
    #[must_use]
    pub fn none() -> Self {
        Self {
            inner: Mutex::new(HandleInner {
                state: JournalState::NoJournal,
                journal: None,
            }),
            sink: Mutex::new(None),
        }
    }

    /// Open the journal described by `source`; the handle starts `Loading`.
    pub fn open(
        provider: &dyn JournalProvider,
        source: &JournalSource,
        fs_dev: Arc<dyn BlockDevice>,
        writable: bool,
    ) -> Result<Self> {
        let journal = provider.open(source, fs_dev, writable)?;
        tracing::debug!(target: "ffs::journal", ?source, writable, "journal_opened");
        Ok(Self {
            inner: Mutex::new(HandleInner {
                state: JournalState::Loading,
                journal: Some(journal),
            }),
            sink: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> JournalState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn has_journal(&self) -> bool {
        self.inner.lock().journal.is_some()
    }

    pub fn bind_error_channel(&self, sink: Arc<dyn JournalErrorSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Deliver a self-detected fault. Called with no handle lock held so the
    /// sink may call back into `abort`.
    fn notify(&self, err: &FfsError) {
        let sink = self.sink.lock().clone();
        let fault = JournalFault {
            errno: err.to_errno(),
            detail: err.to_string(),
        };
        tracing::error!(
            target: "ffs::journal",
            errno = fault.errno,
            detail = %fault.detail,
            "journal_fault_detected"
        );
        if let Some(sink) = sink {
            sink.journal_fault(fault);
        }
    }

    fn with_journal<T>(
        &self,
        op: impl FnOnce(&mut dyn Journal, &mut JournalState) -> Result<T>,
    ) -> Result<T> {
        let outcome = {
            let mut inner = self.inner.lock();
            let HandleInner { state, journal } = &mut *inner;
            if *state == JournalState::Aborted {
                return Err(FfsError::AlreadyAborted);
            }
            let Some(journal) = journal.as_deref_mut() else {
                return Err(FfsError::JournalFailure("volume has no journal".to_owned()));
            };
            op(journal, state)
        };
        if let Err(err) = &outcome {
            if !matches!(err, FfsError::AlreadyAborted | FfsError::ReadOnlyRecoveryRefused) {
                self.notify(err);
            }
        }
        outcome
    }

    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.inner
            .lock()
            .journal
            .as_deref()
            .is_some_and(Journal::needs_recovery)
    }

    /// `Loading → Replaying → Active`.
    pub fn replay(&self) -> Result<RecoveryStats> {
        self.with_journal(|journal, state| {
            if *state != JournalState::Loading {
                return Err(FfsError::JournalFailure(format!(
                    "replay requested in state {state:?}"
                )));
            }
            *state = JournalState::Replaying;
            let stats = journal.replay()?;
            *state = JournalState::Active;
            Ok(stats)
        })
    }

    /// `Loading → Active` after discarding any stale log contents.
    pub fn wipe_and_load(&self) -> Result<()> {
        self.with_journal(|journal, state| {
            if *state != JournalState::Loading {
                return Err(FfsError::JournalFailure(format!(
                    "wipe requested in state {state:?}"
                )));
            }
            journal.wipe()?;
            *state = JournalState::Active;
            Ok(())
        })
    }

    pub fn flush(&self) -> Result<()> {
        if !self.has_journal() {
            return Ok(());
        }
        self.with_journal(|journal, _| journal.flush())
    }

    /// Requested from above: no notification is sent back up.
    pub fn abort(&self, errno: i32, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state == JournalState::Aborted {
            return;
        }
        if let Some(journal) = inner.journal.as_deref_mut() {
            journal.abort(errno, reason);
            inner.state = JournalState::Aborted;
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state() == JournalState::Aborted
    }

    #[must_use]
    pub fn last_error(&self) -> Option<i32> {
        self.inner
            .lock()
            .journal
            .as_deref()
            .and_then(Journal::last_error)
    }

    pub fn clear_error(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.journal.as_deref_mut() {
            Some(journal) => journal.clear_error(),
            None => Ok(()),
        }
    }

    /// Flush and release the journal. The handle ends in `NoJournal`.
    pub fn destroy(&self) -> Result<()> {
        let taken = {
            let mut inner = self.inner.lock();
            inner.state = JournalState::NoJournal;
            inner.journal.take()
        };
        let Some(mut journal) = taken else {
            return Ok(());
        };
        let result = journal.destroy();
        if let Err(err) = &result {
            if !matches!(err, FfsError::AlreadyAborted) {
                self.notify(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryJournalProvider, MemoryJournalState};
    use ffs_block::{ByteBlockDevice, MemoryByteDevice};

    #[derive(Default)]
    struct RecordingSink {
        faults: Mutex<Vec<JournalFault>>,
    }

    impl JournalErrorSink for RecordingSink {
        fn journal_fault(&self, fault: JournalFault) {
            self.faults.lock().push(fault);
        }
    }

    fn fs_dev() -> Arc<dyn BlockDevice> {
        Arc::new(ByteBlockDevice::new(MemoryByteDevice::new(8192), 1024).expect("dev"))
    }

    fn open(provider: &MemoryJournalProvider) -> JournalHandle {
        JournalHandle::open(
            provider,
            &JournalSource::Internal { inum: 8, runs: Vec::new() },
            fs_dev(),
            true,
        )
        .expect("open")
    }

    #[test]
    fn replay_moves_loading_to_active() {
        let provider = MemoryJournalProvider::new(MemoryJournalState::default());
        let handle = open(&provider);
        assert_eq!(handle.state(), JournalState::Loading);
        handle.replay().expect("replay");
        assert_eq!(handle.state(), JournalState::Active);
        assert!(handle.replay().is_err());
    }

    #[test]
    fn none_handle_has_nothing_to_flush() {
        let handle = JournalHandle::none();
        assert_eq!(handle.state(), JournalState::NoJournal);
        handle.flush().expect("flush");
        handle.destroy().expect("destroy");
        assert!(handle.replay().is_err());
    }

    #[test]
    fn abort_is_terminal_and_silent() {
        let provider = MemoryJournalProvider::new(MemoryJournalState::default());
        let handle = open(&provider);
        let sink = Arc::new(RecordingSink::default());
        handle.bind_error_channel(Arc::clone(&sink) as Arc<dyn JournalErrorSink>);
        handle.wipe_and_load().expect("load");

        handle.abort(-5, "remount-ro"); // -EIO
        assert!(handle.is_aborted());
        assert!(matches!(handle.flush(), Err(FfsError::AlreadyAborted)));
        assert!(sink.faults.lock().is_empty());
        assert!(provider.state().lock().aborted);
    }

    #[test]
    fn flush_failure_is_reported_once_per_failure() {
        let provider = MemoryJournalProvider::new(MemoryJournalState::default());
        let handle = open(&provider);
        let sink = Arc::new(RecordingSink::default());
        handle.bind_error_channel(Arc::clone(&sink) as Arc<dyn JournalErrorSink>);
        handle.wipe_and_load().expect("load");

        provider.state().lock().fail_flush = true;
        assert!(handle.flush().is_err());
        let faults = sink.faults.lock().clone();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].errno, 5);
    }
}
