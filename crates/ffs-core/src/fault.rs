//! Error/Fault Controller.
//!
//! Every metadata fault found after mount is reported here. The controller
//! records it in the superblock's diagnostic fields, persists the record,
//! and then applies the volume's error policy:
//!
//! | Policy | Action |
//! |--------|--------|
//! | `Continue` | keep running writable |
//! | `RemountReadOnly` | abort the journal, force read-only |
//! | `Panic` | abort the journal, force read-only, then halt the process |
//!
//! State progresses `Clean → ErrorFlagged → ReadOnlyForced → Aborted` and
//! never moves backwards within a mount.

use crate::gdt::FreeCounters;
use crate::options::ErrorPolicy;
use crate::superblock::{PersistContext, SuperblockRecord, unix_now};
use ffs_block::BlockDevice;
use ffs_error::FfsError;
use ffs_journal::{JournalErrorSink, JournalFault, JournalHandle};
use ffs_ondisk::ErrorSite;
use ffs_types::EXT4_ERROR_FS;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// errno recorded in the journal when the volume aborts it.
const EIO: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaultState {
    Clean,
    ErrorFlagged,
    ReadOnlyForced,
    Aborted,
}

/// What the caller must do after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultAction {
    Continue,
    RemountReadOnly,
    /// The halt handler has been invoked. Only reachable when the handler
    /// returns, which the process-exit handler never does.
    Halt,
}

/// Where a fault was noticed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorHint {
    pub function: String,
    pub line: u32,
    pub inode: Option<u32>,
    pub block: Option<u64>,
}

impl ErrorHint {
    #[must_use]
    pub fn new(function: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            line,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn inode(mut self, ino: u32) -> Self {
        self.inode = Some(ino);
        self
    }

    #[must_use]
    pub fn block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }

    fn site(&self, time: u32) -> ErrorSite {
        ErrorSite {
            time,
            ino: self.inode.unwrap_or(0),
            block: self.block.unwrap_or(0),
            func: self.function.clone(),
            line: self.line,
        }
    }
}

/// Terminates the process for the `Panic` policy.
pub trait HaltHandler: Send + Sync {
    fn halt(&self, reason: &str);
}

/// Default halt: log and exit with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl HaltHandler for ProcessExit {
    fn halt(&self, reason: &str) {
        tracing::error!(target: "ffs::fault", reason, "halting_on_error_policy_panic");
        std::process::exit(1);
    }
}

/// The pieces of a volume a report touches.
pub struct FaultContext<'a> {
    pub record: &'a mut SuperblockRecord,
    pub dev: &'a dyn BlockDevice,
    pub journal: &'a JournalHandle,
    pub counters: Option<FreeCounters>,
    pub read_only: &'a mut bool,
}

impl std::fmt::Debug for FaultContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultContext")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

// ── Journal error channel ───────────────────────────────────────────────────

/// Queue the journal pushes its own faults into. Drained by the volume
/// after each journal operation, under the volume lock.
#[derive(Debug, Default)]
pub struct JournalFaultQueue {
    faults: Mutex<Vec<JournalFault>>,
}

impl JournalFaultQueue {
    pub fn take(&self) -> Vec<JournalFault> {
        std::mem::take(&mut *self.faults.lock())
    }
}

impl JournalErrorSink for JournalFaultQueue {
    fn journal_fault(&self, fault: JournalFault) {
        self.faults.lock().push(fault);
    }
}

// ── Periodic error report ───────────────────────────────────────────────────

/// Delays for the periodic "filesystem has errors" log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportTimerConfig {
    pub first: Duration,
    pub interval: Duration,
}

impl Default for ReportTimerConfig {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(300),
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What the timer logs each time it fires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSummary {
    pub error_count: u32,
    pub first_error: ErrorSite,
    pub last_error: ErrorSite,
}

#[derive(Debug, Default)]
struct TimerState {
    stop: bool,
    summary: ErrorSummary,
    fired: u64,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: std::sync::Mutex<TimerState>,
    wake: Condvar,
}

/// Background thread that periodically logs the error summary while the
/// volume carries a nonzero error count.
#[derive(Debug)]
pub struct ErrorReportTimer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl ErrorReportTimer {
    pub fn start(config: ReportTimerConfig, summary: ErrorSummary) -> ffs_error::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: std::sync::Mutex::new(TimerState {
                summary,
                ..TimerState::default()
            }),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("ffs-err-report".to_owned())
            .spawn(move || run_report_timer(&worker, config))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn update(&self, summary: ErrorSummary) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.summary = summary;
    }

    /// Number of times the report has been logged.
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fired
    }

    pub fn stop(&mut self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.stop = true;
        }
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(target: "ffs::fault", "error_report_thread_panicked");
            }
        }
    }
}

impl Drop for ErrorReportTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_report_timer(shared: &TimerShared, config: ReportTimerConfig) {
    let mut deadline = Instant::now() + config.first;
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        let now = Instant::now();
        if !state.stop && now < deadline {
            state = shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }
        if state.stop {
            return;
        }
        let summary = &state.summary;
        if summary.error_count > 0 {
            tracing::warn!(
                target: "ffs::fault",
                error_count = summary.error_count,
                first_error_time = summary.first_error.time,
                first_error_func = %summary.first_error.func,
                first_error_line = summary.first_error.line,
                last_error_time = summary.last_error.time,
                last_error_func = %summary.last_error.func,
                last_error_line = summary.last_error.line,
                "error_count_since_last_fsck"
            );
        }
        state.fired += 1;
        deadline += config.interval;
    }
}

// ── Controller ──────────────────────────────────────────────────────────────

pub struct FaultController {
    policy: ErrorPolicy,
    halt: Arc<dyn HaltHandler>,
    timer_config: ReportTimerConfig,
    timer: Option<ErrorReportTimer>,
    queue: Arc<JournalFaultQueue>,
    aborted: bool,
    forced_read_only: bool,
}

impl std::fmt::Debug for FaultController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultController")
            .field("policy", &self.policy)
            .field("timer_running", &self.timer.is_some())
            .field("aborted", &self.aborted)
            .field("forced_read_only", &self.forced_read_only)
            .finish_non_exhaustive()
    }
}

impl FaultController {
    #[must_use]
    pub fn new(
        policy: ErrorPolicy,
        halt: Arc<dyn HaltHandler>,
        timer_config: ReportTimerConfig,
    ) -> Self {
        Self {
            policy,
            halt,
            timer_config,
            timer: None,
            queue: Arc::new(JournalFaultQueue::default()),
            aborted: false,
            forced_read_only: false,
        }
    }

    #[must_use]
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ErrorPolicy) {
        self.policy = policy;
    }

    /// The sink to bind on the volume's journal handle.
    #[must_use]
    pub fn journal_sink(&self) -> Arc<dyn JournalErrorSink> {
        Arc::clone(&self.queue) as Arc<dyn JournalErrorSink>
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    #[must_use]
    pub fn state(&self, record: &SuperblockRecord) -> FaultState {
        if self.aborted {
            FaultState::Aborted
        } else if self.forced_read_only {
            FaultState::ReadOnlyForced
        } else if record.mount_state() & EXT4_ERROR_FS != 0 {
            FaultState::ErrorFlagged
        } else {
            FaultState::Clean
        }
    }

    #[must_use]
    pub fn timer(&self) -> Option<&ErrorReportTimer> {
        self.timer.as_ref()
    }

    /// Arm the periodic report when the record already carries errors.
    pub fn consult_persisted(&mut self, record: &SuperblockRecord) -> ffs_error::Result<bool> {
        if record.superblock().error_count == 0 || self.timer.is_some() {
            return Ok(false);
        }
        self.timer = Some(ErrorReportTimer::start(
            self.timer_config,
            summary_of(record),
        )?);
        Ok(true)
    }

    pub fn stop_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
    }

    /// Record `err` and apply the error policy.
    pub fn report(
        &mut self,
        ctx: &mut FaultContext<'_>,
        err: &FfsError,
        hint: &ErrorHint,
    ) -> FaultAction {
        tracing::error!(
            target: "ffs::fault",
            function = %hint.function,
            line = hint.line,
            inode = hint.inode,
            block = hint.block,
            error = %err,
            "filesystem_error"
        );
        let first = ctx.record.superblock().error_count == 0;
        ctx.record.record_error(hint.site(unix_now()));
        self.persist_best_effort(ctx);
        if first {
            if let Err(e) = self.consult_persisted(ctx.record) {
                tracing::warn!(target: "ffs::fault", error = %e, "error_report_timer_not_started");
            }
        } else if let Some(timer) = &self.timer {
            timer.update(summary_of(ctx.record));
        }
        self.apply_policy(ctx, &err.to_string())
    }

    fn persist_best_effort(&self, ctx: &mut FaultContext<'_>) {
        if let Err(e) = ctx.record.persist(
            ctx.dev,
            PersistContext {
                counters: ctx.counters,
                read_only: *ctx.read_only,
            },
            true,
        ) {
            tracing::warn!(target: "ffs::fault", error = %e, "error_record_not_persisted");
        }
    }

    /// Apply the configured policy. A read-only volume only continues.
    pub fn apply_policy(&mut self, ctx: &mut FaultContext<'_>, reason: &str) -> FaultAction {
        if *ctx.read_only {
            return FaultAction::Continue;
        }
        match self.policy {
            ErrorPolicy::Continue => FaultAction::Continue,
            ErrorPolicy::RemountReadOnly => {
                tracing::error!(target: "ffs::fault", reason, "remounting_filesystem_read_only");
                ctx.journal.abort(-EIO, reason);
                self.forced_read_only = true;
                *ctx.read_only = true;
                FaultAction::RemountReadOnly
            }
            ErrorPolicy::Panic => {
                ctx.journal.abort(-EIO, reason);
                // Writes stay off if the handler returns.
                self.forced_read_only = true;
                *ctx.read_only = true;
                self.halt.halt(reason);
                FaultAction::Halt
            }
        }
    }

    /// Irreversible stop: abort the journal and force read-only.
    pub fn abort(&mut self, ctx: &mut FaultContext<'_>, reason: &str) {
        tracing::error!(target: "ffs::fault", reason, "filesystem_aborted");
        self.aborted = true;
        *ctx.read_only = true;
        ctx.journal.abort(-EIO, reason);
    }

    /// Log a warning; state is unchanged.
    pub fn warning(&self, hint: &ErrorHint, message: &str) {
        tracing::warn!(
            target: "ffs::fault",
            function = %hint.function,
            line = hint.line,
            inode = hint.inode,
            block = hint.block,
            message,
            "filesystem_warning"
        );
    }

    /// Report every fault the journal queued since the last drain.
    pub fn drain_journal_faults(&mut self, ctx: &mut FaultContext<'_>) -> Vec<FaultAction> {
        self.queue
            .take()
            .into_iter()
            .map(|fault| {
                let err = FfsError::JournalFailure(format!(
                    "journal fault (errno {}): {}",
                    fault.errno, fault.detail
                ));
                self.report(ctx, &err, &ErrorHint::new("journal", 0))
            })
            .collect()
    }
}

fn summary_of(record: &SuperblockRecord) -> ErrorSummary {
    let sb = record.superblock();
    ErrorSummary {
        error_count: sb.error_count,
        first_error: sb.first_error.clone(),
        last_error: sb.last_error.clone(),
    }
}
