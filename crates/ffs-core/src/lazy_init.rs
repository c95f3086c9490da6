//! Lazy background inode-table initialization.
//!
//! One worker thread serves every registered volume. The registry owns a
//! lock of its own: the worker is spawned on the first registration and
//! exits, clearing its slot under that lock, once no requests remain. A
//! worker that unwinds clears its slot too. Volumes talk to the worker only
//! through messages, which it handles between any two requests.
//!
//! Each request zeroes one group per run. The first run is scheduled after a
//! random delay; its duration times the volume's multiplier becomes the gap
//! between later runs.

use ffs_error::{FfsError, Result};
use ffs_types::GroupNumber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on the random delay before a volume's first run.
pub const DEFAULT_MAX_START_DELAY: Duration = Duration::from_secs(5);

/// Registry key for one mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u64);

/// Result of one initialization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyInitStep {
    Initialized(GroupNumber),
    /// No uninitialized group is left.
    Done,
}

/// A volume with inode tables left to zero.
pub trait LazyInitTarget: Send + Sync {
    /// Zero the next uninitialized group.
    fn init_next_group(&self) -> Result<LazyInitStep>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyInitConfig {
    pub max_start_delay: Duration,
}

impl Default for LazyInitConfig {
    fn default() -> Self {
        Self {
            max_start_delay: DEFAULT_MAX_START_DELAY,
        }
    }
}

/// One volume's registration.
pub struct LazyInitRequest {
    pub id: VolumeId,
    pub target: Arc<dyn LazyInitTarget>,
    pub multiplier: u32,
    pub max_start_delay: Duration,
}

impl std::fmt::Debug for LazyInitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyInitRequest")
            .field("id", &self.id)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

enum Message {
    /// A volume that is already scheduled only has its timing reset.
    Register { request: LazyInitRequest, ticket: u64 },
    Unregister { id: VolumeId, ack: SyncSender<()> },
    Shutdown { ack: SyncSender<()> },
}

struct WorkerSlot {
    generation: u64,
    tx: Sender<Message>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    worker: Option<WorkerSlot>,
    /// Each registration's ticket. A worker finishing a request only
    /// deregisters it if no newer registration arrived meanwhile.
    registered: HashMap<VolumeId, u64>,
    next_ticket: u64,
    next_generation: u64,
}

#[derive(Default)]
struct RegistryShared {
    state: Mutex<RegistryState>,
}

/// Process-wide (or test-local) set of lazy-init requests.
#[derive(Clone, Default)]
pub struct LazyInitRegistry {
    shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for LazyInitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LazyInitRegistry")
            .field("registered", &state.registered.len())
            .field("worker_running", &state.worker.is_some())
            .finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<LazyInitRegistry> = OnceLock::new();

impl LazyInitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every volume in this process.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_REGISTRY.get_or_init(Self::new).clone()
    }

    #[must_use]
    pub fn is_registered(&self, id: VolumeId) -> bool {
        self.shared.state.lock().registered.contains_key(&id)
    }

    #[must_use]
    pub fn worker_running(&self) -> bool {
        self.shared.state.lock().worker.is_some()
    }

    /// Register a volume, spawning the worker if none is running. A volume
    /// that is already registered only has its timing reset.
    pub fn register(&self, request: LazyInitRequest) -> Result<()> {
        let mut state = self.shared.state.lock();
        let id = request.id;
        let reset = state.registered.contains_key(&id);
        state.next_ticket += 1;
        let ticket = state.next_ticket;

        let mut msg = Message::Register { request, ticket };
        // A worker that died without clearing its slot is replaced once.
        for _ in 0..2 {
            if state.worker.is_none() {
                let slot = self.spawn_worker(&mut state)?;
                state.worker = Some(slot);
            }
            let Some(worker) = &state.worker else {
                continue;
            };
            match worker.tx.send(msg) {
                Ok(()) => {
                    state.registered.insert(id, ticket);
                    if reset {
                        tracing::debug!(target: "ffs::lazy_init", volume = id.0, "lazy_init_timing_reset");
                    } else {
                        tracing::info!(target: "ffs::lazy_init", volume = id.0, "lazy_init_registered");
                    }
                    return Ok(());
                }
                Err(mpsc::SendError(returned)) => {
                    msg = returned;
                    state.worker = None;
                }
            }
        }
        state.registered.remove(&id);
        Err(FfsError::Busy("lazy init worker is gone".to_owned()))
    }

    /// Drop a volume's request and wait for the worker to acknowledge.
    ///
    /// The worker answers between two requests, so the wait is at most one
    /// group's worth of work. Must not be called while holding a lock
    /// `init_next_group` takes.
    pub fn unregister(&self, id: VolumeId) {
        let ack_rx = {
            let mut state = self.shared.state.lock();
            if state.registered.remove(&id).is_none() {
                return;
            }
            let Some(worker) = &state.worker else {
                return;
            };
            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            if worker
                .tx
                .send(Message::Unregister { id, ack: ack_tx })
                .is_err()
            {
                return;
            }
            ack_rx
        };
        // An exiting worker drops the ack sender; either way we are done.
        let _ = ack_rx.recv();
        tracing::info!(target: "ffs::lazy_init", volume = id.0, "lazy_init_unregistered");
    }

    /// Stop the worker and forget every request.
    pub fn shutdown(&self) {
        let slot = {
            let mut state = self.shared.state.lock();
            state.registered.clear();
            state.worker.take()
        };
        let Some(slot) = slot else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if slot.tx.send(Message::Shutdown { ack: ack_tx }).is_ok() {
            let _ = ack_rx.recv();
        }
        if slot.thread.join().is_err() {
            tracing::warn!(target: "ffs::lazy_init", "lazy_init_worker_panicked");
        }
    }

    fn spawn_worker(&self, state: &mut RegistryState) -> Result<WorkerSlot> {
        state.next_generation += 1;
        let generation = state.next_generation;
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("ffs-lazyinit".to_owned())
            .spawn(move || Worker::new(shared, rx, generation).run())?;
        tracing::debug!(target: "ffs::lazy_init", generation, "lazy_init_worker_started");
        Ok(WorkerSlot {
            generation,
            tx,
            thread,
        })
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

struct Scheduled {
    request: LazyInitRequest,
    ticket: u64,
    next_run: Instant,
    /// Gap between runs, measured on the first run.
    timeout: Option<Duration>,
}

struct Worker {
    shared: Arc<RegistryShared>,
    rx: Receiver<Message>,
    generation: u64,
    requests: Vec<Scheduled>,
}

impl Worker {
    fn new(shared: Arc<RegistryShared>, rx: Receiver<Message>, generation: u64) -> Self {
        Self {
            shared,
            rx,
            generation,
            requests: Vec::new(),
        }
    }

    fn run(mut self) {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                if !self.handle(msg) {
                    return;
                }
            }
            // One request per pass; messages are handled in between.
            if self.run_next_due() {
                continue;
            }

            if self.requests.is_empty() {
                // Exit under the registry lock so no registration can slip
                // in between the last check and clearing the slot.
                let mut state = self.shared.state.lock();
                match self.rx.try_recv() {
                    Ok(msg) => {
                        drop(state);
                        if !self.handle(msg) {
                            return;
                        }
                        continue;
                    }
                    Err(_) => {
                        state.worker = None;
                        tracing::debug!(target: "ffs::lazy_init", "lazy_init_worker_exiting");
                        return;
                    }
                }
            }

            let now = Instant::now();
            let wait = self
                .requests
                .iter()
                .map(|s| s.next_run.saturating_duration_since(now))
                .min()
                .unwrap_or_default();
            match self.rx.recv_timeout(wait) {
                Ok(msg) => {
                    if !self.handle(msg) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Returns `false` when the worker must stop.
    fn handle(&mut self, msg: Message) -> bool {
        match msg {
            Message::Register { request, ticket } => {
                if let Some(s) = self.requests.iter_mut().find(|s| s.request.id == request.id) {
                    s.ticket = ticket;
                    s.timeout = None;
                } else {
                    let delay = random_delay(request.max_start_delay);
                    self.requests.push(Scheduled {
                        request,
                        ticket,
                        next_run: Instant::now() + delay,
                        timeout: None,
                    });
                }
            }
            Message::Unregister { id, ack } => {
                self.requests.retain(|s| s.request.id != id);
                let _ = ack.send(());
            }
            Message::Shutdown { ack } => {
                self.requests.clear();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    /// Step the most overdue request. Returns whether one was due.
    fn run_next_due(&mut self) -> bool {
        let now = Instant::now();
        let Some(idx) = self
            .requests
            .iter()
            .enumerate()
            .filter(|(_, s)| s.next_run <= now)
            .min_by_key(|(_, s)| s.next_run)
            .map(|(idx, _)| idx)
        else {
            return false;
        };
        let started = Instant::now();
        let step = self.requests[idx].request.target.init_next_group();
        let id = self.requests[idx].request.id;
        match step {
            Ok(LazyInitStep::Initialized(group)) => {
                let scheduled = &mut self.requests[idx];
                let timeout = *scheduled.timeout.get_or_insert_with(|| {
                    started.elapsed() * scheduled.request.multiplier.max(1)
                });
                scheduled.next_run = Instant::now() + timeout;
                tracing::trace!(
                    target: "ffs::lazy_init",
                    volume = id.0,
                    group = group.0,
                    "lazy_init_group_done"
                );
            }
            Ok(LazyInitStep::Done) => {
                tracing::info!(target: "ffs::lazy_init", volume = id.0, "lazy_init_complete");
                self.finish(idx);
            }
            Err(err) => {
                tracing::error!(
                    target: "ffs::lazy_init",
                    volume = id.0,
                    error = %err,
                    "lazy_init_failed"
                );
                self.finish(idx);
            }
        }
        true
    }

    fn finish(&mut self, idx: usize) {
        let scheduled = self.requests.remove(idx);
        let mut state = self.shared.state.lock();
        forget(&mut state, &scheduled);
    }
}

/// Drop `scheduled`'s registration unless a newer one replaced it.
fn forget(state: &mut RegistryState, scheduled: &Scheduled) {
    let id = scheduled.request.id;
    if state.registered.get(&id) == Some(&scheduled.ticket) {
        state.registered.remove(&id);
    }
}

impl Drop for Worker {
    /// Runs on every exit, unwinding included, so a worker that panicked
    /// never leaves a dead slot behind.
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state
            .worker
            .as_ref()
            .is_some_and(|slot| slot.generation == self.generation)
        {
            state.worker = None;
            if std::thread::panicking() {
                tracing::error!(target: "ffs::lazy_init", generation = self.generation, "lazy_init_worker_panicked");
            }
        }
        for scheduled in &self.requests {
            forget(&mut state, scheduled);
        }
    }
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct CountingTarget {
        remaining: AtomicU32,
        done: AtomicU32,
        fail_at: Option<u32>,
    }

    impl CountingTarget {
        fn new(groups: u32) -> Arc<Self> {
            Arc::new(Self {
                remaining: AtomicU32::new(groups),
                done: AtomicU32::new(0),
                fail_at: None,
            })
        }
    }

    impl LazyInitTarget for CountingTarget {
        fn init_next_group(&self) -> Result<LazyInitStep> {
            let done = self.done.load(Ordering::SeqCst);
            if self.fail_at == Some(done) {
                return Err(FfsError::IoFailure {
                    block: 0,
                    detail: "injected".to_owned(),
                });
            }
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(LazyInitStep::Done);
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(LazyInitStep::Initialized(GroupNumber(done)))
        }
    }

    fn request(id: u64, target: Arc<dyn LazyInitTarget>) -> LazyInitRequest {
        LazyInitRequest {
            id: VolumeId(id),
            target,
            multiplier: 1,
            max_start_delay: Duration::ZERO,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn every_group_initialized_then_worker_exits() {
        let registry = LazyInitRegistry::new();
        let a = CountingTarget::new(7);
        let b = CountingTarget::new(3);
        registry
            .register(request(1, Arc::clone(&a) as Arc<dyn LazyInitTarget>))
            .expect("register a");
        registry
            .register(request(2, Arc::clone(&b) as Arc<dyn LazyInitTarget>))
            .expect("register b");
        assert!(wait_until(|| !registry.is_registered(VolumeId(1))
            && !registry.is_registered(VolumeId(2))));
        assert_eq!(a.done.load(Ordering::SeqCst), 7);
        assert_eq!(b.done.load(Ordering::SeqCst), 3);
        assert!(wait_until(|| !registry.worker_running()));
    }

    #[test]
    fn failing_target_is_dropped() {
        let registry = LazyInitRegistry::new();
        let target = Arc::new(CountingTarget {
            remaining: AtomicU32::new(10),
            done: AtomicU32::new(0),
            fail_at: Some(2),
        });
        registry
            .register(request(9, Arc::clone(&target) as Arc<dyn LazyInitTarget>))
            .expect("register");
        assert!(wait_until(|| !registry.is_registered(VolumeId(9))));
        assert_eq!(target.done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_waits_for_worker() {
        let registry = LazyInitRegistry::new();
        let target = CountingTarget::new(1_000_000);
        registry
            .register(LazyInitRequest {
                max_start_delay: Duration::from_secs(3600),
                ..request(4, Arc::clone(&target) as Arc<dyn LazyInitTarget>)
            })
            .expect("register");
        assert!(registry.is_registered(VolumeId(4)));
        registry.unregister(VolumeId(4));
        assert!(!registry.is_registered(VolumeId(4)));
        assert!(wait_until(|| !registry.worker_running()));
        // Unknown ids are ignored.
        registry.unregister(VolumeId(77));
    }

    struct PanickingTarget;

    impl LazyInitTarget for PanickingTarget {
        fn init_next_group(&self) -> Result<LazyInitStep> {
            panic!("inode table write blew up");
        }
    }

    #[test]
    fn panicked_worker_frees_its_slot() {
        let registry = LazyInitRegistry::new();
        registry
            .register(request(1, Arc::new(PanickingTarget)))
            .expect("register");
        assert!(wait_until(|| !registry.worker_running()));
        assert!(!registry.is_registered(VolumeId(1)));

        let target = CountingTarget::new(2);
        registry
            .register(request(2, Arc::clone(&target) as Arc<dyn LazyInitTarget>))
            .expect("register after panic");
        assert!(wait_until(|| !registry.is_registered(VolumeId(2))));
        assert_eq!(target.done.load(Ordering::SeqCst), 2);
    }

    /// Reports `Done`, the first time only after `release` is set.
    #[derive(Default)]
    struct HeldDone {
        calls: AtomicU32,
        release: AtomicBool,
    }

    impl LazyInitTarget for HeldDone {
        fn init_next_group(&self) -> Result<LazyInitStep> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                wait_until(|| self.release.load(Ordering::SeqCst));
            }
            Ok(LazyInitStep::Done)
        }
    }

    #[test]
    fn reregistration_while_finishing_is_not_lost() {
        let registry = LazyInitRegistry::new();
        let target = Arc::new(HeldDone::default());
        registry
            .register(request(3, Arc::clone(&target) as Arc<dyn LazyInitTarget>))
            .expect("register");
        assert!(wait_until(|| target.calls.load(Ordering::SeqCst) == 1));

        // The worker is inside the last step when the volume asks again.
        registry
            .register(request(3, Arc::clone(&target) as Arc<dyn LazyInitTarget>))
            .expect("register again");
        target.release.store(true, Ordering::SeqCst);

        assert!(wait_until(|| target.calls.load(Ordering::SeqCst) == 2));
        assert!(wait_until(|| !registry.is_registered(VolumeId(3))));
        assert!(wait_until(|| !registry.worker_running()));
    }

    /// Two volumes share one of these. The first step blocks until
    /// `release`; the second records whether an unregistration was already
    /// acknowledged when it started.
    #[derive(Default)]
    struct Handoff {
        entered: AtomicU32,
        release: AtomicBool,
        acked: AtomicBool,
        saw_ack: AtomicBool,
    }

    struct HandoffTarget(Arc<Handoff>);

    impl LazyInitTarget for HandoffTarget {
        fn init_next_group(&self) -> Result<LazyInitStep> {
            let shared = &self.0;
            if shared.entered.fetch_add(1, Ordering::SeqCst) == 0 {
                wait_until(|| shared.release.load(Ordering::SeqCst));
            } else {
                let acked = wait_until(|| shared.acked.load(Ordering::SeqCst));
                shared.saw_ack.store(acked, Ordering::SeqCst);
            }
            Ok(LazyInitStep::Done)
        }
    }

    #[test]
    fn unregister_is_answered_between_requests() {
        let registry = LazyInitRegistry::new();
        let handoff = Arc::new(Handoff::default());
        for id in [1, 2] {
            registry
                .register(request(id, Arc::new(HandoffTarget(Arc::clone(&handoff)))))
                .expect("register busy volume");
        }
        registry
            .register(LazyInitRequest {
                max_start_delay: Duration::from_secs(3600),
                ..request(3, CountingTarget::new(1) as Arc<dyn LazyInitTarget>)
            })
            .expect("register idle volume");
        assert!(wait_until(|| handoff.entered.load(Ordering::SeqCst) == 1));

        let unregistering = {
            let registry = registry.clone();
            let handoff = Arc::clone(&handoff);
            std::thread::spawn(move || {
                registry.unregister(VolumeId(3));
                handoff.acked.store(true, Ordering::SeqCst);
            })
        };
        // Deregistration and the message to the worker happen under one
        // lock, so once it shows here the request is queued.
        assert!(wait_until(|| !registry.is_registered(VolumeId(3))));
        handoff.release.store(true, Ordering::SeqCst);
        unregistering.join().expect("unregister thread");

        assert!(wait_until(|| !registry.is_registered(VolumeId(1))
            && !registry.is_registered(VolumeId(2))));
        assert_eq!(handoff.entered.load(Ordering::SeqCst), 2);
        assert!(handoff.saw_ack.load(Ordering::SeqCst));
    }

    #[test]
    fn reregistration_resets_timing_only() {
        let registry = LazyInitRegistry::new();
        let target = CountingTarget::new(1_000_000);
        let req = || LazyInitRequest {
            max_start_delay: Duration::from_secs(3600),
            ..request(5, Arc::clone(&target) as Arc<dyn LazyInitTarget>)
        };
        registry.register(req()).expect("first");
        registry.register(req()).expect("second");
        assert!(registry.is_registered(VolumeId(5)));
        registry.shutdown();
        assert!(!registry.worker_running());
        assert!(!registry.is_registered(VolumeId(5)));
    }
}
