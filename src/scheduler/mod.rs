//! Cooperative scheduler driving filter `process` calls.
//!
//! The scheduler is pure plumbing: it decides *when* and *on which
//! thread* an instance runs, while the session's [`Driver`] decides
//! *what* a run does. Three lanes exist:
//!
//! - the shared worker pool, for ordinary instances;
//! - one serial worker, for instances flagged
//!   [`FilterFlags::SINGLE_THREAD`], whose hooks all run on that one
//!   thread;
//! - a dedicated thread per instance flagged
//!   [`FilterFlags::BLOCKING`], so real I/O never starves the pool.
//!
//! Wakes are deduplicated through the node's scheduled flag: an
//! instance is queued at most once, and a wake arriving mid-run is
//! coalesced into exactly one re-run. Combined with the filter-state
//! mutex this guarantees at most one in-flight hook per instance.

use crate::filter::{FilterNode, InstanceId};
use crate::port::PortWaker;
use crate::registry::FilterFlags;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ============================================================================
// Driver
// ============================================================================

/// What to do with an instance after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Wait for the next wake (data, EOS, drain).
    Idle,
    /// Run again as soon as a worker is free.
    Reschedule,
    /// Run again after the delay.
    RescheduleAfter(Duration),
    /// The instance is done; never run it again.
    Completed,
}

/// Executes one scheduling quantum for an instance.
///
/// Implemented by the session; the scheduler never looks inside a run.
pub trait Driver: Send + Sync {
    /// Run the instance once and report its disposition.
    fn run(&self, node: &Arc<FilterNode>) -> RunOutcome;
}

// ============================================================================
// Internals
// ============================================================================

enum WorkItem {
    Run(Arc<FilterNode>),
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    node: Arc<FilterNode>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

struct SchedulerCore {
    pool_tx: kanal::Sender<WorkItem>,
    pool_rx: kanal::Receiver<WorkItem>,
    serial_tx: kanal::Sender<WorkItem>,
    serial_rx: kanal::Receiver<WorkItem>,
    driver: RwLock<Option<Arc<dyn Driver>>>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    timer_cv: Condvar,
    timer_seq: AtomicU64,
    blocking: Mutex<HashMap<InstanceId, kanal::Sender<WorkItem>>>,
    running: AtomicBool,
}

impl SchedulerCore {
    fn driver(&self) -> Option<Arc<dyn Driver>> {
        match self.driver.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Wake an instance: claim it and route it to its lane. A wake for
    /// an already-queued or running instance is coalesced.
    fn schedule(self: &Arc<Self>, node: &Arc<FilterNode>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if !node.claim_for_schedule() {
            trace!(instance = node.name(), "wake coalesced");
            return;
        }
        self.dispatch(node);
    }

    /// Route a claimed instance to its lane.
    fn dispatch(self: &Arc<Self>, node: &Arc<FilterNode>) {
        let flags = node.descriptor().flags();
        if flags.contains(FilterFlags::BLOCKING) {
            self.dispatch_blocking(node);
        } else if flags.contains(FilterFlags::SINGLE_THREAD) {
            let _ = self.serial_tx.send(WorkItem::Run(Arc::clone(node)));
        } else {
            let _ = self.pool_tx.send(WorkItem::Run(Arc::clone(node)));
        }
    }

    fn dispatch_blocking(self: &Arc<Self>, node: &Arc<FilterNode>) {
        let mut lanes = match self.blocking.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let tx = lanes.entry(node.id()).or_insert_with(|| {
            let (tx, rx) = kanal::unbounded::<WorkItem>();
            let core = Arc::clone(self);
            let name = node.name().to_string();
            std::thread::Builder::new()
                .name(format!("sluice-io-{name}"))
                .spawn(move || worker_loop(core, rx))
                .map(|_| ())
                .unwrap_or_else(|e| debug!(error = %e, "failed to spawn io thread"));
            tx
        });
        let _ = tx.send(WorkItem::Run(Arc::clone(node)));
    }

    fn schedule_after(self: &Arc<Self>, node: &Arc<FilterNode>, delay: Duration) {
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq.fetch_add(1, Ordering::AcqRel),
            node: Arc::clone(node),
        };
        let mut timers = match self.timers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        timers.push(Reverse(entry));
        drop(timers);
        self.timer_cv.notify_one();
    }
}

/// Run one claimed instance and apply its disposition.
fn execute(core: &Arc<SchedulerCore>, node: &Arc<FilterNode>) {
    let outcome = match core.driver() {
        Some(driver) => driver.run(node),
        None => RunOutcome::Idle,
    };
    let rewake = node.finish_run();
    match outcome {
        RunOutcome::Completed => {}
        RunOutcome::Idle => {
            if rewake {
                core.dispatch(node);
            }
        }
        RunOutcome::Reschedule => {
            if rewake || node.claim_for_schedule() {
                core.dispatch(node);
            }
        }
        RunOutcome::RescheduleAfter(delay) => {
            if rewake {
                core.dispatch(node);
            } else {
                core.schedule_after(node, delay);
            }
        }
    }
}

fn worker_loop(core: Arc<SchedulerCore>, rx: kanal::Receiver<WorkItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Run(node) => execute(&core, &node),
            WorkItem::Shutdown => break,
        }
    }
}

fn timer_loop(core: Arc<SchedulerCore>) {
    let mut guard = match core.timers.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        if !core.running.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let mut due: Vec<Arc<FilterNode>> = Vec::new();
        while let Some(Reverse(entry)) = guard.peek() {
            if entry.deadline <= now {
                if let Some(Reverse(entry)) = guard.pop() {
                    due.push(entry.node);
                }
            } else {
                break;
            }
        }
        if !due.is_empty() {
            drop(guard);
            for node in due {
                core.schedule(&node);
            }
            guard = match core.timers.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            continue;
        }
        let wait = guard
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_duration_since(now));
        guard = match wait {
            Some(timeout) => match core.timer_cv.wait_timeout(guard, timeout) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            },
            None => match core.timer_cv.wait(guard) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            },
        };
    }
}

// ============================================================================
// NodeWaker
// ============================================================================

/// Port wake hook bound to one instance.
struct NodeWaker {
    core: Weak<SchedulerCore>,
    node: Weak<FilterNode>,
}

impl PortWaker for NodeWaker {
    fn wake(&self) {
        if let (Some(core), Some(node)) = (self.core.upgrade(), self.node.upgrade()) {
            core.schedule(&node);
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// The session's scheduler: a worker pool plus serial, blocking, and
/// timer lanes.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl Scheduler {
    /// Create a scheduler with `workers` pool threads (at least one).
    pub fn new(workers: usize) -> Self {
        let (pool_tx, pool_rx) = kanal::unbounded();
        let (serial_tx, serial_rx) = kanal::unbounded();
        Self {
            core: Arc::new(SchedulerCore {
                pool_tx,
                pool_rx,
                serial_tx,
                serial_rx,
                driver: RwLock::new(None),
                timers: Mutex::new(BinaryHeap::new()),
                timer_cv: Condvar::new(),
                timer_seq: AtomicU64::new(0),
                blocking: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
            workers: workers.max(1),
        }
    }

    /// Install the driver and spawn all threads.
    pub fn start(&self, driver: Arc<dyn Driver>) {
        {
            let mut guard = match self.core.driver.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(driver);
        }
        self.core.running.store(true, Ordering::Release);
        let mut handles = self.lock_handles();
        for i in 0..self.workers {
            let core = Arc::clone(&self.core);
            let rx = self.core.pool_rx.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name(format!("sluice-worker-{i}"))
                .spawn(move || worker_loop(core, rx))
            {
                handles.push(handle);
            }
        }
        let core = Arc::clone(&self.core);
        let rx = self.core.serial_rx.clone();
        if let Ok(handle) = std::thread::Builder::new()
            .name("sluice-serial".into())
            .spawn(move || worker_loop(core, rx))
        {
            handles.push(handle);
        }
        let core = Arc::clone(&self.core);
        if let Ok(handle) = std::thread::Builder::new()
            .name("sluice-timer".into())
            .spawn(move || timer_loop(core))
        {
            handles.push(handle);
        }
        debug!(workers = self.workers, "scheduler started");
    }

    /// Wake an instance now.
    pub fn schedule(&self, node: &Arc<FilterNode>) {
        self.core.schedule(node);
    }

    /// Wake an instance after a delay.
    pub fn schedule_after(&self, node: &Arc<FilterNode>, delay: Duration) {
        self.core.schedule_after(node, delay);
    }

    /// Build a port wake hook for an instance.
    pub fn waker(&self, node: &Arc<FilterNode>) -> Arc<dyn PortWaker> {
        Arc::new(NodeWaker {
            core: Arc::downgrade(&self.core),
            node: Arc::downgrade(node),
        })
    }

    /// Check whether the scheduler is accepting work.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Stop accepting work and join every thread.
    ///
    /// In-flight runs complete; queued wakes are discarded.
    pub fn shutdown(&self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.core.timer_cv.notify_all();
        for _ in 0..self.workers {
            let _ = self.core.pool_tx.send(WorkItem::Shutdown);
        }
        let _ = self.core.serial_tx.send(WorkItem::Shutdown);
        {
            let mut lanes = match self.core.blocking.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (_, tx) in lanes.drain() {
                let _ = tx.send(WorkItem::Shutdown);
            }
        }
        for handle in self.lock_handles().drain(..) {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::filter::{ConfigureOutcome, Filter, FilterCtx, ProcessStatus};
    use crate::port::InputPort;
    use crate::registry::FilterDescriptor;
    use std::sync::atomic::AtomicUsize;

    struct Inert;

    impl Filter for Inert {
        fn configure_port(
            &mut self,
            _ctx: &mut FilterCtx<'_>,
            _port: &InputPort,
            _is_remove: bool,
        ) -> Result<ConfigureOutcome> {
            Ok(ConfigureOutcome::Ok)
        }

        fn process(&mut self, _ctx: &mut FilterCtx<'_>) -> ProcessStatus {
            ProcessStatus::Ok
        }
    }

    fn node(id: u64, flags: FilterFlags) -> Arc<FilterNode> {
        let desc = FilterDescriptor::builder(format!("inert{id}"))
            .flags(flags)
            .factory(|_| Ok(Box::new(Inert)))
            .build_shared();
        FilterNode::new(InstanceId(id), format!("inert#{id}"), desc, Box::new(Inert))
    }

    struct CountingDriver {
        runs: AtomicUsize,
        outcome: Mutex<RunOutcome>,
    }

    impl CountingDriver {
        fn new(outcome: RunOutcome) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                outcome: Mutex::new(outcome),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::Acquire)
        }
    }

    impl Driver for CountingDriver {
        fn run(&self, _node: &Arc<FilterNode>) -> RunOutcome {
            self.runs.fetch_add(1, Ordering::AcqRel);
            *self.outcome.lock().unwrap()
        }
    }

    fn wait_for(pred: impl Fn() -> bool) {
        let start = Instant::now();
        while !pred() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_schedule_runs_once() {
        let driver = CountingDriver::new(RunOutcome::Idle);
        let sched = Scheduler::new(2);
        sched.start(driver.clone());
        let n = node(1, FilterFlags::NONE);
        sched.schedule(&n);
        wait_for(|| driver.runs() == 1);
        // No spurious re-runs.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.runs(), 1);
        sched.shutdown();
    }

    #[test]
    fn test_duplicate_wakes_coalesce() {
        let driver = CountingDriver::new(RunOutcome::Idle);
        let sched = Scheduler::new(1);
        sched.start(driver.clone());
        let n = node(2, FilterFlags::NONE);
        for _ in 0..50 {
            sched.schedule(&n);
        }
        wait_for(|| driver.runs() >= 1);
        std::thread::sleep(Duration::from_millis(30));
        // Wakes arriving while queued or running coalesce; far fewer
        // runs than wakes.
        assert!(driver.runs() < 10, "ran {} times", driver.runs());
        sched.shutdown();
    }

    #[test]
    fn test_timer_fires() {
        let driver = CountingDriver::new(RunOutcome::Idle);
        let sched = Scheduler::new(1);
        sched.start(driver.clone());
        let n = node(3, FilterFlags::NONE);
        sched.schedule_after(&n, Duration::from_millis(15));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(driver.runs(), 0);
        wait_for(|| driver.runs() == 1);
        sched.shutdown();
    }

    #[test]
    fn test_blocking_lane_runs() {
        let driver = CountingDriver::new(RunOutcome::Idle);
        let sched = Scheduler::new(1);
        sched.start(driver.clone());
        let n = node(4, FilterFlags::BLOCKING);
        sched.schedule(&n);
        wait_for(|| driver.runs() == 1);
        sched.shutdown();
    }

    #[test]
    fn test_shutdown_discards_queued_work() {
        let driver = CountingDriver::new(RunOutcome::Idle);
        let sched = Scheduler::new(1);
        sched.start(driver.clone());
        sched.shutdown();
        let n = node(5, FilterFlags::NONE);
        sched.schedule(&n);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(driver.runs(), 0);
    }
}
