//! A live filter instance: boxed filter state, its ports, and the
//! lifecycle state machine.

use crate::filter::Filter;
use crate::port::{InputPort, OutputPort};
use crate::registry::FilterDescriptor;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

// ============================================================================
// Identity
// ============================================================================

/// Unique identifier of a filter instance within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a filter instance.
///
/// `Created → Configuring → Active → Draining → Destroyed`, with
/// `Error` reachable from every live state. An errored instance may
/// still flush queued output but accepts no new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Instantiated, no port connected yet.
    Created = 0,
    /// First connection arrived; `configure_port` in progress.
    Configuring = 1,
    /// Configured with at least one expected output; processing.
    Active = 2,
    /// Upstream ended and queues are draining; no new input accepted.
    Draining = 3,
    /// A hook failed fatally; flush allowed, no new work.
    Error = 4,
    /// All ports disconnected, nothing in flight. Terminal.
    Destroyed = 5,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Active,
            3 => Self::Draining,
            4 => Self::Error,
            _ => Self::Destroyed,
        }
    }

    /// Check whether `next` is a legal successor of `self`.
    fn allows(self, next: Self) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Created, Configuring) => true,
            (Configuring, Active) | (Configuring, Configuring) => true,
            (Active, Configuring) => true, // reconfiguration
            (Active, Draining) | (Configuring, Draining) => true,
            (Draining, Destroyed) | (Error, Destroyed) => true,
            (Created | Configuring | Active | Draining, Error) => true,
            _ => false,
        }
    }

    /// Terminal or errored: the instance accepts no new work.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Configuring | Self::Active | Self::Draining)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-instance counters, surfaced through the session report channel.
#[derive(Debug, Default)]
pub struct InstanceStats {
    /// `process` invocations.
    pub process_calls: AtomicU64,
    /// Recoverable errors absorbed at this instance.
    pub errors_absorbed: AtomicU64,
}

// ============================================================================
// FilterNode
// ============================================================================

/// A filter instance wired into the session graph.
///
/// The boxed filter state sits behind a `Mutex` that is held for the
/// whole duration of any hook call; together with the scheduled flag
/// this guarantees at most one in-flight hook per instance.
pub struct FilterNode {
    id: InstanceId,
    name: String,
    descriptor: Arc<FilterDescriptor>,
    filter: Mutex<Box<dyn Filter>>,
    inputs: RwLock<Vec<InputPort>>,
    outputs: RwLock<Vec<OutputPort>>,
    state: AtomicU8,
    stats: InstanceStats,
    last_error: Mutex<Option<String>>,
    /// Instance is queued or running; dedupes scheduler wakes.
    scheduled: AtomicBool,
    /// A wake arrived while the instance was running.
    wake_pending: AtomicBool,
    /// Consecutive out-of-memory retries.
    oom_retries: AtomicU32,
}

impl FilterNode {
    /// Wire up a new instance in the `Created` state.
    pub fn new(
        id: InstanceId,
        name: impl Into<String>,
        descriptor: Arc<FilterDescriptor>,
        filter: Box<dyn Filter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            descriptor,
            filter: Mutex::new(filter),
            inputs: RwLock::new(Vec::new()),
            outputs: RwLock::new(Vec::new()),
            state: AtomicU8::new(LifecycleState::Created as u8),
            stats: InstanceStats::default(),
            last_error: Mutex::new(None),
            scheduled: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            oom_retries: AtomicU32::new(0),
        })
    }

    /// Instance id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Instance name (descriptor name plus a per-session suffix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor this instance was built from.
    pub fn descriptor(&self) -> &Arc<FilterDescriptor> {
        &self.descriptor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt a lifecycle transition; returns whether it was legal
    /// and applied.
    pub fn transition(&self, next: LifecycleState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !LifecycleState::from_u8(current).allows(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(
                        instance = %self.name,
                        from = ?LifecycleState::from_u8(current),
                        to = ?next,
                        "lifecycle transition"
                    );
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Lock the filter state for a hook call.
    pub fn lock_filter(&self) -> MutexGuard<'_, Box<dyn Filter>> {
        match self.filter.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach an input port.
    pub fn add_input(&self, port: InputPort) {
        self.write_inputs().push(port);
    }

    /// Attach an output port.
    pub fn add_output(&self, port: OutputPort) {
        self.write_outputs().push(port);
    }

    /// Snapshot of the input ports (cheap clones).
    pub fn inputs(&self) -> Vec<InputPort> {
        match self.inputs.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Snapshot of the output ports (cheap clones).
    pub fn outputs(&self) -> Vec<OutputPort> {
        match self.outputs.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Detach the input fed by `output`; returns whether anything was
    /// removed.
    pub fn remove_input(&self, output: &OutputPort) -> bool {
        let mut inputs = self.write_inputs();
        let before = inputs.len();
        inputs.retain(|p| !p.is_fed_by(output));
        inputs.len() != before
    }

    /// Signal end-of-stream on every output.
    pub fn eos_all_outputs(&self) {
        for out in self.outputs() {
            out.set_eos();
        }
    }

    /// Per-instance counters.
    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// Record a fatal error, moving the instance to `Error`.
    pub fn record_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut guard = match self.last_error.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(reason);
        }
        self.transition(LifecycleState::Error);
    }

    /// The most recent fatal error, if any.
    pub fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Scheduler protocol
    // ------------------------------------------------------------------------

    /// Claim the instance for the ready queue.
    ///
    /// Returns `true` if the caller must enqueue it; `false` records a
    /// pending wake instead, delivered when the current run finishes.
    pub fn claim_for_schedule(&self) -> bool {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            self.wake_pending.store(true, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Release the instance after a run.
    ///
    /// Returns `true` if a wake arrived during the run and the caller
    /// must reschedule immediately.
    pub fn finish_run(&self) -> bool {
        self.scheduled.store(false, Ordering::Release);
        if self.wake_pending.swap(false, Ordering::AcqRel) {
            // Re-claim; a concurrent waker may have beaten us to it.
            self.claim_for_schedule()
        } else {
            false
        }
    }

    /// Count one more consecutive out-of-memory retry.
    pub fn bump_oom_retries(&self) -> u32 {
        self.oom_retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clear the out-of-memory retry counter after a successful run.
    pub fn reset_oom_retries(&self) {
        self.oom_retries.store(0, Ordering::Release);
    }

    fn write_inputs(&self) -> std::sync::RwLockWriteGuard<'_, Vec<InputPort>> {
        match self.inputs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_outputs(&self) -> std::sync::RwLockWriteGuard<'_, Vec<OutputPort>> {
        match self.outputs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ConfigureOutcome, FilterCtx, ProcessStatus};
    use crate::registry::FilterDescriptor;

    struct Noop;

    impl Filter for Noop {
        fn configure_port(
            &mut self,
            _ctx: &mut FilterCtx<'_>,
            _port: &InputPort,
            _is_remove: bool,
        ) -> crate::error::Result<ConfigureOutcome> {
            Ok(ConfigureOutcome::Ok)
        }

        fn process(&mut self, _ctx: &mut FilterCtx<'_>) -> ProcessStatus {
            ProcessStatus::Eos
        }
    }

    fn node() -> Arc<FilterNode> {
        let desc = Arc::new(
            FilterDescriptor::builder("noop")
                .factory(|_| Ok(Box::new(Noop)))
                .build(),
        );
        FilterNode::new(InstanceId(1), "noop#1", desc, Box::new(Noop))
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let n = node();
        assert_eq!(n.state(), LifecycleState::Created);
        assert!(n.transition(LifecycleState::Configuring));
        assert!(n.transition(LifecycleState::Active));
        assert!(n.transition(LifecycleState::Draining));
        assert!(n.transition(LifecycleState::Destroyed));
        // Terminal: nothing leaves Destroyed.
        assert!(!n.transition(LifecycleState::Active));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let n = node();
        assert!(!n.transition(LifecycleState::Active)); // skips Configuring
        assert!(!n.transition(LifecycleState::Destroyed)); // skips Draining
    }

    #[test]
    fn test_error_reachable_and_flushable() {
        let n = node();
        n.transition(LifecycleState::Configuring);
        n.record_fatal("decoder blew up");
        assert_eq!(n.state(), LifecycleState::Error);
        assert_eq!(n.last_error().as_deref(), Some("decoder blew up"));
        assert!(!n.state().accepts_work());
        assert!(n.transition(LifecycleState::Destroyed));
    }

    #[test]
    fn test_schedule_dedupe() {
        let n = node();
        assert!(n.claim_for_schedule());
        // Second wake while queued: coalesced into a pending wake.
        assert!(!n.claim_for_schedule());
        // Finishing the run surfaces the pending wake as a reschedule.
        assert!(n.finish_run());
        assert!(n.finish_run() == false);
    }
}
