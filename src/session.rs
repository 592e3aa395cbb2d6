//! The session: root owner of the registry, the instance graph, the
//! scheduler, and the clock.
//!
//! A session is built, populated with filters, and driven by
//! [`Session::run`], which blocks until every instance has drained and
//! been destroyed. [`Session::stop`] flushes (sources go end-of-stream,
//! in-flight data drains); [`Session::shutdown`] force-destroys
//! everything.
//!
//! Linking is demand-driven: whenever a filter declares an output, the
//! port's snapshot is matched against the registry and the best
//! candidate is connected, reusing a live instance where its descriptor
//! allows and instantiating a sibling when a candidate rejects the port
//! with `NewInstanceRequired`. Ports that match nothing stay
//! unconnected; that is reported, never fatal.

use crate::clock::{ClockTime, SessionClock};
use crate::error::{Error, Result};
use crate::event::{Event, EventOutcome};
use crate::filter::{
    ConfigureOutcome, CtxAction, FilterCtx, FilterNode, InstanceId, LifecycleState, OptionValues,
    ProbeScore, ProcessStatus,
};
use crate::packet::PacketAccounting;
use crate::port::{OutputPort, WaterMarks};
use crate::props::PropValue;
use crate::registry::{FilterDescriptor, FilterFlags, FilterRegistry};
use crate::scheduler::{Driver, RunOutcome, Scheduler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker pool size.
    pub workers: usize,
    /// An instance repeatedly reporting "no data yet" for longer than
    /// this fails closed: end-of-stream on all of its outputs.
    pub no_progress_timeout: Duration,
    /// Consecutive out-of-memory retries before an instance is treated
    /// as fatally failed.
    pub max_oom_retries: u32,
    /// Default queue watermarks for new ports.
    pub default_marks: WaterMarks,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            no_progress_timeout: Duration::from_secs(10),
            max_oom_retries: 8,
            default_marks: WaterMarks::default(),
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Category of a session report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// An output port matched no consumer.
    NoConsumer,
    /// An instance failed fatally.
    Fatal,
    /// A candidate rejected a port at configure time.
    ConfigRejected,
    /// An instance hit the no-progress timeout and was forced to
    /// end-of-stream.
    Stalled,
}

/// One diagnostic record on the session's side channel.
///
/// Reports never travel on the data path; callers poll them via
/// [`Session::reports`].
#[derive(Debug, Clone)]
pub struct Report {
    /// Instance name the report concerns.
    pub instance: String,
    /// Category.
    pub kind: ReportKind,
    /// Free-form detail.
    pub detail: String,
    /// Session time of the report.
    pub at: ClockTime,
}

/// Aggregate per-instance statistics snapshot.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    /// Instance name.
    pub instance: String,
    /// Lifecycle state at snapshot time.
    pub state: LifecycleState,
    /// `process` invocations so far.
    pub process_calls: u64,
    /// Packets queued across all outputs.
    pub packets_sent: u64,
    /// Packets dropped on unconnected outputs.
    pub packets_dropped: u64,
}

// ============================================================================
// Internal graph bookkeeping
// ============================================================================

#[derive(Debug, Clone)]
struct Edge {
    from: InstanceId,
    to: InstanceId,
}

struct PendingLink {
    producer: Arc<FilterNode>,
    output: OutputPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SessionState {
    Idle = 0,
    Running = 1,
    Flushing = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Flushing,
            _ => Self::Stopped,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionCore {
    registry: Arc<FilterRegistry>,
    scheduler: Scheduler,
    clock: Arc<SessionClock>,
    accounting: Arc<PacketAccounting>,
    config: SessionConfig,
    instances: Mutex<Vec<Arc<FilterNode>>>,
    edges: Mutex<Vec<Edge>>,
    pending_links: Mutex<Vec<PendingLink>>,
    reports: Mutex<Vec<Report>>,
    stall_since: Mutex<HashMap<InstanceId, Instant>>,
    state: AtomicU8,
    next_id: AtomicU64,
    /// Pair guarding completion: notified whenever an instance reaches
    /// `Destroyed`.
    done_mutex: Mutex<()>,
    done_cv: Condvar,
}

/// A filter session.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Create a session over a registry with default configuration.
    pub fn new(registry: Arc<FilterRegistry>) -> Self {
        Self::with_config(registry, SessionConfig::default())
    }

    /// Create a session with explicit configuration.
    pub fn with_config(registry: Arc<FilterRegistry>, config: SessionConfig) -> Self {
        let core = Arc::new(SessionCore {
            registry,
            scheduler: Scheduler::new(config.workers),
            clock: Arc::new(SessionClock::new()),
            accounting: PacketAccounting::new(),
            config,
            instances: Mutex::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
            pending_links: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            stall_since: Mutex::new(HashMap::new()),
            state: AtomicU8::new(SessionState::Idle as u8),
            next_id: AtomicU64::new(1),
            done_mutex: Mutex::new(()),
            done_cv: Condvar::new(),
        });
        core.scheduler.start(Arc::clone(&core) as Arc<dyn Driver>);
        Self { core }
    }

    /// The registry this session instantiates from.
    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.core.registry
    }

    /// The session clock.
    pub fn clock(&self) -> &Arc<SessionClock> {
        &self.core.clock
    }

    /// Session-wide payload accounting.
    pub fn accounting(&self) -> &Arc<PacketAccounting> {
        &self.core.accounting
    }

    /// Instantiate a registered filter with user-supplied option
    /// values overlaid on its declared defaults.
    pub fn add_filter(
        &self,
        name: &str,
        options: &[(&str, PropValue)],
    ) -> Result<InstanceId> {
        if self.core.state() == SessionState::Stopped {
            return Err(Error::SessionClosed);
        }
        let descriptor = self.core.registry.get(name)?;
        let bound = OptionValues::bind(name, descriptor.options(), options)?;
        let node = self.core.spawn_instance(&descriptor, &bound)?;
        Ok(node.id())
    }

    /// Pick the best-scoring registered filter for a source.
    ///
    /// Every descriptor's filter is probed with the URL and, when
    /// given, the leading source bytes; the highest score wins, with
    /// descriptor priority and registration order breaking ties.
    pub fn resolve_source(
        &self,
        url: &str,
        head_bytes: Option<&[u8]>,
    ) -> Result<Arc<FilterDescriptor>> {
        let mut best: Option<(ProbeScore, Arc<FilterDescriptor>)> = None;
        for descriptor in self.core.registry.descriptors() {
            let defaults = OptionValues::defaults(descriptor.options());
            let probe = match descriptor.instantiate(&defaults) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut score = probe.probe_url(url);
            if let Some(bytes) = head_bytes {
                if let Some((mime, data_score)) = probe.probe_data(bytes) {
                    debug!(filter = descriptor.name(), mime, "probe recognized data");
                    score = score.max(data_score);
                }
            }
            if score == ProbeScore::NotSupported {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_score, best_desc)) => {
                    score > *best_score
                        || (score == *best_score
                            && descriptor.priority() < best_desc.priority())
                }
            };
            if better {
                best = Some((score, descriptor));
            }
        }
        best.map(|(_, d)| d)
            .ok_or_else(|| Error::FilterNotFound(format!("no filter can open '{url}'")))
    }

    /// Run the session to completion.
    ///
    /// Blocks until every instance has drained and been destroyed, then
    /// returns the first fatal error if any instance failed.
    pub fn run(&self) -> Result<()> {
        if self.core.state() == SessionState::Stopped {
            return Err(Error::SessionClosed);
        }
        self.core
            .state
            .store(SessionState::Running as u8, Ordering::Release);
        info!("session running");
        self.core.link_pending();
        for node in self.core.snapshot_instances() {
            if node.inputs().is_empty() {
                self.core.scheduler.schedule(&node);
            }
        }
        let mut guard = self.core.lock_done();
        while !self.core.all_destroyed() && self.core.state() != SessionState::Stopped {
            guard = match self
                .core
                .done_cv
                .wait_timeout(guard, Duration::from_millis(100))
            {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(guard);
        info!(outstanding = self.core.accounting.outstanding(), "session drained");
        let fatal = self
            .reports()
            .into_iter()
            .find(|r| r.kind == ReportKind::Fatal);
        match fatal {
            Some(report) => Err(Error::Fatal {
                filter: report.instance,
                reason: report.detail,
            }),
            None => Ok(()),
        }
    }

    /// Flush: sources go end-of-stream and in-flight data drains.
    pub fn stop(&self) {
        self.core
            .state
            .store(SessionState::Flushing as u8, Ordering::Release);
        for node in self.core.snapshot_instances() {
            if node.inputs().is_empty() {
                node.eos_all_outputs();
                node.transition(LifecycleState::Draining);
                self.core.scheduler.schedule(&node);
            }
        }
    }

    /// Force teardown: every instance is finalized and destroyed
    /// regardless of queued data.
    pub fn shutdown(&self) {
        self.core
            .state
            .store(SessionState::Stopped as u8, Ordering::Release);
        self.core.scheduler.shutdown();
        let instances = self.core.snapshot_instances();
        // Detach live links first so every consumer observes the
        // removal through its configure hook. The scheduler is down,
        // so no hook can be in flight concurrently.
        for node in &instances {
            for output in node.outputs() {
                if !output.is_connected() {
                    continue;
                }
                let consumer = instances
                    .iter()
                    .find(|c| c.inputs().iter().any(|i| i.is_fed_by(&output)));
                let Some(consumer) = consumer else { continue };
                let inputs = consumer.inputs();
                let outputs = consumer.outputs();
                let Some(input) = inputs.iter().find(|i| i.is_fed_by(&output)) else {
                    continue;
                };
                let mut ctx = FilterCtx::new(&inputs, &outputs);
                {
                    let mut filter = consumer.lock_filter();
                    let _ = filter.configure_port(&mut ctx, input, true);
                }
                consumer.remove_input(&output);
                output.disconnect();
            }
        }
        for node in instances {
            if node.state() != LifecycleState::Destroyed {
                self.core.destroy(&node);
            }
        }
        self.core.done_cv.notify_all();
        info!("session shut down");
    }

    /// Send a control event upstream from an instance (typically a
    /// sink).
    pub fn send_event(&self, origin: InstanceId, event: Event) -> Result<()> {
        let node = self
            .core
            .find(origin)
            .ok_or_else(|| Error::FilterNotFound(format!("instance {origin}")))?;
        self.core.propagate_upstream(&node, event);
        Ok(())
    }

    /// Drain the diagnostic report channel.
    pub fn reports(&self) -> Vec<Report> {
        match self.core.reports.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Snapshot per-instance statistics.
    pub fn instance_reports(&self) -> Vec<InstanceReport> {
        self.core
            .snapshot_instances()
            .iter()
            .map(|node| {
                let outputs = node.outputs();
                InstanceReport {
                    instance: node.name().to_string(),
                    state: node.state(),
                    process_calls: node.stats().process_calls.load(Ordering::Acquire),
                    packets_sent: outputs.iter().map(OutputPort::sent).sum(),
                    packets_dropped: outputs
                        .iter()
                        .map(OutputPort::dropped_unconnected)
                        .sum(),
                }
            })
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.core.snapshot_instances().len())
            .field("state", &self.core.state())
            .finish()
    }
}

// ============================================================================
// Core mechanics
// ============================================================================

impl SessionCore {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn snapshot_instances(&self) -> Vec<Arc<FilterNode>> {
        match self.instances.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn find(&self, id: InstanceId) -> Option<Arc<FilterNode>> {
        self.snapshot_instances().into_iter().find(|n| n.id() == id)
    }

    fn lock_done(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.done_mutex.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every instance destroyed; an empty graph is trivially complete.
    fn all_destroyed(&self) -> bool {
        self.snapshot_instances()
            .iter()
            .all(|n| n.state() == LifecycleState::Destroyed)
    }

    fn report(&self, instance: &str, kind: ReportKind, detail: impl Into<String>) {
        let mut guard = match self.reports.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(Report {
            instance: instance.to_string(),
            kind,
            detail: detail.into(),
            at: self.clock.now(),
        });
    }

    /// Instantiate a descriptor, run `initialize`, and absorb its
    /// declared outputs.
    fn spawn_instance(
        &self,
        descriptor: &Arc<FilterDescriptor>,
        options: &OptionValues,
    ) -> Result<Arc<FilterNode>> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let name = format!("{}#{}", descriptor.name(), id.0);
        let filter = descriptor.instantiate(options)?;
        let node = FilterNode::new(id, name, Arc::clone(descriptor), filter);

        let inputs = node.inputs();
        let outputs = node.outputs();
        let mut ctx = FilterCtx::new(&inputs, &outputs);
        {
            let mut filter = node.lock_filter();
            filter.initialize(&mut ctx)?;
        }
        {
            let mut guard = match self.instances.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.push(Arc::clone(&node));
        }
        self.apply_actions(&node, ctx.actions.into_vec());
        // Sources become active as soon as they declare an output.
        if node.inputs().is_empty() && !node.outputs().is_empty() {
            node.transition(LifecycleState::Configuring);
            node.transition(LifecycleState::Active);
        }
        if self.state() == SessionState::Running && node.inputs().is_empty() {
            self.scheduler.schedule(&node);
        }
        debug!(instance = node.name(), "instantiated filter");
        Ok(node)
    }

    /// Apply the deferred requests a hook recorded.
    fn apply_actions(&self, node: &Arc<FilterNode>, actions: Vec<CtxAction>) {
        let mut linked_something = false;
        for action in actions {
            match action {
                CtxAction::AddOutput { name, props, marks } => {
                    let port = OutputPort::new(
                        &name,
                        Arc::clone(&self.accounting),
                        marks.unwrap_or(self.config.default_marks),
                    );
                    port.set_props(props);
                    port.set_producer_waker(self.scheduler.waker(node));
                    node.add_output(port.clone());
                    let mut pending = match self.pending_links.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    pending.push(PendingLink {
                        producer: Arc::clone(node),
                        output: port,
                    });
                    linked_something = true;
                }
                CtxAction::SendUpstream(event) => {
                    self.propagate_upstream(node, event);
                }
            }
        }
        if linked_something {
            self.link_pending();
        }
    }

    /// Resolve every queued output port against the registry.
    fn link_pending(&self) {
        loop {
            let link = {
                let mut pending = match self.pending_links.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match pending.pop() {
                    Some(l) => l,
                    None => return,
                }
            };
            self.resolve_link(link);
        }
    }

    fn resolve_link(&self, link: PendingLink) {
        let span = info_span!("link", producer = link.producer.name(), port = link.output.name());
        let _enter = span.enter();

        let snapshot = link.output.props();
        let candidates = self.registry.match_input(&snapshot);
        if candidates.is_empty() {
            warn!("no consumer matches output");
            self.report(
                link.producer.name(),
                ReportKind::NoConsumer,
                format!("output '{}' matched no filter", link.output.name()),
            );
            return;
        }

        for candidate in candidates {
            // Never link an output back into its own producer kind:
            // self-loops are meaningless in an acyclic dataflow graph.
            if candidate.descriptor.name() == link.producer.descriptor().name() {
                continue;
            }
            // Prefer reusing a live instance where the descriptor
            // allows dynamic reuse and has port capacity left.
            if candidate.descriptor.flags().contains(FilterFlags::DYNAMIC_REUSE) {
                let reusable = self.snapshot_instances().into_iter().find(|n| {
                    Arc::ptr_eq(n.descriptor(), &candidate.descriptor)
                        && matches!(
                            n.state(),
                            LifecycleState::Active | LifecycleState::Configuring
                        )
                        && (n.inputs().len() as u32)
                            <= candidate.descriptor.max_extra_ports()
                });
                if let Some(existing) = reusable {
                    match self.try_connect(&link, &existing) {
                        Ok(true) => return,
                        Ok(false) | Err(_) => {}
                    }
                }
            }
            // Fresh instance of the candidate.
            let defaults = OptionValues::defaults(candidate.descriptor.options());
            let consumer = match self.spawn_instance(&candidate.descriptor, &defaults) {
                Ok(n) => n,
                Err(e) => {
                    self.report(
                        candidate.descriptor.name(),
                        ReportKind::ConfigRejected,
                        e.to_string(),
                    );
                    continue;
                }
            };
            match self.try_connect(&link, &consumer) {
                Ok(true) => return,
                Ok(false) => {
                    // A fresh instance demanding yet another instance
                    // cannot accept this port at all; try the next
                    // candidate.
                    self.report(
                        consumer.name(),
                        ReportKind::ConfigRejected,
                        "new instance rejected the port".to_string(),
                    );
                }
                Err(e) => {
                    self.report(consumer.name(), ReportKind::ConfigRejected, e.to_string());
                }
            }
        }
        self.report(
            link.producer.name(),
            ReportKind::NoConsumer,
            format!("every candidate rejected output '{}'", link.output.name()),
        );
    }

    /// Connect a pending output to a consumer instance and run
    /// `configure_port`. `Ok(true)` means linked; `Ok(false)` means the
    /// consumer asked for a new instance and the port was detached
    /// again.
    fn try_connect(
        &self,
        link: &PendingLink,
        consumer: &Arc<FilterNode>,
    ) -> Result<bool> {
        let input = link.output.connect()?;
        consumer.transition(LifecycleState::Configuring);

        let consumer_inputs = consumer.inputs();
        let consumer_outputs = consumer.outputs();
        let mut ctx = FilterCtx::new(&consumer_inputs, &consumer_outputs);
        let mut result = {
            let mut filter = consumer.lock_filter();
            filter.configure_port(&mut ctx, &input, false)
        };
        if result.is_err() {
            // Give the producer one chance to adapt its output to the
            // consumer's constraints before abandoning the candidate.
            let adapted = {
                let mut producer = link.producer.lock_filter();
                producer.reconfigure_output(&link.output).is_ok()
            };
            if adapted {
                debug!(producer = link.producer.name(), "output reconfigured, retrying link");
                input.take_reconfigure_pending();
                ctx = FilterCtx::new(&consumer_inputs, &consumer_outputs);
                result = {
                    let mut filter = consumer.lock_filter();
                    filter.configure_port(&mut ctx, &input, false)
                };
            }
        }
        let outcome = match result {
            Ok(outcome) => {
                self.apply_actions(consumer, ctx.actions.into_vec());
                outcome
            }
            Err(e) => {
                link.output.disconnect();
                self.release_rejecting(consumer);
                return Err(e);
            }
        };

        match outcome {
            ConfigureOutcome::Ok => {
                input.set_consumer_waker(self.scheduler.waker(consumer));
                consumer.add_input(input);
                consumer.transition(LifecycleState::Active);
                {
                    let mut edges = match self.edges.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    edges.push(Edge {
                        from: link.producer.id(),
                        to: consumer.id(),
                    });
                }
                debug!(consumer = consumer.name(), "linked");
                self.scheduler.schedule(&link.producer);
                self.scheduler.schedule(consumer);
                Ok(true)
            }
            ConfigureOutcome::NewInstanceRequired => {
                link.output.disconnect();
                self.release_rejecting(consumer);
                Ok(false)
            }
        }
    }

    /// Put a consumer that did not take the port back into service.
    ///
    /// An instance that kept other inputs resumes processing them; a
    /// fresh one with nothing attached is reclaimed outright so it
    /// cannot linger in `Configuring` and hold the session open.
    fn release_rejecting(&self, node: &Arc<FilterNode>) {
        if node.inputs().is_empty() {
            self.destroy(node);
        } else {
            node.transition(LifecycleState::Active);
            self.scheduler.schedule(node);
        }
    }

    fn destroy(&self, node: &Arc<FilterNode>) {
        // Claim the terminal transition first so concurrent sweeps
        // finalize exactly once. Forced teardown from a live state
        // routes through Error.
        let claimed = node.transition(LifecycleState::Destroyed)
            || (node.transition(LifecycleState::Error)
                && node.transition(LifecycleState::Destroyed));
        if !claimed {
            return;
        }
        {
            let mut filter = node.lock_filter();
            filter.finalize();
        }
        // End-of-stream before detaching, so any consumer already fed
        // by this instance observes completion instead of a silently
        // dead input.
        node.eos_all_outputs();
        for output in node.outputs() {
            output.disconnect();
        }
        {
            let mut stalls = match self.stall_since.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            stalls.remove(&node.id());
        }
        debug!(instance = node.name(), "destroyed");
        self.done_cv.notify_all();
    }

    /// Destroy every draining or errored instance whose outputs are
    /// fully consumed (errored instances keep flushing queued output
    /// before teardown).
    fn sweep(&self) {
        for node in self.snapshot_instances() {
            if !matches!(
                node.state(),
                LifecycleState::Draining | LifecycleState::Error
            ) {
                continue;
            }
            let drained = node
                .outputs()
                .iter()
                .all(|o| o.queued() == 0);
            if drained {
                self.destroy(&node);
            }
        }
    }

    /// Walk an event upstream from `node`, one edge at a time.
    fn propagate_upstream(&self, node: &Arc<FilterNode>, event: Event) {
        let producers: Vec<Arc<FilterNode>> = {
            let edges = match self.edges.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            edges
                .iter()
                .filter(|e| e.to == node.id())
                .filter_map(|e| self.find(e.from))
                .collect()
        };
        for producer in producers {
            let outcome = {
                let mut filter = producer.lock_filter();
                filter.handle_event(&event)
            };
            // The producer may need to act on the event (seek, stop).
            self.scheduler.schedule(&producer);
            match outcome {
                EventOutcome::Consumed => {}
                EventOutcome::Forward => {
                    self.propagate_upstream(&producer, event.clone());
                }
                EventOutcome::Rewritten(rewritten) => {
                    self.propagate_upstream(&producer, rewritten);
                }
            }
        }
    }

    /// Re-run `configure_port` on inputs whose upstream snapshot
    /// changed after traffic.
    fn reconfigure_inputs(&self, node: &Arc<FilterNode>) {
        for input in node.inputs() {
            if !input.take_reconfigure_pending() {
                continue;
            }
            let inputs = node.inputs();
            let outputs = node.outputs();
            let mut ctx = FilterCtx::new(&inputs, &outputs);
            let result = {
                let mut filter = node.lock_filter();
                filter.configure_port(&mut ctx, &input, false)
            };
            match result {
                Ok(_) => self.apply_actions(node, ctx.actions.into_vec()),
                Err(e) => {
                    warn!(instance = node.name(), error = %e, "reconfiguration failed");
                    self.report(node.name(), ReportKind::ConfigRejected, e.to_string());
                    node.record_fatal(e.to_string());
                    node.eos_all_outputs();
                }
            }
        }
    }
}

// ============================================================================
// Driver: one scheduling quantum
// ============================================================================

impl SessionCore {
    fn clear_stall(&self, node: &FilterNode) {
        let mut stalls = match self.stall_since.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        stalls.remove(&node.id());
    }

    /// How long the instance has been reporting "no data yet".
    fn stall_elapsed(&self, node: &FilterNode) -> Duration {
        let mut stalls = match self.stall_since.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        stalls.entry(node.id()).or_insert_with(Instant::now).elapsed()
    }

    /// Fatal failure: record, report, and convert to end-of-stream on
    /// every output of this instance only.
    fn fail(&self, node: &Arc<FilterNode>, reason: &str) {
        warn!(instance = node.name(), reason, "instance failed fatally");
        self.report(node.name(), ReportKind::Fatal, reason.to_string());
        node.record_fatal(reason);
        node.eos_all_outputs();
        self.sweep();
    }

    /// Move an instance into draining and destroy it right away if its
    /// outputs are already consumed.
    fn begin_drain(&self, node: &Arc<FilterNode>) -> RunOutcome {
        node.eos_all_outputs();
        node.transition(LifecycleState::Draining);
        self.sweep();
        if node.state() == LifecycleState::Destroyed {
            RunOutcome::Completed
        } else {
            RunOutcome::Idle
        }
    }
}

impl Driver for SessionCore {
    fn run(&self, node: &Arc<FilterNode>) -> RunOutcome {
        if self.state() == SessionState::Stopped {
            return RunOutcome::Completed;
        }
        self.link_pending();

        match node.state() {
            LifecycleState::Destroyed => return RunOutcome::Completed,
            LifecycleState::Error => {
                self.sweep();
                return RunOutcome::Completed;
            }
            LifecycleState::Draining => {
                self.sweep();
                return if node.state() == LifecycleState::Destroyed {
                    RunOutcome::Completed
                } else {
                    RunOutcome::Idle
                };
            }
            LifecycleState::Created | LifecycleState::Configuring => {
                // Woken before configuration finished; the link path
                // reschedules on activation.
                return RunOutcome::Idle;
            }
            LifecycleState::Active => {}
        }

        self.reconfigure_inputs(node);
        if node.state() == LifecycleState::Error {
            self.sweep();
            return RunOutcome::Completed;
        }

        let span = info_span!("process", instance = node.name());
        let _enter = span.enter();
        node.stats().process_calls.fetch_add(1, Ordering::AcqRel);

        let inputs = node.inputs();
        let outputs = node.outputs();
        let mut ctx = FilterCtx::new(&inputs, &outputs);
        let status = {
            let mut filter = node.lock_filter();
            filter.process(&mut ctx)
        };
        let actions = ctx.actions.into_vec();
        self.apply_actions(node, actions);

        match status {
            ProcessStatus::Ok => {
                node.reset_oom_retries();
                self.clear_stall(node);
                self.sweep();
                let has_input = node.inputs().iter().any(|i| i.pending() > 0);
                let blocked = node.outputs().iter().any(OutputPort::would_block);
                if has_input && !blocked {
                    RunOutcome::Reschedule
                } else {
                    RunOutcome::Idle
                }
            }
            ProcessStatus::Eos => {
                self.clear_stall(node);
                self.begin_drain(node)
            }
            ProcessStatus::Retry { after } => {
                // Retrying with input still queued is pacing, not a
                // stall; only empty-handed retries count toward the
                // no-progress timeout.
                let has_input = node.inputs().iter().any(|i| i.pending() > 0);
                if has_input {
                    self.clear_stall(node);
                    return if after == ClockTime::ZERO {
                        RunOutcome::Reschedule
                    } else {
                        RunOutcome::RescheduleAfter(after.into())
                    };
                }
                if self.stall_elapsed(node) > self.config.no_progress_timeout {
                    warn!(instance = node.name(), "no progress; forcing end-of-stream");
                    self.report(
                        node.name(),
                        ReportKind::Stalled,
                        "no-progress timeout exceeded".to_string(),
                    );
                    self.clear_stall(node);
                    self.begin_drain(node)
                } else if after == ClockTime::ZERO {
                    RunOutcome::Reschedule
                } else {
                    RunOutcome::RescheduleAfter(after.into())
                }
            }
            ProcessStatus::OutOfMemory => {
                let tries = node.bump_oom_retries();
                node.stats().errors_absorbed.fetch_add(1, Ordering::AcqRel);
                if tries > self.config.max_oom_retries {
                    self.fail(node, "allocation failed after bounded retries");
                    RunOutcome::Completed
                } else {
                    RunOutcome::RescheduleAfter(Duration::from_millis(10 * u64::from(tries)))
                }
            }
            ProcessStatus::Fatal { reason } => {
                self.fail(node, &reason);
                RunOutcome::Completed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, ProbeScore};
    use crate::port::InputPort;

    struct Probe {
        url_score: ProbeScore,
        magic: Option<&'static [u8]>,
    }

    impl Filter for Probe {
        fn configure_port(
            &mut self,
            _ctx: &mut FilterCtx<'_>,
            _port: &InputPort,
            _is_remove: bool,
        ) -> Result<ConfigureOutcome> {
            Ok(ConfigureOutcome::Ok)
        }

        fn process(&mut self, _ctx: &mut FilterCtx<'_>) -> ProcessStatus {
            ProcessStatus::Eos
        }

        fn probe_url(&self, url: &str) -> ProbeScore {
            if url.ends_with(".dat") {
                self.url_score
            } else {
                ProbeScore::NotSupported
            }
        }

        fn probe_data(&self, data: &[u8]) -> Option<(String, ProbeScore)> {
            let magic = self.magic?;
            data.starts_with(magic)
                .then(|| ("application/x-test".to_string(), ProbeScore::Supported))
        }
    }

    fn probe_descriptor(
        name: &str,
        url_score: ProbeScore,
        magic: Option<&'static [u8]>,
    ) -> Arc<FilterDescriptor> {
        FilterDescriptor::builder(name)
            .factory(move |_| {
                Ok(Box::new(Probe { url_score, magic }))
            })
            .build_shared()
    }

    fn session_with(descriptors: Vec<Arc<FilterDescriptor>>) -> Session {
        let registry = Arc::new(FilterRegistry::new());
        for d in descriptors {
            registry.register(d).unwrap();
        }
        Session::new(registry)
    }

    #[test]
    fn test_add_filter_unknown_name() {
        let session = session_with(vec![]);
        assert!(matches!(
            session.add_filter("nope", &[]),
            Err(Error::FilterNotFound(_))
        ));
    }

    #[test]
    fn test_add_filter_unknown_option() {
        let session = session_with(vec![probe_descriptor(
            "p",
            ProbeScore::Supported,
            None,
        )]);
        assert!(matches!(
            session.add_filter("p", &[("bogus", PropValue::Bool(true))]),
            Err(Error::UnknownOption { .. })
        ));
    }

    #[test]
    fn test_resolve_source_prefers_higher_score() {
        let session = session_with(vec![
            probe_descriptor("maybe", ProbeScore::MaybeSupported, None),
            probe_descriptor("sure", ProbeScore::Supported, None),
        ]);
        let best = session.resolve_source("clip.dat", None).unwrap();
        assert_eq!(best.name(), "sure");
    }

    #[test]
    fn test_resolve_source_data_probe_beats_url() {
        let session = session_with(vec![
            probe_descriptor("url-only", ProbeScore::MaybeSupported, None),
            probe_descriptor("sniffing", ProbeScore::NotSupported, Some(b"MAGI")),
        ]);
        let best = session
            .resolve_source("clip.dat", Some(b"MAGIc and more"))
            .unwrap();
        assert_eq!(best.name(), "sniffing");
    }

    #[test]
    fn test_resolve_source_none_match() {
        let session = session_with(vec![probe_descriptor(
            "p",
            ProbeScore::Supported,
            None,
        )]);
        assert!(session.resolve_source("clip.mp4", None).is_err());
    }
}
