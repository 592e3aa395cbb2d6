//! Typed ports connecting filter instances.
//!
//! A port pairs a property snapshot (what flows here) with a FIFO packet
//! queue. The producer holds an [`OutputPort`], the consumer an
//! [`InputPort`]; both sides share the same [`PortShared`] core once the
//! session links them. A port has at most one peer.
//!
//! # Flow control
//!
//! Each queue carries watermarks. When occupancy reaches the high mark,
//! [`OutputPort::would_block`] turns true and a cooperative producer
//! stops sending; when the consumer drains the queue back to the low
//! mark, the producer side is woken again. Blocking is flow control,
//! not an error.
//!
//! # Property updates
//!
//! The snapshot is immutable once shared. Before the first packet the
//! producer may install new snapshots freely; afterwards an update
//! either rides on a packet as an override (applied when the consumer
//! pops that packet) or is installed between packets and flagged for
//! downstream reconfiguration.

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketAccounting};
use crate::props::{PropertyMap, PropertySnapshot};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

// ============================================================================
// Wake hooks
// ============================================================================

/// Wake hook installed by the scheduler on each side of a port.
///
/// The consumer side is woken when data or end-of-stream arrives; the
/// producer side when a blocked queue drains back to its low mark.
pub trait PortWaker: Send + Sync {
    /// Request that the owning instance be scheduled.
    fn wake(&self);
}

// ============================================================================
// Watermarks
// ============================================================================

/// Queue occupancy thresholds, in packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMarks {
    /// Producer blocks at or above this occupancy.
    pub high: usize,
    /// A blocked producer is re-woken once occupancy drains to this.
    pub low: usize,
}

impl WaterMarks {
    /// Create watermarks; `low` is clamped below `high`.
    pub fn new(high: usize, low: usize) -> Self {
        let high = high.max(1);
        Self {
            high,
            low: low.min(high - 1),
        }
    }
}

impl Default for WaterMarks {
    fn default() -> Self {
        Self { high: 16, low: 4 }
    }
}

// ============================================================================
// Shared core
// ============================================================================

/// Per-port statistics, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct PortStats {
    /// Packets successfully queued.
    pub sent: AtomicU64,
    /// Packets dropped because the port had no consumer.
    pub dropped_unconnected: AtomicU64,
}

/// State shared between the two sides of a port.
pub struct PortShared {
    name: Arc<str>,
    props: RwLock<PropertySnapshot>,
    queue: Mutex<VecDeque<Packet>>,
    /// Watermarks, adjustable at runtime (buffer hints raise them).
    high_mark: AtomicUsize,
    low_mark: AtomicUsize,
    connected: AtomicBool,
    eos: AtomicBool,
    /// Set when a snapshot was installed after packets already flowed;
    /// the session re-runs `configure_port` downstream and clears it.
    reconfigure_pending: AtomicBool,
    blocked: AtomicBool,
    consumer_waker: Mutex<Option<Arc<dyn PortWaker>>>,
    producer_waker: Mutex<Option<Arc<dyn PortWaker>>>,
    stats: PortStats,
}

impl PortShared {
    fn new(name: impl AsRef<str>, marks: WaterMarks) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name.as_ref()),
            props: RwLock::new(Arc::new(PropertyMap::new())),
            queue: Mutex::new(VecDeque::new()),
            high_mark: AtomicUsize::new(marks.high),
            low_mark: AtomicUsize::new(marks.low),
            connected: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            reconfigure_pending: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            consumer_waker: Mutex::new(None),
            producer_waker: Mutex::new(None),
            stats: PortStats::default(),
        })
    }

    fn wake_consumer(&self) {
        let guard = match self.consumer_waker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(waker) = guard.as_ref() {
            waker.wake();
        }
    }

    fn wake_producer(&self) {
        let guard = match self.producer_waker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(waker) = guard.as_ref() {
            waker.wake();
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Packet>> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for PortShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortShared")
            .field("name", &self.name)
            .field("connected", &self.connected.load(Ordering::Acquire))
            .field("eos", &self.eos.load(Ordering::Acquire))
            .field("queued", &self.lock_queue().len())
            .finish()
    }
}

// ============================================================================
// OutputPort (producer side)
// ============================================================================

/// Producer side of a port.
///
/// Owned by the filter instance that creates packets on it. Exists
/// before any consumer is linked; sends on an unconnected port are
/// dropped (counted and logged), never an error.
#[derive(Clone)]
pub struct OutputPort {
    shared: Arc<PortShared>,
    accounting: Arc<PacketAccounting>,
}

impl OutputPort {
    /// Create a new, unconnected output port.
    pub fn new(
        name: impl AsRef<str>,
        accounting: Arc<PacketAccounting>,
        marks: WaterMarks,
    ) -> Self {
        Self {
            shared: PortShared::new(name, marks),
            accounting,
        }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current property snapshot.
    pub fn props(&self) -> PropertySnapshot {
        match self.shared.props.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install a new property snapshot.
    ///
    /// Visible to the matcher immediately. If packets already flowed,
    /// the port is flagged for downstream reconfiguration.
    pub fn set_props(&self, props: PropertyMap) {
        let sent_before = self.shared.stats.sent.load(Ordering::Acquire);
        {
            let mut guard = match self.shared.props.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Arc::new(props);
        }
        if sent_before > 0 {
            self.shared.reconfigure_pending.store(true, Ordering::Release);
            self.shared.wake_consumer();
        }
    }

    /// Allocate a packet bound to this port's session accounting.
    pub fn new_packet(&self, size: usize) -> Packet {
        Packet::alloc(&self.accounting, size)
    }

    /// Create a zero-copy view packet over `source`.
    pub fn new_view(&self, source: &Packet, offset: usize, len: usize) -> Result<Packet> {
        Packet::new_view(source, offset, len)
    }

    /// Queue a packet for the consumer.
    ///
    /// Ownership transfers to the queue and the packet becomes
    /// immutable. On an unconnected port the packet is released
    /// immediately, counted, and logged.
    pub fn send(&self, mut packet: Packet) -> Result<()> {
        packet.seal();
        if !self.shared.connected.load(Ordering::Acquire) {
            self.shared
                .stats
                .dropped_unconnected
                .fetch_add(1, Ordering::AcqRel);
            warn!(port = %self.shared.name, "dropping packet sent on unconnected port");
            return Ok(());
        }
        {
            let mut queue = self.shared.lock_queue();
            queue.push_back(packet);
            if queue.len() >= self.shared.high_mark.load(Ordering::Acquire) {
                self.shared.blocked.store(true, Ordering::Release);
            }
        }
        self.shared.stats.sent.fetch_add(1, Ordering::AcqRel);
        self.shared.wake_consumer();
        Ok(())
    }

    /// Check whether the consumer queue is at or above its high mark.
    ///
    /// A cooperative producer consults this before allocating the next
    /// packet and yields when it is true.
    pub fn would_block(&self) -> bool {
        if !self.shared.connected.load(Ordering::Acquire) {
            return false;
        }
        self.shared.lock_queue().len() >= self.shared.high_mark.load(Ordering::Acquire)
    }

    /// Signal end-of-stream. No packets may follow.
    pub fn set_eos(&self) {
        self.shared.eos.store(true, Ordering::Release);
        self.shared.wake_consumer();
    }

    /// Check whether end-of-stream was signalled.
    pub fn is_eos(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire)
    }

    /// Check whether a consumer is linked.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Packets successfully queued over the port's lifetime.
    pub fn sent(&self) -> u64 {
        self.shared.stats.sent.load(Ordering::Acquire)
    }

    /// Packets currently sitting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Packets dropped for lack of a consumer.
    pub fn dropped_unconnected(&self) -> u64 {
        self.shared.stats.dropped_unconnected.load(Ordering::Acquire)
    }

    /// Replace the queue watermarks.
    ///
    /// Typically driven by an upstream buffer hint asking for deeper
    /// queuing. Raising the high mark above the current occupancy
    /// re-wakes a blocked producer.
    pub fn set_marks(&self, marks: WaterMarks) {
        self.shared.high_mark.store(marks.high, Ordering::Release);
        self.shared.low_mark.store(marks.low, Ordering::Release);
        let unblocked = self.shared.blocked.load(Ordering::Acquire)
            && self.shared.lock_queue().len() < marks.high;
        if unblocked {
            self.shared.blocked.store(false, Ordering::Release);
            self.shared.wake_producer();
        }
        debug!(port = %self.shared.name, high = marks.high, low = marks.low, "watermarks set");
    }

    /// Install the scheduler hook woken when the queue drains.
    pub fn set_producer_waker(&self, waker: Arc<dyn PortWaker>) {
        let mut guard = match self.shared.producer_waker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(waker);
    }

    /// Link a consumer to this port, yielding its [`InputPort`].
    ///
    /// Fails if the port already has a peer (single-peer invariant).
    pub fn connect(&self) -> Result<InputPort> {
        if self.shared.connected.swap(true, Ordering::AcqRel) {
            return Err(Error::Configuration {
                filter: String::new(),
                reason: format!("port '{}' already has a consumer", self.shared.name),
            });
        }
        debug!(port = %self.shared.name, "port connected");
        Ok(InputPort {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Detach the consumer, dropping any queued packets.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.lock_queue().clear();
        self.shared.blocked.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort").field("shared", &self.shared).finish()
    }
}

// ============================================================================
// InputPort (consumer side)
// ============================================================================

/// Consumer side of a port.
#[derive(Clone)]
pub struct InputPort {
    shared: Arc<PortShared>,
}

impl InputPort {
    /// Port name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current property snapshot.
    pub fn props(&self) -> PropertySnapshot {
        match self.shared.props.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Peek at the oldest queued packet without removing it.
    pub fn front(&self) -> Option<Packet> {
        self.shared.lock_queue().front().cloned()
    }

    /// Remove the oldest queued packet.
    ///
    /// If the packet carried a property override, that snapshot is
    /// installed on the port (merged over the current one) before the
    /// packet is released. Dropping from an empty queue is a diagnosed
    /// usage error, not silence.
    pub fn drop_front(&self) -> Result<()> {
        let (packet, drained_to_low) = {
            let mut queue = self.shared.lock_queue();
            let packet = queue.pop_front().ok_or_else(|| {
                Error::PacketUsage(format!(
                    "drop on port '{}' with no packet obtained",
                    self.shared.name
                ))
            })?;
            let drained = self.shared.blocked.load(Ordering::Acquire)
                && queue.len() <= self.shared.low_mark.load(Ordering::Acquire);
            (packet, drained)
        };
        if let Some(overrides) = &packet.props().overrides {
            let mut guard = match self.shared.props.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Arc::new(guard.merged_with(overrides));
        }
        if drained_to_low {
            self.shared.blocked.store(false, Ordering::Release);
            self.shared.wake_producer();
        }
        Ok(())
    }

    /// Number of queued packets.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Check for end-of-stream: signalled upstream and queue drained.
    pub fn is_eos(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire) && self.shared.lock_queue().is_empty()
    }

    /// Check whether upstream has signalled end-of-stream (packets may
    /// still be queued).
    pub fn eos_signalled(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire)
    }

    /// Check whether this input is the consumer side of `output`.
    pub fn is_fed_by(&self, output: &OutputPort) -> bool {
        Arc::ptr_eq(&self.shared, &output.shared)
    }

    /// Take the pending-reconfiguration flag, clearing it.
    pub fn take_reconfigure_pending(&self) -> bool {
        self.shared.reconfigure_pending.swap(false, Ordering::AcqRel)
    }

    /// Install the scheduler hook woken when data or EOS arrives.
    pub fn set_consumer_waker(&self, waker: Arc<dyn PortWaker>) {
        let mut guard = match self.shared.consumer_waker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(waker);
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort").field("shared", &self.shared).finish()
    }
}
