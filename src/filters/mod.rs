//! Built-in filters: small sources, transforms, and sinks used in
//! tests, examples, and as implementation references for external
//! filters.
//!
//! Each filter exposes a `descriptor(..)` constructor returning a ready
//! `Arc<FilterDescriptor>` for registration. Sinks and aggregators take
//! a shared handle at descriptor build time so callers can observe what
//! flowed through the graph.

use crate::clock::ClockTime;
use crate::error::Result;
use crate::event::{Event, EventOutcome, SeekIndex};
use crate::filter::{
    ConfigureOutcome, Filter, FilterCtx, FilterOption, ProcessStatus,
};
use crate::port::{InputPort, WaterMarks};
use crate::props::{PropKey, PropValue, PropertyMap, StreamType};
use crate::registry::{CapBundle, CapPredicate, FilterDescriptor, FilterFlags};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

// ============================================================================
// CounterSource
// ============================================================================

/// Emits `count` packets of `size` bytes, each filled with its ordinal,
/// then ends the stream.
pub struct CounterSource {
    count: u64,
    size: usize,
    codec: String,
    emitted: u64,
}

impl CounterSource {
    /// Descriptor for registration.
    ///
    /// Options: `count` (packets to emit), `size` (payload bytes),
    /// `codec` (codec id advertised on the output).
    pub fn descriptor() -> Arc<FilterDescriptor> {
        FilterDescriptor::builder("counter-src")
            .help("emits a fixed number of numbered packets")
            .option(FilterOption::new("count", "packets to emit", 10u64))
            .option(FilterOption::new("size", "payload size in bytes", 64u64))
            .option(FilterOption::new("codec", "advertised codec id", "counter"))
            .factory(|opts| {
                Ok(Box::new(CounterSource {
                    count: opts.get_uint("count").unwrap_or(10),
                    size: opts.get_uint("size").unwrap_or(64) as usize,
                    codec: opts.get_str("codec").unwrap_or("counter").to_string(),
                    emitted: 0,
                }))
            })
            .build_shared()
    }
}

impl Filter for CounterSource {
    fn initialize(&mut self, ctx: &mut FilterCtx<'_>) -> Result<()> {
        ctx.add_output(
            "out",
            PropertyMap::new()
                .with(PropKey::StreamType, StreamType::Other)
                .with(PropKey::CodecId, self.codec.as_str()),
        );
        Ok(())
    }

    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(out) = ctx.outputs.first() else {
            return ProcessStatus::Eos;
        };
        while self.emitted < self.count {
            if out.would_block() {
                // Flow control: the drain wake resumes us.
                return ProcessStatus::Ok;
            }
            let mut pck = out.new_packet(self.size);
            let ordinal = (self.emitted % 256) as u8;
            match pck.data_mut() {
                Ok(data) => data.fill(ordinal),
                Err(_) => return ProcessStatus::OutOfMemory,
            }
            let pck = pck
                .with_pts(ClockTime::from_millis(self.emitted * 40))
                .with_sync_point(true);
            if out.send(pck).is_err() {
                return ProcessStatus::Fatal {
                    reason: "send failed".into(),
                };
            }
            self.emitted += 1;
        }
        ProcessStatus::Eos
    }

    /// A counter is a true source: every event terminates here. `Stop`
    /// cuts emission short; seeks and speed changes have no meaning for
    /// synthetic data and are acknowledged without effect, the same way
    /// a live capture source answers events it cannot honor.
    fn handle_event(&mut self, event: &Event) -> EventOutcome {
        match event {
            Event::Stop => {
                self.emitted = self.count;
                EventOutcome::Consumed
            }
            _ => EventOutcome::Consumed,
        }
    }
}

// ============================================================================
// PassThrough
// ============================================================================

/// Forwards every packet unchanged, mirroring the upstream snapshot on
/// its own output.
pub struct PassThrough {
    output_declared: bool,
}

impl PassThrough {
    /// Descriptor accepting any stream whose codec id is present.
    pub fn descriptor() -> Arc<FilterDescriptor> {
        FilterDescriptor::builder("passthrough")
            .help("forwards packets unchanged")
            .input_bundle(CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId)))
            .factory(|_| Ok(Box::new(PassThrough { output_declared: false })))
            .build_shared()
    }
}

impl Filter for PassThrough {
    fn configure_port(
        &mut self,
        ctx: &mut FilterCtx<'_>,
        port: &InputPort,
        is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        if !is_remove && !self.output_declared {
            self.output_declared = true;
            ctx.add_output("out", (*port.props()).clone());
        }
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(out) = ctx.outputs.first() else {
            return ProcessStatus::Ok;
        };
        let mut all_eos = !ctx.inputs.is_empty();
        for input in ctx.inputs {
            while let Some(pck) = input.front() {
                if out.would_block() {
                    return ProcessStatus::Ok;
                }
                if out.send(pck).is_err() {
                    return ProcessStatus::Fatal {
                        reason: "forward failed".into(),
                    };
                }
                if input.drop_front().is_err() {
                    return ProcessStatus::Fatal {
                        reason: "queue desync".into(),
                    };
                }
            }
            all_eos &= input.is_eos();
        }
        if all_eos {
            ProcessStatus::Eos
        } else {
            ProcessStatus::Ok
        }
    }
}

// ============================================================================
// CaptureSink
// ============================================================================

/// Shared observation handle for [`CaptureSink`].
#[derive(Debug, Default)]
pub struct Capture {
    payloads: Mutex<Vec<Vec<u8>>>,
    timestamps: Mutex<Vec<ClockTime>>,
    finished: AtomicBool,
}

impl Capture {
    /// Fresh handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Payloads received so far, in arrival order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        match self.payloads.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Presentation timestamps in arrival order.
    pub fn timestamps(&self) -> Vec<ClockTime> {
        match self.timestamps.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Packets received so far.
    pub fn count(&self) -> usize {
        self.payloads().len()
    }

    /// Whether the sink observed end-of-stream.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn record(&self, payload: &[u8], pts: ClockTime) {
        match self.payloads.lock() {
            Ok(mut g) => g.push(payload.to_vec()),
            Err(poisoned) => poisoned.into_inner().push(payload.to_vec()),
        }
        match self.timestamps.lock() {
            Ok(mut g) => g.push(pts),
            Err(poisoned) => poisoned.into_inner().push(pts),
        }
    }
}

/// Consumes everything and records it on a [`Capture`] handle.
pub struct CaptureSink {
    capture: Arc<Capture>,
}

impl CaptureSink {
    /// Descriptor recording into `capture`; accepts any stream with a
    /// codec id, at low priority so transforms win over it.
    pub fn descriptor(capture: Arc<Capture>) -> Arc<FilterDescriptor> {
        Self::descriptor_matching(
            capture,
            CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId)),
        )
    }

    /// Descriptor with an explicit input bundle.
    pub fn descriptor_matching(
        capture: Arc<Capture>,
        bundle: CapBundle,
    ) -> Arc<FilterDescriptor> {
        FilterDescriptor::builder("capture-sink")
            .help("records every packet for inspection")
            .priority(10)
            .input_bundle(bundle)
            .factory(move |_| {
                Ok(Box::new(CaptureSink {
                    capture: Arc::clone(&capture),
                }))
            })
            .build_shared()
    }
}

impl Filter for CaptureSink {
    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let mut all_eos = !ctx.inputs.is_empty();
        for input in ctx.inputs {
            while let Some(pck) = input.front() {
                let payload = pck.data().unwrap_or(&[]).to_vec();
                self.capture.record(&payload, pck.props().pts);
                if input.drop_front().is_err() {
                    return ProcessStatus::Fatal {
                        reason: "queue desync".into(),
                    };
                }
            }
            all_eos &= input.is_eos();
        }
        if all_eos {
            self.capture.finished.store(true, Ordering::Release);
            ProcessStatus::Eos
        } else {
            ProcessStatus::Ok
        }
    }
}

// ============================================================================
// GroupAggregator
// ============================================================================

/// Shared observation handle for [`GroupAggregator`].
#[derive(Debug, Default)]
pub struct AggregateLog {
    consumed: AtomicU64,
    completed: AtomicBool,
}

impl AggregateLog {
    /// Fresh handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total packets consumed across all inputs.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Whether every input reached end-of-stream.
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Consumes multiple inputs of one group.
///
/// The first configured input fixes the instance's group id; a port
/// carrying a different group id is answered with
/// `NewInstanceRequired`, so each group gets its own isolated sibling.
pub struct GroupAggregator {
    group: Option<PropValue>,
    log: Arc<AggregateLog>,
}

impl GroupAggregator {
    /// Descriptor recording into `log`.
    pub fn descriptor(log: Arc<AggregateLog>) -> Arc<FilterDescriptor> {
        FilterDescriptor::builder("group-agg")
            .help("aggregates all inputs of one group")
            .flags(FilterFlags::DYNAMIC_REUSE)
            .max_extra_ports(16)
            .input_bundle(CapBundle::new().with(CapPredicate::require_present(PropKey::GroupId)))
            .factory(move |_| {
                Ok(Box::new(GroupAggregator {
                    group: None,
                    log: Arc::clone(&log),
                }))
            })
            .build_shared()
    }
}

impl Filter for GroupAggregator {
    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        port: &InputPort,
        is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        if is_remove {
            return Ok(ConfigureOutcome::Ok);
        }
        let gid = port.props().get(&PropKey::GroupId).cloned();
        match (&self.group, gid) {
            (None, gid) => {
                self.group = gid;
                Ok(ConfigureOutcome::Ok)
            }
            (Some(mine), Some(theirs)) if *mine == theirs => Ok(ConfigureOutcome::Ok),
            _ => {
                debug!("input belongs to a different group");
                Ok(ConfigureOutcome::NewInstanceRequired)
            }
        }
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let mut all_eos = !ctx.inputs.is_empty();
        for input in ctx.inputs {
            while input.front().is_some() {
                if input.drop_front().is_err() {
                    return ProcessStatus::Fatal {
                        reason: "queue desync".into(),
                    };
                }
                self.log.consumed.fetch_add(1, Ordering::AcqRel);
            }
            all_eos &= input.is_eos();
        }
        if all_eos {
            self.log.completed.store(true, Ordering::Release);
            ProcessStatus::Eos
        } else {
            // Wait for the next wake; a stalled sibling input must not
            // make this instance look stalled itself.
            ProcessStatus::Ok
        }
    }
}

// ============================================================================
// IndexedSource
// ============================================================================

/// Seekable byte source.
///
/// Serves fixed-size chunks of an in-memory blob, maintains a coarse
/// time→byte [`SeekIndex`] (one entry per chunk), and honors seek
/// events: a time seek resolves through the index, a byte seek
/// repositions directly. Buffered partial state is discarded on every
/// seek. A buffer hint deepens the output queue so that much media can
/// sit queued ahead of the consumer.
pub struct IndexedSource {
    data: Arc<[u8]>,
    chunk: usize,
    chunk_duration: ClockTime,
    index: SeekIndex,
    pos: usize,
    stopped: bool,
    pending_hint: Option<ClockTime>,
}

impl IndexedSource {
    /// Descriptor serving `data` in `chunk`-byte units, each covering
    /// `chunk_duration` of media time.
    pub fn descriptor(
        data: Arc<[u8]>,
        chunk: usize,
        chunk_duration: ClockTime,
    ) -> Arc<FilterDescriptor> {
        FilterDescriptor::builder("indexed-src")
            .help("seekable in-memory byte source")
            .factory(move |_| {
                let chunk = chunk.max(1);
                let mut index = SeekIndex::new();
                let mut time = ClockTime::ZERO;
                let mut offset = 0usize;
                while offset < data.len() {
                    index.push(time, offset as u64);
                    time = time + chunk_duration;
                    offset += chunk;
                }
                Ok(Box::new(IndexedSource {
                    data: Arc::clone(&data),
                    chunk,
                    chunk_duration,
                    index,
                    pos: 0,
                    stopped: false,
                    pending_hint: None,
                }))
            })
            .build_shared()
    }

    fn pts_at(&self, pos: usize) -> ClockTime {
        let chunk_index = (pos / self.chunk) as u64;
        ClockTime::from_nanos(chunk_index.saturating_mul(self.chunk_duration.nanos()))
    }
}

impl Filter for IndexedSource {
    fn initialize(&mut self, ctx: &mut FilterCtx<'_>) -> Result<()> {
        ctx.add_output(
            "out",
            PropertyMap::new()
                .with(PropKey::StreamType, StreamType::File)
                .with(PropKey::CodecId, "bytes"),
        );
        Ok(())
    }

    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(out) = ctx.outputs.first() else {
            return ProcessStatus::Eos;
        };
        // Events only see `&mut self`; port changes they request are
        // applied here, at the start of the next quantum.
        if let Some(duration) = self.pending_hint.take() {
            if duration != ClockTime::NONE {
                let per_chunk = self.chunk_duration.nanos().max(1);
                let chunks = (duration.nanos() / per_chunk).max(1) as usize;
                out.set_marks(WaterMarks::new(chunks, chunks / 2));
            }
        }
        while !self.stopped && self.pos < self.data.len() {
            if out.would_block() {
                return ProcessStatus::Ok;
            }
            let end = (self.pos + self.chunk).min(self.data.len());
            let mut pck = out.new_packet(end - self.pos);
            match pck.data_mut() {
                Ok(dst) => dst.copy_from_slice(&self.data[self.pos..end]),
                Err(_) => return ProcessStatus::OutOfMemory,
            }
            let pck = pck
                .with_pts(self.pts_at(self.pos))
                .with_byte_offset(self.pos as u64)
                .with_sync_point(self.pos % self.chunk == 0);
            if out.send(pck).is_err() {
                return ProcessStatus::Fatal {
                    reason: "send failed".into(),
                };
            }
            self.pos = end;
        }
        ProcessStatus::Eos
    }

    fn handle_event(&mut self, event: &Event) -> EventOutcome {
        match event {
            Event::SeekTime { target } => {
                // Resolve through the index; a target past the end
                // clamps to the last entry. No index means resume from
                // the current position.
                if let Some(entry) = self.index.resolve(*target) {
                    self.pos = entry.byte_offset as usize;
                    debug!(pos = self.pos, "seek (time) repositioned");
                }
                EventOutcome::Consumed
            }
            Event::SeekBytes { offset } => {
                // Snap to the containing chunk boundary.
                let pos = (*offset as usize).min(self.data.len());
                self.pos = pos - pos % self.chunk;
                debug!(pos = self.pos, "seek (bytes) repositioned");
                EventOutcome::Consumed
            }
            Event::Stop => {
                self.stopped = true;
                EventOutcome::Consumed
            }
            Event::BufferHint { duration } => {
                self.pending_hint = Some(*duration);
                EventOutcome::Consumed
            }
            _ => EventOutcome::Consumed,
        }
    }
}
