//! Reference-counted packets.
//!
//! A [`Packet`] couples a payload with per-unit properties (timestamp,
//! duration, sync-point flag, byte offset, corruption flag, unit
//! markers). The payload is one of:
//!
//! - an exclusively-owned allocation ([`Packet::alloc`]),
//! - a zero-copy byte-range view over another packet's buffer
//!   ([`Packet::new_view`]), or
//! - a lazily-fetched external frame handle ([`Packet::external`]),
//!   where planes are pulled through a callback instead of being
//!   materialized up front (hardware frames).
//!
//! # Ownership
//!
//! A packet is mutable only while its creator holds the sole reference;
//! sending it to a port queue seals it. The backing buffer is released
//! when the last reference — including every zero-copy view — drops.
//! Buffer lifetimes are tracked by session-level [`PacketAccounting`] so
//! leaks and use-after-release show up as a non-zero outstanding count.

use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::props::PropertySnapshot;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Accounting
// ============================================================================

/// Session-wide payload accounting.
///
/// Every exclusively-owned buffer increments `allocated` on creation and
/// `released` when the last reference drops. Zero-copy views share the
/// source buffer and allocate nothing. `outstanding() == 0` after a
/// pipeline drains is the reference-count conservation property.
#[derive(Debug, Default)]
pub struct PacketAccounting {
    allocated: AtomicU64,
    released: AtomicU64,
}

impl PacketAccounting {
    /// Create fresh accounting state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total buffers ever allocated.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Total buffers released.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Buffers currently live.
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }

    fn record_alloc(&self) {
        self.allocated.fetch_add(1, Ordering::AcqRel);
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Buffer core
// ============================================================================

/// Owned byte buffer shared between a packet and its views.
struct BufferCore {
    data: Box<[u8]>,
    accounting: Arc<PacketAccounting>,
}

impl BufferCore {
    fn new(size: usize, accounting: Arc<PacketAccounting>) -> Arc<Self> {
        accounting.record_alloc();
        Arc::new(Self {
            data: vec![0u8; size].into_boxed_slice(),
            accounting,
        })
    }
}

impl Drop for BufferCore {
    fn drop(&mut self) {
        self.accounting.record_release();
    }
}

// ============================================================================
// External frame provider
// ============================================================================

/// Lazily-fetched external payload (hardware or deferred frames).
///
/// Instead of materializing bytes eagerly, the consumer pulls planes
/// through this callback interface. The provider is released when the
/// last packet referencing it drops.
pub trait FrameProvider: Send + Sync {
    /// Number of planes in the frame.
    fn plane_count(&self) -> usize;

    /// Fetch one plane's bytes. May perform the actual transfer.
    fn plane(&self, index: usize) -> Result<&[u8]>;
}

// ============================================================================
// Payload
// ============================================================================

enum Payload {
    /// Exclusive allocation (possibly zero-sized: pure signal packet).
    Owned(Arc<BufferCore>),
    /// Zero-copy byte-range view over another packet's buffer.
    View {
        source: Arc<BufferCore>,
        offset: usize,
        len: usize,
    },
    /// Lazily-fetched external frame.
    External(Arc<dyn FrameProvider>),
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        match self {
            Self::Owned(core) => Self::Owned(Arc::clone(core)),
            Self::View { source, offset, len } => Self::View {
                source: Arc::clone(source),
                offset: *offset,
                len: *len,
            },
            Self::External(provider) => Self::External(Arc::clone(provider)),
        }
    }
}

// ============================================================================
// Per-unit properties
// ============================================================================

/// Per-unit packet metadata.
#[derive(Debug, Clone)]
pub struct PacketProps {
    /// Presentation timestamp.
    pub pts: ClockTime,
    /// Decode timestamp, when it differs from `pts`.
    pub dts: ClockTime,
    /// Duration of this unit.
    pub duration: ClockTime,
    /// Random-access point (safe to start decoding here).
    pub sync_point: bool,
    /// Byte offset of this unit in the original source.
    pub byte_offset: Option<u64>,
    /// Unit is known corrupted or incomplete.
    pub corrupted: bool,
    /// First fragment of a larger unit.
    pub unit_start: bool,
    /// Last fragment of a larger unit.
    pub unit_end: bool,
    /// Property snapshot overriding the port snapshot for this packet
    /// onward. Installing this is the only way to change properties
    /// concurrently with in-flight data.
    pub overrides: Option<PropertySnapshot>,
}

impl Default for PacketProps {
    fn default() -> Self {
        Self {
            pts: ClockTime::NONE,
            dts: ClockTime::NONE,
            duration: ClockTime::NONE,
            sync_point: false,
            byte_offset: None,
            corrupted: false,
            unit_start: true,
            unit_end: true,
            overrides: None,
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A unit of data flowing through a port.
///
/// Cheap to clone (Arc increments); the payload itself is never copied.
pub struct Packet {
    payload: Payload,
    props: PacketProps,
    sealed: bool,
}

impl Packet {
    /// Allocate an exclusively-owned packet of `size` bytes.
    ///
    /// `size == 0` is permitted and produces a signal-only packet (for
    /// example a pure end marker).
    pub fn alloc(accounting: &Arc<PacketAccounting>, size: usize) -> Self {
        Self {
            payload: Payload::Owned(BufferCore::new(size, Arc::clone(accounting))),
            props: PacketProps::default(),
            sealed: false,
        }
    }

    /// Create a zero-copy view over a byte range of `source`.
    ///
    /// The source buffer stays alive until this view and all siblings
    /// drop. Views over external-provider packets are not supported.
    pub fn new_view(source: &Packet, offset: usize, len: usize) -> Result<Self> {
        let (core, base, source_len) = match &source.payload {
            Payload::Owned(core) => (Arc::clone(core), 0usize, core.data.len()),
            Payload::View { source, offset, len } => (Arc::clone(source), *offset, *len),
            Payload::External(_) => {
                return Err(Error::PacketUsage(
                    "cannot take a byte-range view of an external frame".into(),
                ));
            }
        };
        // Bound against the source packet's own extent, not the backing
        // buffer: a view of a view must not widen the window.
        if offset + len > source_len {
            return Err(Error::PacketUsage(format!(
                "view range {}..{} exceeds source size {}",
                offset,
                offset + len,
                source_len
            )));
        }
        Ok(Self {
            payload: Payload::View {
                source: core,
                offset: base + offset,
                len,
            },
            props: source.props.clone(),
            sealed: false,
        })
    }

    /// Wrap an external frame provider.
    pub fn external(provider: Arc<dyn FrameProvider>) -> Self {
        Self {
            payload: Payload::External(provider),
            props: PacketProps::default(),
            sealed: false,
        }
    }

    /// Payload bytes, for owned and view packets.
    ///
    /// Returns `None` for external frames; use [`Packet::frame`] there.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Owned(core) => Some(&core.data),
            Payload::View { source, offset, len } => Some(&source.data[*offset..*offset + *len]),
            Payload::External(_) => None,
        }
    }

    /// Mutable payload bytes.
    ///
    /// Only available before the packet is sent and while the creator
    /// holds the sole reference to the buffer.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if self.sealed {
            return Err(Error::PacketSealed);
        }
        match &mut self.payload {
            Payload::Owned(core) => match Arc::get_mut(core) {
                Some(core) => Ok(&mut core.data),
                None => Err(Error::PacketUsage(
                    "buffer is shared; cannot mutate".into(),
                )),
            },
            Payload::View { .. } => Err(Error::PacketUsage(
                "zero-copy views are read-only".into(),
            )),
            Payload::External(_) => Err(Error::PacketUsage(
                "external frames are read-only".into(),
            )),
        }
    }

    /// The external frame provider, if this packet wraps one.
    pub fn frame(&self) -> Option<&Arc<dyn FrameProvider>> {
        match &self.payload {
            Payload::External(provider) => Some(provider),
            _ => None,
        }
    }

    /// Payload size in bytes (0 for signal-only and external packets).
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Owned(core) => core.data.len(),
            Payload::View { len, .. } => *len,
            Payload::External(_) => 0,
        }
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-unit properties.
    pub fn props(&self) -> &PacketProps {
        &self.props
    }

    /// Mutable per-unit properties; an error once sent.
    pub fn props_mut(&mut self) -> Result<&mut PacketProps> {
        if self.sealed {
            return Err(Error::PacketSealed);
        }
        Ok(&mut self.props)
    }

    /// Copy the per-unit properties from another packet.
    ///
    /// Used by pass-through style filters so timestamps and flags
    /// survive without the filter enumerating them.
    pub fn copy_props_from(&mut self, other: &Packet) -> Result<()> {
        if self.sealed {
            return Err(Error::PacketSealed);
        }
        self.props = other.props.clone();
        Ok(())
    }

    /// Builder-style: set the presentation timestamp.
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.props.pts = pts;
        self
    }

    /// Builder-style: mark as a random-access point.
    pub fn with_sync_point(mut self, sync: bool) -> Self {
        self.props.sync_point = sync;
        self
    }

    /// Builder-style: set the source byte offset.
    pub fn with_byte_offset(mut self, offset: u64) -> Self {
        self.props.byte_offset = Some(offset);
        self
    }

    /// Check whether the packet has been sealed by a send.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seal the packet. Called by the port on send; afterwards all
    /// mutating accessors fail.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            props: self.props.clone(),
            sealed: self.sealed,
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.payload {
            Payload::Owned(_) => "owned",
            Payload::View { .. } => "view",
            Payload::External(_) => "external",
        };
        f.debug_struct("Packet")
            .field("kind", &kind)
            .field("len", &self.len())
            .field("pts", &self.props.pts)
            .field("sealed", &self.sealed)
            .finish()
    }
}
