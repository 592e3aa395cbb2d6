//! # sluice
//!
//! A typed, capability-negotiated dataflow engine: independent filters
//! connected through typed ports carrying reference-counted packets,
//! driven by a cooperative scheduler with backpressure.
//!
//! ## Architecture
//!
//! - [`registry`] — filter descriptors (capability bundles, options,
//!   factory) and deterministic capability matching
//! - [`filter`] — the [`Filter`](filter::Filter) trait, hook statuses,
//!   option binding, and live instances
//! - [`port`] — property snapshots, FIFO packet queues, watermark flow
//!   control
//! - [`packet`] — owned, zero-copy-view, and external-frame payloads
//!   with session-level reference accounting
//! - [`event`] — upstream control events and seek-index translation
//! - [`scheduler`] — worker pool, serial and blocking lanes, timers
//! - [`session`] — the root object wiring it all together
//! - [`filters`] — built-in sources, transforms, and sinks
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice::filters::{Capture, CaptureSink, CounterSource};
//! use sluice::props::PropValue;
//! use sluice::registry::FilterRegistry;
//! use sluice::session::Session;
//!
//! let registry = Arc::new(FilterRegistry::new());
//! registry.register(CounterSource::descriptor()).unwrap();
//! let capture = Capture::new();
//! registry.register(CaptureSink::descriptor(Arc::clone(&capture))).unwrap();
//!
//! let session = Session::new(registry);
//! session
//!     .add_filter("counter-src", &[("count", PropValue::Uint(5))])
//!     .unwrap();
//! session.run().unwrap();
//! assert_eq!(capture.count(), 5);
//! ```
//!
//! Filters are linked automatically: when a filter declares an output,
//! its property snapshot is matched against every registered
//! descriptor's input capability bundles and the best candidate is
//! instantiated and connected. Unmatched outputs stay unconnected and
//! are reported, never fatal.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod error;
pub mod event;
pub mod filter;
pub mod filters;
pub mod packet;
pub mod port;
pub mod props;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use clock::{ClockTime, SessionClock};
pub use error::{Error, Result};
pub use event::{Event, EventOutcome, SeekIndex};
pub use filter::{
    ConfigureOutcome, Filter, FilterCtx, FilterNode, FilterOption, InstanceId, LifecycleState,
    OptionValues, ProbeScore, ProcessStatus,
};
pub use packet::{FrameProvider, Packet, PacketAccounting};
pub use port::{InputPort, OutputPort, WaterMarks};
pub use props::{PropKey, PropValue, PropertyMap, PropertySnapshot, StreamType};
pub use registry::{CapBundle, CapPredicate, FilterDescriptor, FilterFlags, FilterRegistry};
pub use session::{Report, ReportKind, Session, SessionConfig};
