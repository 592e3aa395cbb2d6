//! The filter contract: the trait every processing unit implements,
//! the statuses its hooks return, and the option machinery binding
//! user-supplied values to declared option names.
//!
//! The core persists no state on behalf of a filter. Everything a
//! filter knows lives in its own struct; everything it is allowed to
//! touch during a hook arrives through [`FilterCtx`].

mod instance;

pub use instance::{FilterNode, InstanceId, InstanceStats, LifecycleState};

use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::event::{Event, EventOutcome};
use crate::port::{InputPort, OutputPort, WaterMarks};
use crate::props::{PropValue, PropertyMap};
use smallvec::SmallVec;
use std::sync::Arc;

// ============================================================================
// Hook results
// ============================================================================

/// Result of one `process()` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Work done; schedule again when input arrives.
    Ok,
    /// This instance has produced everything it ever will.
    Eos,
    /// Allocation failed; the scheduler retries a bounded number of
    /// times before treating it as fatal.
    OutOfMemory,
    /// Nothing to do right now; re-invoke after the delay.
    ///
    /// `ClockTime::ZERO` requests immediate re-invocation.
    Retry {
        /// Delay before the next invocation.
        after: ClockTime,
    },
    /// Unrecoverable failure; converted to end-of-stream on every
    /// output of this instance.
    Fatal {
        /// Failure description for the report channel.
        reason: String,
    },
}

/// Result of a successful `configure_port` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// The port is accepted by this instance.
    Ok,
    /// The port is valid but cannot join this instance (for example it
    /// belongs to a different input group). The session instantiates a
    /// sibling of the same descriptor and connects the port there.
    /// This is a first-class outcome, not an error.
    NewInstanceRequired,
}

/// Score returned by source probing, higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeScore {
    /// The filter cannot handle this source.
    NotSupported,
    /// The filter could handle it as a fallback.
    MaybeSupported,
    /// The filter recognizes the format.
    Supported,
}

// ============================================================================
// Hook context
// ============================================================================

/// Deferred requests a filter makes during a hook.
#[derive(Debug)]
pub(crate) enum CtxAction {
    /// Declare a new output port with an initial snapshot.
    AddOutput {
        name: String,
        props: PropertyMap,
        /// `None` takes the session default.
        marks: Option<WaterMarks>,
    },
    /// Emit an event on the upstream walk from this instance.
    SendUpstream(Event),
}

/// Everything a filter may touch during a hook invocation.
///
/// Ports are read directly; structural changes (new outputs, upstream
/// events) are recorded as deferred actions the session applies after
/// the hook returns, so a hook never re-enters session locks.
pub struct FilterCtx<'a> {
    /// Input ports, in connection order.
    pub inputs: &'a [InputPort],
    /// Output ports, in declaration order.
    pub outputs: &'a [OutputPort],
    pub(crate) actions: SmallVec<[CtxAction; 2]>,
}

impl<'a> FilterCtx<'a> {
    /// Build a context over explicit port slices.
    ///
    /// The session builds these around every hook call; filter authors
    /// use it directly to drive hooks in unit tests.
    pub fn new(inputs: &'a [InputPort], outputs: &'a [OutputPort]) -> Self {
        Self {
            inputs,
            outputs,
            actions: SmallVec::new(),
        }
    }

    /// Declare a new output port.
    ///
    /// The port materializes (and becomes matcher-visible) when the
    /// hook returns; its initial snapshot is `props`.
    pub fn add_output(&mut self, name: impl Into<String>, props: PropertyMap) {
        self.actions.push(CtxAction::AddOutput {
            name: name.into(),
            props,
            marks: None,
        });
    }

    /// Declare a new output port with explicit queue watermarks.
    pub fn add_output_with_marks(
        &mut self,
        name: impl Into<String>,
        props: PropertyMap,
        marks: WaterMarks,
    ) {
        self.actions.push(CtxAction::AddOutput {
            name: name.into(),
            props,
            marks: Some(marks),
        });
    }

    /// Send a control event upstream from this instance.
    pub fn send_upstream(&mut self, event: Event) {
        self.actions.push(CtxAction::SendUpstream(event));
    }
}

// ============================================================================
// Filter trait
// ============================================================================

/// A processing unit.
///
/// Hooks are invoked by the scheduler with at most one call in flight
/// per instance, so `&mut self` access is safe without internal locks.
/// Long-running work must be chunked across `process` invocations;
/// returning from a hook is the only suspension point.
pub trait Filter: Send {
    /// Called once after option binding, before any port is connected.
    fn initialize(&mut self, _ctx: &mut FilterCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once during teardown, after the last `process` call.
    fn finalize(&mut self) {}

    /// Accept, reject, or redirect an input port.
    ///
    /// Invoked on first connection and again after every upstream
    /// property change (`is_remove == false`), and on disconnection
    /// (`is_remove == true`). Must be idempotent: reconfiguring with
    /// identical properties succeeds without observable side effects.
    fn configure_port(
        &mut self,
        ctx: &mut FilterCtx<'_>,
        port: &InputPort,
        is_remove: bool,
    ) -> Result<ConfigureOutcome>;

    /// One scheduling quantum of work.
    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus;

    /// Decide an upstream event's fate at this hop.
    fn handle_event(&mut self, _event: &Event) -> EventOutcome {
        EventOutcome::Forward
    }

    /// Score this filter's ability to open `url` directly.
    fn probe_url(&self, _url: &str) -> ProbeScore {
        ProbeScore::NotSupported
    }

    /// Inspect leading source bytes; return a mime type and score if
    /// the format is recognized.
    fn probe_data(&self, _data: &[u8]) -> Option<(String, ProbeScore)> {
        None
    }

    /// Adapt an output to new downstream constraints.
    fn reconfigure_output(&mut self, _port: &OutputPort) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Options
// ============================================================================

/// One declared, typed, defaulted filter option.
#[derive(Debug, Clone)]
pub struct FilterOption {
    /// Stable option name, the binding key.
    pub name: &'static str,
    /// One-line help text.
    pub help: &'static str,
    /// Default value, also fixing the option's type.
    pub default: PropValue,
}

impl FilterOption {
    /// Declare an option.
    pub fn new(name: &'static str, help: &'static str, default: impl Into<PropValue>) -> Self {
        Self {
            name,
            help,
            default: default.into(),
        }
    }
}

/// Bound option values handed to a filter factory.
///
/// Produced by [`OptionValues::bind`]: declared defaults overlaid with
/// the user-supplied values. The core treats values as opaque beyond
/// stable name binding.
#[derive(Debug, Clone, Default)]
pub struct OptionValues {
    entries: SmallVec<[(Arc<str>, PropValue); 4]>,
}

impl OptionValues {
    /// Overlay user-supplied values on a filter's declared defaults.
    ///
    /// A value whose name matches no declaration is an
    /// [`Error::UnknownOption`].
    pub fn bind(
        filter: &str,
        declared: &[FilterOption],
        supplied: &[(&str, PropValue)],
    ) -> Result<Self> {
        let mut entries: SmallVec<[(Arc<str>, PropValue); 4]> = declared
            .iter()
            .map(|opt| (Arc::from(opt.name), opt.default.clone()))
            .collect();
        for (name, value) in supplied {
            match entries.iter_mut().find(|(n, _)| &**n == *name) {
                Some(entry) => entry.1 = value.clone(),
                None => {
                    return Err(Error::UnknownOption {
                        filter: filter.to_string(),
                        option: (*name).to_string(),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// All defaults, no user overlay.
    pub fn defaults(declared: &[FilterOption]) -> Self {
        Self {
            entries: declared
                .iter()
                .map(|opt| (Arc::from(opt.name), opt.default.clone()))
                .collect(),
        }
    }

    /// Look up a bound value.
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    /// Look up an unsigned integer option.
    pub fn get_uint(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(PropValue::as_uint)
    }

    /// Look up a boolean option.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropValue::as_bool)
    }

    /// Look up a string option.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropValue::as_str)
    }
}
