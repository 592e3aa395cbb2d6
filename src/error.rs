//! Error types for sluice.

use thiserror::Error;

/// Result type alias using sluice's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for session operations.
///
/// The taxonomy separates completion signals (which are *not* errors and
/// live in [`crate::filter::ProcessStatus`]) from genuine failures:
/// configuration errors stay local to one instance, resource errors may
/// be retried a bounded number of times, protocol errors are resynced
/// where the format allows, and graph errors are observable but never
/// abort sibling branches.
#[derive(Error, Debug)]
pub enum Error {
    /// A required property is missing or incompatible at configure time.
    ///
    /// Local to one instance; tearing it down must not affect siblings.
    #[error("configuration error on '{filter}': {reason}")]
    Configuration {
        /// Name of the filter instance that failed to configure.
        filter: String,
        /// Why configuration failed.
        reason: String,
    },

    /// Allocation or open failure; retryable a bounded number of times.
    #[error("resource error: {0}")]
    Resource(String),

    /// Corrupt or non-compliant data that could not be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No consumer could be matched for an output port.
    ///
    /// Non-fatal: the port stays unconnected and the rest of the graph
    /// keeps running.
    #[error("no consumer found for output '{port}' of '{filter}'")]
    NoConsumer {
        /// Owning filter name.
        filter: String,
        /// Port name.
        port: String,
    },

    /// Unknown filter name passed to the registry or session.
    #[error("filter not registered: {0}")]
    FilterNotFound(String),

    /// Unknown option name bound to a filter.
    #[error("unknown option '{option}' for filter '{filter}'")]
    UnknownOption {
        /// Filter name.
        filter: String,
        /// Offending option name.
        option: String,
    },

    /// Operation on a packet the caller never obtained, or a second
    /// drop of the same packet.
    #[error("packet usage error: {0}")]
    PacketUsage(String),

    /// Attempt to mutate a packet after it was sent.
    #[error("packet is immutable once sent")]
    PacketSealed,

    /// The session was already stopped or torn down.
    #[error("session is shut down")]
    SessionClosed,

    /// A filter hook failed fatally; converted to end-of-stream on all
    /// of that instance's outputs.
    #[error("fatal filter error in '{filter}': {reason}")]
    Fatal {
        /// Filter name.
        filter: String,
        /// Failure description.
        reason: String,
    },

    /// I/O error from a peripheral filter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check whether this error may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Resource(_) | Error::Io(_))
    }

    /// Check whether this error aborts the whole graph.
    ///
    /// Only [`Error::Fatal`] and [`Error::SessionClosed`] do; everything
    /// else is absorbed at the instance boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. } | Error::SessionClosed)
    }
}
