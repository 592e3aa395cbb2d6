//! Clock and time types for the session.
//!
//! This module provides:
//! - [`ClockTime`]: a nanosecond timestamp type (8 bytes, Copy)
//! - [`SessionClock`]: the monotonic clock shared by every worker
//!
//! The session clock is created once at session start and torn down with
//! the session; it is internally synchronized and callable from any
//! worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// Timestamps on packets and in events use this type. Time is relative
/// to an arbitrary epoch, usually session start.
///
/// # Special Values
///
/// - `ClockTime::ZERO`: zero time
/// - `ClockTime::NONE`: invalid/unset time (sentinel value)
///
/// # Examples
///
/// ```rust
/// use sluice::clock::ClockTime;
///
/// let t = ClockTime::from_secs(1) + ClockTime::from_millis(500);
/// assert_eq!(t.millis(), 1500);
/// assert_eq!(format!("{}", t), "1.500s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Maximum representable time (one less than the NONE sentinel).
    pub const MAX: Self = Self(u64::MAX - 1);

    /// Invalid/unset time (sentinel value).
    pub const NONE: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Create from a timescale'd tick count (`ticks / timescale` seconds).
    ///
    /// This is how container timestamps are expressed: a 90 kHz stream
    /// carries `timescale = 90000`. A zero timescale yields NONE.
    #[inline]
    pub const fn from_scaled(ticks: u64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::NONE;
        }
        // Split to avoid overflow on large tick counts.
        let secs = ticks / timescale as u64;
        let rem = ticks % timescale as u64;
        Self(secs.saturating_mul(1_000_000_000) + rem * 1_000_000_000 / timescale as u64)
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Check if this is the NONE sentinel value.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check if this is a valid time (not NONE).
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }

    /// Convert to Option, returning None for the NONE sentinel.
    #[inline]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }

    /// Saturating addition. Returns NONE if either operand is NONE.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        let result = self.0.saturating_add(rhs.0);
        if result == u64::MAX { Self::MAX } else { Self(result) }
    }

    /// Saturating subtraction. Returns NONE if either operand is NONE.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<ClockTime> for Duration {
    #[inline]
    fn from(t: ClockTime) -> Self {
        if t.is_none() {
            Duration::ZERO
        } else {
            Duration::from_nanos(t.0)
        }
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}.{:03}s", self.secs(), (self.0 / 1_000_000) % 1000)
        }
    }
}

// ============================================================================
// SessionClock
// ============================================================================

/// Monotonic session clock.
///
/// Backed by `std::time::Instant`; time is relative to session start.
/// The clock also tracks the most recently observed media position so
/// rate-limited sinks can compute reschedule delays against it.
pub struct SessionClock {
    epoch: Instant,
    /// Last media position reported by a sink, in nanoseconds.
    media_position: AtomicU64,
}

impl SessionClock {
    /// Create a new clock with the current instant as epoch.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            media_position: AtomicU64::new(0),
        }
    }

    /// Get the elapsed session time.
    pub fn now(&self) -> ClockTime {
        ClockTime::from(self.epoch.elapsed())
    }

    /// Record the current media position (called by sinks).
    pub fn set_media_position(&self, position: ClockTime) {
        if position.is_some() {
            self.media_position.store(position.nanos(), Ordering::Release);
        }
    }

    /// Get the last recorded media position.
    pub fn media_position(&self) -> ClockTime {
        ClockTime::from_nanos(self.media_position.load(Ordering::Acquire))
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClock")
            .field("now", &self.now())
            .field("media_position", &self.media_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_time_arithmetic() {
        let a = ClockTime::from_secs(2);
        let b = ClockTime::from_millis(500);
        assert_eq!((a + b).millis(), 2500);
        assert_eq!((a - b).millis(), 1500);
        assert_eq!(b - a, ClockTime::ZERO); // saturating
    }

    #[test]
    fn test_none_propagates() {
        assert!(ClockTime::NONE.is_none());
        assert!((ClockTime::NONE + ClockTime::from_secs(1)).is_none());
        assert!((ClockTime::from_secs(1) - ClockTime::NONE).is_none());
        assert_eq!(ClockTime::NONE.to_option(), None);
    }

    #[test]
    fn test_from_scaled() {
        // 90 kHz timescale: 90000 ticks = 1 second
        assert_eq!(ClockTime::from_scaled(90_000, 90_000).secs(), 1);
        assert_eq!(ClockTime::from_scaled(45_000, 90_000).millis(), 500);
        assert!(ClockTime::from_scaled(100, 0).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ClockTime::from_millis(1234)), "1.234s");
        assert_eq!(format!("{}", ClockTime::NONE), "NONE");
    }

    #[test]
    fn test_session_clock_monotonic() {
        let clock = SessionClock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_media_position() {
        let clock = SessionClock::new();
        assert_eq!(clock.media_position(), ClockTime::ZERO);
        clock.set_media_position(ClockTime::from_secs(5));
        assert_eq!(clock.media_position().secs(), 5);
    }
}
