//! Control events travelling upstream through the graph.
//!
//! Playback-control events originate at sinks and walk the graph
//! against the data direction, one edge at a time. At each hop the
//! owning filter decides the event's fate through
//! [`EventOutcome`]: pass it on unchanged, rewrite it (the canonical
//! case is translating a time seek into a byte seek using a coarse
//! [`SeekIndex`]), or consume it and halt propagation.
//!
//! Events are plain values: not reference counted, carrying no
//! identity. A filter that consumes an event and later reissues an
//! equivalent one has created a new event; idempotent redelivery is the
//! reissuer's responsibility.

use crate::clock::ClockTime;
use smallvec::SmallVec;

// ============================================================================
// Events
// ============================================================================

/// A control event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Start or resume playback from `start`.
    Play {
        /// Position to start from; NONE resumes from the current
        /// position.
        start: ClockTime,
        /// Playback speed (1.0 = realtime).
        speed: f64,
    },
    /// Stop playback; sources cease producing.
    Stop,
    /// Seek to a media time. Rewritten to [`Event::SeekBytes`] by the
    /// first filter that owns a byte-level index of its source.
    SeekTime {
        /// Seek target.
        target: ClockTime,
    },
    /// Seek to a byte offset in the source.
    SeekBytes {
        /// Absolute source offset.
        offset: u64,
    },
    /// Change playback speed without repositioning.
    SetSpeed {
        /// New speed factor.
        speed: f64,
    },
    /// Pre-buffering hint: downstream would like this much media
    /// queued before playback starts.
    BufferHint {
        /// Desired buffered duration.
        duration: ClockTime,
    },
}

/// What a filter decided to do with an event at its hop.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Pass the event to the next upstream edge unchanged.
    Forward,
    /// Replace the event with a rewritten one and keep walking.
    Rewritten(Event),
    /// The event is fully handled; propagation halts here.
    Consumed,
}

// ============================================================================
// Seek index
// ============================================================================

/// One coarse random-access entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Media time of the entry.
    pub time: ClockTime,
    /// Byte offset in the source where decoding may start.
    pub byte_offset: u64,
}

/// Coarse time→byte index for seek translation.
///
/// Entries are kept sorted by time. Resolution picks the greatest entry
/// whose time does not exceed the target; a target past the end clamps
/// to the last entry, and a target before the first entry resolves to
/// the first.
#[derive(Debug, Clone, Default)]
pub struct SeekIndex {
    entries: SmallVec<[IndexEntry; 16]>,
}

impl SeekIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, keeping the index sorted by time.
    pub fn push(&mut self, time: ClockTime, byte_offset: u64) {
        let entry = IndexEntry { time, byte_offset };
        match self.entries.binary_search_by_key(&time, |e| e.time) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a seek target to an index entry.
    ///
    /// Returns `None` only when the index is empty; callers degrade to
    /// resuming from the current position in that case.
    pub fn resolve(&self, target: ClockTime) -> Option<IndexEntry> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries.binary_search_by_key(&target, |e| e.time) {
            Ok(pos) => Some(self.entries[pos]),
            // Insertion point 0 means the target precedes every entry.
            Err(0) => Some(self.entries[0]),
            Err(pos) => Some(self.entries[pos - 1]),
        }
    }

    /// Rewrite a time seek into a byte seek through this index.
    ///
    /// Non-seek events and an empty index leave the event untouched.
    pub fn rewrite(&self, event: &Event) -> EventOutcome {
        match event {
            Event::SeekTime { target } => match self.resolve(*target) {
                Some(entry) => EventOutcome::Rewritten(Event::SeekBytes {
                    offset: entry.byte_offset,
                }),
                None => EventOutcome::Forward,
            },
            _ => EventOutcome::Forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> SeekIndex {
        let mut idx = SeekIndex::new();
        idx.push(ClockTime::from_secs(0), 0);
        idx.push(ClockTime::from_secs(10), 1_000);
        idx.push(ClockTime::from_secs(20), 2_000);
        idx
    }

    #[test]
    fn test_resolve_exact_hit() {
        let idx = index();
        assert_eq!(
            idx.resolve(ClockTime::from_secs(10)).unwrap().byte_offset,
            1_000
        );
    }

    #[test]
    fn test_resolve_rounds_down() {
        let idx = index();
        // 15s falls between entries: pick the greatest at or below.
        assert_eq!(
            idx.resolve(ClockTime::from_secs(15)).unwrap().byte_offset,
            1_000
        );
    }

    #[test]
    fn test_resolve_clamps_past_end() {
        let idx = index();
        assert_eq!(
            idx.resolve(ClockTime::from_secs(500)).unwrap().byte_offset,
            2_000
        );
    }

    #[test]
    fn test_resolve_before_first() {
        let mut idx = SeekIndex::new();
        idx.push(ClockTime::from_secs(5), 500);
        assert_eq!(
            idx.resolve(ClockTime::from_secs(1)).unwrap().byte_offset,
            500
        );
    }

    #[test]
    fn test_empty_index_degrades() {
        let idx = SeekIndex::new();
        assert_eq!(idx.resolve(ClockTime::from_secs(1)), None);
        let event = Event::SeekTime {
            target: ClockTime::from_secs(1),
        };
        assert_eq!(idx.rewrite(&event), EventOutcome::Forward);
    }

    #[test]
    fn test_rewrite_time_seek() {
        let idx = index();
        let event = Event::SeekTime {
            target: ClockTime::from_secs(12),
        };
        assert_eq!(
            idx.rewrite(&event),
            EventOutcome::Rewritten(Event::SeekBytes { offset: 1_000 })
        );
    }

    #[test]
    fn test_rewrite_leaves_other_events() {
        let idx = index();
        let untouched = [
            Event::Stop,
            Event::Play {
                start: ClockTime::NONE,
                speed: 1.0,
            },
            Event::SetSpeed { speed: 2.0 },
            Event::BufferHint {
                duration: ClockTime::from_secs(2),
            },
            Event::SeekBytes { offset: 42 },
        ];
        for event in untouched {
            assert_eq!(idx.rewrite(&event), EventOutcome::Forward);
        }
    }

    #[test]
    fn test_push_keeps_sorted() {
        let mut idx = SeekIndex::new();
        idx.push(ClockTime::from_secs(20), 2_000);
        idx.push(ClockTime::from_secs(0), 0);
        idx.push(ClockTime::from_secs(10), 1_000);
        assert_eq!(
            idx.resolve(ClockTime::from_secs(11)).unwrap().byte_offset,
            1_000
        );
    }
}
