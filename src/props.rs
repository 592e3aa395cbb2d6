//! Typed property bags for ports and packets.
//!
//! A [`PropertyMap`] is an ordered key→typed-value snapshot describing
//! what flows on a port: stream type, codec id, dimensions, timescale,
//! and any number of custom keys. The key space is deliberately
//! open-ended so a producer does not need to enumerate every key a
//! future consumer might care about.
//!
//! # Snapshot discipline
//!
//! Snapshots are immutable once shared: a port installs a new
//! `Arc<PropertyMap>` between packets (copy-on-change), never mutating
//! the old one in place, so concurrent readers never observe a
//! half-updated bag.

use smallvec::SmallVec;
use std::sync::Arc;

// ============================================================================
// Keys
// ============================================================================

/// Property key: a fixed set of well-known keys plus an open-ended
/// custom namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropKey {
    /// Coarse stream classification.
    StreamType,
    /// Codec identifier (string, e.g. "avc1", "opus").
    CodecId,
    /// Video width in pixels.
    Width,
    /// Video height in pixels.
    Height,
    /// Audio sample rate in Hz.
    SampleRate,
    /// Audio channel count.
    NumChannels,
    /// Timestamp timescale (ticks per second).
    Timescale,
    /// Total duration, in timescale units.
    Duration,
    /// Upstream group identifier; consumers that must aggregate
    /// per-group inputs key off this.
    GroupId,
    /// Source URL.
    Url,
    /// MIME type.
    MimeType,
    /// Nominal bitrate in bits per second.
    Bitrate,
    /// Decoder configuration payload (out-of-band).
    DecoderConfig,
    /// Custom key, by name.
    Custom(Arc<str>),
}

impl PropKey {
    /// Create a custom key.
    pub fn custom(name: impl AsRef<str>) -> Self {
        Self::Custom(Arc::from(name.as_ref()))
    }

    /// Human-readable key name.
    pub fn name(&self) -> &str {
        match self {
            Self::StreamType => "stream-type",
            Self::CodecId => "codec-id",
            Self::Width => "width",
            Self::Height => "height",
            Self::SampleRate => "sample-rate",
            Self::NumChannels => "num-channels",
            Self::Timescale => "timescale",
            Self::Duration => "duration",
            Self::GroupId => "group-id",
            Self::Url => "url",
            Self::MimeType => "mime-type",
            Self::Bitrate => "bitrate",
            Self::DecoderConfig => "decoder-config",
            Self::Custom(name) => name,
        }
    }
}

/// Coarse stream classification carried under [`PropKey::StreamType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Raw or encoded video.
    Video,
    /// Raw or encoded audio.
    Audio,
    /// Subtitles and timed text.
    Text,
    /// Unparsed file/byte stream (sources before demuxing).
    File,
    /// Anything else.
    Other,
}

// ============================================================================
// Values
// ============================================================================

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Boolean.
    Bool(bool),
    /// Unsigned integer.
    Uint(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Rational (e.g. framerate, aspect ratio).
    Frac {
        /// Numerator.
        num: u32,
        /// Denominator.
        den: u32,
    },
    /// String value (cheaply cloneable).
    Str(Arc<str>),
    /// Opaque binary payload (cheaply cloneable).
    Data(Arc<[u8]>),
    /// Stream classification.
    Stream(StreamType),
}

impl PropValue {
    /// Get as unsigned integer, if that is the stored type.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as string, if that is the stored type.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as stream type, if that is the stored type.
    pub fn as_stream(&self) -> Option<StreamType> {
        match self {
            Self::Stream(s) => Some(*s),
            _ => None,
        }
    }

    /// Get as boolean, if that is the stored type.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<u32> for PropValue {
    fn from(v: u32) -> Self {
        Self::Uint(v as u64)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<StreamType> for PropValue {
    fn from(v: StreamType) -> Self {
        Self::Stream(v)
    }
}

// ============================================================================
// PropertyMap
// ============================================================================

/// Ordered key→value property snapshot.
///
/// Insertion order is preserved; `set` on an existing key replaces the
/// value in place so repeated configuration stays deterministic. Most
/// bags are small, so entries live in a `SmallVec`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    entries: SmallVec<[(PropKey, PropValue); 8]>,
}

impl PropertyMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any existing value for the key.
    pub fn set(&mut self, key: PropKey, value: impl Into<PropValue>) -> &mut Self {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: PropKey, value: impl Into<PropValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a property value.
    pub fn get(&self, key: &PropKey) -> Option<&PropValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove a property, returning its value if present.
    pub fn remove(&mut self, key: &PropKey) -> Option<PropValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Check if a key is present.
    pub fn contains(&self, key: &PropKey) -> bool {
        self.get(key).is_some()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&PropKey, &PropValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Merge all of `other`'s entries into `self`, overwriting on
    /// conflict.
    ///
    /// This is how the open-ended bag propagates across a filter without
    /// the filter enumerating keys it does not understand: copy the
    /// upstream snapshot, then overwrite the keys it actually changes.
    pub fn merge_from(&mut self, other: &PropertyMap) {
        for (k, v) in other.iter() {
            self.set(k.clone(), v.clone());
        }
    }

    /// Copy `other` on top of a clone of `self` (non-destructive merge).
    pub fn merged_with(&self, other: &PropertyMap) -> PropertyMap {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    /// Convenience: get the stream type.
    pub fn stream_type(&self) -> Option<StreamType> {
        self.get(&PropKey::StreamType).and_then(PropValue::as_stream)
    }

    /// Convenience: get the codec id string.
    pub fn codec_id(&self) -> Option<&str> {
        self.get(&PropKey::CodecId).and_then(PropValue::as_str)
    }

    /// Convenience: get the timescale, defaulting to nanoseconds.
    pub fn timescale(&self) -> u32 {
        self.get(&PropKey::Timescale)
            .and_then(PropValue::as_uint)
            .map(|v| v as u32)
            .unwrap_or(1_000_000_000)
    }
}

impl FromIterator<(PropKey, PropValue)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (PropKey, PropValue)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

/// Shared, immutable property snapshot.
pub type PropertySnapshot = Arc<PropertyMap>;
