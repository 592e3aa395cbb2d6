//! Capability predicates, bundles, and the deterministic matcher.
//!
//! A bundle is the conjunction of predicates over a property snapshot.
//! A snapshot matches a bundle iff every required predicate holds and
//! no excluded predicate holds; keys the bundle never mentions are
//! don't-care. Matching is a pure function: identical snapshot and
//! registry state always produce the identical ordered candidate list.

use crate::props::{PropKey, PropValue, PropertyMap};
use crate::registry::descriptor::FilterDescriptor;
use smallvec::SmallVec;
use std::sync::Arc;

// ============================================================================
// Predicates
// ============================================================================

/// Accepted values of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Accept {
    /// Any value of the key is accepted (the key must still be
    /// present for a required predicate to hold).
    Any,
    /// One of these exact values.
    Values(SmallVec<[PropValue; 2]>),
}

/// Whether a predicate requires or forbids its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateMode {
    /// Must hold for the bundle to match.
    Required,
    /// Must not hold; a snapshot carrying an accepted value is
    /// rejected.
    Excluded,
}

/// When a predicate is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateScope {
    /// Must match at graph-build time and never changes afterwards.
    Static,
    /// Re-evaluated whenever the upstream snapshot changes.
    Dynamic,
}

/// One capability predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct CapPredicate {
    /// Property key the predicate constrains.
    pub key: PropKey,
    /// Accepted value set.
    pub accept: Accept,
    /// Required or excluded.
    pub mode: PredicateMode,
    /// Static or dynamic evaluation.
    pub scope: PredicateScope,
}

impl CapPredicate {
    /// Required predicate accepting exactly one value.
    pub fn require(key: PropKey, value: impl Into<PropValue>) -> Self {
        Self {
            key,
            accept: Accept::Values(smallvec::smallvec![value.into()]),
            mode: PredicateMode::Required,
            scope: PredicateScope::Static,
        }
    }

    /// Required predicate accepting any of the listed values.
    pub fn require_any_of(key: PropKey, values: impl IntoIterator<Item = PropValue>) -> Self {
        Self {
            key,
            accept: Accept::Values(values.into_iter().collect()),
            mode: PredicateMode::Required,
            scope: PredicateScope::Static,
        }
    }

    /// Required wildcard: the key must be present, any value.
    pub fn require_present(key: PropKey) -> Self {
        Self {
            key,
            accept: Accept::Any,
            mode: PredicateMode::Required,
            scope: PredicateScope::Static,
        }
    }

    /// Excluded predicate rejecting one value.
    pub fn exclude(key: PropKey, value: impl Into<PropValue>) -> Self {
        Self {
            key,
            accept: Accept::Values(smallvec::smallvec![value.into()]),
            mode: PredicateMode::Excluded,
            scope: PredicateScope::Static,
        }
    }

    /// Mark the predicate dynamic (re-evaluated on reconfiguration).
    pub fn dynamic(mut self) -> Self {
        self.scope = PredicateScope::Dynamic;
        self
    }

    /// Whether the snapshot satisfies the accepted-value test.
    fn value_accepted(&self, snapshot: &PropertyMap) -> bool {
        match snapshot.get(&self.key) {
            None => false,
            Some(actual) => match &self.accept {
                Accept::Any => true,
                Accept::Values(values) => values.iter().any(|v| v == actual),
            },
        }
    }

    /// Evaluate the predicate against a snapshot.
    pub fn holds(&self, snapshot: &PropertyMap) -> bool {
        match self.mode {
            PredicateMode::Required => self.value_accepted(snapshot),
            PredicateMode::Excluded => !self.value_accepted(snapshot),
        }
    }
}

// ============================================================================
// Bundles
// ============================================================================

/// Conjunction of predicates describing one acceptable configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapBundle {
    predicates: SmallVec<[CapPredicate; 4]>,
}

impl CapBundle {
    /// Empty bundle: matches every snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bundle from predicates.
    pub fn of(predicates: impl IntoIterator<Item = CapPredicate>) -> Self {
        Self {
            predicates: predicates.into_iter().collect(),
        }
    }

    /// Builder-style predicate append.
    pub fn with(mut self, predicate: CapPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// The predicates.
    pub fn predicates(&self) -> &[CapPredicate] {
        &self.predicates
    }

    /// Evaluate the whole bundle.
    pub fn matches(&self, snapshot: &PropertyMap) -> bool {
        self.predicates.iter().all(|p| p.holds(snapshot))
    }

    /// Evaluate only dynamic predicates (static ones were fixed at
    /// build time and by contract have not changed).
    pub fn matches_dynamic(&self, snapshot: &PropertyMap) -> bool {
        self.predicates
            .iter()
            .filter(|p| p.scope == PredicateScope::Dynamic)
            .all(|p| p.holds(snapshot))
    }

    /// Wildcard count, the specificity tie-breaker: fewer wildcards is
    /// more specific.
    pub fn wildcards(&self) -> usize {
        self.predicates
            .iter()
            .filter(|p| matches!(p.accept, Accept::Any))
            .count()
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// One match: a descriptor and the input bundle index that accepted
/// the snapshot.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// The matched descriptor.
    pub descriptor: Arc<FilterDescriptor>,
    /// Index into `descriptor.input_caps()`.
    pub bundle_index: usize,
    /// Registration order, the final tie-breaker.
    pub registration_order: usize,
}

/// Match a snapshot against a descriptor list.
///
/// For each descriptor the first matching input bundle (in declaration
/// order) is the candidate. Candidates are sorted by priority (lower
/// first), then bundle specificity (fewer wildcards first), then
/// registration order. Deterministic by construction.
pub fn match_snapshot(
    descriptors: &[Arc<FilterDescriptor>],
    snapshot: &PropertyMap,
) -> SmallVec<[MatchCandidate; 4]> {
    let mut out: SmallVec<[MatchCandidate; 4]> = SmallVec::new();
    for (order, desc) in descriptors.iter().enumerate() {
        let hit = desc
            .input_caps()
            .iter()
            .position(|bundle| bundle.matches(snapshot));
        if let Some(bundle_index) = hit {
            out.push(MatchCandidate {
                descriptor: Arc::clone(desc),
                bundle_index,
                registration_order: order,
            });
        }
    }
    out.sort_by(|a, b| {
        a.descriptor
            .priority()
            .cmp(&b.descriptor.priority())
            .then_with(|| {
                let wa = a.descriptor.input_caps()[a.bundle_index].wildcards();
                let wb = b.descriptor.input_caps()[b.bundle_index].wildcards();
                wa.cmp(&wb)
            })
            .then_with(|| a.registration_order.cmp(&b.registration_order))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::StreamType;

    fn audio_snapshot() -> PropertyMap {
        PropertyMap::new()
            .with(PropKey::StreamType, StreamType::Audio)
            .with(PropKey::CodecId, "opus")
            .with(PropKey::SampleRate, 48_000u32)
    }

    #[test]
    fn test_required_predicate() {
        let p = CapPredicate::require(PropKey::StreamType, StreamType::Audio);
        assert!(p.holds(&audio_snapshot()));
        let video = PropertyMap::new().with(PropKey::StreamType, StreamType::Video);
        assert!(!p.holds(&video));
    }

    #[test]
    fn test_required_missing_key_fails() {
        let p = CapPredicate::require_present(PropKey::Width);
        assert!(!p.holds(&audio_snapshot()));
    }

    #[test]
    fn test_excluded_predicate() {
        let p = CapPredicate::exclude(PropKey::CodecId, "opus");
        assert!(!p.holds(&audio_snapshot()));
        // Absent key: exclusion holds vacuously.
        assert!(p.holds(&PropertyMap::new()));
    }

    #[test]
    fn test_dont_care_keys() {
        let bundle = CapBundle::new()
            .with(CapPredicate::require(PropKey::StreamType, StreamType::Audio));
        // SampleRate and CodecId are unmentioned: don't-care.
        assert!(bundle.matches(&audio_snapshot()));
    }

    #[test]
    fn test_bundle_conjunction() {
        let bundle = CapBundle::new()
            .with(CapPredicate::require(PropKey::StreamType, StreamType::Audio))
            .with(CapPredicate::require(PropKey::CodecId, "flac"));
        assert!(!bundle.matches(&audio_snapshot()));
    }

    #[test]
    fn test_require_any_of() {
        let p = CapPredicate::require_any_of(
            PropKey::CodecId,
            ["opus", "vorbis"].into_iter().map(PropValue::from),
        );
        assert!(p.holds(&audio_snapshot()));
    }

    fn desc(name: &str, priority: i32, bundle: CapBundle) -> Arc<FilterDescriptor> {
        FilterDescriptor::builder(name)
            .priority(priority)
            .input_bundle(bundle)
            .build_shared()
    }

    #[test]
    fn test_match_ordering_priority_then_specificity() {
        let snapshot = audio_snapshot();
        let wildcard = CapBundle::new().with(CapPredicate::require_present(PropKey::StreamType));
        let specific =
            CapBundle::new().with(CapPredicate::require(PropKey::StreamType, StreamType::Audio));

        let descriptors = vec![
            desc("generic", 0, wildcard.clone()),
            desc("audio", 0, specific.clone()),
            desc("preferred", -1, wildcard),
            desc("never", 0, CapBundle::new().with(CapPredicate::require(
                PropKey::StreamType,
                StreamType::Video,
            ))),
        ];

        let matches = match_snapshot(&descriptors, &snapshot);
        let names: Vec<&str> = matches.iter().map(|m| m.descriptor.name()).collect();
        // Priority first, then fewer wildcards, then registration order.
        assert_eq!(names, vec!["preferred", "audio", "generic"]);
    }

    #[test]
    fn test_match_deterministic() {
        let snapshot = audio_snapshot();
        let descriptors = vec![
            desc("a", 0, CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId))),
            desc("b", 0, CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId))),
        ];
        let first = match_snapshot(&descriptors, &snapshot);
        for _ in 0..10 {
            let again = match_snapshot(&descriptors, &snapshot);
            let a: Vec<_> = first.iter().map(|m| m.descriptor.name()).collect();
            let b: Vec<_> = again.iter().map(|m| m.descriptor.name()).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_first_matching_bundle_wins() {
        let d = FilterDescriptor::builder("multi")
            .input_bundle(CapBundle::new().with(CapPredicate::require(
                PropKey::StreamType,
                StreamType::Video,
            )))
            .input_bundle(CapBundle::new().with(CapPredicate::require(
                PropKey::StreamType,
                StreamType::Audio,
            )))
            .build_shared();
        let matches = match_snapshot(&[d], &audio_snapshot());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bundle_index, 1);
    }
}
