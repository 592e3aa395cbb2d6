//! Filter registry: the immutable-after-registration catalogue of
//! filter kinds a session can instantiate, plus capability matching
//! over it.

mod descriptor;
pub mod matcher;

pub use descriptor::{FilterDescriptor, FilterDescriptorBuilder, FilterFactory, FilterFlags};
pub use matcher::{
    Accept, CapBundle, CapPredicate, MatchCandidate, PredicateMode, PredicateScope,
};

use crate::error::{Error, Result};
use crate::props::PropertyMap;
use smallvec::SmallVec;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Catalogue of registered filter descriptors.
///
/// Registration order is preserved; it is the matcher's final
/// tie-breaker, which keeps matching deterministic across runs.
#[derive(Default)]
pub struct FilterRegistry {
    descriptors: RwLock<Vec<Arc<FilterDescriptor>>>,
}

impl FilterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// Names are unique; re-registering a name is an error.
    pub fn register(&self, descriptor: Arc<FilterDescriptor>) -> Result<()> {
        let mut guard = self.write();
        if guard.iter().any(|d| d.name() == descriptor.name()) {
            return Err(Error::Configuration {
                filter: descriptor.name().to_string(),
                reason: "a filter with this name is already registered".into(),
            });
        }
        debug!(filter = descriptor.name(), "registered filter");
        guard.push(descriptor);
        Ok(())
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Result<Arc<FilterDescriptor>> {
        self.read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| Error::FilterNotFound(name.to_string()))
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of all descriptors in registration order.
    pub fn descriptors(&self) -> Vec<Arc<FilterDescriptor>> {
        self.read().clone()
    }

    /// Match a property snapshot against every registered descriptor's
    /// input bundles; see [`matcher::match_snapshot`] for ordering.
    pub fn match_input(&self, snapshot: &PropertyMap) -> SmallVec<[MatchCandidate; 4]> {
        matcher::match_snapshot(&self.read(), snapshot)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<FilterDescriptor>>> {
        match self.descriptors.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<FilterDescriptor>>> {
        match self.descriptors.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .read()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        f.debug_struct("FilterRegistry").field("filters", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{PropKey, StreamType};

    fn registry() -> FilterRegistry {
        let reg = FilterRegistry::new();
        reg.register(
            FilterDescriptor::builder("audio-dec")
                .input_bundle(CapBundle::new().with(CapPredicate::require(
                    PropKey::StreamType,
                    StreamType::Audio,
                )))
                .build_shared(),
        )
        .unwrap();
        reg
    }

    #[test]
    fn test_register_and_get() {
        let reg = registry();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("audio-dec").unwrap().name(), "audio-dec");
        assert!(matches!(
            reg.get("missing"),
            Err(Error::FilterNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let reg = registry();
        let dup = FilterDescriptor::builder("audio-dec").build_shared();
        assert!(reg.register(dup).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_match_input() {
        let reg = registry();
        let audio = PropertyMap::new().with(PropKey::StreamType, StreamType::Audio);
        let video = PropertyMap::new().with(PropKey::StreamType, StreamType::Video);
        assert_eq!(reg.match_input(&audio).len(), 1);
        assert!(reg.match_input(&video).is_empty());
    }
}
