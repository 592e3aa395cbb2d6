//! Filter descriptors: the immutable registration record for a filter
//! kind.

use crate::error::{Error, Result};
use crate::filter::{Filter, FilterOption, OptionValues};
use crate::registry::matcher::CapBundle;
use std::sync::Arc;

// ============================================================================
// Flags
// ============================================================================

/// Descriptor behaviour flags.
///
/// Stored as a bitmask; combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterFlags(pub u32);

impl FilterFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Instances may block in `process` (real I/O); the scheduler runs
    /// each on a dedicated thread instead of the shared pool.
    pub const BLOCKING: Self = Self(1 << 0);

    /// Instances are not thread-safe across invocations; all of their
    /// hooks run on one designated worker.
    pub const SINGLE_THREAD: Self = Self(1 << 1);

    /// An existing instance may accept additional compatible input
    /// ports instead of forcing a new instance.
    pub const DYNAMIC_REUSE: Self = Self(1 << 2);

    /// Check if all of `other`'s bits are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FilterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Factory producing a fresh filter instance from bound options.
pub type FilterFactory = Box<dyn Fn(&OptionValues) -> Result<Box<dyn Filter>> + Send + Sync>;

/// Immutable registration record for a filter kind.
///
/// Built once via [`FilterDescriptor::builder`] and never mutated after
/// registration.
pub struct FilterDescriptor {
    name: String,
    help: String,
    input_caps: Vec<CapBundle>,
    output_caps: Vec<CapBundle>,
    options: Vec<FilterOption>,
    flags: FilterFlags,
    /// Lower wins during matching.
    priority: i32,
    /// Extra input ports an instance may accept beyond its first.
    max_extra_ports: u32,
    factory: FilterFactory,
}

impl FilterDescriptor {
    /// Start building a descriptor.
    pub fn builder(name: impl Into<String>) -> FilterDescriptorBuilder {
        FilterDescriptorBuilder {
            name: name.into(),
            help: String::new(),
            input_caps: Vec::new(),
            output_caps: Vec::new(),
            options: Vec::new(),
            flags: FilterFlags::NONE,
            priority: 0,
            max_extra_ports: 0,
            factory: None,
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Ordered input capability bundles.
    pub fn input_caps(&self) -> &[CapBundle] {
        &self.input_caps
    }

    /// Ordered output capability bundles.
    pub fn output_caps(&self) -> &[CapBundle] {
        &self.output_caps
    }

    /// Declared options.
    pub fn options(&self) -> &[FilterOption] {
        &self.options
    }

    /// Behaviour flags.
    pub fn flags(&self) -> FilterFlags {
        self.flags
    }

    /// Matching priority; lower wins.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Extra input ports an instance may accept beyond its first.
    pub fn max_extra_ports(&self) -> u32 {
        self.max_extra_ports
    }

    /// Instantiate the filter with bound option values.
    pub fn instantiate(&self, options: &OptionValues) -> Result<Box<dyn Filter>> {
        (self.factory)(options)
    }
}

impl std::fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("input_bundles", &self.input_caps.len())
            .field("output_bundles", &self.output_caps.len())
            .finish()
    }
}

/// Builder for [`FilterDescriptor`].
pub struct FilterDescriptorBuilder {
    name: String,
    help: String,
    input_caps: Vec<CapBundle>,
    output_caps: Vec<CapBundle>,
    options: Vec<FilterOption>,
    flags: FilterFlags,
    priority: i32,
    max_extra_ports: u32,
    factory: Option<FilterFactory>,
}

impl FilterDescriptorBuilder {
    /// Set the help text.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Append an input capability bundle (bundle order is match order).
    pub fn input_bundle(mut self, bundle: CapBundle) -> Self {
        self.input_caps.push(bundle);
        self
    }

    /// Append an output capability bundle.
    pub fn output_bundle(mut self, bundle: CapBundle) -> Self {
        self.output_caps.push(bundle);
        self
    }

    /// Declare an option.
    pub fn option(mut self, option: FilterOption) -> Self {
        self.options.push(option);
        self
    }

    /// Set behaviour flags.
    pub fn flags(mut self, flags: FilterFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the matching priority (lower wins; default 0).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Allow instances to accept this many extra input ports.
    pub fn max_extra_ports(mut self, count: u32) -> Self {
        self.max_extra_ports = count;
        self
    }

    /// Set the instance factory.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&OptionValues) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Finish the descriptor.
    ///
    /// A builder without a factory yields a descriptor whose
    /// `instantiate` always fails; tests use this, real registrations
    /// always set one.
    pub fn build(self) -> FilterDescriptor {
        let name = self.name.clone();
        FilterDescriptor {
            name: self.name,
            help: self.help,
            input_caps: self.input_caps,
            output_caps: self.output_caps,
            options: self.options,
            flags: self.flags,
            priority: self.priority,
            max_extra_ports: self.max_extra_ports,
            factory: self.factory.unwrap_or_else(|| {
                Box::new(move |_| {
                    Err(Error::Configuration {
                        filter: name.clone(),
                        reason: "descriptor registered without a factory".into(),
                    })
                })
            }),
        }
    }

    /// Finish and wrap in an `Arc`, the form the registry stores.
    pub fn build_shared(self) -> Arc<FilterDescriptor> {
        Arc::new(self.build())
    }
}
