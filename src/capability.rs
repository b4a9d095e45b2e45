//! Capabilities name the interfaces a binding exposes to its remote peer.
//!
//! A [`Capability`] is an opaque interface identifier, such as `"IGreeter"`. Every capability
//! that may appear on a channel is registered up front in a [`CapabilityCatalog`], together with
//! the method selectors it declares. The catalog is built once at start-up and shared read-only
//! by every gateway and channel, which lets requests be validated before they reach an actor.
//!
//! ```
//! use kameo_gateway::capability::{Capability, CapabilityCatalog, Interface};
//!
//! struct Greeter;
//!
//! impl Interface for Greeter {
//!     const CAPABILITY: Capability = Capability::from_static("IGreeter");
//!     const METHODS: &'static [&'static str] = &["Greet", "GetCount"];
//! }
//!
//! let catalog = CapabilityCatalog::builder()
//!     .interface::<Greeter>()
//!     .build()
//!     .unwrap();
//! assert!(catalog.has_method(&Greeter::CAPABILITY, "Greet"));
//! ```

use std::{
    borrow::Cow,
    collections::{btree_set, BTreeSet, HashMap, HashSet},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// An opaque interface identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(Cow<'static, str>);

impl Capability {
    /// Creates a capability from a static name, usable in constants.
    pub const fn from_static(name: &'static str) -> Self {
        Capability(Cow::Borrowed(name))
    }

    /// Creates a capability from any name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Capability(name.into())
    }

    /// Returns the capability name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({:?})", self.0)
    }
}

impl From<&'static str> for Capability {
    fn from(name: &'static str) -> Self {
        Capability::from_static(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Capability(Cow::Owned(name))
    }
}

/// An ordered set of capabilities exposed by a binding.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        CapabilitySet(BTreeSet::new())
    }

    /// Adds a capability, returning `false` if it was already present.
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    /// Returns `true` if the set contains the capability.
    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    /// The number of capabilities in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the capabilities in order.
    pub fn iter(&self) -> btree_set::Iter<'_, Capability> {
        self.0.iter()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter().map(Capability::as_str)).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl From<Capability> for CapabilitySet {
    fn from(capability: Capability) -> Self {
        CapabilitySet(BTreeSet::from([capability]))
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(capabilities: [Capability; N]) -> Self {
        CapabilitySet(BTreeSet::from(capabilities))
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(capabilities: Vec<Capability>) -> Self {
        capabilities.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A statically declared interface which can be registered in a [`CapabilityCatalog`].
pub trait Interface {
    /// The capability identifying the interface.
    const CAPABILITY: Capability;
    /// The method selectors the interface declares.
    const METHODS: &'static [&'static str];
}

/// The registry of every capability known to a gateway, and the methods each declares.
#[derive(Clone, Debug, Default)]
pub struct CapabilityCatalog {
    interfaces: HashMap<Capability, HashSet<Cow<'static, str>>>,
}

impl CapabilityCatalog {
    /// Creates a builder for a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Returns `true` if the capability is registered.
    pub fn contains(&self, capability: &Capability) -> bool {
        self.interfaces.contains_key(capability)
    }

    /// Returns `true` if the capability is registered and declares the method.
    pub fn has_method(&self, capability: &Capability, method: &str) -> bool {
        self.interfaces
            .get(capability)
            .is_some_and(|methods| methods.contains(method))
    }

    /// Iterates over the methods declared by a capability.
    pub fn methods(&self, capability: &Capability) -> Option<impl Iterator<Item = &str> + '_> {
        self.interfaces
            .get(capability)
            .map(|methods| methods.iter().map(|method| method.as_ref()))
    }

    /// Iterates over every registered capability.
    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> + '_ {
        self.interfaces.keys()
    }

    /// The number of registered capabilities.
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Returns `true` if no capabilities are registered.
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

/// Builder for a [`CapabilityCatalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    interfaces: Vec<(Capability, Vec<Cow<'static, str>>)>,
}

impl CatalogBuilder {
    /// Registers a statically declared interface.
    pub fn interface<I: Interface>(self) -> Self {
        self.register(
            I::CAPABILITY,
            I::METHODS.iter().map(|method| Cow::Borrowed(*method)),
        )
    }

    /// Registers a capability with an explicit list of methods.
    pub fn register<M>(mut self, capability: Capability, methods: M) -> Self
    where
        M: IntoIterator,
        M::Item: Into<Cow<'static, str>>,
    {
        self.interfaces
            .push((capability, methods.into_iter().map(Into::into).collect()));
        self
    }

    /// Builds the catalog.
    ///
    /// Fails if two interfaces were registered under the same capability.
    pub fn build(self) -> Result<CapabilityCatalog, CatalogError> {
        let mut interfaces = HashMap::with_capacity(self.interfaces.len());
        for (capability, methods) in self.interfaces {
            if interfaces.contains_key(&capability) {
                return Err(CatalogError::DuplicateInterface(capability));
            }
            interfaces.insert(capability, methods.into_iter().collect());
        }

        Ok(CapabilityCatalog { interfaces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    impl Interface for Counter {
        const CAPABILITY: Capability = Capability::from_static("ICounter");
        const METHODS: &'static [&'static str] = &["IncCounter", "GetCounter"];
    }

    #[test]
    fn borrowed_and_owned_capabilities_are_equal() {
        assert_eq!(
            Capability::from_static("IGreeter"),
            Capability::from("IGreeter".to_string())
        );
    }

    #[test]
    fn catalog_validates_methods() {
        let catalog = CapabilityCatalog::builder()
            .interface::<Counter>()
            .register(Capability::from_static("IEntry"), ["GetGreeter"])
            .build()
            .unwrap();

        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains(&Counter::CAPABILITY));
        assert!(catalog.has_method(&Counter::CAPABILITY, "GetCounter"));
        assert!(!catalog.has_method(&Counter::CAPABILITY, "GetGreeter"));
        assert!(!catalog.has_method(&Capability::from_static("IMissing"), "GetCounter"));
    }

    #[test]
    fn duplicate_interfaces_are_rejected() {
        let err = CapabilityCatalog::builder()
            .interface::<Counter>()
            .interface::<Counter>()
            .build()
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateInterface(cap) if cap == Counter::CAPABILITY));
    }

    #[test]
    fn capability_sets_are_ordered() {
        let set = CapabilitySet::from([
            Capability::from_static("IGreeter"),
            Capability::from_static("ICounter"),
        ]);
        let names: Vec<_> = set.iter().map(Capability::as_str).collect();
        assert_eq!(names, ["ICounter", "IGreeter"]);
    }
}
