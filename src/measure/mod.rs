//! Measure catalog: descriptors, dense indices, and measurement values.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Value domain of a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    /// Floating-point observations.
    Real,
    /// Integer observations, widened to real at aggregation time.
    Integral,
}

/// Opaque handle for a registered measure.
///
/// Wraps the dense index the catalog assigned at registration; indices
/// are stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasureId(u32);

impl MeasureId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// The dense catalog index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Static description of a measure.
#[derive(Debug, Clone)]
pub struct MeasureDescriptor {
    name: String,
    units: String,
    description: String,
    kind: MeasureKind,
}

impl MeasureDescriptor {
    /// Creates a descriptor for a real-valued measure.
    pub fn real(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: String::new(),
            description: String::new(),
            kind: MeasureKind::Real,
        }
    }

    /// Creates a descriptor for an integer-valued measure.
    pub fn integral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: String::new(),
            description: String::new(),
            kind: MeasureKind::Integral,
        }
    }

    /// Sets the unit string (e.g. "ms", "By").
    pub fn set_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Sets the human-readable description.
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The unique measure name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unit string.
    pub fn units(&self) -> &str {
        &self.units
    }

    /// The description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The declared value kind.
    pub fn kind(&self) -> MeasureKind {
        self.kind
    }
}

/// A single `(measure, value)` observation passed to record calls.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    id: MeasureId,
    value: MeasureValue,
}

/// Typed measurement payload.
#[derive(Debug, Clone, Copy)]
pub enum MeasureValue {
    /// Payload for [`MeasureKind::Real`] measures.
    Real(f64),
    /// Payload for [`MeasureKind::Integral`] measures.
    Integral(i64),
}

impl Measurement {
    /// A real-valued observation.
    pub fn real(id: MeasureId, value: f64) -> Self {
        Self {
            id,
            value: MeasureValue::Real(value),
        }
    }

    /// An integer observation.
    pub fn integral(id: MeasureId, value: i64) -> Self {
        Self {
            id,
            value: MeasureValue::Integral(value),
        }
    }

    /// The target measure.
    pub fn id(&self) -> MeasureId {
        self.id
    }

    /// The payload.
    pub fn value(&self) -> MeasureValue {
        self.value
    }
}

#[derive(Default)]
struct RegistryState {
    measures: Vec<MeasureDescriptor>,
    by_name: HashMap<String, MeasureId>,
}

/// Catalog assigning stable dense indices to measures.
///
/// Registration is append-only; a measure is never removed.
#[derive(Default)]
pub struct MeasureRegistry {
    state: RwLock<RegistryState>,
}

impl MeasureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a measure and returns its id. Names are unique.
    pub fn register(&self, descriptor: MeasureDescriptor) -> Result<MeasureId> {
        let mut state = self.state.write();
        if state.by_name.contains_key(descriptor.name()) {
            return Err(Error::DuplicateMeasure(descriptor.name().to_string()));
        }
        let id = MeasureId::from_index(state.measures.len());
        debug!(measure = descriptor.name(), index = id.index(), "measure registered");
        state.by_name.insert(descriptor.name().to_string(), id);
        state.measures.push(descriptor);
        Ok(id)
    }

    /// Looks a measure up by name.
    pub fn id_for(&self, name: &str) -> Option<MeasureId> {
        self.state.read().by_name.get(name).copied()
    }

    /// The declared kind for `id`, if registered.
    pub fn kind(&self, id: MeasureId) -> Option<MeasureKind> {
        self.state
            .read()
            .measures
            .get(id.index())
            .map(MeasureDescriptor::kind)
    }

    /// A copy of the descriptor for `id`, if registered.
    pub fn descriptor(&self, id: MeasureId) -> Option<MeasureDescriptor> {
        self.state.read().measures.get(id.index()).cloned()
    }

    /// Number of registered measures.
    pub fn len(&self) -> usize {
        self.state.read().measures.len()
    }

    /// Whether no measure has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_dense_indices() {
        let registry = MeasureRegistry::new();
        let a = registry.register(MeasureDescriptor::real("a")).expect("a");
        let b = registry
            .register(MeasureDescriptor::integral("b"))
            .expect("b");
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = MeasureRegistry::new();
        registry
            .register(MeasureDescriptor::real("latency_ms"))
            .expect("first");
        let err = registry
            .register(MeasureDescriptor::real("latency_ms"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMeasure(_)));
    }

    #[test]
    fn test_lookup_by_name_and_kind() {
        let registry = MeasureRegistry::new();
        let id = registry
            .register(MeasureDescriptor::integral("requests").set_units("1"))
            .expect("requests");

        assert_eq!(registry.id_for("requests"), Some(id));
        assert_eq!(registry.id_for("missing"), None);
        assert_eq!(registry.kind(id), Some(MeasureKind::Integral));

        let descriptor = registry.descriptor(id).expect("descriptor");
        assert_eq!(descriptor.name(), "requests");
        assert_eq!(descriptor.units(), "1");
    }
}
