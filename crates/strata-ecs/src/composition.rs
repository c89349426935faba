//! Archetype compositions and shared fragment values.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::bitset::FragmentBitSet;
use crate::fragment::{FragmentKind, FragmentRegistry, FragmentTypeId};
use crate::value::expect_kind;

// ---------------------------------------------------------------------------
// ArchetypeComposition
// ---------------------------------------------------------------------------

/// The four type sets that identify an archetype.
///
/// Sets are order-independent: two compositions built from the same types in
/// any order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArchetypeComposition {
    pub fragments: FragmentBitSet,
    pub tags: FragmentBitSet,
    pub chunk_fragments: FragmentBitSet,
    pub shared_fragments: FragmentBitSet,
}

impl ArchetypeComposition {
    /// Sort a flat list of registered types into their sets by kind.
    ///
    /// # Panics
    ///
    /// Panics if any id is not registered.
    pub fn from_types(registry: &FragmentRegistry, types: &[FragmentTypeId]) -> Self {
        let mut composition = Self::default();
        for &id in types {
            let kind = registry.info_checked(id).kind;
            composition.set_mut(kind).insert(id);
        }
        composition
    }

    /// The set that holds types of `kind`.
    pub fn set(&self, kind: FragmentKind) -> &FragmentBitSet {
        match kind {
            FragmentKind::Fragment => &self.fragments,
            FragmentKind::Tag => &self.tags,
            FragmentKind::ChunkFragment => &self.chunk_fragments,
            FragmentKind::SharedFragment => &self.shared_fragments,
        }
    }

    pub fn set_mut(&mut self, kind: FragmentKind) -> &mut FragmentBitSet {
        match kind {
            FragmentKind::Fragment => &mut self.fragments,
            FragmentKind::Tag => &mut self.tags,
            FragmentKind::ChunkFragment => &mut self.chunk_fragments,
            FragmentKind::SharedFragment => &mut self.shared_fragments,
        }
    }

    /// Whether `id` is in the set for `kind`.
    pub fn contains(&self, kind: FragmentKind, id: FragmentTypeId) -> bool {
        self.set(kind).contains(id)
    }

    /// A copy with `id` added to the set for `kind`.
    pub fn with(&self, kind: FragmentKind, id: FragmentTypeId) -> Self {
        let mut next = self.clone();
        next.set_mut(kind).insert(id);
        next
    }

    /// A copy with `id` removed from the set for `kind`.
    pub fn without(&self, kind: FragmentKind, id: FragmentTypeId) -> Self {
        let mut next = self.clone();
        next.set_mut(kind).remove(id);
        next
    }

    /// Whether all four sets are empty.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
            && self.tags.is_empty()
            && self.chunk_fragments.is_empty()
            && self.shared_fragments.is_empty()
    }

    /// Hash of the fragment set alone. Used as the archetype lookup bucket
    /// key; full equality is checked within the bucket.
    pub fn fragment_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.fragments.hash(&mut hasher);
        hasher.finish()
    }
}

// ---------------------------------------------------------------------------
// SharedFragmentValues
// ---------------------------------------------------------------------------

/// Object-safe view of a shared fragment value: equality and hashing by value.
pub(crate) trait SharedValue: Send + Sync + 'static {
    fn dyn_eq(&self, other: &dyn SharedValue) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

impl<T: PartialEq + Hash + Send + Sync + 'static> SharedValue for T {
    fn dyn_eq(&self, other: &dyn SharedValue) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| o == self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One value per shared fragment type, kept sorted by type id.
///
/// Two sets of values are equal when they hold the same types with equal
/// values. Archetypes with equal compositions but different shared values are
/// distinct.
#[derive(Clone, Default)]
pub struct SharedFragmentValues {
    values: Vec<(FragmentTypeId, Arc<dyn SharedValue>)>,
}

impl SharedFragmentValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered as a shared fragment, or if a value
    /// of this type is already present.
    pub fn add<T>(&mut self, registry: &FragmentRegistry, value: T) -> &mut Self
    where
        T: Clone + PartialEq + Hash + Send + Sync + 'static,
    {
        let id = expect_kind::<T>(registry, FragmentKind::SharedFragment);
        match self.values.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(_) => panic!(
                "shared fragment {} already has a value",
                std::any::type_name::<T>()
            ),
            Err(pos) => self.values.insert(pos, (id, Arc::new(value))),
        }
        self
    }

    /// The value for `T`, if present.
    pub fn get<T: 'static>(&self, registry: &FragmentRegistry) -> Option<&T> {
        let id = registry.lookup::<T>()?;
        self.get_dyn(id)?.as_any().downcast_ref::<T>()
    }

    pub(crate) fn get_dyn(&self, id: FragmentTypeId) -> Option<&Arc<dyn SharedValue>> {
        self.values
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .map(|i| &self.values[i].1)
    }

    /// The set of types with a value.
    pub fn types(&self) -> FragmentBitSet {
        self.values.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PartialEq for SharedFragmentValues {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|((a_id, a), (b_id, b))| a_id == b_id && a.dyn_eq(&**b))
    }
}

impl Eq for SharedFragmentValues {}

impl Hash for SharedFragmentValues {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.values.len().hash(state);
        for (id, value) in &self.values {
            id.hash(state);
            value.dyn_hash(state);
        }
    }
}

impl fmt::Debug for SharedFragmentValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.iter().map(|(id, _)| id)).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
