//! Fragment type registration and metadata.
//!
//! Every type that is stored in or matched against an archetype must be
//! registered at runtime in a [`FragmentRegistry`]. Registration produces a
//! [`FragmentTypeId`], a dense integer that archetype layout, composition
//! bitsets, and query matching use in place of runtime type introspection.
//!
//! A registered type has one of four [`FragmentKind`]s:
//!
//! - **Fragment**: per-entity data, stored as a column inside each chunk.
//! - **Tag**: zero-sized marker, only used for matching.
//! - **Chunk fragment**: one value per chunk, shared by the chunk's entities.
//! - **Shared fragment**: one value per archetype.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr;

// ---------------------------------------------------------------------------
// FragmentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered fragment type.
///
/// Ids are assigned in registration order, so they are stable for the
/// lifetime of a registry and totally ordered. Archetype column layout and
/// query requirement order both follow this ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentTypeId(pub(crate) u32);

impl FragmentTypeId {
    /// The dense index of this type (its bit position in a
    /// [`FragmentBitSet`](crate::bitset::FragmentBitSet)).
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FragmentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// FragmentKind
// ---------------------------------------------------------------------------

/// The storage category of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// Per-entity data stored in chunk columns.
    Fragment,
    /// Zero-sized marker used only for matching.
    Tag,
    /// One value per chunk.
    ChunkFragment,
    /// One value per archetype.
    SharedFragment,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentKind::Fragment => "fragment",
            FragmentKind::Tag => "tag",
            FragmentKind::ChunkFragment => "chunk fragment",
            FragmentKind::SharedFragment => "shared fragment",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// FragmentVtable -- type-erased operations for a fragment type
// ---------------------------------------------------------------------------

/// Function pointers for type-erased construction, destruction, and copy of
/// fragment values.
///
/// Created via [`FragmentVtable::new::<T>()`] and stored alongside each
/// archetype column so chunks can default-construct, drop, and clone values
/// without knowing the concrete type at compile time.
#[derive(Clone, Copy)]
pub struct FragmentVtable {
    /// Write `T::default()` into uninitialized memory.
    pub(crate) default_fn: unsafe fn(*mut u8),
    /// Drop a single value in place. `None` when `T` has no drop glue.
    pub(crate) drop_fn: Option<unsafe fn(*mut u8)>,
    /// Clone a value from `src` into uninitialized `dst`.
    pub(crate) clone_fn: unsafe fn(*const u8, *mut u8),
    /// Size of the fragment type.
    pub(crate) size: usize,
    /// Alignment of the fragment type.
    pub(crate) align: usize,
}

impl fmt::Debug for FragmentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentVtable")
            .field("size", &self.size)
            .field("align", &self.align)
            .field("needs_drop", &self.drop_fn.is_some())
            .finish()
    }
}

impl FragmentVtable {
    /// Create a vtable for a concrete fragment type `T`.
    #[allow(unsafe_code)]
    pub fn new<T: Default + Clone + 'static>() -> Self {
        unsafe fn default_fn_impl<T: Default>(dst: *mut u8) {
            ptr::write(dst as *mut T, T::default());
        }

        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        unsafe fn clone_fn_impl<T: Clone>(src: *const u8, dst: *mut u8) {
            let value = &*(src as *const T);
            ptr::write(dst as *mut T, value.clone());
        }

        Self {
            default_fn: default_fn_impl::<T>,
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_fn_impl::<T>)
            } else {
                None
            },
            clone_fn: clone_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    /// Size in bytes of one value.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes of one value.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }
}

// ---------------------------------------------------------------------------
// FragmentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered type.
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    /// Unique ID assigned at registration time.
    pub id: FragmentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// Storage category.
    pub kind: FragmentKind,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId`, used to check typed access against the registered type.
    pub type_id: TypeId,
    /// Type-erased operations. Present for fragments and chunk fragments.
    pub(crate) vtable: Option<FragmentVtable>,
}

impl FragmentInfo {
    /// The type-erased operations for this type, if it is stored in chunks.
    pub fn vtable(&self) -> Option<&FragmentVtable> {
        self.vtable.as_ref()
    }
}

// ---------------------------------------------------------------------------
// FragmentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`FragmentTypeId`]s and their metadata.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust `TypeId` under the same kind return the existing id.
#[derive(Debug, Default)]
pub struct FragmentRegistry {
    /// TypeId -> FragmentTypeId for dedup.
    by_type: HashMap<TypeId, FragmentTypeId>,
    /// Name -> FragmentTypeId for lookup by string name.
    by_name: HashMap<String, FragmentTypeId>,
    /// Indexed by FragmentTypeId.0.
    infos: Vec<FragmentInfo>,
}

impl FragmentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-entity fragment type.
    pub fn register_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.register_raw::<T>(name, FragmentKind::Fragment, Some(FragmentVtable::new::<T>()))
    }

    /// Register a per-chunk fragment type.
    pub fn register_chunk_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.register_raw::<T>(
            name,
            FragmentKind::ChunkFragment,
            Some(FragmentVtable::new::<T>()),
        )
    }

    /// Register a tag type.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not zero-sized.
    pub fn register_tag<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Send + Sync + 'static,
    {
        assert!(
            std::mem::size_of::<T>() == 0,
            "tag '{name}' must be a zero-sized type (size is {})",
            std::mem::size_of::<T>()
        );
        self.register_raw::<T>(name, FragmentKind::Tag, None)
    }

    /// Register a per-archetype shared fragment type.
    pub fn register_shared_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Clone + PartialEq + std::hash::Hash + Send + Sync + 'static,
    {
        self.register_raw::<T>(name, FragmentKind::SharedFragment, None)
    }

    fn register_raw<T: 'static>(
        &mut self,
        name: &str,
        kind: FragmentKind,
        vtable: Option<FragmentVtable>,
    ) -> FragmentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            let existing_kind = self.infos[existing.0 as usize].kind;
            assert!(
                existing_kind == kind,
                "type '{}' is already registered as a {existing_kind}, cannot re-register as a {kind}",
                std::any::type_name::<T>()
            );
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!("fragment name '{name}' is already registered for a different type");
        }

        let id = FragmentTypeId(self.infos.len() as u32);
        self.infos.push(FragmentInfo {
            id,
            name: name.to_owned(),
            kind,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: rust_type_id,
            vtable,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Look up a registered type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<FragmentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a registered type by its string name.
    pub fn lookup_by_name(&self, name: &str) -> Option<FragmentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`FragmentInfo`] for a registered type id.
    pub fn get_info(&self, id: FragmentTypeId) -> Option<&FragmentInfo> {
        self.infos.get(id.0 as usize)
    }

    /// The kind of a registered type id.
    pub fn kind(&self, id: FragmentTypeId) -> Option<FragmentKind> {
        self.get_info(id).map(|info| info.kind)
    }

    /// Get the info for `id`, panicking with a readable message when the id
    /// was not produced by this registry.
    pub(crate) fn info_checked(&self, id: FragmentTypeId) -> &FragmentInfo {
        self.get_info(id).unwrap_or_else(|| {
            panic!(
                "{id:?} is not registered. Registered types: [{}]",
                self.registered_names().join(", ")
            )
        })
    }

    /// Total number of registered types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    struct Frozen;

    #[derive(Debug, Clone, PartialEq, Hash)]
    struct Team(u8);

    #[test]
    fn register_and_lookup() {
        let mut reg = FragmentRegistry::new();
        let id = reg.register_fragment::<Pos>("position");
        assert_eq!(reg.lookup::<Pos>(), Some(id));
        assert_eq!(reg.lookup_by_name("position"), Some(id));
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = FragmentRegistry::new();
        let id1 = reg.register_fragment::<Pos>("position");
        let id2 = reg.register_fragment::<Pos>("position_again");
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ids_follow_registration_order() {
        let mut reg = FragmentRegistry::new();
        let p = reg.register_fragment::<Pos>("position");
        let v = reg.register_fragment::<Vel>("velocity");
        let t = reg.register_tag::<Frozen>("frozen");
        assert!(p < v && v < t);
    }

    #[test]
    fn info_correctness() {
        let mut reg = FragmentRegistry::new();
        let id = reg.register_fragment::<Pos>("position");
        let info = reg.get_info(id).unwrap();
        assert_eq!(info.name, "position");
        assert_eq!(info.kind, FragmentKind::Fragment);
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert_eq!(info.align, std::mem::align_of::<Pos>());
        assert_eq!(info.type_id, TypeId::of::<Pos>());
        assert!(info.vtable().is_some());
    }

    #[test]
    fn kinds_are_recorded() {
        let mut reg = FragmentRegistry::new();
        let tag = reg.register_tag::<Frozen>("frozen");
        let shared = reg.register_shared_fragment::<Team>("team");
        assert_eq!(reg.kind(tag), Some(FragmentKind::Tag));
        assert_eq!(reg.kind(shared), Some(FragmentKind::SharedFragment));
        assert!(reg.get_info(shared).unwrap().vtable().is_none());
    }

    #[test]
    #[should_panic(expected = "must be a zero-sized type")]
    fn tag_must_be_zero_sized() {
        let mut reg = FragmentRegistry::new();
        reg.register_tag::<Pos>("not_a_tag");
    }

    #[test]
    #[should_panic(expected = "already registered as a fragment")]
    fn kind_conflict_panics() {
        let mut reg = FragmentRegistry::new();
        reg.register_fragment::<Pos>("position");
        reg.register_chunk_fragment::<Pos>("chunk_position");
    }

    #[test]
    fn vtable_skips_drop_for_plain_data() {
        let plain = FragmentVtable::new::<Pos>();
        let owning = FragmentVtable::new::<String>();
        assert!(plain.drop_fn.is_none());
        assert!(owning.drop_fn.is_some());
    }
}
