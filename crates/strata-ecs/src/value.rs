//! Owned, type-erased fragment values.
//!
//! [`FragmentBuf`] holds one value of a registered type in a properly aligned
//! heap allocation. It is how fragment values travel outside chunk memory:
//! inside a [`FragmentBundle`], inside a deferred command, and as the per-chunk
//! storage of chunk fragments.

use std::alloc::Layout;
use std::any::TypeId;
use std::fmt;
use std::ptr;

use crate::composition::{ArchetypeComposition, SharedFragmentValues};
use crate::fragment::{FragmentKind, FragmentRegistry, FragmentTypeId, FragmentVtable};

// ---------------------------------------------------------------------------
// FragmentBuf
// ---------------------------------------------------------------------------

/// A heap buffer owning a single fragment value.
///
/// The value is dropped with the buffer unless it has been moved out with
/// [`move_into`](FragmentBuf::move_into).
pub struct FragmentBuf {
    /// Heap allocation, or an aligned dangling pointer for zero-sized types.
    ptr: *mut u8,
    layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
    rust_type: TypeId,
    /// Whether `ptr` still holds a value this buffer must drop.
    live: bool,
}

// Only `Send + Sync` types can be registered, so the owned value can move
// between threads with the buffer.
unsafe impl Send for FragmentBuf {}
unsafe impl Sync for FragmentBuf {}

impl FragmentBuf {
    fn allocate(layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "fragment value allocation failed ({layout:?})");
        ptr
    }

    /// Move `value` into a new buffer.
    pub fn from_value<T: 'static>(value: T) -> Self {
        let layout = Layout::new::<T>();
        let ptr = Self::allocate(layout);
        unsafe { ptr::write(ptr as *mut T, value) };
        Self {
            ptr,
            layout,
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_in_place::<T>)
            } else {
                None
            },
            rust_type: TypeId::of::<T>(),
            live: true,
        }
    }

    /// A buffer holding the type's default value.
    pub fn from_default(vtable: &FragmentVtable, rust_type: TypeId) -> Self {
        let layout = vtable_layout(vtable);
        let ptr = Self::allocate(layout);
        unsafe { (vtable.default_fn)(ptr) };
        Self {
            ptr,
            layout,
            drop_fn: vtable.drop_fn,
            rust_type,
            live: true,
        }
    }

    /// A buffer holding a clone of the value at `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid value of the type described by `vtable`.
    pub unsafe fn clone_from_raw(vtable: &FragmentVtable, rust_type: TypeId, src: *const u8) -> Self {
        let layout = vtable_layout(vtable);
        let ptr = Self::allocate(layout);
        (vtable.clone_fn)(src, ptr);
        Self {
            ptr,
            layout,
            drop_fn: vtable.drop_fn,
            rust_type,
            live: true,
        }
    }

    /// The Rust type of the stored value.
    pub fn rust_type(&self) -> TypeId {
        self.rust_type
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Typed access. Returns `None` when `T` is not the stored type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (self.live && self.rust_type == TypeId::of::<T>())
            .then(|| unsafe { &*(self.ptr as *const T) })
    }

    /// Bitwise-move the value into `dst`. The buffer no longer owns a value
    /// afterwards.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of the stored type and must not hold a
    /// live value (it is overwritten without being dropped).
    pub unsafe fn move_into(mut self, dst: *mut u8) {
        debug_assert!(self.live, "value already moved out");
        ptr::copy_nonoverlapping(self.ptr, dst, self.layout.size());
        self.live = false;
    }

    /// Drop the current value and write `src`'s value in its place, consuming
    /// `src`.
    pub fn replace_with(&mut self, mut src: FragmentBuf) {
        assert_eq!(self.rust_type, src.rust_type, "fragment value type mismatch");
        unsafe {
            if self.live {
                if let Some(drop_fn) = self.drop_fn {
                    drop_fn(self.ptr);
                }
            }
            ptr::copy_nonoverlapping(src.ptr, self.ptr, self.layout.size());
        }
        src.live = false;
        self.live = true;
    }
}

impl Drop for FragmentBuf {
    fn drop(&mut self) {
        unsafe {
            if self.live {
                if let Some(drop_fn) = self.drop_fn {
                    drop_fn(self.ptr);
                }
            }
            if self.layout.size() > 0 {
                std::alloc::dealloc(self.ptr, self.layout);
            }
        }
    }
}

impl fmt::Debug for FragmentBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentBuf")
            .field("size", &self.layout.size())
            .field("live", &self.live)
            .finish()
    }
}

unsafe fn drop_in_place<T>(ptr: *mut u8) {
    ptr::drop_in_place(ptr as *mut T);
}

fn vtable_layout(vtable: &FragmentVtable) -> Layout {
    match Layout::from_size_align(vtable.size, vtable.align) {
        Ok(layout) => layout,
        Err(e) => panic!("fragment vtable describes an invalid layout: {e}"),
    }
}

// ---------------------------------------------------------------------------
// FragmentBundle
// ---------------------------------------------------------------------------

/// A set of initial fragment values, tags, and shared values for a new entity.
///
/// ```ignore
/// let mut bundle = FragmentBundle::new();
/// bundle.add(manager.registry(), Position { x: 0.0, y: 0.0 });
/// bundle.add_tag::<Enemy>(manager.registry());
/// let entity = manager.create_entity_with(bundle);
/// ```
#[derive(Default)]
pub struct FragmentBundle {
    fragments: Vec<(FragmentTypeId, FragmentBuf)>,
    tags: Vec<FragmentTypeId>,
    shared: SharedFragmentValues,
}

impl FragmentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered as a fragment, or if a value of the
    /// same type is already in the bundle.
    pub fn add<T: Send + Sync + 'static>(&mut self, registry: &FragmentRegistry, value: T) -> &mut Self {
        let id = expect_kind::<T>(registry, FragmentKind::Fragment);
        assert!(
            !self.fragments.iter().any(|(existing, _)| *existing == id),
            "duplicate fragment type {} in FragmentBundle",
            std::any::type_name::<T>()
        );
        self.fragments.push((id, FragmentBuf::from_value(value)));
        self
    }

    /// Add a tag.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered as a tag.
    pub fn add_tag<T: 'static>(&mut self, registry: &FragmentRegistry) -> &mut Self {
        let id = expect_kind::<T>(registry, FragmentKind::Tag);
        if !self.tags.contains(&id) {
            self.tags.push(id);
        }
        self
    }

    /// Add a shared fragment value. The entity lands in the archetype keyed by
    /// this value.
    pub fn add_shared<T>(&mut self, registry: &FragmentRegistry, value: T) -> &mut Self
    where
        T: Clone + PartialEq + std::hash::Hash + Send + Sync + 'static,
    {
        self.shared.add(registry, value);
        self
    }

    /// Number of fragment values.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.tags.is_empty() && self.shared.is_empty()
    }

    /// The composition an entity built from this bundle has.
    pub fn composition(&self) -> ArchetypeComposition {
        let mut composition = ArchetypeComposition::default();
        for (id, _) in &self.fragments {
            composition.fragments.insert(*id);
        }
        for id in &self.tags {
            composition.tags.insert(*id);
        }
        composition.shared_fragments = self.shared.types();
        composition
    }

    pub(crate) fn into_parts(self) -> (Vec<(FragmentTypeId, FragmentBuf)>, SharedFragmentValues) {
        (self.fragments, self.shared)
    }
}

impl fmt::Debug for FragmentBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentBundle")
            .field("fragments", &self.fragments.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("tags", &self.tags)
            .field("shared", &self.shared)
            .finish()
    }
}

pub(crate) fn expect_kind<T: 'static>(registry: &FragmentRegistry, kind: FragmentKind) -> FragmentTypeId {
    let Some(id) = registry.lookup::<T>() else {
        panic!(
            "{} is not registered. Registered types: [{}]",
            std::any::type_name::<T>(),
            registry.registered_names().join(", ")
        );
    };
    let actual = registry.info_checked(id).kind;
    assert!(
        actual == kind,
        "{} is registered as a {actual}, expected a {kind}",
        std::any::type_name::<T>()
    );
    id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
