//! Execution contexts: the per-chunk view a query callback works through.
//!
//! A query binds one [`ExecutionContext`] to each chunk it visits. Views are
//! keyed by the query's requirements, and callbacks resolve them by Rust type:
//!
//! ```ignore
//! query.for_each_entity_chunk(&mut manager, &mut ctx, |ctx| {
//!     let velocities = ctx.fragment_view::<Velocity>();
//!     let positions = ctx.fragment_view_mut::<Position>();
//!     for (p, v) in positions.iter_mut().zip(velocities) {
//!         p.x += v.dx;
//!     }
//! });
//! ```
//!
//! Borrows are checked at runtime within one binding: a column can be viewed
//! any number of times immutably, or once mutably. Violations panic. A borrow
//! is held until the context moves to the next chunk, even after the returned
//! slice is dead.

use std::any::{type_name, TypeId};
use std::cell::{Cell, RefCell, RefMut};
use std::sync::Arc;

use crate::archetype::ArchetypeId;
use crate::collection::ArchetypeChunkCollection;
use crate::command::CommandBuffer;
use crate::composition::SharedValue;
use crate::entity::EntityHandle;
use crate::query::{AccessMode, Requirement};

// ---------------------------------------------------------------------------
// ChunkBinding
// ---------------------------------------------------------------------------

/// Column addresses for one chunk (or a sub-range of one), precomputed for a
/// set of requirements. Built before iteration so parallel tasks never touch
/// archetype bookkeeping.
#[derive(Debug)]
pub(crate) struct ChunkBinding {
    pub archetype: ArchetypeId,
    pub chunk_index: usize,
    pub serial: u32,
    pub entities: *const EntityHandle,
    pub len: usize,
    /// One entry per fragment requirement; null when absent.
    pub fragments: Vec<*mut u8>,
    /// One entry per chunk fragment requirement; null when absent.
    pub chunk_fragments: Vec<*mut u8>,
}

// Each binding addresses a distinct chunk range and is handed to exactly one
// task.
unsafe impl Send for ChunkBinding {}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct View {
    rust_type: TypeId,
    access: AccessMode,
    ptr: *mut u8,
    /// `> 0`: shared borrows handed out, `-1`: mutably borrowed.
    borrow: Cell<isize>,
}

impl View {
    fn from_requirement(req: &Requirement) -> Self {
        Self {
            rust_type: req.rust_type,
            access: req.access,
            ptr: std::ptr::null_mut(),
            borrow: Cell::new(0),
        }
    }

    fn bind(&mut self, ptr: *mut u8) {
        self.ptr = ptr;
        self.borrow.set(0);
    }

    fn borrow_shared<T>(&self) {
        let b = self.borrow.get();
        assert!(b >= 0, "{} is already viewed mutably", type_name::<T>());
        self.borrow.set(b + 1);
    }

    fn borrow_mut<T>(&self) {
        assert!(
            self.access == AccessMode::ReadWrite,
            "{} is declared read-only in this query",
            type_name::<T>()
        );
        assert!(self.borrow.get() == 0, "{} is already viewed", type_name::<T>());
        self.borrow.set(-1);
    }

    fn forked(&self) -> Self {
        Self {
            rust_type: self.rust_type,
            access: self.access,
            ptr: self.ptr,
            borrow: Cell::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// The binding of a query's requirements to one chunk's memory.
///
/// Create one with [`ExecutionContext::new`] and pass it to
/// [`EntityQuery::for_each_entity_chunk`](crate::query::EntityQuery::for_each_entity_chunk).
/// Parallel iteration forks an independent context per chunk task.
pub struct ExecutionContext {
    fragment_views: Vec<View>,
    chunk_fragment_views: Vec<View>,
    shared_views: Vec<(TypeId, Option<Arc<dyn SharedValue>>)>,
    entities: *const EntityHandle,
    num_entities: usize,
    archetype: Option<ArchetypeId>,
    chunk_collection: Option<ArchetypeChunkCollection>,
    commands: RefCell<CommandBuffer>,
}

// Raw column pointers are only dereferenced by the task the context is bound
// for; shared values are `Send + Sync`.
unsafe impl Send for ExecutionContext {}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("archetype", &self.archetype)
            .field("num_entities", &self.num_entities)
            .field("fragment_views", &self.fragment_views.len())
            .field("chunk_fragment_views", &self.chunk_fragment_views.len())
            .field("shared_views", &self.shared_views.len())
            .field("chunk_collection", &self.chunk_collection)
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            fragment_views: Vec::new(),
            chunk_fragment_views: Vec::new(),
            shared_views: Vec::new(),
            entities: std::ptr::null(),
            num_entities: 0,
            archetype: None,
            chunk_collection: None,
            commands: RefCell::new(CommandBuffer::new()),
        }
    }

    /// A context that restricts iteration to `collection`.
    pub fn with_chunk_collection(collection: ArchetypeChunkCollection) -> Self {
        let mut ctx = Self::new();
        ctx.chunk_collection = Some(collection);
        ctx
    }

    /// Restrict (or stop restricting) iteration to an explicit chunk subset.
    pub fn set_chunk_collection(&mut self, collection: Option<ArchetypeChunkCollection>) {
        self.chunk_collection = collection;
    }

    pub fn chunk_collection(&self) -> Option<&ArchetypeChunkCollection> {
        self.chunk_collection.as_ref()
    }

    // -- binding (crate internal) -------------------------------------------

    /// Set up one view per requirement, unbound.
    pub(crate) fn prepare_views(
        &mut self,
        archetype: ArchetypeId,
        fragments: &[Requirement],
        chunk_fragments: &[Requirement],
        shared: &[(TypeId, Option<Arc<dyn SharedValue>>)],
    ) {
        self.archetype = Some(archetype);
        self.fragment_views = fragments.iter().map(View::from_requirement).collect();
        self.chunk_fragment_views = chunk_fragments.iter().map(View::from_requirement).collect();
        self.shared_views = shared.to_vec();
        self.entities = std::ptr::null();
        self.num_entities = 0;
    }

    pub(crate) fn bind_chunk(&mut self, binding: &ChunkBinding) {
        debug_assert_eq!(binding.fragments.len(), self.fragment_views.len());
        debug_assert_eq!(binding.chunk_fragments.len(), self.chunk_fragment_views.len());
        for (view, &ptr) in self.fragment_views.iter_mut().zip(&binding.fragments) {
            view.bind(ptr);
        }
        for (view, &ptr) in self.chunk_fragment_views.iter_mut().zip(&binding.chunk_fragments) {
            view.bind(ptr);
        }
        self.entities = binding.entities;
        self.num_entities = binding.len;
    }

    /// Drop every binding so no pointer outlives the archetype it came from.
    pub(crate) fn clear_views(&mut self) {
        self.fragment_views.clear();
        self.chunk_fragment_views.clear();
        self.shared_views.clear();
        self.entities = std::ptr::null();
        self.num_entities = 0;
        self.archetype = None;
    }

    /// An independent copy of the current binding with an empty command
    /// buffer.
    pub(crate) fn fork(&self) -> Self {
        Self {
            fragment_views: self.fragment_views.iter().map(View::forked).collect(),
            chunk_fragment_views: self.chunk_fragment_views.iter().map(View::forked).collect(),
            shared_views: self.shared_views.clone(),
            entities: self.entities,
            num_entities: self.num_entities,
            archetype: self.archetype,
            chunk_collection: None,
            commands: RefCell::new(CommandBuffer::new()),
        }
    }

    pub(crate) fn take_commands(&mut self) -> CommandBuffer {
        std::mem::take(self.commands.get_mut())
    }

    // -- callback-facing accessors ------------------------------------------

    fn fragment_view_for<T: 'static>(&self) -> &View {
        let wanted = TypeId::of::<T>();
        self.fragment_views
            .iter()
            .find(|v| v.rust_type == wanted)
            .unwrap_or_else(|| panic!("{} is not a fragment requirement of this query", type_name::<T>()))
    }

    fn chunk_fragment_view_for<T: 'static>(&self) -> &View {
        let wanted = TypeId::of::<T>();
        self.chunk_fragment_views
            .iter()
            .find(|v| v.rust_type == wanted)
            .unwrap_or_else(|| {
                panic!("{} is not a chunk fragment requirement of this query", type_name::<T>())
            })
    }

    /// Read-only column of `T` for the bound entities. Empty when `T` is an
    /// optional requirement the archetype lacks.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not a fragment requirement, or is already viewed
    /// mutably. A mutable view taken earlier in the same callback counts even
    /// if it is no longer used: borrows are released only when the next
    /// chunk is bound.
    pub fn fragment_view<T: 'static>(&self) -> &[T] {
        let view = self.fragment_view_for::<T>();
        view.borrow_shared::<T>();
        if view.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(view.ptr as *const T, self.num_entities) }
    }

    /// Mutable column of `T` for the bound entities.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not a fragment requirement, is declared
    /// [`AccessMode::ReadOnly`], or is already viewed. Any earlier
    /// [`fragment_view`](Self::fragment_view) of `T` in the same callback
    /// counts: borrows are released only when the next chunk is bound.
    #[allow(clippy::mut_from_ref)]
    pub fn fragment_view_mut<T: 'static>(&self) -> &mut [T] {
        let view = self.fragment_view_for::<T>();
        view.borrow_mut::<T>();
        if view.ptr.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(view.ptr as *mut T, self.num_entities) }
    }

    /// Whether the bound archetype stores `T`.
    pub fn has_fragment<T: 'static>(&self) -> bool {
        let wanted = TypeId::of::<T>();
        self.fragment_views
            .iter()
            .any(|v| v.rust_type == wanted && !v.ptr.is_null())
    }

    /// The bound chunk's value of chunk fragment `T`, if the archetype has it.
    pub fn try_chunk_fragment<T: 'static>(&self) -> Option<&T> {
        let view = self.chunk_fragment_view_for::<T>();
        if view.ptr.is_null() {
            return None;
        }
        view.borrow_shared::<T>();
        Some(unsafe { &*(view.ptr as *const T) })
    }

    /// The bound chunk's value of chunk fragment `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not a chunk fragment requirement or the archetype
    /// lacks it.
    pub fn chunk_fragment<T: 'static>(&self) -> &T {
        self.try_chunk_fragment::<T>()
            .unwrap_or_else(|| panic!("chunk fragment {} is not bound", type_name::<T>()))
    }

    /// Mutable access to the bound chunk's value of chunk fragment `T`.
    #[allow(clippy::mut_from_ref)]
    pub fn chunk_fragment_mut<T: 'static>(&self) -> &mut T {
        let view = self.chunk_fragment_view_for::<T>();
        assert!(!view.ptr.is_null(), "chunk fragment {} is not bound", type_name::<T>());
        view.borrow_mut::<T>();
        unsafe { &mut *(view.ptr as *mut T) }
    }

    /// The archetype's value of shared fragment `T`, if it has one.
    pub fn try_shared_fragment<T: 'static>(&self) -> Option<&T> {
        let wanted = TypeId::of::<T>();
        self.shared_views
            .iter()
            .find(|(id, _)| *id == wanted)
            .and_then(|(_, value)| value.as_ref())
            .and_then(|value| value.as_any().downcast_ref::<T>())
    }

    /// The archetype's value of shared fragment `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not a shared requirement or the archetype lacks it.
    pub fn shared_fragment<T: 'static>(&self) -> &T {
        self.try_shared_fragment::<T>()
            .unwrap_or_else(|| panic!("shared fragment {} is not bound", type_name::<T>()))
    }

    /// Handles of the bound entities, in slot order.
    pub fn entities(&self) -> &[EntityHandle] {
        if self.entities.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.entities, self.num_entities) }
    }

    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    /// The archetype currently bound, if any.
    pub fn archetype(&self) -> Option<ArchetypeId> {
        self.archetype
    }

    /// Queue structural changes to apply once iteration finishes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already borrowed.
    pub fn defer(&self) -> RefMut<'_, CommandBuffer> {
        self.commands.borrow_mut()
    }
}
