//! Fixed-capacity chunk storage.
//!
//! A [`Chunk`] is one raw buffer holding up to `capacity` entities of a single
//! archetype. The buffer is columnar: the entity handle column sits at offset
//! zero, followed by one column per fragment type at the offsets computed by
//! the owning archetype. Chunk fragments live beside the buffer, one value per
//! chunk.
//!
//! # Safety
//!
//! The chunk knows nothing about the types stored in its columns. Every
//! operation that touches fragment memory takes the archetype's
//! [`FragmentConfig`]s, and the archetype guarantees that the configs match
//! the layout the chunk was created with and that slot indices are in range.

use std::alloc::Layout;
use std::any::TypeId;
use std::ptr;

use crate::archetype::FragmentConfig;
use crate::entity::EntityHandle;
use crate::fragment::{FragmentTypeId, FragmentVtable};
use crate::value::FragmentBuf;

// ---------------------------------------------------------------------------
// ChunkFragmentTemplate
// ---------------------------------------------------------------------------

/// The initial value of a chunk fragment, cloned into every new or recycled
/// chunk of an archetype.
pub(crate) struct ChunkFragmentTemplate {
    pub type_id: FragmentTypeId,
    pub rust_type: TypeId,
    pub vtable: FragmentVtable,
    pub value: FragmentBuf,
}

impl ChunkFragmentTemplate {
    pub fn new(type_id: FragmentTypeId, rust_type: TypeId, vtable: FragmentVtable) -> Self {
        Self {
            type_id,
            rust_type,
            vtable,
            value: FragmentBuf::from_default(&vtable, rust_type),
        }
    }

    pub fn instantiate(&self) -> FragmentBuf {
        unsafe { FragmentBuf::clone_from_raw(&self.vtable, self.rust_type, self.value.as_ptr()) }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Dense storage for up to `capacity` entities of one archetype.
pub struct Chunk {
    /// Backing buffer. Null while released.
    data: *mut u8,
    layout: Layout,
    capacity: usize,
    num_instances: usize,
    /// Bumped on every structural change to the chunk.
    serial_modification_number: u32,
    chunk_fragments: Vec<(FragmentTypeId, FragmentBuf)>,
}

// The buffer is exclusively owned and only registered `Send + Sync` types are
// stored in it.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn new(layout: Layout, capacity: usize, templates: &[ChunkFragmentTemplate]) -> Self {
        assert!(capacity > 0, "chunk capacity must be non-zero");
        Self {
            data: ptr::null_mut(),
            layout,
            capacity,
            num_instances: 0,
            serial_modification_number: 0,
            chunk_fragments: templates.iter().map(|t| (t.type_id, t.instantiate())).collect(),
        }
    }

    /// Number of entities stored.
    #[inline]
    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_instances == self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_instances == 0
    }

    /// Whether the chunk currently holds a backing buffer.
    #[inline]
    pub fn has_buffer(&self) -> bool {
        !self.data.is_null()
    }

    #[inline]
    pub fn serial_modification_number(&self) -> u32 {
        self.serial_modification_number
    }

    fn acquire_buffer(&mut self) {
        if self.data.is_null() {
            let data = unsafe { std::alloc::alloc(self.layout) };
            assert!(!data.is_null(), "chunk allocation failed ({:?})", self.layout);
            self.data = data;
        }
    }

    fn release_buffer(&mut self) {
        if !self.data.is_null() {
            unsafe { std::alloc::dealloc(self.data, self.layout) };
            self.data = ptr::null_mut();
        }
    }

    /// Grow the entity count by `count`. Returns the index of the first new
    /// slot. The new slots are uninitialized.
    ///
    /// # Panics
    ///
    /// Panics if the chunk would exceed its capacity.
    pub(crate) fn add_instances(&mut self, count: usize) -> usize {
        assert!(
            self.num_instances + count <= self.capacity,
            "chunk overflow: {} + {count} exceeds capacity {}",
            self.num_instances,
            self.capacity
        );
        self.acquire_buffer();
        let start = self.num_instances;
        self.num_instances += count;
        self.serial_modification_number = self.serial_modification_number.wrapping_add(1);
        start
    }

    /// Shrink the entity count by `count`. The trailing slots must already
    /// have been dropped or moved out.
    ///
    /// When the count reaches zero and `release_memory` is set, the buffer is
    /// freed and re-acquired on the next [`add_instances`](Self::add_instances).
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the number of stored entities.
    pub(crate) fn remove_instances(&mut self, count: usize, release_memory: bool) {
        assert!(
            count <= self.num_instances,
            "chunk underflow: removing {count} of {} instances",
            self.num_instances
        );
        self.num_instances -= count;
        self.serial_modification_number = self.serial_modification_number.wrapping_add(1);
        if self.num_instances == 0 && release_memory {
            self.release_buffer();
        }
    }

    /// Reset the chunk fragments of an empty chunk to their template values.
    pub(crate) fn recycle(&mut self, templates: &[ChunkFragmentTemplate]) {
        debug_assert!(self.is_empty(), "recycling a chunk that still holds entities");
        for ((id, value), template) in self.chunk_fragments.iter_mut().zip(templates) {
            debug_assert_eq!(*id, template.type_id);
            value.replace_with(template.instantiate());
        }
        self.serial_modification_number = self.serial_modification_number.wrapping_add(1);
    }

    /// Address of one fragment value.
    ///
    /// Only debug builds check `index` and the buffer.
    #[inline]
    pub(crate) fn fragment_ptr(&self, config: &FragmentConfig, index: usize) -> *mut u8 {
        debug_assert!(!self.data.is_null(), "chunk buffer is released");
        debug_assert!(index < self.capacity, "slot {index} out of range");
        unsafe { self.data.add(config.offset + index * config.size()) }
    }

    /// Start of the entity handle column.
    #[inline]
    pub(crate) fn entity_ptr(&self) -> *mut EntityHandle {
        self.data as *mut EntityHandle
    }

    /// The handles of the stored entities, in slot order.
    pub fn entities(&self) -> &[EntityHandle] {
        if self.data.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.entity_ptr(), self.num_instances) }
    }

    #[inline]
    pub(crate) fn entity_at(&self, index: usize) -> EntityHandle {
        debug_assert!(index < self.num_instances);
        unsafe { *self.entity_ptr().add(index) }
    }

    #[inline]
    pub(crate) fn set_entity(&mut self, index: usize, handle: EntityHandle) {
        debug_assert!(index < self.num_instances);
        unsafe { self.entity_ptr().add(index).write(handle) };
    }

    /// Address of a chunk fragment value, if the chunk has one of that type.
    pub(crate) fn chunk_fragment_ptr(&self, type_id: FragmentTypeId) -> Option<*mut u8> {
        self.chunk_fragments
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, value)| value.as_ptr() as *mut u8)
    }

    pub(crate) fn chunk_fragment_buf_mut(&mut self, type_id: FragmentTypeId) -> Option<&mut FragmentBuf> {
        self.chunk_fragments
            .iter_mut()
            .find(|(id, _)| *id == type_id)
            .map(|(_, value)| value)
    }

    /// Write default values into every fragment column of `index`.
    ///
    /// # Safety
    ///
    /// The slot must be allocated and hold no live values.
    pub(crate) unsafe fn default_slot(&mut self, configs: &[FragmentConfig], index: usize) {
        for config in configs {
            (config.vtable.default_fn)(self.fragment_ptr(config, index));
        }
    }

    /// Drop every fragment value at `index`.
    ///
    /// # Safety
    ///
    /// The slot must hold live values.
    pub(crate) unsafe fn drop_slot(&mut self, configs: &[FragmentConfig], index: usize) {
        for config in configs {
            if let Some(drop_fn) = config.vtable.drop_fn {
                drop_fn(self.fragment_ptr(config, index));
            }
        }
    }

    /// Bitwise-move the slot `from` (values and handle) over the slot `to`.
    /// `from` no longer holds live values afterwards.
    ///
    /// # Safety
    ///
    /// Both slots must be in range; `to` must hold no live values.
    pub(crate) unsafe fn move_slot(&mut self, configs: &[FragmentConfig], from: usize, to: usize) {
        if from == to {
            return;
        }
        for config in configs {
            ptr::copy_nonoverlapping(
                self.fragment_ptr(config, from),
                self.fragment_ptr(config, to),
                config.size(),
            );
        }
        let handle = *self.entity_ptr().add(from);
        self.entity_ptr().add(to).write(handle);
    }

    /// Drop all live values. Used when the archetype is torn down.
    ///
    /// # Safety
    ///
    /// `configs` must describe this chunk's layout.
    pub(crate) unsafe fn drop_all(&mut self, configs: &[FragmentConfig]) {
        if self.data.is_null() {
            return;
        }
        for index in 0..self.num_instances {
            self.drop_slot(configs, index);
        }
        self.num_instances = 0;
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("num_instances", &self.num_instances)
            .field("capacity", &self.capacity)
            .field("has_buffer", &self.has_buffer())
            .field("serial", &self.serial_modification_number)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
