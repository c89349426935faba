//! Archetype storage.
//!
//! An [`Archetype`] stores every entity that shares one exact
//! [`ArchetypeComposition`] (and set of shared fragment values). Entities live
//! in fixed-capacity [`Chunk`]s; inside a chunk, each fragment type occupies
//! one column. Columns are laid out in ascending [`FragmentTypeId`] order, so
//! two archetypes with overlapping fragment sets order their columns the same
//! way.
//!
//! Placement bookkeeping is an index layer: `entity_map` maps an entity index
//! to its absolute slot (`chunk_index * capacity + index_in_chunk`). Removal
//! swaps the last entity of the same chunk into the hole and updates exactly
//! one map entry.
//!
//! # Safety
//!
//! All column memory is type-erased. The archetype is the only code that pairs
//! a chunk with the [`FragmentConfig`]s describing its layout, and every slot
//! index it hands to a chunk is in range.

use std::alloc::Layout;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::time::Instant;

use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkFragmentTemplate};
use crate::collection::ChunkRange;
use crate::composition::{ArchetypeComposition, SharedFragmentValues};
use crate::config::EntityManagerConfig;
use crate::entity::EntityHandle;
use crate::execution::{ChunkBinding, ExecutionContext};
use crate::fragment::{FragmentRegistry, FragmentTypeId, FragmentVtable};
use crate::query::{ConditionFn, Presence, RequirementMapping, RequirementSet};
use crate::value::FragmentBuf;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within its entity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// FragmentConfig
// ---------------------------------------------------------------------------

/// Where one fragment column lives inside a chunk buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FragmentConfig {
    pub type_id: FragmentTypeId,
    pub rust_type: TypeId,
    /// Byte offset of the column from the start of the chunk buffer.
    pub offset: usize,
    pub vtable: FragmentVtable,
}

impl FragmentConfig {
    #[inline]
    pub fn size(&self) -> usize {
        self.vtable.size
    }
}

/// Result of a time-budgeted compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Entities moved from a trailing chunk into an earlier one.
    pub entities_moved: usize,
    /// Empty trailing chunks removed.
    pub chunks_released: usize,
    /// Whether the pass reached a fully compacted state.
    pub completed: bool,
}

impl CompactionReport {
    pub(crate) fn merge(&mut self, other: CompactionReport) {
        self.entities_moved += other.entities_moved;
        self.chunks_released += other.chunks_released;
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

struct ChunkLayout {
    capacity: usize,
    offsets: Vec<usize>,
    buffer: Layout,
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Fit as many entities as possible into `chunk_size` bytes: the handle
/// column first, then each fragment column aligned in the given order.
fn compute_layout(chunk_size: usize, vtables: &[FragmentVtable]) -> ChunkLayout {
    let handle_size = std::mem::size_of::<EntityHandle>();
    let handle_align = std::mem::align_of::<EntityHandle>();
    let per_entity: usize = handle_size + vtables.iter().map(|v| v.size).sum::<usize>();
    let padding: usize = vtables.iter().map(|v| v.align).sum();
    let buffer_align = vtables.iter().map(|v| v.align).fold(handle_align, usize::max);

    let mut capacity = (chunk_size.saturating_sub(padding) / per_entity).max(1);
    loop {
        let mut cursor = handle_size * capacity;
        let mut offsets = Vec::with_capacity(vtables.len());
        for vtable in vtables {
            cursor = align_up(cursor, vtable.align);
            offsets.push(cursor);
            cursor += vtable.size * capacity;
        }
        if cursor <= chunk_size || capacity == 1 {
            let buffer = match Layout::from_size_align(cursor, buffer_align) {
                Ok(layout) => layout,
                Err(e) => panic!("chunk layout of {cursor} bytes is invalid: {e}"),
            };
            return ChunkLayout {
                capacity,
                offsets,
                buffer,
            };
        }
        capacity -= 1;
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All chunks and placement bookkeeping for one composition.
pub struct Archetype {
    id: ArchetypeId,
    composition: ArchetypeComposition,
    shared_values: SharedFragmentValues,
    /// Sorted by type id.
    fragment_configs: Vec<FragmentConfig>,
    /// Sorted by type id.
    chunk_fragment_templates: Vec<ChunkFragmentTemplate>,
    chunks: Vec<Chunk>,
    /// Entity index -> absolute slot.
    entity_map: HashMap<u32, usize>,
    num_entities_per_chunk: usize,
    chunk_layout: Layout,
    release_empty_chunk_memory: bool,
    /// First chunk not known to be full. Every chunk below it is full.
    compaction_cursor: usize,
}

impl Archetype {
    /// Lay out an archetype for `composition`.
    ///
    /// # Panics
    ///
    /// Panics if a type in the composition is unregistered, or if the shared
    /// values do not cover exactly the composition's shared fragment types.
    pub(crate) fn new(
        id: ArchetypeId,
        composition: ArchetypeComposition,
        shared_values: SharedFragmentValues,
        registry: &FragmentRegistry,
        config: &EntityManagerConfig,
    ) -> Self {
        assert!(
            shared_values.types() == composition.shared_fragments,
            "shared fragment values {:?} do not match the composition's shared types {:?}",
            shared_values,
            composition.shared_fragments
        );

        let mut types = Vec::new();
        let mut vtables = Vec::new();
        for type_id in composition.fragments.iter() {
            let info = registry.info_checked(type_id);
            let Some(vtable) = info.vtable else {
                panic!("fragment '{}' has no vtable", info.name);
            };
            types.push((type_id, info.type_id));
            vtables.push(vtable);
        }
        let layout = compute_layout(config.chunk_memory_size, &vtables);

        let fragment_configs = types
            .into_iter()
            .zip(vtables)
            .zip(&layout.offsets)
            .map(|(((type_id, rust_type), vtable), &offset)| FragmentConfig {
                type_id,
                rust_type,
                offset,
                vtable,
            })
            .collect();

        let chunk_fragment_templates = composition
            .chunk_fragments
            .iter()
            .map(|type_id| {
                let info = registry.info_checked(type_id);
                let Some(vtable) = info.vtable else {
                    panic!("chunk fragment '{}' has no vtable", info.name);
                };
                ChunkFragmentTemplate::new(type_id, info.type_id, vtable)
            })
            .collect();

        debug!(
            archetype = id.0,
            capacity = layout.capacity,
            chunk_bytes = layout.buffer.size(),
            fragments = ?composition.fragments,
            tags = ?composition.tags,
            "archetype created"
        );

        Self {
            id,
            composition,
            shared_values,
            fragment_configs,
            chunk_fragment_templates,
            chunks: Vec::new(),
            entity_map: HashMap::new(),
            num_entities_per_chunk: layout.capacity,
            chunk_layout: layout.buffer,
            release_empty_chunk_memory: config.release_empty_chunk_memory,
            compaction_cursor: 0,
        }
    }

    // -- accessors ------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn composition(&self) -> &ArchetypeComposition {
        &self.composition
    }

    pub fn shared_values(&self) -> &SharedFragmentValues {
        &self.shared_values
    }

    /// Number of entities stored.
    #[inline]
    pub fn num_entities(&self) -> usize {
        self.entity_map.len()
    }

    /// Entities one chunk can hold.
    #[inline]
    pub fn num_entities_per_chunk(&self) -> usize {
        self.num_entities_per_chunk
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Size in bytes of each chunk buffer.
    pub fn chunk_memory_size(&self) -> usize {
        self.chunk_layout.size()
    }

    /// The compaction resume point: every chunk below it is full.
    pub fn compaction_cursor(&self) -> usize {
        self.compaction_cursor
    }

    /// Fragment types in column order.
    pub fn fragment_types(&self) -> impl Iterator<Item = FragmentTypeId> + '_ {
        self.fragment_configs.iter().map(|c| c.type_id)
    }

    /// Byte offset of `type_id`'s column within a chunk buffer.
    pub fn fragment_offset(&self, type_id: FragmentTypeId) -> Option<usize> {
        self.config_index(type_id).map(|i| self.fragment_configs[i].offset)
    }

    /// Every stored entity, chunk by chunk in slot order.
    pub fn entities(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.chunks.iter().flat_map(|c| c.entities().iter().copied())
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.entity_map.contains_key(&handle.index())
    }

    /// `(chunk_index, index_in_chunk)` of a stored entity.
    pub fn slot_of(&self, handle: EntityHandle) -> Option<(usize, usize)> {
        self.entity_map
            .get(&handle.index())
            .map(|&slot| (slot / self.num_entities_per_chunk, slot % self.num_entities_per_chunk))
    }

    pub(crate) fn config_index(&self, type_id: FragmentTypeId) -> Option<usize> {
        self.fragment_configs
            .binary_search_by_key(&type_id, |c| c.type_id)
            .ok()
    }

    fn expect_slot(&self, handle: EntityHandle) -> (usize, usize) {
        self.slot_of(handle)
            .unwrap_or_else(|| panic!("entity {handle:?} is not stored in archetype {:?}", self.id))
    }

    /// Address of `handle`'s value of `type_id`.
    pub(crate) fn fragment_ptr_for(&self, handle: EntityHandle, type_id: FragmentTypeId) -> Option<*mut u8> {
        let config = &self.fragment_configs[self.config_index(type_id)?];
        let (chunk_index, index) = self.slot_of(handle)?;
        Some(self.chunks[chunk_index].fragment_ptr(config, index))
    }

    /// Address of the chunk fragment `type_id` of the chunk holding `handle`.
    pub(crate) fn chunk_fragment_ptr_for(&self, handle: EntityHandle, type_id: FragmentTypeId) -> Option<*mut u8> {
        let (chunk_index, _) = self.slot_of(handle)?;
        self.chunks[chunk_index].chunk_fragment_ptr(type_id)
    }

    pub(crate) fn chunk_fragment_buf_for(
        &mut self,
        handle: EntityHandle,
        type_id: FragmentTypeId,
    ) -> Option<&mut FragmentBuf> {
        let (chunk_index, _) = self.slot_of(handle)?;
        self.chunks[chunk_index].chunk_fragment_buf_mut(type_id)
    }

    /// Overwrite `handle`'s value of fragment `type_id`, dropping the old
    /// value.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not stored here, `type_id` is not one of this
    /// archetype's fragments, or `value` holds a different Rust type.
    pub(crate) fn replace_fragment_value(&mut self, handle: EntityHandle, type_id: FragmentTypeId, value: FragmentBuf) {
        let Some(config_index) = self.config_index(type_id) else {
            panic!("{type_id:?} is not a fragment of archetype {:?}", self.id);
        };
        let config = &self.fragment_configs[config_index];
        assert!(value.rust_type() == config.rust_type, "fragment value type mismatch");
        let (chunk_index, index) = self.expect_slot(handle);
        let dst = self.chunks[chunk_index].fragment_ptr(config, index);
        unsafe {
            if let Some(drop_fn) = config.vtable.drop_fn {
                drop_fn(dst);
            }
            value.move_into(dst);
        }
    }

    // -- placement ------------------------------------------------------------

    /// Claim a slot for `handle` in the lowest chunk with room, starting at
    /// the compaction cursor. The slot's fragment memory is uninitialized.
    fn allocate_slot(&mut self, handle: EntityHandle) -> (usize, usize) {
        debug_assert!(
            !self.entity_map.contains_key(&handle.index()),
            "entity {handle:?} is already in archetype {:?}",
            self.id
        );
        let existing = (self.compaction_cursor..self.chunks.len()).find(|&i| !self.chunks[i].is_full());
        let chunk_index = match existing {
            Some(i) => {
                if self.chunks[i].is_empty() {
                    self.chunks[i].recycle(&self.chunk_fragment_templates);
                }
                i
            }
            None => {
                self.chunks.push(Chunk::new(
                    self.chunk_layout,
                    self.num_entities_per_chunk,
                    &self.chunk_fragment_templates,
                ));
                self.chunks.len() - 1
            }
        };

        let chunk = &mut self.chunks[chunk_index];
        let index = chunk.add_instances(1);
        chunk.set_entity(index, handle);
        self.compaction_cursor = if chunk.is_full() { chunk_index + 1 } else { chunk_index };
        self.entity_map
            .insert(handle.index(), chunk_index * self.num_entities_per_chunk + index);
        (chunk_index, index)
    }

    /// Add `handle` with every fragment default-constructed.
    ///
    /// The slot is not necessarily at the end: holes left by removals are
    /// refilled first, from the compaction cursor up. A new entity can
    /// therefore land in an older chunk and pick up that chunk's fragment
    /// values.
    pub(crate) fn add_entity(&mut self, handle: EntityHandle) -> (usize, usize) {
        let (chunk_index, index) = self.allocate_slot(handle);
        unsafe { self.chunks[chunk_index].default_slot(&self.fragment_configs, index) };
        (chunk_index, index)
    }

    /// Add `handle`, moving in the given values and default-constructing the
    /// rest.
    ///
    /// # Panics
    ///
    /// Panics if a value's type is not a fragment of this archetype.
    pub(crate) fn add_entity_with(
        &mut self,
        handle: EntityHandle,
        mut values: Vec<(FragmentTypeId, FragmentBuf)>,
    ) -> (usize, usize) {
        if let Some((stray, _)) = values.iter().find(|(id, _)| self.config_index(*id).is_none()) {
            panic!("{stray:?} is not a fragment of archetype {:?}", self.id);
        }
        let (chunk_index, index) = self.allocate_slot(handle);
        let chunk = &self.chunks[chunk_index];
        for config in &self.fragment_configs {
            let dst = chunk.fragment_ptr(config, index);
            match values.iter().position(|(id, _)| *id == config.type_id) {
                Some(pos) => {
                    let (_, value) = values.swap_remove(pos);
                    assert!(value.rust_type() == config.rust_type, "fragment value type mismatch");
                    unsafe { value.move_into(dst) };
                }
                None => unsafe { (config.vtable.default_fn)(dst) },
            }
        }
        (chunk_index, index)
    }

    /// Add `copy` as a clone of the stored entity `source`.
    pub(crate) fn duplicate_entity(&mut self, source: EntityHandle, copy: EntityHandle) {
        let (src_chunk, src_index) = self.expect_slot(source);
        let (dst_chunk, dst_index) = self.allocate_slot(copy);
        let src = &self.chunks[src_chunk];
        let dst = &self.chunks[dst_chunk];
        for config in &self.fragment_configs {
            unsafe {
                (config.vtable.clone_fn)(
                    src.fragment_ptr(config, src_index),
                    dst.fragment_ptr(config, dst_index),
                );
            }
        }
    }

    /// Remove `handle`, dropping its fragment values.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not stored here.
    pub(crate) fn remove_entity(&mut self, handle: EntityHandle) {
        self.remove_slot(handle, true);
    }

    fn remove_slot(&mut self, handle: EntityHandle, drop_values: bool) {
        let Some(slot) = self.entity_map.remove(&handle.index()) else {
            panic!("entity {handle:?} is not stored in archetype {:?}", self.id);
        };
        let chunk_index = slot / self.num_entities_per_chunk;
        let index = slot % self.num_entities_per_chunk;

        let configs = &self.fragment_configs;
        let chunk = &mut self.chunks[chunk_index];
        debug_assert_eq!(chunk.entity_at(index), handle);
        let last = chunk.num_instances() - 1;
        unsafe {
            if drop_values {
                chunk.drop_slot(configs, index);
            }
            if index != last {
                let moved = chunk.entity_at(last);
                chunk.move_slot(configs, last, index);
                self.entity_map.insert(moved.index(), slot);
            }
        }
        chunk.remove_instances(1, self.release_empty_chunk_memory);

        if chunk_index < self.compaction_cursor {
            self.compaction_cursor = chunk_index;
        }
        self.pop_trailing_empty_chunks();
    }

    fn pop_trailing_empty_chunks(&mut self) -> usize {
        let mut popped = 0;
        while self.chunks.last().is_some_and(Chunk::is_empty) {
            self.chunks.pop();
            popped += 1;
        }
        self.compaction_cursor = self.compaction_cursor.min(self.chunks.len());
        popped
    }

    /// Move `handle` into `dest`: shared fragment types are moved bitwise,
    /// types only `dest` has are default-constructed, types only `self` has
    /// are dropped.
    pub(crate) fn move_entity_to(&mut self, handle: EntityHandle, dest: &mut Archetype) {
        let (src_chunk, src_index) = self.expect_slot(handle);
        let (dst_chunk, dst_index) = dest.allocate_slot(handle);
        {
            let src = &self.chunks[src_chunk];
            let dst = &dest.chunks[dst_chunk];
            for config in &dest.fragment_configs {
                let to = dst.fragment_ptr(config, dst_index);
                match self.config_index(config.type_id) {
                    Some(i) => unsafe {
                        ptr::copy_nonoverlapping(
                            src.fragment_ptr(&self.fragment_configs[i], src_index),
                            to,
                            config.size(),
                        );
                    },
                    None => unsafe { (config.vtable.default_fn)(to) },
                }
            }
            for config in &self.fragment_configs {
                if dest.config_index(config.type_id).is_none() {
                    if let Some(drop_fn) = config.vtable.drop_fn {
                        unsafe { drop_fn(src.fragment_ptr(config, src_index)) };
                    }
                }
            }
        }
        self.remove_slot(handle, false);
    }

    // -- compaction -----------------------------------------------------------

    /// Fill holes in earlier chunks with entities from the last chunk until
    /// the archetype is compact or `deadline` passes.
    ///
    /// The deadline is checked before each single-entity step and every step
    /// leaves the archetype consistent, so a pass can stop anywhere and the
    /// next one resumes from the cursor.
    pub(crate) fn compact_entities(&mut self, deadline: Instant) -> CompactionReport {
        let mut report = CompactionReport::default();
        loop {
            while self.compaction_cursor < self.chunks.len() && self.chunks[self.compaction_cursor].is_full() {
                self.compaction_cursor += 1;
            }
            // Trailing empty chunks are always popped, so the last chunk is
            // the last non-empty one.
            let last = match self.chunks.len().checked_sub(1) {
                Some(last) if self.compaction_cursor < last => last,
                _ => {
                    report.completed = true;
                    break;
                }
            };
            if Instant::now() >= deadline {
                break;
            }
            self.move_last_entity_into_cursor_chunk(last);
            report.entities_moved += 1;
            report.chunks_released += self.pop_trailing_empty_chunks();
        }
        if report.entities_moved > 0 {
            debug!(
                archetype = self.id.0,
                moved = report.entities_moved,
                released = report.chunks_released,
                completed = report.completed,
                "compacted archetype"
            );
        }
        report
    }

    fn move_last_entity_into_cursor_chunk(&mut self, last: usize) {
        let cursor = self.compaction_cursor;
        debug_assert!(cursor < last);
        let (head, tail) = self.chunks.split_at_mut(last);
        let src = &mut tail[0];
        let dst = &mut head[cursor];

        if dst.is_empty() {
            dst.recycle(&self.chunk_fragment_templates);
        }
        let dst_index = dst.add_instances(1);
        let src_index = src.num_instances() - 1;
        let handle = src.entity_at(src_index);
        for config in &self.fragment_configs {
            unsafe {
                ptr::copy_nonoverlapping(
                    src.fragment_ptr(config, src_index),
                    dst.fragment_ptr(config, dst_index),
                    config.size(),
                );
            }
        }
        dst.set_entity(dst_index, handle);
        src.remove_instances(1, self.release_empty_chunk_memory);
        self.entity_map
            .insert(handle.index(), cursor * self.num_entities_per_chunk + dst_index);
    }

    // -- iteration ------------------------------------------------------------

    /// Map each requirement to this archetype's storage.
    pub(crate) fn build_mapping(&self, requirements: &RequirementSet) -> RequirementMapping {
        RequirementMapping {
            fragments: requirements
                .fragments
                .iter()
                .map(|r| {
                    if r.presence == Presence::None {
                        None
                    } else {
                        self.config_index(r.type_id)
                    }
                })
                .collect(),
            chunk_fragments: requirements
                .chunk_fragments
                .iter()
                .map(|r| {
                    (r.presence != Presence::None && self.composition.chunk_fragments.contains(r.type_id))
                        .then_some(r.type_id)
                })
                .collect(),
        }
    }

    /// Point `ctx` at this archetype: set up views and bind shared values.
    pub(crate) fn prepare_context(&self, ctx: &mut ExecutionContext, requirements: &RequirementSet) {
        let shared: Vec<_> = requirements
            .shared
            .iter()
            .map(|r| (r.rust_type, self.shared_values.get_dyn(r.type_id).cloned()))
            .collect();
        ctx.prepare_views(self.id, &requirements.fragments, &requirements.chunk_fragments, &shared);
    }

    fn bind_range(&self, range: ChunkRange, mapping: &RequirementMapping) -> ChunkBinding {
        let chunk = &self.chunks[range.chunk_index];
        ChunkBinding {
            archetype: self.id,
            chunk_index: range.chunk_index,
            serial: chunk.serial_modification_number(),
            entities: unsafe { chunk.entity_ptr().add(range.start) },
            len: range.len,
            fragments: mapping
                .fragments
                .iter()
                .map(|m| match m {
                    Some(i) => chunk.fragment_ptr(&self.fragment_configs[*i], range.start),
                    None => ptr::null_mut(),
                })
                .collect(),
            chunk_fragments: mapping
                .chunk_fragments
                .iter()
                .map(|m| m.and_then(|id| chunk.chunk_fragment_ptr(id)).unwrap_or(ptr::null_mut()))
                .collect(),
        }
    }

    /// Bindings for every non-empty chunk, or for the given ranges. Ranges
    /// that no longer fit the chunk contents are skipped.
    pub(crate) fn chunk_bindings(
        &self,
        mapping: &RequirementMapping,
        ranges: Option<&[ChunkRange]>,
    ) -> Vec<ChunkBinding> {
        match ranges {
            None => self
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.is_empty())
                .map(|(chunk_index, c)| {
                    self.bind_range(
                        ChunkRange {
                            chunk_index,
                            start: 0,
                            len: c.num_instances(),
                        },
                        mapping,
                    )
                })
                .collect(),
            Some(ranges) => ranges
                .iter()
                .filter(|r| {
                    let end = r.start.checked_add(r.len);
                    let fits = self
                        .chunks
                        .get(r.chunk_index)
                        .zip(end)
                        .is_some_and(|(c, end)| r.len > 0 && end <= c.num_instances());
                    if !fits {
                        warn!(archetype = self.id.0, range = ?r, "chunk range out of bounds, skipped");
                    }
                    fits
                })
                .map(|r| self.bind_range(*r, mapping))
                .collect(),
        }
    }

    /// Run `callback` over this archetype's chunks (or the given ranges),
    /// binding `ctx` to each. Returns the number of chunks visited.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_function(
        &self,
        ctx: &mut ExecutionContext,
        callback: &mut dyn FnMut(&ExecutionContext),
        requirements: &RequirementSet,
        mapping: &RequirementMapping,
        ranges: Option<&[ChunkRange]>,
        archetype_condition: Option<&ConditionFn>,
        chunk_condition: Option<&ConditionFn>,
    ) -> usize {
        self.prepare_context(ctx, requirements);
        if archetype_condition.is_some_and(|cond| !cond(&*ctx)) {
            return 0;
        }
        let mut visited = 0;
        for binding in self.chunk_bindings(mapping, ranges) {
            ctx.bind_chunk(&binding);
            if chunk_condition.is_some_and(|cond| !cond(&*ctx)) {
                continue;
            }
            callback(ctx);
            visited += 1;
            debug_assert_eq!(
                self.chunks[binding.chunk_index].serial_modification_number(),
                binding.serial,
                "chunk {} changed structurally during iteration",
                binding.chunk_index
            );
        }
        visited
    }

    // -- diagnostics ----------------------------------------------------------

    /// Check the placement bookkeeping against chunk contents.
    ///
    /// # Panics
    ///
    /// Panics on the first inconsistency found.
    pub fn debug_check_invariants(&self) {
        let mut seen = 0;
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            for (index, handle) in chunk.entities().iter().enumerate() {
                let expected = chunk_index * self.num_entities_per_chunk + index;
                assert_eq!(
                    self.entity_map.get(&handle.index()),
                    Some(&expected),
                    "entity {handle:?} is at slot {expected} but the map disagrees"
                );
                seen += 1;
            }
        }
        assert_eq!(seen, self.entity_map.len(), "entity map holds stale entries");
        assert!(
            self.chunks.last().map_or(true, |c| !c.is_empty()),
            "trailing chunk is empty"
        );
        for chunk in &self.chunks[..self.compaction_cursor] {
            assert!(chunk.is_full(), "chunk below the compaction cursor is not full");
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for chunk in &mut self.chunks {
            unsafe { chunk.drop_all(&self.fragment_configs) };
        }
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("composition", &self.composition)
            .field("shared_values", &self.shared_values)
            .field("num_entities", &self.num_entities())
            .field("num_chunks", &self.chunks.len())
            .field("num_entities_per_chunk", &self.num_entities_per_chunk)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
