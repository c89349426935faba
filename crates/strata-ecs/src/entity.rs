//! Entity handles and the entity table.
//!
//! An [`EntityHandle`] is a 64-bit value that packs a *generation* in the
//! high 32 bits and an *index* in the low 32 bits. The index is a dense slot
//! in the [`EntityTable`]; the generation must match the slot's serial number
//! for the handle to be valid, which gives immediate stale-handle detection
//! once a slot is recycled.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`. Generation `0` is never handed
/// out, so [`EntityHandle::INVALID`] can never match a live entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(u64);

impl EntityHandle {
    /// A handle that never refers to an entity.
    pub const INVALID: EntityHandle = EntityHandle(0);

    /// Construct a handle from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether the handle was ever issued (generation is non-zero). Says
    /// nothing about whether the entity is still alive.
    #[inline]
    pub fn is_set(self) -> bool {
        self.generation() != 0
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for EntityHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Per-slot bookkeeping in the [`EntityTable`].
///
/// `serial == 0` marks a free slot. A slot with a serial but no archetype is
/// reserved: the handle is valid, but the entity has no storage yet.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EntityRecord {
    pub archetype: Option<ArchetypeId>,
    pub serial: u32,
}

impl EntityRecord {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.serial == 0
    }
}

/// Lifecycle state of a handle, as seen by the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// The handle is stale or was never issued.
    Invalid,
    /// The handle is valid but the entity has not been assigned an archetype.
    Reserved,
    /// The entity lives in an archetype.
    Active,
}

// ---------------------------------------------------------------------------
// EntityTable
// ---------------------------------------------------------------------------

/// Allocates and recycles entity slots.
///
/// Serial numbers come from a single table-wide counter, so a recycled slot
/// never reissues a generation it has used recently. Free indices are kept in
/// a FIFO queue so reuse is spread across slots rather than concentrated on a
/// hot index.
#[derive(Debug)]
pub struct EntityTable {
    records: Vec<EntityRecord>,
    free_indices: VecDeque<u32>,
    next_serial: u32,
    /// Slots with a non-zero serial (reserved or active).
    valid_count: usize,
}

impl EntityTable {
    /// Create a new, empty table.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            free_indices: VecDeque::new(),
            next_serial: 1,
            valid_count: 0,
        }
    }

    fn take_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.next_serial == 0 {
            self.next_serial = 1;
        }
        serial
    }

    /// Reserve a fresh handle. The slot has no archetype until
    /// [`set_archetype`](Self::set_archetype) is called.
    pub fn reserve(&mut self) -> EntityHandle {
        let serial = self.take_serial();
        let index = match self.free_indices.pop_front() {
            Some(index) => index,
            None => {
                self.records.push(EntityRecord::default());
                (self.records.len() - 1) as u32
            }
        };
        self.records[index as usize] = EntityRecord {
            archetype: None,
            serial,
        };
        self.valid_count += 1;
        EntityHandle::new(index, serial)
    }

    /// Release a handle, returning its slot to the free list.
    ///
    /// Returns `false` if the handle was already stale.
    pub fn release(&mut self, handle: EntityHandle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        self.records[handle.index() as usize] = EntityRecord::default();
        self.free_indices.push_back(handle.index());
        self.valid_count -= 1;
        true
    }

    /// Whether `handle` refers to a reserved or active entity.
    pub fn is_valid(&self, handle: EntityHandle) -> bool {
        self.records
            .get(handle.index() as usize)
            .is_some_and(|r| !r.is_free() && r.serial == handle.generation())
    }

    /// The lifecycle state of `handle`.
    pub fn state(&self, handle: EntityHandle) -> EntityState {
        match self.record(handle) {
            None => EntityState::Invalid,
            Some(r) if r.archetype.is_none() => EntityState::Reserved,
            Some(_) => EntityState::Active,
        }
    }

    /// The archetype `handle` lives in, if it is active.
    pub fn archetype_of(&self, handle: EntityHandle) -> Option<ArchetypeId> {
        self.record(handle).and_then(|r| r.archetype)
    }

    pub(crate) fn record(&self, handle: EntityHandle) -> Option<&EntityRecord> {
        self.records
            .get(handle.index() as usize)
            .filter(|r| !r.is_free() && r.serial == handle.generation())
    }

    /// Point a valid handle's record at an archetype (or back to reserved).
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub(crate) fn set_archetype(&mut self, handle: EntityHandle, archetype: Option<ArchetypeId>) {
        assert!(self.is_valid(handle), "entity {handle:?} is not valid");
        self.records[handle.index() as usize].archetype = archetype;
    }

    /// Number of reserved plus active entities.
    pub fn len(&self) -> usize {
        self.valid_count
    }

    /// Whether no entity is reserved or active.
    pub fn is_empty(&self) -> bool {
        self.valid_count == 0
    }

    /// Number of slots ever allocated (free or not).
    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_unique_indices() {
        let mut table = EntityTable::new();
        let handles: Vec<EntityHandle> = (0..100).map(|_| table.reserve()).collect();
        let mut indices: Vec<u32> = handles.iter().map(|h| h.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let mut table = EntityTable::new();
        let e0 = table.reserve();
        assert!(table.release(e0));
        let e1 = table.reserve();
        assert_eq!(e1.index(), e0.index());
        assert_ne!(e1.generation(), e0.generation());
        assert!(!table.is_valid(e0), "stale handle must not be valid");
        assert!(table.is_valid(e1));
    }

    #[test]
    fn double_release_returns_false() {
        let mut table = EntityTable::new();
        let e = table.reserve();
        assert!(table.release(e));
        assert!(!table.release(e));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn state_transitions() {
        let mut table = EntityTable::new();
        let e = table.reserve();
        assert_eq!(table.state(e), EntityState::Reserved);
        table.set_archetype(e, Some(ArchetypeId(0)));
        assert_eq!(table.state(e), EntityState::Active);
        assert_eq!(table.archetype_of(e), Some(ArchetypeId(0)));
        table.release(e);
        assert_eq!(table.state(e), EntityState::Invalid);
    }

    #[test]
    fn invalid_handle_is_never_valid() {
        let mut table = EntityTable::new();
        let _ = table.reserve();
        assert!(!table.is_valid(EntityHandle::INVALID));
        assert!(!EntityHandle::INVALID.is_set());
    }

    #[test]
    fn handle_roundtrip() {
        let h = EntityHandle::new(42, 7);
        assert_eq!(h.index(), 42);
        assert_eq!(h.generation(), 7);
        assert_eq!(EntityHandle::from_raw(h.to_raw()), h);
    }
}
