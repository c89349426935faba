//! The [`EntityManager`] owns archetype identity and entity lifecycle.
//!
//! Every structural mutation goes through the manager. Outside a processing
//! scope mutations apply immediately; inside one (see
//! [`EntityManager::processing_scope`]) they are queued in the manager's
//! [`CommandBuffer`] and applied when the outermost scope closes.
//!
//! Structural operations treat misuse (stale handles, adding a fragment that
//! is already present, building an entity twice) as contract violations and
//! panic. The deferred path is tolerant: see [`crate::command`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::archetype::{Archetype, ArchetypeId, CompactionReport};
use crate::collection::ArchetypeChunkCollection;
use crate::command::{ApplyReport, CommandBuffer};
use crate::composition::{ArchetypeComposition, SharedFragmentValues};
use crate::config::EntityManagerConfig;
use crate::entity::{EntityHandle, EntityState, EntityTable};
use crate::fragment::{FragmentKind, FragmentRegistry, FragmentTypeId};
use crate::value::{FragmentBuf, FragmentBundle};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ManagerId
// ---------------------------------------------------------------------------

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`EntityManager`]. Queries key their
/// archetype cache on it so a query moved between managers rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Lifecycle events observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    /// Entities were assigned to an archetype and are fully initialized.
    Created,
    /// Active entities were removed from their archetype.
    Destroyed,
}

type Observer = Box<dyn FnMut(&[EntityHandle]) + Send>;

#[track_caller]
fn contract<T>(result: Result<T, EcsError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{e}"),
    }
}

// ---------------------------------------------------------------------------
// EntityManager
// ---------------------------------------------------------------------------

/// Owner of all archetypes and entities.
pub struct EntityManager {
    id: ManagerId,
    config: EntityManagerConfig,
    registry: FragmentRegistry,
    archetypes: Vec<Archetype>,
    /// Fragment-set hash -> archetypes with that fragment set.
    archetype_buckets: HashMap<u64, Vec<ArchetypeId>>,
    archetype_version: u64,
    entities: EntityTable,
    commands: CommandBuffer,
    processing_depth: u32,
    observers: Vec<(EntityEvent, Observer)>,
    /// Archetype that the next compaction pass starts from.
    compaction_cursor: usize,
    last_apply_report: ApplyReport,
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("id", &self.id)
            .field("archetypes", &self.archetypes.len())
            .field("archetype_version", &self.archetype_version)
            .field("entities", &self.entities.len())
            .field("pending_commands", &self.commands.len())
            .field("processing_depth", &self.processing_depth)
            .finish()
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManager {
    /// Create a manager with the default configuration.
    pub fn new() -> Self {
        Self::build(EntityManagerConfig::default())
    }

    /// Create a manager with a validated configuration.
    pub fn with_config(config: EntityManagerConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EntityManagerConfig) -> Self {
        Self {
            id: ManagerId::next(),
            config,
            registry: FragmentRegistry::new(),
            archetypes: Vec::new(),
            archetype_buckets: HashMap::new(),
            archetype_version: 0,
            entities: EntityTable::new(),
            commands: CommandBuffer::new(),
            processing_depth: 0,
            observers: Vec::new(),
            compaction_cursor: 0,
            last_apply_report: ApplyReport::default(),
        }
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    /// Bumped every time a new archetype is created.
    pub fn archetype_version(&self) -> u64 {
        self.archetype_version
    }

    // -- registration -------------------------------------------------------

    pub fn registry(&self) -> &FragmentRegistry {
        &self.registry
    }

    pub fn register_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.registry.register_fragment::<T>(name)
    }

    pub fn register_tag<T: Send + Sync + 'static>(&mut self, name: &str) -> FragmentTypeId {
        self.registry.register_tag::<T>(name)
    }

    pub fn register_chunk_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.registry.register_chunk_fragment::<T>(name)
    }

    pub fn register_shared_fragment<T>(&mut self, name: &str) -> FragmentTypeId
    where
        T: Clone + PartialEq + std::hash::Hash + Send + Sync + 'static,
    {
        self.registry.register_shared_fragment::<T>(name)
    }

    /// The registered id of `T`, if any.
    pub fn fragment_type<T: 'static>(&self) -> Option<FragmentTypeId> {
        self.registry.lookup::<T>()
    }

    // -- archetypes ---------------------------------------------------------

    /// Find or create the archetype for `composition` and `shared_values`.
    ///
    /// Identity is canonical: equal compositions (in any declaration order)
    /// with equal shared values always yield the same id.
    ///
    /// # Panics
    ///
    /// Panics if a type is unregistered or the shared values do not match the
    /// composition's shared fragment types.
    pub fn create_archetype(
        &mut self,
        composition: ArchetypeComposition,
        shared_values: SharedFragmentValues,
    ) -> ArchetypeId {
        let hash = composition.fragment_hash();
        if let Some(bucket) = self.archetype_buckets.get(&hash) {
            let existing = bucket.iter().copied().find(|id| {
                let archetype = &self.archetypes[id.index()];
                archetype.composition() == &composition && archetype.shared_values() == &shared_values
            });
            if let Some(id) = existing {
                return id;
            }
        }

        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, composition, shared_values, &self.registry, &self.config);
        self.archetypes.push(archetype);
        self.archetype_buckets.entry(hash).or_default().push(id);
        self.archetype_version += 1;
        id
    }

    /// Find or create the archetype holding exactly `types` (fragments, tags
    /// and chunk fragments, sorted by kind).
    pub fn create_archetype_from_types(&mut self, types: &[FragmentTypeId]) -> ArchetypeId {
        let composition = ArchetypeComposition::from_types(&self.registry, types);
        self.create_archetype(composition, SharedFragmentValues::new())
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn num_archetypes(&self) -> usize {
        self.archetypes.len()
    }

    #[track_caller]
    fn expect_archetype(&self, id: ArchetypeId) {
        contract(self.check_archetype(id));
    }

    fn check_archetype(&self, id: ArchetypeId) -> Result<(), EcsError> {
        if id.index() < self.archetypes.len() {
            Ok(())
        } else {
            Err(EcsError::UnknownArchetype { archetype: id })
        }
    }

    fn archetype_pair(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (head, tail) = self.archetypes.split_at_mut(bi);
            (&mut head[ai], &mut tail[0])
        } else {
            let (head, tail) = self.archetypes.split_at_mut(ai);
            (&mut tail[0], &mut head[bi])
        }
    }

    // -- entity state -------------------------------------------------------

    fn check_reserved(&self, handle: EntityHandle) -> Result<(), EcsError> {
        match self.entities.state(handle) {
            EntityState::Reserved => Ok(()),
            EntityState::Invalid => Err(EcsError::StaleEntity { entity: handle }),
            EntityState::Active => Err(EcsError::EntityAlreadyBuilt { entity: handle }),
        }
    }

    fn check_active(&self, handle: EntityHandle) -> Result<ArchetypeId, EcsError> {
        match self.entities.state(handle) {
            EntityState::Invalid => Err(EcsError::StaleEntity { entity: handle }),
            EntityState::Reserved => Err(EcsError::EntityNotBuilt { entity: handle }),
            EntityState::Active => self
                .entities
                .archetype_of(handle)
                .ok_or(EcsError::EntityNotBuilt { entity: handle }),
        }
    }

    /// Whether `handle` is reserved or active.
    pub fn is_entity_valid(&self, handle: EntityHandle) -> bool {
        self.entities.is_valid(handle)
    }

    /// Whether `handle` lives in an archetype.
    pub fn is_entity_active(&self, handle: EntityHandle) -> bool {
        self.entities.state(handle) == EntityState::Active
    }

    pub fn entity_state(&self, handle: EntityHandle) -> EntityState {
        self.entities.state(handle)
    }

    pub fn archetype_for_entity(&self, handle: EntityHandle) -> Option<ArchetypeId> {
        self.entities.archetype_of(handle)
    }

    /// Reserved plus active entities.
    pub fn debug_entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Entities stored in `archetype`.
    pub fn debug_archetype_entities_count(&self, archetype: ArchetypeId) -> usize {
        self.archetype(archetype).map_or(0, Archetype::num_entities)
    }

    // -- creation -----------------------------------------------------------

    /// Allocate a handle with no archetype. Assign it later with
    /// [`build_entity`](Self::build_entity).
    pub fn reserve_entity(&mut self) -> EntityHandle {
        self.entities.reserve()
    }

    /// Return an unbuilt reserved handle to the free list.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not reserved.
    pub fn release_reserved_entity(&mut self, handle: EntityHandle) {
        contract(self.check_reserved(handle));
        self.entities.release(handle);
    }

    /// Create an entity in `archetype` with default fragment values.
    ///
    /// Inside a processing scope the handle is reserved immediately and the
    /// build is deferred.
    ///
    /// # Panics
    ///
    /// Panics if `archetype` does not belong to this manager.
    pub fn create_entity(&mut self, archetype: ArchetypeId) -> EntityHandle {
        self.expect_archetype(archetype);
        let handle = self.entities.reserve();
        if self.is_processing() {
            self.commands.build_entity(handle, archetype);
        } else {
            self.place_entity(handle, archetype);
            self.notify(EntityEvent::Created, &[handle]);
        }
        handle
    }

    /// Create an entity whose archetype and initial values come from
    /// `bundle`.
    pub fn create_entity_with(&mut self, bundle: FragmentBundle) -> EntityHandle {
        let handle = self.entities.reserve();
        if self.is_processing() {
            self.commands.build_entity_with(handle, bundle);
        } else {
            contract(self.try_build_entity_with(handle, bundle));
        }
        handle
    }

    /// Create `count` entities in `archetype`.
    ///
    /// The `Created` notification for the whole batch fires when the returned
    /// context is dropped. Inside a processing scope the handles are reserved
    /// now and the batch is built, and notified once, at flush.
    pub fn batch_create_entities(&mut self, archetype: ArchetypeId, count: usize) -> EntityCreationContext<'_> {
        self.expect_archetype(archetype);
        let deferred = self.is_processing();
        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = self.entities.reserve();
            if !deferred {
                self.place_entity(handle, archetype);
            }
            entities.push(handle);
        }
        if deferred {
            self.commands.build_batch(entities.clone(), archetype);
        }
        EntityCreationContext {
            manager: self,
            entities,
            notify: !deferred,
        }
    }

    /// Assign a reserved entity to `archetype`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is stale or already built (checked at flush time
    /// when deferred).
    pub fn build_entity(&mut self, handle: EntityHandle, archetype: ArchetypeId) {
        self.expect_archetype(archetype);
        if self.is_processing() {
            self.commands.build_entity(handle, archetype);
        } else {
            contract(self.try_build_entity(handle, archetype));
        }
    }

    /// Build a reserved entity from `bundle`.
    pub fn build_entity_with(&mut self, handle: EntityHandle, bundle: FragmentBundle) {
        if self.is_processing() {
            self.commands.build_entity_with(handle, bundle);
        } else {
            contract(self.try_build_entity_with(handle, bundle));
        }
    }

    /// Create `count` copies of `handle` in its archetype, cloning every
    /// fragment value.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not active.
    pub fn duplicate_entity(&mut self, handle: EntityHandle, count: usize) -> Vec<EntityHandle> {
        let archetype = contract(self.check_active(handle));
        let deferred = self.is_processing();
        let mut copies = Vec::with_capacity(count);
        for _ in 0..count {
            let copy = self.entities.reserve();
            if !deferred {
                self.archetypes[archetype.index()].duplicate_entity(handle, copy);
                self.entities.set_archetype(copy, Some(archetype));
            }
            copies.push(copy);
        }
        if deferred {
            self.commands.build_duplicates(copies.clone(), handle);
        } else {
            self.notify(EntityEvent::Created, &copies);
        }
        copies
    }

    fn place_entity(&mut self, handle: EntityHandle, archetype: ArchetypeId) {
        self.archetypes[archetype.index()].add_entity(handle);
        self.entities.set_archetype(handle, Some(archetype));
    }

    pub(crate) fn try_build_entity(&mut self, handle: EntityHandle, archetype: ArchetypeId) -> Result<(), EcsError> {
        self.check_reserved(handle)?;
        self.check_archetype(archetype)?;
        self.place_entity(handle, archetype);
        self.notify(EntityEvent::Created, &[handle]);
        Ok(())
    }

    /// Build every handle of `entities` into `archetype`, then notify once.
    /// Nothing is placed unless all of them are still reserved.
    pub(crate) fn try_build_batch(&mut self, entities: &[EntityHandle], archetype: ArchetypeId) -> Result<(), EcsError> {
        self.check_archetype(archetype)?;
        for &handle in entities {
            self.check_reserved(handle)?;
        }
        for &handle in entities {
            self.place_entity(handle, archetype);
        }
        self.notify(EntityEvent::Created, entities);
        Ok(())
    }

    pub(crate) fn try_build_entity_with(&mut self, handle: EntityHandle, bundle: FragmentBundle) -> Result<(), EcsError> {
        self.check_reserved(handle)?;
        let composition = bundle.composition();
        let (values, shared) = bundle.into_parts();
        let archetype = self.create_archetype(composition, shared);
        self.archetypes[archetype.index()].add_entity_with(handle, values);
        self.entities.set_archetype(handle, Some(archetype));
        self.notify(EntityEvent::Created, &[handle]);
        Ok(())
    }

    pub(crate) fn try_build_duplicates(&mut self, copies: &[EntityHandle], source: EntityHandle) -> Result<(), EcsError> {
        let archetype = self.check_active(source)?;
        for &copy in copies {
            self.check_reserved(copy)?;
        }
        for &copy in copies {
            self.archetypes[archetype.index()].duplicate_entity(source, copy);
            self.entities.set_archetype(copy, Some(archetype));
        }
        self.notify(EntityEvent::Created, copies);
        Ok(())
    }

    // -- destruction --------------------------------------------------------

    /// Destroy an entity. A reserved entity is simply released.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is stale (outside a processing scope).
    pub fn destroy_entity(&mut self, handle: EntityHandle) {
        if self.is_processing() {
            self.commands.destroy_entity(handle);
        } else {
            contract(self.try_destroy_entity(handle));
        }
    }

    /// Destroy several entities, notifying observers once.
    ///
    /// # Panics
    ///
    /// Panics if any handle is stale (outside a processing scope).
    pub fn batch_destroy_entities(&mut self, handles: &[EntityHandle]) {
        if self.is_processing() {
            for &handle in handles {
                self.commands.destroy_entity(handle);
            }
            return;
        }
        let mut destroyed = Vec::with_capacity(handles.len());
        for &handle in handles {
            if contract(self.remove_entity(handle)) {
                destroyed.push(handle);
            }
        }
        self.notify(EntityEvent::Destroyed, &destroyed);
    }

    pub(crate) fn try_destroy_entity(&mut self, handle: EntityHandle) -> Result<(), EcsError> {
        if self.remove_entity(handle)? {
            self.notify(EntityEvent::Destroyed, &[handle]);
        }
        Ok(())
    }

    /// Release `handle`. Returns whether it was active.
    fn remove_entity(&mut self, handle: EntityHandle) -> Result<bool, EcsError> {
        match self.entities.state(handle) {
            EntityState::Invalid => Err(EcsError::StaleEntity { entity: handle }),
            EntityState::Reserved => {
                self.entities.release(handle);
                Ok(false)
            }
            EntityState::Active => {
                let archetype = self.check_active(handle)?;
                self.archetypes[archetype.index()].remove_entity(handle);
                self.entities.release(handle);
                Ok(true)
            }
        }
    }

    // -- composition changes ------------------------------------------------

    /// Add a default-valued fragment or chunk fragment to an entity, moving
    /// it to the matching archetype.
    ///
    /// # Panics
    ///
    /// Panics if the entity is not active, the type is not a fragment or
    /// chunk fragment, or the entity already has it.
    pub fn add_fragment_to_entity(&mut self, handle: EntityHandle, type_id: FragmentTypeId) {
        if self.is_processing() {
            self.commands.add_fragment(handle, type_id);
        } else {
            contract(self.try_add_fragment(handle, type_id, None));
        }
    }

    /// Add fragment `T` with an initial value. For a chunk fragment the value
    /// replaces the destination chunk's value.
    ///
    /// # Panics
    ///
    /// As [`add_fragment_to_entity`](Self::add_fragment_to_entity), and if
    /// `T` is not registered.
    pub fn add_fragment_value<T: Send + Sync + 'static>(&mut self, handle: EntityHandle, value: T) {
        let Some(type_id) = self.registry.lookup::<T>() else {
            panic!("{}", self.unknown_type(std::any::type_name::<T>()));
        };
        let value = FragmentBuf::from_value(value);
        if self.is_processing() {
            self.commands.add_fragment_buf(handle, type_id, Some(value));
        } else {
            contract(self.try_add_fragment(handle, type_id, Some(value)));
        }
    }

    /// # Panics
    ///
    /// Panics if the entity is not active or lacks the fragment.
    pub fn remove_fragment_from_entity(&mut self, handle: EntityHandle, type_id: FragmentTypeId) {
        if self.is_processing() {
            self.commands.remove_fragment(handle, type_id);
        } else {
            contract(self.try_remove_fragment(handle, type_id));
        }
    }

    pub fn add_tag_to_entity(&mut self, handle: EntityHandle, type_id: FragmentTypeId) {
        if self.is_processing() {
            self.commands.add_tag(handle, type_id);
        } else {
            contract(self.try_add_tag(handle, type_id));
        }
    }

    pub fn remove_tag_from_entity(&mut self, handle: EntityHandle, type_id: FragmentTypeId) {
        if self.is_processing() {
            self.commands.remove_tag(handle, type_id);
        } else {
            contract(self.try_remove_tag(handle, type_id));
        }
    }

    /// Move an entity to `destination`, keeping the values of fragments both
    /// archetypes have.
    ///
    /// # Panics
    ///
    /// Panics if the entity is not active or `destination` does not belong
    /// to this manager.
    pub fn move_entity_to_another_archetype(&mut self, handle: EntityHandle, destination: ArchetypeId) {
        self.expect_archetype(destination);
        if self.is_processing() {
            self.commands.move_to_archetype(handle, destination);
        } else {
            contract(self.try_move_entity(handle, destination));
        }
    }

    pub(crate) fn try_add_fragment(
        &mut self,
        handle: EntityHandle,
        type_id: FragmentTypeId,
        value: Option<FragmentBuf>,
    ) -> Result<(), EcsError> {
        let source = self.check_active(handle)?;
        let kind = self.data_kind(type_id)?;
        if let Some(value) = &value {
            let info = self.registry.info_checked(type_id);
            if value.rust_type() != info.type_id {
                return Err(EcsError::FragmentValueMismatch {
                    name: info.name.clone(),
                });
            }
        }
        let destination = self.change_composition(handle, source, kind, type_id, true)?;
        if let Some(value) = value {
            let archetype = &mut self.archetypes[destination.index()];
            match kind {
                FragmentKind::ChunkFragment => {
                    if let Some(buf) = archetype.chunk_fragment_buf_for(handle, type_id) {
                        buf.replace_with(value);
                    }
                }
                _ => archetype.replace_fragment_value(handle, type_id, value),
            }
        }
        Ok(())
    }

    pub(crate) fn try_remove_fragment(&mut self, handle: EntityHandle, type_id: FragmentTypeId) -> Result<(), EcsError> {
        let source = self.check_active(handle)?;
        let kind = self.data_kind(type_id)?;
        self.change_composition(handle, source, kind, type_id, false)?;
        Ok(())
    }

    pub(crate) fn try_add_tag(&mut self, handle: EntityHandle, type_id: FragmentTypeId) -> Result<(), EcsError> {
        let source = self.check_active(handle)?;
        self.expect_kind(type_id, FragmentKind::Tag)?;
        self.change_composition(handle, source, FragmentKind::Tag, type_id, true)?;
        Ok(())
    }

    pub(crate) fn try_remove_tag(&mut self, handle: EntityHandle, type_id: FragmentTypeId) -> Result<(), EcsError> {
        let source = self.check_active(handle)?;
        self.expect_kind(type_id, FragmentKind::Tag)?;
        self.change_composition(handle, source, FragmentKind::Tag, type_id, false)?;
        Ok(())
    }

    pub(crate) fn try_move_entity(&mut self, handle: EntityHandle, destination: ArchetypeId) -> Result<(), EcsError> {
        let source = self.check_active(handle)?;
        self.check_archetype(destination)?;
        self.relocate(handle, source, destination);
        Ok(())
    }

    fn unknown_type(&self, name: &str) -> EcsError {
        EcsError::UnknownFragmentType {
            name: name.to_owned(),
            registered: self.registry.registered_names().join(", "),
        }
    }

    /// The kind of `type_id`, which must be stored per entity or per chunk.
    fn data_kind(&self, type_id: FragmentTypeId) -> Result<FragmentKind, EcsError> {
        let info = self
            .registry
            .get_info(type_id)
            .ok_or_else(|| self.unknown_type(&format!("{type_id:?}")))?;
        match info.kind {
            FragmentKind::Fragment | FragmentKind::ChunkFragment => Ok(info.kind),
            actual => Err(EcsError::FragmentKindMismatch {
                name: info.name.clone(),
                expected: FragmentKind::Fragment,
                actual,
            }),
        }
    }

    fn expect_kind(&self, type_id: FragmentTypeId, expected: FragmentKind) -> Result<(), EcsError> {
        let info = self
            .registry
            .get_info(type_id)
            .ok_or_else(|| self.unknown_type(&format!("{type_id:?}")))?;
        if info.kind != expected {
            return Err(EcsError::FragmentKindMismatch {
                name: info.name.clone(),
                expected,
                actual: info.kind,
            });
        }
        Ok(())
    }

    /// Move `handle` to the archetype with `type_id` added or removed.
    fn change_composition(
        &mut self,
        handle: EntityHandle,
        source: ArchetypeId,
        kind: FragmentKind,
        type_id: FragmentTypeId,
        add: bool,
    ) -> Result<ArchetypeId, EcsError> {
        let archetype = &self.archetypes[source.index()];
        let present = archetype.composition().contains(kind, type_id);
        let name = || self.registry.info_checked(type_id).name.clone();
        if add && present {
            return Err(EcsError::FragmentAlreadyPresent { entity: handle, name: name() });
        }
        if !add && !present {
            return Err(EcsError::FragmentNotPresent { entity: handle, name: name() });
        }
        let composition = if add {
            archetype.composition().with(kind, type_id)
        } else {
            archetype.composition().without(kind, type_id)
        };
        let shared = archetype.shared_values().clone();
        let destination = self.create_archetype(composition, shared);
        self.relocate(handle, source, destination);
        Ok(destination)
    }

    fn relocate(&mut self, handle: EntityHandle, source: ArchetypeId, destination: ArchetypeId) {
        if source == destination {
            return;
        }
        let (from, to) = self.archetype_pair(source, destination);
        from.move_entity_to(handle, to);
        self.entities.set_archetype(handle, Some(destination));
    }

    // -- data access --------------------------------------------------------

    /// Address of `handle`'s value of fragment `type_id`.
    pub fn fragment_data_ptr(&self, handle: EntityHandle, type_id: FragmentTypeId) -> Option<NonNull<u8>> {
        let archetype = self.entities.archetype_of(handle)?;
        NonNull::new(self.archetypes[archetype.index()].fragment_ptr_for(handle, type_id)?)
    }

    pub fn get_fragment_data<T: 'static>(&self, handle: EntityHandle) -> Option<&T> {
        let type_id = self.registry.lookup::<T>()?;
        let ptr = self.fragment_data_ptr(handle, type_id)?;
        Some(unsafe { &*(ptr.as_ptr() as *const T) })
    }

    pub fn get_fragment_data_mut<T: 'static>(&mut self, handle: EntityHandle) -> Option<&mut T> {
        let type_id = self.registry.lookup::<T>()?;
        let ptr = self.fragment_data_ptr(handle, type_id)?;
        Some(unsafe { &mut *(ptr.as_ptr() as *mut T) })
    }

    /// Like [`get_fragment_data`](Self::get_fragment_data), reporting why the
    /// value is unavailable.
    pub fn try_get_fragment<T: 'static>(&self, handle: EntityHandle) -> Result<&T, EcsError> {
        let type_name = std::any::type_name::<T>();
        let type_id = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| self.unknown_type(type_name))?;
        self.check_active(handle)?;
        self.get_fragment_data::<T>(handle).ok_or_else(|| EcsError::FragmentNotPresent {
            entity: handle,
            name: self.registry.info_checked(type_id).name.clone(),
        })
    }

    /// The value of chunk fragment `T` for the chunk holding `handle`.
    pub fn get_chunk_fragment<T: 'static>(&self, handle: EntityHandle) -> Option<&T> {
        let type_id = self.registry.lookup::<T>()?;
        let archetype = self.entities.archetype_of(handle)?;
        let ptr = self.archetypes[archetype.index()].chunk_fragment_ptr_for(handle, type_id)?;
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn get_chunk_fragment_mut<T: 'static>(&mut self, handle: EntityHandle) -> Option<&mut T> {
        let type_id = self.registry.lookup::<T>()?;
        let archetype = self.entities.archetype_of(handle)?;
        let ptr = self.archetypes[archetype.index()].chunk_fragment_ptr_for(handle, type_id)?;
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    /// The value of shared fragment `T` for `handle`'s archetype.
    pub fn get_shared_fragment<T: 'static>(&self, handle: EntityHandle) -> Option<&T> {
        let archetype = self.entities.archetype_of(handle)?;
        self.archetypes[archetype.index()]
            .shared_values()
            .get::<T>(&self.registry)
    }

    /// Group active handles by archetype into chunk collections, ordered by
    /// archetype id. Invalid and reserved handles are skipped.
    pub fn chunk_collections_for_entities(&self, handles: &[EntityHandle]) -> Vec<ArchetypeChunkCollection> {
        let mut slots: BTreeMap<ArchetypeId, Vec<(usize, usize)>> = BTreeMap::new();
        for &handle in handles {
            let Some(archetype) = self.entities.archetype_of(handle) else {
                continue;
            };
            if let Some(slot) = self.archetypes[archetype.index()].slot_of(handle) {
                slots.entry(archetype).or_default().push(slot);
            }
        }
        slots
            .into_iter()
            .map(|(archetype, slots)| ArchetypeChunkCollection::from_slots(archetype, slots))
            .collect()
    }

    // -- observers ----------------------------------------------------------

    /// Call `callback` with the affected handles whenever `event` happens.
    pub fn observe<F>(&mut self, event: EntityEvent, callback: F)
    where
        F: FnMut(&[EntityHandle]) + Send + 'static,
    {
        self.observers.push((event, Box::new(callback)));
    }

    fn notify(&mut self, event: EntityEvent, handles: &[EntityHandle]) {
        if handles.is_empty() {
            return;
        }
        for (subscribed, callback) in &mut self.observers {
            if *subscribed == event {
                callback(handles);
            }
        }
    }

    // -- deferred commands --------------------------------------------------

    /// Open a processing scope. Structural changes made through the guard
    /// (or by queries running inside it) are deferred until the outermost
    /// scope is dropped, which flushes them.
    pub fn processing_scope(&mut self) -> ProcessingScope<'_> {
        self.processing_depth += 1;
        ProcessingScope { manager: self }
    }

    pub fn is_processing(&self) -> bool {
        self.processing_depth > 0
    }

    /// The pending command buffer.
    pub fn defer(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Apply every pending command.
    ///
    /// # Panics
    ///
    /// Panics inside a processing scope.
    pub fn flush_commands(&mut self) -> ApplyReport {
        assert!(
            !self.is_processing(),
            "cannot flush commands inside a processing scope"
        );
        let mut buffer = std::mem::take(&mut self.commands);
        if !buffer.is_empty() {
            buffer.apply(self);
        }
        self.last_apply_report = *buffer.last_apply_report();
        self.last_apply_report
    }

    /// Report of the most recent flush.
    pub fn last_apply_report(&self) -> &ApplyReport {
        &self.last_apply_report
    }

    // -- maintenance --------------------------------------------------------

    /// Compact archetypes until done or `budget` is spent, resuming where the
    /// previous pass stopped.
    ///
    /// # Panics
    ///
    /// Panics inside a processing scope.
    pub fn compact_entities(&mut self, budget: Duration) -> CompactionReport {
        assert!(!self.is_processing(), "cannot compact inside a processing scope");
        let deadline = Instant::now() + budget;
        let mut report = CompactionReport::default();
        let count = self.archetypes.len();
        for step in 0..count {
            let index = (self.compaction_cursor + step) % count;
            let pass = self.archetypes[index].compact_entities(deadline);
            report.merge(pass);
            if !pass.completed {
                self.compaction_cursor = index;
                debug!(
                    moved = report.entities_moved,
                    released = report.chunks_released,
                    resume_at = index,
                    "compaction budget exhausted"
                );
                return report;
            }
        }
        report.completed = true;
        report
    }
}

// ---------------------------------------------------------------------------
// EntityCreationContext
// ---------------------------------------------------------------------------

/// Returned by [`EntityManager::batch_create_entities`]. Observers see the
/// batch when this is dropped.
pub struct EntityCreationContext<'a> {
    manager: &'a mut EntityManager,
    entities: Vec<EntityHandle>,
    notify: bool,
}

impl EntityCreationContext<'_> {
    pub fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }
}

impl Deref for EntityCreationContext<'_> {
    type Target = EntityManager;

    fn deref(&self) -> &EntityManager {
        self.manager
    }
}

impl Drop for EntityCreationContext<'_> {
    fn drop(&mut self) {
        if self.notify {
            let entities = std::mem::take(&mut self.entities);
            self.manager.notify(EntityEvent::Created, &entities);
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessingScope
// ---------------------------------------------------------------------------

/// Guard returned by [`EntityManager::processing_scope`].
pub struct ProcessingScope<'a> {
    manager: &'a mut EntityManager,
}

impl Deref for ProcessingScope<'_> {
    type Target = EntityManager;

    fn deref(&self) -> &EntityManager {
        self.manager
    }
}

impl DerefMut for ProcessingScope<'_> {
    fn deref_mut(&mut self) -> &mut EntityManager {
        self.manager
    }
}

impl Drop for ProcessingScope<'_> {
    fn drop(&mut self) {
        self.manager.processing_depth -= 1;
        if self.manager.processing_depth == 0 && !std::thread::panicking() {
            self.manager.flush_commands();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
