//! Entity queries.
//!
//! An [`EntityQuery`] is a declarative list of requirements: for each
//! registered type, how the callback accesses it ([`AccessMode`]) and how its
//! presence filters archetypes ([`Presence`]). Matching archetypes are cached
//! and revalidated against the manager's archetype version, so matching costs
//! O(archetypes) only when an archetype has been created since the last run.
//!
//! ```ignore
//! let mut query = EntityQuery::new();
//! query
//!     .add_requirement::<Position>(manager.registry(), AccessMode::ReadWrite, Presence::All)
//!     .add_requirement::<Velocity>(manager.registry(), AccessMode::ReadOnly, Presence::All)
//!     .add_tag_requirement::<Frozen>(manager.registry(), Presence::None);
//!
//! let mut ctx = ExecutionContext::new();
//! query.parallel_for_each_entity_chunk(&mut manager, &mut ctx, |ctx| {
//!     let velocities = ctx.fragment_view::<Velocity>();
//!     for (p, v) in ctx.fragment_view_mut::<Position>().iter_mut().zip(velocities) {
//!         p.x += v.dx;
//!     }
//! });
//! ```

use std::any::{type_name, TypeId};
use std::fmt;

use rayon::prelude::*;
use tracing::error;

use crate::archetype::{Archetype, ArchetypeId};
use crate::bitset::FragmentBitSet;
use crate::collection::{ArchetypeChunkCollection, ChunkRange};
use crate::command::CommandBuffer;
use crate::execution::{ChunkBinding, ExecutionContext};
use crate::fragment::{FragmentKind, FragmentRegistry, FragmentTypeId};
use crate::manager::{EntityManager, ManagerId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

/// How a callback accesses a required type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// How a required type filters archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    /// The archetype must have the type.
    All,
    /// The archetype must have at least one of the `Any` types.
    Any,
    /// The archetype must not have the type.
    None,
    /// The type is bound when present and ignored otherwise.
    Optional,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Requirement {
    pub type_id: FragmentTypeId,
    pub rust_type: TypeId,
    pub access: AccessMode,
    pub presence: Presence,
}

/// Requirements that bind data, per storage kind. Tags only filter.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequirementSet {
    pub fragments: Vec<Requirement>,
    pub chunk_fragments: Vec<Requirement>,
    pub shared: Vec<Requirement>,
}

impl RequirementSet {
    fn sort(&mut self) {
        self.fragments.sort_by_key(|r| r.type_id);
        self.chunk_fragments.sort_by_key(|r| r.type_id);
        self.shared.sort_by_key(|r| r.type_id);
    }

    fn contains(&self, type_id: FragmentTypeId) -> bool {
        self.fragments
            .iter()
            .chain(&self.chunk_fragments)
            .chain(&self.shared)
            .any(|r| r.type_id == type_id)
    }
}

/// For one archetype: where each requirement lives. `None` for absent or
/// excluded types.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequirementMapping {
    /// Index into the archetype's fragment columns.
    pub fragments: Vec<Option<usize>>,
    pub chunk_fragments: Vec<Option<FragmentTypeId>>,
}

/// Predicate over a bound execution context, used to skip archetypes or
/// chunks.
pub type ConditionFn = dyn Fn(&ExecutionContext) -> bool + Send + Sync;

#[derive(Debug, Clone, Default)]
struct PresenceMasks {
    all: FragmentBitSet,
    any: FragmentBitSet,
    none: FragmentBitSet,
    optional: FragmentBitSet,
}

impl PresenceMasks {
    fn insert(&mut self, presence: Presence, type_id: FragmentTypeId) {
        let mask = match presence {
            Presence::All => &mut self.all,
            Presence::Any => &mut self.any,
            Presence::None => &mut self.none,
            Presence::Optional => &mut self.optional,
        };
        mask.insert(type_id);
    }

    fn matches(&self, set: &FragmentBitSet) -> bool {
        set.has_all(&self.all) && (self.any.is_empty() || set.has_any(&self.any)) && set.has_none(&self.none)
    }

    fn has_positive(&self) -> bool {
        !self.all.is_empty() || !self.any.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty() && self.none.is_empty() && self.optional.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EntityQuery
// ---------------------------------------------------------------------------

enum Selection {
    Cached,
    Collection(ArchetypeChunkCollection, RequirementMapping),
}

/// The bindings of one chunk, handed to a single parallel task.
struct ChunkJob {
    archetype: ArchetypeId,
    chunk_index: usize,
    ctx: ExecutionContext,
    bindings: Vec<ChunkBinding>,
}

/// A cached selection of archetypes plus the requirements to bind in them.
///
/// A query is not meant to be shared between threads: iteration takes
/// `&mut self` because it may rebuild the cache.
#[derive(Default)]
pub struct EntityQuery {
    requirements: RequirementSet,
    fragment_masks: PresenceMasks,
    tag_masks: PresenceMasks,
    chunk_masks: PresenceMasks,
    shared_masks: PresenceMasks,
    sorted: bool,
    cached: Vec<(ArchetypeId, RequirementMapping)>,
    cache_stamp: Option<(ManagerId, u64)>,
    /// Archetypes of the stamped manager already tested.
    scanned: usize,
    archetype_condition: Option<Box<ConditionFn>>,
    chunk_condition: Option<Box<ConditionFn>>,
}

impl fmt::Debug for EntityQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityQuery")
            .field("requirements", &self.requirements)
            .field("tags", &self.tag_masks)
            .field("cached_archetypes", &self.cached.len())
            .field("cache_stamp", &self.cache_stamp)
            .field("archetype_condition", &self.archetype_condition.is_some())
            .field("chunk_condition", &self.chunk_condition.is_some())
            .finish()
    }
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    // -- requirements -------------------------------------------------------

    /// Require `T`, which may be a fragment, chunk fragment, tag or shared
    /// fragment. Access is ignored for tags.
    ///
    /// # Panics
    ///
    /// Panics if `T` is unregistered or already required, if a tag is
    /// `Optional`, or if a shared fragment is `Any` or `ReadWrite`.
    pub fn add_requirement<T: 'static>(
        &mut self,
        registry: &FragmentRegistry,
        access: AccessMode,
        presence: Presence,
    ) -> &mut Self {
        let Some(type_id) = registry.lookup::<T>() else {
            panic!(
                "{} is not registered. Registered types: [{}]",
                type_name::<T>(),
                registry.registered_names().join(", ")
            );
        };
        let kind = registry.info_checked(type_id).kind;
        let duplicate = match kind {
            FragmentKind::Tag => {
                let masks = &self.tag_masks;
                [&masks.all, &masks.any, &masks.none].iter().any(|m| m.contains(type_id))
            }
            _ => self.requirements.contains(type_id),
        };
        assert!(!duplicate, "{} is already a requirement of this query", type_name::<T>());

        let requirement = Requirement {
            type_id,
            rust_type: TypeId::of::<T>(),
            access,
            presence,
        };
        match kind {
            FragmentKind::Fragment => {
                self.requirements.fragments.push(requirement);
                self.fragment_masks.insert(presence, type_id);
            }
            FragmentKind::ChunkFragment => {
                self.requirements.chunk_fragments.push(requirement);
                self.chunk_masks.insert(presence, type_id);
            }
            FragmentKind::Tag => {
                assert!(
                    presence != Presence::Optional,
                    "tag {} cannot be an optional requirement",
                    type_name::<T>()
                );
                self.tag_masks.insert(presence, type_id);
            }
            FragmentKind::SharedFragment => {
                assert!(
                    presence != Presence::Any,
                    "shared fragment {} cannot be an `Any` requirement",
                    type_name::<T>()
                );
                assert!(
                    access == AccessMode::ReadOnly,
                    "shared fragment {} is read-only",
                    type_name::<T>()
                );
                self.requirements.shared.push(requirement);
                self.shared_masks.insert(presence, type_id);
            }
        }
        self.invalidate();
        self
    }

    /// Shorthand for a tag requirement.
    pub fn add_tag_requirement<T: 'static>(&mut self, registry: &FragmentRegistry, presence: Presence) -> &mut Self {
        self.add_requirement::<T>(registry, AccessMode::ReadOnly, presence)
    }

    /// Shorthand for a read-only shared fragment requirement.
    pub fn add_shared_requirement<T: 'static>(&mut self, registry: &FragmentRegistry, presence: Presence) -> &mut Self {
        self.add_requirement::<T>(registry, AccessMode::ReadOnly, presence)
    }

    /// Skip archetypes for which `condition` is false. Evaluated once per
    /// archetype with shared fragments bound.
    pub fn set_archetype_condition<F>(&mut self, condition: F) -> &mut Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.archetype_condition = Some(Box::new(condition));
        self
    }

    /// Skip chunks for which `condition` is false. Evaluated per chunk with
    /// chunk fragments bound.
    pub fn set_chunk_condition<F>(&mut self, condition: F) -> &mut Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.chunk_condition = Some(Box::new(condition));
        self
    }

    pub fn clear_conditions(&mut self) {
        self.archetype_condition = None;
        self.chunk_condition = None;
    }

    fn invalidate(&mut self) {
        self.sorted = false;
        self.cached.clear();
        self.cache_stamp = None;
        self.scanned = 0;
    }

    /// A query with no requirements at all cannot select anything.
    pub fn check_validity(&self) -> Result<(), EcsError> {
        let empty = self.fragment_masks.is_empty()
            && self.tag_masks.is_empty()
            && self.chunk_masks.is_empty()
            && self.shared_masks.is_empty();
        if empty {
            return Err(EcsError::InvalidQuery {
                reason: "query has no requirements".to_owned(),
            });
        }
        Ok(())
    }

    // -- matching -----------------------------------------------------------

    pub fn does_archetype_match_requirements(&self, archetype: &Archetype) -> bool {
        let composition = archetype.composition();
        let shared = &composition.shared_fragments;
        let basic = self.fragment_masks.matches(&composition.fragments)
            && self.tag_masks.matches(&composition.tags)
            && self.chunk_masks.matches(&composition.chunk_fragments)
            && shared.has_all(&self.shared_masks.all)
            && shared.has_none(&self.shared_masks.none);
        if !basic {
            return false;
        }

        let positive = self.fragment_masks.has_positive()
            || self.tag_masks.has_positive()
            || self.chunk_masks.has_positive()
            || !self.shared_masks.all.is_empty();
        let optional = &self.fragment_masks.optional;
        let chunk_optional = &self.chunk_masks.optional;
        if !positive && !(optional.is_empty() && chunk_optional.is_empty()) {
            return composition.fragments.has_any(optional) || composition.chunk_fragments.has_any(chunk_optional);
        }
        true
    }

    /// Bring the archetype cache up to date with `manager`.
    ///
    /// Archetypes are never removed, so when only the version moved the scan
    /// resumes after the last archetype already tested.
    pub fn cache_archetypes(&mut self, manager: &EntityManager) {
        if !self.sorted {
            self.requirements.sort();
            self.sorted = true;
        }
        let stamp = (manager.id(), manager.archetype_version());
        if self.cache_stamp == Some(stamp) {
            return;
        }
        if self.cache_stamp.map(|(id, _)| id) != Some(manager.id()) {
            self.cached.clear();
            self.scanned = 0;
        }
        let archetypes = manager.archetypes();
        for archetype in &archetypes[self.scanned.min(archetypes.len())..] {
            if self.does_archetype_match_requirements(archetype) {
                self.cached
                    .push((archetype.id(), archetype.build_mapping(&self.requirements)));
            }
        }
        self.scanned = archetypes.len();
        self.cache_stamp = Some(stamp);
    }

    /// Ids of every matching archetype, in creation order.
    pub fn matching_archetypes(&mut self, manager: &EntityManager) -> Vec<ArchetypeId> {
        self.cache_archetypes(manager);
        self.cached.iter().map(|(id, _)| *id).collect()
    }

    /// Entities in matching archetypes. Conditions are not evaluated.
    pub fn num_matching_entities(&mut self, manager: &EntityManager) -> usize {
        if self.check_validity().is_err() {
            return 0;
        }
        self.cache_archetypes(manager);
        self.cached
            .iter()
            .map(|(id, _)| manager.archetypes()[id.index()].num_entities())
            .sum()
    }

    fn select(&mut self, manager: &EntityManager, ctx: &ExecutionContext) -> Option<Selection> {
        if let Err(e) = self.check_validity() {
            error!(error = %e, "query skipped");
            return None;
        }
        self.cache_archetypes(manager);
        let Some(collection) = ctx.chunk_collection() else {
            return Some(Selection::Cached);
        };
        let wanted = collection.archetype();
        match self.cached.iter().find(|(id, _)| *id == wanted) {
            Some((_, mapping)) => Some(Selection::Collection(collection.clone(), mapping.clone())),
            None => {
                let e = EcsError::ArchetypeMismatch { archetype: wanted };
                error!(error = %e, "chunk collection skipped");
                None
            }
        }
    }

    fn targets<'a>(
        &'a self,
        selection: &'a Selection,
    ) -> Vec<(ArchetypeId, &'a RequirementMapping, Option<&'a [ChunkRange]>)> {
        match selection {
            Selection::Cached => self.cached.iter().map(|(id, m)| (*id, m, None)).collect(),
            Selection::Collection(collection, mapping) => {
                vec![(collection.archetype(), mapping, Some(collection.ranges()))]
            }
        }
    }

    // -- iteration ----------------------------------------------------------

    /// Call `callback` once per matching chunk, with `ctx` bound to it.
    ///
    /// If `ctx` carries a chunk collection, only those ranges are visited.
    /// Runs inside a processing scope: structural changes requested through
    /// the manager or [`ExecutionContext::defer`] apply once iteration ends.
    /// Returns the number of chunks visited.
    pub fn for_each_entity_chunk<F>(
        &mut self,
        manager: &mut EntityManager,
        ctx: &mut ExecutionContext,
        mut callback: F,
    ) -> usize
    where
        F: FnMut(&ExecutionContext),
    {
        let mut scope = manager.processing_scope();
        let Some(selection) = self.select(&scope, ctx) else {
            return 0;
        };
        let mut visited = 0;
        for (id, mapping, ranges) in self.targets(&selection) {
            let archetype = &scope.archetypes()[id.index()];
            if archetype.num_entities() == 0 {
                continue;
            }
            visited += archetype.execute_function(
                ctx,
                &mut callback,
                &self.requirements,
                mapping,
                ranges,
                self.archetype_condition.as_deref(),
                self.chunk_condition.as_deref(),
            );
            ctx.clear_views();
        }
        let mut commands = ctx.take_commands();
        scope.defer().append(&mut commands);
        visited
    }

    /// Like [`for_each_entity_chunk`](Self::for_each_entity_chunk), with one
    /// rayon task per chunk. Each task gets its own forked context; commands
    /// they defer are merged in chunk order.
    ///
    /// Runs serially when the manager's configuration disables parallel
    /// execution.
    pub fn parallel_for_each_entity_chunk<F>(
        &mut self,
        manager: &mut EntityManager,
        ctx: &mut ExecutionContext,
        callback: F,
    ) -> usize
    where
        F: Fn(&ExecutionContext) + Send + Sync,
    {
        if !manager.config().parallel_execution {
            return self.for_each_entity_chunk(manager, ctx, &callback);
        }
        let mut scope = manager.processing_scope();
        let Some(selection) = self.select(&scope, ctx) else {
            return 0;
        };

        let mut jobs: Vec<ChunkJob> = Vec::new();
        for (id, mapping, ranges) in self.targets(&selection) {
            let archetype = &scope.archetypes()[id.index()];
            if archetype.num_entities() == 0 {
                continue;
            }
            archetype.prepare_context(ctx, &self.requirements);
            if self.archetype_condition.as_deref().is_some_and(|cond| !cond(&*ctx)) {
                ctx.clear_views();
                continue;
            }
            for binding in archetype.chunk_bindings(mapping, ranges) {
                let same_chunk = jobs
                    .last()
                    .is_some_and(|job| job.archetype == id && job.chunk_index == binding.chunk_index);
                if same_chunk {
                    if let Some(job) = jobs.last_mut() {
                        job.bindings.push(binding);
                    }
                } else {
                    jobs.push(ChunkJob {
                        archetype: id,
                        chunk_index: binding.chunk_index,
                        ctx: ctx.fork(),
                        bindings: vec![binding],
                    });
                }
            }
            ctx.clear_views();
        }

        let chunk_condition = self.chunk_condition.as_deref();
        let callback = &callback;
        let results: Vec<(usize, CommandBuffer)> = jobs
            .into_par_iter()
            .map(|mut job| {
                let mut visited = 0;
                for binding in &job.bindings {
                    job.ctx.bind_chunk(binding);
                    if chunk_condition.is_some_and(|cond| !cond(&job.ctx)) {
                        continue;
                    }
                    callback(&job.ctx);
                    visited += 1;
                }
                (visited, job.ctx.take_commands())
            })
            .collect();

        let mut visited = 0;
        let mut commands = ctx.take_commands();
        for (count, mut task_commands) in results {
            visited += count;
            commands.append(&mut task_commands);
        }
        scope.defer().append(&mut commands);
        visited
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{ArchetypeComposition, SharedFragmentValues};
    use crate::config::EntityManagerConfig;
    use crate::entity::EntityHandle;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct A(u32);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct B(u32);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct C(u32);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Budget(u32);

    #[derive(Debug, Clone, PartialEq, Hash)]
    struct Team(u8);

    struct Frozen;

    struct Setup {
        manager: EntityManager,
        a: FragmentTypeId,
        b: FragmentTypeId,
        c: FragmentTypeId,
        budget: FragmentTypeId,
        team: FragmentTypeId,
        frozen: FragmentTypeId,
    }

    fn setup_with(config: EntityManagerConfig) -> Setup {
        let mut manager = EntityManager::with_config(config).unwrap();
        let a = manager.register_fragment::<A>("a");
        let b = manager.register_fragment::<B>("b");
        let c = manager.register_fragment::<C>("c");
        let budget = manager.register_chunk_fragment::<Budget>("budget");
        let team = manager.register_shared_fragment::<Team>("team");
        let frozen = manager.register_tag::<Frozen>("frozen");
        Setup {
            manager,
            a,
            b,
            c,
            budget,
            team,
            frozen,
        }
    }

    fn setup() -> Setup {
        setup_with(EntityManagerConfig::default())
    }

    fn spawn(manager: &mut EntityManager, types: &[FragmentTypeId], count: usize) -> Vec<EntityHandle> {
        let archetype = manager.create_archetype_from_types(types);
        manager.batch_create_entities(archetype, count).entities().to_vec()
    }

    fn query(s: &Setup, build: impl FnOnce(&mut EntityQuery, &FragmentRegistry)) -> EntityQuery {
        let mut q = EntityQuery::new();
        build(&mut q, s.manager.registry());
        q
    }

    #[test]
    fn all_any_none_matching() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 1);
        spawn(&mut s.manager, &[s.a, s.b], 2);
        spawn(&mut s.manager, &[s.b, s.c], 4);
        spawn(&mut s.manager, &[s.c], 8);

        let mut all_a = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        assert_eq!(all_a.num_matching_entities(&s.manager), 3);

        let mut any_bc = query(&s, |q, r| {
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::Any);
            q.add_requirement::<C>(r, AccessMode::ReadOnly, Presence::Any);
        });
        assert_eq!(any_bc.num_matching_entities(&s.manager), 14);

        let mut b_not_c = query(&s, |q, r| {
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::All);
            q.add_requirement::<C>(r, AccessMode::ReadOnly, Presence::None);
        });
        assert_eq!(b_not_c.num_matching_entities(&s.manager), 2);
    }

    #[test]
    fn optional_only_needs_one_present() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 1);
        spawn(&mut s.manager, &[s.b], 2);
        spawn(&mut s.manager, &[s.c], 4);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::Optional);
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::Optional);
        });
        assert_eq!(q.num_matching_entities(&s.manager), 3);
    }

    #[test]
    fn tags_and_shared_fragments_filter() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 1);
        spawn(&mut s.manager, &[s.a, s.frozen], 2);

        let mut composition = ArchetypeComposition::from_types(s.manager.registry(), &[s.a]);
        composition.shared_fragments.insert(s.team);
        let mut red = SharedFragmentValues::new();
        red.add(s.manager.registry(), Team(1));
        let teamed = s.manager.create_archetype(composition, red);
        drop(s.manager.batch_create_entities(teamed, 4));

        let mut not_frozen = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
            q.add_tag_requirement::<Frozen>(r, Presence::None);
        });
        assert_eq!(not_frozen.num_matching_entities(&s.manager), 5);

        let mut with_team = query(&s, |q, r| {
            q.add_shared_requirement::<Team>(r, Presence::All);
        });
        assert_eq!(with_team.num_matching_entities(&s.manager), 4);

        let mut without_team = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
            q.add_shared_requirement::<Team>(r, Presence::None);
        });
        assert_eq!(without_team.num_matching_entities(&s.manager), 3);
    }

    #[test]
    fn cache_picks_up_new_archetypes() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 3);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        assert_eq!(q.num_matching_entities(&s.manager), 3);
        assert_eq!(q.matching_archetypes(&s.manager).len(), 1);

        spawn(&mut s.manager, &[s.a, s.b], 2);
        assert_eq!(q.num_matching_entities(&s.manager), 5);
        assert_eq!(q.matching_archetypes(&s.manager).len(), 2);

        let mut visited = 0;
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| visited += ctx.num_entities());
        assert_eq!(visited, 5);
    }

    #[test]
    fn cache_rebuilds_for_another_manager() {
        let mut s = setup();
        let mut other = setup();
        spawn(&mut s.manager, &[s.a], 3);
        spawn(&mut other.manager, &[other.a], 7);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        assert_eq!(q.num_matching_entities(&s.manager), 3);
        assert_eq!(q.num_matching_entities(&other.manager), 7);
    }

    #[test]
    fn for_each_mutates_and_binds_entities() {
        let mut s = setup();
        let entities = spawn(&mut s.manager, &[s.a, s.b], 10);
        for (i, &e) in entities.iter().enumerate() {
            *s.manager.get_fragment_data_mut::<B>(e).unwrap() = B(i as u32);
        }
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        let chunks = q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            let b = ctx.fragment_view::<B>();
            let a = ctx.fragment_view_mut::<A>();
            assert_eq!(ctx.entities().len(), a.len());
            for (a, b) in a.iter_mut().zip(b) {
                a.0 = b.0 * 2;
            }
        });
        assert_eq!(chunks, 1);
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(s.manager.get_fragment_data::<A>(e), Some(&A(i as u32 * 2)));
        }
    }

    #[test]
    #[should_panic(expected = "declared read-only")]
    fn read_only_requirement_rejects_mutation() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 1);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            ctx.fragment_view_mut::<A>();
        });
    }

    #[test]
    #[should_panic(expected = "is already viewed")]
    fn shared_view_blocks_later_mutable_view_in_same_chunk() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 1);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            let first = ctx.fragment_view::<A>().len();
            assert_eq!(first, 1);
            ctx.fragment_view_mut::<A>();
        });
    }

    #[test]
    fn borrows_reset_for_each_chunk() {
        let mut s = setup();
        let capacity = {
            let archetype = s.manager.create_archetype_from_types(&[s.a]);
            s.manager.archetype(archetype).unwrap().num_entities_per_chunk()
        };
        spawn(&mut s.manager, &[s.a], capacity + 1);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        let chunks = q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            ctx.fragment_view_mut::<A>();
        });
        assert_eq!(chunks, 2);
    }

    #[test]
    #[should_panic(expected = "already a requirement")]
    fn duplicate_requirement_panics() {
        let s = setup();
        query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
        });
    }

    #[test]
    fn optional_view_is_empty_when_absent() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 2);
        spawn(&mut s.manager, &[s.a, s.b], 3);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::Optional);
        });
        let mut seen = Vec::new();
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            seen.push((ctx.num_entities(), ctx.fragment_view::<B>().len(), ctx.has_fragment::<B>()));
        });
        seen.sort();
        assert_eq!(seen, vec![(2, 0, false), (3, 3, true)]);
    }

    #[test]
    fn destroy_in_callback_is_deferred() {
        let mut s = setup();
        let entities = spawn(&mut s.manager, &[s.a], 6);
        for (i, &e) in entities.iter().enumerate() {
            s.manager.get_fragment_data_mut::<A>(e).unwrap().0 = i as u32;
        }
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            let values = ctx.fragment_view::<A>();
            for (entity, value) in ctx.entities().iter().zip(values) {
                if value.0 % 2 == 0 {
                    ctx.defer().destroy_entity(*entity);
                }
            }
            // Nothing has been removed mid-iteration.
            assert_eq!(ctx.num_entities(), 6);
        });
        assert_eq!(q.num_matching_entities(&s.manager), 3);
        assert_eq!(s.manager.last_apply_report().success_count, 3);
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(s.manager.is_entity_valid(e), i % 2 == 1);
        }
    }

    #[test]
    fn chunk_collection_limits_iteration() {
        let mut s = setup();
        let entities = spawn(&mut s.manager, &[s.a], 8);
        let picked = [entities[1], entities[2], entities[6]];
        let collections = s.manager.chunk_collections_for_entities(&picked);
        assert_eq!(collections.len(), 1);

        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
        });
        let mut ctx = ExecutionContext::with_chunk_collection(collections[0].clone());
        let mut seen = Vec::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            seen.extend_from_slice(ctx.entities());
            for a in ctx.fragment_view_mut::<A>() {
                a.0 = 99;
            }
        });
        seen.sort();
        let mut expected = picked.to_vec();
        expected.sort();
        assert_eq!(seen, expected);
        for &e in &entities {
            let touched = picked.contains(&e);
            assert_eq!(s.manager.get_fragment_data::<A>(e) == Some(&A(99)), touched);
        }
    }

    #[test]
    fn overflowing_and_overlapping_ranges_are_safe() {
        let mut s = setup();
        let archetype = s.manager.create_archetype_from_types(&[s.a]);
        let entities = spawn(&mut s.manager, &[s.a], 4);
        let collection = ArchetypeChunkCollection::from_ranges(
            archetype,
            vec![
                ChunkRange { chunk_index: 0, start: 0, len: 2 },
                ChunkRange { chunk_index: 0, start: 1, len: 2 },
                ChunkRange { chunk_index: 0, start: 3, len: usize::MAX },
            ],
        );
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::with_chunk_collection(collection);
        let mut seen = Vec::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| seen.extend_from_slice(ctx.entities()));
        assert_eq!(seen, entities[..3].to_vec());
    }

    #[test]
    fn mismatched_chunk_collection_is_skipped() {
        let mut s = setup();
        let entities = spawn(&mut s.manager, &[s.b], 2);
        let collections = s.manager.chunk_collections_for_entities(&entities);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::with_chunk_collection(collections[0].clone());
        let visited = q.for_each_entity_chunk(&mut s.manager, &mut ctx, |_| panic!("must not run"));
        assert_eq!(visited, 0);
    }

    #[test]
    fn empty_query_is_invalid_and_inert() {
        let mut s = setup();
        spawn(&mut s.manager, &[s.a], 2);
        let mut q = EntityQuery::new();
        assert!(matches!(q.check_validity(), Err(EcsError::InvalidQuery { .. })));
        let mut ctx = ExecutionContext::new();
        assert_eq!(q.for_each_entity_chunk(&mut s.manager, &mut ctx, |_| panic!("must not run")), 0);
        assert_eq!(q.num_matching_entities(&s.manager), 0);
    }

    #[test]
    fn chunk_condition_reads_chunk_fragment() {
        let config = EntityManagerConfig {
            chunk_memory_size: 256,
            ..Default::default()
        };
        let mut s = setup_with(config);
        let archetype = s.manager.create_archetype_from_types(&[s.a, s.budget]);
        let per_chunk = s.manager.archetype(archetype).unwrap().num_entities_per_chunk();
        let entities = s.manager.batch_create_entities(archetype, per_chunk * 2).entities().to_vec();
        // Give only the second chunk a budget.
        *s.manager.get_chunk_fragment_mut::<Budget>(entities[per_chunk]).unwrap() = Budget(1);

        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
            q.add_requirement::<Budget>(r, AccessMode::ReadOnly, Presence::All);
        });
        q.set_chunk_condition(|ctx| ctx.chunk_fragment::<Budget>().0 > 0);
        let mut ctx = ExecutionContext::new();
        let visited = q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            for a in ctx.fragment_view_mut::<A>() {
                a.0 = 1;
            }
        });
        assert_eq!(visited, 1);
        assert_eq!(s.manager.get_fragment_data::<A>(entities[0]), Some(&A(0)));
        assert_eq!(s.manager.get_fragment_data::<A>(entities[per_chunk]), Some(&A(1)));
    }

    #[test]
    fn archetype_condition_reads_shared_fragment() {
        let mut s = setup();
        for team in [1u8, 2] {
            let mut composition = ArchetypeComposition::from_types(s.manager.registry(), &[s.a]);
            composition.shared_fragments.insert(s.team);
            let mut values = SharedFragmentValues::new();
            values.add(s.manager.registry(), Team(team));
            let archetype = s.manager.create_archetype(composition, values);
            drop(s.manager.batch_create_entities(archetype, 3));
        }
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
            q.add_shared_requirement::<Team>(r, Presence::All);
        });
        q.set_archetype_condition(|ctx| ctx.shared_fragment::<Team>().0 == 2);
        let mut count = 0;
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            assert_eq!(ctx.shared_fragment::<Team>(), &Team(2));
            count += ctx.num_entities();
        });
        assert_eq!(count, 3);

        q.clear_conditions();
        assert_eq!(q.num_matching_entities(&s.manager), 6);
    }

    #[test]
    fn parallel_matches_serial() {
        let config = EntityManagerConfig {
            chunk_memory_size: 512,
            ..Default::default()
        };
        let mut s = setup_with(config);
        let entities = spawn(&mut s.manager, &[s.a, s.b], 500);
        spawn(&mut s.manager, &[s.a], 120);
        for (i, &e) in entities.iter().enumerate() {
            s.manager.get_fragment_data_mut::<B>(e).unwrap().0 = i as u32;
        }
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
            q.add_requirement::<B>(r, AccessMode::ReadOnly, Presence::Optional);
        });
        let mut ctx = ExecutionContext::new();
        let chunks = q.parallel_for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            let b = ctx.fragment_view::<B>();
            let a = ctx.fragment_view_mut::<A>();
            if b.is_empty() {
                a.iter_mut().for_each(|a| a.0 = 7);
            } else {
                a.iter_mut().zip(b).for_each(|(a, b)| a.0 = b.0 + 1);
            }
        });
        let serial_chunks: usize = s
            .manager
            .archetypes()
            .iter()
            .filter(|arch| q.does_archetype_match_requirements(arch))
            .map(|arch| arch.num_chunks())
            .sum();
        assert_eq!(chunks, serial_chunks);
        assert!(chunks > 2);
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(s.manager.get_fragment_data::<A>(e), Some(&A(i as u32 + 1)));
        }
    }

    #[test]
    fn parallel_commands_merge_in_chunk_order() {
        let config = EntityManagerConfig {
            chunk_memory_size: 128,
            ..Default::default()
        };
        let mut s = setup_with(config);
        let entities = spawn(&mut s.manager, &[s.a], 64);
        let c = s.c;
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadOnly, Presence::All);
        });
        let mut ctx = ExecutionContext::new();
        q.parallel_for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            for &e in ctx.entities() {
                ctx.defer().add_fragment_value(e, c, C(e.index()));
            }
        });
        let report = *s.manager.last_apply_report();
        assert_eq!(report.success_count, 64);
        assert_eq!(report.conflict_count, 0);
        for &e in &entities {
            assert_eq!(s.manager.get_fragment_data::<C>(e), Some(&C(e.index())));
        }
    }

    #[test]
    fn parallel_disabled_runs_serially() {
        let config = EntityManagerConfig {
            parallel_execution: false,
            ..Default::default()
        };
        let mut s = setup_with(config);
        spawn(&mut s.manager, &[s.a], 10);
        let mut q = query(&s, |q, r| {
            q.add_requirement::<A>(r, AccessMode::ReadWrite, Presence::All);
        });
        let caller = std::thread::current().id();
        let mut ctx = ExecutionContext::new();
        let visited = q.parallel_for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| {
            assert_eq!(std::thread::current().id(), caller);
            ctx.fragment_view_mut::<A>().iter_mut().for_each(|a| a.0 += 1);
        });
        assert_eq!(visited, 1);
    }
}
