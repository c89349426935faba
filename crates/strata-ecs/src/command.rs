//! Deferred structural mutations.
//!
//! While an [`EntityManager`] is inside a processing scope, structural changes
//! cannot be applied: a query may be iterating the very chunks they would
//! reshape. Instead they are recorded as plain [`Command`]s in a
//! [`CommandBuffer`] and applied in insertion order once the outermost scope
//! closes (or when [`EntityManager::flush_commands`] is called).
//!
//! Application is tolerant. By the time a command is applied its target may
//! have been destroyed by an earlier command; such commands are counted as
//! failures in the [`ApplyReport`], logged, and skipped.
//!
//! # Example
//!
//! ```ignore
//! query.for_each_entity_chunk(&mut manager, &mut ctx, |ctx| {
//!     let health = ctx.fragment_view::<Health>();
//!     for (entity, hp) in ctx.entities().iter().zip(health) {
//!         if hp.0 == 0 {
//!             ctx.defer().destroy_entity(*entity);
//!         }
//!     }
//! });
//! // The scope opened by the query has closed: dead entities are gone.
//! ```

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::archetype::ArchetypeId;
use crate::entity::EntityHandle;
use crate::fragment::FragmentTypeId;
use crate::manager::EntityManager;
use crate::value::{FragmentBuf, FragmentBundle};
use crate::EcsError;

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// What mutation a command performs.
pub enum CommandKind {
    /// Create a new entity in an archetype with default fragment values.
    CreateEntity { archetype: ArchetypeId },
    /// Create a new entity from a bundle.
    CreateEntityWith { bundle: FragmentBundle },
    /// Assign a reserved entity to an archetype.
    BuildEntity { archetype: ArchetypeId },
    /// Build a reserved entity from a bundle.
    BuildEntityWith { bundle: FragmentBundle },
    /// Build reserved entities into one archetype, notifying once for all.
    BuildBatch {
        archetype: ArchetypeId,
        entities: Vec<EntityHandle>,
    },
    /// Build reserved entities as copies of `source`.
    BuildDuplicates {
        source: EntityHandle,
        copies: Vec<EntityHandle>,
    },
    DestroyEntity,
    /// Add a fragment or chunk fragment, optionally with an initial value.
    AddFragment {
        type_id: FragmentTypeId,
        value: Option<FragmentBuf>,
    },
    RemoveFragment { type_id: FragmentTypeId },
    AddTag { type_id: FragmentTypeId },
    RemoveTag { type_id: FragmentTypeId },
    MoveToArchetype { archetype: ArchetypeId },
}

impl CommandKind {
    /// The fragment type the command changes, if any.
    fn fragment_type(&self) -> Option<FragmentTypeId> {
        match self {
            CommandKind::AddFragment { type_id, .. }
            | CommandKind::RemoveFragment { type_id }
            | CommandKind::AddTag { type_id }
            | CommandKind::RemoveTag { type_id } => Some(*type_id),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CommandKind::CreateEntity { .. } => "create_entity",
            CommandKind::CreateEntityWith { .. } => "create_entity_with",
            CommandKind::BuildEntity { .. } => "build_entity",
            CommandKind::BuildEntityWith { .. } => "build_entity_with",
            CommandKind::BuildBatch { .. } => "build_batch",
            CommandKind::BuildDuplicates { .. } => "build_duplicates",
            CommandKind::DestroyEntity => "destroy_entity",
            CommandKind::AddFragment { .. } => "add_fragment",
            CommandKind::RemoveFragment { .. } => "remove_fragment",
            CommandKind::AddTag { .. } => "add_tag",
            CommandKind::RemoveTag { .. } => "remove_tag",
            CommandKind::MoveToArchetype { .. } => "move_to_archetype",
        }
    }
}

impl fmt::Debug for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::CreateEntity { archetype }
            | CommandKind::BuildEntity { archetype }
            | CommandKind::MoveToArchetype { archetype } => {
                write!(f, "{}({archetype:?})", self.name())
            }
            CommandKind::CreateEntityWith { bundle } | CommandKind::BuildEntityWith { bundle } => {
                write!(f, "{}({bundle:?})", self.name())
            }
            CommandKind::BuildBatch { archetype, entities } => {
                write!(f, "{}({archetype:?}, {} entities)", self.name(), entities.len())
            }
            CommandKind::BuildDuplicates { source, copies } => {
                write!(f, "{}({source:?}, {} copies)", self.name(), copies.len())
            }
            CommandKind::DestroyEntity => f.write_str(self.name()),
            other => write!(f, "{}({:?})", other.name(), other.fragment_type()),
        }
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// One deferred mutation.
#[derive(Debug)]
pub struct Command {
    /// The entity the command targets. `None` for commands that create one.
    pub target: Option<EntityHandle>,
    pub kind: CommandKind,
    /// Position in the buffer, assigned on insertion.
    pub command_index: u32,
    /// For create commands: the entity created on application.
    pub spawned_entity: Option<EntityHandle>,
    /// Set by [`CommandBuffer::apply`].
    pub applied_successfully: bool,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one [`CommandBuffer::apply`] call.
///
/// `conflict_count` is the number of (entity, fragment type) pairs targeted by
/// more than one command; they apply in order, so the last one wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub conflict_count: usize,
    pub failed_count: usize,
    pub success_count: usize,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// FIFO queue of deferred structural mutations.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    next_index: u32,
    last_apply_report: ApplyReport,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue creation of an entity with default fragment values.
    pub fn create_entity(&mut self, archetype: ArchetypeId) {
        self.push(None, CommandKind::CreateEntity { archetype });
    }

    /// Queue creation of an entity from `bundle`.
    pub fn create_entity_with(&mut self, bundle: FragmentBundle) {
        self.push(None, CommandKind::CreateEntityWith { bundle });
    }

    /// Queue assignment of a reserved entity to `archetype`.
    pub fn build_entity(&mut self, target: EntityHandle, archetype: ArchetypeId) {
        self.push(Some(target), CommandKind::BuildEntity { archetype });
    }

    pub fn build_entity_with(&mut self, target: EntityHandle, bundle: FragmentBundle) {
        self.push(Some(target), CommandKind::BuildEntityWith { bundle });
    }

    /// Queue assignment of several reserved entities to `archetype`. The
    /// `Created` notification covers the whole batch.
    pub fn build_batch(&mut self, entities: Vec<EntityHandle>, archetype: ArchetypeId) {
        self.push(None, CommandKind::BuildBatch { archetype, entities });
    }

    pub(crate) fn build_duplicates(&mut self, copies: Vec<EntityHandle>, source: EntityHandle) {
        self.push(None, CommandKind::BuildDuplicates { source, copies });
    }

    pub fn destroy_entity(&mut self, target: EntityHandle) {
        self.push(Some(target), CommandKind::DestroyEntity);
    }

    /// Queue adding a default-constructed fragment (or chunk fragment).
    pub fn add_fragment(&mut self, target: EntityHandle, type_id: FragmentTypeId) {
        self.push(Some(target), CommandKind::AddFragment { type_id, value: None });
    }

    /// Queue adding a fragment with an initial value. The value's type is
    /// checked against `type_id` when the command is applied.
    pub fn add_fragment_value<T: Send + Sync + 'static>(
        &mut self,
        target: EntityHandle,
        type_id: FragmentTypeId,
        value: T,
    ) {
        self.push(
            Some(target),
            CommandKind::AddFragment {
                type_id,
                value: Some(FragmentBuf::from_value(value)),
            },
        );
    }

    pub(crate) fn add_fragment_buf(&mut self, target: EntityHandle, type_id: FragmentTypeId, value: Option<FragmentBuf>) {
        self.push(Some(target), CommandKind::AddFragment { type_id, value });
    }

    pub fn remove_fragment(&mut self, target: EntityHandle, type_id: FragmentTypeId) {
        self.push(Some(target), CommandKind::RemoveFragment { type_id });
    }

    pub fn add_tag(&mut self, target: EntityHandle, type_id: FragmentTypeId) {
        self.push(Some(target), CommandKind::AddTag { type_id });
    }

    pub fn remove_tag(&mut self, target: EntityHandle, type_id: FragmentTypeId) {
        self.push(Some(target), CommandKind::RemoveTag { type_id });
    }

    pub fn move_to_archetype(&mut self, target: EntityHandle, archetype: ArchetypeId) {
        self.push(Some(target), CommandKind::MoveToArchetype { archetype });
    }

    /// Queued commands, in application order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Report of the most recent [`apply`](Self::apply).
    pub fn last_apply_report(&self) -> &ApplyReport {
        &self.last_apply_report
    }

    /// Move every command of `other` to the end of this buffer, keeping their
    /// order.
    pub fn append(&mut self, other: &mut CommandBuffer) {
        for mut cmd in other.commands.drain(..) {
            cmd.command_index = self.next_index;
            self.next_index += 1;
            self.commands.push(cmd);
        }
        other.next_index = 0;
    }

    /// Drop all queued commands without applying them.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.next_index = 0;
    }

    /// Apply all commands to `manager` in insertion order and clear the
    /// buffer.
    ///
    /// Returns every command (successful or not) so callers can inspect
    /// [`Command::applied_successfully`] and
    /// [`Command::spawned_entity`].
    pub fn apply(&mut self, manager: &mut EntityManager) -> Vec<Command> {
        let mut commands = std::mem::take(&mut self.commands);
        self.next_index = 0;

        // --- Conflict detection ---
        let mut seen: HashMap<(EntityHandle, FragmentTypeId), Vec<u32>> = HashMap::new();
        for cmd in &commands {
            if let (Some(target), Some(type_id)) = (cmd.target, cmd.kind.fragment_type()) {
                seen.entry((target, type_id)).or_default().push(cmd.command_index);
            }
        }
        let mut conflict_count = 0;
        for ((entity, type_id), indices) in &seen {
            if indices.len() > 1 {
                conflict_count += 1;
                warn!(
                    entity = %entity,
                    fragment = ?type_id,
                    command_indices = ?indices,
                    "conflict: {} commands change the same entity+fragment (last one wins)",
                    indices.len()
                );
            }
        }

        // --- Apply loop ---
        let mut success_count = 0;
        let mut failed_count = 0;
        for cmd in &mut commands {
            match Self::apply_one(manager, cmd) {
                Ok(()) => {
                    cmd.applied_successfully = true;
                    success_count += 1;
                }
                Err(e) => {
                    failed_count += 1;
                    warn!(
                        command_index = cmd.command_index,
                        command = cmd.kind.name(),
                        target = ?cmd.target,
                        error = %e,
                        "deferred command failed"
                    );
                }
            }
        }

        self.last_apply_report = ApplyReport {
            conflict_count,
            failed_count,
            success_count,
        };
        commands
    }

    fn apply_one(manager: &mut EntityManager, cmd: &mut Command) -> Result<(), EcsError> {
        let target = cmd.target;
        let require = || target.ok_or(EcsError::StaleEntity {
            entity: EntityHandle::INVALID,
        });
        match &mut cmd.kind {
            CommandKind::CreateEntity { archetype } => {
                let entity = manager.reserve_entity();
                manager
                    .try_build_entity(entity, *archetype)
                    .inspect_err(|_| manager.release_reserved_entity(entity))?;
                cmd.spawned_entity = Some(entity);
                Ok(())
            }
            CommandKind::CreateEntityWith { bundle } => {
                let entity = manager.reserve_entity();
                manager
                    .try_build_entity_with(entity, std::mem::take(bundle))
                    .inspect_err(|_| manager.release_reserved_entity(entity))?;
                cmd.spawned_entity = Some(entity);
                Ok(())
            }
            CommandKind::BuildEntity { archetype } => manager.try_build_entity(require()?, *archetype),
            CommandKind::BuildEntityWith { bundle } => {
                manager.try_build_entity_with(require()?, std::mem::take(bundle))
            }
            CommandKind::BuildBatch { archetype, entities } => manager.try_build_batch(entities, *archetype),
            CommandKind::BuildDuplicates { source, copies } => manager.try_build_duplicates(copies, *source),
            CommandKind::DestroyEntity => manager.try_destroy_entity(require()?),
            CommandKind::AddFragment { type_id, value } => {
                manager.try_add_fragment(require()?, *type_id, value.take())
            }
            CommandKind::RemoveFragment { type_id } => manager.try_remove_fragment(require()?, *type_id),
            CommandKind::AddTag { type_id } => manager.try_add_tag(require()?, *type_id),
            CommandKind::RemoveTag { type_id } => manager.try_remove_tag(require()?, *type_id),
            CommandKind::MoveToArchetype { archetype } => manager.try_move_entity(require()?, *archetype),
        }
    }

    fn push(&mut self, target: Option<EntityHandle>, kind: CommandKind) {
        let index = self.next_index;
        self.next_index += 1;
        self.commands.push(Command {
            target,
            kind,
            command_index: index,
            spawned_entity: None,
            applied_successfully: false,
        });
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.commands.len())
            .field("last_apply_report", &self.last_apply_report)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::execution::ExecutionContext;
    use crate::query::{AccessMode, EntityQuery, Presence};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Armor(u32);

    struct Stunned;

    struct Setup {
        manager: EntityManager,
        health: FragmentTypeId,
        armor: FragmentTypeId,
        stunned: FragmentTypeId,
        archetype: ArchetypeId,
    }

    fn setup() -> Setup {
        let mut manager = EntityManager::new();
        let health = manager.register_fragment::<Health>("health");
        let armor = manager.register_fragment::<Armor>("armor");
        let stunned = manager.register_tag::<Stunned>("stunned");
        let archetype = manager.create_archetype_from_types(&[health]);
        Setup {
            manager,
            health,
            armor,
            stunned,
            archetype,
        }
    }

    #[test]
    fn commands_apply_in_insertion_order() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let mut cmds = CommandBuffer::new();
        cmds.add_fragment_value(e, s.armor, Armor(3));
        cmds.add_tag(e, s.stunned);
        cmds.remove_fragment(e, s.armor);

        let applied = cmds.apply(&mut s.manager);
        assert_eq!(applied.len(), 3);
        assert!(applied.iter().all(|c| c.applied_successfully));
        assert_eq!(
            applied.iter().map(|c| c.command_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(s.manager.get_fragment_data::<Armor>(e).is_none());
        let arch = s.manager.archetype_for_entity(e).unwrap();
        assert!(s.manager.archetype(arch).unwrap().composition().tags.contains(s.stunned));
        assert!(cmds.is_empty());
    }

    #[test]
    fn stale_target_is_counted_not_fatal() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let mut cmds = CommandBuffer::new();
        cmds.destroy_entity(e);
        cmds.add_fragment(e, s.armor);
        cmds.destroy_entity(e);

        let applied = cmds.apply(&mut s.manager);
        assert!(applied[0].applied_successfully);
        assert!(!applied[1].applied_successfully);
        assert!(!applied[2].applied_successfully);
        let report = cmds.last_apply_report();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failed_count, 2);
        assert!(!s.manager.is_entity_valid(e));
    }

    #[test]
    fn already_present_fragment_fails_softly() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let mut cmds = CommandBuffer::new();
        cmds.add_fragment(e, s.health);
        cmds.apply(&mut s.manager);
        assert_eq!(cmds.last_apply_report().failed_count, 1);
        assert_eq!(s.manager.archetype_for_entity(e), Some(s.archetype));
    }

    #[test]
    fn wrong_value_type_fails_softly() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let mut cmds = CommandBuffer::new();
        cmds.add_fragment_value(e, s.armor, Health(1));
        cmds.apply(&mut s.manager);
        assert_eq!(cmds.last_apply_report().failed_count, 1);
        assert_eq!(s.manager.archetype_for_entity(e), Some(s.archetype));
    }

    #[test]
    fn create_records_spawned_entity() {
        let mut s = setup();
        let mut cmds = CommandBuffer::new();
        cmds.create_entity(s.archetype);
        let applied = cmds.apply(&mut s.manager);
        let spawned = applied[0].spawned_entity.unwrap();
        assert!(s.manager.is_entity_active(spawned));
        assert_eq!(s.manager.get_fragment_data::<Health>(spawned), Some(&Health(0)));
    }

    #[test]
    fn foreign_archetype_fails_softly() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let mut other = EntityManager::new();
        let h = other.register_fragment::<Health>("health");
        let a = other.register_fragment::<Armor>("armor");
        other.create_archetype_from_types(&[h]);
        let foreign = other.create_archetype_from_types(&[h, a]);

        let mut cmds = CommandBuffer::new();
        cmds.create_entity(foreign);
        cmds.move_to_archetype(e, foreign);
        let reserved = s.manager.reserve_entity();
        cmds.build_entity(reserved, foreign);
        let applied = cmds.apply(&mut s.manager);

        assert!(applied.iter().all(|c| !c.applied_successfully));
        assert_eq!(cmds.last_apply_report().failed_count, 3);
        assert_eq!(s.manager.archetype_for_entity(e), Some(s.archetype));
        assert_eq!(s.manager.entity_state(reserved), EntityState::Reserved);
        assert_eq!(s.manager.num_archetypes(), 1);
    }

    #[test]
    fn foreign_archetype_from_callback_does_not_panic_at_flush() {
        let mut s = setup();
        s.manager.create_entity(s.archetype);
        let mut other = EntityManager::new();
        let h = other.register_fragment::<Health>("health");
        let a = other.register_fragment::<Armor>("armor");
        other.create_archetype_from_types(&[h]);
        let foreign = other.create_archetype_from_types(&[h, a]);

        let mut q = EntityQuery::new();
        q.add_requirement::<Health>(s.manager.registry(), AccessMode::ReadOnly, Presence::All);
        let mut ctx = ExecutionContext::new();
        q.for_each_entity_chunk(&mut s.manager, &mut ctx, |ctx| ctx.defer().create_entity(foreign));

        let report = *s.manager.last_apply_report();
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.success_count, 0);
        assert_eq!(s.manager.debug_entity_count(), 1);
    }

    #[test]
    fn unknown_archetype_error_names_the_archetype() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let err = s.manager.try_move_entity(e, ArchetypeId(7)).unwrap_err();
        assert!(matches!(err, EcsError::UnknownArchetype { .. }));
        assert!(err.to_string().contains("does not belong to this entity manager"), "{err}");
    }

    #[test]
    fn conflicts_are_counted() {
        let mut s = setup();
        let e = s.manager.create_entity(s.archetype);
        let other = s.manager.create_entity(s.archetype);
        let mut cmds = CommandBuffer::new();
        cmds.add_fragment_value(e, s.armor, Armor(1));
        cmds.remove_fragment(e, s.armor);
        cmds.add_fragment(other, s.armor);
        cmds.apply(&mut s.manager);
        let report = *cmds.last_apply_report();
        assert_eq!(report.conflict_count, 1);
        assert_eq!(report.success_count, 3);
    }

    #[test]
    fn append_keeps_order_and_reindexes() {
        let s = setup();
        let e = EntityHandle::new(0, 1);
        let mut a = CommandBuffer::new();
        a.destroy_entity(e);
        let mut b = CommandBuffer::new();
        b.add_tag(e, s.stunned);
        b.remove_tag(e, s.stunned);
        a.append(&mut b);
        assert!(b.is_empty());
        let kinds: Vec<_> = a.commands().iter().map(|c| (c.command_index, c.kind.name())).collect();
        assert_eq!(kinds, vec![(0, "destroy_entity"), (1, "add_tag"), (2, "remove_tag")]);
    }
}
