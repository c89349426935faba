//! Strata ECS -- archetype and chunk based entity/fragment storage.
//!
//! Entities are grouped into archetypes (one per unique composition of
//! fragments, tags, chunk fragments and shared fragment values). Each
//! archetype stores its entities in fixed-size chunks with a columnar
//! layout, so queries walk contiguous memory one chunk at a time.
//! Generational entity handles make stale references detectable.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position(f32);
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Velocity(f32);
//!
//! let mut manager = EntityManager::new();
//! let position = manager.register_fragment::<Position>("position");
//! let velocity = manager.register_fragment::<Velocity>("velocity");
//!
//! let moving = manager.create_archetype_from_types(&[position, velocity]);
//! let entity = manager.create_entity(moving);
//! *manager.get_fragment_data_mut::<Velocity>(entity).unwrap() = Velocity(2.0);
//!
//! let mut query = EntityQuery::new();
//! query
//!     .add_requirement::<Position>(manager.registry(), AccessMode::ReadWrite, Presence::All)
//!     .add_requirement::<Velocity>(manager.registry(), AccessMode::ReadOnly, Presence::All);
//!
//! let mut ctx = ExecutionContext::new();
//! query.for_each_entity_chunk(&mut manager, &mut ctx, |ctx| {
//!     let velocities = ctx.fragment_view::<Velocity>();
//!     for (p, v) in ctx.fragment_view_mut::<Position>().iter_mut().zip(velocities) {
//!         p.0 += v.0;
//!     }
//! });
//!
//! assert_eq!(manager.get_fragment_data::<Position>(entity), Some(&Position(2.0)));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod bitset;
#[allow(unsafe_code)]
pub mod chunk;
pub mod collection;
pub mod column_view;
pub mod command;
pub mod composition;
pub mod config;
pub mod entity;
#[allow(unsafe_code)]
pub mod execution;
pub mod fragment;
#[allow(unsafe_code)]
pub mod manager;
pub mod query;
#[allow(unsafe_code)]
pub mod value;

use crate::archetype::ArchetypeId;
use crate::entity::EntityHandle;
use crate::fragment::FragmentKind;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by entity manager operations.
///
/// Immediate structural operations panic with the error's message; the
/// deferred path logs it and carries on.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A fragment type was referenced that has not been registered.
    #[error("fragment type '{name}' not registered. Registered types: [{registered}]")]
    UnknownFragmentType { name: String, registered: String },

    /// The type is registered, but as a different kind.
    #[error("'{name}' is a {actual}, expected a {expected}")]
    FragmentKindMismatch {
        name: String,
        expected: FragmentKind,
        actual: FragmentKind,
    },

    /// A value's Rust type does not match the registered fragment type.
    #[error("value does not match the registered type of fragment '{name}'")]
    FragmentValueMismatch { name: String },

    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: EntityHandle },

    /// The entity is reserved but has no archetype yet.
    #[error("entity {entity:?} is reserved but not built")]
    EntityNotBuilt { entity: EntityHandle },

    /// Building an entity that already lives in an archetype.
    #[error("entity {entity:?} is already built")]
    EntityAlreadyBuilt { entity: EntityHandle },

    #[error("entity {entity:?} already has '{name}'")]
    FragmentAlreadyPresent { entity: EntityHandle, name: String },

    #[error("entity {entity:?} does not have '{name}'")]
    FragmentNotPresent { entity: EntityHandle, name: String },

    /// The query cannot match anything as configured.
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// A chunk collection names an archetype the query does not match.
    #[error("chunk collection archetype {archetype:?} does not match the query")]
    ArchetypeMismatch { archetype: ArchetypeId },

    /// The archetype id was not created by this manager.
    #[error("{archetype:?} does not belong to this entity manager")]
    UnknownArchetype { archetype: ArchetypeId },

    #[error("invalid entity manager configuration: {reason}")]
    InvalidConfig { reason: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, CompactionReport};
    pub use crate::bitset::FragmentBitSet;
    pub use crate::collection::{ArchetypeChunkCollection, ChunkRange};
    pub use crate::column_view::ColumnView;
    pub use crate::command::{ApplyReport, Command, CommandBuffer, CommandKind};
    pub use crate::composition::{ArchetypeComposition, SharedFragmentValues};
    pub use crate::config::EntityManagerConfig;
    pub use crate::entity::{EntityHandle, EntityState};
    pub use crate::execution::ExecutionContext;
    pub use crate::fragment::{FragmentInfo, FragmentKind, FragmentRegistry, FragmentTypeId};
    pub use crate::manager::{
        EntityCreationContext, EntityEvent, EntityManager, ManagerId, ProcessingScope,
    };
    pub use crate::query::{AccessMode, EntityQuery, Presence};
    pub use crate::value::FragmentBundle;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
