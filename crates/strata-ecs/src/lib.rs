//! Strata ECS -- archetype-based Entity Component System with staged
//! structural changes and change-filtered kernels.
//!
//! Entities are stored in archetypes (one per unique set of component types)
//! using a Structure-of-Arrays layout. Adding or removing a component is
//! staged on the entity's current archetype and applied in bulk by
//! [`Scene::flush`](scene::Scene::flush), which runs automatically before
//! every kernel dispatch. Per-component observers record which rows changed
//! so kernels can restrict themselves to dirty rows.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! struct Integrate;
//!
//! impl Kernel for Integrate {
//!     type Params = (Write<Position>, Read<Velocity>);
//!     const NAME: &'static str = "integrate";
//!
//!     fn run(&mut self, (pos, vel): Row<'_, Self::Params>) {
//!         pos.x += vel.dx;
//!         pos.y += vel.dy;
//!     }
//! }
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Position>("position");
//! scene.register_component::<Velocity>("velocity");
//!
//! let entity = scene.create_entity();
//! scene.add_component::<Position>(entity).unwrap();
//! *scene.add_component::<Velocity>(entity).unwrap() = Velocity { dx: 1.0, dy: 0.5 };
//!
//! scene.run_kernel(&mut Integrate).unwrap();
//! assert_eq!(
//!     scene.get_component::<Position>(entity).unwrap(),
//!     &Position { x: 1.0, y: 0.5 }
//! );
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod callbacks;
pub mod column;
pub mod command;
pub mod component;
pub mod component_set;
pub mod entity;
pub mod globals;
pub mod kernel;
pub mod observer;
pub mod scene;
pub mod scratch;

use std::fmt;

use crate::archetype::ArchetypeId;
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a component lookup on a live entity found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentNotPresentReason {
    /// The entity never held the component (or it was removed and flushed).
    NeverAdded,
    /// The component is still stored but staged for removal.
    StagedForRemoval,
}

impl fmt::Display for ComponentNotPresentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentNotPresentReason::NeverAdded => f.write_str("never added"),
            ComponentNotPresentReason::StagedForRemoval => f.write_str("staged for removal"),
        }
    }
}

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (deleted, stale version, or never created).
    #[error("entity {entity} does not exist (deleted or never created)")]
    EntityNotFound { entity: Entity },

    /// The entity already holds (or has staged) the component.
    #[error("entity {entity} already has component '{component}'")]
    ComponentAlreadyPresent { entity: Entity, component: String },

    /// The entity does not hold the component.
    #[error("entity {entity} has no component '{component}' ({reason})")]
    ComponentNotPresent {
        entity: Entity,
        component: String,
        reason: ComponentNotPresentReason,
    },

    /// An archetype was asked for a column it does not have.
    #[error("archetype {archetype} has no column for component '{component}'")]
    ArchetypeComponentMissing {
        archetype: ArchetypeId,
        component: String,
    },

    /// A kernel's parameter list is malformed.
    #[error("invalid parameters for kernel '{kernel}': {details}")]
    QueryConfiguration {
        kernel: &'static str,
        details: String,
    },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// No global of the requested type exists.
    #[error("global '{name}' is not present")]
    GlobalNotPresent { name: &'static str },

    /// A global of the same type already exists.
    #[error("global '{name}' is already present")]
    GlobalAlreadyPresent { name: &'static str },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::command::{ApplyReport, CommandKind, CommandQueue, Commands};
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::component_set::ComponentSet;
    pub use crate::entity::{Entity, EntityLocation};
    pub use crate::kernel::{
        Banned, Changed, Deferred, DispatchReport, Global, GlobalMut, Kernel, KernelDescriptor,
        Out, Read, Row, Without, Write,
    };
    pub use crate::scene::{Scene, SceneConfig};
    pub use crate::{ComponentNotPresentReason, EcsError};
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
