//! Deferred structural mutations.
//!
//! Kernels cannot touch the scene while it is being iterated, so structural
//! changes they want to make are recorded through [`Commands`] into a
//! [`CommandQueue`]. The dispatcher applies the queue in FIFO order after the
//! run has finished. Additions and removals applied this way are staged like
//! any other and take effect on the next flush.
//!
//! A command that fails when applied (its entity was deleted by an earlier
//! command, the component is already present, ...) is logged and counted in
//! the [`ApplyReport`]; it never aborts the rest of the queue.
//!
//! # Example
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Health(u32);
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Health>("health");
//! let entity = scene.create_entity();
//!
//! let queue = CommandQueue::new();
//! queue.commands().add(entity, Health(50));
//! let report = queue.apply(&mut scene);
//! assert_eq!(report.success_count, 1);
//!
//! scene.flush();
//! assert_eq!(scene.get_component::<Health>(entity).unwrap(), &Health(50));
//! ```

use std::cell::RefCell;
use std::fmt;

use tracing::warn;

use crate::component::Component;
use crate::entity::Entity;
use crate::scene::Scene;
use crate::EcsError;

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// What a deferred command does, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Add a component (with the recorded value).
    AddComponent {
        /// Rust type name of the component.
        component: &'static str,
    },
    /// Remove a component.
    RemoveComponent {
        /// Rust type name of the component.
        component: &'static str,
    },
    /// Delete the entity.
    Delete,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::AddComponent { component } => write!(f, "add {component}"),
            CommandKind::RemoveComponent { component } => write!(f, "remove {component}"),
            CommandKind::Delete => f.write_str("delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// DeferredCommand
// ---------------------------------------------------------------------------

type ApplyFn = Box<dyn FnOnce(&mut Scene) -> Result<(), EcsError>>;

/// A single recorded mutation.
pub struct DeferredCommand {
    /// Entity the command targets.
    pub target: Entity,
    /// What the command does.
    pub kind: CommandKind,
    apply: ApplyFn,
}

impl fmt::Debug for DeferredCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCommand")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one [`CommandQueue::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Number of commands that applied successfully.
    pub success_count: usize,
    /// Number of commands that failed to apply.
    pub failed_count: usize,
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// FIFO queue of deferred commands.
///
/// Recording only needs a shared reference, so every kernel row can hold a
/// [`Commands`] handle onto the same queue.
#[derive(Default)]
pub struct CommandQueue {
    commands: RefCell<Vec<DeferredCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recording handle onto this queue.
    pub fn commands(&self) -> Commands<'_> {
        Commands { queue: self }
    }

    fn push(&self, command: DeferredCommand) {
        self.commands.borrow_mut().push(command);
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.borrow().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.borrow().is_empty()
    }

    /// Apply all commands to `scene` in insertion order.
    ///
    /// Failures are logged as warnings and skipped.
    pub fn apply(self, scene: &mut Scene) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (index, command) in self.commands.into_inner().into_iter().enumerate() {
            let DeferredCommand {
                target,
                kind,
                apply,
            } = command;
            match apply(scene) {
                Ok(()) => report.success_count += 1,
                Err(error) => {
                    warn!(
                        entity = ?target,
                        command = %kind,
                        command_index = index,
                        %error,
                        "deferred command failed to apply"
                    );
                    report.failed_count += 1;
                }
            }
        }
        report
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.commands.borrow().iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Records structural mutations for later application.
#[derive(Clone, Copy)]
pub struct Commands<'s> {
    queue: &'s CommandQueue,
}

impl<'s> Commands<'s> {
    /// Queue adding `value` to `entity`.
    pub fn add<T: Component>(&self, entity: Entity, value: T) {
        self.queue.push(DeferredCommand {
            target: entity,
            kind: CommandKind::AddComponent {
                component: std::any::type_name::<T>(),
            },
            apply: Box::new(move |scene: &mut Scene| {
                *scene.add_component::<T>(entity)? = value;
                Ok(())
            }),
        });
    }

    /// Queue removing `T` from `entity`.
    pub fn remove<T: Component>(&self, entity: Entity) {
        self.queue.push(DeferredCommand {
            target: entity,
            kind: CommandKind::RemoveComponent {
                component: std::any::type_name::<T>(),
            },
            apply: Box::new(move |scene: &mut Scene| scene.remove_component::<T>(entity)),
        });
    }

    /// Queue deleting `entity`.
    pub fn delete(&self, entity: Entity) {
        self.queue.push(DeferredCommand {
            target: entity,
            kind: CommandKind::Delete,
            apply: Box::new(move |scene: &mut Scene| scene.delete_entity(entity)),
        });
    }
}

impl fmt::Debug for Commands<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commands")
            .field("queued", &self.queue.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Armor(u32);

    fn setup_scene() -> Scene {
        let mut scene = Scene::new();
        scene.register_component::<Health>("health");
        scene.register_component::<Armor>("armor");
        scene
    }

    #[test]
    fn commands_apply_in_fifo_order() {
        let mut scene = setup_scene();
        let e = scene.create_entity();

        let queue = CommandQueue::new();
        let cmds = queue.commands();
        cmds.add(e, Health(10));
        cmds.remove::<Health>(e);
        cmds.add(e, Armor(3));
        assert_eq!(queue.len(), 3);

        let report = queue.apply(&mut scene);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failed_count, 0);

        scene.flush();
        assert!(!scene.has_component::<Health>(e).unwrap());
        assert_eq!(scene.get_component::<Armor>(e).unwrap(), &Armor(3));
    }

    #[test]
    fn failed_commands_are_counted_not_fatal() {
        let mut scene = setup_scene();
        let e = scene.create_entity();

        let queue = CommandQueue::new();
        let cmds = queue.commands();
        cmds.delete(e);
        cmds.add(e, Health(1));
        cmds.remove::<Armor>(e);
        let survivor = scene.create_entity();
        cmds.add(survivor, Health(7));

        let report = queue.apply(&mut scene);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failed_count, 2);
        assert!(!scene.is_alive(e));

        scene.flush();
        assert_eq!(scene.get_component::<Health>(survivor).unwrap(), &Health(7));
    }

    #[test]
    fn kind_display_names_component() {
        let kind = CommandKind::RemoveComponent { component: "Health" };
        assert_eq!(kind.to_string(), "remove Health");
        assert_eq!(CommandKind::Delete.to_string(), "delete");
    }
}
