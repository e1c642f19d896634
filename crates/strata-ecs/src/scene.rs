//! The [`Scene`]: entity lifecycle, staged component changes, and the
//! structural flush that reconciles them into archetype storage.
//!
//! Adding or removing a component never reshapes storage synchronously. The
//! change is staged on the archetype that currently holds the entity, and
//! [`Scene::flush`] later moves every affected row to the archetype matching
//! its new component set. Reads see staged additions immediately and treat
//! staged removals as absent.
//!
//! # Example
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Position>("position");
//!
//! let e = scene.create_entity();
//! scene.add_component::<Position>(e).unwrap().x = 4.0;
//! assert_eq!(scene.get_component::<Position>(e).unwrap().x, 4.0);
//!
//! scene.flush();
//! let location = scene.location(e).unwrap();
//! assert_eq!(scene.archetype_types(location.archetype).unwrap().len(), 1);
//! ```

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::archetype::{Archetype, ArchetypeId, ArchetypeTable, CellState, RowChanges, RowMove};
use crate::callbacks::CallbackRegistry;
use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
use crate::component_set::ComponentSet;
use crate::entity::{Entity, EntityLocation, EntityRegistry};
use crate::globals::GlobalStore;
use crate::kernel::KernelDescriptor;
use crate::observer::ComponentObserver;
use crate::scratch::ScratchStorage;
use crate::{ComponentNotPresentReason, EcsError};

// ---------------------------------------------------------------------------
// SceneConfig
// ---------------------------------------------------------------------------

/// Sizing knobs for a [`Scene`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Starting row capacity of each archetype container. Doubles on demand.
    pub initial_archetype_capacity: usize,
    /// Entity slots reserved up front.
    pub initial_entity_capacity: usize,
    /// Staged-value slots per component type reserved up front.
    pub scratch_capacity: usize,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            initial_archetype_capacity: 64,
            initial_entity_capacity: 512,
            scratch_capacity: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// Owns every entity, archetype, observer and global of one simulation.
pub struct Scene {
    config: SceneConfig,
    pub(crate) components: ComponentRegistry,
    entities: EntityRegistry,
    pub(crate) archetypes: ArchetypeTable,
    /// Live archetypes by component set. Rebuilt after columns are
    /// materialized by a kernel run.
    archetype_index: HashMap<ComponentSet, ArchetypeId>,
    scratch: ScratchStorage,
    pub(crate) observers: BTreeMap<ComponentTypeId, ComponentObserver>,
    pub(crate) globals: GlobalStore,
    callbacks: CallbackRegistry,
    pub(crate) kernels: HashMap<(TypeId, &'static str), Rc<KernelDescriptor>>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Create an empty scene with the default [`SceneConfig`].
    pub fn new() -> Self {
        Self::with_config(SceneConfig::default())
    }

    pub fn with_config(config: SceneConfig) -> Self {
        Self {
            entities: EntityRegistry::with_capacity(config.initial_entity_capacity),
            scratch: ScratchStorage::new(config.scratch_capacity),
            config,
            components: ComponentRegistry::new(),
            archetypes: ArchetypeTable::new(),
            archetype_index: HashMap::new(),
            observers: BTreeMap::new(),
            globals: GlobalStore::new(),
            callbacks: CallbackRegistry::new(),
            kernels: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Register a component type under `name`. See
    /// [`ComponentRegistry::register`].
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        self.components.register::<T>(name)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.components
    }

    // -- entity lifecycle ----------------------------------------------------

    /// Create an entity with no components.
    pub fn create_entity(&mut self) -> Entity {
        let empty = self.archetype_for(ComponentSet::new());
        let entity = self.entities.register(EntityLocation {
            archetype: empty,
            row: 0,
        });
        if let Some(arch) = self.archetypes.get_mut(empty) {
            let row = arch.add_row(entity);
            self.entities.move_to(entity.id(), empty, row);
        }
        entity
    }

    /// Delete `entity`, firing removal callbacks for every component it held
    /// or had staged for addition.
    pub fn delete_entity(&mut self, entity: Entity) -> Result<(), EcsError> {
        let loc = self.entities.try_resolve(entity)?;
        let arch = self.archetype_of(loc.archetype, entity)?;
        let mut types = arch.held_types_for(loc.row);
        types.extend(arch.staged_additions_for(loc.row));

        for &ty in &types {
            self.callbacks.fire_removed(ty, entity);
        }
        if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
            arch.remove_row(loc.row);
        }
        self.entities.unregister(entity)?;
        for observer in self.observers.values_mut() {
            observer.on_row_deleted(loc.archetype, loc.row);
        }
        trace!(entity = ?entity, components = types.len(), "entity deleted");
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// All live entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter().map(|(entity, _)| entity)
    }

    /// Where `entity`'s components currently live.
    pub fn location(&self, entity: Entity) -> Result<EntityLocation, EcsError> {
        self.entities.try_resolve(entity)
    }

    // -- components ----------------------------------------------------------

    /// Stage a default `T` on `entity` and return it for initialisation.
    ///
    /// If `T` was staged for removal, the removal is cancelled instead and
    /// the existing value is reset to `T::default()`.
    pub fn add_component<T: Component>(&mut self, entity: Entity) -> Result<&mut T, EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let state = self.archetype_of(loc.archetype, entity)?.cell_state(loc.row, ty);
        match state {
            CellState::Present | CellState::StagedForAddition(_) => {
                Err(EcsError::ComponentAlreadyPresent {
                    entity,
                    component: self.components.name_of(ty).to_owned(),
                })
            }
            CellState::StagedForRemoval => {
                if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
                    arch.cancel_removal(loc.row, ty);
                }
                self.mark_changed(ty, loc);
                let value = self.column_value_mut::<T>(ty, loc)?;
                *value = T::default();
                Ok(value)
            }
            CellState::Absent => {
                let Some(info) = self.components.get_info(ty) else {
                    return Err(self.column_missing(loc.archetype, ty));
                };
                let slot = self.scratch.stage(info);
                if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
                    arch.stage_addition(loc.row, ty, slot);
                }
                match self.scratch.get_mut::<T>(slot) {
                    Some(value) => Ok(value),
                    None => Err(EcsError::ArchetypeComponentMissing {
                        archetype: loc.archetype,
                        component: self.components.name_of(ty).to_owned(),
                    }),
                }
            }
        }
    }

    /// Read-only access to `entity`'s `T`, including a value staged for
    /// addition.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<&T, EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let arch = self.archetype_of(loc.archetype, entity)?;
        match arch.cell_state(loc.row, ty) {
            CellState::Present => arch
                .get::<T>(loc.row, ty)
                .ok_or_else(|| self.column_missing(loc.archetype, ty)),
            CellState::StagedForAddition(slot) => self
                .scratch
                .get::<T>(slot)
                .ok_or_else(|| self.column_missing(loc.archetype, ty)),
            CellState::StagedForRemoval => Err(self.not_present(
                entity,
                ty,
                ComponentNotPresentReason::StagedForRemoval,
            )),
            CellState::Absent => {
                Err(self.not_present(entity, ty, ComponentNotPresentReason::NeverAdded))
            }
        }
    }

    /// Mutable access to `entity`'s `T`. The row is marked changed for
    /// changed-filter kernels.
    pub fn get_mutable_component<T: Component>(
        &mut self,
        entity: Entity,
    ) -> Result<&mut T, EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let state = self.archetype_of(loc.archetype, entity)?.cell_state(loc.row, ty);
        match state {
            CellState::Present => {
                self.mark_changed(ty, loc);
                self.column_value_mut::<T>(ty, loc)
            }
            CellState::StagedForAddition(slot) => match self.scratch.get_mut::<T>(slot) {
                Some(value) => Ok(value),
                None => Err(EcsError::ArchetypeComponentMissing {
                    archetype: loc.archetype,
                    component: self.components.name_of(ty).to_owned(),
                }),
            },
            CellState::StagedForRemoval => Err(self.not_present(
                entity,
                ty,
                ComponentNotPresentReason::StagedForRemoval,
            )),
            CellState::Absent => {
                Err(self.not_present(entity, ty, ComponentNotPresentReason::NeverAdded))
            }
        }
    }

    /// The existing `T` (cancelling a staged removal and keeping its value),
    /// the staged one, or a freshly staged default.
    pub fn get_or_add_component<T: Component>(
        &mut self,
        entity: Entity,
    ) -> Result<&mut T, EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let state = self.archetype_of(loc.archetype, entity)?.cell_state(loc.row, ty);
        match state {
            CellState::Absent => self.add_component::<T>(entity),
            CellState::StagedForRemoval => {
                if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
                    arch.cancel_removal(loc.row, ty);
                }
                self.get_mutable_component::<T>(entity)
            }
            CellState::Present | CellState::StagedForAddition(_) => {
                self.get_mutable_component::<T>(entity)
            }
        }
    }

    /// Whether `entity` holds `T` (or has it staged for addition) and it is
    /// not staged for removal.
    pub fn has_component<T: Component>(&self, entity: Entity) -> Result<bool, EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let state = self.archetype_of(loc.archetype, entity)?.cell_state(loc.row, ty);
        Ok(matches!(
            state,
            CellState::Present | CellState::StagedForAddition(_)
        ))
    }

    /// Stage removal of `T` from `entity`, firing its removal callbacks
    /// first. A `T` that was only staged for addition is discarded instead.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let (ty, loc) = self.resolve::<T>(entity)?;
        let state = self.archetype_of(loc.archetype, entity)?.cell_state(loc.row, ty);
        match state {
            CellState::Present => {
                self.callbacks.fire_removed(ty, entity);
                if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
                    arch.stage_removal(loc.row, ty);
                }
                Ok(())
            }
            CellState::StagedForAddition(_) => {
                self.callbacks.fire_removed(ty, entity);
                if let Some(arch) = self.archetypes.get_mut(loc.archetype) {
                    arch.cancel_addition(loc.row, ty);
                }
                Ok(())
            }
            CellState::StagedForRemoval => Err(self.not_present(
                entity,
                ty,
                ComponentNotPresentReason::StagedForRemoval,
            )),
            CellState::Absent => {
                Err(self.not_present(entity, ty, ComponentNotPresentReason::NeverAdded))
            }
        }
    }

    /// Subscribe to removals of `T`, both explicit and by entity deletion.
    pub fn on_component_removed<T: Component>(
        &mut self,
        callback: impl FnMut(Entity) + 'static,
    ) -> Result<(), EcsError> {
        let ty = self.components.require::<T>()?;
        self.callbacks.on_removed(ty, callback);
        Ok(())
    }

    // -- globals -------------------------------------------------------------

    pub fn add_global<T: 'static>(&mut self, value: T) -> Result<(), EcsError> {
        self.globals.insert(value)
    }

    pub fn get_global<T: 'static>(&self) -> Result<&T, EcsError> {
        self.globals.get::<T>()
    }

    pub fn get_global_mut<T: 'static>(&mut self) -> Result<&mut T, EcsError> {
        self.globals.get_mut::<T>()
    }

    pub fn has_global<T: 'static>(&self) -> bool {
        self.globals.contains::<T>()
    }

    pub fn remove_global<T: 'static>(&mut self) -> Result<T, EcsError> {
        self.globals.remove::<T>()
    }

    // -- archetypes ----------------------------------------------------------

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> + '_ {
        self.archetypes.iter()
    }

    /// Component types held by the archetype `id`, in ascending id order.
    pub fn archetype_types(&self, id: ArchetypeId) -> Option<Vec<ComponentTypeId>> {
        self.archetypes
            .get(id)
            .map(|arch| arch.component_set().iter().collect())
    }

    /// Whether any archetype has staged changes waiting for a flush.
    pub fn has_staged_changes(&self) -> bool {
        self.archetypes.iter().any(Archetype::has_staged)
    }

    // -- flush ---------------------------------------------------------------

    /// Move every row with staged changes to the archetype matching its new
    /// component set. Returns the number of rows migrated.
    ///
    /// Archetypes created during the pass become visible to lookups only
    /// once the pass is complete. Containers that lost rows are compacted
    /// afterwards. With nothing staged this is a no-op.
    pub fn flush(&mut self) -> usize {
        let staged: Vec<ArchetypeId> = self
            .archetypes
            .iter()
            .filter(|arch| arch.has_staged())
            .map(Archetype::id)
            .collect();
        if staged.is_empty() {
            if self.scratch.staged_count() > 0 {
                self.scratch.reset();
            }
            return 0;
        }

        let mut pending: HashMap<ComponentSet, ArchetypeId> = HashMap::new();
        let mut migrated = 0;
        for src_id in &staged {
            let Some(src) = self.archetypes.get_mut(*src_id) else {
                continue;
            };
            let rows = src.take_staged();
            let base = src.component_set().clone();

            for (row, changes) in rows {
                let Some(entity) = self.archetypes.get(*src_id).and_then(|a| a.entity_at(row))
                else {
                    continue;
                };
                let mut set = base.snapshot();
                for &ty in &changes.removed {
                    set.remove(ty);
                }
                for &(ty, _) in &changes.added {
                    set.add(ty);
                }
                if set == base {
                    continue;
                }
                let dst_id = self.resolve_destination(set, &mut pending);
                self.migrate_row(entity, *src_id, row, dst_id, &changes);
                migrated += 1;
            }
        }

        let created = pending.len();
        self.archetype_index.extend(pending);

        let mut compacted = 0;
        for src_id in staged {
            compacted += self.compact_archetype(src_id);
        }
        self.scratch.reset();

        debug!(
            migrated,
            archetypes_created = created,
            rows_compacted = compacted,
            "flush complete"
        );
        migrated
    }

    fn resolve_destination(
        &mut self,
        set: ComponentSet,
        pending: &mut HashMap<ComponentSet, ArchetypeId>,
    ) -> ArchetypeId {
        if let Some(&id) = self.archetype_index.get(&set) {
            return id;
        }
        if let Some(&id) = pending.get(&set) {
            return id;
        }
        let id = self.create_archetype(&set);
        pending.insert(set, id);
        id
    }

    fn create_archetype(&mut self, set: &ComponentSet) -> ArchetypeId {
        let infos: Vec<&ComponentInfo> = set
            .iter()
            .filter_map(|ty| self.components.get_info(ty))
            .collect();
        let capacity = self.config.initial_archetype_capacity;
        let id = self
            .archetypes
            .insert_with(|id| Archetype::new(id, &infos, capacity));
        debug!(archetype = ?id, components = ?set, "archetype created");
        id
    }

    /// Live archetype for `set`, created and indexed immediately if absent.
    fn archetype_for(&mut self, set: ComponentSet) -> ArchetypeId {
        if let Some(&id) = self.archetype_index.get(&set) {
            return id;
        }
        let id = self.create_archetype(&set);
        self.archetype_index.insert(set, id);
        id
    }

    fn migrate_row(
        &mut self,
        entity: Entity,
        src_id: ArchetypeId,
        row: usize,
        dst_id: ArchetypeId,
        changes: &RowChanges,
    ) {
        let Some((src, dst)) = self.archetypes.get2_mut(src_id, dst_id) else {
            return;
        };
        let dst_row = dst.add_row(entity);
        let dst_types: Vec<ComponentTypeId> = dst.component_set().iter().collect();
        for ty in dst_types {
            let Some(dst_column) = dst.column_mut(ty) else {
                continue;
            };
            if let Some(&(_, slot)) = changes.added.iter().find(|(added, _)| *added == ty) {
                self.scratch.transfer(slot, dst_column, dst_row);
            } else if let Some(src_column) = src.column_mut(ty) {
                src_column.transfer_row(row, dst_column, dst_row);
            }
        }

        for (&ty, observer) in self.observers.iter_mut() {
            let in_src = src.has_column(ty);
            let in_dst = dst.has_column(ty);
            match (in_src, in_dst) {
                (true, true) => observer.on_row_moved(src_id, row, dst_id, dst_row),
                (true, false) => observer.on_row_deleted(src_id, row),
                (false, true) => observer.mark_changed_or_added(dst_id, dst_row),
                (false, false) => {}
            }
        }

        src.remove_row(row);
        self.entities.move_to(entity.id(), dst_id, dst_row);
        trace!(entity = ?entity, from = ?src_id, to = ?dst_id, row = dst_row, "row migrated");
    }

    // -- compaction and merging ----------------------------------------------

    /// Reclaim rows freed by deletions and migrations in every archetype.
    /// Returns the number of rows moved.
    pub fn compact(&mut self) -> usize {
        let ids = self.archetypes.ids();
        let moved: usize = ids.into_iter().map(|id| self.compact_archetype(id)).sum();
        if moved > 0 {
            debug!(rows_moved = moved, "scene compacted");
        }
        moved
    }

    fn compact_archetype(&mut self, id: ArchetypeId) -> usize {
        let moves = match self.archetypes.get_mut(id) {
            Some(arch) if arch.has_free_rows() => arch.compact(),
            _ => return 0,
        };
        self.apply_moves(id, id, &moves);
        moves.len()
    }

    /// Point registry entries and dirty marks at the rows' new positions.
    fn apply_moves(&mut self, from: ArchetypeId, to: ArchetypeId, moves: &[RowMove]) {
        for mv in moves {
            self.entities.move_to(mv.entity.id(), to, mv.to);
            for observer in self.observers.values_mut() {
                observer.on_row_moved(from, mv.from, to, mv.to);
            }
        }
    }

    /// Recompute every archetype's key and merge containers whose keys now
    /// collide. Returns the number of containers merged away.
    pub fn rebuild_archetype_table(&mut self) -> usize {
        let mut index: HashMap<ComponentSet, ArchetypeId> = HashMap::new();
        let mut merged = 0;
        for id in self.archetypes.ids() {
            let Some(set) = self.archetypes.get(id).map(|a| a.component_set().clone()) else {
                continue;
            };
            if let Some(&target) = index.get(&set) {
                if self.merge_archetypes(target, id) {
                    merged += 1;
                }
            } else {
                index.insert(set, id);
            }
        }
        self.archetype_index = index;
        if merged > 0 {
            debug!(merged, archetypes = self.archetypes.len(), "archetype table rebuilt");
        }
        merged
    }

    /// Block-copy `source` into `target` and drop `source`.
    fn merge_archetypes(&mut self, target: ArchetypeId, source: ArchetypeId) -> bool {
        let Some((dst, src)) = self.archetypes.get2_mut(target, source) else {
            return false;
        };
        let Some(result) = dst.absorb(src) else {
            return false;
        };

        self.apply_moves(target, target, &result.compacted_target);
        for mv in &result.compacted_source {
            for observer in self.observers.values_mut() {
                observer.on_row_moved(source, mv.from, source, mv.to);
            }
        }
        for mv in &result.moved {
            self.entities.move_to(mv.entity.id(), target, mv.to);
        }
        for observer in self.observers.values_mut() {
            observer.transplant_block(source, target, result.start, result.moved.len());
        }
        self.archetypes.remove(source);
        debug!(
            source = ?source,
            target = ?target,
            rows = result.moved.len(),
            "archetypes merged"
        );
        true
    }

    // -- helpers -------------------------------------------------------------

    fn resolve<T: Component>(
        &self,
        entity: Entity,
    ) -> Result<(ComponentTypeId, EntityLocation), EcsError> {
        let ty = self.components.require::<T>()?;
        let loc = self.entities.try_resolve(entity)?;
        Ok((ty, loc))
    }

    fn archetype_of(&self, id: ArchetypeId, entity: Entity) -> Result<&Archetype, EcsError> {
        self.archetypes
            .get(id)
            .ok_or(EcsError::EntityNotFound { entity })
    }

    fn column_value_mut<T: Component>(
        &mut self,
        ty: ComponentTypeId,
        loc: EntityLocation,
    ) -> Result<&mut T, EcsError> {
        match self
            .archetypes
            .get_mut(loc.archetype)
            .and_then(|arch| arch.get_mut::<T>(loc.row, ty))
        {
            Some(value) => Ok(value),
            None => Err(EcsError::ArchetypeComponentMissing {
                archetype: loc.archetype,
                component: self.components.name_of(ty).to_owned(),
            }),
        }
    }

    fn mark_changed(&mut self, ty: ComponentTypeId, loc: EntityLocation) {
        if let Some(observer) = self.observers.get_mut(&ty) {
            observer.mark_changed_or_added(loc.archetype, loc.row);
        }
    }

    fn column_missing(&self, archetype: ArchetypeId, ty: ComponentTypeId) -> EcsError {
        EcsError::ArchetypeComponentMissing {
            archetype,
            component: self.components.name_of(ty).to_owned(),
        }
    }

    fn not_present(
        &self,
        entity: Entity,
        ty: ComponentTypeId,
        reason: ComponentNotPresentReason,
    ) -> EcsError {
        EcsError::ComponentNotPresent {
            entity,
            component: self.components.name_of(ty).to_owned(),
            reason,
        }
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("entities", &self.entities.len())
            .field("archetypes", &self.archetypes.len())
            .field("components", &self.components.len())
            .field("observers", &self.observers.len())
            .field("globals", &self.globals)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Health(u32);

    fn setup_scene() -> Scene {
        let mut scene = Scene::new();
        scene.register_component::<Position>("position");
        scene.register_component::<Velocity>("velocity");
        scene.register_component::<Health>("health");
        scene
    }

    fn types_of(scene: &Scene, entity: Entity) -> Vec<ComponentTypeId> {
        let loc = scene.location(entity).unwrap();
        scene.archetype_types(loc.archetype).unwrap()
    }

    #[test]
    fn created_entity_lives_in_empty_archetype() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        assert!(scene.is_alive(e));
        assert!(types_of(&scene, e).is_empty());
        assert_eq!(scene.entity_count(), 1);
        assert_eq!(scene.archetype_count(), 1);
    }

    #[test]
    fn staged_addition_is_readable_before_flush() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap().0 = 7;

        assert!(scene.has_component::<Health>(e).unwrap());
        assert_eq!(scene.get_component::<Health>(e).unwrap(), &Health(7));
        assert!(types_of(&scene, e).is_empty(), "storage unchanged before flush");

        assert_eq!(scene.flush(), 1);
        assert_eq!(types_of(&scene, e), vec![scene.registry().lookup::<Health>().unwrap()]);
        assert_eq!(scene.get_component::<Health>(e).unwrap(), &Health(7));
    }

    #[test]
    fn double_add_is_rejected() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap();
        assert!(matches!(
            scene.add_component::<Health>(e),
            Err(EcsError::ComponentAlreadyPresent { .. })
        ));
        scene.flush();
        assert!(matches!(
            scene.add_component::<Health>(e),
            Err(EcsError::ComponentAlreadyPresent { .. })
        ));
    }

    #[test]
    fn remove_reasons_are_distinguished() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        let err = scene.remove_component::<Health>(e).unwrap_err();
        assert!(matches!(
            err,
            EcsError::ComponentNotPresent {
                reason: ComponentNotPresentReason::NeverAdded,
                ..
            }
        ));

        scene.add_component::<Health>(e).unwrap();
        scene.flush();
        scene.remove_component::<Health>(e).unwrap();
        let err = scene.get_component::<Health>(e).unwrap_err();
        assert!(matches!(
            err,
            EcsError::ComponentNotPresent {
                reason: ComponentNotPresentReason::StagedForRemoval,
                ..
            }
        ));
        assert!(scene.remove_component::<Health>(e).is_err());
    }

    #[test]
    fn remove_of_staged_addition_cancels_it() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap();
        scene.remove_component::<Health>(e).unwrap();
        assert!(!scene.has_component::<Health>(e).unwrap());
        assert!(!scene.has_staged_changes());
        assert_eq!(scene.flush(), 0);
        assert!(types_of(&scene, e).is_empty());
    }

    #[test]
    fn add_after_staged_removal_cancels_and_resets() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap().0 = 9;
        scene.flush();

        scene.remove_component::<Health>(e).unwrap();
        let value = scene.add_component::<Health>(e).unwrap();
        assert_eq!(value, &mut Health(0));
        value.0 = 3;
        assert!(!scene.has_staged_changes());
        assert_eq!(scene.get_component::<Health>(e).unwrap(), &Health(3));
    }

    #[test]
    fn get_or_add_covers_every_state() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.get_or_add_component::<Health>(e).unwrap().0 = 1;
        scene.get_or_add_component::<Health>(e).unwrap().0 += 1;
        scene.flush();
        scene.get_or_add_component::<Health>(e).unwrap().0 += 1;
        scene.remove_component::<Health>(e).unwrap();
        scene.get_or_add_component::<Health>(e).unwrap().0 += 1;
        assert_eq!(scene.get_component::<Health>(e).unwrap(), &Health(4));
        assert!(!scene.has_staged_changes());
    }

    #[test]
    fn removal_migrates_and_keeps_other_data() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        *scene.add_component::<Position>(e).unwrap() = Position { x: 1.0, y: 2.0 };
        *scene.add_component::<Velocity>(e).unwrap() = Velocity { dx: 3.0, dy: 4.0 };
        scene.flush();
        assert_eq!(types_of(&scene, e).len(), 2);

        scene.remove_component::<Velocity>(e).unwrap();
        scene.flush();
        assert_eq!(types_of(&scene, e), vec![scene.registry().lookup::<Position>().unwrap()]);
        assert_eq!(
            scene.get_component::<Position>(e).unwrap(),
            &Position { x: 1.0, y: 2.0 }
        );
    }

    #[test]
    fn rows_sharing_a_new_set_share_one_new_archetype() {
        let mut scene = setup_scene();
        let entities: Vec<Entity> = (0..4).map(|_| scene.create_entity()).collect();
        for &e in &entities {
            scene.add_component::<Health>(e).unwrap();
        }
        scene.flush();
        let first = scene.location(entities[0]).unwrap().archetype;
        for &e in &entities {
            assert_eq!(scene.location(e).unwrap().archetype, first);
        }
        assert_eq!(scene.archetype_count(), 2);
    }

    #[test]
    fn flush_without_changes_is_a_noop() {
        let mut scene = setup_scene();
        let a = scene.create_entity();
        let b = scene.create_entity();
        scene.add_component::<Health>(a).unwrap();
        scene.flush();

        let before: Vec<_> = [a, b].iter().map(|e| scene.location(*e).unwrap()).collect();
        let count = scene.archetype_count();
        assert_eq!(scene.flush(), 0);
        let after: Vec<_> = [a, b].iter().map(|e| scene.location(*e).unwrap()).collect();
        assert_eq!(before, after);
        assert_eq!(scene.archetype_count(), count);
    }

    #[test]
    fn flush_compacts_vacated_rows() {
        let mut scene = setup_scene();
        let entities: Vec<Entity> = (0..3).map(|_| scene.create_entity()).collect();
        scene.add_component::<Health>(entities[0]).unwrap();
        scene.flush();

        // The last empty-set entity was moved down into row 0.
        let loc = scene.location(entities[2]).unwrap();
        assert_eq!(loc.row, 0);
        let empty = scene.archetype(loc.archetype).unwrap();
        assert_eq!(empty.len(), 2);
        assert_eq!(empty.end(), 2);
    }

    #[test]
    fn deleted_entity_is_not_found() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap();
        scene.flush();
        scene.delete_entity(e).unwrap();

        assert!(!scene.is_alive(e));
        assert!(matches!(
            scene.get_component::<Health>(e),
            Err(EcsError::EntityNotFound { .. })
        ));
        assert!(matches!(
            scene.delete_entity(e),
            Err(EcsError::EntityNotFound { .. })
        ));
        assert_eq!(scene.entity_count(), 0);
    }

    #[test]
    fn delete_fires_callbacks_for_held_and_staged_types() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut scene = setup_scene();
        {
            let fired = Rc::clone(&fired);
            scene
                .on_component_removed::<Health>(move |e| fired.borrow_mut().push(("health", e)))
                .unwrap();
        }
        {
            let fired = Rc::clone(&fired);
            scene
                .on_component_removed::<Position>(move |e| fired.borrow_mut().push(("position", e)))
                .unwrap();
        }

        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap();
        scene.flush();
        scene.add_component::<Position>(e).unwrap();
        scene.delete_entity(e).unwrap();

        let mut got = fired.borrow().clone();
        got.sort();
        assert_eq!(got, vec![("health", e), ("position", e)]);
        assert!(!scene.has_staged_changes());
    }

    #[test]
    fn explicit_remove_fires_before_staging() {
        let fired = Rc::new(RefCell::new(0));
        let mut scene = setup_scene();
        {
            let fired = Rc::clone(&fired);
            scene
                .on_component_removed::<Health>(move |_| *fired.borrow_mut() += 1)
                .unwrap();
        }
        let e = scene.create_entity();
        scene.add_component::<Health>(e).unwrap();
        scene.flush();
        scene.remove_component::<Health>(e).unwrap();
        assert_eq!(*fired.borrow(), 1);
        assert!(scene.has_staged_changes());
    }

    #[test]
    fn unregistered_component_reports_names() {
        let mut scene = setup_scene();
        let e = scene.create_entity();
        let err = scene.add_component::<String>(e).unwrap_err();
        assert!(matches!(err, EcsError::UnknownComponent { .. }));
        assert!(err.to_string().contains("health"));
    }

    #[test]
    fn globals_round_trip() {
        let mut scene = setup_scene();
        scene.add_global(42u64).unwrap();
        assert!(scene.has_global::<u64>());
        *scene.get_global_mut::<u64>().unwrap() += 1;
        assert_eq!(scene.get_global::<u64>().unwrap(), &43);
        assert!(scene.add_global(0u64).is_err());
        assert_eq!(scene.remove_global::<u64>().unwrap(), 43);
        assert!(scene.get_global::<u64>().is_err());
    }

    #[test]
    fn config_controls_initial_capacity() {
        let mut scene = Scene::with_config(SceneConfig {
            initial_archetype_capacity: 2,
            ..SceneConfig::default()
        });
        scene.register_component::<Health>("health");
        for _ in 0..5 {
            scene.create_entity();
        }
        let arch = scene.archetypes().next().unwrap();
        assert_eq!(arch.capacity(), 8);
        assert_eq!(scene.config().initial_entity_capacity, 512);
    }
}
