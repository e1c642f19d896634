//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share the exact same set of
//! component types. Components are laid out Structure-of-Arrays: one column
//! per component type, plus a parallel entity column that maps row index to
//! entity. Rows are allocated from a free-row queue before the high-water
//! mark is extended, and deleted rows are reclaimed lazily by
//! [`Archetype::compact`].
//!
//! Structural changes are staged on the archetype that currently holds the
//! entity: additions reference a [`ScratchSlot`] holding the new value,
//! removals are recorded per `(row, type)`. Neither touches the columns, so a
//! column resize never invalidates a staged value. The scene resolves both
//! during its flush pass.
//!
//! Archetypes live in an [`ArchetypeTable`] arena and are addressed by a
//! generation-checked [`ArchetypeId`], so a stale id never resolves to a
//! container that replaced a removed one.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::column::{downcast_slice, downcast_slice_mut, ColumnStorage};
use crate::component::{Component, ComponentInfo, ComponentTypeId};
use crate::component_set::ComponentSet;
use crate::entity::Entity;
use crate::scratch::ScratchSlot;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Generation-checked handle to an archetype in an [`ArchetypeTable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId {
    index: u32,
    generation: u32,
}

impl ArchetypeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the arena.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({}g{})", self.index, self.generation)
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Row bookkeeping types
// ---------------------------------------------------------------------------

/// An occupied row that was relocated within or between containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMove {
    pub entity: Entity,
    pub from: usize,
    pub to: usize,
}

/// What a container holds for one `(row, type)` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// The type has a column here and is not staged for removal.
    Present,
    /// The type has a column here but the row is staged to drop it.
    StagedForRemoval,
    /// The type has no column here; a value is staged in scratch.
    StagedForAddition(ScratchSlot),
    /// Neither held nor staged.
    Absent,
}

/// Staged entries for a single row, as drained by the flush pass.
#[derive(Debug, Default)]
pub struct RowChanges {
    pub added: Vec<(ComponentTypeId, ScratchSlot)>,
    pub removed: Vec<ComponentTypeId>,
}

/// Columns moved out of an archetype for the duration of a kernel run.
pub(crate) type LentColumns = Vec<(ComponentTypeId, RefCell<Box<dyn ColumnStorage>>)>;

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Storage container for all entities sharing one [`ComponentSet`].
pub struct Archetype {
    id: ArchetypeId,
    component_set: ComponentSet,
    /// Sorted by component type id.
    columns: Vec<(ComponentTypeId, Box<dyn ColumnStorage>)>,
    /// Parallel to the columns; `None` marks an unoccupied row.
    entities: Vec<Option<Entity>>,
    capacity: usize,
    len: usize,
    /// One past the highest row ever handed out and not yet retracted.
    end: usize,
    free_rows: VecDeque<usize>,
    staged_additions: BTreeMap<(usize, ComponentTypeId), ScratchSlot>,
    staged_removals: BTreeSet<(usize, ComponentTypeId)>,
}

impl Archetype {
    /// Create an empty container with one column per entry of `infos`.
    pub fn new(id: ArchetypeId, infos: &[&ComponentInfo], capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut columns: Vec<(ComponentTypeId, Box<dyn ColumnStorage>)> = infos
            .iter()
            .map(|info| (info.id, info.create_column(capacity)))
            .collect();
        columns.sort_by_key(|(id, _)| *id);
        columns.dedup_by_key(|(id, _)| *id);
        let component_set = columns.iter().map(|(id, _)| *id).collect();
        Self {
            id,
            component_set,
            columns,
            entities: vec![None; capacity],
            capacity,
            len: 0,
            end: 0,
            free_rows: VecDeque::new(),
            staged_additions: BTreeMap::new(),
            staged_removals: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The set of types this container has columns for.
    #[inline]
    pub fn component_set(&self) -> &ComponentSet {
        &self.component_set
    }

    #[inline]
    pub fn has_column(&self, component: ComponentTypeId) -> bool {
        self.component_set.contains(component)
    }

    /// Number of occupied rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows allocated per column.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the highest row in use. Occupied rows are all below this.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Whether deleted rows are waiting to be reclaimed.
    #[inline]
    pub fn has_free_rows(&self) -> bool {
        !self.free_rows.is_empty()
    }

    /// Entity stored at `row`, if the row is occupied.
    #[inline]
    pub fn entity_at(&self, row: usize) -> Option<Entity> {
        self.entities.get(row).copied().flatten()
    }

    /// Occupied rows in ascending order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, Entity)> + '_ {
        self.entities[..self.end]
            .iter()
            .enumerate()
            .filter_map(|(row, e)| e.map(|e| (row, e)))
    }

    fn column_index(&self, component: ComponentTypeId) -> Option<usize> {
        self.columns
            .binary_search_by_key(&component, |(id, _)| *id)
            .ok()
    }

    pub(crate) fn column(&self, component: ComponentTypeId) -> Option<&dyn ColumnStorage> {
        self.column_index(component)
            .map(|i| self.columns[i].1.as_ref())
    }

    pub(crate) fn column_mut(
        &mut self,
        component: ComponentTypeId,
    ) -> Option<&mut dyn ColumnStorage> {
        let i = self.column_index(component)?;
        let column: &mut dyn ColumnStorage = self.columns[i].1.as_mut();
        Some(column)
    }

    /// Value of `T` at `row`, if this container has a `T` column.
    pub fn get<T: Component>(&self, row: usize, component: ComponentTypeId) -> Option<&T> {
        self.column(component)
            .and_then(|c| downcast_slice::<T>(c))
            .and_then(|s| s.get(row))
    }

    /// Mutable value of `T` at `row`, if this container has a `T` column.
    pub fn get_mut<T: Component>(
        &mut self,
        row: usize,
        component: ComponentTypeId,
    ) -> Option<&mut T> {
        self.column_mut(component)
            .and_then(|c| downcast_slice_mut::<T>(c))
            .and_then(|s| s.get_mut(row))
    }

    // -- row allocation ------------------------------------------------------

    /// Allocate a row for `entity`, reusing a freed row when one is queued.
    pub fn add_row(&mut self, entity: Entity) -> usize {
        let row = match self.free_rows.pop_front() {
            Some(row) => row,
            None => {
                if self.end == self.capacity {
                    self.grow_capacity(self.end + 1);
                }
                self.end += 1;
                self.end - 1
            }
        };
        self.entities[row] = Some(entity);
        self.len += 1;
        row
    }

    /// Release `row`. Its cells are reset to defaults; the row is retracted
    /// immediately if it is the top row, otherwise queued for reuse.
    pub fn remove_row(&mut self, row: usize) -> Option<Entity> {
        let entity = self.entities.get_mut(row)?.take()?;
        for (_, column) in &mut self.columns {
            column.reset_row(row);
        }
        self.purge_row(row);
        self.len -= 1;
        if row + 1 == self.end {
            self.end -= 1;
        } else {
            self.free_rows.push_back(row);
        }
        Some(entity)
    }

    /// Double the capacity until it covers `required` rows.
    fn grow_capacity(&mut self, required: usize) {
        let mut capacity = self.capacity.max(1);
        while capacity < required {
            capacity *= 2;
        }
        if capacity == self.capacity {
            return;
        }
        for (_, column) in &mut self.columns {
            column.resize(capacity);
        }
        self.entities.resize(capacity, None);
        self.capacity = capacity;
    }

    /// Fill free rows by moving the highest occupied rows down into them.
    ///
    /// Returns every move so the caller can relocate registry entries and
    /// dirty marks.
    pub fn compact(&mut self) -> Vec<RowMove> {
        let mut free: Vec<usize> = self.free_rows.drain(..).collect();
        free.sort_unstable();
        let mut moves = Vec::new();
        let mut next = 0;
        loop {
            while self.end > 0 && self.entities[self.end - 1].is_none() {
                self.end -= 1;
            }
            let Some(&to) = free.get(next) else {
                break;
            };
            if to >= self.end {
                break;
            }
            next += 1;
            let from = self.end - 1;
            for (_, column) in &mut self.columns {
                column.move_row(from, to);
            }
            self.rekey_staged(from, to);
            if let Some(entity) = self.entities[from].take() {
                self.entities[to] = Some(entity);
                moves.push(RowMove { entity, from, to });
            }
            self.end -= 1;
        }
        moves
    }

    /// Append all of `source`'s rows after this container's rows.
    ///
    /// Both containers are compacted first so the copy is one contiguous
    /// block per column. `source` is left empty. Returns `None` (and moves
    /// nothing) if the component sets differ.
    pub fn absorb(&mut self, source: &mut Archetype) -> Option<AbsorbResult> {
        if self.component_set != source.component_set {
            return None;
        }
        let compacted_target = self.compact();
        let compacted_source = source.compact();

        let start = self.end;
        let count = source.end;
        self.grow_capacity(start + count);
        for ((dst_id, dst), (src_id, src)) in self.columns.iter_mut().zip(&mut source.columns) {
            debug_assert_eq!(dst_id, src_id);
            let copied = src.transfer_block(0..count, dst.as_mut(), start);
            debug_assert!(copied, "column types diverged for equal component sets");
        }

        let mut moved = Vec::with_capacity(count);
        for row in 0..count {
            if let Some(entity) = source.entities[row].take() {
                self.entities[start + row] = Some(entity);
                moved.push(RowMove {
                    entity,
                    from: row,
                    to: start + row,
                });
            }
        }
        for ((row, ty), slot) in std::mem::take(&mut source.staged_additions) {
            self.staged_additions.insert((row + start, ty), slot);
        }
        for (row, ty) in std::mem::take(&mut source.staged_removals) {
            self.staged_removals.insert((row + start, ty));
        }

        self.end = start + count;
        self.len += source.len;
        source.len = 0;
        source.end = 0;

        Some(AbsorbResult {
            compacted_target,
            compacted_source,
            start,
            moved,
        })
    }

    /// Add a default-filled column for `info`. Returns `false` if the column
    /// already exists.
    pub fn add_column(&mut self, info: &ComponentInfo) -> bool {
        match self.columns.binary_search_by_key(&info.id, |(id, _)| *id) {
            Ok(_) => false,
            Err(pos) => {
                self.columns
                    .insert(pos, (info.id, info.create_column(self.capacity)));
                self.component_set.add(info.id);
                true
            }
        }
    }

    /// Move the columns out for a kernel run. Must be followed by
    /// [`restore_columns`](Self::restore_columns).
    pub(crate) fn lend_columns(&mut self) -> LentColumns {
        std::mem::take(&mut self.columns)
            .into_iter()
            .map(|(id, column)| (id, RefCell::new(column)))
            .collect()
    }

    pub(crate) fn restore_columns(&mut self, lent: LentColumns) {
        self.columns = lent
            .into_iter()
            .map(|(id, cell)| (id, cell.into_inner()))
            .collect();
    }

    // -- staged changes ------------------------------------------------------

    /// Classify the `(row, component)` cell.
    pub fn cell_state(&self, row: usize, component: ComponentTypeId) -> CellState {
        if self.has_column(component) {
            if self.staged_removals.contains(&(row, component)) {
                CellState::StagedForRemoval
            } else {
                CellState::Present
            }
        } else if let Some(&slot) = self.staged_additions.get(&(row, component)) {
            CellState::StagedForAddition(slot)
        } else {
            CellState::Absent
        }
    }

    pub(crate) fn stage_addition(
        &mut self,
        row: usize,
        component: ComponentTypeId,
        slot: ScratchSlot,
    ) {
        self.staged_additions.insert((row, component), slot);
    }

    pub(crate) fn stage_removal(&mut self, row: usize, component: ComponentTypeId) {
        self.staged_removals.insert((row, component));
    }

    /// Drop a staged removal. Returns `true` if one was pending.
    pub(crate) fn cancel_removal(&mut self, row: usize, component: ComponentTypeId) -> bool {
        self.staged_removals.remove(&(row, component))
    }

    /// Drop a staged addition. Returns its slot if one was pending.
    pub(crate) fn cancel_addition(
        &mut self,
        row: usize,
        component: ComponentTypeId,
    ) -> Option<ScratchSlot> {
        self.staged_additions.remove(&(row, component))
    }

    /// Types staged for addition on `row`.
    pub(crate) fn staged_additions_for(&self, row: usize) -> Vec<ComponentTypeId> {
        self.staged_additions
            .range((row, ComponentTypeId(0))..=(row, ComponentTypeId(u32::MAX)))
            .map(|((_, ty), _)| *ty)
            .collect()
    }

    /// Types held in columns on `row` that are not staged for removal.
    pub(crate) fn held_types_for(&self, row: usize) -> Vec<ComponentTypeId> {
        self.component_set
            .iter()
            .filter(|ty| !self.staged_removals.contains(&(row, *ty)))
            .collect()
    }

    /// Forget every staged entry on `row`.
    fn purge_row(&mut self, row: usize) {
        self.staged_additions.retain(|(r, _), _| *r != row);
        self.staged_removals.retain(|(r, _)| *r != row);
    }

    fn rekey_staged(&mut self, from: usize, to: usize) {
        let additions: Vec<_> = self
            .staged_additions
            .range((from, ComponentTypeId(0))..=(from, ComponentTypeId(u32::MAX)))
            .map(|(&(_, ty), &slot)| (ty, slot))
            .collect();
        for (ty, slot) in additions {
            self.staged_additions.remove(&(from, ty));
            self.staged_additions.insert((to, ty), slot);
        }
        let removals: Vec<_> = self
            .staged_removals
            .range((from, ComponentTypeId(0))..=(from, ComponentTypeId(u32::MAX)))
            .map(|&(_, ty)| ty)
            .collect();
        for ty in removals {
            self.staged_removals.remove(&(from, ty));
            self.staged_removals.insert((to, ty));
        }
    }

    /// Whether any `(row, type)` change is waiting for a flush.
    pub fn has_staged(&self) -> bool {
        !self.staged_additions.is_empty() || !self.staged_removals.is_empty()
    }

    /// Drain all staged entries, grouped by row in ascending order.
    pub(crate) fn take_staged(&mut self) -> BTreeMap<usize, RowChanges> {
        let mut rows: BTreeMap<usize, RowChanges> = BTreeMap::new();
        for ((row, ty), slot) in std::mem::take(&mut self.staged_additions) {
            rows.entry(row).or_default().added.push((ty, slot));
        }
        for (row, ty) in std::mem::take(&mut self.staged_removals) {
            rows.entry(row).or_default().removed.push(ty);
        }
        rows
    }
}

/// Outcome of [`Archetype::absorb`].
#[derive(Debug, Default)]
pub struct AbsorbResult {
    /// Rows moved while compacting the absorbing container.
    pub compacted_target: Vec<RowMove>,
    /// Rows moved while compacting the absorbed container, before the copy.
    pub compacted_source: Vec<RowMove>,
    /// First row in the absorbing container that received source rows.
    pub start: usize,
    /// Source rows relocated into the absorbing container.
    pub moved: Vec<RowMove>,
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("components", &self.component_set)
            .field("len", &self.len)
            .field("end", &self.end)
            .field("capacity", &self.capacity)
            .field("free_rows", &self.free_rows.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ArchetypeTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    generation: u32,
    archetype: Option<Archetype>,
}

/// Arena of archetype containers with generation-checked addressing.
#[derive(Debug, Default)]
pub struct ArchetypeTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ArchetypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the archetype built by `build` under a fresh id.
    pub fn insert_with(&mut self, build: impl FnOnce(ArchetypeId) -> Archetype) -> ArchetypeId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    archetype: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ArchetypeId::new(index, slot.generation);
        slot.archetype = Some(build(id));
        self.live += 1;
        id
    }

    /// Remove and return the archetype. Its id never resolves again.
    pub fn remove(&mut self, id: ArchetypeId) -> Option<Archetype> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let archetype = slot.archetype.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(archetype)
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.archetype.as_ref())
    }

    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.archetype.as_mut())
    }

    /// Two distinct archetypes mutably at once.
    pub fn get2_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> Option<(&mut Archetype, &mut Archetype)> {
        if a.index == b.index {
            return None;
        }
        let (lo, hi, swapped) = if a.index < b.index {
            (a, b, false)
        } else {
            (b, a, true)
        };
        let (left, right) = self.slots.split_at_mut(hi.index as usize);
        let lo_slot = left
            .get_mut(lo.index as usize)
            .filter(|s| s.generation == lo.generation)?;
        let hi_slot = right
            .first_mut()
            .filter(|s| s.generation == hi.generation)?;
        let lo_arch = lo_slot.archetype.as_mut()?;
        let hi_arch = hi_slot.archetype.as_mut()?;
        if swapped {
            Some((hi_arch, lo_arch))
        } else {
            Some((lo_arch, hi_arch))
        }
    }

    pub fn contains(&self, id: ArchetypeId) -> bool {
        self.get(id).is_some()
    }

    /// Live archetype ids in slot order.
    pub fn ids(&self) -> Vec<ArchetypeId> {
        self.iter().map(Archetype::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Archetype> + '_ {
        self.slots.iter().filter_map(|slot| slot.archetype.as_ref())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pos(i32);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Vel(i32);

    fn setup() -> (ComponentRegistry, ComponentTypeId, ComponentTypeId) {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("pos");
        let v = reg.register::<Vel>("vel");
        (reg, p, v)
    }

    fn archetype(reg: &ComponentRegistry, types: &[ComponentTypeId], cap: usize) -> Archetype {
        let infos: Vec<&ComponentInfo> = types.iter().map(|t| reg.get_info(*t).unwrap()).collect();
        Archetype::new(ArchetypeId::new(0, 0), &infos, cap)
    }

    fn fill(arch: &mut Archetype, pos: ComponentTypeId, n: u32) -> Vec<usize> {
        (0..n)
            .map(|i| {
                let row = arch.add_row(Entity::new(i, 1));
                *arch.get_mut::<Pos>(row, pos).unwrap() = Pos(i as i32);
                row
            })
            .collect()
    }

    #[test]
    fn add_row_grows_by_doubling() {
        let (reg, p, _) = setup();
        let mut arch = archetype(&reg, &[p], 2);
        fill(&mut arch, p, 5);
        assert_eq!(arch.len(), 5);
        assert_eq!(arch.end(), 5);
        assert_eq!(arch.capacity(), 8);
        assert_eq!(arch.get::<Pos>(4, p), Some(&Pos(4)));
    }

    #[test]
    fn removing_top_row_retracts_end() {
        let (reg, p, _) = setup();
        let mut arch = archetype(&reg, &[p], 4);
        fill(&mut arch, p, 3);
        assert_eq!(arch.remove_row(2), Some(Entity::new(2, 1)));
        assert_eq!(arch.end(), 2);
        assert!(!arch.has_free_rows());
    }

    #[test]
    fn removing_inner_row_queues_it_for_reuse() {
        let (reg, p, _) = setup();
        let mut arch = archetype(&reg, &[p], 4);
        fill(&mut arch, p, 3);
        arch.remove_row(0);
        assert!(arch.has_free_rows());
        assert_eq!(arch.get::<Pos>(0, p), Some(&Pos::default()));
        let row = arch.add_row(Entity::new(9, 1));
        assert_eq!(row, 0);
        assert_eq!(arch.end(), 3);
    }

    #[test]
    fn compact_moves_top_rows_into_holes() {
        let (reg, p, _) = setup();
        let mut arch = archetype(&reg, &[p], 8);
        fill(&mut arch, p, 6);
        arch.remove_row(1);
        arch.remove_row(3);

        let moves = arch.compact();
        assert_eq!(
            moves,
            vec![
                RowMove {
                    entity: Entity::new(5, 1),
                    from: 5,
                    to: 1
                },
                RowMove {
                    entity: Entity::new(4, 1),
                    from: 4,
                    to: 3
                },
            ]
        );
        assert_eq!(arch.end(), 4);
        assert_eq!(arch.len(), 4);
        assert!(!arch.has_free_rows());
        let values: Vec<i32> = (0..4).map(|r| arch.get::<Pos>(r, p).unwrap().0).collect();
        assert_eq!(values, vec![0, 5, 2, 4]);
    }

    #[test]
    fn compact_collapses_holes_at_the_top() {
        let (reg, p, _) = setup();
        let mut arch = archetype(&reg, &[p], 8);
        fill(&mut arch, p, 4);
        arch.remove_row(2);
        arch.remove_row(3);
        // Row 3 retracted the mark, row 2 sits in the queue above nothing.
        assert!(arch.compact().is_empty());
        assert_eq!(arch.end(), 2);
        assert!(!arch.has_free_rows());
    }

    #[test]
    fn absorb_appends_block_after_target_rows() {
        let (reg, p, _) = setup();
        let mut target = archetype(&reg, &[p], 2);
        let mut source = archetype(&reg, &[p], 4);
        fill(&mut target, p, 2);
        fill(&mut source, p, 3);
        source.remove_row(0);

        let result = target.absorb(&mut source).unwrap();
        assert_eq!(result.start, 2);
        assert_eq!(result.compacted_source.len(), 1);
        assert_eq!(result.moved.len(), 2);
        assert_eq!(target.len(), 4);
        assert_eq!(target.end(), 4);
        assert!(source.is_empty());
        let values: Vec<i32> = (0..4).map(|r| target.get::<Pos>(r, p).unwrap().0).collect();
        assert_eq!(values, vec![0, 1, 2, 1]);
    }

    #[test]
    fn absorb_rejects_different_sets_without_touching_either() {
        let (reg, p, v) = setup();
        let mut a = archetype(&reg, &[p], 4);
        let mut b = archetype(&reg, &[p, v], 4);
        fill(&mut a, p, 3);
        fill(&mut b, p, 3);
        a.remove_row(0);
        b.remove_row(0);

        assert!(a.absorb(&mut b).is_none());
        for arch in [&a, &b] {
            assert_eq!(arch.len(), 2);
            assert_eq!(arch.end(), 3);
            assert!(arch.has_free_rows(), "no compaction on a rejected merge");
            assert_eq!(arch.get::<Pos>(2, p), Some(&Pos(2)));
        }
    }

    #[test]
    fn cell_states_are_distinguished() {
        let (reg, p, v) = setup();
        let mut arch = archetype(&reg, &[p], 2);
        let row = arch.add_row(Entity::new(0, 1));
        assert_eq!(arch.cell_state(row, p), CellState::Present);
        assert_eq!(arch.cell_state(row, v), CellState::Absent);

        let slot = ScratchSlot::new(v, 0);
        arch.stage_addition(row, v, slot);
        arch.stage_removal(row, p);
        assert_eq!(arch.cell_state(row, p), CellState::StagedForRemoval);
        assert_eq!(arch.cell_state(row, v), CellState::StagedForAddition(slot));

        assert!(arch.cancel_removal(row, p));
        assert_eq!(arch.cancel_addition(row, v), Some(slot));
        assert!(!arch.has_staged());
    }

    #[test]
    fn take_staged_groups_by_row() {
        let (reg, p, v) = setup();
        let mut arch = archetype(&reg, &[p], 4);
        let r0 = arch.add_row(Entity::new(0, 1));
        let r1 = arch.add_row(Entity::new(1, 1));
        arch.stage_addition(r1, v, ScratchSlot::new(v, 0));
        arch.stage_removal(r0, p);
        arch.stage_removal(r1, p);

        let staged = arch.take_staged();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[&r0].removed, vec![p]);
        assert_eq!(staged[&r1].added.len(), 1);
        assert!(!arch.has_staged());
    }

    #[test]
    fn add_column_extends_component_set() {
        let (reg, p, v) = setup();
        let mut arch = archetype(&reg, &[p], 4);
        arch.add_row(Entity::new(0, 1));
        assert!(arch.add_column(reg.get_info(v).unwrap()));
        assert!(!arch.add_column(reg.get_info(v).unwrap()));
        assert!(arch.component_set().contains(v));
        assert_eq!(arch.get::<Vel>(0, v), Some(&Vel::default()));
    }

    #[test]
    fn table_rejects_stale_ids() {
        let (reg, p, v) = setup();
        let mut table = ArchetypeTable::new();
        let infos = [reg.get_info(p).unwrap()];
        let a = table.insert_with(|id| Archetype::new(id, &infos, 4));
        assert!(table.remove(a).is_some());
        let b = table.insert_with(|id| Archetype::new(id, &infos, 4));
        assert_eq!(a.index(), b.index());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());

        let infos2 = [reg.get_info(v).unwrap()];
        let c = table.insert_with(|id| Archetype::new(id, &infos2, 4));
        let (bb, cc) = table.get2_mut(b, c).unwrap();
        assert_eq!(bb.id(), b);
        assert_eq!(cc.id(), c);
        let (cc, bb) = table.get2_mut(c, b).unwrap();
        assert_eq!(bb.id(), b);
        assert_eq!(cc.id(), c);
        assert_eq!(table.len(), 2);
    }
}
