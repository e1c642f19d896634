//! Dirty-row tracking per component type.
//!
//! A [`ComponentObserver`] watches one component type across every archetype.
//! For each archetype it is in one of two states:
//!
//! - **fully dirty**: no record exists. Anything may have changed, so a
//!   changed-only query must scan the whole archetype.
//! - **tracked**: an explicit set of rows changed since the last clear.
//!
//! Dirty marks follow entities when they migrate between archetypes or are
//! moved by compaction and merging.

use std::collections::{BTreeSet, HashMap};

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;

#[derive(Debug, Clone)]
pub struct ComponentObserver {
    component: ComponentTypeId,
    tracked: HashMap<ArchetypeId, BTreeSet<usize>>,
}

impl ComponentObserver {
    pub fn new(component: ComponentTypeId) -> Self {
        Self {
            component,
            tracked: HashMap::new(),
        }
    }

    /// The observed component type.
    pub fn component(&self) -> ComponentTypeId {
        self.component
    }

    /// Dirty rows of `archetype`, or `None` if it is fully dirty.
    ///
    /// A fully dirty archetype becomes tracked (with an empty set) as a side
    /// effect, so changes after the caller's full scan accumulate from empty.
    pub fn dirty_rows(&mut self, archetype: ArchetypeId) -> Option<&BTreeSet<usize>> {
        use std::collections::hash_map::Entry;
        match self.tracked.entry(archetype) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(entry) => {
                entry.insert(BTreeSet::new());
                None
            }
        }
    }

    /// Dirty rows of `archetype` without registering it, or `None` if it is
    /// fully dirty.
    pub fn tracked_rows(&self, archetype: ArchetypeId) -> Option<&BTreeSet<usize>> {
        self.tracked.get(&archetype)
    }

    /// Whether `archetype` currently has an explicit record.
    pub fn is_tracked(&self, archetype: ArchetypeId) -> bool {
        self.tracked.contains_key(&archetype)
    }

    /// Start accumulating changes for `archetype` from empty.
    pub fn clear(&mut self, archetype: ArchetypeId) {
        self.tracked.entry(archetype).or_default().clear();
    }

    /// Mark `row` dirty. A fully dirty archetype stays fully dirty.
    pub fn mark_changed_or_added(&mut self, archetype: ArchetypeId, row: usize) {
        if let Some(rows) = self.tracked.get_mut(&archetype) {
            rows.insert(row);
        }
    }

    /// Reset `archetype` to fully dirty.
    pub fn mark_all_changed(&mut self, archetype: ArchetypeId) {
        self.tracked.remove(&archetype);
    }

    /// Carry the dirty state of `(old_archetype, old_row)` to
    /// `(new_archetype, new_row)`.
    ///
    /// Only an explicit mark is carried. A row leaving a fully dirty
    /// archetype leaves the destination untouched, and a fully dirty
    /// destination stays fully dirty.
    pub fn on_row_moved(
        &mut self,
        old_archetype: ArchetypeId,
        old_row: usize,
        new_archetype: ArchetypeId,
        new_row: usize,
    ) {
        let was_dirty = match self.tracked.get_mut(&old_archetype) {
            Some(rows) => rows.remove(&old_row),
            None => false,
        };
        if was_dirty {
            self.mark_changed_or_added(new_archetype, new_row);
        }
    }

    /// Drop any dirty mark for a vacated row.
    pub fn on_row_deleted(&mut self, archetype: ArchetypeId, row: usize) {
        if let Some(rows) = self.tracked.get_mut(&archetype) {
            rows.remove(&row);
        }
    }

    /// Carry marks for a block of `count` rows copied from the start of
    /// `source` to `target` at `start`.
    ///
    /// A fully dirty source marks the whole block dirty in a tracked target.
    pub fn transplant_block(
        &mut self,
        source: ArchetypeId,
        target: ArchetypeId,
        start: usize,
        count: usize,
    ) {
        let moved = self.tracked.remove(&source);
        let Some(rows) = self.tracked.get_mut(&target) else {
            return;
        };
        match moved {
            None => rows.extend(start..start + count),
            Some(dirty) => rows.extend(dirty.into_iter().filter(|r| *r < count).map(|r| r + start)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
