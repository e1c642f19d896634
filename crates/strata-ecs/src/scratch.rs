//! Scratch storage for staged component values.
//!
//! A component added to an entity is written here first, because the archetype
//! that will eventually hold it is not known until the next flush. The owning
//! archetype records a [`ScratchSlot`] for the `(row, type)` cell; the flush
//! pass moves each value into its resolved column and then resets the whole
//! scratch area.

use std::collections::HashMap;

use crate::column::{downcast_slice, downcast_slice_mut, ColumnStorage};
use crate::component::{Component, ComponentInfo, ComponentTypeId};

/// Reference to a staged value in [`ScratchStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchSlot {
    component: ComponentTypeId,
    index: usize,
}

impl ScratchSlot {
    pub(crate) fn new(component: ComponentTypeId, index: usize) -> Self {
        Self { component, index }
    }

    #[inline]
    pub fn component(self) -> ComponentTypeId {
        self.component
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index
    }
}

struct ScratchColumn {
    column: Box<dyn ColumnStorage>,
    used: usize,
}

/// Per-type buffers of staged component values.
pub struct ScratchStorage {
    columns: HashMap<ComponentTypeId, ScratchColumn>,
    initial_capacity: usize,
}

impl ScratchStorage {
    /// Create storage whose per-type buffers start at `initial_capacity` slots.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            columns: HashMap::new(),
            initial_capacity: initial_capacity.max(1),
        }
    }

    /// Reserve a default-initialised slot for a value of `info`'s type.
    pub fn stage(&mut self, info: &ComponentInfo) -> ScratchSlot {
        let initial = self.initial_capacity;
        let entry = self
            .columns
            .entry(info.id)
            .or_insert_with(|| ScratchColumn {
                column: info.create_column(initial),
                used: 0,
            });
        if entry.used == entry.column.len() {
            let grown = (entry.column.len() * 2).max(1);
            entry.column.resize(grown);
        }
        let index = entry.used;
        entry.used += 1;
        ScratchSlot::new(info.id, index)
    }

    pub fn get<T: Component>(&self, slot: ScratchSlot) -> Option<&T> {
        let entry = self.columns.get(&slot.component)?;
        downcast_slice::<T>(entry.column.as_ref())?.get(slot.index)
    }

    pub fn get_mut<T: Component>(&mut self, slot: ScratchSlot) -> Option<&mut T> {
        let entry = self.columns.get_mut(&slot.component)?;
        downcast_slice_mut::<T>(entry.column.as_mut())?.get_mut(slot.index)
    }

    /// Move the staged value into `dst[dst_row]`.
    pub fn transfer(&mut self, slot: ScratchSlot, dst: &mut dyn ColumnStorage, dst_row: usize) -> bool {
        match self.columns.get_mut(&slot.component) {
            Some(entry) if slot.index < entry.used => {
                entry.column.transfer_row(slot.index, dst, dst_row)
            }
            _ => false,
        }
    }

    /// Number of slots handed out since the last reset.
    pub fn staged_count(&self) -> usize {
        self.columns.values().map(|c| c.used).sum()
    }

    /// Drop every staged value and make all slots available again.
    pub fn reset(&mut self) {
        for entry in self.columns.values_mut() {
            for index in 0..entry.used {
                entry.column.reset_row(index);
            }
            entry.used = 0;
        }
    }
}

impl std::fmt::Debug for ScratchStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchStorage")
            .field("types", &self.columns.len())
            .field("staged", &self.staged_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TypedColumn;
    use crate::component::ComponentRegistry;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Tag(String);

    #[test]
    fn stage_grows_past_initial_capacity() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Tag>("tag");
        let info = reg.get_info(id).unwrap();
        let mut scratch = ScratchStorage::new(2);

        let slots: Vec<_> = (0..5).map(|_| scratch.stage(info)).collect();
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.index(), i);
            *scratch.get_mut::<Tag>(*slot).unwrap() = Tag(format!("t{i}"));
        }
        assert_eq!(scratch.get::<Tag>(slots[4]), Some(&Tag("t4".into())));
        assert_eq!(scratch.staged_count(), 5);
    }

    #[test]
    fn transfer_moves_value_and_reset_recycles_slots() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Tag>("tag");
        let info = reg.get_info(id).unwrap();
        let mut scratch = ScratchStorage::new(4);

        let slot = scratch.stage(info);
        *scratch.get_mut::<Tag>(slot).unwrap() = Tag("moved".into());
        let mut dst = TypedColumn::<Tag>::with_rows(2);
        assert!(scratch.transfer(slot, &mut dst, 1));
        assert_eq!(dst.as_slice()[1], Tag("moved".into()));

        scratch.reset();
        assert_eq!(scratch.staged_count(), 0);
        assert!(!scratch.transfer(slot, &mut dst, 0));
        assert_eq!(scratch.stage(info).index(), 0);
    }
}
