//! Type-erased column storage.
//!
//! A column is a dense array holding one component type. Archetype containers
//! own one column per type in their component set, and the scene's scratch
//! storage keeps one per staged type. Columns are addressed through the
//! [`ColumnStorage`] trait object so that containers can move rows between
//! each other without knowing the concrete component types.
//!
//! Every row slot always holds a valid value: unused rows hold
//! `T::default()`, and moving a value out of a row leaves a default behind.

use std::any::Any;
use std::fmt;
use std::ops::Range;

use crate::component::Component;

// ---------------------------------------------------------------------------
// ColumnStorage
// ---------------------------------------------------------------------------

/// Type-erased operations over a single column.
pub trait ColumnStorage: Any {
    /// Number of row slots (the column's capacity).
    fn len(&self) -> usize;

    /// Whether the column has no row slots.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or shrink to exactly `rows` slots. New slots hold defaults.
    fn resize(&mut self, rows: usize);

    /// Reset `row` back to the default value, dropping what was there.
    fn reset_row(&mut self, row: usize);

    /// Move the value at `from` into `to` within this column. `from` is left
    /// holding a default value.
    fn move_row(&mut self, from: usize, to: usize);

    /// Move the value at `row` into `dst[dst_row]`.
    ///
    /// Returns `false` (and moves nothing) if `dst` stores a different type.
    fn transfer_row(&mut self, row: usize, dst: &mut dyn ColumnStorage, dst_row: usize) -> bool;

    /// Move the values in `rows` into `dst`, starting at `dst_start`.
    ///
    /// Returns `false` (and moves nothing) if `dst` stores a different type.
    fn transfer_block(
        &mut self,
        rows: Range<usize>,
        dst: &mut dyn ColumnStorage,
        dst_start: usize,
    ) -> bool;

    /// Name of the stored Rust type, for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Upcast for downcasting to [`TypedColumn`].
    fn as_any(&self) -> &dyn Any;

    /// Upcast for downcasting to [`TypedColumn`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn ColumnStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("type", &self.type_name())
            .field("rows", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TypedColumn
// ---------------------------------------------------------------------------

/// The concrete column behind a `Box<dyn ColumnStorage>`.
#[derive(Debug, Default)]
pub struct TypedColumn<T> {
    data: Vec<T>,
}

impl<T: Component> TypedColumn<T> {
    /// A column with `rows` default-initialised slots.
    pub fn with_rows(rows: usize) -> Self {
        let mut data = Vec::with_capacity(rows);
        data.resize_with(rows, T::default);
        Self { data }
    }

    /// All row slots, occupied or not.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// All row slots, occupied or not.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Value at `row`, if in bounds.
    #[inline]
    pub fn get(&self, row: usize) -> Option<&T> {
        self.data.get(row)
    }

    /// Mutable value at `row`, if in bounds.
    #[inline]
    pub fn get_mut(&mut self, row: usize) -> Option<&mut T> {
        self.data.get_mut(row)
    }
}

impl<T: Component> ColumnStorage for TypedColumn<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn resize(&mut self, rows: usize) {
        self.data.resize_with(rows, T::default);
    }

    fn reset_row(&mut self, row: usize) {
        self.data[row] = T::default();
    }

    fn move_row(&mut self, from: usize, to: usize) {
        if from != to {
            self.data[to] = std::mem::take(&mut self.data[from]);
        }
    }

    fn transfer_row(&mut self, row: usize, dst: &mut dyn ColumnStorage, dst_row: usize) -> bool {
        let Some(dst) = dst.as_any_mut().downcast_mut::<TypedColumn<T>>() else {
            return false;
        };
        dst.data[dst_row] = std::mem::take(&mut self.data[row]);
        true
    }

    fn transfer_block(
        &mut self,
        rows: Range<usize>,
        dst: &mut dyn ColumnStorage,
        dst_start: usize,
    ) -> bool {
        let Some(dst) = dst.as_any_mut().downcast_mut::<TypedColumn<T>>() else {
            return false;
        };
        for (offset, row) in rows.enumerate() {
            dst.data[dst_start + offset] = std::mem::take(&mut self.data[row]);
        }
        true
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Downcast a type-erased column to its concrete slice.
pub(crate) fn downcast_slice<T: Component>(column: &dyn ColumnStorage) -> Option<&[T]> {
    column
        .as_any()
        .downcast_ref::<TypedColumn<T>>()
        .map(TypedColumn::as_slice)
}

/// Downcast a type-erased column to its concrete mutable slice.
pub(crate) fn downcast_slice_mut<T: Component>(
    column: &mut dyn ColumnStorage,
) -> Option<&mut [T]> {
    column
        .as_any_mut()
        .downcast_mut::<TypedColumn<T>>()
        .map(TypedColumn::as_mut_slice)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
