//! Type-indexed singleton values shared by a scene and its kernels.
//!
//! Each Rust type may hold at most one global. Kernels reach globals through
//! the [`Global`](crate::kernel::Global) and
//! [`GlobalMut`](crate::kernel::GlobalMut) parameters; for the duration of a
//! run the store is lent out as [`LentGlobals`], which checks borrows per
//! entry.

use std::any::{Any, TypeId};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;

use crate::EcsError;

struct GlobalEntry {
    name: &'static str,
    value: Box<dyn Any>,
}

/// Storage for at most one value per Rust type.
#[derive(Default)]
pub struct GlobalStore {
    entries: HashMap<TypeId, GlobalEntry>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`. Fails if a global of type `T` already exists.
    pub fn insert<T: 'static>(&mut self, value: T) -> Result<(), EcsError> {
        use std::collections::hash_map::Entry;
        match self.entries.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(EcsError::GlobalAlreadyPresent {
                name: std::any::type_name::<T>(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(GlobalEntry {
                    name: std::any::type_name::<T>(),
                    value: Box::new(value),
                });
                Ok(())
            }
        }
    }

    pub fn get<T: 'static>(&self) -> Result<&T, EcsError> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .ok_or_else(missing::<T>)
    }

    pub fn get_mut<T: 'static>(&mut self) -> Result<&mut T, EcsError> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_mut::<T>())
            .ok_or_else(missing::<T>)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Remove and return the global of type `T`.
    pub fn remove<T: 'static>(&mut self) -> Result<T, EcsError> {
        let entry = self
            .entries
            .remove(&TypeId::of::<T>())
            .ok_or_else(missing::<T>)?;
        entry
            .value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| missing::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every entry behind a `RefCell` for a kernel run.
    pub(crate) fn lend(&mut self) -> LentGlobals {
        LentGlobals {
            entries: std::mem::take(&mut self.entries)
                .into_iter()
                .map(|(ty, entry)| (ty, (entry.name, RefCell::new(entry.value))))
                .collect(),
        }
    }

    pub(crate) fn restore(&mut self, lent: LentGlobals) {
        self.entries = lent
            .entries
            .into_iter()
            .map(|(ty, (name, cell))| {
                (
                    ty,
                    GlobalEntry {
                        name,
                        value: cell.into_inner(),
                    },
                )
            })
            .collect();
    }
}

impl std::fmt::Debug for GlobalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(self.entries.values().map(|e| e.name))
            .finish()
    }
}

fn missing<T: 'static>() -> EcsError {
    EcsError::GlobalNotPresent {
        name: std::any::type_name::<T>(),
    }
}

/// Globals lent out for one kernel run.
pub(crate) struct LentGlobals {
    entries: HashMap<TypeId, (&'static str, RefCell<Box<dyn Any>>)>,
}

impl LentGlobals {
    /// Shared access to the global `T`. `Ok(None)` if it is absent.
    pub(crate) fn borrow<T: 'static>(&self) -> Result<Option<Ref<'_, T>>, ()> {
        let Some((_, cell)) = self.entries.get(&TypeId::of::<T>()) else {
            return Ok(None);
        };
        let guard = cell.try_borrow().map_err(|_| ())?;
        Ok(Ref::filter_map(guard, |b| b.downcast_ref::<T>()).ok())
    }

    /// Exclusive access to the global `T`. `Ok(None)` if it is absent.
    pub(crate) fn borrow_mut<T: 'static>(&self) -> Result<Option<RefMut<'_, T>>, ()> {
        let Some((_, cell)) = self.entries.get(&TypeId::of::<T>()) else {
            return Ok(None);
        };
        let guard = cell.try_borrow_mut().map_err(|_| ())?;
        Ok(RefMut::filter_map(guard, |b| b.downcast_mut::<T>()).ok())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Gravity(f32);

    #[test]
    fn insert_get_remove() {
        let mut store = GlobalStore::new();
        store.insert(Gravity(9.8)).unwrap();
        assert!(store.contains::<Gravity>());
        assert_eq!(store.get::<Gravity>().unwrap(), &Gravity(9.8));
        store.get_mut::<Gravity>().unwrap().0 = 1.6;
        assert_eq!(store.remove::<Gravity>().unwrap(), Gravity(1.6));
        assert!(!store.contains::<Gravity>());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut store = GlobalStore::new();
        store.insert(Gravity(1.0)).unwrap();
        let err = store.insert(Gravity(2.0)).unwrap_err();
        assert!(matches!(err, EcsError::GlobalAlreadyPresent { .. }));
        assert_eq!(store.get::<Gravity>().unwrap(), &Gravity(1.0));
    }

    #[test]
    fn missing_global_errors() {
        let mut store = GlobalStore::new();
        assert!(matches!(
            store.get::<Gravity>(),
            Err(EcsError::GlobalNotPresent { .. })
        ));
        assert!(store.remove::<Gravity>().is_err());
    }

    #[test]
    fn lent_globals_check_borrows() {
        let mut store = GlobalStore::new();
        store.insert(Gravity(3.0)).unwrap();
        let lent = store.lend();
        {
            let read = lent.borrow::<Gravity>().unwrap().unwrap();
            assert_eq!(read.0, 3.0);
            assert!(lent.borrow_mut::<Gravity>().is_err());
        }
        lent.borrow_mut::<Gravity>().unwrap().unwrap().0 = 4.0;
        assert!(lent.borrow::<u64>().unwrap().is_none());
        store.restore(lent);
        assert_eq!(store.get::<Gravity>().unwrap(), &Gravity(4.0));
    }
}
