//! Order-independent sets of component types.
//!
//! A [`ComponentSet`] is the key that identifies an archetype. The hash is the
//! XOR of a per-type mix, so it can be updated incrementally as types are added
//! or removed and does not depend on insertion order. Equal hashes do not imply
//! equal sets; equality always falls back to comparing membership.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::component::ComponentTypeId;

/// Spread a component id across 64 bits (splitmix64 finalizer).
#[inline]
fn mix(id: ComponentTypeId) -> u64 {
    let mut z = (id.index() as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// A canonical set of component types.
///
/// Members are kept sorted by [`ComponentTypeId`] so that iteration order is
/// deterministic and membership tests are a binary search.
#[derive(Clone, Default)]
pub struct ComponentSet {
    types: Vec<ComponentTypeId>,
    hash: u64,
}

impl ComponentSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from any iterator of types. Duplicates are ignored.
    pub fn from_types(types: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        let mut set = Self::new();
        for t in types {
            set.add(t);
        }
        set
    }

    /// Insert `id`. Returns `false` if it was already a member.
    pub fn add(&mut self, id: ComponentTypeId) -> bool {
        match self.types.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.types.insert(pos, id);
                self.hash ^= mix(id);
                true
            }
        }
    }

    /// Remove `id`. Returns `false` if it was not a member.
    pub fn remove(&mut self, id: ComponentTypeId) -> bool {
        match self.types.binary_search(&id) {
            Ok(pos) => {
                self.types.remove(pos);
                self.hash ^= mix(id);
                true
            }
            Err(_) => false,
        }
    }

    #[inline]
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.types.binary_search(&id).is_ok()
    }

    /// Whether every member of `other` is also a member of `self`.
    pub fn is_superset(&self, other: &[ComponentTypeId]) -> bool {
        other.iter().all(|t| self.contains(*t))
    }

    /// Whether `self` and `other` share any member.
    pub fn intersects(&self, other: &[ComponentTypeId]) -> bool {
        other.iter().any(|t| self.contains(*t))
    }

    pub fn clear(&mut self) {
        self.types.clear();
        self.hash = 0;
    }

    /// Immutable copy for use as a table key while `self` keeps being edited.
    pub fn snapshot(&self) -> ComponentSet {
        self.clone()
    }

    /// Members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.types.iter().copied()
    }

    pub fn as_slice(&self) -> &[ComponentTypeId] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The order-independent XOR hash.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    #[cfg(test)]
    fn with_forced_hash(types: Vec<ComponentTypeId>, hash: u64) -> Self {
        Self { types, hash }
    }
}

impl PartialEq for ComponentSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.types == other.types
    }
}

impl Eq for ComponentSet {}

impl Hash for ComponentSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types.iter()).finish()
    }
}

impl FromIterator<ComponentTypeId> for ComponentSet {
    fn from_iter<I: IntoIterator<Item = ComponentTypeId>>(iter: I) -> Self {
        Self::from_types(iter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
