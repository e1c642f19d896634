//! Entity handles and the location registry.
//!
//! An [`Entity`] is a 64-bit handle that packs a *version* counter in the
//! high 32 bits and an *id* in the low 32 bits. The [`EntityRegistry`] keeps
//! one slot per id holding the entity's current [`EntityLocation`] and the
//! version that is currently valid for that id. Versions are bumped every time
//! an id is released, so outstanding handles to a deleted entity are rejected
//! forever after. Version `0` is never issued.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A versioned entity handle.
///
/// Layout: `[version: u32 | id: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// A handle that never resolves (version 0 is never issued).
    pub const NULL: Entity = Entity(0);

    /// Construct an `Entity` from an id and version.
    #[inline]
    pub fn new(id: u32, version: u32) -> Self {
        Self((version as u64) << 32 | id as u64)
    }

    /// The id portion (low 32 bits).
    #[inline]
    pub fn id(self) -> u32 {
        self.0 as u32
    }

    /// The version portion (high 32 bits).
    #[inline]
    pub fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.id(), self.version())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id(), self.version())
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where a live entity's components are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    /// `None` while the id sits in the free queue.
    location: Option<EntityLocation>,
    version: u32,
}

/// Id/version table mapping entity handles to their current location.
///
/// Free ids are kept in a FIFO queue so that versions are spread out over
/// time rather than concentrated on a hot id.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    slots: Vec<Slot>,
    free_ids: VecDeque<u32>,
    live: usize,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with room for `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_ids: VecDeque::new(),
            live: 0,
        }
    }

    /// Issue a handle stored at `location`.
    ///
    /// A released id is reused (with the version it was given on release)
    /// before any new id is created.
    pub fn register(&mut self, location: EntityLocation) -> Entity {
        self.live += 1;
        if let Some(id) = self.free_ids.pop_front() {
            let slot = &mut self.slots[id as usize];
            slot.location = Some(location);
            Entity::new(id, slot.version)
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Slot {
                location: Some(location),
                version: 1,
            });
            Entity::new(id, 1)
        }
    }

    /// Release `entity`, invalidating every outstanding copy of the handle.
    ///
    /// Returns the entity's last location so the caller can reclaim the row.
    pub fn unregister(&mut self, entity: Entity) -> Result<EntityLocation, EcsError> {
        let location = self.try_resolve(entity)?;
        let slot = &mut self.slots[entity.id() as usize];
        slot.location = None;
        slot.version = match slot.version.wrapping_add(1) {
            0 => 1,
            v => v,
        };
        self.free_ids.push_back(entity.id());
        self.live -= 1;
        Ok(location)
    }

    /// Record that the entity with `id` now lives at `(archetype, row)`.
    ///
    /// Ids that are not currently live are ignored.
    pub fn move_to(&mut self, id: u32, archetype: ArchetypeId, row: usize) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if slot.location.is_some() {
                slot.location = Some(EntityLocation { archetype, row });
            }
        }
    }

    /// Current location of `entity`, or [`EcsError::EntityNotFound`] for a
    /// stale or never-issued handle.
    pub fn try_resolve(&self, entity: Entity) -> Result<EntityLocation, EcsError> {
        self.slots
            .get(entity.id() as usize)
            .filter(|slot| slot.version == entity.version())
            .and_then(|slot| slot.location)
            .ok_or(EcsError::EntityNotFound { entity })
    }

    /// Returns `true` if `entity` is a currently valid handle.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.try_resolve(entity).is_ok()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// All live entities with their locations, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, EntityLocation)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            slot.location
                .map(|loc| (Entity::new(id as u32, slot.version), loc))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
