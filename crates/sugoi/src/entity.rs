//! Entity handles with packed id/version and the id allocator.
//!
//! A handle is a single `u32`: the low 24 bits index the entity slot and the
//! high 8 bits carry a version that changes every time the slot is recycled,
//! so stale handles can be told apart from live ones.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::chunk::ChunkHandle;

/// Number of bits used for the entity id.
pub const ENTITY_ID_BITS: u32 = 24;

const ID_MASK: u32 = (1 << ENTITY_ID_BITS) - 1;
const VERSION_MASK: u32 = 0xFF;

/// A packed entity handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct Entity(u32);

impl Entity {
    /// The null handle. Never refers to a live entity.
    pub const NULL: Self = Self(u32::MAX);

    /// Reserved version for transient handles. Recycling skips it, and a
    /// freed transient handle retires its slot instead of returning it to
    /// the free list.
    pub const TRANSIENT_VERSION: u8 = 0xFF;

    /// Largest id a live entity can use (`0x00FF_FFFF` is taken by `NULL`).
    pub const MAX_ID: u32 = ID_MASK - 1;

    /// Create a handle from an id and a version.
    ///
    /// Only the low 24 bits of `id` are kept.
    #[must_use]
    pub const fn new(id: u32, version: u8) -> Self {
        Self((id & ID_MASK) | ((version as u32) << ENTITY_ID_BITS))
    }

    /// Get the entity's slot id.
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0 & ID_MASK
    }

    /// Get the entity's version.
    #[must_use]
    pub const fn version(self) -> u8 {
        ((self.0 >> ENTITY_ID_BITS) & VERSION_MASK) as u8
    }

    /// Check if this is the null handle.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Check if this handle carries the transient version.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        !self.is_null() && self.version() == Self::TRANSIENT_VERSION
    }

    /// The handle the slot will hand out next time it is reused.
    #[must_use]
    pub const fn recycle(self) -> Self {
        let mut version = self.version().wrapping_add(1);
        if version == Self::TRANSIENT_VERSION {
            version = 0;
        }
        Self::new(self.id(), version)
    }

    /// Get the raw packed value.
    #[must_use]
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Create a handle from a raw packed value.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.id(), self.version())
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id(), self.version())
    }
}

/// Rewrites entity references stored inside component data.
///
/// Used when copying a set of prefabs, merging storages, or packing ids.
pub trait EntityMapper {
    /// Replace `entity` with its mapped handle, if it has one.
    fn map(&mut self, entity: &mut Entity);
}

impl<F: FnMut(&mut Entity)> EntityMapper for F {
    fn map(&mut self, entity: &mut Entity) {
        self(entity);
    }
}

/// Where a live entity's row is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    pub chunk: ChunkHandle,
    pub row: u32,
}

#[derive(Clone, Copy)]
struct Slot {
    version: u8,
    location: Option<EntityLocation>,
}

/// Id allocator and id -> location index.
#[derive(Default)]
pub(crate) struct EntityRegistry {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    alive: usize,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle. The caller must set its location.
    pub fn alloc(&mut self) -> Entity {
        self.alive += 1;

        if let Some(id) = self.free_list.pop() {
            return Entity::new(id, self.slots[id as usize].version);
        }

        let id = self.slots.len() as u32;
        assert!(id <= Entity::MAX_ID, "entity id space exhausted");
        self.slots.push(Slot {
            version: 0,
            location: None,
        });
        Entity::new(id, 0)
    }

    /// Release a live handle.
    ///
    /// Returns `false` if the handle was not live.
    pub fn free(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = &mut self.slots[entity.id() as usize];
        slot.location = None;
        self.alive -= 1;

        if entity.is_transient() {
            // Retired: the slot keeps the transient version and is never reused.
            return true;
        }

        slot.version = entity.recycle().version();
        self.free_list.push(entity.id());
        true
    }

    /// Mark an exact handle as live, growing the slot table as needed.
    ///
    /// The free list is stale afterwards; call [`Self::rebuild_free_list`]
    /// once all handles are claimed.
    pub fn claim(&mut self, entity: Entity, location: EntityLocation) -> bool {
        if entity.is_null() || entity.id() > Entity::MAX_ID {
            return false;
        }

        let id = entity.id() as usize;
        if id >= self.slots.len() {
            self.slots.resize(
                id + 1,
                Slot {
                    version: 0,
                    location: None,
                },
            );
        }

        let slot = &mut self.slots[id];
        if slot.location.is_some() {
            return false;
        }
        slot.version = entity.version();
        slot.location = Some(location);
        self.alive += 1;
        true
    }

    /// Rebuild the free list from the slot table, lowest ids handed out first.
    pub fn rebuild_free_list(&mut self) {
        self.free_list = self
            .slots
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, slot)| {
                slot.location.is_none() && slot.version != Entity::TRANSIENT_VERSION
            })
            .map(|(id, _)| id as u32)
            .collect();
    }

    /// Replace the whole table with a dense one, `locations[i]` belonging to id `i`.
    pub fn rebuild_dense(&mut self, locations: &[EntityLocation]) {
        self.slots = locations
            .iter()
            .map(|&location| Slot {
                version: 0,
                location: Some(location),
            })
            .collect();
        self.free_list.clear();
        self.alive = locations.len();
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.location(entity).is_some()
    }

    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if entity.is_null() {
            return None;
        }
        let slot = self.slots.get(entity.id() as usize)?;
        if slot.version != entity.version() {
            return None;
        }
        slot.location
    }

    /// Update the location of a live entity.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        let slot = &mut self.slots[entity.id() as usize];
        debug_assert_eq!(slot.version, entity.version(), "stale entity {entity:?}");
        slot.location = Some(location);
    }

    pub const fn alive_count(&self) -> usize {
        self.alive
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.alive = 0;
    }
}
