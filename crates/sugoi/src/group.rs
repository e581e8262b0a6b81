//! Groups - families of entities with the same [`EntityType`].
//!
//! A group owns the chunk list and the per-type layout shared by every chunk
//! in it. Full chunks are kept in front of the first chunk with free rows so
//! allocation always fills the first partially-full chunk.

use std::{any::TypeId, fmt, mem};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    chunk::{ChunkArena, ChunkClass, ChunkHandle},
    entity::Entity,
    type_registry::{TypeCallbacks, TypeDescription, TypeIndex},
    type_set::{EntityType, TypeSet},
};

/// Unique identifier for a group within a storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u32);

impl GroupId {
    /// Create a group ID from a raw value.
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

bitflags! {
    /// Cached properties of a group's type set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GroupFlags: u8 {
        const HAS_PINNED = 1 << 0;
        const DEAD = 1 << 1;
        const DISABLED = 1 << 2;
        const PREFAB = 1 << 3;
    }
}

/// Layout and callbacks of one owned type inside a group's chunks.
#[derive(Clone)]
pub(crate) struct TypeSlot {
    pub ty: TypeIndex,
    /// Byte offset of the type's array from the chunk start.
    pub offset: usize,
    pub size: usize,
    pub align: usize,
    pub callbacks: TypeCallbacks,
    pub pinned: bool,
    pub array_capacity: Option<usize>,
    pub entity_fields: SmallVec<[u32; 4]>,
    pub type_id: Option<TypeId>,
    /// Rows may be written and read back as raw bytes.
    pub pod: bool,
}

impl TypeSlot {
    pub fn new(desc: &TypeDescription) -> Self {
        Self {
            ty: desc.index(),
            offset: 0,
            size: desc.size(),
            align: desc.alignment(),
            callbacks: *desc.callbacks(),
            pinned: desc.is_pinned(),
            array_capacity: desc.array_capacity(),
            entity_fields: desc.entity_fields().iter().copied().collect(),
            type_id: desc.type_id(),
            pod: desc.is_pod(),
        }
    }

    /// Check if rows of this type may hold entity references.
    pub fn has_entity_refs(&self) -> bool {
        self.callbacks.map.is_some() || !self.entity_fields.is_empty()
    }

    /// Panic unless `T` is the Rust type stored in this slot.
    pub fn check<T: 'static>(&self, array: bool) {
        let ok = match self.type_id {
            Some(id) => id == TypeId::of::<T>(),
            None => {
                !array && mem::size_of::<T>() == self.size && mem::align_of::<T>() <= self.align
            }
        };
        assert!(
            ok && self.array_capacity.is_some() == array,
            "component {:?} accessed as {}",
            self.ty,
            std::any::type_name::<T>()
        );
    }
}

/// Compute per-type offsets by descending alignment and return the row capacity.
///
/// The entity id array sits at offset 0.
pub(crate) fn compute_layout(slots: &mut [TypeSlot], chunk_size: usize) -> u32 {
    let row_size = mem::size_of::<Entity>() + slots.iter().map(|s| s.size).sum::<usize>();

    let mut order: SmallVec<[usize; 8]> = (0..slots.len()).collect();
    order.sort_by(|&a, &b| slots[b].align.cmp(&slots[a].align).then(a.cmp(&b)));

    let mut capacity = chunk_size / row_size;
    while capacity > 0 {
        let mut offset = mem::size_of::<Entity>() * capacity;
        for &i in &order {
            let slot = &mut slots[i];
            offset = offset.next_multiple_of(slot.align);
            slot.offset = offset;
            offset += slot.size * capacity;
        }
        if offset <= chunk_size {
            break;
        }
        capacity -= 1;
    }

    assert!(
        capacity > 0,
        "a row of {row_size} bytes does not fit in a {chunk_size} byte chunk"
    );
    capacity as u32
}

/// A group of entities sharing one [`EntityType`].
pub struct Group {
    id: GroupId,
    ty: EntityType,
    /// Types reachable through meta entities.
    shared: TypeSet,
    /// One slot per owned type, in `ty.types` order.
    slots: Vec<TypeSlot>,
    class: ChunkClass,
    capacity: u32,
    chunks: Vec<ChunkHandle>,
    /// Index of the first chunk with free rows.
    first_free: usize,
    size: usize,
    flags: GroupFlags,
}

impl Group {
    pub(crate) fn new(id: GroupId, ty: EntityType, mut slots: Vec<TypeSlot>, shared: TypeSet) -> Self {
        let row_size = mem::size_of::<Entity>() + slots.iter().map(|s| s.size).sum::<usize>();
        let class = ChunkClass::for_row_size(row_size);
        let capacity = compute_layout(&mut slots, class.size());

        let mut flags = GroupFlags::empty();
        if slots.iter().any(|s| s.pinned) {
            flags |= GroupFlags::HAS_PINNED;
        }
        for (tag, flag) in [
            (TypeIndex::DEAD, GroupFlags::DEAD),
            (TypeIndex::DISABLED, GroupFlags::DISABLED),
            (TypeIndex::PREFAB, GroupFlags::PREFAB),
        ] {
            if ty.types.contains(tag) {
                flags |= flag;
            }
        }

        Self {
            id,
            ty,
            shared,
            slots,
            class,
            capacity,
            chunks: Vec::new(),
            first_free: 0,
            size: 0,
            flags,
        }
    }

    #[must_use]
    pub const fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub const fn entity_type(&self) -> &EntityType {
        &self.ty
    }

    /// Types stored in this group's chunks.
    #[must_use]
    pub fn owned_types(&self) -> &[TypeIndex] {
        &self.ty.types
    }

    /// Types reachable through meta entities.
    #[must_use]
    pub fn shared_types(&self) -> &[TypeIndex] {
        &self.shared
    }

    #[must_use]
    pub fn meta(&self) -> &[Entity] {
        &self.ty.meta
    }

    /// Check if the type is stored in this group's chunks.
    #[must_use]
    pub fn owns(&self, ty: TypeIndex) -> bool {
        self.ty.types.contains(ty)
    }

    /// Check if the type is owned or shared.
    #[must_use]
    pub fn has(&self, ty: TypeIndex) -> bool {
        self.owns(ty) || self.shared.contains(ty)
    }

    #[must_use]
    pub fn has_components(&self, types: &[TypeIndex]) -> bool {
        types.iter().all(|&ty| self.has(ty))
    }

    /// Number of entities in the group.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn chunks(&self) -> &[ChunkHandle] {
        &self.chunks
    }

    /// Rows per chunk.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn chunk_class(&self) -> ChunkClass {
        self.class
    }

    #[must_use]
    pub const fn flags(&self) -> GroupFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.flags.contains(GroupFlags::DEAD)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.flags.contains(GroupFlags::DISABLED)
    }

    #[must_use]
    pub const fn is_prefab(&self) -> bool {
        self.flags.contains(GroupFlags::PREFAB)
    }

    #[must_use]
    pub const fn has_pinned(&self) -> bool {
        self.flags.contains(GroupFlags::HAS_PINNED)
    }

    /// Owned types that are pinned.
    #[must_use]
    pub fn pinned_types(&self) -> TypeSet {
        self.slots.iter().filter(|s| s.pinned).map(|s| s.ty).collect()
    }

    pub(crate) fn slots(&self) -> &[TypeSlot] {
        &self.slots
    }

    pub(crate) fn slot_index(&self, ty: TypeIndex) -> Option<usize> {
        self.ty.types.binary_search(&ty).ok()
    }

    pub(crate) fn slot(&self, ty: TypeIndex) -> Option<&TypeSlot> {
        self.slot_index(ty).map(|i| &self.slots[i])
    }

    pub(crate) fn set_shared(&mut self, shared: TypeSet) {
        self.shared = shared;
    }

    pub(crate) fn set_entity_type(&mut self, ty: EntityType) {
        self.ty = ty;
    }

    pub(crate) fn add_size(&mut self, n: usize) {
        self.size += n;
    }

    pub(crate) fn sub_size(&mut self, n: usize) {
        self.size -= n;
    }

    /// First chunk with free rows.
    pub(crate) fn free_chunk(&self) -> Option<ChunkHandle> {
        self.chunks.get(self.first_free).copied()
    }

    /// Chunks that still have free rows.
    pub(crate) fn free_chunks(&self) -> &[ChunkHandle] {
        &self.chunks[self.first_free..]
    }

    /// Append a chunk, placing it by fullness.
    pub(crate) fn push_chunk(&mut self, arena: &mut ChunkArena, handle: ChunkHandle) {
        self.chunks.push(handle);
        let index = self.chunks.len() - 1;
        arena.get_mut(handle).group_slot = index as u32;
        if arena.get(handle).is_full() {
            self.mark_full(arena, handle);
        }
    }

    /// Move a chunk that just became full in front of `first_free`.
    pub(crate) fn mark_full(&mut self, arena: &mut ChunkArena, handle: ChunkHandle) {
        let index = arena.get(handle).group_slot as usize;
        debug_assert!(index >= self.first_free, "chunk already marked full");
        self.swap_chunks(arena, index, self.first_free);
        self.first_free += 1;
    }

    /// Move a chunk that just lost rows behind `first_free`.
    pub(crate) fn mark_free(&mut self, arena: &mut ChunkArena, handle: ChunkHandle) {
        let index = arena.get(handle).group_slot as usize;
        debug_assert!(index < self.first_free, "chunk already marked free");
        self.first_free -= 1;
        self.swap_chunks(arena, index, self.first_free);
    }

    /// Remove an empty chunk from the list. The caller releases its memory.
    pub(crate) fn remove_chunk(&mut self, arena: &mut ChunkArena, handle: ChunkHandle) {
        let index = arena.get(handle).group_slot as usize;
        debug_assert!(index >= self.first_free, "removing a full chunk");
        self.chunks.swap_remove(index);
        if let Some(&moved) = self.chunks.get(index) {
            arena.get_mut(moved).group_slot = index as u32;
        }
    }

    /// Forget every chunk. The caller releases their memory.
    pub(crate) fn take_chunks(&mut self) -> Vec<ChunkHandle> {
        self.first_free = 0;
        self.size = 0;
        mem::take(&mut self.chunks)
    }

    fn swap_chunks(&mut self, arena: &mut ChunkArena, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.chunks.swap(a, b);
        arena.get_mut(self.chunks[a]).group_slot = a as u32;
        arena.get_mut(self.chunks[b]).group_slot = b as u32;
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("type", &self.ty)
            .field("shared", &self.shared)
            .field("len", &self.size)
            .field("chunks", &self.chunks.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{CHUNK_ALIGN, SMALL_CHUNK_SIZE};

    fn slot(ty: u32, size: usize, align: usize) -> TypeSlot {
        TypeSlot {
            ty: TypeIndex::from_raw(ty),
            offset: 0,
            size,
            align,
            callbacks: TypeCallbacks::default(),
            pinned: false,
            array_capacity: None,
            entity_fields: SmallVec::new(),
            type_id: None,
            pod: false,
        }
    }

    #[test]
    fn test_layout_by_descending_alignment() {
        let mut slots = vec![slot(3, 1, 1), slot(4, 16, 16), slot(5, 4, 4)];
        let capacity = compute_layout(&mut slots, SMALL_CHUNK_SIZE) as usize;

        // 4096 / (4 + 21) = 163 rows fit even after padding
        assert_eq!(capacity, 163);
        assert!(slots[1].offset < slots[2].offset);
        assert!(slots[2].offset < slots[0].offset);
        for s in &slots {
            assert_eq!(s.offset % s.align, 0);
            assert!(s.offset + s.size * capacity <= SMALL_CHUNK_SIZE);
        }
        assert!(slots[1].offset >= 4 * capacity);
    }

    #[test]
    fn test_layout_shrinks_for_padding() {
        let mut slots = vec![slot(3, 1, 1), slot(4, 8, 8)];
        let capacity = compute_layout(&mut slots, SMALL_CHUNK_SIZE) as usize;
        // 4096 / 13 = 315 rows, but padding the ids to 8 overflows by 3 bytes
        assert_eq!(capacity, 314);
        assert_eq!(slots[1].offset, 1256);
        assert_eq!(slots[0].offset, 1256 + 8 * 314);
    }

    #[test]
    fn test_max_alignment() {
        let mut slots = vec![slot(3, CHUNK_ALIGN, CHUNK_ALIGN)];
        let capacity = compute_layout(&mut slots, SMALL_CHUNK_SIZE) as usize;
        assert_eq!(capacity, 60);
        assert_eq!(slots[0].offset, 256);
    }

    #[test]
    fn test_tags_take_no_space() {
        let mut slots = vec![slot(0, 0, 1)];
        let capacity = compute_layout(&mut slots, SMALL_CHUNK_SIZE);
        assert_eq!(capacity, 1024);
    }

    #[test]
    fn test_group_flags() {
        let ty = EntityType::of(&[TypeIndex::DEAD, TypeIndex::from_raw(7)]);
        let mut pinned = slot(7, 4, 4);
        pinned.pinned = true;
        let group = Group::new(
            GroupId::from_raw(1),
            ty,
            vec![slot(0, 0, 1), pinned],
            TypeSet::new(),
        );
        assert!(group.is_dead());
        assert!(group.has_pinned());
        assert!(!group.is_prefab());
        assert_eq!(group.pinned_types().as_slice(), &[TypeIndex::from_raw(7)]);
        assert_eq!(group.chunk_class(), ChunkClass::Small);
    }
}
