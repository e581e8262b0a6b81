//! Chunk memory and the chunk arena.
//!
//! A chunk is one fixed-size block holding the entity id array at offset 0
//! followed by one array per owned component type. Chunks live in an arena
//! and are addressed by `(size class, slot)` handles.

use std::{
    alloc::Layout,
    fmt,
    ops::Range,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{entity::Entity, group::GroupId};

/// Chunk size for groups with rows up to 32 bytes.
pub const SMALL_CHUNK_SIZE: usize = 4 * 1024;
/// Chunk size for groups with rows up to 128 bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
/// Chunk size for everything else.
pub const LARGE_CHUNK_SIZE: usize = 256 * 1024;
/// Alignment of chunk memory; also the largest supported component alignment.
pub const CHUNK_ALIGN: usize = 64;
/// Rows per chunk the size class selection aims for.
pub const TARGET_ROWS_PER_CHUNK: usize = 128;

/// Spare blocks kept per size class for reuse.
const MAX_SPARE_CHUNKS: usize = 8;

/// Chunk size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkClass {
    Small,
    Default,
    Large,
}

impl ChunkClass {
    /// Pick the smallest class that fits the target row count.
    #[must_use]
    pub const fn for_row_size(row_size: usize) -> Self {
        if row_size * TARGET_ROWS_PER_CHUNK <= SMALL_CHUNK_SIZE {
            Self::Small
        } else if row_size * TARGET_ROWS_PER_CHUNK <= DEFAULT_CHUNK_SIZE {
            Self::Default
        } else {
            Self::Large
        }
    }

    /// Total bytes of a chunk of this class.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Small => SMALL_CHUNK_SIZE,
            Self::Default => DEFAULT_CHUNK_SIZE,
            Self::Large => LARGE_CHUNK_SIZE,
        }
    }

    const fn pool(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Default => 1,
            Self::Large => 2,
        }
    }
}

/// Handle to a chunk in a storage's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle {
    class: ChunkClass,
    slot: u32,
}

impl ChunkHandle {
    #[must_use]
    pub const fn new(class: ChunkClass, slot: u32) -> Self {
        Self { class, slot }
    }

    #[must_use]
    pub const fn class(self) -> ChunkClass {
        self.class
    }

    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({:?}#{})", self.class, self.slot)
    }
}

/// A contiguous run of rows in one chunk. Never owns memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkView {
    pub chunk: ChunkHandle,
    pub start: u32,
    pub count: u32,
}

impl ChunkView {
    #[must_use]
    pub const fn new(chunk: ChunkHandle, start: u32, count: u32) -> Self {
        Self {
            chunk,
            start,
            count,
        }
    }

    /// One past the last row.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start + self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn rows(&self) -> Range<usize> {
        self.start as usize..self.end() as usize
    }

    /// Split into `[start, start + at)` and the remainder.
    #[must_use]
    pub fn split_at(&self, at: u32) -> (Self, Self) {
        let at = at.min(self.count);
        (
            Self::new(self.chunk, self.start, at),
            Self::new(self.chunk, self.start + at, self.count - at),
        )
    }
}

/// One aligned block of chunk memory.
struct ChunkMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory owned by exactly one ChunkMemory; the
// component types stored in it are Send + Sync
unsafe impl Send for ChunkMemory {}
unsafe impl Sync for ChunkMemory {}

impl ChunkMemory {
    fn new(class: ChunkClass) -> Self {
        let layout = Layout::from_size_align(class.size(), CHUNK_ALIGN)
            .unwrap_or_else(|_| unreachable!("chunk sizes are valid layouts"));

        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }
}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A chunk: its memory plus bookkeeping.
///
/// Component data is read and written through raw pointers from
/// [`Chunk::data_ptr`]; the storage guarantees rows `[0, count)` of every
/// owned type are initialized.
pub(crate) struct Chunk {
    memory: ChunkMemory,
    pub group: GroupId,
    pub count: u32,
    pub capacity: u32,
    /// Position of this chunk in its group's chunk list.
    pub group_slot: u32,
    /// Last write timestamp per owned type slot of the group.
    timestamps: Box<[AtomicU32]>,
}

impl Chunk {
    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    /// Pointer to byte `offset` of the block.
    pub fn data_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.memory.layout.size());
        // SAFETY: offset is inside the block
        unsafe { self.memory.ptr.as_ptr().add(offset) }
    }

    pub fn entities_ptr(&self) -> *mut Entity {
        self.memory.ptr.as_ptr().cast::<Entity>()
    }

    /// Entity ids of rows `[0, count)`.
    pub fn entities(&self) -> &[Entity] {
        // SAFETY: the first `count` ids are initialized
        unsafe { std::slice::from_raw_parts(self.entities_ptr(), self.count as usize) }
    }

    pub fn timestamp(&self, slot: usize) -> u32 {
        self.timestamps[slot].load(Ordering::Acquire)
    }

    /// Raise the write timestamp of a type slot.
    pub fn stamp(&self, slot: usize, timestamp: u32) {
        self.timestamps[slot].fetch_max(timestamp, Ordering::AcqRel);
    }

    pub fn stamp_all(&self, timestamp: u32) {
        for stamp in &self.timestamps {
            stamp.fetch_max(timestamp, Ordering::AcqRel);
        }
    }

    pub fn class(&self) -> ChunkClass {
        match self.memory.layout.size() {
            SMALL_CHUNK_SIZE => ChunkClass::Small,
            DEFAULT_CHUNK_SIZE => ChunkClass::Default,
            _ => ChunkClass::Large,
        }
    }
}

#[derive(Default)]
struct ChunkPool {
    slots: Vec<Option<Chunk>>,
    free_slots: Vec<u32>,
    spare: Vec<ChunkMemory>,
}

/// Owner of every chunk in a storage.
#[derive(Default)]
pub(crate) struct ChunkArena {
    pools: [ChunkPool; 3],
}

impl ChunkArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty chunk for a group.
    pub fn allocate(
        &mut self,
        class: ChunkClass,
        group: GroupId,
        capacity: u32,
        type_slots: usize,
    ) -> ChunkHandle {
        let pool = &mut self.pools[class.pool()];
        let memory = pool.spare.pop().unwrap_or_else(|| ChunkMemory::new(class));
        let chunk = Chunk {
            memory,
            group,
            count: 0,
            capacity,
            group_slot: 0,
            timestamps: (0..type_slots).map(|_| AtomicU32::new(0)).collect(),
        };
        tracing::trace!(?class, ?group, capacity, "allocated chunk");
        self.insert(chunk)
    }

    /// Free a chunk, keeping its memory for reuse.
    pub fn release(&mut self, handle: ChunkHandle) {
        let chunk = self.take(handle);
        let pool = &mut self.pools[handle.class.pool()];
        if pool.spare.len() < MAX_SPARE_CHUNKS {
            pool.spare.push(chunk.memory);
        }
        tracing::trace!(?handle, "released chunk");
    }

    /// Remove a chunk from the arena without freeing its memory.
    pub fn take(&mut self, handle: ChunkHandle) -> Chunk {
        let pool = &mut self.pools[handle.class.pool()];
        let chunk = pool.slots[handle.slot as usize]
            .take()
            .unwrap_or_else(|| panic!("stale chunk handle {handle:?}"));
        pool.free_slots.push(handle.slot);
        chunk
    }

    /// Put a chunk into the arena.
    pub fn insert(&mut self, chunk: Chunk) -> ChunkHandle {
        let class = chunk.class();
        let pool = &mut self.pools[class.pool()];
        let slot = if let Some(slot) = pool.free_slots.pop() {
            pool.slots[slot as usize] = Some(chunk);
            slot
        } else {
            pool.slots.push(Some(chunk));
            (pool.slots.len() - 1) as u32
        };
        ChunkHandle::new(class, slot)
    }

    pub fn get(&self, handle: ChunkHandle) -> &Chunk {
        self.pools[handle.class.pool()].slots[handle.slot as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale chunk handle {handle:?}"))
    }

    pub fn get_mut(&mut self, handle: ChunkHandle) -> &mut Chunk {
        self.pools[handle.class.pool()].slots[handle.slot as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("stale chunk handle {handle:?}"))
    }

    pub fn try_get(&self, handle: ChunkHandle) -> Option<&Chunk> {
        self.pools[handle.class.pool()]
            .slots
            .get(handle.slot as usize)?
            .as_ref()
    }

    /// Drop every spare block.
    pub fn trim(&mut self) {
        for pool in &mut self.pools {
            pool.spare.clear();
        }
    }

    pub fn clear(&mut self) {
        self.pools = Default::default();
    }
}
