//! Typed component access over chunk views.
//!
//! Reads take `&Storage`, writes take `&mut Storage` and raise the chunk's
//! write timestamp for the touched type. The `*_unchecked` family is for the
//! job scheduler, which proves exclusivity through its own dependency graph
//! and stamps written chunks once a job finishes.

use std::{
    ops::Deref,
    slice,
    sync::atomic::{
        AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16, AtomicU32,
        AtomicU64, AtomicUsize,
    },
};

use crate::{
    array::{self, ArrayMut},
    chunk::{Chunk, ChunkHandle, ChunkView},
    entity::Entity,
    group::{Group, TypeSlot},
    storage::{Storage, row_ptr},
    type_registry::TypeIndex,
};

/// Meta chains deeper than this are treated as missing.
const MAX_META_DEPTH: usize = 16;

mod sealed {
    pub trait Sealed {}
}

/// A std atomic that a column of its plain value type can be viewed as.
pub trait AtomicComponent: sealed::Sealed + Send + Sync + 'static {
    /// The type stored in the column.
    type Value: 'static;
}

macro_rules! atomic_component {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $atomic {}

            impl AtomicComponent for $atomic {
                type Value = $value;
            }
        )*
    };
}

atomic_component! {
    AtomicBool => bool,
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
    AtomicI8 => i8,
    AtomicI16 => i16,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicIsize => isize,
}

/// Mutable storage access handed to structural-change callbacks.
///
/// Dereferences to [`Storage`] for reads.
pub struct ViewAccess<'a> {
    storage: &'a mut Storage,
}

impl<'a> ViewAccess<'a> {
    pub(crate) fn new(storage: &'a mut Storage) -> Self {
        Self { storage }
    }

    pub fn component_mut<T: 'static>(&mut self, view: ChunkView, ty: TypeIndex) -> Option<&mut [T]> {
        self.storage.component_mut(view, ty)
    }

    pub fn get_mut<T: 'static>(&mut self, entity: Entity, ty: TypeIndex) -> Option<&mut T> {
        self.storage.get_mut(entity, ty)
    }

    pub fn array_mut<T: 'static>(&mut self, entity: Entity, ty: TypeIndex) -> Option<ArrayMut<'_, T>> {
        self.storage.array_mut(entity, ty)
    }
}

impl Deref for ViewAccess<'_> {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        self.storage
    }
}

impl Storage {
    /// Entity ids of a view, empty if the view is out of bounds.
    #[must_use]
    pub fn entities(&self, view: ChunkView) -> &[Entity] {
        if !self.is_valid_view(view) {
            return &[];
        }
        &self.arena.get(view.chunk).entities()[view.rows()]
    }

    /// Owned component column of a view, `None` if the group lacks the type.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the type registered under `ty`.
    #[must_use]
    pub fn component<T: 'static>(&self, view: ChunkView, ty: TypeIndex) -> Option<&[T]> {
        let (chunk, _, slot) = self.locate(view, ty)?;
        slot.check::<T>(false);
        let ptr = row_ptr(chunk, slot, view.start as usize).cast::<T>();
        // SAFETY: the rows are live and the type was checked
        Some(unsafe { slice::from_raw_parts(ptr, view.count as usize) })
    }

    /// Mutable owned component column of a view.
    ///
    /// Raises the chunk's write timestamp for `ty`.
    #[must_use]
    pub fn component_mut<T: 'static>(&mut self, view: ChunkView, ty: TypeIndex) -> Option<&mut [T]> {
        let (chunk, index, slot) = self.locate(view, ty)?;
        slot.check::<T>(false);
        chunk.stamp(index, self.timestamp);
        let ptr = row_ptr(chunk, slot, view.start as usize).cast::<T>();
        // SAFETY: the rows are live, the type was checked and `&mut self`
        // makes the borrow exclusive
        Some(unsafe { slice::from_raw_parts_mut(ptr, view.count as usize) })
    }

    /// Component of one entity, owned or reached through meta entities.
    #[must_use]
    pub fn get<T: 'static>(&self, entity: Entity, ty: TypeIndex) -> Option<&T> {
        self.get_recursive(entity, ty, 0)
    }

    /// Owned component of one entity.
    #[must_use]
    pub fn get_mut<T: 'static>(&mut self, entity: Entity, ty: TypeIndex) -> Option<&mut T> {
        let view = self.access(entity)?;
        self.component_mut::<T>(view, ty)?.first_mut()
    }

    /// Shared component of a view's group, found on its meta entities.
    #[must_use]
    pub fn shared<T: 'static>(&self, view: ChunkView, ty: TypeIndex) -> Option<&T> {
        let group = self.group_ref(self.arena.try_get(view.chunk)?.group);
        self.shared_in(group, ty, 0)
    }

    /// Array component of one entity.
    #[must_use]
    pub fn array<T: 'static>(&self, entity: Entity, ty: TypeIndex) -> Option<&[T]> {
        let view = self.access(entity)?;
        let (chunk, _, slot) = self.locate(view, ty)?;
        slot.check::<T>(true);
        // SAFETY: the row holds a live array of T
        Some(unsafe { array::array_slice::<T>(row_ptr(chunk, slot, view.start as usize)) })
    }

    /// Mutable array component of one entity.
    #[must_use]
    pub fn array_mut<T: 'static>(&mut self, entity: Entity, ty: TypeIndex) -> Option<ArrayMut<'_, T>> {
        let view = self.access(entity)?;
        let (chunk, index, slot) = self.locate(view, ty)?;
        slot.check::<T>(true);
        chunk.stamp(index, self.timestamp);
        let capacity = slot.array_capacity.unwrap_or_default();
        // SAFETY: the row holds a live array of T, borrowed exclusively
        Some(unsafe { ArrayMut::from_raw(row_ptr(chunk, slot, view.start as usize), capacity) })
    }

    /// Last write timestamp of a type in a chunk.
    #[must_use]
    pub fn chunk_timestamp(&self, chunk: ChunkHandle, ty: TypeIndex) -> Option<u32> {
        let chunk = self.arena.try_get(chunk)?;
        let index = self.group_ref(chunk.group).slot_index(ty)?;
        Some(chunk.timestamp(index))
    }

    /// Raise the write timestamp of a type in a chunk to the current timestamp.
    pub fn mark_written(&self, chunk: ChunkHandle, ty: TypeIndex) {
        let Some(chunk) = self.arena.try_get(chunk) else {
            return;
        };
        if let Some(index) = self.group_ref(chunk.group).slot_index(ty) {
            chunk.stamp(index, self.timestamp);
        }
    }

    /// Untyped pointer to the first row of a view's column.
    #[must_use]
    pub fn component_ptr(&self, view: ChunkView, ty: TypeIndex) -> Option<*mut u8> {
        let (chunk, _, slot) = self.locate(view, ty)?;
        Some(row_ptr(chunk, slot, view.start as usize))
    }

    /// Mutable column through a shared storage borrow. Does not stamp.
    ///
    /// # Safety
    ///
    /// No other reference to these rows of `ty` may exist while the returned
    /// slice is alive.
    #[must_use]
    pub unsafe fn component_unchecked_mut<T: 'static>(&self, view: ChunkView, ty: TypeIndex) -> Option<&mut [T]> {
        let (chunk, _, slot) = self.locate(view, ty)?;
        slot.check::<T>(false);
        let ptr = row_ptr(chunk, slot, view.start as usize).cast::<T>();
        Some(unsafe { slice::from_raw_parts_mut(ptr, view.count as usize) })
    }

    /// Column of `A::Value` viewed as its atomic counterpart.
    ///
    /// # Safety
    ///
    /// No `&mut` or plain `&` to these rows may exist while the slice is alive.
    ///
    /// # Panics
    ///
    /// Panics if the stored type is not `A::Value`, or if the platform aligns
    /// `A` more strictly than the column.
    #[must_use]
    pub unsafe fn component_atomic<A: AtomicComponent>(&self, view: ChunkView, ty: TypeIndex) -> Option<&[A]> {
        let (chunk, _, slot) = self.locate(view, ty)?;
        slot.check::<A::Value>(false);
        assert!(
            std::mem::size_of::<A>() == slot.size && std::mem::align_of::<A>() <= slot.align,
            "component {ty:?} accessed atomically as {}",
            std::any::type_name::<A>()
        );
        let ptr = row_ptr(chunk, slot, view.start as usize).cast::<A>();
        Some(unsafe { slice::from_raw_parts(ptr, view.count as usize) })
    }

    /// Owned component of any entity through a shared storage borrow.
    ///
    /// # Safety
    ///
    /// Same as [`Storage::component_unchecked_mut`].
    #[must_use]
    pub unsafe fn get_unchecked_mut<T: 'static>(&self, entity: Entity, ty: TypeIndex) -> Option<&mut T> {
        let view = self.access(entity)?;
        unsafe { self.component_unchecked_mut::<T>(view, ty) }?.first_mut()
    }

    fn locate(&self, view: ChunkView, ty: TypeIndex) -> Option<(&Chunk, usize, &TypeSlot)> {
        if !self.is_valid_view(view) {
            return None;
        }
        let chunk = self.arena.get(view.chunk);
        let group = self.group_ref(chunk.group);
        let index = group.slot_index(ty)?;
        Some((chunk, index, &group.slots()[index]))
    }

    fn get_recursive<T: 'static>(&self, entity: Entity, ty: TypeIndex, depth: usize) -> Option<&T> {
        let view = self.access(entity)?;
        if let Some(column) = self.component::<T>(view, ty) {
            return column.first();
        }
        let group = self.group_ref(self.arena.get(view.chunk).group);
        self.shared_in(group, ty, depth + 1)
    }

    fn shared_in<T: 'static>(&self, group: &Group, ty: TypeIndex, depth: usize) -> Option<&T> {
        if depth > MAX_META_DEPTH || !group.has(ty) {
            return None;
        }
        group
            .meta()
            .iter()
            .find_map(|&meta| self.get_recursive(meta, ty, depth))
    }
}
