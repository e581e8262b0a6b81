//! The per-batch context handed to ECS job bodies.

use std::cell::RefCell;

use smallvec::SmallVec;
use sugoi::{AccessMode, AtomicComponent, ChunkView, Entity, Parameter, Parameters, Storage, TypeIndex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Borrow {
    Shared,
    Exclusive,
    /// Inside an [`TaskContext::update`] closure.
    Random,
}

/// Access to one batch of a query's rows.
///
/// Columns can only be fetched in the mode the query declared. A column
/// borrowed with [`TaskContext::write`] stays exclusively borrowed for the
/// rest of the task, so fetching it again panics.
pub struct TaskContext<'a> {
    storage: &'a Storage,
    params: &'a Parameters,
    view: ChunkView,
    task_index: usize,
    entity_index: usize,
    borrows: RefCell<SmallVec<[(TypeIndex, Borrow); 8]>>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        storage: &'a Storage,
        params: &'a Parameters,
        view: ChunkView,
        task_index: usize,
        entity_index: usize,
    ) -> Self {
        Self {
            storage,
            params,
            view,
            task_index,
            entity_index,
            borrows: RefCell::new(SmallVec::new()),
        }
    }

    #[must_use]
    pub const fn view(&self) -> ChunkView {
        self.view
    }

    #[must_use]
    pub fn entities(&self) -> &'a [Entity] {
        self.storage.entities(self.view)
    }

    /// Check if an entity is alive. Touches no component data.
    #[must_use]
    pub fn exist(&self, entity: Entity) -> bool {
        self.storage.exist(entity)
    }

    /// Index of this batch within its job.
    #[must_use]
    pub const fn task_index(&self) -> usize {
        self.task_index
    }

    /// Position of the batch's first row among all rows the job visits.
    #[must_use]
    pub const fn entity_index(&self) -> usize {
        self.entity_index
    }

    /// Read a column. `None` if the parameter is optional and the group lacks it.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared or is already borrowed for writing.
    pub fn read<T: 'static>(&self, ty: TypeIndex) -> Option<&'a [T]> {
        self.declared(ty, "read");
        self.borrow(ty, Borrow::Shared);
        self.storage.component::<T>(self.view, ty)
    }

    /// Write a column.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared read-write or is already borrowed.
    #[allow(clippy::mut_from_ref)]
    pub fn write<T: 'static>(&self, ty: TypeIndex) -> Option<&'a mut [T]> {
        let param = self.declared(ty, "write");
        assert!(
            param.access == AccessMode::ReadWrite,
            "component {ty:?} written but declared {:?}",
            param.access
        );
        self.borrow(ty, Borrow::Exclusive);
        // SAFETY: the scheduler orders every other job touching (storage, ty)
        // around this one, batches cover disjoint rows, and the borrow table
        // rejects a second fetch of this column within the task
        unsafe { self.storage.component_unchecked_mut::<T>(self.view, ty) }
    }

    /// A column viewed through its atomic wrapper, such as `AtomicU32` for `u32`.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared atomic or is not stored as `A::Value`.
    pub fn atomic<A: AtomicComponent>(&self, ty: TypeIndex) -> Option<&'a [A]> {
        let param = self.declared(ty, "atomic");
        assert!(
            param.access == AccessMode::Atomic,
            "component {ty:?} accessed atomically but declared {:?}",
            param.access
        );
        self.borrow(ty, Borrow::Shared);
        // SAFETY: atomic jobs only run alongside other atomic jobs on this
        // type, and nobody holds `&mut` to an atomically accessed column
        unsafe { self.storage.component_atomic::<A>(self.view, ty) }
    }

    /// Shared component from the batch's meta entities.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared.
    pub fn shared<T: 'static>(&self, ty: TypeIndex) -> Option<&'a T> {
        self.declared(ty, "shared");
        self.borrow(ty, Borrow::Shared);
        self.storage.shared::<T>(self.view, ty)
    }

    /// Read a component of any entity, owned or shared through meta entities.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared with random access, is declared
    /// atomic, or is borrowed for writing.
    pub fn get<T: 'static>(&self, entity: Entity, ty: TypeIndex) -> Option<&'a T> {
        let param = self.declared(ty, "get");
        assert!(
            param.random_access && param.access != AccessMode::Atomic,
            "component {ty:?} read randomly but declared {:?} without random access",
            param.access
        );
        self.borrow(ty, Borrow::Shared);
        self.storage.get::<T>(entity, ty)
    }

    /// Mutate a component of any entity.
    ///
    /// The type must be declared read-write with random access; the job then
    /// runs its batches one after another.
    ///
    /// # Panics
    ///
    /// Panics if the type was not declared that way, or on a nested update of
    /// the same type.
    pub fn update<T: 'static, R>(&self, entity: Entity, ty: TypeIndex, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let param = self.declared(ty, "update");
        assert!(
            param.access == AccessMode::ReadWrite && param.random_access,
            "component {ty:?} updated randomly but declared {:?} without random access",
            param.access
        );
        self.borrow(ty, Borrow::Random);
        // SAFETY: the job is the only one touching (storage, ty), its batches
        // run sequentially and the borrow entry rejects re-entrant updates
        let value = unsafe { self.storage.get_unchecked_mut::<T>(entity, ty) };
        let result = value.map(f);
        self.release(ty, Borrow::Random);

        if let Some(view) = self.storage.access(entity) {
            self.storage.mark_written(view.chunk, ty);
        }
        result
    }

    fn declared(&self, ty: TypeIndex, what: &str) -> Parameter {
        match self.params.get(ty) {
            Some(param) => *param,
            None => panic!("component {ty:?} used in {what} but not declared by the query"),
        }
    }

    fn borrow(&self, ty: TypeIndex, kind: Borrow) {
        let mut borrows = self.borrows.borrow_mut();
        match borrows.iter().find(|(t, _)| *t == ty) {
            Some(&(_, held)) => assert!(
                held == Borrow::Shared && kind == Borrow::Shared,
                "component {ty:?} borrowed as {kind:?} while borrowed as {held:?}"
            ),
            None => borrows.push((ty, kind)),
        }
    }

    fn release(&self, ty: TypeIndex, kind: Borrow) {
        self.borrows
            .borrow_mut()
            .retain(|(t, held)| !(*t == ty && *held == kind));
    }
}

impl std::fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("view", &self.view)
            .field("task_index", &self.task_index)
            .field("entity_index", &self.entity_index)
            .finish_non_exhaustive()
    }
}
