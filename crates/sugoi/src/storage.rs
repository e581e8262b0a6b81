//! The entity storage: entity index, groups and structural changes.
//!
//! All component data lives in chunks owned by the storage's arena. Every
//! live entity maps to exactly one `(chunk, row)` and the chunk's entity
//! array at that row holds the entity back. Structural changes keep rows
//! `[0, count)` of each chunk dense by moving trailing rows into holes.

use std::{
    fmt,
    ops::Range,
    ptr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use hashbrown::HashMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    access::ViewAccess,
    chunk::{Chunk, ChunkArena, ChunkView},
    entity::{Entity, EntityLocation, EntityMapper, EntityRegistry},
    group::{Group, GroupId, TypeSlot},
    type_registry::{TypeIndex, TypeRegistry},
    type_set::{DeltaType, EntityType, MetaSet, TypeSet},
};

static NEXT_STORAGE_ID: AtomicU32 = AtomicU32::new(0);

/// Process-unique identifier of a storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(u32);

impl StorageId {
    /// Create a storage ID from a raw value.
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

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({})", self.0)
    }
}

/// Callback invoked with `(new_view, old_view)` while casting.
pub type CastCallback<'c> = dyn FnMut(&mut ViewAccess<'_>, ChunkView, ChunkView) + 'c;

/// The entity database.
pub struct Storage {
    pub(crate) id: StorageId,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) entities: EntityRegistry,
    pub(crate) groups: Vec<Option<Group>>,
    free_groups: Vec<u32>,
    group_index: HashMap<EntityType, GroupId, FxBuildHasher>,
    /// Groups that list an entity as meta.
    meta_users: FxHashMap<Entity, SmallVec<[GroupId; 4]>>,
    pub(crate) arena: ChunkArena,
    pub(crate) timestamp: u32,
    /// Bumped whenever the set of groups or their shared types change.
    pub(crate) epoch: u64,
}

impl Storage {
    /// Create an empty storage over a type registry.
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let id = StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(storage = ?id, "created storage");
        Self {
            id,
            registry,
            entities: EntityRegistry::new(),
            groups: Vec::new(),
            free_groups: Vec::new(),
            group_index: HashMap::default(),
            meta_users: FxHashMap::default(),
            arena: ChunkArena::new(),
            timestamp: 0,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> StorageId {
        self.id
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Current world timestamp used to stamp writes.
    #[must_use]
    pub const fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Advance the world timestamp, returning the new value.
    pub fn advance_timestamp(&mut self) -> u32 {
        self.timestamp = self.timestamp.wrapping_add(1);
        self.timestamp
    }

    /// Structural epoch; query caches are rebuilt when it changes.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of entities with a row, dead markers included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.as_raw() as usize)?.as_ref()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().flatten()
    }

    #[must_use]
    pub fn find_group(&self, ty: &EntityType) -> Option<GroupId> {
        self.group_index.get(ty).copied()
    }

    /// Group holding an entity.
    #[must_use]
    pub fn group_of(&self, entity: Entity) -> Option<GroupId> {
        let location = self.entities.location(entity)?;
        Some(self.arena.get(location.chunk).group)
    }

    #[must_use]
    pub fn entity_type(&self, entity: Entity) -> Option<&EntityType> {
        let id = self.group_of(entity)?;
        Some(self.group_ref(id).entity_type())
    }

    /// Check if an entity is live and not a dead marker.
    #[must_use]
    pub fn exist(&self, entity: Entity) -> bool {
        self.group_of(entity)
            .is_some_and(|id| !self.group_ref(id).is_dead())
    }

    /// Check if an entity was destroyed but still holds pinned components.
    #[must_use]
    pub fn is_dead(&self, entity: Entity) -> bool {
        self.group_of(entity)
            .is_some_and(|id| self.group_ref(id).is_dead())
    }

    /// Check that every meta entity of `ty` exists.
    #[must_use]
    pub fn validate_meta(&self, ty: &EntityType) -> bool {
        ty.meta.iter().all(|&meta| self.exist(meta))
    }

    /// Check that a view names a live chunk and stays inside its rows.
    #[must_use]
    pub fn is_valid_view(&self, view: ChunkView) -> bool {
        self.arena.try_get(view.chunk).is_some_and(|chunk| {
            view.start
                .checked_add(view.count)
                .is_some_and(|end| end <= chunk.count)
        })
    }

    /// Resolve one entity to a single-row view.
    #[must_use]
    pub fn access(&self, entity: Entity) -> Option<ChunkView> {
        let location = self.entities.location(entity)?;
        Some(ChunkView::new(location.chunk, location.row, 1))
    }

    /// Resolve many entities to views, merging rows that are adjacent in storage.
    ///
    /// Stale handles are skipped.
    #[must_use]
    pub fn batch(&self, entities: &[Entity]) -> Vec<ChunkView> {
        let mut views: Vec<ChunkView> = Vec::new();
        for &entity in entities {
            let Some(location) = self.entities.location(entity) else {
                continue;
            };
            match views.last_mut() {
                Some(last) if last.chunk == location.chunk && last.end() == location.row => {
                    last.count += 1;
                }
                _ => views.push(ChunkView::new(location.chunk, location.row, 1)),
            }
        }
        views
    }

    /// Find the group for an entity type, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the type set names an unregistered type.
    pub fn get_or_create_group(&mut self, ty: &EntityType) -> GroupId {
        if let Some(&id) = self.group_index.get(ty) {
            return id;
        }

        let slots: Vec<TypeSlot> = ty
            .types
            .iter()
            .map(|&index| TypeSlot::new(&self.registry.desc(index)))
            .collect();
        let shared = self.compute_shared(&ty.meta);

        let id = if let Some(raw) = self.free_groups.pop() {
            GroupId::from_raw(raw)
        } else {
            self.groups.push(None);
            GroupId::from_raw((self.groups.len() - 1) as u32)
        };

        let group = Group::new(id, ty.clone(), slots, shared);
        debug!(
            group = ?id,
            ty = ?ty,
            capacity = group.capacity(),
            class = ?group.chunk_class(),
            "created group"
        );

        self.groups[id.as_raw() as usize] = Some(group);
        self.group_index.insert(ty.clone(), id);
        for &meta in ty.meta.iter() {
            self.meta_users.entry(meta).or_default().push(id);
        }
        self.epoch += 1;
        id
    }

    /// Allocate `count` entities of a type.
    ///
    /// Fills the group's first partially-full chunk before opening new ones,
    /// default-constructs every component and calls `callback` once per
    /// contiguous view.
    pub fn allocate(
        &mut self,
        ty: &EntityType,
        count: u32,
        mut callback: impl FnMut(&mut ViewAccess<'_>, ChunkView),
    ) {
        if count == 0 {
            return;
        }
        debug_assert!(self.validate_meta(ty), "allocating with dead meta entities");

        let id = self.get_or_create_group(ty);
        let views = self.reserve_rows(id, count);
        for &view in &views {
            self.construct_view(view);
            self.write_new_entities(view);
        }
        trace!(group = ?id, count, "allocated entities");

        let mut access = ViewAccess::new(self);
        for view in views {
            callback(&mut access, view);
        }
    }

    /// Allocate `count` entities of a type and return their handles.
    pub fn allocate_entities(&mut self, ty: &EntityType, count: u32) -> Vec<Entity> {
        let mut entities = Vec::with_capacity(count as usize);
        self.allocate(ty, count, |access, view| {
            entities.extend_from_slice(access.entities(view));
        });
        entities
    }

    /// Create `count` copies of a prefab.
    ///
    /// The copies drop the `PREFAB` tag and every pinned component. A stale
    /// or dead prefab produces nothing.
    pub fn instantiate(
        &mut self,
        prefab: Entity,
        count: u32,
        mut callback: impl FnMut(&mut ViewAccess<'_>, ChunkView),
    ) {
        let views = self.instantiate_views(prefab, count);
        let mut access = ViewAccess::new(self);
        for view in views {
            callback(&mut access, view);
        }
    }

    /// Create `count` copies of a set of prefabs.
    ///
    /// Entity references between prefabs of the set are rewritten so that
    /// copy `i` of one prefab points at copy `i` of the other.
    pub fn instantiate_entities(
        &mut self,
        prefabs: &[Entity],
        count: u32,
        mut callback: impl FnMut(&mut ViewAccess<'_>, ChunkView),
    ) {
        let mut copies: Vec<Vec<Entity>> = Vec::with_capacity(prefabs.len());
        let mut views = Vec::new();
        for &prefab in prefabs {
            let prefab_views = self.instantiate_views(prefab, count);
            let mut list = Vec::with_capacity(count as usize);
            for view in &prefab_views {
                list.extend_from_slice(self.entities(*view));
            }
            copies.push(list);
            views.extend(prefab_views);
        }

        let index: FxHashMap<Entity, usize> =
            prefabs.iter().enumerate().map(|(i, &e)| (e, i)).collect();
        for copy in 0..count as usize {
            let mut mapper = |entity: &mut Entity| {
                if let Some(&i) = index.get(entity) {
                    if let Some(&mapped) = copies[i].get(copy) {
                        *entity = mapped;
                    }
                }
            };
            for list in &copies {
                if let Some(location) = list.get(copy).and_then(|&e| self.entities.location(e)) {
                    self.remap_rows(ChunkView::new(location.chunk, location.row, 1), &mut mapper);
                }
            }
        }

        let mut access = ViewAccess::new(self);
        for view in views {
            callback(&mut access, view);
        }
    }

    /// Destroy the entities of a view.
    ///
    /// Components are destructed and ids recycled. If the group has pinned
    /// components the entities are instead moved to a dead marker group that
    /// keeps only the pinned components. Destroying a dead marker is a no-op.
    pub fn destroy(&mut self, view: ChunkView) {
        if view.is_empty() || !self.is_valid_view(view) {
            return;
        }
        let id = self.arena.get(view.chunk).group;
        let group = self.group_ref(id);
        if group.is_dead() {
            return;
        }

        let touched = self.meta_entities_in(view);
        if group.has_pinned() {
            let mut types = group.pinned_types();
            types.insert(TypeIndex::DEAD);
            let dead = self.get_or_create_group(&EntityType::new(types, MetaSet::new()));
            self.cast_impl(view, dead, &mut |_, _, _| {});
            trace!(group = ?id, count = view.count, "entities left as dead markers");
        } else {
            self.release_view(view);
            trace!(group = ?id, count = view.count, "destroyed entities");
        }
        self.refresh_shared(&touched);
    }

    /// Destroy entities by handle. Stale handles are skipped.
    pub fn destroy_entities(&mut self, entities: &[Entity]) {
        for &entity in entities {
            // rows move after each destroy, so resolve one at a time
            if let Some(view) = self.access(entity) {
                self.destroy(view);
            }
        }
    }

    /// Move a view into the group `ty.apply(delta)`.
    pub fn cast_view_delta(
        &mut self,
        view: ChunkView,
        delta: &DeltaType,
        callback: impl FnMut(&mut ViewAccess<'_>, ChunkView, ChunkView),
    ) {
        if view.is_empty() || !self.is_valid_view(view) {
            return;
        }
        let src = self.arena.get(view.chunk).group;
        let ty = self.group_ref(src).entity_type().apply(delta);
        let dst = self.get_or_create_group(&ty);
        self.cast_view_group(view, dst, callback);
    }

    /// Move a view into another group.
    ///
    /// Components present in both groups are moved, added ones are
    /// default-constructed and removed ones destructed. `callback` receives
    /// `(new_view, old_view)` per batch while the old rows still hold the
    /// removed components.
    pub fn cast_view_group(
        &mut self,
        view: ChunkView,
        dst: GroupId,
        mut callback: impl FnMut(&mut ViewAccess<'_>, ChunkView, ChunkView),
    ) {
        if view.is_empty() || !self.is_valid_view(view) {
            return;
        }
        let src = self.arena.get(view.chunk).group;
        if src == dst {
            return;
        }

        let touched = self.meta_entities_in(view);
        if self.group_ref(src).is_dead() && !self.group_ref(dst).has_pinned() {
            // the last pinned component is gone, finish the destroy
            self.release_view(view);
        } else {
            self.cast_impl(view, dst, &mut callback);
        }
        self.refresh_shared(&touched);
    }

    /// Apply a delta to entities by handle. Stale handles are skipped.
    pub fn cast_entities(&mut self, entities: &[Entity], delta: &DeltaType) {
        for &entity in entities {
            if let Some(view) = self.access(entity) {
                self.cast_view_delta(view, delta, |_, _, _| {});
            }
        }
    }

    /// Move every entity of `source` into this storage.
    ///
    /// Entities get fresh ids here; references between them, including
    /// meta entities, are rewritten. `source` is left empty.
    ///
    /// # Panics
    ///
    /// Panics if the storages use different type registries.
    pub fn merge(&mut self, source: &mut Storage) {
        assert!(
            Arc::ptr_eq(&self.registry, &source.registry),
            "merging storages with different type registries"
        );

        let mut mapping: FxHashMap<Entity, Entity> = FxHashMap::default();
        for group in source.groups.iter().flatten() {
            for &handle in group.chunks() {
                for &entity in source.arena.get(handle).entities() {
                    mapping.insert(entity, self.entities.alloc());
                }
            }
        }

        let mut moved = Vec::new();
        for entry in &mut source.groups {
            let Some(mut group) = entry.take() else {
                continue;
            };
            let meta: MetaSet = group
                .meta()
                .iter()
                .map(|m| mapping.get(m).copied().unwrap_or(*m))
                .collect();
            let ty = EntityType::new(group.entity_type().types.clone(), meta);
            let dst = self.get_or_create_group(&ty);

            for handle in group.take_chunks() {
                let mut chunk = source.arena.take(handle);
                chunk.group = dst;
                let new_handle = self.arena.insert(chunk);
                let chunk = self.arena.get(new_handle);
                debug_assert_eq!(chunk.capacity, self.group_ref(dst).capacity());

                let ids = chunk.entities_ptr();
                for row in 0..chunk.count {
                    // SAFETY: rows below count hold initialized ids
                    let new = unsafe {
                        let old = ids.add(row as usize).read();
                        let new = mapping[&old];
                        ids.add(row as usize).write(new);
                        new
                    };
                    self.entities.set_location(
                        new,
                        EntityLocation {
                            chunk: new_handle,
                            row,
                        },
                    );
                }

                let count = chunk.count;
                let Self { groups, arena, .. } = self;
                let group = group_at_mut(groups, dst);
                group.push_chunk(arena, new_handle);
                group.add_size(count as usize);
                moved.push(ChunkView::new(new_handle, 0, count));
            }
        }

        let mut mapper = |entity: &mut Entity| {
            if let Some(&mapped) = mapping.get(entity) {
                *entity = mapped;
            }
        };
        for &view in &moved {
            self.remap_rows(view, &mut mapper);
        }

        self.refresh_all_shared();
        self.epoch += 1;
        source.reset();
        debug!(storage = ?self.id, entities = mapping.len(), chunks = moved.len(), "merged storage");
    }

    /// Coalesce partially-full chunks and drop empty groups.
    pub fn defragment(&mut self) {
        let mut moved = 0;
        let mut removed = 0;
        for index in 0..self.groups.len() {
            let Some(group) = &self.groups[index] else {
                continue;
            };
            let id = group.id();
            if group.is_empty() {
                self.remove_group(id);
                removed += 1;
            } else {
                moved += self.compact_group(id);
            }
        }
        self.arena.trim();
        debug!(storage = ?self.id, moved_rows = moved, removed_groups = removed, "defragmented");
    }

    /// Renumber every entity into the dense range `0..entity_count()`.
    ///
    /// Returns `(old, new)` pairs. Handles held outside the storage are
    /// invalid afterwards.
    pub fn pack_entities(&mut self) -> Vec<(Entity, Entity)> {
        let mut mapping = Vec::with_capacity(self.entity_count());
        let mut locations = Vec::with_capacity(self.entity_count());

        for group in self.groups.iter().flatten() {
            for &handle in group.chunks() {
                let chunk = self.arena.get(handle);
                let ids = chunk.entities_ptr();
                for row in 0..chunk.count {
                    let new = Entity::new(locations.len() as u32, 0);
                    // SAFETY: rows below count hold initialized ids
                    let old = unsafe { ids.add(row as usize).replace(new) };
                    mapping.push((old, new));
                    locations.push(EntityLocation { chunk: handle, row });
                }
            }
        }
        self.entities.rebuild_dense(&locations);

        let lookup: FxHashMap<Entity, Entity> = mapping.iter().copied().collect();
        let mut mapper = |entity: &mut Entity| {
            if let Some(&mapped) = lookup.get(entity) {
                *entity = mapped;
            }
        };
        let views: Vec<ChunkView> = self
            .groups()
            .flat_map(|g| g.chunks().iter().copied())
            .map(|handle| ChunkView::new(handle, 0, self.arena.get(handle).count))
            .collect();
        for view in views {
            self.remap_rows(view, &mut mapper);
        }
        self.remap_group_meta(&lookup);

        self.epoch += 1;
        debug!(storage = ?self.id, entities = mapping.len(), "packed entities");
        mapping
    }

    /// Destroy everything, pinned components included.
    pub fn reset(&mut self) {
        self.destruct_all();
        self.groups.clear();
        self.free_groups.clear();
        self.group_index.clear();
        self.meta_users.clear();
        self.arena.clear();
        self.entities.clear();
        self.epoch += 1;
    }

    pub(crate) fn group_ref(&self, id: GroupId) -> &Group {
        group_at(&self.groups, id)
    }

    fn remove_group(&mut self, id: GroupId) {
        let Some(mut group) = self.groups[id.as_raw() as usize].take() else {
            return;
        };
        debug_assert!(group.is_empty(), "removing a non-empty group");
        for handle in group.take_chunks() {
            self.arena.release(handle);
        }
        self.group_index.remove(group.entity_type());
        for meta in group.meta() {
            if let Some(users) = self.meta_users.get_mut(meta) {
                users.retain(|g| *g != id);
                if users.is_empty() {
                    self.meta_users.remove(meta);
                }
            }
        }
        self.free_groups.push(id.as_raw());
        self.epoch += 1;
        debug!(group = ?id, "removed group");
    }

    /// Union of the owned and shared types of every live meta entity.
    fn compute_shared(&self, meta: &[Entity]) -> TypeSet {
        let mut shared = TypeSet::new();
        for &entity in meta {
            if let Some(id) = self.group_of(entity) {
                let group = self.group_ref(id);
                if group.is_dead() {
                    continue;
                }
                shared = shared
                    .union(&group.entity_type().types)
                    .union(&TypeSet::from_sorted(group.shared_types()));
            }
        }
        shared
    }

    /// Meta entities among the rows of a view.
    fn meta_entities_in(&self, view: ChunkView) -> SmallVec<[Entity; 4]> {
        if self.meta_users.is_empty() {
            return SmallVec::new();
        }
        self.entities(view)
            .iter()
            .copied()
            .filter(|e| self.meta_users.contains_key(e))
            .collect()
    }

    /// Recompute shared types of groups whose meta entities changed group.
    fn refresh_shared(&mut self, changed: &[Entity]) {
        let mut pending: Vec<GroupId> = changed
            .iter()
            .filter_map(|e| self.meta_users.get(e))
            .flatten()
            .copied()
            .collect();
        let mut visited = FxHashSet::default();

        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(group) = self.group(id) else {
                continue;
            };
            let shared = self.compute_shared(group.meta());
            if shared.as_slice() == group.shared_types() {
                continue;
            }

            // entities of this group may be meta for others
            for &handle in group.chunks() {
                for entity in self.arena.get(handle).entities() {
                    if let Some(users) = self.meta_users.get(entity) {
                        pending.extend_from_slice(users);
                    }
                }
            }
            group_at_mut(&mut self.groups, id).set_shared(shared);
            self.epoch += 1;
            trace!(group = ?id, "refreshed shared types");
        }
    }

    pub(crate) fn refresh_all_shared(&mut self) {
        // each pass settles one more level of meta nesting
        for _ in 0..=self.groups.len() {
            let mut changed = false;
            for index in 0..self.groups.len() {
                let Some(group) = &self.groups[index] else {
                    continue;
                };
                let shared = self.compute_shared(group.meta());
                if shared.as_slice() != group.shared_types() {
                    let id = group.id();
                    group_at_mut(&mut self.groups, id).set_shared(shared);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            self.epoch += 1;
        }
    }

    fn remap_group_meta(&mut self, lookup: &FxHashMap<Entity, Entity>) {
        self.meta_users.clear();
        for index in 0..self.groups.len() {
            let Some(group) = &mut self.groups[index] else {
                continue;
            };
            let id = group.id();
            if !group.meta().is_empty() {
                let old = group.entity_type().clone();
                let meta: MetaSet = old
                    .meta
                    .iter()
                    .map(|m| lookup.get(m).copied().unwrap_or(*m))
                    .collect();
                let ty = EntityType::new(old.types.clone(), meta);
                group.set_entity_type(ty.clone());
                self.group_index.remove(&old);
                self.group_index.insert(ty, id);
            }
            for &meta in group.meta() {
                self.meta_users.entry(meta).or_default().push(id);
            }
        }
    }

    /// Reserve `count` rows in a group without initializing them.
    ///
    /// The caller must construct every slot and write entity ids before the
    /// storage is used again.
    pub(crate) fn reserve_rows(&mut self, id: GroupId, mut count: u32) -> SmallVec<[ChunkView; 4]> {
        let Self { groups, arena, .. } = self;
        let group = group_at_mut(groups, id);
        let mut views = SmallVec::new();

        while count > 0 {
            let handle = if let Some(handle) = group.free_chunk() {
                handle
            } else {
                let handle = arena.allocate(
                    group.chunk_class(),
                    id,
                    group.capacity(),
                    group.slots().len(),
                );
                group.push_chunk(arena, handle);
                handle
            };

            let chunk = arena.get_mut(handle);
            let n = count.min(chunk.capacity - chunk.count);
            views.push(ChunkView::new(handle, chunk.count, n));
            chunk.count += n;
            if chunk.is_full() {
                group.mark_full(arena, handle);
            }
            group.add_size(n as usize);
            count -= n;
        }
        views
    }

    /// Default-construct every slot of a reserved view and null its ids.
    pub(crate) fn construct_view(&self, view: ChunkView) {
        let chunk = self.arena.get(view.chunk);
        let group = self.group_ref(chunk.group);
        for (i, slot) in group.slots().iter().enumerate() {
            // SAFETY: rows of a reserved view are uninitialized
            unsafe { construct_rows(chunk, slot, view.rows()) };
            chunk.stamp(i, self.timestamp);
        }
        let ids = chunk.entities_ptr();
        for row in view.rows() {
            // SAFETY: row is inside the chunk
            unsafe { ids.add(row).write(Entity::NULL) };
        }
    }

    fn write_new_entities(&mut self, view: ChunkView) {
        let ids = self.arena.get(view.chunk).entities_ptr();
        for row in view.rows() {
            let entity = self.entities.alloc();
            // SAFETY: row is inside the chunk
            unsafe { ids.add(row).write(entity) };
            self.entities.set_location(
                entity,
                EntityLocation {
                    chunk: view.chunk,
                    row: row as u32,
                },
            );
        }
    }

    fn instantiate_views(&mut self, prefab: Entity, count: u32) -> SmallVec<[ChunkView; 4]> {
        let Some(source) = self.entities.location(prefab) else {
            return SmallVec::new();
        };
        let src_group = self.group_ref(self.arena.get(source.chunk).group);
        if count == 0 || src_group.is_dead() {
            return SmallVec::new();
        }

        let mut target = src_group.entity_type().clone();
        target.types = target.types.difference(&src_group.pinned_types());
        target.types.remove(TypeIndex::PREFAB);

        let dst = self.get_or_create_group(&target);
        let views = self.reserve_rows(dst, count);
        for &view in &views {
            self.copy_rows_from(source, view);
            self.write_new_entities(view);
        }
        trace!(?prefab, group = ?dst, count, "instantiated prefab");
        views
    }

    /// Fill reserved rows with copies of one source row.
    fn copy_rows_from(&self, source: EntityLocation, dst: ChunkView) {
        let src_chunk = self.arena.get(source.chunk);
        let dst_chunk = self.arena.get(dst.chunk);
        let src_group = self.group_ref(src_chunk.group);
        let dst_group = self.group_ref(dst_chunk.group);

        for (i, slot) in dst_group.slots().iter().enumerate() {
            dst_chunk.stamp(i, self.timestamp);
            let Some(src_slot) = src_group.slot(slot.ty) else {
                // SAFETY: reserved rows are uninitialized
                unsafe { construct_rows(dst_chunk, slot, dst.rows()) };
                continue;
            };
            if slot.size == 0 {
                continue;
            }
            let src = row_ptr(src_chunk, src_slot, source.row as usize);
            for row in dst.rows() {
                // SAFETY: src is a live value, dst rows are uninitialized
                unsafe { copy_value(slot, row_ptr(dst_chunk, slot, row), src) };
            }
        }
        let ids = dst_chunk.entities_ptr();
        for row in dst.rows() {
            // SAFETY: row is inside the chunk
            unsafe { ids.add(row).write(Entity::NULL) };
        }
    }

    /// Move `src` rows into reserved `dst` rows of another chunk.
    ///
    /// Shared components are relocated and the rest of `dst` constructed.
    /// Source data is left moved-out; the caller destructs the source-only
    /// slots and removes the rows.
    fn move_rows(&mut self, src: ChunkView, dst: ChunkView) {
        debug_assert_eq!(src.count, dst.count);
        let Self {
            groups,
            arena,
            entities,
            timestamp,
            ..
        } = self;
        let src_chunk = arena.get(src.chunk);
        let dst_chunk = arena.get(dst.chunk);
        let src_group = group_at(groups, src_chunk.group);
        let dst_group = group_at(groups, dst_chunk.group);

        for (i, slot) in dst_group.slots().iter().enumerate() {
            if let Some(j) = src_group.slot_index(slot.ty) {
                let src_slot = &src_group.slots()[j];
                // SAFETY: both ranges are inside their chunks and do not overlap
                unsafe {
                    relocate_rows(
                        slot,
                        row_ptr(dst_chunk, slot, dst.start as usize),
                        row_ptr(src_chunk, src_slot, src.start as usize),
                        dst.count as usize,
                    );
                }
                dst_chunk.stamp(i, src_chunk.timestamp(j));
            } else {
                // SAFETY: reserved rows are uninitialized
                unsafe { construct_rows(dst_chunk, slot, dst.rows()) };
                dst_chunk.stamp(i, *timestamp);
            }
        }

        let src_ids = src_chunk.entities_ptr();
        let dst_ids = dst_chunk.entities_ptr();
        for i in 0..src.count {
            // SAFETY: both rows are inside their chunks
            let entity = unsafe { src_ids.add((src.start + i) as usize).read() };
            unsafe { dst_ids.add((dst.start + i) as usize).write(entity) };
            entities.set_location(
                entity,
                EntityLocation {
                    chunk: dst.chunk,
                    row: dst.start + i,
                },
            );
        }
    }

    fn cast_impl(&mut self, view: ChunkView, dst: GroupId, callback: &mut CastCallback<'_>) {
        let targets = self.reserve_rows(dst, view.count);
        let mut offset = 0;
        for &target in &targets {
            let old = ChunkView::new(view.chunk, view.start + offset, target.count);
            self.move_rows(old, target);
            callback(&mut ViewAccess::new(self), target, old);
            offset += target.count;
        }

        self.destruct_view(view, Some(dst));
        self.remove_rows(view);
    }

    /// Destruct, free ids and remove rows.
    fn release_view(&mut self, view: ChunkView) {
        self.destruct_view(view, None);
        let chunk = self.arena.get(view.chunk);
        for &entity in &chunk.entities()[view.rows()] {
            self.entities.free(entity);
        }
        self.remove_rows(view);
    }

    /// Run destructors on a view, skipping types owned by `keep`.
    fn destruct_view(&self, view: ChunkView, keep: Option<GroupId>) {
        let chunk = self.arena.get(view.chunk);
        let group = self.group_ref(chunk.group);
        let keep = keep.map(|id| self.group_ref(id));
        for slot in group.slots() {
            if keep.is_some_and(|k| k.owns(slot.ty)) {
                continue;
            }
            // SAFETY: rows of the view are live
            unsafe { destruct_rows(chunk, slot, view.rows()) };
        }
    }

    /// Remove rows whose data is already gone by moving the chunk's tail into
    /// the hole. Empty chunks are released.
    fn remove_rows(&mut self, view: ChunkView) {
        let Self {
            groups,
            arena,
            entities,
            ..
        } = self;
        let chunk = arena.get(view.chunk);
        let group = group_at_mut(groups, chunk.group);
        let count = chunk.count;
        let was_full = chunk.is_full();

        let tail = view.end().max(count - view.count);
        let moved = count - tail;
        if moved > 0 {
            for slot in group.slots() {
                // SAFETY: [tail, count) and [start, start + moved) are disjoint
                unsafe {
                    relocate_rows(
                        slot,
                        row_ptr(chunk, slot, view.start as usize),
                        row_ptr(chunk, slot, tail as usize),
                        moved as usize,
                    );
                }
            }
            let ids = chunk.entities_ptr();
            for i in 0..moved {
                // SAFETY: both rows are below count
                let entity = unsafe { ids.add((tail + i) as usize).read() };
                unsafe { ids.add((view.start + i) as usize).write(entity) };
                entities.set_location(
                    entity,
                    EntityLocation {
                        chunk: view.chunk,
                        row: view.start + i,
                    },
                );
            }
        }

        let chunk = arena.get_mut(view.chunk);
        chunk.count -= view.count;
        let empty = chunk.count == 0;
        group.sub_size(view.count as usize);
        if was_full {
            group.mark_free(arena, view.chunk);
        }
        if empty {
            group.remove_chunk(arena, view.chunk);
            arena.release(view.chunk);
        }
    }

    /// Move trailing rows of the emptiest partial chunk into the fullest one
    /// until at most one partial chunk remains.
    fn compact_group(&mut self, id: GroupId) -> usize {
        let mut moved = 0;
        loop {
            let group = self.group_ref(id);
            let free = group.free_chunks();
            if free.len() < 2 {
                break;
            }
            let mut by_count: SmallVec<[(u32, _); 8]> = free
                .iter()
                .map(|&handle| (self.arena.get(handle).count, handle))
                .collect();
            by_count.sort_unstable();
            let (src_count, src) = by_count[0];
            let (dst_count, dst) = by_count[by_count.len() - 1];

            let n = src_count.min(group.capacity() - dst_count);
            if n == 0 {
                break;
            }
            let from = ChunkView::new(src, src_count - n, n);
            let to = ChunkView::new(dst, dst_count, n);

            {
                let Self { groups, arena, .. } = self;
                let group = group_at_mut(groups, id);
                let chunk = arena.get_mut(dst);
                chunk.count += n;
                if chunk.is_full() {
                    group.mark_full(arena, dst);
                }
            }
            self.move_rows(from, to);

            let Self { groups, arena, .. } = self;
            let group = group_at_mut(groups, id);
            let chunk = arena.get_mut(src);
            chunk.count -= n;
            if chunk.count == 0 {
                group.remove_chunk(arena, src);
                arena.release(src);
            }
            moved += n as usize;
        }
        moved
    }

    /// Rewrite entity references stored in the rows of a view.
    pub(crate) fn remap_rows(&self, view: ChunkView, mapper: &mut dyn EntityMapper) {
        let chunk = self.arena.get(view.chunk);
        let group = self.group_ref(chunk.group);
        for slot in group.slots().iter().filter(|s| s.has_entity_refs()) {
            for row in view.rows() {
                // SAFETY: the row is live
                unsafe { map_value(slot, row_ptr(chunk, slot, row), mapper) };
            }
        }
    }

    fn destruct_all(&self) {
        for group in self.groups.iter().flatten() {
            for &handle in group.chunks() {
                let chunk = self.arena.get(handle);
                for slot in group.slots() {
                    // SAFETY: rows below count are live
                    unsafe { destruct_rows(chunk, slot, 0..chunk.count as usize) };
                }
            }
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.destruct_all();
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("entities", &self.entity_count())
            .field("groups", &self.groups().count())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

fn group_at(groups: &[Option<Group>], id: GroupId) -> &Group {
    groups[id.as_raw() as usize]
        .as_ref()
        .unwrap_or_else(|| panic!("group {id:?} does not exist"))
}

fn group_at_mut(groups: &mut [Option<Group>], id: GroupId) -> &mut Group {
    groups[id.as_raw() as usize]
        .as_mut()
        .unwrap_or_else(|| panic!("group {id:?} does not exist"))
}

/// Pointer to a row of a type slot.
pub(crate) fn row_ptr(chunk: &Chunk, slot: &TypeSlot, row: usize) -> *mut u8 {
    chunk.data_ptr(slot.offset + slot.size * row)
}

/// # Safety
///
/// The rows must be uninitialized and inside the chunk.
pub(crate) unsafe fn construct_rows(chunk: &Chunk, slot: &TypeSlot, rows: Range<usize>) {
    if slot.size == 0 {
        return;
    }
    for row in rows {
        let ptr = row_ptr(chunk, slot, row);
        match slot.callbacks.constructor {
            Some(constructor) => unsafe { constructor(ptr) },
            None => unsafe { ptr::write_bytes(ptr, 0, slot.size) },
        }
    }
}

/// # Safety
///
/// The rows must be live; they are uninitialized afterwards.
pub(crate) unsafe fn destruct_rows(chunk: &Chunk, slot: &TypeSlot, rows: Range<usize>) {
    let Some(destructor) = slot.callbacks.destructor else {
        return;
    };
    if slot.size == 0 {
        return;
    }
    for row in rows {
        unsafe { destructor(row_ptr(chunk, slot, row)) };
    }
}

/// # Safety
///
/// `dst` must be uninitialized, `src` live.
unsafe fn copy_value(slot: &TypeSlot, dst: *mut u8, src: *const u8) {
    match slot.callbacks.copy {
        Some(copy) => unsafe { copy(dst, src) },
        None => unsafe { ptr::copy_nonoverlapping(src, dst, slot.size) },
    }
}

/// # Safety
///
/// `count` rows at `src` must be live and `dst` uninitialized.
unsafe fn relocate_rows(slot: &TypeSlot, dst: *mut u8, src: *mut u8, count: usize) {
    if slot.size == 0 || count == 0 {
        return;
    }
    match slot.callbacks.relocate {
        Some(relocate) => {
            for i in 0..count {
                unsafe { relocate(dst.add(i * slot.size), src.add(i * slot.size)) };
            }
        }
        None => unsafe { ptr::copy(src, dst, slot.size * count) },
    }
}

/// # Safety
///
/// `ptr` must point to a live value of the slot's type.
unsafe fn map_value(slot: &TypeSlot, ptr: *mut u8, mapper: &mut dyn EntityMapper) {
    if let Some(map) = slot.callbacks.map {
        unsafe { map(ptr, mapper) };
        return;
    }
    for &offset in &slot.entity_fields {
        unsafe {
            let field = ptr.add(offset as usize).cast::<Entity>();
            let mut entity = field.read_unaligned();
            mapper.map(&mut entity);
            field.write_unaligned(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct A(u32);

    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct B(u64);

    fn setup() -> (Storage, TypeIndex, TypeIndex) {
        let registry = Arc::new(TypeRegistry::new());
        let a = registry.register::<A>().unwrap();
        let b = registry.register::<B>().unwrap();
        (Storage::new(registry), a, b)
    }

    #[test]
    fn test_allocate_fills_chunks_in_order() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let mut views = Vec::new();
        storage.allocate(&ty, 10, |_, view| views.push(view));
        storage.allocate(&ty, 5, |_, view| views.push(view));

        assert_eq!(views.len(), 2);
        assert_eq!(views[0].chunk, views[1].chunk);
        assert_eq!(views[1].start, 10);
        assert_eq!(storage.entity_count(), 15);

        let group = storage.group(storage.find_group(&ty).unwrap()).unwrap();
        assert_eq!(group.len(), 15);
        assert_eq!(group.chunks().len(), 1);
    }

    #[test]
    fn test_allocate_spans_chunks() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let id = storage.get_or_create_group(&ty);
        let capacity = storage.group(id).unwrap().capacity();

        let mut views = Vec::new();
        storage.allocate(&ty, capacity + 3, |_, view| views.push(view));
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].count, capacity);
        assert_eq!(views[1].count, 3);

        let group = storage.group(id).unwrap();
        assert_eq!(group.chunks().len(), 2);
        // the full chunk sits in front of the partial one
        assert_eq!(group.free_chunk(), Some(views[1].chunk));
    }

    #[test]
    fn test_destroy_compacts_with_tail() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let mut entities = Vec::new();
        storage.allocate(&ty, 6, |access, view| {
            entities.extend_from_slice(access.entities(view));
            for (i, value) in access.component_mut::<A>(view, a).unwrap().iter_mut().enumerate() {
                *value = A(i as u32);
            }
        });

        let view = storage.access(entities[1]).unwrap();
        storage.destroy(ChunkView::new(view.chunk, 1, 2));

        assert!(!storage.exist(entities[1]));
        assert!(!storage.exist(entities[2]));
        // rows 4 and 5 moved into the hole
        assert_eq!(storage.access(entities[4]).unwrap().start, 1);
        assert_eq!(storage.access(entities[5]).unwrap().start, 2);
        for (entity, value) in [(0, 0), (3, 3), (4, 4), (5, 5)] {
            assert_eq!(storage.get::<A>(entities[entity], a), Some(&A(value)));
        }
    }

    #[test]
    fn test_destroy_last_rows_releases_chunk() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let entities = storage.allocate_entities(&ty, 4);
        storage.destroy_entities(&entities);

        let group = storage.group(storage.find_group(&ty).unwrap()).unwrap();
        assert!(group.is_empty());
        assert!(group.chunks().is_empty());
        assert_eq!(storage.entity_count(), 0);
    }

    #[test]
    fn test_batch_merges_adjacent_rows() {
        let (mut storage, a, b) = setup();
        let first = storage.allocate_entities(&EntityType::of(&[a]), 4);
        let second = storage.allocate_entities(&EntityType::of(&[b]), 2);

        let views = storage.batch(&[first[0], first[1], first[3], second[0], second[1]]);
        assert_eq!(views.len(), 3);
        assert_eq!((views[0].start, views[0].count), (0, 2));
        assert_eq!((views[1].start, views[1].count), (3, 1));
        assert_eq!(views[2].count, 2);
    }

    #[test]
    fn test_defragment_coalesces_chunks() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let id = storage.get_or_create_group(&ty);
        let capacity = storage.group(id).unwrap().capacity();

        let entities = storage.allocate_entities(&ty, capacity * 2);
        // leave two partially-full chunks
        storage.destroy_entities(&entities[..3]);
        storage.destroy_entities(&entities[capacity as usize..capacity as usize + 3]);
        assert_eq!(storage.group(id).unwrap().free_chunks().len(), 2);

        storage.defragment();
        let group = storage.group(id).unwrap();
        assert_eq!(group.chunks().len(), 2);
        assert_eq!(group.free_chunks().len(), 1);
        assert_eq!(group.len(), capacity as usize * 2 - 6);
        for entity in entities.iter().skip(3) {
            if storage.exist(*entity) {
                let view = storage.access(*entity).unwrap();
                assert_eq!(storage.entities(view), &[*entity]);
            }
        }
    }

    #[test]
    fn test_defragment_removes_empty_groups() {
        let (mut storage, a, _) = setup();
        let ty = EntityType::of(&[a]);
        let entities = storage.allocate_entities(&ty, 3);
        storage.destroy_entities(&entities);
        let epoch = storage.epoch();

        storage.defragment();
        assert!(storage.find_group(&ty).is_none());
        assert!(storage.epoch() > epoch);
        assert_eq!(storage.get_or_create_group(&ty).as_raw(), 0);
    }
}
