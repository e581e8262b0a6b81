//! Filters, access parameters and cached queries.
//!
//! A [`Query`] pairs a [`Filter`] over owned and shared type sets with a
//! [`MetaFilter`] over meta entities and the access [`Parameters`] a job
//! declares. Matching groups are cached per query and rebuilt when the
//! storage's structural epoch moves.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sugoi::{EntityType, Query, Storage, TypeRegistry};
//!
//! #[derive(Default, Clone)]
//! struct Position(f32);
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let position = registry.register::<Position>().unwrap();
//! let mut storage = Storage::new(registry);
//! storage.allocate_entities(&EntityType::of(&[position]), 3);
//!
//! let query = Query::from_literal(&storage, "[inout]Position").unwrap();
//! assert_eq!(storage.count(&query), 3);
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use sugoi_query_dsl::{Access, Operator, Order};
use thiserror::Error;
use tracing::trace;

use crate::{
    access::ViewAccess,
    chunk::{Chunk, ChunkView},
    entity::Entity,
    group::{Group, GroupId},
    storage::{Storage, StorageId},
    type_registry::TypeIndex,
    type_set::{MetaSet, TypeSet, intersects, is_subset},
};

/// Errors from building a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("unknown component type {0:?}")]
    UnknownType(String),
    #[error("shared component {0:?} cannot be written")]
    SharedWrite(String),
    #[error("query has no positive terms")]
    EmptyQuery,
}

/// Six type sets: all/any/none over owned and shared types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub all: TypeSet,
    pub any: TypeSet,
    pub none: TypeSet,
    pub all_shared: TypeSet,
    pub any_shared: TypeSet,
    pub none_shared: TypeSet,
}

impl Filter {
    /// Check a group against the filter.
    ///
    /// Groups tagged `DEAD`, `DISABLED` or `PREFAB` only match when the
    /// filter names the tag in `all` or `any`.
    #[must_use]
    pub fn matches(&self, group: &Group) -> bool {
        for tag in [TypeIndex::DEAD, TypeIndex::DISABLED, TypeIndex::PREFAB] {
            if group.owns(tag) && !self.all.contains(tag) && !self.any.contains(tag) {
                return false;
            }
        }

        let owned = group.owned_types();
        let shared = group.shared_types();
        is_subset(&self.all, owned)
            && (self.any.is_empty() || intersects(&self.any, owned))
            && !intersects(&self.none, owned)
            && is_subset(&self.all_shared, shared)
            && (self.any_shared.is_empty() || intersects(&self.any_shared, shared))
            && !intersects(&self.none_shared, shared)
    }

    fn has_positive_terms(&self) -> bool {
        !(self.all.is_empty()
            && self.any.is_empty()
            && self.all_shared.is_empty()
            && self.any_shared.is_empty())
    }
}

/// Meta entity predicates and change detection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaFilter {
    pub all_meta: MetaSet,
    pub any_meta: MetaSet,
    pub none_meta: MetaSet,
    /// Chunks match only if one of these types was written after `timestamp`.
    pub changed: TypeSet,
    pub timestamp: u32,
}

impl MetaFilter {
    #[must_use]
    pub fn matches(&self, group: &Group) -> bool {
        let meta = group.meta();
        is_subset(&self.all_meta, meta)
            && (self.any_meta.is_empty() || intersects(&self.any_meta, meta))
            && !intersects(&self.none_meta, meta)
    }
}

/// How a job touches a component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    /// Concurrent writes through atomic operations.
    Atomic,
}

impl AccessMode {
    /// The stronger of two modes; `ReadWrite` wins over `Atomic`.
    #[must_use]
    pub const fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::ReadWrite, _) | (_, Self::ReadWrite) => Self::ReadWrite,
            (Self::Atomic, _) | (_, Self::Atomic) => Self::Atomic,
            _ => Self::ReadOnly,
        }
    }

    #[must_use]
    pub const fn writes(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// One declared access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub ty: TypeIndex,
    pub access: AccessMode,
    /// Rows of any entity may be touched, not only the iterated ones.
    pub random_access: bool,
    /// The group may lack the type.
    pub optional: bool,
    /// Read through meta entities.
    pub shared: bool,
}

impl Parameter {
    #[must_use]
    pub const fn new(ty: TypeIndex, access: AccessMode) -> Self {
        Self {
            ty,
            access,
            random_access: false,
            optional: false,
            shared: false,
        }
    }
}

/// Declared accesses of a query, at most one per type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parameters(SmallVec<[Parameter; 8]>);

impl Parameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, merging with an existing one for the same type.
    pub fn push(&mut self, param: Parameter) {
        match self.0.iter_mut().find(|p| p.ty == param.ty) {
            Some(existing) => {
                existing.access = existing.access.max(param.access);
                existing.random_access |= param.random_access;
                existing.optional &= param.optional;
                existing.shared &= param.shared;
            }
            None => self.0.push(param),
        }
    }

    #[must_use]
    pub fn get(&self, ty: TypeIndex) -> Option<&Parameter> {
        self.0.iter().find(|p| p.ty == ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check for a written parameter with random access.
    #[must_use]
    pub fn has_random_write(&self) -> bool {
        self.0.iter().any(|p| p.random_access && p.access.writes())
    }

    fn get_mut(&mut self, ty: TypeIndex) -> Option<&mut Parameter> {
        self.0.iter_mut().find(|p| p.ty == ty)
    }
}

#[derive(Debug, Default)]
struct QueryCache {
    epoch: Option<u64>,
    groups: Vec<GroupId>,
}

/// A compiled query bound to one storage.
#[derive(Debug)]
pub struct Query {
    storage: StorageId,
    filter: Filter,
    meta: MetaFilter,
    params: Parameters,
    cache: Mutex<QueryCache>,
}

impl Query {
    pub fn builder(storage: &Storage) -> QueryBuilder {
        QueryBuilder {
            storage: storage.id(),
            filter: Filter::default(),
            meta: MetaFilter::default(),
            params: Parameters::new(),
        }
    }

    /// Compile a filter literal such as `"[inout]Position, Velocity, !Frozen"`.
    pub fn from_literal(storage: &Storage, literal: &str) -> Result<Self, QueryError> {
        let parsed = sugoi_query_dsl::parse_query(literal).map_err(|e| QueryError::Parse {
            position: e.position,
            message: e.message,
        })?;
        let registry = storage.registry();
        let mut builder = Self::builder(storage);

        for term in &parsed.terms {
            let types = term
                .names
                .iter()
                .map(|name| {
                    registry
                        .get_type_by_name(name)
                        .ok_or_else(|| QueryError::UnknownType(name.clone()))
                })
                .collect::<Result<SmallVec<[TypeIndex; 4]>, _>>()?;

            let access = match term.access {
                Access::In => Some(AccessMode::ReadOnly),
                Access::Out | Access::InOut => Some(AccessMode::ReadWrite),
                Access::Atomic => Some(AccessMode::Atomic),
                Access::Has => None,
            };
            if term.shared && access.is_some_and(AccessMode::writes) {
                return Err(QueryError::SharedWrite(term.names.join("|")));
            }

            let alternative = types.len() > 1;
            for &ty in &types {
                let param = access.map(|mode| Parameter {
                    ty,
                    access: mode,
                    random_access: term.order == Order::Random,
                    optional: alternative || term.operator == Operator::Optional,
                    shared: term.shared,
                });

                match (term.operator, term.shared, alternative) {
                    (Operator::Not, false, _) => {
                        builder.filter.none.insert(ty);
                        continue;
                    }
                    (Operator::Not, true, _) => {
                        builder.filter.none_shared.insert(ty);
                        continue;
                    }
                    (Operator::Optional, ..) => {}
                    (Operator::And, false, false) => {
                        builder.filter.all.insert(ty);
                    }
                    (Operator::And, false, true) => {
                        builder.filter.any.insert(ty);
                    }
                    (Operator::And, true, false) => {
                        builder.filter.all_shared.insert(ty);
                    }
                    (Operator::And, true, true) => {
                        builder.filter.any_shared.insert(ty);
                    }
                }
                if let Some(param) = param {
                    builder.params.push(param);
                }
            }
        }

        builder.build()
    }

    #[must_use]
    pub const fn storage_id(&self) -> StorageId {
        self.storage
    }

    #[must_use]
    pub const fn filter(&self) -> &Filter {
        &self.filter
    }

    #[must_use]
    pub const fn meta_filter(&self) -> &MetaFilter {
        &self.meta
    }

    #[must_use]
    pub const fn params(&self) -> &Parameters {
        &self.params
    }

    /// Change the changed-since timestamp without touching the group cache.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.meta.timestamp = timestamp;
    }

    #[must_use]
    pub fn matches_group(&self, group: &Group) -> bool {
        self.filter.matches(group) && self.meta.matches(group)
    }
}

/// Builder returned by [`Query::builder`].
#[must_use]
#[derive(Debug)]
pub struct QueryBuilder {
    storage: StorageId,
    filter: Filter,
    meta: MetaFilter,
    params: Parameters,
}

impl QueryBuilder {
    /// Require and read a type.
    pub fn read(self, ty: TypeIndex) -> Self {
        self.access(ty, AccessMode::ReadOnly)
    }

    /// Require and write a type.
    pub fn write(self, ty: TypeIndex) -> Self {
        self.access(ty, AccessMode::ReadWrite)
    }

    /// Require a type and update it atomically.
    pub fn atomic(self, ty: TypeIndex) -> Self {
        self.access(ty, AccessMode::Atomic)
    }

    /// Mark a declared type as randomly accessed, or declare a random read.
    pub fn random(mut self, ty: TypeIndex) -> Self {
        match self.params.get_mut(ty) {
            Some(param) => param.random_access = true,
            None => self.params.push(Parameter {
                random_access: true,
                ..Parameter::new(ty, AccessMode::ReadOnly)
            }),
        }
        self
    }

    /// Access a type when the group has it, without filtering on it.
    pub fn optional(mut self, ty: TypeIndex, access: AccessMode) -> Self {
        self.params.push(Parameter {
            optional: true,
            ..Parameter::new(ty, access)
        });
        self
    }

    /// Require a type without accessing it.
    pub fn with(mut self, ty: TypeIndex) -> Self {
        self.filter.all.insert(ty);
        self
    }

    /// Require at least one of the types passed to `any`.
    pub fn any(mut self, ty: TypeIndex) -> Self {
        self.filter.any.insert(ty);
        self
    }

    pub fn without(mut self, ty: TypeIndex) -> Self {
        self.filter.none.insert(ty);
        self
    }

    /// Require and read a type shared through meta entities.
    pub fn shared(mut self, ty: TypeIndex) -> Self {
        self.filter.all_shared.insert(ty);
        self.params.push(Parameter {
            shared: true,
            ..Parameter::new(ty, AccessMode::ReadOnly)
        });
        self
    }

    /// Require at least one of the types passed to `any_shared` on a meta entity.
    pub fn any_shared(mut self, ty: TypeIndex) -> Self {
        self.filter.any_shared.insert(ty);
        self
    }

    pub fn without_shared(mut self, ty: TypeIndex) -> Self {
        self.filter.none_shared.insert(ty);
        self
    }

    pub fn with_meta(mut self, meta: Entity) -> Self {
        self.meta.all_meta.insert(meta);
        self
    }

    pub fn any_meta(mut self, meta: Entity) -> Self {
        self.meta.any_meta.insert(meta);
        self
    }

    pub fn without_meta(mut self, meta: Entity) -> Self {
        self.meta.none_meta.insert(meta);
        self
    }

    /// Only visit chunks where `ty` was written after the `since` timestamp.
    pub fn changed(mut self, ty: TypeIndex) -> Self {
        self.meta.changed.insert(ty);
        self
    }

    pub fn since(mut self, timestamp: u32) -> Self {
        self.meta.timestamp = timestamp;
        self
    }

    pub fn build(self) -> Result<Query, QueryError> {
        if !self.filter.has_positive_terms()
            && self.meta.all_meta.is_empty()
            && self.meta.any_meta.is_empty()
        {
            return Err(QueryError::EmptyQuery);
        }
        Ok(Query {
            storage: self.storage,
            filter: self.filter,
            meta: self.meta,
            params: self.params,
            cache: Mutex::new(QueryCache::default()),
        })
    }

    fn access(mut self, ty: TypeIndex, mode: AccessMode) -> Self {
        self.filter.all.insert(ty);
        self.params.push(Parameter::new(ty, mode));
        self
    }
}

impl Storage {
    /// Groups matching a query, from its cache when the epoch is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the query was built for another storage.
    pub fn query_groups(&self, query: &Query) -> Vec<GroupId> {
        assert_eq!(
            query.storage, self.id,
            "query belongs to another storage"
        );
        let mut cache = query.cache.lock();
        if cache.epoch != Some(self.epoch) {
            cache.groups = self
                .groups()
                .filter(|group| query.matches_group(group))
                .map(Group::id)
                .collect();
            cache.epoch = Some(self.epoch);
            trace!(storage = ?self.id, groups = cache.groups.len(), "rebuilt query cache");
        }
        cache.groups.clone()
    }

    /// Views over every matching chunk.
    pub fn query(&self, query: &Query) -> Vec<ChunkView> {
        let mut views = Vec::new();
        for id in self.query_groups(query) {
            let group = self.group_ref(id);
            for &handle in group.chunks() {
                let chunk = self.arena.get(handle);
                if chunk.count == 0 || !self.chunk_changed(group, chunk, &query.meta) {
                    continue;
                }
                views.push(ChunkView::new(handle, 0, chunk.count));
            }
        }
        views
    }

    /// Visit matching chunks with write access.
    pub fn query_mut(&mut self, query: &Query, mut f: impl FnMut(&mut ViewAccess<'_>, ChunkView)) {
        let views = self.query(query);
        let mut access = ViewAccess::new(self);
        for view in views {
            f(&mut access, view);
        }
    }

    /// Number of entities matching a query.
    pub fn count(&self, query: &Query) -> usize {
        self.query(query).iter().map(|v| v.count as usize).sum()
    }

    /// Destroy every entity matching a query.
    pub fn destroy_all(&mut self, query: &Query) {
        let mut destroyed = 0;
        for id in self.query_groups(query) {
            while let Some(group) = self.group(id) {
                let Some(&handle) = group.chunks().last() else {
                    break;
                };
                let count = self.arena.get(handle).count;
                self.destroy(ChunkView::new(handle, 0, count));
                destroyed += count as usize;
                if self.group(id).is_some_and(|g| g.chunks().last() == Some(&handle)) {
                    // dead markers stay behind; nothing more to destroy here
                    break;
                }
            }
        }
        trace!(storage = ?self.id, destroyed, "destroyed query results");
    }

    fn chunk_changed(&self, group: &Group, chunk: &Chunk, meta: &MetaFilter) -> bool {
        if meta.changed.is_empty() {
            return true;
        }
        meta.changed.iter().any(|&ty| {
            group
                .slot_index(ty)
                .is_some_and(|index| chunk.timestamp(index) > meta.timestamp)
        })
    }
}
