// Allow unsafe code - component data lives in raw chunk memory
#![allow(unsafe_code)]
// Allow missing docs for now
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::float_cmp)]

//! sugoi - chunked archetype entity storage
//!
//! Entities are grouped by their exact component set. Each group stores its
//! entities in fixed-size chunks laid out column by column, so iterating one
//! component over a query is a walk over contiguous arrays.
//!
//! # Key Concepts
//!
//! - **Entity**: 24-bit id plus 8-bit version; stale handles are detected
//! - **Type registry**: component descriptions keyed by guid and name
//! - **Group**: every entity with the same owned types and meta entities
//! - **Chunk**: one memory block holding a group's ids and component columns
//! - **Meta entity**: an entity whose components are shared, read-only, by a group
//! - **Query**: a cached filter over groups plus declared access parameters
//!
//! # Structural changes
//!
//! `allocate`, `instantiate`, `destroy`, `cast_view_delta`,
//! `cast_view_group`, `merge`, `defragment` and `pack_entities` all keep rows
//! `[0, count)` of every chunk dense. Removing rows moves the chunk's tail
//! into the hole, so row order is not stable.
//!
//! ```
//! use std::sync::Arc;
//! use sugoi::{DeltaType, EntityType, Storage, TypeRegistry};
//!
//! #[derive(Default, Clone, Debug, PartialEq)]
//! struct Health(u32);
//!
//! #[derive(Default, Clone)]
//! struct Poisoned;
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let health = registry.register::<Health>().unwrap();
//! let poisoned = registry.register::<Poisoned>().unwrap();
//! let mut storage = Storage::new(registry);
//!
//! let mut spawned = Vec::new();
//! storage.allocate(&EntityType::of(&[health]), 2, |access, view| {
//!     spawned.extend_from_slice(access.entities(view));
//!     for value in access.component_mut::<Health>(view, health).unwrap() {
//!         value.0 = 20;
//!     }
//! });
//!
//! storage.cast_entities(&spawned[..1], &DeltaType::new().add(poisoned));
//! assert!(storage.entity_type(spawned[0]).unwrap().types.contains(poisoned));
//! assert_eq!(storage.get::<Health>(spawned[0], health), Some(&Health(20)));
//! ```

mod access;
mod array;
mod chunk;
mod entity;
mod group;
mod query;
mod serialize;
mod snapshot;
mod storage;
mod type_registry;
mod type_set;

pub use access::{AtomicComponent, ViewAccess};
pub use array::{ArrayHeader, ArrayMut, InlineArray, array_data_offset, array_layout};
pub use chunk::{
    CHUNK_ALIGN, ChunkClass, ChunkHandle, ChunkView, DEFAULT_CHUNK_SIZE, LARGE_CHUNK_SIZE,
    SMALL_CHUNK_SIZE, TARGET_ROWS_PER_CHUNK,
};
pub use entity::{Entity, EntityLocation, EntityMapper};
pub use group::{Group, GroupFlags, GroupId};
pub use query::{
    AccessMode, Filter, MetaFilter, Parameter, Parameters, Query, QueryBuilder, QueryError,
};
pub use serialize::{ByteReader, ByteWriter, SerializeError, Serializer};
pub use storage::{CastCallback, Storage, StorageId};
pub use type_registry::{
    Component, Guid, Retention, TypeBuilder, TypeCallbacks, TypeDescription, TypeIndex, TypeKind,
    TypeRegisterError, TypeRegistry,
};
pub use type_set::{DeltaType, EntityType, MetaSet, SortedSet, TypeSet, intersects, is_subset};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AccessMode, ChunkView, DeltaType, Entity, EntityType, Query, Storage, TypeIndex,
        TypeRegistry, ViewAccess,
    };
}
