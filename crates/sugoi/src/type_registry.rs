//! Component type registration and metadata.
//!
//! Every component type is described once by a [`TypeDescription`] and is
//! identified afterwards by a dense [`TypeIndex`]. Descriptions are keyed by
//! a stable [`Guid`] so that serialized data can be matched against types
//! registered in another process.

use std::{
    alloc::Layout,
    any::TypeId,
    fmt,
    mem,
    sync::Arc,
};

use bytemuck::Pod;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    array::{self, InlineArray},
    chunk::CHUNK_ALIGN,
    entity::{Entity, EntityMapper},
    serialize::Serializer,
};

/// Marker trait for Rust types registered through [`TypeRegistry::new_type_of`].
pub trait Component: Default + Clone + Send + Sync + 'static {}

impl<T: Default + Clone + Send + Sync + 'static> Component for T {}

/// Dense index of a registered type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(u32);

impl TypeIndex {
    /// Tag carried by destroyed entities that still hold pinned components.
    pub const DEAD: Self = Self(0);
    /// Tag that hides entities from queries that do not ask for it.
    pub const DISABLED: Self = Self(1);
    /// Tag marking prefab entities; stripped on instantiate.
    pub const PREFAB: Self = Self(2);

    /// Create a type index from a raw value.
    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Check if this is one of the built-in group tags.
    #[must_use]
    pub const fn is_builtin_tag(self) -> bool {
        self.0 <= Self::PREFAB.0
    }
}

impl fmt::Debug for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeIndex({})", self.0)
    }
}

/// Globally unique, stable type identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(u128);

impl Guid {
    /// The nil guid. Never valid for a registered type.
    pub const NIL: Self = Self(0);

    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Derive a guid from a name with 128-bit FNV-1a.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        const OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
        const PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

        let bytes = name.as_bytes();
        let mut hash = OFFSET;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u128;
            hash = hash.wrapping_mul(PRIME);
            i += 1;
        }
        Self(hash)
    }

    /// Parse the hyphenated `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
    #[must_use]
    pub fn parse_str(text: &str) -> Option<Self> {
        let text = text.trim();
        let bytes = text.as_bytes();
        if bytes.len() != 36 {
            return None;
        }

        let mut value: u128 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if matches!(i, 8 | 13 | 18 | 23) {
                if b != b'-' {
                    return None;
                }
                continue;
            }
            let digit = (b as char).to_digit(16)?;
            value = (value << 4) | u128::from(digit);
        }
        Some(Self(value))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

/// Storage shape of a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    /// Plain data stored per row.
    Data,
    /// Zero-sized marker; takes no space in a chunk.
    Tag,
    /// Inline array with a length header.
    Array {
        element_size: usize,
        element_align: usize,
        capacity: usize,
    },
}

/// Whether a component is dropped with its entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Retention {
    /// Destroyed together with the entity.
    #[default]
    Managed,
    /// Survives destroy; the entity lingers as dead until every pinned
    /// component is removed.
    Pinned,
}

/// Lifecycle callbacks for type-erased component data.
///
/// Missing callbacks fall back to zero-fill (construct), `memcpy` (copy and
/// relocate), no-op (destruct), raw bytes or skip (serialize) and the
/// registered entity field offsets (map).
#[derive(Clone, Copy, Default)]
pub struct TypeCallbacks {
    pub constructor: Option<unsafe fn(*mut u8)>,
    /// `(dst, src)`: dst is uninitialized, src stays valid.
    pub copy: Option<unsafe fn(*mut u8, *const u8)>,
    /// `(dst, src)`: dst is uninitialized, src is moved out.
    pub relocate: Option<unsafe fn(*mut u8, *mut u8)>,
    pub destructor: Option<unsafe fn(*mut u8)>,
    pub serialize: Option<unsafe fn(*mut u8, &mut dyn Serializer)>,
    pub map: Option<unsafe fn(*mut u8, &mut dyn EntityMapper)>,
}

impl TypeCallbacks {
    /// Callbacks for a Rust type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            constructor: Some(construct_erased::<T>),
            copy: Some(copy_erased::<T>),
            relocate: None,
            destructor: if mem::needs_drop::<T>() {
                Some(drop_erased::<T>)
            } else {
                None
            },
            serialize: None,
            map: None,
        }
    }

    /// Callbacks for an inline array of `T`.
    #[must_use]
    pub fn array_of<T: Component>() -> Self {
        Self {
            constructor: Some(array::construct_array),
            copy: Some(array::copy_array::<T>),
            relocate: None,
            destructor: if mem::needs_drop::<T>() {
                Some(array::drop_array::<T>)
            } else {
                None
            },
            serialize: None,
            map: None,
        }
    }
}

impl fmt::Debug for TypeCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCallbacks")
            .field("constructor", &self.constructor.is_some())
            .field("copy", &self.copy.is_some())
            .field("relocate", &self.relocate.is_some())
            .field("destructor", &self.destructor.is_some())
            .field("serialize", &self.serialize.is_some())
            .field("map", &self.map.is_some())
            .finish()
    }
}

unsafe fn construct_erased<T: Component>(ptr: *mut u8) {
    unsafe { ptr.cast::<T>().write(T::default()) };
}

unsafe fn copy_erased<T: Component>(dst: *mut u8, src: *const u8) {
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) };
}

unsafe fn drop_erased<T>(ptr: *mut u8) {
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) };
}

/// Runtime description of a registered type.
#[derive(Clone)]
pub struct TypeDescription {
    index: TypeIndex,
    guid: Guid,
    name: String,
    size: usize,
    alignment: usize,
    kind: TypeKind,
    retention: Retention,
    callbacks: TypeCallbacks,
    entity_fields: SmallVec<[u32; 4]>,
    type_id: Option<TypeId>,
    pod: bool,
}

impl TypeDescription {
    #[must_use]
    pub const fn index(&self) -> TypeIndex {
        self.index
    }

    #[must_use]
    pub const fn guid(&self) -> Guid {
        self.guid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes per row. Zero for tags.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Element size for array types, zero otherwise.
    #[must_use]
    pub const fn element_size(&self) -> usize {
        match self.kind {
            TypeKind::Array { element_size, .. } => element_size,
            _ => 0,
        }
    }

    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    #[must_use]
    pub const fn is_tag(&self) -> bool {
        matches!(self.kind, TypeKind::Tag)
    }

    /// Inline slot count for array types.
    #[must_use]
    pub const fn array_capacity(&self) -> Option<usize> {
        match self.kind {
            TypeKind::Array { capacity, .. } => Some(capacity),
            _ => None,
        }
    }

    #[must_use]
    pub const fn retention(&self) -> Retention {
        self.retention
    }

    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        matches!(self.retention, Retention::Pinned)
    }

    #[must_use]
    pub const fn callbacks(&self) -> &TypeCallbacks {
        &self.callbacks
    }

    /// Byte offsets of `Entity` fields inside the component.
    #[must_use]
    pub fn entity_fields(&self) -> &[u32] {
        &self.entity_fields
    }

    /// Rust type of the data (element type for arrays), if known.
    #[must_use]
    pub const fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    /// Registered through [`TypeRegistry::new_pod_type_of`]; any byte
    /// pattern of the right size is a valid value.
    #[must_use]
    pub const fn is_pod(&self) -> bool {
        self.pod
    }
}

impl fmt::Debug for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescription")
            .field("index", &self.index)
            .field("guid", &self.guid)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.alignment)
            .field("kind", &self.kind)
            .field("retention", &self.retention)
            .field("pod", &self.pod)
            .finish()
    }
}

/// Errors returned by [`TypeBuilder::commit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeRegisterError {
    #[error("data type has zero size")]
    ZeroSize,
    #[error("array type has zero element count")]
    ZeroArrayLength,
    #[error("guid is nil")]
    InvalidGuid,
    #[error("invalid type name {0:?}")]
    InvalidName(String),
    #[error("alignment {0} is not a power of two up to the chunk alignment")]
    InvalidAlignment(usize),
    #[error("guid {0} already exists")]
    GuidAlreadyExists(Guid),
    #[error("type name {0:?} already exists")]
    NameAlreadyExists(String),
    #[error("size {size} and alignment {alignment} do not match the Rust type")]
    LayoutMismatch { size: usize, alignment: usize },
    #[error("entity field at offset {0} does not fit in the type")]
    EntityFieldOutOfBounds(usize),
}

/// Result type for type registration.
pub type Result<T, E = TypeRegisterError> = std::result::Result<T, E>;

#[derive(Default)]
struct RegistryInner {
    descs: Vec<Arc<TypeDescription>>,
    by_guid: FxHashMap<Guid, TypeIndex>,
    by_name: FxHashMap<String, TypeIndex>,
    by_type_id: FxHashMap<TypeId, TypeIndex>,
}

/// Registry of component types.
///
/// Shared between storages as `Arc<TypeRegistry>`; registration takes a write
/// lock, lookups a read lock.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding the built-in `DEAD`, `DISABLED` and `PREFAB` tags.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
        };
        for (name, expected) in [
            ("sugoi::Dead", TypeIndex::DEAD),
            ("sugoi::Disabled", TypeIndex::DISABLED),
            ("sugoi::Prefab", TypeIndex::PREFAB),
        ] {
            let index = registry
                .new_type()
                .guid(Guid::from_name(name))
                .name(name)
                .tag()
                .commit();
            debug_assert_eq!(index, Ok(expected));
        }
        registry
    }

    /// Start describing a type from scratch. Guid and name are required.
    #[must_use]
    pub fn new_type(&self) -> TypeBuilder<'_> {
        TypeBuilder {
            registry: self,
            guid: Guid::NIL,
            name: String::new(),
            size: 0,
            alignment: 1,
            kind: TypeKind::Data,
            retention: Retention::Managed,
            callbacks: TypeCallbacks::default(),
            entity_fields: SmallVec::new(),
            type_id: None,
            rust_layout: None,
            pod: false,
        }
    }

    /// Start describing a Rust type. Zero-sized types become tags.
    ///
    /// The name defaults to the last path segment of the type name and the
    /// guid to [`Guid::from_name`] of the full type name.
    #[must_use]
    pub fn new_type_of<T: Component>(&self) -> TypeBuilder<'_> {
        let full_name = std::any::type_name::<T>();
        let builder = self
            .new_type()
            .guid(Guid::from_name(full_name))
            .name(short_type_name(full_name));

        let mut builder = if mem::size_of::<T>() == 0 {
            builder.tag()
        } else {
            builder
                .size(mem::size_of::<T>())
                .alignment(mem::align_of::<T>())
        };
        builder.callbacks = TypeCallbacks::of::<T>();
        builder.type_id = Some(TypeId::of::<T>());
        builder.rust_layout = Some(Layout::new::<T>());
        builder
    }

    /// Like [`TypeRegistry::new_type_of`] for plain-old-data types, which
    /// snapshots store as raw bytes.
    #[must_use]
    pub fn new_pod_type_of<T: Component + Pod>(&self) -> TypeBuilder<'_> {
        let mut builder = self.new_type_of::<T>();
        builder.pod = true;
        builder
    }

    /// Start describing an inline array of `N` elements of `T`.
    #[must_use]
    pub fn new_array<T: Component, const N: usize>(&self) -> TypeBuilder<'_> {
        let full_name = std::any::type_name::<InlineArray<T, N>>();
        let mut builder = self
            .new_type()
            .guid(Guid::from_name(full_name))
            .name(format!("{}Array", short_type_name(std::any::type_name::<T>())));
        builder.callbacks = TypeCallbacks::array_of::<T>();
        builder.rust_layout = Some(Layout::new::<T>());
        builder.kind = TypeKind::Array {
            element_size: mem::size_of::<T>(),
            element_align: mem::align_of::<T>(),
            capacity: N,
        };
        builder.type_id = Some(TypeId::of::<T>());
        builder
    }

    /// Register a Rust type with default settings, or return its index if it
    /// was registered before.
    pub fn register<T: Component>(&self) -> Result<TypeIndex> {
        if let Some(index) = self.id_of::<T>() {
            return Ok(index);
        }
        self.new_type_of::<T>().commit()
    }

    /// Register a plain-old-data Rust type, or return its index if it was
    /// registered before.
    pub fn register_pod<T: Component + Pod>(&self) -> Result<TypeIndex> {
        if let Some(index) = self.id_of::<T>() {
            return Ok(index);
        }
        self.new_pod_type_of::<T>().commit()
    }

    /// Find a type by guid.
    #[must_use]
    pub fn get_type(&self, guid: Guid) -> Option<TypeIndex> {
        self.inner.read().by_guid.get(&guid).copied()
    }

    /// Find a type by name.
    #[must_use]
    pub fn get_type_by_name(&self, name: &str) -> Option<TypeIndex> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Find the type registered for a Rust type.
    #[must_use]
    pub fn id_of<T: 'static>(&self) -> Option<TypeIndex> {
        self.inner.read().by_type_id.get(&TypeId::of::<T>()).copied()
    }

    #[must_use]
    pub fn get_desc(&self, index: TypeIndex) -> Option<Arc<TypeDescription>> {
        self.inner.read().descs.get(index.0 as usize).cloned()
    }

    /// Get a description that must exist.
    pub(crate) fn desc(&self, index: TypeIndex) -> Arc<TypeDescription> {
        self.get_desc(index)
            .unwrap_or_else(|| panic!("type {index:?} is not registered"))
    }

    /// Number of registered types, built-ins included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().descs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, mut desc: TypeDescription) -> Result<TypeIndex> {
        let mut inner = self.inner.write();

        if inner.by_guid.contains_key(&desc.guid) {
            return Err(TypeRegisterError::GuidAlreadyExists(desc.guid));
        }
        if inner.by_name.contains_key(&desc.name) {
            return Err(TypeRegisterError::NameAlreadyExists(desc.name));
        }

        let index = TypeIndex(inner.descs.len() as u32);
        desc.index = index;

        inner.by_guid.insert(desc.guid, index);
        inner.by_name.insert(desc.name.clone(), index);
        // Arrays share the element TypeId; only plain types are found by id_of
        if let (Some(type_id), TypeKind::Data | TypeKind::Tag) = (desc.type_id, desc.kind) {
            inner.by_type_id.entry(type_id).or_insert(index);
        }

        tracing::debug!(?index, guid = %desc.guid, name = %desc.name, size = desc.size, "registered type");
        inner.descs.push(Arc::new(desc));
        Ok(index)
    }
}

/// Builder returned by the `new_*` methods of [`TypeRegistry`].
#[must_use]
pub struct TypeBuilder<'a> {
    registry: &'a TypeRegistry,
    guid: Guid,
    name: String,
    size: usize,
    alignment: usize,
    kind: TypeKind,
    retention: Retention,
    callbacks: TypeCallbacks,
    entity_fields: SmallVec<[u32; 4]>,
    type_id: Option<TypeId>,
    rust_layout: Option<Layout>,
    pod: bool,
}

impl TypeBuilder<'_> {
    pub fn guid(mut self, guid: Guid) -> Self {
        self.guid = guid;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Declare a zero-sized tag.
    pub fn tag(mut self) -> Self {
        self.kind = TypeKind::Tag;
        self.size = 0;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.retention = Retention::Pinned;
        self
    }

    /// Override the inline element count of an array type.
    pub fn element_count(mut self, count: usize) -> Self {
        if let TypeKind::Array { capacity, .. } = &mut self.kind {
            *capacity = count;
        }
        self
    }

    /// Declare an `Entity` field at a byte offset, remapped on copy and merge.
    ///
    /// # Safety
    ///
    /// Every value of the type must hold an [`Entity`] at `offset`.
    pub unsafe fn entity_field(mut self, offset: usize) -> Self {
        self.entity_fields
            .push(u32::try_from(offset).unwrap_or(u32::MAX));
        self
    }

    /// Replace the lifecycle callbacks.
    ///
    /// # Safety
    ///
    /// The callbacks must treat rows as values of this type's size and
    /// alignment. For a Rust type they must construct, copy, move and drop
    /// valid values of that type.
    pub unsafe fn callbacks(mut self, callbacks: TypeCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Validate and register the type.
    pub fn commit(self) -> Result<TypeIndex> {
        if self.guid.is_nil() {
            return Err(TypeRegisterError::InvalidGuid);
        }
        if !is_valid_name(&self.name) {
            return Err(TypeRegisterError::InvalidName(self.name));
        }

        let (size, alignment) = match self.kind {
            TypeKind::Tag => {
                let alignment = self.rust_layout.map_or(1, |layout| layout.align());
                check_alignment(alignment)?;
                (0, alignment)
            }
            TypeKind::Data => {
                if self.size == 0 {
                    return Err(TypeRegisterError::ZeroSize);
                }
                check_alignment(self.alignment)?;
                (self.size, self.alignment)
            }
            TypeKind::Array {
                element_size,
                element_align,
                capacity,
            } => {
                if capacity == 0 {
                    return Err(TypeRegisterError::ZeroArrayLength);
                }
                if element_size == 0 {
                    return Err(TypeRegisterError::ZeroSize);
                }
                check_alignment(element_align)?;
                let element = Layout::from_size_align(element_size, element_align)
                    .map_err(|_| TypeRegisterError::InvalidAlignment(element_align))?;
                let layout = array::array_layout(element, capacity)
                    .ok_or(TypeRegisterError::ZeroSize)?;
                (layout.size(), layout.align())
            }
        };

        if let Some(layout) = self.rust_layout {
            let matches = match self.kind {
                TypeKind::Tag => layout.size() == 0,
                TypeKind::Data => layout.size() == size && layout.align() == alignment,
                TypeKind::Array {
                    element_size,
                    element_align,
                    ..
                } => layout.size() == element_size && layout.align() == element_align,
            };
            if !matches {
                return Err(TypeRegisterError::LayoutMismatch { size, alignment });
            }
        }
        for &offset in &self.entity_fields {
            let offset = offset as usize;
            if offset
                .checked_add(mem::size_of::<Entity>())
                .is_none_or(|end| end > size)
            {
                return Err(TypeRegisterError::EntityFieldOutOfBounds(offset));
            }
        }

        self.registry.insert(TypeDescription {
            index: TypeIndex(u32::MAX),
            guid: self.guid,
            name: self.name,
            size,
            alignment,
            kind: self.kind,
            retention: self.retention,
            callbacks: self.callbacks,
            entity_fields: self.entity_fields,
            type_id: self.type_id,
            pod: self.pod && matches!(self.kind, TypeKind::Data),
        })
    }
}

fn check_alignment(alignment: usize) -> Result<()> {
    if alignment.is_power_of_two() && alignment <= CHUNK_ALIGN {
        Ok(())
    } else {
        Err(TypeRegisterError::InvalidAlignment(alignment))
    }
}

/// Names may not be empty, contain whitespace, or use filter syntax characters.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| !c.is_whitespace() && !",|!?$[]<>".contains(c))
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
