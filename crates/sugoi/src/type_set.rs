//! Sorted, deduplicated sets of type indices and meta entities.
//!
//! Everything that identifies a group is kept sorted so two sets can be
//! compared and diffed with a single merge pass.

use std::{cmp::Ordering, fmt, ops::Deref};

use smallvec::SmallVec;

use crate::{entity::Entity, type_registry::TypeIndex};

/// A sorted set backed by a `SmallVec`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SortedSet<T: Ord + Copy>(SmallVec<[T; 8]>);

/// Owned component types of a group.
pub type TypeSet = SortedSet<TypeIndex>;

/// Meta entities of a group.
pub type MetaSet = SortedSet<Entity>;

impl<T: Ord + Copy> Default for SortedSet<T> {
    fn default() -> Self {
        Self(SmallVec::new())
    }
}

impl<T: Ord + Copy> SortedSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a slice that is already sorted and deduplicated.
    #[must_use]
    pub fn from_sorted(items: &[T]) -> Self {
        debug_assert!(
            items.windows(2).all(|w| w[0] < w[1]),
            "set is not sorted"
        );
        Self(SmallVec::from_slice(items))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    #[must_use]
    pub fn contains(&self, item: T) -> bool {
        self.0.binary_search(&item).is_ok()
    }

    /// Insert an item, returning `false` if it was already present.
    pub fn insert(&mut self, item: T) -> bool {
        match self.0.binary_search(&item) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, item);
                true
            }
        }
    }

    /// Remove an item, returning `false` if it was not present.
    pub fn remove(&mut self, item: T) -> bool {
        match self.0.binary_search(&item) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let (a, b) = (self.as_slice(), other.as_slice());
        let mut out = SmallVec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                Ordering::Less => {
                    out.push(a[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(b[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);
        Self(out)
    }

    /// Items of `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let b = other.as_slice();
        let mut j = 0;
        let mut out = SmallVec::new();
        for &item in self.as_slice() {
            while j < b.len() && b[j] < item {
                j += 1;
            }
            if j >= b.len() || b[j] != item {
                out.push(item);
            }
        }
        Self(out)
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let b = other.as_slice();
        let mut j = 0;
        let mut out = SmallVec::new();
        for &item in self.as_slice() {
            while j < b.len() && b[j] < item {
                j += 1;
            }
            if j < b.len() && b[j] == item {
                out.push(item);
            }
        }
        Self(out)
    }

    /// Check if every item of `self` is in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        is_subset(self.as_slice(), other.as_slice())
    }

    /// Check if `self` and `other` share at least one item.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        intersects(self.as_slice(), other.as_slice())
    }
}

impl<T: Ord + Copy> Deref for SortedSet<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Ord + Copy> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut items: SmallVec<[T; 8]> = iter.into_iter().collect();
        items.sort_unstable();
        items.dedup();
        Self(items)
    }
}

impl<T: Ord + Copy, const N: usize> From<[T; N]> for SortedSet<T> {
    fn from(items: [T; N]) -> Self {
        items.into_iter().collect()
    }
}

impl<'a, T: Ord + Copy> IntoIterator for &'a SortedSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T: Ord + Copy + fmt::Debug> fmt::Debug for SortedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

/// Sorted-merge subset test: every item of `a` is in `b`.
///
/// Both slices must be sorted ascending.
#[must_use]
pub fn is_subset<T: Ord>(a: &[T], b: &[T]) -> bool {
    if a.len() > b.len() {
        return false;
    }
    let mut j = 0;
    for item in a {
        while j < b.len() && b[j] < *item {
            j += 1;
        }
        if j >= b.len() || b[j] != *item {
            return false;
        }
        j += 1;
    }
    true
}

/// Sorted-merge intersection test.
///
/// Both slices must be sorted ascending.
#[must_use]
pub fn intersects<T: Ord>(a: &[T], b: &[T]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => return true,
        }
    }
    false
}

/// The key of a group: owned types plus meta entities.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct EntityType {
    pub types: TypeSet,
    pub meta: MetaSet,
}

impl EntityType {
    #[must_use]
    pub fn new(types: TypeSet, meta: MetaSet) -> Self {
        Self { types, meta }
    }

    /// An entity type with the given owned types and no meta entities.
    #[must_use]
    pub fn of(types: &[TypeIndex]) -> Self {
        Self {
            types: types.iter().copied().collect(),
            meta: MetaSet::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, ty: TypeIndex) -> Self {
        self.types.insert(ty);
        self
    }

    #[must_use]
    pub fn without(mut self, ty: TypeIndex) -> Self {
        self.types.remove(ty);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Entity) -> Self {
        self.meta.insert(meta);
        self
    }

    #[must_use]
    pub fn without_meta(mut self, meta: Entity) -> Self {
        self.meta.remove(meta);
        self
    }

    /// `(self ∪ added) \ removed`, applied to both types and meta.
    #[must_use]
    pub fn apply(&self, delta: &DeltaType) -> Self {
        Self {
            types: self
                .types
                .union(&delta.added.types)
                .difference(&delta.removed.types),
            meta: self
                .meta
                .union(&delta.added.meta)
                .difference(&delta.removed.meta),
        }
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.meta.is_empty() {
            write!(f, "{:?}", self.types)
        } else {
            write!(f, "{:?} meta {:?}", self.types, self.meta)
        }
    }
}

/// A structural change: types and meta entities to add and remove.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaType {
    pub added: EntityType,
    pub removed: EntityType,
}

impl DeltaType {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add(mut self, ty: TypeIndex) -> Self {
        self.added.types.insert(ty);
        self
    }

    #[must_use]
    pub fn remove(mut self, ty: TypeIndex) -> Self {
        self.removed.types.insert(ty);
        self
    }

    #[must_use]
    pub fn add_meta(mut self, meta: Entity) -> Self {
        self.added.meta.insert(meta);
        self
    }

    #[must_use]
    pub fn remove_meta(mut self, meta: Entity) -> Self {
        self.removed.meta.insert(meta);
        self
    }

    /// The delta that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            added: self.removed.clone(),
            removed: self.added.clone(),
        }
    }
}
