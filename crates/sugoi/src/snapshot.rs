//! Storage snapshots over the [`Serializer`] trait.
//!
//! Layout, little endian:
//!
//! ```text
//! magic "SUGO" | version u32 | group count u32
//! per group:
//!   type count u32 | type guids u128...
//!   meta count u32 | meta entity bits u32...
//!   row count u32  | entity bits u32...
//!   per data type: mode u8, then
//!     raw:    element size u32, row bytes
//!     custom: serialize callback output per row
//! ```
//!
//! Types with a serialize callback are written through it. Types registered
//! as plain old data are written as raw bytes. Anything else is skipped and
//! comes back default-constructed.

use std::ptr;

use tracing::debug;

use crate::{
    chunk::ChunkView,
    entity::{Entity, EntityLocation},
    group::TypeSlot,
    serialize::{SerializeError, Serializer},
    storage::{Storage, row_ptr},
    type_registry::{Guid, TypeIndex},
    type_set::{EntityType, MetaSet, TypeSet},
};

const MAGIC: [u8; 4] = *b"SUGO";
const VERSION: u32 = 1;

const MODE_SKIP: u8 = 0;
const MODE_RAW: u8 = 1;
const MODE_CUSTOM: u8 = 2;

fn slot_mode(slot: &TypeSlot) -> u8 {
    if slot.callbacks.serialize.is_some() {
        MODE_CUSTOM
    } else if slot.pod {
        MODE_RAW
    } else {
        MODE_SKIP
    }
}

impl Storage {
    /// Write every entity and its serializable components.
    ///
    /// Dead markers and empty groups are written like any other group.
    pub fn serialize(&self, s: &mut dyn Serializer) {
        debug_assert!(s.is_serialize(), "serialize called with a reading serializer");

        let mut magic = MAGIC;
        s.stream(&mut magic);
        let mut version = VERSION;
        s.stream_u32(&mut version);

        let groups: Vec<_> = self.groups().filter(|g| !g.is_empty()).collect();
        s.stream_u32(&mut (groups.len() as u32));

        for group in &groups {
            s.stream_u32(&mut (group.owned_types().len() as u32));
            for &ty in group.owned_types() {
                s.stream_u128(&mut self.registry.desc(ty).guid().as_u128());
            }
            s.stream_u32(&mut (group.meta().len() as u32));
            for meta in group.meta() {
                s.stream_u32(&mut meta.to_bits());
            }

            s.stream_u32(&mut (group.len() as u32));
            for &handle in group.chunks() {
                for entity in self.arena.get(handle).entities() {
                    s.stream_u32(&mut entity.to_bits());
                }
            }

            for slot in group.slots().iter().filter(|slot| slot.size > 0) {
                let mut mode = slot_mode(slot);
                s.stream_u8(&mut mode);
                match mode {
                    MODE_RAW => {
                        s.stream_u32(&mut (slot.size as u32));
                        let mut buffer = Vec::new();
                        for &handle in group.chunks() {
                            let chunk = self.arena.get(handle);
                            let len = slot.size * chunk.count as usize;
                            buffer.resize(len, 0);
                            // SAFETY: rows below count are live pod values
                            unsafe { ptr::copy_nonoverlapping(row_ptr(chunk, slot, 0), buffer.as_mut_ptr(), len) };
                            s.stream(&mut buffer);
                        }
                    }
                    MODE_CUSTOM => {
                        let Some(serialize) = slot.callbacks.serialize else {
                            continue;
                        };
                        for &handle in group.chunks() {
                            let chunk = self.arena.get(handle);
                            for row in 0..chunk.count as usize {
                                // SAFETY: the row is live; writing only reads it
                                unsafe { serialize(row_ptr(chunk, slot, row), &mut *s) };
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        debug!(storage = ?self.id, groups = groups.len(), entities = self.entity_count(), "serialized storage");
    }

    /// Restore a snapshot into an empty storage, keeping the exact entity handles.
    ///
    /// On error the storage is reset.
    pub fn deserialize(&mut self, s: &mut dyn Serializer) -> Result<(), SerializeError> {
        debug_assert!(!s.is_serialize(), "deserialize called with a writing serializer");
        if self.entity_count() > 0 {
            return Err(SerializeError::NotEmpty);
        }

        match self.read_snapshot(s) {
            Ok(count) => {
                self.entities.rebuild_free_list();
                self.refresh_all_shared();
                self.epoch += 1;
                debug!(storage = ?self.id, entities = count, "deserialized storage");
                Ok(())
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    fn read_snapshot(&mut self, s: &mut dyn Serializer) -> Result<usize, SerializeError> {
        let mut magic = [0u8; 4];
        s.peek(&mut magic);
        if magic != MAGIC {
            return Err(SerializeError::InvalidHeader);
        }
        s.stream(&mut magic);
        let mut version = 0;
        s.stream_u32(&mut version);
        if version != VERSION {
            return Err(SerializeError::InvalidHeader);
        }

        let mut group_count = 0;
        s.stream_u32(&mut group_count);
        if s.failed() {
            return Err(SerializeError::Truncated);
        }
        let mut total = 0;
        for _ in 0..group_count {
            total += self.read_group(s)?;
        }
        Ok(total)
    }

    fn read_group(&mut self, s: &mut dyn Serializer) -> Result<usize, SerializeError> {
        let mut type_count = 0;
        s.stream_u32(&mut type_count);
        let mut stream_order = Vec::new();
        for _ in 0..type_count {
            let mut bits = 0;
            s.stream_u128(&mut bits);
            if s.failed() {
                return Err(SerializeError::Truncated);
            }
            let guid = Guid::from_u128(bits);
            let ty = self
                .registry
                .get_type(guid)
                .ok_or(SerializeError::UnknownGuid(guid))?;
            stream_order.push(ty);
        }

        let mut meta_count = 0;
        s.stream_u32(&mut meta_count);
        let mut meta = MetaSet::new();
        for _ in 0..meta_count {
            let mut bits = 0;
            s.stream_u32(&mut bits);
            if s.failed() {
                return Err(SerializeError::Truncated);
            }
            meta.insert(Entity::from_bits(bits));
        }

        let mut count = 0;
        s.stream_u32(&mut count);
        let mut ids = Vec::new();
        for _ in 0..count {
            let mut bits = 0;
            s.stream_u32(&mut bits);
            if s.failed() {
                return Err(SerializeError::Truncated);
            }
            ids.push(Entity::from_bits(bits));
        }
        if count == 0 {
            return Ok(0);
        }

        let types: TypeSet = stream_order.iter().copied().collect();
        let id = self.get_or_create_group(&EntityType::new(types, meta));
        let views = self.reserve_rows(id, count);
        for &view in &views {
            self.construct_view(view);
        }
        self.claim_ids(&views, &ids)?;

        for &ty in &stream_order {
            self.read_column(s, &views, ty)?;
        }
        if s.failed() {
            return Err(SerializeError::Truncated);
        }
        Ok(ids.len())
    }

    fn claim_ids(&mut self, views: &[ChunkView], ids: &[Entity]) -> Result<(), SerializeError> {
        let mut next = ids.iter();
        for view in views {
            let slots = self.arena.get(view.chunk).entities_ptr();
            for row in view.rows() {
                let Some(&entity) = next.next() else {
                    return Err(SerializeError::Truncated);
                };
                let location = EntityLocation {
                    chunk: view.chunk,
                    row: row as u32,
                };
                if entity.is_null() || !self.entities.claim(entity, location) {
                    return Err(SerializeError::InvalidEntity(entity));
                }
                // SAFETY: row is inside the chunk
                unsafe { slots.add(row).write(entity) };
            }
        }
        Ok(())
    }

    fn read_column(
        &mut self,
        s: &mut dyn Serializer,
        views: &[ChunkView],
        ty: TypeIndex,
    ) -> Result<(), SerializeError> {
        let Some(first) = views.first() else {
            return Ok(());
        };
        let group = self.group_ref(self.arena.get(first.chunk).group);
        let Some(slot) = group.slot(ty) else {
            return Ok(());
        };
        if slot.size == 0 {
            return Ok(());
        }
        let slot = slot.clone();

        let mut mode = 0;
        s.stream_u8(&mut mode);
        match mode {
            MODE_SKIP => {}
            MODE_RAW => {
                let mut size = 0;
                s.stream_u32(&mut size);
                if !slot.pod {
                    return Err(SerializeError::NotPod(self.registry.desc(ty).guid()));
                }
                if size as usize != slot.size {
                    return Err(SerializeError::InvalidHeader);
                }
                let mut buffer = Vec::new();
                for view in views {
                    let chunk = self.arena.get(view.chunk);
                    let len = slot.size * view.count as usize;
                    buffer.resize(len, 0);
                    s.stream(&mut buffer);
                    // SAFETY: any bytes are a valid pod value
                    unsafe {
                        ptr::copy_nonoverlapping(buffer.as_ptr(), row_ptr(chunk, &slot, view.start as usize), len);
                    }
                }
            }
            MODE_CUSTOM => {
                let guid = self.registry.desc(ty).guid();
                let serialize = slot.callbacks.serialize.ok_or(SerializeError::MissingCallback(guid))?;
                for view in views {
                    let chunk = self.arena.get(view.chunk);
                    for row in view.rows() {
                        // SAFETY: the row holds a constructed value the
                        // callback overwrites in place
                        unsafe { serialize(row_ptr(chunk, &slot, row), &mut *s) };
                    }
                }
            }
            _ => return Err(SerializeError::InvalidHeader),
        }
        Ok(())
    }
}
