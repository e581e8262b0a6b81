//! Integration tests for sugoi storage

#![allow(unsafe_code)]

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use sugoi::{
    ByteReader, ByteWriter, DeltaType, Entity, EntityType, Guid, InlineArray, Query,
    SerializeError, Serializer, Storage, TypeCallbacks, TypeIndex, TypeRegisterError,
    TypeRegistry,
};

// ============================================================================
// Test Components
// ============================================================================

#[derive(Default, Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Default, Clone, Copy, Debug, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Default, Clone, Debug, PartialEq)]
struct Name(String);

#[derive(Default, Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
struct Parent(Entity);

#[derive(Default, Clone, Copy, Debug, PartialEq)]
struct GpuHandle(u64);

unsafe fn serialize_name(ptr: *mut u8, s: &mut dyn Serializer) {
    let name = unsafe { &mut *ptr.cast::<Name>() };
    let mut len = name.0.len() as u32;
    s.stream_u32(&mut len);
    if s.is_serialize() {
        let mut bytes = name.0.clone().into_bytes();
        s.stream(&mut bytes);
    } else {
        let mut bytes = vec![0; len as usize];
        s.stream(&mut bytes);
        name.0 = String::from_utf8(bytes).unwrap_or_default();
    }
}

struct Types {
    position: TypeIndex,
    velocity: TypeIndex,
    name: TypeIndex,
    parent: TypeIndex,
    handle: TypeIndex,
}

fn setup() -> (Arc<TypeRegistry>, Types) {
    let registry = Arc::new(TypeRegistry::new());
    let types = Types {
        position: registry.register_pod::<Position>().unwrap(),
        velocity: registry.register::<Velocity>().unwrap(),
        // SAFETY: the callbacks are Name's own plus a serializer for it
        name: unsafe {
            registry.new_type_of::<Name>().callbacks(TypeCallbacks {
                serialize: Some(serialize_name),
                ..TypeCallbacks::of::<Name>()
            })
        }
        .commit()
        .unwrap(),
        // SAFETY: Parent is a transparent Entity
        parent: unsafe { registry.new_pod_type_of::<Parent>().entity_field(0) }
            .commit()
            .unwrap(),
        handle: registry
            .new_type_of::<GpuHandle>()
            .pinned()
            .commit()
            .unwrap(),
    };
    (registry, types)
}

/// Every live entity resolves to a row holding it.
fn assert_index_consistent(storage: &Storage, entities: &[Entity]) {
    for &entity in entities {
        if let Some(view) = storage.access(entity) {
            assert_eq!(storage.entities(view), &[entity]);
        }
    }
}

// ============================================================================
// Entity and Type Tests
// ============================================================================

#[test]
fn test_entity_bits_round_trip() {
    for id in (0..1u32 << 24).step_by(4099).chain([0, 1, (1 << 24) - 1]) {
        for version in 0..=u8::MAX {
            let entity = Entity::new(id, version);
            assert_eq!(entity.id(), id);
            assert_eq!(entity.version(), version);
            assert_eq!(Entity::from_bits(entity.to_bits()), entity);
            assert_eq!(entity.to_bits(), id | (u32::from(version) << 24));
        }
    }
}

#[test]
fn test_registration_errors() {
    let registry = TypeRegistry::new();
    assert_eq!(
        registry
            .new_type()
            .guid(Guid::from_name("empty"))
            .name("Empty")
            .size(0)
            .commit(),
        Err(TypeRegisterError::ZeroSize)
    );

    let guid = Guid::from_name("mass");
    registry
        .new_type()
        .guid(guid)
        .name("Mass")
        .size(4)
        .alignment(4)
        .commit()
        .unwrap();
    assert_eq!(
        registry
            .new_type()
            .guid(guid)
            .name("Weight")
            .size(4)
            .commit(),
        Err(TypeRegisterError::GuidAlreadyExists(guid))
    );
    assert_eq!(
        registry
            .new_type()
            .guid(Guid::from_name("mass2"))
            .name("Mass")
            .size(4)
            .commit(),
        Err(TypeRegisterError::NameAlreadyExists("Mass".into()))
    );
}

#[test]
fn test_array_sizing() {
    let registry = TypeRegistry::new();
    let five = registry.new_array::<u32, 5>().commit().unwrap();
    let fifteen = registry
        .new_array::<u32, 5>()
        .guid(Guid::from_name("slots15"))
        .name("Slots15")
        .element_count(15)
        .commit()
        .unwrap();

    let five = registry.get_desc(five).unwrap();
    let fifteen = registry.get_desc(fifteen).unwrap();
    assert_eq!(five.size(), size_of::<InlineArray<u32, 5>>());
    assert_eq!(fifteen.size(), size_of::<InlineArray<u32, 15>>());
    assert_eq!(five.array_capacity(), Some(5));
    assert_eq!(fifteen.array_capacity(), Some(15));
}

// ============================================================================
// Structural Change Tests
// ============================================================================

#[test]
fn test_allocate_then_query() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let ty = EntityType::of(&[t.position, t.velocity]);

    let mut next = 0;
    storage.allocate(&ty, 1000, |access, view| {
        for position in access.component_mut::<Position>(view, t.position).unwrap() {
            position.x = next as f32;
            next += 1;
        }
    });

    let query = Query::builder(&storage)
        .read(t.position)
        .read(t.velocity)
        .build()
        .unwrap();
    assert_eq!(storage.count(&query), 1000);

    let mut seen: Vec<u32> = storage
        .query(&query)
        .into_iter()
        .flat_map(|view| {
            storage
                .component::<Position>(view, t.position)
                .unwrap()
                .iter()
                .map(|p| p.x as u32)
                .collect::<Vec<_>>()
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..1000).collect::<Vec<_>>());
}

#[test]
fn test_none_filter_and_meta_partition() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    storage.allocate_entities(&EntityType::of(&[t.position]), 10);
    storage.allocate_entities(&EntityType::of(&[t.position, t.velocity]), 5);

    let without = Query::builder(&storage)
        .read(t.position)
        .without(t.velocity)
        .build()
        .unwrap();
    let with = Query::builder(&storage)
        .read(t.position)
        .with(t.velocity)
        .build()
        .unwrap();
    assert_eq!(storage.count(&without), 10);
    assert_eq!(storage.count(&with), 5);

    let meta = storage.allocate_entities(&EntityType::of(&[t.name]), 1)[0];
    storage.allocate_entities(&EntityType::of(&[t.position]).with_meta(meta), 4);

    let all = Query::builder(&storage).read(t.position).build().unwrap();
    let with_meta = Query::builder(&storage)
        .read(t.position)
        .with_meta(meta)
        .build()
        .unwrap();
    let without_meta = Query::builder(&storage)
        .read(t.position)
        .without_meta(meta)
        .build()
        .unwrap();
    assert_eq!(storage.count(&with_meta), 4);
    assert_eq!(storage.count(&without_meta), 15);
    assert_eq!(
        storage.count(&with_meta) + storage.count(&without_meta),
        storage.count(&all)
    );

    // the meta entity's Name is visible as a shared type
    let shared = Query::from_literal(&storage, "Position, $Name").unwrap();
    assert_eq!(storage.count(&shared), 4);
}

#[test]
fn test_destroy_recycles_ids() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let ty = EntityType::of(&[t.position]);

    let old = storage.allocate_entities(&ty, 1)[0];
    storage.destroy_entities(&[old]);
    assert!(!storage.exist(old));
    assert!(storage.access(old).is_none());

    let new = storage.allocate_entities(&ty, 1)[0];
    assert_eq!(new.id(), old.id());
    assert_ne!(new, old);
    assert!(storage.exist(new));
    assert!(!storage.exist(old));

    // destroying a stale handle is a no-op
    storage.destroy_entities(&[old]);
    assert!(storage.exist(new));
}

#[test]
fn test_destroyed_transient_handle_is_retired() {
    let (registry, t) = setup();
    let guid = registry.get_desc(t.position).unwrap().guid();
    let transient = Entity::new(0, Entity::TRANSIENT_VERSION);

    let mut writer = ByteWriter::new();
    let mut magic = *b"SUGO";
    writer.stream(&mut magic);
    // version, group count, type count
    for mut value in [1u32, 1, 1] {
        writer.stream_u32(&mut value);
    }
    writer.stream_u128(&mut guid.as_u128());
    writer.stream_u32(&mut 0);
    writer.stream_u32(&mut 1);
    writer.stream_u32(&mut transient.to_bits());
    writer.stream_u8(&mut 1);
    writer.stream_u32(&mut 8);
    writer.stream(&mut [0u8; 8]);
    let bytes = writer.into_inner();

    let mut storage = Storage::new(registry);
    storage.deserialize(&mut ByteReader::new(&bytes)).unwrap();
    assert!(transient.is_transient());
    assert!(storage.exist(transient));

    storage.destroy_entities(&[transient]);
    assert!(!storage.exist(transient));
    let fresh = storage.allocate_entities(&EntityType::of(&[t.position]), 3);
    assert!(fresh.iter().all(|e| e.id() != transient.id()));
    assert!(!storage.exist(transient));
}

#[test]
fn test_cast_round_trip() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let ty = EntityType::of(&[t.position]);

    let mut entities = Vec::new();
    storage.allocate(&ty, 3, |access, view| {
        entities.extend_from_slice(access.entities(view));
        let positions = access.component_mut::<Position>(view, t.position).unwrap();
        for (i, position) in positions.iter_mut().enumerate() {
            *position = Position {
                x: i as f32 * 1.5,
                y: -(i as f32),
            };
        }
    });
    let bits = |storage: &Storage| -> Vec<(u32, u32)> {
        entities
            .iter()
            .map(|&e| {
                let p = storage.get::<Position>(e, t.position).unwrap();
                (p.x.to_bits(), p.y.to_bits())
            })
            .collect()
    };
    let before = bits(&storage);
    let original = storage.group_of(entities[0]).unwrap();

    let delta = DeltaType::new().add(t.velocity);
    for view in storage.batch(&entities) {
        storage.cast_view_delta(view, &delta, |access, new, old| {
            assert_eq!(new.count, old.count);
            for velocity in access.component_mut::<Velocity>(new, t.velocity).unwrap() {
                velocity.x = 1.0;
            }
        });
    }
    for &entity in &entities {
        assert!(storage.entity_type(entity).unwrap().types.contains(t.velocity));
        assert_eq!(storage.get::<Velocity>(entity, t.velocity).unwrap().x, 1.0);
    }

    storage.cast_entities(&entities, &delta.inverse());
    assert_eq!(storage.group_of(entities[0]), Some(original));
    assert_eq!(bits(&storage), before);
    assert_index_consistent(&storage, &entities);
}

#[test]
fn test_instantiate_prefab() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let prefab_ty = EntityType::of(&[t.position, t.name, t.handle, TypeIndex::PREFAB]);
    let prefab = storage.allocate_entities(&prefab_ty, 1)[0];
    *storage.get_mut::<Name>(prefab, t.name).unwrap() = Name("goblin".into());
    storage.get_mut::<Position>(prefab, t.position).unwrap().x = 4.0;

    let mut copies = Vec::new();
    storage.instantiate(prefab, 3, |access, view| {
        copies.extend_from_slice(access.entities(view));
    });

    assert_eq!(copies.len(), 3);
    for &copy in &copies {
        let ty = storage.entity_type(copy).unwrap();
        assert!(!ty.types.contains(TypeIndex::PREFAB));
        assert!(!ty.types.contains(t.handle));
        assert_eq!(storage.get::<Name>(copy, t.name), Some(&Name("goblin".into())));
        assert_eq!(storage.get::<Position>(copy, t.position).unwrap().x, 4.0);
    }

    // the prefab itself is hidden from plain queries
    let query = Query::builder(&storage).read(t.position).build().unwrap();
    assert_eq!(storage.count(&query), 3);

    // stale prefabs produce nothing
    storage.destroy_entities(&[prefab]);
    let mut produced = 0;
    storage.instantiate(prefab, 2, |_, view| produced += view.count);
    assert_eq!(produced, 0);
}

#[test]
fn test_instantiate_entities_remaps_internal_refs() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let outside = storage.allocate_entities(&EntityType::of(&[t.name]), 1)[0];

    let ty = EntityType::of(&[t.parent, TypeIndex::PREFAB]);
    let prefabs = storage.allocate_entities(&ty, 2);
    storage.get_mut::<Parent>(prefabs[0], t.parent).unwrap().0 = outside;
    storage.get_mut::<Parent>(prefabs[1], t.parent).unwrap().0 = prefabs[0];

    let mut groups: Vec<Vec<Entity>> = Vec::new();
    storage.instantiate_entities(&prefabs, 2, |access, view| {
        groups.push(access.entities(view).to_vec());
    });
    assert_eq!(groups.len(), 2);
    let (roots, children) = (&groups[0], &groups[1]);

    for i in 0..2 {
        assert_eq!(storage.get::<Parent>(roots[i], t.parent), Some(&Parent(outside)));
        assert_eq!(storage.get::<Parent>(children[i], t.parent), Some(&Parent(roots[i])));
    }
}

#[test]
fn test_pinned_component_leaves_dead_marker() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let entity = storage.allocate_entities(&EntityType::of(&[t.position, t.handle]), 1)[0];
    storage.get_mut::<GpuHandle>(entity, t.handle).unwrap().0 = 77;

    storage.destroy_entities(&[entity]);
    assert!(!storage.exist(entity));
    assert!(storage.is_dead(entity));
    assert_eq!(storage.get::<GpuHandle>(entity, t.handle), Some(&GpuHandle(77)));
    assert!(storage.get::<Position>(entity, t.position).is_none());

    let live = Query::builder(&storage).read(t.handle).build().unwrap();
    let dead = Query::builder(&storage)
        .read(t.handle)
        .with(TypeIndex::DEAD)
        .build()
        .unwrap();
    assert_eq!(storage.count(&live), 0);
    assert_eq!(storage.count(&dead), 1);

    // destroying again keeps the marker
    storage.destroy_entities(&[entity]);
    assert!(storage.is_dead(entity));

    // dropping the last pinned component finishes the destroy
    storage.cast_entities(&[entity], &DeltaType::new().remove(t.handle));
    assert!(!storage.is_dead(entity));
    assert!(storage.access(entity).is_none());
    assert_eq!(storage.entity_count(), 0);
}

#[test]
fn test_merge_remaps_references() {
    let (registry, t) = setup();
    let mut dst = Storage::new(Arc::clone(&registry));
    let existing = dst.allocate_entities(&EntityType::of(&[t.position]), 3);

    let mut src = Storage::new(registry);
    let meta = src.allocate_entities(&EntityType::of(&[t.name]), 1)[0];
    *src.get_mut::<Name>(meta, t.name).unwrap() = Name("orc".into());
    let child_ty = EntityType::of(&[t.position, t.parent]).with_meta(meta);
    let child = src.allocate_entities(&child_ty, 1)[0];
    src.get_mut::<Parent>(child, t.parent).unwrap().0 = meta;

    dst.merge(&mut src);
    assert_eq!(src.entity_count(), 0);
    assert_eq!(dst.entity_count(), 5);
    assert!(existing.iter().all(|&e| dst.exist(e)));

    let query = Query::builder(&dst).read(t.parent).build().unwrap();
    let views = dst.query(&query);
    assert_eq!(views.len(), 1);
    let merged_child = dst.entities(views[0])[0];
    let parent = dst.get::<Parent>(merged_child, t.parent).unwrap().0;

    assert!(dst.exist(parent));
    assert_eq!(dst.get::<Name>(parent, t.name), Some(&Name("orc".into())));
    assert_eq!(dst.entity_type(merged_child).unwrap().meta.as_slice(), &[parent]);
    assert_eq!(dst.get::<Name>(merged_child, t.name), Some(&Name("orc".into())));
}

#[test]
#[should_panic(expected = "different type registries")]
fn test_merge_rejects_foreign_registry() {
    let (registry, _) = setup();
    let (other, _) = setup();
    let mut dst = Storage::new(registry);
    let mut src = Storage::new(other);
    dst.merge(&mut src);
}

#[test]
fn test_pack_entities() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let entities = storage.allocate_entities(&EntityType::of(&[t.parent]), 10);
    for pair in entities.windows(2) {
        storage.get_mut::<Parent>(pair[1], t.parent).unwrap().0 = pair[0];
    }
    let evens: Vec<_> = entities.iter().copied().step_by(2).collect();
    // entities[0] and entities[1] both survive
    storage.destroy_entities(&evens[1..]);

    let mapping = storage.pack_entities();
    assert_eq!(mapping.len(), 6);
    let mut ids: Vec<u32> = mapping.iter().map(|(_, new)| new.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..6).collect::<Vec<_>>());
    assert!(mapping.iter().all(|(_, new)| new.version() == 0 && storage.exist(*new)));

    let lookup = |old: Entity| mapping.iter().find(|(o, _)| *o == old).map(|(_, n)| *n);
    let new_first = lookup(entities[0]).unwrap();
    let new_second = lookup(entities[1]).unwrap();
    assert_eq!(storage.get::<Parent>(new_second, t.parent), Some(&Parent(new_first)));
    assert_index_consistent(&storage, &mapping.iter().map(|(_, n)| *n).collect::<Vec<_>>());
}

#[test]
fn test_defragment_keeps_index_consistent() {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let ty = EntityType::of(&[t.position, t.velocity]);
    let id = storage.get_or_create_group(&ty);
    let capacity = storage.group(id).unwrap().capacity() as usize;

    let mut entities = Vec::new();
    storage.allocate(&ty, (capacity * 3) as u32, |access, view| {
        let start = entities.len();
        entities.extend_from_slice(access.entities(view));
        let positions = access.component_mut::<Position>(view, t.position).unwrap();
        for (i, position) in positions.iter_mut().enumerate() {
            position.x = (start + i) as f32;
        }
    });
    let doomed: Vec<_> = entities.iter().copied().step_by(3).collect();
    storage.destroy_entities(&doomed);

    storage.defragment();
    let group = storage.group(id).unwrap();
    assert_eq!(group.len(), entities.len() - doomed.len());
    assert_eq!(group.chunks().len(), group.len().div_ceil(capacity));
    assert_index_consistent(&storage, &entities);

    for (i, &entity) in entities.iter().enumerate() {
        if i % 3 != 0 {
            assert_eq!(storage.get::<Position>(entity, t.position).unwrap().x, i as f32);
        }
    }
}

// ============================================================================
// Shared Component Tests
// ============================================================================

struct SharedWorld {
    storage: Storage,
    t: Types,
    orc: Entity,
    fast: Entity,
}

/// Position groups sharing Name (orc), Velocity (fast), both, or nothing.
fn shared_world() -> SharedWorld {
    let (registry, t) = setup();
    let mut storage = Storage::new(registry);
    let orc = storage.allocate_entities(&EntityType::of(&[t.name]), 1)[0];
    *storage.get_mut::<Name>(orc, t.name).unwrap() = Name("orc".into());
    let fast = storage.allocate_entities(&EntityType::of(&[t.velocity]), 1)[0];
    storage.get_mut::<Velocity>(fast, t.velocity).unwrap().x = 5.0;

    let position = EntityType::of(&[t.position]);
    storage.allocate_entities(&position.clone().with_meta(orc), 3);
    storage.allocate_entities(&position.clone().with_meta(fast), 4);
    storage.allocate_entities(&position, 5);
    storage.allocate_entities(&position.with_meta(orc).with_meta(fast), 2);
    SharedWorld { storage, t, orc, fast }
}

#[test]
fn test_shared_filters() {
    let SharedWorld { storage, t, orc, fast } = shared_world();
    let count = |build: fn(sugoi::QueryBuilder, &Types) -> sugoi::QueryBuilder| {
        let query = build(Query::builder(&storage).read(t.position), &t).build().unwrap();
        storage.count(&query)
    };

    assert_eq!(count(|q, t| q.shared(t.name)), 5);
    assert_eq!(count(|q, t| q.without_shared(t.name)), 9);
    assert_eq!(count(|q, t| q.any_shared(t.name).any_shared(t.velocity)), 9);
    assert_eq!(count(|q, t| q.shared(t.name).shared(t.velocity)), 2);
    assert_eq!(count(|q, t| q.shared(t.velocity).without_shared(t.name)), 4);

    let any_meta = Query::builder(&storage)
        .read(t.position)
        .any_meta(orc)
        .any_meta(fast)
        .build()
        .unwrap();
    let all_meta = Query::builder(&storage)
        .read(t.position)
        .with_meta(orc)
        .with_meta(fast)
        .build()
        .unwrap();
    assert_eq!(storage.count(&any_meta), 9);
    assert_eq!(storage.count(&all_meta), 2);

    let literal = Query::from_literal(&storage, "Position, $Name|Velocity").unwrap();
    assert_eq!(storage.count(&literal), 9);
    let literal = Query::from_literal(&storage, "Position, !$Velocity").unwrap();
    assert_eq!(storage.count(&literal), 8);
}

#[test]
fn test_shared_values_resolve_through_meta() {
    let SharedWorld { mut storage, t, orc, .. } = shared_world();
    let query = Query::builder(&storage)
        .read(t.position)
        .shared(t.name)
        .shared(t.velocity)
        .build()
        .unwrap();
    let views = storage.query(&query);
    assert_eq!(views.len(), 1);
    assert_eq!(storage.shared::<Name>(views[0], t.name), Some(&Name("orc".into())));
    assert_eq!(storage.shared::<Velocity>(views[0], t.velocity).unwrap().x, 5.0);
    let entity = storage.entities(views[0])[0];
    assert_eq!(storage.get::<Velocity>(entity, t.velocity).unwrap().x, 5.0);

    // nested: the shared Name is found through an intermediate meta entity
    let troop = storage.allocate_entities(&EntityType::of(&[t.velocity]).with_meta(orc), 1)[0];
    let soldier = storage.allocate_entities(&EntityType::of(&[t.position]).with_meta(troop), 1)[0];
    assert_eq!(storage.get::<Name>(soldier, t.name), Some(&Name("orc".into())));

    // destroying a meta entity drops the types it shared
    let shared_name = Query::builder(&storage).read(t.position).shared(t.name).build().unwrap();
    assert_eq!(storage.count(&shared_name), 6);
    storage.destroy_entities(&[orc]);
    assert_eq!(storage.count(&shared_name), 0);
    assert!(storage.get::<Name>(soldier, t.name).is_none());
}

// ============================================================================
// Serialization Tests
// ============================================================================

#[test]
fn test_serialize_round_trip() {
    let (registry, t) = setup();
    let mut storage = Storage::new(Arc::clone(&registry));
    let meta = storage.allocate_entities(&EntityType::of(&[t.name]), 1)[0];
    *storage.get_mut::<Name>(meta, t.name).unwrap() = Name("orc".into());

    let ty = EntityType::of(&[t.position, t.parent]).with_meta(meta);
    let entities = storage.allocate_entities(&ty, 5);
    for (i, &entity) in entities.iter().enumerate() {
        storage.get_mut::<Position>(entity, t.position).unwrap().x = i as f32;
        storage.get_mut::<Parent>(entity, t.parent).unwrap().0 = meta;
    }
    storage.destroy_entities(&entities[..1]);

    let mut writer = ByteWriter::new();
    storage.serialize(&mut writer);
    let bytes = writer.into_inner();

    let mut restored = Storage::new(registry);
    restored.deserialize(&mut ByteReader::new(&bytes)).unwrap();
    assert_eq!(restored.entity_count(), 5);
    assert!(!restored.exist(entities[0]));
    assert_eq!(restored.get::<Name>(meta, t.name), Some(&Name("orc".into())));
    for (i, &entity) in entities.iter().enumerate().skip(1) {
        assert_eq!(restored.get::<Position>(entity, t.position).unwrap().x, i as f32);
        assert_eq!(restored.get::<Parent>(entity, t.parent), Some(&Parent(meta)));
        assert_eq!(restored.get::<Name>(entity, t.name), Some(&Name("orc".into())));
    }

    // unclaimed ids are handed out again without colliding with live ones
    let fresh = restored.allocate_entities(&EntityType::of(&[t.position]), 2);
    assert_eq!(fresh[0].id(), entities[0].id());
    assert!(fresh.iter().all(|e| !entities[1..].contains(e) && *e != meta));
}

#[test]
fn test_deserialize_errors() {
    let (registry, t) = setup();
    let mut storage = Storage::new(Arc::clone(&registry));
    storage.allocate_entities(&EntityType::of(&[t.position]), 3);
    let mut writer = ByteWriter::new();
    storage.serialize(&mut writer);
    let bytes = writer.into_inner();

    assert_eq!(
        storage.deserialize(&mut ByteReader::new(&bytes)),
        Err(SerializeError::NotEmpty)
    );

    let mut target = Storage::new(Arc::clone(&registry));
    assert_eq!(
        target.deserialize(&mut ByteReader::new(b"nope")),
        Err(SerializeError::InvalidHeader)
    );
    assert_eq!(
        target.deserialize(&mut ByteReader::new(&bytes[..bytes.len() - 3])),
        Err(SerializeError::Truncated)
    );
    assert_eq!(target.entity_count(), 0);

    // one group claiming u32::MAX meta entities with nothing behind it
    let mut header = bytes[..8].to_vec();
    for word in [1u32, 0, u32::MAX] {
        header.extend_from_slice(&word.to_le_bytes());
    }
    assert_eq!(
        target.deserialize(&mut ByteReader::new(&header)),
        Err(SerializeError::Truncated)
    );

    let mut foreign = Storage::new(Arc::new(TypeRegistry::new()));
    assert!(matches!(
        foreign.deserialize(&mut ByteReader::new(&bytes)),
        Err(SerializeError::UnknownGuid(_))
    ));
}

#[test]
fn test_snapshot_skips_types_without_pod_or_serializer() {
    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct Flag(bool);

    let (registry, t) = setup();
    let flag = registry.register::<Flag>().unwrap();
    let mut storage = Storage::new(Arc::clone(&registry));
    let entity = storage.allocate_entities(&EntityType::of(&[t.position, flag]), 1)[0];
    storage.get_mut::<Flag>(entity, flag).unwrap().0 = true;
    storage.get_mut::<Position>(entity, t.position).unwrap().x = 3.0;

    let mut writer = ByteWriter::new();
    storage.serialize(&mut writer);
    let bytes = writer.into_inner();

    let mut restored = Storage::new(registry);
    restored.deserialize(&mut ByteReader::new(&bytes)).unwrap();
    assert_eq!(restored.get::<Flag>(entity, flag), Some(&Flag(false)));
    assert_eq!(restored.get::<Position>(entity, t.position).unwrap().x, 3.0);
}

#[test]
fn test_raw_column_needs_pod_reader() {
    let (registry, t) = setup();
    let mut storage = Storage::new(Arc::clone(&registry));
    storage.allocate_entities(&EntityType::of(&[t.position]), 2);
    let mut writer = ByteWriter::new();
    storage.serialize(&mut writer);
    let bytes = writer.into_inner();

    // same guid, registered without the pod opt-in
    let plain = Arc::new(TypeRegistry::new());
    plain.register::<Position>().unwrap();
    let guid = registry.get_desc(t.position).unwrap().guid();
    let mut target = Storage::new(plain);
    assert_eq!(
        target.deserialize(&mut ByteReader::new(&bytes)),
        Err(SerializeError::NotPod(guid))
    );
    assert_eq!(target.entity_count(), 0);
}
