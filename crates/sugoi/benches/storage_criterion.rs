//! Storage benchmarks using criterion for historical comparison.

use std::{hint::black_box, sync::Arc};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sugoi::{DeltaType, EntityType, Query, Storage, TypeIndex, TypeRegistry};

#[derive(Default, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Default, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Default, Clone, Copy)]
struct Frozen;

struct Fixture {
    registry: Arc<TypeRegistry>,
    position: TypeIndex,
    velocity: TypeIndex,
    frozen: TypeIndex,
}

fn fixture() -> Fixture {
    let registry = Arc::new(TypeRegistry::new());
    let position = registry.register::<Position>().unwrap();
    let velocity = registry.register::<Velocity>().unwrap();
    let frozen = registry.register::<Frozen>().unwrap();
    Fixture {
        registry,
        position,
        velocity,
        frozen,
    }
}

fn allocate_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");
    let f = fixture();

    for count in [1, 100, 1000, 10000] {
        group.throughput(Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::new("position", count), &count, |b, &count| {
            let ty = EntityType::of(&[f.position]);
            b.iter(|| {
                let mut storage = Storage::new(Arc::clone(&f.registry));
                black_box(storage.allocate_entities(&ty, count as u32));
            });
        });

        group.bench_with_input(
            BenchmarkId::new("position_velocity", count),
            &count,
            |b, &count| {
                let ty = EntityType::of(&[f.position, f.velocity]);
                b.iter(|| {
                    let mut storage = Storage::new(Arc::clone(&f.registry));
                    storage.allocate(&ty, count as u32, |access, view| {
                        for p in access.component_mut::<Position>(view, f.position).unwrap() {
                            p.x = 1.0;
                        }
                    });
                    black_box(&storage);
                });
            },
        );
    }

    group.finish();
}

fn query_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let f = fixture();

    for count in [1000, 10000, 100_000] {
        group.throughput(Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::new("integrate", count), &count, |b, &count| {
            let mut storage = Storage::new(Arc::clone(&f.registry));
            storage.allocate_entities(&EntityType::of(&[f.position, f.velocity]), count as u32);
            storage.allocate_entities(&EntityType::of(&[f.position]), count as u32);
            let query = Query::builder(&storage)
                .write(f.position)
                .read(f.velocity)
                .build()
                .unwrap();

            b.iter(|| {
                storage.query_mut(&query, |access, view| {
                    let velocity: Vec<Velocity> =
                        access.component::<Velocity>(view, f.velocity).unwrap().to_vec();
                    let position = access.component_mut::<Position>(view, f.position).unwrap();
                    for (p, v) in position.iter_mut().zip(&velocity) {
                        p.x += v.x;
                        p.y += v.y;
                        p.z += v.z;
                    }
                });
            });
        });

        group.bench_with_input(BenchmarkId::new("match_cached", count), &count, |b, &count| {
            let mut storage = Storage::new(Arc::clone(&f.registry));
            storage.allocate_entities(&EntityType::of(&[f.position]), count as u32);
            let query = Query::from_literal(&storage, "Position, !Frozen").unwrap();
            b.iter(|| black_box(storage.count(&query)));
        });
    }

    group.finish();
}

fn cast_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("cast");
    let f = fixture();

    for count in [100, 1000, 10000] {
        group.throughput(Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::new("toggle_tag", count), &count, |b, &count| {
            let mut storage = Storage::new(Arc::clone(&f.registry));
            let entities =
                storage.allocate_entities(&EntityType::of(&[f.position, f.velocity]), count as u32);
            let freeze = DeltaType::new().add(f.frozen);
            let thaw = freeze.inverse();

            b.iter(|| {
                storage.cast_entities(&entities, &freeze);
                storage.cast_entities(&entities, &thaw);
            });
        });

        group.bench_with_input(BenchmarkId::new("destroy", count), &count, |b, &count| {
            let ty = EntityType::of(&[f.position, f.velocity]);
            b.iter(|| {
                let mut storage = Storage::new(Arc::clone(&f.registry));
                let entities = storage.allocate_entities(&ty, count as u32);
                storage.destroy_entities(&entities);
                black_box(storage.entity_count());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    allocate_benchmarks,
    query_benchmarks,
    cast_benchmarks
);
criterion_main!(benches);
