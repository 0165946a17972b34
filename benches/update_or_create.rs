//! Benchmarks for resource registration and scan flushing
//!
//! Target: 100K cache registrations/sec, a 1K-resource scan under 10ms

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage_resource_graph::plugin::SessionCache;
use storage_resource_graph::{
    AttributeDef, AttributeValue, Identifier, InMemoryStore, PluginDescriptor, PluginManager,
    PluginModule, ResourceType, ScanContext, StoragePlugin,
};

const DISKS_PER_ARRAY: i64 = 100;

fn array_type() -> Arc<ResourceType> {
    ResourceType::builder("bench", "Array")
        .identifier(Identifier::global(["serial"]))
        .attribute("serial", AttributeDef::string())
        .build()
        .unwrap()
}

fn disk_type() -> Arc<ResourceType> {
    ResourceType::builder("bench", "Disk")
        .identifier(Identifier::local("Array", ["slot"]))
        .attribute("slot", AttributeDef::integer())
        .attribute("model", AttributeDef::string().optional())
        .build()
        .unwrap()
}

fn attrs(name: &str, value: AttributeValue) -> BTreeMap<String, AttributeValue> {
    BTreeMap::from([(name.to_string(), value)])
}

fn bench_cache_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_cache");
    group.throughput(Throughput::Elements(1));
    let (array_ty, disk_ty) = (array_type(), disk_type());

    group.bench_function("create_disk", |b| {
        let mut cache = SessionCache::new();
        let (array, _) = cache
            .update_or_create(&array_ty, &[], attrs("serial", "A1".into()))
            .unwrap();
        let mut slot = 0i64;

        b.iter(|| {
            slot += 1;
            let _ = cache.update_or_create(
                &disk_ty,
                black_box(&[array]),
                attrs("slot", AttributeValue::Integer(slot)),
            );
        });
    });

    group.bench_function("update_existing_disk", |b| {
        let mut cache = SessionCache::new();
        let (array, _) = cache
            .update_or_create(&array_ty, &[], attrs("serial", "A1".into()))
            .unwrap();
        for slot in 0..DISKS_PER_ARRAY {
            cache
                .update_or_create(&disk_ty, &[array], attrs("slot", AttributeValue::Integer(slot)))
                .unwrap();
        }
        let mut counter = 0i64;

        b.iter(|| {
            counter += 1;
            let _ = cache.update_or_create(
                &disk_ty,
                black_box(&[array]),
                attrs("slot", AttributeValue::Integer(counter % DISKS_PER_ARRAY)),
            );
        });
    });

    group.finish();
}

struct FleetPlugin {
    arrays: usize,
}

impl StoragePlugin for FleetPlugin {
    fn initial_scan(&mut self, ctx: &ScanContext<'_>) -> anyhow::Result<()> {
        for a in 0..self.arrays {
            let (array, _) =
                ctx.update_or_create("Array", &[], [("serial", format!("A{}", a).into())])?;
            for slot in 0..DISKS_PER_ARRAY {
                ctx.update_or_create(
                    "Disk",
                    &[array],
                    [("slot", slot.into()), ("model", "ST4000".into())],
                )?;
            }
        }
        Ok(())
    }
}

fn bench_initial_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("initial_scan");
    let arrays = 10;
    group.throughput(Throughput::Elements(arrays as u64 * (DISKS_PER_ARRAY as u64 + 1)));

    group.bench_function("flush_1010_resources", |b| {
        b.iter_batched(
            || {
                let manager = PluginManager::new(Arc::new(InMemoryStore::new()));
                manager.provide_module(
                    PluginModule::new("bench")
                        .resource_type(array_type())
                        .resource_type(disk_type())
                        .plugin(PluginDescriptor::new("FleetPlugin", move || {
                            Box::new(FleetPlugin { arrays })
                        })),
                );
                let session = manager.create_session("bench").unwrap();
                (manager, session)
            },
            |(_manager, mut session)| {
                black_box(session.initial_scan().unwrap());
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_cache_registration, bench_initial_scan);
criterion_main!(benches);
