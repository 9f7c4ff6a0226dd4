use std::sync::Arc;
use std::time::Duration;

use cogworks::{
    Module, ModuleBase, ModuleDescriptor, ModuleRegistry, ServiceCollection, StaticStorage,
    UnitManifest, WorkTracker,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Default)]
struct Idle {
    base: ModuleBase,
}

impl Module for Idle {
    fn base(&self) -> &ModuleBase {
        &self.base
    }
}

fn registry_with_unit(modules: usize) -> ModuleRegistry {
    let storage = StaticStorage::new();
    storage.insert("bench", move || {
        UnitManifest::new((0..modules).map(|_| ModuleDescriptor::concrete::<Idle>()).collect())
    });
    ModuleRegistry::new(Arc::new(storage), Arc::new(ServiceCollection::new()))
}

/// Benchmark a full load, unload and reclaim cycle
fn bench_load_unload_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("load_unload_cycle");

    for modules in &[1, 8, 64] {
        let registry = registry_with_unit(*modules);
        group.bench_with_input(BenchmarkId::from_parameter(modules), modules, |b, _| {
            b.iter(|| {
                runtime.block_on(async {
                    black_box(registry.load_unit("bench").await.unwrap());
                    registry.unload_unit("bench").await.unwrap();
                    assert!(registry.wait_reclaimed("bench", Duration::from_secs(1)).await);
                });
            });
        });
    }

    group.finish();
}

/// Benchmark the synchronous tracked-work path
fn bench_tracked_run(c: &mut Criterion) {
    let tracker = WorkTracker::new();

    c.bench_function("work_tracker_run", |b| {
        b.iter(|| tracker.run(|| black_box(42)));
    });
}

criterion_group!(benches, bench_load_unload_cycle, bench_tracked_run);
criterion_main!(benches);
