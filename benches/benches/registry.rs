use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use emucore_registry::{compare_versions, ComponentDescriptor, DownloadState, RegistryStore};

fn catalog(size: usize) -> Vec<ComponentDescriptor> {
    (0..size)
        .map(|index| {
            ComponentDescriptor::new(
                format!("org.emucores.core{index:03}"),
                format!("Core {index:03}"),
                vec!["Console".into(), "Handheld".into()],
            )
            .with_installed(format!("1.{index}.0"), None)
        })
        .collect()
}

fn registry_mutations(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("progress_update_200_cores", |b| {
        let store = RegistryStore::in_memory();
        store.merge_discovered(catalog(200)).expect("merge catalog");
        let _subscription = store.subscribe();
        let mut fraction = 0.0f32;
        b.iter(|| {
            fraction = (fraction + 0.01) % 1.0;
            store
                .update("org.emucores.core100", |core| {
                    core.state = DownloadState::Downloading;
                    core.progress = Some(fraction);
                })
                .expect("update");
        });
    });

    group.bench_function("snapshot_200_cores", |b| {
        let store = RegistryStore::in_memory();
        store.merge_discovered(catalog(200)).expect("merge catalog");
        b.iter(|| store.snapshot());
    });

    group.bench_function("compare_versions", |b| {
        b.iter(|| compare_versions("1.10.3-beta2", "1.10.3"));
    });

    group.finish();
}

criterion_group!(benches, registry_mutations);
criterion_main!(benches);
