//! Image write and load benchmarks

use heapimage::driver::demo::{demo_heap, demo_layout, demo_remembered, DemoNativeLoader};
use heapimage::dump::settings::DumpSettings;
use heapimage::dump::{dump_image, write_image_bytes};
use heapimage::load::runtime::ImageRuntime;
use heapimage::load::settings::LoadSettings;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn fresh_runtime(force_heap_fallback: bool) -> ImageRuntime {
    let mut runtime = ImageRuntime::new(
        demo_layout(),
        LoadSettings {
            force_heap_fallback,
            exclusive: false,
        },
    )
    .with_native_loader(DemoNativeLoader::default());
    for location in demo_remembered() {
        runtime.remember(location).unwrap();
    }
    runtime
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let heap = demo_heap(256).unwrap();
    let remembered = demo_remembered();
    let settings = DumpSettings::default();

    c.bench_function("write_image_bytes", |b| {
        b.iter(|| write_image_bytes(black_box(&heap), &remembered, &settings).unwrap())
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.himg");
    dump_image(&heap, &remembered, &path, &settings).unwrap();

    c.bench_function("load_mapped", |b| {
        b.iter(|| {
            let mut runtime = fresh_runtime(false);
            runtime.load(black_box(&path)).unwrap();
        })
    });
    c.bench_function("load_heap_fallback", |b| {
        b.iter(|| {
            let mut runtime = fresh_runtime(true);
            runtime.load(black_box(&path)).unwrap();
        })
    });

    let mut loaded = fresh_runtime(false);
    loaded.load(&path).unwrap();
    c.bench_function("materialize", |b| {
        b.iter(|| loaded.materialize(heap.root_slots()).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
