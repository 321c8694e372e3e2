//! A process accepts at most one image when loading exclusively
//!
//! Kept in its own test binary as the flag is process-wide.
use heapimage::driver::demo::{demo_heap, demo_layout, DemoNativeLoader};
use heapimage::dump::settings::DumpSettings;
use heapimage::load::error::LoadStatus;
use heapimage::load::runtime::{process_has_image, ImageRuntime};
use heapimage::load::settings::LoadSettings;

fn runtime() -> ImageRuntime {
    ImageRuntime::new(demo_layout(), LoadSettings::default())
        .with_native_loader(DemoNativeLoader::default())
}

#[test]
pub fn test_one_image_per_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exclusive.himg");
    runtime()
        .dump(&demo_heap(3).unwrap(), &path, &DumpSettings::default())
        .unwrap();

    assert!(!process_has_image());
    let mut failed = runtime();
    assert_eq!(
        failed.load_status(&dir.path().join("missing.himg")),
        LoadStatus::FileNotFound
    );
    assert!(!process_has_image());

    let mut first = runtime();
    assert_eq!(first.load_status(&path), LoadStatus::Success);
    assert!(process_has_image());

    let mut second = runtime();
    assert_eq!(second.load_status(&path), LoadStatus::AlreadyLoaded);
    assert!(second.image().is_none());
    assert!(first.image().is_some());

    let mut shared = ImageRuntime::new(
        demo_layout(),
        LoadSettings {
            force_heap_fallback: false,
            exclusive: false,
        },
    )
    .with_native_loader(DemoNativeLoader::default());
    assert_eq!(shared.load_status(&path), LoadStatus::Success);
}
