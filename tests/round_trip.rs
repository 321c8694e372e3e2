//! Write images to disk, load them back and compare graphs
use std::fs;
use std::path::{Path, PathBuf};

use heapimage::driver::demo::{demo_heap, demo_layout, demo_remembered, DemoNativeLoader};
use heapimage::dump::dump_image;
use heapimage::dump::settings::DumpSettings;
use heapimage::heap::graph::check_isomorphic;
use heapimage::heap::{Heap, Object, Value};
use heapimage::image::header::{ImageHeader, Phase, HEADER_SIZE};
use heapimage::image::reloc::{HostReloc, HostRelocKind, ObjectStart, Reloc};
use heapimage::image::MAX_PAGE_SIZE;
use heapimage::load::runtime::ImageRuntime;
use heapimage::load::settings::LoadSettings;
use proptest::prelude::*;

fn shared() -> LoadSettings {
    LoadSettings {
        force_heap_fallback: false,
        exclusive: false,
    }
}

fn demo_runtime(settings: LoadSettings) -> ImageRuntime {
    let mut runtime =
        ImageRuntime::new(demo_layout(), settings).with_native_loader(DemoNativeLoader::default());
    for location in demo_remembered() {
        runtime.remember(location).unwrap();
    }
    runtime
}

fn write_demo(dir: &Path, scale: usize, settings: &DumpSettings) -> PathBuf {
    let path = dir.join(format!("demo-{scale}.himg"));
    let runtime = demo_runtime(shared());
    runtime
        .dump(&demo_heap(scale).unwrap(), &path, settings)
        .unwrap();
    path
}

fn header_of(bytes: &[u8]) -> ImageHeader {
    let raw: &[u8; HEADER_SIZE] = bytes[..HEADER_SIZE].try_into().unwrap();
    ImageHeader::decode(raw)
}

fn table<T, const N: usize>(
    bytes: &[u8],
    offset: u32,
    count: u32,
    decode: impl Fn(&[u8; N]) -> Result<T, u8>,
) -> Vec<T> {
    (0..count as usize)
        .map(|i| {
            let at = offset as usize + i * N;
            let raw: &[u8; N] = bytes[at..at + N].try_into().unwrap();
            decode(raw).unwrap()
        })
        .collect()
}

#[test]
pub fn test_demo_image_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_demo(dir.path(), 12, &DumpSettings::default());
    for force_heap_fallback in [false, true] {
        let mut runtime = demo_runtime(LoadSettings {
            force_heap_fallback,
            exclusive: false,
        });
        let stats = runtime.load(&path).unwrap().clone();
        assert_eq!(stats.heap_backed, force_heap_fallback);
        assert_eq!(stats.relocs[Phase::Native as usize], 1);
        assert_eq!(stats.relocs[Phase::Late as usize], 1);

        let expected = demo_heap(12).unwrap();
        let loaded = runtime.materialize(expected.root_slots()).unwrap();
        check_isomorphic(&expected, &loaded).unwrap();
    }
}

#[test]
pub fn test_section_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_demo(dir.path(), 20, &DumpSettings::default());
    let bytes = fs::read(&path).unwrap();
    let header = header_of(&bytes);

    assert_eq!(&bytes[..16], b"HEAPIMAGE-RELOC1");
    assert_eq!(header.cold_start as usize % MAX_PAGE_SIZE, 0);
    assert!(HEADER_SIZE <= header.discardable_start as usize);
    assert!(header.discardable_start <= header.cold_start);
    assert!(header.cold_start <= header.end_heap);
    assert!(header.end_heap as usize <= bytes.len());

    for phase in Phase::ALL {
        let loc = header.relocs(phase);
        for reloc in table(&bytes, loc.offset, loc.count, Reloc::decode) {
            assert!(reloc.offset < header.cold_start, "{phase:?} {reloc:?}");
            assert!(reloc.offset as usize >= HEADER_SIZE);
            assert_eq!(reloc.offset % 8, 0);
        }
    }

    let starts = table(
        &bytes,
        header.object_starts.offset,
        header.object_starts.count,
        ObjectStart::decode,
    );
    assert!(!starts.is_empty());
    assert!(starts.windows(2).all(|w| w[0].offset < w[1].offset));
    assert!(starts
        .iter()
        .all(|s| s.offset < header.discardable_start));
}

#[test]
pub fn test_host_relocs_sorted_and_merged() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_demo(dir.path(), 6, &DumpSettings::default());
    let bytes = fs::read(&path).unwrap();
    let header = header_of(&bytes);
    let relocs = table(
        &bytes,
        header.host_relocs.offset,
        header.host_relocs.count,
        HostReloc::decode,
    );
    assert!(!relocs.is_empty());
    for pair in relocs.windows(2) {
        assert!(pair[0].host_offset <= pair[1].host_offset);
        let adjacent = pair[0].kind == HostRelocKind::CopyFromImage
            && pair[1].kind == HostRelocKind::CopyFromImage
            && pair[0].end() == pair[1].host_offset as u64
            && pair[0].payload + pair[0].length as u64 == pair[1].payload;
        assert!(!adjacent, "unmerged copies {pair:?}");
    }
}

#[test]
pub fn test_tuning_changes_order_not_meaning() {
    let dir = tempfile::tempdir().unwrap();
    let tuned = DumpSettings {
        score_exponent: -1.0,
        normal_weight: 10,
        strong_weight: 5000,
        ..DumpSettings::default()
    };
    let path = write_demo(dir.path(), 9, &tuned);
    let mut runtime = demo_runtime(shared());
    runtime.load(&path).unwrap();
    let expected = demo_heap(9).unwrap();
    let loaded = runtime.materialize(expected.root_slots()).unwrap();
    check_isomorphic(&expected, &loaded).unwrap();
}

#[test]
pub fn test_loaded_heap_can_be_dumped_again() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_demo(dir.path(), 5, &DumpSettings::default());
    let mut runtime = demo_runtime(shared());
    runtime.load(&first).unwrap();
    let expected = demo_heap(5).unwrap();
    let loaded = runtime.materialize(expected.root_slots()).unwrap();

    let second = dir.path().join("second.himg");
    runtime
        .dump(&loaded, &second, &DumpSettings::default())
        .unwrap();
    let mut again = demo_runtime(shared());
    again.load(&second).unwrap();
    let reloaded = again.materialize(expected.root_slots()).unwrap();
    check_isomorphic(&expected, &reloaded).unwrap();
}

/// Instructions for building a random heap; indices refer to
/// previously built values modulo their count
#[derive(Clone, Debug)]
enum Build {
    Fixnum(i64),
    Float(f64),
    Text(String),
    Intern(String),
    Cons(usize, usize),
    Vector(Vec<usize>),
    Bignum(bool, Vec<u64>),
}

fn build_strategy() -> impl Strategy<Value = Build> {
    prop_oneof![
        (-1_000_000i64..1_000_000).prop_map(Build::Fixnum),
        (-1.0e6f64..1.0e6).prop_map(Build::Float),
        "\\PC{0,12}".prop_map(Build::Text),
        "[a-z][a-z-]{0,8}".prop_map(Build::Intern),
        (any::<usize>(), any::<usize>()).prop_map(|(a, d)| Build::Cons(a, d)),
        prop::collection::vec(any::<usize>(), 0..6).prop_map(Build::Vector),
        (any::<bool>(), prop::collection::vec(any::<u64>(), 1..4))
            .prop_map(|(n, limbs)| Build::Bignum(n, limbs)),
    ]
}

fn random_heap(steps: &[Build], cycle: bool) -> Heap {
    let mut heap = Heap::new(demo_layout());
    let mut values = vec![Value::NIL, Value::T];
    let pick = |values: &[Value], i: usize| values[i % values.len()];
    for step in steps {
        let value = match step {
            Build::Fixnum(n) => Value::Fixnum(*n),
            Build::Float(f) => heap.float(*f),
            Build::Text(s) => heap.string(s),
            Build::Intern(name) => heap.intern(name),
            Build::Cons(a, d) => {
                let (car, cdr) = (pick(&values, *a), pick(&values, *d));
                heap.cons(car, cdr)
            }
            Build::Vector(items) => {
                let items = items.iter().map(|i| pick(&values, *i)).collect();
                heap.vector(items)
            }
            Build::Bignum(negative, limbs) => heap.bignum(*negative, limbs.clone()),
        };
        values.push(value);
    }

    let all = heap.vector(values);
    if cycle {
        let tail = heap.cons(all, Value::NIL);
        if let Value::Object(id) = all {
            if let Some(Object::Vector(items)) = heap.get_mut(id) {
                items.push(tail);
            }
        }
    }
    heap.staticpro(0, all).unwrap();
    heap
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_heaps_round_trip(
        steps in prop::collection::vec(build_strategy(), 0..48),
        cycle in any::<bool>(),
        force_heap_fallback in any::<bool>(),
    ) {
        let heap = random_heap(&steps, cycle);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.himg");
        dump_image(&heap, &[], &path, &DumpSettings::default()).unwrap();

        let mut runtime = ImageRuntime::new(
            demo_layout(),
            LoadSettings { force_heap_fallback, exclusive: false },
        );
        runtime.load(&path).unwrap();
        let loaded = runtime.materialize(heap.root_slots()).unwrap();
        prop_assert!(check_isomorphic(&heap, &loaded).is_ok());
    }
}
