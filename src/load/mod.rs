//! The image loader
//!
//! Loading validates the file, maps its sections contiguously, applies
//! the early relocations, patches host storage, activates native code,
//! applies the late relocations and finally releases the discardable
//! section. [`runtime::ImageRuntime`] wraps this with the load hooks
//! and the single-load rule.
pub mod error;
pub mod image;
pub mod loader;
pub mod marks;
pub mod mmap;
pub mod reader;
pub mod relocate;
pub mod runtime;
pub mod settings;
pub mod thaw;

#[cfg(test)]
pub mod tests {
    use std::fs;
    use std::path::Path;

    use super::error::{LoadError, LoadStatus, RegistryError};
    use super::runtime::{ImageRuntime, NativeLoader};
    use super::settings::LoadSettings;
    use crate::dump::dump_image;
    use crate::dump::error::DumpError;
    use crate::dump::settings::DumpSettings;
    use crate::heap::graph::check_isomorphic;
    use crate::heap::host::Remembered;
    use crate::heap::tests::layout;
    use crate::heap::{HashTable, HashTest, Heap, Object, ObjectGraph, SubrId, Value};
    use crate::image::header::{ImageHeader, HEADER_SIZE};
    use crate::image::kind::ObjectKind;
    use crate::image::layout::{hash_table, vector};
    use crate::image::word::untagged;

    fn settings() -> LoadSettings {
        LoadSettings {
            force_heap_fallback: false,
            exclusive: false,
        }
    }

    fn runtime() -> ImageRuntime {
        ImageRuntime::new(layout(), settings())
    }

    fn sample() -> Heap {
        let mut heap = Heap::new(layout());
        let name = heap.string("sample");
        let pi = heap.float(3.25);
        let list = heap.list(&[name, pi, Value::Fixnum(7), Value::Subr(SubrId(1))]);
        let foo = heap.intern("foo");
        heap.set_symbol_value(foo, list);
        let mut table = HashTable::new(HashTest::Equal, false);
        table.insert(name, Value::T);
        table.insert(Value::Fixnum(1), foo);
        let table = Value::Object(heap.alloc(Object::HashTable(table)));
        heap.staticpro(0, list).unwrap();
        heap.staticpro(1, table).unwrap();
        heap.staticpro(2, foo).unwrap();
        heap
    }

    fn dump(heap: &Heap, dir: &Path, remembered: &[Remembered]) -> std::path::PathBuf {
        let path = dir.join("test.himg");
        dump_image(heap, remembered, &path, &DumpSettings::default()).unwrap();
        path
    }

    #[test]
    pub fn test_load_reproduces_graph() {
        let dir = tempfile::tempdir().unwrap();
        let heap = sample();
        let path = dump(&heap, dir.path(), &[]);
        for force_heap_fallback in [false, true] {
            let mut rt = ImageRuntime::new(
                layout(),
                LoadSettings {
                    force_heap_fallback,
                    exclusive: false,
                },
            );
            rt.load(&path).unwrap();
            assert_eq!(rt.image().unwrap().is_heap_backed(), force_heap_fallback);
            let loaded = rt.materialize(heap.root_slots()).unwrap();
            check_isomorphic(&heap, &loaded).unwrap();
        }
    }

    #[test]
    pub fn test_second_load_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let mut rt = runtime();
        assert_eq!(rt.load_status(&path), LoadStatus::Success);
        assert_eq!(rt.load_status(&path), LoadStatus::AlreadyLoaded);
    }

    #[test]
    pub fn test_missing_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = runtime();
        assert_eq!(
            rt.load_status(&dir.path().join("absent")),
            LoadStatus::FileNotFound
        );
        let junk = dir.path().join("junk");
        fs::write(&junk, vec![0x42; 4096]).unwrap();
        assert_eq!(rt.load_status(&junk), LoadStatus::BadFileType);
        let short = dir.path().join("short");
        fs::write(&short, b"HEAPIMAGE").unwrap();
        assert_eq!(rt.load_status(&short), LoadStatus::BadFileType);
        assert!(rt.image().is_none());
    }

    #[test]
    pub fn test_gates_leave_host_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        let mut rt = runtime();
        let before = rt.host().snapshot();
        match rt.load(&path) {
            Err(LoadError::VersionMismatch { expected, found }) => assert_ne!(expected, found),
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
        assert_eq!(rt.host().snapshot(), before);
    }

    #[test]
    pub fn test_interrupted_write_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = b'!';
        fs::write(&path, &bytes).unwrap();
        assert_eq!(
            runtime().load_status(&path),
            LoadStatus::PreviousWriteIncomplete
        );
    }

    #[test]
    pub fn test_corrupt_table_restores_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let mut bytes = fs::read(&path).unwrap();
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = ImageHeader::decode(&header_bytes);
        // send the last host relocation out of range so the earlier ones
        // have already been applied when it fails
        let last = header.host_relocs.offset as usize
            + (header.host_relocs.count as usize - 1) * crate::image::reloc::HostReloc::SIZE;
        bytes[last + 8..last + 12].copy_from_slice(&0xffff_ff00u32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let mut rt = runtime();
        let before = rt.host().snapshot();
        assert!(matches!(rt.load(&path), Err(LoadError::Corrupt(_))));
        assert_eq!(rt.host().snapshot(), before);
        assert!(rt.image().is_none());
    }

    #[test]
    pub fn test_oversized_hash_table_count_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let pristine = fs::read(&path).unwrap();
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&pristine[..HEADER_SIZE]);
        let header = ImageHeader::decode(&header_bytes);
        let list = header.hash_list_offset as usize;
        assert_ne!(list, 0);
        let at = list + vector::slot(0);
        let word = u64::from_le_bytes(pristine[at..at + 8].try_into().unwrap());
        let count = untagged(word) as usize + hash_table::COUNT;

        for claimed in [u64::MAX, 1 << 40, 1 << 20] {
            let mut bytes = pristine.clone();
            bytes[count..count + 8].copy_from_slice(&claimed.to_le_bytes());
            fs::write(&path, &bytes).unwrap();

            let mut rt = runtime();
            let before = rt.host().snapshot();
            assert_eq!(rt.load_status(&path), LoadStatus::BadFileType);
            assert_eq!(rt.host().snapshot(), before);
            assert!(rt.image().is_none());
        }
    }

    #[test]
    pub fn test_remembered_locations_bounds_checked() {
        let mut rt = runtime();
        for location in [
            Remembered::RawPointer { slot: 8 },
            Remembered::Scalar { offset: 60, len: 8 },
            Remembered::Scalar {
                offset: u32::MAX,
                len: 1,
            },
        ] {
            assert_eq!(
                rt.remember(location),
                Err(RegistryError::OutOfRange(location))
            );
        }
        assert!(rt.remembered().is_empty());
        rt.remember(Remembered::RawPointer { slot: 7 }).unwrap();
        rt.remember(Remembered::Scalar { offset: 56, len: 8 }).unwrap();
        assert_eq!(rt.remembered().len(), 2);
    }

    #[test]
    pub fn test_remembered_outside_heap_fails_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.himg");
        for location in [
            Remembered::RawPointer { slot: 8 },
            Remembered::Scalar { offset: 60, len: 8 },
        ] {
            assert!(matches!(
                dump_image(&sample(), &[location], &path, &DumpSettings::default()),
                Err(DumpError::BadRemembered(_))
            ));
        }
    }

    #[test]
    pub fn test_failed_dump_leaves_incomplete_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.himg");
        let mut heap = sample();
        let frame = heap.alloc(Object::Frame {
            window_system: "x11".to_string(),
        });
        heap.staticpro(3, Value::Object(frame)).unwrap();
        assert!(matches!(
            dump_image(&heap, &[], &path, &DumpSettings::default()),
            Err(DumpError::Unsupported { .. })
        ));
        assert!(fs::metadata(&path).unwrap().len() >= HEADER_SIZE as u64);
        assert_eq!(
            runtime().load_status(&path),
            LoadStatus::PreviousWriteIncomplete
        );
    }

    #[test]
    pub fn test_hash_tables_thawed() {
        let dir = tempfile::tempdir().unwrap();
        let heap = sample();
        let path = dump(&heap, dir.path(), &[]);
        let mut rt = runtime();
        rt.load(&path).unwrap();

        let host = rt.host();
        let table = host
            .read_u64(host.layout().static_offset(1))
            .unwrap();
        let list = host.read_u64(host.layout().static_offset(0)).unwrap();
        let image = rt.image().unwrap();
        assert_eq!(image.hash_index_count(), 1);

        // equal test: the key is the string object, found by contents
        let first = image.offset_of(untagged(list)).unwrap();
        let name = image
            .read_u64(first + crate::image::layout::cons::CAR)
            .unwrap();
        assert_eq!(
            image.hash_lookup(table, name).unwrap(),
            Some(crate::image::word::encode_constant(crate::heap::Constant::T))
        );
        let one = crate::image::word::encode_fixnum(1).unwrap();
        assert!(image.hash_lookup(table, one).unwrap().is_some());
        let two = crate::image::word::encode_fixnum(2).unwrap();
        assert_eq!(image.hash_lookup(table, two).unwrap(), None);
    }

    #[test]
    pub fn test_object_queries_and_marks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&sample(), dir.path(), &[]);
        let mut rt = runtime();
        rt.load(&path).unwrap();
        let list = rt
            .host()
            .read_u64(rt.host().layout().static_offset(0))
            .unwrap();
        let image = rt.image_mut().unwrap();
        let address = untagged(list);
        assert!(image.contains(address));
        assert!(!image.is_cold(address));
        assert_eq!(image.find_object_kind(address), Some(ObjectKind::Cons));
        assert!(!image.is_object_start(address + 8));
        assert!(image.is_discarded());

        assert!(image.set_marked(address));
        assert!(image.is_marked(address));
        image.clear_marks();
        assert!(!image.is_marked(address));
        assert!(image.was_marked_last(address));
    }

    #[test]
    pub fn test_remembered_locations_restored() {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = sample();
        heap.set_scalar(0, &[1, 2, 3, 4]).unwrap();
        heap.set_scalar(16, &(0..40).collect::<Vec<u8>>()).unwrap();
        let target = heap.string("pointed at");
        heap.set_static(5, target).unwrap();
        let remembered = [
            Remembered::Scalar { offset: 0, len: 4 },
            Remembered::Scalar { offset: 16, len: 40 },
            Remembered::RawPointer { slot: 5 },
        ];
        let path = dump(&heap, dir.path(), &remembered);

        let mut rt = runtime();
        for r in remembered {
            rt.remember(r).unwrap();
        }
        rt.load(&path).unwrap();
        let loaded = rt.materialize(heap.root_slots()).unwrap();
        check_isomorphic(&heap, &loaded).unwrap();
        match loaded.static_value(5) {
            Some(Value::Object(id)) => assert!(matches!(
                loaded.get(id),
                Some(Object::String { bytes, .. }) if bytes == b"pointed at"
            )),
            v => panic!("unexpected {v:?}"),
        }
    }

    struct FakeNative;

    impl NativeLoader for FakeNative {
        fn load_unit(&mut self, file: &str) -> Result<u64, String> {
            Ok(file.len() as u64 * 0x1000)
        }

        fn resolve(&mut self, unit: u64, name: &str) -> Result<u64, String> {
            Ok(unit + name.len() as u64)
        }
    }

    fn native_heap() -> Heap {
        let mut heap = Heap::new(layout());
        let file = heap.string("unit.so");
        let unit = Value::Object(heap.alloc(Object::CompiledUnit { file }));
        let name = heap.string("entry");
        let subr = Value::Object(heap.alloc(Object::NativeSubr { unit, name }));
        heap.staticpro(0, subr).unwrap();
        heap
    }

    #[test]
    pub fn test_native_units_activated() {
        let dir = tempfile::tempdir().unwrap();
        let heap = native_heap();
        let path = dump(&heap, dir.path(), &[]);
        let mut rt = runtime().with_native_loader(FakeNative);
        rt.load(&path).unwrap();
        let relocs = rt.stats().unwrap().relocs;
        assert_eq!(relocs[1], 1);
        assert_eq!(relocs[2], 1);
        let subr = rt
            .host()
            .read_u64(rt.host().layout().static_offset(0))
            .unwrap();
        let image = rt.image().unwrap();
        let at = image.offset_of(untagged(subr)).unwrap();
        let entry = image
            .read_u64(at + crate::image::layout::native_subr::ENTRY)
            .unwrap();
        assert_eq!(entry, 7 * 0x1000 + 5);
    }

    #[test]
    pub fn test_native_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&native_heap(), dir.path(), &[]);
        let mut rt = runtime();
        assert_eq!(rt.load_status(&path), LoadStatus::GenericIOError(0));
        assert!(rt.image().is_none());
    }

    #[test]
    pub fn test_hook_registry_bounded() {
        fn noop(
            _: Option<&mut super::image::LoadedImage>,
            _: &mut crate::heap::host::HostImage,
        ) -> Result<(), LoadError> {
            Ok(())
        }
        let mut rt = runtime();
        while rt.hook_count() < super::runtime::HOOKS_MAX {
            rt.add_hook(noop).unwrap();
        }
        assert!(rt.add_hook(noop).is_err());
    }
}
