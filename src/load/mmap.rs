//! Contiguous multi-section memory mapping
//!
//! `map_contiguous` places each section immediately after the previous
//! one in virtual address space. On unix an inaccessible reservation is
//! made first and each section is mapped over it in place. Windows has
//! no atomic replace, so the reservation is released before the
//! sections are mapped into it, and the whole attempt is retried if
//! something else grabs the range in between. `map_contiguous_heap`
//! is the fallback: one allocation filled by reading the file.
//!
//! This is the only module that turns raw addresses into slices.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ptr::NonNull;

use log::{debug, warn};

use crate::image::MAX_PAGE_SIZE;

use super::error::MapError;

#[derive(Copy, Clone, Debug)]
pub enum MapSource<'f> {
    File(&'f File),
    Anonymous,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

#[derive(Copy, Clone, Debug)]
pub struct MapSpec<'f> {
    pub source: MapSource<'f>,
    pub size: usize,
    pub file_offset: u64,
    pub protection: Protection,
}

/// A section's place in the region
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub size: usize,
    file_backed: bool,
}

/// A single heap allocation standing in for mapped memory
#[derive(Debug)]
struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapBlock {
    fn new(size: usize) -> Result<Self, MapError> {
        let layout =
            Layout::from_size_align(size, MAX_PAGE_SIZE).map_err(|_| MapError::OutOfMemory(size))?;
        // SAFETY: layout has non-zero size (checked by caller) and
        // valid alignment; null is handled
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| HeapBlock { ptr, layout })
            .ok_or(MapError::OutOfMemory(size))
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug)]
enum Backing {
    Mapped,
    Heap(HeapBlock),
}

/// Sections mapped back to back, released on drop
#[derive(Debug)]
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
    sections: Vec<Section>,
    backing: Backing,
}

impl MappedRegion {
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn is_heap(&self) -> bool {
        matches!(self.backing, Backing::Heap(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [base, base + len) is mapped readable and writable
        // (or heap allocated) for the life of self
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    /// Release the contents of section `index`, leaving zeroed memory
    /// at the same addresses
    pub fn discard(&mut self, index: usize) -> Result<(), MapError> {
        let section = match self.sections.get(index) {
            Some(s) => *s,
            None => return Ok(()),
        };
        if section.size == 0 {
            return Ok(());
        }
        match self.backing {
            Backing::Heap(_) => {
                self.as_mut_slice()[section.offset..section.offset + section.size].fill(0);
            }
            Backing::Mapped => {
                // SAFETY: the section lies inside our mapping
                let at = unsafe { self.base.as_ptr().add(section.offset) };
                sys::discard(at, section)?;
                self.sections[index].file_backed = false;
            }
        }
        debug!("discarded {:#x} bytes at {:#x}", section.size, section.offset);
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            sys::release(self.base.as_ptr(), self.len, &self.sections);
        }
    }
}

fn layout_sections(specs: &[MapSpec<'_>]) -> Result<(Vec<Section>, usize), MapError> {
    let mut sections = vec![];
    let mut offset = 0usize;
    for (index, spec) in specs.iter().enumerate() {
        if index + 1 < specs.len() && spec.size % MAX_PAGE_SIZE != 0 {
            return Err(MapError::BadSize {
                index,
                size: spec.size,
            });
        }
        sections.push(Section {
            offset,
            size: spec.size,
            file_backed: matches!(spec.source, MapSource::File(_)),
        });
        offset = offset
            .checked_add(spec.size)
            .ok_or(MapError::OutOfMemory(usize::MAX))?;
    }
    if offset == 0 {
        return Err(MapError::Empty);
    }
    Ok((sections, offset))
}

/// Map `specs` contiguously in virtual memory
pub fn map_contiguous(specs: &[MapSpec<'_>]) -> Result<MappedRegion, MapError> {
    let (sections, len) = layout_sections(specs)?;
    let base = sys::map(specs, &sections, len)?;
    debug!("mapped {} sections, {:#x} bytes at {:p}", specs.len(), len, base);
    Ok(MappedRegion {
        base,
        len,
        sections,
        backing: Backing::Mapped,
    })
}

/// Allocate one block and fill each section by reading or zeroing
pub fn map_contiguous_heap(specs: &[MapSpec<'_>]) -> Result<MappedRegion, MapError> {
    let (sections, len) = layout_sections(specs)?;
    let block = HeapBlock::new(len)?;
    let mut region = MappedRegion {
        base: block.ptr,
        len,
        sections: sections.clone(),
        backing: Backing::Heap(block),
    };
    let bytes = region.as_mut_slice();
    for (spec, section) in specs.iter().zip(&sections) {
        if let MapSource::File(mut file) = spec.source {
            file.seek(SeekFrom::Start(spec.file_offset))?;
            file.read_exact(&mut bytes[section.offset..section.offset + section.size])?;
        }
    }
    Ok(region)
}

/// Map with virtual memory, falling back to the heap on failure
pub fn map_contiguous_or_heap(
    specs: &[MapSpec<'_>],
    force_heap: bool,
) -> Result<MappedRegion, MapError> {
    if !force_heap {
        match map_contiguous(specs) {
            Ok(region) => return Ok(region),
            Err(e @ MapError::BadSize { .. }) | Err(e @ MapError::Empty) => return Err(e),
            Err(e) => warn!("memory mapping failed ({e}), reading image onto the heap"),
        }
    }
    map_contiguous_heap(specs)
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::ptr::{self, NonNull};

    use libc::{
        c_void, mmap, munmap, off_t, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE,
        PROT_NONE, PROT_READ, PROT_WRITE,
    };

    use super::{MapError, MapSource, MapSpec, Protection, Section};

    fn os_error() -> MapError {
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::ENOMEM) => MapError::OutOfMemory(0),
            _ => MapError::Os(e),
        }
    }

    fn populate(at: *mut u8, spec: &MapSpec<'_>) -> Result<(), MapError> {
        let prot = match spec.protection {
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        };
        let (flags, fd, offset) = match spec.source {
            MapSource::File(f) => (MAP_PRIVATE | MAP_FIXED, f.as_raw_fd(), spec.file_offset),
            MapSource::Anonymous => (MAP_PRIVATE | MAP_FIXED | MAP_ANONYMOUS, -1, 0),
        };
        // SAFETY: `at` lies inside a reservation we own; MAP_FIXED
        // replaces only that range
        let ptr = unsafe {
            mmap(
                at as *mut c_void,
                spec.size,
                prot,
                flags,
                fd,
                offset as off_t,
            )
        };
        if ptr == MAP_FAILED {
            Err(os_error())
        } else {
            Ok(())
        }
    }

    pub fn map(
        specs: &[MapSpec<'_>],
        sections: &[Section],
        len: usize,
    ) -> Result<NonNull<u8>, MapError> {
        // SAFETY: fresh anonymous reservation, no existing memory touched
        let reserved = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserved == MAP_FAILED {
            return Err(os_error());
        }
        let base = reserved as *mut u8;

        for (spec, section) in specs.iter().zip(sections) {
            if section.size == 0 {
                continue;
            }
            // SAFETY: offset is within the reservation
            let at = unsafe { base.add(section.offset) };
            if let Err(e) = populate(at, spec) {
                // SAFETY: releasing our own reservation
                unsafe { munmap(reserved, len) };
                return Err(e);
            }
        }

        NonNull::new(base).ok_or(MapError::OutOfMemory(len))
    }

    pub fn discard(at: *mut u8, section: Section) -> Result<(), MapError> {
        let spec = MapSpec {
            source: MapSource::Anonymous,
            size: section.size,
            file_offset: 0,
            protection: Protection::ReadWrite,
        };
        populate(at, &spec)
    }

    pub fn release(base: *mut u8, len: usize, _sections: &[Section]) {
        // SAFETY: the whole region was mapped by `map`
        unsafe { munmap(base as *mut c_void, len) };
    }
}

#[cfg(windows)]
mod sys {
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::ptr::{self, NonNull};

    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_INVALID_ADDRESS, HANDLE};
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        FILE_MAP_COPY, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };

    use super::{MapError, MapSource, MapSpec, Protection, Section};

    const MAX_ATTEMPTS: usize = 16;

    enum Failure {
        /// Someone else took part of the range; try again
        Moved,
        Fatal(MapError),
    }

    fn last_failure() -> Failure {
        // SAFETY: trivially safe FFI call
        if unsafe { GetLastError() } == ERROR_INVALID_ADDRESS {
            Failure::Moved
        } else {
            Failure::Fatal(MapError::Os(io::Error::last_os_error()))
        }
    }

    fn populate(at: *mut u8, spec: &MapSpec<'_>) -> Result<(), Failure> {
        match spec.source {
            MapSource::File(f) => {
                // SAFETY: valid file handle for the duration of the call
                let mapping = unsafe {
                    CreateFileMappingW(
                        f.as_raw_handle() as HANDLE,
                        ptr::null(),
                        PAGE_WRITECOPY,
                        0,
                        0,
                        ptr::null(),
                    )
                };
                if mapping == 0 {
                    return Err(Failure::Fatal(MapError::Os(io::Error::last_os_error())));
                }
                // SAFETY: mapping handle is valid; the view keeps the
                // mapping alive after the handle is closed
                let view = unsafe {
                    MapViewOfFileEx(
                        mapping,
                        FILE_MAP_COPY,
                        (spec.file_offset >> 32) as u32,
                        spec.file_offset as u32,
                        spec.size,
                        at as *const _,
                    )
                };
                let failure = if view.Value.is_null() {
                    Some(last_failure())
                } else {
                    None
                };
                // SAFETY: closing our own handle
                unsafe { CloseHandle(mapping) };
                match failure {
                    Some(f) => Err(f),
                    None => Ok(()),
                }
            }
            MapSource::Anonymous => {
                let protect = match spec.protection {
                    Protection::ReadOnly => PAGE_READONLY,
                    Protection::ReadWrite => PAGE_READWRITE,
                };
                // SAFETY: allocating at an address we just released
                let ptr = unsafe {
                    VirtualAlloc(at as *const _, spec.size, MEM_RESERVE | MEM_COMMIT, protect)
                };
                if ptr.is_null() {
                    Err(last_failure())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn release_section(at: *mut u8, section: &Section) {
        // SAFETY: each section was mapped or allocated by us at `at`
        unsafe {
            if section.file_backed {
                UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: at as *mut _ });
            } else {
                VirtualFree(at as *mut _, 0, MEM_RELEASE);
            }
        }
    }

    pub fn map(
        specs: &[MapSpec<'_>],
        sections: &[Section],
        len: usize,
    ) -> Result<NonNull<u8>, MapError> {
        for attempt in 0..MAX_ATTEMPTS {
            // SAFETY: reserve then release to learn a free range
            let reserved = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
            if reserved.is_null() {
                return Err(MapError::OutOfMemory(len));
            }
            // SAFETY: releasing the reservation made just above
            unsafe { VirtualFree(reserved, 0, MEM_RELEASE) };
            let base = reserved as *mut u8;

            let mut done = 0;
            let mut failure = None;
            for (spec, section) in specs.iter().zip(sections) {
                if section.size == 0 {
                    done += 1;
                    continue;
                }
                // SAFETY: offset within the released range
                let at = unsafe { base.add(section.offset) };
                if let Err(f) = populate(at, spec) {
                    failure = Some(f);
                    break;
                }
                done += 1;
            }

            match failure {
                None => return NonNull::new(base).ok_or(MapError::OutOfMemory(len)),
                Some(f) => {
                    for section in sections[..done].iter().filter(|s| s.size > 0) {
                        // SAFETY: offset within our mapping
                        release_section(unsafe { base.add(section.offset) }, section);
                    }
                    match f {
                        Failure::Moved => {
                            log::debug!("address range taken, retrying (attempt {attempt})")
                        }
                        Failure::Fatal(e) => return Err(e),
                    }
                }
            }
        }
        Err(MapError::Exhausted(MAX_ATTEMPTS))
    }

    pub fn discard(at: *mut u8, section: Section) -> Result<(), MapError> {
        release_section(at, &section);
        let spec = MapSpec {
            source: MapSource::Anonymous,
            size: section.size,
            file_offset: 0,
            protection: Protection::ReadWrite,
        };
        populate(at, &spec).map_err(|f| match f {
            Failure::Moved => MapError::Exhausted(1),
            Failure::Fatal(e) => e,
        })
    }

    pub fn release(base: *mut u8, _len: usize, sections: &[Section]) {
        for section in sections.iter().filter(|s| s.size > 0) {
            // SAFETY: offset within our mapping
            release_section(unsafe { base.add(section.offset) }, section);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::io::Write;

    fn image_file(pages: usize) -> File {
        let mut file = tempfile::tempfile().unwrap();
        let bytes: Vec<u8> = (0..pages * MAX_PAGE_SIZE).map(|i| (i / MAX_PAGE_SIZE) as u8 + 1).collect();
        file.write_all(&bytes).unwrap();
        file
    }

    fn specs(file: &File) -> Vec<MapSpec<'_>> {
        vec![
            MapSpec {
                source: MapSource::File(file),
                size: MAX_PAGE_SIZE,
                file_offset: 0,
                protection: Protection::ReadWrite,
            },
            MapSpec {
                source: MapSource::Anonymous,
                size: MAX_PAGE_SIZE,
                file_offset: 0,
                protection: Protection::ReadWrite,
            },
            MapSpec {
                source: MapSource::File(file),
                size: 100,
                file_offset: 2 * MAX_PAGE_SIZE as u64,
                protection: Protection::ReadWrite,
            },
        ]
    }

    fn check_contents(region: &MappedRegion) {
        let bytes = region.as_slice();
        assert_eq!(bytes.len(), 2 * MAX_PAGE_SIZE + 100);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[MAX_PAGE_SIZE - 1], 1);
        assert_eq!(bytes[MAX_PAGE_SIZE], 0);
        assert_eq!(bytes[2 * MAX_PAGE_SIZE], 3);
        assert_eq!(bytes[2 * MAX_PAGE_SIZE + 99], 3);
    }

    #[test]
    pub fn test_sections_are_contiguous() {
        let file = image_file(3);
        let region = map_contiguous(&specs(&file)).unwrap();
        check_contents(&region);
        assert_eq!(region.sections()[2].offset, 2 * MAX_PAGE_SIZE);
        assert_eq!(region.base() % MAX_PAGE_SIZE as u64 % 4096, 0);
    }

    #[test]
    pub fn test_heap_fallback_matches() {
        let file = image_file(3);
        let region = map_contiguous_heap(&specs(&file)).unwrap();
        assert!(region.is_heap());
        check_contents(&region);
    }

    #[test]
    pub fn test_writes_are_private() {
        let file = image_file(3);
        let mut region = map_contiguous(&specs(&file)).unwrap();
        region.as_mut_slice()[0] = 0xff;
        let again = map_contiguous(&specs(&file)).unwrap();
        assert_eq!(again.as_slice()[0], 1);
    }

    #[test]
    pub fn test_discard_zeroes() {
        let file = image_file(3);
        for mut region in [
            map_contiguous(&specs(&file)).unwrap(),
            map_contiguous_heap(&specs(&file)).unwrap(),
        ] {
            region.discard(0).unwrap();
            assert!(region.as_slice()[..MAX_PAGE_SIZE].iter().all(|b| *b == 0));
            assert_eq!(region.as_slice()[2 * MAX_PAGE_SIZE], 3);
        }
    }

    #[test]
    pub fn test_unaligned_inner_section_rejected() {
        let file = image_file(1);
        let mut bad = specs(&file);
        bad[0].size = 100;
        assert!(matches!(
            map_contiguous(&bad),
            Err(MapError::BadSize { index: 0, .. })
        ));
    }

    #[test]
    pub fn test_nothing_to_map() {
        assert!(matches!(map_contiguous(&[]), Err(MapError::Empty)));
    }
}
