//! Validating, mapping and relocating an image file
//!
//! Validation order matters: size, then magic (telling an interrupted
//! write apart from a foreign file), then the build fingerprint, then
//! the header's ranges. Only then is anything mapped.

use std::fs::File;
use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};

use crate::heap::host::HostImage;
use crate::image::fingerprint::Fingerprint;
use crate::image::header::{ImageHeader, Locator, Phase, HEADER_SIZE};
use crate::image::reloc::{HostReloc, ObjectStart, Reloc};
use crate::image::{INCOMPLETE_MAGIC_BYTE, MAGIC, MAX_PAGE_SIZE};

use super::error::LoadError;
use super::image::{LoadedImage, Sections};
use super::mmap::{map_contiguous_or_heap, MapSource, MapSpec, Protection};
use super::relocate::{apply_host, apply_phase, read_table};
use super::runtime::NativeLoader;
use super::settings::{LoadSettings, LoadStats};

/// Restores host storage on drop unless disarmed
struct HostGuard<'h> {
    host: &'h mut HostImage,
    snapshot: Option<Vec<u64>>,
}

impl<'h> HostGuard<'h> {
    fn new(host: &'h mut HostImage) -> Self {
        let snapshot = Some(host.snapshot());
        HostGuard { host, snapshot }
    }

    fn disarm(mut self) {
        self.snapshot = None;
    }
}

impl Deref for HostGuard<'_> {
    type Target = HostImage;

    fn deref(&self) -> &HostImage {
        self.host
    }
}

impl DerefMut for HostGuard<'_> {
    fn deref_mut(&mut self) -> &mut HostImage {
        self.host
    }
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!("load failed, restoring host storage");
            self.host.restore(&snapshot);
        }
    }
}

fn open(path: &Path) -> Result<File, LoadError> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LoadError::FileNotFound,
        _ => LoadError::Io(e),
    })
}

/// Read the header, checking only size and magic
pub fn read_header(file: &mut File) -> Result<(ImageHeader, usize), LoadError> {
    let file_len = file.metadata()?.len() as usize;
    if file_len < HEADER_SIZE {
        return Err(LoadError::BadFileType);
    }
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut bytes)?;
    if bytes[..MAGIC.len()] != MAGIC {
        if bytes[0] == INCOMPLETE_MAGIC_BYTE && bytes[1..MAGIC.len()] == MAGIC[1..] {
            return Err(LoadError::PreviousWriteIncomplete);
        }
        return Err(LoadError::BadFileType);
    }
    Ok((ImageHeader::decode(&bytes), file_len))
}

/// Read the header of the image at `path` without loading it
pub fn inspect(path: &Path) -> Result<(ImageHeader, usize), LoadError> {
    read_header(&mut open(path)?)
}

fn check_locator(
    name: &str,
    loc: Locator,
    entry: usize,
    header: &ImageHeader,
    file_len: usize,
) -> Result<(), LoadError> {
    if loc.count == 0 {
        return Ok(());
    }
    if (loc.offset as usize) < header.end_heap as usize || loc.end(entry) > file_len {
        return Err(LoadError::corrupt(format!(
            "{name} table at {:#x} x {} out of range",
            loc.offset, loc.count
        )));
    }
    Ok(())
}

/// Check that the header's ranges describe a well formed file
pub fn validate_header(header: &ImageHeader, file_len: usize) -> Result<(), LoadError> {
    let ds = header.discardable_start as usize;
    let cs = header.cold_start as usize;
    let end = header.end_heap as usize;
    if !(HEADER_SIZE <= ds && ds <= cs && cs <= end && end <= file_len) {
        return Err(LoadError::corrupt(format!(
            "bad section bounds {ds:#x} {cs:#x} {end:#x} in {file_len:#x} byte file"
        )));
    }
    if cs % MAX_PAGE_SIZE != 0 {
        return Err(LoadError::corrupt(format!("cold start {cs:#x} not page aligned")));
    }
    let hash_list = header.hash_list_offset as usize;
    if hash_list != 0 && !(HEADER_SIZE..ds).contains(&hash_list) {
        return Err(LoadError::corrupt(format!("hash list at {hash_list:#x}")));
    }
    for phase in Phase::ALL {
        check_locator(phase.name(), header.relocs(phase), Reloc::SIZE, header, file_len)?;
    }
    check_locator("object start", header.object_starts, ObjectStart::SIZE, header, file_len)?;
    check_locator("host relocation", header.host_relocs, HostReloc::SIZE, header, file_len)
}

/// Load and relocate the image at `path` into `host`
///
/// On failure every mapping is released and `host` is left exactly as
/// it was.
pub fn load_image(
    path: &Path,
    host: &mut HostImage,
    native: &mut dyn NativeLoader,
    settings: &LoadSettings,
) -> Result<(LoadedImage, LoadStats), LoadError> {
    let mut stats = LoadStats::default();

    let start = Instant::now();
    let mut file = open(path)?;
    let (header, file_len) = read_header(&mut file)?;
    let expected = Fingerprint::of_build(&host.layout().identity());
    if header.fingerprint != expected {
        return Err(LoadError::VersionMismatch {
            expected,
            found: header.fingerprint,
        });
    }
    validate_header(&header, file_len)?;
    stats.timings.record("load-validate", start.elapsed());

    let start = Instant::now();
    let sections = Sections::of(&header, file_len);
    let specs: Vec<MapSpec<'_>> = [&sections.hot, &sections.discardable, &sections.cold]
        .iter()
        .map(|range| MapSpec {
            source: MapSource::File(&file),
            size: range.len(),
            file_offset: range.start as u64,
            protection: Protection::ReadWrite,
        })
        .collect();
    let region = map_contiguous_or_heap(&specs, settings.force_heap_fallback)?;
    stats.heap_backed = region.is_heap();
    stats.timings.record("load-map", start.elapsed());
    debug!("image mapped at {:#x}", region.base());

    let bytes = region.as_slice();
    let mut relocs: [Vec<Reloc>; 3] = Default::default();
    for phase in Phase::ALL {
        let loc = header.relocs(phase);
        relocs[phase as usize] = read_table(bytes, loc.offset, loc.count, Reloc::decode)?;
    }
    let starts = read_table(
        bytes,
        header.object_starts.offset,
        header.object_starts.count,
        ObjectStart::decode,
    )?;
    if starts.windows(2).any(|w| w[0].offset >= w[1].offset)
        || starts
            .last()
            .map_or(false, |s| s.offset >= header.discardable_start)
    {
        return Err(LoadError::corrupt("object starts out of order or range"));
    }
    let host_relocs = read_table(
        bytes,
        header.host_relocs.offset,
        header.host_relocs.count,
        HostReloc::decode,
    )?;

    stats.file_bytes = file_len;
    stats.hot_bytes = sections.hot.len();
    stats.discardable_bytes = sections.discardable.len();
    stats.cold_bytes = sections.cold.len();
    stats.objects = starts.len();
    stats.host_relocs = host_relocs.len();
    for phase in Phase::ALL {
        stats.relocs[phase as usize] = relocs[phase as usize].len();
    }

    let mut image = LoadedImage::new(region, header, sections, starts);
    let mut host = HostGuard::new(host);

    let start = Instant::now();
    apply_phase(&mut image, &host, native, Phase::Early, &relocs[Phase::Early as usize])?;
    apply_host(&image, &mut host, &host_relocs)?;
    stats.timings.record("load-early", start.elapsed());

    let start = Instant::now();
    for phase in [Phase::Native, Phase::Late] {
        apply_phase(&mut image, &host, native, phase, &relocs[phase as usize])?;
    }
    stats.timings.record("load-native-late", start.elapsed());

    image.discard()?;
    host.disarm();

    info!(
        "loaded {} ({} bytes, {} objects)",
        path.display(),
        file_len,
        stats.objects
    );
    Ok((image, stats))
}
