//! Applying relocation tables to a mapped image
//!
//! Intra-image relocations are applied one phase at a time; host
//! relocations run between the early and native phases so that copied
//! symbols already hold absolute addresses when they land in host
//! storage.

use log::{debug, trace};

use crate::heap::host::HostImage;
use crate::image::header::{ImageHeader, Phase};
use crate::image::kind::ObjectKind;
use crate::image::layout::{bignum, compiled_unit, native_subr, string};
use crate::image::reloc::{HostReloc, HostRelocKind, Reloc, RelocKind};
use crate::image::word::{untagged, Tag, TAG_MASK};
use crate::image::DUMP_ALIGNMENT;

use super::error::LoadError;
use super::image::LoadedImage;
use super::runtime::NativeLoader;

/// Decode a table of fixed-size entries from the image
pub fn read_table<T, F, const N: usize>(
    bytes: &[u8],
    offset: u32,
    count: u32,
    decode: F,
) -> Result<Vec<T>, LoadError>
where
    F: Fn(&[u8; N]) -> Result<T, u8>,
{
    let start = offset as usize;
    let end = start
        .checked_add(count as usize * N)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| LoadError::corrupt(format!("table at {offset:#x} x {count} out of range")))?;
    bytes[start..end]
        .chunks_exact(N)
        .map(|chunk| {
            let mut entry = [0u8; N];
            entry.copy_from_slice(chunk);
            decode(&entry).map_err(|b| LoadError::corrupt(format!("bad table entry code {b}")))
        })
        .collect()
}

/// Bytes of the string record referred to by relocated value `word`
pub fn string_bytes(image: &LoadedImage, word: u64) -> Result<Vec<u8>, LoadError> {
    if Tag::of(word) != Some(Tag::String) {
        return Err(LoadError::corrupt(format!("{word:#x} is not a string")));
    }
    let offset = image
        .offset_of(untagged(word))
        .ok_or_else(|| LoadError::corrupt(format!("string {word:#x} outside image")))?;
    let len = image.read_u64(offset + string::LEN)? as usize;
    if len == 0 {
        return Ok(vec![]);
    }
    let data = image.read_u64(offset + string::DATA)?;
    let data = image
        .offset_of(data)
        .ok_or_else(|| LoadError::corrupt(format!("string data {data:#x} outside image")))?;
    Ok(image.read_bytes(data, len)?.to_vec())
}

fn expect_kind(image: &LoadedImage, offset: usize, kind: ObjectKind) -> Result<(), LoadError> {
    let (found, _) = image.record_header(offset)?;
    if found == kind {
        Ok(())
    } else {
        Err(LoadError::corrupt(format!(
            "expected {kind} at {offset:#x}, found {found}"
        )))
    }
}

fn check_site(header: &ImageHeader, reloc: &Reloc) -> Result<usize, LoadError> {
    let at = reloc.offset as usize;
    if at % DUMP_ALIGNMENT != 0 || at < crate::image::header::HEADER_SIZE {
        return Err(LoadError::corrupt(format!("misplaced relocation at {at:#x}")));
    }
    if at >= header.cold_start as usize {
        return Err(LoadError::corrupt(format!(
            "relocation at {at:#x} falls in the cold section"
        )));
    }
    Ok(at)
}

/// Rebase an image offset word, checking it stays within the heap
fn image_address(image: &LoadedImage, offset: u64) -> Result<u64, LoadError> {
    if offset >= image.header().end_heap as u64 {
        return Err(LoadError::corrupt(format!("image offset {offset:#x} out of range")));
    }
    Ok(image.start() + offset)
}

fn host_address(host: &HostImage, offset: u64) -> Result<u64, LoadError> {
    if offset >= host.len() as u64 {
        return Err(LoadError::corrupt(format!("host offset {offset:#x} out of range")));
    }
    Ok(host.base() + offset)
}

fn check_tag(word: u64, reloc: &Reloc) -> Result<(), LoadError> {
    if (word & TAG_MASK) as u8 == reloc.tag {
        Ok(())
    } else {
        Err(LoadError::corrupt(format!(
            "tag mismatch at {:#x}: word {word:#x}, expected tag {}",
            reloc.offset, reloc.tag
        )))
    }
}

fn apply(
    image: &mut LoadedImage,
    host: &HostImage,
    native: &mut dyn NativeLoader,
    reloc: &Reloc,
) -> Result<(), LoadError> {
    let at = check_site(image.header(), reloc)?;
    let word = image.read_u64(at)?;
    let patched = match reloc.kind {
        RelocKind::ImagePtr => image_address(image, word)?,
        RelocKind::ImageValue => {
            check_tag(word, reloc)?;
            image_address(image, untagged(word))? | (word & TAG_MASK)
        }
        RelocKind::HostPtr => host_address(host, word)?,
        RelocKind::HostValue => {
            check_tag(word, reloc)?;
            host_address(host, untagged(word))? | (word & TAG_MASK)
        }
        RelocKind::Bignum => {
            expect_kind(image, at, ObjectKind::Bignum)?;
            let limbs = image.read_u64(at + bignum::LIMB_OFFSET)?;
            let address = image_address(image, limbs)?;
            return image.write_u64(at + bignum::LIMBS, address);
        }
        RelocKind::NativeUnit => {
            expect_kind(image, at, ObjectKind::CompiledUnit)?;
            let file = string_bytes(image, image.read_u64(at + compiled_unit::FILE)?)?;
            let file = String::from_utf8_lossy(&file);
            let handle = native.load_unit(&file).map_err(LoadError::NativeCode)?;
            debug!("loaded native unit {file} as {handle:#x}");
            return image.write_u64(at + compiled_unit::HANDLE, handle);
        }
        RelocKind::NativeSubr => {
            expect_kind(image, at, ObjectKind::NativeSubr)?;
            let unit = image.read_u64(at + native_subr::UNIT)?;
            let unit = image
                .offset_of(untagged(unit))
                .ok_or_else(|| LoadError::corrupt(format!("native unit {unit:#x} outside image")))?;
            expect_kind(image, unit, ObjectKind::CompiledUnit)?;
            let handle = image.read_u64(unit + compiled_unit::HANDLE)?;
            let name = string_bytes(image, image.read_u64(at + native_subr::NAME)?)?;
            let name = String::from_utf8_lossy(&name);
            let entry = native.resolve(handle, &name).map_err(LoadError::NativeCode)?;
            return image.write_u64(at + native_subr::ENTRY, entry);
        }
    };
    trace!("{:?} at {at:#x}: {word:#x} -> {patched:#x}", reloc.kind);
    image.write_u64(at, patched)
}

/// Apply one phase of intra-image relocations
pub fn apply_phase(
    image: &mut LoadedImage,
    host: &HostImage,
    native: &mut dyn NativeLoader,
    phase: Phase,
    relocs: &[Reloc],
) -> Result<(), LoadError> {
    debug!("applying {} {} relocations", relocs.len(), phase.name());
    for reloc in relocs {
        apply(image, host, native, reloc)?;
    }
    Ok(())
}

fn host_range_error(reloc: &HostReloc) -> LoadError {
    LoadError::corrupt(format!(
        "host relocation {:?} at {:#x} + {} out of range",
        reloc.kind, reloc.host_offset, reloc.length
    ))
}

/// Apply image-to-host relocations
pub fn apply_host(
    image: &LoadedImage,
    host: &mut HostImage,
    relocs: &[HostReloc],
) -> Result<(), LoadError> {
    debug!("applying {} host relocations", relocs.len());
    for reloc in relocs {
        match reloc.kind {
            HostRelocKind::CopyFromImage => {
                let src = image.read_bytes(reloc.payload as usize, reloc.length as usize)?;
                host.write_bytes(reloc.host_offset, src)
                    .ok_or_else(|| host_range_error(reloc))?;
            }
            HostRelocKind::Immediate => {
                let len = reloc.length as usize;
                if len > 8 {
                    return Err(host_range_error(reloc));
                }
                let bytes = reloc.payload.to_le_bytes();
                host.write_bytes(reloc.host_offset, &bytes[..len])
                    .ok_or_else(|| host_range_error(reloc))?;
            }
            HostRelocKind::ImageValue => {
                let word = image_address(image, untagged(reloc.payload))?
                    | (reloc.payload & TAG_MASK);
                host.write_u64(reloc.host_offset, word)
                    .ok_or_else(|| host_range_error(reloc))?;
            }
            HostRelocKind::HostValue => {
                let word =
                    host_address(host, untagged(reloc.payload))? | (reloc.payload & TAG_MASK);
                host.write_u64(reloc.host_offset, word)
                    .ok_or_else(|| host_range_error(reloc))?;
            }
        }
    }
    Ok(())
}
