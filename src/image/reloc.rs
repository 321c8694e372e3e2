//! Relocation and object-start table entries
//!
//! Intra-image relocations patch a word of the mapped image once its
//! base address is known. Image-to-host relocations patch the host's
//! static storage from image contents.

use std::convert::TryFrom;

use itertools::Itertools;

use super::kind::ObjectKind;
use super::word::Tag;

/// Kind of intra-image relocation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocKind {
    /// Untagged image offset to absolute pointer
    ImagePtr = 1,
    /// Tagged image offset to tagged absolute pointer
    ImageValue = 2,
    /// Untagged host offset to absolute host pointer
    HostPtr = 3,
    /// Tagged host offset to tagged absolute host pointer
    HostValue = 4,
    /// Rebuild a bignum's limb pointer from its reload info
    Bignum = 5,
    /// Load the native code unit described by a compiled-unit record
    NativeUnit = 6,
    /// Resolve the entry point of a native subr
    NativeSubr = 7,
}

impl TryFrom<u8> for RelocKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => RelocKind::ImagePtr,
            2 => RelocKind::ImageValue,
            3 => RelocKind::HostPtr,
            4 => RelocKind::HostValue,
            5 => RelocKind::Bignum,
            6 => RelocKind::NativeUnit,
            7 => RelocKind::NativeSubr,
            n => return Err(n),
        })
    }
}

/// A relocation of the word (or record) at `offset` in the image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u32,
    pub kind: RelocKind,
    /// Expected tag for the value kinds, zero otherwise
    pub tag: u8,
}

impl Reloc {
    pub const SIZE: usize = 8;

    pub fn new(offset: u32, kind: RelocKind) -> Self {
        Reloc {
            offset,
            kind,
            tag: 0,
        }
    }

    pub fn tagged(offset: u32, kind: RelocKind, tag: Tag) -> Self {
        Reloc {
            offset,
            kind,
            tag: tag as u8,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4] = self.kind as u8;
        out[5] = self.tag;
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Result<Self, u8> {
        Ok(Reloc {
            offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            kind: RelocKind::try_from(bytes[4])?,
            tag: bytes[5],
        })
    }
}

/// Kind of image-to-host relocation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostRelocKind {
    /// Copy `length` bytes from image offset `payload`
    CopyFromImage = 1,
    /// Store the low `length` bytes of `payload`
    Immediate = 2,
    /// Store image base plus the tagged offset in `payload`
    ImageValue = 3,
    /// Store host base plus the tagged offset in `payload`
    HostValue = 4,
}

impl TryFrom<u8> for HostRelocKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => HostRelocKind::CopyFromImage,
            2 => HostRelocKind::Immediate,
            3 => HostRelocKind::ImageValue,
            4 => HostRelocKind::HostValue,
            n => return Err(n),
        })
    }
}

/// A patch to host static storage at `host_offset`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostReloc {
    pub kind: HostRelocKind,
    pub host_offset: u32,
    pub length: u32,
    pub payload: u64,
}

impl HostReloc {
    pub const SIZE: usize = 24;

    pub fn copy_from_image(host_offset: u32, image_offset: u32, length: u32) -> Self {
        HostReloc {
            kind: HostRelocKind::CopyFromImage,
            host_offset,
            length,
            payload: image_offset as u64,
        }
    }

    pub fn immediate(host_offset: u32, length: u32, value: u64) -> Self {
        debug_assert!(length <= 8);
        HostReloc {
            kind: HostRelocKind::Immediate,
            host_offset,
            length,
            payload: value,
        }
    }

    pub fn image_value(host_offset: u32, tagged_offset: u64) -> Self {
        HostReloc {
            kind: HostRelocKind::ImageValue,
            host_offset,
            length: 8,
            payload: tagged_offset,
        }
    }

    pub fn host_value(host_offset: u32, tagged_offset: u64) -> Self {
        HostReloc {
            kind: HostRelocKind::HostValue,
            host_offset,
            length: 8,
            payload: tagged_offset,
        }
    }

    pub fn end(&self) -> u64 {
        self.host_offset as u64 + self.length as u64
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.kind as u8;
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.host_offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Result<Self, u8> {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&bytes[16..24]);
        Ok(HostReloc {
            kind: HostRelocKind::try_from(bytes[0])?,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            host_offset: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload: u64::from_le_bytes(payload),
        })
    }

    /// Merge `next` onto the end of `self` if both copy contiguous
    /// ranges, contiguous on both sides, without overflowing the length
    fn merge(self, next: HostReloc) -> Result<HostReloc, (HostReloc, HostReloc)> {
        if self.kind != HostRelocKind::CopyFromImage || next.kind != HostRelocKind::CopyFromImage {
            return Err((self, next));
        }
        let host_adjacent = self.end() == next.host_offset as u64;
        let image_adjacent = self.payload + self.length as u64 == next.payload;
        match self.length.checked_add(next.length) {
            Some(length) if host_adjacent && image_adjacent => Ok(HostReloc { length, ..self }),
            _ => Err((self, next)),
        }
    }
}

/// Sort host relocations by destination and merge adjacent copies
pub fn merge_host_relocs(mut relocs: Vec<HostReloc>) -> Vec<HostReloc> {
    relocs.sort_by_key(|r| r.host_offset);
    relocs
        .into_iter()
        .coalesce(HostReloc::merge)
        .collect()
}

/// Entry in the object-starts table
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectStart {
    pub offset: u32,
    pub kind: ObjectKind,
}

impl ObjectStart {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4] = self.kind as u8;
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Result<Self, u8> {
        Ok(ObjectStart {
            offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            kind: ObjectKind::try_from(bytes[4])?,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_adjacent_copies_merge() {
        let merged = merge_host_relocs(vec![
            HostReloc::copy_from_image(108, 2008, 4),
            HostReloc::copy_from_image(100, 2000, 8),
        ]);
        assert_eq!(merged, vec![HostReloc::copy_from_image(100, 2000, 12)]);
    }

    #[test]
    pub fn test_gap_on_either_side_prevents_merge() {
        let host_gap = merge_host_relocs(vec![
            HostReloc::copy_from_image(100, 2000, 8),
            HostReloc::copy_from_image(112, 2008, 4),
        ]);
        assert_eq!(host_gap.len(), 2);

        let image_gap = merge_host_relocs(vec![
            HostReloc::copy_from_image(100, 2000, 8),
            HostReloc::copy_from_image(108, 2016, 4),
        ]);
        assert_eq!(image_gap.len(), 2);
    }

    #[test]
    pub fn test_overflowing_merge_keeps_both() {
        let merged = merge_host_relocs(vec![
            HostReloc::copy_from_image(0, 0, u32::MAX),
            HostReloc::copy_from_image(u32::MAX, u32::MAX, 1),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].length, 1);
    }

    #[test]
    pub fn test_other_kinds_never_merge() {
        let merged = merge_host_relocs(vec![
            HostReloc::immediate(100, 8, 1),
            HostReloc::immediate(108, 8, 2),
            HostReloc::copy_from_image(116, 0, 8),
        ]);
        assert_eq!(merged.len(), 3);
        assert!(merged.windows(2).all(|w| w[0].host_offset < w[1].host_offset));
    }

    #[test]
    pub fn test_table_entry_encoding() {
        let r = Reloc::tagged(0x1238, RelocKind::ImageValue, Tag::Cons);
        assert_eq!(Reloc::decode(&r.encode()), Ok(r));

        let h = HostReloc::image_value(64, 0x2002);
        assert_eq!(HostReloc::decode(&h.encode()), Ok(h));

        let s = ObjectStart {
            offset: 0x68,
            kind: ObjectKind::Symbol,
        };
        assert_eq!(ObjectStart::decode(&s.encode()), Ok(s));
    }
}
