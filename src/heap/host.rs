//! Host static storage
//!
//! The host runtime owns a block of static storage that is not part of
//! the heap: builtin symbol records, builtin function (subr) records,
//! root value slots and a raw scalar area. Images refer into it by
//! offset and patch it on load.
//!
//! ```text
//! +------------------+ 0
//! | builtin symbols  |  symbol::SIZE each
//! +------------------+ subrs_start
//! | subrs            |  subr::SIZE each
//! +------------------+ statics_start
//! | static slots     |  one word each
//! +------------------+ scalars_start
//! | scalar area      |
//! +------------------+ size
//! ```

use crate::image::kind::{header_word, ObjectKind};
use crate::image::layout::{subr, symbol};
use crate::image::round_up;

use super::{BuiltinId, SubrId};

/// Shape of the host's static storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostLayout {
    builtin_names: Vec<String>,
    subr_names: Vec<String>,
    static_slots: u32,
    scalar_bytes: u32,
}

impl HostLayout {
    pub fn new<S: AsRef<str>>(
        builtin_names: &[S],
        subr_names: &[S],
        static_slots: u32,
        scalar_bytes: u32,
    ) -> Self {
        HostLayout {
            builtin_names: builtin_names.iter().map(|s| s.as_ref().to_string()).collect(),
            subr_names: subr_names.iter().map(|s| s.as_ref().to_string()).collect(),
            static_slots,
            scalar_bytes: round_up(scalar_bytes as usize, 8) as u32,
        }
    }

    pub fn builtin_names(&self) -> &[String] {
        &self.builtin_names
    }

    pub fn subr_names(&self) -> &[String] {
        &self.subr_names
    }

    pub fn static_slots(&self) -> u32 {
        self.static_slots
    }

    pub fn scalar_bytes(&self) -> u32 {
        self.scalar_bytes
    }

    pub fn builtin_offset(&self, id: BuiltinId) -> u32 {
        id.0 * symbol::SIZE as u32
    }

    pub fn subrs_start(&self) -> u32 {
        self.builtin_names.len() as u32 * symbol::SIZE as u32
    }

    pub fn subr_offset(&self, id: SubrId) -> u32 {
        self.subrs_start() + id.0 * subr::SIZE as u32
    }

    pub fn statics_start(&self) -> u32 {
        self.subrs_start() + self.subr_names.len() as u32 * subr::SIZE as u32
    }

    pub fn static_offset(&self, slot: u32) -> u32 {
        self.statics_start() + slot * 8
    }

    pub fn scalars_start(&self) -> u32 {
        self.statics_start() + self.static_slots * 8
    }

    pub fn scalar_offset(&self, offset: u32) -> u32 {
        self.scalars_start() + offset
    }

    /// Total size in bytes
    pub fn size(&self) -> u32 {
        self.scalars_start() + self.scalar_bytes
    }

    /// Which builtin symbol record starts at `offset`, if any
    pub fn builtin_at(&self, offset: u32) -> Option<BuiltinId> {
        if offset < self.subrs_start() && offset % symbol::SIZE as u32 == 0 {
            Some(BuiltinId(offset / symbol::SIZE as u32))
        } else {
            None
        }
    }

    /// Which subr record starts at `offset`, if any
    pub fn subr_at(&self, offset: u32) -> Option<SubrId> {
        let start = self.subrs_start();
        if offset >= start
            && offset < self.statics_start()
            && (offset - start) % subr::SIZE as u32 == 0
        {
            Some(SubrId((offset - start) / subr::SIZE as u32))
        } else {
            None
        }
    }

    /// Whether a remembered location lies inside host storage
    pub fn holds(&self, location: Remembered) -> bool {
        match location {
            Remembered::Scalar { offset, len } => offset
                .checked_add(len)
                .map_or(false, |end| end <= self.scalar_bytes),
            Remembered::RawPointer { slot } => slot < self.static_slots,
        }
    }

    /// Bytes identifying this layout, folded into the image fingerprint
    pub fn identity(&self) -> Vec<u8> {
        let mut id = vec![];
        for name in self.builtin_names.iter().chain(self.subr_names.iter()) {
            id.extend_from_slice(name.as_bytes());
            id.push(0);
        }
        id.extend_from_slice(&(self.builtin_names.len() as u32).to_le_bytes());
        id.extend_from_slice(&(self.subr_names.len() as u32).to_le_bytes());
        id.extend_from_slice(&self.static_slots.to_le_bytes());
        id.extend_from_slice(&self.scalar_bytes.to_le_bytes());
        id
    }
}

/// A host location the image must restore even though it is not part
/// of any object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Remembered {
    /// Raw bytes at an offset into the scalar area
    Scalar { offset: u32, len: u32 },
    /// Static slot holding an untagged pointer to an object
    RawPointer { slot: u32 },
}

/// Live host static storage: word-aligned, fixed size, never moves
#[derive(Debug)]
pub struct HostImage {
    layout: HostLayout,
    words: Vec<u64>,
}

impl HostImage {
    /// Fresh storage with subr records initialised
    pub fn new(layout: HostLayout) -> Self {
        let words = vec![0u64; layout.size() as usize / 8];
        let mut host = HostImage { layout, words };
        for i in 0..host.layout.subr_names.len() as u32 {
            let at = host.layout.subr_offset(SubrId(i));
            let written = host
                .write_u64(at, header_word(ObjectKind::Subr, 0))
                .and_then(|_| host.write_u64(at + subr::INDEX as u32, i as u64));
            debug_assert!(written.is_some(), "subr record {i} outside host storage");
        }
        host
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// Absolute address of offset zero
    pub fn base(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Host offset of an absolute address inside this storage
    pub fn offset_of(&self, address: u64) -> Option<u32> {
        let base = self.base();
        if address >= base && address < base + self.len() as u64 {
            Some((address - base) as u32)
        } else {
            None
        }
    }

    pub fn read_u64(&self, offset: u32) -> Option<u64> {
        let at = offset as usize;
        let bytes = self.bytes().get(at..at.checked_add(8)?)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, offset: u32, value: u64) -> Option<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let at = offset as usize;
        self.bytes().get(at..at.checked_add(len as usize)?)
    }

    pub fn write_bytes(&mut self, offset: u32, src: &[u8]) -> Option<()> {
        let at = offset as usize;
        let dst = self.bytes_mut().get_mut(at..at.checked_add(src.len())?)?;
        dst.copy_from_slice(src);
        Some(())
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u64> {
        self.words.clone()
    }

    /// Restore contents from a snapshot without moving the storage
    pub fn restore(&mut self, snapshot: &[u64]) {
        if snapshot.len() == self.words.len() {
            self.words.copy_from_slice(snapshot);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn layout() -> HostLayout {
        HostLayout::new(&["nil", "t"], &["car", "cdr", "cons"], 4, 13)
    }

    #[test]
    pub fn test_layout_offsets() {
        let l = layout();
        assert_eq!(l.builtin_offset(BuiltinId(1)), 40);
        assert_eq!(l.subrs_start(), 80);
        assert_eq!(l.subr_offset(SubrId(2)), 112);
        assert_eq!(l.statics_start(), 128);
        assert_eq!(l.static_offset(3), 152);
        assert_eq!(l.scalars_start(), 160);
        assert_eq!(l.scalar_bytes(), 16);
        assert_eq!(l.size(), 176);
    }

    #[test]
    pub fn test_record_lookup() {
        let l = layout();
        assert_eq!(l.builtin_at(40), Some(BuiltinId(1)));
        assert_eq!(l.builtin_at(44), None);
        assert_eq!(l.subr_at(96), Some(SubrId(1)));
        assert_eq!(l.subr_at(128), None);
    }

    #[test]
    pub fn test_identity_distinguishes_layouts() {
        let other = HostLayout::new(&["nil", "t"], &["car", "cdr", "cons"], 5, 13);
        assert_ne!(layout().identity(), other.identity());
    }

    #[test]
    pub fn test_host_image_access() {
        let mut host = HostImage::new(layout());
        assert_eq!(host.len(), 176);
        assert_eq!(host.base() % 8, 0);
        assert_eq!(host.read_u64(112 + 8), Some(2));
        host.write_u64(128, 0xdead).unwrap();
        assert_eq!(host.read_u64(128), Some(0xdead));
        assert_eq!(host.read_u64(172), None);
        assert_eq!(host.offset_of(host.base() + 128), Some(128));
        assert_eq!(host.offset_of(host.base() + 176), None);
    }

    #[test]
    pub fn test_snapshot_restore_keeps_base() {
        let mut host = HostImage::new(layout());
        let base = host.base();
        let snap = host.snapshot();
        host.write_u64(160, 7).unwrap();
        host.restore(&snap);
        assert_eq!(host.read_u64(160), Some(0));
        assert_eq!(host.base(), base);
    }
}
