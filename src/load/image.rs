//! A mapped, relocated image
//!
//! `LoadedImage` owns the mapping for the remainder of the process and
//! offers the queries the host collector needs: which addresses belong
//! to the image, where objects start, which are cold, and the mark
//! bits for hot objects.

use std::ops::Range;

use crate::image::header::ImageHeader;
use crate::image::kind::{split_header, ObjectKind};
use crate::image::layout::hash_table;
use crate::image::reloc::ObjectStart;
use crate::image::word::untagged;
use crate::image::{round_up, MAX_PAGE_SIZE};

use super::error::{LoadError, MapError};
use super::marks::MarkBits;
use super::mmap::MappedRegion;
use super::thaw::{hash_key, HashIndex};

/// Index of each mapped section
pub const HOT: usize = 0;
pub const DISCARDABLE: usize = 1;
pub const COLD: usize = 2;

/// Image offset ranges of the three mapped sections
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sections {
    pub hot: Range<usize>,
    pub discardable: Range<usize>,
    /// Cold payloads followed by the tables
    pub cold: Range<usize>,
}

impl Sections {
    /// Split a file of `file_len` bytes at page boundaries
    pub fn of(header: &ImageHeader, file_len: usize) -> Self {
        let cold_start = header.cold_start as usize;
        let hot_end = round_up(header.discardable_start as usize, MAX_PAGE_SIZE).min(cold_start);
        Sections {
            hot: 0..hot_end,
            discardable: hot_end..cold_start,
            cold: cold_start..file_len,
        }
    }
}

pub struct LoadedImage {
    region: MappedRegion,
    header: ImageHeader,
    sections: Sections,
    object_starts: Vec<ObjectStart>,
    marks: MarkBits,
    hash_indexes: Vec<HashIndex>,
    discarded: bool,
}

impl LoadedImage {
    pub fn new(
        region: MappedRegion,
        header: ImageHeader,
        sections: Sections,
        object_starts: Vec<ObjectStart>,
    ) -> Self {
        let marks = MarkBits::new(header.discardable_start as usize);
        LoadedImage {
            region,
            header,
            sections,
            object_starts,
            marks,
            hash_indexes: vec![],
            discarded: false,
        }
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn sections(&self) -> &Sections {
        &self.sections
    }

    /// Absolute address of the start of the image
    pub fn start(&self) -> u64 {
        self.region.base()
    }

    /// Absolute address of the end of the heap portion of the image
    pub fn end(&self) -> u64 {
        self.start() + self.header.end_heap as u64
    }

    pub fn is_heap_backed(&self) -> bool {
        self.region.is_heap()
    }

    pub fn bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn object_starts(&self) -> &[ObjectStart] {
        &self.object_starts
    }

    /// Whether `address` lies within the image heap
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start() && address < self.end()
    }

    /// Whether `address` lies within the cold section
    pub fn is_cold(&self, address: u64) -> bool {
        self.contains(address) && address >= self.start() + self.header.cold_start as u64
    }

    /// Image offset of an absolute address within the heap
    pub fn offset_of(&self, address: u64) -> Option<usize> {
        if self.contains(address) {
            Some((address - self.start()) as usize)
        } else {
            None
        }
    }

    pub fn address_of(&self, offset: usize) -> u64 {
        self.start() + offset as u64
    }

    /// Kind of the object starting exactly at `address`
    pub fn find_object_kind(&self, address: u64) -> Option<ObjectKind> {
        let offset = self.offset_of(address)? as u32;
        self.object_starts
            .binary_search_by_key(&offset, |s| s.offset)
            .ok()
            .map(|i| self.object_starts[i].kind)
    }

    pub fn is_object_start(&self, address: u64) -> bool {
        self.find_object_kind(address).is_some()
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, LoadError> {
        let bytes = self
            .bytes()
            .get(offset..offset.saturating_add(8))
            .ok_or_else(|| LoadError::corrupt(format!("read past end at {offset:#x}")))?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), LoadError> {
        let bytes = self
            .region
            .as_mut_slice()
            .get_mut(offset..offset.saturating_add(8))
            .ok_or_else(|| LoadError::corrupt(format!("write past end at {offset:#x}")))?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], LoadError> {
        self.bytes()
            .get(offset..offset.saturating_add(len))
            .ok_or_else(|| LoadError::corrupt(format!("{len} bytes at {offset:#x} out of range")))
    }

    /// Kind and auxiliary value of the record at `offset`
    pub fn record_header(&self, offset: usize) -> Result<(ObjectKind, u64), LoadError> {
        let word = self.read_u64(offset)?;
        split_header(word)
            .map_err(|k| LoadError::corrupt(format!("bad kind {k} in record at {offset:#x}")))
    }

    /// Entry count of the hash table record at `offset`, which must
    /// fit below the cold section
    pub fn hash_table_count(&self, offset: usize) -> Result<usize, LoadError> {
        let count = self.read_u64(offset + hash_table::COUNT)?;
        hash_table::checked_size(count)
            .and_then(|size| offset.checked_add(size))
            .filter(|end| *end <= self.header.cold_start as usize)
            .map(|_| count as usize)
            .ok_or_else(|| {
                LoadError::corrupt(format!(
                    "hash table at {offset:#x} claims {count} entries"
                ))
            })
    }

    pub fn marks(&self) -> &MarkBits {
        &self.marks
    }

    pub fn marks_mut(&mut self) -> &mut MarkBits {
        &mut self.marks
    }

    pub fn is_marked(&self, address: u64) -> bool {
        self.offset_of(address)
            .map_or(false, |offset| self.marks.is_marked(offset))
    }

    pub fn set_marked(&mut self, address: u64) -> bool {
        match self.offset_of(address) {
            Some(offset) => self.marks.set_marked(offset),
            None => false,
        }
    }

    pub fn clear_marks(&mut self) {
        self.marks.clear_marks()
    }

    pub fn was_marked_last(&self, address: u64) -> bool {
        self.offset_of(address)
            .map_or(false, |offset| self.marks.was_marked_last(offset))
    }

    /// Release the discardable section once nothing needs it
    pub fn discard(&mut self) -> Result<(), MapError> {
        if !self.discarded {
            self.region.discard(DISCARDABLE)?;
            self.discarded = true;
        }
        Ok(())
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Install a rebuilt lookup index, returning its handle
    pub(super) fn add_hash_index(&mut self, index: HashIndex) -> u64 {
        self.hash_indexes.push(index);
        self.hash_indexes.len() as u64
    }

    pub fn hash_index_count(&self) -> usize {
        self.hash_indexes.len()
    }

    /// Look up `key` (a relocated value word) in the hash table at
    /// `table` (a relocated value word), returning the value word
    pub fn hash_lookup(&self, table: u64, key: u64) -> Result<Option<u64>, LoadError> {
        let offset = self
            .offset_of(untagged(table))
            .ok_or_else(|| LoadError::corrupt(format!("{table:#x} is not in the image")))?;
        let (kind, aux) = self.record_header(offset)?;
        if kind != ObjectKind::HashTable {
            return Err(LoadError::corrupt(format!("{table:#x} is a {kind}")));
        }
        let handle = self.read_u64(offset + hash_table::INDEX)? as usize;
        let index = handle
            .checked_sub(1)
            .and_then(|i| self.hash_indexes.get(i))
            .ok_or_else(|| LoadError::corrupt(format!("hash table at {offset:#x} is frozen")))?;
        let key = hash_key(self, aux & 0xff, key)?;
        Ok(index.get(&key).copied())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::image::fingerprint::Fingerprint;

    #[test]
    pub fn test_sections_split_at_pages() {
        let mut header = ImageHeader::new(Fingerprint::from_bytes([0; 32]));
        header.discardable_start = 0x1_2000;
        header.cold_start = 0x4_0000;
        header.end_heap = 0x4_1000;
        let s = Sections::of(&header, 0x4_2000);
        assert_eq!(s.hot, 0..0x2_0000);
        assert_eq!(s.discardable, 0x2_0000..0x4_0000);
        assert_eq!(s.cold, 0x4_0000..0x4_2000);
    }

    #[test]
    pub fn test_discardable_may_be_empty() {
        let mut header = ImageHeader::new(Fingerprint::from_bytes([0; 32]));
        header.discardable_start = 0x200;
        header.cold_start = 0x1_0000;
        let s = Sections::of(&header, 0x1_0000);
        assert_eq!(s.hot, 0..0x1_0000);
        assert!(s.discardable.is_empty());
        assert!(s.cold.is_empty());
    }
}
