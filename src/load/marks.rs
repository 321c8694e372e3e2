//! Mark bits for objects inside a loaded image
//!
//! Objects in the image are not allocated by the host collector so
//! they carry no header mark. Instead one bit per `DUMP_ALIGNMENT`
//! slot of the hot section records liveness. Two generations are kept
//! so the collector can ask what was live at the previous trace.

use bitmaps::Bitmap;

use crate::image::DUMP_ALIGNMENT;

const CHUNK_BITS: usize = 64;

/// One bit per aligned slot, in chunks of 64
#[derive(Clone, Debug, Default)]
struct SlotMap(Vec<Bitmap<CHUNK_BITS>>);

impl SlotMap {
    fn new(slots: usize) -> Self {
        SlotMap(vec![Bitmap::new(); (slots + CHUNK_BITS - 1) / CHUNK_BITS])
    }

    fn get(&self, slot: usize) -> bool {
        self.0[slot / CHUNK_BITS].get(slot % CHUNK_BITS)
    }

    fn set(&mut self, slot: usize, value: bool) {
        self.0[slot / CHUNK_BITS].set(slot % CHUNK_BITS, value);
    }

    fn reset(&mut self) {
        for chunk in self.0.iter_mut() {
            chunk.clone_from(&Bitmap::new());
        }
    }

    fn count(&self) -> usize {
        self.0.iter().map(|c| c.len()).sum()
    }
}

/// Current and previous mark generations for `[0, limit)` of an image
#[derive(Clone, Debug)]
pub struct MarkBits {
    limit: usize,
    current: SlotMap,
    last: SlotMap,
}

impl MarkBits {
    /// Bits covering image offsets `[0, limit)`
    pub fn new(limit: usize) -> Self {
        let slots = limit / DUMP_ALIGNMENT;
        MarkBits {
            limit,
            current: SlotMap::new(slots),
            last: SlotMap::new(slots),
        }
    }

    /// Image offset range covered
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn slot(&self, offset: usize) -> Option<usize> {
        if offset < self.limit && offset % DUMP_ALIGNMENT == 0 {
            Some(offset / DUMP_ALIGNMENT)
        } else {
            None
        }
    }

    pub fn is_marked(&self, offset: usize) -> bool {
        self.slot(offset).map_or(false, |s| self.current.get(s))
    }

    /// Mark the object at `offset`, returning false if the offset is not
    /// covered
    pub fn set_marked(&mut self, offset: usize) -> bool {
        match self.slot(offset) {
            Some(s) => {
                self.current.set(s, true);
                true
            }
            None => false,
        }
    }

    /// Start a new generation: current marks become last marks and
    /// current is cleared
    pub fn clear_marks(&mut self) {
        std::mem::swap(&mut self.current, &mut self.last);
        self.current.reset();
    }

    pub fn was_marked_last(&self, offset: usize) -> bool {
        self.slot(offset).map_or(false, |s| self.last.get(s))
    }

    /// Number of marked slots in the current generation
    pub fn marked_count(&self) -> usize {
        self.current.count()
    }
}
