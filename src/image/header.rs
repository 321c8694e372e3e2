//! Fixed-size image header at offset zero

use std::fmt;

use super::fingerprint::{Fingerprint, FINGERPRINT_LEN};
use super::MAGIC;

/// Location and entry count of a table in the image
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Locator {
    pub offset: u32,
    pub count: u32,
}

impl Locator {
    pub fn new(offset: u32, count: u32) -> Self {
        Locator { offset, count }
    }

    /// Byte range covered given the size of each entry
    pub fn end(&self, entry_size: usize) -> usize {
        self.offset as usize + self.count as usize * entry_size
    }
}

/// Relocation phases, applied at load in declaration order
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Pointer rebasing, safe before any code runs
    Early = 0,
    /// Activation of compiled-code units
    Native = 1,
    /// Anything that may call back into interpreted code
    Late = 2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Early, Phase::Native, Phase::Late];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Early => "early",
            Phase::Native => "native",
            Phase::Late => "late",
        }
    }
}

pub const HEADER_SIZE: usize = 16 + FINGERPRINT_LEN + 5 * 8 + 4 * 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: [u8; 16],
    pub fingerprint: Fingerprint,
    /// Intra-image relocations for each phase
    pub relocs: [Locator; 3],
    pub object_starts: Locator,
    /// Image-to-host relocations
    pub host_relocs: Locator,
    pub discardable_start: u32,
    pub cold_start: u32,
    pub hash_list_offset: u32,
    pub end_heap: u32,
}

impl ImageHeader {
    pub fn new(fingerprint: Fingerprint) -> Self {
        ImageHeader {
            magic: MAGIC,
            fingerprint,
            relocs: Default::default(),
            object_starts: Locator::default(),
            host_relocs: Locator::default(),
            discardable_start: 0,
            cold_start: 0,
            hash_list_offset: 0,
            end_heap: 0,
        }
    }

    pub fn relocs(&self, phase: Phase) -> Locator {
        self.relocs[phase as usize]
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&self.magic);
        put(self.fingerprint.as_bytes());
        let locators = self
            .relocs
            .iter()
            .chain([&self.object_starts, &self.host_relocs]);
        for loc in locators {
            put(&loc.offset.to_le_bytes());
            put(&loc.count.to_le_bytes());
        }
        put(&self.discardable_start.to_le_bytes());
        put(&self.cold_start.to_le_bytes());
        put(&self.hash_list_offset.to_le_bytes());
        put(&self.end_heap.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u32_at =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut magic = [0u8; 16];
        magic.copy_from_slice(&bytes[..16]);
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(&bytes[16..16 + FINGERPRINT_LEN]);

        let loc_base = 16 + FINGERPRINT_LEN;
        let loc = |i: usize| Locator::new(u32_at(loc_base + 8 * i), u32_at(loc_base + 8 * i + 4));
        let tail = loc_base + 5 * 8;

        ImageHeader {
            magic,
            fingerprint: Fingerprint::from_bytes(fp),
            relocs: [loc(0), loc(1), loc(2)],
            object_starts: loc(3),
            host_relocs: loc(4),
            discardable_start: u32_at(tail),
            cold_start: u32_at(tail + 4),
            hash_list_offset: u32_at(tail + 8),
            end_heap: u32_at(tail + 12),
        }
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "magic             : {}", String::from_utf8_lossy(&self.magic))?;
        writeln!(f, "fingerprint       : {}", self.fingerprint)?;
        for phase in Phase::ALL {
            let loc = self.relocs(phase);
            writeln!(
                f,
                "{:<18}: {:#010x} x {}",
                format!("{} relocs", phase.name()),
                loc.offset,
                loc.count
            )?;
        }
        writeln!(
            f,
            "object starts     : {:#010x} x {}",
            self.object_starts.offset, self.object_starts.count
        )?;
        writeln!(
            f,
            "host relocs       : {:#010x} x {}",
            self.host_relocs.offset, self.host_relocs.count
        )?;
        writeln!(f, "discardable start : {:#010x}", self.discardable_start)?;
        writeln!(f, "cold start        : {:#010x}", self.cold_start)?;
        writeln!(f, "hash list         : {:#010x}", self.hash_list_offset)?;
        write!(f, "end heap          : {:#010x}", self.end_heap)
    }
}
