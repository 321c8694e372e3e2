//! The on-disk image format
//!
//! An image is a header followed by three sections laid out in file
//! order:
//!
//! ```text
//! +----------------------+ 0
//! | header               |
//! +----------------------+ HEADER_SIZE
//! | hot objects          |  needed for the life of the process
//! +----------------------+ discardable_start
//! | copied objects       |  dropped once copied back into the host
//! +----------------------+ cold_start (page aligned)
//! | cold payloads        |  immutable, never relocated internally
//! +----------------------+ end_heap
//! | relocation tables    |
//! +----------------------+ EOF
//! ```
//!
//! Everything is little-endian and only meaningful to the exact build
//! that wrote it (see [`fingerprint`]).
pub mod fingerprint;
pub mod header;
pub mod kind;
pub mod layout;
pub mod reloc;
pub mod word;

/// Alignment of every object in the image and granularity of the
/// mark bitset
pub const DUMP_ALIGNMENT: usize = 8;

/// Worst-case page size across supported platforms. Section boundaries
/// that are mapped separately are aligned to this.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Marker at the start of every complete image
pub const MAGIC: [u8; 16] = *b"HEAPIMAGE-RELOC1";

/// First magic byte while a write is still in progress
pub const INCOMPLETE_MAGIC_BYTE: u8 = b'!';

/// Bumped whenever object layouts or table encodings change
pub const FORMAT_VERSION: u32 = 1;

/// Round `value` up to a multiple of `alignment` (a power of two)
pub fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_round_up() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(65537, MAX_PAGE_SIZE), 2 * MAX_PAGE_SIZE);
    }

    #[test]
    pub fn test_incomplete_magic_differs() {
        assert_ne!(MAGIC[0], INCOMPLETE_MAGIC_BYTE);
    }
}
