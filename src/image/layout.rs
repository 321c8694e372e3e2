//! Byte offsets of fields within each record kind
//!
//! All records start with a header word (see
//! [`header_word`](super::kind::header_word)) and are
//! `DUMP_ALIGNMENT` aligned. Fields marked *value* hold tagged words,
//! fields marked *ptr* hold untagged addresses.

pub const HEADER: usize = 0;

pub mod cons {
    /// value
    pub const CAR: usize = 8;
    /// value
    pub const CDR: usize = 16;
    pub const SIZE: usize = 24;
}

pub mod float {
    pub const BITS: usize = 8;
    pub const SIZE: usize = 16;
}

/// Vectors and records: header aux holds the slot count
pub mod vector {
    pub const SLOTS: usize = 8;

    pub fn size(len: usize) -> usize {
        SLOTS + 8 * len
    }

    pub fn slot(index: usize) -> usize {
        SLOTS + 8 * index
    }
}

/// Strings: header aux is 1 for multibyte text
pub mod string {
    pub const LEN: usize = 8;
    /// ptr to cold bytes, null when empty
    pub const DATA: usize = 16;
    pub const SIZE: usize = 24;
}

/// Symbols: header aux holds the redirect in the low byte and the
/// interned flag in the next
pub mod symbol {
    /// value
    pub const NAME: usize = 8;
    /// value, or ptr for localized and forwarded symbols
    pub const VALUE: usize = 16;
    /// value
    pub const FUNCTION: usize = 24;
    /// value
    pub const PLIST: usize = 32;
    pub const SIZE: usize = 40;

    pub const REDIRECT_PLAIN: u64 = 0;
    pub const REDIRECT_ALIAS: u64 = 1;
    pub const REDIRECT_LOCALIZED: u64 = 2;
    pub const REDIRECT_FORWARDED: u64 = 3;

    pub fn aux(redirect: u64, interned: bool) -> u64 {
        redirect | ((interned as u64) << 8)
    }
}

/// Auxiliary block of a localized symbol
pub mod localized {
    /// value
    pub const DEFAULT: usize = 8;
    /// value
    pub const WHERE: usize = 16;
    pub const LOCAL_IF_SET: usize = 24;
    pub const SIZE: usize = 32;
}

/// Bignums: header aux is 1 when negative. Limbs live in the cold
/// section; `LIMB_OFFSET` is the image offset of the limbs and `LIMBS`
/// is reconstructed as an absolute pointer at load.
pub mod bignum {
    pub const NLIMBS: usize = 8;
    pub const LIMB_OFFSET: usize = 16;
    /// ptr, zero in the file
    pub const LIMBS: usize = 24;
    pub const SIZE: usize = 32;
}

pub mod bool_vector {
    pub const NBITS: usize = 8;
    /// ptr to cold bytes, null when empty
    pub const DATA: usize = 16;
    pub const SIZE: usize = 24;
}

/// Frozen hash tables: header aux holds the test in the low byte and
/// weakness in the next. Key/value pairs follow inline.
pub mod hash_table {
    pub const COUNT: usize = 8;
    /// volatile lookup index handle, zero while frozen
    pub const INDEX: usize = 16;
    pub const PAIRS: usize = 24;

    pub fn size(count: usize) -> usize {
        PAIRS + 16 * count
    }

    /// Record size for a count read back from an image
    pub fn checked_size(count: u64) -> Option<usize> {
        usize::try_from(count)
            .ok()?
            .checked_mul(16)?
            .checked_add(PAIRS)
    }

    pub fn key(index: usize) -> usize {
        PAIRS + 16 * index
    }

    pub fn value(index: usize) -> usize {
        PAIRS + 16 * index + 8
    }

    pub fn aux(test: u64, weak: bool) -> u64 {
        test | ((weak as u64) << 8)
    }
}

/// Buffers: header aux is 1 for multibyte text
pub mod buffer {
    /// value
    pub const NAME: usize = 8;
    /// ptr to cold bytes, null when empty
    pub const TEXT: usize = 16;
    pub const TEXT_LEN: usize = 24;
    pub const POINT: usize = 32;
    /// value
    pub const LOCALS: usize = 40;
    pub const SIZE: usize = 48;
}

pub mod compiled_unit {
    /// value
    pub const FILE: usize = 8;
    /// native handle, zero until the native-code phase
    pub const HANDLE: usize = 16;
    pub const SIZE: usize = 24;
}

pub mod native_subr {
    /// value
    pub const UNIT: usize = 8;
    /// value
    pub const NAME: usize = 16;
    /// entry point, zero until the late phase
    pub const ENTRY: usize = 24;
    pub const SIZE: usize = 32;
}

/// Host-resident builtin function record (host static storage only)
pub mod subr {
    pub const INDEX: usize = 8;
    pub const SIZE: usize = 16;
}
