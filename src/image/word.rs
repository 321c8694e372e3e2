//! Tagged value words
//!
//! Every value slot in the image is a 64 bit word. The low three bits
//! carry a tag; pointers are always `DUMP_ALIGNMENT` aligned so the
//! tag bits are free. Fixnums and constants are self-representing:
//! their encoding is identical in every process and needs no
//! relocation.

use std::convert::TryFrom;
use std::fmt;

pub const TAG_BITS: u32 = 3;
pub const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Largest fixnum representable in a tagged word
pub const FIXNUM_MAX: i64 = i64::MAX >> TAG_BITS;
/// Smallest fixnum representable in a tagged word
pub const FIXNUM_MIN: i64 = i64::MIN >> TAG_BITS;

/// Low-bit tag of a value word
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Pointer to a headered record (vector, record, hash table ...)
    Vectorlike = 0,
    Fixnum = 1,
    Cons = 2,
    String = 3,
    Symbol = 4,
    Float = 5,
    /// Singleton constants (nil, t, unbound)
    Constant = 7,
}

impl Tag {
    pub fn of(word: u64) -> Option<Tag> {
        Tag::try_from((word & TAG_MASK) as u8).ok()
    }

    /// Whether words with this tag point at an object
    pub fn is_pointer(self) -> bool {
        !matches!(self, Tag::Fixnum | Tag::Constant)
    }
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tag::Vectorlike),
            1 => Ok(Tag::Fixnum),
            2 => Ok(Tag::Cons),
            3 => Ok(Tag::String),
            4 => Ok(Tag::Symbol),
            5 => Ok(Tag::Float),
            7 => Ok(Tag::Constant),
            n => Err(n),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Self-representing singletons
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Constant {
    Nil = 0,
    T = 1,
    Unbound = 2,
}

impl TryFrom<u64> for Constant {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Constant::Nil),
            1 => Ok(Constant::T),
            2 => Ok(Constant::Unbound),
            n => Err(n),
        }
    }
}

/// Encode a fixnum, or `None` if it does not fit in a tagged word
pub fn encode_fixnum(n: i64) -> Option<u64> {
    if (FIXNUM_MIN..=FIXNUM_MAX).contains(&n) {
        Some(((n << TAG_BITS) as u64) | Tag::Fixnum as u64)
    } else {
        None
    }
}

pub fn decode_fixnum(word: u64) -> i64 {
    (word as i64) >> TAG_BITS
}

pub fn encode_constant(c: Constant) -> u64 {
    ((c as u64) << TAG_BITS) | Tag::Constant as u64
}

/// Combine an aligned address or offset with a tag
pub fn tagged(address: u64, tag: Tag) -> u64 {
    debug_assert_eq!(address & TAG_MASK, 0);
    address | tag as u64
}

/// Strip the tag from a pointer word
pub fn untagged(word: u64) -> u64 {
    word & !TAG_MASK
}

pub const NIL: u64 = (Constant::Nil as u64) << TAG_BITS | Tag::Constant as u64;

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_fixnum_encoding() {
        for n in [0, 1, -1, 42, FIXNUM_MAX, FIXNUM_MIN] {
            let w = encode_fixnum(n).unwrap();
            assert_eq!(Tag::of(w), Some(Tag::Fixnum));
            assert_eq!(decode_fixnum(w), n);
        }
        assert_eq!(encode_fixnum(FIXNUM_MAX + 1), None);
        assert_eq!(encode_fixnum(i64::MIN), None);
    }

    #[test]
    pub fn test_constants() {
        assert_eq!(encode_constant(Constant::Nil), NIL);
        let t = encode_constant(Constant::T);
        assert_eq!(Tag::of(t), Some(Tag::Constant));
        assert_eq!(Constant::try_from(t >> TAG_BITS), Ok(Constant::T));
    }

    #[test]
    pub fn test_unused_tag_rejected() {
        assert_eq!(Tag::of(6), None);
        assert!(!Tag::Fixnum.is_pointer());
        assert!(Tag::Cons.is_pointer());
    }
}
