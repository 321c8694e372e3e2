//! Object kinds as recorded in record headers and the object-starts
//! table

use std::convert::TryFrom;
use std::fmt;

use super::word::Tag;

/// The closed set of object kinds an image can contain
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectKind {
    Cons = 1,
    Vector = 2,
    Record = 3,
    String = 4,
    Symbol = 5,
    Float = 6,
    Bignum = 7,
    HashTable = 8,
    Buffer = 9,
    BoolVector = 10,
    CompiledUnit = 11,
    NativeSubr = 12,
    /// Auxiliary value block of a buffer-local symbol
    LocalizedValue = 13,
    /// Host-resident builtin function (never in an image)
    Subr = 14,
}

impl ObjectKind {
    /// The tag carried by value words pointing at this kind
    pub fn tag(self) -> Tag {
        match self {
            ObjectKind::Cons => Tag::Cons,
            ObjectKind::String => Tag::String,
            ObjectKind::Symbol => Tag::Symbol,
            ObjectKind::Float => Tag::Float,
            _ => Tag::Vectorlike,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Cons => "cons",
            ObjectKind::Vector => "vector",
            ObjectKind::Record => "record",
            ObjectKind::String => "string",
            ObjectKind::Symbol => "symbol",
            ObjectKind::Float => "float",
            ObjectKind::Bignum => "bignum",
            ObjectKind::HashTable => "hash-table",
            ObjectKind::Buffer => "buffer",
            ObjectKind::BoolVector => "bool-vector",
            ObjectKind::CompiledUnit => "compiled-unit",
            ObjectKind::NativeSubr => "native-subr",
            ObjectKind::LocalizedValue => "localized-value",
            ObjectKind::Subr => "subr",
        }
    }
}

impl TryFrom<u8> for ObjectKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ObjectKind::*;
        Ok(match value {
            1 => Cons,
            2 => Vector,
            3 => Record,
            4 => String,
            5 => Symbol,
            6 => Float,
            7 => Bignum,
            8 => HashTable,
            9 => Buffer,
            10 => BoolVector,
            11 => CompiledUnit,
            12 => NativeSubr,
            13 => LocalizedValue,
            14 => Subr,
            n => return Err(n),
        })
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every record starts with a header word: kind in the low byte, a
/// kind-specific auxiliary value above it.
pub fn header_word(kind: ObjectKind, aux: u64) -> u64 {
    debug_assert!(aux < (1 << 56));
    kind as u64 | (aux << 8)
}

/// Split a header word into kind and auxiliary value
pub fn split_header(word: u64) -> Result<(ObjectKind, u64), u8> {
    let kind = ObjectKind::try_from((word & 0xff) as u8)?;
    Ok((kind, word >> 8))
}
