//! Rebuilding frozen hash tables after load
//!
//! Hash tables are written as flat key/value sequences with their
//! lookup index zeroed. The thaw hook walks the image's hash list and
//! builds an index for each, storing a handle in the table record.

use std::collections::HashMap;

use log::debug;

use crate::heap::host::HostImage;
use crate::heap::HashTest;
use crate::image::kind::ObjectKind;
use crate::image::layout::{bignum, cons, float, hash_table, vector};
use crate::image::word::{untagged, Tag};

use super::error::LoadError;
use super::image::LoadedImage;
use super::relocate::string_bytes;

/// Depth to which `equal` keys follow structure
const EQUAL_DEPTH: usize = 16;

/// A key under one of the hash tests
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HashKey {
    /// Identity of the word
    Word(u64),
    Float(u64),
    Bignum(bool, Vec<u64>),
    Text(Vec<u8>),
    Seq(Vec<HashKey>),
}

pub type HashIndex = HashMap<HashKey, u64>;

fn eql_key(image: &LoadedImage, word: u64) -> Result<Option<HashKey>, LoadError> {
    let offset = match image.offset_of(untagged(word)) {
        Some(o) if Tag::of(word).map_or(false, |t| t.is_pointer()) => o,
        _ => return Ok(None),
    };
    let key = match image.record_header(offset)? {
        (ObjectKind::Float, _) => HashKey::Float(image.read_u64(offset + float::BITS)?),
        (ObjectKind::Bignum, negative) => {
            let n = image.read_u64(offset + bignum::NLIMBS)? as usize;
            let limbs = if n == 0 {
                vec![]
            } else {
                let at = image.read_u64(offset + bignum::LIMB_OFFSET)? as usize;
                image
                    .read_bytes(at, n * 8)?
                    .chunks_exact(8)
                    .map(|c| {
                        let mut limb = [0u8; 8];
                        limb.copy_from_slice(c);
                        u64::from_le_bytes(limb)
                    })
                    .collect()
            };
            HashKey::Bignum(negative & 1 == 1, limbs)
        }
        _ => return Ok(None),
    };
    Ok(Some(key))
}

fn equal_key(image: &LoadedImage, word: u64, depth: usize) -> Result<HashKey, LoadError> {
    if let Some(key) = eql_key(image, word)? {
        return Ok(key);
    }
    let offset = match image.offset_of(untagged(word)) {
        Some(o) if depth > 0 && Tag::of(word).map_or(false, |t| t.is_pointer()) => o,
        _ => return Ok(HashKey::Word(word)),
    };
    Ok(match image.record_header(offset)? {
        (ObjectKind::String, _) => HashKey::Text(string_bytes(image, word)?),
        (ObjectKind::Cons, _) => HashKey::Seq(vec![
            equal_key(image, image.read_u64(offset + cons::CAR)?, depth - 1)?,
            equal_key(image, image.read_u64(offset + cons::CDR)?, depth - 1)?,
        ]),
        (ObjectKind::Vector, len) => {
            let mut keys = vec![];
            for i in 0..len as usize {
                keys.push(equal_key(image, image.read_u64(offset + vector::slot(i))?, depth - 1)?);
            }
            HashKey::Seq(keys)
        }
        _ => HashKey::Word(word),
    })
}

/// Key for relocated value `word` under the test with code `test`
pub fn hash_key(image: &LoadedImage, test: u64, word: u64) -> Result<HashKey, LoadError> {
    match HashTest::from_code(test) {
        Some(HashTest::Eq) => Ok(HashKey::Word(word)),
        Some(HashTest::Eql) => Ok(eql_key(image, word)?.unwrap_or(HashKey::Word(word))),
        Some(HashTest::Equal) => equal_key(image, word, EQUAL_DEPTH),
        None => Err(LoadError::corrupt(format!("unknown hash test {test}"))),
    }
}

fn thaw_table(image: &mut LoadedImage, word: u64) -> Result<(), LoadError> {
    let offset = image
        .offset_of(untagged(word))
        .ok_or_else(|| LoadError::corrupt(format!("hash table {word:#x} outside image")))?;
    let (kind, aux) = image.record_header(offset)?;
    if kind != ObjectKind::HashTable {
        return Err(LoadError::corrupt(format!("hash list entry is a {kind}")));
    }
    let count = image.hash_table_count(offset)?;
    let mut index = HashIndex::with_capacity(count);
    for i in 0..count {
        let key = image.read_u64(offset + hash_table::key(i))?;
        let value = image.read_u64(offset + hash_table::value(i))?;
        index.insert(hash_key(image, aux & 0xff, key)?, value);
    }
    let handle = image.add_hash_index(index);
    image.write_u64(offset + hash_table::INDEX, handle)
}

/// Load hook rebuilding every frozen hash table in the image
pub fn thaw_hash_tables(
    image: Option<&mut LoadedImage>,
    _host: &mut HostImage,
) -> Result<(), LoadError> {
    let image = match image {
        Some(image) => image,
        None => return Ok(()),
    };
    let list = image.header().hash_list_offset as usize;
    if list == 0 {
        return Ok(());
    }
    let (kind, count) = image.record_header(list)?;
    if kind != ObjectKind::Vector {
        return Err(LoadError::corrupt(format!("hash list is a {kind}")));
    }
    for i in 0..count as usize {
        let table = image.read_u64(list + vector::slot(i))?;
        thaw_table(image, table)?;
    }
    debug!("thawed {count} hash tables");
    Ok(())
}
