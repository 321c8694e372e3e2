//! Materialising a loaded image back into a `Heap`
//!
//! The reader follows relocated words from the root slots and the
//! builtin symbols in host storage, allocating one heap object per
//! image record it reaches. Addresses inside host storage decode to
//! builtin symbols and subrs.

use std::collections::HashMap;
use std::convert::TryFrom;

use crate::heap::host::HostImage;
use crate::heap::{
    Buffer, BuiltinId, Constant, HashTable, HashTest, Heap, LocalizedValue, Object, ObjectId,
    Symbol, SymbolValue, Value,
};
use crate::image::kind::{split_header, ObjectKind};
use crate::image::layout::{
    bignum, bool_vector, buffer, compiled_unit, cons, float, hash_table, localized, native_subr,
    string, symbol, vector,
};
use crate::image::word::{decode_fixnum, tagged, untagged, Tag, TAG_BITS};

use super::error::LoadError;
use super::image::LoadedImage;

struct Reader<'a> {
    image: &'a LoadedImage,
    host: &'a HostImage,
    heap: Heap,
    ids: HashMap<usize, ObjectId>,
    pending: Vec<(usize, ObjectId)>,
}

impl<'a> Reader<'a> {
    /// Word at an absolute address in the image or host storage
    fn word(&self, address: u64) -> Result<u64, LoadError> {
        if let Some(offset) = self.image.offset_of(address) {
            return self.image.read_u64(offset);
        }
        self.host
            .offset_of(address)
            .and_then(|offset| self.host.read_u64(offset))
            .ok_or_else(|| LoadError::corrupt(format!("address {address:#x} is nowhere")))
    }

    fn bytes(&self, address: u64, len: usize) -> Result<Vec<u8>, LoadError> {
        if len == 0 {
            return Ok(vec![]);
        }
        let offset = self
            .image
            .offset_of(address)
            .ok_or_else(|| LoadError::corrupt(format!("payload {address:#x} outside image")))?;
        Ok(self.image.read_bytes(offset, len)?.to_vec())
    }

    fn header(&self, address: u64) -> Result<(ObjectKind, u64), LoadError> {
        split_header(self.word(address)?)
            .map_err(|k| LoadError::corrupt(format!("bad kind {k} at {address:#x}")))
    }

    fn host_record(&self, address: u64) -> Result<Value, LoadError> {
        let layout = self.host.layout();
        let offset = self
            .host
            .offset_of(address)
            .ok_or_else(|| LoadError::corrupt(format!("address {address:#x} is nowhere")))?;
        if let Some(id) = layout.builtin_at(offset) {
            Ok(Value::Builtin(id))
        } else if let Some(id) = layout.subr_at(offset) {
            Ok(Value::Subr(id))
        } else {
            Err(LoadError::corrupt(format!(
                "host offset {offset:#x} is not a builtin"
            )))
        }
    }

    fn object_at(&mut self, offset: usize) -> ObjectId {
        if let Some(id) = self.ids.get(&offset) {
            return *id;
        }
        let id = self.heap.alloc(Object::Vector(vec![]));
        self.ids.insert(offset, id);
        self.pending.push((offset, id));
        id
    }

    /// Decode a relocated value word
    fn value(&mut self, word: u64) -> Result<Value, LoadError> {
        let tag = Tag::of(word).ok_or_else(|| LoadError::corrupt(format!("bad tag in {word:#x}")))?;
        match tag {
            Tag::Fixnum => Ok(Value::Fixnum(decode_fixnum(word))),
            Tag::Constant => Constant::try_from(word >> TAG_BITS)
                .map(Value::Constant)
                .map_err(|c| LoadError::corrupt(format!("unknown constant {c}"))),
            _ => {
                let address = untagged(word);
                match self.image.offset_of(address) {
                    Some(offset) => {
                        let (kind, _) = self.header(address)?;
                        if kind.tag() != tag {
                            return Err(LoadError::corrupt(format!(
                                "{kind} at {offset:#x} referenced with tag {tag}"
                            )));
                        }
                        Ok(Value::Object(self.object_at(offset)))
                    }
                    None => self.host_record(address),
                }
            }
        }
    }

    fn field(&mut self, base: u64, field: usize) -> Result<Value, LoadError> {
        let word = self.word(base + field as u64)?;
        self.value(word)
    }

    fn raw(&self, base: u64, field: usize) -> Result<u64, LoadError> {
        self.word(base + field as u64)
    }

    fn symbol(&mut self, base: u64, aux: u64) -> Result<Symbol, LoadError> {
        let name = self.field(base, symbol::NAME)?;
        let value = match aux & 0xff {
            symbol::REDIRECT_PLAIN => SymbolValue::Plain(self.field(base, symbol::VALUE)?),
            symbol::REDIRECT_ALIAS => SymbolValue::Alias(self.field(base, symbol::VALUE)?),
            symbol::REDIRECT_LOCALIZED => {
                let block = self.raw(base, symbol::VALUE)?;
                match self.header(block)? {
                    (ObjectKind::LocalizedValue, _) => {}
                    (kind, _) => {
                        return Err(LoadError::corrupt(format!(
                            "localized symbol points at a {kind}"
                        )))
                    }
                }
                SymbolValue::Localized(LocalizedValue {
                    default: self.field(block, localized::DEFAULT)?,
                    where_: self.field(block, localized::WHERE)?,
                    local_if_set: self.raw(block, localized::LOCAL_IF_SET)? != 0,
                })
            }
            symbol::REDIRECT_FORWARDED => {
                let target = self.raw(base, symbol::VALUE)?;
                let layout = self.host.layout();
                let slot = self
                    .host
                    .offset_of(target)
                    .and_then(|o| o.checked_sub(layout.statics_start()))
                    .map(|o| o / 8)
                    .filter(|slot| *slot < layout.static_slots())
                    .ok_or_else(|| {
                        LoadError::corrupt(format!("forwarded symbol points at {target:#x}"))
                    })?;
                SymbolValue::Forwarded(slot)
            }
            r => return Err(LoadError::corrupt(format!("unknown symbol redirect {r}"))),
        };
        Ok(Symbol {
            name,
            value,
            function: self.field(base, symbol::FUNCTION)?,
            plist: self.field(base, symbol::PLIST)?,
            interned: (aux >> 8) & 1 == 1,
        })
    }

    fn values(&mut self, base: u64, first: usize, count: usize) -> Result<Vec<Value>, LoadError> {
        (0..count)
            .map(|i| self.field(base, first + 8 * i))
            .collect()
    }

    fn object(&mut self, offset: usize) -> Result<Object, LoadError> {
        let base = self.image.address_of(offset);
        let (kind, aux) = self.header(base)?;
        Ok(match kind {
            ObjectKind::Cons => Object::Cons {
                car: self.field(base, cons::CAR)?,
                cdr: self.field(base, cons::CDR)?,
            },
            ObjectKind::Vector => Object::Vector(self.values(base, vector::SLOTS, aux as usize)?),
            ObjectKind::Record => Object::Record(self.values(base, vector::SLOTS, aux as usize)?),
            ObjectKind::String => {
                let len = self.raw(base, string::LEN)? as usize;
                let data = self.raw(base, string::DATA)?;
                Object::String {
                    bytes: self.bytes(data, len)?,
                    multibyte: aux & 1 == 1,
                }
            }
            ObjectKind::Symbol => Object::Symbol(self.symbol(base, aux)?),
            ObjectKind::Float => Object::Float(f64::from_bits(self.raw(base, float::BITS)?)),
            ObjectKind::Bignum => {
                let n = self.raw(base, bignum::NLIMBS)? as usize;
                let data = self.raw(base, bignum::LIMBS)?;
                let limbs = self
                    .bytes(data, n.saturating_mul(8))?
                    .chunks_exact(8)
                    .map(|c| {
                        let mut limb = [0u8; 8];
                        limb.copy_from_slice(c);
                        u64::from_le_bytes(limb)
                    })
                    .collect();
                Object::Bignum {
                    negative: aux & 1 == 1,
                    limbs,
                }
            }
            ObjectKind::HashTable => {
                let test = HashTest::from_code(aux & 0xff)
                    .ok_or_else(|| LoadError::corrupt(format!("unknown hash test {aux:#x}")))?;
                let count = self.image.hash_table_count(offset)?;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let k = self.field(base, hash_table::key(i))?;
                    let v = self.field(base, hash_table::value(i))?;
                    entries.push((k, v));
                }
                Object::HashTable(HashTable::from_entries(test, (aux >> 8) & 1 == 1, entries))
            }
            ObjectKind::Buffer => {
                let len = self.raw(base, buffer::TEXT_LEN)? as usize;
                let text = self.raw(base, buffer::TEXT)?;
                Object::Buffer(Buffer {
                    name: self.field(base, buffer::NAME)?,
                    text: self.bytes(text, len)?,
                    point: self.raw(base, buffer::POINT)?,
                    multibyte: aux & 1 == 1,
                    locals: self.field(base, buffer::LOCALS)?,
                    overlays: vec![],
                })
            }
            ObjectKind::BoolVector => {
                let len = self.raw(base, bool_vector::NBITS)?;
                let data = self.raw(base, bool_vector::DATA)?;
                Object::BoolVector {
                    len,
                    bits: self.bytes(data, len.div_ceil(8) as usize)?,
                }
            }
            ObjectKind::CompiledUnit => Object::CompiledUnit {
                file: self.field(base, compiled_unit::FILE)?,
            },
            ObjectKind::NativeSubr => Object::NativeSubr {
                unit: self.field(base, native_subr::UNIT)?,
                name: self.field(base, native_subr::NAME)?,
            },
            ObjectKind::LocalizedValue | ObjectKind::Subr => {
                return Err(LoadError::corrupt(format!(
                    "{kind} at {offset:#x} referenced as a value"
                )))
            }
        })
    }

    fn drain(&mut self) -> Result<(), LoadError> {
        while let Some((offset, id)) = self.pending.pop() {
            let object = self.object(offset)?;
            self.heap.replace(id, object);
        }
        Ok(())
    }

    /// Value of a static slot holding an untagged pointer
    fn raw_pointer(&mut self, address: u64) -> Result<Value, LoadError> {
        if address == 0 {
            return Ok(Value::NIL);
        }
        if self.image.contains(address) {
            let kind = self.image.find_object_kind(address).ok_or_else(|| {
                LoadError::corrupt(format!("raw pointer {address:#x} is not an object"))
            })?;
            self.value(tagged(address, kind.tag()))
        } else {
            self.host_record(address)
        }
    }
}

/// Rebuild a heap from a loaded image and the host storage it was
/// loaded into
///
/// `roots` are the static slots registered as roots and `raw_slots`
/// those remembered as raw pointers.
pub fn materialize(
    image: &LoadedImage,
    host: &HostImage,
    roots: &[u32],
    raw_slots: &[u32],
) -> Result<Heap, LoadError> {
    let layout = host.layout().clone();
    let mut reader = Reader {
        image,
        host,
        heap: Heap::empty(layout.clone()),
        ids: HashMap::new(),
        pending: vec![],
    };

    let slot_word = |slot: u32| {
        host.read_u64(layout.static_offset(slot))
            .ok_or_else(|| LoadError::corrupt(format!("static slot {slot} out of range")))
    };

    for &slot in roots {
        let value = reader.value(slot_word(slot)?)?;
        reader
            .heap
            .staticpro(slot, value)
            .map_err(|e| LoadError::corrupt(e.to_string()))?;
        reader.drain()?;
    }
    for &slot in raw_slots {
        let value = reader.raw_pointer(slot_word(slot)?)?;
        reader
            .heap
            .set_static(slot, value)
            .map_err(|e| LoadError::corrupt(e.to_string()))?;
        reader.drain()?;
    }

    for i in 0..layout.builtin_names().len() as u32 {
        let id = BuiltinId(i);
        let base = host.base() + layout.builtin_offset(id) as u64;
        let (kind, aux) = reader.header(base)?;
        if kind != ObjectKind::Symbol {
            return Err(LoadError::corrupt(format!("builtin {i} is a {kind}")));
        }
        let sym = reader.symbol(base, aux)?;
        reader.heap.set_builtin(id, sym);
        reader.drain()?;
    }

    let scalars = host
        .read_bytes(layout.scalars_start(), layout.scalar_bytes())
        .ok_or_else(|| LoadError::corrupt("scalar area out of range"))?
        .to_vec();
    let mut heap = reader.heap;
    heap.set_scalar(0, &scalars)
        .map_err(|e| LoadError::corrupt(e.to_string()))?;

    for (i, name) in layout.builtin_names().iter().enumerate() {
        heap.obarray_mut()
            .insert(name, Value::Builtin(BuiltinId(i as u32)));
    }
    let interned: Vec<(String, Value)> = (0..heap.len() as u32)
        .map(ObjectId)
        .filter_map(|id| match heap.get(id) {
            Some(Object::Symbol(sym)) if sym.interned => match sym.name {
                Value::Object(name) => match heap.get(name) {
                    Some(Object::String { bytes, .. }) => {
                        Some((String::from_utf8_lossy(bytes).into_owned(), Value::Object(id)))
                    }
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect();
    for (name, symbol) in interned {
        heap.obarray_mut().insert(&name, symbol);
    }

    Ok(heap)
}
