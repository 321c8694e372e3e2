//! Per-kind field writers
//!
//! Each writer reserves an aligned record, copies scalar fields, and
//! for each reference either inlines a self-representing value, writes
//! a host offset, or leaves a placeholder with a fixup and queues the
//! referent.

use crate::heap::{
    BuiltinId, LocalizedValue, Object, ObjectGraph, ObjectId, Symbol, SymbolValue, Value,
};
use crate::image::header::Phase;
use crate::image::kind::ObjectKind;
use crate::image::layout::{
    bignum, bool_vector, buffer, compiled_unit, cons, float, hash_table, localized, native_subr,
    string, symbol, vector,
};
use crate::image::reloc::{Reloc, RelocKind};
use crate::image::word::{encode_constant, encode_fixnum, tagged, Tag};

use super::context::{DumpContext, Item, ItemState, SymbolRef};
use super::error::DumpError;
use super::fixup::{Fixup, FixupKind};
use super::scheduler::Weight;

/// Where an object ended up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Written(u32),
    /// Postponed to a deferred queue
    Deferred,
}

/// Error for an object shape that cannot go into an image
pub fn unsupported(object: &Object) -> DumpError {
    let kind = match object {
        Object::Frame { .. } => "frame",
        Object::Process { .. } => "process",
        o => o.kind().map(|k| k.name()).unwrap_or("object"),
    };
    DumpError::Unsupported {
        kind: kind.to_string(),
        description: object.describe(),
    }
}

/// Encoding of a self-representing value
pub fn immediate_word(value: Value) -> Result<u64, DumpError> {
    match value {
        Value::Fixnum(n) => encode_fixnum(n).ok_or(DumpError::FixnumOverflow(n)),
        Value::Constant(c) => Ok(encode_constant(c)),
        v => Err(DumpError::Internal(format!("{v:?} is not self-representing"))),
    }
}

fn redirect(value: &SymbolValue) -> u64 {
    match value {
        SymbolValue::Plain(_) => symbol::REDIRECT_PLAIN,
        SymbolValue::Alias(_) => symbol::REDIRECT_ALIAS,
        SymbolValue::Localized(_) => symbol::REDIRECT_LOCALIZED,
        SymbolValue::Forwarded(_) => symbol::REDIRECT_FORWARDED,
    }
}

impl<'g, G: ObjectGraph + ?Sized> DumpContext<'g, G> {
    fn check_payload(&self, kind: ObjectKind, len: usize) -> Result<(), DumpError> {
        if len > self.settings.max_payload || len > u32::MAX as usize {
            Err(DumpError::PayloadTooLarge {
                kind: kind.name().to_string(),
                len,
            })
        } else {
            Ok(())
        }
    }

    /// Write the value word at `at`
    pub(super) fn write_value(
        &mut self,
        at: usize,
        value: Value,
        weight: Weight,
    ) -> Result<(), DumpError> {
        let graph = self.graph;
        let layout = graph.layout();
        let word = match value {
            Value::Fixnum(_) | Value::Constant(_) => immediate_word(value)?,
            Value::Builtin(b) => {
                let word = tagged(layout.builtin_offset(b) as u64, Tag::Symbol);
                self.reloc(Phase::Early, at, |at| {
                    Reloc::tagged(at, RelocKind::HostValue, Tag::Symbol)
                })?;
                word
            }
            Value::Subr(s) => {
                let word = tagged(layout.subr_offset(s) as u64, Tag::Vectorlike);
                self.reloc(Phase::Early, at, |at| {
                    Reloc::tagged(at, RelocKind::HostValue, Tag::Vectorlike)
                })?;
                word
            }
            Value::Object(id) => {
                let tag = self.enqueue_object(id, at, weight)?;
                self.fixups.push(Fixup {
                    at,
                    target: Item::Object(id),
                    kind: FixupKind::Value(tag),
                });
                0
            }
        };
        self.enc.put_u64(at, word)
    }

    /// Write an object if it has not been written, returning where it
    /// went
    pub fn write_object(&mut self, id: ObjectId) -> Result<Placement, DumpError> {
        let graph = self.graph;
        let object = graph
            .object(id)
            .ok_or_else(|| DumpError::DanglingReference(id.to_string()))?;

        match self.state(Item::Object(id)) {
            Some(ItemState::Written(offset)) => return Ok(Placement::Written(offset)),
            Some(ItemState::Deferred) => {}
            _ => {
                if let Object::HashTable(_) = object {
                    self.states.insert(Item::Object(id), ItemState::Deferred);
                    self.deferred_hash_tables.push_back(id);
                    return Ok(Placement::Deferred);
                }
            }
        }

        let item = Item::Object(id);
        let base = match object {
            Object::Cons { car, cdr } => {
                let base = self.begin(item, ObjectKind::Cons, 0, cons::SIZE)?;
                self.write_value(base + cons::CAR, *car, Weight::Strong)?;
                self.write_value(base + cons::CDR, *cdr, Weight::Normal)?;
                base
            }
            Object::Vector(slots) | Object::Record(slots) => {
                let kind = if let Object::Vector(_) = object {
                    ObjectKind::Vector
                } else {
                    ObjectKind::Record
                };
                let size = slots
                    .len()
                    .checked_mul(8)
                    .map(|n| n + vector::SLOTS)
                    .unwrap_or(usize::MAX);
                let base = self.begin(item, kind, slots.len() as u64, size)?;
                for (i, v) in slots.iter().enumerate() {
                    self.write_value(base + vector::slot(i), *v, Weight::Normal)?;
                }
                base
            }
            Object::String { bytes, multibyte } => {
                self.check_payload(ObjectKind::String, bytes.len())?;
                let base = self.begin(item, ObjectKind::String, *multibyte as u64, string::SIZE)?;
                self.enc.put_u64(base + string::LEN, bytes.len() as u64)?;
                if !bytes.is_empty() {
                    self.cold_payload(id, base + string::DATA, FixupKind::RawPtr)?;
                }
                base
            }
            Object::Symbol(sym) => {
                let aux = symbol::aux(redirect(&sym.value), sym.interned);
                let base = self.begin(item, ObjectKind::Symbol, aux, symbol::SIZE)?;
                self.write_symbol_fields(base, SymbolRef::Object(id), sym)?;
                base
            }
            Object::Float(f) => {
                let base = self.begin(item, ObjectKind::Float, 0, float::SIZE)?;
                self.enc.put_u64(base + float::BITS, f.to_bits())?;
                base
            }
            Object::Bignum { negative, limbs } => {
                self.check_payload(ObjectKind::Bignum, limbs.len().saturating_mul(8))?;
                let base = self.begin(item, ObjectKind::Bignum, *negative as u64, bignum::SIZE)?;
                self.enc.put_u64(base + bignum::NLIMBS, limbs.len() as u64)?;
                if !limbs.is_empty() {
                    self.cold_payload(id, base + bignum::LIMB_OFFSET, FixupKind::Offset)?;
                    self.reloc(Phase::Early, base, |at| Reloc::new(at, RelocKind::Bignum))?;
                }
                base
            }
            Object::HashTable(table) => {
                let size = table
                    .len()
                    .checked_mul(16)
                    .map(|n| n + hash_table::PAIRS)
                    .unwrap_or(usize::MAX);
                let aux = hash_table::aux(table.test as u64, table.weak);
                let base = self.begin(item, ObjectKind::HashTable, aux, size)?;
                self.enc.put_u64(base + hash_table::COUNT, table.len() as u64)?;
                for (i, (k, v)) in table.entries().iter().enumerate() {
                    self.write_value(base + hash_table::key(i), *k, Weight::Normal)?;
                    self.write_value(base + hash_table::value(i), *v, Weight::Normal)?;
                }
                self.hash_tables.push(id);
                base
            }
            Object::Buffer(buf) => {
                if !buf.overlays.is_empty() {
                    return Err(DumpError::NotImplemented(format!(
                        "buffer with {} overlays",
                        buf.overlays.len()
                    )));
                }
                self.check_payload(ObjectKind::Buffer, buf.text.len())?;
                let base = self.begin(item, ObjectKind::Buffer, buf.multibyte as u64, buffer::SIZE)?;
                self.write_value(base + buffer::NAME, buf.name, Weight::Normal)?;
                if !buf.text.is_empty() {
                    self.cold_payload(id, base + buffer::TEXT, FixupKind::RawPtr)?;
                }
                self.enc
                    .put_u64(base + buffer::TEXT_LEN, buf.text.len() as u64)?;
                self.enc.put_u64(base + buffer::POINT, buf.point)?;
                self.write_value(base + buffer::LOCALS, buf.locals, Weight::Normal)?;
                base
            }
            Object::BoolVector { len, bits } => {
                self.check_payload(ObjectKind::BoolVector, bits.len())?;
                if bits.len() as u64 != len.div_ceil(8) {
                    return Err(DumpError::Unsupported {
                        kind: ObjectKind::BoolVector.name().to_string(),
                        description: format!("{} mask bytes for {len} bits", bits.len()),
                    });
                }
                let base = self.begin(item, ObjectKind::BoolVector, 0, bool_vector::SIZE)?;
                self.enc.put_u64(base + bool_vector::NBITS, *len)?;
                if !bits.is_empty() {
                    self.cold_payload(id, base + bool_vector::DATA, FixupKind::RawPtr)?;
                }
                base
            }
            Object::CompiledUnit { file } => {
                let base = self.begin(item, ObjectKind::CompiledUnit, 0, compiled_unit::SIZE)?;
                self.write_value(base + compiled_unit::FILE, *file, Weight::None)?;
                self.reloc(Phase::Native, base, |at| Reloc::new(at, RelocKind::NativeUnit))?;
                base
            }
            Object::NativeSubr { unit, name } => {
                let base = self.begin(item, ObjectKind::NativeSubr, 0, native_subr::SIZE)?;
                self.write_value(base + native_subr::UNIT, *unit, Weight::Normal)?;
                self.write_value(base + native_subr::NAME, *name, Weight::None)?;
                self.reloc(Phase::Late, base, |at| Reloc::new(at, RelocKind::NativeSubr))?;
                base
            }
            Object::Frame { .. } | Object::Process { .. } => return Err(unsupported(object)),
        };

        Ok(Placement::Written(base as u32))
    }

    fn symbol_of(&self, owner: SymbolRef) -> Result<&'g Symbol, DumpError> {
        let graph = self.graph;
        let found = match owner {
            SymbolRef::Object(id) => match graph.object(id) {
                Some(Object::Symbol(sym)) => Some(sym),
                _ => None,
            },
            SymbolRef::Builtin(id) => graph.builtin(id),
        };
        found.ok_or_else(|| DumpError::DanglingReference(format!("symbol {owner:?}")))
    }

    fn defer_symbol_aux(&mut self, owner: SymbolRef) {
        let item = Item::SymbolAux(owner);
        if !self.states.contains_key(&item) {
            self.states.insert(item, ItemState::Deferred);
            self.deferred_symbol_aux.push_back(owner);
        }
    }

    fn write_symbol_fields(
        &mut self,
        base: usize,
        owner: SymbolRef,
        sym: &Symbol,
    ) -> Result<(), DumpError> {
        self.write_value(base + symbol::NAME, sym.name, Weight::None)?;
        let at = base + symbol::VALUE;
        match &sym.value {
            SymbolValue::Plain(v) | SymbolValue::Alias(v) => {
                self.write_value(at, *v, Weight::Normal)?
            }
            SymbolValue::Localized(_) => {
                self.defer_symbol_aux(owner);
                self.fixups.push(Fixup {
                    at,
                    target: Item::SymbolAux(owner),
                    kind: FixupKind::RawPtr,
                });
            }
            SymbolValue::Forwarded(slot) => {
                let host_offset = self.graph.layout().static_offset(*slot);
                self.enc.put_u64(at, host_offset as u64)?;
                self.reloc(Phase::Early, at, |at| Reloc::new(at, RelocKind::HostPtr))?;
            }
        }
        self.write_value(base + symbol::FUNCTION, sym.function, Weight::Normal)?;
        self.write_value(base + symbol::PLIST, sym.plist, Weight::Normal)
    }

    /// Queue everything a symbol refers to without writing the symbol
    pub(super) fn scan_symbol(&mut self, owner: SymbolRef) -> Result<(), DumpError> {
        let sym = self.symbol_of(owner)?;
        let at = self.enc.position();
        let mut refs = vec![sym.name, sym.function, sym.plist];
        match &sym.value {
            SymbolValue::Plain(v) | SymbolValue::Alias(v) => refs.push(*v),
            SymbolValue::Localized(_) => self.defer_symbol_aux(owner),
            SymbolValue::Forwarded(_) => {}
        }
        for value in refs {
            if let Value::Object(id) = value {
                self.enqueue_object(id, at, Weight::None)?;
            }
        }
        Ok(())
    }

    /// Write the copy of a builtin symbol that will be copied back into
    /// the host at load
    pub(super) fn write_builtin_copy(&mut self, id: BuiltinId) -> Result<usize, DumpError> {
        let owner = SymbolRef::Builtin(id);
        let sym = self.symbol_of(owner)?;
        let aux = symbol::aux(redirect(&sym.value), sym.interned);
        let base = self.record(ObjectKind::Symbol, aux, symbol::SIZE)?;
        self.write_symbol_fields(base, owner, sym)?;
        Ok(base)
    }

    /// Write the localized value block of a symbol
    pub(super) fn write_symbol_aux(&mut self, owner: SymbolRef) -> Result<(), DumpError> {
        let sym = self.symbol_of(owner)?;
        let LocalizedValue {
            default,
            where_,
            local_if_set,
        } = match &sym.value {
            SymbolValue::Localized(lv) => lv,
            v => {
                return Err(DumpError::Internal(format!(
                    "symbol {owner:?} is not localized: {v:?}"
                )))
            }
        };
        let base = self.begin(
            Item::SymbolAux(owner),
            ObjectKind::LocalizedValue,
            0,
            localized::SIZE,
        )?;
        self.write_value(base + localized::DEFAULT, *default, Weight::Normal)?;
        self.write_value(base + localized::WHERE, *where_, Weight::Normal)?;
        self.enc
            .put_u64(base + localized::LOCAL_IF_SET, *local_if_set as u64)
    }

    /// Immutable payload bytes of an object bound for the cold section
    pub(super) fn cold_bytes(&self, id: ObjectId) -> Result<Vec<u8>, DumpError> {
        match self.graph.object(id) {
            Some(Object::String { bytes, .. }) => Ok(bytes.clone()),
            Some(Object::Bignum { limbs, .. }) => {
                Ok(limbs.iter().flat_map(|l| l.to_le_bytes()).collect())
            }
            Some(Object::Buffer(buf)) => Ok(buf.text.clone()),
            Some(Object::BoolVector { bits, .. }) => Ok(bits.clone()),
            Some(o) => Err(DumpError::Internal(format!(
                "{} has no cold payload",
                o.describe()
            ))),
            None => Err(DumpError::DanglingReference(id.to_string())),
        }
    }
}
