//! A sample runtime heap that exercises every object kind
//!
//! The binary writes and loads images of this heap. Construction is
//! deterministic for a given scale so a loaded image can be verified
//! against a freshly built heap.

use crate::heap::host::{HostLayout, Remembered};
use crate::heap::{
    Buffer, BuiltinId, HashTable, HashTest, Heap, HeapError, LocalizedValue, Object, SubrId,
    SymbolValue, Value,
};
use crate::load::runtime::NativeLoader;

const BUILTINS: [&str; 10] = [
    "nil",
    "t",
    "quote",
    "lambda",
    "car",
    "cdr",
    "list",
    "runtime-version",
    "fill-column",
    "case-fold-search",
];

const SUBRS: [&str; 5] = ["car", "cdr", "cons", "+", "list"];

const STATIC_SLOTS: u32 = 16;
const SCALAR_BYTES: u32 = 256;

/// Root slot holding the vector of everything generated
pub const ROOT_EVERYTHING: u32 = 0;
/// Root slot holding the list of interned demo symbols
pub const ROOT_SYMBOLS: u32 = 1;
/// Static slot a builtin variable is forwarded to
pub const SLOT_FILL_COLUMN: u32 = 8;
/// Static slot holding a raw pointer to the scratch buffer
pub const SLOT_SCRATCH: u32 = 9;

pub fn demo_layout() -> HostLayout {
    HostLayout::new(&BUILTINS, &SUBRS, STATIC_SLOTS, SCALAR_BYTES)
}

/// Host locations the demo runtime carries across images
pub fn demo_remembered() -> Vec<Remembered> {
    vec![
        Remembered::Scalar { offset: 0, len: 8 },
        Remembered::Scalar {
            offset: 16,
            len: 64,
        },
        Remembered::RawPointer { slot: SLOT_SCRATCH },
    ]
}

fn builtin(name: &str) -> Value {
    BUILTINS
        .iter()
        .position(|b| *b == name)
        .map(|i| Value::Builtin(BuiltinId(i as u32)))
        .unwrap_or(Value::NIL)
}

fn bits_of(len: u64, seed: usize) -> Vec<u8> {
    let bytes = ((len + 7) / 8) as usize;
    let mut bits: Vec<u8> = (0..bytes).map(|i| (seed * 31 + i * 7) as u8).collect();
    if let Some(last) = bits.last_mut() {
        let spare = bytes as u64 * 8 - len;
        *last &= 0xff >> spare;
    }
    bits
}

/// Build the demo heap with `scale` generated records of each kind
pub fn demo_heap(scale: usize) -> Result<Heap, HeapError> {
    let mut heap = Heap::new(demo_layout());

    let version = heap.string("heapimage demo 1");
    heap.set_symbol_value(builtin("runtime-version"), version);
    if let Some(car) = heap.symbol_mut(builtin("car")) {
        car.function = Value::Subr(SubrId(0));
    }
    if let Some(fill) = heap.symbol_mut(builtin("fill-column")) {
        fill.value = SymbolValue::Forwarded(SLOT_FILL_COLUMN);
    }
    heap.staticpro(SLOT_FILL_COLUMN, Value::Fixnum(70))?;
    if let Some(case) = heap.symbol_mut(builtin("case-fold-search")) {
        case.value = SymbolValue::Localized(LocalizedValue {
            default: Value::T,
            where_: Value::NIL,
            local_if_set: true,
        });
    }

    let mut everything = vec![];
    let mut symbols = vec![];
    let mut eq = HashTable::new(HashTest::Eq, false);
    let mut eql = HashTable::new(HashTest::Eql, false);
    let mut equal = HashTable::new(HashTest::Equal, false);
    let mut weak = HashTable::new(HashTest::Eq, true);

    for i in 0..scale {
        let text = if i % 5 == 0 {
            format!("élément-{i}")
        } else {
            format!("item-{i}")
        };
        let s = heap.string(&text);
        let sym = heap.intern(&format!("demo-{i}"));
        heap.set_symbol_value(sym, s);
        if let Some(symbol) = heap.symbol_mut(sym) {
            symbol.function = Value::Subr(SubrId((i % SUBRS.len()) as u32));
        }
        symbols.push(sym);

        let f = heap.float(i as f64 * 0.5 + 0.25);
        let big = heap.bignum(i % 2 == 1, vec![i as u64, 0xdead_beef, 1]);
        let pair = heap.cons(s, f);
        let slots = vec![Value::Fixnum(i as i64), pair, big, sym, Value::Subr(SubrId(2))];
        let v = if i % 3 == 0 {
            Value::Object(heap.alloc(Object::Record(slots)))
        } else {
            heap.vector(slots)
        };

        eq.insert(sym, Value::Fixnum(i as i64));
        eql.insert(f, s);
        equal.insert(s, v);
        if i % 4 == 0 {
            weak.insert(v, Value::T);
        }
        everything.push(v);
    }

    let alias = heap.intern("demo-alias");
    if let Some(symbol) = heap.symbol_mut(alias) {
        symbol.value = SymbolValue::Alias(builtin("fill-column"));
    }
    symbols.push(alias);

    let local = heap.intern("demo-local");
    let scratch_name = heap.string("*scratch*");
    if let Some(symbol) = heap.symbol_mut(local) {
        symbol.value = SymbolValue::Localized(LocalizedValue {
            default: Value::Fixnum(0),
            where_: scratch_name,
            local_if_set: false,
        });
    }
    symbols.push(local);

    let binding = heap.cons(local, Value::Fixnum(42));
    let locals = heap.list(&[binding]);
    let scratch = Value::Object(heap.alloc(Object::Buffer(Buffer {
        name: scratch_name,
        text: ";; This buffer is for text that is not saved.\n".repeat(scale.max(1)).into_bytes(),
        point: 1,
        multibyte: false,
        locals,
        overlays: vec![],
    })));
    heap.set_static(SLOT_SCRATCH, scratch)?;
    everything.push(scratch);

    let nbits = 13 + scale as u64;
    let mask = heap.alloc(Object::BoolVector {
        len: nbits,
        bits: bits_of(nbits, scale),
    });
    everything.push(Value::Object(mask));

    let file = heap.string("demo-unit.so");
    let unit = Value::Object(heap.alloc(Object::CompiledUnit { file }));
    let fn_name = heap.string("demo_entry");
    let native = Value::Object(heap.alloc(Object::NativeSubr { unit, name: fn_name }));
    let native_sym = heap.intern("demo-native");
    if let Some(symbol) = heap.symbol_mut(native_sym) {
        symbol.function = native;
    }
    symbols.push(native_sym);

    for table in [eq, eql, equal, weak] {
        everything.push(Value::Object(heap.alloc(Object::HashTable(table))));
    }

    // a cycle: the last cons points back at the vector holding it
    let everything = heap.vector(everything);
    let cycle = heap.cons(everything, Value::NIL);
    if let Value::Object(id) = everything {
        if let Some(Object::Vector(items)) = heap.get_mut(id) {
            items.push(cycle);
        }
    }

    heap.staticpro(ROOT_EVERYTHING, everything)?;
    let symbols = heap.list(&symbols);
    heap.staticpro(ROOT_SYMBOLS, symbols)?;

    heap.set_scalar(0, &(scale as u64).to_le_bytes())?;
    let table: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
    heap.set_scalar(16, &table)?;

    Ok(heap)
}

/// Stands in for a dynamic loader: handles are derived from names
#[derive(Debug, Default)]
pub struct DemoNativeLoader {
    pub units: Vec<String>,
}

impl NativeLoader for DemoNativeLoader {
    fn load_unit(&mut self, file: &str) -> Result<u64, String> {
        self.units.push(file.to_string());
        Ok(0x10_0000 * self.units.len() as u64)
    }

    fn resolve(&mut self, unit: u64, name: &str) -> Result<u64, String> {
        if unit == 0 {
            return Err(format!("{name}: unit not loaded"));
        }
        Ok(unit + name.bytes().map(u64::from).sum::<u64>())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::heap::ObjectGraph;

    #[test]
    pub fn test_demo_heap_is_deterministic() {
        let a = demo_heap(4).unwrap();
        let b = demo_heap(4).unwrap();
        assert_eq!(a.len(), b.len());
        crate::heap::graph::check_isomorphic(&a, &b).unwrap();
    }

    #[test]
    pub fn test_demo_heap_covers_kinds() {
        let heap = demo_heap(3).unwrap();
        let mut kinds: Vec<_> = (0..heap.len() as u32)
            .filter_map(|i| heap.object(crate::heap::ObjectId(i)))
            .filter_map(|o| o.kind())
            .map(|k| k.name())
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), 12);
    }

    #[test]
    pub fn test_bits_are_masked() {
        assert_eq!(bits_of(13, 0).len(), 2);
        assert_eq!(bits_of(13, 1)[1] & 0xe0, 0);
        assert_eq!(bits_of(16, 3).len(), 2);
    }
}
