//! The runtime side of the boundary
//!
//! The image writer only needs to enumerate an object's outbound
//! references and know its kind. [`ObjectGraph`] is that interface;
//! [`Heap`] is a straightforward implementation used by the binary,
//! the tests and the materialiser, which rebuilds a `Heap` from a
//! loaded image.
pub mod graph;
pub mod host;
pub mod symbol;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::image::kind::ObjectKind;
pub use crate::image::word::Constant;

use self::host::HostLayout;
use self::symbol::Obarray;

/// Index of an object in the source heap
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Index of a builtin symbol in host static storage
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuiltinId(pub u32);

/// Index of a builtin function in host static storage
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubrId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// A value slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// Self-representing small integer
    Fixnum(i64),
    /// Self-representing singleton
    Constant(Constant),
    /// Heap object, written into the image
    Object(ObjectId),
    /// Builtin symbol living in host static storage
    Builtin(BuiltinId),
    /// Builtin function living in host static storage
    Subr(SubrId),
}

impl Value {
    pub const NIL: Value = Value::Constant(Constant::Nil);
    pub const T: Value = Value::Constant(Constant::T);
    pub const UNBOUND: Value = Value::Constant(Constant::Unbound);

    /// Whether the value is bit-identical in every process
    pub fn is_self_representing(&self) -> bool {
        matches!(self, Value::Fixnum(_) | Value::Constant(_))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NIL
    }
}

/// Equality test of a hash table
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashTest {
    Eq = 0,
    Eql = 1,
    Equal = 2,
}

impl HashTest {
    pub fn from_code(code: u64) -> Option<HashTest> {
        match code {
            0 => Some(HashTest::Eq),
            1 => Some(HashTest::Eql),
            2 => Some(HashTest::Equal),
            _ => None,
        }
    }
}

/// A hash table with insertion-ordered entries and a volatile lookup
/// index that is dropped when frozen and rebuilt on thaw
#[derive(Clone, Debug, PartialEq)]
pub struct HashTable {
    pub test: HashTest,
    pub weak: bool,
    entries: Vec<(Value, Value)>,
    index: HashMap<Value, usize>,
}

impl HashTable {
    pub fn new(test: HashTest, weak: bool) -> Self {
        HashTable {
            test,
            weak,
            entries: vec![],
            index: HashMap::new(),
        }
    }

    /// Build from entries in order, rebuilding the index
    pub fn from_entries(test: HashTest, weak: bool, entries: Vec<(Value, Value)>) -> Self {
        let mut table = HashTable::new(test, weak);
        for (k, v) in entries {
            table.insert(k, v);
        }
        table
    }

    /// Insert or replace by key identity
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a symbol's value lives
#[derive(Clone, Debug, PartialEq)]
pub enum SymbolValue {
    Plain(Value),
    /// Variable alias of another symbol
    Alias(Value),
    /// Buffer-local variable with an auxiliary value block
    Localized(LocalizedValue),
    /// Value held in a host static slot
    Forwarded(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalizedValue {
    pub default: Value,
    pub where_: Value,
    pub local_if_set: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: Value,
    pub value: SymbolValue,
    pub function: Value,
    pub plist: Value,
    pub interned: bool,
}

impl Symbol {
    pub fn new(name: Value) -> Self {
        Symbol {
            name,
            value: SymbolValue::Plain(Value::UNBOUND),
            function: Value::NIL,
            plist: Value::NIL,
            interned: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Buffer {
    pub name: Value,
    pub text: Vec<u8>,
    pub point: u64,
    pub multibyte: bool,
    pub locals: Value,
    /// (start, end) overlay ranges
    pub overlays: Vec<(u64, u64)>,
}

/// The closed set of heap object shapes
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Cons { car: Value, cdr: Value },
    Vector(Vec<Value>),
    Record(Vec<Value>),
    String { bytes: Vec<u8>, multibyte: bool },
    Symbol(Symbol),
    Float(f64),
    Bignum { negative: bool, limbs: Vec<u64> },
    HashTable(HashTable),
    Buffer(Buffer),
    BoolVector { len: u64, bits: Vec<u8> },
    /// A loadable unit of native code
    CompiledUnit { file: Value },
    /// A function compiled into a unit
    NativeSubr { unit: Value, name: Value },
    /// A frame with live window-system resources
    Frame { window_system: String },
    /// A live subprocess
    Process { pid: u32 },
}

impl Object {
    /// Image kind, or `None` for shapes that cannot be written
    pub fn kind(&self) -> Option<ObjectKind> {
        Some(match self {
            Object::Cons { .. } => ObjectKind::Cons,
            Object::Vector(_) => ObjectKind::Vector,
            Object::Record(_) => ObjectKind::Record,
            Object::String { .. } => ObjectKind::String,
            Object::Symbol(_) => ObjectKind::Symbol,
            Object::Float(_) => ObjectKind::Float,
            Object::Bignum { .. } => ObjectKind::Bignum,
            Object::HashTable(_) => ObjectKind::HashTable,
            Object::Buffer(_) => ObjectKind::Buffer,
            Object::BoolVector { .. } => ObjectKind::BoolVector,
            Object::CompiledUnit { .. } => ObjectKind::CompiledUnit,
            Object::NativeSubr { .. } => ObjectKind::NativeSubr,
            Object::Frame { .. } | Object::Process { .. } => return None,
        })
    }

    /// Short description for diagnostics
    pub fn describe(&self) -> String {
        match self {
            Object::String { bytes, .. } => {
                format!("string {:?}", String::from_utf8_lossy(&bytes[..bytes.len().min(32)]))
            }
            Object::Frame { window_system } => format!("frame on {window_system}"),
            Object::Process { pid } => format!("process {pid}"),
            o => o.kind().map(|k| k.name()).unwrap_or("object").to_string(),
        }
    }
}

/// A GC root: a static slot in host storage and the value it holds
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub slot: u32,
    pub value: Value,
}

/// What the image writer needs from the runtime
pub trait ObjectGraph {
    /// Layout of the host's static storage
    fn layout(&self) -> &HostLayout;

    fn object(&self, id: ObjectId) -> Option<&Object>;

    /// Contents of a builtin symbol
    fn builtin(&self, id: BuiltinId) -> Option<&Symbol>;

    /// The root set
    fn roots(&self) -> Vec<Root>;

    /// Current value of a static slot
    fn static_value(&self, slot: u32) -> Option<Value>;

    /// Current bytes of the host scalar area
    fn scalar(&self, offset: u32, len: u32) -> Option<&[u8]>;
}

/// Host storage written outside the layout
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("static slot {slot} out of range (layout has {limit})")]
    StaticSlot { slot: u32, limit: u32 },
    #[error("{len} scalar bytes at {offset} out of range (area is {limit})")]
    Scalar { offset: u32, len: usize, limit: u32 },
}

/// A simple arena heap of objects plus the contents of host static
/// storage
#[derive(Clone, Debug)]
pub struct Heap {
    layout: HostLayout,
    objects: Vec<Object>,
    builtins: Vec<Symbol>,
    statics: Vec<Value>,
    scalars: Vec<u8>,
    roots: Vec<u32>,
    obarray: Obarray,
}

impl Heap {
    /// A fresh heap for the host layout, with builtin symbols named
    pub fn new(layout: HostLayout) -> Self {
        let mut heap = Heap::empty(layout);
        let names = heap.layout.builtin_names().to_vec();
        for (i, name) in names.iter().enumerate() {
            let name = heap.string(name);
            let mut sym = Symbol::new(name);
            sym.interned = true;
            heap.builtins[i] = sym;
            heap.obarray.insert(&names[i], Value::Builtin(BuiltinId(i as u32)));
        }
        heap
    }

    /// A heap with no objects and blank builtin symbols
    pub fn empty(layout: HostLayout) -> Self {
        let builtins = vec![Symbol::new(Value::NIL); layout.builtin_names().len()];
        let statics = vec![Value::NIL; layout.static_slots() as usize];
        let scalars = vec![0; layout.scalar_bytes() as usize];
        Heap {
            layout,
            objects: vec![],
            builtins,
            statics,
            scalars,
            roots: vec![],
            obarray: Obarray::default(),
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0 as usize)
    }

    /// Overwrite an object in place
    pub fn replace(&mut self, id: ObjectId, object: Object) {
        self.objects[id.0 as usize] = object;
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn cons(&mut self, car: Value, cdr: Value) -> Value {
        Value::Object(self.alloc(Object::Cons { car, cdr }))
    }

    pub fn list(&mut self, items: &[Value]) -> Value {
        items
            .iter()
            .rev()
            .fold(Value::NIL, |tail, item| self.cons(*item, tail))
    }

    pub fn string(&mut self, s: &str) -> Value {
        Value::Object(self.alloc(Object::String {
            bytes: s.as_bytes().to_vec(),
            multibyte: !s.is_ascii(),
        }))
    }

    pub fn vector(&mut self, items: Vec<Value>) -> Value {
        Value::Object(self.alloc(Object::Vector(items)))
    }

    pub fn float(&mut self, f: f64) -> Value {
        Value::Object(self.alloc(Object::Float(f)))
    }

    pub fn bignum(&mut self, negative: bool, limbs: Vec<u64>) -> Value {
        Value::Object(self.alloc(Object::Bignum { negative, limbs }))
    }

    /// Intern a symbol, returning the builtin of that name if there is one
    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(v) = self.obarray.get(name) {
            return v;
        }
        let name_value = self.string(name);
        let mut sym = Symbol::new(name_value);
        sym.interned = true;
        let v = Value::Object(self.alloc(Object::Symbol(sym)));
        self.obarray.insert(name, v);
        v
    }

    /// Mutable access to a symbol, heap or builtin
    pub fn symbol_mut(&mut self, symbol: Value) -> Option<&mut Symbol> {
        match symbol {
            Value::Builtin(id) => self.builtins.get_mut(id.0 as usize),
            Value::Object(id) => match self.objects.get_mut(id.0 as usize) {
                Some(Object::Symbol(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn set_symbol_value(&mut self, symbol: Value, value: Value) {
        if let Some(s) = self.symbol_mut(symbol) {
            s.value = SymbolValue::Plain(value);
        }
    }

    pub fn builtin_mut(&mut self, id: BuiltinId) -> Option<&mut Symbol> {
        self.builtins.get_mut(id.0 as usize)
    }

    pub fn set_builtin(&mut self, id: BuiltinId, symbol: Symbol) {
        if let Some(builtin) = self.builtins.get_mut(id.0 as usize) {
            *builtin = symbol;
        }
    }

    /// Store a value in a static slot without making it a root
    pub fn set_static(&mut self, slot: u32, value: Value) -> Result<(), HeapError> {
        let limit = self.layout.static_slots();
        let cell = self
            .statics
            .get_mut(slot as usize)
            .ok_or(HeapError::StaticSlot { slot, limit })?;
        *cell = value;
        Ok(())
    }

    /// Store a value in a static slot and register the slot as a root
    pub fn staticpro(&mut self, slot: u32, value: Value) -> Result<(), HeapError> {
        self.set_static(slot, value)?;
        if !self.roots.contains(&slot) {
            self.roots.push(slot);
        }
        Ok(())
    }

    pub fn set_scalar(&mut self, offset: u32, bytes: &[u8]) -> Result<(), HeapError> {
        let start = offset as usize;
        let limit = self.layout.scalar_bytes();
        let area = start
            .checked_add(bytes.len())
            .and_then(|end| self.scalars.get_mut(start..end))
            .ok_or(HeapError::Scalar {
                offset,
                len: bytes.len(),
                limit,
            })?;
        area.copy_from_slice(bytes);
        Ok(())
    }

    pub fn scalars(&self) -> &[u8] {
        &self.scalars
    }

    pub fn root_slots(&self) -> &[u32] {
        &self.roots
    }

    pub fn obarray(&self) -> &Obarray {
        &self.obarray
    }

    pub fn obarray_mut(&mut self) -> &mut Obarray {
        &mut self.obarray
    }
}

impl ObjectGraph for Heap {
    fn layout(&self) -> &HostLayout {
        &self.layout
    }

    fn object(&self, id: ObjectId) -> Option<&Object> {
        self.get(id)
    }

    fn builtin(&self, id: BuiltinId) -> Option<&Symbol> {
        self.builtins.get(id.0 as usize)
    }

    fn roots(&self) -> Vec<Root> {
        self.roots
            .iter()
            .filter_map(|&slot| {
                self.statics
                    .get(slot as usize)
                    .map(|&value| Root { slot, value })
            })
            .collect()
    }

    fn static_value(&self, slot: u32) -> Option<Value> {
        self.statics.get(slot as usize).copied()
    }

    fn scalar(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        self.scalars.get(start..start.checked_add(len as usize)?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn layout() -> HostLayout {
        HostLayout::new(&["nil", "t", "car"], &["+", "car"], 8, 64)
    }

    #[test]
    pub fn test_intern_prefers_builtins() {
        let mut heap = Heap::new(layout());
        assert_eq!(heap.intern("car"), Value::Builtin(BuiltinId(2)));
        let foo = heap.intern("foo");
        assert_eq!(heap.intern("foo"), foo);
        assert!(matches!(foo, Value::Object(_)));
    }

    #[test]
    pub fn test_list_builds_conses() {
        let mut heap = Heap::new(layout());
        let before = heap.len();
        let list = heap.list(&[Value::Fixnum(1), Value::Fixnum(2)]);
        assert_eq!(heap.len(), before + 2);
        match list {
            Value::Object(id) => match heap.get(id) {
                Some(Object::Cons { car, .. }) => assert_eq!(*car, Value::Fixnum(1)),
                o => panic!("unexpected {o:?}"),
            },
            v => panic!("unexpected {v:?}"),
        }
    }

    #[test]
    pub fn test_hash_table_replaces_by_key() {
        let mut table = HashTable::new(HashTest::Eq, false);
        table.insert(Value::Fixnum(1), Value::T);
        table.insert(Value::Fixnum(2), Value::NIL);
        table.insert(Value::Fixnum(1), Value::Fixnum(9));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Value::Fixnum(1)), Some(Value::Fixnum(9)));
        assert_eq!(table.entries()[0].0, Value::Fixnum(1));
    }

    #[test]
    pub fn test_roots_report_current_values() {
        let mut heap = Heap::new(layout());
        let s = heap.string("root");
        heap.staticpro(3, s).unwrap();
        heap.staticpro(3, s).unwrap();
        assert_eq!(heap.roots(), vec![Root { slot: 3, value: s }]);
        assert_eq!(heap.scalar(60, 4), Some(&[0u8; 4][..]));
        assert_eq!(heap.scalar(62, 4), None);
    }

    #[test]
    pub fn test_host_storage_bounds_checked() {
        let mut heap = Heap::new(layout());
        assert_eq!(
            heap.staticpro(8, Value::T),
            Err(HeapError::StaticSlot { slot: 8, limit: 8 })
        );
        assert!(heap.root_slots().is_empty());
        assert!(heap.set_static(7, Value::T).is_ok());
        assert_eq!(
            heap.set_scalar(60, &[1; 8]),
            Err(HeapError::Scalar {
                offset: 60,
                len: 8,
                limit: 64
            })
        );
        assert!(heap.set_scalar(56, &[1; 8]).is_ok());
    }

    #[test]
    pub fn test_unwritable_shapes_have_no_kind() {
        assert_eq!(Object::Process { pid: 1 }.kind(), None);
        assert_eq!(Object::Float(1.0).kind(), Some(ObjectKind::Float));
    }
}
