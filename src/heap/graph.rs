//! Structural comparison of two heaps
//!
//! Two heaps are isomorphic when there is a bijection between their
//! objects that preserves kind, scalar contents and every reference,
//! starting from the same root slots. Builtins and subrs are matched by
//! identity since they live at fixed places in host storage.

use std::collections::HashMap;

use thiserror::Error;

use super::{
    Buffer, BuiltinId, Heap, LocalizedValue, Object, ObjectGraph, ObjectId, Symbol, SymbolValue,
    Value,
};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("heaps differ: {0}")]
pub struct Mismatch(pub String);

struct Matcher<'a> {
    left: &'a Heap,
    right: &'a Heap,
    forward: HashMap<ObjectId, ObjectId>,
    backward: HashMap<ObjectId, ObjectId>,
    pending: Vec<(ObjectId, ObjectId)>,
}

fn mismatch<T>(msg: String) -> Result<T, Mismatch> {
    Err(Mismatch(msg))
}

impl<'a> Matcher<'a> {
    fn values(&mut self, a: Value, b: Value) -> Result<(), Mismatch> {
        match (a, b) {
            (Value::Object(x), Value::Object(y)) => self.pair(x, y),
            (a, b) if a == b => Ok(()),
            (a, b) => mismatch(format!("{a:?} vs {b:?}")),
        }
    }

    fn slices(&mut self, a: &[Value], b: &[Value]) -> Result<(), Mismatch> {
        if a.len() != b.len() {
            return mismatch(format!("length {} vs {}", a.len(), b.len()));
        }
        for (x, y) in a.iter().zip(b) {
            self.values(*x, *y)?;
        }
        Ok(())
    }

    fn pair(&mut self, x: ObjectId, y: ObjectId) -> Result<(), Mismatch> {
        match (self.forward.get(&x), self.backward.get(&y)) {
            (Some(&fy), Some(&bx)) if fy == y && bx == x => Ok(()),
            (None, None) => {
                self.forward.insert(x, y);
                self.backward.insert(y, x);
                self.pending.push((x, y));
                Ok(())
            }
            _ => mismatch(format!("{x} and {y} are not paired consistently")),
        }
    }

    fn symbols(&mut self, a: &Symbol, b: &Symbol) -> Result<(), Mismatch> {
        if a.interned != b.interned {
            return mismatch("symbol interned flag".to_string());
        }
        self.values(a.name, b.name)?;
        self.values(a.function, b.function)?;
        self.values(a.plist, b.plist)?;
        match (&a.value, &b.value) {
            (SymbolValue::Plain(x), SymbolValue::Plain(y))
            | (SymbolValue::Alias(x), SymbolValue::Alias(y)) => self.values(*x, *y),
            (SymbolValue::Localized(x), SymbolValue::Localized(y)) => self.localized(x, y),
            (SymbolValue::Forwarded(x), SymbolValue::Forwarded(y)) if x == y => Ok(()),
            (x, y) => mismatch(format!("symbol value {x:?} vs {y:?}")),
        }
    }

    fn localized(&mut self, a: &LocalizedValue, b: &LocalizedValue) -> Result<(), Mismatch> {
        if a.local_if_set != b.local_if_set {
            return mismatch("localized local-if-set flag".to_string());
        }
        self.values(a.default, b.default)?;
        self.values(a.where_, b.where_)
    }

    fn buffers(&mut self, a: &Buffer, b: &Buffer) -> Result<(), Mismatch> {
        if a.text != b.text || a.point != b.point || a.multibyte != b.multibyte {
            return mismatch("buffer text".to_string());
        }
        if a.overlays != b.overlays {
            return mismatch("buffer overlays".to_string());
        }
        self.values(a.name, b.name)?;
        self.values(a.locals, b.locals)
    }

    fn objects(&mut self, x: ObjectId, y: ObjectId) -> Result<(), Mismatch> {
        let left = self.left;
        let right = self.right;
        let (a, b) = match (left.get(x), right.get(y)) {
            (Some(a), Some(b)) => (a, b),
            _ => return mismatch(format!("{x} or {y} missing")),
        };
        match (a, b) {
            (Object::Cons { car: a1, cdr: a2 }, Object::Cons { car: b1, cdr: b2 }) => {
                self.values(*a1, *b1)?;
                self.values(*a2, *b2)
            }
            (Object::Vector(a), Object::Vector(b)) | (Object::Record(a), Object::Record(b)) => {
                self.slices(a, b)
            }
            (
                Object::String {
                    bytes: a,
                    multibyte: am,
                },
                Object::String {
                    bytes: b,
                    multibyte: bm,
                },
            ) if a == b && am == bm => Ok(()),
            (Object::Symbol(a), Object::Symbol(b)) => self.symbols(a, b),
            (Object::Float(a), Object::Float(b)) if a.to_bits() == b.to_bits() => Ok(()),
            (
                Object::Bignum {
                    negative: an,
                    limbs: al,
                },
                Object::Bignum {
                    negative: bn,
                    limbs: bl,
                },
            ) if an == bn && al == bl => Ok(()),
            (Object::HashTable(a), Object::HashTable(b)) => {
                if a.test != b.test || a.weak != b.weak || a.len() != b.len() {
                    return mismatch("hash table shape".to_string());
                }
                for ((ak, av), (bk, bv)) in a.entries().iter().zip(b.entries()) {
                    self.values(*ak, *bk)?;
                    self.values(*av, *bv)?;
                }
                Ok(())
            }
            (Object::Buffer(a), Object::Buffer(b)) => self.buffers(a, b),
            (
                Object::BoolVector {
                    len: al,
                    bits: ab,
                },
                Object::BoolVector {
                    len: bl,
                    bits: bb,
                },
            ) if al == bl && ab == bb => Ok(()),
            (Object::CompiledUnit { file: a }, Object::CompiledUnit { file: b }) => {
                self.values(*a, *b)
            }
            (
                Object::NativeSubr { unit: au, name: an },
                Object::NativeSubr { unit: bu, name: bn },
            ) => {
                self.values(*au, *bu)?;
                self.values(*an, *bn)
            }
            (a, b) => mismatch(format!("{x} is {} but {y} is {}", a.describe(), b.describe())),
        }
    }

    fn drain(&mut self) -> Result<(), Mismatch> {
        while let Some((x, y)) = self.pending.pop() {
            self.objects(x, y)?;
        }
        Ok(())
    }
}

/// Check that everything reachable from the roots and builtins of
/// `left` is isomorphic to the same in `right`
pub fn check_isomorphic(left: &Heap, right: &Heap) -> Result<(), Mismatch> {
    if left.layout() != right.layout() {
        return mismatch("host layouts differ".to_string());
    }

    let mut m = Matcher {
        left,
        right,
        forward: HashMap::new(),
        backward: HashMap::new(),
        pending: vec![],
    };

    let mut lroots = left.roots();
    let mut rroots = right.roots();
    lroots.sort_by_key(|r| r.slot);
    rroots.sort_by_key(|r| r.slot);
    if lroots.len() != rroots.len() {
        return mismatch(format!("{} roots vs {}", lroots.len(), rroots.len()));
    }
    for (a, b) in lroots.iter().zip(&rroots) {
        if a.slot != b.slot {
            return mismatch(format!("root slot {} vs {}", a.slot, b.slot));
        }
        m.values(a.value, b.value)?;
        m.drain()?;
    }

    for i in 0..left.layout().builtin_names().len() as u32 {
        let id = BuiltinId(i);
        match (left.builtin(id), right.builtin(id)) {
            (Some(a), Some(b)) => m.symbols(a, b)?,
            _ => return mismatch(format!("builtin {i} missing")),
        }
        m.drain()?;
    }

    if left.scalars() != right.scalars() {
        return mismatch("scalar area".to_string());
    }

    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::heap::tests::layout;

    fn sample() -> Heap {
        let mut heap = Heap::new(layout());
        let a = heap.string("a");
        let cell = heap.cons(a, Value::NIL);
        // make it cyclic
        if let Value::Object(id) = cell {
            heap.replace(id, Object::Cons { car: a, cdr: cell });
        }
        heap.staticpro(0, cell).unwrap();
        heap
    }

    #[test]
    pub fn test_identical_heaps_match() {
        assert_eq!(check_isomorphic(&sample(), &sample()), Ok(()));
    }

    #[test]
    pub fn test_allocation_order_is_irrelevant() {
        let mut other = Heap::new(layout());
        let _padding = other.float(1.0);
        let cell = other.cons(Value::NIL, Value::NIL);
        let a = other.string("a");
        if let Value::Object(id) = cell {
            other.replace(id, Object::Cons { car: a, cdr: cell });
        }
        other.staticpro(0, cell).unwrap();
        assert_eq!(check_isomorphic(&sample(), &other), Ok(()));
    }

    #[test]
    pub fn test_sharing_is_significant() {
        let mut shared = Heap::new(layout());
        let s = shared.string("x");
        let v = shared.vector(vec![s, s]);
        shared.staticpro(0, v).unwrap();

        let mut split = Heap::new(layout());
        let s1 = split.string("x");
        let s2 = split.string("x");
        let v = split.vector(vec![s1, s2]);
        split.staticpro(0, v).unwrap();

        assert!(check_isomorphic(&shared, &split).is_err());
    }

    #[test]
    pub fn test_scalar_difference_detected() {
        let a = sample();
        let mut b = sample();
        b.set_scalar(0, &[1]).unwrap();
        assert!(check_isomorphic(&a, &b).is_err());
    }
}
