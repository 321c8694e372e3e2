//! Symbol interning
//!
//! The obarray maps each interned name to the single symbol value
//! carrying it, so that interning the same name twice yields the same
//! object. Builtin symbols are entered when the heap is created and
//! shadow any later heap symbol of the same name.

use std::collections::HashMap;

use super::Value;

#[derive(Clone, Debug, Default)]
pub struct Obarray {
    /// Name to symbol lookup
    to_symbol: HashMap<String, Value>,
    /// Names in order of interning
    names: Vec<String>,
}

impl Obarray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbol interned under `name`, if any
    pub fn get(&self, name: &str) -> Option<Value> {
        self.to_symbol.get(name).copied()
    }

    /// Record `symbol` as the interned symbol for `name`, keeping any
    /// existing entry
    pub fn insert(&mut self, name: &str, symbol: Value) -> Value {
        if let Some(&existing) = self.to_symbol.get(name) {
            return existing;
        }
        self.names.push(name.to_string());
        self.to_symbol.insert(name.to_string(), symbol);
        symbol
    }

    /// Interned names in order of interning
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{BuiltinId, ObjectId};

    #[test]
    fn insert_keeps_first_symbol() {
        let mut ob = Obarray::new();
        let first = Value::Builtin(BuiltinId(0));
        assert_eq!(ob.insert("foo", first), first);
        assert_eq!(ob.insert("foo", Value::Object(ObjectId(9))), first);
        assert_eq!(ob.len(), 1);
    }

    #[test]
    fn names_in_interning_order() {
        let mut ob = Obarray::new();
        ob.insert("b", Value::Object(ObjectId(1)));
        ob.insert("a", Value::Object(ObjectId(2)));
        assert_eq!(ob.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(ob.get("c"), None);
    }
}
