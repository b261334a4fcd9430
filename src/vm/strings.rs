//! The weak interned-string table (spec §4.3 point 3, §8 property 7).
//!
//! Distinct from [`crate::interner::Interner`], which interns *source
//! identifiers* at compile time into cheap `Symbol` handles that never
//! touch the heap. This table interns *heap string objects* (`RString`)
//! so that "two string literals with equal content in the same VM
//! compare equal by pointer" holds for both compiled literals and
//! strings built at runtime by concatenation.
//!
//! It is deliberately not a GC root (see `crate::gc::roots`): an entry is
//! cleared via [`StringTable::clear_if_freed`], which the collector calls
//! for every object it is about to reclaim, while that object is still
//! valid to inspect.

use crate::gc::collector::GarbageCollector;
use crate::object::{ObjKind, ObjRef, RString};
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct StringTable {
    map: FxHashMap<Box<str>, ObjRef>,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable::default()
    }

    /// Returns the canonical heap string for `s`, allocating it on first
    /// sight. Every subsequent call with equal content returns the same
    /// `ObjRef`.
    pub fn intern(&mut self, gc: &mut GarbageCollector, s: &str) -> ObjRef {
        if let Some(&obj) = self.map.get(s) {
            return obj;
        }
        let obj = gc.allocate(ObjKind::Str(RString::new(s)));
        self.map.insert(s.into(), obj);
        obj
    }

    /// Called by the collector's sweep for every object about to be
    /// freed; removes the entry if `obj` is an interned string, so the
    /// table never holds a dangling pointer.
    pub fn clear_if_freed(&mut self, obj: ObjRef) {
        if let Some(s) = obj.as_string() {
            self.map.remove(s.as_str());
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_interns_to_the_same_object() {
        let mut gc = GarbageCollector::new();
        let mut table = StringTable::new();
        let a = table.intern(&mut gc, "hello");
        let b = table.intern(&mut gc, "hello");
        assert_eq!(a, b);
        assert_eq!(gc.heap().allocation_count(), 1);
    }

    #[test]
    fn clear_if_freed_drops_the_entry() {
        let mut gc = GarbageCollector::new();
        let mut table = StringTable::new();
        let a = table.intern(&mut gc, "gone");
        table.clear_if_freed(a);
        assert!(table.is_empty());
    }
}
