//! Root set construction for one collection pass.
//!
//! Grounded in `raya-core/src/gc/roots.rs`'s `RootSet`: rather than the
//! collector reaching into the VM's internals, the VM builds a flat list
//! of root [`Value`]s right before calling [`super::collector::GarbageCollector::collect`].
//! Spec §4.3 enumerates the roots: the value stack, every frame's locals
//! (a subrange of the same stack here), the open-upvalue chain, the
//! global table, the active trace recording, and the JIT code cache's
//! reference table. The interned-string table is deliberately *not* a
//! root: spec §4.3 point 3 defines it as a weak table so that an
//! otherwise-unreachable interned string can still be freed.

use crate::object::ObjRef;
use crate::value::Value;

#[derive(Default)]
pub struct RootSet {
    values: Vec<Value>,
}

impl RootSet {
    pub fn new() -> Self {
        RootSet::default()
    }

    pub fn add_stack_root(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn add_object_root(&mut self, obj: ObjRef) {
        self.values.push(Value::object(obj));
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
