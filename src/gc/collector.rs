//! Tri-color-style mark-and-sweep with a deferred sweep (spec §4.3).
//!
//! Marking is iterative over an explicit worklist rather than recursive,
//! so a deeply nested array or linked instance chain cannot blow the host
//! stack during collection. This is the part `raya-core/src/gc/collector.rs`
//! left as "a placeholder... For now"; the actual per-kind trace logic
//! below is this crate's own work, grounded in the object layouts
//! declared in `crate::object`.

use crate::gc::heap::Heap;
use crate::gc::roots::RootSet;
use crate::object::{ObjKind, ObjRef};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collections: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

pub struct GarbageCollector {
    heap: Heap,
    /// Bytes-allocated threshold that triggers the next collection.
    next_gc: usize,
    /// Growth factor applied to `next_gc` after each sweep (spec §4.3).
    growth_factor: f64,
    stats: GcStats,
    worklist: Vec<ObjRef>,
}

const MIN_NEXT_GC: usize = 1024 * 1024;

impl GarbageCollector {
    pub fn new() -> Self {
        GarbageCollector {
            heap: Heap::new(),
            next_gc: MIN_NEXT_GC,
            growth_factor: 2.0,
            stats: GcStats::default(),
            worklist: Vec::new(),
        }
    }

    pub fn set_growth_factor(&mut self, factor: f64) {
        if factor > 1.0 {
            self.growth_factor = factor;
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn should_collect(&self) -> bool {
        self.heap.bytes_allocated() > self.next_gc
    }

    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        self.heap.allocate(kind)
    }

    /// Run a full collection against the given root set. Called by the VM
    /// either when `should_collect()` trips, or (for testing the GC
    /// safety invariant) forced between every instruction.
    pub fn collect(&mut self, roots: &RootSet) {
        self.collect_with(roots, |_| {})
    }

    /// Collect, invoking `before_free` for every object about to be
    /// reclaimed while it is still valid. The VM uses this to clear the
    /// weak interned-string table entry for a string that did not
    /// survive (spec §4.3 point 3).
    pub fn collect_with(&mut self, roots: &RootSet, before_free: impl FnMut(ObjRef)) {
        self.mark(roots);
        let (freed, freed_bytes) = unsafe { self.sweep(before_free) };
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += freed_bytes;
        let live = self.heap.bytes_allocated();
        self.next_gc = ((live as f64) * self.growth_factor).max(MIN_NEXT_GC as f64) as usize;
    }

    fn mark(&mut self, roots: &RootSet) {
        for obj in self.heap.iter() {
            obj.header().marked.set(false);
        }
        self.worklist.clear();
        for value in roots.iter() {
            self.mark_value(value);
        }
        while let Some(obj) = self.worklist.pop() {
            self.trace_children(obj);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Some(obj) = value.as_object() {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.header().marked.replace(true) {
            return; // already marked, avoid re-queuing (and infinite loops on cycles)
        }
        self.worklist.push(obj);
    }

    fn trace_children(&mut self, obj: ObjRef) {
        match obj.kind() {
            ObjKind::Str(_) => {}
            ObjKind::Array(a) => {
                let elems: Vec<Value> = a.elements.clone();
                for v in elems {
                    self.mark_value(v);
                }
            }
            ObjKind::Dict(d) => {
                let entries: Vec<(Value, Value)> = d.iter().collect();
                for (k, v) in entries {
                    self.mark_value(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Function(func) => {
                for c in func.chunk.constants.iter() {
                    self.mark_value(*c);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                let ups = c.upvalues.clone();
                for u in ups {
                    self.mark_object(u);
                }
            }
            ObjKind::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state {
                    self.mark_value(v);
                }
            }
            ObjKind::Class(c) => {
                if let Some(sc) = c.superclass {
                    self.mark_object(sc);
                }
                let methods: Vec<ObjRef> = c.methods.values().map(|m| m.closure).collect();
                for m in methods {
                    self.mark_object(m);
                }
            }
            ObjKind::Instance(inst) => {
                self.mark_object(inst.class);
                let fields = inst.fields.clone();
                for f in fields {
                    self.mark_value(f);
                }
            }
            ObjKind::BoundMethod(bm) => {
                self.mark_value(bm.receiver);
                self.mark_object(bm.method);
            }
            #[cfg(feature = "jit")]
            ObjKind::Trace(t) => {
                for obj in t.gc_roots() {
                    self.mark_object(obj);
                }
            }
        }
    }

    /// # Safety
    /// No `ObjRef` obtained from this heap may be held across the call
    /// (the same requirement as `Heap::sweep`).
    unsafe fn sweep(&mut self, before_free: impl FnMut(ObjRef)) -> (usize, usize) {
        self.heap.sweep(|obj| obj.header().marked.get(), before_free)
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::roots::RootSet;
    use crate::object::{ObjKind, RArray, RString};

    #[test]
    fn unreachable_object_is_collected() {
        let mut gc = GarbageCollector::new();
        let s = gc.allocate(ObjKind::Str(RString::new("hello")));
        assert_eq!(gc.heap().allocation_count(), 1);
        let _ = s; // not rooted, so unreachable once GC runs

        let roots = RootSet::new();
        gc.collect(&roots);
        assert_eq!(gc.heap().allocation_count(), 0);
        assert_eq!(gc.stats().objects_freed, 1);
    }

    #[test]
    fn reachable_object_survives() {
        let mut gc = GarbageCollector::new();
        let s = gc.allocate(ObjKind::Str(RString::new("kept")));
        let mut roots = RootSet::new();
        roots.add_stack_root(Value::object(s));
        gc.collect(&roots);
        assert_eq!(gc.heap().allocation_count(), 1);
    }

    #[test]
    fn nested_array_keeps_children_alive() {
        let mut gc = GarbageCollector::new();
        let inner = gc.allocate(ObjKind::Str(RString::new("inner")));
        let outer = gc.allocate(ObjKind::Array(RArray::with_elements(vec![Value::object(inner)])));
        let mut roots = RootSet::new();
        roots.add_stack_root(Value::object(outer));
        gc.collect(&roots);
        assert_eq!(gc.heap().allocation_count(), 2);
    }

    #[test]
    fn cyclic_objects_do_not_hang_the_collector() {
        // Two instances pointing at each other's class forms a cycle
        // through the class table; marking must terminate.
        let mut gc = GarbageCollector::new();
        let cls = gc.allocate(ObjKind::Class(crate::object::RClass::new("C".into(), None)));
        let inst = gc.allocate(ObjKind::Instance(crate::object::RInstance {
            class: cls,
            fields: vec![],
            class_version_at_alloc: 0,
        }));
        let mut roots = RootSet::new();
        roots.add_stack_root(Value::object(inst));
        gc.collect(&roots);
        assert_eq!(gc.heap().allocation_count(), 2);
    }
}
