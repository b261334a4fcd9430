//! Per-back-edge hotness counters (spec §4.6: "A per-back-edge counter
//! increments on every backward branch. Crossing a threshold (configurable,
//! default ~50) initiates recording at that PC.").
//!
//! Grounded on `raya-engine/src/jit/profiling/counters.rs`'s
//! `FunctionProfile`, but keyed by `(function, pc)` instead of by function
//! alone, and using a plain `u32` instead of an `AtomicU32`: that file's
//! atomics exist because Raya's engine is reachable from multiple worker
//! threads, while this VM's interpreter loop is single-threaded (spec §5
//! scopes concurrency out), so a `Cell`-free plain counter in a
//! `FxHashMap` is the whole story here.

use crate::object::ObjRef;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackEdgeKey {
    pub function: ObjRef,
    pub pc: u32,
}

/// Compilation state for one back-edge, mirroring
/// `FunctionProfile::{compiling, jit_available}`'s tri-state (cold /
/// compiling / available) without the atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Cold,
    Compiled,
    /// Recording or compilation was attempted and failed (an opcode the
    /// recorder does not model, or a Cranelift error); never retried, so a
    /// loop that can't be traced doesn't re-pay the recording cost every
    /// ~50 iterations forever.
    Blacklisted,
}

pub struct HotnessTable {
    pub threshold: u32,
    counters: FxHashMap<BackEdgeKey, u32>,
    state: FxHashMap<BackEdgeKey, TraceState>,
}

impl HotnessTable {
    pub const DEFAULT_THRESHOLD: u32 = 50;

    pub fn new() -> Self {
        HotnessTable { threshold: Self::DEFAULT_THRESHOLD, counters: FxHashMap::default(), state: FxHashMap::default() }
    }

    pub fn with_threshold(threshold: u32) -> Self {
        HotnessTable { threshold: threshold.max(1), ..Self::new() }
    }

    pub fn state(&self, key: BackEdgeKey) -> TraceState {
        self.state.get(&key).copied().unwrap_or(TraceState::Cold)
    }

    pub fn mark_compiled(&mut self, key: BackEdgeKey) {
        self.state.insert(key, TraceState::Compiled);
    }

    pub fn mark_blacklisted(&mut self, key: BackEdgeKey) {
        self.state.insert(key, TraceState::Blacklisted);
    }

    /// Records one execution of this back-edge, returning `true` exactly
    /// once the count reaches `threshold` while still `Cold` (the signal to
    /// start recording). Already-compiled or blacklisted back-edges are
    /// not counted further — there is nothing more for the counter to do.
    pub fn record(&mut self, key: BackEdgeKey) -> bool {
        if self.state(key) != TraceState::Cold {
            return false;
        }
        let count = self.counters.entry(key).or_insert(0);
        *count += 1;
        *count == self.threshold
    }
}

impl Default for HotnessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::collector::GarbageCollector;
    use crate::object::{ObjKind, RString};

    fn dummy_objref(gc: &mut GarbageCollector) -> ObjRef {
        gc.allocate(ObjKind::Str(RString::new("fn")))
    }

    #[test]
    fn fires_exactly_at_threshold() {
        let mut gc = GarbageCollector::new();
        let f = dummy_objref(&mut gc);
        let key = BackEdgeKey { function: f, pc: 10 };
        let mut table = HotnessTable::with_threshold(3);
        assert!(!table.record(key));
        assert!(!table.record(key));
        assert!(table.record(key));
        // Further calls on a still-cold key keep returning false (not re-firing).
        assert!(!table.record(key));
    }

    #[test]
    fn compiled_back_edges_stop_counting() {
        let mut gc = GarbageCollector::new();
        let f = dummy_objref(&mut gc);
        let key = BackEdgeKey { function: f, pc: 0 };
        let mut table = HotnessTable::with_threshold(2);
        table.mark_compiled(key);
        assert!(!table.record(key));
        assert!(!table.record(key));
    }
}
