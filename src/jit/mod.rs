//! The JIT engine's top-level glue (spec §4.6/§4.7): tracks per-back-edge
//! hotness, drives the recorder/optimizer/codegen pipeline the first time a
//! back-edge goes hot, and remembers the compiled result so every later
//! crossing of that back-edge runs native code instead of the interpreter.
//!
//! Grounded on `raya-engine/src/jit/engine.rs`'s `JitEngine::on_loop_back_edge`
//! dispatch shape, trimmed to this crate's single-threaded interpreter: no
//! background compilation queue, no cross-thread handoff, just a direct
//! call from `vm::interpreter`'s `Loop` handler.

pub mod codegen;
pub mod deopt;
pub mod hotness;
pub mod ir;
pub mod optimize;
pub mod recorder;

use crate::bytecode::chunk::Chunk;
use crate::gc::collector::GarbageCollector;
use crate::object::{ObjKind, ObjRef};
use crate::value::Value;
use hotness::{BackEdgeKey, HotnessTable, TraceState};
use recorder::TraceObject;
use rustc_hash::FxHashMap;

/// What the interpreter's `Loop` handler should do after consulting the
/// engine.
pub enum BackEdgeOutcome {
    /// Nothing ran natively; resume interpreting at the bytecode-computed
    /// target as usual.
    Continue,
    /// A compiled trace ran and exited; resume interpreting at this PC
    /// (spec §4.7's deoptimizer contract already restored locals/stack).
    Resume(u32),
}

pub struct JitEngine {
    pub hotness: HotnessTable,
    traces: FxHashMap<BackEdgeKey, ObjRef>,
}

impl JitEngine {
    pub fn new() -> Self {
        JitEngine { hotness: HotnessTable::new(), traces: FxHashMap::default() }
    }

    pub fn with_threshold(threshold: u32) -> Self {
        JitEngine { hotness: HotnessTable::with_threshold(threshold), traces: FxHashMap::default() }
    }

    /// Called from the bytecode `Loop` handler every time a backward branch
    /// is taken, at the PC the branch jumps *to* (the loop header).
    ///
    /// `stack`/`base` are the interpreter's full value stack and the active
    /// frame's `base_ptr`; a compiled trace only ever touches
    /// `stack[base..]`, but deopt needs `base` to translate its local slot
    /// numbers (relative to the frame) into absolute stack indices.
    pub fn on_back_edge(
        &mut self,
        gc: &mut GarbageCollector,
        function: ObjRef,
        chunk: &Chunk,
        pc: u32,
        stack: &mut Vec<Value>,
        base: usize,
    ) -> BackEdgeOutcome {
        let key = BackEdgeKey { function, pc };
        match self.hotness.state(key) {
            TraceState::Blacklisted => BackEdgeOutcome::Continue,
            TraceState::Compiled => match self.traces.get(&key).copied() {
                Some(trace_ref) => self.run_compiled(trace_ref, stack, base),
                // Marked compiled but the trace object is gone: the GC
                // can't actually reach this state (traces are rooted via
                // `trace_roots`), but fail safe rather than panic.
                None => BackEdgeOutcome::Continue,
            },
            TraceState::Cold => {
                if self.hotness.record(key) {
                    self.try_record_and_compile(gc, function, chunk, pc, stack, base, key);
                }
                BackEdgeOutcome::Continue
            }
        }
    }

    fn try_record_and_compile(
        &mut self,
        gc: &mut GarbageCollector,
        function: ObjRef,
        chunk: &Chunk,
        pc: u32,
        stack: &[Value],
        base: usize,
        key: BackEdgeKey,
    ) {
        let locals_snapshot = &stack[base..];
        let ir = match recorder::record(chunk, pc, locals_snapshot) {
            Ok(ir) => ir,
            Err(_) => {
                self.hotness.mark_blacklisted(key);
                return;
            }
        };
        let mut ir = ir;
        optimize::optimize(&mut ir);
        let compiled = match codegen::compile(&ir) {
            Ok(compiled) => compiled,
            Err(_) => {
                self.hotness.mark_blacklisted(key);
                return;
            }
        };
        let trace_obj = TraceObject { function, entry_pc: pc, ir, compiled: Some(compiled) };
        let trace_ref = gc.allocate(ObjKind::Trace(trace_obj));
        self.traces.insert(key, trace_ref);
        self.hotness.mark_compiled(key);
    }

    fn run_compiled(&mut self, trace_ref: ObjRef, stack: &mut Vec<Value>, base: usize) -> BackEdgeOutcome {
        let entry_stack_len = stack.len();
        let trace_obj = match trace_ref.kind() {
            ObjKind::Trace(t) => t,
            // The slot in `self.traces` always points at a `Trace` object;
            // nothing else is ever inserted there.
            _ => return BackEdgeOutcome::Continue,
        };
        match &trace_obj.compiled {
            Some(compiled) => {
                let resume_pc = deopt::run_and_deopt(compiled, &trace_obj.ir, stack, base, entry_stack_len);
                BackEdgeOutcome::Resume(resume_pc)
            }
            None => BackEdgeOutcome::Continue,
        }
    }

    /// Every cached trace's `ObjRef`, for `Vm::maybe_collect` to root
    /// alongside the stack/globals/frames (see `gc::roots`'s module doc
    /// comment, which anticipates exactly this: "the JIT code cache's
    /// reference table").
    pub fn trace_roots(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.traces.values().copied()
    }
}

impl Default for JitEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RString;

    #[test]
    fn cold_back_edge_below_threshold_just_continues() {
        let mut gc = GarbageCollector::new();
        let function = gc.allocate(ObjKind::Str(RString::new("fn")));
        let chunk = Chunk::new();
        let mut engine = JitEngine::with_threshold(50);
        let mut stack = vec![Value::int(0)];
        let outcome = engine.on_back_edge(&mut gc, function, &chunk, 0, &mut stack, 0);
        assert!(matches!(outcome, BackEdgeOutcome::Continue));
        assert!(engine.trace_roots().next().is_none());
    }

    #[test]
    fn unrecordable_back_edge_blacklists_after_threshold() {
        let mut gc = GarbageCollector::new();
        let function = gc.allocate(ObjKind::Str(RString::new("fn")));
        // An empty chunk has no instruction at pc 0 to record from, so
        // `recorder::record` bails with `RanOffEndOfChunk`.
        let chunk = Chunk::new();
        let mut engine = JitEngine::with_threshold(1);
        let mut stack = vec![Value::int(0)];
        let key = BackEdgeKey { function, pc: 0 };
        let _ = engine.on_back_edge(&mut gc, function, &chunk, 0, &mut stack, 0);
        assert_eq!(engine.hotness.state(key), TraceState::Blacklisted);
    }
}
