//! The deoptimizer (spec §4.7: "on a guard failure the interpreter must
//! resume execution exactly as if the trace had never run — same locals,
//! same operand stack, same next instruction"). Grounded on the snapshot
//! contract `jit::ir::Snapshot` documents and the `jit::recorder`'s
//! guarantee that every snapshot's `stack` was captured *before* its
//! instruction popped anything, so replaying it here is a pure writeback,
//! never a re-derivation.

use crate::jit::codegen::{CompiledTrace, ExitCode, NORMAL_EXIT};
use crate::jit::ir::{Snapshot, TraceIr};
use crate::value::Value;

/// Runs a compiled trace starting from the interpreter's current frame,
/// writing the outcome back into `stack`/returning the bytecode PC
/// execution must resume at.
///
/// `base` is the active frame's `base_ptr` and `entry_stack_len` is
/// `stack.len()` at the moment the back-edge that triggered recording was
/// taken — by construction (see `jit::recorder`'s header-block param list)
/// that is exactly `stack.len()` every time this same back-edge is reached
/// again, since the recorder never lets anything but declared locals cross
/// the loop boundary live.
pub fn run_and_deopt(
    trace: &CompiledTrace,
    ir: &TraceIr,
    stack: &mut Vec<Value>,
    base: usize,
    entry_stack_len: usize,
) -> u32 {
    debug_assert_eq!(ir.entry_locals.len(), trace.param_count);
    let mut locals: Vec<i64> = ir.entry_locals.iter().map(|&slot| stack[base + slot as usize].raw_bits() as i64).collect();

    let widest_snapshot = ir.snapshots.iter().map(|s| s.locals.len() + s.stack.len()).max().unwrap_or(0);
    let mut scratch = vec![0i64; widest_snapshot];

    let code: ExitCode = unsafe { trace.call(&mut locals, &mut scratch) };
    if code == NORMAL_EXIT {
        // Malformed-trace fallback (see `jit::codegen`'s `JitTerminator::Unset`
        // handling) — resume at the trace's own entry as if it had never
        // run; nothing was written to the interpreter's stack.
        return ir.entry_pc;
    }
    let snapshot = &ir.snapshots[code as usize];
    apply_snapshot(snapshot, &scratch, stack, base, entry_stack_len)
}

/// Writes a snapshot's live values back into the interpreter's stack and
/// returns the bytecode PC to resume at. Split out from [`run_and_deopt`]
/// so a guard failure discovered by means other than a native call (there
/// are none yet, but the interpreter-side OSR glue in `jit::mod` composes
/// this the same way) can reuse the writeback logic.
pub fn apply_snapshot(
    snapshot: &Snapshot,
    scratch: &[i64],
    stack: &mut Vec<Value>,
    base: usize,
    entry_stack_len: usize,
) -> u32 {
    let mut offset = 0usize;
    for (slot, _) in &snapshot.locals {
        let v = Value::from_bits(scratch[offset] as u64);
        stack[base + *slot as usize] = v;
        offset += 1;
    }
    stack.truncate(entry_stack_len);
    for _ in &snapshot.stack {
        let v = Value::from_bits(scratch[offset] as u64);
        stack.push(v);
        offset += 1;
    }
    snapshot.resume_pc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::Snapshot;

    #[test]
    fn writes_locals_then_truncates_then_restores_stack() {
        let snapshot = Snapshot {
            resume_pc: 42,
            locals: vec![(0, crate::jit::ir::Reg(0)), (1, crate::jit::ir::Reg(1))],
            stack: vec![crate::jit::ir::Reg(2)],
        };
        let scratch = [Value::int(10).raw_bits() as i64, Value::int(20).raw_bits() as i64, Value::int(99).raw_bits() as i64];
        let mut stack = vec![Value::nil(), Value::nil(), Value::int(1), Value::int(2), Value::int(3)];
        let resume = apply_snapshot(&snapshot, &scratch, &mut stack, 0, 2);
        assert_eq!(resume, 42);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0].as_int(), Some(10));
        assert_eq!(stack[1].as_int(), Some(20));
        assert_eq!(stack[2].as_int(), Some(99));
    }
}
