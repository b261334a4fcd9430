//! Trace optimization passes (spec §4.6's ordered pass list: "constant
//! folding, dead-code elimination, and redundant-guard elimination" run
//! over the recorded [`TraceIr`] before codegen).
//!
//! Grounded on `raya-engine/src/jit/pipeline/optimize.rs`'s pass-list
//! structure (a `Vec<Box<dyn JitPass>>` run in sequence over a function's
//! blocks), trimmed to the three passes this scoped IR can actually exploit
//! — there are no calls, no aliasing through objects, and exactly one loop
//! per trace, so passes like inlining or escape analysis have nothing to
//! do here.

use crate::jit::ir::{JitInstr, Reg, TraceIr};
use rustc_hash::{FxHashMap, FxHashSet};

/// Runs every pass in spec order. Each pass is independently useful on its
/// own trace (e.g. `fold_constants` alone shrinks a trace with a literal
/// loop bound), so callers that only want one pass can call it directly.
pub fn optimize(ir: &mut TraceIr) {
    fold_constants(ir);
    eliminate_redundant_guards(ir);
    eliminate_dead_code(ir);
}

/// Constant folding: `IAdd`/`ISub`/`IMul` (and their float counterparts)
/// over two registers that both trace back to a `Const` become a single
/// `Const`. Division and modulo are left alone even when both sides are
/// constant, since they still carry a `snapshot` guard against division by
/// zero that the rest of the pipeline expects every `IDiv`/`IMod` to have;
/// folding them away would have to either keep a dead guard around or drop
/// a case the deoptimizer relies on, for no real benefit (loop bounds are
/// almost never divisions in practice).
pub fn fold_constants(ir: &mut TraceIr) {
    for block in &mut ir.blocks {
        let mut consts: FxHashMap<Reg, crate::value::Value> = FxHashMap::default();
        let mut folded = Vec::with_capacity(block.instrs.len());
        for instr in block.instrs.drain(..) {
            let replacement = match &instr {
                JitInstr::Const { dest, value } => {
                    consts.insert(*dest, *value);
                    None
                }
                JitInstr::IAdd { dest, lhs, rhs, .. } => fold_int(&consts, *lhs, *rhs, *dest, i32::checked_add),
                JitInstr::ISub { dest, lhs, rhs, .. } => fold_int(&consts, *lhs, *rhs, *dest, i32::checked_sub),
                JitInstr::IMul { dest, lhs, rhs, .. } => fold_int(&consts, *lhs, *rhs, *dest, i32::checked_mul),
                JitInstr::INeg { dest, src } => consts.get(src).and_then(|v| v.as_int()).map(|n| {
                    let folded = JitInstr::Const { dest: *dest, value: crate::value::Value::int(-n) };
                    consts.insert(*dest, crate::value::Value::int(-n));
                    folded
                }),
                _ => None,
            };
            match replacement {
                Some(folded_instr) => folded.push(folded_instr),
                None => folded.push(instr),
            }
        }
        block.instrs = folded;
    }
}

fn fold_int(
    consts: &FxHashMap<Reg, crate::value::Value>,
    lhs: Reg,
    rhs: Reg,
    dest: Reg,
    op: fn(i32, i32) -> Option<i32>,
) -> Option<JitInstr> {
    let l = consts.get(&lhs)?;
    let r = consts.get(&rhs)?;
    let folded = op(l.as_int()?, r.as_int()?)?;
    Some(JitInstr::Const { dest, value: crate::value::Value::int(folded) })
}

/// Drops a `GuardInt`/`GuardFloat`/`GuardBool` when an earlier instruction
/// in the same block already guarded that exact register to the same
/// shape — e.g. `AddII`'s hand-proved-int path skips guards entirely, but a
/// register reused across two generic `Add`s in one block only needs the
/// first guard. Guards do not commute across a `StoreLocal` to a different
/// slot or across block boundaries, since the recorder never reintroduces a
/// register after storing through it, so this pass only needs a per-block
/// set reset at each block start (not block-boundary-crossing dataflow).
pub fn eliminate_redundant_guards(ir: &mut TraceIr) {
    for block in &mut ir.blocks {
        let mut guarded_int: FxHashSet<Reg> = FxHashSet::default();
        let mut guarded_float: FxHashSet<Reg> = FxHashSet::default();
        let mut guarded_bool: FxHashSet<Reg> = FxHashSet::default();
        block.instrs.retain(|instr| match instr {
            JitInstr::GuardInt { src, .. } => guarded_int.insert(*src),
            JitInstr::GuardFloat { src, .. } => guarded_float.insert(*src),
            JitInstr::GuardBool { src, .. } => guarded_bool.insert(*src),
            _ => true,
        });
    }
}

/// Dead-code elimination: drop any pure instruction (per
/// [`JitInstr::has_side_effects`]) whose `dest` is never read by a later
/// instruction, a block terminator's operands, or a later block's params
/// (loop-carried values flow through `Jump { args, .. }`, so a register
/// only dead-code-eliminated within one block but live across the
/// back-edge must not be dropped).
pub fn eliminate_dead_code(ir: &mut TraceIr) {
    let mut live: FxHashSet<Reg> = FxHashSet::default();
    for block in &ir.blocks {
        collect_terminator_uses(&block.terminator, &mut live);
    }
    // Fixed point: an instruction kept because its dest is live may itself
    // use registers that were not yet known live. Blocks are small and
    // traces are straight-line-plus-one-loop, so a few passes over the
    // whole trace converge quickly without needing a real worklist.
    loop {
        let before = live.len();
        for block in &ir.blocks {
            for instr in block.instrs.iter().rev() {
                let dest_live = instr.dest().map(|d| live.contains(&d)).unwrap_or(true);
                if instr.has_side_effects() || dest_live {
                    for used in instr.uses() {
                        live.insert(used);
                    }
                }
            }
        }
        if live.len() == before {
            break;
        }
    }

    for block in &mut ir.blocks {
        block.instrs.retain(|instr| {
            instr.has_side_effects() || instr.dest().map(|d| live.contains(&d)).unwrap_or(true)
        });
    }
}

fn collect_terminator_uses(term: &crate::jit::ir::JitTerminator, live: &mut FxHashSet<Reg>) {
    use crate::jit::ir::JitTerminator::*;
    match term {
        Jump { args, .. } => live.extend(args.iter().copied()),
        Branch { cond, then_args, else_args, .. } => {
            live.insert(*cond);
            live.extend(then_args.iter().copied());
            live.extend(else_args.iter().copied());
        }
        Exit { .. } | Unset => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{BlockId, JitType, SnapshotId};
    use crate::value::Value;

    #[test]
    fn folds_two_int_constants_through_add() {
        let mut ir = TraceIr::new(0);
        let b = ir.add_block();
        ir.entry = b;
        let a = ir.alloc_reg(JitType::Value);
        let c = ir.alloc_reg(JitType::Value);
        let dest = ir.alloc_reg(JitType::Value);
        ir.block_mut(b).instrs.push(JitInstr::Const { dest: a, value: Value::int(2) });
        ir.block_mut(b).instrs.push(JitInstr::Const { dest: c, value: Value::int(3) });
        ir.block_mut(b).instrs.push(JitInstr::IAdd { dest, lhs: a, rhs: c, snapshot: SnapshotId(0) });
        ir.add_snapshot(crate::jit::ir::Snapshot { resume_pc: 0, locals: vec![], stack: vec![] });
        fold_constants(&mut ir);
        let folded = ir.block(b).instrs.last().unwrap();
        match folded {
            JitInstr::Const { value, .. } => assert_eq!(value.as_int(), Some(5)),
            other => panic!("expected folded Const, got {other:?}"),
        }
    }

    #[test]
    fn dead_code_elimination_drops_unused_pure_instr() {
        let mut ir = TraceIr::new(0);
        let b = ir.add_block();
        ir.entry = b;
        let a = ir.alloc_reg(JitType::Value);
        let unused = ir.alloc_reg(JitType::I32);
        ir.block_mut(b).instrs.push(JitInstr::Const { dest: a, value: Value::int(1) });
        ir.block_mut(b).instrs.push(JitInstr::UnboxI32 { dest: unused, src: a });
        ir.block_mut(b).terminator = crate::jit::ir::JitTerminator::Jump { target: BlockId(0), args: vec![a] };
        eliminate_dead_code(&mut ir);
        assert!(ir.block(b).instrs.iter().all(|i| !matches!(i, JitInstr::UnboxI32 { .. })));
    }

    #[test]
    fn dead_code_elimination_keeps_guards_even_when_unused() {
        let mut ir = TraceIr::new(0);
        let b = ir.add_block();
        ir.entry = b;
        let a = ir.alloc_reg(JitType::Value);
        ir.block_mut(b).instrs.push(JitInstr::Const { dest: a, value: Value::int(1) });
        ir.add_snapshot(crate::jit::ir::Snapshot { resume_pc: 0, locals: vec![], stack: vec![] });
        ir.block_mut(b).instrs.push(JitInstr::GuardInt { src: a, snapshot: SnapshotId(0) });
        ir.block_mut(b).terminator = crate::jit::ir::JitTerminator::Exit { snapshot: SnapshotId(0) };
        eliminate_dead_code(&mut ir);
        assert!(ir.block(b).instrs.iter().any(|i| matches!(i, JitInstr::GuardInt { .. })));
    }
}
