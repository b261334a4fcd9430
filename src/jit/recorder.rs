//! Trace recording (spec §4.6): translates one hot loop body into
//! [`TraceIr`], bailing out rather than guessing whenever it meets bytecode
//! outside the numeric-loop subset `jit::ir` models. Grounded on
//! `raya-engine/src/jit/pipeline/lifter.rs`'s bytecode-to-IR walk, but
//! collapsed from that file's full opcode switch to the loop shape spec
//! §4.1 describes compiled loops as having: "`header: <condition> ;
//! branch-if-false -> after ; <body> ; back-branch -> header`" with no
//! nested control flow inside the trace region (a second conditional
//! branch before the back-edge bails the same way an unsupported opcode
//! does).
//!
//! Wrong type hints are safe, never incorrect: every arithmetic/comparison
//! operand gets a `Guard*` before it is unboxed, so a mispredicted type
//! just means the compiled trace immediately side-exits back to the
//! interpreter the first time it runs (spec §4.8's "semantics must be
//! indistinguishable from never having entered native code").

use crate::bytecode::chunk::Chunk;
use crate::bytecode::opcode::Opcode;
use crate::jit::ir::{BlockId, CmpOp, JitInstr, JitTerminator, JitType, Reg, Snapshot, TraceIr};
use crate::object::ObjRef;
use crate::value::Value;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailReason {
    UnsupportedOpcode(u8),
    SecondBranch,
    BackEdgeTargetMismatch,
    TraceTooLong,
    RanOffEndOfChunk,
}

const MAX_TRACE_INSTRUCTIONS: usize = 2000;

#[derive(Clone, Copy)]
enum Hint {
    Int,
    Float,
}

struct ShadowEntry {
    reg: Reg,
    ty: JitType,
    hint: Hint,
}

/// A heap-resident compiled trace (spec glossary: "Trace — entry bytecode
/// address, recorded IR, compiled code pointer, snapshot table"). Lives as
/// an [`crate::object::ObjKind::Trace`] so the GC and the version-bump
/// invalidation scheme (spec §4.5) both see it the same way they see every
/// other heap object.
pub struct TraceObject {
    pub function: ObjRef,
    pub entry_pc: u32,
    pub ir: TraceIr,
    pub compiled: Option<crate::jit::codegen::CompiledTrace>,
}

impl TraceObject {
    /// Roots this trace keeps alive for the collector (spec §4.3's
    /// `trace_children` match arm): the owning function, so a trace never
    /// outlives the bytecode it was recorded from.
    pub fn gc_roots(&self) -> Vec<ObjRef> {
        vec![self.function]
    }
}

/// Records the loop body starting at `entry_pc` in `chunk`, given a
/// snapshot of the frame's locals at the moment hotness crossed threshold
/// (used only to pick an initial int/float guard hint — see the module
/// doc comment on why a wrong hint is still safe).
pub fn record(chunk: &Chunk, entry_pc: u32, locals_snapshot: &[Value]) -> Result<TraceIr, BailReason> {
    let touched = prescan_touched_slots(chunk, entry_pc)?;

    let mut ir = TraceIr::new(entry_pc);
    let header = ir.add_block();
    let body = ir.add_block();
    ir.entry = header;

    let mut slot_reg: FxHashMap<u16, Reg> = FxHashMap::default();
    for &slot in &touched {
        let reg = ir.alloc_reg(JitType::Value);
        ir.block_mut(header).params.push((reg, JitType::Value));
        slot_reg.insert(slot, reg);
    }
    ir.entry_locals = touched.clone();

    let mut pc = entry_pc as usize;
    let mut stack: Vec<ShadowEntry> = Vec::new();
    let mut branched = false;
    let mut cur_block = header;

    loop {
        if ir.instr_count() > MAX_TRACE_INSTRUCTIONS {
            return Err(BailReason::TraceTooLong);
        }
        if pc >= chunk.len() {
            return Err(BailReason::RanOffEndOfChunk);
        }
        let op_byte = chunk.read_u8(pc);
        let op = Opcode::from_u8(op_byte).ok_or(BailReason::UnsupportedOpcode(op_byte))?;
        let instr_start = pc;
        pc += 1;

        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                stack.pop();
            }
            Opcode::Dup => {
                let top = stack.last().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                stack.push(ShadowEntry { reg: top.reg, ty: top.ty, hint: top.hint });
            }
            Opcode::ConstInt => {
                let v = chunk.read_i32(pc);
                pc += 4;
                let reg = ir.alloc_reg(JitType::Value);
                ir.block_mut(cur_block).instrs.push(JitInstr::Const { dest: reg, value: Value::int(v) });
                stack.push(ShadowEntry { reg, ty: JitType::Value, hint: Hint::Int });
            }
            Opcode::Const => {
                let idx = chunk.read_u16(pc) as usize;
                pc += 2;
                let v = chunk.constants[idx];
                let hint = if v.is_float() { Hint::Float } else { Hint::Int };
                let reg = ir.alloc_reg(JitType::Value);
                ir.block_mut(cur_block).instrs.push(JitInstr::Const { dest: reg, value: v });
                stack.push(ShadowEntry { reg, ty: JitType::Value, hint });
            }
            Opcode::LoadLocal => {
                let slot = chunk.read_u16(pc);
                pc += 2;
                let reg = *slot_reg.get(&slot).ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let hint = locals_snapshot
                    .get(slot as usize)
                    .filter(|v| v.is_float())
                    .map(|_| Hint::Float)
                    .unwrap_or(Hint::Int);
                stack.push(ShadowEntry { reg, ty: JitType::Value, hint });
            }
            Opcode::StoreLocal => {
                let slot = chunk.read_u16(pc);
                pc += 2;
                let top = stack.last().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let boxed = box_to_value(&mut ir, cur_block, top);
                ir.block_mut(cur_block).instrs.push(JitInstr::StoreLocal { slot, src: boxed });
                slot_reg.insert(slot, boxed);
                if let Some(e) = stack.last_mut() {
                    e.reg = boxed;
                    e.ty = JitType::Value;
                }
            }
            Opcode::AddII | Opcode::SubII | Opcode::MulII | Opcode::DivII | Opcode::ModII => {
                let pre_stack = boxed_stack(&mut ir, cur_block, &stack);
                let rhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let lhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let l = unbox_i32_unguarded(&mut ir, cur_block, &lhs);
                let r = unbox_i32_unguarded(&mut ir, cur_block, &rhs);
                let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                let dest = ir.alloc_reg(JitType::I32);
                let instr = match op {
                    Opcode::AddII => JitInstr::IAdd { dest, lhs: l, rhs: r, snapshot: snap },
                    Opcode::SubII => JitInstr::ISub { dest, lhs: l, rhs: r, snapshot: snap },
                    Opcode::MulII => JitInstr::IMul { dest, lhs: l, rhs: r, snapshot: snap },
                    Opcode::DivII => JitInstr::IDiv { dest, lhs: l, rhs: r, snapshot: snap },
                    _ => JitInstr::IMod { dest, lhs: l, rhs: r, snapshot: snap },
                };
                ir.block_mut(cur_block).instrs.push(instr);
                stack.push(ShadowEntry { reg: dest, ty: JitType::I32, hint: Hint::Int });
            }
            Opcode::NegI => {
                let v = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let src = unbox_i32_unguarded(&mut ir, cur_block, &v);
                let dest = ir.alloc_reg(JitType::I32);
                ir.block_mut(cur_block).instrs.push(JitInstr::INeg { dest, src });
                stack.push(ShadowEntry { reg: dest, ty: JitType::I32, hint: Hint::Int });
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let pre_stack = boxed_stack(&mut ir, cur_block, &stack);
                let rhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let lhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                let entry = emit_guarded_numeric_binop(&mut ir, cur_block, op, lhs, rhs, snap)?;
                stack.push(entry);
            }
            Opcode::Neg => {
                let pre_stack = boxed_stack(&mut ir, cur_block, &stack);
                let v = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                match v.hint {
                    Hint::Int => {
                        ir.block_mut(cur_block).instrs.push(JitInstr::GuardInt { src: v.reg, snapshot: snap });
                        let u = ir.alloc_reg(JitType::I32);
                        ir.block_mut(cur_block).instrs.push(JitInstr::UnboxI32 { dest: u, src: v.reg });
                        let dest = ir.alloc_reg(JitType::I32);
                        ir.block_mut(cur_block).instrs.push(JitInstr::INeg { dest, src: u });
                        stack.push(ShadowEntry { reg: dest, ty: JitType::I32, hint: Hint::Int });
                    }
                    Hint::Float => {
                        ir.block_mut(cur_block).instrs.push(JitInstr::GuardFloat { src: v.reg, snapshot: snap });
                        let u = ir.alloc_reg(JitType::F64);
                        ir.block_mut(cur_block).instrs.push(JitInstr::UnboxF64 { dest: u, src: v.reg });
                        let dest = ir.alloc_reg(JitType::F64);
                        ir.block_mut(cur_block).instrs.push(JitInstr::FNeg { dest, src: u });
                        stack.push(ShadowEntry { reg: dest, ty: JitType::F64, hint: Hint::Float });
                    }
                }
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                let pre_stack = boxed_stack(&mut ir, cur_block, &stack);
                let rhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let lhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                let cmp = match op {
                    Opcode::Eq => CmpOp::Eq,
                    Opcode::Ne => CmpOp::Ne,
                    Opcode::Lt => CmpOp::Lt,
                    Opcode::Gt => CmpOp::Gt,
                    Opcode::Le => CmpOp::Le,
                    _ => CmpOp::Ge,
                };
                let entry = emit_guarded_compare(&mut ir, cur_block, cmp, lhs, rhs, snap)?;
                stack.push(entry);
            }
            Opcode::JmpIfFalse | Opcode::JmpIfTrue | Opcode::JmpIfGe => {
                if branched {
                    return Err(BailReason::SecondBranch);
                }
                branched = true;
                let pre_stack = boxed_stack(&mut ir, cur_block, &stack);
                let delta = chunk.read_i32(pc);
                pc += 4;
                let target = (pc as i64 + delta as i64) as u32;

                let (cond_reg, exit_on_true) = match op {
                    Opcode::JmpIfFalse => {
                        let c = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                        let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                        let b = unbox_bool_guarded(&mut ir, cur_block, &c, snap);
                        (b, false)
                    }
                    Opcode::JmpIfTrue => {
                        let c = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                        let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                        let b = unbox_bool_guarded(&mut ir, cur_block, &c, snap);
                        (b, true)
                    }
                    _ => {
                        // JmpIfGe: pop b, pop a, branch (out of the loop) if a >= b.
                        let rhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                        let lhs = stack.pop().ok_or(BailReason::UnsupportedOpcode(op_byte))?;
                        let snap = snapshot_here(&mut ir, &slot_reg, &touched, pre_stack, instr_start as u32);
                        let entry = emit_guarded_compare(&mut ir, cur_block, CmpOp::Ge, lhs, rhs, snap)?;
                        (entry.reg, true)
                    }
                };

                // The condition's own operands are fully consumed by this
                // instruction in the interpreter too, so the stack at
                // `target` (the branch-taken exit) is just whatever is left
                // now, not the pre-instruction stack captured above.
                let post_stack = boxed_stack(&mut ir, cur_block, &stack);
                let exit_block = ir.add_block();
                let exit_snapshot = snapshot_here(&mut ir, &slot_reg, &touched, post_stack, target);
                ir.block_mut(exit_block).terminator = JitTerminator::Exit { snapshot: exit_snapshot };

                let body_args: Vec<Reg> = Vec::new(); // filled in once control reaches the back-edge below
                let (then_block, else_block) = if exit_on_true { (exit_block, body) } else { (body, exit_block) };
                ir.block_mut(cur_block).terminator = JitTerminator::Branch {
                    cond: cond_reg,
                    then_block,
                    then_args: body_args.clone(),
                    else_block,
                    else_args: body_args,
                };
                cur_block = body;
            }
            Opcode::Loop => {
                let delta = chunk.read_u32(pc);
                pc += 4;
                let target = pc as u32 - delta;
                if target != entry_pc {
                    return Err(BailReason::BackEdgeTargetMismatch);
                }
                let args: Vec<Reg> = touched.iter().map(|s| slot_reg[s]).collect();
                ir.block_mut(cur_block).terminator = JitTerminator::Jump { target: header, args };
                break;
            }
            _ => return Err(BailReason::UnsupportedOpcode(op_byte)),
        }
    }

    Ok(ir)
}

fn box_to_value(ir: &mut TraceIr, block: BlockId, entry: &ShadowEntry) -> Reg {
    match entry.ty {
        JitType::Value => entry.reg,
        JitType::I32 => {
            let dest = ir.alloc_reg(JitType::Value);
            ir.block_mut(block).instrs.push(JitInstr::BoxI32 { dest, src: entry.reg });
            dest
        }
        JitType::F64 => {
            let dest = ir.alloc_reg(JitType::Value);
            ir.block_mut(block).instrs.push(JitInstr::BoxF64 { dest, src: entry.reg });
            dest
        }
        JitType::Bool => {
            let dest = ir.alloc_reg(JitType::Value);
            ir.block_mut(block).instrs.push(JitInstr::BoxBool { dest, src: entry.reg });
            dest
        }
    }
}

fn unbox_i32_unguarded(ir: &mut TraceIr, block: BlockId, entry: &ShadowEntry) -> Reg {
    match entry.ty {
        JitType::I32 => entry.reg,
        _ => {
            let dest = ir.alloc_reg(JitType::I32);
            ir.block_mut(block).instrs.push(JitInstr::UnboxI32 { dest, src: entry.reg });
            dest
        }
    }
}

fn unbox_bool_guarded(ir: &mut TraceIr, block: BlockId, entry: &ShadowEntry, snapshot: crate::jit::ir::SnapshotId) -> Reg {
    match entry.ty {
        JitType::Bool => entry.reg,
        _ => {
            ir.block_mut(block).instrs.push(JitInstr::GuardBool { src: entry.reg, snapshot });
            let dest = ir.alloc_reg(JitType::Bool);
            ir.block_mut(block).instrs.push(JitInstr::UnboxBool { dest, src: entry.reg });
            dest
        }
    }
}

fn emit_guarded_numeric_binop(
    ir: &mut TraceIr,
    block: BlockId,
    op: Opcode,
    lhs: ShadowEntry,
    rhs: ShadowEntry,
    snapshot: crate::jit::ir::SnapshotId,
) -> Result<ShadowEntry, BailReason> {
    let use_float = matches!(lhs.hint, Hint::Float) || matches!(rhs.hint, Hint::Float);
    if use_float {
        ir.block_mut(block).instrs.push(JitInstr::GuardFloat { src: lhs.reg, snapshot });
        ir.block_mut(block).instrs.push(JitInstr::GuardFloat { src: rhs.reg, snapshot });
        let l = ir.alloc_reg(JitType::F64);
        ir.block_mut(block).instrs.push(JitInstr::UnboxF64 { dest: l, src: lhs.reg });
        let r = ir.alloc_reg(JitType::F64);
        ir.block_mut(block).instrs.push(JitInstr::UnboxF64 { dest: r, src: rhs.reg });
        let dest = ir.alloc_reg(JitType::F64);
        let instr = match op {
            Opcode::Add => JitInstr::FAdd { dest, lhs: l, rhs: r },
            Opcode::Sub => JitInstr::FSub { dest, lhs: l, rhs: r },
            Opcode::Mul => JitInstr::FMul { dest, lhs: l, rhs: r },
            Opcode::Div => JitInstr::FDiv { dest, lhs: l, rhs: r },
            Opcode::Mod => JitInstr::FMod { dest, lhs: l, rhs: r },
            _ => return Err(BailReason::UnsupportedOpcode(op as u8)),
        };
        ir.block_mut(block).instrs.push(instr);
        Ok(ShadowEntry { reg: dest, ty: JitType::F64, hint: Hint::Float })
    } else {
        ir.block_mut(block).instrs.push(JitInstr::GuardInt { src: lhs.reg, snapshot });
        ir.block_mut(block).instrs.push(JitInstr::GuardInt { src: rhs.reg, snapshot });
        let l = ir.alloc_reg(JitType::I32);
        ir.block_mut(block).instrs.push(JitInstr::UnboxI32 { dest: l, src: lhs.reg });
        let r = ir.alloc_reg(JitType::I32);
        ir.block_mut(block).instrs.push(JitInstr::UnboxI32 { dest: r, src: rhs.reg });
        let dest = ir.alloc_reg(JitType::I32);
        let instr = match op {
            Opcode::Add => JitInstr::IAdd { dest, lhs: l, rhs: r, snapshot },
            Opcode::Sub => JitInstr::ISub { dest, lhs: l, rhs: r, snapshot },
            Opcode::Mul => JitInstr::IMul { dest, lhs: l, rhs: r, snapshot },
            Opcode::Div => JitInstr::IDiv { dest, lhs: l, rhs: r, snapshot },
            Opcode::Mod => JitInstr::IMod { dest, lhs: l, rhs: r, snapshot },
            _ => return Err(BailReason::UnsupportedOpcode(op as u8)),
        };
        ir.block_mut(block).instrs.push(instr);
        Ok(ShadowEntry { reg: dest, ty: JitType::I32, hint: Hint::Int })
    }
}

fn emit_guarded_compare(
    ir: &mut TraceIr,
    block: BlockId,
    cmp: CmpOp,
    lhs: ShadowEntry,
    rhs: ShadowEntry,
    snapshot: crate::jit::ir::SnapshotId,
) -> Result<ShadowEntry, BailReason> {
    let use_float = matches!(lhs.hint, Hint::Float) || matches!(rhs.hint, Hint::Float);
    if use_float {
        ir.block_mut(block).instrs.push(JitInstr::GuardFloat { src: lhs.reg, snapshot });
        ir.block_mut(block).instrs.push(JitInstr::GuardFloat { src: rhs.reg, snapshot });
        let l = ir.alloc_reg(JitType::F64);
        ir.block_mut(block).instrs.push(JitInstr::UnboxF64 { dest: l, src: lhs.reg });
        let r = ir.alloc_reg(JitType::F64);
        ir.block_mut(block).instrs.push(JitInstr::UnboxF64 { dest: r, src: rhs.reg });
        let dest = ir.alloc_reg(JitType::Bool);
        ir.block_mut(block).instrs.push(JitInstr::FCmp { dest, op: cmp, lhs: l, rhs: r });
        Ok(ShadowEntry { reg: dest, ty: JitType::Bool, hint: Hint::Int })
    } else {
        ir.block_mut(block).instrs.push(JitInstr::GuardInt { src: lhs.reg, snapshot });
        ir.block_mut(block).instrs.push(JitInstr::GuardInt { src: rhs.reg, snapshot });
        let l = ir.alloc_reg(JitType::I32);
        ir.block_mut(block).instrs.push(JitInstr::UnboxI32 { dest: l, src: lhs.reg });
        let r = ir.alloc_reg(JitType::I32);
        ir.block_mut(block).instrs.push(JitInstr::UnboxI32 { dest: r, src: rhs.reg });
        let dest = ir.alloc_reg(JitType::Bool);
        ir.block_mut(block).instrs.push(JitInstr::ICmp { dest, op: cmp, lhs: l, rhs: r });
        Ok(ShadowEntry { reg: dest, ty: JitType::Bool, hint: Hint::Int })
    }
}

/// Boxes every entry currently on the recorder's shadow operand stack, in
/// bottom-to-top order, for embedding into a [`Snapshot`]. Must be called
/// *before* the instruction under consideration pops its operands, so the
/// result matches exactly what the interpreter's real stack holds at that
/// bytecode PC.
fn boxed_stack(ir: &mut TraceIr, block: BlockId, stack: &[ShadowEntry]) -> Vec<Reg> {
    stack.iter().map(|e| box_to_value(ir, block, e)).collect()
}

/// Builds a mid-trace guard snapshot out of the *current* `slot_reg`
/// mapping plus an already-boxed operand stack; every guard in this module
/// calls through here so a side exit always restores every loop-carried
/// local and every live operand, not just the ones the failing operation
/// touched. `stack` must have been captured (via [`boxed_stack`]) before the
/// instruction at `resume_pc` popped anything, or a guard firing mid-
/// expression would resume the interpreter with operands missing from its
/// stack.
fn snapshot_here(
    ir: &mut TraceIr,
    slot_reg: &FxHashMap<u16, Reg>,
    touched: &[u16],
    stack: Vec<Reg>,
    resume_pc: u32,
) -> crate::jit::ir::SnapshotId {
    let locals = touched.iter().map(|s| (*s, slot_reg[s])).collect();
    ir.add_snapshot(Snapshot { resume_pc, locals, stack })
}

fn prescan_touched_slots(chunk: &Chunk, entry_pc: u32) -> Result<Vec<u16>, BailReason> {
    let mut slots = Vec::new();
    let mut pc = entry_pc as usize;
    let mut steps = 0;
    loop {
        steps += 1;
        if steps > MAX_TRACE_INSTRUCTIONS {
            return Err(BailReason::TraceTooLong);
        }
        if pc >= chunk.len() {
            return Err(BailReason::RanOffEndOfChunk);
        }
        let op_byte = chunk.read_u8(pc);
        let op = Opcode::from_u8(op_byte).ok_or(BailReason::UnsupportedOpcode(op_byte))?;
        pc += 1;
        match op {
            Opcode::LoadLocal | Opcode::StoreLocal => {
                let slot = chunk.read_u16(pc);
                pc += 2;
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
            Opcode::ConstInt => pc += 4,
            Opcode::Const => pc += 2,
            Opcode::JmpIfFalse | Opcode::JmpIfTrue | Opcode::JmpIfGe => pc += 4,
            Opcode::Loop => {
                pc += 4;
                slots.sort_unstable();
                return Ok(slots);
            }
            Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Neg
            | Opcode::AddII
            | Opcode::SubII
            | Opcode::MulII
            | Opcode::DivII
            | Opcode::ModII
            | Opcode::NegI
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::Le
            | Opcode::Ge => {}
            other => return Err(BailReason::UnsupportedOpcode(other as u8)),
        }
    }
}

