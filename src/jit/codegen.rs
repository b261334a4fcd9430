//! Lowers a recorded, optimized [`TraceIr`] to native x86-64 via Cranelift
//! (spec §4.7: "the code generator ... emits machine code that mirrors the
//! IR almost one-to-one, with every guard compiling to a compare-and-branch
//! to a per-guard exit stub").
//!
//! The box/unbox constant layout is grounded on
//! `raya-engine/src/jit/backend/cranelift/abi.rs`, adapted to this crate's
//! own NaN-boxing layout from `crate::value` (`TAG_SHIFT = 32`, not that
//! file's `48` — the two crates box values differently, so only the
//! *technique* carries over, not the literal constants). The backend setup
//! (`settings::builder()` with `opt_level=speed`/`is_pic=true`,
//! `cranelift_native::builder()`) is grounded on
//! `raya-engine/src/jit/backend/cranelift/mod.rs`'s `CraneliftBackend::host`.
//! That file's own `finalize` is an acknowledged stub ("Use JitEngine for
//! executable code ... not yet implemented"), so the executable-memory
//! management here instead follows `cranelift-jit`'s own `JITModule`/
//! `JITBuilder` API directly — the standard way the Cranelift ecosystem
//! turns a compiled `Context` into a callable function pointer.
//!
//! Traces carry loop-header values as Cranelift block parameters rather
//! than through `Variable`/`def_var`/`use_var` (see `jit::ir`'s module doc
//! comment): every `Reg` in this IR is already in SSA form with exactly one
//! defining instruction, so it lowers directly to a Cranelift `ir::Value`
//! with no `Variable` indirection at all.

use crate::jit::ir::{CmpOp, JitInstr, JitTerminator, JitType, Reg, TraceIr};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::value::{BOX_BASE, PAYLOAD_MASK_32, TAG_BOOL, TAG_INT};

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("cranelift backend error: {0}")]
    Backend(String),
}

/// The exit reason a compiled trace's native entry point leaves in its
/// return slot: either a specific guard's snapshot, or the sentinel
/// `NORMAL_EXIT` meaning the loop's own condition went false and the
/// trace's own exit snapshot (always the last one recorded) applies.
pub type ExitCode = u32;

/// A successfully compiled trace: the JIT module that owns the trace's
/// executable memory (kept alive for as long as this lives — dropping it
/// unmaps the code) and a raw function pointer into it.
///
/// The native entry point's calling convention is `extern "C" fn(*mut i64,
/// *mut i64) -> u32`: the first pointer is the boxed-`Value` array for the
/// trace's loop-carried locals (in the same order `TraceIr`'s entry block
/// declared its params — see `jit::recorder::prescan_touched_slots`), the
/// second is scratch space the generated code uses to write back every
/// live register in the snapshot that was hit (locals first, then operand
/// stack, in `Snapshot` order) before returning that snapshot's index as
/// the `u32` result — every exit, including the loop condition going
/// false, resolves to a real recorded [`crate::jit::ir::Snapshot`], so
/// [`NORMAL_EXIT`] only ever comes back out of the malformed-trace
/// fallback in [`JitTerminator::Unset`](crate::jit::ir::JitTerminator::Unset), which a well-formed trace never reaches.
pub struct CompiledTrace {
    #[allow(dead_code)]
    module: JITModule,
    entry: *const u8,
    pub param_count: usize,
}

pub const NORMAL_EXIT: ExitCode = u32::MAX;

unsafe impl Send for CompiledTrace {}
unsafe impl Sync for CompiledTrace {}

impl CompiledTrace {
    /// Invokes the compiled trace. `locals` must have exactly `param_count`
    /// entries, in the trace's declared param order, and `scratch` must be
    /// large enough to hold the widest snapshot's live-value count (the
    /// caller sizes this from `TraceIr::snapshots`, not this struct, since
    /// only the caller's deoptimizer interprets the buffer's contents).
    ///
    /// # Safety
    /// `entry` points at executable memory owned by `self.module`; the
    /// caller must not call this after `self` is dropped, and `locals`/
    /// `scratch` must each be valid for the pointer arithmetic the compiled
    /// trace performs (length checked only by the invariants above, not by
    /// the generated code).
    pub unsafe fn call(&self, locals: &mut [i64], scratch: &mut [i64]) -> ExitCode {
        let f: extern "C" fn(*mut i64, *mut i64) -> u32 = std::mem::transmute(self.entry);
        f(locals.as_mut_ptr(), scratch.as_mut_ptr())
    }
}

fn host_isa() -> Result<Arc<dyn TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| CodegenError::Backend(format!("opt_level: {e}")))?;
    flag_builder
        .set("is_pic", "true")
        .map_err(|e| CodegenError::Backend(format!("is_pic: {e}")))?;
    let flags = settings::Flags::new(flag_builder);
    cranelift_native::builder()
        .map_err(|e| CodegenError::Backend(format!("native builder: {e}")))?
        .finish(flags)
        .map_err(|e| CodegenError::Backend(format!("finish isa: {e}")))
}

/// Compiles `ir` into a callable [`CompiledTrace`]. Each call builds its own
/// `JITModule`: traces are compiled rarely (once per hot back-edge) and
/// never recompiled in place, so there is no benefit to sharing a module
/// across traces, and a dedicated module makes a blacklisted/discarded
/// trace's code trivially reclaimable by just dropping the `CompiledTrace`.
pub fn compile(ir: &TraceIr) -> Result<CompiledTrace, CodegenError> {
    let isa = host_isa()?;
    let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    let mut module = JITModule::new(builder);

    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::I64)); // locals_ptr
    sig.params.push(AbiParam::new(types::I64)); // scratch_ptr
    sig.returns.push(AbiParam::new(types::I32)); // exit code

    let func_id = module
        .declare_function("trace", Linkage::Export, &sig)
        .map_err(|e| CodegenError::Backend(e.to_string()))?;

    let mut ctx = cranelift_codegen::Context::new();
    ctx.func.signature = sig;
    let mut builder_ctx = FunctionBuilderContext::new();

    {
        let mut fb = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        lower_trace(ir, &mut fb)?;
        fb.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CodegenError::Backend(e.to_string()))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(|e| CodegenError::Backend(e.to_string()))?;

    let entry = module.get_finalized_function(func_id);
    let param_count = ir.block(ir.entry).params.len();
    Ok(CompiledTrace { module, entry, param_count })
}

struct Lowering<'a> {
    ir: &'a TraceIr,
    blocks: FxHashMap<crate::jit::ir::BlockId, ir::Block>,
    values: FxHashMap<Reg, ir::Value>,
    locals_ptr: ir::Value,
    scratch_ptr: ir::Value,
}

fn lower_trace(ir: &TraceIr, fb: &mut FunctionBuilder) -> Result<(), CodegenError> {
    // The preheader must be created and switched into *first*: Cranelift
    // treats whichever block is switched to first as the function's entry
    // and hands it the signature's own params via
    // `append_block_params_for_function_params`. The trace's own entry
    // block (`ir.entry`) can't double as that block because it already
    // needs its params to be the loop-carried registers a back-edge
    // `Jump` binds — a block can't receive both the ABI's fixed two
    // pointers and a variable-width loop-carried param list from two
    // different callers, so the preheader exists purely to load the
    // locals out of the ABI's `locals_ptr` once and hand them to the
    // real entry as its first set of block-call arguments.
    let preheader = fb.create_block();
    fb.switch_to_block(preheader);
    fb.append_block_param(preheader, types::I64);
    fb.append_block_param(preheader, types::I64);
    let preheader_params = fb.block_params(preheader).to_vec();

    let mut cl_blocks = FxHashMap::default();
    for block in &ir.blocks {
        let cl_block = fb.create_block();
        for (_, ty) in &block.params {
            fb.append_block_param(cl_block, cranelift_type(*ty));
        }
        cl_blocks.insert(block.id, cl_block);
    }
    let entry_cl = cl_blocks[&ir.entry];

    let mut lowering = Lowering {
        ir,
        blocks: cl_blocks,
        values: FxHashMap::default(),
        locals_ptr: preheader_params[0],
        scratch_ptr: preheader_params[1],
    };

    // Load the trace's initial loop-carried values out of `locals_ptr` and
    // jump into the real entry block with them as block-call arguments.
    let mut init_args = Vec::new();
    for (i, (_, ty)) in ir.block(ir.entry).params.iter().enumerate() {
        let offset = (i * 8) as i32;
        let raw = fb.ins().load(types::I64, MemFlags::trusted(), lowering.locals_ptr, offset);
        init_args.push(coerce_loaded_local(fb, raw, *ty));
    }
    fb.ins().jump(entry_cl, &init_args);
    fb.seal_block(preheader);

    // `ir.entry` is this trace's only loop header (every `Loop` bytecode
    // the recorder sees closes the trace with a `Jump` back to `entry` —
    // see `jit::recorder::record`), and it has two predecessors: this
    // preheader and the back-edge itself, emitted later in block order.
    // Cranelift requires every predecessor's jump to exist before a block
    // is sealed, so `entry_cl`'s own seal is deferred past the main loop
    // below instead of happening at the end of its own iteration.
    let order: Vec<_> = ir.blocks.iter().map(|b| b.id).collect();
    for block_id in order {
        let cl_block = lowering.blocks[&block_id];
        fb.switch_to_block(cl_block);
        let block = ir.block(block_id);
        for (i, (reg, _)) in block.params.iter().enumerate() {
            lowering.values.insert(*reg, fb.block_params(cl_block)[i]);
        }
        for instr in &block.instrs {
            lowering.lower_instr(instr, fb)?;
        }
        lowering.lower_terminator(&block.terminator, fb)?;
        if block_id != ir.entry {
            fb.seal_block(cl_block);
        }
    }
    fb.seal_block(entry_cl);

    Ok(())
}

fn coerce_loaded_local(fb: &mut FunctionBuilder, raw: ir::Value, ty: JitType) -> ir::Value {
    match ty {
        JitType::Value => raw,
        JitType::I32 => unbox_i32(fb, raw),
        JitType::F64 => unbox_f64(fb, raw),
        JitType::Bool => unbox_bool(fb, raw),
    }
}

fn cranelift_type(ty: JitType) -> ir::Type {
    match ty {
        JitType::Value => types::I64,
        JitType::I32 => types::I32,
        JitType::F64 => types::F64,
        JitType::Bool => types::I8,
    }
}

fn box_i32(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    let extended = fb.ins().sextend(types::I64, val);
    let mask = fb.ins().iconst(types::I64, PAYLOAD_MASK_32 as i64);
    let payload = fb.ins().band(extended, mask);
    let tag_base = fb.ins().iconst(types::I64, (BOX_BASE | TAG_INT) as i64);
    fb.ins().bor(tag_base, payload)
}

fn unbox_i32(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    let mask = fb.ins().iconst(types::I64, PAYLOAD_MASK_32 as i64);
    let payload = fb.ins().band(val, mask);
    fb.ins().ireduce(types::I32, payload)
}

fn box_f64(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    let bits = fb.ins().bitcast(types::I64, MemFlags::new(), val);
    let nan_base = fb.ins().iconst(types::I64, BOX_BASE as i64);
    let masked = fb.ins().band(bits, nan_base);
    let is_collision = fb.ins().icmp(IntCC::Equal, masked, nan_base);
    let canonical_nan = fb.ins().iconst(types::I64, 0x7FF8_0000_0000_0000u64 as i64);
    fb.ins().select(is_collision, canonical_nan, bits)
}

fn unbox_f64(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    fb.ins().bitcast(types::F64, MemFlags::new(), val)
}

fn box_bool(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    let extended = fb.ins().uextend(types::I64, val);
    let tag_base = fb.ins().iconst(types::I64, (BOX_BASE | TAG_BOOL) as i64);
    fb.ins().bor(tag_base, extended)
}

fn unbox_bool(fb: &mut FunctionBuilder, val: ir::Value) -> ir::Value {
    let mask = fb.ins().iconst(types::I64, 1);
    let bit = fb.ins().band(val, mask);
    fb.ins().ireduce(types::I8, bit)
}

/// Mirrors `crate::value::Value::is_int`/`is_bool`/`is_float`: `BOX_MASK`
/// (the top 16 bits) says whether `val` is one of this VM's boxed special
/// encodings at all, and `TAG_MASK` (bits 32-33, entirely below `BOX_MASK`
/// — the two masks never overlap) says which kind. A float check only
/// needs the first test: any bit pattern that doesn't land in our box base
/// is a plain `f64` by construction (`Value::float` canonicalizes every
/// colliding NaN away at creation time), so there is no second tag to
/// check.
fn tag_matches(fb: &mut FunctionBuilder, val: ir::Value, expect_float: bool, tag: u64) -> ir::Value {
    let box_mask = fb.ins().iconst(types::I64, crate::value::BOX_MASK as i64);
    let box_masked = fb.ins().band(val, box_mask);
    let box_base = fb.ins().iconst(types::I64, BOX_BASE as i64);
    if expect_float {
        fb.ins().icmp(IntCC::NotEqual, box_masked, box_base)
    } else {
        let is_boxed = fb.ins().icmp(IntCC::Equal, box_masked, box_base);
        let tag_mask = fb.ins().iconst(types::I64, crate::value::TAG_MASK as i64);
        let tag_masked = fb.ins().band(val, tag_mask);
        let expected_tag = fb.ins().iconst(types::I64, tag as i64);
        let tag_ok = fb.ins().icmp(IntCC::Equal, tag_masked, expected_tag);
        fb.ins().band(is_boxed, tag_ok)
    }
}

impl<'a> Lowering<'a> {
    fn val(&self, reg: Reg) -> ir::Value {
        self.values[&reg]
    }

    fn set(&mut self, reg: Reg, v: ir::Value) {
        self.values.insert(reg, v);
    }

    fn lower_instr(&mut self, instr: &JitInstr, fb: &mut FunctionBuilder) -> Result<(), CodegenError> {
        match *instr {
            JitInstr::Const { dest, value } => {
                let v = fb.ins().iconst(types::I64, value.raw_bits() as i64);
                self.set(dest, v);
            }
            JitInstr::Move { dest, src } => {
                let v = self.val(src);
                self.set(dest, v);
            }
            JitInstr::GuardInt { src, snapshot } => self.emit_guard(fb, src, snapshot, false, TAG_INT)?,
            JitInstr::GuardBool { src, snapshot } => self.emit_guard(fb, src, snapshot, false, TAG_BOOL)?,
            JitInstr::GuardFloat { src, snapshot } => self.emit_guard(fb, src, snapshot, true, 0)?,
            JitInstr::UnboxI32 { dest, src } => {
                let v = unbox_i32(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::UnboxF64 { dest, src } => {
                let v = unbox_f64(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::UnboxBool { dest, src } => {
                let v = unbox_bool(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::BoxI32 { dest, src } => {
                let v = box_i32(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::BoxF64 { dest, src } => {
                let v = box_f64(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::BoxBool { dest, src } => {
                let v = box_bool(fb, self.val(src));
                self.set(dest, v);
            }
            JitInstr::IAdd { dest, lhs, rhs, snapshot } => self.checked_int_op(fb, dest, lhs, rhs, snapshot, IntOp::Add)?,
            JitInstr::ISub { dest, lhs, rhs, snapshot } => self.checked_int_op(fb, dest, lhs, rhs, snapshot, IntOp::Sub)?,
            JitInstr::IMul { dest, lhs, rhs, snapshot } => self.checked_int_op(fb, dest, lhs, rhs, snapshot, IntOp::Mul)?,
            JitInstr::IDiv { dest, lhs, rhs, snapshot } => self.checked_int_div(fb, dest, lhs, rhs, snapshot, false)?,
            JitInstr::IMod { dest, lhs, rhs, snapshot } => self.checked_int_div(fb, dest, lhs, rhs, snapshot, true)?,
            JitInstr::INeg { dest, src } => {
                let v = fb.ins().ineg(self.val(src));
                self.set(dest, v);
            }
            JitInstr::FAdd { dest, lhs, rhs } => {
                let v = fb.ins().fadd(self.val(lhs), self.val(rhs));
                self.set(dest, v);
            }
            JitInstr::FSub { dest, lhs, rhs } => {
                let v = fb.ins().fsub(self.val(lhs), self.val(rhs));
                self.set(dest, v);
            }
            JitInstr::FMul { dest, lhs, rhs } => {
                let v = fb.ins().fmul(self.val(lhs), self.val(rhs));
                self.set(dest, v);
            }
            JitInstr::FDiv { dest, lhs, rhs } => {
                let v = fb.ins().fdiv(self.val(lhs), self.val(rhs));
                self.set(dest, v);
            }
            JitInstr::FMod { dest, lhs, rhs } => {
                // Cranelift has no float-rem instruction; truncating modulo
                // is `a - trunc(a / b) * b`, same as the interpreter's own
                // float `%` (spec §4.8).
                let l = self.val(lhs);
                let r = self.val(rhs);
                let q = fb.ins().fdiv(l, r);
                let qt = fb.ins().trunc(q);
                let prod = fb.ins().fmul(qt, r);
                let v = fb.ins().fsub(l, prod);
                self.set(dest, v);
            }
            JitInstr::FNeg { dest, src } => {
                let v = fb.ins().fneg(self.val(src));
                self.set(dest, v);
            }
            JitInstr::ICmp { dest, op, lhs, rhs } => {
                let v = fb.ins().icmp(int_cc(op), self.val(lhs), self.val(rhs));
                let v = fb.ins().uextend(types::I8, v);
                self.set(dest, v);
            }
            JitInstr::FCmp { dest, op, lhs, rhs } => {
                let v = fb.ins().fcmp(float_cc(op), self.val(lhs), self.val(rhs));
                let v = fb.ins().uextend(types::I8, v);
                self.set(dest, v);
            }
            JitInstr::BoolNot { dest, src } => {
                let one = fb.ins().iconst(types::I8, 1);
                let v = fb.ins().bxor(self.val(src), one);
                self.set(dest, v);
            }
            JitInstr::LoadLocal { .. } => {
                // Never recorded: the trace receives loop-carried locals as
                // block params instead (see `jit::recorder`); kept in the
                // match for exhaustiveness with `jit::ir::JitInstr`.
            }
            JitInstr::StoreLocal { .. } => {
                // Likewise subsumed by block-call arguments at the
                // back-edge `Jump`.
            }
        }
        Ok(())
    }

    fn emit_guard(
        &mut self,
        fb: &mut FunctionBuilder,
        src: Reg,
        snapshot: crate::jit::ir::SnapshotId,
        is_float: bool,
        tag: u64,
    ) -> Result<(), CodegenError> {
        let v = self.val(src);
        let ok = tag_matches(fb, v, is_float, tag);
        let exit_block = fb.create_block();
        let continue_block = fb.create_block();
        fb.ins().brif(ok, continue_block, &[], exit_block, &[]);
        fb.seal_block(exit_block);
        fb.switch_to_block(exit_block);
        self.emit_exit(fb, snapshot.0);
        fb.switch_to_block(continue_block);
        // continue_block is sealed once lowering reaches its own natural
        // terminator via the caller's block-by-block loop; mark it open by
        // leaving it unsealed here is wrong for Cranelift, so seal now —
        // nothing else jumps into a guard's continuation.
        fb.seal_block(continue_block);
        Ok(())
    }

    fn emit_exit(&mut self, fb: &mut FunctionBuilder, snapshot: u32) {
        let snap = &self.ir.snapshots[snapshot as usize];
        let mut offset = 0i32;
        for (_, reg) in &snap.locals {
            let v = self.val(*reg);
            fb.ins().store(MemFlags::trusted(), v, self.scratch_ptr, offset);
            offset += 8;
        }
        for reg in &snap.stack {
            let v = self.val(*reg);
            fb.ins().store(MemFlags::trusted(), v, self.scratch_ptr, offset);
            offset += 8;
        }
        let code = fb.ins().iconst(types::I32, snapshot as i64);
        fb.ins().return_(&[code]);
    }

    fn checked_int_op(
        &mut self,
        fb: &mut FunctionBuilder,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        snapshot: crate::jit::ir::SnapshotId,
        op: IntOp,
    ) -> Result<(), CodegenError> {
        let l = self.val(lhs);
        let r = self.val(rhs);
        let (result, overflow) = match op {
            IntOp::Add => fb.ins().sadd_overflow(l, r),
            IntOp::Sub => fb.ins().ssub_overflow(l, r),
            IntOp::Mul => fb.ins().smul_overflow(l, r),
        };
        let ok_block = fb.create_block();
        let exit_block = fb.create_block();
        fb.ins().brif(overflow, exit_block, &[], ok_block, &[]);
        fb.seal_block(exit_block);
        fb.switch_to_block(exit_block);
        self.emit_exit(fb, snapshot.0);
        fb.switch_to_block(ok_block);
        fb.seal_block(ok_block);
        self.set(dest, result);
        Ok(())
    }

    fn checked_int_div(
        &mut self,
        fb: &mut FunctionBuilder,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        snapshot: crate::jit::ir::SnapshotId,
        is_mod: bool,
    ) -> Result<(), CodegenError> {
        let l = self.val(lhs);
        let r = self.val(rhs);
        let zero = fb.ins().iconst(types::I32, 0);
        let nonzero = fb.ins().icmp(IntCC::NotEqual, r, zero);
        let ok_block = fb.create_block();
        let exit_block = fb.create_block();
        fb.ins().brif(nonzero, ok_block, &[], exit_block, &[]);
        fb.seal_block(exit_block);
        fb.switch_to_block(exit_block);
        self.emit_exit(fb, snapshot.0);
        fb.switch_to_block(ok_block);
        fb.seal_block(ok_block);
        let v = if is_mod { fb.ins().srem(l, r) } else { fb.ins().sdiv(l, r) };
        self.set(dest, v);
        Ok(())
    }

    fn lower_terminator(&mut self, term: &JitTerminator, fb: &mut FunctionBuilder) -> Result<(), CodegenError> {
        match term {
            JitTerminator::Jump { target, args } => {
                let cl_target = self.blocks[target];
                let args: Vec<_> = args.iter().map(|r| self.val(*r)).collect();
                fb.ins().jump(cl_target, &args);
            }
            JitTerminator::Branch { cond, then_block, then_args, else_block, else_args } => {
                let cond_val = self.val(*cond);
                let then_cl = self.blocks[then_block];
                let else_cl = self.blocks[else_block];
                let then_args: Vec<_> = then_args.iter().map(|r| self.val(*r)).collect();
                let else_args: Vec<_> = else_args.iter().map(|r| self.val(*r)).collect();
                fb.ins().brif(cond_val, then_cl, &then_args, else_cl, &else_args);
            }
            JitTerminator::Exit { snapshot } => {
                self.emit_exit(fb, snapshot.0);
            }
            JitTerminator::Unset => {
                // Every block the recorder produces gets a real terminator
                // before `optimize`/`compile` ever see it; reaching this
                // arm would mean the recorder built a malformed trace.
                // Returning the normal-exit sentinel is a safe fallback
                // that sends control straight back to the interpreter
                // rather than generating a trap nobody can act on.
                let code = fb.ins().iconst(types::I32, NORMAL_EXIT as i64);
                fb.ins().return_(&[code]);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum IntOp {
    Add,
    Sub,
    Mul,
}

fn int_cc(op: CmpOp) -> IntCC {
    match op {
        CmpOp::Eq => IntCC::Equal,
        CmpOp::Ne => IntCC::NotEqual,
        CmpOp::Lt => IntCC::SignedLessThan,
        CmpOp::Le => IntCC::SignedLessThanOrEqual,
        CmpOp::Gt => IntCC::SignedGreaterThan,
        CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
    }
}

fn float_cc(op: CmpOp) -> cranelift_codegen::ir::condcodes::FloatCC {
    use cranelift_codegen::ir::condcodes::FloatCC;
    match op {
        CmpOp::Eq => FloatCC::Equal,
        CmpOp::Ne => FloatCC::NotEqual,
        CmpOp::Lt => FloatCC::LessThan,
        CmpOp::Le => FloatCC::LessThanOrEqual,
        CmpOp::Gt => FloatCC::GreaterThan,
        CmpOp::Ge => FloatCC::GreaterThanOrEqual,
    }
}

