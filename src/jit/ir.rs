//! The trace recorder's SSA intermediate representation (spec §4.6).
//!
//! Scoped to the subset of bytecode a *numeric loop trace* actually needs:
//! boxed-`Value` constants/locals, unboxed `i32`/`f64` arithmetic and
//! comparison, and the guards that keep the unboxing sound. Grounded on
//! `raya-engine/src/jit/ir/instr.rs`'s `Reg`/`JitBlock`/`JitInstr` shape,
//! trimmed from that file's ~80 variants (objects, closures, concurrency,
//! JSON, ...) down to what a `for`/`while` numeric loop lowers to — this
//! recorder bails out of anything wider (see `jit::recorder`) rather than
//! growing the IR to match, so every variant below is reachable from a
//! real program.
//!
//! Blocks take parameters rather than carrying explicit `PHI` instructions
//! (spec §4.6 lists `PHI` as SSA bookkeeping, but Cranelift's own IR already
//! represents loop-carried values as block parameters, and this recorder's
//! output is lowered straight into Cranelift — see `jit::codegen` — so a
//! separate phi node would just be translated back into a block param
//! immediately).

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u32);

/// The concrete machine type a register holds. `Value` regs carry a full
/// NaN-boxed word (spec §3); `I32`/`F64`/`Bool` regs carry the unboxed
/// native payload produced by a `Guard*`+`Unbox*` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitType {
    Value,
    I32,
    F64,
    Bool,
}

/// Live-variable mapping captured at a guard or at the loop's normal exit
/// (spec §4.6: "the list of (live variable, IR value that currently holds
/// it) pairs ... plus the bytecode PC at which the interpreter must resume
/// on failure"). `locals` only needs the slots the trace actually touches;
/// every other local is untouched by the trace and is already correct in
/// the interpreter's stack.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub resume_pc: u32,
    pub locals: Vec<(u16, Reg)>,
    /// The interpreter's operand stack (relative to the frame's
    /// `base_ptr`), bottom to top, as it stood *before* the instruction at
    /// `resume_pc` ran. A guard that fires mid-expression (e.g. inside an
    /// `ADD`, after both operands are already popped off the recorder's
    /// shadow stack) still needs these restored so re-entering the
    /// interpreter at `resume_pc` sees exactly what plain interpretation
    /// would have seen.
    pub stack: Vec<Reg>,
}

#[derive(Debug, Clone)]
pub enum JitInstr {
    /// Materializes a boxed constant directly (constants never need a
    /// runtime guard to unbox).
    Const { dest: Reg, value: Value },
    Move { dest: Reg, src: Reg },

    GuardInt { src: Reg, snapshot: SnapshotId },
    GuardFloat { src: Reg, snapshot: SnapshotId },
    GuardBool { src: Reg, snapshot: SnapshotId },

    UnboxI32 { dest: Reg, src: Reg },
    UnboxF64 { dest: Reg, src: Reg },
    UnboxBool { dest: Reg, src: Reg },
    BoxI32 { dest: Reg, src: Reg },
    BoxF64 { dest: Reg, src: Reg },
    BoxBool { dest: Reg, src: Reg },

    /// Checked `i32` arithmetic; lowering wires the overflow flag to an
    /// exit stub for `snapshot` rather than trapping (spec §4.7: "guards
    /// compile to compare-and-branch to per-guard exit stubs").
    IAdd { dest: Reg, lhs: Reg, rhs: Reg, snapshot: SnapshotId },
    ISub { dest: Reg, lhs: Reg, rhs: Reg, snapshot: SnapshotId },
    IMul { dest: Reg, lhs: Reg, rhs: Reg, snapshot: SnapshotId },
    /// Truncating division (spec §4.8); `snapshot` covers the
    /// `NonZeroDivisor` guard.
    IDiv { dest: Reg, lhs: Reg, rhs: Reg, snapshot: SnapshotId },
    IMod { dest: Reg, lhs: Reg, rhs: Reg, snapshot: SnapshotId },
    INeg { dest: Reg, src: Reg },

    FAdd { dest: Reg, lhs: Reg, rhs: Reg },
    FSub { dest: Reg, lhs: Reg, rhs: Reg },
    FMul { dest: Reg, lhs: Reg, rhs: Reg },
    FDiv { dest: Reg, lhs: Reg, rhs: Reg },
    FMod { dest: Reg, lhs: Reg, rhs: Reg },
    FNeg { dest: Reg, src: Reg },

    ICmp { dest: Reg, op: CmpOp, lhs: Reg, rhs: Reg },
    FCmp { dest: Reg, op: CmpOp, lhs: Reg, rhs: Reg },
    BoolNot { dest: Reg, src: Reg },

    LoadLocal { dest: Reg, slot: u16 },
    StoreLocal { slot: u16, src: Reg },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// How a block ends. `LoopBack` and `Exit` both carry a full boxed
/// live-out set so the codegen backend can write it to the out-buffer the
/// Rust-side caller reads after every native call (see `jit::codegen`).
#[derive(Debug, Clone)]
pub enum JitTerminator {
    /// Unconditional edge to `target`, binding `target`'s block params to
    /// `args` in order (Cranelift's own representation of a loop-carried
    /// phi; see the module doc comment).
    Jump { target: BlockId, args: Vec<Reg> },
    Branch { cond: Reg, then_block: BlockId, then_args: Vec<Reg>, else_block: BlockId, else_args: Vec<Reg> },
    /// A side exit: either the loop's own condition went false (the
    /// "normal" exit) or a guard upstream failed. Either way the
    /// interpreter resumes at `snapshot.resume_pc` with `snapshot.locals`
    /// written back (spec §4.7's deoptimizer).
    Exit { snapshot: SnapshotId },
    /// Placeholder used while a block is under construction.
    Unset,
}

#[derive(Debug, Clone)]
pub struct JitBlock {
    pub id: BlockId,
    pub params: Vec<(Reg, JitType)>,
    pub instrs: Vec<JitInstr>,
    pub terminator: JitTerminator,
}

/// One recorded trace: a loop body starting and ending at `entry_pc`
/// (spec glossary: "Trace — a linear recording of actually executed
/// bytecode starting at a hot back-edge").
#[derive(Debug)]
pub struct TraceIr {
    pub entry_pc: u32,
    pub blocks: Vec<JitBlock>,
    pub entry: BlockId,
    pub snapshots: Vec<Snapshot>,
    /// The bytecode local slot each of `entry`'s block params stands for,
    /// in the same order (index *i* here is entry param *i*). Populated by
    /// `jit::recorder::record` from `prescan_touched_slots`; both
    /// `jit::codegen` (laying out the native entry's `locals_ptr` array)
    /// and `jit::deopt`/`jit::mod` (reading the interpreter's stack back
    /// into that same array before a call) key off this list rather than
    /// re-deriving it, so the two sides can never disagree about order.
    pub entry_locals: Vec<u16>,
    next_reg: u32,
    reg_types: rustc_hash::FxHashMap<Reg, JitType>,
}

impl TraceIr {
    pub fn new(entry_pc: u32) -> Self {
        TraceIr {
            entry_pc,
            blocks: Vec::new(),
            entry: BlockId(0),
            snapshots: Vec::new(),
            entry_locals: Vec::new(),
            next_reg: 0,
            reg_types: rustc_hash::FxHashMap::default(),
        }
    }

    pub fn alloc_reg(&mut self, ty: JitType) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    pub fn reg_type(&self, reg: Reg) -> JitType {
        self.reg_types.get(&reg).copied().unwrap_or(JitType::Value)
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(JitBlock { id, params: Vec::new(), instrs: Vec::new(), terminator: JitTerminator::Unset });
        id
    }

    pub fn block(&self, id: BlockId) -> &JitBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut JitBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> SnapshotId {
        let id = SnapshotId(self.snapshots.len() as u32);
        self.snapshots.push(snapshot);
        id
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }
}

impl JitInstr {
    pub fn dest(&self) -> Option<Reg> {
        use JitInstr::*;
        match *self {
            Const { dest, .. }
            | Move { dest, .. }
            | UnboxI32 { dest, .. }
            | UnboxF64 { dest, .. }
            | UnboxBool { dest, .. }
            | BoxI32 { dest, .. }
            | BoxF64 { dest, .. }
            | BoxBool { dest, .. }
            | IAdd { dest, .. }
            | ISub { dest, .. }
            | IMul { dest, .. }
            | IDiv { dest, .. }
            | IMod { dest, .. }
            | INeg { dest, .. }
            | FAdd { dest, .. }
            | FSub { dest, .. }
            | FMul { dest, .. }
            | FDiv { dest, .. }
            | FMod { dest, .. }
            | FNeg { dest, .. }
            | ICmp { dest, .. }
            | FCmp { dest, .. }
            | BoolNot { dest, .. }
            | LoadLocal { dest, .. } => Some(dest),
            GuardInt { .. } | GuardFloat { .. } | GuardBool { .. } | StoreLocal { .. } => None,
        }
    }

    /// Pure instructions (no guard, no store) can be dead-code eliminated
    /// when their `dest` is unused (spec §4.6's optimizer pass list).
    pub fn has_side_effects(&self) -> bool {
        matches!(self, JitInstr::StoreLocal { .. } | JitInstr::GuardInt { .. } | JitInstr::GuardFloat { .. } | JitInstr::GuardBool { .. })
    }

    /// Registers this instruction reads, for DCE liveness and for the
    /// codegen backend's straight-line lowering.
    pub fn uses(&self) -> Vec<Reg> {
        use JitInstr::*;
        match *self {
            Const { .. } | LoadLocal { .. } => vec![],
            Move { src, .. }
            | UnboxI32 { src, .. }
            | UnboxF64 { src, .. }
            | UnboxBool { src, .. }
            | BoxI32 { src, .. }
            | BoxF64 { src, .. }
            | BoxBool { src, .. }
            | INeg { src, .. }
            | FNeg { src, .. }
            | BoolNot { src, .. }
            | StoreLocal { src, .. }
            | GuardInt { src, .. }
            | GuardFloat { src, .. }
            | GuardBool { src, .. } => vec![src],
            IAdd { lhs, rhs, .. }
            | ISub { lhs, rhs, .. }
            | IMul { lhs, rhs, .. }
            | IDiv { lhs, rhs, .. }
            | IMod { lhs, rhs, .. }
            | FAdd { lhs, rhs, .. }
            | FSub { lhs, rhs, .. }
            | FMul { lhs, rhs, .. }
            | FDiv { lhs, rhs, .. }
            | FMod { lhs, rhs, .. }
            | ICmp { lhs, rhs, .. }
            | FCmp { lhs, rhs, .. } => vec![lhs, rhs],
        }
    }
}
