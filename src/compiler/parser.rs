//! Single-pass Pratt parser/compiler (spec §4.2): tokens go straight to
//! bytecode with no intermediate AST, the way a tree-walking front end
//! would build one except every "build a node" step instead emits bytes
//! into the current function's [`Chunk`]. The precedence climbing and
//! local/upvalue resolution follow the classic single-pass technique
//! `raya-compiler` does not use (it builds a full AST first) but which
//! this language's own spec calls for explicitly.

use crate::bytecode::chunk::Chunk;
use crate::bytecode::opcode::Opcode;
use crate::compiler::error::CompileError;
use crate::gc::collector::GarbageCollector;
use crate::interner::{Interner, Symbol};
use crate::lexer::{tokenize, Span, Token, TokenKind};
use crate::object::{ExceptionTableEntry, ObjKind, RFunction};
use crate::value::Value;
use crate::vm::native;
use crate::vm::strings::StringTable;
use rustc_hash::FxHashSet;

const PREC_ASSIGN: u8 = 0;
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_EQUALITY: u8 = 3;
const PREC_COMPARISON: u8 = 4;
const PREC_TERM: u8 = 5;
const PREC_FACTOR: u8 = 6;
const PREC_UNARY: u8 = 7;
#[allow(dead_code)]
const PREC_CALL: u8 = 8;

/// The result of compiling a full program: a best-effort top-level
/// function is always produced, even when `errors` is non-empty, so a
/// caller can still disassemble or otherwise inspect partial output
/// (spec §4.2: compile errors do not stop codegen for the rest of the
/// file).
pub struct CompileOutput {
    pub function: crate::object::ObjRef,
    pub errors: Vec<CompileError>,
}

struct LocalVar {
    name: Symbol,
    depth: i32,
    is_const: bool,
    captured: bool,
}

struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

#[derive(Default)]
struct LoopCtx {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    scope_depth: i32,
}

struct FuncState {
    chunk: Chunk,
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    arity: u8,
    name: Option<String>,
    loops: Vec<LoopCtx>,
    try_ctxs: Vec<TryCtx>,
    /// Hidden `(returning_flag, pending_value)` local slots used to run a
    /// `try`'s `finally` block before a `return` inside it actually
    /// returns (spec §7: `finally` runs exactly once regardless of how
    /// control leaves). `None` for the top-level script, where `return`
    /// is already a compile error and nothing needs to redirect through.
    return_cascade: Option<(u16, u16)>,
}

/// One `return` that occurred lexically inside this `try`'s try/catch body
/// and must run the try's `finally` (or, if it has none, its epilogue)
/// before actually returning — a deferred jump, patched once that code's
/// address is known, the same way `LoopCtx::break_jumps` is patched once
/// the loop's exit is known.
struct TryCtx {
    return_jumps: Vec<usize>,
    /// Scope depth at the try statement itself, so a `return` inside it
    /// can pop back down to a clean stack before redirecting to
    /// `finally` — the same technique `LoopCtx::scope_depth` uses for
    /// `break`/`continue`.
    scope_depth: i32,
}

enum NameRef {
    Local(u16, bool),
    Upvalue(u8),
    Global(Symbol, bool),
}

pub struct Compiler<'a> {
    tokens: Vec<Token>,
    pos: usize,
    interner: &'a mut Interner,
    gc: &'a mut GarbageCollector,
    strings: &'a mut StringTable,
    errors: Vec<CompileError>,
    funcs: Vec<FuncState>,
    global_consts: FxHashSet<Symbol>,
    sym_self: Symbol,
    sym_super_unused: Symbol,
    /// The most recently pushed literal value, if nothing else has been
    /// emitted since — enables constant folding of `LIT op LIT` chains
    /// without building an AST (spec §4.2's folding requirement).
    pending_const: Option<(Value, usize, usize)>,
}

/// Compiles `source` into a top-level script function. Lexical errors are
/// folded into `errors` as `CompileError::Syntax` so the caller only has
/// one error channel to look at.
pub fn compile(
    source: &str,
    interner: &mut Interner,
    gc: &mut GarbageCollector,
    strings: &mut StringTable,
) -> CompileOutput {
    let mut errors = Vec::new();
    let tokens = match tokenize(source, interner) {
        Ok(t) => t,
        Err(lex_errors) => {
            for e in lex_errors {
                errors.push(CompileError::Syntax { message: e.to_string(), line: 0, column: 0 });
            }
            vec![Token { kind: TokenKind::Eof, span: Span { line: 1, column: 1 } }]
        }
    };
    let mut compiler = Compiler::new(tokens, interner, gc, strings);
    let function = compiler.compile_script();
    errors.extend(compiler.errors);
    CompileOutput { function, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disassemble(source: &str) -> String {
        let mut interner = Interner::new();
        let mut gc = GarbageCollector::new();
        let mut strings = StringTable::new();
        let output = compile(source, &mut interner, &mut gc, &mut strings);
        assert!(output.errors.is_empty(), "{source:?} failed to compile: {:?}", output.errors);
        let chunk = match output.function.kind() {
            ObjKind::Function(f) => &f.chunk,
            _ => unreachable!(),
        };
        crate::bytecode::disassemble(chunk, "script")
    }

    /// Spec §7's constant-folding invariant: `5 + 3 * 2` and `11` must
    /// compile to the same bytecode, byte for byte (compared here via
    /// disassembly text, which is a faithful proxy since it prints every
    /// opcode and operand).
    #[test]
    fn constant_folding_matches_the_folded_literal() {
        assert_eq!(disassemble("return 5 + 3 * 2"), disassemble("return 11"));
    }

    #[test]
    fn constant_folding_does_not_fold_across_a_variable() {
        assert_ne!(disassemble("let x = 1 return x + 2 * 3"), disassemble("let x = 1 return 7"));
    }
}

impl<'a> Compiler<'a> {
    fn new(
        tokens: Vec<Token>,
        interner: &'a mut Interner,
        gc: &'a mut GarbageCollector,
        strings: &'a mut StringTable,
    ) -> Self {
        let sym_self = interner.intern("self");
        let sym_super_unused = interner.intern("$not-a-real-identifier$");
        Compiler {
            tokens,
            pos: 0,
            interner,
            gc,
            strings,
            errors: Vec::new(),
            funcs: Vec::new(),
            global_consts: FxHashSet::default(),
            sym_self,
            sym_super_unused,
            pending_const: None,
        }
    }

    // ------------------------------------------------------------ tokens

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn line(&self) -> u32 {
        if self.pos == 0 {
            self.tokens[0].span.line
        } else {
            self.tokens[self.pos - 1].span.line
        }
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn expect_kind(&mut self, kind: &TokenKind, msg: &str) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            self.error_here(msg);
            false
        }
    }

    fn expect_identifier(&mut self) -> Symbol {
        if let TokenKind::Identifier(sym) = self.peek_kind().clone() {
            self.advance();
            sym
        } else {
            self.error_here("expected identifier");
            self.interner.intern("$error$")
        }
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let span = self.current_span();
        self.errors.push(CompileError::Syntax { message: message.into(), line: span.line, column: span.column });
    }

    fn hidden_ident(&mut self, text: &str) -> Symbol {
        self.interner.intern(text)
    }

    // ------------------------------------------------------------ chunk

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.funcs.last_mut().unwrap().chunk
    }

    fn emit(&mut self, op: Opcode) -> usize {
        let line = self.line();
        self.chunk_mut().write_u8(op as u8, line)
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.chunk_mut().write_u8(byte, line);
    }

    fn emit_u16(&mut self, v: u16) {
        let line = self.line();
        self.chunk_mut().write_u16(v, line);
    }

    fn emit_u32(&mut self, v: u32) {
        let line = self.line();
        self.chunk_mut().write_u32(v, line);
    }

    fn emit_i32(&mut self, v: i32) {
        let line = self.line();
        self.chunk_mut().write_i32(v, line);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit(op);
        let offset = self.chunk_mut().len();
        self.emit_i32(0);
        offset
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        let target = self.chunk_mut().len();
        let instr_end = operand_offset + 4;
        let delta = (target as i64 - instr_end as i64) as i32;
        let chunk = self.chunk_mut();
        chunk.code[operand_offset..operand_offset + 4].copy_from_slice(&delta.to_be_bytes());
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(Opcode::Loop);
        let operand_offset = self.chunk_mut().len();
        self.emit_u32(0);
        let instr_end = operand_offset + 4;
        let delta = (instr_end - loop_start) as u32;
        let chunk = self.chunk_mut();
        chunk.code[operand_offset..operand_offset + 4].copy_from_slice(&delta.to_be_bytes());
    }

    fn alloc_ic_slot(&mut self) -> u16 {
        self.chunk_mut().next_ic_slot()
    }

    // ------------------------------------------------------------ scopes

    fn is_top_level(&self) -> bool {
        self.funcs.len() == 1
    }

    fn begin_scope(&mut self) {
        self.funcs.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let new_depth = {
            let f = self.funcs.last_mut().unwrap();
            f.scope_depth -= 1;
            f.scope_depth
        };
        loop {
            let should_pop = matches!(self.funcs.last().unwrap().locals.last(), Some(l) if l.depth > new_depth);
            if !should_pop {
                break;
            }
            let local = self.funcs.last_mut().unwrap().locals.pop().unwrap();
            if local.captured {
                let slot = self.funcs.last().unwrap().locals.len() as u16;
                self.emit(Opcode::CloseUpvalue);
                self.emit_u16(slot);
            } else {
                self.emit(Opcode::Pop);
            }
        }
    }

    /// Runtime stack cleanup for an early `break`/`continue` that skips
    /// past locals still lexically in scope, without removing them from
    /// the compiler's own bookkeeping (code after the loop still needs
    /// them resolvable). Captured locals are not closed here — see
    /// DESIGN.md for why that's an accepted gap.
    fn emit_scope_pops_down_to(&mut self, target_depth: i32) {
        let count = self.funcs.last().unwrap().locals.iter().rev().take_while(|l| l.depth > target_depth).count();
        for _ in 0..count {
            self.emit(Opcode::Pop);
        }
    }

    fn declare_local(&mut self, name: Symbol, is_const: bool) -> u16 {
        let f = self.funcs.last_mut().unwrap();
        let slot = f.locals.len() as u16;
        f.locals.push(LocalVar { name, depth: f.scope_depth, is_const, captured: false });
        slot
    }

    fn resolve_local(&self, func_idx: usize, name: Symbol) -> Option<(u16, bool)> {
        let f = &self.funcs[func_idx];
        for (i, l) in f.locals.iter().enumerate().rev() {
            if l.name == name {
                return Some((i as u16, l.is_const));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: Symbol) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some((slot, _)) = self.resolve_local(enclosing, name) {
            self.funcs[enclosing].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(func_idx, true, slot as u8));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, false, up));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, is_local: bool, index: u8) -> u8 {
        let f = &mut self.funcs[func_idx];
        for (i, u) in f.upvalues.iter().enumerate() {
            if u.is_local == is_local && u.index == index {
                return i as u8;
            }
        }
        f.upvalues.push(UpvalueDesc { is_local, index });
        (f.upvalues.len() - 1) as u8
    }

    fn resolve_name(&mut self, name: Symbol) -> NameRef {
        let cur = self.funcs.len() - 1;
        if let Some((slot, is_const)) = self.resolve_local(cur, name) {
            return NameRef::Local(slot, is_const);
        }
        if let Some(up) = self.resolve_upvalue(cur, name) {
            return NameRef::Upvalue(up);
        }
        NameRef::Global(name, self.global_consts.contains(&name))
    }

    fn resolve_and_load(&mut self, name: Symbol) {
        match self.resolve_name(name) {
            NameRef::Local(slot, _) => {
                self.emit(Opcode::LoadLocal);
                self.emit_u16(slot);
            }
            NameRef::Upvalue(idx) => {
                self.emit(Opcode::LoadUpvalue);
                self.emit_u8(idx);
            }
            NameRef::Global(sym, _) => {
                self.emit(Opcode::LoadGlobal);
                self.emit_u32(sym.index() as u32);
            }
        }
    }

    fn resolve_and_store(&mut self, name: Symbol, span: Span) {
        match self.resolve_name(name) {
            NameRef::Local(slot, is_const) => {
                if is_const {
                    let text = self.interner.resolve(name).to_string();
                    self.errors.push(CompileError::AssignToConst { name: text, line: span.line, column: span.column });
                }
                self.emit(Opcode::StoreLocal);
                self.emit_u16(slot);
            }
            NameRef::Upvalue(idx) => {
                self.emit(Opcode::StoreUpvalue);
                self.emit_u8(idx);
            }
            NameRef::Global(sym, is_const) => {
                if is_const {
                    let text = self.interner.resolve(name).to_string();
                    self.errors.push(CompileError::AssignToConst { name: text, line: span.line, column: span.column });
                }
                self.emit(Opcode::StoreGlobal);
                self.emit_u32(sym.index() as u32);
            }
        }
    }

    // -------------------------------------------------------------- loops

    fn push_loop(&mut self, scope_depth: i32) {
        self.funcs.last_mut().unwrap().loops.push(LoopCtx { scope_depth, ..Default::default() });
    }

    fn pop_loop(&mut self) -> LoopCtx {
        self.funcs.last_mut().unwrap().loops.pop().unwrap()
    }

    // --------------------------------------------------------- literals

    fn emit_literal_value(&mut self, v: Value) {
        let start = self.chunk_mut().len();
        if let Some(i) = v.as_int() {
            self.emit(Opcode::ConstInt);
            self.emit_i32(i);
        } else if v.is_nil() {
            self.emit(Opcode::ConstNil);
        } else if v.as_bool() == Some(true) {
            self.emit(Opcode::ConstTrue);
        } else if v.as_bool() == Some(false) {
            self.emit(Opcode::ConstFalse);
        } else {
            let idx = self.chunk_mut().add_constant(v);
            self.emit(Opcode::Const);
            self.emit_u16(idx);
        }
        let end = self.chunk_mut().len();
        self.pending_const = Some((v, start, end));
    }

    fn intern_string_value(&mut self, s: &str) -> Value {
        let obj = self.strings.intern(self.gc, s);
        Value::object(obj)
    }

    // ------------------------------------------------------------ Pratt

    fn infix_info(kind: &TokenKind) -> Option<(u8, Option<bool>)> {
        use TokenKind::*;
        Some(match kind {
            Or => (PREC_OR, Some(false)),
            And => (PREC_AND, Some(true)),
            EqualEqual | BangEqual => (PREC_EQUALITY, None),
            Less | Greater | LessEqual | GreaterEqual => (PREC_COMPARISON, None),
            Plus | Minus => (PREC_TERM, None),
            Star | Slash | Percent => (PREC_FACTOR, None),
            _ => return None,
        })
    }

    fn expression(&mut self) {
        self.parse_precedence(PREC_ASSIGN);
    }

    fn parse_precedence(&mut self, min_prec: u8) {
        let can_assign = min_prec <= PREC_ASSIGN;
        self.pending_const = None;
        let is_assignment = self.parse_prefix(can_assign);
        if is_assignment {
            self.pending_const = None;
            return;
        }
        loop {
            let Some((prec, logical)) = Self::infix_info(self.peek_kind()) else { break };
            if prec < min_prec {
                break;
            }
            let op_kind = self.peek_kind().clone();
            self.advance();
            let next_min = prec + 1;
            match logical {
                Some(true) => {
                    self.pending_const = None;
                    self.compile_and(next_min);
                }
                Some(false) => {
                    self.pending_const = None;
                    self.compile_or(next_min);
                }
                None => {
                    let left = self.pending_const.take();
                    self.parse_precedence(next_min);
                    let right = self.pending_const.take();
                    let folded = match (left, right) {
                        (Some(l), Some(r)) => self.try_fold(&op_kind, l, r),
                        _ => false,
                    };
                    if !folded {
                        self.emit_binary(&op_kind);
                    }
                }
            }
        }
    }

    fn compile_and(&mut self, next_min: u8) {
        self.emit(Opcode::Dup);
        let end_jump = self.emit_jump(Opcode::JmpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(next_min);
        self.patch_jump(end_jump);
    }

    fn compile_or(&mut self, next_min: u8) {
        self.emit(Opcode::Dup);
        let end_jump = self.emit_jump(Opcode::JmpIfTrue);
        self.emit(Opcode::Pop);
        self.parse_precedence(next_min);
        self.patch_jump(end_jump);
    }

    fn emit_binary(&mut self, op_kind: &TokenKind) {
        use TokenKind::*;
        let op = match op_kind {
            Plus => Opcode::Add,
            Minus => Opcode::Sub,
            Star => Opcode::Mul,
            Slash => Opcode::Div,
            Percent => Opcode::Mod,
            EqualEqual => Opcode::Eq,
            BangEqual => Opcode::Ne,
            Less => Opcode::Lt,
            Greater => Opcode::Gt,
            LessEqual => Opcode::Le,
            GreaterEqual => Opcode::Ge,
            _ => unreachable!("not a binary operator token"),
        };
        self.emit(op);
    }

    fn try_fold(&mut self, op: &TokenKind, left: (Value, usize, usize), right: (Value, usize, usize)) -> bool {
        let (lv, lstart, _) = left;
        let (rv, _, _) = right;
        let folded = match op {
            TokenKind::Plus => self.fold_add(lv, rv),
            TokenKind::Minus => Self::fold_numeric(lv, rv, |a, b| a - b, |a, b| a.checked_sub(b)),
            TokenKind::Star => Self::fold_numeric(lv, rv, |a, b| a * b, |a, b| a.checked_mul(b)),
            TokenKind::Slash => Self::fold_div(lv, rv),
            TokenKind::Percent => Self::fold_mod(lv, rv),
            TokenKind::EqualEqual => {
                if lv.is_number() && rv.is_number() || (lv.as_object().is_some() && rv.as_object().is_some()) {
                    Some(Value::bool(crate::vm::values_structurally_equal(lv, rv)))
                } else {
                    None
                }
            }
            TokenKind::BangEqual => {
                if lv.is_number() && rv.is_number() || (lv.as_object().is_some() && rv.as_object().is_some()) {
                    Some(Value::bool(!crate::vm::values_structurally_equal(lv, rv)))
                } else {
                    None
                }
            }
            TokenKind::Less => Self::fold_cmp(lv, rv, |a, b| a < b),
            TokenKind::Greater => Self::fold_cmp(lv, rv, |a, b| a > b),
            TokenKind::LessEqual => Self::fold_cmp(lv, rv, |a, b| a <= b),
            TokenKind::GreaterEqual => Self::fold_cmp(lv, rv, |a, b| a >= b),
            _ => None,
        };
        let Some(v) = folded else { return false };
        self.chunk_mut().code.truncate(lstart);
        self.emit_literal_value(v);
        true
    }

    fn fold_add(&mut self, a: Value, b: Value) -> Option<Value> {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Some(match x.checked_add(y) {
                Some(s) => Value::int(s),
                None => Value::float(x as f64 + y as f64),
            });
        }
        if a.is_number() && b.is_number() {
            return Some(Value::float(a.as_number().unwrap() + b.as_number().unwrap()));
        }
        if let (Some(oa), Some(ob)) = (a.as_object(), b.as_object()) {
            if let (Some(sa), Some(sb)) = (oa.as_string(), ob.as_string()) {
                let mut s = String::with_capacity(sa.as_str().len() + sb.as_str().len());
                s.push_str(sa.as_str());
                s.push_str(sb.as_str());
                return Some(self.intern_string_value(&s));
            }
        }
        None
    }

    fn fold_numeric(a: Value, b: Value, ffn: impl Fn(f64, f64) -> f64, ifn: impl Fn(i32, i32) -> Option<i32>) -> Option<Value> {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Some(match ifn(x, y) {
                Some(v) => Value::int(v),
                None => Value::float(ffn(x as f64, y as f64)),
            });
        }
        if a.is_number() && b.is_number() {
            return Some(Value::float(ffn(a.as_number().unwrap(), b.as_number().unwrap())));
        }
        None
    }

    fn fold_div(a: Value, b: Value) -> Option<Value> {
        if !a.is_number() || !b.is_number() {
            return None;
        }
        if let (Some(0), Some(_)) = (b.as_int(), a.as_int()) {
            return None; // let the runtime raise DivisionByZero
        }
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            if x % y == 0 {
                return Some(Value::int(x / y));
            }
        }
        Some(Value::float(a.as_number().unwrap() / b.as_number().unwrap()))
    }

    fn fold_mod(a: Value, b: Value) -> Option<Value> {
        if !a.is_number() || !b.is_number() {
            return None;
        }
        if let Some(0) = b.as_int() {
            return None;
        }
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Some(Value::int(x % y));
        }
        Some(Value::float(a.as_number().unwrap() % b.as_number().unwrap()))
    }

    fn fold_cmp(a: Value, b: Value, cmp: impl Fn(f64, f64) -> bool) -> Option<Value> {
        if a.is_number() && b.is_number() {
            Some(Value::bool(cmp(a.as_number().unwrap(), b.as_number().unwrap())))
        } else {
            None
        }
    }

    // ------------------------------------------------------------ prefix

    fn parse_prefix(&mut self, can_assign: bool) -> bool {
        match self.peek_kind().clone() {
            TokenKind::IntLiteral(n) => {
                self.advance();
                let v = i32::try_from(n).map(Value::int).unwrap_or_else(|_| Value::float(n as f64));
                self.emit_literal_value(v);
                false
            }
            TokenKind::FloatLiteral(f) => {
                self.advance();
                self.emit_literal_value(Value::float(f));
                false
            }
            TokenKind::StringLiteral(sym) => {
                self.advance();
                let text = self.interner.resolve(sym).to_string();
                let v = self.intern_string_value(&text);
                self.emit_literal_value(v);
                self.finish_postfix(can_assign)
            }
            TokenKind::True => {
                self.advance();
                self.emit_literal_value(Value::bool(true));
                self.finish_postfix(can_assign)
            }
            TokenKind::False => {
                self.advance();
                self.emit_literal_value(Value::bool(false));
                self.finish_postfix(can_assign)
            }
            TokenKind::Nil => {
                self.advance();
                self.emit_literal_value(Value::nil());
                self.finish_postfix(can_assign)
            }
            TokenKind::Identifier(sym) => {
                self.advance();
                self.identifier(sym, can_assign)
            }
            TokenKind::SelfKw => {
                self.advance();
                let sym = self.sym_self;
                self.resolve_and_load(sym);
                self.finish_postfix(can_assign)
            }
            TokenKind::Super => {
                self.advance();
                self.super_access(can_assign)
            }
            TokenKind::Minus => {
                self.advance();
                self.pending_const = None;
                self.parse_precedence(PREC_UNARY);
                let operand = self.pending_const.take();
                if let Some((v, start, _)) = operand {
                    if let Some(i) = v.as_int() {
                        self.chunk_mut().code.truncate(start);
                        let folded = i.checked_neg().map(Value::int).unwrap_or_else(|| Value::float(-(i as f64)));
                        self.emit_literal_value(folded);
                        return false;
                    } else if let Some(f) = v.as_float() {
                        self.chunk_mut().code.truncate(start);
                        self.emit_literal_value(Value::float(-f));
                        return false;
                    }
                }
                self.emit(Opcode::Neg);
                false
            }
            TokenKind::Not => {
                self.advance();
                self.pending_const = None;
                self.parse_precedence(PREC_UNARY);
                self.emit(Opcode::Not);
                false
            }
            TokenKind::Typeof => {
                self.advance();
                self.pending_const = None;
                self.parse_precedence(PREC_UNARY);
                self.emit(Opcode::TypeOf);
                false
            }
            TokenKind::LeftParen => {
                self.advance();
                self.expression();
                self.expect_kind(&TokenKind::RightParen, "expected ')'");
                self.finish_postfix(can_assign)
            }
            TokenKind::LeftBracket => {
                self.advance();
                self.array_literal();
                self.finish_postfix(can_assign)
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.dict_literal();
                self.finish_postfix(can_assign)
            }
            TokenKind::New => {
                self.advance();
                self.new_expr(can_assign)
            }
            TokenKind::Fn => {
                self.advance();
                self.function_literal();
                false
            }
            other => {
                self.error_here(format!("unexpected token {other:?}"));
                self.advance();
                self.emit_literal_value(Value::nil());
                false
            }
        }
    }

    fn identifier(&mut self, name: Symbol, can_assign: bool) -> bool {
        if can_assign && matches!(self.peek_kind(), TokenKind::Equal) {
            let span = self.current_span();
            self.advance();
            self.parse_precedence(PREC_ASSIGN);
            self.resolve_and_store(name, span);
            true
        } else if matches!(self.peek_kind(), TokenKind::LeftParen) {
            let text = self.interner.resolve(name).to_string();
            if let Some(native_id) = native::name_to_id(&text) {
                self.advance();
                let argc = self.call_args();
                self.emit(Opcode::CallNative);
                self.emit_u16(native_id);
                self.emit_u8(argc);
                return false;
            }
            self.resolve_and_load(name);
            self.finish_postfix(can_assign)
        } else {
            self.resolve_and_load(name);
            self.finish_postfix(can_assign)
        }
    }

    fn super_access(&mut self, can_assign: bool) -> bool {
        self.expect_kind(&TokenKind::Dot, "expected '.' after 'super'");
        let name = self.expect_identifier();
        let self_sym = self.sym_self;
        self.resolve_and_load(self_sym);
        let ic = self.alloc_ic_slot();
        self.emit(Opcode::GetSuper);
        self.emit_u16(ic);
        self.emit_u32(name.index() as u32);
        self.finish_postfix(can_assign)
    }

    fn new_expr(&mut self, can_assign: bool) -> bool {
        let name = self.expect_identifier();
        self.identifier(name, can_assign && false)
    }

    fn finish_postfix(&mut self, can_assign: bool) -> bool {
        loop {
            match self.peek_kind().clone() {
                TokenKind::LeftParen => {
                    self.advance();
                    let argc = self.call_args();
                    self.emit(Opcode::Call);
                    self.emit_u8(argc);
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier();
                    if matches!(self.peek_kind(), TokenKind::LeftParen) {
                        self.advance();
                        let argc = self.call_args();
                        let ic = self.alloc_ic_slot();
                        self.emit(Opcode::Invoke);
                        self.emit_u16(ic);
                        self.emit_u32(name.index() as u32);
                        self.emit_u8(argc);
                    } else if can_assign && matches!(self.peek_kind(), TokenKind::Equal) {
                        self.advance();
                        self.parse_precedence(PREC_ASSIGN);
                        let ic = self.alloc_ic_slot();
                        self.emit(Opcode::SetField);
                        self.emit_u16(ic);
                        self.emit_u32(name.index() as u32);
                        return true;
                    } else {
                        let ic = self.alloc_ic_slot();
                        self.emit(Opcode::GetField);
                        self.emit_u16(ic);
                        self.emit_u32(name.index() as u32);
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    self.expression();
                    self.expect_kind(&TokenKind::RightBracket, "expected ']'");
                    if can_assign && matches!(self.peek_kind(), TokenKind::Equal) {
                        self.advance();
                        self.parse_precedence(PREC_ASSIGN);
                        self.emit(Opcode::IndexSet);
                        return true;
                    } else {
                        self.emit(Opcode::IndexGet);
                    }
                }
                _ => break,
            }
        }
        false
    }

    fn call_args(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !matches!(self.peek_kind(), TokenKind::RightParen) {
            loop {
                self.parse_precedence(PREC_ASSIGN);
                argc += 1;
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RightParen, "expected ')'");
        if argc > 255 {
            self.error_here("too many arguments (max 255)");
            255
        } else {
            argc as u8
        }
    }

    fn array_literal(&mut self) {
        let mut count: u32 = 0;
        if !matches!(self.peek_kind(), TokenKind::RightBracket) {
            loop {
                self.parse_precedence(PREC_ASSIGN);
                count += 1;
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RightBracket, "expected ']'");
        if count > u16::MAX as u32 {
            self.error_here("too many array literal elements");
        }
        self.emit(Opcode::NewArray);
        self.emit_u16(count as u16);
    }

    fn dict_literal(&mut self) {
        let mut count: u32 = 0;
        if !matches!(self.peek_kind(), TokenKind::RightBrace) {
            loop {
                self.parse_precedence(PREC_ASSIGN);
                self.expect_kind(&TokenKind::Colon, "expected ':' in dict literal");
                self.parse_precedence(PREC_ASSIGN);
                count += 1;
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RightBrace, "expected '}'");
        if count > u16::MAX as u32 {
            self.error_here("too many dict literal entries");
        }
        self.emit(Opcode::NewDict);
        self.emit_u16(count as u16);
    }

    fn function_literal(&mut self) -> bool {
        let (func_ref, upvalues) = self.compile_function_body(None, false);
        self.emit_closure(func_ref, &upvalues);
        false
    }

    fn emit_closure(&mut self, func_ref: crate::object::ObjRef, upvalues: &[UpvalueDesc]) {
        let idx = self.chunk_mut().add_constant(Value::object(func_ref));
        self.emit(Opcode::Closure);
        self.emit_u16(idx);
        for up in upvalues {
            self.emit_u8(up.is_local as u8);
            self.emit_u8(up.index);
        }
    }

    // --------------------------------------------------------- functions

    fn push_func(&mut self, name: Option<String>, is_method: bool) {
        let slot0_name = if is_method { self.sym_self } else { self.sym_super_unused };
        let locals = vec![LocalVar { name: slot0_name, depth: 0, is_const: true, captured: false }];
        self.funcs.push(FuncState {
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            arity: 0,
            name,
            loops: Vec::new(),
            try_ctxs: Vec::new(),
            return_cascade: None,
        });
    }

    fn compile_function_body(&mut self, name: Option<String>, is_method: bool) -> (crate::object::ObjRef, Vec<UpvalueDesc>) {
        self.push_func(name, is_method);
        self.begin_scope();
        self.expect_kind(&TokenKind::LeftParen, "expected '(' after function name");
        let mut arity: u8 = 0;
        if !matches!(self.peek_kind(), TokenKind::RightParen) {
            loop {
                let pname = self.expect_identifier();
                self.declare_local(pname, false);
                if arity == u8::MAX {
                    self.error_here("too many parameters (max 255)");
                } else {
                    arity += 1;
                }
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RightParen, "expected ')'");
        self.funcs.last_mut().unwrap().arity = arity;
        self.emit_literal_value(Value::bool(false));
        let returning_sym = self.hidden_ident("$returning");
        let returning_slot = self.declare_local(returning_sym, false);
        self.emit_literal_value(Value::nil());
        let pending_sym = self.hidden_ident("$pending_return");
        let pending_slot = self.declare_local(pending_sym, false);
        self.funcs.last_mut().unwrap().return_cascade = Some((returning_slot, pending_slot));
        self.block_until(|k| matches!(k, TokenKind::End));
        self.expect_kind(&TokenKind::End, "expected 'end' to close function body");
        self.end_scope();
        self.emit_literal_value(Value::nil());
        self.emit(Opcode::Return);

        let mut state = self.funcs.pop().unwrap();
        let exception_table: Vec<ExceptionTableEntry> = std::mem::take(&mut state.chunk.exception_table);
        let func = RFunction {
            name: state.name,
            arity: state.arity,
            upvalue_count: state.upvalues.len() as u8,
            chunk: state.chunk,
            exception_table,
        };
        let obj = self.gc.allocate(ObjKind::Function(func));
        (obj, state.upvalues)
    }

    fn compile_script(&mut self) -> crate::object::ObjRef {
        self.push_func(None, false);
        while !matches!(self.peek_kind(), TokenKind::Eof) {
            self.declaration();
        }
        self.emit_literal_value(Value::nil());
        self.emit(Opcode::Return);
        let mut state = self.funcs.pop().unwrap();
        let exception_table: Vec<ExceptionTableEntry> = std::mem::take(&mut state.chunk.exception_table);
        let func = RFunction { name: None, arity: 0, upvalue_count: 0, chunk: state.chunk, exception_table };
        self.gc.allocate(ObjKind::Function(func))
    }

    // ------------------------------------------------------------ blocks

    fn block_until(&mut self, stop: impl Fn(&TokenKind) -> bool) {
        while !stop(self.peek_kind()) && !matches!(self.peek_kind(), TokenKind::Eof) {
            self.declaration();
        }
    }

    fn declaration(&mut self) {
        match self.peek_kind() {
            TokenKind::Let => self.var_decl(false),
            TokenKind::Const => self.var_decl(true),
            TokenKind::Fn => self.fn_decl(),
            TokenKind::Class => self.class_decl(),
            _ => self.statement(),
        }
    }

    fn statement(&mut self) {
        match self.peek_kind() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Match => self.match_statement(),
            TokenKind::Try => self.try_statement(),
            TokenKind::Throw => self.throw_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Return => self.return_statement(),
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit(Opcode::Pop);
    }

    // ------------------------------------------------------ declarations

    fn var_decl(&mut self, is_const: bool) {
        self.advance();
        let name = self.expect_identifier();
        self.expect_kind(&TokenKind::Equal, "expected '=' in variable declaration");
        self.expression();
        if self.is_top_level() {
            if is_const {
                self.global_consts.insert(name);
            }
            self.emit(Opcode::StoreGlobal);
            self.emit_u32(name.index() as u32);
            self.emit(Opcode::Pop);
        } else {
            self.declare_local(name, is_const);
        }
    }

    fn fn_decl(&mut self) {
        self.advance();
        let name = self.expect_identifier();
        let is_local = !self.is_top_level();
        if is_local {
            self.declare_local(name, false);
        }
        let name_str = self.interner.resolve(name).to_string();
        let (func_ref, upvalues) = self.compile_function_body(Some(name_str), false);
        self.emit_closure(func_ref, &upvalues);
        if !is_local {
            self.emit(Opcode::StoreGlobal);
            self.emit_u32(name.index() as u32);
            self.emit(Opcode::Pop);
        }
    }

    fn class_decl(&mut self) {
        self.advance();
        let name = self.expect_identifier();
        let is_top = self.is_top_level();
        let has_super = matches!(self.peek_kind(), TokenKind::Extends);
        if has_super {
            self.advance();
            let super_name = self.expect_identifier();
            self.resolve_and_load(super_name);
        }
        self.emit(Opcode::Class);
        self.emit_u32(name.index() as u32);
        if has_super {
            self.emit(Opcode::Inherit);
        }
        if !is_top {
            self.declare_local(name, false);
        }
        while matches!(self.peek_kind(), TokenKind::Fn) {
            self.advance();
            let method_name = self.expect_identifier();
            let method_name_str = self.interner.resolve(method_name).to_string();
            let (func_ref, upvalues) = self.compile_function_body(Some(method_name_str), true);
            self.emit_closure(func_ref, &upvalues);
            self.emit(Opcode::Method);
            self.emit_u32(method_name.index() as u32);
        }
        self.expect_kind(&TokenKind::End, "expected 'end' to close 'class'");
        if is_top {
            self.emit(Opcode::StoreGlobal);
            self.emit_u32(name.index() as u32);
            self.emit(Opcode::Pop);
        }
    }

    // ---------------------------------------------------------- if/while

    fn if_statement(&mut self) {
        self.advance();
        self.expression();
        if matches!(self.peek_kind(), TokenKind::Then) {
            self.advance();
        }
        let mut end_jumps = Vec::new();
        let mut next_jump = Some(self.emit_jump(Opcode::JmpIfFalse));
        self.begin_scope();
        self.block_until(|k| matches!(k, TokenKind::Elif | TokenKind::Else | TokenKind::End));
        self.end_scope();
        loop {
            match self.peek_kind().clone() {
                TokenKind::Elif => {
                    end_jumps.push(self.emit_jump(Opcode::Jmp));
                    if let Some(j) = next_jump.take() {
                        self.patch_jump(j);
                    }
                    self.advance();
                    self.expression();
                    if matches!(self.peek_kind(), TokenKind::Then) {
                        self.advance();
                    }
                    next_jump = Some(self.emit_jump(Opcode::JmpIfFalse));
                    self.begin_scope();
                    self.block_until(|k| matches!(k, TokenKind::Elif | TokenKind::Else | TokenKind::End));
                    self.end_scope();
                }
                TokenKind::Else => {
                    end_jumps.push(self.emit_jump(Opcode::Jmp));
                    if let Some(j) = next_jump.take() {
                        self.patch_jump(j);
                    }
                    self.advance();
                    self.begin_scope();
                    self.block_until(|k| matches!(k, TokenKind::End));
                    self.end_scope();
                    break;
                }
                _ => break,
            }
        }
        if let Some(j) = next_jump.take() {
            self.patch_jump(j);
        }
        for j in end_jumps {
            self.patch_jump(j);
        }
        self.expect_kind(&TokenKind::End, "expected 'end' to close 'if'");
    }

    fn while_statement(&mut self) {
        self.advance();
        let scope_depth = self.funcs.last().unwrap().scope_depth;
        let loop_start = self.chunk_mut().len();
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JmpIfFalse);
        if matches!(self.peek_kind(), TokenKind::Do) {
            self.advance();
        }
        self.push_loop(scope_depth);
        self.begin_scope();
        self.block_until(|k| matches!(k, TokenKind::End));
        self.end_scope();
        let loop_ctx = self.pop_loop();
        for j in &loop_ctx.continue_jumps {
            self.patch_jump(*j);
        }
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        for j in &loop_ctx.break_jumps {
            self.patch_jump(*j);
        }
        self.expect_kind(&TokenKind::End, "expected 'end' to close 'while'");
    }

    fn for_statement(&mut self) {
        self.advance();
        let var_name = self.expect_identifier();
        self.expect_kind(&TokenKind::In, "expected 'in' in for loop");
        self.begin_scope();
        self.parse_precedence(PREC_TERM + 1);
        if matches!(self.peek_kind(), TokenKind::DotDot) {
            self.advance();
            self.parse_precedence(PREC_TERM + 1);
            let var_slot = self.declare_local(var_name, false);
            let hi_sym = self.hidden_ident("$for_hi");
            let hi_slot = self.declare_local(hi_sym, false);
            let scope_depth = self.funcs.last().unwrap().scope_depth;
            self.expect_kind(&TokenKind::Do, "expected 'do'");
            let loop_start = self.chunk_mut().len();
            self.emit(Opcode::LoadLocal);
            self.emit_u16(var_slot);
            self.emit(Opcode::LoadLocal);
            self.emit_u16(hi_slot);
            let exit_jump = self.emit_jump(Opcode::JmpIfGe);
            self.push_loop(scope_depth);
            self.begin_scope();
            self.block_until(|k| matches!(k, TokenKind::End));
            self.end_scope();
            let loop_ctx = self.pop_loop();
            for j in &loop_ctx.continue_jumps {
                self.patch_jump(*j);
            }
            self.emit(Opcode::LoadLocal);
            self.emit_u16(var_slot);
            self.emit_literal_value(Value::int(1));
            self.emit(Opcode::AddII);
            self.emit(Opcode::StoreLocal);
            self.emit_u16(var_slot);
            self.emit(Opcode::Pop);
            self.emit_loop(loop_start);
            self.patch_jump(exit_jump);
            for j in &loop_ctx.break_jumps {
                self.patch_jump(*j);
            }
            self.expect_kind(&TokenKind::End, "expected 'end' to close 'for'");
        } else {
            let coll_sym = self.hidden_ident("$for_coll");
            let coll_slot = self.declare_local(coll_sym, false);
            self.emit_literal_value(Value::int(0));
            let idx_sym = self.hidden_ident("$for_idx");
            let idx_slot = self.declare_local(idx_sym, false);
            self.emit_literal_value(Value::nil());
            let var_slot = self.declare_local(var_name, false);
            let scope_depth = self.funcs.last().unwrap().scope_depth;
            self.expect_kind(&TokenKind::Do, "expected 'do'");
            let loop_start = self.chunk_mut().len();
            self.emit(Opcode::LoadLocal);
            self.emit_u16(idx_slot);
            self.emit(Opcode::LoadLocal);
            self.emit_u16(coll_slot);
            self.emit(Opcode::CallNative);
            self.emit_u16(native::NATIVE_LEN);
            self.emit_u8(1);
            let exit_jump = self.emit_jump(Opcode::JmpIfGe);
            self.emit(Opcode::LoadLocal);
            self.emit_u16(coll_slot);
            self.emit(Opcode::LoadLocal);
            self.emit_u16(idx_slot);
            self.emit(Opcode::IndexGet);
            self.emit(Opcode::StoreLocal);
            self.emit_u16(var_slot);
            self.emit(Opcode::Pop);
            self.push_loop(scope_depth);
            self.begin_scope();
            self.block_until(|k| matches!(k, TokenKind::End));
            self.end_scope();
            let loop_ctx = self.pop_loop();
            for j in &loop_ctx.continue_jumps {
                self.patch_jump(*j);
            }
            self.emit(Opcode::LoadLocal);
            self.emit_u16(idx_slot);
            self.emit_literal_value(Value::int(1));
            self.emit(Opcode::AddII);
            self.emit(Opcode::StoreLocal);
            self.emit_u16(idx_slot);
            self.emit(Opcode::Pop);
            self.emit_loop(loop_start);
            self.patch_jump(exit_jump);
            for j in &loop_ctx.break_jumps {
                self.patch_jump(*j);
            }
            self.expect_kind(&TokenKind::End, "expected 'end' to close 'for'");
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.advance();
        if self.funcs.last().unwrap().loops.is_empty() {
            self.errors.push(CompileError::InvalidBreak);
            return;
        }
        let target_depth = self.funcs.last().unwrap().loops.last().unwrap().scope_depth;
        self.emit_scope_pops_down_to(target_depth);
        let jump = self.emit_jump(Opcode::Jmp);
        self.funcs.last_mut().unwrap().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.advance();
        if self.funcs.last().unwrap().loops.is_empty() {
            self.errors.push(CompileError::InvalidContinue);
            return;
        }
        let target_depth = self.funcs.last().unwrap().loops.last().unwrap().scope_depth;
        self.emit_scope_pops_down_to(target_depth);
        let jump = self.emit_jump(Opcode::Jmp);
        self.funcs.last_mut().unwrap().loops.last_mut().unwrap().continue_jumps.push(jump);
    }

    fn return_statement(&mut self) {
        self.advance();
        if self.is_top_level() {
            self.errors.push(CompileError::InvalidReturn);
        }
        let in_try = !self.funcs.last().unwrap().try_ctxs.is_empty();
        if matches!(self.peek_kind(), TokenKind::End | TokenKind::Else | TokenKind::Elif | TokenKind::Case | TokenKind::Default | TokenKind::Catch | TokenKind::Finally | TokenKind::Eof) {
            self.emit_literal_value(Value::nil());
            self.finish_return(in_try);
            return;
        }
        self.expression();
        if in_try {
            // A tail call would reuse this frame and never come back to
            // run the enclosing try's `finally` — not safe to convert.
            self.finish_return(true);
            return;
        }
        let len = self.chunk_mut().len();
        let last_is_call = len >= 2 && self.chunk_mut().code[len - 2] == Opcode::Call as u8;
        if last_is_call {
            let call_offset = len - 2;
            self.chunk_mut().code[call_offset] = Opcode::TailCall as u8;
        } else {
            self.emit(Opcode::Return);
        }
    }

    /// Emits a plain `Return` when not inside a `try`, or otherwise stows
    /// the return value and redirects through the innermost enclosing
    /// `try`'s `finally`/epilogue (see `try_statement`'s cascade check),
    /// so `finally` always runs exactly once before control actually
    /// leaves the function (spec §7).
    fn finish_return(&mut self, in_try: bool) {
        if !in_try {
            self.emit(Opcode::Return);
            return;
        }
        // `return_cascade` is only absent for the top-level script, where
        // `return` is already an `InvalidReturn` compile error; fall back
        // to a plain `Return` rather than panic on that already-invalid
        // program.
        let Some((returning_slot, pending_slot)) = self.funcs.last().unwrap().return_cascade else {
            self.emit(Opcode::Return);
            return;
        };
        // Stow the return value first: `StoreLocal` writes into the slot
        // without popping, so the expression's value is safely copied into
        // `$pending_return` (a slot below the try's own scope) before the
        // `Pop` below discards the now-redundant copy still on top.
        self.emit(Opcode::StoreLocal);
        self.emit_u16(pending_slot);
        self.emit(Opcode::Pop);
        // Only now is the stack top clear of anything load-bearing, so
        // locals declared in scopes nested inside this try (including the
        // catch binding) can be popped the same way `break`/`continue` pop
        // back to their loop's entry depth.
        let target_depth = self.funcs.last().unwrap().try_ctxs.last().unwrap().scope_depth;
        self.emit_scope_pops_down_to(target_depth);
        self.emit_literal_value(Value::bool(true));
        self.emit(Opcode::StoreLocal);
        self.emit_u16(returning_slot);
        self.emit(Opcode::Pop);
        let jump = self.emit_jump(Opcode::Jmp);
        self.funcs.last_mut().unwrap().try_ctxs.last_mut().unwrap().return_jumps.push(jump);
    }

    /// Runs after a `try`'s `finally` (or immediately after its `catch` if
    /// there is no `finally`): if a `return` inside the try/catch body
    /// redirected here, either performs the real `Return` now (no more
    /// enclosing `try`) or redirects again to the next enclosing `try`'s
    /// own `finally`/epilogue, so `finally` blocks nest correctly and each
    /// runs exactly once (spec §7).
    fn emit_return_cascade_epilogue(&mut self) {
        let Some((returning_slot, pending_slot)) = self.funcs.last().unwrap().return_cascade else {
            return;
        };
        self.emit(Opcode::LoadLocal);
        self.emit_u16(returning_slot);
        let skip = self.emit_jump(Opcode::JmpIfFalse);
        if self.funcs.last().unwrap().try_ctxs.is_empty() {
            self.emit(Opcode::LoadLocal);
            self.emit_u16(pending_slot);
            self.emit(Opcode::Return);
        } else {
            // Redirecting further out: the next enclosing try's own body
            // locals are still live at this depth (its `end_scope` calls
            // already ran while compiling past it) and were never popped
            // by this cascade, so pop down to its depth before jumping to
            // its `finally`/epilogue.
            let outer_depth = self.funcs.last().unwrap().try_ctxs.last().unwrap().scope_depth;
            self.emit_scope_pops_down_to(outer_depth);
            let jump = self.emit_jump(Opcode::Jmp);
            self.funcs.last_mut().unwrap().try_ctxs.last_mut().unwrap().return_jumps.push(jump);
        }
        self.patch_jump(skip);
    }

    fn throw_statement(&mut self) {
        self.advance();
        self.expression();
        self.emit(Opcode::Throw);
    }

    fn try_statement(&mut self) {
        self.advance();
        let try_start = self.chunk_mut().len() as u32;
        let stack_depth = self.funcs.last().unwrap().locals.len() as u32;
        let enclosing_depth = self.funcs.last().unwrap().scope_depth;
        self.funcs.last_mut().unwrap().try_ctxs.push(TryCtx { return_jumps: Vec::new(), scope_depth: enclosing_depth });
        self.begin_scope();
        self.block_until(|k| matches!(k, TokenKind::Catch | TokenKind::Finally | TokenKind::End));
        self.end_scope();
        let try_end = self.chunk_mut().len() as u32;
        let skip_catch = self.emit_jump(Opcode::Jmp);
        let handler_pc = self.chunk_mut().len() as u32;
        self.expect_kind(&TokenKind::Catch, "expected 'catch' after 'try' block");
        self.begin_scope();
        if let TokenKind::Identifier(sym) = self.peek_kind().clone() {
            self.advance();
            self.declare_local(sym, false);
        } else {
            self.emit(Opcode::Pop);
        }
        self.block_until(|k| matches!(k, TokenKind::Finally | TokenKind::End));
        self.end_scope();
        self.patch_jump(skip_catch);
        // Every `return` lexically inside the try/catch body above jumped
        // here instead of returning directly; this is the start of
        // `finally` if there is one, or the cascade epilogue immediately
        // below if there isn't — either way `finish_return`'s redirect
        // lands in the right place.
        let finally_pc = self.chunk_mut().len() as u32;
        let this_try = self.funcs.last_mut().unwrap().try_ctxs.pop().unwrap();
        for jump in &this_try.return_jumps {
            self.patch_jump(*jump);
        }
        if matches!(self.peek_kind(), TokenKind::Finally) {
            self.advance();
            self.begin_scope();
            self.block_until(|k| matches!(k, TokenKind::End));
            self.end_scope();
        }
        self.emit_return_cascade_epilogue();
        self.expect_kind(&TokenKind::End, "expected 'end' to close 'try'");
        self.chunk_mut().exception_table.push(ExceptionTableEntry {
            try_start,
            try_end,
            handler_pc: Some(handler_pc),
            finally_pc: Some(finally_pc),
            stack_depth,
        });
    }

    fn match_statement(&mut self) {
        self.advance();
        self.expression();
        self.begin_scope();
        let subj_sym = self.hidden_ident("$match_subject");
        let subject_slot = self.declare_local(subj_sym, false);
        let mut end_jumps = Vec::new();
        while matches!(self.peek_kind(), TokenKind::Case) {
            self.advance();
            self.begin_scope();
            let next_jump = self.compile_case_pattern(subject_slot);
            self.block_until(|k| matches!(k, TokenKind::Case | TokenKind::Default | TokenKind::End));
            self.end_scope();
            end_jumps.push(self.emit_jump(Opcode::Jmp));
            if let Some(j) = next_jump {
                self.patch_jump(j);
            }
        }
        if matches!(self.peek_kind(), TokenKind::Default) {
            self.advance();
            self.begin_scope();
            self.block_until(|k| matches!(k, TokenKind::End));
            self.end_scope();
        }
        for j in end_jumps {
            self.patch_jump(j);
        }
        self.expect_kind(&TokenKind::End, "expected 'end' to close 'match'");
        self.end_scope();
    }

    fn compile_case_pattern(&mut self, subject_slot: u16) -> Option<usize> {
        match self.peek_kind().clone() {
            TokenKind::Underscore => {
                self.advance();
                None
            }
            TokenKind::Identifier(sym) => {
                self.advance();
                self.emit(Opcode::LoadLocal);
                self.emit_u16(subject_slot);
                self.declare_local(sym, false);
                None
            }
            _ => {
                self.parse_precedence(PREC_UNARY);
                self.emit(Opcode::LoadLocal);
                self.emit_u16(subject_slot);
                self.emit(Opcode::Eq);
                Some(self.emit_jump(Opcode::JmpIfFalse))
            }
        }
    }
}
