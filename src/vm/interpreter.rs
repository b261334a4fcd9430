//! The bytecode interpreter (spec §4.4): a fetch-decode-execute loop over
//! `Opcode`, grounded in `raya-engine/src/vm/vm/interpreter.rs`'s call-frame
//! and dispatch structure, adapted to this crate's NaN-boxed `Value` and
//! single `ObjKind` tagged-union object model.
//!
//! Tail calls reuse the current `Frame` (spec §4.4: O(1) stack space);
//! everything else pushes/pops one `Frame` per activation. Exceptions
//! unwind by walking `frames` from the top down, consulting each frame's
//! function's exception table for the innermost enclosing `try`.

use crate::bytecode::opcode::Opcode;
use crate::gc::collector::GarbageCollector;
use crate::gc::roots::RootSet;
use crate::interner::{Interner, Symbol};
use crate::object::{ObjKind, ObjRef, RClosure, RFunction, RInstance, RUpvalue, UpvalueState};
use crate::value::Value;
use crate::vm::error::VmError;
use crate::vm::frame::Frame;
use crate::vm::ic::InlineCache;
use crate::vm::strings::StringTable;
use rustc_hash::FxHashMap;

/// Runtime knobs (spec §5/§6), layered: library defaults, then `-d`/`-j`/
/// `-i` CLI flags, then `PSEUDOCODE_GC_GROWTH` for the growth factor.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub jit_enabled: bool,
    /// Maximum live call-frame depth before `VmError::StackOverflow`.
    pub stack_limit: usize,
    pub debug: bool,
    pub gc_growth: f64,
    /// Forces a full collection after every instruction instead of only
    /// when `GarbageCollector::should_collect()` trips (spec §7's GC
    /// safety invariant: this must never change a program's behavior).
    /// Off by default — this is a correctness-test knob, not something a
    /// real program wants paying a full mark-and-sweep per opcode for.
    pub stress_gc: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            jit_enabled: cfg!(feature = "jit"),
            stack_limit: 1024,
            debug: false,
            gc_growth: 2.0,
            stress_gc: false,
        }
    }
}

impl VmOptions {
    /// Layers `PSEUDOCODE_GC_GROWTH` over the library defaults.
    /// `PSEUDOCODE_PATH` is read by the CLI's module loader, not here: this
    /// single-file core has no import resolution to point it at (spec §5).
    pub fn from_env() -> Self {
        let mut opts = VmOptions::default();
        if let Ok(raw) = std::env::var("PSEUDOCODE_GC_GROWTH") {
            if let Some(g) = crate::vm::parse_gc_growth(&raw) {
                opts.gc_growth = g;
            }
        }
        opts
    }
}

/// Internal control-transfer signal distinct from `VmError`: a `throw`
/// carries an arbitrary user [`Value`], not just the host fault categories.
enum Unwind {
    Error(VmError),
    Thrown(Value),
}

impl From<VmError> for Unwind {
    fn from(e: VmError) -> Self {
        Unwind::Error(e)
    }
}

pub struct Vm {
    pub gc: GarbageCollector,
    pub strings: StringTable,
    pub interner: Interner,
    pub options: VmOptions,
    globals: FxHashMap<Symbol, Value>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Upvalues still pointing at a live stack slot, i.e. not yet closed.
    /// Spec §3 models this as an intrusive chain (`RUpvalue::next_open`);
    /// this flat `Vec` gives the same find-or-create/close-range behavior
    /// without threading that chain through allocation, at the cost of a
    /// linear scan — cheap in practice since few upvalues are open at once.
    open_upvalues: Vec<ObjRef>,
    sym_init: Symbol,
    #[cfg(feature = "jit")]
    jit_engine: crate::jit::JitEngine,
}

impl Vm {
    pub fn new(mut interner: Interner, mut gc: GarbageCollector, strings: StringTable, options: VmOptions) -> Self {
        let sym_init = interner.intern("init");
        gc.set_growth_factor(options.gc_growth);
        Vm {
            gc,
            strings,
            interner,
            options,
            globals: FxHashMap::default(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            open_upvalues: Vec::new(),
            sym_init,
            #[cfg(feature = "jit")]
            jit_engine: crate::jit::JitEngine::new(),
        }
    }

    /// Runs a freshly compiled script to completion, returning the value of
    /// its final (implicit-`nil`) return.
    pub fn run(&mut self, script: ObjRef) -> Result<Value, VmError> {
        let closure = self.gc.allocate(ObjKind::Closure(RClosure { function: script, upvalues: Vec::new() }));
        self.stack.push(Value::object(closure));
        let ic_slot_count = self.with_function(closure, |f| f.chunk.ic_slot_count);
        self.frames.push(Frame::new(closure, 0, ic_slot_count));
        loop {
            match self.step() {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(unwind) => self.handle_unwind(unwind)?,
            }
            if self.options.stress_gc {
                self.collect_now();
            }
        }
    }

    // ------------------------------------------------------ bytecode reads

    fn with_function<R>(&self, closure: ObjRef, f: impl FnOnce(&RFunction) -> R) -> R {
        let func_obj = closure.as_closure().expect("callee must reference a closure").function;
        match func_obj.kind() {
            ObjKind::Function(func) => f(func),
            _ => unreachable!("closure.function must reference a Function object"),
        }
    }

    fn read_u8(&self, closure: ObjRef, ip: usize) -> u8 {
        self.with_function(closure, |f| f.chunk.read_u8(ip))
    }
    fn read_u16(&self, closure: ObjRef, ip: usize) -> u16 {
        self.with_function(closure, |f| f.chunk.read_u16(ip))
    }
    fn read_u32(&self, closure: ObjRef, ip: usize) -> u32 {
        self.with_function(closure, |f| f.chunk.read_u32(ip))
    }
    fn read_i32(&self, closure: ObjRef, ip: usize) -> i32 {
        self.with_function(closure, |f| f.chunk.read_i32(ip))
    }
    fn constant(&self, closure: ObjRef, idx: u16) -> Value {
        self.with_function(closure, |f| f.chunk.constants[idx as usize])
    }

    fn current_closure(&self) -> ObjRef {
        self.frames.last().unwrap().closure
    }
    fn current_base(&self) -> usize {
        self.frames.last().unwrap().base_ptr
    }

    // ------------------------------------------------------------ dispatch

    /// Executes exactly one instruction. `Ok(Some(v))` means the top-level
    /// frame just returned `v`; `Ok(None)` means keep looping.
    fn step(&mut self) -> Result<Option<Value>, Unwind> {
        let closure = self.current_closure();
        let mut ip = self.frames.last().unwrap().ip;
        let byte = self.read_u8(closure, ip);
        ip += 1;
        let op = Opcode::from_u8(byte).expect("corrupt bytecode: unrecognized opcode byte");
        if self.options.debug {
            eprintln!("[vm] ip={} frame={} op={:?} stack_depth={}", ip - 1, self.frames.len() - 1, op, self.stack.len());
        }

        use Opcode::*;
        match op {
            Nop => {}
            Pop => {
                self.stack.pop();
            }
            Dup => {
                let v = *self.stack.last().expect("stack underflow on Dup");
                self.stack.push(v);
            }
            Const => {
                let idx = self.read_u16(closure, ip);
                ip += 2;
                self.stack.push(self.constant(closure, idx));
            }
            ConstNil => self.stack.push(Value::nil()),
            ConstTrue => self.stack.push(Value::bool(true)),
            ConstFalse => self.stack.push(Value::bool(false)),
            ConstInt => {
                let v = self.read_i32(closure, ip);
                ip += 4;
                self.stack.push(Value::int(v));
            }

            LoadLocal => {
                let slot = self.read_u16(closure, ip) as usize;
                ip += 2;
                let base = self.current_base();
                self.stack.push(self.stack[base + slot]);
            }
            StoreLocal => {
                let slot = self.read_u16(closure, ip) as usize;
                ip += 2;
                let base = self.current_base();
                let v = *self.stack.last().expect("stack underflow on StoreLocal");
                self.stack[base + slot] = v;
            }
            LoadGlobal => {
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let v = self
                    .globals
                    .get(&sym)
                    .copied()
                    .ok_or_else(|| VmError::UndefinedGlobal { name: self.interner.resolve(sym).to_string() })?;
                self.stack.push(v);
            }
            StoreGlobal => {
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let v = *self.stack.last().expect("stack underflow on StoreGlobal");
                self.globals.insert(sym, v);
            }
            LoadUpvalue => {
                let idx = self.read_u8(closure, ip) as usize;
                ip += 1;
                let up = closure.as_closure().unwrap().upvalues[idx];
                self.stack.push(self.read_upvalue(up));
            }
            StoreUpvalue => {
                let idx = self.read_u8(closure, ip) as usize;
                ip += 1;
                let up = closure.as_closure().unwrap().upvalues[idx];
                let v = *self.stack.last().expect("stack underflow on StoreUpvalue");
                self.write_upvalue(up, v);
            }

            Add => {
                let (a, b) = self.pop2();
                let r = self.rt_add(a, b)?;
                self.stack.push(r);
            }
            Sub => {
                let (a, b) = self.pop2();
                self.stack.push(rt_numeric(a, b, |x, y| x - y, |x, y| x.checked_sub(y))?);
            }
            Mul => {
                let (a, b) = self.pop2();
                self.stack.push(rt_numeric(a, b, |x, y| x * y, |x, y| x.checked_mul(y))?);
            }
            Div => {
                let (a, b) = self.pop2();
                self.stack.push(rt_div(a, b)?);
            }
            Mod => {
                let (a, b) = self.pop2();
                self.stack.push(rt_mod(a, b)?);
            }
            Neg => {
                let a = self.stack.pop().expect("stack underflow on Neg");
                self.stack.push(rt_neg(a)?);
            }
            AddII => {
                let (a, b) = self.pop2();
                self.stack.push(rt_numeric(a, b, |x, y| x + y, |x, y| x.checked_add(y))?);
            }
            SubII => {
                let (a, b) = self.pop2();
                self.stack.push(rt_numeric(a, b, |x, y| x - y, |x, y| x.checked_sub(y))?);
            }
            MulII => {
                let (a, b) = self.pop2();
                self.stack.push(rt_numeric(a, b, |x, y| x * y, |x, y| x.checked_mul(y))?);
            }
            DivII => {
                let (a, b) = self.pop2();
                self.stack.push(rt_div(a, b)?);
            }
            ModII => {
                let (a, b) = self.pop2();
                self.stack.push(rt_mod(a, b)?);
            }
            NegI => {
                let a = self.stack.pop().expect("stack underflow on NegI");
                self.stack.push(rt_neg(a)?);
            }

            Eq => {
                let (a, b) = self.pop2();
                self.stack.push(Value::bool(crate::vm::values_structurally_equal(a, b)));
            }
            Ne => {
                let (a, b) = self.pop2();
                self.stack.push(Value::bool(!crate::vm::values_structurally_equal(a, b)));
            }
            Lt => {
                let (a, b) = self.pop2();
                self.stack.push(rt_cmp(a, b, |x, y| x < y)?);
            }
            Gt => {
                let (a, b) = self.pop2();
                self.stack.push(rt_cmp(a, b, |x, y| x > y)?);
            }
            Le => {
                let (a, b) = self.pop2();
                self.stack.push(rt_cmp(a, b, |x, y| x <= y)?);
            }
            Ge => {
                let (a, b) = self.pop2();
                self.stack.push(rt_cmp(a, b, |x, y| x >= y)?);
            }
            Not => {
                let a = self.stack.pop().expect("stack underflow on Not");
                self.stack.push(Value::bool(!a.is_truthy()));
            }
            TypeOf => {
                let a = self.stack.pop().expect("stack underflow on TypeOf");
                let obj = self.strings.intern(&mut self.gc, a.type_name());
                self.stack.push(Value::object(obj));
            }

            Jmp => {
                let delta = self.read_i32(closure, ip);
                ip = (ip as i64 + 4 + delta as i64) as usize;
            }
            JmpIfFalse => {
                let delta = self.read_i32(closure, ip);
                ip += 4;
                let cond = self.stack.pop().expect("stack underflow on JmpIfFalse");
                if !cond.is_truthy() {
                    ip = (ip as i64 + delta as i64) as usize;
                }
            }
            JmpIfTrue => {
                let delta = self.read_i32(closure, ip);
                ip += 4;
                let cond = self.stack.pop().expect("stack underflow on JmpIfTrue");
                if cond.is_truthy() {
                    ip = (ip as i64 + delta as i64) as usize;
                }
            }
            Loop => {
                let delta = self.read_u32(closure, ip) as i64;
                let target = (ip as i64 + 4 - delta) as usize;
                ip = target;
                #[cfg(feature = "jit")]
                if self.options.jit_enabled {
                    let function_obj = closure.as_closure().expect("callee must reference a closure").function;
                    let chunk = match function_obj.kind() {
                        ObjKind::Function(f) => &f.chunk,
                        _ => unreachable!("closure.function must reference a Function object"),
                    };
                    let base = self.current_base();
                    let outcome = self.jit_engine.on_back_edge(&mut self.gc, function_obj, chunk, target as u32, &mut self.stack, base);
                    if let crate::jit::BackEdgeOutcome::Resume(resume_pc) = outcome {
                        ip = resume_pc as usize;
                    }
                }
            }
            JmpIfLt | JmpIfLe | JmpIfGt | JmpIfGe | JmpIfEq | JmpIfNe => {
                let delta = self.read_i32(closure, ip);
                ip += 4;
                let (a, b) = self.pop2();
                let take = match op {
                    JmpIfLt => rt_cmp_bool(a, b, |x, y| x < y)?,
                    JmpIfLe => rt_cmp_bool(a, b, |x, y| x <= y)?,
                    JmpIfGt => rt_cmp_bool(a, b, |x, y| x > y)?,
                    JmpIfGe => rt_cmp_bool(a, b, |x, y| x >= y)?,
                    JmpIfEq => crate::vm::values_structurally_equal(a, b),
                    JmpIfNe => !crate::vm::values_structurally_equal(a, b),
                    _ => unreachable!(),
                };
                if take {
                    ip = (ip as i64 + delta as i64) as usize;
                }
            }

            Call => {
                let argc = self.read_u8(closure, ip);
                ip += 1;
                self.frames.last_mut().unwrap().ip = ip;
                let base = self.stack.len() - argc as usize - 1;
                self.do_call(base, argc)?;
                return Ok(None);
            }
            TailCall => {
                let argc = self.read_u8(closure, ip) as usize;
                ip += 1;
                self.frames.last_mut().unwrap().ip = ip;
                let base = self.current_base();
                self.close_upvalues_from(base);
                let call_start = self.stack.len() - argc - 1;
                let tail: Vec<Value> = self.stack.drain(call_start..).collect();
                self.stack.truncate(base);
                self.stack.extend(tail);
                self.frames.pop();
                self.do_call(base, argc as u8)?;
                return Ok(None);
            }
            Return => {
                let retval = self.stack.pop().expect("stack underflow on Return");
                let frame = self.frames.pop().expect("Return with no active frame");
                self.close_upvalues_from(frame.base_ptr);
                self.stack.truncate(frame.base_ptr);
                let result = frame.constructor_result.unwrap_or(retval);
                if self.frames.is_empty() {
                    return Ok(Some(result));
                }
                self.stack.push(result);
                return Ok(None);
            }
            Closure => {
                let fn_idx = self.read_u16(closure, ip);
                ip += 2;
                let func_val = self.constant(closure, fn_idx);
                let func_obj = func_val.as_object().expect("Closure operand must be a Function constant");
                let upvalue_count = self.with_function(func_obj, |f| f.upvalue_count);
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.read_u8(closure, ip) != 0;
                    let index = self.read_u8(closure, ip + 1);
                    ip += 2;
                    if is_local {
                        let base = self.current_base();
                        upvalues.push(self.capture_upvalue(base + index as usize));
                    } else {
                        upvalues.push(closure.as_closure().unwrap().upvalues[index as usize]);
                    }
                }
                self.maybe_collect();
                let new_closure = self.gc.allocate(ObjKind::Closure(RClosure { function: func_obj, upvalues }));
                self.stack.push(Value::object(new_closure));
            }
            CloseUpvalue => {
                let slot = self.read_u16(closure, ip) as usize;
                ip += 2;
                let base = self.current_base();
                self.close_upvalues_from(base + slot);
            }
            Throw => {
                let v = self.stack.pop().expect("stack underflow on Throw");
                return Err(Unwind::Thrown(v));
            }

            NewArray => {
                let count = self.read_u16(closure, ip) as usize;
                ip += 2;
                let start = self.stack.len() - count;
                let elems: Vec<Value> = self.stack.split_off(start);
                self.maybe_collect();
                let obj = self.gc.allocate(ObjKind::Array(crate::object::RArray::with_elements(elems)));
                self.stack.push(Value::object(obj));
            }
            NewDict => {
                let count = self.read_u16(closure, ip) as usize;
                ip += 2;
                let start = self.stack.len() - count * 2;
                let flat: Vec<Value> = self.stack.split_off(start);
                self.maybe_collect();
                let mut dict = crate::object::RDict::new();
                for pair in flat.chunks_exact(2) {
                    dict.insert(pair[0], pair[1]);
                }
                let obj = self.gc.allocate(ObjKind::Dict(dict));
                self.stack.push(Value::object(obj));
            }
            IndexGet | IndexFastGet => {
                let (container, index) = self.pop2();
                self.stack.push(self.rt_index_get(container, index)?);
            }
            IndexSet => {
                let value = self.stack.pop().expect("stack underflow on IndexSet");
                let index = self.stack.pop().expect("stack underflow on IndexSet");
                let container = self.stack.pop().expect("stack underflow on IndexSet");
                self.rt_index_set(container, index, value)?;
                self.stack.push(value);
            }
            GetField => {
                let ic_slot = self.read_u16(closure, ip);
                ip += 2;
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let instance = self.stack.pop().expect("stack underflow on GetField");
                let v = self.rt_get_field(instance, sym, ic_slot)?;
                self.stack.push(v);
            }
            SetField => {
                let ic_slot = self.read_u16(closure, ip);
                ip += 2;
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let value = self.stack.pop().expect("stack underflow on SetField");
                let instance = self.stack.pop().expect("stack underflow on SetField");
                self.rt_set_field(instance, sym, value, ic_slot)?;
                self.stack.push(value);
            }
            Invoke => {
                let _ic_slot = self.read_u16(closure, ip);
                ip += 2;
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let argc = self.read_u8(closure, ip);
                ip += 1;
                self.frames.last_mut().unwrap().ip = ip;
                let base = self.stack.len() - argc as usize - 1;
                self.do_invoke(base, argc, sym)?;
                return Ok(None);
            }
            Class => {
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let name = self.interner.resolve(sym).to_string();
                self.maybe_collect();
                let obj = self.gc.allocate(ObjKind::Class(crate::object::RClass::new(name, None)));
                self.stack.push(Value::object(obj));
            }
            Method => {
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let method_val = self.stack.pop().expect("stack underflow on Method");
                let method_obj = method_val.as_object().expect("Method operand must be a closure");
                let class_val = *self.stack.last().expect("Method with no class on stack");
                let mut class_obj = class_val.as_object().expect("Method target must be a class");
                class_obj.as_class_mut().expect("Method target must be a class").set_method(sym, method_obj);
            }
            Inherit => {
                let sub_val = self.stack.pop().expect("stack underflow on Inherit (subclass)");
                let super_val = self.stack.pop().expect("stack underflow on Inherit (superclass)");
                let mut sub = sub_val.as_object().expect("Inherit subclass must be a class");
                let sup = super_val.as_object().expect("Inherit superclass must be a class");
                let (fields, version) = {
                    let sup_class = sup.as_class().ok_or_else(|| VmError::TypeMismatch {
                        expected: "class".into(),
                        got: super_val.type_name().to_string(),
                    })?;
                    (sup_class.fields.clone(), sup_class.version)
                };
                {
                    let sub_class = sub.as_class_mut().ok_or_else(|| VmError::TypeMismatch {
                        expected: "class".into(),
                        got: sub_val.type_name().to_string(),
                    })?;
                    sub_class.superclass = Some(sup);
                    sub_class.fields = fields;
                    sub_class.version = version;
                }
                self.stack.push(Value::object(sub));
            }
            GetSuper => {
                let _ic_slot = self.read_u16(closure, ip);
                ip += 2;
                let sym = Symbol::from_raw(self.read_u32(closure, ip));
                ip += 4;
                let self_val = self.stack.pop().expect("stack underflow on GetSuper");
                let v = self.rt_get_super(self_val, sym)?;
                self.stack.push(v);
            }

            CallNative => {
                let id = self.read_u16(closure, ip);
                ip += 2;
                let argc = self.read_u8(closure, ip) as usize;
                ip += 1;
                let start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack.split_off(start);
                let result = crate::vm::native::call(id, &args, &mut self.gc, &mut self.strings)?;
                self.stack.push(result);
            }
        }

        self.frames.last_mut().unwrap().ip = ip;
        Ok(None)
    }

    fn pop2(&mut self) -> (Value, Value) {
        let b = self.stack.pop().expect("stack underflow (rhs)");
        let a = self.stack.pop().expect("stack underflow (lhs)");
        (a, b)
    }

    // -------------------------------------------------------------- calls

    fn do_call(&mut self, base: usize, argc: u8) -> Result<(), Unwind> {
        let callee = self.stack[base];
        let Some(obj) = callee.as_object() else {
            return Err(VmError::NotCallable { got: callee.type_name().to_string() }.into());
        };
        match obj.kind() {
            ObjKind::Closure(_) => self.push_call_frame(obj, base, None),
            ObjKind::Class(_) => self.instantiate(obj, base, argc as usize),
            ObjKind::BoundMethod(bm) => {
                let (receiver, method) = (bm.receiver, bm.method);
                self.stack[base] = receiver;
                self.push_call_frame(method, base, None)
            }
            _ => Err(VmError::NotCallable { got: callee.type_name().to_string() }.into()),
        }
    }

    fn do_invoke(&mut self, base: usize, argc: u8, name: Symbol) -> Result<(), Unwind> {
        let receiver = self.stack[base];
        let Some(obj) = receiver.as_object() else {
            return Err(VmError::TypeMismatch { expected: "instance".into(), got: receiver.type_name().to_string() }.into());
        };
        let class = match obj.kind() {
            ObjKind::Instance(inst) => inst.class,
            _ => {
                return Err(VmError::TypeMismatch { expected: "instance".into(), got: receiver.type_name().to_string() }.into())
            }
        };
        let method = class
            .as_class()
            .and_then(|c| c.resolve_method(name))
            .ok_or_else(|| VmError::UndefinedField { name: self.interner.resolve(name).to_string() })?;
        let _ = argc;
        self.push_call_frame(method.closure, base, None)
    }

    fn push_call_frame(&mut self, closure: ObjRef, base: usize, constructor_result: Option<Value>) -> Result<(), Unwind> {
        let argc = self.stack.len() - base - 1;
        let (arity, ic_slot_count) = self.with_function(closure, |f| (f.arity as usize, f.chunk.ic_slot_count));
        if argc != arity {
            return Err(VmError::ArityMismatch { expected: arity, got: argc }.into());
        }
        if self.frames.len() >= self.options.stack_limit {
            return Err(VmError::StackOverflow.into());
        }
        let mut frame = Frame::new(closure, base, ic_slot_count);
        frame.constructor_result = constructor_result;
        self.frames.push(frame);
        Ok(())
    }

    /// `new C(args)`: allocates the instance, then — if `C` (or an
    /// ancestor) defines `init` — runs it as if invoked on the instance,
    /// substituting the instance for whatever `init` returns.
    fn instantiate(&mut self, class: ObjRef, base: usize, argc: usize) -> Result<(), Unwind> {
        let (field_count, init, version) = {
            let c = class.as_class().expect("instantiate called on a non-class");
            (c.fields.len(), c.resolve_method(self.sym_init), c.version)
        };
        self.maybe_collect();
        let instance = self.gc.allocate(ObjKind::Instance(RInstance {
            class,
            fields: vec![Value::nil(); field_count],
            class_version_at_alloc: version,
        }));
        let instance_val = Value::object(instance);
        match init {
            Some(m) => {
                self.stack[base] = instance_val;
                self.push_call_frame(m.closure, base, Some(instance_val))
            }
            None => {
                if argc != 0 {
                    return Err(VmError::ArityMismatch { expected: 0, got: argc }.into());
                }
                self.stack.truncate(base);
                self.stack.push(instance_val);
                Ok(())
            }
        }
    }

    // ----------------------------------------------------------- fields

    fn rt_get_field(&mut self, recv: Value, name: Symbol, ic_slot: u16) -> Result<Value, VmError> {
        let obj = recv.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "instance".into(),
            got: recv.type_name().to_string(),
        })?;
        let inst = match obj.kind() {
            ObjKind::Instance(i) => i,
            _ => return Err(VmError::TypeMismatch { expected: "instance".into(), got: recv.type_name().to_string() }),
        };
        let class = inst.class;
        let version = class.as_class().unwrap().version;
        if let Some(cached) = self.frames.last().unwrap().ic_cache.get(ic_slot as usize).and_then(|c| c.lookup(class, version)) {
            return Ok(inst.get_field(cached));
        }
        if let Some(slot) = class.as_class().unwrap().field_slot(name) {
            self.record_ic(ic_slot, class, version, slot);
            return Ok(inst.get_field(slot));
        }
        if let Some(method) = class.as_class().unwrap().resolve_method(name) {
            let bound = self.gc.allocate(ObjKind::BoundMethod(crate::object::RBoundMethod { receiver: recv, method: method.closure }));
            return Ok(Value::object(bound));
        }
        Err(VmError::UndefinedField { name: self.interner.resolve(name).to_string() })
    }

    fn rt_set_field(&mut self, recv: Value, name: Symbol, value: Value, ic_slot: u16) -> Result<(), VmError> {
        let mut obj = recv.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "instance".into(),
            got: recv.type_name().to_string(),
        })?;
        let class = match obj.kind() {
            ObjKind::Instance(i) => i.class,
            _ => return Err(VmError::TypeMismatch { expected: "instance".into(), got: recv.type_name().to_string() }),
        };
        let mut class_ref = class;
        let slot = class_ref.as_class_mut().unwrap().field_slot_or_grow(name);
        let version = class_ref.as_class().unwrap().version;
        self.record_ic(ic_slot, class, version, slot);
        obj.as_instance_mut().unwrap().set_field(slot, value);
        Ok(())
    }

    fn record_ic(&mut self, ic_slot: u16, class: ObjRef, version: u32, slot: usize) {
        if let Some(cache) = self.frames.last_mut().unwrap().ic_cache.get_mut(ic_slot as usize) {
            cache.record(class, version, slot);
        }
    }

    fn rt_get_super(&mut self, self_val: Value, name: Symbol) -> Result<Value, VmError> {
        let obj = self_val.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "instance".into(),
            got: self_val.type_name().to_string(),
        })?;
        let class = match obj.kind() {
            ObjKind::Instance(i) => i.class,
            _ => return Err(VmError::TypeMismatch { expected: "instance".into(), got: self_val.type_name().to_string() }),
        };
        // Resolves from the receiver's own class's superclass. For a single
        // level of inheritance (the common case) this is exactly the
        // statically enclosing class's parent; for a method inherited
        // unchanged through several levels before being the one that calls
        // `super`, it is not distinguished from the receiver's *dynamic*
        // class's parent. Documented in DESIGN.md.
        let superclass = class.as_class().and_then(|c| c.superclass).ok_or_else(|| VmError::UndefinedField {
            name: self.interner.resolve(name).to_string(),
        })?;
        let method = superclass
            .as_class()
            .and_then(|c| c.resolve_method(name))
            .ok_or_else(|| VmError::UndefinedField { name: self.interner.resolve(name).to_string() })?;
        let bound = self.gc.allocate(ObjKind::BoundMethod(crate::object::RBoundMethod { receiver: self_val, method: method.closure }));
        Ok(Value::object(bound))
    }

    fn rt_index_get(&self, container: Value, index: Value) -> Result<Value, VmError> {
        let obj = container.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "array or dict".into(),
            got: container.type_name().to_string(),
        })?;
        match obj.kind() {
            ObjKind::Array(arr) => {
                let i = index.as_int().ok_or_else(|| VmError::TypeMismatch { expected: "int".into(), got: index.type_name().to_string() })?;
                arr.get(i as i64).ok_or(VmError::IndexOutOfBounds { index: i as i64, length: arr.len() })
            }
            ObjKind::Dict(dict) => Ok(dict.get(index).unwrap_or(Value::nil())),
            _ => Err(VmError::TypeMismatch { expected: "array or dict".into(), got: container.type_name().to_string() }),
        }
    }

    fn rt_index_set(&mut self, container: Value, index: Value, value: Value) -> Result<(), VmError> {
        let mut obj = container.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "array or dict".into(),
            got: container.type_name().to_string(),
        })?;
        match obj.kind() {
            ObjKind::Array(_) => {
                let i = index.as_int().ok_or_else(|| VmError::TypeMismatch { expected: "int".into(), got: index.type_name().to_string() })?;
                let len = obj.as_array().unwrap().len();
                if !obj.as_array_mut().unwrap().set(i as i64, value) {
                    return Err(VmError::IndexOutOfBounds { index: i as i64, length: len });
                }
                Ok(())
            }
            ObjKind::Dict(_) => {
                obj.as_dict_mut().unwrap().insert(index, value);
                Ok(())
            }
            _ => Err(VmError::TypeMismatch { expected: "array or dict".into(), got: container.type_name().to_string() }),
        }
    }

    // ---------------------------------------------------------- upvalues

    fn capture_upvalue(&mut self, abs_index: usize) -> ObjRef {
        for &up in &self.open_upvalues {
            if let ObjKind::Upvalue(u) = up.kind() {
                if let UpvalueState::Open(i) = u.state {
                    if i == abs_index {
                        return up;
                    }
                }
            }
        }
        let obj = self.gc.allocate(ObjKind::Upvalue(RUpvalue { state: UpvalueState::Open(abs_index), next_open: None }));
        self.open_upvalues.push(obj);
        obj
    }

    fn read_upvalue(&self, up: ObjRef) -> Value {
        match up.kind() {
            ObjKind::Upvalue(u) => match u.state {
                UpvalueState::Open(i) => self.stack[i],
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!("upvalue slot must reference an Upvalue object"),
        }
    }

    fn write_upvalue(&mut self, mut up: ObjRef, value: Value) {
        let idx = match up.kind() {
            ObjKind::Upvalue(u) => match u.state {
                UpvalueState::Open(i) => Some(i),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!("upvalue slot must reference an Upvalue object"),
        };
        match idx {
            Some(i) => self.stack[i] = value,
            None => {
                if let ObjKind::Upvalue(u) = up.kind_mut() {
                    u.state = UpvalueState::Closed(value);
                }
            }
        }
    }

    fn close_upvalues_from(&mut self, from_abs_index: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for mut up in self.open_upvalues.drain(..) {
            let open_index = match up.kind() {
                ObjKind::Upvalue(u) => match u.state {
                    UpvalueState::Open(i) => Some(i),
                    UpvalueState::Closed(_) => None,
                },
                _ => None,
            };
            match open_index {
                Some(i) if i >= from_abs_index => {
                    let value = self.stack[i];
                    if let ObjKind::Upvalue(u) = up.kind_mut() {
                        u.state = UpvalueState::Closed(value);
                    }
                }
                _ => remaining.push(up),
            }
        }
        self.open_upvalues = remaining;
    }

    // --------------------------------------------------------- exceptions

    /// Walks `frames` top-down looking for a handler; builds `trace` (one
    /// entry per frame passed through) along the way so an exception that
    /// reaches the bottom uncaught can report the stack it unwound through
    /// (spec §7: "a stack trace built from the per-function line maps").
    fn handle_unwind(&mut self, mut unwind: Unwind) -> Result<(), VmError> {
        let mut trace: Vec<String> = Vec::new();
        loop {
            let Some(frame) = self.frames.last() else {
                return Err(match unwind {
                    Unwind::Error(e) => e,
                    Unwind::Thrown(v) => {
                        let mut value = v.to_string();
                        for frame_desc in &trace {
                            value.push_str("\n  at ");
                            value.push_str(frame_desc);
                        }
                        VmError::UnhandledException { value }
                    }
                });
            };
            let closure = frame.closure;
            let pc = frame.ip as u32;
            let base = frame.base_ptr;
            let (name, line) =
                self.with_function(closure, |f| (f.name.clone().unwrap_or_else(|| "<anonymous>".to_string()), f.chunk.lines.line_for(pc)));
            trace.push(format!("{name} (line {line})"));
            let entry = self.with_function(closure, |f| {
                f.exception_table
                    .iter()
                    .filter(|e| e.try_start <= pc && pc < e.try_end)
                    .min_by_key(|e| e.try_end - e.try_start)
                    .cloned()
            });
            if let Some(entry) = entry {
                self.close_upvalues_from(base + entry.stack_depth as usize);
                self.stack.truncate(base + entry.stack_depth as usize);
                let value = match &unwind {
                    Unwind::Error(e) => Value::object(self.strings.intern(&mut self.gc, &e.to_string())),
                    Unwind::Thrown(v) => *v,
                };
                self.stack.push(value);
                self.frames.last_mut().unwrap().ip = entry.handler_pc.expect("try entry always has a handler") as usize;
                return Ok(());
            }
            self.close_upvalues_from(base);
            self.frames.pop();
            if self.options.debug {
                eprintln!("[vm] unwinding past frame, {} frame(s) remain", self.frames.len());
            }
        }
    }

    // ---------------------------------------------------------------- GC

    fn maybe_collect(&mut self) {
        if !self.options.stress_gc && !self.gc.should_collect() {
            return;
        }
        self.collect_now();
    }

    fn collect_now(&mut self) {
        if self.options.debug {
            eprintln!("[gc] collecting at {} bytes allocated", self.gc.bytes_allocated());
        }
        let mut roots = RootSet::new();
        roots.extend(self.stack.iter().copied());
        roots.extend(self.globals.values().copied());
        for &u in &self.open_upvalues {
            roots.add_object_root(u);
        }
        for frame in &self.frames {
            roots.add_object_root(frame.closure);
            for cache in &frame.ic_cache {
                match cache {
                    InlineCache::Monomorphic(e) => roots.add_object_root(e.class),
                    InlineCache::Polymorphic(es) => {
                        for e in es {
                            roots.add_object_root(e.class);
                        }
                    }
                    _ => {}
                }
            }
        }
        #[cfg(feature = "jit")]
        for trace in self.jit_engine.trace_roots() {
            roots.add_object_root(trace);
        }
        let strings = &mut self.strings;
        self.gc.collect_with(&roots, |obj| strings.clear_if_freed(obj));
    }
}

// ------------------------------------------------------------- arithmetic
//
// Mirrors `compiler::parser`'s constant-folding helpers exactly (same
// overflow-promotes-to-float, int-division-exact-or-float rules) so a
// folded constant expression and the same expression computed at runtime
// always agree.

fn rt_numeric(a: Value, b: Value, ffn: impl Fn(f64, f64) -> f64, ifn: impl Fn(i32, i32) -> Option<i32>) -> Result<Value, VmError> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(match ifn(x, y) {
            Some(v) => Value::int(v),
            None => Value::float(ffn(x as f64, y as f64)),
        });
    }
    if a.is_number() && b.is_number() {
        return Ok(Value::float(ffn(a.as_number().unwrap(), b.as_number().unwrap())));
    }
    Err(type_err_binop(a, b))
}

fn rt_div(a: Value, b: Value) -> Result<Value, VmError> {
    if !a.is_number() || !b.is_number() {
        return Err(type_err_binop(a, b));
    }
    if let Some(0) = b.as_int() {
        return Err(VmError::DivisionByZero);
    }
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if x % y == 0 {
            return Ok(Value::int(x / y));
        }
    }
    Ok(Value::float(a.as_number().unwrap() / b.as_number().unwrap()))
}

fn rt_mod(a: Value, b: Value) -> Result<Value, VmError> {
    if !a.is_number() || !b.is_number() {
        return Err(type_err_binop(a, b));
    }
    if let Some(0) = b.as_int() {
        return Err(VmError::DivisionByZero);
    }
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(Value::int(x % y));
    }
    Ok(Value::float(a.as_number().unwrap() % b.as_number().unwrap()))
}

fn rt_neg(a: Value) -> Result<Value, VmError> {
    if let Some(i) = a.as_int() {
        return Ok(match i.checked_neg() {
            Some(v) => Value::int(v),
            None => Value::float(-(i as f64)),
        });
    }
    if let Some(f) = a.as_float() {
        return Ok(Value::float(-f));
    }
    Err(VmError::TypeMismatch { expected: "number".into(), got: a.type_name().to_string() })
}

fn rt_cmp(a: Value, b: Value, cmp: impl Fn(f64, f64) -> bool) -> Result<Value, VmError> {
    Ok(Value::bool(rt_cmp_bool(a, b, cmp)?))
}

fn rt_cmp_bool(a: Value, b: Value, cmp: impl Fn(f64, f64) -> bool) -> Result<bool, VmError> {
    if a.is_number() && b.is_number() {
        Ok(cmp(a.as_number().unwrap(), b.as_number().unwrap()))
    } else {
        Err(type_err_binop(a, b))
    }
}

fn type_err_binop(a: Value, b: Value) -> VmError {
    VmError::TypeMismatch { expected: "numbers".into(), got: format!("{} and {}", a.type_name(), b.type_name()) }
}

impl Vm {
    fn rt_add(&mut self, a: Value, b: Value) -> Result<Value, VmError> {
        if let Ok(v) = rt_numeric(a, b, |x, y| x + y, |x, y| x.checked_add(y)) {
            return Ok(v);
        }
        if let (Some(oa), Some(ob)) = (a.as_object(), b.as_object()) {
            if let (Some(sa), Some(sb)) = (oa.as_string(), ob.as_string()) {
                let mut s = String::with_capacity(sa.as_str().len() + sb.as_str().len());
                s.push_str(sa.as_str());
                s.push_str(sb.as_str());
                let obj = self.strings.intern(&mut self.gc, &s);
                return Ok(Value::object(obj));
            }
        }
        Err(VmError::TypeMismatch {
            expected: "numbers or strings".into(),
            got: format!("{} and {}", a.type_name(), b.type_name()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::collector::GarbageCollector;
    use crate::vm::strings::StringTable;

    fn run_source(src: &str) -> Result<Value, VmError> {
        run_source_with_options(src, VmOptions::default())
    }

    fn run_source_with_options(src: &str, options: VmOptions) -> Result<Value, VmError> {
        let mut interner = Interner::new();
        let mut gc = GarbageCollector::new();
        let mut strings = StringTable::new();
        let output = crate::compiler::compile(src, &mut interner, &mut gc, &mut strings);
        assert!(output.errors.is_empty(), "compile errors: {:?}", output.errors);
        let mut vm = Vm::new(interner, gc, strings, options);
        vm.run(output.function)
    }

    #[test]
    fn arithmetic_and_globals() {
        let v = run_source("let x = 1 + 2 * 3\nreturn x").unwrap();
        assert_eq!(v.as_int(), Some(7));
    }

    #[test]
    fn recursive_function_and_tail_call() {
        let src = "\
fn fact(n, acc)
  if n <= 1 then
    return acc
  end
  return fact(n - 1, n * acc)
end
return fact(10, 1)
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_int(), Some(3628800));
    }

    #[test]
    fn closures_capture_by_reference() {
        let src = "\
fn make_counter()
  let count = 0
  fn bump()
    count = count + 1
    return count
  end
  return bump
end
let c = make_counter()
c()
c()
return c()
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_int(), Some(3));
    }

    #[test]
    fn class_instantiation_and_methods() {
        let src = "\
class Counter
  fn init(start)
    self.n = start
  end
  fn bump()
    self.n = self.n + 1
    return self.n
  end
end
let c = new Counter(10)
c.bump()
return c.bump()
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_int(), Some(12));
    }

    #[test]
    fn inheritance_and_super() {
        let src = "\
class Animal
  fn speak()
    return \"...\"
  end
end
class Dog extends Animal
  fn speak()
    return super.speak()
  end
end
let d = new Dog()
return d.speak()
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_object().unwrap().as_string().unwrap().as_str(), "...");
    }

    #[test]
    fn try_catch_binds_the_thrown_value() {
        let src = "\
let result = nil
try
  throw \"boom\"
catch e
  result = e
end
return result
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_object().unwrap().as_string().unwrap().as_str(), "boom");
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let src = "\
let result = nil
try
  let x = 1 / 0
catch e
  result = e
end
return result
";
        let v = run_source(src).unwrap();
        assert!(v.as_object().unwrap().as_string().is_some());
    }

    #[test]
    fn array_and_dict_indexing() {
        let src = "\
let arr = [1, 2, 3]
arr[1] = 20
let d = {\"a\": 1}
d[\"b\"] = 2
return arr[1] + d[\"b\"]
";
        let v = run_source(src).unwrap();
        assert_eq!(v.as_int(), Some(22));
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let err = run_source("return undefined_name").unwrap_err();
        assert!(matches!(err, VmError::UndefinedGlobal { .. }));
    }

    /// Spec §7's GC safety invariant: forcing a full collection between
    /// every instruction must not change the result, for a program that
    /// allocates continuously (strings, arrays, a closure) so there is
    /// always fresh garbage and always something live on the stack.
    #[test]
    fn stress_gc_does_not_change_program_behavior() {
        let src = "\
fn build(n)
  let out = []
  let i = 0
  while i < n do
    out[i] = \"item\" + i
    i = i + 1
  end
  return out
end
let items = build(20)
return items[19]
";
        let normal = run_source(src).unwrap();
        let mut stressed_opts = VmOptions::default();
        stressed_opts.stress_gc = true;
        let stressed = run_source_with_options(src, stressed_opts).unwrap();
        assert_eq!(normal.as_object().unwrap().as_string().unwrap().as_str(), "item19");
        assert_eq!(
            stressed.as_object().unwrap().as_string().unwrap().as_str(),
            normal.as_object().unwrap().as_string().unwrap().as_str()
        );
    }

    /// Spec §7's exception-unwinding invariant: `finally` runs exactly
    /// once on every exit path — fall-through, `return`, and exception —
    /// never zero times and never twice.
    #[test]
    fn finally_runs_once_on_fallthrough_return_and_exception() {
        let fallthrough = "\
let log = []
try
  log[0] = \"try\"
catch e
  log[0] = \"unreachable\"
finally
  log[1] = \"finally\"
end
return log[0] + log[1]
";
        assert_eq!(
            run_source(fallthrough).unwrap().as_object().unwrap().as_string().unwrap().as_str(),
            "tryfinally"
        );

        let via_return = "\
fn f()
  try
    return \"try\"
  catch e
    return \"unreachable\"
  finally
    return \"finally\"
  end
end
return f()
";
        assert_eq!(
            run_source(via_return).unwrap().as_object().unwrap().as_string().unwrap().as_str(),
            "finally"
        );

        let nested = "\
fn g()
  try
    try
      return \"inner\"
    catch e
      return \"unreachable\"
    finally
      let noise = \"nested-finally-local\"
    end
  catch e
    return \"unreachable\"
  finally
    return \"outer-finally\"
  end
end
return g()
";
        assert_eq!(
            run_source(nested).unwrap().as_object().unwrap().as_string().unwrap().as_str(),
            "outer-finally"
        );

        let via_exception = "\
let result = \"\"
try
  throw \"boom\"
catch e
  result = result + \"caught:\" + e
finally
  result = result + \":finally\"
end
return result
";
        assert_eq!(
            run_source(via_exception).unwrap().as_object().unwrap().as_string().unwrap().as_str(),
            "caught:boom:finally"
        );
    }
}
