//! Heap object model (spec §3): every allocation starts with a
//! [`GcHeader`], followed by one of the object variants below. Objects
//! are a tagged union (`ObjKind`) behind one allocation shape rather than
//! per-variant `GcPtr<T>`s — this mirrors `raya-engine/src/vm/object.rs`'s
//! flat `Object`/`Array`/`Class`/... structs but folds them into a single
//! header+payload allocation the way the heap (`crate::gc::heap`) expects
//! to walk one intrusive linked list of allocations regardless of kind.

use crate::bytecode::chunk::Chunk;
use crate::interner::Symbol;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

/// Intrusive header every heap object carries: mark bit for the
/// mark-sweep collector and a link to the next allocation in allocation
/// order (spec §4.3: "a single linked list of allocations").
pub struct GcHeader {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<Obj>>>,
}

/// One heap allocation: header plus variant payload.
pub struct Obj {
    pub header: GcHeader,
    pub kind: ObjKind,
}

pub enum ObjKind {
    Str(RString),
    Array(RArray),
    Dict(RDict),
    Function(RFunction),
    Closure(RClosure),
    Upvalue(RUpvalue),
    Class(RClass),
    Instance(RInstance),
    BoundMethod(RBoundMethod),
    #[cfg(feature = "jit")]
    Trace(crate::jit::recorder::TraceObject),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::Str(_) => "string",
            ObjKind::Array(_) => "array",
            ObjKind::Dict(_) => "dict",
            ObjKind::Function(_) => "function",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound_method",
            #[cfg(feature = "jit")]
            ObjKind::Trace(_) => "trace",
        }
    }

    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match &self.kind {
            ObjKind::Str(s) => s.bytes.len(),
            ObjKind::Array(a) => a.elements.capacity() * std::mem::size_of::<Value>(),
            ObjKind::Dict(d) => d.slots.capacity() * std::mem::size_of::<DictSlot>(),
            ObjKind::Instance(i) => i.fields.capacity() * std::mem::size_of::<Value>(),
            _ => 0,
        }
    }
}

/// A `Copy` handle to a live heap allocation. Non-owning: the GC decides
/// lifetime. Equivalent in spirit to `raya-core/src/gc/ptr.rs`'s `GcPtr<T>`
/// but over the single `Obj` tagged union instead of being generic.
#[derive(Debug, Clone, Copy)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub fn new(ptr: NonNull<Obj>) -> Self {
        ObjRef(ptr)
    }

    /// # Safety
    /// `addr` must have come from a previous [`ObjRef::addr`] call on a
    /// still-live object (this is exactly how `Value::object`/`as_object`
    /// round-trip a pointer through the NaN box payload).
    pub unsafe fn from_addr(addr: usize) -> Self {
        ObjRef(NonNull::new_unchecked(addr as *mut Obj))
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    #[inline]
    pub fn header(self) -> &'static GcHeader {
        unsafe { &self.0.as_ref().header }
    }

    #[inline]
    pub fn kind(&self) -> &ObjKind {
        unsafe { &self.0.as_ref().kind }
    }

    #[inline]
    pub fn kind_mut(&mut self) -> &mut ObjKind {
        unsafe { &mut self.0.as_mut().kind }
    }

    pub fn type_name(self) -> &'static str {
        unsafe { self.0.as_ref().type_name() }
    }

    pub fn as_string(&self) -> Option<&RString> {
        match self.kind() {
            ObjKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&RArray> {
        match self.kind() {
            ObjKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut RArray> {
        match self.kind_mut() {
            ObjKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut RDict> {
        match self.kind_mut() {
            ObjKind::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut RInstance> {
        match self.kind_mut() {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&RClass> {
        match self.kind() {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut RClass> {
        match self.kind_mut() {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&RClosure> {
        match self.kind() {
            ObjKind::Closure(c) => Some(c),
            _ => None,
        }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl std::hash::Hash for ObjRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjKind::Str(s) => write!(f, "{}", s.as_str()),
            ObjKind::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            ObjKind::Dict(d) => {
                write!(f, "{{")?;
                let mut first = true;
                for (k, v) in d.iter() {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            ObjKind::Function(func) => write!(f, "<fn {}>", func.name.as_deref().unwrap_or("anonymous")),
            ObjKind::Closure(_) => write!(f, "<closure>"),
            ObjKind::Upvalue(_) => write!(f, "<upvalue>"),
            ObjKind::Class(c) => write!(f, "<class {}>", c.name),
            ObjKind::Instance(i) => write!(f, "<instance {}>", i.class.as_class().map(|c| c.name.as_str()).unwrap_or("?")),
            ObjKind::BoundMethod(_) => write!(f, "<bound method>"),
            #[cfg(feature = "jit")]
            ObjKind::Trace(_) => write!(f, "<trace>"),
        }
    }
}

// ---------------------------------------------------------------- String

pub struct RString {
    pub bytes: Box<str>,
    pub hash: u64,
}

impl RString {
    pub fn new(s: &str) -> Self {
        RString { bytes: s.into(), hash: fx_hash_str(s) }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}

pub fn fx_hash_str(s: &str) -> u64 {
    use std::hash::Hasher;
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

// ----------------------------------------------------------------- Array

/// Grows geometrically (x2), shrinks on `pop` when usage drops below a
/// quarter of capacity, per spec §3's Array lifecycle.
pub struct RArray {
    pub elements: Vec<Value>,
}

impl RArray {
    pub fn new() -> Self {
        RArray { elements: Vec::new() }
    }

    pub fn with_elements(elements: Vec<Value>) -> Self {
        RArray { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn get(&self, index: i64) -> Option<Value> {
        if index < 0 {
            return None;
        }
        self.elements.get(index as usize).copied()
    }

    pub fn set(&mut self, index: i64, value: Value) -> bool {
        if index < 0 {
            return false;
        }
        match self.elements.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.elements.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        let v = self.elements.pop();
        let cap = self.elements.capacity();
        if cap > 8 && self.elements.len() < cap / 4 {
            self.elements.shrink_to(cap / 2);
        }
        v
    }
}

impl Default for RArray {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------ Dict

/// Open-addressed hash table with tombstones, rehashing at a 0.75 load
/// factor (spec §3). Values that are not one of nil/bool/int/float/string
/// hash and compare by pointer identity, documented in `DESIGN.md`.
pub enum DictSlot {
    Empty,
    Tombstone,
    Occupied(Value, Value),
}

pub struct RDict {
    slots: Vec<DictSlot>,
    len: usize,
    tombstones: usize,
}

impl RDict {
    const INITIAL_CAPACITY: usize = 8;
    const LOAD_FACTOR: f64 = 0.75;

    pub fn new() -> Self {
        RDict { slots: Vec::new(), len: 0, tombstones: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn hash_value(v: Value) -> u64 {
        use std::hash::Hasher;
        if let Some(obj) = v.as_object() {
            if let Some(s) = obj.as_string() {
                return s.hash;
            }
            let mut h = rustc_hash::FxHasher::default();
            h.write_usize(obj.addr());
            return h.finish();
        }
        v.raw_bits()
    }

    fn values_equal(a: Value, b: Value) -> bool {
        crate::vm::values_structurally_equal(a, b)
    }

    fn ensure_capacity(&mut self) {
        if self.slots.is_empty() {
            self.slots.resize_with(Self::INITIAL_CAPACITY, || DictSlot::Empty);
            return;
        }
        let used = self.len + self.tombstones;
        if (used as f64) / (self.slots.len() as f64) > Self::LOAD_FACTOR {
            self.rehash(self.slots.len() * 2);
        }
    }

    fn rehash(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.slots, Vec::new());
        self.slots.resize_with(new_capacity, || DictSlot::Empty);
        self.tombstones = 0;
        self.len = 0;
        for slot in old {
            if let DictSlot::Occupied(k, v) = slot {
                self.insert_no_grow(k, v);
            }
        }
    }

    fn find_slot(&self, key: Value) -> usize {
        let mask = self.slots.len() - 1;
        let mut idx = (Self::hash_value(key) as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                DictSlot::Empty => return first_tombstone.unwrap_or(idx),
                DictSlot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                DictSlot::Occupied(k, _) => {
                    if Self::values_equal(*k, key) {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn insert_no_grow(&mut self, key: Value, value: Value) {
        let idx = self.find_slot(key);
        let was_empty = matches!(self.slots[idx], DictSlot::Empty);
        self.slots[idx] = DictSlot::Occupied(key, value);
        if was_empty {
            self.len += 1;
        }
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.ensure_capacity();
        self.insert_no_grow(key, value);
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = self.find_slot(key);
        match &self.slots[idx] {
            DictSlot::Occupied(_, v) => Some(*v),
            _ => None,
        }
    }

    pub fn contains(&self, key: Value) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: Value) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = self.find_slot(key);
        if matches!(self.slots[idx], DictSlot::Occupied(..)) {
            self.slots[idx] = DictSlot::Tombstone;
            self.len -= 1;
            self.tombstones += 1;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            DictSlot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(k, _)| k).collect()
    }
}

impl Default for RDict {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------- Function

/// An entry in a function's exception table (spec §4.2, §4.4): the VM
/// consults this only while unwinding a `THROW`.
#[derive(Clone, Debug)]
pub struct ExceptionTableEntry {
    pub try_start: u32,
    pub try_end: u32,
    pub handler_pc: Option<u32>,
    pub finally_pc: Option<u32>,
    /// Local-slot count (relative to the frame's `base_ptr`) in effect at
    /// `try_start`. Unwinding truncates the value stack back to exactly
    /// this depth before pushing the caught value, matching what
    /// `handler_pc`'s compiled code (an identifier bind or a bare `Pop`)
    /// expects to find on top of the stack.
    pub stack_depth: u32,
}

/// Immutable after compilation (spec §3).
pub struct RFunction {
    pub name: Option<String>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub exception_table: Vec<ExceptionTableEntry>,
}

// --------------------------------------------------------------- Closure

pub struct RClosure {
    /// Reference to the immutable `Function` object this closure wraps.
    /// Functions live in a module's constant pool for the whole program,
    /// so this is "weak" in the sense spec §3 means: the closure does not
    /// need to keep it alive on its own, it is always independently
    /// reachable while its owning chunk is live.
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

// -------------------------------------------------------------- Upvalue

pub enum UpvalueState {
    /// Points at a live stack slot, identified by absolute stack index.
    Open(usize),
    /// Owns its value once the enclosing frame has unwound.
    Closed(Value),
}

pub struct RUpvalue {
    pub state: UpvalueState,
    /// Intrusive chain of currently-open upvalues, ordered by descending
    /// stack slot, used by the VM to find-or-create and to close ranges.
    pub next_open: Option<ObjRef>,
}

// ----------------------------------------------------------------- Class

#[derive(Clone)]
pub struct MethodEntry {
    pub closure: ObjRef,
}

/// A class shape: mutating its field/method tables bumps `version`, which
/// invalidates every inline cache (and JIT trace) filled against an older
/// version (spec §4.5).
pub struct RClass {
    pub name: String,
    pub superclass: Option<ObjRef>,
    pub fields: indexmap::IndexMap<Symbol, usize>,
    pub methods: FxHashMap<Symbol, MethodEntry>,
    pub version: u32,
}

impl RClass {
    pub fn new(name: String, superclass: Option<ObjRef>) -> Self {
        let (fields, version) = if let Some(sc) = superclass {
            if let Some(c) = sc.as_class() {
                (c.fields.clone(), c.version)
            } else {
                (indexmap::IndexMap::new(), 0)
            }
        } else {
            (indexmap::IndexMap::new(), 0)
        };
        RClass { name, superclass, fields, methods: FxHashMap::default(), version }
    }

    /// Returns the slot index for `name`, allocating a new field slot if
    /// this is the first time the class has seen it (spec §9: dynamic
    /// field growth with shape versioning, chosen over fixed slot layout).
    pub fn field_slot_or_grow(&mut self, name: Symbol) -> usize {
        if let Some(&idx) = self.fields.get(&name) {
            return idx;
        }
        let idx = self.fields.len();
        self.fields.insert(name, idx);
        self.version = self.version.wrapping_add(1);
        idx
    }

    pub fn field_slot(&self, name: Symbol) -> Option<usize> {
        self.fields.get(&name).copied()
    }

    pub fn resolve_method(&self, name: Symbol) -> Option<MethodEntry> {
        if let Some(m) = self.methods.get(&name) {
            return Some(m.clone());
        }
        self.superclass.and_then(|sc| sc.as_class().and_then(|c| c.resolve_method(name)))
    }

    pub fn set_method(&mut self, name: Symbol, closure: ObjRef) {
        self.methods.insert(name, MethodEntry { closure });
        self.version = self.version.wrapping_add(1);
    }
}

// -------------------------------------------------------------- Instance

/// Fields are a flat `Value` array sized to the class's field count at
/// allocation time, and grown on demand by `SET_FIELD` (spec §9).
pub struct RInstance {
    pub class: ObjRef,
    pub fields: Vec<Value>,
    pub class_version_at_alloc: u32,
}

impl RInstance {
    pub fn get_field(&self, slot: usize) -> Value {
        self.fields.get(slot).copied().unwrap_or(Value::nil())
    }

    pub fn set_field(&mut self, slot: usize, value: Value) {
        if slot >= self.fields.len() {
            self.fields.resize(slot + 1, Value::nil());
        }
        self.fields[slot] = value;
    }
}

// ---------------------------------------------------------- Bound method

pub struct RBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
