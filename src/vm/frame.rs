//! Call frames (spec §4.4): one per active (non-tail-collapsed) call.
//! `base_ptr` is the stack index of local slot 0; `RETURN`/`TAILCALL`
//! truncate the value stack back to `base_ptr` rather than the compiler
//! emitting per-scope `Pop`s, which is why the parser never emits scope
//! cleanup ahead of a `return`.

use crate::object::ObjRef;
use crate::value::Value;

pub struct Frame {
    pub closure: ObjRef,
    /// Offset of the next instruction to execute in this closure's chunk.
    pub ip: usize,
    pub base_ptr: usize,
    /// Per-call inline-cache slots, sized to the owning function's
    /// `ic_slot_count` (spec §3).
    pub ic_cache: Vec<crate::vm::ic::InlineCache>,
    /// Set only for a frame running a class's `init` method invoked
    /// through instantiation: `RETURN`/`TAILCALL` discard the method's
    /// own result and substitute the instance, since `new C(...)`
    /// evaluates to the instance regardless of what `init` returns.
    pub constructor_result: Option<Value>,
}

impl Frame {
    pub fn new(closure: ObjRef, base_ptr: usize, ic_slot_count: u16) -> Self {
        Frame {
            closure,
            ip: 0,
            base_ptr,
            ic_cache: (0..ic_slot_count).map(|_| crate::vm::ic::InlineCache::default()).collect(),
            constructor_result: None,
        }
    }
}
