//! Built-in calling convention (spec §6): a built-in is a host function of
//! `(vm, argc, argv) -> Result<Value, VmError>`. The compiler recognizes
//! `print`, `input`, and `len` syntactically at the call site (spec's
//! Non-goal list excludes built-in library *bodies*, not this minimal
//! trio needed to make the example programs and I/O observable at all).

use std::collections::HashMap;
use std::sync::LazyLock;

pub const NATIVE_PRINT: u16 = 0;
pub const NATIVE_INPUT: u16 = 1;
pub const NATIVE_LEN: u16 = 2;

/// Name-to-id lookup built once, the way `raya-stdlib-posix`'s handle
/// registries (`static ...: LazyLock<HandleRegistry<_>> = LazyLock::new(...)`)
/// build their tables once rather than per call.
static BUILTIN_IDS: LazyLock<HashMap<&'static str, u16>> = LazyLock::new(|| {
    HashMap::from([("print", NATIVE_PRINT), ("input", NATIVE_INPUT), ("len", NATIVE_LEN)])
});

pub fn name_to_id(name: &str) -> Option<u16> {
    BUILTIN_IDS.get(name).copied()
}

pub fn arity(id: u16) -> u8 {
    match id {
        NATIVE_PRINT => 1,
        NATIVE_INPUT => 0,
        NATIVE_LEN => 1,
        _ => 0,
    }
}

/// Runs a built-in given its id and already-evaluated argument values.
/// `len` works on both arrays and strings (char count of the UTF-8 text).
/// Takes the GC/string table directly (rather than the whole `Vm`) since
/// that is all `input`'s allocation needs and it keeps this module free of
/// a dependency on `vm::interpreter`.
pub fn call(
    id: u16,
    args: &[crate::value::Value],
    gc: &mut crate::gc::collector::GarbageCollector,
    strings: &mut crate::vm::strings::StringTable,
) -> Result<crate::value::Value, crate::vm::error::VmError> {
    use crate::value::Value;
    use crate::vm::error::VmError;
    match id {
        NATIVE_PRINT => {
            println!("{}", args[0]);
            Ok(Value::nil())
        }
        NATIVE_INPUT => {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map_err(|_| VmError::Interrupted)?;
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Value::object(strings.intern(gc, &line)))
        }
        NATIVE_LEN => {
            let v = args[0];
            if let Some(obj) = v.as_object() {
                if let Some(arr) = obj.as_array() {
                    return Ok(Value::int(arr.len() as i32));
                }
                if let Some(s) = obj.as_string() {
                    return Ok(Value::int(s.as_str().chars().count() as i32));
                }
            }
            Err(VmError::TypeMismatch { expected: "array or string".into(), got: v.type_name().to_string() })
        }
        _ => Err(VmError::TypeMismatch { expected: "a known builtin".into(), got: "unknown".into() }),
    }
}
