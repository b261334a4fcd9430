//! Pseudocode: a dynamically-typed scripting language with a single-pass
//! bytecode compiler, a NaN-boxed-value stack VM, and (behind the `jit`
//! feature, on by default) a trace-recording JIT targeting x86-64.
//!
//! Mirrors `raya-engine`'s module layout, collapsed into one crate (spec
//! §2/SPEC_FULL.md §2): `lexer` + `compiler` are the front end, `value` +
//! `object` are the data model, `gc` is the heap, `bytecode` is the
//! compiled-function format, `vm` is the interpreter, `jit` is the
//! trace-recording JIT.

pub mod bytecode;
pub mod cli;
pub mod compiler;
pub mod gc;
pub mod interner;
#[cfg(feature = "jit")]
pub mod jit;
pub mod lexer;
pub mod object;
pub mod value;
pub mod vm;

pub use compiler::{compile, CompileError, CompileOutput};
pub use gc::GarbageCollector;
pub use interner::{Interner, Symbol};
pub use value::Value;
pub use vm::{Vm, VmError, VmOptions};

/// The outcome of [`run_source`]: either the compiler rejected the program
/// (spec §4.2 — codegen still runs for the rest of the file, but nothing
/// executes) or it ran and produced a runtime result.
#[derive(Debug)]
pub enum RunOutcome {
    CompileFailed(Vec<CompileError>),
    Ran(Result<Value, VmError>),
}

/// Compiles and runs `source` end to end: one interner/heap/string-table
/// triple lives for the whole call, handed first to the compiler and then
/// (once compilation succeeds) to the `Vm` it drives execution with. This
/// is the single entry point `cli::run_source` and the integration tests
/// both go through.
pub fn run_source(source: &str, options: VmOptions) -> RunOutcome {
    let mut interner = Interner::new();
    let mut gc = GarbageCollector::new();
    let mut strings = vm::strings::StringTable::new();
    let output = compile(source, &mut interner, &mut gc, &mut strings);
    if !output.errors.is_empty() {
        return RunOutcome::CompileFailed(output.errors);
    }
    let mut vm = Vm::new(interner, gc, strings, options);
    RunOutcome::Ran(vm.run(output.function))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_trivial_program() {
        match run_source("print(1 + 1)", VmOptions::default()) {
            RunOutcome::Ran(Ok(_)) => {}
            other => panic!("expected successful run, got {other:?}"),
        }
    }
}
