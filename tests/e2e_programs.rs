//! End-to-end scenarios from spec §8, driven through the real CLI binary
//! the way `raya-cli/tests/cli_integration.rs` drives `raya run`/`raya eval`
//! through its `Runtime` — here there is no library-level `Runtime` to call
//! into directly (the CLI *is* the public surface, spec §6), so these tests
//! spawn the built binary with `std::process::Command` and assert on the
//! text it printed and the exit code it returned, matching each program to
//! the expected output the spec's table names.

use std::process::{Command, Output};

fn run(source: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pseudocode"))
        .arg("-e")
        .arg(source)
        .output()
        .expect("failed to spawn pseudocode binary")
}

fn run_with(source: &str, flag: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pseudocode"))
        .arg(flag)
        .arg("-e")
        .arg(source)
        .output()
        .expect("failed to spawn pseudocode binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("stdout was not UTF-8")
}

/// Scenario 1: loop JIT and on-stack replacement. The back-edge in the
/// `for` loop crosses the hotness threshold well before the 99th
/// iteration, so this also exercises `JitEngine::on_back_edge` compiling
/// and then resuming via `BackEdgeOutcome::Resume`.
#[test]
fn scenario_1_loop_jit_and_osr() {
    let out = run("let x=0 for i in 1..100 do x = x + 1 end print(x)");
    assert!(out.status.success());
    assert_eq!(stdout(&out), "100\n");
}

/// Same program run with the JIT forced off should produce identical
/// output — the interpreter/JIT equivalence invariant (SPEC_FULL.md §7),
/// checked here instead of as a separate test since scenario 1 is exactly
/// the program shaped to trigger tracing.
#[test]
fn scenario_1_interpreter_and_jit_agree() {
    let jit_out = run_with("let x=0 for i in 1..100 do x = x + 1 end print(x)", "-j");
    let no_jit_out = run_with("let x=0 for i in 1..100 do x = x + 1 end print(x)", "-i");
    assert_eq!(stdout(&jit_out), stdout(&no_jit_out));
    assert!(jit_out.status.success());
    assert!(no_jit_out.status.success());
}

/// Scenario 2: tail-call elimination. 100,000 nested calls would blow a
/// frame-per-call stack; the spec only requires "no crash" and a
/// deterministic result, so this asserts successful completion and that
/// the interpreter and JIT paths agree on whatever that result is.
#[test]
fn scenario_2_tail_call_elimination_completes() {
    let program = "fn f(n,a) if n<=1 then return a end return f(n-1, n*a) end print(f(100000,1) % 1000)";
    let jit_out = run_with(program, "-j");
    let no_jit_out = run_with(program, "-i");
    assert!(jit_out.status.success(), "stderr: {}", String::from_utf8_lossy(&jit_out.stderr));
    assert!(no_jit_out.status.success());
    assert_eq!(stdout(&jit_out), stdout(&no_jit_out));
}

/// Scenario 3: array bounds and index-set.
#[test]
fn scenario_3_array_index_get_and_set() {
    let out = run("let a=[1,2,3] a[1]=9 print(a[0]+a[1]+a[2])");
    assert!(out.status.success());
    assert_eq!(stdout(&out), "13\n");
}

/// Scenario 4: inline cache on field read. Run twice through the same
/// process isn't needed since IC warm-up happens within one run; this
/// just checks the field reads it depends on resolve correctly.
#[test]
fn scenario_4_inline_cache_on_field_read() {
    let out = run("class P fn init(x,y) self.x=x self.y=y end end let p=P(3,4) print(p.x*p.x+p.y*p.y)");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "25\n");
}

/// Scenario 5: exception table and `finally` ordering. The exception is
/// caught, so the program exits 0 and both `catch` and `finally` run once.
#[test]
fn scenario_5_exception_table_and_finally_ordering() {
    let out = run(r#"try throw "bad" catch e print(e) finally print("done") end"#);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "bad\ndone\n");
}

/// Scenario 6: a branch inside a loop, shaped so that naive and/or fusion
/// or a fused compare-and-branch would mishandle the `i==5` update
/// (spec §9's documented "VM if-condition bug" to avoid, not preserve).
#[test]
fn scenario_6_branch_inside_loop() {
    let out = run("let i=0 while i<10 do if i==5 then i = i + 100 end i = i + 1 end print(i)");
    assert!(out.status.success());
    assert_eq!(stdout(&out), "106\n");
}

/// Spec §6 exit codes: compile errors are 2, not 1.
#[test]
fn compile_error_exits_2() {
    let out = run("let = 1");
    assert_eq!(out.status.code(), Some(2));
}

/// Spec §6 exit codes: an unhandled exception is a runtime error, exit 1.
#[test]
fn unhandled_exception_exits_1() {
    let out = run(r#"throw "boom""#);
    assert_eq!(out.status.code(), Some(1));
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("boom"));
}

/// A successful program with no output still exits 0.
#[test]
fn empty_program_exits_0() {
    let out = run("let x = 1");
    assert_eq!(out.status.code(), Some(0));
}
