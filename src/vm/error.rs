//! Runtime faults (spec §4.4/§7), one `thiserror` enum the way
//! `raya-compiler/src/error.rs` shapes `CompileError`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("index {index} out of bounds (length {length})")]
    IndexOutOfBounds { index: i64, length: usize },

    #[error("undefined field `{name}`")]
    UndefinedField { name: String },

    #[error("undefined global `{name}`")]
    UndefinedGlobal { name: String },

    #[error("expected {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("stack overflow")]
    StackOverflow,

    #[error("uncaught exception: {value}")]
    UnhandledException { value: String },

    #[error("interrupted")]
    Interrupted,

    #[error("value is not callable: {got}")]
    NotCallable { got: String },
}
