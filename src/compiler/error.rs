//! Compile-time diagnostics (spec §4.2's error table), grounded on
//! `raya-compiler/src/error.rs`'s one-variant-per-category `thiserror` enum.

use crate::lexer::Span;
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Syntax,
    UndeclaredName,
    AssignToConst,
    ArityMismatch,
    DuplicateDefinition,
    UnreachableCode,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("{line}:{column}: syntax error: {message}")]
    Syntax { message: String, line: u32, column: u32 },

    #[error("{line}:{column}: undeclared name `{name}`")]
    UndeclaredName { name: String, line: u32, column: u32 },

    #[error("{line}:{column}: cannot assign to const `{name}`")]
    AssignToConst { name: String, line: u32, column: u32 },

    #[error("{line}:{column}: expected {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize, line: u32, column: u32 },

    #[error("{line}:{column}: `{name}` is already defined in this scope")]
    DuplicateDefinition { name: String, line: u32, column: u32 },

    #[error("{line}:{column}: unreachable code")]
    UnreachableCode { line: u32, column: u32 },

    #[error("too many local variables in one function (max 65535)")]
    TooManyLocals,

    #[error("too many constants in one function (max 65535)")]
    TooManyConstants,

    #[error("too many parameters in one function (max 255)")]
    TooManyParameters,

    #[error("jump offset too large to encode")]
    JumpTooLarge,

    #[error("`break` outside a loop")]
    InvalidBreak,

    #[error("`continue` outside a loop")]
    InvalidContinue,

    #[error("`return` outside a function")]
    InvalidReturn,

    #[error("{feature} is not supported")]
    UnsupportedFeature { feature: String },
}

impl CompileError {
    pub fn category(&self) -> ErrorCategory {
        use CompileError::*;
        match self {
            Syntax { .. } | TooManyLocals | TooManyConstants | TooManyParameters
            | JumpTooLarge | InvalidBreak | InvalidContinue | InvalidReturn
            | UnsupportedFeature { .. } => ErrorCategory::Syntax,
            UndeclaredName { .. } => ErrorCategory::UndeclaredName,
            AssignToConst { .. } => ErrorCategory::AssignToConst,
            ArityMismatch { .. } => ErrorCategory::ArityMismatch,
            DuplicateDefinition { .. } => ErrorCategory::DuplicateDefinition,
            UnreachableCode { .. } => ErrorCategory::UnreachableCode,
        }
    }

    /// The `(line, column)` this error was raised at, where known — every
    /// variant with a span carries one; the handful that don't (overflow
    /// and structural errors like `TooManyLocals`) have no single source
    /// location to point at, so a CLI renderer falls back to a spanless
    /// line for those.
    pub fn position(&self) -> Option<(u32, u32)> {
        use CompileError::*;
        match self {
            Syntax { line, column, .. }
            | UndeclaredName { line, column, .. }
            | AssignToConst { line, column, .. }
            | ArityMismatch { line, column, .. }
            | DuplicateDefinition { line, column, .. }
            | UnreachableCode { line, column, .. } => Some((*line, *column)),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CompileError::UnreachableCode { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn at(span: Span, message: impl Into<String>) -> CompileError {
        CompileError::Syntax { message: message.into(), line: span.line, column: span.column }
    }
}
