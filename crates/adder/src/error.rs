//! Error taxonomy for compilation.
//!
//! Conformity violations name the offending construct and its source line;
//! internal errors are compiler bugs surfaced as fatal invariant violations.
//! Runtime errors live with the VM (see [`crate::vm::VmError`]), since they
//! carry runtime values.

use thiserror::Error;

use crate::bytecode::assembly::AsmError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The input AST uses a construct outside the accepted subset.
    #[error("line {line}: not in the compiled subset: {what}")]
    Conformity { what: String, line: u32 },

    /// An unreachable case in the code generator; a compiler bug.
    #[error("compiler invariant violated: {0}")]
    Internal(String),
}

impl CompileError {
    pub(crate) fn conformity(what: impl Into<String>, line: u32) -> Self {
        CompileError::Conformity {
            what: what.into(),
            line,
        }
    }

    pub(crate) fn internal(what: impl Into<String>) -> Self {
        CompileError::Internal(what.into())
    }
}

impl From<AsmError> for CompileError {
    fn from(err: AsmError) -> Self {
        CompileError::Internal(err.to_string())
    }
}
