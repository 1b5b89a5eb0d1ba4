//! The compile-and-execute pipeline.
//!
//! `desugar → conformity check → scope analysis → code generation`, with
//! optional execution of the result in the bundled VM.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::ast::Module;
use crate::bytecode::code::CodeObject;
use crate::bytecode::codegen;
use crate::check::check_conformity;
use crate::desugar::desugar;
use crate::error::CompileError;
use crate::scope::top_scope;
use crate::value::Namespace;
use crate::vm::{VirtualMachine, VmError};

/// Compilation or execution failure from the combined pipeline.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Compiles an AST into a module code object.
pub fn code_for_module(
    module: Module,
    filename: &str,
    module_name: &str,
) -> Result<Rc<CodeObject>, CompileError> {
    tracing::debug!(filename, module_name, "compiling module");
    let module = desugar(module);
    check_conformity(&module)?;
    let scope = top_scope(&module);
    codegen::code_for_module(&module, &scope, filename, module_name)
}

/// Compiles and executes an AST, returning the evaluated module namespace.
pub fn module_from_ast(
    module: Module,
    filename: &str,
    module_name: &str,
    vm: &mut VirtualMachine,
) -> Result<Rc<RefCell<Namespace>>, RunError> {
    let code = code_for_module(module, filename, module_name)?;
    Ok(vm.run_module(&code, module_name)?)
}
