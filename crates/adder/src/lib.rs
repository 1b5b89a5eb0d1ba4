//! A compiler and stack virtual machine for a restricted, indentation
//! structured, object-oriented scripting language.
//!
//! The crate consumes ASTs from an external front end (see [`ast`]) and
//! drives them through `desugar → conformity check → scope analysis → code
//! generation`, producing [`bytecode::code::CodeObject`]s binary-compatible
//! with the reference bytecode dialect. The bundled [`vm::VirtualMachine`]
//! executes those code objects.
//!
//! ```
//! use adder::ast::{build, BinKind};
//! use adder::{module_from_ast, VirtualMachine};
//!
//! let module = build::module(vec![build::assign(
//!     build::store("x"),
//!     build::binop(build::int(2), BinKind::Mul, build::int(3)),
//! )]);
//! let mut vm = VirtualMachine::new();
//! let namespace = module_from_ast(module, "example", "__main__", &mut vm).unwrap();
//! assert_eq!(namespace.borrow()["x"].py_str(), "6");
//! ```

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod check;
pub mod desugar;
pub mod error;
pub mod io;
pub mod run;
pub mod scope;
pub mod value;
pub mod vm;

pub use crate::bytecode::code::{CodeFlags, CodeObject, Const};
pub use crate::error::CompileError;
pub use crate::io::{CollectPrint, NoPrint, PrintWriter, StdPrint};
pub use crate::run::{code_for_module, module_from_ast, RunError};
pub use crate::value::Value;
pub use crate::vm::{VirtualMachine, VmError};
