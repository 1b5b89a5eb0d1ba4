//! Bytecode representation: the opcode catalog, the assembly algebra that
//! fragments compose in, finished code objects, and the code generator.

pub mod assembly;
pub mod code;
pub mod codegen;
pub mod op;
