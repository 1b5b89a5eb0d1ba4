//! Immutable executable code objects.
//!
//! A [`CodeObject`] is the output of compilation and the input to the VM:
//! the bytecode blob plus its constant/name/varname pools, stack size, flags,
//! and the line-number table. The layout mirrors the reference VM's format.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::op::Op;

bitflags! {
    /// Code-object flag bits, as defined by the reference format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CodeFlags: u32 {
        /// The code object has fast locals (`nlocals > 0`).
        const HAS_LOCALS = 0x02;
        /// The function accepts `*args`.
        const VARARGS = 0x04;
        /// The function accepts `**kwargs`.
        const VARKEYWORDS = 0x08;
        /// Nested scope referencing an enclosing frame.
        const NESTED = 0x10;
        /// The scope defines no deref variables.
        const NOFREE = 0x40;
    }
}

/// A compile-time constant in the constants pool.
///
/// Equality and hashing double as the interning key: variants are the type
/// tags, so `Int(1)` and `Float(1.0)` occupy distinct pool slots. Floats
/// compare by bit pattern and nested code objects by identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Const>),
    Code(Rc<CodeObject>),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::None, Const::None) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Bytes(a), Const::Bytes(b)) => a == b,
            (Const::Tuple(a), Const::Tuple(b)) => a == b,
            (Const::Code(a), Const::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Const::None => {}
            Const::Bool(value) => value.hash(state),
            Const::Int(value) => value.hash(state),
            Const::Float(value) => value.to_bits().hash(state),
            Const::Str(value) => value.hash(state),
            Const::Bytes(value) => value.hash(state),
            Const::Tuple(values) => values.hash(state),
            Const::Code(code) => Rc::as_ptr(code).hash(state),
        }
    }
}

/// A finished, immutable unit of executable bytecode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub filename: String,
    pub name: String,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
}

/// Failure to decode an instruction from the bytecode blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },
    #[error("truncated argument at offset {offset}")]
    TruncatedArg { offset: usize },
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub offset: usize,
    pub op: Op,
    pub arg: Option<u16>,
}

impl CodeObject {
    /// Iterates decoded instructions in offset order.
    pub fn instructions(&self) -> InstrIter<'_> {
        InstrIter {
            code: &self.code,
            pos: 0,
        }
    }

    /// The combined cellvars ++ freevars name for a DEREF operand.
    #[must_use]
    pub fn deref_name(&self, index: usize) -> Option<&str> {
        if index < self.cellvars.len() {
            self.cellvars.get(index).map(String::as_str)
        } else {
            self.freevars
                .get(index - self.cellvars.len())
                .map(String::as_str)
        }
    }

    /// Source line for a bytecode offset, decoded from the `lnotab`.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut byte = 0usize;
        let mut line = self.firstlineno;
        for pair in self.lnotab.chunks_exact(2) {
            byte += usize::from(pair[0]);
            if byte > offset {
                break;
            }
            line += u32::from(pair[1]);
        }
        line
    }
}

/// Iterator over decoded instructions.
pub struct InstrIter<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Iterator for InstrIter<'_> {
    type Item = Result<Instr, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.pos;
        let byte = *self.code.get(self.pos)?;
        self.pos += 1;
        let Ok(op) = Op::try_from(byte) else {
            self.pos = self.code.len();
            return Some(Err(DecodeError::UnknownOpcode { byte, offset }));
        };
        let arg = if op.has_arg() {
            let Some(bytes) = self.code.get(self.pos..self.pos + 2) else {
                self.pos = self.code.len();
                return Some(Err(DecodeError::TruncatedArg { offset }));
            };
            self.pos += 2;
            Some(u16::from_le_bytes([bytes[0], bytes[1]]))
        } else {
            None
        };
        Some(Ok(Instr { offset, op, arg }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_interning_keys_distinguish_types() {
        assert_ne!(Const::Int(1), Const::Float(1.0));
        assert_ne!(Const::Bool(true), Const::Int(1));
        assert_eq!(Const::Float(1.0), Const::Float(1.0));
        assert_ne!(Const::Float(0.0), Const::Float(-0.0));
    }

    #[test]
    fn instruction_decoding() {
        let code = vec![
            Op::LoadConst as u8,
            1,
            0,
            Op::BinaryMultiply as u8,
            Op::ReturnValue as u8,
        ];
        let object = CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 2,
            flags: CodeFlags::NOFREE,
            code,
            consts: vec![],
            names: vec![],
            varnames: vec![],
            filename: "test".to_owned(),
            name: "test".to_owned(),
            firstlineno: 1,
            lnotab: vec![],
            freevars: vec![],
            cellvars: vec![],
        };
        let instrs: Vec<_> = object.instructions().map(Result::unwrap).collect();
        assert_eq!(
            instrs,
            vec![
                Instr {
                    offset: 0,
                    op: Op::LoadConst,
                    arg: Some(1)
                },
                Instr {
                    offset: 3,
                    op: Op::BinaryMultiply,
                    arg: None
                },
                Instr {
                    offset: 4,
                    op: Op::ReturnValue,
                    arg: None
                },
            ]
        );
    }

    #[test]
    fn deref_name_spans_cells_then_frees() {
        let object = CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: CodeFlags::empty(),
            code: vec![],
            consts: vec![],
            names: vec![],
            varnames: vec![],
            filename: String::new(),
            name: String::new(),
            firstlineno: 1,
            lnotab: vec![],
            freevars: vec!["f".to_owned()],
            cellvars: vec!["c".to_owned()],
        };
        assert_eq!(object.deref_name(0), Some("c"));
        assert_eq!(object.deref_name(1), Some("f"));
        assert_eq!(object.deref_name(2), None);
    }

    #[test]
    fn lnotab_lookup() {
        let object = CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: CodeFlags::empty(),
            code: vec![],
            consts: vec![],
            names: vec![],
            varnames: vec![],
            filename: String::new(),
            name: String::new(),
            firstlineno: 10,
            lnotab: vec![6, 1, 4, 2],
            freevars: vec![],
            cellvars: vec![],
        };
        assert_eq!(object.line_for_offset(0), 10);
        assert_eq!(object.line_for_offset(5), 10);
        assert_eq!(object.line_for_offset(6), 11);
        assert_eq!(object.line_for_offset(10), 13);
    }
}
