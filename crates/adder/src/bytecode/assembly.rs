//! Composable bytecode fragments with deferred label resolution.
//!
//! Code generation builds a tree of [`Asm`] fragments joined with `+`. The
//! tree is a monoid under concatenation with [`Asm::NoOp`] as the unit, and
//! answers four queries: byte length, label resolution, byte encoding, and
//! stack-depth plumbing, plus line-number emission for the `lnotab`.
//! Finalization walks the tree once per query, so nothing is flattened
//! eagerly.

use std::ops::Add;

use ahash::AHashMap;
use thiserror::Error;

use super::op::Op;

/// A position marker inside an assembly, resolved to a byte address at
/// finalization. Labels are allocated by the code generator; identity is the
/// id, so two labels with the same id are the same jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// Argument of an argumented instruction: either a direct operand or a label
/// whose address is substituted at encode time (absolute or relative
/// depending on the opcode's jump class).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmArg {
    Imm(u32),
    Target(Label),
}

/// A lazy tree of instruction fragments.
#[derive(Debug, Clone)]
pub enum Asm {
    /// The empty fragment; the unit of concatenation.
    NoOp,
    /// Zero-length position marker.
    Label(Label),
    /// Zero-length line-number directive.
    Line(u32),
    /// One instruction, 1 byte if argless else 3.
    Instr { op: Op, arg: Option<AsmArg> },
    /// Synthetic depth adjuster: corrects the plumb trace where bytecode
    /// control flow diverges from textual order. The common case is `-1`,
    /// discarding the residual value of a dead fall-through path.
    OffsetStack(i32),
    /// Concatenation of two fragments; length is cached at construction.
    Chain {
        len: usize,
        left: Box<Asm>,
        right: Box<Asm>,
    },
}

/// Internal assembly failures. These indicate code-generator bugs, not bad
/// input programs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("jump target label was never placed")]
    UnplacedLabel,
    #[error("instruction argument {0} out of u16 range")]
    ArgOutOfRange(i64),
}

impl Asm {
    /// An argless instruction.
    #[must_use]
    pub fn op(op: Op) -> Asm {
        debug_assert!(!op.has_arg(), "{op} requires an argument");
        Asm::Instr { op, arg: None }
    }

    /// An instruction with a direct integer argument.
    #[must_use]
    pub fn op_arg(op: Op, arg: u32) -> Asm {
        debug_assert!(op.has_arg(), "{op} takes no argument");
        Asm::Instr {
            op,
            arg: Some(AsmArg::Imm(arg)),
        }
    }

    /// A jump instruction targeting a label.
    #[must_use]
    pub fn jump(op: Op, target: Label) -> Asm {
        debug_assert!(op.has_jrel() || op.has_jabs(), "{op} is not a jump");
        Asm::Instr {
            op,
            arg: Some(AsmArg::Target(target)),
        }
    }

    /// Byte length of the encoded fragment.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Asm::NoOp | Asm::Label(_) | Asm::Line(_) | Asm::OffsetStack(_) => 0,
            Asm::Instr { arg, .. } => {
                if arg.is_some() {
                    3
                } else {
                    1
                }
            }
            Asm::Chain { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects `(label, byte_address)` pairs in textual order.
    pub fn resolve(&self, start: usize, out: &mut AHashMap<Label, usize>) {
        match self {
            Asm::Label(label) => {
                out.insert(*label, start);
            }
            Asm::Chain { left, right, .. } => {
                left.resolve(start, out);
                right.resolve(start + left.len(), out);
            }
            _ => {}
        }
    }

    /// Appends encoded bytes, substituting label addresses from `addresses`.
    pub fn encode(
        &self,
        start: usize,
        addresses: &AHashMap<Label, usize>,
        out: &mut Vec<u8>,
    ) -> Result<(), AsmError> {
        match self {
            Asm::Instr { op, arg } => {
                let arg = match arg {
                    None => {
                        out.push(*op as u8);
                        return Ok(());
                    }
                    Some(AsmArg::Imm(value)) => i64::from(*value),
                    Some(AsmArg::Target(label)) => {
                        let address = *addresses.get(label).ok_or(AsmError::UnplacedLabel)? as i64;
                        if op.has_jrel() {
                            address - (start as i64 + 3)
                        } else {
                            address
                        }
                    }
                };
                let arg = u16::try_from(arg).map_err(|_| AsmError::ArgOutOfRange(arg))?;
                out.push(*op as u8);
                out.extend_from_slice(&arg.to_le_bytes());
                Ok(())
            }
            Asm::Chain { left, right, .. } => {
                left.encode(start, addresses, out)?;
                right.encode(start + left.len(), addresses, out)
            }
            _ => Ok(()),
        }
    }

    /// Appends the running stack depth after each instruction.
    ///
    /// Jump arguments contribute no stack effect themselves, so label
    /// arguments are traced as zero.
    pub fn plumb(&self, depths: &mut Vec<i32>) {
        match self {
            Asm::Instr { op, arg } => {
                let raw = match arg {
                    Some(AsmArg::Imm(value)) => *value,
                    _ => 0,
                };
                depths.push(depths.last().copied().unwrap_or(0) + op.stack_effect(raw));
            }
            Asm::OffsetStack(delta) => {
                depths.push(depths.last().copied().unwrap_or(0) + delta);
            }
            Asm::Chain { left, right, .. } => {
                left.plumb(depths);
                right.plumb(depths);
            }
            _ => {}
        }
    }

    /// Collects `(byte_offset, source_line)` pairs in textual order.
    pub fn line_nos(&self, start: usize, out: &mut Vec<(usize, u32)>) {
        match self {
            Asm::Line(line) => out.push((start, *line)),
            Asm::Chain { left, right, .. } => {
                left.line_nos(start, out);
                right.line_nos(start + left.len(), out);
            }
            _ => {}
        }
    }
}

impl Add for Asm {
    type Output = Asm;

    fn add(self, other: Asm) -> Asm {
        // Concatenating with the unit would only deepen the tree.
        match (self, other) {
            (Asm::NoOp, other) => other,
            (this, Asm::NoOp) => this,
            (this, other) => Asm::Chain {
                len: this.len() + other.len(),
                left: Box::new(this),
                right: Box::new(other),
            },
        }
    }
}

/// Concatenates a sequence of fragments left to right.
pub fn concat(parts: impl IntoIterator<Item = Asm>) -> Asm {
    parts.into_iter().fold(Asm::NoOp, Asm::add)
}

/// Encodes a finished assembly into its bytecode blob.
pub fn assemble(assembly: &Asm) -> Result<Vec<u8>, AsmError> {
    let mut addresses = AHashMap::new();
    assembly.resolve(0, &mut addresses);
    let mut bytes = Vec::with_capacity(assembly.len());
    assembly.encode(0, &addresses, &mut bytes)?;
    Ok(bytes)
}

/// Maximum stack depth reached by the depth trace, starting from empty.
#[must_use]
pub fn plumb_depths(assembly: &Asm) -> u32 {
    let mut depths = vec![0];
    assembly.plumb(&mut depths);
    depths.into_iter().max().unwrap_or(0).max(0) as u32
}

/// Folds the line-number directives into `(firstlineno, lnotab)`.
///
/// The table is a sequence of unsigned `(Δbyte, Δline)` pairs; deltas wider
/// than a byte are split with `(255, 0)` byte-advances and capped line
/// advances, matching the reference format. Entries that advance neither
/// field emit nothing, and a unit with no line directives gets line 1.
#[must_use]
pub fn make_lnotab(assembly: &Asm) -> (u32, Vec<u8>) {
    let mut pairs = Vec::new();
    assembly.line_nos(0, &mut pairs);

    let mut firstlineno = None;
    let mut lnotab = Vec::new();
    let mut byte = 0usize;
    let mut line = 0u32;
    for (next_byte, next_line) in pairs {
        if firstlineno.is_none() {
            firstlineno = Some(next_line);
            line = next_line;
        } else if line < next_line {
            while byte + 255 < next_byte {
                lnotab.extend_from_slice(&[255, 0]);
                byte += 255;
            }
            while line + 255 < next_line {
                lnotab.extend_from_slice(&[(next_byte - byte) as u8, 255]);
                byte = next_byte;
                line += 255;
            }
            if (byte, line) != (next_byte, next_line) {
                lnotab.extend_from_slice(&[(next_byte - byte) as u8, (next_line - line) as u8]);
                byte = next_byte;
                line = next_line;
            }
        }
    }
    (firstlineno.unwrap_or(1), lnotab)
}
