//! The opcode catalog for the target bytecode dialect.
//!
//! Opcode numbers, argument classes, and stack effects match the reference
//! virtual machine's instruction set. Instructions are one byte for argless
//! opcodes and three bytes (opcode + little-endian u16) for opcodes at or
//! above [`HAVE_ARGUMENT`].

use num_enum::TryFromPrimitive;
use strum::Display;

/// Opcodes numerically at or above this value take a two-byte argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// A bytecode instruction opcode.
///
/// Discriminants are the reference dialect's opcode numbers, so encoded
/// bytecode is binary-compatible with the reference VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Op {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    Nop = 9,

    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,

    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,

    StoreMap = 54,
    StoreSubscr = 60,

    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,

    GetIter = 68,
    LoadBuildClass = 71,

    BreakLoop = 80,
    ReturnValue = 83,
    PopBlock = 87,
    EndFinally = 88,
    PopExcept = 89,

    StoreName = 90,
    UnpackSequence = 92,
    ForIter = 93,
    StoreAttr = 95,
    StoreGlobal = 97,

    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,

    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,

    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,

    LoadFast = 124,
    StoreFast = 125,

    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,

    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
}

impl Op {
    /// Returns true if this opcode is followed by a two-byte argument.
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Argument indexes the constants pool.
    #[must_use]
    pub fn has_const(self) -> bool {
        self == Op::LoadConst
    }

    /// Argument indexes the names pool.
    #[must_use]
    pub fn has_name(self) -> bool {
        matches!(
            self,
            Op::StoreName
                | Op::StoreAttr
                | Op::StoreGlobal
                | Op::LoadName
                | Op::LoadAttr
                | Op::ImportName
                | Op::ImportFrom
                | Op::LoadGlobal
        )
    }

    /// Argument indexes the varnames pool (fast locals).
    #[must_use]
    pub fn has_local(self) -> bool {
        matches!(self, Op::LoadFast | Op::StoreFast)
    }

    /// Argument indexes the combined cellvars ++ freevars space.
    #[must_use]
    pub fn has_free(self) -> bool {
        matches!(self, Op::LoadClosure | Op::LoadDeref | Op::StoreDeref)
    }

    /// Argument is a relative jump offset from the following instruction.
    #[must_use]
    pub fn has_jrel(self) -> bool {
        matches!(
            self,
            Op::ForIter | Op::JumpForward | Op::SetupLoop | Op::SetupExcept | Op::SetupFinally
        )
    }

    /// Argument is an absolute bytecode address.
    #[must_use]
    pub fn has_jabs(self) -> bool {
        matches!(
            self,
            Op::JumpIfFalseOrPop
                | Op::JumpIfTrueOrPop
                | Op::JumpAbsolute
                | Op::PopJumpIfFalse
                | Op::PopJumpIfTrue
                | Op::ContinueLoop
        )
    }

    /// Returns the signed change in value-stack depth produced by executing
    /// this opcode with the given raw argument.
    ///
    /// For conditional pops and exception setup the value is the reference
    /// dialect's worst-case figure, so a depth trace built from these effects
    /// is an upper bound on any runtime depth.
    #[must_use]
    pub fn stack_effect(self, arg: u32) -> i32 {
        let arg = arg as i32;
        // Call opcodes encode (n_kw << 8) | n_pos; each keyword occupies
        // a (key, value) pair on the stack.
        let call_args = (arg & 0xff) + 2 * (arg >> 8);
        match self {
            Op::PopTop => -1,
            Op::RotTwo | Op::RotThree | Op::Nop => 0,
            Op::DupTop => 1,

            Op::UnaryPositive | Op::UnaryNegative | Op::UnaryNot | Op::UnaryInvert => 0,

            Op::BinaryPower
            | Op::BinaryMultiply
            | Op::BinaryModulo
            | Op::BinaryAdd
            | Op::BinarySubtract
            | Op::BinarySubscr
            | Op::BinaryFloorDivide
            | Op::BinaryTrueDivide
            | Op::BinaryLshift
            | Op::BinaryRshift
            | Op::BinaryAnd
            | Op::BinaryXor
            | Op::BinaryOr => -1,

            Op::StoreMap => -2,
            Op::StoreSubscr => -3,

            Op::GetIter => 0,
            Op::LoadBuildClass => 1,

            Op::BreakLoop | Op::PopBlock | Op::PopExcept => 0,
            Op::ReturnValue => -1,
            Op::EndFinally => -1,

            Op::StoreName | Op::StoreGlobal => -1,
            Op::UnpackSequence => arg - 1,
            Op::ForIter => 1,
            Op::StoreAttr => -2,

            Op::LoadConst | Op::LoadName | Op::LoadGlobal | Op::LoadFast => 1,
            Op::BuildTuple | Op::BuildList => 1 - arg,
            Op::BuildMap => 1,
            Op::LoadAttr => 0,
            Op::CompareOp => -1,
            Op::ImportName => -1,
            Op::ImportFrom => 1,

            Op::JumpForward
            | Op::JumpIfFalseOrPop
            | Op::JumpIfTrueOrPop
            | Op::JumpAbsolute
            | Op::ContinueLoop => 0,
            Op::PopJumpIfFalse | Op::PopJumpIfTrue => -1,

            Op::SetupLoop => 0,
            // Worst case at handler entry: two (traceback, value, type) triples.
            Op::SetupExcept | Op::SetupFinally => 6,

            Op::StoreFast => -1,

            Op::RaiseVarargs => -arg,
            Op::CallFunction => -call_args,
            Op::CallFunctionVar | Op::CallFunctionKw => -call_args - 1,
            Op::CallFunctionVarKw => -call_args - 2,
            Op::MakeFunction => -1 - call_args,
            Op::MakeClosure => -2 - call_args,
            Op::LoadClosure | Op::LoadDeref => 1,
            Op::StoreDeref => -1,
        }
    }
}

/// Comparison operator indexes for the `COMPARE_OP` argument.
///
/// Matches the reference dialect's comparison table; `ExcMatch` is the
/// exception-match test used by handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Cmp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExcMatch = 10,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_threshold_matches_dialect() {
        assert!(!Op::ReturnValue.has_arg());
        assert!(!Op::PopExcept.has_arg());
        assert!(Op::StoreName.has_arg());
        assert!(Op::LoadConst.has_arg());
        assert_eq!(Op::StoreName as u8, HAVE_ARGUMENT);
    }

    #[test]
    fn opcode_numbers_are_dialect_values() {
        assert_eq!(Op::PopTop as u8, 1);
        assert_eq!(Op::BinaryMultiply as u8, 20);
        assert_eq!(Op::LoadConst as u8, 100);
        assert_eq!(Op::CallFunction as u8, 131);
        assert_eq!(Op::LoadDeref as u8, 136);
    }

    #[test]
    fn byte_round_trip() {
        for byte in 0..=255u8 {
            if let Ok(op) = Op::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        // Generator opcodes are deliberately absent from the table.
        assert!(Op::try_from(86).is_err()); // YIELD_VALUE
        assert!(Op::try_from(72).is_err()); // YIELD_FROM
    }

    #[test]
    fn display_uses_dialect_names() {
        assert_eq!(Op::LoadConst.to_string(), "LOAD_CONST");
        assert_eq!(Op::JumpIfFalseOrPop.to_string(), "JUMP_IF_FALSE_OR_POP");
        assert_eq!(Op::CallFunctionVarKw.to_string(), "CALL_FUNCTION_VAR_KW");
    }

    #[test]
    fn call_effect_counts_keyword_pairs() {
        // 2 positional + 1 keyword pair: pops 2 + 2 + callable, pushes result.
        assert_eq!(Op::CallFunction.stack_effect((1 << 8) | 2), -4);
        assert_eq!(Op::CallFunction.stack_effect(0), 0);
        assert_eq!(Op::CallFunctionVarKw.stack_effect(0), -2);
    }

    #[test]
    fn jump_classes_are_disjoint() {
        for byte in 0..=255u8 {
            if let Ok(op) = Op::try_from(byte) {
                assert!(!(op.has_jrel() && op.has_jabs()), "{op} in both classes");
            }
        }
    }
}
