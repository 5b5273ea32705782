//! The opcode table.
//!
//! Every opcode has a fixed arity of zero or one operand; operands are
//! encoded as 24-bit little-endian values by [`super::builder::CodeBuilder`].
//! Declaration order is grouped by concern (stack, loads/stores, arithmetic,
//! comparison, control flow, construction, calls, module, debug), as a flat
//! `#[repr(u8)]` `Opcode` enum.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::FromRepr)]
#[repr(u8)]
pub enum Opcode {
    // -- stack --
    Pop,
    DupTop,
    DupTopTwo,
    RotTwo,
    RotThree,

    // -- loads / stores --
    LoadConst,
    LoadName,
    LoadLocal,
    LoadGlobal,
    LoadFree,
    LoadBuiltIn,
    StoreLocal,
    StoreGlobal,
    StoreFree,
    StoreName,
    DeleteLocal,
    DeleteGlobal,
    DeleteName,
    LoadAttr,
    StoreAttr,
    DeleteAttr,
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,

    // -- arithmetic / comparison / logic --
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryPower,
    BinaryLShift,
    BinaryRShift,
    BinaryOr,
    BinaryXor,
    BinaryAnd,
    LogicAnd,
    LogicOr,
    InplaceAdd,
    InplaceSub,
    InplaceMul,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceModulo,
    InplacePower,
    InplaceLShift,
    InplaceRShift,
    InplaceOr,
    InplaceXor,
    InplaceAnd,
    CompareEqualTo,
    CompareNotEqualTo,
    CompareLessThan,
    CompareLessThanOrEqualTo,
    CompareGreaterThan,
    CompareGreaterThanOrEqualTo,
    CompareIs,
    CompareIsNot,
    CompareIn,
    CompareNotIn,
    MembershipAs,
    UnaryPositive,
    UnaryNegative,
    UnaryInvert,
    UnaryNot,

    // -- control flow --
    JumpAbsolute,
    PopJumpIfTrue,
    PopJumpIfFalse,
    JumpIfTrueOrPop,
    JumpIfFalseOrPop,
    ForIter,

    // -- construction --
    BuildList,
    BuildMap,
    BuildString,
    FormatValue,
    MakeFunction,
    MakeDecorator,
    BuildSchema,
    BuildSchemaConfig,
    UnpackSequence,

    // -- calls / returns --
    CallFunction,
    ReturnValue,
    Raise,
    Assert,
    Check,
    GetIter,

    // -- module --
    ImportName,
    ImportFrom,

    // -- debug (no-ops in release) --
    DebugGlobals,
    DebugLocals,
    DebugNames,
    DebugStack,
}

impl Opcode {
    /// `true` for opcodes that carry a 24-bit operand.
    #[must_use]
    pub fn has_operand(self) -> bool {
        !matches!(
            self,
            Self::Pop
                | Self::DupTop
                | Self::DupTopTwo
                | Self::RotTwo
                | Self::RotThree
                | Self::BinarySubscr
                | Self::StoreSubscr
                | Self::DeleteSubscr
                | Self::BinaryAdd
                | Self::BinarySub
                | Self::BinaryMul
                | Self::BinaryTrueDivide
                | Self::BinaryFloorDivide
                | Self::BinaryModulo
                | Self::BinaryPower
                | Self::BinaryLShift
                | Self::BinaryRShift
                | Self::BinaryOr
                | Self::BinaryXor
                | Self::BinaryAnd
                | Self::LogicAnd
                | Self::LogicOr
                | Self::InplaceAdd
                | Self::InplaceSub
                | Self::InplaceMul
                | Self::InplaceTrueDivide
                | Self::InplaceFloorDivide
                | Self::InplaceModulo
                | Self::InplacePower
                | Self::InplaceLShift
                | Self::InplaceRShift
                | Self::InplaceOr
                | Self::InplaceXor
                | Self::InplaceAnd
                | Self::CompareEqualTo
                | Self::CompareNotEqualTo
                | Self::CompareLessThan
                | Self::CompareLessThanOrEqualTo
                | Self::CompareGreaterThan
                | Self::CompareGreaterThanOrEqualTo
                | Self::CompareIs
                | Self::CompareIsNot
                | Self::CompareIn
                | Self::CompareNotIn
                | Self::MembershipAs
                | Self::UnaryPositive
                | Self::UnaryNegative
                | Self::UnaryInvert
                | Self::UnaryNot
                | Self::MakeDecorator
                | Self::ReturnValue
                | Self::Raise
                | Self::GetIter
                | Self::DebugGlobals
                | Self::DebugLocals
                | Self::DebugNames
                | Self::DebugStack
        )
    }

    /// Net stack effect for opcodes whose effect doesn't depend on the
    /// operand value. `None` for opcodes whose effect is operand-dependent
    /// (`BUILD_LIST(n)`, `CALL_FUNCTION(a, kw)`, `UNPACK_SEQUENCE(n)`, ...);
    /// callers compute those at the emit site.
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        Some(match self {
            Self::Pop | Self::JumpAbsolute | Self::ImportName | Self::ImportFrom => -1,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,
            Self::RotTwo | Self::RotThree => 0,
            Self::LoadConst | Self::LoadName | Self::LoadLocal | Self::LoadGlobal | Self::LoadFree | Self::LoadBuiltIn => 1,
            Self::StoreLocal | Self::StoreGlobal | Self::StoreFree | Self::StoreName => -1,
            Self::DeleteLocal | Self::DeleteGlobal | Self::DeleteName => 0,
            Self::LoadAttr => 0,
            Self::StoreAttr => -2,
            Self::DeleteAttr => -1,
            Self::BinarySubscr => -1,
            // Pops (value, base, index) and pushes the updated base back, so
            // an assignment through a plain name can be written back with a
            // following STORE_* (see `compiler::compile_store_target`).
            Self::StoreSubscr => -2,
            Self::DeleteSubscr => -2,
            Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryTrueDivide
            | Self::BinaryFloorDivide
            | Self::BinaryModulo
            | Self::BinaryPower
            | Self::BinaryLShift
            | Self::BinaryRShift
            | Self::BinaryOr
            | Self::BinaryXor
            | Self::BinaryAnd
            | Self::LogicAnd
            | Self::LogicOr
            | Self::CompareEqualTo
            | Self::CompareNotEqualTo
            | Self::CompareLessThan
            | Self::CompareLessThanOrEqualTo
            | Self::CompareGreaterThan
            | Self::CompareGreaterThanOrEqualTo
            | Self::CompareIs
            | Self::CompareIsNot
            | Self::CompareIn
            | Self::CompareNotIn => -1,
            Self::InplaceAdd
            | Self::InplaceSub
            | Self::InplaceMul
            | Self::InplaceTrueDivide
            | Self::InplaceFloorDivide
            | Self::InplaceModulo
            | Self::InplacePower
            | Self::InplaceLShift
            | Self::InplaceRShift
            | Self::InplaceOr
            | Self::InplaceXor
            | Self::InplaceAnd => -1,
            Self::MembershipAs => 0,
            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryInvert | Self::UnaryNot => 0,
            Self::PopJumpIfTrue | Self::PopJumpIfFalse => -1,
            Self::JumpIfTrueOrPop | Self::JumpIfFalseOrPop => 0,
            Self::ForIter => 1,
            Self::MakeFunction => 1,
            Self::MakeDecorator => 0,
            Self::BuildSchema => 0,
            Self::BuildSchemaConfig => -2,
            Self::CallFunction | Self::BuildList | Self::BuildMap | Self::BuildString | Self::UnpackSequence => return None,
            Self::FormatValue => 0,
            Self::ReturnValue | Self::Raise | Self::Assert | Self::Check | Self::GetIter => 0,
            Self::DebugGlobals | Self::DebugLocals | Self::DebugNames | Self::DebugStack => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_presence_matches_representative_opcodes() {
        assert!(Opcode::LoadConst.has_operand());
        assert!(!Opcode::Pop.has_operand());
        assert!(!Opcode::ReturnValue.has_operand());
        assert!(Opcode::BuildList.has_operand());
    }
}
