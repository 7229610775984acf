//! The canonical opcode set and its static properties.
//!
//! Every shorthand encoding (`ldarg.0`, `ldarg.s`, `ldc.i4.5`, `br.s`, `leave.s`, ...) decodes
//! to one canonical [`OpCode`]; the encoder picks the shortest form again when emitting.
//! Each opcode declares the [`OperandShape`] its operand must have, its [`FlowType`] and
//! its fixed stack effect, if any.

use std::fmt;

use strum::{EnumCount, EnumIter};

use crate::assembly::opcodes as op;

/// The kind of operand an opcode requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandShape {
    /// No operand
    None,
    /// A branch target
    Target,
    /// 32-bit integer constant
    Int32,
    /// 64-bit integer constant
    Int64,
    /// 32-bit float constant
    Float32,
    /// 64-bit float constant
    Float64,
    /// String literal
    String,
    /// Method reference
    Method,
    /// Field reference
    Field,
    /// Type reference
    Type,
    /// Any member reference (`ldtoken`)
    Token,
    /// Local variable reference
    Local,
    /// Argument reference
    Argument,
    /// Switch table
    Switch,
    /// Stand-alone call site signature
    Signature,
}

impl OperandShape {
    /// Lower-case description used in error messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            OperandShape::None => "no operand",
            OperandShape::Target => "a branch target",
            OperandShape::Int32 => "an int32 constant",
            OperandShape::Int64 => "an int64 constant",
            OperandShape::Float32 => "a float32 constant",
            OperandShape::Float64 => "a float64 constant",
            OperandShape::String => "a string",
            OperandShape::Method => "a method",
            OperandShape::Field => "a field",
            OperandShape::Type => "a type",
            OperandShape::Token => "a member",
            OperandShape::Local => "a local",
            OperandShape::Argument => "an argument",
            OperandShape::Switch => "a switch table",
            OperandShape::Signature => "a signature",
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally block
    EndFinally,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// A canonical CIL operation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum OpCode {
    Nop,
    Ldarg,
    Ldarga,
    Starg,
    Ldloc,
    Ldloca,
    Stloc,
    Ldnull,
    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Dup,
    Pop,
    Call,
    Calli,
    Ret,
    Br,
    Brfalse,
    Brtrue,
    Beq,
    Bge,
    Bgt,
    Ble,
    Blt,
    BneUn,
    BgeUn,
    BgtUn,
    BleUn,
    BltUn,
    Switch,
    LdindI1,
    LdindU1,
    LdindI2,
    LdindI4,
    LdindI8,
    LdindR8,
    LdindRef,
    StindRef,
    StindI1,
    StindI2,
    StindI4,
    StindI8,
    StindR8,
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,
    ConvU4,
    ConvU8,
    Callvirt,
    Ldstr,
    Newobj,
    Castclass,
    Isinst,
    Throw,
    Ldfld,
    Ldflda,
    Stfld,
    Ldsfld,
    Ldsflda,
    Stsfld,
    Box,
    UnboxAny,
    Ldtoken,
    Endfinally,
    Leave,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    Rethrow,
}

/// Static description of one [`OpCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    /// Canonical mnemonic
    pub mnemonic: &'static str,
    /// `0` for one-byte opcodes, [`op::FE_PREFIX`] otherwise
    pub prefix: u8,
    /// The (long form) opcode byte
    pub byte: u8,
    /// Required operand kind
    pub shape: OperandShape,
    /// Control flow behaviour
    pub flow: FlowType,
    /// Fixed `(pops, pushes)`; `None` when it depends on the operand or method
    pub stack: Option<(u8, u8)>,
}

const fn info(
    mnemonic: &'static str,
    prefix: u8,
    byte: u8,
    shape: OperandShape,
    flow: FlowType,
    stack: Option<(u8, u8)>,
) -> OpCodeInfo {
    OpCodeInfo {
        mnemonic,
        prefix,
        byte,
        shape,
        flow,
        stack,
    }
}

impl OpCode {
    /// Returns the static description of this opcode.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub const fn info(self) -> OpCodeInfo {
        use FlowType::{
            Call as C, ConditionalBranch as Cb, EndFinally as Ef, Leave as Lv, Return as R,
            Sequential as S, Switch as Sw, Throw as T, UnconditionalBranch as Ub,
        };
        use OperandShape as Sh;

        const P: u8 = op::FE_PREFIX;
        match self {
            OpCode::Nop => info("nop", 0, op::NOP, Sh::None, S, Some((0, 0))),
            OpCode::Ldarg => info("ldarg", P, op::FE_LDARG, Sh::Argument, S, Some((0, 1))),
            OpCode::Ldarga => info("ldarga", P, op::FE_LDARGA, Sh::Argument, S, Some((0, 1))),
            OpCode::Starg => info("starg", P, op::FE_STARG, Sh::Argument, S, Some((1, 0))),
            OpCode::Ldloc => info("ldloc", P, op::FE_LDLOC, Sh::Local, S, Some((0, 1))),
            OpCode::Ldloca => info("ldloca", P, op::FE_LDLOCA, Sh::Local, S, Some((0, 1))),
            OpCode::Stloc => info("stloc", P, op::FE_STLOC, Sh::Local, S, Some((1, 0))),
            OpCode::Ldnull => info("ldnull", 0, op::LDNULL, Sh::None, S, Some((0, 1))),
            OpCode::LdcI4 => info("ldc.i4", 0, op::LDC_I4, Sh::Int32, S, Some((0, 1))),
            OpCode::LdcI8 => info("ldc.i8", 0, op::LDC_I8, Sh::Int64, S, Some((0, 1))),
            OpCode::LdcR4 => info("ldc.r4", 0, op::LDC_R4, Sh::Float32, S, Some((0, 1))),
            OpCode::LdcR8 => info("ldc.r8", 0, op::LDC_R8, Sh::Float64, S, Some((0, 1))),
            OpCode::Dup => info("dup", 0, op::DUP, Sh::None, S, Some((1, 2))),
            OpCode::Pop => info("pop", 0, op::POP, Sh::None, S, Some((1, 0))),
            OpCode::Call => info("call", 0, op::CALL, Sh::Method, C, None),
            OpCode::Calli => info("calli", 0, op::CALLI, Sh::Signature, C, None),
            OpCode::Ret => info("ret", 0, op::RET, Sh::None, R, None),
            OpCode::Br => info("br", 0, op::BR, Sh::Target, Ub, Some((0, 0))),
            OpCode::Brfalse => info("brfalse", 0, op::BRFALSE, Sh::Target, Cb, Some((1, 0))),
            OpCode::Brtrue => info("brtrue", 0, op::BRTRUE, Sh::Target, Cb, Some((1, 0))),
            OpCode::Beq => info("beq", 0, op::BEQ, Sh::Target, Cb, Some((2, 0))),
            OpCode::Bge => info("bge", 0, op::BGE, Sh::Target, Cb, Some((2, 0))),
            OpCode::Bgt => info("bgt", 0, op::BGT, Sh::Target, Cb, Some((2, 0))),
            OpCode::Ble => info("ble", 0, op::BLE, Sh::Target, Cb, Some((2, 0))),
            OpCode::Blt => info("blt", 0, op::BLT, Sh::Target, Cb, Some((2, 0))),
            OpCode::BneUn => info("bne.un", 0, op::BNE_UN, Sh::Target, Cb, Some((2, 0))),
            OpCode::BgeUn => info("bge.un", 0, op::BGE_UN, Sh::Target, Cb, Some((2, 0))),
            OpCode::BgtUn => info("bgt.un", 0, op::BGT_UN, Sh::Target, Cb, Some((2, 0))),
            OpCode::BleUn => info("ble.un", 0, op::BLE_UN, Sh::Target, Cb, Some((2, 0))),
            OpCode::BltUn => info("blt.un", 0, op::BLT_UN, Sh::Target, Cb, Some((2, 0))),
            OpCode::Switch => info("switch", 0, op::SWITCH, Sh::Switch, Sw, Some((1, 0))),
            OpCode::LdindI1 => info("ldind.i1", 0, op::LDIND_I1, Sh::None, S, Some((1, 1))),
            OpCode::LdindU1 => info("ldind.u1", 0, op::LDIND_U1, Sh::None, S, Some((1, 1))),
            OpCode::LdindI2 => info("ldind.i2", 0, op::LDIND_I2, Sh::None, S, Some((1, 1))),
            OpCode::LdindI4 => info("ldind.i4", 0, op::LDIND_I4, Sh::None, S, Some((1, 1))),
            OpCode::LdindI8 => info("ldind.i8", 0, op::LDIND_I8, Sh::None, S, Some((1, 1))),
            OpCode::LdindR8 => info("ldind.r8", 0, op::LDIND_R8, Sh::None, S, Some((1, 1))),
            OpCode::LdindRef => info("ldind.ref", 0, op::LDIND_REF, Sh::None, S, Some((1, 1))),
            OpCode::StindRef => info("stind.ref", 0, op::STIND_REF, Sh::None, S, Some((2, 0))),
            OpCode::StindI1 => info("stind.i1", 0, op::STIND_I1, Sh::None, S, Some((2, 0))),
            OpCode::StindI2 => info("stind.i2", 0, op::STIND_I2, Sh::None, S, Some((2, 0))),
            OpCode::StindI4 => info("stind.i4", 0, op::STIND_I4, Sh::None, S, Some((2, 0))),
            OpCode::StindI8 => info("stind.i8", 0, op::STIND_I8, Sh::None, S, Some((2, 0))),
            OpCode::StindR8 => info("stind.r8", 0, op::STIND_R8, Sh::None, S, Some((2, 0))),
            OpCode::Add => info("add", 0, op::ADD, Sh::None, S, Some((2, 1))),
            OpCode::Sub => info("sub", 0, op::SUB, Sh::None, S, Some((2, 1))),
            OpCode::Mul => info("mul", 0, op::MUL, Sh::None, S, Some((2, 1))),
            OpCode::Div => info("div", 0, op::DIV, Sh::None, S, Some((2, 1))),
            OpCode::DivUn => info("div.un", 0, op::DIV_UN, Sh::None, S, Some((2, 1))),
            OpCode::Rem => info("rem", 0, op::REM, Sh::None, S, Some((2, 1))),
            OpCode::RemUn => info("rem.un", 0, op::REM_UN, Sh::None, S, Some((2, 1))),
            OpCode::And => info("and", 0, op::AND, Sh::None, S, Some((2, 1))),
            OpCode::Or => info("or", 0, op::OR, Sh::None, S, Some((2, 1))),
            OpCode::Xor => info("xor", 0, op::XOR, Sh::None, S, Some((2, 1))),
            OpCode::Shl => info("shl", 0, op::SHL, Sh::None, S, Some((2, 1))),
            OpCode::Shr => info("shr", 0, op::SHR, Sh::None, S, Some((2, 1))),
            OpCode::ShrUn => info("shr.un", 0, op::SHR_UN, Sh::None, S, Some((2, 1))),
            OpCode::Neg => info("neg", 0, op::NEG, Sh::None, S, Some((1, 1))),
            OpCode::Not => info("not", 0, op::NOT, Sh::None, S, Some((1, 1))),
            OpCode::ConvI1 => info("conv.i1", 0, op::CONV_I1, Sh::None, S, Some((1, 1))),
            OpCode::ConvI2 => info("conv.i2", 0, op::CONV_I2, Sh::None, S, Some((1, 1))),
            OpCode::ConvI4 => info("conv.i4", 0, op::CONV_I4, Sh::None, S, Some((1, 1))),
            OpCode::ConvI8 => info("conv.i8", 0, op::CONV_I8, Sh::None, S, Some((1, 1))),
            OpCode::ConvR4 => info("conv.r4", 0, op::CONV_R4, Sh::None, S, Some((1, 1))),
            OpCode::ConvR8 => info("conv.r8", 0, op::CONV_R8, Sh::None, S, Some((1, 1))),
            OpCode::ConvU4 => info("conv.u4", 0, op::CONV_U4, Sh::None, S, Some((1, 1))),
            OpCode::ConvU8 => info("conv.u8", 0, op::CONV_U8, Sh::None, S, Some((1, 1))),
            OpCode::Callvirt => info("callvirt", 0, op::CALLVIRT, Sh::Method, C, None),
            OpCode::Ldstr => info("ldstr", 0, op::LDSTR, Sh::String, S, Some((0, 1))),
            OpCode::Newobj => info("newobj", 0, op::NEWOBJ, Sh::Method, C, None),
            OpCode::Castclass => info("castclass", 0, op::CASTCLASS, Sh::Type, S, Some((1, 1))),
            OpCode::Isinst => info("isinst", 0, op::ISINST, Sh::Type, S, Some((1, 1))),
            OpCode::Throw => info("throw", 0, op::THROW, Sh::None, T, Some((1, 0))),
            OpCode::Ldfld => info("ldfld", 0, op::LDFLD, Sh::Field, S, Some((1, 1))),
            OpCode::Ldflda => info("ldflda", 0, op::LDFLDA, Sh::Field, S, Some((1, 1))),
            OpCode::Stfld => info("stfld", 0, op::STFLD, Sh::Field, S, Some((2, 0))),
            OpCode::Ldsfld => info("ldsfld", 0, op::LDSFLD, Sh::Field, S, Some((0, 1))),
            OpCode::Ldsflda => info("ldsflda", 0, op::LDSFLDA, Sh::Field, S, Some((0, 1))),
            OpCode::Stsfld => info("stsfld", 0, op::STSFLD, Sh::Field, S, Some((1, 0))),
            OpCode::Box => info("box", 0, op::BOX, Sh::Type, S, Some((1, 1))),
            OpCode::UnboxAny => info("unbox.any", 0, op::UNBOX_ANY, Sh::Type, S, Some((1, 1))),
            OpCode::Ldtoken => info("ldtoken", 0, op::LDTOKEN, Sh::Token, S, Some((0, 1))),
            OpCode::Endfinally => info("endfinally", 0, op::ENDFINALLY, Sh::None, Ef, Some((0, 0))),
            OpCode::Leave => info("leave", 0, op::LEAVE, Sh::Target, Lv, Some((0, 0))),
            OpCode::Ceq => info("ceq", P, op::FE_CEQ, Sh::None, S, Some((2, 1))),
            OpCode::Cgt => info("cgt", P, op::FE_CGT, Sh::None, S, Some((2, 1))),
            OpCode::CgtUn => info("cgt.un", P, op::FE_CGT_UN, Sh::None, S, Some((2, 1))),
            OpCode::Clt => info("clt", P, op::FE_CLT, Sh::None, S, Some((2, 1))),
            OpCode::CltUn => info("clt.un", P, op::FE_CLT_UN, Sh::None, S, Some((2, 1))),
            OpCode::Rethrow => info("rethrow", P, op::FE_RETHROW, Sh::None, T, Some((0, 0))),
        }
    }

    /// Canonical mnemonic.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// Required operand kind.
    #[must_use]
    pub const fn shape(self) -> OperandShape {
        self.info().shape
    }

    /// Control flow behaviour.
    #[must_use]
    pub const fn flow(self) -> FlowType {
        self.info().flow
    }

    /// `true` for opcodes whose operand is a single branch target.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self.shape(), OperandShape::Target)
    }

    /// `true` if execution never falls through to the next instruction.
    #[must_use]
    pub const fn ends_block(self) -> bool {
        matches!(
            self.flow(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::Leave
        )
    }

    /// The one-byte short form of a branch, if there is one.
    #[must_use]
    pub const fn short_branch_byte(self) -> Option<u8> {
        match self {
            OpCode::Leave => Some(op::LEAVE_S),
            _ if self.is_branch() => Some(self.info().byte - op::SHORT_BRANCH_DELTA),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::{EnumCount, IntoEnumIterator};

    use super::*;

    #[test]
    fn encodings_are_unique() {
        let mut seen = HashSet::new();
        for opcode in OpCode::iter() {
            let info = opcode.info();
            assert!(
                seen.insert((info.prefix, info.byte)),
                "duplicate encoding for {opcode}"
            );
        }
        assert_eq!(seen.len(), OpCode::COUNT);
    }

    #[test]
    fn short_branches() {
        assert_eq!(OpCode::Br.short_branch_byte(), Some(op::BR_S));
        assert_eq!(OpCode::BltUn.short_branch_byte(), Some(op::BLT_UN_S));
        assert_eq!(OpCode::Leave.short_branch_byte(), Some(op::LEAVE_S));
        assert_eq!(OpCode::Switch.short_branch_byte(), None);
        assert_eq!(OpCode::Add.short_branch_byte(), None);
    }

    #[test]
    fn flow_classification() {
        assert!(OpCode::Ret.ends_block());
        assert!(OpCode::Leave.ends_block());
        assert!(!OpCode::Brtrue.ends_block());
        assert!(OpCode::Brtrue.is_branch());
        assert!(!OpCode::Switch.is_branch());
        assert_eq!(OpCode::Call.flow(), FlowType::Call);
    }
}
