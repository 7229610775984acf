//! The structural instruction model.
//!
//! An [`Instruction`] is an [`OpCode`] plus a typed [`Operand`], the [`Label`]s attached to
//! it and the [`ExceptionBlock`] operations that open or close regions right before it.
//! Operands hold resolved handles instead of raw tokens, so a list decoded from one body
//! can be re-emitted into another body with a different token space.
//!
//! ```rust
//! use dotpatch::assembly::{Instruction, Label, OpCode, Operand};
//!
//! let exit = Label::new();
//! let branch = Instruction::new(OpCode::Br, Operand::Target(exit.clone()))?;
//! let ret = Instruction::simple(OpCode::Ret)?.with_label(exit.clone());
//!
//! assert_eq!(branch.branch_targets(), vec![&exit]);
//! assert!(ret.labels.contains(&exit));
//! assert!(Instruction::new(OpCode::Ret, Operand::Int32(1)).is_err());
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{fmt, sync::Arc};

use crate::{
    assembly::{instructions::OperandShape, label::Label, OpCode},
    metadata::{resolver::Member, signatures::TypeSignature},
    runtime::{FieldHandle, MethodHandle, TypeHandle},
    Error, Result,
};

/// A reference to a local variable slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRef {
    /// Slot index
    pub index: u16,
    /// Declared type, when known
    pub ty: Option<TypeSignature>,
}

impl LocalRef {
    /// Reference to slot `index` without type information.
    #[must_use]
    pub fn new(index: u16) -> Self {
        LocalRef { index, ty: None }
    }

    /// Reference to slot `index` of type `ty`.
    #[must_use]
    pub fn typed(index: u16, ty: TypeSignature) -> Self {
        LocalRef {
            index,
            ty: Some(ty),
        }
    }
}

/// A reference to an argument. Index 0 is `this` for instance methods.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentRef {
    /// Argument index, counting `this`
    pub index: u16,
    /// Declared parameter name, when known
    pub name: Option<String>,
    /// Declared type, when known
    pub ty: Option<TypeSignature>,
}

impl ArgumentRef {
    /// Reference to argument `index` without name or type.
    #[must_use]
    pub fn new(index: u16) -> Self {
        ArgumentRef {
            index,
            name: None,
            ty: None,
        }
    }
}

/// The typed operand of an instruction.
#[derive(Debug, Clone)]
pub enum Operand {
    /// No operand
    None,
    /// Branch target
    Target(Label),
    /// 32-bit integer constant
    Int32(i32),
    /// 64-bit integer constant
    Int64(i64),
    /// 32-bit float constant
    Float32(f32),
    /// 64-bit float constant
    Float64(f64),
    /// String literal
    String(Arc<str>),
    /// Method reference
    Method(MethodHandle),
    /// Field reference
    Field(FieldHandle),
    /// Type reference
    Type(TypeHandle),
    /// Any member (`ldtoken`)
    Member(Member),
    /// Local variable
    Local(LocalRef),
    /// Argument
    Argument(ArgumentRef),
    /// Switch table
    Switch(Vec<Label>),
    /// Raw stand-alone signature blob
    Signature(Vec<u8>),
}

impl Operand {
    /// The shape this operand satisfies.
    #[must_use]
    pub fn shape(&self) -> OperandShape {
        match self {
            Operand::None => OperandShape::None,
            Operand::Target(_) => OperandShape::Target,
            Operand::Int32(_) => OperandShape::Int32,
            Operand::Int64(_) => OperandShape::Int64,
            Operand::Float32(_) => OperandShape::Float32,
            Operand::Float64(_) => OperandShape::Float64,
            Operand::String(_) => OperandShape::String,
            Operand::Method(_) => OperandShape::Method,
            Operand::Field(_) => OperandShape::Field,
            Operand::Type(_) => OperandShape::Type,
            Operand::Member(_) => OperandShape::Token,
            Operand::Local(_) => OperandShape::Local,
            Operand::Argument(_) => OperandShape::Argument,
            Operand::Switch(_) => OperandShape::Switch,
            Operand::Signature(_) => OperandShape::Signature,
        }
    }

    /// `true` if this operand may be used with an opcode of shape `shape`.
    #[must_use]
    pub fn fits(&self, shape: OperandShape) -> bool {
        self.shape() == shape
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Target(label) => write!(f, "{label}"),
            Operand::Int32(value) => write!(f, "{value}"),
            Operand::Int64(value) => write!(f, "{value}"),
            Operand::Float32(value) => write!(f, "{value}"),
            Operand::Float64(value) => write!(f, "{value}"),
            Operand::String(value) => write!(f, "{value:?}"),
            Operand::Method(method) => write!(f, "{method}"),
            Operand::Field(field) => write!(f, "{field}"),
            Operand::Type(ty) => write!(f, "{ty}"),
            Operand::Member(member) => write!(f, "{member}"),
            Operand::Local(local) => write!(f, "V_{}", local.index),
            Operand::Argument(arg) => match &arg.name {
                Some(name) => write!(f, "{} ({name})", arg.index),
                None => write!(f, "A_{}", arg.index),
            },
            Operand::Switch(labels) => {
                f.write_str("(")?;
                for (i, label) in labels.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{label}")?;
                }
                f.write_str(")")
            }
            Operand::Signature(blob) => write!(f, "sig[{}]", blob.len()),
        }
    }
}

/// Which exception region operation a block performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BlockKind {
    /// Opens a protected region
    BeginTry,
    /// Opens a typed catch handler of the innermost open region
    BeginCatch,
    /// Opens a finally handler of the innermost open region
    BeginFinally,
    /// Opens a fault handler of the innermost open region
    BeginFault,
    /// Closes the innermost open region and its last handler
    EndTry,
}

/// An exception region operation applied immediately before an instruction.
#[derive(Debug, Clone)]
pub struct ExceptionBlock {
    /// The operation
    pub kind: BlockKind,
    /// Caught type for [`BlockKind::BeginCatch`]
    pub catch_type: Option<TypeHandle>,
}

impl ExceptionBlock {
    /// Opens a protected region.
    #[must_use]
    pub fn begin_try() -> Self {
        ExceptionBlock {
            kind: BlockKind::BeginTry,
            catch_type: None,
        }
    }

    /// Opens a handler catching `ty` and its subclasses.
    #[must_use]
    pub fn begin_catch(ty: TypeHandle) -> Self {
        ExceptionBlock {
            kind: BlockKind::BeginCatch,
            catch_type: Some(ty),
        }
    }

    /// Opens a finally handler.
    #[must_use]
    pub fn begin_finally() -> Self {
        ExceptionBlock {
            kind: BlockKind::BeginFinally,
            catch_type: None,
        }
    }

    /// Opens a fault handler.
    #[must_use]
    pub fn begin_fault() -> Self {
        ExceptionBlock {
            kind: BlockKind::BeginFault,
            catch_type: None,
        }
    }

    /// Closes the innermost region.
    #[must_use]
    pub fn end_try() -> Self {
        ExceptionBlock {
            kind: BlockKind::EndTry,
            catch_type: None,
        }
    }
}

impl fmt::Display for ExceptionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.catch_type {
            Some(ty) => write!(f, "{}({ty})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// One instruction of a method body.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The canonical operation
    pub opcode: OpCode,
    /// The typed operand, matching `opcode`'s shape
    pub operand: Operand,
    /// Labels attached to this instruction (no duplicates)
    pub labels: Vec<Label>,
    /// Region operations applied before this instruction, in order
    pub blocks: Vec<ExceptionBlock>,
    /// Byte offset in the body it was decoded from, or last encoded into
    pub offset: u32,
}

impl Instruction {
    /// Creates an instruction, rejecting an operand that does not match the opcode.
    ///
    /// # Errors
    /// Returns [`Error::OperandMismatch`] if `operand` has the wrong shape.
    pub fn new(opcode: OpCode, operand: Operand) -> Result<Self> {
        let expected = opcode.shape();
        if !operand.fits(expected) {
            return Err(Error::OperandMismatch {
                mnemonic: opcode.mnemonic(),
                expected: expected.describe(),
            });
        }

        Ok(Instruction {
            opcode,
            operand,
            labels: Vec::new(),
            blocks: Vec::new(),
            offset: 0,
        })
    }

    /// Creates an instruction without operand.
    ///
    /// # Errors
    /// Returns [`Error::OperandMismatch`] if `opcode` requires an operand.
    pub fn simple(opcode: OpCode) -> Result<Self> {
        Self::new(opcode, Operand::None)
    }

    /// Attaches `label`, ignoring duplicates.
    #[must_use]
    pub fn with_label(mut self, label: Label) -> Self {
        self.add_label(label);
        self
    }

    /// Appends a region operation.
    #[must_use]
    pub fn with_block(mut self, block: ExceptionBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Attaches `label`, ignoring duplicates.
    pub fn add_label(&mut self, label: Label) {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }

    /// Moves every label of this instruction onto `target`.
    ///
    /// Used when an instruction is replaced so that branches into it land on the replacement.
    pub fn move_labels_to(&mut self, target: &mut Instruction) {
        for label in self.labels.drain(..) {
            target.add_label(label);
        }
    }

    /// Moves every region operation of this instruction in front of `target`'s own.
    pub fn move_blocks_to(&mut self, target: &mut Instruction) {
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.append(&mut target.blocks);
        target.blocks = blocks;
    }

    /// `true` for branches, `leave` and `switch`.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self.operand, Operand::Target(_) | Operand::Switch(_))
    }

    /// Every label this instruction may jump to.
    #[must_use]
    pub fn branch_targets(&self) -> Vec<&Label> {
        match &self.operand {
            Operand::Target(label) => vec![label],
            Operand::Switch(labels) => labels.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Canonical mnemonic of the opcode.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.opcode.mnemonic()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            writeln!(f, "          .{block}")?;
        }
        for label in &self.labels {
            writeln!(f, "        {label}:")?;
        }
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        if !matches!(self.operand, Operand::None) {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_shape_checked() {
        assert!(Instruction::new(OpCode::LdcI4, Operand::Int32(3)).is_ok());
        assert!(Instruction::new(OpCode::LdcI4, Operand::Int64(3)).is_err());
        assert!(Instruction::new(OpCode::Br, Operand::None).is_err());

        match Instruction::simple(OpCode::Ldloc) {
            Err(Error::OperandMismatch { mnemonic, expected }) => {
                assert_eq!(mnemonic, "ldloc");
                assert_eq!(expected, "a local");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn labels_are_a_set() {
        let label = Label::new();
        let instruction = Instruction::simple(OpCode::Nop)
            .unwrap()
            .with_label(label.clone())
            .with_label(label.clone());
        assert_eq!(instruction.labels.len(), 1);
    }

    #[test]
    fn moving_labels_and_blocks() {
        let label = Label::new();
        let mut old = Instruction::simple(OpCode::Ret)
            .unwrap()
            .with_label(label.clone())
            .with_block(ExceptionBlock::end_try());
        let mut new = Instruction::simple(OpCode::Nop)
            .unwrap()
            .with_block(ExceptionBlock::begin_try());

        old.move_labels_to(&mut new);
        old.move_blocks_to(&mut new);

        assert!(old.labels.is_empty());
        assert!(old.blocks.is_empty());
        assert_eq!(new.labels, vec![label]);
        let kinds: Vec<_> = new.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BlockKind::EndTry, BlockKind::BeginTry]);
    }

    #[test]
    fn switch_targets() {
        let a = Label::new();
        let b = Label::new();
        let switch =
            Instruction::new(OpCode::Switch, Operand::Switch(vec![a.clone(), b.clone()])).unwrap();
        assert!(switch.is_branch());
        assert_eq!(switch.branch_targets(), vec![&a, &b]);
    }
}
