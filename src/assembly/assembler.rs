//! Fluent construction of instruction lists.
//!
//! [`InstructionAssembler`] appends canonical instructions and attaches pending labels and
//! exception blocks to the next instruction it emits. Operand errors are collected and
//! reported once by [`InstructionAssembler::finish`], so calls can be chained.
//!
//! ```rust
//! use dotpatch::assembly::{InstructionAssembler, Label, OpCode};
//!
//! // x >= 0
//! let negative = Label::new();
//! let body = InstructionAssembler::new()
//!     .ldarg(0)
//!     .ldc_i4(0)
//!     .branch(OpCode::Blt, &negative)
//!     .ldc_i4(1)
//!     .ret()
//!     .label(&negative)
//!     .ldc_i4(0)
//!     .ret()
//!     .finish()?;
//! assert_eq!(body.len(), 7);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::sync::Arc;

use crate::{
    assembly::{ArgumentRef, ExceptionBlock, Instruction, Label, LocalRef, OpCode, Operand},
    metadata::{resolver::Member, signatures::TypeSignature},
    runtime::{FieldHandle, MethodHandle, TypeHandle},
    Error, Result,
};

/// Builder for instruction lists.
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    instructions: Vec<Instruction>,
    labels: Vec<Label>,
    blocks: Vec<ExceptionBlock>,
    error: Option<Error>,
}

impl InstructionAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        InstructionAssembler::default()
    }

    /// Appends `opcode` with `operand`.
    pub fn emit(&mut self, opcode: OpCode, operand: Operand) -> &mut Self {
        if self.error.is_some() {
            return self;
        }

        match Instruction::new(opcode, operand) {
            Ok(mut instruction) => {
                for label in self.labels.drain(..) {
                    instruction.add_label(label);
                }
                instruction.blocks.append(&mut self.blocks);
                self.instructions.push(instruction);
            }
            Err(error) => self.error = Some(error),
        }
        self
    }

    /// Appends a prepared instruction, keeping its own labels and blocks after the pending
    /// ones.
    pub fn push(&mut self, mut instruction: Instruction) -> &mut Self {
        if self.error.is_some() {
            return self;
        }

        for label in self.labels.drain(..) {
            instruction.add_label(label);
        }
        if !self.blocks.is_empty() {
            let mut blocks = std::mem::take(&mut self.blocks);
            blocks.append(&mut instruction.blocks);
            instruction.blocks = blocks;
        }
        self.instructions.push(instruction);
        self
    }

    /// Appends an instruction without operand.
    pub fn op(&mut self, opcode: OpCode) -> &mut Self {
        self.emit(opcode, Operand::None)
    }

    /// Attaches `label` to the next instruction.
    pub fn label(&mut self, label: &Label) -> &mut Self {
        if !self.labels.contains(label) {
            self.labels.push(label.clone());
        }
        self
    }

    /// Opens a protected region at the next instruction.
    pub fn begin_try(&mut self) -> &mut Self {
        self.blocks.push(ExceptionBlock::begin_try());
        self
    }

    /// Starts a handler catching `ty` at the next instruction.
    pub fn begin_catch(&mut self, ty: &TypeHandle) -> &mut Self {
        self.blocks.push(ExceptionBlock::begin_catch(ty.clone()));
        self
    }

    /// Starts a finally handler at the next instruction.
    pub fn begin_finally(&mut self) -> &mut Self {
        self.blocks.push(ExceptionBlock::begin_finally());
        self
    }

    /// Starts a fault handler at the next instruction.
    pub fn begin_fault(&mut self) -> &mut Self {
        self.blocks.push(ExceptionBlock::begin_fault());
        self
    }

    /// Closes the innermost region before the next instruction.
    pub fn end_try(&mut self) -> &mut Self {
        self.blocks.push(ExceptionBlock::end_try());
        self
    }

    /// Loads argument `index`.
    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Ldarg, Operand::Argument(ArgumentRef::new(index)))
    }

    /// Loads the address of argument `index`.
    pub fn ldarga(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Ldarga, Operand::Argument(ArgumentRef::new(index)))
    }

    /// Stores into argument `index`.
    pub fn starg(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Starg, Operand::Argument(ArgumentRef::new(index)))
    }

    /// Loads local `index`.
    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Ldloc, Operand::Local(LocalRef::new(index)))
    }

    /// Loads the address of local `index`.
    pub fn ldloca(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Ldloca, Operand::Local(LocalRef::new(index)))
    }

    /// Stores into local `index`.
    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::Stloc, Operand::Local(LocalRef::new(index)))
    }

    /// Pushes a 32-bit constant.
    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.emit(OpCode::LdcI4, Operand::Int32(value))
    }

    /// Pushes a 64-bit constant.
    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.emit(OpCode::LdcI8, Operand::Int64(value))
    }

    /// Pushes a float constant.
    pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
        self.emit(OpCode::LdcR8, Operand::Float64(value))
    }

    /// Pushes a string literal.
    pub fn ldstr(&mut self, value: &str) -> &mut Self {
        self.emit(OpCode::Ldstr, Operand::String(Arc::from(value)))
    }

    /// Calls `method`.
    pub fn call(&mut self, method: &MethodHandle) -> &mut Self {
        self.emit(OpCode::Call, Operand::Method(method.clone()))
    }

    /// Calls `method` through its receiver.
    pub fn callvirt(&mut self, method: &MethodHandle) -> &mut Self {
        self.emit(OpCode::Callvirt, Operand::Method(method.clone()))
    }

    /// Allocates an object and runs `constructor` on it.
    pub fn newobj(&mut self, constructor: &MethodHandle) -> &mut Self {
        self.emit(OpCode::Newobj, Operand::Method(constructor.clone()))
    }

    /// Loads an instance field.
    pub fn ldfld(&mut self, field: &FieldHandle) -> &mut Self {
        self.emit(OpCode::Ldfld, Operand::Field(field.clone()))
    }

    /// Stores an instance field.
    pub fn stfld(&mut self, field: &FieldHandle) -> &mut Self {
        self.emit(OpCode::Stfld, Operand::Field(field.clone()))
    }

    /// Loads a static field.
    pub fn ldsfld(&mut self, field: &FieldHandle) -> &mut Self {
        self.emit(OpCode::Ldsfld, Operand::Field(field.clone()))
    }

    /// Stores a static field.
    pub fn stsfld(&mut self, field: &FieldHandle) -> &mut Self {
        self.emit(OpCode::Stsfld, Operand::Field(field.clone()))
    }

    /// Tests the top of the stack against `ty`.
    pub fn isinst(&mut self, ty: &TypeHandle) -> &mut Self {
        self.emit(OpCode::Isinst, Operand::Type(ty.clone()))
    }

    /// Pushes the runtime handle of `member`.
    pub fn ldtoken(&mut self, member: Member) -> &mut Self {
        self.emit(OpCode::Ldtoken, Operand::Member(member))
    }

    /// Appends a branch of kind `opcode` to `target`.
    pub fn branch(&mut self, opcode: OpCode, target: &Label) -> &mut Self {
        self.emit(opcode, Operand::Target(target.clone()))
    }

    /// Leaves a protected region for `target`.
    pub fn leave(&mut self, target: &Label) -> &mut Self {
        self.branch(OpCode::Leave, target)
    }

    /// Emits a jump table.
    pub fn switch(&mut self, targets: &[Label]) -> &mut Self {
        self.emit(OpCode::Switch, Operand::Switch(targets.to_vec()))
    }

    /// Loads through a pointer to a location of type `ty`.
    pub fn ldind(&mut self, ty: &TypeSignature) -> &mut Self {
        self.op(ldind_for(ty))
    }

    /// Stores through a pointer to a location of type `ty`.
    pub fn stind(&mut self, ty: &TypeSignature) -> &mut Self {
        self.op(stind_for(ty))
    }

    /// Returns.
    pub fn ret(&mut self) -> &mut Self {
        self.op(OpCode::Ret)
    }

    /// Throws the object on the stack.
    pub fn throw(&mut self) -> &mut Self {
        self.op(OpCode::Throw)
    }

    /// Number of emitted instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// `true` before the first instruction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns the instructions.
    ///
    /// # Errors
    /// Returns the first operand error, or [`Error::Malformed`] if labels or blocks are left
    /// pending after the last instruction.
    pub fn finish(&mut self) -> Result<Vec<Instruction>> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.labels.is_empty() || !self.blocks.is_empty() {
            return Err(malformed_error!(
                "{} label(s) and {} block(s) follow the last instruction",
                self.labels.len(),
                self.blocks.len()
            ));
        }
        Ok(std::mem::take(&mut self.instructions))
    }
}

/// The `ldind` variant for a location of type `ty`.
#[must_use]
pub fn ldind_for(ty: &TypeSignature) -> OpCode {
    match ty.base() {
        TypeSignature::Boolean => OpCode::LdindU1,
        TypeSignature::I4 => OpCode::LdindI4,
        TypeSignature::I8 => OpCode::LdindI8,
        TypeSignature::R8 => OpCode::LdindR8,
        _ => OpCode::LdindRef,
    }
}

/// The `stind` variant for a location of type `ty`.
#[must_use]
pub fn stind_for(ty: &TypeSignature) -> OpCode {
    match ty.base() {
        TypeSignature::Boolean => OpCode::StindI1,
        TypeSignature::I4 => OpCode::StindI4,
        TypeSignature::I8 => OpCode::StindI8,
        TypeSignature::R8 => OpCode::StindR8,
        _ => OpCode::StindRef,
    }
}
