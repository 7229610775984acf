//! Emission of instruction lists into method bodies.
//!
//! [`encode_method`] is the inverse of [`crate::assembly::decode_method`]. Labels are realised
//! to offsets for this emission only, so the same list can be encoded into any number of
//! bodies. Every instruction gets its most compact encoding:
//!
//! - `ldarg`/`ldloc`/`stloc` 0-3 use the one byte forms, indices up to 255 the `.s` forms
//! - `ldc.i4` uses `ldc.i4.m1`..`ldc.i4.8`, then `ldc.i4.s`, then the full form
//! - branches start long and are shrunk to their `.s` form while the displacement fits
//!
//! Member operands are turned back into tokens through a [`TokenSink`], which decides the
//! token space of the produced body: [`ModuleTokens`] for module methods, a
//! [`crate::runtime::DynamicTokenTable`] for generated ones.
//!
//! # Integrity
//!
//! Every label referenced by an operand must be attached to exactly one instruction,
//! otherwise encoding fails with [`Error::LabelIntegrity`]. Exception blocks must be
//! balanced. The maximum stack depth is recomputed by simulating the stack along every path.

use std::collections::HashMap;

use log::debug;

use crate::{
    assembly::{
        collect_regions, instructions::FlowType, opcodes as op, ExceptionRegion, HandlerKind,
        Instruction, Label, OpCode, Operand,
    },
    file::io::write_le,
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        resolver::Member,
        signatures::{encode_local_var_signature, TypeSignature},
        token::Token,
    },
    runtime::{FieldHandle, MethodDef, MethodHandle, Module, TypeHandle},
    Error, Result,
};

/// Hands out tokens for members referenced by an encoded body.
pub trait TokenSink {
    /// Token referring to `method`.
    ///
    /// # Errors
    /// Implementation specific.
    fn method_token(&mut self, method: &MethodHandle) -> Result<Token>;

    /// Token referring to `field`.
    ///
    /// # Errors
    /// Implementation specific.
    fn field_token(&mut self, field: &FieldHandle) -> Result<Token>;

    /// Token referring to `ty`.
    ///
    /// # Errors
    /// Implementation specific.
    fn type_token(&mut self, ty: &TypeHandle) -> Result<Token>;

    /// Token of a user string.
    ///
    /// # Errors
    /// Implementation specific.
    fn string_token(&mut self, value: &str) -> Result<Token>;

    /// Token of a stand-alone signature blob.
    ///
    /// # Errors
    /// Implementation specific.
    fn signature_token(&mut self, blob: &[u8]) -> Result<Token>;

    /// Token referring to any member.
    ///
    /// # Errors
    /// Whatever the specific method reports.
    fn member_token(&mut self, member: &Member) -> Result<Token> {
        match member {
            Member::Method(method) => self.method_token(method),
            Member::Field(field) => self.field_token(field),
            Member::Type(ty) => self.type_token(ty),
        }
    }
}

/// Tokens of the runtime module: definitions keep their own token, strings and signatures
/// are added to the module heaps.
pub struct ModuleTokens<'a> {
    module: &'a Module,
}

impl<'a> ModuleTokens<'a> {
    /// Creates a sink writing into `module`.
    #[must_use]
    pub fn new(module: &'a Module) -> Self {
        ModuleTokens { module }
    }
}

impl TokenSink for ModuleTokens<'_> {
    fn method_token(&mut self, method: &MethodHandle) -> Result<Token> {
        Ok(method.token)
    }

    fn field_token(&mut self, field: &FieldHandle) -> Result<Token> {
        Ok(field.token)
    }

    fn type_token(&mut self, ty: &TypeHandle) -> Result<Token> {
        Ok(ty.token)
    }

    fn string_token(&mut self, value: &str) -> Result<Token> {
        self.module.add_string(value)
    }

    fn signature_token(&mut self, blob: &[u8]) -> Result<Token> {
        self.module.add_signature(blob.to_vec())
    }
}

/// Body level settings for [`encode_method`].
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Local variable types, in slot order
    pub locals: Vec<TypeSignature>,
    /// `true` if `ret` pops a value
    pub returns_value: bool,
    /// Sets the `InitLocals` header flag
    pub init_locals: bool,
}

impl EncodeOptions {
    /// Options for a body of `method` with the given locals.
    #[must_use]
    pub fn for_method(method: &MethodDef, locals: Vec<TypeSignature>) -> Self {
        EncodeOptions {
            locals,
            returns_value: method.returns_value(),
            init_locals: true,
        }
    }
}

/// Result of [`encode_method`].
#[derive(Debug, Clone)]
pub struct EncodedMethod {
    /// Complete body, header and exception sections included
    pub body: Vec<u8>,
    /// Number of instruction bytes
    pub code_size: usize,
    /// Computed maximum stack depth
    pub max_stack: usize,
    /// Code offset of every instruction
    pub offsets: Vec<u32>,
}

const SHORT_BRANCH_SIZE: usize = 2;
const LONG_BRANCH_SIZE: usize = 5;
const MAX_RELAXATION_PASSES: usize = 100;

enum Piece {
    Fixed(Vec<u8>),
    Branch {
        opcode: OpCode,
        target: usize,
        short: bool,
    },
    Switch(Vec<usize>),
}

impl Piece {
    fn size(&self) -> usize {
        match self {
            Piece::Fixed(bytes) => bytes.len(),
            Piece::Branch { short: true, .. } => SHORT_BRANCH_SIZE,
            Piece::Branch { short: false, .. } => LONG_BRANCH_SIZE,
            Piece::Switch(targets) => 5 + 4 * targets.len(),
        }
    }
}

/// Encodes `instructions` into a complete method body.
///
/// # Errors
/// - [`Error::LabelIntegrity`] if a referenced label is not attached exactly once
/// - [`Error::Malformed`] for unbalanced exception blocks, stack underflow or format limits
/// - whatever `sink` reports
pub fn encode_method(
    instructions: &[Instruction],
    options: &EncodeOptions,
    sink: &mut dyn TokenSink,
) -> Result<EncodedMethod> {
    let targets = label_targets(instructions)?;
    let regions = collect_regions(instructions)?;

    let mut pieces = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        pieces.push(piece(instruction, &targets, sink)?);
    }

    relax_branches(&mut pieces)?;
    let offsets = layout(&pieces);
    let code_size = offsets.last().map_or(0, |&end| end as usize);

    let mut code = Vec::with_capacity(code_size);
    for (index, piece) in pieces.iter().enumerate() {
        let end = i64::from(offsets[index + 1]);
        match piece {
            Piece::Fixed(bytes) => code.extend_from_slice(bytes),
            Piece::Branch {
                opcode,
                target,
                short,
            } => {
                let displacement = i64::from(offsets[*target]) - end;
                if *short {
                    let Some(byte) = opcode.short_branch_byte() else {
                        return Err(malformed_error!("{} has no short form", opcode));
                    };
                    let Ok(displacement) = i8::try_from(displacement) else {
                        return Err(malformed_error!(
                            "Short branch displacement {} out of range",
                            displacement
                        ));
                    };
                    code.push(byte);
                    write_le(&mut code, displacement);
                } else {
                    let Ok(displacement) = i32::try_from(displacement) else {
                        return Err(malformed_error!(
                            "Branch displacement {} out of range",
                            displacement
                        ));
                    };
                    code.push(opcode.info().byte);
                    write_le(&mut code, displacement);
                }
            }
            Piece::Switch(labels) => {
                code.push(op::SWITCH);
                #[allow(clippy::cast_possible_truncation)]
                write_le(&mut code, labels.len() as u32);
                for target in labels {
                    let displacement = i64::from(offsets[*target]) - end;
                    let Ok(displacement) = i32::try_from(displacement) else {
                        return Err(malformed_error!(
                            "Switch displacement {} out of range",
                            displacement
                        ));
                    };
                    write_le(&mut code, displacement);
                }
            }
        }
    }

    let max_stack = compute_max_stack(instructions, &targets, &regions, options.returns_value)?;
    let handlers = exception_handlers(&regions, &offsets, sink)?;

    let local_var_sig_token = if options.locals.is_empty() {
        Token(0)
    } else {
        let blob = encode_local_var_signature(&options.locals, sink)?;
        sink.signature_token(&blob)?
    };

    let body = MethodBody::write(
        &code,
        max_stack,
        local_var_sig_token,
        options.init_locals,
        &handlers,
    )?;

    debug!(
        "Encoded {} instructions into {} bytes (code {}, max stack {}, {} clauses)",
        instructions.len(),
        body.len(),
        code_size,
        max_stack,
        handlers.len()
    );

    let mut offsets = offsets;
    offsets.pop();
    Ok(EncodedMethod {
        body,
        code_size,
        max_stack,
        offsets,
    })
}

/// Maps every referenced label to the index of the instruction carrying it.
fn label_targets(instructions: &[Instruction]) -> Result<HashMap<Label, usize>> {
    let mut attached: HashMap<Label, Vec<usize>> = HashMap::new();
    for (index, instruction) in instructions.iter().enumerate() {
        for label in &instruction.labels {
            attached.entry(label.clone()).or_default().push(index);
        }
    }

    let mut targets = HashMap::new();
    for instruction in instructions {
        for label in instruction.branch_targets() {
            match attached.get(label).map(Vec::as_slice) {
                Some([index]) => {
                    targets.insert(label.clone(), *index);
                }
                other => {
                    return Err(Error::LabelIntegrity {
                        label: label.to_string(),
                        attached: other.map_or(0, <[usize]>::len),
                    })
                }
            }
        }
    }

    Ok(targets)
}

fn piece(
    instruction: &Instruction,
    targets: &HashMap<Label, usize>,
    sink: &mut dyn TokenSink,
) -> Result<Piece> {
    let target_of = |label: &Label| -> Result<usize> {
        targets.get(label).copied().ok_or_else(|| Error::LabelIntegrity {
            label: label.to_string(),
            attached: 0,
        })
    };

    let opcode = instruction.opcode;
    match &instruction.operand {
        Operand::Target(label) => {
            return Ok(Piece::Branch {
                opcode,
                target: target_of(label)?,
                short: false,
            })
        }
        Operand::Switch(labels) => {
            return Ok(Piece::Switch(
                labels.iter().map(target_of).collect::<Result<_>>()?,
            ))
        }
        _ => {}
    }

    let mut bytes = Vec::with_capacity(9);
    match (opcode, &instruction.operand) {
        (OpCode::Ldarg, Operand::Argument(arg)) => {
            variable(&mut bytes, arg.index, Some(op::LDARG_0), op::LDARG_S, op::FE_LDARG);
        }
        (OpCode::Ldarga, Operand::Argument(arg)) => {
            variable(&mut bytes, arg.index, None, op::LDARGA_S, op::FE_LDARGA);
        }
        (OpCode::Starg, Operand::Argument(arg)) => {
            variable(&mut bytes, arg.index, None, op::STARG_S, op::FE_STARG);
        }
        (OpCode::Ldloc, Operand::Local(local)) => {
            variable(&mut bytes, local.index, Some(op::LDLOC_0), op::LDLOC_S, op::FE_LDLOC);
        }
        (OpCode::Ldloca, Operand::Local(local)) => {
            variable(&mut bytes, local.index, None, op::LDLOCA_S, op::FE_LDLOCA);
        }
        (OpCode::Stloc, Operand::Local(local)) => {
            variable(&mut bytes, local.index, Some(op::STLOC_0), op::STLOC_S, op::FE_STLOC);
        }
        (OpCode::LdcI4, Operand::Int32(value)) => match *value {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            small @ -1..=8 => bytes.push(op::LDC_I4_M1 + (small + 1) as u8),
            value => {
                if let Ok(short) = i8::try_from(value) {
                    bytes.push(op::LDC_I4_S);
                    write_le(&mut bytes, short);
                } else {
                    bytes.push(op::LDC_I4);
                    write_le(&mut bytes, value);
                }
            }
        },
        (_, operand) => {
            let info = opcode.info();
            if info.prefix != 0 {
                bytes.push(info.prefix);
            }
            bytes.push(info.byte);

            match operand {
                Operand::None => {}
                Operand::Int32(value) => write_le(&mut bytes, *value),
                Operand::Int64(value) => write_le(&mut bytes, *value),
                Operand::Float32(value) => write_le(&mut bytes, *value),
                Operand::Float64(value) => write_le(&mut bytes, *value),
                Operand::String(value) => write_le(&mut bytes, sink.string_token(value)?.value()),
                Operand::Method(method) => {
                    write_le(&mut bytes, sink.method_token(method)?.value());
                }
                Operand::Field(field) => write_le(&mut bytes, sink.field_token(field)?.value()),
                Operand::Type(ty) => write_le(&mut bytes, sink.type_token(ty)?.value()),
                Operand::Member(member) => {
                    write_le(&mut bytes, sink.member_token(member)?.value());
                }
                Operand::Signature(blob) => {
                    write_le(&mut bytes, sink.signature_token(blob)?.value());
                }
                Operand::Local(_)
                | Operand::Argument(_)
                | Operand::Target(_)
                | Operand::Switch(_) => {
                    return Err(Error::OperandMismatch {
                        mnemonic: opcode.mnemonic(),
                        expected: opcode.shape().describe(),
                    })
                }
            }
        }
    }

    Ok(Piece::Fixed(bytes))
}

/// Emits the most compact form of an argument or local access.
fn variable(bytes: &mut Vec<u8>, index: u16, macro_base: Option<u8>, short: u8, long: u8) {
    match (macro_base, u8::try_from(index)) {
        #[allow(clippy::cast_possible_truncation)]
        (Some(base), Ok(small)) if small <= 3 => bytes.push(base + small),
        (_, Ok(small)) => {
            bytes.push(short);
            bytes.push(small);
        }
        (_, Err(_)) => {
            bytes.push(op::FE_PREFIX);
            bytes.push(long);
            write_le(bytes, index);
        }
    }
}

/// Start offset of every piece, plus the end of the code as the last entry.
fn layout(pieces: &[Piece]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(pieces.len() + 1);
    let mut offset = 0u32;
    offsets.push(0);
    for piece in pieces {
        #[allow(clippy::cast_possible_truncation)]
        {
            offset += piece.size() as u32;
        }
        offsets.push(offset);
    }
    offsets
}

/// Shrinks long branches to their short form until no further branch fits.
///
/// Shrinking only ever moves instructions closer together, so a branch that fits once
/// keeps fitting.
fn relax_branches(pieces: &mut [Piece]) -> Result<()> {
    for _ in 0..MAX_RELAXATION_PASSES {
        let offsets = layout(pieces);
        let mut shrunk = false;

        for index in 0..pieces.len() {
            let Piece::Branch {
                opcode,
                target,
                short: false,
            } = pieces[index]
            else {
                continue;
            };
            if opcode.short_branch_byte().is_none() {
                continue;
            }

            let origin = i64::from(offsets[index]);
            let destination = i64::from(offsets[target]);
            let displacement = if target > index {
                destination - (LONG_BRANCH_SIZE - SHORT_BRANCH_SIZE) as i64
                    - (origin + SHORT_BRANCH_SIZE as i64)
            } else {
                destination - (origin + SHORT_BRANCH_SIZE as i64)
            };

            if i8::try_from(displacement).is_ok() {
                if let Piece::Branch { short, .. } = &mut pieces[index] {
                    *short = true;
                    shrunk = true;
                }
            }
        }

        if !shrunk {
            return Ok(());
        }
    }

    Err(malformed_error!("Branch relaxation did not converge"))
}

/// Stack effect of one instruction as `(pops, pushes)`.
fn stack_effect(instruction: &Instruction, returns_value: bool) -> (usize, usize) {
    match (instruction.opcode, &instruction.operand) {
        (OpCode::Call | OpCode::Callvirt, Operand::Method(method)) => {
            (method.arg_count(), usize::from(method.returns_value()))
        }
        (OpCode::Newobj, Operand::Method(method)) => (method.params.len(), 1),
        (OpCode::Calli, _) => (1, 0),
        (OpCode::Ret, _) => (usize::from(returns_value), 0),
        (opcode, _) => opcode
            .info()
            .stack
            .map_or((0, 0), |(pops, pushes)| (usize::from(pops), usize::from(pushes))),
    }
}

fn compute_max_stack(
    instructions: &[Instruction],
    targets: &HashMap<Label, usize>,
    regions: &[ExceptionRegion],
    returns_value: bool,
) -> Result<usize> {
    if instructions.is_empty() {
        return Ok(0);
    }

    let mut depth_at: Vec<Option<usize>> = vec![None; instructions.len()];
    let mut pending = vec![(0usize, 0usize)];
    for region in regions {
        let depth = usize::from(matches!(region.kind, HandlerKind::Catch(_)));
        pending.push((region.handler_start, depth));
    }

    let mut max_stack = 0;
    while let Some((index, depth)) = pending.pop() {
        let Some(slot) = depth_at.get_mut(index) else {
            continue;
        };
        if slot.is_some() {
            continue;
        }
        *slot = Some(depth);
        max_stack = max_stack.max(depth);

        let instruction = &instructions[index];
        let (pops, pushes) = stack_effect(instruction, returns_value);
        let Some(after) = depth.checked_sub(pops) else {
            return Err(malformed_error!(
                "Stack underflow at instruction {} ({})",
                index,
                instruction.opcode
            ));
        };
        let after = after + pushes;
        max_stack = max_stack.max(after);

        let branch_targets = instruction
            .branch_targets()
            .into_iter()
            .filter_map(|label| targets.get(label).copied());
        match instruction.opcode.flow() {
            FlowType::Sequential | FlowType::Call => pending.push((index + 1, after)),
            FlowType::ConditionalBranch | FlowType::Switch => {
                pending.push((index + 1, after));
                pending.extend(branch_targets.map(|target| (target, after)));
            }
            FlowType::UnconditionalBranch => {
                pending.extend(branch_targets.map(|target| (target, after)));
            }
            FlowType::Leave => pending.extend(branch_targets.map(|target| (target, 0))),
            FlowType::Return | FlowType::Throw | FlowType::EndFinally => {}
        }
    }

    Ok(max_stack)
}

fn exception_handlers(
    regions: &[ExceptionRegion],
    offsets: &[u32],
    sink: &mut dyn TokenSink,
) -> Result<Vec<ExceptionHandler>> {
    let offset_of = |index: usize| -> Result<u32> {
        offsets
            .get(index)
            .copied()
            .ok_or_else(|| malformed_error!("Region boundary {} outside the body", index))
    };

    let mut handlers = Vec::with_capacity(regions.len());
    for region in regions {
        let (flags, class_token) = match &region.kind {
            HandlerKind::Catch(ty) => (ExceptionHandlerFlags::EXCEPTION, sink.type_token(ty)?),
            HandlerKind::Finally => (ExceptionHandlerFlags::FINALLY, Token(0)),
            HandlerKind::Fault => (ExceptionHandlerFlags::FAULT, Token(0)),
        };

        let try_offset = offset_of(region.try_start)?;
        let handler_offset = offset_of(region.handler_start)?;
        handlers.push(ExceptionHandler {
            flags,
            try_offset,
            try_length: offset_of(region.try_end)? - try_offset,
            handler_offset,
            handler_length: offset_of(region.handler_end)? - handler_offset,
            class_token,
        });
    }

    Ok(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{ArgumentRef, ExceptionBlock, LocalRef},
        runtime::DynamicTokenTable,
    };

    fn encode(instructions: &[Instruction], returns_value: bool) -> Result<EncodedMethod> {
        let options = EncodeOptions {
            returns_value,
            ..EncodeOptions::default()
        };
        encode_method(instructions, &options, &mut DynamicTokenTable::new())
    }

    fn code(instructions: &[Instruction]) -> Vec<u8> {
        let encoded = encode(instructions, false).unwrap();
        encoded.body[encoded.body.len() - encoded.code_size..].to_vec()
    }

    fn ins(opcode: OpCode, operand: Operand) -> Instruction {
        Instruction::new(opcode, operand).unwrap()
    }

    fn simple(opcode: OpCode) -> Instruction {
        Instruction::simple(opcode).unwrap()
    }

    #[test]
    fn tiny_body() {
        let encoded = encode(
            &[
                ins(OpCode::Ldarg, Operand::Argument(ArgumentRef::new(0))),
                simple(OpCode::Ret),
            ],
            true,
        )
        .unwrap();
        assert_eq!(encoded.body, vec![0x0A, 0x02, 0x2A]);
        assert_eq!(encoded.max_stack, 1);
        assert_eq!(encoded.offsets, vec![0, 1]);
    }

    #[test]
    fn shortest_variable_forms() {
        let arg = |index| ins(OpCode::Ldarg, Operand::Argument(ArgumentRef::new(index)));
        assert_eq!(code(&[arg(3), simple(OpCode::Pop)]), vec![0x05, 0x26]);
        assert_eq!(code(&[arg(7), simple(OpCode::Pop)]), vec![0x0E, 0x07, 0x26]);
        assert_eq!(
            code(&[arg(300), simple(OpCode::Pop)]),
            vec![0xFE, 0x09, 0x2C, 0x01, 0x26]
        );
        assert_eq!(
            code(&[
                ins(OpCode::Ldloca, Operand::Local(LocalRef::new(0))),
                simple(OpCode::Pop)
            ]),
            vec![0x12, 0x00, 0x26]
        );
    }

    #[test]
    fn shortest_constant_forms() {
        let ldc = |value| ins(OpCode::LdcI4, Operand::Int32(value));
        assert_eq!(code(&[ldc(-1), simple(OpCode::Pop)]), vec![0x15, 0x26]);
        assert_eq!(code(&[ldc(5), simple(OpCode::Pop)]), vec![0x1A, 0x26]);
        assert_eq!(code(&[ldc(100), simple(OpCode::Pop)]), vec![0x1F, 0x64, 0x26]);
        assert_eq!(
            code(&[ldc(1000), simple(OpCode::Pop)]),
            vec![0x20, 0xE8, 0x03, 0x00, 0x00, 0x26]
        );
    }

    #[test]
    fn branches_are_relaxed() {
        let exit = Label::new();
        let forward = [
            ins(OpCode::Br, Operand::Target(exit.clone())),
            simple(OpCode::Nop),
            simple(OpCode::Ret).with_label(exit),
        ];
        assert_eq!(code(&forward), vec![0x2B, 0x01, 0x00, 0x2A]);

        let top = Label::new();
        let backward = [
            simple(OpCode::Nop).with_label(top.clone()),
            ins(OpCode::Br, Operand::Target(top)),
        ];
        assert_eq!(code(&backward), vec![0x00, 0x2B, 0xFD]);
    }

    #[test]
    fn far_branches_stay_long() {
        let exit = Label::new();
        let mut instructions = vec![ins(OpCode::Br, Operand::Target(exit.clone()))];
        instructions.extend((0..200).map(|_| simple(OpCode::Nop)));
        instructions.push(simple(OpCode::Ret).with_label(exit));

        let code = code(&instructions);
        assert_eq!(&code[..5], &[0x38, 0xC8, 0x00, 0x00, 0x00]);
        assert_eq!(code.len(), 206);
    }

    #[test]
    fn label_integrity() {
        let dangling = Label::named("dangling");
        let result = encode(
            &[
                ins(OpCode::Br, Operand::Target(dangling.clone())),
                simple(OpCode::Ret),
            ],
            false,
        );
        assert!(matches!(result, Err(Error::LabelIntegrity { attached: 0, .. })));

        let twice = [
            ins(OpCode::Br, Operand::Target(dangling.clone())),
            simple(OpCode::Nop).with_label(dangling.clone()),
            simple(OpCode::Ret).with_label(dangling),
        ];
        assert!(matches!(
            encode(&twice, false),
            Err(Error::LabelIntegrity { attached: 2, .. })
        ));
    }

    #[test]
    fn max_stack_follows_paths() {
        let encoded = encode(
            &[
                ins(OpCode::LdcI4, Operand::Int32(1)),
                ins(OpCode::LdcI4, Operand::Int32(2)),
                ins(OpCode::LdcI4, Operand::Int32(3)),
                simple(OpCode::Add),
                simple(OpCode::Add),
                simple(OpCode::Ret),
            ],
            true,
        )
        .unwrap();
        assert_eq!(encoded.max_stack, 3);

        assert!(encode(&[simple(OpCode::Add), simple(OpCode::Ret)], false).is_err());
    }

    #[test]
    fn exception_clauses_from_blocks() {
        let exit = Label::new();
        let instructions = [
            simple(OpCode::Nop).with_block(ExceptionBlock::begin_try()),
            ins(OpCode::Leave, Operand::Target(exit.clone())),
            simple(OpCode::Nop).with_block(ExceptionBlock::begin_finally()),
            simple(OpCode::Endfinally),
            simple(OpCode::Ret)
                .with_label(exit)
                .with_block(ExceptionBlock::end_try()),
        ];

        let encoded = encode(&instructions, false).unwrap();
        let body = MethodBody::parse(&encoded.body).unwrap();
        assert_eq!(body.exception_handlers.len(), 1);

        let clause = &body.exception_handlers[0];
        assert_eq!(clause.flags, ExceptionHandlerFlags::FINALLY);
        assert_eq!((clause.try_offset, clause.try_length), (0, 3));
        assert_eq!((clause.handler_offset, clause.handler_length), (3, 2));
    }

    #[test]
    fn locals_get_a_signature() {
        let mut table = DynamicTokenTable::new();
        let options = EncodeOptions {
            locals: vec![TypeSignature::I4],
            returns_value: false,
            init_locals: true,
        };
        let encoded = encode_method(&[simple(OpCode::Ret)], &options, &mut table).unwrap();
        let body = MethodBody::parse(&encoded.body).unwrap();

        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert_eq!(body.local_var_sig_token, Token(0x11000001));
    }
}
