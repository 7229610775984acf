//! Decoding of method bodies into instruction lists.
//!
//! The decoder walks the instruction bytes linearly. Every encoding shorthand is folded into
//! the canonical [`OpCode`]: `ldarg.0` and `ldarg.s 0` both become `ldarg 0`, `ldc.i4.5`
//! becomes `ldc.i4 5`, `br.s` becomes `br`. Branch displacements become [`Label`]s attached
//! to their target instruction, tokens are resolved through a [`TokenResolver`] into
//! handles, and the exception clauses of the header are turned into per-instruction
//! [`ExceptionBlock`] lists. The resulting list is self-contained: it can be encoded into any
//! body without the original header.
//!
//! ```rust
//! use dotpatch::{
//!     assembly::{decode_instruction, DecodeContext, OpCode, Operand},
//!     metadata::resolver::NullResolver,
//!     Parser,
//! };
//!
//! // ldc.i4.s 100
//! let mut parser = Parser::new(&[0x1F, 0x64]);
//! let mut context = DecodeContext::default();
//! let instruction = decode_instruction(&mut parser, &NullResolver, &mut context)?;
//! assert_eq!(instruction.opcode, OpCode::LdcI4);
//! assert!(matches!(instruction.operand, Operand::Int32(100)));
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! # Limitations
//!
//! Filter clauses are rejected by [`MethodBody::parse`]. Handlers of one protected range must
//! follow it and each other without gaps, which is how compilers lay them out.

use std::{
    collections::{BTreeMap, HashMap},
    sync::OnceLock,
};

use log::debug;
use strum::IntoEnumIterator;

use crate::{
    assembly::{
        instructions::OperandShape, opcodes as op, ArgumentRef, ExceptionBlock, Instruction,
        Label, LocalRef, OpCode, Operand,
    },
    file::parser::Parser,
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        resolver::TokenResolver,
        signatures::{parse_local_var_signature, TypeSignature},
        token::Token,
    },
    runtime::MethodDef,
    Error, Result,
};

static OPCODES: OnceLock<HashMap<(u8, u8), OpCode>> = OnceLock::new();

fn opcode_table() -> &'static HashMap<(u8, u8), OpCode> {
    OPCODES.get_or_init(|| {
        OpCode::iter()
            .map(|opcode| {
                let info = opcode.info();
                ((info.prefix, info.byte), opcode)
            })
            .collect()
    })
}

/// State shared by the instructions of one body while decoding.
#[derive(Debug, Default)]
pub struct DecodeContext<'a> {
    /// Method whose arguments are referenced, for argument names and types
    pub method: Option<&'a MethodDef>,
    /// Local variable types, for typed local references
    pub locals: &'a [TypeSignature],
    /// Labels created for branch targets, by code offset
    pub labels: BTreeMap<u32, Label>,
}

impl<'a> DecodeContext<'a> {
    /// Context for a body of `method` with the given locals.
    #[must_use]
    pub fn new(method: &'a MethodDef, locals: &'a [TypeSignature]) -> Self {
        DecodeContext {
            method: Some(method),
            locals,
            labels: BTreeMap::new(),
        }
    }

    fn label_at(&mut self, offset: u32) -> Label {
        self.labels.entry(offset).or_default().clone()
    }

    fn local(&self, index: u16) -> LocalRef {
        match self.locals.get(usize::from(index)) {
            Some(ty) => LocalRef::typed(index, ty.clone()),
            None => LocalRef::new(index),
        }
    }

    fn argument(&self, index: u16) -> ArgumentRef {
        let mut argument = ArgumentRef::new(index);
        if let Some((name, ty)) = self.method.and_then(|method| method.argument(index)) {
            argument.name = Some(name);
            argument.ty = Some(ty);
        }
        argument
    }
}

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct DecodedMethod {
    /// Instructions with labels and exception blocks attached
    pub instructions: Vec<Instruction>,
    /// Local variable types
    pub locals: Vec<TypeSignature>,
    /// Maximum stack depth declared in the header
    pub max_stack: usize,
    /// `InitLocals` header flag
    pub init_locals: bool,
    /// Number of instruction bytes
    pub code_size: usize,
    /// Exception clauses as found in the header
    pub handlers: Vec<ExceptionHandler>,
}

fn branch_target(end: usize, displacement: i64) -> Result<u32> {
    i64::try_from(end)
        .ok()
        .and_then(|end| end.checked_add(displacement))
        .and_then(|target| u32::try_from(target).ok())
        .ok_or_else(|| malformed_error!("Branch target {} + {} is negative", end, displacement))
}

fn resolved<T>(value: Option<T>, token: Token) -> Result<T> {
    value.ok_or(Error::Resolution { token })
}

/// Decodes the instruction at the parser position.
///
/// Branch targets are registered in `context.labels` by offset; attaching those labels to
/// their instructions is left to the caller, as done by [`decode_method`].
///
/// # Errors
/// - [`Error::OutOfBounds`] for truncated operands
/// - [`Error::Malformed`] for unknown opcodes
/// - [`Error::Resolution`] for tokens the resolver does not know
pub fn decode_instruction(
    parser: &mut Parser,
    resolver: &dyn TokenResolver,
    context: &mut DecodeContext,
) -> Result<Instruction> {
    let Ok(offset) = u32::try_from(parser.pos()) else {
        return Err(malformed_error!("Code offset {} is too large", parser.pos()));
    };
    let byte = parser.read_le::<u8>()?;

    let (opcode, operand) = match byte {
        op::LDARG_0..=op::LDARG_3 => (
            OpCode::Ldarg,
            Operand::Argument(context.argument(u16::from(byte - op::LDARG_0))),
        ),
        op::LDLOC_0..=op::LDLOC_3 => (
            OpCode::Ldloc,
            Operand::Local(context.local(u16::from(byte - op::LDLOC_0))),
        ),
        op::STLOC_0..=op::STLOC_3 => (
            OpCode::Stloc,
            Operand::Local(context.local(u16::from(byte - op::STLOC_0))),
        ),
        op::LDARG_S | op::LDARGA_S | op::STARG_S => {
            let opcode = match byte {
                op::LDARG_S => OpCode::Ldarg,
                op::LDARGA_S => OpCode::Ldarga,
                _ => OpCode::Starg,
            };
            let index = u16::from(parser.read_le::<u8>()?);
            (opcode, Operand::Argument(context.argument(index)))
        }
        op::LDLOC_S | op::LDLOCA_S | op::STLOC_S => {
            let opcode = match byte {
                op::LDLOC_S => OpCode::Ldloc,
                op::LDLOCA_S => OpCode::Ldloca,
                _ => OpCode::Stloc,
            };
            let index = u16::from(parser.read_le::<u8>()?);
            (opcode, Operand::Local(context.local(index)))
        }
        op::LDC_I4_M1..=op::LDC_I4_8 => (
            OpCode::LdcI4,
            Operand::Int32(i32::from(byte - op::LDC_I4_M1) - 1),
        ),
        op::LDC_I4_S => (
            OpCode::LdcI4,
            Operand::Int32(i32::from(parser.read_le::<i8>()?)),
        ),
        op::BR_S..=op::BLT_UN_S | op::LEAVE_S => {
            let opcode = if byte == op::LEAVE_S {
                OpCode::Leave
            } else {
                lookup(0, byte + op::SHORT_BRANCH_DELTA)?
            };
            let displacement = i64::from(parser.read_le::<i8>()?);
            let target = branch_target(parser.pos(), displacement)?;
            (opcode, Operand::Target(context.label_at(target)))
        }
        op::FE_PREFIX => {
            let second = parser.read_le::<u8>()?;
            let opcode = lookup(op::FE_PREFIX, second)?;
            (opcode, read_operand(opcode, parser, resolver, context)?)
        }
        _ => {
            let opcode = lookup(0, byte)?;
            (opcode, read_operand(opcode, parser, resolver, context)?)
        }
    };

    let mut instruction = Instruction::new(opcode, operand)?;
    instruction.offset = offset;
    Ok(instruction)
}

fn lookup(prefix: u8, byte: u8) -> Result<OpCode> {
    opcode_table()
        .get(&(prefix, byte))
        .copied()
        .ok_or_else(|| {
            if prefix == 0 {
                malformed_error!("Unknown opcode 0x{:02x}", byte)
            } else {
                malformed_error!("Unknown opcode 0x{:02x} 0x{:02x}", prefix, byte)
            }
        })
}

fn read_operand(
    opcode: OpCode,
    parser: &mut Parser,
    resolver: &dyn TokenResolver,
    context: &mut DecodeContext,
) -> Result<Operand> {
    let operand = match opcode.shape() {
        OperandShape::None => Operand::None,
        OperandShape::Target => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            let target = branch_target(parser.pos(), displacement)?;
            Operand::Target(context.label_at(target))
        }
        OperandShape::Int32 => Operand::Int32(parser.read_le::<i32>()?),
        OperandShape::Int64 => Operand::Int64(parser.read_le::<i64>()?),
        OperandShape::Float32 => Operand::Float32(parser.read_le::<f32>()?),
        OperandShape::Float64 => Operand::Float64(parser.read_le::<f64>()?),
        OperandShape::String => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::String(resolved(resolver.resolve_string(token), token)?)
        }
        OperandShape::Method => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::Method(resolved(resolver.resolve_method(token), token)?)
        }
        OperandShape::Field => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::Field(resolved(resolver.resolve_field(token), token)?)
        }
        OperandShape::Type => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::Type(resolved(resolver.resolve_type(token), token)?)
        }
        OperandShape::Token => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::Member(resolved(resolver.resolve_member(token), token)?)
        }
        OperandShape::Signature => {
            let token = Token(parser.read_le::<u32>()?);
            Operand::Signature(resolved(resolver.resolve_signature(token), token)?)
        }
        OperandShape::Local => Operand::Local(context.local(parser.read_le::<u16>()?)),
        OperandShape::Argument => Operand::Argument(context.argument(parser.read_le::<u16>()?)),
        OperandShape::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count > parser.remaining() / 4 {
                return Err(malformed_error!("Switch table of {} entries is truncated", count));
            }
            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            let end = parser.pos();
            let mut labels = Vec::with_capacity(count);
            for displacement in displacements {
                labels.push(context.label_at(branch_target(end, displacement)?));
            }
            Operand::Switch(labels)
        }
    };

    Ok(operand)
}

/// Decodes a complete method body of `method`.
///
/// # Errors
/// - [`Error::Malformed`] for invalid headers, unknown opcodes or branches into the middle
///   of an instruction
/// - [`Error::NotSupported`] for filter clauses or handlers laid out apart from their range
/// - [`Error::Resolution`] if any token cannot be resolved; decoding is all or nothing
pub fn decode_method(
    data: &[u8],
    resolver: &dyn TokenResolver,
    method: &MethodDef,
) -> Result<DecodedMethod> {
    let body = MethodBody::parse(data)?;
    let code = body.code(data)?;

    let locals = if body.local_var_sig_token.is_null() {
        Vec::new()
    } else {
        let token = body.local_var_sig_token;
        let blob = resolved(resolver.resolve_signature(token), token)?;
        parse_local_var_signature(&blob, resolver)?
    };

    let mut context = DecodeContext::new(method, &locals);
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser, resolver, &mut context)?);
    }

    let index_of: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.offset, index))
        .collect();

    for (offset, label) in std::mem::take(&mut context.labels) {
        let Some(&index) = index_of.get(&offset) else {
            return Err(malformed_error!(
                "Branch target 0x{:x} is not an instruction boundary",
                offset
            ));
        };
        instructions[index].add_label(label);
    }

    attach_exception_blocks(&mut instructions, &index_of, code.len(), &body, resolver)?;

    debug!(
        "Decoded {} from {} code bytes into {} instructions ({} clauses)",
        method.full_name(),
        code.len(),
        instructions.len(),
        body.exception_handlers.len()
    );

    Ok(DecodedMethod {
        instructions,
        locals,
        max_stack: body.max_stack,
        init_locals: body.is_init_local,
        code_size: code.len(),
        handlers: body.exception_handlers,
    })
}

/// A protected range with all of its handlers.
struct ClauseGroup<'a> {
    try_start: u32,
    handlers: Vec<&'a ExceptionHandler>,
}

impl ClauseGroup<'_> {
    fn end(&self) -> u32 {
        self.handlers
            .last()
            .map_or(self.try_start, |handler| handler.handler_end())
    }

    fn extent(&self) -> u32 {
        self.end().saturating_sub(self.try_start)
    }
}

fn group_clauses(handlers: &[ExceptionHandler]) -> Result<Vec<ClauseGroup<'_>>> {
    let mut groups: Vec<(u32, u32, Vec<&ExceptionHandler>)> = Vec::new();
    for handler in handlers {
        match groups
            .iter_mut()
            .find(|(start, length, _)| *start == handler.try_offset && *length == handler.try_length)
        {
            Some((_, _, members)) => members.push(handler),
            None => groups.push((handler.try_offset, handler.try_length, vec![handler])),
        }
    }

    let mut result = Vec::with_capacity(groups.len());
    for (try_start, try_length, mut members) in groups {
        members.sort_by_key(|handler| handler.handler_offset);

        let mut expected = try_start.checked_add(try_length).ok_or_else(|| {
            malformed_error!(
                "Protected range 0x{:x}+0x{:x} overflows",
                try_start,
                try_length
            )
        })?;
        for handler in &members {
            if handler.handler_offset != expected {
                return Err(Error::NotSupported(format!(
                    "handler at 0x{:x} is not adjacent to its protected range at 0x{:x}",
                    handler.handler_offset, try_start
                )));
            }
            expected = handler.handler_end();
        }

        result.push(ClauseGroup {
            try_start,
            handlers: members,
        });
    }

    Ok(result)
}

/// Turns the clause table into exception blocks.
///
/// At one boundary regions are closed innermost first, then handlers begin, then regions
/// open outermost first. A region ending at the very end of the code gets a trailing `nop`
/// to carry its closing block.
fn attach_exception_blocks(
    instructions: &mut Vec<Instruction>,
    index_of: &HashMap<u32, usize>,
    code_size: usize,
    body: &MethodBody,
    resolver: &dyn TokenResolver,
) -> Result<()> {
    if body.exception_handlers.is_empty() {
        return Ok(());
    }

    let groups = group_clauses(&body.exception_handlers)?;
    let mut boundaries: BTreeMap<u32, Vec<ExceptionBlock>> = BTreeMap::new();

    let mut closing: Vec<&ClauseGroup> = groups.iter().collect();
    closing.sort_by_key(|group| (std::cmp::Reverse(group.try_start), group.extent()));
    for group in closing {
        boundaries
            .entry(group.end())
            .or_default()
            .push(ExceptionBlock::end_try());
    }

    for group in &groups {
        for handler in &group.handlers {
            let block = if handler.flags.contains(ExceptionHandlerFlags::FINALLY) {
                ExceptionBlock::begin_finally()
            } else if handler.flags.contains(ExceptionHandlerFlags::FAULT) {
                ExceptionBlock::begin_fault()
            } else {
                let token = handler.class_token;
                ExceptionBlock::begin_catch(resolved(resolver.resolve_type(token), token)?)
            };
            boundaries
                .entry(handler.handler_offset)
                .or_default()
                .push(block);
        }
    }

    let mut opening: Vec<&ClauseGroup> = groups.iter().collect();
    opening.sort_by_key(|group| std::cmp::Reverse(group.extent()));
    for group in opening {
        boundaries
            .entry(group.try_start)
            .or_default()
            .push(ExceptionBlock::begin_try());
    }

    for (offset, blocks) in boundaries {
        let index = match index_of.get(&offset) {
            Some(&index) => index,
            None if offset as usize == code_size => {
                let mut nop = Instruction::simple(OpCode::Nop)?;
                nop.offset = offset;
                instructions.push(nop);
                instructions.len() - 1
            }
            None => {
                return Err(malformed_error!(
                    "Exception clause boundary 0x{:x} is not an instruction boundary",
                    offset
                ))
            }
        };
        instructions[index].blocks.extend(blocks);
    }

    Ok(())
}
