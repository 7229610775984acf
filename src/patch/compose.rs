//! Composition of a replacement body from an original body and its hooks.
//!
//! The composed body has this layout:
//!
//! ```text
//!     <prefix calls>            bool prefixes: brfalse AFTER_BODY
//!     <transpiled body>         every ret: stloc result; br AFTER_BODY
//! AFTER_BODY:
//!     <suffix calls>
//!     ldloc result; ret
//! ```
//!
//! Without suffixes, cancellable prefixes or result bindings the original `ret`s stay in
//! place and no epilogue is added. The result slot is appended after the original locals
//! and only exists when the function returns a value.

use log::debug;

use crate::{
    assembly::{DecodedMethod, Instruction, InstructionAssembler, Label, LocalRef, OpCode, Operand},
    metadata::signatures::TypeSignature,
    patch::{
        binding::{binds_result, emit_hook_call},
        hook::Hook,
        hookset::HookSnapshot,
    },
    runtime::{MethodDef, MethodHandle},
    Result,
};

/// A composed replacement body, ready for encoding.
#[derive(Debug, Clone)]
pub struct ComposedMethod {
    /// Instructions of the replacement
    pub instructions: Vec<Instruction>,
    /// Locals: the original ones, then the result slot if any
    pub locals: Vec<TypeSignature>,
    /// Index of the result slot
    pub result_local: Option<u16>,
}

fn hook_method<'h>(target: &MethodDef, hook: &'h Hook) -> Result<&'h MethodHandle> {
    hook.method().ok_or_else(|| {
        construction_error!(
            target.full_name(),
            "{} hook {} has no method",
            hook.kind,
            hook.name()
        )
    })
}

/// Builds the replacement of `target` from its decoded body and `hooks`.
///
/// Returns `None` when there are no hooks at all.
///
/// # Errors
/// Returns [`crate::Error::Construction`] for prefixes that return neither `void` nor `bool`,
/// non-void suffixes and hook parameters that cannot be bound, or whatever a transpiler
/// reports.
pub fn compose(
    target: &MethodHandle,
    original: DecodedMethod,
    hooks: &HookSnapshot,
) -> Result<Option<ComposedMethod>> {
    if hooks.is_empty() {
        return Ok(None);
    }

    let mut cancellable = false;
    for hook in &hooks.prefixes {
        let method = hook_method(target, hook)?;
        match method.returns {
            TypeSignature::Boolean => cancellable = true,
            TypeSignature::Void => {}
            ref other => {
                return Err(construction_error!(
                    target.full_name(),
                    "prefix {} returns {}, expected void or bool",
                    method.full_name(),
                    other
                ))
            }
        }
    }
    for hook in &hooks.suffixes {
        let method = hook_method(target, hook)?;
        if !method.returns.is_void() {
            return Err(construction_error!(
                target.full_name(),
                "suffix {} returns {}, expected void",
                method.full_name(),
                method.returns
            ));
        }
    }

    let mut binds = false;
    for hook in hooks.prefixes.iter().chain(&hooks.suffixes) {
        binds |= binds_result(target, hook_method(target, hook)?);
    }

    let epilogue = cancellable || binds || !hooks.suffixes.is_empty();
    let mut locals = original.locals;
    let result_local = if epilogue && target.returns_value() {
        let index = u16::try_from(locals.len()).map_err(|_| {
            construction_error!(target.full_name(), "too many locals for a result slot")
        })?;
        locals.push(target.returns.clone());
        Some(index)
    } else {
        None
    };

    let mut body = original.instructions;
    for hook in &hooks.transpilers {
        if let Some(transpiler) = hook.transpiler() {
            body = transpiler.apply(target, body)?;
        }
    }

    let after_body = Label::named("after_body");
    let mut asm = InstructionAssembler::new();

    for hook in &hooks.prefixes {
        let method = hook_method(target, hook)?;
        emit_hook_call(&mut asm, target, method, result_local)?;
        if method.returns == TypeSignature::Boolean {
            asm.branch(OpCode::Brfalse, &after_body);
        }
    }

    if epilogue {
        for instruction in body {
            if instruction.opcode == OpCode::Ret {
                redirect_return(&mut asm, instruction, result_local, &after_body)?;
            } else {
                asm.push(instruction);
            }
        }

        asm.label(&after_body);
        for hook in &hooks.suffixes {
            emit_hook_call(&mut asm, target, hook_method(target, hook)?, result_local)?;
        }
        if let Some(slot) = result_local {
            asm.emit(
                OpCode::Ldloc,
                Operand::Local(LocalRef::typed(slot, target.returns.clone())),
            );
        }
        asm.ret();
    } else {
        for instruction in body {
            asm.push(instruction);
        }
    }

    let instructions = asm.finish()?;
    debug!(
        "Composed {} from {} hook(s): {} instructions, result slot {:?}",
        target.full_name(),
        hooks.len(),
        instructions.len(),
        result_local
    );

    Ok(Some(ComposedMethod {
        instructions,
        locals,
        result_local,
    }))
}

/// Replaces a `ret` by a store to the result slot and a jump to the epilogue. The labels
/// and blocks of the `ret` move to the first replacement instruction.
fn redirect_return(
    asm: &mut InstructionAssembler,
    mut ret: Instruction,
    result_local: Option<u16>,
    after_body: &Label,
) -> Result<()> {
    let mut first = match result_local {
        Some(slot) => Instruction::new(OpCode::Stloc, Operand::Local(LocalRef::new(slot)))?,
        None => Instruction::new(OpCode::Br, Operand::Target(after_body.clone()))?,
    };
    ret.move_labels_to(&mut first);
    ret.move_blocks_to(&mut first);
    asm.push(first);

    if result_local.is_some() {
        asm.branch(OpCode::Br, after_body);
    }
    Ok(())
}
