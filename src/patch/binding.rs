//! Argument binding for hook calls.
//!
//! Prefixes and suffixes are static methods whose parameters are matched by name:
//!
//! | Hook parameter | Loads |
//! |----------------|-------|
//! | `__instance` / `instance` | the patched instance (`ldarg 0`) |
//! | `__result` / `result` | the result slot (`ldloc`, or `ldloca` for a by-ref parameter) |
//! | any parameter name of the patched function | that argument |
//!
//! The `__` forms always win; the plain forms only apply when the patched function has no
//! parameter of that name. For arguments, by-ref-ness decides the load:
//!
//! | Hook | Patched | Emitted |
//! |------|---------|---------|
//! | by-ref | by-ref | `ldarg` |
//! | by-ref | value | `ldarga` |
//! | value | by-ref | `ldarg; ldind` |
//! | value | value | `ldarg` |

use crate::{
    assembly::InstructionAssembler,
    metadata::signatures::TypeSignature,
    runtime::{MethodDef, MethodHandle, ParamDef},
    Result,
};

const INSTANCE: (&str, &str) = ("__instance", "instance");
const RESULT: (&str, &str) = ("__result", "result");

enum Binding {
    Instance,
    Result,
    Argument(u16),
}

fn classify(target: &MethodDef, param: &ParamDef) -> Option<Binding> {
    let name = param.name.as_str();
    if name == INSTANCE.0 {
        return Some(Binding::Instance);
    }
    if name == RESULT.0 {
        return Some(Binding::Result);
    }
    if let Some(index) = target.param_index(name) {
        return Some(Binding::Argument(index));
    }
    if name == INSTANCE.1 {
        return Some(Binding::Instance);
    }
    (name == RESULT.1).then_some(Binding::Result)
}

/// `true` if `hook` has a parameter bound to the result slot of `target`.
pub(crate) fn binds_result(target: &MethodDef, hook: &MethodDef) -> bool {
    hook.params
        .iter()
        .any(|param| matches!(classify(target, param), Some(Binding::Result)))
}

/// Emits the argument loads for `hook` followed by the call.
///
/// `result` is the local holding the return value of `target`, if one was allocated.
pub(crate) fn emit_hook_call(
    asm: &mut InstructionAssembler,
    target: &MethodDef,
    hook: &MethodHandle,
    result: Option<u16>,
) -> Result<()> {
    if !hook.is_static {
        return Err(construction_error!(
            target.full_name(),
            "hook {} must be static",
            hook.full_name()
        ));
    }

    for param in &hook.params {
        let binding = classify(target, param).ok_or_else(|| {
            construction_error!(
                target.full_name(),
                "parameter '{}' of hook {} matches nothing",
                param.name,
                hook.full_name()
            )
        })?;

        match binding {
            Binding::Instance => bind_instance(asm, target, hook, param)?,
            Binding::Result => bind_result(asm, target, hook, param, result)?,
            Binding::Argument(index) => bind_argument(asm, target, hook, param, index)?,
        }
    }

    asm.call(hook);
    Ok(())
}

fn bind_instance(
    asm: &mut InstructionAssembler,
    target: &MethodDef,
    hook: &MethodDef,
    param: &ParamDef,
) -> Result<()> {
    if target.is_static {
        return Err(construction_error!(
            target.full_name(),
            "hook {} binds '{}' but the method is static",
            hook.full_name(),
            param.name
        ));
    }

    let instance = TypeSignature::Class(target.declaring_type.clone());
    if param.signature.is_byref() || !param.signature.is_assignable_from(&instance) {
        return Err(construction_error!(
            target.full_name(),
            "'{}' of hook {} has type {}, the instance is {}",
            param.name,
            hook.full_name(),
            param.signature,
            instance
        ));
    }

    asm.ldarg(0);
    Ok(())
}

fn bind_result(
    asm: &mut InstructionAssembler,
    target: &MethodDef,
    hook: &MethodDef,
    param: &ParamDef,
    result: Option<u16>,
) -> Result<()> {
    if !target.returns_value() {
        return Err(construction_error!(
            target.full_name(),
            "hook {} binds '{}' but the method returns void",
            hook.full_name(),
            param.name
        ));
    }

    let compatible = if param.signature.is_byref() {
        param.signature.base() == target.returns.base()
    } else {
        param.signature.is_assignable_from(&target.returns)
    };
    if !compatible {
        return Err(construction_error!(
            target.full_name(),
            "'{}' of hook {} has type {}, the result is {}",
            param.name,
            hook.full_name(),
            param.signature,
            target.returns
        ));
    }

    let Some(slot) = result else {
        return Err(construction_error!(
            target.full_name(),
            "no result slot for hook {}",
            hook.full_name()
        ));
    };

    if param.signature.is_byref() {
        asm.ldloca(slot);
    } else {
        asm.ldloc(slot);
    }
    Ok(())
}

fn bind_argument(
    asm: &mut InstructionAssembler,
    target: &MethodDef,
    hook: &MethodDef,
    param: &ParamDef,
    index: u16,
) -> Result<()> {
    let Some((_, original)) = target.argument(index) else {
        return Err(construction_error!(
            target.full_name(),
            "argument {} does not exist",
            index
        ));
    };

    let hook_ref = param.signature.is_byref();
    let compatible = if hook_ref {
        param.signature.base() == original.base()
    } else {
        param.signature.is_assignable_from(&original)
    };
    if !compatible {
        return Err(construction_error!(
            target.full_name(),
            "'{}' of hook {} has type {}, the parameter is {}",
            param.name,
            hook.full_name(),
            param.signature,
            original
        ));
    }

    match (hook_ref, original.is_byref()) {
        (true, false) => {
            asm.ldarga(index);
        }
        (false, true) => {
            asm.ldarg(index).ldind(&original);
        }
        _ => {
            asm.ldarg(index);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{OpCode, Operand},
        runtime::{MethodBuilder, Runtime, RuntimeConfig},
        Error,
    };

    fn setup() -> (Runtime, MethodHandle) {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let ty = runtime.define_type("App", "Counter", None).unwrap();
        let target = runtime
            .define_method(
                MethodBuilder::new(&ty, "Add")
                    .instance()
                    .param("amount", TypeSignature::I4)
                    .param("total", TypeSignature::by_ref(TypeSignature::I8))
                    .returns(TypeSignature::Boolean),
            )
            .unwrap();
        (runtime, target)
    }

    fn emitted(target: &MethodDef, hook: &MethodHandle) -> Result<Vec<(OpCode, Operand)>> {
        let mut asm = InstructionAssembler::new();
        emit_hook_call(&mut asm, target, hook, Some(3))?;
        Ok(asm
            .finish()?
            .into_iter()
            .map(|instruction| (instruction.opcode, instruction.operand))
            .collect())
    }

    #[test]
    fn ref_combinations() {
        let (runtime, target) = setup();
        let ty = runtime.define_type("App", "Hooks", None).unwrap();
        let hook = runtime
            .define_method(
                MethodBuilder::new(&ty, "Pre")
                    .param("amount", TypeSignature::by_ref(TypeSignature::I4))
                    .param("total", TypeSignature::I8)
                    .param("__instance", TypeSignature::Object)
                    .param("__result", TypeSignature::by_ref(TypeSignature::Boolean)),
            )
            .unwrap();

        let ops: Vec<OpCode> = emitted(&target, &hook)
            .unwrap()
            .into_iter()
            .map(|(opcode, _)| opcode)
            .collect();
        assert_eq!(
            ops,
            vec![
                OpCode::Ldarga,
                OpCode::Ldarg,
                OpCode::LdindI8,
                OpCode::Ldarg,
                OpCode::Ldloca,
                OpCode::Call,
            ]
        );
        assert!(binds_result(&target, &hook));
    }

    #[test]
    fn mismatches_are_construction_errors() {
        let (runtime, target) = setup();
        let ty = runtime.define_type("App", "Hooks", None).unwrap();

        let unknown = runtime
            .define_method(MethodBuilder::new(&ty, "A").param("missing", TypeSignature::I4))
            .unwrap();
        let wrong_type = runtime
            .define_method(MethodBuilder::new(&ty, "B").param("amount", TypeSignature::String))
            .unwrap();
        let instance_hook = runtime
            .define_method(MethodBuilder::new(&ty, "C").instance())
            .unwrap();

        for hook in [&unknown, &wrong_type, &instance_hook] {
            assert!(matches!(
                emitted(&target, hook),
                Err(Error::Construction { .. })
            ));
        }
    }

    #[test]
    fn plain_names_yield_to_parameters() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let ty = runtime.define_type("App", "Calc", None).unwrap();
        let target = runtime
            .define_method(
                MethodBuilder::new(&ty, "Store")
                    .param("result", TypeSignature::I4)
                    .returns(TypeSignature::I4),
            )
            .unwrap();
        let hook = runtime
            .define_method(MethodBuilder::new(&ty, "Pre").param("result", TypeSignature::I4))
            .unwrap();

        let calls = emitted(&target, &hook).unwrap();
        assert!(matches!(&calls[0], (OpCode::Ldarg, Operand::Argument(arg)) if arg.index == 0));
        assert!(!binds_result(&target, &hook));
    }
}
