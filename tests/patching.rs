//! End-to-end patching tests.
//!
//! Every test defines a small host module, registers hooks through one or more contexts,
//! commits and calls the patched functions through their original entry points.

use dotpatch::prelude::*;
use std::sync::{Arc, Mutex};

fn runtime() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Runtime::new(RuntimeConfig::default()).unwrap())
}

/// `bool IsPositive(int x) => x >= 0`
fn is_positive(runtime: &Runtime, ty: &TypeHandle) -> MethodHandle {
    let method = runtime
        .define_method(
            MethodBuilder::new(ty, "IsPositive")
                .param("x", TypeSignature::I4)
                .returns(TypeSignature::Boolean),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldc_i4(0)
        .op(OpCode::Clt)
        .ldc_i4(0)
        .op(OpCode::Ceq)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&method, Vec::new(), &body).unwrap();
    method
}

/// A native hook that appends `tag` to `log` and returns `returns`.
fn recorder(
    ty: &TypeHandle,
    name: &str,
    log: &Arc<Mutex<Vec<String>>>,
    returns: Option<Value>,
) -> MethodBuilder {
    let log = log.clone();
    let tag = name.to_string();
    MethodBuilder::new(ty, name).native(move |_| {
        log.lock().unwrap().push(tag.clone());
        Ok(returns.clone())
    })
}

fn call_i4(runtime: &Runtime, method: &MethodHandle, x: i32) -> Value {
    runtime
        .invoke(method, vec![Value::I4(x)])
        .unwrap()
        .unwrap()
}

#[test]
fn by_ref_prefix_changes_the_argument() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);

    // static void Negate(ref int x) => x = -x
    let negate = runtime
        .define_method(
            MethodBuilder::new(&ty, "Negate").param("x", TypeSignature::by_ref(TypeSignature::I4)),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldarg(0)
        .ldind(&TypeSignature::I4)
        .op(OpCode::Neg)
        .stind(&TypeSignature::I4)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&negate, Vec::new(), &body).unwrap();

    assert_eq!(call_i4(&runtime, &target, -5), Value::from_bool(false));

    let engine = PatchEngine::new(runtime.clone());
    engine.context("negate").add_prefix(&target, &negate).unwrap();
    engine.commit().unwrap();

    assert_eq!(call_i4(&runtime, &target, -5), Value::from_bool(true));
    assert_eq!(call_i4(&runtime, &target, 5), Value::from_bool(false));

    engine.detach().unwrap();
    assert_eq!(call_i4(&runtime, &target, -5), Value::from_bool(false));
    assert_eq!(call_i4(&runtime, &target, 5), Value::from_bool(true));
}

#[test]
fn by_value_prefix_writes_stay_local() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Echo", None).unwrap();
    let seen = runtime
        .define_field(&ty, "seen", TypeSignature::I4, true)
        .unwrap();

    // int Echo(int x) => x
    let target = runtime
        .define_method(
            MethodBuilder::new(&ty, "Echo")
                .param("x", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();
    let body = InstructionAssembler::new().ldarg(0).ret().finish().unwrap();
    runtime.implement(&target, Vec::new(), &body).unwrap();

    // static void Clobber(int x) { x = 100; seen = x; }
    let clobber = runtime
        .define_method(MethodBuilder::new(&ty, "Clobber").param("x", TypeSignature::I4))
        .unwrap();
    let body = InstructionAssembler::new()
        .ldc_i4(100)
        .starg(0)
        .ldarg(0)
        .stsfld(&seen)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&clobber, Vec::new(), &body).unwrap();

    let engine = PatchEngine::new(runtime.clone());
    engine.context("clobber").add_prefix(&target, &clobber).unwrap();
    engine.commit().unwrap();

    assert_eq!(call_i4(&runtime, &target, 5), Value::I4(5));
    assert_eq!(
        dotpatch::runtime::load(seen.static_slot().unwrap()).unwrap(),
        Value::I4(100)
    );
}

#[test]
fn cancelled_body_has_no_side_effects() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Switch", None).unwrap();
    let armed = runtime
        .define_field(&ty, "armed", TypeSignature::I4, true)
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    // static void Arm() => armed = 1
    let target = runtime.define_method(MethodBuilder::new(&ty, "Arm")).unwrap();
    let body = InstructionAssembler::new()
        .ldc_i4(1)
        .stsfld(&armed)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&target, Vec::new(), &body).unwrap();

    let veto = runtime
        .define_method(
            recorder(&ty, "Veto", &log, Some(Value::from_bool(false)))
                .returns(TypeSignature::Boolean),
        )
        .unwrap();

    let engine = PatchEngine::new(runtime.clone());
    engine.context("veto").add_prefix(&target, &veto).unwrap();
    engine.commit().unwrap();

    let armed_value = || dotpatch::runtime::load(armed.static_slot().unwrap()).unwrap();
    assert_eq!(runtime.invoke(&target, Vec::new()).unwrap(), None);
    assert_eq!(*log.lock().unwrap(), vec!["Veto"]);
    assert_eq!(armed_value(), Value::I4(0));

    engine.detach().unwrap();
    runtime.invoke(&target, Vec::new()).unwrap();
    assert_eq!(armed_value(), Value::I4(1));
}

#[test]
fn cancelled_body_still_runs_suffixes() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));

    let skip = runtime
        .define_method(
            recorder(&ty, "Skip", &log, Some(Value::from_bool(false)))
                .returns(TypeSignature::Boolean),
        )
        .unwrap();
    let never = runtime
        .define_method(recorder(&ty, "Never", &log, None).priority(HookPriority::LOW))
        .unwrap();
    let after = runtime
        .define_method(recorder(&ty, "After", &log, None))
        .unwrap();

    // static void Force(ref bool __result) => __result = true
    let force = runtime
        .define_method(
            MethodBuilder::new(&ty, "Force")
                .param("__result", TypeSignature::by_ref(TypeSignature::Boolean)),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldc_i4(1)
        .stind(&TypeSignature::Boolean)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&force, Vec::new(), &body).unwrap();

    let engine = PatchEngine::new(runtime.clone());
    let mut context = engine.context("cancel");
    context.add_prefix(&target, &skip).unwrap();
    context.add_prefix(&target, &never).unwrap();
    context.add_suffix(&target, &after).unwrap();
    engine.commit().unwrap();

    // the body is skipped, the result slot keeps its default
    assert_eq!(call_i4(&runtime, &target, 3), Value::from_bool(false));
    assert_eq!(*log.lock().unwrap(), vec!["Skip", "After"]);

    context.add_suffix(&target, &force).unwrap();
    engine.commit().unwrap();
    assert_eq!(call_i4(&runtime, &target, -3), Value::from_bool(true));
}

#[test]
fn priorities_order_hooks() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));

    let define = |name: &str, priority: HookPriority| {
        runtime
            .define_method(recorder(&ty, name, &log, None).priority(priority))
            .unwrap()
    };
    let low = define("LowPrefix", HookPriority::LOW);
    let high = define("HighPrefix", HookPriority::HIGH);
    let normal_a = define("NormalA", HookPriority::NORMAL);
    let normal_b = define("NormalB", HookPriority::NORMAL);
    let late = define("HighSuffix", HookPriority::HIGH);
    let early = define("LowSuffix", HookPriority::LOW);

    let engine = PatchEngine::new(runtime.clone());
    let mut first = engine.context("first");
    let mut second = engine.context("second");
    first.add_prefix(&target, &low).unwrap();
    second.add_prefix(&target, &normal_a).unwrap();
    first.add_prefix(&target, &high).unwrap();
    first.add_prefix(&target, &normal_b).unwrap();
    second.add_suffix(&target, &late).unwrap();
    first.add_suffix(&target, &early).unwrap();
    engine.commit().unwrap();

    assert_eq!(call_i4(&runtime, &target, 1), Value::from_bool(true));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["HighPrefix", "NormalA", "NormalB", "LowPrefix", "LowSuffix", "HighSuffix"]
    );
}

#[test]
fn transpilers_chain_by_priority() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Math", None).unwrap();
    let value = runtime
        .define_method(MethodBuilder::new(&ty, "Value").returns(TypeSignature::I4))
        .unwrap();
    let body = InstructionAssembler::new().ldc_i4(2).ret().finish().unwrap();
    runtime.implement(&value, Vec::new(), &body).unwrap();

    // inserts `ldc.i4 k; <op>` before the final ret
    fn append(name: &str, k: i32, op: OpCode) -> Transpiler {
        Transpiler::new(name, move |_, mut body: Vec<Instruction>| {
            let ret = body.pop();
            body.push(Instruction::new(OpCode::LdcI4, Operand::Int32(k))?);
            body.push(Instruction::simple(op)?);
            body.extend(ret);
            Ok(body)
        })
    }

    let engine = PatchEngine::new(runtime.clone());
    let mut context = engine.context("math");
    context
        .add_transpiler(&value, append("times ten", 10, OpCode::Mul))
        .unwrap();
    context
        .add_transpiler(
            &value,
            append("plus three", 3, OpCode::Add).with_priority(HookPriority::HIGH),
        )
        .unwrap();
    engine.commit().unwrap();

    // (2 + 3) * 10
    assert_eq!(
        runtime.invoke(&value, Vec::new()).unwrap(),
        Some(Value::I4(50))
    );
}

#[test]
fn freeing_a_context_keeps_the_others() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));
    let mine = runtime.define_method(recorder(&ty, "Mine", &log, None)).unwrap();
    let theirs = runtime.define_method(recorder(&ty, "Theirs", &log, None)).unwrap();

    let engine = PatchEngine::new(runtime.clone());
    let mut a = engine.context("a");
    let mut b = engine.context("b");
    a.add_prefix(&target, &mine).unwrap();
    a.add_suffix(&target, &mine).unwrap();
    b.add_prefix(&target, &theirs).unwrap();
    engine.commit().unwrap();

    call_i4(&runtime, &target, 0);
    assert_eq!(*log.lock().unwrap(), vec!["Mine", "Theirs", "Mine"]);

    assert_eq!(a.free().unwrap(), 2);
    assert!(matches!(
        a.add_prefix(&target, &mine),
        Err(Error::ContextFreed(_))
    ));
    let summary = engine.commit().unwrap();
    assert_eq!(summary.patched, 1);

    log.lock().unwrap().clear();
    call_i4(&runtime, &target, 0);
    assert_eq!(*log.lock().unwrap(), vec!["Theirs"]);

    b.free().unwrap();
    let summary = engine.commit().unwrap();
    assert_eq!(summary.unpatched, 1);
    assert!(!engine.is_patched(&target).unwrap());
}

#[test]
fn revert_and_recommit_are_idempotent() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));
    let hook = runtime.define_method(recorder(&ty, "Hook", &log, None)).unwrap();
    let pristine = runtime.code_heap().read_blob(target.entry()).unwrap();

    let engine = PatchEngine::new(runtime.clone());
    let mut context = engine.context("idempotent");
    context.add_prefix(&target, &hook).unwrap();

    engine.commit().unwrap();
    let entry = engine.artifact_entry(&target).unwrap();
    assert_eq!(engine.commit().unwrap(), CommitSummary::default());
    assert_eq!(engine.artifact_entry(&target).unwrap(), entry);

    assert_eq!(engine.detach().unwrap(), 1);
    assert_eq!(engine.detach().unwrap(), 0);
    assert_eq!(
        runtime.code_heap().read_blob(target.entry()).unwrap(),
        pristine
    );

    // the hooks were removed by detach, the context can register again
    context.add_prefix(&target, &hook).unwrap();
    engine.commit().unwrap();
    call_i4(&runtime, &target, 1);
    assert_eq!(*log.lock().unwrap(), vec!["Hook"]);

    // only the registration made after detach is still counted
    assert_eq!(context.free().unwrap(), 1);
    assert_eq!(engine.commit().unwrap().unpatched, 1);
}

#[test]
fn hooks_bind_instance_result_and_arguments() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Account", None).unwrap();
    let balance = runtime
        .define_field(&ty, "balance", TypeSignature::I4, false)
        .unwrap();

    // int Deposit(int amount) { balance += amount; return balance; }
    let deposit = runtime
        .define_method(
            MethodBuilder::new(&ty, "Deposit")
                .instance()
                .param("amount", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldarg(0)
        .ldfld(&balance)
        .ldarg(1)
        .op(OpCode::Add)
        .stfld(&balance)
        .ldarg(0)
        .ldfld(&balance)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&deposit, Vec::new(), &body).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    // static void Audit(Account __instance, int amount, int result)
    let audit = runtime
        .define_method(
            MethodBuilder::new(&ty, "Audit")
                .param("__instance", TypeSignature::Class(ty.clone()))
                .param("amount", TypeSignature::I4)
                .param("result", TypeSignature::I4)
                .native(move |args| {
                    let is_object = args[0].as_object().is_some();
                    observed
                        .lock()
                        .unwrap()
                        .push((is_object, args[1].as_i4(), args[2].as_i4()));
                    Ok(None)
                }),
        )
        .unwrap();

    // static void Double(ref int amount) => amount *= 2
    let double = runtime
        .define_method(
            MethodBuilder::new(&ty, "Double")
                .param("amount", TypeSignature::by_ref(TypeSignature::I4)),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldarg(0)
        .ldind(&TypeSignature::I4)
        .ldc_i4(2)
        .op(OpCode::Mul)
        .stind(&TypeSignature::I4)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&double, Vec::new(), &body).unwrap();

    let engine = PatchEngine::new(runtime.clone());
    let mut context = engine.context("bank");
    context.add_prefix(&deposit, &double).unwrap();
    context.add_suffix(&deposit, &audit).unwrap();
    engine.commit().unwrap();

    let fields = runtime.module().instance_fields(&ty);
    let account = Value::Object(Arc::new(Object::new(ty.clone(), fields.iter())));
    let result = runtime
        .invoke(&deposit, vec![account.clone(), Value::I4(10)])
        .unwrap();

    assert_eq!(result, Some(Value::I4(20)));
    assert_eq!(*seen.lock().unwrap(), vec![(true, Some(20), Some(20))]);
}

#[test]
fn unbindable_hooks_fail_the_commit() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));

    let wrong_name = runtime
        .define_method(recorder(&ty, "WrongName", &log, None).param("y", TypeSignature::I4))
        .unwrap();
    let wrong_type = runtime
        .define_method(recorder(&ty, "WrongType", &log, None).param("x", TypeSignature::String))
        .unwrap();

    let engine = PatchEngine::new(runtime.clone());
    let mut context = engine.context("broken");
    for hook in [&wrong_name, &wrong_type] {
        let id = context.add_prefix(&target, hook).unwrap();
        match engine.commit() {
            Err(Error::Commit { failures }) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0].1, Error::Construction { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!engine.is_patched(&target).unwrap());
        context.remove(id).unwrap();
    }

    // nothing left, the function is clean again
    engine.commit().unwrap();
    assert_eq!(call_i4(&runtime, &target, 1), Value::from_bool(true));
}

#[test]
fn contexts_register_from_many_threads() {
    let runtime = runtime();
    let ty = runtime.define_type("App", "Checks", None).unwrap();
    let target = is_positive(&runtime, &ty);
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks: Vec<MethodHandle> = (0..8)
        .map(|index| {
            runtime
                .define_method(recorder(&ty, &format!("Hook{index}"), &log, None))
                .unwrap()
        })
        .collect();

    let engine = PatchEngine::new(runtime.clone());
    std::thread::scope(|scope| {
        for hook in &hooks {
            let engine = &engine;
            let target = &target;
            scope.spawn(move || {
                let mut context = engine.context(hook.name.clone());
                context.add_prefix(target, hook).unwrap();
            });
        }
    });

    let summary = engine.commit().unwrap();
    assert_eq!(summary.patched, 1);
    call_i4(&runtime, &target, 1);
    assert_eq!(log.lock().unwrap().len(), 8);
}
