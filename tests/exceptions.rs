//! Exception handling through patched functions.
//!
//! Protected regions of the original body must survive decoding, composition and encoding,
//! and managed exceptions raised by hooks or bodies must unwind like in unpatched code.

use dotpatch::{assembly::BlockKind, prelude::*, runtime::load};
use std::sync::{Arc, Mutex};

struct Fixture {
    runtime: Arc<Runtime>,
    ty: TypeHandle,
    finallies: FieldHandle,
    safe_div: MethodHandle,
}

/// `int SafeDiv(int a, int b)`:
///
/// ```text
/// try { try { r = a / b; } catch (DivideByZeroException) { r = -1; } }
/// finally { finallies++; }
/// return r;
/// ```
fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Arc::new(Runtime::new(RuntimeConfig::default()).unwrap());
    let ty = runtime.define_type("App", "Calc", None).unwrap();
    let finallies = runtime
        .define_field(&ty, "finallies", TypeSignature::I4, true)
        .unwrap();
    let dbz = runtime
        .module()
        .find_type("System.DivideByZeroException")
        .unwrap();

    let safe_div = runtime
        .define_method(
            MethodBuilder::new(&ty, "SafeDiv")
                .param("a", TypeSignature::I4)
                .param("b", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();

    let end = Label::named("end");
    let body = InstructionAssembler::new()
        .begin_try()
        .begin_try()
        .ldarg(0)
        .ldarg(1)
        .op(OpCode::Div)
        .stloc(0)
        .leave(&end)
        .begin_catch(&dbz)
        .op(OpCode::Pop)
        .ldc_i4(-1)
        .stloc(0)
        .leave(&end)
        .end_try()
        .begin_finally()
        .ldsfld(&finallies)
        .ldc_i4(1)
        .op(OpCode::Add)
        .stsfld(&finallies)
        .op(OpCode::Endfinally)
        .end_try()
        .label(&end)
        .ldloc(0)
        .ret()
        .finish()
        .unwrap();
    runtime
        .implement(&safe_div, vec![TypeSignature::I4], &body)
        .unwrap();

    Fixture {
        runtime,
        ty,
        finallies,
        safe_div,
    }
}

fn finallies(fixture: &Fixture) -> Value {
    load(fixture.finallies.static_slot().unwrap()).unwrap()
}

fn div(fixture: &Fixture, a: i32, b: i32) -> Option<Value> {
    fixture
        .runtime
        .invoke(&fixture.safe_div, vec![Value::I4(a), Value::I4(b)])
        .unwrap()
}

#[test]
fn regions_survive_patching() {
    let fixture = fixture();
    assert_eq!(div(&fixture, 10, 2), Some(Value::I4(5)));
    assert_eq!(div(&fixture, 1, 0), Some(Value::I4(-1)));
    assert_eq!(finallies(&fixture), Value::I4(2));

    let results = Arc::new(Mutex::new(Vec::new()));
    let observed = results.clone();
    let suffix = fixture
        .runtime
        .define_method(
            MethodBuilder::new(&fixture.ty, "Observe")
                .param("__result", TypeSignature::I4)
                .native(move |args| {
                    observed.lock().unwrap().push(args[0].as_i4());
                    Ok(None)
                }),
        )
        .unwrap();

    let engine = PatchEngine::new(fixture.runtime.clone());
    engine
        .context("observer")
        .add_suffix(&fixture.safe_div, &suffix)
        .unwrap();
    engine.commit().unwrap();

    assert_eq!(div(&fixture, 9, 3), Some(Value::I4(3)));
    assert_eq!(div(&fixture, 9, 0), Some(Value::I4(-1)));
    assert_eq!(finallies(&fixture), Value::I4(4));
    assert_eq!(*results.lock().unwrap(), vec![Some(3), Some(-1)]);
}

#[test]
fn emitted_artifact_keeps_every_clause() {
    let fixture = fixture();
    let sink = Arc::new(MemorySink::new());
    let engine = PatchEngine::with_config(
        fixture.runtime.clone(),
        EngineConfig::default().with_dump(DumpFlags::ORIGINAL | DumpFlags::FINAL_EMITTED),
    )
    .with_sink(sink.clone());

    engine
        .context("identity")
        .add_transpiler(
            &fixture.safe_div,
            Transpiler::new("identity", |_, body| Ok(body)),
        )
        .unwrap();
    engine.commit().unwrap();

    let records = sink.records().unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        let text = record.lines.join("\n");
        assert_eq!(text.matches(".BeginTry").count(), 2, "{text}");
        assert_eq!(text.matches(".BeginCatch").count(), 1, "{text}");
        assert_eq!(text.matches(".BeginFinally").count(), 1, "{text}");
        assert_eq!(text.matches(".EndTry").count(), 2, "{text}");
    }

    assert_eq!(div(&fixture, 1, 0), Some(Value::I4(-1)));
    assert_eq!(finallies(&fixture), Value::I4(1));
}

#[test]
fn unhandled_exceptions_skip_suffixes() {
    let fixture = fixture();
    let runtime = &fixture.runtime;

    // int Ratio(int a) => 10 / a
    let ratio = runtime
        .define_method(
            MethodBuilder::new(&fixture.ty, "Ratio")
                .param("a", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldc_i4(10)
        .ldarg(0)
        .op(OpCode::Div)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&ratio, Vec::new(), &body).unwrap();

    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let suffix = runtime
        .define_method(MethodBuilder::new(&fixture.ty, "Count").native(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(None)
        }))
        .unwrap();

    let engine = PatchEngine::new(runtime.clone());
    engine.context("count").add_suffix(&ratio, &suffix).unwrap();
    engine.commit().unwrap();

    assert_eq!(
        runtime.invoke(&ratio, vec![Value::I4(5)]).unwrap(),
        Some(Value::I4(2))
    );
    match runtime.invoke(&ratio, vec![Value::I4(0)]) {
        Err(Error::UnhandledException { type_name }) => {
            assert_eq!(type_name, "System.DivideByZeroException");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn throwing_prefix_is_caught_by_the_caller() {
    let fixture = fixture();
    let runtime = &fixture.runtime;
    let ctor = runtime
        .module()
        .find_method("System.Exception", ".ctor")
        .unwrap();

    // static void Reject(int b) { if (b == 0) throw new Exception("zero"); }
    let reject = runtime
        .define_method(MethodBuilder::new(&fixture.ty, "Reject").param("b", TypeSignature::I4))
        .unwrap();
    let accept = Label::new();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .branch(OpCode::Brtrue, &accept)
        .ldstr("zero")
        .newobj(&ctor)
        .throw()
        .label(&accept)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&reject, Vec::new(), &body).unwrap();

    // int Guarded(int a, int b) { try { return SafeDiv(a, b); } catch (Exception) { return -2; } }
    let guarded = runtime
        .define_method(
            MethodBuilder::new(&fixture.ty, "Guarded")
                .param("a", TypeSignature::I4)
                .param("b", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();
    let end = Label::new();
    let body = InstructionAssembler::new()
        .begin_try()
        .ldarg(0)
        .ldarg(1)
        .call(&fixture.safe_div)
        .stloc(0)
        .leave(&end)
        .begin_catch(runtime.exception_type())
        .op(OpCode::Pop)
        .ldc_i4(-2)
        .stloc(0)
        .leave(&end)
        .end_try()
        .label(&end)
        .ldloc(0)
        .ret()
        .finish()
        .unwrap();
    runtime
        .implement(&guarded, vec![TypeSignature::I4], &body)
        .unwrap();

    let engine = PatchEngine::new(runtime.clone());
    engine
        .context("reject")
        .add_prefix(&fixture.safe_div, &reject)
        .unwrap();
    engine.commit().unwrap();

    let call = |a, b| runtime.invoke(&guarded, vec![Value::I4(a), Value::I4(b)]).unwrap();
    assert_eq!(call(8, 4), Some(Value::I4(2)));
    // the prefix throws before the protected body of SafeDiv is entered
    assert_eq!(call(8, 0), Some(Value::I4(-2)));
    assert_eq!(finallies(&fixture), Value::I4(1));

    engine.detach().unwrap();
    assert_eq!(call(8, 0), Some(Value::I4(-1)));
    assert_eq!(finallies(&fixture), Value::I4(2));
}

#[test]
fn code_inserted_around_regions_stays_outside() {
    let fixture = fixture();
    let counter = fixture.finallies.clone();

    // adds 10 to the counter before the outer try and 100 after it
    let bump = move |amount: i32| {
        InstructionAssembler::new()
            .ldsfld(&counter)
            .ldc_i4(amount)
            .op(OpCode::Add)
            .stsfld(&counter)
            .finish()
    };
    let around = Transpiler::new("around", move |_, mut body: Vec<Instruction>| {
        let opens = |i: &Instruction| i.blocks.iter().any(|b| b.kind == BlockKind::BeginTry);
        let closes = |i: &Instruction| i.blocks.iter().any(|b| b.kind == BlockKind::EndTry);

        let Some(last_close) = body.iter().rposition(closes) else {
            return Ok(body);
        };
        let after = bump(100)?;
        body.splice(last_close + 1..last_close + 1, after);

        let Some(first_open) = body.iter().position(opens) else {
            return Ok(body);
        };
        let before = bump(10)?;
        body.splice(first_open..first_open, before);
        Ok(body)
    });

    let engine = PatchEngine::new(fixture.runtime.clone());
    engine
        .context("around")
        .add_transpiler(&fixture.safe_div, around)
        .unwrap();
    engine.commit().unwrap();

    // exception path: the catch handles the division, the finally still runs once
    assert_eq!(div(&fixture, 1, 0), Some(Value::I4(-1)));
    assert_eq!(finallies(&fixture), Value::I4(111));

    assert_eq!(div(&fixture, 10, 2), Some(Value::I4(5)));
    assert_eq!(finallies(&fixture), Value::I4(222));
}
