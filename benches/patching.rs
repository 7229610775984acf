//! Benchmarks for the patching pipeline.
//!
//! - Decoding a method body
//! - Composing a body with prefixes and suffixes
//! - A full commit cycle (compose, encode, install) and its revert
//! - Calls through a patched entry compared to the original

extern crate dotpatch;

use criterion::{criterion_group, criterion_main, Criterion};
use dotpatch::{
    metadata::resolver::ModuleResolver,
    patch::compose,
    prelude::*,
};
use std::{hint::black_box, sync::Arc};

struct Bench {
    runtime: Arc<Runtime>,
    target: MethodHandle,
    prefix: MethodHandle,
    suffix: MethodHandle,
}

/// `int Sum(int n)`: sums 0..n in a loop.
fn setup() -> Bench {
    let runtime = Arc::new(Runtime::new(RuntimeConfig::default()).unwrap());
    let ty = runtime.define_type("Bench", "Loops", None).unwrap();

    let target = runtime
        .define_method(
            MethodBuilder::new(&ty, "Sum")
                .param("n", TypeSignature::I4)
                .returns(TypeSignature::I4),
        )
        .unwrap();
    let check = Label::new();
    let body_start = Label::new();
    let body = InstructionAssembler::new()
        .ldc_i4(0)
        .stloc(0)
        .ldc_i4(0)
        .stloc(1)
        .branch(OpCode::Br, &check)
        .label(&body_start)
        .ldloc(0)
        .ldloc(1)
        .op(OpCode::Add)
        .stloc(0)
        .ldloc(1)
        .ldc_i4(1)
        .op(OpCode::Add)
        .stloc(1)
        .label(&check)
        .ldloc(1)
        .ldarg(0)
        .branch(OpCode::Blt, &body_start)
        .ldloc(0)
        .ret()
        .finish()
        .unwrap();
    runtime
        .implement(&target, vec![TypeSignature::I4, TypeSignature::I4], &body)
        .unwrap();

    // static void Clamp(ref int n) => n = n & 0xff
    let prefix = runtime
        .define_method(
            MethodBuilder::new(&ty, "Clamp").param("n", TypeSignature::by_ref(TypeSignature::I4)),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldarg(0)
        .ldind(&TypeSignature::I4)
        .ldc_i4(0xff)
        .op(OpCode::And)
        .stind(&TypeSignature::I4)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&prefix, Vec::new(), &body).unwrap();

    // static void Touch(ref int __result) => __result = __result + 1
    let suffix = runtime
        .define_method(
            MethodBuilder::new(&ty, "Touch")
                .param("__result", TypeSignature::by_ref(TypeSignature::I4)),
        )
        .unwrap();
    let body = InstructionAssembler::new()
        .ldarg(0)
        .ldarg(0)
        .ldind(&TypeSignature::I4)
        .ldc_i4(1)
        .op(OpCode::Add)
        .stind(&TypeSignature::I4)
        .ret()
        .finish()
        .unwrap();
    runtime.implement(&suffix, Vec::new(), &body).unwrap();

    Bench {
        runtime,
        target,
        prefix,
        suffix,
    }
}

fn bench_decode(c: &mut Criterion) {
    let bench = setup();
    let blob = bench
        .runtime
        .code_heap()
        .read_blob(bench.target.entry())
        .unwrap();
    let resolver = ModuleResolver::new(bench.runtime.module());

    c.bench_function("decode_loop_body", |b| {
        b.iter(|| {
            let decoded = decode_method(black_box(&blob), &resolver, &bench.target).unwrap();
            black_box(decoded)
        });
    });
}

fn bench_compose(c: &mut Criterion) {
    let bench = setup();
    let blob = bench
        .runtime
        .code_heap()
        .read_blob(bench.target.entry())
        .unwrap();
    let resolver = ModuleResolver::new(bench.runtime.module());

    let engine = PatchEngine::new(bench.runtime.clone());
    let mut context = engine.context("bench");
    for _ in 0..4 {
        context.add_prefix(&bench.target, &bench.prefix).unwrap();
        context.add_suffix(&bench.target, &bench.suffix).unwrap();
    }
    let snapshot = engine.hooks(&bench.target).unwrap();

    c.bench_function("compose_prefix_suffix", |b| {
        b.iter(|| {
            let decoded = decode_method(&blob, &resolver, &bench.target).unwrap();
            let composed = compose(&bench.target, decoded, black_box(&snapshot)).unwrap();
            black_box(composed)
        });
    });
}

fn bench_commit_cycle(c: &mut Criterion) {
    let bench = setup();
    let engine = PatchEngine::new(bench.runtime.clone());

    c.bench_function("commit_and_detach", |b| {
        b.iter(|| {
            let mut context = engine.context("bench");
            context.add_prefix(&bench.target, &bench.prefix).unwrap();
            context.add_suffix(&bench.target, &bench.suffix).unwrap();
            black_box(engine.commit().unwrap());
            black_box(engine.detach().unwrap());
        });
    });
    bench.runtime.collect().unwrap();
}

fn bench_calls(c: &mut Criterion) {
    let bench = setup();
    let args = || vec![Value::I4(100)];

    c.bench_function("call_original", |b| {
        b.iter(|| black_box(bench.runtime.invoke(&bench.target, args()).unwrap()));
    });

    let engine = PatchEngine::new(bench.runtime.clone());
    let mut context = engine.context("bench");
    context.add_prefix(&bench.target, &bench.prefix).unwrap();
    context.add_suffix(&bench.target, &bench.suffix).unwrap();
    engine.commit().unwrap();

    c.bench_function("call_patched", |b| {
        b.iter(|| black_box(bench.runtime.invoke(&bench.target, args()).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_compose,
    bench_commit_cycle,
    bench_calls
);
criterion_main!(benches);
