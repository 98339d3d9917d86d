//! Call-path overhead of the native bridge.
//!
//!   cargo bench --bench dispatch
//!
//! Without per-closure call counters:
//!   cargo bench --bench dispatch --no-default-features

use std::{hint::black_box, sync::Arc};

use clink::{
    CodeRegion, FunctionDescription, LambdaList, Runtime, RuntimeCreateInfo, ThreadCreateInfo,
    ThreadLocalState, Value,
};
use criterion::{Criterion, criterion_group, criterion_main};

fn add(a: i64, b: i64) -> i64 {
    a + b
}

fn sum7(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64) -> i64 {
    a + b + c + d + e + f + g
}

fn setup() -> (Runtime, ThreadLocalState) {
    let runtime = Runtime::new(RuntimeCreateInfo::default());
    runtime.code_space().register(CodeRegion::covering(
        "bench",
        &[
            add as fn(i64, i64) -> i64 as usize,
            sum7 as fn(i64, i64, i64, i64, i64, i64, i64) -> i64 as usize,
        ],
    ));
    let tls = ThreadLocalState::new(1, &ThreadCreateInfo::default());
    (runtime, tls)
}

/// Fixed-arity entry, no lambda-list parsing.
fn bench_direct(c: &mut Criterion) {
    let (runtime, mut tls) = setup();
    let closure = runtime.wrap_function(
        "add",
        add as fn(i64, i64) -> i64,
        FunctionDescription::default(),
    );
    let args = [Value::fixnum(3), Value::fixnum(4)];

    c.bench_function("direct_add", |b| {
        b.iter(|| closure.call(&mut tls, black_box(&args)).map(|r| r.primary()));
    });
}

/// Same native behind `(a &optional (b 0))`.
fn bench_lambda_list(c: &mut Criterion) {
    let (runtime, mut tls) = setup();
    let list = LambdaList::new()
        .required(runtime.intern("a"))
        .optional(runtime.intern("b"), Value::fixnum(0));
    let closure = runtime.wrap_function_lambda_list(
        "add*",
        add as fn(i64, i64) -> i64,
        Arc::new(list),
        FunctionDescription::default(),
    );
    let args = [Value::fixnum(3)];

    c.bench_function("lambda_list_add", |b| {
        b.iter(|| closure.call(&mut tls, black_box(&args)).map(|r| r.primary()));
    });
}

/// More arguments than the fixed entries cover.
fn bench_general(c: &mut Criterion) {
    let (runtime, mut tls) = setup();
    let closure = runtime.wrap_function(
        "sum7",
        sum7 as fn(i64, i64, i64, i64, i64, i64, i64) -> i64,
        FunctionDescription::default(),
    );
    let args: Vec<_> = (1..=7).map(Value::fixnum).collect();

    c.bench_function("general_sum7", |b| {
        b.iter(|| closure.call(&mut tls, black_box(&args)).map(|r| r.primary()));
    });
}

/// Lookup by name plus dispatch.
fn bench_named_call(c: &mut Criterion) {
    let (runtime, mut tls) = setup();
    runtime.wrap_function(
        "add",
        add as fn(i64, i64) -> i64,
        FunctionDescription::default(),
    );
    let args = [Value::fixnum(3), Value::fixnum(4)];

    c.bench_function("named_add", |b| {
        b.iter(|| runtime.call(&mut tls, black_box("add"), &args).map(|r| r.primary()));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_direct, bench_lambda_list, bench_general, bench_named_call
}

criterion_main!(benches);
