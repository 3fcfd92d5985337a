//! Backend benchmarks using criterion.
//!
//! Compares compilation time and handled-effect throughput of the
//! trampoline and stack switching backends on the same programs.
//!
//! Run with: cargo bench --bench dispatch_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_runtime::{Instance, MachineConfig, Step, WireValue};
use ripplec::config::CompilerConfig;
use ripplec::hir::build::*;
use ripplec::hir::{EffectDecl, EffectRow, FnDecl, OpDecl, Program, Type};
use ripplec::BackendKind;

const BACKENDS: [BackendKind; 2] = [BackendKind::Trampoline, BackendKind::StackSwitching];

fn config(backend: BackendKind) -> CompilerConfig {
    CompilerConfig::builder()
        .backend(backend)
        .target_stack_switching(true)
        .fallback(false)
        .build()
}

/// `count(n)` performs `Gen.next` n times under a handler that resumes
/// with its argument.
fn counting_program(tail_op: bool) -> Program {
    let op = if tail_op {
        OpDecl::tail("next", vec![Type::Int], Type::Int)
    } else {
        OpDecl::resume("next", vec![Type::Int], Type::Int)
    };
    let answer = if tail_op {
        tail("k", local("x"))
    } else {
        resume("k", local("x"))
    };
    Program::new().effect(EffectDecl::new("Gen").op(op)).function(
        FnDecl::new("count", Type::Int)
            .param("n", Type::Int)
            .export()
            .body(handle(
                block(vec![
                    let_("i", Type::Int, int(0)),
                    let_("s", Type::Int, int(0)),
                    while_(
                        lt(local("i"), local("n")),
                        block(vec![
                            assign("s", add(local("s"), perform("Gen", "next", vec![local("i")]))),
                            assign("i", add(local("i"), int(1))),
                        ]),
                    ),
                    local("s"),
                ]),
                Type::Int,
                vec![clause("Gen", "next", &["x"], "k", answer)],
            )),
    )
}

/// `relay()` sends a single `Async.await` to the host.
fn relay_program() -> Program {
    Program::new()
        .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
        .function(
            FnDecl::new("relay", Type::Int)
                .row(EffectRow::of(&["Async"]))
                .export()
                .body(add(perform("Async", "await", vec![int(1)]), int(1))),
        )
}

fn instance(program: &Program, backend: BackendKind) -> Instance {
    let output = ripplec::compile(program, &config(backend));
    let module = output.module.expect("benchmark program compiles");
    Instance::load(module).expect("benchmark artifact loads")
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let program = counting_program(false);
    for backend in BACKENDS {
        group.bench_with_input(BenchmarkId::from_parameter(backend), &backend, |b, &backend| {
            let config = config(backend);
            b.iter(|| black_box(ripplec::compile(black_box(&program), &config)));
        });
    }
    group.finish();
}

fn bench_handled_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("handled_loop");
    for (label, tail_op) in [("resume", false), ("tail", true)] {
        let program = counting_program(tail_op);
        for backend in BACKENDS {
            let instance = instance(&program, backend);
            group.bench_with_input(BenchmarkId::new(label, backend), &instance, |b, instance| {
                b.iter(|| {
                    let mut session = instance.session(MachineConfig::default());
                    black_box(session.start("count", vec![WireValue::Int(100)]))
                });
            });
        }
    }
    group.finish();
}

fn bench_host_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_round_trip");
    let program = relay_program();
    for backend in BACKENDS {
        let instance = instance(&program, backend);
        group.bench_with_input(BenchmarkId::from_parameter(backend), &instance, |b, instance| {
            b.iter(|| {
                let mut session = instance.session(MachineConfig::default());
                let handle = match session.start("relay", vec![]) {
                    Ok(Step::Pending(request)) => request.handle,
                    other => panic!("expected a pending request, got {:?}", other),
                };
                black_box(session.resume(handle, &WireValue::Int(41)))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_handled_loop, bench_host_round_trip);
criterion_main!(benches);
