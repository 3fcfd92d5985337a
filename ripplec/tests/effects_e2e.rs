//! Programs compiled with both backends and driven through the host ABI.

mod common;

use common::{expect_done, expect_pending, session, BACKENDS};
use ripple_runtime::{HostError, MachineConfig, ResumptionKind, Step, Trap, WireValue};
use ripplec::hir::build::*;
use ripplec::hir::{EffectDecl, EffectRow, Expr, FnDecl, OpDecl, Program, Type};
use ripplec::BackendKind;

fn async_effect() -> EffectDecl {
    EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int))
}

fn state_effect() -> EffectDecl {
    EffectDecl::new("State").op(OpDecl::resume("get", vec![], Type::Int))
}

#[test]
fn test_pure_export() {
    let program = Program::new().function(
        FnDecl::new("double", Type::Int)
            .param("n", Type::Int)
            .export()
            .body(mul(local("n"), int(2))),
    );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let step = session.start("double", vec![WireValue::Int(21)]).unwrap();
        assert_eq!(expect_done(step), WireValue::Int(42), "{}", backend);
    }
}

#[test]
fn test_tail_clause_handled_in_program() {
    let program = Program::new()
        .effect(EffectDecl::new("Counter").op(OpDecl::tail("tick", vec![Type::Int], Type::Int)))
        .function(FnDecl::new("main", Type::Int).export().body(handle(
            add(perform("Counter", "tick", vec![int(3)]), int(1)),
            Type::Int,
            vec![clause("Counter", "tick", &["n"], "k", tail("k", add(local("n"), int(4))))],
        )));
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        assert_eq!(expect_done(session.start("main", vec![]).unwrap()), WireValue::Int(8), "{}", backend);
    }
}

#[test]
fn test_unhandled_operation_reaches_host() {
    let program = Program::new().effect(async_effect()).function(
        FnDecl::new("main", Type::Int)
            .row(EffectRow::of(&["Async"]))
            .export()
            .body(add(perform("Async", "await", vec![int(1)]), int(1))),
    );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let request = expect_pending(session.start("main", vec![]).unwrap());
        assert_eq!(request.qualified_name(), "Async.await");
        assert_eq!(request.kind, ResumptionKind::Resume);
        assert_eq!(request.args, [WireValue::Int(1)]);

        let step = session.resume(request.handle, &WireValue::Int(41)).unwrap();
        assert_eq!(expect_done(step), WireValue::Int(42), "{}", backend);
        assert_eq!(session.stats().resumptions, 1);
    }
}

#[test]
fn test_inner_handler_forwards_other_effects() {
    let program = Program::new().effect(async_effect()).effect(state_effect()).function(
        FnDecl::new("main", Type::Int)
            .row(EffectRow::of(&["Async"]))
            .export()
            .body(handle(
                add(perform("State", "get", vec![]), perform("Async", "await", vec![int(5)])),
                Type::Int,
                vec![clause("State", "get", &[], "k", resume("k", int(10)))],
            )),
    );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let request = expect_pending(session.start("main", vec![]).unwrap());
        assert_eq!(request.qualified_name(), "Async.await", "{}", backend);
        assert_eq!(request.args, [WireValue::Int(5)]);
        let step = session.resume(request.handle, &WireValue::Int(7)).unwrap();
        assert_eq!(expect_done(step), WireValue::Int(17), "{}", backend);
    }
}

#[test]
fn test_handler_sees_effects_raised_after_resumption() {
    let program = Program::new().effect(EffectDecl::new("Gen").op(OpDecl::resume("next", vec![Type::Int], Type::Int))).function(
        FnDecl::new("main", Type::Int).export().body(handle(
            block(vec![
                let_("i", Type::Int, int(0)),
                let_("s", Type::Int, int(0)),
                while_(
                    lt(local("i"), int(3)),
                    block(vec![
                        assign("s", add(local("s"), perform("Gen", "next", vec![local("i")]))),
                        assign("i", add(local("i"), int(1))),
                    ]),
                ),
                local("s"),
            ]),
            Type::Int,
            vec![clause("Gen", "next", &["x"], "k", resume("k", mul(local("x"), int(10))))],
        )),
    );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        assert_eq!(expect_done(session.start("main", vec![]).unwrap()), WireValue::Int(30), "{}", backend);
    }
}

#[test]
fn test_effectful_callee_inside_handler() {
    let program = Program::new()
        .effect(state_effect())
        .function(
            FnDecl::new("ask", Type::Int)
                .row(EffectRow::of(&["State"]))
                .body(add(perform("State", "get", vec![]), int(1))),
        )
        .function(FnDecl::new("main", Type::Int).export().body(handle(
            mul(call("ask", vec![]), call("ask", vec![])),
            Type::Int,
            vec![clause("State", "get", &[], "k", resume("k", int(4)))],
        )));
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        assert_eq!(expect_done(session.start("main", vec![]).unwrap()), WireValue::Int(25), "{}", backend);
    }
}

#[test]
fn test_clause_may_abort_without_resuming() {
    let program = Program::new()
        .effect(EffectDecl::new("Fail").op(OpDecl::resume("fail", vec![], Type::Int)))
        .function(FnDecl::new("main", Type::Int).export().body(handle(
            add(perform("Fail", "fail", vec![]), int(1)),
            Type::Int,
            vec![clause("Fail", "fail", &[], "k", int(-1))],
        )));
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        assert_eq!(expect_done(session.start("main", vec![]).unwrap()), WireValue::Int(-1), "{}", backend);
    }
}

#[test]
fn test_multi_shot_clause_on_trampoline() {
    let program = Program::new()
        .effect(EffectDecl::new("Choose").op(OpDecl::resume("flip", vec![], Type::Bool)))
        .function(FnDecl::new("main", Type::Int).export().body(handle(
            if_(perform("Choose", "flip", vec![]), int(1), int(2)),
            Type::Int,
            vec![clause(
                "Choose",
                "flip",
                &[],
                "k",
                add(resume("k", bool(true)), resume("k", bool(false))),
            )],
        )));
    let mut session = session(&program, BackendKind::Trampoline);
    assert_eq!(expect_done(session.start("main", vec![]).unwrap()), WireValue::Int(3));
    assert_eq!(session.stats().resumptions, 2);
}

#[test]
fn test_second_resumption_of_tail_request_traps() {
    let program = Program::new()
        .effect(EffectDecl::new("Log").op(OpDecl::tail("info", vec![Type::Str], Type::Unit)))
        .function(
            FnDecl::new("main", Type::Int)
                .row(EffectRow::of(&["Log"]))
                .export()
                .body(block(vec![perform("Log", "info", vec![str("hi")]), int(7)])),
        );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let request = expect_pending(session.start("main", vec![]).unwrap());
        assert_eq!(request.kind, ResumptionKind::Tail);
        assert_eq!(request.args, [WireValue::Str("hi".into())]);
        let step = session.resume(request.handle, &WireValue::Unit).unwrap();
        assert_eq!(expect_done(step), WireValue::Int(7));

        let err = session.resume(request.handle, &WireValue::Unit).unwrap_err();
        assert!(
            matches!(err.trap(), Some(Trap::TailGuardViolation { expected: 1, attempted: 2, .. })),
            "{}: {:?}",
            backend,
            err
        );
    }
}

#[test]
fn test_generic_instances_run_independently() {
    let program = Program::new()
        .effect(async_effect())
        .function(
            FnDecl::new("keep", Type::Param(0))
                .generic(1)
                .param("x", Type::Param(0))
                .row(EffectRow::of(&["Async"]))
                .body(block(vec![
                    let_("r", Type::Int, perform("Async", "await", vec![int(0)])),
                    local("x"),
                ])),
        )
        .function(
            FnDecl::new("main", Type::tuple([Type::Int, Type::Str]))
                .row(EffectRow::of(&["Async"]))
                .export()
                .body(tuple(vec![
                    call_generic("keep", vec![Type::Int], vec![int(5)]),
                    call_generic("keep", vec![Type::Str], vec![str("a")]),
                ])),
        );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let first = expect_pending(session.start("main", vec![]).unwrap());
        let second = expect_pending(session.resume(first.handle, &WireValue::Int(0)).unwrap());
        assert_ne!(first.handle, second.handle);
        let done = expect_done(session.resume(second.handle, &WireValue::Int(0)).unwrap());
        assert_eq!(
            done,
            WireValue::Array(vec![WireValue::Int(5), WireValue::Str("a".into())]),
            "{}",
            backend
        );
    }
}

#[test]
fn test_malformed_payload_leaves_run_resumable() {
    let program = Program::new().effect(async_effect()).function(
        FnDecl::new("main", Type::Int)
            .row(EffectRow::of(&["Async"]))
            .export()
            .body(perform("Async", "await", vec![int(0)])),
    );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let request = expect_pending(session.start("main", vec![]).unwrap());
        let err = session.resume(request.handle, &WireValue::Str("nope".into())).unwrap_err();
        assert!(matches!(err, HostError::MalformedPayload(_)), "{:?}", err);
        let err = session.resume_bytes(request.handle, &[0xff]).unwrap_err();
        assert!(matches!(err, HostError::MalformedPayload(_)), "{:?}", err);

        let step = session.resume(request.handle, &WireValue::Int(3)).unwrap();
        assert_eq!(expect_done(step), WireValue::Int(3));
    }
}

#[test]
fn test_unknown_export_and_handle() {
    let program = Program::new().function(FnDecl::new("main", Type::Unit).export().body(unit()));
    let mut session = session(&program, BackendKind::Trampoline);
    assert!(matches!(session.start("missing", vec![]), Err(HostError::UnknownExport(_))));
    assert!(matches!(session.start("main", vec![WireValue::Int(1)]), Err(HostError::MalformedPayload(_))));
    assert!(matches!(session.resume(99, &WireValue::Unit), Err(HostError::UnknownHandle(99))));
}

#[test]
fn test_fibers_only_on_stack_switching() {
    let program = Program::new().effect(state_effect()).function(FnDecl::new("main", Type::Int).export().body(handle(
        perform("State", "get", vec![]),
        Type::Int,
        vec![clause("State", "get", &[], "k", resume("k", int(1)))],
    )));

    let mut trampoline = session(&program, BackendKind::Trampoline);
    expect_done(trampoline.start("main", vec![]).unwrap());
    assert_eq!(trampoline.stats().fiber_switches, 0);

    let mut switching = session(&program, BackendKind::StackSwitching);
    expect_done(switching.start("main", vec![]).unwrap());
    assert!(switching.stats().fiber_switches > 0);
}

#[test]
fn test_host_resumes_twice_without_replaying_prefix() {
    let program = Program::new()
        .effect(async_effect())
        .effect(EffectDecl::new("Log").op(OpDecl::tail("info", vec![Type::Str], Type::Unit)))
        .function(
            FnDecl::new("main", Type::Int)
                .row(EffectRow::of(&["Async", "Log"]))
                .export()
                .body(block(vec![
                    perform("Log", "info", vec![str("guard")]),
                    let_("v", Type::Int, perform("Async", "await", vec![int(1)])),
                    add(local("v"), int(1)),
                ])),
        );
    let mut session = session(&program, BackendKind::Trampoline);
    let log = expect_pending(session.start("main", vec![]).unwrap());
    assert_eq!(log.qualified_name(), "Log.info");
    let wait = expect_pending(session.resume(log.handle, &WireValue::Unit).unwrap());
    assert_eq!(wait.qualified_name(), "Async.await");

    assert_eq!(expect_done(session.resume(wait.handle, &WireValue::Int(1)).unwrap()), WireValue::Int(2));
    // The log request is not raised again.
    assert_eq!(expect_done(session.resume(wait.handle, &WireValue::Int(10)).unwrap()), WireValue::Int(11));
}

/// `s = sum of step(i * i) for i < n`, plus `step(n)`.
fn square_sum(step: fn(Expr) -> Expr) -> Expr {
    block(vec![
        let_("i", Type::Int, int(0)),
        let_("s", Type::Int, int(0)),
        while_(
            lt(local("i"), local("n")),
            block(vec![
                assign("s", add(local("s"), step(mul(local("i"), local("i"))))),
                assign("i", add(local("i"), int(1))),
            ]),
        ),
        add(local("s"), step(local("n"))),
    ])
}

#[test]
fn test_identity_handler_is_transparent() {
    let program = Program::new()
        .effect(EffectDecl::new("Pass").op(OpDecl::resume("through", vec![Type::Int], Type::Int)))
        .function(
            FnDecl::new("plain", Type::Int)
                .param("n", Type::Int)
                .export()
                .body(square_sum(|e| e)),
        )
        .function(FnDecl::new("handled", Type::Int).param("n", Type::Int).export().body(handle(
            square_sum(|e| perform("Pass", "through", vec![e])),
            Type::Int,
            vec![clause("Pass", "through", &["v"], "k", resume("k", local("v")))],
        )));
    for backend in BACKENDS {
        let instance = common::instance(&program, backend);
        for n in [0, 1, 5, 12] {
            let run = |export: &str| {
                let mut session = instance.session(MachineConfig::default());
                expect_done(session.start(export, vec![WireValue::Int(n)]).unwrap())
            };
            assert_eq!(run("handled"), run("plain"), "{} n={}", backend, n);
        }
    }
}

#[test]
fn test_guard_under_branch_fires_once_across_resumptions() {
    let program = Program::new()
        .effect(EffectDecl::new("Choose").op(OpDecl::resume("flip", vec![], Type::Bool)))
        .effect(EffectDecl::new("Mark").op(OpDecl::resume("hit", vec![], Type::Unit)))
        .function(
            FnDecl::new("main", Type::Int)
                .row(EffectRow::of(&["Mark"]))
                .export()
                .body(handle(
                    if_(
                        perform("Choose", "flip", vec![]),
                        block(vec![perform("Mark", "hit", vec![]), int(10)]),
                        int(1),
                    ),
                    Type::Int,
                    vec![clause(
                        "Choose",
                        "flip",
                        &[],
                        "k",
                        add(resume("k", bool(true)), resume("k", bool(false))),
                    )],
                )),
        );
    let mut session = session(&program, BackendKind::Trampoline);
    let mut hits = 0;
    let mut step = session.start("main", vec![]).unwrap();
    let result = loop {
        match step {
            Step::Done(value) => break value,
            Step::Pending(request) => {
                assert_eq!(request.qualified_name(), "Mark.hit");
                hits += 1;
                step = session.resume(request.handle, &WireValue::Unit).unwrap();
            }
        }
    };
    assert_eq!(result, WireValue::Int(11));
    assert_eq!(hits, 1);
}

#[test]
fn test_released_handles_free_run_state() {
    let program = Program::new()
        .effect(async_effect())
        .effect(EffectDecl::new("Local").op(OpDecl::resume("nop", vec![], Type::Int)))
        .function(
            FnDecl::new("main", Type::Int)
                .param("n", Type::Int)
                .row(EffectRow::of(&["Async"]))
                .export()
                .body(block(vec![
                    let_("i", Type::Int, int(0)),
                    let_("s", Type::Int, int(0)),
                    while_(
                        lt(local("i"), local("n")),
                        block(vec![
                            assign(
                                "s",
                                add(
                                    local("s"),
                                    handle(
                                        perform("Async", "await", vec![local("i")]),
                                        Type::Int,
                                        vec![clause("Local", "nop", &[], "k", resume("k", int(0)))],
                                    ),
                                ),
                            ),
                            assign("i", add(local("i"), int(1))),
                        ]),
                    ),
                    local("s"),
                ])),
        );
    for backend in BACKENDS {
        let mut session = session(&program, backend);
        let mut step = session.start("main", vec![WireValue::Int(50)]).unwrap();
        let mut requests = 0;
        let result = loop {
            match step {
                Step::Done(value) => break value,
                Step::Pending(request) => {
                    requests += 1;
                    let arg = request.args[0].clone();
                    step = session.resume(request.handle, &arg).unwrap();
                    assert!(session.release(request.handle));
                    assert!(session.open_handles() <= 1, "{}", backend);
                    assert!(session.live_frames() <= 1, "{}: {} frames", backend, session.live_frames());
                }
            }
        };
        assert_eq!(requests, 50);
        assert_eq!(result, WireValue::Int((0..50).sum()), "{}", backend);
        assert!(matches!(session.resume(1, &WireValue::Int(0)), Err(HostError::UnknownHandle(1))));

        session.close();
        assert_eq!(session.open_handles(), 0);
        assert_eq!(session.live_frames(), 0);
    }
}
