//! Backend selection, artifact contents and compile-time diagnostics.

mod common;

use ripple_runtime::abi::{EFFECT_TABLE_SECTION, WIRE_SCHEMA_SECTION};
use ripple_runtime::{EffectTable, HostError, Instance};
use ripplec::config::CompilerConfig;
use ripplec::hir::build::*;
use ripplec::hir::{EffectDecl, EffectRow, FnDecl, OpDecl, Program, Type};
use ripplec::{BackendKind, ErrorCode};

fn multi_shot() -> Program {
    Program::new()
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
        )))
}

fn awaiting() -> Program {
    Program::new()
        .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
        .effect(EffectDecl::new("Log").op(OpDecl::tail("info", vec![Type::Str], Type::Unit)))
        .function(
            FnDecl::new("main", Type::Int)
                .param("n", Type::Int)
                .row(EffectRow::of(&["Async", "Log"]))
                .export()
                .body(block(vec![
                    let_("a", Type::Int, perform("Async", "await", vec![local("n")])),
                    perform("Log", "info", vec![str("awaited")]),
                    add(local("a"), local("n")),
                ])),
        )
}

fn codes(output: &ripplec::CompileOutput) -> Vec<ErrorCode> {
    output.errors().filter_map(|d| d.code).collect()
}

#[test]
fn test_stack_switching_when_target_supports_it() {
    let config = CompilerConfig::builder()
        .backend(BackendKind::StackSwitching)
        .target_stack_switching(true)
        .build();
    let output = ripplec::compile(&awaiting(), &config);
    assert!(!output.has_errors());
    assert_eq!(output.backend, BackendKind::StackSwitching);
    assert_eq!(output.stats.reentries, 0);
    let module = output.module.unwrap();
    assert!(module.func_by_name("__dispatch_ss").is_some());
    assert!(module.func_by_name("__dispatch").is_none());
}

#[test]
fn test_trampoline_generates_reentries() {
    let output = common::compile(&awaiting(), BackendKind::Trampoline);
    assert!(output.stats.reentries >= 2);
    let module = output.module.unwrap();
    assert!(module.functions.iter().any(|f| f.name.starts_with("main$") && f.name.ends_with('v')));
    assert!(!module.env_layouts.is_empty());
}

#[test]
fn test_missing_target_support_falls_back() {
    let config = CompilerConfig::builder().backend(BackendKind::StackSwitching).build();
    let output = ripplec::compile(&awaiting(), &config);
    assert!(!output.has_errors());
    assert_eq!(output.backend, BackendKind::Trampoline);
}

#[test]
fn test_missing_target_support_without_fallback() {
    let config = CompilerConfig::builder()
        .backend(BackendKind::StackSwitching)
        .fallback(false)
        .build();
    let output = ripplec::compile(&awaiting(), &config);
    assert_eq!(codes(&output), [ErrorCode::StackSwitchingUnavailable]);
    assert!(output.module.is_none());
}

#[test]
fn test_multi_shot_clause_blocks_stack_switching() {
    let strict = common::config(BackendKind::StackSwitching);
    let output = ripplec::compile(&multi_shot(), &strict);
    assert_eq!(codes(&output), [ErrorCode::StackSwitchingUnavailable]);

    let lenient = CompilerConfig::builder()
        .backend(BackendKind::StackSwitching)
        .target_stack_switching(true)
        .build();
    let output = ripplec::compile(&multi_shot(), &lenient);
    assert!(!output.has_errors());
    assert_eq!(output.backend, BackendKind::Trampoline);
}

#[test]
fn test_tail_clause_must_resume() {
    let program = Program::new()
        .effect(EffectDecl::new("Log").op(OpDecl::tail("info", vec![Type::Str], Type::Unit)))
        .function(FnDecl::new("main", Type::Unit).export().body(handle(
            perform("Log", "info", vec![str("x")]),
            Type::Unit,
            vec![clause("Log", "info", &["m"], "k", unit())],
        )));
    let output = ripplec::compile(&program, &CompilerConfig::default());
    assert_eq!(codes(&output), [ErrorCode::MissingTailResumption]);
    assert!(output.module.is_none());
}

#[test]
fn test_unmarshalable_export_is_rejected() {
    let program = Program::new()
        .effect(EffectDecl::new("Sched").op(OpDecl::resume("spawn", vec![Type::Cont], Type::Unit)))
        .function(
            FnDecl::new("main", Type::Unit)
                .row(EffectRow::of(&["Sched"]))
                .export()
                .body(unit()),
        );
    let output = ripplec::compile(&program, &CompilerConfig::default());
    assert_eq!(codes(&output), [ErrorCode::HostBoundaryPayloadViolation]);
}

#[test]
fn test_artifact_sections_agree() {
    let module = common::compile(&awaiting(), BackendKind::Trampoline).module.unwrap();
    let table = EffectTable::parse(module.section(EFFECT_TABLE_SECTION).unwrap()).unwrap();
    assert_eq!(table.len(), 2);
    assert!(module.section(WIRE_SCHEMA_SECTION).is_some());
    let instance = Instance::load(module).unwrap();
    assert_eq!(instance.exports().collect::<Vec<_>>(), ["main"]);
    assert_eq!(instance.schema().ops.len(), 2);
}

#[test]
fn test_artifact_without_effect_table_cannot_load() {
    let config = CompilerConfig::builder().emit_effect_table(false).build();
    let output = ripplec::compile(&awaiting(), &config);
    let module = output.module.unwrap();
    assert!(module.section(EFFECT_TABLE_SECTION).is_none());
    assert!(matches!(Instance::load(module), Err(HostError::MissingSection(_))));
}

#[test]
fn test_layouts_are_deterministic() {
    for backend in common::BACKENDS {
        let first = common::compile(&awaiting(), backend).module.unwrap();
        let second = common::compile(&awaiting(), backend).module.unwrap();
        assert_eq!(first.env_layouts, second.env_layouts);
        let names = |m: &ripple_runtime::artifact::Module| m.functions.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
    }
}

#[test]
fn test_specialized_instances_share_layout_memo() {
    let program = Program::new()
        .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
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
            FnDecl::new("main", Type::Float)
                .row(EffectRow::of(&["Async"]))
                .export()
                .body(block(vec![
                    call_generic("keep", vec![Type::Int], vec![int(1)]),
                    call_generic("keep", vec![Type::Int], vec![int(2)]),
                    call_generic("keep", vec![Type::Float], vec![float(1.5)]),
                ])),
        );
    let output = common::compile(&program, BackendKind::Trampoline);
    // main plus keep<int> and keep<float>
    assert_eq!(output.stats.instances, 3);
    let module = output.module.unwrap();
    let keeps = module
        .functions
        .iter()
        .filter(|f| f.name == "keep<int>" || f.name == "keep<float>")
        .count();
    assert_eq!(keeps, 2);
}
