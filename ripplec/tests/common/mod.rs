//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use ripple_runtime::{HostRequest, Instance, MachineConfig, Session, Step, WireValue};
use ripplec::config::CompilerConfig;
use ripplec::hir::Program;
use ripplec::{BackendKind, CompileOutput};

pub const BACKENDS: [BackendKind; 2] = [BackendKind::Trampoline, BackendKind::StackSwitching];

/// Configuration that selects `backend` without falling back.
pub fn config(backend: BackendKind) -> CompilerConfig {
    CompilerConfig::builder()
        .backend(backend)
        .target_stack_switching(backend == BackendKind::StackSwitching)
        .fallback(false)
        .build()
}

pub fn compile(program: &Program, backend: BackendKind) -> CompileOutput {
    let output = ripplec::compile(program, &config(backend));
    assert!(
        !output.has_errors(),
        "{} build failed: {:?}",
        backend,
        output.errors().map(|d| d.summary()).collect::<Vec<_>>()
    );
    assert_eq!(output.backend, backend);
    output
}

pub fn instance(program: &Program, backend: BackendKind) -> Instance {
    let module = compile(program, backend).module.unwrap();
    Instance::load(module).unwrap()
}

pub fn session(program: &Program, backend: BackendKind) -> Session {
    instance(program, backend).session(MachineConfig::default())
}

pub fn expect_done(step: Step) -> WireValue {
    match step {
        Step::Done(value) => value,
        Step::Pending(request) => panic!("unexpected pending request {}", request.qualified_name()),
    }
}

pub fn expect_pending(step: Step) -> HostRequest {
    match step {
        Step::Pending(request) => request,
        Step::Done(value) => panic!("run finished early with {:?}", value),
    }
}
