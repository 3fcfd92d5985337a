//! Generated handler dispatch.
//!
//! Every module carries a dispatcher and a resumption wrapper for its
//! backend. A `handle` site installs its frame, runs the body, and hands the
//! body's outcome to the dispatcher together with the frame range
//! `[from, stop)` the handler owns:
//!
//! ```text
//! trampoline                              stack switching
//! __dispatch(o, from, stop)               __dispatch_ss(o, from, stop)
//!   loop                                    loop
//!     value or from == stop -> return o       value -> return its payload
//!     w = wrap(req, __handled_resume)         frame found ->
//!     frame found -> o = clause(w),             return clause(wrap(req))
//!                    from = frame.prev        none ->
//!     none        -> return effect(w)           v = suspend forward(req)
//!                                               o = req.cont(v)
//! ```
//!
//! Wrapping the request before the clause sees it means that resuming the
//! continuation re-enters the dispatcher, so effects raised by the body after
//! a resumption meet the same handler again.

use ripple_runtime::artifact::{
    BinOp, BlockId, Callee, EnvFieldLayout, EnvLayout, FieldSource, HandlerQuery, LocalId, Operand, Rvalue,
    SuspendPayload, Terminator, ValType,
};

use crate::config::BackendKind;

use super::builder::{FunctionBuilder, ModuleBuilder};
use super::{Codegen, CodegenError, RuntimeFns};

pub const DISPATCH: &str = "__dispatch";
pub const HANDLED_RESUME: &str = "__handled_resume";
pub const DISPATCH_SS: &str = "__dispatch_ss";
pub const HANDLED_RESUME_SS: &str = "__handled_resume_ss";

/// Site order recorded on requests wrapped by the dispatcher.
const DISPATCH_ORDER: u32 = u32::MAX;

/// Reserve the dispatch functions and their environment layout.
pub fn declare(module: &mut ModuleBuilder, backend: BackendKind) -> RuntimeFns {
    let (dispatch, handled_resume) = match backend {
        BackendKind::Trampoline => (DISPATCH, HANDLED_RESUME),
        BackendKind::StackSwitching => (DISPATCH_SS, HANDLED_RESUME_SS),
    };
    let dispatch_layout = module.intern_layout(EnvLayout {
        name: format!("{}$env", dispatch),
        fields: ["from", "stop"]
            .into_iter()
            .map(|name| EnvFieldLayout {
                name: name.to_string(),
                source: FieldSource::Handler,
                val_type: ValType::AnyRef,
            })
            .collect(),
    });
    RuntimeFns {
        dispatch: module.declare(dispatch, 3),
        handled_resume: module.declare(handled_resume, 3),
        dispatch_layout,
    }
}

pub fn define(cg: &mut Codegen<'_>) -> Result<(), CodegenError> {
    let runtime = cg.runtime;
    let (dispatch, handled_resume) = match cg.backend {
        BackendKind::Trampoline => (trampoline_dispatch(runtime), handled_resume(HANDLED_RESUME, runtime)),
        BackendKind::StackSwitching => (stack_switch_dispatch(runtime), handled_resume(HANDLED_RESUME_SS, runtime)),
    };
    cg.module.define(runtime.dispatch, dispatch.finish());
    cg.module.define(runtime.handled_resume, handled_resume.finish());
    tracing::debug!(backend = %cg.backend, "defined dispatch helpers");
    Ok(())
}

fn local(id: LocalId) -> Operand {
    Operand::Local(id)
}

/// Look up the innermost handler for `request` in `[from, stop)` and branch
/// on the result. Returns the frame local and the `(found, missing)` blocks.
fn find_handler(
    fb: &mut FunctionBuilder,
    from: LocalId,
    stop: LocalId,
    request: LocalId,
) -> (LocalId, (BlockId, BlockId)) {
    let frame = fb.temp(Rvalue::FindHandler {
        from: local(from),
        stop: local(stop),
        query: HandlerQuery::Request(local(request)),
    });
    let found = fb.temp(Rvalue::IsFrame(local(frame)));
    (frame, fb.branch(local(found)))
}

/// Call the clause of `frame` with `request`, leaving the result in a fresh
/// local.
fn call_clause(fb: &mut FunctionBuilder, frame: LocalId, request: LocalId) -> (LocalId, LocalId) {
    let clause = fb.temp(Rvalue::FrameClause(local(frame)));
    let prev = fb.temp(Rvalue::FramePrev(local(frame)));
    let env = fb.temp(Rvalue::FrameEnv(local(frame)));
    let result = fb.call_temp(Callee::Indirect(local(clause)), vec![local(prev), local(env), local(request)]);
    (result, prev)
}

fn wrap(fb: &mut FunctionBuilder, runtime: RuntimeFns, request: LocalId, from: LocalId, stop: LocalId) -> LocalId {
    let env = fb.temp(Rvalue::MakeEnv {
        layout: runtime.dispatch_layout,
        fields: vec![local(from), local(stop)],
    });
    fb.temp(Rvalue::WrapRequest {
        request: local(request),
        func: runtime.handled_resume,
        env: local(env),
        site_order: DISPATCH_ORDER,
    })
}

fn trampoline_dispatch(runtime: RuntimeFns) -> FunctionBuilder {
    let mut fb = FunctionBuilder::new(DISPATCH, 3);
    let (outcome, from, stop) = (fb.param(0), fb.param(1), fb.param(2));

    let head = fb.new_block();
    fb.terminate(Terminator::Goto(head));
    fb.switch_to(head);
    let is_effect = fb.temp(Rvalue::IsEffect(local(outcome)));
    let (effect, done) = fb.branch(local(is_effect));
    fb.terminate_block(done, Terminator::Return(local(outcome)));

    fb.switch_to(effect);
    let at_stop = fb.temp(Rvalue::Binary(BinOp::Eq, local(from), local(stop)));
    let (leave, search) = fb.branch(local(at_stop));
    fb.terminate_block(leave, Terminator::Return(local(outcome)));

    fb.switch_to(search);
    let request = fb.temp(Rvalue::OutcomeRequest(local(outcome)));
    let wrapped = wrap(&mut fb, runtime, request, from, stop);
    let (frame, (hit, miss)) = find_handler(&mut fb, from, stop, request);

    fb.switch_to(miss);
    let raised = fb.temp(Rvalue::OutcomeEffect(local(wrapped)));
    fb.terminate(Terminator::Return(local(raised)));

    fb.switch_to(hit);
    let (result, prev) = call_clause(&mut fb, frame, wrapped);
    fb.assign(outcome, Rvalue::Use(local(result)));
    fb.assign(from, Rvalue::Use(local(prev)));
    fb.terminate(Terminator::Goto(head));
    fb
}

fn stack_switch_dispatch(runtime: RuntimeFns) -> FunctionBuilder {
    let mut fb = FunctionBuilder::new(DISPATCH_SS, 3);
    let (outcome, from, stop) = (fb.param(0), fb.param(1), fb.param(2));

    let head = fb.new_block();
    fb.terminate(Terminator::Goto(head));
    fb.switch_to(head);
    let is_effect = fb.temp(Rvalue::IsEffect(local(outcome)));
    let (effect, done) = fb.branch(local(is_effect));

    fb.switch_to(done);
    let value = fb.temp(Rvalue::OutcomeValueOf(local(outcome)));
    fb.terminate(Terminator::Return(local(value)));

    fb.switch_to(effect);
    let request = fb.temp(Rvalue::OutcomeRequest(local(outcome)));
    let (frame, (hit, miss)) = find_handler(&mut fb, from, stop, request);

    fb.switch_to(hit);
    let wrapped = wrap(&mut fb, runtime, request, from, stop);
    let (result, _) = call_clause(&mut fb, frame, wrapped);
    fb.terminate(Terminator::Return(local(result)));

    // Not ours: suspend the enclosing fiber with the same request, then feed
    // the answer back into the inner one.
    fb.switch_to(miss);
    let answer = fb.new_local();
    fb.suspend(answer, SuspendPayload::Forward(local(request)));
    let inner = fb.temp(Rvalue::RequestCont(local(request)));
    fb.call(outcome, Callee::Continuation(local(inner)), vec![local(answer)]);
    fb.terminate(Terminator::Goto(head));
    fb
}

/// `(env, inner, v)`: resume the wrapped continuation and dispatch whatever
/// it produces against the handler recorded in `env`.
fn handled_resume(name: &str, runtime: RuntimeFns) -> FunctionBuilder {
    let mut fb = FunctionBuilder::new(name, 3);
    let (env, inner, value) = (fb.param(0), fb.param(1), fb.param(2));
    let outcome = fb.call_temp(Callee::Continuation(local(inner)), vec![local(value)]);
    let from = fb.temp(Rvalue::EnvField(local(env), 0));
    let stop = fb.temp(Rvalue::EnvField(local(env), 1));
    let result = fb.call_temp(
        Callee::Direct(runtime.dispatch),
        vec![local(outcome), local(from), local(stop)],
    );
    fb.terminate(Terminator::Return(local(result)));
    fb
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_runtime::artifact::{Inst, Module};

    fn build(backend: BackendKind) -> Module {
        let mut module = ModuleBuilder::new();
        let runtime = declare(&mut module, backend);
        let (dispatch, resume) = match backend {
            BackendKind::Trampoline => (trampoline_dispatch(runtime), handled_resume(HANDLED_RESUME, runtime)),
            BackendKind::StackSwitching => (stack_switch_dispatch(runtime), handled_resume(HANDLED_RESUME_SS, runtime)),
        };
        module.define(runtime.dispatch, dispatch.finish());
        module.define(runtime.handled_resume, resume.finish());
        assert!(module.undefined().is_empty());
        module.finish()
    }

    #[test]
    fn test_trampoline_helpers() {
        let module = build(BackendKind::Trampoline);
        assert_eq!(module.func_by_name(DISPATCH), Some(ripple_runtime::artifact::FuncId(0)));
        assert!(module.func_by_name(HANDLED_RESUME).is_some());
        assert_eq!(module.env_layouts.len(), 1);
        assert_eq!(module.env_layouts[0].fields.len(), 2);

        let dispatch = &module.functions[0];
        let suspends = dispatch
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Suspend { .. }))
            .count();
        assert_eq!(suspends, 0);
    }

    #[test]
    fn test_stack_switch_dispatch_forwards_by_suspending() {
        let module = build(BackendKind::StackSwitching);
        let dispatch = module.func_by_name(DISPATCH_SS).and_then(|id| module.function(id)).unwrap();
        let forwards = dispatch
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Suspend { payload: SuspendPayload::Forward(_), .. }))
            .count();
        assert_eq!(forwards, 1);
        assert!(module.func_by_name(DISPATCH).is_none());
    }

    #[test]
    fn test_handled_resume_shape() {
        let module = build(BackendKind::Trampoline);
        let resume = module.func_by_name(HANDLED_RESUME).and_then(|id| module.function(id)).unwrap();
        assert_eq!(resume.params, 3);
        assert_eq!(resume.blocks.len(), 1);
        assert!(matches!(resume.blocks[0].insts[0], Inst::Call { callee: Callee::Continuation(_), .. }));
    }
}
