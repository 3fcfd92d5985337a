//! Stack switching lowering.
//!
//! Code stays in direct style. A `handle` runs its body on a fresh fiber and
//! passes the fiber's first outcome to the dispatcher; a `perform` suspends
//! the running fiber and receives the resumption value in place. No
//! environment records or re-entry functions are generated: the parked fiber
//! keeps its own frames.

use ripple_runtime::abi::ResumptionKind;
use ripple_runtime::artifact::{Callee, Const, FuncId, Operand, Rvalue, SuspendPayload, Terminator};

use crate::config::BackendKind;
use crate::effects::OperationInfo;
use crate::mir::{Body, ContinuationSite, HandlerInfo};

use super::function::{BodyCx, Reentry};
use super::{CodegenError, LoweringStrategy};

#[derive(Debug, Clone, Copy, Default)]
pub struct StackSwitch;

impl LoweringStrategy for StackSwitch {
    fn kind(&self) -> BackendKind {
        BackendKind::StackSwitching
    }

    fn reentries(&self, _site: &ContinuationSite, _body: &Body, _perform_kind: Option<ResumptionKind>) -> Vec<Reentry> {
        Vec::new()
    }

    fn lower_return(&self, cx: &mut BodyCx<'_, '_>, value: Operand) {
        cx.fb.terminate(Terminator::Return(value));
    }

    fn lower_call(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        callee: FuncId,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError> {
        let dest = cx.dest(site);
        cx.fb.call(dest, Callee::Direct(callee), args);
        cx.goto_target(site);
        Ok(())
    }

    fn lower_perform(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        op: &OperationInfo,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError> {
        let dest = cx.dest(site);
        if op.kind == ResumptionKind::Tail {
            let (result, miss) = cx.direct_clause_call(site, op, &args);
            cx.fb.assign(dest, Rvalue::Use(Operand::Local(result)));
            cx.goto_target(site);
            cx.fb.switch_to(miss);
        }

        cx.fb.suspend(
            dest,
            SuspendPayload::New {
                effect_id: op.effect_id,
                op_id: op.op_id,
                op_index: op.op_index,
                kind: op.kind,
                args,
                site_order: site.order,
            },
        );
        cx.goto_target(site);
        Ok(())
    }

    fn lower_handle(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        handler: &HandlerInfo,
    ) -> Result<(), CodegenError> {
        let setup = cx.push_handler(handler)?;
        let mut args = vec![Operand::Local(setup.frame)];
        args.extend(setup.captures);
        let fiber = cx.fb.temp(Rvalue::NewFiber { func: setup.body_fn, args });
        let outcome = cx.fb.call_temp(Callee::Continuation(Operand::Local(fiber)), vec![Operand::Const(Const::Unit)]);

        let dispatch = cx.runtime().dispatch;
        let dest = cx.dest(site);
        cx.fb.call(
            dest,
            Callee::Direct(dispatch),
            vec![Operand::Local(outcome), Operand::Local(setup.frame), cx.cur()],
        );
        cx.goto_target(site);
        Ok(())
    }

    fn lower_resume(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        cont: Operand,
        value: Operand,
    ) -> Result<(), CodegenError> {
        let dest = cx.dest(site);
        cx.fb.call(dest, Callee::Resume(cont), vec![value]);
        cx.goto_target(site);
        Ok(())
    }

    fn lower_tail_resume(&self, cx: &mut BodyCx<'_, '_>, cont: Operand, value: Operand) {
        let direct = cx.fb.temp(Rvalue::IsDirect(cont.clone()));
        let (fast, slow) = cx.fb.branch(Operand::Local(direct));

        cx.fb.switch_to(fast);
        cx.fb.temp(Rvalue::ObserveGuard(cont.clone()));
        cx.fb.terminate(Terminator::Return(value.clone()));

        cx.fb.switch_to(slow);
        let result = cx.fb.call_temp(Callee::Resume(cont), vec![value]);
        cx.fb.terminate(Terminator::Return(Operand::Local(result)));
    }
}
