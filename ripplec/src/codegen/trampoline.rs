//! Trampoline lowering.
//!
//! Effectful functions return outcomes. After every call-like site the
//! caller tests the outcome: a value continues in place, an effect is
//! re-raised with this frame's continuation wrapped around the request's.
//! A `perform` builds a request whose continuation is the site's value
//! re-entry function closed over the site's environment record.

use ripple_runtime::abi::ResumptionKind;
use ripple_runtime::artifact::{Callee, ContSpec, FuncId, LocalId, Operand, Rvalue, Terminator};

use crate::config::BackendKind;
use crate::effects::OperationInfo;
use crate::mir::{Body, ContinuationSite, HandlerInfo, SiteKind};

use super::function::{BodyCx, Reentry};
use super::{CodegenError, LoweringStrategy};

#[derive(Debug, Clone, Copy, Default)]
pub struct Trampoline;

impl Trampoline {
    /// Continue after a call-like site whose outcome is in `outcome`.
    fn check(&self, cx: &mut BodyCx<'_, '_>, site: &ContinuationSite, outcome: LocalId) -> Result<(), CodegenError> {
        if site.tail {
            cx.fb.terminate(Terminator::Return(Operand::Local(outcome)));
            return Ok(());
        }

        let check = cx.fb.new_block();
        cx.fb.terminate(Terminator::Goto(check));
        cx.fb.switch_to(check);
        cx.record_check(site, outcome, check);

        let is_effect = cx.fb.temp(Rvalue::IsEffect(Operand::Local(outcome)));
        let (effect, value) = cx.fb.branch(Operand::Local(is_effect));

        cx.fb.switch_to(effect);
        let request = cx.fb.temp(Rvalue::OutcomeRequest(Operand::Local(outcome)));
        let func = cx.reentry(site, Reentry::Inner)?;
        let env = cx.site_env(site);
        let wrapped = cx.fb.temp(Rvalue::WrapRequest {
            request: Operand::Local(request),
            func,
            env,
            site_order: site.order,
        });
        let raised = cx.fb.temp(Rvalue::OutcomeEffect(Operand::Local(wrapped)));
        cx.fb.terminate(Terminator::Return(Operand::Local(raised)));

        cx.fb.switch_to(value);
        let dest = cx.dest(site);
        cx.fb.assign(dest, Rvalue::OutcomeValueOf(Operand::Local(outcome)));
        cx.goto_target(site);
        Ok(())
    }

    fn raise(&self, cx: &mut BodyCx<'_, '_>, request: Operand) {
        let raised = cx.fb.temp(Rvalue::OutcomeEffect(request));
        cx.fb.terminate(Terminator::Return(Operand::Local(raised)));
    }
}

impl LoweringStrategy for Trampoline {
    fn kind(&self) -> BackendKind {
        BackendKind::Trampoline
    }

    fn reentries(&self, site: &ContinuationSite, body: &Body, perform_kind: Option<ResumptionKind>) -> Vec<Reentry> {
        if !body.effectful || site.tail {
            return Vec::new();
        }
        match (site.kind, perform_kind) {
            (SiteKind::Perform, Some(ResumptionKind::Tail)) => vec![Reentry::Value, Reentry::Inner],
            (SiteKind::Perform, _) => vec![Reentry::Value],
            _ => vec![Reentry::Inner],
        }
    }

    fn lower_return(&self, cx: &mut BodyCx<'_, '_>, value: Operand) {
        let value = if cx.is_effectful() {
            Operand::Local(cx.fb.temp(Rvalue::OutcomeValue(value)))
        } else {
            value
        };
        cx.fb.terminate(Terminator::Return(value));
    }

    fn lower_call(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        callee: FuncId,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError> {
        let outcome = cx.fb.call_temp(Callee::Direct(callee), args);
        self.check(cx, site, outcome)
    }

    fn lower_perform(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        op: &OperationInfo,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError> {
        if op.kind == ResumptionKind::Tail {
            let (outcome, miss) = cx.direct_clause_call(site, op, &args);
            self.check(cx, site, outcome)?;
            cx.fb.switch_to(miss);
        }

        let cont = if site.tail {
            ContSpec::Identity
        } else {
            let func = cx.reentry(site, Reentry::Value)?;
            let env = cx.site_env(site);
            ContSpec::Closure { func, env }
        };
        let request = cx.make_request(site, op, args, cont);
        self.raise(cx, request);
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
        let outcome = cx.fb.call_temp(Callee::Direct(setup.body_fn), args);

        let dispatch = cx.runtime().dispatch;
        let handled = cx.fb.call_temp(
            Callee::Direct(dispatch),
            vec![Operand::Local(outcome), Operand::Local(setup.frame), cx.cur()],
        );

        if cx.is_effectful() {
            return self.check(cx, site, handled);
        }
        // Nothing outside a pure body can handle what escapes here.
        let dest = cx.dest(site);
        cx.fb.assign(dest, Rvalue::OutcomeValueOf(Operand::Local(handled)));
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
        let outcome = cx.fb.call_temp(Callee::Resume(cont), vec![value]);
        self.check(cx, site, outcome)
    }

    fn lower_tail_resume(&self, cx: &mut BodyCx<'_, '_>, cont: Operand, value: Operand) {
        let direct = cx.fb.temp(Rvalue::IsDirect(cont.clone()));
        let (fast, slow) = cx.fb.branch(Operand::Local(direct));

        cx.fb.switch_to(fast);
        cx.fb.temp(Rvalue::ObserveGuard(cont.clone()));
        let done = cx.fb.temp(Rvalue::OutcomeValue(value.clone()));
        cx.fb.terminate(Terminator::Return(Operand::Local(done)));

        cx.fb.switch_to(slow);
        let outcome = cx.fb.call_temp(Callee::Resume(cont), vec![value]);
        cx.fb.terminate(Terminator::Return(Operand::Local(outcome)));
    }
}
