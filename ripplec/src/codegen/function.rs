//! Per-body lowering.
//!
//! Every MIR body becomes one artifact function, and every resumable site of
//! an effectful body may add re-entry functions. A re-entry function is the
//! owner body lowered again with a prologue that reloads the saved bindings
//! from the environment record and jumps to the site's continuation. Dead
//! blocks are pruned afterwards.
//!
//! Artifact locals are laid out as hidden parameters followed by the MIR
//! locals:
//!
//! ```text
//! function / handle body   [cur, params.., locals..]
//! pure function            [params.., locals..]
//! clause                   [cur, env, req, captures.., k, locals..]
//! value re-entry           [env, v, cur, locals..]
//! inner re-entry           [env, inner, v, cur, locals..]
//! ```
//!
//! `cur` is the innermost handler frame active in the body.

use std::collections::HashMap;

use ripple_runtime::artifact::{
    BlockId, Callee, Const, ContSpec, EnvFieldLayout, EnvLayout, FieldSource, FuncId, Function, HandlerQuery,
    LocalId, Operand, Rvalue, Terminator, TrapCode,
};

use crate::effects::OperationInfo;
use crate::hir::Program;
use crate::mir::{
    self, val_type, Body, BodyId, BodyKind, ContinuationSite, FnRef, HandlerInfo, Instance, Local, SiteId,
    Statement, StatementKind, TerminatorKind,
};

use super::builder::FunctionBuilder;
use super::{Codegen, CodegenError, LoweringStrategy, RuntimeFns};

/// Shape of a re-entry function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reentry {
    /// `(env, v)`: `v` is the site's result.
    Value,
    /// `(env, inner, v)`: resume `inner` with `v`, then continue as the
    /// site would with the outcome.
    Inner,
}

impl Reentry {
    pub fn params(self) -> u32 {
        match self {
            Reentry::Value => 2,
            Reentry::Inner => 3,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Reentry::Value => "v",
            Reentry::Inner => "i",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Normal,
    Reentry(SiteId, Reentry),
}

/// Artifact parameter count of a body's normal entry.
pub fn body_params(body: &Body) -> u32 {
    match body.kind {
        BodyKind::Clause { .. } => 3,
        _ if body.effectful => 1 + body.param_count,
        _ => body.param_count,
    }
}

/// Symbol of `body` compiled for `instance`: the instance name followed by
/// the lifted-body suffix, e.g. `main$h0$c1`.
pub fn body_symbol(program: &Program, instance: &Instance, body: &Body) -> String {
    let root = &program.fn_decl(body.root).name;
    let suffix = body.name.strip_prefix(root.as_str()).unwrap_or("");
    format!("{}{}", instance.name, suffix)
}

pub fn reentry_symbol(symbol: &str, site: &ContinuationSite, variant: Reentry) -> String {
    format!("{}${}{}", symbol, site.id, variant.suffix())
}

/// Lower `body` for `instance` in the given entry mode.
pub fn lower_body<'m>(
    cg: &mut Codegen<'m>,
    strategy: &dyn LoweringStrategy,
    instance: &'m Instance,
    body: &'m Body,
    mode: EntryMode,
) -> Result<(FuncId, Function), CodegenError> {
    let symbol = body_symbol(cg.program, instance, body);
    let (name, params, cur, mir_base) = match mode {
        EntryMode::Normal => match body.kind {
            BodyKind::Clause { .. } => (symbol.clone(), 3, Operand::Local(LocalId(0)), 3),
            _ if body.effectful => (symbol.clone(), 1 + body.param_count, Operand::Local(LocalId(0)), 1),
            _ => (symbol.clone(), body.param_count, Operand::Const(Const::NullFrame), 0),
        },
        EntryMode::Reentry(site, variant) => {
            let site = cg.sites.get(site).ok_or(CodegenError::MissingSite(site))?;
            let params = variant.params();
            (reentry_symbol(&symbol, site, variant), params, Operand::Local(LocalId(params)), params + 1)
        }
    };
    let id = cg.func(&name)?;

    let mut fb = FunctionBuilder::new(name, params);
    fb.reserve_locals(mir_base + body.locals.len() as u32);
    let blocks = body.blocks.iter().map(|_| fb.new_block()).collect();
    let mut cx = BodyCx {
        cg,
        fb,
        body,
        instance,
        symbol,
        cur,
        mir_base,
        blocks,
        checks: HashMap::new(),
    };

    let reachable = body.reachable();
    for (i, block) in body.blocks.iter().enumerate() {
        if !reachable[i] {
            continue;
        }
        cx.fb.switch_to(cx.blocks[i]);
        for statement in &block.statements {
            cx.lower_statement(statement)?;
        }
        cx.lower_terminator(strategy, &block.terminator.kind)?;
    }

    cx.fb.switch_to(BlockId::ENTRY);
    cx.prologue(mode)?;
    Ok((id, cx.fb.finish()))
}

/// Lowering state of one function.
pub struct BodyCx<'c, 'm> {
    pub cg: &'c mut Codegen<'m>,
    pub fb: FunctionBuilder,
    pub body: &'m Body,
    pub instance: &'m Instance,
    /// Symbol of the body's normal entry.
    symbol: String,
    cur: Operand,
    mir_base: u32,
    blocks: Vec<BlockId>,
    /// Outcome local and check block of each call-like site, where an inner
    /// re-entry resumes.
    checks: HashMap<SiteId, (LocalId, BlockId)>,
}

/// A pushed handler frame.
pub struct HandlerSetup {
    pub frame: LocalId,
    pub body_fn: FuncId,
    pub captures: Vec<Operand>,
}

impl<'c, 'm> BodyCx<'c, 'm> {
    pub fn cur(&self) -> Operand {
        self.cur.clone()
    }

    pub fn is_effectful(&self) -> bool {
        self.body.effectful
    }

    pub fn runtime(&self) -> RuntimeFns {
        self.cg.runtime
    }

    pub fn local(&self, local: Local) -> LocalId {
        LocalId(self.mir_base + local.0)
    }

    pub fn operand(&self, op: &mir::Operand) -> Operand {
        match op {
            mir::Operand::Copy(local) => Operand::Local(self.local(*local)),
            mir::Operand::Const(constant) => Operand::Const(match constant {
                mir::Constant::Unit => Const::Unit,
                mir::Constant::Bool(b) => Const::Bool(*b),
                mir::Constant::Int(n) => Const::Int(*n),
                mir::Constant::Float(x) => Const::Float(*x),
                mir::Constant::Str(s) => Const::Str(s.clone()),
            }),
        }
    }

    fn operands(&self, ops: &[mir::Operand]) -> Vec<Operand> {
        ops.iter().map(|op| self.operand(op)).collect()
    }

    pub fn block(&self, block: mir::BlockId) -> BlockId {
        self.blocks[block.index()]
    }

    pub fn dest(&self, site: &ContinuationSite) -> LocalId {
        self.local(site.dest)
    }

    /// Continue at the site's target block.
    pub fn goto_target(&mut self, site: &ContinuationSite) {
        let target = self.block(site.target);
        self.fb.terminate(Terminator::Goto(target));
    }

    pub fn reentry(&self, site: &ContinuationSite, variant: Reentry) -> Result<FuncId, CodegenError> {
        self.cg.func(&reentry_symbol(&self.symbol, site, variant))
    }

    /// Remember where an inner re-entry picks up for `site`.
    pub fn record_check(&mut self, site: &ContinuationSite, outcome: LocalId, check: BlockId) {
        self.checks.insert(site.id, (outcome, check));
    }

    /// Build the environment record of `site`: suspension order, current
    /// handler, then the live bindings.
    pub fn site_env(&mut self, site: &ContinuationSite) -> Operand {
        let layout = self.cg.specializer.layout(site, self.instance).clone();
        let layout = self.cg.module.intern_layout(layout);
        let mut fields = vec![Operand::Const(Const::Int(i64::from(site.order))), self.cur()];
        fields.extend(site.live.iter().map(|local| Operand::Local(self.local(*local))));
        Operand::Local(self.fb.temp(Rvalue::MakeEnv { layout, fields }))
    }

    fn lifted(&self, body: BodyId) -> Result<FuncId, CodegenError> {
        let body = self.cg.mir.body(body);
        self.cg.func(&body_symbol(self.cg.program, self.instance, body))
    }

    fn callee(&self, callee: &FnRef) -> Result<FuncId, CodegenError> {
        let instances = self.cg.instances;
        let instance = instances
            .resolve(self.instance, callee)
            .ok_or_else(|| CodegenError::MissingInstance(self.cg.program.fn_decl(callee.def).name.clone()))?;
        self.cg.func(&instance.name)
    }

    /// Push a frame for `handler` on top of the current chain.
    pub fn push_handler(&mut self, handler: &HandlerInfo) -> Result<HandlerSetup, CodegenError> {
        let body_fn = self.lifted(handler.body)?;
        let clause_fn = self.lifted(handler.clause)?;

        let mir = self.cg.mir;
        let owner = self.body;
        let clause_body = mir.body(handler.clause);
        let layout = EnvLayout {
            name: format!("{}$env", body_symbol(self.cg.program, self.instance, clause_body)),
            fields: handler
                .captures
                .iter()
                .map(|local| {
                    let decl = &owner.locals[local.index()];
                    EnvFieldLayout {
                        name: decl.name.clone().unwrap_or_else(|| format!("t{}", local.0)),
                        source: if owner.is_param(*local) { FieldSource::Param } else { FieldSource::Local },
                        val_type: val_type(&self.instance.substitute(&decl.ty)),
                    }
                })
                .collect(),
        };
        let layout = self.cg.module.intern_layout(layout);
        let captures: Vec<Operand> = handler.captures.iter().map(|l| Operand::Local(self.local(*l))).collect();

        let env = self.fb.temp(Rvalue::MakeEnv { layout, fields: captures.clone() });
        let frame = self.fb.temp(Rvalue::PushFrame {
            prev: self.cur(),
            ops: handler.ops.clone(),
            clause: clause_fn,
            env: Operand::Local(env),
        });
        Ok(HandlerSetup { frame, body_fn, captures })
    }

    /// Look up a handler for a tail operation at the perform site and, when
    /// one exists, call its clause directly with a request that carries no
    /// continuation. Leaves the builder in the found branch and returns the
    /// clause's result together with the not-found block.
    pub fn direct_clause_call(
        &mut self,
        site: &ContinuationSite,
        op: &OperationInfo,
        args: &[Operand],
    ) -> (LocalId, BlockId) {
        let frame = self.fb.temp(Rvalue::FindHandler {
            from: self.cur(),
            stop: Operand::Const(Const::NullFrame),
            query: HandlerQuery::Op { effect_id: op.effect_id, op_id: op.op_id },
        });
        let found = self.fb.temp(Rvalue::IsFrame(Operand::Local(frame)));
        let (hit, miss) = self.fb.branch(Operand::Local(found));

        self.fb.switch_to(hit);
        let request = self.make_request(site, op, args.to_vec(), ContSpec::Direct);
        let clause = self.fb.temp(Rvalue::FrameClause(Operand::Local(frame)));
        let prev = self.fb.temp(Rvalue::FramePrev(Operand::Local(frame)));
        let env = self.fb.temp(Rvalue::FrameEnv(Operand::Local(frame)));
        let result = self.fb.call_temp(
            Callee::Indirect(Operand::Local(clause)),
            vec![Operand::Local(prev), Operand::Local(env), request],
        );
        (result, miss)
    }

    pub fn make_request(
        &mut self,
        site: &ContinuationSite,
        op: &OperationInfo,
        args: Vec<Operand>,
        cont: ContSpec,
    ) -> Operand {
        Operand::Local(self.fb.temp(Rvalue::MakeRequest {
            effect_id: op.effect_id,
            op_id: op.op_id,
            op_index: op.op_index,
            kind: op.kind,
            args,
            cont,
            site_order: site.order,
        }))
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<(), CodegenError> {
        match &statement.kind {
            StatementKind::Assign(dest, rvalue) => {
                let value = match rvalue {
                    mir::Rvalue::Use(op) => Rvalue::Use(self.operand(op)),
                    mir::Rvalue::Binary(op, lhs, rhs) => Rvalue::Binary(*op, self.operand(lhs), self.operand(rhs)),
                    mir::Rvalue::Unary(op, operand) => Rvalue::Unary(*op, self.operand(operand)),
                    mir::Rvalue::Tuple(items) => Rvalue::Tuple(self.operands(items)),
                    mir::Rvalue::Field(base, index) => Rvalue::Field(self.operand(base), *index),
                    mir::Rvalue::Builtin(builtin, args) => Rvalue::Builtin(*builtin, self.operands(args)),
                    mir::Rvalue::RequestArg(k, index) => Rvalue::RequestArg(Operand::Local(self.local(*k)), *index),
                };
                let dest = self.local(*dest);
                self.fb.assign(dest, value);
            }
            StatementKind::Call { dest, callee, args } => {
                let func = self.callee(callee)?;
                let args = self.operands(args);
                let dest = self.local(*dest);
                self.fb.call(dest, Callee::Direct(func), args);
            }
        }
        Ok(())
    }

    fn site(&self, id: SiteId) -> Result<&'m ContinuationSite, CodegenError> {
        let sites = self.cg.sites;
        sites.get(id).ok_or(CodegenError::MissingSite(id))
    }

    fn lower_terminator(&mut self, strategy: &dyn LoweringStrategy, term: &TerminatorKind) -> Result<(), CodegenError> {
        match term {
            TerminatorKind::Goto(target) => {
                let target = self.block(*target);
                self.fb.terminate(Terminator::Goto(target));
            }
            TerminatorKind::Branch { cond, then_block, else_block } => {
                let term = Terminator::Branch {
                    cond: self.operand(cond),
                    then_block: self.block(*then_block),
                    else_block: self.block(*else_block),
                };
                self.fb.terminate(term);
            }
            TerminatorKind::SwitchOp { request, targets } => {
                let request = Operand::Local(self.local(*request));
                let discr = self.fb.temp(Rvalue::RequestOpIndex(request));
                let targets = targets
                    .iter()
                    .map(|(op, block)| (i64::from(op.0), self.block(*block)))
                    .collect();
                let otherwise = self.fb.new_block();
                self.fb.terminate_block(otherwise, Terminator::Trap(TrapCode::NoMatchingClause));
                self.fb.terminate(Terminator::Switch { discr: Operand::Local(discr), targets, otherwise });
            }
            TerminatorKind::Return(value) => {
                let value = self.operand(value);
                strategy.lower_return(self, value);
            }
            TerminatorKind::Unreachable => self.fb.terminate(Terminator::Trap(TrapCode::Unreachable)),
            TerminatorKind::Call { site, callee, args, .. } => {
                let site = self.site(*site)?;
                let func = self.callee(callee)?;
                let mut call_args = vec![self.cur()];
                call_args.extend(self.operands(args));
                strategy.lower_call(self, site, func, call_args)?;
            }
            TerminatorKind::Perform { site, op, args, .. } => {
                let site = self.site(*site)?;
                let registry = self.cg.registry;
                let info = registry.by_index(*op).ok_or(CodegenError::UnknownOperation(op.0))?;
                let args = self.operands(args);
                strategy.lower_perform(self, site, info, args)?;
            }
            TerminatorKind::Handle { site, handler, .. } => {
                let site = self.site(*site)?;
                let body = self.body;
                let handler = body
                    .handlers
                    .get(*handler as usize)
                    .ok_or(CodegenError::MissingSite(site.id))?;
                strategy.lower_handle(self, site, handler)?;
            }
            TerminatorKind::Resume { site, cont, value, .. } => {
                let site = self.site(*site)?;
                let cont = Operand::Local(self.local(*cont));
                let value = self.operand(value);
                strategy.lower_resume(self, site, cont, value)?;
            }
            TerminatorKind::TailResume { cont, value } => {
                let cont = Operand::Local(self.local(*cont));
                let value = self.operand(value);
                strategy.lower_tail_resume(self, cont, value);
            }
        }
        Ok(())
    }

    /// Fill the entry block.
    fn prologue(&mut self, mode: EntryMode) -> Result<(), CodegenError> {
        match mode {
            EntryMode::Normal => {
                if let BodyKind::Clause { .. } = self.body.kind {
                    let env = Operand::Local(LocalId(1));
                    let captures = self.body.param_count.saturating_sub(1);
                    for i in 0..captures {
                        let dest = self.local(Local(i));
                        self.fb.assign(dest, Rvalue::EnvField(env.clone(), i));
                    }
                    let k = self.local(Local(captures));
                    self.fb.assign(k, Rvalue::Use(Operand::Local(LocalId(2))));
                }
                let entry = self.blocks[0];
                self.fb.terminate(Terminator::Goto(entry));
            }
            EntryMode::Reentry(site, variant) => {
                let site = self.site(site)?;
                let env = Operand::Local(LocalId(0));
                let cur = LocalId(variant.params());
                self.fb.assign(cur, Rvalue::EnvField(env.clone(), 1));
                for (j, local) in site.live.iter().enumerate() {
                    let dest = self.local(*local);
                    self.fb.assign(dest, Rvalue::EnvField(env.clone(), 2 + j as u32));
                }
                match variant {
                    Reentry::Value => {
                        let dest = self.dest(site);
                        self.fb.assign(dest, Rvalue::Use(Operand::Local(LocalId(1))));
                        self.goto_target(site);
                    }
                    Reentry::Inner => {
                        let (outcome, check) =
                            self.checks.get(&site.id).copied().ok_or(CodegenError::MissingSite(site.id))?;
                        self.fb.call(
                            outcome,
                            Callee::Continuation(Operand::Local(LocalId(1))),
                            vec![Operand::Local(LocalId(2))],
                        );
                        self.fb.terminate(Terminator::Goto(check));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, CompilerConfig};
    use crate::hir::build::*;
    use crate::hir::{EffectDecl, FnDecl, OpDecl, Type};
    use ripple_runtime::artifact::Module;

    fn handled() -> Program {
        Program::new()
            .effect(EffectDecl::new("State").op(OpDecl::resume("get", vec![], Type::Int)))
            .function(FnDecl::new("main", Type::Int).param("n", Type::Int).export().body(handle(
                add(perform("State", "get", vec![]), local("n")),
                Type::Int,
                vec![clause("State", "get", &[], "k", resume("k", local("n")))],
            )))
    }

    fn build(backend: BackendKind) -> Module {
        let config = CompilerConfig::builder()
            .backend(backend)
            .target_stack_switching(true)
            .fallback(false)
            .build();
        let output = crate::compile(&handled(), &config);
        assert!(!output.has_errors(), "{:?}", output.diagnostics);
        output.module.unwrap()
    }

    fn params(module: &Module, name: &str) -> u32 {
        let id = module.func_by_name(name).unwrap_or_else(|| panic!("no function `{}`", name));
        module.function(id).unwrap().params
    }

    #[test]
    fn test_hidden_parameters() {
        let module = build(BackendKind::Trampoline);
        // pure root, effectful lifted body with one capture, clause
        assert_eq!(params(&module, "main"), 1);
        assert_eq!(params(&module, "main$h0"), 2);
        assert_eq!(params(&module, "main$c0"), 3);
    }

    #[test]
    fn test_reentries_named_after_sites() {
        let module = build(BackendKind::Trampoline);
        let reentries: Vec<_> = module
            .functions
            .iter()
            .filter(|f| f.name.starts_with("main$h0$s") || f.name.starts_with("main$c0$s"))
            .collect();
        assert!(reentries.iter().any(|f| f.name.ends_with('v')));
        for f in reentries {
            let expected = if f.name.ends_with('v') { Reentry::Value } else { Reentry::Inner };
            assert_eq!(f.params, expected.params(), "{}", f.name);
        }

        let switching = build(BackendKind::StackSwitching);
        assert!(switching.functions.iter().all(|f| !f.name.contains("$s")));
    }

    #[test]
    fn test_clause_env_layout_records_captures() {
        let module = build(BackendKind::Trampoline);
        let layout = module
            .env_layouts
            .iter()
            .find(|l| l.name == "main$c0$env")
            .expect("clause env layout");
        assert_eq!(layout.fields.len(), 1);
        assert_eq!(layout.fields[0].name, "n");
        assert_eq!(layout.fields[0].source, FieldSource::Param);
    }
}
