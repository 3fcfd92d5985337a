//! # HIR to MIR Lowering
//!
//! Flattens expression trees into per-body control flow graphs in
//! A-normal form:
//!
//! - nested expressions become statements over temporaries,
//! - `if` and `while` become explicit CFG edges,
//! - every suspension point (effectful call, `perform`, `handle`, `resume`)
//!   ends its block, and the rest of the computation starts at its target,
//! - `handle` expressions are lambda-lifted into a handle body and a clause
//!   body that receive the bindings they use as leading parameters.
//!
//! ```text
//! // source
//! fn f(x: int) -> int / {Async} { let y = x + 1; perform Async.await(y) + x }
//!
//! // MIR
//! bb0:
//!     _1 = Add(_0, const 1)
//!     _2 = perform Async.await(_1) -> bb1     [s0]
//! bb1:
//!     _3 = Add(_2, _0)
//!     return _3
//! ```
//!
//! Captures are by value. An assignment inside a handle body or clause to a
//! binding of the enclosing function updates the lifted copy only, and
//! `return` inside either returns from the lifted body, which makes its
//! value the value of the `handle` expression.

use ripple_runtime::abi::ResumptionKind;
use ripple_runtime::artifact::{BinOp, UnOp};

use crate::codegen::intrinsics::{shape_type, IntrinsicMap, IntrinsicTarget};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::{OperationInfo, Registry};
use crate::hir::{Clause, EffectRow, Expr, ExprKind, FnDefId, Literal, OpRef, Program, Type};
use crate::span::Span;

use super::body::{ArgPartition, Body, BodyKind, HandlerInfo, MirProgram};
use super::types::{
    BlockId, BodyId, Constant, FnRef, Local, Operand, Rvalue, SiteId, Statement, StatementKind, TerminatorKind,
};

/// Lower every function of `program`.
pub fn lower_program(
    program: &Program,
    registry: &Registry,
    intrinsics: &IntrinsicMap,
    diagnostics: &mut Vec<Diagnostic>,
) -> MirProgram {
    let mut cx = ProgramLowering {
        program,
        registry,
        intrinsics,
        diagnostics,
        bodies: Vec::new(),
        next_site: 0,
    };

    let mut fn_bodies = Vec::with_capacity(program.functions.len());
    for (index, decl) in program.functions.iter().enumerate() {
        let def = FnDefId(index as u32);
        let id = cx.reserve_body();
        let mut body = Body::new(id, decl.name.clone(), BodyKind::Function, def, decl.ret.clone(), decl.span);
        body.type_params = decl.type_params;
        body.effectful = decl.is_effectful();

        let mut lowering = BodyLowering::new(&mut cx, body, decl.row.clone());
        let params: Vec<(String, Type)> = decl.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect();
        lowering.bind_params(&params);
        lowering.lower_root(&decl.body);
        let body = lowering.finish();
        cx.bodies[id.index()] = body;
        fn_bodies.push(id);
    }

    tracing::debug!(bodies = cx.bodies.len(), sites = cx.next_site, "lowered program to MIR");
    MirProgram {
        bodies: cx.bodies,
        fn_bodies,
        site_count: cx.next_site,
    }
}

struct ProgramLowering<'a> {
    program: &'a Program,
    registry: &'a Registry,
    intrinsics: &'a IntrinsicMap,
    diagnostics: &'a mut Vec<Diagnostic>,
    bodies: Vec<Body>,
    next_site: u32,
}

impl ProgramLowering<'_> {
    /// Reserve a body slot so that ids follow creation order.
    fn reserve_body(&mut self) -> BodyId {
        let id = BodyId(self.bodies.len() as u32);
        self.bodies.push(Body::new(
            id,
            String::new(),
            BodyKind::Function,
            FnDefId(0),
            Type::Unit,
            Span::dummy(),
        ));
        id
    }

    fn next_site(&mut self) -> SiteId {
        let site = SiteId(self.next_site);
        self.next_site += 1;
        site
    }

    fn error(&mut self, code: ErrorCode, message: String, span: Span) {
        self.diagnostics.push(Diagnostic::coded(code, message, span));
    }
}

/// A continuation bound by a clause.
struct ContBinding {
    name: String,
    local: Local,
    /// Type of the handled computation's result.
    result: Type,
    kind: ResumptionKind,
}

struct BodyLowering<'p, 'a> {
    cx: &'p mut ProgramLowering<'a>,
    body: Body,
    scopes: Vec<Vec<(String, Local)>>,
    conts: Vec<ContBinding>,
    /// Operations this body may perform.
    row: EffectRow,
    current: BlockId,
}

impl<'p, 'a> BodyLowering<'p, 'a> {
    fn new(cx: &'p mut ProgramLowering<'a>, body: Body, row: EffectRow) -> Self {
        Self {
            cx,
            body,
            scopes: vec![Vec::new()],
            conts: Vec::new(),
            row,
            current: BlockId::ENTRY,
        }
    }

    fn bind_params(&mut self, params: &[(String, Type)]) {
        for (name, ty) in params {
            let local = self.body.new_local(Some(name.clone()), ty.clone());
            self.bind(name, local);
        }
        self.body.param_count = params.len() as u32;
    }

    fn lower_root(&mut self, expr: &Expr) {
        let (value, _) = self.lower_expr(expr);
        self.terminate(TerminatorKind::Return(value), expr.span);
    }

    fn finish(self) -> Body {
        self.body
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn bind(&mut self, name: &str, local: Local) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), local));
        }
    }

    fn lookup(&self, name: &str) -> Option<Local> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, local)| *local)
    }

    fn push(&mut self, kind: StatementKind, span: Span) {
        self.body.push_statement(self.current, Statement { kind, span });
    }

    fn temp(&mut self, ty: Type, rvalue: Rvalue, span: Span) -> Operand {
        let local = self.body.new_local(None, ty);
        self.push(StatementKind::Assign(local, rvalue), span);
        Operand::Copy(local)
    }

    fn terminate(&mut self, kind: TerminatorKind, span: Span) {
        self.body.terminate(self.current, kind, span);
    }

    /// End the current block with a terminator that does not fall through.
    /// Code after it lands in a fresh unreachable block.
    fn diverge(&mut self, kind: TerminatorKind, span: Span) -> (Operand, Type) {
        self.terminate(kind, span);
        self.current = self.body.new_block();
        (Operand::unit(), Type::Unit)
    }

    /// End the current block at a suspension point built by `make`, which
    /// receives the site and the continuation block.
    fn suspend(&mut self, span: Span, make: impl FnOnce(SiteId, BlockId) -> TerminatorKind) -> SiteId {
        let site = self.cx.next_site();
        let target = self.body.new_block();
        let kind = make(site, target);
        self.terminate(kind, span);
        self.current = target;
        site
    }

    fn local_type(&self, local: Local) -> Type {
        self.body.local_ty(local).clone()
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> (Operand, Type) {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Lit(lit) => lower_literal(lit),
            ExprKind::Local(name) => match self.lookup(name) {
                Some(local) => (Operand::Copy(local), self.local_type(local)),
                None => {
                    self.cx.error(ErrorCode::UnknownLocal, format!("unknown local `{}`", name), span);
                    (Operand::unit(), Type::Unit)
                }
            },
            ExprKind::Let { name, ty, init } => {
                let (value, _) = self.lower_expr(init);
                let local = self.body.new_local(Some(name.clone()), ty.clone());
                self.push(StatementKind::Assign(local, Rvalue::Use(value)), span);
                self.bind(name, local);
                (Operand::unit(), Type::Unit)
            }
            ExprKind::Assign { name, value } => {
                let (value, _) = self.lower_expr(value);
                match self.lookup(name) {
                    Some(local) => self.push(StatementKind::Assign(local, Rvalue::Use(value)), span),
                    None => self
                        .cx
                        .error(ErrorCode::UnknownLocal, format!("assignment to unknown local `{}`", name), span),
                }
                (Operand::unit(), Type::Unit)
            }
            ExprKind::Block(items) => {
                self.scopes.push(Vec::new());
                let mut result = (Operand::unit(), Type::Unit);
                for item in items {
                    result = self.lower_expr(item);
                }
                self.scopes.pop();
                result
            }
            ExprKind::Binary { op: op @ (BinOp::And | BinOp::Or), lhs, rhs } => {
                self.lower_short_circuit(*op, lhs, rhs, span)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let (ops, types, _) = self.lower_operands(&[lhs.as_ref(), rhs.as_ref()]);
                let ty = match op {
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Type::Bool,
                    _ => types[0].clone(),
                };
                let value = self.temp(ty.clone(), Rvalue::Binary(*op, ops[0].clone(), ops[1].clone()), span);
                (value, ty)
            }
            ExprKind::Unary { op, operand } => {
                let (value, ty) = self.lower_expr(operand);
                let ty = if *op == UnOp::Not { Type::Bool } else { ty };
                let value = self.temp(ty.clone(), Rvalue::Unary(*op, value), span);
                (value, ty)
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                self.lower_if(cond, then_branch, else_branch.as_deref(), span)
            }
            ExprKind::While { cond, body } => {
                let header = self.body.new_block();
                self.terminate(TerminatorKind::Goto(header), span);
                self.current = header;
                let (cond, _) = self.lower_expr(cond);
                let body_block = self.body.new_block();
                let exit = self.body.new_block();
                self.terminate(
                    TerminatorKind::Branch { cond, then_block: body_block, else_block: exit },
                    span,
                );
                self.current = body_block;
                self.lower_expr(body);
                self.terminate(TerminatorKind::Goto(header), span);
                self.current = exit;
                (Operand::unit(), Type::Unit)
            }
            ExprKind::Tuple(items) => {
                let refs: Vec<&Expr> = items.iter().collect();
                let (ops, types, _) = self.lower_operands(&refs);
                let ty = Type::Tuple(types);
                let value = self.temp(ty.clone(), Rvalue::Tuple(ops), span);
                (value, ty)
            }
            ExprKind::Field { base, index } => {
                let (value, ty) = self.lower_expr(base);
                let field_ty = match &ty {
                    Type::Tuple(items) if (*index as usize) < items.len() => items[*index as usize].clone(),
                    other => {
                        self.cx.error(
                            ErrorCode::TypeMismatch,
                            format!("no field {} on a value of type `{}`", index, other),
                            span,
                        );
                        Type::Unit
                    }
                };
                let value = self.temp(field_ty.clone(), Rvalue::Field(value, *index), span);
                (value, field_ty)
            }
            ExprKind::Call { callee, type_args, args } => {
                let Some(def) = self.cx.program.fn_by_name(callee) else {
                    self.cx
                        .error(ErrorCode::UnknownFunction, format!("call to unknown function `{}`", callee), span);
                    return (Operand::unit(), Type::Unit);
                };
                self.lower_call(def, type_args.clone(), args, span)
            }
            ExprKind::Intrinsic { name, args } => match self.cx.intrinsics.get(name) {
                Some(IntrinsicTarget::Builtin(builtin)) => {
                    let refs: Vec<&Expr> = args.iter().collect();
                    let (ops, _, _) = self.lower_operands(&refs);
                    let ty = shape_type(&builtin.signature().1);
                    let value = self.temp(ty.clone(), Rvalue::Builtin(builtin, ops), span);
                    (value, ty)
                }
                Some(IntrinsicTarget::Function(def)) => self.lower_call(def, Vec::new(), args, span),
                // Reported during intrinsic resolution.
                None => (Operand::unit(), Type::Unit),
            },
            ExprKind::Perform { op, args } => self.lower_perform(op, args, span),
            ExprKind::Handle { body, ty, clauses } => self.lower_handle(body, ty, clauses, span),
            ExprKind::Resume { cont, value } => self.lower_resume(cont, value, false, span),
            ExprKind::Tail { cont, value } => self.lower_resume(cont, value, true, span),
            ExprKind::Return(value) => {
                let (value, _) = self.lower_expr(value);
                self.diverge(TerminatorKind::Return(value), span)
            }
        }
    }

    /// Lower sibling operands left to right. An operand read from a named
    /// binding is copied into a temporary when a later sibling assigns, so
    /// that it keeps the value it had when it was evaluated. Also reports
    /// which operands contained a suspension point.
    fn lower_operands(&mut self, exprs: &[&Expr]) -> (Vec<Operand>, Vec<Type>, Vec<bool>) {
        let mut ops = Vec::with_capacity(exprs.len());
        let mut types = Vec::with_capacity(exprs.len());
        let mut suspended = Vec::with_capacity(exprs.len());
        for (i, expr) in exprs.iter().enumerate() {
            let before = self.cx.next_site;
            let (mut op, ty) = self.lower_expr(expr);
            suspended.push(self.cx.next_site != before);
            if let Operand::Copy(local) = op {
                let named = self.body.locals[local.index()].name.is_some();
                if named && exprs[i + 1..].iter().any(|e| contains_assign(e)) {
                    op = self.temp(ty.clone(), Rvalue::Use(op), expr.span);
                }
            }
            ops.push(op);
            types.push(ty);
        }
        (ops, types, suspended)
    }

    fn lower_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span) -> (Operand, Type) {
        let (lhs, _) = self.lower_expr(lhs);
        let rhs_block = self.body.new_block();
        let short_block = self.body.new_block();
        let join = self.body.new_block();
        let (then_block, else_block) = match op {
            BinOp::And => (rhs_block, short_block),
            _ => (short_block, rhs_block),
        };
        self.terminate(TerminatorKind::Branch { cond: lhs, then_block, else_block }, span);

        self.current = rhs_block;
        let (rhs, _) = self.lower_expr(rhs);
        let rhs_end = self.current;

        let result = self.body.new_local(None, Type::Bool);
        self.body.push_statement(
            rhs_end,
            Statement { kind: StatementKind::Assign(result, Rvalue::Use(rhs)), span },
        );
        self.body.terminate(rhs_end, TerminatorKind::Goto(join), span);

        let short = Operand::Const(Constant::Bool(op == BinOp::Or));
        self.body.push_statement(
            short_block,
            Statement { kind: StatementKind::Assign(result, Rvalue::Use(short)), span },
        );
        self.body.terminate(short_block, TerminatorKind::Goto(join), span);

        self.current = join;
        (Operand::Copy(result), Type::Bool)
    }

    fn lower_if(&mut self, cond: &Expr, then_branch: &Expr, else_branch: Option<&Expr>, span: Span) -> (Operand, Type) {
        let (cond, _) = self.lower_expr(cond);
        let then_block = self.body.new_block();
        let else_block = self.body.new_block();
        let join = self.body.new_block();
        self.terminate(TerminatorKind::Branch { cond, then_block, else_block }, span);

        self.current = then_block;
        let (then_value, ty) = self.lower_expr(then_branch);
        let then_end = self.current;

        self.current = else_block;
        let (else_value, _) = match else_branch {
            Some(expr) => self.lower_expr(expr),
            None => (Operand::unit(), Type::Unit),
        };
        let else_end = self.current;

        let ty = if else_branch.is_some() { ty } else { Type::Unit };
        let result = self.body.new_local(None, ty.clone());
        for (end, value) in [(then_end, then_value), (else_end, else_value)] {
            self.body.push_statement(
                end,
                Statement { kind: StatementKind::Assign(result, Rvalue::Use(value)), span },
            );
            self.body.terminate(end, TerminatorKind::Goto(join), span);
        }
        self.current = join;
        (Operand::Copy(result), ty)
    }

    fn lower_call(&mut self, def: FnDefId, type_args: Vec<Type>, args: &[Expr], span: Span) -> (Operand, Type) {
        let program = self.cx.program;
        let decl = program.fn_decl(def);
        if decl.params.len() != args.len() {
            self.cx.error(
                ErrorCode::TypeMismatch,
                format!("`{}` takes {} arguments but {} were given", decl.name, decl.params.len(), args.len()),
                span,
            );
            return (Operand::unit(), Type::Unit);
        }
        let ret = decl.ret.substitute(&type_args);
        let effectful = decl.is_effectful();
        let callee_row = self.cx.registry.expand_row(&decl.row);
        let callee_name = decl.name.clone();

        let refs: Vec<&Expr> = args.iter().collect();
        let (ops, _, suspended) = self.lower_operands(&refs);
        let callee = FnRef { def, type_args };
        let dest = self.body.new_local(None, ret.clone());

        if !effectful {
            self.push(StatementKind::Call { dest, callee, args: ops }, span);
            return (Operand::Copy(dest), ret);
        }

        if !self.row.includes(&callee_row) {
            self.cx.diagnostics.push(
                Diagnostic::coded(
                    ErrorCode::EffectNotInRow,
                    format!("call to `{}` performs {} which the context {} does not allow", callee_name, callee_row, self.row),
                    span,
                )
                .with_suggestion("handle the effect or add it to the enclosing function's row"),
            );
        }
        let site = self.suspend(span, |site, target| TerminatorKind::Call { site, dest, callee, args: ops, target });
        self.body.arg_partitions.insert(site, partition(&suspended));
        (Operand::Copy(dest), ret)
    }

    fn lower_perform(&mut self, op: &OpRef, args: &[Expr], span: Span) -> (Operand, Type) {
        let refs: Vec<&Expr> = args.iter().collect();
        let (ops, types, suspended) = self.lower_operands(&refs);
        let registry = self.cx.registry;
        let Some(info) = registry.resolve(op, Some(&types)) else {
            self.cx
                .error(ErrorCode::UnknownOperation, format!("perform of unknown operation `{}`", op), span);
            return (Operand::unit(), Type::Unit);
        };
        let (op_index, ret, qualified) =
            (info.op_index, info.ret.clone(), OpRef::new(&info.effect_name, &info.name));

        if !self.row.contains(&qualified) {
            self.cx.diagnostics.push(
                Diagnostic::coded(
                    ErrorCode::EffectNotInRow,
                    format!("`{}` is not permitted by the effect row {}", qualified, self.row),
                    span,
                )
                .with_suggestion("handle the effect or add it to the enclosing function's row"),
            );
        }

        let dest = self.body.new_local(None, ret.clone());
        let site = self.suspend(span, |site, target| TerminatorKind::Perform {
            site,
            dest,
            op: op_index,
            args: ops,
            target,
        });
        self.body.arg_partitions.insert(site, partition(&suspended));
        (Operand::Copy(dest), ret)
    }

    fn lower_resume(&mut self, cont: &str, value: &Expr, tail: bool, span: Span) -> (Operand, Type) {
        let (value, _) = self.lower_expr(value);
        let Some(binding) = self.conts.iter().rev().find(|c| c.name == cont) else {
            // Reported by clause analysis, which runs before lowering.
            self.cx.error(ErrorCode::Internal, format!("unbound continuation `{}` reached lowering", cont), span);
            return (Operand::unit(), Type::Unit);
        };
        let (k, result, kind) = (binding.local, binding.result.clone(), binding.kind);

        if tail || kind == ResumptionKind::Tail {
            return self.diverge(TerminatorKind::TailResume { cont: k, value }, span);
        }
        let dest = self.body.new_local(None, result.clone());
        self.suspend(span, |site, target| TerminatorKind::Resume { site, dest, cont: k, value, target });
        (Operand::Copy(dest), result)
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn lower_handle(&mut self, body: &Expr, ty: &Type, clauses: &[Clause], span: Span) -> (Operand, Type) {
        let captures = self.captures_of(body, clauses);
        let capture_params: Vec<(String, Type)> = captures
            .iter()
            .map(|(name, local)| (name.clone(), self.local_type(*local)))
            .collect();

        let resolved: Vec<Option<OperationInfo>> = clauses
            .iter()
            .map(|clause| self.cx.registry.resolve(&clause.op, None).cloned())
            .collect();
        let handled = EffectRow {
            ops: resolved
                .iter()
                .flatten()
                .map(|info| OpRef::new(&info.effect_name, &info.name))
                .collect(),
            open: false,
        };

        let index = self.body.handlers.len();
        let parent = self.body.id;
        let root = self.body.root;
        let type_params = self.body.type_params;

        // Handle body.
        let body_id = self.cx.reserve_body();
        let mut lifted = Body::new(
            body_id,
            format!("{}$h{}", self.body.name, index),
            BodyKind::HandleBody { parent },
            root,
            ty.clone(),
            body.span,
        );
        lifted.type_params = type_params;
        lifted.effectful = true;
        let mut lowering = BodyLowering::new(self.cx, lifted, self.row.union(&handled));
        lowering.bind_params(&capture_params);
        lowering.lower_root(body);
        let lifted = lowering.finish();
        self.cx.bodies[body_id.index()] = lifted;

        // Clause body.
        let clause_id = self.cx.reserve_body();
        let mut lifted = Body::new(
            clause_id,
            format!("{}$c{}", self.body.name, index),
            BodyKind::Clause { parent },
            root,
            ty.clone(),
            span,
        );
        lifted.type_params = type_params;
        lifted.effectful = true;
        let mut lowering = BodyLowering::new(self.cx, lifted, self.row.clone());
        let mut params = capture_params.clone();
        params.push(("$k".to_string(), Type::Cont));
        lowering.bind_params(&params);
        let k = Local(capture_params.len() as u32);
        let mut targets = Vec::new();
        for (clause, info) in clauses.iter().zip(&resolved) {
            // Unknown clause operations are reported by clause analysis.
            let Some(info) = info else { continue };
            let block = lowering.body.new_block();
            targets.push((info.op_index, block));
            lowering.current = block;
            lowering.lower_clause(clause, info, k, ty);
        }
        lowering.body.terminate(BlockId::ENTRY, TerminatorKind::SwitchOp { request: k, targets }, span);
        let lifted = lowering.finish();
        self.cx.bodies[clause_id.index()] = lifted;

        self.body.handlers.push(HandlerInfo {
            body: body_id,
            clause: clause_id,
            ops: resolved.iter().flatten().map(|info| (info.effect_id, info.op_id)).collect(),
            op_indices: resolved.iter().flatten().map(|info| info.op_index).collect(),
            captures: captures.iter().map(|(_, local)| *local).collect(),
        });

        let dest = self.body.new_local(None, ty.clone());
        let handler = index as u32;
        self.suspend(span, |site, target| TerminatorKind::Handle { site, dest, handler, target });
        (Operand::Copy(dest), ty.clone())
    }

    fn lower_clause(&mut self, clause: &Clause, info: &OperationInfo, k: Local, result: &Type) {
        self.scopes.push(Vec::new());
        for (i, name) in clause.params.iter().enumerate() {
            let ty = info.params.get(i).cloned().unwrap_or(Type::Unit);
            let local = self.body.new_local(Some(name.clone()), ty);
            self.push(StatementKind::Assign(local, Rvalue::RequestArg(k, i as u32)), clause.span);
            self.bind(name, local);
        }
        self.conts.push(ContBinding {
            name: clause.resume.clone(),
            local: k,
            result: result.clone(),
            kind: info.kind,
        });
        let (value, _) = self.lower_expr(&clause.body);
        self.terminate(TerminatorKind::Return(value), clause.span);
        self.conts.pop();
        self.scopes.pop();
    }

    /// Bindings of this body used inside a `handle` expression's body or
    /// clauses, in order of first use.
    fn captures_of(&self, body: &Expr, clauses: &[Clause]) -> Vec<(String, Local)> {
        let mut names = Vec::new();
        free_names(body, &mut Vec::new(), &mut names);
        for clause in clauses {
            let mut bound: Vec<String> = clause.params.clone();
            free_names(&clause.body, &mut bound, &mut names);
        }
        names
            .into_iter()
            .filter_map(|name| self.lookup(&name).map(|local| (name, local)))
            .collect()
    }
}

fn lower_literal(lit: &Literal) -> (Operand, Type) {
    let (constant, ty) = match lit {
        Literal::Unit => (Constant::Unit, Type::Unit),
        Literal::Bool(b) => (Constant::Bool(*b), Type::Bool),
        Literal::Int(n) => (Constant::Int(*n), Type::Int),
        Literal::Float(x) => (Constant::Float(*x), Type::Float),
        Literal::Str(s) => (Constant::Str(s.clone()), Type::Str),
    };
    (Operand::Const(constant), ty)
}

fn partition(suspended: &[bool]) -> ArgPartition {
    match suspended.iter().rposition(|s| *s) {
        Some(last) => ArgPartition {
            captured: (0..last).collect(),
            fresh: (last..suspended.len()).collect(),
        },
        None => ArgPartition {
            captured: Vec::new(),
            fresh: (0..suspended.len()).collect(),
        },
    }
}

fn contains_assign(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::Assign { .. }) || expr.children().into_iter().any(contains_assign)
}

/// Names referenced by `expr` that it does not bind itself.
fn free_names(expr: &Expr, bound: &mut Vec<String>, out: &mut Vec<String>) {
    fn note(name: &String, bound: &[String], out: &mut Vec<String>) {
        if !bound.contains(name) && !out.contains(name) {
            out.push(name.clone());
        }
    }
    match &expr.kind {
        ExprKind::Local(name) => note(name, bound, out),
        ExprKind::Assign { name, value } => {
            free_names(value, bound, out);
            note(name, bound, out);
        }
        ExprKind::Let { name, init, .. } => {
            free_names(init, bound, out);
            bound.push(name.clone());
        }
        ExprKind::Block(items) => {
            let mark = bound.len();
            for item in items {
                free_names(item, bound, out);
            }
            bound.truncate(mark);
        }
        ExprKind::Handle { body, clauses, .. } => {
            free_names(body, bound, out);
            for clause in clauses {
                let mark = bound.len();
                bound.extend(clause.params.iter().cloned());
                free_names(&clause.body, bound, out);
                bound.truncate(mark);
            }
        }
        _ => {
            for child in expr.children() {
                free_names(child, bound, out);
            }
        }
    }
}
