//! Handler clause analysis.
//!
//! Checks every `handle` clause of the program before lowering:
//!
//! - the clause names a registered operation (E0440),
//! - a clause of a `tail` operation resumes on every path (E0411) and only
//!   from tail position (E0412),
//! - the continuation is only used as the target of `resume`/`tail`, and only
//!   inside the clause that bound it (E0410),
//! - `resume`/`tail` name a continuation that is in scope (E0414).
//!
//! It also counts how often each clause may resume, which decides whether
//! the stack-switching backend can be used: a suspended fiber can be
//! re-entered only once.

use std::cmp;
use std::ops::Add;

use ripple_runtime::abi::{OpIndex, ResumptionKind};

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::registry::Registry;
use crate::hir::{Clause, Expr, ExprKind, Program};
use crate::span::Span;

/// Upper bound on the number of resumptions along one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResumeCount {
    Zero,
    One,
    Many,
}

impl Add for ResumeCount {
    type Output = ResumeCount;

    fn add(self, other: ResumeCount) -> ResumeCount {
        match (self, other) {
            (ResumeCount::Zero, x) | (x, ResumeCount::Zero) => x,
            _ => ResumeCount::Many,
        }
    }
}

/// What the analysis learned about one clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseSummary {
    pub function: String,
    pub op_index: OpIndex,
    pub kind: ResumptionKind,
    pub max_resumes: ResumeCount,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClauseAnalysis {
    pub clauses: Vec<ClauseSummary>,
}

impl ClauseAnalysis {
    /// Whether any clause may resume its continuation more than once.
    pub fn has_multi_shot(&self) -> bool {
        self.clauses.iter().any(|c| c.max_resumes == ResumeCount::Many)
    }
}

/// Analyze every clause in `program`.
pub fn analyze_program(program: &Program, registry: &Registry, diagnostics: &mut Vec<Diagnostic>) -> ClauseAnalysis {
    let mut walker = Walker {
        registry,
        diagnostics,
        conts: Vec::new(),
        next_extent: 1,
        function: String::new(),
        analysis: ClauseAnalysis::default(),
    };
    for function in &program.functions {
        walker.function = function.name.clone();
        walker.walk(&function.body, 0);
    }
    tracing::debug!(
        clauses = walker.analysis.clauses.len(),
        multi_shot = walker.analysis.has_multi_shot(),
        "clause analysis finished"
    );
    walker.analysis
}

struct ContScope {
    name: String,
    extent: u32,
}

struct Walker<'a> {
    registry: &'a Registry,
    diagnostics: &'a mut Vec<Diagnostic>,
    /// Continuations bound by enclosing clauses, innermost last.
    conts: Vec<ContScope>,
    next_extent: u32,
    function: String,
    analysis: ClauseAnalysis,
}

impl Walker<'_> {
    /// `extent` identifies the lifted body `expr` will end up in.
    fn walk(&mut self, expr: &Expr, extent: u32) {
        match &expr.kind {
            ExprKind::Local(name) => {
                if self.find(name).is_some() {
                    self.diagnostics.push(
                        Diagnostic::coded(
                            ErrorCode::EscapedResume,
                            format!("continuation `{}` is used as a value", name),
                            expr.span,
                        )
                        .with_primary_label(expr.span, "captured continuation escapes here"),
                    );
                }
            }
            ExprKind::Resume { cont, value } | ExprKind::Tail { cont, value } => {
                self.check_cont_use(cont, extent, expr.span);
                self.walk(value, extent);
            }
            ExprKind::Handle { body, clauses, .. } => {
                let body_extent = self.fresh_extent();
                self.walk(body, body_extent);
                for clause in clauses {
                    self.walk_clause(clause);
                }
            }
            _ => {
                for child in expr.children() {
                    self.walk(child, extent);
                }
            }
        }
    }

    fn walk_clause(&mut self, clause: &Clause) {
        let Some(op) = self.registry.resolve(&clause.op, None) else {
            self.diagnostics.push(Diagnostic::coded(
                ErrorCode::UnknownOperation,
                format!("handler clause for unknown operation `{}`", clause.op),
                clause.span,
            ));
            return;
        };
        let (op_index, kind) = (op.op_index, op.kind);

        let extent = self.fresh_extent();
        self.conts.push(ContScope { name: clause.resume.clone(), extent });
        self.walk(&clause.body, extent);
        self.conts.pop();

        if kind == ResumptionKind::Tail {
            if !always_resumes(&clause.body, &clause.resume) {
                self.diagnostics.push(
                    Diagnostic::coded(
                        ErrorCode::MissingTailResumption,
                        format!("clause for tail operation `{}` does not resume on every path", clause.op),
                        clause.span,
                    )
                    .with_primary_label(clause.body.span, "some path ends without `tail`"),
                );
            }
            self.check_tail_positions(&clause.body, &clause.resume, true);
        }

        self.analysis.clauses.push(ClauseSummary {
            function: self.function.clone(),
            op_index,
            kind,
            max_resumes: count_resumes(&clause.body, &clause.resume),
            span: clause.span,
        });
    }

    fn check_cont_use(&mut self, name: &str, extent: u32, span: Span) {
        match self.find(name) {
            None => self.diagnostics.push(Diagnostic::coded(
                ErrorCode::ResumeOutsideClause,
                format!("`{}` is not a continuation bound by an enclosing handler clause", name),
                span,
            )),
            Some(scope) if scope.extent != extent => self.diagnostics.push(
                Diagnostic::coded(
                    ErrorCode::EscapedResume,
                    format!("continuation `{}` is resumed outside the clause that captured it", name),
                    span,
                )
                .with_primary_label(span, "resumed from a nested handler here"),
            ),
            Some(_) => {}
        }
    }

    /// Report `resume` of a tail operation's continuation outside tail
    /// position.
    fn check_tail_positions(&mut self, expr: &Expr, cont: &str, in_tail: bool) {
        match &expr.kind {
            ExprKind::Resume { cont: name, value } => {
                if name == cont && !in_tail {
                    self.diagnostics.push(
                        Diagnostic::coded(
                            ErrorCode::NonTailResumption,
                            format!("continuation `{}` of a tail operation is resumed outside tail position", cont),
                            expr.span,
                        )
                        .with_suggestion("make the resumption the last thing the clause does, or use `tail`"),
                    );
                }
                self.check_tail_positions(value, cont, false);
            }
            ExprKind::Block(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_tail_positions(item, cont, in_tail && i + 1 == items.len());
                }
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                self.check_tail_positions(cond, cont, false);
                self.check_tail_positions(then_branch, cont, in_tail);
                if let Some(else_branch) = else_branch {
                    self.check_tail_positions(else_branch, cont, in_tail);
                }
            }
            ExprKind::Return(value) => self.check_tail_positions(value, cont, true),
            ExprKind::Handle { .. } => {}
            _ => {
                for child in expr.children() {
                    self.check_tail_positions(child, cont, false);
                }
            }
        }
    }

    fn find(&self, name: &str) -> Option<&ContScope> {
        self.conts.iter().rev().find(|scope| scope.name == name)
    }

    fn fresh_extent(&mut self) -> u32 {
        let extent = self.next_extent;
        self.next_extent += 1;
        extent
    }
}

fn resumes_cont(expr: &Expr, cont: &str) -> bool {
    matches!(&expr.kind, ExprKind::Resume { cont: name, .. } | ExprKind::Tail { cont: name, .. } if name == cont)
}

/// Whether every path through `expr` resumes `cont`.
pub fn always_resumes(expr: &Expr, cont: &str) -> bool {
    if resumes_cont(expr, cont) {
        return true;
    }
    match &expr.kind {
        ExprKind::Block(items) => {
            for item in items {
                if always_resumes(item, cont) {
                    return true;
                }
                if matches!(item.kind, ExprKind::Return(_)) {
                    return false;
                }
            }
            false
        }
        ExprKind::If { cond, then_branch, else_branch } => {
            always_resumes(cond, cont)
                || (always_resumes(then_branch, cont)
                    && else_branch.as_ref().is_some_and(|e| always_resumes(e, cont)))
        }
        ExprKind::While { cond, .. } => always_resumes(cond, cont),
        // Handlers run their bodies in a separate extent.
        ExprKind::Handle { .. } => false,
        _ => expr.children().into_iter().any(|child| always_resumes(child, cont)),
    }
}

/// Upper bound on how many times `cont` is resumed along any path.
pub fn count_resumes(expr: &Expr, cont: &str) -> ResumeCount {
    let own = if resumes_cont(expr, cont) { ResumeCount::One } else { ResumeCount::Zero };
    let nested = match &expr.kind {
        ExprKind::If { cond, then_branch, else_branch } => {
            let else_count = else_branch
                .as_ref()
                .map_or(ResumeCount::Zero, |e| count_resumes(e, cont));
            count_resumes(cond, cont) + cmp::max(count_resumes(then_branch, cont), else_count)
        }
        ExprKind::While { cond, body } => {
            let per_iteration = count_resumes(cond, cont) + count_resumes(body, cont);
            if per_iteration == ResumeCount::Zero {
                ResumeCount::Zero
            } else {
                ResumeCount::Many
            }
        }
        ExprKind::Handle { .. } => ResumeCount::Zero,
        _ => expr
            .children()
            .into_iter()
            .fold(ResumeCount::Zero, |acc, child| acc + count_resumes(child, cont)),
    };
    own + nested
}
