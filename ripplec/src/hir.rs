//! # Typed Input IR
//!
//! The program the backend consumes. Parsing and type checking happen in the
//! front end; what arrives here is already resolved:
//!
//! - effect declarations with the resumption kind of every operation,
//! - functions with parameter types, return type, effect row, type
//!   parameters, and the export/intrinsic attributes,
//! - expression trees whose bindings carry their declared types.
//!
//! Names are lexically scoped: `Let` introduces a binding visible to the rest
//! of the enclosing block, and an inner binding shadows an outer one.
//!
//! Programs are built with the constructor functions in [`build`] and the
//! builder-style methods on the declarations.

use std::fmt;

use ripple_runtime::abi::ResumptionKind;
use ripple_runtime::artifact::{BinOp, UnOp};
use ripple_runtime::wire::WireShape;

use crate::span::Span;

// ============================================================================
// Types
// ============================================================================

/// Value types of the source language.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Tuple(Vec<Type>),
    /// Type parameter of the enclosing generic function, by position.
    Param(u32),
    /// A captured continuation, only usable as the target of `resume`/`tail`.
    Cont,
}

impl Type {
    pub fn tuple(items: impl IntoIterator<Item = Type>) -> Type {
        Type::Tuple(items.into_iter().collect())
    }

    /// Replace type parameters with `args`. Parameters without a binding are
    /// left in place.
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::Param(i) => args.get(*i as usize).cloned().unwrap_or_else(|| self.clone()),
            Type::Tuple(items) => Type::Tuple(items.iter().map(|t| t.substitute(args)).collect()),
            other => other.clone(),
        }
    }

    pub fn has_params(&self) -> bool {
        match self {
            Type::Param(_) => true,
            Type::Tuple(items) => items.iter().any(Type::has_params),
            _ => false,
        }
    }

    /// The wire shape of a marshalable type.
    pub fn wire_shape(&self) -> Option<WireShape> {
        Some(match self {
            Type::Unit => WireShape::Unit,
            Type::Bool => WireShape::Bool,
            Type::Int => WireShape::Int,
            Type::Float => WireShape::Float,
            Type::Str => WireShape::Str,
            Type::Bytes => WireShape::Bytes,
            Type::Tuple(items) => {
                WireShape::Tuple(items.iter().map(Type::wire_shape).collect::<Option<_>>()?)
            }
            Type::Param(_) | Type::Cont => return None,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => f.write_str("unit"),
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::Float => f.write_str("float"),
            Type::Str => f.write_str("str"),
            Type::Bytes => f.write_str("bytes"),
            Type::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Type::Param(i) => write!(f, "'{}", i),
            Type::Cont => f.write_str("cont"),
        }
    }
}

// ============================================================================
// Effects
// ============================================================================

/// A declared operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub kind: ResumptionKind,
    pub span: Span,
}

impl OpDecl {
    pub fn new(name: &str, params: Vec<Type>, ret: Type, kind: ResumptionKind) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            kind,
            span: Span::dummy(),
        }
    }

    /// A `resume` operation.
    pub fn resume(name: &str, params: Vec<Type>, ret: Type) -> Self {
        Self::new(name, params, ret, ResumptionKind::Resume)
    }

    /// A `tail` operation.
    pub fn tail(name: &str, params: Vec<Type>, ret: Type) -> Self {
        Self::new(name, params, ret, ResumptionKind::Tail)
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// A declared effect. `name` is fully qualified.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDecl {
    pub name: String,
    pub operations: Vec<OpDecl>,
    pub span: Span,
}

impl EffectDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            operations: Vec::new(),
            span: Span::dummy(),
        }
    }

    pub fn op(mut self, op: OpDecl) -> Self {
        self.operations.push(op);
        self
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Reference to an operation by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpRef {
    pub effect: String,
    pub op: String,
}

impl OpRef {
    pub fn new(effect: &str, op: &str) -> Self {
        Self {
            effect: effect.to_string(),
            op: op.to_string(),
        }
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op.is_empty() {
            f.write_str(&self.effect)
        } else {
            write!(f, "{}.{}", self.effect, self.op)
        }
    }
}

/// The operations a function may perform.
///
/// An open row carries an unresolved tail variable: the function may also
/// perform whatever its polymorphic callees perform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectRow {
    pub ops: Vec<OpRef>,
    pub open: bool,
}

impl EffectRow {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A closed row from `Effect.op` strings.
    pub fn of(ops: &[&str]) -> Self {
        let ops = ops
            .iter()
            .map(|qualified| match qualified.rsplit_once('.') {
                Some((effect, op)) => OpRef::new(effect, op),
                None => OpRef::new(qualified, ""),
            })
            .collect();
        Self { ops, open: false }
    }

    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && !self.open
    }

    /// Whether `op` may be performed under this row. An entry with an empty
    /// operation name covers the whole effect.
    pub fn contains(&self, op: &OpRef) -> bool {
        self.open
            || self
                .ops
                .iter()
                .any(|r| r.effect == op.effect && (r.op.is_empty() || r.op == op.op))
    }

    /// Whether every operation of `other` may be performed under this row.
    pub fn includes(&self, other: &EffectRow) -> bool {
        (self.open || !other.open) && other.ops.iter().all(|op| self.contains(op))
    }

    /// Row concatenation.
    pub fn union(&self, other: &EffectRow) -> EffectRow {
        let mut ops = self.ops.clone();
        for op in &other.ops {
            if !ops.contains(op) {
                ops.push(op.clone());
            }
        }
        EffectRow {
            ops,
            open: self.open || other.open,
        }
    }
}

impl fmt::Display for EffectRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", op)?;
        }
        if self.open {
            f.write_str(if self.ops.is_empty() { "..e" } else { " | ..e" })?;
        }
        f.write_str("}")
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// One clause of a `handle` expression.
///
/// `params` binds the operation's arguments and `resume` binds the
/// continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub op: OpRef,
    pub params: Vec<String>,
    pub resume: String,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Lit(Literal),
    Local(String),
    /// Introduce a binding; evaluates to unit.
    Let { name: String, ty: Type, init: Box<Expr> },
    Assign { name: String, value: Box<Expr> },
    /// Evaluates its items in order; the value is the last item's, or unit.
    Block(Vec<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    If { cond: Box<Expr>, then_branch: Box<Expr>, else_branch: Option<Box<Expr>> },
    While { cond: Box<Expr>, body: Box<Expr> },
    Tuple(Vec<Expr>),
    Field { base: Box<Expr>, index: u32 },
    Call { callee: String, type_args: Vec<Type>, args: Vec<Expr> },
    Intrinsic { name: String, args: Vec<Expr> },
    Perform { op: OpRef, args: Vec<Expr> },
    /// Install handlers for `clauses` around `body`. `ty` is the type of the
    /// whole expression.
    Handle { body: Box<Expr>, ty: Type, clauses: Vec<Clause> },
    Resume { cont: String, value: Box<Expr> },
    Tail { cont: String, value: Box<Expr> },
    Return(Box<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self { kind, span: Span::dummy() }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Direct sub-expressions in evaluation order. Clause bodies of a
    /// `handle` come after its body.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Lit(_) | ExprKind::Local(_) => Vec::new(),
            ExprKind::Let { init, .. } => vec![init],
            ExprKind::Assign { value, .. } => vec![value],
            ExprKind::Block(items) | ExprKind::Tuple(items) => items.iter().collect(),
            ExprKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            ExprKind::Unary { operand, .. } => vec![operand],
            ExprKind::If { cond, then_branch, else_branch } => {
                let mut children = vec![&**cond, &**then_branch];
                children.extend(else_branch.as_deref());
                children
            }
            ExprKind::While { cond, body } => vec![cond, body],
            ExprKind::Field { base, .. } => vec![base],
            ExprKind::Call { args, .. }
            | ExprKind::Intrinsic { args, .. }
            | ExprKind::Perform { args, .. } => args.iter().collect(),
            ExprKind::Handle { body, clauses, .. } => {
                let mut children = vec![&**body];
                children.extend(clauses.iter().map(|c| &c.body));
                children
            }
            ExprKind::Resume { value, .. } | ExprKind::Tail { value, .. } => vec![value],
            ExprKind::Return(value) => vec![value],
        }
    }
}

// ============================================================================
// Program
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// A function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    /// Number of type parameters.
    pub type_params: u32,
    pub params: Vec<Param>,
    pub ret: Type,
    pub row: EffectRow,
    /// Exported to the host.
    pub export: bool,
    /// Runtime intrinsic this function provides.
    pub provides: Option<String>,
    pub body: Expr,
    pub span: Span,
}

impl FnDecl {
    pub fn new(name: &str, ret: Type) -> Self {
        Self {
            name: name.to_string(),
            type_params: 0,
            params: Vec::new(),
            ret,
            row: EffectRow::empty(),
            export: false,
            provides: None,
            body: build::unit(),
            span: Span::dummy(),
        }
    }

    pub fn param(mut self, name: &str, ty: Type) -> Self {
        self.params.push(Param { name: name.to_string(), ty });
        self
    }

    pub fn generic(mut self, type_params: u32) -> Self {
        self.type_params = type_params;
        self
    }

    pub fn row(mut self, row: EffectRow) -> Self {
        self.row = row;
        self
    }

    pub fn export(mut self) -> Self {
        self.export = true;
        self
    }

    pub fn provides(mut self, intrinsic: &str) -> Self {
        self.provides = Some(intrinsic.to_string());
        self
    }

    pub fn body(mut self, body: Expr) -> Self {
        self.body = body;
        self
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_effectful(&self) -> bool {
        !self.row.is_empty()
    }
}

/// Index of a function in [`Program::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnDefId(pub u32);

impl FnDefId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A whole typed program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub effects: Vec<EffectDecl>,
    pub functions: Vec<FnDecl>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(mut self, effect: EffectDecl) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn function(mut self, function: FnDecl) -> Self {
        self.functions.push(function);
        self
    }

    pub fn fn_by_name(&self, name: &str) -> Option<FnDefId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FnDefId(i as u32))
    }

    pub fn fn_decl(&self, id: FnDefId) -> &FnDecl {
        &self.functions[id.index()]
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Expression constructors.
pub mod build {
    use super::*;

    fn expr(kind: ExprKind) -> Expr {
        Expr::new(kind)
    }

    pub fn unit() -> Expr {
        expr(ExprKind::Lit(Literal::Unit))
    }

    pub fn int(n: i64) -> Expr {
        expr(ExprKind::Lit(Literal::Int(n)))
    }

    pub fn bool(b: bool) -> Expr {
        expr(ExprKind::Lit(Literal::Bool(b)))
    }

    pub fn float(x: f64) -> Expr {
        expr(ExprKind::Lit(Literal::Float(x)))
    }

    pub fn str(s: &str) -> Expr {
        expr(ExprKind::Lit(Literal::Str(s.to_string())))
    }

    pub fn local(name: &str) -> Expr {
        expr(ExprKind::Local(name.to_string()))
    }

    pub fn let_(name: &str, ty: Type, init: Expr) -> Expr {
        expr(ExprKind::Let { name: name.to_string(), ty, init: Box::new(init) })
    }

    pub fn assign(name: &str, value: Expr) -> Expr {
        expr(ExprKind::Assign { name: name.to_string(), value: Box::new(value) })
    }

    pub fn block(items: Vec<Expr>) -> Expr {
        expr(ExprKind::Block(items))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        expr(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        binary(BinOp::Mul, lhs, rhs)
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Expr {
        binary(BinOp::Lt, lhs, rhs)
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
        binary(BinOp::Eq, lhs, rhs)
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        expr(ExprKind::Unary { op, operand: Box::new(operand) })
    }

    pub fn if_(cond: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
        expr(ExprKind::If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Some(Box::new(else_branch)),
        })
    }

    pub fn when(cond: Expr, then_branch: Expr) -> Expr {
        expr(ExprKind::If { cond: Box::new(cond), then_branch: Box::new(then_branch), else_branch: None })
    }

    pub fn while_(cond: Expr, body: Expr) -> Expr {
        expr(ExprKind::While { cond: Box::new(cond), body: Box::new(body) })
    }

    pub fn tuple(items: Vec<Expr>) -> Expr {
        expr(ExprKind::Tuple(items))
    }

    pub fn field(base: Expr, index: u32) -> Expr {
        expr(ExprKind::Field { base: Box::new(base), index })
    }

    pub fn call(callee: &str, args: Vec<Expr>) -> Expr {
        expr(ExprKind::Call { callee: callee.to_string(), type_args: Vec::new(), args })
    }

    pub fn call_generic(callee: &str, type_args: Vec<Type>, args: Vec<Expr>) -> Expr {
        expr(ExprKind::Call { callee: callee.to_string(), type_args, args })
    }

    pub fn intrinsic(name: &str, args: Vec<Expr>) -> Expr {
        expr(ExprKind::Intrinsic { name: name.to_string(), args })
    }

    pub fn perform(effect: &str, op: &str, args: Vec<Expr>) -> Expr {
        expr(ExprKind::Perform { op: OpRef::new(effect, op), args })
    }

    pub fn handle(body: Expr, ty: Type, clauses: Vec<Clause>) -> Expr {
        expr(ExprKind::Handle { body: Box::new(body), ty, clauses })
    }

    pub fn clause(effect: &str, op: &str, params: &[&str], resume: &str, body: Expr) -> Clause {
        Clause {
            op: OpRef::new(effect, op),
            params: params.iter().map(|p| p.to_string()).collect(),
            resume: resume.to_string(),
            body,
            span: Span::dummy(),
        }
    }

    pub fn resume(cont: &str, value: Expr) -> Expr {
        expr(ExprKind::Resume { cont: cont.to_string(), value: Box::new(value) })
    }

    pub fn tail(cont: &str, value: Expr) -> Expr {
        expr(ExprKind::Tail { cont: cont.to_string(), value: Box::new(value) })
    }

    pub fn ret(value: Expr) -> Expr {
        expr(ExprKind::Return(Box::new(value)))
    }
}
