//! # Core MIR Types
//!
//! ```text
//! Body
//! └── BasicBlock
//!     ├── Vec<Statement>        Assign | Call (effect-free callee)
//!     └── Terminator
//!         ├── Goto | Branch | SwitchOp | Return | Unreachable
//!         └── suspension points: Call | Perform | Handle | Resume | TailResume
//! ```
//!
//! Every point where control may suspend ends a block. The rest of the
//! computation after a suspension is therefore always "the target block",
//! which is what makes re-entry a jump.

use std::fmt;

use ripple_runtime::abi::OpIndex;
use ripple_runtime::artifact::{BinOp, UnOp};
use ripple_runtime::builtins::Builtin;

use crate::hir::{FnDefId, Type};
use crate::span::Span;

/// A local slot of one body. Parameters come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(pub u32);

impl Local {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Program-wide identity of a suspension point. Ids are handed out in
/// lowering order, which is the site's suspension order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Index of a body in the lowered program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub u32);

impl BodyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Copy(Local),
    Const(Constant),
}

impl Operand {
    pub fn unit() -> Self {
        Operand::Const(Constant::Unit)
    }

    pub fn local(&self) -> Option<Local> {
        match self {
            Operand::Copy(local) => Some(*local),
            Operand::Const(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rvalue {
    Use(Operand),
    Binary(BinOp, Operand, Operand),
    Unary(UnOp, Operand),
    Tuple(Vec<Operand>),
    Field(Operand, u32),
    Builtin(Builtin, Vec<Operand>),
    /// Argument of the request bound to a clause continuation.
    RequestArg(Local, u32),
}

impl Rvalue {
    fn uses(&self, out: &mut Vec<Local>) {
        match self {
            Rvalue::Use(op) | Rvalue::Unary(_, op) | Rvalue::Field(op, _) => out.extend(op.local()),
            Rvalue::Binary(_, lhs, rhs) => {
                out.extend(lhs.local());
                out.extend(rhs.local());
            }
            Rvalue::Tuple(ops) | Rvalue::Builtin(_, ops) => out.extend(ops.iter().filter_map(Operand::local)),
            Rvalue::RequestArg(local, _) => out.push(*local),
        }
    }
}

/// Callee of a call, before monomorphization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnRef {
    pub def: FnDefId,
    pub type_args: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Assign(Local, Rvalue),
    /// Call of a function with an empty effect row.
    Call { dest: Local, callee: FnRef, args: Vec<Operand> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

impl Statement {
    pub fn uses(&self) -> Vec<Local> {
        let mut out = Vec::new();
        match &self.kind {
            StatementKind::Assign(_, rvalue) => rvalue.uses(&mut out),
            StatementKind::Call { args, .. } => out.extend(args.iter().filter_map(Operand::local)),
        }
        out
    }

    pub fn def(&self) -> Local {
        match &self.kind {
            StatementKind::Assign(dest, _) | StatementKind::Call { dest, .. } => *dest,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminatorKind {
    Goto(BlockId),
    Branch { cond: Operand, then_block: BlockId, else_block: BlockId },
    /// Dispatch on the operation of the request bound to `request`. A
    /// request matching no target traps.
    SwitchOp { request: Local, targets: Vec<(OpIndex, BlockId)> },
    Return(Operand),
    Unreachable,

    /// Call of an effectful function.
    Call { site: SiteId, dest: Local, callee: FnRef, args: Vec<Operand>, target: BlockId },
    Perform { site: SiteId, dest: Local, op: OpIndex, args: Vec<Operand>, target: BlockId },
    /// Run the handle body of `handler` under its clauses.
    Handle { site: SiteId, dest: Local, handler: u32, target: BlockId },
    /// Non-tail resumption; `dest` receives the rest of the handled
    /// computation's result.
    Resume { site: SiteId, dest: Local, cont: Local, value: Operand, target: BlockId },
    /// Resumption in tail position; its result is the clause's result.
    TailResume { cont: Local, value: Operand },
}

impl TerminatorKind {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            TerminatorKind::Goto(target)
            | TerminatorKind::Call { target, .. }
            | TerminatorKind::Perform { target, .. }
            | TerminatorKind::Handle { target, .. }
            | TerminatorKind::Resume { target, .. } => vec![*target],
            TerminatorKind::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            TerminatorKind::SwitchOp { targets, .. } => targets.iter().map(|(_, b)| *b).collect(),
            TerminatorKind::Return(_) | TerminatorKind::Unreachable | TerminatorKind::TailResume { .. } => {
                Vec::new()
            }
        }
    }

    pub fn site(&self) -> Option<SiteId> {
        match self {
            TerminatorKind::Call { site, .. }
            | TerminatorKind::Perform { site, .. }
            | TerminatorKind::Handle { site, .. }
            | TerminatorKind::Resume { site, .. } => Some(*site),
            _ => None,
        }
    }

    /// Local written when control reaches the target block.
    pub fn def(&self) -> Option<Local> {
        match self {
            TerminatorKind::Call { dest, .. }
            | TerminatorKind::Perform { dest, .. }
            | TerminatorKind::Handle { dest, .. }
            | TerminatorKind::Resume { dest, .. } => Some(*dest),
            _ => None,
        }
    }

    /// Locals read by the terminator. Handle sites also read their handler's
    /// captures, which the body reports separately.
    pub fn uses(&self) -> Vec<Local> {
        match self {
            TerminatorKind::Branch { cond, .. } | TerminatorKind::Return(cond) => cond.local().into_iter().collect(),
            TerminatorKind::SwitchOp { request, .. } => vec![*request],
            TerminatorKind::Call { args, .. } | TerminatorKind::Perform { args, .. } => {
                args.iter().filter_map(Operand::local).collect()
            }
            TerminatorKind::Resume { cont, value, .. } | TerminatorKind::TailResume { cont, value } => {
                let mut uses = vec![*cont];
                uses.extend(value.local());
                uses
            }
            TerminatorKind::Goto(_) | TerminatorKind::Unreachable | TerminatorKind::Handle { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Terminator {
    pub kind: TerminatorKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub statements: Vec<Statement>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new() -> Self {
        Self {
            statements: Vec::new(),
            terminator: Terminator {
                kind: TerminatorKind::Unreachable,
                span: Span::dummy(),
            },
        }
    }
}

impl Default for BasicBlock {
    fn default() -> Self {
        Self::new()
    }
}
