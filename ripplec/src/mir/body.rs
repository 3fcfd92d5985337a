//! MIR bodies.
//!
//! A source function lowers to one body. Each `handle` expression lifts two
//! more bodies out of its owner: the handle body, whose parameters are the
//! captured bindings, and one clause body shared by all of the handler's
//! clauses, whose parameters are the captures followed by the continuation.

use std::collections::HashMap;

use ripple_runtime::abi::{EffectId, OpId, OpIndex};

use crate::hir::{FnDefId, Type};
use crate::span::Span;

use super::types::{BasicBlock, BlockId, BodyId, Local, SiteId, Statement, Terminator, TerminatorKind};

/// What a body was lowered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// A source function.
    Function,
    /// The body of a `handle` expression.
    HandleBody { parent: BodyId },
    /// The clauses of a `handle` expression.
    Clause { parent: BodyId },
}

impl BodyKind {
    pub fn is_lifted(self) -> bool {
        !matches!(self, BodyKind::Function)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    /// Source name; `None` for temporaries.
    pub name: Option<String>,
    pub ty: Type,
}

/// A `handle` expression of the owning body.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerInfo {
    pub body: BodyId,
    pub clause: BodyId,
    /// Operations the clauses handle, in clause order.
    pub ops: Vec<(EffectId, OpId)>,
    pub op_indices: Vec<OpIndex>,
    /// Owner locals passed as the lifted bodies' leading parameters.
    pub captures: Vec<Local>,
}

/// Which call arguments are evaluated before a nested suspension inside
/// the argument list and must survive it, and which are evaluated after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgPartition {
    pub captured: Vec<usize>,
    pub fresh: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub id: BodyId,
    pub name: String,
    pub kind: BodyKind,
    /// The source function this body belongs to.
    pub root: FnDefId,
    /// Type parameters of the root function.
    pub type_params: u32,
    pub locals: Vec<LocalDecl>,
    pub param_count: u32,
    pub ret: Type,
    /// Whether the body may suspend, i.e. returns outcomes under the
    /// trampoline backend.
    pub effectful: bool,
    pub blocks: Vec<BasicBlock>,
    pub handlers: Vec<HandlerInfo>,
    pub arg_partitions: HashMap<SiteId, ArgPartition>,
    pub span: Span,
}

impl Body {
    pub fn new(id: BodyId, name: String, kind: BodyKind, root: FnDefId, ret: Type, span: Span) -> Self {
        Self {
            id,
            name,
            kind,
            root,
            type_params: 0,
            locals: Vec::new(),
            param_count: 0,
            ret,
            effectful: false,
            blocks: vec![BasicBlock::new()],
            handlers: Vec::new(),
            arg_partitions: HashMap::new(),
            span,
        }
    }

    pub fn new_local(&mut self, name: Option<String>, ty: Type) -> Local {
        let local = Local(self.locals.len() as u32);
        self.locals.push(LocalDecl { name, ty });
        local
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new());
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn push_statement(&mut self, block: BlockId, statement: Statement) {
        self.blocks[block.index()].statements.push(statement);
    }

    pub fn terminate(&mut self, block: BlockId, kind: TerminatorKind, span: Span) {
        self.blocks[block.index()].terminator = Terminator { kind, span };
    }

    pub fn local_ty(&self, local: Local) -> &Type {
        &self.locals[local.index()].ty
    }

    pub fn params(&self) -> impl Iterator<Item = Local> {
        (0..self.param_count).map(Local)
    }

    pub fn is_param(&self, local: Local) -> bool {
        local.0 < self.param_count
    }

    /// Locals read by the terminator of `block`, including the captures of
    /// a handle site.
    pub fn terminator_uses(&self, block: BlockId) -> Vec<Local> {
        let kind = &self.block(block).terminator.kind;
        match kind {
            TerminatorKind::Handle { handler, .. } => self
                .handlers
                .get(*handler as usize)
                .map(|h| h.captures.clone())
                .unwrap_or_default(),
            _ => kind.uses(),
        }
    }

    /// Suspension sites in block order.
    pub fn sites(&self) -> Vec<(SiteId, BlockId)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.terminator.kind.site().map(|s| (s, BlockId(i as u32))))
            .collect()
    }

    /// Blocks reachable from the entry.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![BlockId::ENTRY];
        while let Some(block) = stack.pop() {
            if std::mem::replace(&mut seen[block.index()], true) {
                continue;
            }
            stack.extend(self.block(block).terminator.kind.successors());
        }
        seen
    }
}

/// Whole lowered program.
#[derive(Debug, Clone, Default)]
pub struct MirProgram {
    pub bodies: Vec<Body>,
    /// Body of each source function, by `FnDefId`.
    pub fn_bodies: Vec<BodyId>,
    pub site_count: u32,
}

impl MirProgram {
    pub fn body(&self, id: BodyId) -> &Body {
        &self.bodies[id.index()]
    }

    pub fn fn_body(&self, def: FnDefId) -> &Body {
        self.body(self.fn_bodies[def.index()])
    }

    /// The function body and every body lifted out of it, in creation order.
    pub fn bodies_of(&self, root: FnDefId) -> impl Iterator<Item = &Body> {
        self.bodies.iter().filter(move |b| b.root == root)
    }
}
