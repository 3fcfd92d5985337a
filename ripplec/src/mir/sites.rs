//! # Continuation Site Collection
//!
//! For every suspension point this pass records what a continuation needs
//! to re-enter the body after it:
//!
//! - the bindings live across the site, restricted to those defined at or
//!   before it, in first-definition order,
//! - the environment record layout that stores them, headed by the site's
//!   suspension order and the active handler frame,
//! - whether the site is in tail position, in which case the surrounding
//!   body has nothing left to do after it,
//! - for call sites, which arguments were evaluated before a suspension
//!   inside the argument list.

use std::collections::{BTreeSet, HashMap};

use ripple_runtime::artifact::FieldSource;

use crate::hir::Type;

use super::body::{ArgPartition, Body, BodyKind, MirProgram};
use super::types::{BlockId, BodyId, Local, Operand, SiteId, TerminatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Call,
    Perform,
    Handle,
    Resume,
}

/// Kind of body a site lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteOwner {
    Function,
    HandleBody,
    Clause,
}

impl From<BodyKind> for SiteOwner {
    fn from(kind: BodyKind) -> Self {
        match kind {
            BodyKind::Function => SiteOwner::Function,
            BodyKind::HandleBody { .. } => SiteOwner::HandleBody,
            BodyKind::Clause { .. } => SiteOwner::Clause,
        }
    }
}

/// One field of a site's environment record. `ty` is `None` for the site
/// and handler header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvField {
    pub name: String,
    pub source: FieldSource,
    pub local: Option<Local>,
    pub ty: Option<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationSite {
    pub id: SiteId,
    /// Suspension order, stored in the environment's first field.
    pub order: u32,
    pub owner: BodyId,
    pub owner_kind: SiteOwner,
    pub kind: SiteKind,
    /// Block ended by the site.
    pub block: BlockId,
    /// Block where the rest of the computation starts.
    pub target: BlockId,
    pub dest: Local,
    /// Bindings saved across the site.
    pub live: Vec<Local>,
    pub fields: Vec<EnvField>,
    pub tail: bool,
    pub args: Option<ArgPartition>,
}

/// Every site of a program, by id.
#[derive(Debug, Clone, Default)]
pub struct SiteTable {
    sites: Vec<ContinuationSite>,
    index: HashMap<SiteId, usize>,
}

impl SiteTable {
    pub fn get(&self, id: SiteId) -> Option<&ContinuationSite> {
        self.index.get(&id).map(|i| &self.sites[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContinuationSite> {
        self.sites.iter()
    }

    pub fn of_body(&self, body: BodyId) -> impl Iterator<Item = &ContinuationSite> {
        self.sites.iter().filter(move |s| s.owner == body)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

pub fn collect_sites(mir: &MirProgram) -> SiteTable {
    let mut sites: Vec<ContinuationSite> = mir.bodies.iter().flat_map(collect_body).collect();
    sites.sort_by_key(|s| s.id);
    let index = sites.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
    tracing::debug!(sites = sites.len(), "collected continuation sites");
    SiteTable { sites, index }
}

fn collect_body(body: &Body) -> Vec<ContinuationSite> {
    let reachable = body.reachable();
    let liveness = Liveness::compute(body);
    let mut out = Vec::new();

    for (id, block) in body.sites() {
        if !reachable[block.index()] {
            continue;
        }
        let term = &body.block(block).terminator.kind;
        let (kind, dest, target) = match term {
            TerminatorKind::Call { dest, target, .. } => (SiteKind::Call, *dest, *target),
            TerminatorKind::Perform { dest, target, .. } => (SiteKind::Perform, *dest, *target),
            TerminatorKind::Handle { dest, target, .. } => (SiteKind::Handle, *dest, *target),
            TerminatorKind::Resume { dest, target, .. } => (SiteKind::Resume, *dest, *target),
            _ => continue,
        };

        let defined = defined_before(body, block);
        let live: Vec<Local> = liveness.live_in[target.index()]
            .iter()
            .copied()
            .filter(|local| *local != dest && defined.contains(local))
            .collect();

        let mut fields = vec![
            EnvField { name: "site".into(), source: FieldSource::Site, local: None, ty: None },
            EnvField { name: "handler".into(), source: FieldSource::Handler, local: None, ty: None },
        ];
        for local in &live {
            let decl = &body.locals[local.index()];
            fields.push(EnvField {
                name: decl.name.clone().unwrap_or_else(|| format!("t{}", local.0)),
                source: if body.is_param(*local) { FieldSource::Param } else { FieldSource::Local },
                local: Some(*local),
                ty: Some(decl.ty.clone()),
            });
        }

        out.push(ContinuationSite {
            id,
            order: id.0,
            owner: body.id,
            owner_kind: body.kind.into(),
            kind,
            block,
            target,
            dest,
            live,
            fields,
            tail: is_tail_return(body, target, dest),
            args: body.arg_partitions.get(&id).cloned(),
        });
    }
    out
}

/// Whether `target` does nothing but return `dest`.
fn is_tail_return(body: &Body, target: BlockId, dest: Local) -> bool {
    let block = body.block(target);
    block.statements.is_empty()
        && matches!(&block.terminator.kind, TerminatorKind::Return(Operand::Copy(local)) if *local == dest)
}

/// Locals that may have been written when control reaches the end of
/// `block`'s statements: parameters, everything written by a block that
/// can reach `block`, and `block`'s own statements.
fn defined_before(body: &Body, block: BlockId) -> BTreeSet<Local> {
    let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); body.blocks.len()];
    for (i, bb) in body.blocks.iter().enumerate() {
        for succ in bb.terminator.kind.successors() {
            preds[succ.index()].push(BlockId(i as u32));
        }
    }

    let mut seen = vec![false; body.blocks.len()];
    let mut stack = preds[block.index()].clone();
    let mut defined: BTreeSet<Local> = body.params().collect();
    while let Some(b) = stack.pop() {
        if std::mem::replace(&mut seen[b.index()], true) {
            continue;
        }
        let bb = body.block(b);
        defined.extend(bb.statements.iter().map(|s| s.def()));
        defined.extend(bb.terminator.kind.def());
        stack.extend(preds[b.index()].iter().copied());
    }
    defined.extend(body.block(block).statements.iter().map(|s| s.def()));
    defined
}

/// Backward live-variable analysis over a body's blocks.
#[derive(Debug, Clone)]
pub struct Liveness {
    pub live_in: Vec<BTreeSet<Local>>,
}

impl Liveness {
    pub fn compute(body: &Body) -> Self {
        let n = body.blocks.len();
        let mut gen = vec![BTreeSet::new(); n];
        let mut kill = vec![BTreeSet::new(); n];
        for (i, bb) in body.blocks.iter().enumerate() {
            let (gen, kill) = (&mut gen[i], &mut kill[i]);
            for statement in &bb.statements {
                for used in statement.uses() {
                    if !kill.contains(&used) {
                        gen.insert(used);
                    }
                }
                kill.insert(statement.def());
            }
            for used in body.terminator_uses(BlockId(i as u32)) {
                if !kill.contains(&used) {
                    gen.insert(used);
                }
            }
            kill.extend(bb.terminator.kind.def());
        }

        let mut live_in: Vec<BTreeSet<Local>> = gen.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..n).rev() {
                let mut live: BTreeSet<Local> = BTreeSet::new();
                for succ in body.blocks[i].terminator.kind.successors() {
                    live.extend(live_in[succ.index()].iter().copied());
                }
                live.retain(|local| !kill[i].contains(local));
                live.extend(gen[i].iter().copied());
                if live != live_in[i] {
                    live_in[i] = live;
                    changed = true;
                }
            }
        }
        Self { live_in }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::intrinsics::resolve_intrinsics;
    use crate::effects::Registry;
    use crate::hir::build::*;
    use crate::hir::{EffectDecl, EffectRow, FnDecl, OpDecl, Program};
    use crate::mir::lowering::lower_program;

    fn sites_of(program: &Program) -> (MirProgram, SiteTable) {
        let mut diagnostics = Vec::new();
        let registry = Registry::from_program(program, &mut diagnostics);
        let intrinsics = resolve_intrinsics(program, &mut diagnostics);
        let mir = lower_program(program, &registry, &intrinsics, &mut diagnostics);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        let table = collect_sites(&mir);
        (mir, table)
    }

    fn program(body: crate::hir::Expr) -> Program {
        Program::new()
            .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
            .function(
                FnDecl::new("f", Type::Int)
                    .param("x", Type::Int)
                    .param("unused", Type::Str)
                    .row(EffectRow::of(&["Async"]))
                    .body(body),
            )
    }

    #[test]
    fn test_live_set_is_minimal() {
        // let y = x + 1; let z = await(y); z + x
        let (_, table) = sites_of(&program(block(vec![
            let_("y", Type::Int, add(local("x"), int(1))),
            let_("z", Type::Int, perform("Async", "await", vec![local("y")])),
            add(local("z"), local("x")),
        ])));
        assert_eq!(table.len(), 1);
        let site = table.get(SiteId(0)).unwrap();
        assert_eq!(site.kind, SiteKind::Perform);
        assert_eq!(site.live, vec![Local(0)]);
        let names: Vec<_> = site.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["site", "handler", "x"]);
        assert_eq!(site.fields[2].source, FieldSource::Param);
        assert!(!site.tail);
    }

    #[test]
    fn test_tail_site() {
        let (_, table) = sites_of(&program(perform("Async", "await", vec![local("x")])));
        let site = table.get(SiteId(0)).unwrap();
        assert!(site.tail);
        assert!(site.live.is_empty());
    }

    #[test]
    fn test_fields_follow_definition_order() {
        let (_, table) = sites_of(&program(block(vec![
            let_("b", Type::Int, int(2)),
            let_("a", Type::Int, int(1)),
            let_("r", Type::Int, perform("Async", "await", vec![int(0)])),
            add(add(local("a"), local("b")), local("r")),
        ])));
        let site = table.get(SiteId(0)).unwrap();
        let names: Vec<_> = site.fields[2..].iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_loop_carried_binding_is_live() {
        // let i = 0; while i < 3 { i = i + await(i) }; i
        let (_, table) = sites_of(&program(block(vec![
            let_("i", Type::Int, int(0)),
            while_(
                lt(local("i"), int(3)),
                assign("i", add(local("i"), perform("Async", "await", vec![local("i")]))),
            ),
            local("i"),
        ])));
        let site = table.get(SiteId(0)).unwrap();
        assert_eq!(site.live.len(), 1);
        assert_eq!(site.fields[2].name, "i");
        assert!(!site.tail);
    }

    #[test]
    fn test_defined_before_excludes_later_bindings() {
        let (mir, table) = sites_of(&program(block(vec![
            let_("r", Type::Int, perform("Async", "await", vec![int(0)])),
            let_("late", Type::Int, local("r")),
            local("late"),
        ])));
        let site = table.get(SiteId(0)).unwrap();
        let body = mir.body(site.owner);
        assert!(site.live.iter().all(|l| body.locals[l.index()].name.as_deref() != Some("late")));
        assert_eq!(site.owner_kind, SiteOwner::Function);
    }
}
