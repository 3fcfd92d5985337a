//! # Code Generation
//!
//! Lowers MIR to the target artifact through one of two backends that share
//! a single [`LoweringStrategy`] seam:
//!
//! - **Trampoline** ([`trampoline`]): every effectful function returns an
//!   outcome. A suspension returns an effect outcome whose request carries a
//!   continuation built from a synthesized re-entry function and an
//!   environment record holding the bindings live across the site.
//! - **Stack switching** ([`stack_switch`]): effectful code runs in direct
//!   style inside fibers; a `perform` suspends the current fiber and the
//!   handler resumes it.
//!
//! Handler dispatch is the same on both: `handle` pushes a frame, runs the
//! body, and feeds its outcome to a generated dispatcher ([`dispatch`]) that
//! matches requests against the frame and forwards the rest outward.
//!
//! Backend selection happens once per build. When stack switching is
//! requested but the target lacks it or some clause resumes more than once,
//! the whole module falls back to the trampoline, or the build fails with
//! `E0450` when fallback is disabled.

pub mod builder;
pub mod dispatch;
pub mod function;
pub mod intrinsics;
pub mod marshal;
pub mod stack_switch;
pub mod trampoline;

use ripple_runtime::abi::ResumptionKind;
use ripple_runtime::artifact::{EnvLayoutId, FuncId, Module, Operand};
use thiserror::Error;

use crate::config::{BackendKind, CompilerConfig};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::{table, ClauseAnalysis, OperationInfo, Registry, ResumeCount};
use crate::hir::Program;
use crate::mir::{Body, ContinuationSite, HandlerInfo, Instances, MirProgram, SiteId, SiteKind, SiteSpecializer, SiteTable};
use crate::span::Span;

use builder::ModuleBuilder;
use function::{body_params, body_symbol, reentry_symbol, BodyCx, EntryMode};

pub use function::Reentry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("function `{0}` was referenced but never declared")]
    MissingFunction(String),

    #[error("no instance of `{0}` for the requested type arguments")]
    MissingInstance(String),

    #[error("site {0} has no continuation record")]
    MissingSite(SiteId),

    #[error("operation #{0} is not registered")]
    UnknownOperation(u32),

    #[error("functions declared but never defined: {0}")]
    Undefined(String),

    #[error("effect table could not be built: {0}")]
    Table(String),
}

impl CodegenError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::coded(ErrorCode::Internal, self.to_string(), Span::dummy())
    }
}

/// Functions and layouts every generated module carries.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFns {
    /// `(outcome, from, stop)` dispatcher.
    pub dispatch: FuncId,
    /// Continuation wrapper that re-dispatches after a resumption.
    pub handled_resume: FuncId,
    /// `{from, stop}` environment of `handled_resume`.
    pub dispatch_layout: EnvLayoutId,
}

/// How suspension points become artifact code.
///
/// Each `lower_*` hook is called with the builder positioned in the block
/// that ends at the site. It must either leave control in the site's target
/// block with the site's destination assigned, or return from the function.
pub trait LoweringStrategy {
    fn kind(&self) -> BackendKind;

    /// Re-entry functions the site needs. `perform_kind` is set for
    /// `perform` sites.
    fn reentries(&self, site: &ContinuationSite, body: &Body, perform_kind: Option<ResumptionKind>) -> Vec<Reentry>;

    fn lower_return(&self, cx: &mut BodyCx<'_, '_>, value: Operand);

    fn lower_call(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        callee: FuncId,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError>;

    fn lower_perform(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        op: &OperationInfo,
        args: Vec<Operand>,
    ) -> Result<(), CodegenError>;

    fn lower_handle(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        handler: &HandlerInfo,
    ) -> Result<(), CodegenError>;

    fn lower_resume(
        &self,
        cx: &mut BodyCx<'_, '_>,
        site: &ContinuationSite,
        cont: Operand,
        value: Operand,
    ) -> Result<(), CodegenError>;

    fn lower_tail_resume(&self, cx: &mut BodyCx<'_, '_>, cont: Operand, value: Operand);
}

/// Shared state of one code generation run.
pub struct Codegen<'m> {
    pub program: &'m Program,
    pub registry: &'m Registry,
    pub mir: &'m MirProgram,
    pub sites: &'m SiteTable,
    pub instances: &'m Instances,
    pub specializer: SiteSpecializer,
    pub module: ModuleBuilder,
    pub runtime: RuntimeFns,
    pub backend: BackendKind,
}

impl Codegen<'_> {
    pub fn func(&self, name: &str) -> Result<FuncId, CodegenError> {
        self.module
            .func(name)
            .ok_or_else(|| CodegenError::MissingFunction(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodegenStats {
    pub functions: usize,
    pub reentries: usize,
    pub layouts: usize,
    pub layout_hits: usize,
    pub instances: usize,
}

pub struct CodegenInput<'m> {
    pub program: &'m Program,
    pub registry: &'m Registry,
    pub mir: &'m MirProgram,
    pub sites: &'m SiteTable,
    pub instances: &'m Instances,
}

/// Choose the backend for a whole build.
pub fn select_backend(config: &CompilerConfig, analysis: &ClauseAnalysis, diagnostics: &mut Vec<Diagnostic>) -> BackendKind {
    if config.backend.kind == BackendKind::Trampoline {
        return BackendKind::Trampoline;
    }

    let mut blockers = Vec::new();
    if !config.stack_switching_available() {
        blockers.push("the target does not support stack switching".to_string());
    }
    if let Some(clause) = analysis.clauses.iter().find(|c| c.max_resumes == ResumeCount::Many) {
        blockers.push(format!(
            "a clause in `{}` may resume its continuation more than once",
            clause.function
        ));
    }
    if blockers.is_empty() {
        return BackendKind::StackSwitching;
    }

    if config.backend.fallback {
        tracing::warn!(reasons = ?blockers, "stack switching unavailable, falling back to the trampoline backend");
        return BackendKind::Trampoline;
    }
    let mut diag = Diagnostic::coded(
        ErrorCode::StackSwitchingUnavailable,
        "the stack switching backend was requested but cannot be used",
        Span::dummy(),
    );
    for blocker in blockers {
        diag = diag.with_suggestion(blocker);
    }
    diagnostics.push(diag);
    BackendKind::StackSwitching
}

/// Generate the artifact for `input` with `backend`.
pub fn generate(
    input: CodegenInput<'_>,
    backend: BackendKind,
    emit_effect_table: bool,
) -> Result<(Module, CodegenStats), CodegenError> {
    let trampoline = trampoline::Trampoline;
    let stack_switch = stack_switch::StackSwitch;
    let strategy: &dyn LoweringStrategy = match backend {
        BackendKind::Trampoline => &trampoline,
        BackendKind::StackSwitching => &stack_switch,
    };
    let _span = tracing::info_span!("codegen", backend = %backend).entered();

    let mut module = ModuleBuilder::new();
    let runtime = dispatch::declare(&mut module, backend);
    let mut cg = Codegen {
        program: input.program,
        registry: input.registry,
        mir: input.mir,
        sites: input.sites,
        instances: input.instances,
        specializer: SiteSpecializer::new(),
        module,
        runtime,
        backend,
    };

    // Declare everything first so bodies can reference any function.
    let (program, mir, sites, instances) = (cg.program, cg.mir, cg.sites, cg.instances);
    let mut work = Vec::new();
    let mut stats = CodegenStats { instances: instances.len(), ..Default::default() };
    for instance in instances.iter() {
        for body in mir.bodies_of(instance.def) {
            let symbol = body_symbol(program, instance, body);
            cg.module.declare(&symbol, body_params(body));
            work.push((instance, body, EntryMode::Normal));
            if !body.effectful {
                continue;
            }
            for site in sites.of_body(body.id) {
                let kind = perform_kind(&cg, body, site)?;
                for variant in strategy.reentries(site, body, kind) {
                    cg.module.declare(&reentry_symbol(&symbol, site, variant), variant.params());
                    work.push((instance, body, EntryMode::Reentry(site.id, variant)));
                    stats.reentries += 1;
                }
            }
        }
    }
    marshal::declare_entries(&mut cg);

    dispatch::define(&mut cg)?;
    for (instance, body, mode) in work {
        let (id, function) = function::lower_body(&mut cg, strategy, instance, body, mode)?;
        cg.module.define(id, function);
        stats.functions += 1;
    }
    marshal::define_entries(&mut cg)?;

    if emit_effect_table {
        let section = table::emit_section(cg.registry).map_err(|err| CodegenError::Table(err.to_string()))?;
        cg.module.section(section);
    }
    cg.module.section(marshal::schema_section(cg.registry));

    let undefined = cg.module.undefined();
    if !undefined.is_empty() {
        return Err(CodegenError::Undefined(undefined.join(", ")));
    }

    stats.layouts = cg.specializer.len();
    stats.layout_hits = cg.specializer.hits();
    let module = cg.module.finish();
    tracing::info!(
        functions = module.functions.len(),
        layouts = module.env_layouts.len(),
        instructions = module.inst_count(),
        "generated module"
    );
    Ok((module, stats))
}

fn perform_kind(cg: &Codegen<'_>, body: &Body, site: &ContinuationSite) -> Result<Option<ResumptionKind>, CodegenError> {
    if site.kind != SiteKind::Perform {
        return Ok(None);
    }
    match &body.block(site.block).terminator.kind {
        crate::mir::TerminatorKind::Perform { op, .. } => cg
            .registry
            .by_index(*op)
            .map(|info| Some(info.kind))
            .ok_or(CodegenError::UnknownOperation(op.0)),
        _ => Err(CodegenError::MissingSite(site.id)),
    }
}
