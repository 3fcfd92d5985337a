//! Compilation driver.
//!
//! Runs the passes in order and stops at the first stage that reports an
//! error:
//!
//! ```text
//! Program ─► registry ─► clause checks ─► intrinsics ─► boundary check
//!         ─► MIR lowering ─► site collection ─► instances
//!         ─► backend selection ─► codegen ─► Module
//! ```

use ripple_runtime::artifact::Module;

use crate::codegen::{self, intrinsics, marshal, CodegenInput, CodegenStats};
use crate::config::{BackendKind, CompilerConfig};
use crate::diagnostics::{has_errors, Diagnostic};
use crate::effects::{analyze_program, Registry};
use crate::hir::Program;
use crate::mir::{collect_sites, lower_program, Instances};

/// Result of a compilation.
#[derive(Debug)]
pub struct CompileOutput {
    /// The artifact; `None` when any error was reported.
    pub module: Option<Module>,
    pub diagnostics: Vec<Diagnostic>,
    /// The backend actually used, after fallback.
    pub backend: BackendKind,
    pub stats: CodegenStats,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn compile(&self, program: &Program) -> CompileOutput {
        let _span = tracing::info_span!("compile", functions = program.functions.len()).entered();
        let mut diagnostics = Vec::new();
        let fail = |diagnostics: Vec<Diagnostic>, backend: BackendKind| CompileOutput {
            module: None,
            diagnostics,
            backend,
            stats: CodegenStats::default(),
        };

        let registry = Registry::from_program(program, &mut diagnostics);
        let analysis = analyze_program(program, &registry, &mut diagnostics);
        let intrinsics = intrinsics::resolve_intrinsics(program, &mut diagnostics);
        marshal::check_boundary(program, &registry, &mut diagnostics);
        if has_errors(&diagnostics) {
            return fail(diagnostics, self.config.backend.kind);
        }

        let mir = lower_program(program, &registry, &intrinsics, &mut diagnostics);
        if has_errors(&diagnostics) {
            return fail(diagnostics, self.config.backend.kind);
        }
        let sites = collect_sites(&mir);
        let instances = Instances::collect(program, &mir);
        tracing::debug!(
            bodies = mir.bodies.len(),
            sites = sites.len(),
            instances = instances.len(),
            "lowered to MIR"
        );

        let backend = codegen::select_backend(&self.config, &analysis, &mut diagnostics);
        if has_errors(&diagnostics) {
            return fail(diagnostics, backend);
        }

        let input = CodegenInput {
            program,
            registry: &registry,
            mir: &mir,
            sites: &sites,
            instances: &instances,
        };
        match codegen::generate(input, backend, self.config.artifact.emit_effect_table) {
            Ok((module, stats)) => CompileOutput {
                module: Some(module),
                diagnostics,
                backend,
                stats,
            },
            Err(err) => {
                tracing::error!(error = %err, "code generation failed");
                diagnostics.push(err.to_diagnostic());
                fail(diagnostics, backend)
            }
        }
    }
}

/// Compile `program` with `config`.
pub fn compile(program: &Program, config: &CompilerConfig) -> CompileOutput {
    Compiler::new(config.clone()).compile(program)
}
