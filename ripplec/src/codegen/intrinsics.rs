//! Codegen dependency resolution.
//!
//! An intrinsic call names a runtime facility rather than a function. The
//! name is satisfied either by a runtime [`Builtin`] or by a program function
//! declared to provide it. Exactly one provider must exist for every name
//! the program uses.

use std::collections::BTreeMap;

use ripple_runtime::builtins::Builtin;
use ripple_runtime::wire::WireShape;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{Expr, ExprKind, FnDefId, Program, Type};
use crate::span::Span;

/// What an intrinsic name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicTarget {
    Builtin(Builtin),
    Function(FnDefId),
}

/// Resolved providers, keyed by intrinsic name.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicMap {
    targets: BTreeMap<String, IntrinsicTarget>,
}

impl IntrinsicMap {
    pub fn get(&self, name: &str) -> Option<IntrinsicTarget> {
        self.targets.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Resolve every intrinsic used by `program`.
pub fn resolve_intrinsics(program: &Program, diagnostics: &mut Vec<Diagnostic>) -> IntrinsicMap {
    let mut used: BTreeMap<String, Span> = BTreeMap::new();
    for function in &program.functions {
        collect_uses(&function.body, &mut used);
    }

    let mut map = IntrinsicMap::default();
    for (name, span) in used {
        let mut providers: Vec<(IntrinsicTarget, Span)> = Vec::new();
        if let Some(builtin) = Builtin::from_name(&name) {
            providers.push((IntrinsicTarget::Builtin(builtin), Span::dummy()));
        }
        for (index, function) in program.functions.iter().enumerate() {
            if function.provides.as_deref() == Some(name.as_str()) {
                providers.push((IntrinsicTarget::Function(FnDefId(index as u32)), function.span));
            }
        }

        match providers.as_slice() {
            [] => diagnostics.push(Diagnostic::coded(
                ErrorCode::MissingCodegenDependency,
                format!("no provider for intrinsic `{}`", name),
                span,
            )),
            [(target, _)] => {
                map.targets.insert(name, *target);
            }
            _ => {
                let mut diag = Diagnostic::coded(
                    ErrorCode::AmbiguousCodegenDependency,
                    format!("intrinsic `{}` has {} providers", name, providers.len()),
                    span,
                );
                for (target, provider_span) in &providers {
                    let what = match target {
                        IntrinsicTarget::Builtin(_) => "provided by the runtime".to_string(),
                        IntrinsicTarget::Function(def) => {
                            format!("provided by `{}`", program.fn_decl(*def).name)
                        }
                    };
                    diag = diag.with_note(*provider_span, what);
                }
                diagnostics.push(diag);
            }
        }
    }
    tracing::debug!(resolved = map.len(), "intrinsics resolved");
    map
}

fn collect_uses(expr: &Expr, used: &mut BTreeMap<String, Span>) {
    if let ExprKind::Intrinsic { name, .. } = &expr.kind {
        used.entry(name.clone()).or_insert(expr.span);
    }
    for child in expr.children() {
        collect_uses(child, used);
    }
}

/// Source type of a builtin's wire shape.
pub fn shape_type(shape: &WireShape) -> Type {
    match shape {
        WireShape::Unit => Type::Unit,
        WireShape::Bool => Type::Bool,
        WireShape::Int => Type::Int,
        WireShape::Float => Type::Float,
        WireShape::Str => Type::Str,
        WireShape::Bytes => Type::Bytes,
        WireShape::Tuple(items) => Type::Tuple(items.iter().map(shape_type).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::build::*;
    use crate::hir::FnDecl;

    fn program_using(name: &str) -> Program {
        Program::new().function(FnDecl::new("main", Type::Int).body(intrinsic(name, vec![int(1)])))
    }

    #[test]
    fn test_builtin_resolves() {
        let mut diagnostics = Vec::new();
        let map = resolve_intrinsics(&program_using("int.abs"), &mut diagnostics);
        assert!(diagnostics.is_empty());
        assert_eq!(map.get("int.abs"), Some(IntrinsicTarget::Builtin(Builtin::IntAbs)));
    }

    #[test]
    fn test_missing_provider() {
        let mut diagnostics = Vec::new();
        let map = resolve_intrinsics(&program_using("gc.collect"), &mut diagnostics);
        assert!(map.is_empty());
        assert_eq!(diagnostics[0].code, Some(ErrorCode::MissingCodegenDependency));
    }

    #[test]
    fn test_function_provider() {
        let program = program_using("gc.collect")
            .function(FnDecl::new("collect", Type::Int).param("n", Type::Int).provides("gc.collect"));
        let mut diagnostics = Vec::new();
        let map = resolve_intrinsics(&program, &mut diagnostics);
        assert!(diagnostics.is_empty());
        assert_eq!(map.get("gc.collect"), Some(IntrinsicTarget::Function(FnDefId(1))));
    }

    #[test]
    fn test_ambiguous_provider() {
        let program = program_using("int.abs")
            .function(FnDecl::new("my_abs", Type::Int).param("n", Type::Int).provides("int.abs"));
        let mut diagnostics = Vec::new();
        resolve_intrinsics(&program, &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, Some(ErrorCode::AmbiguousCodegenDependency));
    }

    #[test]
    fn test_shape_type() {
        let (_, ret) = Builtin::IntToString.signature();
        assert_eq!(shape_type(&ret), Type::Str);
    }
}
