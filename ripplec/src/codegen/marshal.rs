//! Host boundary marshaling.
//!
//! Exports are reached through generated wrappers that take wire values and
//! return an encoded `EffectResult`:
//!
//! - `name_effectful(args..)` runs the export under an empty handler chain
//!   and encodes its first outcome.
//! - `resume_continuation(req, buf, len)` decodes a resumption payload against
//!   the operation's return shape and re-enters the request's continuation.
//! - `resume_effectful(req, buf, len, cap)` does the same, dispatches what the
//!   continuation produced at the root, and encodes it into at most `cap`
//!   bytes.
//!
//! Only marshalable values may cross: exported signatures and every operation
//! an export may leave pending are checked before code generation.

use ripple_runtime::abi::{effectful_entry_name, RESUME_CONTINUATION, RESUME_EFFECTFUL, WIRE_SCHEMA_SECTION};
use ripple_runtime::artifact::{Callee, Const, CustomSection, Export, Operand, Rvalue, Terminator};
use ripple_runtime::wire::{OpSchema, WireSchema, WireShape};

use crate::config::BackendKind;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::Registry;
use crate::hir::{FnDecl, FnDefId, OpRef, Program, Type};

use super::builder::FunctionBuilder;
use super::{Codegen, CodegenError};

const NULL_FRAME: Operand = Operand::Const(Const::NullFrame);

fn exports(program: &Program) -> impl Iterator<Item = (FnDefId, &FnDecl)> {
    program
        .functions
        .iter()
        .enumerate()
        .filter(|(_, decl)| decl.export)
        .map(|(index, decl)| (FnDefId(index as u32), decl))
}

/// Reserve the boundary entry points and record the exports.
pub fn declare_entries(cg: &mut Codegen<'_>) {
    for (_, decl) in exports(cg.program) {
        let params = decl.params.len() as u32;
        let entry = cg.module.declare(&effectful_entry_name(&decl.name), params);
        cg.module.export(Export {
            name: decl.name.clone(),
            entry,
            params,
        });
    }
    cg.module.declare(RESUME_CONTINUATION, 3);
    cg.module.declare(RESUME_EFFECTFUL, 4);
}

pub fn define_entries(cg: &mut Codegen<'_>) -> Result<(), CodegenError> {
    for (def, decl) in exports(cg.program) {
        let instance = cg
            .instances
            .get(def, &[])
            .ok_or_else(|| CodegenError::MissingInstance(decl.name.clone()))?;
        let target = cg.func(&instance.name)?;
        let name = effectful_entry_name(&decl.name);
        let entry = cg.func(&name)?;

        let params = decl.params.len() as u32;
        let mut fb = FunctionBuilder::new(name, params);
        let args: Vec<Operand> = (0..params).map(|i| Operand::Local(fb.param(i))).collect();

        let outcome = if !decl.is_effectful() {
            let result = fb.call_temp(Callee::Direct(target), args);
            fb.temp(Rvalue::OutcomeValue(Operand::Local(result)))
        } else {
            let mut call_args = vec![NULL_FRAME];
            call_args.extend(args);
            match cg.backend {
                BackendKind::Trampoline => fb.call_temp(Callee::Direct(target), call_args),
                BackendKind::StackSwitching => {
                    let fiber = fb.temp(Rvalue::NewFiber { func: target, args: call_args });
                    fb.call_temp(Callee::Continuation(Operand::Local(fiber)), vec![Operand::Const(Const::Unit)])
                }
            }
        };
        let bytes = fb.temp(Rvalue::EncodeResult { outcome: Operand::Local(outcome), cap: None });
        fb.terminate(Terminator::Return(Operand::Local(bytes)));
        cg.module.define(entry, fb.finish());
    }

    let resume_continuation = cg.func(RESUME_CONTINUATION)?;
    let mut fb = FunctionBuilder::new(RESUME_CONTINUATION, 3);
    let (request, buf, len) = (fb.param(0), fb.param(1), fb.param(2));
    let value = fb.temp(Rvalue::DecodeResume {
        request: Operand::Local(request),
        buf: Operand::Local(buf),
        len: Operand::Local(len),
    });
    let outcome = fb.call_temp(Callee::Resume(Operand::Local(request)), vec![Operand::Local(value)]);
    fb.terminate(Terminator::Return(Operand::Local(outcome)));
    cg.module.define(resume_continuation, fb.finish());

    let resume_effectful = cg.func(RESUME_EFFECTFUL)?;
    let mut fb = FunctionBuilder::new(RESUME_EFFECTFUL, 4);
    let forwarded: Vec<Operand> = (0..3).map(|i| Operand::Local(fb.param(i))).collect();
    let cap = fb.param(3);
    let mut outcome = fb.call_temp(Callee::Direct(resume_continuation), forwarded);
    if cg.backend == BackendKind::Trampoline {
        outcome = fb.call_temp(
            Callee::Direct(cg.runtime.dispatch),
            vec![Operand::Local(outcome), NULL_FRAME, NULL_FRAME],
        );
    }
    let bytes = fb.temp(Rvalue::EncodeResult {
        outcome: Operand::Local(outcome),
        cap: Some(Operand::Local(cap)),
    });
    fb.terminate(Terminator::Return(Operand::Local(bytes)));
    cg.module.define(resume_effectful, fb.finish());
    Ok(())
}

/// Wire shapes of every registered operation, in `OpIndex` order.
///
/// Operations that can never reach the host still need an entry so indices
/// line up with the effect table; they are described as unit.
pub fn schema_section(registry: &Registry) -> CustomSection {
    let shape = |ty: &Type| ty.wire_shape().unwrap_or(WireShape::Unit);
    let schema = WireSchema {
        ops: registry
            .operations()
            .iter()
            .map(|op| OpSchema {
                params: op.params.iter().map(shape).collect(),
                ret: shape(&op.ret),
            })
            .collect(),
    };
    CustomSection {
        name: WIRE_SCHEMA_SECTION.to_string(),
        bytes: schema.encode(),
    }
}

/// Report exported signatures and escaping operations that cannot be
/// marshaled.
pub fn check_boundary(program: &Program, registry: &Registry, diagnostics: &mut Vec<Diagnostic>) {
    for (_, decl) in exports(program) {
        if decl.type_params > 0 {
            diagnostics.push(
                Diagnostic::coded(
                    ErrorCode::HostBoundaryPayloadViolation,
                    format!("exported function `{}` is generic", decl.name),
                    decl.span,
                )
                .with_suggestion("export a non-generic wrapper that fixes the type arguments"),
            );
            continue;
        }

        for param in &decl.params {
            if param.ty.wire_shape().is_none() {
                diagnostics.push(
                    Diagnostic::coded(
                        ErrorCode::HostBoundaryPayloadViolation,
                        format!(
                            "parameter `{}` of exported function `{}` has type `{}`, which cannot cross the host boundary",
                            param.name, decl.name, param.ty
                        ),
                        decl.span,
                    )
                    .with_primary_label(decl.span, "exported here"),
                );
            }
        }
        if decl.ret.wire_shape().is_none() {
            diagnostics.push(Diagnostic::coded(
                ErrorCode::HostBoundaryPayloadViolation,
                format!(
                    "exported function `{}` returns `{}`, which cannot cross the host boundary",
                    decl.name, decl.ret
                ),
                decl.span,
            ));
        }

        for op in registry.operations() {
            if !decl.row.contains(&OpRef::new(&op.effect_name, &op.name)) {
                continue;
            }
            let bad = op
                .params
                .iter()
                .chain(std::iter::once(&op.ret))
                .find(|ty| ty.wire_shape().is_none());
            if let Some(ty) = bad {
                diagnostics.push(
                    Diagnostic::coded(
                        ErrorCode::HostBoundaryPayloadViolation,
                        format!(
                            "`{}` may reach the host from exported function `{}`, but its signature mentions `{}`",
                            op.qualified_name(),
                            decl.name,
                            ty
                        ),
                        decl.span,
                    )
                    .with_note(op.span, "operation declared here"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::build::*;
    use crate::hir::{EffectDecl, EffectRow, OpDecl};

    fn codes(program: &Program) -> Vec<ErrorCode> {
        let mut diagnostics = Vec::new();
        let registry = Registry::from_program(program, &mut diagnostics);
        check_boundary(program, &registry, &mut diagnostics);
        diagnostics.iter().filter_map(|d| d.code).collect()
    }

    #[test]
    fn test_marshalable_export_passes() {
        let program = Program::new()
            .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Str)))
            .function(
                FnDecl::new("main", Type::tuple([Type::Int, Type::Str]))
                    .param("n", Type::Int)
                    .row(EffectRow::of(&["Async"]))
                    .export()
                    .body(tuple(vec![local("n"), perform("Async", "await", vec![local("n")])])),
            );
        assert!(codes(&program).is_empty());
    }

    #[test]
    fn test_continuation_in_escaping_operation() {
        let program = Program::new()
            .effect(EffectDecl::new("Sched").op(OpDecl::resume("spawn", vec![Type::Cont], Type::Unit)))
            .function(
                FnDecl::new("main", Type::Unit)
                    .row(EffectRow::of(&["Sched"]))
                    .export()
                    .body(unit()),
            );
        assert_eq!(codes(&program), [ErrorCode::HostBoundaryPayloadViolation]);
    }

    #[test]
    fn test_open_row_exposes_every_operation() {
        let program = Program::new()
            .effect(EffectDecl::new("Sched").op(OpDecl::resume("spawn", vec![Type::Cont], Type::Unit)))
            .function(FnDecl::new("main", Type::Unit).row(EffectRow::empty().open()).export().body(unit()));
        assert_eq!(codes(&program), [ErrorCode::HostBoundaryPayloadViolation]);
    }

    #[test]
    fn test_generic_and_unmarshalable_signatures() {
        let program = Program::new()
            .function(FnDecl::new("id", Type::Param(0)).generic(1).param("x", Type::Param(0)).export().body(local("x")))
            .function(FnDecl::new("k", Type::Cont).param("c", Type::Cont).export().body(local("c")));
        assert_eq!(codes(&program), [ErrorCode::HostBoundaryPayloadViolation; 3]);
    }

    #[test]
    fn test_schema_covers_every_operation() {
        let program = Program::new()
            .effect(
                EffectDecl::new("Io")
                    .op(OpDecl::resume("read", vec![Type::Int], Type::Bytes))
                    .op(OpDecl::resume("fork", vec![Type::Cont], Type::Unit)),
            );
        let mut diagnostics = Vec::new();
        let registry = Registry::from_program(&program, &mut diagnostics);
        let section = schema_section(&registry);
        assert_eq!(section.name, WIRE_SCHEMA_SECTION);
        let schema = WireSchema::parse(&section.bytes).unwrap();
        assert_eq!(schema.ops.len(), 2);
        assert_eq!(schema.ops[0].params, [WireShape::Int]);
        assert_eq!(schema.ops[0].ret, WireShape::Bytes);
        assert_eq!(schema.ops[1].params, [WireShape::Unit]);
    }
}
