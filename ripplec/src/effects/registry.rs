//! Effect & operation registry.
//!
//! The canonical table of every declared effect and operation. Effects are
//! keyed by their content-hash [`EffectId`]; operations by `(EffectId, OpId)`.
//! Every operation also receives an [`OpIndex`] in whole-program declaration
//! order, which is the row index of the emitted effect table and the wire
//! schema.

use std::collections::HashMap;

use thiserror::Error;

use ripple_runtime::abi::{canonical_signature, signature_hash, EffectId, OpId, OpIndex, ResumptionKind};

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{EffectRow, OpDecl, OpRef, Program, Type};
use crate::span::Span;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("effect `{name}` is declared more than once")]
    DuplicateEffect { name: String },

    #[error("operation `{effect}.{signature}` is declared more than once")]
    DuplicateOperation { effect: String, signature: String },

    #[error("no effect with id {0} is registered")]
    UnknownEffect(EffectId),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::DuplicateEffect { .. } => ErrorCode::DuplicateEffect,
            RegistryError::DuplicateOperation { .. } => ErrorCode::DuplicateOperation,
            RegistryError::UnknownEffect(_) => ErrorCode::UnknownOperation,
        }
    }

    pub fn to_diagnostic(&self, span: Span) -> Diagnostic {
        Diagnostic::coded(self.code(), self.to_string(), span)
    }
}

/// A registered effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectInfo {
    pub id: EffectId,
    pub name: String,
    /// Operations in declaration order; position is the `OpId`.
    pub operations: Vec<OpIndex>,
    pub span: Span,
}

/// A registered operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInfo {
    pub effect_id: EffectId,
    pub effect_name: String,
    pub op_id: OpId,
    pub op_index: OpIndex,
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub kind: ResumptionKind,
    /// Canonical `name(params)->ret` string.
    pub signature: String,
    pub signature_hash: u32,
    pub span: Span,
}

impl OperationInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.effect_name, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    effects: Vec<EffectInfo>,
    effect_index: HashMap<EffectId, usize>,
    operations: Vec<OperationInfo>,
    by_op: HashMap<(EffectId, OpId), OpIndex>,
    by_name: HashMap<(String, String), Vec<OpIndex>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every effect of `program`, reporting failures as diagnostics.
    /// Rejected declarations are skipped; the rest stay usable.
    pub fn from_program(program: &Program, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let mut registry = Registry::new();
        for effect in &program.effects {
            let id = match registry.register_effect(&effect.name, effect.span) {
                Ok(id) => id,
                Err(err) => {
                    diagnostics.push(err.to_diagnostic(effect.span));
                    continue;
                }
            };
            for op in &effect.operations {
                if let Err(err) = registry.register_operation(id, op) {
                    diagnostics.push(
                        err.to_diagnostic(op.span)
                            .with_note(effect.span, format!("in effect `{}`", effect.name)),
                    );
                }
            }
        }
        tracing::debug!(
            effects = registry.effects.len(),
            operations = registry.operations.len(),
            "effect registry built"
        );
        registry
    }

    pub fn register_effect(&mut self, name: &str, span: Span) -> Result<EffectId, RegistryError> {
        let id = EffectId::of(name);
        if self.effect_index.contains_key(&id) {
            return Err(RegistryError::DuplicateEffect { name: name.to_string() });
        }
        self.effect_index.insert(id, self.effects.len());
        self.effects.push(EffectInfo {
            id,
            name: name.to_string(),
            operations: Vec::new(),
            span,
        });
        Ok(id)
    }

    /// Register an operation of a registered effect.
    ///
    /// Two operations of one effect may share a name as long as their
    /// canonical signatures differ.
    pub fn register_operation(&mut self, effect: EffectId, decl: &OpDecl) -> Result<OpId, RegistryError> {
        let slot = *self.effect_index.get(&effect).ok_or(RegistryError::UnknownEffect(effect))?;
        let signature = canonical_signature(&decl.name, &decl.params, &decl.ret);
        let info = &self.effects[slot];
        if info
            .operations
            .iter()
            .any(|index| self.operations[index.index()].signature == signature)
        {
            return Err(RegistryError::DuplicateOperation {
                effect: info.name.clone(),
                signature,
            });
        }

        let op_id = OpId(info.operations.len() as u32);
        let op_index = OpIndex(self.operations.len() as u32);
        let effect_name = info.name.clone();
        self.by_op.insert((effect, op_id), op_index);
        self.by_name
            .entry((effect_name.clone(), decl.name.clone()))
            .or_default()
            .push(op_index);
        self.effects[slot].operations.push(op_index);
        self.operations.push(OperationInfo {
            effect_id: effect,
            effect_name,
            op_id,
            op_index,
            name: decl.name.clone(),
            params: decl.params.clone(),
            ret: decl.ret.clone(),
            kind: decl.kind,
            signature_hash: signature_hash(&signature),
            signature,
            span: decl.span,
        });
        Ok(op_id)
    }

    pub fn lookup(&self, effect: EffectId, op: OpId) -> Option<&OperationInfo> {
        let index = self.by_op.get(&(effect, op))?;
        self.operations.get(index.index())
    }

    /// First operation declared under `effect.op`.
    pub fn lookup_by_name(&self, effect: &str, op: &str) -> Option<&OperationInfo> {
        let indices = self.by_name.get(&(effect.to_string(), op.to_string()))?;
        indices.first().map(|index| &self.operations[index.index()])
    }

    /// Resolve a reference to one operation, choosing among same-named
    /// operations by argument types. With unknown argument types the first
    /// declaration of matching arity wins.
    pub fn resolve(&self, op: &OpRef, arg_types: Option<&[Type]>) -> Option<&OperationInfo> {
        let indices = self.by_name.get(&(op.effect.clone(), op.op.clone()))?;
        let candidates = indices.iter().map(|index| &self.operations[index.index()]);
        match arg_types {
            Some(types) => candidates
                .clone()
                .find(|info| info.params.as_slice() == types)
                .or_else(|| candidates.clone().find(|info| info.params.len() == types.len())),
            None => candidates.clone().next(),
        }
    }

    /// `row` with every whole-effect entry replaced by the effect's declared
    /// operations. Unknown effects are kept as written.
    pub fn expand_row(&self, row: &EffectRow) -> EffectRow {
        let mut ops: Vec<OpRef> = Vec::with_capacity(row.ops.len());
        for entry in &row.ops {
            let declared: Vec<OpRef> = if entry.op.is_empty() {
                self.operations
                    .iter()
                    .filter(|info| info.effect_name == entry.effect)
                    .map(|info| OpRef::new(&info.effect_name, &info.name))
                    .collect()
            } else {
                Vec::new()
            };
            let expanded = if declared.is_empty() { vec![entry.clone()] } else { declared };
            for op in expanded {
                if !ops.contains(&op) {
                    ops.push(op);
                }
            }
        }
        EffectRow { ops, open: row.open }
    }

    pub fn by_index(&self, index: OpIndex) -> Option<&OperationInfo> {
        self.operations.get(index.index())
    }

    pub fn effect(&self, id: EffectId) -> Option<&EffectInfo> {
        self.effect_index.get(&id).map(|slot| &self.effects[*slot])
    }

    pub fn effect_by_name(&self, name: &str) -> Option<&EffectInfo> {
        self.effect(EffectId::of(name))
    }

    pub fn effects(&self) -> &[EffectInfo] {
        &self.effects
    }

    /// Operations in `OpIndex` order.
    pub fn operations(&self) -> &[OperationInfo] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
