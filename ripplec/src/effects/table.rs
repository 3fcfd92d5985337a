//! Effect table emission.
//!
//! Serializes the registry into the `ripple.effects` custom section. The
//! binary layout and its parser live in `ripple_runtime::effect_table`, so
//! the compiler and the host share one definition of the format.

use ripple_runtime::abi::EFFECT_TABLE_SECTION;
use ripple_runtime::artifact::CustomSection;
use ripple_runtime::effect_table::{EffectTable, EffectTableEntry, TableError};

use crate::effects::registry::Registry;

/// Build the table from the registry, in `OpIndex` order.
pub fn build_table(registry: &Registry) -> Result<EffectTable, TableError> {
    let entries = registry
        .operations()
        .iter()
        .map(|op| EffectTableEntry {
            effect_id: op.effect_id,
            effect_name: op.effect_name.clone(),
            op_id: op.op_id,
            op_index: op.op_index,
            kind: op.kind,
            signature_hash: op.signature_hash,
            label: op.name.clone(),
        })
        .collect();
    EffectTable::from_entries(entries)
}

/// Emit the effect table section.
pub fn emit_section(registry: &Registry) -> Result<CustomSection, TableError> {
    let table = build_table(registry)?;
    let bytes = table.encode();
    tracing::debug!(operations = table.len(), bytes = bytes.len(), "emitted effect table");
    Ok(CustomSection {
        name: EFFECT_TABLE_SECTION.to_string(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{EffectDecl, OpDecl, Program, Type};
    use ripple_runtime::abi::{EffectId, OpIndex, ResumptionKind};

    #[test]
    fn test_emitted_section_parses_back() {
        let program = Program::new()
            .effect(EffectDecl::new("std.Log").op(OpDecl::tail("info", vec![Type::Str], Type::Unit)))
            .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)));
        let mut diagnostics = Vec::new();
        let registry = Registry::from_program(&program, &mut diagnostics);

        let section = emit_section(&registry).unwrap();
        assert_eq!(section.name, EFFECT_TABLE_SECTION);
        let table = EffectTable::parse(&section.bytes).unwrap();
        assert_eq!(table.len(), 2);

        let await_op = table.by_name(EffectId::of("Async"), "await").unwrap();
        assert_eq!(await_op.op_index, OpIndex(1));
        assert_eq!(await_op.kind, ResumptionKind::Resume);
        assert_eq!(await_op.signature_hash, registry.operations()[1].signature_hash);
        assert_eq!(table.by_index(OpIndex(0)).map(|e| e.effect_name.as_str()), Some("std.Log"));
    }
}
