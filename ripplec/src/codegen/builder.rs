//! Artifact construction helpers.
//!
//! [`ModuleBuilder`] hands out function ids before bodies exist, so mutually
//! referencing functions (a body and its re-entry functions) can be emitted
//! in any order. [`FunctionBuilder`] appends instructions to a current block
//! and drops unreachable blocks when finished.

use std::collections::HashMap;

use ripple_runtime::artifact::{
    Block, BlockId, Callee, CustomSection, EnvLayout, EnvLayoutId, Export, FuncId, Function, Inst, LocalId, Module,
    Operand, Rvalue, SuspendPayload, Terminator, TrapCode,
};

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    functions: Vec<Function>,
    defined: Vec<bool>,
    names: HashMap<String, FuncId>,
    layouts: Vec<EnvLayout>,
    layout_ids: HashMap<EnvLayout, EnvLayoutId>,
    exports: Vec<Export>,
    sections: Vec<CustomSection>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the function `name`, reserving a slot on first use.
    pub fn declare(&mut self, name: &str, params: u32) -> FuncId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.to_string(),
            params,
            locals: params,
            blocks: Vec::new(),
        });
        self.defined.push(false);
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn func(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    pub fn define(&mut self, id: FuncId, function: Function) {
        self.functions[id.index()] = function;
        self.defined[id.index()] = true;
    }

    /// Declared functions that never received a body.
    pub fn undefined(&self) -> Vec<&str> {
        self.functions
            .iter()
            .zip(&self.defined)
            .filter(|(_, defined)| !**defined)
            .map(|(f, _)| f.name.as_str())
            .collect()
    }

    /// Structurally identical layouts share one id.
    pub fn intern_layout(&mut self, layout: EnvLayout) -> EnvLayoutId {
        if let Some(id) = self.layout_ids.get(&layout) {
            return *id;
        }
        let id = EnvLayoutId(self.layouts.len() as u32);
        self.layouts.push(layout.clone());
        self.layout_ids.insert(layout, id);
        id
    }

    pub fn export(&mut self, export: Export) {
        self.exports.push(export);
    }

    pub fn section(&mut self, section: CustomSection) {
        self.sections.push(section);
    }

    pub fn finish(self) -> Module {
        Module {
            functions: self.functions,
            env_layouts: self.layouts,
            exports: self.exports,
            sections: self.sections,
        }
    }
}

#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: u32,
    locals: u32,
    blocks: Vec<Block>,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: u32) -> Self {
        Self {
            name: name.into(),
            params,
            locals: params,
            blocks: vec![empty_block()],
            current: BlockId::ENTRY,
        }
    }

    pub fn param(&self, index: u32) -> LocalId {
        LocalId(index)
    }

    pub fn new_local(&mut self) -> LocalId {
        let local = LocalId(self.locals);
        self.locals += 1;
        local
    }

    /// Make sure slots `0..count` exist.
    pub fn reserve_locals(&mut self, count: u32) {
        self.locals = self.locals.max(count);
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(empty_block());
        id
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    fn push(&mut self, inst: Inst) {
        self.blocks[self.current.index()].insts.push(inst);
    }

    pub fn assign(&mut self, dest: LocalId, value: Rvalue) {
        self.push(Inst::Assign { dest, value });
    }

    /// Assign `value` to a fresh local.
    pub fn temp(&mut self, value: Rvalue) -> LocalId {
        let dest = self.new_local();
        self.assign(dest, value);
        dest
    }

    pub fn call(&mut self, dest: LocalId, callee: Callee, args: Vec<Operand>) {
        self.push(Inst::Call { dest, callee, args });
    }

    pub fn call_temp(&mut self, callee: Callee, args: Vec<Operand>) -> LocalId {
        let dest = self.new_local();
        self.call(dest, callee, args);
        dest
    }

    pub fn suspend(&mut self, dest: LocalId, payload: SuspendPayload) {
        self.push(Inst::Suspend { dest, payload });
    }

    pub fn terminate(&mut self, term: Terminator) {
        self.blocks[self.current.index()].term = term;
    }

    /// Terminate `block` without moving the cursor.
    pub fn terminate_block(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block.index()].term = term;
    }

    /// End the current block with a two-way branch on `cond` and return
    /// the fresh `(then, else)` blocks.
    pub fn branch(&mut self, cond: Operand) -> (BlockId, BlockId) {
        let then_block = self.new_block();
        let else_block = self.new_block();
        self.terminate(Terminator::Branch { cond, then_block, else_block });
        (then_block, else_block)
    }

    pub fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            locals: self.locals,
            blocks: prune_unreachable(self.blocks),
        }
    }
}

fn empty_block() -> Block {
    Block {
        insts: Vec::new(),
        term: Terminator::Trap(TrapCode::Unreachable),
    }
}

/// Drop blocks unreachable from the entry, renumbering the rest in order.
pub fn prune_unreachable(blocks: Vec<Block>) -> Vec<Block> {
    let mut reachable = vec![false; blocks.len()];
    let mut stack = vec![BlockId::ENTRY];
    while let Some(block) = stack.pop() {
        if block.index() >= blocks.len() || std::mem::replace(&mut reachable[block.index()], true) {
            continue;
        }
        stack.extend(blocks[block.index()].successors());
    }

    let mut remap = vec![BlockId::ENTRY; blocks.len()];
    let mut next = 0;
    for (i, keep) in reachable.iter().enumerate() {
        if *keep {
            remap[i] = BlockId(next);
            next += 1;
        }
    }

    blocks
        .into_iter()
        .zip(reachable)
        .filter(|(_, keep)| *keep)
        .map(|(mut block, _)| {
            let map = |b: &mut BlockId| *b = remap[b.index()];
            match &mut block.term {
                Terminator::Goto(target) => map(target),
                Terminator::Branch { then_block, else_block, .. } => {
                    map(then_block);
                    map(else_block);
                }
                Terminator::Switch { targets, otherwise, .. } => {
                    targets.iter_mut().for_each(|(_, b)| map(b));
                    map(otherwise);
                }
                Terminator::Return(_) | Terminator::Trap(_) => {}
            }
            block
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_runtime::artifact::Const;

    #[test]
    fn test_declare_is_idempotent() {
        let mut module = ModuleBuilder::new();
        let a = module.declare("a", 1);
        let b = module.declare("b", 0);
        assert_eq!(module.declare("a", 1), a);
        assert_ne!(a, b);
        assert_eq!(module.undefined(), ["a", "b"]);
        module.define(a, Function { name: "a".into(), params: 1, locals: 1, blocks: Vec::new() });
        assert_eq!(module.undefined(), ["b"]);
    }

    #[test]
    fn test_layouts_are_interned() {
        let mut module = ModuleBuilder::new();
        let layout = EnvLayout { name: "f$s0".into(), fields: Vec::new() };
        let first = module.intern_layout(layout.clone());
        assert_eq!(module.intern_layout(layout), first);
        let other = module.intern_layout(EnvLayout { name: "f$s1".into(), fields: Vec::new() });
        assert_ne!(first, other);
        assert_eq!(module.finish().env_layouts.len(), 2);
    }

    #[test]
    fn test_prune_renumbers_targets() {
        let mut fb = FunctionBuilder::new("f", 1);
        let dead = fb.new_block();
        let live = fb.new_block();
        fb.terminate(Terminator::Goto(live));
        fb.switch_to(dead);
        fb.terminate(Terminator::Goto(live));
        fb.switch_to(live);
        fb.terminate(Terminator::Return(Operand::Const(Const::Int(1))));

        let function = fb.finish();
        assert_eq!(function.blocks.len(), 2);
        assert_eq!(function.blocks[0].term, Terminator::Goto(BlockId(1)));
    }
}
