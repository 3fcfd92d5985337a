//! # Target Artifact
//!
//! The module format both compiler backends lower into and the reference
//! machine executes.
//!
//! ## Structure
//!
//! ```text
//! Module
//! ├── functions: Vec<Function>
//! │   └── blocks: Vec<Block>
//! │       ├── insts: Vec<Inst>       Assign | Call | Suspend
//! │       └── term: Terminator       Goto | Branch | Switch | Return | Trap
//! ├── env_layouts: Vec<EnvLayout>    one per specialized continuation site
//! ├── exports: Vec<Export>
//! └── sections: Vec<CustomSection>   effect table, wire schema
//! ```
//!
//! Locals are untyped slots; `LocalId(i)` for `i < params` are parameters.
//! Every local starts out as unit, so a slot read before its first write is
//! well defined.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::{EffectId, OpId, OpIndex, ResumptionKind};
use crate::builtins::Builtin;

// ============================================================================
// Ids
// ============================================================================

/// Index of a function in [`Module::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Index of a local slot inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u32);

impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a block inside a function. Block 0 is the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Index of an environment layout in [`Module::env_layouts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvLayoutId(pub u32);

impl EnvLayoutId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Module
// ============================================================================

/// A complete compiled artifact.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub env_layouts: Vec<EnvLayout>,
    pub exports: Vec<Export>,
    pub sections: Vec<CustomSection>,
}

impl Module {
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.bytes.as_slice())
    }

    pub fn env_layout(&self, id: EnvLayoutId) -> Option<&EnvLayout> {
        self.env_layouts.get(id.index())
    }

    /// Total number of instructions, for logging and size checks.
    pub fn inst_count(&self) -> usize {
        self.functions
            .iter()
            .flat_map(|f| &f.blocks)
            .map(|b| b.insts.len() + 1)
            .sum()
    }
}

/// An exported function and its generated effectful entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    /// The `name_effectful` wrapper returning an encoded `EffectResult`.
    pub entry: FuncId,
    pub params: u32,
}

/// Named blob carried alongside the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Machine-level representation of a captured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    I32,
    I64,
    F64,
    AnyRef,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F64 => "f64",
            ValType::AnyRef => "anyref",
        })
    }
}

/// Where a captured field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldSource {
    /// Suspension order of the site.
    Site,
    /// Active handler frame at the site.
    Handler,
    Param,
    Local,
}

/// One field of an environment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvFieldLayout {
    pub name: String,
    pub source: FieldSource,
    pub val_type: ValType,
}

/// Layout of a synthesized environment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvLayout {
    pub name: String,
    pub fields: Vec<EnvFieldLayout>,
}

// ============================================================================
// Functions
// ============================================================================

/// A function in block form.
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub params: u32,
    pub locals: u32,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }
}

/// A straight-line sequence of instructions and a terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

impl Block {
    pub fn successors(&self) -> Vec<BlockId> {
        match &self.term {
            Terminator::Goto(target) => vec![*target],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Switch { targets, otherwise, .. } => {
                let mut succs: Vec<_> = targets.iter().map(|(_, b)| *b).collect();
                succs.push(*otherwise);
                succs
            }
            Terminator::Return(_) | Terminator::Trap(_) => Vec::new(),
        }
    }
}

/// A constant operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// The empty handler chain.
    NullFrame,
}

/// An instruction input.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Local(LocalId),
    Const(Const),
}

impl From<LocalId> for Operand {
    fn from(local: LocalId) -> Self {
        Operand::Local(local)
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// Continuation attached to a freshly built request.
#[derive(Debug, Clone, PartialEq)]
pub enum ContSpec {
    Identity,
    Closure { func: FuncId, env: Operand },
    Direct,
}

/// Which frames a handler lookup matches against.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerQuery {
    /// The identity of a request value.
    Request(Operand),
    /// A statically known operation.
    Op { effect_id: EffectId, op_id: OpId },
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Rvalue {
    Use(Operand),
    Binary(BinOp, Operand, Operand),
    Unary(UnOp, Operand),
    Tuple(Vec<Operand>),
    Field(Operand, u32),
    Builtin(Builtin, Vec<Operand>),
    FuncRef(FuncId),

    MakeEnv { layout: EnvLayoutId, fields: Vec<Operand> },
    EnvField(Operand, u32),

    /// `Outcome::Value(v)`.
    OutcomeValue(Operand),
    /// `Outcome::Effect(request)`.
    OutcomeEffect(Operand),
    IsEffect(Operand),
    /// Payload of a value outcome; traps as unhandled on an effect outcome.
    OutcomeValueOf(Operand),
    OutcomeRequest(Operand),

    MakeRequest {
        effect_id: EffectId,
        op_id: OpId,
        op_index: OpIndex,
        kind: ResumptionKind,
        args: Vec<Operand>,
        cont: ContSpec,
        site_order: u32,
    },
    /// New request whose continuation is `Frame { func, env, inner: old }`.
    /// The guard is shared with the original.
    WrapRequest { request: Operand, func: FuncId, env: Operand, site_order: u32 },
    RequestArg(Operand, u32),
    RequestOpIndex(Operand),
    RequestCont(Operand),
    IsDirect(Operand),
    /// Count one resumption against the request's guard.
    ObserveGuard(Operand),

    PushFrame { prev: Operand, ops: Vec<(EffectId, OpId)>, clause: FuncId, env: Operand },
    FramePrev(Operand),
    FrameClause(Operand),
    FrameEnv(Operand),
    IsFrame(Operand),
    /// Innermost frame in `[from, stop)` matching the query.
    FindHandler { from: Operand, stop: Operand, query: HandlerQuery },

    NewFiber { func: FuncId, args: Vec<Operand> },

    /// Encode an outcome as an `EffectResult`, publishing pending requests
    /// under their handle. Traps if the encoding exceeds `cap`.
    EncodeResult { outcome: Operand, cap: Option<Operand> },
    /// Decode a resumption payload against the request's return shape.
    DecodeResume { request: Operand, buf: Operand, len: Operand },
}

/// Callee of a call instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Direct(FuncId),
    /// A `Func` value.
    Indirect(Operand),
    /// Invoke a continuation value without touching any guard.
    Continuation(Operand),
    /// Invoke a request's continuation, counting it against the request's guard.
    Resume(Operand),
}

/// Payload of a fiber suspension.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendPayload {
    New {
        effect_id: EffectId,
        op_id: OpId,
        op_index: OpIndex,
        kind: ResumptionKind,
        args: Vec<Operand>,
        site_order: u32,
    },
    /// Re-raise an existing request from the current fiber; the new request
    /// shares the original's guard.
    Forward(Operand),
}

/// An instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Assign { dest: LocalId, value: Rvalue },
    Call { dest: LocalId, callee: Callee, args: Vec<Operand> },
    /// Suspend the current fiber up to the nearest fiber boundary. The resume
    /// value lands in `dest`.
    Suspend { dest: LocalId, payload: SuspendPayload },
}

/// Reasons for an explicit trap terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrapCode {
    Unreachable,
    /// No clause of a handler matched the request it was dispatched.
    NoMatchingClause,
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Goto(BlockId),
    Branch { cond: Operand, then_block: BlockId, else_block: BlockId },
    Switch { discr: Operand, targets: Vec<(i64, BlockId)>, otherwise: BlockId },
    Return(Operand),
    Trap(TrapCode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_lookups() {
        let module = Module {
            functions: vec![
                Function { name: "a".into(), ..Default::default() },
                Function { name: "b".into(), ..Default::default() },
            ],
            sections: vec![CustomSection { name: "x".into(), bytes: vec![1, 2] }],
            ..Default::default()
        };
        assert_eq!(module.func_by_name("b"), Some(FuncId(1)));
        assert_eq!(module.func_by_name("c"), None);
        assert_eq!(module.section("x"), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_block_successors() {
        let block = Block {
            insts: Vec::new(),
            term: Terminator::Switch {
                discr: Operand::Const(Const::Int(0)),
                targets: vec![(0, BlockId(1)), (1, BlockId(2))],
                otherwise: BlockId(3),
            },
        };
        assert_eq!(block.successors(), vec![BlockId(1), BlockId(2), BlockId(3)]);
    }
}
