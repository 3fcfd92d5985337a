//! Runtime and host error types.

use thiserror::Error;

use crate::abi::{EffectId, OpId};
use crate::effect_table::TableError;
use crate::wire::WireError;

/// A fatal runtime condition. Traps terminate the run that raised them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Trap {
    #[error("unhandled effect {effect_id} op {op_id}")]
    UnhandledEffect { effect_id: EffectId, op_id: OpId },

    #[error("tail guard violation on effect {effect_id} op {op_id}: expected {expected} resumption(s), attempted {attempted}")]
    TailGuardViolation {
        effect_id: EffectId,
        op_id: OpId,
        expected: u32,
        attempted: u32,
    },

    #[error("continuation of fiber {fiber} was already resumed")]
    ContinuationConsumed { fiber: u32 },

    #[error("a direct request has no continuation to invoke")]
    DirectResume,

    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid function {0}")]
    InvalidFunction(u32),

    #[error("invalid local {local} in {function}")]
    InvalidLocal { function: String, local: u32 },

    #[error("invalid block {block} in {function}")]
    InvalidBlock { function: String, block: u32 },

    #[error("field {index} out of range for a record of {len} fields")]
    InvalidField { index: u32, len: usize },

    #[error("invalid environment layout {0}")]
    InvalidEnvLayout(u32),

    #[error("invalid handler frame {0}")]
    InvalidFrame(u32),

    #[error("{function} expects {expected} arguments, got {found}")]
    ArityMismatch {
        function: String,
        expected: u32,
        found: usize,
    },

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("call stack exceeded {0} frames")]
    StackOverflow(usize),

    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    #[error("entered unreachable code")]
    Unreachable,

    #[error("no handler clause of `{function}` matches the request")]
    NoMatchingClause { function: String },

    #[error("malformed resumption payload: {0}")]
    MalformedPayload(WireError),

    #[error("encoded result needs {needed} bytes but the buffer holds {cap}")]
    BufferOverflow { needed: usize, cap: usize },
}

/// Errors surfaced to the host. None of these trap the module; the run that
/// hit one is finalized with a rejected outcome instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("effect contract is not finalized: {effect}.{op}")]
    CapabilityNotFinalized { effect: String, op: String },

    #[error("malformed resumption payload: {0}")]
    MalformedPayload(#[from] WireError),

    #[error("missing host module for {effect}.{op}")]
    MissingHostModule { effect: String, op: String },

    #[error("artifact has no `{0}` section")]
    MissingSection(&'static str),

    #[error("artifact is missing the `{0}` entry point")]
    MissingEntryPoint(String),

    #[error("invalid effect table: {0}")]
    InvalidEffectTable(#[from] TableError),

    #[error("unknown export `{0}`")]
    UnknownExport(String),

    #[error("effect {effect_id} has no operation {op_id}")]
    UnknownOperation { effect_id: EffectId, op_id: OpId },

    #[error("signature hash mismatch for {effect}.{op}: artifact has {expected:#010x}, handler declares {found:#010x}")]
    SignatureMismatch {
        effect: String,
        op: String,
        expected: u32,
        found: u32,
    },

    #[error("unknown request handle {0}")]
    UnknownHandle(u64),

    #[error("tail operation {effect}.{op} cannot end without resuming")]
    TailCannotEnd { effect: String, op: String },

    #[error("scheduler run limit of {0} reached")]
    RunLimitReached(usize),

    #[error("adapter failure: {0}")]
    Adapter(String),

    #[error("host dropped the continuation of {0} without answering")]
    ContinuationDropped(String),

    #[error("run trapped: {0}")]
    Trap(#[from] Trap),
}

impl HostError {
    /// The trap behind this error, if the module itself failed.
    pub fn trap(&self) -> Option<&Trap> {
        match self {
            HostError::Trap(trap) => Some(trap),
            _ => None,
        }
    }
}
