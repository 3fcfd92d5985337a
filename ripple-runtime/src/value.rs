//! # Runtime Values
//!
//! Values manipulated by the reference machine. Everything a generated function
//! can hold in a local is a [`Value`]; the effect machinery is made of a handful
//! of them:
//!
//! - [`Outcome`]: the two-case result of every effectful call.
//! - [`EffectRequest`]: a pending operation plus the continuation that resumes it.
//! - [`Continuation`]: an immutable, reference-counted chain of re-entry points.
//! - [`TailGuard`]: the resumption counter shared by one resumption chain.
//!
//! ## Ownership
//!
//! Requests and continuations are immutable once built. Re-wrapping a request
//! on its way up the call chain allocates a new request whose continuation
//! points at the previous one, so a continuation resumed several times always
//! re-enters the same captured environments. The guard is the only mutable part
//! and is shared between a request and all of its re-wrappings.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::abi::{EffectId, OpId, OpIndex, ResumptionKind};
use crate::artifact::{EnvLayoutId, FuncId};
use crate::fiber::FiberId;
use crate::handlers::FrameId;
use crate::wire::{WireError, WireValue};

/// A value held in a machine local.
#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Value]>),
    Func(FuncId),
    Env(Rc<EnvRecord>),
    Outcome(Rc<Outcome>),
    Request(Rc<EffectRequest>),
    Cont(Rc<Continuation>),
    /// Current handler frame; `None` is the empty chain.
    Frame(Option<FrameId>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Func(_) => "func",
            Value::Env(_) => "env",
            Value::Outcome(_) => "outcome",
            Value::Request(_) => "request",
            Value::Cont(_) => "continuation",
            Value::Frame(_) => "frame",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&Rc<EffectRequest>> {
        match self {
            Value::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_outcome(&self) -> Option<&Rc<Outcome>> {
        match self {
            Value::Outcome(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<Option<FrameId>> {
        match self {
            Value::Frame(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert a marshalable value into its wire form.
    pub fn to_wire(&self) -> Result<WireValue, WireError> {
        Ok(match self {
            Value::Unit => WireValue::Unit,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(n) => WireValue::Int(*n),
            Value::Float(x) => WireValue::Float(*x),
            Value::Str(s) => WireValue::Str(s.to_string()),
            Value::Bytes(b) => WireValue::Bytes(b.to_vec()),
            Value::Tuple(items) => {
                WireValue::Array(items.iter().map(Value::to_wire).collect::<Result<_, _>>()?)
            }
            other => return Err(WireError::NotMarshalable(other.type_name())),
        })
    }

    /// Build a machine value from a decoded wire value.
    pub fn from_wire(value: &WireValue) -> Value {
        match value {
            WireValue::Unit => Value::Unit,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(n) => Value::Int(*n),
            WireValue::Float(x) => Value::Float(*x),
            WireValue::Str(s) => Value::str(s),
            WireValue::Bytes(b) => Value::Bytes(Rc::from(b.as_slice())),
            WireValue::Array(items) => Value::tuple(items.iter().map(Value::from_wire).collect()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::Frame(a), Value::Frame(b)) => a == b,
            (Value::Env(a), Value::Env(b)) => Rc::ptr_eq(a, b),
            (Value::Outcome(a), Value::Outcome(b)) => Rc::ptr_eq(a, b),
            (Value::Request(a), Value::Request(b)) => Rc::ptr_eq(a, b),
            (Value::Cont(a), Value::Cont(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Tuple(items) => f.debug_tuple("").field(items).finish(),
            Value::Func(id) => write!(f, "{}", id),
            Value::Env(env) => write!(f, "env{}[{}]", env.layout.0, env.fields.len()),
            Value::Outcome(o) => write!(f, "{:?}", o),
            Value::Request(r) => write!(f, "request#{}", r.handle),
            Value::Cont(c) => write!(f, "cont({})", c.kind_name()),
            Value::Frame(Some(id)) => write!(f, "frame{}", id.0),
            Value::Frame(None) => f.write_str("frame(null)"),
        }
    }
}

/// A captured environment record.
#[derive(Debug)]
pub struct EnvRecord {
    pub layout: EnvLayoutId,
    pub fields: Vec<Value>,
}

/// Result of an effectful call.
#[derive(Debug)]
pub enum Outcome {
    Value(Value),
    Effect(Rc<EffectRequest>),
}

impl Outcome {
    pub fn is_effect(&self) -> bool {
        matches!(self, Outcome::Effect(_))
    }
}

// ============================================================================
// Requests, continuations, guards
// ============================================================================

/// A performed operation waiting for a handler.
#[derive(Debug)]
pub struct EffectRequest {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub op_index: OpIndex,
    pub kind: ResumptionKind,
    /// Opaque per-run handle, unique for every request value.
    pub handle: u64,
    pub args: Rc<[Value]>,
    pub continuation: Rc<Continuation>,
    pub guard: Rc<TailGuard>,
    /// Suspension order of the outermost re-entry point.
    pub site_order: u32,
}

impl EffectRequest {
    /// A request with no continuation, passed to a tail-resumptive clause
    /// found on the fast path.
    pub fn is_direct(&self) -> bool {
        matches!(*self.continuation, Continuation::Direct)
    }
}

/// The rest of the computation after a suspension.
#[derive(Debug)]
pub enum Continuation {
    /// Resuming yields the resume value as the final outcome.
    Identity,
    /// Perform-site re-entry: `func(env, value)`.
    Closure { func: FuncId, env: Value },
    /// Call-site re-entry: `func(env, inner, value)`, where `func` first
    /// resumes `inner` and then finishes its own remaining work.
    Frame { func: FuncId, env: Value, inner: Rc<Continuation> },
    /// A suspended fiber segment; valid for exactly one resumption.
    Fiber { fiber: FiberId, epoch: u32 },
    /// No continuation; the clause result is the perform's value.
    Direct,
}

impl Continuation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Continuation::Identity => "identity",
            Continuation::Closure { .. } => "closure",
            Continuation::Frame { .. } => "frame",
            Continuation::Fiber { .. } => "fiber",
            Continuation::Direct => "direct",
        }
    }

    /// Number of re-entry points in the chain.
    pub fn depth(&self) -> usize {
        match self {
            Continuation::Frame { inner, .. } => 1 + inner.depth(),
            Continuation::Identity | Continuation::Direct => 0,
            Continuation::Closure { .. } | Continuation::Fiber { .. } => 1,
        }
    }
}

/// Resumption counter enforcing the exactly-once discipline of `tail` operations.
#[derive(Debug)]
pub struct TailGuard {
    expected: u32,
    observed: Cell<u32>,
}

impl TailGuard {
    pub fn new(kind: ResumptionKind) -> Self {
        Self {
            expected: kind.expected_resumptions(),
            observed: Cell::new(0),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn observed(&self) -> u32 {
        self.observed.get()
    }

    /// Record one resumption. Returns `false`, leaving the count unchanged,
    /// when the resumption would exceed the expected count.
    pub fn observe(&self) -> bool {
        let next = self.observed.get().saturating_add(1);
        if next > self.expected {
            return false;
        }
        self.observed.set(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_guard_allows_one() {
        let guard = TailGuard::new(ResumptionKind::Tail);
        assert!(guard.observe());
        assert!(!guard.observe());
        assert_eq!(guard.observed(), 1);
    }

    #[test]
    fn test_resume_guard_is_unbounded() {
        let guard = TailGuard::new(ResumptionKind::Resume);
        for _ in 0..100 {
            assert!(guard.observe());
        }
        assert_eq!(guard.observed(), 100);
        assert!(guard.observed() <= guard.expected());
    }

    #[test]
    fn test_wire_conversion() {
        let value = Value::tuple(vec![Value::Int(1), Value::str("x"), Value::Unit]);
        let wire = value.to_wire().unwrap();
        assert_eq!(Value::from_wire(&wire), value);
        assert!(Value::Frame(None).to_wire().is_err());
    }

    #[test]
    fn test_continuation_depth() {
        let inner = Rc::new(Continuation::Closure { func: FuncId(0), env: Value::Unit });
        let outer = Continuation::Frame { func: FuncId(1), env: Value::Unit, inner };
        assert_eq!(outer.depth(), 2);
        assert_eq!(Continuation::Identity.depth(), 0);
    }
}
