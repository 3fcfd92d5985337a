//! # Reference Machine
//!
//! Executes [`Module`] artifacts with an explicit frame stack.
//!
//! ## Stack Discipline
//!
//! The machine keeps the running frame in a local and every suspended caller
//! on `stack`. Calls push the caller and switch to the callee; returns pop the
//! caller and write the result into the local the call named.
//!
//! Fibers add a second kind of stack entry, the boundary marker:
//!
//! ```text
//! stack:  [ ...caller frames..., Frame(resumer), Boundary{fiber, dest}, fiber frames... ]
//! ```
//!
//! - Resuming a fiber pushes the resumer and a boundary, then reinstates the
//!   fiber's frames on top.
//! - When the fiber's bottom frame returns, the boundary is popped and the
//!   resumer receives `Outcome::Value(result)` in `dest`.
//! - `Suspend` moves every frame above the nearest boundary back into the
//!   fiber and hands the resumer `Outcome::Effect(request)`. With no boundary
//!   on the stack the effect is unhandled and the run traps.
//!
//! The trampoline backend never creates fibers; its suspensions are ordinary
//! returns of `Outcome::Effect`.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::artifact::{
    BinOp, BlockId, Callee, Const, ContSpec, FuncId, HandlerQuery, Inst, LocalId, Module, Operand,
    Rvalue, SuspendPayload, Terminator, TrapCode, UnOp,
};
use crate::error::Trap;
use crate::fiber::{FiberEntry, FiberId, FiberTable};
use crate::handlers::{FrameId, HandlerArena, HandlerFrame};
use crate::value::{Continuation, EffectRequest, EnvRecord, Outcome, TailGuard, Value};
use crate::wire::{EffectResult, RequestRecord, WireError, WireSchema, WireValue};

/// Limits applied to one machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Maximum number of stacked frames.
    pub max_stack_depth: usize,
    /// Maximum executed instructions per run; `None` is unlimited.
    pub step_limit: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: 4096,
            step_limit: None,
        }
    }
}

/// Counters collected while running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStats {
    pub steps: u64,
    pub calls: u64,
    pub requests: u64,
    pub resumptions: u64,
    pub fiber_switches: u64,
    pub max_depth: usize,
}

/// A frame being executed or waiting on the stack.
#[derive(Debug, Clone)]
pub(crate) struct ActiveFrame {
    func: FuncId,
    locals: Vec<Value>,
    block: BlockId,
    ip: usize,
    /// Local of the caller that receives this frame's return value.
    ret: LocalId,
}

impl ActiveFrame {
    pub(crate) fn locals(&self) -> &[Value] {
        &self.locals
    }
}

#[derive(Debug)]
enum StackEntry {
    Frame(ActiveFrame),
    Boundary { fiber: FiberId, dest: LocalId },
}

enum Flow {
    Continue(ActiveFrame),
    Finished(Value),
}

/// The per-run execution state: frame stack, handler arena, fibers, and the
/// requests published to the host.
pub struct Machine {
    module: Rc<Module>,
    schema: Rc<WireSchema>,
    config: MachineConfig,
    handlers: HandlerArena,
    fibers: FiberTable,
    stack: Vec<StackEntry>,
    published: HashMap<u64, Rc<EffectRequest>>,
    next_handle: u64,
    stats: MachineStats,
}

impl Machine {
    pub fn new(module: Rc<Module>, schema: Rc<WireSchema>, config: MachineConfig) -> Self {
        Self {
            module,
            schema,
            config,
            handlers: HandlerArena::new(),
            fibers: FiberTable::default(),
            stack: Vec::new(),
            published: HashMap::new(),
            next_handle: 1,
            stats: MachineStats::default(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn stats(&self) -> &MachineStats {
        &self.stats
    }

    pub fn handlers(&self) -> &HandlerArena {
        &self.handlers
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// A request previously handed to the host under `handle`.
    pub fn published(&self, handle: u64) -> Option<Rc<EffectRequest>> {
        self.published.get(&handle).cloned()
    }

    /// Forget the request published under `handle`. Returns whether it was
    /// published.
    pub fn release(&mut self, handle: u64) -> bool {
        self.published.remove(&handle).is_some()
    }

    pub fn published_count(&self) -> usize {
        self.published.len()
    }

    /// Drop every published request, frame and fiber of the run.
    pub fn clear(&mut self) {
        self.published.clear();
        self.handlers.clear();
        self.fibers.clear();
        self.stack.clear();
    }

    /// Sweep handler frames and fibers no published request can reach.
    ///
    /// Only sound between calls, when the stack is empty and published
    /// requests are the run's only roots. Returns the number of frames and
    /// fibers freed.
    pub fn collect(&mut self) -> (usize, usize) {
        if !self.stack.is_empty() {
            return (0, 0);
        }
        let mut frames = HashSet::new();
        let mut fibers = HashSet::new();
        let mut work: Vec<Value> = self.published.values().map(|r| Value::Request(Rc::clone(r))).collect();
        while let Some(value) = work.pop() {
            match value {
                Value::Tuple(items) => work.extend(items.iter().cloned()),
                Value::Env(env) => work.extend(env.fields.iter().cloned()),
                Value::Outcome(outcome) => match &*outcome {
                    Outcome::Value(v) => work.push(v.clone()),
                    Outcome::Effect(request) => work.push(Value::Request(Rc::clone(request))),
                },
                Value::Request(request) => {
                    work.extend(request.args.iter().cloned());
                    work.push(Value::Cont(Rc::clone(&request.continuation)));
                }
                Value::Cont(cont) => match &*cont {
                    Continuation::Closure { env, .. } => work.push(env.clone()),
                    Continuation::Frame { env, inner, .. } => {
                        work.push(env.clone());
                        work.push(Value::Cont(Rc::clone(inner)));
                    }
                    Continuation::Fiber { fiber, .. } => {
                        if fibers.insert(*fiber) {
                            self.fibers.saved_values(*fiber, &mut work);
                        }
                    }
                    Continuation::Identity | Continuation::Direct => {}
                },
                Value::Frame(Some(id)) => {
                    if frames.insert(id) {
                        if let Ok(frame) = self.handlers.get(id) {
                            work.push(frame.env.clone());
                            work.push(Value::Frame(frame.prev));
                        }
                    }
                }
                _ => {}
            }
        }
        let freed_frames = self.handlers.retain(|id| frames.contains(&id));
        let freed_fibers = self.fibers.retain(|id| fibers.contains(&id));
        if freed_frames + freed_fibers > 0 {
            tracing::trace!(
                frames = freed_frames,
                fibers = freed_fibers,
                live_frames = self.handlers.len(),
                "swept run state"
            );
        }
        (freed_frames, freed_fibers)
    }

    /// Call a function to completion.
    pub fn call(&mut self, func: FuncId, args: Vec<Value>) -> Result<Value, Trap> {
        self.stack.clear();
        let frame = self.new_frame(func, args, LocalId(0))?;
        self.stats.calls += 1;
        let result = self.run(frame);
        self.stack.clear();
        result
    }

    /// Call a function by name.
    pub fn call_by_name(&mut self, name: &str, args: Vec<Value>) -> Result<Value, Trap> {
        let func = self
            .module
            .func_by_name(name)
            .ok_or(Trap::InvalidFunction(u32::MAX))?;
        self.call(func, args)
    }

    // ========================================================================
    // Interpreter loop
    // ========================================================================

    fn run(&mut self, mut frame: ActiveFrame) -> Result<Value, Trap> {
        let module = Rc::clone(&self.module);
        loop {
            self.stats.steps += 1;
            if let Some(limit) = self.config.step_limit {
                if self.stats.steps > limit {
                    return Err(Trap::StepLimitExceeded(limit));
                }
            }

            let function = module
                .function(frame.func)
                .ok_or(Trap::InvalidFunction(frame.func.0))?;
            let block = function.block(frame.block).ok_or_else(|| Trap::InvalidBlock {
                function: function.name.clone(),
                block: frame.block.0,
            })?;

            if let Some(inst) = block.insts.get(frame.ip) {
                frame.ip += 1;
                frame = match inst {
                    Inst::Assign { dest, value } => {
                        let value = self.eval(&frame, value)?;
                        set(&mut frame, *dest, value)?;
                        frame
                    }
                    Inst::Call { dest, callee, args } => {
                        let args = self.operands(&frame, args)?;
                        self.call_callee(frame, *dest, callee, args)?
                    }
                    Inst::Suspend { dest, payload } => self.suspend(frame, *dest, payload)?,
                };
                continue;
            }

            match &block.term {
                Terminator::Goto(target) => jump(&mut frame, *target),
                Terminator::Branch { cond, then_block, else_block } => {
                    let cond = self.operand(&frame, cond)?;
                    let taken = cond.as_bool().ok_or_else(|| mismatch("branch", "bool", &cond))?;
                    jump(&mut frame, if taken { *then_block } else { *else_block });
                }
                Terminator::Switch { discr, targets, otherwise } => {
                    let discr = self.operand(&frame, discr)?;
                    let value = discr.as_int().ok_or_else(|| mismatch("switch", "int", &discr))?;
                    let target = targets
                        .iter()
                        .find(|(v, _)| *v == value)
                        .map(|(_, b)| *b)
                        .unwrap_or(*otherwise);
                    jump(&mut frame, target);
                }
                Terminator::Return(op) => {
                    let value = self.operand(&frame, op)?;
                    match self.return_to(frame.ret, value)? {
                        Flow::Continue(caller) => frame = caller,
                        Flow::Finished(value) => return Ok(value),
                    }
                }
                Terminator::Trap(TrapCode::Unreachable) => return Err(Trap::Unreachable),
                Terminator::Trap(TrapCode::NoMatchingClause) => {
                    return Err(Trap::NoMatchingClause { function: function.name.clone() })
                }
            }
        }
    }

    fn return_to(&mut self, ret: LocalId, value: Value) -> Result<Flow, Trap> {
        match self.stack.pop() {
            None => Ok(Flow::Finished(value)),
            Some(StackEntry::Frame(mut caller)) => {
                set(&mut caller, ret, value)?;
                Ok(Flow::Continue(caller))
            }
            Some(StackEntry::Boundary { fiber, dest }) => {
                self.fibers.finish(fiber);
                let outcome = Value::Outcome(Rc::new(Outcome::Value(value)));
                match self.stack.pop() {
                    Some(StackEntry::Frame(mut resumer)) => {
                        set(&mut resumer, dest, outcome)?;
                        Ok(Flow::Continue(resumer))
                    }
                    None => Ok(Flow::Finished(outcome)),
                    Some(StackEntry::Boundary { .. }) => Err(Trap::Unreachable),
                }
            }
        }
    }

    // ========================================================================
    // Calls and continuations
    // ========================================================================

    fn new_frame(&self, func: FuncId, args: Vec<Value>, ret: LocalId) -> Result<ActiveFrame, Trap> {
        let function = self
            .module
            .function(func)
            .ok_or(Trap::InvalidFunction(func.0))?;
        if args.len() != function.params as usize {
            return Err(Trap::ArityMismatch {
                function: function.name.clone(),
                expected: function.params,
                found: args.len(),
            });
        }
        let mut locals = args;
        locals.resize(function.locals.max(function.params) as usize, Value::Unit);
        Ok(ActiveFrame {
            func,
            locals,
            block: BlockId::ENTRY,
            ip: 0,
            ret,
        })
    }

    fn push_caller(&mut self, caller: ActiveFrame) -> Result<(), Trap> {
        if self.stack.len() >= self.config.max_stack_depth {
            return Err(Trap::StackOverflow(self.config.max_stack_depth));
        }
        self.stack.push(StackEntry::Frame(caller));
        self.stats.max_depth = self.stats.max_depth.max(self.stack.len());
        Ok(())
    }

    fn push_call(
        &mut self,
        caller: ActiveFrame,
        func: FuncId,
        args: Vec<Value>,
        dest: LocalId,
    ) -> Result<ActiveFrame, Trap> {
        let callee = self.new_frame(func, args, dest)?;
        self.push_caller(caller)?;
        self.stats.calls += 1;
        Ok(callee)
    }

    fn call_callee(
        &mut self,
        frame: ActiveFrame,
        dest: LocalId,
        callee: &Callee,
        mut args: Vec<Value>,
    ) -> Result<ActiveFrame, Trap> {
        match callee {
            Callee::Direct(func) => self.push_call(frame, *func, args, dest),
            Callee::Indirect(op) => match self.operand(&frame, op)? {
                Value::Func(func) => self.push_call(frame, func, args, dest),
                other => Err(mismatch("indirect call", "func", &other)),
            },
            Callee::Continuation(op) => {
                let cont = match self.operand(&frame, op)? {
                    Value::Cont(cont) => cont,
                    other => return Err(mismatch("continuation call", "continuation", &other)),
                };
                let value = args.pop().unwrap_or(Value::Unit);
                self.invoke(frame, dest, cont, value)
            }
            Callee::Resume(op) => {
                let request = expect_request(self.operand(&frame, op)?, "resume")?;
                self.observe(&request)?;
                self.stats.resumptions += 1;
                tracing::trace!(
                    handle = request.handle,
                    effect = %request.effect_id,
                    observed = request.guard.observed(),
                    "resume"
                );
                let value = args.pop().unwrap_or(Value::Unit);
                self.invoke(frame, dest, Rc::clone(&request.continuation), value)
            }
        }
    }

    fn observe(&self, request: &EffectRequest) -> Result<(), Trap> {
        if request.guard.observe() {
            Ok(())
        } else {
            Err(Trap::TailGuardViolation {
                effect_id: request.effect_id,
                op_id: request.op_id,
                expected: request.guard.expected(),
                attempted: request.guard.observed().saturating_add(1),
            })
        }
    }

    fn invoke(
        &mut self,
        mut frame: ActiveFrame,
        dest: LocalId,
        cont: Rc<Continuation>,
        value: Value,
    ) -> Result<ActiveFrame, Trap> {
        match &*cont {
            Continuation::Identity => {
                set(&mut frame, dest, Value::Outcome(Rc::new(Outcome::Value(value))))?;
                Ok(frame)
            }
            Continuation::Closure { func, env } => {
                self.push_call(frame, *func, vec![env.clone(), value], dest)
            }
            Continuation::Frame { func, env, inner } => self.push_call(
                frame,
                *func,
                vec![env.clone(), Value::Cont(Rc::clone(inner)), value],
                dest,
            ),
            Continuation::Fiber { fiber, epoch } => self.enter_fiber(frame, dest, *fiber, *epoch, value),
            Continuation::Direct => Err(Trap::DirectResume),
        }
    }

    fn enter_fiber(
        &mut self,
        resumer: ActiveFrame,
        dest: LocalId,
        fiber: FiberId,
        epoch: u32,
        value: Value,
    ) -> Result<ActiveFrame, Trap> {
        let entry = self.fibers.enter(fiber, epoch)?;
        self.stats.fiber_switches += 1;
        self.push_caller(resumer)?;
        self.stack.push(StackEntry::Boundary { fiber, dest });
        tracing::trace!(fiber = fiber.0, epoch, "enter fiber");
        match entry {
            FiberEntry::Start { func, args } => {
                self.stats.calls += 1;
                self.new_frame(func, args, LocalId(0))
            }
            FiberEntry::Continue { mut frames, dest } => {
                let mut top = frames.pop().ok_or(Trap::Unreachable)?;
                set(&mut top, dest, value)?;
                if self.stack.len() + frames.len() > self.config.max_stack_depth {
                    return Err(Trap::StackOverflow(self.config.max_stack_depth));
                }
                self.stack.extend(frames.into_iter().map(StackEntry::Frame));
                self.stats.max_depth = self.stats.max_depth.max(self.stack.len());
                Ok(top)
            }
        }
    }

    fn suspend(
        &mut self,
        frame: ActiveFrame,
        dest: LocalId,
        payload: &SuspendPayload,
    ) -> Result<ActiveFrame, Trap> {
        // Everything read from `frame` must be read before it is parked.
        let pending = match payload {
            SuspendPayload::New { effect_id, op_id, op_index, kind, args, site_order } => {
                let args = self.operands(&frame, args)?;
                PendingRequest {
                    effect_id: *effect_id,
                    op_id: *op_id,
                    op_index: *op_index,
                    kind: *kind,
                    args: Rc::from(args),
                    guard: Rc::new(TailGuard::new(*kind)),
                    site_order: *site_order,
                }
            }
            SuspendPayload::Forward(op) => {
                let original = expect_request(self.operand(&frame, op)?, "forward")?;
                PendingRequest {
                    effect_id: original.effect_id,
                    op_id: original.op_id,
                    op_index: original.op_index,
                    kind: original.kind,
                    args: Rc::clone(&original.args),
                    guard: Rc::clone(&original.guard),
                    site_order: original.site_order,
                }
            }
        };

        let Some(at) = self
            .stack
            .iter()
            .rposition(|entry| matches!(entry, StackEntry::Boundary { .. }))
        else {
            return Err(Trap::UnhandledEffect {
                effect_id: pending.effect_id,
                op_id: pending.op_id,
            });
        };

        let mut frames = Vec::with_capacity(self.stack.len() - at);
        for entry in self.stack.drain(at + 1..) {
            match entry {
                StackEntry::Frame(f) => frames.push(f),
                StackEntry::Boundary { .. } => return Err(Trap::Unreachable),
            }
        }
        frames.push(frame);
        let Some(StackEntry::Boundary { fiber, dest: resumer_dest }) = self.stack.pop() else {
            return Err(Trap::Unreachable);
        };
        let epoch = self.fibers.park(fiber, frames, dest)?;

        let request = Rc::new(EffectRequest {
            effect_id: pending.effect_id,
            op_id: pending.op_id,
            op_index: pending.op_index,
            kind: pending.kind,
            handle: self.next_handle(),
            args: pending.args,
            continuation: Rc::new(Continuation::Fiber { fiber, epoch }),
            guard: pending.guard,
            site_order: pending.site_order,
        });
        self.stats.requests += 1;
        tracing::trace!(fiber = fiber.0, epoch, effect = %request.effect_id, "suspend");

        match self.stack.pop() {
            Some(StackEntry::Frame(mut resumer)) => {
                set(&mut resumer, resumer_dest, Value::Outcome(Rc::new(Outcome::Effect(request))))?;
                Ok(resumer)
            }
            _ => Err(Trap::Unreachable),
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    // ========================================================================
    // Rvalues
    // ========================================================================

    fn operand(&self, frame: &ActiveFrame, op: &Operand) -> Result<Value, Trap> {
        match op {
            Operand::Local(local) => frame.locals.get(local.index()).cloned().ok_or_else(|| Trap::InvalidLocal {
                function: self.function_name(frame.func),
                local: local.0,
            }),
            Operand::Const(c) => Ok(match c {
                Const::Unit => Value::Unit,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(n) => Value::Int(*n),
                Const::Float(x) => Value::Float(*x),
                Const::Str(s) => Value::str(s),
                Const::NullFrame => Value::Frame(None),
            }),
        }
    }

    fn operands(&self, frame: &ActiveFrame, ops: &[Operand]) -> Result<Vec<Value>, Trap> {
        ops.iter().map(|op| self.operand(frame, op)).collect()
    }

    fn function_name(&self, func: FuncId) -> String {
        self.module
            .function(func)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| func.to_string())
    }

    fn eval(&mut self, frame: &ActiveFrame, rvalue: &Rvalue) -> Result<Value, Trap> {
        Ok(match rvalue {
            Rvalue::Use(op) => self.operand(frame, op)?,
            Rvalue::Binary(op, lhs, rhs) => binary(*op, self.operand(frame, lhs)?, self.operand(frame, rhs)?)?,
            Rvalue::Unary(op, operand) => unary(*op, self.operand(frame, operand)?)?,
            Rvalue::Tuple(items) => Value::tuple(self.operands(frame, items)?),
            Rvalue::Field(base, index) => match self.operand(frame, base)? {
                Value::Tuple(items) => items
                    .get(*index as usize)
                    .cloned()
                    .ok_or(Trap::InvalidField { index: *index, len: items.len() })?,
                other => return Err(mismatch("field access", "tuple", &other)),
            },
            Rvalue::Builtin(builtin, args) => builtin.eval(&self.operands(frame, args)?)?,
            Rvalue::FuncRef(func) => Value::Func(*func),

            Rvalue::MakeEnv { layout, fields } => {
                let expected = self
                    .module
                    .env_layout(*layout)
                    .ok_or(Trap::InvalidEnvLayout(layout.0))?
                    .fields
                    .len();
                let fields = self.operands(frame, fields)?;
                if fields.len() != expected {
                    return Err(Trap::InvalidEnvLayout(layout.0));
                }
                Value::Env(Rc::new(EnvRecord { layout: *layout, fields }))
            }
            Rvalue::EnvField(env, index) => match self.operand(frame, env)? {
                Value::Env(env) => env
                    .fields
                    .get(*index as usize)
                    .cloned()
                    .ok_or(Trap::InvalidField { index: *index, len: env.fields.len() })?,
                other => return Err(mismatch("environment access", "env", &other)),
            },

            Rvalue::OutcomeValue(op) => Value::Outcome(Rc::new(Outcome::Value(self.operand(frame, op)?))),
            Rvalue::OutcomeEffect(op) => {
                let request = expect_request(self.operand(frame, op)?, "effect outcome")?;
                Value::Outcome(Rc::new(Outcome::Effect(request)))
            }
            Rvalue::IsEffect(op) => Value::Bool(expect_outcome(self.operand(frame, op)?, "outcome test")?.is_effect()),
            Rvalue::OutcomeValueOf(op) => match &*expect_outcome(self.operand(frame, op)?, "outcome value")? {
                Outcome::Value(value) => value.clone(),
                Outcome::Effect(request) => {
                    return Err(Trap::UnhandledEffect {
                        effect_id: request.effect_id,
                        op_id: request.op_id,
                    })
                }
            },
            Rvalue::OutcomeRequest(op) => match &*expect_outcome(self.operand(frame, op)?, "outcome request")? {
                Outcome::Effect(request) => Value::Request(Rc::clone(request)),
                Outcome::Value(value) => return Err(mismatch("outcome request", "effect outcome", value)),
            },

            Rvalue::MakeRequest { effect_id, op_id, op_index, kind, args, cont, site_order } => {
                let continuation = match cont {
                    ContSpec::Identity => Continuation::Identity,
                    ContSpec::Closure { func, env } => Continuation::Closure {
                        func: *func,
                        env: self.operand(frame, env)?,
                    },
                    ContSpec::Direct => Continuation::Direct,
                };
                let args = self.operands(frame, args)?;
                self.stats.requests += 1;
                Value::Request(Rc::new(EffectRequest {
                    effect_id: *effect_id,
                    op_id: *op_id,
                    op_index: *op_index,
                    kind: *kind,
                    handle: self.next_handle(),
                    args: Rc::from(args),
                    continuation: Rc::new(continuation),
                    guard: Rc::new(TailGuard::new(*kind)),
                    site_order: *site_order,
                }))
            }
            Rvalue::WrapRequest { request, func, env, site_order } => {
                let request = expect_request(self.operand(frame, request)?, "request wrap")?;
                let env = self.operand(frame, env)?;
                Value::Request(Rc::new(EffectRequest {
                    effect_id: request.effect_id,
                    op_id: request.op_id,
                    op_index: request.op_index,
                    kind: request.kind,
                    handle: self.next_handle(),
                    args: Rc::clone(&request.args),
                    continuation: Rc::new(Continuation::Frame {
                        func: *func,
                        env,
                        inner: Rc::clone(&request.continuation),
                    }),
                    guard: Rc::clone(&request.guard),
                    site_order: *site_order,
                }))
            }
            Rvalue::RequestArg(op, index) => {
                let request = expect_request(self.operand(frame, op)?, "request argument")?;
                request
                    .args
                    .get(*index as usize)
                    .cloned()
                    .ok_or(Trap::InvalidField { index: *index, len: request.args.len() })?
            }
            Rvalue::RequestOpIndex(op) => {
                Value::Int(i64::from(expect_request(self.operand(frame, op)?, "request index")?.op_index.0))
            }
            Rvalue::RequestCont(op) => {
                Value::Cont(Rc::clone(&expect_request(self.operand(frame, op)?, "request continuation")?.continuation))
            }
            Rvalue::IsDirect(op) => Value::Bool(expect_request(self.operand(frame, op)?, "direct test")?.is_direct()),
            Rvalue::ObserveGuard(op) => {
                let request = expect_request(self.operand(frame, op)?, "guard")?;
                self.observe(&request)?;
                Value::Unit
            }

            Rvalue::PushFrame { prev, ops, clause, env } => {
                let prev = expect_frame(self.operand(frame, prev)?, "handler install")?;
                let env = self.operand(frame, env)?;
                let id = self.handlers.push(HandlerFrame {
                    prev,
                    matches: ops.clone(),
                    clause: *clause,
                    env,
                });
                Value::Frame(Some(id))
            }
            Rvalue::FramePrev(op) => Value::Frame(self.frame_of(frame, op)?.prev),
            Rvalue::FrameClause(op) => Value::Func(self.frame_of(frame, op)?.clause),
            Rvalue::FrameEnv(op) => self.frame_of(frame, op)?.env.clone(),
            Rvalue::IsFrame(op) => Value::Bool(expect_frame(self.operand(frame, op)?, "frame test")?.is_some()),
            Rvalue::FindHandler { from, stop, query } => {
                let from = expect_frame(self.operand(frame, from)?, "handler search")?;
                let stop = expect_frame(self.operand(frame, stop)?, "handler search")?;
                let (effect, op) = match query {
                    HandlerQuery::Request(op) => {
                        let request = expect_request(self.operand(frame, op)?, "handler search")?;
                        (request.effect_id, request.op_id)
                    }
                    HandlerQuery::Op { effect_id, op_id } => (*effect_id, *op_id),
                };
                Value::Frame(self.handlers.find(from, stop, effect, op)?)
            }

            Rvalue::NewFiber { func, args } => {
                let args = self.operands(frame, args)?;
                let fiber = self.fibers.spawn(*func, args);
                Value::Cont(Rc::new(Continuation::Fiber { fiber, epoch: 0 }))
            }

            Rvalue::EncodeResult { outcome, cap } => {
                let outcome = expect_outcome(self.operand(frame, outcome)?, "result encoding")?;
                let result = match &*outcome {
                    Outcome::Value(value) => EffectResult::Done(value.to_wire().map_err(Trap::MalformedPayload)?),
                    Outcome::Effect(request) => {
                        self.published.insert(request.handle, Rc::clone(request));
                        EffectResult::Pending(RequestRecord {
                            effect_id: request.effect_id,
                            op_id: request.op_id,
                            op_index: request.op_index,
                            kind: request.kind,
                            handle: request.handle,
                            args: request
                                .args
                                .iter()
                                .map(Value::to_wire)
                                .collect::<Result<_, _>>()
                                .map_err(Trap::MalformedPayload)?,
                        })
                    }
                };
                let bytes = result.encode();
                if let Some(cap) = cap {
                    let cap = self.operand(frame, cap)?;
                    let cap = cap.as_int().ok_or_else(|| mismatch("result encoding", "int", &cap))?;
                    let cap = usize::try_from(cap).unwrap_or(0);
                    if bytes.len() > cap {
                        return Err(Trap::BufferOverflow { needed: bytes.len(), cap });
                    }
                }
                Value::Bytes(Rc::from(bytes))
            }
            Rvalue::DecodeResume { request, buf, len } => {
                let request = expect_request(self.operand(frame, request)?, "resume decoding")?;
                let buf = match self.operand(frame, buf)? {
                    Value::Bytes(bytes) => bytes,
                    other => return Err(mismatch("resume decoding", "bytes", &other)),
                };
                let len = self.operand(frame, len)?;
                let len = len.as_int().ok_or_else(|| mismatch("resume decoding", "int", &len))?;
                let payload = usize::try_from(len)
                    .ok()
                    .and_then(|len| buf.get(..len))
                    .ok_or(Trap::MalformedPayload(WireError::UnexpectedEof { offset: buf.len() }))?;
                let value = WireValue::decode(payload).map_err(Trap::MalformedPayload)?;
                let schema = self.schema.get(request.op_index).ok_or_else(|| {
                    Trap::MalformedPayload(WireError::InvalidSchema(format!(
                        "no schema for operation {}",
                        request.op_index
                    )))
                })?;
                schema.ret.check(&value).map_err(Trap::MalformedPayload)?;
                Value::from_wire(&value)
            }
        })
    }

    fn frame_of(&self, frame: &ActiveFrame, op: &Operand) -> Result<&HandlerFrame, Trap> {
        match expect_frame(self.operand(frame, op)?, "frame access")? {
            Some(id) => self.handlers.get(id),
            None => Err(Trap::TypeMismatch {
                context: "frame access",
                expected: "frame",
                found: "null frame",
            }),
        }
    }
}

struct PendingRequest {
    effect_id: crate::abi::EffectId,
    op_id: crate::abi::OpId,
    op_index: crate::abi::OpIndex,
    kind: crate::abi::ResumptionKind,
    args: Rc<[Value]>,
    guard: Rc<TailGuard>,
    site_order: u32,
}

fn jump(frame: &mut ActiveFrame, target: BlockId) {
    frame.block = target;
    frame.ip = 0;
}

fn set(frame: &mut ActiveFrame, local: LocalId, value: Value) -> Result<(), Trap> {
    match frame.locals.get_mut(local.index()) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(Trap::InvalidLocal {
            function: frame.func.to_string(),
            local: local.0,
        }),
    }
}

fn mismatch(context: &'static str, expected: &'static str, found: &Value) -> Trap {
    Trap::TypeMismatch {
        context,
        expected,
        found: found.type_name(),
    }
}

fn expect_request(value: Value, context: &'static str) -> Result<Rc<EffectRequest>, Trap> {
    match value {
        Value::Request(request) => Ok(request),
        other => Err(mismatch(context, "request", &other)),
    }
}

fn expect_outcome(value: Value, context: &'static str) -> Result<Rc<Outcome>, Trap> {
    match value {
        Value::Outcome(outcome) => Ok(outcome),
        other => Err(mismatch(context, "outcome", &other)),
    }
}

fn expect_frame(value: Value, context: &'static str) -> Result<Option<FrameId>, Trap> {
    match value {
        Value::Frame(frame) => Ok(frame),
        other => Err(mismatch(context, "frame", &other)),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, Trap> {
    use BinOp::*;
    Ok(match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                Add => Value::Int(a.checked_add(b).ok_or(Trap::IntegerOverflow)?),
                Sub => Value::Int(a.checked_sub(b).ok_or(Trap::IntegerOverflow)?),
                Mul => Value::Int(a.checked_mul(b).ok_or(Trap::IntegerOverflow)?),
                Div | Rem if b == 0 => return Err(Trap::DivisionByZero),
                Div => Value::Int(a.checked_div(b).ok_or(Trap::IntegerOverflow)?),
                Rem => Value::Int(a.checked_rem(b).ok_or(Trap::IntegerOverflow)?),
                Eq => Value::Bool(a == b),
                Ne => Value::Bool(a != b),
                Lt => Value::Bool(a < b),
                Le => Value::Bool(a <= b),
                Gt => Value::Bool(a > b),
                Ge => Value::Bool(a >= b),
                And | Or => return Err(mismatch("logical operator", "bool", &lhs)),
            }
        }
        (Value::Float(a), Value::Float(b)) => {
            let (a, b) = (*a, *b);
            match op {
                Add => Value::Float(a + b),
                Sub => Value::Float(a - b),
                Mul => Value::Float(a * b),
                Div => Value::Float(a / b),
                Rem => Value::Float(a % b),
                Eq => Value::Bool(a == b),
                Ne => Value::Bool(a != b),
                Lt => Value::Bool(a < b),
                Le => Value::Bool(a <= b),
                Gt => Value::Bool(a > b),
                Ge => Value::Bool(a >= b),
                And | Or => return Err(mismatch("logical operator", "bool", &lhs)),
            }
        }
        (Value::Bool(a), Value::Bool(b)) => match op {
            And => Value::Bool(*a && *b),
            Or => Value::Bool(*a || *b),
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            _ => return Err(mismatch("arithmetic", "int", &lhs)),
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            Lt => Value::Bool(a < b),
            Le => Value::Bool(a <= b),
            Gt => Value::Bool(a > b),
            Ge => Value::Bool(a >= b),
            _ => return Err(mismatch("arithmetic", "int", &lhs)),
        },
        (Value::Unit, Value::Unit) => match op {
            Eq => Value::Bool(true),
            Ne => Value::Bool(false),
            _ => return Err(mismatch("arithmetic", "int", &lhs)),
        },
        // Handler scopes compare frame identities.
        (Value::Frame(a), Value::Frame(b)) => match op {
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            _ => return Err(mismatch("arithmetic", "int", &lhs)),
        },
        _ => return Err(mismatch("binary operator", lhs.type_name(), &rhs)),
    })
}

fn unary(op: UnOp, operand: Value) -> Result<Value, Trap> {
    Ok(match (op, &operand) {
        (UnOp::Neg, Value::Int(n)) => Value::Int(n.checked_neg().ok_or(Trap::IntegerOverflow)?),
        (UnOp::Neg, Value::Float(x)) => Value::Float(-x),
        (UnOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (UnOp::Neg, other) => return Err(mismatch("negation", "int", other)),
        (UnOp::Not, other) => return Err(mismatch("logical not", "bool", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{EffectId, OpId, OpIndex, ResumptionKind};
    use crate::artifact::{Block, Function};

    fn local(n: u32) -> Operand {
        Operand::Local(LocalId(n))
    }

    fn int(n: i64) -> Operand {
        Operand::Const(Const::Int(n))
    }

    fn machine(functions: Vec<Function>) -> Machine {
        let module = Module { functions, ..Default::default() };
        Machine::new(Rc::new(module), Rc::new(WireSchema::default()), MachineConfig::default())
    }

    fn single_block(name: &str, params: u32, locals: u32, insts: Vec<Inst>, ret: Operand) -> Function {
        Function {
            name: name.into(),
            params,
            locals,
            blocks: vec![Block { insts, term: Terminator::Return(ret) }],
        }
    }

    #[test]
    fn test_direct_call_and_arithmetic() {
        let double = single_block(
            "double",
            1,
            2,
            vec![Inst::Assign { dest: LocalId(1), value: Rvalue::Binary(BinOp::Mul, local(0), int(2)) }],
            local(1),
        );
        let main = single_block(
            "main",
            0,
            1,
            vec![Inst::Call { dest: LocalId(0), callee: Callee::Direct(FuncId(0)), args: vec![int(21)] }],
            local(0),
        );
        let mut vm = machine(vec![double, main]);
        assert_eq!(vm.call(FuncId(1), Vec::new()).unwrap(), Value::Int(42));
        assert_eq!(vm.stats().calls, 2);
    }

    #[test]
    fn test_branch_loop() {
        // sum 1..=5 with a loop
        let f = Function {
            name: "sum".into(),
            params: 0,
            locals: 3,
            blocks: vec![
                Block {
                    insts: vec![
                        Inst::Assign { dest: LocalId(0), value: Rvalue::Use(int(0)) },
                        Inst::Assign { dest: LocalId(1), value: Rvalue::Use(int(1)) },
                    ],
                    term: Terminator::Goto(BlockId(1)),
                },
                Block {
                    insts: vec![Inst::Assign { dest: LocalId(2), value: Rvalue::Binary(BinOp::Le, local(1), int(5)) }],
                    term: Terminator::Branch { cond: local(2), then_block: BlockId(2), else_block: BlockId(3) },
                },
                Block {
                    insts: vec![
                        Inst::Assign { dest: LocalId(0), value: Rvalue::Binary(BinOp::Add, local(0), local(1)) },
                        Inst::Assign { dest: LocalId(1), value: Rvalue::Binary(BinOp::Add, local(1), int(1)) },
                    ],
                    term: Terminator::Goto(BlockId(1)),
                },
                Block { insts: Vec::new(), term: Terminator::Return(local(0)) },
            ],
        };
        let mut vm = machine(vec![f]);
        assert_eq!(vm.call(FuncId(0), Vec::new()).unwrap(), Value::Int(15));
    }

    #[test]
    fn test_division_by_zero_traps() {
        let f = single_block(
            "div",
            0,
            1,
            vec![Inst::Assign { dest: LocalId(0), value: Rvalue::Binary(BinOp::Div, int(1), int(0)) }],
            local(0),
        );
        assert_eq!(machine(vec![f]).call(FuncId(0), Vec::new()), Err(Trap::DivisionByZero));
    }

    #[test]
    fn test_stack_overflow_traps() {
        let f = single_block(
            "forever",
            0,
            1,
            vec![Inst::Call { dest: LocalId(0), callee: Callee::Direct(FuncId(0)), args: Vec::new() }],
            local(0),
        );
        let mut vm = machine(vec![f]);
        assert_eq!(vm.call(FuncId(0), Vec::new()), Err(Trap::StackOverflow(4096)));
    }

    fn tail_request(cont: ContSpec) -> Rvalue {
        Rvalue::MakeRequest {
            effect_id: EffectId::of("Log"),
            op_id: OpId(0),
            op_index: OpIndex(0),
            kind: ResumptionKind::Tail,
            args: Vec::new(),
            cont,
            site_order: 0,
        }
    }

    #[test]
    fn test_guarded_resume_traps_on_second_use() {
        // main: r = request(identity); o1 = resume r 1; o2 = resume r 2
        let main = single_block(
            "main",
            0,
            3,
            vec![
                Inst::Assign { dest: LocalId(0), value: tail_request(ContSpec::Identity) },
                Inst::Call { dest: LocalId(1), callee: Callee::Resume(local(0)), args: vec![int(1)] },
                Inst::Call { dest: LocalId(2), callee: Callee::Resume(local(0)), args: vec![int(2)] },
            ],
            local(2),
        );
        let err = machine(vec![main]).call(FuncId(0), Vec::new()).unwrap_err();
        assert!(matches!(err, Trap::TailGuardViolation { expected: 1, attempted: 2, .. }));
    }

    #[test]
    fn test_closure_continuation_receives_env_and_value() {
        // reentry(env, v) = OutcomeValue(env.0 + v)
        let reentry = single_block(
            "reentry",
            2,
            4,
            vec![
                Inst::Assign { dest: LocalId(2), value: Rvalue::EnvField(local(0), 0) },
                Inst::Assign { dest: LocalId(3), value: Rvalue::Binary(BinOp::Add, local(2), local(1)) },
                Inst::Assign { dest: LocalId(3), value: Rvalue::OutcomeValue(local(3)) },
            ],
            local(3),
        );
        let main = single_block(
            "main",
            0,
            4,
            vec![
                Inst::Assign {
                    dest: LocalId(0),
                    value: Rvalue::MakeEnv { layout: crate::artifact::EnvLayoutId(0), fields: vec![int(40)] },
                },
                Inst::Assign {
                    dest: LocalId(1),
                    value: Rvalue::MakeRequest {
                        effect_id: EffectId::of("Async"),
                        op_id: OpId(0),
                        op_index: OpIndex(0),
                        kind: ResumptionKind::Resume,
                        args: Vec::new(),
                        cont: ContSpec::Closure { func: FuncId(0), env: local(0) },
                        site_order: 0,
                    },
                },
                Inst::Call { dest: LocalId(2), callee: Callee::Resume(local(1)), args: vec![int(2)] },
                Inst::Call { dest: LocalId(3), callee: Callee::Resume(local(1)), args: vec![int(5)] },
                Inst::Assign { dest: LocalId(2), value: Rvalue::OutcomeValueOf(local(2)) },
                Inst::Assign { dest: LocalId(3), value: Rvalue::OutcomeValueOf(local(3)) },
                Inst::Assign { dest: LocalId(0), value: Rvalue::Tuple(vec![local(2), local(3)]) },
            ],
            local(0),
        );
        let module = Module {
            functions: vec![reentry, main],
            env_layouts: vec![crate::artifact::EnvLayout {
                name: "env".into(),
                fields: vec![crate::artifact::EnvFieldLayout {
                    name: "x".into(),
                    source: crate::artifact::FieldSource::Local,
                    val_type: crate::artifact::ValType::I64,
                }],
            }],
            ..Default::default()
        };
        let mut vm = Machine::new(Rc::new(module), Rc::new(WireSchema::default()), MachineConfig::default());
        assert_eq!(
            vm.call(FuncId(1), Vec::new()).unwrap(),
            Value::tuple(vec![Value::Int(42), Value::Int(45)])
        );
        assert_eq!(vm.stats().resumptions, 2);
    }

    #[test]
    fn test_suspend_without_boundary_is_unhandled() {
        let main = single_block(
            "main",
            0,
            1,
            vec![Inst::Suspend {
                dest: LocalId(0),
                payload: SuspendPayload::New {
                    effect_id: EffectId::of("Async"),
                    op_id: OpId(0),
                    op_index: OpIndex(0),
                    kind: ResumptionKind::Resume,
                    args: Vec::new(),
                    site_order: 0,
                },
            }],
            local(0),
        );
        assert!(matches!(
            machine(vec![main]).call(FuncId(0), Vec::new()),
            Err(Trap::UnhandledEffect { .. })
        ));
    }

    #[test]
    fn test_fiber_suspend_and_resume() {
        // body(): v = suspend Async.await; return v + 1
        let body = single_block(
            "body",
            0,
            2,
            vec![
                Inst::Suspend {
                    dest: LocalId(0),
                    payload: SuspendPayload::New {
                        effect_id: EffectId::of("Async"),
                        op_id: OpId(0),
                        op_index: OpIndex(0),
                        kind: ResumptionKind::Resume,
                        args: Vec::new(),
                        site_order: 0,
                    },
                },
                Inst::Assign { dest: LocalId(1), value: Rvalue::Binary(BinOp::Add, local(0), int(1)) },
            ],
            local(1),
        );
        // main(): k = fiber(body); o = k(()); r = request(o); o2 = resume r 41; return value(o2)
        let main = single_block(
            "main",
            0,
            4,
            vec![
                Inst::Assign { dest: LocalId(0), value: Rvalue::NewFiber { func: FuncId(0), args: Vec::new() } },
                Inst::Call {
                    dest: LocalId(1),
                    callee: Callee::Continuation(local(0)),
                    args: vec![Operand::Const(Const::Unit)],
                },
                Inst::Assign { dest: LocalId(2), value: Rvalue::OutcomeRequest(local(1)) },
                Inst::Call { dest: LocalId(3), callee: Callee::Resume(local(2)), args: vec![int(41)] },
                Inst::Assign { dest: LocalId(3), value: Rvalue::OutcomeValueOf(local(3)) },
            ],
            local(3),
        );
        let mut vm = machine(vec![body, main]);
        assert_eq!(vm.call(FuncId(1), Vec::new()).unwrap(), Value::Int(42));
        assert_eq!(vm.stats().fiber_switches, 2);
    }

    #[test]
    fn test_fiber_resumed_twice_traps() {
        let body = single_block(
            "body",
            0,
            1,
            vec![Inst::Suspend {
                dest: LocalId(0),
                payload: SuspendPayload::New {
                    effect_id: EffectId::of("Async"),
                    op_id: OpId(0),
                    op_index: OpIndex(0),
                    kind: ResumptionKind::Resume,
                    args: Vec::new(),
                    site_order: 0,
                },
            }],
            local(0),
        );
        let main = single_block(
            "main",
            0,
            4,
            vec![
                Inst::Assign { dest: LocalId(0), value: Rvalue::NewFiber { func: FuncId(0), args: Vec::new() } },
                Inst::Call {
                    dest: LocalId(1),
                    callee: Callee::Continuation(local(0)),
                    args: vec![Operand::Const(Const::Unit)],
                },
                Inst::Assign { dest: LocalId(2), value: Rvalue::OutcomeRequest(local(1)) },
                Inst::Call { dest: LocalId(3), callee: Callee::Resume(local(2)), args: vec![int(1)] },
                Inst::Call { dest: LocalId(3), callee: Callee::Resume(local(2)), args: vec![int(2)] },
            ],
            local(3),
        );
        assert_eq!(
            machine(vec![body, main]).call(FuncId(1), Vec::new()),
            Err(Trap::ContinuationConsumed { fiber: 0 })
        );
    }

    #[test]
    fn test_missing_clause_names_function() {
        let clause = Function {
            name: "main$c0".into(),
            params: 0,
            locals: 0,
            blocks: vec![Block { insts: Vec::new(), term: Terminator::Trap(TrapCode::NoMatchingClause) }],
        };
        let err = machine(vec![clause]).call(FuncId(0), Vec::new()).unwrap_err();
        assert_eq!(err, Trap::NoMatchingClause { function: "main$c0".into() });
        assert_eq!(err.to_string(), "no handler clause of `main$c0` matches the request");
    }

    #[test]
    fn test_collect_frees_unreachable_frames() {
        let push = |prev: Operand| Rvalue::PushFrame {
            prev,
            ops: vec![(EffectId::of("Log"), OpId(0))],
            clause: FuncId(0),
            env: Operand::Const(Const::Unit),
        };
        let main = single_block(
            "main",
            0,
            2,
            vec![
                Inst::Assign { dest: LocalId(0), value: push(Operand::Const(Const::NullFrame)) },
                Inst::Assign { dest: LocalId(1), value: push(local(0)) },
            ],
            int(0),
        );
        let mut vm = machine(vec![main]);
        vm.call(FuncId(0), Vec::new()).unwrap();
        assert_eq!(vm.handlers().len(), 2);
        assert_eq!(vm.collect(), (2, 0));
        assert!(vm.handlers().is_empty());

        vm.call(FuncId(0), Vec::new()).unwrap();
        assert_eq!(vm.handlers().capacity(), 2);
        assert!(!vm.release(1));
    }

    #[test]
    fn test_direct_request_cannot_be_resumed() {
        let main = single_block(
            "main",
            0,
            2,
            vec![
                Inst::Assign { dest: LocalId(0), value: tail_request(ContSpec::Direct) },
                Inst::Call { dest: LocalId(1), callee: Callee::Resume(local(0)), args: vec![int(1)] },
            ],
            local(1),
        );
        assert_eq!(machine(vec![main]).call(FuncId(0), Vec::new()), Err(Trap::DirectResume));
    }
}
