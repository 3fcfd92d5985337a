//! # Host Run Scheduler
//!
//! Cooperative scheduler driving independent runs of one loaded artifact.
//!
//! ## Design
//!
//! Each run owns a [`Session`] and moves through
//!
//! ```text
//! Ready ──advance──► Waiting ──completion──► Ready ... ──► Terminal
//! ```
//!
//! - A `Ready` run has a pending step (start, or resume with a value).
//!   [`Scheduler::tick`] advances at most `tick_budget` ready runs.
//! - Advancing calls into the module until it finishes or suspends on a host
//!   request. The request is handed to the registered handler and the run
//!   waits on that request's handle.
//! - Handlers complete through a `crossbeam-channel` queue, possibly from
//!   other threads. Only the first completion for the handle a run waits on
//!   is applied; anything else (late, duplicated, or addressed to a
//!   cancelled run) is dropped.
//!
//! Sessions hold `Rc` state, so the scheduler itself stays on one thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::adapters::{Completion, HandlerRegistry, HostContinuation, HostHandler, Resolution};
use crate::abi::{EffectId, OpId};
use crate::config::RuntimeConfig;
use crate::error::HostError;
use crate::session::{Instance, Session, Step};
use crate::wire::WireValue;

/// Identifier of a run within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run{}", self.0)
    }
}

/// Coarse run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ready,
    Waiting,
    Terminal,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(WireValue),
    Failed(HostError),
    Cancelled,
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Runs advanced during this tick.
    pub processed: usize,
    /// Runs still ready after the tick.
    pub remaining_ready: usize,
    /// Runs waiting on a host completion.
    pub waiting: usize,
}

enum Pending {
    Start { export: String, args: Vec<WireValue> },
    Resume { handle: u64, value: WireValue },
}

enum RunState {
    Ready(Pending),
    Waiting { handle: u64 },
    Terminal(RunOutcome),
}

struct Run {
    session: Session,
    state: RunState,
}

impl Run {
    /// Enter a terminal state, dropping the run's machine state.
    fn finish(&mut self, outcome: RunOutcome) {
        self.session.close();
        self.state = RunState::Terminal(outcome);
    }

    fn status(&self) -> RunStatus {
        match self.state {
            RunState::Ready(_) => RunStatus::Ready,
            RunState::Waiting { .. } => RunStatus::Waiting,
            RunState::Terminal(_) => RunStatus::Terminal,
        }
    }
}

/// Scheduler for the runs of one instance.
pub struct Scheduler {
    instance: Instance,
    config: RuntimeConfig,
    handlers: HandlerRegistry,
    runs: HashMap<RunId, Run>,
    ready: VecDeque<RunId>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    next_id: u64,
}

impl Scheduler {
    pub fn new(instance: Instance, config: RuntimeConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handlers = HandlerRegistry::new(instance.table().clone());
        Self {
            instance,
            config,
            handlers,
            runs: HashMap::new(),
            ready: VecDeque::new(),
            sender,
            receiver,
            next_id: 1,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn register_handler(
        &mut self,
        effect_id: EffectId,
        op_id: OpId,
        signature_hash: u32,
        handler: Arc<dyn HostHandler>,
    ) -> Result<(), HostError> {
        self.handlers.register(effect_id, op_id, signature_hash, handler)
    }

    /// Register every operation of `handler` declared by the artifact.
    pub fn install(&mut self, handler: Arc<dyn HostHandler>) -> Result<usize, HostError> {
        self.handlers.install(handler)
    }

    /// Queue a new run of `export`.
    pub fn spawn(&mut self, export: &str, args: Vec<WireValue>) -> Result<RunId, HostError> {
        if self.instance.module().export(export).is_none() {
            return Err(HostError::UnknownExport(export.to_string()));
        }
        let max = self.config.scheduler.max_runs;
        if max > 0 && self.live_runs() >= max {
            return Err(HostError::RunLimitReached(max));
        }
        let id = RunId(self.next_id);
        self.next_id += 1;
        let session = self.instance.session(self.config.machine.clone());
        self.runs.insert(
            id,
            Run {
                session,
                state: RunState::Ready(Pending::Start { export: export.to_string(), args }),
            },
        );
        self.ready.push_back(id);
        tracing::debug!(run = %id, export, "spawned run");
        Ok(id)
    }

    pub fn status(&self, run: RunId) -> Option<RunStatus> {
        self.runs.get(&run).map(Run::status)
    }

    pub fn outcome(&self, run: RunId) -> Option<&RunOutcome> {
        match &self.runs.get(&run)?.state {
            RunState::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Handle the run is waiting on, if it is waiting.
    pub fn pending_handle(&self, run: RunId) -> Option<u64> {
        match self.runs.get(&run)?.state {
            RunState::Waiting { handle } => Some(handle),
            _ => None,
        }
    }

    /// Finalize a non-terminal run as cancelled. An in-flight host call is
    /// not interrupted, but its completion will be ignored.
    pub fn cancel(&mut self, run: RunId) -> bool {
        let Some(entry) = self.runs.get_mut(&run) else {
            return false;
        };
        if entry.status() == RunStatus::Terminal {
            return false;
        }
        entry.finish(RunOutcome::Cancelled);
        self.ready.retain(|id| *id != run);
        tracing::info!(run = %run, "run cancelled");
        true
    }

    /// Apply queued completions, then advance up to `tick_budget` ready runs.
    pub fn tick(&mut self) -> TickReport {
        while let Ok(completion) = self.receiver.try_recv() {
            self.apply(completion);
        }

        let mut processed = 0;
        while processed < self.config.scheduler.tick_budget {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            self.advance(id);
            processed += 1;
        }

        let report = TickReport {
            processed,
            remaining_ready: self.ready.len(),
            waiting: self.count(RunStatus::Waiting),
        };
        tracing::trace!(?report, "tick");
        report
    }

    /// Block until one completion arrives, and apply it. Returns `false` on
    /// timeout.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => {
                self.apply(completion);
                true
            }
            // The scheduler holds a sender, so the channel never disconnects.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Tick until `run` is terminal, waiting up to `timeout` for each host
    /// completion. Returns `None` if a wait timed out.
    pub fn run_to_completion(&mut self, run: RunId, timeout: Duration) -> Option<RunOutcome> {
        loop {
            if let Some(outcome) = self.outcome(run) {
                return Some(outcome.clone());
            }
            self.status(run)?;
            let report = self.tick();
            if self.outcome(run).is_none()
                && report.remaining_ready == 0
                && report.waiting > 0
                && self.receiver.is_empty()
                && !self.wait_for_completion(timeout)
            {
                return None;
            }
        }
    }

    /// Tick until no run is ready or waiting.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        loop {
            let report = self.tick();
            if report.remaining_ready == 0 && report.waiting == 0 && self.receiver.is_empty() {
                return true;
            }
            if report.remaining_ready == 0
                && self.receiver.is_empty()
                && !self.wait_for_completion(timeout)
            {
                return false;
            }
        }
    }

    pub fn live_runs(&self) -> usize {
        self.runs.len() - self.count(RunStatus::Terminal)
    }

    fn count(&self, status: RunStatus) -> usize {
        self.runs.values().filter(|r| r.status() == status).count()
    }

    fn apply(&mut self, completion: Completion) {
        let Some(run) = self.runs.get_mut(&completion.run) else {
            tracing::debug!(run = %completion.run, "completion for unknown run dropped");
            return;
        };
        match run.state {
            RunState::Waiting { handle } if handle == completion.handle => {}
            _ => {
                tracing::debug!(
                    run = %completion.run,
                    handle = completion.handle,
                    "stale completion dropped"
                );
                return;
            }
        }
        match completion.resolution {
            Resolution::Resume(value) => {
                self.ready.push_back(completion.run);
                run.state = RunState::Ready(Pending::Resume { handle: completion.handle, value });
            }
            Resolution::End(value) => {
                tracing::info!(run = %completion.run, "run ended by host");
                run.finish(RunOutcome::Completed(value));
            }
            Resolution::Reject(error) => {
                tracing::warn!(run = %completion.run, error = %error, "host request rejected");
                run.finish(RunOutcome::Failed(error));
            }
        }
    }

    fn advance(&mut self, id: RunId) {
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        let pending = match std::mem::replace(&mut run.state, RunState::Waiting { handle: 0 }) {
            RunState::Ready(pending) => pending,
            other => {
                run.state = other;
                return;
            }
        };
        let result = match &pending {
            Pending::Start { export, args } => run.session.start(export, args.clone()),
            Pending::Resume { handle, value } => {
                let result = run.session.resume(*handle, value);
                // Only the first completion of a handle is ever applied.
                run.session.release(*handle);
                result
            }
        };

        let request = match result {
            Ok(Step::Done(value)) => {
                tracing::info!(run = %id, "run completed");
                run.finish(RunOutcome::Completed(value));
                return;
            }
            Ok(Step::Pending(request)) => request,
            Err(error) => {
                tracing::warn!(run = %id, error = %error, "run failed");
                run.finish(RunOutcome::Failed(error));
                return;
            }
        };

        let Some(handler) = self.handlers.get(request.effect_id, request.op_id) else {
            let error = HostError::MissingHostModule {
                effect: request.effect_name.clone(),
                op: request.op_name.clone(),
            };
            tracing::warn!(run = %id, error = %error, "no host handler");
            run.finish(RunOutcome::Failed(error));
            return;
        };

        run.state = RunState::Waiting { handle: request.handle };
        tracing::debug!(run = %id, op = %request.qualified_name(), handle = request.handle, "run waiting");
        handler.handle(&request, HostContinuation::new(id, &request, self.sender.clone()));
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("runs", &self.runs.len())
            .field("ready", &self.ready.len())
            .field("handlers", &self.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{EFFECT_TABLE_SECTION, RESUME_CONTINUATION, RESUME_EFFECTFUL, WIRE_SCHEMA_SECTION};
    use crate::artifact::{
        Block, Const, CustomSection, Export, FuncId, Function, Inst, LocalId, Module, Operand, Rvalue, Terminator,
    };
    use crate::effect_table::EffectTable;
    use crate::wire::WireSchema;

    /// An artifact whose only export, `seven`, completes with 7.
    fn seven() -> Instance {
        let entry = Function {
            name: "seven_effectful".into(),
            params: 0,
            locals: 2,
            blocks: vec![Block {
                insts: vec![
                    Inst::Assign { dest: LocalId(0), value: Rvalue::OutcomeValue(Operand::Const(Const::Int(7))) },
                    Inst::Assign {
                        dest: LocalId(1),
                        value: Rvalue::EncodeResult { outcome: Operand::Local(LocalId(0)), cap: None },
                    },
                ],
                term: Terminator::Return(Operand::Local(LocalId(1))),
            }],
        };
        let module = Module {
            functions: vec![
                Function { name: RESUME_CONTINUATION.into(), ..Default::default() },
                Function { name: RESUME_EFFECTFUL.into(), ..Default::default() },
                entry,
            ],
            exports: vec![Export { name: "seven".into(), entry: FuncId(2), params: 0 }],
            sections: vec![
                CustomSection { name: EFFECT_TABLE_SECTION.into(), bytes: EffectTable::default().encode() },
                CustomSection { name: WIRE_SCHEMA_SECTION.into(), bytes: WireSchema::default().encode() },
            ],
            ..Default::default()
        };
        Instance::load(module).unwrap()
    }

    #[test]
    fn test_tick_advances_at_most_budget() {
        let config = RuntimeConfig::builder().tick_budget(2).build().unwrap();
        let mut sched = Scheduler::new(seven(), config);
        let runs: Vec<_> = (0..3).map(|_| sched.spawn("seven", Vec::new()).unwrap()).collect();

        let report = sched.tick();
        assert_eq!(report.processed, 2);
        assert_eq!(report.remaining_ready, 1);
        assert_eq!(sched.status(runs[2]), Some(RunStatus::Ready));

        let report = sched.tick();
        assert_eq!(report.processed, 1);
        for run in runs {
            assert_eq!(sched.outcome(run), Some(&RunOutcome::Completed(WireValue::Int(7))));
        }
        assert_eq!(sched.live_runs(), 0);
    }

    #[test]
    fn test_cancelled_run_drops_completion() {
        let mut sched = Scheduler::new(seven(), RuntimeConfig::default());
        let run = sched.spawn("seven", Vec::new()).unwrap();
        assert!(sched.cancel(run));

        sched
            .sender
            .send(Completion { run, handle: 0, resolution: Resolution::Resume(WireValue::Int(1)) })
            .unwrap();
        let report = sched.tick();
        assert_eq!(report.processed, 0);
        assert_eq!(sched.outcome(run), Some(&RunOutcome::Cancelled));
        assert!(!sched.cancel(run));
    }

    #[test]
    fn test_run_id_display() {
        assert_eq!(RunId(4).to_string(), "run4");
    }

    #[test]
    fn test_tick_report_default_is_idle() {
        let report = TickReport::default();
        assert_eq!(report.processed, 0);
        assert_eq!(report.remaining_ready, 0);
        assert_eq!(report.waiting, 0);
    }
}
