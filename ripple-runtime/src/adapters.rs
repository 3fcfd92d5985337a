//! # Host Adapters
//!
//! Host-side implementations of effect operations.
//!
//! A [`HostHandler`] services the operations of one effect. Handlers are
//! registered in a [`HandlerRegistry`] keyed by `(EffectId, OpId)`; every
//! registration is checked against the loaded effect table, including the
//! signature hash, so a handler written against a different declaration of
//! the operation is refused up front.
//!
//! A handler receives the decoded request and a [`HostContinuation`]. It may
//! complete synchronously or move the continuation to another thread and
//! complete later; completions travel to the scheduler over a channel.
//!
//! ## Reference Adapters
//!
//! | Adapter | Effect | Operations | Completes |
//! |---------|--------|------------|-----------|
//! | [`LogAdapter`] | `Log` | `info(str)->unit`, `warn(str)->unit` | synchronously, `tail` |
//! | [`ClockAdapter`] | `Clock` | `now()->int` | synchronously, `tail` |
//! | [`TimerAdapter`] | `Timer` | `sleep(int)->unit` | on a helper thread, `resume` |
//! | [`FetchAdapter`] | `Fetch` | `get(str)->str` | rejects: not finalized |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;

use crate::abi::{canonical_signature, signature_hash, EffectId, OpId, ResumptionKind};
use crate::effect_table::EffectTable;
use crate::error::HostError;
use crate::scheduler::RunId;
use crate::session::HostRequest;
use crate::wire::{WireShape, WireValue};

// ============================================================================
// Handler contract
// ============================================================================

/// Declared shape of an operation a handler services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    pub name: &'static str,
    pub params: Vec<WireShape>,
    pub ret: WireShape,
}

impl OperationSpec {
    pub fn new(name: &'static str, params: Vec<WireShape>, ret: WireShape) -> Self {
        Self { name, params, ret }
    }

    pub fn signature(&self) -> String {
        canonical_signature(self.name, &self.params, &self.ret)
    }

    pub fn signature_hash(&self) -> u32 {
        signature_hash(&self.signature())
    }
}

/// Host implementation of one effect.
pub trait HostHandler: Send + Sync {
    /// Fully-qualified name of the serviced effect.
    fn effect(&self) -> &str;

    fn operations(&self) -> Vec<OperationSpec>;

    /// Whether the host can actually service this effect. Unsupported
    /// handlers still register, so the capability report can name them.
    fn supported(&self) -> bool {
        true
    }

    fn handle(&self, request: &HostRequest, continuation: HostContinuation);
}

/// How a host request was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Resume the continuation with a value.
    Resume(WireValue),
    /// Finish the run with a value without resuming.
    End(WireValue),
    /// Fail the run.
    Reject(HostError),
}

/// A resolution addressed to one pending request of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub run: RunId,
    pub handle: u64,
    pub resolution: Resolution,
}

/// The host's handle on a suspended run.
///
/// Consumed by exactly one of [`resume`](Self::resume),
/// [`tail`](Self::tail), [`end`](Self::end) or [`reject`](Self::reject).
/// Dropping it unanswered rejects the run with
/// [`HostError::ContinuationDropped`].
pub struct HostContinuation {
    run: RunId,
    handle: u64,
    kind: ResumptionKind,
    operation: String,
    sender: Sender<Completion>,
    answered: bool,
}

impl HostContinuation {
    pub(crate) fn new(run: RunId, request: &HostRequest, sender: Sender<Completion>) -> Self {
        Self {
            run,
            handle: request.handle,
            kind: request.kind,
            operation: request.qualified_name(),
            sender,
            answered: false,
        }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn kind(&self) -> ResumptionKind {
        self.kind
    }

    pub fn resume(self, value: WireValue) {
        self.send(Resolution::Resume(value));
    }

    /// Resume a `tail` operation. Equivalent to `resume` on the wire.
    pub fn tail(self, value: WireValue) {
        self.send(Resolution::Resume(value));
    }

    /// Complete the run with `value` without resuming. Only `resume`
    /// operations may end a run.
    pub fn end(self, value: WireValue) -> Result<(), HostError> {
        if self.kind == ResumptionKind::Tail {
            let (effect, op) = split_operation(&self.operation);
            let error = HostError::TailCannotEnd { effect, op };
            self.send(Resolution::Reject(error.clone()));
            return Err(error);
        }
        self.send(Resolution::End(value));
        Ok(())
    }

    pub fn reject(self, error: HostError) {
        self.send(Resolution::Reject(error));
    }

    fn send(mut self, resolution: Resolution) {
        self.answered = true;
        self.deliver(resolution);
    }

    fn deliver(&self, resolution: Resolution) {
        let completion = Completion {
            run: self.run,
            handle: self.handle,
            resolution,
        };
        if self.sender.send(completion).is_err() {
            tracing::debug!(run = %self.run, handle = self.handle, "scheduler gone, completion dropped");
        }
    }
}

impl Drop for HostContinuation {
    fn drop(&mut self) {
        if !self.answered {
            tracing::warn!(run = %self.run, op = %self.operation, "continuation dropped unanswered");
            self.deliver(Resolution::Reject(HostError::ContinuationDropped(self.operation.clone())));
        }
    }
}

impl fmt::Debug for HostContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContinuation")
            .field("run", &self.run)
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("operation", &self.operation)
            .finish()
    }
}

fn split_operation(qualified: &str) -> (String, String) {
    match qualified.rsplit_once('.') {
        Some((effect, op)) => (effect.to_string(), op.to_string()),
        None => (qualified.to_string(), String::new()),
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Registration {
    handler: Arc<dyn HostHandler>,
}

/// Handlers of one loaded artifact, keyed by operation identity.
pub struct HandlerRegistry {
    table: EffectTable,
    handlers: HashMap<(EffectId, OpId), Registration>,
}

impl HandlerRegistry {
    pub fn new(table: EffectTable) -> Self {
        Self {
            table,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for one operation.
    pub fn register(
        &mut self,
        effect_id: EffectId,
        op_id: OpId,
        signature_hash: u32,
        handler: Arc<dyn HostHandler>,
    ) -> Result<(), HostError> {
        let entry = self
            .table
            .lookup(effect_id, op_id)
            .ok_or(HostError::UnknownOperation { effect_id, op_id })?;
        if entry.signature_hash != signature_hash {
            return Err(HostError::SignatureMismatch {
                effect: entry.effect_name.clone(),
                op: entry.label.clone(),
                expected: entry.signature_hash,
                found: signature_hash,
            });
        }
        tracing::debug!(
            effect = %entry.effect_name,
            op = %entry.label,
            supported = handler.supported(),
            "registered host handler"
        );
        self.handlers.insert((effect_id, op_id), Registration { handler });
        Ok(())
    }

    /// Register every operation `handler` declares that the artifact also
    /// declares. Returns the number of operations registered.
    pub fn install(&mut self, handler: Arc<dyn HostHandler>) -> Result<usize, HostError> {
        let effect_id = EffectId::of(handler.effect());
        let mut installed = 0;
        for spec in handler.operations() {
            let Some(entry) = self.table.by_name(effect_id, spec.name) else {
                continue;
            };
            let op_id = entry.op_id;
            self.register(effect_id, op_id, spec.signature_hash(), Arc::clone(&handler))?;
            installed += 1;
        }
        Ok(installed)
    }

    pub fn get(&self, effect_id: EffectId, op_id: OpId) -> Option<Arc<dyn HostHandler>> {
        self.handlers
            .get(&(effect_id, op_id))
            .map(|r| Arc::clone(&r.handler))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Which declared effects the host can service. An effect is supported
    /// when every one of its operations has a registered, supported handler.
    pub fn capabilities(&self) -> CapabilityReport {
        let entries = self
            .table
            .effects()
            .into_iter()
            .map(|(effect_id, name)| {
                let supported = self
                    .table
                    .entries()
                    .iter()
                    .filter(|e| e.effect_id == effect_id)
                    .all(|e| {
                        self.handlers
                            .get(&(effect_id, e.op_id))
                            .map_or(false, |r| r.handler.supported())
                    });
                CapabilityEntry {
                    effect: name.to_string(),
                    effect_id: effect_id.to_hex(),
                    supported,
                }
            })
            .collect();
        CapabilityReport { entries }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.table.len())
            .field("registered", &self.handlers.len())
            .finish()
    }
}

/// Capability negotiation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub entries: Vec<CapabilityEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityEntry {
    pub effect: String,
    pub effect_id: String,
    pub supported: bool,
}

impl CapabilityReport {
    pub fn is_supported(&self, effect: &str) -> bool {
        self.entries.iter().any(|e| e.effect == effect && e.supported)
    }

    pub fn unsupported(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.iter().filter(|e| !e.supported)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"entries\":[]}"))
    }
}

// ============================================================================
// Reference adapters
// ============================================================================

/// `Log`: records messages and forwards them to `tracing`.
#[derive(Debug, Default)]
pub struct LogAdapter {
    lines: Mutex<Vec<String>>,
}

impl LogAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages logged so far, prefixed with their level.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl HostHandler for LogAdapter {
    fn effect(&self) -> &str {
        "Log"
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec::new("info", vec![WireShape::Str], WireShape::Unit),
            OperationSpec::new("warn", vec![WireShape::Str], WireShape::Unit),
        ]
    }

    fn handle(&self, request: &HostRequest, continuation: HostContinuation) {
        let message = request.args.first().and_then(WireValue::as_str).unwrap_or_default();
        match request.op_name.as_str() {
            "warn" => tracing::warn!(run = %continuation.run(), "{}", message),
            _ => tracing::info!(run = %continuation.run(), "{}", message),
        }
        self.lines.lock().push(format!("{}: {}", request.op_name, message));
        continuation.tail(WireValue::Unit);
    }
}

/// `Clock`: wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct ClockAdapter;

impl HostHandler for ClockAdapter {
    fn effect(&self) -> &str {
        "Clock"
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![OperationSpec::new("now", Vec::new(), WireShape::Int)]
    }

    fn handle(&self, _request: &HostRequest, continuation: HostContinuation) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        continuation.tail(WireValue::Int(millis));
    }
}

/// `Timer`: resumes after the requested number of milliseconds, from a
/// helper thread.
#[derive(Debug, Default)]
pub struct TimerAdapter;

impl HostHandler for TimerAdapter {
    fn effect(&self) -> &str {
        "Timer"
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![OperationSpec::new("sleep", vec![WireShape::Int], WireShape::Unit)]
    }

    fn handle(&self, request: &HostRequest, continuation: HostContinuation) {
        let millis = request.args.first().and_then(WireValue::as_int).unwrap_or(0).max(0) as u64;
        let spawned = thread::Builder::new()
            .name("ripple-timer".into())
            .spawn(move || {
                thread::sleep(Duration::from_millis(millis));
                continuation.resume(WireValue::Unit);
            });
        // A failed spawn drops the closure, and with it the continuation,
        // which rejects the run.
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn timer thread");
        }
    }
}

/// `Fetch`: declared but not serviced by this host.
#[derive(Debug, Default)]
pub struct FetchAdapter;

impl HostHandler for FetchAdapter {
    fn effect(&self) -> &str {
        "Fetch"
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![OperationSpec::new("get", vec![WireShape::Str], WireShape::Str)]
    }

    fn supported(&self) -> bool {
        false
    }

    fn handle(&self, request: &HostRequest, continuation: HostContinuation) {
        continuation.reject(HostError::CapabilityNotFinalized {
            effect: request.effect_name.clone(),
            op: request.op_name.clone(),
        });
    }
}

/// A handler built from a closure, for one-off host effects.
pub struct FnHandler<F> {
    effect: String,
    operations: Vec<OperationSpec>,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&HostRequest, HostContinuation) + Send + Sync,
{
    pub fn new(effect: impl Into<String>, operations: Vec<OperationSpec>, handler: F) -> Self {
        Self {
            effect: effect.into(),
            operations,
            handler,
        }
    }
}

impl<F> HostHandler for FnHandler<F>
where
    F: Fn(&HostRequest, HostContinuation) + Send + Sync,
{
    fn effect(&self) -> &str {
        &self.effect
    }

    fn operations(&self) -> Vec<OperationSpec> {
        self.operations.clone()
    }

    fn handle(&self, request: &HostRequest, continuation: HostContinuation) {
        (self.handler)(request, continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::OpIndex;
    use crate::effect_table::EffectTableEntry;

    fn table() -> EffectTable {
        let log = OperationSpec::new("info", vec![WireShape::Str], WireShape::Unit);
        let fetch = OperationSpec::new("get", vec![WireShape::Str], WireShape::Str);
        EffectTable::from_entries(vec![
            EffectTableEntry {
                effect_id: EffectId::of("Log"),
                effect_name: "Log".into(),
                op_id: OpId(0),
                op_index: OpIndex(0),
                kind: ResumptionKind::Tail,
                signature_hash: log.signature_hash(),
                label: "info".into(),
            },
            EffectTableEntry {
                effect_id: EffectId::of("Fetch"),
                effect_name: "Fetch".into(),
                op_id: OpId(0),
                op_index: OpIndex(1),
                kind: ResumptionKind::Resume,
                signature_hash: fetch.signature_hash(),
                label: "get".into(),
            },
        ])
        .unwrap()
    }

    fn request(effect: &str, op: &str, kind: ResumptionKind) -> HostRequest {
        HostRequest {
            effect_id: EffectId::of(effect),
            effect_name: effect.into(),
            op_id: OpId(0),
            op_name: op.into(),
            op_index: OpIndex(0),
            kind,
            signature_hash: 0,
            handle: 7,
            args: vec![WireValue::Str("hello".into())],
        }
    }

    #[test]
    fn test_install_registers_declared_operations() {
        let mut registry = HandlerRegistry::new(table());
        // `warn` is not declared by the artifact and is skipped.
        assert_eq!(registry.install(Arc::new(LogAdapter::new())).unwrap(), 1);
        assert!(registry.get(EffectId::of("Log"), OpId(0)).is_some());
        assert!(registry.get(EffectId::of("Log"), OpId(1)).is_none());
    }

    #[test]
    fn test_register_validates_identity_and_signature() {
        let mut registry = HandlerRegistry::new(table());
        let handler: Arc<dyn HostHandler> = Arc::new(LogAdapter::new());
        assert!(matches!(
            registry.register(EffectId::of("Log"), OpId(4), 0, Arc::clone(&handler)),
            Err(HostError::UnknownOperation { .. })
        ));
        assert!(matches!(
            registry.register(EffectId::of("Log"), OpId(0), 0xdead_beef, handler),
            Err(HostError::SignatureMismatch { found: 0xdead_beef, .. })
        ));
    }

    #[test]
    fn test_capability_report() {
        let mut registry = HandlerRegistry::new(table());
        registry.install(Arc::new(LogAdapter::new())).unwrap();
        registry.install(Arc::new(FetchAdapter)).unwrap();
        let report = registry.capabilities();
        assert!(report.is_supported("Log"));
        assert!(!report.is_supported("Fetch"));
        assert_eq!(report.unsupported().count(), 1);
        let json = report.to_json();
        assert!(json.contains("\"effect\":\"Fetch\""));
        assert!(json.contains("\"supported\":false"));
    }

    #[test]
    fn test_fetch_rejects_with_capability_not_finalized() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let request = request("Fetch", "get", ResumptionKind::Resume);
        FetchAdapter.handle(&request, HostContinuation::new(RunId(1), &request, tx));
        let completion = rx.try_recv().unwrap();
        assert_eq!(
            completion.resolution,
            Resolution::Reject(HostError::CapabilityNotFinalized {
                effect: "Fetch".into(),
                op: "get".into()
            })
        );
        if let Resolution::Reject(err) = &completion.resolution {
            assert!(err.to_string().starts_with("effect contract is not finalized"));
        }
    }

    #[test]
    fn test_tail_continuation_cannot_end() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let request = request("Log", "info", ResumptionKind::Tail);
        let continuation = HostContinuation::new(RunId(1), &request, tx);
        assert_eq!(
            continuation.end(WireValue::Unit),
            Err(HostError::TailCannotEnd { effect: "Log".into(), op: "info".into() })
        );
        // The run fails instead of waiting forever.
        assert!(matches!(
            rx.try_recv().unwrap().resolution,
            Resolution::Reject(HostError::TailCannotEnd { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_continuation_rejects_run() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let request = request("Fetch", "get", ResumptionKind::Resume);
        drop(HostContinuation::new(RunId(2), &request, tx));
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.run, RunId(2));
        assert_eq!(
            completion.resolution,
            Resolution::Reject(HostError::ContinuationDropped("Fetch.get".into()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_answered_continuation_sends_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let request = request("Fetch", "get", ResumptionKind::Resume);
        HostContinuation::new(RunId(2), &request, tx).resume(WireValue::Str("ok".into()));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_log_adapter_tails_with_unit() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let adapter = LogAdapter::new();
        let request = request("Log", "info", ResumptionKind::Tail);
        adapter.handle(&request, HostContinuation::new(RunId(3), &request, tx));
        assert_eq!(adapter.lines(), vec!["info: hello".to_string()]);
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.run, RunId(3));
        assert_eq!(completion.handle, 7);
        assert_eq!(completion.resolution, Resolution::Resume(WireValue::Unit));
    }
}
