//! # Host Session
//!
//! The host's view of a compiled artifact.
//!
//! An [`Instance`] is a loaded artifact: its effect table and wire schema are
//! parsed once and its generated entry points are located. A [`Session`] is
//! one run on that instance, owning the run's machine state (handler arena,
//! guards, fibers, published requests).
//!
//! Every step of a run crosses the boundary as bytes: `start` calls the
//! export's `name_effectful` entry point and `resume` calls
//! `resume_effectful`; both return an encoded `EffectResult` that the session
//! decodes into a [`Step`].

use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::abi::{effectful_entry_name, EffectId, OpId, OpIndex, ResumptionKind, EFFECT_TABLE_SECTION,
    RESUME_CONTINUATION, RESUME_EFFECTFUL, WIRE_SCHEMA_SECTION};
use crate::artifact::{FuncId, Module};
use crate::effect_table::EffectTable;
use crate::error::HostError;
use crate::value::Value;
use crate::vm::{Machine, MachineConfig, MachineStats};
use crate::wire::{EffectResult, RequestRecord, WireError, WireSchema, WireValue};

/// Buffer capacity passed to `resume_effectful`.
pub const DEFAULT_RESULT_CAPACITY: usize = 64 * 1024;

/// A loaded artifact, shareable between sessions on the same thread.
#[derive(Clone)]
pub struct Instance {
    module: Rc<Module>,
    table: Rc<EffectTable>,
    schema: Rc<WireSchema>,
    resume_continuation: FuncId,
    resume_effectful: FuncId,
}

impl Instance {
    pub fn load(module: Module) -> Result<Self, HostError> {
        let table_bytes = module
            .section(EFFECT_TABLE_SECTION)
            .ok_or(HostError::MissingSection(EFFECT_TABLE_SECTION))?;
        let table = EffectTable::parse(table_bytes)?;
        let schema_bytes = module
            .section(WIRE_SCHEMA_SECTION)
            .ok_or(HostError::MissingSection(WIRE_SCHEMA_SECTION))?;
        let schema = WireSchema::parse(schema_bytes)?;
        if schema.ops.len() != table.len() {
            return Err(HostError::MalformedPayload(WireError::InvalidSchema(format!(
                "schema lists {} operations, effect table lists {}",
                schema.ops.len(),
                table.len()
            ))));
        }

        let entry = |name: &str| {
            module
                .func_by_name(name)
                .ok_or_else(|| HostError::MissingEntryPoint(name.to_string()))
        };
        let resume_continuation = entry(RESUME_CONTINUATION)?;
        let resume_effectful = entry(RESUME_EFFECTFUL)?;
        for export in &module.exports {
            let expected = effectful_entry_name(&export.name);
            if module.function(export.entry).map(|f| f.name.as_str()) != Some(expected.as_str()) {
                return Err(HostError::MissingEntryPoint(expected));
            }
        }

        tracing::debug!(
            operations = table.len(),
            exports = module.exports.len(),
            functions = module.functions.len(),
            "loaded artifact"
        );

        Ok(Self {
            module: Rc::new(module),
            table: Rc::new(table),
            schema: Rc::new(schema),
            resume_continuation,
            resume_effectful,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn table(&self) -> &EffectTable {
        &self.table
    }

    pub fn schema(&self) -> &WireSchema {
        &self.schema
    }

    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports.iter().map(|e| e.name.as_str())
    }

    pub fn session(&self, config: MachineConfig) -> Session {
        Session::new(self.clone(), config)
    }

    /// Describe a request record with the names from the effect table.
    pub fn describe(&self, record: RequestRecord) -> HostRequest {
        let entry = self.table.lookup(record.effect_id, record.op_id);
        HostRequest {
            effect_name: entry
                .map(|e| e.effect_name.clone())
                .unwrap_or_else(|| record.effect_id.to_hex()),
            op_name: entry
                .map(|e| e.label.clone())
                .unwrap_or_else(|| record.op_id.to_string()),
            signature_hash: entry.map(|e| e.signature_hash).unwrap_or(0),
            effect_id: record.effect_id,
            op_id: record.op_id,
            op_index: record.op_index,
            kind: record.kind,
            handle: record.handle,
            args: record.args,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("functions", &self.module.functions.len())
            .field("operations", &self.table.len())
            .finish()
    }
}

/// A pending request as delivered to host code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostRequest {
    pub effect_id: EffectId,
    pub effect_name: String,
    pub op_id: OpId,
    pub op_name: String,
    pub op_index: OpIndex,
    pub kind: ResumptionKind,
    pub signature_hash: u32,
    pub handle: u64,
    pub args: Vec<WireValue>,
}

impl HostRequest {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.effect_name, self.op_name)
    }
}

/// Result of advancing a run by one boundary crossing.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Done(WireValue),
    Pending(HostRequest),
}

/// One run of an instance.
pub struct Session {
    instance: Instance,
    machine: Machine,
    capacity: usize,
}

impl Session {
    pub fn new(instance: Instance, config: MachineConfig) -> Self {
        let machine = Machine::new(Rc::clone(&instance.module), Rc::clone(&instance.schema), config);
        Self {
            instance,
            machine,
            capacity: DEFAULT_RESULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn stats(&self) -> &MachineStats {
        self.machine.stats()
    }

    /// Call an export's effectful entry point.
    pub fn start(&mut self, export: &str, args: Vec<WireValue>) -> Result<Step, HostError> {
        let export = self
            .instance
            .module
            .export(export)
            .ok_or_else(|| HostError::UnknownExport(export.to_string()))?
            .clone();
        if args.len() != export.params as usize {
            return Err(HostError::MalformedPayload(WireError::ShapeMismatch {
                expected: format!("{} arguments", export.params),
                found: format!("{} arguments", args.len()),
            }));
        }
        tracing::debug!(export = %export.name, "start run");
        let args = args.iter().map(Value::from_wire).collect();
        let result = self.machine.call(export.entry, args);
        self.machine.collect();
        self.step(result?)
    }

    /// Resume the request published under `handle` with `value`.
    pub fn resume(&mut self, handle: u64, value: &WireValue) -> Result<Step, HostError> {
        self.resume_bytes(handle, &value.encode())
    }

    /// Resume with an already encoded payload.
    ///
    /// The payload is decoded and checked against the operation's return
    /// shape before the module is entered, so a malformed payload is a host
    /// error and leaves the run untouched.
    pub fn resume_bytes(&mut self, handle: u64, payload: &[u8]) -> Result<Step, HostError> {
        let request = self.machine.published(handle).ok_or(HostError::UnknownHandle(handle))?;
        let decoded = WireValue::decode(payload)?;
        let schema = self.instance.schema.get(request.op_index).ok_or_else(|| {
            WireError::InvalidSchema(format!("no schema for operation {}", request.op_index))
        })?;
        schema.ret.check(&decoded)?;

        tracing::trace!(handle, bytes = payload.len(), "resume run");
        let result = self.machine.call(
            self.instance.resume_effectful,
            vec![
                Value::Request(request),
                Value::Bytes(Rc::from(payload)),
                Value::Int(payload.len() as i64),
                Value::Int(self.capacity as i64),
            ],
        );
        self.machine.collect();
        self.step(result?)
    }

    /// Stop answering `handle`. Frames and fibers only its continuation
    /// held are reclaimed. Returns whether the handle was live.
    ///
    /// A `resume` request may be resumed any number of times on the
    /// trampoline backend, so its handle stays valid until released or
    /// until the session is closed.
    pub fn release(&mut self, handle: u64) -> bool {
        let released = self.machine.release(handle);
        if released {
            self.machine.collect();
        }
        released
    }

    /// Release every handle and all run state. The session can start a new
    /// run afterwards.
    pub fn close(&mut self) {
        self.machine.clear();
    }

    /// Handles currently open for resumption.
    pub fn open_handles(&self) -> usize {
        self.machine.published_count()
    }

    /// Live handler frames held for open handles.
    pub fn live_frames(&self) -> usize {
        self.machine.handlers().len()
    }

    /// Re-enter the continuation of `handle` without re-dispatching.
    ///
    /// Returns the raw outcome of `resume_continuation`; effects raised
    /// by the continuation are not routed through the root handler chain.
    pub fn resume_continuation(&mut self, handle: u64, value: &WireValue) -> Result<Value, HostError> {
        let request = self.machine.published(handle).ok_or(HostError::UnknownHandle(handle))?;
        let payload = value.encode();
        let len = payload.len() as i64;
        Ok(self.machine.call(
            self.instance.resume_continuation,
            vec![Value::Request(request), Value::Bytes(Rc::from(payload)), Value::Int(len)],
        )?)
    }

    fn step(&self, result: Value) -> Result<Step, HostError> {
        let bytes = match result {
            Value::Bytes(bytes) => bytes,
            other => {
                return Err(HostError::MalformedPayload(WireError::ShapeMismatch {
                    expected: "bytes".into(),
                    found: other.type_name().into(),
                }))
            }
        };
        Ok(match EffectResult::decode(&bytes)? {
            EffectResult::Done(value) => Step::Done(value),
            EffectResult::Pending(record) => {
                let request = self.instance.describe(record);
                tracing::debug!(
                    op = %request.qualified_name(),
                    handle = request.handle,
                    kind = %request.kind,
                    "run suspended on host request"
                );
                Step::Pending(request)
            }
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instance", &self.instance)
            .field("stats", self.machine.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_requires_sections() {
        let err = Instance::load(Module::default()).unwrap_err();
        assert_eq!(err, HostError::MissingSection(EFFECT_TABLE_SECTION));
    }

    #[test]
    fn test_load_requires_entry_points() {
        let module = Module {
            sections: vec![
                crate::artifact::CustomSection {
                    name: EFFECT_TABLE_SECTION.into(),
                    bytes: EffectTable::default().encode(),
                },
                crate::artifact::CustomSection {
                    name: WIRE_SCHEMA_SECTION.into(),
                    bytes: WireSchema::default().encode(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            Instance::load(module).unwrap_err(),
            HostError::MissingEntryPoint(RESUME_CONTINUATION.into())
        );
    }

    #[test]
    fn test_describe_unknown_operation_falls_back_to_ids() {
        let module = Module {
            functions: vec![
                crate::artifact::Function { name: RESUME_CONTINUATION.into(), ..Default::default() },
                crate::artifact::Function { name: RESUME_EFFECTFUL.into(), ..Default::default() },
            ],
            sections: vec![
                crate::artifact::CustomSection {
                    name: EFFECT_TABLE_SECTION.into(),
                    bytes: EffectTable::default().encode(),
                },
                crate::artifact::CustomSection {
                    name: WIRE_SCHEMA_SECTION.into(),
                    bytes: WireSchema::default().encode(),
                },
            ],
            ..Default::default()
        };
        let instance = Instance::load(module).unwrap();
        let request = instance.describe(RequestRecord {
            effect_id: EffectId(0xab),
            op_id: OpId(2),
            op_index: OpIndex(0),
            kind: ResumptionKind::Resume,
            handle: 9,
            args: Vec::new(),
        });
        assert_eq!(request.effect_name, "00000000000000ab");
        assert_eq!(request.op_name, "op2");
    }
}
