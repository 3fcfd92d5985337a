//! # Host Boundary Wire Format
//!
//! Self-describing value encoding used for every payload that crosses the
//! module/host boundary: effect request arguments, resumption values, and run
//! results.
//!
//! ## Value Encoding
//!
//! ```text
//! tag:u8 payload
//!   0 unit    (empty)
//!   1 bool    u8 (0 or 1)
//!   2 int     i64 little-endian
//!   3 float   f64 little-endian
//!   4 string  len:u32 utf-8 bytes
//!   5 bytes   len:u32 raw bytes
//!   6 array   count:u32 value*
//! ```
//!
//! ## Records
//!
//! A request record is `effectId:u64 opId:u32 opIndex:u32 resumeKind:u32
//! handle:u64 args:array`. An `EffectResult` is tag `0` followed by a value
//! (the run completed) or tag `1` followed by a request record (the run is
//! waiting on the host).
//!
//! ## Schema
//!
//! The wire schema section lists, per `opIndex`, the parameter shapes and the
//! return shape of the operation. It is itself encoded with this format so the
//! host needs a single decoder.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abi::{EffectId, OpId, OpIndex, ResumptionKind};

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

mod tag {
    pub const UNIT: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const STR: u8 = 4;
    pub const BYTES: u8 = 5;
    pub const ARRAY: u8 = 6;
}

const RESULT_DONE: u8 = 0;
const RESULT_PENDING: u8 = 1;

/// Errors produced while decoding wire payloads.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("unexpected end of payload at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unknown value tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid utf-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("{count} trailing bytes after payload")]
    TrailingBytes { count: usize },

    #[error("payload nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("invalid effect result tag {0}")]
    InvalidResultTag(u8),

    #[error("invalid resumption kind {0}")]
    InvalidKind(u32),

    #[error("expected a value of shape `{expected}`, found `{found}`")]
    ShapeMismatch { expected: String, found: String },

    #[error("malformed wire schema: {0}")]
    InvalidSchema(String),

    #[error("value of kind `{0}` cannot cross the host boundary")]
    NotMarshalable(&'static str),
}

// ============================================================================
// Values and shapes
// ============================================================================

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WireValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
}

impl WireValue {
    /// Short kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireValue::Unit => "unit",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::Float(_) => "float",
            WireValue::Str(_) => "str",
            WireValue::Bytes(_) => "bytes",
            WireValue::Array(_) => "array",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            WireValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Encode this value into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(self, &mut out);
        out
    }

    /// Decode exactly one value, rejecting trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<WireValue, WireError> {
        let mut reader = Reader::new(bytes);
        let value = reader.value(0)?;
        reader.finish()?;
        Ok(value)
    }
}

/// The static shape of a marshalable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireShape {
    Unit,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Tuple(Vec<WireShape>),
}

impl WireShape {
    /// Check a decoded value against this shape.
    pub fn accepts(&self, value: &WireValue) -> bool {
        match (self, value) {
            (WireShape::Unit, WireValue::Unit)
            | (WireShape::Bool, WireValue::Bool(_))
            | (WireShape::Int, WireValue::Int(_))
            | (WireShape::Float, WireValue::Float(_))
            | (WireShape::Str, WireValue::Str(_))
            | (WireShape::Bytes, WireValue::Bytes(_)) => true,
            (WireShape::Tuple(shapes), WireValue::Array(items)) => {
                shapes.len() == items.len()
                    && shapes.iter().zip(items).all(|(s, v)| s.accepts(v))
            }
            _ => false,
        }
    }

    /// Check a value, producing a `ShapeMismatch` on failure.
    pub fn check(&self, value: &WireValue) -> Result<(), WireError> {
        if self.accepts(value) {
            Ok(())
        } else {
            Err(WireError::ShapeMismatch {
                expected: self.to_string(),
                found: value.kind_name().to_string(),
            })
        }
    }

    fn to_wire(&self) -> WireValue {
        match self {
            WireShape::Unit => WireValue::Int(tag::UNIT as i64),
            WireShape::Bool => WireValue::Int(tag::BOOL as i64),
            WireShape::Int => WireValue::Int(tag::INT as i64),
            WireShape::Float => WireValue::Int(tag::FLOAT as i64),
            WireShape::Str => WireValue::Int(tag::STR as i64),
            WireShape::Bytes => WireValue::Int(tag::BYTES as i64),
            WireShape::Tuple(items) => {
                let mut encoded = vec![WireValue::Int(tag::ARRAY as i64)];
                encoded.extend(items.iter().map(WireShape::to_wire));
                WireValue::Array(encoded)
            }
        }
    }

    fn from_wire(value: &WireValue) -> Result<WireShape, WireError> {
        match value {
            WireValue::Int(t) => match u8::try_from(*t).ok() {
                Some(tag::UNIT) => Ok(WireShape::Unit),
                Some(tag::BOOL) => Ok(WireShape::Bool),
                Some(tag::INT) => Ok(WireShape::Int),
                Some(tag::FLOAT) => Ok(WireShape::Float),
                Some(tag::STR) => Ok(WireShape::Str),
                Some(tag::BYTES) => Ok(WireShape::Bytes),
                _ => Err(WireError::InvalidSchema(format!("unknown shape tag {}", t))),
            },
            WireValue::Array(items) => match items.split_first() {
                Some((WireValue::Int(t), rest)) if *t == tag::ARRAY as i64 => Ok(WireShape::Tuple(
                    rest.iter().map(WireShape::from_wire).collect::<Result<_, _>>()?,
                )),
                _ => Err(WireError::InvalidSchema("tuple shape without array tag".into())),
            },
            other => Err(WireError::InvalidSchema(format!(
                "unexpected `{}` in shape position",
                other.kind_name()
            ))),
        }
    }
}

impl fmt::Display for WireShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireShape::Unit => f.write_str("unit"),
            WireShape::Bool => f.write_str("bool"),
            WireShape::Int => f.write_str("int"),
            WireShape::Float => f.write_str("float"),
            WireShape::Str => f.write_str("str"),
            WireShape::Bytes => f.write_str("bytes"),
            WireShape::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Append the encoding of `value` to `out`.
pub fn encode_value(value: &WireValue, out: &mut Vec<u8>) {
    match value {
        WireValue::Unit => out.push(tag::UNIT),
        WireValue::Bool(b) => {
            out.push(tag::BOOL);
            out.push(u8::from(*b));
        }
        WireValue::Int(n) => {
            out.push(tag::INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        WireValue::Float(x) => {
            out.push(tag::FLOAT);
            out.extend_from_slice(&x.to_le_bytes());
        }
        WireValue::Str(s) => {
            out.push(tag::STR);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        WireValue::Bytes(b) => {
            out.push(tag::BYTES);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        WireValue::Array(items) => {
            out.push(tag::ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Cursor over a wire payload.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(WireError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read one tagged value.
    pub fn value(&mut self, depth: usize) -> Result<WireValue, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::TooDeep);
        }
        let offset = self.pos;
        match self.u8()? {
            tag::UNIT => Ok(WireValue::Unit),
            tag::BOOL => Ok(WireValue::Bool(self.u8()? != 0)),
            tag::INT => Ok(WireValue::Int(self.u64()? as i64)),
            tag::FLOAT => Ok(WireValue::Float(f64::from_bits(self.u64()?))),
            tag::STR => {
                let len = self.u32()? as usize;
                let start = self.pos;
                let raw = self.take(len)?;
                std::str::from_utf8(raw)
                    .map(|s| WireValue::Str(s.to_string()))
                    .map_err(|_| WireError::InvalidUtf8 { offset: start })
            }
            tag::BYTES => {
                let len = self.u32()? as usize;
                Ok(WireValue::Bytes(self.take(len)?.to_vec()))
            }
            tag::ARRAY => {
                let count = self.u32()? as usize;
                // Every element takes at least one byte.
                if count > self.bytes.len() - self.pos {
                    return Err(WireError::UnexpectedEof { offset: self.pos });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(WireValue::Array(items))
            }
            other => Err(WireError::UnknownTag { tag: other, offset }),
        }
    }

    /// Require that the whole payload was consumed.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            count => Err(WireError::TrailingBytes { count }),
        }
    }
}

// ============================================================================
// Request records and effect results
// ============================================================================

/// The host-visible description of a pending effect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub op_index: OpIndex,
    pub kind: ResumptionKind,
    /// Opaque handle the host passes back when resuming.
    pub handle: u64,
    pub args: Vec<WireValue>,
}

impl RequestRecord {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.effect_id.0.to_le_bytes());
        out.extend_from_slice(&self.op_id.0.to_le_bytes());
        out.extend_from_slice(&self.op_index.0.to_le_bytes());
        out.extend_from_slice(&self.kind.as_u32().to_le_bytes());
        out.extend_from_slice(&self.handle.to_le_bytes());
        encode_value(&WireValue::Array(self.args.clone()), out);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<RequestRecord, WireError> {
        let effect_id = EffectId(reader.u64()?);
        let op_id = OpId(reader.u32()?);
        let op_index = OpIndex(reader.u32()?);
        let raw_kind = reader.u32()?;
        let kind = ResumptionKind::from_u32(raw_kind).ok_or(WireError::InvalidKind(raw_kind))?;
        let handle = reader.u64()?;
        let args = match reader.value(0)? {
            WireValue::Array(items) => items,
            other => {
                return Err(WireError::ShapeMismatch {
                    expected: "array".into(),
                    found: other.kind_name().into(),
                })
            }
        };
        Ok(RequestRecord { effect_id, op_id, op_index, kind, handle, args })
    }
}

/// Result of an effectful entry point, as seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EffectResult {
    /// The run finished with a value.
    Done(WireValue),
    /// The run is suspended on a host request.
    Pending(RequestRecord),
}

impl EffectResult {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            EffectResult::Done(value) => {
                out.push(RESULT_DONE);
                encode_value(value, &mut out);
            }
            EffectResult::Pending(record) => {
                out.push(RESULT_PENDING);
                record.encode_into(&mut out);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<EffectResult, WireError> {
        let mut reader = Reader::new(bytes);
        let result = match reader.u8()? {
            RESULT_DONE => EffectResult::Done(reader.value(0)?),
            RESULT_PENDING => EffectResult::Pending(RequestRecord::read(&mut reader)?),
            other => return Err(WireError::InvalidResultTag(other)),
        };
        reader.finish()?;
        Ok(result)
    }
}

// ============================================================================
// Schema section
// ============================================================================

/// Parameter and return shapes of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSchema {
    pub params: Vec<WireShape>,
    pub ret: WireShape,
}

/// Shapes of every operation, indexed by `OpIndex`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSchema {
    pub ops: Vec<OpSchema>,
}

impl WireSchema {
    pub fn get(&self, index: OpIndex) -> Option<&OpSchema> {
        self.ops.get(index.index())
    }

    pub fn encode(&self) -> Vec<u8> {
        let ops = self
            .ops
            .iter()
            .map(|op| {
                WireValue::Array(vec![
                    WireValue::Array(op.params.iter().map(WireShape::to_wire).collect()),
                    op.ret.to_wire(),
                ])
            })
            .collect();
        WireValue::Array(ops).encode()
    }

    pub fn parse(bytes: &[u8]) -> Result<WireSchema, WireError> {
        let WireValue::Array(entries) = WireValue::decode(bytes)? else {
            return Err(WireError::InvalidSchema("schema root is not an array".into()));
        };
        let mut ops = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry {
                WireValue::Array(pair) if pair.len() == 2 => {
                    let WireValue::Array(params) = &pair[0] else {
                        return Err(WireError::InvalidSchema("parameter list is not an array".into()));
                    };
                    ops.push(OpSchema {
                        params: params.iter().map(WireShape::from_wire).collect::<Result<_, _>>()?,
                        ret: WireShape::from_wire(&pair[1])?,
                    });
                }
                _ => return Err(WireError::InvalidSchema("operation entry is not a pair".into())),
            }
        }
        Ok(WireSchema { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_encoding_layout() {
        assert_eq!(WireValue::Unit.encode(), vec![0]);
        assert_eq!(WireValue::Bool(true).encode(), vec![1, 1]);
        assert_eq!(WireValue::Int(8).encode(), vec![2, 8, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(WireValue::Str("ok".into()).encode(), vec![4, 2, 0, 0, 0, b'o', b'k']);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = WireValue::Int(1).encode();
        bytes.push(0);
        assert_eq!(WireValue::decode(&bytes), Err(WireError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn test_decode_rejects_truncated_string() {
        let bytes = vec![4, 10, 0, 0, 0, b'a'];
        assert!(matches!(WireValue::decode(&bytes), Err(WireError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert_eq!(WireValue::decode(&[9]), Err(WireError::UnknownTag { tag: 9, offset: 0 }));
    }

    #[test]
    fn test_decode_rejects_huge_array_count() {
        let bytes = vec![6, 0xff, 0xff, 0xff, 0x7f];
        assert!(matches!(WireValue::decode(&bytes), Err(WireError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_shape_accepts() {
        let shape = WireShape::Tuple(vec![WireShape::Int, WireShape::Str]);
        assert!(shape.accepts(&WireValue::Array(vec![WireValue::Int(1), WireValue::Str("a".into())])));
        assert!(!shape.accepts(&WireValue::Array(vec![WireValue::Int(1)])));
        assert!(shape.check(&WireValue::Int(1)).is_err());
        assert_eq!(shape.to_string(), "(int,str)");
    }

    #[test]
    fn test_effect_result_pending_roundtrip() {
        let result = EffectResult::Pending(RequestRecord {
            effect_id: EffectId::of("Async"),
            op_id: OpId(0),
            op_index: OpIndex(3),
            kind: ResumptionKind::Resume,
            handle: 42,
            args: vec![WireValue::Int(5)],
        });
        assert_eq!(EffectResult::decode(&result.encode()), Ok(result));
    }

    #[test]
    fn test_effect_result_bad_tag() {
        assert_eq!(EffectResult::decode(&[7]), Err(WireError::InvalidResultTag(7)));
    }

    #[test]
    fn test_schema_roundtrip() {
        let schema = WireSchema {
            ops: vec![
                OpSchema { params: vec![], ret: WireShape::Unit },
                OpSchema {
                    params: vec![WireShape::Int, WireShape::Tuple(vec![WireShape::Bool, WireShape::Bytes])],
                    ret: WireShape::Float,
                },
            ],
        };
        assert_eq!(WireSchema::parse(&schema.encode()), Ok(schema));
    }

    #[test]
    fn test_wire_value_json_form() {
        let json = serde_json::to_string(&WireValue::Int(3)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":3}"#);
    }
}
