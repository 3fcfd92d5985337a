//! # Effect ABI Identities
//!
//! Identity types shared by the compiler, the generated artifact, and the host.
//!
//! ## Effect Identity
//!
//! An effect is identified at runtime by a 64-bit content hash of its
//! fully-qualified name: the first 8 bytes (little-endian) of the BLAKE3 digest.
//! The value is stable across compilations and machines, so a host adapter can
//! compute the id of the effect it services without reading the artifact.
//!
//! ## Operation Identity
//!
//! Operations are matched by the pair `(EffectId, OpId)`, where `OpId` is the
//! operation's position inside its effect. Every operation additionally gets an
//! `OpIndex`, its position in whole-program declaration order, used for compact
//! host dispatch and as the row index in the effect table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the custom section carrying the binary effect table.
pub const EFFECT_TABLE_SECTION: &str = "ripple.effects";

/// Name of the custom section carrying the wire schema of every operation.
pub const WIRE_SCHEMA_SECTION: &str = "ripple.wire";

/// Current effect table format version.
pub const EFFECT_TABLE_VERSION: u32 = 1;

/// Generated entry point that re-enters a stored continuation.
pub const RESUME_CONTINUATION: &str = "resume_continuation";

/// Generated entry point that resumes, re-dispatches and re-encodes.
pub const RESUME_EFFECTFUL: &str = "resume_effectful";

/// Name of the generated effectful entry point for an export.
pub fn effectful_entry_name(export: &str) -> String {
    format!("{}_effectful", export)
}

// ============================================================================
// Effect and operation ids
// ============================================================================

/// Content-hash identity of a declared effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(pub u64);

impl EffectId {
    /// Compute the id of an effect from its fully-qualified name.
    pub fn of(qualified_name: &str) -> Self {
        let digest = blake3::hash(qualified_name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        EffectId(u64::from_le_bytes(bytes))
    }

    /// Rebuild an id from the two halves stored in the effect table.
    pub fn from_parts(low: u32, high: u32) -> Self {
        EffectId(u64::from(low) | (u64::from(high) << 32))
    }

    /// The low 32 bits.
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    /// The high 32 bits.
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Hex rendering used in logs and host-side displays.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Position of an operation within its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Position of an operation in whole-program declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpIndex(pub u32);

impl OpIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Resumption kind
// ============================================================================

/// How often a handler may invoke an operation's continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResumptionKind {
    /// Any number of times, in any position.
    #[default]
    Resume = 0,
    /// Exactly once, in tail position.
    Tail = 1,
}

impl ResumptionKind {
    /// Decode the table encoding (`resume=0`, `tail=1`).
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ResumptionKind::Resume),
            1 => Some(ResumptionKind::Tail),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The `expected` count of a fresh tail guard for this kind.
    pub fn expected_resumptions(self) -> u32 {
        match self {
            ResumptionKind::Resume => u32::MAX,
            ResumptionKind::Tail => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResumptionKind::Resume => "resume",
            ResumptionKind::Tail => "tail",
        }
    }
}

impl fmt::Display for ResumptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Signatures
// ============================================================================

/// Build the canonical signature string `name(p1,p2)->ret`.
pub fn canonical_signature<P: fmt::Display, R: fmt::Display>(name: &str, params: &[P], ret: &R) -> String {
    let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
    format!("{}({})->{}", name, params.join(","), ret)
}

/// Hash a canonical signature string to the 32-bit value stored in the table.
pub fn signature_hash(signature: &str) -> u32 {
    let digest = blake3::hash(signature.as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest.as_bytes()[..4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_id_is_stable() {
        assert_eq!(EffectId::of("std.Log"), EffectId::of("std.Log"));
        assert_ne!(EffectId::of("std.Log"), EffectId::of("std.Clock"));
    }

    #[test]
    fn test_effect_id_parts_roundtrip() {
        let id = EffectId::of("Async");
        assert_eq!(EffectId::from_parts(id.low(), id.high()), id);
    }

    #[test]
    fn test_effect_id_hex() {
        let id = EffectId(0x0102_0304_0506_0708);
        assert_eq!(id.to_hex(), "0102030405060708");
        assert_eq!(id.to_string(), id.to_hex());
    }

    #[test]
    fn test_resumption_kind_encoding() {
        assert_eq!(ResumptionKind::from_u32(0), Some(ResumptionKind::Resume));
        assert_eq!(ResumptionKind::from_u32(1), Some(ResumptionKind::Tail));
        assert_eq!(ResumptionKind::from_u32(2), None);
        assert_eq!(ResumptionKind::Tail.expected_resumptions(), 1);
    }

    #[test]
    fn test_canonical_signature() {
        let sig = canonical_signature("await", &["int", "str"], &"int");
        assert_eq!(sig, "await(int,str)->int");
        assert_eq!(signature_hash(&sig), signature_hash("await(int,str)->int"));
        assert_ne!(signature_hash(&sig), signature_hash("await(int)->int"));
    }
}
