//! # Effect Table
//!
//! Binary side-table describing every operation of a compiled program. The
//! compiler emits it into the `ripple.effects` custom section; the host parses
//! it once per loaded artifact.
//!
//! ## Layout
//!
//! All integers are little-endian `u32`.
//!
//! ```text
//! length:u32                      byte length of everything below
//! version:u32 opCount:u32
//! repeat opCount:
//!   effectIdLow effectIdHigh effectIdNameOffset
//!   opId resumeKind signatureHash labelOffset
//! names: NUL-terminated UTF-8 strings
//! ```
//!
//! Offsets are relative to the start of the names blob, and each distinct
//! string is stored once. Row `i` describes the operation with `opIndex == i`.

use std::collections::HashMap;

use thiserror::Error;

use crate::abi::{EffectId, OpId, OpIndex, ResumptionKind, EFFECT_TABLE_VERSION};

const ROW_WORDS: usize = 7;
const ROW_BYTES: usize = ROW_WORDS * 4;

/// Errors produced while parsing an effect table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("effect table truncated: needed {needed} bytes, found {found}")]
    Truncated { needed: usize, found: usize },

    #[error("{0} trailing bytes after effect table")]
    TrailingBytes(usize),

    #[error("unsupported effect table version {0}")]
    UnsupportedVersion(u32),

    #[error("row {row}: invalid resumption kind {raw}")]
    InvalidKind { row: usize, raw: u32 },

    #[error("row {row}: name offset {offset} outside the names blob")]
    OffsetOutOfRange { row: usize, offset: u32 },

    #[error("row {row}: name at offset {offset} is not NUL-terminated")]
    UnterminatedName { row: usize, offset: u32 },

    #[error("row {row}: name at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { row: usize, offset: u32 },

    #[error("row {row}: operation `{label}` duplicates an earlier row of the same effect")]
    DuplicateOperation { row: usize, label: String },
}

/// One operation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectTableEntry {
    pub effect_id: EffectId,
    /// Fully-qualified effect name.
    pub effect_name: String,
    pub op_id: OpId,
    pub op_index: OpIndex,
    pub kind: ResumptionKind,
    pub signature_hash: u32,
    /// Operation name.
    pub label: String,
}

/// Parsed or to-be-emitted effect table.
#[derive(Debug, Clone, Default)]
pub struct EffectTable {
    entries: Vec<EffectTableEntry>,
    by_name: HashMap<(EffectId, String), OpIndex>,
    by_op: HashMap<(EffectId, OpId), OpIndex>,
}

impl EffectTable {
    /// Build a table from entries already in `opIndex` order.
    pub fn from_entries(entries: Vec<EffectTableEntry>) -> Result<Self, TableError> {
        let mut by_name = HashMap::with_capacity(entries.len());
        let mut by_op = HashMap::with_capacity(entries.len());
        for (row, entry) in entries.iter().enumerate() {
            let index = OpIndex(row as u32);
            by_op.insert((entry.effect_id, entry.op_id), index);
            // Overloads share a label; the first row keeps the name lookup.
            by_name.entry((entry.effect_id, entry.label.clone())).or_insert(index);
            if entries[..row]
                .iter()
                .any(|e| e.effect_id == entry.effect_id && e.op_id == entry.op_id)
            {
                return Err(TableError::DuplicateOperation { row, label: entry.label.clone() });
            }
        }
        Ok(Self { entries, by_name, by_op })
    }

    pub fn entries(&self) -> &[EffectTableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup by whole-program operation index.
    pub fn by_index(&self, index: OpIndex) -> Option<&EffectTableEntry> {
        self.entries.get(index.index())
    }

    /// Lookup by effect id and operation name.
    pub fn by_name(&self, effect: EffectId, op_name: &str) -> Option<&EffectTableEntry> {
        self.by_name
            .get(&(effect, op_name.to_string()))
            .and_then(|index| self.by_index(*index))
    }

    /// Lookup by runtime identity.
    pub fn lookup(&self, effect: EffectId, op: OpId) -> Option<&EffectTableEntry> {
        self.by_op.get(&(effect, op)).and_then(|index| self.by_index(*index))
    }

    /// Distinct effects in first-appearance order.
    pub fn effects(&self) -> Vec<(EffectId, &str)> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.iter().any(|(id, _)| *id == entry.effect_id) {
                seen.push((entry.effect_id, entry.effect_name.as_str()));
            }
        }
        seen
    }

    /// Serialize the table into its section bytes.
    pub fn encode<'a>(&'a self) -> Vec<u8> {
        let mut names = Vec::new();
        let mut offsets: HashMap<&str, u32> = HashMap::new();
        let mut intern = |s: &'a str| -> u32 {
            *offsets.entry(s).or_insert_with(|| {
                let offset = names.len() as u32;
                names.extend_from_slice(s.as_bytes());
                names.push(0);
                offset
            })
        };

        let mut rows = Vec::with_capacity(self.entries.len() * ROW_BYTES);
        for entry in &self.entries {
            let name_offset = intern(&entry.effect_name);
            let label_offset = intern(&entry.label);
            for word in [
                entry.effect_id.low(),
                entry.effect_id.high(),
                name_offset,
                entry.op_id.0,
                entry.kind.as_u32(),
                entry.signature_hash,
                label_offset,
            ] {
                rows.extend_from_slice(&word.to_le_bytes());
            }
        }

        let body_len = 8 + rows.len() + names.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&EFFECT_TABLE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&rows);
        out.extend_from_slice(&names);
        out
    }

    /// Parse section bytes. Exact structural inverse of [`EffectTable::encode`].
    pub fn parse(bytes: &[u8]) -> Result<Self, TableError> {
        let body_len = read_word(bytes, 0)? as usize;
        let needed = 4 + body_len;
        if bytes.len() < needed {
            return Err(TableError::Truncated { needed, found: bytes.len() });
        }
        if bytes.len() > needed {
            return Err(TableError::TrailingBytes(bytes.len() - needed));
        }
        let body = &bytes[4..];

        let version = read_word(body, 0)?;
        if version != EFFECT_TABLE_VERSION {
            return Err(TableError::UnsupportedVersion(version));
        }
        let count = read_word(body, 4)? as usize;
        let rows_end = count
            .checked_mul(ROW_BYTES)
            .and_then(|n| n.checked_add(8))
            .ok_or(TableError::Truncated { needed: usize::MAX, found: body.len() })?;
        if body.len() < rows_end {
            return Err(TableError::Truncated { needed: rows_end + 4, found: bytes.len() });
        }
        let names = &body[rows_end..];

        let mut entries = Vec::with_capacity(count);
        for row in 0..count {
            let base = 8 + row * ROW_BYTES;
            let mut words = [0u32; ROW_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                *word = read_word(body, base + i * 4)?;
            }
            let [low, high, name_offset, op_id, raw_kind, signature_hash, label_offset] = words;
            let kind = ResumptionKind::from_u32(raw_kind).ok_or(TableError::InvalidKind { row, raw: raw_kind })?;
            entries.push(EffectTableEntry {
                effect_id: EffectId::from_parts(low, high),
                effect_name: read_name(names, row, name_offset)?,
                op_id: OpId(op_id),
                op_index: OpIndex(row as u32),
                kind,
                signature_hash,
                label: read_name(names, row, label_offset)?,
            });
        }
        Self::from_entries(entries)
    }
}

fn read_word(bytes: &[u8], at: usize) -> Result<u32, TableError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(TableError::Truncated { needed: at + 4, found: bytes.len() })?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(u32::from_le_bytes(buf))
}

fn read_name(names: &[u8], row: usize, offset: u32) -> Result<String, TableError> {
    let start = offset as usize;
    if start >= names.len() {
        return Err(TableError::OffsetOutOfRange { row, offset });
    }
    let len = names[start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or(TableError::UnterminatedName { row, offset })?;
    std::str::from_utf8(&names[start..start + len])
        .map(str::to_string)
        .map_err(|_| TableError::InvalidUtf8 { row, offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::signature_hash;

    fn entry(effect: &str, op: u32, index: u32, label: &str, kind: ResumptionKind) -> EffectTableEntry {
        EffectTableEntry {
            effect_id: EffectId::of(effect),
            effect_name: effect.to_string(),
            op_id: OpId(op),
            op_index: OpIndex(index),
            kind,
            signature_hash: signature_hash(label),
            label: label.to_string(),
        }
    }

    fn sample() -> EffectTable {
        EffectTable::from_entries(vec![
            entry("Log", 0, 0, "info", ResumptionKind::Tail),
            entry("Async", 0, 1, "await", ResumptionKind::Resume),
            entry("Async", 1, 2, "yield", ResumptionKind::Resume),
        ])
        .unwrap()
    }

    #[test]
    fn test_encode_header() {
        let bytes = sample().encode();
        assert_eq!(read_word(&bytes, 0).unwrap() as usize, bytes.len() - 4);
        assert_eq!(read_word(&bytes, 4).unwrap(), EFFECT_TABLE_VERSION);
        assert_eq!(read_word(&bytes, 8).unwrap(), 3);
    }

    #[test]
    fn test_names_are_shared() {
        let bytes = sample().encode();
        let names = &bytes[4 + 8 + 3 * ROW_BYTES..];
        assert_eq!(names, b"Log\0info\0Async\0await\0yield\0");
    }

    #[test]
    fn test_parse_roundtrip_and_lookups() {
        let table = EffectTable::parse(&sample().encode()).unwrap();
        assert_eq!(table.entries(), sample().entries());
        let await_op = table.by_name(EffectId::of("Async"), "await").unwrap();
        assert_eq!(await_op.op_index, OpIndex(1));
        assert_eq!(table.lookup(EffectId::of("Async"), OpId(1)).unwrap().label, "yield");
        assert_eq!(table.by_index(OpIndex(0)).unwrap().kind, ResumptionKind::Tail);
        assert_eq!(table.effects().len(), 2);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = sample().encode();
        assert!(matches!(
            EffectTable::parse(&bytes[..bytes.len() - 3]),
            Err(TableError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut bytes = sample().encode();
        bytes[4] = 9;
        assert_eq!(EffectTable::parse(&bytes).unwrap_err(), TableError::UnsupportedVersion(9));
    }

    #[test]
    fn test_parse_rejects_bad_kind() {
        let mut bytes = sample().encode();
        // resumeKind is the fifth word of the first row
        let at = 4 + 8 + 4 * 4;
        bytes[at] = 5;
        assert_eq!(EffectTable::parse(&bytes).unwrap_err(), TableError::InvalidKind { row: 0, raw: 5 });
    }

    #[test]
    fn test_parse_rejects_offset_out_of_range() {
        let mut bytes = sample().encode();
        let at = 4 + 8 + 2 * 4;
        bytes[at..at + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(
            EffectTable::parse(&bytes).unwrap_err(),
            TableError::OffsetOutOfRange { row: 0, offset: 1000 }
        );
    }

    #[test]
    fn test_empty_table() {
        let table = EffectTable::default();
        let parsed = EffectTable::parse(&table.encode()).unwrap();
        assert!(parsed.is_empty());
    }
}
