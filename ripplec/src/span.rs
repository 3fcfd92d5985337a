//! Source span tracking.
//!
//! The compiler consumes an already-typed program, so spans come from the
//! front end that built it. Programs built in code use [`Span::dummy`] or
//! spans handed out by the builder.

use serde::{Deserialize, Serialize};

/// A precomputed index of line start positions for O(log n) line/column lookup.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offsets where each line starts; `line_starts[0] == 0`.
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (offset, ch) in source.char_indices() {
            if ch == '\n' {
                line_starts.push(offset + 1);
            }
        }
        Self { line_starts }
    }

    /// 1-indexed line and column of a byte offset.
    pub fn line_col(&self, offset: usize) -> (u32, u32) {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line = (line_idx + 1) as u32;
        let col = (offset - self.line_starts[line_idx] + 1) as u32;
        (line, col)
    }

    /// Build a span for `start..end`.
    pub fn span(&self, start: usize, end: usize) -> Span {
        let (line, col) = self.line_col(start);
        Span::new(start, end, line, col)
    }
}

/// A contiguous region of source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the start (inclusive).
    pub start: usize,
    /// Byte offset of the end (exclusive).
    pub end: usize,
    /// 1-indexed line number of the start.
    pub start_line: u32,
    /// 1-indexed column number of the start.
    pub start_col: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, start_line: u32, start_col: u32) -> Self {
        Self {
            start,
            end,
            start_line,
            start_col,
        }
    }

    /// A span for synthesized code.
    pub fn dummy() -> Self {
        Self {
            start: 0,
            end: 0,
            start_line: 0,
            start_col: 0,
        }
    }

    /// A zero-width span at `offset`, used by builders that number nodes
    /// instead of tracking source text.
    pub fn point(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
            start_line: 0,
            start_col: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_dummy(&self) -> bool {
        *self == Span::dummy()
    }

    /// Merge two spans into one that covers both.
    pub fn merge(self, other: Span) -> Span {
        let start = self.start.min(other.start);
        let end = self.end.max(other.end);
        let (start_line, start_col) = if self.start <= other.start {
            (self.start_line, self.start_col)
        } else {
            (other.start_line, other.start_col)
        };
        Span {
            start,
            end,
            start_line,
            start_col,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::dummy()
    }
}
