//! # Handler Frame Arena
//!
//! Handler frames form a singly linked, dynamically scoped stack. Frames are
//! stored in a per-run arena and referenced by [`FrameId`]; a frame is never
//! mutated after it is pushed.
//!
//! Popping is implicit: generated code threads the current frame through a
//! hidden parameter, so leaving a `handle` block (by returning, by an effect
//! bubbling past it, or by a trap) simply restores the enclosing frame value.
//! A frame may still be reachable from a stored continuation after its block
//! exited, which is exactly what a later resumption needs. The machine sweeps
//! the arena at host boundaries, keeping the frames still reachable from
//! published requests; swept slots are reused by later pushes so a frame id
//! stays stable for as long as the frame is live.

use std::fmt;

use crate::abi::{EffectId, OpId};
use crate::artifact::FuncId;
use crate::error::Trap;
use crate::value::Value;

/// Index of a frame in a [`HandlerArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame{}", self.0)
    }
}

/// An installed handler.
#[derive(Debug)]
pub struct HandlerFrame {
    pub prev: Option<FrameId>,
    /// Operations this frame handles.
    pub matches: Vec<(EffectId, OpId)>,
    /// Clause function: `(cur, env, request) -> outcome`.
    pub clause: FuncId,
    pub env: Value,
}

impl HandlerFrame {
    pub fn handles(&self, effect: EffectId, op: OpId) -> bool {
        self.matches.iter().any(|(e, o)| *e == effect && *o == op)
    }
}

/// Per-run storage for handler frames.
#[derive(Debug, Default)]
pub struct HandlerArena {
    frames: Vec<Option<HandlerFrame>>,
    free: Vec<u32>,
}

impl HandlerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: HandlerFrame) -> FrameId {
        match self.free.pop() {
            Some(slot) => {
                self.frames[slot as usize] = Some(frame);
                FrameId(slot)
            }
            None => {
                let id = FrameId(self.frames.len() as u32);
                self.frames.push(Some(frame));
                id
            }
        }
    }

    pub fn get(&self, id: FrameId) -> Result<&HandlerFrame, Trap> {
        self.slot(id).ok_or(Trap::InvalidFrame(id.0))
    }

    fn slot(&self, id: FrameId) -> Option<&HandlerFrame> {
        self.frames.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Live frames.
    pub fn len(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots allocated so far, live or free.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Free every live frame for which `keep` is false.
    pub fn retain(&mut self, mut keep: impl FnMut(FrameId) -> bool) -> usize {
        let mut freed = 0;
        for (slot, frame) in self.frames.iter_mut().enumerate() {
            if frame.is_some() && !keep(FrameId(slot as u32)) {
                *frame = None;
                self.free.push(slot as u32);
                freed += 1;
            }
        }
        freed
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.free.clear();
    }

    /// Walk from `from` towards the root, stopping before `stop`, and return
    /// the innermost frame handling `(effect, op)`.
    pub fn find(
        &self,
        from: Option<FrameId>,
        stop: Option<FrameId>,
        effect: EffectId,
        op: OpId,
    ) -> Result<Option<FrameId>, Trap> {
        let mut cursor = from;
        while let Some(id) = cursor {
            if Some(id) == stop {
                break;
            }
            let frame = self.get(id)?;
            if frame.handles(effect, op) {
                return Ok(Some(id));
            }
            cursor = frame.prev;
        }
        Ok(None)
    }

    /// Number of frames on the chain starting at `from`.
    pub fn depth(&self, from: Option<FrameId>) -> usize {
        let mut depth = 0;
        let mut cursor = from;
        while let Some(frame) = cursor.and_then(|id| self.slot(id)) {
            depth += 1;
            cursor = frame.prev;
        }
        depth
    }
}
