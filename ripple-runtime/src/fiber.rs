//! # Fibers
//!
//! Suspendable segments of the machine's frame stack, used by the
//! stack-switching backend.
//!
//! A fiber runs above a boundary marker on the machine stack. Suspending moves
//! every frame above the nearest boundary into the fiber and bumps its epoch;
//! the continuation handed out names that epoch, so each suspension can be
//! resumed once. Resuming an older epoch, or a finished fiber, traps.

use crate::artifact::{FuncId, LocalId};
use crate::error::Trap;
use crate::value::Value;
use crate::vm::ActiveFrame;

/// Index of a fiber in the machine's fiber table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub u32);

#[derive(Debug)]
enum FiberState {
    Fresh { func: FuncId, args: Vec<Value> },
    Running { epoch: u32 },
    Suspended { frames: Vec<ActiveFrame>, dest: LocalId, epoch: u32 },
    Done,
    /// Swept slot, available to the next spawn.
    Free,
}

/// How to enter a fiber that is being resumed.
#[derive(Debug)]
pub(crate) enum FiberEntry {
    /// First resumption: call the body.
    Start { func: FuncId, args: Vec<Value> },
    /// Later resumption: reinstate the saved frames; the resume value goes to
    /// `dest` in the topmost one.
    Continue { frames: Vec<ActiveFrame>, dest: LocalId },
}

#[derive(Debug, Default)]
pub(crate) struct FiberTable {
    fibers: Vec<FiberState>,
    free: Vec<u32>,
}

impl FiberTable {
    pub(crate) fn spawn(&mut self, func: FuncId, args: Vec<Value>) -> FiberId {
        let state = FiberState::Fresh { func, args };
        match self.free.pop() {
            Some(slot) => {
                self.fibers[slot as usize] = state;
                FiberId(slot)
            }
            None => {
                let id = FiberId(self.fibers.len() as u32);
                self.fibers.push(state);
                id
            }
        }
    }

    pub(crate) fn enter(&mut self, id: FiberId, epoch: u32) -> Result<FiberEntry, Trap> {
        let consumed = Trap::ContinuationConsumed { fiber: id.0 };
        let slot = self.fibers.get_mut(id.0 as usize).ok_or(consumed.clone())?;
        match std::mem::replace(slot, FiberState::Running { epoch }) {
            FiberState::Fresh { func, args } if epoch == 0 => Ok(FiberEntry::Start { func, args }),
            FiberState::Suspended { frames, dest, epoch: current } if current == epoch => {
                Ok(FiberEntry::Continue { frames, dest })
            }
            previous => {
                *slot = previous;
                Err(consumed)
            }
        }
    }

    /// Park the frames of a running fiber; returns the epoch of the new suspension.
    pub(crate) fn park(&mut self, id: FiberId, frames: Vec<ActiveFrame>, dest: LocalId) -> Result<u32, Trap> {
        let slot = self
            .fibers
            .get_mut(id.0 as usize)
            .ok_or(Trap::ContinuationConsumed { fiber: id.0 })?;
        let FiberState::Running { epoch } = *slot else {
            return Err(Trap::ContinuationConsumed { fiber: id.0 });
        };
        let next = epoch + 1;
        *slot = FiberState::Suspended { frames, dest, epoch: next };
        Ok(next)
    }

    pub(crate) fn finish(&mut self, id: FiberId) {
        if let Some(slot) = self.fibers.get_mut(id.0 as usize) {
            *slot = FiberState::Done;
        }
    }

    /// Values held by a fiber that has not finished.
    pub(crate) fn saved_values(&self, id: FiberId, out: &mut Vec<Value>) {
        match self.fibers.get(id.0 as usize) {
            Some(FiberState::Fresh { args, .. }) => out.extend(args.iter().cloned()),
            Some(FiberState::Suspended { frames, .. }) => {
                for frame in frames {
                    out.extend(frame.locals().iter().cloned());
                }
            }
            _ => {}
        }
    }

    /// Free every fiber for which `keep` is false. Only called with an empty
    /// machine stack, so a fiber still marked running was abandoned by a trap.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(FiberId) -> bool) -> usize {
        let mut freed = 0;
        for (slot, state) in self.fibers.iter_mut().enumerate() {
            if !matches!(state, FiberState::Free) && !keep(FiberId(slot as u32)) {
                *state = FiberState::Free;
                self.free.push(slot as u32);
                freed += 1;
            }
        }
        freed
    }

    pub(crate) fn clear(&mut self) {
        self.fibers.clear();
        self.free.clear();
    }

    /// Fibers not yet swept.
    pub(crate) fn len(&self) -> usize {
        self.fibers.len() - self.free.len()
    }
}
