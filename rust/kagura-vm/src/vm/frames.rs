//! Frame arena.
//!
//! Frames live in a slab addressed by [`FrameId`]. A frame's parent is the
//! frame that entered it; variable lookup walks that chain by lexical level.
//! A frame is kept alive while it is executing or while any live frame names
//! it as parent, so a microthread may keep reading its spawner's locals after
//! the spawner returned.

use super::MachineError;
use crate::program::{BlockId, BlockKind};
use kagura_core::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FrameId(u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) parent: Option<FrameId>,
    pub(crate) block: BlockId,
    pub(crate) kind: BlockKind,
    pub(crate) level: u32,
    pub(crate) ip: usize,
    /// Code length of `block`; `ip == end` means the frame is done.
    pub(crate) end: usize,
    pub(crate) slots: Vec<Value>,
    pub(crate) stack: Vec<Value>,
    /// Push `result` onto the parent's stack on exit.
    pub(crate) has_result: bool,
    pub(crate) result: Value,
    pins: u32,
    retired: bool,
}

impl Frame {
    pub(crate) fn new(
        parent: Option<FrameId>,
        block: BlockId,
        kind: BlockKind,
        level: u32,
        end: usize,
        slots: Vec<Value>,
    ) -> Self {
        Self {
            parent,
            block,
            kind,
            level,
            ip: 0,
            end,
            slots,
            stack: Vec::new(),
            has_result: false,
            result: Value::empty(),
            pins: 0,
            retired: false,
        }
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, MachineError> {
        self.stack.pop().ok_or(MachineError::StackUnderflow)
    }

    pub(crate) fn peek(&self) -> Result<&Value, MachineError> {
        self.stack.last().ok_or(MachineError::StackUnderflow)
    }

    /// Pop the top `n` values, preserving their push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, MachineError> {
        let len = self.stack.len();
        if len < n {
            return Err(MachineError::StackUnderflow);
        }
        Ok(self.stack.split_off(len - n))
    }
}

#[derive(Debug, Default)]
pub(crate) struct FrameArena {
    frames: Vec<Option<Frame>>,
    free: Vec<u32>,
    live: usize,
}

impl FrameArena {
    /// Store `frame`, pinning its parent for as long as it lives.
    pub(crate) fn alloc(&mut self, frame: Frame) -> FrameId {
        if let Some(parent) = frame.parent {
            self.pin(parent);
        }
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.frames[index as usize] = Some(frame);
                FrameId(index)
            }
            None => {
                self.frames.push(Some(frame));
                FrameId((self.frames.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn get(&self, id: FrameId) -> Result<&Frame, MachineError> {
        self.frames
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| MachineError::Runtime(format!("frame {} is not live", id)))
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> Result<&mut Frame, MachineError> {
        self.frames
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| MachineError::Runtime(format!("frame {} is not live", id)))
    }

    pub(crate) fn parent_of(&self, id: FrameId) -> Option<FrameId> {
        self.get(id).ok().and_then(|frame| frame.parent)
    }

    pub(crate) fn pin(&mut self, id: FrameId) {
        if let Ok(frame) = self.get_mut(id) {
            frame.pins += 1;
        }
    }

    /// Drop one pin; frees the frame if it is retired and unpinned.
    pub(crate) fn release(&mut self, id: FrameId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Ok(frame) = self.get_mut(id) else { return };
            frame.pins = frame.pins.saturating_sub(1);
            if frame.retired && frame.pins == 0 {
                next = self.free(id);
            }
        }
    }

    /// Mark the frame as finished executing.
    pub(crate) fn retire(&mut self, id: FrameId) {
        let Ok(frame) = self.get_mut(id) else { return };
        frame.retired = true;
        if frame.pins == 0 {
            if let Some(parent) = self.free(id) {
                self.release(parent);
            }
        }
    }

    /// Walk from `from` towards the root until reaching `level`.
    pub(crate) fn resolve(&self, from: FrameId, level: u32) -> Result<FrameId, MachineError> {
        let mut id = from;
        loop {
            let frame = self.get(id)?;
            if frame.level == level {
                return Ok(id);
            }
            match frame.parent {
                Some(parent) if frame.level > level => id = parent,
                _ => return Err(MachineError::UnknownLevel(level)),
            }
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    fn free(&mut self, id: FrameId) -> Option<FrameId> {
        let frame = self.frames.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        frame.parent
    }
}
