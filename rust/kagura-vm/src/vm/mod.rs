//! Cooperative script machine.
//!
//! A [`ScriptMachine`] executes one [`Program`] as a set of cooperative
//! threads. The host drives it one tick at a time:
//!
//! - [`ScriptMachine::run`] starts the entry block and runs the first tick.
//! - [`ScriptMachine::resume`] advances the waiting set and runs one tick.
//! - [`ScriptMachine::call`] spawns an event handler thread.
//!
//! During a tick every ready thread runs until it yields, waits, finishes or
//! the machine stops. Threads that yield are requeued at the back and run
//! again within the same tick; `Wait(n)` parks a thread for `n` ticks.
//!
//! Errors are sticky: the first runtime error stops the machine and is kept
//! together with the source line it happened on.

mod frames;
mod ops;
mod threads;

pub use threads::ThreadId;

use crate::config::MachineConfig;
use crate::program::{BlockId, BlockKind, Callee, Op, Program, VarRef};
use frames::{Frame, FrameArena, FrameId};
use kagura_core::values::ValueError;
use kagura_core::{TypeRegistry, Value};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use threads::ThreadSet;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MachineError {
    #[error("type error at runtime: {0}")]
    TypeMismatch(String),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("no frame at lexical level {0}")]
    UnknownLevel(u32),
    #[error("variable slot {slot} out of range at level {level}")]
    SlotOutOfRange { level: u32, slot: u32 },
    #[error("unknown block #{0}")]
    UnknownBlock(u32),
    #[error("unknown native function #{0}")]
    UnknownNative(u32),
    #[error("no such event: {0}")]
    UnknownEvent(String),
    #[error("jump target {target} outside block of length {len}")]
    InvalidJump { target: usize, len: usize },
    #[error("'{name}' expects {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("break outside of a loop")]
    BreakOutsideLoop,
    #[error("{0}")]
    Script(String),
    #[error("terminated: {0}")]
    Terminated(String),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
    #[error("thread limit exceeded: {0}")]
    ThreadLimitExceeded(usize),
    #[error("program has no entry block")]
    NoEntryBlock,
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("machine already started")]
    AlreadyStarted,
    #[error("machine not started")]
    NotStarted,
    #[error("machine is already running")]
    Reentrant,
    #[error("machine has stopped")]
    Halted,
}

impl MachineError {
    /// Message as reported by [`ScriptMachine::get_error_message`]. Script
    /// raised and host-terminated errors keep their text verbatim.
    pub fn message(&self) -> String {
        match self {
            MachineError::Script(message) | MachineError::Terminated(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// One entry of a captured script stack, innermost last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub block: String,
    pub ip: usize,
    pub line: u32,
}

impl StackFrame {
    pub fn format_trace(frames: &[StackFrame]) -> String {
        let mut msg = String::from("Stack trace (most recent call last):");
        for (i, frame) in frames.iter().rev().enumerate() {
            msg.push_str(&format!(
                "\n  #{}: {} (line {}, instruction {})",
                i, frame.block, frame.line, frame.ip
            ));
        }
        msg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    /// Constructed; `run` has not been called.
    Idle,
    /// Inside a host entry point.
    Running,
    /// Threads remain; the host should `resume` next tick.
    Suspended,
    /// Stopped, or every thread has finished.
    Finished,
}

/// Result of one host entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Suspended,
    Finished,
}

/// Why a thread's slice ended.
enum Slice {
    Yielded,
    Waiting(u32),
    Finished,
    Halted,
}

pub struct ScriptMachine {
    program: Rc<Program>,
    registry: Rc<TypeRegistry>,
    config: MachineConfig,
    frames: FrameArena,
    threads: ThreadSet,
    globals: Option<FrameId>,
    current_thread: Option<ThreadId>,
    state: MachineState,
    stopped: bool,
    terminated: bool,
    error: Option<MachineError>,
    error_line: Option<u32>,
    current_line: u32,
    instructions: u64,
    ticks: u64,
    data: Option<Box<dyn Any>>,
}

impl fmt::Debug for ScriptMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptMachine")
            .field("state", &self.state)
            .field("threads", &self.threads.len())
            .field("frames", &self.frames.live())
            .field("ticks", &self.ticks)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl ScriptMachine {
    pub fn new(program: Rc<Program>) -> Self {
        Self::with_config(program, MachineConfig::default())
    }

    pub fn with_config(program: Rc<Program>, config: MachineConfig) -> Self {
        let registry = Rc::clone(program.registry());
        Self {
            program,
            registry,
            config,
            frames: FrameArena::default(),
            threads: ThreadSet::default(),
            globals: None,
            current_thread: None,
            state: MachineState::Idle,
            stopped: false,
            terminated: false,
            error: None,
            error_line: None,
            current_line: 0,
            instructions: 0,
            ticks: 0,
            data: None,
        }
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Ticks started so far; `run` is tick 1.
    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    // --- Host entry points ---

    /// Start the entry block on the main thread and run the first tick.
    pub fn run(&mut self) -> Result<TickOutcome, MachineError> {
        if self.state != MachineState::Idle {
            return Err(MachineError::AlreadyStarted);
        }
        if self.stopped {
            return Err(MachineError::Halted);
        }
        let main = self.program.main_block().ok_or(MachineError::NoEntryBlock)?;
        let root = self.enter_block(None, main, Vec::new())?;
        // Globals outlive the main thread so event handlers can read them.
        self.frames.pin(root);
        self.globals = Some(root);
        let id = self.threads.spawn(root);
        self.ticks = 1;
        debug!(thread = %id, "main thread started");
        self.drain_ready()
    }

    /// Advance one tick: count down waiting threads, then run every ready
    /// thread.
    pub fn resume(&mut self) -> Result<TickOutcome, MachineError> {
        match self.state {
            MachineState::Idle => return Err(MachineError::NotStarted),
            MachineState::Running => return Err(MachineError::Reentrant),
            _ => {}
        }
        if self.stopped {
            return Ok(TickOutcome::Finished);
        }
        self.ticks += 1;
        let woken = self.threads.wake_elapsed();
        debug!(tick = self.ticks, woken, threads = self.threads.len(), "tick");
        self.drain_ready()
    }

    /// Spawn the handler registered for `name`. See [`call_with`](Self::call_with).
    pub fn call(&mut self, name: &str) -> Result<TickOutcome, MachineError> {
        self.call_with(name, Vec::new())
    }

    /// Spawn the handler registered for `name` with `args` bound to its
    /// first slots.
    ///
    /// An unknown name fails with [`MachineError::UnknownEvent`] and leaves
    /// the machine untouched. An idle machine runs its first tick before the
    /// handler is spawned. The handler then runs within the same tick,
    /// together with every other ready thread. Called from a native function
    /// while the machine is running, the handler is only queued and runs
    /// later in the current tick.
    pub fn call_with(&mut self, name: &str, args: Vec<Value>) -> Result<TickOutcome, MachineError> {
        let block_id = self
            .program
            .event(name)
            .ok_or_else(|| MachineError::UnknownEvent(name.to_string()))?;
        let block = self
            .program
            .block(block_id)
            .ok_or(MachineError::UnknownBlock(block_id.0))?;
        if block.arguments != args.len() {
            return Err(MachineError::ArgumentCount {
                name: name.to_string(),
                expected: block.arguments,
                got: args.len(),
            });
        }
        if self.stopped {
            return Err(MachineError::Halted);
        }
        if self.state == MachineState::Idle {
            self.run()?;
            if self.stopped {
                return Err(MachineError::Halted);
            }
        }

        let root = self.enter_block(self.globals, block_id, args)?;
        let id = match self.spawn_thread(root) {
            Ok(id) => id,
            Err(err) if self.state == MachineState::Running => return Err(err),
            Err(err) => {
                self.fail(err.clone());
                self.state = MachineState::Finished;
                return Err(err);
            }
        };
        debug!(event = name, thread = %id, "event thread spawned");

        if self.state == MachineState::Running {
            return Ok(TickOutcome::Suspended);
        }
        self.drain_ready()
    }

    // --- Stopping and errors ---

    /// Stop the machine. No further instruction runs.
    pub fn stop(&mut self) {
        self.stopped = true;
        if self.state != MachineState::Running && self.state != MachineState::Idle {
            self.state = MachineState::Finished;
        }
    }

    /// Record a script error and stop.
    pub fn raise_error(&mut self, message: impl Into<String>) {
        self.fail(MachineError::Script(message.into()));
        self.stop();
    }

    /// Like [`raise_error`](Self::raise_error), and marks the stop as host
    /// initiated.
    pub fn terminate(&mut self, message: impl Into<String>) {
        self.terminated = true;
        self.fail(MachineError::Terminated(message.into()));
        self.stop();
    }

    pub fn get_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stopped, or started with no thread left.
    pub fn is_finished(&self) -> bool {
        self.stopped || (self.state != MachineState::Idle && self.threads.is_empty())
    }

    pub fn get_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn last_error(&self) -> Option<&MachineError> {
        self.error.as_ref()
    }

    pub fn get_error_message(&self) -> Option<String> {
        self.error.as_ref().map(MachineError::message)
    }

    /// Source line of the instruction that was executing when the error was
    /// recorded.
    pub fn get_error_line(&self) -> Option<u32> {
        self.error_line
    }

    // --- Introspection ---

    /// Line of the most recently executed instruction.
    pub fn get_current_line(&self) -> u32 {
        self.current_line
    }

    pub fn get_thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Thread executing right now; `None` outside a tick.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.ids().collect()
    }

    /// Ticks left before a waiting thread becomes ready.
    pub fn waiting_ticks(&self, id: ThreadId) -> Option<u32> {
        self.threads.waiting_ticks(id)
    }

    pub fn is_event_exists(&self, name: &str) -> bool {
        self.program.event(name).is_some()
    }

    /// Live frames, including the pinned globals.
    pub fn frame_count(&self) -> usize {
        self.frames.live()
    }

    /// Alias of a slot in the entry block's frame, once `run` has started.
    pub fn global(&self, slot: usize) -> Option<Value> {
        let frame = self.frames.get(self.globals?).ok()?;
        frame.slots.get(slot).cloned()
    }

    /// Remove a thread. Its frames are released once nothing refers to
    /// them. Returns `false` if the thread does not exist.
    pub fn close_thread(&mut self, id: ThreadId) -> bool {
        let Some(thread) = self.threads.remove(id) else {
            return false;
        };
        let mut cursor = Some(thread.current);
        while let Some(frame) = cursor {
            cursor = self.frames.parent_of(frame);
            self.frames.retire(frame);
            if frame == thread.root {
                break;
            }
        }
        debug!(thread = %id, "thread closed");
        true
    }

    /// Stack of the current thread, outermost first. Empty outside a tick.
    pub fn capture_stack_trace(&self) -> Vec<StackFrame> {
        let Some(thread) = self.current_thread.and_then(|id| self.threads.get(id)) else {
            return Vec::new();
        };
        let mut trace = Vec::new();
        let mut cursor = Some(thread.current);
        while let Some(id) = cursor {
            let Ok(frame) = self.frames.get(id) else { break };
            let block = self.program.block(frame.block);
            let line = block
                .and_then(|b| b.codes.get(frame.ip.saturating_sub(1)))
                .map_or(0, |code| code.line);
            trace.push(StackFrame {
                block: block.map_or_else(|| format!("<block #{}>", frame.block.0), |b| {
                    b.display_name().to_string()
                }),
                ip: frame.ip,
                line,
            });
            if id == thread.root {
                break;
            }
            cursor = frame.parent;
        }
        trace.reverse();
        trace
    }

    // --- Host data ---

    pub fn set_data<T: Any>(&mut self, data: T) {
        self.data = Some(Box::new(data));
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }

    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_deref_mut().and_then(|d| d.downcast_mut::<T>())
    }

    pub fn take_data(&mut self) -> Option<Box<dyn Any>> {
        self.data.take()
    }

    // --- Scheduling ---

    fn drain_ready(&mut self) -> Result<TickOutcome, MachineError> {
        self.instructions = 0;
        self.state = MachineState::Running;
        while !self.stopped {
            let Some(id) = self.threads.next_ready() else { break };
            self.current_thread = Some(id);
            match self.run_slice(id) {
                Ok(Slice::Yielded) => self.threads.requeue(id),
                Ok(Slice::Waiting(ticks)) => self.threads.park(id, ticks),
                Ok(Slice::Finished) => debug!(thread = %id, "thread finished"),
                Ok(Slice::Halted) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        self.current_thread = None;

        if self.stopped || self.threads.is_empty() {
            self.state = MachineState::Finished;
        } else {
            self.state = MachineState::Suspended;
        }
        match &self.error {
            Some(err) if self.stopped => Err(err.clone()),
            _ if self.state == MachineState::Finished => Ok(TickOutcome::Finished),
            _ => Ok(TickOutcome::Suspended),
        }
    }

    fn spawn_thread(&mut self, root: FrameId) -> Result<ThreadId, MachineError> {
        if let Some(max) = self.config.max_threads {
            if self.threads.len() >= max {
                self.frames.retire(root);
                return Err(MachineError::ThreadLimitExceeded(max));
            }
        }
        Ok(self.threads.spawn(root))
    }

    /// Keep the first error; every error stops the machine.
    fn fail(&mut self, err: MachineError) {
        if self.error.is_none() {
            let trace = self.capture_stack_trace();
            warn!(
                line = self.current_line,
                error = %err,
                trace = %StackFrame::format_trace(&trace),
                "script error"
            );
            self.error = Some(err);
            self.error_line = Some(self.current_line);
        }
        self.stopped = true;
    }

    fn count_instruction(&mut self) -> Result<(), MachineError> {
        self.instructions += 1;
        match self.config.instruction_limit {
            Some(limit) if self.instructions > limit => {
                Err(MachineError::InstructionLimitExceeded(limit))
            }
            _ => Ok(()),
        }
    }

    // --- Frames ---

    fn enter_block(
        &mut self,
        parent: Option<FrameId>,
        block_id: BlockId,
        args: Vec<Value>,
    ) -> Result<FrameId, MachineError> {
        let block = self
            .program
            .block(block_id)
            .ok_or(MachineError::UnknownBlock(block_id.0))?;
        let mut slots = vec![Value::empty(); block.slots.max(block.arguments)];
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = arg;
        }
        let frame = Frame::new(parent, block_id, block.kind, block.level, block.len(), slots);
        Ok(self.frames.alloc(frame))
    }

    /// Leave the thread's current frame. Returns `true` when that was the
    /// thread root and the thread is gone.
    fn exit_frame(&mut self, id: ThreadId) -> Result<bool, MachineError> {
        let thread = self
            .threads
            .get(id)
            .ok_or_else(|| MachineError::Runtime(format!("thread {} is gone", id)))?;
        let (current, root) = (thread.current, thread.root);
        if current == root {
            self.threads.remove(id);
            self.frames.retire(current);
            return Ok(true);
        }

        let frame = self.frames.get_mut(current)?;
        let parent = frame
            .parent
            .ok_or_else(|| MachineError::Runtime(format!("frame {} has no caller", current)))?;
        let result = frame.has_result.then(|| std::mem::take(&mut frame.result));
        self.frames.retire(current);
        if let Some(value) = result {
            self.frames.get_mut(parent)?.push(value);
        }
        if let Some(thread) = self.threads.get_mut(id) {
            thread.current = parent;
            thread.depth = thread.depth.saturating_sub(1);
        }
        Ok(false)
    }

    fn slot_mut(&mut self, from: FrameId, var: VarRef) -> Result<&mut Value, MachineError> {
        let target = self.frames.resolve(from, var.level)?;
        self.frames
            .get_mut(target)?
            .slots
            .get_mut(var.slot as usize)
            .ok_or(MachineError::SlotOutOfRange {
                level: var.level,
                slot: var.slot,
            })
    }

    fn pop(&mut self, frame: FrameId) -> Result<Value, MachineError> {
        self.frames.get_mut(frame)?.pop()
    }

    fn push(&mut self, frame: FrameId, value: Value) -> Result<(), MachineError> {
        self.frames.get_mut(frame)?.push(value);
        Ok(())
    }

    fn jump(&mut self, frame: FrameId, target: usize) -> Result<(), MachineError> {
        let frame = self.frames.get_mut(frame)?;
        if target > frame.end {
            return Err(MachineError::InvalidJump {
                target,
                len: frame.end,
            });
        }
        frame.ip = target;
        Ok(())
    }

    fn pop_condition(&mut self, frame: FrameId) -> Result<bool, MachineError> {
        Ok(self.pop(frame)?.as_boolean()?)
    }

    fn peek_condition(&self, frame: FrameId) -> Result<bool, MachineError> {
        Ok(self.frames.get(frame)?.peek()?.as_boolean()?)
    }

    /// End every frame up to the innermost loop body and skip the caller's
    /// `LoopBack`.
    fn break_loop(&mut self, id: ThreadId, from: FrameId) -> Result<(), MachineError> {
        let root = self.thread_root(id)?;
        let mut cursor = from;
        loop {
            let frame = self.frames.get_mut(cursor)?;
            frame.ip = frame.end;
            if cursor == root || frame.kind.is_routine() {
                return Err(MachineError::BreakOutsideLoop);
            }
            let parent = frame.parent.ok_or(MachineError::BreakOutsideLoop)?;
            if frame.kind == BlockKind::Loop {
                self.frames.get_mut(parent)?.ip += 1;
                return Ok(());
            }
            cursor = parent;
        }
    }

    /// End every frame up to and including the innermost routine.
    fn break_routine(&mut self, id: ThreadId, from: FrameId) -> Result<(), MachineError> {
        let root = self.thread_root(id)?;
        let mut cursor = from;
        loop {
            let frame = self.frames.get_mut(cursor)?;
            frame.ip = frame.end;
            if cursor == root || frame.kind.is_routine() {
                return Ok(());
            }
            cursor = frame
                .parent
                .ok_or_else(|| MachineError::Runtime(format!("frame {} has no caller", cursor)))?;
        }
    }

    /// Innermost function frame, whose result `SetResult` writes.
    fn result_frame(&self, id: ThreadId, from: FrameId) -> Result<FrameId, MachineError> {
        let root = self.thread_root(id)?;
        let mut cursor = from;
        loop {
            let frame = self.frames.get(cursor)?;
            if frame.kind == BlockKind::Function {
                return Ok(cursor);
            }
            match frame.parent {
                Some(parent) if cursor != root && !frame.kind.is_routine() => cursor = parent,
                _ => {
                    return Err(MachineError::Runtime(
                        "result set outside of a function".to_string(),
                    ))
                }
            }
        }
    }

    fn thread_root(&self, id: ThreadId) -> Result<FrameId, MachineError> {
        self.threads
            .get(id)
            .map(|t| t.root)
            .ok_or_else(|| MachineError::Runtime(format!("thread {} is gone", id)))
    }

    // --- Dispatch ---

    fn run_slice(&mut self, id: ThreadId) -> Result<Slice, MachineError> {
        let program = Rc::clone(&self.program);
        let registry = Rc::clone(&self.registry);
        loop {
            if self.stopped {
                return Ok(Slice::Halted);
            }
            let Some(thread) = self.threads.get(id) else {
                return Ok(Slice::Finished);
            };
            let fid = thread.current;
            let frame = self.frames.get(fid)?;
            let block = program
                .block(frame.block)
                .ok_or(MachineError::UnknownBlock(frame.block.0))?;
            let ip = frame.ip;
            let Some(code) = block.codes.get(ip) else {
                if self.exit_frame(id)? {
                    return Ok(Slice::Finished);
                }
                continue;
            };

            self.current_line = code.line;
            self.count_instruction()?;
            self.frames.get_mut(fid)?.ip = ip + 1;

            match &code.op {
                Op::Nop => {}
                // Literals belong to the shared program; scripts get a private copy.
                Op::PushValue(value) => self.push(fid, value.deep_copy())?,
                Op::PushVariable(var) => {
                    let value = self.slot_mut(fid, *var)?.clone();
                    self.push(fid, value)?;
                }
                Op::PushVariableWritable(var) => {
                    let slot = self.slot_mut(fid, *var)?;
                    slot.uniquify();
                    let alias = slot.clone();
                    self.push(fid, alias)?;
                }
                Op::Assign(var) => {
                    let value = self.pop(fid)?;
                    *self.slot_mut(fid, *var)? = value;
                }
                Op::AssignWritable => {
                    let source = self.pop(fid)?;
                    let dest = self.pop(fid)?;
                    ops::write_through(&dest, &source)?;
                }

                Op::Dup => {
                    let top = self.frames.get(fid)?.peek()?.clone();
                    self.push(fid, top)?;
                }
                Op::Swap => {
                    let stack = &mut self.frames.get_mut(fid)?.stack;
                    let n = stack.len();
                    if n < 2 {
                        return Err(MachineError::StackUnderflow);
                    }
                    stack.swap(n - 1, n - 2);
                }
                Op::Pop => {
                    self.pop(fid)?;
                }

                Op::Arith(op) => {
                    let b = self.pop(fid)?;
                    let a = self.pop(fid)?;
                    let result = ops::arith(&registry, *op, &a, &b)?;
                    self.push(fid, result)?;
                }
                Op::Unary(op) => {
                    let a = self.pop(fid)?;
                    let result = ops::unary(&registry, *op, &a)?;
                    self.push(fid, result)?;
                }
                Op::Compare(op) => {
                    let b = self.pop(fid)?;
                    let a = self.pop(fid)?;
                    let ordering = a.compare(&b)?;
                    self.push(fid, Value::new_boolean(&registry, op.test(ordering)))?;
                }
                Op::LogicAnd | Op::LogicOr => {
                    let b = self.pop_condition(fid)?;
                    let a = self.pop_condition(fid)?;
                    let result = if matches!(code.op, Op::LogicAnd) { a && b } else { a || b };
                    self.push(fid, Value::new_boolean(&registry, result))?;
                }

                Op::ConstructArray(n) => {
                    let elements = self.frames.get_mut(fid)?.pop_n(*n)?;
                    let array = ops::construct_array(&registry, elements)?;
                    self.push(fid, array)?;
                }
                Op::Index | Op::IndexWritable => {
                    let index = ops::array_index(&self.pop(fid)?)?;
                    let array = self.pop(fid)?;
                    let element = if matches!(code.op, Op::Index) {
                        array.index_as_array(index)?
                    } else {
                        array.index_writable(index)?
                    };
                    self.push(fid, element)?;
                }
                Op::Append => {
                    let element = self.pop(fid)?;
                    let array = self.pop(fid)?;
                    let result = array.appended(&registry, element)?;
                    self.push(fid, result)?;
                }
                Op::Concatenate => {
                    let b = self.pop(fid)?;
                    let a = self.pop(fid)?;
                    let result = a.concatenated(&b)?;
                    self.push(fid, result)?;
                }

                Op::Jump(target) | Op::LoopBack(target) => self.jump(fid, *target)?,
                Op::JumpIf(target) => {
                    if self.pop_condition(fid)? {
                        self.jump(fid, *target)?;
                    }
                }
                Op::JumpIfNot(target) => {
                    if !self.pop_condition(fid)? {
                        self.jump(fid, *target)?;
                    }
                }
                Op::JumpIfNoPop(target) => {
                    if self.peek_condition(fid)? {
                        self.jump(fid, *target)?;
                    }
                }
                Op::JumpIfNotNoPop(target) => {
                    if !self.peek_condition(fid)? {
                        self.jump(fid, *target)?;
                    }
                }
                Op::LoopCount => {
                    let frame = self.frames.get_mut(fid)?;
                    let count = frame.peek()?.as_real()?;
                    let more = count > 0.0;
                    if more {
                        frame.pop()?;
                        frame.push(Value::new_real(&registry, count - 1.0));
                    }
                    frame.push(Value::new_boolean(&registry, more));
                }
                Op::LoopForEach => {
                    let frame = self.frames.get_mut(fid)?;
                    let counter = frame.pop()?;
                    let position = ops::array_index(&counter)?;
                    let array = frame.peek()?.clone();
                    if position < array.length_as_array()? {
                        frame.push(Value::new_real(&registry, position as f64 + 1.0));
                        frame.push(array.index_as_array(position)?);
                        frame.push(Value::new_boolean(&registry, true));
                    } else {
                        frame.push(counter);
                        frame.push(Value::new_boolean(&registry, false));
                    }
                }
                Op::BreakLoop => self.break_loop(id, fid)?,
                Op::BreakRoutine => self.break_routine(id, fid)?,
                Op::SetResult => {
                    let value = self.pop(fid)?;
                    let target = self.result_frame(id, fid)?;
                    self.frames.get_mut(target)?.result = value;
                }

                Op::Call { callee, args } => {
                    if let Some(slice) = self.call_op(id, fid, *callee, *args, false)? {
                        return Ok(slice);
                    }
                }
                Op::CallAndPushResult { callee, args } => {
                    if let Some(slice) = self.call_op(id, fid, *callee, *args, true)? {
                        return Ok(slice);
                    }
                }

                Op::Yield => return Ok(Slice::Yielded),
                Op::Wait => {
                    let ticks = self.pop(fid)?.as_real()?;
                    return Ok(Slice::Waiting(ticks.max(1.0) as u32));
                }

                Op::InlineInc(var) | Op::InlineDec(var) => {
                    let delta = if matches!(code.op, Op::InlineInc(_)) { 1.0 } else { -1.0 };
                    let slot = self.slot_mut(fid, *var)?;
                    *slot = ops::step(&registry, slot, delta)?;
                }
                Op::InlineAssign { op, var } => {
                    let rhs = self.pop(fid)?;
                    let slot = self.slot_mut(fid, *var)?;
                    *slot = ops::arith(&registry, *op, slot, &rhs)?;
                }
            }
        }
    }

    /// Execute a call instruction. Returns a slice outcome when the current
    /// thread must stop running.
    fn call_op(
        &mut self,
        id: ThreadId,
        fid: FrameId,
        callee: Callee,
        args: usize,
        push_result: bool,
    ) -> Result<Option<Slice>, MachineError> {
        let program = Rc::clone(&self.program);
        match callee {
            Callee::Native(native_id) => {
                let native = program
                    .native(native_id)
                    .ok_or(MachineError::UnknownNative(native_id.0))?;
                if let Some(arity) = native.arity {
                    if arity != args {
                        return Err(MachineError::ArgumentCount {
                            name: native.name.clone(),
                            expected: arity,
                            got: args,
                        });
                    }
                }
                let argv = self.frames.get_mut(fid)?.pop_n(args)?;
                trace!(native = %native.name, args, "native call");
                let result = native.invoke(self, &argv)?;
                if self.stopped {
                    return Ok(Some(Slice::Halted));
                }
                if self.threads.get(id).is_none() {
                    return Ok(Some(Slice::Finished));
                }
                if push_result {
                    self.push(fid, result)?;
                }
                Ok(None)
            }
            Callee::Block(block_id) => {
                let block = program
                    .block(block_id)
                    .ok_or(MachineError::UnknownBlock(block_id.0))?;
                if block.arguments != args {
                    return Err(MachineError::ArgumentCount {
                        name: block.display_name().to_string(),
                        expected: block.arguments,
                        got: args,
                    });
                }
                if push_result && block.kind != BlockKind::Function {
                    return Err(MachineError::TypeMismatch(format!(
                        "'{}' does not return a value",
                        block.display_name()
                    )));
                }
                let argv = self.frames.get_mut(fid)?.pop_n(args)?;

                if block.kind == BlockKind::Microthread {
                    let root = self.enter_block(Some(fid), block_id, argv)?;
                    let spawned = self.spawn_thread(root)?;
                    debug!(thread = %spawned, block = block.display_name(), "microthread spawned");
                    return Ok(None);
                }

                let depth = self.threads.get(id).map_or(0, |t| t.depth) + 1;
                if depth >= self.config.max_call_depth {
                    return Err(MachineError::StackOverflow(self.config.max_call_depth));
                }
                let child = self.enter_block(Some(fid), block_id, argv)?;
                self.frames.get_mut(child)?.has_result = push_result;
                if let Some(thread) = self.threads.get_mut(id) {
                    thread.current = child;
                    thread.depth = depth;
                }
                Ok(None)
            }
        }
    }
}
