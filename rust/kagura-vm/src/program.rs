//! Compiled program model.
//!
//! A program is a flat list of [`Block`]s of stack-machine [`Code`], one
//! entry block, a name→block event table, and the native functions the code
//! may call. It is produced by an external compiler and never mutated once a
//! machine runs it; several machines may share one program through `Rc`.

use crate::vm::{MachineError, ScriptMachine};
use kagura_core::{TypeRegistry, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Index of a block within its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Stable handle of a native function within its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NativeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    /// Nested statement block (if-branches, plain scopes).
    Normal,
    /// Loop body; `BreakLoop` unwinds to the nearest one.
    Loop,
    Sub,
    /// Routine whose result is pushed by `CallAndPushResult`.
    Function,
    /// Calling it spawns a new cooperative thread.
    Microthread,
}

impl BlockKind {
    /// Routines are the frames `BreakRoutine` unwinds to.
    pub fn is_routine(self) -> bool {
        matches!(self, BlockKind::Sub | BlockKind::Function | BlockKind::Microthread)
    }
}

/// Variable address: a lexical level and a slot in the frame at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub level: u32,
    pub slot: u32,
}

impl VarRef {
    pub fn new(level: u32, slot: u32) -> Self {
        Self { level, slot }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn test(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Call target: a script block or a host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Callee {
    Block(BlockId),
    Native(NativeId),
}

/// Stack-machine operations.
///
/// Jump targets are code indices within the current block; a target equal
/// to the block length exits the block.
#[derive(Debug, Clone)]
pub enum Op {
    // Literals and variables
    Nop,
    PushValue(Value),             // push an alias of the literal
    PushVariable(VarRef),         // push variable (read access)
    PushVariableWritable(VarRef), // uniquify variable, push a write alias
    Assign(VarRef),               // pop into variable
    AssignWritable,               // pop src, pop dest; dest.overwrite(src)

    // Stack shape
    Dup,
    Swap,
    Pop,

    // Operators; binary ops pop b then a and push `a op b`
    Arith(ArithOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    LogicAnd,
    LogicOr,

    // Arrays
    ConstructArray(usize), // pop N values into a new array
    Index,                 // pop index, pop array; push element (read)
    IndexWritable,         // pop index, pop array; push element write alias
    Append,                // pop x, pop array; push array ~ [x]
    Concatenate,           // pop b, pop a; push a ~ b

    // Control flow
    Jump(usize),
    JumpIf(usize),         // pop condition
    JumpIfNot(usize),      // pop condition
    JumpIfNoPop(usize),    // peek condition
    JumpIfNotNoPop(usize), // peek condition
    LoopBack(usize),
    LoopCount,   // peek counter; if > 0 decrement and push true, else push false
    LoopForEach, // [array, i]: if i < len push element and true, else push false
    BreakLoop,
    BreakRoutine,
    SetResult, // pop into the enclosing function's result

    // Calls
    Call { callee: Callee, args: usize },
    CallAndPushResult { callee: Callee, args: usize },

    // Scheduling
    Yield,
    Wait, // pop tick count

    // Inline fast paths, equivalent to push/op/assign sequences
    InlineInc(VarRef),
    InlineDec(VarRef),
    InlineAssign { op: ArithOp, var: VarRef },
}

/// One instruction with its source line.
#[derive(Debug, Clone)]
pub struct Code {
    pub op: Op,
    pub line: u32,
}

impl Code {
    pub fn new(line: u32, op: Op) -> Self {
        Self { op, line }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: Option<String>,
    pub kind: BlockKind,
    /// Lexical nesting level; the entry block is level 0.
    pub level: u32,
    /// Arguments are bound to slots `0..arguments`.
    pub arguments: usize,
    /// Local slot count, never smaller than `arguments`.
    pub slots: usize,
    pub codes: Vec<Code>,
}

impl Block {
    pub fn new(kind: BlockKind, level: u32) -> Self {
        Self {
            name: None,
            kind,
            level,
            arguments: 0,
            slots: 0,
            codes: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: usize) -> Self {
        self.arguments = arguments;
        self.slots = self.slots.max(arguments);
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(self.arguments);
        self
    }

    pub fn code(mut self, line: u32, op: Op) -> Self {
        self.codes.push(Code::new(line, op));
        self
    }

    /// Append one instruction and return its index (for patching jumps).
    pub fn push(&mut self, line: u32, op: Op) -> usize {
        self.codes.push(Code::new(line, op));
        self.codes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

/// Host function signature. Returning `Err` raises the error on the machine.
pub type NativeFn = dyn Fn(&mut ScriptMachine, &[Value]) -> Result<Value, MachineError>;

pub struct NativeFunction {
    pub name: String,
    /// Required argument count; `None` accepts any.
    pub arity: Option<usize>,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, arity: Option<usize>, func: F) -> Self
    where
        F: Fn(&mut ScriptMachine, &[Value]) -> Result<Value, MachineError> + 'static,
    {
        Self {
            name: name.into(),
            arity,
            func: Box::new(func),
        }
    }

    pub fn invoke(&self, machine: &mut ScriptMachine, args: &[Value]) -> Result<Value, MachineError> {
        (self.func)(machine, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Program {
    registry: Rc<TypeRegistry>,
    blocks: Vec<Block>,
    main: Option<BlockId>,
    events: BTreeMap<String, BlockId>,
    natives: Vec<NativeFunction>,
}

impl Program {
    pub fn new(registry: Rc<TypeRegistry>) -> Self {
        Self {
            registry,
            blocks: Vec::new(),
            main: None,
            events: BTreeMap::new(),
            natives: Vec::new(),
        }
    }

    /// Registry every literal and runtime value of this program is typed by.
    pub fn registry(&self) -> &Rc<TypeRegistry> {
        &self.registry
    }

    pub fn add_block(&mut self, block: Block) -> BlockId {
        self.blocks.push(block);
        BlockId((self.blocks.len() - 1) as u32)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0 as usize)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn set_main(&mut self, id: BlockId) {
        self.main = Some(id);
    }

    pub fn main_block(&self) -> Option<BlockId> {
        self.main
    }

    /// Register `block` as the handler for `name`, replacing any previous one.
    pub fn add_event(&mut self, name: impl Into<String>, block: BlockId) {
        self.events.insert(name.into(), block);
    }

    pub fn event(&self, name: &str) -> Option<BlockId> {
        self.events.get(name).copied()
    }

    pub fn events(&self) -> impl Iterator<Item = (&str, BlockId)> {
        self.events.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn add_native(&mut self, native: NativeFunction) -> NativeId {
        self.natives.push(native);
        NativeId((self.natives.len() - 1) as u32)
    }

    pub fn native(&self, id: NativeId) -> Option<&NativeFunction> {
        self.natives.get(id.0 as usize)
    }

    pub fn find_native(&self, name: &str) -> Option<NativeId> {
        self.natives
            .iter()
            .position(|n| n.name == name)
            .map(|i| NativeId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_builder_keeps_slots_above_arguments() {
        let block = Block::new(BlockKind::Sub, 1).with_slots(1).with_arguments(3);
        assert_eq!(block.slots, 3);
        let block = Block::new(BlockKind::Sub, 1).with_arguments(2).with_slots(5);
        assert_eq!(block.slots, 5);
        let block = Block::new(BlockKind::Sub, 1).with_arguments(2).with_slots(1);
        assert_eq!(block.slots, 2);
    }

    #[test]
    fn test_event_lookup() {
        let mut program = Program::new(Rc::new(TypeRegistry::new()));
        let main = program.add_block(Block::new(BlockKind::Normal, 0));
        let hit = program.add_block(Block::new(BlockKind::Sub, 1).named("on_hit"));
        program.set_main(main);
        program.add_event("on_hit", hit);
        assert_eq!(program.event("on_hit"), Some(hit));
        assert_eq!(program.event("on_graze"), None);
        assert_eq!(program.events().count(), 1);
        assert_eq!(program.block(hit).unwrap().display_name(), "on_hit");
    }

    #[test]
    fn test_native_lookup() {
        let mut program = Program::new(Rc::new(TypeRegistry::new()));
        let id = program.add_native(NativeFunction::new("noop", Some(0), |_, _| {
            Ok(Value::empty())
        }));
        assert_eq!(program.find_native("noop"), Some(id));
        assert_eq!(program.native(id).unwrap().arity, Some(0));
        assert!(program.find_native("missing").is_none());
    }

    #[test]
    fn test_compare_op() {
        assert!(CompareOp::Le.test(Ordering::Equal));
        assert!(CompareOp::Le.test(Ordering::Less));
        assert!(!CompareOp::Gt.test(Ordering::Equal));
        assert!(CompareOp::Ne.test(Ordering::Greater));
    }
}
