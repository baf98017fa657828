//! Kagura VM: a cooperative, frame-stepped script machine.
//!
//! A compiled [`Program`](program::Program) is executed by one or more
//! [`ScriptMachine`](vm::ScriptMachine)s. The host advances each machine once
//! per frame with `run`/`resume` and may spawn event handlers with `call`.

pub mod config;
pub mod program;
pub mod vm;

pub use config::{ConfigError, MachineConfig};
pub use program::{
    ArithOp, Block, BlockId, BlockKind, Callee, Code, CompareOp, NativeFunction, NativeId, Op,
    Program, UnaryOp, VarRef,
};
pub use vm::{MachineError, MachineState, ScriptMachine, StackFrame, ThreadId, TickOutcome};

// Re-export core types so hosts only need this crate.
pub use kagura_core::{types, values};
pub use kagura_core::{Scalar, Type, TypeRegistry, Value};
