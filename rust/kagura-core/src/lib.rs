//! Kagura Core
//!
//! Interned script types and the copy-on-write values shared by the program
//! model and the script machine.

pub mod types;
pub mod values;

pub use types::{ScalarKind, Type, TypeKind, TypeRegistry};
pub use values::{Scalar, Value, ValueError};
