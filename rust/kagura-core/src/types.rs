//! Interned type registry for script values.
//!
//! Every type is created once per registry and handed out as a cheap handle.
//! Two handles describe the same type exactly when they point at the same
//! node, so type equality is a pointer comparison.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Kinds of scalar payloads a value can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarKind {
    Real,
    Char,
    Boolean,
}

/// Kind tag of a type node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeKind {
    Real,
    Char,
    Boolean,
    Array,
}

impl From<ScalarKind> for TypeKind {
    fn from(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Real => TypeKind::Real,
            ScalarKind::Char => TypeKind::Char,
            ScalarKind::Boolean => TypeKind::Boolean,
        }
    }
}

struct TypeNode {
    id: u32,
    kind: TypeKind,
    element: Option<Type>,
}

/// Handle to an interned type.
#[derive(Clone)]
pub struct Type(Rc<TypeNode>);

impl Type {
    pub fn kind(&self) -> TypeKind {
        self.0.kind
    }

    /// Element type, present only for arrays.
    pub fn element(&self) -> Option<&Type> {
        self.0.element.as_ref()
    }

    pub fn is_array(&self) -> bool {
        self.0.kind == TypeKind::Array
    }

    /// Strings are arrays of char.
    pub fn is_string(&self) -> bool {
        self.element().is_some_and(|e| e.kind() == TypeKind::Char)
    }

    /// Registry-local identifier, stable for the registry's lifetime.
    pub fn id(&self) -> u32 {
        self.0.id
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Type {}

impl Hash for Type {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.kind {
            TypeKind::Real => f.write_str("real"),
            TypeKind::Char => f.write_str("char"),
            TypeKind::Boolean => f.write_str("bool"),
            TypeKind::Array if self.is_string() => f.write_str("string"),
            TypeKind::Array => match &self.0.element {
                Some(element) => write!(f, "{}[]", element),
                None => f.write_str("<array>"),
            },
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({}#{})", self, self.0.id)
    }
}

/// Canonical set of types, keyed by (kind, element node address).
///
/// Interned nodes keep their element alive, so an address never names two
/// elements. An element handle from another registry gets its own entry
/// here instead of colliding with a local type.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    interned: RefCell<BTreeMap<(TypeKind, Option<usize>), Type>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar_type(&self, kind: ScalarKind) -> Type {
        self.intern(kind.into(), None)
    }

    /// Canonical "array of `element`".
    pub fn array_type(&self, element: &Type) -> Type {
        self.intern(TypeKind::Array, Some(element.clone()))
    }

    pub fn real_type(&self) -> Type {
        self.scalar_type(ScalarKind::Real)
    }

    pub fn char_type(&self) -> Type {
        self.scalar_type(ScalarKind::Char)
    }

    pub fn boolean_type(&self) -> Type {
        self.scalar_type(ScalarKind::Boolean)
    }

    pub fn string_type(&self) -> Type {
        self.array_type(&self.char_type())
    }

    /// Number of interned types.
    pub fn len(&self) -> usize {
        self.interned.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.borrow().is_empty()
    }

    fn intern(&self, kind: TypeKind, element: Option<Type>) -> Type {
        let key = (kind, element.as_ref().map(|e| Rc::as_ptr(&e.0) as usize));
        let mut interned = self.interned.borrow_mut();
        let id = interned.len() as u32;
        interned
            .entry(key)
            .or_insert_with(|| Type(Rc::new(TypeNode { id, kind, element })))
            .clone()
    }
}
