//! Reference-counted, copy-on-write script values.
//!
//! A [`Value`] is a handle to a shared body. Cloning a handle aliases the
//! body; nothing is copied until a holder calls [`Value::uniquify`]. Writes
//! that should be visible through every alias go through
//! [`Value::overwrite`].

use crate::types::{ScalarKind, Type, TypeKind, TypeRegistry};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("value has no data")]
    Empty,
    #[error("expected {expected}, got {found}")]
    KindMismatch { expected: &'static str, found: String },
    #[error("value of type {0} is not an array")]
    NotAnArray(String),
    #[error("index {index} out of range for array of length {length}")]
    IndexOutOfRange { index: i64, length: usize },
    #[error("element type mismatch: expected {expected}, got {found}")]
    ElementTypeMismatch { expected: String, found: String },
    #[error("array length mismatch: {left} and {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("incompatible types {left} and {right}")]
    TypeMismatch { left: String, right: String },
}

/// Scalar payload of a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Real(f64),
    Char(char),
    Boolean(bool),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Real(_) => ScalarKind::Real,
            Scalar::Char(_) => ScalarKind::Char,
            Scalar::Boolean(_) => ScalarKind::Boolean,
        }
    }
}

#[derive(Clone)]
enum Data {
    Scalar(Scalar),
    Array(Vec<Value>),
}

#[derive(Clone)]
struct Body {
    ty: Type,
    data: Data,
}

/// Dynamically typed script value.
#[derive(Clone, Default)]
pub struct Value {
    body: Option<Rc<RefCell<Body>>>,
}

impl Value {
    /// A value with no data.
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_body(body: Body) -> Self {
        Self {
            body: Some(Rc::new(RefCell::new(body))),
        }
    }

    pub fn make_scalar(ty: Type, payload: Scalar) -> Result<Self, ValueError> {
        if ty.kind() != TypeKind::from(payload.kind()) {
            return Err(ValueError::KindMismatch {
                expected: kind_name(ty.kind()),
                found: kind_name(payload.kind().into()).to_string(),
            });
        }
        Ok(Self::from_body(Body {
            ty,
            data: Data::Scalar(payload),
        }))
    }

    /// Wrap `elements` in a new array body of type `ty`. Every element must
    /// carry `ty`'s element type.
    pub fn make_array(ty: Type, elements: Vec<Value>) -> Result<Self, ValueError> {
        let element = ty
            .element()
            .ok_or_else(|| ValueError::NotAnArray(ty.to_string()))?;
        for value in &elements {
            let found = value.get_type().ok_or(ValueError::Empty)?;
            if &found != element {
                return Err(ValueError::ElementTypeMismatch {
                    expected: element.to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(Self::from_body(Body {
            ty,
            data: Data::Array(elements),
        }))
    }

    pub fn new_real(registry: &TypeRegistry, value: f64) -> Self {
        Self::from_body(Body {
            ty: registry.real_type(),
            data: Data::Scalar(Scalar::Real(value)),
        })
    }

    pub fn new_char(registry: &TypeRegistry, value: char) -> Self {
        Self::from_body(Body {
            ty: registry.char_type(),
            data: Data::Scalar(Scalar::Char(value)),
        })
    }

    pub fn new_boolean(registry: &TypeRegistry, value: bool) -> Self {
        Self::from_body(Body {
            ty: registry.boolean_type(),
            data: Data::Scalar(Scalar::Boolean(value)),
        })
    }

    pub fn new_string(registry: &TypeRegistry, value: &str) -> Self {
        let char_type = registry.char_type();
        let elements = value
            .chars()
            .map(|c| {
                Self::from_body(Body {
                    ty: char_type.clone(),
                    data: Data::Scalar(Scalar::Char(c)),
                })
            })
            .collect();
        Self::from_body(Body {
            ty: registry.array_type(&char_type),
            data: Data::Array(elements),
        })
    }

    /// Array of reals, the most common shape handed back by host functions.
    pub fn new_real_array(registry: &TypeRegistry, values: &[f64]) -> Self {
        let elements = values.iter().map(|r| Self::new_real(registry, *r)).collect();
        Self::from_body(Body {
            ty: registry.array_type(&registry.real_type()),
            data: Data::Array(elements),
        })
    }

    pub fn has_data(&self) -> bool {
        self.body.is_some()
    }

    pub fn get_type(&self) -> Option<Type> {
        self.body.as_ref().map(|b| b.borrow().ty.clone())
    }

    pub fn kind(&self) -> Option<TypeKind> {
        self.body.as_ref().map(|b| b.borrow().ty.kind())
    }

    pub fn is_array(&self) -> bool {
        self.kind() == Some(TypeKind::Array)
    }

    /// Whether another handle aliases the same body.
    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Number of handles aliasing this body (0 when empty).
    pub fn ref_count(&self) -> usize {
        self.body.as_ref().map_or(0, Rc::strong_count)
    }

    /// True when both handles alias the same body.
    pub fn same_body(a: &Value, b: &Value) -> bool {
        match (&a.body, &b.body) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    fn borrow(&self) -> Result<Ref<'_, Body>, ValueError> {
        self.body
            .as_ref()
            .map(|b| b.borrow())
            .ok_or(ValueError::Empty)
    }

    fn cloned_body(&self) -> Result<Body, ValueError> {
        Ok(self.borrow()?.clone())
    }

    fn borrow_mut(&self) -> Result<RefMut<'_, Body>, ValueError> {
        self.body
            .as_ref()
            .map(|b| b.borrow_mut())
            .ok_or(ValueError::Empty)
    }

    fn scalar(&self, expected: &'static str) -> Result<Scalar, ValueError> {
        let body = self.borrow()?;
        match &body.data {
            Data::Scalar(s) => Ok(*s),
            Data::Array(_) => Err(ValueError::KindMismatch {
                expected,
                found: body.ty.to_string(),
            }),
        }
    }

    pub fn as_real(&self) -> Result<f64, ValueError> {
        Ok(match self.scalar("real")? {
            Scalar::Real(r) => r,
            Scalar::Char(c) => c as u32 as f64,
            Scalar::Boolean(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        })
    }

    pub fn as_char(&self) -> Result<char, ValueError> {
        match self.scalar("char")? {
            Scalar::Char(c) => Ok(c),
            Scalar::Real(r) => char::from_u32(r as u32).ok_or_else(|| ValueError::KindMismatch {
                expected: "char",
                found: format_real(r),
            }),
            Scalar::Boolean(b) => Ok(if b { '1' } else { '0' }),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, ValueError> {
        Ok(match self.scalar("bool")? {
            Scalar::Boolean(b) => b,
            Scalar::Real(r) => r != 0.0,
            Scalar::Char(c) => c != '\0',
        })
    }

    /// Text rendering. Strings render as their characters.
    pub fn as_string(&self) -> Result<String, ValueError> {
        let body = self.borrow()?;
        match &body.data {
            Data::Scalar(Scalar::Real(r)) => Ok(format_real(*r)),
            Data::Scalar(Scalar::Char(c)) => Ok(c.to_string()),
            Data::Scalar(Scalar::Boolean(b)) => Ok(b.to_string()),
            Data::Array(elements) if body.ty.is_string() => {
                elements.iter().map(Value::as_char).collect()
            }
            Data::Array(elements) => {
                let items = elements
                    .iter()
                    .map(Value::as_string)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("[{}]", items.join(", ")))
            }
        }
    }

    pub fn length_as_array(&self) -> Result<usize, ValueError> {
        let body = self.borrow()?;
        match &body.data {
            Data::Array(elements) => Ok(elements.len()),
            Data::Scalar(_) => Err(ValueError::NotAnArray(body.ty.to_string())),
        }
    }

    /// Read-only element access: returns an alias of element `index`.
    pub fn index_as_array(&self, index: usize) -> Result<Value, ValueError> {
        let body = self.borrow()?;
        match &body.data {
            Data::Array(elements) => {
                elements
                    .get(index)
                    .cloned()
                    .ok_or(ValueError::IndexOutOfRange {
                        index: index as i64,
                        length: elements.len(),
                    })
            }
            Data::Scalar(_) => Err(ValueError::NotAnArray(body.ty.to_string())),
        }
    }

    /// Write-aliasing element access.
    ///
    /// Element `index` is made private to this array's body first, so an
    /// [`overwrite`](Value::overwrite) through the returned handle changes
    /// this array and no other array that shared the element.
    pub fn index_writable(&self, index: usize) -> Result<Value, ValueError> {
        let mut guard = self.borrow_mut()?;
        let body = &mut *guard;
        match &mut body.data {
            Data::Array(elements) => {
                let length = elements.len();
                let element = elements
                    .get_mut(index)
                    .ok_or(ValueError::IndexOutOfRange {
                        index: index as i64,
                        length,
                    })?;
                element.uniquify();
                Ok(element.clone())
            }
            Data::Scalar(_) => Err(ValueError::NotAnArray(body.ty.to_string())),
        }
    }

    /// Snapshot of the elements as independent handles.
    pub fn elements(&self) -> Result<Vec<Value>, ValueError> {
        let body = self.borrow()?;
        match &body.data {
            Data::Array(elements) => Ok(elements.clone()),
            Data::Scalar(_) => Err(ValueError::NotAnArray(body.ty.to_string())),
        }
    }

    /// Replace the contents of the referenced body in place. Every alias of
    /// this body observes the new type and payload.
    pub fn overwrite(&self, source: &Value) -> Result<(), ValueError> {
        let target = self.body.as_ref().ok_or(ValueError::Empty)?;
        let source_body = source.body.as_ref().ok_or(ValueError::Empty)?;
        if Rc::ptr_eq(target, source_body) {
            return Ok(());
        }
        let replacement = if source.reaches(target) {
            // A shallow copy would make the target contain itself.
            source.deep_copy().cloned_body()?
        } else {
            source_body.borrow().clone()
        };
        *target.borrow_mut() = replacement;
        Ok(())
    }

    /// Rebind this handle to `source`'s body. Former aliases keep the old one.
    pub fn set(&mut self, source: &Value) {
        self.body = source.body.clone();
    }

    /// Make the body private to this handle, cloning it if it is shared.
    /// Array elements stay aliased until they are themselves uniquified.
    pub fn uniquify(&mut self) {
        if let Some(body) = &self.body {
            if Rc::strong_count(body) > 1 {
                let copy = body.borrow().clone();
                self.body = Some(Rc::new(RefCell::new(copy)));
            }
        }
    }

    /// Recursive copy sharing nothing with the original.
    pub fn deep_copy(&self) -> Value {
        let Some(body) = &self.body else {
            return Value::empty();
        };
        let body = body.borrow();
        let data = match &body.data {
            Data::Scalar(s) => Data::Scalar(*s),
            Data::Array(elements) => Data::Array(elements.iter().map(Value::deep_copy).collect()),
        };
        Self::from_body(Body {
            ty: body.ty.clone(),
            data,
        })
    }

    fn reaches(&self, target: &Rc<RefCell<Body>>) -> bool {
        let Some(body) = &self.body else {
            return false;
        };
        if Rc::ptr_eq(body, target) {
            return true;
        }
        match &body.borrow().data {
            Data::Array(elements) => elements.iter().any(|e| e.reaches(target)),
            Data::Scalar(_) => false,
        }
    }

    /// Append `element` to this array body in place. Aliases observe the new
    /// element; uniquify first to keep copy semantics. An empty array adopts
    /// the element's type.
    pub fn append(&mut self, registry: &TypeRegistry, element: Value) -> Result<(), ValueError> {
        let found = element.get_type().ok_or(ValueError::Empty)?;
        let element = if element.reaches(self.body.as_ref().ok_or(ValueError::Empty)?) {
            element.deep_copy()
        } else {
            element
        };
        let mut guard = self.borrow_mut()?;
        let body = &mut *guard;
        let Data::Array(elements) = &mut body.data else {
            return Err(ValueError::NotAnArray(body.ty.to_string()));
        };
        if elements.is_empty() {
            body.ty = registry.array_type(&found);
        } else if body.ty.element() != Some(&found) {
            return Err(ValueError::ElementTypeMismatch {
                expected: body.ty.element().map_or_else(String::new, Type::to_string),
                found: found.to_string(),
            });
        }
        elements.push(element);
        Ok(())
    }

    /// Append every element of `other` to this array body in place. An
    /// empty array adopts `other`'s type.
    pub fn concatenate(&mut self, other: &Value) -> Result<(), ValueError> {
        let incoming = other.elements()?;
        let other_type = other.get_type().ok_or(ValueError::Empty)?;
        let mut guard = self.borrow_mut()?;
        let body = &mut *guard;
        let Data::Array(elements) = &mut body.data else {
            return Err(ValueError::NotAnArray(body.ty.to_string()));
        };
        if incoming.is_empty() {
            return Ok(());
        }
        if elements.is_empty() {
            body.ty = other_type;
        } else if body.ty != other_type {
            return Err(ValueError::ElementTypeMismatch {
                expected: body.ty.to_string(),
                found: other_type.to_string(),
            });
        }
        elements.extend(incoming);
        Ok(())
    }

    /// Copy-producing append: the result never aliases `self`'s body.
    pub fn appended(&self, registry: &TypeRegistry, element: Value) -> Result<Value, ValueError> {
        let mut result = self.clone();
        result.uniquify();
        result.append(registry, element)?;
        Ok(result)
    }

    /// Copy-producing concatenation.
    pub fn concatenated(&self, other: &Value) -> Result<Value, ValueError> {
        let mut result = self.clone();
        result.uniquify();
        result.concatenate(other)?;
        Ok(result)
    }

    /// Ordering between two values of the same type. Scalars compare
    /// numerically, arrays lexicographically.
    pub fn compare(&self, other: &Value) -> Result<Ordering, ValueError> {
        let left = self.borrow()?;
        let right = other.borrow()?;
        match (&left.data, &right.data) {
            (Data::Scalar(a), Data::Scalar(b)) => match (a, b) {
                (Scalar::Real(x), Scalar::Real(y)) => Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
                (Scalar::Char(x), Scalar::Char(y)) => Ok(x.cmp(y)),
                (Scalar::Boolean(x), Scalar::Boolean(y)) => Ok(x.cmp(y)),
                _ => Err(type_mismatch(&left.ty, &right.ty)),
            },
            (Data::Array(a), Data::Array(b)) => {
                if !a.is_empty() && !b.is_empty() && left.ty != right.ty {
                    return Err(type_mismatch(&left.ty, &right.ty));
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        other => return Ok(other),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(type_mismatch(&left.ty, &right.ty)),
        }
    }
}

fn type_mismatch(left: &Type, right: &Type) -> ValueError {
    ValueError::TypeMismatch {
        left: left.to_string(),
        right: right.to_string(),
    }
}

fn kind_name(kind: TypeKind) -> &'static str {
    match kind {
        TypeKind::Real => "real",
        TypeKind::Char => "char",
        TypeKind::Boolean => "bool",
        TypeKind::Array => "array",
    }
}

/// Integral reals print without a fractional part.
fn format_real(r: f64) -> String {
    if r == r.trunc() && r.abs() < 1e15 {
        format!("{:.0}", r)
    } else {
        format!("{}", r)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&self.body, &other.body) {
            (None, None) => true,
            (Some(_), Some(_)) => {
                self.get_type() == other.get_type()
                    && matches!(self.compare(other), Ok(Ordering::Equal))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_string() {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<empty>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get_type() {
            Some(ty) => write!(f, "Value({}: {})", ty, self),
            None => f.write_str("Value(<empty>)"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(body) = &self.body else {
            return serializer.serialize_none();
        };
        let body = body.borrow();
        match &body.data {
            Data::Scalar(Scalar::Real(r)) => serializer.serialize_f64(*r),
            Data::Scalar(Scalar::Char(c)) => serializer.serialize_char(*c),
            Data::Scalar(Scalar::Boolean(b)) => serializer.serialize_bool(*b),
            Data::Array(elements) if body.ty.is_string() => {
                let text = elements
                    .iter()
                    .map(Value::as_char)
                    .collect::<Result<String, _>>()
                    .map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&text)
            }
            Data::Array(elements) => {
                let mut seq = serializer.serialize_seq(Some(elements.len()))?;
                for element in elements {
                    seq.serialize_element(element)?;
                }
                seq.end()
            }
        }
    }
}
