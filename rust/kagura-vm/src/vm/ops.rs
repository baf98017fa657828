//! Operator semantics on script values.
//!
//! Arithmetic works on reals (chars and booleans are promoted) and maps
//! elementwise over arrays of equal length.

use super::MachineError;
use crate::program::{ArithOp, UnaryOp};
use kagura_core::types::TypeKind;
use kagura_core::values::ValueError;
use kagura_core::{Scalar, TypeRegistry, Value};

pub(crate) fn arith(
    registry: &TypeRegistry,
    op: ArithOp,
    a: &Value,
    b: &Value,
) -> Result<Value, MachineError> {
    match (a.is_array(), b.is_array()) {
        (false, false) => {
            let (x, y) = (a.as_real()?, b.as_real()?);
            let r = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Rem => x % y,
                ArithOp::Pow => x.powf(y),
            };
            Ok(Value::new_real(registry, r))
        }
        (true, true) => {
            let left = a.elements()?;
            let right = b.elements()?;
            if left.len() != right.len() {
                return Err(ValueError::LengthMismatch {
                    left: left.len(),
                    right: right.len(),
                }
                .into());
            }
            let results = left
                .iter()
                .zip(&right)
                .map(|(x, y)| arith(registry, op, x, y))
                .collect::<Result<Vec<_>, _>>()?;
            collect_array(registry, a, results)
        }
        _ => Err(MachineError::TypeMismatch(format!(
            "cannot apply {:?} to {} and {}",
            op,
            type_name(a),
            type_name(b)
        ))),
    }
}

pub(crate) fn unary(registry: &TypeRegistry, op: UnaryOp, a: &Value) -> Result<Value, MachineError> {
    if a.is_array() {
        if op == UnaryOp::Not {
            return Err(MachineError::TypeMismatch(format!(
                "cannot negate {} logically",
                type_name(a)
            )));
        }
        let results = a
            .elements()?
            .iter()
            .map(|x| unary(registry, op, x))
            .collect::<Result<Vec<_>, _>>()?;
        return collect_array(registry, a, results);
    }
    Ok(match op {
        UnaryOp::Neg => Value::new_real(registry, -a.as_real()?),
        UnaryOp::Abs => Value::new_real(registry, a.as_real()?.abs()),
        UnaryOp::Not => Value::new_boolean(registry, !a.as_boolean()?),
    })
}

/// Successor (`delta = 1`) or predecessor (`delta = -1`). Chars step through
/// code points and stay chars.
pub(crate) fn step(registry: &TypeRegistry, value: &Value, delta: f64) -> Result<Value, MachineError> {
    match value.kind() {
        Some(TypeKind::Char) => {
            let code = value.as_char()? as i64 + delta as i64;
            let next = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| MachineError::TypeMismatch(format!("no char at code point {}", code)))?;
            Ok(Value::make_scalar(registry.char_type(), Scalar::Char(next))?)
        }
        Some(TypeKind::Array) => Err(MachineError::TypeMismatch(format!(
            "cannot step {}",
            type_name(value)
        ))),
        _ => Ok(Value::new_real(registry, value.as_real()? + delta)),
    }
}

/// Build an array literal. An empty literal is a string.
pub(crate) fn construct_array(
    registry: &TypeRegistry,
    elements: Vec<Value>,
) -> Result<Value, MachineError> {
    let Some(first) = elements.first() else {
        return Ok(Value::make_array(registry.string_type(), Vec::new())?);
    };
    let element_type = first.get_type().ok_or(ValueError::Empty)?;
    Ok(Value::make_array(registry.array_type(&element_type), elements)?)
}

/// Array index operand: a non-negative integral real.
pub(crate) fn array_index(index: &Value) -> Result<usize, MachineError> {
    let raw = index.as_real()?;
    if raw < 0.0 || raw.fract() != 0.0 {
        return Err(MachineError::TypeMismatch(format!("invalid array index {}", raw)));
    }
    Ok(raw as usize)
}

/// Store `source` into the body `dest` refers to. A destination holding
/// data keeps its type, except that an empty array on either side may be
/// replaced by any array.
pub(crate) fn write_through(dest: &Value, source: &Value) -> Result<(), MachineError> {
    if let (Some(to), Some(from)) = (dest.get_type(), source.get_type()) {
        let empty_array = |v: &Value| v.is_array() && v.length_as_array().is_ok_and(|n| n == 0);
        let compatible = to == from
            || (to.is_array() && from.is_array() && (empty_array(dest) || empty_array(source)));
        if !compatible {
            return Err(MachineError::TypeMismatch(format!(
                "cannot store {} into {}",
                from, to
            )));
        }
    }
    Ok(dest.overwrite(source)?)
}

fn collect_array(
    registry: &TypeRegistry,
    template: &Value,
    results: Vec<Value>,
) -> Result<Value, MachineError> {
    let ty = match results.first().and_then(Value::get_type) {
        Some(element) => registry.array_type(&element),
        None => template.get_type().ok_or(ValueError::Empty)?,
    };
    Ok(Value::make_array(ty, results)?)
}

fn type_name(value: &Value) -> String {
    value
        .get_type()
        .map(|ty| ty.to_string())
        .unwrap_or_else(|| "<empty>".to_string())
}
