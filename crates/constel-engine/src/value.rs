//! Scalar value comparison helpers.
//!
//! JSON numbers are compared numerically (`5` equals `5.0`), everything else
//! by type-and-value. `~` is a case-insensitive substring match on strings.

use std::cmp::Ordering;

use serde_json::Value;

use constel_query::FilterOp;

/// Numeric-aware equality.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Partial order over scalars: numbers numerically, strings bytewise,
/// booleans false < true. Mixed types do not compare.
pub fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Does `value` satisfy `op operand`? Absent values satisfy nothing.
pub fn satisfies(value: &Value, op: FilterOp, operand: &Value) -> bool {
    match op {
        FilterOp::Eq => value_eq(value, operand),
        FilterOp::Ne => !value_eq(value, operand),
        FilterOp::Lt => matches!(value_cmp(value, operand), Some(Ordering::Less)),
        FilterOp::Le => matches!(
            value_cmp(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => matches!(value_cmp(value, operand), Some(Ordering::Greater)),
        FilterOp::Ge => matches!(
            value_cmp(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Like => match (value.as_str(), operand.as_str()) {
            (Some(v), Some(pat)) => v.to_lowercase().contains(&pat.to_lowercase()),
            _ => false,
        },
    }
}

/// Canonical byte rendering used by the lock hash. `serde_json` renders
/// numbers deterministically, so two resolutions of equal state always
/// produce identical bytes.
pub fn canonical(value: &Value) -> String {
    // Normalize whole floats to their integer rendering so that a backend
    // returning `5.0` hashes like one returning `5`.
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9.0e15 {
            return format!("{}", f as i64);
        }
    }
    value.to_string()
}
