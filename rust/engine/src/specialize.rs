//! Monomorphic fast paths applied ahead of the generic value operators.
//!
//! Each helper checks that the operands are exactly the machine
//! representation it specialises for (subtypes such as booleans do not
//! qualify) and returns `None` on any miss — type mismatch, overflow, or a
//! condition the generic path must raise — so the caller falls back to the
//! generic operator.

use crate::memory::{Heap, Obj, Value};
use crate::values::{BinaryOpKind, CompareKind};

fn exact_int(heap: &Heap, value: Value) -> Option<i64> {
    match heap.get(value) {
        Obj::Int(i) => Some(*i),
        _ => None,
    }
}

fn exact_float(heap: &Heap, value: Value) -> Option<f64> {
    match heap.get(value) {
        Obj::Float(f) => Some(*f),
        _ => None,
    }
}

/// Integer arithmetic fast path for ADD/SUB/MUL/DIV/MOD and their in-place
/// twins.  Returns an owned result, or `None` to trigger the generic
/// fallback (which widens on overflow and raises on division by zero).
pub fn int_binary(heap: &mut Heap, op: BinaryOpKind, a: Value, b: Value) -> Option<Value> {
    let x = exact_int(heap, a)?;
    let y = exact_int(heap, b)?;
    let result = match op {
        BinaryOpKind::Add => x.checked_add(y)?,
        BinaryOpKind::Sub => x.checked_sub(y)?,
        BinaryOpKind::Mul => x.checked_mul(y)?,
        BinaryOpKind::Div => {
            if y == 0 || (x == i64::MIN && y == -1) {
                return None;
            }
            num_integer::Integer::div_floor(&x, &y)
        }
        BinaryOpKind::Mod => {
            if y == 0 || (x == i64::MIN && y == -1) {
                return None;
            }
            num_integer::Integer::mod_floor(&x, &y)
        }
        _ => return None,
    };
    Some(heap.new_int(result))
}

/// Integer comparison fast path.  Returns a **borrowed** canonical singleton;
/// the caller must retain before installing it in a register.
pub fn int_compare(heap: &Heap, op: CompareKind, a: Value, b: Value) -> Option<Value> {
    let x = exact_int(heap, a)?;
    let y = exact_int(heap, b)?;
    let result = match op {
        CompareKind::Lt => x < y,
        CompareKind::Le => x <= y,
        CompareKind::Eq => x == y,
        CompareKind::Ne => x != y,
        CompareKind::Gt => x > y,
        CompareKind::Ge => x >= y,
    };
    Some(heap.bool_value(result))
}

/// Float comparison fast path.  Returns a **borrowed** canonical singleton.
pub fn float_compare(heap: &Heap, op: CompareKind, a: Value, b: Value) -> Option<Value> {
    let x = exact_float(heap, a)?;
    let y = exact_float(heap, b)?;
    let result = match op {
        CompareKind::Lt => x < y,
        CompareKind::Le => x <= y,
        CompareKind::Eq => x == y,
        CompareKind::Ne => x != y,
        CompareKind::Gt => x > y,
        CompareKind::Ge => x >= y,
    };
    Some(heap.bool_value(result))
}

/// List-by-integer subscript fast path with negative-index normalisation.
/// Returns an owned element; out-of-range indices fall back to the generic
/// path, which raises the host's `IndexError`.
pub fn list_subscript(heap: &mut Heap, container: Value, key: Value) -> Option<Value> {
    let index = exact_int(heap, key)?;
    let item = match heap.get(container) {
        Obj::List(items) => {
            let len = items.len() as i64;
            let adjusted = if index < 0 { index + len } else { index };
            if adjusted < 0 || adjusted >= len {
                return None;
            }
            items[adjusted as usize]
        }
        _ => return None,
    };
    heap.retain(item);
    Some(item)
}
