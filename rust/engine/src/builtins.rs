//! Native host functions resolved through the builtins dictionary.
//!
//! Each builtin takes a slice of already-evaluated argument handles and
//! returns an owned value or a host error.  The surface is intentionally
//! small; the interesting call machinery lives in the interpreter.

use num_bigint::BigInt;
use num_traits::Signed;

use crate::memory::{Heap, Obj, Value};
use crate::values::{
    is_truthy, repr_value, rich_compare, CompareKind, HostError, NativeFn,
};

/// Build the standard builtins dictionary.  The returned dictionary owns one
/// reference to each native function object.
pub fn standard(heap: &mut Heap) -> Value {
    let dict = heap.new_dict();
    let entries: &[(&str, NativeFn)] = &[
        ("range", native_range),
        ("len", native_len),
        ("abs", native_abs),
        ("min", native_min),
        ("max", native_max),
        ("repr", native_repr),
    ];
    for &(name, func) in entries {
        let function = heap.new_native(name, func);
        heap.dict_set_str(dict, name, function);
    }
    dict
}

fn ensure_arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), HostError> {
    if args.len() < min || args.len() > max {
        return Err(HostError::type_error(format!(
            "{name}() takes {min} to {max} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(heap: &Heap, name: &str, value: Value) -> Result<i64, HostError> {
    match heap.get(value) {
        Obj::Int(i) => Ok(*i),
        Obj::Bool(b) => Ok(*b as i64),
        _ => Err(HostError::type_error(format!(
            "{name}() requires integer arguments"
        ))),
    }
}

fn native_range(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    ensure_arity("range", args, 1, 3)?;
    let (start, stop, step) = match args.len() {
        1 => (0, int_arg(heap, "range", args[0])?, 1),
        2 => (
            int_arg(heap, "range", args[0])?,
            int_arg(heap, "range", args[1])?,
            1,
        ),
        _ => (
            int_arg(heap, "range", args[0])?,
            int_arg(heap, "range", args[1])?,
            int_arg(heap, "range", args[2])?,
        ),
    };
    if step == 0 {
        return Err(HostError::value_error(
            "range() step argument must not be zero",
        ));
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        items.push(heap.new_int(current));
        current += step;
    }
    Ok(heap.new_list(items))
}

fn native_len(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    ensure_arity("len", args, 1, 1)?;
    let len = match heap.get(args[0]) {
        Obj::List(items) | Obj::Tuple(items) => items.len(),
        Obj::Str(s) => s.chars().count(),
        Obj::Dict(entries) => entries.len(),
        other => {
            return Err(HostError::type_error(format!(
                "object of type '{}' has no len()",
                crate::memory::kind_name(other)
            )))
        }
    };
    Ok(heap.new_int(len as i64))
}

fn native_abs(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    ensure_arity("abs", args, 1, 1)?;
    match heap.get(args[0]) {
        Obj::Int(i) => match i.checked_abs() {
            Some(result) => Ok(heap.new_int(result)),
            None => {
                let wide = BigInt::from(i64::MIN).abs();
                Ok(heap.new_big(wide))
            }
        },
        Obj::Big(b) => {
            let wide = b.abs();
            Ok(heap.new_big(wide))
        }
        Obj::Float(f) => {
            let result = f.abs();
            Ok(heap.new_float(result))
        }
        other => Err(HostError::type_error(format!(
            "bad operand type for abs(): '{}'",
            crate::memory::kind_name(other)
        ))),
    }
}

#[derive(Clone, Copy)]
enum FoldKind {
    Min,
    Max,
}

fn native_min(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    fold_min_max(heap, args, FoldKind::Min)
}

fn native_max(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    fold_min_max(heap, args, FoldKind::Max)
}

fn fold_min_max(heap: &mut Heap, args: &[Value], kind: FoldKind) -> Result<Value, HostError> {
    let name = match kind {
        FoldKind::Min => "min",
        FoldKind::Max => "max",
    };
    let candidates: Vec<Value> = if args.len() == 1 {
        match heap.get(args[0]) {
            Obj::List(items) | Obj::Tuple(items) => items.clone(),
            _ => {
                return Err(HostError::type_error(format!(
                    "{name}() with one argument requires a sequence"
                )))
            }
        }
    } else {
        args.to_vec()
    };
    let mut iter = candidates.into_iter();
    let mut best = iter.next().ok_or_else(|| {
        HostError::value_error(format!("{name}() arg is an empty sequence"))
    })?;
    for candidate in iter {
        let op = match kind {
            FoldKind::Min => CompareKind::Lt,
            FoldKind::Max => CompareKind::Gt,
        };
        let verdict = rich_compare(heap, op, candidate, best)?;
        let replace = is_truthy(heap, verdict);
        heap.release(verdict);
        if replace {
            best = candidate;
        }
    }
    heap.retain(best);
    Ok(best)
}

fn native_repr(heap: &mut Heap, args: &[Value]) -> Result<Value, HostError> {
    ensure_arity("repr", args, 1, 1)?;
    repr_value(heap, args[0])
}
