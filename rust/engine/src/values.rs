//! Host value API consumed by the dispatch core.
//!
//! Every operation the opcode handlers need — truthiness, the numeric
//! binary/unary families, rich comparison, subscripting, attributes, the
//! iterator protocol, native calls, and the print primitives — lives here as
//! a free function over the heap.  Fallible operations return
//! [`HostError`], which preserves the error kind and message across the
//! engine boundary verbatim.
//!
//! Ownership convention: functions returning `Value` return an owned
//! reference unless the doc says otherwise; functions accepting operand
//! values borrow them (the caller's references stay live).  Store-style
//! operations (`set_item`, `set_attr`, `list_append`) retain internally.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{kind_name, DictKey, Heap, MemoryError, Obj, Value};

/// Error classes mirrored from the host language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Type,
    Value,
    Index,
    Key,
    Attribute,
    Name,
    ZeroDivision,
    Io,
    System,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Name => "NameError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Io => "IOError",
            ErrorKind::System => "SystemError",
        }
    }
}

/// Error raised by a host value operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", kind.name())]
pub struct HostError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Attribute, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ZeroDivision, message)
    }
}

impl From<MemoryError> for HostError {
    fn from(err: MemoryError) -> Self {
        HostError::type_error(err.to_string())
    }
}

/// Signature of a native host function.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, HostError>;

/// Diagnostic type name of a value.
pub fn type_name(heap: &Heap, value: Value) -> &'static str {
    kind_name(heap.get(value))
}

/// Truthiness of a value.
pub fn is_truthy(heap: &Heap, value: Value) -> bool {
    match heap.get(value) {
        Obj::None => false,
        Obj::Bool(b) => *b,
        Obj::Int(i) => *i != 0,
        Obj::Big(b) => !b.is_zero(),
        Obj::Float(f) => *f != 0.0,
        Obj::Str(s) => !s.is_empty(),
        Obj::Tuple(items) | Obj::List(items) => !items.is_empty(),
        Obj::Dict(entries) => !entries.is_empty(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Numeric tower
// ---------------------------------------------------------------------------

/// Binary operator selector shared by the generic and in-place handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
    /// Classic division: floors for integers, divides for floats.
    Div,
    TrueDiv,
    FloorDiv,
    Mod,
    Lshift,
    Rshift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinaryOpKind {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOpKind::Add => "+",
            BinaryOpKind::Sub => "-",
            BinaryOpKind::Mul => "*",
            BinaryOpKind::Div => "/",
            BinaryOpKind::TrueDiv => "/",
            BinaryOpKind::FloorDiv => "//",
            BinaryOpKind::Mod => "%",
            BinaryOpKind::Lshift => "<<",
            BinaryOpKind::Rshift => ">>",
            BinaryOpKind::BitAnd => "&",
            BinaryOpKind::BitOr => "|",
            BinaryOpKind::BitXor => "^",
        }
    }
}

enum Num {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

impl Num {
    fn to_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Big(b) => b.to_f64().unwrap_or(f64::NAN),
            Num::Float(f) => *f,
        }
    }

    fn to_big(&self) -> Option<BigInt> {
        match self {
            Num::Int(i) => Some(BigInt::from(*i)),
            Num::Big(b) => Some(b.clone()),
            Num::Float(_) => None,
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, Num::Float(_))
    }
}

fn as_num(heap: &Heap, value: Value) -> Option<Num> {
    match heap.get(value) {
        Obj::Int(i) => Some(Num::Int(*i)),
        Obj::Big(b) => Some(Num::Big(b.clone())),
        Obj::Float(f) => Some(Num::Float(*f)),
        Obj::Bool(b) => Some(Num::Int(*b as i64)),
        _ => None,
    }
}

fn unsupported_operands(heap: &Heap, op: BinaryOpKind, a: Value, b: Value) -> HostError {
    HostError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        type_name(heap, a),
        type_name(heap, b)
    ))
}

enum Concat {
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

fn try_concat(heap: &Heap, a: Value, b: Value) -> Option<Concat> {
    match (heap.get(a), heap.get(b)) {
        (Obj::Str(x), Obj::Str(y)) => Some(Concat::Str(format!("{x}{y}"))),
        (Obj::List(x), Obj::List(y)) => {
            Some(Concat::List(x.iter().chain(y.iter()).copied().collect()))
        }
        (Obj::Tuple(x), Obj::Tuple(y)) => {
            Some(Concat::Tuple(x.iter().chain(y.iter()).copied().collect()))
        }
        _ => None,
    }
}

/// Generic binary operator.  Integer results that overflow the machine word
/// widen to a big integer.
pub fn binary(heap: &mut Heap, op: BinaryOpKind, a: Value, b: Value) -> Result<Value, HostError> {
    if op == BinaryOpKind::Add {
        match try_concat(heap, a, b) {
            Some(Concat::Str(s)) => return Ok(heap.new_str(s)),
            Some(Concat::List(items)) => {
                for &item in &items {
                    heap.retain(item);
                }
                return Ok(heap.new_list(items));
            }
            Some(Concat::Tuple(items)) => {
                for &item in &items {
                    heap.retain(item);
                }
                return Ok(heap.new_tuple(items));
            }
            None => {}
        }
    }
    match (as_num(heap, a), as_num(heap, b)) {
        (Some(x), Some(y)) => num_binary(heap, op, x, y),
        _ => Err(unsupported_operands(heap, op, a, b)),
    }
}

/// In-place binary operator.  `list += list` extends the left operand in
/// place and returns it; everything else falls back to the generic operator.
pub fn inplace_binary(
    heap: &mut Heap,
    op: BinaryOpKind,
    a: Value,
    b: Value,
) -> Result<Value, HostError> {
    if op == BinaryOpKind::Add {
        let extension = match (heap.get(a), heap.get(b)) {
            (Obj::List(_), Obj::List(rhs)) => Some(rhs.clone()),
            _ => None,
        };
        if let Some(items) = extension {
            for &item in &items {
                heap.retain(item);
            }
            if let Obj::List(lhs) = heap.get_mut(a) {
                lhs.extend(items);
            }
            heap.retain(a);
            return Ok(a);
        }
    }
    binary(heap, op, a, b)
}

fn num_binary(heap: &mut Heap, op: BinaryOpKind, a: Num, b: Num) -> Result<Value, HostError> {
    let any_float = a.is_float() || b.is_float();
    match op {
        BinaryOpKind::Lshift
        | BinaryOpKind::Rshift
        | BinaryOpKind::BitAnd
        | BinaryOpKind::BitOr
        | BinaryOpKind::BitXor => {
            if any_float {
                return Err(HostError::type_error(format!(
                    "unsupported operand type(s) for {}: 'float'",
                    op.symbol()
                )));
            }
            int_bitwise(heap, op, &a, &b)
        }
        BinaryOpKind::TrueDiv => float_binary(heap, op, a.to_f64(), b.to_f64()),
        _ if any_float => float_binary(heap, op, a.to_f64(), b.to_f64()),
        _ => int_binary_wide(heap, op, &a, &b),
    }
}

fn int_bitwise(heap: &mut Heap, op: BinaryOpKind, a: &Num, b: &Num) -> Result<Value, HostError> {
    let x = a.to_big().expect("bitwise operand checked as integer");
    let y = b.to_big().expect("bitwise operand checked as integer");
    let result = match op {
        BinaryOpKind::Lshift | BinaryOpKind::Rshift => {
            let shift = y
                .to_u64()
                .ok_or_else(|| HostError::value_error("negative shift count"))?;
            let shift = usize::try_from(shift)
                .map_err(|_| HostError::value_error("shift count too large"))?;
            if op == BinaryOpKind::Lshift {
                x << shift
            } else {
                x >> shift
            }
        }
        BinaryOpKind::BitAnd => x & y,
        BinaryOpKind::BitOr => x | y,
        BinaryOpKind::BitXor => x ^ y,
        _ => unreachable!("non-bitwise opcode routed to int_bitwise"),
    };
    Ok(heap.new_big(result))
}

fn int_binary_wide(
    heap: &mut Heap,
    op: BinaryOpKind,
    a: &Num,
    b: &Num,
) -> Result<Value, HostError> {
    // Machine-word path first; any overflow re-runs in the wide
    // representation.
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let (x, y) = (*x, *y);
        let narrow = match op {
            BinaryOpKind::Add => x.checked_add(y),
            BinaryOpKind::Sub => x.checked_sub(y),
            BinaryOpKind::Mul => x.checked_mul(y),
            BinaryOpKind::Div | BinaryOpKind::FloorDiv => {
                if y == 0 {
                    return Err(HostError::zero_division(
                        "integer division or modulo by zero",
                    ));
                }
                if x == i64::MIN && y == -1 {
                    None
                } else {
                    Some(Integer::div_floor(&x, &y))
                }
            }
            BinaryOpKind::Mod => {
                if y == 0 {
                    return Err(HostError::zero_division(
                        "integer division or modulo by zero",
                    ));
                }
                if x == i64::MIN && y == -1 {
                    None
                } else {
                    Some(Integer::mod_floor(&x, &y))
                }
            }
            _ => unreachable!("bitwise opcode routed to int_binary_wide"),
        };
        if let Some(result) = narrow {
            return Ok(heap.new_int(result));
        }
    }
    let x = a.to_big().expect("integer operand checked");
    let y = b.to_big().expect("integer operand checked");
    let result = match op {
        BinaryOpKind::Add => x + y,
        BinaryOpKind::Sub => x - y,
        BinaryOpKind::Mul => x * y,
        BinaryOpKind::Div | BinaryOpKind::FloorDiv => {
            if y.is_zero() {
                return Err(HostError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            Integer::div_floor(&x, &y)
        }
        BinaryOpKind::Mod => {
            if y.is_zero() {
                return Err(HostError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            Integer::mod_floor(&x, &y)
        }
        _ => unreachable!("bitwise opcode routed to int_binary_wide"),
    };
    Ok(heap.new_big(result))
}

fn float_binary(heap: &mut Heap, op: BinaryOpKind, x: f64, y: f64) -> Result<Value, HostError> {
    let result = match op {
        BinaryOpKind::Add => x + y,
        BinaryOpKind::Sub => x - y,
        BinaryOpKind::Mul => x * y,
        BinaryOpKind::Div | BinaryOpKind::TrueDiv => {
            if y == 0.0 {
                return Err(HostError::zero_division("float division by zero"));
            }
            x / y
        }
        BinaryOpKind::FloorDiv => {
            if y == 0.0 {
                return Err(HostError::zero_division("float division by zero"));
            }
            (x / y).floor()
        }
        BinaryOpKind::Mod => {
            if y == 0.0 {
                return Err(HostError::zero_division("float modulo by zero"));
            }
            x - y * (x / y).floor()
        }
        _ => unreachable!("bitwise opcode routed to float_binary"),
    };
    Ok(heap.new_float(result))
}

/// Three-argument power.  `modulus` is the canonical `None` for the common
/// two-operand form.
pub fn power(heap: &mut Heap, a: Value, b: Value, modulus: Value) -> Result<Value, HostError> {
    let has_modulus = !matches!(heap.get(modulus), Obj::None);
    let (x, y) = match (as_num(heap, a), as_num(heap, b)) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(HostError::type_error(format!(
                "unsupported operand type(s) for **: '{}' and '{}'",
                type_name(heap, a),
                type_name(heap, b)
            )))
        }
    };
    if has_modulus {
        let m = as_num(heap, modulus)
            .and_then(|n| n.to_big())
            .ok_or_else(|| {
                HostError::type_error("pow() 3rd argument must be an integer when present")
            })?;
        let (base, exp) = match (x.to_big(), y.to_big()) {
            (Some(base), Some(exp)) => (base, exp),
            _ => {
                return Err(HostError::type_error(
                    "pow() with a modulus requires integer operands",
                ))
            }
        };
        if exp.is_negative() {
            return Err(HostError::type_error(
                "pow() 2nd argument cannot be negative when 3rd argument specified",
            ));
        }
        if m.is_zero() {
            return Err(HostError::value_error("pow() 3rd argument cannot be 0"));
        }
        return Ok(heap.new_big(base.modpow(&exp, &m)));
    }
    match (x.to_big(), y.to_big()) {
        (Some(base), Some(exp)) if !exp.is_negative() => {
            let exp = exp
                .to_u32()
                .ok_or_else(|| HostError::value_error("exponent too large"))?;
            Ok(heap.new_big(base.pow(exp)))
        }
        _ => Ok(heap.new_float(x.to_f64().powf(y.to_f64()))),
    }
}

/// Unary negation.
pub fn negate(heap: &mut Heap, value: Value) -> Result<Value, HostError> {
    match heap.get(value) {
        Obj::Int(i) => match i.checked_neg() {
            Some(result) => Ok(heap.new_int(result)),
            None => {
                let wide = -BigInt::from(i64::MIN);
                Ok(heap.new_big(wide))
            }
        },
        Obj::Big(b) => {
            let negated = -b.clone();
            Ok(heap.new_big(negated))
        }
        Obj::Float(f) => {
            let negated = -*f;
            Ok(heap.new_float(negated))
        }
        Obj::Bool(b) => {
            let as_int = -(*b as i64);
            Ok(heap.new_int(as_int))
        }
        other => Err(HostError::type_error(format!(
            "bad operand type for unary -: '{}'",
            kind_name(other)
        ))),
    }
}

/// Unary plus: identity on numbers, integer promotion for booleans.
pub fn positive(heap: &mut Heap, value: Value) -> Result<Value, HostError> {
    match heap.get(value) {
        Obj::Int(_) | Obj::Big(_) | Obj::Float(_) => {
            heap.retain(value);
            Ok(value)
        }
        Obj::Bool(b) => {
            let as_int = *b as i64;
            Ok(heap.new_int(as_int))
        }
        other => Err(HostError::type_error(format!(
            "bad operand type for unary +: '{}'",
            kind_name(other)
        ))),
    }
}

/// Bitwise inversion.
pub fn invert(heap: &mut Heap, value: Value) -> Result<Value, HostError> {
    match heap.get(value) {
        Obj::Int(i) => {
            let inverted = !*i;
            Ok(heap.new_int(inverted))
        }
        Obj::Big(b) => {
            let inverted = -(b.clone() + 1i64);
            Ok(heap.new_big(inverted))
        }
        Obj::Bool(b) => {
            let inverted = !(*b as i64);
            Ok(heap.new_int(inverted))
        }
        other => Err(HostError::type_error(format!(
            "bad operand type for unary ~: '{}'",
            kind_name(other)
        ))),
    }
}

/// Printable representation as a new string value.
pub fn repr_value(heap: &mut Heap, value: Value) -> Result<Value, HostError> {
    let text = repr_string(heap, value);
    Ok(heap.new_str(text))
}

/// Printable representation of a value.
pub fn repr_string(heap: &Heap, value: Value) -> String {
    match heap.get(value) {
        Obj::None => "None".to_owned(),
        Obj::Bool(true) => "True".to_owned(),
        Obj::Bool(false) => "False".to_owned(),
        Obj::Int(i) => i.to_string(),
        Obj::Big(b) => b.to_string(),
        Obj::Float(f) => format!("{f:?}"),
        Obj::Str(s) => format!("'{}'", s.escape_default()),
        Obj::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|&v| repr_string(heap, v)).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        Obj::List(items) => {
            let parts: Vec<String> = items.iter().map(|&v| repr_string(heap, v)).collect();
            format!("[{}]", parts.join(", "))
        }
        Obj::Dict(entries) => {
            let mut pairs: Vec<(&DictKey, &Value)> = entries.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = pairs
                .into_iter()
                .map(|(k, &v)| format!("{}: {}", dict_key_repr(k), repr_string(heap, v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Obj::Function(f) => format!("<function {}>", f.name),
        Obj::Native { name, .. } => format!("<built-in function {name}>"),
        Obj::BoundMethod { .. } => "<bound method>".to_owned(),
        Obj::Instance { .. } => "<instance>".to_owned(),
        Obj::Iter { .. } => "<iterator>".to_owned(),
        Obj::File(_) => "<file>".to_owned(),
    }
}

fn dict_key_repr(key: &DictKey) -> String {
    match key {
        DictKey::Int(i) => i.to_string(),
        DictKey::Bool(true) => "True".to_owned(),
        DictKey::Bool(false) => "False".to_owned(),
        DictKey::Str(s) => format!("'{}'", s.escape_default()),
        DictKey::Float(f) => format!("{:?}", f.0),
    }
}

/// Display form: strings render raw, everything else as its repr.
pub fn str_string(heap: &Heap, value: Value) -> String {
    match heap.get(value) {
        Obj::Str(s) => s.clone(),
        _ => repr_string(heap, value),
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Rich-comparison selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

/// Generic rich comparison; returns an owned boolean handle.
pub fn rich_compare(
    heap: &mut Heap,
    op: CompareKind,
    a: Value,
    b: Value,
) -> Result<Value, HostError> {
    let result = match op {
        CompareKind::Eq => value_eq(heap, a, b),
        CompareKind::Ne => !value_eq(heap, a, b),
        _ => {
            let ordering = compare_ordering(heap, a, b)?;
            match op {
                CompareKind::Lt => ordering == Some(Ordering::Less),
                CompareKind::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                CompareKind::Gt => ordering == Some(Ordering::Greater),
                CompareKind::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                CompareKind::Eq | CompareKind::Ne => unreachable!("handled above"),
            }
        }
    };
    let out = heap.bool_value(result);
    heap.retain(out);
    Ok(out)
}

fn compare_ordering(heap: &Heap, a: Value, b: Value) -> Result<Option<Ordering>, HostError> {
    if let (Some(x), Some(y)) = (as_num(heap, a), as_num(heap, b)) {
        return Ok(num_cmp(&x, &y));
    }
    if let (Obj::Str(x), Obj::Str(y)) = (heap.get(a), heap.get(b)) {
        return Ok(Some(x.cmp(y)));
    }
    Err(HostError::type_error(format!(
        "cannot order '{}' and '{}'",
        type_name(heap, a),
        type_name(heap, b)
    )))
}

fn num_cmp(a: &Num, b: &Num) -> Option<Ordering> {
    if a.is_float() || b.is_float() {
        return a.to_f64().partial_cmp(&b.to_f64());
    }
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Some(x.cmp(y)),
        _ => {
            let x = a.to_big().expect("integer operand checked");
            let y = b.to_big().expect("integer operand checked");
            Some(x.cmp(&y))
        }
    }
}

/// Structural equality.
pub fn value_eq(heap: &Heap, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_num(heap, a), as_num(heap, b)) {
        return num_cmp(&x, &y) == Some(Ordering::Equal);
    }
    match (heap.get(a), heap.get(b)) {
        (Obj::Str(x), Obj::Str(y)) => x == y,
        (Obj::List(x), Obj::List(y)) | (Obj::Tuple(x), Obj::Tuple(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let pairs: Vec<(Value, Value)> = x.iter().copied().zip(y.iter().copied()).collect();
            pairs.into_iter().all(|(x, y)| value_eq(heap, x, y))
        }
        (Obj::Dict(x), Obj::Dict(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let pairs: Vec<(DictKey, Value)> = x.iter().map(|(k, &v)| (k.clone(), v)).collect();
            pairs.into_iter().all(|(key, left)| {
                matches!(heap.dict_get(b, &key), Some(right) if value_eq(heap, left, right))
            })
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Subscripting and slicing
// ---------------------------------------------------------------------------

fn index_of(heap: &Heap, key: Value) -> Option<i64> {
    match heap.get(key) {
        Obj::Int(i) => Some(*i),
        Obj::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn normalize_index(index: i64, len: usize, what: &'static str) -> Result<usize, HostError> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        return Err(HostError::index_error(format!("{what} index out of range")));
    }
    Ok(adjusted as usize)
}

/// Generic item get; the result is owned.
pub fn get_item(heap: &mut Heap, container: Value, key: Value) -> Result<Value, HostError> {
    enum Found {
        Value(Value),
        Char(char),
    }
    let found = match heap.get(container) {
        Obj::List(items) => {
            let index = index_of(heap, key).ok_or_else(|| {
                HostError::type_error("list indices must be integers")
            })?;
            Found::Value(items[normalize_index(index, items.len(), "list")?])
        }
        Obj::Tuple(items) => {
            let index = index_of(heap, key)
                .ok_or_else(|| HostError::type_error("tuple indices must be integers"))?;
            Found::Value(items[normalize_index(index, items.len(), "tuple")?])
        }
        Obj::Str(s) => {
            let index = index_of(heap, key)
                .ok_or_else(|| HostError::type_error("string indices must be integers"))?;
            let chars: Vec<char> = s.chars().collect();
            Found::Char(chars[normalize_index(index, chars.len(), "string")?])
        }
        Obj::Dict(_) => {
            let key = heap.dict_key(key)?;
            match heap.dict_get(container, &key) {
                Some(value) => Found::Value(value),
                None => {
                    return Err(HostError::new(
                        ErrorKind::Key,
                        dict_key_repr(&key),
                    ))
                }
            }
        }
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is unsubscriptable",
                kind_name(other)
            )))
        }
    };
    match found {
        Found::Value(value) => {
            heap.retain(value);
            Ok(value)
        }
        Found::Char(c) => Ok(heap.new_str(c.to_string())),
    }
}

/// Generic item set; retains `value` on behalf of the container.
pub fn set_item(
    heap: &mut Heap,
    container: Value,
    key: Value,
    value: Value,
) -> Result<(), HostError> {
    match heap.get(container) {
        Obj::List(items) => {
            let index = index_of(heap, key)
                .ok_or_else(|| HostError::type_error("list indices must be integers"))?;
            let slot = normalize_index(index, items.len(), "list assignment")?;
            heap.retain(value);
            let old = match heap.get_mut(container) {
                Obj::List(items) => std::mem::replace(&mut items[slot], value),
                _ => unreachable!("container checked as list"),
            };
            heap.release(old);
            Ok(())
        }
        Obj::Dict(_) => {
            let key = heap.dict_key(key)?;
            heap.retain(value);
            heap.dict_set(container, key, value);
            Ok(())
        }
        other => Err(HostError::type_error(format!(
            "'{}' object does not support item assignment",
            kind_name(other)
        ))),
    }
}

fn slice_bound(heap: &Heap, bound: Option<Value>, default: i64) -> Result<i64, HostError> {
    match bound {
        None => Ok(default),
        Some(value) => index_of(heap, value)
            .ok_or_else(|| HostError::type_error("slice indices must be integers")),
    }
}

/// Two-index slice with the host clamping rules; missing bounds come in as
/// `None`.
pub fn get_slice(
    heap: &mut Heap,
    container: Value,
    lo: Option<Value>,
    hi: Option<Value>,
) -> Result<Value, HostError> {
    let len = match heap.get(container) {
        Obj::List(items) | Obj::Tuple(items) => items.len(),
        Obj::Str(s) => s.chars().count(),
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is unsliceable",
                kind_name(other)
            )))
        }
    };
    let clamp = |bound: i64| -> usize {
        let len = len as i64;
        let adjusted = if bound < 0 { bound + len } else { bound };
        adjusted.clamp(0, len) as usize
    };
    let start = clamp(slice_bound(heap, lo, 0)?);
    let end = clamp(slice_bound(heap, hi, len as i64)?);
    let end = end.max(start);
    enum Sliced {
        List(Vec<Value>),
        Tuple(Vec<Value>),
        Str(String),
    }
    let sliced = match heap.get(container) {
        Obj::List(items) => Sliced::List(items[start..end].to_vec()),
        Obj::Tuple(items) => Sliced::Tuple(items[start..end].to_vec()),
        Obj::Str(s) => Sliced::Str(s.chars().skip(start).take(end - start).collect()),
        _ => unreachable!("container length already classified"),
    };
    match sliced {
        Sliced::List(items) => {
            for &item in &items {
                heap.retain(item);
            }
            Ok(heap.new_list(items))
        }
        Sliced::Tuple(items) => {
            for &item in &items {
                heap.retain(item);
            }
            Ok(heap.new_tuple(items))
        }
        Sliced::Str(s) => Ok(heap.new_str(s)),
    }
}

/// Append to a list, retaining the element.
pub fn list_append(heap: &mut Heap, list: Value, value: Value) -> Result<(), HostError> {
    match heap.get(list) {
        Obj::List(_) => {
            heap.retain(value);
            if let Obj::List(items) = heap.get_mut(list) {
                items.push(value);
            }
            Ok(())
        }
        other => Err(HostError::type_error(format!(
            "cannot append to '{}' object",
            kind_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Generic attribute get; the result is owned.  An instance attribute that
/// holds an engine function is returned as a method bound to the instance.
pub fn get_attr(heap: &mut Heap, object: Value, name: &str) -> Result<Value, HostError> {
    let found = match heap.get(object) {
        Obj::Instance { attrs } => attrs.get(name).copied(),
        other => {
            return Err(HostError::attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                kind_name(other)
            )))
        }
    };
    let value = found.ok_or_else(|| {
        HostError::attribute_error(format!("'instance' object has no attribute '{name}'"))
    })?;
    if matches!(heap.get(value), Obj::Function(_)) {
        heap.retain(value);
        heap.retain(object);
        Ok(heap.new_bound_method(value, object))
    } else {
        heap.retain(value);
        Ok(value)
    }
}

/// Generic attribute set; retains `value` on behalf of the object.
pub fn set_attr(
    heap: &mut Heap,
    object: Value,
    name: &str,
    value: Value,
) -> Result<(), HostError> {
    match heap.get(object) {
        Obj::Instance { .. } => {
            heap.retain(value);
            let old = match heap.get_mut(object) {
                Obj::Instance { attrs } => attrs.insert(name.to_owned(), value),
                _ => unreachable!("object checked as instance"),
            };
            if let Some(old) = old {
                heap.release(old);
            }
            Ok(())
        }
        other => Err(HostError::attribute_error(format!(
            "'{}' object has no settable attributes",
            kind_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Generic `iter()`; the result is owned.
pub fn get_iter(heap: &mut Heap, value: Value) -> Result<Value, HostError> {
    match heap.get(value) {
        Obj::List(_) | Obj::Tuple(_) | Obj::Str(_) => {
            heap.retain(value);
            Ok(heap.alloc(Obj::Iter {
                target: value,
                index: 0,
            }))
        }
        Obj::Iter { .. } => {
            heap.retain(value);
            Ok(value)
        }
        other => Err(HostError::type_error(format!(
            "'{}' object is not iterable",
            kind_name(other)
        ))),
    }
}

/// Advance an iterator.  Returns an owned element, or `None` on exhaustion.
pub fn iter_next(heap: &mut Heap, iterator: Value) -> Result<Option<Value>, HostError> {
    let (target, index) = match heap.get(iterator) {
        Obj::Iter { target, index } => (*target, *index),
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is not an iterator",
                kind_name(other)
            )))
        }
    };
    enum Next {
        Value(Value),
        Char(char),
        Done,
    }
    let next = match heap.get(target) {
        Obj::List(items) | Obj::Tuple(items) => match items.get(index) {
            Some(&item) => Next::Value(item),
            None => Next::Done,
        },
        Obj::Str(s) => match s.chars().nth(index) {
            Some(c) => Next::Char(c),
            None => Next::Done,
        },
        other => {
            return Err(HostError::type_error(format!(
                "iterator over non-sequence '{}'",
                kind_name(other)
            )))
        }
    };
    match next {
        Next::Done => Ok(None),
        Next::Value(item) => {
            heap.retain(item);
            if let Obj::Iter { index, .. } = heap.get_mut(iterator) {
                *index += 1;
            }
            Ok(Some(item))
        }
        Next::Char(c) => {
            let item = heap.new_str(c.to_string());
            if let Obj::Iter { index, .. } = heap.get_mut(iterator) {
                *index += 1;
            }
            Ok(Some(item))
        }
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// True for native host functions invocable without an engine frame.
pub fn is_native(heap: &Heap, value: Value) -> bool {
    matches!(heap.get(value), Obj::Native { .. })
}

/// Invoke a native host function.
pub fn native_call(heap: &mut Heap, function: Value, args: &[Value]) -> Result<Value, HostError> {
    let func = match heap.get(function) {
        Obj::Native { func, .. } => *func,
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is not a native function",
                kind_name(other)
            )))
        }
    };
    func(heap, args)
}

// ---------------------------------------------------------------------------
// Print primitives
// ---------------------------------------------------------------------------

fn file_write(heap: &mut Heap, file: Value, text: &str) -> Result<(), HostError> {
    use std::io::Write;
    let sink = match heap.get(file) {
        Obj::File(f) => f.sink.clone(),
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is not a file",
                kind_name(other)
            )))
        }
    };
    match sink {
        crate::memory::FileSink::Stdout => std::io::stdout()
            .write_all(text.as_bytes())
            .map_err(|e| HostError::new(ErrorKind::Io, e.to_string())),
        crate::memory::FileSink::Buffer(buf) => {
            buf.borrow_mut().extend_from_slice(text.as_bytes());
            Ok(())
        }
    }
}

/// Write one print item with soft-space separation.
pub fn print_item(heap: &mut Heap, file: Value, value: Value) -> Result<(), HostError> {
    let text = str_string(heap, value);
    let softspace = match heap.get_mut(file) {
        Obj::File(f) => {
            let pending = f.softspace;
            f.softspace = true;
            pending
        }
        other => {
            return Err(HostError::type_error(format!(
                "'{}' object is not a file",
                kind_name(other)
            )))
        }
    };
    if softspace {
        file_write(heap, file, " ")?;
    }
    file_write(heap, file, &text)
}

/// Terminate a print statement, clearing the soft-space flag.
pub fn print_newline(heap: &mut Heap, file: Value) -> Result<(), HostError> {
    if let Obj::File(f) = heap.get_mut(file) {
        f.softspace = false;
    }
    file_write(heap, file, "\n")
}
