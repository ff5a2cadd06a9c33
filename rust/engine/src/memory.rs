//! Refcounted value heap for the Tern execution engine.
//!
//! The engine never inspects value representations directly; registers hold
//! opaque [`Value`] handles and every strong reference is matched by exactly
//! one release.  The heap makes that discipline concrete: each occupied slot
//! carries an explicit reference count, `retain`/`release` adjust it, and a
//! release that reaches zero frees the slot and releases the object's
//! children.  `None`, `True` and `False` live in immortal slots so borrowed
//! singleton handles can circulate freely.  All heap activity is surfaced
//! through [`MemoryMetrics`] so the test suite can assert leak freedom.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{Literal, RegisterCode};
use crate::values::NativeFn;

/// Opaque handle to a heap value.  Copying the handle does not retain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u32);

const NONE_INDEX: u32 = 0;
const FALSE_INDEX: u32 = 1;
const TRUE_INDEX: u32 = 2;
const FIRST_DYNAMIC: u32 = 3;
const FREE_END: u32 = u32::MAX;

impl Value {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn is_immortal(self) -> bool {
        self.0 < FIRST_DYNAMIC
    }
}

/// Function object executed by the engine.
#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub name: String,
    pub code: Rc<RegisterCode>,
    /// Module globals dictionary; owned by the function object.
    pub globals: Value,
    /// Default values covering the tail of the parameter list; owned.
    pub defaults: Vec<Value>,
    /// Formal parameter names, receiver included for methods.
    pub params: Vec<String>,
}

/// Sink behind a file object.
#[derive(Debug, Clone)]
pub enum FileSink {
    Stdout,
    Buffer(Rc<RefCell<Vec<u8>>>),
}

/// File object with the soft-space flag used by the print opcodes.
#[derive(Debug)]
pub struct FileObj {
    pub sink: FileSink,
    pub softspace: bool,
}

/// Host object representation.
#[derive(Debug)]
pub(crate) enum Obj {
    None,
    Bool(bool),
    Int(i64),
    Big(BigInt),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(HashMap<DictKey, Value>),
    Function(FunctionObj),
    Native { name: String, func: NativeFn },
    BoundMethod { function: Value, receiver: Value },
    Instance { attrs: HashMap<String, Value> },
    Iter { target: Value, index: usize },
    File(FileObj),
}

/// Hashable key copy used by dictionary storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictKey {
    Int(i64),
    Bool(bool),
    Str(String),
    Float(OrderedFloat<f64>),
}

/// Memory-level errors bubbled up through the value API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("unhashable key type: {0}")]
    UnhashableKey(&'static str),
}

/// Heap usage snapshot; `live` counts occupied non-singleton slots.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub live: usize,
    pub allocations: usize,
    pub peak_live: usize,
}

enum Slot {
    Occupied { refs: u32, obj: Obj },
    Free { next: u32 },
}

/// Slab of refcounted slots with an intrusive free list.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: u32,
    metrics: MemoryMetrics,
}

impl Heap {
    pub fn new() -> Self {
        let slots = vec![
            Slot::Occupied {
                refs: 1,
                obj: Obj::None,
            },
            Slot::Occupied {
                refs: 1,
                obj: Obj::Bool(false),
            },
            Slot::Occupied {
                refs: 1,
                obj: Obj::Bool(true),
            },
        ];
        Self {
            slots,
            free_head: FREE_END,
            metrics: MemoryMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &MemoryMetrics {
        &self.metrics
    }

    /// Canonical `None` handle (borrowed).
    pub fn none(&self) -> Value {
        Value(NONE_INDEX)
    }

    /// Canonical boolean handle (borrowed).
    pub fn bool_value(&self, value: bool) -> Value {
        if value {
            Value(TRUE_INDEX)
        } else {
            Value(FALSE_INDEX)
        }
    }

    pub fn true_value(&self) -> Value {
        Value(TRUE_INDEX)
    }

    pub fn false_value(&self) -> Value {
        Value(FALSE_INDEX)
    }

    pub(crate) fn alloc(&mut self, obj: Obj) -> Value {
        self.metrics.allocations += 1;
        self.metrics.live += 1;
        if self.metrics.live > self.metrics.peak_live {
            self.metrics.peak_live = self.metrics.live;
        }
        let slot = Slot::Occupied { refs: 1, obj };
        if self.free_head != FREE_END {
            let index = self.free_head;
            self.free_head = match self.slots[index as usize] {
                Slot::Free { next } => next,
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.slots[index as usize] = slot;
            Value(index)
        } else {
            self.slots.push(slot);
            Value((self.slots.len() - 1) as u32)
        }
    }

    /// Add one strong reference.
    pub fn retain(&mut self, value: Value) {
        if value.is_immortal() {
            return;
        }
        if let Some(Slot::Occupied { refs, .. }) = self.slots.get_mut(value.index()) {
            *refs += 1;
        }
    }

    /// Drop one strong reference, freeing the object (and releasing its
    /// children) when the count reaches zero.
    pub fn release(&mut self, value: Value) {
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            if value.is_immortal() {
                continue;
            }
            let slot = match self.slots.get_mut(value.index()) {
                Some(slot) => slot,
                None => continue,
            };
            let free = match slot {
                Slot::Occupied { refs, .. } => {
                    *refs -= 1;
                    *refs == 0
                }
                Slot::Free { .. } => continue,
            };
            if free {
                let old = std::mem::replace(
                    &mut self.slots[value.index()],
                    Slot::Free {
                        next: self.free_head,
                    },
                );
                self.free_head = value.0;
                self.metrics.live -= 1;
                if let Slot::Occupied { obj, .. } = old {
                    push_children(&obj, &mut pending);
                }
            }
        }
    }

    /// Current strong count; zero for freed or unknown slots.
    pub fn refcount(&self, value: Value) -> u32 {
        match self.slots.get(value.index()) {
            Some(Slot::Occupied { refs, .. }) => *refs,
            _ => 0,
        }
    }

    pub(crate) fn get(&self, value: Value) -> &Obj {
        match &self.slots[value.index()] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Free { .. } => panic!("read of freed heap slot {}", value.0),
        }
    }

    pub(crate) fn get_mut(&mut self, value: Value) -> &mut Obj {
        match &mut self.slots[value.index()] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Free { .. } => panic!("write to freed heap slot {}", value.0),
        }
    }

    // ------------------------------------------------------------------
    // Constructors.  Each returns an owned reference; constructors taking
    // `Value` operands consume the caller's reference to them.
    // ------------------------------------------------------------------

    pub fn new_int(&mut self, value: i64) -> Value {
        self.alloc(Obj::Int(value))
    }

    /// Box a wide integer, narrowing back to the machine representation
    /// when it fits.
    pub fn new_big(&mut self, value: BigInt) -> Value {
        match value.to_i64() {
            Some(narrow) => self.alloc(Obj::Int(narrow)),
            None => self.alloc(Obj::Big(value)),
        }
    }

    pub fn new_float(&mut self, value: f64) -> Value {
        self.alloc(Obj::Float(value))
    }

    pub fn new_str(&mut self, value: impl Into<String>) -> Value {
        self.alloc(Obj::Str(value.into()))
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        self.alloc(Obj::Tuple(items))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        self.alloc(Obj::List(items))
    }

    pub fn new_dict(&mut self) -> Value {
        self.alloc(Obj::Dict(HashMap::new()))
    }

    pub fn new_instance(&mut self) -> Value {
        self.alloc(Obj::Instance {
            attrs: HashMap::new(),
        })
    }

    pub fn new_function(&mut self, function: FunctionObj) -> Value {
        self.alloc(Obj::Function(function))
    }

    pub fn new_native(&mut self, name: impl Into<String>, func: NativeFn) -> Value {
        self.alloc(Obj::Native {
            name: name.into(),
            func,
        })
    }

    pub fn new_bound_method(&mut self, function: Value, receiver: Value) -> Value {
        self.alloc(Obj::BoundMethod { function, receiver })
    }

    pub fn new_file(&mut self, sink: FileSink) -> Value {
        self.alloc(Obj::File(FileObj {
            sink,
            softspace: false,
        }))
    }

    /// Materialise a code literal into a host value.
    pub fn intern_literal(&mut self, literal: &Literal) -> Value {
        match literal {
            Literal::None => self.none(),
            Literal::Bool(b) => self.bool_value(*b),
            Literal::Int(i) => self.new_int(*i),
            Literal::Float(f) => self.new_float(*f),
            Literal::Str(s) => self.new_str(s.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Container primitives.
    // ------------------------------------------------------------------

    /// Number of elements in a tuple.
    pub fn tuple_len(&self, tuple: Value) -> usize {
        match self.get(tuple) {
            Obj::Tuple(items) => items.len(),
            _ => 0,
        }
    }

    /// Borrowed element access.
    pub fn tuple_get(&self, tuple: Value, index: usize) -> Option<Value> {
        match self.get(tuple) {
            Obj::Tuple(items) => items.get(index).copied(),
            _ => None,
        }
    }

    /// Store `value` (ownership transferred) at `index`, releasing the slot's
    /// previous occupant.
    pub fn tuple_set(&mut self, tuple: Value, index: usize, value: Value) {
        let old = match self.get_mut(tuple) {
            Obj::Tuple(items) => std::mem::replace(&mut items[index], value),
            _ => return,
        };
        self.release(old);
    }

    /// Look up a dictionary entry; the returned handle is borrowed.
    pub fn dict_get(&self, dict: Value, key: &DictKey) -> Option<Value> {
        match self.get(dict) {
            Obj::Dict(entries) => entries.get(key).copied(),
            _ => None,
        }
    }

    /// Insert `value` (ownership transferred) under `key`, releasing any
    /// previous entry.
    pub fn dict_set(&mut self, dict: Value, key: DictKey, value: Value) {
        let old = match self.get_mut(dict) {
            Obj::Dict(entries) => entries.insert(key, value),
            _ => None,
        };
        if let Some(old) = old {
            self.release(old);
        }
    }

    pub fn dict_get_str(&self, dict: Value, key: &str) -> Option<Value> {
        self.dict_get(dict, &DictKey::Str(key.to_owned()))
    }

    pub fn dict_set_str(&mut self, dict: Value, key: &str, value: Value) {
        self.dict_set(dict, DictKey::Str(key.to_owned()), value);
    }

    // ------------------------------------------------------------------
    // Inspection.
    // ------------------------------------------------------------------

    /// True only for the machine integer representation (not booleans, not
    /// widened integers).
    pub fn int_check_exact(&self, value: Value) -> bool {
        matches!(self.get(value), Obj::Int(_))
    }

    pub fn float_check_exact(&self, value: Value) -> bool {
        matches!(self.get(value), Obj::Float(_))
    }

    /// Machine value of an integer, narrowing widened integers when they
    /// fit.
    pub fn int_value(&self, value: Value) -> Option<i64> {
        match self.get(value) {
            Obj::Int(i) => Some(*i),
            Obj::Big(b) => b.to_i64(),
            _ => None,
        }
    }

    pub fn float_value(&self, value: Value) -> Option<f64> {
        match self.get(value) {
            Obj::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self, value: Value) -> Option<&str> {
        match self.get(value) {
            Obj::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_none_value(&self, value: Value) -> bool {
        matches!(self.get(value), Obj::None)
    }

    pub fn list_len(&self, list: Value) -> Option<usize> {
        match self.get(list) {
            Obj::List(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Borrowed element access.
    pub fn list_get(&self, list: Value, index: usize) -> Option<Value> {
        match self.get(list) {
            Obj::List(items) => items.get(index).copied(),
            _ => None,
        }
    }

    /// Globals dictionary owned by a function object (borrowed).
    pub fn function_globals(&self, function: Value) -> Option<Value> {
        match self.get(function) {
            Obj::Function(f) => Some(f.globals),
            _ => None,
        }
    }

    /// Convert a host value into a dictionary key copy.
    pub fn dict_key(&self, key: Value) -> Result<DictKey, MemoryError> {
        match self.get(key) {
            Obj::Int(i) => Ok(DictKey::Int(*i)),
            Obj::Bool(b) => Ok(DictKey::Bool(*b)),
            Obj::Str(s) => Ok(DictKey::Str(s.clone())),
            Obj::Float(f) => Ok(DictKey::Float(OrderedFloat(*f))),
            other => Err(MemoryError::UnhashableKey(kind_name(other))),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn push_children(obj: &Obj, pending: &mut Vec<Value>) {
    match obj {
        Obj::Tuple(items) | Obj::List(items) => pending.extend(items.iter().copied()),
        Obj::Dict(entries) => pending.extend(entries.values().copied()),
        Obj::Function(function) => {
            pending.push(function.globals);
            pending.extend(function.defaults.iter().copied());
        }
        Obj::BoundMethod { function, receiver } => {
            pending.push(*function);
            pending.push(*receiver);
        }
        Obj::Instance { attrs } => pending.extend(attrs.values().copied()),
        Obj::Iter { target, .. } => pending.push(*target),
        Obj::None
        | Obj::Bool(_)
        | Obj::Int(_)
        | Obj::Big(_)
        | Obj::Float(_)
        | Obj::Str(_)
        | Obj::Native { .. }
        | Obj::File(_) => {}
    }
}

/// Diagnostic name for a representation variant.
pub(crate) fn kind_name(obj: &Obj) -> &'static str {
    match obj {
        Obj::None => "NoneType",
        Obj::Bool(_) => "bool",
        Obj::Int(_) | Obj::Big(_) => "int",
        Obj::Float(_) => "float",
        Obj::Str(_) => "str",
        Obj::Tuple(_) => "tuple",
        Obj::List(_) => "list",
        Obj::Dict(_) => "dict",
        Obj::Function(_) => "function",
        Obj::Native { .. } => "builtin_function",
        Obj::BoundMethod { .. } => "instancemethod",
        Obj::Instance { .. } => "instance",
        Obj::Iter { .. } => "iterator",
        Obj::File(_) => "file",
    }
}
