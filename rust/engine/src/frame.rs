//! Per-invocation register frame.
//!
//! A frame owns its register file: every non-null slot holds one strong
//! reference, released exactly once when the frame is disposed.  Registers
//! `[0 .. constants.len())` are materialised from the constant pool at
//! construction; a bound method's receiver lands in the first argument slot;
//! the caller's actuals, bound keywords and defaults fill the rest.  The
//! locals dictionary is created lazily, and one argument tuple is cached for
//! outbound calls, reallocated only when the positional count changes.

use std::rc::Rc;

use crate::bytecode::{Register, RegisterCode};
use crate::interpreter::VmError;
use crate::memory::{Heap, Value};

struct CallArgs {
    tuple: Value,
    arity: usize,
}

/// Inputs to frame construction.
pub(crate) struct FrameSpec<'a> {
    pub code: Rc<RegisterCode>,
    pub function_name: &'a str,
    /// Borrowed; the frame retains its own references.
    pub globals: Value,
    pub builtins: Value,
    pub receiver: Option<Value>,
    pub args: &'a [Value],
    pub kwargs: &'a [(String, Value)],
    pub defaults: &'a [Value],
    pub params: &'a [String],
}

/// Activation record for one evaluation of a [`RegisterCode`].
pub struct RegisterFrame {
    pub(crate) code: Rc<RegisterCode>,
    pub(crate) registers: Vec<Option<Value>>,
    /// Byte offset of the next instruction to dispatch.
    pub(crate) pc: usize,
    pub(crate) globals: Value,
    pub(crate) builtins: Value,
    locals: Option<Value>,
    call_args: Option<CallArgs>,
}

impl RegisterFrame {
    pub(crate) fn build(heap: &mut Heap, spec: FrameSpec<'_>) -> Result<RegisterFrame, VmError> {
        if spec.code.cell_vars != 0 {
            return Err(VmError::ClosuresRejected);
        }
        heap.retain(spec.globals);
        heap.retain(spec.builtins);
        let mut frame = RegisterFrame {
            registers: vec![None; spec.code.num_registers as usize],
            pc: spec.code.entry_offset(),
            globals: spec.globals,
            builtins: spec.builtins,
            locals: None,
            call_args: None,
            code: Rc::clone(&spec.code),
        };
        match bind_arguments(heap, &mut frame, &spec) {
            Ok(()) => Ok(frame),
            Err(err) => {
                frame.dispose(heap);
                Err(err)
            }
        }
    }

    /// Read a register; reading an unwritten slot violates the compiler
    /// contract and is an engine fault.
    pub(crate) fn get(&self, register: Register) -> Result<Value, VmError> {
        self.registers
            .get(register.0 as usize)
            .copied()
            .flatten()
            .ok_or(VmError::UninitializedRegister {
                register: register.0,
            })
    }

    /// Install an owned value, releasing the slot's previous occupant.  The
    /// new reference is already owned when the old one is dropped, so
    /// aliasing writes are safe.
    pub(crate) fn set_owned(
        &mut self,
        heap: &mut Heap,
        register: Register,
        value: Value,
    ) -> Result<(), VmError> {
        let slot = self
            .registers
            .get_mut(register.0 as usize)
            .ok_or(VmError::RegisterOutOfRange {
                register: register.0,
            })?;
        let old = slot.replace(value);
        if let Some(old) = old {
            heap.release(old);
        }
        Ok(())
    }

    pub(crate) fn locals(&self) -> Option<Value> {
        self.locals
    }

    /// Locals dictionary, created on first use.
    pub(crate) fn ensure_locals(&mut self, heap: &mut Heap) -> Value {
        match self.locals {
            Some(locals) => locals,
            None => {
                let locals = heap.new_dict();
                self.locals = Some(locals);
                locals
            }
        }
    }

    /// Argument tuple for an outbound call of `arity` positionals.  Reuses
    /// the cached tuple unless the arity changed.  The tuple never escapes
    /// the engine.
    pub(crate) fn call_args_tuple(&mut self, heap: &mut Heap, arity: usize) -> Value {
        if let Some(cached) = &self.call_args {
            if cached.arity == arity {
                return cached.tuple;
            }
        }
        if let Some(old) = self.call_args.take() {
            heap.release(old.tuple);
        }
        let none = heap.none();
        let tuple = heap.new_tuple(vec![none; arity]);
        self.call_args = Some(CallArgs { tuple, arity });
        tuple
    }

    /// Release every reference the frame owns.  Must run on all exit paths.
    pub(crate) fn dispose(self, heap: &mut Heap) {
        for slot in self.registers {
            if let Some(value) = slot {
                heap.release(value);
            }
        }
        if let Some(locals) = self.locals {
            heap.release(locals);
        }
        if let Some(cached) = self.call_args {
            heap.release(cached.tuple);
        }
        heap.release(self.globals);
        heap.release(self.builtins);
    }
}

fn bind_arguments(
    heap: &mut Heap,
    frame: &mut RegisterFrame,
    spec: &FrameSpec<'_>,
) -> Result<(), VmError> {
    let code = Rc::clone(&frame.code);
    for (index, literal) in code.constants.iter().enumerate() {
        frame.registers[index] = Some(heap.intern_literal(literal));
    }

    let mut first_arg = code.constants.len();
    let mut bound = 0;
    if let Some(receiver) = spec.receiver {
        heap.retain(receiver);
        frame.registers[first_arg] = Some(receiver);
        first_arg += 1;
        bound = 1;
    }
    let needed = (code.arg_count as usize).saturating_sub(bound);
    let params = spec.params.get(bound..).unwrap_or(&[]);

    if spec.args.len() > needed {
        return Err(VmError::Arity {
            function: spec.function_name.to_owned(),
            expected: needed,
            actual: spec.args.len(),
        });
    }
    for (index, &arg) in spec.args.iter().enumerate() {
        heap.retain(arg);
        frame.registers[first_arg + index] = Some(arg);
    }

    for (name, value) in spec.kwargs {
        let position = params.iter().position(|param| param == name).ok_or_else(|| {
            VmError::UnexpectedKeyword {
                function: spec.function_name.to_owned(),
                keyword: name.clone(),
            }
        })?;
        let slot = first_arg + position;
        if frame.registers[slot].is_some() {
            return Err(VmError::DuplicateArgument {
                function: spec.function_name.to_owned(),
                name: name.clone(),
            });
        }
        heap.retain(*value);
        frame.registers[slot] = Some(*value);
    }

    // Defaults cover the tail of the parameter list.
    let first_default = needed.saturating_sub(spec.defaults.len());
    for index in 0..needed {
        if frame.registers[first_arg + index].is_none() {
            if index < first_default {
                return Err(VmError::Arity {
                    function: spec.function_name.to_owned(),
                    expected: first_default,
                    actual: spec.args.len(),
                });
            }
            let default = spec.defaults[index - first_default];
            heap.retain(default);
            frame.registers[first_arg + index] = Some(default);
        }
    }
    Ok(())
}
