//! Dispatch core of the register machine.
//!
//! `Evaluator::eval` builds a [`RegisterFrame`] for the callee and enters the
//! dispatch loop: read the opcode byte at `pc`, jump to its handler, let the
//! handler advance or rewrite `pc`, repeat.  The loop is a single tight
//! match with inlined handlers so handler-to-handler branches stay
//! predictable; termination is non-local — `RETURN_VALUE` delivers a result
//! out of the loop and any handler may surface an error, which destroys the
//! frame and propagates to the caller immediately.
//!
//! Ownership discipline: every value written into a register is made owned
//! first, whatever its origin (fresh allocation, borrowed singleton, another
//! register), and the overwritten occupant is released afterwards.  The
//! `INCREF`/`DECREF` pseudo-ops emitted by the compiler to balance counts
//! across control-flow merges are honored exactly.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::builtins;
use crate::bytecode::{
    BranchOp, DecodeError, Opcode, RegOp, RegisterCode, VarRegOp,
};
use crate::frame::{FrameSpec, RegisterFrame};
use crate::memory::{FileSink, FunctionObj, Heap, Obj, Value};
use crate::sandbox::{CancelToken, Sandbox, SandboxError, SandboxLimits};
use crate::specialize;
use crate::trace::{OpStats, OpStatusReport};
use crate::values::{self, BinaryOpKind, CompareKind, ErrorKind, HostError};
use crate::verify::{self, VerifyError};

/// Evaluator configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub limits: SandboxLimits,
}

/// Errors surfaced by the evaluator.
#[derive(Debug, Error)]
pub enum VmError {
    /// Error raised by a host value operation; kind and message preserved.
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("name '{name}' is not defined")]
    NameNotDefined { name: String },
    #[error("{function}() expected {expected} arguments, got {actual}")]
    Arity {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("{function}() got an unexpected keyword argument '{keyword}'")]
    UnexpectedKeyword { function: String, keyword: String },
    #[error("{function}() got multiple values for argument '{name}'")]
    DuplicateArgument { function: String, name: String },
    #[error("argument list must be a tuple")]
    ArgumentsNotATuple,
    #[error("register code with closure cells is not executable")]
    ClosuresRejected,
    #[error("unsupported opcode {0:?}")]
    UnsupportedOpcode(Opcode),
    #[error("invalid comparison operator {0}")]
    InvalidCompareOp(u16),
    #[error("read of uninitialized register {register}")]
    UninitializedRegister { register: u16 },
    #[error("register {register} outside the frame's register file")]
    RegisterOutOfRange { register: u16 },
    #[error("name index {index} outside the code's name table")]
    NameOutOfRange { index: u16 },
    #[error("{opcode:?} carries {found} register operands, expected {expected}")]
    MalformedOperands {
        opcode: Opcode,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl VmError {
    /// Host-visible error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Host(err) => err.kind,
            VmError::NameNotDefined { .. } => ErrorKind::Name,
            VmError::Arity { .. }
            | VmError::UnexpectedKeyword { .. }
            | VmError::DuplicateArgument { .. }
            | VmError::ArgumentsNotATuple => ErrorKind::Type,
            _ => ErrorKind::System,
        }
    }
}

/// The register-machine evaluator.
///
/// Re-entrant: the call handler recursively evaluates engine functions,
/// building a stack of frames.  A single evaluator is single-threaded;
/// exclusive access (`&mut self`) is the execution lock.
pub struct Evaluator {
    heap: Heap,
    builtins: Value,
    stdout: Value,
    config: EngineConfig,
    stats: OpStats,
    sandbox: Sandbox,
    depth: usize,
    cancel: Option<CancelToken>,
    captured: Option<Rc<RefCell<Vec<u8>>>>,
    verified: HashSet<usize>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut heap = Heap::new();
        let builtins = builtins::standard(&mut heap);
        let stdout = heap.new_file(FileSink::Stdout);
        Self {
            heap,
            builtins,
            stdout,
            sandbox: Sandbox::new(config.limits, None),
            config,
            stats: OpStats::new(),
            depth: 0,
            cancel: None,
            captured: None,
            verified: HashSet::new(),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Builtins dictionary resolved by `LOAD_GLOBAL`/`LOAD_NAME` (borrowed).
    pub fn builtins(&self) -> Value {
        self.builtins
    }

    /// Cancellation token checked at backward branches.
    pub fn cancel_token(&mut self) -> CancelToken {
        self.cancel.get_or_insert_with(CancelToken::new).clone()
    }

    /// Redirect the default print sink into an in-memory buffer.
    pub fn capture_output(&mut self) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        if let Obj::File(file) = self.heap.get_mut(self.stdout) {
            file.sink = FileSink::Buffer(Rc::clone(&buffer));
        }
        self.captured = Some(buffer);
    }

    /// Drain captured print output.
    pub fn take_output(&mut self) -> String {
        match &self.captured {
            Some(buffer) => {
                let bytes = std::mem::take(&mut *buffer.borrow_mut());
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        }
    }

    /// Construct a function value over `code` with a fresh globals
    /// dictionary and no defaults.
    pub fn make_function(&mut self, code: RegisterCode, params: &[&str]) -> Value {
        let globals = self.heap.new_dict();
        self.make_function_with(code, params, Vec::new(), globals)
    }

    /// Construct a function value; takes ownership of `defaults` and
    /// `globals` references.
    pub fn make_function_with(
        &mut self,
        code: RegisterCode,
        params: &[&str],
        defaults: Vec<Value>,
        globals: Value,
    ) -> Value {
        let name = code.name.clone();
        self.heap.new_function(FunctionObj {
            name,
            code: Rc::new(code),
            globals,
            defaults,
            params: params.iter().map(|p| (*p).to_owned()).collect(),
        })
    }

    /// Evaluate `function` with the positional argument tuple `args`.
    /// Returns an owned result or the error that destroyed the frame stack.
    pub fn eval(&mut self, function: Value, args: Value) -> Result<Value, VmError> {
        let items: SmallVec<[Value; 8]> = match self.heap.get(args) {
            Obj::Tuple(items) => items.iter().copied().collect(),
            _ => return Err(VmError::ArgumentsNotATuple),
        };
        self.call_value(function, &items, &[])
    }

    /// Per-opcode execution counts accumulated across evaluations.
    pub fn dump_status(&self) -> OpStatusReport {
        self.stats.report()
    }

    // ------------------------------------------------------------------
    // Call routing
    // ------------------------------------------------------------------

    fn call_value(
        &mut self,
        callee: Value,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Value, VmError> {
        enum Target {
            Native,
            Engine {
                function: FunctionObj,
                receiver: Option<Value>,
            },
        }
        let target = match self.heap.get(callee) {
            Obj::Native { .. } => Target::Native,
            Obj::Function(function) => Target::Engine {
                function: function.clone(),
                receiver: None,
            },
            Obj::BoundMethod { function, receiver } => {
                let (function, receiver) = (*function, *receiver);
                match self.heap.get(function) {
                    Obj::Function(inner) => Target::Engine {
                        function: inner.clone(),
                        receiver: Some(receiver),
                    },
                    _ => {
                        return Err(HostError::type_error(
                            "bound method target is not a function",
                        )
                        .into())
                    }
                }
            }
            other => {
                return Err(HostError::type_error(format!(
                    "'{}' object is not callable",
                    crate::memory::kind_name(other)
                ))
                .into())
            }
        };
        match target {
            Target::Native => {
                if !kwargs.is_empty() {
                    return Err(HostError::type_error(
                        "native functions take no keyword arguments",
                    )
                    .into());
                }
                Ok(values::native_call(&mut self.heap, callee, args)?)
            }
            Target::Engine { function, receiver } => {
                self.run_function(&function, receiver, args, kwargs)
            }
        }
    }

    fn run_function(
        &mut self,
        function: &FunctionObj,
        receiver: Option<Value>,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Value, VmError> {
        let key = Rc::as_ptr(&function.code) as usize;
        if !self.verified.contains(&key) {
            verify::verify(&function.code)?;
            self.verified.insert(key);
        }
        if self.depth == 0 {
            self.sandbox = Sandbox::new(self.config.limits, self.cancel.clone());
        }
        self.depth += 1;
        let result = (|| {
            self.sandbox.record_call_depth(self.depth)?;
            let mut frame = RegisterFrame::build(
                &mut self.heap,
                FrameSpec {
                    code: Rc::clone(&function.code),
                    function_name: &function.name,
                    globals: function.globals,
                    builtins: self.builtins,
                    receiver,
                    args,
                    kwargs,
                    defaults: &function.defaults,
                    params: &function.params,
                },
            )?;
            let outcome = self.run_frame(&mut frame);
            frame.dispose(&mut self.heap);
            outcome
        })();
        self.depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    fn run_frame(&mut self, frame: &mut RegisterFrame) -> Result<Value, VmError> {
        loop {
            self.sandbox.observe_instruction()?;
            let at = frame.pc;
            let byte = *frame
                .code
                .instructions
                .get(at)
                .ok_or(DecodeError::Truncated { offset: at })?;
            self.stats.record(byte);
            let opcode =
                Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { byte, offset: at })?;
            match opcode {
                Opcode::BinaryAdd => self.op_binary(frame, BinaryOpKind::Add, false, true)?,
                Opcode::BinarySubtract => self.op_binary(frame, BinaryOpKind::Sub, false, true)?,
                Opcode::BinaryMultiply => self.op_binary(frame, BinaryOpKind::Mul, false, true)?,
                Opcode::BinaryDivide => self.op_binary(frame, BinaryOpKind::Div, false, true)?,
                Opcode::BinaryModulo => self.op_binary(frame, BinaryOpKind::Mod, false, true)?,
                Opcode::InplaceAdd => self.op_binary(frame, BinaryOpKind::Add, true, true)?,
                Opcode::InplaceSubtract => self.op_binary(frame, BinaryOpKind::Sub, true, true)?,
                Opcode::InplaceMultiply => self.op_binary(frame, BinaryOpKind::Mul, true, true)?,
                Opcode::InplaceDivide => self.op_binary(frame, BinaryOpKind::Div, true, true)?,
                Opcode::InplaceModulo => self.op_binary(frame, BinaryOpKind::Mod, true, true)?,
                Opcode::BinaryTrueDivide => {
                    self.op_binary(frame, BinaryOpKind::TrueDiv, false, false)?
                }
                Opcode::BinaryFloorDivide => {
                    self.op_binary(frame, BinaryOpKind::FloorDiv, false, false)?
                }
                Opcode::InplaceTrueDivide => {
                    self.op_binary(frame, BinaryOpKind::TrueDiv, true, false)?
                }
                Opcode::InplaceFloorDivide => {
                    self.op_binary(frame, BinaryOpKind::FloorDiv, true, false)?
                }
                Opcode::BinaryLshift => {
                    self.op_binary(frame, BinaryOpKind::Lshift, false, false)?
                }
                Opcode::BinaryRshift => {
                    self.op_binary(frame, BinaryOpKind::Rshift, false, false)?
                }
                Opcode::BinaryAnd => self.op_binary(frame, BinaryOpKind::BitAnd, false, false)?,
                Opcode::BinaryXor => self.op_binary(frame, BinaryOpKind::BitXor, false, false)?,
                Opcode::BinaryOr => self.op_binary(frame, BinaryOpKind::BitOr, false, false)?,
                Opcode::InplaceLshift => {
                    self.op_binary(frame, BinaryOpKind::Lshift, true, false)?
                }
                Opcode::InplaceRshift => {
                    self.op_binary(frame, BinaryOpKind::Rshift, true, false)?
                }
                Opcode::InplaceAnd => self.op_binary(frame, BinaryOpKind::BitAnd, true, false)?,
                Opcode::InplaceXor => self.op_binary(frame, BinaryOpKind::BitXor, true, false)?,
                Opcode::InplaceOr => self.op_binary(frame, BinaryOpKind::BitOr, true, false)?,
                Opcode::BinaryPower | Opcode::InplacePower => self.op_power(frame)?,
                Opcode::UnaryPositive
                | Opcode::UnaryNegative
                | Opcode::UnaryInvert
                | Opcode::UnaryConvert
                | Opcode::UnaryNot => self.op_unary(frame, opcode)?,
                Opcode::CompareOp => self.op_compare(frame)?,
                Opcode::LoadFast | Opcode::StoreFast => self.op_copy_register(frame)?,
                Opcode::LoadLocals => self.op_load_locals(frame)?,
                Opcode::LoadGlobal => self.op_load_global(frame)?,
                Opcode::LoadName => self.op_load_name(frame)?,
                Opcode::LoadAttr => self.op_load_attr(frame)?,
                Opcode::StoreName => self.op_store_name(frame)?,
                Opcode::StoreAttr => self.op_store_attr(frame)?,
                Opcode::StoreSubscr => self.op_store_subscr(frame)?,
                Opcode::BinarySubscr => self.op_binary_subscr(frame)?,
                Opcode::IncRef => {
                    let op = fetch_reg(frame)?;
                    let value = frame.get(op.reg_1)?;
                    self.heap.retain(value);
                }
                Opcode::DecRef => {
                    let op = fetch_reg(frame)?;
                    let value = frame.get(op.reg_1)?;
                    self.heap.release(value);
                }
                Opcode::JumpAbsolute => self.op_jump_absolute(frame)?,
                Opcode::JumpIfFalseOrPop | Opcode::PopJumpIfFalse => {
                    self.op_cond_jump(frame, false)?
                }
                Opcode::JumpIfTrueOrPop | Opcode::PopJumpIfTrue => {
                    self.op_cond_jump(frame, true)?
                }
                Opcode::ForIter => self.op_for_iter(frame)?,
                Opcode::GetIter => self.op_get_iter(frame)?,
                Opcode::ReturnValue => {
                    let op = fetch_reg(frame)?;
                    let result = frame.get(op.reg_1)?;
                    self.heap.retain(result);
                    return Ok(result);
                }
                Opcode::CallFunction
                | Opcode::CallFunctionVar
                | Opcode::CallFunctionKw
                | Opcode::CallFunctionVarKw => self.op_call(frame)?,
                Opcode::BuildTuple => self.op_build(frame, true)?,
                Opcode::BuildList => self.op_build(frame, false)?,
                Opcode::ListAppend => self.op_list_append(frame)?,
                Opcode::Slice => self.op_slice(frame)?,
                Opcode::PrintItem => self.op_print_item(frame, false)?,
                Opcode::PrintItemTo => self.op_print_item(frame, true)?,
                Opcode::PrintNewline => self.op_print_newline(frame, false)?,
                Opcode::PrintNewlineTo => self.op_print_newline(frame, true)?,
                _ => return Err(VmError::UnsupportedOpcode(opcode)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic and comparison
    // ------------------------------------------------------------------

    #[inline(always)]
    fn op_binary(
        &mut self,
        frame: &mut RegisterFrame,
        kind: BinaryOpKind,
        inplace: bool,
        fast: bool,
    ) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let a = frame.get(op.reg_1)?;
        let b = frame.get(op.reg_2)?;
        let fast_result = if fast {
            specialize::int_binary(&mut self.heap, kind, a, b)
        } else {
            None
        };
        let result = match fast_result {
            Some(value) => value,
            None if inplace => values::inplace_binary(&mut self.heap, kind, a, b)?,
            None => values::binary(&mut self.heap, kind, a, b)?,
        };
        frame.set_owned(&mut self.heap, op.reg_3, result)
    }

    #[inline(always)]
    fn op_power(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let a = frame.get(op.reg_1)?;
        let b = frame.get(op.reg_2)?;
        let none = self.heap.none();
        let result = values::power(&mut self.heap, a, b, none)?;
        frame.set_owned(&mut self.heap, op.reg_3, result)
    }

    #[inline(always)]
    fn op_unary(&mut self, frame: &mut RegisterFrame, opcode: Opcode) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let operand = frame.get(op.reg_1)?;
        let result = match opcode {
            Opcode::UnaryPositive => values::positive(&mut self.heap, operand)?,
            Opcode::UnaryNegative => values::negate(&mut self.heap, operand)?,
            Opcode::UnaryInvert => values::invert(&mut self.heap, operand)?,
            Opcode::UnaryConvert => values::repr_value(&mut self.heap, operand)?,
            Opcode::UnaryNot => {
                let truth = values::is_truthy(&self.heap, operand);
                let out = self.heap.bool_value(!truth);
                self.heap.retain(out);
                out
            }
            _ => return Err(VmError::UnsupportedOpcode(opcode)),
        };
        frame.set_owned(&mut self.heap, op.reg_2, result)
    }

    #[inline(always)]
    fn op_compare(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        const IS: u16 = 8;
        const IS_NOT: u16 = 9;
        let op = fetch_reg(frame)?;
        let a = frame.get(op.reg_1)?;
        let b = frame.get(op.reg_2)?;
        let result = match op.arg {
            IS | IS_NOT => {
                let same = a == b;
                let out = self.heap.bool_value(if op.arg == IS { same } else { !same });
                self.heap.retain(out);
                out
            }
            _ => {
                let kind = compare_kind(op.arg).ok_or(VmError::InvalidCompareOp(op.arg))?;
                let fast = specialize::int_compare(&self.heap, kind, a, b)
                    .or_else(|| specialize::float_compare(&self.heap, kind, a, b));
                match fast {
                    Some(borrowed) => {
                        // Fast paths hand back borrowed singletons; own them
                        // before the register write.
                        self.heap.retain(borrowed);
                        borrowed
                    }
                    None => values::rich_compare(&mut self.heap, kind, a, b)?,
                }
            }
        };
        frame.set_owned(&mut self.heap, op.reg_3, result)
    }

    // ------------------------------------------------------------------
    // Loads and stores
    // ------------------------------------------------------------------

    /// `LOAD_FAST`/`STORE_FAST`: register-to-register copy with retain.
    #[inline(always)]
    fn op_copy_register(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let value = frame.get(op.reg_1)?;
        self.heap.retain(value);
        frame.set_owned(&mut self.heap, op.reg_2, value)
    }

    #[inline(always)]
    fn op_load_locals(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let locals = frame.ensure_locals(&mut self.heap);
        self.heap.retain(locals);
        frame.set_owned(&mut self.heap, op.reg_1, locals)
    }

    fn name_at(&self, frame: &RegisterFrame, index: u16) -> Result<String, VmError> {
        frame
            .code
            .names
            .get(index as usize)
            .cloned()
            .ok_or(VmError::NameOutOfRange { index })
    }

    #[inline(always)]
    fn op_load_global(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let name = self.name_at(frame, op.arg)?;
        let found = self
            .heap
            .dict_get_str(frame.globals, &name)
            .or_else(|| self.heap.dict_get_str(frame.builtins, &name));
        match found {
            Some(value) => {
                self.heap.retain(value);
                frame.set_owned(&mut self.heap, op.reg_1, value)
            }
            None => Err(VmError::NameNotDefined { name }),
        }
    }

    #[inline(always)]
    fn op_load_name(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let name = self.name_at(frame, op.arg)?;
        let found = frame
            .locals()
            .and_then(|locals| self.heap.dict_get_str(locals, &name))
            .or_else(|| self.heap.dict_get_str(frame.globals, &name))
            .or_else(|| self.heap.dict_get_str(frame.builtins, &name));
        match found {
            Some(value) => {
                self.heap.retain(value);
                frame.set_owned(&mut self.heap, op.reg_1, value)
            }
            None => Err(VmError::NameNotDefined { name }),
        }
    }

    #[inline(always)]
    fn op_load_attr(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let name = self.name_at(frame, op.arg)?;
        let object = frame.get(op.reg_1)?;
        let value = values::get_attr(&mut self.heap, object, &name)?;
        frame.set_owned(&mut self.heap, op.reg_2, value)
    }

    #[inline(always)]
    fn op_store_name(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let name = self.name_at(frame, op.arg)?;
        let value = frame.get(op.reg_1)?;
        let locals = frame.ensure_locals(&mut self.heap);
        self.heap.retain(value);
        self.heap.dict_set_str(locals, &name, value);
        Ok(())
    }

    /// `STORE_ATTR`: target object in `reg_1`, value in `reg_2`, attribute
    /// name from the name table.
    #[inline(always)]
    fn op_store_attr(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let name = self.name_at(frame, op.arg)?;
        let target = frame.get(op.reg_1)?;
        let value = frame.get(op.reg_2)?;
        Ok(values::set_attr(&mut self.heap, target, &name, value)?)
    }

    /// `STORE_SUBSCR`: key in `reg_1`, container in `reg_2`, value in
    /// `reg_3`.
    #[inline(always)]
    fn op_store_subscr(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let key = frame.get(op.reg_1)?;
        let container = frame.get(op.reg_2)?;
        let value = frame.get(op.reg_3)?;
        Ok(values::set_item(&mut self.heap, container, key, value)?)
    }

    /// `BINARY_SUBSCR`: container in `reg_1`, key in `reg_2`, result to
    /// `reg_3`.
    #[inline(always)]
    fn op_binary_subscr(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let container = frame.get(op.reg_1)?;
        let key = frame.get(op.reg_2)?;
        let result = match specialize::list_subscript(&mut self.heap, container, key) {
            Some(value) => value,
            None => values::get_item(&mut self.heap, container, key)?,
        };
        frame.set_owned(&mut self.heap, op.reg_3, result)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn take_branch(&mut self, frame: &mut RegisterFrame, label: u32) -> Result<(), VmError> {
        let target = label as usize;
        if target <= frame.pc {
            self.sandbox.check_cancelled()?;
        }
        frame.pc = target;
        Ok(())
    }

    #[inline(always)]
    fn op_jump_absolute(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_branch(frame)?;
        self.take_branch(frame, op.label)
    }

    #[inline(always)]
    fn op_cond_jump(
        &mut self,
        frame: &mut RegisterFrame,
        jump_if_true: bool,
    ) -> Result<(), VmError> {
        let op = fetch_branch(frame)?;
        let value = frame.get(op.reg_1)?;
        // Identity shortcut: the canonical singletons skip the truthiness
        // protocol entirely.
        let truth = if value == self.heap.true_value() {
            true
        } else if value == self.heap.false_value() {
            false
        } else {
            values::is_truthy(&self.heap, value)
        };
        if truth == jump_if_true {
            self.take_branch(frame, op.label)
        } else {
            frame.pc += BranchOp::SIZE;
            Ok(())
        }
    }

    #[inline(always)]
    fn op_for_iter(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_branch(frame)?;
        let iterator = frame.get(op.reg_1)?;
        match values::iter_next(&mut self.heap, iterator)? {
            Some(item) => {
                frame.set_owned(&mut self.heap, op.reg_2, item)?;
                frame.pc += BranchOp::SIZE;
                Ok(())
            }
            None => self.take_branch(frame, op.label),
        }
    }

    #[inline(always)]
    fn op_get_iter(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let value = frame.get(op.reg_1)?;
        let iterator = values::get_iter(&mut self.heap, value)?;
        frame.set_owned(&mut self.heap, op.reg_2, iterator)
    }

    // ------------------------------------------------------------------
    // Calls and container builds
    // ------------------------------------------------------------------

    fn op_call(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_var(frame)?;
        let na = (op.arg & 0xff) as usize;
        let nk = ((op.arg >> 8) & 0xff) as usize;
        let operands = na + 2 * nk;
        if op.regs.len() != operands + 2 {
            return Err(VmError::MalformedOperands {
                opcode: op.opcode,
                expected: operands + 2,
                found: op.regs.len(),
            });
        }
        let callee = frame.get(op.regs[operands])?;
        let dst = op.regs[operands + 1];

        // Assemble positionals into the frame's reusable argument tuple.
        let arg_tuple = frame.call_args_tuple(&mut self.heap, na);
        for index in 0..na {
            let value = frame.get(op.regs[index])?;
            self.heap.retain(value);
            self.heap.tuple_set(arg_tuple, index, value);
        }
        let mut kwargs: Vec<(String, Value)> = Vec::with_capacity(nk);
        for pair in 0..nk {
            let key = frame.get(op.regs[na + 2 * pair])?;
            let value = frame.get(op.regs[na + 2 * pair + 1])?;
            let name = match self.heap.get(key) {
                Obj::Str(s) => s.clone(),
                _ => return Err(HostError::type_error("keywords must be strings").into()),
            };
            kwargs.push((name, value));
        }
        let args: SmallVec<[Value; 8]> = (0..na)
            .filter_map(|index| self.heap.tuple_get(arg_tuple, index))
            .collect();
        let result = self.call_value(callee, &args, &kwargs)?;
        frame.set_owned(&mut self.heap, dst, result)
    }

    fn op_build(&mut self, frame: &mut RegisterFrame, tuple: bool) -> Result<(), VmError> {
        let op = fetch_var(frame)?;
        let count = op.arg as usize;
        if op.regs.len() != count + 1 {
            return Err(VmError::MalformedOperands {
                opcode: op.opcode,
                expected: count + 1,
                found: op.regs.len(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for index in 0..count {
            let value = frame.get(op.regs[index])?;
            self.heap.retain(value);
            items.push(value);
        }
        let container = if tuple {
            self.heap.new_tuple(items)
        } else {
            self.heap.new_list(items)
        };
        frame.set_owned(&mut self.heap, op.regs[count], container)
    }

    #[inline(always)]
    fn op_list_append(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let list = frame.get(op.reg_1)?;
        let value = frame.get(op.reg_2)?;
        Ok(values::list_append(&mut self.heap, list, value)?)
    }

    /// `SLICE`: container, lo-or-sentinel, hi-or-sentinel, destination.
    #[inline(always)]
    fn op_slice(&mut self, frame: &mut RegisterFrame) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let container = frame.get(op.reg_1)?;
        let lo = if op.reg_2.is_bad() {
            None
        } else {
            Some(frame.get(op.reg_2)?)
        };
        let hi = if op.reg_3.is_bad() {
            None
        } else {
            Some(frame.get(op.reg_3)?)
        };
        let result = values::get_slice(&mut self.heap, container, lo, hi)?;
        frame.set_owned(&mut self.heap, op.reg_4, result)
    }

    // ------------------------------------------------------------------
    // Print
    // ------------------------------------------------------------------

    #[inline(always)]
    fn op_print_item(&mut self, frame: &mut RegisterFrame, to_file: bool) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let value = frame.get(op.reg_1)?;
        let file = if to_file {
            frame.get(op.reg_2)?
        } else {
            self.stdout
        };
        Ok(values::print_item(&mut self.heap, file, value)?)
    }

    #[inline(always)]
    fn op_print_newline(
        &mut self,
        frame: &mut RegisterFrame,
        to_file: bool,
    ) -> Result<(), VmError> {
        let op = fetch_reg(frame)?;
        let file = if to_file {
            frame.get(op.reg_1)?
        } else {
            self.stdout
        };
        Ok(values::print_newline(&mut self.heap, file)?)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_kind(arg: u16) -> Option<CompareKind> {
    Some(match arg {
        0 => CompareKind::Lt,
        1 => CompareKind::Le,
        2 => CompareKind::Eq,
        3 => CompareKind::Ne,
        4 => CompareKind::Gt,
        5 => CompareKind::Ge,
        _ => return None,
    })
}

fn fetch_reg(frame: &mut RegisterFrame) -> Result<RegOp, VmError> {
    let op = RegOp::decode(&frame.code.instructions, frame.pc)?;
    frame.pc += RegOp::SIZE;
    Ok(op)
}

fn fetch_var(frame: &mut RegisterFrame) -> Result<VarRegOp, VmError> {
    let op = VarRegOp::decode(&frame.code.instructions, frame.pc)?;
    frame.pc += op.size();
    Ok(op)
}

/// Branch decoding leaves `pc` untouched; the handler either rewrites it or
/// advances past the instruction.
fn fetch_branch(frame: &mut RegisterFrame) -> Result<BranchOp, VmError> {
    Ok(BranchOp::decode(&frame.code.instructions, frame.pc)?)
}
