use tern_engine::bytecode::{CodeBuilder, Literal, Opcode, Register, RegisterCode};
use tern_engine::interpreter::{EngineConfig, Evaluator, VmError};
use tern_engine::memory::Value;
use tern_engine::sandbox::SandboxLimits;
use tern_engine::values::{repr_string, ErrorKind};

fn int_args(evaluator: &mut Evaluator, values: &[i64]) -> Value {
    let items: Vec<Value> = values
        .iter()
        .map(|&v| evaluator.heap_mut().new_int(v))
        .collect();
    evaluator.heap_mut().new_tuple(items)
}

fn live(evaluator: &Evaluator) -> usize {
    evaluator.heap().metrics().live
}

/// `f(a, b): return a + b`
fn add_code() -> RegisterCode {
    let mut b = CodeBuilder::new("add", vec![], vec![], 2);
    let lhs = b.arg_reg(0);
    let rhs = b.arg_reg(1);
    let out = b.temp();
    b.reg_op(Opcode::BinaryAdd, 0, &[lhs, rhs, out]);
    b.reg_op(Opcode::ReturnValue, 0, &[out]);
    b.finish().expect("assemble")
}

/// `f(n): s = 0; for i in range(n): s += i; return s`
fn sum_loop_code() -> RegisterCode {
    let mut b = CodeBuilder::new(
        "sum_loop",
        vec![Literal::Int(0)],
        vec!["range".to_owned()],
        1,
    );
    let zero = b.const_reg(0);
    let n = b.arg_reg(0);
    let s = b.temp();
    let range_fn = b.temp();
    let seq = b.temp();
    let it = b.temp();
    let i = b.temp();
    b.reg_op(Opcode::LoadFast, 0, &[zero, s]);
    b.reg_op(Opcode::LoadGlobal, 0, &[range_fn]);
    b.call(&[n], &[], range_fn, seq).expect("call site");
    b.reg_op(Opcode::GetIter, 0, &[seq, it]);
    let head = b.new_label();
    let done = b.new_label();
    b.bind(head);
    b.branch(Opcode::ForIter, it, i, done);
    b.reg_op(Opcode::InplaceAdd, 0, &[s, i, s]);
    b.branch(Opcode::JumpAbsolute, Register::BAD, Register::BAD, head);
    b.bind(done);
    b.reg_op(Opcode::ReturnValue, 0, &[s]);
    b.finish().expect("assemble")
}

fn eval_int(evaluator: &mut Evaluator, function: Value, args: &[i64]) -> i64 {
    let args = int_args(evaluator, args);
    let result = evaluator.eval(function, args).expect("evaluation");
    let out = evaluator.heap().int_value(result).expect("integer result");
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
    out
}

#[test]
fn frames_release_every_register_exactly_once() {
    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(sum_loop_code(), &["n"]);
    let args = int_args(&mut evaluator, &[10]);
    let before = live(&evaluator);

    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(evaluator.heap().int_value(result), Some(45));
    // The engine's refcount delta on the returned value is exactly +1.
    assert_eq!(evaluator.heap().refcount(result), 1);
    evaluator.heap_mut().release(result);

    assert_eq!(live(&evaluator), before);
}

#[test]
fn store_then_load_round_trips_the_same_handle() {
    let mut b = CodeBuilder::new("copy", vec![], vec![], 1);
    let v = b.arg_reg(0);
    let t = b.temp();
    let u = b.temp();
    b.reg_op(Opcode::StoreFast, 0, &[v, t]);
    b.reg_op(Opcode::LoadFast, 0, &[t, u]);
    b.reg_op(Opcode::ReturnValue, 0, &[u]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &["v"]);
    let payload = evaluator.heap_mut().new_int(99);
    let args = evaluator.heap_mut().new_tuple(vec![payload]);
    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(result, payload);
    assert_eq!(evaluator.heap().refcount(payload), 2); // args tuple + return
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
}

#[test]
fn build_tuple_then_subscript_yields_source_element() {
    let mut b = CodeBuilder::new("pick", vec![Literal::Int(1)], vec![], 3);
    let one = b.const_reg(0);
    let elems = [b.arg_reg(0), b.arg_reg(1), b.arg_reg(2)];
    let t = b.temp();
    let out = b.temp();
    b.build_container(Opcode::BuildTuple, &elems, t);
    b.reg_op(Opcode::BinarySubscr, 0, &[t, one, out]);
    b.reg_op(Opcode::ReturnValue, 0, &[out]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &["a", "b", "c"]);
    assert_eq!(eval_int(&mut evaluator, function, &[7, 8, 9]), 8);
}

#[test]
fn integer_overflow_falls_back_to_widened_arithmetic() {
    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(add_code(), &["a", "b"]);
    assert_eq!(eval_int(&mut evaluator, function, &[2, 3]), 5);

    let args = int_args(&mut evaluator, &[i64::MAX, 1]);
    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(
        repr_string(evaluator.heap(), result),
        "9223372036854775808"
    );
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
}

#[test]
fn division_and_modulo_floor_toward_negative_infinity() {
    let mut b = CodeBuilder::new("divmod", vec![], vec![], 2);
    let lhs = b.arg_reg(0);
    let rhs = b.arg_reg(1);
    let q = b.temp();
    let r = b.temp();
    let pair = b.temp();
    b.reg_op(Opcode::BinaryDivide, 0, &[lhs, rhs, q]);
    b.reg_op(Opcode::BinaryModulo, 0, &[lhs, rhs, r]);
    b.build_container(Opcode::BuildTuple, &[q, r], pair);
    b.reg_op(Opcode::ReturnValue, 0, &[pair]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &["a", "b"]);
    let args = int_args(&mut evaluator, &[-7, 2]);
    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(repr_string(evaluator.heap(), result), "(-4, 1)");
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
}

#[test]
fn for_iter_over_empty_sequence_never_writes_the_item_register() {
    // `for i in (): pass` then return `i`: the loop body never ran, so the
    // item register was never written and the read is an engine fault.
    let mut b = CodeBuilder::new("empty_iter", vec![], vec![], 0);
    let seq = b.temp();
    let it = b.temp();
    let i = b.temp();
    b.build_container(Opcode::BuildTuple, &[], seq);
    b.reg_op(Opcode::GetIter, 0, &[seq, it]);
    let head = b.new_label();
    let done = b.new_label();
    b.bind(head);
    b.branch(Opcode::ForIter, it, i, done);
    b.branch(Opcode::JumpAbsolute, Register::BAD, Register::BAD, head);
    b.bind(done);
    b.reg_op(Opcode::ReturnValue, 0, &[i]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &[]);
    let args = evaluator.heap_mut().new_tuple(vec![]);
    let err = evaluator.eval(function, args).expect_err("uninitialized read");
    assert!(matches!(err, VmError::UninitializedRegister { .. }));
    assert_eq!(err.kind(), ErrorKind::System);
}

#[test]
fn conditional_jump_branches_on_the_false_singleton() {
    let mut b = CodeBuilder::new(
        "pick_branch",
        vec![Literal::Int(1), Literal::Int(2)],
        vec![],
        1,
    );
    let v = b.arg_reg(0);
    let taken = b.new_label();
    b.branch(Opcode::PopJumpIfFalse, v, Register::BAD, taken);
    let when_true = b.const_reg(0);
    b.reg_op(Opcode::ReturnValue, 0, &[when_true]);
    b.bind(taken);
    let when_false = b.const_reg(1);
    b.reg_op(Opcode::ReturnValue, 0, &[when_false]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &["v"]);
    let falsy = evaluator.heap().false_value();
    let args = evaluator.heap_mut().new_tuple(vec![falsy]);
    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(evaluator.heap().int_value(result), Some(2));
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
}

#[test]
fn refcount_pseudo_ops_are_balanced() {
    let mut b = CodeBuilder::new("pseudo", vec![], vec![], 1);
    let v = b.arg_reg(0);
    b.reg_op(Opcode::IncRef, 0, &[v]);
    b.reg_op(Opcode::DecRef, 0, &[v]);
    b.reg_op(Opcode::ReturnValue, 0, &[v]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &["v"]);
    let args = int_args(&mut evaluator, &[5]);
    let before = live(&evaluator);
    let result = evaluator.eval(function, args).expect("evaluation");
    assert_eq!(evaluator.heap().int_value(result), Some(5));
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
    assert_eq!(live(&evaluator), before - 2); // args tuple and payload gone
}

#[test]
fn repeated_evaluation_is_deterministic() {
    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(sum_loop_code(), &["n"]);
    let first = eval_int(&mut evaluator, function, &[100]);
    let second = eval_int(&mut evaluator, function, &[100]);
    assert_eq!(first, 4950);
    assert_eq!(first, second);

    let report = evaluator.dump_status();
    assert!(report.total > 0);
    let for_iter = report
        .per_opcode
        .iter()
        .find(|entry| entry.opcode == Opcode::ForIter)
        .expect("for_iter counted");
    assert_eq!(for_iter.count, 2 * 101);
}

#[test]
fn arity_mismatches_are_type_errors() {
    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(add_code(), &["a", "b"]);

    let too_few = int_args(&mut evaluator, &[1]);
    let err = evaluator.eval(function, too_few).expect_err("missing arg");
    assert_eq!(err.kind(), ErrorKind::Type);

    let too_many = int_args(&mut evaluator, &[1, 2, 3]);
    let err = evaluator.eval(function, too_many).expect_err("extra arg");
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn defaults_cover_missing_actuals() {
    let mut evaluator = Evaluator::new();
    let seven = evaluator.heap_mut().new_int(7);
    let globals = evaluator.heap_mut().new_dict();
    let function =
        evaluator.make_function_with(add_code(), &["a", "b"], vec![seven], globals);
    assert_eq!(eval_int(&mut evaluator, function, &[3]), 10);
    assert_eq!(eval_int(&mut evaluator, function, &[3, 4]), 7);
}

#[test]
fn keyword_arguments_bind_by_parameter_name() {
    // `g(): return sub(10, b=4)` with `sub(a, b): return a - b`.
    let mut sub = CodeBuilder::new("sub", vec![], vec![], 2);
    let lhs = sub.arg_reg(0);
    let rhs = sub.arg_reg(1);
    let out = sub.temp();
    sub.reg_op(Opcode::BinarySubtract, 0, &[lhs, rhs, out]);
    sub.reg_op(Opcode::ReturnValue, 0, &[out]);
    let sub_code = sub.finish().expect("assemble");

    let mut outer = CodeBuilder::new(
        "g",
        vec![
            Literal::Int(10),
            Literal::Str("b".to_owned()),
            Literal::Int(4),
        ],
        vec!["sub".to_owned()],
        0,
    );
    let ten = outer.const_reg(0);
    let key = outer.const_reg(1);
    let four = outer.const_reg(2);
    let callee = outer.temp();
    let out = outer.temp();
    outer.reg_op(Opcode::LoadGlobal, 0, &[callee]);
    outer.call(&[ten], &[(key, four)], callee, out).expect("call site");
    outer.reg_op(Opcode::ReturnValue, 0, &[out]);
    let outer_code = outer.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let sub_fn = evaluator.make_function(sub_code, &["a", "b"]);
    let outer_fn = evaluator.make_function(outer_code, &[]);
    let globals = evaluator
        .heap()
        .function_globals(outer_fn)
        .expect("function globals");
    evaluator.heap_mut().retain(sub_fn);
    evaluator.heap_mut().dict_set_str(globals, "sub", sub_fn);

    let args = evaluator.heap_mut().new_tuple(vec![]);
    let result = evaluator.eval(outer_fn, args).expect("evaluation");
    assert_eq!(evaluator.heap().int_value(result), Some(6));
    evaluator.heap_mut().release(result);
    evaluator.heap_mut().release(args);
}

#[test]
fn unexpected_keyword_is_a_type_error() {
    let mut outer = CodeBuilder::new(
        "g",
        vec![
            Literal::Int(10),
            Literal::Str("z".to_owned()),
            Literal::Int(4),
        ],
        vec!["sub".to_owned()],
        0,
    );
    let ten = outer.const_reg(0);
    let key = outer.const_reg(1);
    let four = outer.const_reg(2);
    let callee = outer.temp();
    let out = outer.temp();
    outer.reg_op(Opcode::LoadGlobal, 0, &[callee]);
    outer.call(&[ten], &[(key, four)], callee, out).expect("call site");
    outer.reg_op(Opcode::ReturnValue, 0, &[out]);
    let outer_code = outer.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let sub_fn = evaluator.make_function(add_code(), &["a", "b"]);
    let outer_fn = evaluator.make_function(outer_code, &[]);
    let globals = evaluator
        .heap()
        .function_globals(outer_fn)
        .expect("function globals");
    evaluator.heap_mut().retain(sub_fn);
    evaluator.heap_mut().dict_set_str(globals, "sub", sub_fn);

    let args = evaluator.heap_mut().new_tuple(vec![]);
    let err = evaluator.eval(outer_fn, args).expect_err("unknown keyword");
    assert!(matches!(err, VmError::UnexpectedKeyword { .. }));
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn rejected_opcodes_are_fatal_engine_errors() {
    let mut b = CodeBuilder::new("yields", vec![Literal::Int(1)], vec![], 0);
    let c = b.const_reg(0);
    b.reg_op(Opcode::YieldValue, 0, &[c]);
    b.reg_op(Opcode::ReturnValue, 0, &[c]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(code, &[]);
    let args = evaluator.heap_mut().new_tuple(vec![]);
    let err = evaluator.eval(function, args).expect_err("rejected opcode");
    assert!(matches!(err, VmError::UnsupportedOpcode(Opcode::YieldValue)));
    assert_eq!(err.kind(), ErrorKind::System);
}

#[test]
fn non_tuple_argument_list_is_a_type_error() {
    let mut evaluator = Evaluator::new();
    let function = evaluator.make_function(add_code(), &["a", "b"]);
    let args = evaluator.heap_mut().new_int(3);
    let err = evaluator.eval(function, args).expect_err("non-tuple args");
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn cancellation_token_stops_backward_branches() {
    let mut b = CodeBuilder::new("spin", vec![], vec![], 0);
    let head = b.new_label();
    b.bind(head);
    b.branch(Opcode::JumpAbsolute, Register::BAD, Register::BAD, head);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::new();
    let token = evaluator.cancel_token();
    token.cancel();
    let function = evaluator.make_function(code, &[]);
    let args = evaluator.heap_mut().new_tuple(vec![]);
    let err = evaluator.eval(function, args).expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::System);
    assert_eq!(err.to_string(), "execution cancelled by host");
}

#[test]
fn deep_recursion_hits_the_call_depth_limit() {
    // `f(): return f()` through the function's own globals.
    let mut b = CodeBuilder::new("recurse", vec![], vec!["recurse".to_owned()], 0);
    let callee = b.temp();
    let out = b.temp();
    b.reg_op(Opcode::LoadGlobal, 0, &[callee]);
    b.call(&[], &[], callee, out).expect("call site");
    b.reg_op(Opcode::ReturnValue, 0, &[out]);
    let code = b.finish().expect("assemble");

    let mut evaluator = Evaluator::with_config(EngineConfig {
        limits: SandboxLimits {
            call_depth_limit: 32,
            ..SandboxLimits::default()
        },
    });
    let function = evaluator.make_function(code, &[]);
    let globals = evaluator
        .heap()
        .function_globals(function)
        .expect("function globals");
    evaluator.heap_mut().retain(function);
    evaluator.heap_mut().dict_set_str(globals, "recurse", function);

    let args = evaluator.heap_mut().new_tuple(vec![]);
    let err = evaluator.eval(function, args).expect_err("depth limited");
    assert_eq!(err.kind(), ErrorKind::System);
}
