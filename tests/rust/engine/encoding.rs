use tern_engine::bytecode::{
    BranchOp, CodeBuilder, DecodeError, Literal, Opcode, Prelude, RegOp, Register, Shape,
    VarRegOp, instruction_len,
};
use tern_engine::verify::{verify, VerifyError};

#[test]
fn reg_op_round_trips() {
    let op = RegOp {
        opcode: Opcode::BinaryAdd,
        arg: 513,
        reg_1: Register(1),
        reg_2: Register(2),
        reg_3: Register(3),
        reg_4: Register::BAD,
    };
    let mut buf = Vec::new();
    op.encode(&mut buf);
    assert_eq!(buf.len(), RegOp::SIZE);
    assert_eq!(RegOp::decode(&buf, 0).expect("decode"), op);
}

#[test]
fn var_reg_op_round_trips_and_reports_size() {
    let op = VarRegOp {
        opcode: Opcode::CallFunction,
        arg: 2,
        regs: [Register(4), Register(5), Register(6), Register(7)]
            .into_iter()
            .collect(),
    };
    let mut buf = Vec::new();
    op.encode(&mut buf);
    assert_eq!(buf.len(), op.size());
    let decoded = VarRegOp::decode(&buf, 0).expect("decode");
    assert_eq!(decoded, op);
    assert_eq!(instruction_len(&buf, 0).expect("length"), op.size());
}

#[test]
fn branch_op_round_trips() {
    let op = BranchOp {
        opcode: Opcode::ForIter,
        reg_1: Register(9),
        reg_2: Register(10),
        label: 0xDEAD,
    };
    let mut buf = Vec::new();
    op.encode(&mut buf);
    assert_eq!(buf.len(), BranchOp::SIZE);
    assert_eq!(BranchOp::decode(&buf, 0).expect("decode"), op);
}

#[test]
fn opcode_shapes_follow_class() {
    assert_eq!(Opcode::BinaryAdd.shape(), Shape::Reg);
    assert_eq!(Opcode::CallFunctionKw.shape(), Shape::VarReg);
    assert_eq!(Opcode::BuildList.shape(), Shape::VarReg);
    assert_eq!(Opcode::JumpAbsolute.shape(), Shape::Branch);
    assert_eq!(Opcode::ForIter.shape(), Shape::Branch);
}

#[test]
fn unknown_opcode_byte_is_a_decode_error() {
    assert_eq!(Opcode::from_byte(6), None);
    let err = instruction_len(&[6u8, 0, 0], 0).expect_err("unknown byte");
    assert_eq!(err, DecodeError::UnknownOpcode { byte: 6, offset: 0 });
}

#[test]
fn truncated_stream_is_a_decode_error() {
    let buf = [Opcode::BinaryAdd as u8, 0];
    assert!(matches!(
        RegOp::decode(&buf, 0),
        Err(DecodeError::Truncated { .. })
    ));
}

#[test]
fn builder_lays_out_constants_then_arguments() {
    let mut builder = CodeBuilder::new(
        "layout",
        vec![Literal::Int(0), Literal::Str("x".to_owned())],
        vec![],
        2,
    );
    assert_eq!(builder.const_reg(0), Register(0));
    assert_eq!(builder.const_reg(1), Register(1));
    assert_eq!(builder.arg_reg(0), Register(2));
    assert_eq!(builder.arg_reg(1), Register(3));
    assert_eq!(builder.temp(), Register(4));
    let out = builder.temp();
    builder.reg_op(Opcode::ReturnValue, 0, &[out]);
    let code = builder.finish().expect("finish");
    assert_eq!(code.num_registers, 6);
    assert_eq!(code.arg_count, 2);
    assert_eq!(code.entry_offset(), Prelude::SIZE);
    let prelude = Prelude::read(&code.instructions).expect("prelude");
    assert_eq!(prelude.num_registers, 6);
}

#[test]
fn builder_patches_forward_labels() {
    let mut builder = CodeBuilder::new("fwd", vec![Literal::Int(1)], vec![], 0);
    let target = builder.new_label();
    builder.branch(Opcode::JumpAbsolute, Register::BAD, Register::BAD, target);
    builder.bind(target);
    let ret = builder.const_reg(0);
    builder.reg_op(Opcode::ReturnValue, 0, &[ret]);
    let code = builder.finish().expect("finish");

    let jump = BranchOp::decode(&code.instructions, Prelude::SIZE).expect("decode");
    assert_eq!(jump.label as usize, Prelude::SIZE + BranchOp::SIZE);
    verify(&code).expect("patched code verifies");
}

#[test]
fn bad_prelude_magic_is_rejected() {
    let buf = vec![0u8; 8];
    assert!(matches!(
        Prelude::read(&buf),
        Err(DecodeError::BadMagic { .. })
    ));
}

#[test]
fn verify_rejects_branch_into_instruction_interior() {
    let mut builder = CodeBuilder::new("mid", vec![Literal::Int(1)], vec![], 0);
    let target = builder.new_label();
    builder.branch(Opcode::JumpAbsolute, Register::BAD, Register::BAD, target);
    builder.bind(target);
    let ret = builder.const_reg(0);
    builder.reg_op(Opcode::ReturnValue, 0, &[ret]);
    let mut code = builder.finish().expect("finish");

    // Point the branch one byte past an instruction start.
    let label_field = Prelude::SIZE + 5;
    let bogus = (Prelude::SIZE + 1) as u32;
    code.instructions[label_field..label_field + 4].copy_from_slice(&bogus.to_le_bytes());
    assert!(matches!(
        verify(&code),
        Err(VerifyError::BranchTarget { .. })
    ));
}

#[test]
fn verify_rejects_register_outside_the_file() {
    let mut builder = CodeBuilder::new("oob", vec![Literal::Int(1)], vec![], 0);
    builder.reg_op(Opcode::ReturnValue, 0, &[Register(40)]);
    let code = builder.finish().expect("finish");
    assert!(matches!(
        verify(&code),
        Err(VerifyError::RegisterOutOfRange { register: 40, .. })
    ));
}

#[test]
fn verify_rejects_name_index_outside_the_table() {
    let mut builder = CodeBuilder::new("name", vec![Literal::Int(1)], vec!["g".to_owned()], 0);
    let dst = builder.temp();
    builder.reg_op(Opcode::LoadGlobal, 7, &[dst]);
    let ret = builder.const_reg(0);
    builder.reg_op(Opcode::ReturnValue, 0, &[ret]);
    let code = builder.finish().expect("finish");
    assert!(matches!(
        verify(&code),
        Err(VerifyError::NameOutOfRange { index: 7, .. })
    ));
}

#[test]
fn register_code_serializes() {
    let mut builder = CodeBuilder::new("serde", vec![Literal::Float(2.5)], vec![], 0);
    let ret = builder.const_reg(0);
    builder.reg_op(Opcode::ReturnValue, 0, &[ret]);
    let code = builder.finish().expect("finish");
    let json = serde_json::to_string(&code).expect("serialize");
    let back: tern_engine::bytecode::RegisterCode =
        serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, code);
}
