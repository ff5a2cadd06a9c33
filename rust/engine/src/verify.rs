//! Static validation of compiled register code.
//!
//! The compiler contract promises a decodable stream, branch labels landing
//! on instruction starts, register operands inside the declared register
//! file, and name indices inside the name table.  The evaluator runs this
//! check once per code artifact before first dispatch; violations are fatal
//! engine errors, never silent mis-execution.

use std::collections::HashSet;

use thiserror::Error;

use crate::bytecode::{
    BranchOp, DecodeError, Opcode, Prelude, RegOp, Register, RegisterCode, Shape, VarRegOp,
};

/// Compiler-contract violations detected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("prelude declares {prelude} registers but the artifact declares {declared}")]
    PreludeMismatch { prelude: u32, declared: u16 },
    #[error("register file of {declared} cannot hold {required} constants and arguments")]
    RegisterFileTooSmall { required: usize, declared: u16 },
    #[error("register {register} at byte {offset} exceeds the register file of {limit}")]
    RegisterOutOfRange {
        register: u16,
        offset: usize,
        limit: u16,
    },
    #[error("name index {index} at byte {offset} exceeds the name table")]
    NameOutOfRange { index: u16, offset: usize },
    #[error("branch at byte {offset} targets {label}, which is not an instruction start")]
    BranchTarget { label: u32, offset: usize },
}

fn uses_name_table(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::LoadGlobal
            | Opcode::LoadName
            | Opcode::StoreName
            | Opcode::LoadAttr
            | Opcode::StoreAttr
    )
}

/// Validate `code` against the compiler contract.
pub fn verify(code: &RegisterCode) -> Result<(), VerifyError> {
    let prelude = Prelude::read(&code.instructions)?;
    if prelude.num_registers != u32::from(code.num_registers) {
        return Err(VerifyError::PreludeMismatch {
            prelude: prelude.num_registers,
            declared: code.num_registers,
        });
    }
    let required = code.constants.len() + code.arg_count as usize;
    if required > code.num_registers as usize {
        return Err(VerifyError::RegisterFileTooSmall {
            required,
            declared: code.num_registers,
        });
    }

    let stream = &code.instructions;
    let mut starts: HashSet<usize> = HashSet::new();
    let mut branches: Vec<(u32, usize)> = Vec::new();
    let mut at = Prelude::SIZE;

    let check_register = |register: Register, offset: usize| -> Result<(), VerifyError> {
        if !register.is_bad() && register.0 >= code.num_registers {
            return Err(VerifyError::RegisterOutOfRange {
                register: register.0,
                offset,
                limit: code.num_registers,
            });
        }
        Ok(())
    };

    while at < stream.len() {
        starts.insert(at);
        let opcode = Opcode::from_byte(stream[at]).ok_or(DecodeError::UnknownOpcode {
            byte: stream[at],
            offset: at,
        })?;
        let len = match opcode.shape() {
            Shape::Reg => {
                let op = RegOp::decode(stream, at)?;
                for register in [op.reg_1, op.reg_2, op.reg_3, op.reg_4] {
                    check_register(register, at)?;
                }
                if uses_name_table(opcode) && op.arg as usize >= code.names.len() {
                    return Err(VerifyError::NameOutOfRange {
                        index: op.arg,
                        offset: at,
                    });
                }
                RegOp::SIZE
            }
            Shape::VarReg => {
                let op = VarRegOp::decode(stream, at)?;
                for &register in &op.regs {
                    check_register(register, at)?;
                }
                op.size()
            }
            Shape::Branch => {
                let op = BranchOp::decode(stream, at)?;
                check_register(op.reg_1, at)?;
                check_register(op.reg_2, at)?;
                branches.push((op.label, at));
                BranchOp::SIZE
            }
        };
        at += len;
    }

    for (label, offset) in branches {
        if !starts.contains(&(label as usize)) {
            return Err(VerifyError::BranchTarget { label, offset });
        }
    }
    Ok(())
}
