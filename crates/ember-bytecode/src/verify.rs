//! Static verification of a decoded chunk before it is handed to the
//! interpreter or the JIT.
//!
//! This is a lightweight pass, not a full type checker: it only rejects
//! instruction streams that would make the interpreter's unsafe register
//! indexing or jump arithmetic undefined behavior. A chunk that passes
//! verification can still raise ordinary runtime `VmError`s (type errors,
//! divide by zero, and so on) — those are not bytecode corruption.

use crate::module::Chunk;
use crate::opcode::{InstrFormat, Opcode};
use thiserror::Error;

/// A reason a chunk failed verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// An instruction word didn't decode to a known opcode.
    #[error("instruction {0} has an unrecognized opcode byte {1:#04x}")]
    UnknownOpcode(u32, u8),
    /// A register operand referenced a slot outside the chunk's frame.
    #[error("instruction {0} references register {1}, but the frame only has {2} registers")]
    RegisterOutOfRange(u32, u8, u8),
    /// A jump's target address fell outside the instruction stream.
    #[error("instruction {0} jumps to out-of-range address {1}")]
    JumpOutOfRange(u32, i64),
    /// `LoopJump` targeted an instruction that was never marked as a loop header.
    #[error("instruction {0} is a LOOP_JUMP but its target {1} is not a registered loop header")]
    LoopJumpMissingHeader(u32, u32),
    /// A `Call`-family opcode was the final instruction, with no room for
    /// its mandatory extension word.
    #[error("instruction {0} requires an extension word but is the last instruction in the chunk")]
    MissingExtensionWord(u32),
}

/// Verify that every instruction in `chunk` decodes to a known opcode, every
/// register operand is in range for the chunk's declared register count,
/// and every jump lands inside the instruction stream.
pub fn verify_chunk(chunk: &Chunk) -> Result<(), VerifyError> {
    let instrs = chunk.instructions();
    let len = instrs.len() as i64;
    let regs = chunk.register_count();

    let mut loop_headers = std::collections::HashSet::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode() == Some(Opcode::LoopHeader) {
            loop_headers.insert(i as u32);
        }
    }

    for (i, instr) in instrs.iter().enumerate() {
        let i = i as u32;
        let op = instr
            .opcode()
            .ok_or_else(|| VerifyError::UnknownOpcode(i, instr.opcode_byte()))?;

        check_register(i, instr.a(), regs)?;
        match op.format() {
            InstrFormat::ABC => {
                check_register(i, instr.b(), regs)?;
                check_register(i, instr.c(), regs)?;
            }
            InstrFormat::ABx => {}
            InstrFormat::AsBx => {
                if op.is_jump() {
                    let target = i as i64 + 1 + instr.sbx() as i64;
                    if target < 0 || target > len {
                        return Err(VerifyError::JumpOutOfRange(i, target));
                    }
                    if op == Opcode::LoopJump && !loop_headers.contains(&(target as u32)) {
                        return Err(VerifyError::LoopJumpMissingHeader(i, target as u32));
                    }
                }
            }
        }

        if op.has_extension() && i as i64 + 1 >= len {
            return Err(VerifyError::MissingExtensionWord(i));
        }
    }

    Ok(())
}

fn check_register(instr_index: u32, reg: u8, regs: u8) -> Result<(), VerifyError> {
    if reg >= regs {
        return Err(VerifyError::RegisterOutOfRange(instr_index, reg, regs));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Instr;

    fn chunk_with(regs: u8, instrs: Vec<Instr>) -> Chunk {
        let mut chunk = Chunk::new("t");
        chunk.set_register_count(regs);
        for instr in instrs {
            chunk.emit(instr, 1);
        }
        chunk
    }

    #[test]
    fn accepts_well_formed_chunk() {
        let chunk = chunk_with(
            2,
            vec![
                Instr::abc(Opcode::Add, 0, 1, 0),
                Instr::asbx(Opcode::Jump, 0, 0),
            ],
        );
        assert!(verify_chunk(&chunk).is_ok());
    }

    #[test]
    fn rejects_out_of_range_register() {
        let chunk = chunk_with(1, vec![Instr::abc(Opcode::Add, 0, 5, 0)]);
        assert!(matches!(
            verify_chunk(&chunk),
            Err(VerifyError::RegisterOutOfRange(0, 5, 1))
        ));
    }

    #[test]
    fn rejects_jump_past_end() {
        let chunk = chunk_with(1, vec![Instr::asbx(Opcode::Jump, 0, 50)]);
        assert!(matches!(verify_chunk(&chunk), Err(VerifyError::JumpOutOfRange(0, _))));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut chunk = Chunk::new("t");
        chunk.set_register_count(1);
        chunk.emit(Instr::from_raw(0xFF_00_00_00), 1);
        assert!(matches!(verify_chunk(&chunk), Err(VerifyError::UnknownOpcode(0, 0xFF))));
    }

    #[test]
    fn loop_jump_requires_registered_header() {
        let chunk = chunk_with(1, vec![Instr::asbx(Opcode::LoopJump, 0, -1)]);
        assert!(matches!(
            verify_chunk(&chunk),
            Err(VerifyError::LoopJumpMissingHeader(0, 0))
        ));
    }

    #[test]
    fn call_without_trailing_extension_word_rejected() {
        let chunk = chunk_with(1, vec![Instr::abc(Opcode::Call, 0, 0, 0)]);
        assert!(matches!(
            verify_chunk(&chunk),
            Err(VerifyError::MissingExtensionWord(0))
        ));
    }
}
