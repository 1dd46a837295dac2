//! The template compiler: one `ember_bytecode::Chunk` in, one machine-code
//! buffer out. Opcode-at-a-time, no cross-instruction scheduling or
//! register allocation beyond the fixed assignment below — exactly the
//! "Code model" §4.5 asks for.
//!
//! # Register assignment
//!
//! - `rbx` (callee-saved): base of the current frame's register window —
//!   `[rbx + 8*r]` is register `r`'s `Value`, raw bits. Obtained once, at
//!   entry, from [`ember_core::vm::jit::ember_core_jit_register_window`].
//! - `r12` (callee-saved): the live `*mut Vm`, passed to every helper call.
//! - `r13` (callee-saved): `out_value` — where the chunk's return value's
//!   raw bits land on normal completion.
//! - `rax`/`rcx`/`rdx`/`rsi`/`rdi`/`r8`: scratch, clobbered freely between
//!   instructions (no register's contents need to survive one bytecode
//!   instruction to the next — each instruction fully reads its operands
//!   from and writes its result back to the register window).
//!
//! Every opcode this tier supports (`Opcode::is_jit_tier1`) is non-allocating,
//! so no helper call here ever triggers a GC and no register spilling is
//! needed beyond what the window already provides (see `vm::jit`'s module
//! doc in `ember-core` for why that's sound).

use crate::x64::{Asm, Reg, RelocTarget};
use ember_bytecode::{Chunk, Instr, Opcode};
use ember_core::value::Value;
use ember_core::vm::jit::{JitBinOp, JitUnOp};

const REG_WINDOW: Reg = Reg::Rbx;
const VM_PTR_SAVED: Reg = Reg::R12;
const OUT_VALUE: Reg = Reg::R13;
const SCRATCH: Reg = Reg::Rax;

/// Failure reason for a whole-chunk compile attempt. Every variant names
/// the specific opcode or shape that tier 1 doesn't cover; `ember-core`
/// only needs the `Display` text for its own diagnostics, but keeping this
/// as an enum documents the tier's actual boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("instruction {index} ({op:?}) is not supported by the tier-1 JIT")]
    UnsupportedOpcode { index: usize, op: Opcode },
    #[error("chunk has no instructions")]
    EmptyChunk,
    #[error("malformed chunk: {0}")]
    Malformed(String),
}

/// Compile `chunk` in its entirety into a standalone machine-code buffer
/// implementing `ember_core::vm::jit::JitEntryFn`'s signature. Returns the
/// bytes to hand to [`crate::memory::ExecutableMemory::new`].
///
/// Every instruction in `chunk` must satisfy `Opcode::is_jit_tier1`; a
/// single unsupported opcode anywhere in the chunk fails the whole compile
/// rather than partially translating it.
pub fn compile_chunk(chunk: &Chunk) -> Result<Vec<u8>, CompileError> {
    let instrs = chunk.instructions();
    if instrs.is_empty() {
        return Err(CompileError::EmptyChunk);
    }
    // Walk respecting each opcode's width so `Return`'s trailing extension
    // word — raw bits with no opcode meaning of its own — is never
    // mistaken for an instruction in its own right (its high byte can
    // alias any opcode, tier-1 or not, depending on the result count).
    let mut i = 0usize;
    while i < instrs.len() {
        let instr = instrs[i];
        let op = instr
            .opcode()
            .ok_or_else(|| CompileError::Malformed(format!("bad opcode byte at {i}")))?;
        if !op.is_jit_tier1() {
            return Err(CompileError::UnsupportedOpcode { index: i, op });
        }
        i += if op == Opcode::Return {
            if i + 1 >= instrs.len() {
                return Err(CompileError::Malformed(format!("Return at {i} missing its extension word")));
            }
            2
        } else {
            1
        };
    }

    let mut asm = Asm::new();
    emit_prologue(&mut asm);

    let mut offsets: Vec<Option<usize>> = vec![None; instrs.len()];
    let mut i = 0usize;
    while i < instrs.len() {
        offsets[i] = Some(asm.offset());
        let instr = instrs[i];
        let op = instr.opcode().expect("checked above");
        let consumed = emit_instr(&mut asm, instrs, op, instr, i)?;
        i += consumed;
    }

    let error_exit = asm.offset();
    emit_epilogue(&mut asm, 1);
    let success_exit = asm.offset();
    emit_epilogue(&mut asm, 0);

    asm.patch_all(&offsets, error_exit, success_exit)
        .map_err(CompileError::Malformed)?;
    Ok(asm.buf)
}

/// `push rbx; push r12; push r13; mov r12, rdi; mov r13, rsi;` then call
/// the register-window helper and stash the result in `rbx`, bailing to
/// the (not-yet-emitted, relocated) error exit if it's null.
fn emit_prologue(asm: &mut Asm) {
    asm.push(REG_WINDOW);
    asm.push(VM_PTR_SAVED);
    asm.push(OUT_VALUE);
    asm.mov_reg_reg(VM_PTR_SAVED, Reg::Rdi);
    asm.mov_reg_reg(OUT_VALUE, Reg::Rsi);

    asm.mov_reg_reg(Reg::Rdi, VM_PTR_SAVED);
    asm.mov_reg_imm64(SCRATCH, ember_core::vm::jit::ember_core_jit_register_window as usize as u64);
    asm.call_rax();
    asm.mov_reg_reg(REG_WINDOW, SCRATCH);
    asm.test_reg64(SCRATCH);
    asm.jz(RelocTarget::ErrorExit);
}

/// `mov eax, <status>; pop r13; pop r12; pop rbx; ret`.
fn emit_epilogue(asm: &mut Asm, status: u32) {
    asm.mov_reg32_imm32(Reg::Rax, status);
    asm.pop(OUT_VALUE);
    asm.pop(VM_PTR_SAVED);
    asm.pop(REG_WINDOW);
    asm.ret();
}

/// Emit one bytecode instruction's native code. `instrs` is the whole
/// stream, needed only so `Return` can read its trailing extension word.
/// Returns how many bytecode instruction slots were consumed: 2 for
/// `Return` (opcode word + extension word), 1 for everything else in this
/// tier.
fn emit_instr(asm: &mut Asm, instrs: &[Instr], op: Opcode, instr: Instr, index: usize) -> Result<usize, CompileError> {
    match op {
        Opcode::Nop | Opcode::LoopHeader => Ok(1),

        Opcode::Move => {
            let (a, b) = (instr.a(), instr.b());
            asm.mov_load(SCRATCH, REG_WINDOW, 8 * b as i32);
            asm.mov_store(REG_WINDOW, 8 * a as i32, SCRATCH);
            Ok(1)
        }

        Opcode::LoadImmSmall => {
            emit_const_to_register(asm, instr.a(), Value::int(instr.sbx() as i32).raw_bits());
            Ok(1)
        }
        Opcode::LoadNil => {
            emit_const_to_register(asm, instr.a(), Value::nil().raw_bits());
            Ok(1)
        }
        Opcode::LoadTrue => {
            emit_const_to_register(asm, instr.a(), Value::bool(true).raw_bits());
            Ok(1)
        }
        Opcode::LoadFalse => {
            emit_const_to_register(asm, instr.a(), Value::bool(false).raw_bits());
            Ok(1)
        }

        Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Lt | Opcode::Le
        | Opcode::Gt | Opcode::Ge | Opcode::Eq | Opcode::Ne => {
            let tag = bin_op_tag(op);
            emit_call_args4(
                asm,
                tag.to_u8() as u32,
                instr.a() as u32,
                instr.b() as u32,
                instr.c() as u32,
            );
            asm.mov_reg_imm64(SCRATCH, ember_core::vm::jit::ember_core_jit_binary_op as usize as u64);
            asm.call_rax();
            asm.test_reg32(Reg::Rax);
            asm.jnz(RelocTarget::ErrorExit);
            Ok(1)
        }

        Opcode::Neg | Opcode::Not => {
            let tag = if op == Opcode::Neg { JitUnOp::Neg } else { JitUnOp::Not };
            emit_call_args3(asm, tag.to_u8() as u32, instr.a() as u32, instr.b() as u32);
            asm.mov_reg_imm64(SCRATCH, ember_core::vm::jit::ember_core_jit_unary_op as usize as u64);
            asm.call_rax();
            asm.test_reg32(Reg::Rax);
            asm.jnz(RelocTarget::ErrorExit);
            Ok(1)
        }

        Opcode::Jump | Opcode::LoopJump => {
            // `LoopJump`'s hot-counter bump only feeds the interpreter's
            // own promotion decision, already made by the time this code
            // runs, so compiled code treats it as a plain backward jump.
            let target = jump_target(index, instr.sbx())?;
            asm.jmp(RelocTarget::BytecodeIndex(target));
            Ok(1)
        }
        Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
            let target = jump_target(index, instr.sbx())?;
            emit_call_args1(asm, instr.a() as u32);
            asm.mov_reg_imm64(SCRATCH, ember_core::vm::jit::ember_core_jit_is_truthy as usize as u64);
            asm.call_rax();
            asm.cmp_reg32_imm32(Reg::Rax, -1);
            asm.je(RelocTarget::ErrorExit);
            asm.test_reg32(Reg::Rax);
            if op == Opcode::JumpIfFalse {
                asm.jz(RelocTarget::BytecodeIndex(target));
            } else {
                asm.jnz(RelocTarget::BytecodeIndex(target));
            }
            Ok(1)
        }

        Opcode::Return => {
            let ext = instrs.get(index + 1).ok_or_else(|| {
                CompileError::Malformed(format!("Return at {index} missing its extension word"))
            })?;
            let resultc = ext.raw();
            if resultc > 0 {
                asm.mov_load(SCRATCH, REG_WINDOW, 8 * instr.a() as i32);
            } else {
                asm.mov_reg_imm64(SCRATCH, Value::nil().raw_bits());
            }
            asm.mov_store(OUT_VALUE, 0, SCRATCH);
            emit_pop_frame_and_exit(asm);
            Ok(2)
        }
        Opcode::ReturnNil | Opcode::Halt => {
            asm.mov_reg_imm64(SCRATCH, Value::nil().raw_bits());
            asm.mov_store(OUT_VALUE, 0, SCRATCH);
            emit_pop_frame_and_exit(asm);
            Ok(1)
        }

        other => Err(CompileError::UnsupportedOpcode { index, op: other }),
    }
}

fn emit_const_to_register(asm: &mut Asm, reg: u8, bits: u64) {
    asm.mov_reg_imm64(SCRATCH, bits);
    asm.mov_store(REG_WINDOW, 8 * reg as i32, SCRATCH);
}

fn emit_pop_frame_and_exit(asm: &mut Asm) {
    asm.mov_reg_reg(Reg::Rdi, VM_PTR_SAVED);
    asm.mov_reg_imm64(Reg::Rax, ember_core::vm::jit::ember_core_jit_pop_frame as usize as u64);
    asm.call_rax();
    asm.test_reg32(Reg::Rax);
    asm.jnz(RelocTarget::ErrorExit);
    asm.jmp(RelocTarget::SuccessExit);
}

fn bin_op_tag(op: Opcode) -> JitBinOp {
    match op {
        Opcode::Sub => JitBinOp::Sub,
        Opcode::Mul => JitBinOp::Mul,
        Opcode::Div => JitBinOp::Div,
        Opcode::Mod => JitBinOp::Mod,
        Opcode::Lt => JitBinOp::Lt,
        Opcode::Le => JitBinOp::Le,
        Opcode::Gt => JitBinOp::Gt,
        Opcode::Ge => JitBinOp::Ge,
        Opcode::Eq => JitBinOp::Eq,
        Opcode::Ne => JitBinOp::Ne,
        _ => unreachable!("bin_op_tag called on a non-binary opcode"),
    }
}

fn jump_target(index: usize, sbx: i16) -> Result<u32, CompileError> {
    let next = index as i64 + 1;
    let target = next + sbx as i64;
    u32::try_from(target)
        .map_err(|_| CompileError::Malformed(format!("jump target {target} out of range at instruction {index}")))
}

/// `ember_core_jit_binary_op(vm, op_tag, dest, b_reg, c_reg)`'s argument
/// convention.
fn emit_call_args4(asm: &mut Asm, op_tag: u32, dest: u32, b_reg: u32, c_reg: u32) {
    asm.mov_reg_reg(Reg::Rdi, VM_PTR_SAVED);
    asm.mov_reg32_imm32(Reg::Rsi, op_tag);
    asm.mov_reg32_imm32(Reg::Rdx, dest);
    asm.mov_reg32_imm32(Reg::Rcx, b_reg);
    asm.mov_reg32_imm32(Reg::R8, c_reg);
}

/// `ember_core_jit_unary_op(vm, op_tag, dest, b_reg)`.
fn emit_call_args3(asm: &mut Asm, op_tag: u32, dest: u32, b_reg: u32) {
    asm.mov_reg_reg(Reg::Rdi, VM_PTR_SAVED);
    asm.mov_reg32_imm32(Reg::Rsi, op_tag);
    asm.mov_reg32_imm32(Reg::Rdx, dest);
    asm.mov_reg32_imm32(Reg::Rcx, b_reg);
}

/// `ember_core_jit_is_truthy(vm, reg)`.
fn emit_call_args1(asm: &mut Asm, reg: u32) {
    asm.mov_reg_reg(Reg::Rdi, VM_PTR_SAVED);
    asm.mov_reg32_imm32(Reg::Rsi, reg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(instrs: Vec<Instr>, register_count: u8) -> Chunk {
        let mut chunk = Chunk::new("test");
        chunk.set_register_count(register_count);
        chunk.set_param_count(0);
        for instr in instrs {
            chunk.emit(instr, 1);
        }
        chunk
    }

    #[test]
    fn rejects_empty_chunk() {
        let chunk = Chunk::new("empty");
        assert_eq!(compile_chunk(&chunk), Err(CompileError::EmptyChunk));
    }

    #[test]
    fn rejects_non_tier1_opcode() {
        let chunk = chunk_with(vec![Instr::abx(Opcode::LoadConst, 0, 0)], 1);
        assert!(matches!(
            compile_chunk(&chunk),
            Err(CompileError::UnsupportedOpcode { index: 0, op: Opcode::LoadConst })
        ));
    }

    #[test]
    fn compiles_a_counting_loop() {
        // r0 = 0; loop_header; r0 = r0 - (-1); loop_jump back; return r0
        let mut chunk = Chunk::new("loop");
        chunk.set_register_count(2);
        chunk.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1);
        let header = chunk.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 2);
        chunk.register_loop_header(header);
        chunk.emit(Instr::asbx(Opcode::LoadImmSmall, 1, -1), 3);
        chunk.emit(Instr::abc(Opcode::Sub, 0, 0, 1), 3);
        let back = -((chunk.instructions().len() as i32 + 1) - header as i32) as i16;
        chunk.emit(Instr::asbx(Opcode::LoopJump, 0, back), 4);
        chunk.emit(Instr::abc(Opcode::Return, 0, 0, 0), 5);
        chunk.emit(Instr::from_raw(1), 5);

        let code = compile_chunk(&chunk).expect("should compile");
        assert!(!code.is_empty());
    }

    #[test]
    fn return_without_extension_word_is_malformed() {
        let chunk = chunk_with(vec![Instr::abc(Opcode::Return, 0, 0, 0)], 1);
        assert!(matches!(compile_chunk(&chunk), Err(CompileError::Malformed(_))));
    }
}
