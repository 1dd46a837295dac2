//! A tiny x86-64 assembler: just enough instruction encoding for the
//! template compiler in `codegen.rs`. Not a general-purpose assembler —
//! every helper here emits exactly one instruction shape, named after what
//! `codegen.rs` needs it for rather than after the mnemonic alone.
//!
//! Calling convention assumed throughout: System V AMD64 (Linux/macOS),
//! the only ABI the corpus's own JIT backends (`raya-engine`'s Cranelift
//! lowering, `octofhir-otter`'s hand-written helpers) target.

/// Register encoding, 0-15 (low 3 bits go in ModRM/opcode, bit 3 becomes a
/// REX extension bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    #[inline]
    fn ext_bit(self) -> u8 {
        (self as u8) >> 3
    }
}

/// System V integer argument registers, in order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

#[inline]
fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (r << 2) | (x << 1) | b
}

/// A relocation: `buf[offset..offset+4]` is a little-endian `rel32` that
/// must be patched once `target` (a resolved absolute code offset) is
/// known — either because the jump is forward (not yet emitted) or
/// because it targets a shared epilogue block emitted once at the end.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub offset: usize,
    pub target: RelocTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// Index into the bytecode instruction stream.
    BytecodeIndex(u32),
    ErrorExit,
    SuccessExit,
}

/// A growable machine-code buffer plus the bookkeeping `codegen.rs` needs
/// to resolve jump targets once every instruction has been emitted.
#[derive(Debug, Default)]
pub struct Asm {
    pub buf: Vec<u8>,
    pub relocs: Vec<Reloc>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// `mov dst, src` (64-bit, register to register).
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(true, src.ext_bit(), 0, dst.ext_bit()));
        self.buf.push(0x89);
        self.buf.push(0xC0 | (src.low3() << 3) | dst.low3());
    }

    /// `mov dst, imm64` (64-bit immediate load).
    pub fn mov_reg_imm64(&mut self, dst: Reg, imm: u64) {
        self.buf.push(rex(true, 0, 0, dst.ext_bit()));
        self.buf.push(0xB8 + dst.low3());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov dst32, imm32` — zero-extends into the full 64-bit register.
    /// Used for small integer call arguments (tags, register indices);
    /// always emits a REX prefix (harmless on low registers) so the
    /// instruction is the same shape regardless of which register this is.
    pub fn mov_reg32_imm32(&mut self, dst: Reg, imm: u32) {
        self.buf.push(rex(false, 0, 0, dst.ext_bit()));
        self.buf.push(0xB8 + dst.low3());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov dst, [base + disp32]` (64-bit load). Always uses the disp32
    /// ModRM form (`mod=10`) even for small/zero displacements, so the
    /// encoding never has to special-case `rbp`/`r13` as a base (which,
    /// only at `mod=00`, means RIP-relative instead of "no displacement").
    pub fn mov_load(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.buf.push(rex(true, dst.ext_bit(), 0, base.ext_bit()));
        self.buf.push(0x8B);
        self.buf.push(0x80 | (dst.low3() << 3) | base.low3());
        self.buf.extend_from_slice(&disp.to_le_bytes());
    }

    /// `mov [base + disp32], src` (64-bit store). Same disp32-always
    /// convention as [`Asm::mov_load`].
    pub fn mov_store(&mut self, base: Reg, disp: i32, src: Reg) {
        self.buf.push(rex(true, src.ext_bit(), 0, base.ext_bit()));
        self.buf.push(0x89);
        self.buf.push(0x80 | (src.low3() << 3) | base.low3());
        self.buf.extend_from_slice(&disp.to_le_bytes());
    }

    /// `call rax` — the caller has already loaded the callee's absolute
    /// address into `rax` via [`Asm::mov_reg_imm64`]. A direct `call rel32`
    /// can't reach an arbitrary heap-allocated Rust function from a
    /// freshly `mmap`'d page, so every helper call here is indirect
    /// through a register instead.
    pub fn call_rax(&mut self) {
        self.buf.push(0xFF);
        self.buf.push(0xD0);
    }

    /// `push reg`.
    pub fn push(&mut self, reg: Reg) {
        if reg.ext_bit() != 0 {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 + reg.low3());
    }

    /// `pop reg`.
    pub fn pop(&mut self, reg: Reg) {
        if reg.ext_bit() != 0 {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 + reg.low3());
    }

    pub fn ret(&mut self) {
        self.buf.push(0xC3);
    }

    /// `test reg, reg` (32-bit).
    pub fn test_reg32(&mut self, reg: Reg) {
        if reg.ext_bit() != 0 {
            self.buf.push(rex(false, reg.ext_bit(), 0, reg.ext_bit()));
        }
        self.buf.push(0x85);
        self.buf.push(0xC0 | (reg.low3() << 3) | reg.low3());
    }

    /// `test reg, reg` (64-bit) — for null-pointer checks, where a false
    /// "zero" reading from the low 32 bits alone would be wrong.
    pub fn test_reg64(&mut self, reg: Reg) {
        self.buf.push(rex(true, reg.ext_bit(), 0, reg.ext_bit()));
        self.buf.push(0x85);
        self.buf.push(0xC0 | (reg.low3() << 3) | reg.low3());
    }

    /// `cmp reg, imm32` (32-bit).
    pub fn cmp_reg32_imm32(&mut self, reg: Reg, imm: i32) {
        if reg.ext_bit() != 0 {
            self.buf.push(rex(false, 0, 0, reg.ext_bit()));
        }
        self.buf.push(0x81);
        self.buf.push(0xF8 | reg.low3());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// Unconditional `jmp rel32` to `target`. Emits a placeholder and
    /// records a relocation; callers never need to know whether the
    /// target has been seen yet.
    pub fn jmp(&mut self, target: RelocTarget) {
        self.buf.push(0xE9);
        self.reloc_here(target);
    }

    /// `jz rel32` (jump if ZF set, i.e. the last `test`/`cmp` was equal).
    pub fn jz(&mut self, target: RelocTarget) {
        self.buf.push(0x0F);
        self.buf.push(0x84);
        self.reloc_here(target);
    }

    /// `jnz rel32`.
    pub fn jnz(&mut self, target: RelocTarget) {
        self.buf.push(0x0F);
        self.buf.push(0x85);
        self.reloc_here(target);
    }

    /// `je rel32` — alias of `jz`, kept distinct at call sites for
    /// readability (equality check vs. "nonzero" check).
    pub fn je(&mut self, target: RelocTarget) {
        self.jz(target);
    }

    fn reloc_here(&mut self, target: RelocTarget) {
        let offset = self.buf.len();
        self.relocs.push(Reloc { offset, target });
        self.buf.extend_from_slice(&0i32.to_le_bytes());
    }

    /// Resolve every recorded relocation now that `bytecode_offsets` (every
    /// instruction's final native offset) and the two shared epilogue
    /// offsets are known. Must run exactly once, after all code — body and
    /// epilogues — has been emitted.
    pub fn patch_all(&mut self, bytecode_offsets: &[Option<usize>], error_exit: usize, success_exit: usize) -> Result<(), String> {
        for reloc in &self.relocs {
            let target_offset = match reloc.target {
                RelocTarget::ErrorExit => error_exit,
                RelocTarget::SuccessExit => success_exit,
                RelocTarget::BytecodeIndex(idx) => bytecode_offsets
                    .get(idx as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| format!("jump target instruction {idx} was never emitted"))?,
            };
            // rel32 is relative to the address of the *next* instruction,
            // i.e. right after this 4-byte field.
            let rel = target_offset as i64 - (reloc.offset as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| "relative jump out of i32 range".to_string())?;
            self.buf[reloc.offset..reloc.offset + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_reg_imm64_is_ten_bytes() {
        let mut asm = Asm::new();
        asm.mov_reg_imm64(Reg::Rax, 0x1122_3344_5566_7788);
        assert_eq!(asm.buf.len(), 10);
        assert_eq!(&asm.buf[2..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn push_pop_extended_register_gets_rex_prefix() {
        let mut asm = Asm::new();
        asm.push(Reg::R12);
        asm.pop(Reg::R12);
        assert_eq!(asm.buf, vec![0x41, 0x54, 0x41, 0x5C]);
    }

    #[test]
    fn test_reg64_carries_rex_w_not_just_the_extension_bit() {
        let mut asm = Asm::new();
        asm.test_reg64(Reg::Rax);
        // REX.W (0x48) is mandatory here even though rax needs no extension
        // bit — this is the 64-bit `test`, distinct from `test_reg32`.
        assert_eq!(asm.buf, vec![0x48, 0x85, 0xC0]);
    }

    #[test]
    fn jmp_relocation_resolves_to_correct_rel32() {
        let mut asm = Asm::new();
        asm.jmp(RelocTarget::BytecodeIndex(0));
        let site = 0usize;
        asm.patch_all(&[Some(20)], 0, 0).unwrap();
        let rel = i32::from_le_bytes(asm.buf[site + 1..site + 5].try_into().unwrap());
        // jmp is 5 bytes (E9 + rel32); next-instruction address is 5, target is 20.
        assert_eq!(rel, 20 - 5);
    }
}
