//! The `Chunk`: a self-contained, append-only unit of compiled bytecode.

use crate::constants::ConstantPool;
use crate::encoder::{EncodeError, Reader, Writer};
use crate::opcode::Instr;
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::HashMap;
use thiserror::Error;

/// Magic number for a persisted chunk: "EMBR".
pub const MAGIC: [u8; 4] = *b"EMBR";

/// Current on-disk format version.
pub const VERSION: u32 = 1;

/// Threshold at which a loop header's hot counter triggers JIT compilation
/// of the chunk containing it. Matches [`crate::Chunk::default_hot_threshold`].
pub const DEFAULT_HOT_THRESHOLD: u32 = 1_000;

/// Errors raised while decoding a persisted chunk.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A field ran off the end of the buffer, or an invalid tag was read.
    #[error("malformed chunk: {0}")]
    Decode(#[from] EncodeError),
    /// The header's magic bytes didn't read `"EMBR"`.
    #[error("invalid chunk magic: expected {MAGIC:?}, got {0:?}")]
    InvalidMagic([u8; 4]),
    /// The header declared a format version this build doesn't understand.
    #[error("unsupported chunk version: {0} (supports {VERSION})")]
    UnsupportedVersion(u32),
    /// The trailing checksum didn't match the payload.
    #[error("chunk checksum mismatch: expected {expected:x?}, got {actual:x?}")]
    ChecksumMismatch {
        expected: [u8; 32],
        actual: [u8; 32],
    },
}

/// A compiled, executable unit of bytecode.
///
/// Instructions and the constant pool are append-only once a `Chunk` leaves
/// its assembler: the interpreter, the verifier, and the JIT only ever read
/// them. The two fields that *do* mutate during execution — the per-loop hot
/// counters and the cached JIT entry point — are interior-mutable so a
/// `Chunk` can be handed around as a plain `Rc<Chunk>` without the
/// interpreter needing `&mut` access to it mid-call.
#[derive(Debug)]
pub struct Chunk {
    name: String,
    instructions: Vec<Instr>,
    constants: ConstantPool,
    /// Source line for each instruction, same length as `instructions`.
    lines: Vec<u32>,
    /// Number of registers this chunk's frame requires.
    register_count: u8,
    /// Number of leading registers that are parameters.
    param_count: u8,
    /// Backward-branch counters, keyed by the instruction index of the loop
    /// header (`LoopHeader` or the jump target of a `LoopJump`).
    hot_counters: HashMap<u32, Cell<u32>>,
    /// Cached native entry point installed by the JIT, if this chunk (or a
    /// loop within it) has been compiled. Opaque here; `ember-jit` owns the
    /// pointer's meaning.
    jit_entry: Cell<Option<usize>>,
    /// Set once a compile attempt has failed (an unsupported opcode was
    /// found). Sticky, so the VM doesn't retry compiling the same chunk on
    /// every subsequent hot-counter trip.
    jit_ineligible: Cell<bool>,
}

impl Chunk {
    /// Begin assembling a new, empty chunk.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            constants: ConstantPool::new(),
            lines: Vec::new(),
            register_count: 0,
            param_count: 0,
            hot_counters: HashMap::new(),
            jit_entry: Cell::new(None),
            jit_ineligible: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    pub fn constants_mut(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    pub fn register_count(&self) -> u8 {
        self.register_count
    }

    pub fn param_count(&self) -> u8 {
        self.param_count
    }

    pub fn set_register_count(&mut self, n: u8) {
        self.register_count = n;
    }

    pub fn set_param_count(&mut self, n: u8) {
        self.param_count = n;
    }

    /// Append an instruction, recording its source line. Returns the
    /// instruction's index for later jump-patching.
    pub fn emit(&mut self, instr: Instr, line: u32) -> u32 {
        let idx = self.instructions.len() as u32;
        self.instructions.push(instr);
        self.lines.push(line);
        idx
    }

    /// Overwrite a previously emitted instruction, used to patch a forward
    /// jump once its target address is known.
    pub fn patch(&mut self, idx: u32, instr: Instr) {
        self.instructions[idx as usize] = instr;
    }

    /// The source line an instruction was compiled from, for diagnostics.
    pub fn line_for(&self, instr_index: u32) -> Option<u32> {
        self.lines.get(instr_index as usize).copied()
    }

    /// Register `instr_index` as a loop header so its hot counter can be
    /// tracked. Idempotent.
    pub fn register_loop_header(&mut self, instr_index: u32) {
        self.hot_counters.entry(instr_index).or_insert_with(|| Cell::new(0));
    }

    /// Increment the hot counter for a loop header, returning the new count.
    /// Returns `None` if `instr_index` was never registered as a header.
    pub fn bump_hot_counter(&self, instr_index: u32) -> Option<u32> {
        let cell = self.hot_counters.get(&instr_index)?;
        let next = cell.get().saturating_add(1);
        cell.set(next);
        Some(next)
    }

    pub fn hot_counter(&self, instr_index: u32) -> u32 {
        self.hot_counters.get(&instr_index).map(|c| c.get()).unwrap_or(0)
    }

    pub fn default_hot_threshold() -> u32 {
        DEFAULT_HOT_THRESHOLD
    }

    /// The cached JIT entry point, if any code has been installed.
    pub fn jit_entry(&self) -> Option<usize> {
        self.jit_entry.get()
    }

    /// Install (or clear, with `None`) the cached JIT entry point.
    pub fn set_jit_entry(&self, entry: Option<usize>) {
        self.jit_entry.set(entry);
    }

    /// Whether a previous compile attempt on this chunk failed. Checked
    /// before retrying compilation so an unsupported opcode is only
    /// discovered once.
    pub fn is_jit_ineligible(&self) -> bool {
        self.jit_ineligible.get()
    }

    /// Record that this chunk cannot be compiled; sticky for the chunk's
    /// lifetime.
    pub fn mark_jit_ineligible(&self) {
        self.jit_ineligible.set(true);
    }

    /// Serialize to the on-disk chunk format: header, checksum, constant
    /// pool, instruction stream, line table.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.buffer.extend_from_slice(&MAGIC);
        w.emit_u32(VERSION);
        let checksum_at = w.offset();
        w.buffer.extend_from_slice(&[0u8; 32]);

        let payload_start = w.offset();
        w.emit_str(&self.name);
        w.emit_u8(self.register_count);
        w.emit_u8(self.param_count);
        self.constants.encode(&mut w);

        w.emit_u32(self.instructions.len() as u32);
        for instr in &self.instructions {
            w.emit_instr(*instr);
        }
        for &line in &self.lines {
            w.emit_u32(line);
        }

        w.emit_u32(self.hot_counters.len() as u32);
        for (&idx, count) in &self.hot_counters {
            w.emit_u32(idx);
            w.emit_u32(count.get());
        }

        let digest = Sha256::digest(&w.buffer[payload_start..]);
        w.patch_checksum(checksum_at, digest.into());
        w.into_bytes()
    }

    /// Parse a chunk previously produced by [`Chunk::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ModuleError> {
        let mut r = Reader::new(bytes);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&r.read_bytes(4)?);
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }
        let mut stored_checksum = [0u8; 32];
        stored_checksum.copy_from_slice(&r.read_bytes(32)?);

        let payload_start = r.position();
        let actual: [u8; 32] = Sha256::digest(&bytes[payload_start..]).into();
        if actual != stored_checksum {
            return Err(ModuleError::ChecksumMismatch {
                expected: stored_checksum,
                actual,
            });
        }

        let name = r.read_str()?;
        let register_count = r.read_u8()?;
        let param_count = r.read_u8()?;
        let constants = ConstantPool::decode(&mut r)?;

        let instr_count = r.read_u32()? as usize;
        let mut instructions = Vec::with_capacity(instr_count);
        for _ in 0..instr_count {
            instructions.push(r.read_instr()?);
        }
        let mut lines = Vec::with_capacity(instr_count);
        for _ in 0..instr_count {
            lines.push(r.read_u32()?);
        }

        let counter_count = r.read_u32()? as usize;
        let mut hot_counters = HashMap::with_capacity(counter_count);
        for _ in 0..counter_count {
            let idx = r.read_u32()?;
            let count = r.read_u32()?;
            hot_counters.insert(idx, Cell::new(count));
        }

        Ok(Self {
            name,
            instructions,
            constants,
            lines,
            register_count,
            param_count,
            hot_counters,
            jit_entry: Cell::new(None),
            jit_ineligible: Cell::new(false),
        })
    }
}

impl Writer {
    fn patch_checksum(&mut self, at: usize, digest: [u8; 32]) {
        self.buffer[at..at + 32].copy_from_slice(&digest);
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            instructions: self.instructions.clone(),
            constants: self.constants.clone(),
            lines: self.lines.clone(),
            register_count: self.register_count,
            param_count: self.param_count,
            hot_counters: self
                .hot_counters
                .iter()
                .map(|(&k, v)| (k, Cell::new(v.get())))
                .collect(),
            // A freshly cloned chunk starts without compiled code installed;
            // the clone may diverge from the original before it's ever run.
            jit_entry: Cell::new(None),
            jit_ineligible: Cell::new(false),
        }
    }
}
