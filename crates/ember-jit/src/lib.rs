//! Template JIT compiler for hot `ember-bytecode::Chunk`s: a tiny x86-64
//! assembler (`x64`), the opcode-at-a-time compiler built on it
//! (`codegen`), W^X executable memory (`memory`), a size-capped code
//! cache (`cache`), and the `JitEngine` that wires them into
//! `ember_core::vm::jit::JitBackend` (`engine`).
//!
//! `ember-core` never depends on this crate — see `ember_core::vm::jit`'s
//! module doc for the seam. An embedder who wants JIT at all constructs a
//! [`JitEngine`] and calls `Vm::install_jit_backend`; one that doesn't
//! (tests, a from-scratch port to a second ISA) simply never does, and
//! every chunk always runs interpreted.

pub mod cache;
pub mod codegen;
pub mod engine;
pub mod memory;
mod x64;

pub use cache::CodeCache;
pub use codegen::{compile_chunk, CompileError};
pub use engine::{JitConfig, JitEngine};
pub use memory::{ExecutableMemory, MemoryError};
