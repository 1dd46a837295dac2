//! Chunk format and register-based instruction encoding.
//!
//! This crate is deliberately independent of the runtime (`ember-core`):
//! anything that assembles bytecode — a compiler, a bytecode assembler used
//! in tests, a tool that patches constants — can depend on just this crate.

mod constants;
mod encoder;
mod module;
mod opcode;
mod verify;

pub use constants::{Constant, ConstantPool};
pub use encoder::{read_module, write_module, EncodeError};
pub use module::{Chunk, ModuleError};
pub use opcode::{InstrFormat, Instr, Opcode};
pub use verify::{verify_chunk, VerifyError};
