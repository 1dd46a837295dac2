//! Top-level JIT engine: the `ember_core::vm::jit::JitBackend` `Vm` calls
//! into, wrapping the template compiler (`codegen.rs`), the W^X memory
//! manager (`memory.rs`), and a size-capped code cache (`cache.rs`).
//!
//! Mirrors the corpus's `raya_engine::jit::engine::JitEngine` shape (a
//! config struct, a `new`/`with_config` pair, one cache field) with its
//! Cranelift backend and multi-tier pipeline collapsed to this crate's one
//! template tier.

use crate::cache::CodeCache;
use crate::codegen::{self, CompileError};
use crate::memory::ExecutableMemory;
use ember_bytecode::Chunk;
use ember_core::vm::jit::JitBackend;
use parking_lot::Mutex;
use std::rc::Rc;

/// Tunables for the JIT engine. `enabled` duplicates
/// `ember_core::VmOptions::jit_enabled` at a coarser grain — the engine
/// itself can be switched off independently of whether a particular `Vm`
/// consults it (useful for `ember-jit`'s own benchmarks/tests).
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Whether `try_compile` ever attempts a compile; `false` makes every
    /// call an immediate, cheap rejection.
    pub enabled: bool,
    /// Total bytes of executable memory the engine is allowed to hold
    /// across all compiled chunks before it starts evicting old entries.
    pub max_cache_bytes: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_bytes: 16 * 1024 * 1024,
        }
    }
}

/// The installable [`JitBackend`]. `Rc<JitEngine>` is what
/// `ember_core::vm::Vm::install_jit_backend` expects — single-threaded,
/// matching the one-mutator-thread-per-`Vm` model in spec.md §5.
pub struct JitEngine {
    config: JitConfig,
    cache: Mutex<CodeCache>,
}

impl JitEngine {
    pub fn new() -> Rc<Self> {
        Self::with_config(JitConfig::default())
    }

    pub fn with_config(config: JitConfig) -> Rc<Self> {
        Rc::new(Self {
            cache: Mutex::new(CodeCache::new(config.max_cache_bytes)),
            config,
        })
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_bytes(&self) -> usize {
        self.cache.lock().total_bytes()
    }
}

impl JitBackend for JitEngine {
    fn try_compile(&self, chunk: &Rc<Chunk>) -> Result<usize, String> {
        if !self.config.enabled {
            return Err("jit engine disabled".to_string());
        }
        let code = codegen::compile_chunk(chunk).map_err(|e: CompileError| e.to_string())?;
        let mem = ExecutableMemory::new(&code).map_err(|e| e.to_string())?;
        let entry = self.cache.lock().insert(chunk, mem);
        Ok(entry as usize)
    }
}
