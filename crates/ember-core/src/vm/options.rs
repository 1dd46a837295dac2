//! VM-wide configuration: stack sizing, resource caps, and the JIT trigger.

use crate::gc::GcConfig;

/// Caps on resources a guest program can consume, independent of the
/// mechanism (GC, stack, scheduler) that enforces each one.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Hard cap on old-generation bytes; `None` means unlimited.
    pub max_heap_bytes: Option<usize>,
    /// Hard cap on concurrently queued or running scheduler tasks.
    pub max_tasks: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: None,
            max_tasks: None,
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_heap_limit(max_heap_bytes: usize) -> Self {
        Self {
            max_heap_bytes: Some(max_heap_bytes),
            ..Default::default()
        }
    }

    pub fn with_task_limit(max_tasks: usize) -> Self {
        Self {
            max_tasks: Some(max_tasks),
            ..Default::default()
        }
    }
}

/// Everything a fresh [`crate::vm::Vm`] needs to size its register file,
/// call stack, heap, and JIT trigger. Mirrors the shape of the corpus's
/// `VmOptions`/`ResourceLimits` pairing, generalized to this VM's
/// register-based frame layout.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Register file capacity, shared by every active frame's window.
    pub max_registers: usize,
    /// Maximum call-frame nesting depth.
    pub max_frame_depth: usize,
    /// Whether the JIT is consulted at all; when `false` every chunk always
    /// runs interpreted regardless of its hot counter.
    pub jit_enabled: bool,
    /// Backward-branch count at which a chunk becomes eligible for JIT
    /// compilation. Mirrors `ember_bytecode::Chunk::default_hot_threshold`.
    pub jit_threshold: u32,
    pub limits: ResourceLimits,
    pub gc_config: GcConfig,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_registers: crate::stack::DEFAULT_MAX_REGISTERS,
            max_frame_depth: crate::stack::DEFAULT_MAX_FRAME_DEPTH,
            jit_enabled: true,
            jit_threshold: ember_bytecode::Chunk::default_hot_threshold(),
            limits: ResourceLimits::default(),
            gc_config: GcConfig::default(),
        }
    }
}
