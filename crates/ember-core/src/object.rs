//! Heap object variants: everything a `Value` pointer tag can point at.

use crate::value::Value;
use ember_bytecode::Chunk;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Discriminator stored in a [`crate::gc::GcHeader`] so the collector and
/// diagnostics can identify an object's shape without matching on the full
/// [`HeapObject`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Str,
    Array,
    Map,
    StructDef,
    StructInstance,
    Environment,
    Module,
    Function,
    NativeFunction,
    Future,
    Resource,
    Upvalue,
}

/// A struct type's shape: field names in declaration order.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub field_names: Vec<String>,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|f| f == name)
    }
}

/// An instance of a [`StructDef`].
#[derive(Debug, Clone)]
pub struct StructInstance {
    pub def: Value,
    pub fields: Vec<Value>,
}

/// A lexical scope: a name-indexed slot table used for globals and captured
/// closure state. Unlike function-local registers (which live in the
/// interpreter's stack, not the heap), environments are heap objects because
/// a closure's upvalues must outlive the frame that created them.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub parent: Option<Value>,
    pub slots: FxHashMap<String, Value>,
}

/// A loaded module's exported namespace.
///
/// `source` records the path or identifier the module was loaded from (for
/// diagnostics and re-import dedup); `environment` is the module's top-level
/// scope, a heap `Environment` used as the defining scope for every function
/// the module declares.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub exports: FxHashMap<String, Value>,
    pub source: Option<Rc<str>>,
    pub environment: Value,
}

/// A guest-defined function: its compiled chunk, captured upvalues, and the
/// lexical environment it closed over at definition time (nil for top-level
/// functions, whose free-variable lookups fall through to the global
/// environment instead).
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub chunk: Rc<Chunk>,
    pub upvalues: Vec<Value>,
    pub environment: Value,
}

/// Signature every native (host-provided) function must implement: the VM
/// pointer (for allocation, error construction, and re-entrant guest calls),
/// the argument slice, and its length. See `crate::ffi` for the full calling
/// convention, including the rooting obligations on returned heap values.
pub type NativeFn = fn(vm: &mut crate::vm::Vm, args: &[Value]) -> crate::error::VmResult<Value>;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub arity: Option<usize>,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

/// State of an async task's result slot. See `crate::scheduler`.
#[derive(Debug, Clone)]
pub enum FutureState {
    Pending,
    Resolved(Value),
    Rejected(String),
}

/// A mutex/condvar pair a host thread can block on while a guest `Future`
/// resolves off the scheduler's own cooperative loop (e.g. a native function
/// that hands a `Future` to a background OS thread before returning it to
/// the guest). Guest code itself never touches this; `await` is satisfied
/// by draining the scheduler's task queue, not by waiting on this handle.
pub type FutureWaker = Arc<(parking_lot::Mutex<()>, parking_lot::Condvar)>;

#[derive(Debug, Clone)]
pub struct FutureObject {
    pub state: FutureState,
    pub waker: FutureWaker,
}

impl FutureObject {
    pub fn pending() -> Self {
        FutureObject {
            state: FutureState::Pending,
            waker: Arc::new((parking_lot::Mutex::new(()), parking_lot::Condvar::new())),
        }
    }
}

/// An opaque native resource handed to the guest through the extension
/// bridge (a file handle, a socket, a compiled regex — whatever the
/// embedder registers). The VM never inspects `payload`; it only keeps it
/// alive until the heap object is swept, at which point the `Box<dyn Any>`
/// is dropped and ordinary Rust `Drop` glue reclaims whatever the embedder
/// put inside it.
pub struct Resource {
    pub type_name: &'static str,
    pub payload: Box<dyn std::any::Any>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource").field("type_name", &self.type_name).finish()
    }
}

/// A closed-over variable cell shared between a closure and its defining
/// scope (or between sibling closures capturing the same local).
#[derive(Debug, Clone)]
pub struct Upvalue {
    pub value: Value,
}

/// Every shape a `Value` pointer can reference. This is a closed set —
/// adding a new kind means extending this enum, [`ObjectKind`], and the
/// collector's `trace` match together.
#[derive(Debug, Clone)]
pub enum HeapObject {
    Str(String),
    Array(Vec<Value>),
    Map(FxHashMap<Value, Value>),
    StructDef(StructDef),
    StructInstance(StructInstance),
    Environment(Environment),
    Module(Module),
    Function(Function),
    NativeFunction(NativeFunction),
    Future(FutureObject),
    Resource(Rc<Resource>),
    Upvalue(Upvalue),
}

impl HeapObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapObject::Str(_) => ObjectKind::Str,
            HeapObject::Array(_) => ObjectKind::Array,
            HeapObject::Map(_) => ObjectKind::Map,
            HeapObject::StructDef(_) => ObjectKind::StructDef,
            HeapObject::StructInstance(_) => ObjectKind::StructInstance,
            HeapObject::Environment(_) => ObjectKind::Environment,
            HeapObject::Module(_) => ObjectKind::Module,
            HeapObject::Function(_) => ObjectKind::Function,
            HeapObject::NativeFunction(_) => ObjectKind::NativeFunction,
            HeapObject::Future(_) => ObjectKind::Future,
            HeapObject::Resource(_) => ObjectKind::Resource,
            HeapObject::Upvalue(_) => ObjectKind::Upvalue,
        }
    }

    /// Invoke `visit` once for every `Value` this object directly holds.
    /// The collector uses this to push an object's children onto the gray
    /// stack during marking; it never needs to know the variant itself.
    pub fn trace(&self, mut visit: impl FnMut(Value)) {
        match self {
            HeapObject::Str(_) | HeapObject::NativeFunction(_) | HeapObject::Resource(_) => {}
            HeapObject::Array(items) => items.iter().copied().for_each(&mut visit),
            HeapObject::Map(map) => {
                for (k, v) in map {
                    visit(*k);
                    visit(*v);
                }
            }
            HeapObject::StructDef(_) => {}
            HeapObject::StructInstance(inst) => {
                visit(inst.def);
                inst.fields.iter().copied().for_each(&mut visit);
            }
            HeapObject::Environment(env) => {
                if let Some(parent) = env.parent {
                    visit(parent);
                }
                env.slots.values().copied().for_each(&mut visit);
            }
            HeapObject::Module(module) => {
                module.exports.values().copied().for_each(&mut visit);
                visit(module.environment);
            }
            HeapObject::Function(function) => {
                function.upvalues.iter().copied().for_each(&mut visit);
                visit(function.environment);
            }
            HeapObject::Future(future) => {
                if let FutureState::Resolved(v) = future.state {
                    visit(v);
                }
            }
            HeapObject::Upvalue(up) => visit(up.value),
        }
    }

    /// Like [`HeapObject::trace`], but rewrites each held `Value` in place.
    /// Used only by the minor collector's forwarding-pointer fix-up pass
    /// after a promotion, so the cost of rebuilding `Map` (whose keys can't
    /// be mutated without risking bucket corruption) is paid rarely.
    pub fn retrace_mut(&mut self, mut visit: impl FnMut(&mut Value)) {
        match self {
            HeapObject::Str(_) | HeapObject::NativeFunction(_) | HeapObject::Resource(_) => {}
            HeapObject::Array(items) => items.iter_mut().for_each(&mut visit),
            HeapObject::Map(map) => {
                if map.is_empty() {
                    return;
                }
                let mut rebuilt = FxHashMap::with_capacity_and_hasher(map.len(), Default::default());
                for (mut k, mut v) in map.drain() {
                    visit(&mut k);
                    visit(&mut v);
                    rebuilt.insert(k, v);
                }
                *map = rebuilt;
            }
            HeapObject::StructDef(_) => {}
            HeapObject::StructInstance(inst) => {
                visit(&mut inst.def);
                inst.fields.iter_mut().for_each(&mut visit);
            }
            HeapObject::Environment(env) => {
                if let Some(parent) = &mut env.parent {
                    visit(parent);
                }
                env.slots.values_mut().for_each(&mut visit);
            }
            HeapObject::Module(module) => {
                module.exports.values_mut().for_each(&mut visit);
                visit(&mut module.environment);
            }
            HeapObject::Function(function) => {
                function.upvalues.iter_mut().for_each(&mut visit);
                visit(&mut function.environment);
            }
            HeapObject::Future(future) => {
                if let FutureState::Resolved(v) = &mut future.state {
                    visit(v);
                }
            }
            HeapObject::Upvalue(up) => visit(&mut up.value),
        }
    }
}

// `Value` is used as a map key above; hashing/equality are on the raw bits,
// which is sound for nil/bool/int/pointer (bit-identical <=> value-identical)
// and for float equality in the IEEE sense VM code already expects (`Eq`
// would be wrong for NaN under IEEE rules, but guest maps key on identity of
// the boxed bits here, matching how the corpus's own hashable value newtype
// behaves for float keys).
impl Eq for Value {}
impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw_bits().hash(state);
    }
}
