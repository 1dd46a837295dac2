//! The VM: register file owner, global environment, module/struct registry,
//! and the register-based dispatch loop that executes a [`Chunk`].
//!
//! Calls are handled by direct recursion (`call_value` pushes a frame, runs
//! it to completion via `run_frame`, pops it, and returns) rather than a
//! single flat loop spanning every frame. Recursion depth tracks guest call
//! depth, which `VmOptions::max_frame_depth` already bounds, so this never
//! risks overflowing the host stack any more than the guest's own
//! frame-depth limit already does.

use crate::error::{VmError, VmResult};
use crate::ffi;
use crate::gc::{Collector, GcStats, HeapStats, RootProvider, RootSet};
use crate::object::{
    Environment, Function, FutureObject, FutureState, FutureWaker, HeapObject, Module,
    NativeFunction, ObjectKind, StructDef, StructInstance, Upvalue,
};
use crate::scheduler::Scheduler;
use crate::stack::Stack;
use crate::value::{Value, ValueTag};
use crate::vm::VmOptions;
use ember_bytecode::{Chunk, Constant, Opcode};
use rustc_hash::FxHashMap;
use std::io::Write;
use std::rc::Rc;

/// Bundles every root source scattered across `Vm`'s fields (everything
/// except the collector itself) into one [`RootProvider`] the collector can
/// be handed without aliasing `Vm::gc`. Constructed fresh at each call site
/// rather than cached, since it only borrows.
struct VmRoots<'a> {
    stack: &'a mut Stack,
    extra: &'a mut RootSet,
    global_env: &'a mut Value,
    modules: &'a mut FxHashMap<String, Value>,
    struct_defs: &'a mut FxHashMap<String, Value>,
    scheduler: &'a mut Scheduler,
}

impl RootProvider for VmRoots<'_> {
    fn for_each_root(&self, visit: &mut dyn FnMut(Value)) {
        self.stack.for_each_root(visit);
        self.extra.for_each_root(visit);
        visit(*self.global_env);
        for &v in self.modules.values() {
            visit(v);
        }
        for &v in self.struct_defs.values() {
            visit(v);
        }
        self.scheduler.for_each_value(|v| visit(v));
    }

    fn for_each_root_mut(&mut self, visit: &mut dyn FnMut(&mut Value)) {
        self.stack.for_each_root_mut(visit);
        self.extra.for_each_root_mut(visit);
        visit(self.global_env);
        for v in self.modules.values_mut() {
            visit(v);
        }
        for v in self.struct_defs.values_mut() {
            visit(v);
        }
        self.scheduler.for_each_value_mut(|v| visit(v));
    }
}

/// One VM instance: its own heap, register file, global scope, module and
/// struct registries, scheduler, and native bridge. Guest code runs on
/// exactly one host thread per `Vm` (spec.md §5); nothing here is `Send`.
pub struct Vm {
    gc: Collector,
    /// Crate-visible so `vm::jit`'s `extern "C"` helpers can reach the
    /// register file a JIT-compiled chunk's native code is addressing.
    pub(crate) stack: Stack,
    extra_roots: RootSet,
    global_env: Value,
    /// The lexical environment in scope for the currently executing frame —
    /// the global environment at the top level, or a function's defining
    /// environment once a call descends into it. Restored from
    /// `CallFrame::prev_environment` on return.
    current_env: Value,
    modules: FxHashMap<String, Value>,
    /// Struct definitions, named like globals but kept in their own table so
    /// `NewStruct` doesn't have to share the global namespace with ordinary
    /// bindings.
    struct_defs: FxHashMap<String, Value>,
    /// Content -> canonical object. Weak: never traced as a root itself.
    /// A dead entry is dropped (and a promoted one forwarded to its new
    /// address) on every collection that could invalidate it, minor or
    /// major — see `Vm::alloc` and `Vm::collect_major`.
    intern: FxHashMap<Box<str>, Value>,
    scheduler: Scheduler,
    options: VmOptions,
    stdout: Box<dyn Write>,
    /// The installed JIT backend, if any (`ember-jit`'s `JitEngine` in a
    /// normal embedding). `None` means every chunk always runs interpreted.
    pub(crate) jit: Option<Rc<dyn crate::vm::jit::JitBackend>>,
    /// Set by a `vm::jit` helper when a call from JIT-compiled native code
    /// fails; `run_jit_entry` drains it into the `VmResult` it returns.
    pub(crate) jit_pending_error: Option<VmError>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut vm = Self {
            gc: Collector::new(options.gc_config.clone()),
            stack: Stack::with_limits(options.max_registers, options.max_frame_depth),
            extra_roots: RootSet::new(),
            global_env: Value::nil(),
            current_env: Value::nil(),
            modules: FxHashMap::default(),
            struct_defs: FxHashMap::default(),
            intern: FxHashMap::default(),
            scheduler: Scheduler::with_task_limit(options.limits.max_tasks),
            options,
            stdout: Box::new(std::io::stdout()),
            jit: None,
            jit_pending_error: None,
        };
        let global_env = vm
            .alloc(
                ObjectKind::Environment,
                HeapObject::Environment(Environment {
                    parent: None,
                    slots: Default::default(),
                }),
            )
            .expect("allocating the initial global environment cannot fail");
        vm.global_env = global_env;
        vm.current_env = global_env;
        vm
    }

    /// Like [`Vm::new`], but routes `print` output to `writer` instead of
    /// the process's real stdout — how tests observe diagnostic output
    /// without capturing the test harness's own stdout.
    pub fn with_stdout(options: VmOptions, writer: impl Write + 'static) -> Self {
        let mut vm = Self::new(options);
        vm.stdout = Box::new(writer);
        vm
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Plug in a JIT backend (`ember-jit`'s `JitEngine`, typically). Chunks
    /// whose hot counter crosses `VmOptions::jit_threshold` are offered to
    /// it the next time `LoopJump` runs; without one installed every chunk
    /// always runs interpreted regardless of `jit_enabled`.
    pub fn install_jit_backend(&mut self, backend: Rc<dyn crate::vm::jit::JitBackend>) {
        self.jit = Some(backend);
    }

    /// Drain the error a JIT helper call stashed on `self`, if any. Used by
    /// [`Vm::run_jit_entry`]; public so `ember-jit`'s own tests can assert on
    /// it directly after driving a compiled entry point by hand.
    pub fn take_jit_pending_error(&mut self) -> Option<VmError> {
        self.jit_pending_error.take()
    }

    pub fn global_environment(&self) -> Value {
        self.global_env
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.gc.stats()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.gc.heap_stats()
    }

    /// Allocate a heap object, running GC as needed. Every other `make_*`
    /// constructor on `Vm` funnels through this. Threads the intern table's
    /// weak-table fixup into whatever collection(s) the allocation itself
    /// triggers, not only ones a caller drives explicitly (`collect_major`)
    /// — an allocation-triggered minor collect can promote or drop an
    /// interned string just as easily as a major one.
    pub fn alloc(&mut self, kind: ObjectKind, data: HeapObject) -> VmResult<Value> {
        let intern = &mut self.intern;
        let mut roots = VmRoots {
            stack: &mut self.stack,
            extra: &mut self.extra_roots,
            global_env: &mut self.global_env,
            modules: &mut self.modules,
            struct_defs: &mut self.struct_defs,
            scheduler: &mut self.scheduler,
        };
        let gc_ref = self
            .gc
            .allocate_and(kind, data, &mut roots, |lookup| {
                intern.retain(|_, v| match lookup(*v) {
                    Some(new_v) => {
                        *v = new_v;
                        true
                    }
                    None => false,
                });
            })
            .map_err(VmError::ResourceExhaustion)?;
        Ok(unsafe { gc_ref.to_value() })
    }

    /// Intern a string: the same byte content always yields the same heap
    /// object (spec.md §3, "content-interned"). The table itself holds only
    /// a weak reference — see `intern`'s doc comment.
    pub fn alloc_str(&mut self, s: &str) -> VmResult<Value> {
        if let Some(&v) = self.intern.get(s) {
            return Ok(v);
        }
        let value = self.alloc(ObjectKind::Str, HeapObject::Str(s.to_string()))?;
        self.intern.insert(s.to_string().into_boxed_str(), value);
        Ok(value)
    }

    pub fn make_array(&mut self, elements: Vec<Value>) -> VmResult<Value> {
        self.alloc(ObjectKind::Array, HeapObject::Array(elements))
    }

    pub fn make_map(&mut self) -> VmResult<Value> {
        self.alloc(ObjectKind::Map, HeapObject::Map(Default::default()))
    }

    /// Wrap a compiled chunk as a top-level, non-closing callable bound to
    /// the global environment. Front-end compilation (deciding which
    /// variables a nested function closes over) is out of scope; this and
    /// [`Vm::make_closure`] are the host-level constructors that stand in
    /// for it.
    pub fn make_function(&mut self, name: impl Into<String>, chunk: Rc<Chunk>) -> VmResult<Value> {
        let environment = self.global_env;
        self.alloc(
            ObjectKind::Function,
            HeapObject::Function(Function {
                name: name.into(),
                chunk,
                upvalues: Vec::new(),
                environment,
            }),
        )
    }

    /// Create a closure over the *currently executing* frame's registers
    /// `capture_registers`. Re-capturing a register already captured by an
    /// earlier closure from the same still-active frame reuses that
    /// upvalue object, so sibling closures observe each other's writes.
    pub fn make_closure(
        &mut self,
        name: impl Into<String>,
        chunk: Rc<Chunk>,
        capture_registers: &[u8],
    ) -> VmResult<Value> {
        let mut upvalues = Vec::with_capacity(capture_registers.len());
        for &r in capture_registers {
            let abs = self.stack.absolute_register(r)?;
            let existing = self.stack.current_frame()?.find_open_upvalue(abs);
            let up_value = match existing {
                Some(v) => v,
                None => {
                    let current = self.stack.reg(r)?;
                    let up = self.alloc(
                        ObjectKind::Upvalue,
                        HeapObject::Upvalue(Upvalue { value: current }),
                    )?;
                    self.stack.current_frame_mut()?.record_open_upvalue(abs, up);
                    up
                }
            };
            upvalues.push(up_value);
        }
        let environment = self.current_env;
        self.alloc(
            ObjectKind::Function,
            HeapObject::Function(Function {
                name: name.into(),
                chunk,
                upvalues,
                environment,
            }),
        )
    }

    /// Register a fresh module in the VM's registry (module *source*
    /// loading from disk is out of scope; the embedder hands in whatever
    /// source text it already has, or `None`). Returns the `Module` value,
    /// ready to receive exports via [`Vm::module_export`].
    pub fn register_module(&mut self, name: impl Into<String>, source: Option<Rc<str>>) -> VmResult<Value> {
        let name = name.into();
        let environment = self.alloc(
            ObjectKind::Environment,
            HeapObject::Environment(Environment {
                parent: Some(self.global_env),
                slots: Default::default(),
            }),
        )?;
        let module_value = self.alloc(
            ObjectKind::Module,
            HeapObject::Module(Module {
                name: name.clone(),
                exports: Default::default(),
                source,
                environment,
            }),
        )?;
        self.modules.insert(name, module_value);
        Ok(module_value)
    }

    pub fn module_export(&mut self, module: Value, name: &str, value: Value) -> VmResult<()> {
        let m_ref = self.require_kind(module, ObjectKind::Module, "module")?;
        unsafe {
            if let HeapObject::Module(m) = m_ref.data_mut() {
                m.exports.insert(name.to_string(), value);
            }
        }
        self.write_barrier(module, value);
        Ok(())
    }

    pub fn environment_get(&self, env: Value, name: &str) -> VmResult<Value> {
        self.env_get(env, name)
            .ok_or_else(|| VmError::NameError(name.to_string()))
    }

    pub fn environment_define(&mut self, env: Value, name: &str, value: Value) -> VmResult<()> {
        self.env_define(env, name, value)
    }

    /// Run `chunk` as a fresh top-level call with `args` bound to its
    /// parameters, pushing a brand-new entry frame.
    pub fn run(&mut self, chunk: Rc<Chunk>, args: &[Value]) -> VmResult<Value> {
        let function = self.make_function("<entry>", chunk)?;
        self.call_value(function, args)
    }

    /// Render a runtime error with a (name-only — no per-frame line
    /// tracking is kept across `run_frame`'s own instruction pointer) call
    /// stack, most-recent-call-first. Stack traces are optional scaffolding
    /// per spec.md §7; this is the "if provided" case.
    pub fn diagnostic(&self, error: VmError) -> crate::error::Diagnostic {
        let frames = self
            .stack
            .frames()
            .map(|f| crate::error::Frame {
                function_name: self.function_name(f.function),
                line: None,
            })
            .collect();
        crate::error::Diagnostic::with_frames(error, frames)
    }

    fn function_name(&self, v: Value) -> String {
        match unsafe { crate::gc::GcRef::from_value(v) } {
            Some(r) => match r.data() {
                HeapObject::Function(f) => f.name.clone(),
                HeapObject::NativeFunction(nf) => nf.name.clone(),
                _ => "<anonymous>".to_string(),
            },
            None => "<entry>".to_string(),
        }
    }

    /// Call any callable `Value` — guest `Function` or native — with
    /// already-evaluated arguments, returning its single result. This is
    /// the shared path used by the `Call` opcode, by [`Vm::run`], and by
    /// the scheduler draining a task.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let gc_ref = unsafe { crate::gc::GcRef::from_value(callee) }.ok_or_else(|| {
            VmError::TypeError(format!("value of type {} is not callable", callee.type_name()))
        })?;
        match gc_ref.data() {
            HeapObject::NativeFunction(_) => {
                let native = match gc_ref.data() {
                    HeapObject::NativeFunction(nf) => nf.clone(),
                    _ => unreachable!(),
                };
                ffi::call_native(self, &native, args)
            }
            HeapObject::Function(_) => {
                let (chunk, name, environment) = match gc_ref.data() {
                    HeapObject::Function(f) => (f.chunk.clone(), f.name.clone(), f.environment),
                    _ => unreachable!(),
                };
                let param_count = chunk.param_count() as usize;
                if args.len() != param_count {
                    return Err(VmError::ArityError {
                        name,
                        expected: param_count,
                        got: args.len(),
                    });
                }
                if self.gc.should_major_collect() {
                    self.collect_major();
                }
                let register_count = chunk.register_count() as usize;
                let jit_entry = if self.options.jit_enabled { chunk.jit_entry() } else { None };
                let prev_env = self.current_env;
                self.stack.push_frame(callee, chunk, register_count, 0, None, prev_env)?;
                for (i, &arg) in args.iter().enumerate() {
                    self.stack.set_reg(i as u8, arg)?;
                }
                self.current_env = environment;
                let result = match jit_entry {
                    Some(entry) => self.run_jit_entry(entry),
                    None => self.run_frame(),
                };
                self.current_env = prev_env;
                result
            }
            other => Err(VmError::TypeError(format!(
                "value of kind {:?} is not callable",
                other.kind()
            ))),
        }
    }

    fn collect_major(&mut self) {
        let intern = &mut self.intern;
        let mut roots = VmRoots {
            stack: &mut self.stack,
            extra: &mut self.extra_roots,
            global_env: &mut self.global_env,
            modules: &mut self.modules,
            struct_defs: &mut self.struct_defs,
            scheduler: &mut self.scheduler,
        };
        self.gc.major_collect_and(&mut roots, |lookup| {
            intern.retain(|_, v| match lookup(*v) {
                Some(new_v) => {
                    *v = new_v;
                    true
                }
                None => false,
            });
        });
    }

    fn write_barrier(&mut self, owner: Value, child: Value) {
        if let Some(owner_ref) = unsafe { crate::gc::GcRef::from_value(owner) } {
            self.gc.write_barrier(owner_ref, child);
        }
    }

    /// Write `value` into register `r` of the current frame, keeping any
    /// open upvalue captured from that register in sync (see
    /// [`Vm::make_closure`]).
    pub(crate) fn write_register(&mut self, r: u8, value: Value) -> VmResult<()> {
        self.stack.set_reg(r, value)?;
        let abs = self.stack.absolute_register(r)?;
        if let Some(up) = self.stack.current_frame()?.find_open_upvalue(abs) {
            if let Some(up_ref) = unsafe { crate::gc::GcRef::from_value(up) } {
                unsafe {
                    if let HeapObject::Upvalue(u) = up_ref.data_mut() {
                        u.value = value;
                    }
                }
                self.write_barrier(up, value);
            }
        }
        Ok(())
    }

    fn require_kind(&self, v: Value, kind: ObjectKind, what: &str) -> VmResult<crate::gc::GcRef> {
        let r = unsafe { crate::gc::GcRef::from_value(v) }
            .ok_or_else(|| VmError::TypeError(format!("expected {what}, got {}", v.type_name())))?;
        if r.kind() != kind {
            return Err(VmError::TypeError(format!("expected {what}, got {:?}", r.kind())));
        }
        Ok(r)
    }

    fn env_get(&self, env: Value, name: &str) -> Option<Value> {
        let env_ref = unsafe { crate::gc::GcRef::from_value(env) }?;
        match env_ref.data() {
            HeapObject::Environment(e) => e
                .slots
                .get(name)
                .copied()
                .or_else(|| e.parent.and_then(|p| self.env_get(p, name))),
            _ => None,
        }
    }

    fn env_set(&mut self, env: Value, name: &str, value: Value) -> VmResult<bool> {
        let env_ref = self.require_kind(env, ObjectKind::Environment, "environment")?;
        let has = matches!(env_ref.data(), HeapObject::Environment(e) if e.slots.contains_key(name));
        if has {
            unsafe {
                if let HeapObject::Environment(e) = env_ref.data_mut() {
                    e.slots.insert(name.to_string(), value);
                }
            }
            self.write_barrier(env, value);
            return Ok(true);
        }
        let parent = match env_ref.data() {
            HeapObject::Environment(e) => e.parent,
            _ => None,
        };
        match parent {
            Some(p) => self.env_set(p, name, value),
            None => Ok(false),
        }
    }

    fn env_define(&mut self, env: Value, name: &str, value: Value) -> VmResult<()> {
        let env_ref = self.require_kind(env, ObjectKind::Environment, "environment")?;
        unsafe {
            if let HeapObject::Environment(e) = env_ref.data_mut() {
                e.slots.insert(name.to_string(), value);
            }
        }
        self.write_barrier(env, value);
        Ok(())
    }

    fn const_name(&self, chunk: &Chunk, idx: u16) -> VmResult<String> {
        match chunk.constants().get(idx) {
            Some(Constant::Str(s)) => Ok(s.clone()),
            _ => Err(VmError::Internal(format!("constant {idx} is not a name string"))),
        }
    }

    fn as_numeric_f64(&self, v: Value) -> Option<f64> {
        if let Some(i) = v.as_int() {
            Some(i as f64)
        } else {
            v.as_float()
        }
    }

    fn is_string(&self, v: Value) -> bool {
        unsafe { crate::gc::GcRef::from_value(v) }
            .map(|r| r.kind() == ObjectKind::Str)
            .unwrap_or(false)
    }

    /// Ember's diagnostic stringification (spec.md §4.4 "Print"): integers
    /// without a fractional part, floats with round-trip precision, strings
    /// verbatim, booleans as `true`/`false`, nil as `nil`, composites
    /// bracketed.
    pub fn diagnostic_form(&self, v: Value) -> String {
        match v.tag() {
            ValueTag::Nil => "nil".to_string(),
            ValueTag::Bool => v.as_bool().unwrap().to_string(),
            ValueTag::Int => v.as_int().unwrap().to_string(),
            ValueTag::Float => format!("{}", v.as_float().unwrap()),
            ValueTag::Pointer => self.diagnostic_form_heap(v),
        }
    }

    fn diagnostic_form_heap(&self, v: Value) -> String {
        let Some(r) = (unsafe { crate::gc::GcRef::from_value(v) }) else {
            return "nil".to_string();
        };
        match r.data() {
            HeapObject::Str(s) => s.clone(),
            HeapObject::Array(items) => {
                let inner: Vec<String> = items.iter().map(|&e| self.diagnostic_form(e)).collect();
                format!("[{}]", inner.join(", "))
            }
            HeapObject::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, val)| format!("{}: {}", self.diagnostic_form(*k), self.diagnostic_form(*val)))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            HeapObject::StructDef(def) => format!("<struct {}>", def.name),
            HeapObject::StructInstance(inst) => {
                let struct_name = match unsafe { crate::gc::GcRef::from_value(inst.def) } {
                    Some(def_ref) => match def_ref.data() {
                        HeapObject::StructDef(def) => def.name.clone(),
                        _ => "?".to_string(),
                    },
                    None => "?".to_string(),
                };
                format!("{}{{...}}", struct_name)
            }
            HeapObject::Function(f) => format!("<function {}>", f.name),
            HeapObject::NativeFunction(nf) => format!("<native {}>", nf.name),
            HeapObject::Module(m) => format!("<module {}>", m.name),
            HeapObject::Environment(_) => "<environment>".to_string(),
            HeapObject::Future(f) => match &f.state {
                FutureState::Pending => "<future pending>".to_string(),
                FutureState::Resolved(_) => "<future resolved>".to_string(),
                FutureState::Rejected(_) => "<future rejected>".to_string(),
            },
            HeapObject::Resource(res) => format!("<resource {}>", res.type_name),
            HeapObject::Upvalue(u) => self.diagnostic_form(u.value),
        }
    }

    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.is_nil() || b.is_nil() {
            return a.is_nil() && b.is_nil();
        }
        if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
            return x == y;
        }
        if a.is_int() && b.is_int() {
            return a.as_int() == b.as_int();
        }
        if let (Some(fa), Some(fb)) = (self.as_numeric_f64(a), self.as_numeric_f64(b)) {
            return fa == fb;
        }
        if a.is_ptr() && b.is_ptr() {
            return a.raw_bits() == b.raw_bits();
        }
        false
    }

    pub(crate) fn binary_add(&mut self, b: Value, c: Value) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (b.as_int(), c.as_int()) {
            return Ok(match x.checked_add(y) {
                Some(sum) => Value::int(sum),
                None => Value::float(x as f64 + y as f64),
            });
        }
        if self.is_string(b) || self.is_string(c) {
            let combined = format!("{}{}", self.diagnostic_form(b), self.diagnostic_form(c));
            return self.alloc_str(&combined);
        }
        match (self.as_numeric_f64(b), self.as_numeric_f64(c)) {
            (Some(x), Some(y)) => Ok(Value::float(x + y)),
            _ => Err(VmError::TypeError(format!(
                "cannot add {} and {}",
                b.type_name(),
                c.type_name()
            ))),
        }
    }

    pub(crate) fn binary_numeric(
        &self,
        op_name: &str,
        b: Value,
        c: Value,
        int_op: impl Fn(i32, i32) -> Option<i32>,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (b.as_int(), c.as_int()) {
            return Ok(match int_op(x, y) {
                Some(r) => Value::int(r),
                None => Value::float(float_op(x as f64, y as f64)),
            });
        }
        match (self.as_numeric_f64(b), self.as_numeric_f64(c)) {
            (Some(x), Some(y)) => Ok(Value::float(float_op(x, y))),
            _ => Err(VmError::TypeError(format!(
                "cannot {op_name} {} and {}",
                b.type_name(),
                c.type_name()
            ))),
        }
    }

    pub(crate) fn binary_div(&self, b: Value, c: Value) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (b.as_int(), c.as_int()) {
            if y == 0 {
                return Err(VmError::ArithmeticError("division by zero".to_string()));
            }
            return Ok(if x % y == 0 {
                Value::int(x / y)
            } else {
                Value::float(x as f64 / y as f64)
            });
        }
        match (self.as_numeric_f64(b), self.as_numeric_f64(c)) {
            (Some(_), Some(y)) if y == 0.0 => Err(VmError::ArithmeticError("division by zero".to_string())),
            (Some(x), Some(y)) => Ok(Value::float(x / y)),
            _ => Err(VmError::TypeError(format!(
                "cannot divide {} and {}",
                b.type_name(),
                c.type_name()
            ))),
        }
    }

    pub(crate) fn binary_mod(&self, b: Value, c: Value) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (b.as_int(), c.as_int()) {
            if y == 0 {
                return Err(VmError::ArithmeticError("modulo by zero".to_string()));
            }
            return Ok(Value::int(x % y));
        }
        match (self.as_numeric_f64(b), self.as_numeric_f64(c)) {
            (Some(_), Some(y)) if y == 0.0 => Err(VmError::ArithmeticError("modulo by zero".to_string())),
            (Some(x), Some(y)) => Ok(Value::float(x % y)),
            _ => Err(VmError::TypeError(format!(
                "cannot take {} mod {}",
                b.type_name(),
                c.type_name()
            ))),
        }
    }

    pub(crate) fn unary_neg(&self, b: Value) -> VmResult<Value> {
        if let Some(x) = b.as_int() {
            return Ok(match x.checked_neg() {
                Some(r) => Value::int(r),
                None => Value::float(-(x as f64)),
            });
        }
        if let Some(f) = b.as_float() {
            return Ok(Value::float(-f));
        }
        Err(VmError::TypeError(format!("cannot negate {}", b.type_name())))
    }

    pub(crate) fn compare(&self, b: Value, c: Value) -> VmResult<std::cmp::Ordering> {
        match (self.as_numeric_f64(b), self.as_numeric_f64(c)) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| VmError::TypeError("cannot compare NaN".to_string())),
            _ => Err(VmError::TypeError(format!(
                "cannot compare {} and {}",
                b.type_name(),
                c.type_name()
            ))),
        }
    }

    fn get_property(&self, target: Value, name: &str) -> VmResult<Value> {
        let r = unsafe { crate::gc::GcRef::from_value(target) }
            .ok_or_else(|| VmError::TypeError(format!("cannot read property of {}", target.type_name())))?;
        match r.data() {
            HeapObject::StructInstance(inst) => {
                let def_ref = self.require_kind(inst.def, ObjectKind::StructDef, "struct definition")?;
                let def = match def_ref.data() {
                    HeapObject::StructDef(d) => d,
                    _ => unreachable!(),
                };
                Ok(def
                    .field_index(name)
                    .and_then(|i| inst.fields.get(i).copied())
                    .unwrap_or(Value::nil()))
            }
            HeapObject::Environment(e) => Ok(e.slots.get(name).copied().unwrap_or(Value::nil())),
            HeapObject::Module(m) => Ok(m.exports.get(name).copied().unwrap_or(Value::nil())),
            _ => Err(VmError::TypeError(format!(
                "value of kind {:?} has no properties",
                r.kind()
            ))),
        }
    }

    fn set_property(&mut self, target: Value, name: &str, value: Value) -> VmResult<()> {
        let r = unsafe { crate::gc::GcRef::from_value(target) }
            .ok_or_else(|| VmError::TypeError(format!("cannot set property of {}", target.type_name())))?;
        match r.data() {
            HeapObject::StructInstance(inst) => {
                let def_ref = self.require_kind(inst.def, ObjectKind::StructDef, "struct definition")?;
                let idx = match def_ref.data() {
                    HeapObject::StructDef(d) => d.field_index(name),
                    _ => unreachable!(),
                };
                let idx = idx.ok_or_else(|| VmError::NameError(format!("field '{name}'")))?;
                unsafe {
                    if let HeapObject::StructInstance(inst) = r.data_mut() {
                        inst.fields[idx] = value;
                    }
                }
                self.write_barrier(target, value);
                Ok(())
            }
            HeapObject::Environment(_) | HeapObject::Module(_) => {
                match r.data() {
                    HeapObject::Environment(_) => unsafe {
                        if let HeapObject::Environment(e) = r.data_mut() {
                            e.slots.insert(name.to_string(), value);
                        }
                    },
                    HeapObject::Module(_) => unsafe {
                        if let HeapObject::Module(m) = r.data_mut() {
                            m.exports.insert(name.to_string(), value);
                        }
                    },
                    _ => unreachable!(),
                }
                self.write_barrier(target, value);
                Ok(())
            }
            _ => Err(VmError::TypeError(format!(
                "value of kind {:?} has no settable properties",
                r.kind()
            ))),
        }
    }

    fn get_index(&self, target: Value, index: Value) -> VmResult<Value> {
        let r = unsafe { crate::gc::GcRef::from_value(target) }
            .ok_or_else(|| VmError::TypeError(format!("cannot index {}", target.type_name())))?;
        match r.data() {
            HeapObject::Array(items) => {
                let Some(i) = index.as_int() else {
                    return Err(VmError::TypeError("array index must be an int".to_string()));
                };
                if i < 0 || i as usize >= items.len() {
                    return Ok(Value::nil());
                }
                Ok(items[i as usize])
            }
            HeapObject::Map(map) => Ok(map.get(&index).copied().unwrap_or(Value::nil())),
            _ => Err(VmError::TypeError(format!("value of kind {:?} is not indexable", r.kind()))),
        }
    }

    fn set_index(&mut self, target: Value, index: Value, value: Value) -> VmResult<()> {
        let r = unsafe { crate::gc::GcRef::from_value(target) }
            .ok_or_else(|| VmError::TypeError(format!("cannot index {}", target.type_name())))?;
        match r.data() {
            HeapObject::Array(items) => {
                let Some(i) = index.as_int() else {
                    return Err(VmError::TypeError("array index must be an int".to_string()));
                };
                let len = items.len();
                if i < 0 || i as usize >= len {
                    return Err(VmError::IndexError { index: i as i64, len });
                }
                unsafe {
                    if let HeapObject::Array(items) = r.data_mut() {
                        items[i as usize] = value;
                    }
                }
                self.write_barrier(target, value);
                Ok(())
            }
            HeapObject::Map(_) => {
                unsafe {
                    if let HeapObject::Map(map) = r.data_mut() {
                        map.insert(index, value);
                    }
                }
                self.write_barrier(target, index);
                self.write_barrier(target, value);
                Ok(())
            }
            _ => Err(VmError::TypeError(format!("value of kind {:?} is not indexable", r.kind()))),
        }
    }

    fn read_string_array(&self, v: Value) -> VmResult<Vec<String>> {
        let r = self.require_kind(v, ObjectKind::Array, "array of names")?;
        let items = match r.data() {
            HeapObject::Array(items) => items.clone(),
            _ => unreachable!(),
        };
        items
            .into_iter()
            .map(|elem| {
                let elem_ref = self.require_kind(elem, ObjectKind::Str, "name")?;
                match elem_ref.data() {
                    HeapObject::Str(s) => Ok(s.clone()),
                    _ => unreachable!(),
                }
            })
            .collect()
    }

    fn struct_field_count(&self, def: Value) -> VmResult<usize> {
        let r = self.require_kind(def, ObjectKind::StructDef, "struct definition")?;
        match r.data() {
            HeapObject::StructDef(d) => Ok(d.field_names.len()),
            _ => unreachable!(),
        }
    }

    fn future_state(&self, v: Value) -> VmResult<FutureState> {
        let r = self.require_kind(v, ObjectKind::Future, "future")?;
        match r.data() {
            HeapObject::Future(f) => Ok(f.state.clone()),
            _ => unreachable!(),
        }
    }

    fn future_waker(&self, v: Value) -> VmResult<FutureWaker> {
        let r = self.require_kind(v, ObjectKind::Future, "future")?;
        match r.data() {
            HeapObject::Future(f) => Ok(f.waker.clone()),
            _ => unreachable!(),
        }
    }

    fn resolve_future(&mut self, future: Value, state: FutureState) -> VmResult<()> {
        let waker = self.future_waker(future)?;
        if let FutureState::Resolved(v) = &state {
            self.write_barrier(future, *v);
        }
        let r = self.require_kind(future, ObjectKind::Future, "future")?;
        unsafe {
            if let HeapObject::Future(f) = r.data_mut() {
                f.state = state;
            }
        }
        let (lock, cvar) = &*waker;
        let _guard = lock.lock();
        cvar.notify_all();
        Ok(())
    }

    /// Pop and run one queued task to completion, resolving (or rejecting)
    /// its future. Used by `await` to make cooperative progress; the
    /// embedder can also call this directly to pump the scheduler without
    /// an awaiting guest frame.
    pub fn run_one_task(&mut self) -> VmResult<()> {
        let task = self
            .scheduler
            .pop_next()
            .ok_or_else(|| VmError::Internal("run_one_task called with an empty queue".to_string()))?;
        let state = match self.call_value(task.callee, &task.args) {
            Ok(v) => FutureState::Resolved(v),
            Err(e) => FutureState::Rejected(e.to_string()),
        };
        self.resolve_future(task.future, state)
    }

    /// Offer `chunk` to the installed JIT backend once its hot counter
    /// crosses `VmOptions::jit_threshold`. A successful compile is installed
    /// for the chunk's *next* invocation through `call_value` — this never
    /// replaces the frame already running (there is no on-stack
    /// replacement); a rejection marks the chunk permanently ineligible so
    /// it isn't offered again on every later hot-counter trip.
    fn try_jit_compile(&mut self, chunk: &Rc<Chunk>) {
        let Some(backend) = self.jit.clone() else {
            return;
        };
        match backend.try_compile(chunk) {
            Ok(entry) => chunk.set_jit_entry(Some(entry)),
            Err(_reason) => chunk.mark_jit_ineligible(),
        }
    }

    /// Invoke a chunk's installed native entry point instead of
    /// interpreting it. `entry` is an address `ember-jit` produced and
    /// `Chunk::set_jit_entry` recorded; the frame for this call is already
    /// pushed by [`Vm::call_value`], exactly as [`Vm::run_frame`] expects it.
    fn run_jit_entry(&mut self, entry: usize) -> VmResult<Value> {
        let entry_fn: crate::vm::jit::JitEntryFn = unsafe { std::mem::transmute(entry) };
        let mut out_bits: u64 = 0;
        let status = unsafe { entry_fn(self as *mut Vm, &mut out_bits as *mut u64) };
        if status == 0 {
            Ok(Value::from_raw_bits(out_bits))
        } else {
            Err(self.jit_pending_error.take().unwrap_or_else(|| {
                VmError::Internal("jit-compiled code faulted without recording an error".to_string())
            }))
        }
    }

    /// Execute the chunk of the frame currently on top of the stack until
    /// it returns, halts, or faults. Any nested `Call` recurses through
    /// [`Vm::call_value`], so this only ever walks its *own* frame's
    /// instructions.
    fn run_frame(&mut self) -> VmResult<Value> {
        let mut ip: usize = 0;
        loop {
            let chunk = self.stack.current_frame()?.chunk.clone();
            let instrs = chunk.instructions();
            if ip >= instrs.len() {
                return Err(VmError::Internal(
                    "instruction pointer ran past the end of the chunk".to_string(),
                ));
            }
            let instr = instrs[ip];
            let op = instr
                .opcode()
                .ok_or_else(|| VmError::Internal(format!("unrecognized opcode byte {:#x}", instr.opcode_byte())))?;
            ip += 1;

            match op {
                Opcode::Nop => {}
                Opcode::Move => {
                    let v = self.stack.reg(instr.b())?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::LoadConst => {
                    let constant = chunk
                        .constants()
                        .get(instr.bx())
                        .ok_or_else(|| VmError::Internal("constant index out of range".to_string()))?
                        .clone();
                    let value = match &constant {
                        Constant::Str(s) => self.alloc_str(s)?,
                        other => Value::from(other),
                    };
                    self.write_register(instr.a(), value)?;
                }
                Opcode::LoadImmSmall => {
                    self.write_register(instr.a(), Value::int(instr.sbx() as i32))?;
                }
                Opcode::LoadNil => self.write_register(instr.a(), Value::nil())?,
                Opcode::LoadTrue => self.write_register(instr.a(), Value::bool(true))?,
                Opcode::LoadFalse => self.write_register(instr.a(), Value::bool(false))?,
                Opcode::GetUpvalue => {
                    let func_ref = unsafe { crate::gc::GcRef::from_value(self.stack.current_frame()?.function) }
                        .ok_or_else(|| VmError::Internal("current frame has no function object".to_string()))?;
                    let up = match func_ref.data() {
                        HeapObject::Function(f) => f
                            .upvalues
                            .get(instr.bx() as usize)
                            .copied()
                            .ok_or_else(|| VmError::Internal("upvalue index out of range".to_string()))?,
                        _ => return Err(VmError::Internal("current frame's function is not a closure".to_string())),
                    };
                    let up_ref = self.require_kind(up, ObjectKind::Upvalue, "upvalue")?;
                    let value = match up_ref.data() {
                        HeapObject::Upvalue(u) => u.value,
                        _ => unreachable!(),
                    };
                    self.write_register(instr.a(), value)?;
                }
                Opcode::SetUpvalue => {
                    let value = self.stack.reg(instr.a())?;
                    let func_ref = unsafe { crate::gc::GcRef::from_value(self.stack.current_frame()?.function) }
                        .ok_or_else(|| VmError::Internal("current frame has no function object".to_string()))?;
                    let up = match func_ref.data() {
                        HeapObject::Function(f) => f
                            .upvalues
                            .get(instr.bx() as usize)
                            .copied()
                            .ok_or_else(|| VmError::Internal("upvalue index out of range".to_string()))?,
                        _ => return Err(VmError::Internal("current frame's function is not a closure".to_string())),
                    };
                    let up_ref = self.require_kind(up, ObjectKind::Upvalue, "upvalue")?;
                    unsafe {
                        if let HeapObject::Upvalue(u) = up_ref.data_mut() {
                            u.value = value;
                        }
                    }
                    self.write_barrier(up, value);
                }
                Opcode::GetGlobal => {
                    let name = self.const_name(&chunk, instr.bx())?;
                    let value = self
                        .env_get(self.global_env, &name)
                        .ok_or_else(|| VmError::NameError(name))?;
                    self.write_register(instr.a(), value)?;
                }
                Opcode::SetGlobal => {
                    let name = self.const_name(&chunk, instr.bx())?;
                    let value = self.stack.reg(instr.a())?;
                    if !self.env_set(self.global_env, &name, value)? {
                        return Err(VmError::NameError(name));
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.const_name(&chunk, instr.bx())?;
                    let value = self.stack.reg(instr.a())?;
                    self.env_define(self.global_env, &name, value)?;
                }
                Opcode::Add => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let v = self.binary_add(b, c)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Sub => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let v = self.binary_numeric("subtract", b, c, i32::checked_sub, |x, y| x - y)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Mul => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let v = self.binary_numeric("multiply", b, c, i32::checked_mul, |x, y| x * y)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Div => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let v = self.binary_div(b, c)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Mod => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let v = self.binary_mod(b, c)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Neg => {
                    let b = self.stack.reg(instr.b())?;
                    let v = self.unary_neg(b)?;
                    self.write_register(instr.a(), v)?;
                }
                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let ord = self.compare(b, c)?;
                    let result = match op {
                        Opcode::Lt => ord.is_lt(),
                        Opcode::Le => ord.is_le(),
                        Opcode::Gt => ord.is_gt(),
                        Opcode::Ge => ord.is_ge(),
                        _ => unreachable!(),
                    };
                    self.write_register(instr.a(), Value::bool(result))?;
                }
                Opcode::Eq => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let eq = self.values_equal(b, c);
                    self.write_register(instr.a(), Value::bool(eq))?;
                }
                Opcode::Ne => {
                    let b = self.stack.reg(instr.b())?;
                    let c = self.stack.reg(instr.c())?;
                    let eq = self.values_equal(b, c);
                    self.write_register(instr.a(), Value::bool(!eq))?;
                }
                Opcode::Not => {
                    let b = self.stack.reg(instr.b())?;
                    self.write_register(instr.a(), Value::bool(!b.is_truthy()))?;
                }
                Opcode::Jump => {
                    ip = (ip as i64 + instr.sbx() as i64) as usize;
                }
                Opcode::JumpIfFalse => {
                    let cond = self.stack.reg(instr.a())?;
                    if !cond.is_truthy() {
                        ip = (ip as i64 + instr.sbx() as i64) as usize;
                    }
                }
                Opcode::JumpIfTrue => {
                    let cond = self.stack.reg(instr.a())?;
                    if cond.is_truthy() {
                        ip = (ip as i64 + instr.sbx() as i64) as usize;
                    }
                }
                Opcode::LoopJump => {
                    let target = (ip as i64 + instr.sbx() as i64) as u32;
                    let count = chunk.bump_hot_counter(target);
                    ip = target as usize;
                    if self.gc.should_major_collect() {
                        self.collect_major();
                    }
                    if self.options.jit_enabled
                        && chunk.jit_entry().is_none()
                        && !chunk.is_jit_ineligible()
                    {
                        if let Some(count) = count {
                            if count >= self.options.jit_threshold {
                                self.try_jit_compile(&chunk);
                            }
                        }
                    }
                }
                Opcode::LoopHeader => {
                    chunk.register_loop_header(ip as u32 - 1);
                }
                Opcode::Call => {
                    let a = instr.a();
                    let ext = instrs[ip];
                    ip += 1;
                    let argc = (ext.raw() >> 16) as u16;
                    let resultc = (ext.raw() & 0xFFFF) as u16;
                    let callee = self.stack.reg(a)?;
                    let mut args = Vec::with_capacity(argc as usize);
                    for i in 1..=argc {
                        args.push(self.stack.reg(a.wrapping_add(i as u8))?);
                    }
                    let result = self.call_value(callee, &args)?;
                    if resultc > 0 {
                        self.write_register(a, result)?;
                        for i in 1..resultc {
                            self.write_register(a.wrapping_add(i as u8), Value::nil())?;
                        }
                    }
                }
                Opcode::Return => {
                    let a = instr.a();
                    let ext = instrs[ip];
                    let resultc = ext.raw();
                    let result = if resultc > 0 { self.stack.reg(a)? } else { Value::nil() };
                    self.stack.pop_frame()?;
                    return Ok(result);
                }
                Opcode::ReturnNil => {
                    self.stack.pop_frame()?;
                    return Ok(Value::nil());
                }
                Opcode::GetProp => {
                    let name = self.const_name(&chunk, instr.c() as u16)?;
                    let target = self.stack.reg(instr.b())?;
                    let value = self.get_property(target, &name)?;
                    self.write_register(instr.a(), value)?;
                }
                Opcode::SetProp => {
                    let name = self.const_name(&chunk, instr.c() as u16)?;
                    let target = self.stack.reg(instr.a())?;
                    let value = self.stack.reg(instr.b())?;
                    self.set_property(target, &name, value)?;
                }
                Opcode::GetIndex => {
                    let target = self.stack.reg(instr.b())?;
                    let index = self.stack.reg(instr.c())?;
                    let value = self.get_index(target, index)?;
                    self.write_register(instr.a(), value)?;
                }
                Opcode::SetIndex => {
                    let target = self.stack.reg(instr.a())?;
                    let index = self.stack.reg(instr.b())?;
                    let value = self.stack.reg(instr.c())?;
                    self.set_index(target, index, value)?;
                }
                Opcode::NewArray => {
                    let a = instr.a();
                    let ext = instrs[ip];
                    ip += 1;
                    let n = ext.raw();
                    let mut elems = Vec::with_capacity(n as usize);
                    for i in 1..=n {
                        elems.push(self.stack.reg(a.wrapping_add(i as u8))?);
                    }
                    let value = self.make_array(elems)?;
                    self.write_register(a, value)?;
                }
                Opcode::NewMap => {
                    let value = self.make_map()?;
                    self.write_register(instr.a(), value)?;
                }
                Opcode::NewStruct => {
                    let a = instr.a();
                    let name = self.const_name(&chunk, instr.bx())?;
                    let def_value = *self
                        .struct_defs
                        .get(&name)
                        .ok_or_else(|| VmError::NameError(name.clone()))?;
                    let arity = self.struct_field_count(def_value)?;
                    let mut fields = Vec::with_capacity(arity);
                    for i in 1..=arity as u8 {
                        fields.push(self.stack.reg(a.wrapping_add(i))?);
                    }
                    let value = self.alloc(
                        ObjectKind::StructInstance,
                        HeapObject::StructInstance(StructInstance { def: def_value, fields }),
                    )?;
                    self.write_register(a, value)?;
                }
                Opcode::DefineStruct => {
                    let a = instr.a();
                    let name = self.const_name(&chunk, instr.bx())?;
                    let names_array = self.stack.reg(a)?;
                    let field_names = self.read_string_array(names_array)?;
                    let value = self.alloc(
                        ObjectKind::StructDef,
                        HeapObject::StructDef(StructDef {
                            name: name.clone(),
                            field_names,
                        }),
                    )?;
                    self.struct_defs.insert(name, value);
                    self.write_register(a, value)?;
                }
                Opcode::GetPropWide => {
                    let a = instr.a();
                    let name = self.const_name(&chunk, instr.bx())?;
                    let target = self.stack.reg(a)?;
                    let value = self.get_property(target, &name)?;
                    self.write_register(a, value)?;
                }
                Opcode::SetPropWide => {
                    let a = instr.a();
                    let name = self.const_name(&chunk, instr.bx())?;
                    let ext = instrs[ip];
                    ip += 1;
                    let value_reg = ext.raw() as u8;
                    let target = self.stack.reg(a)?;
                    let value = self.stack.reg(value_reg)?;
                    self.set_property(target, &name, value)?;
                }
                Opcode::ArrayPush => {
                    let target = self.stack.reg(instr.a())?;
                    let value = self.stack.reg(instr.b())?;
                    let r = self.require_kind(target, ObjectKind::Array, "array")?;
                    unsafe {
                        if let HeapObject::Array(items) = r.data_mut() {
                            items.push(value);
                        }
                    }
                    self.write_barrier(target, value);
                }
                Opcode::ArrayPop => {
                    let target = self.stack.reg(instr.b())?;
                    let r = self.require_kind(target, ObjectKind::Array, "array")?;
                    let popped = unsafe {
                        match r.data_mut() {
                            HeapObject::Array(items) => items.pop(),
                            _ => unreachable!(),
                        }
                    };
                    let popped = popped.ok_or(VmError::IndexError { index: -1, len: 0 })?;
                    self.write_register(instr.a(), popped)?;
                }
                Opcode::ArrayLen => {
                    let target = self.stack.reg(instr.b())?;
                    let r = self.require_kind(target, ObjectKind::Array, "array")?;
                    let len = match r.data() {
                        HeapObject::Array(items) => items.len(),
                        _ => unreachable!(),
                    };
                    self.write_register(instr.a(), Value::int(len as i32))?;
                }
                Opcode::ForeachPrepare => {
                    let container = self.stack.reg(instr.b())?;
                    let state = self.make_array(vec![container, Value::int(0)])?;
                    self.write_register(instr.a(), state)?;
                }
                Opcode::ForeachNext => {
                    let a = instr.a();
                    let state = self.stack.reg(a)?;
                    let state_ref = self.require_kind(state, ObjectKind::Array, "iterator state")?;
                    let (container, idx) = match state_ref.data() {
                        HeapObject::Array(items) => (items[0], items[1].as_int().unwrap_or(0)),
                        _ => unreachable!(),
                    };
                    let exhausted;
                    let mut next_idx = idx;
                    if let Some(container_ref) = unsafe { crate::gc::GcRef::from_value(container) } {
                        match container_ref.data() {
                            HeapObject::Array(items) => {
                                if (idx as usize) < items.len() {
                                    let element = items[idx as usize];
                                    self.write_register(a + 1, element)?;
                                    self.write_register(a + 2, Value::int(idx))?;
                                    next_idx = idx + 1;
                                    exhausted = false;
                                } else {
                                    exhausted = true;
                                }
                            }
                            HeapObject::Map(map) => {
                                if let Some((k, v)) = map.iter().nth(idx as usize) {
                                    let (k, v) = (*k, *v);
                                    self.write_register(a + 1, v)?;
                                    self.write_register(a + 2, k)?;
                                    next_idx = idx + 1;
                                    exhausted = false;
                                } else {
                                    exhausted = true;
                                }
                            }
                            _ => return Err(VmError::TypeError("foreach target is not iterable".to_string())),
                        }
                    } else {
                        exhausted = true;
                    }
                    if exhausted {
                        ip = (ip as i64 + instr.sbx() as i64) as usize;
                    } else {
                        unsafe {
                            if let HeapObject::Array(items) = state_ref.data_mut() {
                                items[1] = Value::int(next_idx);
                            }
                        }
                    }
                }
                Opcode::Import => {
                    let name = self.const_name(&chunk, instr.bx())?;
                    let module = self
                        .modules
                        .get(&name)
                        .copied()
                        .ok_or_else(|| VmError::NameError(name))?;
                    self.write_register(instr.a(), module)?;
                }
                Opcode::AsyncCall => {
                    let b = instr.b();
                    let c = instr.c();
                    let callee = self.stack.reg(b)?;
                    let mut args = Vec::with_capacity(c as usize);
                    for i in 1..=c {
                        args.push(self.stack.reg(b.wrapping_add(i))?);
                    }
                    let future = self.alloc(ObjectKind::Future, HeapObject::Future(FutureObject::pending()))?;
                    if self.scheduler.enqueue(callee, args, future).is_none() {
                        return Err(VmError::ResourceExhaustion("scheduler task limit reached".to_string()));
                    }
                    self.write_register(instr.a(), future)?;
                }
                Opcode::Await => {
                    let future_value = self.stack.reg(instr.b())?;
                    loop {
                        match self.future_state(future_value)? {
                            FutureState::Resolved(v) => {
                                self.write_register(instr.a(), v)?;
                                break;
                            }
                            FutureState::Rejected(msg) => return Err(VmError::Internal(msg)),
                            FutureState::Pending => {
                                if self.scheduler.is_empty() {
                                    return Err(VmError::Internal(
                                        "await deadlock: no pending task can resolve this future".to_string(),
                                    ));
                                }
                                self.run_one_task()?;
                            }
                        }
                    }
                }
                Opcode::Print => {
                    let v = self.stack.reg(instr.a())?;
                    let text = self.diagnostic_form(v);
                    writeln!(self.stdout, "{text}")
                        .map_err(|e| VmError::Internal(format!("print failed: {e}")))?;
                }
                Opcode::Halt => {
                    self.stack.pop_frame()?;
                    return Ok(Value::nil());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::{Chunk, Instr};

    fn vm() -> Vm {
        Vm::new(VmOptions::default())
    }

    fn chunk_returning(reg_count: u8, build: impl FnOnce(&mut Chunk)) -> Rc<Chunk> {
        let mut chunk = Chunk::new("test");
        chunk.set_register_count(reg_count);
        chunk.set_param_count(0);
        build(&mut chunk);
        Rc::new(chunk)
    }

    #[test]
    fn hot_loop_counts_to_completion_and_bumps_the_header_counter() {
        let mut vm = vm();
        // r0 = x (0); r1 = limit (1000); r2 = step (1); r3 = comparison scratch.
        // loop: r3 = r0 < r1; if !r3 jump end; r0 = r0 + r2; loop-jump back to header.
        let chunk = chunk_returning(4, |c| {
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1); // r0 = 0
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, 1_000), 1); // r1 = 1000
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 2, 1), 1); // r2 = 1
            let header = c.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 2);
            c.emit(Instr::abc(Opcode::Lt, 3, 0, 1), 2); // r3 = r0 < r1
            let jump_if_false = c.emit(Instr::asbx(Opcode::JumpIfFalse, 3, 0), 2);
            c.emit(Instr::abc(Opcode::Add, 0, 0, 2), 3); // r0 = r0 + r2
            let loop_jump = c.emit(Instr::asbx(Opcode::LoopJump, 0, 0), 3);
            let end = c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 4);
            c.emit(Instr::from_raw(1), 4); // Return's result-count word

            c.patch(
                jump_if_false,
                Instr::asbx(Opcode::JumpIfFalse, 3, (end - (jump_if_false + 1)) as i16),
            );
            c.patch(
                loop_jump,
                Instr::asbx(Opcode::LoopJump, 0, (header as i64 - (loop_jump + 1) as i64) as i16),
            );
            c.register_loop_header(header);
        });

        let function = vm.make_function("count", chunk.clone()).unwrap();
        let result = vm.call_value(function, &[]).unwrap();
        assert_eq!(result.as_int(), Some(1_000));

        // The header's hot counter advanced once per completed loop body.
        let header_idx = chunk
            .instructions()
            .iter()
            .position(|i| i.opcode() == Some(Opcode::LoopHeader))
            .unwrap() as u32;
        assert_eq!(chunk.hot_counter(header_idx), 1_000);
    }

    #[test]
    fn add_widens_to_float_on_overflow() {
        let mut vm = vm();
        let result = vm.binary_add(Value::int(i32::MAX), Value::int(1)).unwrap();
        assert_eq!(result.as_float(), Some(i32::MAX as f64 + 1.0));
    }

    #[test]
    fn add_concatenates_when_either_operand_is_a_string() {
        let mut vm = vm();
        let s = vm.alloc_str("n=").unwrap();
        let result = vm.binary_add(s, Value::int(5)).unwrap();
        assert_eq!(vm.diagnostic_form(result), "n=5");
    }

    #[test]
    fn division_widens_to_float_when_not_exact() {
        let vm = vm();
        let result = vm.binary_div(Value::int(7), Value::int(2)).unwrap();
        assert_eq!(result.as_float(), Some(3.5));
        let exact = vm.binary_div(Value::int(6), Value::int(2)).unwrap();
        assert_eq!(exact.as_int(), Some(3));
    }

    #[test]
    fn division_by_zero_is_an_arithmetic_error() {
        let vm = vm();
        assert!(matches!(
            vm.binary_div(Value::int(1), Value::int(0)),
            Err(VmError::ArithmeticError(_))
        ));
    }

    #[test]
    fn truthiness_matches_ember_rules() {
        assert!(Value::int(0).is_truthy());
        assert!(Value::float(0.0).is_truthy());
        assert!(!Value::bool(false).is_truthy());
        assert!(!Value::nil().is_truthy());
    }

    #[test]
    fn string_interning_dedups_equal_content() {
        let mut vm = vm();
        let a = vm.alloc_str("hello").unwrap();
        let b = vm.alloc_str("hello").unwrap();
        assert_eq!(a.raw_bits(), b.raw_bits());
        assert!(vm.values_equal(a, b));
    }

    #[test]
    fn calling_with_wrong_arity_is_an_arity_error() {
        let mut vm = vm();
        let chunk = chunk_returning(1, |c| {
            c.set_param_count(1);
            c.emit(Instr::abc(Opcode::ReturnNil, 0, 0, 0), 1);
        });
        let function = vm.make_function("f", chunk).unwrap();
        let err = vm.call_value(function, &[]).unwrap_err();
        assert!(matches!(err, VmError::ArityError { expected: 1, got: 0, .. }));
    }

    #[test]
    fn array_push_pop_and_len_round_trip() {
        let mut vm = vm();
        let arr = vm.make_array(vec![Value::int(1), Value::int(2)]).unwrap();
        vm.set_index(arr, Value::int(0), Value::int(10)).unwrap();
        assert_eq!(vm.get_index(arr, Value::int(0)).unwrap().as_int(), Some(10));
        assert_eq!(vm.get_index(arr, Value::int(99)).unwrap(), Value::nil());
    }

    #[test]
    fn map_miss_returns_nil_and_write_creates_binding() {
        let mut vm = vm();
        let map = vm.make_map().unwrap();
        assert_eq!(vm.get_index(map, Value::int(1)).unwrap(), Value::nil());
        vm.set_index(map, Value::int(1), Value::int(42)).unwrap();
        assert_eq!(vm.get_index(map, Value::int(1)).unwrap().as_int(), Some(42));
    }

    #[test]
    fn closure_counter_survives_outer_frame_return() {
        let mut vm = vm();
        // Outer chunk: r0 = 0 (the captured counter); make a closure over r0
        // and return it. We build the closure by hand since compilation is
        // out of scope; `make_closure` stands in for the compiler's
        // would-be `MakeClosure` sequence.
        let inner_chunk = chunk_returning(2, |c| {
            // r0 holds the result of GetUpvalue(0); increment and store back.
            c.set_param_count(0);
            c.emit(Instr::abx(Opcode::GetUpvalue, 0, 0), 1);
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, 1), 1);
            c.emit(Instr::abc(Opcode::Add, 0, 0, 1), 1);
            c.emit(Instr::abx(Opcode::SetUpvalue, 0, 0), 1);
            c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 1);
            c.emit(Instr::from_raw(1), 1);
        });

        let outer_chunk = chunk_returning(1, |c| {
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1); // r0 = 0 (captured)
            c.emit(Instr::abc(Opcode::ReturnNil, 0, 0, 0), 1);
        });
        let outer = vm.make_function("make", outer_chunk).unwrap();

        // Drive the outer frame manually so make_closure sees it as "current".
        vm.call_value(outer, &[]).unwrap();
        // call_value already popped the frame; instead build the closure
        // inline by pushing a frame ourselves to exercise capture.
        let make_chunk = chunk_returning(1, |c| {
            c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1);
        });
        let make_fn = vm.make_function("scope", make_chunk).unwrap();
        let environment = vm.global_environment();
        let prev = environment;
        vm.stack
            .push_frame(make_fn, match unsafe { crate::gc::GcRef::from_value(make_fn) }.unwrap().data() {
                HeapObject::Function(f) => f.chunk.clone(),
                _ => unreachable!(),
            }, 1, 0, None, prev)
            .unwrap();
        vm.stack.set_reg(0, Value::int(0)).unwrap();
        let closure = vm.make_closure("counter", inner_chunk, &[0]).unwrap();
        vm.stack.pop_frame().unwrap();

        assert_eq!(vm.call_value(closure, &[]).unwrap().as_int(), Some(1));
        assert_eq!(vm.call_value(closure, &[]).unwrap().as_int(), Some(2));
        assert_eq!(vm.call_value(closure, &[]).unwrap().as_int(), Some(3));
    }
}
