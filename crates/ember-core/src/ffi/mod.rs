//! Native Extension Bridge: the contract host-provided functions follow to
//! become first-class callable `Value`s inside the guest.
//!
//! A native function's signature (`vm: &mut Vm, args: &[Value]) ->
//! VmResult<Value>`) already carries the "VM pointer + argument values +
//! count" calling convention — `args.len()` is the count, no separate
//! pointer/length pair needed the way a C ABI would require. Errors are
//! signaled the ordinary Rust way, by returning `Err`; the interpreter
//! observes that immediately after the call returns and propagates it.

use crate::error::{VmError, VmResult};
use crate::object::{Environment, HeapObject, NativeFn, NativeFunction, ObjectKind};
use crate::value::Value;
use crate::vm::Vm;

/// One native function awaiting registration: its guest-visible name,
/// declared arity (`None` means variadic), and the Rust function pointer
/// that implements it.
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub name: &'static str,
    pub arity: Option<usize>,
    pub func: NativeFn,
}

impl NativeEntry {
    pub const fn new(name: &'static str, arity: Option<usize>, func: NativeFn) -> Self {
        Self { name, arity, func }
    }
}

/// Register a batch of native functions into `target_env` (typically the
/// VM's global environment, but any `Environment` heap value works — a
/// module's top-level scope, for instance). Each entry becomes a heap
/// `NativeFunction` bound under its name. Returns the number of names
/// registered, per the native extension contract.
pub fn register_natives(vm: &mut Vm, target_env: Value, entries: &[NativeEntry]) -> VmResult<usize> {
    let mut registered = 0;
    for entry in entries {
        let value = vm.alloc(
            ObjectKind::NativeFunction,
            HeapObject::NativeFunction(NativeFunction {
                name: entry.name.to_string(),
                arity: entry.arity,
                func: entry.func,
            }),
        )?;
        vm.environment_define(target_env, entry.name, value)?;
        registered += 1;
    }
    Ok(registered)
}

/// Invoke a native function with the bridge's rooting discipline: `args`
/// are already rooted by the caller's register window (the interpreter's
/// operand stack), so the callee only needs to root values it allocates
/// itself and hasn't yet returned or stored.
pub fn call_native(vm: &mut Vm, native: &NativeFunction, args: &[Value]) -> VmResult<Value> {
    if let Some(expected) = native.arity {
        if args.len() != expected {
            return Err(VmError::ArityError {
                name: native.name.clone(),
                expected,
                got: args.len(),
            });
        }
    }
    (native.func)(vm, args)
}

/// Build a fresh, parentless `Environment` heap value — the shape every
/// module's top-level scope and the VM's global scope share.
pub fn new_environment(vm: &mut Vm, parent: Option<Value>) -> VmResult<Value> {
    vm.alloc(
        ObjectKind::Environment,
        HeapObject::Environment(Environment {
            parent,
            slots: Default::default(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    fn native_identity(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
        Ok(args[0])
    }

    #[test]
    fn registering_natives_returns_count_and_binds_names() {
        let mut vm = Vm::new(VmOptions::default());
        let global = vm.global_environment();
        let entries = [NativeEntry::new("identity", Some(1), native_identity)];
        let count = register_natives(&mut vm, global, &entries).unwrap();
        assert_eq!(count, 1);
        let looked_up = vm.environment_get(global, "identity").unwrap();
        assert!(looked_up.is_ptr());
    }

    #[test]
    fn arity_mismatch_is_rejected_before_invoking() {
        let mut vm = Vm::new(VmOptions::default());
        let native = NativeFunction {
            name: "needs_one".to_string(),
            arity: Some(1),
            func: native_identity,
        };
        let err = call_native(&mut vm, &native, &[]).unwrap_err();
        assert!(matches!(err, VmError::ArityError { .. }));
    }
}
