//! End-to-end coverage: build a `Chunk` by hand (no compiler in this crate),
//! hand it to a fresh `Vm`, and check the value that comes back out — as
//! opposed to the per-module unit tests inside `src/`, which exercise one
//! piece (the GC, the stack, a single opcode) in isolation.

use ember_bytecode::{Chunk, Constant, Instr, Opcode};
use ember_core::{Value, Vm, VmOptions};
use std::rc::Rc;

fn chunk(register_count: u8, build: impl FnOnce(&mut Chunk)) -> Rc<Chunk> {
    let mut chunk = Chunk::new("test");
    chunk.set_register_count(register_count);
    chunk.set_param_count(0);
    build(&mut chunk);
    Rc::new(chunk)
}

#[test]
fn runs_a_straight_line_arithmetic_chunk() {
    let mut vm = Vm::new(VmOptions::default());
    // r2 = (10 - 3) * 2
    let c = chunk(3, |c| {
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 10), 1);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, 3), 1);
        c.emit(Instr::abc(Opcode::Sub, 0, 0, 1), 2);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, 2), 3);
        c.emit(Instr::abc(Opcode::Mul, 2, 0, 1), 3);
        c.emit(Instr::abc(Opcode::Return, 2, 0, 0), 4);
        c.emit(Instr::from_raw(1), 4);
    });

    let result = vm.run(c, &[]).expect("should run without error");
    assert_eq!(result.as_int(), Some(14));
}

#[test]
fn runs_a_counting_loop_with_explicit_registers() {
    let mut vm = Vm::new(VmOptions::default());
    // r0 = counter, r1 = limit (5), r2 = step (1), r3 = comparison scratch.
    // while r0 < r1 { r0 = r0 + r2 }; return r0
    let c = chunk(4, |c| {
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, 5), 1);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 2, 1), 1);
        let header = c.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 2);
        c.register_loop_header(header);
        c.emit(Instr::abc(Opcode::Lt, 3, 0, 1), 3); // r3 = r0 < r1
        let branch = c.emit(Instr::asbx(Opcode::JumpIfFalse, 3, 0), 3); // patched below
        c.emit(Instr::abc(Opcode::Add, 0, 0, 2), 4); // r0 = r0 + r2
        let back = -((c.instructions().len() as i32 + 1) - header as i32) as i16;
        c.emit(Instr::asbx(Opcode::LoopJump, 0, back), 5);
        let exit = c.instructions().len() as i32;
        let fwd = (exit - (branch as i32 + 1)) as i16;
        c.patch(branch, Instr::asbx(Opcode::JumpIfFalse, 3, fwd));
        c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 6);
        c.emit(Instr::from_raw(1), 6);
    });

    let result = vm.run(c, &[]).expect("should run without error");
    assert_eq!(result.as_int(), Some(5));
}

#[test]
fn arity_mismatch_surfaces_as_a_vm_error() {
    let mut vm = Vm::new(VmOptions::default());
    let c = chunk(1, |c| {
        c.set_param_count(1);
        c.emit(Instr::abc(Opcode::ReturnNil, 0, 0, 0), 1);
    });
    let function = vm.make_function("needs_one_arg", c).unwrap();
    let err = vm.call_value(function, &[]).unwrap_err();
    assert!(matches!(
        &err,
        ember_core::VmError::ArityError { expected: 1, got: 0, .. }
    ));
    let diagnostic = vm.diagnostic(err);
    assert!(diagnostic.frames.is_empty());
}

#[test]
fn strings_allocated_via_a_constant_round_trip_through_a_chunk() {
    let mut vm = Vm::new(VmOptions::default());
    let c = chunk(1, |c| {
        c.constants_mut().push(Constant::Str("hello".to_string()));
        c.emit(Instr::abx(Opcode::LoadConst, 0, 0), 1);
        c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 2);
        c.emit(Instr::from_raw(1), 2);
    });

    let result = vm.run(c, &[]).unwrap();
    let expected = vm.alloc_str("hello").unwrap();
    assert!(vm.values_equal(result, expected));
}

#[test]
fn passing_arguments_populates_the_callee_parameter_registers() {
    let mut vm = Vm::new(VmOptions::default());
    // Single parameter in r0; return it unchanged.
    let c = chunk(1, |c| {
        c.set_param_count(1);
        c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 1);
        c.emit(Instr::from_raw(1), 1);
    });

    let result = vm.run(c, &[Value::int(99)]).unwrap();
    assert_eq!(result.as_int(), Some(99));
}
