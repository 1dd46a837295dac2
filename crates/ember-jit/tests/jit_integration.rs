//! End-to-end coverage of the installed pipeline: a hot loop compiled by
//! [`JitEngine`], cached, and then actually executed through
//! `ember_core::Vm::call_value`'s native-entry path — as opposed to the
//! per-module unit tests inside `src/`, which exercise the assembler, the
//! compiler, and the cache each in isolation.

use ember_bytecode::{Chunk, Instr, Opcode};
use ember_core::{Vm, VmOptions};
use ember_jit::JitEngine;
use std::rc::Rc;

/// `r0 = counter (0), r1 = limit, r2 = step (1), r3 = comparison scratch`.
/// `while r0 < r1 { r0 = r0 + r2 }; return r0`. Every opcode here is in
/// `Opcode::is_jit_tier1`, so this chunk is eligible for compilation.
fn counting_loop(limit: i16) -> Rc<Chunk> {
    let mut c = Chunk::new("count");
    c.set_register_count(4);
    c.set_param_count(0);
    c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1);
    c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, limit), 1);
    c.emit(Instr::asbx(Opcode::LoadImmSmall, 2, 1), 1);
    let header = c.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 2);
    c.register_loop_header(header);
    c.emit(Instr::abc(Opcode::Lt, 3, 0, 1), 3);
    let branch = c.emit(Instr::asbx(Opcode::JumpIfFalse, 3, 0), 3);
    c.emit(Instr::abc(Opcode::Add, 0, 0, 2), 4);
    let back = -((c.instructions().len() as i32 + 1) - header as i32) as i16;
    c.emit(Instr::asbx(Opcode::LoopJump, 0, back), 5);
    let exit = c.instructions().len() as i32;
    let fwd = (exit - (branch as i32 + 1)) as i16;
    c.patch(branch, Instr::asbx(Opcode::JumpIfFalse, 3, fwd));
    c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 6);
    c.emit(Instr::from_raw(1), 6);
    Rc::new(c)
}

#[test]
fn a_hot_loop_compiles_and_the_compiled_entry_agrees_with_the_interpreter() {
    let options = VmOptions {
        jit_threshold: 5,
        ..VmOptions::default()
    };
    let mut vm = Vm::new(options);
    vm.install_jit_backend(JitEngine::new());

    let chunk = counting_loop(10);

    // First call runs interpreted throughout (a chunk is only dispatched to
    // its compiled entry point at the *next* call), but its loop crosses
    // `jit_threshold` along the way and installs a JIT entry point.
    let first = vm.run(Rc::clone(&chunk), &[]).expect("interpreted run should succeed");
    assert_eq!(first.as_int(), Some(10));
    assert!(chunk.jit_entry().is_some(), "loop should have compiled after crossing the hot threshold");

    // Second call dispatches straight to the compiled native entry point.
    let second = vm.run(Rc::clone(&chunk), &[]).expect("jit-compiled run should succeed");
    assert_eq!(second.as_int(), Some(10));
}

#[test]
fn a_chunk_with_a_non_tier1_opcode_stays_interpreted_forever() {
    let options = VmOptions {
        jit_threshold: 3,
        ..VmOptions::default()
    };
    let mut vm = Vm::new(options);
    vm.install_jit_backend(JitEngine::new());
    let env = vm.global_environment();
    vm.environment_define(env, "x", ember_core::Value::int(7)).unwrap();

    // r0 = counter, r1 = limit, r2 = step, r3 = comparison scratch, r4 = the
    // global read on every iteration. GetGlobal isn't part of tier 1, so
    // this loop body can never compile, however many times it runs hot.
    let build = |limit: i16| {
        let mut c = Chunk::new("global_touch");
        c.set_register_count(5);
        c.constants_mut().push(ember_bytecode::Constant::Str("x".to_string()));
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 0, 0), 1);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 1, limit), 1);
        c.emit(Instr::asbx(Opcode::LoadImmSmall, 2, 1), 1);
        let header = c.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 2);
        c.register_loop_header(header);
        c.emit(Instr::abc(Opcode::Lt, 3, 0, 1), 3);
        let branch = c.emit(Instr::asbx(Opcode::JumpIfFalse, 3, 0), 3);
        c.emit(Instr::abx(Opcode::GetGlobal, 4, 0), 4);
        c.emit(Instr::abc(Opcode::Add, 0, 0, 2), 5);
        let back = -((c.instructions().len() as i32 + 1) - header as i32) as i16;
        c.emit(Instr::asbx(Opcode::LoopJump, 0, back), 6);
        let exit = c.instructions().len() as i32;
        let fwd = (exit - (branch as i32 + 1)) as i16;
        c.patch(branch, Instr::asbx(Opcode::JumpIfFalse, 3, fwd));
        c.emit(Instr::abc(Opcode::Return, 0, 0, 0), 7);
        c.emit(Instr::from_raw(1), 7);
        Rc::new(c)
    };

    let chunk = build(10);
    let first = vm.run(Rc::clone(&chunk), &[]).expect("interpreted run should succeed");
    assert_eq!(first.as_int(), Some(10));
    assert!(chunk.is_jit_ineligible(), "GetGlobal should have failed the compile attempt");
    assert!(chunk.jit_entry().is_none());

    // Still runs correctly on every later call — it just never leaves the
    // interpreter.
    let second = vm.run(Rc::clone(&chunk), &[]).expect("still-interpreted run should succeed");
    assert_eq!(second.as_int(), Some(10));
}
