//! End-to-end encode/decode/verify coverage spanning the whole crate
//! surface, as opposed to the per-module unit tests inside `src/`.

use ember_bytecode::{verify_chunk, Chunk, Constant, Instr, Opcode, VerifyError};

fn arithmetic_chunk() -> Chunk {
    // r2 = r0 + r1, where r0 and r1 come from the constant pool.
    let mut chunk = Chunk::new("add_two");
    chunk.set_register_count(3);
    chunk.set_param_count(0);
    chunk.constants_mut().push(Constant::Int(19));
    chunk.constants_mut().push(Constant::Int(23));
    chunk.emit(Instr::abx(Opcode::LoadConst, 0, 0), 1);
    chunk.emit(Instr::abx(Opcode::LoadConst, 1, 1), 1);
    chunk.emit(Instr::abc(Opcode::Add, 2, 0, 1), 2);
    chunk.emit(Instr::abc(Opcode::Return, 2, 0, 0), 3);
    chunk.emit(Instr::from_raw(1), 3);
    chunk
}

#[test]
fn chunk_round_trips_through_encode_and_decode() {
    let chunk = arithmetic_chunk();
    let bytes = chunk.encode();
    let decoded = Chunk::decode(&bytes).expect("a freshly encoded chunk must decode");

    assert_eq!(decoded.name(), "add_two");
    assert_eq!(decoded.register_count(), 3);
    assert_eq!(decoded.instructions().len(), 5);
    assert_eq!(decoded.constants().len(), 2);
    verify_chunk(&decoded).expect("a well-formed chunk must pass verification");
}

#[test]
fn verify_rejects_a_register_out_of_range() {
    let mut chunk = Chunk::new("bad_register");
    chunk.set_register_count(1);
    // Register 5 doesn't exist in a one-register frame.
    chunk.emit(Instr::abc(Opcode::Move, 5, 0, 0), 1);

    assert!(matches!(
        verify_chunk(&chunk),
        Err(VerifyError::RegisterOutOfRange(0, 5, 1))
    ));
}

#[test]
fn verify_rejects_a_jump_outside_the_instruction_stream() {
    let mut chunk = Chunk::new("bad_jump");
    chunk.set_register_count(1);
    chunk.emit(Instr::asbx(Opcode::Jump, 0, 100), 1);

    assert!(matches!(verify_chunk(&chunk), Err(VerifyError::JumpOutOfRange(0, _))));
}

#[test]
fn verify_rejects_loop_jump_into_a_non_header() {
    let mut chunk = Chunk::new("bad_loop_jump");
    chunk.set_register_count(1);
    chunk.emit(Instr::abc(Opcode::Nop, 0, 0, 0), 1);
    chunk.emit(Instr::asbx(Opcode::LoopJump, 0, -2), 2); // targets instruction 0, never a LoopHeader

    assert!(matches!(
        verify_chunk(&chunk),
        Err(VerifyError::LoopJumpMissingHeader(1, 0))
    ));
}

#[test]
fn a_chunk_with_a_registered_loop_header_verifies() {
    let mut chunk = Chunk::new("good_loop");
    chunk.set_register_count(1);
    let header = chunk.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 1);
    chunk.register_loop_header(header);
    chunk.emit(Instr::asbx(Opcode::LoopJump, 0, -2), 2); // back to instruction 0

    verify_chunk(&chunk).expect("looping back to a registered header is valid");
}

#[test]
fn hot_counters_round_trip_through_encode_and_decode() {
    let mut chunk = Chunk::new("hot");
    chunk.set_register_count(1);
    let header = chunk.emit(Instr::abc(Opcode::LoopHeader, 0, 0, 0), 1);
    chunk.register_loop_header(header);
    chunk.bump_hot_counter(header);
    chunk.bump_hot_counter(header);

    let decoded = Chunk::decode(&chunk.encode()).unwrap();
    assert_eq!(decoded.hot_counter(header), 2);
}
