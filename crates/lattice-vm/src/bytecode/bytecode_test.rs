// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for instruction encoding and the chunk container.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

// --- Fixed encode/decode cases ---

#[test]
fn encode_decode_abc() {
    let cases = [
        (op::MOVE, 0u8, 0u8, 0u8),
        (op::ADD, 5, 10, 15),
        (op::GETFIELD, 255, 255, 255),
        (op::NEWARRAY, 128, 64, 32),
    ];

    for (opcode, a, b, c) in cases {
        let instr = encode_abc(opcode, a, b, c);
        assert_eq!(decode_opcode(instr), opcode, "opcode mismatch");
        assert_eq!(decode_a(instr), a, "A mismatch");
        assert_eq!(decode_b(instr), b, "B mismatch");
        assert_eq!(decode_c(instr), c, "C mismatch");
    }
}

#[test]
fn encode_decode_abx() {
    let cases = [
        (op::LOADK, 0u8, 0u16),
        (op::GETGLOBAL, 7, 12345),
        (op::IMPORT, 255, u16::MAX),
    ];

    for (opcode, a, bx) in cases {
        let instr = encode_abx(opcode, a, bx);
        assert_eq!(decode_opcode(instr), opcode);
        assert_eq!(decode_a(instr), a);
        assert_eq!(decode_bx(instr), bx);
    }
}

#[test]
fn signed_sbx_roundtrip() {
    for sbx in [-32768i16, -1, 0, 1, 42, 32767] {
        let instr = encode_asbx(op::JMPFALSE, 3, sbx);
        assert_eq!(decode_sbx(instr), sbx, "sBx {sbx}");
        assert_eq!(decode_a(instr), 3);
    }
}

#[test]
fn signed_sbx24_roundtrip() {
    for sbx in [-8_388_608i32, -100, -1, 0, 1, 100, 8_388_607] {
        let instr = encode_sbx24(op::JMP, sbx);
        assert_eq!(decode_sbx24(instr), sbx, "sBx24 {sbx}");
        assert_eq!(decode_opcode(instr), op::JMP);
    }
}

#[test]
fn signed_byte_immediate() {
    for sc in [-128i8, -1, 0, 1, 127] {
        #[expect(clippy::cast_sign_loss, reason = "two's complement byte")]
        let instr = encode_abc(op::ADDI, 1, 2, sc as u8);
        assert_eq!(decode_sc(instr), sc);
    }
}

// --- Chunk container ---

#[test]
fn chunk_starts_with_magic() {
    let chunk = Chunk::new(None);
    assert_eq!(chunk.magic, CHUNK_MAGIC);
}

#[test]
fn emit_tracks_lines() {
    let mut chunk = Chunk::new(Some("f".to_string()));
    chunk.emit(encode_abx(op::LOADK, 0, 0), 3);
    chunk.emit(encode_abc(op::RETURN, 0, 1, 0), 4);

    assert_eq!(chunk.code_len(), 2);
    assert_eq!(chunk.line_at(0), 3);
    assert_eq!(chunk.line_at(1), 4);
    assert_eq!(chunk.line_at(99), 0);
}

#[test]
fn constants_deduplicate_by_value() {
    let mut chunk = Chunk::new(None);
    let a = chunk.add_constant(Value::str("hello")).unwrap();
    let b = chunk.add_constant(Value::int(42)).unwrap();
    let c = chunk.add_constant(Value::str("hello")).unwrap();
    let d = chunk.add_constant(Value::int(42)).unwrap();
    let e = chunk.add_constant(Value::float(2.5)).unwrap();
    let f = chunk.add_constant(Value::float(2.5)).unwrap();

    assert_eq!(a, c);
    assert_eq!(b, d);
    assert_eq!(e, f);
    assert_eq!(chunk.constants.len(), 3);
}

#[test]
fn local_names_by_register_slot() {
    let mut chunk = Chunk::new(None);
    chunk.set_local_name(3, "xs");
    assert_eq!(chunk.local_name(3), Some("xs"));
    assert_eq!(chunk.local_name(0), None);
    assert_eq!(chunk.local_name(200), None);
}

// --- PIC slots ---

#[test]
fn pic_install_and_hit() {
    let chunk = Chunk::new(None);
    let hash = method_hash("push");

    assert_eq!(chunk.pic_lookup(10, 7, hash), None);

    chunk.pic_install(10, 7, hash, PicHandler::Builtin(3));
    assert_eq!(chunk.pic_lookup(10, 7, hash), Some(PicHandler::Builtin(3)));

    // Different receiver type at the same site: miss.
    assert_eq!(chunk.pic_lookup(10, 8, hash), None);

    // Replacement on type change.
    chunk.pic_install(10, 8, hash, PicHandler::NotBuiltin);
    assert_eq!(chunk.pic_lookup(10, 8, hash), Some(PicHandler::NotBuiltin));
    assert_eq!(chunk.pic_lookup(10, 7, hash), None);
}

#[test]
fn method_hash_is_stable_and_distinct() {
    assert_eq!(method_hash("push"), method_hash("push"));
    assert_ne!(method_hash("push"), method_hash("pop"));
}

// --- Property tests ---

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn abc_roundtrip(opcode in 0u8..=99, a: u8, b: u8, c: u8) {
            let instr = encode_abc(opcode, a, b, c);
            prop_assert_eq!(decode_opcode(instr), opcode);
            prop_assert_eq!(decode_a(instr), a);
            prop_assert_eq!(decode_b(instr), b);
            prop_assert_eq!(decode_c(instr), c);
        }

        #[test]
        fn abx_roundtrip(opcode in 0u8..=99, a: u8, bx: u16) {
            let instr = encode_abx(opcode, a, bx);
            prop_assert_eq!(decode_opcode(instr), opcode);
            prop_assert_eq!(decode_a(instr), a);
            prop_assert_eq!(decode_bx(instr), bx);
        }

        #[test]
        fn asbx_roundtrip(opcode in 0u8..=99, a: u8, sbx: i16) {
            let instr = encode_asbx(opcode, a, sbx);
            prop_assert_eq!(decode_sbx(instr), sbx);
            prop_assert_eq!(decode_a(instr), a);
        }

        #[test]
        fn sbx24_roundtrip(opcode in 0u8..=99, sbx in -8_388_608i32..=8_388_607) {
            let instr = encode_sbx24(opcode, sbx);
            prop_assert_eq!(decode_sbx24(instr), sbx);
            prop_assert_eq!(decode_opcode(instr), opcode);
        }
    }
}
