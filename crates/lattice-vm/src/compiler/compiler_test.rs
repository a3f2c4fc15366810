// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the register compiler: emitted shapes, folding, peepholes,
//! register discipline, and jump patching.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::bytecode::{decode_b, decode_bx, decode_c, decode_opcode, decode_sbx, decode_sc};
use crate::testutil::*;
use crate::value::{Callee, ValueKind};
use lattice_core::{BinaryOp, Item, Stmt};

/// Opcodes of a chunk in order.
fn opcodes(chunk: &Chunk) -> Vec<u8> {
    chunk.code.iter().map(|i| decode_opcode(*i)).collect()
}

fn find(chunk: &Chunk, opcode: u8) -> Option<u32> {
    chunk
        .code
        .iter()
        .copied()
        .find(|i| decode_opcode(*i) == opcode)
}

// --- Constant folding ---

#[test]
fn folds_integer_expression_to_immediate() {
    // let x = 1 + 2 * 3 compiles the folded 7 as a single LOADI.
    let chunk = compile(&stmts_program(vec![let_s(
        "x",
        bin(
            BinaryOp::Add,
            int(1),
            bin(BinaryOp::Mul, int(2), int(3)),
        ),
    )]))
    .unwrap();

    let loadi = find(&chunk, op::LOADI).expect("LOADI emitted");
    assert_eq!(decode_sbx(loadi), 7);
    // No arithmetic survives folding.
    assert!(find(&chunk, op::ADD).is_none());
    assert!(find(&chunk, op::MUL).is_none());
    assert!(find(&chunk, op::DEFINEGLOBAL).is_some());
}

#[test]
fn folds_integer_comparisons() {
    let chunk = compile(&stmts_program(vec![expr_s(bin(
        BinaryOp::Lt,
        int(1),
        int(2),
    ))]))
    .unwrap();
    assert!(find(&chunk, op::LOADTRUE).is_some());
    assert!(find(&chunk, op::LT).is_none());
}

#[test]
fn division_by_zero_is_not_folded() {
    let chunk = compile(&stmts_program(vec![expr_s(bin(
        BinaryOp::Div,
        int(1),
        int(0),
    ))]))
    .unwrap();
    assert!(find(&chunk, op::DIV).is_some());
}

// --- Literal loads ---

#[test]
fn small_ints_use_inline_immediate() {
    let chunk = compile(&stmts_program(vec![expr_s(int(-32768)), expr_s(int(32767))])).unwrap();
    assert!(find(&chunk, op::LOADI).is_some());
    assert!(find(&chunk, op::LOADK).is_none());
}

#[test]
fn large_ints_use_the_constant_pool() {
    let chunk = compile(&stmts_program(vec![expr_s(int(100_000))])).unwrap();
    assert!(find(&chunk, op::LOADI).is_none());
    let loadk = find(&chunk, op::LOADK).expect("LOADK emitted");
    let constant = &chunk.constants[decode_bx(loadk) as usize];
    assert_eq!(constant.as_int(), Some(100_000));
}

// --- Peepholes ---

#[test]
fn add_with_byte_literal_uses_addi() {
    let chunk = compile(&stmts_program(vec![
        let_s("n", int(1)),
        expr_s(bin(BinaryOp::Add, ident("n"), int(5))),
    ]))
    .unwrap();
    let addi = find(&chunk, op::ADDI).expect("ADDI emitted");
    assert_eq!(decode_sc(addi), 5);
}

#[test]
fn binary_operands_use_separate_temporaries() {
    let chunk = compile(&stmts_program(vec![
        let_s("a", int(1000)),
        let_s("b", int(2000)),
        expr_s(bin(BinaryOp::Sub, ident("a"), ident("b"))),
    ]))
    .unwrap();
    let sub = find(&chunk, op::SUB).expect("SUB emitted");
    assert_ne!(decode_b(sub), decode_c(sub));
}

#[test]
fn range_for_uses_specialized_counter_loop() {
    let chunk = compile(&stmts_program(vec![Stmt::For {
        var: "i".to_string(),
        iter: Expr::Range {
            start: Box::new(int(0)),
            end: Box::new(int(10)),
            line: 1,
        },
        body: block(vec![expr_s(ident("i"))]),
        line: 1,
    }]))
    .unwrap();
    assert!(find(&chunk, op::LT_INT).is_some());
    assert!(find(&chunk, op::INC_REG).is_some());
    assert!(find(&chunk, op::ITERINIT).is_none());
}

// --- Jumps ---

#[test]
fn if_branches_jump_over_each_other() {
    let chunk = compile(&stmts_program(vec![expr_s(Expr::If {
        cond: Box::new(boolean(true)),
        then_block: block(vec![expr_s(int(1))]),
        else_branch: Some(Box::new(block_expr(vec![expr_s(int(2))]))),
        line: 1,
    })]))
    .unwrap();

    let ops = opcodes(&chunk);
    assert!(ops.contains(&op::JMPFALSE));
    assert!(ops.contains(&op::JMP));

    // The JMPFALSE lands on a valid instruction boundary.
    let at = ops.iter().position(|o| *o == op::JMPFALSE).unwrap();
    let offset = decode_sbx(chunk.code[at]);
    let target = (at as i64 + 1 + i64::from(offset)) as usize;
    assert!(target < chunk.code.len());
}

#[test]
fn match_range_pattern_funnels_through_trampoline() {
    let chunk = compile(&stmts_program(vec![expr_s(Expr::Match {
        scrutinee: Box::new(int(5)),
        arms: vec![lattice_core::MatchArm {
            pattern: lattice_core::MatchPattern::Range { start: 1, end: 9 },
            guard: None,
            body: block(vec![expr_s(string("hit"))]),
            line: 1,
        }],
        line: 1,
    })]))
    .unwrap();

    let ops = opcodes(&chunk);
    assert!(ops.contains(&op::GTEQ));
    assert!(ops.contains(&op::LTEQ));
    assert!(ops.contains(&op::LOADFALSE)); // the trampoline
    assert!(ops.contains(&op::LOADNIL)); // the exhaustiveness default
}

// --- Functions and closures ---

#[test]
fn fn_declaration_defines_a_global_closure() {
    let chunk = compile(&program(vec![fn_item(
        "double",
        &["x"],
        vec![ret_s(bin(BinaryOp::Add, ident("x"), ident("x")))],
    )]))
    .unwrap();

    assert!(find(&chunk, op::CLOSURE).is_some());
    assert!(find(&chunk, op::DEFINEGLOBAL).is_some());

    // The prototype constant carries the sub-chunk.
    let proto = chunk
        .constants
        .iter()
        .find(|c| matches!(c.kind, ValueKind::Closure(_)))
        .expect("prototype constant");
    let ValueKind::Closure(data) = &proto.kind else {
        panic!("expected closure");
    };
    let Callee::Chunk(sub) = &data.callee else {
        panic!("expected compiled prototype");
    };
    assert_eq!(sub.arity, 1);
    assert_eq!(sub.name.as_deref(), Some("double"));
    assert!(find(sub, op::RETURN).is_some());
}

#[test]
fn captured_locals_become_upvalue_descriptors() {
    // fn outer() { let a = 1; return |x| a }
    let inner = closure(&["x"], vec![ret_s(ident("a"))]);
    let chunk = compile(&program(vec![fn_item(
        "outer",
        &[],
        vec![let_s("a", int(1)), ret_s(inner)],
    )]))
    .unwrap();

    // Dig out the outer prototype, then the inner one.
    let outer = chunk
        .constants
        .iter()
        .find_map(|c| match &c.kind {
            ValueKind::Closure(d) => match &d.callee {
                Callee::Chunk(ch) => Some(ch),
                _ => None,
            },
            _ => None,
        })
        .expect("outer prototype");
    let inner_proto = outer
        .constants
        .iter()
        .find_map(|c| match &c.kind {
            ValueKind::Closure(d) => match &d.callee {
                Callee::Chunk(ch) => Some(ch),
                _ => None,
            },
            _ => None,
        })
        .expect("inner prototype");
    assert_eq!(inner_proto.upvalue_count, 1);

    // The CLOSURE instruction is followed by exactly one descriptor.
    let at = outer
        .code
        .iter()
        .position(|i| decode_opcode(*i) == op::CLOSURE)
        .unwrap();
    assert_eq!(decode_opcode(outer.code[at + 1]), op::DATA);
}

// --- Emission invariants ---

#[test]
fn all_constant_references_are_in_bounds() {
    let chunk = compile(&stmts_program(vec![
        let_s("s", string("hello")),
        expr_s(call("to_string", vec![ident("s")])),
    ]))
    .unwrap();
    for &instr in &chunk.code {
        let opcode = decode_opcode(instr);
        if matches!(opcode, op::LOADK | op::GETGLOBAL | op::DEFINEGLOBAL) {
            assert!((decode_bx(instr) as usize) < chunk.constants.len());
        }
    }
}

#[test]
fn export_list_lands_on_the_chunk() {
    let chunk = compile(&program(vec![
        Item::Export(vec!["add".to_string()]),
        fn_item("add", &["a", "b"], vec![ret_s(bin(
            BinaryOp::Add,
            ident("a"),
            ident("b"),
        ))]),
    ]))
    .unwrap();
    assert!(chunk.has_exports);
    assert_eq!(chunk.export_names, vec!["add".to_string()]);
}

// --- Errors ---

#[test]
fn break_outside_loop_is_rejected() {
    let result = compile(&stmts_program(vec![Stmt::Break { line: 3 }]));
    assert!(matches!(
        result,
        Err(CompileError::BreakOutsideLoop { line: 3 })
    ));
}

#[test]
fn continue_outside_loop_is_rejected() {
    let result = compile(&stmts_program(vec![Stmt::Continue { line: 4 }]));
    assert!(matches!(
        result,
        Err(CompileError::ContinueOutsideLoop { line: 4 })
    ));
}

// --- Disassembly ---

#[test]
fn disassemble_lists_code_and_constants() {
    let chunk = compile(&stmts_program(vec![
        let_s("x", int(100_000)),
        expr_s(bin(BinaryOp::Add, ident("x"), int(1))),
    ]))
    .unwrap();
    let listing = disassemble(&chunk);
    assert!(listing.contains("LOADK"));
    assert!(listing.contains("Constants:"));
    assert!(listing.contains("HALT"));
}
