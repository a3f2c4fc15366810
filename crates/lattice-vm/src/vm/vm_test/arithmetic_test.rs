// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Arithmetic, comparison, and string concatenation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::bytecode::{encode_abc, encode_abx, encode_asbx, op, Chunk};
use crate::value::{Region, Value, ValueKind};
use lattice_core::{BinaryOp, Expr, Stmt};
use std::sync::Arc;

// --- Register arithmetic ---

#[test]
fn folded_let_is_queryable() {
    // let x = 1 + 2 * 3: top level returns Unit, x holds 7.
    let (result, vm) = run_stmts(vec![let_s(
        "x",
        bin(BinaryOp::Add, int(1), bin(BinaryOp::Mul, int(2), int(3))),
    )]);
    assert_eq!(result, Value::unit());
    assert_eq!(vm.global("x"), Some(Value::int(7)));
}

#[test]
fn runtime_arithmetic_on_variables() {
    let (_, vm) = run_stmts(vec![
        let_s("a", int(10)),
        let_s("b", int(4)),
        let_s("sum", bin(BinaryOp::Add, ident("a"), ident("b"))),
        let_s("diff", bin(BinaryOp::Sub, ident("a"), ident("b"))),
        let_s("prod", bin(BinaryOp::Mul, ident("a"), ident("b"))),
        let_s("quot", bin(BinaryOp::Div, ident("a"), ident("b"))),
        let_s("rem", bin(BinaryOp::Mod, ident("a"), ident("b"))),
    ]);
    assert_eq!(vm.global("sum"), Some(Value::int(14)));
    assert_eq!(vm.global("diff"), Some(Value::int(6)));
    assert_eq!(vm.global("prod"), Some(Value::int(40)));
    assert_eq!(vm.global("quot"), Some(Value::int(2)));
    assert_eq!(vm.global("rem"), Some(Value::int(2)));
}

#[test]
fn mixed_numeric_promotes_to_float() {
    let (_, vm) = run_stmts(vec![let_s(
        "x",
        bin(BinaryOp::Add, int(1), float(0.5)),
    )]);
    assert_eq!(vm.global("x"), Some(Value::float(1.5)));
}

#[test]
fn division_by_zero_raises() {
    let err = run_stmts_err(vec![
        let_s("z", int(0)),
        expr_s(bin(BinaryOp::Div, int(1), ident("z"))),
    ]);
    assert_eq!(err.message, "division by zero");
}

#[test]
fn type_error_names_both_operands() {
    let err = run_stmts_err(vec![
        let_s("s", string("hi")),
        expr_s(bin(BinaryOp::Add, ident("s"), int(1))),
    ]);
    assert_eq!(err.message, "cannot add Str and Int");
}

// --- Strings ---

#[test]
fn string_addition_concatenates() {
    let (_, vm) = run_stmts(vec![let_s(
        "s",
        bin(BinaryOp::Add, string("foo"), string("bar")),
    )]);
    assert_eq!(vm.global("s"), Some(Value::str("foobar")));
}

#[test]
fn concat_opcode_stringifies_into_the_ephemeral_region() {
    // Hand-assembled chunk: CONCAT stringifies both operands. The
    // compiler reserves it for interpolation, so drive it directly.
    let mut chunk = Chunk::new(None);
    let long = "x".repeat(80);
    let k = chunk.add_constant(Value::str(&long)).unwrap();
    chunk.emit(encode_abx(op::LOADK, 1, k), 1);
    chunk.emit(encode_asbx(op::LOADI, 2, 42), 1);
    chunk.emit(encode_abc(op::CONCAT, 1, 1, 2), 1);
    chunk.emit(encode_abc(op::HALT, 1, 0, 0), 1);
    chunk.max_reg = 3;

    let mut vm = crate::vm::Vm::new();
    let result = vm.run_chunk(Arc::new(chunk)).unwrap();
    let ValueKind::Str(s) = &result.kind else {
        panic!("expected a string");
    };
    assert_eq!(s.as_ref(), format!("{long}42"));
    assert_eq!(result.region, Region::Ephemeral);
}

// --- Comparison ---

#[test]
fn comparisons_on_runtime_values() {
    let (_, vm) = run_stmts(vec![
        let_s("a", int(3)),
        let_s("lt", bin(BinaryOp::Lt, ident("a"), int(5))),
        let_s("ge", bin(BinaryOp::GtEq, ident("a"), int(5))),
        let_s("eq", bin(BinaryOp::Eq, ident("a"), int(3))),
        let_s("ne", bin(BinaryOp::Neq, ident("a"), int(3))),
    ]);
    assert_eq!(vm.global("lt"), Some(Value::bool(true)));
    assert_eq!(vm.global("ge"), Some(Value::bool(false)));
    assert_eq!(vm.global("eq"), Some(Value::bool(true)));
    assert_eq!(vm.global("ne"), Some(Value::bool(false)));
}

#[test]
fn string_ordering() {
    let (_, vm) = run_stmts(vec![let_s(
        "lt",
        bin(BinaryOp::Lt, string("abc"), string("abd")),
    )]);
    assert_eq!(vm.global("lt"), Some(Value::bool(true)));
}

#[test]
fn incomparable_types_raise() {
    let err = run_stmts_err(vec![
        let_s("a", array(vec![int(1)])),
        expr_s(bin(BinaryOp::Lt, ident("a"), int(1))),
    ]);
    assert_eq!(err.message, "cannot compare Array and Int");
}

// --- Logic and control flow ---

#[test]
fn if_expression_produces_a_value() {
    let (_, vm) = run_stmts(vec![let_s(
        "x",
        Expr::If {
            cond: Box::new(bin(BinaryOp::Lt, int(1), int(2))),
            then_block: block(vec![expr_s(string("yes"))]),
            else_branch: Some(Box::new(block_expr(vec![expr_s(string("no"))]))),
            line: 1,
        },
    )]);
    assert_eq!(vm.global("x"), Some(Value::str("yes")));
}

#[test]
fn logical_and_short_circuits() {
    // false && (1 / 0) must not evaluate the right side.
    let (_, vm) = run_stmts(vec![let_s(
        "x",
        Expr::Logical {
            op: lattice_core::LogicalOp::And,
            lhs: Box::new(boolean(false)),
            rhs: Box::new(bin(BinaryOp::Div, int(1), ident("zero"))),
            line: 1,
        },
    )]);
    assert_eq!(vm.global("x"), Some(Value::bool(false)));
}

#[test]
fn nil_coalesce_picks_the_fallback() {
    let (_, vm) = run_stmts(vec![let_s(
        "x",
        Expr::NilCoalesce {
            lhs: Box::new(nil()),
            rhs: Box::new(int(9)),
            line: 1,
        },
    )]);
    assert_eq!(vm.global("x"), Some(Value::int(9)));
}

#[test]
fn while_loop_counts() {
    let (_, vm) = run_stmts(vec![
        let_s("n", int(0)),
        Stmt::While {
            cond: bin(BinaryOp::Lt, ident("n"), int(5)),
            body: block(vec![assign_s("n", bin(BinaryOp::Add, ident("n"), int(1)))]),
            line: 1,
        },
    ]);
    assert_eq!(vm.global("n"), Some(Value::int(5)));
}

#[test]
fn range_for_accumulates() {
    let (_, vm) = run_stmts(vec![
        let_s("total", int(0)),
        Stmt::For {
            var: "i".to_string(),
            iter: Expr::Range {
                start: Box::new(int(0)),
                end: Box::new(int(5)),
                line: 1,
            },
            body: block(vec![assign_s(
                "total",
                bin(BinaryOp::Add, ident("total"), ident("i")),
            )]),
            line: 1,
        },
    ]);
    assert_eq!(vm.global("total"), Some(Value::int(10)));
}
