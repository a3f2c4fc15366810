// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Throw, catch, structured error maps, unwind bookkeeping.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::value::{Value, ValueKind};
use lattice_core::{BinaryOp, Expr, Item};

fn try_expr(body: Vec<lattice_core::Stmt>, catch: Vec<lattice_core::Stmt>) -> Expr {
    Expr::Try {
        body: block(body),
        catch_name: "e".to_string(),
        catch_body: block(catch),
        line: 1,
    }
}

#[test]
fn caught_error_exposes_message_line_and_stack() {
    // try { throw "boom" } catch e { e.message + "/" + to_string(e.line) }
    let (_, vm) = run_stmts(vec![let_s(
        "out",
        try_expr(
            vec![throw_s(string("boom"))],
            vec![expr_s(bin(
                BinaryOp::Add,
                bin(BinaryOp::Add, field(ident("e"), "message"), string("/")),
                call("to_string", vec![field(ident("e"), "line")]),
            ))],
        ),
    )]);
    assert_eq!(vm.global("out"), Some(Value::str("boom/1")));
}

#[test]
fn error_stack_is_a_nonempty_array_of_strings() {
    let (_, vm) = run_stmts(vec![let_s(
        "stack",
        try_expr(
            vec![throw_s(string("boom"))],
            vec![expr_s(field(ident("e"), "stack"))],
        ),
    )]);
    let stack = vm.global("stack").unwrap();
    let ValueKind::Array(frames) = &stack.kind else {
        panic!("expected a stack array");
    };
    assert!(!frames.is_empty());
    for frame in frames {
        assert!(matches!(frame.kind, ValueKind::Str(_)));
    }
    // The innermost frame is the script.
    assert!(crate::value::print_value(&frames[0]).contains("<script>"));
}

#[test]
fn throw_from_a_called_function_unwinds_to_the_handler() {
    let (_, vm) = run(&program(vec![
        fn_item("detonate", &[], vec![throw_s(string("kaboom"))]),
        Item::Stmt(let_s(
            "out",
            try_expr(
                vec![expr_s(call("detonate", vec![]))],
                vec![expr_s(field(ident("e"), "message"))],
            ),
        )),
        // Execution continues normally after the catch.
        Item::Stmt(let_s("after", int(1))),
    ]));
    assert_eq!(vm.global("out"), Some(Value::str("kaboom")));
    assert_eq!(vm.global("after"), Some(Value::int(1)));
}

#[test]
fn function_frame_stack_appears_in_the_trace() {
    let (_, vm) = run(&program(vec![
        fn_item("detonate", &[], vec![throw_s(string("kaboom"))]),
        Item::Stmt(let_s(
            "stack",
            try_expr(
                vec![expr_s(call("detonate", vec![]))],
                vec![expr_s(field(ident("e"), "stack"))],
            ),
        )),
    ]));
    let stack = vm.global("stack").unwrap();
    let printed = crate::value::print_value(&stack);
    assert!(printed.contains("detonate()"), "{printed}");
}

#[test]
fn uncaught_string_passes_verbatim() {
    let err = run_stmts_err(vec![throw_s(string("plain message"))]);
    assert_eq!(err.message, "plain message");
    assert!(!err.stack.is_empty());
}

#[test]
fn uncaught_non_string_is_wrapped() {
    let err = run_stmts_err(vec![throw_s(int(7))]);
    assert_eq!(err.message, "unhandled exception: 7");
}

#[test]
fn vm_errors_route_through_handlers_too() {
    // Division by zero inside try lands in the catch as an error map.
    let (_, vm) = run_stmts(vec![
        let_s("z", int(0)),
        let_s(
            "out",
            try_expr(
                vec![expr_s(bin(BinaryOp::Div, int(1), ident("z")))],
                vec![expr_s(field(ident("e"), "message"))],
            ),
        ),
    ]);
    assert_eq!(vm.global("out"), Some(Value::str("division by zero")));
}

#[test]
fn nested_try_unwinds_to_the_innermost_handler() {
    let inner = try_expr(
        vec![throw_s(string("inner boom"))],
        vec![expr_s(string("inner caught"))],
    );
    let (_, vm) = run_stmts(vec![let_s(
        "out",
        try_expr(
            vec![let_s("r", inner), throw_s(string("outer boom"))],
            vec![expr_s(field(ident("e"), "message"))],
        ),
    )]);
    assert_eq!(vm.global("out"), Some(Value::str("outer boom")));
}

#[test]
fn rethrow_from_catch_propagates() {
    let err = run_stmts_err(vec![expr_s(try_expr(
        vec![throw_s(string("first"))],
        vec![throw_s(string("second"))],
    ))]);
    assert_eq!(err.message, "second");
}

#[test]
fn thrown_non_string_value_reaches_catch_in_message_slot() {
    let (_, vm) = run_stmts(vec![let_s(
        "out",
        try_expr(
            vec![throw_s(array(vec![int(1), int(2)]))],
            vec![expr_s(field(ident("e"), "message"))],
        ),
    )]);
    assert_eq!(
        vm.global("out"),
        Some(Value::array(vec![Value::int(1), Value::int(2)]))
    );
}

#[test]
fn undefined_variable_suggests_similar_names() {
    let err = run_stmts_err(vec![
        let_s("counter", int(1)),
        expr_s(ident("countr")),
    ]);
    assert_eq!(
        err.message,
        "undefined variable 'countr' (did you mean 'counter'?)"
    );
}

#[test]
fn unknown_method_suggests_similar_names() {
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(method(ident("xs"), "psuh", vec![int(2)])),
    ]);
    assert_eq!(
        err.message,
        "unknown method 'psuh' on Array (did you mean 'push'?)"
    );
}
