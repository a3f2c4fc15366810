// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Scope/spawn and select.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Instant;

use crate::testutil::*;
use crate::value::Value;
use lattice_core::{BinaryOp, Block, Expr, SelectArm, SelectArmKind};

fn scope_expr(body: Vec<lattice_core::Stmt>, spawns: Vec<Vec<lattice_core::Stmt>>) -> Expr {
    Expr::Scope {
        body: Block { stmts: body, line: 1 },
        spawns: spawns
            .into_iter()
            .map(|stmts| Block { stmts, line: 1 })
            .collect(),
        line: 1,
    }
}

fn select_expr(arms: Vec<SelectArm>) -> Expr {
    Expr::Select { arms, line: 1 }
}

fn chan_arm(chan: Expr, binding: Option<&str>, body: Vec<lattice_core::Stmt>) -> SelectArm {
    SelectArm {
        kind: SelectArmKind::Channel(chan),
        binding: binding.map(str::to_string),
        body: Block { stmts: body, line: 1 },
        line: 1,
    }
}

fn timeout_arm(ms: i64, body: Vec<lattice_core::Stmt>) -> SelectArm {
    SelectArm {
        kind: SelectArmKind::Timeout(int(ms)),
        binding: None,
        body: Block { stmts: body, line: 1 },
        line: 1,
    }
}

fn default_arm(body: Vec<lattice_core::Stmt>) -> SelectArm {
    SelectArm {
        kind: SelectArmKind::Default,
        binding: None,
        body: Block { stmts: body, line: 1 },
        line: 1,
    }
}

// --- scope / spawn ---

#[test]
fn scope_value_is_the_sync_body_value() {
    let (_, vm) = run_stmts(vec![let_s(
        "y",
        scope_expr(vec![expr_s(int(42))], vec![]),
    )]);
    assert_eq!(vm.global("y"), Some(Value::int(42)));
}

#[test]
fn spawned_threads_send_results_over_a_channel() {
    // let ch = channel(); scope { spawn { ch.send(1) } spawn { ch.send(1) } }
    // then drain two messages.
    let (_, vm) = run_stmts(vec![
        let_s("ch", call("channel", vec![])),
        expr_s(scope_expr(
            vec![],
            vec![
                vec![expr_s(method(ident("ch"), "send", vec![int(1)]))],
                vec![expr_s(method(ident("ch"), "send", vec![int(1)]))],
            ],
        )),
        let_s(
            "total",
            bin(
                BinaryOp::Add,
                method(ident("ch"), "recv", vec![]),
                method(ident("ch"), "recv", vec![]),
            ),
        ),
    ]);
    assert_eq!(vm.global("total"), Some(Value::int(2)));
}

#[test]
fn spawn_sees_parent_locals_as_globals() {
    // fn f() { let n = 5; let ch = channel();
    //          scope { spawn { ch.send(n + 1) } } ch.recv() }
    let (_, vm) = run(&crate::testutil::program(vec![
        crate::testutil::fn_item("f", &[], vec![
            let_s("n", int(5)),
            let_s("ch", call("channel", vec![])),
            expr_s(scope_expr(
                vec![],
                vec![vec![expr_s(method(
                    ident("ch"),
                    "send",
                    vec![bin(BinaryOp::Add, ident("n"), int(1))],
                ))]],
            )),
            ret_s(method(ident("ch"), "recv", vec![])),
        ]),
        lattice_core::Item::Stmt(let_s("y", call("f", vec![]))),
    ]));
    assert_eq!(vm.global("y"), Some(Value::int(6)));
}

#[test]
fn first_spawn_error_becomes_the_scope_error() {
    let err = run_stmts_err(vec![expr_s(scope_expr(
        vec![],
        vec![vec![throw_s(string("child failed"))]],
    ))]);
    assert_eq!(err.message, "child failed");
}

#[test]
fn child_mutations_do_not_leak_into_the_parent() {
    // The child env is a snapshot; parent x is unchanged after the scope.
    let (_, vm) = run_stmts(vec![
        let_s("x", int(1)),
        expr_s(scope_expr(vec![], vec![vec![assign_s("x", int(99))]])),
        let_s("after", ident("x")),
    ]);
    assert_eq!(vm.global("after"), Some(Value::int(1)));
}

// --- select ---

#[test]
fn select_timeout_fires_after_the_deadline() {
    // Two channels, nothing sent: the timeout arm wins after >= 50ms.
    let start = Instant::now();
    let (_, vm) = run_stmts(vec![
        let_s("ch1", call("channel", vec![])),
        let_s("ch2", call("channel", vec![])),
        let_s(
            "out",
            select_expr(vec![
                chan_arm(ident("ch1"), None, vec![expr_s(string("one"))]),
                chan_arm(ident("ch2"), None, vec![expr_s(string("two"))]),
                timeout_arm(50, vec![expr_s(string("to"))]),
            ]),
        ),
    ]);
    assert_eq!(vm.global("out"), Some(Value::str("to")));
    assert!(start.elapsed().as_millis() >= 50);
}

#[test]
fn select_receives_a_ready_value_with_binding() {
    let (_, vm) = run_stmts(vec![
        let_s("ch", call("channel", vec![])),
        expr_s(method(ident("ch"), "send", vec![int(7)])),
        let_s(
            "out",
            select_expr(vec![chan_arm(
                ident("ch"),
                Some("v"),
                vec![expr_s(bin(BinaryOp::Add, ident("v"), int(1)))],
            )]),
        ),
    ]);
    assert_eq!(vm.global("out"), Some(Value::int(8)));
}

#[test]
fn select_default_runs_when_nothing_is_ready() {
    let (_, vm) = run_stmts(vec![
        let_s("ch", call("channel", vec![])),
        let_s(
            "out",
            select_expr(vec![
                chan_arm(ident("ch"), None, vec![expr_s(string("msg"))]),
                default_arm(vec![expr_s(string("idle"))]),
            ]),
        ),
    ]);
    assert_eq!(vm.global("out"), Some(Value::str("idle")));
}

#[test]
fn select_on_closed_channels_returns_unit_without_default() {
    let (result, vm) = run_stmts(vec![
        let_s("ch", call("channel", vec![])),
        expr_s(method(ident("ch"), "close", vec![])),
        let_s(
            "out",
            select_expr(vec![chan_arm(
                ident("ch"),
                None,
                vec![expr_s(string("msg"))],
            )]),
        ),
    ]);
    assert_eq!(result, Value::unit());
    assert_eq!(vm.global("out"), Some(Value::unit()));
}

#[test]
fn select_drains_a_buffered_message_before_timing_out() {
    let (_, vm) = run_stmts(vec![
        let_s("ch", call("channel", vec![])),
        expr_s(method(ident("ch"), "send", vec![int(1)])),
        let_s(
            "out",
            select_expr(vec![
                chan_arm(ident("ch"), None, vec![expr_s(string("got"))]),
                timeout_arm(5_000, vec![expr_s(string("to"))]),
            ]),
        ),
    ]);
    assert_eq!(vm.global("out"), Some(Value::str("got")));
}
