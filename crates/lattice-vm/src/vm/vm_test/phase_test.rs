// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Phase opcodes: guards, named freeze with cascade and reactions,
//! seeds, pressures, anneal, crystallize/borrow, history.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::value::{Value, ValueKind};
use lattice_core::{BinaryOp, Expr, Item, Phase};

// --- Freeze guards ---

#[test]
fn push_to_fixed_array_raises_the_phase_message() {
    // fix xs = [1, 2, 3]; xs.push(4)
    let err = run_stmts_err(vec![
        fix_s("xs", array(vec![int(1), int(2), int(3)])),
        expr_s(method(ident("xs"), "push", vec![int(4)])),
    ]);
    assert_eq!(
        err.message,
        "cannot push to crystal array 'xs' (use thaw(xs) to make it mutable)"
    );
}

#[test]
fn thaw_reenables_mutation() {
    let (_, vm) = run_stmts(vec![
        fix_s("xs", array(vec![int(1)])),
        expr_s(call("thaw", vec![ident("xs")])),
        expr_s(method(ident("xs"), "push", vec![int(2)])),
        let_s("n", call("len", vec![ident("xs")])),
    ]);
    assert_eq!(vm.global("n"), Some(Value::int(2)));
}

#[test]
fn freeze_blocks_index_assignment() {
    let err = run_stmts_err(vec![
        fix_s("xs", array(vec![int(1)])),
        lattice_core::Stmt::Assign {
            target: lattice_core::AssignTarget::Index {
                obj: Box::new(ident("xs")),
                index: Box::new(int(0)),
            },
            value: int(9),
            line: 1,
        },
    ]);
    assert_eq!(err.message, "cannot modify a frozen value");
}

#[test]
fn channels_are_never_frozen() {
    let err = run_stmts_err(vec![
        let_s("ch", call("channel", vec![])),
        expr_s(call("freeze", vec![ident("ch")])),
    ]);
    assert_eq!(err.message, "cannot freeze a channel");
}

#[test]
fn sublimated_values_reject_all_mutation() {
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(call("sublimate", vec![ident("xs")])),
        expr_s(method(ident("xs"), "push", vec![int(2)])),
    ]);
    assert!(err.message.contains("sublimated"), "{}", err.message);
}

#[test]
fn is_crystal_and_is_fluid_observe_the_phase() {
    let (_, vm) = run_stmts(vec![
        fix_s("a", array(vec![int(1)])),
        let_s("b", array(vec![int(2)])),
        let_s("fa", call("is_crystal", vec![ident("a")])),
        let_s("fb", call("is_fluid", vec![ident("b")])),
    ]);
    assert_eq!(vm.global("fa"), Some(Value::bool(true)));
    assert_eq!(vm.global("fb"), Some(Value::bool(true)));
}

// --- Reactions ---

#[test]
fn freeze_fires_crystal_reactions() {
    // react(x, |event| print(event)); freeze(x) -> prints "crystal"
    let cb = closure(&["event"], vec![expr_s(call("print", vec![ident("event")]))]);
    let (_, mut vm) = run_stmts(vec![
        let_s("x", array(vec![int(1)])),
        expr_s(call("react", vec![ident("x"), cb])),
        expr_s(call("freeze", vec![ident("x")])),
        expr_s(call("thaw", vec![ident("x")])),
    ]);
    assert_eq!(vm.take_output(), vec!["crystal", "fluid"]);
}

#[test]
fn unreact_silences_callbacks() {
    let cb = closure(&["event"], vec![expr_s(call("print", vec![ident("event")]))]);
    let (_, mut vm) = run_stmts(vec![
        let_s("x", int(1)),
        expr_s(call("react", vec![ident("x"), cb])),
        expr_s(call("unreact", vec![ident("x")])),
        expr_s(call("freeze", vec![ident("x")])),
    ]);
    assert!(vm.take_output().is_empty());
}

#[test]
fn reaction_errors_propagate_out_of_the_freeze() {
    let cb = closure(&["event"], vec![throw_s(string("reaction boom"))]);
    let err = run_stmts_err(vec![
        let_s("x", int(1)),
        expr_s(call("react", vec![ident("x"), cb])),
        expr_s(call("freeze", vec![ident("x")])),
    ]);
    assert_eq!(err.message, "reaction boom");
}

// --- Bonds ---

#[test]
fn mirror_bond_cascades_freeze() {
    let (_, vm) = run_stmts(vec![
        let_s("a", array(vec![int(1)])),
        let_s("b", array(vec![int(2)])),
        expr_s(call("bond", vec![ident("b"), ident("a")])),
        expr_s(call("freeze", vec![ident("a")])),
        let_s("bf", call("is_crystal", vec![ident("b")])),
    ]);
    assert_eq!(vm.global("bf"), Some(Value::bool(true)));
}

#[test]
fn bond_cycles_are_tolerated() {
    let (_, vm) = run_stmts(vec![
        let_s("a", int(1)),
        let_s("b", int(2)),
        expr_s(call("bond", vec![ident("b"), ident("a")])),
        expr_s(call("bond", vec![ident("a"), ident("b")])),
        expr_s(call("freeze", vec![ident("a")])),
        let_s("done", boolean(true)),
    ]);
    assert_eq!(vm.global("done"), Some(Value::bool(true)));
}

// --- Seeds ---

#[test]
fn grow_consumes_a_passing_seed() {
    let pred = closure(&["v"], vec![ret_s(bin(
        BinaryOp::Gt,
        call("len", vec![ident("v")]),
        int(0),
    ))]);
    let (_, vm) = run_stmts(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(call("seed", vec![ident("xs"), pred])),
        expr_s(call("grow", vec![ident("xs")])),
        let_s("frozen", call("is_crystal", vec![ident("xs")])),
    ]);
    assert_eq!(vm.global("frozen"), Some(Value::bool(true)));
}

#[test]
fn failing_seed_aborts_the_freeze() {
    let pred = closure(&["v"], vec![ret_s(boolean(false))]);
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![])),
        expr_s(call("seed", vec![ident("xs"), pred])),
        expr_s(call("grow", vec![ident("xs")])),
    ]);
    assert!(
        err.message.contains("seed contract rejected"),
        "{}",
        err.message
    );
}

#[test]
fn freeze_where_wraps_contract_failures() {
    // freeze(xs) where |v| { throw "too small" }
    let contract = fn_expr(&["v"], vec![throw_s(string("too small"))]);
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![])),
        expr_s(Expr::FreezeWith {
            target: Box::new(ident("xs")),
            contract: Box::new(contract),
            line: 1,
        }),
    ]);
    assert_eq!(err.message, "freeze contract failed: too small");
}

// --- Pressures ---

#[test]
fn no_grow_blocks_push_but_not_pop() {
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(call("pressurize", vec![ident("xs"), string("no_grow")])),
        expr_s(method(ident("xs"), "push", vec![int(2)])),
    ]);
    assert_eq!(err.message, "pressurized (no_grow): cannot push to 'xs'");

    let (_, vm) = run_stmts(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(call("pressurize", vec![ident("xs"), string("no_grow")])),
        let_s("popped", method(ident("xs"), "pop", vec![])),
    ]);
    assert_eq!(vm.global("popped"), Some(Value::int(1)));
}

#[test]
fn depressurize_lifts_the_restriction() {
    let (_, vm) = run_stmts(vec![
        let_s("xs", array(vec![])),
        expr_s(call("pressurize", vec![ident("xs"), string("no_resize")])),
        expr_s(call("depressurize", vec![ident("xs")])),
        expr_s(method(ident("xs"), "push", vec![int(1)])),
        let_s("n", call("len", vec![ident("xs")])),
    ]);
    assert_eq!(vm.global("n"), Some(Value::int(1)));
}

// --- Anneal / crystallize / borrow / forge ---

#[test]
fn anneal_transforms_and_refreezes() {
    let transform = closure(&["v"], vec![
        expr_s(method(ident("v"), "push", vec![int(4)])),
        ret_s(ident("v")),
    ]);
    let (_, vm) = run_stmts(vec![
        fix_s("xs", array(vec![int(1), int(2), int(3)])),
        expr_s(Expr::Anneal {
            target: Box::new(ident("xs")),
            with: Box::new(transform),
            line: 1,
        }),
        let_s("n", call("len", vec![ident("xs")])),
        let_s("still", call("is_crystal", vec![ident("xs")])),
    ]);
    assert_eq!(vm.global("n"), Some(Value::int(4)));
    assert_eq!(vm.global("still"), Some(Value::bool(true)));
}

#[test]
fn anneal_requires_a_crystal_target() {
    let transform = closure(&["v"], vec![ret_s(ident("v"))]);
    let err = run_stmts_err(vec![
        let_s("xs", array(vec![int(1)])),
        expr_s(Expr::Anneal {
            target: Box::new(ident("xs")),
            with: Box::new(transform),
            line: 1,
        }),
    ]);
    assert_eq!(err.message, "anneal failed: target is not crystal");
}

#[test]
fn anneal_wraps_transform_errors() {
    let transform = closure(&["v"], vec![throw_s(string("melted"))]);
    let err = run_stmts_err(vec![
        fix_s("xs", array(vec![int(1)])),
        expr_s(Expr::Anneal {
            target: Box::new(ident("xs")),
            with: Box::new(transform),
            line: 1,
        }),
    ]);
    assert_eq!(err.message, "anneal failed: melted");
}

#[test]
fn crystallize_freezes_for_the_body_only() {
    let (_, vm) = run_stmts(vec![
        let_s("x", array(vec![int(1)])),
        let_s("inside", boolean(false)),
        expr_s(Expr::Crystallize {
            name: "x".to_string(),
            body: block(vec![assign_s("inside", call("is_crystal", vec![ident("x")]))]),
            line: 1,
        }),
        let_s("after", call("is_crystal", vec![ident("x")])),
    ]);
    assert_eq!(vm.global("inside"), Some(Value::bool(true)));
    assert_eq!(vm.global("after"), Some(Value::bool(false)));
}

#[test]
fn borrow_thaws_for_the_body_then_refreezes() {
    let (_, vm) = run_stmts(vec![
        fix_s("x", array(vec![int(1)])),
        expr_s(Expr::Borrow {
            name: "x".to_string(),
            body: block(vec![expr_s(method(ident("x"), "push", vec![int(2)]))]),
            line: 1,
        }),
        let_s("n", call("len", vec![ident("x")])),
        let_s("frozen", call("is_crystal", vec![ident("x")])),
    ]);
    assert_eq!(vm.global("n"), Some(Value::int(2)));
    assert_eq!(vm.global("frozen"), Some(Value::bool(true)));
}

#[test]
fn forge_freezes_its_result() {
    let (_, vm) = run_stmts(vec![
        let_s(
            "x",
            Expr::Forge {
                body: block(vec![expr_s(array(vec![int(1), int(2)]))]),
                line: 1,
            },
        ),
        let_s("frozen", call("is_crystal", vec![ident("x")])),
    ]);
    assert_eq!(vm.global("frozen"), Some(Value::bool(true)));
}

// --- Per-field phases ---

#[test]
fn freeze_field_blocks_only_that_field() {
    let (_, vm) = run(&program(vec![
        Item::Struct(lattice_core::StructDecl {
            name: "Point".to_string(),
            fields: vec![
                lattice_core::StructField {
                    name: "x".to_string(),
                    phase: Phase::Unphased,
                },
                lattice_core::StructField {
                    name: "y".to_string(),
                    phase: Phase::Unphased,
                },
            ],
            line: 1,
        }),
        Item::Stmt(let_s(
            "p",
            Expr::StructLit {
                name: "Point".to_string(),
                fields: vec![("x".to_string(), int(1)), ("y".to_string(), int(2))],
                line: 1,
            },
        )),
        Item::Stmt(expr_s(call(
            "freeze_field",
            vec![ident("p"), string("x")],
        ))),
        Item::Stmt(lattice_core::Stmt::Assign {
            target: lattice_core::AssignTarget::Field {
                obj: Box::new(ident("p")),
                field: "y".to_string(),
            },
            value: int(9),
            line: 1,
        }),
        Item::Stmt(let_s("y", field(ident("p"), "y"))),
    ]));
    assert_eq!(vm.global("y"), Some(Value::int(9)));

    let err = run_err(&program(vec![
        Item::Struct(lattice_core::StructDecl {
            name: "Point".to_string(),
            fields: vec![lattice_core::StructField {
                name: "x".to_string(),
                phase: Phase::Unphased,
            }],
            line: 1,
        }),
        Item::Stmt(let_s(
            "p",
            Expr::StructLit {
                name: "Point".to_string(),
                fields: vec![("x".to_string(), int(1))],
                line: 1,
            },
        )),
        Item::Stmt(expr_s(call(
            "freeze_field",
            vec![ident("p"), string("x")],
        ))),
        Item::Stmt(lattice_core::Stmt::Assign {
            target: lattice_core::AssignTarget::Field {
                obj: Box::new(ident("p")),
                field: "x".to_string(),
            },
            value: int(9),
            line: 1,
        }),
    ]));
    assert_eq!(err.message, "cannot modify a frozen value");
}

#[test]
fn freeze_except_leaves_exempt_keys_fluid() {
    let map = call(
        "map_of",
        vec![
            string("a"),
            int(1),
            string("b"),
            int(2),
        ],
    );
    let (_, vm) = run_stmts(vec![
        let_s("m", map),
        expr_s(Expr::FreezeExcept {
            target: Box::new(ident("m")),
            except: vec!["a".to_string()],
            line: 1,
        }),
        expr_s(method(ident("m"), "set", vec![string("a"), int(10)])),
        let_s("a", method(ident("m"), "get", vec![string("a")])),
    ]);
    assert_eq!(vm.global("a"), Some(Value::int(10)));

    let err = run_stmts_err(vec![
        let_s(
            "m",
            call("map_of", vec![string("a"), int(1), string("b"), int(2)]),
        ),
        expr_s(Expr::FreezeExcept {
            target: Box::new(ident("m")),
            except: vec!["a".to_string()],
            line: 1,
        }),
        expr_s(method(ident("m"), "set", vec![string("b"), int(10)])),
    ]);
    assert_eq!(err.message, "cannot modify a frozen value");
}

#[test]
fn sublimation_overrides_fluid_key_marks() {
    // A fluid mark from a partial freeze does not survive sublimation:
    // sublimated containers reject all mutation.
    let err = run_stmts_err(vec![
        let_s(
            "m",
            call("map_of", vec![string("a"), int(1), string("b"), int(2)]),
        ),
        expr_s(Expr::FreezeExcept {
            target: Box::new(ident("m")),
            except: vec!["a".to_string()],
            line: 1,
        }),
        expr_s(call("sublimate", vec![ident("m")])),
        expr_s(method(ident("m"), "set", vec![string("a"), int(10)])),
    ]);
    assert_eq!(err.message, "cannot modify a frozen value");
}

// --- History ---

#[test]
fn track_and_rewind_recover_old_values() {
    let (_, vm) = run_stmts(vec![
        let_s("x", int(1)),
        expr_s(call("track", vec![ident("x")])),
        assign_s("x", int(2)),
        assign_s("x", int(3)),
        let_s("latest", call("rewind", vec![ident("x"), int(1)])),
        let_s("older", call("rewind", vec![ident("x"), int(3)])),
        let_s("log", call("history", vec![ident("x")])),
    ]);
    assert_eq!(vm.global("latest"), Some(Value::int(3)));
    assert_eq!(vm.global("older"), Some(Value::int(1)));
    let log = vm.global("log").unwrap();
    let ValueKind::Array(entries) = &log.kind else {
        panic!("expected history array");
    };
    assert_eq!(entries.len(), 3);
}

#[test]
fn phases_reports_the_binding_phase() {
    let (_, vm) = run_stmts(vec![
        fix_s("x", int(1)),
        let_s("p", call("phases", vec![ident("x")])),
    ]);
    assert_eq!(vm.global("p"), Some(Value::str("crystal")));
}
