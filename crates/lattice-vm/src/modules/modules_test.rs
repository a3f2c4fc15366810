// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Module loading against the mock resolver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use super::*;
use crate::testutil::*;
use crate::value::{Value, ValueKind};
use crate::vm::VmOptions;
use lattice_core::{BinaryOp, Item, Stmt};

/// A VM wired to a mock resolver.
fn vm_with(resolver: Arc<MockResolver>) -> Vm {
    Vm::with_resolver(VmOptions::default(), resolver)
}

/// `m.lat`: exports only `add`, also defines `sub` and a side effect.
fn math_module() -> lattice_core::Program {
    program(vec![
        Item::Export(vec!["add".to_string()]),
        fn_item("add", &["a", "b"], vec![ret_s(bin(
            BinaryOp::Add,
            ident("a"),
            ident("b"),
        ))]),
        fn_item("sub", &["a", "b"], vec![ret_s(bin(
            BinaryOp::Sub,
            ident("a"),
            ident("b"),
        ))]),
        Item::Stmt(expr_s(call("print", vec![string("m executed")]))),
    ])
}

fn import_stmt(path: &str, names: Option<Vec<&str>>) -> Stmt {
    Stmt::Import {
        path: path.to_string(),
        names: names.map(|ns| ns.into_iter().map(str::to_string).collect()),
        alias: None,
        line: 1,
    }
}

#[test]
fn whole_module_import_binds_an_export_map() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("m", math_module());
    let mut vm = vm_with(Arc::clone(&resolver));

    let chunk = crate::compiler::compile(&stmts_program(vec![
        import_stmt("m", None),
        let_s("y", call_expr(field(ident("m"), "add"), vec![int(2), int(3)])),
    ]))
    .unwrap();
    vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.global("y"), Some(Value::int(5)));

    // Export filter: sub is not in the module map.
    let module = vm.global("m").unwrap();
    let ValueKind::Map(data) = &module.kind else {
        panic!("expected a module map");
    };
    assert!(data.entries.contains_key(&crate::value::MapKey::Str("add".into())));
    assert!(!data.entries.contains_key(&crate::value::MapKey::Str("sub".into())));
}

#[test]
fn selective_import_defines_globals() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("m", math_module());
    let mut vm = vm_with(resolver);

    let chunk = crate::compiler::compile(&stmts_program(vec![
        import_stmt("m", Some(vec!["add"])),
        let_s("y", call("add", vec![int(20), int(22)])),
    ]))
    .unwrap();
    vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.global("y"), Some(Value::int(42)));
}

#[test]
fn selective_import_of_a_missing_export_throws() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("m", math_module());
    let mut vm = vm_with(resolver);

    let chunk = crate::compiler::compile(&stmts_program(vec![import_stmt(
        "m",
        Some(vec!["add", "sub"]),
    )]))
    .unwrap();
    let err = vm.run_chunk(chunk).unwrap_err();
    assert_eq!(err.message, "module 'm' does not export 'sub'");
}

#[test]
fn import_is_idempotent_and_cached() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("m", math_module());
    let mut vm = vm_with(resolver);

    let chunk = crate::compiler::compile(&stmts_program(vec![
        import_stmt("m", None),
        let_s("first", ident("m")),
        import_stmt("m", None),
        let_s("second", ident("m")),
    ]))
    .unwrap();
    vm.run_chunk(chunk).unwrap();

    // Same map by deep equality, and the module body ran only once.
    assert_eq!(vm.global("first"), vm.global("second"));
    assert_eq!(vm.take_output(), vec!["m executed"]);
}

#[test]
fn module_bindings_do_not_leak_into_the_importer() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("m", math_module());
    let mut vm = vm_with(resolver);

    let chunk = crate::compiler::compile(&stmts_program(vec![
        import_stmt("m", None),
        expr_s(call("sub", vec![int(1), int(2)])),
    ]))
    .unwrap();
    let err = vm.run_chunk(chunk).unwrap_err();
    assert!(
        err.message.contains("undefined variable 'sub'"),
        "{}",
        err.message
    );
}

#[test]
fn require_runs_in_the_current_scope_and_dedupes() {
    let resolver = Arc::new(MockResolver::new());
    resolver.register("setup", math_module());
    let mut vm = vm_with(resolver);

    // require is a special-form call with a string-literal path.
    let chunk = crate::compiler::compile(&stmts_program(vec![
        let_s("ok", call("require", vec![string("setup")])),
        let_s("again", call("require", vec![string("setup")])),
        // Whole-file execution: sub lands in the current scope.
        let_s("y", call("sub", vec![int(5), int(3)])),
    ]))
    .unwrap();
    vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.global("ok"), Some(Value::bool(true)));
    assert_eq!(vm.global("again"), Some(Value::bool(true)));
    assert_eq!(vm.global("y"), Some(Value::int(2)));
    assert_eq!(vm.take_output(), vec!["m executed"]);
}

#[test]
fn missing_module_reports_the_written_path() {
    let mut vm = vm_with(Arc::new(MockResolver::new()));
    let chunk =
        crate::compiler::compile(&stmts_program(vec![import_stmt("ghost", None)])).unwrap();
    let err = vm.run_chunk(chunk).unwrap_err();
    assert_eq!(err.message, "cannot find module 'ghost'");
}

#[test]
fn fs_resolver_appends_the_lat_extension() {
    let search = ModuleSearch::default();
    // Nothing on disk: resolution fails but must not panic.
    assert!(FsResolver::new().resolve("no_such_module", &search).is_none());
}
