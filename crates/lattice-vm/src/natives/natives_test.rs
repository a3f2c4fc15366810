// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the native-function registry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::value::MapKey;
use crate::vm::Vm;

fn setup() -> Vm {
    Vm::new()
}

#[test]
fn registry_lookup_is_stable() {
    let print_id = lookup_native("print").unwrap();
    assert_eq!(lookup_native("print"), Some(print_id));
    assert!(lookup_native("no_such_native").is_none());
}

#[test]
fn natives_are_installed_as_globals() {
    let vm = setup();
    assert!(vm.global("print").is_some());
    assert!(vm.global("to_string").is_some());
    assert!(vm.global("channel").is_some());
}

#[test]
fn print_captures_output() {
    let mut vm = setup();
    let id = lookup_native("print").unwrap();
    call_native(&mut vm, id, &[Value::str("a"), Value::int(1)]).unwrap();
    assert_eq!(vm.output, vec!["a 1"]);
}

#[test]
fn to_string_uses_the_canonical_form() {
    let mut vm = setup();
    let id = lookup_native("to_string").unwrap();
    let out = call_native(&mut vm, id, &[Value::array(vec![Value::int(1)])]).unwrap();
    assert_eq!(out, Value::str("[1]"));
}

#[test]
fn type_of_names_the_kind() {
    let mut vm = setup();
    let id = lookup_native("type_of").unwrap();
    assert_eq!(
        call_native(&mut vm, id, &[Value::nil()]).unwrap(),
        Value::str("Nil")
    );
    assert_eq!(
        call_native(&mut vm, id, &[Value::str("x")]).unwrap(),
        Value::str("Str")
    );
}

#[test]
fn map_of_builds_ordered_entries() {
    let mut vm = setup();
    let id = lookup_native("map_of").unwrap();
    let out = call_native(
        &mut vm,
        id,
        &[Value::str("k"), Value::int(1), Value::str("j"), Value::int(2)],
    )
    .unwrap();
    let ValueKind::Map(data) = &out.kind else {
        panic!("expected a map");
    };
    let keys: Vec<&MapKey> = data.entries.keys().collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], &MapKey::Str("k".into()));
}

#[test]
fn map_of_rejects_odd_argument_counts() {
    let mut vm = setup();
    let id = lookup_native("map_of").unwrap();
    assert!(call_native(&mut vm, id, &[Value::str("k")]).is_err());
}

#[test]
fn channel_capacity_must_be_an_int() {
    let mut vm = setup();
    let id = lookup_native("channel").unwrap();
    assert!(call_native(&mut vm, id, &[]).is_ok());
    assert!(call_native(&mut vm, id, &[Value::int(4)]).is_ok());
    assert!(call_native(&mut vm, id, &[Value::str("x")]).is_err());
}

#[test]
fn buffer_of_accepts_size_or_bytes() {
    let mut vm = setup();
    let id = lookup_native("buffer_of").unwrap();
    let sized = call_native(&mut vm, id, &[Value::int(3)]).unwrap();
    let ValueKind::Buffer(bytes) = &sized.kind else {
        panic!("expected a buffer");
    };
    assert_eq!(bytes, &vec![0u8; 3]);

    let err = call_native(&mut vm, id, &[Value::array(vec![Value::int(300)])]).unwrap_err();
    assert!(err.contains("0..=255"));
}

#[test]
fn pressure_mode_is_validated() {
    let mut vm = setup();
    let id = lookup_native("pressurize").unwrap();
    let err =
        call_native(&mut vm, id, &[Value::str("x"), Value::str("no_such_mode")]).unwrap_err();
    assert_eq!(err, "unknown pressure mode 'no_such_mode'");
}

#[test]
fn rewind_without_history_errors() {
    let mut vm = setup();
    let id = lookup_native("rewind").unwrap();
    let err = call_native(&mut vm, id, &[Value::str("ghost"), Value::int(1)]).unwrap_err();
    assert!(err.contains("no history for 'ghost'"));
}
