// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the builtin-method table and its guards.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::phase::PressureMode;
use crate::vm::Vm;
use lattice_core::Phase;

fn setup() -> Vm {
    Vm::new()
}

fn invoke_named(
    vm: &mut Vm,
    type_tag: u8,
    name: &str,
    recv: &mut Value,
    args: &[Value],
    recv_name: Option<&str>,
) -> Result<Value, String> {
    let id = lookup(type_tag, name).expect("builtin exists");
    invoke(vm, id, recv, args, recv_name)
}

// --- Lookup ---

#[test]
fn lookup_is_per_type() {
    assert!(lookup(tag::ARRAY, "push").is_some());
    assert!(lookup(tag::STR, "push").is_none());
    assert!(lookup(tag::STR, "upper").is_some());
    assert!(lookup(tag::ARRAY, "upper").is_none());
}

#[test]
fn method_names_feed_suggestions() {
    let names = method_names(tag::ARRAY);
    assert!(names.contains(&"push"));
    assert!(names.contains(&"pop"));
}

// --- Array mutation guards ---

#[test]
fn push_mutates_in_place() {
    let mut vm = setup();
    let mut xs = Value::array(vec![Value::int(1)]);
    invoke_named(&mut vm, tag::ARRAY, "push", &mut xs, &[Value::int(2)], None).unwrap();
    assert_eq!(xs, Value::array(vec![Value::int(1), Value::int(2)]));
}

#[test]
fn push_on_crystal_array_names_the_binding() {
    let mut vm = setup();
    let mut xs = Value::array(vec![Value::int(1)]).frozen();
    let err = invoke_named(
        &mut vm,
        tag::ARRAY,
        "push",
        &mut xs,
        &[Value::int(2)],
        Some("xs"),
    )
    .unwrap_err();
    assert_eq!(
        err,
        "cannot push to crystal array 'xs' (use thaw(xs) to make it mutable)"
    );
}

#[test]
fn push_on_crystal_array_without_a_name() {
    let mut vm = setup();
    let mut xs = Value::array(vec![]).frozen();
    let err =
        invoke_named(&mut vm, tag::ARRAY, "push", &mut xs, &[Value::int(1)], None).unwrap_err();
    assert_eq!(err, "cannot push to crystal array");
}

#[test]
fn pressure_blocks_by_direction() {
    let mut vm = setup();
    vm.services.pressurize("xs", PressureMode::NoGrow);

    let mut xs = Value::array(vec![Value::int(1)]);
    let err = invoke_named(
        &mut vm,
        tag::ARRAY,
        "push",
        &mut xs,
        &[Value::int(2)],
        Some("xs"),
    )
    .unwrap_err();
    assert_eq!(err, "pressurized (no_grow): cannot push to 'xs'");

    // Shrinking is not blocked by no_grow.
    let popped =
        invoke_named(&mut vm, tag::ARRAY, "pop", &mut xs, &[], Some("xs")).unwrap();
    assert_eq!(popped, Value::int(1));
}

#[test]
fn pop_of_an_empty_array_is_nil() {
    let mut vm = setup();
    let mut xs = Value::array(vec![]);
    let popped = invoke_named(&mut vm, tag::ARRAY, "pop", &mut xs, &[], None).unwrap();
    assert_eq!(popped, Value::nil());
}

#[test]
fn insert_checks_bounds() {
    let mut vm = setup();
    let mut xs = Value::array(vec![Value::int(1)]);
    let err = invoke_named(
        &mut vm,
        tag::ARRAY,
        "insert",
        &mut xs,
        &[Value::int(9), Value::int(0)],
        None,
    )
    .unwrap_err();
    assert!(err.contains("out of bounds"));
}

// --- Map per-key phases ---

#[test]
fn map_set_respects_key_phase_marks() {
    let mut vm = setup();
    let mut data = crate::value::MapData::default();
    data.entries
        .insert(MapKey::Str("a".into()), Value::int(1));
    data.set_key_phase(MapKey::Str("a".into()), Phase::Crystal);
    let mut map = Value::map_from(data);

    let err = invoke_named(
        &mut vm,
        tag::MAP,
        "set",
        &mut map,
        &[Value::str("a"), Value::int(2)],
        None,
    )
    .unwrap_err();
    assert_eq!(err, "cannot modify a frozen value");

    // Other keys stay writable.
    invoke_named(
        &mut vm,
        tag::MAP,
        "set",
        &mut map,
        &[Value::str("b"), Value::int(2)],
        None,
    )
    .unwrap();
}

// --- Channels ---

#[test]
fn channel_methods_round_trip() {
    let mut vm = setup();
    let mut ch = Value::of(ValueKind::Channel(crate::value::Channel::new(0)));
    invoke_named(&mut vm, tag::CHANNEL, "send", &mut ch, &[Value::int(5)], None).unwrap();
    let got = invoke_named(&mut vm, tag::CHANNEL, "recv", &mut ch, &[], None).unwrap();
    assert_eq!(got, Value::int(5));

    let empty = invoke_named(&mut vm, tag::CHANNEL, "try_recv", &mut ch, &[], None).unwrap();
    assert_eq!(empty, Value::nil());

    invoke_named(&mut vm, tag::CHANNEL, "close", &mut ch, &[], None).unwrap();
    let closed = invoke_named(&mut vm, tag::CHANNEL, "is_closed", &mut ch, &[], None).unwrap();
    assert_eq!(closed, Value::bool(true));
}

// --- Iterators ---

#[test]
fn iterator_next_then_collect() {
    let mut vm = setup();
    let mut iter = iterator_over(vec![Value::int(1), Value::int(2), Value::int(3)]);
    let first = invoke_named(&mut vm, tag::ITERATOR, "next", &mut iter, &[], None).unwrap();
    assert_eq!(first, Value::int(1));
    let rest = invoke_named(&mut vm, tag::ITERATOR, "collect", &mut iter, &[], None).unwrap();
    assert_eq!(rest, Value::array(vec![Value::int(2), Value::int(3)]));
    let done = invoke_named(&mut vm, tag::ITERATOR, "next", &mut iter, &[], None).unwrap();
    assert_eq!(done, Value::nil());
}

// --- Refs ---

#[test]
fn ref_cell_shares_state() {
    let mut vm = setup();
    let id = crate::natives::lookup_native("ref_of").unwrap();
    let mut cell = crate::natives::call_native(&mut vm, id, &[Value::int(1)]).unwrap();
    let mut alias = cell.clone();

    invoke_named(&mut vm, tag::REF, "set", &mut cell, &[Value::int(9)], None).unwrap();
    let seen = invoke_named(&mut vm, tag::REF, "get", &mut alias, &[], None).unwrap();
    assert_eq!(seen, Value::int(9));
}
