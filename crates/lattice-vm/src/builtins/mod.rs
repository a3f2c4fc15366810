// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Builtin methods: the dispatch targets behind the PIC handler ids.
//!
//! The table maps `(receiver type tag, method name)` to a handler id;
//! `invoke` runs a handler against the receiver in place. Mutating
//! handlers enforce the phase rules (crystal rejects in-place mutation)
//! and the pressure rules (`no_grow`/`no_shrink`/`no_resize`) before
//! touching the payload; the receiver's binding name, when the call site
//! resolved one, feeds the violation messages.

#[cfg(test)]
mod builtins_test;

use crate::phase::MutationOp;
use crate::value::{
    print_value, tag, IterState, MapKey, TryRecv, Value, ValueKind,
};
use crate::vm::Vm;

/// Signature of a builtin-method handler.
type Handler = fn(&mut Vm, &mut Value, &[Value], Option<&str>) -> Result<Value, String>;

struct Builtin {
    tag: u8,
    name: &'static str,
    run: Handler,
}

static BUILTINS: &[Builtin] = &[
    // --- Array ---
    Builtin { tag: tag::ARRAY, name: "push", run: array_push },
    Builtin { tag: tag::ARRAY, name: "pop", run: array_pop },
    Builtin { tag: tag::ARRAY, name: "insert", run: array_insert },
    Builtin { tag: tag::ARRAY, name: "remove", run: array_remove },
    Builtin { tag: tag::ARRAY, name: "len", run: any_len },
    Builtin { tag: tag::ARRAY, name: "contains", run: array_contains },
    Builtin { tag: tag::ARRAY, name: "first", run: array_first },
    Builtin { tag: tag::ARRAY, name: "last", run: array_last },
    Builtin { tag: tag::ARRAY, name: "reverse", run: array_reverse },
    Builtin { tag: tag::ARRAY, name: "join", run: array_join },
    Builtin { tag: tag::ARRAY, name: "map", run: array_map },
    Builtin { tag: tag::ARRAY, name: "filter", run: array_filter },
    // --- Str ---
    Builtin { tag: tag::STR, name: "len", run: any_len },
    Builtin { tag: tag::STR, name: "upper", run: str_upper },
    Builtin { tag: tag::STR, name: "lower", run: str_lower },
    Builtin { tag: tag::STR, name: "trim", run: str_trim },
    Builtin { tag: tag::STR, name: "split", run: str_split },
    Builtin { tag: tag::STR, name: "contains", run: str_contains },
    Builtin { tag: tag::STR, name: "starts_with", run: str_starts_with },
    Builtin { tag: tag::STR, name: "ends_with", run: str_ends_with },
    Builtin { tag: tag::STR, name: "chars", run: str_chars },
    // --- Map ---
    Builtin { tag: tag::MAP, name: "get", run: map_get },
    Builtin { tag: tag::MAP, name: "set", run: map_set },
    Builtin { tag: tag::MAP, name: "remove", run: map_remove },
    Builtin { tag: tag::MAP, name: "keys", run: map_keys },
    Builtin { tag: tag::MAP, name: "values", run: map_values },
    Builtin { tag: tag::MAP, name: "contains", run: map_contains },
    Builtin { tag: tag::MAP, name: "len", run: any_len },
    // --- Set ---
    Builtin { tag: tag::SET, name: "add", run: set_add },
    Builtin { tag: tag::SET, name: "remove", run: set_remove },
    Builtin { tag: tag::SET, name: "contains", run: set_contains },
    Builtin { tag: tag::SET, name: "len", run: any_len },
    Builtin { tag: tag::SET, name: "to_array", run: set_to_array },
    // --- Tuple ---
    Builtin { tag: tag::TUPLE, name: "len", run: any_len },
    // --- Buffer ---
    Builtin { tag: tag::BUFFER, name: "len", run: any_len },
    Builtin { tag: tag::BUFFER, name: "push", run: buffer_push },
    Builtin { tag: tag::BUFFER, name: "get", run: buffer_get },
    Builtin { tag: tag::BUFFER, name: "set", run: buffer_set },
    // --- Channel ---
    Builtin { tag: tag::CHANNEL, name: "send", run: channel_send },
    Builtin { tag: tag::CHANNEL, name: "recv", run: channel_recv },
    Builtin { tag: tag::CHANNEL, name: "try_recv", run: channel_try_recv },
    Builtin { tag: tag::CHANNEL, name: "close", run: channel_close },
    Builtin { tag: tag::CHANNEL, name: "is_closed", run: channel_is_closed },
    Builtin { tag: tag::CHANNEL, name: "len", run: any_len },
    // --- Iterator ---
    Builtin { tag: tag::ITERATOR, name: "next", run: iter_next },
    Builtin { tag: tag::ITERATOR, name: "collect", run: iter_collect },
    // --- Ref ---
    Builtin { tag: tag::REF, name: "get", run: ref_get },
    Builtin { tag: tag::REF, name: "set", run: ref_set },
];

/// Handler id for `(type, method)`, if the method is builtin.
#[must_use]
pub fn lookup(type_tag: u8, method: &str) -> Option<u16> {
    BUILTINS
        .iter()
        .position(|b| b.tag == type_tag && b.name == method)
        .and_then(|i| u16::try_from(i).ok())
}

/// Builtin method names of a type (for unknown-method suggestions).
#[must_use]
pub fn method_names(type_tag: u8) -> Vec<&'static str> {
    BUILTINS
        .iter()
        .filter(|b| b.tag == type_tag)
        .map(|b| b.name)
        .collect()
}

/// Run a handler against the receiver in place.
///
/// # Errors
///
/// Propagates phase violations, pressure violations, and the handler's
/// own failures.
pub fn invoke(
    vm: &mut Vm,
    handler: u16,
    receiver: &mut Value,
    args: &[Value],
    receiver_name: Option<&str>,
) -> Result<Value, String> {
    let builtin = BUILTINS
        .get(handler as usize)
        .ok_or_else(|| format!("corrupt method cache (handler {handler})"))?;
    (builtin.run)(vm, receiver, args, receiver_name)
}

// --- Guard helpers ---

/// Phase guard for in-place mutation.
fn check_phase(recv: &Value, verb: &str, name: Option<&str>) -> Result<(), String> {
    if recv.phase.is_mutable() {
        return Ok(());
    }
    let phase = recv.phase.name();
    let type_word = type_word(recv);
    match name {
        Some(name) => Err(format!(
            "cannot {verb} to {phase} {type_word} '{name}' (use thaw({name}) to make it mutable)"
        )),
        None => Err(format!("cannot {verb} to {phase} {type_word}")),
    }
}

/// Pressure guard for size-changing mutation.
fn check_pressure(
    vm: &Vm,
    op: MutationOp,
    verb: &str,
    name: Option<&str>,
) -> Result<(), String> {
    let Some(name) = name else {
        return Ok(());
    };
    match vm.services.pressure_blocking(name, op) {
        Some(mode) => Err(format!(
            "pressurized ({}): cannot {verb} to '{name}'",
            mode.name()
        )),
        None => Ok(()),
    }
}

fn type_word(recv: &Value) -> &'static str {
    match recv.kind {
        ValueKind::Array(_) => "array",
        ValueKind::Map(_) => "map",
        ValueKind::Set(_) => "set",
        ValueKind::Buffer(_) => "buffer",
        ValueKind::Struct(_) => "struct",
        _ => "value",
    }
}

fn arg(args: &[Value], i: usize, what: &str) -> Result<Value, String> {
    args.get(i)
        .map(Value::clone_or_borrow)
        .ok_or_else(|| format!("{what} expects an argument"))
}

// --- Array ---

fn as_array(recv: &mut Value) -> &mut Vec<Value> {
    match &mut recv.kind {
        ValueKind::Array(items) => items,
        _ => unreachable!("receiver tag checked by dispatch"),
    }
}

fn array_push(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "push", name)?;
    check_pressure(vm, MutationOp::Grow, "push", name)?;
    let value = arg(args, 0, "push")?;
    as_array(recv).push(value.deep_clone());
    Ok(Value::unit())
}

fn array_pop(vm: &mut Vm, recv: &mut Value, _args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "pop", name)?;
    check_pressure(vm, MutationOp::Shrink, "pop", name)?;
    Ok(as_array(recv).pop().unwrap_or_default())
}

fn array_insert(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "insert", name)?;
    check_pressure(vm, MutationOp::Grow, "insert", name)?;
    let index = args
        .first()
        .and_then(Value::as_int)
        .ok_or("insert expects (index, value)")?;
    let value = arg(args, 1, "insert")?;
    let items = as_array(recv);
    let index = usize::try_from(index)
        .ok()
        .filter(|i| *i <= items.len())
        .ok_or_else(|| format!("index {index} out of bounds (len {})", items.len()))?;
    items.insert(index, value.deep_clone());
    Ok(Value::unit())
}

fn array_remove(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "remove", name)?;
    check_pressure(vm, MutationOp::Shrink, "remove", name)?;
    let index = args
        .first()
        .and_then(Value::as_int)
        .ok_or("remove expects an index")?;
    let items = as_array(recv);
    let index = usize::try_from(index)
        .ok()
        .filter(|i| *i < items.len())
        .ok_or_else(|| format!("index {index} out of bounds (len {})", items.len()))?;
    Ok(items.remove(index))
}

fn any_len(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let len = match &recv.kind {
        ValueKind::Array(items) | ValueKind::Tuple(items) => items.len(),
        ValueKind::Str(s) => s.chars().count(),
        ValueKind::Map(data) => data.entries.len(),
        ValueKind::Set(data) => data.entries.len(),
        ValueKind::Buffer(bytes) => bytes.len(),
        ValueKind::Channel(ch) => ch.len(),
        _ => 0,
    };
    Ok(Value::int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn array_contains(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let needle = arg(args, 0, "contains")?;
    Ok(Value::bool(as_array(recv).iter().any(|v| *v == needle)))
}

fn array_first(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(as_array(recv)
        .first()
        .map_or_else(Value::nil, Value::clone_or_borrow))
}

fn array_last(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(as_array(recv)
        .last()
        .map_or_else(Value::nil, Value::clone_or_borrow))
}

fn array_reverse(_vm: &mut Vm, recv: &mut Value, _args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "reverse", name)?;
    as_array(recv).reverse();
    Ok(Value::unit())
}

fn array_join(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let sep = args.first().and_then(|v| v.as_str()).unwrap_or(", ");
    let joined = as_array(recv)
        .iter()
        .map(print_value)
        .collect::<Vec<_>>()
        .join(sep);
    Ok(Value::str_ephemeral(joined))
}

fn array_map(vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let callback = arg(args, 0, "map")?;
    let items: Vec<Value> = as_array(recv).iter().map(Value::clone_or_borrow).collect();
    let mut mapped = Vec::with_capacity(items.len());
    for item in items {
        mapped.push(vm.call_value(&callback, &[item])?);
    }
    Ok(Value::array(mapped))
}

fn array_filter(vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let callback = arg(args, 0, "filter")?;
    let items: Vec<Value> = as_array(recv).iter().map(Value::clone_or_borrow).collect();
    let mut kept = Vec::new();
    for item in items {
        if vm.call_value(&callback, &[item.clone_or_borrow()])?.is_truthy() {
            kept.push(item);
        }
    }
    Ok(Value::array(kept))
}

// --- Str ---

fn as_str(recv: &Value) -> &str {
    match &recv.kind {
        ValueKind::Str(s) => s,
        _ => unreachable!("receiver tag checked by dispatch"),
    }
}

fn str_upper(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(Value::str_ephemeral(as_str(recv).to_uppercase()))
}

fn str_lower(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(Value::str_ephemeral(as_str(recv).to_lowercase()))
}

fn str_trim(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(Value::str(as_str(recv).trim()))
}

fn str_split(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let sep = args
        .first()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or("split expects a separator")?;
    let parts = as_str(recv)
        .split(&sep)
        .map(Value::str)
        .collect();
    Ok(Value::array(parts))
}

fn str_contains(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let needle = args
        .first()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or("contains expects a string")?;
    Ok(Value::bool(as_str(recv).contains(&needle)))
}

fn str_starts_with(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let prefix = args
        .first()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or("starts_with expects a string")?;
    Ok(Value::bool(as_str(recv).starts_with(&prefix)))
}

fn str_ends_with(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let suffix = args
        .first()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or("ends_with expects a string")?;
    Ok(Value::bool(as_str(recv).ends_with(&suffix)))
}

fn str_chars(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let chars = as_str(recv)
        .chars()
        .map(|c| Value::str(&c.to_string()))
        .collect();
    Ok(Value::array(chars))
}

// --- Map ---

fn map_key(args: &[Value], what: &str) -> Result<MapKey, String> {
    let key = args.first().ok_or_else(|| format!("{what} expects a key"))?;
    MapKey::try_from_value(key).map_err(|t| format!("cannot use {t} as a map key"))
}

fn map_get(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let key = map_key(args, "get")?;
    let default = args.get(1).map(Value::clone_or_borrow);
    let ValueKind::Map(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(data
        .entries
        .get(&key)
        .map(Value::clone_or_borrow)
        .or(default)
        .unwrap_or_default())
}

fn map_set(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    let key = map_key(args, "set")?;
    let value = arg(args, 1, "set")?;
    let container_phase = recv.phase;
    let is_new = {
        let ValueKind::Map(data) = &recv.kind else {
            unreachable!("receiver tag checked by dispatch");
        };
        !data.entries.contains_key(&key)
    };
    if is_new {
        check_pressure(vm, MutationOp::Grow, "insert", name)?;
    }
    let ValueKind::Map(data) = &mut recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    if data.key_is_frozen(&key, container_phase) {
        return Err("cannot modify a frozen value".to_string());
    }
    data.entries.insert(key, value.deep_clone());
    Ok(Value::unit())
}

fn map_remove(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "remove", name)?;
    check_pressure(vm, MutationOp::Shrink, "remove", name)?;
    let key = map_key(args, "remove")?;
    let ValueKind::Map(data) = &mut recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(data.entries.shift_remove(&key).unwrap_or_default())
}

fn map_keys(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Map(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::array(data.entries.keys().map(MapKey::to_value).collect()))
}

fn map_values(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Map(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::array(
        data.entries.values().map(Value::clone_or_borrow).collect(),
    ))
}

fn map_contains(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let key = map_key(args, "contains")?;
    let ValueKind::Map(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::bool(data.entries.contains_key(&key)))
}

// --- Set ---

fn set_key(args: &[Value], what: &str) -> Result<MapKey, String> {
    let key = args
        .first()
        .ok_or_else(|| format!("{what} expects a value"))?;
    MapKey::try_from_value(key).map_err(|t| format!("cannot use {t} as a set element"))
}

fn set_add(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "add", name)?;
    check_pressure(vm, MutationOp::Grow, "add", name)?;
    let key = set_key(args, "add")?;
    let ValueKind::Set(data) = &mut recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::bool(data.entries.insert(key)))
}

fn set_remove(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "remove", name)?;
    check_pressure(vm, MutationOp::Shrink, "remove", name)?;
    let key = set_key(args, "remove")?;
    let ValueKind::Set(data) = &mut recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::bool(data.entries.shift_remove(&key)))
}

fn set_contains(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let key = set_key(args, "contains")?;
    let ValueKind::Set(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::bool(data.entries.contains(&key)))
}

fn set_to_array(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Set(data) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(Value::array(data.entries.iter().map(MapKey::to_value).collect()))
}

// --- Buffer ---

fn as_buffer(recv: &mut Value) -> &mut Vec<u8> {
    match &mut recv.kind {
        ValueKind::Buffer(bytes) => bytes,
        _ => unreachable!("receiver tag checked by dispatch"),
    }
}

fn byte_arg(args: &[Value], i: usize, what: &str) -> Result<u8, String> {
    args.get(i)
        .and_then(Value::as_int)
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| format!("{what} expects an Int 0..=255"))
}

fn buffer_push(vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "push", name)?;
    check_pressure(vm, MutationOp::Grow, "push", name)?;
    let byte = byte_arg(args, 0, "push")?;
    as_buffer(recv).push(byte);
    Ok(Value::unit())
}

fn buffer_get(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let index = args
        .first()
        .and_then(Value::as_int)
        .ok_or("get expects an index")?;
    let bytes = as_buffer(recv);
    usize::try_from(index)
        .ok()
        .and_then(|i| bytes.get(i))
        .map(|b| Value::int(i64::from(*b)))
        .ok_or_else(|| format!("index {index} out of bounds (len {})", bytes.len()))
}

fn buffer_set(_vm: &mut Vm, recv: &mut Value, args: &[Value], name: Option<&str>) -> Result<Value, String> {
    check_phase(recv, "set", name)?;
    let index = args
        .first()
        .and_then(Value::as_int)
        .ok_or("set expects (index, byte)")?;
    let byte = byte_arg(args, 1, "set")?;
    let bytes = as_buffer(recv);
    let index = usize::try_from(index)
        .ok()
        .filter(|i| *i < bytes.len())
        .ok_or_else(|| format!("index {index} out of bounds (len {})", bytes.len()))?;
    bytes[index] = byte;
    Ok(Value::unit())
}

// --- Channel ---

fn as_channel(recv: &Value) -> &crate::value::Channel {
    match &recv.kind {
        ValueKind::Channel(ch) => ch,
        _ => unreachable!("receiver tag checked by dispatch"),
    }
}

fn channel_send(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let value = arg(args, 0, "send")?;
    as_channel(recv).send(value.deep_clone())?;
    Ok(Value::unit())
}

fn channel_recv(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(as_channel(recv).recv().unwrap_or_default())
}

fn channel_try_recv(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    match as_channel(recv).try_recv() {
        TryRecv::Value(value) => Ok(value),
        TryRecv::Empty | TryRecv::Closed => Ok(Value::nil()),
    }
}

fn channel_close(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    as_channel(recv).close();
    Ok(Value::unit())
}

fn channel_is_closed(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    Ok(Value::bool(as_channel(recv).is_closed()))
}

// --- Iterator ---

fn iter_next(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Iterator(iter) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    let mut state = iter.lock();
    let pos = state.pos;
    let next = state.items.get(pos).map(Value::clone_or_borrow);
    match next {
        Some(value) => {
            state.pos += 1;
            Ok(value)
        }
        None => Ok(Value::nil()),
    }
}

fn iter_collect(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Iterator(iter) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    let mut state = iter.lock();
    let pos = state.pos.min(state.items.len());
    let rest: Vec<Value> = state.items[pos..]
        .iter()
        .map(Value::clone_or_borrow)
        .collect();
    let len = state.items.len();
    state.pos = len;
    Ok(Value::array(rest))
}

/// Build an iterator value over items (used by tests and natives).
#[must_use]
pub fn iterator_over(items: Vec<Value>) -> Value {
    Value::of(ValueKind::Iterator(std::sync::Arc::new(
        parking_lot::Mutex::new(IterState { items, pos: 0 }),
    )))
}

// --- Ref ---

fn ref_get(_vm: &mut Vm, recv: &mut Value, _args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    let ValueKind::Ref(cell) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    Ok(cell.read().clone_or_borrow())
}

fn ref_set(_vm: &mut Vm, recv: &mut Value, args: &[Value], _name: Option<&str>) -> Result<Value, String> {
    if recv.phase.is_frozen() {
        return Err("cannot modify a frozen value".to_string());
    }
    let value = arg(args, 0, "set")?;
    let ValueKind::Ref(cell) = &recv.kind else {
        unreachable!("receiver tag checked by dispatch");
    };
    *cell.write() = value.deep_clone();
    Ok(Value::unit())
}
