// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Native (host) functions.
//!
//! Natives are identified by a registry index; the compiler reifies them
//! as closure constants and `install` also binds them as globals so user
//! code can pass them around as values. Natives receive owned argument
//! clones and return owned values; errors surface as `Err(message)` and
//! are lifted into the handler chain after the call.

#[cfg(test)]
mod natives_test;

use std::time::{SystemTime, UNIX_EPOCH};

use lattice_core::Phase;

use crate::phase::PressureMode;
use crate::value::{
    print_value, Callee, Channel, ClosureData, MapData, MapKey, SetData, Value, ValueKind,
};
use crate::vm::{Environment, Vm};

/// Signature of a native function.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

struct Native {
    name: &'static str,
    run: NativeFn,
}

static NATIVES: &[Native] = &[
    Native {
        name: "print",
        run: native_print,
    },
    Native {
        name: "to_string",
        run: native_to_string,
    },
    Native {
        name: "type_of",
        run: native_type_of,
    },
    Native {
        name: "len",
        run: native_len,
    },
    Native {
        name: "clock_ms",
        run: native_clock_ms,
    },
    Native {
        name: "sleep_ms",
        run: native_sleep_ms,
    },
    Native {
        name: "channel",
        run: native_channel,
    },
    Native {
        name: "map_of",
        run: native_map_of,
    },
    Native {
        name: "set_of",
        run: native_set_of,
    },
    Native {
        name: "ref_of",
        run: native_ref_of,
    },
    Native {
        name: "buffer_of",
        run: native_buffer_of,
    },
    Native {
        name: "anneal",
        run: native_anneal,
    },
    Native {
        name: "track",
        run: native_track,
    },
    Native {
        name: "history",
        run: native_history,
    },
    Native {
        name: "phases",
        run: native_phases,
    },
    Native {
        name: "rewind",
        run: native_rewind,
    },
    Native {
        name: "pressurize",
        run: native_pressurize,
    },
    Native {
        name: "depressurize",
        run: native_depressurize,
    },
];

/// Registry index of a native by name.
#[must_use]
pub fn lookup_native(name: &str) -> Option<u16> {
    NATIVES
        .iter()
        .position(|n| n.name == name)
        .and_then(|i| u16::try_from(i).ok())
}

/// Invoke a native by registry index.
///
/// # Errors
///
/// Propagates the native's error message.
pub fn call_native(vm: &mut Vm, id: u16, args: &[Value]) -> Result<Value, String> {
    let native = NATIVES
        .get(id as usize)
        .ok_or_else(|| format!("unknown native function {id}"))?;
    (native.run)(vm, args)
}

/// Bind every native as a global so user code can reference them.
pub fn install(env: &mut Environment) {
    for (i, native) in NATIVES.iter().enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "registry is tiny")]
        let id = i as u16;
        env.define(
            native.name,
            Value::closure(ClosureData {
                callee: Callee::Native(id),
                upvalues: Vec::new(),
            }),
        );
    }
}

// --- General natives ---

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let line = args
        .iter()
        .map(print_value)
        .collect::<Vec<_>>()
        .join(" ");
    if vm.options.echo_print {
        println!("{line}");
    }
    vm.output.push(line);
    Ok(Value::unit())
}

fn native_to_string(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("to_string expects a value")?;
    Ok(Value::str(&print_value(value)))
}

fn native_type_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("type_of expects a value")?;
    Ok(Value::str(value.type_name()))
}

fn native_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("len expects a value")?;
    let len = match &value.kind {
        ValueKind::Array(items) | ValueKind::Tuple(items) => items.len(),
        ValueKind::Str(s) => s.chars().count(),
        ValueKind::Map(data) => data.entries.len(),
        ValueKind::Set(data) => data.entries.len(),
        ValueKind::Buffer(bytes) => bytes.len(),
        ValueKind::Range(lo, hi) => usize::try_from(hi - lo).unwrap_or(0),
        ValueKind::Channel(ch) => ch.len(),
        _ => return Err(format!("{} has no length", value.type_name())),
    };
    Ok(Value::int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn native_clock_ms(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "clock went backwards".to_string())?
        .as_millis();
    Ok(Value::int(i64::try_from(ms).unwrap_or(i64::MAX)))
}

fn native_sleep_ms(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let ms = args
        .first()
        .and_then(Value::as_int)
        .ok_or("sleep_ms expects an Int")?;
    let ms = u64::try_from(ms).map_err(|_| "sleep_ms expects a non-negative Int".to_string())?;
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(Value::unit())
}

// --- Constructors ---

fn native_channel(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let capacity = match args.first() {
        Some(v) => usize::try_from(v.as_int().ok_or("channel capacity must be an Int")?)
            .map_err(|_| "channel capacity must be non-negative".to_string())?,
        None => 0,
    };
    Ok(Value::of(ValueKind::Channel(Channel::new(capacity))))
}

fn native_map_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() % 2 != 0 {
        return Err("map literal needs an even number of values".to_string());
    }
    let mut data = MapData::default();
    for pair in args.chunks_exact(2) {
        let key = MapKey::try_from_value(&pair[0])
            .map_err(|t| format!("cannot use {t} as a map key"))?;
        data.entries.insert(key, pair[1].deep_clone());
    }
    Ok(Value::map_from(data))
}

fn native_set_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let elements = match args.first().map(|v| &v.kind) {
        Some(ValueKind::Array(items)) => items.as_slice(),
        _ => args,
    };
    let mut data = SetData::default();
    for element in elements {
        let key = MapKey::try_from_value(element)
            .map_err(|t| format!("cannot use {t} as a set element"))?;
        data.entries.insert(key);
    }
    Ok(Value::of(ValueKind::Set(Box::new(data))))
}

fn native_ref_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args.first().map(Value::deep_clone).unwrap_or_default();
    Ok(Value::of(ValueKind::Ref(std::sync::Arc::new(
        parking_lot::RwLock::new(value),
    ))))
}

fn native_buffer_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let bytes = match args.first().map(|v| &v.kind) {
        Some(ValueKind::Int(n)) => {
            let len = usize::try_from(*n)
                .map_err(|_| "buffer size must be non-negative".to_string())?;
            vec![0u8; len]
        }
        Some(ValueKind::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_int()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| "buffer elements must be Int 0..=255".to_string())
            })
            .collect::<Result<Vec<u8>, String>>()?,
        _ => return Err("buffer_of expects a size or an array of bytes".to_string()),
    };
    Ok(Value::of(ValueKind::Buffer(bytes)))
}

// --- Phase services ---

fn native_anneal(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let [target, transform] = args else {
        return Err("anneal expects (target, transform)".to_string());
    };
    if target.phase != Phase::Crystal {
        return Err("anneal failed: target is not crystal".to_string());
    }
    let thawed = target.thawed();
    let result = vm
        .call_value(transform, &[thawed])
        .map_err(|err| format!("anneal failed: {err}"))?;
    Ok(result.frozen())
}

fn arg_name(args: &[Value], what: &str) -> Result<String, String> {
    args.first()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| format!("{what} expects a variable name"))
}

fn native_track(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "track")?;
    vm.services.track(&name);
    // Seed the history with the current value when one is bound.
    if let Some(current) = vm.env.get(&name).map(Value::clone_or_borrow) {
        vm.services.record(&name, &current);
    }
    Ok(Value::unit())
}

fn native_history(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "history")?;
    let entries = vm
        .services
        .history_of(&name)
        .iter()
        .map(|e| e.value.clone_or_borrow())
        .collect();
    Ok(Value::array(entries))
}

fn native_phases(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "phases")?;
    let value = vm
        .env
        .get(&name)
        .ok_or_else(|| format!("undefined variable '{name}'"))?;
    Ok(Value::str(value.phase.name()))
}

fn native_rewind(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "rewind")?;
    let n = args
        .get(1)
        .and_then(Value::as_int)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or("rewind expects (name, steps)")?;
    vm.services
        .rewind(&name, n)
        .ok_or_else(|| format!("no history for '{name}' at depth {n}"))
}

fn native_pressurize(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "pressurize")?;
    let mode = args
        .get(1)
        .and_then(|v| v.as_str())
        .ok_or("pressurize expects (name, mode)")?;
    let mode = PressureMode::parse(mode)
        .ok_or_else(|| format!("unknown pressure mode '{mode}'"))?;
    vm.services.pressurize(&name, mode);
    Ok(Value::unit())
}

fn native_depressurize(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = arg_name(args, "depressurize")?;
    vm.services.depressurize(&name);
    Ok(Value::unit())
}
