// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Canonical display form for values.
//!
//! Used by `to_string`, uncaught-error formatting, and tracebacks.
//! Strings print bare at the top level and quoted inside containers.

use std::fmt::Write;

use crate::value::{Value, ValueKind};

/// Render a value in its canonical display form.
#[must_use]
pub fn print_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, false);
    out
}

fn write_value(out: &mut String, value: &Value, quoted: bool) {
    match &value.kind {
        ValueKind::Int(n) => {
            let _ = write!(out, "{n}");
        }
        ValueKind::Float(f) => {
            // Keep a trailing .0 so floats stay distinguishable from ints.
            if f.fract() == 0.0 && f.is_finite() {
                let _ = write!(out, "{f:.1}");
            } else {
                let _ = write!(out, "{f}");
            }
        }
        ValueKind::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        ValueKind::Nil => out.push_str("nil"),
        ValueKind::Unit => out.push_str("()"),
        ValueKind::Range(start, end) => {
            let _ = write!(out, "{start}..{end}");
        }
        ValueKind::Str(s) => {
            if quoted {
                let _ = write!(out, "\"{s}\"");
            } else {
                out.push_str(s);
            }
        }
        ValueKind::Array(items) => {
            out.push('[');
            write_list(out, items);
            out.push(']');
        }
        ValueKind::Tuple(items) => {
            out.push('(');
            write_list(out, items);
            out.push(')');
        }
        ValueKind::Map(data) => {
            out.push('{');
            for (i, (k, v)) in data.entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, &k.to_value(), true);
                out.push_str(": ");
                write_value(out, v, true);
            }
            out.push('}');
        }
        ValueKind::Set(data) => {
            out.push_str("#{");
            for (i, k) in data.entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, &k.to_value(), true);
            }
            out.push('}');
        }
        ValueKind::Struct(data) => {
            let _ = write!(out, "{} {{ ", data.name);
            for (i, (name, v)) in data.fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{name}: ");
                write_value(out, v, true);
            }
            out.push_str(" }");
        }
        ValueKind::Enum(data) => {
            let _ = write!(out, "{}::{}", data.enum_name, data.variant);
            if !data.payload.is_empty() {
                out.push('(');
                write_list(out, &data.payload);
                out.push(')');
            }
        }
        ValueKind::Buffer(bytes) => {
            let _ = write!(out, "<buffer len={}>", bytes.len());
        }
        ValueKind::Channel(_) => out.push_str("<channel>"),
        ValueKind::Closure(data) => match &data.callee {
            crate::value::Callee::Chunk(chunk) => match &chunk.name {
                Some(name) => {
                    let _ = write!(out, "<fn {name}>");
                }
                None => out.push_str("<fn>"),
            },
            crate::value::Callee::Native(_) => out.push_str("<native fn>"),
            crate::value::Callee::Extension(_) => out.push_str("<extension fn>"),
        },
        ValueKind::Ref(cell) => {
            out.push_str("ref(");
            write_value(out, &cell.read(), true);
            out.push(')');
        }
        ValueKind::Iterator(_) => out.push_str("<iterator>"),
    }
}

fn write_list(out: &mut String, items: &[Value]) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_value(out, item, true);
    }
}
