// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Hashable key domain for maps and sets.
//!
//! Map keys and set elements are restricted to values with a stable
//! equality: integers, booleans, strings, unit, nil, and tuples thereof.
//! Floats and mutable aggregates are rejected at insertion time.

use std::sync::Arc;

use crate::value::{Value, ValueKind};

/// A value usable as a map key or set element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// Integer key.
    Int(i64),
    /// Boolean key.
    Bool(bool),
    /// String key.
    Str(Arc<str>),
    /// Unit key.
    Unit,
    /// Nil key.
    Nil,
    /// Tuple key (all elements keyable).
    Tuple(Vec<MapKey>),
}

impl MapKey {
    /// Convert a value into a key, or report the offending type name.
    ///
    /// # Errors
    ///
    /// Returns the type name of the first unkeyable value encountered.
    pub fn try_from_value(value: &Value) -> Result<Self, &'static str> {
        match &value.kind {
            ValueKind::Int(n) => Ok(Self::Int(*n)),
            ValueKind::Bool(b) => Ok(Self::Bool(*b)),
            ValueKind::Str(s) => Ok(Self::Str(Arc::clone(s))),
            ValueKind::Unit => Ok(Self::Unit),
            ValueKind::Nil => Ok(Self::Nil),
            ValueKind::Tuple(items) => items
                .iter()
                .map(Self::try_from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Tuple),
            _ => Err(value.type_name()),
        }
    }

    /// Convert this key back into a value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::int(*n),
            Self::Bool(b) => Value::bool(*b),
            Self::Str(s) => Value::of(ValueKind::Str(Arc::clone(s))),
            Self::Unit => Value::unit(),
            Self::Nil => Value::nil(),
            Self::Tuple(items) => Value::tuple(items.iter().map(Self::to_value).collect()),
        }
    }
}
