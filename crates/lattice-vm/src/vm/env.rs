// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The global environment: a stack of name scopes.
//!
//! Scope 0 holds the true globals. `import` pushes an isolation scope for
//! the duration of the module's execution; reactions and cascades look
//! bindings up by name through the whole stack.

use std::collections::HashMap;

use crate::value::Value;

/// Scoped global bindings.
#[derive(Debug, Default)]
pub struct Environment {
    scopes: Vec<HashMap<String, Value>>,
}

impl Environment {
    /// Create an environment with the root scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    /// Look a name up, innermost scope first.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    /// Mutable lookup, innermost scope first.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }

    /// Assign to an existing binding. Returns `false` when unbound.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        false
    }

    /// Define a binding in the innermost scope.
    pub fn define(&mut self, name: &str, value: Value) {
        self.scopes
            .last_mut()
            .expect("environment root scope")
            .insert(name.to_string(), value);
    }

    /// Push an isolation scope (module execution, scope-body locals).
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the innermost scope, returning its bindings.
    pub fn pop_scope(&mut self) -> HashMap<String, Value> {
        debug_assert!(self.scopes.len() > 1, "root scope must remain");
        self.scopes.pop().unwrap_or_default()
    }

    /// Number of scopes (the root counts).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// All visible binding names (for error suggestions).
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.scopes
            .iter()
            .flat_map(|s| s.keys().map(String::as_str))
            .collect()
    }

    /// All bindings flattened (outer first), for spawn-time snapshots.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut flat = HashMap::new();
        for scope in &self.scopes {
            for (name, value) in scope {
                flat.insert(name.clone(), value.deep_clone());
            }
        }
        flat
    }

    /// Build a child environment from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: HashMap<String, Value>) -> Self {
        Self {
            scopes: vec![snapshot],
        }
    }
}
