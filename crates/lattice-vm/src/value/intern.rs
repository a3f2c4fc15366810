// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Process-wide string interning.
//!
//! Strings at or below [`INTERN_MAX_LEN`] bytes are interned on load and
//! on concatenation. Interned strings enable pointer-equality fast paths
//! and zero-cost clones for string-heavy code. The table is shared across
//! all VMs in the process and never shrinks.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Strings at or below this byte length are interned.
pub const INTERN_MAX_LEN: usize = 64;

static INTERN_TABLE: OnceLock<Mutex<HashSet<Arc<str>>>> = OnceLock::new();

/// Intern a string, returning the canonical shared allocation.
#[must_use]
pub fn intern(s: &str) -> Arc<str> {
    let table = INTERN_TABLE.get_or_init(|| Mutex::new(HashSet::new()));
    let mut guard = table.lock();
    if let Some(existing) = guard.get(s) {
        return Arc::clone(existing);
    }
    let arc: Arc<str> = Arc::from(s);
    guard.insert(Arc::clone(&arc));
    arc
}
