// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Phase runtime services: reactions, bonds, seeds, pressures, history.
//!
//! This module owns the per-VM registries keyed by variable name. The
//! cascade algorithm itself lives in the dispatch loop (it re-enters the
//! VM to freeze bond targets and run reaction callbacks); these types are
//! pure bookkeeping.


use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::value::Value;

/// Bond strategy. Only `mirror` has defined semantics: when the dep is
/// frozen, the target is frozen too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondStrategy {
    /// Freeze the target when the dependency freezes.
    Mirror,
    /// Unknown strategy, carried for diagnostics.
    Other(String),
}

impl BondStrategy {
    /// Parse a strategy name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        if name == "mirror" {
            Self::Mirror
        } else {
            Self::Other(name.to_string())
        }
    }
}

/// One bond edge: the target depends on `dep` under `strategy`.
#[derive(Debug, Clone)]
pub struct Bond {
    /// Dependency variable name.
    pub dep: String,
    /// Propagation strategy.
    pub strategy: BondStrategy,
}

/// Mutation-mode restriction on a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureMode {
    /// Blocks push and insert.
    NoGrow,
    /// Blocks pop and remove.
    NoShrink,
    /// Blocks both directions.
    NoResize,
}

impl PressureMode {
    /// Parse a pressure-mode name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "no_grow" => Some(Self::NoGrow),
            "no_shrink" => Some(Self::NoShrink),
            "no_resize" => Some(Self::NoResize),
            _ => None,
        }
    }

    /// The mode name used in violation messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoGrow => "no_grow",
            Self::NoShrink => "no_shrink",
            Self::NoResize => "no_resize",
        }
    }
}

/// Direction of a size-changing mutation, checked against pressures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    /// push / insert
    Grow,
    /// pop / remove
    Shrink,
}

/// One history snapshot of a tracked binding.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// When the store happened.
    pub at: Instant,
    /// The stored value (deep clone).
    pub value: Value,
}

/// Per-VM phase-service registries.
#[derive(Debug, Default)]
pub struct PhaseServices {
    reactions: HashMap<String, Vec<Value>>,
    bonds: HashMap<String, Vec<Bond>>,
    seeds: HashMap<String, Vec<Value>>,
    pressures: HashMap<String, Vec<PressureMode>>,
    history: HashMap<String, Vec<HistoryEntry>>,
    tracked: HashSet<String>,
}

impl PhaseServices {
    /// Create empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // --- Reactions ---

    /// Register a reaction callback for a variable name.
    pub fn register_reaction(&mut self, name: &str, callback: Value) {
        self.reactions
            .entry(name.to_string())
            .or_default()
            .push(callback);
    }

    /// Remove all reactions for a variable name.
    pub fn remove_reactions(&mut self, name: &str) {
        self.reactions.remove(name);
    }

    /// Callbacks registered for a variable name (cloned so the caller can
    /// re-enter the VM without holding a borrow).
    #[must_use]
    pub fn reactions_for(&self, name: &str) -> Vec<Value> {
        self.reactions.get(name).cloned().unwrap_or_default()
    }

    // --- Bonds ---

    /// Bond `target` to `dep` under `strategy`.
    pub fn bond(&mut self, target: &str, dep: &str, strategy: BondStrategy) {
        self.bonds.entry(target.to_string()).or_default().push(Bond {
            dep: dep.to_string(),
            strategy,
        });
    }

    /// Remove all bonds of a target.
    pub fn unbond(&mut self, target: &str) {
        self.bonds.remove(target);
    }

    /// Targets whose mirror bonds include `dep` as a dependency.
    #[must_use]
    pub fn mirror_targets_of(&self, dep: &str) -> Vec<String> {
        self.bonds
            .iter()
            .filter(|(_, edges)| {
                edges
                    .iter()
                    .any(|b| b.dep == dep && b.strategy == BondStrategy::Mirror)
            })
            .map(|(target, _)| target.clone())
            .collect()
    }

    // --- Seeds ---

    /// Plant a seed contract for a variable name.
    pub fn plant_seed(&mut self, name: &str, predicate: Value) {
        self.seeds
            .entry(name.to_string())
            .or_default()
            .push(predicate);
    }

    /// Remove all seeds for a variable name.
    pub fn unseed(&mut self, name: &str) {
        self.seeds.remove(name);
    }

    /// Seeds planted for a variable name (cloned).
    #[must_use]
    pub fn seeds_for(&self, name: &str) -> Vec<Value> {
        self.seeds.get(name).cloned().unwrap_or_default()
    }

    /// Consume the seeds of a name: validated-and-fired seeds are removed.
    pub fn consume_seeds(&mut self, name: &str) {
        self.seeds.remove(name);
    }

    // --- Pressures ---

    /// Pressurize a name with a mode.
    pub fn pressurize(&mut self, name: &str, mode: PressureMode) {
        self.pressures
            .entry(name.to_string())
            .or_default()
            .push(mode);
    }

    /// Remove all pressures of a name.
    pub fn depressurize(&mut self, name: &str) {
        self.pressures.remove(name);
    }

    /// The pressure mode blocking `op` on `name`, if any.
    #[must_use]
    pub fn pressure_blocking(&self, name: &str, op: MutationOp) -> Option<PressureMode> {
        let modes = self.pressures.get(name)?;
        modes
            .iter()
            .find(|mode| match op {
                MutationOp::Grow => {
                    matches!(mode, PressureMode::NoGrow | PressureMode::NoResize)
                }
                MutationOp::Shrink => {
                    matches!(mode, PressureMode::NoShrink | PressureMode::NoResize)
                }
            })
            .copied()
    }

    // --- History ---

    /// Start tracking stores to a name.
    pub fn track(&mut self, name: &str) {
        self.tracked.insert(name.to_string());
    }

    /// Fast check used at register-set sites: is anything tracked at all?
    #[must_use]
    pub fn tracking_active(&self) -> bool {
        !self.tracked.is_empty()
    }

    /// Whether a specific name is tracked.
    #[must_use]
    pub fn is_tracked(&self, name: &str) -> bool {
        self.tracked.contains(name)
    }

    /// Record a store to a tracked name.
    pub fn record(&mut self, name: &str, value: &Value) {
        if !self.tracked.contains(name) {
            return;
        }
        self.history
            .entry(name.to_string())
            .or_default()
            .push(HistoryEntry {
                at: Instant::now(),
                value: value.deep_clone(),
            });
    }

    /// The recorded history of a name, oldest first.
    #[must_use]
    pub fn history_of(&self, name: &str) -> &[HistoryEntry] {
        self.history.get(name).map_or(&[], Vec::as_slice)
    }

    /// The value `n` stores back from the latest, if recorded.
    #[must_use]
    pub fn rewind(&self, name: &str, n: usize) -> Option<Value> {
        let entries = self.history.get(name)?;
        if n == 0 || n > entries.len() {
            return None;
        }
        Some(entries[entries.len() - n].value.clone())
    }
}
