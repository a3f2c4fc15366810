// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The phase of a value: Lattice's mutation policy.
//!
//! Every value carries a phase. Fluid values mutate freely, crystal values
//! reject in-place mutation, sublimated values reject all mutation.
//! `Unphased` is the default for values that were never explicitly phased.

#[cfg(test)]
mod phase_test;

/// Mutation policy of a value or binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// Default state: mutable, not explicitly phased.
    #[default]
    Unphased = 0,
    /// Explicitly mutable (relevant for per-field marks and overload
    /// dispatch, where Fluid is a stronger claim than Unphased).
    Fluid = 1,
    /// Frozen: in-place mutation is rejected.
    Crystal = 2,
    /// Frozen and non-observable by mutation; no transition out.
    Sublimated = 3,
}

impl Phase {
    /// Whether a value in this phase accepts in-place mutation.
    #[inline]
    #[must_use]
    pub const fn is_mutable(self) -> bool {
        matches!(self, Self::Unphased | Self::Fluid)
    }

    /// Whether this phase counts as frozen (crystal or sublimated).
    #[inline]
    #[must_use]
    pub const fn is_frozen(self) -> bool {
        matches!(self, Self::Crystal | Self::Sublimated)
    }

    /// The event name delivered to reactions on a transition into this
    /// phase: `"crystal"`, `"fluid"`, or `"sublimated"`.
    #[inline]
    #[must_use]
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::Unphased | Self::Fluid => "fluid",
            Self::Crystal => "crystal",
            Self::Sublimated => "sublimated",
        }
    }

    /// Phase name for error messages and `phases()` output.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unphased => "unphased",
            Self::Fluid => "fluid",
            Self::Crystal => "crystal",
            Self::Sublimated => "sublimated",
        }
    }
}
