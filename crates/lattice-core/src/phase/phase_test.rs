// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the phase type.

use super::*;

#[test]
fn default_is_unphased() {
    assert_eq!(Phase::default(), Phase::Unphased);
}

#[test]
fn mutability() {
    assert!(Phase::Unphased.is_mutable());
    assert!(Phase::Fluid.is_mutable());
    assert!(!Phase::Crystal.is_mutable());
    assert!(!Phase::Sublimated.is_mutable());
}

#[test]
fn frozen_phases() {
    assert!(!Phase::Unphased.is_frozen());
    assert!(!Phase::Fluid.is_frozen());
    assert!(Phase::Crystal.is_frozen());
    assert!(Phase::Sublimated.is_frozen());
}

#[test]
fn reaction_event_names() {
    assert_eq!(Phase::Crystal.event_name(), "crystal");
    assert_eq!(Phase::Fluid.event_name(), "fluid");
    assert_eq!(Phase::Unphased.event_name(), "fluid");
    assert_eq!(Phase::Sublimated.event_name(), "sublimated");
}
