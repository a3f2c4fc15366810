// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Phase opcodes: named freeze/thaw/sublimate with seeds, cascade, and
//! reactions; per-field phases; the reactive registration primitives.
//!
//! Freeze cascade: for every bond whose dependency includes the frozen
//! name under strategy `mirror`, the bond target is frozen the same way,
//! recursively. Cycles are tolerated via a visited set. Reactions fire
//! through the ordinary re-entrant call path, so reaction errors
//! propagate out of the triggering opcode.

use std::collections::HashSet;

use lattice_core::Phase;

use super::Vm;
use crate::bytecode::{
    op, FREEZE_VAR_CONSUME, FREEZE_VAR_WRAP, LOC_GLOBAL, LOC_MASK, LOC_REGISTER, LOC_UPVALUE,
};
use crate::phase::BondStrategy;
use crate::value::{MapKey, Value, ValueKind};

impl Vm {
    /// `FREEZE_VAR` / `THAW_VAR` / `SUBLIMATE_VAR`.
    pub(crate) fn phase_var_op(
        &mut self,
        opcode: u8,
        a_flags: u8,
        slot: u8,
        name_idx: u16,
    ) -> Result<(), String> {
        let name = self.constant_str(name_idx)?;
        let loc_type = a_flags & LOC_MASK;
        let consume = a_flags & FREEZE_VAR_CONSUME != 0;
        let wrap = a_flags & FREEZE_VAR_WRAP != 0;

        let target_phase = match opcode {
            op::FREEZE_VAR => Phase::Crystal,
            op::THAW_VAR => Phase::Fluid,
            op::SUBLIMATE_VAR => Phase::Sublimated,
            _ => unreachable!("phase var opcode"),
        };

        let current = self.read_var(loc_type, slot, &name)?;
        if target_phase.is_frozen() && matches!(current.kind, ValueKind::Channel(_)) {
            return Err("cannot freeze a channel".to_string());
        }

        // Seed contracts run against the pre-freeze value.
        if opcode == op::FREEZE_VAR && consume {
            for seed in self.services.seeds_for(&name) {
                let verdict = match self.call_value(&seed, &[current.clone_or_borrow()]) {
                    Ok(v) => v,
                    Err(err) => {
                        return Err(if wrap {
                            format!("freeze contract failed: {err}")
                        } else {
                            err
                        });
                    }
                };
                if !verdict.is_truthy() {
                    let message = format!("seed contract rejected freeze of '{name}'");
                    return Err(if wrap {
                        format!("freeze contract failed: {message}")
                    } else {
                        message
                    });
                }
            }
            self.services.consume_seeds(&name);
        }

        let mut updated = current;
        updated.set_phase_recursive(target_phase);
        self.write_var(loc_type, slot, &name, updated.clone_or_borrow())?;

        // Mirror into the environment so cascade and reaction lookups by
        // name succeed even for register-resident bindings.
        if !self.env.set(&name, updated.clone_or_borrow()) {
            self.env.define(&name, updated);
        }

        if opcode == op::FREEZE_VAR {
            let mut visited = HashSet::new();
            visited.insert(name.clone());
            self.freeze_cascade(&name, &mut visited)?;
        }
        self.fire_reactions(&name, target_phase.event_name())
    }

    fn read_var(&mut self, loc_type: u8, slot: u8, name: &str) -> Result<Value, String> {
        match loc_type {
            LOC_REGISTER => Ok(self.reg(slot).clone_or_borrow()),
            LOC_UPVALUE => Ok(self.read_upvalue(slot)),
            LOC_GLOBAL => self
                .env
                .get(name)
                .map(Value::clone_or_borrow)
                .ok_or_else(|| format!("undefined variable '{name}'")),
            _ => Err("corrupt phase-location descriptor".to_string()),
        }
    }

    fn write_var(&mut self, loc_type: u8, slot: u8, name: &str, value: Value) -> Result<(), String> {
        match loc_type {
            LOC_REGISTER => {
                self.set_reg(slot, value);
                Ok(())
            }
            LOC_UPVALUE => {
                // Stage through the slot's cell directly.
                let cell = std::sync::Arc::clone(&self.frame().upvalues[slot as usize]);
                let mut state = cell.lock();
                match &mut *state {
                    crate::value::UpvalueState::Open(abs) => self.registers[*abs] = value,
                    crate::value::UpvalueState::Closed(slot_value) => *slot_value = value,
                }
                Ok(())
            }
            LOC_GLOBAL => {
                if self.env.set(name, value) {
                    Ok(())
                } else {
                    Err(format!("undefined variable '{name}'"))
                }
            }
            _ => Err("corrupt phase-location descriptor".to_string()),
        }
    }

    /// Freeze every mirror-bond target of `dep`, recursively.
    pub(crate) fn freeze_cascade(
        &mut self,
        dep: &str,
        visited: &mut HashSet<String>,
    ) -> Result<(), String> {
        for target in self.services.mirror_targets_of(dep) {
            if !visited.insert(target.clone()) {
                continue;
            }
            log::trace!("freeze cascade: {dep} -> {target}");
            if let Some(value) = self.env.get(&target).map(Value::clone_or_borrow) {
                if matches!(value.kind, ValueKind::Channel(_)) {
                    return Err("cannot freeze a channel".to_string());
                }
                let mut frozen = value;
                frozen.set_phase_recursive(Phase::Crystal);
                self.env.set(&target, frozen);
            }
            self.freeze_cascade(&target, visited)?;
            self.fire_reactions(&target, "crystal")?;
        }
        Ok(())
    }

    /// Invoke every reaction registered for `name` with the event string.
    pub(crate) fn fire_reactions(&mut self, name: &str, event: &str) -> Result<(), String> {
        for callback in self.services.reactions_for(name) {
            self.call_value(&callback, &[Value::str(event)])?;
        }
        Ok(())
    }

    /// `FREEZE_FIELD` / `THAW_FIELD`: per-field phase marks.
    pub(crate) fn field_phase_op(&mut self, opcode: u8, a: u8, field_idx: u16) -> Result<(), String> {
        let field = self.constant_str(field_idx)?;
        let mark = if opcode == op::FREEZE_FIELD {
            Phase::Crystal
        } else {
            Phase::Fluid
        };
        let idx = self.abs(a);
        match &mut self.registers[idx].kind {
            ValueKind::Struct(data) => {
                let Some(field_idx) = data.field_index(&field) else {
                    return Err(format!("struct '{}' has no field '{field}'", data.name));
                };
                data.set_field_phase(field_idx, mark);
                Ok(())
            }
            ValueKind::Map(data) => {
                data.set_key_phase(MapKey::Str(std::sync::Arc::from(field.as_str())), mark);
                Ok(())
            }
            _ => Err(format!(
                "cannot set field phases on {}",
                self.registers[idx].type_name()
            )),
        }
    }

    /// `FREEZE_EXCEPT`: freeze the container, marking the exempted
    /// fields/keys fluid.
    pub(crate) fn freeze_except(&mut self, a: u8, base: u8, count: u8) -> Result<(), String> {
        let exempt: Vec<String> = self
            .collect_run(base, count)
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let idx = self.abs(a);
        let target = &mut self.registers[idx];
        match &mut target.kind {
            ValueKind::Struct(data) => {
                for i in 0..data.fields.len() {
                    let name = data.fields[i].0.to_string();
                    let mark = if exempt.contains(&name) {
                        Phase::Fluid
                    } else {
                        Phase::Crystal
                    };
                    data.set_field_phase(i, mark);
                }
            }
            ValueKind::Map(data) => {
                let keys: Vec<MapKey> = data.entries.keys().cloned().collect();
                for key in keys {
                    let is_exempt = matches!(&key, MapKey::Str(s) if exempt.contains(&s.to_string()));
                    let mark = if is_exempt { Phase::Fluid } else { Phase::Crystal };
                    data.set_key_phase(key, mark);
                }
            }
            _ => {
                return Err(format!(
                    "cannot partially freeze {}",
                    target.type_name()
                ))
            }
        }
        target.phase = Phase::Crystal;
        Ok(())
    }

    /// `REACT` / `UNREACT` / `BOND` / `UNBOND` / `SEED` / `UNSEED`.
    pub(crate) fn reactive_op(&mut self, opcode: u8, a: u8, name_idx: u16) -> Result<(), String> {
        let name = self.constant_str(name_idx)?;
        match opcode {
            op::REACT => {
                let callback = self.reg(a).deep_clone();
                if !callback.is_closure() {
                    return Err(format!(
                        "react expects a function, got {}",
                        callback.type_name()
                    ));
                }
                self.services.register_reaction(&name, callback);
            }
            op::UNREACT => self.services.remove_reactions(&name),
            op::BOND => {
                let ValueKind::Tuple(pair) = &self.reg(a).kind else {
                    return Err("corrupt bond descriptor".to_string());
                };
                let dep = pair
                    .first()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or("corrupt bond descriptor")?;
                let strategy = pair
                    .get(1)
                    .and_then(|v| v.as_str())
                    .map_or(BondStrategy::Mirror, BondStrategy::parse);
                self.services.bond(&name, &dep, strategy);
            }
            op::UNBOND => self.services.unbond(&name),
            op::SEED => {
                let predicate = self.reg(a).deep_clone();
                if !predicate.is_closure() {
                    return Err(format!(
                        "seed expects a function, got {}",
                        predicate.type_name()
                    ));
                }
                self.services.plant_seed(&name, predicate);
            }
            op::UNSEED => self.services.unseed(&name),
            _ => unreachable!("reactive opcode"),
        }
        Ok(())
    }
}
