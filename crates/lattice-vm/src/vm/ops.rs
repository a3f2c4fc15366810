// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Opcode helpers: arithmetic, comparison, aggregate access and
//! construction, iteration, type guards, and globals.
//!
//! Every helper returns `Err(message)` for precondition failures; the
//! dispatch loop routes those through the exception-handler path.

use lattice_core::Phase;

use super::Vm;
use crate::bytecode::op;
use crate::suggest;
use crate::value::{print_value, EnumData, MapKey, StructData, Value, ValueKind};

impl Vm {
    // --- Arithmetic ---

    pub(crate) fn arith(&mut self, opcode: u8, a: u8, b: u8, c: u8) -> Result<(), String> {
        let lhs = self.reg(b);
        let rhs = self.reg(c);
        let result = match (&lhs.kind, &rhs.kind) {
            (ValueKind::Int(x), ValueKind::Int(y)) => {
                let (x, y) = (*x, *y);
                match opcode {
                    op::ADD => Value::int(x.wrapping_add(y)),
                    op::SUB => Value::int(x.wrapping_sub(y)),
                    op::MUL => Value::int(x.wrapping_mul(y)),
                    op::DIV => {
                        if y == 0 {
                            return Err("division by zero".to_string());
                        }
                        Value::int(x.wrapping_div(y))
                    }
                    op::MOD => {
                        if y == 0 {
                            return Err("modulo by zero".to_string());
                        }
                        Value::int(x.wrapping_rem(y))
                    }
                    _ => unreachable!("arith opcode"),
                }
            }
            (ValueKind::Float(_) | ValueKind::Int(_), ValueKind::Float(_) | ValueKind::Int(_)) => {
                let x = numeric(lhs).unwrap_or(0.0);
                let y = numeric(rhs).unwrap_or(0.0);
                let f = match opcode {
                    op::ADD => x + y,
                    op::SUB => x - y,
                    op::MUL => x * y,
                    op::DIV => {
                        if y == 0.0 {
                            return Err("division by zero".to_string());
                        }
                        x / y
                    }
                    op::MOD => {
                        if y == 0.0 {
                            return Err("modulo by zero".to_string());
                        }
                        x % y
                    }
                    _ => unreachable!("arith opcode"),
                };
                Value::float(f)
            }
            (ValueKind::Str(x), ValueKind::Str(y)) if opcode == op::ADD => {
                Value::str_ephemeral(format!("{x}{y}"))
            }
            (ValueKind::Array(x), ValueKind::Array(y)) if opcode == op::ADD => {
                let mut joined = x.clone();
                joined.extend(y.iter().map(Value::clone_or_borrow));
                Value::array(joined)
            }
            _ => {
                let verb = match opcode {
                    op::ADD => "add",
                    op::SUB => "subtract",
                    op::MUL => "multiply",
                    op::DIV => "divide",
                    _ => "apply % to",
                };
                return Err(format!(
                    "cannot {verb} {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ));
            }
        };
        self.set_reg(a, result);
        Ok(())
    }

    pub(crate) fn negate(&mut self, a: u8, b: u8) -> Result<(), String> {
        let result = match self.reg(b).kind {
            ValueKind::Int(n) => Value::int(n.wrapping_neg()),
            ValueKind::Float(f) => Value::float(-f),
            _ => return Err(format!("cannot negate {}", self.reg(b).type_name())),
        };
        self.set_reg(a, result);
        Ok(())
    }

    pub(crate) fn add_immediate(&mut self, a: u8, b: u8, imm: i8) -> Result<(), String> {
        let result = match self.reg(b).kind {
            ValueKind::Int(n) => Value::int(n.wrapping_add(i64::from(imm))),
            ValueKind::Float(f) => Value::float(f + f64::from(imm)),
            _ => {
                return Err(format!(
                    "cannot add {} and Int",
                    self.reg(b).type_name()
                ))
            }
        };
        self.set_reg(a, result);
        Ok(())
    }

    /// Specialized integer ops for statically-typed hot loops.
    pub(crate) fn int_specialized(&mut self, opcode: u8, a: u8, b: u8, c: u8) -> Result<(), String> {
        let (Some(x), Some(y)) = (self.reg(b).as_int(), self.reg(c).as_int()) else {
            return Err(format!(
                "expected Int operands, got {} and {}",
                self.reg(b).type_name(),
                self.reg(c).type_name()
            ));
        };
        let result = match opcode {
            op::ADD_INT => Value::int(x.wrapping_add(y)),
            op::SUB_INT => Value::int(x.wrapping_sub(y)),
            op::MUL_INT => Value::int(x.wrapping_mul(y)),
            op::LT_INT => Value::bool(x < y),
            op::LTEQ_INT => Value::bool(x <= y),
            _ => unreachable!("int specialized opcode"),
        };
        self.set_reg(a, result);
        Ok(())
    }

    pub(crate) fn step_int(&mut self, opcode: u8, a: u8) -> Result<(), String> {
        let idx = self.abs(a);
        let ValueKind::Int(n) = self.registers[idx].kind else {
            return Err(format!(
                "expected Int counter, got {}",
                self.registers[idx].type_name()
            ));
        };
        let next = if opcode == op::INC_REG {
            n.wrapping_add(1)
        } else {
            n.wrapping_sub(1)
        };
        self.registers[idx] = Value::int(next);
        Ok(())
    }

    /// String build: both operands stringify, result in the ephemeral
    /// region.
    pub(crate) fn concat(&mut self, a: u8, b: u8, c: u8) {
        let mut s = print_value(self.reg(b));
        s.push_str(&print_value(self.reg(c)));
        self.set_reg(a, Value::str_ephemeral(s));
    }

    pub(crate) fn bitwise(&mut self, opcode: u8, a: u8, b: u8, c: u8) -> Result<(), String> {
        let (Some(x), Some(y)) = (self.reg(b).as_int(), self.reg(c).as_int()) else {
            return Err(format!(
                "bitwise operations require Int operands, got {} and {}",
                self.reg(b).type_name(),
                self.reg(c).type_name()
            ));
        };
        let result = match opcode {
            op::BAND => x & y,
            op::BOR => x | y,
            op::BXOR => x ^ y,
            op::LSHIFT => x.wrapping_shl(u32::try_from(y & 0x3F).unwrap_or(0)),
            op::RSHIFT => x.wrapping_shr(u32::try_from(y & 0x3F).unwrap_or(0)),
            _ => unreachable!("bitwise opcode"),
        };
        self.set_reg(a, Value::int(result));
        Ok(())
    }

    pub(crate) fn bitwise_not(&mut self, a: u8, b: u8) -> Result<(), String> {
        let Some(x) = self.reg(b).as_int() else {
            return Err(format!(
                "bitwise not requires an Int operand, got {}",
                self.reg(b).type_name()
            ));
        };
        self.set_reg(a, Value::int(!x));
        Ok(())
    }

    // --- Comparison ---

    pub(crate) fn compare(&mut self, opcode: u8, a: u8, b: u8, c: u8) -> Result<(), String> {
        let result = match opcode {
            op::EQ | op::NEQ => {
                let eq = self.values_equal(b, c)?;
                if opcode == op::EQ {
                    eq
                } else {
                    !eq
                }
            }
            _ => {
                let lhs = self.reg(b);
                let rhs = self.reg(c);
                let ordering = match (&lhs.kind, &rhs.kind) {
                    (ValueKind::Int(x), ValueKind::Int(y)) => x.partial_cmp(y),
                    (
                        ValueKind::Float(_) | ValueKind::Int(_),
                        ValueKind::Float(_) | ValueKind::Int(_),
                    ) => numeric(lhs).partial_cmp(&numeric(rhs)),
                    (ValueKind::Str(x), ValueKind::Str(y)) => x.partial_cmp(y),
                    _ => None,
                };
                let Some(ordering) = ordering else {
                    return Err(format!(
                        "cannot compare {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ));
                };
                match opcode {
                    op::LT => ordering.is_lt(),
                    op::LTEQ => ordering.is_le(),
                    op::GT => ordering.is_gt(),
                    op::GTEQ => ordering.is_ge(),
                    _ => unreachable!("comparison opcode"),
                }
            }
        };
        self.set_reg(a, Value::bool(result));
        Ok(())
    }

    /// Structural equality; structs defer to a user `eq` method when one
    /// is registered for the type.
    fn values_equal(&mut self, b: u8, c: u8) -> Result<bool, String> {
        let lhs = self.reg(b);
        let rhs = self.reg(c);
        if let (ValueKind::Struct(x), ValueKind::Struct(y)) = (&lhs.kind, &rhs.kind) {
            if x.name == y.name {
                let method = format!("{}::eq", x.name);
                if let Some(eq) = self.env.get(&method).map(Value::clone_or_borrow) {
                    let args = [lhs.clone_or_borrow(), rhs.clone_or_borrow()];
                    let verdict = self.call_value(&eq, &args)?;
                    return Ok(verdict.is_truthy());
                }
            }
        }
        Ok(self.reg(b) == self.reg(c))
    }

    // --- Globals ---

    pub(crate) fn get_global(&mut self, a: u8, name_idx: u16) -> Result<(), String> {
        let name = self.constant_str(name_idx)?;
        match self.env.get(&name).map(Value::clone_or_borrow) {
            Some(value) => {
                self.set_reg(a, value);
                Ok(())
            }
            None => {
                let candidates: Vec<&str> = self.env_names();
                match suggest::nearest(&name, &candidates) {
                    Some(similar) => Err(format!(
                        "undefined variable '{name}' (did you mean '{similar}'?)"
                    )),
                    None => Err(format!("undefined variable '{name}'")),
                }
            }
        }
    }

    pub(crate) fn set_global(&mut self, a: u8, name_idx: u16) -> Result<(), String> {
        let name = self.constant_str(name_idx)?;
        let value = self.reg(a).deep_clone();
        self.services.record(&name, &value);
        if self.env.set(&name, value) {
            Ok(())
        } else {
            Err(format!("undefined variable '{name}'"))
        }
    }

    pub(crate) fn env_names(&self) -> Vec<&str> {
        // Suggestion candidates: globals plus the current frame's locals.
        let mut names: Vec<&str> = self.env.names();
        if let Some(frame) = self.frames.last() {
            names.extend(
                frame
                    .chunk
                    .local_names
                    .iter()
                    .filter_map(|n| n.as_deref()),
            );
        }
        names
    }

    // --- Aggregate access ---

    pub(crate) fn get_field(&mut self, a: u8, b: u8, name_c: u8) -> Result<(), String> {
        let field = self.field_name(name_c)?;
        let obj = self.reg(b);
        let value = read_field(obj, &field)?;
        self.set_reg(a, value);
        Ok(())
    }

    pub(crate) fn set_field(&mut self, a: u8, name_b: u8, src: u8) -> Result<(), String> {
        let field = self.field_name(name_b)?;
        let value = self.reg(src).clone_or_borrow();
        let idx = self.abs(a);
        write_field(&mut self.registers[idx], &field, value)
    }

    fn field_name(&self, idx: u8) -> Result<String, String> {
        self.constant_str(u16::from(idx))
    }

    pub(crate) fn get_index(&mut self, a: u8, b: u8, c: u8) -> Result<(), String> {
        let value = read_index(self.reg(b), self.reg(c))?;
        self.set_reg(a, value);
        Ok(())
    }

    pub(crate) fn set_index(&mut self, a: u8, b: u8, c: u8, tracked: bool) -> Result<(), String> {
        let key = self.reg(b).clone_or_borrow();
        let value = self.reg(c).clone_or_borrow();
        let idx = self.abs(a);
        write_index(&mut self.registers[idx], &key, value)?;
        if tracked && self.services.tracking_active() {
            let name = self.frame().chunk.local_name(a).map(str::to_string);
            if let Some(name) = name {
                let snapshot = self.registers[idx].clone_or_borrow();
                self.services.record(&name, &snapshot);
            }
        }
        Ok(())
    }

    pub(crate) fn set_slice(&mut self, a: u8, b: u8, c: u8) -> Result<(), String> {
        let range = self.reg(b).clone_or_borrow();
        let ValueKind::Range(lo, hi) = range.kind else {
            return Err(format!("slice bounds must be a Range, got {}", range.type_name()));
        };
        let replacement = self.reg(c).clone_or_borrow();
        let ValueKind::Array(new_items) = replacement.kind else {
            return Err(format!(
                "slice assignment requires an Array, got {}",
                replacement.type_name()
            ));
        };
        let idx = self.abs(a);
        let target = &mut self.registers[idx];
        if !target.phase.is_mutable() {
            return Err("cannot modify a frozen value".to_string());
        }
        let ValueKind::Array(items) = &mut target.kind else {
            return Err(format!("cannot splice into {}", target.type_name()));
        };
        let len = items.len();
        let lo = clamp_index(lo, len);
        let hi = clamp_index(hi, len).max(lo);
        items.splice(lo..hi, new_items);
        Ok(())
    }

    pub(crate) fn build_range(&mut self, a: u8, b: u8, c: u8) -> Result<(), String> {
        let (Some(lo), Some(hi)) = (self.reg(b).as_int(), self.reg(c).as_int()) else {
            return Err(format!(
                "range bounds must be Int, got {} and {}",
                self.reg(b).type_name(),
                self.reg(c).type_name()
            ));
        };
        self.set_reg(a, Value::range(lo, hi));
        Ok(())
    }

    // --- Construction ---

    pub(crate) fn new_struct(
        &mut self,
        a: u8,
        base: u8,
        count: u8,
        names_idx: u16,
    ) -> Result<(), String> {
        let Some(names) = self.constant(names_idx) else {
            return Err("malformed struct literal".to_string());
        };
        let ValueKind::Array(names) = &names.kind else {
            return Err("malformed struct literal".to_string());
        };
        let struct_name = names
            .first()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or("malformed struct literal")?;
        let literal_fields: Vec<String> = names[1..]
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        // Declaration-order metadata registered by the struct declaration.
        let meta_key = format!("__struct_{struct_name}");
        let Some(meta) = self.env.get(&meta_key).map(Value::clone_or_borrow) else {
            return Err(format!("unknown struct '{struct_name}'"));
        };
        let decl = struct_metadata(&meta)
            .ok_or_else(|| format!("corrupt metadata for struct '{struct_name}'"))?;

        let values = self.collect_run(base, count);
        let mut fields: Vec<(std::sync::Arc<str>, Value)> = Vec::with_capacity(decl.len());
        let mut phases: Vec<Phase> = Vec::with_capacity(decl.len());
        let mut any_phase = false;

        for (field_name, phase) in &decl {
            let Some(pos) = literal_fields.iter().position(|f| f == field_name) else {
                return Err(format!(
                    "missing field '{field_name}' in struct literal '{struct_name}'"
                ));
            };
            let value = values
                .get(pos)
                .map(Value::deep_clone)
                .unwrap_or_default();
            fields.push((std::sync::Arc::from(field_name.as_str()), value));
            phases.push(*phase);
            if *phase != Phase::Unphased {
                any_phase = true;
            }
        }
        // Reject unknown literal fields.
        for literal in &literal_fields {
            if !decl.iter().any(|(f, _)| f == literal) {
                return Err(format!(
                    "struct '{struct_name}' has no field '{literal}'"
                ));
            }
        }

        let data = StructData {
            name: std::sync::Arc::from(struct_name.as_str()),
            fields,
            field_phases: any_phase.then_some(phases),
        };
        self.set_reg(a, Value::of(ValueKind::Struct(Box::new(data))));
        Ok(())
    }

    pub(crate) fn new_enum(
        &mut self,
        a: u8,
        base: u8,
        count: u8,
        tag_idx: u16,
    ) -> Result<(), String> {
        let tag = self.constant_str(tag_idx)?;
        let Some((enum_name, variant)) = tag.split_once("::") else {
            return Err(format!("malformed enum tag '{tag}'"));
        };

        // Validate the variant and arity when metadata is registered.
        let meta_key = format!("__enum_{enum_name}");
        if let Some(meta) = self.env.get(&meta_key).map(Value::clone_or_borrow) {
            if let Some(variants) = enum_metadata(&meta) {
                match variants.iter().find(|(name, _)| name == variant) {
                    Some((_, arity)) => {
                        if *arity != usize::from(count) {
                            return Err(format!(
                                "{enum_name}::{variant} expects {arity} value(s), got {count}"
                            ));
                        }
                    }
                    None => {
                        return Err(format!("enum '{enum_name}' has no variant '{variant}'"));
                    }
                }
            }
        }

        let payload = self
            .collect_run(base, count)
            .into_iter()
            .map(|v| v.deep_clone())
            .collect();
        let data = EnumData {
            enum_name: std::sync::Arc::from(enum_name),
            variant: std::sync::Arc::from(variant),
            payload,
        };
        self.set_reg(a, Value::of(ValueKind::Enum(Box::new(data))));
        Ok(())
    }

    // --- Iteration ---

    pub(crate) fn iter_init(&mut self, a: u8, b: u8) -> Result<(), String> {
        let source = self.reg(b);
        let items: Vec<Value> = match &source.kind {
            // Already-array passthrough.
            ValueKind::Array(_) => {
                let passthrough = source.clone_or_borrow();
                self.set_reg(a, passthrough);
                return Ok(());
            }
            ValueKind::Tuple(items) => items.iter().map(Value::clone_or_borrow).collect(),
            ValueKind::Map(data) => data
                .entries
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone_or_borrow()]))
                .collect(),
            ValueKind::Set(data) => data.entries.iter().map(MapKey::to_value).collect(),
            ValueKind::Str(s) => s.chars().map(|c| Value::str(&c.to_string())).collect(),
            ValueKind::Range(lo, hi) => (*lo..*hi).map(Value::int).collect(),
            ValueKind::Buffer(bytes) => bytes.iter().map(|b| Value::int(i64::from(*b))).collect(),
            ValueKind::Iterator(iter) => {
                let mut state = iter.lock();
                let pos = state.pos.min(state.items.len());
                let rest = state.items.split_off(pos);
                let len = state.items.len();
                state.pos = len;
                rest
            }
            _ => return Err(format!("cannot iterate {}", source.type_name())),
        };
        self.set_reg(a, Value::array(items));
        Ok(())
    }

    pub(crate) fn iter_next(&mut self, a: u8, b: u8, c: u8) -> Result<(), String> {
        let Some(index) = self.reg(c).as_int() else {
            return Err("iterator index corrupted".to_string());
        };
        let next = {
            let ValueKind::Array(items) = &self.reg(b).kind else {
                return Err(format!("cannot iterate {}", self.reg(b).type_name()));
            };
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .map(Value::clone_or_borrow)
        };
        match next {
            Some(value) => {
                self.set_reg(a, value);
                self.set_reg(c, Value::int(index + 1));
            }
            None => self.set_reg(a, Value::nil()),
        }
        Ok(())
    }

    pub(crate) fn length(&mut self, a: u8, b: u8) -> Result<(), String> {
        let len = match &self.reg(b).kind {
            ValueKind::Array(items) | ValueKind::Tuple(items) => items.len(),
            ValueKind::Str(s) => s.chars().count(),
            ValueKind::Map(data) => data.entries.len(),
            ValueKind::Set(data) => data.entries.len(),
            ValueKind::Buffer(bytes) => bytes.len(),
            ValueKind::Range(lo, hi) => usize::try_from(hi - lo).unwrap_or(0),
            ValueKind::Channel(ch) => ch.len(),
            _ => return Err(format!("{} has no length", self.reg(b).type_name())),
        };
        self.set_reg(a, Value::int(i64::try_from(len).unwrap_or(i64::MAX)));
        Ok(())
    }

    // --- Type guard ---

    pub(crate) fn check_type(&mut self, a: u8, ty_idx: u16, fmt_idx: u16) -> Result<(), String> {
        let expected = self.constant_str(ty_idx)?;
        let value = self.reg(a);
        let actual = value.type_name();
        let matches = match (&value.kind, expected.as_str()) {
            (_, "Any") => true,
            (ValueKind::Struct(data), name) if data.name.as_ref() == name => true,
            (ValueKind::Enum(data), name) if data.enum_name.as_ref() == name => true,
            (ValueKind::Int(_) | ValueKind::Float(_), "Num") => true,
            _ => actual == expected,
        };
        if matches {
            return Ok(());
        }
        let format = self.constant_str(fmt_idx)?;
        Err(format.replace("{got}", actual))
    }
}

/// Numeric view of a value (Int promotes to Float).
#[expect(clippy::cast_precision_loss, reason = "mixed-mode arithmetic promotion")]
fn numeric(value: &Value) -> Option<f64> {
    match value.kind {
        ValueKind::Int(n) => Some(n as f64),
        ValueKind::Float(f) => Some(f),
        _ => None,
    }
}

fn clamp_index(i: i64, len: usize) -> usize {
    usize::try_from(i).map_or(0, |i| i.min(len))
}

/// Field read on structs and maps (missing map keys yield nil; missing
/// struct fields are errors).
pub(crate) fn read_field(obj: &Value, field: &str) -> Result<Value, String> {
    match &obj.kind {
        ValueKind::Struct(data) => match data.field_index(field) {
            Some(idx) => Ok(data.fields[idx].1.clone_or_borrow()),
            None => {
                let fields: Vec<&str> = data.fields.iter().map(|(n, _)| n.as_ref()).collect();
                match suggest::nearest(field, &fields) {
                    Some(similar) => Err(format!(
                        "struct '{}' has no field '{field}' (did you mean '{similar}'?)",
                        data.name
                    )),
                    None => Err(format!("struct '{}' has no field '{field}'", data.name)),
                }
            }
        },
        ValueKind::Map(data) => {
            let key = MapKey::Str(std::sync::Arc::from(field));
            Ok(data
                .entries
                .get(&key)
                .map_or_else(Value::nil, Value::clone_or_borrow))
        }
        ValueKind::Nil => Err(format!("cannot read field '{field}' of Nil")),
        _ => Err(format!(
            "cannot read field '{field}' of {}",
            obj.type_name()
        )),
    }
}

/// Field write with per-field phase checks.
pub(crate) fn write_field(obj: &mut Value, field: &str, value: Value) -> Result<(), String> {
    let container_phase = obj.phase;
    match &mut obj.kind {
        ValueKind::Struct(data) => {
            let Some(idx) = data.field_index(field) else {
                return Err(format!("struct '{}' has no field '{field}'", data.name));
            };
            if data.field_is_frozen(idx, container_phase) {
                return Err("cannot modify a frozen value".to_string());
            }
            data.fields[idx].1 = value.deep_clone();
            Ok(())
        }
        ValueKind::Map(data) => {
            let key = MapKey::Str(std::sync::Arc::from(field));
            if data.key_is_frozen(&key, container_phase) {
                return Err("cannot modify a frozen value".to_string());
            }
            data.entries.insert(key, value.deep_clone());
            Ok(())
        }
        _ => Err(format!(
            "cannot write field '{field}' of {}",
            obj.type_name()
        )),
    }
}

/// Index read across the indexable kinds.
pub(crate) fn read_index(obj: &Value, key: &Value) -> Result<Value, String> {
    match (&obj.kind, &key.kind) {
        (ValueKind::Array(items), ValueKind::Int(i)) => items
            .get(checked_index(*i, items.len())?)
            .map(Value::clone_or_borrow)
            .ok_or_else(|| format!("index {i} out of bounds (len {})", items.len())),
        (ValueKind::Array(items), ValueKind::Range(lo, hi)) => {
            let lo = clamp_index(*lo, items.len());
            let hi = clamp_index(*hi, items.len()).max(lo);
            Ok(Value::array(
                items[lo..hi].iter().map(Value::clone_or_borrow).collect(),
            ))
        }
        (ValueKind::Tuple(items), ValueKind::Int(i)) => items
            .get(checked_index(*i, items.len())?)
            .map(Value::clone_or_borrow)
            .ok_or_else(|| format!("index {i} out of bounds (len {})", items.len())),
        (ValueKind::Str(s), ValueKind::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            chars
                .get(checked_index(*i, chars.len())?)
                .map(|c| Value::str(&c.to_string()))
                .ok_or_else(|| format!("index {i} out of bounds (len {})", chars.len()))
        }
        (ValueKind::Str(s), ValueKind::Range(lo, hi)) => {
            let chars: Vec<char> = s.chars().collect();
            let lo = clamp_index(*lo, chars.len());
            let hi = clamp_index(*hi, chars.len()).max(lo);
            Ok(Value::str(&chars[lo..hi].iter().collect::<String>()))
        }
        (ValueKind::Buffer(bytes), ValueKind::Int(i)) => bytes
            .get(checked_index(*i, bytes.len())?)
            .map(|b| Value::int(i64::from(*b)))
            .ok_or_else(|| format!("index {i} out of bounds (len {})", bytes.len())),
        (ValueKind::Map(data), _) => {
            let key = MapKey::try_from_value(key)
                .map_err(|t| format!("cannot use {t} as a map key"))?;
            Ok(data
                .entries
                .get(&key)
                .map_or_else(Value::nil, Value::clone_or_borrow))
        }
        (ValueKind::Struct(_), ValueKind::Str(s)) => read_field(obj, s),
        _ => Err(format!(
            "cannot index {} with {}",
            obj.type_name(),
            key.type_name()
        )),
    }
}

/// Index write with phase checks.
pub(crate) fn write_index(obj: &mut Value, key: &Value, value: Value) -> Result<(), String> {
    let container_phase = obj.phase;
    if !container_phase.is_mutable() {
        // Maps and structs may still have fluid-marked slots.
        if !matches!(obj.kind, ValueKind::Map(_) | ValueKind::Struct(_)) {
            return Err("cannot modify a frozen value".to_string());
        }
    }
    match (&mut obj.kind, &key.kind) {
        (ValueKind::Array(items), ValueKind::Int(i)) => {
            let idx = checked_index(*i, items.len())?;
            if idx >= items.len() {
                return Err(format!("index {i} out of bounds (len {})", items.len()));
            }
            items[idx] = value.deep_clone();
            Ok(())
        }
        (ValueKind::Buffer(bytes), ValueKind::Int(i)) => {
            let idx = checked_index(*i, bytes.len())?;
            if idx >= bytes.len() {
                return Err(format!("index {i} out of bounds (len {})", bytes.len()));
            }
            let Some(byte) = value.as_int().and_then(|n| u8::try_from(n).ok()) else {
                return Err("buffer elements must be Int 0..=255".to_string());
            };
            bytes[idx] = byte;
            Ok(())
        }
        (ValueKind::Map(data), _) => {
            let key = MapKey::try_from_value(key)
                .map_err(|t| format!("cannot use {t} as a map key"))?;
            if data.key_is_frozen(&key, container_phase) {
                return Err("cannot modify a frozen value".to_string());
            }
            data.entries.insert(key, value.deep_clone());
            Ok(())
        }
        (ValueKind::Struct(_), ValueKind::Str(s)) => {
            let field = s.to_string();
            write_field(obj, &field, value)
        }
        _ => Err(format!(
            "cannot index {} with {}",
            obj.type_name(),
            key.type_name()
        )),
    }
}

fn checked_index(i: i64, len: usize) -> Result<usize, String> {
    if i < 0 {
        // Negative indices count from the end.
        let from_end = usize::try_from(i.unsigned_abs())
            .map_err(|_| format!("index {i} out of bounds (len {len})"))?;
        len.checked_sub(from_end)
            .ok_or_else(|| format!("index {i} out of bounds (len {len})"))
    } else {
        usize::try_from(i).map_err(|_| "index out of bounds".to_string())
    }
}

/// Decode `__struct_<name>` metadata: `[(field, phase), ...]`.
fn struct_metadata(meta: &Value) -> Option<Vec<(String, Phase)>> {
    let ValueKind::Array(entries) = &meta.kind else {
        return None;
    };
    let mut decl = Vec::with_capacity(entries.len());
    for entry in entries {
        let ValueKind::Tuple(pair) = &entry.kind else {
            return None;
        };
        let name = pair.first()?.as_str()?.to_string();
        let phase = match pair.get(1)?.as_str()? {
            "fluid" => Phase::Fluid,
            "crystal" => Phase::Crystal,
            "sublimated" => Phase::Sublimated,
            _ => Phase::Unphased,
        };
        decl.push((name, phase));
    }
    Some(decl)
}

/// Decode `__enum_<name>` metadata: `[(variant, arity), ...]`.
fn enum_metadata(meta: &Value) -> Option<Vec<(String, usize)>> {
    let ValueKind::Array(entries) = &meta.kind else {
        return None;
    };
    let mut variants = Vec::with_capacity(entries.len());
    for entry in entries {
        let ValueKind::Tuple(pair) = &entry.kind else {
            return None;
        };
        let name = pair.first()?.as_str()?.to_string();
        let arity = usize::try_from(pair.get(1)?.as_int()?).ok()?;
        variants.push((name, arity));
    }
    Some(variants)
}
