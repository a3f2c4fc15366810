// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Call paths: closures, upvalues, phase-dispatch overloads, and the
//! INVOKE family with inline method caches.
//!
//! Calls into bytecode closures push a frame and stay in the same
//! dispatch loop. `call_value` is the re-entrant path used by reactions,
//! seeds, deferred bodies, builtins taking callbacks, and native
//! functions: it pushes a frame and runs a nested loop until the depth
//! rewinds to its baseline.

use std::sync::Arc;

use lattice_core::Phase;

use super::Vm;
use crate::builtins;
use crate::bytecode::{decode_a, decode_b, decode_bx, method_hash, op, PicHandler, CHUNK_MAGIC};
use crate::suggest;
use crate::value::{
    Callee, ClosureData, UpvalueCell, UpvalueState, Value, ValueKind,
};

impl Vm {
    // --- Upvalues ---

    /// Capture the register at absolute index `abs`, coalescing with any
    /// existing open cell over the same slot.
    pub(crate) fn capture_upvalue(&mut self, abs: usize) -> UpvalueCell {
        if let Some((_, cell)) = self.open_upvalues.iter().find(|(at, _)| *at == abs) {
            return Arc::clone(cell);
        }
        let cell: UpvalueCell = Arc::new(parking_lot::Mutex::new(UpvalueState::Open(abs)));
        let insert_at = self
            .open_upvalues
            .partition_point(|(at, _)| *at < abs);
        self.open_upvalues.insert(insert_at, (abs, Arc::clone(&cell)));
        cell
    }

    /// Close every open cell at or above `from`: the cell takes ownership
    /// of the captured value.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let split = self.open_upvalues.partition_point(|(at, _)| *at < from);
        for (abs, cell) in self.open_upvalues.split_off(split) {
            let value = self.registers[abs].deep_clone();
            *cell.lock() = UpvalueState::Closed(value);
        }
    }

    pub(crate) fn read_upvalue(&self, slot: u8) -> Value {
        let cell = Arc::clone(&self.frame().upvalues[slot as usize]);
        let state = cell.lock();
        match &*state {
            UpvalueState::Open(abs) => self.registers[*abs].clone_or_borrow(),
            UpvalueState::Closed(value) => value.clone_or_borrow(),
        }
    }

    pub(crate) fn write_upvalue(&mut self, slot: u8, src: u8) {
        let value = self.reg(src).deep_clone();
        let cell = Arc::clone(&self.frame().upvalues[slot as usize]);
        let mut state = cell.lock();
        match &mut *state {
            UpvalueState::Open(abs) => self.registers[*abs] = value,
            UpvalueState::Closed(slot_value) => *slot_value = value,
        }
    }

    // --- Closures ---

    /// `CLOSURE dst, proto`: build a closure from a prototype constant,
    /// consuming one descriptor data word per upvalue.
    pub(crate) fn make_closure(&mut self, dst: u8, proto_idx: u16) -> Result<(), String> {
        let proto = self
            .constant(proto_idx)
            .ok_or("closure prototype out of bounds")?;
        let ValueKind::Closure(proto_data) = &proto.kind else {
            return Err("closure prototype is not a function".to_string());
        };
        let Callee::Chunk(chunk) = &proto_data.callee else {
            return Err("closure prototype is not a compiled function".to_string());
        };
        let chunk = Arc::clone(chunk);

        let mut upvalues = Vec::with_capacity(chunk.upvalue_count as usize);
        for _ in 0..chunk.upvalue_count {
            let word = self.read_data_word();
            let is_local = decode_a(word) != 0;
            let index = decode_b(word);
            let cell = if is_local {
                let abs = self.frame().base + index as usize;
                self.capture_upvalue(abs)
            } else {
                Arc::clone(&self.frame().upvalues[index as usize])
            };
            upvalues.push(cell);
        }

        self.set_reg(
            dst,
            Value::closure(ClosureData {
                callee: Callee::Chunk(chunk),
                upvalues,
            }),
        );
        Ok(())
    }

    // --- Calls ---

    /// `CALL f, argc`: resolve the callee in `R(f)`, dispatch by kind.
    /// Arguments sit at `R(f+1)..`; the result replaces `R(f)`.
    pub(crate) fn do_call(&mut self, f: u8, argc: u8, _line: u32) -> Result<(), String> {
        let callee = self.reg(f).clone_or_borrow();
        let args_abs = self.abs(f) + 1;
        let result_abs = self.abs(f);

        let callee = match &callee.kind {
            ValueKind::Array(candidates) => {
                self.select_overload(candidates, args_abs, argc)?
            }
            _ => callee,
        };

        let ValueKind::Closure(data) = &callee.kind else {
            return Err(format!("cannot call {}", callee.type_name()));
        };

        match &data.callee {
            Callee::Native(id) => {
                let args = self.collect_args(args_abs, argc);
                let result = crate::natives::call_native(self, *id, &args)?;
                self.registers[result_abs] = result;
            }
            Callee::Extension(id) => {
                let args = self.collect_args(args_abs, argc);
                let result = self.call_extension(*id, &args)?;
                self.registers[result_abs] = result;
            }
            Callee::Chunk(chunk) => {
                let chunk = Arc::clone(chunk);
                self.check_chunk_call(&chunk, args_abs, argc)?;
                let upvalues = data.upvalues.clone();
                self.push_frame(chunk, upvalues, Some(result_abs), argc, false, None)?;
                let new_base = self.frame().base;
                for i in 0..argc as usize {
                    self.registers[new_base + 1 + i] =
                        self.registers[args_abs + i].clone_or_borrow();
                }
            }
        }
        Ok(())
    }

    /// Run a host extension; results prefixed `EVAL_ERROR:` are thrown.
    pub(crate) fn call_extension(&mut self, id: u16, args: &[Value]) -> Result<Value, String> {
        let func = self
            .extensions
            .get(id as usize)
            .ok_or("unknown extension function")?;
        let owned: Vec<Value> = args.iter().map(Value::deep_clone).collect();
        let result = func(&owned);
        match result.strip_prefix("EVAL_ERROR:") {
            Some(message) => Err(message.trim_start().to_string()),
            None => Ok(Value::str(&result)),
        }
    }

    /// Magic, arity, and parameter-phase validation for a chunk call.
    fn check_chunk_call(&self, chunk: &crate::bytecode::Chunk, args_abs: usize, argc: u8) -> Result<(), String> {
        if chunk.magic != CHUNK_MAGIC {
            return Err("cannot call a foreign function object".to_string());
        }
        if chunk.variadic {
            if argc < chunk.arity {
                return Err(format!(
                    "expected at least {} argument(s), got {argc}",
                    chunk.arity
                ));
            }
        } else if argc != chunk.arity {
            return Err(format!(
                "expected {} argument(s), got {argc}",
                chunk.arity
            ));
        }
        for (i, param) in chunk.param_phases.iter().enumerate() {
            if i >= argc as usize {
                break;
            }
            let arg = &self.registers[args_abs + i];
            if phase_incompatible(*param, arg.phase) {
                return Err(format!(
                    "parameter {} expects a {} value, got {}",
                    i + 1,
                    param.name(),
                    arg.phase.name()
                ));
            }
        }
        Ok(())
    }

    fn collect_args(&self, args_abs: usize, argc: u8) -> Vec<Value> {
        // Natives and extensions receive owned clones.
        (0..argc as usize)
            .map(|i| self.registers[args_abs + i].deep_clone())
            .collect()
    }

    /// Phase-dispatch overload selection over an array of candidates.
    ///
    /// Scoring per parameter: exact phase match 3, unphased-to-unphased
    /// 2, otherwise 1; candidates with any rejected pairing drop out.
    /// Stable order makes ties deterministic (first wins).
    pub(crate) fn select_overload(
        &self,
        candidates: &[Value],
        args_abs: usize,
        argc: u8,
    ) -> Result<Value, String> {
        let mut best: Option<(i32, &Value)> = None;
        for candidate in candidates {
            let ValueKind::Closure(data) = &candidate.kind else {
                continue;
            };
            let Callee::Chunk(chunk) = &data.callee else {
                continue;
            };
            if chunk.arity != argc && !chunk.variadic {
                continue;
            }
            let mut score = 0i32;
            let mut rejected = false;
            for i in 0..argc as usize {
                let param = chunk
                    .param_phases
                    .get(i)
                    .copied()
                    .unwrap_or(Phase::Unphased);
                let arg = self.registers[args_abs + i].phase;
                if phase_incompatible(param, arg) {
                    rejected = true;
                    break;
                }
                score += match (param, arg) {
                    (p, q) if p == q && p != Phase::Unphased => 3,
                    (Phase::Unphased, Phase::Unphased) => 2,
                    _ => 1,
                };
            }
            if rejected {
                continue;
            }
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((_, chosen)) => Ok(chosen.clone_or_borrow()),
            None => Err("no matching overload for the argument phases".to_string()),
        }
    }

    /// Re-entrant call used by runtime services and builtins with
    /// callbacks. Pushes a frame and runs a nested dispatch loop.
    pub(crate) fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, String> {
        let argc = u8::try_from(args.len()).map_err(|_| "too many arguments".to_string())?;
        match &callee.kind {
            ValueKind::Array(candidates) => {
                // Stage the arguments so overload scoring can see phases.
                let staged = self.registers.len();
                for arg in args {
                    self.registers.push(arg.clone_or_borrow());
                }
                let chosen = self.select_overload(candidates, staged, argc);
                self.registers.truncate(staged);
                self.call_value(&chosen?, args)
            }
            ValueKind::Closure(data) => match &data.callee {
                Callee::Native(id) => crate::natives::call_native(self, *id, args),
                Callee::Extension(id) => self.call_extension(*id, args),
                Callee::Chunk(chunk) => {
                    let chunk = Arc::clone(chunk);
                    if chunk.variadic {
                        if argc < chunk.arity {
                            return Err(format!(
                                "expected at least {} argument(s), got {argc}",
                                chunk.arity
                            ));
                        }
                    } else if argc != chunk.arity {
                        return Err(format!(
                            "expected {} argument(s), got {argc}",
                            chunk.arity
                        ));
                    }
                    let depth = self.frames.len();
                    let upvalues = data.upvalues.clone();
                    self.push_frame(chunk, upvalues, None, argc, false, None)?;
                    let base = self.frame().base;
                    for (i, arg) in args.iter().enumerate() {
                        self.registers[base + 1 + i] = arg.clone_or_borrow();
                    }
                    match self.execute(depth + 1) {
                        Ok(value) => Ok(value),
                        Err(err) => {
                            self.teardown_to_depth(depth);
                            Err(err.message)
                        }
                    }
                }
            },
            _ => Err(format!("cannot call {}", callee.type_name())),
        }
    }

    /// `DEFINEGLOBAL`: define a binding, auto-constructing overload
    /// arrays when a phase-constrained closure lands on a name that
    /// already holds one.
    pub(crate) fn define_global(&mut self, src: u8, name_idx: u16) -> Result<(), String> {
        let name = self.constant_str(name_idx)?;
        let value = self.reg(src).deep_clone();
        self.services.record(&name, &value);

        if is_phase_constrained(&value) {
            if let Some(existing) = self.env.get(&name).map(Value::clone_or_borrow) {
                match existing.kind {
                    ValueKind::Array(mut candidates)
                        if candidates.iter().all(is_phase_constrained) =>
                    {
                        candidates.push(value);
                        self.env.define(&name, Value::array(candidates));
                        return Ok(());
                    }
                    _ if is_phase_constrained(&existing) => {
                        self.env.define(&name, Value::array(vec![existing, value]));
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        self.env.define(&name, value);
        Ok(())
    }

    // --- Method dispatch (INVOKE family) ---

    /// Unified invoke: builtin PIC, then callable field, then
    /// `TypeName::method` in the environment, else an error with a
    /// nearest-name suggestion.
    pub(crate) fn do_invoke(
        &mut self,
        opcode: u8,
        dst: u8,
        method_idx: u16,
        data_word: u32,
        site: usize,
        _line: u32,
    ) -> Result<(), String> {
        let method = self.constant_str(method_idx)?;
        let argc = decode_a(data_word);
        let args_abs = self.abs(dst) + 1;
        let result_abs = self.abs(dst);
        let args: Vec<Value> = (0..argc as usize)
            .map(|i| self.registers[args_abs + i].clone_or_borrow())
            .collect();

        // Receiver: where it lives decides whether mutations write back.
        enum Site {
            Register(usize),
            Global(String),
        }
        let (mut receiver, recv_site, recv_name) = match opcode {
            op::INVOKE | op::INVOKE_LOCAL => {
                let obj_reg = decode_b(data_word);
                let obj_abs = self.frame().base + obj_reg as usize;
                let name = if opcode == op::INVOKE_LOCAL {
                    self.frame().chunk.local_name(obj_reg).map(str::to_string)
                } else {
                    None
                };
                let receiver = std::mem::take(&mut self.registers[obj_abs]);
                (receiver, Site::Register(obj_abs), name)
            }
            _ => {
                let name_idx = decode_bx(data_word);
                let global = self.constant_str(name_idx)?;
                let Some(slot) = self.env.get_mut(&global) else {
                    return Err(format!("undefined variable '{global}'"));
                };
                let receiver = std::mem::take(slot);
                (receiver, Site::Global(global.clone()), Some(global))
            }
        };

        let chunk = Arc::clone(&self.frame().chunk);
        let tag = receiver.type_tag();
        let hash = method_hash(&method);
        let handler = match chunk.pic_lookup(site, tag, hash) {
            Some(handler) => handler,
            None => {
                let resolved = builtins::lookup(tag, &method)
                    .map_or(PicHandler::NotBuiltin, PicHandler::Builtin);
                chunk.pic_install(site, tag, hash, resolved);
                resolved
            }
        };

        let result = match handler {
            PicHandler::Builtin(id) => {
                builtins::invoke(self, id, &mut receiver, &args, recv_name.as_deref())
            }
            PicHandler::NotBuiltin => {
                self.invoke_fallback(&receiver, &method, &args, recv_name.as_deref())
            }
        };

        // Write the receiver back before surfacing any error, so frozen
        // containers are not lost on phase violations.
        match recv_site {
            Site::Register(abs) => self.registers[abs] = receiver,
            Site::Global(name) => {
                self.env.set(&name, receiver);
            }
        }

        self.registers[result_abs] = result?;
        Ok(())
    }

    /// Non-builtin resolution shared by all three invoke forms.
    fn invoke_fallback(
        &mut self,
        receiver: &Value,
        method: &str,
        args: &[Value],
        _recv_name: Option<&str>,
    ) -> Result<Value, String> {
        // A callable field on a struct.
        if let ValueKind::Struct(data) = &receiver.kind {
            if let Some(idx) = data.field_index(method) {
                let field = data.fields[idx].1.clone_or_borrow();
                if field.is_closure() {
                    return self.call_value(&field, args);
                }
            }
        }

        // `TypeName::method` in the environment; the receiver becomes the
        // first argument.
        let type_name = match &receiver.kind {
            ValueKind::Struct(data) => data.name.to_string(),
            ValueKind::Enum(data) => data.enum_name.to_string(),
            _ => receiver.type_name().to_string(),
        };
        let qualified = format!("{type_name}::{method}");
        if let Some(func) = self.env.get(&qualified).map(Value::clone_or_borrow) {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(receiver.clone_or_borrow());
            full_args.extend(args.iter().map(Value::clone_or_borrow));
            return self.call_value(&func, &full_args);
        }

        // Unknown method: suggest the nearest builtin or impl method.
        let mut known: Vec<&str> = builtins::method_names(receiver.type_tag());
        let prefix = format!("{type_name}::");
        let impl_methods: Vec<String> = self
            .env
            .names()
            .into_iter()
            .filter_map(|n| n.strip_prefix(&prefix).map(str::to_string))
            .collect();
        known.extend(impl_methods.iter().map(String::as_str));
        match suggest::nearest(method, &known) {
            Some(similar) => Err(format!(
                "unknown method '{method}' on {type_name} (did you mean '{similar}'?)"
            )),
            None => Err(format!("unknown method '{method}' on {type_name}")),
        }
    }
}

/// Whether a value is a closure carrying parameter-phase constraints.
fn is_phase_constrained(value: &Value) -> bool {
    match &value.kind {
        ValueKind::Closure(data) => match &data.callee {
            Callee::Chunk(chunk) => !chunk.param_phases.is_empty(),
            _ => false,
        },
        _ => false,
    }
}

/// Overload rejection: a frozen argument cannot bind a fluid parameter
/// and a fluid argument cannot bind a crystal parameter.
fn phase_incompatible(param: Phase, arg: Phase) -> bool {
    matches!(
        (param, arg),
        (Phase::Fluid, Phase::Crystal | Phase::Sublimated)
            | (Phase::Crystal, Phase::Fluid)
    )
}
