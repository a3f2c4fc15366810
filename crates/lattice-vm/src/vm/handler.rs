// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Exception handling and deferred-body execution.
//!
//! Throws unwind the frame stack with an explicit teardown loop (no
//! result-sum threading through dispatch): the structured error map is
//! built from the live state *before* frames are torn down, so the stack
//! trace reflects the throw site. Deferred bodies run in sub-frames
//! seeded with the parent's register image; modified registers copy back
//! on completion.

use std::sync::Arc;

use super::{DeferRecord, Handler, RuntimeError, Vm};
use crate::value::{print_value, MapData, MapKey, Value, ValueKind};

impl Vm {
    /// `PUSH_HANDLER err_reg, offset`: record a handler for the current
    /// frame; the catch block starts at `ip + offset`.
    pub(crate) fn push_handler(&mut self, err_reg: u8, offset: i16) {
        let frame = self.frame();
        let catch_ip = frame
            .ip
            .wrapping_add_signed(isize::try_from(offset).unwrap_or(0));
        let error_reg = frame.base + err_reg as usize;
        let frame_index = self.frames.len() - 1;
        let reg_watermark = self.registers.len();
        self.handlers.push(Handler {
            catch_ip,
            frame_index,
            reg_watermark,
            error_reg,
        });
    }

    /// Deliver a thrown value: unwind to the innermost handler eligible
    /// for this dispatch level, or return the formatted uncaught error.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` when no handler is active.
    pub(crate) fn deliver_throw(
        &mut self,
        value: Value,
        line: u32,
        stop_depth: usize,
    ) -> Result<(), RuntimeError> {
        // Handlers below the nested entry frame belong to an outer
        // dispatch loop; errors cross that boundary as plain errors so
        // they surface out of the triggering opcode.
        let eligible = self
            .handlers
            .last()
            .copied()
            .filter(|h| h.frame_index + 1 >= stop_depth);

        let Some(handler) = eligible else {
            let message = uncaught_message(&value);
            return Err(RuntimeError {
                message,
                line,
                stack: self.stack_trace(),
            });
        };
        self.handlers.pop();

        // Structured error map, built from the live state before unwind.
        let error_map = self.error_map(&value, line);

        while self.frames.len() > handler.frame_index + 1 {
            self.pop_frame();
        }
        debug_assert_eq!(self.registers.len(), handler.reg_watermark);
        self.registers.truncate(handler.reg_watermark);
        self.frame_mut().ip = handler.catch_ip;
        self.registers[handler.error_reg] = error_map;
        Ok(())
    }

    /// Raise a VM-internal precondition failure through the same path.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` when no handler is active.
    pub(crate) fn deliver_message(
        &mut self,
        message: String,
        line: u32,
        stop_depth: usize,
    ) -> Result<(), RuntimeError> {
        log::debug!("runtime error at line {line}: {message}");
        self.deliver_throw(Value::str(&message), line, stop_depth)
    }

    /// `{message, line, stack}` for the catch binding.
    fn error_map(&self, value: &Value, line: u32) -> Value {
        let message = match &value.kind {
            ValueKind::Str(s) => Value::str(s),
            _ => value.clone_or_borrow(),
        };
        let stack = Value::array(
            self.stack_trace()
                .into_iter()
                .map(|frame| Value::str(&frame))
                .collect(),
        );
        let mut data = MapData::default();
        data.entries
            .insert(MapKey::Str(Arc::from("message")), message);
        data.entries
            .insert(MapKey::Str(Arc::from("line")), Value::int(i64::from(line)));
        data.entries.insert(MapKey::Str(Arc::from("stack")), stack);
        Value::map_from(data)
    }

    /// `TRY_UNWRAP`: Ok unwraps in place (returns `None`); Err yields
    /// `Some(err value)` for the early return.
    pub(crate) fn try_unwrap(&mut self, a: u8) -> Result<Option<Value>, String> {
        let value = self.reg(a).clone_or_borrow();
        match &value.kind {
            ValueKind::Map(data) => {
                let tag = data
                    .entries
                    .get(&MapKey::Str(Arc::from("tag")))
                    .and_then(|v| v.as_str().map(str::to_string));
                let inner = data
                    .entries
                    .get(&MapKey::Str(Arc::from("value")))
                    .map_or_else(Value::unit, Value::clone_or_borrow);
                match tag.as_deref() {
                    Some("ok") => {
                        self.set_reg(a, inner);
                        Ok(None)
                    }
                    Some("err") => Ok(Some(value)),
                    _ => Err(format!(
                        "expected a Result value, got {}",
                        value.type_name()
                    )),
                }
            }
            ValueKind::Enum(data) => match data.variant.as_ref() {
                "Ok" => {
                    let inner = data
                        .payload
                        .first()
                        .map_or_else(Value::unit, Value::clone_or_borrow);
                    self.set_reg(a, inner);
                    Ok(None)
                }
                "Err" => Ok(Some(value)),
                _ => Err(format!(
                    "expected Ok or Err, got {}::{}",
                    data.enum_name, data.variant
                )),
            },
            _ => Err(format!(
                "expected a Result value, got {}",
                value.type_name()
            )),
        }
    }

    // --- Defers ---

    /// Run the current frame's deferreds with `scope_depth >= min_scope`,
    /// LIFO.
    pub(crate) fn run_defers(&mut self, min_scope: u8, _line: u32) -> Result<(), RuntimeError> {
        let frame_index = self.frames.len() - 1;
        loop {
            let Some(pos) = self
                .defers
                .iter()
                .rposition(|d| d.frame_index == frame_index && d.scope_depth >= min_scope)
            else {
                return Ok(());
            };
            let record = self.defers.remove(pos);
            self.run_one_defer(record)?;
        }
    }

    /// Execute one deferred body in a sub-frame over a copy of the
    /// parent's register image.
    fn run_one_defer(&mut self, record: DeferRecord) -> Result<(), RuntimeError> {
        let parent_index = record.frame_index;
        let (chunk, parent_base, parent_regs, upvalues, argc) = {
            let parent = &self.frames[parent_index];
            (
                Arc::clone(&parent.chunk),
                parent.base,
                parent.reg_count,
                parent.upvalues.clone(),
                parent.argc,
            )
        };

        let base = self
            .push_frame(chunk, upvalues, None, argc, true, Some(parent_index))
            .map_err(|message| self.plain_error(message, 0))?;
        for i in 0..parent_regs {
            self.registers[base + i] = self.registers[parent_base + i].clone_or_borrow();
        }
        self.frame_mut().ip = record.body_ip;

        let depth = self.frames.len();
        // Runs until the body's HALT copies back and pops the sub-frame.
        self.execute(depth).map(|_| ())
    }

    /// Copy a finished defer sub-frame's registers back to its parent.
    pub(crate) fn defer_copy_back(&mut self) {
        let frame = self.frame();
        let Some(parent_index) = frame.defer_parent else {
            return;
        };
        let base = frame.base;
        let count = frame.reg_count;
        let parent_base = self.frames[parent_index].base;
        let parent_count = self.frames[parent_index].reg_count;
        for i in 0..count.min(parent_count) {
            self.registers[parent_base + i] = self.registers[base + i].clone_or_borrow();
        }
    }
}

/// User-visible message for an uncaught throw: strings pass verbatim,
/// other values are wrapped.
fn uncaught_message(value: &Value) -> String {
    match &value.kind {
        ValueKind::Str(s) => s.to_string(),
        _ => format!("unhandled exception: {}", print_value(value)),
    }
}
