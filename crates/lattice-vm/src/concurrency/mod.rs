// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Structured concurrency: `scope { spawn ... }` and `select { ... }`.
//!
//! SCOPE first runs the sync sub-chunk in this VM, then spawns one OS
//! thread per spawn sub-chunk. Each thread owns an independent child VM
//! built from a deep snapshot of the parent environment, with the
//! parent's live locals exported as globals so the child resolves names
//! through `GETGLOBAL`. All threads join before SCOPE returns; the first
//! thread error becomes the scope's error.
//!
//! SELECT evaluates every channel expression once, then polls in a
//! shuffled order for fairness; when nothing is ready it parks on a
//! waiter registered with every channel, bounded by the timeout arm's
//! deadline when one exists.

#[cfg(test)]
mod concurrency_test;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::bytecode::{
    decode_a, decode_bx, ChunkRef, SELECT_ARM_BINDING, SELECT_ARM_DEFAULT, SELECT_ARM_TIMEOUT,
};
use crate::value::{Callee, Channel, SelectWaiter, TryRecv, Value, ValueKind};
use crate::vm::{Environment, Vm};

/// Decoded select-arm descriptor words.
struct ArmDesc {
    flags: u8,
    chan_idx: u16,
    body_idx: u16,
    binding_idx: u16,
}

impl Vm {
    /// `SCOPE dst, spawn_count` + data words.
    pub(crate) fn exec_scope(&mut self, dst: u8, spawn_count: u8) -> Result<(), String> {
        let sync_idx = decode_bx(self.read_data_word());
        let spawn_idxs: Vec<u16> = (0..spawn_count)
            .map(|_| decode_bx(self.read_data_word()))
            .collect();

        let sync_chunk = self.sub_chunk_constant(sync_idx)?;
        let spawn_chunks: Vec<ChunkRef> = spawn_idxs
            .iter()
            .map(|idx| self.sub_chunk_constant(*idx))
            .collect::<Result<_, _>>()?;

        // The sync body and the children resolve the parent's live locals
        // as globals; export them into a scope for the duration.
        let locals = self.live_locals();
        self.env.push_scope();
        for (name, value) in &locals {
            self.env.define(name, value.deep_clone());
        }

        let sync_result = self.run_nested_chunk(sync_chunk);
        // Children see the environment as of spawn time (post-sync).
        let snapshot = self.env.snapshot();
        self.env.pop_scope();
        let sync_value = sync_result?;

        log::debug!("scope: spawning {} thread(s)", spawn_chunks.len());
        let mut handles = Vec::with_capacity(spawn_chunks.len());
        for chunk in spawn_chunks {
            let child_env: Vec<(String, Value)> = snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.deep_clone()))
                .collect();
            let resolver = Arc::clone(&self.resolver);
            let options = self.options.clone();
            handles.push(std::thread::spawn(move || -> Result<Value, String> {
                let mut child = Vm::with_resolver(options, resolver);
                child.env = Environment::from_snapshot(child_env.into_iter().collect());
                child.run_nested_chunk(chunk)
            }));
        }

        let mut first_error: Option<String> = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(_)) => {}
                Ok(Err(message)) => {
                    if first_error.is_none() {
                        first_error = Some(message);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some("spawned thread panicked".to_string());
                    }
                }
            }
        }
        log::debug!("scope: all threads joined");
        if let Some(message) = first_error {
            return Err(message);
        }

        self.set_reg(dst, sync_value);
        Ok(())
    }

    /// `SELECT dst, arm_count` + three data words per arm.
    pub(crate) fn exec_select(&mut self, dst: u8, arm_count: u8) -> Result<(), String> {
        let arms: Vec<ArmDesc> = (0..arm_count)
            .map(|_| {
                let w1 = self.read_data_word();
                let w2 = self.read_data_word();
                let w3 = self.read_data_word();
                ArmDesc {
                    flags: decode_a(w1),
                    chan_idx: decode_bx(w1),
                    body_idx: decode_bx(w2),
                    binding_idx: decode_bx(w3),
                }
            })
            .collect();

        // Arm bodies resolve the parent's locals as globals.
        let locals = self.live_locals();
        self.env.push_scope();
        for (name, value) in &locals {
            self.env.define(name, value.deep_clone());
        }
        let outcome = self.select_loop(&arms);
        self.env.pop_scope();
        let value = outcome?;
        self.set_reg(dst, value);
        Ok(())
    }

    fn select_loop(&mut self, arms: &[ArmDesc]) -> Result<Value, String> {
        // Evaluate all channel expressions (and the timeout) once.
        let mut channels: Vec<(usize, Channel)> = Vec::new();
        let mut default_arm: Option<usize> = None;
        let mut deadline: Option<(usize, Instant)> = None;

        for (i, arm) in arms.iter().enumerate() {
            if arm.flags & SELECT_ARM_DEFAULT != 0 {
                default_arm = Some(i);
            } else if arm.flags & SELECT_ARM_TIMEOUT != 0 {
                let chunk = self.sub_chunk_constant(arm.chan_idx)?;
                let ms = self
                    .run_nested_chunk(chunk)?
                    .as_int()
                    .ok_or("timeout expects an Int millisecond value")?;
                let ms = u64::try_from(ms).unwrap_or(0);
                deadline = Some((i, Instant::now() + Duration::from_millis(ms)));
            } else {
                let chunk = self.sub_chunk_constant(arm.chan_idx)?;
                let value = self.run_nested_chunk(chunk)?;
                let ValueKind::Channel(ch) = value.kind else {
                    return Err(format!(
                        "select arm expects a channel, got {}",
                        value.type_name()
                    ));
                };
                channels.push((i, ch));
            }
        }

        // Shuffle the polling order once for fairness.
        let mut order: Vec<usize> = (0..channels.len()).collect();
        shuffle(&mut order);

        let waiter = Arc::new(SelectWaiter::new());
        loop {
            let mut closed = 0usize;
            let mut ready: Option<(usize, Value)> = None;
            for &slot in &order {
                let (arm_index, channel) = &channels[slot];
                match channel.try_recv() {
                    TryRecv::Value(value) => {
                        ready = Some((*arm_index, value));
                        break;
                    }
                    TryRecv::Closed => closed += 1,
                    TryRecv::Empty => {}
                }
            }
            if let Some((arm_index, value)) = ready {
                return self.run_select_body(arms, arm_index, Some(value));
            }

            if closed == channels.len() && !channels.is_empty() {
                // All channels closed: default arm or Unit.
                return match default_arm {
                    Some(i) => self.run_select_body(arms, i, None),
                    None => Ok(Value::unit()),
                };
            }
            if let Some(i) = default_arm {
                return self.run_select_body(arms, i, None);
            }
            if channels.is_empty() {
                // Only a timeout arm remains: park until the deadline.
                let Some((i, at)) = deadline else {
                    return Ok(Value::unit());
                };
                let now = Instant::now();
                if at > now {
                    std::thread::sleep(at - now);
                }
                return self.run_select_body(arms, i, None);
            }

            // Park on every channel until a send, a close, or the
            // deadline; then retry.
            waiter.reset();
            for (_, channel) in &channels {
                channel.register_waiter(&waiter);
            }
            let timed_out = waiter.wait_until(deadline.map(|(_, at)| at));
            for (_, channel) in &channels {
                channel.remove_waiter(&waiter);
            }
            if timed_out {
                if let Some((i, _)) = deadline {
                    return self.run_select_body(arms, i, None);
                }
            }
        }
    }

    fn run_select_body(
        &mut self,
        arms: &[ArmDesc],
        index: usize,
        received: Option<Value>,
    ) -> Result<Value, String> {
        let arm = &arms[index];
        let body = self.sub_chunk_constant(arm.body_idx)?;
        if arm.flags & SELECT_ARM_BINDING != 0 {
            let name = self.constant_str(arm.binding_idx)?;
            self.env.push_scope();
            self.env
                .define(&name, received.unwrap_or_default().deep_clone());
            let result = self.run_nested_chunk(body);
            self.env.pop_scope();
            result
        } else {
            self.run_nested_chunk(body)
        }
    }

    /// Fetch a sub-chunk prototype constant.
    pub(crate) fn sub_chunk_constant(&self, idx: u16) -> Result<ChunkRef, String> {
        let value = self
            .constant(idx)
            .ok_or("sub-chunk constant out of bounds")?;
        let ValueKind::Closure(data) = &value.kind else {
            return Err("corrupt sub-chunk constant".to_string());
        };
        let Callee::Chunk(chunk) = &data.callee else {
            return Err("corrupt sub-chunk constant".to_string());
        };
        Ok(Arc::clone(chunk))
    }

    /// Named locals of the current frame (for globals export).
    pub(crate) fn live_locals(&self) -> Vec<(String, Value)> {
        let frame = self.frame();
        let mut locals = Vec::new();
        for (reg, name) in frame.chunk.local_names.iter().enumerate() {
            let Some(name) = name else { continue };
            if name.is_empty() || reg >= frame.reg_count {
                continue;
            }
            locals.push((
                name.clone(),
                self.registers[frame.base + reg].clone_or_borrow(),
            ));
        }
        locals
    }
}

/// Fisher-Yates with a time-seeded xorshift64*; the pack carries no RNG
/// crate, and fairness only needs decorrelation, not quality.
#[expect(
    clippy::cast_possible_truncation,
    reason = "nanosecond seed and modulo index both truncate intentionally"
)]
fn shuffle(order: &mut [usize]) {
    let mut state = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0x9E37_79B9_7F4A_7C15, |d| d.as_nanos() as u64)
        | 1;
    let mut next = move || {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        state
    };
    for i in (1..order.len()).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }
}
