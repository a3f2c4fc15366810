// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Channels: the sole mutable cross-thread primitive.
//!
//! A channel is a FIFO queue with an optional capacity bound, guarded by
//! one lock and two condvars (senders wait for space, receivers wait for
//! values). `select` registers [`SelectWaiter`]s that are notified on
//! every send and on close so a blocked select can retry.
//!
//! Values crossing a channel must be Crystal or Unphased (enforced on
//! send). Channels are never frozen; freeze rejects them at freeze time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use lattice_core::Phase;
use parking_lot::{Condvar, Mutex};

use crate::value::Value;

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum TryRecv {
    /// A value was ready.
    Value(Value),
    /// Queue empty, channel still open.
    Empty,
    /// Channel closed and drained.
    Closed,
}

struct ChannelState {
    queue: VecDeque<Value>,
    closed: bool,
    waiters: Vec<Arc<SelectWaiter>>,
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    send_ok: Condvar,
    recv_ok: Condvar,
    capacity: usize,
}

/// A shared channel handle. Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Channel {
    /// Create a channel. Capacity 0 means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    queue: VecDeque::new(),
                    closed: false,
                    waiters: Vec::new(),
                }),
                send_ok: Condvar::new(),
                recv_ok: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Whether two handles refer to the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send a value, blocking while a bounded channel is full.
    ///
    /// # Errors
    ///
    /// Rejects values that are neither Crystal nor Unphased, and sends on
    /// a closed channel.
    pub fn send(&self, value: Value) -> Result<(), String> {
        if !matches!(value.phase, Phase::Crystal | Phase::Unphased) {
            return Err(format!(
                "cannot send a {} value across a channel (freeze it first)",
                value.phase.name()
            ));
        }
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err("cannot send on a closed channel".to_string());
            }
            if self.inner.capacity == 0 || state.queue.len() < self.inner.capacity {
                state.queue.push_back(value);
                for waiter in &state.waiters {
                    waiter.notify();
                }
                self.inner.recv_ok.notify_one();
                return Ok(());
            }
            self.inner.send_ok.wait(&mut state);
        }
    }

    /// Receive a value, blocking while the channel is empty.
    /// Returns `None` once the channel is closed and drained.
    #[must_use]
    pub fn recv(&self) -> Option<Value> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.queue.pop_front() {
                self.inner.send_ok.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            self.inner.recv_ok.wait(&mut state);
        }
    }

    /// Non-blocking receive.
    #[must_use]
    pub fn try_recv(&self) -> TryRecv {
        let mut state = self.inner.state.lock();
        if let Some(value) = state.queue.pop_front() {
            self.inner.send_ok.notify_one();
            TryRecv::Value(value)
        } else if state.closed {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    /// Close the channel, waking all blocked parties.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for waiter in &state.waiters {
            waiter.notify();
        }
        self.inner.send_ok.notify_all();
        self.inner.recv_ok.notify_all();
    }

    /// Whether the channel is closed (regardless of queued values).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of queued values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a select waiter, notified on send and close.
    pub fn register_waiter(&self, waiter: &Arc<SelectWaiter>) {
        self.inner.state.lock().waiters.push(Arc::clone(waiter));
    }

    /// Remove a previously registered waiter.
    pub fn remove_waiter(&self, waiter: &Arc<SelectWaiter>) {
        self.inner
            .state
            .lock()
            .waiters
            .retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

/// A one-shot wakeup flag shared between a blocked `select` and the
/// channels it waits on.
pub struct SelectWaiter {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Default for SelectWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectWaiter {
    /// Create an unsignaled waiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the waiter, waking a blocked `wait_until`.
    pub fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Reset the flag before re-registering.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until signaled or until the deadline passes (when given).
    /// Returns `true` if the deadline expired without a signal.
    #[must_use]
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        return true;
                    }
                    if self.cond.wait_until(&mut signaled, d).timed_out() {
                        return !*signaled;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        false
    }
}
