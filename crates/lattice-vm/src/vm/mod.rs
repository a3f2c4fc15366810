// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The register virtual machine.
//!
//! Per-frame register windows are sliced out of one flat register stack;
//! the frame array is bounded by `VmOptions::frames_max`. Dispatch is a
//! single decode-and-match loop; calls into bytecode closures push frames
//! inline (no host recursion), while runtime services that re-enter the
//! VM (reactions, seeds, deferred bodies, `anneal`) run nested dispatch
//! loops that stop when the frame depth rewinds to their entry baseline.
//!
//! Errors raised by opcode preconditions and by `THROW` route through the
//! handler stack (§ exception model): the VM builds a structured error
//! map from the live state, tears down frames to the handler, and
//! delivers the map into the handler's error register. With no handler
//! active, a formatted `RuntimeError` is returned to the host.

#[cfg(test)]
mod vm_test;

mod call;
mod env;
mod handler;
mod ops;
mod phase_ops;

pub use env::Environment;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use lattice_core::Phase;
use thiserror::Error;

use crate::bytecode::{
    decode_a, decode_b, decode_bx, decode_c, decode_opcode, decode_sbx, decode_sbx24, decode_sc,
    op, ChunkRef, CHUNK_MAGIC,
};
use crate::modules::{FsResolver, ModuleResolver};
use crate::phase::PhaseServices;
use crate::value::{UpvalueCell, Value, ValueKind};

/// Default bound on the frame stack.
pub const FRAMES_MAX_DEFAULT: usize = 64;

/// Host-level extension function: the legacy string-protocol ABI. A
/// result prefixed with `EVAL_ERROR:` is thrown.
pub type ExtensionFn = Box<dyn Fn(&[Value]) -> String + Send + Sync>;

/// VM construction options.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum call depth (frame array bound).
    pub frames_max: usize,
    /// Package root searched for modules (after the stdlib).
    pub module_root: PathBuf,
    /// Built-in stdlib directory, searched first.
    pub stdlib_root: Option<PathBuf>,
    /// Echo `print` output to stdout in addition to the capture buffer.
    pub echo_print: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            frames_max: FRAMES_MAX_DEFAULT,
            module_root: PathBuf::from("lat_modules"),
            stdlib_root: None,
            echo_print: false,
        }
    }
}

/// Uncaught runtime error surfaced to the embedding host.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    /// Formatted message (thrown strings pass verbatim).
    pub message: String,
    /// Source line of the faulting instruction.
    pub line: u32,
    /// Synthesized stack trace, innermost first.
    pub stack: Vec<String>,
}

/// One call frame: a register window over the flat stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) chunk: ChunkRef,
    pub(crate) ip: usize,
    pub(crate) base: usize,
    pub(crate) reg_count: usize,
    pub(crate) upvalues: Vec<UpvalueCell>,
    pub(crate) caller_result_reg: Option<usize>,
    pub(crate) argc: u8,
    pub(crate) is_defer: bool,
    pub(crate) defer_parent: Option<usize>,
}

/// One exception-handler record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handler {
    pub(crate) catch_ip: usize,
    pub(crate) frame_index: usize,
    pub(crate) reg_watermark: usize,
    pub(crate) error_reg: usize,
}

/// One recorded deferred body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeferRecord {
    pub(crate) body_ip: usize,
    pub(crate) frame_index: usize,
    pub(crate) scope_depth: u8,
}

/// The virtual machine.
pub struct Vm {
    pub(crate) options: VmOptions,
    pub(crate) frames: Vec<Frame>,
    pub(crate) registers: Vec<Value>,
    pub(crate) open_upvalues: Vec<(usize, UpvalueCell)>,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) defers: Vec<DeferRecord>,
    pub(crate) env: Environment,
    pub(crate) services: PhaseServices,
    pub(crate) chunks: Vec<ChunkRef>,
    pub(crate) module_cache: HashMap<PathBuf, Value>,
    pub(crate) required: HashSet<PathBuf>,
    pub(crate) resolver: Arc<dyn ModuleResolver>,
    pub(crate) extensions: Vec<ExtensionFn>,
    pub(crate) output: Vec<String>,
    pub(crate) script_dir: Option<PathBuf>,
    pub(crate) ephemeral_epoch: u64,
}

impl Vm {
    /// Create a VM with default options and the filesystem resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolver(VmOptions::default(), Arc::new(FsResolver::new()))
    }

    /// Create a VM with explicit options and module resolver.
    #[must_use]
    pub fn with_resolver(options: VmOptions, resolver: Arc<dyn ModuleResolver>) -> Self {
        let mut env = Environment::new();
        crate::natives::install(&mut env);
        Self {
            options,
            frames: Vec::new(),
            registers: Vec::new(),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            defers: Vec::new(),
            env,
            services: PhaseServices::new(),
            chunks: Vec::new(),
            module_cache: HashMap::new(),
            required: HashSet::new(),
            resolver,
            extensions: Vec::new(),
            output: Vec::new(),
            script_dir: None,
            ephemeral_epoch: 0,
        }
    }

    /// Register a host extension function under a global name.
    pub fn register_extension(&mut self, name: &str, func: ExtensionFn) {
        let id =
            u16::try_from(self.extensions.len()).expect("extension registry bounded by u16");
        self.extensions.push(func);
        self.env.define(
            name,
            Value::closure(crate::value::ClosureData {
                callee: crate::value::Callee::Extension(id),
                upvalues: Vec::new(),
            }),
        );
    }

    /// Read a global binding after execution.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        self.env.get(name).map(Value::clone_or_borrow)
    }

    /// Drain the captured `print` output.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// Execute a top-level chunk to completion.
    ///
    /// # Errors
    ///
    /// Returns the formatted uncaught error, with line and stack context.
    pub fn run_chunk(&mut self, chunk: ChunkRef) -> Result<Value, RuntimeError> {
        if chunk.magic != CHUNK_MAGIC {
            return Err(RuntimeError {
                message: "not a register chunk (bad magic)".to_string(),
                line: 0,
                stack: Vec::new(),
            });
        }
        self.reset_ephemeral();
        self.chunks.push(Arc::clone(&chunk));
        let depth = self.frames.len();
        if let Err(message) = self.push_frame(chunk, Vec::new(), None, 0, false, None) {
            return Err(self.plain_error(message, 0));
        }
        let result = self.execute(depth + 1);
        if result.is_err() {
            self.teardown_to_depth(depth);
        }
        result
    }

    /// Reset the ephemeral region between top-level executions.
    pub(crate) fn reset_ephemeral(&mut self) {
        self.ephemeral_epoch += 1;
        log::trace!("ephemeral epoch {}", self.ephemeral_epoch);
    }

    /// Number of chunks tracked by this VM (freed together on drop).
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Set the executing script's directory (module search root).
    pub fn set_script_dir(&mut self, dir: PathBuf) {
        self.script_dir = Some(dir);
    }

    // --- Register access (top frame) ---

    #[inline]
    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("active frame")
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("active frame")
    }

    #[inline]
    pub(crate) fn abs(&self, reg: u8) -> usize {
        self.frame().base + reg as usize
    }

    #[inline]
    pub(crate) fn reg(&self, reg: u8) -> &Value {
        &self.registers[self.frame().base + reg as usize]
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, reg: u8, value: Value) {
        let idx = self.abs(reg);
        self.registers[idx] = value;
    }

    /// Register write that feeds history tracking when the slot has a
    /// debug name under tracking.
    pub(crate) fn set_reg_tracked(&mut self, reg: u8, value: Value) {
        if self.services.tracking_active() {
            let name = self.frame().chunk.local_name(reg).map(str::to_string);
            if let Some(name) = name {
                self.services.record(&name, &value);
            }
        }
        self.set_reg(reg, value);
    }

    /// Open a new frame over the register stack.
    pub(crate) fn push_frame(
        &mut self,
        chunk: ChunkRef,
        upvalues: Vec<UpvalueCell>,
        caller_result_reg: Option<usize>,
        argc: u8,
        is_defer: bool,
        defer_parent: Option<usize>,
    ) -> Result<usize, String> {
        if self.frames.len() >= self.options.frames_max {
            return Err("stack overflow (too many nested calls)".to_string());
        }
        let base = self.registers.len();
        // Variadic calls may deliver more arguments than the chunk's own
        // register demand; the window covers both.
        let reg_count = (chunk.max_reg as usize).max(argc as usize + 1).max(1);
        self.registers
            .resize_with(base + reg_count, Value::nil);
        self.registers[base] = Value::unit();
        self.frames.push(Frame {
            chunk,
            ip: 0,
            base,
            reg_count,
            upvalues,
            caller_result_reg,
            argc,
            is_defer,
            defer_parent,
        });
        Ok(base)
    }

    /// Pop the top frame: close upvalues over its window, clear its
    /// registers, drop its defers and handlers.
    pub(crate) fn pop_frame(&mut self) -> Frame {
        let frame = self.frames.pop().expect("frame to pop");
        self.close_upvalues(frame.base);
        self.registers.truncate(frame.base);
        let idx = self.frames.len();
        self.defers.retain(|d| d.frame_index < idx);
        self.handlers.retain(|h| h.frame_index < idx);
        frame
    }

    /// Tear down frames until only `depth` remain (abnormal exit).
    pub(crate) fn teardown_to_depth(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.pop_frame();
        }
    }

    /// The dispatch loop. Executes until the frame depth drops below
    /// `stop_depth`, returning the value produced by the exiting frame.
    pub(crate) fn execute(&mut self, stop_depth: usize) -> Result<Value, RuntimeError> {
        loop {
            debug_assert!(self.frames.len() >= stop_depth, "frame underflow");
            let frame = self.frame();
            let ip = frame.ip;
            if ip >= frame.chunk.code.len() {
                let line = frame.chunk.line_at(ip.saturating_sub(1));
                return Err(self.plain_error("instruction pointer out of bounds".to_string(), line));
            }
            let instr = frame.chunk.code[ip];
            let line = frame.chunk.lines[ip];
            self.frame_mut().ip = ip + 1;

            let opcode = decode_opcode(instr);
            let a = decode_a(instr);

            match opcode {
                // --- Loads ---
                op::LOADK => {
                    let bx = decode_bx(instr);
                    let value = match self.constant(bx) {
                        Some(v) => v,
                        None => {
                            self.deliver_message(
                                format!("constant index {bx} out of bounds"),
                                line,
                                stop_depth,
                            )?;
                            continue;
                        }
                    };
                    self.set_reg(a, value);
                }
                op::LOADI => {
                    let sbx = decode_sbx(instr);
                    self.set_reg(a, Value::int(i64::from(sbx)));
                }
                op::LOADNIL => self.set_reg(a, Value::nil()),
                op::LOADTRUE => self.set_reg(a, Value::bool(true)),
                op::LOADFALSE => self.set_reg(a, Value::bool(false)),
                op::LOADUNIT => self.set_reg(a, Value::unit()),
                op::MOVE => {
                    let b = decode_b(instr);
                    let value = self.reg(b).clone_or_borrow();
                    self.set_reg_tracked(a, value);
                }

                // --- Arithmetic / bitwise / comparison ---
                op::ADD | op::SUB | op::MUL | op::DIV | op::MOD => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.arith(opcode, a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::NEG => {
                    let b = decode_b(instr);
                    if let Err(msg) = self.negate(a, b) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::ADDI => {
                    let b = decode_b(instr);
                    let imm = decode_sc(instr);
                    if let Err(msg) = self.add_immediate(a, b, imm) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::ADD_INT | op::SUB_INT | op::MUL_INT | op::LT_INT | op::LTEQ_INT => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.int_specialized(opcode, a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::INC_REG | op::DEC_REG => {
                    if let Err(msg) = self.step_int(opcode, a) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::CONCAT => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    self.concat(a, b, c);
                }
                op::BAND | op::BOR | op::BXOR | op::LSHIFT | op::RSHIFT => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.bitwise(opcode, a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::BNOT => {
                    let b = decode_b(instr);
                    if let Err(msg) = self.bitwise_not(a, b) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::EQ | op::NEQ | op::LT | op::LTEQ | op::GT | op::GTEQ => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.compare(opcode, a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::NOT => {
                    let b = decode_b(instr);
                    let truthy = self.reg(b).is_truthy();
                    self.set_reg(a, Value::bool(!truthy));
                }

                // --- Branching ---
                op::JMP => {
                    let offset = decode_sbx24(instr);
                    self.jump(offset);
                }
                op::JMPFALSE => {
                    if !self.reg(a).is_truthy() {
                        self.jump(i32::from(decode_sbx(instr)));
                    }
                }
                op::JMPTRUE => {
                    if self.reg(a).is_truthy() {
                        self.jump(i32::from(decode_sbx(instr)));
                    }
                }
                op::JMPNOTNIL => {
                    if !self.reg(a).is_nil() {
                        self.jump(i32::from(decode_sbx(instr)));
                    }
                }

                // --- Globals / upvalues ---
                op::GETGLOBAL => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.get_global(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::SETGLOBAL => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.set_global(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::DEFINEGLOBAL => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.define_global(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::GETUPVALUE => {
                    let b = decode_b(instr);
                    let value = self.read_upvalue(b);
                    self.set_reg(a, value);
                }
                op::SETUPVALUE => {
                    let b = decode_b(instr);
                    self.write_upvalue(b, a);
                }
                op::CLOSEUPVALUE => {
                    let from = self.abs(a);
                    self.close_upvalues(from);
                }

                // --- Aggregate access ---
                op::GETFIELD => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.get_field(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::SETFIELD => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.set_field(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::GETINDEX => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.get_index(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::SETINDEX | op::SETINDEX_LOCAL => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    let tracked = opcode == op::SETINDEX_LOCAL;
                    if let Err(msg) = self.set_index(a, b, c, tracked) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::SETSLICE | op::SETSLICE_LOCAL => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.set_slice(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Aggregate construction ---
                op::NEWARRAY => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    let items = self.collect_run(b, c);
                    self.set_reg(a, Value::array(items));
                }
                op::NEWTUPLE => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    let items = self.collect_run(b, c);
                    self.set_reg(a, Value::tuple(items));
                }
                op::NEWSTRUCT => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    let data = self.read_data_word();
                    if let Err(msg) = self.new_struct(a, b, c, decode_bx(data)) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::NEWENUM => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    let data = self.read_data_word();
                    if let Err(msg) = self.new_enum(a, b, c, decode_bx(data)) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::BUILDRANGE => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.build_range(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Calls and closures ---
                op::CLOSURE => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.make_closure(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::CALL => {
                    let argc = decode_b(instr);
                    if let Err(msg) = self.do_call(a, argc, line) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::RETURN => {
                    let has_value = decode_b(instr) != 0;
                    let value = if has_value {
                        self.reg(a).clone_or_borrow()
                    } else {
                        Value::unit()
                    };
                    let frame = self.pop_frame();
                    if self.frames.len() < stop_depth {
                        return Ok(value);
                    }
                    if let Some(dst) = frame.caller_result_reg {
                        self.registers[dst] = value;
                    }
                }

                // --- Method dispatch ---
                op::INVOKE | op::INVOKE_LOCAL | op::INVOKE_GLOBAL => {
                    let site = ip;
                    let method_idx = decode_bx(instr);
                    let data = self.read_data_word();
                    if let Err(msg) = self.do_invoke(opcode, a, method_idx, data, site, line) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Phase operations ---
                op::FREEZE => {
                    let b = decode_b(instr);
                    let frozen = self.reg(b).frozen();
                    if let ValueKind::Channel(_) = frozen.kind {
                        self.deliver_message(
                            "cannot freeze a channel".to_string(),
                            line,
                            stop_depth,
                        )?;
                    } else {
                        self.set_reg(a, frozen);
                    }
                }
                op::THAW => {
                    let b = decode_b(instr);
                    let thawed = self.reg(b).thawed();
                    self.set_reg(a, thawed);
                }
                op::CLONE => {
                    let b = decode_b(instr);
                    let mut cloned = self.reg(b).deep_clone();
                    cloned.set_phase_recursive(Phase::Fluid);
                    self.set_reg(a, cloned);
                }
                op::FREEZE_VAR | op::THAW_VAR | op::SUBLIMATE_VAR => {
                    let slot = decode_b(instr);
                    let data = self.read_data_word();
                    let name_idx = decode_bx(data);
                    if let Err(msg) = self.phase_var_op(opcode, a, slot, name_idx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::FREEZE_FIELD | op::THAW_FIELD => {
                    let field_idx = decode_bx(instr);
                    if let Err(msg) = self.field_phase_op(opcode, a, field_idx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::FREEZE_EXCEPT => {
                    let data = self.read_data_word();
                    let (base, count) = (decode_b(data), decode_c(data));
                    if let Err(msg) = self.freeze_except(a, base, count) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::IS_CRYSTAL => {
                    let b = decode_b(instr);
                    let is = self.reg(b).phase == Phase::Crystal;
                    self.set_reg(a, Value::bool(is));
                }
                op::IS_FLUID => {
                    let b = decode_b(instr);
                    let is = self.reg(b).phase.is_mutable();
                    self.set_reg(a, Value::bool(is));
                }
                op::MARKFLUID => {
                    let idx = self.abs(a);
                    self.registers[idx].set_phase_recursive(Phase::Fluid);
                }
                op::SUBLIMATE => {
                    let idx = self.abs(a);
                    if matches!(self.registers[idx].kind, ValueKind::Channel(_)) {
                        self.deliver_message(
                            "cannot freeze a channel".to_string(),
                            line,
                            stop_depth,
                        )?;
                    } else {
                        self.registers[idx].set_phase_recursive(Phase::Sublimated);
                    }
                }

                // --- Reactive primitives ---
                op::REACT | op::UNREACT | op::BOND | op::UNBOND | op::SEED | op::UNSEED => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.reactive_op(opcode, a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Exceptions ---
                op::PUSH_HANDLER => {
                    let offset = decode_sbx(instr);
                    self.push_handler(a, offset);
                }
                op::POP_HANDLER => {
                    self.handlers.pop();
                }
                op::THROW => {
                    let value = self.reg(a).clone_or_borrow();
                    self.deliver_throw(value, line, stop_depth)?;
                }
                op::TRY_UNWRAP => {
                    match self.try_unwrap(a) {
                        Ok(None) => {}
                        Ok(Some(err_value)) => {
                            // Err: early-return the error value one frame up.
                            let frame = self.pop_frame();
                            if self.frames.len() < stop_depth {
                                return Ok(err_value);
                            }
                            if let Some(dst) = frame.caller_result_reg {
                                self.registers[dst] = err_value;
                            }
                        }
                        Err(msg) => self.deliver_message(msg, line, stop_depth)?,
                    }
                }

                // --- Defer ---
                op::DEFER_PUSH => {
                    let body_ip = self.frame().ip;
                    let frame_index = self.frames.len() - 1;
                    self.defers.push(DeferRecord {
                        body_ip,
                        frame_index,
                        scope_depth: a,
                    });
                    self.jump(i32::from(decode_sbx(instr)));
                }
                op::DEFER_RUN => {
                    if let Err(err) = self.run_defers(a, line) {
                        self.deliver_message(err.message, line, stop_depth)?;
                    }
                }

                // --- Iteration ---
                op::ITERINIT => {
                    let b = decode_b(instr);
                    if let Err(msg) = self.iter_init(a, b) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::ITERNEXT => {
                    let (b, c) = (decode_b(instr), decode_c(instr));
                    if let Err(msg) = self.iter_next(a, b, c) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::LEN => {
                    let b = decode_b(instr);
                    if let Err(msg) = self.length(a, b) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::COLLECT_VARARGS => {
                    self.collect_varargs(a);
                }

                // --- Type guard ---
                op::CHECK_TYPE => {
                    let ty_idx = decode_bx(instr);
                    let data = self.read_data_word();
                    let fmt_idx = decode_bx(data);
                    if let Err(msg) = self.check_type(a, ty_idx, fmt_idx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Module loading ---
                op::IMPORT => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.exec_import(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::REQUIRE => {
                    let bx = decode_bx(instr);
                    if let Err(msg) = self.exec_require(a, bx) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Concurrency ---
                op::SCOPE => {
                    let spawn_count = decode_b(instr);
                    if let Err(msg) = self.exec_scope(a, spawn_count) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }
                op::SELECT => {
                    let arm_count = decode_b(instr);
                    if let Err(msg) = self.exec_select(a, arm_count) {
                        self.deliver_message(msg, line, stop_depth)?;
                    }
                }

                // --- Misc ---
                op::HALT => {
                    if self.frame().is_defer {
                        self.defer_copy_back();
                        self.pop_frame();
                        if self.frames.len() < stop_depth {
                            return Ok(Value::unit());
                        }
                        continue;
                    }
                    let value = self.reg(a).clone_or_borrow();
                    self.pop_frame();
                    return Ok(value);
                }
                op::RESET_EPHEMERAL => self.reset_ephemeral(),

                // DATA words are consumed by their head instruction.
                _ => {
                    return Err(
                        self.plain_error(format!("invalid opcode {opcode} at ip {ip}"), line)
                    );
                }
            }
        }
    }

    /// Relative jump from the slot after the current instruction.
    #[inline]
    fn jump(&mut self, offset: i32) {
        let frame = self.frame_mut();
        let ip = frame.ip as i64 + i64::from(offset);
        frame.ip = usize::try_from(ip).unwrap_or(usize::MAX);
    }

    /// Read the next instruction slot as a data word.
    pub(crate) fn read_data_word(&mut self) -> u32 {
        let frame = self.frame_mut();
        let word = frame.chunk.code.get(frame.ip).copied().unwrap_or(0);
        frame.ip += 1;
        word
    }

    /// Fetch a constant by pool index, clone-or-borrow.
    pub(crate) fn constant(&self, idx: u16) -> Option<Value> {
        self.frame()
            .chunk
            .constants
            .get(idx as usize)
            .map(Value::clone_or_borrow)
    }

    /// Fetch a constant that must be a string (names, paths).
    pub(crate) fn constant_str(&self, idx: u16) -> Result<String, String> {
        match self.frame().chunk.constants.get(idx as usize) {
            Some(Value {
                kind: ValueKind::Str(s),
                ..
            }) => Ok(s.to_string()),
            _ => Err(format!("constant {idx} is not a name")),
        }
    }

    /// Copy a register run out of the top frame.
    pub(crate) fn collect_run(&self, base: u8, count: u8) -> Vec<Value> {
        let start = self.abs(base);
        (start..start + count as usize)
            .map(|i| self.registers[i].clone_or_borrow())
            .collect()
    }

    /// Pack excess variadic arguments into an array at `dest`.
    fn collect_varargs(&mut self, dest: u8) {
        let frame = self.frame();
        let argc = frame.argc as usize;
        let arity = frame.chunk.arity as usize;
        let base = frame.base;
        let items: Vec<Value> = (arity + 1..=argc)
            .map(|i| self.registers[base + i].clone_or_borrow())
            .collect();
        self.set_reg(dest, Value::array(items));
    }

    /// Build an uncaught `RuntimeError` with the current stack trace.
    pub(crate) fn plain_error(&self, message: String, line: u32) -> RuntimeError {
        RuntimeError {
            message,
            line,
            stack: self.stack_trace(),
        }
    }

    /// Synthesize the stack trace from chunk names and line tables.
    pub(crate) fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let line = frame.chunk.line_at(frame.ip.saturating_sub(1));
                match &frame.chunk.name {
                    Some(name) => format!("{name}() at line {line}"),
                    None => format!("<script> at line {line}"),
                }
            })
            .collect()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
