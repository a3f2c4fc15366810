// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Register compiler: lowers an AST `Program` to bytecode `Chunk`s.
//!
//! One chunk is produced for the top-level script, plus transitively one
//! per function, closure, match sub-body, spawn body, select arm body,
//! and select-arm channel expression.
//!
//! ## Register discipline
//!
//! Register allocation is a stack: `alloc_reg` bumps the frontier,
//! `free_reg` only releases the top, `free_regs_to` collapses to a
//! watermark. Every block-valued construct produces its result into a
//! caller-specified `dst` register, propagated recursively into tail
//! position. Binary operators compile operands into separate temporaries
//! so `dst` may alias a source register without clobbering it.

#[cfg(test)]
mod compiler_test;

mod call;
mod disassemble;
mod expr;
mod fn_compile;
mod pattern;
mod stmt;

pub use disassemble::disassemble;

use std::sync::Arc;

use lattice_core::{Block, Expr, FnDecl, Item, Line, Program, Stmt};
use thiserror::Error;

use crate::bytecode::{
    encode_abc, encode_abx, encode_asbx, encode_sbx24, op, Chunk, ChunkRef, REGS_MAX,
};
use crate::value::Value;

/// Compilation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// Expression needs more than 256 registers.
    #[error("line {line}: expression too complex (register overflow)")]
    TooManyRegisters {
        /// Source line.
        line: Line,
    },
    /// Constant pool overflow.
    #[error("line {line}: too many constants in one chunk")]
    TooManyConstants {
        /// Source line.
        line: Line,
    },
    /// More than 255 upvalues captured by one function.
    #[error("line {line}: too many captured variables")]
    TooManyUpvalues {
        /// Source line.
        line: Line,
    },
    /// More than 255 parameters.
    #[error("line {line}: too many parameters")]
    TooManyParams {
        /// Source line.
        line: Line,
    },
    /// Jump distance exceeds the offset encoding.
    #[error("line {line}: jump too far")]
    JumpTooFar {
        /// Source line.
        line: Line,
    },
    /// `break` outside a loop.
    #[error("line {line}: 'break' outside of a loop")]
    BreakOutsideLoop {
        /// Source line.
        line: Line,
    },
    /// `continue` outside a loop.
    #[error("line {line}: 'continue' outside of a loop")]
    ContinueOutsideLoop {
        /// Source line.
        line: Line,
    },
    /// Malformed special form.
    #[error("line {line}: {message}")]
    InvalidForm {
        /// What went wrong.
        message: String,
        /// Source line.
        line: Line,
    },
}

impl CompileError {
    fn invalid(message: impl Into<String>, line: Line) -> Self {
        Self::InvalidForm {
            message: message.into(),
            line,
        }
    }
}

/// A local variable in the current function.
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: u16,
    reg: u8,
    captured: bool,
}

/// An upvalue descriptor: where the capture comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalDesc {
    index: u8,
    is_local: bool,
}

/// Per-loop compile state.
#[derive(Debug, Default)]
struct LoopCtx {
    start: usize,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    is_for: bool,
    scope_depth: u16,
}

/// Per-function compile state.
struct FuncState {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalDesc>,
    scope_depth: u16,
    next_reg: u8,
    loops: Vec<LoopCtx>,
    ensures: Vec<Expr>,
    return_type: Option<String>,
    has_defers: bool,
    /// Upvalue resolution does not ascend past a boundary function
    /// (spawn/select sub-chunks resolve free names as globals).
    boundary: bool,
}

impl FuncState {
    fn new(name: Option<String>, boundary: bool) -> Self {
        let mut state = Self {
            chunk: Chunk::new(name),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            next_reg: 0,
            loops: Vec::new(),
            ensures: Vec::new(),
            return_type: None,
            has_defers: false,
            boundary,
        };
        // Slot 0 is reserved for the function value itself.
        state.locals.push(Local {
            name: String::new(),
            depth: 0,
            reg: 0,
            captured: false,
        });
        state.next_reg = 1;
        state.chunk.max_reg = 1;
        state
    }
}

/// The register compiler.
pub struct Compiler {
    states: Vec<FuncState>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// Create a compiler for one program.
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: vec![FuncState::new(None, true)],
        }
    }

    /// Compile a program into the top-level script chunk.
    ///
    /// # Errors
    ///
    /// Returns an error when lowering fails.
    pub fn compile(mut self, program: &Program) -> Result<ChunkRef, CompileError> {
        let result = self.alloc_reg(0)?;

        let mut last_line = 1;
        if program.items.is_empty() {
            self.emit(encode_abc(op::LOADUNIT, result, 0, 0), last_line);
        }
        for (i, item) in program.items.iter().enumerate() {
            let is_last = i + 1 == program.items.len();
            self.compile_item(item, is_last.then_some(result))?;
            last_line = item_line(item);
        }

        // HALT's A names the register holding the script result.
        self.emit(encode_abc(op::HALT, result, 0, 0), last_line);
        let state = self.states.pop().expect("top-level state");
        Ok(Arc::new(state.chunk))
    }

    fn compile_item(&mut self, item: &Item, dst: Option<u8>) -> Result<(), CompileError> {
        match item {
            Item::Stmt(stmt) => return self.compile_stmt(stmt, dst),
            Item::Fn(decl) => self.compile_fn_decl(decl)?,
            Item::Struct(decl) => self.compile_struct_decl(decl)?,
            Item::Enum(decl) => self.compile_enum_decl(decl)?,
            Item::Impl(block) => {
                for method in &block.methods {
                    let global = format!("{}::{}", block.type_name, method.name);
                    self.compile_named_fn(&global, method)?;
                }
            }
            Item::Trait(decl) => {
                // The core records the method-name contract only.
                let meta = Value::array(decl.methods.iter().map(|m| Value::str(m)).collect());
                let temp = self.alloc_reg(decl.line)?;
                self.emit_load_constant(meta, temp, decl.line)?;
                self.emit_define_global(&format!("__trait_{}", decl.name), temp, decl.line)?;
                self.free_reg(temp);
            }
            Item::Test(decl) => {
                // Tests compile to globals the host harness can run.
                let func = lattice_core::FnExpr {
                    name: Some(decl.name.clone()),
                    params: Vec::new(),
                    variadic: None,
                    body: decl.body.clone(),
                    return_type: None,
                    ensures: Vec::new(),
                    line: decl.line,
                };
                let temp = self.alloc_reg(decl.line)?;
                self.compile_closure(&func, temp)?;
                self.emit_define_global(&format!("__test_{}", decl.name), temp, decl.line)?;
                self.free_reg(temp);
            }
            Item::Export(names) => {
                let state = self.cur();
                state.chunk.has_exports = true;
                state.chunk.export_names.extend(names.iter().cloned());
            }
        }
        // Declarations produce Unit when they sit in value position.
        if let Some(dst) = dst {
            self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), item_line(item));
        }
        Ok(())
    }

    fn compile_fn_decl(&mut self, decl: &FnDecl) -> Result<(), CompileError> {
        self.compile_named_fn(&decl.name, decl)
    }

    fn compile_named_fn(&mut self, global: &str, decl: &FnDecl) -> Result<(), CompileError> {
        let temp = self.alloc_reg(decl.line)?;
        self.compile_closure(&decl.func, temp)?;
        self.emit_define_global(global, temp, decl.line)?;
        self.free_reg(temp);
        Ok(())
    }

    fn compile_struct_decl(
        &mut self,
        decl: &lattice_core::StructDecl,
    ) -> Result<(), CompileError> {
        // Register declaration-order metadata for NEWSTRUCT: an array of
        // (field name, phase name) tuples under __struct_<name>.
        let meta = Value::array(
            decl.fields
                .iter()
                .map(|f| Value::tuple(vec![Value::str(&f.name), Value::str(f.phase.name())]))
                .collect(),
        );
        let temp = self.alloc_reg(decl.line)?;
        self.emit_load_constant(meta, temp, decl.line)?;
        self.emit_define_global(&format!("__struct_{}", decl.name), temp, decl.line)?;
        self.free_reg(temp);
        Ok(())
    }

    fn compile_enum_decl(&mut self, decl: &lattice_core::EnumDecl) -> Result<(), CompileError> {
        let meta = Value::array(
            decl.variants
                .iter()
                .map(|v| {
                    Value::tuple(vec![Value::str(&v.name), Value::int(i64::from(v.arity))])
                })
                .collect(),
        );
        let temp = self.alloc_reg(decl.line)?;
        self.emit_load_constant(meta, temp, decl.line)?;
        self.emit_define_global(&format!("__enum_{}", decl.name), temp, decl.line)?;
        self.free_reg(temp);
        Ok(())
    }

    // --- Function-state access ---

    fn cur(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("active function state")
    }

    fn cur_ref(&self) -> &FuncState {
        self.states.last().expect("active function state")
    }

    // --- Register allocation (stack discipline) ---

    fn alloc_reg(&mut self, line: Line) -> Result<u8, CompileError> {
        let state = self.cur();
        if state.next_reg as usize >= REGS_MAX {
            return Err(CompileError::TooManyRegisters { line });
        }
        let reg = state.next_reg;
        state.next_reg += 1;
        if state.next_reg > state.chunk.max_reg {
            state.chunk.max_reg = state.next_reg;
        }
        Ok(reg)
    }

    fn free_reg(&mut self, reg: u8) {
        let state = self.cur();
        debug_assert_eq!(reg + 1, state.next_reg, "free_reg must release the top");
        state.next_reg = reg;
    }

    fn free_regs_to(&mut self, target: u8) {
        let state = self.cur();
        debug_assert!(target <= state.next_reg);
        state.next_reg = target;
    }

    // --- Emission helpers ---

    fn emit(&mut self, instr: u32, line: Line) {
        self.cur().chunk.emit(instr, line);
    }

    fn add_constant(&mut self, value: Value, line: Line) -> Result<u16, CompileError> {
        self.cur()
            .chunk
            .add_constant(value)
            .ok_or(CompileError::TooManyConstants { line })
    }

    fn emit_load_constant(&mut self, value: Value, dst: u8, line: Line) -> Result<(), CompileError> {
        let idx = self.add_constant(value, line)?;
        self.emit(encode_abx(op::LOADK, dst, idx), line);
        Ok(())
    }

    /// Load an integer, preferring the inline immediate form.
    fn emit_load_int(&mut self, n: i64, dst: u8, line: Line) -> Result<(), CompileError> {
        if let Ok(small) = i16::try_from(n) {
            self.emit(encode_asbx(op::LOADI, dst, small), line);
            Ok(())
        } else {
            self.emit_load_constant(Value::int(n), dst, line)
        }
    }

    fn emit_define_global(&mut self, name: &str, src: u8, line: Line) -> Result<(), CompileError> {
        let idx = self.add_constant(Value::str(name), line)?;
        self.emit(encode_abx(op::DEFINEGLOBAL, src, idx), line);
        Ok(())
    }

    /// Emit a forward jump with a placeholder offset; returns the slot to
    /// patch.
    fn emit_jump(&mut self, opcode: u8, a: u8, line: Line) -> usize {
        let at = self.cur_ref().chunk.code_len();
        if opcode == op::JMP {
            self.emit(encode_sbx24(opcode, 0), line);
        } else {
            self.emit(encode_asbx(opcode, a, 0), line);
        }
        at
    }

    /// Patch a forward jump to land on the next emitted instruction.
    fn patch_jump(&mut self, at: usize, line: Line) -> Result<(), CompileError> {
        let target = self.cur_ref().chunk.code_len();
        let offset = target as i64 - at as i64 - 1;
        let instr = self.cur_ref().chunk.code[at];
        let opcode = crate::bytecode::decode_opcode(instr);
        let patched = if opcode == op::JMP {
            if !(-8_388_608..=8_388_607).contains(&offset) {
                return Err(CompileError::JumpTooFar { line });
            }
            #[expect(clippy::cast_possible_truncation, reason = "range checked above")]
            encode_sbx24(opcode, offset as i32)
        } else {
            let Ok(short) = i16::try_from(offset) else {
                return Err(CompileError::JumpTooFar { line });
            };
            encode_asbx(opcode, crate::bytecode::decode_a(instr), short)
        };
        self.cur().chunk.code[at] = patched;
        Ok(())
    }

    /// Emit a backward jump to `target` (an existing instruction index).
    fn emit_loop_jump(&mut self, target: usize, line: Line) -> Result<(), CompileError> {
        let here = self.cur_ref().chunk.code_len();
        let offset = target as i64 - here as i64 - 1;
        let Ok(offset) = i32::try_from(offset) else {
            return Err(CompileError::JumpTooFar { line });
        };
        self.emit(encode_sbx24(op::JMP, offset), line);
        Ok(())
    }

    // --- Scope handling ---

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Close a scope: run block-scoped defers, close captured locals,
    /// release their registers.
    fn end_scope(&mut self, line: Line) {
        let depth = self.cur_ref().scope_depth;
        if self.cur_ref().has_defers {
            #[expect(clippy::cast_possible_truncation, reason = "scope depth fits u8")]
            self.emit(encode_abc(op::DEFER_RUN, depth as u8, 0, 0), line);
        }
        let state = self.cur();
        state.scope_depth -= 1;
        let new_depth = state.scope_depth;

        let mut lowest_reg = state.next_reg;
        let mut close_from: Option<u8> = None;
        while let Some(local) = state.locals.last() {
            if local.depth <= new_depth {
                break;
            }
            if local.captured {
                close_from = Some(local.reg);
            }
            lowest_reg = lowest_reg.min(local.reg);
            state.locals.pop();
        }
        if let Some(reg) = close_from {
            self.emit(encode_abc(op::CLOSEUPVALUE, reg, 0, 0), line);
        }
        self.free_regs_to(lowest_reg);
    }

    // --- Local and upvalue resolution ---

    /// Declare a local in the current scope bound to `reg`.
    fn declare_local(&mut self, name: &str, reg: u8) {
        let depth = self.cur_ref().scope_depth;
        self.cur().chunk.set_local_name(reg, name);
        self.cur().locals.push(Local {
            name: name.to_string(),
            depth,
            reg,
            captured: false,
        });
    }

    /// Find a local of the function at `state_idx` by name (innermost wins).
    fn find_local(&self, state_idx: usize, name: &str) -> Option<usize> {
        self.states[state_idx]
            .locals
            .iter()
            .rposition(|l| l.name == name && !l.name.is_empty())
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        let idx = self.states.len() - 1;
        self.find_local(idx, name)
            .map(|i| self.states[idx].locals[i].reg)
    }

    /// Resolve a name as an upvalue of the function at `state_idx`,
    /// threading captures through every intermediate function.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if state_idx == 0 || self.states[state_idx].boundary {
            return Ok(None);
        }
        let parent = state_idx - 1;

        if let Some(local_idx) = self.find_local(parent, name) {
            self.states[parent].locals[local_idx].captured = true;
            let reg = self.states[parent].locals[local_idx].reg;
            return self.add_upvalue(state_idx, reg, true).map(Some);
        }

        if let Some(parent_up) = self.resolve_upvalue(parent, name)? {
            return self.add_upvalue(state_idx, parent_up, false).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> Result<u8, CompileError> {
        let desc = UpvalDesc { index, is_local };
        let state = &mut self.states[state_idx];
        if let Some(existing) = state.upvalues.iter().position(|u| *u == desc) {
            #[expect(clippy::cast_possible_truncation, reason = "capped at 255 below")]
            return Ok(existing as u8);
        }
        if state.upvalues.len() >= 255 {
            return Err(CompileError::TooManyUpvalues { line: 0 });
        }
        state.upvalues.push(desc);
        #[expect(clippy::cast_possible_truncation, reason = "capped at 255 above")]
        Ok((state.upvalues.len() - 1) as u8)
    }

    /// Where a name resolves in the current function, in resolution order:
    /// local, upvalue, global.
    fn resolve_name(&mut self, name: &str) -> Result<NameLoc, CompileError> {
        if let Some(reg) = self.resolve_local(name) {
            return Ok(NameLoc::Local(reg));
        }
        let idx = self.states.len() - 1;
        if let Some(up) = self.resolve_upvalue(idx, name)? {
            return Ok(NameLoc::Upvalue(up));
        }
        Ok(NameLoc::Global)
    }

    // --- Blocks ---

    /// Compile a block producing its value into `dst`.
    fn compile_block(&mut self, block: &Block, dst: u8) -> Result<(), CompileError> {
        self.begin_scope();
        let count = block.stmts.len();
        if count == 0 {
            self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), block.line);
        }
        for (i, stmt) in block.stmts.iter().enumerate() {
            let is_last = i + 1 == count;
            self.compile_stmt(stmt, is_last.then_some(dst))?;
        }
        let line = block.stmts.last().map_or(block.line, Stmt::line);
        self.end_scope(line);
        Ok(())
    }

    /// Compile a block for effect only (loop bodies).
    fn compile_block_stmts(&mut self, block: &Block) -> Result<(), CompileError> {
        self.begin_scope();
        for stmt in &block.stmts {
            self.compile_stmt(stmt, None)?;
        }
        let line = block.stmts.last().map_or(block.line, Stmt::line);
        self.end_scope(line);
        Ok(())
    }
}

/// Resolution of a name in the current function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameLoc {
    /// A local register.
    Local(u8),
    /// An upvalue slot.
    Upvalue(u8),
    /// Falls through to the global environment.
    Global,
}

fn item_line(item: &Item) -> Line {
    match item {
        Item::Stmt(stmt) => stmt.line(),
        Item::Fn(decl) => decl.line,
        Item::Struct(decl) => decl.line,
        Item::Enum(decl) => decl.line,
        Item::Impl(block) => block.line,
        Item::Trait(decl) => decl.line,
        Item::Test(decl) => decl.line,
        Item::Export(_) => 1,
    }
}

/// Convenience function: compile a program to its top-level chunk.
///
/// # Errors
///
/// Returns an error when lowering fails.
pub fn compile(program: &Program) -> Result<ChunkRef, CompileError> {
    Compiler::new().compile(program)
}
